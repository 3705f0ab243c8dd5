//! Error types shared by the request path, the apply path and the tiers.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::raft::ConsensusError;
use crate::store::TierError;

pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced to callers of the service.
#[derive(Debug, Error)]
pub enum Error {
    /// This node is not the leader; the request must be re-issued at `leader_addr`.
    #[error("the leader is at: {leader_addr}")]
    Redirect { leader_addr: String },

    #[error("no leader is known, an election may be in progress")]
    NoLeader,

    #[error("timed out waiting for the command to be applied")]
    Timeout,

    #[error("consensus error: {0}")]
    Consensus(#[from] ConsensusError),

    #[error("student {0} already exists")]
    AlreadyExists(String),

    #[error("student {0} does not exist")]
    NotFound(String),

    #[error("student {0} has been deleted")]
    Deleted(String),

    #[error("invalid request: {0}")]
    Invalid(String),

    #[error("storage tier error: {0}")]
    Tier(String),

    /// The local state can no longer be trusted; the node refuses service.
    #[error("node unavailable: {0}")]
    Unavailable(String),

    #[error("codec error: {0}")]
    Codec(String),
}

impl Error {
    /// Transient failures: nothing is known to have been applied, the whole
    /// request may be retried.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::NoLeader | Error::Timeout | Error::Consensus(_)
        )
    }

    /// Deterministic outcomes of applying a command.
    pub fn is_domain(&self) -> bool {
        matches!(
            self,
            Error::AlreadyExists(_)
                | Error::NotFound(_)
                | Error::Deleted(_)
                | Error::Invalid(_)
                | Error::Tier(_)
        )
    }
}

impl From<bincode::Error> for Error {
    fn from(e: bincode::Error) -> Self {
        Error::Codec(e.to_string())
    }
}

impl From<TierError> for Error {
    fn from(e: TierError) -> Self {
        Error::Tier(e.to_string())
    }
}

/// Business outcome of applying one command.
///
/// Travels from the state machine through the correlation registry to the
/// caller, so it has to be cheap to clone and carry its own text.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ApplyError {
    #[error("student {0} already exists")]
    AlreadyExists(String),

    #[error("student {0} does not exist")]
    NotFound(String),

    #[error("student {0} has been deleted")]
    Deleted(String),

    #[error("invalid command: {0}")]
    Invalid(String),

    #[error("storage tier error: {0}")]
    Tier(String),
}

impl From<TierError> for ApplyError {
    fn from(e: TierError) -> Self {
        ApplyError::Tier(e.to_string())
    }
}

impl From<ApplyError> for Error {
    fn from(e: ApplyError) -> Self {
        match e {
            ApplyError::AlreadyExists(id) => Error::AlreadyExists(id),
            ApplyError::NotFound(id) => Error::NotFound(id),
            ApplyError::Deleted(id) => Error::Deleted(id),
            ApplyError::Invalid(reason) => Error::Invalid(reason),
            ApplyError::Tier(reason) => Error::Tier(reason),
        }
    }
}
