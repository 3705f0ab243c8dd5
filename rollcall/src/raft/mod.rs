//! Consensus engine contract and the raft-rs backed implementation.
//!
//! The rest of the crate only sees [`ConsensusEngine`] (submit, leadership,
//! membership) and implements [`StateMachine`] (apply, snapshot, restore).

use std::io::{Read, Write};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::oneshot;

pub mod node;
pub mod proposal;
mod storage;

pub use node::{RaftHandle, RaftNode};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConsensusError {
    #[error("this node is not the leader")]
    NotLeader,

    #[error("the proposal was dropped by the consensus engine")]
    Dropped,

    #[error("timed out waiting for the entry to commit")]
    CommitTimeout,

    #[error("the consensus engine has stopped")]
    Stopped,

    #[error("membership change rejected: {0}")]
    Membership(String),

    #[error("no consensus transport reaches {0}")]
    Unreachable(String),

    #[error("raft storage error: {0}")]
    Storage(String),
}

/// One member of the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Member {
    /// Node identifier, `name:host:port` where host and port are the node's
    /// externally reachable API address.
    pub id: String,
    /// Address the consensus protocol reaches the node at.
    pub address: String,
    pub voter: bool,
}

impl Member {
    pub fn voter(id: impl Into<String>, address: impl Into<String>) -> Self {
        Member {
            id: id.into(),
            address: address.into(),
            voter: true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Leadership {
    pub is_leader: bool,
    /// Current leader, if one is known.
    pub leader: Option<Member>,
}

/// Completion of one submitted entry.
///
/// Resolves once the entry has been committed and applied on this node.
pub struct Commit {
    rx: oneshot::Receiver<Result<(), ConsensusError>>,
}

impl Commit {
    pub fn new(rx: oneshot::Receiver<Result<(), ConsensusError>>) -> Self {
        Commit { rx }
    }

    /// A commit that has already succeeded.
    pub fn committed() -> Self {
        Self::finished(Ok(()))
    }

    pub fn failed(err: ConsensusError) -> Self {
        Self::finished(Err(err))
    }

    fn finished(result: Result<(), ConsensusError>) -> Self {
        let (tx, rx) = oneshot::channel();
        let _ = tx.send(result);
        Commit { rx }
    }

    pub async fn wait(self, timeout: Duration) -> Result<(), ConsensusError> {
        match tokio::time::timeout(timeout, self.rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConsensusError::Dropped),
            Err(_) => Err(ConsensusError::CommitTimeout),
        }
    }
}

/// Ordered, replicated commit of opaque commands plus leadership and
/// membership queries.
#[async_trait]
pub trait ConsensusEngine: Send + Sync {
    /// Hands `command` to the log. Fails at once if this node cannot propose.
    async fn submit(&self, command: Vec<u8>) -> Result<Commit, ConsensusError>;

    fn leader(&self) -> Leadership;

    async fn add_voter(&self, member: Member) -> Result<(), ConsensusError>;

    async fn remove_server(&self, id: &str) -> Result<(), ConsensusError>;

    async fn configuration(&self) -> Result<Vec<Member>, ConsensusError>;

    /// Whether the consensus transport delivers messages to `address`.
    fn reaches(&self, address: &str) -> bool;
}

/// Point-in-time copy of the state machine.
pub trait StateSnapshot: Send {
    fn persist(&self, sink: &mut dyn Write) -> anyhow::Result<()>;

    fn release(self: Box<Self>) {}
}

/// Callbacks the engine drives, one at a time, in commit order.
#[async_trait]
pub trait StateMachine: Send + Sync {
    async fn apply(&self, index: u64, data: &[u8]);

    async fn snapshot(&self) -> Box<dyn StateSnapshot>;

    /// Replaces the whole state. An error leaves the state untrustworthy.
    async fn restore(&self, reader: &mut (dyn Read + Send)) -> anyhow::Result<()>;
}
