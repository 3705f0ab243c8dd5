//! Commands carried through the replicated log.
//!
//! A log entry is a bincode encoded [`Envelope`]: the command, the id of the
//! correlation token the submitting node is waiting on, and the L1/L2 records
//! the command depends on as the submitting node read them.

use serde::{Deserialize, Serialize};

use crate::correlation::TokenId;
use crate::entity::{Entity, EntityPatch};
use crate::error::Result;
use crate::store::TierView;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Command {
    /// Insert a new student.
    Create(Entity),
    /// Merge `patch` over the student currently stored under `id`.
    Update { id: String, patch: EntityPatch },
    /// Tombstone the student stored under `id`.
    Delete { id: String },
}

impl Command {
    pub fn kind(&self) -> &'static str {
        match self {
            Command::Create(_) => "create",
            Command::Update { .. } => "update",
            Command::Delete { .. } => "delete",
        }
    }

    /// Id of the record the command targets.
    pub fn target(&self) -> &str {
        match self {
            Command::Create(entity) => &entity.id,
            Command::Update { id, .. } | Command::Delete { id } => id,
        }
    }

    /// Ids whose presence decides the outcome: the target, plus the new id of
    /// a re-keying update.
    pub fn touched_ids(&self) -> Vec<&str> {
        match self {
            Command::Update { id, patch } => {
                let mut ids = vec![id.as_str()];
                ids.extend(patch.new_id(id));
                ids
            }
            _ => vec![self.target()],
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Envelope {
    pub token: TokenId,
    pub command: Command,
    pub tiers: TierView,
}

impl Envelope {
    pub fn new(token: TokenId, command: Command) -> Self {
        Self {
            token,
            command,
            tiers: TierView::default(),
        }
    }

    pub fn with_tiers(mut self, tiers: TierView) -> Self {
        self.tiers = tiers;
        self
    }

    pub fn encode(&self) -> Result<Vec<u8>> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(data: &[u8]) -> Result<Self> {
        Ok(bincode::deserialize(data)?)
    }
}
