#![allow(clippy::field_reassign_with_default)]

use tokio::sync::oneshot::{self, Receiver, Sender};

use raft::prelude::*;

use super::{ConsensusError, Member};

pub type ProposalResult = Result<(), ConsensusError>;

pub enum ProposalKind {
    Normal(Vec<u8>),
    /// Membership change; its context carries the member table that results from it.
    ConfChange(ConfChange),
}

pub struct Proposal {
    pub kind: ProposalKind,
    // If it's proposed, it will be set to the index and term of the entry.
    pub proposed: u64,
    pub term: u64,
    done: Option<Sender<ProposalResult>>,
}

impl Proposal {
    fn new(kind: ProposalKind) -> (Self, Receiver<ProposalResult>) {
        let (tx, rx) = oneshot::channel();
        let proposal = Proposal {
            kind,
            proposed: 0,
            term: 0,
            done: Some(tx),
        };
        (proposal, rx)
    }

    pub fn normal(data: Vec<u8>) -> (Self, Receiver<ProposalResult>) {
        Self::new(ProposalKind::Normal(data))
    }

    pub fn conf_change(
        change_type: ConfChangeType,
        node_id: u64,
        members: &[Member],
    ) -> Result<(Self, Receiver<ProposalResult>), ConsensusError> {
        let context =
            bincode::serialize(members).map_err(|e| ConsensusError::Membership(e.to_string()))?;
        let mut cc = ConfChange::default();
        cc.node_id = node_id;
        cc.set_change_type(change_type);
        cc.context = context.into();
        Ok(Self::new(ProposalKind::ConfChange(cc)))
    }

    pub fn is_conf_change(&self) -> bool {
        matches!(self.kind, ProposalKind::ConfChange(_))
    }

    /// Reports the outcome to the submitter; later calls are ignored.
    pub fn finish(&mut self, result: ProposalResult) {
        if let Some(tx) = self.done.take() {
            // The submitter may have stopped waiting.
            let _ = tx.send(result);
        }
    }
}
