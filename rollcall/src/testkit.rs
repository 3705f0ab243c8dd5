//! Scripted consensus engine for tests.
//!
//! Every node of a [`ScriptedCluster`] shares one apply stream: a committed
//! command is applied to every registered replica, in submission order, before
//! `submit` returns. Leadership is set by hand, and every address is reachable
//! until severed.

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use tokio::sync::oneshot;

use crate::raft::{Commit, ConsensusEngine, ConsensusError, Leadership, Member, StateMachine};

#[derive(Default)]
struct Shared {
    leader: Mutex<Option<String>>,
    members: Mutex<Vec<Member>>,
    replicas: Mutex<Vec<Arc<dyn StateMachine>>>,
    /// Last applied index; held across a whole apply round.
    applied: tokio::sync::Mutex<u64>,
    stalled: AtomicBool,
    parked: Mutex<Vec<oneshot::Sender<Result<(), ConsensusError>>>>,
    calls: Mutex<Vec<String>>,
    severed: Mutex<HashSet<String>>,
}

#[derive(Default)]
pub struct ScriptedCluster {
    shared: Arc<Shared>,
}

impl ScriptedCluster {
    pub fn new() -> Self {
        Self::default()
    }

    /// Adds a voting member and returns its engine.
    pub fn node(&self, id: &str) -> Arc<ScriptedEngine> {
        let name = id.split(':').next().unwrap_or(id);
        self.shared
            .members
            .lock()
            .unwrap()
            .push(Member::voter(id, format!("{}-raft", name)));
        Arc::new(ScriptedEngine {
            shared: self.shared.clone(),
            id: id.to_string(),
        })
    }

    pub fn elect(&self, id: &str) {
        *self.shared.leader.lock().unwrap() = Some(id.to_string());
    }

    pub fn depose(&self) {
        *self.shared.leader.lock().unwrap() = None;
    }

    pub fn add_replica(&self, state_machine: Arc<dyn StateMachine>) {
        self.shared.replicas.lock().unwrap().push(state_machine);
    }

    /// While stalled, submissions are accepted but never commit.
    pub fn stall(&self, stalled: bool) {
        self.shared.stalled.store(stalled, Ordering::SeqCst);
    }

    /// The transport stops reaching `address`.
    pub fn sever(&self, address: &str) {
        self.shared.severed.lock().unwrap().insert(address.to_string());
    }

    pub fn membership_calls(&self) -> Vec<String> {
        self.shared.calls.lock().unwrap().clone()
    }
}

pub struct ScriptedEngine {
    shared: Arc<Shared>,
    id: String,
}

impl ScriptedEngine {
    fn require_leader(&self) -> Result<(), ConsensusError> {
        if self.leader().is_leader {
            Ok(())
        } else {
            Err(ConsensusError::NotLeader)
        }
    }
}

#[async_trait]
impl ConsensusEngine for ScriptedEngine {
    async fn submit(&self, command: Vec<u8>) -> Result<Commit, ConsensusError> {
        self.require_leader()?;
        if self.shared.stalled.load(Ordering::SeqCst) {
            let (tx, rx) = oneshot::channel();
            self.shared.parked.lock().unwrap().push(tx);
            return Ok(Commit::new(rx));
        }

        let mut applied = self.shared.applied.lock().await;
        *applied += 1;
        let replicas = self.shared.replicas.lock().unwrap().clone();
        for replica in replicas {
            replica.apply(*applied, &command).await;
        }
        Ok(Commit::committed())
    }

    fn leader(&self) -> Leadership {
        let leader = self.shared.leader.lock().unwrap().clone();
        let Some(leader) = leader else {
            return Leadership::default();
        };
        let member = self
            .shared
            .members
            .lock()
            .unwrap()
            .iter()
            .find(|m| m.id == leader)
            .cloned()
            .unwrap_or_else(|| Member::voter(leader.clone(), String::new()));
        Leadership {
            is_leader: leader == self.id,
            leader: Some(member),
        }
    }

    async fn add_voter(&self, member: Member) -> Result<(), ConsensusError> {
        self.require_leader()?;
        self.shared
            .calls
            .lock()
            .unwrap()
            .push(format!("add {}", member.id));
        let mut members = self.shared.members.lock().unwrap();
        members.retain(|m| m.id != member.id);
        members.push(member);
        Ok(())
    }

    async fn remove_server(&self, id: &str) -> Result<(), ConsensusError> {
        self.require_leader()?;
        self.shared
            .calls
            .lock()
            .unwrap()
            .push(format!("remove {}", id));
        self.shared.members.lock().unwrap().retain(|m| m.id != id);
        Ok(())
    }

    async fn configuration(&self) -> Result<Vec<Member>, ConsensusError> {
        Ok(self.shared.members.lock().unwrap().clone())
    }

    fn reaches(&self, address: &str) -> bool {
        !self.shared.severed.lock().unwrap().contains(address)
    }
}
