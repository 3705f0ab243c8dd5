//! Replicated state machine for the student roster.
//!
//! Every node applies the same committed commands in the same order, deciding
//! each one from L0 and the tier records carried in its envelope only. The node
//! that submitted a command also holds its correlation token, receives the
//! business outcome through the [`Registry`], and is the one that writes
//! through to the shared tiers for records outside L0.

use std::io::{Read, Write};
use std::sync::{Arc, Mutex, PoisonError};

use anyhow::anyhow;
use async_trait::async_trait;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};

use crate::command::{Command, Envelope};
use crate::correlation::{Outcome, Registry, TokenId};
use crate::entity::{Entity, EntityPatch};
use crate::error::{ApplyError, Error};
use crate::metrics;
use crate::raft::{StateMachine, StateSnapshot};
use crate::store::{check_absent, EntityIndex, LegacyWrite, TierView, TieredStore};

/// A tier write owed to the caller waiting on `token`.
struct LegacyJob {
    token: TokenId,
    log_index: u64,
    write: LegacyWrite,
}

pub struct RosterStateMachine {
    store: Arc<TieredStore>,
    registry: Arc<Registry>,
    legacy: UnboundedSender<LegacyJob>,
    /// Set when a restore failed; cleared by the next successful one.
    failure: Mutex<Option<String>>,
}

/// Full copy of the ordered records, tombstones included.
pub struct RosterSnapshot {
    entities: Vec<Entity>,
}

impl StateSnapshot for RosterSnapshot {
    fn persist(&self, sink: &mut dyn Write) -> anyhow::Result<()> {
        bincode::serialize_into(sink, &self.entities)?;
        Ok(())
    }

    fn release(self: Box<Self>) {
        log::debug!("released snapshot of {} students", self.entities.len());
    }
}

/// Performs tier writes one at a time, in the order they were applied.
async fn run_legacy_writes(
    store: Arc<TieredStore>,
    registry: Arc<Registry>,
    mut jobs: UnboundedReceiver<LegacyJob>,
) {
    while let Some(job) = jobs.recv().await {
        let outcome = store
            .write_legacy(&job.write)
            .await
            .map_err(ApplyError::from);
        if let Err(e) = &outcome {
            log::warn!(
                "tier write for {} at {} failed: {}",
                job.write.target(),
                job.log_index,
                e
            );
        }
        registry.resolve(job.token, outcome);
    }
}

impl RosterStateMachine {
    /// Must be called from within a tokio runtime: it spawns the tier writer.
    pub fn new(store: Arc<TieredStore>, registry: Arc<Registry>) -> Self {
        let (legacy, jobs) = mpsc::unbounded_channel();
        tokio::spawn(run_legacy_writes(store.clone(), registry.clone(), jobs));
        RosterStateMachine {
            store,
            registry,
            legacy,
            failure: Mutex::new(None),
        }
    }

    /// Fails once the local state can no longer be trusted.
    pub fn health(&self) -> Result<(), Error> {
        match &*self.failure.lock().unwrap_or_else(PoisonError::into_inner) {
            Some(reason) => Err(Error::Unavailable(reason.clone())),
            None => Ok(()),
        }
    }

    fn set_failure(&self, failure: Option<String>) {
        *self.failure.lock().unwrap_or_else(PoisonError::into_inner) = failure;
    }

    /// Runs one command against L0. A command on a record outside L0 leaves L0
    /// alone and yields the tier write it calls for.
    fn execute(index: &mut EntityIndex, envelope: &Envelope) -> Result<Option<LegacyWrite>, ApplyError> {
        let tiers = &envelope.tiers;
        match &envelope.command {
            Command::Create(entity) => Self::create(index, tiers, entity),
            Command::Update { id, patch } => Self::update(index, tiers, id, patch),
            Command::Delete { id } => Self::delete(index, tiers, id),
        }
    }

    fn create(
        index: &mut EntityIndex,
        tiers: &TierView,
        entity: &Entity,
    ) -> Result<Option<LegacyWrite>, ApplyError> {
        entity.validate().map_err(ApplyError::Invalid)?;
        check_absent(index, tiers, &entity.id)?;
        index.insert(Entity {
            deleted: false,
            ..entity.clone()
        });
        Ok(None)
    }

    fn update(
        index: &mut EntityIndex,
        tiers: &TierView,
        id: &str,
        patch: &EntityPatch,
    ) -> Result<Option<LegacyWrite>, ApplyError> {
        let in_l0 = index.get(id).cloned();
        let current = match &in_l0 {
            Some(entity) => entity,
            None => tiers
                .get(id)
                .ok_or_else(|| ApplyError::NotFound(id.to_string()))?,
        };
        if current.deleted {
            return Err(ApplyError::Deleted(id.to_string()));
        }
        if let Some(new_id) = patch.new_id(id) {
            check_absent(index, tiers, new_id)?;
        }

        let merged = current.merged(patch);
        if in_l0.is_some() {
            index.replace(id, merged);
            return Ok(None);
        }
        Ok(Some(LegacyWrite::Update {
            id: id.to_string(),
            merged,
        }))
    }

    fn delete(
        index: &mut EntityIndex,
        tiers: &TierView,
        id: &str,
    ) -> Result<Option<LegacyWrite>, ApplyError> {
        if let Some(current) = index.get(id) {
            if current.deleted {
                return Err(ApplyError::Deleted(id.to_string()));
            }
            index.tombstone(id);
            return Ok(None);
        }
        match tiers.get(id) {
            None => Err(ApplyError::NotFound(id.to_string())),
            Some(current) if current.deleted => Err(ApplyError::Deleted(id.to_string())),
            Some(_) => Ok(Some(LegacyWrite::Delete { id: id.to_string() })),
        }
    }

    /// Hands a tier write to the writer; the caller is resolved once it lands.
    fn queue_legacy(&self, token: TokenId, log_index: u64, write: LegacyWrite) {
        let job = LegacyJob {
            token,
            log_index,
            write,
        };
        if let Err(mpsc::error::SendError(job)) = self.legacy.send(job) {
            let outcome: Outcome = Err(ApplyError::Tier("tier writer stopped".to_string()));
            self.registry.resolve(job.token, outcome);
        }
    }
}

#[async_trait]
impl StateMachine for RosterStateMachine {
    async fn apply(&self, log_index: u64, data: &[u8]) {
        let envelope = match Envelope::decode(data) {
            Ok(envelope) => envelope,
            Err(e) => {
                // Skipping keeps the replica live at the cost of this one entry.
                log::error!("skipping undecodable log entry {}: {}", log_index, e);
                metrics::APPLY_COUNTER
                    .with_label_values(&["unknown", "skipped"])
                    .inc();
                return;
            }
        };

        let decided = {
            let mut index = self.store.write().await;
            Self::execute(&mut index, &envelope)
        };

        let kind = envelope.command.kind();
        match &decided {
            Ok(_) => {
                log::debug!("applied {} {} at {}", kind, envelope.command.target(), log_index);
                metrics::APPLY_COUNTER.with_label_values(&[kind, "ok"]).inc();
            }
            Err(e) => {
                log::info!("{} at {} failed: {}", kind, log_index, e);
                metrics::APPLY_COUNTER.with_label_values(&[kind, "error"]).inc();
            }
        }

        let outcome = match decided {
            Ok(Some(write)) if self.registry.is_pending(envelope.token) => {
                return self.queue_legacy(envelope.token, log_index, write);
            }
            Ok(_) => Ok(()),
            Err(e) => Err(e),
        };
        self.registry.resolve(envelope.token, outcome);
    }

    async fn snapshot(&self) -> Box<dyn StateSnapshot> {
        let index = self.store.read().await;
        Box::new(RosterSnapshot {
            entities: index.entities().to_vec(),
        })
    }

    async fn restore(&self, reader: &mut (dyn Read + Send)) -> anyhow::Result<()> {
        let entities: Vec<Entity> = match bincode::deserialize_from(reader) {
            Ok(entities) => entities,
            Err(e) => {
                let reason = format!("snapshot could not be decoded: {}", e);
                log::error!("{}, refusing service until resynced", reason);
                self.set_failure(Some(reason.clone()));
                return Err(anyhow!(reason));
            }
        };

        let mut index = self.store.write().await;
        *index = EntityIndex::from_entities(entities);
        self.set_failure(None);
        log::info!("restored {} students from snapshot", index.len());
        Ok(())
    }
}
