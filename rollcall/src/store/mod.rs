//! Tiered entity store.
//!
//! * L0: the replicated in-process index, mutated only by the state machine.
//! * L1: a shared cache with per-entry TTL ([`EntityCache`]).
//! * L2: the durable store ([`DurableStore`]), source of truth for records
//!   that never went through the replicated log.
//!
//! L1 and L2 are shared by every node and guard themselves; only L0 is locked
//! here. Apply never reads L1/L2: the submitting node captures what they hold
//! in a [`TierView`] that travels with the command.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use crate::entity::Entity;
use crate::error::{ApplyError, Error};

pub mod memory;
pub mod mysql;
pub mod redis;

#[derive(Debug, Clone, Error)]
pub enum TierError {
    #[error("cache: {0}")]
    Cache(String),

    #[error("durable store: {0}")]
    Durable(String),

    #[error("tier call timed out after {0:?}")]
    Timeout(Duration),
}

impl TierError {
    /// A durable write addressed a row that does not exist.
    pub fn missing_row(id: &str) -> Self {
        TierError::Durable(format!("no row with id {}", id))
    }
}

#[async_trait]
pub trait EntityCache: Send + Sync {
    async fn get(&self, id: &str) -> Result<Option<Entity>, TierError>;

    async fn set(&self, entity: &Entity, ttl: Duration) -> Result<(), TierError>;

    async fn delete(&self, id: &str) -> Result<(), TierError>;
}

#[async_trait]
pub trait DurableStore: Send + Sync {
    async fn find_by_id(&self, id: &str) -> Result<Option<Entity>, TierError>;

    /// Overwrites the row stored under `id` with `entity`, which may carry a new id.
    async fn update_fields(&self, id: &str, entity: &Entity) -> Result<(), TierError>;

    async fn soft_delete(&self, id: &str) -> Result<(), TierError>;

    /// Up to `limit` live records, used to warm the cache.
    async fn list(&self, limit: usize) -> Result<Vec<Entity>, TierError>;
}

/// L0: ordered records plus an id -> slot index.
///
/// Every key of `positions` names a slot whose entity carries that id.
/// Tombstoned records keep their slot and their key.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct EntityIndex {
    entities: Vec<Entity>,
    positions: HashMap<String, usize>,
}

impl EntityIndex {
    pub fn new() -> Self {
        Self::default()
    }

    /// Rebuilds the index from scratch over `entities`.
    pub fn from_entities(entities: Vec<Entity>) -> Self {
        let positions = entities
            .iter()
            .enumerate()
            .map(|(slot, e)| (e.id.clone(), slot))
            .collect();
        EntityIndex {
            entities,
            positions,
        }
    }

    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.positions.get(id).map(|&slot| &self.entities[slot])
    }

    pub fn contains(&self, id: &str) -> bool {
        self.positions.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    pub fn entities(&self) -> &[Entity] {
        &self.entities
    }

    pub fn positions(&self) -> &HashMap<String, usize> {
        &self.positions
    }

    pub fn insert(&mut self, entity: Entity) {
        self.positions.insert(entity.id.clone(), self.entities.len());
        self.entities.push(entity);
    }

    /// Replaces the record stored under `id`, re-keying the index if the id changes.
    pub fn replace(&mut self, id: &str, entity: Entity) -> bool {
        let Some(slot) = self.positions.get(id).copied() else {
            return false;
        };
        if entity.id != id {
            self.positions.remove(id);
            self.positions.insert(entity.id.clone(), slot);
        }
        self.entities[slot] = entity;
        true
    }

    pub fn tombstone(&mut self, id: &str) -> bool {
        match self.positions.get(id) {
            Some(&slot) => {
                self.entities[slot].deleted = true;
                true
            }
            None => false,
        }
    }
}

/// L1/L2 records found for the ids a command touches, as the submitting node
/// saw them. An id with no entry was absent from the tiers or held in L0.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TierView {
    records: BTreeMap<String, Entity>,
}

impl TierView {
    pub fn get(&self, id: &str) -> Option<&Entity> {
        self.records.get(id)
    }

    pub fn insert(&mut self, id: impl Into<String>, entity: Entity) {
        self.records.insert(id.into(), entity);
    }
}

/// Existence-check mode, used before inserting `id`: L0 first, then the tiers
/// as recorded in `view`.
///
/// Tombstones are permanent: a deleted id can never be created again.
pub fn check_absent(index: &EntityIndex, view: &TierView, id: &str) -> Result<(), ApplyError> {
    match index.get(id).or_else(|| view.get(id)) {
        Some(entity) if entity.deleted => Err(ApplyError::Deleted(id.to_string())),
        Some(_) => Err(ApplyError::AlreadyExists(id.to_string())),
        None => Ok(()),
    }
}

/// A write-through to L1/L2 for a record that is not in L0.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LegacyWrite {
    Update { id: String, merged: Entity },
    Delete { id: String },
}

impl LegacyWrite {
    pub fn target(&self) -> &str {
        match self {
            LegacyWrite::Update { id, .. } | LegacyWrite::Delete { id } => id,
        }
    }
}

pub struct TieredStore {
    l0: RwLock<EntityIndex>,
    cache: Arc<dyn EntityCache>,
    durable: Arc<dyn DurableStore>,
    cache_ttl: Duration,
    tier_timeout: Duration,
}

impl TieredStore {
    pub fn new(
        cache: Arc<dyn EntityCache>,
        durable: Arc<dyn DurableStore>,
        cache_ttl: Duration,
        tier_timeout: Duration,
    ) -> Self {
        TieredStore {
            l0: RwLock::new(EntityIndex::new()),
            cache,
            durable,
            cache_ttl,
            tier_timeout,
        }
    }

    pub async fn read(&self) -> RwLockReadGuard<'_, EntityIndex> {
        self.l0.read().await
    }

    pub async fn write(&self) -> RwLockWriteGuard<'_, EntityIndex> {
        self.l0.write().await
    }

    async fn bounded<T, F>(&self, call: F) -> Result<T, TierError>
    where
        F: Future<Output = Result<T, TierError>>,
    {
        tokio::time::timeout(self.tier_timeout, call)
            .await
            .map_err(|_| TierError::Timeout(self.tier_timeout))?
    }

    /// Fetch mode: L0, then L1, then L2 with write-through into L1.
    pub async fn get(&self, id: &str) -> Result<Entity, Error> {
        let l0_hit = self.l0.read().await.get(id).cloned();
        let found = match l0_hit {
            Some(entity) => Some(entity),
            None => self.lookup_tiers(id).await?,
        };
        match found {
            Some(entity) if entity.deleted => Err(Error::Deleted(id.to_string())),
            Some(entity) => Ok(entity),
            None => Err(Error::NotFound(id.to_string())),
        }
    }

    /// L1 then L2. A live L2 hit is written through to L1; tombstones never are.
    pub async fn lookup_tiers(&self, id: &str) -> Result<Option<Entity>, TierError> {
        if let Some(entity) = self.bounded(self.cache.get(id)).await? {
            return Ok(Some(entity));
        }
        let found = self.bounded(self.durable.find_by_id(id)).await?;
        if let Some(entity) = &found {
            if !entity.deleted {
                if let Err(e) = self.bounded(self.cache.set(entity, self.cache_ttl)).await {
                    log::warn!("failed to cache student {}: {}", id, e);
                }
            }
        }
        Ok(found)
    }

    /// Captures what L1/L2 hold for every id of `ids` missing from L0.
    pub async fn tier_view(&self, ids: &[&str]) -> Result<TierView, TierError> {
        let missing: Vec<&str> = {
            let index = self.l0.read().await;
            ids.iter().copied().filter(|id| !index.contains(id)).collect()
        };
        let mut view = TierView::default();
        for id in missing {
            if let Some(entity) = self.lookup_tiers(id).await? {
                view.insert(id, entity);
            }
        }
        Ok(view)
    }

    /// Writes an update of a record that only lives in L1/L2.
    pub async fn update_legacy(&self, id: &str, merged: &Entity) -> Result<(), TierError> {
        self.bounded(self.durable.update_fields(id, merged)).await?;
        if merged.id != id {
            self.bounded(self.cache.delete(id)).await?;
        }
        self.bounded(self.cache.set(merged, self.cache_ttl)).await
    }

    /// Tombstones a record that only lives in L1/L2.
    pub async fn delete_legacy(&self, id: &str) -> Result<(), TierError> {
        self.bounded(self.durable.soft_delete(id)).await?;
        self.bounded(self.cache.delete(id)).await
    }

    pub async fn write_legacy(&self, write: &LegacyWrite) -> Result<(), TierError> {
        match write {
            LegacyWrite::Update { id, merged } => self.update_legacy(id, merged).await,
            LegacyWrite::Delete { id } => self.delete_legacy(id).await,
        }
    }

    /// Copies up to `limit` live L2 records into L1.
    pub async fn preload(&self, limit: usize) -> Result<usize, TierError> {
        let records = self.bounded(self.durable.list(limit)).await?;
        let mut loaded = 0;
        for entity in records.iter().filter(|e| !e.deleted) {
            self.bounded(self.cache.set(entity, self.cache_ttl)).await?;
            log::debug!("preloaded student {} into cache", entity.id);
            loaded += 1;
        }
        Ok(loaded)
    }
}
