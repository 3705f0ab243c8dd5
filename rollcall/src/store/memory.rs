//! In-process L1/L2 tiers, used when no cache or database is configured and in tests.

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;

use super::{DurableStore, EntityCache, TierError};
use crate::entity::Entity;

fn locked<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Cache with per-entry expiry.
#[derive(Default)]
pub struct MemoryCache {
    entries: Mutex<HashMap<String, (Entity, Instant)>>,
    unavailable: AtomicBool,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every call fail, to exercise tier errors.
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Reads an unexpired entry without going through the async contract.
    pub fn peek(&self, id: &str) -> Option<Entity> {
        locked(&self.entries)
            .get(id)
            .filter(|(_, expires)| *expires > Instant::now())
            .map(|(entity, _)| entity.clone())
    }

    fn check(&self) -> Result<(), TierError> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(TierError::Cache("connection refused".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl EntityCache for MemoryCache {
    async fn get(&self, id: &str) -> Result<Option<Entity>, TierError> {
        self.check()?;
        let mut entries = locked(&self.entries);
        match entries.get(id) {
            Some((_, expires)) if *expires <= Instant::now() => {
                entries.remove(id);
                Ok(None)
            }
            Some((entity, _)) => Ok(Some(entity.clone())),
            None => Ok(None),
        }
    }

    async fn set(&self, entity: &Entity, ttl: Duration) -> Result<(), TierError> {
        self.check()?;
        locked(&self.entries).insert(entity.id.clone(), (entity.clone(), Instant::now() + ttl));
        Ok(())
    }

    async fn delete(&self, id: &str) -> Result<(), TierError> {
        self.check()?;
        locked(&self.entries).remove(id);
        Ok(())
    }
}

/// Durable store kept in a map; counts lookups so tests can tell which tier served a read.
#[derive(Default)]
pub struct MemoryStore {
    rows: Mutex<BTreeMap<String, Entity>>,
    reads: AtomicUsize,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seeds a row, as records loaded before replication existed.
    pub fn insert(&self, entity: Entity) {
        locked(&self.rows).insert(entity.id.clone(), entity);
    }

    pub fn row(&self, id: &str) -> Option<Entity> {
        locked(&self.rows).get(id).cloned()
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl DurableStore for MemoryStore {
    async fn find_by_id(&self, id: &str) -> Result<Option<Entity>, TierError> {
        self.reads.fetch_add(1, Ordering::SeqCst);
        Ok(self.row(id))
    }

    async fn update_fields(&self, id: &str, entity: &Entity) -> Result<(), TierError> {
        let mut rows = locked(&self.rows);
        if rows.remove(id).is_none() {
            return Err(TierError::missing_row(id));
        }
        rows.insert(entity.id.clone(), entity.clone());
        Ok(())
    }

    async fn soft_delete(&self, id: &str) -> Result<(), TierError> {
        match locked(&self.rows).get_mut(id) {
            Some(row) => {
                row.deleted = true;
                Ok(())
            }
            None => Err(TierError::missing_row(id)),
        }
    }

    async fn list(&self, limit: usize) -> Result<Vec<Entity>, TierError> {
        Ok(locked(&self.rows)
            .values()
            .filter(|e| !e.deleted)
            .take(limit)
            .cloned()
            .collect())
    }
}
