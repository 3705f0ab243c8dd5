//! Correlation registry.
//!
//! Matches a command applied by the state machine back to the request that
//! submitted it. Every submitted [`Envelope`](crate::command::Envelope) carries
//! the [`TokenId`] of its slot here; apply resolves the slot by that id, so the
//! match is independent of how submissions interleave.
//!
//! Slots live in independently locked shards. Finished slots are reclaimed
//! lazily: each new token sweeps one shard, round robin.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;
use tokio::time::Instant;
use uuid::Uuid;

use crate::error::{ApplyError, Error, Result};
use crate::metrics;
use crate::raft::Commit;

/// Business outcome delivered to the waiting caller.
pub type Outcome = std::result::Result<(), ApplyError>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TokenId(Uuid);

impl TokenId {
    pub fn generate() -> Self {
        TokenId(Uuid::new_v4())
    }

    fn shard_of(&self, shards: usize) -> usize {
        (self.0.as_u128() % shards as u128) as usize
    }
}

impl fmt::Display for TokenId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Caller side of a token. Consumed by [`Registry::await_result`].
#[derive(Debug)]
pub struct TokenHandle {
    id: TokenId,
    rx: oneshot::Receiver<Outcome>,
}

impl TokenHandle {
    pub fn id(&self) -> TokenId {
        self.id
    }
}

#[derive(Debug)]
enum Slot {
    Pending {
        tx: oneshot::Sender<Outcome>,
        created: Instant,
    },
    Resolved,
    Expired,
}

type Shard = HashMap<TokenId, Slot>;

pub struct Registry {
    shards: Vec<Mutex<Shard>>,
    cursor: AtomicUsize,
    /// Pending slots older than this are reclaimed even if nobody expired them.
    max_pending_age: Duration,
}

impl Registry {
    pub fn new(shards: usize, max_pending_age: Duration) -> Self {
        let shards = shards.max(1);
        Registry {
            shards: (0..shards).map(|_| Mutex::new(HashMap::new())).collect(),
            cursor: AtomicUsize::new(0),
            max_pending_age,
        }
    }

    fn lock(&self, index: usize) -> MutexGuard<'_, Shard> {
        self.shards[index]
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn shard_for(&self, id: &TokenId) -> MutexGuard<'_, Shard> {
        self.lock(id.shard_of(self.shards.len()))
    }

    /// Allocates a pending token and sweeps one shard.
    pub fn create_token(&self) -> TokenHandle {
        let id = TokenId::generate();
        let (tx, rx) = oneshot::channel();
        self.shard_for(&id).insert(
            id,
            Slot::Pending {
                tx,
                created: Instant::now(),
            },
        );
        metrics::REGISTRY_PENDING.inc();

        let next = self.cursor.fetch_add(1, Ordering::Relaxed) % self.shards.len();
        self.sweep(next);
        TokenHandle { id, rx }
    }

    /// Drops finished slots of one shard, and pending ones whose caller is gone
    /// or which outlived `max_pending_age`.
    fn sweep(&self, index: usize) -> usize {
        let max_age = self.max_pending_age;
        let mut shard = self.lock(index);
        let before = shard.len();
        shard.retain(|_, slot| match slot {
            Slot::Pending { tx, created } => {
                let keep = !tx.is_closed() && created.elapsed() < max_age;
                if !keep {
                    metrics::REGISTRY_PENDING.dec();
                }
                keep
            }
            Slot::Resolved | Slot::Expired => false,
        });
        before - shard.len()
    }

    /// Sweeps every shard, returning the number of slots reclaimed.
    pub fn sweep_all(&self) -> usize {
        (0..self.shards.len()).map(|i| self.sweep(i)).sum()
    }

    /// Delivers `outcome` to the caller waiting on `id`.
    ///
    /// Only the first resolution of a pending token counts. Resolving a token
    /// that is already resolved, expired or unknown (e.g. on a follower that
    /// did not submit the command) is a no-op and returns `false`.
    pub fn resolve(&self, id: TokenId, outcome: Outcome) -> bool {
        let mut shard = self.shard_for(&id);
        let Some(slot) = shard.get_mut(&id) else {
            return false;
        };
        match std::mem::replace(slot, Slot::Resolved) {
            Slot::Pending { tx, .. } => {
                metrics::REGISTRY_PENDING.dec();
                // The caller may have given up already; the slot is done either way.
                let _ = tx.send(outcome);
                true
            }
            previous => {
                *slot = previous;
                false
            }
        }
    }

    /// True while a caller on this node is still waiting on `id`.
    pub fn is_pending(&self, id: TokenId) -> bool {
        matches!(self.shard_for(&id).get(&id), Some(Slot::Pending { .. }))
    }

    /// Marks a pending token as expired so the next sweep reclaims it.
    pub fn expire(&self, id: TokenId) {
        let mut shard = self.shard_for(&id);
        if let Some(slot) = shard.get_mut(&id) {
            if matches!(slot, Slot::Pending { .. }) {
                metrics::REGISTRY_PENDING.dec();
                *slot = Slot::Expired;
            }
        }
    }

    /// Waits until the command behind `handle` has been applied.
    ///
    /// `commit_timeout` bounds the log commit, `total_timeout` the whole round
    /// trip. On any failure the token is expired.
    pub async fn await_result(
        &self,
        handle: TokenHandle,
        commit: Commit,
        commit_timeout: Duration,
        total_timeout: Duration,
    ) -> Result<()> {
        let TokenHandle { id, rx } = handle;
        let round_trip = async {
            commit.wait(commit_timeout).await?;
            rx.await.map_err(|_| Error::Timeout)
        };

        match tokio::time::timeout(total_timeout, round_trip).await {
            Ok(Ok(outcome)) => outcome.map_err(Error::from),
            Ok(Err(e)) => {
                self.expire(id);
                Err(e)
            }
            Err(_) => {
                log::warn!("token {} timed out after {:?}", id, total_timeout);
                self.expire(id);
                Err(Error::Timeout)
            }
        }
    }

    /// Number of slots currently held, in any state.
    pub fn len(&self) -> usize {
        (0..self.shards.len()).map(|i| self.lock(i).len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn pending(&self) -> usize {
        (0..self.shards.len())
            .map(|i| {
                self.lock(i)
                    .values()
                    .filter(|slot| matches!(slot, Slot::Pending { .. }))
                    .count()
            })
            .sum()
    }
}
