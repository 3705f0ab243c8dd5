use std::sync::{Mutex, MutexGuard, PoisonError};

use raft::eraftpb::{Entry, HardState, Snapshot};
use raft::{storage::MemStorage, GetEntriesContext, RaftState, Result, Storage, StorageError};
use raft_proto::eraftpb::ConfState;

/// In-memory raft log plus the latest state machine snapshot.
///
/// The log is compacted up to the snapshot it keeps, so a follower that lags
/// behind the first retained entry is always caught up from that snapshot.
pub struct LogStore {
    mem_storage: MemStorage,
    latest: Mutex<Option<Snapshot>>,
}

impl LogStore {
    pub fn new() -> Self {
        LogStore {
            mem_storage: MemStorage::new(),
            latest: Mutex::new(None),
        }
    }

    /// A single-voter log whose first snapshot (index 1, term 1) holds `data`.
    pub fn bootstrap(voter: u64, data: Vec<u8>) -> Self {
        let conf_state = ConfState::from((vec![voter], Vec::<u64>::new()));
        let mem_storage = MemStorage::new_with_conf_state(conf_state.clone());

        let mut snapshot = Snapshot::default();
        snapshot.mut_metadata().index = 1;
        snapshot.mut_metadata().term = 1;
        snapshot.mut_metadata().set_conf_state(conf_state);
        snapshot.set_data(data.into());

        LogStore {
            mem_storage,
            latest: Mutex::new(Some(snapshot)),
        }
    }

    fn latest(&self) -> MutexGuard<'_, Option<Snapshot>> {
        self.latest.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn append(&self, entries: &[Entry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        self.mem_storage.wl().append(entries)
    }

    pub fn set_conf_state(&self, conf_state: ConfState) {
        self.mem_storage.wl().set_conf_state(conf_state)
    }

    pub fn set_hardstate(&self, hs: HardState) {
        self.mem_storage.wl().set_hardstate(hs);
    }

    pub fn set_commit(&self, commit: u64) {
        self.mem_storage.wl().mut_hard_state().set_commit(commit);
    }

    pub fn conf_state(&self) -> Result<ConfState> {
        Ok(self.mem_storage.initial_state()?.conf_state)
    }

    /// Installs a snapshot received from the leader.
    pub fn apply_snapshot(&self, snapshot: Snapshot) -> Result<()> {
        self.mem_storage.wl().apply_snapshot(snapshot.clone())?;
        *self.latest() = Some(snapshot);
        Ok(())
    }

    /// Keeps a locally taken snapshot and drops the entries it covers.
    pub fn compact_to(&self, snapshot: Snapshot) -> Result<()> {
        self.mem_storage.wl().compact(snapshot.get_metadata().index)?;
        *self.latest() = Some(snapshot);
        Ok(())
    }

    /// Index of the latest snapshot, 0 if there is none.
    pub fn snapshot_index(&self) -> u64 {
        self.latest()
            .as_ref()
            .map(|s| s.get_metadata().index)
            .unwrap_or(0)
    }
}

impl Default for LogStore {
    fn default() -> Self {
        Self::new()
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> Result<RaftState> {
        self.mem_storage.initial_state()
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        context: GetEntriesContext,
    ) -> Result<Vec<Entry>> {
        self.mem_storage.entries(low, high, max_size, context)
    }

    fn term(&self, idx: u64) -> Result<u64> {
        self.mem_storage.term(idx)
    }

    fn first_index(&self) -> Result<u64> {
        self.mem_storage.first_index()
    }

    fn last_index(&self) -> Result<u64> {
        self.mem_storage.last_index()
    }

    /// Only ever hands out a snapshot carrying real state; until one exists the
    /// leader retries on a later heartbeat.
    fn snapshot(&self, request_index: u64, _to: u64) -> Result<Snapshot> {
        match self.latest().as_ref() {
            Some(snapshot) if snapshot.get_metadata().index >= request_index => Ok(snapshot.clone()),
            _ => Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            )),
        }
    }
}
