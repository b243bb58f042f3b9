use bytes::Bytes;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use raft::{GetEntriesContext, RaftState, Storage, StorageError};
use std::sync::{Arc, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, info};

use crate::raft::error::{RaftError, RaftResult};
use crate::raft::persistence::{self, Persistence, PersistenceOptions};

// Durable storage for the consensus state of a single node: hard state, conf
// state, the latest snapshot and the log entries following it.
//
// Reads are served from memory and implement the raft Storage trait. Writes
// update memory and then the persistence layer, and only return once the
// latter has completed. The handle is cheap to clone, one copy is owned by
// the consensus core and one by the node driver.
#[derive(Clone)]
pub struct LogStore {
    node_id: u64,
    core: Arc<RwLock<StoreCore>>,
    persistence: Arc<dyn Persistence + Send + Sync>,
}

#[derive(Default)]
struct StoreCore {
    hard_state: HardState,
    conf_state: ConfState,
    snapshot: Snapshot,
    // Entries following the snapshot. Contiguous, ordered by index.
    entries: Vec<Entry>,
}

impl StoreCore {
    fn first_index(&self) -> u64 {
        match self.entries.first() {
            Some(e) => e.get_index(),
            None => self.snapshot.get_metadata().get_index() + 1,
        }
    }

    fn last_index(&self) -> u64 {
        match self.entries.last() {
            Some(e) => e.get_index(),
            None => self.snapshot.get_metadata().get_index(),
        }
    }
}

impl LogStore {
    // Opens the store for the supplied node, restoring any previously
    // persisted state. Fails if the location is unusable.
    pub async fn create(options: &PersistenceOptions, node_id: u64) -> RaftResult<Self> {
        let persistence: Arc<dyn Persistence + Send + Sync> =
            Arc::from(persistence::new(options, node_id).await?);

        let mut core = StoreCore::default();
        if let Some(loaded) = persistence.read().await? {
            core.hard_state = loaded.hard_state;
            core.conf_state = loaded.conf_state;
            if let Some(snapshot) = loaded.snapshot {
                core.snapshot = snapshot;
            }

            // Entries covered by the snapshot may still be on disk if we
            // crashed between writing the snapshot and rewriting the log.
            let snapshot_index = core.snapshot.get_metadata().get_index();
            core.entries = loaded
                .entries
                .into_iter()
                .filter(|e| e.get_index() > snapshot_index)
                .collect();
            info!(
                node = node_id,
                term = core.hard_state.get_term(),
                commit = core.hard_state.get_commit(),
                snapshot_index,
                last_index = core.last_index(),
                "Restored persisted state"
            );
        }

        Ok(LogStore {
            node_id,
            core: Arc::new(RwLock::new(core)),
            persistence,
        })
    }

    fn read(&self) -> RwLockReadGuard<'_, StoreCore> {
        self.core.read().unwrap_or_else(PoisonError::into_inner)
    }

    fn write(&self) -> RwLockWriteGuard<'_, StoreCore> {
        self.core.write().unwrap_or_else(PoisonError::into_inner)
    }

    // Returns true if no state was ever written to this store.
    pub fn is_empty(&self) -> bool {
        let core = self.read();
        core.entries.is_empty()
            && core.snapshot.get_metadata().get_index() == 0
            && core.conf_state.get_voters().is_empty()
            && core.hard_state.get_term() == 0
    }

    pub fn hard_state(&self) -> HardState {
        self.read().hard_state.clone()
    }

    pub fn conf_state(&self) -> ConfState {
        self.read().conf_state.clone()
    }

    pub fn last_index(&self) -> u64 {
        self.read().last_index()
    }

    pub fn latest_snapshot(&self) -> Snapshot {
        self.read().snapshot.clone()
    }

    // Appends entries handed out by the consensus core. The entries must be
    // contiguous. Any existing entries at or after the first supplied index
    // are replaced.
    pub async fn append(&self, entries: &[Entry]) -> RaftResult<()> {
        let Some(first) = entries.first() else {
            return Ok(());
        };

        let (skip, rewrite) = {
            let mut core = self.write();
            let first_index = core.first_index();
            let next_index = core.last_index() + 1;
            let new_first = first.get_index();
            if new_first > next_index {
                return Err(RaftError::Internal(format!(
                    "Non-contiguous log entries supplied. Expected index <= {}, got {}",
                    next_index, new_first
                )));
            }

            // Drop the part of the batch which is already covered by the snapshot.
            let skip = first_index.saturating_sub(new_first) as usize;
            if skip >= entries.len() {
                return Ok(());
            }
            let entries = &entries[skip..];
            let start = entries[0].get_index();

            if start == next_index {
                core.entries.extend_from_slice(entries);
                (skip, None)
            } else {
                let keep = (start - first_index) as usize;
                core.entries.truncate(keep);
                core.entries.extend_from_slice(entries);
                debug!(node = self.node_id, from = start, "Overwrote conflicting log suffix");
                (skip, Some(core.entries.clone()))
            }
        };

        match rewrite {
            None => self.persistence.append_entries(&entries[skip..]).await?,
            Some(all) => self.persistence.write_entries(&all).await?,
        }
        Ok(())
    }

    pub async fn set_hard_state(&self, hard_state: HardState) -> RaftResult<()> {
        let conf_state = {
            let mut core = self.write();
            core.hard_state = hard_state.clone();
            core.conf_state.clone()
        };
        self.persist_state(&hard_state, &conf_state).await
    }

    pub async fn set_commit_index(&self, commit: u64) -> RaftResult<()> {
        let (hard_state, conf_state) = {
            let mut core = self.write();
            core.hard_state.set_commit(commit);
            (core.hard_state.clone(), core.conf_state.clone())
        };
        self.persist_state(&hard_state, &conf_state).await
    }

    pub async fn set_conf_state(&self, conf_state: ConfState) -> RaftResult<()> {
        let hard_state = {
            let mut core = self.write();
            core.conf_state = conf_state.clone();
            core.hard_state.clone()
        };
        self.persist_state(&hard_state, &conf_state).await
    }

    async fn persist_state(&self, hard_state: &HardState, conf_state: &ConfState) -> RaftResult<()> {
        self.persistence.write_state(hard_state, conf_state).await?;
        Ok(())
    }

    // Replaces the entire contents of the store with the supplied snapshot.
    // Used when bootstrapping and when a lagging node is fast-forwarded.
    pub async fn apply_snapshot(&self, snapshot: Snapshot) -> RaftResult<()> {
        let (hard_state, conf_state) = {
            let mut core = self.write();
            let metadata = snapshot.get_metadata();
            if core.hard_state.get_term() < metadata.get_term() {
                core.hard_state.set_term(metadata.get_term());
            }
            if core.hard_state.get_commit() < metadata.get_index() {
                core.hard_state.set_commit(metadata.get_index());
            }
            core.conf_state = metadata.get_conf_state().clone();
            core.entries.clear();
            core.snapshot = snapshot.clone();
            (core.hard_state.clone(), core.conf_state.clone())
        };

        self.persistence.write_snapshot(&snapshot).await?;
        self.persistence.write_entries(&[]).await?;
        self.persist_state(&hard_state, &conf_state).await?;
        info!(
            node = self.node_id,
            index = snapshot.get_metadata().get_index(),
            term = snapshot.get_metadata().get_term(),
            "Installed snapshot"
        );
        Ok(())
    }

    // Records a snapshot of the state machine taken right after applying the
    // entry at (index, term). Fails if a snapshot at or past index exists.
    pub async fn create_snapshot(&self, data: Bytes, index: u64, term: u64) -> RaftResult<()> {
        let snapshot = {
            let mut core = self.write();
            let current = core.snapshot.get_metadata().get_index();
            if index <= current {
                return Err(RaftError::Consensus(raft::Error::Store(
                    StorageError::SnapshotOutOfDate,
                )));
            }
            if index > core.last_index() {
                return Err(RaftError::InvalidArgument(format!(
                    "Cannot snapshot at index {} past the last index {}",
                    index,
                    core.last_index()
                )));
            }

            let mut snapshot = Snapshot::default();
            snapshot.set_data(data.into());
            let metadata = snapshot.mut_metadata();
            metadata.set_index(index);
            metadata.set_term(term);
            metadata.set_conf_state(core.conf_state.clone());
            core.snapshot = snapshot.clone();
            snapshot
        };

        self.persistence.write_snapshot(&snapshot).await?;
        debug!(node = self.node_id, index, term, "Created snapshot");
        Ok(())
    }

    // Discards all entries before the supplied index. No-op if they are
    // already gone.
    pub async fn compact(&self, compact_index: u64) -> RaftResult<()> {
        let remaining = {
            let mut core = self.write();
            let first_index = core.first_index();
            if compact_index <= first_index {
                return Ok(());
            }
            if compact_index > core.last_index() + 1 {
                return Err(RaftError::InvalidArgument(format!(
                    "Cannot compact to {} past the last index {}",
                    compact_index,
                    core.last_index()
                )));
            }
            let drop = (compact_index - first_index) as usize;
            core.entries.drain(..drop);
            core.entries.clone()
        };

        self.persistence.write_entries(&remaining).await?;
        debug!(node = self.node_id, compact_index, "Compacted log");
        Ok(())
    }
}

impl Storage for LogStore {
    fn initial_state(&self) -> raft::Result<RaftState> {
        let core = self.read();
        Ok(RaftState::new(
            core.hard_state.clone(),
            core.conf_state.clone(),
        ))
    }

    fn entries(
        &self,
        low: u64,
        high: u64,
        max_size: impl Into<Option<u64>>,
        _context: GetEntriesContext,
    ) -> raft::Result<Vec<Entry>> {
        let core = self.read();
        if low < core.first_index() {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        if high > core.last_index() + 1 {
            return Err(raft::Error::Store(StorageError::Unavailable));
        }

        let offset = core.first_index();
        let mut entries = core.entries[(low - offset) as usize..(high - offset) as usize].to_vec();
        raft::util::limit_size(&mut entries, max_size.into());
        Ok(entries)
    }

    fn term(&self, idx: u64) -> raft::Result<u64> {
        let core = self.read();
        let metadata = core.snapshot.get_metadata();
        if idx == metadata.get_index() {
            return Ok(metadata.get_term());
        }

        let offset = core.first_index();
        if idx < offset {
            return Err(raft::Error::Store(StorageError::Compacted));
        }
        match core.entries.get((idx - offset) as usize) {
            Some(entry) => Ok(entry.get_term()),
            None => Err(raft::Error::Store(StorageError::Unavailable)),
        }
    }

    fn first_index(&self) -> raft::Result<u64> {
        Ok(self.read().first_index())
    }

    fn last_index(&self) -> raft::Result<u64> {
        Ok(self.read().last_index())
    }

    fn snapshot(&self, request_index: u64, _to: u64) -> raft::Result<Snapshot> {
        let core = self.read();
        let snapshot = core.snapshot.clone();
        if snapshot.get_metadata().get_index() < request_index {
            return Err(raft::Error::Store(
                StorageError::SnapshotTemporarilyUnavailable,
            ));
        }
        Ok(snapshot)
    }
}
