use async_std::fs;
use async_std::fs::OpenOptions;
use async_std::path::{Path, PathBuf};
use async_trait::async_trait;
use futures::AsyncWriteExt;
use prost::Message;
use protobuf::Message as PbMessage;
use raft::prelude::{ConfState, Entry, HardState, Snapshot};
use std::io::ErrorKind;
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::raft::raft_persistence_proto::{LogRecord, SnapshotFile, State};

const MAIN_STATE_PATH: &str = "main_state.pb.bin";
const SNAPSHOT_PATH: &str = "snapshot.pb.bin";
const LOG_PATH: &str = "log.pb.bin";

// Everything a node needs to resume after a restart.
#[derive(Debug, Clone, Default)]
pub struct PersistedState {
    pub hard_state: HardState,
    pub conf_state: ConfState,
    pub snapshot: Option<Snapshot>,
    pub entries: Vec<Entry>,
}

#[async_trait]
pub trait Persistence {
    // Returns the previously written state, or None if nothing was ever written.
    async fn read(&self) -> Result<Option<PersistedState>, PersistenceError>;

    async fn write_state(
        &self,
        hard_state: &HardState,
        conf_state: &ConfState,
    ) -> Result<(), PersistenceError>;

    // Appends entries to the end of the durable log.
    async fn append_entries(&self, entries: &[Entry]) -> Result<(), PersistenceError>;

    // Replaces the durable log with the supplied entries.
    async fn write_entries(&self, entries: &[Entry]) -> Result<(), PersistenceError>;

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), PersistenceError>;
}

#[derive(Debug, Clone)]
pub enum PersistenceOptions {
    // Keeps the state of each node in "<path>/node-<id>". If "wipe" is set,
    // previously written state is discarded on startup.
    Directory { path: std::path::PathBuf, wipe: bool },
    NoPersistenceForTesting,
}

pub async fn new(
    options: &PersistenceOptions,
    node_id: u64,
) -> Result<Box<dyn Persistence + Send + Sync>, PersistenceError> {
    match options {
        PersistenceOptions::Directory { path, wipe } => {
            let directory = PathBuf::from(path.join(format!("node-{}", node_id)));
            if *wipe {
                wipe_directory(&directory).await?;
            }
            Ok(Box::new(FilePersistence::new(directory, node_id).await?))
        }
        PersistenceOptions::NoPersistenceForTesting => Ok(Box::new(NoopPersistence {})),
    }
}

#[derive(Error, Debug, Clone)]
#[error("{message}")]
pub struct PersistenceError {
    message: String,
}

impl PersistenceError {
    pub fn new(message: String) -> Self {
        Self { message }
    }
}

pub struct NoopPersistence {}

#[async_trait]
impl Persistence for NoopPersistence {
    async fn read(&self) -> Result<Option<PersistedState>, PersistenceError> {
        Ok(None)
    }
    async fn write_state(&self, _: &HardState, _: &ConfState) -> Result<(), PersistenceError> {
        Ok(())
    }
    async fn append_entries(&self, _: &[Entry]) -> Result<(), PersistenceError> {
        Ok(())
    }
    async fn write_entries(&self, _: &[Entry]) -> Result<(), PersistenceError> {
        Ok(())
    }
    async fn write_snapshot(&self, _: &Snapshot) -> Result<(), PersistenceError> {
        Ok(())
    }
}

// Stores state in three files: the hard and conf state, the latest snapshot,
// and an append-only file of length-delimited log records.
pub struct FilePersistence {
    directory: PathBuf,
    node_id: u64,
}

impl FilePersistence {
    pub async fn new(directory: PathBuf, node_id: u64) -> Result<Self, PersistenceError> {
        create_dir_if_not_exists(&directory).await?;
        info!(node = node_id, "Created file persistence backed by directory {:?}", directory);
        Ok(FilePersistence { directory, node_id })
    }

    fn path(&self, filename: &str) -> PathBuf {
        self.directory.join(filename)
    }

    // Replaces the contents of the file atomically by writing a sibling file
    // and renaming it into place.
    async fn write_to_file(&self, filename: &str, data: &[u8]) -> Result<(), PersistenceError> {
        let path = self.path(filename);
        let temp = self.path(&format!("{}.tmp", filename));

        let mut file = OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(&temp)
            .await
            .map_err(|e| io_error("open", &temp, e))?;
        file.write_all(data)
            .await
            .map_err(|e| io_error("write", &temp, e))?;
        file.sync_all()
            .await
            .map_err(|e| io_error("sync", &temp, e))?;

        fs::rename(&temp, &path)
            .await
            .map_err(|e| io_error("rename", &path, e))
    }

    async fn read_file(&self, filename: &str) -> Result<Option<Vec<u8>>, PersistenceError> {
        let path = self.path(filename);
        match fs::read(&path).await {
            Ok(bytes) => Ok(Some(bytes)),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(io_error("read", &path, e)),
        }
    }

    fn encode_records(entries: &[Entry]) -> Result<Vec<u8>, PersistenceError> {
        let mut out = Vec::new();
        for entry in entries {
            let record = LogRecord {
                entry: encode_raft(entry)?,
            };
            record
                .encode_length_delimited(&mut out)
                .map_err(|e| PersistenceError::new(format!("Failed to encode record: {}", e)))?;
        }
        Ok(out)
    }

    // Reads records until the end of the file. A trailing partial record (e.g.,
    // from a crash during an append) is dropped.
    fn decode_records(&self, mut bytes: &[u8]) -> Result<Vec<Entry>, PersistenceError> {
        let mut entries = Vec::new();
        while !bytes.is_empty() {
            match LogRecord::decode_length_delimited(&mut bytes) {
                Ok(record) => entries.push(decode_raft::<Entry>(&record.entry)?),
                Err(e) => {
                    warn!(node = self.node_id, "Dropping truncated log record: {}", e);
                    break;
                }
            }
        }
        Ok(entries)
    }
}

#[async_trait]
impl Persistence for FilePersistence {
    async fn read(&self) -> Result<Option<PersistedState>, PersistenceError> {
        let state = self.read_file(MAIN_STATE_PATH).await?;
        let snapshot = self.read_file(SNAPSHOT_PATH).await?;
        let log = self.read_file(LOG_PATH).await?;
        if state.is_none() && snapshot.is_none() && log.is_none() {
            return Ok(None);
        }

        let mut result = PersistedState::default();
        if let Some(bytes) = state {
            let state = State::decode(bytes.as_slice())
                .map_err(|e| PersistenceError::new(format!("Corrupt state file: {}", e)))?;
            if state.node_id != self.node_id {
                return Err(PersistenceError::new(format!(
                    "State in {:?} belongs to node {}, not {}",
                    self.directory, state.node_id, self.node_id
                )));
            }
            result.hard_state = decode_raft(&state.hard_state)?;
            result.conf_state = decode_raft(&state.conf_state)?;
        }
        if let Some(bytes) = snapshot {
            let file = SnapshotFile::decode(bytes.as_slice())
                .map_err(|e| PersistenceError::new(format!("Corrupt snapshot file: {}", e)))?;
            result.snapshot = Some(decode_raft::<Snapshot>(&file.snapshot)?);
        }
        if let Some(bytes) = log {
            result.entries = self.decode_records(&bytes)?;
        }

        debug!(node = self.node_id, entries = result.entries.len(), "Read persisted state");
        Ok(Some(result))
    }

    async fn write_state(
        &self,
        hard_state: &HardState,
        conf_state: &ConfState,
    ) -> Result<(), PersistenceError> {
        let output = State {
            node_id: self.node_id,
            hard_state: encode_raft(hard_state)?,
            conf_state: encode_raft(conf_state)?,
        };
        self.write_to_file(MAIN_STATE_PATH, &output.encode_to_vec())
            .await
    }

    async fn append_entries(&self, entries: &[Entry]) -> Result<(), PersistenceError> {
        if entries.is_empty() {
            return Ok(());
        }
        let path = self.path(LOG_PATH);
        let data = Self::encode_records(entries)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| io_error("open", &path, e))?;
        file.write_all(&data)
            .await
            .map_err(|e| io_error("append", &path, e))?;
        file.sync_data()
            .await
            .map_err(|e| io_error("sync", &path, e))
    }

    async fn write_entries(&self, entries: &[Entry]) -> Result<(), PersistenceError> {
        let data = Self::encode_records(entries)?;
        self.write_to_file(LOG_PATH, &data).await
    }

    async fn write_snapshot(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let output = SnapshotFile {
            snapshot: encode_raft(snapshot)?,
        };
        self.write_to_file(SNAPSHOT_PATH, &output.encode_to_vec())
            .await
    }
}

fn encode_raft<M: PbMessage>(message: &M) -> Result<Vec<u8>, PersistenceError> {
    message
        .write_to_bytes()
        .map_err(|e| PersistenceError::new(format!("Failed to encode: {}", e)))
}

fn decode_raft<M: PbMessage + Default>(bytes: &[u8]) -> Result<M, PersistenceError> {
    let mut message = M::default();
    message
        .merge_from_bytes(bytes)
        .map_err(|e| PersistenceError::new(format!("Failed to decode: {}", e)))?;
    Ok(message)
}

fn io_error(action: &str, path: &Path, e: std::io::Error) -> PersistenceError {
    PersistenceError::new(format!("Failed to {} file {:?} : {}", action, path, e))
}

async fn wipe_directory(directory: &Path) -> Result<(), PersistenceError> {
    match fs::remove_dir_all(directory).await {
        Ok(()) => {
            info!("Wiped persisted state in {:?}", directory);
            Ok(())
        }
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(io_error("wipe", directory, e)),
    }
}

async fn create_dir_if_not_exists(directory: &Path) -> Result<(), PersistenceError> {
    match fs::metadata(directory).await {
        Ok(metadata) => {
            if metadata.is_dir() {
                Ok(())
            } else {
                Err(PersistenceError::new(format!(
                    "Path exists but is not a directory: {:?}",
                    directory
                )))
            }
        }
        Err(e) => {
            if e.kind() == ErrorKind::NotFound {
                fs::create_dir_all(directory).await.map_err(|e| {
                    PersistenceError::new(format!("Failed to create directory {}", e))
                })
            } else {
                Err(PersistenceError::new(format!(
                    "Unexpected filesystem error for {:?} : {}",
                    directory, e
                )))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[tokio::test]
    async fn test_read_empty() {
        let fixture = Fixture::new();
        let persistence = fixture.make_persistence(1).await;
        assert!(persistence.read().await.expect("read").is_none());
    }

    #[tokio::test]
    async fn test_state_round_trip() {
        let fixture = Fixture::new();
        let persistence = fixture.make_persistence(1).await;

        let mut hard_state = HardState::default();
        hard_state.set_term(4);
        hard_state.set_vote(2);
        hard_state.set_commit(9);
        let conf_state = ConfState::from((vec![1, 2, 3], vec![4]));
        persistence
            .write_state(&hard_state, &conf_state)
            .await
            .expect("write");

        let restored = fixture.make_persistence(1).await.read().await.expect("read");
        let restored = restored.expect("state");
        assert_eq!(restored.hard_state, hard_state);
        assert_eq!(restored.conf_state.get_voters(), &[1, 2, 3]);
        assert_eq!(restored.conf_state.get_learners(), &[4]);
        assert!(restored.snapshot.is_none());
    }

    #[tokio::test]
    async fn test_append_and_rewrite_entries() {
        let fixture = Fixture::new();
        let persistence = fixture.make_persistence(1).await;
        persistence
            .write_state(&HardState::default(), &ConfState::default())
            .await
            .expect("write");

        persistence
            .append_entries(&[entry(1, 1), entry(1, 2)])
            .await
            .expect("append");
        persistence
            .append_entries(&[entry(2, 3)])
            .await
            .expect("append");
        let restored = persistence.read().await.expect("read").expect("state");
        let indexes: Vec<u64> = restored.entries.iter().map(|e| e.get_index()).collect();
        assert_eq!(indexes, vec![1, 2, 3]);

        persistence
            .write_entries(&[entry(2, 3)])
            .await
            .expect("rewrite");
        let restored = persistence.read().await.expect("read").expect("state");
        assert_eq!(restored.entries.len(), 1);
        assert_eq!(restored.entries[0].get_term(), 2);
    }

    #[tokio::test]
    async fn test_other_node_state_rejected() {
        let fixture = Fixture::new();
        let directory = PathBuf::from(fixture.temp_dir.path().join("shared"));
        let persistence = FilePersistence::new(directory.clone(), 1).await.expect("new");
        persistence
            .write_state(&HardState::default(), &ConfState::default())
            .await
            .expect("write");

        let other = FilePersistence::new(directory, 2).await.expect("new");
        assert!(other.read().await.is_err());
    }

    #[tokio::test]
    async fn test_wipe() {
        let fixture = Fixture::new();
        let persistence = fixture.make_persistence(3).await;
        persistence
            .write_state(&HardState::default(), &ConfState::default())
            .await
            .expect("write");

        let options = PersistenceOptions::Directory {
            path: fixture.temp_dir.path().to_path_buf(),
            wipe: true,
        };
        let wiped = new(&options, 3).await.expect("new");
        assert!(wiped.read().await.expect("read").is_none());
    }

    struct Fixture {
        temp_dir: TempDir,
    }

    impl Fixture {
        fn new() -> Fixture {
            Fixture {
                temp_dir: TempDir::new().unwrap(),
            }
        }

        async fn make_persistence(&self, node_id: u64) -> Box<dyn Persistence + Send + Sync> {
            let options = PersistenceOptions::Directory {
                path: self.temp_dir.path().to_path_buf(),
                wipe: false,
            };
            new(&options, node_id).await.expect("persistence")
        }
    }

    fn entry(term: u64, index: u64) -> Entry {
        let mut entry = Entry::default();
        entry.set_term(term);
        entry.set_index(index);
        entry
    }
}
