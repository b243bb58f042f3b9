use std::path::PathBuf;
use std::time::Duration;

use crate::raft::error::{RaftError, RaftResult};
use crate::raft::persistence::PersistenceOptions;

// Tunables for a single raft node. Construct with RaftConfig::default() and
// override individual values using the with_* methods.
#[derive(Debug, Clone)]
pub struct RaftConfig {
    // Upper bound for a single attempt of any outbound rpc.
    pub message_timeout: Duration,

    // Total number of delivery attempts for a consensus message, the first
    // one included, before the receiving peer is considered unreachable. A
    // value of 3 means one attempt and two retries. Must be at least 1.
    pub max_retry_cnt: u32,

    // Whether peers which keep failing delivery get removed from the cluster.
    pub auto_remove_node: bool,

    // Number of exhausted deliveries after which a peer gets removed. Only
    // relevant if auto_remove_node is set.
    pub connection_fail_limit: u32,

    // Minimum wall clock time between two automatic snapshots. None disables
    // automatic snapshots.
    pub snapshot_interval: Option<Duration>,

    // Whether to drop applied log entries when taking a snapshot.
    pub use_log_compaction: bool,

    // Capacity of the bounded inbound queue of the node driver.
    pub queue_capacity: usize,

    // Wall clock duration of one logical raft tick.
    pub tick_interval: Duration,

    // Election and heartbeat timeouts, in ticks.
    pub election_tick: usize,
    pub heartbeat_tick: usize,

    // Timeout used for the bootstrap notifications between leader and followers.
    pub bootstrap_timeout: Duration,

    // Sleep between attempts of the join protocol.
    pub join_retry_interval: Duration,
    pub join_max_attempts: u32,

    pub persistence: PersistenceOptions,
}

impl Default for RaftConfig {
    fn default() -> Self {
        RaftConfig {
            message_timeout: Duration::from_secs(5),
            max_retry_cnt: 2,
            auto_remove_node: false,
            connection_fail_limit: 5,
            snapshot_interval: None,
            use_log_compaction: false,
            queue_capacity: 100,
            tick_interval: Duration::from_millis(100),
            election_tick: 10,
            heartbeat_tick: 3,
            bootstrap_timeout: Duration::from_secs(5),
            join_retry_interval: Duration::from_secs(2),
            join_max_attempts: 10,
            persistence: PersistenceOptions::Directory {
                path: std::env::temp_dir().join("raftkit"),
                wipe: false,
            },
        }
    }
}

impl RaftConfig {
    // Returns a config which keeps all state in memory. Only meant for tests.
    pub fn new_without_persistence_for_testing() -> Self {
        Self::default().with_persistence_options(PersistenceOptions::NoPersistenceForTesting)
    }

    pub fn with_message_timeout(self, message_timeout: Duration) -> Self {
        Self {
            message_timeout,
            ..self
        }
    }

    pub fn with_retries(self, max_retry_cnt: u32) -> Self {
        Self {
            max_retry_cnt,
            ..self
        }
    }

    // Enables removing peers which could not be reached for "limit" exhausted
    // message deliveries in a row.
    pub fn with_auto_remove(self, connection_fail_limit: u32) -> Self {
        Self {
            auto_remove_node: true,
            connection_fail_limit,
            ..self
        }
    }

    pub fn with_snapshots(self, interval: Duration, use_log_compaction: bool) -> Self {
        Self {
            snapshot_interval: Some(interval),
            use_log_compaction,
            ..self
        }
    }

    pub fn with_queue_capacity(self, queue_capacity: usize) -> Self {
        Self {
            queue_capacity,
            ..self
        }
    }

    pub fn with_tick_interval(self, tick_interval: Duration) -> Self {
        Self {
            tick_interval,
            ..self
        }
    }

    pub fn with_join_retry(self, interval: Duration, max_attempts: u32) -> Self {
        Self {
            join_retry_interval: interval,
            join_max_attempts: max_attempts,
            ..self
        }
    }

    // Stores all state under the supplied directory, one subdirectory per node.
    pub fn with_persistence(self, path: impl Into<PathBuf>, wipe: bool) -> Self {
        self.with_persistence_options(PersistenceOptions::Directory {
            path: path.into(),
            wipe,
        })
    }

    pub fn with_persistence_options(self, persistence: PersistenceOptions) -> Self {
        Self {
            persistence,
            ..self
        }
    }

    // Produces the configuration handed to the consensus core for the given node.
    pub fn to_raft_config(&self, id: u64) -> RaftResult<raft::Config> {
        let config = raft::Config {
            id,
            election_tick: self.election_tick,
            heartbeat_tick: self.heartbeat_tick,
            check_quorum: true,
            pre_vote: true,
            ..Default::default()
        };
        config
            .validate()
            .map_err(|e| RaftError::Initialization(format!("invalid raft config: {}", e)))?;
        Ok(config)
    }

    pub fn validate(&self) -> RaftResult<()> {
        if self.queue_capacity == 0 {
            return Err(RaftError::Initialization(
                "queue capacity must be positive".to_string(),
            ));
        }
        if self.max_retry_cnt == 0 {
            return Err(RaftError::Initialization(
                "max_retry_cnt must be at least 1".to_string(),
            ));
        }
        if self.tick_interval.is_zero() {
            return Err(RaftError::Initialization(
                "tick interval must be positive".to_string(),
            ));
        }
        Ok(())
    }
}
