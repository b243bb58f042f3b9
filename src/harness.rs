use async_std::sync::{Arc, Mutex};
use async_trait::async_trait;
use bytes::Bytes;
use futures::Future;
use std::collections::BTreeMap;
use std::error::Error;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::sleep;
use tracing::{Instrument, info, info_span};

use crate::keyvalue::{MapStore, Store, set_operation};
use crate::raft::{
    BOOTSTRAP_LEADER_ID, FollowerRole, MemberAddresses, NodeStatus, Raft, RaftConfig, RaftHandle,
    RaftResult, StateMachine, StateMachineResult, request_id,
};

// A key-value store which also remembers every payload it applied, in order.
#[derive(Default)]
pub struct RecordingStore {
    store: MapStore,
    applied: Vec<Bytes>,
}

#[async_trait]
impl StateMachine for RecordingStore {
    async fn apply(&mut self, payload: Bytes) -> StateMachineResult<Bytes> {
        self.applied.push(payload.clone());
        self.store.apply(payload).await
    }

    async fn snapshot(&self) -> StateMachineResult<Bytes> {
        self.store.snapshot().await
    }

    // The history before the snapshot is unknown from here on.
    async fn restore(&mut self, snapshot: Bytes) -> StateMachineResult<()> {
        self.applied.clear();
        self.store.restore(snapshot).await
    }
}

// Represents a collection of raft nodes running in a single process, each
// with its own listener, key-value store and storage.
pub struct Harness {
    instances: BTreeMap<u64, Instance>,
    config: RaftConfig,
}

// Used to capture the intermediate state while building a harness. We first
// need to bind a port for each node, then collect all the addresses, and only
// then start the nodes (which require knowledge of the others' addresses).
pub struct HarnessBuilder {
    bound: Vec<(u64, TcpListener)>,
    config: RaftConfig,
}

impl HarnessBuilder {
    // Consumes this instance and returns an instance with the raft config set.
    pub fn with_config(self, config: RaftConfig) -> Self {
        Self {
            bound: self.bound,
            config,
        }
    }

    pub fn addresses(&self) -> MemberAddresses {
        self.bound
            .iter()
            .filter_map(|(id, listener)| Some((*id, listener.local_addr().ok()?.to_string())))
            .collect()
    }

    // Starts all nodes. Node 1 bootstraps the cluster, the others are its
    // initial members.
    pub async fn build(self) -> Result<Harness, Box<dyn Error>> {
        let initial = self.addresses();
        let mut instances = BTreeMap::new();
        for (id, listener) in self.bound {
            let store = Arc::new(Mutex::new(RecordingStore::default()));
            let config = self.config.clone();
            let raft = if id == BOOTSTRAP_LEADER_ID {
                Raft::bootstrap_cluster(config, listener, store.clone(), initial.clone()).await?
            } else {
                Raft::new_follower(config, id, listener, store.clone(), initial.clone()).await?
            };
            instances.insert(id, Instance::start(raft, store));
        }
        Ok(Harness {
            instances,
            config: self.config,
        })
    }
}

impl Harness {
    // Creates a harness builder for "size" nodes with ids 1 to "size". This
    // immediately binds a port for each of them.
    pub async fn builder(size: u64) -> Result<HarnessBuilder, Box<dyn Error>> {
        let mut bound = Vec::new();
        for id in 1..=size {
            bound.push((id, TcpListener::bind("127.0.0.1:0").await?));
        }
        Ok(HarnessBuilder {
            bound,
            config: RaftConfig::new_without_persistence_for_testing(),
        })
    }

    pub fn ids(&self) -> Vec<u64> {
        self.instances.keys().copied().collect()
    }

    pub fn handle(&self, id: u64) -> RaftHandle {
        self.instance(id).handle.clone()
    }

    pub fn addr(&self, id: u64) -> String {
        self.instance(id).addr.clone()
    }

    fn instance(&self, id: u64) -> &Instance {
        self.instances
            .get(&id)
            .unwrap_or_else(|| panic!("no node {} in harness", id))
    }

    // Sets "key" to "value" through the supplied node.
    pub async fn put(&self, via: u64, key: &str, value: &str) -> RaftResult<Bytes> {
        self.handle(via)
            .propose(set_operation(key.to_string(), value.to_string()))
            .await
    }

    // Reads the supplied key from the local store of a node.
    pub async fn get(&self, id: u64, key: &str) -> Option<Bytes> {
        self.instance(id).store.lock().await.store.get(key.as_bytes())
    }

    // Returns the payloads applied by the supplied node, in apply order.
    pub async fn applied(&self, id: u64) -> Vec<Bytes> {
        self.instance(id).store.lock().await.applied.clone()
    }

    // Starts an additional node which joins the cluster through node 1.
    // Returns the id the node got assigned.
    pub async fn join(&mut self, role: FollowerRole) -> Result<u64, Box<dyn Error>> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?.to_string();
        let seeds: Vec<String> = self.instances.values().map(|i| i.addr.clone()).collect();

        let ticket = request_id(&addr, &seeds, &self.config).await?;
        let id = ticket.reserved_id;
        let store = Arc::new(Mutex::new(RecordingStore::default()));
        let raft = Raft::join_cluster(self.config.clone(), listener, store.clone(), ticket, role)
            .await?;
        self.instances.insert(id, Instance::start(raft, store));
        Ok(id)
    }

    // Kills a node without giving it a chance to leave the cluster.
    pub async fn kill(&mut self, id: u64) {
        if let Some(instance) = self.instances.remove(&id) {
            instance.task.abort();
            let _ = instance.task.await;
            info!(node = id, "Killed node");
        }
    }

    // Returns whether the node's driver loop has terminated.
    pub fn finished(&self, id: u64) -> bool {
        self.instance(id).task.is_finished()
    }

    // Stops all the nodes of this harness.
    pub async fn stop(self) {
        for (_, instance) in self.instances {
            let _ = instance.handle.shutdown().await;
            let _ = instance.task.await;
        }
    }

    // Waits until some node reports a leader which satisfies "matcher" and all
    // live nodes agree on it.
    pub async fn wait_for_leader<M>(&self, timeout: Duration, matcher: M) -> u64
    where
        M: Fn(u64) -> bool,
    {
        wait_for(timeout, || async {
            let statuses = self.statuses().await;
            let leader = statuses.first()?.leader_id;
            let agreed = statuses.iter().all(|s| s.leader_id == leader);
            if leader != 0 && agreed && matcher(leader) {
                Some(leader)
            } else {
                None
            }
        })
        .await
        .expect("wait_for_leader")
    }

    // Waits until the supplied key has the supplied value on all live nodes.
    pub async fn wait_for_value(&self, key: &str, value: &str, timeout: Duration) {
        let expected = Bytes::from(value.to_string());
        wait_for(timeout, || async {
            for id in self.instances.keys() {
                if self.get(*id, key).await.as_ref() != Some(&expected) {
                    return None;
                }
            }
            Some(())
        })
        .await
        .expect("wait_for_value")
    }

    async fn statuses(&self) -> Vec<NodeStatus> {
        let mut result = Vec::new();
        for instance in self.instances.values() {
            if let Ok(status) = instance.handle.status().await {
                result.push(status);
            }
        }
        result
    }
}

// A single running node.
struct Instance {
    addr: String,
    handle: RaftHandle,
    store: Arc<Mutex<RecordingStore>>,
    task: JoinHandle<RaftResult<()>>,
}

impl Instance {
    fn start(raft: Raft, store: Arc<Mutex<RecordingStore>>) -> Self {
        let span = info_span!("serve", node = raft.id());
        Instance {
            addr: raft.addr().to_string(),
            handle: raft.handle(),
            store,
            task: tokio::spawn(raft.run().instrument(span)),
        }
    }
}

/// Waits for a condition to become true, up to the given `timeout`.
/// Returns `Ok(T)` if the condition is met in time, or `Err(())` on timeout.
pub async fn wait_for<F, Fut, T>(timeout: Duration, mut condition: F) -> Result<T, ()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Option<T>>,
{
    let start = tokio::time::Instant::now();
    while start.elapsed() < timeout {
        if let Some(result) = condition().await {
            return Ok(result);
        }
        sleep(Duration::from_millis(300)).await;
    }
    Err(())
}
