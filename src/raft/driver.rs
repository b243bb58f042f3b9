use async_std::channel::{self, Receiver, Sender};
use async_std::sync::{Arc, Mutex};
use bytes::Bytes;
use futures::channel::oneshot;
use raft::prelude::{
    ConfChangeSingle, ConfChangeType, ConfChangeV2, ConfState, Entry, Message, Snapshot,
};
use raft::{RawNode, Storage};
use slog::{Discard, Logger, o};
use std::collections::{BTreeSet, HashMap};
use tokio::time::{Instant, timeout};
use tracing::{debug, error, info, trace, warn};

use crate::raft::config::RaftConfig;
use crate::raft::consensus_core::ConsensusCore;
use crate::raft::error::{RaftError, RaftResult};
use crate::raft::message::{
    CommittedEntry, ConfigChangeResult, InboundRequest, LeaderHint, MemberAddresses, NodeStatus,
    ProposalId, ProposalResult, RequestIdResult, Reroute, decode_change_context,
};
use crate::raft::peers::Peers;
use crate::raft::storage::LogStore;
use crate::raft::transport::{Escalation, Transport, escalate};
use crate::raft::StateMachine;

// The node id which bootstraps a new cluster and leads it initially.
pub const BOOTSTRAP_LEADER_ID: u64 = 1;

// A caller waiting for one of our proposals to be applied.
enum Waiter {
    Proposal(oneshot::Sender<ProposalResult>),
    ConfigChange(oneshot::Sender<ConfigChangeResult>),
}

impl Waiter {
    // Whether the caller stopped waiting.
    fn is_canceled(&self) -> bool {
        match self {
            Waiter::Proposal(reply) => reply.is_canceled(),
            Waiter::ConfigChange(reply) => reply.is_canceled(),
        }
    }

    fn wrong_leader(self, hint: LeaderHint) {
        match self {
            Waiter::Proposal(reply) => {
                let _ = reply.send(ProposalResult::WrongLeader(hint));
            }
            Waiter::ConfigChange(reply) => {
                let _ = reply.send(ConfigChangeResult::WrongLeader(hint));
            }
        }
    }
}

// Fires the transport shutdown signal when triggered or dropped, so that
// cancelling the driver also stops the server.
struct ServerShutdown(Option<tokio::sync::oneshot::Sender<()>>);

impl ServerShutdown {
    fn fire(&mut self) {
        if let Some(sender) = self.0.take() {
            let _ = sender.send(());
        }
    }
}

impl Drop for ServerShutdown {
    fn drop(&mut self) {
        self.fire();
    }
}

// The main loop of a raft node. Exclusively owns the consensus core, the
// storage, the peer registry and the table of callers waiting for commits.
// Everything else talks to it through its bounded inbound queue.
pub struct NodeDriver {
    id: u64,
    addr: String,
    config: RaftConfig,

    core: Box<dyn ConsensusCore>,
    storage: LogStore,
    peers: Peers,
    fsm: Arc<Mutex<dyn StateMachine>>,
    transport: Transport,

    queue: Receiver<InboundRequest>,
    sender: Sender<InboundRequest>,

    incarnation: u64,
    next_seq: u64,
    waiters: HashMap<u64, Waiter>,
    was_leader: bool,

    last_snapshot: Instant,
    restored: bool,
    bootstrap_ready: BTreeSet<u64>,
    members_connected: Option<oneshot::Sender<()>>,
    server_shutdown: ServerShutdown,
    should_exit: bool,
}

impl NodeDriver {
    // Creates the driver for the node which bootstraps a new cluster. Unless
    // state was restored from disk, the node starts out as the leader of a
    // single voter configuration. The supplied initial peers are registered
    // but only join once the bootstrap coordinator proposes them.
    pub async fn bootstrap_leader(
        config: RaftConfig,
        addr: &str,
        fsm: Arc<Mutex<dyn StateMachine>>,
        initial_peers: &MemberAddresses,
    ) -> RaftResult<Self> {
        let id = BOOTSTRAP_LEADER_ID;
        let storage = LogStore::create(&config.persistence, id).await?;
        let fresh = storage.is_empty();
        if fresh {
            storage.apply_snapshot(initial_snapshot()).await?;
        } else {
            info!(node = id, last_index = storage.last_index(), "Restored state from storage");
        }

        let mut raw = new_raw_node(&config, id, storage.clone())?;
        if fresh {
            raw.raft.become_candidate();
            raw.raft.become_leader();
            info!(node = id, "Bootstrapped new cluster");
        }
        Self::new(config, id, addr, Box::new(raw), storage, fsm, initial_peers).await
    }

    // Creates the driver for any other node. The node waits for a leader to
    // contact it, either as one of the initial members or as a joining node.
    pub async fn new_follower(
        config: RaftConfig,
        id: u64,
        addr: &str,
        fsm: Arc<Mutex<dyn StateMachine>>,
        known_peers: &MemberAddresses,
    ) -> RaftResult<Self> {
        let storage = LogStore::create(&config.persistence, id).await?;
        if storage.is_empty() {
            storage.apply_snapshot(initial_snapshot()).await?;
        } else {
            info!(node = id, last_index = storage.last_index(), "Restored state from storage");
        }
        let raw = new_raw_node(&config, id, storage.clone())?;
        Self::new(config, id, addr, Box::new(raw), storage, fsm, known_peers).await
    }

    async fn new(
        config: RaftConfig,
        id: u64,
        addr: &str,
        core: Box<dyn ConsensusCore>,
        storage: LogStore,
        fsm: Arc<Mutex<dyn StateMachine>>,
        known_peers: &MemberAddresses,
    ) -> RaftResult<Self> {
        config.validate()?;
        // Nothing but the initial configuration at index 0 means a fresh node.
        let restored = storage.last_index() > 0;

        // Bring the state machine up to the latest snapshot, the consensus
        // core re-delivers the committed entries after it.
        let snapshot = storage.latest_snapshot();
        if !snapshot.get_data().is_empty() {
            fsm.lock()
                .await
                .restore(Bytes::copy_from_slice(snapshot.get_data()))
                .await
                .map_err(|e| RaftError::Initialization(e.to_string()))?;
        }

        let mut peers = Peers::new(id, addr);
        for (peer_id, peer_addr) in known_peers {
            peers.add_known(*peer_id, peer_addr)?;
        }

        let (sender, queue) = channel::bounded(config.queue_capacity);
        let transport = Transport::new(id, &config, sender.clone());
        Ok(NodeDriver {
            id,
            addr: addr.to_string(),
            config,
            core,
            storage,
            peers,
            fsm,
            transport,
            queue,
            sender,
            incarnation: rand::random(),
            next_seq: 0,
            waiters: HashMap::new(),
            was_leader: false,
            last_snapshot: Instant::now(),
            restored,
            bootstrap_ready: BTreeSet::new(),
            members_connected: None,
            server_shutdown: ServerShutdown(None),
            should_exit: false,
        })
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    // Whether the node resumed from state persisted by an earlier run.
    pub fn restored(&self) -> bool {
        self.restored
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn config(&self) -> &RaftConfig {
        &self.config
    }

    // Returns a sender for the inbound queue of this driver.
    pub fn mailbox(&self) -> Sender<InboundRequest> {
        self.sender.clone()
    }

    // The supplied sender is fired once the driver stops, however it stops.
    pub fn attach_server_shutdown(&mut self, shutdown: tokio::sync::oneshot::Sender<()>) {
        self.server_shutdown = ServerShutdown(Some(shutdown));
    }

    // Returns a receiver which resolves once the leader has told this node
    // that its membership is committed.
    pub fn members_connected(&mut self) -> oneshot::Receiver<()> {
        let (sender, receiver) = oneshot::channel();
        self.members_connected = Some(sender);
        receiver
    }

    // Runs the loop until the node is removed from the cluster or shut down.
    // Dropping the returned future stops the transport server as well.
    pub async fn run(mut self) -> RaftResult<()> {
        let heartbeat = self.config.tick_interval;
        let mut budget = heartbeat;
        info!(node = self.id, addr = %self.addr, "Starting node driver");

        while !self.should_exit {
            let started = Instant::now();
            match timeout(budget, self.queue.recv()).await {
                Ok(Ok(request)) => self.dispatch(request).await,
                // We hold a sender ourselves, so this does not happen.
                Ok(Err(_)) => break,
                Err(_) => {}
            }

            let elapsed = started.elapsed();
            if elapsed >= budget {
                self.core.tick();
                self.waiters.retain(|_, waiter| !waiter.is_canceled());
                budget = heartbeat;
            } else {
                budget -= elapsed;
            }

            if let Err(e) = self.on_ready().await {
                error!(node = self.id, "Stopping node driver: {}", e);
                self.server_shutdown.fire();
                return Err(e);
            }
            self.check_leadership();
        }

        info!(node = self.id, "Node driver stopped");
        self.server_shutdown.fire();
        Ok(())
    }

    async fn dispatch(&mut self, request: InboundRequest) {
        match request {
            InboundRequest::Propose { data, reply } => self.propose(data, reply),
            InboundRequest::ConfigChange { change, reply } => {
                self.propose_conf_change(change, Some(reply))
            }
            InboundRequest::Rerouted(Reroute::Propose { data, reply }) => self.propose(data, reply),
            InboundRequest::Rerouted(Reroute::ConfChange { change, reply }) => {
                self.propose_conf_change(change, Some(reply))
            }
            InboundRequest::RequestId { addr, reply } => {
                let result = if self.core.is_leader() {
                    RequestIdResult::Reserved {
                        leader_id: self.id,
                        reserved_id: self.peers.reserve_id(&addr),
                        peers: self.peers.members(),
                    }
                } else {
                    RequestIdResult::WrongLeader(self.leader_hint())
                };
                let _ = reply.send(result);
            }
            InboundRequest::Consensus(message) => self.step(*message),
            InboundRequest::ReportUnreachable { node_id } => self.on_unreachable(node_id),
            InboundRequest::ReportSnapshot { node_id, status } => {
                debug!(node = self.id, peer = node_id, ?status, "Snapshot sent");
                self.core.report_snapshot(node_id, status);
            }
            InboundRequest::MemberBootstrapReady {
                node_id,
                addr,
                reply,
            } => {
                info!(node = self.id, member = node_id, "Initial member ready");
                if let Err(e) = self.peers.add_known(node_id, &addr) {
                    warn!(node = self.id, member = node_id, "Bad member address: {}", e);
                }
                self.bootstrap_ready.insert(node_id);
                let _ = reply.send(());
            }
            InboundRequest::MembersConnected { members, reply } => {
                for (id, addr) in &members {
                    if let Err(e) = self.peers.connect(*id, addr) {
                        warn!(node = self.id, peer = *id, "Failed to connect peer: {}", e);
                    }
                }
                if let Some(sender) = self.members_connected.take() {
                    let _ = sender.send(());
                }
                let _ = reply.send(());
            }
            InboundRequest::Status { reply } => {
                let _ = reply.send(self.status());
            }
            InboundRequest::CreateSnapshot { reply } => {
                let result = self.create_snapshot().await;
                let _ = reply.send(result);
            }
            InboundRequest::TransferLeader { node_id, reply } => {
                if self.core.is_leader() {
                    info!(node = self.id, transferee = node_id, "Transferring leadership");
                    self.core.transfer_leader(node_id);
                    let _ = reply.send(Ok(()));
                } else {
                    let _ = reply.send(Err(self.leader_hint()));
                }
            }
            InboundRequest::Shutdown => {
                info!(node = self.id, "Shutdown requested");
                self.should_exit = true;
            }
        }
    }

    fn step(&mut self, message: Message) {
        let from = message.get_from();
        if let Err(e) = self.core.step(message) {
            debug!(node = self.id, peer = from, "Failed to step message: {}", e);
        }
    }

    // Entries proposed by a leader which has been deposed may never commit.
    // Their callers are told to go to the new leader.
    fn check_leadership(&mut self) {
        let is_leader = self.core.is_leader();
        if self.was_leader && !is_leader && !self.waiters.is_empty() {
            let hint = self.leader_hint();
            warn!(
                node = self.id,
                leader = hint.leader_id,
                pending = self.waiters.len(),
                "Lost leadership, answering pending proposals"
            );
            for (_, waiter) in self.waiters.drain() {
                waiter.wrong_leader(hint.clone());
            }
        }
        self.was_leader = is_leader;
    }

    fn leader_hint(&self) -> LeaderHint {
        let leader_id = self.core.leader_id();
        LeaderHint {
            leader_id,
            leader_addr: self.peers.addr(leader_id),
        }
    }

    fn next_proposal(&mut self) -> ProposalId {
        self.next_seq += 1;
        ProposalId {
            incarnation: self.incarnation,
            seq: self.next_seq,
        }
    }

    fn propose(&mut self, data: Bytes, reply: oneshot::Sender<ProposalResult>) {
        if !self.core.is_leader() {
            let _ = reply.send(ProposalResult::WrongLeader(self.leader_hint()));
            return;
        }

        let proposal = self.next_proposal();
        self.waiters.insert(proposal.seq, Waiter::Proposal(reply));
        if let Err(e) = self.core.propose(proposal.encode(), data.to_vec()) {
            warn!(node = self.id, "Proposal dropped: {}", e);
            if let Some(Waiter::Proposal(reply)) = self.waiters.remove(&proposal.seq) {
                let _ = reply.send(ProposalResult::Failed(e.to_string()));
            }
        }
    }

    // Proposes a membership change. Without a reply channel the result of the
    // change is only logged.
    fn propose_conf_change(
        &mut self,
        change: ConfChangeV2,
        reply: Option<oneshot::Sender<ConfigChangeResult>>,
    ) {
        if !self.core.is_leader() {
            if let Some(reply) = reply {
                let _ = reply.send(ConfigChangeResult::WrongLeader(self.leader_hint()));
            }
            return;
        }

        // Raft silently turns refused changes into empty entries, which would
        // leave the waiter hanging.
        if self.core.refuses_conf_change(&change) {
            debug!(node = self.id, "Refusing config change, another one is in progress");
            if let Some(reply) = reply {
                let _ = reply.send(ConfigChangeResult::Busy);
            }
            return;
        }

        let proposal = self.next_proposal();
        if let Some(reply) = reply {
            self.waiters
                .insert(proposal.seq, Waiter::ConfigChange(reply));
        }
        if let Err(e) = self.core.propose_conf_change(proposal.encode(), change) {
            warn!(node = self.id, "Config change dropped: {}", e);
            if let Some(Waiter::ConfigChange(reply)) = self.waiters.remove(&proposal.seq) {
                let _ = reply.send(ConfigChangeResult::Failed(e.to_string()));
            }
        }
    }

    // Called once a message delivery to the supplied peer exhausted all of
    // its retries.
    fn on_unreachable(&mut self, node_id: u64) {
        let Some(failures) = self.peers.record_failure(node_id) else {
            return;
        };

        match escalate(&self.config, failures) {
            Escalation::RemoveNode if self.core.is_leader() => {
                warn!(node = self.id, peer = node_id, failures, "Removing unreachable node");
                self.peers.reset_failures(node_id);
                self.propose_conf_change(remove_node_change(node_id), None);
            }
            _ => {
                debug!(node = self.id, peer = node_id, failures, "Peer unreachable");
                self.core.report_unreachable(node_id);
            }
        }
    }

    fn send_messages(&mut self, messages: Vec<Message>) {
        for message in messages {
            let to = message.get_to();
            match self.peers.client(to) {
                Some((client, failures)) => self.transport.send(to, client, failures, message),
                None => trace!(node = self.id, peer = to, "Dropping message to unknown peer"),
            }
        }
    }

    // Processes whatever the consensus core has accumulated: sends, persists
    // and applies in the order the core requires. Errors returned from here
    // are durability failures and must stop the node.
    async fn on_ready(&mut self) -> RaftResult<()> {
        if !self.core.has_ready() {
            return Ok(());
        }
        let mut ready = self.core.ready();

        self.send_messages(ready.take_messages());

        if !ready.snapshot().is_empty() {
            let snapshot = ready.snapshot().clone();
            info!(
                node = self.id,
                index = snapshot.get_metadata().get_index(),
                "Restoring state machine from snapshot"
            );
            self.fsm
                .lock()
                .await
                .restore(Bytes::copy_from_slice(snapshot.get_data()))
                .await
                .map_err(|e| RaftError::Internal(format!("failed to restore snapshot: {}", e)))?;
            self.storage.apply_snapshot(snapshot).await?;
        }

        self.storage.append(ready.entries()).await?;
        if let Some(hard_state) = ready.hs() {
            self.storage.set_hard_state(hard_state.clone()).await?;
        }

        self.send_messages(ready.take_persisted_messages());
        self.apply_committed(ready.take_committed_entries()).await?;

        let mut light = self.core.advance(ready);
        if let Some(commit) = light.commit_index() {
            self.storage.set_commit_index(commit).await?;
        }
        self.send_messages(light.take_messages());
        self.apply_committed(light.take_committed_entries()).await?;
        self.core.advance_apply();
        Ok(())
    }

    async fn apply_committed(&mut self, entries: Vec<Entry>) -> RaftResult<()> {
        for entry in entries {
            match CommittedEntry::decode(&entry)? {
                CommittedEntry::Empty => {}
                CommittedEntry::Normal {
                    index,
                    term,
                    proposal,
                    data,
                } => self.apply_normal(index, term, proposal, data).await,
                CommittedEntry::ConfChange {
                    index,
                    term,
                    proposal,
                    change,
                } => self.apply_conf_change(index, term, proposal, change).await?,
            }
        }
        Ok(())
    }

    // Removes and returns the waiter for an entry proposed by this process.
    fn take_waiter(&mut self, proposal: Option<ProposalId>) -> Option<Waiter> {
        let proposal = proposal?;
        if proposal.incarnation != self.incarnation {
            return None;
        }
        self.waiters.remove(&proposal.seq)
    }

    async fn apply_normal(&mut self, index: u64, term: u64, proposal: Option<ProposalId>, data: Bytes) {
        let result = self.fsm.lock().await.apply(data).await;
        if let Err(e) = &result {
            warn!(node = self.id, index, "Failed to apply entry: {}", e);
        }

        match self.take_waiter(proposal) {
            Some(Waiter::Proposal(reply)) => {
                let response = match result {
                    Ok(output) => ProposalResult::Applied(output),
                    Err(e) => ProposalResult::Failed(e.to_string()),
                };
                let _ = reply.send(response);
            }
            Some(Waiter::ConfigChange(reply)) => {
                let _ = reply.send(ConfigChangeResult::Failed(
                    "proposal resolved by a normal entry".to_string(),
                ));
            }
            None => {}
        }

        self.maybe_snapshot(index, term).await;
    }

    async fn apply_conf_change(
        &mut self,
        index: u64,
        term: u64,
        proposal: Option<ProposalId>,
        change: ConfChangeV2,
    ) -> RaftResult<()> {
        let mut removed_self = false;
        let outcome = match self.core.apply_conf_change(&change) {
            Ok(conf_state) => {
                info!(
                    node = self.id,
                    index,
                    voters = ?conf_state.get_voters(),
                    learners = ?conf_state.get_learners(),
                    joint = !conf_state.get_voters_outgoing().is_empty(),
                    "Applied config change"
                );
                self.storage.set_conf_state(conf_state).await?;
                let (added, removed) = self.update_peers(index, &change);
                removed_self = removed;
                match added {
                    Some(assigned_id) => ConfigChangeResult::JoinSuccess {
                        assigned_id,
                        peers: self.peers.members(),
                    },
                    None => ConfigChangeResult::Ok,
                }
            }
            Err(e) => {
                error!(node = self.id, index, "Failed to apply config change: {}", e);
                ConfigChangeResult::Failed(e.to_string())
            }
        };

        if removed_self {
            info!(node = self.id, "Removed from the cluster, shutting down");
            self.should_exit = true;
            self.server_shutdown.fire();
        }

        match outcome {
            ConfigChangeResult::Failed(_) => self.maybe_snapshot(index, term).await,
            _ if removed_self => {}
            // A node catching up from a snapshot refuses one which does not
            // list it as a member.
            _ => {
                self.last_snapshot = Instant::now();
                if let Err(e) = self.snapshot_at(index, term).await {
                    warn!(node = self.id, index, "Failed to snapshot config change: {}", e);
                }
            }
        }

        match self.take_waiter(proposal) {
            Some(Waiter::ConfigChange(reply)) => {
                let _ = reply.send(outcome);
            }
            Some(Waiter::Proposal(reply)) => {
                let _ = reply.send(ProposalResult::Failed(
                    "proposal resolved by a config change".to_string(),
                ));
            }
            None => {}
        }
        Ok(())
    }

    // Brings the peer table in line with an applied membership change.
    // Returns the first node added by the change and whether it removed this
    // node.
    fn update_peers(&mut self, index: u64, change: &ConfChangeV2) -> (Option<u64>, bool) {
        let addresses = decode_change_context(change.get_context()).unwrap_or_else(|e| {
            warn!(node = self.id, index, "Ignoring undecodable change context: {}", e);
            MemberAddresses::new()
        });

        let mut added = None;
        let mut removed_self = false;
        for single in change.get_changes() {
            let node_id = single.get_node_id();
            match single.get_change_type() {
                ConfChangeType::AddNode | ConfChangeType::AddLearnerNode => {
                    added = added.or(Some(node_id));
                    if node_id == self.id {
                        continue;
                    }
                    match addresses.get(&node_id) {
                        Some(addr) => {
                            if let Err(e) = self.peers.connect(node_id, addr) {
                                warn!(node = self.id, peer = node_id, "Failed to connect peer: {}", e);
                            }
                        }
                        None => warn!(node = self.id, peer = node_id, "Added node without address"),
                    }
                }
                ConfChangeType::RemoveNode => {
                    if node_id == self.id {
                        removed_self = true;
                    } else {
                        self.peers.remove(node_id);
                    }
                }
            }
        }
        (added, removed_self)
    }

    // Takes a snapshot at the supplied entry if the snapshot interval has
    // passed. Failures are logged, the log remains the source of truth.
    async fn maybe_snapshot(&mut self, index: u64, term: u64) {
        let Some(interval) = self.config.snapshot_interval else {
            return;
        };
        if self.last_snapshot.elapsed() < interval {
            return;
        }
        self.last_snapshot = Instant::now();
        if let Err(e) = self.snapshot_at(index, term).await {
            warn!(node = self.id, index, "Failed to create snapshot: {}", e);
        }
    }

    async fn snapshot_at(&mut self, index: u64, term: u64) -> RaftResult<()> {
        let data = self
            .fsm
            .lock()
            .await
            .snapshot()
            .await
            .map_err(|e| RaftError::Internal(e.to_string()))?;
        if self.config.use_log_compaction {
            self.storage.compact(self.core.applied()).await?;
        }
        self.storage.create_snapshot(data, index, term).await
    }

    // Snapshots the state machine at the last applied entry.
    async fn create_snapshot(&mut self) -> RaftResult<()> {
        let applied = self.core.applied();
        let term = self.storage.term(applied)?;
        self.last_snapshot = Instant::now();
        self.snapshot_at(applied, term).await
    }

    fn status(&self) -> NodeStatus {
        NodeStatus {
            id: self.id,
            leader_id: self.core.leader_id(),
            term: self.core.term(),
            is_leader: self.core.is_leader(),
            applied: self.core.applied(),
            joint: self.core.is_joint(),
            peers: self.peers.infos(),
            bootstrap_ready: self.bootstrap_ready.iter().copied().collect(),
        }
    }
}

fn new_raw_node(config: &RaftConfig, id: u64, storage: LogStore) -> RaftResult<RawNode<LogStore>> {
    let raft_config = config.to_raft_config(id)?;
    let logger = Logger::root(Discard, o!());
    Ok(RawNode::new(&raft_config, storage, &logger)?)
}

// The configuration every node starts out with: the bootstrap leader as the
// only voter. Sits at index 0, so the leader's log starts at index 1 and any
// empty node can be caught up by plain log replication.
fn initial_snapshot() -> Snapshot {
    let mut snapshot = Snapshot::default();
    snapshot
        .mut_metadata()
        .set_conf_state(ConfState::from((vec![BOOTSTRAP_LEADER_ID], vec![])));
    snapshot
}

pub fn remove_node_change(node_id: u64) -> ConfChangeV2 {
    let mut single = ConfChangeSingle::default();
    single.set_change_type(ConfChangeType::RemoveNode);
    single.set_node_id(node_id);
    let mut change = ConfChangeV2::default();
    change.set_changes(vec![single].into());
    change
}
