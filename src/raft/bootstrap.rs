use futures::channel::oneshot;
use raft::prelude::{ConfChangeSingle, ConfChangeTransition, ConfChangeType, ConfChangeV2};
use std::collections::BTreeSet;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tonic::Request;
use tracing::{Instrument, debug, info, info_span, warn};

use crate::raft::config::RaftConfig;
use crate::raft::driver::BOOTSTRAP_LEADER_ID;
use crate::raft::error::{RaftError, RaftResult};
use crate::raft::handle::RaftHandle;
use crate::raft::message::{
    ConfigChangeResult, LeaderHint, MemberAddresses, encode_change_context, to_members,
};
use crate::raft::peers::connect_lazy;
use crate::raft::raft_service_proto::{ClusterBootstrapReadyArgs, MemberBootstrapReadyArgs};

const INITIAL_DELAY: Duration = Duration::from_secs(1);
const POLL_INTERVAL: Duration = Duration::from_secs(2);

// Runs once on the bootstrap leader. Waits for every initial member to report
// in, then adds all of them in a single joint membership change.
pub struct BootstrapCoordinator {
    handle: RaftHandle,
    initial_peers: MemberAddresses,
    bootstrap_timeout: Duration,
    message_timeout: Duration,
    poll_interval: Duration,
}

impl BootstrapCoordinator {
    pub fn new(handle: RaftHandle, initial_peers: MemberAddresses, config: &RaftConfig) -> Self {
        let mut initial_peers = initial_peers;
        initial_peers.remove(&BOOTSTRAP_LEADER_ID);
        BootstrapCoordinator {
            handle,
            initial_peers,
            bootstrap_timeout: config.bootstrap_timeout,
            message_timeout: config.message_timeout,
            poll_interval: POLL_INTERVAL,
        }
    }

    pub async fn run(self) -> RaftResult<()> {
        if self.initial_peers.is_empty() {
            return Ok(());
        }

        sleep(INITIAL_DELAY).await;
        self.wait_for_members().await?;

        let members = self.commit_joint_change().await?;
        info!(members = ?members.keys(), "Initial members committed");
        for (id, addr) in &self.initial_peers {
            self.notify_member(*id, addr, &members).await?;
        }

        // Leaving the joint configuration can take a while, nobody waits on it.
        let handle = self.handle.clone();
        let retry_interval = self.poll_interval;
        tokio::spawn(
            async move {
                if let Err(e) = leave_joint(handle, retry_interval).await {
                    warn!("Gave up leaving the joint configuration: {}", e);
                }
            }
            .instrument(info_span!("leave_joint")),
        );
        Ok(())
    }

    async fn wait_for_members(&self) -> RaftResult<()> {
        let expected: BTreeSet<u64> = self.initial_peers.keys().copied().collect();
        loop {
            let status = self.handle.status().await?;
            let ready: BTreeSet<u64> = status.bootstrap_ready.into_iter().collect();
            let missing: Vec<u64> = expected.difference(&ready).copied().collect();
            if missing.is_empty() {
                return Ok(());
            }
            debug!(?missing, "Waiting for initial members");
            sleep(self.poll_interval).await;
        }
    }

    async fn commit_joint_change(&self) -> RaftResult<MemberAddresses> {
        let change = joint_add_change(&self.initial_peers);
        let result = timeout(self.bootstrap_timeout, self.propose_until_accepted(change))
            .await
            .map_err(|_| {
                RaftError::Bootstrap(format!(
                    "initial members not committed within {:?}",
                    self.bootstrap_timeout
                ))
            })?
            .map_err(|e| RaftError::Bootstrap(e.to_string()))?;

        match result {
            ConfigChangeResult::JoinSuccess { peers, .. } => Ok(peers),
            ConfigChangeResult::Ok => Ok(self.initial_peers.clone()),
            ConfigChangeResult::WrongLeader(hint) => Err(RaftError::Bootstrap(format!(
                "lost leadership to node {} during bootstrap",
                hint.leader_id
            ))),
            ConfigChangeResult::Busy => Err(RaftError::Bootstrap(
                "another membership change is in progress".to_string(),
            )),
            ConfigChangeResult::Failed(error) => Err(RaftError::Bootstrap(error)),
        }
    }

    // Retries while the leader is still applying an earlier change.
    async fn propose_until_accepted(&self, change: ConfChangeV2) -> RaftResult<ConfigChangeResult> {
        loop {
            match self.handle.change_config(change.clone()).await? {
                ConfigChangeResult::Busy => sleep(INITIAL_DELAY).await,
                result => return Ok(result),
            }
        }
    }

    // Hands the final member list to an initial member, which unblocks it.
    async fn notify_member(&self, id: u64, addr: &str, members: &MemberAddresses) -> RaftResult<()> {
        let mut client = connect_lazy(addr)?;
        let mut request = Request::new(ClusterBootstrapReadyArgs {
            peers: to_members(members),
        });
        request.set_timeout(self.message_timeout);
        client
            .cluster_bootstrap_ready(request)
            .await
            .map_err(|status| RaftError::Bootstrap(format!("node {}: {}", id, status)))?;
        debug!(member = id, "Notified initial member");
        Ok(())
    }
}

// Proposes the change which leaves the joint configuration until the local
// node sees a configuration which is no longer joint. Requests landing on a
// follower are forwarded to the leader it names. Only gives up once the local
// node is gone.
async fn leave_joint(handle: RaftHandle, retry_interval: Duration) -> RaftResult<()> {
    let change = ConfChangeV2::default();
    loop {
        match handle.status().await {
            Ok(status) if !status.joint => {
                info!("Left joint configuration");
                return Ok(());
            }
            Err(RaftError::Shutdown) => return Err(RaftError::Shutdown),
            _ => {}
        }

        match handle.change_config(change.clone()).await {
            Ok(ConfigChangeResult::Ok) => {
                info!("Left joint configuration");
                return Ok(());
            }
            Ok(ConfigChangeResult::WrongLeader(LeaderHint {
                leader_addr: Some(addr),
                ..
            })) => match handle.client(&addr).change_config(&change).await {
                Ok(_) => {
                    info!(leader = %addr, "Left joint configuration");
                    return Ok(());
                }
                Err(e) => debug!(leader = %addr, "Leader did not leave joint configuration: {}", e),
            },
            Ok(other) => debug!("Joint configuration not left yet: {:?}", other),
            Err(RaftError::Shutdown) => return Err(RaftError::Shutdown),
            Err(e) => debug!("Failed to leave joint configuration: {}", e),
        }
        sleep(retry_interval).await;
    }
}

// Builds a single change which enters a joint configuration adding all of the
// supplied nodes as voters. The configuration is only left explicitly.
fn joint_add_change(members: &MemberAddresses) -> ConfChangeV2 {
    let changes: Vec<ConfChangeSingle> = members
        .keys()
        .map(|id| {
            let mut single = ConfChangeSingle::default();
            single.set_change_type(ConfChangeType::AddNode);
            single.set_node_id(*id);
            single
        })
        .collect();
    let mut change = ConfChangeV2::default();
    change.set_transition(ConfChangeTransition::Explicit);
    change.set_changes(changes.into());
    change.set_context(encode_change_context(members).into());
    change
}

// The initial member side of the bootstrap: reports to the leader until it
// answers, then waits until the leader signals that the membership committed.
pub async fn await_bootstrap(
    node_id: u64,
    addr: &str,
    leader_addr: &str,
    members_connected: oneshot::Receiver<()>,
    config: &RaftConfig,
) -> RaftResult<()> {
    let mut client = connect_lazy(leader_addr)?;
    let mut attempt = 0;
    loop {
        attempt += 1;
        let mut request = Request::new(MemberBootstrapReadyArgs {
            follower_id: node_id,
            address: addr.to_string(),
        });
        request.set_timeout(config.message_timeout);
        match client.member_bootstrap_ready(request).await {
            Ok(_) => break,
            Err(status) if attempt < config.join_max_attempts => {
                debug!(attempt, "Leader not ready yet: {}", status.message());
                sleep(config.join_retry_interval).await;
            }
            Err(status) => {
                return Err(RaftError::Bootstrap(format!(
                    "leader at {} unreachable: {}",
                    leader_addr, status
                )));
            }
        }
    }

    info!(node = node_id, "Waiting for the cluster to form");
    members_connected
        .await
        .map_err(|_| RaftError::Bootstrap("node stopped before the cluster formed".to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::message::{InboundRequest, NodeStatus, decode_change_context};
    use std::sync::Arc;
    use std::sync::atomic::{AtomicU32, Ordering};

    #[test]
    fn test_joint_add_change() {
        let mut members = MemberAddresses::new();
        members.insert(2, "127.0.0.1:2".to_string());
        members.insert(3, "127.0.0.1:3".to_string());

        let change = joint_add_change(&members);
        assert_eq!(change.get_transition(), ConfChangeTransition::Explicit);
        let ids: Vec<u64> = change.get_changes().iter().map(|c| c.get_node_id()).collect();
        assert_eq!(ids, vec![2, 3]);
        assert!(
            change
                .get_changes()
                .iter()
                .all(|c| c.get_change_type() == ConfChangeType::AddNode)
        );
        assert_eq!(decode_change_context(change.get_context()).expect("context"), members);
    }

    #[tokio::test]
    async fn test_leave_joint_retries_until_left() {
        let (sender, receiver) = async_std::channel::bounded(10);
        let handle = RaftHandle::new(1, sender, Duration::from_millis(100));
        let proposals = Arc::new(AtomicU32::new(0));

        // Times out once, is told there is no leader once, then succeeds.
        let counter = proposals.clone();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok(request) = receiver.recv().await {
                match request {
                    InboundRequest::Status { reply } => {
                        let _ = reply.send(status(true));
                    }
                    InboundRequest::ConfigChange { change, reply } => {
                        assert!(change.get_changes().is_empty());
                        match counter.fetch_add(1, Ordering::SeqCst) {
                            0 => held.push(reply),
                            1 => {
                                let _ = reply.send(ConfigChangeResult::WrongLeader(LeaderHint {
                                    leader_id: 0,
                                    leader_addr: None,
                                }));
                            }
                            _ => {
                                let _ = reply.send(ConfigChangeResult::Ok);
                            }
                        }
                    }
                    _ => {}
                }
            }
        });

        let result = timeout(
            Duration::from_secs(5),
            leave_joint(handle, Duration::from_millis(10)),
        )
        .await
        .expect("timeout");
        assert!(result.is_ok());
        assert_eq!(proposals.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_leave_joint_stops_once_config_is_simple() {
        let (sender, receiver) = async_std::channel::bounded(10);
        let handle = RaftHandle::new(1, sender, Duration::from_millis(100));

        // The change committed, but its answer got lost. Proposing it again
        // is refused for good.
        let statuses = Arc::new(AtomicU32::new(0));
        let counter = statuses.clone();
        tokio::spawn(async move {
            while let Ok(request) = receiver.recv().await {
                match request {
                    InboundRequest::Status { reply } => {
                        let joint = counter.fetch_add(1, Ordering::SeqCst) < 2;
                        let _ = reply.send(status(joint));
                    }
                    InboundRequest::ConfigChange { reply, .. } => {
                        let _ = reply.send(ConfigChangeResult::Busy);
                    }
                    _ => {}
                }
            }
        });

        let result = timeout(
            Duration::from_secs(5),
            leave_joint(handle, Duration::from_millis(10)),
        )
        .await
        .expect("timeout");
        assert!(result.is_ok());
        assert_eq!(statuses.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn test_leave_joint_gives_up_without_node() {
        let (sender, receiver) = async_std::channel::bounded(10);
        let handle = RaftHandle::new(1, sender, Duration::from_millis(100));
        drop(receiver);

        let result = leave_joint(handle, Duration::from_millis(10)).await;
        assert!(matches!(result, Err(RaftError::Shutdown)));
    }

    fn status(joint: bool) -> NodeStatus {
        NodeStatus {
            id: 1,
            leader_id: 1,
            term: 1,
            is_leader: true,
            applied: 3,
            joint,
            peers: Vec::new(),
            bootstrap_ready: Vec::new(),
        }
    }

    #[test]
    fn test_leader_is_not_a_bootstrap_member() {
        let (sender, _receiver) = async_std::channel::bounded(1);
        let handle = RaftHandle::new(1, sender, Duration::from_secs(1));
        let mut peers = MemberAddresses::new();
        peers.insert(1, "127.0.0.1:1".to_string());
        peers.insert(2, "127.0.0.1:2".to_string());

        let coordinator = BootstrapCoordinator::new(handle, peers, &RaftConfig::default());
        assert_eq!(coordinator.initial_peers.keys().copied().collect::<Vec<_>>(), vec![2]);
    }
}
