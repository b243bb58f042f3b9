use async_std::channel::Sender;
use bytes::Bytes;
use futures::channel::oneshot;
use raft::prelude::ConfChangeV2;
use std::time::Duration;
use tokio::time::timeout;

use crate::raft::client::ClusterClient;
use crate::raft::driver::remove_node_change;
use crate::raft::error::{RaftError, RaftResult};
use crate::raft::message::{
    ConfigChangeResult, InboundRequest, MemberAddresses, NodeStatus, ProposalResult,
};
use crate::raft::peers::PeerInfo;

// A cheap to clone handle used to talk to a running node. Requests go through
// the node driver's inbound queue, answers come back on one-shot channels.
#[derive(Clone)]
pub struct RaftHandle {
    node_id: u64,
    queue: Sender<InboundRequest>,
    request_timeout: Duration,
}

impl RaftHandle {
    pub(crate) fn new(node_id: u64, queue: Sender<InboundRequest>, request_timeout: Duration) -> Self {
        RaftHandle {
            node_id,
            queue,
            request_timeout,
        }
    }

    pub fn node_id(&self) -> u64 {
        self.node_id
    }

    async fn ask<T>(
        &self,
        request: impl FnOnce(oneshot::Sender<T>) -> InboundRequest,
    ) -> RaftResult<T> {
        let (reply, receiver) = oneshot::channel();
        self.queue
            .send(request(reply))
            .await
            .map_err(|_| RaftError::Shutdown)?;
        match timeout(self.request_timeout, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::Timeout(format!(
                "node {} did not answer within {:?}",
                self.node_id, self.request_timeout
            ))),
        }
    }

    // Appends the supplied payload to the replicated log and returns the
    // output of the state machine once it has been applied. If this node is
    // not the leader, the request is forwarded to the leader.
    pub async fn propose(&self, data: impl Into<Bytes>) -> RaftResult<Bytes> {
        let data = data.into();
        let payload = data.clone();
        let result = self
            .ask(|reply| InboundRequest::Propose {
                data: payload,
                reply,
            })
            .await?;
        match result {
            ProposalResult::Applied(output) => Ok(output),
            ProposalResult::Failed(error) => Err(RaftError::Internal(error)),
            ProposalResult::WrongLeader(hint) => match hint.leader_addr {
                Some(addr) => self.client(&addr).propose(data).await,
                None => Err(RaftError::LeaderNotFound),
            },
        }
    }

    // Proposes a membership change on this node. Does not forward.
    pub async fn change_config(&self, change: ConfChangeV2) -> RaftResult<ConfigChangeResult> {
        self.ask(|reply| InboundRequest::ConfigChange { change, reply })
            .await
    }

    // Removes this node from the cluster. The node stops once the removal is
    // applied locally.
    pub async fn leave(&self) -> RaftResult<()> {
        let change = remove_node_change(self.node_id);
        match self.change_config(change.clone()).await? {
            ConfigChangeResult::Ok | ConfigChangeResult::JoinSuccess { .. } => Ok(()),
            ConfigChangeResult::Failed(error) => Err(RaftError::Internal(error)),
            ConfigChangeResult::Busy => Err(RaftError::Internal(
                "another membership change is in progress".to_string(),
            )),
            ConfigChangeResult::WrongLeader(hint) => match hint.leader_addr {
                Some(addr) => self.client(&addr).change_config(&change).await.map(|_| ()),
                None => Err(RaftError::LeaderNotFound),
            },
        }
    }

    pub async fn status(&self) -> RaftResult<NodeStatus> {
        self.ask(|reply| InboundRequest::Status { reply }).await
    }

    // Returns the id of the current leader, 0 if there is none.
    pub async fn leader_id(&self) -> RaftResult<u64> {
        Ok(self.status().await?.leader_id)
    }

    pub async fn is_leader(&self) -> RaftResult<bool> {
        Ok(self.status().await?.is_leader)
    }

    pub async fn peers(&self) -> RaftResult<Vec<PeerInfo>> {
        Ok(self.status().await?.peers)
    }

    // Snapshots the state machine at the last applied entry.
    pub async fn create_snapshot(&self) -> RaftResult<()> {
        self.ask(|reply| InboundRequest::CreateSnapshot { reply })
            .await?
    }

    pub async fn transfer_leader(&self, node_id: u64) -> RaftResult<()> {
        self.ask(|reply| InboundRequest::TransferLeader { node_id, reply })
            .await?
            .map_err(RaftError::from)
    }

    // Tells the node driver that the supplied nodes are committed members.
    pub(crate) async fn members_connected(&self, members: MemberAddresses) -> RaftResult<()> {
        self.ask(|reply| InboundRequest::MembersConnected { members, reply })
            .await
    }

    // Asks the node driver to stop. Returns once the request is queued.
    pub async fn shutdown(&self) -> RaftResult<()> {
        self.queue
            .send(InboundRequest::Shutdown)
            .await
            .map_err(|_| RaftError::Shutdown)
    }

    pub(crate) fn client(&self, leader_addr: &str) -> ClusterClient {
        ClusterClient::new(&format!("node-{}", self.node_id), leader_addr, self.request_timeout)
    }
}
