use raft::prelude::{ConfChangeSingle, ConfChangeType, ConfChangeV2};
use std::collections::VecDeque;
use tokio::time::{sleep, timeout};
use tonic::Request;
use tracing::{debug, info, warn};

use crate::raft::client::ClusterClient;
use crate::raft::config::RaftConfig;
use crate::raft::error::{RaftError, RaftResult};
use crate::raft::message::{MemberAddresses, encode_change_context, from_members};
use crate::raft::peers::connect_lazy;
use crate::raft::raft_service_proto::{RequestIdArgs, RequestIdResponse, ResultCode};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FollowerRole {
    Voter,
    Learner,
}

impl FollowerRole {
    fn change_type(self) -> ConfChangeType {
        match self {
            FollowerRole::Voter => ConfChangeType::AddNode,
            FollowerRole::Learner => ConfChangeType::AddLearnerNode,
        }
    }
}

// Everything a node needs to join a running cluster: the id the leader has
// reserved for it and the current members.
#[derive(Debug, Clone, PartialEq)]
pub struct ClusterJoinTicket {
    pub reserved_id: u64,
    pub raft_addr: String,
    pub leader_id: u64,
    pub leader_addr: String,
    pub peers: MemberAddresses,
}

// Asks the cluster reachable through "seeds" for a node id. Seeds are tried
// in order, redirects to the leader are followed. Fails with LeaderNotFound
// once all seeds are exhausted.
pub async fn request_id(
    raft_addr: &str,
    seeds: &[String],
    config: &RaftConfig,
) -> RaftResult<ClusterJoinTicket> {
    let mut candidates: VecDeque<String> = seeds.iter().cloned().collect();
    let mut redirects = 0;

    while let Some(target) = candidates.front().cloned() {
        let response = match ask_for_id(&target, raft_addr, config).await {
            Ok(response) => response,
            Err(e) => {
                debug!(seed = %target, "Seed unavailable: {}", e);
                candidates.pop_front();
                continue;
            }
        };

        match ResultCode::try_from(response.result) {
            Ok(ResultCode::Success) => {
                let ticket = ClusterJoinTicket {
                    reserved_id: response.reserved_id,
                    raft_addr: raft_addr.to_string(),
                    leader_id: response.leader_id,
                    leader_addr: target,
                    peers: from_members(&response.peers),
                };
                info!(
                    reserved_id = ticket.reserved_id,
                    leader = ticket.leader_id,
                    "Reserved node id"
                );
                return Ok(ticket);
            }
            Ok(ResultCode::WrongLeader) => {
                redirects += 1;
                if redirects > config.join_max_attempts {
                    break;
                }
                if response.leader_address.is_empty() || response.leader_address == target {
                    // No leader known yet, ask again later.
                    sleep(config.join_retry_interval).await;
                } else {
                    debug!(from = %target, to = %response.leader_address, "Redirected to leader");
                    candidates.pop_front();
                    candidates.push_front(response.leader_address);
                }
            }
            _ => {
                return Err(RaftError::Unknown(format!(
                    "id request to {} failed: {}",
                    target, response.error
                )));
            }
        }
    }

    warn!(seeds = ?seeds, "No leader found");
    Err(RaftError::LeaderNotFound)
}

async fn ask_for_id(
    target: &str,
    raft_addr: &str,
    config: &RaftConfig,
) -> RaftResult<RequestIdResponse> {
    let mut client = connect_lazy(target)?;
    let mut request = Request::new(RequestIdArgs {
        address: raft_addr.to_string(),
    });
    request.set_timeout(config.message_timeout);
    match timeout(config.message_timeout, client.request_id(request)).await {
        Ok(Ok(response)) => Ok(response.into_inner()),
        Ok(Err(status)) => Err(RaftError::rpc(target, status)),
        Err(_) => Err(RaftError::Timeout(format!("id request to {}", target))),
    }
}

// Proposes adding the ticket's node to the cluster. Returns the members once
// the change has been applied on the leader. The local node must already be
// serving, the leader starts replicating to it right away.
pub async fn join_cluster(
    ticket: &ClusterJoinTicket,
    role: FollowerRole,
    config: &RaftConfig,
) -> RaftResult<MemberAddresses> {
    let change = self_join_change(ticket, role);
    let client = ClusterClient::new(
        &format!("node-{}", ticket.reserved_id),
        &ticket.leader_addr,
        config.message_timeout,
    )
    .with_retry(config.join_retry_interval, config.join_max_attempts);

    let members = client
        .change_config(&change)
        .await
        .map_err(|e| RaftError::Join(e.to_string()))?;
    info!(node = ticket.reserved_id, ?role, "Joined the cluster");
    Ok(members)
}

fn self_join_change(ticket: &ClusterJoinTicket, role: FollowerRole) -> ConfChangeV2 {
    let mut single = ConfChangeSingle::default();
    single.set_change_type(role.change_type());
    single.set_node_id(ticket.reserved_id);

    let mut addresses = MemberAddresses::new();
    addresses.insert(ticket.reserved_id, ticket.raft_addr.clone());

    let mut change = ConfChangeV2::default();
    change.set_changes(vec![single].into());
    change.set_context(encode_change_context(&addresses).into());
    change
}
