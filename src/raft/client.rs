use async_std::sync::Mutex;
use bytes::Bytes;
use futures::Future;
use protobuf::Message as PbMessage;
use raft::prelude::ConfChangeV2;
use std::time::Duration;
use tokio::time::{sleep, timeout};
use tonic::Request;
use tracing::debug;

use crate::raft::client::Outcome::{Failure, NewLeader, Retry, Success};
use crate::raft::error::{RaftError, RaftResult};
use crate::raft::message::{MemberAddresses, from_members};
use crate::raft::peers::connect_lazy;
use crate::raft::raft_service_proto::{
    ChangeConfigArgs, RaftMessageResponse, RerouteKind, RerouteMessageArgs, ResultCode,
};

// Talks to the leader of a raft cluster on behalf of a node which is not (or
// not yet) a member, or which is not the leader itself. Requests which land
// on a follower get redirected and are retried against the named leader.
pub struct ClusterClient {
    // Used for logging only.
    name: String,

    // Our current best guess as to who is the leader.
    leader: Mutex<String>,

    request_timeout: Duration,
    retry_interval: Duration,

    // The number of times to try and redirect the request to a new leader
    // before failing.
    max_leader_follow_attempts: u32,
}

// The outcome of an individual request sent to one member of the cluster.
// Used to facilitate retries which follow the leader around.
enum Outcome<T> {
    // The request has completed successfully and yielded a result.
    Success(T),

    // The request failed (permanently) and should not be retried.
    Failure(RaftError),

    // The request landed on a follower. Carries the leader's address if the
    // follower knows it.
    NewLeader(Option<String>),

    // The request did not complete in time and may be retried as is.
    Retry,
}

impl ClusterClient {
    // Returns a client which initially contacts "member". Any member will do,
    // it redirects us if necessary.
    pub fn new(name: &str, member: &str, request_timeout: Duration) -> Self {
        ClusterClient {
            name: name.to_string(),
            leader: Mutex::new(member.to_string()),
            request_timeout,
            retry_interval: Duration::from_millis(300),
            max_leader_follow_attempts: 10,
        }
    }

    pub fn with_retry(self, retry_interval: Duration, max_attempts: u32) -> Self {
        ClusterClient {
            retry_interval,
            max_leader_follow_attempts: max_attempts.max(1),
            ..self
        }
    }

    pub async fn leader(&self) -> String {
        self.leader.lock().await.clone()
    }

    async fn update_leader(&self, leader: &str) {
        let mut locked = self.leader.lock().await;
        *locked = leader.to_string();
        debug!(name = %self.name, leader, "Updated leader");
    }

    // Retries the supplied operation a bounded number of times, following the
    // leader as it changes.
    async fn retry_helper<T, Fut>(&self, operation: impl Fn(String) -> Fut) -> RaftResult<T>
    where
        Fut: Future<Output = Outcome<T>>,
    {
        let mut leader = self.leader().await;
        let attempts = self.max_leader_follow_attempts;
        for _ in 0..attempts {
            match operation(leader.clone()).await {
                Failure(error) => return Err(error),
                Success(result) => return Ok(result),
                NewLeader(Some(new_leader)) => {
                    self.update_leader(&new_leader).await;
                    leader = new_leader;
                }
                // No leader elected yet or the request timed out, just retry.
                NewLeader(None) | Retry => (),
            }
            sleep(self.retry_interval).await;
        }
        debug!(name = %self.name, attempts, "Giving up on finding the leader");
        Err(RaftError::LeaderNotFound)
    }

    // Has the leader propose the supplied payload. Returns the output of the
    // state machine once the entry has been applied on the leader.
    pub async fn propose(&self, data: Bytes) -> RaftResult<Bytes> {
        let data = &data;
        self.retry_helper(|leader| async move {
            let args = RerouteMessageArgs {
                kind: RerouteKind::Propose.into(),
                proposed_data: data.to_vec(),
                ..Default::default()
            };
            match self.reroute(&leader, args).await {
                Ok(response) => match ResultCode::try_from(response.result) {
                    Ok(ResultCode::Success) => Success(Bytes::from(response.data)),
                    Ok(ResultCode::WrongLeader) => NewLeader(non_empty(response.leader_address)),
                    Ok(ResultCode::TimeoutError) => Retry,
                    _ => Failure(RaftError::Internal(response.error)),
                },
                Err(outcome) => outcome,
            }
        })
        .await
    }

    // Has the leader propose the supplied membership change. Returns the
    // addresses of all members once the change has been applied on the
    // leader. Timeouts are retried, any other failure is final.
    pub async fn change_config(&self, change: &ConfChangeV2) -> RaftResult<MemberAddresses> {
        let encoded = change.write_to_bytes()?;
        let encoded = &encoded;
        self.retry_helper(|leader| async move {
            let mut client = match connect_lazy(&leader) {
                Ok(client) => client,
                Err(e) => return Failure(e),
            };
            let mut request = Request::new(ChangeConfigArgs {
                conf_change: encoded.clone(),
            });
            request.set_timeout(self.request_timeout);

            let response = match timeout(self.request_timeout, client.change_config(request)).await {
                Ok(Ok(response)) => response.into_inner(),
                Ok(Err(status)) => return Failure(RaftError::rpc(&leader, status)),
                Err(_) => return Retry,
            };
            match ResultCode::try_from(response.result) {
                Ok(ResultCode::Success) => Success(from_members(&response.peers)),
                Ok(ResultCode::WrongLeader) => NewLeader(non_empty(response.leader_address)),
                Ok(ResultCode::TimeoutError) | Ok(ResultCode::Busy) => {
                    debug!(name = %self.name, leader, "Config change not applied yet, retrying");
                    Retry
                }
                _ => Failure(RaftError::Internal(response.error)),
            }
        })
        .await
    }

    async fn reroute(
        &self,
        leader: &str,
        args: RerouteMessageArgs,
    ) -> Result<RaftMessageResponse, Outcome<Bytes>> {
        let mut client = connect_lazy(leader).map_err(Failure)?;
        let mut request = Request::new(args);
        request.set_timeout(self.request_timeout);
        match timeout(self.request_timeout, client.reroute_message(request)).await {
            Ok(Ok(response)) => Ok(response.into_inner()),
            Ok(Err(status)) => Err(Failure(RaftError::rpc(leader, status))),
            Err(_) => Err(Retry),
        }
    }
}

fn non_empty(address: String) -> Option<String> {
    if address.is_empty() { None } else { Some(address) }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::raft_service_proto::raft_service_server::RaftServiceServer;
    use crate::testing::rpc_server::TestRpcServer;
    use crate::testing::services::FakeLeaderService;

    #[tokio::test]
    async fn test_propose_follows_leader() {
        let leader = TestRpcServer::run(RaftServiceServer::new(FakeLeaderService::leader())).await;
        let leader_addr = leader.address().expect("address");
        let follower = TestRpcServer::run(RaftServiceServer::new(FakeLeaderService::follower(
            &leader_addr,
        )))
        .await;

        let client = ClusterClient::new(
            "test",
            &follower.address().expect("address"),
            Duration::from_secs(1),
        )
        .with_retry(Duration::from_millis(10), 5);

        let result = client.propose(Bytes::from("data")).await.expect("propose");
        assert_eq!(result, Bytes::from("data"));
        assert_eq!(client.leader().await, leader_addr);
    }

    #[tokio::test]
    async fn test_change_config_returns_members() {
        let leader = TestRpcServer::run(RaftServiceServer::new(FakeLeaderService::leader())).await;
        let client = ClusterClient::new(
            "test",
            &leader.address().expect("address"),
            Duration::from_secs(1),
        );

        let members = client
            .change_config(&ConfChangeV2::default())
            .await
            .expect("change");
        assert_eq!(members.get(&1).map(|a| a.as_str()), Some("leader"));
    }

    #[tokio::test]
    async fn test_gives_up_without_leader() {
        let follower =
            TestRpcServer::run(RaftServiceServer::new(FakeLeaderService::follower(""))).await;
        let client = ClusterClient::new(
            "test",
            &follower.address().expect("address"),
            Duration::from_secs(1),
        )
        .with_retry(Duration::from_millis(10), 3);

        let result = client.propose(Bytes::from("data")).await;
        assert!(matches!(result, Err(RaftError::LeaderNotFound)));
    }
}
