use async_std::channel::Sender;
use bytes::Bytes;
use futures::channel::oneshot;
use protobuf::Message as PbMessage;
use raft::prelude::{ConfChangeV2, Message};
use std::future::Future;
use std::time::Duration;
use tokio::net::TcpListener;
use tokio::time::timeout;
use tokio_stream::wrappers::TcpListenerStream;
use tonic::{Request, Response, Status};
use tracing::{debug, info};

use crate::raft::error::{RaftError, RaftResult};
use crate::raft::message::{
    ConfigChangeResult, InboundRequest, LeaderHint, ProposalResult, RequestIdResult, Reroute,
    from_members, to_members,
};
use crate::raft::raft_service_proto::raft_service_server::{RaftService, RaftServiceServer};
use crate::raft::raft_service_proto::{
    ChangeConfigArgs, ChangeConfigResponse, ClusterBootstrapReadyArgs,
    ClusterBootstrapReadyResponse, MemberBootstrapReadyArgs, MemberBootstrapReadyResponse,
    RaftMessageArgs, RaftMessageResponse, RequestIdArgs, RequestIdResponse, RerouteKind,
    RerouteMessageArgs, ResultCode,
};

// Translates each incoming rpc into exactly one item on the node driver's
// inbound queue. Blocks when the queue is full. Requests which need an answer
// wait for the driver's reply, bounded by the message timeout.
pub struct RaftServer {
    node_id: u64,
    queue: Sender<InboundRequest>,
    message_timeout: Duration,
}

impl RaftServer {
    pub fn new(node_id: u64, queue: Sender<InboundRequest>, message_timeout: Duration) -> Self {
        RaftServer {
            node_id,
            queue,
            message_timeout,
        }
    }

    async fn enqueue(&self, request: InboundRequest) -> RaftResult<()> {
        self.queue
            .send(request)
            .await
            .map_err(|_| RaftError::Shutdown)
    }

    // Waits for the driver to answer. Returns RaftError::Timeout if it takes
    // longer than the message timeout, RaftError::Shutdown if the driver went
    // away without answering.
    async fn await_reply<T>(&self, receiver: oneshot::Receiver<T>) -> RaftResult<T> {
        match timeout(self.message_timeout, receiver).await {
            Ok(Ok(result)) => Ok(result),
            Ok(Err(_)) => Err(RaftError::Shutdown),
            Err(_) => Err(RaftError::Timeout(format!(
                "no reply from node {} within {:?}",
                self.node_id, self.message_timeout
            ))),
        }
    }

    async fn handle_propose(&self, data: Bytes) -> Result<RaftMessageResponse, Status> {
        let (reply, receiver) = oneshot::channel();
        self.enqueue(InboundRequest::Rerouted(Reroute::Propose { data, reply }))
            .await?;
        let response = match self.await_reply(receiver).await {
            Ok(ProposalResult::Applied(data)) => RaftMessageResponse {
                result: ResultCode::Success.into(),
                data: data.to_vec(),
                ..Default::default()
            },
            Ok(ProposalResult::WrongLeader(hint)) => wrong_leader_message(hint),
            Ok(ProposalResult::Failed(error)) => RaftMessageResponse {
                result: ResultCode::Error.into(),
                error,
                ..Default::default()
            },
            Err(RaftError::Timeout(error)) => RaftMessageResponse {
                result: ResultCode::TimeoutError.into(),
                error,
                ..Default::default()
            },
            Err(e) => return Err(e.into()),
        };
        Ok(response)
    }

}

#[tonic::async_trait]
impl RaftService for RaftServer {
    async fn request_id(
        &self,
        request: Request<RequestIdArgs>,
    ) -> Result<Response<RequestIdResponse>, Status> {
        let addr = request.into_inner().address;
        if addr.is_empty() {
            return Err(RaftError::missing("address").into());
        }
        debug!(node = self.node_id, addr = %addr, "Received id request");

        let (reply, receiver) = oneshot::channel();
        self.enqueue(InboundRequest::RequestId { addr, reply }).await?;
        let response = match self.await_reply(receiver).await {
            Ok(RequestIdResult::Reserved {
                leader_id,
                reserved_id,
                peers,
            }) => RequestIdResponse {
                result: ResultCode::Success.into(),
                leader_id,
                reserved_id,
                peers: to_members(&peers),
                ..Default::default()
            },
            Ok(RequestIdResult::WrongLeader(hint)) => RequestIdResponse {
                result: ResultCode::WrongLeader.into(),
                leader_id: hint.leader_id,
                leader_address: hint.leader_addr.unwrap_or_default(),
                ..Default::default()
            },
            Err(e) => RequestIdResponse {
                result: ResultCode::Error.into(),
                error: e.to_string(),
                ..Default::default()
            },
        };
        Ok(Response::new(response))
    }

    async fn change_config(
        &self,
        request: Request<ChangeConfigArgs>,
    ) -> Result<Response<ChangeConfigResponse>, Status> {
        let change = decode_conf_change(&request.into_inner().conf_change)?;
        let (reply, receiver) = oneshot::channel();
        self.enqueue(InboundRequest::ConfigChange { change, reply })
            .await?;
        let response = conf_change_response(self.await_reply(receiver).await);
        Ok(Response::new(response))
    }

    async fn send_message(
        &self,
        request: Request<RaftMessageArgs>,
    ) -> Result<Response<RaftMessageResponse>, Status> {
        let mut message = Message::default();
        message
            .merge_from_bytes(&request.into_inner().message)
            .map_err(RaftError::from)?;
        self.enqueue(InboundRequest::Consensus(Box::new(message)))
            .await?;
        Ok(Response::new(RaftMessageResponse {
            result: ResultCode::Success.into(),
            ..Default::default()
        }))
    }

    async fn reroute_message(
        &self,
        request: Request<RerouteMessageArgs>,
    ) -> Result<Response<RaftMessageResponse>, Status> {
        let args = request.into_inner();
        let kind = RerouteKind::try_from(args.kind)
            .map_err(|_| Status::invalid_argument(format!("unknown reroute kind {}", args.kind)))?;
        let response = match kind {
            RerouteKind::Propose => self.handle_propose(Bytes::from(args.proposed_data)).await?,
            RerouteKind::ConfChange => {
                let change = decode_conf_change(&args.conf_change)?;
                let (reply, receiver) = oneshot::channel();
                self.enqueue(InboundRequest::Rerouted(Reroute::ConfChange { change, reply }))
                    .await?;
                let converted = conf_change_response(self.await_reply(receiver).await);
                RaftMessageResponse {
                    result: converted.result,
                    leader_id: converted.leader_id,
                    leader_address: converted.leader_address,
                    error: converted.error,
                    ..Default::default()
                }
            }
        };
        Ok(Response::new(response))
    }

    async fn cluster_bootstrap_ready(
        &self,
        request: Request<ClusterBootstrapReadyArgs>,
    ) -> Result<Response<ClusterBootstrapReadyResponse>, Status> {
        let members = from_members(&request.into_inner().peers);
        info!(node = self.node_id, members = members.len(), "Cluster bootstrap complete");

        let (reply, receiver) = oneshot::channel();
        self.enqueue(InboundRequest::MembersConnected { members, reply })
            .await?;
        self.await_reply(receiver).await?;
        Ok(Response::new(ClusterBootstrapReadyResponse {}))
    }

    async fn member_bootstrap_ready(
        &self,
        request: Request<MemberBootstrapReadyArgs>,
    ) -> Result<Response<MemberBootstrapReadyResponse>, Status> {
        let args = request.into_inner();
        if args.follower_id == 0 {
            return Err(RaftError::missing("follower_id").into());
        }

        let (reply, receiver) = oneshot::channel();
        self.enqueue(InboundRequest::MemberBootstrapReady {
            node_id: args.follower_id,
            addr: args.address,
            reply,
        })
        .await?;
        self.await_reply(receiver).await?;
        Ok(Response::new(MemberBootstrapReadyResponse {
            result: ResultCode::Success.into(),
        }))
    }
}

fn decode_conf_change(bytes: &[u8]) -> Result<ConfChangeV2, Status> {
    let mut change = ConfChangeV2::default();
    change.merge_from_bytes(bytes).map_err(RaftError::from)?;
    Ok(change)
}

// Timeouts are reported as a result code, the change may still be applied and
// the caller is expected to retry.
fn conf_change_response(result: RaftResult<ConfigChangeResult>) -> ChangeConfigResponse {
    let result = match result {
        Ok(result) => result,
        Err(RaftError::Timeout(error)) => {
            return ChangeConfigResponse {
                result: ResultCode::TimeoutError.into(),
                error,
                ..Default::default()
            };
        }
        Err(e) => {
            return ChangeConfigResponse {
                result: ResultCode::Error.into(),
                error: e.to_string(),
                ..Default::default()
            };
        }
    };
    match result {
        ConfigChangeResult::JoinSuccess { assigned_id, peers } => ChangeConfigResponse {
            result: ResultCode::Success.into(),
            assigned_id,
            peers: to_members(&peers),
            ..Default::default()
        },
        ConfigChangeResult::Ok => ChangeConfigResponse {
            result: ResultCode::Success.into(),
            ..Default::default()
        },
        ConfigChangeResult::WrongLeader(hint) => ChangeConfigResponse {
            result: ResultCode::WrongLeader.into(),
            leader_id: hint.leader_id,
            leader_address: hint.leader_addr.unwrap_or_default(),
            ..Default::default()
        },
        ConfigChangeResult::Busy => ChangeConfigResponse {
            result: ResultCode::Busy.into(),
            ..Default::default()
        },
        ConfigChangeResult::Failed(error) => ChangeConfigResponse {
            result: ResultCode::Error.into(),
            error,
            ..Default::default()
        },
    }
}

fn wrong_leader_message(hint: LeaderHint) -> RaftMessageResponse {
    RaftMessageResponse {
        result: ResultCode::WrongLeader.into(),
        leader_id: hint.leader_id,
        leader_address: hint.leader_addr.unwrap_or_default(),
        ..Default::default()
    }
}

// Serves the raft service on the supplied listener until "shutdown" resolves.
pub async fn serve(
    listener: TcpListener,
    service: RaftServer,
    shutdown: impl Future<Output = ()>,
) -> RaftResult<()> {
    let node_id = service.node_id;
    let incoming = TcpListenerStream::new(listener);
    tonic::transport::Server::builder()
        .add_service(RaftServiceServer::new(service))
        .serve_with_incoming_shutdown(incoming, shutdown)
        .await
        .map_err(|e| RaftError::Internal(format!("raft server failed: {}", e)))?;
    info!(node = node_id, "Raft server stopped");
    Ok(())
}
