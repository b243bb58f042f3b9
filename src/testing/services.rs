use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use tonic::{Request, Response, Status};

use crate::raft::raft_service_proto::raft_service_server::RaftService;
use crate::raft::raft_service_proto::{
    ChangeConfigArgs, ChangeConfigResponse, ClusterBootstrapReadyArgs,
    ClusterBootstrapReadyResponse, Member, MemberBootstrapReadyArgs, MemberBootstrapReadyResponse,
    RaftMessageArgs, RaftMessageResponse, RequestIdArgs, RequestIdResponse, RerouteMessageArgs,
    ResultCode,
};

// A raft service which counts the consensus messages it receives and
// optionally fails all of them. Everything else is unimplemented.
#[derive(Clone)]
pub struct CountingRaftService {
    calls: Arc<AtomicUsize>,
    fail: bool,
}

impl CountingRaftService {
    pub fn new(fail: bool) -> Self {
        CountingRaftService {
            calls: Arc::new(AtomicUsize::new(0)),
            fail,
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[tonic::async_trait]
impl RaftService for CountingRaftService {
    async fn request_id(
        &self,
        _: Request<RequestIdArgs>,
    ) -> Result<Response<RequestIdResponse>, Status> {
        Err(Status::unimplemented("request_id"))
    }

    async fn change_config(
        &self,
        _: Request<ChangeConfigArgs>,
    ) -> Result<Response<ChangeConfigResponse>, Status> {
        Err(Status::unimplemented("change_config"))
    }

    async fn send_message(
        &self,
        _: Request<RaftMessageArgs>,
    ) -> Result<Response<RaftMessageResponse>, Status> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.fail {
            return Err(Status::unavailable("failing on purpose"));
        }
        Ok(Response::new(RaftMessageResponse {
            result: ResultCode::Success.into(),
            ..Default::default()
        }))
    }

    async fn reroute_message(
        &self,
        _: Request<RerouteMessageArgs>,
    ) -> Result<Response<RaftMessageResponse>, Status> {
        Err(Status::unimplemented("reroute_message"))
    }

    async fn cluster_bootstrap_ready(
        &self,
        _: Request<ClusterBootstrapReadyArgs>,
    ) -> Result<Response<ClusterBootstrapReadyResponse>, Status> {
        Err(Status::unimplemented("cluster_bootstrap_ready"))
    }

    async fn member_bootstrap_ready(
        &self,
        _: Request<MemberBootstrapReadyArgs>,
    ) -> Result<Response<MemberBootstrapReadyResponse>, Status> {
        Err(Status::unimplemented("member_bootstrap_ready"))
    }
}

// Pretends to be a member of a cluster whose leader is node 1. The leader
// answers id requests with id 4, echoes proposals and accepts any config
// change. A follower redirects everything to the configured leader address.
#[derive(Clone)]
pub struct FakeLeaderService {
    leader_addr: Option<String>,
}

impl FakeLeaderService {
    pub fn leader() -> Self {
        FakeLeaderService { leader_addr: None }
    }

    // An empty address makes the follower report that it knows no leader.
    pub fn follower(leader_addr: &str) -> Self {
        FakeLeaderService {
            leader_addr: Some(leader_addr.to_string()),
        }
    }

    fn members() -> Vec<Member> {
        vec![Member {
            id: 1,
            address: "leader".to_string(),
        }]
    }

    fn leader_id(&self) -> u64 {
        match &self.leader_addr {
            Some(addr) if addr.is_empty() => 0,
            _ => 1,
        }
    }
}

#[tonic::async_trait]
impl RaftService for FakeLeaderService {
    async fn request_id(
        &self,
        _: Request<RequestIdArgs>,
    ) -> Result<Response<RequestIdResponse>, Status> {
        let response = match &self.leader_addr {
            None => RequestIdResponse {
                result: ResultCode::Success.into(),
                leader_id: 1,
                reserved_id: 4,
                peers: Self::members(),
                ..Default::default()
            },
            Some(addr) => RequestIdResponse {
                result: ResultCode::WrongLeader.into(),
                leader_id: self.leader_id(),
                leader_address: addr.clone(),
                ..Default::default()
            },
        };
        Ok(Response::new(response))
    }

    async fn change_config(
        &self,
        _: Request<ChangeConfigArgs>,
    ) -> Result<Response<ChangeConfigResponse>, Status> {
        let response = match &self.leader_addr {
            None => ChangeConfigResponse {
                result: ResultCode::Success.into(),
                peers: Self::members(),
                ..Default::default()
            },
            Some(addr) => ChangeConfigResponse {
                result: ResultCode::WrongLeader.into(),
                leader_id: self.leader_id(),
                leader_address: addr.clone(),
                ..Default::default()
            },
        };
        Ok(Response::new(response))
    }

    async fn send_message(
        &self,
        _: Request<RaftMessageArgs>,
    ) -> Result<Response<RaftMessageResponse>, Status> {
        Ok(Response::new(RaftMessageResponse {
            result: ResultCode::Success.into(),
            ..Default::default()
        }))
    }

    async fn reroute_message(
        &self,
        request: Request<RerouteMessageArgs>,
    ) -> Result<Response<RaftMessageResponse>, Status> {
        let response = match &self.leader_addr {
            None => RaftMessageResponse {
                result: ResultCode::Success.into(),
                data: request.into_inner().proposed_data,
                ..Default::default()
            },
            Some(addr) => RaftMessageResponse {
                result: ResultCode::WrongLeader.into(),
                leader_id: self.leader_id(),
                leader_address: addr.clone(),
                ..Default::default()
            },
        };
        Ok(Response::new(response))
    }

    async fn cluster_bootstrap_ready(
        &self,
        _: Request<ClusterBootstrapReadyArgs>,
    ) -> Result<Response<ClusterBootstrapReadyResponse>, Status> {
        Ok(Response::new(ClusterBootstrapReadyResponse {}))
    }

    async fn member_bootstrap_ready(
        &self,
        _: Request<MemberBootstrapReadyArgs>,
    ) -> Result<Response<MemberBootstrapReadyResponse>, Status> {
        Ok(Response::new(MemberBootstrapReadyResponse {
            result: ResultCode::Success.into(),
        }))
    }
}
