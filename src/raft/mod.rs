pub mod raft_service_proto {
    tonic::include_proto!("raftservice");
}

pub mod raft_persistence_proto {
    tonic::include_proto!("raftpersistence");
}

mod bootstrap;
mod client;
mod config;
mod consensus_core;
mod driver;
mod error;
mod handle;
mod join;
mod message;
mod node;
mod peers;
mod persistence;
mod server;
mod state_machine;
mod storage;
mod transport;

#[cfg(test)]
pub(crate) mod testing;

pub use client::ClusterClient;
pub use config::RaftConfig;
pub use consensus_core::ConsensusCore;
pub use driver::{BOOTSTRAP_LEADER_ID, NodeDriver};
pub use error::{RaftError, RaftResult};
pub use handle::RaftHandle;
pub use join::{ClusterJoinTicket, FollowerRole, join_cluster, request_id};
pub use message::{
    ConfigChangeResult, InboundRequest, LeaderHint, MemberAddresses, NodeStatus, ProposalResult,
};
pub use node::Raft;
pub use peers::{PeerInfo, PeerState};
pub use persistence::{PersistenceError, PersistenceOptions};
pub use server::{RaftServer, serve};
pub use state_machine::{StateMachine, StateMachineError, StateMachineResult};
pub use storage::LogStore;
