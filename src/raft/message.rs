use bytes::Bytes;
use futures::channel::oneshot::Sender;
use prost::Message as ProstMessage;
use protobuf::Message as PbMessage;
use raft::SnapshotStatus;
use raft::prelude::{
    ConfChange, ConfChangeSingle, ConfChangeV2, Entry, EntryType, Message,
};
use std::collections::BTreeMap;

use crate::raft::error::{RaftError, RaftResult};
use crate::raft::peers::PeerInfo;
use crate::raft::raft_service_proto::{ChangeContext, Member};

// Node id to raft address of cluster members.
pub type MemberAddresses = BTreeMap<u64, String>;

// Identifies a proposal made by this process. Written into the context of the
// proposed entry so that the commit can be routed back to the caller. The
// incarnation is random per process, which keeps entries proposed by other
// nodes (or by an earlier run of this node) from resolving our waiters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProposalId {
    pub incarnation: u64,
    pub seq: u64,
}

impl ProposalId {
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(16);
        out.extend_from_slice(&self.incarnation.to_be_bytes());
        out.extend_from_slice(&self.seq.to_be_bytes());
        out
    }

    // Returns None for contexts not written by ProposalId::encode, e.g., the
    // empty entry appended by a new leader.
    pub fn decode(context: &[u8]) -> Option<Self> {
        if context.len() != 16 {
            return None;
        }
        let mut incarnation = [0u8; 8];
        let mut seq = [0u8; 8];
        incarnation.copy_from_slice(&context[..8]);
        seq.copy_from_slice(&context[8..]);
        Some(ProposalId {
            incarnation: u64::from_be_bytes(incarnation),
            seq: u64::from_be_bytes(seq),
        })
    }
}

// Where to find the leader, as far as this node knows.
#[derive(Debug, Clone, PartialEq)]
pub struct LeaderHint {
    pub leader_id: u64,
    pub leader_addr: Option<String>,
}

impl From<LeaderHint> for RaftError {
    fn from(hint: LeaderHint) -> Self {
        RaftError::WrongLeader {
            leader_id: hint.leader_id,
            leader_addr: hint.leader_addr,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProposalResult {
    // The entry committed, carries the output of the state machine.
    Applied(Bytes),
    WrongLeader(LeaderHint),
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigChangeResult {
    // A node was added. Carries the addresses of all members at commit time.
    JoinSuccess {
        assigned_id: u64,
        peers: MemberAddresses,
    },
    // Any other change (removal, leaving a joint configuration) was applied.
    Ok,
    WrongLeader(LeaderHint),
    // Another membership change has not been applied yet. Worth retrying.
    Busy,
    Failed(String),
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestIdResult {
    Reserved {
        leader_id: u64,
        reserved_id: u64,
        peers: MemberAddresses,
    },
    WrongLeader(LeaderHint),
}

// A snapshot of the driver's view of the cluster.
#[derive(Debug, Clone)]
pub struct NodeStatus {
    pub id: u64,
    pub leader_id: u64,
    pub term: u64,
    pub is_leader: bool,
    pub applied: u64,
    // Whether the applied configuration is joint.
    pub joint: bool,
    pub peers: Vec<PeerInfo>,
    // Initial members which have announced themselves to this (leader) node.
    pub bootstrap_ready: Vec<u64>,
}

// A client request forwarded from a follower to the leader.
pub enum Reroute {
    Propose {
        data: Bytes,
        reply: Sender<ProposalResult>,
    },
    ConfChange {
        change: ConfChangeV2,
        reply: Sender<ConfigChangeResult>,
    },
}

// Everything the node driver consumes from its inbound queue.
pub enum InboundRequest {
    Propose {
        data: Bytes,
        reply: Sender<ProposalResult>,
    },
    ConfigChange {
        change: ConfChangeV2,
        reply: Sender<ConfigChangeResult>,
    },
    RequestId {
        addr: String,
        reply: Sender<RequestIdResult>,
    },
    Consensus(Box<Message>),
    ReportUnreachable {
        node_id: u64,
    },
    // Outcome of sending a snapshot to a peer.
    ReportSnapshot {
        node_id: u64,
        status: SnapshotStatus,
    },
    Rerouted(Reroute),
    // An initial follower reports that it is up and waiting for bootstrap.
    MemberBootstrapReady {
        node_id: u64,
        addr: String,
        reply: Sender<()>,
    },
    // The supplied members are committed parts of the cluster.
    MembersConnected {
        members: MemberAddresses,
        reply: Sender<()>,
    },
    Status {
        reply: Sender<NodeStatus>,
    },
    CreateSnapshot {
        reply: Sender<RaftResult<()>>,
    },
    TransferLeader {
        node_id: u64,
        reply: Sender<Result<(), LeaderHint>>,
    },
    Shutdown,
}

// A committed log entry, decoded.
#[derive(Debug)]
pub enum CommittedEntry {
    // No payload, e.g., the entry appended by a newly elected leader.
    Empty,
    Normal {
        index: u64,
        term: u64,
        proposal: Option<ProposalId>,
        data: Bytes,
    },
    ConfChange {
        index: u64,
        term: u64,
        proposal: Option<ProposalId>,
        change: ConfChangeV2,
    },
}

impl CommittedEntry {
    pub fn decode(entry: &Entry) -> RaftResult<Self> {
        let index = entry.get_index();
        let term = entry.get_term();
        let proposal = ProposalId::decode(entry.get_context());
        match entry.get_entry_type() {
            EntryType::EntryNormal => {
                if entry.get_data().is_empty() {
                    return Ok(CommittedEntry::Empty);
                }
                Ok(CommittedEntry::Normal {
                    index,
                    term,
                    proposal,
                    data: Bytes::copy_from_slice(entry.get_data()),
                })
            }
            EntryType::EntryConfChange => {
                let mut v1 = ConfChange::default();
                v1.merge_from_bytes(entry.get_data())?;
                Ok(CommittedEntry::ConfChange {
                    index,
                    term,
                    proposal,
                    change: upgrade_conf_change(&v1),
                })
            }
            // An empty payload decodes to the empty change, which leaves a
            // joint configuration.
            EntryType::EntryConfChangeV2 => {
                let mut change = ConfChangeV2::default();
                change.merge_from_bytes(entry.get_data())?;
                Ok(CommittedEntry::ConfChange {
                    index,
                    term,
                    proposal,
                    change,
                })
            }
        }
    }
}

fn upgrade_conf_change(v1: &ConfChange) -> ConfChangeV2 {
    let mut single = ConfChangeSingle::default();
    single.set_change_type(v1.get_change_type());
    single.set_node_id(v1.get_node_id());

    let mut change = ConfChangeV2::default();
    change.set_changes(vec![single].into());
    change.set_context(v1.get_context().to_vec().into());
    change
}

pub fn encode_change_context(members: &MemberAddresses) -> Vec<u8> {
    ChangeContext {
        members: to_members(members),
    }
    .encode_to_vec()
}

pub fn decode_change_context(context: &[u8]) -> RaftResult<MemberAddresses> {
    if context.is_empty() {
        return Ok(MemberAddresses::new());
    }
    let decoded = ChangeContext::decode(context)?;
    Ok(from_members(&decoded.members))
}

pub fn to_members(addresses: &MemberAddresses) -> Vec<Member> {
    addresses
        .iter()
        .map(|(id, address)| Member {
            id: *id,
            address: address.clone(),
        })
        .collect()
}

pub fn from_members(members: &[Member]) -> MemberAddresses {
    members
        .iter()
        .map(|m| (m.id, m.address.clone()))
        .collect()
}
