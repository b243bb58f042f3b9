use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tonic::transport::{Channel, Endpoint};
use tracing::{debug, info};

use crate::raft::error::{RaftError, RaftResult};
use crate::raft::message::MemberAddresses;
use crate::raft::raft_service_proto::raft_service_client::RaftServiceClient;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    // Only the address is known.
    Disconnected,
    // The node's membership has committed.
    Connected,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PeerInfo {
    pub id: u64,
    pub addr: String,
    pub state: PeerState,
}

pub struct Peer {
    pub addr: String,
    pub state: PeerState,
    client: Option<RaftServiceClient<Channel>>,

    // Number of message deliveries to this peer which exhausted all retries
    // since the last successful one. Send tasks reset it on success.
    failures: Arc<AtomicU32>,
}

impl Peer {
    fn new(addr: &str, state: PeerState, client: Option<RaftServiceClient<Channel>>) -> Self {
        Peer {
            addr: addr.to_string(),
            state,
            client,
            failures: Arc::new(AtomicU32::new(0)),
        }
    }
}

// All other nodes this node knows about, keyed by node id. Owned and mutated
// exclusively by the node driver.
pub struct Peers {
    self_id: u64,
    self_addr: String,
    peers: BTreeMap<u64, Peer>,
}

impl Peers {
    pub fn new(self_id: u64, self_addr: &str) -> Self {
        Peers {
            self_id,
            self_addr: self_addr.to_string(),
            peers: BTreeMap::new(),
        }
    }

    // Reserves a node id for a node joining from the supplied address. Asking
    // again for the same address yields the same id, as long as the address
    // has not been connected under another id since.
    pub fn reserve_id(&mut self, addr: &str) -> u64 {
        if let Some(id) = self.id_by_addr(addr) {
            return id;
        }

        let mut next = self.peers.keys().max().copied().unwrap_or(0) + 1;
        if next == self.self_id {
            next += 1;
        }
        self.peers
            .insert(next, Peer::new(addr, PeerState::Disconnected, None));
        info!(node = self.self_id, reserved = next, addr, "Reserved node id");
        next
    }

    // Registers a node whose address is known but whose membership has not
    // (yet) been observed, e.g., the initial members of a cluster.
    pub fn add_known(&mut self, id: u64, addr: &str) -> RaftResult<()> {
        if id == self.self_id {
            return Ok(());
        }
        if let Some(existing) = self.peers.get(&id) {
            if existing.addr == addr && existing.client.is_some() {
                return Ok(());
            }
        }
        let client = connect_lazy(addr)?;
        let state = match self.peers.get(&id) {
            Some(existing) if existing.addr == addr => existing.state,
            _ => PeerState::Disconnected,
        };
        self.peers.insert(id, Peer::new(addr, state, Some(client)));
        Ok(())
    }

    // Marks the node as a committed member, creating a client for it.
    pub fn connect(&mut self, id: u64, addr: &str) -> RaftResult<()> {
        if id == self.self_id {
            return Ok(());
        }
        match self.peers.get_mut(&id) {
            Some(peer) if peer.addr == addr && peer.client.is_some() => {
                peer.state = PeerState::Connected;
            }
            _ => {
                let client = connect_lazy(addr)?;
                self.peers
                    .insert(id, Peer::new(addr, PeerState::Connected, Some(client)));
            }
        }
        debug!(node = self.self_id, peer = id, addr, "Connected peer");
        Ok(())
    }

    pub fn remove(&mut self, id: u64) -> Option<Peer> {
        let removed = self.peers.remove(&id);
        if removed.is_some() {
            info!(node = self.self_id, peer = id, "Removed peer");
        }
        removed
    }

    // Returns a client for the peer along with its failure counter, if the
    // peer is known and has a client.
    pub fn client(&self, id: u64) -> Option<(RaftServiceClient<Channel>, Arc<AtomicU32>)> {
        let peer = self.peers.get(&id)?;
        let client = peer.client.clone()?;
        Some((client, peer.failures.clone()))
    }

    pub fn addr(&self, id: u64) -> Option<String> {
        if id == self.self_id {
            return Some(self.self_addr.clone());
        }
        self.peers.get(&id).map(|p| p.addr.clone())
    }

    pub fn id_by_addr(&self, addr: &str) -> Option<u64> {
        self.peers
            .iter()
            .find(|(_, peer)| peer.addr == addr)
            .map(|(id, _)| *id)
    }

    // Bumps the failure counter of the supplied peer. Returns the new value,
    // or None if the peer is unknown.
    pub fn record_failure(&mut self, id: u64) -> Option<u32> {
        let peer = self.peers.get(&id)?;
        Some(peer.failures.fetch_add(1, Ordering::SeqCst) + 1)
    }

    pub fn reset_failures(&mut self, id: u64) {
        if let Some(peer) = self.peers.get(&id) {
            peer.failures.store(0, Ordering::SeqCst);
        }
    }

    // Returns the addresses of all connected members, including this node.
    pub fn members(&self) -> MemberAddresses {
        let mut result: MemberAddresses = self
            .peers
            .iter()
            .filter(|(_, peer)| peer.state == PeerState::Connected)
            .map(|(id, peer)| (*id, peer.addr.clone()))
            .collect();
        result.insert(self.self_id, self.self_addr.clone());
        result
    }

    pub fn infos(&self) -> Vec<PeerInfo> {
        self.peers
            .iter()
            .map(|(id, peer)| PeerInfo {
                id: *id,
                addr: peer.addr.clone(),
                state: peer.state,
            })
            .collect()
    }
}

// Creates a client for the supplied address. The connection itself is only
// established once the first request is made.
pub(crate) fn connect_lazy(addr: &str) -> RaftResult<RaftServiceClient<Channel>> {
    let endpoint = Endpoint::from_shared(format!("http://{}", addr)).map_err(|e| {
        RaftError::ConnectionFailed {
            peer: addr.to_string(),
            source: Box::new(e),
        }
    })?;
    let channel = endpoint.connect_timeout(CONNECT_TIMEOUT).connect_lazy();
    Ok(RaftServiceClient::new(channel))
}
