use async_std::sync::{Arc, Mutex};
use futures::channel::oneshot;
use tokio::net::TcpListener;
use tracing::{Instrument, info, info_span};

use crate::raft::bootstrap::{BootstrapCoordinator, await_bootstrap};
use crate::raft::config::RaftConfig;
use crate::raft::driver::{BOOTSTRAP_LEADER_ID, NodeDriver};
use crate::raft::error::{RaftError, RaftResult};
use crate::raft::handle::RaftHandle;
use crate::raft::join::{ClusterJoinTicket, FollowerRole, join_cluster};
use crate::raft::message::MemberAddresses;
use crate::raft::server::{RaftServer, serve};
use crate::raft::StateMachine;

// What a node does next to its driver loop while it becomes a member.
enum Coordination {
    // Restarted nodes and nodes started by hand.
    None,
    BootstrapLeader(BootstrapCoordinator),
    BootstrapFollower {
        leader_addr: String,
        members_connected: oneshot::Receiver<()>,
    },
    Join {
        ticket: ClusterJoinTicket,
        role: FollowerRole,
    },
}

// A raft node bound to its listener and ready to run.
pub struct Raft {
    id: u64,
    addr: String,
    listener: TcpListener,
    driver: NodeDriver,
    handle: RaftHandle,
    coordination: Coordination,
}

impl Raft {
    // Creates node 1 of a new cluster. The other "initial_peers" have to be
    // started with new_follower, they are added once all of them reported in.
    pub async fn bootstrap_cluster(
        config: RaftConfig,
        listener: TcpListener,
        fsm: Arc<Mutex<dyn StateMachine>>,
        initial_peers: MemberAddresses,
    ) -> RaftResult<Self> {
        let addr = local_addr(&listener)?;
        let driver = NodeDriver::bootstrap_leader(config, &addr, fsm, &initial_peers).await?;
        let handle = handle_for(&driver);
        let coordination = if driver.restored() {
            Coordination::None
        } else {
            Coordination::BootstrapLeader(BootstrapCoordinator::new(
                handle.clone(),
                initial_peers,
                driver.config(),
            ))
        };
        Ok(Self::assemble(addr, listener, driver, handle, coordination))
    }

    // Creates one of the initial members of a new cluster, or restarts any
    // non-leader node from its persisted state.
    pub async fn new_follower(
        config: RaftConfig,
        id: u64,
        listener: TcpListener,
        fsm: Arc<Mutex<dyn StateMachine>>,
        initial_peers: MemberAddresses,
    ) -> RaftResult<Self> {
        if id == BOOTSTRAP_LEADER_ID {
            return Err(RaftError::InvalidArgument(format!(
                "node id {} is reserved for the bootstrap leader",
                BOOTSTRAP_LEADER_ID
            )));
        }
        let addr = local_addr(&listener)?;
        let mut driver = NodeDriver::new_follower(config, id, &addr, fsm, &initial_peers).await?;
        let handle = handle_for(&driver);
        let coordination = match initial_peers.get(&BOOTSTRAP_LEADER_ID) {
            Some(leader_addr) if !driver.restored() => Coordination::BootstrapFollower {
                leader_addr: leader_addr.clone(),
                members_connected: driver.members_connected(),
            },
            _ => Coordination::None,
        };
        Ok(Self::assemble(addr, listener, driver, handle, coordination))
    }

    // Creates a node which joins a running cluster using a ticket obtained
    // from join::request_id. The listener must be bound to the ticket's
    // address.
    pub async fn join_cluster(
        config: RaftConfig,
        listener: TcpListener,
        fsm: Arc<Mutex<dyn StateMachine>>,
        ticket: ClusterJoinTicket,
        role: FollowerRole,
    ) -> RaftResult<Self> {
        let addr = local_addr(&listener)?;
        let driver =
            NodeDriver::new_follower(config, ticket.reserved_id, &addr, fsm, &ticket.peers)
                .await?;
        let handle = handle_for(&driver);
        let coordination = if driver.restored() {
            Coordination::None
        } else {
            Coordination::Join { ticket, role }
        };
        Ok(Self::assemble(addr, listener, driver, handle, coordination))
    }

    fn assemble(
        addr: String,
        listener: TcpListener,
        driver: NodeDriver,
        handle: RaftHandle,
        coordination: Coordination,
    ) -> Self {
        Raft {
            id: driver.id(),
            addr,
            listener,
            driver,
            handle,
            coordination,
        }
    }

    pub fn id(&self) -> u64 {
        self.id
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn handle(&self) -> RaftHandle {
        self.handle.clone()
    }

    // Serves the raft service and runs the driver loop until the node leaves
    // the cluster or is shut down. If membership coordination fails, the node
    // is stopped and the error returned.
    pub async fn run(self) -> RaftResult<()> {
        let Raft {
            id,
            addr,
            listener,
            mut driver,
            handle,
            coordination,
        } = self;

        let (shutdown, server_stopped) = tokio::sync::oneshot::channel();
        driver.attach_server_shutdown(shutdown);
        let config = driver.config().clone();

        let server = RaftServer::new(id, driver.mailbox(), config.message_timeout);
        let serving = serve(listener, server, async {
            let _ = server_stopped.await;
        });

        let coordinate_handle = handle.clone();
        let coordinate = async move {
            match coordination {
                Coordination::None => Ok(()),
                Coordination::BootstrapLeader(coordinator) => coordinator.run().await,
                Coordination::BootstrapFollower {
                    leader_addr,
                    members_connected,
                } => await_bootstrap(id, &addr, &leader_addr, members_connected, &config).await,
                Coordination::Join { ticket, role } => {
                    let members = join_cluster(&ticket, role, &config).await?;
                    coordinate_handle.members_connected(members).await
                }
            }
        };

        info!(node = id, "Starting raft node");
        async move {
            let node = async { tokio::try_join!(serving, driver.run()).map(|_| ()) };
            tokio::pin!(node);
            tokio::select! {
                result = &mut node => result,
                coordinated = coordinate => match coordinated {
                    Ok(()) => node.await,
                    // Dropping the driver stops the server as well.
                    Err(e) => Err(e),
                },
            }
        }
        .instrument(info_span!("node", id))
        .await
    }
}

fn handle_for(driver: &NodeDriver) -> RaftHandle {
    RaftHandle::new(driver.id(), driver.mailbox(), driver.config().message_timeout)
}

fn local_addr(listener: &TcpListener) -> RaftResult<String> {
    listener
        .local_addr()
        .map(|addr| addr.to_string())
        .map_err(|e| RaftError::Initialization(format!("listener has no address: {}", e)))
}
