extern crate structopt;
extern crate tracing;

use async_std::sync::{Arc, Mutex};
use std::error::Error;
use std::path::PathBuf;
use std::time::Duration;
use structopt::StructOpt;
use tokio::net::TcpListener;
use tracing::{Instrument, error, info, info_span};
use tracing_subscriber::EnvFilter;

use raftkit::keyvalue::{MapStore, router};
use raftkit::raft::{
    BOOTSTRAP_LEADER_ID, FollowerRole, MemberAddresses, Raft, RaftConfig, RaftError, request_id,
};

#[derive(Debug, StructOpt)]
struct Arguments {
    // Address the raft service of this node listens on.
    #[structopt(long = "raft-addr")]
    raft_addr: String,

    // Address of any cluster member. Makes this node join the running
    // cluster. May be supplied more than once.
    #[structopt(long = "peer-addr")]
    peer_addr: Vec<String>,

    // Address to serve the key-value http api on.
    #[structopt(long = "web-server")]
    web_server: Option<String>,

    // Id of this node when starting a new cluster. Node 1 bootstraps it.
    #[structopt(long = "id")]
    id: Option<u64>,

    // Initial members of a new cluster, as "id=addr".
    #[structopt(long = "initial-peers", parse(try_from_str = parse_peer))]
    initial_peers: Vec<(u64, String)>,

    #[structopt(long = "log-dir", default_value = "/tmp/raftkit")]
    log_dir: PathBuf,

    #[structopt(short = "w", long = "wipe")]
    wipe: bool,

    // Joins as a learner, which replicates but never votes.
    #[structopt(long = "learner")]
    learner: bool,

    #[structopt(long = "snapshot-interval-secs")]
    snapshot_interval_secs: Option<u64>,

    #[structopt(long = "use-log-compaction")]
    use_log_compaction: bool,

    // Removes peers which keep failing message delivery.
    #[structopt(long = "auto-remove-node")]
    auto_remove_node: bool,

    // Number of failed message deliveries in a row after which a peer gets
    // removed. Only used with --auto-remove-node.
    #[structopt(long = "connection-fail-limit", default_value = "5")]
    connection_fail_limit: u32,
}

fn parse_peer(value: &str) -> Result<(u64, String), String> {
    let (id, addr) = value
        .split_once('=')
        .ok_or_else(|| format!("expected id=addr, got {}", value))?;
    let id = id
        .parse()
        .map_err(|e| format!("invalid node id {}: {}", id, e))?;
    Ok((id, addr.to_string()))
}

fn make_config(args: &Arguments) -> RaftConfig {
    let mut config = RaftConfig::default().with_persistence(args.log_dir.clone(), args.wipe);
    if let Some(secs) = args.snapshot_interval_secs {
        config = config.with_snapshots(Duration::from_secs(secs), args.use_log_compaction);
    }
    if args.auto_remove_node {
        config = config.with_auto_remove(args.connection_fail_limit);
    }
    config
}

async fn start(
    args: &Arguments,
    config: RaftConfig,
    listener: TcpListener,
    store: Arc<Mutex<MapStore>>,
) -> Result<Raft, Box<dyn Error>> {
    let initial: MemberAddresses = args.initial_peers.iter().cloned().collect();
    let raft = match args.id {
        Some(BOOTSTRAP_LEADER_ID) => Raft::bootstrap_cluster(config, listener, store, initial).await?,
        Some(id) => Raft::new_follower(config, id, listener, store, initial).await?,
        None if !args.peer_addr.is_empty() => {
            let ticket = request_id(&args.raft_addr, &args.peer_addr, &config).await?;
            info!(id = ticket.reserved_id, leader = ticket.leader_id, "Reserved node id");
            let role = if args.learner {
                FollowerRole::Learner
            } else {
                FollowerRole::Voter
            };
            Raft::join_cluster(config, listener, store, ticket, role).await?
        }
        None => {
            return Err(Box::new(RaftError::Initialization(
                "either --id or --peer-addr is required".to_string(),
            )));
        }
    };
    Ok(raft)
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn Error>> {
    // This allows configuring the filters using the RUST_LOG env variable.
    // Example:
    // > RUST_LOG=info,raftkit::raft=debug cargo run -- --id 1 --raft-addr 127.0.0.1:60061
    let env_filter = EnvFilter::try_from_default_env().unwrap_or(EnvFilter::from("raftkit=info"));

    tracing_subscriber::FmtSubscriber::builder()
        .with_target(false)
        .with_env_filter(env_filter)
        .init();
    let args = Arguments::from_args();

    let config = make_config(&args);
    let listener = TcpListener::bind(&args.raft_addr).await?;
    let store = Arc::new(Mutex::new(MapStore::new()));
    let raft = start(&args, config, listener, store.clone()).await?;
    let handle = raft.handle();
    info!(id = raft.id(), addr = raft.addr(), "Started raft node");

    if let Some(web_addr) = &args.web_server {
        let web_listener = tokio::net::TcpListener::bind(web_addr).await?;
        let app = router(handle.clone(), store);
        info!(addr = %web_addr, "Serving http");
        tokio::spawn(
            async move {
                if let Err(e) = axum::serve(web_listener, app).await {
                    error!("Http server failed: {}", e);
                }
            }
            .instrument(info_span!("http")),
        );
    }

    // Stop the node on SIGINT, which also ends the serve loop below.
    let signal_handle = handle.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Got SIGINT, shutting down");
            let _ = signal_handle.shutdown().await;
        }
    });

    raft.run().await?;
    info!("All done, exiting");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_auto_remove_flags() {
        let args = Arguments::from_iter(vec![
            "raftkit",
            "--raft-addr",
            "127.0.0.1:60061",
            "--auto-remove-node",
            "--connection-fail-limit",
            "3",
        ]);
        let config = make_config(&args);
        assert!(config.auto_remove_node);
        assert_eq!(config.connection_fail_limit, 3);

        // The limit alone does not enable removal.
        let args = Arguments::from_iter(vec![
            "raftkit",
            "--raft-addr",
            "127.0.0.1:60061",
            "--connection-fail-limit",
            "3",
        ]);
        assert!(!make_config(&args).auto_remove_node);
    }

    #[test]
    fn test_parse_peer() {
        assert_eq!(
            parse_peer("2=127.0.0.1:60062"),
            Ok((2, "127.0.0.1:60062".to_string()))
        );
        assert!(parse_peer("127.0.0.1:60062").is_err());
        assert!(parse_peer("x=127.0.0.1:60062").is_err());
    }
}
