use async_std::sync::{Arc, Mutex};
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::get;
use std::fmt::Write;
use tracing::debug;

use crate::keyvalue::store::{MapStore, Store, set_operation};
use crate::raft::{RaftError, RaftHandle};

type HttpResult = Result<String, (StatusCode, String)>;

#[derive(Clone)]
struct HttpState {
    raft: RaftHandle,
    store: Arc<Mutex<MapStore>>,
}

// Returns a router exposing the store replicated by the supplied node. Writes
// go through the cluster, reads are served from the local copy.
//
// > curl "localhost:8001/put/foo/bar"
pub fn router(raft: RaftHandle, store: Arc<Mutex<MapStore>>) -> Router {
    Router::new()
        .route("/put/{key}/{value}", get(put))
        .route("/get/{key}", get(get_value))
        .route("/leader", get(leader))
        .route("/peers", get(peers))
        .route("/leave", get(leave))
        .route("/snapshot", get(snapshot))
        .with_state(HttpState { raft, store })
}

async fn put(State(state): State<HttpState>, Path((key, value)): Path<(String, String)>) -> HttpResult {
    debug!(key = %key, "Handling put");
    let output = state
        .raft
        .propose(set_operation(key, value))
        .await
        .map_err(internal)?;
    Ok(String::from_utf8_lossy(&output).into_owned())
}

async fn get_value(State(state): State<HttpState>, Path(key): Path<String>) -> HttpResult {
    match state.store.lock().await.get(key.as_bytes()) {
        Some(value) => Ok(String::from_utf8_lossy(&value).into_owned()),
        None => Err((StatusCode::NOT_FOUND, format!("Key not found {}", key))),
    }
}

async fn leader(State(state): State<HttpState>) -> HttpResult {
    let leader_id = state.raft.leader_id().await.map_err(internal)?;
    Ok(leader_id.to_string())
}

// One line per known peer: id, address and state.
async fn peers(State(state): State<HttpState>) -> HttpResult {
    let peers = state.raft.peers().await.map_err(internal)?;
    let mut body = String::new();
    for peer in peers {
        let _ = writeln!(body, "{} {} {:?}", peer.id, peer.addr, peer.state);
    }
    Ok(body)
}

async fn leave(State(state): State<HttpState>) -> HttpResult {
    state.raft.leave().await.map_err(internal)?;
    Ok("left".to_string())
}

async fn snapshot(State(state): State<HttpState>) -> HttpResult {
    state.raft.create_snapshot().await.map_err(internal)?;
    Ok("snapshot created".to_string())
}

fn internal(error: RaftError) -> (StatusCode, String) {
    let code = match error {
        RaftError::LeaderNotFound | RaftError::Shutdown => StatusCode::SERVICE_UNAVAILABLE,
        RaftError::Timeout(_) => StatusCode::GATEWAY_TIMEOUT,
        _ => StatusCode::INTERNAL_SERVER_ERROR,
    };
    (code, error.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::raft::{InboundRequest, ProposalResult};
    use crate::testing::http_server::TestHttpServer;
    use bytes::Bytes;

    // Answers proposals the way a single node cluster would, without the
    // cluster.
    fn fake_raft(store: Arc<Mutex<MapStore>>) -> RaftHandle {
        let (sender, receiver) = async_std::channel::bounded(10);
        tokio::spawn(async move {
            while let Ok(request) = receiver.recv().await {
                if let InboundRequest::Propose { data, reply } = request {
                    let mut store = store.lock().await;
                    let result = match crate::raft::StateMachine::apply(&mut *store, data).await {
                        Ok(output) => ProposalResult::Applied(output),
                        Err(e) => ProposalResult::Failed(e.to_string()),
                    };
                    let _ = reply.send(result);
                }
            }
        });
        RaftHandle::new(1, sender, std::time::Duration::from_secs(1))
    }

    #[tokio::test]
    async fn test_put_then_get() {
        let store = Arc::new(Mutex::new(MapStore::new()));
        let server = TestHttpServer::run(router(fake_raft(store.clone()), store.clone())).await;

        let body = reqwest::get(server.url("/put/foo/bar"))
            .await
            .expect("put")
            .text()
            .await
            .expect("body");
        assert_eq!(body, "bar");
        assert_eq!(store.lock().await.get(b"foo"), Some(Bytes::from("bar")));

        let response = reqwest::get(server.url("/get/foo")).await.expect("get");
        assert_eq!(response.status(), reqwest::StatusCode::OK);
        assert_eq!(response.text().await.expect("body"), "bar");
    }

    #[tokio::test]
    async fn test_get_missing_key() {
        let store = Arc::new(Mutex::new(MapStore::new()));
        let server = TestHttpServer::run(router(fake_raft(store.clone()), store)).await;

        let response = reqwest::get(server.url("/get/nope")).await.expect("get");
        assert_eq!(response.status(), reqwest::StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_leader_without_driver() {
        let store = Arc::new(Mutex::new(MapStore::new()));
        let server = TestHttpServer::run(router(fake_raft(store.clone()), store)).await;

        // The fake only answers proposals and drops status requests.
        let response = reqwest::get(server.url("/leader")).await.expect("get");
        assert_eq!(response.status(), reqwest::StatusCode::SERVICE_UNAVAILABLE);
    }
}
