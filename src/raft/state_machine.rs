use async_trait::async_trait;
use bytes::Bytes;
use thiserror::Error;

pub type StateMachineResult<T> = Result<T, StateMachineError>;

#[derive(Error, Debug, Clone, PartialEq)]
#[error("state machine error: {0}")]
pub struct StateMachineError(pub String);

// A state machine kept on every server in a raft cluster. The node driver
// applies payloads once they are committed, in commit order, on every node.
#[async_trait]
pub trait StateMachine: Send + Sync {
    // Applies the supplied payload and incorporates it in the state of the
    // state machine. The returned bytes are handed to the proposer.
    async fn apply(&mut self, payload: Bytes) -> StateMachineResult<Bytes>;

    // Returns a serialized form of the entire current state.
    async fn snapshot(&self) -> StateMachineResult<Bytes>;

    // Replaces the current state with the one captured in the snapshot.
    async fn restore(&mut self, snapshot: Bytes) -> StateMachineResult<()>;
}
