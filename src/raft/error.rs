use thiserror::Error;
use tonic::Status;

use crate::raft::persistence::PersistenceError;

/// A specialized `Result` type for Raft operations.
pub type RaftResult<T> = Result<T, RaftError>;

/// Structured error type used throughout the raft package.
#[derive(Error, Debug)]
pub enum RaftError {
    #[error("Initialization error: {0}")]
    Initialization(String),

    #[error("RPC error from peer {peer}: {status}")]
    Rpc {
        peer: String,
        #[source]
        status: Status,
    },

    #[error("Failed to connect to peer {peer}: {source}")]
    ConnectionFailed {
        peer: String,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },

    #[error("Invalid argument in request: {0}")]
    InvalidArgument(String),

    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Consensus error: {0}")]
    Consensus(#[from] raft::Error),

    #[error("Storage error: {0}")]
    Storage(#[from] PersistenceError),

    #[error("Failed to encode or decode protobuf: {0}")]
    Codec(String),

    #[error("Not the leader, current leader is {leader_id} at {leader_addr:?}")]
    WrongLeader {
        leader_id: u64,
        leader_addr: Option<String>,
    },

    #[error("Could not find the cluster leader through any of the supplied seeds")]
    LeaderNotFound,

    #[error("Failed to join the cluster: {0}")]
    Join(String),

    #[error("Failed to bootstrap the cluster: {0}")]
    Bootstrap(String),

    #[error("Timed out: {0}")]
    Timeout(String),

    #[error("The node has shut down")]
    Shutdown,

    #[error("Unknown error: {0}")]
    Unknown(String),
}

impl RaftError {
    pub(crate) fn missing(field: &str) -> Self {
        Self::InvalidArgument(format!("Missing field {}", field))
    }

    pub(crate) fn rpc(peer: &str, status: Status) -> Self {
        Self::Rpc {
            peer: peer.to_string(),
            status,
        }
    }
}

impl From<protobuf::ProtobufError> for RaftError {
    fn from(err: protobuf::ProtobufError) -> Self {
        Self::Codec(err.to_string())
    }
}

impl From<prost::DecodeError> for RaftError {
    fn from(err: prost::DecodeError) -> Self {
        Self::Codec(err.to_string())
    }
}

/// Conversion from our internal `RaftError` to a gRPC `Status`.
impl From<RaftError> for Status {
    fn from(err: RaftError) -> Self {
        match err {
            RaftError::InvalidArgument(msg) => Status::invalid_argument(msg),
            RaftError::Codec(msg) => Status::invalid_argument(msg),
            RaftError::Timeout(msg) => Status::deadline_exceeded(msg),
            RaftError::Shutdown => Status::unavailable(err.to_string()),
            _ => Status::internal(err.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tonic::Code;

    #[test]
    fn test_status_mapping() {
        let status: Status = RaftError::missing("conf_change").into();
        assert_eq!(status.code(), Code::InvalidArgument);
        assert!(status.message().contains("conf_change"));

        let status: Status = RaftError::Timeout("apply".to_string()).into();
        assert_eq!(status.code(), Code::DeadlineExceeded);

        let status: Status = RaftError::LeaderNotFound.into();
        assert_eq!(status.code(), Code::Internal);
    }
}
