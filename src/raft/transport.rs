use async_std::channel::Sender;
use protobuf::Message as PbMessage;
use raft::SnapshotStatus;
use raft::prelude::{Message, MessageType};
use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;
use tokio::time::timeout;
use tonic::Request;
use tonic::transport::Channel;
use tracing::{Instrument, debug, debug_span, warn};

use crate::raft::RaftConfig;
use crate::raft::message::InboundRequest;
use crate::raft::raft_service_proto::RaftMessageArgs;
use crate::raft::raft_service_proto::raft_service_client::RaftServiceClient;

// What to do about a peer once a message delivery has exhausted its retries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Escalation {
    ReportUnreachable,
    RemoveNode,
}

// Decides the escalation for a peer whose failure counter has just been
// bumped to "failures".
pub fn escalate(config: &RaftConfig, failures: u32) -> Escalation {
    if config.auto_remove_node && failures >= config.connection_fail_limit {
        Escalation::RemoveNode
    } else {
        Escalation::ReportUnreachable
    }
}

// Delivers consensus messages to peers. Each message is sent from its own
// task, which never touches the driver's state. Failures find their way back
// to the driver as a ReportUnreachable on the inbound queue. The outcome of
// every snapshot delivery is reported as well.
#[derive(Clone)]
pub struct Transport {
    node_id: u64,
    message_timeout: Duration,
    max_retry_cnt: u32,
    queue: Sender<InboundRequest>,
}

impl Transport {
    pub fn new(node_id: u64, config: &RaftConfig, queue: Sender<InboundRequest>) -> Self {
        Transport {
            node_id,
            message_timeout: config.message_timeout,
            max_retry_cnt: config.max_retry_cnt.max(1),
            queue,
        }
    }

    pub fn send(
        &self,
        to: u64,
        client: RaftServiceClient<Channel>,
        failures: Arc<AtomicU32>,
        message: Message,
    ) {
        let payload = match message.write_to_bytes() {
            Ok(payload) => payload,
            Err(e) => {
                warn!(node = self.node_id, peer = to, "Failed to encode message: {}", e);
                return;
            }
        };

        let is_snapshot = message.get_msg_type() == MessageType::MsgSnapshot;
        let transport = self.clone();
        let span = debug_span!("send", node = self.node_id, peer = to);
        tokio::spawn(
            async move {
                let delivered = transport.deliver(to, client, failures, payload).await;
                if is_snapshot {
                    transport.report_snapshot(to, delivered).await;
                }
            }
            .instrument(span),
        );
    }

    // Attempts delivery up to max_retry_cnt times, each attempt bounded by the
    // message timeout.
    async fn deliver(
        &self,
        to: u64,
        mut client: RaftServiceClient<Channel>,
        failures: Arc<AtomicU32>,
        payload: Vec<u8>,
    ) -> bool {
        for attempt in 1..=self.max_retry_cnt {
            let mut request = Request::new(RaftMessageArgs {
                message: payload.clone(),
            });
            request.set_timeout(self.message_timeout);

            match timeout(self.message_timeout, client.send_message(request)).await {
                Ok(Ok(_)) => {
                    failures.store(0, Ordering::SeqCst);
                    return true;
                }
                Ok(Err(status)) => {
                    debug!(attempt, "Delivery failed: {}", status.message())
                }
                Err(_) => debug!(attempt, "Delivery timed out"),
            }
        }

        debug!(attempts = self.max_retry_cnt, "Giving up on message");
        // Best effort, the driver might already be gone.
        let _ = self
            .queue
            .send(InboundRequest::ReportUnreachable { node_id: to })
            .await;
        false
    }

    async fn report_snapshot(&self, to: u64, delivered: bool) {
        let status = if delivered {
            SnapshotStatus::Finish
        } else {
            SnapshotStatus::Failure
        };
        debug!(?status, "Snapshot delivery done");
        let _ = self
            .queue
            .send(InboundRequest::ReportSnapshot { node_id: to, status })
            .await;
    }
}
