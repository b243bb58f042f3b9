use crate::raft::{StateMachine, StateMachineError, StateMachineResult};
use async_trait::async_trait;
use bytes::Bytes;

// A fake implementation of the StateMachine trait for testing
// purposes. Remembers every applied payload in order.
#[derive(Default)]
pub struct FakeStateMachine {
    pub applied: Vec<Bytes>,
    pub snapshots_loaded: i64,
}

impl FakeStateMachine {
    pub fn new() -> Self {
        FakeStateMachine::default()
    }
}

#[async_trait]
impl StateMachine for FakeStateMachine {
    async fn apply(&mut self, payload: Bytes) -> StateMachineResult<Bytes> {
        if payload.as_ref() == b"fail" {
            return Err(StateMachineError("refusing to apply".to_string()));
        }
        self.applied.push(payload.clone());
        Ok(Bytes::from(format!("applied-{}", self.applied.len())))
    }

    // Encodes the applied payloads, one per line.
    async fn snapshot(&self) -> StateMachineResult<Bytes> {
        let lines: Vec<&[u8]> = self.applied.iter().map(|p| p.as_ref()).collect();
        Ok(Bytes::from(lines.join(&b'\n')))
    }

    async fn restore(&mut self, snapshot: Bytes) -> StateMachineResult<()> {
        self.snapshots_loaded += 1;
        self.applied = if snapshot.is_empty() {
            Vec::new()
        } else {
            snapshot
                .split(|b| *b == b'\n')
                .map(Bytes::copy_from_slice)
                .collect()
        };
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_snapshot_round_trip() {
        let mut fsm = FakeStateMachine::new();
        fsm.apply(Bytes::from("a")).await.expect("apply");
        fsm.apply(Bytes::from("b")).await.expect("apply");
        let snapshot = fsm.snapshot().await.expect("snapshot");

        let mut other = FakeStateMachine::new();
        other.restore(snapshot).await.expect("restore");
        assert_eq!(other.applied, fsm.applied);
        assert_eq!(other.snapshots_loaded, 1);
    }
}
