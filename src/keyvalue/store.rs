use async_trait::async_trait;
use bytes::Bytes;
use prost::Message;
use std::collections::BTreeMap;

use crate::keyvalue::keyvalue_proto::operation::Op;
use crate::keyvalue::keyvalue_proto::{Entry, Operation, SetOperation, Snapshot};
use crate::raft::{StateMachine, StateMachineError, StateMachineResult};

// A key-value store where both the key and the value type are just bytes.
pub trait Store {
    fn get(&self, key: &[u8]) -> Option<Bytes>;
    fn set(&mut self, key: Bytes, value: Bytes);
}

// A store implementation backed by a simple in-memory map. Replicated by
// proposing encoded operations, see set_operation.
#[derive(Default)]
pub struct MapStore {
    data: BTreeMap<Bytes, Bytes>,
}

impl MapStore {
    pub fn new() -> Self {
        MapStore::default()
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    // Returns the resulting value of the affected key.
    fn apply_operation(&mut self, operation: Operation) -> StateMachineResult<Bytes> {
        match operation.op {
            Some(Op::Set(SetOperation { entry: Some(entry) })) => {
                let value = Bytes::from(entry.value);
                self.set(Bytes::from(entry.key), value.clone());
                Ok(value)
            }
            Some(Op::Set(SetOperation { entry: None })) => Err(StateMachineError(
                "No entry present in 'set' operation".to_string(),
            )),
            None => Err(StateMachineError("Unrecognized operation type".to_string())),
        }
    }
}

impl Store for MapStore {
    fn get(&self, key: &[u8]) -> Option<Bytes> {
        self.data.get(key).cloned()
    }

    fn set(&mut self, key: Bytes, value: Bytes) {
        self.data.insert(key, value);
    }
}

// Encodes an operation setting "key" to "value", ready to be proposed.
pub fn set_operation(key: impl Into<Bytes>, value: impl Into<Bytes>) -> Bytes {
    let operation = Operation {
        op: Some(Op::Set(SetOperation {
            entry: Some(Entry {
                key: key.into().to_vec(),
                value: value.into().to_vec(),
            }),
        })),
    };
    Bytes::from(operation.encode_to_vec())
}

#[async_trait]
impl StateMachine for MapStore {
    async fn apply(&mut self, payload: Bytes) -> StateMachineResult<Bytes> {
        let operation = Operation::decode(payload)
            .map_err(|e| StateMachineError(format!("Failed to parse operation: {}", e)))?;
        self.apply_operation(operation)
    }

    async fn snapshot(&self) -> StateMachineResult<Bytes> {
        let snapshot = Snapshot {
            entries: self
                .data
                .iter()
                .map(|(k, v)| Entry {
                    key: k.to_vec(),
                    value: v.to_vec(),
                })
                .collect(),
        };
        Ok(Bytes::from(snapshot.encode_to_vec()))
    }

    async fn restore(&mut self, snapshot: Bytes) -> StateMachineResult<()> {
        let contents = Snapshot::decode(snapshot)
            .map_err(|e| StateMachineError(format!("Failed to parse snapshot: {}", e)))?;
        self.data = contents
            .entries
            .into_iter()
            .map(|entry| (Bytes::from(entry.key), Bytes::from(entry.value)))
            .collect();
        Ok(())
    }
}
