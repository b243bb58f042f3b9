// A replicated key-value store: the state machine kept by every node and an
// http front-end which writes through the cluster.

pub use crate::keyvalue::http::router;
pub use crate::keyvalue::store::{MapStore, Store, set_operation};

pub(in crate::keyvalue) mod keyvalue_proto {
    tonic::include_proto!("keyvalue");
}

pub(in crate::keyvalue) mod http;
pub(in crate::keyvalue) mod store;
