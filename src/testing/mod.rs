pub mod http_server;
pub mod rpc_server;
pub mod services;
