use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::sync::oneshot::Sender;
use tokio_stream::wrappers::TcpListenerStream;

use crate::raft::raft_service_proto::raft_service_server::{RaftService, RaftServiceServer};

// A helper struct which can be used to test code talking to the raft service.
// Runs a real server which binds to an arbitrary port and provides access to
// the resulting address. Also takes care of tearing down the server when the
// instance goes out of scope.
pub struct TestRpcServer {
    port: Option<u16>,
    shutdown: Option<Sender<()>>,
}

impl TestRpcServer {
    // Runs the supplied service on an arbitrary port. Panics if anything goes
    // wrong during setup.
    pub async fn run<T: RaftService>(service: RaftServiceServer<T>) -> Self {
        let mut server = TestRpcServer {
            port: None,
            shutdown: None,
        };
        server.start(service).await;
        server
    }

    async fn start<T: RaftService>(&mut self, service: RaftServiceServer<T>) {
        // Manually created the TCP listener so we can store the port.
        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        self.port = Some(listener.local_addr().expect("address").port());

        let (tx, rx) = oneshot::channel();
        self.shutdown = Some(tx);

        tokio::spawn(async move {
            let incoming = TcpListenerStream::new(listener);
            let shutdown = async {
                rx.await.ok();
            };
            tonic::transport::Server::builder()
                .add_service(service)
                .serve_with_incoming_shutdown(incoming, shutdown)
                .await
                .expect("serve");
        });
    }

    // Returns the port the server is listening on.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    // Returns the address to hand to clients.
    pub fn address(&self) -> Option<String> {
        self.port.map(|port| format!("127.0.0.1:{}", port))
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for TestRpcServer {
    fn drop(&mut self) {
        self.stop();
    }
}
