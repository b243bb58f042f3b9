use axum::Router;
use tokio::net::TcpListener;
use tokio::sync::oneshot;
use tokio::sync::oneshot::Sender;

// A helper struct which can be used to test http handlers. Runs a real server
// which binds to an arbitrary port and provides access to the resulting port.
// Also takes care of tearing down the server when the instance goes out of
// scope.
pub struct TestHttpServer {
    port: Option<u16>,
    shutdown: Option<Sender<()>>,
}

impl TestHttpServer {
    // Runs the supplied router on an arbitrary port. Panics if anything goes
    // wrong during setup.
    pub async fn run(router: Router) -> Self {
        let mut server = TestHttpServer {
            port: None,
            shutdown: None,
        };
        server.start(router).await;
        server
    }

    // Returns the port the server is listening on.
    pub fn port(&self) -> Option<u16> {
        self.port
    }

    pub fn url(&self, path: &str) -> String {
        format!("http://127.0.0.1:{}{}", self.port.unwrap_or_default(), path)
    }

    async fn start(&mut self, router: Router) {
        let (tx, rx) = oneshot::channel();
        self.shutdown = Some(tx);

        let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
        self.port = Some(listener.local_addr().expect("address").port());

        tokio::spawn(async move {
            let shutdown = async {
                rx.await.ok();
            };
            axum::serve(listener, router)
                .with_graceful_shutdown(shutdown)
                .await
                .expect("server");
        });
    }

    fn stop(&mut self) {
        if let Some(shutdown) = self.shutdown.take() {
            let _ = shutdown.send(());
        }
    }
}

impl Drop for TestHttpServer {
    fn drop(&mut self) {
        self.stop();
    }
}
