//! HTTP daemon for the provisioning engine
//!
//! Serves the REST API from [`routes`] on a TCP listener until the shutdown
//! future resolves.

pub mod routes;

use std::future::Future;
use std::net::SocketAddr;

use tokio::net::TcpListener;

use crate::error::TunnelHubError;

pub use routes::{build_router, AppState};

/// Default listen address for the REST API
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:8080";

/// HTTP server wrapping the route table
pub struct HttpServer {
    listen: SocketAddr,
    state: AppState,
}

impl HttpServer {
    pub fn new(listen: SocketAddr, state: AppState) -> Self {
        Self { listen, state }
    }

    pub fn listen_addr(&self) -> SocketAddr {
        self.listen
    }

    /// Serve until `shutdown` completes
    pub async fn run_with_shutdown(
        self,
        shutdown: impl Future<Output = ()> + Send + 'static,
    ) -> Result<(), TunnelHubError> {
        let router = build_router(self.state);
        let listener = TcpListener::bind(self.listen).await?;

        tracing::info!("HTTP API listening on {}", listener.local_addr()?);

        axum::serve(listener, router)
            .with_graceful_shutdown(shutdown)
            .await?;

        tracing::info!("HTTP API shut down");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HubConfig;
    use crate::crypto::X25519Provisioner;
    use crate::service::PeerService;
    use crate::store::MemoryStore;
    use crate::traffic::WgShowReader;
    use std::sync::Arc;

    #[tokio::test]
    async fn test_server_stops_on_shutdown() {
        let hub = HubConfig::from_yaml_str(
            "server_ip: 203.0.113.10\nip: 10.8.0.1/24\nip_pool: 10.8.0.0/24\n",
        )
        .unwrap();
        let service = PeerService::new(
            hub,
            Arc::new(MemoryStore::new()),
            Box::new(X25519Provisioner),
            Box::new(WgShowReader::default()),
        )
        .unwrap();
        let state = AppState {
            service: Arc::new(service),
            hub_config_path: std::env::temp_dir().join("tunnelhub-test-wg.conf"),
        };

        let server = HttpServer::new("127.0.0.1:0".parse().unwrap(), state);
        assert_eq!(server.listen_addr().ip().to_string(), "127.0.0.1");

        // An already-completed shutdown future makes serve return promptly
        server.run_with_shutdown(async {}).await.unwrap();
    }
}
