//! Server lifecycle management
//!
//! Binds the HTTP front door and tears every stream down on shutdown so no
//! engine session is left open.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use tower_http::trace::TraceLayer;
use tracing::{error, info};

use aceproxy_core::Config;
use aceproxy_livestream::{create_proxy_router, HttpProxyState, ProxyService};

/// Extra time on top of the engine's response timeout for stop calls to land
const SHUTDOWN_SLACK: Duration = Duration::from_secs(2);

pub struct ProxyServer {
    config: Config,
    service: Arc<ProxyService>,
}

impl ProxyServer {
    pub const fn new(config: Config, service: Arc<ProxyService>) -> Self {
        Self { config, service }
    }

    pub async fn run(self) -> Result<()> {
        let address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {address}: {e}"))?;
        info!("HTTP server listening on {}", address);

        let router = create_proxy_router(HttpProxyState::new(Arc::clone(&self.service)))
            .layer(TraceLayer::new_for_http());

        let service = Arc::clone(&self.service);
        let grace = self.config.engine.no_response_timeout() + SHUTDOWN_SLACK;
        let shutdown = async move {
            shutdown_signal().await;
            info!("Shutdown signal received, closing streams...");
            // Ends every streaming body, which lets the server drain
            service.shutdown(grace).await;
        };

        axum::serve(
            listener,
            router.into_make_service_with_connect_info::<SocketAddr>(),
        )
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| {
            error!("HTTP server error: {}", e);
            anyhow::anyhow!("HTTP server error: {e}")
        })?;

        // Streams created by requests racing the signal
        self.service.shutdown(grace).await;
        Ok(())
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        match tokio::signal::ctrl_c().await {
            Ok(()) => {
                info!("Received Ctrl+C signal");
            }
            Err(e) => {
                error!("Failed to install Ctrl+C handler: {}", e);
            }
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
                info!("Received SIGTERM signal");
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = terminate => {}
    }
}
