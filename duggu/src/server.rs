//! Server lifecycle management

use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info};

use duggu_api::AppState;
use duggu_core::Config;
use duggu_hub::RoomRegistry;
use duggu_sfu::SfuManager;

pub struct DugguServer {
    config: Config,
    state: AppState,
    registry: Arc<RoomRegistry>,
    sfu_manager: Arc<SfuManager>,
}

impl DugguServer {
    pub const fn new(
        config: Config,
        state: AppState,
        registry: Arc<RoomRegistry>,
        sfu_manager: Arc<SfuManager>,
    ) -> Self {
        Self {
            config,
            state,
            registry,
            sfu_manager,
        }
    }

    /// Serve HTTP until the listener fails or a shutdown signal arrives
    pub async fn start(self) -> anyhow::Result<()> {
        let http_address = self.config.http_address();
        let listener = tokio::net::TcpListener::bind(&http_address)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind HTTP address {http_address}: {e}"))?;

        let router = duggu_api::create_router(self.state.clone(), &self.config.server);
        let (shutdown_tx, mut shutdown_rx) = watch::channel(false);

        info!(
            "HTTP server listening on {} (WebSocket at {})",
            http_address, self.config.server.ws_path
        );

        let mut http_handle = tokio::spawn(async move {
            let graceful = async move {
                let _ = shutdown_rx.changed().await;
            };

            if let Err(e) = axum::serve(listener, router)
                .with_graceful_shutdown(graceful)
                .await
            {
                error!("HTTP server error: {}", e);
            }
        });

        tokio::select! {
            _ = &mut http_handle => {
                error!("HTTP server stopped unexpectedly");
                return Err(anyhow::anyhow!("HTTP server stopped unexpectedly"));
            }
            () = shutdown_signal() => {
                info!("Shutdown signal received, starting graceful shutdown...");
            }
        }

        let _ = shutdown_tx.send(true);
        if let Err(e) = http_handle.await {
            error!("HTTP server task failed: {}", e);
        }

        self.shutdown();
        Ok(())
    }

    fn shutdown(&self) {
        info!(
            rooms = self.registry.room_count(),
            video_rooms = self.sfu_manager.room_count(),
            "Duggu server shut down"
        );
    }
}

/// Wait for a shutdown signal (SIGTERM or SIGINT/Ctrl+C)
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to install Ctrl+C handler: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => { info!("Received Ctrl+C"); }
        () = terminate => { info!("Received SIGTERM"); }
    }
}
