mod server;

use anyhow::Result;
use std::sync::Arc;
use tracing::info;

use duggu_api::{AppState, MessageDispatcher};
use duggu_core::{auth::JwtAuthenticator, bootstrap::load_config, logging};
use duggu_hub::{Broadcaster, RoomRegistry};
use duggu_sfu::{SfuConfig, SfuManager, WebRtcEngine};

use server::DugguServer;

#[tokio::main]
async fn main() -> Result<()> {
    // 1. Load and validate configuration
    let config = load_config()?;

    // 2. Initialize logging
    logging::init_logging(&config.logging)?;
    info!("Duggu signaling server starting...");
    info!("HTTP address: {}", config.http_address());

    // 3. Shared state, built once and handed to whoever needs it
    let registry = Arc::new(RoomRegistry::new());
    let broadcaster = Arc::new(Broadcaster::new(Arc::clone(&registry)));

    let sfu_config = SfuConfig::from(&config.sfu);
    let engine = WebRtcEngine::new(&sfu_config)
        .map_err(|e| anyhow::anyhow!("Failed to initialize WebRTC engine: {e}"))?;
    let sfu_manager = SfuManager::new(Arc::new(engine), sfu_config);

    let dispatcher = Arc::new(MessageDispatcher::new(
        broadcaster,
        Arc::clone(&sfu_manager),
        config.server.outbound_queue_capacity,
    ));
    let authenticator = Arc::new(JwtAuthenticator::from_config(&config.auth));
    if config.auth.allow_anonymous {
        info!("Anonymous connections allowed");
    }

    let state = AppState {
        dispatcher,
        authenticator,
        cookie_name: config.auth.cookie_name.clone(),
        max_message_size: config.server.max_message_size,
    };

    // 4. Serve until shutdown
    DugguServer::new(config, state, registry, sfu_manager)
        .start()
        .await
}
