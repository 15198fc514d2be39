//! SFU Configuration

use std::time::Duration;

use duggu_core::config::SfuSettings;

#[derive(Debug, Clone)]
pub struct SfuConfig {
    /// STUN/TURN urls handed to every peer connection
    pub ice_servers: Vec<String>,
    /// Attempts per synchronization pass before deferring
    pub max_sync_attempts: u32,
    /// Delay before the deferred pass
    pub resync_backoff: Duration,
}

impl Default for SfuConfig {
    fn default() -> Self {
        Self::from(&SfuSettings::default())
    }
}

impl From<&SfuSettings> for SfuConfig {
    fn from(settings: &SfuSettings) -> Self {
        Self {
            ice_servers: settings.ice_servers.clone(),
            max_sync_attempts: settings.max_sync_attempts.max(1),
            resync_backoff: Duration::from_millis(settings.resync_backoff_ms),
        }
    }
}
