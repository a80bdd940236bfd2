//! Hub configuration. A single plain struct, loaded directly or from the
//! environment — mirroring the teacher's lightweight `config.rs`, scaled down
//! since this crate has exactly one config object rather than a multi-section
//! server config.

use std::time::Duration;

/// Tunables for a [`Hub`](crate::hub::Hub) and the [`ClientStore`](crate::store::ClientStore)
/// / [`Client`](crate::client::Client)s it owns.
#[derive(Debug, Clone)]
pub struct HubConfig {
    /// Number of independently-locked shards in the client-id index.
    pub client_shards: usize,
    /// Number of independently-locked shards in the channel index.
    pub channel_shards: usize,
    /// Capacity of each client's bounded outbound send queue.
    pub send_buffer_capacity: usize,
    /// Cadence of the writer's ping ticks.
    pub ping_interval: Duration,
    /// Deadline applied to `Connection::read`.
    pub read_timeout: Duration,
    /// Deadline applied to `Connection::write`.
    pub write_timeout: Duration,
    /// Upper bound on `Hub::close`'s graceful shutdown.
    pub shutdown_timeout: Duration,
    /// Largest inbound frame the upgrader will accept.
    pub max_message_size: usize,
}

impl Default for HubConfig {
    fn default() -> Self {
        Self {
            client_shards: 16,
            channel_shards: 16,
            send_buffer_capacity: 256,
            ping_interval: Duration::from_secs(30),
            read_timeout: Duration::from_secs(60),
            write_timeout: Duration::from_secs(10),
            shutdown_timeout: Duration::from_secs(10),
            max_message_size: 0x100_0000, // 16 MiB
        }
    }
}

impl HubConfig {
    /// Overlays environment variables onto [`HubConfig::default`]. Unset or
    /// unparsable variables fall back to the default silently, matching the
    /// teacher's own tolerant env-override loading.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(v) = env_usize("WSHUB_CLIENT_SHARDS") {
            config.client_shards = v;
        }
        if let Some(v) = env_usize("WSHUB_CHANNEL_SHARDS") {
            config.channel_shards = v;
        }
        if let Some(v) = env_usize("WSHUB_SEND_BUFFER_CAPACITY") {
            config.send_buffer_capacity = v;
        }
        if let Some(v) = env_secs("WSHUB_PING_INTERVAL_SECS") {
            config.ping_interval = v;
        }
        if let Some(v) = env_secs("WSHUB_READ_TIMEOUT_SECS") {
            config.read_timeout = v;
        }
        if let Some(v) = env_secs("WSHUB_WRITE_TIMEOUT_SECS") {
            config.write_timeout = v;
        }
        if let Some(v) = env_secs("WSHUB_SHUTDOWN_TIMEOUT_SECS") {
            config.shutdown_timeout = v;
        }
        if let Some(v) = env_usize("WSHUB_MAX_MESSAGE_SIZE") {
            config.max_message_size = v;
        }

        config
    }
}

fn env_usize(key: &str) -> Option<usize> {
    std::env::var(key).ok()?.parse().ok()
}

fn env_secs(key: &str) -> Option<Duration> {
    env_usize(key).map(|s| Duration::from_secs(s as u64))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = HubConfig::default();
        assert!(config.client_shards > 0);
        assert!(config.channel_shards > 0);
        assert!(config.send_buffer_capacity > 0);
    }
}
