//! Broker configuration.

use std::time::Duration;

/// Default AMQP listen address.
pub const DEFAULT_LISTEN_ADDR: &str = "0.0.0.0:5672";

/// Default virtual host created at startup.
pub const DEFAULT_VHOST: &str = "/";

/// Highest channel number offered in `Connection.Tune`.
pub const DEFAULT_CHANNEL_MAX: u16 = 2047;

/// Largest frame payload offered in `Connection.Tune`.
pub const DEFAULT_FRAME_MAX: u32 = 131_072;

/// Heartbeat delay in seconds offered in `Connection.Tune`.
pub const DEFAULT_HEARTBEAT: u16 = 60;

/// Deadline for each handshake step.
pub const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// Startup configuration for the broker.
#[derive(Debug, Clone)]
pub struct BrokerConfig {
    /// TCP address to listen on
    pub listen_addr: String,
    /// Virtual host created at startup
    pub default_vhost: String,
    /// Bootstrap username permitted on the default vhost
    pub default_user: String,
    /// Bootstrap password
    pub default_pass: String,
    /// Channel limit offered at tune time (0 = unlimited)
    pub channel_max: u16,
    /// Frame size offered at tune time
    pub frame_max: u32,
    /// Heartbeat delay offered at tune time (0 = disabled)
    pub heartbeat: u16,
}

impl Default for BrokerConfig {
    fn default() -> Self {
        Self {
            listen_addr: DEFAULT_LISTEN_ADDR.to_string(),
            default_vhost: DEFAULT_VHOST.to_string(),
            default_user: "guest".to_string(),
            default_pass: "guest".to_string(),
            channel_max: DEFAULT_CHANNEL_MAX,
            frame_max: DEFAULT_FRAME_MAX,
            heartbeat: DEFAULT_HEARTBEAT,
        }
    }
}
