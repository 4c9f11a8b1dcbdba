//! Node agent configuration.

use clap::Parser;

/// Node agent configuration.
#[derive(Parser, Clone)]
pub struct NodeAgentConfig {
    /// Local WireGuard interface name.
    #[arg(long, env = "WEFT_NODE_INTERFACE", default_value = "wg0")]
    pub interface: String,

    /// Node's WireGuard private key (base64).
    #[arg(long, env = "WEFT_NODE_PRIVATE_KEY")]
    pub private_key: String,

    /// Node overlay address with prefix, as issued by the hub.
    #[arg(long, env = "WEFT_NODE_ADDRESS")]
    pub address: String,

    /// Hub's WireGuard public key (base64).
    #[arg(long, env = "WEFT_HUB_PUBLIC_KEY")]
    pub hub_public_key: String,

    /// Hub endpoint (host:port).
    #[arg(long, env = "WEFT_HUB_ENDPOINT")]
    pub hub_endpoint: String,

    /// CIDR routed to the hub.
    #[arg(long, env = "WEFT_HUB_ALLOWED_IPS", default_value = "10.0.0.0/24")]
    pub hub_allowed_ips: String,

    /// Persistent keepalive interval in seconds (0 disables).
    #[arg(long, env = "WEFT_NODE_KEEPALIVE_SECS", default_value_t = 25)]
    pub keepalive_secs: u16,

    /// Coordinator base URL for registration (optional).
    #[arg(long, env = "WEFT_COORDINATOR_URL")]
    pub coordinator_url: Option<String>,

    /// Seconds between tunnel health checks.
    #[arg(long, env = "WEFT_NODE_HEALTH_INTERVAL_SECS", default_value_t = 60)]
    pub health_interval_secs: u64,

    /// Maximum connection retry attempts.
    #[arg(long, env = "WEFT_NODE_MAX_RETRIES", default_value_t = 5)]
    pub max_retries: u32,

    /// Per-attempt connection timeout in seconds.
    #[arg(long, env = "WEFT_NODE_CONNECTION_TIMEOUT_SECS", default_value_t = 30)]
    pub connection_timeout_secs: u64,
}

impl std::fmt::Debug for NodeAgentConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeAgentConfig")
            .field("interface", &self.interface)
            .field("private_key", &"<redacted>")
            .field("address", &self.address)
            .field("hub_public_key", &self.hub_public_key)
            .field("hub_endpoint", &self.hub_endpoint)
            .field("hub_allowed_ips", &self.hub_allowed_ips)
            .field("keepalive_secs", &self.keepalive_secs)
            .field("coordinator_url", &self.coordinator_url)
            .field("health_interval_secs", &self.health_interval_secs)
            .field("max_retries", &self.max_retries)
            .field("connection_timeout_secs", &self.connection_timeout_secs)
            .finish()
    }
}
