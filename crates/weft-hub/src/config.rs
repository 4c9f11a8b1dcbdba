//! Hub service configuration.

use clap::Parser;

/// Hub control-plane configuration.
#[derive(Parser, Clone)]
pub struct HubConfig {
    /// Bind address for the control HTTP API.
    #[arg(long, env = "WEFT_HUB_BIND", default_value = "127.0.0.1:8070")]
    pub bind: String,

    /// Overlay network CIDR the pool allocates from.
    #[arg(long, env = "WEFT_OVERLAY_CIDR", default_value = "10.0.0.0/24")]
    pub overlay_cidr: String,

    /// Reserved addresses inside the overlay (comma-separated). The hub's
    /// own address belongs here.
    #[arg(
        long,
        env = "WEFT_RESERVED_IPS",
        value_delimiter = ',',
        default_value = "10.0.0.1"
    )]
    pub reserved_ips: Vec<String>,

    /// WireGuard interface name.
    #[arg(long, env = "WEFT_HUB_INTERFACE", default_value = "wg0")]
    pub interface: String,

    /// Path of the managed WireGuard config file.
    #[arg(
        long,
        env = "WEFT_HUB_CONFIG_PATH",
        default_value = "/etc/wireguard/wg0.conf"
    )]
    pub config_path: String,

    /// Hub's overlay address with prefix (rendered into [Interface]).
    #[arg(long, env = "WEFT_HUB_ADDRESS", default_value = "10.0.0.1/24")]
    pub hub_address: String,

    /// UDP listen port for WireGuard.
    #[arg(long, env = "WEFT_HUB_LISTEN_PORT", default_value_t = 51820)]
    pub listen_port: u16,

    /// Hub's WireGuard private key (base64).
    #[arg(long, env = "WEFT_HUB_PRIVATE_KEY")]
    pub hub_private_key: String,

    /// Hub's WireGuard public key (base64), handed to joining nodes.
    #[arg(long, env = "WEFT_HUB_PUBLIC_KEY")]
    pub hub_public_key: String,

    /// Externally reachable hub endpoint (host:port).
    #[arg(long, env = "WEFT_HUB_ENDPOINT")]
    pub hub_endpoint: String,

    /// HMAC secret for lease token signing.
    #[arg(long, env = "SECRET_KEY")]
    pub secret_key: String,

    /// Upstream coordinator base URL (health checks + result delivery).
    #[arg(long, env = "WEFT_UPSTREAM_URL", default_value = "http://localhost:8080")]
    pub upstream_url: String,

    /// Upstream health check interval in seconds.
    #[arg(long, env = "WEFT_HEALTH_CHECK_INTERVAL_SECS", default_value_t = 30)]
    pub health_check_interval_secs: u64,

    /// Upstream health check timeout in seconds.
    #[arg(long, env = "WEFT_HEALTH_CHECK_TIMEOUT_SECS", default_value_t = 10)]
    pub health_check_timeout_secs: u64,

    /// Path of the durable result buffer database.
    #[arg(
        long,
        env = "WEFT_BUFFER_PATH",
        default_value = "/var/lib/weft/result_buffer.db"
    )]
    pub buffer_path: String,

    /// Maximum pending results the buffer accepts.
    #[arg(long, env = "WEFT_BUFFER_CAPACITY", default_value_t = 10_000)]
    pub buffer_capacity: i64,

    /// Delivery attempts before a buffered result is dead-lettered.
    #[arg(long, env = "WEFT_BUFFER_MAX_RETRIES", default_value_t = 3)]
    pub buffer_max_retries: i64,

    /// Seconds between periodic buffer flush passes.
    #[arg(long, env = "WEFT_FLUSH_INTERVAL_SECS", default_value_t = 30)]
    pub flush_interval_secs: u64,

    /// Directory for rotating audit log files.
    #[arg(long, env = "WEFT_AUDIT_LOG_DIR", default_value = "/var/log/weft/audit")]
    pub audit_log_dir: String,

    /// Maximum bytes per audit log file before rotation.
    #[arg(long, env = "WEFT_AUDIT_MAX_BYTES", default_value_t = 100 * 1024 * 1024)]
    pub audit_max_bytes: u64,

    /// Rotated audit files to retain.
    #[arg(long, env = "WEFT_AUDIT_BACKUP_COUNT", default_value_t = 30)]
    pub audit_backup_count: usize,

    /// Timeline ring-buffer bound.
    #[arg(long, env = "WEFT_TIMELINE_MAX_EVENTS", default_value_t = 10_000)]
    pub timeline_max_events: usize,

    /// Seconds between lease expiration sweeps.
    #[arg(long, env = "WEFT_LEASE_SWEEP_INTERVAL_SECS", default_value_t = 30)]
    pub lease_sweep_interval_secs: u64,

    /// Heartbeat silence (seconds) after which a node counts as crashed.
    #[arg(long, env = "WEFT_CRASH_STALE_AFTER_SECS", default_value_t = 90)]
    pub crash_stale_after_secs: u64,
}

impl std::fmt::Debug for HubConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HubConfig")
            .field("bind", &self.bind)
            .field("overlay_cidr", &self.overlay_cidr)
            .field("reserved_ips", &self.reserved_ips)
            .field("interface", &self.interface)
            .field("config_path", &self.config_path)
            .field("hub_address", &self.hub_address)
            .field("listen_port", &self.listen_port)
            .field("hub_private_key", &"<redacted>")
            .field("hub_public_key", &self.hub_public_key)
            .field("hub_endpoint", &self.hub_endpoint)
            .field("secret_key", &"<redacted>")
            .field("upstream_url", &self.upstream_url)
            .field("health_check_interval_secs", &self.health_check_interval_secs)
            .field("health_check_timeout_secs", &self.health_check_timeout_secs)
            .field("buffer_path", &self.buffer_path)
            .field("buffer_capacity", &self.buffer_capacity)
            .field("buffer_max_retries", &self.buffer_max_retries)
            .field("flush_interval_secs", &self.flush_interval_secs)
            .field("audit_log_dir", &self.audit_log_dir)
            .field("audit_max_bytes", &self.audit_max_bytes)
            .field("audit_backup_count", &self.audit_backup_count)
            .field("timeline_max_events", &self.timeline_max_events)
            .field("lease_sweep_interval_secs", &self.lease_sweep_interval_secs)
            .field("crash_stale_after_secs", &self.crash_stale_after_secs)
            .finish()
    }
}
