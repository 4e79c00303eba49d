use std::time::Duration;

/// Maximum inbound frame size (1 MiB).
pub const DEFAULT_MAX_FRAME_BYTES: usize = 1024 * 1024;

/// Gateway tuning knobs. Built once by the server binary and handed to
/// [`crate::Gateway::new`].
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Permitted `Origin` header values.
    pub allowed_origins: Vec<String>,
    /// Reject upgrades that did not arrive over TLS.
    pub require_tls: bool,
    /// Treat `X-Forwarded-Proto: https` from a terminating proxy as TLS.
    pub trust_forwarded_proto: bool,
    pub max_frame_bytes: usize,
    pub keys: KeyConfig,
    pub rate: RateLimitConfig,
    /// Upper bound for a single `command` dispatch.
    pub command_timeout: Duration,
    /// Per-connection outbound queue depth; a full queue drops deliveries.
    pub send_queue: usize,
    /// Keys in message data reserved for privileged identities.
    pub forbidden_keys: Vec<String>,
    /// Role that lifts the forbidden-key restriction.
    pub privileged_role: String,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["http://localhost:5173".into()],
            require_tls: false,
            trust_forwarded_proto: false,
            max_frame_bytes: DEFAULT_MAX_FRAME_BYTES,
            keys: KeyConfig::default(),
            rate: RateLimitConfig::default(),
            command_timeout: Duration::from_secs(5),
            send_queue: 256,
            forbidden_keys: ["admin", "is_admin", "role", "roles", "permissions"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
            privileged_role: "admin".into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KeyConfig {
    /// Age after which the active key is replaced.
    pub rotation_interval: Duration,
    /// How long a superseded key still decrypts inbound frames.
    pub grace_window: Duration,
}

impl Default for KeyConfig {
    fn default() -> Self {
        let day = Duration::from_secs(24 * 60 * 60);
        Self {
            rotation_interval: day,
            grace_window: day,
        }
    }
}

#[derive(Debug, Clone)]
pub struct RateLimitConfig {
    /// Short window for the soft (throttle) threshold.
    pub window: Duration,
    pub soft_limit: u32,
    /// Broader window for the hard (disconnect) threshold.
    pub hard_window: Duration,
    pub hard_limit: u32,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            window: Duration::from_secs(1),
            soft_limit: 20,
            hard_window: Duration::from_secs(10),
            hard_limit: 100,
        }
    }
}
