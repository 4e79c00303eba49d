use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, bail};
use srmc_gateway::config::{GatewayConfig, KeyConfig, RateLimitConfig};

/// Placeholder JWT secrets that MUST NOT be used in production.
const PLACEHOLDER_SECRETS: &[&str] = &[
    "change-me-to-a-random-string",
    "dev-secret-change-me",
];

const DEV_SECRET: &str = "dev-secret-change-me";

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub tls_port: u16,
    pub jwt_secret: String,
    pub production: bool,
    pub tls_cert: Option<PathBuf>,
    pub tls_key: Option<PathBuf>,
    pub gateway: GatewayConfig,
}

impl ServerConfig {
    pub fn from_env() -> anyhow::Result<Self> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Build from any variable source; unset and empty values fall back to
    /// defaults.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> anyhow::Result<Self> {
        let var = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());

        let production = parse_or(&var, "SRMC_PRODUCTION", false)?;
        let defaults = GatewayConfig::default();

        let rotation_interval = Duration::from_secs(parse_or(
            &var,
            "SRMC_KEY_ROTATION_SECS",
            defaults.keys.rotation_interval.as_secs(),
        )?);
        let grace_window = match var("SRMC_KEY_GRACE_SECS") {
            Some(_) => Duration::from_secs(parse_or(&var, "SRMC_KEY_GRACE_SECS", 0)?),
            None => rotation_interval,
        };

        let rate = RateLimitConfig {
            window: Duration::from_millis(parse_or(
                &var,
                "SRMC_RATE_WINDOW_MS",
                defaults.rate.window.as_millis() as u64,
            )?),
            soft_limit: parse_or(&var, "SRMC_RATE_SOFT_LIMIT", defaults.rate.soft_limit)?,
            hard_window: Duration::from_millis(parse_or(
                &var,
                "SRMC_RATE_HARD_WINDOW_MS",
                defaults.rate.hard_window.as_millis() as u64,
            )?),
            hard_limit: parse_or(&var, "SRMC_RATE_HARD_LIMIT", defaults.rate.hard_limit)?,
        };

        let gateway = GatewayConfig {
            allowed_origins: var("SRMC_ALLOWED_ORIGINS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.allowed_origins),
            require_tls: production,
            trust_forwarded_proto: parse_or(&var, "SRMC_TRUST_FORWARDED_PROTO", false)?,
            max_frame_bytes: parse_or(&var, "SRMC_MAX_FRAME_BYTES", defaults.max_frame_bytes)?,
            keys: KeyConfig {
                rotation_interval,
                grace_window,
            },
            rate,
            command_timeout: Duration::from_millis(parse_or(
                &var,
                "SRMC_COMMAND_TIMEOUT_MS",
                defaults.command_timeout.as_millis() as u64,
            )?),
            send_queue: parse_or(&var, "SRMC_SEND_QUEUE", defaults.send_queue)?,
            forbidden_keys: var("SRMC_FORBIDDEN_KEYS")
                .map(|v| split_list(&v))
                .unwrap_or(defaults.forbidden_keys),
            privileged_role: defaults.privileged_role,
        };

        Ok(Self {
            host: var("SRMC_HOST").unwrap_or_else(|| "0.0.0.0".into()),
            port: parse_or(&var, "SRMC_PORT", 3000)?,
            tls_port: parse_or(&var, "SRMC_TLS_PORT", 3443)?,
            jwt_secret: var("SRMC_JWT_SECRET").unwrap_or_else(|| DEV_SECRET.into()),
            production,
            tls_cert: var("SRMC_TLS_CERT").map(PathBuf::from),
            tls_key: var("SRMC_TLS_KEY").map(PathBuf::from),
            gateway,
        })
    }

    pub fn tls_enabled(&self) -> bool {
        self.tls_cert.is_some() && self.tls_key.is_some()
    }

    pub fn uses_placeholder_secret(&self) -> bool {
        PLACEHOLDER_SECRETS.contains(&self.jwt_secret.as_str())
    }

    /// Settings that would leave a production server unusable or unsafe.
    pub fn validate(&self) -> anyhow::Result<()> {
        if self.tls_cert.is_some() != self.tls_key.is_some() {
            bail!("SRMC_TLS_CERT and SRMC_TLS_KEY must be set together");
        }
        if self.gateway.allowed_origins.is_empty() {
            bail!("SRMC_ALLOWED_ORIGINS is empty; every upgrade would be rejected");
        }
        if !self.production {
            return Ok(());
        }
        if self.uses_placeholder_secret() {
            bail!("SRMC_JWT_SECRET is unset or still a placeholder");
        }
        if !self.tls_enabled() && !self.gateway.trust_forwarded_proto {
            bail!("production requires SRMC_TLS_CERT/SRMC_TLS_KEY or SRMC_TRUST_FORWARDED_PROTO behind a TLS proxy");
        }
        Ok(())
    }
}

fn parse_or<T>(var: &impl Fn(&str) -> Option<String>, name: &str, default: T) -> anyhow::Result<T>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match var(name) {
        Some(raw) => raw
            .trim()
            .parse()
            .with_context(|| format!("invalid value for {}: {:?}", name, raw)),
        None => Ok(default),
    }
}

fn split_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}
