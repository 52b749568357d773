//! Configuration for the node agent.

use std::net::SocketAddr;
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::supervisor::{BackoffPolicy, SupervisorPolicy};

/// Node agent configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Address the control listener binds to.
    pub listen_addr: SocketAddr,

    /// How long a new connection may take to deliver its manifest.
    pub manifest_timeout: Duration,

    /// Restart, health check and stop policy for managed processes.
    pub policy: SupervisorPolicy,

    /// Log level (trace, debug, info, warn, error).
    pub log_level: String,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            listen_addr: SocketAddr::from(([0, 0, 0, 0], 5999)),
            manifest_timeout: Duration::from_secs(10),
            policy: SupervisorPolicy::default(),
            log_level: "info".to_string(),
        }
    }
}

impl Config {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        let defaults = Config::default();

        let listen_addr =
            parse_var("CAMFLEET_AGENT_LISTEN_ADDR")?.unwrap_or(defaults.listen_addr);

        let manifest_timeout = parse_var("CAMFLEET_MANIFEST_TIMEOUT_SECS")?
            .map(Duration::from_secs)
            .unwrap_or(defaults.manifest_timeout);

        let base = defaults.policy;
        let policy = SupervisorPolicy {
            max_restarts: parse_var("CAMFLEET_MAX_RESTARTS")?.unwrap_or(base.max_restarts),
            backoff: BackoffPolicy {
                base: parse_var("CAMFLEET_BACKOFF_BASE_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(base.backoff.base),
                max: parse_var("CAMFLEET_BACKOFF_MAX_MS")?
                    .map(Duration::from_millis)
                    .unwrap_or(base.backoff.max),
                jitter: base.backoff.jitter,
            },
            health_interval: parse_var("CAMFLEET_HEALTH_INTERVAL_MS")?
                .map(Duration::from_millis)
                .unwrap_or(base.health_interval),
            finish_grace_multiplier: parse_var("CAMFLEET_FINISH_GRACE_MULTIPLIER")?
                .unwrap_or(base.finish_grace_multiplier),
            ..base
        };

        let log_level = std::env::var("CAMFLEET_LOG_LEVEL").unwrap_or(defaults.log_level);

        Ok(Self {
            listen_addr,
            manifest_timeout,
            policy,
            log_level,
        })
    }
}

/// Read and parse an optional variable. Unset is `None`, unparseable is an error.
fn parse_var<T>(name: &str) -> Result<Option<T>>
where
    T: FromStr,
    T::Err: std::error::Error + Send + Sync + 'static,
{
    match std::env::var(name) {
        Ok(raw) => raw
            .trim()
            .parse()
            .map(Some)
            .with_context(|| format!("invalid value for {name}: '{raw}'")),
        Err(_) => Ok(None),
    }
}
