//! Runtime configuration.
//!
//! Layering, lowest to highest: built-in defaults, a JSON file, `AXC_*`
//! environment variables, then whatever the binary sets from its flags.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ExchangeError, Result};

pub const ENV_AGENT_URL: &str = "AXC_AGENT_URL";
pub const ENV_POLL_INTERVAL_MS: &str = "AXC_POLL_INTERVAL_MS";
pub const ENV_ACK_POLL_LIMIT: &str = "AXC_ACK_POLL_LIMIT";
pub const ENV_DISCOVERY_INTERVAL_MS: &str = "AXC_DISCOVERY_INTERVAL_MS";
pub const ENV_REQUEST_TIMEOUT_MS: &str = "AXC_REQUEST_TIMEOUT_MS";

/// Settings shared by every exchange component of a flow.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExchangeConfig {
    /// Base URL of the agent admin API. `None` means no HTTP agent.
    pub agent_url: Option<String>,
    /// Delay between state queries of one poll.
    pub poll_interval_ms: u64,
    /// Extra queries spent waiting for an acknowledgement after ready.
    pub ack_poll_limit: u32,
    /// Delay between discovery queries for offers and proof requests.
    pub discovery_interval_ms: u64,
    /// Per-request timeout of the HTTP agent client.
    pub request_timeout_ms: u64,
}

impl Default for ExchangeConfig {
    fn default() -> Self {
        Self {
            agent_url: None,
            poll_interval_ms: 1000,
            ack_poll_limit: 10,
            discovery_interval_ms: 1000,
            request_timeout_ms: 10_000,
        }
    }
}

impl ExchangeConfig {
    /// Read a JSON config file. Missing fields take their defaults.
    pub fn load(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let config: Self = serde_json::from_str(&raw)
            .map_err(|e| ExchangeError::Config(format!("{}: {e}", path.display())))?;
        log::debug!("loaded config from {}", path.display());
        Ok(config)
    }

    /// Apply `AXC_*` environment variables on top of `self`.
    pub fn with_env_overrides(self) -> Result<Self> {
        self.with_overrides_from(|key| std::env::var(key).ok())
    }

    /// Apply overrides read through `lookup`; split out so tests need not
    /// touch the process environment.
    pub fn with_overrides_from<F>(mut self, lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_AGENT_URL) {
            let url = url.trim();
            self.agent_url = (!url.is_empty()).then(|| url.to_string());
        }
        if let Some(v) = lookup(ENV_POLL_INTERVAL_MS) {
            self.poll_interval_ms = parse_number(ENV_POLL_INTERVAL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_ACK_POLL_LIMIT) {
            self.ack_poll_limit = parse_number(ENV_ACK_POLL_LIMIT, &v)?;
        }
        if let Some(v) = lookup(ENV_DISCOVERY_INTERVAL_MS) {
            self.discovery_interval_ms = parse_number(ENV_DISCOVERY_INTERVAL_MS, &v)?;
        }
        if let Some(v) = lookup(ENV_REQUEST_TIMEOUT_MS) {
            self.request_timeout_ms = parse_number(ENV_REQUEST_TIMEOUT_MS, &v)?;
        }
        Ok(self)
    }

    /// Reject settings that would spin or never time out.
    pub fn validate(&self) -> Result<()> {
        for (name, value) in [
            ("poll_interval_ms", self.poll_interval_ms),
            ("discovery_interval_ms", self.discovery_interval_ms),
            ("request_timeout_ms", self.request_timeout_ms),
        ] {
            if value == 0 {
                return Err(ExchangeError::Config(format!("{name} must be positive")));
            }
        }
        Ok(())
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_millis(self.discovery_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_millis(self.request_timeout_ms)
    }
}

fn parse_number<T: std::str::FromStr>(key: &str, raw: &str) -> Result<T> {
    raw.trim()
        .parse()
        .map_err(|_| ExchangeError::Config(format!("{key} is not a valid number: {raw:?}")))
}
