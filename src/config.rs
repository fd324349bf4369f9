use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;

fn default_safety_margin() -> f64 {
    0.8
}

fn default_rotation_timeout_secs() -> u64 {
    30
}

fn default_lock_poll_interval_ms() -> u64 {
    250
}

fn default_lock_max_retries() -> u32 {
    40
}

fn default_request_timeout_secs() -> u64 {
    60
}

/// Deployment-level configuration for the gateway session subsystem.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SessionConfig {
    /// Base URL of the API gateway, e.g. `https://gateway.example.com`.
    pub gateway_url: String,
    /// Tenant identifier sent with every credential exchange.
    pub tenant_id: String,
    /// Directory holding the token state file and rotation lock, shared by
    /// every process of the same session.
    pub session_dir: PathBuf,
    /// Fraction of the server-reported credential TTL after which the
    /// credential is proactively treated as expired. Must be in (0, 1].
    #[serde(default = "default_safety_margin")]
    pub safety_margin: f64,
    /// Upper bound on a single credential-exchange call.
    #[serde(default = "default_rotation_timeout_secs")]
    pub rotation_timeout_secs: u64,
    /// Interval between checks of a rotation lock held by another process.
    #[serde(default = "default_lock_poll_interval_ms")]
    pub lock_poll_interval_ms: u64,
    /// How many times to re-check a foreign rotation lock before giving up.
    #[serde(default = "default_lock_max_retries")]
    pub lock_max_retries: u32,
    /// Per-request timeout on ordinary gateway calls.
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl SessionConfig {
    pub fn new(
        gateway_url: impl Into<String>,
        tenant_id: impl Into<String>,
        session_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            gateway_url: gateway_url.into(),
            tenant_id: tenant_id.into(),
            session_dir: session_dir.into(),
            safety_margin: default_safety_margin(),
            rotation_timeout_secs: default_rotation_timeout_secs(),
            lock_poll_interval_ms: default_lock_poll_interval_ms(),
            lock_max_retries: default_lock_max_retries(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }

    pub fn from_file(path: &str) -> Result<Self> {
        let raw = fs::read_to_string(path).context("reading session config file")?;
        let cfg: SessionConfig = serde_json::from_str(&raw).context("parsing session config")?;
        cfg.validate()?;
        Ok(cfg)
    }

    /// Environment overrides, applied after file defaults:
    /// `GATEWAY_URL`, `GATEWAY_TENANT_ID`, `GATEWAY_SESSION_DIR`.
    pub fn apply_env_overrides(self) -> Self {
        self.apply_overrides(|key| std::env::var(key).ok())
    }

    fn apply_overrides(mut self, get: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(url) = get("GATEWAY_URL") {
            self.gateway_url = url;
        }
        if let Some(tenant) = get("GATEWAY_TENANT_ID") {
            self.tenant_id = tenant;
        }
        if let Some(dir) = get("GATEWAY_SESSION_DIR") {
            self.session_dir = PathBuf::from(dir);
        }
        self
    }

    pub fn validate(&self) -> Result<()> {
        if !(self.safety_margin > 0.0 && self.safety_margin <= 1.0) {
            anyhow::bail!(
                "safety_margin must be in (0, 1], got {}",
                self.safety_margin
            );
        }
        if self.gateway_url.is_empty() {
            anyhow::bail!("gateway_url must not be empty");
        }
        Ok(())
    }

    pub fn rotation_timeout(&self) -> Duration {
        Duration::from_secs(self.rotation_timeout_secs)
    }

    pub fn lock_poll_interval(&self) -> Duration {
        Duration::from_millis(self.lock_poll_interval_ms)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_config_parsing_with_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "gateway_url": "https://gateway.test",
                "tenant_id": "acme",
                "session_dir": "/tmp/session"
            }}"#
        )
        .unwrap();

        let config = SessionConfig::from_file(file.path().to_str().unwrap()).unwrap();
        assert_eq!(config.gateway_url, "https://gateway.test");
        assert_eq!(config.tenant_id, "acme");
        assert_eq!(config.safety_margin, 0.8);
        assert_eq!(config.rotation_timeout_secs, 30);
        assert_eq!(config.lock_max_retries, 40);
    }

    #[test]
    fn test_config_rejects_bad_margin() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"{{
                "gateway_url": "https://gateway.test",
                "tenant_id": "acme",
                "session_dir": "/tmp/session",
                "safety_margin": 1.5
            }}"#
        )
        .unwrap();

        assert!(SessionConfig::from_file(file.path().to_str().unwrap()).is_err());
    }

    #[test]
    fn test_config_missing_file() {
        assert!(SessionConfig::from_file("/nonexistent/session.json").is_err());
    }

    #[test]
    fn test_overrides_replace_file_values() {
        // Exercised through the injectable lookup so the test never touches
        // process-wide environment state.
        let cfg = SessionConfig::new("https://g", "acme", "/tmp/s").apply_overrides(|key| {
            (key == "GATEWAY_TENANT_ID").then(|| "other-tenant".to_string())
        });
        assert_eq!(cfg.tenant_id, "other-tenant");
        assert_eq!(cfg.gateway_url, "https://g");
    }

    #[test]
    fn test_zero_margin_is_invalid() {
        let mut cfg = SessionConfig::new("https://g", "t", "/tmp/s");
        cfg.safety_margin = 0.0;
        assert!(cfg.validate().is_err());
    }
}
