//! Runtime configuration.
//!
//! Settings layer an optional TOML file under environment variables, so
//! `API_PORT=9000 lab serve` works without a file and a file works without
//! the environment. Field names map 1:1 onto the upper-cased variable names.

use std::fmt;
use std::str::FromStr;

use anyhow::{Context, Result};
use config::{Config, Environment, File, FileFormat};
use serde::Deserialize;

/// An inclusive port range, configured as `lo-hi` (e.g. `9300-9500`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(try_from = "String")]
pub struct PortRange {
    pub lo: u16,
    pub hi: u16,
}

impl PortRange {
    pub fn len(&self) -> usize {
        (self.hi - self.lo) as usize + 1
    }

    pub fn contains(&self, port: u16) -> bool {
        (self.lo..=self.hi).contains(&port)
    }
}

impl FromStr for PortRange {
    type Err = anyhow::Error;

    fn from_str(raw: &str) -> Result<Self> {
        let (lo, hi) = raw
            .split_once('-')
            .with_context(|| format!("port range '{raw}' is not of the form lo-hi"))?;
        let lo: u16 = lo.trim().parse().context("parsing range start")?;
        let hi: u16 = hi.trim().parse().context("parsing range end")?;
        anyhow::ensure!(lo <= hi, "port range start {lo} exceeds end {hi}");
        Ok(PortRange { lo, hi })
    }
}

impl TryFrom<String> for PortRange {
    type Error = anyhow::Error;

    fn try_from(raw: String) -> Result<Self> {
        raw.parse()
    }
}

impl fmt::Display for PortRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.lo, self.hi)
    }
}

/// Names of the shared volumes mounted into every session cluster.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct SharedVolumes {
    pub workspaces: String,
    pub opencode_auth: String,
    pub browser_socket: String,
}

impl Default for SharedVolumes {
    fn default() -> Self {
        Self {
            workspaces: "workspaces".to_string(),
            opencode_auth: "opencode-auth".to_string(),
            browser_socket: "browser-socket".to_string(),
        }
    }
}

impl SharedVolumes {
    pub fn names(&self) -> [&str; 3] {
        [&self.workspaces, &self.opencode_auth, &self.browser_socket]
    }
}

/// Process-wide configuration, resolved once at startup.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Port the JSON API and channel bus listen on.
    pub api_port: u16,
    /// Port the subdomain proxy listens on.
    pub proxy_port: u16,
    /// Base domain the proxy routes under (`<session>--<port>.<base>`).
    pub proxy_base_domain: String,
    /// Idle timeout for proxied connections, seconds.
    pub proxy_idle_timeout_secs: u64,
    /// Base URL of the browser daemon HTTP API.
    pub browser_api_url: String,
    /// Host clients use for browser stream WebSockets.
    pub browser_ws_host: String,
    /// Debounce before stopping an unviewed browser, milliseconds.
    pub browser_cleanup_delay_ms: u64,
    /// Browser reconciler tick interval, milliseconds.
    pub reconcile_interval_ms: u64,
    /// Start attempts before a browser session is parked in error.
    pub max_daemon_retries: u32,
    /// Port range for browser stream allocations.
    pub stream_port_range: PortRange,
    /// SQLite database URL.
    pub database_url: String,
    /// Sandbox provider endpoint (exported as DOCKER_HOST when set).
    pub sandbox_endpoint: Option<String>,
    pub shared_volumes: SharedVolumes,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            api_port: 4100,
            proxy_port: 4180,
            proxy_base_domain: "lab.localhost".to_string(),
            proxy_idle_timeout_secs: 255,
            browser_api_url: "http://127.0.0.1:9221".to_string(),
            browser_ws_host: "127.0.0.1".to_string(),
            browser_cleanup_delay_ms: 10_000,
            reconcile_interval_ms: 5_000,
            max_daemon_retries: 3,
            stream_port_range: PortRange { lo: 9300, hi: 9500 },
            database_url: "sqlite://data/lab.db?mode=rwc".to_string(),
            sandbox_endpoint: None,
            shared_volumes: SharedVolumes::default(),
        }
    }
}

impl Settings {
    /// Load settings from an optional TOML file plus the environment.
    pub fn load(config_file: Option<&str>) -> Result<Self> {
        let mut builder = Config::builder();
        if let Some(path) = config_file {
            builder = builder.add_source(File::new(path, FileFormat::Toml));
        } else {
            builder = builder.add_source(File::new("lab", FileFormat::Toml).required(false));
        }
        let config = builder
            .add_source(Environment::default().try_parsing(true))
            .build()
            .context("building configuration")?;

        config
            .try_deserialize::<Settings>()
            .context("deserializing configuration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn port_range_parses() {
        let range: PortRange = "9300-9500".parse().unwrap();
        assert_eq!(range.lo, 9300);
        assert_eq!(range.hi, 9500);
        assert_eq!(range.len(), 201);
        assert!(range.contains(9300));
        assert!(range.contains(9500));
        assert!(!range.contains(9501));
    }

    #[test]
    fn port_range_rejects_inverted_and_garbage() {
        assert!("9500-9300".parse::<PortRange>().is_err());
        assert!("9300".parse::<PortRange>().is_err());
        assert!("a-b".parse::<PortRange>().is_err());
    }

    #[test]
    fn defaults_match_documented_values() {
        let settings = Settings::default();
        assert_eq!(settings.browser_cleanup_delay_ms, 10_000);
        assert_eq!(settings.reconcile_interval_ms, 5_000);
        assert_eq!(settings.max_daemon_retries, 3);
        assert_eq!(settings.proxy_idle_timeout_secs, 255);
    }
}
