//! Load config from file and environment.

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use tracing::warn;

/// Daemon configuration. File: ~/.config/groupride/config.toml or /etc/groupride/config.toml.
/// Env overrides: GROUPRIDE_DISPLAY_NAME, GROUPRIDE_DISCOVERY_PORT, GROUPRIDE_TRANSPORT_PORT,
/// GROUPRIDE_TICK_MS.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// Name shown to other riders (default: $USER, else "rider").
    #[serde(default = "default_display_name")]
    pub display_name: String,
    /// Discovery multicast UDP port (default 45680).
    #[serde(default = "default_discovery_port")]
    pub discovery_port: u16,
    /// Peer datagram port (default 45681).
    #[serde(default = "default_transport_port")]
    pub transport_port: u16,
    /// Core tick period in milliseconds (default 250).
    #[serde(default = "default_tick_ms")]
    pub tick_ms: u64,
    /// Optional core timing overrides, in seconds.
    #[serde(default)]
    pub liveness_timeout_secs: Option<u64>,
    #[serde(default)]
    pub grace_period_secs: Option<u64>,
    #[serde(default)]
    pub join_timeout_secs: Option<u64>,
    #[serde(default)]
    pub host_silence_timeout_secs: Option<u64>,
}

fn default_display_name() -> String {
    std::env::var("USER")
        .ok()
        .filter(|s| !s.is_empty())
        .unwrap_or_else(|| "rider".to_string())
}
fn default_discovery_port() -> u16 {
    45680
}
fn default_transport_port() -> u16 {
    45681
}
fn default_tick_ms() -> u64 {
    250
}

impl Default for Config {
    fn default() -> Self {
        Self {
            display_name: default_display_name(),
            discovery_port: default_discovery_port(),
            transport_port: default_transport_port(),
            tick_ms: default_tick_ms(),
            liveness_timeout_secs: None,
            grace_period_secs: None,
            join_timeout_secs: None,
            host_silence_timeout_secs: None,
        }
    }
}

impl Config {
    pub fn parse(s: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(s)
    }

    pub fn tick(&self) -> Duration {
        Duration::from_millis(self.tick_ms.max(10))
    }

    /// Core timing config with any file overrides applied.
    pub fn to_core_config(&self) -> ride_core::Config {
        let mut c = ride_core::Config::default();
        if let Some(s) = self.liveness_timeout_secs {
            c.liveness_timeout = Duration::from_secs(s);
        }
        if let Some(s) = self.grace_period_secs {
            c.grace_period = Duration::from_secs(s);
        }
        if let Some(s) = self.join_timeout_secs {
            c.join_timeout = Duration::from_secs(s);
        }
        if let Some(s) = self.host_silence_timeout_secs {
            c.host_silence_timeout = Duration::from_secs(s);
        }
        c
    }

    /// Apply env overrides. Unparseable values are ignored.
    fn apply_env(&mut self, var: impl Fn(&str) -> Option<String>) {
        if let Some(s) = var("GROUPRIDE_DISPLAY_NAME").filter(|s| !s.trim().is_empty()) {
            self.display_name = s.trim().to_string();
        }
        if let Some(p) = var("GROUPRIDE_DISCOVERY_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.discovery_port = p;
        }
        if let Some(p) = var("GROUPRIDE_TRANSPORT_PORT").and_then(|s| s.parse::<u16>().ok()) {
            self.transport_port = p;
        }
        if let Some(ms) = var("GROUPRIDE_TICK_MS").and_then(|s| s.parse::<u64>().ok()) {
            self.tick_ms = ms;
        }
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    c.apply_env(|k| std::env::var(k).ok());
    c
}

/// Load from an explicit path (errors are fatal), then env vars.
pub fn load_path(path: &Path) -> anyhow::Result<Config> {
    let s = std::fs::read_to_string(path)
        .with_context(|| format!("reading config {}", path.display()))?;
    let mut c =
        Config::parse(&s).with_context(|| format!("parsing config {}", path.display()))?;
    c.apply_env(|k| std::env::var(k).ok());
    Ok(c)
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/groupride/config.toml"));
    }
    out.push(PathBuf::from("/etc/groupride/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p).map(|s| Config::parse(&s)) {
                Ok(Ok(c)) => return Some(c),
                Ok(Err(e)) => warn!(path = %p.display(), error = %e, "invalid config; using defaults"),
                Err(e) => warn!(path = %p.display(), error = %e, "unreadable config; using defaults"),
            }
            break;
        }
    }
    None
}
