//! Load config from file and environment.

use serde::Deserialize;
use std::path::PathBuf;
use std::time::Duration;

use lanlink_core::DEFAULT_SERVICE_TYPE;

/// Daemon configuration. File: ~/.config/lanlink/config.toml or /etc/lanlink/config.toml.
/// Env overrides: LANLINK_SERVICE_TYPE, LANLINK_MIN_POLL_SECS, LANLINK_RECOVERY_DIR, LANLINK_LOG.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Config {
    /// DNS-SD service type to browse (default `_http._tcp.local`).
    #[serde(default = "default_service_type")]
    pub service_type: String,
    /// Shortest poll interval in seconds (default 30).
    #[serde(default = "default_min_poll_interval_secs")]
    pub min_poll_interval_secs: u64,
    /// How often the power watcher re-reads battery state (default 5).
    #[serde(default = "default_power_check_secs")]
    pub power_check_secs: u64,
    /// Where partial responses are kept (default ~/.local/state/lanlink/recovery).
    #[serde(default = "default_recovery_dir")]
    pub recovery_dir: PathBuf,
    #[serde(default = "default_openai_base_url")]
    pub openai_base_url: String,
    #[serde(default = "default_openrouter_base_url")]
    pub openrouter_base_url: String,
    /// tracing filter directive (default "info"); RUST_LOG wins when set.
    #[serde(default = "default_log_filter")]
    pub log_filter: String,
}

fn default_service_type() -> String {
    DEFAULT_SERVICE_TYPE.to_string()
}
fn default_min_poll_interval_secs() -> u64 {
    30
}
fn default_power_check_secs() -> u64 {
    5
}
fn default_recovery_dir() -> PathBuf {
    if let Some(state) = std::env::var_os("XDG_STATE_HOME") {
        return PathBuf::from(state).join("lanlink/recovery");
    }
    match std::env::var_os("HOME") {
        Some(home) => PathBuf::from(home).join(".local/state/lanlink/recovery"),
        None => PathBuf::from("/var/lib/lanlink/recovery"),
    }
}
fn default_openai_base_url() -> String {
    "https://api.openai.com/v1".to_string()
}
fn default_openrouter_base_url() -> String {
    "https://openrouter.ai/api/v1".to_string()
}
fn default_log_filter() -> String {
    "info".to_string()
}

impl Default for Config {
    fn default() -> Self {
        Self {
            service_type: default_service_type(),
            min_poll_interval_secs: default_min_poll_interval_secs(),
            power_check_secs: default_power_check_secs(),
            recovery_dir: default_recovery_dir(),
            openai_base_url: default_openai_base_url(),
            openrouter_base_url: default_openrouter_base_url(),
            log_filter: default_log_filter(),
        }
    }
}

impl Config {
    pub fn min_poll_interval(&self) -> Duration {
        Duration::from_secs(self.min_poll_interval_secs.max(1))
    }

    pub fn power_check_interval(&self) -> Duration {
        Duration::from_secs(self.power_check_secs.max(1))
    }
}

/// Load config: merge default, then config file (if present), then env vars.
pub fn load() -> Config {
    let mut c = load_file().unwrap_or_default();
    apply_env(&mut c, |k| std::env::var(k).ok());
    c
}

fn apply_env(c: &mut Config, var: impl Fn(&str) -> Option<String>) {
    if let Some(s) = var("LANLINK_SERVICE_TYPE") {
        if !s.is_empty() {
            c.service_type = s;
        }
    }
    if let Some(s) = var("LANLINK_MIN_POLL_SECS") {
        if let Ok(n) = s.parse::<u64>() {
            c.min_poll_interval_secs = n;
        }
    }
    if let Some(s) = var("LANLINK_RECOVERY_DIR") {
        if !s.is_empty() {
            c.recovery_dir = PathBuf::from(s);
        }
    }
    if let Some(s) = var("LANLINK_LOG") {
        if !s.is_empty() {
            c.log_filter = s;
        }
    }
}

fn config_paths() -> Vec<PathBuf> {
    let home = std::env::var_os("HOME").map(PathBuf::from);
    let mut out = Vec::new();
    if let Some(h) = home {
        out.push(h.join(".config/lanlink/config.toml"));
    }
    out.push(PathBuf::from("/etc/lanlink/config.toml"));
    out
}

fn load_file() -> Option<Config> {
    for p in config_paths() {
        if p.exists() {
            match std::fs::read_to_string(&p) {
                Ok(s) => match toml::from_str::<Config>(&s) {
                    Ok(c) => return Some(c),
                    Err(e) => tracing::warn!(path = %p.display(), error = %e, "ignoring invalid config"),
                },
                Err(e) => tracing::warn!(path = %p.display(), error = %e, "cannot read config"),
            }
            break;
        }
    }
    None
}
