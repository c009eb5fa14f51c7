use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration loaded from `~/.probefleet/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub daemon: DaemonConfig,
    #[serde(default)]
    pub admission: AdmissionConfig,
    #[serde(default)]
    pub fabric: FabricConfig,
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            daemon: DaemonConfig::default(),
            admission: AdmissionConfig::default(),
            fabric: FabricConfig::default(),
            state: StateConfig::default(),
            scheduler: SchedulerConfig::default(),
            auth: AuthConfig::default(),
        }
    }
}

impl Config {
    /// Load config from `~/.probefleet/config.toml`, falling back to
    /// defaults when the file does not exist.
    pub fn load() -> Result<Self, ConfigError> {
        let path = Self::default_path();
        if path.exists() {
            Self::load_from(path)
        } else {
            Ok(Config::default())
        }
    }

    /// Load from a specific path.
    pub fn load_from(path: impl Into<PathBuf>) -> Result<Self, ConfigError> {
        let path = path.into();
        let text =
            std::fs::read_to_string(&path).map_err(|e| ConfigError::Io(e.to_string()))?;
        let cfg: Config =
            toml::from_str(&text).map_err(|e| ConfigError::Parse(e.to_string()))?;
        Ok(cfg)
    }

    /// Serialize config to TOML string.
    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Parse(e.to_string()))
    }

    fn default_path() -> PathBuf {
        dirs::home_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join(".probefleet")
            .join("config.toml")
    }
}

// ---------------------------------------------------------------------------
// Sections
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DaemonConfig {
    pub host: String,
    pub port: u16,
    /// Key required on admin routes. `None` allows everything (dev mode).
    #[serde(default)]
    pub admin_api_key: Option<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            admin_api_key: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AdmissionConfig {
    /// Maximum number of tickets parked in the wait queue.
    pub max_queue: usize,
    /// Wall-clock budget for a queued admission, seconds.
    pub queue_wait_secs: u64,
    /// Sweeper cadence, seconds.
    pub sweep_interval_secs: u64,
    /// Minute-window length, seconds. Only tests should shrink this.
    pub minute_window_secs: u64,
    /// Hour-window length, seconds. Only tests should shrink this.
    pub hour_window_secs: u64,
}

impl Default for AdmissionConfig {
    fn default() -> Self {
        Self {
            max_queue: 1000,
            queue_wait_secs: 60,
            sweep_interval_secs: 5,
            minute_window_secs: 60,
            hour_window_secs: 3600,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FabricConfig {
    /// Expected node heartbeat cadence, seconds. A session is stale after
    /// three missed intervals.
    pub heartbeat_interval_secs: u64,
    /// How long a fresh connection may take to authenticate, seconds.
    pub auth_timeout_secs: u64,
    /// Default job deadline, seconds.
    pub default_job_timeout_secs: u64,
    /// Policy cap on caller-supplied job deadlines, seconds.
    pub max_job_timeout_secs: u64,
    /// Reconnect pacing advertised to nodes in the welcome frame.
    pub reconnect_min_delay_ms: u64,
    pub reconnect_max_delay_ms: u64,
    pub reconnect_jitter: f64,
}

impl FabricConfig {
    /// Staleness threshold: three missed heartbeat intervals.
    pub fn stale_after_secs(&self) -> u64 {
        self.heartbeat_interval_secs * 3
    }
}

impl Default for FabricConfig {
    fn default() -> Self {
        Self {
            heartbeat_interval_secs: 15,
            auth_timeout_secs: 5,
            default_job_timeout_secs: 30,
            max_job_timeout_secs: 120,
            reconnect_min_delay_ms: 1000,
            reconnect_max_delay_ms: 30000,
            reconnect_jitter: 0.10,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// Path of the SQLite state database.
    pub path: String,
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            path: "~/.probefleet/state.db".to_string(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Scheduler tick cadence, seconds.
    pub tick_secs: u64,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self { tick_secs: 30 }
    }
}

/// Config-seeded identity records.
///
/// The real user/key stores are external collaborators; these entries let a
/// standalone daemon resolve authenticated principals without them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AuthConfig {
    #[serde(default)]
    pub users: Vec<UserEntry>,
    #[serde(default)]
    pub api_keys: Vec<ApiKeyEntry>,
    #[serde(default)]
    pub bearer_tokens: Vec<BearerTokenEntry>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    pub id: i64,
    pub email: String,
    #[serde(default)]
    pub tier: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiKeyEntry {
    pub id: i64,
    pub key: String,
    pub user_id: i64,
    /// RFC 3339 timestamp; absent means the key never expires.
    #[serde(default)]
    pub expires_at: Option<String>,
    #[serde(default = "default_true")]
    pub is_active: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BearerTokenEntry {
    pub token: String,
    /// Subject email the token authenticates as.
    pub subject: String,
    /// RFC 3339 timestamp; absent means the token never expires.
    #[serde(default)]
    pub expires_at: Option<String>,
}

fn default_true() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("config io error: {0}")]
    Io(String),
    #[error("config parse error: {0}")]
    Parse(String),
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_carry_spec_constants() {
        let cfg = Config::default();
        assert_eq!(cfg.admission.max_queue, 1000);
        assert_eq!(cfg.admission.queue_wait_secs, 60);
        assert_eq!(cfg.admission.sweep_interval_secs, 5);
        assert_eq!(cfg.fabric.auth_timeout_secs, 5);
        assert_eq!(cfg.fabric.stale_after_secs(), 45);
        assert_eq!(cfg.fabric.default_job_timeout_secs, 30);
        assert_eq!(cfg.fabric.reconnect_min_delay_ms, 1000);
        assert_eq!(cfg.fabric.reconnect_max_delay_ms, 30000);
    }

    #[test]
    fn toml_roundtrip() {
        let cfg = Config::default();
        let text = cfg.to_toml().expect("serialize");
        let back: Config = toml::from_str(&text).expect("parse");
        assert_eq!(back.daemon.port, cfg.daemon.port);
        assert_eq!(back.admission.max_queue, cfg.admission.max_queue);
    }

    #[test]
    fn partial_file_fills_defaults() {
        let cfg: Config = toml::from_str("[daemon]\nhost = \"0.0.0.0\"\nport = 9999\n")
            .expect("parse partial config");
        assert_eq!(cfg.daemon.port, 9999);
        assert_eq!(cfg.admission.max_queue, 1000);
    }
}
