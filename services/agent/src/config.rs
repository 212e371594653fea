//! Agent configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/scada-bridge/agent.toml`. When that file does
//! not exist the agent runs on built-in defaults; an explicit `--config`
//! path must be readable.
//!
//! # Required fields
//! - `schema_version = 1` (when a file is given)
//!
//! Every section is optional and falls back to the defaults below.

use crate::retry::{CloudBackoff, LocalRetryPolicy};
use crate::settings::EndpointConfig;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const DEFAULT_CONFIG_PATH: &str = "/etc/scada-bridge/agent.toml";

// ---------------------------------------------------------------------------
// Config types
// ---------------------------------------------------------------------------

/// Top-level agent configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct AgentConfig {
    pub schema_version: u32,
    /// Optional human-readable name sent in `identify` (e.g. "Plant A").
    pub agent_name: Option<String>,
    pub cloud: CloudConfig,
    pub local_api: LocalApiConfig,
    pub realtime: RealtimeConfig,
    pub settings: SettingsConfig,
    pub status_http: StatusHttpConfig,
}

#[derive(Debug, Clone, PartialEq)]
pub struct CloudConfig {
    pub fallback_host: String,
    pub fallback_http_port: u16,
    pub fallback_ws_port: u16,
    pub ws_path: String,
    pub use_tls: bool,
    pub heartbeat_secs: u64,
    pub reconnect_initial_ms: u64,
    pub reconnect_max_ms: u64,
    pub connect_timeout_ms: u64,
    /// Drop all watched registers when the cloud session ends.
    pub clear_subscriptions_on_disconnect: bool,
}

#[derive(Debug, Clone, PartialEq)]
pub struct LocalApiConfig {
    pub base_url: String,
    pub timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct RealtimeConfig {
    pub url: String,
    pub fast_retry_attempts: u32,
    pub fast_retry_delay_ms: u64,
    pub slow_retry_delay_ms: u64,
    pub connect_timeout_ms: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SettingsConfig {
    /// JSON settings document written by the main application.
    pub path: PathBuf,
    pub poll_secs: u64,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StatusHttpConfig {
    pub enabled: bool,
    pub bind: String,
}

impl Default for CloudConfig {
    fn default() -> Self {
        CloudConfig {
            fallback_host: "localhost".to_owned(),
            fallback_http_port: 4000,
            fallback_ws_port: 4001,
            ws_path: "/ws/agent".to_owned(),
            use_tls: false,
            heartbeat_secs: 30,
            reconnect_initial_ms: 1000,
            reconnect_max_ms: 5000,
            connect_timeout_ms: 20_000,
            clear_subscriptions_on_disconnect: false,
        }
    }
}

impl Default for LocalApiConfig {
    fn default() -> Self {
        LocalApiConfig {
            base_url: "http://localhost:3000".to_owned(),
            timeout_ms: 30_000,
        }
    }
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        RealtimeConfig {
            url: "ws://localhost:3001/ws/realtime".to_owned(),
            fast_retry_attempts: 3,
            fast_retry_delay_ms: 2000,
            slow_retry_delay_ms: 30_000,
            connect_timeout_ms: 10_000,
        }
    }
}

impl Default for SettingsConfig {
    fn default() -> Self {
        SettingsConfig {
            path: PathBuf::from("/var/lib/scada-bridge/cloud_settings.json"),
            poll_secs: 60,
        }
    }
}

impl Default for StatusHttpConfig {
    fn default() -> Self {
        StatusHttpConfig {
            enabled: true,
            bind: "127.0.0.1:8090".to_owned(),
        }
    }
}

impl CloudConfig {
    pub fn fallback_endpoint(&self) -> EndpointConfig {
        EndpointConfig {
            host: self.fallback_host.clone(),
            http_port: self.fallback_http_port,
            ws_port: self.fallback_ws_port,
        }
    }

    pub fn backoff(&self) -> CloudBackoff {
        CloudBackoff {
            initial: Duration::from_millis(self.reconnect_initial_ms),
            max: Duration::from_millis(self.reconnect_max_ms),
        }
    }

    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_secs(self.heartbeat_secs)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

impl RealtimeConfig {
    pub fn retry_policy(&self) -> LocalRetryPolicy {
        LocalRetryPolicy {
            fast_attempts: self.fast_retry_attempts,
            fast_delay: Duration::from_millis(self.fast_retry_delay_ms),
            slow_delay: Duration::from_millis(self.slow_retry_delay_ms),
        }
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    agent_name: Option<String>,
    cloud: Option<RawCloudConfig>,
    local_api: Option<RawLocalApiConfig>,
    realtime: Option<RawRealtimeConfig>,
    settings: Option<RawSettingsConfig>,
    status_http: Option<RawStatusHttpConfig>,
}

#[derive(Debug, Default, Deserialize)]
struct RawCloudConfig {
    fallback_host: Option<String>,
    fallback_http_port: Option<u16>,
    fallback_ws_port: Option<u16>,
    ws_path: Option<String>,
    use_tls: Option<bool>,
    heartbeat_secs: Option<u64>,
    reconnect_initial_ms: Option<u64>,
    reconnect_max_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
    clear_subscriptions_on_disconnect: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
struct RawLocalApiConfig {
    base_url: Option<String>,
    timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawRealtimeConfig {
    url: Option<String>,
    fast_retry_attempts: Option<u32>,
    fast_retry_delay_ms: Option<u64>,
    slow_retry_delay_ms: Option<u64>,
    connect_timeout_ms: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawSettingsConfig {
    path: Option<String>,
    poll_secs: Option<u64>,
}

#[derive(Debug, Default, Deserialize)]
struct RawStatusHttpConfig {
    enabled: Option<bool>,
    bind: Option<String>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load agent config from an explicit path. The file must exist.
pub fn load_config_from_path(path: &Path) -> Result<AgentConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load agent config from the default path, or built-in defaults when that
/// file does not exist.
pub fn load_config() -> Result<AgentConfig, ConfigError> {
    let path = Path::new(DEFAULT_CONFIG_PATH);
    if !path.exists() {
        return Ok(AgentConfig::defaults());
    }
    load_config_from_path(path)
}

/// Load agent config from a TOML string.
pub fn load_config_from_str(toml_str: &str) -> Result<AgentConfig, ConfigError> {
    let raw: RawConfig = toml::from_str(toml_str).map_err(|e| ConfigError::Parse(e.to_string()))?;

    let schema_version = raw
        .schema_version
        .ok_or_else(|| ConfigError::MissingField("schema_version".to_owned()))?;
    if schema_version != 1 {
        return Err(ConfigError::InvalidValue(format!(
            "schema_version must be 1, got {}",
            schema_version
        )));
    }

    let c = raw.cloud.unwrap_or_default();
    let d = CloudConfig::default();
    let cloud = CloudConfig {
        fallback_host: c.fallback_host.unwrap_or(d.fallback_host),
        fallback_http_port: c.fallback_http_port.unwrap_or(d.fallback_http_port),
        fallback_ws_port: c.fallback_ws_port.unwrap_or(d.fallback_ws_port),
        ws_path: c.ws_path.unwrap_or(d.ws_path),
        use_tls: c.use_tls.unwrap_or(d.use_tls),
        heartbeat_secs: c.heartbeat_secs.unwrap_or(d.heartbeat_secs),
        reconnect_initial_ms: c.reconnect_initial_ms.unwrap_or(d.reconnect_initial_ms),
        reconnect_max_ms: c.reconnect_max_ms.unwrap_or(d.reconnect_max_ms),
        connect_timeout_ms: c.connect_timeout_ms.unwrap_or(d.connect_timeout_ms),
        clear_subscriptions_on_disconnect: c
            .clear_subscriptions_on_disconnect
            .unwrap_or(d.clear_subscriptions_on_disconnect),
    };

    let l = raw.local_api.unwrap_or_default();
    let d = LocalApiConfig::default();
    let local_api = LocalApiConfig {
        base_url: l.base_url.unwrap_or(d.base_url),
        timeout_ms: l.timeout_ms.unwrap_or(d.timeout_ms),
    };

    let r = raw.realtime.unwrap_or_default();
    let d = RealtimeConfig::default();
    let realtime = RealtimeConfig {
        url: r.url.unwrap_or(d.url),
        fast_retry_attempts: r.fast_retry_attempts.unwrap_or(d.fast_retry_attempts),
        fast_retry_delay_ms: r.fast_retry_delay_ms.unwrap_or(d.fast_retry_delay_ms),
        slow_retry_delay_ms: r.slow_retry_delay_ms.unwrap_or(d.slow_retry_delay_ms),
        connect_timeout_ms: r.connect_timeout_ms.unwrap_or(d.connect_timeout_ms),
    };

    let s = raw.settings.unwrap_or_default();
    let d = SettingsConfig::default();
    let settings = SettingsConfig {
        path: s.path.map(PathBuf::from).unwrap_or(d.path),
        poll_secs: s.poll_secs.unwrap_or(d.poll_secs),
    };

    let h = raw.status_http.unwrap_or_default();
    let d = StatusHttpConfig::default();
    let status_http = StatusHttpConfig {
        enabled: h.enabled.unwrap_or(d.enabled),
        bind: h.bind.unwrap_or(d.bind),
    };

    let cfg = AgentConfig {
        schema_version,
        agent_name: raw.agent_name.filter(|n| !n.trim().is_empty()),
        cloud,
        local_api,
        realtime,
        settings,
        status_http,
    };
    validate(&cfg)?;
    Ok(cfg)
}

impl AgentConfig {
    /// Built-in configuration used when no config file exists.
    pub fn defaults() -> Self {
        AgentConfig {
            schema_version: 1,
            agent_name: None,
            cloud: CloudConfig::default(),
            local_api: LocalApiConfig::default(),
            realtime: RealtimeConfig::default(),
            settings: SettingsConfig::default(),
            status_http: StatusHttpConfig::default(),
        }
    }
}

fn validate(cfg: &AgentConfig) -> Result<(), ConfigError> {
    if cfg.cloud.reconnect_initial_ms == 0 {
        return Err(ConfigError::InvalidValue(
            "cloud.reconnect_initial_ms must be greater than 0".to_owned(),
        ));
    }
    if cfg.cloud.reconnect_max_ms < cfg.cloud.reconnect_initial_ms {
        return Err(ConfigError::InvalidValue(format!(
            "cloud.reconnect_max_ms ({}) must be >= cloud.reconnect_initial_ms ({})",
            cfg.cloud.reconnect_max_ms, cfg.cloud.reconnect_initial_ms
        )));
    }
    if cfg.cloud.heartbeat_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "cloud.heartbeat_secs must be greater than 0".to_owned(),
        ));
    }
    for (field, value) in [
        ("cloud.connect_timeout_ms", cfg.cloud.connect_timeout_ms),
        ("local_api.timeout_ms", cfg.local_api.timeout_ms),
        ("realtime.fast_retry_delay_ms", cfg.realtime.fast_retry_delay_ms),
        ("realtime.slow_retry_delay_ms", cfg.realtime.slow_retry_delay_ms),
        ("realtime.connect_timeout_ms", cfg.realtime.connect_timeout_ms),
    ] {
        if value == 0 {
            return Err(ConfigError::InvalidValue(format!(
                "{} must be greater than 0",
                field
            )));
        }
    }
    if cfg.realtime.fast_retry_attempts == 0 {
        return Err(ConfigError::InvalidValue(
            "realtime.fast_retry_attempts must be at least 1".to_owned(),
        ));
    }
    if cfg.settings.poll_secs == 0 {
        return Err(ConfigError::InvalidValue(
            "settings.poll_secs must be greater than 0".to_owned(),
        ));
    }
    let base_url = &cfg.local_api.base_url;
    if !(base_url.starts_with("http://") || base_url.starts_with("https://")) {
        return Err(ConfigError::InvalidValue(format!(
            "local_api.base_url must start with http:// or https://, got '{}'",
            base_url
        )));
    }
    let url = &cfg.realtime.url;
    if !(url.starts_with("ws://") || url.starts_with("wss://")) {
        return Err(ConfigError::InvalidValue(format!(
            "realtime.url must start with ws:// or wss://, got '{}'",
            url
        )));
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// Error type
// ---------------------------------------------------------------------------

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("IO error: {0}")]
    Io(String),
    #[error("Parse error: {0}")]
    Parse(String),
    #[error("Missing required field: {0}")]
    MissingField(String),
    #[error("Invalid config value: {0}")]
    InvalidValue(String),
}
