//! Agent configuration loading.
//!
//! TOML is the sole config source; no environment variable overrides.
//! Default config path: `/etc/pb-agent/agent.toml`.
//!
//! # Required fields
//! - `schema_version = 1`
//!
//! Everything else has a default. The access token is never written in the
//! TOML: it lives in the settings store, optionally seeded at startup from
//! `auth.token_file` (raw token on a single line, trimmed on read).
//!
//! The `[timing]` section exists so tests can collapse the reconnect and
//! polling cadences; production deployments should not need to touch it.

use serde::Deserialize;
use std::path::{Path, PathBuf};

// ---------------------------------------------------------------------------
// Config types (deserialized from TOML)
// ---------------------------------------------------------------------------

/// Top-level agent configuration.
#[derive(Debug, Clone)]
pub struct AgentConfig {
    pub schema_version: u32,
    /// Token seeded from `auth.token_file`, if configured and readable.
    pub seed_token: Option<String>,
    pub server: ServerConfig,
    pub store: StoreConfig,
    pub prefs: PrefsConfig,
    pub timing: TimingConfig,
}

#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// REST base, e.g. `https://api.pushbullet.com/v2`.
    pub api_base: String,
    /// Stream base; the token is appended as the final path segment.
    pub stream_base: String,
}

#[derive(Debug, Clone)]
pub struct StoreConfig {
    pub sqlite_path: PathBuf,
}

/// Preference defaults. The store's roamed partition overrides these once
/// a value has been written there.
#[derive(Debug, Clone)]
pub struct PrefsConfig {
    pub device_nickname: String,
    pub auto_open_links: bool,
    pub auto_open_links_on_reconnect: bool,
    pub max_auto_open_per_reconnect: u32,
    pub notification_timeout_ms: u64,
    pub cache_ttl_ms: u64,
}

#[derive(Debug, Clone)]
pub struct TimingConfig {
    /// One-shot reconnect delay after a transient close.
    pub reconnect_delay_ms: u64,
    /// Heartbeat watchdog period.
    pub health_check_period_ms: u64,
    /// Absence-of-nop threshold the watchdog reports on.
    pub nop_stale_threshold_ms: u64,
    /// Pipeline-2 period while in polling fallback.
    pub polling_period_ms: u64,
    /// Long-sleep recovery period.
    pub long_sleep_period_ms: u64,
    /// Cache age beyond which startup forces a full re-init.
    pub downtime_warning_ms: u64,
    /// Overall timeout for each REST call.
    pub http_timeout_ms: u64,
}

pub const DEFAULT_API_BASE: &str = "https://api.pushbullet.com/v2";
pub const DEFAULT_STREAM_BASE: &str = "wss://stream.pushbullet.com/websocket";

/// Client version reported in the device registration body.
pub const APP_VERSION: u32 = 2;

impl Default for PrefsConfig {
    fn default() -> Self {
        Self {
            device_nickname: "Chrome".to_owned(),
            auto_open_links: false,
            auto_open_links_on_reconnect: false,
            max_auto_open_per_reconnect: 5,
            notification_timeout_ms: 10_000,
            cache_ttl_ms: 300_000,
        }
    }
}

impl Default for TimingConfig {
    fn default() -> Self {
        Self {
            reconnect_delay_ms: 30_000,
            health_check_period_ms: 30_000,
            nop_stale_threshold_ms: 15_000,
            polling_period_ms: 60_000,
            long_sleep_period_ms: 300_000,
            downtime_warning_ms: 3_600_000,
            http_timeout_ms: 10_000,
        }
    }
}

// ---------------------------------------------------------------------------
// Raw TOML deserialization types (with Option for optional fields)
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct RawConfig {
    schema_version: Option<u32>,
    server: Option<RawServerConfig>,
    auth: Option<RawAuthConfig>,
    store: Option<RawStoreConfig>,
    prefs: Option<RawPrefsConfig>,
    timing: Option<RawTimingConfig>,
}

#[derive(Debug, Deserialize)]
struct RawServerConfig {
    api_base: Option<String>,
    stream_base: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawAuthConfig {
    token_file: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawStoreConfig {
    sqlite_path: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawPrefsConfig {
    device_nickname: Option<String>,
    auto_open_links: Option<bool>,
    auto_open_links_on_reconnect: Option<bool>,
    max_auto_open_per_reconnect: Option<u32>,
    notification_timeout_ms: Option<u64>,
    cache_ttl_ms: Option<u64>,
}

#[derive(Debug, Deserialize)]
struct RawTimingConfig {
    reconnect_delay_ms: Option<u64>,
    health_check_period_ms: Option<u64>,
    nop_stale_threshold_ms: Option<u64>,
    polling_period_ms: Option<u64>,
    long_sleep_period_ms: Option<u64>,
    downtime_warning_ms: Option<u64>,
    http_timeout_ms: Option<u64>,
}

// ---------------------------------------------------------------------------
// Public API
// ---------------------------------------------------------------------------

/// Load agent config from a custom path.
pub fn load_config_from_path(path: &Path) -> Result<AgentConfig, ConfigError> {
    let toml_str = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading config file '{}': {}", path.display(), e)))?;
    load_config_from_str(&toml_str)
}

/// Load agent config from the default path `/etc/pb-agent/agent.toml`.
pub fn load_config() -> Result<AgentConfig, ConfigError> {
    load_config_from_path(Path::new("/etc/pb-agent/agent.toml"))
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

    let server = match raw.server {
        Some(s) => ServerConfig {
            api_base: s.api_base.unwrap_or_else(|| DEFAULT_API_BASE.to_owned()),
            stream_base: s
                .stream_base
                .unwrap_or_else(|| DEFAULT_STREAM_BASE.to_owned()),
        },
        None => ServerConfig {
            api_base: DEFAULT_API_BASE.to_owned(),
            stream_base: DEFAULT_STREAM_BASE.to_owned(),
        },
    };

    // Token file is optional; a missing path is a hard error only when the
    // field is present (a configured-but-unreadable secret is a deployment
    // mistake, not something to silently skip).
    let seed_token = match raw.auth.and_then(|a| a.token_file) {
        Some(path) => Some(read_token_file(&path)?),
        None => None,
    };

    let store = StoreConfig {
        sqlite_path: raw
            .store
            .and_then(|s| s.sqlite_path)
            .map(PathBuf::from)
            .unwrap_or_else(default_store_path),
    };

    let defaults = PrefsConfig::default();
    let prefs = match raw.prefs {
        Some(p) => PrefsConfig {
            device_nickname: p.device_nickname.unwrap_or(defaults.device_nickname),
            auto_open_links: p.auto_open_links.unwrap_or(defaults.auto_open_links),
            auto_open_links_on_reconnect: p
                .auto_open_links_on_reconnect
                .unwrap_or(defaults.auto_open_links_on_reconnect),
            max_auto_open_per_reconnect: p
                .max_auto_open_per_reconnect
                .unwrap_or(defaults.max_auto_open_per_reconnect),
            notification_timeout_ms: p
                .notification_timeout_ms
                .unwrap_or(defaults.notification_timeout_ms),
            cache_ttl_ms: p.cache_ttl_ms.unwrap_or(defaults.cache_ttl_ms),
        },
        None => defaults,
    };

    let td = TimingConfig::default();
    let timing = match raw.timing {
        Some(t) => TimingConfig {
            reconnect_delay_ms: t.reconnect_delay_ms.unwrap_or(td.reconnect_delay_ms),
            health_check_period_ms: t
                .health_check_period_ms
                .unwrap_or(td.health_check_period_ms),
            nop_stale_threshold_ms: t
                .nop_stale_threshold_ms
                .unwrap_or(td.nop_stale_threshold_ms),
            polling_period_ms: t.polling_period_ms.unwrap_or(td.polling_period_ms),
            long_sleep_period_ms: t.long_sleep_period_ms.unwrap_or(td.long_sleep_period_ms),
            downtime_warning_ms: t.downtime_warning_ms.unwrap_or(td.downtime_warning_ms),
            http_timeout_ms: t.http_timeout_ms.unwrap_or(td.http_timeout_ms),
        },
        None => td,
    };

    Ok(AgentConfig {
        schema_version,
        seed_token,
        server,
        store,
        prefs,
        timing,
    })
}

fn default_store_path() -> PathBuf {
    dirs::data_local_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join("pb-agent")
        .join("agent.sqlite3")
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

// ---------------------------------------------------------------------------
// Token file reader
// ---------------------------------------------------------------------------

fn read_token_file(path: &str) -> Result<String, ConfigError> {
    let content = std::fs::read_to_string(path)
        .map_err(|e| ConfigError::Io(format!("reading token file '{}': {}", path, e)))?;
    Ok(content.trim().to_owned())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn minimal_config_gets_defaults() {
        let cfg = load_config_from_str("schema_version = 1").unwrap();
        assert_eq!(cfg.server.api_base, DEFAULT_API_BASE);
        assert_eq!(cfg.server.stream_base, DEFAULT_STREAM_BASE);
        assert_eq!(cfg.prefs.device_nickname, "Chrome");
        assert_eq!(cfg.prefs.max_auto_open_per_reconnect, 5);
        assert_eq!(cfg.prefs.cache_ttl_ms, 300_000);
        assert_eq!(cfg.timing.reconnect_delay_ms, 30_000);
        assert!(cfg.seed_token.is_none());
    }

    #[test]
    fn missing_schema_version_is_rejected() {
        let err = load_config_from_str("[server]\napi_base = \"http://x\"").unwrap_err();
        assert!(matches!(err, ConfigError::MissingField(f) if f == "schema_version"));
    }

    #[test]
    fn wrong_schema_version_is_rejected() {
        let err = load_config_from_str("schema_version = 2").unwrap_err();
        assert!(matches!(err, ConfigError::InvalidValue(_)));
    }

    #[test]
    fn token_file_is_read_and_trimmed() {
        let mut f = tempfile::NamedTempFile::new().unwrap();
        writeln!(f, "  o.AbCdEf123  ").unwrap();
        let toml = format!(
            "schema_version = 1\n[auth]\ntoken_file = \"{}\"",
            f.path().display()
        );
        let cfg = load_config_from_str(&toml).unwrap();
        assert_eq!(cfg.seed_token.as_deref(), Some("o.AbCdEf123"));
    }

    #[test]
    fn configured_but_unreadable_token_file_errors() {
        let toml = "schema_version = 1\n[auth]\ntoken_file = \"/nonexistent/token\"";
        assert!(matches!(
            load_config_from_str(toml).unwrap_err(),
            ConfigError::Io(_)
        ));
    }

    #[test]
    fn timing_overrides_apply() {
        let cfg = load_config_from_str(
            "schema_version = 1\n[timing]\nreconnect_delay_ms = 50\npolling_period_ms = 100",
        )
        .unwrap();
        assert_eq!(cfg.timing.reconnect_delay_ms, 50);
        assert_eq!(cfg.timing.polling_period_ms, 100);
        assert_eq!(cfg.timing.health_check_period_ms, 30_000);
    }
}
