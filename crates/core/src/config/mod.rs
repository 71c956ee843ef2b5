//! Application configuration with layered loading.
//!
//! Sources, lowest to highest precedence:
//!
//! 1. Built-in defaults
//! 2. TOML config file (if QUICKPAGE_CONFIG_FILE is set)
//! 3. Environment variables (QUICKPAGE_*, nested with `__`)

use std::path::PathBuf;
use std::time::Duration;

use figment::{
    Figment,
    providers::{Env, Format, Serialized, Toml},
};
use serde::{Deserialize, Serialize};

mod validation;

pub use validation::ConfigError;

/// Application configuration with layered loading.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Registry-wide settings.
    #[serde(default)]
    pub engine: EngineConfig,

    /// Per-session settings used for sessions the host creates.
    #[serde(default)]
    pub session: SessionConfig,

    /// Path to the SQLite metadata database.
    ///
    /// Set via QUICKPAGE_DB_PATH environment variable.
    #[serde(default = "default_db_path")]
    pub db_path: PathBuf,

    /// User-Agent string for session requests.
    ///
    /// Set via QUICKPAGE_USER_AGENT environment variable.
    #[serde(default = "default_user_agent")]
    pub user_agent: String,

    /// Identity used to scope session keys. Empty means shared.
    ///
    /// Set via QUICKPAGE_ACCOUNT environment variable.
    #[serde(default)]
    pub account: String,
}

/// Settings for the session registry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Maximum number of sessions held in the preload pool.
    #[serde(default = "default_max_preload_sessions")]
    pub max_preload_sessions: usize,

    /// How long a key stays in cooldown after an origin-unavailable signal.
    #[serde(default = "default_unavailable_duration_ms")]
    pub unavailable_duration_ms: u64,

    /// Verify cached documents by SHA-256 hash; when false, by size only.
    #[serde(default = "default_true")]
    pub verify_cache_with_hash: bool,

    /// Directory holding cached content files.
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

/// Settings for one session.
///
/// A preloaded session is only adopted when its config equals the caller's.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionConfig {
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    #[serde(default = "default_read_timeout_ms")]
    pub read_timeout_ms: u64,

    /// Chunk size hint used when buffering response bodies.
    #[serde(default = "default_read_buffer_size")]
    pub read_buffer_size: usize,

    /// Age after which a preloaded session is discarded instead of adopted.
    #[serde(default = "default_preload_expiry_ms")]
    pub preload_expiry_ms: u64,

    /// Ask the origin for diff-only data updates.
    #[serde(default = "default_true")]
    pub accept_diff: bool,

    /// Scope the session key by the host's current account.
    #[serde(default = "default_true")]
    pub account_scoped: bool,

    /// Query parameters that tell cache slots apart. Every other parameter
    /// is dropped from the session key.
    #[serde(default)]
    pub key_params: Vec<String>,

    /// On connection failure, load the original URL directly.
    #[serde(default)]
    pub reload_in_bad_network: bool,

    /// Start the network flow as soon as the session is created.
    #[serde(default = "default_true")]
    pub auto_start: bool,

    /// Notice shown when cached content is served without network.
    #[serde(default)]
    pub offline_notice: Option<String>,

    /// Upper bound on how long a resource request waits for the network flow.
    #[serde(default = "default_rendezvous_timeout_ms")]
    pub rendezvous_timeout_ms: u64,

    /// Grace period before a deferred destroy is forced.
    #[serde(default = "default_destroy_grace_ms")]
    pub destroy_grace_ms: u64,

    /// A pending data diff older than this is not delivered to the listener.
    #[serde(default = "default_update_notice_window_ms")]
    pub update_notice_window_ms: u64,
}

fn default_db_path() -> PathBuf {
    PathBuf::from("./quickpage-cache.sqlite")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("./quickpage-cache")
}

fn default_user_agent() -> String {
    "quickpage/0.1".into()
}

fn default_max_preload_sessions() -> usize {
    5
}

fn default_unavailable_duration_ms() -> u64 {
    6 * 60 * 60 * 1000
}

fn default_connect_timeout_ms() -> u64 {
    5_000
}

fn default_read_timeout_ms() -> u64 {
    15_000
}

fn default_read_buffer_size() -> usize {
    10 * 1024
}

fn default_preload_expiry_ms() -> u64 {
    3 * 60 * 1000
}

fn default_rendezvous_timeout_ms() -> u64 {
    30_000
}

fn default_destroy_grace_ms() -> u64 {
    6_000
}

fn default_update_notice_window_ms() -> u64 {
    30_000
}

fn default_true() -> bool {
    true
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            engine: EngineConfig::default(),
            session: SessionConfig::default(),
            db_path: default_db_path(),
            user_agent: default_user_agent(),
            account: String::new(),
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_preload_sessions: default_max_preload_sessions(),
            unavailable_duration_ms: default_unavailable_duration_ms(),
            verify_cache_with_hash: true,
            cache_dir: default_cache_dir(),
        }
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_ms: default_connect_timeout_ms(),
            read_timeout_ms: default_read_timeout_ms(),
            read_buffer_size: default_read_buffer_size(),
            preload_expiry_ms: default_preload_expiry_ms(),
            accept_diff: true,
            account_scoped: true,
            key_params: Vec::new(),
            reload_in_bad_network: false,
            auto_start: true,
            offline_notice: None,
            rendezvous_timeout_ms: default_rendezvous_timeout_ms(),
            destroy_grace_ms: default_destroy_grace_ms(),
            update_notice_window_ms: default_update_notice_window_ms(),
        }
    }
}

impl EngineConfig {
    pub fn unavailable_duration(&self) -> Duration {
        Duration::from_millis(self.unavailable_duration_ms)
    }
}

impl SessionConfig {
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn read_timeout(&self) -> Duration {
        Duration::from_millis(self.read_timeout_ms)
    }

    pub fn preload_expiry(&self) -> Duration {
        Duration::from_millis(self.preload_expiry_ms)
    }

    pub fn rendezvous_timeout(&self) -> Duration {
        Duration::from_millis(self.rendezvous_timeout_ms)
    }

    pub fn destroy_grace(&self) -> Duration {
        Duration::from_millis(self.destroy_grace_ms)
    }

    pub fn update_notice_window(&self) -> Duration {
        Duration::from_millis(self.update_notice_window_ms)
    }
}

impl AppConfig {
    /// Load configuration from all sources with layered precedence.
    ///
    /// # Errors
    ///
    /// Returns `ConfigError` if the file or environment cannot be parsed,
    /// or if validation fails after loading.
    pub fn load() -> Result<Self, ConfigError> {
        let mut figment = Figment::from(Serialized::defaults(Self::default()));

        if let Ok(config_path) = std::env::var("QUICKPAGE_CONFIG_FILE") {
            figment = figment.merge(Toml::file(&config_path));
        }

        figment = figment.merge(
            Env::prefixed("QUICKPAGE_")
                .ignore(&["CONFIG_FILE"])
                .map(|key| key.as_str().to_lowercase().into())
                .split("__"),
        );

        let config: Self = figment.extract().map_err(|e| ConfigError::LoadFailed(e.to_string()))?;

        config.validate()?;

        Ok(config)
    }
}
