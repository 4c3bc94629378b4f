//! Configuration for the worker and its host.
//!
//! Everything is loaded from a single TOML file. Every section and field has
//! a default, so an empty file (or no file at all) yields a working setup
//! pointed at a backend on `http://127.0.0.1:5000`.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::http::Url;
use crate::lifecycle::WorkerScript;

/// Worker script settings: cache version, app shell and fetch policy.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkerConfig {
    /// Cache generation identifier of this worker version.
    pub version: String,
    /// Backend origin the worker is scoped to.
    pub origin: String,
    /// Path of the page served when a navigation fails.
    pub offline_url: String,
    /// App shell URLs cached at install (paths are resolved against `origin`).
    pub precache: Vec<String>,
    /// Path regexes that always go to the network and are never cached.
    pub bypass: Vec<String>,
    /// Activate as soon as install completes instead of waiting for clients.
    pub skip_waiting_on_install: bool,
    /// Number of manifest entries fetched in parallel during install.
    pub install_concurrency: usize,
    /// Tell clients to reload when a new worker takes control.
    pub reload_on_controller_change: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            version: "voucher-system-v1.0.2".to_string(),
            origin: "http://127.0.0.1:5000".to_string(),
            offline_url: "/pwa-offline".to_string(),
            precache: vec![
                "/".to_string(),
                "/static/css/dashboard.css".to_string(),
                "/static/css/themes.css".to_string(),
                "/static/js/theme-switcher.js".to_string(),
                "/static/js/auto-sync.js".to_string(),
                "/pwa-offline".to_string(),
                "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/css/bootstrap.min.css".to_string(),
                "https://cdn.jsdelivr.net/npm/bootstrap@5.3.0/dist/js/bootstrap.bundle.min.js"
                    .to_string(),
                "https://cdnjs.cloudflare.com/ajax/libs/font-awesome/6.0.0/css/all.min.css"
                    .to_string(),
                "https://unpkg.com/feather-icons".to_string(),
                "https://cdn.jsdelivr.net/npm/chart.js".to_string(),
            ],
            bypass: vec![r"^/api/".to_string(), r"^/static/sw\.js$".to_string()],
            skip_waiting_on_install: false,
            install_concurrency: 4,
            reload_on_controller_change: true,
        }
    }
}

impl WorkerConfig {
    /// Creates a new configuration with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the cache version.
    #[must_use]
    pub fn with_version(mut self, version: impl Into<String>) -> Self {
        self.version = version.into();
        self
    }

    /// Sets the backend origin.
    #[must_use]
    pub fn with_origin(mut self, origin: impl Into<String>) -> Self {
        self.origin = origin.into();
        self
    }

    /// Sets the precache manifest.
    #[must_use]
    pub fn with_precache(mut self, precache: Vec<String>) -> Self {
        self.precache = precache;
        self
    }

    /// Sets whether install skips the waiting state.
    #[must_use]
    pub const fn with_skip_waiting_on_install(mut self, skip: bool) -> Self {
        self.skip_waiting_on_install = skip;
        self
    }

    /// Parses the origin URL.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the origin is not an absolute URL.
    pub fn origin_url(&self) -> Result<Url> {
        Url::parse(&self.origin)
            .map_err(|e| Error::Config(format!("invalid origin {:?}: {e}", self.origin)))
    }

    /// Builds the worker script this configuration describes.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] if the origin or a manifest entry cannot be
    /// resolved to an absolute URL.
    pub fn script(&self) -> Result<WorkerScript> {
        let origin = self.origin_url()?;
        let resolve = |entry: &str| {
            origin
                .join(entry)
                .map_err(|e| Error::Config(format!("invalid URL {entry:?}: {e}")))
        };
        let manifest = self
            .precache
            .iter()
            .map(|entry| resolve(entry))
            .collect::<Result<Vec<_>>>()?;
        Ok(WorkerScript {
            version: self.version.clone(),
            manifest,
            offline_url: resolve(&self.offline_url)?,
        })
    }
}

/// Background sync and deferred-write delivery settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Tag the foreground registers for deferred writes.
    pub tag: String,
    /// Deferred-write endpoint path.
    pub endpoint: String,
    /// CSRF token sent with every delivery, if the backend requires one.
    pub csrf_token: Option<String>,
    /// Header carrying the CSRF token.
    pub csrf_header: String,
    /// Enqueue failed writes to `endpoint` made through the proxy.
    pub defer_failed_mutations: bool,
    /// Attempts after which a mutation is abandoned. `None` retries forever.
    pub max_attempts: Option<u32>,
    /// Age in seconds after which a mutation is abandoned. `None` keeps it forever.
    pub max_age_secs: Option<u64>,
    /// Base delay in seconds for exponential backoff. Zero disables backoff.
    pub backoff_base_secs: u64,
    /// Upper bound on the backoff delay in seconds.
    pub backoff_max_secs: u64,
    /// Interval in seconds between connectivity checks.
    pub check_interval_secs: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            tag: "background-sync-vouchers".to_string(),
            endpoint: "/vendor/create_vouchers".to_string(),
            csrf_token: None,
            csrf_header: "X-CSRFToken".to_string(),
            defer_failed_mutations: true,
            max_attempts: Some(10),
            max_age_secs: Some(7 * 24 * 3600),
            backoff_base_secs: 0,
            backoff_max_secs: 3600,
            check_interval_secs: 30,
        }
    }
}

impl SyncConfig {
    /// Returns the retry policy these settings describe.
    #[must_use]
    pub const fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy {
            max_attempts: self.max_attempts,
            max_age: match self.max_age_secs {
                Some(secs) => Some(Duration::from_secs(secs)),
                None => None,
            },
            backoff_base: Duration::from_secs(self.backoff_base_secs),
            backoff_max: Duration::from_secs(self.backoff_max_secs),
        }
    }

    /// Returns the connectivity check interval.
    #[must_use]
    pub const fn check_interval(&self) -> Duration {
        Duration::from_secs(self.check_interval_secs)
    }
}

/// When a queued mutation is retried and when it is given up on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Attempts after which a mutation is abandoned.
    pub max_attempts: Option<u32>,
    /// Age after which a mutation is abandoned.
    pub max_age: Option<Duration>,
    /// Delay after the first failure; doubles per failure. Zero disables backoff.
    pub backoff_base: Duration,
    /// Upper bound on the backoff delay.
    pub backoff_max: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        SyncConfig::default().retry_policy()
    }
}

impl RetryPolicy {
    /// A policy that never abandons and never delays.
    #[must_use]
    pub const fn unbounded() -> Self {
        Self {
            max_attempts: None,
            max_age: None,
            backoff_base: Duration::ZERO,
            backoff_max: Duration::ZERO,
        }
    }

    /// Returns the delay before the next attempt after `attempts` failures.
    #[must_use]
    pub fn backoff(&self, attempts: u32) -> Duration {
        if self.backoff_base.is_zero() || attempts == 0 {
            return Duration::ZERO;
        }
        let factor = 2u32.saturating_pow(attempts.saturating_sub(1).min(16));
        self.backoff_base
            .saturating_mul(factor)
            .min(self.backoff_max)
    }
}

/// Cache storage settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    /// Byte quota per cache generation. Run-time entries are evicted oldest
    /// first to stay under it. `None` is unlimited.
    pub max_bytes: Option<u64>,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_bytes: Some(64 * 1024 * 1024),
        }
    }
}

/// Notification content settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
    /// Notification title.
    pub title: String,
    /// Body used when a push carries no payload.
    pub default_body: String,
    /// Notification icon path.
    pub icon: String,
    /// Notification badge path.
    pub badge: String,
    /// Page opened when a notification is clicked.
    pub open_url: String,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            title: "Voucher System".to_string(),
            default_body: "New notification from the Voucher System".to_string(),
            icon: "/static/icons/icon-192x192.png".to_string(),
            badge: "/static/icons/badge-72x72.png".to_string(),
            open_url: "/".to_string(),
        }
    }
}

/// Path configuration for configuration and state directories.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PathConfig {
    /// Directory where configuration files are read from.
    pub config_dir: PathBuf,
    /// Directory where the mutation queue is persisted.
    pub state_dir: PathBuf,
}

impl Default for PathConfig {
    fn default() -> Self {
        let config_dir = dirs::config_dir().unwrap_or_else(|| PathBuf::from("."));

        Self {
            config_dir: config_dir.join("voucher-sw"),
            state_dir: default_state_dir(),
        }
    }
}

impl PathConfig {
    /// Returns the path of the durable mutation queue file.
    #[must_use]
    pub fn queue_path(&self) -> PathBuf {
        self.state_dir.join("queue.toml")
    }

    /// Returns the path of the default configuration file.
    #[must_use]
    pub fn config_path(&self) -> PathBuf {
        self.config_dir.join("config.toml")
    }
}

/// Returns the directory where durable state is stored.
///
/// Uses `STATE_DIRECTORY` (set by systemd when `StateDirectory=` is configured),
/// falling back to `$XDG_DATA_HOME/voucher-sw` for interactive use.
#[must_use]
pub fn default_state_dir() -> PathBuf {
    if let Ok(state_dir) = std::env::var("STATE_DIRECTORY") {
        PathBuf::from(state_dir)
    } else {
        dirs::data_dir()
            .unwrap_or_else(|| PathBuf::from("."))
            .join("voucher-sw")
    }
}

/// Host server configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Bind address.
    pub host: String,
    /// Bind port.
    pub port: u16,
    /// Largest request body accepted by the proxy, in bytes.
    pub max_body_bytes: usize,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            port: 8787,
            max_body_bytes: 8 * 1024 * 1024,
        }
    }
}

/// Complete application configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// Worker script settings.
    pub worker: WorkerConfig,
    /// Background sync settings.
    pub sync: SyncConfig,
    /// Cache storage settings.
    pub cache: CacheConfig,
    /// Notification settings.
    pub notification: NotificationConfig,
    /// Path settings.
    pub paths: PathConfig,
    /// Host server settings.
    pub server: ServerConfig,
}

impl AppConfig {
    /// Creates a new config with default values.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses a configuration from TOML text.
    ///
    /// # Errors
    ///
    /// Returns an error if the text is not valid TOML for this schema or the
    /// resulting configuration is inconsistent.
    pub fn from_toml(text: &str) -> Result<Self> {
        let config: Self = toml::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// Loads configuration from `path`, or from the default config file when
    /// `path` is `None`. A missing default file yields the defaults.
    ///
    /// # Errors
    ///
    /// Returns an error if an explicitly given file cannot be read, or if any
    /// file that exists cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let (path, explicit) = match path {
            Some(p) => (p.to_path_buf(), true),
            None => (PathConfig::default().config_path(), false),
        };

        match std::fs::read_to_string(&path) {
            Ok(text) => {
                log::info!("Loading configuration from {}", path.display());
                Self::from_toml(&text)
            }
            Err(e) if !explicit && e.kind() == std::io::ErrorKind::NotFound => {
                log::info!("No configuration at {}, using defaults", path.display());
                Ok(Self::default())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Checks cross-field consistency.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Config`] describing the first problem found.
    pub fn validate(&self) -> Result<()> {
        self.worker.script()?;
        if self.worker.version.is_empty() {
            return Err(Error::Config("worker.version must not be empty".into()));
        }
        if self.worker.install_concurrency == 0 {
            return Err(Error::Config("worker.install_concurrency must be at least 1".into()));
        }
        if self.sync.tag.is_empty() {
            return Err(Error::Config("sync.tag must not be empty".into()));
        }
        for pattern in &self.worker.bypass {
            regex::Regex::new(pattern)
                .map_err(|e| Error::Config(format!("invalid bypass pattern {pattern:?}: {e}")))?;
        }
        Ok(())
    }
}
