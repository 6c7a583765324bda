//! Configuration module for QuotaSync.
//!
//! Provides typed configuration structs that map to the YAML configuration file,
//! with loading, validation, defaults, and a builder pattern for programmatic use.

use std::collections::{BTreeMap, HashSet};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// ---------------------------------------------------------------------------
// Config struct with sub-sections
// ---------------------------------------------------------------------------

/// Top-level configuration for QuotaSync.
///
/// `directories`, `remote`, `database` and `sync` must be present in the file;
/// `logging` falls back to its defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Source trees to offload: tree name -> root directory.
    pub directories: BTreeMap<String, PathBuf>,
    pub remote: RemoteConfig,
    pub database: DatabaseConfig,
    pub sync: SyncConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
}

/// Remote endpoint reached over ssh.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    pub user: String,
    pub host: String,
    pub port: u16,
    /// Destination directory on the remote host.
    pub dest_folder: String,
}

/// File ledger location.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DatabaseConfig {
    /// Path to the SQLite ledger file.
    pub path: PathBuf,
}

/// Offload cycle settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SyncConfig {
    /// Seconds to sleep between cycles.
    pub poll_interval: u64,
    /// Local staging root mirrored to the remote destination.
    pub temp_dir: PathBuf,
    /// Maximum bytes the remote destination may hold.
    pub dest_size_max: u64,
    /// Seconds a completed file is kept in staging before it may be deleted.
    pub keep_time_min: u64,
    /// Seconds passed to `rsync --timeout`.
    #[serde(default = "default_rsync_timeout")]
    pub rsync_timeout: u64,
    /// Shell command run after every successful transfer.
    #[serde(default)]
    pub post_sync_command: Option<String>,
    /// Only expire completed files in cycles that also have new files waiting.
    #[serde(default = "default_expire_requires_new_files")]
    pub expire_requires_new_files: bool,
}

/// Logging / tracing settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log level: `trace`, `debug`, `info`, `warn`, or `error`.
    pub level: String,
}

fn default_rsync_timeout() -> u64 {
    300
}

fn default_expire_requires_new_files() -> bool {
    true
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Errors raised while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The file could not be read
    #[error("Could not read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// The file is not valid YAML or a required key is missing
    #[error("Could not parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// The file parsed but failed semantic validation
    #[error("Config validation failed: {}", join_errors(.0))]
    Invalid(Vec<ValidationError>),
}

fn join_errors(errors: &[ValidationError]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

// ---------------------------------------------------------------------------
// Config::load()
// ---------------------------------------------------------------------------

impl Config {
    /// Load configuration from a YAML file at `path`.
    ///
    /// Trailing slashes on tree roots are stripped.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_yaml_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }

    /// Parse configuration from YAML text.
    pub fn from_yaml_str(content: &str) -> Result<Self, serde_yaml::Error> {
        let mut config: Config = serde_yaml::from_str(content)?;
        config.normalize();
        Ok(config)
    }

    /// Load from `path` and reject the result if [`Config::validate`] finds problems.
    pub fn load_validated(path: &Path) -> Result<Self, ConfigError> {
        let config = Self::load(path)?;
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(ConfigError::Invalid(errors))
        }
    }

    /// Default location of the configuration file.
    pub fn default_path() -> PathBuf {
        PathBuf::from("/etc/quotasync/config.yaml")
    }

    fn normalize(&mut self) {
        for root in self.directories.values_mut() {
            *root = strip_trailing_slash(root);
        }
    }

    /// Sleep between cycles.
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.sync.poll_interval)
    }

    /// Minimum time a completed file is kept in staging.
    pub fn retention(&self) -> Duration {
        Duration::from_secs(self.sync.keep_time_min)
    }

    /// Timeout handed to the transfer tool.
    pub fn rsync_timeout(&self) -> Duration {
        Duration::from_secs(self.sync.rsync_timeout)
    }
}

fn strip_trailing_slash(path: &Path) -> PathBuf {
    let raw = path.to_string_lossy();
    let trimmed = raw.trim_end_matches('/');
    if trimmed.is_empty() {
        // "/" stays "/"
        path.to_path_buf()
    } else {
        PathBuf::from(trimmed)
    }
}

// ---------------------------------------------------------------------------
// Defaults
// ---------------------------------------------------------------------------

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            user: String::new(),
            host: String::new(),
            port: 22,
            dest_folder: String::new(),
        }
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval: 10,
            temp_dir: PathBuf::from("/var/spool/quotasync"),
            dest_size_max: 0,
            keep_time_min: 86_400,
            rsync_timeout: default_rsync_timeout(),
            post_sync_command: None,
            expire_requires_new_files: default_expire_requires_new_files(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
        }
    }
}

// ---------------------------------------------------------------------------
// Config::validate()
// ---------------------------------------------------------------------------

/// A single validation error found in the configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ValidationError {
    /// Dotted path to the offending field, e.g. `"sync.poll_interval"`.
    pub field: String,
    /// Human-readable explanation.
    pub message: String,
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}: {}", self.field, self.message)
    }
}

/// True if `name` is one path component other than `.` or `..`.
///
/// Tree names become the first directory of every staged path.
fn is_single_normal_component(name: &str) -> bool {
    let mut components = Path::new(name).components();
    matches!(
        (components.next(), components.next()),
        (Some(Component::Normal(_)), None)
    ) && !name.contains('/')
}

/// Valid values for `logging.level`.
pub const VALID_LOG_LEVELS: &[&str] = &["trace", "debug", "info", "warn", "error"];

impl Config {
    /// Validate the configuration and return all errors found.
    ///
    /// An empty vector means the configuration is valid.
    pub fn validate(&self) -> Vec<ValidationError> {
        let mut errors = Vec::new();

        // --- directories ---
        if self.directories.is_empty() {
            errors.push(ValidationError {
                field: "directories".into(),
                message: "at least one source directory is required".into(),
            });
        }
        let mut seen_roots = HashSet::new();
        for (name, root) in &self.directories {
            if !is_single_normal_component(name) {
                errors.push(ValidationError {
                    field: format!("directories.{name}"),
                    message: "tree name must be a single plain path component".into(),
                });
            }
            if !root.is_absolute() {
                errors.push(ValidationError {
                    field: format!("directories.{name}"),
                    message: format!("root must be an absolute path: {}", root.display()),
                });
            }
            if !seen_roots.insert(root.clone()) {
                errors.push(ValidationError {
                    field: format!("directories.{name}"),
                    message: format!("root is configured twice: {}", root.display()),
                });
            }
        }

        // --- remote ---
        for (field, value) in [
            ("remote.user", &self.remote.user),
            ("remote.host", &self.remote.host),
            ("remote.dest_folder", &self.remote.dest_folder),
        ] {
            if value.trim().is_empty() {
                errors.push(ValidationError {
                    field: field.into(),
                    message: "must not be empty".into(),
                });
            }
        }
        if self.remote.port == 0 {
            errors.push(ValidationError {
                field: "remote.port".into(),
                message: "must be greater than 0".into(),
            });
        }

        // --- database ---
        if self.database.path.as_os_str().is_empty() {
            errors.push(ValidationError {
                field: "database.path".into(),
                message: "must not be empty".into(),
            });
        }

        // --- sync ---
        if self.sync.poll_interval == 0 {
            errors.push(ValidationError {
                field: "sync.poll_interval".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.dest_size_max == 0 {
            errors.push(ValidationError {
                field: "sync.dest_size_max".into(),
                message: "must be greater than 0".into(),
            });
        }
        if self.sync.rsync_timeout == 0 {
            errors.push(ValidationError {
                field: "sync.rsync_timeout".into(),
                message: "must be greater than 0".into(),
            });
        }
        if !self.sync.temp_dir.is_absolute() {
            errors.push(ValidationError {
                field: "sync.temp_dir".into(),
                message: format!(
                    "must be an absolute path: {}",
                    self.sync.temp_dir.display()
                ),
            });
        }
        for (name, root) in &self.directories {
            if self.sync.temp_dir.starts_with(root) {
                errors.push(ValidationError {
                    field: "sync.temp_dir".into(),
                    message: format!("must not live inside source directory '{name}'"),
                });
            }
        }
        if let Some(cmd) = &self.sync.post_sync_command {
            if cmd.trim().is_empty() {
                errors.push(ValidationError {
                    field: "sync.post_sync_command".into(),
                    message: "must not be blank when set".into(),
                });
            }
        }

        // --- logging ---
        if !VALID_LOG_LEVELS.contains(&self.logging.level.as_str()) {
            errors.push(ValidationError {
                field: "logging.level".into(),
                message: format!(
                    "invalid level '{}'; valid options: {}",
                    self.logging.level,
                    VALID_LOG_LEVELS.join(", ")
                ),
            });
        }

        errors
    }
}

// ---------------------------------------------------------------------------
// ConfigBuilder
// ---------------------------------------------------------------------------

/// Builder for constructing a [`Config`] programmatically.
///
/// Starts from [`Config::default`] and allows selective overrides.
///
/// # Example
///
/// ```rust,no_run
/// use quotasync_core::config::ConfigBuilder;
/// use std::path::PathBuf;
///
/// let config = ConfigBuilder::new()
///     .directory("cams", PathBuf::from("/srv/cams"))
///     .remote("backup", "nas.local", 22, "/volume1/cams")
///     .dest_size_max(10 * 1024 * 1024 * 1024)
///     .logging_level("debug")
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: Config,
}

impl ConfigBuilder {
    /// Create a new builder initialised with [`Config::default`] values.
    pub fn new() -> Self {
        Self {
            config: Config::default(),
        }
    }

    // --- directories ---

    pub fn directory(mut self, name: impl Into<String>, root: PathBuf) -> Self {
        self.config
            .directories
            .insert(name.into(), strip_trailing_slash(&root));
        self
    }

    // --- remote ---

    pub fn remote(
        mut self,
        user: impl Into<String>,
        host: impl Into<String>,
        port: u16,
        dest_folder: impl Into<String>,
    ) -> Self {
        self.config.remote = RemoteConfig {
            user: user.into(),
            host: host.into(),
            port,
            dest_folder: dest_folder.into(),
        };
        self
    }

    // --- database ---

    pub fn database_path(mut self, path: PathBuf) -> Self {
        self.config.database.path = path;
        self
    }

    // --- sync ---

    pub fn poll_interval(mut self, seconds: u64) -> Self {
        self.config.sync.poll_interval = seconds;
        self
    }

    pub fn temp_dir(mut self, dir: PathBuf) -> Self {
        self.config.sync.temp_dir = dir;
        self
    }

    pub fn dest_size_max(mut self, bytes: u64) -> Self {
        self.config.sync.dest_size_max = bytes;
        self
    }

    pub fn keep_time_min(mut self, seconds: u64) -> Self {
        self.config.sync.keep_time_min = seconds;
        self
    }

    pub fn rsync_timeout(mut self, seconds: u64) -> Self {
        self.config.sync.rsync_timeout = seconds;
        self
    }

    pub fn post_sync_command(mut self, command: impl Into<String>) -> Self {
        self.config.sync.post_sync_command = Some(command.into());
        self
    }

    pub fn expire_requires_new_files(mut self, gated: bool) -> Self {
        self.config.sync.expire_requires_new_files = gated;
        self
    }

    // --- logging ---

    pub fn logging_level(mut self, level: impl Into<String>) -> Self {
        self.config.logging.level = level.into();
        self
    }

    // --- build ---

    /// Consume the builder and return the finished [`Config`].
    pub fn build(self) -> Config {
        self.config
    }

    /// Build and validate in one step. Returns `Err` with the list of
    /// validation errors if the configuration is invalid.
    pub fn build_validated(self) -> Result<Config, Vec<ValidationError>> {
        let config = self.build();
        let errors = config.validate();
        if errors.is_empty() {
            Ok(config)
        } else {
            Err(errors)
        }
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
