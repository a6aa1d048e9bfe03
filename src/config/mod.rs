//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{
    num::NonZeroUsize,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};

use clap::{Args, Parser, Subcommand, ValueHint, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "syncstate";
const ENV_PREFIX: &str = "SYNCSTATE";

// Built-in defaults, shared by every layer; `config/default.toml` repeats them.
pub const DEFAULT_MEMORY_MAX_ENTRIES: usize = 1024;
pub const DEFAULT_PERSISTENT_MAX_ENTRIES: usize = 256;
pub const DEFAULT_EXPIRY_MS: u64 = 5 * 60 * 1000;
pub const DEFAULT_HIGH_PRIORITY_EXPIRY_MS: u64 = 60 * 60 * 1000;
pub const DEFAULT_MAX_CONCURRENT: usize = 4;
pub const DEFAULT_REFERENCE_THROTTLE_MS: u64 = 5_000;
pub const DEFAULT_COUNTER_THROTTLE_MS: u64 = 30_000;
pub const DEFAULT_BASE_DELAY_MS: u64 = 1_000;
pub const DEFAULT_MAX_DELAY_MS: u64 = 30_000;
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;
pub const DEFAULT_POLLING_INTERVAL_SECS: u64 = 60;

/// Command-line arguments for the `syncstate` maintenance binary.
#[derive(Debug, Parser)]
#[command(
    name = "syncstate",
    version,
    about = "Inspect and maintain a persisted sync cache"
)]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "SYNCSTATE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: GlobalOverrides,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Args, Default, Clone)]
pub struct GlobalOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL", global = true)]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new(),
        global = true
    )]
    pub log_json: Option<bool>,

    /// Override the SQLite database backing the persistent tier.
    #[arg(
        long = "storage-path",
        value_name = "PATH",
        value_hint = ValueHint::FilePath,
        global = true
    )]
    pub storage_path: Option<PathBuf>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// List persisted cache entries.
    Inspect,
    /// Remove persisted cache entries.
    Purge(PurgeArgs),
    /// Print the resolved settings.
    Config,
}

#[derive(Debug, Args, Clone)]
#[command(group(
    clap::ArgGroup::new("selection")
        .required(true)
        .args(["key", "prefix", "all"])
))]
pub struct PurgeArgs {
    /// Exact key to remove.
    #[arg(value_name = "KEY")]
    pub key: Option<String>,

    /// Remove every key starting with this prefix.
    #[arg(long, value_name = "PREFIX")]
    pub prefix: Option<String>,

    /// Remove every persisted entry.
    #[arg(long, action = clap::ArgAction::SetTrue)]
    pub all: bool,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub requests: RequestSettings,
    pub channels: ChannelSettings,
    pub storage: StorageSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub memory_max_entries: NonZeroUsize,
    pub persistent_max_entries: NonZeroUsize,
    pub default_expiry: Duration,
    pub high_priority_expiry: Duration,
}

#[derive(Debug, Clone)]
pub struct RequestSettings {
    pub max_concurrent: NonZeroUsize,
    pub reference_throttle: Duration,
    pub counter_throttle: Duration,
}

#[derive(Debug, Clone)]
pub struct ChannelSettings {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_reconnect_attempts: u32,
    pub polling_interval: Duration,
}

#[derive(Debug, Clone, Default)]
pub struct StorageSettings {
    /// SQLite database of the persistent tier; memory-backed when absent.
    pub path: Option<PathBuf>,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            logging: LoggingSettings {
                level: LevelFilter::INFO,
                format: LogFormat::Compact,
            },
            cache: CacheSettings {
                memory_max_entries: NonZeroUsize::new(DEFAULT_MEMORY_MAX_ENTRIES)
                    .unwrap_or(NonZeroUsize::MIN),
                persistent_max_entries: NonZeroUsize::new(DEFAULT_PERSISTENT_MAX_ENTRIES)
                    .unwrap_or(NonZeroUsize::MIN),
                default_expiry: Duration::from_millis(DEFAULT_EXPIRY_MS),
                high_priority_expiry: Duration::from_millis(DEFAULT_HIGH_PRIORITY_EXPIRY_MS),
            },
            requests: RequestSettings {
                max_concurrent: NonZeroUsize::new(DEFAULT_MAX_CONCURRENT)
                    .unwrap_or(NonZeroUsize::MIN),
                reference_throttle: Duration::from_millis(DEFAULT_REFERENCE_THROTTLE_MS),
                counter_throttle: Duration::from_millis(DEFAULT_COUNTER_THROTTLE_MS),
            },
            channels: ChannelSettings {
                base_delay: Duration::from_millis(DEFAULT_BASE_DELAY_MS),
                max_delay: Duration::from_millis(DEFAULT_MAX_DELAY_MS),
                max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
                polling_interval: Duration::from_secs(DEFAULT_POLLING_INTERVAL_SECS),
            },
            storage: StorageSettings::default(),
        }
    }
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);

    Settings::from_raw(raw)
}

/// Load settings from a single file, ignoring the environment.
pub fn load_file(path: &Path) -> Result<Settings, LoadError> {
    let raw: RawSettings = Config::builder()
        .add_source(File::from(path).required(true))
        .build()?
        .try_deserialize()?;
    Settings::from_raw(raw)
}

/// Resolve configuration using the process arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    requests: RawRequestSettings,
    channels: RawChannelSettings,
    storage: RawStorageSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &GlobalOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(path) = overrides.storage_path.as_ref() {
            self.storage.path = Some(path.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            logging,
            cache,
            requests,
            channels,
            storage,
        } = raw;

        Ok(Self {
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            requests: build_request_settings(requests)?,
            channels: build_channel_settings(channels)?,
            storage: build_storage_settings(storage)?,
        })
    }
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let memory_max_entries = non_zero_usize(
        cache.memory_max_entries.unwrap_or(DEFAULT_MEMORY_MAX_ENTRIES),
        "cache.memory_max_entries",
    )?;
    let persistent_max_entries = non_zero_usize(
        cache
            .persistent_max_entries
            .unwrap_or(DEFAULT_PERSISTENT_MAX_ENTRIES),
        "cache.persistent_max_entries",
    )?;

    let default_expiry = Duration::from_millis(cache.default_expiry_ms.unwrap_or(DEFAULT_EXPIRY_MS));
    let high_priority_expiry = Duration::from_millis(
        cache
            .high_priority_expiry_ms
            .unwrap_or(DEFAULT_HIGH_PRIORITY_EXPIRY_MS),
    );
    if high_priority_expiry < default_expiry {
        return Err(LoadError::invalid(
            "cache.high_priority_expiry_ms",
            "must not be shorter than cache.default_expiry_ms",
        ));
    }

    Ok(CacheSettings {
        memory_max_entries,
        persistent_max_entries,
        default_expiry,
        high_priority_expiry,
    })
}

fn build_request_settings(requests: RawRequestSettings) -> Result<RequestSettings, LoadError> {
    let max_concurrent = non_zero_usize(
        requests.max_concurrent.unwrap_or(DEFAULT_MAX_CONCURRENT),
        "requests.max_concurrent",
    )?;

    Ok(RequestSettings {
        max_concurrent,
        reference_throttle: Duration::from_millis(
            requests
                .reference_throttle_ms
                .unwrap_or(DEFAULT_REFERENCE_THROTTLE_MS),
        ),
        counter_throttle: Duration::from_millis(
            requests
                .counter_throttle_ms
                .unwrap_or(DEFAULT_COUNTER_THROTTLE_MS),
        ),
    })
}

fn build_channel_settings(channels: RawChannelSettings) -> Result<ChannelSettings, LoadError> {
    let base_delay_ms = channels.base_delay_ms.unwrap_or(DEFAULT_BASE_DELAY_MS);
    if base_delay_ms == 0 {
        return Err(LoadError::invalid(
            "channels.base_delay_ms",
            "must be greater than zero",
        ));
    }

    let max_delay_ms = channels.max_delay_ms.unwrap_or(DEFAULT_MAX_DELAY_MS);
    if max_delay_ms < base_delay_ms {
        return Err(LoadError::invalid(
            "channels.max_delay_ms",
            "must not be smaller than channels.base_delay_ms",
        ));
    }

    let max_reconnect_attempts = channels
        .max_reconnect_attempts
        .unwrap_or(DEFAULT_MAX_RECONNECT_ATTEMPTS);
    if max_reconnect_attempts == 0 {
        return Err(LoadError::invalid(
            "channels.max_reconnect_attempts",
            "must be greater than zero",
        ));
    }

    let polling_secs = channels
        .polling_interval_secs
        .unwrap_or(DEFAULT_POLLING_INTERVAL_SECS);
    if polling_secs == 0 {
        return Err(LoadError::invalid(
            "channels.polling_interval_secs",
            "must be greater than zero",
        ));
    }

    Ok(ChannelSettings {
        base_delay: Duration::from_millis(base_delay_ms),
        max_delay: Duration::from_millis(max_delay_ms),
        max_reconnect_attempts,
        polling_interval: Duration::from_secs(polling_secs),
    })
}

fn build_storage_settings(storage: RawStorageSettings) -> Result<StorageSettings, LoadError> {
    let path = match storage.path {
        Some(path) if path.as_os_str().is_empty() => {
            return Err(LoadError::invalid("storage.path", "path must not be empty"));
        }
        other => other,
    };

    Ok(StorageSettings { path })
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    memory_max_entries: Option<usize>,
    persistent_max_entries: Option<usize>,
    default_expiry_ms: Option<u64>,
    high_priority_expiry_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawRequestSettings {
    max_concurrent: Option<usize>,
    reference_throttle_ms: Option<u64>,
    counter_throttle_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawChannelSettings {
    base_delay_ms: Option<u64>,
    max_delay_ms: Option<u64>,
    max_reconnect_attempts: Option<u32>,
    polling_interval_secs: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawStorageSettings {
    path: Option<PathBuf>,
}

fn non_zero_usize(value: usize, key: &'static str) -> Result<NonZeroUsize, LoadError> {
    NonZeroUsize::new(value).ok_or_else(|| LoadError::invalid(key, "must be greater than zero"))
}
