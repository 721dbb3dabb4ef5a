//! CLI flags and the `--config` JSON file for `vortex agent start`, plus the
//! closed `log-level`/`log-dest` enums config values are validated against.
//!
//! Without `--config`, `id`/`server`/`key` are mandatory CLI flags. With
//! `--config`, the file's `id`/`server`/`key` take over entirely (the CLI
//! flags are ignored for those three), matching the original agent's
//! `loadConfig` — this reimplementation keeps that precedence rather than
//! inventing a merge policy the source never had.

use std::path::PathBuf;

use serde::Deserialize;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("must provide --config or all of --id/--server/--key")]
    MissingRequiredFlags,
    #[error("opening config file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("parsing config file {path:?}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid log level {0:?}. Valid levels: debug, info, warn, error, panic, fatal")]
    InvalidLogLevel(String),
    #[error("invalid log destination {0:?}. Valid destinations: console, remote")]
    InvalidLogDest(String),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
    Panic,
    Fatal,
}

impl LogLevel {
    pub const ALL: &'static [&'static str] =
        &["debug", "info", "warn", "error", "panic", "fatal"];

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "debug" => Ok(Self::Debug),
            "info" => Ok(Self::Info),
            "warn" => Ok(Self::Warn),
            "error" => Ok(Self::Error),
            "panic" => Ok(Self::Panic),
            "fatal" => Ok(Self::Fatal),
            other => Err(ConfigError::InvalidLogLevel(other.to_string())),
        }
    }

    /// The `tracing`/`EnvFilter` level this maps to — `panic` and `fatal`
    /// have no tracing equivalent and are treated as `error` for filtering
    /// purposes (they still describe the emitting call site's severity).
    pub fn as_tracing_level(self) -> tracing::Level {
        match self {
            Self::Debug => tracing::Level::DEBUG,
            Self::Info => tracing::Level::INFO,
            Self::Warn => tracing::Level::WARN,
            Self::Error | Self::Panic | Self::Fatal => tracing::Level::ERROR,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogDest {
    Console,
    Remote,
}

impl LogDest {
    pub const ALL: &'static [&'static str] = &["console", "remote"];

    pub fn parse(s: &str) -> Result<Self, ConfigError> {
        match s {
            "console" => Ok(Self::Console),
            "remote" => Ok(Self::Remote),
            other => Err(ConfigError::InvalidLogDest(other.to_string())),
        }
    }
}

/// `vortex agent start` flags.
#[derive(Debug, Clone, clap::Args)]
pub struct StartArgs {
    /// Agent id.
    #[arg(short = 'i', long)]
    pub id: Option<String>,
    /// Controller server address.
    #[arg(short = 's', long)]
    pub server: Option<String>,
    /// Controller P-256 public key, uncompressed, lowercase hex.
    #[arg(short = 'k', long)]
    pub key: Option<String>,
    /// JSON config file: `{id, server, key, logLevel, logDest, dir}`.
    #[arg(short = 'C', long = "config")]
    pub config: Option<PathBuf>,
    /// Log level: debug, info, warn, error, panic, fatal.
    #[arg(long = "log-level", default_value = "info")]
    pub log_level: String,
    /// Log destination: console, remote.
    #[arg(long = "log-dest", default_value = "console")]
    pub log_dest: String,
    /// Directory internal scripts are resolved from; also searched by the
    /// shell runner's script lookup.
    #[arg(long)]
    pub dir: Option<PathBuf>,
}

/// The `--config` JSON file's schema.
#[derive(Debug, Default, Deserialize)]
struct ConfigFile {
    id: Option<String>,
    server: Option<String>,
    key: Option<String>,
    #[serde(rename = "logLevel")]
    log_level: Option<String>,
    #[serde(rename = "logDest")]
    log_dest: Option<String>,
    dir: Option<PathBuf>,
}

/// Fully resolved configuration for one `vortex agent start` invocation.
#[derive(Debug, Clone)]
pub struct AgentStartConfig {
    pub id: String,
    pub server: String,
    pub key: String,
    pub log_level: LogLevel,
    pub log_dest: LogDest,
    pub dir: Option<PathBuf>,
}

/// Resolve `args` into an [`AgentStartConfig`], loading and applying
/// `--config` if given.
pub fn resolve(args: StartArgs) -> Result<AgentStartConfig, ConfigError> {
    let mut log_level_str = args.log_level.clone();
    let mut log_dest_str = args.log_dest.clone();

    let (id, server, key, dir) = if let Some(path) = &args.config {
        let file = load_config_file(path)?;
        if let Some(level) = &file.log_level {
            log_level_str = level.clone();
        }
        if let Some(dest) = &file.log_dest {
            log_dest_str = dest.clone();
        }
        let id = file.id.ok_or(ConfigError::MissingRequiredFlags)?;
        let server = file.server.ok_or(ConfigError::MissingRequiredFlags)?;
        let key = file.key.ok_or(ConfigError::MissingRequiredFlags)?;
        (id, server, key, file.dir)
    } else {
        match (args.id, args.server, args.key) {
            (Some(id), Some(server), Some(key)) => (id, server, key, args.dir),
            _ => return Err(ConfigError::MissingRequiredFlags),
        }
    };

    let log_level = LogLevel::parse(&log_level_str)?;
    let log_dest = LogDest::parse(&log_dest_str)?;

    Ok(AgentStartConfig {
        id,
        server,
        key,
        log_level,
        log_dest,
        dir,
    })
}

fn load_config_file(path: &PathBuf) -> Result<ConfigFile, ConfigError> {
    let text = std::fs::read_to_string(path).map_err(|source| ConfigError::Open {
        path: path.clone(),
        source,
    })?;
    serde_json::from_str(&text).map_err(|source| ConfigError::Parse {
        path: path.clone(),
        source,
    })
}
