//! Configuration file parsing and defaults.
//!
//! The server reads a line-oriented `KEY=VALUE` file. Blank lines and
//! lines beginning with `#` are ignored; whitespace around keys and
//! values is trimmed. Unknown keys are warned about and skipped so a
//! config written for a newer version still loads.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;
use tracing::warn;

/// Default configuration path when none is given on the command line.
pub const DEFAULT_CONFIG_PATH: &str = "server.conf";

/// Per-worker cache capacity floor.
const MIN_WORKER_CACHE_BYTES: u64 = 1024 * 1024;

/// Errors that can occur while loading the configuration file.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// The configuration file exists but could not be read.
    #[error("failed to read config file {path}: {source}")]
    Io {
        /// The path that failed to read.
        path: PathBuf,
        /// The underlying IO error.
        #[source]
        source: std::io::Error,
    },

    /// A line is not of the form `KEY=VALUE`.
    #[error("malformed line {line} in {path}: expected KEY=VALUE, got {text:?}")]
    MalformedLine {
        /// The path being parsed.
        path: PathBuf,
        /// One-based line number.
        line: usize,
        /// The offending line text.
        text: String,
    },

    /// A recognized key carries a value that does not parse or is out of range.
    #[error("invalid value for {key} in {path}: {value:?}")]
    InvalidValue {
        /// The path being parsed.
        path: PathBuf,
        /// The key with the bad value.
        key: String,
        /// The raw value text.
        value: String,
    },
}

/// Server configuration.
///
/// Every field has a default; a missing config file at the default path
/// yields `Config::default()`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    /// TCP listen port. Zero binds an ephemeral port.
    pub port: u16,
    /// Filesystem root that request paths are resolved against.
    pub document_root: PathBuf,
    /// Number of worker tiers.
    pub num_workers: usize,
    /// Handler tasks per worker.
    pub threads_per_worker: usize,
    /// Admission queue capacity (also bounds each worker's job queue).
    pub max_queue_size: usize,
    /// Access log path.
    pub log_file: PathBuf,
    /// Total cache budget in MiB, split across workers.
    pub cache_size_mb: u64,
    /// Per-request timeout. Parsed and stored; not yet enforced.
    pub timeout: Duration,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            port: 8080,
            document_root: PathBuf::from("www"),
            num_workers: 2,
            threads_per_worker: 10,
            max_queue_size: 100,
            log_file: PathBuf::from("logs/access.log"),
            cache_size_mb: 64,
            timeout: Duration::from_secs(30),
        }
    }
}

impl Config {
    /// Loads configuration from `path`.
    ///
    /// A missing file yields defaults with a warning; the caller decides
    /// whether a missing explicitly-given path should be fatal instead.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file exists but cannot be read,
    /// [`ConfigError::MalformedLine`] for lines without `=`, and
    /// [`ConfigError::InvalidValue`] for unparseable or out-of-range
    /// values of recognized keys.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let text = match std::fs::read_to_string(path) {
            Ok(text) => text,
            Err(source) if source.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "config file not found, using defaults");
                return Ok(Self::default());
            }
            Err(source) => {
                return Err(ConfigError::Io {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        Self::parse(&text, path)
    }

    /// Parses configuration text. Exposed for tests; `path` is used only
    /// in error messages.
    ///
    /// # Errors
    ///
    /// Same as [`Config::from_file`], minus the IO cases.
    pub fn parse(text: &str, path: &Path) -> Result<Self, ConfigError> {
        let mut config = Self::default();

        for (idx, raw_line) in text.lines().enumerate() {
            let line = raw_line.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }

            let Some((key, value)) = line.split_once('=') else {
                return Err(ConfigError::MalformedLine {
                    path: path.to_path_buf(),
                    line: idx + 1,
                    text: raw_line.to_string(),
                });
            };
            let key = key.trim();
            let value = value.trim();

            match key {
                "PORT" => config.port = parse_number(path, key, value)?,
                "DOCUMENT_ROOT" => config.document_root = PathBuf::from(value),
                "NUM_WORKERS" => {
                    config.num_workers = parse_positive(path, key, value)?;
                }
                "THREADS_PER_WORKER" => {
                    config.threads_per_worker = parse_positive(path, key, value)?;
                }
                "MAX_QUEUE_SIZE" => {
                    config.max_queue_size = parse_positive(path, key, value)?;
                }
                "LOG_FILE" => config.log_file = PathBuf::from(value),
                "CACHE_SIZE_MB" => config.cache_size_mb = parse_number(path, key, value)?,
                "TIMEOUT_SECONDS" => {
                    config.timeout = Duration::from_secs(parse_number(path, key, value)?);
                }
                _ => warn!(key, "ignoring unrecognized config key"),
            }
        }

        Ok(config)
    }

    /// Per-worker cache capacity in bytes: the total budget divided by the
    /// worker count, with a floor of 1 MiB.
    #[must_use]
    pub fn per_worker_cache_bytes(&self) -> u64 {
        let workers = self.num_workers.max(1) as u64;
        let total = self.cache_size_mb * 1024 * 1024;
        (total / workers).max(MIN_WORKER_CACHE_BYTES)
    }
}

fn parse_number<T: std::str::FromStr>(
    path: &Path,
    key: &str,
    value: &str,
) -> Result<T, ConfigError> {
    value.parse().map_err(|_| ConfigError::InvalidValue {
        path: path.to_path_buf(),
        key: key.to_string(),
        value: value.to_string(),
    })
}

/// Parses a count-valued key; zero is rejected.
fn parse_positive(path: &Path, key: &str, value: &str) -> Result<usize, ConfigError> {
    let parsed: usize = parse_number(path, key, value)?;
    if parsed == 0 {
        return Err(ConfigError::InvalidValue {
            path: path.to_path_buf(),
            key: key.to_string(),
            value: value.to_string(),
        });
    }
    Ok(parsed)
}
