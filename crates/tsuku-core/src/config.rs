//! Verification settings.
//!
//! Values come from three layers, later ones winning: built-in defaults,
//! the `[verify]` table of `$TSUKU_HOME/config.toml`, and environment
//! variables. Per-invocation switches (`--skip-integrity` and friends) are
//! applied by the caller on the resulting [`VerifyConfig`].

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;
use tsuku_schema::Platform;

use crate::paths::TsukuHome;

/// Default per-batch budget for the load-test helper.
pub const DEFAULT_DLTEST_TIMEOUT: Duration = Duration::from_secs(5);

/// Default number of files per helper invocation.
pub const DEFAULT_DLTEST_BATCH: usize = 50;

/// Overrides the worker bound.
pub const WORKERS_ENV: &str = "TSUKU_VERIFY_WORKERS";

/// Overrides the helper binary path.
pub const DLTEST_ENV: &str = "TSUKU_DLTEST";

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Failed to parse {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: toml::de::Error,
    },

    #[error("Invalid value for {key}: {message}")]
    Invalid { key: &'static str, message: String },
}

/// On-disk `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    /// The `[verify]` table
    pub verify: VerifySection,
}

/// The `[verify]` table of `config.toml`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct VerifySection {
    /// Maximum artifacts verified concurrently
    pub workers: Option<usize>,
    /// Seconds before a helper batch is killed
    pub dltest_timeout_secs: Option<u64>,
    /// Files per helper invocation
    pub dltest_batch_size: Option<usize>,
    /// Explicit path to the `tsuku-dltest` helper
    pub dltest_helper: Option<PathBuf>,
}

impl FileConfig {
    /// Load `config.toml`. A missing file yields defaults.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] if the file exists but is unreadable or invalid.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Self::default()),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Everything a verification run needs to know up front.
#[derive(Debug, Clone)]
pub struct VerifyConfig {
    /// Managed root
    pub home: TsukuHome,
    /// Platform binaries are checked against
    pub platform: Platform,
    /// True when `platform` was detected from the running host rather than
    /// overridden. Only then can interpreter paths be checked on disk.
    pub platform_is_host: bool,
    /// Maximum artifacts verified concurrently (at least 1)
    pub workers: usize,
    /// Budget for one helper batch
    pub dltest_timeout: Duration,
    /// Files per helper invocation (at least 1)
    pub dltest_batch_size: usize,
    /// Explicit helper location, if configured
    pub dltest_helper: Option<PathBuf>,
    /// Downgrade integrity mismatches to warnings
    pub skip_integrity: bool,
    /// Do not run the load test at all
    pub skip_dlopen: bool,
}

impl VerifyConfig {
    /// Defaults for `home` on `platform`, before any file or env layer.
    pub fn new(home: TsukuHome, platform: Platform) -> Self {
        Self {
            home,
            platform,
            platform_is_host: true,
            workers: num_cpus::get().max(1),
            dltest_timeout: DEFAULT_DLTEST_TIMEOUT,
            dltest_batch_size: DEFAULT_DLTEST_BATCH,
            dltest_helper: None,
            skip_integrity: false,
            skip_dlopen: false,
        }
    }

    /// Apply `config.toml` and the process environment.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] for an unreadable file or an invalid value.
    pub fn load(home: TsukuHome, platform: Platform) -> Result<Self, ConfigError> {
        let file = FileConfig::load(&home.config_file())?;
        Self::new(home, platform).layered(&file, |key| std::env::var(key).ok())
    }

    /// Apply a parsed file and an environment lookup on top of `self`.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] for zero or unparsable values.
    pub fn layered(
        mut self,
        file: &FileConfig,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Self, ConfigError> {
        let v = &file.verify;
        if let Some(workers) = v.workers {
            self.workers = non_zero("verify.workers", workers)?;
        }
        if let Some(secs) = v.dltest_timeout_secs {
            self.dltest_timeout = Duration::from_secs(non_zero("verify.dltest_timeout_secs", secs)?);
        }
        if let Some(batch) = v.dltest_batch_size {
            self.dltest_batch_size = non_zero("verify.dltest_batch_size", batch)?;
        }
        if let Some(helper) = &v.dltest_helper {
            self.dltest_helper = Some(helper.clone());
        }

        if let Some(raw) = env(WORKERS_ENV) {
            let workers = raw.trim().parse::<usize>().map_err(|e| ConfigError::Invalid {
                key: WORKERS_ENV,
                message: e.to_string(),
            })?;
            self.workers = non_zero(WORKERS_ENV, workers)?;
        }
        if let Some(helper) = env(DLTEST_ENV).filter(|s| !s.is_empty()) {
            self.dltest_helper = Some(PathBuf::from(helper));
        }
        Ok(self)
    }
}

fn non_zero<T: PartialEq + Default>(key: &'static str, value: T) -> Result<T, ConfigError> {
    if value == T::default() {
        return Err(ConfigError::Invalid {
            key,
            message: "must be greater than zero".into(),
        });
    }
    Ok(value)
}
