use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, IoResultExt, Result};

/// engine configuration stored in a TOML file
///
/// every section and knob has a default, so an empty file is a valid config.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub storage: StorageConfig,
    pub cache: CacheConfig,
    pub scheduler: SchedulerConfig,
    pub executor: ExecutorConfig,
}

impl Config {
    /// load and validate config from file
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path).with_path(path)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// save config to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self)?;
        std::fs::write(path, content).with_path(path)?;
        Ok(())
    }

    /// reject bounds that would make a component unusable
    pub fn validate(&self) -> Result<()> {
        let checks = [
            (self.storage.batch_write_threshold, "storage.batch_write_threshold"),
            (self.cache.max_files, "cache.max_files"),
            (self.cache.max_directories, "cache.max_directories"),
            (self.scheduler.max_pending_jobs, "scheduler.max_pending_jobs"),
        ];
        for (value, name) in checks {
            if value == 0 {
                return Err(Error::InvalidArgument(format!("{} must be positive", name)));
            }
        }
        if self.cache.max_size_bytes == 0 {
            return Err(Error::InvalidArgument(
                "cache.max_size_bytes must be positive".to_string(),
            ));
        }
        Ok(())
    }
}

/// blob storage behind the CAS and action cache
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    pub path: PathBuf,
    /// blobs up to this size go to the small-blob store
    pub size_cutoff_bytes: u64,
    /// pending uploads buffered before the worker flushes
    pub batch_write_threshold: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/storage"),
            size_cutoff_bytes: 1 << 20,
            batch_write_threshold: 250,
        }
    }
}

/// input file and directory caches on the worker
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub path: PathBuf,
    pub max_files: usize,
    pub max_size_bytes: u64,
    pub max_directories: usize,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            path: PathBuf::from("/cache"),
            max_files: 10000,
            max_size_bytes: 1 << 30,
            max_directories: 1000,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// submissions beyond this many queued jobs are rejected
    pub max_pending_jobs: usize,
    /// how long a completed job stays watchable by name
    pub completed_retention_secs: u64,
}

impl SchedulerConfig {
    pub fn completed_retention(&self) -> Duration {
        Duration::from_secs(self.completed_retention_secs)
    }
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_pending_jobs: 16,
            completed_retention_secs: 300,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub build_directory: PathBuf,
    /// stdout, stderr and output files up to this size are inlined in results
    pub inline_output_limit_bytes: u64,
    pub default_timeout_secs: u64,
    /// identity the build runs as; only applied when running as root
    #[serde(skip_serializing_if = "Option::is_none")]
    pub run_as: Option<RunAs>,
}

impl ExecutorConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            build_directory: PathBuf::from("/build"),
            inline_output_limit_bytes: 1024,
            default_timeout_secs: 3600,
            run_as: Some(RunAs::default()),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunAs {
    pub uid: u32,
    pub gid: u32,
}

impl Default for RunAs {
    fn default() -> Self {
        Self { uid: 1, gid: 1 }
    }
}
