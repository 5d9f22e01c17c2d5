//! Configuration types

use crate::error::{ConfigError, WxflowResult};
use serde::{Deserialize, Serialize};

/// Environment variable overriding [`MemoryConfig::system_memory_limit_kb`].
pub const ENV_SYSTEM_MEMORY_LIMIT_KB: &str = "WXFLOW_SYSTEM_MEMORY_LIMIT_KB";
/// Environment variable overriding [`MemoryConfig::video_memory_limit_kb`].
pub const ENV_VIDEO_MEMORY_LIMIT_KB: &str = "WXFLOW_VIDEO_MEMORY_LIMIT_KB";
/// Environment variable overriding [`SchedulerConfig::worker_threads`].
pub const ENV_WORKER_THREADS: &str = "WXFLOW_WORKER_THREADS";
/// Environment variable overriding [`LogConfig::filter`].
pub const ENV_LOG_FILTER: &str = "WXFLOW_LOG_FILTER";
/// Environment variable overriding [`LogConfig::json`].
pub const ENV_LOG_JSON: &str = "WXFLOW_LOG_JSON";

/// Memory ceilings of the two resource caches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MemoryConfig {
    /// Ceiling of the CPU-side cache in kilobytes.
    pub system_memory_limit_kb: u64,
    /// Ceiling of the GPU-side cache in kilobytes.
    pub video_memory_limit_kb: u64,
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            system_memory_limit_kb: 4 * 1024 * 1024,
            video_memory_limit_kb: 1024 * 1024,
        }
    }
}

impl MemoryConfig {
    pub fn with_system_memory_limit_kb(mut self, kb: u64) -> Self {
        self.system_memory_limit_kb = kb;
        self
    }

    pub fn with_video_memory_limit_kb(mut self, kb: u64) -> Self {
        self.video_memory_limit_kb = kb;
        self
    }
}

/// Worker scheduler configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads of the multi-threaded scheduler.
    pub worker_threads: usize,
    /// Thread name prefix for worker threads.
    pub thread_name: String,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            worker_threads: 4,
            thread_name: "wxflow-worker".to_string(),
        }
    }
}

impl SchedulerConfig {
    pub fn with_worker_threads(mut self, n: usize) -> Self {
        self.worker_threads = n;
        self
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct LogConfig {
    /// Default `EnvFilter` directive used when `RUST_LOG` is unset.
    pub filter: String,
    /// Emit JSON lines instead of human-readable output.
    pub json: bool,
}

impl Default for LogConfig {
    fn default() -> Self {
        Self {
            filter: "info".to_string(),
            json: false,
        }
    }
}

/// Master configuration struct.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WxflowConfig {
    pub memory: MemoryConfig,
    pub scheduler: SchedulerConfig,
    pub log: LogConfig,
}

impl WxflowConfig {
    /// Parse a TOML document. Missing sections and fields take their defaults.
    pub fn from_toml_str(s: &str) -> WxflowResult<Self> {
        let config: Self = toml::from_str(s).map_err(|e| ConfigError::Parse {
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Defaults overridden by `WXFLOW_*` environment variables.
    pub fn from_env() -> WxflowResult<Self> {
        Self::default().with_overrides(|name| std::env::var(name).ok())
    }

    /// Apply overrides looked up through `lookup`, then validate.
    pub fn with_overrides<F>(mut self, lookup: F) -> WxflowResult<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(ENV_SYSTEM_MEMORY_LIMIT_KB) {
            self.memory.system_memory_limit_kb = parse_env(ENV_SYSTEM_MEMORY_LIMIT_KB, &raw)?;
        }
        if let Some(raw) = lookup(ENV_VIDEO_MEMORY_LIMIT_KB) {
            self.memory.video_memory_limit_kb = parse_env(ENV_VIDEO_MEMORY_LIMIT_KB, &raw)?;
        }
        if let Some(raw) = lookup(ENV_WORKER_THREADS) {
            self.scheduler.worker_threads = parse_env(ENV_WORKER_THREADS, &raw)?;
        }
        if let Some(raw) = lookup(ENV_LOG_FILTER) {
            self.log.filter = raw;
        }
        if let Some(raw) = lookup(ENV_LOG_JSON) {
            self.log.json = match raw.trim().to_ascii_lowercase().as_str() {
                "1" | "true" | "yes" => true,
                "0" | "false" | "no" => false,
                _ => {
                    return Err(ConfigError::InvalidValue {
                        field: ENV_LOG_JSON.to_string(),
                        value: raw,
                        reason: "expected a boolean".to_string(),
                    }
                    .into())
                }
            };
        }
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> WxflowResult<()> {
        if self.memory.system_memory_limit_kb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "system_memory_limit_kb".to_string(),
                value: self.memory.system_memory_limit_kb.to_string(),
                reason: "system_memory_limit_kb must be greater than 0".to_string(),
            }
            .into());
        }

        if self.memory.video_memory_limit_kb == 0 {
            return Err(ConfigError::InvalidValue {
                field: "video_memory_limit_kb".to_string(),
                value: self.memory.video_memory_limit_kb.to_string(),
                reason: "video_memory_limit_kb must be greater than 0".to_string(),
            }
            .into());
        }

        if self.scheduler.worker_threads == 0 {
            return Err(ConfigError::InvalidValue {
                field: "worker_threads".to_string(),
                value: self.scheduler.worker_threads.to_string(),
                reason: "worker_threads must be greater than 0".to_string(),
            }
            .into());
        }

        if self.log.filter.trim().is_empty() {
            return Err(ConfigError::InvalidValue {
                field: "log.filter".to_string(),
                value: self.log.filter.clone(),
                reason: "log filter must not be empty".to_string(),
            }
            .into());
        }

        Ok(())
    }
}

fn parse_env<T>(name: &str, raw: &str) -> WxflowResult<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    raw.trim().parse().map_err(|e: T::Err| {
        ConfigError::InvalidValue {
            field: name.to_string(),
            value: raw.to_string(),
            reason: e.to_string(),
        }
        .into()
    })
}
