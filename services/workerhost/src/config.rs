//! Configuration: per-worker phase timeouts plus the host-wide environment
//! flags.
//!
//! Layered with `figment` (Defaults → YAML file → environment).

use std::path::PathBuf;
use std::time::Duration;

use figment::providers::{Env, Format, Serialized, Yaml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::Result;

fn secs(n: u64) -> Duration {
    Duration::from_secs(n)
}

/// Per-phase timeouts and directories for a single worker channel.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ChannelConfig {
    pub worker_directory: String,
    pub function_app_directory: String,
    pub executable: String,
    pub language: String,

    #[serde(with = "duration_secs")]
    pub startup_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub init_timeout: Duration,
    #[serde(with = "duration_secs")]
    pub env_reload_timeout: Duration,
    /// `None` means unbounded for the per-load-batch deadline.
    pub function_load_timeout_secs: Option<u64>,

    #[serde(with = "duration_secs")]
    pub terminate_grace_period: Duration,

    pub shared_memory_threshold_bytes: usize,
}

impl Default for ChannelConfig {
    fn default() -> Self {
        Self {
            worker_directory: String::new(),
            function_app_directory: String::new(),
            executable: String::new(),
            language: "unspecified".to_string(),
            startup_timeout: secs(60),
            init_timeout: secs(30),
            env_reload_timeout: secs(30),
            function_load_timeout_secs: None,
            terminate_grace_period: secs(5),
            shared_memory_threshold_bytes: crate::shared_memory::DEFAULT_THRESHOLD_BYTES,
        }
    }
}

impl ChannelConfig {
    pub fn function_load_timeout(&self) -> Option<Duration> {
        self.function_load_timeout_secs.map(secs)
    }

    /// Load from an optional YAML file layered under `WORKERHOST_`-prefixed
    /// environment variables, falling back to defaults for anything unset.
    pub fn load(yaml_path: Option<&PathBuf>) -> Result<Self> {
        let mut figment = Figment::new().merge(Serialized::defaults(ChannelConfig::default()));
        if let Some(path) = yaml_path {
            figment = figment.merge(Yaml::file(path));
        }
        figment = figment.merge(Env::prefixed("WORKERHOST_"));
        figment.extract().map_err(|e| crate::error::WorkerChannelError::Other(e.to_string()))
    }
}

/// Host-wide environment flags.
#[derive(Debug, Clone, Default)]
pub struct HostEnvironment {
    pub shared_memory_enabled: bool,
    pub dynamic_concurrency_enabled: bool,
    pub app_insights_enabled: bool,
    pub v2_compatibility_mode: bool,
}

impl HostEnvironment {
    pub fn from_process_env() -> Self {
        let truthy = |name: &str| {
            std::env::var(name)
                .map(|v| matches!(v.as_str(), "1" | "true" | "True" | "TRUE"))
                .unwrap_or(false)
        };
        Self {
            shared_memory_enabled: truthy("FunctionsWorkerSharedMemoryDataTransferEnabled"),
            dynamic_concurrency_enabled: truthy("FunctionsWorkerDynamicConcurrencyEnabled"),
            app_insights_enabled: truthy("APPLICATIONINSIGHTS_ENABLE_AGENT"),
            v2_compatibility_mode: truthy("FUNCTIONS_V2_COMPATIBILITY_MODE"),
        }
    }
}

mod duration_secs {
    use std::time::Duration;

    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(d: &Duration, s: S) -> Result<S::Ok, S::Error> {
        s.serialize_u64(d.as_secs())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(d: D) -> Result<Duration, D::Error> {
        let secs = u64::deserialize(d)?;
        Ok(Duration::from_secs(secs))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_sane() {
        let cfg = ChannelConfig::default();
        assert_eq!(cfg.startup_timeout, secs(60));
        assert!(cfg.function_load_timeout().is_none());
    }

    #[test]
    fn env_overrides_default_timeout() {
        std::env::set_var("WORKERHOST_STARTUP_TIMEOUT", "5");
        let cfg = ChannelConfig::load(None).unwrap();
        assert_eq!(cfg.startup_timeout, secs(5));
        std::env::remove_var("WORKERHOST_STARTUP_TIMEOUT");
    }
}
