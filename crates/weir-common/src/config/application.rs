use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
    pub master: MasterConfig,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .admerge(Env::prefixed("WEIR__").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// The time budget for finding an executor for one task group
    /// before it is sent to the back of the pending queue.
    pub schedule_timeout_secs: u64,
    /// The maximum number of times a task group may be scheduled
    /// before its job is considered unrecoverable.
    pub max_schedule_attempts: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MasterConfig {
    pub event_buffer: usize,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_load_default_config() {
        let config = AppConfig::load().unwrap();
        assert!(config.scheduler.schedule_timeout_secs > 0);
        assert!(config.scheduler.max_schedule_attempts > 0);
        assert!(config.master.event_buffer > 0);
    }
}
