use std::time::Duration;

use weir_common::config::AppConfig;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    /// The time budget for one placement attempt before the task group is
    /// sent to the back of the queue.
    pub schedule_timeout: Duration,
    /// The number of scheduling attempts after which a recoverable failure
    /// escalates to an unrecoverable one.
    pub max_schedule_attempts: usize,
}

impl SchedulerOptions {
    pub fn new(config: &AppConfig) -> Self {
        Self {
            schedule_timeout: Duration::from_secs(config.scheduler.schedule_timeout_secs),
            max_schedule_attempts: config.scheduler.max_schedule_attempts,
        }
    }
}
