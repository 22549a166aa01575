use std::time::Duration;

use keel_common::config::AppConfig;

use crate::error::SchedulerError;

#[derive(Debug, Clone)]
pub struct SchedulerOptions {
    pub listen_host: String,
    pub listen_port: u16,
    pub tick_interval: Duration,
    /// Delay before the first retransmission of an unacknowledged send.
    pub relay_initial_delay: Duration,
    /// Ceiling for the delay between retransmissions.
    pub relay_max_delay: Duration,
    /// Multiplier applied to the retransmission delay after each attempt.
    pub relay_backoff_factor: u32,
    /// Total time before an unacknowledged send is given up on.
    pub relay_deadline: Duration,
}

impl Default for SchedulerOptions {
    fn default() -> Self {
        Self {
            listen_host: "127.0.0.1".to_string(),
            listen_port: 0,
            tick_interval: Duration::from_secs(1),
            relay_initial_delay: Duration::from_secs(1),
            relay_max_delay: Duration::from_secs(16),
            relay_backoff_factor: 2,
            relay_deadline: Duration::from_secs(30),
        }
    }
}

impl TryFrom<&AppConfig> for SchedulerOptions {
    type Error = SchedulerError;

    fn try_from(config: &AppConfig) -> Result<Self, Self::Error> {
        let scheduler = &config.scheduler;
        if scheduler.tick_interval_ms == 0 {
            return Err(SchedulerError::InvalidArgument(
                "the tick interval must be positive".to_string(),
            ));
        }
        if scheduler.relay_backoff_factor == 0 {
            return Err(SchedulerError::InvalidArgument(
                "the relay backoff factor must be positive".to_string(),
            ));
        }
        Ok(Self {
            listen_host: scheduler.listen_host.clone(),
            listen_port: scheduler.listen_port,
            tick_interval: Duration::from_millis(scheduler.tick_interval_ms),
            relay_initial_delay: Duration::from_millis(scheduler.relay_initial_delay_ms),
            relay_max_delay: Duration::from_millis(scheduler.relay_max_delay_ms),
            relay_backoff_factor: scheduler.relay_backoff_factor,
            relay_deadline: Duration::from_millis(scheduler.relay_deadline_ms),
        })
    }
}
