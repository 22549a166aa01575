use figment::providers::{Env, Format, Toml};
use figment::Figment;
use serde::{Deserialize, Serialize};

use crate::error::{CommonError, CommonResult};

const DEFAULT_CONFIG: &str = include_str!("default.toml");

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub scheduler: SchedulerConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// The host that the scheduler transport binds to.
    pub listen_host: String,
    /// The port that the scheduler transport binds to.
    /// Port `0` lets the operating system choose a free port.
    pub listen_port: u16,
    pub tick_interval_ms: u64,
    /// Delay before the first retransmission of an unacknowledged send.
    pub relay_initial_delay_ms: u64,
    /// Ceiling for the delay between retransmissions.
    pub relay_max_delay_ms: u64,
    /// Multiplier applied to the retransmission delay after each attempt.
    /// A factor of 1 retransmits at a fixed interval.
    pub relay_backoff_factor: u32,
    /// Total time before an unacknowledged send is given up on.
    pub relay_deadline_ms: u64,
}

impl AppConfig {
    pub fn load() -> CommonResult<Self> {
        Figment::from(Toml::string(DEFAULT_CONFIG))
            .merge(Env::prefixed("KEEL_").map(|p| p.as_str().replace("__", ".").into()))
            .extract()
            .map_err(|e| CommonError::InvalidArgument(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AppConfig::load().unwrap();
        assert_eq!(config.scheduler.listen_host, "127.0.0.1");
        assert_eq!(config.scheduler.listen_port, 0);
        assert_eq!(config.scheduler.relay_initial_delay_ms, 1000);
        assert_eq!(config.scheduler.relay_backoff_factor, 2);
        assert_eq!(config.scheduler.relay_deadline_ms, 30000);
    }
}
