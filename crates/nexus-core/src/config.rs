//! Configuration for nexus components
//!
//! Supports YAML files, environment variables with a `NEXUS_` prefix, and
//! in-code defaults, with the usual precedence (env over file over default).

use crate::Result;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Top-level configuration shared by the scheduler and dispatcher binaries
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct NexusConfig {
    /// Global scheduler tier
    pub scheduler: SchedulerConfig,

    /// Per-query dispatch tier
    pub dispatcher: DispatcherConfig,
}

impl NexusConfig {
    /// Load configuration from defaults, an optional file named by
    /// `NEXUS_CONFIG` (falling back to `./nexus.yaml`), and `NEXUS_*`
    /// environment variables.
    pub fn load() -> Result<Self> {
        let mut builder =
            config::Config::builder().add_source(config::Config::try_from(&Self::default())?);

        if let Ok(config_path) = std::env::var("NEXUS_CONFIG") {
            builder = builder.add_source(config::File::with_name(&config_path).required(false));
        } else {
            builder = builder.add_source(config::File::with_name("./nexus.yaml").required(false));
        }

        builder = builder.add_source(
            config::Environment::with_prefix("NEXUS")
                .separator("_")
                .try_parsing(true),
        );

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    /// Load configuration from a specific file
    pub fn load_from_file(path: impl Into<PathBuf>) -> Result<Self> {
        let builder = config::Config::builder()
            .add_source(config::Config::try_from(&Self::default())?)
            .add_source(config::File::from(path.into()));

        let parsed: Self = builder.build()?.try_deserialize()?;
        parsed.validate()?;
        Ok(parsed)
    }

    pub fn validate(&self) -> Result<()> {
        self.scheduler.validate()?;
        self.dispatcher.validate()?;
        Ok(())
    }
}

/// Tunables of the global scheduler
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Beacon tick period in seconds
    pub beacon_interval_sec: u64,

    /// Maximum time between epoch schedules in seconds
    pub epoch_interval_sec: u64,

    /// Minimum time between triggered epoch schedules in seconds
    pub min_epoch_sec: u64,

    /// Moving-average horizon for request rates in seconds
    pub avg_interval_sec: u64,

    /// Master switch for epoch scheduling
    pub enable_epoch_schedule: bool,

    /// Run the backend consolidation pass inside each epoch
    pub enable_consolidation: bool,

    /// Occupancy above which a grown backend spills workload
    pub overload_occupancy: f64,

    /// Release capacity when the estimated rate drops below this fraction
    /// of the allocated throughput
    pub release_threshold: f64,

    /// Beacon triggers an epoch when the rate falls below this fraction of
    /// allocated throughput
    pub trigger_low: f64,

    /// Beacon triggers an epoch when the rate exceeds this fraction of
    /// allocated throughput
    pub trigger_high: f64,

    /// Floor applied to estimated request rates, in rps
    pub min_rate: f64,

    /// Evict a node whose last keepalive is older than this many beacon
    /// intervals
    pub keepalive_timeout_intervals: u64,

    /// Optional YAML file describing statically pinned workloads
    pub workload_file: Option<PathBuf>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            beacon_interval_sec: 1,
            epoch_interval_sec: 30,
            min_epoch_sec: 10,
            avg_interval_sec: 10,
            enable_epoch_schedule: true,
            enable_consolidation: false,
            overload_occupancy: 1.05,
            release_threshold: 0.97,
            trigger_low: 0.8,
            trigger_high: 1.1,
            min_rate: 0.1,
            keepalive_timeout_intervals: 2,
            workload_file: None,
        }
    }
}

impl SchedulerConfig {
    /// Length of the bounded rps history: three averaging horizons' worth of
    /// beacon samples, rounded up.
    pub fn history_len(&self) -> usize {
        let beacon = self.beacon_interval_sec.max(1);
        ((self.avg_interval_sec * 3 + beacon - 1) / beacon) as usize
    }

    pub fn validate(&self) -> Result<()> {
        if self.beacon_interval_sec == 0 {
            return Err(crate::Error::config("beacon_interval_sec must be positive"));
        }
        if self.min_epoch_sec > self.epoch_interval_sec {
            return Err(crate::Error::config(
                "min_epoch_sec must not exceed epoch_interval_sec",
            ));
        }
        if !(0.0..=1.0).contains(&self.release_threshold) {
            return Err(crate::Error::config("release_threshold must be in [0, 1]"));
        }
        if self.trigger_low >= self.trigger_high {
            return Err(crate::Error::config(
                "trigger_low must be below trigger_high",
            ));
        }
        if self.overload_occupancy < 1.0 {
            return Err(crate::Error::config("overload_occupancy must be >= 1"));
        }
        if self.min_rate <= 0.0 {
            return Err(crate::Error::config("min_rate must be positive"));
        }
        Ok(())
    }
}

/// Tunables of the per-query dispatcher
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// UDP port the dispatch plane listens on
    pub udp_port: u16,

    /// Number of datagram worker tasks
    pub num_udp_workers: usize,

    /// Constant budget added to the current time when stamping a plan's
    /// execution time, in microseconds
    pub network_latency_budget_us: u64,

    /// Largest acceptable datagram; one MTU-sized message
    pub max_datagram_bytes: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            udp_port: 7003,
            num_udp_workers: 4,
            network_latency_budget_us: 5000,
            max_datagram_bytes: 1400,
        }
    }
}

impl DispatcherConfig {
    pub fn validate(&self) -> Result<()> {
        if self.num_udp_workers == 0 {
            return Err(crate::Error::config("num_udp_workers must be positive"));
        }
        if self.max_datagram_bytes < 128 {
            return Err(crate::Error::config("max_datagram_bytes too small"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config_is_valid() {
        let config = NexusConfig::default();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_default_tunables_match_deployment() {
        let config = SchedulerConfig::default();
        assert_eq!(config.beacon_interval_sec, 1);
        assert_eq!(config.epoch_interval_sec, 30);
        assert_eq!(config.min_epoch_sec, 10);
        assert_eq!(config.overload_occupancy, 1.05);
        assert_eq!(config.release_threshold, 0.97);
        assert_eq!(config.min_rate, 0.1);
        assert_eq!(DispatcherConfig::default().network_latency_budget_us, 5000);
    }

    #[test]
    fn test_history_len_rounds_up() {
        let config = SchedulerConfig::default();
        // avg_interval 10s * 3 / beacon 1s
        assert_eq!(config.history_len(), 30);

        let coarse = SchedulerConfig {
            beacon_interval_sec: 4,
            avg_interval_sec: 10,
            ..Default::default()
        };
        // ceil(30 / 4) = 8
        assert_eq!(coarse.history_len(), 8);
    }

    #[test]
    fn test_validation_rejects_bad_thresholds() {
        let config = SchedulerConfig {
            trigger_low: 1.2,
            trigger_high: 1.1,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            overload_occupancy: 0.9,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = SchedulerConfig {
            min_epoch_sec: 60,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
