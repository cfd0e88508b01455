//! Registry node configuration.

use std::time::Duration;

use log::warn;
use serde::{Deserialize, Serialize};

use crate::core::error::{RegistryError, Result};
use crate::core::health::HealthPolicy;

/// Dispatch passes never run more often than this.
const MIN_DISPATCH_INTERVAL: f64 = 1.0;

/// Holds raw registry config parsed from YAML file.
#[derive(Debug, Default, PartialEq, Serialize, Deserialize, Clone)]
struct RawRegistryConfig {
    pub node_url: Option<String>,
    pub dispatch_interval: Option<f64>,
    pub dispatch_timeout: Option<f64>,
    pub dispatch_page_size: Option<usize>,
    pub heartbeat_interval: Option<f64>,
    pub sweep_interval: Option<f64>,
    pub stale_job_threshold: Option<f64>,
    pub claim_timeout: Option<f64>,
    pub statistics_interval: Option<f64>,
    pub collect_job_statistics: Option<bool>,
    pub service_statistics_max_job_age: Option<u32>,
    pub parentless_job_lifetime: Option<u32>,
    pub cleanup_interval: Option<f64>,
    pub child_jobs_bypass_capacity: Option<bool>,
    pub max_attempts_before_error_state: Option<u32>,
    pub error_states_enabled: Option<bool>,
    pub no_error_state_service_types: Option<Vec<String>>,
}

/// Represents registry node configuration.
///
/// Intervals are given in seconds, an interval of zero disables the corresponding background loop.
#[derive(Debug, PartialEq, Serialize, Deserialize, Clone)]
pub struct RegistryConfig {
    /// Base URL of the host running this registry node.
    pub node_url: String,
    /// Period of dispatch passes in seconds. Values between 0 and 1 are raised to 1.
    pub dispatch_interval: f64,
    /// Timeout in seconds of a single job handoff.
    pub dispatch_timeout: f64,
    /// Number of jobs loaded from the store at once during a dispatch pass.
    pub dispatch_page_size: usize,
    /// Period of job producer heartbeat probes in seconds.
    pub heartbeat_interval: f64,
    /// Period of orphan sweeps in seconds.
    pub sweep_interval: f64,
    /// Running jobs started longer ago than this (in seconds) are failed as stale. Zero disables the check.
    pub stale_job_threshold: f64,
    /// Claims of queued jobs older than this (in seconds) are released by the sweep.
    pub claim_timeout: f64,
    /// Period of statistics refresh in seconds.
    pub statistics_interval: f64,
    pub collect_job_statistics: bool,
    /// Per-service statistics only consider jobs created within this number of days.
    pub service_statistics_max_job_age: u32,
    /// Finished parentless jobs older than this number of days are removed. Unset disables the cleanup.
    pub parentless_job_lifetime: Option<u32>,
    /// Period of parentless job cleanup in seconds.
    pub cleanup_interval: f64,
    /// Lets child jobs whose parent has no running children ignore host capacity.
    pub child_jobs_bypass_capacity: bool,
    pub health: HealthPolicy,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self::from_raw(RawRegistryConfig::default())
    }
}

impl RegistryConfig {
    /// Creates registry config by reading parameter values from YAML file
    /// (uses default values if some parameters are absent).
    pub fn from_file(file_name: &str) -> Result<Self> {
        let content = std::fs::read_to_string(file_name)
            .map_err(|e| RegistryError::Config(format!("can't read file {}: {}", file_name, e)))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self> {
        let raw: RawRegistryConfig =
            serde_yaml::from_str(content).map_err(|e| RegistryError::Config(format!("can't parse YAML: {}", e)))?;
        Ok(Self::from_raw(raw))
    }

    fn from_raw(raw: RawRegistryConfig) -> Self {
        let mut dispatch_interval = raw.dispatch_interval.unwrap_or(2.0);
        if dispatch_interval > 0. && dispatch_interval < MIN_DISPATCH_INTERVAL {
            warn!(
                "dispatch interval of {}s is too short, using {}s",
                dispatch_interval, MIN_DISPATCH_INTERVAL
            );
            dispatch_interval = MIN_DISPATCH_INTERVAL;
        }
        let defaults = HealthPolicy::default();
        Self {
            node_url: raw.node_url.unwrap_or_else(|| "http://localhost:8080".to_string()),
            dispatch_interval: dispatch_interval.max(0.),
            dispatch_timeout: raw.dispatch_timeout.unwrap_or(10.),
            dispatch_page_size: raw.dispatch_page_size.unwrap_or(100).max(1),
            heartbeat_interval: raw.heartbeat_interval.unwrap_or(60.),
            sweep_interval: raw.sweep_interval.unwrap_or(60.),
            stale_job_threshold: raw.stale_job_threshold.unwrap_or(48. * 3600.),
            claim_timeout: raw.claim_timeout.unwrap_or(300.),
            statistics_interval: raw.statistics_interval.unwrap_or(30.),
            collect_job_statistics: raw.collect_job_statistics.unwrap_or(true),
            service_statistics_max_job_age: raw.service_statistics_max_job_age.unwrap_or(14),
            parentless_job_lifetime: raw.parentless_job_lifetime,
            cleanup_interval: raw.cleanup_interval.unwrap_or(24. * 3600.),
            child_jobs_bypass_capacity: raw.child_jobs_bypass_capacity.unwrap_or(false),
            health: HealthPolicy {
                max_attempts_before_error: raw
                    .max_attempts_before_error_state
                    .unwrap_or(defaults.max_attempts_before_error),
                error_states_enabled: raw.error_states_enabled.unwrap_or(defaults.error_states_enabled),
                no_error_state_service_types: raw
                    .no_error_state_service_types
                    .unwrap_or(defaults.no_error_state_service_types),
            },
        }
    }
}

/// Converts a period in seconds to a duration, `None` if the period disables the task.
pub fn period(seconds: f64) -> Option<Duration> {
    if seconds > 0. {
        Some(Duration::from_secs_f64(seconds))
    } else {
        None
    }
}
