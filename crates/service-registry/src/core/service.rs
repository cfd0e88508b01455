//! Service registration and its health state.

use std::fmt::{Display, Formatter};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::common::ServiceId;

/// Health of a service registration derived from recent job outcomes.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum ServiceState {
    Normal,
    Warning,
    Error,
}

impl Display for ServiceState {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            ServiceState::Normal => write!(f, "NORMAL"),
            ServiceState::Warning => write!(f, "WARNING"),
            ServiceState::Error => write!(f, "ERROR"),
        }
    }
}

/// Represents a service of a given type running on a host.
///
/// There is at most one registration per (host, service type) pair.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct ServiceRegistration {
    pub id: ServiceId,
    pub service_type: String,
    /// Base URL of the owning host.
    pub host: String,
    /// REST path of the service relative to the host base URL.
    pub path: String,
    pub online: bool,
    pub active: bool,
    pub job_producer: bool,
    pub state: ServiceState,
    pub state_changed: DateTime<Utc>,
    /// Signature of the job which moved the service into WARNING.
    pub warning_state_trigger: Option<u64>,
    /// Signature of the job which moved the service into ERROR.
    pub error_state_trigger: Option<u64>,
    pub consecutive_failures: u32,
    pub online_from: Option<DateTime<Utc>>,
    pub version: u64,
}

impl ServiceRegistration {
    pub fn new(service_type: &str, host: &str, path: &str, job_producer: bool, now: DateTime<Utc>) -> Self {
        Self {
            id: 0,
            service_type: service_type.to_string(),
            host: host.to_string(),
            path: path.to_string(),
            online: true,
            active: true,
            job_producer,
            state: ServiceState::Normal,
            state_changed: now,
            warning_state_trigger: None,
            error_state_trigger: None,
            consecutive_failures: 0,
            online_from: Some(now),
            version: 0,
        }
    }

    /// Changes the health state, remembering the job signature which caused it.
    pub fn set_state(&mut self, state: ServiceState, trigger: Option<u64>, now: DateTime<Utc>) {
        match state {
            ServiceState::Normal => {
                self.warning_state_trigger = None;
                self.error_state_trigger = None;
            }
            ServiceState::Warning => {
                self.warning_state_trigger = trigger;
                self.error_state_trigger = None;
            }
            ServiceState::Error => self.error_state_trigger = trigger,
        }
        if self.state != state {
            self.state_changed = now;
        }
        self.state = state;
    }

    /// Returns whether the registration was degraded because of the job with the given signature.
    pub fn is_triggered_by(&self, signature: u64) -> bool {
        match self.state {
            ServiceState::Normal => false,
            ServiceState::Warning => self.warning_state_trigger == Some(signature),
            ServiceState::Error => self.error_state_trigger == Some(signature),
        }
    }
}

impl Display for ServiceRegistration {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "{}@{}", self.service_type, self.host)
    }
}
