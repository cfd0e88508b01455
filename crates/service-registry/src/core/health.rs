//! Service health derived from job and dispatch outcomes.

use std::sync::Arc;

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::clock::Clock;
use crate::core::common::{retry_on_conflict, ServiceId, TYPE_WORKFLOW};
use crate::core::error::Result;
use crate::core::job::{FailureReason, Job, JobStatus};
use crate::core::service::{ServiceRegistration, ServiceState};
use crate::core::store::RegistryStore;

/// Thresholds of the health state machine.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct HealthPolicy {
    /// Number of consecutive failures after which a service in WARNING moves to ERROR.
    pub max_attempts_before_error: u32,
    pub error_states_enabled: bool,
    /// Service types which never go to ERROR.
    pub no_error_state_service_types: Vec<String>,
}

impl Default for HealthPolicy {
    fn default() -> Self {
        Self {
            max_attempts_before_error: 10,
            error_states_enabled: true,
            no_error_state_service_types: Vec::new(),
        }
    }
}

impl HealthPolicy {
    fn may_enter_error(&self, service_type: &str) -> bool {
        self.error_states_enabled && !self.no_error_state_service_types.iter().any(|t| t == service_type)
    }
}

/// Updates health states of service registrations.
///
/// A failure moves a NORMAL service to WARNING and a WARNING service with enough consecutive failures to ERROR,
/// remembering the signature of the failing job as the trigger. If other services of the same type were degraded by
/// a job with the same signature, the job itself is the likely culprit: those services are de-escalated instead and
/// the current one is left alone. A success resets the service to NORMAL.
pub struct HealthTracker {
    store: Arc<dyn RegistryStore>,
    clock: Arc<dyn Clock>,
    policy: HealthPolicy,
}

impl HealthTracker {
    pub fn new(store: Arc<dyn RegistryStore>, clock: Arc<dyn Clock>, policy: HealthPolicy) -> Self {
        Self { store, clock, policy }
    }

    /// Applies the outcome of a job which just reached FINISHED or FAILED.
    pub fn on_job_completed(&self, job: &Job) -> Result<()> {
        if job.job_type == TYPE_WORKFLOW {
            return Ok(());
        }
        let service = match job.processor_service {
            Some(service) => service,
            None => return Ok(()),
        };
        match job.status {
            JobStatus::Finished => self.record_success(service),
            JobStatus::Failed => match job.failure_reason {
                FailureReason::Data | FailureReason::Orphaned | FailureReason::Stale => {
                    debug!("{} failed with reason {:?}, health unchanged", job, job.failure_reason);
                    Ok(())
                }
                FailureReason::None | FailureReason::Processing => self.record_failure(service, job.signature()),
            },
            _ => Ok(()),
        }
    }

    /// Resets the failure count of the service and brings it back to NORMAL.
    pub fn record_success(&self, service: ServiceId) -> Result<()> {
        let now = self.clock.now();
        retry_on_conflict("service health", || {
            let mut registration = self.store.service(service)?;
            if registration.consecutive_failures == 0 && registration.state == ServiceState::Normal {
                return Ok(());
            }
            if registration.state != ServiceState::Normal {
                info!("health of {} reset to NORMAL", registration);
            }
            registration.consecutive_failures = 0;
            registration.set_state(ServiceState::Normal, None, now);
            self.store.update_service(&registration).map(|_| ())
        })
    }

    /// Accounts a failure of the job with the given signature on the service.
    pub fn record_failure(&self, service: ServiceId, signature: u64) -> Result<()> {
        let current = self.store.service(service)?;
        let related: Vec<ServiceRegistration> = self
            .store
            .services_by_type(&current.service_type)?
            .into_iter()
            .filter(|s| s.id != current.id && s.is_triggered_by(signature))
            .collect();

        if !related.is_empty() {
            for registration in related {
                self.deescalate(registration.id, signature)?;
            }
            return Ok(());
        }

        let now = self.clock.now();
        retry_on_conflict("service health", || {
            let mut registration = self.store.service(service)?;
            registration.consecutive_failures += 1;
            match registration.state {
                ServiceState::Normal => {
                    info!("health of {} set to WARNING", registration);
                    registration.set_state(ServiceState::Warning, Some(signature), now);
                }
                ServiceState::Warning
                    if registration.consecutive_failures >= self.policy.max_attempts_before_error
                        && self.policy.may_enter_error(&registration.service_type) =>
                {
                    info!(
                        "health of {} set to ERROR after {} failures",
                        registration, registration.consecutive_failures
                    );
                    registration.set_state(ServiceState::Error, Some(signature), now);
                }
                _ => {}
            }
            self.store.update_service(&registration).map(|_| ())
        })
    }

    fn deescalate(&self, service: ServiceId, signature: u64) -> Result<()> {
        let now = self.clock.now();
        retry_on_conflict("service health", || {
            let mut registration = self.store.service(service)?;
            if !registration.is_triggered_by(signature) {
                return Ok(());
            }
            match registration.state {
                ServiceState::Warning => {
                    info!("health of related service {} reset to NORMAL", registration);
                    registration.consecutive_failures = 0;
                    registration.set_state(ServiceState::Normal, None, now);
                }
                ServiceState::Error => {
                    info!("health of related service {} reset to WARNING", registration);
                    let trigger = registration.warning_state_trigger;
                    registration.consecutive_failures = 0;
                    registration.set_state(ServiceState::Warning, trigger, now);
                }
                ServiceState::Normal => return Ok(()),
            }
            self.store.update_service(&registration).map(|_| ())
        })
    }
}
