//! Detection of jobs left behind by vanished services and dispatchers.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Duration;
use log::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::common::{retry_on_conflict, JobId, ServiceId};
use crate::core::error::Result;
use crate::core::host::HostRegistration;
use crate::core::job::{FailureReason, Job, JobStatus};
use crate::core::jobs::JobManager;
use crate::core::service::ServiceRegistration;
use crate::core::store::{JobFilter, RegistryStore};

#[derive(Clone, Debug)]
pub struct SweepSettings {
    /// Running jobs started longer ago are failed as stale. `None` disables the check.
    pub stale_after: Option<Duration>,
    /// Claims of queued jobs older than this are released.
    pub claim_timeout: Duration,
}

/// Jobs touched by a sweep.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub orphaned: Vec<JobId>,
    pub stale: Vec<JobId>,
    pub released: Vec<JobId>,
}

impl SweepReport {
    pub fn is_empty(&self) -> bool {
        self.orphaned.is_empty() && self.stale.is_empty() && self.released.is_empty()
    }
}

/// Fails running jobs whose processor is gone or which run for too long, and releases abandoned claims.
///
/// Failed jobs are never resurrected: producers observe the FAILED status and decide whether to resubmit.
pub struct OrphanSweeper {
    store: Arc<dyn RegistryStore>,
    clock: Arc<dyn Clock>,
    jobs: Arc<JobManager>,
    settings: SweepSettings,
}

impl OrphanSweeper {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        clock: Arc<dyn Clock>,
        jobs: Arc<JobManager>,
        settings: SweepSettings,
    ) -> Self {
        Self {
            store,
            clock,
            jobs,
            settings,
        }
    }

    pub fn sweep(&self) -> Result<SweepReport> {
        let now = self.clock.now();
        let hosts: BTreeMap<String, HostRegistration> = self
            .store
            .hosts()?
            .into_iter()
            .map(|h| (h.base_url.clone(), h))
            .collect();
        let services: BTreeMap<ServiceId, ServiceRegistration> =
            self.store.services()?.into_iter().map(|s| (s.id, s)).collect();
        let processor_alive = |job: &Job| {
            job.processor_service
                .and_then(|id| services.get(&id))
                .and_then(|s| hosts.get(&s.host).map(|h| (s, h)))
                .map_or(false, |(s, h)| s.active && s.online && h.active && h.online)
        };

        let mut report = SweepReport::default();
        for job in self.store.jobs(&JobFilter::new().status(JobStatus::Running))? {
            if job.processor_service.is_none() {
                continue;
            }
            if !processor_alive(&job) {
                warn!("{} is orphaned: its processor on {:?} is gone", job, job.processing_host);
                match self.fail(job.id, FailureReason::Orphaned) {
                    Ok(true) => report.orphaned.push(job.id),
                    Ok(false) => {}
                    Err(e) => warn!("unable to fail orphaned {}: {}", job, e),
                }
                continue;
            }
            let stale = match (self.settings.stale_after, job.date_started) {
                (Some(stale_after), Some(started)) => now - started > stale_after,
                _ => false,
            };
            if stale {
                warn!("{} is stale: running since {:?}", job, job.date_started);
                match self.fail(job.id, FailureReason::Stale) {
                    Ok(true) => report.stale.push(job.id),
                    Ok(false) => {}
                    Err(e) => warn!("unable to fail stale {}: {}", job, e),
                }
            }
        }

        for job in self.store.jobs(&JobFilter::new().status(JobStatus::Queued))? {
            if !job.dispatchable || !job.is_claimed() {
                continue;
            }
            if !processor_alive(&job) || now - job.date_modified > self.settings.claim_timeout {
                debug!("releasing claim of {} on {:?}", job, job.processing_host);
                match self.release(job.id) {
                    Ok(true) => report.released.push(job.id),
                    Ok(false) => {}
                    Err(e) => warn!("unable to release claim of {}: {}", job, e),
                }
            }
        }

        if !report.is_empty() {
            info!(
                "sweep failed {} orphaned and {} stale jobs, released {} claims",
                report.orphaned.len(),
                report.stale.len(),
                report.released.len()
            );
        }
        Ok(report)
    }

    /// Cancels non-dispatchable jobs left unfinished on the host, e.g. by a previous run of a registry node.
    ///
    /// Returns the number of cancelled jobs.
    pub fn cancel_undispatchable_jobs(&self, host: &str) -> Result<usize> {
        let filter = JobFilter::new()
            .host(host)
            .status(JobStatus::Instantiated)
            .status(JobStatus::Running);
        let mut cancelled = 0;
        for job in self.store.jobs(&filter)?.into_iter().filter(|j| !j.dispatchable) {
            info!("cancelling undispatchable {} left on {}", job, host);
            if self.jobs.cancel_job(job.id)?.status == JobStatus::Cancelled {
                cancelled += 1;
            }
        }
        Ok(cancelled)
    }

    fn fail(&self, id: JobId, reason: FailureReason) -> Result<bool> {
        retry_on_conflict("job", || {
            let mut job = self.store.job(id)?;
            if job.status != JobStatus::Running {
                return Ok(false);
            }
            job.fail(reason);
            self.jobs.update_job(&job).map(|_| true)
        })
    }

    fn release(&self, id: JobId) -> Result<bool> {
        retry_on_conflict("job", || {
            let mut job = self.store.job(id)?;
            if !job.is_claimed() {
                return Ok(false);
            }
            job.processor_service = None;
            self.jobs.update_job(&job).map(|_| true)
        })
    }
}
