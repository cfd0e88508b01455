//! Dispatch passes: matching queued jobs with the least loaded services able to process them.

use std::collections::{BTreeMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, trace, warn};

use crate::core::common::{retry_on_conflict, JobId, ServiceId, MAX_UPDATE_ATTEMPTS, TYPE_WORKFLOW};
use crate::core::directory::Directory;
use crate::core::error::Result;
use crate::core::health::HealthTracker;
use crate::core::host::HostRegistration;
use crate::core::job::{Job, JobStatus};
use crate::core::jobs::JobManager;
use crate::core::load::SystemLoad;
use crate::core::ranking::{rank_services, CapacityMode};
use crate::core::service::ServiceRegistration;
use crate::core::store::JobFilter;
use crate::dispatch::client::{DispatchClient, DispatchResponse};

#[derive(Clone, Debug)]
pub struct DispatchSettings {
    /// Maximum duration of a single handoff.
    pub timeout: Duration,
    /// Number of jobs loaded from the store at once.
    pub page_size: usize,
    /// Lets a child job ignore host capacity when its parent has no running children, so that parents waiting for
    /// their children can not starve the cluster.
    pub child_jobs_bypass_capacity: bool,
}

/// Outcome of a dispatch pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct DispatchReport {
    /// Jobs accepted by a service.
    pub dispatched: Vec<JobId>,
    /// Jobs without any eligible service.
    pub no_capacity: usize,
    /// Jobs claimed, cancelled or otherwise changed by someone else first, including during the handoff.
    pub lost: usize,
    /// Jobs declined by every candidate service.
    pub declined: usize,
    /// Jobs skipped because an earlier job of the same type and operation found no service.
    pub skipped: usize,
}

enum Outcome {
    Dispatched(JobId),
    NoCapacity,
    Lost,
    Declined,
    Skipped,
}

/// View of the cluster used during a pass. Loads are bumped locally on every accepted handoff.
struct PassState {
    hosts: BTreeMap<String, HostRegistration>,
    services: Vec<ServiceRegistration>,
    loads: SystemLoad,
    /// `type@operation` keys without eligible services.
    undispatchable: HashSet<String>,
    /// Registrations degraded during the pass.
    degraded: HashSet<ServiceId>,
}

/// Periodically hands queued jobs to worker services.
///
/// A job is first claimed by a versioned write recording the chosen processor while the job stays QUEUED. Losing
/// this write means another registry node or a cancellation got there first, and the job is left alone. The claimed
/// job is then offered to the service. If the service accepts, the job becomes RUNNING; if every candidate declines,
/// the claim is released and the job waits for the next pass.
pub struct Dispatcher {
    directory: Arc<Directory>,
    jobs: Arc<JobManager>,
    health: Arc<HealthTracker>,
    client: Arc<dyn DispatchClient>,
    settings: DispatchSettings,
}

impl Dispatcher {
    pub fn new(
        directory: Arc<Directory>,
        jobs: Arc<JobManager>,
        health: Arc<HealthTracker>,
        client: Arc<dyn DispatchClient>,
        settings: DispatchSettings,
    ) -> Self {
        Self {
            directory,
            jobs,
            health,
            client,
            settings,
        }
    }

    /// Runs a single dispatch pass over all dispatchable jobs in creation order.
    pub async fn dispatch_pass(&self) -> Result<DispatchReport> {
        let mut report = DispatchReport::default();
        let mut undispatchable = HashSet::new();
        let mut degraded = HashSet::new();
        let mut after = None;
        loop {
            let page = self.jobs.dispatchable_jobs(after, self.settings.page_size)?;
            if page.is_empty() {
                break;
            }
            let full_page = page.len() == self.settings.page_size;
            after = page.last().map(|j| (j.date_created, j.id));

            let mut state = PassState {
                hosts: self.directory.host_map()?,
                services: self.directory.service_registrations()?,
                loads: self.directory.current_host_loads()?,
                undispatchable,
                degraded,
            };
            for job in page {
                let id = job.id;
                match self.dispatch_job(job, &mut state).await {
                    Ok(Outcome::Dispatched(id)) => report.dispatched.push(id),
                    Ok(Outcome::NoCapacity) => report.no_capacity += 1,
                    Ok(Outcome::Lost) => report.lost += 1,
                    Ok(Outcome::Declined) => report.declined += 1,
                    Ok(Outcome::Skipped) => report.skipped += 1,
                    Err(e) => warn!("error dispatching job {}: {}", id, e),
                }
            }
            undispatchable = state.undispatchable;
            degraded = state.degraded;

            if !full_page {
                break;
            }
        }

        if report.dispatched.is_empty() {
            debug!("dispatch pass finished: {:?}", report);
        } else {
            info!(
                "dispatched {} jobs ({} without capacity, {} declined, {} lost)",
                report.dispatched.len(),
                report.no_capacity,
                report.declined,
                report.lost
            );
        }
        Ok(report)
    }

    async fn dispatch_job(&self, job: Job, state: &mut PassState) -> Result<Outcome> {
        let key = job.dispatch_key();
        if state.undispatchable.contains(&key) {
            trace!("skipping {}: no service available for {}", job, key);
            return Ok(Outcome::Skipped);
        }

        let mode = self.capacity_mode(&job)?;
        let candidates: Vec<ServiceRegistration> =
            rank_services(&job.job_type, &state.services, &state.hosts, &state.loads, mode)
                .into_iter()
                .map(|s| s.registration)
                .filter(|s| !state.degraded.contains(&s.id))
                .collect();
        if candidates.is_empty() {
            debug!("no service of type {} is able to accept {}", job.job_type, job);
            // workflow jobs never mark their operation undispatchable
            if job.job_type != TYPE_WORKFLOW {
                state.undispatchable.insert(key);
            }
            return Ok(Outcome::NoCapacity);
        }

        let mut job = job;
        for service in candidates {
            job.processor_service = Some(service.id);
            job = match self.jobs.update_job(&job) {
                Ok(claimed) => claimed,
                Err(e) if e.is_conflict() => {
                    debug!("{} was changed while dispatching it, leaving it alone", job);
                    return Ok(Outcome::Lost);
                }
                Err(e) => return Err(e),
            };

            trace!("offering {} to {}", job, service);
            let response = tokio::time::timeout(self.settings.timeout, self.client.dispatch(&service, &job)).await;
            match response {
                Ok(Ok(DispatchResponse::Accepted)) => {
                    let job = self.confirm_running(job, service.id)?;
                    if job.status == JobStatus::Cancelled || job.processor_service != Some(service.id) {
                        debug!("{} was taken away from {} while dispatching it", job, service);
                        return Ok(Outcome::Lost);
                    }
                    if job.status == JobStatus::Running {
                        state.loads.increment(&service.host);
                    }
                    debug!("{} dispatched to {}", job, service);
                    return Ok(Outcome::Dispatched(job.id));
                }
                Ok(Ok(response)) if response.is_failure() => {
                    warn!("{} did not take {}: {:?}", service, job, response);
                    self.degrade(&service, &job, state);
                }
                Ok(Ok(response)) => {
                    debug!("{} declined {}: {:?}", service, job, response);
                }
                Ok(Err(e)) => {
                    warn!("unable to dispatch {} to {}: {}", job, service, e);
                    self.degrade(&service, &job, state);
                }
                Err(_) => {
                    warn!(
                        "dispatching {} to {} timed out after {} ms",
                        job,
                        service,
                        self.settings.timeout.as_millis()
                    );
                    self.degrade(&service, &job, state);
                }
            }
        }

        self.release_claim(job)?;
        Ok(Outcome::Declined)
    }

    /// Moves an accepted job to RUNNING unless the worker or a cancellation already moved it on.
    fn confirm_running(&self, mut job: Job, service: ServiceId) -> Result<Job> {
        let mut attempt = 1;
        loop {
            if job.status != JobStatus::Queued || job.processor_service != Some(service) {
                debug!("{} already moved on to {}", job, job.status);
                return Ok(job);
            }
            job.status = JobStatus::Running;
            match self.jobs.update_job(&job) {
                Err(e) if e.is_conflict() && attempt < MAX_UPDATE_ATTEMPTS => {
                    attempt += 1;
                    job = self.jobs.get_job(job.id)?;
                }
                result => return result,
            }
        }
    }

    fn release_claim(&self, job: Job) -> Result<()> {
        let id = job.id;
        let mut job = Some(job);
        let result = retry_on_conflict("job", || {
            let mut current = match job.take() {
                Some(job) => job,
                None => self.jobs.get_job(id)?,
            };
            if !current.is_claimed() {
                return Ok(());
            }
            current.processor_service = None;
            self.jobs.update_job(&current).map(|_| ())
        });
        if result.is_ok() {
            debug!("job {} stays queued, no service accepted it", id);
        }
        result
    }

    fn degrade(&self, service: &ServiceRegistration, job: &Job, state: &mut PassState) {
        state.degraded.insert(service.id);
        if let Err(e) = self.health.record_failure(service.id, job.signature()) {
            warn!("unable to update health of {}: {}", service, e);
        }
    }

    fn capacity_mode(&self, job: &Job) -> Result<CapacityMode> {
        if !self.settings.child_jobs_bypass_capacity || job.job_type == TYPE_WORKFLOW {
            return Ok(CapacityMode::Respect);
        }
        let parent = match job.parent_job {
            Some(parent) => parent,
            None => return Ok(CapacityMode::Respect),
        };
        let running_siblings = self
            .jobs
            .count(&JobFilter::new().parent(parent).status(JobStatus::Running))?;
        if running_siblings == 0 {
            trace!("{} may ignore host capacity, its parent has no running children", job);
            Ok(CapacityMode::Ignore)
        } else {
            Ok(CapacityMode::Respect)
        }
    }
}
