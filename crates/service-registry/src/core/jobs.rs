//! Job lifecycle: creation, status updates, cancellation, queries and removal.

use std::collections::{BTreeSet, VecDeque};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use log::{debug, info, warn};

use crate::core::clock::Clock;
use crate::core::common::{retry_on_conflict, JobId, RESUME, START_OPERATION, START_WORKFLOW};
use crate::core::error::{RegistryError, Result};
use crate::core::health::HealthTracker;
use crate::core::job::{FailureReason, Job, JobRequest, JobStatus};
use crate::core::store::{JobFilter, RegistryStore};

/// Operations of workflow bookkeeping jobs kept by [`JobManager::remove_parentless_jobs`].
const KEPT_OPERATIONS: [&str; 3] = [START_OPERATION, START_WORKFLOW, RESUME];

/// Creates jobs and guards their state machine.
///
/// Every update is checked against the stored version of the job, so a caller holding a stale copy gets a conflict
/// and has to reload the job before trying again.
pub struct JobManager {
    store: Arc<dyn RegistryStore>,
    clock: Arc<dyn Clock>,
    health: Arc<HealthTracker>,
}

impl JobManager {
    pub fn new(store: Arc<dyn RegistryStore>, clock: Arc<dyn Clock>, health: Arc<HealthTracker>) -> Self {
        Self { store, clock, health }
    }

    /// Creates a new job in INSTANTIATED status on behalf of the service of the given type running on the host.
    ///
    /// Non-dispatchable jobs are processed by their creator, so the creator is recorded as processor right away.
    pub fn create_job(&self, request: JobRequest) -> Result<Job> {
        if request.operation.is_empty() {
            return Err(RegistryError::InvalidArgument("job operation must not be empty".to_string()));
        }
        let creator = self
            .store
            .find_service(&request.service_type, &request.host)?
            .ok_or_else(|| {
                RegistryError::not_found(
                    "service registration",
                    format!("{}@{}", request.service_type, request.host),
                )
            })?;
        let (parent_job, root_job) = match request.parent {
            Some(parent_id) => {
                let parent = self.store.job(parent_id)?;
                (Some(parent.id), Some(parent.root_job.unwrap_or(parent.id)))
            }
            None => (None, None),
        };

        let now = self.clock.now();
        let (processor_service, processing_host) = if request.dispatchable {
            (None, None)
        } else {
            (Some(creator.id), Some(creator.host.clone()))
        };
        let job = Job {
            id: 0,
            version: 0,
            status: JobStatus::Instantiated,
            job_type: creator.service_type,
            operation: request.operation,
            arguments: request.arguments,
            payload: request.payload,
            dispatchable: request.dispatchable,
            creator_service: creator.id,
            created_host: creator.host,
            processor_service,
            processing_host,
            parent_job,
            root_job,
            date_created: now,
            date_started: None,
            date_completed: None,
            date_modified: now,
            queue_time: None,
            run_time: None,
            failure_reason: FailureReason::None,
            properties: request.properties,
        };
        let job = self.store.insert_job(job)?;
        debug!("created {}", job);
        Ok(job)
    }

    /// Moves an instantiated job to the queue. Queueing an already queued job does nothing.
    ///
    /// Running jobs are requeued through [`JobManager::update_job`] instead.
    pub fn queue_job(&self, id: JobId) -> Result<Job> {
        retry_on_conflict("job", || {
            let mut job = self.store.job(id)?;
            match job.status {
                JobStatus::Queued => return Ok(job),
                JobStatus::Instantiated => {}
                status => {
                    return Err(RegistryError::IllegalTransition {
                        id,
                        from: status,
                        to: JobStatus::Queued,
                    })
                }
            }
            job.status = JobStatus::Queued;
            self.update_job(&job)
        })
    }

    /// Persists the mutable fields of the job.
    ///
    /// Identity, creator and tree fields are taken from the stored job. Start and completion times are stamped once,
    /// when the job starts running and when a running job reaches a terminal status. The processing host always
    /// follows the processor registration. Fails with a conflict if the job version is stale.
    pub fn update_job(&self, job: &Job) -> Result<Job> {
        let stored = self.store.job(job.id)?;
        if stored.version != job.version {
            return Err(RegistryError::Conflict {
                entity: "job",
                key: job.id.to_string(),
                expected: job.version,
                actual: stored.version,
            });
        }
        if !stored.status.can_transition_to(job.status) {
            return Err(RegistryError::IllegalTransition {
                id: job.id,
                from: stored.status,
                to: job.status,
            });
        }

        let now = self.clock.now();
        let mut updated = job.clone();
        updated.job_type = stored.job_type.clone();
        updated.creator_service = stored.creator_service;
        updated.created_host = stored.created_host.clone();
        updated.parent_job = stored.parent_job;
        updated.root_job = stored.root_job;
        updated.date_created = stored.date_created;
        updated.date_started = stored.date_started;
        updated.date_completed = stored.date_completed;
        updated.queue_time = stored.queue_time;
        updated.run_time = stored.run_time;
        updated.date_modified = now;

        if stored.status == JobStatus::Running && updated.status == JobStatus::Queued && updated.dispatchable {
            debug!("{} requeued by {:?}", stored, stored.processing_host);
            updated.processor_service = None;
        }
        updated.processing_host = match updated.processor_service {
            Some(service) => Some(self.store.service(service)?.host),
            None => None,
        };

        if updated.status == JobStatus::Running && updated.date_started.is_none() {
            updated.date_started = Some(now);
            updated.queue_time = Some(millis_between(updated.date_created, now));
        }
        if updated.status.is_terminal() && updated.date_completed.is_none() {
            if let Some(started) = updated.date_started {
                updated.date_completed = Some(now);
                updated.run_time = Some(millis_between(started, now));
            }
        }

        let saved = self.store.update_job(&updated)?;
        if saved.status != stored.status {
            debug!("{} changed status from {} to {}", saved, stored.status, saved.status);
            if matches!(saved.status, JobStatus::Finished | JobStatus::Failed) {
                if let Err(e) = self.health.on_job_completed(&saved) {
                    warn!("unable to update service health after {}: {}", saved, e);
                }
            }
        }
        Ok(saved)
    }

    /// Cancels the job and all its unfinished descendants.
    ///
    /// A job which reached a terminal status in the meantime is left untouched.
    pub fn cancel_job(&self, id: JobId) -> Result<Job> {
        let job = retry_on_conflict("job", || {
            let mut job = self.store.job(id)?;
            if job.status.is_terminal() {
                debug!("{} is already {}, not cancelling it", job, job.status);
                return Ok(job);
            }
            job.status = JobStatus::Cancelled;
            self.update_job(&job)
        })?;
        for child in self.store.child_jobs(id)? {
            if !child.status.is_terminal() {
                self.cancel_job(child.id)?;
            }
        }
        if job.status == JobStatus::Cancelled {
            info!("cancelled {}", job);
        }
        Ok(job)
    }

    pub fn get_job(&self, id: JobId) -> Result<Job> {
        self.store.job(id)
    }

    /// Returns all descendants of the job, breadth first.
    pub fn get_child_jobs(&self, id: JobId) -> Result<Vec<Job>> {
        let mut descendants = Vec::new();
        let mut pending = VecDeque::from([id]);
        while let Some(parent) = pending.pop_front() {
            for child in self.store.child_jobs(parent)? {
                pending.push_back(child.id);
                descendants.push(child);
            }
        }
        Ok(descendants)
    }

    pub fn get_jobs(&self, service_type: Option<&str>, status: Option<JobStatus>) -> Result<Vec<Job>> {
        let mut filter = JobFilter::new();
        if let Some(service_type) = service_type {
            filter = filter.service_type(service_type);
        }
        if let Some(status) = status {
            filter = filter.status(status);
        }
        self.store.jobs(&filter)
    }

    /// Returns jobs which did not reach a terminal status yet.
    pub fn get_active_jobs(&self) -> Result<Vec<Job>> {
        let filter = JobFilter::new()
            .status(JobStatus::Instantiated)
            .status(JobStatus::Queued)
            .status(JobStatus::Running);
        self.store.jobs(&filter)
    }

    /// Returns payloads of the jobs with the given operation ordered by job id.
    pub fn get_job_payloads(&self, operation: &str, limit: usize, offset: usize) -> Result<Vec<String>> {
        Ok(self
            .store
            .jobs(&JobFilter::new().operation(operation))?
            .into_iter()
            .filter_map(|j| j.payload)
            .skip(offset)
            .take(limit)
            .collect())
    }

    /// Returns queued jobs waiting for a dispatcher.
    pub fn dispatchable_jobs(&self, after: Option<(DateTime<Utc>, JobId)>, limit: usize) -> Result<Vec<Job>> {
        self.store.dispatchable_jobs(after, limit)
    }

    pub fn count(&self, filter: &JobFilter) -> Result<usize> {
        self.store.count_jobs(filter)
    }

    pub fn count_by_host(&self, service_type: &str, host: &str, status: JobStatus) -> Result<usize> {
        self.count(&JobFilter::new().service_type(service_type).host(host).status(status))
    }

    pub fn count_by_operation(&self, service_type: &str, operation: &str, status: JobStatus) -> Result<usize> {
        self.count(&JobFilter::new().service_type(service_type).operation(operation).status(status))
    }

    /// Removes the jobs together with all their descendants.
    ///
    /// Fails without removing anything if one of the ids is unknown.
    pub fn remove_jobs(&self, ids: &[JobId]) -> Result<()> {
        for &id in ids {
            if id < 1 {
                return Err(RegistryError::not_found("job", id));
            }
            self.store.job(id)?;
        }
        let mut removed = BTreeSet::new();
        for &id in ids {
            if removed.contains(&id) {
                continue;
            }
            let mut doomed = vec![id];
            doomed.extend(self.get_child_jobs(id)?.into_iter().map(|j| j.id));
            for job_id in doomed.into_iter().rev() {
                if removed.insert(job_id) {
                    self.store.remove_job(job_id)?;
                }
            }
        }
        info!("removed {} jobs", removed.len());
        Ok(())
    }

    /// Removes finished root jobs created more than `lifetime_days` ago, except workflow bookkeeping jobs.
    ///
    /// Returns the number of removed root jobs.
    pub fn remove_parentless_jobs(&self, lifetime_days: u32) -> Result<usize> {
        let cutoff = self.clock.now() - Duration::days(lifetime_days as i64);
        let filter = JobFilter::new()
            .parentless()
            .created_before(cutoff)
            .status(JobStatus::Finished)
            .status(JobStatus::Failed)
            .status(JobStatus::Cancelled);
        let ids: Vec<JobId> = self
            .store
            .jobs(&filter)?
            .into_iter()
            .filter(|j| !KEPT_OPERATIONS.contains(&j.operation.as_str()))
            .map(|j| j.id)
            .collect();
        if ids.is_empty() {
            debug!("no parentless jobs older than {} days", lifetime_days);
            return Ok(0);
        }
        self.remove_jobs(&ids)?;
        info!("removed {} parentless jobs older than {} days", ids.len(), lifetime_days);
        Ok(ids.len())
    }
}

fn millis_between(from: DateTime<Utc>, to: DateTime<Utc>) -> i64 {
    (to - from).num_milliseconds().max(0)
}
