//! Persistence of hosts, service registrations and jobs.
//!
//! Every mutation is checked against the version of the stored entity. A stale version is reported as
//! [`RegistryError::Conflict`](crate::core::error::RegistryError::Conflict), which is how concurrent registry nodes
//! sharing a store avoid assigning the same job twice.

pub mod memory;

use chrono::{DateTime, Utc};

use crate::core::common::{JobId, ServiceId};
use crate::core::error::Result;
use crate::core::host::HostRegistration;
use crate::core::job::{Job, JobStatus};
use crate::core::load::SystemLoad;
use crate::core::service::ServiceRegistration;

pub use memory::MemoryStore;

/// Selects jobs by their attributes. Unset criteria match everything.
#[derive(Clone, Debug, Default)]
pub struct JobFilter {
    pub service_type: Option<String>,
    /// Processing host.
    pub host: Option<String>,
    pub operation: Option<String>,
    /// Matches any of the listed statuses.
    pub statuses: Vec<JobStatus>,
    pub processor: Option<ServiceId>,
    pub parent: Option<JobId>,
    pub parentless: bool,
    pub created_before: Option<DateTime<Utc>>,
}

impl JobFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn service_type(mut self, service_type: &str) -> Self {
        self.service_type = Some(service_type.to_string());
        self
    }

    pub fn host(mut self, host: &str) -> Self {
        self.host = Some(host.to_string());
        self
    }

    pub fn operation(mut self, operation: &str) -> Self {
        self.operation = Some(operation.to_string());
        self
    }

    pub fn status(mut self, status: JobStatus) -> Self {
        self.statuses.push(status);
        self
    }

    pub fn processor(mut self, processor: ServiceId) -> Self {
        self.processor = Some(processor);
        self
    }

    pub fn parent(mut self, parent: JobId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn parentless(mut self) -> Self {
        self.parentless = true;
        self
    }

    pub fn created_before(mut self, time: DateTime<Utc>) -> Self {
        self.created_before = Some(time);
        self
    }

    pub fn matches(&self, job: &Job) -> bool {
        self.service_type.as_ref().map_or(true, |t| &job.job_type == t)
            && self.host.as_ref().map_or(true, |h| job.processing_host.as_ref() == Some(h))
            && self.operation.as_ref().map_or(true, |o| &job.operation == o)
            && (self.statuses.is_empty() || self.statuses.contains(&job.status))
            && self.processor.map_or(true, |p| job.processor_service == Some(p))
            && self.parent.map_or(true, |p| job.parent_job == Some(p))
            && (!self.parentless || job.parent_job.is_none())
            && self.created_before.map_or(true, |t| job.date_created < t)
    }
}

/// Storage of registry tables.
///
/// Implementations assign ids and versions: inserted entities get version 1 and every successful update increments
/// the version by one. Updates carrying a version different from the stored one fail with a conflict.
pub trait RegistryStore: Send + Sync {
    fn host(&self, base_url: &str) -> Result<HostRegistration>;
    fn hosts(&self) -> Result<Vec<HostRegistration>>;
    /// Fails with a conflict if a host with the same base URL exists.
    fn insert_host(&self, host: HostRegistration) -> Result<HostRegistration>;
    fn update_host(&self, host: &HostRegistration) -> Result<HostRegistration>;

    fn service(&self, id: ServiceId) -> Result<ServiceRegistration>;
    fn find_service(&self, service_type: &str, host: &str) -> Result<Option<ServiceRegistration>>;
    fn services(&self) -> Result<Vec<ServiceRegistration>>;
    /// Fails with a conflict if the host already has a registration of the same type.
    fn insert_service(&self, service: ServiceRegistration) -> Result<ServiceRegistration>;
    fn update_service(&self, service: &ServiceRegistration) -> Result<ServiceRegistration>;

    fn job(&self, id: JobId) -> Result<Job>;
    fn insert_job(&self, job: Job) -> Result<Job>;
    fn update_job(&self, job: &Job) -> Result<Job>;
    fn remove_job(&self, id: JobId) -> Result<()>;
    /// Returns matching jobs ordered by id.
    fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>>;
    /// Returns direct children of the job ordered by id.
    fn child_jobs(&self, parent: JobId) -> Result<Vec<Job>>;
    /// Returns queued, dispatchable and not yet claimed jobs ordered by creation time and id, starting after the
    /// given (creation time, id) position.
    fn dispatchable_jobs(&self, after: Option<(DateTime<Utc>, JobId)>, limit: usize) -> Result<Vec<Job>>;
    /// Returns the number of queued or running jobs processed on every known host.
    fn host_loads(&self) -> Result<SystemLoad>;

    fn services_by_type(&self, service_type: &str) -> Result<Vec<ServiceRegistration>> {
        Ok(self
            .services()?
            .into_iter()
            .filter(|s| s.service_type == service_type)
            .collect())
    }

    fn services_by_host(&self, host: &str) -> Result<Vec<ServiceRegistration>> {
        Ok(self.services()?.into_iter().filter(|s| s.host == host).collect())
    }

    fn count_jobs(&self, filter: &JobFilter) -> Result<usize> {
        Ok(self.jobs(filter)?.len())
    }
}
