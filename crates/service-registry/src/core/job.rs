//! Job model and its state machine.

use std::collections::hash_map::DefaultHasher;
use std::collections::BTreeMap;
use std::fmt::{Display, Formatter};
use std::hash::{Hash, Hasher};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::common::{JobId, ServiceId};

#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum JobStatus {
    Instantiated,
    Queued,
    Running,
    Finished,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub const ALL: [JobStatus; 6] = [
        JobStatus::Instantiated,
        JobStatus::Queued,
        JobStatus::Running,
        JobStatus::Finished,
        JobStatus::Failed,
        JobStatus::Cancelled,
    ];

    pub fn is_terminal(&self) -> bool {
        matches!(self, JobStatus::Finished | JobStatus::Failed | JobStatus::Cancelled)
    }

    /// Returns whether jobs in this status count towards the load of the processing host.
    pub fn is_active(&self) -> bool {
        matches!(self, JobStatus::Queued | JobStatus::Running)
    }

    /// Returns whether a job may move from this status to `to`.
    ///
    /// Keeping the status is allowed for non-terminal jobs (e.g. to update the payload).
    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        use JobStatus::*;
        match (*self, to) {
            (from, to) if from == to => !from.is_terminal(),
            (Instantiated, Queued) => true,
            (Queued, Running) => true,
            (Running, Finished) | (Running, Failed) | (Running, Queued) => true,
            (Instantiated, Cancelled) | (Queued, Cancelled) | (Running, Cancelled) => true,
            _ => false,
        }
    }
}

impl Display for JobStatus {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        match self {
            JobStatus::Instantiated => write!(f, "INSTANTIATED"),
            JobStatus::Queued => write!(f, "QUEUED"),
            JobStatus::Running => write!(f, "RUNNING"),
            JobStatus::Finished => write!(f, "FINISHED"),
            JobStatus::Failed => write!(f, "FAILED"),
            JobStatus::Cancelled => write!(f, "CANCELLED"),
        }
    }
}

/// Why a job failed.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FailureReason {
    None,
    /// Bad input. Never counted against the processing service.
    Data,
    Processing,
    /// The processing service or host disappeared while the job was running.
    Orphaned,
    /// The job was running for longer than the configured threshold.
    Stale,
}

impl Default for FailureReason {
    fn default() -> Self {
        FailureReason::None
    }
}

/// Represents a unit of work processed by a service.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub version: u64,
    pub status: JobStatus,
    /// Service type of the creator registration, also the type of services able to process the job.
    pub job_type: String,
    pub operation: String,
    pub arguments: Vec<String>,
    pub payload: Option<String>,
    pub dispatchable: bool,
    pub creator_service: ServiceId,
    pub created_host: String,
    pub processor_service: Option<ServiceId>,
    pub processing_host: Option<String>,
    pub parent_job: Option<JobId>,
    pub root_job: Option<JobId>,
    pub date_created: DateTime<Utc>,
    pub date_started: Option<DateTime<Utc>>,
    pub date_completed: Option<DateTime<Utc>>,
    pub date_modified: DateTime<Utc>,
    /// Milliseconds between creation and start.
    pub queue_time: Option<i64>,
    /// Milliseconds between start and completion.
    pub run_time: Option<i64>,
    pub failure_reason: FailureReason,
    pub properties: BTreeMap<String, String>,
}

impl Job {
    /// Returns a stable hash of the job type, operation and arguments.
    ///
    /// Two jobs with the same signature are considered to be the same work.
    pub fn signature(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.job_type.hash(&mut hasher);
        self.operation.hash(&mut hasher);
        self.arguments.hash(&mut hasher);
        hasher.finish()
    }

    /// Key used to skip jobs of the same kind once no service could take one of them.
    pub fn dispatch_key(&self) -> String {
        format!("{}@{}", self.job_type, self.operation)
    }

    /// Returns whether a dispatcher has picked a processor for this queued job.
    pub fn is_claimed(&self) -> bool {
        self.status == JobStatus::Queued && self.processor_service.is_some()
    }

    /// Fails the job for the given reason.
    pub fn fail(&mut self, reason: FailureReason) {
        self.status = JobStatus::Failed;
        self.failure_reason = reason;
    }
}

impl Display for Job {
    fn fmt(&self, f: &mut Formatter) -> std::fmt::Result {
        write!(f, "job {} ({}:{})", self.id, self.job_type, self.operation)
    }
}

/// Describes a job to be created.
#[derive(Clone, Debug)]
pub struct JobRequest {
    pub service_type: String,
    pub host: String,
    pub operation: String,
    pub arguments: Vec<String>,
    pub payload: Option<String>,
    pub dispatchable: bool,
    pub parent: Option<JobId>,
    pub properties: BTreeMap<String, String>,
}

impl JobRequest {
    /// Creates a request for a dispatchable job without arguments.
    pub fn new(service_type: &str, host: &str, operation: &str) -> Self {
        Self {
            service_type: service_type.to_string(),
            host: host.to_string(),
            operation: operation.to_string(),
            arguments: Vec::new(),
            payload: None,
            dispatchable: true,
            parent: None,
            properties: BTreeMap::new(),
        }
    }

    pub fn arguments<S: ToString>(mut self, arguments: &[S]) -> Self {
        self.arguments = arguments.iter().map(|a| a.to_string()).collect();
        self
    }

    pub fn payload(mut self, payload: &str) -> Self {
        self.payload = Some(payload.to_string());
        self
    }

    pub fn dispatchable(mut self, dispatchable: bool) -> Self {
        self.dispatchable = dispatchable;
        self
    }

    pub fn parent(mut self, parent: JobId) -> Self {
        self.parent = Some(parent);
        self
    }

    pub fn property(mut self, key: &str, value: &str) -> Self {
        self.properties.insert(key.to_string(), value.to_string());
        self
    }
}
