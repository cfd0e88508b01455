//! Interface of the job handoff to worker services.

use async_trait::async_trait;
use thiserror::Error;

use crate::core::job::Job;
use crate::core::service::ServiceRegistration;

/// Answer of a worker service to a dispatched job.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum DispatchResponse {
    /// The service took the job.
    Accepted,
    /// The service refuses jobs at the moment, e.g. because it is busy.
    Refused,
    /// The service is not ready to accept jobs yet.
    NotReachable,
    /// The service rejected this particular job.
    Rejected(String),
    /// Any other answer, carrying the HTTP status.
    Unexpected(u16),
}

impl DispatchResponse {
    pub fn from_status(status: u16, body: String) -> Self {
        match status {
            204 => DispatchResponse::Accepted,
            503 => DispatchResponse::Refused,
            405 => DispatchResponse::NotReachable,
            412 => DispatchResponse::Rejected(body),
            status => DispatchResponse::Unexpected(status),
        }
    }

    /// Returns whether the answer indicates a problem of the service rather than a temporary refusal.
    pub fn is_failure(&self) -> bool {
        matches!(self, DispatchResponse::Rejected(_) | DispatchResponse::Unexpected(_))
    }
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("unable to reach {url}: {reason}")]
    Transport { url: String, reason: String },
    #[error("no answer from {url} within {timeout_ms} ms")]
    Timeout { url: String, timeout_ms: u128 },
}

/// Transport used to talk to worker services.
#[async_trait]
pub trait DispatchClient: Send + Sync {
    /// Offers the job to the service.
    async fn dispatch(&self, service: &ServiceRegistration, job: &Job) -> Result<DispatchResponse, DispatchError>;

    /// Checks whether the service is alive.
    async fn probe(&self, service: &ServiceRegistration) -> Result<bool, DispatchError>;
}
