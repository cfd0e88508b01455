//! HTTP transport to worker services.

use std::time::Duration;

use async_trait::async_trait;
use log::trace;
use reqwest::{Client, StatusCode};

use crate::core::common::{concat_url, DISPATCH_ENDPOINT};
use crate::core::job::Job;
use crate::core::service::ServiceRegistration;
use crate::dispatch::client::{DispatchClient, DispatchError, DispatchResponse};

/// Posts jobs to `{host}{path}/dispatch` as `id` and `operation` form fields and probes the same endpoint with HEAD.
pub struct HttpDispatchClient {
    client: Client,
    timeout: Duration,
}

impl HttpDispatchClient {
    pub fn new(timeout: Duration) -> Result<Self, DispatchError> {
        let client = Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DispatchError::Transport {
                url: String::new(),
                reason: e.to_string(),
            })?;
        Ok(Self { client, timeout })
    }

    fn endpoint(service: &ServiceRegistration) -> String {
        concat_url(&concat_url(&service.host, &service.path), DISPATCH_ENDPOINT)
    }

    fn transport_error(&self, url: &str, e: reqwest::Error) -> DispatchError {
        if e.is_timeout() {
            DispatchError::Timeout {
                url: url.to_string(),
                timeout_ms: self.timeout.as_millis(),
            }
        } else {
            DispatchError::Transport {
                url: url.to_string(),
                reason: e.to_string(),
            }
        }
    }
}

#[async_trait]
impl DispatchClient for HttpDispatchClient {
    async fn dispatch(&self, service: &ServiceRegistration, job: &Job) -> Result<DispatchResponse, DispatchError> {
        let url = Self::endpoint(service);
        let id = job.id.to_string();
        let params = [("id", id.as_str()), ("operation", job.operation.as_str())];
        trace!("posting {} to {}", job, url);
        let response = self
            .client
            .post(&url)
            .form(&params)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;
        let status = response.status().as_u16();
        let body = response.text().await.unwrap_or_default();
        Ok(DispatchResponse::from_status(status, body))
    }

    async fn probe(&self, service: &ServiceRegistration) -> Result<bool, DispatchError> {
        let url = Self::endpoint(service);
        let response = self
            .client
            .head(&url)
            .send()
            .await
            .map_err(|e| self.transport_error(&url, e))?;
        Ok(response.status() == StatusCode::OK)
    }
}
