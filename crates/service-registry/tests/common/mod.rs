#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use service_registry::core::clock::ManualClock;
use service_registry::core::common::JobId;
use service_registry::core::config::RegistryConfig;
use service_registry::core::job::{Job, JobRequest, JobStatus};
use service_registry::core::store::MemoryStore;
use service_registry::core::service::ServiceRegistration;
use service_registry::dispatch::{DispatchClient, DispatchError, DispatchResponse};
use service_registry::ServiceRegistry;

pub const COMPOSER: &str = "org.opencastproject.composer";
pub const INSPECTOR: &str = "org.opencastproject.inspection";

pub fn name_wrapper(file_name: &str) -> String {
    format!("test-configs/{}", file_name)
}

pub fn init_logger() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn start_time() -> DateTime<Utc> {
    DateTime::parse_from_rfc3339("2024-01-01T00:00:00Z")
        .unwrap()
        .with_timezone(&Utc)
}

/// How a scripted worker answers dispatch requests.
#[derive(Clone, Debug)]
pub enum Script {
    Respond(DispatchResponse),
    TransportError,
    Hang,
}

type DispatchHook = Box<dyn Fn(&Job) + Send + Sync>;

/// Dispatch client answering from a per-host script. Unscripted hosts accept every job.
///
/// Every answer is preceded by a yield, so that concurrent dispatch passes interleave.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, Script>>,
    hook: Mutex<Option<DispatchHook>>,
    alive: Mutex<HashMap<String, bool>>,
    dispatched: Mutex<Vec<(JobId, String)>>,
    offered: Mutex<Vec<(JobId, String)>>,
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn script(&self, host: &str, script: Script) {
        self.scripts.lock().unwrap().insert(host.to_string(), script);
    }

    /// Runs `hook` while a job is being offered, before the worker answers.
    pub fn on_dispatch(&self, hook: impl Fn(&Job) + Send + Sync + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }

    pub fn set_alive(&self, host: &str, alive: bool) {
        self.alive.lock().unwrap().insert(host.to_string(), alive);
    }

    /// Jobs accepted so far with the host which accepted them.
    pub fn dispatched(&self) -> Vec<(JobId, String)> {
        self.dispatched.lock().unwrap().clone()
    }

    /// Every offer made so far, accepted or not.
    pub fn offered(&self) -> Vec<(JobId, String)> {
        self.offered.lock().unwrap().clone()
    }
}

#[async_trait]
impl DispatchClient for ScriptedClient {
    async fn dispatch(&self, service: &ServiceRegistration, job: &Job) -> Result<DispatchResponse, DispatchError> {
        tokio::task::yield_now().await;
        self.offered.lock().unwrap().push((job.id, service.host.clone()));
        if let Some(hook) = self.hook.lock().unwrap().as_ref() {
            hook(job);
        }
        let script = self
            .scripts
            .lock()
            .unwrap()
            .get(&service.host)
            .cloned()
            .unwrap_or(Script::Respond(DispatchResponse::Accepted));
        match script {
            Script::Respond(response) => {
                if response == DispatchResponse::Accepted {
                    self.dispatched.lock().unwrap().push((job.id, service.host.clone()));
                }
                Ok(response)
            }
            Script::TransportError => Err(DispatchError::Transport {
                url: service.host.clone(),
                reason: "connection refused".to_string(),
            }),
            Script::Hang => {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(DispatchResponse::Accepted)
            }
        }
    }

    async fn probe(&self, service: &ServiceRegistration) -> Result<bool, DispatchError> {
        let alive = self.alive.lock().unwrap().get(&service.host).copied().unwrap_or(true);
        if alive {
            Ok(true)
        } else {
            Err(DispatchError::Transport {
                url: service.host.clone(),
                reason: "connection refused".to_string(),
            })
        }
    }
}

pub struct TestRegistry {
    pub store: Arc<MemoryStore>,
    pub clock: Arc<ManualClock>,
    pub client: Arc<ScriptedClient>,
    pub registry: ServiceRegistry,
}

impl TestRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self::with_store(config, Arc::new(MemoryStore::new()))
    }

    pub fn from_config_file(file_name: &str) -> Self {
        Self::new(RegistryConfig::from_file(&name_wrapper(file_name)).unwrap())
    }

    pub fn with_store(config: RegistryConfig, store: Arc<MemoryStore>) -> Self {
        init_logger();
        let clock = Arc::new(ManualClock::new(start_time()));
        let client = Arc::new(ScriptedClient::new());
        let registry = ServiceRegistry::with_clock(config, store.clone(), client.clone(), clock.clone());
        Self {
            store,
            clock,
            client,
            registry,
        }
    }

    /// Registers a host running a composer service.
    pub fn add_host(&self, base_url: &str, max_jobs: u32) -> ServiceRegistration {
        let directory = self.registry.directory();
        directory
            .register_host(base_url, "10.0.0.1", base_url, 8 << 30, 4, max_jobs)
            .unwrap();
        directory.register_service(COMPOSER, base_url, "/composer", true).unwrap()
    }

    /// Creates and queues a composer job on behalf of the composer service of `creator_host`.
    pub fn queue_job(&self, creator_host: &str, operation: &str) -> Job {
        self.queue_request(JobRequest::new(COMPOSER, creator_host, operation))
    }

    pub fn queue_request(&self, request: JobRequest) -> Job {
        let jobs = self.registry.jobs();
        let job = jobs.create_job(request).unwrap();
        jobs.queue_job(job.id).unwrap()
    }

    pub fn job(&self, id: JobId) -> Job {
        self.registry.jobs().get_job(id).unwrap()
    }

    /// Moves a job through its lifecycle the way a worker does.
    pub fn complete(&self, id: JobId, status: JobStatus) -> Job {
        let mut job = self.job(id);
        job.status = status;
        self.registry.jobs().update_job(&job).unwrap()
    }
}
