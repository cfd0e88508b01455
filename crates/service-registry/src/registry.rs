//! Registry node: wires the components together and runs the background loops.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use log::{debug, info, warn};
use sugars::arc;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use crate::core::cleanup::{OrphanSweeper, SweepSettings};
use crate::core::clock::{Clock, SystemClock};
use crate::core::config::{period, RegistryConfig};
use crate::core::directory::Directory;
use crate::core::error::Result;
use crate::core::health::HealthTracker;
use crate::core::jobs::JobManager;
use crate::core::statistics::StatisticsReporter;
use crate::core::store::RegistryStore;
use crate::dispatch::client::DispatchClient;
use crate::dispatch::dispatcher::{DispatchSettings, Dispatcher};
use crate::dispatch::heartbeat::JobProducerHeartbeat;

pub struct ServiceRegistry {
    config: Arc<RegistryConfig>,
    directory: Arc<Directory>,
    health: Arc<HealthTracker>,
    jobs: Arc<JobManager>,
    dispatcher: Arc<Dispatcher>,
    heartbeat: Arc<JobProducerHeartbeat>,
    sweeper: Arc<OrphanSweeper>,
    statistics: Arc<StatisticsReporter>,
}

impl ServiceRegistry {
    pub fn new(config: RegistryConfig, store: Arc<dyn RegistryStore>, client: Arc<dyn DispatchClient>) -> Self {
        Self::with_clock(config, store, client, arc!(SystemClock))
    }

    pub fn with_clock(
        config: RegistryConfig,
        store: Arc<dyn RegistryStore>,
        client: Arc<dyn DispatchClient>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let directory = arc!(Directory::new(store.clone(), clock.clone()));
        let health = arc!(HealthTracker::new(store.clone(), clock.clone(), config.health.clone()));
        let jobs = arc!(JobManager::new(store.clone(), clock.clone(), health.clone()));
        let dispatch_timeout = Duration::from_secs_f64(config.dispatch_timeout.max(0.));
        let dispatcher = arc!(Dispatcher::new(
            directory.clone(),
            jobs.clone(),
            health.clone(),
            client.clone(),
            DispatchSettings {
                timeout: dispatch_timeout,
                page_size: config.dispatch_page_size,
                child_jobs_bypass_capacity: config.child_jobs_bypass_capacity,
            },
        ));
        let heartbeat = arc!(JobProducerHeartbeat::new(directory.clone(), client, dispatch_timeout));
        let sweeper = arc!(OrphanSweeper::new(
            store.clone(),
            clock.clone(),
            jobs.clone(),
            SweepSettings {
                stale_after: period(config.stale_job_threshold).and_then(|d| chrono::Duration::from_std(d).ok()),
                claim_timeout: chrono::Duration::milliseconds((config.claim_timeout.max(0.) * 1000.) as i64),
            },
        ));
        let statistics = arc!(StatisticsReporter::new(
            store,
            clock,
            config.collect_job_statistics,
            config.service_statistics_max_job_age,
        ));
        Self {
            config: arc!(config),
            directory,
            health,
            jobs,
            dispatcher,
            heartbeat,
            sweeper,
            statistics,
        }
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn directory(&self) -> Arc<Directory> {
        self.directory.clone()
    }

    pub fn health(&self) -> Arc<HealthTracker> {
        self.health.clone()
    }

    pub fn jobs(&self) -> Arc<JobManager> {
        self.jobs.clone()
    }

    pub fn dispatcher(&self) -> Arc<Dispatcher> {
        self.dispatcher.clone()
    }

    pub fn heartbeat(&self) -> Arc<JobProducerHeartbeat> {
        self.heartbeat.clone()
    }

    pub fn sweeper(&self) -> Arc<OrphanSweeper> {
        self.sweeper.clone()
    }

    pub fn statistics(&self) -> Arc<StatisticsReporter> {
        self.statistics.clone()
    }

    /// Cleans up after a previous run of this node and starts the background loops.
    ///
    /// Must be called from within a tokio runtime.
    pub fn start(&self) -> Result<RegistryHandle> {
        let cancelled = self.sweeper.cancel_undispatchable_jobs(&self.config.node_url)?;
        if cancelled > 0 {
            info!("cancelled {} undispatchable jobs of {}", cancelled, self.config.node_url);
        }

        let mut handle = RegistryHandle::new();
        if let Some(interval) = period(self.config.dispatch_interval) {
            let dispatcher = self.dispatcher.clone();
            handle.spawn("dispatcher", interval, move || {
                let dispatcher = dispatcher.clone();
                async move {
                    if let Err(e) = dispatcher.dispatch_pass().await {
                        warn!("dispatch pass failed: {}", e);
                    }
                }
            });
        } else {
            info!("job dispatching is disabled on {}", self.config.node_url);
        }
        if let Some(interval) = period(self.config.heartbeat_interval) {
            let heartbeat = self.heartbeat.clone();
            handle.spawn("heartbeat", interval, move || {
                let heartbeat = heartbeat.clone();
                async move {
                    if let Err(e) = heartbeat.check().await {
                        warn!("job producer heartbeat failed: {}", e);
                    }
                }
            });
        }
        if let Some(interval) = period(self.config.sweep_interval) {
            let sweeper = self.sweeper.clone();
            handle.spawn("sweep", interval, move || {
                let sweeper = sweeper.clone();
                async move {
                    if let Err(e) = sweeper.sweep() {
                        warn!("orphan sweep failed: {}", e);
                    }
                }
            });
        }
        if let Some(interval) = period(self.config.statistics_interval) {
            let statistics = self.statistics.clone();
            handle.spawn("statistics", interval, move || {
                let statistics = statistics.clone();
                async move {
                    if let Err(e) = statistics.refresh() {
                        warn!("statistics refresh failed: {}", e);
                    }
                }
            });
        }
        if let (Some(lifetime), Some(interval)) =
            (self.config.parentless_job_lifetime, period(self.config.cleanup_interval))
        {
            let jobs = self.jobs.clone();
            handle.spawn("parentless job cleanup", interval, move || {
                let jobs = jobs.clone();
                async move {
                    if let Err(e) = jobs.remove_parentless_jobs(lifetime) {
                        warn!("parentless job cleanup failed: {}", e);
                    }
                }
            });
        }
        info!("registry node {} started {} background tasks", self.config.node_url, handle.tasks.len());
        Ok(handle)
    }
}

struct Task {
    name: &'static str,
    token: CancellationToken,
    handle: JoinHandle<()>,
}

/// Running background loops of a registry node.
///
/// Every loop has its own cancellation token, derived from the node token.
pub struct RegistryHandle {
    token: CancellationToken,
    tasks: Vec<Task>,
}

impl RegistryHandle {
    fn new() -> Self {
        Self {
            token: CancellationToken::new(),
            tasks: Vec::new(),
        }
    }

    fn spawn<F, Fut>(&mut self, name: &'static str, interval: Duration, mut tick: F)
    where
        F: FnMut() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let token = self.token.child_token();
        let task_token = token.clone();
        let handle = tokio::spawn(async move {
            let mut interval = tokio::time::interval(interval);
            interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = task_token.cancelled() => break,
                    _ = interval.tick() => tick().await,
                }
            }
            debug!("{} loop stopped", name);
        });
        debug!("{} loop started with period {:?}", name, interval);
        self.tasks.push(Task { name, token, handle });
    }

    /// Names of the running loops.
    pub fn tasks(&self) -> Vec<&'static str> {
        self.tasks.iter().map(|t| t.name).collect()
    }

    /// Stops a single loop. Returns false if there is no loop with this name.
    pub fn stop(&self, name: &str) -> bool {
        match self.tasks.iter().find(|t| t.name == name) {
            Some(task) => {
                task.token.cancel();
                true
            }
            None => false,
        }
    }

    /// Stops all loops and waits for them to finish.
    pub async fn shutdown(self) {
        self.token.cancel();
        for task in self.tasks {
            if let Err(e) = task.handle.await {
                warn!("{} loop terminated abnormally: {}", task.name, e);
            }
        }
    }
}
