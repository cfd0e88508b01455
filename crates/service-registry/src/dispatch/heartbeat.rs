//! Liveness checks of job producing services.

use std::collections::HashSet;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};

use crate::core::common::ServiceId;
use crate::core::directory::Directory;
use crate::core::error::Result;
use crate::core::service::ServiceRegistration;
use crate::dispatch::client::DispatchClient;

/// Registrations whose status changed during a heartbeat round.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct HeartbeatReport {
    pub back_online: Vec<ServiceId>,
    pub unresponsive: Vec<ServiceId>,
    pub taken_offline: Vec<ServiceId>,
}

/// Probes job producers on their dispatch endpoint.
///
/// A registration failing one probe is put on a watch list. If it fails the next probe too, it is taken offline;
/// it comes back online as soon as it answers again.
pub struct JobProducerHeartbeat {
    directory: Arc<Directory>,
    client: Arc<dyn DispatchClient>,
    timeout: Duration,
    unresponsive: Mutex<HashSet<ServiceId>>,
}

impl JobProducerHeartbeat {
    pub fn new(directory: Arc<Directory>, client: Arc<dyn DispatchClient>, timeout: Duration) -> Self {
        Self {
            directory,
            client,
            timeout,
            unresponsive: Mutex::new(HashSet::new()),
        }
    }

    pub async fn check(&self) -> Result<HeartbeatReport> {
        let hosts = self.directory.host_map()?;
        let producers: Vec<ServiceRegistration> = self
            .directory
            .service_registrations()?
            .into_iter()
            .filter(|s| s.job_producer && s.active)
            .filter(|s| hosts.get(&s.host).map_or(false, |h| h.active && h.online && !h.maintenance))
            .collect();

        let mut results = Vec::with_capacity(producers.len());
        for service in producers {
            let alive = match tokio::time::timeout(self.timeout, self.client.probe(&service)).await {
                Ok(Ok(alive)) => alive,
                Ok(Err(e)) => {
                    debug!("heartbeat of {} failed: {}", service, e);
                    false
                }
                Err(_) => {
                    debug!("heartbeat of {} timed out", service);
                    false
                }
            };
            results.push((service, alive));
        }

        let mut report = HeartbeatReport::default();
        for (service, alive) in results {
            if alive {
                let was_unresponsive = self.lock().remove(&service.id);
                if !service.online {
                    self.directory.set_service_online(&service.service_type, &service.host, true)?;
                    info!("{} is back online", service);
                    report.back_online.push(service.id);
                } else if was_unresponsive {
                    debug!("{} is responsive again", service);
                }
            } else if service.online {
                let already_watched = !self.lock().insert(service.id);
                if already_watched {
                    warn!("{} is not responding, taking it offline", service);
                    self.directory.set_service_online(&service.service_type, &service.host, false)?;
                    self.lock().remove(&service.id);
                    report.taken_offline.push(service.id);
                } else {
                    info!("{} is not responding, watching it", service);
                    report.unresponsive.push(service.id);
                }
            }
        }
        Ok(report)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, HashSet<ServiceId>> {
        self.unresponsive.lock().unwrap_or_else(PoisonError::into_inner)
    }
}
