//! Directory of worker hosts and the services they run.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::{debug, info};

use crate::core::clock::Clock;
use crate::core::common::retry_on_conflict;
use crate::core::error::{RegistryError, Result};
use crate::core::host::HostRegistration;
use crate::core::load::SystemLoad;
use crate::core::ranking::{rank_services, CapacityMode, ServiceLoad};
use crate::core::service::{ServiceRegistration, ServiceState};
use crate::core::store::RegistryStore;

/// Maintains host and service registrations.
///
/// All updates are read-modify-write cycles on the store repeated on version conflicts, so concurrent heartbeats of
/// the same host converge to the last written values while keeping the identity of the registrations.
pub struct Directory {
    store: Arc<dyn RegistryStore>,
    clock: Arc<dyn Clock>,
}

impl Directory {
    pub fn new(store: Arc<dyn RegistryStore>, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    /// Registers the host or updates its registration, bringing it online and reactivating it.
    pub fn register_host(
        &self,
        base_url: &str,
        ip_address: &str,
        node_name: &str,
        memory: u64,
        cores: u32,
        max_jobs: u32,
    ) -> Result<HostRegistration> {
        if base_url.is_empty() {
            return Err(RegistryError::InvalidArgument("host base URL must not be empty".to_string()));
        }
        retry_on_conflict(base_url, || match self.store.host(base_url) {
            Ok(mut host) => {
                host.ip_address = ip_address.to_string();
                host.node_name = node_name.to_string();
                host.memory = memory;
                host.cores = cores;
                host.max_jobs = max_jobs;
                host.online = true;
                if !host.active {
                    info!("reactivating {}", host);
                    host.active = true;
                }
                self.store.update_host(&host)
            }
            Err(e) if e.is_not_found() => {
                let host = HostRegistration::new(base_url, ip_address, node_name, memory, cores, max_jobs);
                let host = self.store.insert_host(host)?;
                info!("registered {} with capacity of {} jobs", host, max_jobs);
                Ok(host)
            }
            Err(e) => Err(e),
        })
    }

    /// Takes the host offline and deactivates it together with all its service registrations.
    ///
    /// Jobs still running on the host are left to the orphan sweep.
    pub fn unregister_host(&self, base_url: &str) -> Result<()> {
        self.update_host(base_url, |host| {
            host.online = false;
            host.active = false;
        })?;
        self.update_host_services(base_url, |service| {
            service.online = false;
            service.active = false;
        })?;
        info!("unregistered host {}", base_url);
        Ok(())
    }

    /// Reactivates a host disabled by [`Directory::disable_host`] together with its registrations.
    pub fn enable_host(&self, base_url: &str) -> Result<()> {
        self.update_host(base_url, |host| host.active = true)?;
        self.update_host_services(base_url, |service| service.active = true)?;
        info!("enabled host {}", base_url);
        Ok(())
    }

    /// Deactivates the host and its registrations without taking them offline.
    pub fn disable_host(&self, base_url: &str) -> Result<()> {
        self.update_host(base_url, |host| host.active = false)?;
        self.update_host_services(base_url, |service| service.active = false)?;
        info!("disabled host {}", base_url);
        Ok(())
    }

    pub fn set_maintenance_mode(&self, base_url: &str, maintenance: bool) -> Result<HostRegistration> {
        let host = self.update_host(base_url, |host| host.maintenance = maintenance)?;
        info!("maintenance mode of {} set to {}", host, maintenance);
        Ok(host)
    }

    /// Registers the service on a known host or updates the existing registration.
    ///
    /// The registration is brought online and reactivated. A path is required for new registrations, an empty path
    /// keeps the path of an existing one.
    pub fn register_service(
        &self,
        service_type: &str,
        base_url: &str,
        path: &str,
        job_producer: bool,
    ) -> Result<ServiceRegistration> {
        self.store.host(base_url)?;
        retry_on_conflict(service_type, || {
            let now = self.clock.now();
            match self.store.find_service(service_type, base_url)? {
                Some(mut service) => {
                    if !path.is_empty() {
                        service.path = path.to_string();
                    }
                    service.job_producer = job_producer;
                    service.active = true;
                    if !service.online {
                        service.online = true;
                        service.online_from = Some(now);
                    }
                    self.store.update_service(&service)
                }
                None => {
                    if path.is_empty() {
                        return Err(RegistryError::InvalidArgument(format!(
                            "path of service {} on {} must not be empty",
                            service_type, base_url
                        )));
                    }
                    let service = ServiceRegistration::new(service_type, base_url, path, job_producer, now);
                    let service = self.store.insert_service(service)?;
                    info!("registered {}", service);
                    Ok(service)
                }
            }
        })
    }

    /// Takes the registration offline and deactivates it.
    pub fn unregister_service(&self, service_type: &str, base_url: &str) -> Result<ServiceRegistration> {
        let service = self.update_service(service_type, base_url, |service| {
            service.online = false;
            service.active = false;
        })?;
        info!("unregistered {}", service);
        Ok(service)
    }

    pub fn set_service_online(&self, service_type: &str, base_url: &str, online: bool) -> Result<ServiceRegistration> {
        let now = self.clock.now();
        self.update_service(service_type, base_url, |service| {
            if online && !service.online {
                service.online_from = Some(now);
            }
            service.online = online;
        })
    }

    /// Resets the health of the registration to NORMAL.
    pub fn sanitize(&self, service_type: &str, base_url: &str) -> Result<ServiceRegistration> {
        let now = self.clock.now();
        let service = self.update_service(service_type, base_url, |service| {
            service.consecutive_failures = 0;
            service.set_state(ServiceState::Normal, None, now);
        })?;
        info!("health of {} reset to NORMAL", service);
        Ok(service)
    }

    pub fn host(&self, base_url: &str) -> Result<HostRegistration> {
        self.store.host(base_url)
    }

    pub fn hosts(&self) -> Result<Vec<HostRegistration>> {
        self.store.hosts()
    }

    /// Returns hosts keyed by base URL.
    pub fn host_map(&self) -> Result<BTreeMap<String, HostRegistration>> {
        Ok(self
            .store
            .hosts()?
            .into_iter()
            .map(|h| (h.base_url.clone(), h))
            .collect())
    }

    pub fn service_registration(&self, service_type: &str, base_url: &str) -> Result<ServiceRegistration> {
        self.store
            .find_service(service_type, base_url)?
            .ok_or_else(|| RegistryError::not_found("service registration", format!("{}@{}", service_type, base_url)))
    }

    pub fn service_registrations(&self) -> Result<Vec<ServiceRegistration>> {
        self.store.services()
    }

    pub fn service_registrations_by_type(&self, service_type: &str) -> Result<Vec<ServiceRegistration>> {
        self.store.services_by_type(service_type)
    }

    pub fn service_registrations_by_host(&self, base_url: &str) -> Result<Vec<ServiceRegistration>> {
        self.store.services_by_host(base_url)
    }

    /// Returns registrations of the type able to accept a job now, least loaded host first.
    pub fn service_registrations_by_load(&self, service_type: &str) -> Result<Vec<ServiceLoad>> {
        let services = self.store.services_by_type(service_type)?;
        let hosts = self.host_map()?;
        let loads = self.store.host_loads()?;
        Ok(rank_services(service_type, &services, &hosts, &loads, CapacityMode::Respect))
    }

    /// Returns the number of queued and running jobs of every host.
    pub fn current_host_loads(&self) -> Result<SystemLoad> {
        self.store.host_loads()
    }

    /// Returns the job limit of every host.
    pub fn max_loads(&self) -> Result<SystemLoad> {
        let mut loads = SystemLoad::new();
        for host in self.store.hosts()? {
            loads.add_node(&host.base_url, host.max_jobs, host.max_jobs);
        }
        Ok(loads)
    }

    fn update_host(&self, base_url: &str, f: impl Fn(&mut HostRegistration)) -> Result<HostRegistration> {
        retry_on_conflict(base_url, || {
            let mut host = self.store.host(base_url)?;
            f(&mut host);
            self.store.update_host(&host)
        })
    }

    fn update_service(
        &self,
        service_type: &str,
        base_url: &str,
        f: impl Fn(&mut ServiceRegistration),
    ) -> Result<ServiceRegistration> {
        retry_on_conflict(service_type, || {
            let mut service = self.service_registration(service_type, base_url)?;
            f(&mut service);
            self.store.update_service(&service)
        })
    }

    fn update_host_services(&self, base_url: &str, f: impl Fn(&mut ServiceRegistration)) -> Result<()> {
        for service in self.store.services_by_host(base_url)? {
            debug!("updating {}", service);
            self.update_service(&service.service_type, base_url, &f)?;
        }
        Ok(())
    }
}
