//! Ranking of service registrations by the load of their hosts.

use std::collections::BTreeMap;

use log::trace;

use crate::core::host::HostRegistration;
use crate::core::load::SystemLoad;
use crate::core::service::{ServiceRegistration, ServiceState};

/// Registration paired with the load of its host at ranking time.
#[derive(Clone, Debug, PartialEq)]
pub struct ServiceLoad {
    pub registration: ServiceRegistration,
    pub load: u32,
    pub max_jobs: u32,
}

/// Whether ranking drops registrations of hosts which reached their job limit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CapacityMode {
    Respect,
    Ignore,
}

/// Returns registrations of the given type able to accept jobs, least loaded host first.
///
/// A registration is eligible if it and its host are active and online, the host is not in maintenance and the
/// registration is not in ERROR state. With [`CapacityMode::Respect`] hosts without free slots are dropped too.
/// Ties are broken by registration id so that all dispatchers rank identically.
pub fn rank_services(
    service_type: &str,
    services: &[ServiceRegistration],
    hosts: &BTreeMap<String, HostRegistration>,
    loads: &SystemLoad,
    mode: CapacityMode,
) -> Vec<ServiceLoad> {
    let mut ranked = Vec::new();
    for service in services.iter().filter(|s| s.service_type == service_type) {
        let host = match hosts.get(&service.host) {
            Some(host) => host,
            None => continue,
        };
        if !service.active || !service.online || !host.is_dispatch_target() {
            trace!("skipping {}: not available", service);
            continue;
        }
        if service.state == ServiceState::Error {
            trace!("skipping {}: in error state", service);
            continue;
        }
        let load = loads.get(&host.base_url).map(|l| l.current).unwrap_or(0);
        if mode == CapacityMode::Respect && load >= host.max_jobs {
            trace!("skipping {}: host is running {} of {} jobs", service, load, host.max_jobs);
            continue;
        }
        ranked.push(ServiceLoad {
            registration: service.clone(),
            load,
            max_jobs: host.max_jobs,
        });
    }
    ranked.sort_by_key(|s| (s.load, s.registration.id));
    ranked
}
