//! In-memory store with optional JSON snapshot on disk.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Mutex, MutexGuard, PoisonError};

use chrono::{DateTime, Utc};
use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::core::common::{JobId, ServiceId};
use crate::core::error::{RegistryError, Result};
use crate::core::host::HostRegistration;
use crate::core::job::{Job, JobStatus};
use crate::core::load::SystemLoad;
use crate::core::service::ServiceRegistration;
use crate::core::store::{JobFilter, RegistryStore};

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
struct Tables {
    hosts: BTreeMap<String, HostRegistration>,
    services: BTreeMap<ServiceId, ServiceRegistration>,
    jobs: BTreeMap<JobId, Job>,
    last_service_id: ServiceId,
    last_job_id: JobId,
}

fn check_version(entity: &'static str, key: impl ToString, expected: u64, actual: u64) -> Result<()> {
    if expected != actual {
        return Err(RegistryError::Conflict {
            entity,
            key: key.to_string(),
            expected,
            actual,
        });
    }
    Ok(())
}

/// Store keeping all tables in memory.
///
/// When opened with a snapshot path, every mutation is first applied to a copy of the tables which is written to
/// disk and only then becomes visible, so the file never lags behind what readers observe.
pub struct MemoryStore {
    tables: Mutex<Tables>,
    snapshot: Option<PathBuf>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            tables: Mutex::new(Tables::default()),
            snapshot: None,
        }
    }

    /// Opens a store backed by the snapshot file, loading its content if the file exists.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let tables = if path.exists() {
            let tables: Tables = serde_json::from_str(&fs::read_to_string(&path)?)?;
            info!(
                "loaded registry snapshot {} ({} hosts, {} services, {} jobs)",
                path.display(),
                tables.hosts.len(),
                tables.services.len(),
                tables.jobs.len()
            );
            tables
        } else {
            Tables::default()
        };
        Ok(Self {
            tables: Mutex::new(tables),
            snapshot: Some(path),
        })
    }

    fn lock(&self) -> MutexGuard<'_, Tables> {
        self.tables.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn read<T>(&self, f: impl FnOnce(&Tables) -> Result<T>) -> Result<T> {
        f(&self.lock())
    }

    fn write<T>(&self, f: impl FnOnce(&mut Tables) -> Result<T>) -> Result<T> {
        let mut tables = self.lock();
        match &self.snapshot {
            None => f(&mut tables),
            Some(path) => {
                let mut next = tables.clone();
                let result = f(&mut next)?;
                Self::save(path, &next)?;
                *tables = next;
                Ok(result)
            }
        }
    }

    fn save(path: &Path, tables: &Tables) -> Result<()> {
        let tmp = path.with_extension("tmp");
        fs::write(&tmp, serde_json::to_vec(tables)?)?;
        fs::rename(&tmp, path)?;
        debug!("saved registry snapshot {}", path.display());
        Ok(())
    }
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl RegistryStore for MemoryStore {
    fn host(&self, base_url: &str) -> Result<HostRegistration> {
        self.read(|t| {
            t.hosts
                .get(base_url)
                .cloned()
                .ok_or_else(|| RegistryError::not_found("host", base_url))
        })
    }

    fn hosts(&self) -> Result<Vec<HostRegistration>> {
        self.read(|t| Ok(t.hosts.values().cloned().collect()))
    }

    fn insert_host(&self, mut host: HostRegistration) -> Result<HostRegistration> {
        self.write(|t| {
            if let Some(existing) = t.hosts.get(&host.base_url) {
                check_version("host", &host.base_url, 0, existing.version)?;
            }
            host.version = 1;
            t.hosts.insert(host.base_url.clone(), host.clone());
            Ok(host)
        })
    }

    fn update_host(&self, host: &HostRegistration) -> Result<HostRegistration> {
        self.write(|t| {
            let stored = t
                .hosts
                .get_mut(&host.base_url)
                .ok_or_else(|| RegistryError::not_found("host", &host.base_url))?;
            check_version("host", &host.base_url, host.version, stored.version)?;
            *stored = host.clone();
            stored.version += 1;
            Ok(stored.clone())
        })
    }

    fn service(&self, id: ServiceId) -> Result<ServiceRegistration> {
        self.read(|t| {
            t.services
                .get(&id)
                .cloned()
                .ok_or_else(|| RegistryError::not_found("service registration", id))
        })
    }

    fn find_service(&self, service_type: &str, host: &str) -> Result<Option<ServiceRegistration>> {
        self.read(|t| {
            Ok(t.services
                .values()
                .find(|s| s.service_type == service_type && s.host == host)
                .cloned())
        })
    }

    fn services(&self) -> Result<Vec<ServiceRegistration>> {
        self.read(|t| Ok(t.services.values().cloned().collect()))
    }

    fn insert_service(&self, mut service: ServiceRegistration) -> Result<ServiceRegistration> {
        self.write(|t| {
            let key = format!("{}@{}", service.service_type, service.host);
            if !t.hosts.contains_key(&service.host) {
                return Err(RegistryError::not_found("host", &service.host));
            }
            if let Some(existing) = t
                .services
                .values()
                .find(|s| s.service_type == service.service_type && s.host == service.host)
            {
                check_version("service registration", key, 0, existing.version)?;
            }
            t.last_service_id += 1;
            service.id = t.last_service_id;
            service.version = 1;
            t.services.insert(service.id, service.clone());
            Ok(service)
        })
    }

    fn update_service(&self, service: &ServiceRegistration) -> Result<ServiceRegistration> {
        self.write(|t| {
            let stored = t
                .services
                .get_mut(&service.id)
                .ok_or_else(|| RegistryError::not_found("service registration", service.id))?;
            check_version("service registration", service.id, service.version, stored.version)?;
            *stored = service.clone();
            stored.version += 1;
            Ok(stored.clone())
        })
    }

    fn job(&self, id: JobId) -> Result<Job> {
        self.read(|t| t.jobs.get(&id).cloned().ok_or_else(|| RegistryError::not_found("job", id)))
    }

    fn insert_job(&self, mut job: Job) -> Result<Job> {
        self.write(|t| {
            t.last_job_id += 1;
            job.id = t.last_job_id;
            job.version = 1;
            if job.parent_job.is_some() && job.root_job.is_none() {
                job.root_job = job.parent_job;
            }
            t.jobs.insert(job.id, job.clone());
            Ok(job)
        })
    }

    fn update_job(&self, job: &Job) -> Result<Job> {
        self.write(|t| {
            let stored = t.jobs.get_mut(&job.id).ok_or_else(|| RegistryError::not_found("job", job.id))?;
            check_version("job", job.id, job.version, stored.version)?;
            *stored = job.clone();
            stored.version += 1;
            Ok(stored.clone())
        })
    }

    fn remove_job(&self, id: JobId) -> Result<()> {
        self.write(|t| {
            t.jobs.remove(&id).ok_or_else(|| RegistryError::not_found("job", id))?;
            Ok(())
        })
    }

    fn jobs(&self, filter: &JobFilter) -> Result<Vec<Job>> {
        self.read(|t| Ok(t.jobs.values().filter(|j| filter.matches(j)).cloned().collect()))
    }

    fn child_jobs(&self, parent: JobId) -> Result<Vec<Job>> {
        self.read(|t| {
            Ok(t.jobs
                .values()
                .filter(|j| j.parent_job == Some(parent))
                .cloned()
                .collect())
        })
    }

    fn dispatchable_jobs(&self, after: Option<(DateTime<Utc>, JobId)>, limit: usize) -> Result<Vec<Job>> {
        self.read(|t| {
            let mut jobs: Vec<&Job> = t
                .jobs
                .values()
                .filter(|j| j.status == JobStatus::Queued && j.dispatchable && j.processor_service.is_none())
                .filter(|j| after.map_or(true, |position| (j.date_created, j.id) > position))
                .collect();
            jobs.sort_by_key(|j| (j.date_created, j.id));
            Ok(jobs.into_iter().take(limit).cloned().collect())
        })
    }

    fn host_loads(&self) -> Result<SystemLoad> {
        self.read(|t| {
            let mut current: BTreeMap<&str, u32> = BTreeMap::new();
            for job in t.jobs.values() {
                if !job.status.is_active() || job.processor_service.is_none() {
                    continue;
                }
                if let Some(host) = &job.processing_host {
                    *current.entry(host.as_str()).or_default() += 1;
                }
            }
            let mut loads = SystemLoad::new();
            for host in t.hosts.values() {
                let load = current.get(host.base_url.as_str()).copied().unwrap_or(0);
                loads.add_node(&host.base_url, load, host.max_jobs);
            }
            Ok(loads)
        })
    }
}
