//! Host, service and job statistics for monitoring.
//!
//! Statistics are computed from a fresh store query on every refresh and cached until the next one. They are never
//! consulted for dispatch decisions. Job tuples use the semicolon separated `host;service;count` and
//! `host;service;status;count` formats expected by monitoring consumers.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use std::sync::{Arc, PoisonError, RwLock};

use chrono::{DateTime, Duration, Utc};
use log::debug;
use serde::Serialize;

use crate::core::clock::Clock;
use crate::core::common::ServiceId;
use crate::core::error::Result;
use crate::core::job::{Job, JobStatus};
use crate::core::service::{ServiceRegistration, ServiceState};
use crate::core::store::{JobFilter, RegistryStore};

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct HostsStatistics {
    pub online: usize,
    pub offline: usize,
    pub in_maintenance: usize,
    /// Running jobs per host base URL.
    pub running: BTreeMap<String, usize>,
    /// Queued jobs per host base URL.
    pub queued: BTreeMap<String, usize>,
}

/// `host;service` pairs of active registrations per health state.
#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct ServicesStatistics {
    pub normal: Vec<String>,
    pub warning: Vec<String>,
    pub error: Vec<String>,
}

impl ServicesStatistics {
    pub fn count(&self, state: ServiceState) -> usize {
        self.services(state).len()
    }

    pub fn services(&self, state: ServiceState) -> &[String] {
        match state {
            ServiceState::Normal => &self.normal,
            ServiceState::Warning => &self.warning,
            ServiceState::Error => &self.error,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobCount {
    pub host: String,
    pub service: String,
    pub status: JobStatus,
    pub count: usize,
}

/// Mean times in milliseconds of finished jobs.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct JobTimes {
    pub host: String,
    pub service: String,
    pub mean_queue_time: i64,
    pub mean_run_time: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct JobsStatistics {
    /// Job counts per (host, service type, status) ordered by these keys.
    pub counts: Vec<JobCount>,
    pub times: Vec<JobTimes>,
}

impl JobsStatistics {
    /// Returns `host;service;status;count` tuples.
    pub fn job_counts(&self) -> Vec<String> {
        self.counts
            .iter()
            .map(|c| format!("{};{};{};{}", c.host, c.service, c.status, c.count))
            .collect()
    }

    /// Returns `host;service;count` tuples of running jobs.
    pub fn running_jobs(&self) -> Vec<String> {
        self.status_counts(JobStatus::Running)
    }

    /// Returns `host;service;count` tuples of queued jobs.
    pub fn queued_jobs(&self) -> Vec<String> {
        self.status_counts(JobStatus::Queued)
    }

    /// Returns `host;service;millis` tuples.
    pub fn mean_queue_times(&self) -> Vec<String> {
        self.times
            .iter()
            .map(|t| format!("{};{};{}", t.host, t.service, t.mean_queue_time))
            .collect()
    }

    /// Returns `host;service;millis` tuples.
    pub fn mean_run_times(&self) -> Vec<String> {
        self.times
            .iter()
            .map(|t| format!("{};{};{}", t.host, t.service, t.mean_run_time))
            .collect()
    }

    fn status_counts(&self, status: JobStatus) -> Vec<String> {
        self.counts
            .iter()
            .filter(|c| c.status == status)
            .map(|c| format!("{};{};{}", c.host, c.service, c.count))
            .collect()
    }
}

/// Job counts and times of a single registration.
#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct ServiceStatistics {
    pub registration: ServiceRegistration,
    pub running_jobs: usize,
    pub queued_jobs: usize,
    pub finished_jobs: usize,
    pub mean_queue_time: i64,
    pub mean_run_time: i64,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize)]
pub struct StatisticsSnapshot {
    pub refreshed_at: Option<DateTime<Utc>>,
    pub hosts: HostsStatistics,
    pub services: ServicesStatistics,
    pub jobs: JobsStatistics,
}

#[derive(Serialize)]
struct CsvRow<'a> {
    kind: &'a str,
    host: &'a str,
    service: &'a str,
    status: String,
    value: i64,
}

impl StatisticsSnapshot {
    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(self)?)
    }

    /// Saves job statistics as CSV with `kind,host,service,status,value` columns.
    pub fn save_csv<P: AsRef<Path>>(&self, path: P) -> Result<()> {
        let file = File::create(path)?;
        let mut wtr = csv::Writer::from_writer(file);
        for c in &self.jobs.counts {
            wtr.serialize(CsvRow {
                kind: "count",
                host: &c.host,
                service: &c.service,
                status: c.status.to_string(),
                value: c.count as i64,
            })
            .map_err(std::io::Error::from)?;
        }
        for t in &self.jobs.times {
            for (kind, value) in [("mean_queue_time", t.mean_queue_time), ("mean_run_time", t.mean_run_time)] {
                wtr.serialize(CsvRow {
                    kind,
                    host: &t.host,
                    service: &t.service,
                    status: JobStatus::Finished.to_string(),
                    value,
                })
                .map_err(std::io::Error::from)?;
            }
        }
        wtr.flush()?;
        Ok(())
    }
}

#[derive(Default)]
struct Mean {
    total: i64,
    count: i64,
}

impl Mean {
    fn add(&mut self, value: Option<i64>) {
        if let Some(value) = value {
            self.total += value;
            self.count += 1;
        }
    }

    fn value(&self) -> i64 {
        if self.count == 0 {
            0
        } else {
            self.total / self.count
        }
    }
}

/// Computes statistics and caches the latest snapshot.
pub struct StatisticsReporter {
    store: Arc<dyn RegistryStore>,
    clock: Arc<dyn Clock>,
    collect_job_statistics: bool,
    max_job_age: Duration,
    snapshot: RwLock<StatisticsSnapshot>,
}

impl StatisticsReporter {
    pub fn new(
        store: Arc<dyn RegistryStore>,
        clock: Arc<dyn Clock>,
        collect_job_statistics: bool,
        max_job_age_days: u32,
    ) -> Self {
        Self {
            store,
            clock,
            collect_job_statistics,
            max_job_age: Duration::days(max_job_age_days as i64),
            snapshot: RwLock::new(StatisticsSnapshot::default()),
        }
    }

    /// Recomputes the cached snapshot.
    pub fn refresh(&self) -> Result<StatisticsSnapshot> {
        let snapshot = self.compute()?;
        *self.snapshot.write().unwrap_or_else(PoisonError::into_inner) = snapshot.clone();
        debug!(
            "statistics refreshed: {} hosts online, {} job tuples",
            snapshot.hosts.online,
            snapshot.jobs.counts.len()
        );
        Ok(snapshot)
    }

    /// Returns the snapshot computed by the latest refresh.
    pub fn snapshot(&self) -> StatisticsSnapshot {
        self.snapshot.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn compute(&self) -> Result<StatisticsSnapshot> {
        let hosts: BTreeMap<String, _> = self
            .store
            .hosts()?
            .into_iter()
            .filter(|h| h.active)
            .map(|h| (h.base_url.clone(), h))
            .collect();
        let jobs: Vec<Job> = self
            .store
            .jobs(&JobFilter::new())?
            .into_iter()
            .filter(|j| j.processing_host.as_ref().map_or(false, |h| hosts.contains_key(h)))
            .collect();

        let mut host_stats = HostsStatistics::default();
        for host in hosts.values() {
            if host.online {
                host_stats.online += 1;
            } else {
                host_stats.offline += 1;
            }
            if host.maintenance {
                host_stats.in_maintenance += 1;
            }
            host_stats.running.insert(host.base_url.clone(), 0);
            host_stats.queued.insert(host.base_url.clone(), 0);
        }

        let mut counts: BTreeMap<(String, String, JobStatus), usize> = BTreeMap::new();
        let mut times: BTreeMap<(String, String), (Mean, Mean)> = BTreeMap::new();
        for job in &jobs {
            let host = job.processing_host.clone().unwrap_or_default();
            match job.status {
                JobStatus::Running => *host_stats.running.entry(host.clone()).or_default() += 1,
                JobStatus::Queued => *host_stats.queued.entry(host.clone()).or_default() += 1,
                _ => {}
            }
            *counts.entry((host.clone(), job.job_type.clone(), job.status)).or_default() += 1;
            if job.status == JobStatus::Finished {
                let (queue, run) = times.entry((host, job.job_type.clone())).or_default();
                queue.add(job.queue_time);
                run.add(job.run_time);
            }
        }

        let mut services = ServicesStatistics::default();
        for service in self.store.services()? {
            if !service.active || !hosts.contains_key(&service.host) {
                continue;
            }
            let entry = format!("{};{}", service.host, service.service_type);
            match service.state {
                ServiceState::Normal => services.normal.push(entry),
                ServiceState::Warning => services.warning.push(entry),
                ServiceState::Error => services.error.push(entry),
            }
        }
        services.normal.sort();
        services.warning.sort();
        services.error.sort();

        Ok(StatisticsSnapshot {
            refreshed_at: Some(self.clock.now()),
            hosts: host_stats,
            services,
            jobs: JobsStatistics {
                counts: counts
                    .into_iter()
                    .map(|((host, service, status), count)| JobCount {
                        host,
                        service,
                        status,
                        count,
                    })
                    .collect(),
                times: times
                    .into_iter()
                    .map(|((host, service), (queue, run))| JobTimes {
                        host,
                        service,
                        mean_queue_time: queue.value(),
                        mean_run_time: run.value(),
                    })
                    .collect(),
            },
        })
    }

    /// Returns statistics of every registration over jobs created within the maximum job age, sorted by service
    /// type and host. Job counts stay zero when job statistics collection is disabled.
    pub fn service_statistics(&self) -> Result<Vec<ServiceStatistics>> {
        let mut stats: BTreeMap<ServiceId, ServiceStatistics> = self
            .store
            .services()?
            .into_iter()
            .map(|registration| {
                (
                    registration.id,
                    ServiceStatistics {
                        registration,
                        running_jobs: 0,
                        queued_jobs: 0,
                        finished_jobs: 0,
                        mean_queue_time: 0,
                        mean_run_time: 0,
                    },
                )
            })
            .collect();

        if self.collect_job_statistics {
            let since = self.clock.now() - self.max_job_age;
            let mut times: BTreeMap<ServiceId, (Mean, Mean)> = BTreeMap::new();
            for job in self.store.jobs(&JobFilter::new())? {
                if job.date_created < since {
                    continue;
                }
                let entry = match job.processor_service.and_then(|id| stats.get_mut(&id)) {
                    Some(entry) => entry,
                    None => continue,
                };
                match job.status {
                    JobStatus::Running => entry.running_jobs += 1,
                    JobStatus::Queued => entry.queued_jobs += 1,
                    JobStatus::Finished => {
                        entry.finished_jobs += 1;
                        let (queue, run) = times.entry(entry.registration.id).or_default();
                        queue.add(job.queue_time);
                        run.add(job.run_time);
                    }
                    _ => {}
                }
            }
            for (id, (queue, run)) in times {
                if let Some(entry) = stats.get_mut(&id) {
                    entry.mean_queue_time = queue.value();
                    entry.mean_run_time = run.value();
                }
            }
        }

        let mut stats: Vec<ServiceStatistics> = stats.into_values().collect();
        stats.sort_by(|a, b| {
            (&a.registration.service_type, &a.registration.host)
                .cmp(&(&b.registration.service_type, &b.registration.host))
        });
        Ok(stats)
    }
}
