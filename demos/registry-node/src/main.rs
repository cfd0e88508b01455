use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use clap::Parser;
use log::info;
use rand::prelude::*;
use rand_pcg::Pcg64;
use sugars::arc;
use tokio::sync::mpsc;

use service_registry::core::common::{retry_on_conflict, JobId};
use service_registry::core::config::RegistryConfig;
use service_registry::core::job::{FailureReason, Job, JobRequest, JobStatus};
use service_registry::core::jobs::JobManager;
use service_registry::core::service::ServiceRegistration;
use service_registry::core::store::MemoryStore;
use service_registry::dispatch::{DispatchClient, DispatchError, DispatchResponse};
use service_registry::ServiceRegistry;

const SERVICE_TYPES: [&str; 2] = ["org.opencastproject.composer", "org.opencastproject.inspection"];

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Args {
    /// Path to registry config
    #[clap(long, default_value = "config.yaml")]
    config: String,

    /// Number of worker hosts
    #[clap(long, default_value_t = 3)]
    host_count: u32,

    /// Number of jobs
    #[clap(long, default_value_t = 50)]
    job_count: u32,

    /// How long to run the node, in seconds
    #[clap(long, default_value_t = 20)]
    duration: u64,

    /// Probability that a worker refuses an offered job
    #[clap(long, default_value_t = 0.2)]
    refusal_rate: f64,

    /// Probability that an accepted job fails
    #[clap(long, default_value_t = 0.1)]
    failure_rate: f64,

    /// Random seed
    #[clap(long, default_value_t = 123)]
    seed: u64,

    /// Save final statistics to this CSV file
    #[clap(long)]
    statistics: Option<String>,
}

fn init_logger() {
    use env_logger::Builder;
    use std::io::Write;
    Builder::from_default_env()
        .format(|buf, record| writeln!(buf, "[{}] {}", record.level(), record.args()))
        .init();
}

/// Workers which accept or refuse offered jobs at random and report accepted ones to the demo loop.
struct SimulatedWorkers {
    rng: Mutex<Pcg64>,
    refusal_rate: f64,
    accepted: mpsc::UnboundedSender<JobId>,
}

#[async_trait]
impl DispatchClient for SimulatedWorkers {
    async fn dispatch(&self, service: &ServiceRegistration, job: &Job) -> Result<DispatchResponse, DispatchError> {
        if self.rng.lock().unwrap().gen_bool(self.refusal_rate) {
            info!("{} refused {}", service, job);
            return Ok(DispatchResponse::Refused);
        }
        self.accepted.send(job.id).unwrap();
        Ok(DispatchResponse::Accepted)
    }

    async fn probe(&self, _service: &ServiceRegistration) -> Result<bool, DispatchError> {
        Ok(true)
    }
}

async fn process(jobs: Arc<JobManager>, id: JobId, delay: Duration, failed: bool) {
    tokio::time::sleep(delay).await;
    let result = retry_on_conflict("job", || {
        let mut job = jobs.get_job(id)?;
        if failed {
            job.fail(FailureReason::Processing);
        } else {
            job.status = JobStatus::Finished;
        }
        jobs.update_job(&job)
    });
    match result {
        Ok(job) => info!("{} is {}", job, job.status),
        Err(e) => info!("can't complete job {}: {}", id, e),
    }
}

#[tokio::main]
async fn main() {
    init_logger();
    let args = Args::parse();
    let config = RegistryConfig::from_file(&args.config).unwrap();
    let node_url = config.node_url.clone();
    let mut rng = Pcg64::seed_from_u64(args.seed);

    let (sender, mut accepted) = mpsc::unbounded_channel();
    let workers = arc!(SimulatedWorkers {
        rng: Mutex::new(Pcg64::seed_from_u64(rng.gen())),
        refusal_rate: args.refusal_rate,
        accepted: sender,
    });
    let registry = ServiceRegistry::new(config, arc!(MemoryStore::new()), workers);

    let directory = registry.directory();
    // the admin node only creates jobs
    directory.register_host(&node_url, "10.0.0.1", "admin", 16 << 30, 8, 0).unwrap();
    directory.set_maintenance_mode(&node_url, true).unwrap();
    for service_type in SERVICE_TYPES {
        directory.register_service(service_type, &node_url, "/jobs", true).unwrap();
    }
    for i in 0..args.host_count {
        let url = format!("http://worker{}.example.org", i + 1);
        let max_jobs = rng.gen_range(1..=4);
        directory
            .register_host(&url, &format!("10.0.1.{}", i + 1), &format!("worker{}", i + 1), 8 << 30, 4, max_jobs)
            .unwrap();
        for service_type in SERVICE_TYPES {
            directory.register_service(service_type, &url, "/jobs", true).unwrap();
        }
    }

    let jobs = registry.jobs();
    for _ in 0..args.job_count {
        let service_type = SERVICE_TYPES[rng.gen_range(0..SERVICE_TYPES.len())];
        let job = jobs.create_job(JobRequest::new(service_type, &node_url, "process")).unwrap();
        jobs.queue_job(job.id).unwrap();
    }

    let handle = registry.start().unwrap();
    let deadline = tokio::time::sleep(Duration::from_secs(args.duration));
    tokio::pin!(deadline);
    loop {
        tokio::select! {
            _ = &mut deadline => break,
            Some(id) = accepted.recv() => {
                let delay = Duration::from_millis(rng.gen_range(500..3000));
                let failed = rng.gen_bool(args.failure_rate);
                tokio::spawn(process(jobs.clone(), id, delay, failed));
            }
        }
    }
    handle.shutdown().await;

    let snapshot = registry.statistics().refresh().unwrap();
    println!("{}", snapshot.to_json().unwrap());
    for service in registry.statistics().service_statistics().unwrap() {
        println!("{:?}", service);
    }
    if let Some(path) = args.statistics {
        snapshot.save_csv(&path).unwrap();
        info!("statistics saved to {}", path);
    }
}
