mod common;

use std::time::Duration;

use service_registry::core::config::RegistryConfig;
use service_registry::core::job::{JobRequest, JobStatus};

use common::{TestRegistry, COMPOSER};

const NODE: &str = "http://registry.example.org";

fn config() -> RegistryConfig {
    RegistryConfig::from_yaml(
        "
node_url: http://registry.example.org
dispatch_interval: 1
heartbeat_interval: 0
sweep_interval: 0
statistics_interval: 1
",
    )
    .unwrap()
}

#[tokio::test]
async fn test_background_dispatch() {
    let t = TestRegistry::new(config());
    t.add_host("http://worker1", 4);
    let job = t.queue_job("http://worker1", "encode");

    let handle = t.registry.start().unwrap();
    assert_eq!(handle.tasks(), vec!["dispatcher", "statistics"]);

    let mut status = JobStatus::Queued;
    for _ in 0..50 {
        status = t.job(job.id).status;
        if status == JobStatus::Running {
            break;
        }
        tokio::time::sleep(Duration::from_millis(100)).await;
    }
    assert_eq!(status, JobStatus::Running);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_stopped_loop_does_not_run() {
    let t = TestRegistry::new(config());
    t.add_host("http://worker1", 4);

    let handle = t.registry.start().unwrap();
    assert!(handle.stop("dispatcher"));
    assert!(!handle.stop("unknown"));
    tokio::time::sleep(Duration::from_millis(100)).await;

    let job = t.queue_job("http://worker1", "encode");
    tokio::time::sleep(Duration::from_millis(1500)).await;
    assert_eq!(t.job(job.id).status, JobStatus::Queued);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_start_cancels_leftover_undispatchable_jobs() {
    let t = TestRegistry::new(config());
    t.add_host(NODE, 4);
    let leftover = t.queue_request(JobRequest::new(COMPOSER, NODE, "process").dispatchable(false));
    t.complete(leftover.id, JobStatus::Running);

    let handle = t.registry.start().unwrap();
    assert_eq!(t.job(leftover.id).status, JobStatus::Cancelled);
    handle.shutdown().await;
}

#[tokio::test]
async fn test_disabled_loops() {
    let t = TestRegistry::new(RegistryConfig::from_yaml("dispatch_interval: 0\nheartbeat_interval: 0\nsweep_interval: 0\nstatistics_interval: 0").unwrap());
    let handle = t.registry.start().unwrap();
    assert!(handle.tasks().is_empty());
    handle.shutdown().await;
}
