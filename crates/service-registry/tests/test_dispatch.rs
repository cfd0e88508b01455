mod common;

use std::collections::BTreeMap;
use std::sync::Arc;

use rstest::rstest;

use service_registry::core::common::TYPE_WORKFLOW;
use service_registry::core::config::RegistryConfig;
use service_registry::core::job::{Job, JobRequest, JobStatus};
use service_registry::core::service::ServiceState;
use service_registry::core::store::MemoryStore;
use service_registry::dispatch::DispatchResponse;

use common::{name_wrapper, Script, TestRegistry, COMPOSER};

fn registry() -> TestRegistry {
    TestRegistry::from_config_file("registry.yaml")
}

#[tokio::test]
async fn test_least_loaded_service_wins() {
    let t = registry();
    t.add_host("http://worker1", 4);
    t.add_host("http://worker2", 4);
    t.add_host("http://worker3", 4);

    // worker1 already runs a job
    let busy = t.queue_job("http://worker1", "encode");
    let mut busy = t.job(busy.id);
    busy.processor_service = Some(t.registry.directory().service_registration(COMPOSER, "http://worker1").unwrap().id);
    t.registry.jobs().update_job(&busy).unwrap();
    t.complete(busy.id, JobStatus::Running);

    let jobs: Vec<u64> = (0..3).map(|_| t.queue_job("http://worker1", "encode").id).collect();
    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert_eq!(report.dispatched, jobs);
    let targets: Vec<String> = t.client.dispatched().into_iter().map(|(_, host)| host).collect();
    assert_eq!(targets, vec!["http://worker2", "http://worker3", "http://worker1"]);
    for id in jobs {
        let job = t.job(id);
        assert_eq!(job.status, JobStatus::Running);
        assert!(job.processor_service.is_some());
        assert!(job.date_started.is_some());
        assert_eq!(job.queue_time, Some(0));
    }
}

#[tokio::test]
async fn test_capacity_saturation() {
    let t = registry();
    t.add_host("http://worker1", 2);
    let jobs: Vec<u64> = (0..3).map(|_| t.queue_job("http://worker1", "encode").id).collect();

    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert_eq!(report.dispatched, jobs[..2].to_vec());
    assert_eq!(report.no_capacity, 1);
    let waiting = t.job(jobs[2]);
    assert_eq!(waiting.status, JobStatus::Queued);
    assert_eq!(waiting.processor_service, None);
    assert_eq!(t.registry.directory().current_host_loads().unwrap().get("http://worker1").unwrap().current, 2);
}

#[tokio::test]
async fn test_undispatchable_signature_skipped_for_rest_of_pass() {
    let t = registry();
    t.add_host("http://worker1", 1);
    for _ in 0..3 {
        t.queue_job("http://worker1", "encode");
    }

    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert_eq!(report.dispatched.len(), 1);
    assert_eq!(report.no_capacity, 1);
    assert_eq!(report.skipped, 1);
    assert_eq!(t.client.offered().len(), 1);
}

#[tokio::test]
async fn test_maintenance_host_gets_no_jobs() {
    let t = registry();
    t.add_host("http://worker1", 4);
    t.registry.directory().set_maintenance_mode("http://worker1", true).unwrap();
    let job = t.queue_job("http://worker1", "encode");

    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert!(report.dispatched.is_empty());
    assert!(t.client.offered().is_empty());
    assert_eq!(t.job(job.id).status, JobStatus::Queued);

    t.registry.directory().set_maintenance_mode("http://worker1", false).unwrap();
    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();
    assert_eq!(report.dispatched, vec![job.id]);
}

#[rstest]
#[case(Script::TransportError)]
#[case(Script::Respond(DispatchResponse::Rejected("unsupported codec".to_string())))]
#[case(Script::Respond(DispatchResponse::Unexpected(500)))]
#[case(Script::Hang)]
#[tokio::test]
async fn test_failed_handoff_moves_to_next_candidate(#[case] script: Script) {
    let t = registry();
    t.add_host("http://worker1", 4);
    t.add_host("http://worker2", 4);
    t.client.script("http://worker1", script);
    let job = t.queue_job("http://worker1", "encode");

    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert_eq!(report.dispatched, vec![job.id]);
    assert_eq!(t.client.dispatched(), vec![(job.id, "http://worker2".to_string())]);
    let job = t.job(job.id);
    assert_eq!(job.processing_host.as_deref(), Some("http://worker2"));
    let degraded = t.registry.directory().service_registration(COMPOSER, "http://worker1").unwrap();
    assert_eq!(degraded.state, ServiceState::Warning);
    assert_eq!(degraded.consecutive_failures, 1);
    assert_eq!(degraded.warning_state_trigger, Some(job.signature()));
}

#[rstest]
#[case(DispatchResponse::Refused)]
#[case(DispatchResponse::NotReachable)]
#[tokio::test]
async fn test_declined_job_stays_queued(#[case] response: DispatchResponse) {
    let t = registry();
    t.add_host("http://worker1", 4);
    t.client.script("http://worker1", Script::Respond(response));
    let job = t.queue_job("http://worker1", "encode");

    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert_eq!(report.declined, 1);
    let job = t.job(job.id);
    assert_eq!(job.status, JobStatus::Queued);
    assert_eq!(job.processor_service, None);
    assert_eq!(job.processing_host, None);
    let service = t.registry.directory().service_registration(COMPOSER, "http://worker1").unwrap();
    assert_eq!(service.state, ServiceState::Normal);
}

#[tokio::test]
async fn test_cancelled_job_is_not_dispatched() {
    let t = registry();
    t.add_host("http://worker1", 4);
    let job = t.queue_job("http://worker1", "encode");
    t.registry.jobs().cancel_job(job.id).unwrap();

    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert!(report.dispatched.is_empty());
    assert_eq!(t.job(job.id).status, JobStatus::Cancelled);
}

#[tokio::test]
async fn test_job_cancelled_during_handoff_is_lost() {
    let t = registry();
    t.add_host("http://worker1", 4);
    let job = t.queue_job("http://worker1", "encode");
    let jobs = t.registry.jobs();
    t.client.on_dispatch(move |offered: &Job| {
        jobs.cancel_job(offered.id).unwrap();
    });

    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert!(report.dispatched.is_empty());
    assert_eq!(report.lost, 1);
    let job = t.job(job.id);
    assert_eq!(job.status, JobStatus::Cancelled);
    assert_eq!(job.date_started, None);
    assert_eq!(t.registry.directory().current_host_loads().unwrap().get("http://worker1").unwrap().current, 0);
}

#[tokio::test]
async fn test_job_cancelled_before_claim_is_lost() {
    let t = registry();
    t.add_host("http://worker1", 4);
    let first = t.queue_job("http://worker1", "encode").id;
    let second = t.queue_job("http://worker1", "encode").id;
    // the second job is already loaded into the pass when it gets cancelled
    let jobs = t.registry.jobs();
    t.client.on_dispatch(move |offered: &Job| {
        if offered.id == first {
            jobs.cancel_job(second).unwrap();
        }
    });

    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert_eq!(report.dispatched, vec![first]);
    assert_eq!(report.lost, 1);
    assert_eq!(t.job(first).status, JobStatus::Running);
    let second = t.job(second);
    assert_eq!(second.status, JobStatus::Cancelled);
    assert_eq!(second.processor_service, None);
    assert_eq!(t.client.offered().len(), 1);
}

#[rstest]
#[case(COMPOSER, 1, 1)]
#[case(TYPE_WORKFLOW, 2, 0)]
#[tokio::test]
async fn test_full_host_skips_repeated_signatures(
    #[case] service_type: &str,
    #[case] no_capacity: usize,
    #[case] skipped: usize,
) {
    let t = registry();
    t.add_host("http://worker1", 0);
    t.registry
        .directory()
        .register_service(TYPE_WORKFLOW, "http://worker1", "/workflow", true)
        .unwrap();
    for _ in 0..2 {
        t.queue_request(JobRequest::new(service_type, "http://worker1", "start"));
    }

    let report = t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert_eq!(report.no_capacity, no_capacity);
    assert_eq!(report.skipped, skipped);
    assert!(t.client.offered().is_empty());
}

#[tokio::test]
async fn test_concurrent_dispatchers_never_assign_twice() {
    let config = RegistryConfig::from_file(&name_wrapper("registry.yaml")).unwrap();
    let store = Arc::new(MemoryStore::new());
    let a = TestRegistry::with_store(config.clone(), store.clone());
    let b = TestRegistry::with_store(config, store);
    for i in 0..4 {
        a.add_host(&format!("http://worker{}", i), 10);
    }
    let jobs: Vec<u64> = (0..12).map(|_| a.queue_job("http://worker0", "encode").id).collect();

    let dispatcher_a = a.registry.dispatcher();
    let dispatcher_b = b.registry.dispatcher();
    let (report_a, report_b) = tokio::join!(dispatcher_a.dispatch_pass(), dispatcher_b.dispatch_pass());
    let (report_a, report_b) = (report_a.unwrap(), report_b.unwrap());

    let mut assignments: BTreeMap<u64, usize> = BTreeMap::new();
    for (id, _) in a.client.dispatched().into_iter().chain(b.client.dispatched()) {
        *assignments.entry(id).or_default() += 1;
    }
    assert!(!report_a.dispatched.is_empty());
    assert!(!report_b.dispatched.is_empty());
    assert!(report_a.lost + report_b.lost > 0);
    assert_eq!(report_a.dispatched.len() + report_b.dispatched.len(), jobs.len());
    for id in jobs {
        assert_eq!(assignments.get(&id), Some(&1), "job {} assigned more than once", id);
        assert_eq!(a.job(id).status, JobStatus::Running);
    }
}

#[rstest]
#[case("registry.yaml", JobStatus::Queued)]
#[case("bypass.yaml", JobStatus::Running)]
#[tokio::test]
async fn test_child_jobs_bypass_capacity(#[case] config: &str, #[case] expected: JobStatus) {
    let t = TestRegistry::from_config_file(config);
    t.add_host("http://worker1", 1);

    // the parent occupies the only slot of the host
    let parent = t.queue_request(JobRequest::new(COMPOSER, "http://worker1", "process").dispatchable(false));
    t.complete(parent.id, JobStatus::Running);
    let child = t.queue_request(JobRequest::new(COMPOSER, "http://worker1", "encode").parent(parent.id));

    t.registry.dispatcher().dispatch_pass().await.unwrap();

    assert_eq!(t.job(child.id).status, expected);
}

#[tokio::test]
async fn test_worker_completion_feeds_health() {
    let t = registry();
    t.add_host("http://worker1", 4);
    t.add_host("http://worker2", 4);
    t.client.script("http://worker1", Script::TransportError);
    let first = t.queue_job("http://worker1", "encode");
    t.registry.dispatcher().dispatch_pass().await.unwrap();
    assert_eq!(t.job(first.id).processing_host.as_deref(), Some("http://worker2"));

    // worker1 recovers and successfully processes a job
    t.client.script("http://worker1", Script::Respond(DispatchResponse::Accepted));
    let second = t.queue_job("http://worker1", "inspect");
    t.registry.dispatcher().dispatch_pass().await.unwrap();
    assert_eq!(t.job(second.id).processing_host.as_deref(), Some("http://worker1"));
    t.complete(second.id, JobStatus::Finished);

    let service = t.registry.directory().service_registration(COMPOSER, "http://worker1").unwrap();
    assert_eq!(service.state, ServiceState::Normal);
    assert_eq!(service.consecutive_failures, 0);
}
