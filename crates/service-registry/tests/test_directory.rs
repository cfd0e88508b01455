mod common;

use rstest::rstest;

use service_registry::core::config::RegistryConfig;
use service_registry::core::job::JobStatus;
use service_registry::core::service::ServiceState;
use service_registry::RegistryError;

use common::{TestRegistry, COMPOSER, INSPECTOR};

#[test]
fn test_register_host_is_idempotent() {
    let t = TestRegistry::new(RegistryConfig::default());
    let directory = t.registry.directory();

    let first = directory
        .register_host("http://worker1", "10.0.0.1", "worker1", 1024, 2, 4)
        .unwrap();
    let second = directory
        .register_host("http://worker1", "10.0.0.2", "worker1", 2048, 4, 8)
        .unwrap();

    let hosts = directory.hosts().unwrap();
    assert_eq!(hosts.len(), 1);
    assert_eq!(first.base_url, second.base_url);
    assert_eq!(second.ip_address, "10.0.0.2");
    assert_eq!(second.max_jobs, 8);
    assert_eq!(second.cores, 4);
    assert!(second.version > first.version);
}

#[test]
fn test_register_host_reactivates() {
    let t = TestRegistry::new(RegistryConfig::default());
    let directory = t.registry.directory();
    t.add_host("http://worker1", 4);

    directory.unregister_host("http://worker1").unwrap();
    let host = directory.host("http://worker1").unwrap();
    assert!(!host.active);
    assert!(!host.online);

    let host = directory
        .register_host("http://worker1", "10.0.0.1", "worker1", 1024, 2, 4)
        .unwrap();
    assert!(host.active);
    assert!(host.online);
}

#[test]
fn test_empty_base_url_rejected() {
    let t = TestRegistry::new(RegistryConfig::default());
    let err = t
        .registry
        .directory()
        .register_host("", "10.0.0.1", "worker1", 1024, 2, 4)
        .unwrap_err();
    assert!(matches!(err, RegistryError::InvalidArgument(_)));
}

#[test]
fn test_register_service_on_unknown_host() {
    let t = TestRegistry::new(RegistryConfig::default());
    let err = t
        .registry
        .directory()
        .register_service(COMPOSER, "http://nowhere", "/composer", false)
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_register_service_requires_path() {
    let t = TestRegistry::new(RegistryConfig::default());
    t.add_host("http://worker1", 4);
    let directory = t.registry.directory();

    let err = directory.register_service(INSPECTOR, "http://worker1", "", false).unwrap_err();
    assert!(matches!(err, RegistryError::InvalidArgument(_)));

    // existing registrations keep their path
    let service = directory.register_service(COMPOSER, "http://worker1", "", false).unwrap();
    assert_eq!(service.path, "/composer");
    assert!(!service.job_producer);
}

#[test]
fn test_register_service_is_idempotent() {
    let t = TestRegistry::new(RegistryConfig::default());
    let first = t.add_host("http://worker1", 4);
    let second = t
        .registry
        .directory()
        .register_service(COMPOSER, "http://worker1", "/composer2", true)
        .unwrap();
    assert_eq!(first.id, second.id);
    assert_eq!(second.path, "/composer2");
    assert_eq!(t.registry.directory().service_registrations().unwrap().len(), 1);
}

#[test]
fn test_unregister_host_cascades_to_services() {
    let t = TestRegistry::new(RegistryConfig::default());
    t.add_host("http://worker1", 4);
    let directory = t.registry.directory();
    directory
        .register_service(INSPECTOR, "http://worker1", "/inspection", false)
        .unwrap();

    directory.unregister_host("http://worker1").unwrap();

    for service in directory.service_registrations_by_host("http://worker1").unwrap() {
        assert!(!service.online);
        assert!(!service.active);
    }
    assert!(directory.service_registrations_by_load(COMPOSER).unwrap().is_empty());
}

#[test]
fn test_enable_and_disable_host() {
    let t = TestRegistry::new(RegistryConfig::default());
    t.add_host("http://worker1", 4);
    let directory = t.registry.directory();

    directory.disable_host("http://worker1").unwrap();
    assert!(!directory.host("http://worker1").unwrap().active);
    assert!(directory.service_registrations_by_load(COMPOSER).unwrap().is_empty());

    directory.enable_host("http://worker1").unwrap();
    assert!(directory.host("http://worker1").unwrap().active);
    assert_eq!(directory.service_registrations_by_load(COMPOSER).unwrap().len(), 1);
}

#[rstest]
#[case(true, 0)]
#[case(false, 1)]
fn test_maintenance_excludes_host(#[case] maintenance: bool, #[case] expected: usize) {
    let t = TestRegistry::new(RegistryConfig::default());
    t.add_host("http://worker1", 4);
    let directory = t.registry.directory();

    let host = directory.set_maintenance_mode("http://worker1", maintenance).unwrap();
    assert_eq!(host.maintenance, maintenance);
    assert_eq!(directory.service_registrations_by_load(COMPOSER).unwrap().len(), expected);
}

#[test]
fn test_maintenance_of_unknown_host() {
    let t = TestRegistry::new(RegistryConfig::default());
    let err = t
        .registry
        .directory()
        .set_maintenance_mode("http://nowhere", true)
        .unwrap_err();
    assert!(err.is_not_found());
}

#[test]
fn test_services_by_load() {
    let t = TestRegistry::new(RegistryConfig::default());
    t.add_host("http://worker1", 2);
    t.add_host("http://worker2", 2);
    t.add_host("http://worker3", 2);

    // worker1 runs two jobs and is saturated, worker2 runs one
    for (host, count) in [("http://worker1", 2), ("http://worker2", 1)] {
        let processor = t.registry.directory().service_registration(COMPOSER, host).unwrap();
        for _ in 0..count {
            let mut job = t.queue_job("http://worker3", "encode");
            job.processor_service = Some(processor.id);
            let job = t.registry.jobs().update_job(&job).unwrap();
            t.complete(job.id, JobStatus::Running);
        }
    }

    let ranked = t.registry.directory().service_registrations_by_load(COMPOSER).unwrap();
    let hosts: Vec<&str> = ranked.iter().map(|s| s.registration.host.as_str()).collect();
    assert_eq!(hosts, vec!["http://worker3", "http://worker2"]);
    assert_eq!(ranked[1].load, 1);

    let loads = t.registry.directory().current_host_loads().unwrap();
    assert_eq!(loads.get("http://worker1").unwrap().current, 2);
    assert!(!loads.get("http://worker1").unwrap().has_capacity());
    let max_loads = t.registry.directory().max_loads().unwrap();
    assert_eq!(max_loads.get("http://worker1").unwrap().max_jobs, 2);
}

#[test]
fn test_set_service_online() {
    let t = TestRegistry::new(RegistryConfig::default());
    t.add_host("http://worker1", 2);
    let directory = t.registry.directory();

    let service = directory.set_service_online(COMPOSER, "http://worker1", false).unwrap();
    assert!(!service.online);
    assert!(directory.service_registrations_by_load(COMPOSER).unwrap().is_empty());

    let service = directory.set_service_online(COMPOSER, "http://worker1", true).unwrap();
    assert!(service.online);
    assert_eq!(service.state, ServiceState::Normal);
}

#[test]
fn test_unregister_service() {
    let t = TestRegistry::new(RegistryConfig::default());
    t.add_host("http://worker1", 2);
    let service = t
        .registry
        .directory()
        .unregister_service(COMPOSER, "http://worker1")
        .unwrap();
    assert!(!service.active);
    assert!(!service.online);
    assert!(t.registry.directory().host("http://worker1").unwrap().active);
}
