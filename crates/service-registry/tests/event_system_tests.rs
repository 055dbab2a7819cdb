//! Integration tests for registry change events and persistence

use service_registry::{
    BuildSystem, ChangeKind, DependencyEdge, Registry, RegistrySettings, Retention, Service,
    SledStore, Status, service_id_for_name,
};
use std::sync::Arc;
use std::time::Duration;

fn stack() -> Vec<Service> {
    let db = Service::new("db", "infra/db", BuildSystem::Shell {
        command: "./run-db.sh".into(),
    })
    .with_port(5432);
    let api = Service::new("api", "services/api", BuildSystem::Maven)
        .with_port(8080)
        .with_health_url("http://localhost:8080/actuator/health")
        .with_dependency(
            DependencyEdge::new(service_id_for_name("api"), db.id)
                .healthy()
                .with_wait(Duration::from_secs(30)),
        );
    let web = Service::new("web", "services/web", BuildSystem::Npm)
        .with_port(3000)
        .depends_on(api.id);
    vec![db, api, web]
}

#[smol_potat::test]
async fn test_subscribers_see_every_mutation() {
    let registry = Registry::in_memory();
    let sub = registry.subscribe();

    let services = stack();
    let web_id = services[2].id;
    registry.add_services(services).await.unwrap();

    for _ in 0..3 {
        let event = sub.recv().await.unwrap();
        assert_eq!(event.kind, ChangeKind::Added);
    }

    let web = registry.get(web_id).unwrap();
    registry.set_status(&web, Status::Starting, Some(4242)).unwrap();
    let event = sub.recv().await.unwrap();
    assert_eq!(event.service_name, "web");
    assert_eq!(
        event.kind,
        ChangeKind::StatusChanged {
            from: Status::Stopped,
            to: Status::Starting
        }
    );

    registry.set_status(&web, Status::Stopped, None).unwrap();
    let _ = sub.recv().await;
    registry.delete_service(web_id, false).await.unwrap();
    assert_eq!(sub.recv().await.unwrap().kind, ChangeKind::Removed);

    assert!(registry.unsubscribe(sub.id()));
    assert!(sub.recv().await.is_none());
}

#[smol_potat::test]
async fn test_registry_reloads_from_sled() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("state");
    let services = stack();
    let api_id = services[1].id;

    {
        let store = Arc::new(SledStore::open(&path, Retention::default()).unwrap());
        let registry = Registry::new(store, RegistrySettings::default());
        registry.add_services(services.clone()).await.unwrap();
        let api = registry.get(api_id).unwrap();
        registry.set_status(&api, Status::Starting, Some(1234)).unwrap();
    }

    let store = Arc::new(SledStore::open(&path, Retention::default()).unwrap());
    let registry = Registry::new(store, RegistrySettings::default());
    assert_eq!(registry.load().await.unwrap(), 3);

    let api = registry.get(api_id).unwrap();
    // Runtime state is never persisted
    assert_eq!(api.status(), Status::Stopped);
    assert_eq!(api.pid(), None);

    let edge = &api.definition().dependencies[0];
    assert!(edge.health_check_required);
    assert_eq!(edge.wait(), Some(Duration::from_secs(30)));

    let order = registry.graph().order(None).unwrap();
    let names: Vec<String> = order
        .iter()
        .map(|id| registry.get(*id).unwrap().name())
        .collect();
    assert_eq!(names, vec!["db", "api", "web"]);
}
