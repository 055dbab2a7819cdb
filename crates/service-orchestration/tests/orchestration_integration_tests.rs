//! End-to-end lifecycle tests against real child processes

mod common;

use common::{engine, eventually, fast_config, shell};
use service_orchestration::{BatchMode, Error, Outcome};
use service_registry::{
    ChangeKind, DependencyEdge, HealthStatus, LogQuery, ProfileContext, Status, UptimeEventKind,
    service_id_for_name,
};
use std::collections::BTreeMap;
use std::time::Duration;

const LONG_RUNNING: &str = "exec sleep 30";

#[smol_potat::test]
async fn test_dependent_waits_for_healthy_dependency() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());

    let a = shell("a", dir.path(), LONG_RUNNING).with_health_url("http://a/health");
    let b = shell("b", dir.path(), LONG_RUNNING).with_dependency(
        DependencyEdge::new(service_id_for_name("b"), a.id)
            .healthy()
            .with_wait(Duration::from_secs(5)),
    );
    t.engine.add_services(vec![b.clone(), a.clone()]).await.unwrap();
    t.prober.set("http://a/health", true);

    let report = t.engine.start_all(&ProfileContext::all()).await.unwrap();
    assert_eq!(report.outcomes[0].name, "a");
    assert!(matches!(report.outcome_of(b.id), Some(Outcome::Started { .. })));

    let a_view = t.engine.service(a.id).unwrap();
    assert_eq!(a_view.health, HealthStatus::Healthy);
    assert_eq!(t.engine.service(b.id).unwrap().status, Status::Running);

    t.engine.shutdown().await.unwrap();
}

#[smol_potat::test]
async fn test_unhealthy_dependency_blocks_dependent() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());

    let a = shell("a", dir.path(), LONG_RUNNING).with_health_url("http://a/health");
    let b = shell("b", dir.path(), LONG_RUNNING).with_dependency(
        DependencyEdge::new(service_id_for_name("b"), a.id)
            .healthy()
            .with_wait(Duration::from_millis(300)),
    );
    t.engine.add_services(vec![a.clone(), b.clone()]).await.unwrap();

    let err = t.engine.start_all(&ProfileContext::all()).await.unwrap_err();
    let Error::PartialBatchFailure(report) = err else {
        panic!("expected a partial batch failure, got {err}");
    };
    assert!(matches!(report.outcome_of(a.id), Some(Outcome::Started { .. })));
    match report.outcome_of(b.id) {
        Some(Outcome::Failed { error }) => assert!(error.contains("not ready"), "{error}"),
        other => panic!("unexpected outcome for b: {other:?}"),
    }

    let b_view = t.engine.service(b.id).unwrap();
    assert_eq!(b_view.status, Status::Stopped);
    assert_eq!(b_view.pid, None);

    t.engine.shutdown().await.unwrap();
}

#[smol_potat::test]
async fn test_stop_all_reverses_dependency_chain() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());

    let a = shell("a", dir.path(), LONG_RUNNING);
    let b = shell("b", dir.path(), LONG_RUNNING).depends_on(a.id);
    let c = shell("c", dir.path(), LONG_RUNNING).depends_on(b.id);
    t.engine
        .add_services(vec![c.clone(), a.clone(), b.clone()])
        .await
        .unwrap();

    let started = t.engine.start_all(&ProfileContext::all()).await.unwrap();
    let names: Vec<_> = started.outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["a", "b", "c"]);

    let sub = t.engine.subscribe();
    let stopped = t.engine.stop_all(&ProfileContext::all()).await.unwrap();
    let names: Vec<_> = stopped.outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["c", "b", "a"]);
    assert!(
        stopped
            .outcomes
            .iter()
            .all(|o| o.outcome == Outcome::Stopped { forced: false })
    );

    let mut stopping = Vec::new();
    while let Some(event) = sub.try_recv() {
        if let ChangeKind::StatusChanged {
            to: Status::Stopping,
            ..
        } = event.kind
        {
            stopping.push(event.service_name);
        }
    }
    assert_eq!(stopping, vec!["c", "b", "a"]);
}

#[smol_potat::test]
async fn test_crash_is_restarted_within_budget() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());

    // Fails on the first run only
    let flaky = shell(
        "flaky",
        dir.path(),
        "if [ -f started ]; then exec sleep 30; else touch started; sleep 0.2; exit 1; fi",
    );
    let id = t.engine.add_service(flaky).await.unwrap();
    t.engine
        .start_service(id, &ProfileContext::all())
        .await
        .unwrap();

    let tracker = t.engine.tracker().clone();
    assert!(
        eventually(|| {
            let kinds: Vec<_> = tracker.events(id).iter().map(|e| e.kind).collect();
            kinds.contains(&UptimeEventKind::Crashed)
                && kinds.iter().filter(|k| **k == UptimeEventKind::Started).count() == 2
        })
        .await
    );
    assert!(eventually(|| t.engine.service(id).unwrap().status == Status::Running).await);

    let stats = t.engine.stats(id, Duration::from_secs(3600)).unwrap();
    assert_eq!(stats.total_restarts, 1);
    assert!(stats.uptime_percent < 100.0);

    t.engine.shutdown().await.unwrap();
}

#[smol_potat::test]
async fn test_restart_budget_exhaustion_leaves_service_crashed() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.restart.max_retries = 2;
    config.restart.initial_backoff_ms = 20;
    let t = engine(config);

    let id = t
        .engine
        .add_service(shell("broken", dir.path(), "exit 7"))
        .await
        .unwrap();
    t.engine
        .start_service(id, &ProfileContext::all())
        .await
        .unwrap();

    let tracker = t.engine.tracker().clone();
    let starts = || {
        tracker
            .events(id)
            .iter()
            .filter(|e| e.kind == UptimeEventKind::Started)
            .count()
    };
    let exhausted = || starts() == 3 && t.engine.service(id).unwrap().status == Status::Crashed;
    assert!(eventually(exhausted).await);

    smol::Timer::after(Duration::from_millis(400)).await;
    assert_eq!(starts(), 3);
    assert_eq!(t.engine.service(id).unwrap().status, Status::Crashed);
    assert_eq!(t.engine.service(id).unwrap().metrics.restart_attempts, 2);
}

#[smol_potat::test]
async fn test_start_and_stop_are_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());
    let id = t
        .engine
        .add_service(shell("api", dir.path(), LONG_RUNNING))
        .await
        .unwrap();
    let ctx = ProfileContext::all();

    let Outcome::Started { pid } = t.engine.start_service(id, &ctx).await.unwrap() else {
        panic!("first start should launch");
    };
    assert_eq!(
        t.engine.start_service(id, &ctx).await.unwrap(),
        Outcome::AlreadyRunning
    );
    assert_eq!(t.engine.service(id).unwrap().pid, Some(pid));

    assert_eq!(
        t.engine.stop_service(id).await.unwrap(),
        Outcome::Stopped { forced: false }
    );
    assert_eq!(
        t.engine.stop_service(id).await.unwrap(),
        Outcome::AlreadyStopped
    );
    assert!(!process_launcher::is_alive(pid));
}

#[smol_potat::test]
async fn test_concurrent_start_fails_fast() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());

    let db = shell("db", dir.path(), LONG_RUNNING);
    let api = shell("api", dir.path(), LONG_RUNNING).with_dependency(
        DependencyEdge::new(service_id_for_name("api"), db.id).with_wait(Duration::from_millis(800)),
    );
    t.engine.add_services(vec![db, api.clone()]).await.unwrap();

    // The first start parks in the dependency wait holding the guard
    let engine = t.engine.clone();
    let api_id = api.id;
    let first = smol::spawn(async move { engine.start_service(api_id, &ProfileContext::all()).await });
    smol::Timer::after(Duration::from_millis(100)).await;

    let err = t
        .engine
        .start_service(api.id, &ProfileContext::all())
        .await
        .unwrap_err();
    assert!(matches!(err, Error::AlreadyInProgress { .. }));
    assert!(matches!(first.await, Err(Error::DependencyNotReady { .. })));
}

#[smol_potat::test]
async fn test_occupied_port_without_owner_is_a_conflict() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());
    let listener = std::net::TcpListener::bind(("0.0.0.0", 0)).unwrap();
    let port = listener.local_addr().unwrap().port();

    let id = t
        .engine
        .add_service(shell("web", dir.path(), LONG_RUNNING).with_port(port))
        .await
        .unwrap();
    let err = t
        .engine
        .start_service(id, &ProfileContext::all())
        .await
        .unwrap_err();
    match err {
        Error::PortConflict { port: p, cleanup, .. } => {
            assert_eq!(p, port);
            assert_eq!(cleanup.found, 0);
        }
        other => panic!("expected a port conflict, got {other}"),
    }
    assert_eq!(t.engine.service(id).unwrap().status, Status::Stopped);
    drop(listener);
}

#[smol_potat::test]
async fn test_environment_layers_and_logs() {
    let projects = tempfile::tempdir().unwrap();
    std::fs::create_dir(projects.path().join("svc")).unwrap();

    let mut config = fast_config();
    config.env = BTreeMap::from([
        ("LAYER_A".to_string(), "global".to_string()),
        ("LAYER_B".to_string(), "global".to_string()),
        ("LAYER_C".to_string(), "global".to_string()),
    ]);
    let t = engine(config);

    let service = shell(
        "svc",
        std::path::Path::new("svc"),
        "echo \"$LAYER_A $LAYER_B $LAYER_C $(basename \"$PWD\")\"; echo 'WARN low disk' >&2; exec sleep 30",
    )
    .with_env("LAYER_C", "service");
    let id = t.engine.add_service(service).await.unwrap();

    let ctx = ProfileContext {
        projects_dir_override: Some(projects.path().to_path_buf()),
        env_overrides: BTreeMap::from([
            ("LAYER_B".to_string(), "profile".to_string()),
            ("LAYER_C".to_string(), "profile".to_string()),
        ]),
        ..ProfileContext::all()
    };
    t.engine.start_service(id, &ctx).await.unwrap();

    assert!(eventually(|| t.engine.logs(id, &LogQuery::default()).unwrap().len() == 2).await);
    let stdout = t
        .engine
        .logs(
            id,
            &LogQuery {
                contains: Some("global".into()),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(stdout[0].line, "global profile service svc");

    let warnings = t
        .engine
        .logs(
            id,
            &LogQuery {
                min_level: Some(process_launcher::LogLevel::Warn),
                ..Default::default()
            },
        )
        .unwrap();
    assert_eq!(warnings.len(), 1);

    let stored = t.engine.stored_logs(id, &LogQuery::default()).await.unwrap();
    assert_eq!(stored.len(), 2);

    t.engine.shutdown().await.unwrap();
}

#[smol_potat::test]
async fn test_restart_service_launches_new_process() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());
    let id = t
        .engine
        .add_service(shell("api", dir.path(), LONG_RUNNING))
        .await
        .unwrap();
    let ctx = ProfileContext::all();

    let Outcome::Started { pid: first } = t.engine.start_service(id, &ctx).await.unwrap() else {
        panic!("expected a launch");
    };
    let Outcome::Started { pid: second } = t.engine.restart_service(id, &ctx).await.unwrap() else {
        panic!("expected a relaunch");
    };
    assert_ne!(first, second);
    assert!(!process_launcher::is_alive(first));
    assert_eq!(t.engine.service(id).unwrap().pid, Some(second));

    t.engine.shutdown().await.unwrap();
}

#[smol_potat::test]
async fn test_tiered_batch_start() {
    let dir = tempfile::tempdir().unwrap();
    let mut config = fast_config();
    config.batch_mode = BatchMode::Tiered;
    let t = engine(config);

    let db = shell("db", dir.path(), LONG_RUNNING);
    let cache = shell("cache", dir.path(), LONG_RUNNING);
    let api = shell("api", dir.path(), LONG_RUNNING)
        .depends_on(db.id)
        .depends_on(cache.id);
    t.engine
        .add_services(vec![api.clone(), db.clone(), cache.clone()])
        .await
        .unwrap();

    let tiers = t.engine.tiers(None).unwrap();
    assert_eq!(tiers.len(), 2);
    assert_eq!(tiers[1], vec![api.id]);

    let report = t.engine.start_all(&ProfileContext::all()).await.unwrap();
    assert_eq!(report.outcomes.len(), 3);
    assert_eq!(report.outcomes[2].id, api.id);
    assert!(t.engine.services().iter().all(|v| v.status == Status::Running));

    t.engine.shutdown().await.unwrap();
}

#[smol_potat::test]
async fn test_profile_scope_limits_batch() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());
    let a = shell("a", dir.path(), LONG_RUNNING);
    let b = shell("b", dir.path(), LONG_RUNNING);
    t.engine.add_services(vec![a.clone(), b.clone()]).await.unwrap();

    let report = t
        .engine
        .start_all(&ProfileContext::scoped([b.id]))
        .await
        .unwrap();
    assert_eq!(report.outcomes.len(), 1);
    assert_eq!(t.engine.service(a.id).unwrap().status, Status::Stopped);
    assert_eq!(t.engine.service(b.id).unwrap().status, Status::Running);

    t.engine.shutdown().await.unwrap();
}

#[smol_potat::test]
async fn test_shutdown_stops_everything_and_rejects_starts() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());
    let a = shell("a", dir.path(), LONG_RUNNING);
    let b = shell("b", dir.path(), "trap '' TERM; while true; do sleep 1; done");
    t.engine.add_services(vec![a.clone(), b.clone()]).await.unwrap();
    t.engine.start_all(&ProfileContext::all()).await.unwrap();
    let pids: Vec<u32> = t.engine.services().iter().filter_map(|v| v.pid).collect();
    assert_eq!(pids.len(), 2);

    let report = t.engine.shutdown().await.unwrap();
    assert_eq!(report.outcomes.len(), 2);
    assert_eq!(
        report.outcome_of(b.id),
        Some(&Outcome::Stopped { forced: true })
    );
    assert!(t.engine.services().iter().all(|v| v.status == Status::Stopped));
    assert!(pids.iter().all(|pid| !process_launcher::is_alive(*pid)));

    assert!(matches!(
        t.engine.start_service(a.id, &ProfileContext::all()).await,
        Err(Error::ShuttingDown)
    ));
}

#[smol_potat::test]
async fn test_shutdown_deadline_force_kills_stubborn_service() {
    let dir = tempfile::tempdir().unwrap();
    let config = service_orchestration::EngineConfig {
        stop_timeout_ms: 3_000,
        shutdown_deadline_ms: 300,
        ..fast_config()
    };
    let t = engine(config);
    let stubborn = shell("stubborn", dir.path(), "trap '' TERM; while true; do sleep 1; done");
    t.engine.add_service(stubborn.clone()).await.unwrap();
    t.engine
        .start_service(stubborn.id, &ProfileContext::all())
        .await
        .unwrap();
    let pid = t.engine.service(stubborn.id).unwrap().pid.unwrap();
    smol::Timer::after(Duration::from_millis(200)).await;

    let report = t.engine.shutdown().await.unwrap();
    assert_eq!(
        report.outcome_of(stubborn.id),
        Some(&Outcome::Stopped { forced: true })
    );
    let view = t.engine.service(stubborn.id).unwrap();
    assert_eq!(view.status, Status::Stopped);
    assert_eq!(view.pid, None);
    assert!(!process_launcher::is_alive(pid));
}

#[smol_potat::test]
async fn test_stop_all_includes_services_added_after_start_all() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());
    let a = shell("a", dir.path(), LONG_RUNNING);
    t.engine.add_service(a.clone()).await.unwrap();
    t.engine.start_all(&ProfileContext::all()).await.unwrap();

    let b = shell("b", dir.path(), LONG_RUNNING).depends_on(a.id);
    t.engine.add_service(b.clone()).await.unwrap();
    t.engine
        .start_service(b.id, &ProfileContext::all())
        .await
        .unwrap();
    let b_pid = t.engine.service(b.id).unwrap().pid.unwrap();

    let report = t.engine.stop_all(&ProfileContext::all()).await.unwrap();
    let names: Vec<&str> = report.outcomes.iter().map(|o| o.name.as_str()).collect();
    assert_eq!(names, vec!["b", "a"]);
    assert_eq!(t.engine.service(b.id).unwrap().status, Status::Stopped);
    assert!(!process_launcher::is_alive(b_pid));

    t.engine.shutdown().await.unwrap();
}

#[smol_potat::test]
async fn test_delete_respects_dependents_and_stops_first() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());
    let db = shell("db", dir.path(), LONG_RUNNING);
    let api = shell("api", dir.path(), LONG_RUNNING).depends_on(db.id);
    t.engine.add_services(vec![db.clone(), api.clone()]).await.unwrap();
    t.engine
        .start_service(db.id, &ProfileContext::all())
        .await
        .unwrap();
    let pid = t.engine.service(db.id).unwrap().pid.unwrap();

    let err = t.engine.delete_service(db.id, false).await.unwrap_err();
    assert!(err.is_configuration());
    assert!(process_launcher::is_alive(pid));

    t.engine.delete_service(db.id, true).await.unwrap();
    assert!(!process_launcher::is_alive(pid));
    assert!(t.engine.service(db.id).is_err());
    assert!(t.engine.service(api.id).unwrap().service.dependencies.is_empty());
}

#[smol_potat::test]
async fn test_cycle_rejected_before_batch() {
    let dir = tempfile::tempdir().unwrap();
    let t = engine(fast_config());
    let a = shell("a", dir.path(), LONG_RUNNING);
    let b = shell("b", dir.path(), LONG_RUNNING).depends_on(a.id);
    t.engine.add_services(vec![a.clone(), b.clone()]).await.unwrap();

    let err = t
        .engine
        .set_dependencies(a.id, vec![DependencyEdge::new(a.id, b.id)])
        .await
        .unwrap_err();
    assert!(err.is_configuration());
    assert!(t.engine.validate(None).is_empty());
}
