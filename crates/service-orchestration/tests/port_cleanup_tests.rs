//! Port reclamation against real processes reported by a fake scanner

mod common;

use common::{FakeScanner, engine, fast_config};
use service_orchestration::PortReclaimer;
use std::process::{Child, Command};
use std::sync::Arc;
use std::time::Duration;

fn sleeper() -> Child {
    Command::new("sleep").arg("30").spawn().unwrap()
}

fn reaped(child: &mut Child) -> bool {
    matches!(child.try_wait(), Ok(Some(_)))
}

#[smol_potat::test]
async fn test_cleanup_kills_every_listener() {
    let scanner = Arc::new(FakeScanner::default());
    let reclaimer = PortReclaimer::new(scanner.clone(), Duration::from_millis(500));
    let mut first = sleeper();
    let mut second = sleeper();
    scanner.set(8080, vec![second.id(), first.id()]);

    let result = reclaimer.cleanup(8080, None).await.unwrap();
    assert_eq!(result.port, 8080);
    assert_eq!(result.found, 2);
    assert_eq!(result.killed + result.errors.len(), 2);
    assert_eq!(result.killed, 2, "errors: {:?}", result.errors);
    let mut expected = vec![first.id(), second.id()];
    expected.sort();
    assert_eq!(result.pids, expected);
    assert!(result.is_clean());

    assert!(reaped(&mut first));
    assert!(reaped(&mut second));

    // Nothing listens any more
    scanner.clear(8080);
    let again = reclaimer.cleanup(8080, None).await.unwrap();
    assert_eq!(again.found, 0);
    assert_eq!(again.killed, 0);
    assert!(again.errors.is_empty());
}

#[smol_potat::test]
async fn test_cleanup_spares_excluded_and_own_pid() {
    let scanner = Arc::new(FakeScanner::default());
    let reclaimer = PortReclaimer::new(scanner.clone(), Duration::from_millis(500));
    let mut keep = sleeper();
    let mut victim = sleeper();
    scanner.set(
        9090,
        vec![keep.id(), victim.id(), std::process::id(), 0],
    );

    let result = reclaimer.cleanup(9090, Some(keep.id())).await.unwrap();
    assert_eq!(result.found, 1);
    assert_eq!(result.pids, vec![victim.id()]);
    assert_eq!(result.killed, 1);

    assert!(reaped(&mut victim));
    assert!(!reaped(&mut keep));
    keep.kill().unwrap();
    keep.wait().unwrap();
}

#[smol_potat::test]
async fn test_term_ignoring_listener_is_force_killed() {
    let scanner = Arc::new(FakeScanner::default());
    let reclaimer = PortReclaimer::new(scanner.clone(), Duration::from_millis(200));
    let mut stubborn = Command::new("sh")
        .args(["-c", "trap '' TERM; while true; do sleep 1; done"])
        .spawn()
        .unwrap();
    // Let the shell install its trap
    smol::Timer::after(Duration::from_millis(200)).await;
    scanner.set(7070, vec![stubborn.id()]);

    let result = reclaimer.cleanup(7070, None).await.unwrap();
    assert_eq!(result.found, 1);
    assert_eq!(result.killed, 1, "errors: {:?}", result.errors);
    assert!(reaped(&mut stubborn));
}

#[smol_potat::test]
async fn test_engine_cleanup_port_passthrough() {
    let t = engine(fast_config());
    let mut child = sleeper();
    t.scanner.set(6060, vec![child.id()]);

    let result = t.engine.cleanup_port(6060).await.unwrap();
    assert_eq!(result.found, 1);
    assert_eq!(result.killed, 1);
    assert!(reaped(&mut child));
}
