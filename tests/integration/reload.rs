//! Reload pipeline tests against a scripted stand-in for haproxy

use std::sync::Arc;
use std::time::{Duration, Instant};

use haproxy_supervisor::error::ReloadError;
use haproxy_supervisor::haproxy::HaproxyDaemon;
use haproxy_supervisor::netqueue::NullNetQueue;
use haproxy_supervisor::reload::{ReloadController, ReloadState};

use super::util::{count_lines, temp_path, write_script};

fn controller(daemon: HaproxyDaemon) -> Arc<ReloadController> {
    Arc::new(ReloadController::new(
        Arc::new(daemon),
        Arc::new(NullNetQueue),
    ))
}

#[tokio::test]
async fn test_coalesced_reloads_spawn_at_most_twice() {
    let spawn_log = temp_path("spawn-log");
    let script = write_script(
        "slow-haproxy",
        &format!("#!/bin/sh\necho spawn >> {}\nsleep 0.3\n", spawn_log.display()),
    );
    let daemon = HaproxyDaemon::new(&script, temp_path("no-pidfile"), "/dev/null");
    let ctl = controller(daemon);

    // One reload in flight, nine more arriving during it: one queued
    // follow-up, the rest collapsed.
    let first = {
        let ctl = Arc::clone(&ctl);
        tokio::spawn(async move { ctl.reload().await })
    };
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut others = Vec::new();
    for _ in 0..9 {
        let ctl = Arc::clone(&ctl);
        others.push(tokio::spawn(async move { ctl.reload().await }));
    }

    first.await.unwrap().unwrap();
    for task in others {
        task.await.unwrap().unwrap();
    }

    let spawns = count_lines(&spawn_log);
    assert!(
        (1..=2).contains(&spawns),
        "expected 1 or 2 spawns, got {spawns}"
    );
    assert_eq!(ctl.state(), ReloadState::Idle);

    std::fs::remove_file(&script).ok();
    std::fs::remove_file(&spawn_log).ok();
}

#[tokio::test]
async fn test_reload_timeout_bounds_spawn_wall_time() {
    let script = write_script("stuck-haproxy", "#!/bin/sh\nsleep 5\n");
    let daemon = HaproxyDaemon::new(&script, temp_path("no-pidfile"), "/dev/null")
        .with_spawn_timeout(Duration::from_millis(300));
    let ctl = controller(daemon);

    let start = Instant::now();
    let err = ctl.reload().await.unwrap_err();
    assert!(matches!(err, ReloadError::Timeout { .. }), "got: {err:?}");
    assert!(
        start.elapsed() < Duration::from_secs(2),
        "timeout did not bound the spawn"
    );
    assert_eq!(ctl.state(), ReloadState::Idle);

    std::fs::remove_file(&script).ok();
}

#[tokio::test]
async fn test_reload_passes_sf_with_old_pids() {
    let args_log = temp_path("args-log");
    let script = write_script(
        "arg-recorder",
        &format!("#!/bin/sh\necho \"$@\" >> {}\n", args_log.display()),
    );

    // A pidfile naming our own (alive) pid makes the driver treat the proxy
    // as running and request a graceful handover.
    let pidfile = temp_path("pidfile");
    std::fs::write(&pidfile, format!("{}\n", std::process::id())).unwrap();

    let daemon = HaproxyDaemon::new(&script, &pidfile, "/dev/null");
    let ctl = controller(daemon);
    ctl.reload().await.unwrap();

    let recorded = std::fs::read_to_string(&args_log).unwrap();
    assert!(
        recorded.contains(&format!("-sf {}", std::process::id())),
        "expected -sf with the old pid, got: {recorded}"
    );

    std::fs::remove_file(&script).ok();
    std::fs::remove_file(&pidfile).ok();
    std::fs::remove_file(&args_log).ok();
}

#[tokio::test]
async fn test_failed_spawn_surfaces_exit_error() {
    let script = write_script("failing-haproxy", "#!/bin/sh\nexit 3\n");
    let daemon = HaproxyDaemon::new(&script, temp_path("no-pidfile"), "/dev/null");
    let ctl = controller(daemon);

    let err = ctl.reload().await.unwrap_err();
    assert!(matches!(err, ReloadError::Exit { .. }), "got: {err:?}");
    assert_eq!(ctl.state(), ReloadState::Idle);

    std::fs::remove_file(&script).ok();
}
