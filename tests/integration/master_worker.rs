//! Master-worker driver lifecycle against a scripted master process

use std::time::Duration;

use haproxy_supervisor::haproxy::{HaproxyMasterWorker, HaproxyServer};

use super::util::{temp_path, write_script};

/// A stand-in master that survives `SIGUSR2` the way the real one does.
fn master_script() -> std::path::PathBuf {
    write_script(
        "master",
        "#!/bin/sh\ntrap ':' USR2\nwhile :; do sleep 1; done\n",
    )
}

#[tokio::test]
async fn test_master_pid_stable_across_reloads() {
    let script = master_script();
    let driver = HaproxyMasterWorker::new(&script, temp_path("mw-pidfile"), "/dev/null");

    driver.start().await.unwrap();
    assert!(driver.is_running());
    let master = driver.master_pid().unwrap();

    // let the script install its USR2 trap before signalling it
    tokio::time::sleep(Duration::from_millis(100)).await;

    for _ in 0..10 {
        driver.reload().await.unwrap();
        assert_eq!(driver.master_pid(), Some(master));
    }
    // the signal must not have killed the master
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert!(driver.is_running());

    driver.stop().await.unwrap();
    assert!(driver.master_pid().is_none() || !driver.is_running());

    std::fs::remove_file(&script).ok();
}

#[tokio::test]
async fn test_start_twice_is_rejected() {
    let script = master_script();
    let driver = HaproxyMasterWorker::new(&script, temp_path("mw-pidfile"), "/dev/null");

    driver.start().await.unwrap();
    assert!(driver.start().await.is_err());

    driver.stop().await.unwrap();
    std::fs::remove_file(&script).ok();
}

#[tokio::test]
async fn test_reload_degrades_to_start_when_master_gone() {
    let script = master_script();
    let driver = HaproxyMasterWorker::new(&script, temp_path("mw-pidfile"), "/dev/null");

    // never started: reload must behave like start
    driver.reload().await.unwrap();
    assert!(driver.is_running());

    driver.stop().await.unwrap();
    std::fs::remove_file(&script).ok();
}
