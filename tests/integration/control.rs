//! Control endpoint round trips against the full reload pipeline

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;

use haproxy_supervisor::config::ControlAddress;
use haproxy_supervisor::haproxy::HaproxyDaemon;
use haproxy_supervisor::netqueue::NullNetQueue;
use haproxy_supervisor::reload::ReloadController;
use haproxy_supervisor::ControlServer;

use super::util::{count_lines, temp_path, write_script};

async fn post_reload(addr: SocketAddr) -> String {
    let mut stream = TcpStream::connect(addr).await.unwrap();
    stream
        .write_all(
            b"POST /reload HTTP/1.1\r\nHost: control\r\nContent-Length: 0\r\nConnection: close\r\n\r\n",
        )
        .await
        .unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).await.unwrap();
    response
}

#[tokio::test]
async fn test_ten_concurrent_posts_all_succeed_with_coalescing() {
    let spawn_log = temp_path("ctl-spawn-log");
    let script = write_script(
        "ctl-slow-haproxy",
        &format!("#!/bin/sh\necho spawn >> {}\nsleep 0.2\n", spawn_log.display()),
    );
    let daemon = HaproxyDaemon::new(&script, temp_path("no-pidfile"), "/dev/null");
    let controller = Arc::new(ReloadController::new(
        Arc::new(daemon),
        Arc::new(NullNetQueue),
    ));

    let address = ControlAddress::Http("127.0.0.1:0".parse().unwrap());
    let server = ControlServer::bind(&address, controller).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_sender();
    let server_handle = tokio::spawn(server.run());

    let first = tokio::spawn(post_reload(addr));
    tokio::time::sleep(Duration::from_millis(50)).await;

    let mut others = Vec::new();
    for _ in 0..9 {
        others.push(tokio::spawn(post_reload(addr)));
    }

    let response = first.await.unwrap();
    assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    for task in others {
        let response = task.await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"), "got: {response}");
    }

    let spawns = count_lines(&spawn_log);
    assert!(
        (1..=2).contains(&spawns),
        "expected 1 or 2 spawns, got {spawns}"
    );

    let _ = shutdown.send(());
    server_handle.await.unwrap().unwrap();
    std::fs::remove_file(&script).ok();
    std::fs::remove_file(&spawn_log).ok();
}

#[tokio::test]
async fn test_reload_failure_body_carries_error_text() {
    let script = write_script("ctl-failing-haproxy", "#!/bin/sh\nexit 1\n");
    let daemon = HaproxyDaemon::new(&script, temp_path("no-pidfile"), "/dev/null");
    let controller = Arc::new(ReloadController::new(
        Arc::new(daemon),
        Arc::new(NullNetQueue),
    ));

    let address = ControlAddress::Http("127.0.0.1:0".parse().unwrap());
    let server = ControlServer::bind(&address, controller).await.unwrap();
    let addr = server.local_addr().unwrap();
    let shutdown = server.shutdown_sender();
    let server_handle = tokio::spawn(server.run());

    let response = post_reload(addr).await;
    assert!(response.starts_with("HTTP/1.1 500"), "got: {response}");
    assert!(
        response.contains("couldn't reload configuration"),
        "error text missing from body: {response}"
    );

    let _ = shutdown.send(());
    server_handle.await.unwrap().unwrap();
    std::fs::remove_file(&script).ok();
}
