//! Hold queue behaviour
//!
//! The kernel-backed scenarios need root, iptables and the nfnetlink_queue
//! module; they are `#[ignore]`d so the default suite runs unprivileged.

use std::net::IpAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use haproxy_supervisor::netqueue::new_net_queue;
use haproxy_supervisor::proc::ProcNetfilter;

#[tokio::test]
async fn test_null_queue_never_touches_kernel() {
    const QUEUE: u16 = 313;
    let queue = new_net_queue(QUEUE, Vec::new()).unwrap();

    queue.capture().await.unwrap();
    queue.release().await.unwrap();

    // With no IPs configured nothing may be bound in the kernel. The proc
    // file only exists when the module is loaded; skip the check otherwise.
    if let Ok(pn) = ProcNetfilter::new() {
        assert!(pn.get(QUEUE).is_none(), "null queue bound a kernel queue");
    }

    queue.stop().await;
}

#[tokio::test]
#[ignore = "requires root, iptables and the nfnetlink_queue module"]
async fn test_hold_window_drains_after_release() {
    const QUEUE: u16 = 311;
    const REQUESTS: usize = 100;

    let ip: IpAddr = "127.0.1.100".parse().unwrap();
    let queue = new_net_queue(QUEUE, vec![ip]).unwrap();

    let listener = tokio::net::TcpListener::bind(("127.0.1.100", 0))
        .await
        .unwrap();
    let addr = listener.local_addr().unwrap();
    let accept_task = tokio::spawn(async move {
        while let Ok((_stream, _)) = listener.accept().await {}
    });

    queue.capture().await.unwrap();

    let released = Arc::new(AtomicBool::new(false));
    let mut clients = Vec::new();
    for _ in 0..REQUESTS {
        let released = Arc::clone(&released);
        clients.push(tokio::spawn(async move {
            let stream = tokio::net::TcpStream::connect(addr).await.unwrap();
            assert!(
                released.load(Ordering::SeqCst),
                "connection completed before release"
            );
            drop(stream);
        }));
    }

    // wait until the kernel reports all SYNs held
    let pn = ProcNetfilter::new().unwrap();
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        pn.refresh().unwrap();
        if pn.get(QUEUE).map_or(0, |q| q.waiting) >= REQUESTS as u64 {
            break;
        }
        assert!(
            Instant::now() < deadline,
            "timed out waiting for held SYNs, waiting={}",
            pn.get(QUEUE).map_or(0, |q| q.waiting)
        );
        tokio::time::sleep(Duration::from_millis(5)).await;
    }

    released.store(true, Ordering::SeqCst);
    queue.release().await.unwrap();

    for client in clients {
        tokio::time::timeout(Duration::from_secs(2), client)
            .await
            .expect("client did not complete after release")
            .unwrap();
    }

    pn.refresh().unwrap();
    let counters = pn.get(QUEUE).unwrap();
    assert_eq!(counters.queue_dropped, 0, "kernel dropped held packets");
    assert_eq!(counters.user_dropped, 0, "packets lost before user space");

    queue.stop().await;
    accept_task.abort();
}

#[tokio::test]
#[ignore = "requires root, iptables and the nfnetlink_queue module"]
async fn test_stop_unbinds_kernel_queue() {
    const QUEUE: u16 = 312;
    let queue = new_net_queue(QUEUE, vec!["127.0.1.101".parse().unwrap()]).unwrap();

    let pn = ProcNetfilter::new().unwrap();
    pn.refresh().unwrap();
    assert!(pn.get(QUEUE).is_some(), "bound queue missing from proc");

    queue.stop().await;

    pn.refresh().unwrap();
    assert!(pn.get(QUEUE).is_none(), "queue still bound after stop");
}
