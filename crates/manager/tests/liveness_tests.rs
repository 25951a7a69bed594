mod common;

use std::time::Duration;

use taskmill_manager::{Manager, ManagerConfig};

use common::FakeWorker;

#[tokio::test]
async fn silent_worker_is_removed_after_keepalive_timeout() -> anyhow::Result<()> {
    let mut m = Manager::listen(ManagerConfig {
        port: 0,
        keepalive_interval: 1,
        keepalive_timeout: 1,
        ..ManagerConfig::default()
    })
    .await?;
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = FakeWorker::connect(port).await?;
        w.handshake("mute-node").await?;
        w.declare_resources(2, 1024, 1024, 0).await?;
        // Go completely silent; never answer the keepalive check.
        tokio::time::sleep(Duration::from_secs(30)).await;
        anyhow::Ok(())
    });

    let _ = m.wait(Some(Duration::from_secs(5))).await;

    let stats = m.stats();
    assert_eq!(stats.workers_connected, 0);
    assert!(stats.workers_lost >= 1);

    worker.abort();
    let _ = worker.await;
    Ok(())
}

#[tokio::test]
async fn worker_that_never_handshakes_is_reaped() -> anyhow::Result<()> {
    let mut m = Manager::listen(ManagerConfig {
        port: 0,
        keepalive_interval: 1,
        keepalive_timeout: 1,
        ..ManagerConfig::default()
    })
    .await?;
    let port = m.port();

    let stream = tokio::net::TcpStream::connect(("127.0.0.1", port)).await?;

    let _ = m.wait(Some(Duration::from_secs(4))).await;

    let stats = m.stats();
    assert_eq!(stats.workers_init, 0);
    assert_eq!(stats.workers_connected, 0);

    drop(stream);
    Ok(())
}

#[tokio::test]
async fn draining_worker_is_released_once_idle() -> anyhow::Result<()> {
    let mut m = Manager::listen(ManagerConfig {
        port: 0,
        ..ManagerConfig::default()
    })
    .await?;
    let port = m.port();

    let worker = tokio::spawn(async move {
        let mut w = FakeWorker::connect(port).await?;
        w.handshake("drain-node").await?;
        w.declare_resources(2, 1024, 1024, 0).await?;
        // Expect a release (or exit) once marked draining.
        loop {
            let line = w.read_line().await?;
            if line == "release" || line == "exit" {
                return anyhow::Ok(line);
            }
            if line == "check" {
                w.send("alive").await?;
            }
        }
    });

    // Let the worker register, then drain it.
    let _ = m.wait(Some(Duration::from_millis(500))).await;
    assert_eq!(m.stats().workers_connected, 1);
    assert_eq!(m.set_draining_by_hostname("drain-node", true), 1);

    let _ = m.wait(Some(Duration::from_secs(3))).await;
    assert_eq!(m.stats().workers_connected, 0);
    assert_eq!(m.stats().workers_released, 1);

    let line = worker.await??;
    assert!(line == "release" || line == "exit");
    Ok(())
}
