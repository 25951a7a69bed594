//! Helpers for crate-internal tests that need a live manager with
//! hand-built worker entries.

use crate::clock::now_usec;
use crate::config::ManagerConfig;
use crate::link::Connection;
use crate::manager::Manager;
use crate::resources::Resource;
use crate::worker::{WorkerEntry, WorkerId, WorkerType};

pub(crate) async fn test_manager() -> Manager {
    Manager::listen(ManagerConfig {
        port: 0,
        ..ManagerConfig::default()
    })
    .await
    .expect("bind test manager")
}

/// Attach a synthetic ready worker backed by a real socket pair. The
/// returned client stream must be kept alive for sends to succeed.
pub(crate) async fn attach_worker(
    m: &mut Manager,
    hostname: &str,
) -> (WorkerId, tokio::net::TcpStream) {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0")
        .await
        .expect("bind helper listener");
    let addr = listener.local_addr().expect("helper addr");
    let client = tokio::net::TcpStream::connect(addr)
        .await
        .expect("connect helper");
    let (server, peer) = listener.accept().await.expect("accept helper");

    let id = m.next_worker_id;
    m.next_worker_id += 1;
    let mut w = WorkerEntry::new(id, Connection::new(server, peer), now_usec());
    w.hostname = hostname.to_string();
    w.kind = WorkerType::Worker;
    w.authenticated = true;
    let dim = |total| Resource {
        total,
        inuse: 0,
        smallest: total,
        largest: total,
    };
    w.resources.cores = dim(4);
    w.resources.memory = dim(4096);
    w.resources.disk = dim(10240);
    w.resources.gpus = dim(0);
    w.resources.workers = dim(1);
    m.workers.insert(id, w);
    m.find_max_worker();
    (id, client)
}
