use std::collections::{HashMap, HashSet};

use crate::link::Connection;
use crate::resources::{ResourceSummary, WorkerResources};

/// Integer handle identifying one worker connection for the lifetime of the
/// manager. Assigned at accept and never reused.
pub(crate) type WorkerId = u64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerType {
    Unknown,
    Worker,
    Status,
}

/// Why a worker is being removed; folded into the transaction log and
/// the disconnect counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum DisconnectReason {
    Explicit,
    StatusQuery,
    IdleOut,
    Slow,
    Failure,
}

impl DisconnectReason {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            DisconnectReason::Explicit => "RELEASED",
            DisconnectReason::StatusQuery => "STATUS",
            DisconnectReason::IdleOut => "IDLE_OUT",
            DisconnectReason::Slow => "SLOW",
            DisconnectReason::Failure => "FAILURE",
        }
    }
}

/// A cache entry the worker has (or is acquiring), as seen by the manager.
#[derive(Debug, Clone)]
pub(crate) struct RemoteFileInfo {
    pub(crate) size: i64,
    pub(crate) in_cache: bool,
    pub(crate) transfer_time: u64,
}

impl RemoteFileInfo {
    pub(crate) fn pending(size: i64) -> RemoteFileInfo {
        RemoteFileInfo {
            size,
            in_cache: false,
            transfer_time: 0,
        }
    }
}

/// Lifetime counters a worker reports through `info` messages; folded into
/// the manager's disconnected-worker totals when the worker leaves.
#[derive(Debug, Default, Clone, Copy)]
pub(crate) struct WorkerReportedStats {
    pub(crate) tasks_waiting: i64,
    pub(crate) tasks_running: i64,
    pub(crate) time_send: u64,
    pub(crate) time_receive: u64,
    pub(crate) time_execute: u64,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

/// Everything the manager tracks about one connection.
#[derive(Debug)]
pub(crate) struct WorkerEntry {
    pub(crate) id: WorkerId,
    pub(crate) link: Connection,
    pub(crate) addrport: String,
    pub(crate) hostname: String,
    pub(crate) os: String,
    pub(crate) arch: String,
    pub(crate) version: String,
    pub(crate) worker_uuid: Option<String>,
    pub(crate) kind: WorkerType,
    pub(crate) authenticated: bool,
    pub(crate) challenge_nonce: Option<String>,

    pub(crate) resources: WorkerResources,
    pub(crate) coprocess_resources: WorkerResources,
    pub(crate) features: HashSet<String>,
    /// Cache contents confirmed (or being acquired) on this worker.
    pub(crate) files: HashMap<String, RemoteFileInfo>,
    /// Running task ids and their allocation envelopes.
    pub(crate) task_envelopes: HashMap<u64, ResourceSummary>,

    /// Address the worker accepts peer transfers on, once announced.
    pub(crate) transfer_addr: Option<(String, u16)>,

    pub(crate) factory_name: Option<String>,
    pub(crate) draining: bool,
    pub(crate) alarm_slow_worker: bool,
    /// Worker-announced shutdown deadline, microseconds since epoch.
    pub(crate) end_time: Option<u64>,

    pub(crate) start_time: u64,
    pub(crate) last_msg_recv_time: u64,
    pub(crate) last_keepalive_sent_time: u64,

    pub(crate) finished_tasks: i64,
    pub(crate) total_tasks_complete: u64,
    pub(crate) total_task_time: u64,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
    pub(crate) reported: WorkerReportedStats,
}

impl WorkerEntry {
    pub(crate) fn new(id: WorkerId, link: Connection, now: u64) -> WorkerEntry {
        let addrport = link.peer().to_string();
        WorkerEntry {
            id,
            link,
            addrport,
            hostname: "unknown".to_string(),
            os: String::new(),
            arch: String::new(),
            version: String::new(),
            worker_uuid: None,
            kind: WorkerType::Unknown,
            authenticated: false,
            challenge_nonce: None,
            resources: WorkerResources::default(),
            coprocess_resources: WorkerResources::default(),
            features: HashSet::new(),
            files: HashMap::new(),
            task_envelopes: HashMap::new(),
            transfer_addr: None,
            factory_name: None,
            draining: false,
            alarm_slow_worker: false,
            end_time: None,
            start_time: now,
            last_msg_recv_time: now,
            last_keepalive_sent_time: now,
            finished_tasks: 0,
            total_tasks_complete: 0,
            total_task_time: 0,
            bytes_sent: 0,
            bytes_received: 0,
            reported: WorkerReportedStats::default(),
        }
    }

    pub(crate) fn is_ready_worker(&self) -> bool {
        self.kind == WorkerType::Worker && self.resources.workers.total > 0
    }

    pub(crate) fn running_task_count(&self) -> usize {
        self.task_envelopes.len()
    }

    /// Recompute `inuse` for every dimension from the running envelopes.
    pub(crate) fn recount_resources(&mut self) {
        self.resources.clear_inuse();
        for env in self.task_envelopes.values() {
            self.resources.cores.inuse += env.cores.max(0);
            self.resources.memory.inuse += env.memory.max(0);
            self.resources.disk.inuse += env.disk.max(0);
            self.resources.gpus.inuse += env.gpus.max(0);
        }
    }

    /// Bytes of a task's inputs already present in this worker's cache.
    pub(crate) fn cached_bytes_of(&self, cache_names: &[(String, u64)]) -> u64 {
        cache_names
            .iter()
            .filter(|(name, _)| self.files.get(name).is_some_and(|f| f.in_cache))
            .map(|(_, size)| *size)
            .sum()
    }

    pub(crate) fn has_in_cache(&self, cache_name: &str) -> bool {
        self.files.get(cache_name).is_some_and(|f| f.in_cache)
    }

    /// Mean execution time of tasks completed on this worker, used by the
    /// TIME scheduling policy. `None` until one task has completed.
    pub(crate) fn average_task_time(&self) -> Option<u64> {
        if self.total_tasks_complete == 0 {
            None
        } else {
            Some(self.total_task_time / self.total_tasks_complete)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Resource;

    fn entry_for_test() -> WorkerEntry {
        // A worker entry with a loopback connection we never read.
        let std_listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = std_listener.local_addr().unwrap();
        let client = std::net::TcpStream::connect(addr).unwrap();
        client.set_nonblocking(true).unwrap();
        let stream = tokio::net::TcpStream::from_std(client).unwrap();
        WorkerEntry::new(1, Connection::new(stream, addr), 0)
    }

    #[tokio::test]
    async fn recount_sums_envelopes() {
        let mut w = entry_for_test();
        w.task_envelopes.insert(
            1,
            ResourceSummary {
                cores: 2,
                memory: 1024,
                disk: 100,
                gpus: 0,
            },
        );
        w.task_envelopes.insert(
            2,
            ResourceSummary {
                cores: 1,
                memory: 512,
                disk: -1,
                gpus: 1,
            },
        );
        w.recount_resources();
        assert_eq!(w.resources.cores.inuse, 3);
        assert_eq!(w.resources.memory.inuse, 1536);
        assert_eq!(w.resources.disk.inuse, 100);
        assert_eq!(w.resources.gpus.inuse, 1);
    }

    #[tokio::test]
    async fn cached_bytes_counts_only_present_files() {
        let mut w = entry_for_test();
        w.files.insert(
            "a".into(),
            RemoteFileInfo {
                size: 10,
                in_cache: true,
                transfer_time: 0,
            },
        );
        w.files.insert("b".into(), RemoteFileInfo::pending(20));
        let needs = vec![("a".to_string(), 10u64), ("b".to_string(), 20), ("c".to_string(), 5)];
        assert_eq!(w.cached_bytes_of(&needs), 10);
        assert!(w.has_in_cache("a"));
        assert!(!w.has_in_cache("b"));
    }

    #[tokio::test]
    async fn ready_requires_handshake_and_resources() {
        let mut w = entry_for_test();
        assert!(!w.is_ready_worker());
        w.kind = WorkerType::Worker;
        assert!(!w.is_ready_worker());
        w.resources.workers = Resource {
            total: 1,
            inuse: 0,
            smallest: 1,
            largest: 1,
        };
        assert!(w.is_ready_worker());
    }
}
