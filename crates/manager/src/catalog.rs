//! Status reporting: the JSON records served to status clients, pushed to
//! the catalog, and the factory queries that drive elastic scale-down.

use serde_json::{json, Value};
use tracing::debug;

use taskmill_protocol::StatusTopic;

use crate::clock::{now_usec, secs};
use crate::manager::Manager;
use crate::task::TaskState;
use crate::worker::WorkerType;

// Catalog records larger than this are resent in the lean form.
const CATALOG_RECORD_MAX: usize = 63 * 1024;

const CATALOG_DEFAULT_PORT: u16 = 9097;

fn catalog_base(host: &str) -> String {
    let host = host.trim();
    let with_scheme = if host.contains("://") {
        host.to_string()
    } else {
        format!("http://{host}")
    };
    // Bare hostnames get the conventional catalog port.
    match url::Url::parse(&with_scheme) {
        Ok(u) if u.port().is_none() => {
            format!("{with_scheme}:{CATALOG_DEFAULT_PORT}")
        }
        _ => with_scheme,
    }
}

fn network_interfaces() -> Vec<String> {
    std::fs::read_dir("/sys/class/net")
        .map(|entries| {
            entries
                .filter_map(|e| e.ok())
                .map(|e| e.file_name().to_string_lossy().into_owned())
                .filter(|name| name != "lo")
                .collect()
        })
        .unwrap_or_default()
}

impl Manager {
    /// The JSON payload for one status topic, as served over the worker
    /// port and the HTTP surface.
    pub(crate) fn status_value(&self, topic: StatusTopic) -> Value {
        match topic {
            StatusTopic::Queue | StatusTopic::Resources => {
                Value::Array(vec![self.queue_to_json(false)])
            }
            StatusTopic::Tasks => {
                let mut ids: Vec<u64> = self.tasks.keys().copied().collect();
                ids.sort_unstable();
                Value::Array(ids.iter().map(|id| self.task_to_json(*id)).collect())
            }
            StatusTopic::Workers => {
                let mut ids: Vec<_> = self.workers.keys().copied().collect();
                ids.sort_unstable();
                Value::Array(
                    ids.iter()
                        .filter_map(|id| self.worker_to_json(*id))
                        .collect(),
                )
            }
            StatusTopic::Categories => self.categories_to_json(),
        }
    }

    /// One public status request by name (`queue`, `tasks`, `workers`,
    /// `resources`, `categories` or their `*_status` forms), or `None` for
    /// unknown requests.
    pub fn status(&self, request: &str) -> Option<Value> {
        StatusTopic::from_request(request).map(|topic| self.status_value(topic))
    }

    pub(crate) fn queue_to_json(&self, lean: bool) -> Value {
        let s = self.stats_snapshot();
        let mut record = json!({
            "type": "vine_manager",
            "project": self.config.name.clone().unwrap_or_default(),
            "owner": std::env::var("USER").unwrap_or_default(),
            "port": self.port,
            "starttime": s.time_when_started / 1_000_000,
            "version": env!("CARGO_PKG_VERSION"),
            "ssl": false,
            "priority": self.config.priority,
            "manager_load": s.manager_load,
            "tasks_waiting": s.tasks_waiting,
            "tasks_running": s.tasks_running,
            "tasks_on_workers": s.tasks_on_workers,
            "tasks_with_results": s.tasks_with_results,
            "tasks_left": s.tasks_left,
            "tasks_submitted": s.tasks_submitted,
            "tasks_dispatched": s.tasks_dispatched,
            "tasks_done": s.tasks_done,
            "tasks_failed": s.tasks_failed,
            "tasks_cancelled": s.tasks_cancelled,
            "tasks_exhausted_attempts": s.tasks_exhausted_attempts,
            "workers": s.workers_connected,
            "workers_connected": s.workers_connected,
            "workers_init": s.workers_init,
            "workers_idle": s.workers_idle,
            "workers_busy": s.workers_busy,
            "workers_able": s.workers_able,
            "capacity_tasks": s.capacity_tasks,
            "capacity_cores": s.capacity_cores,
            "capacity_memory": s.capacity_memory,
            "capacity_disk": s.capacity_disk,
            "capacity_gpus": s.capacity_gpus,
            "capacity_instantaneous": s.capacity_instantaneous,
            "capacity_weighted": s.capacity_weighted,
        });
        if lean {
            return record;
        }
        let full = json!({
            "workers_joined": s.workers_joined,
            "workers_removed": s.workers_removed,
            "workers_released": s.workers_released,
            "workers_idled_out": s.workers_idled_out,
            "workers_slow": s.workers_slow,
            "workers_lost": s.workers_lost,
            "workers_blocked": self
                .blocklist
                .blocked_hosts()
                .iter()
                .map(|h| h.to_string())
                .collect::<Vec<_>>(),
            "time_when_started": s.time_when_started,
            "time_send": s.time_send,
            "time_receive": s.time_receive,
            "time_send_good": s.time_send_good,
            "time_receive_good": s.time_receive_good,
            "time_status_msgs": s.time_status_msgs,
            "time_internal": s.time_internal,
            "time_polling": s.time_polling,
            "time_application": s.time_application,
            "time_scheduling": s.time_scheduling,
            "time_workers_execute": s.time_workers_execute,
            "time_workers_execute_good": s.time_workers_execute_good,
            "time_workers_execute_exhaustion": s.time_workers_execute_exhaustion,
            "bytes_sent": s.bytes_sent,
            "bytes_received": s.bytes_received,
            "bandwidth": s.bandwidth,
            "total_cores": s.total_cores,
            "total_memory": s.total_memory,
            "total_disk": s.total_disk,
            "total_gpus": s.total_gpus,
            "committed_cores": s.committed_cores,
            "committed_memory": s.committed_memory,
            "committed_disk": s.committed_disk,
            "committed_gpus": s.committed_gpus,
            "max_cores": s.max_cores,
            "max_memory": s.max_memory,
            "max_disk": s.max_disk,
            "max_gpus": s.max_gpus,
            "min_cores": s.min_cores,
            "min_memory": s.min_memory,
            "min_disk": s.min_disk,
            "min_gpus": s.min_gpus,
            "categories": self.categories_to_json(),
            "network_interfaces": network_interfaces(),
        });
        if let (Value::Object(record), Value::Object(full)) = (&mut record, full) {
            record.extend(full);
        }
        record
    }

    pub(crate) fn worker_to_json(&self, id: crate::worker::WorkerId) -> Option<Value> {
        let w = self.workers.get(&id)?;
        if w.kind != WorkerType::Worker {
            return None;
        }
        Some(json!({
            "hostname": w.hostname,
            "address_port": w.addrport,
            "os": w.os,
            "arch": w.arch,
            "version": w.version,
            "worker_id": w.worker_uuid.clone().unwrap_or_default(),
            "factory_name": w.factory_name.clone().unwrap_or_default(),
            "draining": w.draining,
            "tasks_running": w.running_task_count(),
            "tasks_complete": w.total_tasks_complete,
            "results_queued": w.finished_tasks,
            "reported_tasks_waiting": w.reported.tasks_waiting,
            "reported_tasks_running": w.reported.tasks_running,
            "cached_files": w.files.len(),
            "cores_total": w.resources.cores.total,
            "cores_inuse": w.resources.cores.inuse,
            "memory_total": w.resources.memory.total,
            "memory_inuse": w.resources.memory.inuse,
            "disk_total": w.resources.disk.total,
            "disk_inuse": w.resources.disk.inuse,
            "gpus_total": w.resources.gpus.total,
            "gpus_inuse": w.resources.gpus.inuse,
            "last_msg_recv_time": w.last_msg_recv_time,
        }))
    }

    pub(crate) fn task_to_json(&self, id: u64) -> Value {
        match self.tasks.get(&id) {
            Some(t) => json!({
                "task_id": t.task_id,
                "state": t.state.as_str(),
                "category": t.category,
                "tag": t.tag.clone().unwrap_or_default(),
                "priority": t.priority,
                "try_count": t.try_count,
                "forsaken_count": t.forsaken_count,
                "exhausted_attempts": t.exhausted_attempts,
                "result": t.result.as_str(),
                "exit_code": t.exit_code,
                "worker": t.worker_addrport.clone().unwrap_or_default(),
                "cores": t.resources_requested.cores,
                "memory": t.resources_requested.memory,
                "disk": t.resources_requested.disk,
                "gpus": t.resources_requested.gpus,
                "time_when_submitted": t.time_when_submitted,
            }),
            None => Value::Null,
        }
    }

    pub(crate) fn categories_to_json(&self) -> Value {
        let mut names: Vec<&String> = self.categories.keys().collect();
        names.sort();
        Value::Array(
            names
                .into_iter()
                .map(|name| {
                    let c = &self.categories[name];
                    let waiting = self
                        .ready_list
                        .iter()
                        .filter(|id| {
                            self.tasks.get(id).is_some_and(|t| &t.category == name)
                        })
                        .count();
                    let running = self
                        .tasks
                        .values()
                        .filter(|t| {
                            &t.category == name && t.state == TaskState::Running
                        })
                        .count();
                    json!({
                        "category": name,
                        "tasks_waiting": waiting,
                        "tasks_running": running,
                        "tasks_done": c.stats.tasks_done,
                        "tasks_failed": c.stats.tasks_failed,
                        "bytes_sent": c.stats.bytes_sent,
                        "bytes_received": c.stats.bytes_received,
                        "time_workers_execute": c.stats.time_workers_execute,
                        "average_task_time": c.average_task_time,
                        "max_cores": c.max_seen.cores,
                        "max_memory": c.max_seen.memory,
                        "max_disk": c.max_seen.disk,
                        "max_gpus": c.max_seen.gpus,
                        "first_allocation": {
                            "cores": c.first_allocation_guess.cores,
                            "memory": c.first_allocation_guess.memory,
                            "disk": c.first_allocation_guess.disk,
                            "gpus": c.first_allocation_guess.gpus,
                        },
                    })
                })
                .collect(),
        )
    }

    /// Push the status record to every configured catalog host when the
    /// update interval has elapsed (or `force` is set). Oversized records
    /// fall back to the lean variant.
    pub(crate) async fn update_catalog(&mut self, force: bool) {
        let now = now_usec();
        if !force
            && now.saturating_sub(self.catalog_last_update)
                < secs(self.config.catalog_update_interval)
        {
            return;
        }
        self.catalog_last_update = now;
        if self.config.catalog_hosts.is_empty() || self.config.name.is_none() {
            return;
        }

        let mut record = self.queue_to_json(false);
        if record.to_string().len() > CATALOG_RECORD_MAX {
            record = self.queue_to_json(true);
            if let Some(log) = self.txn_log.as_mut() {
                log.write("MANAGER", "catalog", "LEAN_UPDATE", None);
            }
        }

        for host in self.config.catalog_hosts.clone() {
            let url = format!("{}/update", catalog_base(&host));
            match self.http.post(&url).json(&record).send().await {
                Ok(resp) if resp.status().is_success() => {
                    debug!(catalog = %host, "catalog update sent");
                }
                Ok(resp) => {
                    debug!(catalog = %host, status = %resp.status(), "catalog rejected update");
                }
                Err(err) => {
                    debug!(catalog = %host, error = %err, "catalog update failed");
                }
            }
        }
    }

    /// Query the catalog for the factories feeding this manager, apply
    /// their `max_workers`, trim over-limit factories down to idle
    /// workers, and forget factories gone from the catalog.
    pub(crate) async fn update_catalog_factories(&mut self) {
        if self.factories.is_empty() {
            return;
        }
        let names = self.factories.names();
        let filter = format!(
            "type == \"vine_factory\" && ({})",
            names
                .iter()
                .map(|n| format!("factory_name == \"{n}\""))
                .collect::<Vec<_>>()
                .join(" || ")
        );
        self.factories.mark_all_unseen();

        for host in self.config.catalog_hosts.clone() {
            let url = format!("{}/query", catalog_base(&host));
            let resp = self
                .http
                .get(&url)
                .query(&[("filter", filter.as_str())])
                .send()
                .await;
            let entries: Vec<Value> = match resp {
                Ok(resp) => resp.json().await.unwrap_or_default(),
                Err(err) => {
                    debug!(catalog = %host, error = %err, "factory query failed");
                    continue;
                }
            };
            for entry in entries {
                let Some(name) = entry.get("factory_name").and_then(Value::as_str) else {
                    continue;
                };
                let name = name.to_string();
                let f = self.factories.lookup_or_create(&name);
                f.seen_at_catalog = true;
                if let Some(max) = entry.get("max_workers").and_then(Value::as_i64) {
                    let old = f.max_workers;
                    f.max_workers = max;
                    if max < old {
                        self.factory_trim_workers(&name).await;
                    }
                }
            }
        }

        self.factories.forget_outdated();
    }
}
