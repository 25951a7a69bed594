//! Liveness machinery: keepalive probes, slow-worker eviction, drained and
//! expired workers, and factory-driven trimming.

use tracing::{debug, warn};

use taskmill_protocol::ManagerMsg;

use crate::clock::{now_usec, secs};
use crate::manager::Manager;
use crate::task::TaskState;
use crate::worker::{DisconnectReason, WorkerId};

impl Manager {
    /// Send keepalive probes to quiet workers; remove those whose probes
    /// have gone unanswered past the timeout, and those that never sent
    /// their handshake at all.
    pub(crate) async fn ask_for_workers_updates(&mut self) {
        if self.config.keepalive_interval == 0 {
            return;
        }
        let now = now_usec();
        let interval = secs(self.config.keepalive_interval);
        let timeout = secs(self.config.keepalive_timeout);

        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            let Some(w) = self.workers.get(&id) else { continue };

            if w.hostname == "unknown" {
                if now.saturating_sub(w.start_time) >= timeout {
                    debug!(worker = id, "removing worker that never initialized");
                    self.handle_worker_failure(id).await;
                }
                continue;
            }

            if w.last_msg_recv_time > w.last_keepalive_sent_time {
                if now.saturating_sub(w.last_keepalive_sent_time) >= interval {
                    if self.send_to_worker(id, &ManagerMsg::Check).await {
                        if let Some(w) = self.workers.get_mut(&id) {
                            debug!(worker = id, hostname = %w.hostname, "sent keepalive check");
                            w.last_keepalive_sent_time = now;
                        }
                    }
                }
            } else if self.link_poll_end > w.last_keepalive_sent_time
                && self.link_poll_end - w.last_keepalive_sent_time >= timeout
            {
                debug!(
                    worker = id,
                    hostname = %w.hostname,
                    "worker has not answered its keepalive check"
                );
                self.handle_worker_failure(id).await;
            }
        }
    }

    /// Cancel tasks that have far exceeded their category's learned
    /// runtime; a worker that trips the threshold twice in a row is
    /// disconnected and its host blocked.
    pub(crate) async fn disconnect_slow_workers(&mut self) -> usize {
        let default_multiplier = self
            .categories
            .get("default")
            .map(|c| c.slow_multiplier)
            .unwrap_or(-1.0);

        let any_active = self.categories.values().any(|c| {
            c.average_task_time > 0 && c.effective_multiplier(default_multiplier).is_some()
        });
        if !any_active {
            return 0;
        }

        let now = now_usec();
        let running: Vec<u64> = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .map(|t| t.task_id)
            .collect();

        let mut removed = 0;
        for task_id in running {
            let Some(t) = self.tasks.get(&task_id) else { continue };
            let Some(c) = self.categories.get(&t.category) else { continue };
            let Some(multiplier) = c.effective_multiplier(default_multiplier) else {
                continue;
            };
            let average = c.average_task_time;
            if average < 1 {
                continue;
            }
            let runtime = now.saturating_sub(t.time_when_commit_start);
            let threshold =
                (average as f64 * multiplier * (1.0 + t.slow_strikes as f64)) as u64;
            if runtime < threshold {
                continue;
            }
            let Some(wid) = t.worker else { continue };

            debug!(task = task_id, worker = wid, "task is taking too long; pulling it back");
            let Some(mut t) = self.tasks.remove(&task_id) else { continue };
            self.cancel_task_on_worker(&mut t).await;
            t.slow_strikes += 1;
            self.change_task_state(&mut t, TaskState::Ready);
            let strikes = t.slow_strikes;
            self.tasks.insert(task_id, t);

            // One task may implicate at most one worker.
            if strikes > 1 {
                continue;
            }

            let alarmed = self
                .workers
                .get(&wid)
                .is_some_and(|w| w.alarm_slow_worker);
            if alarmed {
                let hostname = self
                    .workers
                    .get(&wid)
                    .map(|w| w.hostname.clone())
                    .unwrap_or_default();
                warn!(
                    worker = wid,
                    %hostname,
                    runtime_usec = runtime,
                    average_usec = average,
                    "removing slow worker"
                );
                self.block_host_with_timeout(
                    &hostname,
                    self.config.slow_worker_blocklist_timeout,
                );
                self.remove_worker(wid, DisconnectReason::Slow).await;
                self.stats.workers_slow += 1;
                removed += 1;
            } else if let Some(w) = self.workers.get_mut(&wid) {
                w.alarm_slow_worker = true;
            }
        }
        removed
    }

    /// Release drained workers once they run nothing.
    pub(crate) async fn shutdown_drained_workers(&mut self) -> usize {
        let ids: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.draining && w.running_task_count() == 0)
            .map(|(id, _)| *id)
            .collect();
        let n = ids.len();
        for id in ids {
            self.shut_down_worker(id).await;
        }
        n
    }

    /// Release workers whose self-announced end time has passed.
    pub(crate) async fn enforce_worker_end_times(&mut self) -> usize {
        let now = now_usec();
        let ids: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.end_time.is_some_and(|t| t > 0 && t <= now))
            .map(|(id, _)| *id)
            .collect();
        let n = ids.len();
        for id in ids {
            debug!(worker = id, "worker reached its announced end time");
            self.release_worker(id).await;
        }
        n
    }

    /// Remove idle workers of a factory until it is back under its limit.
    pub(crate) async fn factory_trim_workers(&mut self, factory: &str) -> usize {
        let Some(f) = self.factories.get(factory) else { return 0 };
        let mut excess = f.connected_workers - f.max_workers;
        if excess <= 0 {
            return 0;
        }
        let idle: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| {
                w.factory_name.as_deref() == Some(factory) && w.running_task_count() == 0
            })
            .map(|(id, _)| *id)
            .collect();
        let mut trimmed = 0;
        for id in idle {
            if excess <= 0 {
                break;
            }
            self.shut_down_worker(id).await;
            excess -= 1;
            trimmed += 1;
        }
        debug!(factory, trimmed, "trimmed workers for factory");
        trimmed
    }

}

#[cfg(test)]
mod tests {
    use crate::clock::{now_usec, secs};
    use crate::manager::Manager;
    use crate::resources::ResourceSummary;
    use crate::task::{Task, TaskState};
    use crate::testutil::{attach_worker, test_manager};
    use crate::worker::WorkerId;

    fn seasoned_category(m: &mut Manager, name: &str, mean_secs: u64, multiplier: f64) {
        let c = m.lookup_or_create_category(name);
        c.stats.tasks_done = 20;
        c.average_task_time = secs(mean_secs);
        c.slow_multiplier = multiplier;
    }

    fn force_running(m: &mut Manager, task_id: u64, wid: WorkerId, committed_ago_secs: u64) {
        let mut t = m.tasks.remove(&task_id).expect("task exists");
        m.ready_list.retain(|id| *id != task_id);
        t.state = TaskState::Running;
        t.worker = Some(wid);
        t.time_when_commit_start = now_usec() - secs(committed_ago_secs);
        t.time_when_commit_end = t.time_when_commit_start;
        m.tasks.insert(task_id, t);
        m.workers
            .get_mut(&wid)
            .expect("worker exists")
            .task_envelopes
            .insert(
                task_id,
                ResourceSummary {
                    cores: 1,
                    memory: 100,
                    disk: 100,
                    gpus: 0,
                },
            );
    }

    fn running_task(
        m: &mut Manager,
        wid: WorkerId,
        category: &str,
        committed_ago_secs: u64,
    ) -> u64 {
        let mut t = Task::new("sleep 600");
        t.set_category(category);
        let id = m.submit(t).expect("submit");
        force_running(m, id, wid, committed_ago_secs);
        id
    }

    #[tokio::test]
    async fn slow_worker_two_strike_rule() {
        let mut m = test_manager().await;
        seasoned_category(&mut m, "c", 10, 3.0);
        let (wid, _client) = attach_worker(&mut m, "slowhost").await;

        // First slow task: pulled back, alarm armed, worker kept.
        let t1 = running_task(&mut m, wid, "c", 45);
        assert_eq!(m.disconnect_slow_workers().await, 0);
        assert!(m.workers.contains_key(&wid));
        assert!(m.workers[&wid].alarm_slow_worker);
        assert!(!m.blocklist.is_blocked("slowhost"));
        assert_eq!(m.tasks[&t1].state, TaskState::Ready);
        assert_eq!(m.tasks[&t1].slow_strikes, 1);

        // Second slow task on the same worker: evicted and blocked.
        let _t2 = running_task(&mut m, wid, "c", 45);
        assert_eq!(m.disconnect_slow_workers().await, 1);
        assert!(!m.workers.contains_key(&wid));
        assert!(m.blocklist.is_blocked("slowhost"));
        assert_eq!(m.stats.workers_slow, 1);
    }

    #[tokio::test]
    async fn one_task_cannot_strike_two_workers() {
        let mut m = test_manager().await;
        seasoned_category(&mut m, "c", 10, 3.0);
        let (w1, _c1) = attach_worker(&mut m, "host-1").await;
        let (w2, _c2) = attach_worker(&mut m, "host-2").await;

        let t1 = running_task(&mut m, w1, "c", 45);
        assert_eq!(m.disconnect_slow_workers().await, 0);
        assert!(m.workers[&w1].alarm_slow_worker);

        // The same task slow again on another worker: the worker is spared.
        force_running(&mut m, t1, w2, 70);
        assert_eq!(m.disconnect_slow_workers().await, 0);
        assert!(m.workers.contains_key(&w2));
        assert!(!m.workers[&w2].alarm_slow_worker);
        assert!(!m.blocklist.is_blocked("host-2"));
        assert_eq!(m.tasks[&t1].slow_strikes, 2);
    }

    #[tokio::test]
    async fn tasks_below_threshold_are_left_alone() {
        let mut m = test_manager().await;
        seasoned_category(&mut m, "c", 10, 3.0);
        let (wid, _client) = attach_worker(&mut m, "oktown").await;
        let t1 = running_task(&mut m, wid, "c", 20);
        assert_eq!(m.disconnect_slow_workers().await, 0);
        assert_eq!(m.tasks[&t1].state, TaskState::Running);
        assert!(!m.workers[&wid].alarm_slow_worker);
    }

    #[tokio::test]
    async fn disabled_multiplier_never_evicts() {
        let mut m = test_manager().await;
        seasoned_category(&mut m, "c", 10, 0.0);
        let (wid, _client) = attach_worker(&mut m, "slowhost").await;
        let t1 = running_task(&mut m, wid, "c", 500);
        assert_eq!(m.disconnect_slow_workers().await, 0);
        assert_eq!(m.tasks[&t1].state, TaskState::Running);
    }

    #[tokio::test]
    async fn factory_scale_down_spares_active_workers() {
        let mut m = test_manager().await;
        let (w1, _c1) = attach_worker(&mut m, "f-node-1").await;
        let (w2, _c2) = attach_worker(&mut m, "f-node-2").await;
        m.workers.get_mut(&w1).expect("w1").factory_name = Some("F".into());
        m.workers.get_mut(&w2).expect("w2").factory_name = Some("F".into());
        {
            let f = m.factories.lookup_or_create("F");
            f.connected_workers = 2;
            f.max_workers = 1;
        }
        running_task(&mut m, w1, "default", 1);

        assert_eq!(m.factory_trim_workers("F").await, 1);
        assert!(m.workers.contains_key(&w1), "busy worker must be spared");
        assert!(!m.workers.contains_key(&w2), "idle worker is trimmed");
        assert_eq!(m.factories.get("F").expect("factory").connected_workers, 1);
    }

    #[tokio::test]
    async fn factory_within_limit_is_untouched() {
        let mut m = test_manager().await;
        let (w1, _c1) = attach_worker(&mut m, "f-node-1").await;
        m.workers.get_mut(&w1).expect("w1").factory_name = Some("F".into());
        {
            let f = m.factories.lookup_or_create("F");
            f.connected_workers = 1;
            f.max_workers = 4;
        }
        assert_eq!(m.factory_trim_workers("F").await, 0);
        assert!(m.workers.contains_key(&w1));
    }
}
