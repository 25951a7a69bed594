//! Retrieval of completed tasks: output fetch, measured-resource recovery,
//! the resource-exhaustion retry ladder, ready-list expiry, and statistics
//! accumulation.

use tracing::{debug, warn};

use taskmill_protocol::{ManagerMsg, WorkerMsg, FILE_FLAG_CACHE};

use crate::capacity::TaskReport;
use crate::clock::now_usec;
use crate::commit::monitor_remote_name;
use crate::file::FileKind;
use crate::link::deadline_in;
use crate::manager::Manager;
use crate::resources::ResourcesMeasured;
use crate::task::{Task, TaskResult, TaskState};
use crate::worker::{WorkerEntry, WorkerId};

enum FetchOutcome {
    Ok,
    WorkerFailed,
    AppFailed(TaskResult),
}

impl Manager {
    /// Advance the system by fetching the outputs of one task awaiting
    /// retrieval, moving it to retrieved state. Also shuts down a worker
    /// whose factory is over its limit once the worker goes idle.
    pub(crate) async fn receive_one_task(&mut self) -> bool {
        let Some((task_id, wid)) = self
            .tasks
            .values()
            .find(|t| t.state == TaskState::WaitingRetrieval)
            .map(|t| (t.task_id, t.worker))
        else {
            return false;
        };
        let Some(wid) = wid else {
            // The worker vanished mid-retrieval; its removal re-queued the
            // task already, so nothing to do here.
            return false;
        };

        self.fetch_output_from_worker(wid, task_id).await;
        self.factory_prune_worker(wid).await;
        true
    }

    /// Shut down an idle worker whose factory is over its limit.
    pub(crate) async fn factory_prune_worker(&mut self, wid: WorkerId) {
        let prune = self.workers.get(&wid).is_some_and(|w| {
            w.running_task_count() == 0
                && w.factory_name.as_deref().is_some_and(|name| {
                    self.factories
                        .get(name)
                        .is_some_and(|f| f.connected_workers > f.max_workers)
                })
        });
        if prune {
            let hostname = self
                .workers
                .get(&wid)
                .map(|w| w.hostname.clone())
                .unwrap_or_default();
            debug!(worker = wid, %hostname, "factory over limit, shutting down idle worker");
            self.shut_down_worker(wid).await;
        }
    }

    async fn fetch_output_from_worker(&mut self, wid: WorkerId, task_id: u64) {
        let Some(mut w) = self.workers.remove(&wid) else {
            return;
        };
        let Some(mut t) = self.tasks.remove(&task_id) else {
            self.workers.insert(wid, w);
            return;
        };

        t.time_when_retrieval = now_usec();

        let outcome = self.get_output_files(&mut w, &mut t).await;
        match outcome {
            FetchOutcome::WorkerFailed => {
                debug!(worker = wid, task = task_id, "failed to receive output from worker");
                t.time_when_done = now_usec();
                self.tasks.insert(task_id, t);
                self.workers.insert(wid, w);
                self.handle_worker_failure(wid).await;
                return;
            }
            FetchOutcome::AppFailed(result) => {
                t.result = result;
                // Outputs of a failed task are stale; a resubmission may
                // produce different ones.
                let outputs = t.outputs.clone();
                self.delete_worker_files(&mut w, &outputs, 0).await;
            }
            FetchOutcome::Ok => {}
        }

        let inputs = t.inputs.clone();
        let outputs = t.outputs.clone();
        self.delete_worker_files(&mut w, &inputs, FILE_FLAG_CACHE).await;
        self.delete_worker_files(&mut w, &outputs, FILE_FLAG_CACHE).await;

        if self.monitor_dir.is_some() {
            self.read_measured_resources(&mut t);
        }
        if t.resources_measured.is_none() {
            t.resources_measured = Some(ResourcesMeasured::sentinel(t.exit_code));
        }

        t.time_when_done = now_usec();
        self.stats.time_receive += t.time_when_done.saturating_sub(t.time_when_retrieval);

        self.accumulate_task(&mut t);
        self.reap_task_from_worker(&mut w, &mut t);
        w.finished_tasks -= 1;
        w.total_tasks_complete += 1;

        // A finished task is evidence the worker itself is not slow.
        w.alarm_slow_worker = false;

        if t.result == TaskResult::ResourceExhaustion {
            let retry = self.next_exhaustion_allocation(&mut t);
            if retry {
                debug!(task = task_id, "resubmitting task with a larger allocation");
                self.change_task_state(&mut t, TaskState::Ready);
                self.tasks.insert(task_id, t);
                self.workers.insert(wid, w);
                return;
            }
            debug!(task = task_id, "task failed at the category's maximum allocation");
            t.result = TaskResult::MaxRetries;
        }

        warn_short_run(&t);

        if let Some(report) = TaskReport::from_task(&t) {
            let on_workers = self.stats_snapshot().tasks_on_workers;
            self.task_reports.add(report, on_workers);
        }

        debug!(
            worker = wid,
            hostname = %w.hostname,
            task = task_id,
            total_usec = t.time_when_done.saturating_sub(t.time_when_commit_start),
            "task complete"
        );

        self.change_task_state(&mut t, TaskState::Retrieved);
        self.tasks.insert(task_id, t);
        self.workers.insert(wid, w);
    }

    /// Whether the category can offer a larger allocation; if so the task
    /// is re-labeled for the retry.
    fn next_exhaustion_allocation(&mut self, t: &mut Task) -> bool {
        let Some(c) = self.categories.get(&t.category) else {
            return false;
        };
        if c.is_bucketing() {
            return c.bucketing_has_headroom(t.exhausted_attempts);
        }
        match c.next_tier(t.allocation_tier) {
            Some(tier) => {
                t.allocation_tier = tier;
                true
            }
            None => false,
        }
    }

    /// Issue a `get` per output binding and stream the replies to disk.
    async fn get_output_files(&mut self, w: &mut WorkerEntry, t: &mut Task) -> FetchOutcome {
        let exhausted = t.result == TaskResult::ResourceExhaustion;
        let monitor_name = monitor_remote_name(t.task_id);
        let outputs = t.outputs.clone();
        for f in &outputs {
            if f.kind == FileKind::Temp {
                continue;
            }
            let Some(local) = f.path.clone() else { continue };
            // On exhaustion only the monitor summary is worth fetching.
            if exhausted && f.remote_name != monitor_name {
                continue;
            }

            let msg = ManagerMsg::Get {
                cache_name: f.cache_name.clone(),
                remote_path: f.remote_name.clone(),
            };
            let deadline = deadline_in(self.config.short_timeout);
            if w.link.send_line(&msg.to_string(), deadline).await.is_err() {
                return FetchOutcome::WorkerFailed;
            }

            let deadline = self.transfer_deadline(f.expected_size());
            let line = match w.link.read_line(deadline).await {
                Ok(line) => line,
                Err(_) => return FetchOutcome::WorkerFailed,
            };
            match WorkerMsg::parse(&line) {
                Ok(WorkerMsg::File { size, .. }) => {
                    if let Some(parent) = local.parent() {
                        let _ = tokio::fs::create_dir_all(parent).await;
                    }
                    let file = tokio::fs::OpenOptions::new()
                        .create(true)
                        .write(true)
                        .truncate(true)
                        .open(&local)
                        .await;
                    let deadline = self.transfer_deadline(size);
                    match file {
                        Ok(mut file) => {
                            if w.link
                                .read_to_file(&mut file, 0, size, deadline)
                                .await
                                .is_err()
                            {
                                return FetchOutcome::WorkerFailed;
                            }
                        }
                        Err(err) => {
                            debug!(path = %local.display(), error = %err, "cannot write task output");
                            if w.link.soak(size, deadline).await.is_err() {
                                return FetchOutcome::WorkerFailed;
                            }
                            return FetchOutcome::AppFailed(TaskResult::OutputTransferError);
                        }
                    }
                    t.bytes_received += size;
                    self.stats.bytes_received += size;
                    w.bytes_received += size;
                }
                Ok(WorkerMsg::GetFailed { code, .. }) => {
                    debug!(
                        task = t.task_id,
                        file = %f.remote_name,
                        code,
                        "worker could not return an output"
                    );
                    return FetchOutcome::AppFailed(TaskResult::OutputTransferError);
                }
                _ => return FetchOutcome::WorkerFailed,
            }
        }
        FetchOutcome::Ok
    }

    /// Parse the monitor summary fetched with the outputs; absent or
    /// unreadable summaries leave a sentinel and flag the task.
    fn read_measured_resources(&mut self, t: &mut Task) {
        let Some(dir) = &self.monitor_dir else { return };
        let path = dir.join(format!("taskmill-task-{}.summary", t.task_id));
        match std::fs::read_to_string(&path) {
            Ok(text) => match serde_json::from_str::<ResourcesMeasured>(&text) {
                Ok(measured) => {
                    if measured.limits_exceeded.is_some() && t.result == TaskResult::Success {
                        t.result = TaskResult::ResourceExhaustion;
                    }
                    t.resources_measured = Some(measured);
                }
                Err(err) => {
                    debug!(path = %path.display(), error = %err, "unparsable monitor summary");
                    t.resources_measured = Some(ResourcesMeasured::sentinel(t.exit_code));
                    if t.result == TaskResult::Success {
                        t.result = TaskResult::MonitorError;
                    }
                }
            },
            Err(_) => {
                t.resources_measured = Some(ResourcesMeasured::sentinel(t.exit_code));
                if t.result == TaskResult::Success {
                    t.result = TaskResult::MonitorError;
                }
            }
        }
    }

    /// Expire ready tasks that outlived their absolute end time or their
    /// retry budget; they move straight to retrieved with the matching
    /// result code.
    pub(crate) fn expire_ready_tasks(&mut self) -> bool {
        let now = now_usec();
        let ready: Vec<u64> = self.ready_list.clone();
        let mut expired = false;
        for id in ready {
            let Some(t) = self.tasks.get(&id) else { continue };
            let result = if t.end_time > 0 && t.end_time <= now {
                Some(TaskResult::TaskTimeout)
            } else if t.max_retries > 0 && t.try_count > t.max_retries {
                Some(TaskResult::MaxRetries)
            } else {
                None
            };
            if let Some(result) = result {
                let Some(mut t) = self.tasks.remove(&id) else { continue };
                t.result = result;
                self.change_task_state(&mut t, TaskState::Retrieved);
                self.tasks.insert(id, t);
                expired = true;
            }
        }
        expired
    }

    /// Fold a finished task into the category and manager statistics.
    pub(crate) fn accumulate_task(&mut self, t: &mut Task) {
        let send = t.time_when_commit_end.saturating_sub(t.time_when_commit_start);
        let receive = t.time_when_done.saturating_sub(t.time_when_retrieval);

        self.stats.tasks_done += 1;
        match t.result {
            TaskResult::Success => {
                self.stats.time_workers_execute_good += t.time_workers_execute_last;
                self.stats.time_send_good += send;
                self.stats.time_receive_good += receive;
            }
            TaskResult::ResourceExhaustion => {
                self.stats.time_workers_execute_exhaustion += t.time_workers_execute_last;
                self.stats.tasks_exhausted_attempts += 1;
                t.exhausted_attempts += 1;
            }
            _ => {}
        }

        let category = t.category.clone();
        self.lookup_or_create_category(&category).accumulate(t);
        self.write_txn_category(&category);
    }

    /// Delete a task's uncached inputs from a worker.
    pub(crate) async fn delete_uncacheable_inputs(&mut self, w: &mut WorkerEntry, t: &Task) {
        let inputs = t.inputs.clone();
        self.delete_worker_files(w, &inputs, FILE_FLAG_CACHE).await;
    }
}

fn warn_short_run(t: &Task) {
    if t.result != TaskResult::Success || t.time_workers_execute_last >= 1_000_000 {
        return;
    }
    match t.exit_code {
        126 => warn!(
            task = t.task_id,
            "task exited 126 almost immediately; its command is likely not executable"
        ),
        127 => warn!(
            task = t.task_id,
            "task exited 127 almost immediately; its command was likely not found"
        ),
        139 => warn!(
            task = t.task_id,
            "task exited 139 almost immediately; its command likely segfaulted"
        ),
        _ => {}
    }
}
