//! Task dispatch: source planning for inputs, the commit wire sequence,
//! and the bookkeeping that ties a running task to its worker.

use std::path::{Path, PathBuf};

use tracing::debug;

use taskmill_protocol::{peer_source_uri, ManagerMsg, TaskDescription, TaskFileLine};

use crate::clock::now_usec;
use crate::file::{File, FileKind};
use crate::link::deadline_in;
use crate::manager::Manager;
use crate::resources::ResourceSummary;
use crate::sched::{check_worker_fit, choose_resources_for_task, pick_candidate, Candidate};
use crate::task::{Task, TaskResult, TaskState};
use crate::worker::{RemoteFileInfo, WorkerEntry, WorkerId};

pub(crate) enum CommitOutcome {
    Ok,
    WorkerFailed,
    AppFailed,
}

impl Manager {
    /// Advance the system by dispatching at most one ready task, in
    /// priority order. Tasks whose start time has not arrived, that fit no
    /// worker, or whose inputs have no viable source stay in place.
    pub(crate) async fn send_one_task(&mut self) -> bool {
        let now = now_usec();
        let sched_start = now;
        let ready: Vec<u64> = self.ready_list.clone();
        for id in ready {
            let Some(t) = self.tasks.get(&id) else { continue };
            if t.start_time > now {
                continue;
            }
            let Some(wid) = self.schedule_task_to_worker(id) else {
                continue;
            };

            let Some(mut t) = self.tasks.remove(&id) else { continue };
            if self.config.peer_transfers && !self.resolve_transfer_sources(wid, &mut t.inputs) {
                self.tasks.insert(id, t);
                continue;
            }
            self.stats.time_scheduling += now_usec().saturating_sub(sched_start);
            self.commit_task_to_worker(wid, t).await;
            return true;
        }
        self.stats.time_scheduling += now_usec().saturating_sub(sched_start);
        false
    }

    /// Choose the best worker for a ready task under the configured policy,
    /// or `None` when no connected worker is feasible.
    pub(crate) fn schedule_task_to_worker(&self, task_id: u64) -> Option<WorkerId> {
        let t = self.tasks.get(&task_id)?;
        let demand = self.task_min_resources(t);
        let needs: Vec<(String, u64)> = t
            .inputs
            .iter()
            .map(|f| (f.cache_name.clone(), f.expected_size()))
            .collect();

        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        let mut candidates = Vec::new();
        for id in ids {
            let w = &self.workers[&id];
            if !w.is_ready_worker() || w.draining || !w.authenticated {
                continue;
            }
            if !check_worker_fit(&w.resources, &demand, self.config.resource_submit_multiplier) {
                continue;
            }
            let free = |r: &crate::resources::Resource| {
                if r.total > 0 {
                    (r.total - r.inuse) as f64 / r.total as f64
                } else {
                    0.0
                }
            };
            candidates.push(Candidate {
                id,
                free_score: free(&w.resources.cores)
                    + free(&w.resources.memory)
                    + free(&w.resources.disk)
                    + free(&w.resources.gpus),
                cached_bytes: w.cached_bytes_of(&needs),
                avg_time: w.average_task_time(),
            });
        }
        pick_candidate(self.config.scheduler, &candidates)
    }

    /// Resolve a source for every input not already on the target worker,
    /// preferring peers under their transfer caps. Chosen peer sources are
    /// written into the bindings' substitute slots. Returns false when any
    /// input has no viable source this iteration.
    pub(crate) fn resolve_transfer_sources(
        &self,
        target: WorkerId,
        inputs: &mut [File],
    ) -> bool {
        for f in inputs.iter_mut() {
            f.substitute = None;
            let present = self
                .workers
                .get(&target)
                .is_some_and(|w| w.files.contains_key(&f.cache_name));
            if present {
                continue;
            }

            let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
            ids.sort_unstable();
            let mut found = false;
            for pid in ids {
                if pid == target {
                    continue;
                }
                let peer = &self.workers[&pid];
                let Some((host, port)) = &peer.transfer_addr else {
                    continue;
                };
                if !peer.has_in_cache(&f.cache_name) {
                    continue;
                }
                let uri = peer_source_uri(host, *port, &f.cache_name);
                if self.transfers.source_in_use(&uri)
                    < self.config.worker_source_max_transfers
                {
                    f.substitute = Some(uri);
                    found = true;
                    break;
                }
            }
            if found {
                continue;
            }

            match f.kind {
                FileKind::Url => {
                    let url = f.url.as_deref().unwrap_or_default();
                    if self.transfers.source_in_use(url)
                        >= self.config.file_source_max_transfers
                    {
                        return false;
                    }
                }
                // Temps live only on workers; no peer means no source.
                FileKind::Temp => return false,
                FileKind::MiniTask => {
                    let mut mini = f.mini_task.take();
                    let ok = mini
                        .as_mut()
                        .is_some_and(|m| self.resolve_transfer_sources(target, &mut m.inputs));
                    f.mini_task = mini;
                    if !ok {
                        return false;
                    }
                }
                // The manager itself is always an available source.
                FileKind::Local | FileKind::Buffer | FileKind::Dir => {}
            }
        }
        true
    }

    /// Commit one task to one worker: send the file plan and description,
    /// record the allocation envelope, and move the task to running. A
    /// failed send removes the worker, which re-queues the task.
    pub(crate) async fn commit_task_to_worker(&mut self, wid: WorkerId, mut t: Task) {
        let Some(mut w) = self.workers.remove(&wid) else {
            let id = t.task_id;
            self.tasks.insert(id, t);
            return;
        };

        t.worker_hostname = Some(w.hostname.clone());
        t.worker_addrport = Some(w.addrport.clone());

        let alloc = self.category_allocation(&t);
        let min = self.task_min_resources(&t);
        let limits = choose_resources_for_task(
            &w.resources,
            &alloc,
            &min,
            self.config.proportional_resources,
            self.config.proportional_whole_tasks,
        );

        self.add_monitor_output(&mut t);

        t.time_when_commit_start = now_usec();
        let outcome = self.send_task_to_worker(&mut w, &mut t, &limits).await;
        t.time_when_commit_end = now_usec();
        self.stats.time_send += t
            .time_when_commit_end
            .saturating_sub(t.time_when_commit_start);

        let id = t.task_id;
        w.task_envelopes.insert(id, limits);
        t.resources_allocated = ResourceSummary::unspecified();
        t.resources_allocated.merge_override(&limits);
        t.worker = Some(wid);
        self.change_task_state(&mut t, TaskState::Running);
        t.try_count += 1;
        self.stats.tasks_dispatched += 1;
        w.recount_resources();
        debug!(
            worker = wid,
            hostname = %w.hostname,
            task = id,
            "worker busy on task"
        );

        self.tasks.insert(id, t);
        self.workers.insert(wid, w);

        match outcome {
            CommitOutcome::Ok => {}
            CommitOutcome::WorkerFailed => {
                debug!(worker = wid, task = id, "failed to send task to worker");
                self.handle_worker_failure(wid).await;
            }
            CommitOutcome::AppFailed => {
                // The task's own inputs are unusable; hand it back.
                if let Some(mut t) = self.tasks.remove(&id) {
                    let outputs = t.outputs.clone();
                    if let Some(mut w) = self.workers.remove(&wid) {
                        self.delete_worker_files(&mut w, &outputs, 0).await;
                        w.task_envelopes.remove(&id);
                        w.recount_resources();
                        self.workers.insert(wid, w);
                    }
                    t.result = TaskResult::InputMissing;
                    t.worker = None;
                    self.change_task_state(&mut t, TaskState::Retrieved);
                    self.tasks.insert(id, t);
                }
            }
        }
    }

    /// The category-level allocation request for a task at its current
    /// tier, clamped to the category's configured maximum.
    pub(crate) fn category_allocation(&self, t: &Task) -> ResourceSummary {
        let Some(c) = self.categories.get(&t.category) else {
            return t.resources_requested;
        };
        let mut alloc = c.allocation_for(t);
        let cap = c.max_allocation;
        let clamp = |v: &mut i64, cap: i64| {
            if cap >= 0 && (*v < 0 || *v > cap) {
                *v = cap;
            }
        };
        clamp(&mut alloc.cores, cap.cores);
        clamp(&mut alloc.memory, cap.memory);
        clamp(&mut alloc.disk, cap.disk);
        clamp(&mut alloc.gpus, cap.gpus);
        alloc
    }

    /// When monitoring is enabled, splice the implicit summary output into
    /// the task the first time it is committed.
    fn add_monitor_output(&mut self, t: &mut Task) {
        let Some(dir) = &self.monitor_dir else { return };
        let remote = monitor_remote_name(t.task_id);
        if t.outputs.iter().any(|f| f.remote_name == remote) {
            return;
        }
        let local = dir.join(format!("taskmill-task-{}.summary", t.task_id));
        t.outputs.push(File::local(local, remote));
    }

    async fn send_task_to_worker(
        &mut self,
        w: &mut WorkerEntry,
        t: &mut Task,
        limits: &ResourceSummary,
    ) -> CommitOutcome {
        let inputs = t.inputs.clone();
        for f in &inputs {
            match self.send_input(w, t, f).await {
                CommitOutcome::Ok => {}
                other => return other,
            }
        }

        let desc = TaskDescription {
            task_id: t.task_id,
            command: t.command.clone(),
            category: t.category.clone(),
            env: t.env.iter().map(|(k, v)| format!("{k}={v}")).collect(),
            cores: limits.cores.max(0),
            memory: limits.memory.max(0),
            disk: limits.disk.max(0),
            gpus: limits.gpus.max(0),
            end_time: t.end_time,
            wall_time: t.wall_time,
            inputs: t.inputs.iter().map(file_line).collect(),
            outputs: t.outputs.iter().map(file_line).collect(),
        };
        let encoded = desc.encode();
        let deadline = self.transfer_deadline(encoded.len() as u64);
        t.bytes_sent += encoded.len() as u64;
        self.stats.bytes_sent += encoded.len() as u64;
        match w.link.send_bytes(encoded.as_bytes(), deadline).await {
            Ok(()) => CommitOutcome::Ok,
            Err(_) => CommitOutcome::WorkerFailed,
        }
    }

    /// Send the staging directive for one input binding. Files already
    /// known to the worker (cached or in flight) are skipped.
    async fn send_input(
        &mut self,
        w: &mut WorkerEntry,
        t: &mut Task,
        f: &File,
    ) -> CommitOutcome {
        if w.files.contains_key(&f.cache_name) {
            return CommitOutcome::Ok;
        }

        if let Some(uri) = &f.substitute {
            let transfer_id = self.transfers.add(w.id, uri);
            let msg = ManagerMsg::PutUrl {
                url: uri.clone(),
                cache_name: f.cache_name.clone(),
                size: f.expected_size(),
                mode: f.mode_bits(),
                transfer_id,
            };
            return self.send_commit_line(w, t, &msg.to_string(), f).await;
        }

        match f.kind {
            FileKind::Url => {
                let url = f.url.clone().unwrap_or_default();
                let transfer_id = self.transfers.add(w.id, &url);
                let msg = ManagerMsg::PutUrl {
                    url,
                    cache_name: f.cache_name.clone(),
                    size: f.expected_size(),
                    mode: f.mode_bits(),
                    transfer_id,
                };
                self.send_commit_line(w, t, &msg.to_string(), f).await
            }
            FileKind::Local => {
                let Some(path) = &f.path else {
                    return CommitOutcome::AppFailed;
                };
                let Ok(bytes) = tokio::fs::read(path).await else {
                    debug!(path = %path.display(), "cannot read task input");
                    return CommitOutcome::AppFailed;
                };
                self.send_put(w, t, &f.cache_name, &bytes, f.mode_bits()).await
            }
            FileKind::Buffer => {
                let bytes = f.bytes.clone().unwrap_or_default();
                self.send_put(w, t, &f.cache_name, &bytes, f.mode_bits()).await
            }
            FileKind::Dir => {
                let Some(path) = &f.path else {
                    return CommitOutcome::AppFailed;
                };
                let mut entries = Vec::new();
                if collect_dir_files(path, PathBuf::new(), &mut entries).is_err() {
                    debug!(path = %path.display(), "cannot walk input directory");
                    return CommitOutcome::AppFailed;
                }
                for (abs, rel) in entries {
                    let Ok(bytes) = tokio::fs::read(&abs).await else {
                        return CommitOutcome::AppFailed;
                    };
                    let name = format!("{}/{}", f.cache_name, rel.display());
                    match self.send_put(w, t, &name, &bytes, f.mode_bits()).await {
                        CommitOutcome::Ok => {}
                        other => return other,
                    }
                }
                w.files
                    .insert(f.cache_name.clone(), RemoteFileInfo::pending(0));
                CommitOutcome::Ok
            }
            FileKind::MiniTask => {
                let Some(mini) = f.mini_task.clone() else {
                    return CommitOutcome::AppFailed;
                };
                for input in &mini.inputs {
                    let staged: std::pin::Pin<
                        Box<dyn std::future::Future<Output = CommitOutcome> + '_>,
                    > = Box::pin(self.send_input(w, t, input));
                    match staged.await {
                        CommitOutcome::Ok => {}
                        other => return other,
                    }
                }
                let spec = mini.to_json().to_string();
                let msg = ManagerMsg::MiniTask {
                    cache_name: f.cache_name.clone(),
                    size: f.expected_size(),
                    mode: f.mode_bits(),
                    spec_len: spec.len() as u64,
                };
                let deadline = self.transfer_deadline(spec.len() as u64);
                let mut payload = msg.to_string().into_bytes();
                payload.push(b'\n');
                payload.extend_from_slice(spec.as_bytes());
                t.bytes_sent += payload.len() as u64;
                self.stats.bytes_sent += payload.len() as u64;
                match w.link.send_bytes(&payload, deadline).await {
                    Ok(()) => {
                        w.files.insert(
                            f.cache_name.clone(),
                            RemoteFileInfo::pending(f.expected_size() as i64),
                        );
                        CommitOutcome::Ok
                    }
                    Err(_) => CommitOutcome::WorkerFailed,
                }
            }
            // A temp with no substitute source cannot be staged; the
            // planner refuses such dispatches before we get here.
            FileKind::Temp => CommitOutcome::Ok,
        }
    }

    async fn send_commit_line(
        &mut self,
        w: &mut WorkerEntry,
        t: &mut Task,
        line: &str,
        f: &File,
    ) -> CommitOutcome {
        let deadline = deadline_in(self.config.short_timeout);
        t.bytes_sent += line.len() as u64 + 1;
        self.stats.bytes_sent += line.len() as u64 + 1;
        match w.link.send_line(line, deadline).await {
            Ok(()) => {
                w.files.insert(
                    f.cache_name.clone(),
                    RemoteFileInfo::pending(f.expected_size() as i64),
                );
                CommitOutcome::Ok
            }
            Err(_) => CommitOutcome::WorkerFailed,
        }
    }

    async fn send_put(
        &mut self,
        w: &mut WorkerEntry,
        t: &mut Task,
        cache_name: &str,
        bytes: &[u8],
        mode: u32,
    ) -> CommitOutcome {
        let msg = ManagerMsg::Put {
            cache_name: cache_name.to_string(),
            size: bytes.len() as u64,
            mode,
        };
        let deadline = self.transfer_deadline(bytes.len() as u64);
        let mut payload = msg.to_string().into_bytes();
        payload.push(b'\n');
        payload.extend_from_slice(bytes);
        t.bytes_sent += payload.len() as u64;
        self.stats.bytes_sent += payload.len() as u64;
        w.bytes_sent += bytes.len() as u64;
        match w.link.send_bytes(&payload, deadline).await {
            Ok(()) => {
                w.files.insert(
                    cache_name.to_string(),
                    RemoteFileInfo::pending(bytes.len() as i64),
                );
                CommitOutcome::Ok
            }
            Err(_) => CommitOutcome::WorkerFailed,
        }
    }

    /// Detach a collected task from its worker, releasing the allocation
    /// envelope. The caller decides the task's next state.
    pub(crate) fn reap_task_from_worker(&mut self, w: &mut WorkerEntry, t: &mut Task) {
        if t.worker == Some(w.id) {
            w.total_task_time += t.time_workers_execute_last;
        } else {
            debug!(
                task = t.task_id,
                worker = w.id,
                "reaping a task from a worker that does not run it"
            );
        }
        w.task_envelopes.remove(&t.task_id);
        t.worker = None;
        w.recount_resources();
    }

    /// Cancel a task wherever it is. A running task's worker receives a
    /// kill, its uncached inputs and all outputs are deleted, and its
    /// envelope is released.
    pub(crate) async fn cancel_task_on_worker(&mut self, t: &mut Task) {
        let Some(wid) = t.worker else { return };
        self.send_to_worker(wid, &ManagerMsg::Kill {
            task_id: t.task_id as i64,
        })
        .await;
        debug!(task = t.task_id, worker = wid, "task cancelled at worker");

        let inputs = t.inputs.clone();
        let outputs = t.outputs.clone();
        if let Some(mut w) = self.workers.remove(&wid) {
            self.delete_worker_files(&mut w, &inputs, taskmill_protocol::FILE_FLAG_CACHE)
                .await;
            self.delete_worker_files(&mut w, &outputs, 0).await;
            self.reap_task_from_worker(&mut w, t);
            self.workers.insert(wid, w);
        } else {
            t.worker = None;
        }
    }

    /// Delete files on a worker, except those carrying `except_flags`.
    pub(crate) async fn delete_worker_files(
        &mut self,
        w: &mut WorkerEntry,
        files: &[File],
        except_flags: u32,
    ) {
        for f in files {
            if f.flags & except_flags != 0 {
                continue;
            }
            let deadline = deadline_in(self.config.short_timeout);
            let msg = ManagerMsg::Unlink {
                cache_name: f.cache_name.clone(),
            };
            let _ = w.link.send_line(&msg.to_string(), deadline).await;
            w.files.remove(&f.cache_name);
        }
    }
}

fn file_line(f: &File) -> TaskFileLine {
    TaskFileLine {
        cache_name: f.cache_name.clone(),
        remote_name: f.remote_name.clone(),
        flags: f.flags,
    }
}

pub(crate) fn monitor_remote_name(task_id: u64) -> String {
    format!(".taskmill-monitor-{task_id}.summary")
}

fn collect_dir_files(
    root: &Path,
    rel: PathBuf,
    out: &mut Vec<(PathBuf, PathBuf)>,
) -> std::io::Result<()> {
    for entry in std::fs::read_dir(root.join(&rel))? {
        let entry = entry?;
        let name = entry.file_name();
        let sub = rel.join(&name);
        let ty = entry.file_type()?;
        if ty.is_dir() {
            collect_dir_files(root, sub, out)?;
        } else if ty.is_file() {
            out.push((root.join(&sub), sub));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{attach_worker, test_manager};
    use crate::worker::RemoteFileInfo;

    fn url_input() -> File {
        File::url("http://example.test/data", 1 << 20, "data")
    }

    #[tokio::test]
    async fn planner_prefers_a_peer_with_the_file() {
        let mut m = test_manager().await;
        let (target, _c1) = attach_worker(&mut m, "target").await;
        let (peer, _c2) = attach_worker(&mut m, "peer").await;

        let mut inputs = vec![url_input()];
        let cache_name = inputs[0].cache_name().to_string();
        {
            let p = m.workers.get_mut(&peer).expect("peer");
            p.transfer_addr = Some(("10.0.0.2".to_string(), 9123));
            p.files.insert(
                cache_name.clone(),
                RemoteFileInfo {
                    size: 1 << 20,
                    in_cache: true,
                    transfer_time: 0,
                },
            );
        }

        assert!(m.resolve_transfer_sources(target, &mut inputs));
        assert_eq!(
            inputs[0].substitute.as_deref(),
            Some(format!("worker://10.0.0.2:9123/{cache_name}").as_str())
        );
    }

    #[tokio::test]
    async fn planner_skips_peers_at_their_transfer_cap() {
        let mut m = test_manager().await;
        let (target, _c1) = attach_worker(&mut m, "target").await;
        let (peer, _c2) = attach_worker(&mut m, "peer").await;

        let mut inputs = vec![url_input()];
        let cache_name = inputs[0].cache_name().to_string();
        {
            let p = m.workers.get_mut(&peer).expect("peer");
            p.transfer_addr = Some(("10.0.0.2".to_string(), 9123));
            p.files.insert(
                cache_name.clone(),
                RemoteFileInfo {
                    size: 1 << 20,
                    in_cache: true,
                    transfer_time: 0,
                },
            );
        }
        let peer_uri = peer_source_uri("10.0.0.2", 9123, &cache_name);
        for _ in 0..m.config.worker_source_max_transfers {
            m.transfers.add(target, &peer_uri);
        }

        // The peer is saturated; the origin URL still has its slot.
        assert!(m.resolve_transfer_sources(target, &mut inputs));
        assert!(inputs[0].substitute.is_none());

        // Saturate the origin too and the task has no viable source.
        m.transfers.add(target, "http://example.test/data");
        assert!(!m.resolve_transfer_sources(target, &mut inputs));
    }

    #[tokio::test]
    async fn planner_skips_files_already_on_the_target() {
        let mut m = test_manager().await;
        let (target, _c1) = attach_worker(&mut m, "target").await;

        let mut inputs = vec![url_input()];
        let cache_name = inputs[0].cache_name().to_string();
        m.workers
            .get_mut(&target)
            .expect("target")
            .files
            .insert(cache_name, RemoteFileInfo::pending(1 << 20));

        // Present (even in flight) means nothing to plan, even with the
        // origin saturated.
        m.transfers.add(target, "http://example.test/data");
        assert!(m.resolve_transfer_sources(target, &mut inputs));
        assert!(inputs[0].substitute.is_none());
    }

    #[tokio::test]
    async fn temp_without_a_peer_blocks_the_dispatch() {
        let mut m = test_manager().await;
        let (target, _c1) = attach_worker(&mut m, "target").await;
        let mut inputs = vec![File::temp("scratch")];
        assert!(!m.resolve_transfer_sources(target, &mut inputs));
    }
}
