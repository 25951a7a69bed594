use std::collections::{HashMap, HashSet};
use std::future::{poll_fn, Future};
use std::path::Path;
use std::task::Poll;

use tokio::net::TcpListener;
use tokio::time::{Duration, Instant};
use tracing::{debug, info, warn};

use crate::blocklist::Blocklist;
use crate::capacity::{update_manager_load, TaskReports};
use crate::category::{AllocationMode, Category};
use crate::clock::{now_usec, secs};
use crate::config::ManagerConfig;
use crate::error::ManagerError;
use crate::factory::FactoryTable;
use crate::link::Connection;
use crate::perf_log::PerfLog;
use crate::resources::ResourceSummary;
use crate::stats::Stats;
use crate::task::{Task, TaskResult, TaskState};
use crate::transfers::CurrentTransfers;
use crate::txn_log::TxnLog;
use crate::worker::{DisconnectReason, WorkerEntry, WorkerId, WorkerType};

#[derive(Debug, Clone)]
pub(crate) enum WaitFilter {
    Any,
    Tag(String),
    TaskId(u64),
}

/// The manager of a distributed task-execution system.
///
/// A `Manager` listens for worker connections, transfers task inputs,
/// dispatches tasks under resource constraints, collects results, and hands
/// completed tasks back through [`Manager::wait`]. All state lives on one
/// cooperative loop driven by `wait()`; no background tasks are spawned.
#[derive(Debug)]
pub struct Manager {
    pub(crate) config: ManagerConfig,
    pub(crate) listener: TcpListener,
    pub(crate) port: u16,

    pub(crate) workers: HashMap<WorkerId, WorkerEntry>,
    pub(crate) next_worker_id: WorkerId,
    pub(crate) workers_with_available_results: HashSet<WorkerId>,

    pub(crate) tasks: HashMap<u64, Task>,
    /// Ids of ready tasks, highest priority first.
    pub(crate) ready_list: Vec<u64>,
    pub(crate) next_task_id: u64,

    pub(crate) categories: HashMap<String, Category>,
    pub(crate) blocklist: Blocklist,
    pub(crate) transfers: CurrentTransfers,
    pub(crate) factories: FactoryTable,
    pub(crate) fetch_factory: bool,

    pub(crate) stats: Stats,
    pub(crate) stats_disconnected: Stats,
    pub(crate) task_reports: TaskReports,
    pub(crate) current_max_worker: ResourceSummary,
    pub(crate) max_task_resources_requested: ResourceSummary,
    pub(crate) local_memory_mb: Option<i64>,

    pub(crate) busy_waiting: bool,
    pub(crate) time_last_wait: u64,
    pub(crate) catalog_last_update: u64,
    pub(crate) factories_last_update: u64,
    pub(crate) resources_last_sample: u64,
    pub(crate) last_large_task_check: u64,
    pub(crate) last_perf_log: u64,
    pub(crate) link_poll_end: u64,

    pub(crate) perf_log: Option<PerfLog>,
    pub(crate) txn_log: Option<TxnLog>,
    pub(crate) monitor_dir: Option<std::path::PathBuf>,
    pub(crate) process_pending_flag: Option<std::sync::Arc<std::sync::atomic::AtomicBool>>,

    pub(crate) http: reqwest::Client,
}

pub(crate) struct PollOutcome {
    pub(crate) readable: Vec<WorkerId>,
    pub(crate) accepted: Vec<(tokio::net::TcpStream, std::net::SocketAddr)>,
}

impl Manager {
    /// Bind the listening socket and create a manager. With `port` 0 and a
    /// low/high range configured, the range is scanned for a free port.
    pub async fn listen(config: ManagerConfig) -> Result<Manager, ManagerError> {
        let listener = match (config.port, config.low_port, config.high_port) {
            (0, Some(low), Some(high)) if low <= high => {
                let mut bound = None;
                for port in low..=high {
                    if let Ok(l) = TcpListener::bind(("0.0.0.0", port)).await {
                        bound = Some(l);
                        break;
                    }
                }
                bound.ok_or(ManagerError::PortRange { low, high })?
            }
            (port, _, _) => TcpListener::bind(("0.0.0.0", port))
                .await
                .map_err(|source| ManagerError::Bind { port, source })?,
        };
        let port = listener
            .local_addr()
            .map_err(|source| ManagerError::Bind {
                port: config.port,
                source,
            })?
            .port();

        let http = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(60))
            .build()?;

        let now = now_usec();
        let mut manager = Manager {
            config,
            listener,
            port,
            workers: HashMap::new(),
            next_worker_id: 1,
            workers_with_available_results: HashSet::new(),
            tasks: HashMap::new(),
            ready_list: Vec::new(),
            next_task_id: 1,
            categories: HashMap::new(),
            blocklist: Blocklist::default(),
            transfers: CurrentTransfers::default(),
            factories: FactoryTable::default(),
            fetch_factory: false,
            stats: Stats {
                time_when_started: now,
                ..Stats::default()
            },
            stats_disconnected: Stats::default(),
            task_reports: TaskReports::default(),
            current_max_worker: ResourceSummary::zero(),
            max_task_resources_requested: ResourceSummary::unspecified(),
            local_memory_mb: None,
            busy_waiting: false,
            time_last_wait: 0,
            catalog_last_update: 0,
            factories_last_update: 0,
            resources_last_sample: 0,
            last_large_task_check: now,
            last_perf_log: 0,
            link_poll_end: now,
            perf_log: None,
            txn_log: None,
            monitor_dir: None,
            process_pending_flag: None,
            http,
        };
        if manager.config.disconnect_slow_workers_factor > 0.0 {
            let factor = manager.config.disconnect_slow_workers_factor;
            manager.lookup_or_create_category("default").slow_multiplier = factor;
        }
        info!(port = manager.port, "manager listening");
        Ok(manager)
    }

    /// The port this manager listens on.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The project name advertised to the catalog, if any.
    pub fn name(&self) -> Option<&str> {
        self.config.name.as_deref()
    }

    /// Submit a task, assigning its id. The task enters the ready list and
    /// is returned by a later `wait()` once it reaches a terminal state.
    /// A task object in a terminal state may be re-submitted; its
    /// accumulated statistics are reset.
    pub fn submit(&mut self, mut task: Task) -> Result<u64, ManagerError> {
        if task.task_id > 0 {
            if !task.state.is_terminal() && self.tasks.contains_key(&task.task_id) {
                return Err(ManagerError::AlreadySubmitted(task.task_id));
            }
            task.clean(true);
        }
        task.task_id = self.next_task_id;
        self.next_task_id += 1;

        let id = task.task_id;
        let mode = self.config.default_allocation_mode;
        let steady = self.config.category_steady_n_tasks;
        self.categories
            .entry(task.category.clone())
            .or_insert_with(|| Category::new(&task.category, mode, steady));

        task.time_when_submitted = now_usec();
        self.max_task_resources_requested
            .merge_max(&task.resources_requested);
        self.stats.tasks_submitted += 1;

        task.state = TaskState::Unknown;
        self.change_task_state(&mut task, TaskState::Ready);
        self.tasks.insert(id, task);
        Ok(id)
    }

    /// Raise the floor for assigned task ids: the next id will be at least
    /// `minid`. Ids never move backwards.
    pub fn set_id_floor(&mut self, minid: u64) {
        self.next_task_id = self.next_task_id.max(minid);
    }

    /// Wait up to `timeout` (forever when `None`) for any task to complete,
    /// driving the manager's network loop meanwhile. Returns at most one
    /// task per call unless `wait-retrieve-many` is tuned on.
    pub async fn wait(&mut self, timeout: Option<Duration>) -> Option<Task> {
        self.wait_internal(timeout, WaitFilter::Any).await
    }

    /// As [`Manager::wait`], but only a task carrying `tag` is returned.
    pub async fn wait_for_tag(&mut self, tag: &str, timeout: Option<Duration>) -> Option<Task> {
        self.wait_internal(timeout, WaitFilter::Tag(tag.to_string()))
            .await
    }

    /// As [`Manager::wait`], but only the task with `task_id` is returned.
    pub async fn wait_for_task_id(
        &mut self,
        task_id: u64,
        timeout: Option<Duration>,
    ) -> Option<Task> {
        self.wait_internal(timeout, WaitFilter::TaskId(task_id)).await
    }

    /// True when every submitted task has reached a terminal state.
    pub fn empty(&self) -> bool {
        !self.tasks.values().any(|t| {
            matches!(
                t.state,
                TaskState::Ready
                    | TaskState::Running
                    | TaskState::WaitingRetrieval
                    | TaskState::Retrieved
            )
        })
    }

    /// True when the ready backlog is below `hungry-minimum` and the
    /// projected resource demand of waiting tasks fits the connected
    /// workers (with overcommit applied; disk never overcommits).
    pub fn hungry(&self) -> bool {
        let waiting = self.ready_list.len() as i64;
        if waiting < self.config.hungry_minimum {
            return true;
        }

        let s = self.stats_snapshot();
        let over = |v: i64| (v as f64 * self.config.resource_submit_multiplier).ceil() as i64;
        let avail_cores = over(s.total_cores) - s.committed_cores;
        let avail_memory = over(s.total_memory) - s.committed_memory;
        let avail_gpus = over(s.total_gpus) - s.committed_gpus;
        let avail_disk = s.total_disk - s.committed_disk;

        let mut need = ResourceSummary::zero();
        for id in &self.ready_list {
            if let Some(t) = self.tasks.get(id) {
                let r = t.resources_requested;
                need.cores += r.cores.max(1);
                need.memory += r.memory.max(0);
                need.disk += r.disk.max(0);
                need.gpus += r.gpus.max(0);
            }
        }
        need.cores <= avail_cores
            && need.memory <= avail_memory
            && need.disk <= avail_disk
            && need.gpus <= avail_gpus
    }

    /// Adjust one performance knob by name; see [`ManagerConfig::tune`].
    pub fn tune(&mut self, name: &str, value: f64) -> Result<(), ManagerError> {
        self.config.tune(name, value)?;
        if name == "disconnect-slow-worker-factor" {
            self.enable_disconnect_slow_workers(value);
        }
        Ok(())
    }

    /// Block a hostname from connecting workers until `timeout_secs` from
    /// now have passed.
    pub fn block_host_with_timeout(&mut self, hostname: &str, timeout_secs: u64) {
        self.stats.workers_blocked += 1;
        self.blocklist
            .block(hostname, Some(now_usec() + secs(timeout_secs)));
    }

    /// Block a hostname indefinitely.
    pub fn block_host(&mut self, hostname: &str) {
        self.stats.workers_blocked += 1;
        self.blocklist.block(hostname, None);
    }

    /// Unblock a hostname unconditionally.
    pub fn unblock_host(&mut self, hostname: &str) {
        self.blocklist.unblock(hostname);
    }

    /// Clear the blocklist entirely.
    pub fn unblock_all(&mut self) {
        self.blocklist.clear();
    }

    /// Mark workers on a hostname as draining: they accept no further tasks
    /// and are released once idle. Returns how many workers matched.
    pub fn set_draining_by_hostname(&mut self, hostname: &str, drain: bool) -> usize {
        let mut n = 0;
        for w in self.workers.values_mut() {
            if w.hostname == hostname {
                w.draining = drain;
                n += 1;
            }
        }
        n
    }

    /// Release up to `n` connected workers (all of them when `n` is 0),
    /// restoring their running tasks to the ready list.
    pub async fn workers_shutdown(&mut self, n: usize) -> usize {
        let n = if n == 0 { self.workers.len() } else { n };
        let mut ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        ids.sort_unstable();
        let mut released = 0;
        for id in ids {
            if released >= n {
                break;
            }
            if self
                .workers
                .get(&id)
                .is_some_and(|w| w.kind == WorkerType::Worker)
            {
                self.release_worker(id).await;
                released += 1;
            }
        }
        released
    }

    /// Enable the performance log at `path`.
    pub fn enable_perf_log(&mut self, path: impl AsRef<Path>) -> Result<(), ManagerError> {
        let path = path.as_ref();
        let log = PerfLog::create(path).map_err(|source| ManagerError::LogFile {
            path: path.display().to_string(),
            source,
        })?;
        self.perf_log = Some(log);
        Ok(())
    }

    /// Enable the transaction log at `path`.
    pub fn enable_transactions_log(&mut self, path: impl AsRef<Path>) -> Result<(), ManagerError> {
        let path = path.as_ref();
        let log = TxnLog::create(path).map_err(|source| ManagerError::LogFile {
            path: path.display().to_string(),
            source,
        })?;
        self.txn_log = Some(log);
        Ok(())
    }

    /// Enable resource measurement: each task gains an implicit monitor
    /// summary output, parsed into its measured resources and written under
    /// `output_dir`.
    pub fn enable_monitoring(&mut self, output_dir: impl Into<std::path::PathBuf>) {
        self.monitor_dir = Some(output_dir.into());
    }

    /// Let `wait()` return early whenever the application raises `flag`
    /// (typically from a child-process completion handler), so local and
    /// remote execution can interleave. The flag is cleared on pickup.
    pub fn enable_process_pending_check(
        &mut self,
        flag: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) {
        self.process_pending_flag = Some(flag);
    }

    /// Announce how many tasks the application still intends to run; the
    /// count is surfaced to the catalog for factory sizing.
    pub fn set_tasks_left_count(&mut self, n: i64) {
        self.stats.tasks_left = n;
    }

    /// Set the slow-worker multiplier of the default category; tasks whose
    /// categories do not set their own inherit it.
    pub fn enable_disconnect_slow_workers(&mut self, multiplier: f64) {
        self.lookup_or_create_category("default").slow_multiplier = multiplier;
    }

    /// Set the slow-worker multiplier for one category. A multiplier of 0
    /// disables the check; a negative value inherits the default.
    pub fn enable_disconnect_slow_workers_category(&mut self, category: &str, multiplier: f64) {
        self.lookup_or_create_category(category).slow_multiplier = multiplier;
    }

    /// Set the allocation mode of a category.
    pub fn set_category_mode(&mut self, category: &str, mode: AllocationMode) {
        self.lookup_or_create_category(category).mode = mode;
    }

    /// Cap the resources tasks of a category may be allocated.
    pub fn set_category_resources_max(&mut self, category: &str, rm: &ResourceSummary) {
        self.lookup_or_create_category(category).max_allocation = *rm;
    }

    /// Floor the resources tasks of a category are allocated.
    pub fn set_category_resources_min(&mut self, category: &str, rm: &ResourceSummary) {
        self.lookup_or_create_category(category).min_allocation = *rm;
    }

    /// Override the first-allocation guess of a category.
    pub fn set_category_first_allocation_guess(&mut self, category: &str, rm: &ResourceSummary) {
        self.lookup_or_create_category(category).first_allocation_guess = *rm;
    }

    /// A statistics snapshot with current worker and task counts filled in.
    pub fn stats(&self) -> Stats {
        self.stats_snapshot()
    }

    /// The counters workers reported about themselves before disconnecting,
    /// accumulated across every removed worker.
    pub fn stats_disconnected_workers(&self) -> Stats {
        self.stats_disconnected.clone()
    }

    /// A copy of one category's accumulated statistics, if the category
    /// exists.
    pub fn category_stats(&self, category: &str) -> Option<crate::category::CategoryStats> {
        self.categories.get(category).map(|c| c.stats.clone())
    }

    /// Cancel a task by id. The task is returned immediately in cancelled
    /// state; if it was running, the worker is told to kill it and its
    /// staged files are deleted. Returns `None` for unknown ids, so a
    /// second cancel of the same id yields nothing.
    pub async fn cancel_by_id(&mut self, task_id: u64) -> Option<Task> {
        let mut t = self.tasks.remove(&task_id)?;
        self.cancel_task_on_worker(&mut t).await;
        self.change_task_state(&mut t, TaskState::Cancelled);
        self.stats.tasks_cancelled += 1;
        Some(t)
    }

    /// Cancel the first task carrying `tag`, as [`Manager::cancel_by_id`].
    pub async fn cancel_by_tag(&mut self, tag: &str) -> Option<Task> {
        let id = self
            .tasks
            .values()
            .find(|t| t.matches_tag(tag))
            .map(|t| t.task_id)?;
        self.cancel_by_id(id).await
    }

    /// Cancel every known task, returning them all. Workers receive a
    /// blanket kill and their staged files are deleted.
    pub async fn cancel_all(&mut self) -> Vec<Task> {
        let ids: Vec<u64> = self.tasks.keys().copied().collect();
        let mut out = Vec::with_capacity(ids.len());
        self.workers_with_available_results.clear();
        for id in ids {
            if let Some(t) = self.cancel_by_id(id).await {
                out.push(t);
            }
        }
        let wids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for wid in wids {
            self.send_to_worker(wid, &taskmill_protocol::ManagerMsg::Kill { task_id: -1 })
                .await;
        }
        out
    }

    /// Release every worker and close the log files. The manager is
    /// consumed; workers receive a `release` message first.
    pub async fn shutdown(mut self) {
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            self.release_worker(id).await;
        }
        self.write_perf_log(true);
    }

    pub(crate) fn lookup_or_create_category(&mut self, name: &str) -> &mut Category {
        let mode = self.config.default_allocation_mode;
        let steady = self.config.category_steady_n_tasks;
        self.categories
            .entry(name.to_string())
            .or_insert_with(|| Category::new(name, mode, steady))
    }

    /// Insert a task into the ready list honoring priority order. Tasks
    /// re-queued after resource exhaustion jump the queue so a too-small
    /// first allocation cannot starve big tasks forever.
    pub(crate) fn push_task_to_ready_list(&mut self, t: &mut Task) {
        if t.result == TaskResult::ResourceExhaustion {
            self.ready_list.insert(0, t.task_id);
        } else if t.priority != 0.0 {
            let pos = self
                .ready_list
                .iter()
                .position(|id| {
                    self.tasks
                        .get(id)
                        .is_none_or(|other| other.priority < t.priority)
                })
                .unwrap_or(self.ready_list.len());
            self.ready_list.insert(pos, t.task_id);
        } else {
            self.ready_list.push(t.task_id);
        }
        t.clean(false);
    }

    /// Move a task to a new state, maintaining the ready list and emitting
    /// log records. The task must be detached from the task table while
    /// its state changes.
    pub(crate) fn change_task_state(&mut self, t: &mut Task, new_state: TaskState) {
        let old_state = t.state;
        t.state = new_state;
        if old_state == TaskState::Ready {
            self.ready_list.retain(|id| *id != t.task_id);
        }
        debug!(
            task = t.task_id,
            from = old_state.as_str(),
            to = new_state.as_str(),
            "task state change"
        );
        if new_state == TaskState::Ready {
            // The head-insert for exhausted tasks keys off the old result,
            // so clear it only after the push.
            self.push_task_to_ready_list(t);
            t.result = TaskResult::Unknown;
        }
        self.write_txn_task(t);
        self.write_perf_log(false);
    }

    pub(crate) fn find_retrieved(&self, filter: &WaitFilter) -> Option<u64> {
        match filter {
            WaitFilter::Any => self
                .tasks
                .values()
                .find(|t| t.state == TaskState::Retrieved)
                .map(|t| t.task_id),
            WaitFilter::Tag(tag) => self
                .tasks
                .values()
                .find(|t| t.state == TaskState::Retrieved && t.matches_tag(tag))
                .map(|t| t.task_id),
            WaitFilter::TaskId(id) => self
                .tasks
                .get(id)
                .filter(|t| t.state == TaskState::Retrieved)
                .map(|t| t.task_id),
        }
    }

    async fn wait_internal(
        &mut self,
        timeout: Option<Duration>,
        filter: WaitFilter,
    ) -> Option<Task> {
        // Account the time the application held the task between waits.
        let now = now_usec();
        let since = if self.time_last_wait > 0 {
            self.time_last_wait
        } else {
            self.stats.time_when_started
        };
        self.stats.time_application += now.saturating_sub(since);

        let stoptime = timeout.map(|d| Instant::now() + d);
        let mut events: u64 = 0;
        let mut found: Option<Task> = None;

        loop {
            if let Some(st) = stoptime {
                if Instant::now() >= st {
                    break;
                }
            }

            // A retrieved task matching the filter ends the wait (unless
            // retrieve-many keeps the loop draining results first).
            if found.is_none() {
                if let Some(mut t) = self.find_retrieved(&filter).and_then(|id| self.tasks.remove(&id)) {
                    self.change_task_state(&mut t, TaskState::Done);
                    if t.result != TaskResult::Success {
                        self.stats.tasks_failed += 1;
                    }
                    events += 1;
                    if !self.config.wait_retrieve_many {
                        self.write_perf_log(true);
                        self.time_last_wait = now_usec();
                        return Some(t);
                    }
                    found = Some(t);
                }
            }

            if self.config.name.is_some() {
                self.update_catalog(false).await;
            }
            self.sample_local_resources();

            // All outstanding worker traffic is handled before any dispatch
            // below; receiving results bounds memory ahead of submission.
            let poll = self.poll_active_workers(stoptime).await;
            if poll > 0 {
                events += 1;
            }

            self.busy_waiting = false;

            if self.receive_one_task().await {
                events += 1;
                self.stats.manager_load = update_manager_load(self.stats.manager_load, true);
                continue;
            }

            let internal_start = now_usec();
            let expired = self.expire_ready_tasks();
            self.stats.time_internal += now_usec().saturating_sub(internal_start);
            if expired {
                events += 1;
                self.stats.manager_load = update_manager_load(self.stats.manager_load, true);
                continue;
            }

            self.stats.manager_load = update_manager_load(self.stats.manager_load, false);

            if self.workers.len() >= self.config.wait_for_workers {
                if self.config.wait_for_workers > 0 {
                    debug!(
                        workers = self.workers.len(),
                        "target number of workers reached"
                    );
                    self.config.wait_for_workers = 0;
                }
                if self.send_one_task().await {
                    events += 1;
                    self.stats.manager_load =
                        update_manager_load(self.stats.manager_load, true);
                    continue;
                }
            }

            let status_start = now_usec();
            self.ask_for_workers_updates().await;
            self.stats.time_status_msgs += now_usec().saturating_sub(status_start);

            let internal_start = now_usec();
            let mut removed = self.disconnect_slow_workers().await;
            removed += self.shutdown_drained_workers().await;
            removed += self.enforce_worker_end_times().await;
            self.blocklist.unblock_all_by_time(now_usec());
            self.stats.time_internal += now_usec().saturating_sub(internal_start);
            if removed > 0 {
                events += 1;
                continue;
            }

            if self.fetch_factory
                && now_usec().saturating_sub(self.factories_last_update)
                    >= secs(self.config.catalog_update_interval)
            {
                self.factories_last_update = now_usec();
                self.update_catalog_factories().await;
            }

            if events > 0 && self.empty() {
                break;
            }

            if let Some(flag) = &self.process_pending_flag {
                if flag.swap(false, std::sync::atomic::Ordering::SeqCst) {
                    events += 1;
                    break;
                }
            }

            let now = now_usec();
            if now.saturating_sub(self.last_large_task_check)
                >= secs(self.config.large_task_check_interval)
            {
                self.last_large_task_check = now;
                self.check_for_large_tasks();
            }

            // Reaching this point means nothing progressed this iteration;
            // with a task already in hand, retrieve-many is done draining.
            if found.is_some() {
                break;
            }

            // Nothing moved this iteration: let the next poll sleep.
            self.busy_waiting = true;
        }

        if events > 0 {
            self.write_perf_log(true);
        }
        self.time_last_wait = now_usec();
        found
    }

    /// Poll every worker link plus the listening socket, with a bounded
    /// sleep only when the previous iteration made no progress. Readable
    /// links each have one message dispatched; pending accepts become new
    /// worker records; queued `available_results` notifications are
    /// drained. Returns the number of workers that failed.
    pub(crate) async fn poll_active_workers(&mut self, stoptime: Option<Instant>) -> usize {
        let mut wait = if self.busy_waiting {
            Duration::from_millis(1000)
        } else {
            Duration::ZERO
        };
        if let Some(st) = stoptime {
            let remaining = st.saturating_duration_since(Instant::now());
            wait = wait.min(remaining);
        }

        // Lines already buffered must be handled before sleeping.
        let buffered: Vec<WorkerId> = self
            .workers
            .iter()
            .filter(|(_, w)| w.link.has_buffered_line())
            .map(|(id, _)| *id)
            .collect();
        if !buffered.is_empty() {
            wait = Duration::ZERO;
        }

        let poll_start = now_usec();
        let outcome = {
            let sleep = tokio::time::sleep(wait);
            tokio::pin!(sleep);
            let listener = &self.listener;
            let workers = &self.workers;
            let max_accepts = self.config.max_new_workers;
            let mut readable: Vec<WorkerId> = buffered.clone();
            let mut accepted = Vec::new();
            poll_fn(|cx| {
                let mut any = !readable.is_empty();
                for (id, w) in workers.iter() {
                    if readable.contains(id) {
                        continue;
                    }
                    if let Poll::Ready(res) = w.link.poll_readable(cx) {
                        // Socket errors surface as a failed read below.
                        let _ = res;
                        readable.push(*id);
                        any = true;
                    }
                }
                while accepted.len() < max_accepts {
                    match listener.poll_accept(cx) {
                        Poll::Ready(Ok(conn)) => {
                            accepted.push(conn);
                            any = true;
                        }
                        Poll::Ready(Err(err)) => {
                            debug!(error = %err, "accept failed");
                            break;
                        }
                        Poll::Pending => break,
                    }
                }
                if any || sleep.as_mut().poll(cx).is_ready() {
                    Poll::Ready(())
                } else {
                    Poll::Pending
                }
            })
            .await;
            PollOutcome {
                readable,
                accepted,
            }
        };
        self.link_poll_end = now_usec();
        self.stats.time_polling += self.link_poll_end.saturating_sub(poll_start);

        let status_start = now_usec();
        let mut workers_failed = 0;
        for id in outcome.readable {
            if self.workers.contains_key(&id) && !self.handle_worker(id).await {
                workers_failed += 1;
            }
        }

        for (stream, peer) in outcome.accepted {
            self.add_worker(stream, peer).await;
        }

        let pending: Vec<WorkerId> =
            self.workers_with_available_results.drain().collect();
        for id in pending {
            if self.workers.contains_key(&id) {
                self.get_available_results(id).await;
            }
        }
        self.stats.time_status_msgs += now_usec().saturating_sub(status_start);

        workers_failed
    }

    /// Register a freshly accepted connection, subject to the blocklist and
    /// the optional password challenge.
    pub(crate) async fn add_worker(
        &mut self,
        stream: tokio::net::TcpStream,
        peer: std::net::SocketAddr,
    ) {
        let host = peer.ip().to_string();
        if self.blocklist.is_blocked(&host) {
            debug!(%peer, "rejecting connection from blocked host");
            return;
        }
        let id = self.next_worker_id;
        self.next_worker_id += 1;
        let mut w = WorkerEntry::new(id, Connection::new(stream, peer), now_usec());
        debug!(worker = id, %peer, "worker connected");

        if self.config.password.is_some() {
            let nonce = format!("{:016x}", rand::random::<u64>());
            let deadline = crate::link::deadline_in(self.config.short_timeout);
            let challenge = taskmill_protocol::ManagerMsg::Challenge {
                nonce: nonce.clone(),
            };
            if w.link
                .send_line(&challenge.to_string(), deadline)
                .await
                .is_err()
            {
                return;
            }
            w.challenge_nonce = Some(nonce);
        } else {
            w.authenticated = true;
        }

        self.workers.insert(id, w);
    }

    /// Count workers of a given type.
    pub(crate) fn count_workers(&self, kind: WorkerType) -> i64 {
        self.workers.values().filter(|w| w.kind == kind).count() as i64
    }

    /// Send one control line to a worker; a failed send removes the worker.
    /// Returns false when the worker failed.
    pub(crate) async fn send_to_worker(
        &mut self,
        id: WorkerId,
        msg: &taskmill_protocol::ManagerMsg,
    ) -> bool {
        let deadline = crate::link::deadline_in(self.config.short_timeout);
        let line = msg.to_string();
        let Some(w) = self.workers.get_mut(&id) else {
            return false;
        };
        debug!(worker = id, tx = %line);
        if w.link.send_line(&line, deadline).await.is_err() {
            self.handle_worker_failure(id).await;
            return false;
        }
        true
    }

    /// Remove a worker on connection failure, restoring its tasks.
    pub(crate) async fn handle_worker_failure(&mut self, id: WorkerId) {
        self.stats.workers_lost += 1;
        self.remove_worker(id, DisconnectReason::Failure).await;
    }

    /// Remove a worker: requeue its running tasks with the commit delta
    /// folded into failure time, discard its cache index, release its
    /// transfer slots, and recompute the largest-worker record.
    pub(crate) async fn remove_worker(&mut self, id: WorkerId, reason: DisconnectReason) {
        let Some(w) = self.workers.remove(&id) else {
            return;
        };
        self.remove_worker_entry(w, reason);
    }

    /// As [`Manager::remove_worker`], for an entry already detached from
    /// the worker table.
    pub(crate) fn remove_worker_entry(&mut self, mut w: WorkerEntry, reason: DisconnectReason) {
        let id = w.id;
        debug!(worker = id, hostname = %w.hostname, reason = reason.as_str(), "worker removed");
        if w.kind == WorkerType::Worker {
            self.stats.workers_removed += 1;
        }
        self.write_txn_worker(&w, Some(reason));

        self.transfers.wipe_worker(id);
        self.workers_with_available_results.remove(&id);

        let task_ids: Vec<u64> = w.task_envelopes.keys().copied().collect();
        for task_id in task_ids {
            if let Some(mut t) = self.tasks.remove(&task_id) {
                if t.time_when_commit_end >= t.time_when_commit_start {
                    let delta = now_usec().saturating_sub(t.time_when_commit_end);
                    t.time_workers_execute_failure += delta;
                    t.time_workers_execute_all += delta;
                }
                t.worker = None;
                self.change_task_state(&mut t, TaskState::Ready);
                self.tasks.insert(task_id, t);
            }
        }
        w.task_envelopes.clear();
        w.files.clear();

        // Fold the worker's self-reported counters into the totals kept
        // for disconnected workers.
        self.stats_disconnected.time_send += w.reported.time_send;
        self.stats_disconnected.time_receive += w.reported.time_receive;
        self.stats_disconnected.time_workers_execute += w.reported.time_execute;
        self.stats_disconnected.bytes_sent += w.reported.bytes_sent;
        self.stats_disconnected.bytes_received += w.reported.bytes_received;

        if let Some(factory) = &w.factory_name {
            self.factories.lookup_or_create(factory).connected_workers -= 1;
        }

        self.find_max_worker();
    }

    /// Gently release a worker with a `release` message before removal.
    pub(crate) async fn release_worker(&mut self, id: WorkerId) {
        if self
            .send_to_worker(id, &taskmill_protocol::ManagerMsg::Release)
            .await
        {
            self.remove_worker(id, DisconnectReason::Explicit).await;
            self.stats.workers_released += 1;
        }
    }

    /// Forcibly shut a worker down with an `exit` message.
    pub(crate) async fn shut_down_worker(&mut self, id: WorkerId) {
        if self
            .send_to_worker(id, &taskmill_protocol::ManagerMsg::Exit)
            .await
        {
            self.remove_worker(id, DisconnectReason::Explicit).await;
            self.stats.workers_released += 1;
        }
    }

    /// Track the largest per-dimension worker capacity seen.
    pub(crate) fn update_max_worker(&mut self, id: WorkerId) {
        if let Some(w) = self.workers.get(&id) {
            if w.resources.workers.total < 1 {
                return;
            }
            self.current_max_worker.merge_max(&ResourceSummary {
                cores: w.resources.cores.largest,
                memory: w.resources.memory.largest,
                disk: w.resources.disk.largest,
                gpus: w.resources.gpus.largest,
            });
        }
    }

    /// Recompute the largest-worker record from scratch (after removal).
    pub(crate) fn find_max_worker(&mut self) {
        self.current_max_worker = ResourceSummary::zero();
        let ids: Vec<WorkerId> = self.workers.keys().copied().collect();
        for id in ids {
            self.update_max_worker(id);
        }
    }

    /// Log ready tasks whose minimum request exceeds every connected
    /// worker's capacity; they cannot be scheduled as things stand.
    pub(crate) fn check_for_large_tasks(&self) {
        for id in &self.ready_list {
            let Some(t) = self.tasks.get(id) else { continue };
            let min = self.task_min_resources(t);
            let m = &self.current_max_worker;
            let too_big = (min.cores > 0 && min.cores > m.cores)
                || (min.memory > 0 && min.memory > m.memory)
                || (min.disk > 0 && min.disk > m.disk)
                || (min.gpus > 0 && min.gpus > m.gpus);
            if too_big {
                warn!(
                    task = t.task_id,
                    category = %t.category,
                    "task needs more resources than any connected worker offers"
                );
            }
        }
    }

    /// The smallest allocation a task must be granted: its explicit request
    /// raised to the category floor.
    pub(crate) fn task_min_resources(&self, t: &Task) -> ResourceSummary {
        let mut min = t.resources_requested;
        if let Some(c) = self.categories.get(&t.category) {
            min.merge_max(&c.min_allocation);
        }
        min
    }

    /// Sample the manager's own memory footprint at the configured
    /// interval, for operator diagnostics and the transaction log.
    pub(crate) fn sample_local_resources(&mut self) {
        let now = now_usec();
        if now.saturating_sub(self.resources_last_sample)
            < secs(self.config.resource_sample_interval)
        {
            return;
        }
        self.resources_last_sample = now;
        if let Ok(status) = std::fs::read_to_string("/proc/self/status") {
            for line in status.lines() {
                if let Some(kb) = line.strip_prefix("VmRSS:") {
                    let kb: i64 = kb
                        .trim()
                        .trim_end_matches(" kB")
                        .trim()
                        .parse()
                        .unwrap_or(0);
                    let mb = kb / 1024;
                    self.local_memory_mb = Some(mb);
                    debug!(memory_mb = mb, "manager resource sample");
                    if let Some(log) = self.txn_log.as_mut() {
                        let extra = format!("memory {mb}");
                        log.write("MANAGER", "self", "RESOURCES", Some(&extra));
                    }
                    break;
                }
            }
        }
    }

    /// The manager's own resident memory from the most recent sample, MB.
    pub fn local_memory_mb(&self) -> Option<i64> {
        self.local_memory_mb
    }

    /// Fill the computed (current-state) fields of the statistics record.
    pub(crate) fn stats_snapshot(&self) -> Stats {
        let mut s = self.stats.clone();
        s.workers_connected = self.count_workers(WorkerType::Worker);
        s.workers_init = self.count_workers(WorkerType::Unknown);
        s.workers_idle = self
            .workers
            .values()
            .filter(|w| w.kind == WorkerType::Worker && w.running_task_count() == 0)
            .count() as i64;
        s.workers_busy = s.workers_connected - s.workers_idle;

        s.tasks_waiting = self.ready_list.len() as i64;
        s.tasks_running = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::Running)
            .count() as i64;
        s.tasks_with_results = self
            .tasks
            .values()
            .filter(|t| t.state == TaskState::WaitingRetrieval)
            .count() as i64;
        s.tasks_on_workers = s.tasks_running + s.tasks_with_results;

        let mut total = ResourceSummary::zero();
        let mut committed = ResourceSummary::zero();
        let mut min = ResourceSummary::unspecified();
        let largest = self.current_max_worker;
        let mut able = 0;
        let fit_demand = self.max_task_resources_requested.specified_or(0);
        for w in self.workers.values() {
            if !w.is_ready_worker() {
                continue;
            }
            total.cores += w.resources.cores.total;
            total.memory += w.resources.memory.total;
            total.disk += w.resources.disk.total;
            total.gpus += w.resources.gpus.total;
            committed.cores += w.resources.cores.inuse;
            committed.memory += w.resources.memory.inuse;
            committed.disk += w.resources.disk.inuse;
            committed.gpus += w.resources.gpus.inuse;
            let wmin = ResourceSummary {
                cores: w.resources.cores.total,
                memory: w.resources.memory.total,
                disk: w.resources.disk.total,
                gpus: w.resources.gpus.total,
            };
            if min.is_unspecified() {
                min = wmin;
            } else {
                min.cores = min.cores.min(wmin.cores);
                min.memory = min.memory.min(wmin.memory);
                min.disk = min.disk.min(wmin.disk);
                min.gpus = min.gpus.min(wmin.gpus);
            }
            if crate::sched::check_worker_fit(
                &w.resources,
                &fit_demand,
                self.config.resource_submit_multiplier,
            ) {
                able += 1;
            }
        }
        s.workers_able = able;
        s.total_cores = total.cores;
        s.total_memory = total.memory;
        s.total_disk = total.disk;
        s.total_gpus = total.gpus;
        s.committed_cores = committed.cores;
        s.committed_memory = committed.memory;
        s.committed_disk = committed.disk;
        s.committed_gpus = committed.gpus;
        s.max_cores = largest.cores;
        s.max_memory = largest.memory;
        s.max_disk = largest.disk;
        s.max_gpus = largest.gpus;
        s.min_cores = min.cores.max(0);
        s.min_memory = min.memory.max(0);
        s.min_disk = min.disk.max(0);
        s.min_gpus = min.gpus.max(0);

        let elapsed = (s.time_send + s.time_receive).max(1);
        s.bandwidth =
            (s.bytes_sent + s.bytes_received) as f64 / elapsed as f64;

        self.task_reports
            .compute_capacity(&mut s, self.config.default_capacity_tasks);
        s
    }

    pub(crate) fn write_perf_log(&mut self, force: bool) {
        let now = now_usec();
        if !force
            && now.saturating_sub(self.last_perf_log) < secs(self.config.perf_log_interval)
        {
            return;
        }
        self.last_perf_log = now;
        if self.perf_log.is_some() {
            let snapshot = self.stats_snapshot();
            if let Some(log) = self.perf_log.as_mut() {
                log.write_snapshot(&snapshot);
            }
        }
    }

    pub(crate) fn write_txn_task(&mut self, t: &Task) {
        if let Some(log) = self.txn_log.as_mut() {
            let id = t.task_id.to_string();
            let extra = if t.state.is_terminal() || t.state == TaskState::Retrieved {
                Some(format!("{} {}", t.result.as_str(), t.exit_code))
            } else {
                None
            };
            log.write("TASK", &id, t.state.as_str(), extra.as_deref());
        }
    }

    pub(crate) fn write_txn_worker(&mut self, w: &WorkerEntry, removed: Option<DisconnectReason>) {
        if let Some(log) = self.txn_log.as_mut() {
            match removed {
                Some(reason) => log.write(
                    "WORKER",
                    &w.addrport,
                    "REMOVED",
                    Some(reason.as_str()),
                ),
                None => log.write("WORKER", &w.addrport, "CONNECTED", Some(&w.hostname)),
            }
        }
    }

    pub(crate) fn write_txn_category(&mut self, name: &str) {
        let stats = self.categories.get(name).map(|c| c.stats.clone());
        if let (Some(log), Some(stats)) = (self.txn_log.as_mut(), stats) {
            let extra = format!("{} {}", stats.tasks_done, stats.tasks_failed);
            log.write("CATEGORY", name, "UPDATED", Some(&extra));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::test_manager;

    #[tokio::test]
    async fn ready_list_orders_by_priority() {
        let mut m = test_manager().await;
        let mut low = Task::new("low");
        low.set_priority(1.0);
        let mut high = Task::new("high");
        high.set_priority(10.0);
        let plain = Task::new("plain");

        let plain_id = m.submit(plain).unwrap();
        let low_id = m.submit(low).unwrap();
        let high_id = m.submit(high).unwrap();

        assert_eq!(m.ready_list, vec![high_id, low_id, plain_id]);
    }

    #[tokio::test]
    async fn exhausted_tasks_jump_the_queue() {
        let mut m = test_manager().await;
        let first = m.submit(Task::new("a")).unwrap();
        let second = m.submit(Task::new("b")).unwrap();

        let mut t = Task::new("exhausted");
        t.task_id = 99;
        t.result = TaskResult::ResourceExhaustion;
        m.tasks.insert(99, t.clone());
        m.push_task_to_ready_list(&mut t);
        m.tasks.insert(99, t);

        assert_eq!(m.ready_list, vec![99, first, second]);
    }

    #[tokio::test]
    async fn resubmitting_a_terminal_task_resets_it() {
        let mut m = test_manager().await;
        let mut t = Task::new("again");
        t.task_id = 7;
        t.state = TaskState::Done;
        t.try_count = 4;
        t.exit_code = 3;
        let new_id = m.submit(t).unwrap();
        assert_ne!(new_id, 7);
        let resubmitted = &m.tasks[&new_id];
        assert_eq!(resubmitted.try_count, 0);
        assert_eq!(resubmitted.state, TaskState::Ready);
    }

    #[tokio::test]
    async fn expired_end_time_yields_task_timeout() {
        let mut m = test_manager().await;
        let mut t = Task::new("late");
        t.set_end_time(1);
        let id = m.submit(t).unwrap();
        assert!(m.expire_ready_tasks());
        assert_eq!(m.tasks[&id].state, TaskState::Retrieved);
        assert_eq!(m.tasks[&id].result, TaskResult::TaskTimeout);
    }

    #[tokio::test]
    async fn exhausted_retry_budget_yields_max_retries() {
        let mut m = test_manager().await;
        let mut t = Task::new("flappy");
        t.set_max_retries(2);
        let id = m.submit(t).unwrap();
        m.tasks.get_mut(&id).unwrap().try_count = 3;
        assert!(m.expire_ready_tasks());
        assert_eq!(m.tasks[&id].result, TaskResult::MaxRetries);
    }
}
