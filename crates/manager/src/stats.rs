use serde::Serialize;

/// A snapshot of manager activity: connected workers, task counts by state,
/// lifetime counters, time accumulators (microseconds), and capacity
/// estimates. This struct is also the schema of the catalog record and the
/// performance log.
#[derive(Debug, Default, Clone, Serialize)]
pub struct Stats {
    /// Workers that completed the handshake.
    pub workers_connected: i64,
    /// Workers connected but not yet past the handshake.
    pub workers_init: i64,
    /// Connected workers with no running tasks.
    pub workers_idle: i64,
    /// Connected workers with at least one running task.
    pub workers_busy: i64,
    /// Connected workers able to fit the largest waiting task.
    pub workers_able: i64,

    /// Workers that ever completed the handshake.
    pub workers_joined: i64,
    /// Workers removed for any reason.
    pub workers_removed: i64,
    /// Workers released explicitly by the manager.
    pub workers_released: i64,
    /// Workers that disconnected themselves when idle.
    pub workers_idled_out: i64,
    /// Workers evicted by the slow-worker rule.
    pub workers_slow: i64,
    /// Times a hostname was blocked.
    pub workers_blocked: i64,
    /// Workers lost to connection failures.
    pub workers_lost: i64,

    /// Tasks waiting to be dispatched.
    pub tasks_waiting: i64,
    /// Tasks committed to workers (running or awaiting retrieval).
    pub tasks_on_workers: i64,
    /// Tasks currently executing.
    pub tasks_running: i64,
    /// Tasks whose results await retrieval.
    pub tasks_with_results: i64,

    /// Tasks ever submitted.
    pub tasks_submitted: i64,
    /// Task dispatches (a retried task counts again).
    pub tasks_dispatched: i64,
    /// Tasks returned to the caller.
    pub tasks_done: i64,
    /// Tasks returned with a failure result.
    pub tasks_failed: i64,
    /// Tasks cancelled by the caller.
    pub tasks_cancelled: i64,
    /// Attempts that ended in resource exhaustion.
    pub tasks_exhausted_attempts: i64,
    /// Tasks the caller still expects, when announced.
    pub tasks_left: i64,

    /// When this manager started, microseconds since epoch.
    pub time_when_started: u64,
    /// Time spent committing tasks to workers.
    pub time_send: u64,
    /// Time spent retrieving task outputs.
    pub time_receive: u64,
    /// Commit time attributable to successful tasks.
    pub time_send_good: u64,
    /// Retrieval time attributable to successful tasks.
    pub time_receive_good: u64,
    /// Time spent exchanging status messages with workers.
    pub time_status_msgs: u64,
    /// Time spent in internal bookkeeping.
    pub time_internal: u64,
    /// Time spent blocked polling the network.
    pub time_polling: u64,
    /// Time spent in the application between `wait()` calls.
    pub time_application: u64,
    /// Time spent choosing workers for tasks.
    pub time_scheduling: u64,

    /// Execution time accumulated on workers.
    pub time_workers_execute: u64,
    /// Execution time of successful tasks.
    pub time_workers_execute_good: u64,
    /// Execution time lost to resource exhaustion.
    pub time_workers_execute_exhaustion: u64,

    /// Bytes of task inputs sent.
    pub bytes_sent: u64,
    /// Bytes of task outputs received.
    pub bytes_received: u64,
    /// Recent transfer bandwidth, MB/s.
    pub bandwidth: f64,

    /// Estimated number of average-shaped tasks this manager could sustain.
    pub capacity_tasks: i64,
    /// Capacity expressed in cores.
    pub capacity_cores: i64,
    /// Capacity expressed in memory MB.
    pub capacity_memory: i64,
    /// Capacity expressed in disk MB.
    pub capacity_disk: i64,
    /// Capacity expressed in gpus.
    pub capacity_gpus: i64,
    /// Capacity computed from only the most recent task.
    pub capacity_instantaneous: i64,
    /// Exponentially smoothed capacity estimate.
    pub capacity_weighted: i64,
    /// Fraction of recent loop iterations that moved a task.
    pub manager_load: f64,

    /// Cores across all connected workers.
    pub total_cores: i64,
    /// Memory (MB) across all connected workers.
    pub total_memory: i64,
    /// Disk (MB) across all connected workers.
    pub total_disk: i64,
    /// Gpus across all connected workers.
    pub total_gpus: i64,
    /// Cores committed to running tasks.
    pub committed_cores: i64,
    /// Memory (MB) committed to running tasks.
    pub committed_memory: i64,
    /// Disk (MB) committed to running tasks.
    pub committed_disk: i64,
    /// Gpus committed to running tasks.
    pub committed_gpus: i64,
    /// Largest single-worker core count seen.
    pub max_cores: i64,
    /// Largest single-worker memory (MB) seen.
    pub max_memory: i64,
    /// Largest single-worker disk (MB) seen.
    pub max_disk: i64,
    /// Largest single-worker gpu count seen.
    pub max_gpus: i64,
    /// Smallest single-worker core count connected.
    pub min_cores: i64,
    /// Smallest single-worker memory (MB) connected.
    pub min_memory: i64,
    /// Smallest single-worker disk (MB) connected.
    pub min_disk: i64,
    /// Smallest single-worker gpu count connected.
    pub min_gpus: i64,
}
