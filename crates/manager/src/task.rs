use crate::file::File;
use crate::resources::{ResourceSummary, ResourcesMeasured};
use crate::worker::WorkerId;

/// Where a task currently is in its lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    /// Waiting to be matched with a worker.
    Ready,
    /// Committed to a worker and executing.
    Running,
    /// The worker reported a result; outputs not yet fetched.
    WaitingRetrieval,
    /// Outputs fetched; waiting to be handed back through `wait()`.
    Retrieved,
    /// Returned to the caller.
    Done,
    /// Cancelled by the caller.
    Cancelled,
    /// Not known to this manager.
    Unknown,
}

impl TaskState {
    pub(crate) fn as_str(self) -> &'static str {
        match self {
            TaskState::Ready => "READY",
            TaskState::Running => "RUNNING",
            TaskState::WaitingRetrieval => "WAITING_RETRIEVAL",
            TaskState::Retrieved => "RETRIEVED",
            TaskState::Done => "DONE",
            TaskState::Cancelled => "CANCELLED",
            TaskState::Unknown => "UNKNOWN",
        }
    }

    pub(crate) fn is_terminal(self) -> bool {
        matches!(
            self,
            TaskState::Done | TaskState::Cancelled | TaskState::Unknown
        )
    }
}

/// Terminal outcome of a task, distinct enough to drive client-side retry
/// policy. `Success` only means the task ran and returned; consult
/// [`Task::exit_code`] for the command's own verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskResult {
    /// The task ran to completion on a worker.
    Success,
    /// An input could not be staged.
    InputMissing,
    /// A declared output was not produced.
    OutputMissing,
    /// The stdout stream could not be stored in full.
    StdoutMissing,
    /// The command was terminated by a signal.
    Signal,
    /// The task exceeded its resource allocation.
    ResourceExhaustion,
    /// The task's absolute end time passed before completion.
    TaskTimeout,
    /// No result has been observed yet.
    Unknown,
    /// The worker gave the task up without running it to completion.
    Forsaken,
    /// The retry budget was exhausted.
    MaxRetries,
    /// The task exceeded its maximum run time.
    MaxWallTime,
    /// The worker ran out of disk while running the task.
    DiskAllocFull,
    /// The resource monitor output could not be recovered.
    MonitorError,
    /// An output could not be transferred back.
    OutputTransferError,
}

impl TaskResult {
    /// The numeric code carried in `result` wire messages.
    pub fn code(self) -> i32 {
        match self {
            TaskResult::Success => 0,
            TaskResult::InputMissing => 1,
            TaskResult::OutputMissing => 2,
            TaskResult::StdoutMissing => 4,
            TaskResult::Signal => 1 << 3,
            TaskResult::ResourceExhaustion => 1 << 4,
            TaskResult::TaskTimeout => 1 << 5,
            TaskResult::Unknown => 1 << 6,
            TaskResult::Forsaken => 1 << 7,
            TaskResult::MaxRetries => 1 << 8,
            TaskResult::MaxWallTime => 1 << 9,
            TaskResult::DiskAllocFull => 1 << 10,
            TaskResult::MonitorError => 1 << 11,
            TaskResult::OutputTransferError => 1 << 12,
        }
    }

    /// Decode a wire result code; unrecognized values map to `Unknown`.
    pub fn from_code(code: i32) -> TaskResult {
        match code {
            0 => TaskResult::Success,
            1 => TaskResult::InputMissing,
            2 => TaskResult::OutputMissing,
            4 => TaskResult::StdoutMissing,
            8 => TaskResult::Signal,
            16 => TaskResult::ResourceExhaustion,
            32 => TaskResult::TaskTimeout,
            128 => TaskResult::Forsaken,
            256 => TaskResult::MaxRetries,
            512 => TaskResult::MaxWallTime,
            1024 => TaskResult::DiskAllocFull,
            2048 => TaskResult::MonitorError,
            4096 => TaskResult::OutputTransferError,
            _ => TaskResult::Unknown,
        }
    }

    /// Short fixed string used in logs and status records.
    pub fn as_str(self) -> &'static str {
        match self {
            TaskResult::Success => "SUCCESS",
            TaskResult::InputMissing => "INPUT_MISS",
            TaskResult::OutputMissing => "OUTPUT_MISS",
            TaskResult::StdoutMissing => "STDOUT_MISS",
            TaskResult::Signal => "SIGNAL",
            TaskResult::ResourceExhaustion => "RESOURCE_EXHAUSTION",
            TaskResult::TaskTimeout => "END_TIME",
            TaskResult::Unknown => "UNKNOWN",
            TaskResult::Forsaken => "FORSAKEN",
            TaskResult::MaxRetries => "MAX_RETRIES",
            TaskResult::MaxWallTime => "MAX_WALL_TIME",
            TaskResult::DiskAllocFull => "DISK_FULL",
            TaskResult::MonitorError => "MONITOR_ERROR",
            TaskResult::OutputTransferError => "OUTPUT_TRANSFER_ERROR",
        }
    }
}

/// The allocation tier a task is currently requesting from its category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationTier {
    /// The category's first-allocation guess (or the plain request).
    First,
    /// The category's maximum known-good allocation.
    Max,
}

/// A shell command with named inputs, outputs, environment and a resource
/// request. Created by the caller, submitted to a [`crate::Manager`], and
/// handed back through `wait()` once it reaches a terminal state.
#[derive(Debug, Clone)]
pub struct Task {
    pub(crate) task_id: u64,
    pub(crate) command: String,
    pub(crate) tag: Option<String>,
    pub(crate) category: String,
    pub(crate) inputs: Vec<File>,
    pub(crate) outputs: Vec<File>,
    pub(crate) env: Vec<(String, String)>,
    pub(crate) resources_requested: ResourceSummary,
    pub(crate) start_time: u64,
    pub(crate) end_time: u64,
    pub(crate) wall_time: u64,
    pub(crate) priority: f64,
    pub(crate) max_retries: u64,

    pub(crate) state: TaskState,
    pub(crate) allocation_tier: AllocationTier,
    pub(crate) result: TaskResult,
    pub(crate) exit_code: i32,
    pub(crate) output: Option<Vec<u8>>,
    pub(crate) resources_measured: Option<ResourcesMeasured>,
    pub(crate) resources_allocated: ResourceSummary,
    pub(crate) worker: Option<WorkerId>,
    pub(crate) worker_hostname: Option<String>,
    pub(crate) worker_addrport: Option<String>,

    pub(crate) try_count: u64,
    pub(crate) forsaken_count: u64,
    pub(crate) exhausted_attempts: u64,
    pub(crate) slow_strikes: u64,

    pub(crate) time_when_submitted: u64,
    pub(crate) time_when_commit_start: u64,
    pub(crate) time_when_commit_end: u64,
    pub(crate) time_when_retrieval: u64,
    pub(crate) time_when_done: u64,
    pub(crate) time_workers_execute_last: u64,
    pub(crate) time_workers_execute_all: u64,
    pub(crate) time_workers_execute_failure: u64,
    pub(crate) bytes_sent: u64,
    pub(crate) bytes_received: u64,
}

impl Task {
    /// Create a task running the given shell command.
    pub fn new(command: impl Into<String>) -> Task {
        Task {
            task_id: 0,
            command: command.into(),
            tag: None,
            category: "default".to_string(),
            inputs: Vec::new(),
            outputs: Vec::new(),
            env: Vec::new(),
            resources_requested: ResourceSummary::unspecified(),
            start_time: 0,
            end_time: 0,
            wall_time: 0,
            priority: 0.0,
            max_retries: 0,
            state: TaskState::Unknown,
            allocation_tier: AllocationTier::First,
            result: TaskResult::Unknown,
            exit_code: -1,
            output: None,
            resources_measured: None,
            resources_allocated: ResourceSummary::unspecified(),
            worker: None,
            worker_hostname: None,
            worker_addrport: None,
            try_count: 0,
            forsaken_count: 0,
            exhausted_attempts: 0,
            slow_strikes: 0,
            time_when_submitted: 0,
            time_when_commit_start: 0,
            time_when_commit_end: 0,
            time_when_retrieval: 0,
            time_when_done: 0,
            time_workers_execute_last: 0,
            time_workers_execute_all: 0,
            time_workers_execute_failure: 0,
            bytes_sent: 0,
            bytes_received: 0,
        }
    }

    /// Add an input binding.
    pub fn add_input(&mut self, file: File) -> &mut Task {
        self.inputs.push(file);
        self
    }

    /// Add an output binding.
    pub fn add_output(&mut self, file: File) -> &mut Task {
        self.outputs.push(file);
        self
    }

    /// Set one environment variable for the command.
    pub fn set_env_var(&mut self, key: impl Into<String>, value: impl Into<String>) -> &mut Task {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Set the human-readable tag used by `wait_for_tag` and cancellation.
    pub fn set_tag(&mut self, tag: impl Into<String>) -> &mut Task {
        self.tag = Some(tag.into());
        self
    }

    /// Assign the task to a category. Tasks default to `"default"`.
    pub fn set_category(&mut self, category: impl Into<String>) -> &mut Task {
        self.category = category.into();
        self
    }

    /// Request a number of cores.
    pub fn set_cores(&mut self, cores: i64) -> &mut Task {
        self.resources_requested.cores = cores;
        self
    }

    /// Request memory in MB.
    pub fn set_memory(&mut self, memory_mb: i64) -> &mut Task {
        self.resources_requested.memory = memory_mb;
        self
    }

    /// Request disk in MB.
    pub fn set_disk(&mut self, disk_mb: i64) -> &mut Task {
        self.resources_requested.disk = disk_mb;
        self
    }

    /// Request a number of gpus.
    pub fn set_gpus(&mut self, gpus: i64) -> &mut Task {
        self.resources_requested.gpus = gpus;
        self
    }

    /// Earliest time (microseconds since epoch) the task may be dispatched.
    pub fn set_start_time(&mut self, usec: u64) -> &mut Task {
        self.start_time = usec;
        self
    }

    /// Absolute end time (microseconds since epoch); the task expires if it
    /// has not completed by then.
    pub fn set_end_time(&mut self, usec: u64) -> &mut Task {
        self.end_time = usec;
        self
    }

    /// Maximum run time in microseconds, enforced by the worker.
    pub fn set_wall_time(&mut self, usec: u64) -> &mut Task {
        self.wall_time = usec;
        self
    }

    /// Scheduling priority; higher runs earlier. Defaults to 0.
    pub fn set_priority(&mut self, priority: f64) -> &mut Task {
        self.priority = priority;
        self
    }

    /// Number of automatic retries permitted before the task is failed with
    /// `MaxRetries`. Zero (the default) retries without bound.
    pub fn set_max_retries(&mut self, max_retries: u64) -> &mut Task {
        self.max_retries = max_retries;
        self
    }

    /// The id assigned at submit, 0 before submission.
    pub fn id(&self) -> u64 {
        self.task_id
    }

    /// The task's tag, if one was set.
    pub fn tag(&self) -> Option<&str> {
        self.tag.as_deref()
    }

    /// The category the task belongs to.
    pub fn category(&self) -> &str {
        &self.category
    }

    /// The task's current lifecycle state.
    pub fn state(&self) -> TaskState {
        self.state
    }

    /// The terminal result code.
    pub fn result(&self) -> TaskResult {
        self.result
    }

    /// The command's exit code, meaningful when `result()` is `Success`.
    pub fn exit_code(&self) -> i32 {
        self.exit_code
    }

    /// The captured standard output, if the task produced a result.
    pub fn output(&self) -> Option<&[u8]> {
        self.output.as_deref()
    }

    /// Resources measured for the last execution; a sentinel when
    /// monitoring was unavailable.
    pub fn resources_measured(&self) -> Option<&ResourcesMeasured> {
        self.resources_measured.as_ref()
    }

    /// The allocation envelope of the last execution.
    pub fn resources_allocated(&self) -> &ResourceSummary {
        &self.resources_allocated
    }

    /// The allocation tier currently requested from the category.
    pub fn allocation_tier(&self) -> AllocationTier {
        self.allocation_tier
    }

    /// How many times the task has been dispatched.
    pub fn try_count(&self) -> u64 {
        self.try_count
    }

    /// How many times a worker gave the task up.
    pub fn forsaken_count(&self) -> u64 {
        self.forsaken_count
    }

    /// How many attempts ended in resource exhaustion.
    pub fn exhausted_attempts(&self) -> u64 {
        self.exhausted_attempts
    }

    /// Hostname of the worker that last ran the task.
    pub fn hostname(&self) -> Option<&str> {
        self.worker_hostname.as_deref()
    }

    pub(crate) fn matches_tag(&self, tag: &str) -> bool {
        self.tag.as_deref() == Some(tag)
    }

    /// Clear per-attempt state before the task is re-queued or re-submitted.
    /// A full clean additionally resets lifetime counters.
    pub(crate) fn clean(&mut self, full: bool) {
        self.output = None;
        self.resources_measured = None;
        self.resources_allocated = ResourceSummary::unspecified();
        self.worker = None;
        self.worker_hostname = None;
        self.worker_addrport = None;
        self.exit_code = -1;
        self.time_when_commit_start = 0;
        self.time_when_commit_end = 0;
        self.time_when_retrieval = 0;
        self.time_when_done = 0;
        self.time_workers_execute_last = 0;
        for f in self.inputs.iter_mut().chain(self.outputs.iter_mut()) {
            f.substitute = None;
        }
        if full {
            self.result = TaskResult::Unknown;
            self.allocation_tier = AllocationTier::First;
            self.try_count = 0;
            self.forsaken_count = 0;
            self.exhausted_attempts = 0;
            self.slow_strikes = 0;
            self.time_when_submitted = 0;
            self.time_workers_execute_all = 0;
            self.time_workers_execute_failure = 0;
            self.bytes_sent = 0;
            self.bytes_received = 0;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn result_codes_round_trip() {
        for r in [
            TaskResult::Success,
            TaskResult::InputMissing,
            TaskResult::OutputMissing,
            TaskResult::StdoutMissing,
            TaskResult::Signal,
            TaskResult::ResourceExhaustion,
            TaskResult::TaskTimeout,
            TaskResult::Unknown,
            TaskResult::Forsaken,
            TaskResult::MaxRetries,
            TaskResult::MaxWallTime,
            TaskResult::DiskAllocFull,
            TaskResult::MonitorError,
            TaskResult::OutputTransferError,
        ] {
            assert_eq!(TaskResult::from_code(r.code()), r);
        }
        assert_eq!(TaskResult::from_code(31337), TaskResult::Unknown);
    }

    #[test]
    fn clean_preserves_definition() {
        let mut t = Task::new("echo hi");
        t.set_cores(2).set_tag("t1");
        t.try_count = 3;
        t.exit_code = 7;
        t.clean(false);
        assert_eq!(t.command, "echo hi");
        assert_eq!(t.resources_requested.cores, 2);
        assert_eq!(t.try_count, 3);
        assert_eq!(t.exit_code, -1);
        t.clean(true);
        assert_eq!(t.try_count, 0);
    }

    #[test]
    fn terminal_states() {
        assert!(TaskState::Done.is_terminal());
        assert!(TaskState::Cancelled.is_terminal());
        assert!(!TaskState::Retrieved.is_terminal());
        assert!(!TaskState::Ready.is_terminal());
    }
}
