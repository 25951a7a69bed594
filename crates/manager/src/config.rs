use crate::category::AllocationMode;
use crate::error::ManagerError;
use crate::sched::Scheduler;

/// Configuration of a [`crate::Manager`].
///
/// Start from [`ManagerConfig::default`] (or [`ManagerConfig::from_env`] to
/// honor the `VINE_*`/`WORK_QUEUE_*` environment), adjust fields, and pass
/// it to [`crate::Manager::listen`]. Every runtime knob recognized by
/// `tune()` is a plain field here.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Port to listen on; 0 picks an ephemeral port, unless a low/high
    /// range is set in which case the range is scanned.
    pub port: u16,
    /// Lowest port to try when scanning for a free port.
    pub low_port: Option<u16>,
    /// Highest port to try when scanning for a free port.
    pub high_port: Option<u16>,
    /// Project name advertised to the catalog; catalog updates are sent
    /// only when set.
    pub name: Option<String>,
    /// Priority relative to other managers with the same name.
    pub priority: i64,
    /// Catalog endpoints to push status to and query factories from.
    pub catalog_hosts: Vec<String>,
    /// Shared secret; when set, connections must pass a challenge before
    /// the handshake.
    pub password: Option<String>,
    /// Artificial bandwidth cap for manager-worker transfers, bytes/s.
    pub bandwidth_limit: Option<f64>,
    /// Worker-selection policy.
    pub scheduler: Scheduler,
    /// Allocation mode for categories that never set their own.
    pub default_allocation_mode: AllocationMode,
    /// Whether inputs may be sourced from peer workers.
    pub peer_transfers: bool,

    /// Overcommit factor applied to worker totals when fitting tasks.
    pub resource_submit_multiplier: f64,
    /// Floor for computed file transfer timeouts, seconds.
    pub min_transfer_timeout: u64,
    /// Assumed transfer rate before observations exist, bytes/s.
    pub default_transfer_rate: u64,
    /// Factor beyond which a transfer time counts as an outlier.
    pub transfer_outlier_factor: f64,
    /// Slow-worker multiplier of the default category; 0 disables.
    pub disconnect_slow_workers_factor: f64,
    /// Seconds of silence before a keepalive probe is sent.
    pub keepalive_interval: u64,
    /// Seconds a probe may go unanswered before the worker is removed.
    pub keepalive_timeout: u64,
    /// Deadline for brief control messages, seconds.
    pub short_timeout: u64,
    /// Deadline when mid-message, seconds.
    pub long_timeout: u64,
    /// `hungry()` reports true below this many waiting tasks.
    pub hungry_minimum: i64,
    /// Dispatch no tasks until this many workers are connected.
    pub wait_for_workers: usize,
    /// Let one `wait()` call retrieve every ready result.
    pub wait_retrieve_many: bool,
    /// Divide workers proportionally rather than whole-worker.
    pub proportional_resources: bool,
    /// Round proportions so whole tasks tile a worker.
    pub proportional_whole_tasks: bool,
    /// Concurrent transfers allowed per origin URL.
    pub file_source_max_transfers: usize,
    /// Concurrent transfers allowed per peer worker source.
    pub worker_source_max_transfers: usize,
    /// Usage samples required before first-allocation guesses kick in.
    pub category_steady_n_tasks: usize,
    /// Capacity reported before any task has completed.
    pub default_capacity_tasks: i64,
    /// New workers accepted per loop iteration.
    pub max_new_workers: usize,
    /// Seconds between catalog pushes.
    pub catalog_update_interval: u64,
    /// Seconds between local resource samples.
    pub resource_sample_interval: u64,
    /// Minimum seconds between performance log snapshots.
    pub perf_log_interval: u64,
    /// Seconds an evicted slow worker's host stays blocked.
    pub slow_worker_blocklist_timeout: u64,
    /// Seconds between scans for tasks too large for any worker.
    pub large_task_check_interval: u64,
}

impl ManagerConfig {
    /// Default port, shared with the original work queue tooling.
    pub const DEFAULT_PORT: u16 = 9123;
    /// Default keepalive probe interval, seconds.
    pub const DEFAULT_KEEPALIVE_INTERVAL: u64 = 120;
    /// Default keepalive response deadline, seconds.
    pub const DEFAULT_KEEPALIVE_TIMEOUT: u64 = 900;
    /// Default deadline for brief control messages, seconds.
    pub const DEFAULT_SHORT_TIMEOUT: u64 = 5;
    /// Default mid-message deadline, seconds.
    pub const DEFAULT_LONG_TIMEOUT: u64 = 3600;
    /// Default assumed transfer rate, bytes/s.
    pub const DEFAULT_TRANSFER_RATE: u64 = 1_000_000;
    /// Default catalog push interval, seconds.
    pub const DEFAULT_UPDATE_INTERVAL: u64 = 60;
    /// Default performance log cadence, seconds.
    pub const DEFAULT_PERF_LOG_INTERVAL: u64 = 5;

    /// A configuration honoring the recognized environment variables:
    /// `VINE_PORT`/`WORK_QUEUE_PORT`, `VINE_LOW_PORT`/`WORK_QUEUE_LOW_PORT`,
    /// `VINE_HIGH_PORT`/`WORK_QUEUE_HIGH_PORT`, `VINE_NAME`/
    /// `WORK_QUEUE_NAME`, `VINE_PRIORITY`/`WORK_QUEUE_PRIORITY`,
    /// `CATALOG_HOST`, and `VINE_BANDWIDTH`/`WORK_QUEUE_BANDWIDTH`.
    pub fn from_env() -> ManagerConfig {
        let mut cfg = ManagerConfig::default();
        let var = |names: [&str; 2]| {
            names
                .iter()
                .find_map(|n| std::env::var(n).ok())
                .filter(|v| !v.is_empty())
        };
        if let Some(port) = var(["VINE_PORT", "WORK_QUEUE_PORT"]).and_then(|v| v.parse().ok()) {
            cfg.port = port;
        }
        if let Some(low) = var(["VINE_LOW_PORT", "WORK_QUEUE_LOW_PORT"]).and_then(|v| v.parse().ok())
        {
            cfg.low_port = Some(low);
        }
        if let Some(high) =
            var(["VINE_HIGH_PORT", "WORK_QUEUE_HIGH_PORT"]).and_then(|v| v.parse().ok())
        {
            cfg.high_port = Some(high);
        }
        if let Some(name) = var(["VINE_NAME", "WORK_QUEUE_NAME"]) {
            cfg.name = Some(name);
        }
        if let Some(priority) =
            var(["VINE_PRIORITY", "WORK_QUEUE_PRIORITY"]).and_then(|v| v.parse().ok())
        {
            cfg.priority = priority;
        }
        if let Ok(hosts) = std::env::var("CATALOG_HOST") {
            cfg.catalog_hosts = hosts
                .split(',')
                .filter(|h| !h.is_empty())
                .map(str::to_string)
                .collect();
        }
        if let Some(bw) =
            var(["VINE_BANDWIDTH", "WORK_QUEUE_BANDWIDTH"]).and_then(|v| v.parse().ok())
        {
            cfg.bandwidth_limit = Some(bw);
        }
        cfg
    }

    /// Load the shared secret from a file, trimming trailing whitespace.
    pub fn set_password_file(&mut self, path: &str) -> Result<(), ManagerError> {
        let text =
            std::fs::read_to_string(path).map_err(|source| ManagerError::PasswordFile {
                path: path.to_string(),
                source,
            })?;
        self.password = Some(text.trim_end().to_string());
        Ok(())
    }

    /// Adjust one performance knob by name. Unknown names are an error;
    /// the recognized set matches the original tool.
    pub fn tune(&mut self, name: &str, value: f64) -> Result<(), ManagerError> {
        match name {
            "resource-submit-multiplier" => {
                self.resource_submit_multiplier = value.max(1.0);
            }
            "min-transfer-timeout" => self.min_transfer_timeout = value.max(0.0) as u64,
            "default-transfer-rate" => self.default_transfer_rate = value.max(1.0) as u64,
            "transfer-outlier-factor" => self.transfer_outlier_factor = value,
            "disconnect-slow-worker-factor" => self.disconnect_slow_workers_factor = value,
            "keepalive-interval" => self.keepalive_interval = value.max(0.0) as u64,
            "keepalive-timeout" => self.keepalive_timeout = value.max(0.0) as u64,
            "short-timeout" => self.short_timeout = (value as u64).max(1),
            "long-timeout" => self.long_timeout = (value as u64).max(1),
            "hungry-minimum" => self.hungry_minimum = (value as i64).max(1),
            "wait-for-workers" => self.wait_for_workers = value.max(0.0) as usize,
            "wait-retrieve-many" => self.wait_retrieve_many = value > 0.0,
            "proportional-resources" => self.proportional_resources = value > 0.0,
            "proportional-whole-tasks" => self.proportional_whole_tasks = value > 0.0,
            "file-source-max-transfers" => {
                self.file_source_max_transfers = (value as usize).max(1);
            }
            "category-steady-n-tasks" => {
                self.category_steady_n_tasks = value.max(1.0) as usize;
            }
            "default-capacity-tasks" => self.default_capacity_tasks = (value as i64).max(0),
            _ => return Err(ManagerError::UnknownTunable(name.to_string())),
        }
        Ok(())
    }
}

impl Default for ManagerConfig {
    fn default() -> ManagerConfig {
        ManagerConfig {
            port: Self::DEFAULT_PORT,
            low_port: None,
            high_port: None,
            name: None,
            priority: 0,
            catalog_hosts: Vec::new(),
            password: None,
            bandwidth_limit: None,
            scheduler: Scheduler::default(),
            default_allocation_mode: AllocationMode::Fixed,
            peer_transfers: true,
            resource_submit_multiplier: 1.0,
            min_transfer_timeout: 60,
            default_transfer_rate: Self::DEFAULT_TRANSFER_RATE,
            transfer_outlier_factor: 10.0,
            disconnect_slow_workers_factor: 0.0,
            keepalive_interval: Self::DEFAULT_KEEPALIVE_INTERVAL,
            keepalive_timeout: Self::DEFAULT_KEEPALIVE_TIMEOUT,
            short_timeout: Self::DEFAULT_SHORT_TIMEOUT,
            long_timeout: Self::DEFAULT_LONG_TIMEOUT,
            hungry_minimum: 10,
            wait_for_workers: 0,
            wait_retrieve_many: false,
            proportional_resources: true,
            proportional_whole_tasks: true,
            file_source_max_transfers: 1,
            worker_source_max_transfers: 3,
            category_steady_n_tasks: 25,
            default_capacity_tasks: crate::capacity::DEFAULT_CAPACITY_TASKS,
            max_new_workers: 10,
            catalog_update_interval: Self::DEFAULT_UPDATE_INTERVAL,
            resource_sample_interval: 30,
            perf_log_interval: Self::DEFAULT_PERF_LOG_INTERVAL,
            slow_worker_blocklist_timeout: 900,
            large_task_check_interval: 180,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tune_known_names() {
        let mut cfg = ManagerConfig::default();
        cfg.tune("keepalive-interval", 30.0).unwrap();
        assert_eq!(cfg.keepalive_interval, 30);
        cfg.tune("wait-retrieve-many", 1.0).unwrap();
        assert!(cfg.wait_retrieve_many);
        cfg.tune("file-source-max-transfers", 0.0).unwrap();
        assert_eq!(cfg.file_source_max_transfers, 1);
        cfg.tune("resource-submit-multiplier", 0.5).unwrap();
        assert_eq!(cfg.resource_submit_multiplier, 1.0);
        cfg.tune("default-capacity-tasks", 42.0).unwrap();
        assert_eq!(cfg.default_capacity_tasks, 42);
    }

    #[test]
    fn tune_unknown_name_errors() {
        let mut cfg = ManagerConfig::default();
        assert!(matches!(
            cfg.tune("warp-speed", 9.0),
            Err(ManagerError::UnknownTunable(_))
        ));
    }
}
