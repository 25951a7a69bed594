use std::collections::VecDeque;

use crate::resources::ResourceSummary;
use crate::stats::Stats;
use crate::task::Task;

// Reported before any completed task exists; overridable through the
// `default-capacity-tasks` tunable. Implies 1 core, 512 MB memory and
// 1024 MB disk per task.
pub(crate) const DEFAULT_CAPACITY_TASKS: i64 = 10;

const MIN_REPORTS: usize = 50;
const ALPHA: f64 = 0.05;

/// Performance report of one completed task, kept for capacity estimation.
#[derive(Debug, Clone)]
pub(crate) struct TaskReport {
    pub(crate) transfer_time: u64,
    pub(crate) exec_time: u64,
    pub(crate) manager_time: u64,
    pub(crate) resources: ResourceSummary,
}

impl TaskReport {
    pub(crate) fn from_task(t: &Task) -> Option<TaskReport> {
        if t.resources_allocated.is_unspecified() {
            return None;
        }
        let transfer_time = t.time_when_commit_end.saturating_sub(t.time_when_commit_start)
            + t.time_when_done.saturating_sub(t.time_when_retrieval);
        let exec_time = t.time_workers_execute_last;
        let total = t.time_when_done.saturating_sub(t.time_when_commit_start);
        let manager_time = total.saturating_sub(transfer_time).saturating_sub(exec_time);
        Some(TaskReport {
            transfer_time,
            exec_time,
            manager_time,
            resources: t.resources_allocated,
        })
    }
}

/// Ring of recent task reports feeding the capacity estimator.
#[derive(Debug, Default)]
pub(crate) struct TaskReports {
    reports: VecDeque<TaskReport>,
}

impl TaskReports {
    /// Record one completed task, trimming the ring to at least
    /// `MIN_REPORTS` and at least twice the tasks currently on workers.
    pub(crate) fn add(&mut self, report: TaskReport, tasks_on_workers: i64) {
        self.reports.push_back(report);
        let keep = MIN_REPORTS.max(2 * tasks_on_workers.max(0) as usize);
        while self.reports.len() > keep {
            self.reports.pop_front();
        }
    }

    /// Fill the capacity fields of `s` from the stored reports.
    pub(crate) fn compute_capacity(&self, s: &mut Stats, default_tasks: i64) {
        let div_round_up = |a: u64, b: u64| -> i64 { (a.div_ceil(b.max(1))) as i64 };

        if self.reports.is_empty() {
            s.capacity_tasks = default_tasks;
            s.capacity_cores = default_tasks;
            s.capacity_memory = default_tasks * 512;
            s.capacity_disk = default_tasks * 1024;
            s.capacity_gpus = 0;
            s.capacity_instantaneous = default_tasks;
            s.capacity_weighted = default_tasks;
            return;
        }

        let mut transfer: u64 = 0;
        let mut exec: u64 = 0;
        let mut manager: u64 = 0;
        let mut res = ResourceSummary::zero();
        for r in &self.reports {
            transfer += r.transfer_time;
            exec += r.exec_time;
            manager += r.manager_time;
            res = res.saturating_add(&r.resources.specified_or(0));
        }
        let transfer = transfer.max(1);
        let exec = exec.max(1);
        let manager = manager.max(1);
        let count = self.reports.len() as u64;

        if let Some(last) = self.reports.back() {
            if last.transfer_time > 0 {
                let inst =
                    div_round_up(last.exec_time, last.transfer_time + last.manager_time);
                s.capacity_instantaneous = inst;
                s.capacity_weighted = (ALPHA * inst as f64
                    + (1.0 - ALPHA) * s.capacity_weighted as f64)
                    .ceil() as i64;
            }
        }

        let ratio = default_tasks.max(div_round_up(exec, transfer + manager));
        s.capacity_tasks = ratio;
        s.capacity_cores = div_round_up(res.cores.max(0) as u64 * ratio as u64, count);
        s.capacity_memory = div_round_up(res.memory.max(0) as u64 * ratio as u64, count);
        s.capacity_disk = div_round_up(res.disk.max(0) as u64 * ratio as u64, count);
        s.capacity_gpus = div_round_up(res.gpus.max(0) as u64 * ratio as u64, count);
    }

    pub(crate) fn len(&self) -> usize {
        self.reports.len()
    }
}

/// Smooth the manager-load estimate with one more loop observation.
pub(crate) fn update_manager_load(load: f64, task_activity: bool) -> f64 {
    let sample = if task_activity { 1.0 } else { 0.0 };
    load * (1.0 - ALPHA) + sample * ALPHA
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report(exec: u64, transfer: u64, cores: i64) -> TaskReport {
        TaskReport {
            transfer_time: transfer,
            exec_time: exec,
            manager_time: 1,
            resources: ResourceSummary {
                cores,
                memory: 512,
                disk: 1024,
                gpus: 0,
            },
        }
    }

    #[test]
    fn default_floor_before_any_report() {
        let reports = TaskReports::default();
        let mut s = Stats::default();
        reports.compute_capacity(&mut s, DEFAULT_CAPACITY_TASKS);
        assert_eq!(s.capacity_tasks, 10);
        assert_eq!(s.capacity_memory, 5120);
        assert_eq!(s.capacity_weighted, 10);
    }

    #[test]
    fn tunable_floor_is_honored() {
        let reports = TaskReports::default();
        let mut s = Stats::default();
        reports.compute_capacity(&mut s, 25);
        assert_eq!(s.capacity_tasks, 25);
    }

    #[test]
    fn long_tasks_mean_high_capacity() {
        let mut reports = TaskReports::default();
        for _ in 0..60 {
            reports.add(report(1_000_000, 10, 1), 0);
        }
        let mut s = Stats::default();
        reports.compute_capacity(&mut s, DEFAULT_CAPACITY_TASKS);
        assert!(s.capacity_tasks > 1000);
        assert!(s.capacity_cores >= s.capacity_tasks);
    }

    #[test]
    fn ring_keeps_at_least_min_reports() {
        let mut reports = TaskReports::default();
        for _ in 0..200 {
            reports.add(report(1, 1, 1), 0);
        }
        assert_eq!(reports.len(), MIN_REPORTS);
        // With many tasks on workers the ring grows.
        for _ in 0..200 {
            reports.add(report(1, 1, 1), 60);
        }
        assert_eq!(reports.len(), 120);
    }

    #[test]
    fn load_ewma_moves_toward_activity() {
        let mut load = 0.0;
        for _ in 0..100 {
            load = update_manager_load(load, true);
        }
        assert!(load > 0.9);
        for _ in 0..100 {
            load = update_manager_load(load, false);
        }
        assert!(load < 0.1);
    }
}
