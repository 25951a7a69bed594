use serde::Serialize;

use crate::resources::ResourceSummary;
use crate::task::{AllocationTier, Task, TaskResult};

/// How first allocations are chosen for tasks of a category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AllocationMode {
    /// Use the task's request as-is.
    Fixed,
    /// Use the largest usage ever observed in the category.
    Max,
    /// Guess the allocation minimizing expected wasted resources.
    MinWaste,
    /// Guess the allocation maximizing completed tasks per resource-time.
    MaxThroughput,
    /// Delegate to the bucketing oracle, jumping to a high bucket first.
    GreedyBucketing,
    /// Delegate to the bucketing oracle, walking buckets from the bottom.
    ExhaustiveBucketing,
}

/// Statistics accumulated for one category over the manager's lifetime.
#[derive(Debug, Default, Clone, Serialize)]
pub struct CategoryStats {
    /// Tasks that completed successfully.
    pub tasks_done: u64,
    /// Tasks that completed with a failure result.
    pub tasks_failed: u64,
    /// Bytes of inputs sent for the category's tasks.
    pub bytes_sent: u64,
    /// Bytes of outputs received for the category's tasks.
    pub bytes_received: u64,
    /// Total execution time, microseconds.
    pub time_workers_execute: u64,
    /// Execution time of successful tasks, microseconds.
    pub time_workers_execute_good: u64,
    /// Execution time lost to resource exhaustion, microseconds.
    pub time_workers_execute_exhaustion: u64,
    /// Commit (send) time, microseconds.
    pub time_send: u64,
    /// Retrieval (receive) time, microseconds.
    pub time_receive: u64,
    /// Commit time of successful tasks, microseconds.
    pub time_send_good: u64,
    /// Retrieval time of successful tasks, microseconds.
    pub time_receive_good: u64,
}

const SAMPLE_CAP: usize = 512;

fn quantile_buckets(mut values: Vec<i64>) -> Vec<i64> {
    values.sort_unstable();
    values.dedup();
    if values.is_empty() {
        return values;
    }
    let buckets = (values.len() as f64).sqrt().ceil() as usize;
    let buckets = buckets.clamp(1, values.len());
    let mut out = Vec::with_capacity(buckets);
    for i in 1..=buckets {
        let idx = (i * values.len()).div_ceil(buckets) - 1;
        let v = values[idx.min(values.len() - 1)];
        if out.last() != Some(&v) {
            out.push(v);
        }
    }
    out
}

#[derive(Debug, Default, Clone)]
pub(crate) struct Bucketing {
    usage: Vec<ResourceSummary>,
}

impl Bucketing {
    fn add(&mut self, usage: ResourceSummary) {
        if self.usage.len() >= SAMPLE_CAP {
            self.usage.remove(0);
        }
        self.usage.push(usage);
    }

    /// Pick the allocation for the given retry attempt. Greedy mode starts
    /// near the top of the distribution; exhaustive mode starts at the
    /// bottom. Either way each further attempt moves one bucket up.
    fn allocation(&self, greedy: bool, attempt: u64) -> Option<ResourceSummary> {
        if self.usage.is_empty() {
            return None;
        }
        let dim = |pick: fn(&ResourceSummary) -> i64| -> i64 {
            let values: Vec<i64> = self.usage.iter().map(pick).filter(|v| *v >= 0).collect();
            let buckets = quantile_buckets(values);
            if buckets.is_empty() {
                return -1;
            }
            let base = if greedy { (buckets.len() * 3) / 4 } else { 0 };
            let idx = (base + attempt as usize).min(buckets.len() - 1);
            buckets[idx]
        };
        Some(ResourceSummary {
            cores: dim(|s| s.cores),
            memory: dim(|s| s.memory),
            disk: dim(|s| s.disk),
            gpus: dim(|s| s.gpus),
        })
    }
}

/// A group of tasks with similar resource profiles: the unit of statistics,
/// allocation policy and slow-worker thresholds.
#[derive(Debug, Clone)]
pub(crate) struct Category {
    pub(crate) name: String,
    pub(crate) mode: AllocationMode,
    pub(crate) max_allocation: ResourceSummary,
    pub(crate) min_allocation: ResourceSummary,
    pub(crate) first_allocation_guess: ResourceSummary,
    pub(crate) max_seen: ResourceSummary,
    /// Slow-worker multiplier: >= 1 active, 0 disabled, < 0 inherit the
    /// default category's setting.
    pub(crate) slow_multiplier: f64,
    pub(crate) average_task_time: u64,
    pub(crate) stats: CategoryStats,
    samples: Vec<ResourceSummary>,
    bucketing: Bucketing,
    steady_n: usize,
}

impl Category {
    pub(crate) fn new(name: &str, mode: AllocationMode, steady_n: usize) -> Category {
        Category {
            name: name.to_string(),
            mode,
            max_allocation: ResourceSummary::unspecified(),
            min_allocation: ResourceSummary::unspecified(),
            first_allocation_guess: ResourceSummary::unspecified(),
            max_seen: ResourceSummary::unspecified(),
            slow_multiplier: -1.0,
            average_task_time: 0,
            stats: CategoryStats::default(),
            samples: Vec::new(),
            bucketing: Bucketing::default(),
            steady_n,
        }
    }

    /// The allocation to request for a task at the given tier, before the
    /// per-worker envelope computation.
    pub(crate) fn allocation_for(&self, t: &Task) -> ResourceSummary {
        let request = t.resources_requested;
        let mut alloc = match (t.allocation_tier, self.mode) {
            (_, AllocationMode::Fixed) => return request,
            (AllocationTier::Max, _) | (AllocationTier::First, AllocationMode::Max) => {
                let mut a = request;
                a.merge_max(&self.max_seen);
                return a;
            }
            (AllocationTier::First, AllocationMode::MinWaste) => {
                self.fitted_guess(false).unwrap_or(ResourceSummary::unspecified())
            }
            (AllocationTier::First, AllocationMode::MaxThroughput) => {
                self.fitted_guess(true).unwrap_or(ResourceSummary::unspecified())
            }
            (AllocationTier::First, AllocationMode::GreedyBucketing) => self
                .bucketing
                .allocation(true, t.exhausted_attempts)
                .unwrap_or(ResourceSummary::unspecified()),
            (AllocationTier::First, AllocationMode::ExhaustiveBucketing) => self
                .bucketing
                .allocation(false, t.exhausted_attempts)
                .unwrap_or(ResourceSummary::unspecified()),
        };
        if !self.first_allocation_guess.is_unspecified() {
            alloc.merge_override(&self.first_allocation_guess);
        }
        // The task's own request always wins over a guess.
        alloc.merge_override(&request);
        alloc
    }

    /// The tier to retry at after resource exhaustion, or `None` when the
    /// category maximum has already been tried.
    pub(crate) fn next_tier(&self, current: AllocationTier) -> Option<AllocationTier> {
        match (current, self.mode) {
            (_, AllocationMode::Fixed) => None,
            (AllocationTier::First, AllocationMode::GreedyBucketing)
            | (AllocationTier::First, AllocationMode::ExhaustiveBucketing) => {
                // Bucketing retries stay at the first tier until the oracle
                // runs out of larger buckets, then jump to max.
                Some(AllocationTier::First)
            }
            (AllocationTier::First, _) => Some(AllocationTier::Max),
            (AllocationTier::Max, _) => None,
        }
    }

    /// Whether a bucketing category still has a larger bucket to offer a
    /// task that exhausted `attempt` allocations already.
    pub(crate) fn bucketing_has_headroom(&self, attempt: u64) -> bool {
        let a = self.bucketing.allocation(false, attempt);
        let b = self.bucketing.allocation(false, attempt + 1);
        match (a, b) {
            (Some(a), Some(b)) => a != b,
            _ => false,
        }
    }

    pub(crate) fn is_bucketing(&self) -> bool {
        matches!(
            self.mode,
            AllocationMode::GreedyBucketing | AllocationMode::ExhaustiveBucketing
        )
    }

    /// Fold one completed task into the category record.
    pub(crate) fn accumulate(&mut self, t: &Task) {
        let s = &mut self.stats;
        s.bytes_sent += t.bytes_sent;
        s.bytes_received += t.bytes_received;
        s.time_workers_execute += t.time_workers_execute_last;
        let send = t.time_when_commit_end.saturating_sub(t.time_when_commit_start);
        let receive = t.time_when_done.saturating_sub(t.time_when_retrieval);
        s.time_send += send;
        s.time_receive += receive;

        if t.result == TaskResult::Success {
            s.tasks_done += 1;
            s.time_workers_execute_good += t.time_workers_execute_last;
            s.time_send_good += send;
            s.time_receive_good += receive;
        } else {
            s.tasks_failed += 1;
            if t.result == TaskResult::ResourceExhaustion {
                s.time_workers_execute_exhaustion += t.time_workers_execute_last;
            }
        }

        // Usage samples only make sense for results that actually ran.
        let usable = matches!(
            t.result,
            TaskResult::Success
                | TaskResult::Signal
                | TaskResult::ResourceExhaustion
                | TaskResult::MaxWallTime
                | TaskResult::DiskAllocFull
                | TaskResult::OutputTransferError
        );
        if usable {
            if let Some(measured) = &t.resources_measured {
                if !measured.usage.is_unspecified() {
                    self.max_seen.merge_max(&measured.usage);
                    if self.samples.len() >= SAMPLE_CAP {
                        self.samples.remove(0);
                    }
                    self.samples.push(measured.usage);
                    if self.is_bucketing()
                        && matches!(
                            t.result,
                            TaskResult::Success | TaskResult::ResourceExhaustion
                        )
                    {
                        self.bucketing.add(measured.usage);
                    }
                }
            }
        }

        self.recompute_average_time();
    }

    fn recompute_average_time(&mut self) {
        // Slow-worker detection needs a settled mean; require 10 samples.
        if self.stats.tasks_done < 10 {
            self.average_task_time = 0;
            return;
        }
        self.average_task_time = (self.stats.time_workers_execute_good
            + self.stats.time_send_good
            + self.stats.time_receive_good)
            / self.stats.tasks_done;
    }

    /// First-allocation guess fitted from the usage sample histogram.
    /// `throughput` selects the max-throughput cost model; otherwise waste
    /// is minimized.
    fn fitted_guess(&self, throughput: bool) -> Option<ResourceSummary> {
        if self.samples.len() < self.steady_n.max(1) {
            return None;
        }
        let guess = |pick: fn(&ResourceSummary) -> i64, max_seen: i64| -> i64 {
            let mut values: Vec<i64> =
                self.samples.iter().map(pick).filter(|v| *v >= 0).collect();
            if values.is_empty() {
                return -1;
            }
            values.sort_unstable();
            let mut best = (*values.last().unwrap_or(&-1), f64::INFINITY);
            let mut candidates = values.clone();
            candidates.dedup();
            for v in candidates {
                let succ = values.iter().filter(|s| **s <= v).count() as f64;
                if throughput && succ == 0.0 {
                    continue;
                }
                let mut cost = 0.0;
                for s in &values {
                    if *s <= v {
                        cost += (v - s) as f64;
                    } else {
                        // A failed first attempt pays for the retry at max.
                        cost += (v + max_seen.max(v) - s) as f64;
                    }
                }
                let cost = if throughput { cost / succ } else { cost };
                if cost < best.1 {
                    best = (v, cost);
                }
            }
            best.0
        };
        Some(ResourceSummary {
            cores: guess(|s| s.cores, self.max_seen.cores),
            memory: guess(|s| s.memory, self.max_seen.memory),
            disk: guess(|s| s.disk, self.max_seen.disk),
            gpus: guess(|s| s.gpus, self.max_seen.gpus),
        })
    }

    /// The multiplier in effect for this category given the default
    /// category's setting: `None` when disabled.
    pub(crate) fn effective_multiplier(&self, default_multiplier: f64) -> Option<f64> {
        let m = if self.slow_multiplier < 0.0 {
            default_multiplier
        } else {
            self.slow_multiplier
        };
        if m >= 1.0 { Some(m) } else { None }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(memory: i64) -> ResourceSummary {
        ResourceSummary {
            cores: 1,
            memory,
            disk: -1,
            gpus: -1,
        }
    }

    fn done_task(cat: &mut Category, memory: i64, exec_usec: u64) {
        let mut t = Task::new("x");
        t.result = TaskResult::Success;
        t.time_workers_execute_last = exec_usec;
        t.time_when_commit_start = 0;
        t.time_when_commit_end = 0;
        t.time_when_retrieval = 0;
        t.time_when_done = 0;
        t.resources_measured = Some(crate::resources::ResourcesMeasured {
            exit_status: 0,
            usage: sample(memory),
            wall_time: exec_usec,
            limits_exceeded: None,
        });
        cat.accumulate(&t);
    }

    #[test]
    fn average_needs_ten_samples() {
        let mut c = Category::new("c", AllocationMode::Fixed, 25);
        for _ in 0..9 {
            done_task(&mut c, 100, 10_000_000);
        }
        assert_eq!(c.average_task_time, 0);
        done_task(&mut c, 100, 10_000_000);
        assert_eq!(c.average_task_time, 10_000_000);
    }

    #[test]
    fn max_mode_uses_largest_seen() {
        let mut c = Category::new("c", AllocationMode::Max, 25);
        done_task(&mut c, 300, 1);
        done_task(&mut c, 700, 1);
        let t = Task::new("x");
        let a = c.allocation_for(&t);
        assert_eq!(a.memory, 700);
    }

    #[test]
    fn fixed_mode_passes_request_through() {
        let c = Category::new("c", AllocationMode::Fixed, 25);
        let mut t = Task::new("x");
        t.set_memory(123);
        assert_eq!(c.allocation_for(&t).memory, 123);
    }

    #[test]
    fn explicit_request_beats_guess() {
        let mut c = Category::new("c", AllocationMode::MinWaste, 5);
        for m in [100, 100, 100, 100, 100, 100] {
            done_task(&mut c, m, 1);
        }
        let mut t = Task::new("x");
        t.set_memory(9000);
        assert_eq!(c.allocation_for(&t).memory, 9000);
    }

    #[test]
    fn min_waste_guess_covers_uniform_samples() {
        let mut c = Category::new("c", AllocationMode::MinWaste, 5);
        for m in [100, 100, 100, 100, 100, 100, 100, 100] {
            done_task(&mut c, m, 1);
        }
        let t = Task::new("x");
        assert_eq!(c.allocation_for(&t).memory, 100);
    }

    #[test]
    fn tier_ladder_ends_after_max() {
        let c = Category::new("c", AllocationMode::MinWaste, 25);
        assert_eq!(c.next_tier(AllocationTier::First), Some(AllocationTier::Max));
        assert_eq!(c.next_tier(AllocationTier::Max), None);
        let fixed = Category::new("c", AllocationMode::Fixed, 25);
        assert_eq!(fixed.next_tier(AllocationTier::First), None);
    }

    #[test]
    fn multiplier_inheritance() {
        let mut c = Category::new("c", AllocationMode::Fixed, 25);
        assert_eq!(c.effective_multiplier(3.0), Some(3.0));
        c.slow_multiplier = 0.0;
        assert_eq!(c.effective_multiplier(3.0), None);
        c.slow_multiplier = 5.0;
        assert_eq!(c.effective_multiplier(3.0), Some(5.0));
        c.slow_multiplier = -1.0;
        assert_eq!(c.effective_multiplier(0.0), None);
    }

    #[test]
    fn bucketing_walks_upward() {
        let mut b = Bucketing::default();
        for m in [100, 200, 300, 400, 500, 600, 700, 800, 900] {
            b.add(sample(m));
        }
        let first = b.allocation(false, 0).unwrap();
        let second = b.allocation(false, 1).unwrap();
        assert!(second.memory >= first.memory);
        let greedy = b.allocation(true, 0).unwrap();
        assert!(greedy.memory >= first.memory);
    }

    #[test]
    fn quantile_buckets_are_sorted_and_deduped() {
        let b = quantile_buckets(vec![5, 1, 3, 3, 9, 7]);
        let mut sorted = b.clone();
        sorted.sort_unstable();
        sorted.dedup();
        assert_eq!(b, sorted);
        assert_eq!(*b.last().unwrap(), 9);
    }
}
