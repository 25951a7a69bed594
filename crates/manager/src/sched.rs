use rand::Rng;

use crate::resources::{ResourceSummary, WorkerResources};
use crate::worker::WorkerId;

/// Policy for matching ready tasks to feasible workers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Scheduler {
    /// First feasible worker, in connection order.
    Fcfs,
    /// The feasible worker already caching the most input bytes.
    Files,
    /// The feasible worker with the best average execution time.
    Time,
    /// Uniform random over feasible workers.
    #[default]
    Rand,
    /// The feasible worker with the most remaining free resources.
    Worst,
}

/// Scheduling facts about one feasible worker, precomputed by the manager.
#[derive(Debug, Clone)]
pub(crate) struct Candidate {
    pub(crate) id: WorkerId,
    /// Sum over dimensions of free/total, for worst-fit.
    pub(crate) free_score: f64,
    /// Bytes of the task's inputs already in this worker's cache.
    pub(crate) cached_bytes: u64,
    /// Mean task time on this worker, `None` with no history.
    pub(crate) avg_time: Option<u64>,
}

/// Apply the policy to an already-filtered candidate list. Candidates are
/// in connection order (ascending worker id).
pub(crate) fn pick_candidate(policy: Scheduler, candidates: &[Candidate]) -> Option<WorkerId> {
    if candidates.is_empty() {
        return None;
    }
    let chosen = match policy {
        Scheduler::Fcfs => &candidates[0],
        Scheduler::Files => candidates
            .iter()
            .max_by_key(|c| c.cached_bytes)
            .unwrap_or(&candidates[0]),
        Scheduler::Time => candidates
            .iter()
            .min_by_key(|c| c.avg_time.unwrap_or(0))
            .unwrap_or(&candidates[0]),
        Scheduler::Rand => {
            let idx = rand::rng().random_range(0..candidates.len());
            &candidates[idx]
        }
        Scheduler::Worst => candidates
            .iter()
            .max_by(|a, b| {
                a.free_score
                    .partial_cmp(&b.free_score)
                    .unwrap_or(std::cmp::Ordering::Equal)
            })
            .unwrap_or(&candidates[0]),
    };
    Some(chosen.id)
}

fn overcommitted(total: i64, multiplier: f64) -> i64 {
    if total == 0 {
        0
    } else {
        (total as f64 * multiplier).ceil() as i64
    }
}

/// Whether a worker's free resources satisfy a demand vector. Unspecified
/// dimensions demand nothing; disk is never overcommitted.
pub(crate) fn check_worker_fit(
    resources: &WorkerResources,
    demand: &ResourceSummary,
    overcommit: f64,
) -> bool {
    if resources.workers.total < 1 {
        return false;
    }
    let fits = |demand: i64, r: &crate::resources::Resource, multiplier: f64| {
        demand <= 0 || demand <= overcommitted(r.total, multiplier) - r.inuse
    };
    fits(demand.cores, &resources.cores, overcommit)
        && fits(demand.memory, &resources.memory, overcommit)
        && fits(demand.disk, &resources.disk, 1.0)
        && fits(demand.gpus, &resources.gpus, overcommit)
}

/// Compute the per-task allocation envelope for a task on a worker.
///
/// `max` is the task's effective maximum request (category allocation),
/// `min` the floor it may never drop below. Proportional mode scales
/// unspecified dimensions by the largest specified proportion of the
/// worker; whole-task rounding adjusts the proportion so an integer number
/// of such tasks tiles the worker exactly.
pub(crate) fn choose_resources_for_task(
    resources: &WorkerResources,
    max: &ResourceSummary,
    min: &ResourceSummary,
    proportional: bool,
    whole_tasks: bool,
) -> ResourceSummary {
    let mut limits = ResourceSummary::unspecified();
    limits.merge_override(max);

    let mut use_whole_worker = true;

    if proportional {
        let mut max_proportion: f64 = -1.0;
        let dims = [
            (limits.cores, resources.cores.largest),
            (limits.memory, resources.memory.largest),
            (limits.disk, resources.disk.largest),
            (limits.gpus, resources.gpus.largest),
        ];
        for (want, largest) in dims {
            if largest > 0 && want >= 0 {
                max_proportion = max_proportion.max(want as f64 / largest as f64);
            }
        }

        // A proportion above one means the task does not fit the worker for
        // its specified resources; fall through with the whole worker so
        // the unschedulable check stays quiet.
        if max_proportion > 1.0 {
            use_whole_worker = true;
        } else if max_proportion > 0.0 {
            use_whole_worker = false;
            let mut proportion = max_proportion;
            if whole_tasks {
                proportion = 1.0 / (1.0 / proportion).floor();
            }
            if limits.cores < 0 {
                if limits.gpus > 0 {
                    limits.cores = 0;
                } else {
                    limits.cores =
                        1.max((resources.cores.largest as f64 * proportion).floor() as i64);
                }
            }
            if limits.gpus < 0 {
                limits.gpus = 0;
            }
            if limits.memory < 0 {
                limits.memory =
                    1.max((resources.memory.largest as f64 * proportion).floor() as i64);
            }
            if limits.disk < 0 {
                limits.disk = 1.max((resources.disk.largest as f64 * proportion).floor() as i64);
            }
        }
    }

    if limits.cores < 1 && limits.gpus < 1 && limits.memory < 1 && limits.disk < 1 {
        use_whole_worker = true;
    }

    if (limits.cores > 0 && limits.cores >= resources.cores.largest)
        || (limits.gpus > 0 && limits.gpus >= resources.gpus.largest)
        || (limits.memory > 0 && limits.memory >= resources.memory.largest)
        || (limits.disk > 0 && limits.disk >= resources.disk.largest)
    {
        use_whole_worker = true;
    }

    if use_whole_worker {
        if limits.cores <= 0 {
            limits.cores = if limits.gpus > 0 {
                0
            } else {
                resources.cores.largest
            };
        }
        if limits.gpus <= 0 {
            limits.gpus = 0;
        }
        if limits.memory <= 0 {
            limits.memory = resources.memory.largest;
        }
        if limits.disk <= 0 {
            limits.disk = resources.disk.largest;
        }
    }

    limits.merge_max(min);
    limits
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::resources::Resource;

    fn worker(cores: i64, memory: i64, disk: i64, gpus: i64) -> WorkerResources {
        let dim = |total| Resource {
            total,
            inuse: 0,
            smallest: total,
            largest: total,
        };
        WorkerResources {
            tag: 0,
            cores: dim(cores),
            memory: dim(memory),
            disk: dim(disk),
            gpus: dim(gpus),
            workers: dim(1),
        }
    }

    fn req(cores: i64, memory: i64, disk: i64, gpus: i64) -> ResourceSummary {
        ResourceSummary {
            cores,
            memory,
            disk,
            gpus,
        }
    }

    #[test]
    fn unspecified_request_gets_whole_worker() {
        let env = choose_resources_for_task(
            &worker(16, 4096, 10240, 0),
            &ResourceSummary::unspecified(),
            &ResourceSummary::unspecified(),
            true,
            true,
        );
        assert_eq!(env, req(16, 4096, 10240, 0));
    }

    #[test]
    fn proportional_scales_unspecified_dimensions() {
        // 4 of 16 cores is a quarter; memory and disk follow suit.
        let env = choose_resources_for_task(
            &worker(16, 4096, 10240, 0),
            &req(4, -1, -1, -1),
            &ResourceSummary::unspecified(),
            true,
            true,
        );
        assert_eq!(env.cores, 4);
        assert_eq!(env.memory, 1024);
        assert_eq!(env.disk, 2560);
        assert_eq!(env.gpus, 0);
    }

    #[test]
    fn whole_task_rounding_tiles_the_worker() {
        // 3 of 16 cores -> proportion 3/16, rounded up to 1/5 of the worker.
        let env = choose_resources_for_task(
            &worker(16, 1000, 1000, 0),
            &req(3, -1, -1, -1),
            &ResourceSummary::unspecified(),
            true,
            true,
        );
        assert_eq!(env.cores, 3);
        assert_eq!(env.memory, 200);
        assert_eq!(env.disk, 200);
    }

    #[test]
    fn dimension_at_worker_size_takes_whole_worker() {
        let env = choose_resources_for_task(
            &worker(16, 4096, 10240, 0),
            &req(-1, 4096, -1, -1),
            &ResourceSummary::unspecified(),
            true,
            true,
        );
        assert_eq!(env, req(16, 4096, 10240, 0));
    }

    #[test]
    fn gpu_task_gets_zero_cores_when_unspecified() {
        let env = choose_resources_for_task(
            &worker(16, 4096, 10240, 4),
            &req(-1, -1, -1, 1),
            &ResourceSummary::unspecified(),
            true,
            true,
        );
        assert_eq!(env.gpus, 1);
        assert_eq!(env.cores, 0);
    }

    #[test]
    fn category_min_clamps_from_below() {
        let env = choose_resources_for_task(
            &worker(16, 4096, 10240, 0),
            &req(1, -1, -1, -1),
            &req(-1, 2048, -1, -1),
            true,
            true,
        );
        assert!(env.memory >= 2048);
    }

    #[test]
    fn fit_respects_inuse_and_overcommit() {
        let mut r = worker(4, 1000, 1000, 0);
        r.cores.inuse = 3;
        assert!(check_worker_fit(&r, &req(1, -1, -1, -1), 1.0));
        assert!(!check_worker_fit(&r, &req(2, -1, -1, -1), 1.0));
        // Overcommit admits one more core of demand.
        assert!(check_worker_fit(&r, &req(2, -1, -1, -1), 1.25));
        // Disk never overcommits.
        r.disk.inuse = 1000;
        assert!(!check_worker_fit(&r, &req(-1, -1, 1, -1), 4.0));
    }

    #[test]
    fn fit_requires_an_initialized_worker() {
        let mut r = worker(4, 1000, 1000, 0);
        r.workers.total = 0;
        assert!(!check_worker_fit(&r, &ResourceSummary::unspecified(), 1.0));
    }

    fn cands() -> Vec<Candidate> {
        vec![
            Candidate {
                id: 1,
                free_score: 0.5,
                cached_bytes: 100,
                avg_time: Some(50),
            },
            Candidate {
                id: 2,
                free_score: 2.5,
                cached_bytes: 900,
                avg_time: Some(10),
            },
            Candidate {
                id: 3,
                free_score: 1.0,
                cached_bytes: 0,
                avg_time: None,
            },
        ]
    }

    #[test]
    fn policies_pick_as_documented() {
        assert_eq!(pick_candidate(Scheduler::Fcfs, &cands()), Some(1));
        assert_eq!(pick_candidate(Scheduler::Files, &cands()), Some(2));
        assert_eq!(pick_candidate(Scheduler::Worst, &cands()), Some(2));
        // No-history workers count as fastest for TIME.
        assert_eq!(pick_candidate(Scheduler::Time, &cands()), Some(3));
        assert!(pick_candidate(Scheduler::Rand, &cands()).is_some());
        assert_eq!(pick_candidate(Scheduler::Rand, &[]), None);
    }
}
