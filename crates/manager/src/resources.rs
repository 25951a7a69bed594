use serde::{Deserialize, Serialize};

/// One resource dimension of a worker: totals as reported by the worker,
/// `inuse` as recomputed by the manager from allocation envelopes.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct Resource {
    /// Total units the worker advertises.
    pub total: i64,
    /// Units currently committed to running tasks.
    pub inuse: i64,
    /// Smallest single allocation the worker reports.
    pub smallest: i64,
    /// Largest single allocation the worker reports.
    pub largest: i64,
}

/// The full per-worker resource record.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct WorkerResources {
    /// Version marker of the last resource update batch.
    pub tag: i64,
    /// Core count.
    pub cores: Resource,
    /// Memory in MB.
    pub memory: Resource,
    /// Disk in MB.
    pub disk: Resource,
    /// Gpu count.
    pub gpus: Resource,
    /// Sub-worker slots (1 for a plain worker).
    pub workers: Resource,
}

impl WorkerResources {
    /// Replace one dimension, preserving the manager-computed `inuse`.
    pub(crate) fn update_dimension(&mut self, name: &str, r: Resource) -> bool {
        let slot = match name {
            "cores" => &mut self.cores,
            "memory" => &mut self.memory,
            "disk" => &mut self.disk,
            "gpus" => &mut self.gpus,
            "workers" => &mut self.workers,
            _ => return false,
        };
        let inuse = slot.inuse;
        *slot = r;
        slot.inuse = inuse;
        true
    }

    pub(crate) fn clear_inuse(&mut self) {
        self.cores.inuse = 0;
        self.memory.inuse = 0;
        self.disk.inuse = 0;
        self.gpus.inuse = 0;
    }
}

/// A resource vector where -1 marks an unspecified dimension. Used for task
/// requests, allocation envelopes, category bounds, and measured usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceSummary {
    /// Cores, -1 when unspecified.
    pub cores: i64,
    /// Memory in MB, -1 when unspecified.
    pub memory: i64,
    /// Disk in MB, -1 when unspecified.
    pub disk: i64,
    /// Gpus, -1 when unspecified.
    pub gpus: i64,
}

impl Default for ResourceSummary {
    fn default() -> Self {
        ResourceSummary::unspecified()
    }
}

impl ResourceSummary {
    /// A summary with every dimension unspecified.
    pub const fn unspecified() -> ResourceSummary {
        ResourceSummary {
            cores: -1,
            memory: -1,
            disk: -1,
            gpus: -1,
        }
    }

    /// A summary with every dimension zero.
    pub const fn zero() -> ResourceSummary {
        ResourceSummary {
            cores: 0,
            memory: 0,
            disk: 0,
            gpus: 0,
        }
    }

    /// True when no dimension is specified.
    pub fn is_unspecified(&self) -> bool {
        self.cores < 0 && self.memory < 0 && self.disk < 0 && self.gpus < 0
    }

    /// Overwrite each of our dimensions that `other` specifies.
    pub(crate) fn merge_override(&mut self, other: &ResourceSummary) {
        if other.cores >= 0 {
            self.cores = other.cores;
        }
        if other.memory >= 0 {
            self.memory = other.memory;
        }
        if other.disk >= 0 {
            self.disk = other.disk;
        }
        if other.gpus >= 0 {
            self.gpus = other.gpus;
        }
    }

    /// Raise each dimension to at least the value `other` specifies.
    pub(crate) fn merge_max(&mut self, other: &ResourceSummary) {
        if other.cores > self.cores {
            self.cores = other.cores;
        }
        if other.memory > self.memory {
            self.memory = other.memory;
        }
        if other.disk > self.disk {
            self.disk = other.disk;
        }
        if other.gpus > self.gpus {
            self.gpus = other.gpus;
        }
    }

    /// Sum of two summaries, treating unspecified dimensions as zero.
    pub(crate) fn saturating_add(&self, other: &ResourceSummary) -> ResourceSummary {
        let add = |a: i64, b: i64| a.max(0).saturating_add(b.max(0));
        ResourceSummary {
            cores: add(self.cores, other.cores),
            memory: add(self.memory, other.memory),
            disk: add(self.disk, other.disk),
            gpus: add(self.gpus, other.gpus),
        }
    }

    pub(crate) fn specified_or(&self, default: i64) -> ResourceSummary {
        let pick = |v: i64| if v >= 0 { v } else { default };
        ResourceSummary {
            cores: pick(self.cores),
            memory: pick(self.memory),
            disk: pick(self.disk),
            gpus: pick(self.gpus),
        }
    }
}

/// Resources measured for one task execution, recovered from the resource
/// monitor summary file (or a sentinel when monitoring was unavailable).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResourcesMeasured {
    /// Exit status recorded by the monitor, mirroring the task exit code
    /// when the monitor itself was absent.
    #[serde(default)]
    pub exit_status: i32,
    /// Peak usage per dimension.
    #[serde(default)]
    pub usage: ResourceSummary,
    /// Wall time in microseconds.
    #[serde(default)]
    pub wall_time: u64,
    /// Dimensions whose limits were exceeded, when the monitor killed the
    /// task for resource exhaustion.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits_exceeded: Option<ResourceSummary>,
}

impl ResourcesMeasured {
    /// The sentinel summary used when no monitor output was available.
    pub fn sentinel(exit_code: i32) -> ResourcesMeasured {
        ResourcesMeasured {
            exit_status: exit_code,
            usage: ResourceSummary::unspecified(),
            wall_time: 0,
            limits_exceeded: None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_dimension_preserves_inuse() {
        let mut r = WorkerResources::default();
        r.cores.inuse = 3;
        assert!(r.update_dimension(
            "cores",
            Resource {
                total: 16,
                inuse: 999,
                smallest: 1,
                largest: 16,
            }
        ));
        assert_eq!(r.cores.total, 16);
        assert_eq!(r.cores.inuse, 3);
        assert!(!r.update_dimension("quarks", Resource::default()));
    }

    #[test]
    fn merge_override_only_takes_specified() {
        let mut a = ResourceSummary {
            cores: 2,
            memory: -1,
            disk: 100,
            gpus: -1,
        };
        a.merge_override(&ResourceSummary {
            cores: -1,
            memory: 512,
            disk: -1,
            gpus: 1,
        });
        assert_eq!(
            a,
            ResourceSummary {
                cores: 2,
                memory: 512,
                disk: 100,
                gpus: 1,
            }
        );
    }

    #[test]
    fn merge_max_raises() {
        let mut a = ResourceSummary {
            cores: 1,
            memory: 100,
            disk: -1,
            gpus: 0,
        };
        a.merge_max(&ResourceSummary {
            cores: 4,
            memory: 50,
            disk: 10,
            gpus: -1,
        });
        assert_eq!(a.cores, 4);
        assert_eq!(a.memory, 100);
        assert_eq!(a.disk, 10);
        assert_eq!(a.gpus, 0);
    }

    #[test]
    fn sentinel_mirrors_exit_code() {
        let m = ResourcesMeasured::sentinel(137);
        assert_eq!(m.exit_status, 137);
        assert!(m.usage.is_unspecified());
    }
}
