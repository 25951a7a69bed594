use std::collections::HashMap;

use uuid::Uuid;

use crate::worker::WorkerId;

#[derive(Debug, Clone)]
pub(crate) struct TransferPair {
    pub(crate) to: WorkerId,
    pub(crate) source: String,
}

/// Transfers currently in flight, keyed by the id echoed back in
/// `cache-update`/`cache-invalid`. Counts per-source usage so the planner
/// can meter concurrent pulls from one origin.
#[derive(Debug, Default)]
pub(crate) struct CurrentTransfers {
    table: HashMap<String, TransferPair>,
}

impl CurrentTransfers {
    /// Reserve a slot for a transfer to `to` from `source`, returning the
    /// transfer id to put on the wire.
    pub(crate) fn add(&mut self, to: WorkerId, source: &str) -> String {
        let id = Uuid::new_v4().to_string();
        self.table.insert(
            id.clone(),
            TransferPair {
                to,
                source: source.to_string(),
            },
        );
        id
    }

    pub(crate) fn remove(&mut self, id: &str) -> bool {
        self.table.remove(id).is_some()
    }

    pub(crate) fn source_in_use(&self, source: &str) -> usize {
        self.table.values().filter(|t| t.source == source).count()
    }

    /// Drop every reservation headed to a worker that failed or left.
    pub(crate) fn wipe_worker(&mut self, w: WorkerId) {
        self.table.retain(|_, t| t.to != w);
    }

    pub(crate) fn len(&self) -> usize {
        self.table.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn source_counting() {
        let mut ct = CurrentTransfers::default();
        let a = ct.add(1, "http://example/x");
        let _b = ct.add(2, "http://example/x");
        let _c = ct.add(2, "worker://h:1/f");
        assert_eq!(ct.source_in_use("http://example/x"), 2);
        assert_eq!(ct.source_in_use("worker://h:1/f"), 1);
        assert!(ct.remove(&a));
        assert!(!ct.remove(&a));
        assert_eq!(ct.source_in_use("http://example/x"), 1);
    }

    #[test]
    fn wipe_worker_releases_its_slots() {
        let mut ct = CurrentTransfers::default();
        ct.add(1, "s1");
        ct.add(1, "s2");
        ct.add(2, "s1");
        ct.wipe_worker(1);
        assert_eq!(ct.len(), 1);
        assert_eq!(ct.source_in_use("s1"), 1);
        assert_eq!(ct.source_in_use("s2"), 0);
    }
}
