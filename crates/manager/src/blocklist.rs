use std::collections::HashMap;

use tracing::debug;

#[derive(Debug, Clone)]
pub(crate) struct BlockEntry {
    pub(crate) blocked: bool,
    pub(crate) times_blocked: u32,
    /// Absolute release time in microseconds; `None` means indefinite.
    pub(crate) release_at: Option<u64>,
}

/// Hostnames barred from connecting new workers.
#[derive(Debug, Default)]
pub(crate) struct Blocklist {
    hosts: HashMap<String, BlockEntry>,
}

impl Blocklist {
    /// Block a host until `release_at` (microseconds since epoch), or
    /// indefinitely when `None`. Re-blocking keeps the later release time.
    pub(crate) fn block(&mut self, hostname: &str, release_at: Option<u64>) {
        let entry = self.hosts.entry(hostname.to_string()).or_insert(BlockEntry {
            blocked: false,
            times_blocked: 0,
            release_at: None,
        });
        if !entry.blocked {
            entry.times_blocked += 1;
        }
        entry.blocked = true;
        entry.release_at = match (entry.release_at, release_at) {
            (None, _) | (_, None) => None,
            (Some(a), Some(b)) => Some(a.max(b)),
        };
        match release_at {
            Some(at) => debug!(hostname, release_at = at, times = entry.times_blocked, "blocking host"),
            None => debug!(hostname, times = entry.times_blocked, "blocking host indefinitely"),
        }
    }

    pub(crate) fn unblock(&mut self, hostname: &str) {
        self.hosts.remove(hostname);
    }

    pub(crate) fn is_blocked(&self, hostname: &str) -> bool {
        self.hosts.get(hostname).is_some_and(|e| e.blocked)
    }

    /// Release every host whose release time has passed. Indefinite blocks
    /// stay in place.
    pub(crate) fn unblock_all_by_time(&mut self, now: u64) {
        self.hosts.retain(|hostname, e| {
            match e.release_at {
                Some(at) if e.blocked && at <= now => {
                    debug!(hostname, "clearing host from blocklist");
                    false
                }
                _ => true,
            }
        });
    }

    pub(crate) fn clear(&mut self) {
        self.hosts.clear();
    }

    pub(crate) fn blocked_hosts(&self) -> Vec<&str> {
        let mut hosts: Vec<&str> = self
            .hosts
            .iter()
            .filter(|(_, e)| e.blocked)
            .map(|(h, _)| h.as_str())
            .collect();
        hosts.sort_unstable();
        hosts
    }

    pub(crate) fn len(&self) -> usize {
        self.hosts.len()
    }
}
