use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::clock::now_usec;
use crate::stats::Stats;

/// Writer of the performance log: a `#`-prefixed header naming every field,
/// then one space-separated snapshot line per interval or forced event.
#[derive(Debug)]
pub(crate) struct PerfLog {
    out: BufWriter<File>,
}

const HEADER: &str = "# timestamp \
workers_connected workers_init workers_idle workers_busy workers_able \
workers_joined workers_removed workers_released workers_idled_out workers_blocked workers_slow workers_lost \
tasks_waiting tasks_on_workers tasks_running tasks_with_results \
tasks_submitted tasks_dispatched tasks_done tasks_failed tasks_cancelled tasks_exhausted_attempts \
time_send time_receive time_send_good time_receive_good time_status_msgs time_internal time_polling time_application time_scheduling \
time_execute time_execute_good time_execute_exhaustion \
bytes_sent bytes_received bandwidth \
capacity_tasks capacity_cores capacity_memory capacity_disk capacity_instantaneous capacity_weighted manager_load \
total_cores total_memory total_disk \
committed_cores committed_memory committed_disk \
max_cores max_memory max_disk \
min_cores min_memory min_disk";

impl PerfLog {
    pub(crate) fn create(path: &Path) -> std::io::Result<PerfLog> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "{HEADER}")?;
        out.flush()?;
        Ok(PerfLog { out })
    }

    pub(crate) fn write_snapshot(&mut self, s: &Stats) {
        let line = format!(
            "{} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {} {:.2} {} {} {} {} {} {} {:.6} {} {} {} {} {} {} {} {} {} {} {} {} {}",
            now_usec(),
            s.workers_connected,
            s.workers_init,
            s.workers_idle,
            s.workers_busy,
            s.workers_able,
            s.workers_joined,
            s.workers_removed,
            s.workers_released,
            s.workers_idled_out,
            s.workers_blocked,
            s.workers_slow,
            s.workers_lost,
            s.tasks_waiting,
            s.tasks_on_workers,
            s.tasks_running,
            s.tasks_with_results,
            s.tasks_submitted,
            s.tasks_dispatched,
            s.tasks_done,
            s.tasks_failed,
            s.tasks_cancelled,
            s.tasks_exhausted_attempts,
            s.time_send,
            s.time_receive,
            s.time_send_good,
            s.time_receive_good,
            s.time_status_msgs,
            s.time_internal,
            s.time_polling,
            s.time_application,
            s.time_scheduling,
            s.time_workers_execute,
            s.time_workers_execute_good,
            s.time_workers_execute_exhaustion,
            s.bytes_sent,
            s.bytes_received,
            s.bandwidth,
            s.capacity_tasks,
            s.capacity_cores,
            s.capacity_memory,
            s.capacity_disk,
            s.capacity_instantaneous,
            s.capacity_weighted,
            s.manager_load,
            s.total_cores,
            s.total_memory,
            s.total_disk,
            s.committed_cores,
            s.committed_memory,
            s.committed_disk,
            s.max_cores,
            s.max_memory,
            s.max_disk,
            s.min_cores,
            s.min_memory,
            s.min_disk,
        );
        let _ = writeln!(self.out, "{line}");
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_and_snapshot_have_matching_arity() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("perf.log");
        let mut log = PerfLog::create(&path).unwrap();
        log.write_snapshot(&Stats::default());
        let text = std::fs::read_to_string(&path).unwrap();
        let mut lines = text.lines();
        let header = lines.next().unwrap();
        let snapshot = lines.next().unwrap();
        assert!(header.starts_with("# "));
        // "#" plus one name per value.
        let names = header.split_ascii_whitespace().count() - 1;
        let values = snapshot.split_ascii_whitespace().count();
        assert_eq!(names, values);
    }
}
