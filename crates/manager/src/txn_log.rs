use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::Path;

use crate::clock::now_usec;

/// Append-only transaction log: one record per state transition of a task,
/// worker, category or the manager itself, in the form
/// `<timestamp-usec> <kind> <id> <new-state> [extra]`.
#[derive(Debug)]
pub(crate) struct TxnLog {
    out: BufWriter<File>,
}

impl TxnLog {
    pub(crate) fn create(path: &Path) -> std::io::Result<TxnLog> {
        let mut out = BufWriter::new(File::create(path)?);
        writeln!(out, "# time manager_pid MANAGER START")?;
        out.flush()?;
        Ok(TxnLog { out })
    }

    pub(crate) fn write(&mut self, kind: &str, id: &str, state: &str, extra: Option<&str>) {
        let result = match extra {
            Some(extra) => writeln!(self.out, "{} {kind} {id} {state} {extra}", now_usec()),
            None => writeln!(self.out, "{} {kind} {id} {state}", now_usec()),
        };
        let _ = result;
        let _ = self.out.flush();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_are_one_line_each() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("txn.log");
        let mut log = TxnLog::create(&path).unwrap();
        log.write("TASK", "1", "READY", None);
        log.write("WORKER", "2", "REMOVED", Some("FAILURE"));
        let text = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines.len(), 3);
        assert!(lines[1].ends_with("TASK 1 READY"));
        assert!(lines[2].ends_with("WORKER 2 REMOVED FAILURE"));
    }
}
