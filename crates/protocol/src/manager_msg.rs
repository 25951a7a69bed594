use std::fmt;

use crate::url_encode;

/// One file line inside a serialized task description.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TaskFileLine {
    /// Content-addressed cache name of the binding.
    pub cache_name: String,
    /// Name of the file inside the task sandbox.
    pub remote_name: String,
    /// Binding flag bits (`FILE_FLAG_*`).
    pub flags: u32,
}

/// The serialized body of a `task` message: command, environment, category,
/// resource envelope and file bindings, ending with `end`.
///
/// The command and each environment entry are length-framed so they may
/// contain arbitrary bytes; everything else is one field-per-line ASCII.
#[derive(Debug, Clone, PartialEq)]
pub struct TaskDescription {
    /// Task id being committed.
    pub task_id: u64,
    /// Shell command to execute.
    pub command: String,
    /// Category the task belongs to.
    pub category: String,
    /// Environment entries as `KEY=VALUE` strings.
    pub env: Vec<String>,
    /// Cores in the allocation envelope.
    pub cores: i64,
    /// Memory (MB) in the allocation envelope.
    pub memory: i64,
    /// Disk (MB) in the allocation envelope.
    pub disk: i64,
    /// Gpus in the allocation envelope.
    pub gpus: i64,
    /// Absolute end time (microseconds since epoch), 0 when unset.
    pub end_time: u64,
    /// Maximum run time (microseconds), 0 when unset.
    pub wall_time: u64,
    /// Input bindings, in declaration order.
    pub inputs: Vec<TaskFileLine>,
    /// Output bindings, in declaration order.
    pub outputs: Vec<TaskFileLine>,
}

impl TaskDescription {
    /// Render the full multi-line message, terminator included.
    pub fn encode(&self) -> String {
        let mut out = String::new();
        out.push_str(&format!("task {}\n", self.task_id));
        out.push_str(&format!("cmd {}\n", self.command.len()));
        out.push_str(&self.command);
        out.push('\n');
        out.push_str(&format!("category {}\n", url_encode(&self.category)));
        out.push_str(&format!("cores {}\n", self.cores));
        out.push_str(&format!("memory {}\n", self.memory));
        out.push_str(&format!("disk {}\n", self.disk));
        out.push_str(&format!("gpus {}\n", self.gpus));
        if self.end_time > 0 {
            out.push_str(&format!("end_time {}\n", self.end_time));
        }
        if self.wall_time > 0 {
            out.push_str(&format!("wall_time {}\n", self.wall_time));
        }
        for entry in &self.env {
            out.push_str(&format!("env {}\n", entry.len()));
            out.push_str(entry);
            out.push('\n');
        }
        for f in &self.inputs {
            out.push_str(&format!(
                "infile {} {} {}\n",
                f.cache_name,
                url_encode(&f.remote_name),
                f.flags
            ));
        }
        for f in &self.outputs {
            out.push_str(&format!(
                "outfile {} {} {}\n",
                f.cache_name,
                url_encode(&f.remote_name),
                f.flags
            ));
        }
        out.push_str("end\n");
        out
    }
}

/// A control line sent by the manager to a worker.
///
/// `Display` renders the exact wire line without the trailing newline.
#[derive(Debug, Clone, PartialEq)]
pub enum ManagerMsg {
    /// Handshake acknowledgement carrying the manager's address.
    ///
    /// On the wire: `taskvine <protocol> <addr> <port>`
    Handshake {
        /// Protocol revision the manager speaks.
        protocol: u32,
        /// Address the manager listens on.
        addr: String,
        /// Port the manager listens on.
        port: u16,
    },
    /// Request queued results; `max` of -1 asks for all of them.
    ///
    /// On the wire: `send_results <max>`
    SendResults {
        /// Maximum number of results to send, or -1 for no limit.
        max: i64,
    },
    /// Stage a manager-sourced file; `size` raw bytes follow.
    ///
    /// On the wire: `put <cache-name> <size> <mode>`
    Put {
        /// Cache entry to create.
        cache_name: String,
        /// Payload length.
        size: u64,
        /// Unix permission bits to apply.
        mode: u32,
    },
    /// Ask the worker to fetch a URL (or peer source) itself.
    ///
    /// On the wire: `puturl <url> <cache-name> <size> <mode> <transfer-id>`
    PutUrl {
        /// Source URL, possibly a `worker://` peer source.
        url: String,
        /// Cache entry to create.
        cache_name: String,
        /// Expected size in bytes.
        size: u64,
        /// Unix permission bits to apply.
        mode: u32,
        /// Transfer id to echo back in `cache-update`/`cache-invalid`.
        transfer_id: String,
    },
    /// Ask the worker to materialize a cache entry by running a command;
    /// `spec_len` bytes of JSON describing the mini task follow.
    ///
    /// On the wire: `mini_task <cache-name> <size> <mode> <spec-len>`
    MiniTask {
        /// Cache entry the mini task produces.
        cache_name: String,
        /// Expected size in bytes.
        size: u64,
        /// Unix permission bits to apply.
        mode: u32,
        /// Length of the JSON spec payload.
        spec_len: u64,
    },
    /// Fetch a file from the worker; answered by `file` or `error`.
    ///
    /// On the wire: `get <cache-name> <remote-path>`
    Get {
        /// Cache entry to fetch.
        cache_name: String,
        /// Path of the file within the sandbox or cache.
        remote_path: String,
    },
    /// Remove a cache entry on the worker.
    ///
    /// On the wire: `unlink <cache-name>`
    Unlink {
        /// Cache entry to remove.
        cache_name: String,
    },
    /// Kill a running task, or every task when `task_id` is -1.
    ///
    /// On the wire: `kill <taskid>` / `kill -1`
    Kill {
        /// Task to kill, or -1 for all.
        task_id: i64,
    },
    /// Politely ask the worker to disconnect and clean up.
    ///
    /// On the wire: `release`
    Release,
    /// Ask the worker process to exit outright.
    ///
    /// On the wire: `exit`
    Exit,
    /// Keepalive probe; the worker answers `alive`.
    ///
    /// On the wire: `check`
    Check,
    /// Password challenge issued right after accept.
    ///
    /// On the wire: `challenge <nonce>`
    Challenge {
        /// Random nonce the worker must digest with the shared secret.
        nonce: String,
    },
    /// Positive reply to a correct `auth` digest.
    ///
    /// On the wire: `ok`
    AuthOk,
}

impl fmt::Display for ManagerMsg {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ManagerMsg::Handshake {
                protocol,
                addr,
                port,
            } => write!(f, "taskvine {protocol} {addr} {port}"),
            ManagerMsg::SendResults { max } => write!(f, "send_results {max}"),
            ManagerMsg::Put {
                cache_name,
                size,
                mode,
            } => write!(f, "put {cache_name} {size} {mode:o}"),
            ManagerMsg::PutUrl {
                url,
                cache_name,
                size,
                mode,
                transfer_id,
            } => write!(f, "puturl {url} {cache_name} {size} {mode:o} {transfer_id}"),
            ManagerMsg::MiniTask {
                cache_name,
                size,
                mode,
                spec_len,
            } => write!(f, "mini_task {cache_name} {size} {mode:o} {spec_len}"),
            ManagerMsg::Get {
                cache_name,
                remote_path,
            } => write!(f, "get {cache_name} {}", url_encode(remote_path)),
            ManagerMsg::Unlink { cache_name } => write!(f, "unlink {cache_name}"),
            ManagerMsg::Kill { task_id } => write!(f, "kill {task_id}"),
            ManagerMsg::Release => write!(f, "release"),
            ManagerMsg::Exit => write!(f, "exit"),
            ManagerMsg::Check => write!(f, "check"),
            ManagerMsg::Challenge { nonce } => write!(f, "challenge {nonce}"),
            ManagerMsg::AuthOk => write!(f, "ok"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn control_lines() {
        assert_eq!(ManagerMsg::SendResults { max: -1 }.to_string(), "send_results -1");
        assert_eq!(ManagerMsg::Kill { task_id: -1 }.to_string(), "kill -1");
        assert_eq!(ManagerMsg::Check.to_string(), "check");
        assert_eq!(
            ManagerMsg::Put {
                cache_name: "buffer-md5-aa".into(),
                size: 11,
                mode: 0o644,
            }
            .to_string(),
            "put buffer-md5-aa 11 644"
        );
    }

    #[test]
    fn puturl_carries_transfer_id() {
        let line = ManagerMsg::PutUrl {
            url: "worker://10.0.0.2:9123/file-md5-bb".into(),
            cache_name: "file-md5-bb".into(),
            size: 1048576,
            mode: 0o755,
            transfer_id: "id-1".into(),
        }
        .to_string();
        assert_eq!(
            line,
            "puturl worker://10.0.0.2:9123/file-md5-bb file-md5-bb 1048576 755 id-1"
        );
    }

    #[test]
    fn task_description_round_trips_fields() {
        let desc = TaskDescription {
            task_id: 7,
            command: "echo hello > out".into(),
            category: "default".into(),
            env: vec!["LANG=C".into()],
            cores: 4,
            memory: 4096,
            disk: 10240,
            gpus: 0,
            end_time: 0,
            wall_time: 0,
            inputs: vec![],
            outputs: vec![TaskFileLine {
                cache_name: "file-md5-cc".into(),
                remote_name: "out".into(),
                flags: 0,
            }],
        };
        let text = desc.encode();
        assert!(text.starts_with("task 7\ncmd 16\necho hello > out\n"));
        assert!(text.contains("category default\n"));
        assert!(text.contains("env 6\nLANG=C\n"));
        assert!(text.contains("outfile file-md5-cc out 0\n"));
        assert!(text.ends_with("end\n"));
    }
}
