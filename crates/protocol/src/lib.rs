#![forbid(unsafe_code)]
#![deny(unreachable_pub)]
#![deny(missing_docs)]

//! Wire protocol spoken between a taskmill manager and its workers.
//!
//! The protocol is line-oriented ASCII over TCP. Each line is terminated by
//! `\n`; binary payloads (task stdout, file contents, error text) are
//! announced by a length field on the preceding control line and follow it
//! raw. This crate defines both message directions as typed enums with
//! bit-exact parse and encode, plus the peer transfer source URI scheme.
//! It performs no I/O.

mod escape;
mod manager_msg;
mod source;
mod worker_msg;

pub use manager_msg::{ManagerMsg, TaskDescription, TaskFileLine};
pub use source::{is_peer_source, peer_source_uri, PeerSource};
pub use worker_msg::{StatusTopic, WorkerMsg};

pub(crate) use escape::{url_decode, url_encode};

/// Protocol revision carried in both handshake lines. A worker announcing a
/// different revision is rejected outright.
pub const PROTOCOL_VERSION: u32 = 11;

/// Longest control line either side may send, including the terminator.
pub const LINE_MAX: usize = 4096;

/// Largest task stdout retained by the manager; anything beyond this is
/// drained from the socket and replaced with a truncation marker.
pub const MAX_STDOUT_STORAGE: u64 = 1 << 30;

/// File binding flag: keep the file in the worker cache across tasks.
pub const FILE_FLAG_CACHE: u32 = 1 << 0;
/// File binding flag: stream partial output back while the task runs.
pub const FILE_FLAG_WATCH: u32 = 1 << 1;
/// File binding flag: the worker may provide the file as a symlink.
pub const FILE_FLAG_SYMLINK_OK: u32 = 1 << 2;
/// File binding flag: mount the cache entry as a directory in the sandbox.
pub const FILE_FLAG_MOUNT_DIR: u32 = 1 << 3;

/// Failure to interpret a received line.
#[derive(Debug, thiserror::Error)]
pub enum ParseError {
    /// The verb was not recognized at all.
    #[error("unknown message: {0:?}")]
    UnknownVerb(String),
    /// The verb was recognized but its fields did not scan.
    #[error("malformed {verb} message: {line:?}")]
    Malformed {
        /// Verb whose field layout was violated.
        verb: &'static str,
        /// The offending line.
        line: String,
    },
}

impl ParseError {
    pub(crate) fn malformed(verb: &'static str, line: &str) -> Self {
        ParseError::Malformed {
            verb,
            line: line.to_string(),
        }
    }
}
