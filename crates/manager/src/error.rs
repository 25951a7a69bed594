//! Public error type for manager operations.

/// Errors surfaced to the embedding application.
///
/// Worker-level failures never appear here; they are absorbed by the manager
/// as task re-queues (see the failure semantics of the scheduler). Only
/// problems with the caller's own requests or the local environment are
/// reported.
#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    /// The listening socket could not be created.
    #[error("cannot listen on port {port}: {source}")]
    Bind {
        /// Requested port (0 means ephemeral).
        port: u16,
        /// Underlying socket error.
        source: std::io::Error,
    },
    /// No port in the configured low/high range could be bound.
    #[error("no free port in range {low}-{high}")]
    PortRange {
        /// Lowest port tried.
        low: u16,
        /// Highest port tried.
        high: u16,
    },
    /// A task was re-submitted while still in a non-terminal state.
    #[error("task {0} is already submitted and not in a terminal state")]
    AlreadySubmitted(u64),
    /// `tune` was called with a name outside the recognized set.
    #[error("unknown tuning parameter {0:?}")]
    UnknownTunable(String),
    /// A log file could not be created or written.
    #[error("cannot open log file {path}: {source}")]
    LogFile {
        /// Path that failed to open.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The configured password file could not be read.
    #[error("cannot read password file {path}: {source}")]
    PasswordFile {
        /// Path that failed to open.
        path: String,
        /// Underlying I/O error.
        source: std::io::Error,
    },
    /// The HTTP client for catalog traffic could not be constructed.
    #[error("cannot initialize catalog http client: {0}")]
    HttpClient(#[from] reqwest::Error),
}
