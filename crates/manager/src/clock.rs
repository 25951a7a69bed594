use chrono::Utc;

/// Microseconds since the Unix epoch, the timestamp unit used throughout
/// the manager, its logs and the wire protocol.
pub(crate) fn now_usec() -> u64 {
    Utc::now().timestamp_micros().max(0) as u64
}

pub(crate) fn secs(n: u64) -> u64 {
    n * 1_000_000
}
