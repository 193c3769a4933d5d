use std::time::Duration;

use super::session::SessionStatus;

/// Progress notifications of an upload.
///
/// Delivered through an unbounded channel so workers never wait on a slow
/// consumer; a dropped receiver is ignored.
#[derive(Debug, Clone, PartialEq)]
pub enum UploadEvent {
    StatusChanged {
        from: SessionStatus,
        to: SessionStatus,
    },
    /// A part attempt failed and will be retried after `delay`.
    ChunkRetry {
        part_number: u32,
        attempt: u32,
        delay: Duration,
        reason: String,
    },
    ChunkCompleted {
        part_number: u32,
        /// Bytes confirmed so far.
        uploaded: u64,
        total: u64,
    },
    /// The merge call was not accepted; another attempt follows after `delay`.
    MergeRetry {
        attempt: u32,
        delay: Duration,
        reason: String,
    },
}
