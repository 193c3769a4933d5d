use super::transfer::RangeTransfer;

/// Notifications broadcast by a [`RangeDownloader`](super::RangeDownloader).
///
/// User aborts (pause, cancel) never produce an `Error`.
#[derive(Debug, Clone, PartialEq)]
pub enum DownloadEvent {
    Progress {
        loaded: u64,
        /// Zero while unknown.
        total: u64,
        /// `loaded / total`, zero while the total is unknown.
        progress: f64,
    },
    Completed(RangeTransfer),
    Error {
        message: String,
    },
}
