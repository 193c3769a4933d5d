use std::fmt;
use std::path::PathBuf;

use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum DownloadStatus {
    Pending,
    Running,
    Paused,
    Canceled,
    Error,
    Completed,
}

impl DownloadStatus {
    /// Whether `start` may be called. A canceled transfer starts over.
    pub fn can_start(self) -> bool {
        matches!(self, Self::Pending | Self::Paused | Self::Canceled)
    }

    pub fn can_pause(self) -> bool {
        self == Self::Running
    }

    pub fn can_cancel(self) -> bool {
        matches!(self, Self::Pending | Self::Running | Self::Paused)
    }
}

impl fmt::Display for DownloadStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Running => "running",
            Self::Paused => "paused",
            Self::Canceled => "canceled",
            Self::Error => "error",
            Self::Completed => "completed",
        };
        f.write_str(s)
    }
}

/// Progress state of one ranged download.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RangeTransfer {
    pub url: String,
    pub file_path: PathBuf,
    /// Zero until the server reports it.
    pub total_size: u64,
    pub downloaded_size: u64,
    pub status: DownloadStatus,
    /// Retries spent since the last fresh start; kept across pause and resume.
    pub retry_count: u32,
}

impl RangeTransfer {
    pub fn new(url: impl Into<String>, file_path: impl Into<PathBuf>) -> Self {
        Self {
            url: url.into(),
            file_path: file_path.into(),
            total_size: 0,
            downloaded_size: 0,
            status: DownloadStatus::Pending,
            retry_count: 0,
        }
    }

    /// Fraction done in `[0, 1]`; zero while the total is unknown.
    pub fn progress(&self) -> f64 {
        if self.total_size == 0 {
            0.0
        } else {
            (self.downloaded_size as f64 / self.total_size as f64).min(1.0)
        }
    }

    pub(crate) fn reset(&mut self) {
        self.total_size = 0;
        self.downloaded_size = 0;
        self.retry_count = 0;
    }
}

/// Total length from a `Content-Range: bytes <start>-<end>/<total>` value.
///
/// Returns `None` for an unknown (`*`) or malformed total.
pub fn parse_content_range(value: &str) -> Option<u64> {
    let rest = value.trim().strip_prefix("bytes")?.trim_start();
    let (_, total) = rest.split_once('/')?;
    total.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_range_total() {
        assert_eq!(parse_content_range("bytes 100-199/1000"), Some(1000));
        assert_eq!(parse_content_range("bytes 0-0/1"), Some(1));
        assert_eq!(parse_content_range("bytes */1000"), Some(1000));
        assert_eq!(parse_content_range("bytes 0-99/*"), None);
        assert_eq!(parse_content_range("items 0-99/100"), None);
        assert_eq!(parse_content_range("garbage"), None);
    }

    #[test]
    fn status_gates() {
        use DownloadStatus::*;
        assert!(Pending.can_start() && Paused.can_start() && Canceled.can_start());
        assert!(!Running.can_start() && !Error.can_start() && !Completed.can_start());
        assert!(Running.can_pause());
        assert!(!Paused.can_pause() && !Pending.can_pause());
        assert!(Pending.can_cancel() && Running.can_cancel() && Paused.can_cancel());
        assert!(!Completed.can_cancel() && !Error.can_cancel() && !Canceled.can_cancel());
    }

    #[test]
    fn progress_is_zero_until_total_known() {
        let mut transfer = RangeTransfer::new("http://example.com/a.flv", "/tmp/a.flv");
        transfer.downloaded_size = 10;
        assert_eq!(transfer.progress(), 0.0);
        transfer.total_size = 40;
        assert_eq!(transfer.progress(), 0.25);
    }
}
