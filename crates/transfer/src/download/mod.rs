//! Resumable ranged downloads.

pub mod downloader;
pub mod events;
pub mod transfer;

pub use downloader::{DownloadHandle, DownloadOutcome, RangeDownloader};
pub use events::DownloadEvent;
pub use transfer::{DownloadStatus, RangeTransfer, parse_content_range};
