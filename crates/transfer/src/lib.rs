//! Resumable, chunked media transfer.
//!
//! Two independent engines share one HTTP stack:
//!
//! - [`UploadEngine`] negotiates an UPOS upload session, splits a local file
//!   into parts, uploads them concurrently and merges them into one object.
//! - [`RangeDownloader`] fetches a remote resource into a local file with
//!   `Range` requests, surviving stalls, pauses and restarts.
//!
//! ```no_run
//! use transfer_engine::{ClientConfig, UploadEngine, UploadOptions, create_client};
//!
//! # async fn run() -> transfer_engine::Result<()> {
//! let client = create_client(&ClientConfig::default())?;
//! let engine = UploadEngine::with_client(client, UploadOptions::default(), Some("SESSDATA=...".into()));
//! let result = engine.upload("video.mp4", "My video").await?;
//! println!("{} -> {}", result.content_id, result.filename);
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod download;
pub mod error;
pub mod proxy;
pub mod retry;
pub mod upload;

pub use client::{create_client, install_rustls_provider};
pub use config::{ClientConfig, DownloadOptions, MergeRetryPolicy, UploadOptions};
pub use download::{
    DownloadEvent, DownloadHandle, DownloadOutcome, DownloadStatus, RangeDownloader, RangeTransfer,
};
pub use error::{Result, TransferError};
pub use proxy::{ProxyAuth, ProxyConfig, ProxyType};
pub use retry::RetryPolicy;
pub use upload::{
    NegotiateRequest, SessionDescriptor, SessionStatus, TransferSession, UploadEngine, UploadEvent,
    UploadResult,
};
