//! Resumable ranged download into a local file.
//!
//! One driver task per run streams the body of a `Range` request to disk.
//! Every read is bounded by the stall window; a stalled or failed request is
//! re-issued from the current offset until the retry budget runs out.

use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures::StreamExt;
use parking_lot::Mutex;
use reqwest::header::{CONTENT_LENGTH, CONTENT_RANGE, RANGE};
use reqwest::{Client, StatusCode};
use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};
use url::Url;

use super::events::DownloadEvent;
use super::transfer::{DownloadStatus, RangeTransfer, parse_content_range};
use crate::client::create_client;
use crate::config::{ClientConfig, DownloadOptions};
use crate::error::{Result, TransferError};

const EVENT_CAPACITY: usize = 256;

/// How a run ended when it did not fail.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DownloadOutcome {
    Completed,
    Paused,
    Canceled,
}

/// Handle on one run started by [`RangeDownloader::start`].
#[derive(Debug)]
pub struct DownloadHandle {
    task: JoinHandle<Result<DownloadOutcome>>,
}

impl DownloadHandle {
    /// Wait for the run to end.
    pub async fn wait(self) -> Result<DownloadOutcome> {
        self.task
            .await
            .map_err(|e| TransferError::internal(format!("download task failed: {e}")))?
    }
}

struct State {
    transfer: RangeTransfer,
    /// Token of the current run, if one is active.
    run: Option<CancellationToken>,
}

struct Inner {
    client: Client,
    options: DownloadOptions,
    state: Mutex<State>,
    events: broadcast::Sender<DownloadEvent>,
    /// Held by a driver for its whole lifetime; a resumed run waits here
    /// until the previous one released the file.
    io_lock: tokio::sync::Mutex<()>,
}

/// Cloneable handle over one download.
#[derive(Clone)]
pub struct RangeDownloader {
    inner: Arc<Inner>,
}

impl RangeDownloader {
    pub fn new(
        url: impl Into<String>,
        path: impl Into<PathBuf>,
        options: DownloadOptions,
        client_config: &ClientConfig,
    ) -> Result<Self> {
        let client = create_client(client_config)?;
        Self::with_client(client, url, path, options)
    }

    /// Share an existing client, e.g. across several downloads.
    pub fn with_client(
        client: Client,
        url: impl Into<String>,
        path: impl Into<PathBuf>,
        options: DownloadOptions,
    ) -> Result<Self> {
        let url = url.into();
        let parsed = Url::parse(&url).map_err(|e| TransferError::invalid_url(&url, e.to_string()))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(TransferError::invalid_url(&url, "only http and https are supported"));
        }

        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        Ok(Self {
            inner: Arc::new(Inner {
                client,
                options,
                state: Mutex::new(State {
                    transfer: RangeTransfer::new(url, path),
                    run: None,
                }),
                events,
                io_lock: tokio::sync::Mutex::new(()),
            }),
        })
    }

    pub fn subscribe(&self) -> broadcast::Receiver<DownloadEvent> {
        self.inner.events.subscribe()
    }

    pub fn snapshot(&self) -> RangeTransfer {
        self.inner.state.lock().transfer.clone()
    }

    pub fn status(&self) -> DownloadStatus {
        self.inner.state.lock().transfer.status
    }

    /// Start or resume the download on the current tokio runtime.
    ///
    /// A paused download resumes from its offset; a pending or canceled one
    /// starts over with an empty file.
    pub fn start(&self) -> Result<DownloadHandle> {
        let token = CancellationToken::new();
        let fresh = {
            let mut state = self.inner.state.lock();
            let status = state.transfer.status;
            if !status.can_start() {
                return Err(TransferError::invalid_state("start", status));
            }
            let fresh = status != DownloadStatus::Paused;
            if fresh {
                state.transfer.reset();
            }
            state.transfer.status = DownloadStatus::Running;
            state.run = Some(token.clone());
            info!(
                url = %state.transfer.url,
                offset = state.transfer.downloaded_size,
                fresh,
                "Starting download"
            );
            fresh
        };

        let inner = self.inner.clone();
        let task = tokio::spawn(async move { inner.drive(token, fresh).await });
        Ok(DownloadHandle { task })
    }

    /// Stop the running request and keep the offset for a later `start`.
    pub fn pause(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        let status = state.transfer.status;
        if !status.can_pause() {
            return Err(TransferError::invalid_state("pause", status));
        }
        state.transfer.status = DownloadStatus::Paused;
        if let Some(token) = state.run.take() {
            token.cancel();
        }
        debug!(offset = state.transfer.downloaded_size, "Download paused");
        Ok(())
    }

    /// Abort and forget progress; the next `start` begins from scratch.
    pub fn cancel(&self) -> Result<()> {
        let mut state = self.inner.state.lock();
        let status = state.transfer.status;
        if !status.can_cancel() {
            return Err(TransferError::invalid_state("cancel", status));
        }
        state.transfer.status = DownloadStatus::Canceled;
        state.transfer.total_size = 0;
        state.transfer.downloaded_size = 0;
        if let Some(token) = state.run.take() {
            token.cancel();
        }
        debug!("Download canceled");
        Ok(())
    }
}

impl Inner {
    async fn drive(self: Arc<Self>, token: CancellationToken, fresh: bool) -> Result<DownloadOutcome> {
        let _io = self.io_lock.lock().await;
        let result = self.run(&token, fresh).await;
        self.finish(&token, result)
    }

    #[instrument(skip(self, token), level = "debug")]
    async fn run(&self, token: &CancellationToken, fresh: bool) -> Result<()> {
        if token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        let path = self.state.lock().transfer.file_path.clone();
        if fresh {
            prepare_fresh_file(&path).await?;
        }

        let policy = self.options.retry_policy();
        loop {
            if token.is_cancelled() {
                return Err(TransferError::Cancelled);
            }
            let err = match self.fetch(token, &path).await {
                Ok(()) => return Ok(()),
                Err(e) if e.is_cancelled() || !e.is_retryable() => return Err(e),
                Err(e) => e,
            };

            let retry = {
                let mut state = self.state.lock();
                if token.is_cancelled() {
                    return Err(TransferError::Cancelled);
                }
                if state.transfer.retry_count >= self.options.max_retries {
                    None
                } else {
                    state.transfer.retry_count += 1;
                    Some(state.transfer.retry_count)
                }
            };
            let Some(retry) = retry else {
                return Err(err);
            };

            let delay = policy.delay_for_attempt(retry - 1);
            warn!(
                retry,
                max_retries = self.options.max_retries,
                delay_ms = delay.as_millis() as u64,
                error = %err,
                "Download request failed, retrying from current offset"
            );
            tokio::select! {
                biased;
                _ = token.cancelled() => return Err(TransferError::Cancelled),
                _ = tokio::time::sleep(delay) => {}
            }
        }
    }

    /// One ranged request, streamed to the end of the file.
    async fn fetch(&self, token: &CancellationToken, path: &Path) -> Result<()> {
        let mut offset = self.reconcile(token, path).await?;
        let url = self.state.lock().transfer.url.clone();

        let mut request = self
            .client
            .get(&url)
            .headers(self.options.headers.clone())
            .header(RANGE, format!("bytes={offset}-"));
        if !self.options.params.is_empty() {
            request = request.query(&self.options.params);
        }
        debug!(url = %url, offset, "Sending range request");

        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return Err(TransferError::Cancelled),
            sent = timeout(self.options.stall_timeout, request.send()) => match sent {
                Ok(response) => response?,
                Err(_) => return Err(self.stalled()),
            },
        };

        let status = response.status();
        if status == StatusCode::RANGE_NOT_SATISFIABLE {
            let total = self.state.lock().transfer.total_size;
            if offset > 0 && total > 0 && offset >= total {
                debug!(offset, total, "Nothing left to fetch");
                return Ok(());
            }
        }
        if !status.is_success() {
            return Err(TransferError::http_status(status, &url, "range request"));
        }

        let headers = response.headers();
        let content_length = headers
            .get(CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        let content_range = headers
            .get(CONTENT_RANGE)
            .and_then(|v| v.to_str().ok())
            .and_then(parse_content_range);

        let partial = status == StatusCode::PARTIAL_CONTENT;
        if !partial && offset > 0 {
            warn!(offset, "Server ignored the range, restarting from zero");
            truncate(path, 0).await?;
            self.update_live(token, |transfer| transfer.downloaded_size = 0)?;
            offset = 0;
        }

        let total = content_range.or(match (partial, content_length) {
            (true, Some(len)) => Some(offset + len),
            (false, Some(len)) => Some(len),
            (_, None) => None,
        });
        if let Some(total) = total {
            self.update_live(token, |transfer| transfer.total_size = total)?;
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path).await?;
        let mut stream = response.bytes_stream();
        loop {
            let next = tokio::select! {
                biased;
                _ = token.cancelled() => {
                    file.flush().await?;
                    return Err(TransferError::Cancelled);
                }
                next = timeout(self.options.stall_timeout, stream.next()) => next,
            };
            let chunk = match next {
                Err(_) => {
                    file.flush().await?;
                    return Err(self.stalled());
                }
                Ok(None) => break,
                Ok(Some(chunk)) => chunk?,
            };

            file.write_all(&chunk).await?;

            let event = {
                let mut state = self.state.lock();
                // A pause or cancel that landed during the write keeps these
                // bytes out of the count; the next run truncates them.
                if token.is_cancelled() {
                    None
                } else {
                    let transfer = &mut state.transfer;
                    transfer.downloaded_size += chunk.len() as u64;
                    if transfer.total_size > 0 && transfer.downloaded_size > transfer.total_size {
                        transfer.total_size = transfer.downloaded_size;
                    }
                    Some(DownloadEvent::Progress {
                        loaded: transfer.downloaded_size,
                        total: transfer.total_size,
                        progress: transfer.progress(),
                    })
                }
            };
            match event {
                Some(event) => {
                    let _ = self.events.send(event);
                }
                None => {
                    file.flush().await?;
                    return Err(TransferError::Cancelled);
                }
            }
        }
        file.flush().await?;

        let (downloaded, total) = {
            let state = self.state.lock();
            (state.transfer.downloaded_size, state.transfer.total_size)
        };
        if total > 0 && downloaded < total {
            return Err(TransferError::protocol(
                "range request",
                format!("body ended at {downloaded} of {total} bytes"),
            ));
        }
        Ok(())
    }

    /// Align the recorded offset with the file before a request.
    async fn reconcile(&self, token: &CancellationToken, path: &Path) -> Result<u64> {
        let on_disk = match tokio::fs::metadata(path).await {
            Ok(metadata) => metadata.len(),
            Err(e) if e.kind() == ErrorKind::NotFound => 0,
            Err(e) => return Err(e.into()),
        };
        let recorded = self.state.lock().transfer.downloaded_size;
        if on_disk > recorded {
            debug!(on_disk, recorded, "Dropping unaccounted bytes");
            truncate(path, recorded).await?;
            Ok(recorded)
        } else if on_disk < recorded {
            warn!(on_disk, recorded, "File is shorter than recorded, resuming from its end");
            self.update_live(token, |transfer| transfer.downloaded_size = on_disk)?;
            Ok(on_disk)
        } else {
            Ok(recorded)
        }
    }

    /// Apply `update` unless the run was paused or cancelled meanwhile.
    ///
    /// The check shares the state lock with `pause`/`cancel`, so a reset they
    /// made is never overwritten by a stale run.
    fn update_live(&self, token: &CancellationToken, update: impl FnOnce(&mut RangeTransfer)) -> Result<()> {
        let mut state = self.state.lock();
        if token.is_cancelled() {
            return Err(TransferError::Cancelled);
        }
        update(&mut state.transfer);
        Ok(())
    }

    fn stalled(&self) -> TransferError {
        TransferError::StallTimeout {
            idle: self.options.stall_timeout,
            retries: self.state.lock().transfer.retry_count,
        }
    }

    fn finish(&self, token: &CancellationToken, result: Result<()>) -> Result<DownloadOutcome> {
        let mut state = self.state.lock();
        if token.is_cancelled() || matches!(result, Err(TransferError::Cancelled)) {
            return Ok(match state.transfer.status {
                DownloadStatus::Canceled => DownloadOutcome::Canceled,
                _ => DownloadOutcome::Paused,
            });
        }
        // Pause and cancel take the token out before cancelling it, so an
        // uncancelled run is still the current one.
        state.run = None;

        match result {
            Ok(()) => {
                let transfer = &mut state.transfer;
                if transfer.total_size == 0 {
                    transfer.total_size = transfer.downloaded_size;
                }
                transfer.status = DownloadStatus::Completed;
                let snapshot = transfer.clone();
                info!(
                    url = %snapshot.url,
                    bytes = snapshot.downloaded_size,
                    retries = snapshot.retry_count,
                    "Download completed"
                );
                let _ = self.events.send(DownloadEvent::Completed(snapshot));
                Ok(DownloadOutcome::Completed)
            }
            Err(e) => {
                state.transfer.status = DownloadStatus::Error;
                error!(url = %state.transfer.url, error = %e, "Download failed");
                let _ = self.events.send(DownloadEvent::Error {
                    message: e.to_string(),
                });
                Err(e)
            }
        }
    }
}

async fn prepare_fresh_file(path: &Path) -> Result<()> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        tokio::fs::create_dir_all(parent).await?;
    }
    match tokio::fs::remove_file(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e.into()),
    }
}

async fn truncate(path: &Path, len: u64) -> Result<()> {
    let file = OpenOptions::new().write(true).open(path).await?;
    file.set_len(len).await?;
    Ok(())
}
