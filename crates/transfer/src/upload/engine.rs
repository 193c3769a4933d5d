//! Chunked multipart upload.
//!
//! A session moves through negotiation, multipart init, concurrent part
//! uploads and a final merge. Parts are uploaded by a bounded pool of tokio
//! tasks; the first part that runs out of retries cancels every other worker
//! and fails the session.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use reqwest::Client;
use serde::Serialize;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::{Semaphore, mpsc};
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use super::api::{HttpUposApi, InitQuery, MergePart, MergeQuery, PartQuery, UploadTarget, UposApi};
use super::chunk::{ByteRange, ChunkStatus, ChunkTask};
use super::events::UploadEvent;
use super::negotiate::{NegotiateRequest, Negotiator, SessionDescriptor};
use super::session::{SessionStatus, TransferSession};
use crate::config::UploadOptions;
use crate::error::{Result, TransferError};
use crate::retry::{RetryAction, RetryPolicy, retry_with_backoff};

const DEFAULT_CONCURRENCY: usize = 3;
const DEFAULT_MAX_RETRIES: u32 = 3;
const DEFAULT_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What a finished upload is known by.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadResult {
    /// Negotiated content id (`biz_id`).
    pub content_id: u64,
    /// Storage object name without extension.
    pub filename: String,
    pub title: String,
}

type EventSender = mpsc::UnboundedSender<UploadEvent>;

fn emit(events: &Option<EventSender>, event: UploadEvent) {
    if let Some(tx) = events {
        let _ = tx.send(event);
    }
}

/// Everything a part worker needs, shared by all workers of one run.
struct PartContext {
    api: Arc<dyn UposApi>,
    target: UploadTarget,
    file_path: PathBuf,
    upload_id: String,
    chunks: u32,
    total: u64,
    policy: RetryPolicy,
    token: CancellationToken,
    events: Option<EventSender>,
}

pub struct UploadEngine {
    api: Arc<dyn UposApi>,
    options: UploadOptions,
    token: CancellationToken,
    events: Option<EventSender>,
}

impl UploadEngine {
    pub fn new(api: Arc<dyn UposApi>, options: UploadOptions) -> Self {
        Self {
            api,
            options,
            token: CancellationToken::new(),
            events: None,
        }
    }

    /// Engine talking HTTP through `client`, authenticated with `credential`.
    pub fn with_client(client: Client, options: UploadOptions, credential: Option<String>) -> Self {
        let mut api = HttpUposApi::new(client, options.preupload_url.clone());
        if let Some(credential) = credential {
            api = api.with_credential(credential);
        }
        Self::new(Arc::new(api), options)
    }

    pub fn with_events(mut self, events: EventSender) -> Self {
        self.events = Some(events);
        self
    }

    /// Tie the engine to an external token; cancelling it aborts the upload.
    pub fn with_cancellation_token(mut self, token: CancellationToken) -> Self {
        self.token = token;
        self
    }

    pub fn options(&self) -> &UploadOptions {
        &self.options
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.token.clone()
    }

    /// Abort whatever the engine is doing. In-flight parts are dropped.
    pub fn cancel(&self) {
        self.token.cancel();
    }

    /// Upload `path` end to end and publish it under `title`.
    pub async fn upload(&self, path: impl AsRef<Path>, title: impl Into<String>) -> Result<UploadResult> {
        let path = path.as_ref();
        let request = NegotiateRequest::for_file(path).await?;
        let mut session = TransferSession::new(path, request.name.clone(), request.size);
        self.run(&mut session, &request, title.into()).await
    }

    /// Drive a fresh session through the whole lifecycle.
    ///
    /// Any error leaves the session `Failed`.
    #[instrument(skip(self, session), fields(file = %session.file_name, size = session.total_size))]
    pub async fn run(
        &self,
        session: &mut TransferSession,
        request: &NegotiateRequest,
        title: String,
    ) -> Result<UploadResult> {
        let result = async {
            self.set_status(session, SessionStatus::Negotiating)?;
            let descriptor = self.negotiate(request).await?;
            session.apply_descriptor(descriptor);
            self.init(session).await?;
            let concurrency = self.concurrency_for(session);
            self.upload_chunks(session, concurrency).await?;
            self.finalize(session, title).await
        }
        .await;

        if let Err(e) = &result {
            self.mark_failed(session);
            if e.is_cancelled() {
                info!("Upload cancelled");
            } else {
                error!(error = %e, "Upload failed");
            }
        }
        result
    }

    /// Ask the backend for a session descriptor.
    pub async fn negotiate(&self, request: &NegotiateRequest) -> Result<SessionDescriptor> {
        let negotiator = Negotiator::new(self.api.clone(), self.options.profile.clone());
        self.guard(negotiator.negotiate(request)).await
    }

    /// Create the multipart upload and record its id on the session.
    #[instrument(skip(self, session), fields(biz_id = session.biz_id), level = "debug")]
    pub async fn init(&self, session: &mut TransferSession) -> Result<String> {
        self.set_status(session, SessionStatus::Initializing)?;
        let result = self.init_multipart(session).await;
        match result {
            Ok(upload_id) => {
                session.upload_id = Some(upload_id.clone());
                Ok(upload_id)
            }
            Err(e) => {
                self.mark_failed(session);
                Err(e)
            }
        }
    }

    async fn init_multipart(&self, session: &TransferSession) -> Result<String> {
        if session.chunk_size == 0 {
            return Err(TransferError::configuration("chunk size must be positive"));
        }
        let query = InitQuery {
            uploads: "",
            output: "json",
            profile: self.options.profile.clone(),
            filesize: session.total_size,
            partsize: session.chunk_size,
            biz_id: session.biz_id,
        };
        let response = self
            .guard(self.api.init_multipart(&Self::target(session), &query))
            .await?;
        if response.ok != Some(1) {
            return Err(TransferError::protocol(
                "multipart init",
                format!("answered OK={:?}", response.ok),
            ));
        }
        let upload_id = response
            .upload_id
            .filter(|id| !id.is_empty())
            .ok_or_else(|| TransferError::protocol("multipart init", "response is missing `upload_id`"))?;
        debug!(upload_id = %upload_id, bucket = ?response.bucket, "Multipart upload created");
        Ok(upload_id)
    }

    /// Upload every unfinished part with at most `concurrency` in flight.
    ///
    /// Splits the file first if the session has no parts yet. The first part
    /// that exhausts its retries cancels the rest and fails the session.
    #[instrument(skip(self, session), fields(file = %session.file_name), level = "debug")]
    pub async fn upload_chunks(&self, session: &mut TransferSession, concurrency: usize) -> Result<()> {
        self.set_status(session, SessionStatus::Uploading)?;
        let result = self.upload_chunks_inner(session, concurrency.max(1)).await;
        if result.is_err() {
            session.chunks.reset_in_flight();
            self.mark_failed(session);
        }
        result
    }

    async fn upload_chunks_inner(&self, session: &mut TransferSession, concurrency: usize) -> Result<()> {
        let upload_id = session
            .upload_id
            .clone()
            .ok_or_else(|| TransferError::invalid_state("upload parts", "no multipart upload exists"))?;
        if session.chunks.is_empty() {
            session.split()?;
        }

        let (max_retries, retry_delay) = self.retry_for(session);
        let run_token = self.token.child_token();
        let ctx = Arc::new(PartContext {
            api: self.api.clone(),
            target: Self::target(session),
            file_path: session.file_path.clone(),
            upload_id,
            chunks: session.chunk_count(),
            total: session.total_size,
            policy: RetryPolicy::fixed(max_retries, retry_delay),
            token: run_token.clone(),
            events: self.events.clone(),
        });

        let semaphore = Arc::new(Semaphore::new(concurrency));
        let mut workers = JoinSet::new();
        let pending = session.chunks.dispatch_pending();
        info!(
            parts = pending.len(),
            total_parts = ctx.chunks,
            concurrency,
            max_retries,
            "Uploading parts"
        );
        for task in pending {
            workers.spawn(upload_part(ctx.clone(), semaphore.clone(), task));
        }

        let mut uploaded = session.chunks.completed_bytes();
        let mut failure = None;
        while let Some(joined) = workers.join_next().await {
            let (mut task, result) = match joined {
                Ok(out) => out,
                Err(e) if e.is_cancelled() => continue,
                Err(e) => {
                    failure = Some(TransferError::internal(format!("part worker panicked: {e}")));
                    break;
                }
            };
            match result {
                Ok(()) => {
                    task.status = ChunkStatus::Completed;
                    uploaded += task.range.len();
                    emit(
                        &self.events,
                        UploadEvent::ChunkCompleted {
                            part_number: task.part_number,
                            uploaded,
                            total: session.total_size,
                        },
                    );
                    debug!(part = task.part_number, uploaded, total = session.total_size, "Part completed");
                    session.chunks.store(task);
                }
                Err(TransferError::Cancelled) => {
                    // Stopped by a failing sibling or by the caller.
                    task.status = ChunkStatus::Pending;
                    session.chunks.store(task);
                    if self.token.is_cancelled() {
                        failure = Some(TransferError::Cancelled);
                        break;
                    }
                }
                Err(e) => {
                    task.status = ChunkStatus::Failed;
                    session.chunks.store(task);
                    failure = Some(e);
                    break;
                }
            }
        }

        if let Some(e) = failure {
            run_token.cancel();
            workers.abort_all();
            return Err(e);
        }
        if !session.chunks.all_completed() {
            return Err(TransferError::internal("part workers ended with unfinished parts"));
        }
        Ok(())
    }

    /// Merge all parts into the final object.
    ///
    /// Requires every part to be completed. A merge the backend does not
    /// accept is retried as a whole with a fixed delay.
    #[instrument(skip(self, session, title), fields(biz_id = session.biz_id), level = "debug")]
    pub async fn finalize(&self, session: &mut TransferSession, title: impl Into<String>) -> Result<UploadResult> {
        if !session.chunks.all_completed() {
            return Err(TransferError::invalid_state(
                "merge",
                "some parts are not uploaded yet",
            ));
        }
        let upload_id = session
            .upload_id
            .clone()
            .ok_or_else(|| TransferError::invalid_state("merge", "no multipart upload exists"))?;
        self.set_status(session, SessionStatus::Merging)?;

        match self.merge(session, upload_id).await {
            Ok(key) => {
                let filename = object_stem(key.as_deref().unwrap_or(&session.endpoint_url));
                self.set_status(session, SessionStatus::Completed)?;
                let result = UploadResult {
                    content_id: session.biz_id,
                    filename,
                    title: title.into(),
                };
                info!(content_id = result.content_id, filename = %result.filename, "Upload completed");
                Ok(result)
            }
            Err(e) => {
                self.mark_failed(session);
                Err(e)
            }
        }
    }

    async fn merge(&self, session: &TransferSession, upload_id: String) -> Result<Option<String>> {
        let query = MergeQuery {
            name: session.file_name.clone(),
            upload_id,
            biz_id: session.biz_id,
            output: "json",
            profile: self.options.profile.clone(),
        };
        let parts: Vec<MergePart> = session
            .chunks
            .iter()
            .map(|task| MergePart {
                part_number: task.part_number,
                etag: "etag".to_string(),
            })
            .collect();
        let target = Self::target(session);
        let merge_retry = &self.options.merge_retry;
        let policy = RetryPolicy::fixed(merge_retry.max_attempts.saturating_sub(1), merge_retry.delay);

        let outcome = retry_with_backoff(&policy, &self.token, |attempt| {
            let api = self.api.clone();
            let target = &target;
            let query = &query;
            let parts = &parts;
            let policy = &policy;
            async move {
                let reason = match api.merge(target, query, parts).await {
                    Ok(response) if response.is_ok() => return RetryAction::Success(response.key),
                    Ok(response) => format!("merge answered OK={:?}", response.ok),
                    Err(e) => e.to_string(),
                };
                if attempt < policy.max_retries {
                    emit(
                        &self.events,
                        UploadEvent::MergeRetry {
                            attempt: attempt + 1,
                            delay: policy.delay_for_attempt(attempt),
                            reason: reason.clone(),
                        },
                    );
                }
                RetryAction::Retry(TransferError::protocol("merge", reason))
            }
        })
        .await;

        outcome.map_err(|exhausted| {
            if exhausted.error.is_cancelled() {
                TransferError::Cancelled
            } else {
                TransferError::Merge {
                    attempts: exhausted.attempts,
                    reason: exhausted.error.to_string(),
                }
            }
        })
    }

    fn target(session: &TransferSession) -> UploadTarget {
        UploadTarget {
            url: session.endpoint_url.clone(),
            auth: session.auth_token.clone(),
            timeout: session.descriptor().and_then(|d| d.timeout),
        }
    }

    fn concurrency_for(&self, session: &TransferSession) -> usize {
        self.options
            .concurrency
            .or_else(|| session.descriptor().map(|d| d.threads))
            .unwrap_or(DEFAULT_CONCURRENCY)
    }

    fn retry_for(&self, session: &TransferSession) -> (u32, Duration) {
        let descriptor = session.descriptor();
        let max_retries = self
            .options
            .max_retries
            .or_else(|| descriptor.map(|d| d.chunk_retry))
            .unwrap_or(DEFAULT_MAX_RETRIES);
        let delay = self
            .options
            .retry_delay
            .or_else(|| descriptor.map(|d| d.chunk_retry_delay))
            .unwrap_or(DEFAULT_RETRY_DELAY);
        (max_retries, delay)
    }

    fn set_status(&self, session: &mut TransferSession, next: SessionStatus) -> Result<()> {
        let from = session.status;
        session.transition(next)?;
        emit(&self.events, UploadEvent::StatusChanged { from, to: next });
        Ok(())
    }

    fn mark_failed(&self, session: &mut TransferSession) {
        if !session.status.is_terminal() {
            let from = session.status;
            session.fail();
            emit(
                &self.events,
                UploadEvent::StatusChanged {
                    from,
                    to: SessionStatus::Failed,
                },
            );
        }
    }

    async fn guard<T>(&self, fut: impl Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(TransferError::Cancelled),
            result = fut => result,
        }
    }
}

/// File stem of a storage key or URL (`/n2301abc.mp4` -> `n2301abc`).
fn object_stem(key: &str) -> String {
    let name = key.rsplit('/').next().unwrap_or(key);
    Path::new(name)
        .file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| name.to_string())
}

async fn read_range(path: &Path, range: ByteRange) -> Result<Bytes> {
    let mut file = tokio::fs::File::open(path).await?;
    file.seek(SeekFrom::Start(range.start)).await?;
    let mut buf = vec![0u8; range.len() as usize];
    file.read_exact(&mut buf).await?;
    Ok(Bytes::from(buf))
}

/// Worker body: wait for a slot, read the part, PUT it with retries.
///
/// Hands the task back with its final retry count.
async fn upload_part(
    ctx: Arc<PartContext>,
    semaphore: Arc<Semaphore>,
    mut task: ChunkTask,
) -> (ChunkTask, Result<()>) {
    let _permit = tokio::select! {
        biased;
        _ = ctx.token.cancelled() => return (task, Err(TransferError::Cancelled)),
        permit = semaphore.acquire_owned() => match permit {
            Ok(permit) => permit,
            Err(_) => return (task, Err(TransferError::internal("part semaphore closed"))),
        },
    };

    let body = match read_range(&ctx.file_path, task.range).await {
        Ok(body) => body,
        Err(e) => {
            ctx.token.cancel();
            return (task, Err(e));
        }
    };
    let query = PartQuery {
        upload_id: ctx.upload_id.clone(),
        part_number: task.part_number,
        chunk: task.index(),
        chunks: ctx.chunks,
        size: task.range.len(),
        start: task.range.start,
        end: task.range.end,
        total: ctx.total,
    };

    let part_number = task.part_number;
    let mut last_attempt = 0;
    let outcome = retry_with_backoff(&ctx.policy, &ctx.token, |attempt| {
        last_attempt = attempt;
        let ctx = &ctx;
        let query = &query;
        let body = body.clone();
        async move {
            let result = ctx.api.upload_part(&ctx.target, query, body).await;
            if let Err(e) = &result
                && e.is_retryable()
                && attempt < ctx.policy.max_retries
            {
                emit(
                    &ctx.events,
                    UploadEvent::ChunkRetry {
                        part_number,
                        attempt: attempt + 1,
                        delay: ctx.policy.delay_for_attempt(attempt),
                        reason: e.to_string(),
                    },
                );
            }
            RetryAction::from_result(result)
        }
    })
    .await;
    task.retry_count = last_attempt;

    let result = outcome.map_err(|exhausted| {
        if exhausted.error.is_cancelled() {
            return TransferError::Cancelled;
        }
        warn!(part = part_number, attempts = exhausted.attempts, error = %exhausted.error, "Part failed");
        // Cancel while the permit is still held so no queued part starts.
        ctx.token.cancel();
        TransferError::ChunkUpload {
            part_number,
            attempts: exhausted.attempts,
            reason: exhausted.error.to_string(),
        }
    });
    (task, result)
}
