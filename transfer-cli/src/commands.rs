use std::path::{Path, PathBuf};
use std::time::Duration;

use indicatif::{ProgressBar, ProgressStyle};
use reqwest::header::{HeaderMap, HeaderName, HeaderValue};
use tokio::sync::{broadcast, mpsc};
use tracing::{debug, info, warn};
use transfer_engine::{
    DownloadEvent, DownloadOutcome, ProxyConfig, ProxyType, RangeDownloader, TransferError, UploadEngine,
    UploadEvent, create_client,
};

use crate::config::AppConfig;
use crate::error::{AppError, Result};

pub struct UploadArgs {
    pub file: PathBuf,
    pub title: Option<String>,
    pub cookie: Option<String>,
    pub concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub preupload_url: Option<String>,
}

pub struct DownloadArgs {
    pub url: String,
    pub output: PathBuf,
    pub headers: Vec<String>,
    pub params: Vec<String>,
    pub max_retries: Option<u32>,
    pub stall_timeout: Option<u64>,
}

pub struct CommandExecutor {
    config: AppConfig,
    proxy: Option<ProxyConfig>,
}

impl CommandExecutor {
    pub fn new(config: AppConfig) -> Self {
        Self { config, proxy: None }
    }

    pub fn new_with_proxy(
        config: AppConfig,
        proxy_url: String,
        proxy_type: Option<ProxyType>,
        username: Option<String>,
        password: Option<String>,
    ) -> Self {
        let mut proxy = ProxyConfig::from_url(proxy_url);
        if let Some(proxy_type) = proxy_type {
            proxy.proxy_type = proxy_type;
        }
        if let Some(username) = username {
            proxy = proxy.with_auth(username, password.unwrap_or_default());
        }
        Self {
            config,
            proxy: Some(proxy),
        }
    }

    pub async fn upload(&self, args: UploadArgs) -> Result<()> {
        let client = create_client(&self.config.client_config(self.proxy.clone()))?;

        let mut options = self.config.upload_options();
        if let Some(url) = args.preupload_url {
            options.preupload_url = url;
        }
        if let Some(concurrency) = args.concurrency {
            options = options.with_concurrency(concurrency);
        }
        if let Some(max_retries) = args.max_retries {
            options = options.with_max_retries(max_retries);
        }

        let title = match args.title {
            Some(title) => title,
            None => default_title(&args.file)?,
        };
        let cookie = args.cookie.or_else(|| self.config.upload.cookie.clone());
        if cookie.is_none() {
            warn!("No credential given, negotiation will likely be rejected");
        }

        let (tx, rx) = mpsc::unbounded_channel();
        let engine = UploadEngine::with_client(client, options, cookie).with_events(tx);

        let token = engine.cancellation_token();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                info!("Interrupted, cancelling upload");
                token.cancel();
            }
        });

        let bar = byte_bar(tokio::fs::metadata(&args.file).await?.len());
        let progress = tokio::spawn(track_upload(rx, bar.clone()));

        let result = engine.upload(&args.file, title).await;
        // Dropping the engine closes the event channel.
        drop(engine);
        let _ = progress.await;
        bar.finish_and_clear();

        let result = result?;
        println!("{}", serde_json::to_string_pretty(&result)?);
        Ok(())
    }

    pub async fn download(&self, args: DownloadArgs) -> Result<()> {
        let client_config = self.config.client_config(self.proxy.clone());

        let mut options = self.config.download_options();
        options.headers = parse_headers(&args.headers)?;
        options.params = parse_params(&args.params)?;
        if let Some(max_retries) = args.max_retries {
            options = options.with_max_retries(max_retries);
        }
        if let Some(secs) = args.stall_timeout {
            options = options.with_stall_timeout(Duration::from_secs(secs));
        }

        let downloader = RangeDownloader::new(&args.url, &args.output, options, &client_config)?;
        let events = downloader.subscribe();
        let bar = byte_bar(0);
        let progress = tokio::spawn(track_download(events, bar.clone()));

        let handle = downloader.start()?;
        let interrupt = {
            let downloader = downloader.clone();
            tokio::spawn(async move {
                if tokio::signal::ctrl_c().await.is_ok() {
                    info!("Interrupted, cancelling download");
                    let _ = downloader.cancel();
                }
            })
        };

        let outcome = handle.wait().await;
        interrupt.abort();
        progress.abort();
        bar.finish_and_clear();

        match outcome? {
            DownloadOutcome::Completed => {
                println!("{}", serde_json::to_string_pretty(&downloader.snapshot())?);
                Ok(())
            }
            DownloadOutcome::Paused | DownloadOutcome::Canceled => Err(TransferError::Cancelled.into()),
        }
    }
}

fn byte_bar(total: u64) -> ProgressBar {
    let bar = ProgressBar::new(total);
    if let Ok(style) = ProgressStyle::with_template(
        "{spinner:.blue} [{bar:30.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta}) {msg}",
    ) {
        bar.set_style(style.progress_chars("=> "));
    }
    bar
}

async fn track_upload(mut rx: mpsc::UnboundedReceiver<UploadEvent>, bar: ProgressBar) {
    while let Some(event) = rx.recv().await {
        match event {
            UploadEvent::StatusChanged { to, .. } => bar.set_message(to.to_string()),
            UploadEvent::ChunkCompleted { uploaded, total, .. } => {
                bar.set_length(total);
                bar.set_position(uploaded);
            }
            UploadEvent::ChunkRetry {
                part_number,
                attempt,
                reason,
                ..
            } => {
                debug!(part_number, attempt, %reason, "Part retry");
                bar.set_message(format!("retrying part {part_number}"));
            }
            UploadEvent::MergeRetry { attempt, delay, .. } => {
                bar.set_message(format!("merge attempt {} in {}s", attempt + 1, delay.as_secs()));
            }
        }
    }
}

async fn track_download(mut rx: broadcast::Receiver<DownloadEvent>, bar: ProgressBar) {
    loop {
        match rx.recv().await {
            Ok(DownloadEvent::Progress { loaded, total, .. }) => {
                if total > 0 {
                    bar.set_length(total);
                }
                bar.set_position(loaded);
            }
            Ok(DownloadEvent::Completed(_)) | Ok(DownloadEvent::Error { .. }) => break,
            Err(broadcast::error::RecvError::Lagged(_)) => continue,
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

fn default_title(file: &Path) -> Result<String> {
    file.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .ok_or_else(|| AppError::InvalidInput(format!("{} has no file name", file.display())))
}

/// Parse `Name: value` header arguments.
pub fn parse_headers(headers: &[String]) -> Result<HeaderMap> {
    let mut map = HeaderMap::new();
    for header in headers {
        let (name, value) = header
            .split_once(':')
            .ok_or_else(|| AppError::InvalidInput(format!("Invalid header format: {header}")))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|e| AppError::InvalidInput(format!("Invalid header name in {header}: {e}")))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|e| AppError::InvalidInput(format!("Invalid header value in {header}: {e}")))?;
        map.append(name, value);
    }
    Ok(map)
}

/// Parse `key=value` query parameter arguments.
pub fn parse_params(params: &[String]) -> Result<Vec<(String, String)>> {
    params
        .iter()
        .map(|param| {
            param
                .split_once('=')
                .map(|(key, value)| (key.to_string(), value.to_string()))
                .ok_or_else(|| AppError::InvalidInput(format!("Invalid param format: {param}")))
        })
        .collect()
}
