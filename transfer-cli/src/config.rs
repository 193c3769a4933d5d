use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::debug;
use transfer_engine::{ClientConfig, DownloadOptions, MergeRetryPolicy, ProxyConfig, UploadOptions};

use crate::error::{AppError, Result};

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub http: HttpSection,
    pub upload: UploadSection,
    pub download: DownloadSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct HttpSection {
    pub connect_timeout_secs: u64,
    pub user_agent: Option<String>,
    pub proxy: Option<String>,
    pub use_system_proxy: bool,
}

impl Default for HttpSection {
    fn default() -> Self {
        Self {
            connect_timeout_secs: 30,
            user_agent: None,
            proxy: None,
            use_system_proxy: true,
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct UploadSection {
    pub preupload_url: Option<String>,
    pub profile: Option<String>,
    pub cookie: Option<String>,
    pub concurrency: Option<usize>,
    pub max_retries: Option<u32>,
    pub retry_delay_ms: Option<u64>,
    pub merge_attempts: Option<u32>,
    pub merge_delay_secs: Option<u64>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DownloadSection {
    pub max_retries: u32,
    pub stall_timeout_secs: u64,
    pub retry_delay_ms: u64,
}

impl Default for DownloadSection {
    fn default() -> Self {
        let options = DownloadOptions::default();
        Self {
            max_retries: options.max_retries,
            stall_timeout_secs: options.stall_timeout.as_secs(),
            retry_delay_ms: options.retry_delay.as_millis() as u64,
        }
    }
}

impl AppConfig {
    pub fn default_path() -> Option<PathBuf> {
        dirs::config_dir().map(|dir| dir.join("transfer").join("config.toml"))
    }

    /// Load `path`, or the default location if it exists, or defaults.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let path = match path {
            Some(path) => path.to_path_buf(),
            None => match Self::default_path() {
                Some(path) if path.exists() => path,
                _ => return Ok(Self::default()),
            },
        };
        let content = std::fs::read_to_string(&path)
            .map_err(|e| AppError::Config(format!("cannot read {}: {e}", path.display())))?;
        let config: AppConfig = toml::from_str(&content)?;
        debug!(path = %path.display(), "Loaded configuration");
        Ok(config)
    }

    pub fn client_config(&self, proxy: Option<ProxyConfig>) -> ClientConfig {
        let mut config = ClientConfig {
            connect_timeout: Duration::from_secs(self.http.connect_timeout_secs),
            use_system_proxy: self.http.use_system_proxy,
            ..ClientConfig::default()
        };
        if let Some(user_agent) = &self.http.user_agent {
            config.user_agent = user_agent.clone();
        }
        let proxy = proxy.or_else(|| self.http.proxy.as_deref().map(ProxyConfig::from_url));
        if let Some(proxy) = proxy {
            config = config.with_proxy(proxy);
        }
        config
    }

    pub fn upload_options(&self) -> UploadOptions {
        let section = &self.upload;
        let mut options = UploadOptions::default();
        if let Some(url) = &section.preupload_url {
            options.preupload_url = url.clone();
        }
        if let Some(profile) = &section.profile {
            options.profile = profile.clone();
        }
        options.concurrency = section.concurrency;
        options.max_retries = section.max_retries;
        options.retry_delay = section.retry_delay_ms.map(Duration::from_millis);

        let defaults = MergeRetryPolicy::default();
        options.with_merge_retry(MergeRetryPolicy {
            max_attempts: section.merge_attempts.unwrap_or(defaults.max_attempts),
            delay: section
                .merge_delay_secs
                .map(Duration::from_secs)
                .unwrap_or(defaults.delay),
        })
    }

    pub fn download_options(&self) -> DownloadOptions {
        DownloadOptions::default()
            .with_max_retries(self.download.max_retries)
            .with_stall_timeout(Duration::from_secs(self.download.stall_timeout_secs))
            .with_retry_delay(Duration::from_millis(self.download.retry_delay_ms))
    }
}
