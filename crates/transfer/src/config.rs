use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue};

use crate::proxy::ProxyConfig;
use crate::retry::RetryPolicy;

pub const DEFAULT_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/142.0.0.0 Safari/537.36";

/// Default preupload (negotiation) endpoint.
pub const DEFAULT_PREUPLOAD_URL: &str = "https://member.bilibili.com/preupload";

/// Storage profile sent with every upload request.
pub const DEFAULT_UPLOAD_PROFILE: &str = "ugcupos/bup";

/// HTTP client options shared by both engines.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Overall timeout for a single HTTP request (zero disables it).
    ///
    /// Leave this at zero for downloads: a large body can legitimately take
    /// longer than any fixed budget, stalls are detected separately.
    pub timeout: Duration,

    /// Connection timeout (time to establish initial connection)
    pub connect_timeout: Duration,

    /// Whether to follow redirects
    pub follow_redirects: bool,

    /// User agent string
    pub user_agent: String,

    /// Custom HTTP headers for requests
    pub headers: HeaderMap,

    /// Proxy configuration (optional)
    pub proxy: Option<ProxyConfig>,

    /// Whether to use system proxy settings if available
    pub use_system_proxy: bool,

    pub danger_accept_invalid_certs: bool,

    /// Maximum idle connections to keep per host.
    /// Parallel part uploads reuse these.
    pub pool_max_idle_per_host: usize,

    /// Duration to keep idle connections alive before closing
    pub pool_idle_timeout: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::ZERO,
            connect_timeout: Duration::from_secs(30),
            follow_redirects: true,
            user_agent: DEFAULT_USER_AGENT.to_owned(),
            headers: ClientConfig::get_default_headers(),
            proxy: None,
            use_system_proxy: true,
            danger_accept_invalid_certs: false,
            pool_max_idle_per_host: 10,
            pool_idle_timeout: Duration::from_secs(30),
        }
    }
}

impl ClientConfig {
    /// Merge custom headers over the defaults; custom values win.
    pub fn with_headers(mut self, custom: &HeaderMap) -> Self {
        for (name, value) in custom.iter() {
            self.headers.insert(name.clone(), value.clone());
        }
        self
    }

    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = Some(proxy);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn get_default_headers() -> HeaderMap {
        let mut default_headers = HeaderMap::new();

        default_headers.insert(
            reqwest::header::CONNECTION,
            HeaderValue::from_static("keep-alive"),
        );

        default_headers.insert(reqwest::header::ACCEPT, HeaderValue::from_static("*/*"));

        default_headers.insert(
            reqwest::header::ACCEPT_LANGUAGE,
            HeaderValue::from_static("en-US,en;q=0.5,zh-CN;q=0.3,zh;q=0.2"),
        );
        default_headers
    }
}

/// Merge call retry policy.
///
/// Independent from the per-part policy: the merge is retried as a whole
/// with a fixed pause between attempts.
#[derive(Debug, Clone)]
pub struct MergeRetryPolicy {
    /// Total number of merge calls, including the first one.
    pub max_attempts: u32,
    /// Fixed delay between two merge calls.
    pub delay: Duration,
}

impl Default for MergeRetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 5,
            delay: Duration::from_secs(10),
        }
    }
}

/// Caller-side knobs for the upload engine.
///
/// `None` fields fall back to what the negotiated descriptor suggests.
#[derive(Debug, Clone)]
pub struct UploadOptions {
    /// Preupload endpoint used by the negotiator.
    pub preupload_url: String,
    /// Storage profile (`profile` query parameter).
    pub profile: String,
    /// Parallel part uploads.
    pub concurrency: Option<usize>,
    /// Retries per part after the first attempt.
    pub max_retries: Option<u32>,
    /// Delay between two attempts of the same part.
    pub retry_delay: Option<Duration>,
    /// Merge call retry policy.
    pub merge_retry: MergeRetryPolicy,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            preupload_url: DEFAULT_PREUPLOAD_URL.to_owned(),
            profile: DEFAULT_UPLOAD_PROFILE.to_owned(),
            concurrency: None,
            max_retries: None,
            retry_delay: None,
            merge_retry: MergeRetryPolicy::default(),
        }
    }
}

impl UploadOptions {
    pub fn with_concurrency(mut self, concurrency: usize) -> Self {
        self.concurrency = Some(concurrency);
        self
    }

    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = Some(delay);
        self
    }

    pub fn with_merge_retry(mut self, merge_retry: MergeRetryPolicy) -> Self {
        self.merge_retry = merge_retry;
        self
    }
}

/// Options for a single ranged download.
#[derive(Debug, Clone)]
pub struct DownloadOptions {
    /// Retries after a stall or a failed request before giving up.
    pub max_retries: u32,
    /// Idle window: a request that delivers no bytes for this long is stalled.
    pub stall_timeout: Duration,
    /// Base delay before re-issuing a failed request.
    pub retry_delay: Duration,
    /// Extra headers for the ranged GET.
    pub headers: HeaderMap,
    /// Extra query parameters for the ranged GET.
    pub params: Vec<(String, String)>,
}

impl Default for DownloadOptions {
    fn default() -> Self {
        Self {
            max_retries: 3,
            stall_timeout: Duration::from_secs(10),
            retry_delay: Duration::from_secs(1),
            headers: HeaderMap::new(),
            params: Vec::new(),
        }
    }
}

impl DownloadOptions {
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    pub fn with_stall_timeout(mut self, timeout: Duration) -> Self {
        self.stall_timeout = timeout;
        self
    }

    pub fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    pub fn with_header(mut self, name: reqwest::header::HeaderName, value: HeaderValue) -> Self {
        self.headers.insert(name, value);
        self
    }

    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.params.push((key.into(), value.into()));
        self
    }

    /// Backoff used between failed requests (stalls included).
    pub(crate) fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::exponential(self.max_retries, self.retry_delay, self.retry_delay.saturating_mul(8))
    }
}
