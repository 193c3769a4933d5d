use std::time::Duration;

use reqwest::StatusCode;

/// Crate-wide result type.
pub type Result<T, E = TransferError> = std::result::Result<T, E>;

#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    /// The transfer was aborted by the caller (pause, cancel or an external token).
    #[error("transfer cancelled")]
    Cancelled,

    #[error("invalid URL `{input}`: {reason}")]
    InvalidUrl { input: String, reason: String },

    #[error("proxy configuration error: {reason}")]
    ProxyConfiguration { reason: String },

    #[error("HTTP request failed: {source}")]
    Network {
        #[from]
        source: reqwest::Error,
    },

    #[error("request failed with HTTP {status} during {operation} for {url}")]
    HttpStatus {
        status: StatusCode,
        url: String,
        operation: &'static str,
    },

    #[error("I/O error: {source}")]
    Io {
        #[from]
        source: std::io::Error,
    },

    #[error("upload negotiation failed: {reason}")]
    Negotiation { reason: String },

    #[error("part {part_number} failed after {attempts} attempts: {reason}")]
    ChunkUpload {
        part_number: u32,
        attempts: u32,
        reason: String,
    },

    #[error("merge failed after {attempts} attempts: {reason}")]
    Merge { attempts: u32, reason: String },

    #[error("no data received for {idle:?} (after {retries} retries)")]
    StallTimeout { idle: Duration, retries: u32 },

    #[error("malformed response during {operation}: {reason}")]
    Protocol {
        operation: &'static str,
        reason: String,
    },

    #[error("cannot {operation} while {status}")]
    InvalidState {
        operation: &'static str,
        status: String,
    },

    #[error("configuration error: {reason}")]
    Configuration { reason: String },

    #[error("internal error: {reason}")]
    Internal { reason: String },
}

impl TransferError {
    pub fn invalid_url(input: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidUrl {
            input: input.into(),
            reason: reason.into(),
        }
    }

    pub fn proxy_configuration(reason: impl Into<String>) -> Self {
        Self::ProxyConfiguration {
            reason: reason.into(),
        }
    }

    pub fn http_status(
        status: StatusCode,
        url: impl Into<String>,
        operation: &'static str,
    ) -> Self {
        Self::HttpStatus {
            status,
            url: url.into(),
            operation,
        }
    }

    pub fn negotiation(reason: impl Into<String>) -> Self {
        Self::Negotiation {
            reason: reason.into(),
        }
    }

    pub fn protocol(operation: &'static str, reason: impl Into<String>) -> Self {
        Self::Protocol {
            operation,
            reason: reason.into(),
        }
    }

    pub fn invalid_state(operation: &'static str, status: impl std::fmt::Display) -> Self {
        Self::InvalidState {
            operation,
            status: status.to_string(),
        }
    }

    pub fn configuration(reason: impl Into<String>) -> Self {
        Self::Configuration {
            reason: reason.into(),
        }
    }

    pub fn internal(reason: impl Into<String>) -> Self {
        Self::Internal {
            reason: reason.into(),
        }
    }

    /// Whether the error was caused by a user-initiated abort.
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Whether a bounded local retry may recover from this error.
    ///
    /// Local file errors are deliberately excluded: a failing disk is not
    /// something another request fixes.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Cancelled => false,
            Self::InvalidUrl { .. }
            | Self::ProxyConfiguration { .. }
            | Self::Configuration { .. }
            | Self::InvalidState { .. }
            | Self::Negotiation { .. }
            | Self::ChunkUpload { .. }
            | Self::Merge { .. }
            | Self::Io { .. } => false,
            Self::Network { .. }
            | Self::HttpStatus { .. }
            | Self::StallTimeout { .. }
            | Self::Protocol { .. }
            | Self::Internal { .. } => true,
        }
    }
}
