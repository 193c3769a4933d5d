use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

use tracing::{debug, info, instrument};

use super::api::{PreuploadQuery, PreuploadResponse, UploadTarget, UposApi};
use crate::error::{Result, TransferError};

const DEFAULT_THREADS: usize = 3;
const DEFAULT_CHUNK_RETRY: u32 = 3;
const DEFAULT_CHUNK_RETRY_DELAY: Duration = Duration::from_secs(1);

/// What to negotiate an upload session for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NegotiateRequest {
    /// Logical name reported to the backend.
    pub name: String,
    /// Size in bytes.
    pub size: u64,
}

impl NegotiateRequest {
    /// Fixed logical name, for metadata-only transfers.
    pub fn named(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
        }
    }

    /// Size and base name of a local file.
    pub async fn for_file(path: &Path) -> Result<Self> {
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| {
                TransferError::configuration(format!("{} has no file name", path.display()))
            })?;
        Ok(Self::named(name, metadata.len()))
    }
}

/// Negotiated parameters governing one upload session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// Upload host, usually scheme-relative (`//upos-xx.bilivideo.com`).
    pub endpoint: String,
    /// Object location (`upos://bucket/key`).
    pub upos_uri: String,
    /// Content id the object is bound to.
    pub biz_id: u64,
    /// Short-lived token for `X-Upos-Auth`.
    pub auth: String,
    pub chunk_size: u64,
    pub threads: usize,
    pub chunk_retry: u32,
    pub chunk_retry_delay: Duration,
    pub timeout: Option<Duration>,
}

impl SessionDescriptor {
    fn from_response(response: PreuploadResponse) -> Result<Self> {
        if response.ok != Some(1) {
            return Err(TransferError::negotiation(format!(
                "preupload answered OK={:?}",
                response.ok
            )));
        }

        fn required<T>(value: Option<T>, field: &str) -> Result<T> {
            value.ok_or_else(|| TransferError::negotiation(format!("response is missing `{field}`")))
        }

        let endpoint = required(response.endpoint.filter(|s| !s.is_empty()), "endpoint")?;
        let upos_uri = required(response.upos_uri.filter(|s| !s.is_empty()), "upos_uri")?;
        let auth = required(response.auth.filter(|s| !s.is_empty()), "auth")?;
        let biz_id = required(response.biz_id, "biz_id")?;
        let chunk_size = required(response.chunk_size.filter(|&s| s > 0), "chunk_size")?;

        Ok(Self {
            endpoint,
            upos_uri,
            biz_id,
            auth,
            chunk_size,
            threads: response.threads.filter(|&t| t > 0).unwrap_or(DEFAULT_THREADS),
            chunk_retry: response.chunk_retry.unwrap_or(DEFAULT_CHUNK_RETRY),
            chunk_retry_delay: response
                .chunk_retry_delay
                .map(Duration::from_secs)
                .unwrap_or(DEFAULT_CHUNK_RETRY_DELAY),
            timeout: response
                .timeout
                .filter(|&t| t > 0)
                .map(Duration::from_secs),
        })
    }

    /// Absolute URL of the object all part and merge calls target.
    pub fn object_url(&self) -> String {
        let path = self
            .upos_uri
            .strip_prefix("upos://")
            .unwrap_or(&self.upos_uri)
            .trim_start_matches('/');
        let endpoint = self.endpoint.trim_end_matches('/');
        if endpoint.starts_with("//") {
            format!("https:{endpoint}/{path}")
        } else if endpoint.contains("://") {
            format!("{endpoint}/{path}")
        } else {
            format!("https://{endpoint}/{path}")
        }
    }

    pub fn target(&self) -> UploadTarget {
        UploadTarget {
            url: self.object_url(),
            auth: self.auth.clone(),
            timeout: self.timeout,
        }
    }
}

/// One-shot preupload request.
pub struct Negotiator {
    api: Arc<dyn UposApi>,
    profile: String,
}

impl Negotiator {
    pub fn new(api: Arc<dyn UposApi>, profile: impl Into<String>) -> Self {
        Self {
            api,
            profile: profile.into(),
        }
    }

    /// Request a session descriptor.
    ///
    /// Transport errors propagate unchanged; an incomplete answer is a
    /// [`TransferError::Negotiation`].
    #[instrument(skip(self), level = "debug")]
    pub async fn negotiate(&self, request: &NegotiateRequest) -> Result<SessionDescriptor> {
        let query = PreuploadQuery::new(&request.name, request.size, &self.profile);
        let response = self.api.preupload(&query).await?;
        debug!(response = ?response, "Preupload answered");

        let descriptor = SessionDescriptor::from_response(response)?;
        info!(
            name = %request.name,
            size = request.size,
            biz_id = descriptor.biz_id,
            chunk_size = descriptor.chunk_size,
            threads = descriptor.threads,
            "Upload session negotiated"
        );
        Ok(descriptor)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::upload::api::{InitQuery, InitResponse, MergePart, MergeQuery, MergeResponse, PartQuery};
    use async_trait::async_trait;
    use bytes::Bytes;
    use reqwest::StatusCode;
    use std::sync::Mutex;

    struct MockPreupload {
        answer: Mutex<Option<Result<PreuploadResponse>>>,
        queries: Mutex<Vec<PreuploadQuery>>,
    }

    impl MockPreupload {
        fn answering(answer: Result<PreuploadResponse>) -> Arc<Self> {
            Arc::new(Self {
                answer: Mutex::new(Some(answer)),
                queries: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl UposApi for MockPreupload {
        async fn preupload(&self, query: &PreuploadQuery) -> Result<PreuploadResponse> {
            self.queries.lock().unwrap().push(query.clone());
            self.answer.lock().unwrap().take().unwrap()
        }

        async fn init_multipart(&self, _target: &UploadTarget, _query: &InitQuery) -> Result<InitResponse> {
            panic!("negotiation must not init");
        }

        async fn upload_part(&self, _target: &UploadTarget, _query: &PartQuery, _body: Bytes) -> Result<()> {
            panic!("negotiation must not upload");
        }

        async fn merge(
            &self,
            _target: &UploadTarget,
            _query: &MergeQuery,
            _parts: &[MergePart],
        ) -> Result<MergeResponse> {
            panic!("negotiation must not merge");
        }
    }

    fn complete_response() -> PreuploadResponse {
        PreuploadResponse {
            ok: Some(1),
            endpoint: Some("//upos-cs-upcdnbda2.bilivideo.com".to_string()),
            upos_uri: Some("upos://ugcfx2lf/n230101abcdef.mp4".to_string()),
            biz_id: Some(1180000123),
            chunk_size: Some(10_485_760),
            auth: Some("ak=1&cdn=%2F%2Fupos&os=upos&sign=f00".to_string()),
            threads: Some(4),
            chunk_retry: Some(10),
            chunk_retry_delay: Some(3),
            timeout: Some(600),
        }
    }

    #[tokio::test]
    async fn complete_answer_becomes_descriptor() {
        let api = MockPreupload::answering(Ok(complete_response()));
        let negotiator = Negotiator::new(api.clone(), "ugcupos/bup");

        let descriptor = negotiator
            .negotiate(&NegotiateRequest::named("video.mp4", 240_850_008))
            .await
            .unwrap();

        assert_eq!(descriptor.biz_id, 1180000123);
        assert_eq!(descriptor.threads, 4);
        assert_eq!(descriptor.chunk_retry_delay, Duration::from_secs(3));
        assert_eq!(descriptor.timeout, Some(Duration::from_secs(600)));
        assert_eq!(
            descriptor.object_url(),
            "https://upos-cs-upcdnbda2.bilivideo.com/ugcfx2lf/n230101abcdef.mp4"
        );

        let queries = api.queries.lock().unwrap();
        assert_eq!(queries[0].name, "video.mp4");
        assert_eq!(queries[0].size, 240_850_008);
        assert_eq!(queries[0].profile, "ugcupos/bup");
    }

    #[tokio::test]
    async fn missing_auth_is_a_negotiation_error() {
        let response = PreuploadResponse {
            auth: None,
            ..complete_response()
        };
        let negotiator = Negotiator::new(MockPreupload::answering(Ok(response)), "ugcupos/bup");

        let err = negotiator
            .negotiate(&NegotiateRequest::named("a.mp4", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Negotiation { .. }), "{err}");
        assert!(err.to_string().contains("auth"));
    }

    #[tokio::test]
    async fn zero_chunk_size_is_rejected() {
        let response = PreuploadResponse {
            chunk_size: Some(0),
            ..complete_response()
        };
        let negotiator = Negotiator::new(MockPreupload::answering(Ok(response)), "ugcupos/bup");
        let err = negotiator
            .negotiate(&NegotiateRequest::named("a.mp4", 1))
            .await
            .unwrap_err();
        assert!(matches!(err, TransferError::Negotiation { .. }));
    }

    #[tokio::test]
    async fn not_ok_answer_is_rejected() {
        let response = PreuploadResponse {
            ok: Some(0),
            ..complete_response()
        };
        let negotiator = Negotiator::new(MockPreupload::answering(Ok(response)), "ugcupos/bup");
        assert!(matches!(
            negotiator.negotiate(&NegotiateRequest::named("a.mp4", 1)).await,
            Err(TransferError::Negotiation { .. })
        ));
    }

    #[tokio::test]
    async fn transport_errors_propagate_unchanged() {
        let api = MockPreupload::answering(Err(TransferError::http_status(
            StatusCode::BAD_GATEWAY,
            "https://member.bilibili.com/preupload",
            "preupload",
        )));
        let negotiator = Negotiator::new(api, "ugcupos/bup");
        let err = negotiator
            .negotiate(&NegotiateRequest::named("a.mp4", 1))
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            TransferError::HttpStatus {
                status: StatusCode::BAD_GATEWAY,
                ..
            }
        ));
    }

    #[test]
    fn optional_hints_fall_back_to_defaults() {
        let response = PreuploadResponse {
            threads: None,
            chunk_retry: None,
            chunk_retry_delay: None,
            timeout: None,
            ..complete_response()
        };
        let descriptor = SessionDescriptor::from_response(response).unwrap();
        assert_eq!(descriptor.threads, DEFAULT_THREADS);
        assert_eq!(descriptor.chunk_retry, DEFAULT_CHUNK_RETRY);
        assert_eq!(descriptor.chunk_retry_delay, DEFAULT_CHUNK_RETRY_DELAY);
        assert_eq!(descriptor.timeout, None);
    }

    #[test]
    fn endpoint_with_scheme_is_kept() {
        let response = PreuploadResponse {
            endpoint: Some("http://127.0.0.1:8080/".to_string()),
            ..complete_response()
        };
        let descriptor = SessionDescriptor::from_response(response).unwrap();
        assert_eq!(
            descriptor.object_url(),
            "http://127.0.0.1:8080/ugcfx2lf/n230101abcdef.mp4"
        );
    }

    #[tokio::test]
    async fn request_for_file_reads_size_and_name() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("clip.flv");
        tokio::fs::write(&path, vec![7u8; 1234]).await.unwrap();

        let request = NegotiateRequest::for_file(&path).await.unwrap();
        assert_eq!(request, NegotiateRequest::named("clip.flv", 1234));
    }
}
