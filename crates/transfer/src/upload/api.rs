//! UPOS wire protocol.
//!
//! The engine only talks to storage through [`UposApi`]. [`HttpUposApi`] is the
//! `reqwest` implementation; tests plug in their own.

use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use reqwest::{Client, RequestBuilder, Response, header::COOKIE};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, instrument};

use crate::error::{Result, TransferError};

/// Header carrying the negotiated upload token.
pub const UPOS_AUTH_HEADER: &str = "X-Upos-Auth";

/// Query of the preupload (negotiation) request.
#[derive(Debug, Clone, Serialize)]
pub struct PreuploadQuery {
    pub name: String,
    pub size: u64,
    pub r: &'static str,
    pub profile: String,
    pub ssl: u8,
    pub version: &'static str,
    pub build: u32,
}

impl PreuploadQuery {
    pub fn new(name: impl Into<String>, size: u64, profile: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            size,
            r: "upos",
            profile: profile.into(),
            ssl: 0,
            version: "2.14.0",
            build: 2140000,
        }
    }
}

/// Raw preupload answer. Every field is optional on the wire; the
/// negotiator decides which ones are required.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PreuploadResponse {
    #[serde(rename = "OK")]
    pub ok: Option<i64>,
    pub endpoint: Option<String>,
    pub upos_uri: Option<String>,
    pub biz_id: Option<u64>,
    pub chunk_size: Option<u64>,
    pub auth: Option<String>,
    pub threads: Option<usize>,
    pub chunk_retry: Option<u32>,
    /// Seconds.
    pub chunk_retry_delay: Option<u64>,
    /// Seconds.
    pub timeout: Option<u64>,
}

/// Where parts of one object go, and how to authenticate.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadTarget {
    /// Absolute object URL (`https://host/bucket/key`).
    pub url: String,
    /// Value of the `X-Upos-Auth` header.
    pub auth: String,
    /// Per-request timeout suggested by the negotiation.
    pub timeout: Option<Duration>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InitQuery {
    pub uploads: &'static str,
    pub output: &'static str,
    pub profile: String,
    pub filesize: u64,
    pub partsize: u64,
    pub biz_id: u64,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct InitResponse {
    #[serde(rename = "OK")]
    pub ok: Option<i64>,
    pub bucket: Option<String>,
    pub key: Option<String>,
    pub upload_id: Option<String>,
}

/// Query of one part upload.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PartQuery {
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    #[serde(rename = "partNumber")]
    pub part_number: u32,
    /// Zero-based chunk index.
    pub chunk: u32,
    /// Total number of chunks.
    pub chunks: u32,
    /// Size of this chunk.
    pub size: u64,
    pub start: u64,
    /// Exclusive end offset.
    pub end: u64,
    /// Size of the whole file.
    pub total: u64,
}

#[derive(Debug, Clone, Serialize)]
pub struct MergeQuery {
    pub name: String,
    #[serde(rename = "uploadId")]
    pub upload_id: String,
    pub biz_id: u64,
    pub output: &'static str,
    pub profile: String,
}

/// One entry of the merge body.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MergePart {
    #[serde(rename = "partNumber")]
    pub part_number: u32,
    #[serde(rename = "eTag")]
    pub etag: String,
}

#[derive(Debug, Clone, Serialize)]
struct MergeBody<'a> {
    parts: &'a [MergePart],
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct MergeResponse {
    #[serde(rename = "OK")]
    pub ok: Option<i64>,
    pub bucket: Option<String>,
    pub etag: Option<String>,
    pub key: Option<String>,
    pub location: Option<String>,
}

impl MergeResponse {
    pub fn is_ok(&self) -> bool {
        self.ok == Some(1)
    }
}

#[async_trait]
pub trait UposApi: Send + Sync {
    /// Ask the backend for a session descriptor.
    async fn preupload(&self, query: &PreuploadQuery) -> Result<PreuploadResponse>;

    /// Create the multipart upload for `target`.
    async fn init_multipart(&self, target: &UploadTarget, query: &InitQuery)
    -> Result<InitResponse>;

    /// Upload the bytes of one part.
    async fn upload_part(&self, target: &UploadTarget, query: &PartQuery, body: Bytes)
    -> Result<()>;

    /// Assemble all parts into the final object.
    async fn merge(
        &self,
        target: &UploadTarget,
        query: &MergeQuery,
        parts: &[MergePart],
    ) -> Result<MergeResponse>;
}

/// [`UposApi`] over HTTP.
pub struct HttpUposApi {
    client: Client,
    preupload_url: String,
    credential: Option<String>,
}

impl HttpUposApi {
    pub fn new(client: Client, preupload_url: impl Into<String>) -> Self {
        Self {
            client,
            preupload_url: preupload_url.into(),
            credential: None,
        }
    }

    /// Opaque credential (cookie string) sent with the preupload request.
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    fn authorized(&self, builder: RequestBuilder, target: &UploadTarget) -> RequestBuilder {
        let builder = builder.header(UPOS_AUTH_HEADER, &target.auth);
        match target.timeout {
            Some(timeout) => builder.timeout(timeout),
            None => builder,
        }
    }

    async fn send(
        builder: RequestBuilder,
        url: &str,
        operation: &'static str,
    ) -> Result<Response> {
        let response = builder.send().await?;
        if !response.status().is_success() {
            return Err(TransferError::http_status(response.status(), url, operation));
        }
        Ok(response)
    }

    async fn send_json<T: DeserializeOwned>(
        builder: RequestBuilder,
        url: &str,
        operation: &'static str,
    ) -> Result<T> {
        let response = Self::send(builder, url, operation).await?;
        let body = response.bytes().await?;
        serde_json::from_slice(&body).map_err(|e| TransferError::protocol(operation, e.to_string()))
    }
}

#[async_trait]
impl UposApi for HttpUposApi {
    #[instrument(skip(self), level = "debug")]
    async fn preupload(&self, query: &PreuploadQuery) -> Result<PreuploadResponse> {
        let mut builder = self.client.get(&self.preupload_url).query(query);
        if let Some(credential) = &self.credential {
            builder = builder.header(COOKIE, credential);
        }
        Self::send_json(builder, &self.preupload_url, "preupload").await
    }

    #[instrument(skip(self), level = "debug")]
    async fn init_multipart(
        &self,
        target: &UploadTarget,
        query: &InitQuery,
    ) -> Result<InitResponse> {
        let builder = self.authorized(self.client.post(&target.url).query(query), target);
        Self::send_json(builder, &target.url, "multipart init").await
    }

    #[instrument(skip(self, target, body), fields(part = query.part_number, size = body.len()), level = "debug")]
    async fn upload_part(&self, target: &UploadTarget, query: &PartQuery, body: Bytes) -> Result<()> {
        let builder = self.authorized(
            self.client
                .put(&target.url)
                .query(query)
                .header(reqwest::header::CONTENT_TYPE, "application/octet-stream")
                .body(body),
            target,
        );
        let response = Self::send(builder, &target.url, "part upload").await?;
        // Drain so the connection goes back to the pool.
        let _ = response.bytes().await?;
        debug!(part = query.part_number, "Part accepted");
        Ok(())
    }

    #[instrument(skip(self, parts), fields(parts = parts.len()), level = "debug")]
    async fn merge(
        &self,
        target: &UploadTarget,
        query: &MergeQuery,
        parts: &[MergePart],
    ) -> Result<MergeResponse> {
        let builder = self.authorized(
            self.client
                .post(&target.url)
                .query(query)
                .json(&MergeBody { parts }),
            target,
        );
        Self::send_json(builder, &target.url, "merge").await
    }
}
