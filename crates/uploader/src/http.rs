//! HTTP implementation of [`RemoteService`].
//!
//! JSON endpoints go through a shared `reqwest` client. Chunk bodies are
//! streamed in fixed-size frames so progress is reported while the
//! request is in flight.

use chunkferry_protocol::constants::{CHECK_PATH, INIT_PATH, MERGE_PATH};
use chunkferry_protocol::{
    ApiResponse, CODE_INIT_FAILED, CheckData, InitUploadData, InitUploadRequest, MergeData,
    OCTET_STREAM,
};
use futures_util::StreamExt;
use reqwest::header::{CONTENT_LENGTH, CONTENT_TYPE};
use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, trace};

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::remote::{CheckOutcome, RemoteFuture, RemoteService, SendProgress};

/// Size of each frame of a streamed chunk body: 64 KiB.
const FRAME_SIZE: usize = 64 * 1024;

/// Remote service reached over HTTP.
pub struct HttpRemote {
    http: reqwest::Client,
    base_url: String,
}

impl HttpRemote {
    /// Creates a client for `config.api_base` with the configured timeout.
    pub fn new(config: &UploadConfig) -> Result<Self, UploadError> {
        let http = reqwest::Client::builder()
            .timeout(config.timeout())
            .build()?;

        Ok(Self::with_client(http, &config.api_base))
    }

    /// Wraps an existing client.
    pub fn with_client(http: reqwest::Client, base_url: &str) -> Self {
        Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    fn endpoint(&self, path: &str, fingerprint: Option<&str>) -> String {
        match fingerprint {
            Some(fp) => format!("{}{}/{}", self.base_url, path, fp),
            None => format!("{}{}", self.base_url, path),
        }
    }

    async fn read_envelope<T: DeserializeOwned>(
        resp: reqwest::Response,
    ) -> Result<ApiResponse<T>, UploadError> {
        let body = resp.error_for_status()?.bytes().await?;
        Ok(ApiResponse::from_slice(&body)?)
    }

    async fn check_inner(&self, fingerprint: &str) -> Result<CheckOutcome, UploadError> {
        let url = self.endpoint(CHECK_PATH, Some(fingerprint));
        trace!(%url, "check");
        let resp = self.http.get(&url).send().await?;
        Ok(check_outcome(Self::read_envelope(resp).await?))
    }

    async fn init_inner(&self, request: &InitUploadRequest) -> Result<InitUploadData, UploadError> {
        let url = self.endpoint(INIT_PATH, None);
        trace!(%url, chunks = request.chunk_count, "init");
        let resp = self.http.post(&url).json(request).send().await?;
        init_data(Self::read_envelope(resp).await?)
    }

    async fn put_inner(
        &self,
        destination: &str,
        data: Vec<u8>,
        progress: SendProgress,
        cancel: CancellationToken,
    ) -> Result<(), UploadError> {
        let total = data.len() as u64;
        let mut sent = 0u64;
        let frames = futures_util::stream::iter(into_frames(data)).map({
            let progress = progress.clone();
            move |frame| {
                sent += frame.len() as u64;
                progress(sent, total);
                Ok::<_, std::io::Error>(frame)
            }
        });

        let request = self
            .http
            .put(destination)
            .header(CONTENT_TYPE, OCTET_STREAM)
            .header(CONTENT_LENGTH, total)
            .body(reqwest::Body::wrap_stream(frames))
            .send();

        let resp = tokio::select! {
            _ = cancel.cancelled() => return Err(UploadError::Cancelled),
            resp = request => resp?,
        };
        resp.error_for_status()?;

        progress(total, total);
        debug!(bytes = total, "chunk stored");
        Ok(())
    }

    async fn merge_inner(&self, fingerprint: &str) -> Result<String, UploadError> {
        let url = self.endpoint(MERGE_PATH, Some(fingerprint));
        trace!(%url, "merge");
        let resp = self.http.post(&url).send().await?;
        merge_url(Self::read_envelope(resp).await?)
    }
}

impl RemoteService for HttpRemote {
    fn check(&self, fingerprint: &str) -> RemoteFuture<'_, CheckOutcome> {
        let fingerprint = fingerprint.to_string();
        Box::pin(async move {
            self.check_inner(&fingerprint)
                .await
                .map_err(|e| UploadError::Check(e.to_string()))
        })
    }

    fn init(&self, request: &InitUploadRequest) -> RemoteFuture<'_, InitUploadData> {
        let request = request.clone();
        Box::pin(async move {
            self.init_inner(&request).await.map_err(|e| match e {
                UploadError::Init(_) => e,
                other => UploadError::Init(other.to_string()),
            })
        })
    }

    fn put_chunk(
        &self,
        destination: &str,
        data: Vec<u8>,
        progress: SendProgress,
        cancel: CancellationToken,
    ) -> RemoteFuture<'_, ()> {
        let destination = destination.to_string();
        Box::pin(async move { self.put_inner(&destination, data, progress, cancel).await })
    }

    fn merge(&self, fingerprint: &str) -> RemoteFuture<'_, String> {
        let fingerprint = fingerprint.to_string();
        Box::pin(async move {
            self.merge_inner(&fingerprint).await.map_err(|e| match e {
                UploadError::Merge(_) => e,
                other => UploadError::Merge(other.to_string()),
            })
        })
    }
}

/// Interprets a check response. Only the hit code counts as stored.
fn check_outcome(resp: ApiResponse<CheckData>) -> CheckOutcome {
    if resp.is_hit() {
        let url = resp.data.and_then(|d| d.url).unwrap_or_default();
        CheckOutcome::Hit { url }
    } else {
        CheckOutcome::Miss
    }
}

/// Interprets an init response.
fn init_data(resp: ApiResponse<InitUploadData>) -> Result<InitUploadData, UploadError> {
    if resp.code == CODE_INIT_FAILED {
        let message = if resp.message.is_empty() {
            format!("remote returned code {CODE_INIT_FAILED}")
        } else {
            resp.message
        };
        return Err(UploadError::Init(message));
    }
    resp.data
        .ok_or_else(|| UploadError::Init("empty init response".into()))
}

/// Interprets a merge response, surfacing the remote message on failure.
fn merge_url(resp: ApiResponse<MergeData>) -> Result<String, UploadError> {
    if resp.is_hit() {
        return Ok(resp.data.map(|d| d.url).unwrap_or_default());
    }
    if resp.message.is_empty() {
        Err(UploadError::Merge("merge failed".into()))
    } else {
        Err(UploadError::Merge(resp.message))
    }
}

fn into_frames(data: Vec<u8>) -> Vec<Vec<u8>> {
    if data.len() <= FRAME_SIZE {
        return vec![data];
    }
    data.chunks(FRAME_SIZE).map(<[u8]>::to_vec).collect()
}
