//! Wire side of the chunked upload protocol.
//!
//! - `GET  {api}/upload-status.php?session_id=` — chunks the server holds
//! - `POST {api}/upload.php` — one multipart `chunk` per request
//! - `POST {api}/upload-finalize.php` — merge once every chunk is present
//!
//! Identifying metadata travels in `X-*` headers on every POST.

use crate::errors::TransportError;
use bytes::Bytes;
use percent_encoding::{AsciiSet, CONTROLS, utf8_percent_encode};
use reqwest::{
    RequestBuilder, Response,
    multipart::{Form, Part},
};
use serde::Deserialize;
use std::future::Future;
use tracing::debug;

pub const HEADER_SESSION_ID: &str = "X-Upload-Session-Id";
pub const HEADER_CHUNK_NUMBER: &str = "X-Chunk-Number";
pub const HEADER_TOTAL_CHUNKS: &str = "X-Total-Chunks";
pub const HEADER_FILE_NAME: &str = "X-File-Name";
pub const HEADER_FILE_SIZE: &str = "X-File-Size";
pub const HEADER_FILE_TYPE: &str = "X-File-Type";
pub const HEADER_SECTOR_ID: &str = "X-Sector-Id";

/// The file and session every request of one upload refers to.
#[derive(Clone, Debug, PartialEq)]
pub struct UploadTarget {
    pub session_id: String,
    pub file_name: String,
    pub file_size: u64,
    pub file_type: String,
    pub total_chunks: u32,
    pub sector_id: Option<String>,
}

/// One chunk on its way to the server.
#[derive(Clone, Debug)]
pub struct ChunkRequest<'a> {
    pub target: &'a UploadTarget,
    pub index: u32,
    pub data: Bytes,
}

/// Body of a chunk or finalize response. `url` is set once the server has
/// merged every chunk.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct ChunkResponse {
    #[serde(default)]
    pub url: Option<String>,
}

/// Body of the resume-status endpoint.
#[derive(Debug, Default, Clone, PartialEq, Deserialize)]
pub struct UploadStatusResponse {
    #[serde(default)]
    pub session_id: Option<String>,
    #[serde(default)]
    pub uploaded_chunks: Vec<u32>,
}

/// Anything able to carry the upload protocol.
pub trait ChunkTransport: Send + Sync {
    fn fetch_status(
        &self,
        session_id: &str,
    ) -> impl Future<Output = Result<UploadStatusResponse, TransportError>> + Send;

    fn send_chunk(
        &self,
        request: ChunkRequest<'_>,
    ) -> impl Future<Output = Result<ChunkResponse, TransportError>> + Send;

    fn finalize(
        &self,
        target: &UploadTarget,
    ) -> impl Future<Output = Result<ChunkResponse, TransportError>> + Send;
}

/// `ChunkTransport` over HTTP with `reqwest`.
#[derive(Clone, Debug)]
pub struct HttpTransport {
    client: reqwest::Client,
    api_url: String,
}

impl HttpTransport {
    pub fn new(api_url: impl Into<String>) -> Self {
        Self::with_client(reqwest::Client::new(), api_url)
    }

    pub fn with_client(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }

    fn endpoint(&self, name: &str) -> String {
        format!("{}/{}", self.api_url.trim_end_matches('/'), name)
    }
}

impl ChunkTransport for HttpTransport {
    async fn fetch_status(&self, session_id: &str) -> Result<UploadStatusResponse, TransportError> {
        let response = self
            .client
            .get(self.endpoint("upload-status.php"))
            .query(&[("session_id", session_id)])
            .send()
            .await?;
        let body = ensure_success(response).await?.text().await?;
        Ok(serde_json::from_str(&body)?)
    }

    async fn send_chunk(&self, request: ChunkRequest<'_>) -> Result<ChunkResponse, TransportError> {
        let size = request.data.len();
        let part = Part::stream(request.data)
            .file_name(format!("chunk_{}", request.index))
            .mime_str("application/octet-stream")?;
        let form = Form::new().part("chunk", part);

        let builder = self
            .client
            .post(self.endpoint("upload.php"))
            .header(HEADER_CHUNK_NUMBER, request.index.to_string())
            .multipart(form);
        let response = with_target_headers(builder, request.target).send().await?;
        debug!(
            session_id = %request.target.session_id,
            chunk = request.index,
            size,
            status = %response.status(),
            "chunk posted"
        );
        parse_chunk_response(ensure_success(response).await?).await
    }

    async fn finalize(&self, target: &UploadTarget) -> Result<ChunkResponse, TransportError> {
        let builder = self.client.post(self.endpoint("upload-finalize.php"));
        let response = with_target_headers(builder, target).send().await?;
        parse_chunk_response(ensure_success(response).await?).await
    }
}

fn with_target_headers(builder: RequestBuilder, target: &UploadTarget) -> RequestBuilder {
    let builder = builder
        .header(HEADER_SESSION_ID, header_safe(&target.session_id))
        .header(HEADER_TOTAL_CHUNKS, target.total_chunks.to_string())
        .header(HEADER_FILE_NAME, header_safe(&target.file_name))
        .header(HEADER_FILE_SIZE, target.file_size.to_string())
        .header(HEADER_FILE_TYPE, header_safe(&target.file_type));
    match target.sector_id.as_deref() {
        Some(sector) => builder.header(HEADER_SECTOR_ID, header_safe(sector)),
        None => builder,
    }
}

/// Bytes escaped in header values: controls, `%` itself, and (implicitly)
/// everything outside ASCII.
const HEADER_ESCAPES: &AsciiSet = &CONTROLS.add(b'%');

/// Header values must be visible ASCII, so anything else is percent-encoded
/// as UTF-8. The server decodes it back to the original name.
fn header_safe(value: &str) -> String {
    utf8_percent_encode(value, HEADER_ESCAPES).to_string()
}

async fn ensure_success(response: Response) -> Result<Response, TransportError> {
    let status = response.status();
    if status.is_success() {
        return Ok(response);
    }
    let body = response.text().await.unwrap_or_default();
    Err(TransportError::Status {
        status: status.as_u16(),
        body,
    })
}

/// Intermediate chunks may come back with an empty body.
async fn parse_chunk_response(response: Response) -> Result<ChunkResponse, TransportError> {
    let body = response.text().await?;
    if body.trim().is_empty() {
        return Ok(ChunkResponse::default());
    }
    Ok(serde_json::from_str(&body)?)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn header_values_are_percent_encoded() {
        assert_eq!(header_safe("beta run.mp4"), "beta run.mp4");
        assert_eq!(header_safe("Überhang\n.mov"), "%C3%9Cberhang%0A.mov");
        assert_eq!(header_safe("100% crimp.mp4"), "100%25 crimp.mp4");
    }

    #[test]
    fn endpoint_joins_without_double_slash() {
        let transport = HttpTransport::new("https://api.example.com/videos/");
        assert_eq!(
            transport.endpoint("upload.php"),
            "https://api.example.com/videos/upload.php"
        );
    }

    #[test]
    fn chunk_response_tolerates_extra_fields() {
        let parsed: ChunkResponse =
            serde_json::from_str(r#"{"success":true,"chunk":2}"#).unwrap();
        assert_eq!(parsed.url, None);
        let parsed: ChunkResponse =
            serde_json::from_str(r#"{"url":"https://cdn/v.mp4"}"#).unwrap();
        assert_eq!(parsed.url.as_deref(), Some("https://cdn/v.mp4"));
    }

    #[test]
    fn status_response_defaults_missing_list() {
        let parsed: UploadStatusResponse = serde_json::from_str(r#"{"session_id":"s"}"#).unwrap();
        assert!(parsed.uploaded_chunks.is_empty());
    }
}
