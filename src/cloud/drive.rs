use futures::StreamExt;
use reqwest::{Client, RequestBuilder, Response, StatusCode};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use super::auth::{AccessTokenProvider, AuthError};
use super::query::{FOLDER_MIME, Query};
use crate::download::{self, DownloadError, ProgressSink};

const API_BASE: &str = "https://www.googleapis.com";
const FILE_FIELDS: &str = "id,name,mimeType,size,modifiedTime,parents";
const UPLOAD_CHUNK: usize = 8 * 1024;
const BOUNDARY: &str = "rocksync_multipart_boundary";

#[derive(Error, Debug)]
pub enum DriveError {
    #[error("request failed: {0}")]
    RequestError(#[from] reqwest::Error),
    #[error("auth: {0}")]
    Auth(#[from] AuthError),
    #[error("unauthorized")]
    Unauthorized,
    #[error("drive returned {0}: {1}")]
    Status(StatusCode, String),
    #[error("io error: {0}")]
    IoError(#[from] std::io::Error),
    #[error("invalid json: {0}")]
    JsonError(#[from] serde_json::Error),
    #[error("transfer failed: {0}")]
    Transfer(#[from] DownloadError),
}

impl DriveError {
    pub fn is_auth_failure(&self) -> bool {
        match self {
            Self::Unauthorized => true,
            Self::Auth(e) => e.is_auth_failure(),
            _ => false,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveFile {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub mime_type: String,
    /// Drive reports sizes as decimal strings
    pub size: Option<String>,
    pub modified_time: Option<String>,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl DriveFile {
    pub fn size_bytes(&self) -> Option<u64> {
        self.size.as_deref()?.parse().ok()
    }

    pub fn is_folder(&self) -> bool {
        self.mime_type == FOLDER_MIME
    }
}

#[derive(Debug, Deserialize)]
struct FileList {
    #[serde(default)]
    files: Vec<DriveFile>,
}

#[derive(Serialize)]
#[serde(rename_all = "camelCase")]
struct NewFile<'a> {
    name: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    mime_type: Option<&'a str>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    parents: Vec<&'a str>,
}

/// Thin Drive v3 REST client: only the calls the mirror needs.
pub struct DriveClient {
    client: Client,
    tokens: Arc<dyn AccessTokenProvider>,
    api_base: String,
}

impl DriveClient {
    pub fn new(tokens: Arc<dyn AccessTokenProvider>) -> Self {
        Self::with_base_url(tokens, API_BASE)
    }

    /// Create a client with a custom base URL (for testing)
    pub fn with_base_url(tokens: Arc<dyn AccessTokenProvider>, base_url: &str) -> Self {
        Self {
            client: Client::new(),
            tokens,
            api_base: base_url.trim_end_matches('/').to_string(),
        }
    }

    pub fn tokens(&self) -> &Arc<dyn AccessTokenProvider> {
        &self.tokens
    }

    fn files_url(&self) -> String {
        format!("{}/drive/v3/files", self.api_base)
    }

    fn upload_url(&self) -> String {
        format!("{}/upload/drive/v3/files", self.api_base)
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, DriveError> {
        let token = self.tokens.access_token().await?;
        let response = request.bearer_auth(token).send().await?;

        match response.status() {
            status if status.is_success() => Ok(response),
            StatusCode::UNAUTHORIZED => Err(DriveError::Unauthorized),
            status => {
                let body = response.text().await.unwrap_or_default();
                Err(DriveError::Status(status, body))
            }
        }
    }

    pub async fn list(&self, query: &Query, page_size: u32) -> Result<Vec<DriveFile>, DriveError> {
        let q = query.to_string();
        debug!(query = %q, "drive list");
        let page_size = page_size.to_string();
        let fields = format!("files({})", FILE_FIELDS);
        let request = self.client.get(self.files_url()).query(&[
            ("q", q.as_str()),
            ("pageSize", page_size.as_str()),
            ("fields", fields.as_str()),
            ("spaces", "drive"),
        ]);

        let list: FileList = self.send(request).await?.json().await?;
        Ok(list.files)
    }

    /// First match, or `None`. Duplicate names are tolerated.
    pub async fn find_first(&self, query: &Query) -> Result<Option<DriveFile>, DriveError> {
        Ok(self.list(query, 1).await?.into_iter().next())
    }

    pub async fn get(&self, id: &str) -> Result<DriveFile, DriveError> {
        let request = self
            .client
            .get(format!("{}/{}", self.files_url(), id))
            .query(&[("fields", FILE_FIELDS)]);
        Ok(self.send(request).await?.json().await?)
    }

    pub async fn download_bytes(&self, id: &str) -> Result<Vec<u8>, DriveError> {
        let request = self
            .client
            .get(format!("{}/{}", self.files_url(), id))
            .query(&[("alt", "media")]);
        Ok(self.send(request).await?.bytes().await?.to_vec())
    }

    /// Stream file content to `dest` via a temp file.
    pub async fn download_to_file(
        &self,
        id: &str,
        dest: &Path,
        progress: &dyn ProgressSink,
        cancel: &CancellationToken,
    ) -> Result<u64, DriveError> {
        let request = self
            .client
            .get(format!("{}/{}", self.files_url(), id))
            .query(&[("alt", "media")]);
        let response = self.send(request).await?;
        if let Some(parent) = dest.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        Ok(download::stream_to_file(response, dest, progress, cancel).await?)
    }

    pub async fn create_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
    ) -> Result<DriveFile, DriveError> {
        let body = NewFile {
            name,
            mime_type: Some(FOLDER_MIME),
            parents: parent_id.into_iter().collect(),
        };
        let request = self
            .client
            .post(self.files_url())
            .query(&[("fields", FILE_FIELDS)])
            .json(&body);
        Ok(self.send(request).await?.json().await?)
    }

    pub async fn upload_bytes(
        &self,
        name: &str,
        parent_id: Option<&str>,
        mime_type: &str,
        content: Vec<u8>,
    ) -> Result<DriveFile, DriveError> {
        let (head, tail) = multipart_frame(name, parent_id, mime_type)?;
        let mut body = head;
        body.extend_from_slice(&content);
        body.extend_from_slice(&tail);

        let request = self
            .client
            .post(self.upload_url())
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(reqwest::header::CONTENT_TYPE, multipart_content_type())
            .body(body);
        Ok(self.send(request).await?.json().await?)
    }

    /// Multipart upload streamed from disk, reporting the fraction of the
    /// file sent so far.
    pub async fn upload_file(
        &self,
        name: &str,
        parent_id: Option<&str>,
        mime_type: &str,
        path: &Path,
        progress: Arc<dyn ProgressSink>,
    ) -> Result<DriveFile, DriveError> {
        let (head, tail) = multipart_frame(name, parent_id, mime_type)?;
        let file = tokio::fs::File::open(path).await?;
        let file_len = file.metadata().await?.len();
        let content_length = head.len() as u64 + file_len + tail.len() as u64;

        let file_chunks = futures::stream::try_unfold(
            (file, 0u64, progress),
            move |(mut file, sent, progress)| async move {
                let mut buf = vec![0u8; UPLOAD_CHUNK];
                let n = file.read(&mut buf).await?;
                if n == 0 {
                    return Ok::<_, std::io::Error>(None);
                }
                buf.truncate(n);
                let sent = sent + n as u64;
                if file_len > 0 {
                    progress.report(sent as f64 / file_len as f64);
                }
                Ok(Some((buf, (file, sent, progress))))
            },
        );

        let body = futures::stream::once(async move { Ok::<_, std::io::Error>(head) })
            .chain(file_chunks)
            .chain(futures::stream::once(async move { Ok(tail) }));

        let request = self
            .client
            .post(self.upload_url())
            .query(&[("uploadType", "multipart"), ("fields", FILE_FIELDS)])
            .header(reqwest::header::CONTENT_TYPE, multipart_content_type())
            .header(reqwest::header::CONTENT_LENGTH, content_length)
            .body(reqwest::Body::wrap_stream(body));
        Ok(self.send(request).await?.json().await?)
    }

    /// Replace a file's content in place.
    pub async fn update_bytes(
        &self,
        id: &str,
        mime_type: &str,
        content: Vec<u8>,
    ) -> Result<DriveFile, DriveError> {
        let request = self
            .client
            .patch(format!("{}/{}", self.upload_url(), id))
            .query(&[("uploadType", "media"), ("fields", FILE_FIELDS)])
            .header(reqwest::header::CONTENT_TYPE, mime_type)
            .body(content);
        Ok(self.send(request).await?.json().await?)
    }

    pub async fn delete(&self, id: &str) -> Result<(), DriveError> {
        let request = self.client.delete(format!("{}/{}", self.files_url(), id));
        self.send(request).await?;
        Ok(())
    }
}

fn multipart_content_type() -> String {
    format!("multipart/related; boundary={}", BOUNDARY)
}

/// Everything before and after the file content in a multipart/related body.
fn multipart_frame(
    name: &str,
    parent_id: Option<&str>,
    mime_type: &str,
) -> Result<(Vec<u8>, Vec<u8>), DriveError> {
    let metadata = serde_json::to_string(&NewFile {
        name,
        mime_type: Some(mime_type),
        parents: vec![parent_id.unwrap_or("root")],
    })?;

    let head = format!(
        "--{b}\r\nContent-Type: application/json; charset=UTF-8\r\n\r\n{m}\r\n--{b}\r\nContent-Type: {t}\r\n\r\n",
        b = BOUNDARY,
        m = metadata,
        t = mime_type
    );
    let tail = format!("\r\n--{}--\r\n", BOUNDARY);
    Ok((head.into_bytes(), tail.into_bytes()))
}
