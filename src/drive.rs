// src/drive.rs
//
// Seam to the cloud drive. The orchestration core only ever talks to
// `DriveClient`, so tests substitute an in-memory fake and the real SDK
// stays outside the crate. A plain HTTP gateway implementation is
// provided for deployments that front the drive with a REST proxy.

use crate::types::PackageDescriptor;
use async_trait::async_trait;
use serde::Deserialize;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DriveError {
    #[error("drive API error: {0}")]
    Api(String),
    #[error("remote file not found: {0}")]
    NotFound(String),
    #[error("drive I/O error: {0}")]
    Io(#[from] std::io::Error),
}

#[async_trait]
pub trait DriveClient: Send + Sync {
    /// Current listing of the watched folder.
    async fn list_folder(&self, folder_id: &str) -> Result<Vec<PackageDescriptor>, DriveError>;

    /// Fresh descriptor for one file (size/mtime may have changed since
    /// the listing).
    async fn stat(&self, remote_id: &str) -> Result<PackageDescriptor, DriveError>;

    /// Up to `max_len` bytes starting at `offset`. An empty chunk means
    /// end of file.
    async fn fetch_chunk(
        &self,
        remote_id: &str,
        offset: u64,
        max_len: u64,
    ) -> Result<Vec<u8>, DriveError>;

    /// Cheap reachability probe for --test-connection.
    async fn ping(&self) -> Result<(), DriveError>;
}

// ============================================================================
// HTTP gateway implementation
// ============================================================================

#[derive(Debug, Deserialize)]
struct GatewayFile {
    id: String,
    name: String,
    size: u64,
    #[serde(default)]
    modified_time: String,
    #[serde(default)]
    mime_type: String,
}

/// REST gateway speaking ranged GETs against a drive proxy.
pub struct HttpDriveClient {
    base_url: String,
    http: reqwest::Client,
}

impl HttpDriveClient {
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> Result<Self, DriveError> {
        let http = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| DriveError::Api(e.to_string()))?;
        Ok(Self {
            base_url: base_url.into(),
            http,
        })
    }

    fn url(&self, path: &str) -> String {
        format!("{}/{}", self.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl DriveClient for HttpDriveClient {
    async fn list_folder(&self, folder_id: &str) -> Result<Vec<PackageDescriptor>, DriveError> {
        let url = self.url(&format!("folders/{folder_id}/files"));
        let files: Vec<GatewayFile> = self
            .http
            .get(&url)
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DriveError::Api(e.to_string()))?
            .json()
            .await
            .map_err(|e| DriveError::Api(e.to_string()))?;

        Ok(files
            .into_iter()
            .map(|f| PackageDescriptor {
                remote_id: f.id,
                name: f.name,
                size_bytes: f.size,
                remote_mtime: f.modified_time,
                mime: f.mime_type,
            })
            .collect())
    }

    async fn stat(&self, remote_id: &str) -> Result<PackageDescriptor, DriveError> {
        let url = self.url(&format!("files/{remote_id}"));
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| DriveError::Api(e.to_string()))?;
        if response.status() == reqwest::StatusCode::NOT_FOUND {
            return Err(DriveError::NotFound(remote_id.to_string()));
        }
        let file: GatewayFile = response
            .error_for_status()
            .map_err(|e| DriveError::Api(e.to_string()))?
            .json()
            .await
            .map_err(|e| DriveError::Api(e.to_string()))?;
        Ok(PackageDescriptor {
            remote_id: file.id,
            name: file.name,
            size_bytes: file.size,
            remote_mtime: file.modified_time,
            mime: file.mime_type,
        })
    }

    async fn fetch_chunk(
        &self,
        remote_id: &str,
        offset: u64,
        max_len: u64,
    ) -> Result<Vec<u8>, DriveError> {
        if max_len == 0 {
            return Ok(Vec::new());
        }
        let url = self.url(&format!("files/{remote_id}/content"));
        let range = format!("bytes={}-{}", offset, offset + max_len - 1);
        let response = self
            .http
            .get(&url)
            .header(reqwest::header::RANGE, range)
            .send()
            .await
            .map_err(|e| DriveError::Api(e.to_string()))?;
        if response.status() == reqwest::StatusCode::RANGE_NOT_SATISFIABLE {
            return Ok(Vec::new());
        }
        let bytes = response
            .error_for_status()
            .map_err(|e| DriveError::Api(e.to_string()))?
            .bytes()
            .await
            .map_err(|e| DriveError::Api(e.to_string()))?;
        Ok(bytes.to_vec())
    }

    async fn ping(&self) -> Result<(), DriveError> {
        self.http
            .get(self.url("healthz"))
            .send()
            .await
            .and_then(|r| r.error_for_status())
            .map_err(|e| DriveError::Api(e.to_string()))?;
        Ok(())
    }
}
