//! Search cluster administrative API
//!
//! The capability set the backup machinery consumes from a SearchCloud
//! cluster: trigger a collection backup, poll the asynchronous job it
//! returns, list stored backups, delete one. The wire format is
//! confined to this module; the rest of the crate only sees the
//! [`ClusterApi`] trait.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use thiserror::Error;

/// Port the in-cluster admin service listens on
const ADMIN_PORT: u16 = 8983;

/// Suffix of the common (load-balanced) service every SearchCloud exposes
const COMMON_SERVICE_SUFFIX: &str = "-searchcloud-common";

/// Default timeout for admin API calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// Errors from the cluster admin API
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request never produced a usable response
    #[error("request failed: {0}")]
    Transport(String),

    /// The cluster answered, but refused or could not satisfy the request
    #[error("cluster rejected the request: {0}")]
    Rejected(String),
}

/// State of an asynchronous backup job as reported by the cluster
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BackupJobState {
    /// The job is still running; poll again later
    Running,
    /// The job finished successfully
    Succeeded,
    /// The job finished unsuccessfully
    Failed {
        /// The cluster's failure message, if it gave one
        message: String,
    },
}

/// One stored backup within a repository location
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupListEntry {
    /// Identifier of the stored backup
    pub id: String,
    /// When the backup was taken
    pub timestamp: DateTime<Utc>,
}

/// The abstract capability set of the cluster's backup API.
///
/// Implementations must be safe to call repeatedly with the same
/// arguments; the controller re-issues calls on every reconciliation.
#[async_trait]
pub trait ClusterApi: Send + Sync {
    /// Version string of the cluster software
    async fn cluster_version(&self) -> Result<String, ApiError>;

    /// Names of every collection currently present in the cluster
    async fn list_collections(&self) -> Result<Vec<String>, ApiError>;

    /// Ask the cluster to back up one collection asynchronously.
    ///
    /// Returns the opaque job id to poll with.
    async fn start_backup(
        &self,
        collection: &str,
        repository: &str,
        location: &str,
        run_id: &str,
    ) -> Result<String, ApiError>;

    /// Report where an asynchronous backup job currently stands
    async fn poll_backup(&self, job_id: &str) -> Result<BackupJobState, ApiError>;

    /// List stored backups in a repository location, oldest first
    async fn list_backups(
        &self,
        repository: &str,
        location: &str,
    ) -> Result<Vec<BackupListEntry>, ApiError>;

    /// Delete one stored backup from a repository location
    async fn delete_backup(
        &self,
        repository: &str,
        location: &str,
        id: &str,
    ) -> Result<(), ApiError>;
}

/// Builds a [`ClusterApi`] for a named cluster.
///
/// The controller context holds one of these so tests can substitute a
/// mock implementation for the whole API surface.
pub trait ClusterApiFactory: Send + Sync {
    /// The API endpoint for the named SearchCloud in the given namespace
    fn for_cluster(&self, cluster: &str, namespace: &str) -> Arc<dyn ClusterApi>;
}

// =============================================================================
// HTTP implementation
// =============================================================================

#[derive(Debug, Deserialize)]
struct SystemInfoResponse {
    version: String,
}

#[derive(Debug, Deserialize)]
struct CollectionListResponse {
    collections: Vec<String>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct StartBackupResponse {
    request_id: String,
}

#[derive(Debug, Deserialize)]
struct JobStatusResponse {
    state: String,
    #[serde(default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct BackupListResponse {
    backups: Vec<BackupListItem>,
}

#[derive(Debug, Deserialize)]
struct BackupListItem {
    id: String,
    timestamp: DateTime<Utc>,
}

impl JobStatusResponse {
    fn into_state(self) -> Result<BackupJobState, ApiError> {
        match self.state.as_str() {
            "submitted" | "running" => Ok(BackupJobState::Running),
            "completed" => Ok(BackupJobState::Succeeded),
            "failed" => Ok(BackupJobState::Failed {
                message: self.message.unwrap_or_default(),
            }),
            "notfound" => Ok(BackupJobState::Failed {
                message: "async job not found in cluster".to_string(),
            }),
            other => Err(ApiError::Rejected(format!(
                "unknown async job state '{other}'"
            ))),
        }
    }
}

/// [`ClusterApi`] implementation over the cluster's HTTP admin endpoint
pub struct HttpClusterApi {
    base_url: String,
    http: reqwest::Client,
}

impl HttpClusterApi {
    /// Create an API client for the given base URL (no trailing slash)
    pub fn new(base_url: impl Into<String>, http: reqwest::Client) -> Self {
        Self {
            base_url: base_url.into(),
            http,
        }
    }

    async fn get_json<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<T, ApiError> {
        let url = format!("{}{}", self.base_url, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        Self::decode(response).await
    }

    async fn decode<T: serde::de::DeserializeOwned>(
        response: reqwest::Response,
    ) -> Result<T, ApiError> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Rejected(format!("{status}: {body}")));
        }
        response
            .json()
            .await
            .map_err(|e| ApiError::Transport(format!("invalid response body: {e}")))
    }
}

#[async_trait]
impl ClusterApi for HttpClusterApi {
    async fn cluster_version(&self) -> Result<String, ApiError> {
        let info: SystemInfoResponse = self.get_json("/admin/info/system").await?;
        Ok(info.version)
    }

    async fn list_collections(&self) -> Result<Vec<String>, ApiError> {
        let list: CollectionListResponse = self.get_json("/collections").await?;
        Ok(list.collections)
    }

    async fn start_backup(
        &self,
        collection: &str,
        repository: &str,
        location: &str,
        run_id: &str,
    ) -> Result<String, ApiError> {
        let url = format!("{}/collections/{}/backups", self.base_url, collection);
        let response = self
            .http
            .post(&url)
            .json(&serde_json::json!({
                "repository": repository,
                "location": location,
                "backupId": run_id,
            }))
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let started: StartBackupResponse = Self::decode(response).await?;
        Ok(started.request_id)
    }

    async fn poll_backup(&self, job_id: &str) -> Result<BackupJobState, ApiError> {
        let status: JobStatusResponse = self.get_json(&format!("/admin/async/{job_id}")).await?;
        status.into_state()
    }

    async fn list_backups(
        &self,
        repository: &str,
        location: &str,
    ) -> Result<Vec<BackupListEntry>, ApiError> {
        let path = format!("/backups?repository={repository}&location={location}");
        let list: BackupListResponse = self.get_json(&path).await?;
        let mut entries: Vec<BackupListEntry> = list
            .backups
            .into_iter()
            .map(|b| BackupListEntry {
                id: b.id,
                timestamp: b.timestamp,
            })
            .collect();
        entries.sort_by(|a, b| a.timestamp.cmp(&b.timestamp));
        Ok(entries)
    }

    async fn delete_backup(
        &self,
        repository: &str,
        location: &str,
        id: &str,
    ) -> Result<(), ApiError> {
        let url = format!(
            "{}/backups/{id}?repository={repository}&location={location}",
            self.base_url
        );
        let response = self
            .http
            .delete(&url)
            .send()
            .await
            .map_err(|e| ApiError::Transport(e.to_string()))?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(ApiError::Rejected(format!("{status}: {body}")));
        }
        Ok(())
    }
}

/// Factory addressing clusters through their in-cluster common service
pub struct HttpClusterApiFactory {
    http: reqwest::Client,
}

impl HttpClusterApiFactory {
    /// Build the factory and its shared HTTP client
    pub fn new() -> Result<Self, ApiError> {
        let http = reqwest::Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .map_err(|e| ApiError::Transport(format!("failed to build HTTP client: {e}")))?;
        Ok(Self { http })
    }

    fn base_url(cluster: &str, namespace: &str) -> String {
        format!("http://{cluster}{COMMON_SERVICE_SUFFIX}.{namespace}:{ADMIN_PORT}/api")
    }
}

impl ClusterApiFactory for HttpClusterApiFactory {
    fn for_cluster(&self, cluster: &str, namespace: &str) -> Arc<dyn ClusterApi> {
        Arc::new(HttpClusterApi::new(
            Self::base_url(cluster, namespace),
            self.http.clone(),
        ))
    }
}
