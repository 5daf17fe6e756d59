//! SearchBackup Custom Resource Definition
//!
//! The SearchBackup CRD requests point-in-time backups of one or more
//! collections of a SearchCloud cluster, optionally on a recurring
//! schedule with bounded retention. The controller drives each run
//! through the cluster's asynchronous backup API and records progress in
//! the status subresource.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Volume;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Repository used when the spec names none: the auto-configured
/// repository for legacy singleton volumes.
pub const DEFAULT_REPOSITORY: &str = "legacy-local-repository";

/// Number of recurring backup points kept when the spec names no limit
pub const DEFAULT_MAX_SAVED: u32 = 5;

fn default_max_saved() -> u32 {
    DEFAULT_MAX_SAVED
}

/// Recurrence configuration for a SearchBackup
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRecurrence {
    /// Perform a backup on the given schedule.
    ///
    /// Multiple syntaxes are supported:
    ///   - Standard 5-field cron (e.g. "0 6 * * *", optionally prefixed
    ///     with "CRON_TZ=UTC ")
    ///   - Predefined schedules ("@yearly", "@weekly", "@daily", ...)
    ///   - Intervals (e.g. "@every 10h30m")
    pub schedule: String,

    /// The number of backup points to save for this backup at any given
    /// time. The oldest backups are deleted if too many exist when a
    /// backup is taken. Defaults to 5.
    #[serde(default = "default_max_saved")]
    pub max_saved: u32,

    /// Disable the recurring backups. This does not affect a
    /// currently-running backup.
    #[serde(default)]
    pub disabled: bool,
}

impl BackupRecurrence {
    /// Whether this recurrence should create new runs
    pub fn is_enabled(&self) -> bool {
        !self.disabled
    }
}

/// Deprecated persistence configuration.
///
/// Persisting backup data out of the cluster was removed; any options
/// specified here are accepted for compatibility but never acted upon.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct PersistenceSource {
    /// Persist to an S3 compatible endpoint
    #[serde(default, skip_serializing_if = "Option::is_none", rename = "S3")]
    pub s3: Option<S3PersistenceSource>,

    /// Persist to a volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub volume: Option<VolumePersistenceSource>,
}

/// Deprecated S3 persistence settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct S3PersistenceSource {
    /// The S3 compatible endpoint URL
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<String>,

    /// The default AWS region
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub region: Option<String>,

    /// The S3 bucket to store/find the backup data
    pub bucket: String,

    /// The key for the tarred & zipped backup file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
}

/// Deprecated volume persistence settings
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VolumePersistenceSource {
    /// The volume for persistence
    pub source: Volume,

    /// The location of the persistence directory within the volume
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,

    /// The filename of the tarred & zipped backup file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
}

/// Progress of one collection's backup within a run.
///
/// Modeled as a tagged state so that invalid combinations (a success
/// flag on an unfinished backup, a missing job id on a running one)
/// cannot be represented.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(tag = "phase", rename_all = "camelCase")]
pub enum CollectionProgress {
    /// Backup has not been submitted to the cluster yet
    #[default]
    Pending,

    /// Backup was submitted; the cluster is working on it
    #[serde(rename_all = "camelCase")]
    Running {
        /// Identifier of the asynchronous job in the cluster
        job_id: String,
        /// Time the backup request was submitted
        start_time: Time,
    },

    /// Backup reached a terminal outcome; never re-polled
    #[serde(rename_all = "camelCase")]
    Finished {
        /// Whether the collection backup succeeded
        success: bool,
        /// Time the backup request was submitted
        start_time: Time,
        /// Time the terminal outcome was observed
        finish_time: Time,
    },
}

impl CollectionProgress {
    /// Whether this collection reached a terminal outcome
    pub fn is_finished(&self) -> bool {
        matches!(self, CollectionProgress::Finished { .. })
    }

    /// The terminal outcome, if one was reached
    pub fn succeeded(&self) -> Option<bool> {
        match self {
            CollectionProgress::Finished { success, .. } => Some(*success),
            _ => None,
        }
    }

    /// The async job id, while the backup is running
    pub fn job_id(&self) -> Option<&str> {
        match self {
            CollectionProgress::Running { job_id, .. } => Some(job_id),
            _ => None,
        }
    }
}

/// Status of one collection's backup within a run
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct CollectionBackupStatus {
    /// Collection name
    pub collection: String,

    /// Where this collection's backup currently stands
    #[serde(default)]
    pub progress: CollectionProgress,
}

impl CollectionBackupStatus {
    /// A fresh, not-yet-submitted entry for the named collection
    pub fn new(collection: impl Into<String>) -> Self {
        Self {
            collection: collection.into(),
            progress: CollectionProgress::Pending,
        }
    }
}

/// Observed state of a single backup run.
///
/// The collection set is fixed when the run is created; entries are
/// advanced independently and the run-level flags are derived only once
/// every collection has a terminal outcome.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BackupRunStatus {
    /// Monotonically increasing run number for this SearchBackup,
    /// assigned at creation. Breaks retention-ordering ties between runs
    /// with equal start times.
    pub sequence: u64,

    /// Version of the search cluster being backed up
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub cluster_version: String,

    /// The time this run was initiated
    pub start_time: Time,

    /// The time this run finished
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finish_time: Option<Time>,

    /// Whether the whole run succeeded; unset while the run is open
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub successful: Option<bool>,

    /// Whether the run has finished
    #[serde(default)]
    pub finished: bool,

    /// Per-collection backup progress
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<CollectionBackupStatus>,
}

impl BackupRunStatus {
    /// Whether every collection in this run reached a terminal outcome
    pub fn all_collections_finished(&self) -> bool {
        self.collections.iter().all(|c| c.progress.is_finished())
    }

    /// Logical AND across all collection outcomes.
    ///
    /// Only meaningful once `all_collections_finished()` holds.
    pub fn collections_successful(&self) -> bool {
        self.collections
            .iter()
            .all(|c| c.progress.succeeded() == Some(true))
    }
}

/// Observed state of a SearchBackup
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SearchBackupStatus {
    /// The current (most recent) backup run
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current: Option<BackupRunStatus>,

    /// The scheduled time for the next backup to occur
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_scheduled_time: Option<Time>,

    /// Completed runs retained for this backup, oldest first, bounded by
    /// the recurrence's maxSaved
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub history: Vec<BackupRunStatus>,
}

/// Specification for a SearchBackup
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "searchops.dev",
    version = "v1beta1",
    kind = "SearchBackup",
    plural = "searchbackups",
    shortname = "sb",
    namespaced,
    status = "SearchBackupStatus",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.cluster"}"#,
    printcolumn = r#"{"name":"Started","type":"date","jsonPath":".status.current.startTime"}"#,
    printcolumn = r#"{"name":"Finished","type":"boolean","jsonPath":".status.current.finished"}"#,
    printcolumn = r#"{"name":"Successful","type":"boolean","jsonPath":".status.current.successful"}"#,
    printcolumn = r#"{"name":"NextBackup","type":"string","jsonPath":".status.nextScheduledTime"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SearchBackupSpec {
    /// Name of the SearchCloud cluster to back up (DNS-1123 label)
    pub cluster: String,

    /// The repository to use for the backup. Defaults to
    /// "legacy-local-repository" if not specified.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub repository_name: Option<String>,

    /// The collections to back up. Empty means every collection known to
    /// the cluster at run time.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub collections: Vec<String>,

    /// The location to store the backup in within the repository
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub location: Option<String>,

    /// Take this backup recurrently, with scheduling and retention
    /// options. Absent means one-shot: exactly one run is ever created.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub recurrence: Option<BackupRecurrence>,

    /// Deprecated: persisting backup data was removed. Any options
    /// specified here are cleared on defaulting and never used.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub persistence: Option<PersistenceSource>,
}

impl SearchBackupSpec {
    /// Apply defaults, returning whether anything changed.
    ///
    /// The deprecated persistence block is removed here so the rest of
    /// the controller never has to branch on it.
    pub fn with_defaults(&mut self) -> bool {
        let mut changed = false;
        if self.persistence.is_some() {
            self.persistence = None;
            changed = true;
        }
        changed
    }

    /// The repository to back up into, defaulted
    pub fn repository(&self) -> &str {
        self.repository_name.as_deref().unwrap_or(DEFAULT_REPOSITORY)
    }

    /// The storage location within the repository, empty if unset
    pub fn location(&self) -> &str {
        self.location.as_deref().unwrap_or_default()
    }

    /// Whether recurrence is configured and enabled
    pub fn recurrence_enabled(&self) -> bool {
        self.recurrence.as_ref().is_some_and(|r| r.is_enabled())
    }
}

impl SearchBackup {
    /// Apply defaults, returning whether anything changed
    pub fn with_defaults(&mut self) -> bool {
        self.spec.with_defaults()
    }

    /// Labels shared by every resource created for this backup
    pub fn shared_labels(&self) -> BTreeMap<String, String> {
        let mut labels = BTreeMap::new();
        labels.insert(
            crate::LABEL_BACKUP.to_string(),
            self.metadata.name.clone().unwrap_or_default(),
        );
        labels.insert(
            crate::LABEL_MANAGED_BY.to_string(),
            crate::LABEL_MANAGED_BY_SEARCHOPS.to_string(),
        );
        labels
    }
}
