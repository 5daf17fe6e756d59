//! Common types for the SearchOps operator: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod crd;
pub mod error;
pub mod kube_utils;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace for SearchOps system resources (operator, credentials)
pub const SEARCHOPS_SYSTEM_NAMESPACE: &str = "searchops-system";

/// Label key identifying which SearchBackup owns a resource
pub const LABEL_BACKUP: &str = "searchops.dev/backup";

/// Label key for the managing component
pub const LABEL_MANAGED_BY: &str = "app.kubernetes.io/managed-by";

/// Label value identifying resources managed by this operator
pub const LABEL_MANAGED_BY_SEARCHOPS: &str = "searchops-operator";

/// Requeue interval after a successful reconciliation with nothing in flight
pub const REQUEUE_SUCCESS_SECS: u64 = 300;

/// Requeue interval while a backup run is in progress
pub const REQUEUE_IN_PROGRESS_SECS: u64 = 15;

/// Requeue interval after a reconciliation error
pub const REQUEUE_ERROR_SECS: u64 = 60;
