//! Error types for the SearchOps operator
//!
//! Errors are structured with fields to aid debugging in production.
//! Each variant carries the backup name it relates to where one is
//! available, plus the underlying cause.

use thiserror::Error;

/// Default context value when no specific context is available
pub const UNKNOWN_CONTEXT: &str = "unknown";

/// Main error type for SearchOps operations
#[derive(Debug, Error)]
pub enum Error {
    /// Kubernetes API error
    #[error("kubernetes error: {source}")]
    Kube {
        /// The underlying kube-rs error
        #[from]
        source: kube::Error,
    },

    /// A recurrence schedule expression that parses to no supported grammar
    #[error("invalid schedule for {backup}: {message}")]
    InvalidSchedule {
        /// Name of the backup with the malformed schedule
        backup: String,
        /// Description of what's wrong with the expression
        message: String,
    },

    /// Transient failure calling the search cluster's administrative API
    #[error("cluster API error [{operation}] for {backup}: {message}")]
    ExternalCall {
        /// Name of the backup the call was made for
        backup: String,
        /// The capability that failed (startBackup, pollBackup, listBackups, deleteBackup)
        operation: String,
        /// Description of what failed
        message: String,
    },

    /// Observed status that violates the run state machine's invariants
    ///
    /// Indicates a bug rather than an environmental failure. Callers must
    /// reject the state, never guess a repair.
    #[error("inconsistent state for {backup}: {message}")]
    InconsistentState {
        /// Name of the backup with the broken status
        backup: String,
        /// Description of the violated invariant
        message: String,
    },

    /// Validation error for CRD specs
    #[error("validation error for {backup}: {message}")]
    Validation {
        /// Name of the backup with invalid configuration
        backup: String,
        /// Description of what's invalid
        message: String,
    },

    /// Serialization/deserialization error
    #[error("serialization error: {message}")]
    Serialization {
        /// Description of what failed
        message: String,
        /// The resource kind being serialized (if known)
        kind: Option<String>,
    },
}

impl Error {
    /// Create an invalid-schedule error
    pub fn invalid_schedule(backup: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InvalidSchedule {
            backup: backup.into(),
            message: msg.into(),
        }
    }

    /// Create an external-call error for a named API capability
    pub fn external_call(
        backup: impl Into<String>,
        operation: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self::ExternalCall {
            backup: backup.into(),
            operation: operation.into(),
            message: msg.into(),
        }
    }

    /// Create an inconsistent-state error
    pub fn inconsistent_state(backup: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::InconsistentState {
            backup: backup.into(),
            message: msg.into(),
        }
    }

    /// Create a validation error with the given message
    ///
    /// For simple validation errors without backup context.
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation {
            backup: UNKNOWN_CONTEXT.to_string(),
            message: msg.into(),
        }
    }

    /// Create a validation error with backup context
    pub fn validation_for(backup: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Validation {
            backup: backup.into(),
            message: msg.into(),
        }
    }

    /// Create a serialization error with the given message
    pub fn serialization(msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: None,
        }
    }

    /// Create a serialization error with resource kind context
    pub fn serialization_for_kind(kind: impl Into<String>, msg: impl Into<String>) -> Self {
        Self::Serialization {
            message: msg.into(),
            kind: Some(kind.into()),
        }
    }

    /// Check if this error is retryable
    ///
    /// Schedule, validation, and serialization errors require a config or
    /// code fix and are not retryable. Inconsistent state indicates a bug
    /// and must not be retried into. External calls are transient by
    /// definition. Kubernetes errors depend on the status code.
    pub fn is_retryable(&self) -> bool {
        match self {
            Error::Kube { source } => {
                // Retry on transient K8s errors (connection, timeout)
                // Don't retry on 4xx errors (validation, not found, etc.)
                !matches!(
                    source,
                    kube::Error::Api(ae) if (400..500).contains(&ae.code)
                )
            }
            Error::InvalidSchedule { .. } => false,
            Error::ExternalCall { .. } => true,
            Error::InconsistentState { .. } => false,
            Error::Validation { .. } => false,
            Error::Serialization { .. } => false,
        }
    }

    /// Get the backup name if this error is associated with a specific backup
    pub fn backup(&self) -> Option<&str> {
        match self {
            Error::Kube { .. } => None,
            Error::InvalidSchedule { backup, .. } => Some(backup),
            Error::ExternalCall { backup, .. } => Some(backup),
            Error::InconsistentState { backup, .. } => Some(backup),
            Error::Validation { backup, .. } => Some(backup),
            Error::Serialization { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Story: a malformed recurrence expression never schedules a run
    ///
    /// When a user writes a schedule that parses to no supported grammar,
    /// the error names the backup and the problem, and the controller must
    /// not retry it into existence.
    #[test]
    fn story_invalid_schedule_is_not_retryable() {
        let err = Error::invalid_schedule("nightly", "expected 5 fields, got 3");
        assert!(err.to_string().contains("invalid schedule"));
        assert!(err.to_string().contains("nightly"));
        assert_eq!(err.backup(), Some("nightly"));
        assert!(!err.is_retryable());
    }

    /// Story: transient cluster API failures retry on the next reconcile
    #[test]
    fn story_external_call_failures_are_retryable() {
        let err = Error::external_call("nightly", "startBackup", "connection refused");
        assert!(err.to_string().contains("[startBackup]"));
        assert!(err.to_string().contains("connection refused"));
        assert!(err.is_retryable());

        let err = Error::external_call("nightly", "deleteBackup", "503 from cluster");
        assert!(err.is_retryable());
    }

    /// Story: broken status invariants are rejected, not repaired
    #[test]
    fn story_inconsistent_state_is_rejected() {
        let err = Error::inconsistent_state(
            "nightly",
            "run is finished but collection 'products' is not",
        );
        assert!(err.to_string().contains("inconsistent state"));
        assert_eq!(err.backup(), Some("nightly"));
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validation_default_context() {
        let err = Error::validation("empty cluster reference");
        match &err {
            Error::Validation { backup, .. } => assert_eq!(backup, UNKNOWN_CONTEXT),
            _ => panic!("Expected Validation variant"),
        }
        assert!(!err.is_retryable());
    }

    #[test]
    fn test_validation_for_backup() {
        let err = Error::validation_for("hourly", "maxSaved must be at least 1");
        assert_eq!(err.backup(), Some("hourly"));
        assert!(err.to_string().contains("hourly"));
    }

    #[test]
    fn test_serialization_with_kind() {
        let err = Error::serialization_for_kind("SearchBackup", "missing field 'spec'");
        match &err {
            Error::Serialization { kind, .. } => {
                assert_eq!(kind.as_deref(), Some("SearchBackup"));
            }
            _ => panic!("Expected Serialization variant"),
        }
        assert!(!err.is_retryable());
        assert_eq!(err.backup(), None);
    }

    #[test]
    fn test_error_construction_ergonomics() {
        let name = "backup-prod";
        let err = Error::external_call(name, "pollBackup", format!("job {} vanished", "req-7"));
        assert!(err.to_string().contains("backup-prod"));
        assert!(err.to_string().contains("req-7"));
    }
}
