//! Custom Resource Definitions for the SearchOps operator

mod backup;

pub use backup::{
    BackupRecurrence, BackupRunStatus, CollectionBackupStatus, CollectionProgress,
    PersistenceSource, S3PersistenceSource, SearchBackup, SearchBackupSpec, SearchBackupStatus,
    VolumePersistenceSource, DEFAULT_MAX_SAVED, DEFAULT_REPOSITORY,
};
