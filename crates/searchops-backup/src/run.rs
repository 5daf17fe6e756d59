//! Backup run state machine
//!
//! One backup run covers a set of collections fixed at run creation.
//! Each collection advances independently through
//! `Pending -> Running -> Finished` against the cluster API; the
//! run-level outcome is derived in the same pass that observes the last
//! collection reaching a terminal state, and never before.
//!
//! Nothing here blocks or retries internally. A stuck collection stays
//! `Running` and is re-polled on whatever cadence the controller is
//! invoked with.

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use tracing::{debug, info, warn};

use searchops_common::crd::{BackupRunStatus, CollectionProgress};
use searchops_common::Error;

use crate::cluster_api::{BackupJobState, ClusterApi};

/// Identity and placement of one run's backups in the external store
#[derive(Debug, Clone)]
pub struct RunScope<'a> {
    /// Name of the owning SearchBackup
    pub backup_name: &'a str,
    /// Repository the backups are written to
    pub repository: &'a str,
    /// Location within the repository
    pub location: &'a str,
    /// Sequence number of the run
    pub sequence: u64,
}

impl RunScope<'_> {
    /// Identifier of this run's artifacts in the external store
    pub fn run_id(&self) -> String {
        run_id(self.backup_name, self.sequence)
    }
}

/// Artifact identifier for a run of the named backup
pub fn run_id(backup_name: &str, sequence: u64) -> String {
    format!("{backup_name}-{sequence}")
}

/// Advance every unfinished collection of `run` by one step.
///
/// Issues at most one API call per unfinished collection and returns
/// without waiting for job completion; progress is observed on the next
/// invocation. When the pass leaves every collection terminal, the
/// run-level `finished`/`successful`/`finish_time` fields are set
/// together.
///
/// Returns whether this call freshly finished the run. Calling on an
/// already-finished run is a no-op; a run flagged finished while a
/// collection is not is rejected as inconsistent.
pub async fn advance_run(
    run: &mut BackupRunStatus,
    api: &dyn ClusterApi,
    scope: &RunScope<'_>,
    now: DateTime<Utc>,
) -> Result<bool, Error> {
    if run.finished {
        if !run.all_collections_finished() {
            return Err(Error::inconsistent_state(
                scope.backup_name,
                format!(
                    "run {} is marked finished but has unfinished collections",
                    run.sequence
                ),
            ));
        }
        return Ok(false);
    }

    for entry in &mut run.collections {
        if !entry.progress.is_finished() {
            entry.progress =
                step_collection(&entry.collection, &entry.progress, api, scope, now).await;
        }
    }

    if run.all_collections_finished() {
        let successful = run.collections_successful();
        run.finished = true;
        run.successful = Some(successful);
        run.finish_time = Some(Time(now));
        info!(
            backup = %scope.backup_name,
            sequence = run.sequence,
            successful,
            "backup run finished"
        );
        return Ok(true);
    }

    Ok(false)
}

/// One step of a single collection's backup.
///
/// Submission failures are terminal for the collection within this run;
/// poll transport failures are not: the entry stays `Running` and is
/// polled again on the next invocation.
async fn step_collection(
    collection: &str,
    progress: &CollectionProgress,
    api: &dyn ClusterApi,
    scope: &RunScope<'_>,
    now: DateTime<Utc>,
) -> CollectionProgress {
    match progress {
        CollectionProgress::Pending => {
            match api
                .start_backup(collection, scope.repository, scope.location, &scope.run_id())
                .await
            {
                Ok(job_id) => {
                    debug!(
                        backup = %scope.backup_name,
                        collection = %collection,
                        job_id = %job_id,
                        "collection backup started"
                    );
                    CollectionProgress::Running {
                        job_id,
                        start_time: Time(now),
                    }
                }
                Err(e) => {
                    warn!(
                        backup = %scope.backup_name,
                        collection = %collection,
                        error = %e,
                        "failed to start collection backup"
                    );
                    CollectionProgress::Finished {
                        success: false,
                        start_time: Time(now),
                        finish_time: Time(now),
                    }
                }
            }
        }
        CollectionProgress::Running { job_id, start_time } => {
            match api.poll_backup(job_id).await {
                Ok(BackupJobState::Running) => progress.clone(),
                Ok(BackupJobState::Succeeded) => {
                    debug!(
                        backup = %scope.backup_name,
                        collection = %collection,
                        "collection backup succeeded"
                    );
                    CollectionProgress::Finished {
                        success: true,
                        start_time: start_time.clone(),
                        finish_time: Time(now),
                    }
                }
                Ok(BackupJobState::Failed { message }) => {
                    warn!(
                        backup = %scope.backup_name,
                        collection = %collection,
                        message = %message,
                        "collection backup failed"
                    );
                    CollectionProgress::Finished {
                        success: false,
                        start_time: start_time.clone(),
                        finish_time: Time(now),
                    }
                }
                Err(e) => {
                    // Transient poll failure: keep the entry running and
                    // let the next reconciliation try again
                    warn!(
                        backup = %scope.backup_name,
                        collection = %collection,
                        error = %e,
                        "failed to poll collection backup"
                    );
                    progress.clone()
                }
            }
        }
        CollectionProgress::Finished { .. } => progress.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockClusterApi;
    use chrono::TimeZone;
    use searchops_common::crd::CollectionBackupStatus;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    fn scope(sequence: u64) -> RunScope<'static> {
        RunScope {
            backup_name: "nightly",
            repository: "s3-main",
            location: "backups",
            sequence,
        }
    }

    fn two_collection_run() -> BackupRunStatus {
        BackupRunStatus {
            sequence: 1,
            cluster_version: "9.4.0".to_string(),
            start_time: Time(at(0)),
            finish_time: None,
            successful: None,
            finished: false,
            collections: vec![
                CollectionBackupStatus::new("products"),
                CollectionBackupStatus::new("reviews"),
            ],
        }
    }

    #[tokio::test]
    async fn test_pending_collections_get_started() {
        let api = MockClusterApi::new(["products", "reviews"]);
        let mut run = two_collection_run();

        let finished = advance_run(&mut run, &api, &scope(1), at(10)).await.unwrap();
        assert!(!finished);
        assert!(!run.finished);

        for entry in &run.collections {
            assert!(entry.progress.job_id().is_some());
        }
        assert_eq!(
            api.started(),
            vec![
                ("products".to_string(), "nightly-1".to_string()),
                ("reviews".to_string(), "nightly-1".to_string()),
            ]
        );
    }

    #[tokio::test]
    async fn test_running_collection_is_repolled_until_terminal() {
        let api = MockClusterApi::new(["products"]);
        let mut run = BackupRunStatus {
            collections: vec![CollectionBackupStatus::new("products")],
            ..two_collection_run()
        };

        advance_run(&mut run, &api, &scope(1), at(10)).await.unwrap();
        let job_id = run.collections[0].progress.job_id().unwrap().to_string();

        // Still running: repeated advances change nothing
        for _ in 0..3 {
            let finished = advance_run(&mut run, &api, &scope(1), at(20)).await.unwrap();
            assert!(!finished);
            assert_eq!(run.collections[0].progress.job_id(), Some(job_id.as_str()));
        }

        api.set_poll(&job_id, BackupJobState::Succeeded);
        let finished = advance_run(&mut run, &api, &scope(1), at(30)).await.unwrap();
        assert!(finished);
        assert!(run.finished);
        assert_eq!(run.successful, Some(true));
        assert_eq!(run.finish_time, Some(Time(at(30))));
    }

    #[tokio::test]
    async fn test_failed_submit_is_terminal_for_the_collection() {
        let api = MockClusterApi::new(["products", "reviews"]);
        api.fail_start_of("reviews");
        let mut run = two_collection_run();

        advance_run(&mut run, &api, &scope(1), at(10)).await.unwrap();

        let reviews = &run.collections[1];
        assert!(reviews.progress.is_finished());
        assert_eq!(reviews.progress.succeeded(), Some(false));
        assert!(!run.finished, "run stays open while products is running");

        // Finish the healthy collection; the run closes as unsuccessful
        let job_id = run.collections[0].progress.job_id().unwrap().to_string();
        api.set_poll(&job_id, BackupJobState::Succeeded);
        let finished = advance_run(&mut run, &api, &scope(1), at(20)).await.unwrap();
        assert!(finished);
        assert_eq!(run.successful, Some(false));
        assert_eq!(run.collections[0].progress.succeeded(), Some(true));

        // The failed collection was never re-submitted
        assert_eq!(api.started().len(), 1);
    }

    #[tokio::test]
    async fn test_poll_transport_error_keeps_collection_running() {
        let api = MockClusterApi::new(["products"]);
        let mut run = BackupRunStatus {
            collections: vec![CollectionBackupStatus::new("products")],
            ..two_collection_run()
        };

        advance_run(&mut run, &api, &scope(1), at(10)).await.unwrap();
        let job_id = run.collections[0].progress.job_id().unwrap().to_string();

        api.fail_poll_of(&job_id);
        let finished = advance_run(&mut run, &api, &scope(1), at(20)).await.unwrap();
        assert!(!finished);
        assert_eq!(run.collections[0].progress.job_id(), Some(job_id.as_str()));

        // Once the cluster answers again, the run completes
        api.recover_poll_of(&job_id);
        api.set_poll(&job_id, BackupJobState::Succeeded);
        let finished = advance_run(&mut run, &api, &scope(1), at(30)).await.unwrap();
        assert!(finished);
        assert_eq!(run.successful, Some(true));
    }

    #[tokio::test]
    async fn test_cluster_reported_failure_fails_the_run() {
        let api = MockClusterApi::new(["products"]);
        let mut run = BackupRunStatus {
            collections: vec![CollectionBackupStatus::new("products")],
            ..two_collection_run()
        };

        advance_run(&mut run, &api, &scope(1), at(10)).await.unwrap();
        let job_id = run.collections[0].progress.job_id().unwrap().to_string();

        api.set_poll(
            &job_id,
            BackupJobState::Failed {
                message: "shard 2 unreachable".to_string(),
            },
        );
        let finished = advance_run(&mut run, &api, &scope(1), at(20)).await.unwrap();
        assert!(finished);
        assert_eq!(run.successful, Some(false));
        assert_eq!(run.collections[0].progress.succeeded(), Some(false));
    }

    #[tokio::test]
    async fn test_advance_on_finished_run_is_a_noop() {
        let api = MockClusterApi::new(["products"]);
        let mut run = BackupRunStatus {
            collections: vec![CollectionBackupStatus::new("products")],
            ..two_collection_run()
        };

        advance_run(&mut run, &api, &scope(1), at(10)).await.unwrap();
        let job_id = run.collections[0].progress.job_id().unwrap().to_string();
        api.set_poll(&job_id, BackupJobState::Succeeded);
        advance_run(&mut run, &api, &scope(1), at(20)).await.unwrap();
        assert!(run.finished);

        let snapshot = run.clone();
        let finished = advance_run(&mut run, &api, &scope(1), at(99)).await.unwrap();
        assert!(!finished);
        assert_eq!(run, snapshot);
        // No further API traffic for a finished run
        assert_eq!(api.poll_count(&job_id), 1);
    }

    #[tokio::test]
    async fn test_finished_flag_with_open_collection_is_rejected() {
        let api = MockClusterApi::new(["products"]);
        let mut run = two_collection_run();
        run.finished = true;

        let err = advance_run(&mut run, &api, &scope(1), at(10))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::InconsistentState { .. }));
    }

    #[tokio::test]
    async fn test_success_is_logical_and_over_collections() {
        let api = MockClusterApi::new(["a", "b", "c"]);
        let mut run = BackupRunStatus {
            collections: vec![
                CollectionBackupStatus::new("a"),
                CollectionBackupStatus::new("b"),
                CollectionBackupStatus::new("c"),
            ],
            ..two_collection_run()
        };

        advance_run(&mut run, &api, &scope(1), at(10)).await.unwrap();
        for entry in &run.collections {
            let job_id = entry.progress.job_id().unwrap().to_string();
            let state = if entry.collection == "b" {
                BackupJobState::Failed {
                    message: String::new(),
                }
            } else {
                BackupJobState::Succeeded
            };
            api.set_poll(&job_id, state);
        }

        let finished = advance_run(&mut run, &api, &scope(1), at(20)).await.unwrap();
        assert!(finished);
        assert_eq!(run.successful, Some(false));
    }
}
