//! Bounded retention of completed backup runs
//!
//! Once a run completes, history may exceed the recurrence's `maxSaved`;
//! the oldest runs are then dropped from the status record and their
//! artifacts deleted from the external store. Artifact deletion is best
//! effort: a failed delete is logged and the run is removed from history
//! anyway, trading an orphaned artifact for a control loop that keeps
//! scheduling.

use tracing::{debug, warn};

use searchops_common::crd::BackupRunStatus;

use crate::cluster_api::ClusterApi;
use crate::run::run_id;

/// Split `history` into the runs to keep and the oldest excess runs.
///
/// Keeps the `max_saved` most recent runs by start time, with equal
/// start times broken by the sequence number assigned at run creation.
/// Both returned lists are ordered oldest first.
pub fn trim(
    mut history: Vec<BackupRunStatus>,
    max_saved: u32,
) -> (Vec<BackupRunStatus>, Vec<BackupRunStatus>) {
    history.sort_by_key(|run| (run.start_time.0, run.sequence));

    let excess = history.len().saturating_sub(max_saved as usize);
    let kept = history.split_off(excess);
    (kept, history)
}

/// Delete the artifacts of evicted runs from the external store.
///
/// Failures are reported but never propagated; the next eviction of the
/// same artifact id would be a cluster-side no-op anyway.
pub async fn evict_artifacts(
    evicted: &[BackupRunStatus],
    api: &dyn ClusterApi,
    backup_name: &str,
    repository: &str,
    location: &str,
) {
    for run in evicted {
        let id = run_id(backup_name, run.sequence);
        match api.delete_backup(repository, location, &id).await {
            Ok(()) => {
                debug!(backup = %backup_name, artifact = %id, "evicted backup artifact");
            }
            Err(e) => {
                warn!(
                    backup = %backup_name,
                    artifact = %id,
                    error = %e,
                    "failed to delete evicted backup artifact; leaving it orphaned"
                );
            }
        }
    }
}
