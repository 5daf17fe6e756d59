//! SearchBackup controller
//!
//! Reconciles SearchBackup objects: decides when a new backup run is
//! due, advances the open run through the cluster's asynchronous backup
//! API, and bounds the retained history once a run completes.
//!
//! Each reconciliation folds (previous status, desired spec, external
//! responses) into a fresh status value; nothing is mutated in place
//! across invocations, and the kube runtime guarantees one invocation
//! per object at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
use kube::runtime::controller::Action;
use kube::{Resource, ResourceExt};
use tracing::{debug, info, warn};

use searchops_common::crd::{
    BackupRunStatus, CollectionBackupStatus, SearchBackup, SearchBackupSpec, SearchBackupStatus,
    DEFAULT_MAX_SAVED,
};
use searchops_common::kube_utils::patch_resource_status;
use searchops_common::{
    Error, REQUEUE_ERROR_SECS, REQUEUE_IN_PROGRESS_SECS, REQUEUE_SUCCESS_SECS,
    SEARCHOPS_SYSTEM_NAMESPACE,
};

use crate::cluster_api::{ClusterApi, ClusterApiFactory};
use crate::recurrence::Schedule;
use crate::retention;
use crate::run::{advance_run, RunScope};

/// Field manager for status patches issued by this controller
const FIELD_MANAGER: &str = "searchops-backup-controller";

/// Shared state for the SearchBackup controller
pub struct Context {
    /// Kubernetes client
    pub client: kube::Client,
    /// Builds the cluster API endpoint for each referenced SearchCloud
    pub api_factory: Arc<dyn ClusterApiFactory>,
}

impl Context {
    /// Create a controller context
    pub fn new(client: kube::Client, api_factory: Arc<dyn ClusterApiFactory>) -> Self {
        Self {
            client,
            api_factory,
        }
    }
}

/// What one orchestration pass produced
pub struct Orchestration {
    /// The status to persist
    pub status: SearchBackupStatus,
    /// Whether a run is still open after this pass
    pub run_in_progress: bool,
    /// An error to surface once the status is persisted
    pub error: Option<Error>,
}

/// Reconcile a SearchBackup
pub async fn reconcile(backup: Arc<SearchBackup>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = backup.name_any();
    let namespace = backup
        .namespace()
        .unwrap_or_else(|| SEARCHOPS_SYSTEM_NAMESPACE.to_string());

    info!(backup = %name, "reconciling SearchBackup");

    let mut spec = backup.spec.clone();
    spec.with_defaults();

    let api = ctx.api_factory.for_cluster(&spec.cluster, &namespace);
    let previous = backup.status.clone().unwrap_or_default();
    let created = backup
        .meta()
        .creation_timestamp
        .as_ref()
        .map(|t| t.0)
        .unwrap_or_else(Utc::now);
    let now = Utc::now();

    let outcome = orchestrate(&name, &spec, previous, created, api.as_ref(), now).await;

    if backup.status.as_ref() != Some(&outcome.status) {
        patch_resource_status::<SearchBackup, _>(
            &ctx.client,
            &name,
            &namespace,
            &outcome.status,
            FIELD_MANAGER,
        )
        .await?;
    } else {
        debug!(backup = %name, "status unchanged, skipping update");
    }

    if let Some(error) = outcome.error {
        return Err(error);
    }

    Ok(Action::requeue(requeue_interval(&outcome, now)))
}

/// Decide how the controller reacts to a reconciliation error.
///
/// Retryable errors come back quickly; configuration errors (a schedule
/// that will stay broken until the user edits it) wait for the regular
/// cadence or the next spec change.
pub fn error_policy(backup: Arc<SearchBackup>, error: &Error, _ctx: Arc<Context>) -> Action {
    warn!(backup = %backup.name_any(), error = %error, "reconciliation failed");
    let secs = if error.is_retryable() {
        REQUEUE_ERROR_SECS
    } else {
        REQUEUE_SUCCESS_SECS
    };
    Action::requeue(Duration::from_secs(secs))
}

/// One orchestration pass over a single SearchBackup.
///
/// Pure with respect to Kubernetes: all state comes in as arguments and
/// the new status is returned; the only side effects are calls on the
/// cluster API. External-call failures while a run is open are recorded
/// against the affected collections and the pass still completes.
pub async fn orchestrate(
    name: &str,
    spec: &SearchBackupSpec,
    previous: SearchBackupStatus,
    created: DateTime<Utc>,
    api: &dyn ClusterApi,
    now: DateTime<Utc>,
) -> Orchestration {
    let mut status = previous;
    let mut error = None;

    // A run flagged finished while a collection is not violates the run
    // machine's invariants; reject the status untouched rather than
    // schedule over it.
    if let Some(run) = &status.current {
        if run.finished && !run.all_collections_finished() {
            let error = Error::inconsistent_state(
                name,
                format!(
                    "run {} is marked finished but has unfinished collections",
                    run.sequence
                ),
            );
            return Orchestration {
                run_in_progress: false,
                status,
                error: Some(error),
            };
        }
    }

    // Parse the schedule once. A malformed expression is surfaced and
    // nothing new is ever scheduled until it is corrected; a run already
    // open still advances below.
    let schedule = match &spec.recurrence {
        Some(recurrence) => match Schedule::parse(&recurrence.schedule) {
            Ok(schedule) => Some(schedule),
            Err(e) => {
                error = Some(Error::invalid_schedule(name, e.to_string()));
                None
            }
        },
        None => None,
    };
    let schedule_broken = spec.recurrence.is_some() && schedule.is_none();

    let mut freshly_finished = false;
    let open_run = status.current.as_ref().is_some_and(|r| !r.finished);

    if open_run {
        // Disabling recurrence never affects a run already in progress.
        if let Some(run) = status.current.as_mut() {
            let scope = RunScope {
                backup_name: name,
                repository: spec.repository(),
                location: spec.location(),
                sequence: run.sequence,
            };
            match advance_run(run, api, &scope, now).await {
                Ok(finished) => freshly_finished = finished,
                Err(e) => error = Some(e),
            }
        }
    } else if !schedule_broken && due_for_new_run(spec, &status, schedule.as_ref(), created, now) {
        match start_run(name, spec, &status, api, now).await {
            Ok(mut run) => {
                info!(
                    backup = %name,
                    sequence = run.sequence,
                    collections = run.collections.len(),
                    "starting backup run"
                );
                let scope = RunScope {
                    backup_name: name,
                    repository: spec.repository(),
                    location: spec.location(),
                    sequence: run.sequence,
                };
                // Issue the start calls in the same pass that creates
                // the run; progress is observed on later passes.
                match advance_run(&mut run, api, &scope, now).await {
                    Ok(finished) => freshly_finished = finished,
                    Err(e) => error = Some(e),
                }
                status.current = Some(run);
            }
            Err(e) => {
                // Nothing was recorded; the next invocation retries.
                warn!(backup = %name, error = %e, "could not start backup run");
                error = Some(e);
            }
        }
    }

    if freshly_finished {
        if let Some(run) = status.current.clone() {
            status.history.push(run);
        }
        let max_saved = spec
            .recurrence
            .as_ref()
            .map(|r| r.max_saved)
            .unwrap_or(DEFAULT_MAX_SAVED)
            .max(1);
        let (kept, evicted) = retention::trim(std::mem::take(&mut status.history), max_saved);
        status.history = kept;
        retention::evict_artifacts(&evicted, api, name, spec.repository(), spec.location()).await;
    }

    status.next_scheduled_time = match &schedule {
        Some(schedule) if spec.recurrence_enabled() => {
            let reference = status
                .current
                .as_ref()
                .map(|run| run.start_time.0)
                .unwrap_or(created);
            schedule.next_after(reference).map(Time)
        }
        _ => None,
    };

    let run_in_progress = status.current.as_ref().is_some_and(|r| !r.finished);
    Orchestration {
        status,
        run_in_progress,
        error,
    }
}

/// Whether a new run should start now.
///
/// Without a recurrence policy the request is one-shot: a single run is
/// due immediately and never again. With one, the schedule decides,
/// referenced from the previous run's start time (or the object's
/// creation time before any run exists), unless recurrence is disabled.
fn due_for_new_run(
    spec: &SearchBackupSpec,
    status: &SearchBackupStatus,
    schedule: Option<&Schedule>,
    created: DateTime<Utc>,
    now: DateTime<Utc>,
) -> bool {
    let never_ran = status.current.is_none() && status.history.is_empty();

    let Some(recurrence) = &spec.recurrence else {
        return never_ran;
    };
    if !recurrence.is_enabled() {
        return false;
    }
    let Some(schedule) = schedule else {
        return false;
    };

    let reference = status
        .current
        .as_ref()
        .map(|run| run.start_time.0)
        .unwrap_or(created);
    schedule.is_due(reference, now)
}

/// Create a new run over the collection set in scope right now.
///
/// The set is fixed here: spec edits made while the run is open only
/// affect the next run.
async fn start_run(
    name: &str,
    spec: &SearchBackupSpec,
    status: &SearchBackupStatus,
    api: &dyn ClusterApi,
    now: DateTime<Utc>,
) -> Result<BackupRunStatus, Error> {
    let collections = if spec.collections.is_empty() {
        api.list_collections()
            .await
            .map_err(|e| Error::external_call(name, "listCollections", e.to_string()))?
    } else {
        spec.collections.clone()
    };

    let cluster_version = api
        .cluster_version()
        .await
        .map_err(|e| Error::external_call(name, "clusterVersion", e.to_string()))?;

    Ok(BackupRunStatus {
        sequence: next_sequence(status),
        cluster_version,
        start_time: Time(now),
        finish_time: None,
        successful: None,
        finished: false,
        collections: collections
            .into_iter()
            .map(CollectionBackupStatus::new)
            .collect(),
    })
}

fn next_sequence(status: &SearchBackupStatus) -> u64 {
    let newest = status
        .current
        .iter()
        .chain(status.history.iter())
        .map(|run| run.sequence)
        .max()
        .unwrap_or(0);
    newest + 1
}

/// How long to wait before the next reconciliation.
///
/// An open run is polled on a short cadence; otherwise we sleep until
/// the next scheduled trigger, capped at the regular interval.
fn requeue_interval(outcome: &Orchestration, now: DateTime<Utc>) -> Duration {
    if outcome.run_in_progress {
        return Duration::from_secs(REQUEUE_IN_PROGRESS_SECS);
    }
    if let Some(next) = &outcome.status.next_scheduled_time {
        let until = (next.0 - now)
            .num_seconds()
            .clamp(1, REQUEUE_SUCCESS_SECS as i64);
        return Duration::from_secs(until as u64);
    }
    Duration::from_secs(REQUEUE_SUCCESS_SECS)
}
