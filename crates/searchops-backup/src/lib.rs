//! Recurring backup orchestration for SearchCloud clusters
//!
//! This crate is the core of the SearchOps backup operator:
//!
//! - **recurrence**: the schedule grammar (cron, presets, `@every`
//!   intervals) and its pure evaluator
//! - **cluster_api**: the capability set consumed from the cluster's
//!   admin API, plus the HTTP implementation
//! - **run**: the per-collection backup state machine and the run
//!   coordinator that folds collection outcomes into a run outcome
//! - **retention**: bounded run history with best-effort artifact
//!   cleanup
//! - **backup_controller**: the level-triggered reconciler tying the
//!   pieces together

pub mod backup_controller;
pub mod cluster_api;
pub mod recurrence;
pub mod retention;
pub mod run;

#[cfg(test)]
pub(crate) mod testing;
