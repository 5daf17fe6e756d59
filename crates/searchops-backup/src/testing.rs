//! Scripted cluster API for tests
//!
//! An in-memory [`ClusterApi`] whose responses the test controls:
//! which submissions fail, what each async job reports, which deletes
//! error. Every call is recorded so tests can assert on the traffic.

use std::collections::{HashMap, HashSet};
use std::sync::Mutex;

use async_trait::async_trait;

use crate::cluster_api::{ApiError, BackupJobState, BackupListEntry, ClusterApi};

#[derive(Default)]
struct MockState {
    fail_list_collections: bool,
    started: Vec<(String, String)>,
    poll_states: HashMap<String, BackupJobState>,
    poll_counts: HashMap<String, usize>,
    failing_starts: HashSet<String>,
    failing_polls: HashSet<String>,
    failing_deletes: HashSet<String>,
    deleted: Vec<String>,
    stored: Vec<BackupListEntry>,
}

pub(crate) struct MockClusterApi {
    version: String,
    collections: Vec<String>,
    auto_succeed: bool,
    state: Mutex<MockState>,
}

impl MockClusterApi {
    pub(crate) fn new<I, S>(collections: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            version: "9.4.0".to_string(),
            collections: collections.into_iter().map(Into::into).collect(),
            auto_succeed: false,
            state: Mutex::new(MockState::default()),
        }
    }

    /// Every polled job reports success immediately, for tests that only
    /// care about scheduling and retention
    pub(crate) fn auto_succeed(mut self) -> Self {
        self.auto_succeed = true;
        self
    }

    pub(crate) fn set_fail_list_collections(&self, fail: bool) {
        self.state.lock().unwrap().fail_list_collections = fail;
    }

    pub(crate) fn fail_start_of(&self, collection: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_starts
            .insert(collection.to_string());
    }

    pub(crate) fn fail_poll_of(&self, job_id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_polls
            .insert(job_id.to_string());
    }

    pub(crate) fn recover_poll_of(&self, job_id: &str) {
        self.state.lock().unwrap().failing_polls.remove(job_id);
    }

    pub(crate) fn fail_delete_of(&self, id: &str) {
        self.state
            .lock()
            .unwrap()
            .failing_deletes
            .insert(id.to_string());
    }

    pub(crate) fn set_poll(&self, job_id: &str, state: BackupJobState) {
        self.state
            .lock()
            .unwrap()
            .poll_states
            .insert(job_id.to_string(), state);
    }

    /// `(collection, run_id)` pairs in submission order
    pub(crate) fn started(&self) -> Vec<(String, String)> {
        self.state.lock().unwrap().started.clone()
    }

    pub(crate) fn poll_count(&self, job_id: &str) -> usize {
        self.state
            .lock()
            .unwrap()
            .poll_counts
            .get(job_id)
            .copied()
            .unwrap_or(0)
    }

    /// Deleted artifact ids in deletion order
    pub(crate) fn deleted(&self) -> Vec<String> {
        self.state.lock().unwrap().deleted.clone()
    }
}

#[async_trait]
impl ClusterApi for MockClusterApi {
    async fn cluster_version(&self) -> Result<String, ApiError> {
        Ok(self.version.clone())
    }

    async fn list_collections(&self) -> Result<Vec<String>, ApiError> {
        if self.state.lock().unwrap().fail_list_collections {
            return Err(ApiError::Transport("connection refused".to_string()));
        }
        Ok(self.collections.clone())
    }

    async fn start_backup(
        &self,
        collection: &str,
        _repository: &str,
        _location: &str,
        run_id: &str,
    ) -> Result<String, ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_starts.contains(collection) {
            return Err(ApiError::Transport("connection refused".to_string()));
        }
        state
            .started
            .push((collection.to_string(), run_id.to_string()));
        Ok(format!("{run_id}-{collection}"))
    }

    async fn poll_backup(&self, job_id: &str) -> Result<BackupJobState, ApiError> {
        let mut state = self.state.lock().unwrap();
        *state.poll_counts.entry(job_id.to_string()).or_insert(0) += 1;
        if state.failing_polls.contains(job_id) {
            return Err(ApiError::Transport("connection reset".to_string()));
        }
        if let Some(scripted) = state.poll_states.get(job_id) {
            return Ok(scripted.clone());
        }
        if self.auto_succeed {
            Ok(BackupJobState::Succeeded)
        } else {
            Ok(BackupJobState::Running)
        }
    }

    async fn list_backups(
        &self,
        _repository: &str,
        _location: &str,
    ) -> Result<Vec<BackupListEntry>, ApiError> {
        Ok(self.state.lock().unwrap().stored.clone())
    }

    async fn delete_backup(
        &self,
        _repository: &str,
        _location: &str,
        id: &str,
    ) -> Result<(), ApiError> {
        let mut state = self.state.lock().unwrap();
        if state.failing_deletes.contains(id) {
            return Err(ApiError::Rejected("404: no such backup".to_string()));
        }
        state.deleted.push(id.to_string());
        Ok(())
    }
}
