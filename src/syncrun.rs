//! Sync-run lifecycle
//!
//! A sync-run is the durable coordination record for one end-to-end
//! invocation of the pipeline: status, counters and an append-only error
//! log. The record transitions from running to exactly one terminal status;
//! [`SyncRunTracker::complete`] consumes the tracker so no mutation can
//! follow the transition.

use crate::store::SyncRunStore;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::debug;

/// Lifecycle states of a sync run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncRunStatus {
    Running,
    Completed,
    Failed,
    Partial,
}

impl SyncRunStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SyncRunStatus::Running => "running",
            SyncRunStatus::Completed => "completed",
            SyncRunStatus::Failed => "failed",
            SyncRunStatus::Partial => "partial",
        }
    }

    pub fn parse(s: &str) -> Self {
        match s {
            "completed" => SyncRunStatus::Completed,
            "failed" => SyncRunStatus::Failed,
            "partial" => SyncRunStatus::Partial,
            _ => SyncRunStatus::Running,
        }
    }

    /// Terminal states permit no further mutation
    pub fn is_terminal(&self) -> bool {
        !matches!(self, SyncRunStatus::Running)
    }
}

/// One entry in a run's error log
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SyncErrorEntry {
    pub repo: String,
    pub message: String,
    pub timestamp: DateTime<Utc>,
}

/// Durable record of one pipeline invocation
#[derive(Debug, Clone)]
pub struct SyncRun {
    pub id: i64,
    pub status: SyncRunStatus,
    pub sync_type: String,
    pub org_filter: Option<String>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub duration_ms: i64,
    pub repos_processed: i64,
    pub repos_failed: i64,
    pub last_processed_repo: String,
    pub errors: Vec<SyncErrorEntry>,
}

impl SyncRun {
    /// Fresh running record starting now
    pub fn new(sync_type: impl Into<String>, org_filter: Option<String>) -> Self {
        Self {
            id: 0,
            status: SyncRunStatus::Running,
            sync_type: sync_type.into(),
            org_filter,
            started_at: Utc::now(),
            completed_at: None,
            duration_ms: 0,
            repos_processed: 0,
            repos_failed: 0,
            last_processed_repo: String::new(),
            errors: Vec::new(),
        }
    }
}

/// Drives one run record through its lifecycle against the store
pub struct SyncRunTracker {
    store: Arc<dyn SyncRunStore>,
    run: SyncRun,
}

impl SyncRunTracker {
    /// Create and persist a running record
    pub fn start(
        store: Arc<dyn SyncRunStore>,
        sync_type: impl Into<String>,
        org_filter: Option<String>,
    ) -> Result<Self> {
        let mut run = SyncRun::new(sync_type, org_filter);
        run.id = store.create(&run).context("Failed to create sync run record")?;

        debug!("started sync run {}", run.id);
        Ok(Self { store, run })
    }

    pub fn run(&self) -> &SyncRun {
        &self.run
    }

    /// Mark a repository as processed and persist the counters
    pub fn mark_processed(&mut self, repo: &str) -> Result<()> {
        self.run.repos_processed += 1;
        self.run.last_processed_repo = repo.to_string();
        self.store
            .update(&self.run)
            .context("Failed to update sync run counters")
    }

    /// Append an error entry for a repository and persist
    pub fn record_error(&mut self, repo: &str, err: &anyhow::Error) -> Result<()> {
        self.run.errors.push(SyncErrorEntry {
            repo: repo.to_string(),
            message: format!("{:#}", err),
            timestamp: Utc::now(),
        });
        self.run.repos_failed += 1;
        self.run.last_processed_repo = repo.to_string();
        self.store
            .update(&self.run)
            .context("Failed to record sync run error")
    }

    /// Transition to a terminal status and persist; consumes the tracker
    pub fn complete(mut self, status: SyncRunStatus) -> Result<SyncRun> {
        let now = Utc::now();
        self.run.status = status;
        self.run.completed_at = Some(now);
        self.run.duration_ms = (now - self.run.started_at).num_milliseconds().max(0);

        self.store
            .update(&self.run)
            .context("Failed to finalize sync run")?;

        debug!(
            "sync run {} finished with status {} after {} ms",
            self.run.id,
            status.as_str(),
            self.run.duration_ms
        );
        Ok(self.run)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    /// Store that records every persisted state for assertions
    #[derive(Default)]
    struct RecordingStore {
        created: Mutex<Vec<SyncRun>>,
        updates: Mutex<Vec<SyncRun>>,
    }

    impl SyncRunStore for RecordingStore {
        fn create(&self, run: &SyncRun) -> Result<i64> {
            self.created.lock().unwrap().push(run.clone());
            Ok(7)
        }

        fn update(&self, run: &SyncRun) -> Result<()> {
            self.updates.lock().unwrap().push(run.clone());
            Ok(())
        }

        fn get_latest(&self) -> Result<Option<SyncRun>> {
            Ok(self.updates.lock().unwrap().last().cloned())
        }
    }

    #[test]
    fn test_start_creates_running_record() {
        let store = Arc::new(RecordingStore::default());
        let tracker =
            SyncRunTracker::start(store.clone(), "organization", Some("mksg".to_string())).unwrap();

        assert_eq!(tracker.run().id, 7);
        assert_eq!(tracker.run().status, SyncRunStatus::Running);
        assert_eq!(tracker.run().org_filter.as_deref(), Some("mksg"));
        assert!(tracker.run().completed_at.is_none());
        assert_eq!(store.created.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_counters_and_error_log_accumulate() {
        let store = Arc::new(RecordingStore::default());
        let mut tracker = SyncRunTracker::start(store.clone(), "organization", None).unwrap();

        tracker.mark_processed("mksg/one").unwrap();
        tracker.mark_processed("mksg/two").unwrap();
        tracker
            .record_error("mksg/three", &anyhow::anyhow!("metadata missing"))
            .unwrap();

        let run = tracker.run();
        assert_eq!(run.repos_processed, 2);
        assert_eq!(run.repos_failed, 1);
        assert_eq!(run.last_processed_repo, "mksg/three");
        assert_eq!(run.errors.len(), 1);
        assert_eq!(run.errors[0].repo, "mksg/three");
        assert!(run.errors[0].message.contains("metadata missing"));
    }

    #[test]
    fn test_error_log_preserves_insertion_order() {
        let store = Arc::new(RecordingStore::default());
        let mut tracker = SyncRunTracker::start(store, "organization", None).unwrap();

        for name in ["a", "b", "c"] {
            tracker
                .record_error(&format!("mksg/{}", name), &anyhow::anyhow!("boom"))
                .unwrap();
        }

        let repos: Vec<&str> = tracker.run().errors.iter().map(|e| e.repo.as_str()).collect();
        assert_eq!(repos, vec!["mksg/a", "mksg/b", "mksg/c"]);
    }

    #[test]
    fn test_complete_sets_terminal_fields() {
        let store = Arc::new(RecordingStore::default());
        let tracker = SyncRunTracker::start(store.clone(), "organization", None).unwrap();

        let run = tracker.complete(SyncRunStatus::Completed).unwrap();

        assert_eq!(run.status, SyncRunStatus::Completed);
        assert!(run.status.is_terminal());
        let completed_at = run.completed_at.expect("completed_at set");
        assert!(completed_at >= run.started_at);
        assert!(run.duration_ms >= 0);

        // The terminal state was persisted
        let persisted = store.updates.lock().unwrap();
        assert_eq!(persisted.last().unwrap().status, SyncRunStatus::Completed);
    }

    #[test]
    fn test_status_round_trip() {
        for status in [
            SyncRunStatus::Running,
            SyncRunStatus::Completed,
            SyncRunStatus::Failed,
            SyncRunStatus::Partial,
        ] {
            assert_eq!(SyncRunStatus::parse(status.as_str()), status);
        }
        assert_eq!(SyncRunStatus::parse("garbage"), SyncRunStatus::Running);
    }
}
