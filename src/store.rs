//! Store ports
//!
//! The narrow, mock-friendly interfaces the collection pipeline consumes
//! from the persistence layer. The SQLite implementation lives in
//! [`crate::db`]; tests substitute in-memory fakes.

use crate::batch::RepoRef;
use crate::ci::CiMetrics;
use crate::forge::ForgeRepoInfo;
use crate::security::SecurityAlert;
use crate::snapshot::RepoSnapshot;
use crate::syncrun::SyncRun;
use anyhow::Result;
use std::sync::Arc;

/// A stored organization row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OrgRecord {
    pub id: i64,
    pub login: String,
}

/// A stored repository row
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RepoRecord {
    pub id: i64,
    pub org_id: i64,
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub is_fork: bool,
    pub is_archived: bool,
    pub is_private: bool,
    pub default_branch: Option<String>,
}

impl RepoRecord {
    /// Forge identity of this repository
    pub fn repo_ref(&self) -> RepoRef {
        RepoRef::new(self.owner.clone(), self.name.clone())
    }
}

/// Organization lookup
#[cfg_attr(test, mockall::automock)]
pub trait OrganizationStore: Send + Sync {
    fn get_by_login(&self, login: &str) -> Result<Option<OrgRecord>>;
    fn upsert(&self, login: &str) -> Result<OrgRecord>;
}

/// Repository rows owned by an organization
#[cfg_attr(test, mockall::automock)]
pub trait RepositoryStore: Send + Sync {
    fn list(&self, org_id: i64) -> Result<Vec<RepoRecord>>;
    fn upsert(&self, org_id: i64, info: &ForgeRepoInfo) -> Result<RepoRecord>;
    fn get_by_full_name(&self, full_name: &str) -> Result<Option<RepoRecord>>;
}

/// Change-aware repository snapshots
#[cfg_attr(test, mockall::automock)]
pub trait SnapshotStore: Send + Sync {
    fn create(&self, repo_id: i64, snapshot: &RepoSnapshot) -> Result<i64>;
    fn get_latest(&self, repo_id: i64) -> Result<Option<RepoSnapshot>>;
}

/// Unified security alerts
#[cfg_attr(test, mockall::automock)]
pub trait AlertStore: Send + Sync {
    fn upsert(&self, repo_id: i64, alert: &SecurityAlert) -> Result<()>;
}

/// CI metric snapshots
#[cfg_attr(test, mockall::automock)]
pub trait CiSnapshotStore: Send + Sync {
    fn create(&self, repo_id: i64, metrics: &CiMetrics) -> Result<i64>;
}

/// Sync-run coordination records
#[cfg_attr(test, mockall::automock)]
pub trait SyncRunStore: Send + Sync {
    fn create(&self, run: &SyncRun) -> Result<i64>;
    fn update(&self, run: &SyncRun) -> Result<()>;
    fn get_latest(&self) -> Result<Option<SyncRun>>;
}

/// Bundle of all store ports the orchestrator wires together
#[derive(Clone)]
pub struct StorePorts {
    pub orgs: Arc<dyn OrganizationStore>,
    pub repos: Arc<dyn RepositoryStore>,
    pub snapshots: Arc<dyn SnapshotStore>,
    pub alerts: Arc<dyn AlertStore>,
    pub ci_snapshots: Arc<dyn CiSnapshotStore>,
    pub sync_runs: Arc<dyn SyncRunStore>,
}
