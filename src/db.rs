//! SQLite persistence
//!
//! This module provides persistent storage for:
//! - Organization and repository rows discovered on the forge
//! - Change-aware repository snapshots and CI metric snapshots
//! - Unified security alerts
//! - Sync-run coordination records
//!
//! The database is stored in XDG_DATA_HOME/fleetscope/analytics.db

use crate::ci::CiMetrics;
use crate::forge::ForgeRepoInfo;
use crate::security::SecurityAlert;
use crate::snapshot::RepoSnapshot;
use crate::store::{
    AlertStore, CiSnapshotStore, OrgRecord, OrganizationStore, RepoRecord, RepositoryStore,
    SnapshotStore, SyncRunStore,
};
use crate::syncrun::{SyncErrorEntry, SyncRun, SyncRunStatus};
use anyhow::{anyhow, Context, Result};
use chrono::{DateTime, Utc};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::path::PathBuf;
use std::sync::Mutex;
use tracing::{debug, info};

/// Analytics database manager
///
/// The connection sits behind a mutex so the database can be shared as a
/// `Send + Sync` port bundle.
pub struct AnalyticsDb {
    conn: Mutex<Connection>,
}

impl AnalyticsDb {
    /// Open or create the database at a specific path
    pub fn open_at(path: PathBuf) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }

        let conn = Connection::open(&path)
            .with_context(|| format!("Failed to open database at {}", path.display()))?;

        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;

        info!("Analytics database opened at {}", path.display());
        Ok(db)
    }

    /// Open an in-memory database (for testing)
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory().context("Failed to open in-memory database")?;
        let db = Self {
            conn: Mutex::new(conn),
        };
        db.initialize()?;
        Ok(db)
    }

    /// Number of stored snapshots for a repository
    pub fn snapshot_count(&self, repo_id: i64) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.query_row(
            "SELECT COUNT(*) FROM snapshots WHERE repo_id = ?1",
            params![repo_id],
            |row| row.get(0),
        )
        .context("Failed to count snapshots")
    }

    /// Initialize the database schema
    fn initialize(&self) -> Result<()> {
        self.conn
            .lock()
            .unwrap()
            .execute_batch(
                r#"
                -- Organizations discovered on the forge
                CREATE TABLE IF NOT EXISTS organizations (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    login TEXT UNIQUE NOT NULL,
                    created_at TEXT NOT NULL
                );

                -- Repository rows
                CREATE TABLE IF NOT EXISTS repositories (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    org_id INTEGER NOT NULL,
                    owner TEXT NOT NULL,
                    name TEXT NOT NULL,
                    full_name TEXT UNIQUE NOT NULL,
                    is_fork INTEGER DEFAULT 0,
                    is_archived INTEGER DEFAULT 0,
                    is_private INTEGER DEFAULT 0,
                    default_branch TEXT,
                    updated_at TEXT NOT NULL
                );

                -- Change-aware snapshots
                CREATE TABLE IF NOT EXISTS snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL,
                    stars INTEGER DEFAULT 0,
                    forks INTEGER DEFAULT 0,
                    open_issues INTEGER DEFAULT 0,
                    open_prs INTEGER DEFAULT 0,
                    branch_count INTEGER DEFAULT 0,
                    latest_release TEXT,
                    latest_tag TEXT,
                    pushed_at TEXT,
                    dependency_alerts INTEGER DEFAULT 0,
                    code_scanning_alerts INTEGER DEFAULT 0,
                    secret_scanning_alerts INTEGER DEFAULT 0,
                    snapshot_at TEXT NOT NULL
                );

                -- Unified security alerts
                CREATE TABLE IF NOT EXISTS security_alerts (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL,
                    kind TEXT NOT NULL,
                    number INTEGER NOT NULL,
                    state TEXT NOT NULL,
                    severity TEXT NOT NULL,
                    title TEXT NOT NULL,
                    url TEXT,
                    created_at TEXT,
                    updated_at TEXT,
                    dismissed_at TEXT,
                    fixed_at TEXT,
                    resolved_at TEXT,
                    UNIQUE(repo_id, kind, number)
                );

                -- CI metric snapshots
                CREATE TABLE IF NOT EXISTS ci_snapshots (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    repo_id INTEGER NOT NULL,
                    run_id INTEGER NOT NULL,
                    head_branch TEXT,
                    head_sha TEXT,
                    go_loc INTEGER DEFAULT 0,
                    test_loc INTEGER DEFAULT 0,
                    go_files INTEGER DEFAULT 0,
                    test_files INTEGER DEFAULT 0,
                    test_count INTEGER DEFAULT 0,
                    benchmark_count INTEGER DEFAULT 0,
                    coverage REAL,
                    snapshot_at TEXT NOT NULL
                );

                -- Sync-run coordination records
                CREATE TABLE IF NOT EXISTS sync_runs (
                    id INTEGER PRIMARY KEY AUTOINCREMENT,
                    status TEXT NOT NULL,
                    sync_type TEXT NOT NULL,
                    org_filter TEXT,
                    started_at TEXT NOT NULL,
                    completed_at TEXT,
                    duration_ms INTEGER DEFAULT 0,
                    repos_processed INTEGER DEFAULT 0,
                    repos_failed INTEGER DEFAULT 0,
                    last_processed_repo TEXT,
                    error_log TEXT
                );

                -- Indexes for efficient queries
                CREATE INDEX IF NOT EXISTS idx_repos_org ON repositories(org_id);
                CREATE INDEX IF NOT EXISTS idx_repos_full_name ON repositories(full_name);
                CREATE INDEX IF NOT EXISTS idx_snapshots_repo ON snapshots(repo_id, id);
                CREATE INDEX IF NOT EXISTS idx_alerts_repo ON security_alerts(repo_id, kind);
                CREATE INDEX IF NOT EXISTS idx_ci_snapshots_repo ON ci_snapshots(repo_id, id);
                CREATE INDEX IF NOT EXISTS idx_sync_runs_started ON sync_runs(started_at);
                "#,
            )
            .context("Failed to initialize database schema")?;

        debug!("Database schema initialized");
        Ok(())
    }
}

fn parse_time(raw: Option<String>) -> Option<DateTime<Utc>> {
    raw.and_then(|s| DateTime::parse_from_rfc3339(&s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}

fn repo_from_row(row: &Row<'_>) -> rusqlite::Result<RepoRecord> {
    Ok(RepoRecord {
        id: row.get(0)?,
        org_id: row.get(1)?,
        owner: row.get(2)?,
        name: row.get(3)?,
        full_name: row.get(4)?,
        is_fork: row.get::<_, i32>(5)? != 0,
        is_archived: row.get::<_, i32>(6)? != 0,
        is_private: row.get::<_, i32>(7)? != 0,
        default_branch: row.get(8)?,
    })
}

const REPO_COLUMNS: &str =
    "id, org_id, owner, name, full_name, is_fork, is_archived, is_private, default_branch";

impl OrganizationStore for AnalyticsDb {
    fn get_by_login(&self, login: &str) -> Result<Option<OrgRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                "SELECT id, login FROM organizations WHERE login = ?1",
                params![login],
                |row| {
                    Ok(OrgRecord {
                        id: row.get(0)?,
                        login: row.get(1)?,
                    })
                },
            )
            .optional()
            .context("Failed to query organization")?;

        Ok(record)
    }

    fn upsert(&self, login: &str) -> Result<OrgRecord> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                "INSERT OR IGNORE INTO organizations (login, created_at) VALUES (?1, ?2)",
                params![login, Utc::now().to_rfc3339()],
            )
            .context("Failed to upsert organization")?;
        }

        self.get_by_login(login)?
            .ok_or_else(|| anyhow!("Organization {} missing after upsert", login))
    }
}

impl RepositoryStore for AnalyticsDb {
    fn list(&self, org_id: i64) -> Result<Vec<RepoRecord>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {} FROM repositories WHERE org_id = ?1 ORDER BY full_name",
            REPO_COLUMNS
        ))?;

        let repos = stmt
            .query_map(params![org_id], repo_from_row)
            .context("Failed to query repositories")?
            .collect::<rusqlite::Result<Vec<_>>>()
            .context("Failed to collect repositories")?;

        Ok(repos)
    }

    fn upsert(&self, org_id: i64, info: &ForgeRepoInfo) -> Result<RepoRecord> {
        {
            let conn = self.conn.lock().unwrap();
            conn.execute(
                r#"
                INSERT INTO repositories (org_id, owner, name, full_name, is_fork, is_archived, is_private, default_branch, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9)
                ON CONFLICT(full_name) DO UPDATE SET
                    org_id = ?1,
                    owner = ?2,
                    name = ?3,
                    is_fork = ?5,
                    is_archived = ?6,
                    is_private = ?7,
                    default_branch = ?8,
                    updated_at = ?9
                "#,
                params![
                    org_id,
                    info.owner,
                    info.name,
                    info.full_name,
                    info.is_fork as i32,
                    info.is_archived as i32,
                    info.is_private as i32,
                    info.default_branch,
                    Utc::now().to_rfc3339(),
                ],
            )
            .context("Failed to upsert repository")?;
        }

        self.get_by_full_name(&info.full_name)?
            .ok_or_else(|| anyhow!("Repository {} missing after upsert", info.full_name))
    }

    fn get_by_full_name(&self, full_name: &str) -> Result<Option<RepoRecord>> {
        let conn = self.conn.lock().unwrap();
        let record = conn
            .query_row(
                &format!(
                    "SELECT {} FROM repositories WHERE full_name = ?1",
                    REPO_COLUMNS
                ),
                params![full_name],
                repo_from_row,
            )
            .optional()
            .context("Failed to query repository")?;

        Ok(record)
    }
}

impl SnapshotStore for AnalyticsDb {
    fn create(&self, repo_id: i64, snapshot: &RepoSnapshot) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO snapshots (repo_id, stars, forks, open_issues, open_prs, branch_count,
                                   latest_release, latest_tag, pushed_at,
                                   dependency_alerts, code_scanning_alerts, secret_scanning_alerts,
                                   snapshot_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
            "#,
            params![
                repo_id,
                snapshot.stars,
                snapshot.forks,
                snapshot.open_issues,
                snapshot.open_prs,
                snapshot.branch_count,
                snapshot.latest_release,
                snapshot.latest_tag,
                snapshot.pushed_at.map(|dt| dt.to_rfc3339()),
                snapshot.dependency_alerts,
                snapshot.code_scanning_alerts,
                snapshot.secret_scanning_alerts,
                snapshot
                    .snapshot_at
                    .unwrap_or_else(Utc::now)
                    .to_rfc3339(),
            ],
        )
        .context("Failed to create snapshot")?;

        Ok(conn.last_insert_rowid())
    }

    fn get_latest(&self, repo_id: i64) -> Result<Option<RepoSnapshot>> {
        let conn = self.conn.lock().unwrap();
        let snapshot = conn
            .query_row(
                r#"
                SELECT stars, forks, open_issues, open_prs, branch_count,
                       latest_release, latest_tag, pushed_at,
                       dependency_alerts, code_scanning_alerts, secret_scanning_alerts,
                       snapshot_at
                FROM snapshots
                WHERE repo_id = ?1
                ORDER BY id DESC
                LIMIT 1
                "#,
                params![repo_id],
                |row| {
                    Ok(RepoSnapshot {
                        stars: row.get(0)?,
                        forks: row.get(1)?,
                        open_issues: row.get(2)?,
                        open_prs: row.get(3)?,
                        branch_count: row.get(4)?,
                        latest_release: row.get(5)?,
                        latest_tag: row.get(6)?,
                        pushed_at: parse_time(row.get(7)?),
                        dependency_alerts: row.get(8)?,
                        code_scanning_alerts: row.get(9)?,
                        secret_scanning_alerts: row.get(10)?,
                        snapshot_at: parse_time(row.get(11)?),
                    })
                },
            )
            .optional()
            .context("Failed to query latest snapshot")?;

        Ok(snapshot)
    }
}

impl AlertStore for AnalyticsDb {
    fn upsert(&self, repo_id: i64, alert: &SecurityAlert) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO security_alerts (repo_id, kind, number, state, severity, title, url,
                                         created_at, updated_at, dismissed_at, fixed_at, resolved_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            ON CONFLICT(repo_id, kind, number) DO UPDATE SET
                state = ?4,
                severity = ?5,
                title = ?6,
                url = ?7,
                created_at = ?8,
                updated_at = ?9,
                dismissed_at = ?10,
                fixed_at = ?11,
                resolved_at = ?12
            "#,
            params![
                repo_id,
                alert.kind.as_str(),
                alert.number,
                alert.state,
                alert.severity,
                alert.title,
                alert.url,
                alert.created_at,
                alert.updated_at,
                alert.dismissed_at,
                alert.fixed_at,
                alert.resolved_at,
            ],
        )
        .context("Failed to upsert security alert")?;

        Ok(())
    }
}

impl CiSnapshotStore for AnalyticsDb {
    fn create(&self, repo_id: i64, metrics: &CiMetrics) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO ci_snapshots (repo_id, run_id, head_branch, head_sha, go_loc, test_loc,
                                      go_files, test_files, test_count, benchmark_count, coverage,
                                      snapshot_at)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12)
            "#,
            params![
                repo_id,
                metrics.run_id as i64,
                metrics.head_branch,
                metrics.head_sha,
                metrics.go_loc,
                metrics.test_loc,
                metrics.go_files,
                metrics.test_files,
                metrics.test_count,
                metrics.benchmark_count,
                metrics.coverage,
                Utc::now().to_rfc3339(),
            ],
        )
        .context("Failed to create CI snapshot")?;

        Ok(conn.last_insert_rowid())
    }
}

impl SyncRunStore for AnalyticsDb {
    fn create(&self, run: &SyncRun) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            r#"
            INSERT INTO sync_runs (status, sync_type, org_filter, started_at, completed_at,
                                   duration_ms, repos_processed, repos_failed,
                                   last_processed_repo, error_log)
            VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
            "#,
            params![
                run.status.as_str(),
                run.sync_type,
                run.org_filter,
                run.started_at.to_rfc3339(),
                run.completed_at.map(|dt| dt.to_rfc3339()),
                run.duration_ms,
                run.repos_processed,
                run.repos_failed,
                run.last_processed_repo,
                encode_error_log(&run.errors)?,
            ],
        )
        .context("Failed to create sync run")?;

        Ok(conn.last_insert_rowid())
    }

    fn update(&self, run: &SyncRun) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let updated = conn
            .execute(
                r#"
                UPDATE sync_runs SET
                    status = ?2,
                    completed_at = ?3,
                    duration_ms = ?4,
                    repos_processed = ?5,
                    repos_failed = ?6,
                    last_processed_repo = ?7,
                    error_log = ?8
                WHERE id = ?1
                "#,
                params![
                    run.id,
                    run.status.as_str(),
                    run.completed_at.map(|dt| dt.to_rfc3339()),
                    run.duration_ms,
                    run.repos_processed,
                    run.repos_failed,
                    run.last_processed_repo,
                    encode_error_log(&run.errors)?,
                ],
            )
            .context("Failed to update sync run")?;

        if updated == 0 {
            anyhow::bail!("Sync run {} does not exist", run.id);
        }
        Ok(())
    }

    fn get_latest(&self) -> Result<Option<SyncRun>> {
        let conn = self.conn.lock().unwrap();
        let run = conn
            .query_row(
                r#"
                SELECT id, status, sync_type, org_filter, started_at, completed_at,
                       duration_ms, repos_processed, repos_failed, last_processed_repo, error_log
                FROM sync_runs
                ORDER BY id DESC
                LIMIT 1
                "#,
                [],
                |row| {
                    Ok(SyncRun {
                        id: row.get(0)?,
                        status: SyncRunStatus::parse(&row.get::<_, String>(1)?),
                        sync_type: row.get(2)?,
                        org_filter: row.get(3)?,
                        started_at: parse_time(row.get(4)?).unwrap_or_else(Utc::now),
                        completed_at: parse_time(row.get(5)?),
                        duration_ms: row.get(6)?,
                        repos_processed: row.get(7)?,
                        repos_failed: row.get(8)?,
                        last_processed_repo: row
                            .get::<_, Option<String>>(9)?
                            .unwrap_or_default(),
                        errors: decode_error_log(row.get(10)?),
                    })
                },
            )
            .optional()
            .context("Failed to query latest sync run")?;

        Ok(run)
    }
}

/// Serialize the error log as a {"errors": [...]} document, preserving
/// insertion order
fn encode_error_log(errors: &[SyncErrorEntry]) -> Result<String> {
    serde_json::to_string(&serde_json::json!({ "errors": errors }))
        .context("Failed to encode error log")
}

fn decode_error_log(raw: Option<String>) -> Vec<SyncErrorEntry> {
    raw.and_then(|text| serde_json::from_str::<serde_json::Value>(&text).ok())
        .and_then(|value| value.get("errors").cloned())
        .and_then(|errors| serde_json::from_value(errors).ok())
        .unwrap_or_default()
}
