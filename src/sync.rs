//! Sync Engine - Orchestrates one end-to-end analytics collection
//!
//! Wires the metadata pipeline, the security and CI collectors, change
//! detection and the store ports into a single `sync_organization` call,
//! all under one shared throttle and one durable sync-run record.

use crate::batch::{RepoMetadata, RepoRef};
use crate::budget::check_budget;
use crate::ci::CiCollector;
use crate::config::CollectorConfig;
use crate::error::{is_cancelled, CollectorError};
use crate::forge::ForgeClient;
use crate::metadata::MetadataPipeline;
use crate::output::Reporter;
use crate::security::{AlertKind, SecurityCollector, SecurityResult};
use crate::snapshot::{has_changed, RepoSnapshot};
use crate::store::StorePorts;
use crate::syncrun::{SyncRunStatus, SyncRunTracker};
use crate::throttle::Throttle;
use anyhow::{anyhow, Result};
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Results from a complete sync operation
#[derive(Debug, Clone, Default)]
pub struct SyncSummary {
    pub run_id: i64,
    pub total_repositories: usize,
    pub repos_processed: i64,
    pub repos_failed: i64,
    pub snapshots_written: usize,
    pub snapshots_skipped: usize,
    pub alerts_recorded: usize,
    pub ci_snapshots_written: usize,
    pub duration: Duration,
}

/// The main engine that orchestrates analytics collection
pub struct SyncEngine {
    forge: Arc<dyn ForgeClient>,
    throttle: Arc<Throttle>,
    stores: StorePorts,
    reporter: Arc<dyn Reporter>,
    config: CollectorConfig,
}

impl SyncEngine {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        throttle: Arc<Throttle>,
        stores: StorePorts,
        reporter: Arc<dyn Reporter>,
        config: CollectorConfig,
    ) -> Self {
        Self {
            forge,
            throttle,
            stores,
            reporter,
            config,
        }
    }

    /// Run one full collection pass over an organization
    ///
    /// Opens a sync-run record, collects, persists change-aware snapshots
    /// and finalizes the run. Per-repo failures land in the run's error log;
    /// only cancellation and store failures abort the sync, in which case
    /// the run is finalized as failed before the error is returned.
    pub async fn sync_organization(
        &self,
        org: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        let start = Instant::now();
        info!("Starting analytics sync for organization: {}", org);

        // A failure to open the run record is fatal
        let mut tracker = SyncRunTracker::start(
            self.stores.sync_runs.clone(),
            "organization",
            Some(org.to_string()),
        )?;

        match self.run_sync(&mut tracker, org, cancel).await {
            Ok(mut summary) => {
                let run = tracker.complete(SyncRunStatus::Completed)?;
                summary.run_id = run.id;
                summary.repos_processed = run.repos_processed;
                summary.repos_failed = run.repos_failed;
                summary.duration = start.elapsed();

                let stats = self.throttle.stats();
                info!(
                    "Sync completed in {:.2}s: {} API calls, {} retries, {} ms waiting on throttle",
                    summary.duration.as_secs_f64(),
                    stats.total_calls,
                    stats.total_retries,
                    stats.total_wait_ms
                );
                self.reporter.info(&format!(
                    "Synced {}: {} repos processed, {} failed, {} snapshots written, {} unchanged",
                    org,
                    summary.repos_processed,
                    summary.repos_failed,
                    summary.snapshots_written,
                    summary.snapshots_skipped
                ));

                Ok(summary)
            }
            Err(err) => {
                self.reporter
                    .error(&format!("Sync of {} failed: {:#}", org, err));
                if let Err(finalize_err) = tracker.complete(SyncRunStatus::Failed) {
                    warn!("Failed to finalize sync run: {:#}", finalize_err);
                }
                Err(err)
            }
        }
    }

    async fn run_sync(
        &self,
        tracker: &mut SyncRunTracker,
        org: &str,
        cancel: &CancellationToken,
    ) -> Result<SyncSummary> {
        // Quota status; the budget warning needs the repo count, so the
        // check itself runs after the list is loaded
        let rate_status = match self.forge.rate_limit().await {
            Ok(status) => Some(status),
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                warn!("Could not query rate limit status: {:#}", err);
                None
            }
        };

        // Refresh the stored repository list from the forge; on failure the
        // previously stored list still drives the sync
        let org_record = self.stores.orgs.upsert(org)?;
        match self.forge.list_org_repos(org).await {
            Ok(infos) => {
                for info in &infos {
                    self.stores.repos.upsert(org_record.id, info)?;
                }
                debug!("refreshed {} repositories for {}", infos.len(), org);
            }
            Err(err) if is_cancelled(&err) => return Err(err),
            Err(err) => {
                self.reporter.warn(&format!(
                    "Repository refresh failed, syncing the stored list: {:#}",
                    err
                ));
            }
        }

        let records = self.stores.repos.list(org_record.id)?;
        if let Some(status) = &rate_status {
            check_budget(status, records.len(), self.reporter.as_ref());
        }

        let mut summary = SyncSummary {
            total_repositories: records.len(),
            ..SyncSummary::default()
        };

        if records.is_empty() {
            info!("Organization {} has no repositories to sync", org);
            return Ok(summary);
        }

        let refs: Vec<RepoRef> = records.iter().map(|r| r.repo_ref()).collect();

        let metadata = MetadataPipeline::new(
            self.forge.clone(),
            self.throttle.clone(),
            self.config.metadata_chunk_size,
            self.config.fallback_chunk_size,
        )
        .collect(&refs, cancel)
        .await?;

        let security = SecurityCollector::new(
            self.forge.clone(),
            self.throttle.clone(),
            self.config.security_workers,
        )
        .collect(&refs, cancel)
        .await?;

        let ci = CiCollector::new(
            self.forge.clone(),
            self.throttle.clone(),
            self.config.ci_workers,
            self.config.workflow_name.clone(),
        )
        .collect(&refs, cancel)
        .await?;

        let snapshot_at = Utc::now();

        for record in &records {
            if cancel.is_cancelled() {
                return Err(CollectorError::Cancelled.into());
            }

            let full_name = record.full_name.as_str();
            let meta = match metadata.get(full_name) {
                Some(meta) => meta,
                None => {
                    // Private, deleted or otherwise inaccessible in the batch
                    tracker.record_error(
                        full_name,
                        &anyhow!("no metadata returned for repository"),
                    )?;
                    continue;
                }
            };

            let security_result = security.get(full_name);
            let snapshot = build_snapshot(meta, security_result, snapshot_at);

            let previous = self.stores.snapshots.get_latest(record.id)?;
            if has_changed(&snapshot, previous.as_ref()) {
                self.stores.snapshots.create(record.id, &snapshot)?;
                summary.snapshots_written += 1;
            } else {
                debug!("{} unchanged since last snapshot", full_name);
                summary.snapshots_skipped += 1;
            }

            if let Some(result) = security_result {
                for alert in &result.alerts {
                    self.stores.alerts.upsert(record.id, alert)?;
                    summary.alerts_recorded += 1;
                }
                for warning in &result.warnings {
                    debug!("{}: {}", full_name, warning);
                }
            }

            if let Some(metrics) = ci.get(full_name) {
                self.stores.ci_snapshots.create(record.id, metrics)?;
                summary.ci_snapshots_written += 1;
            }

            tracker.mark_processed(full_name)?;
        }

        Ok(summary)
    }
}

/// Combine a metadata record and per-repo alert counts into a snapshot
fn build_snapshot(
    meta: &RepoMetadata,
    security: Option<&SecurityResult>,
    snapshot_at: DateTime<Utc>,
) -> RepoSnapshot {
    RepoSnapshot {
        stars: meta.stars,
        forks: meta.forks,
        open_issues: meta.open_issues,
        open_prs: meta.open_prs,
        branch_count: meta.branch_count,
        latest_release: meta.latest_release_tag.clone(),
        latest_tag: meta.latest_tag.clone(),
        pushed_at: meta.pushed_at,
        dependency_alerts: security.map_or(0, |s| s.count_of(AlertKind::Dependency)),
        code_scanning_alerts: security.map_or(0, |s| s.count_of(AlertKind::CodeScanning)),
        secret_scanning_alerts: security.map_or(0, |s| s.count_of(AlertKind::SecretScanning)),
        snapshot_at: Some(snapshot_at),
    }
}
