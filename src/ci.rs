//! CI metrics collection
//!
//! For each repository, locates the most recent successful run of the
//! configured workflow and harvests metrics from its named build artifacts.
//! Downloads land in a per-repo temporary directory that is removed on every
//! exit path. Repositories without the workflow (or without runs) contribute
//! no entry; all other per-repo errors degrade to a partial record or a
//! debug log.

use crate::artifacts::{
    parse_bench_stats, parse_ci_results_jsonl, parse_coverage, parse_loc_stats,
    parse_statistics_markdown, parse_tests_markdown,
};
use crate::batch::RepoRef;
use crate::error::is_cancelled;
use crate::forge::{ArtifactInfo, ForgeClient};
use crate::throttle::Throttle;
use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use walkdir::WalkDir;

/// Artifact names the collector recognizes
const LOC_STATS_ARTIFACT: &str = "loc-stats";
const STATISTICS_SECTION_ARTIFACT: &str = "statistics-section";
const COVERAGE_ARTIFACT: &str = "coverage-stats-internal";
const CI_RESULTS_PREFIX: &str = "ci-results-";
const TESTS_SECTION_ARTIFACT: &str = "tests-section";
const BENCH_STATS_PREFIX: &str = "bench-stats-";

/// Metrics harvested from one workflow run
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CiMetrics {
    pub run_id: u64,
    pub head_branch: String,
    pub head_sha: String,
    pub go_loc: i64,
    pub test_loc: i64,
    pub go_files: i64,
    pub test_files: i64,
    pub test_count: i64,
    pub benchmark_count: i64,
    pub coverage: Option<f64>,
}

/// Bounded-concurrency collector for workflow-run artifacts
pub struct CiCollector {
    forge: Arc<dyn ForgeClient>,
    throttle: Arc<Throttle>,
    workers: usize,
    workflow_name: String,
}

impl CiCollector {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        throttle: Arc<Throttle>,
        workers: usize,
        workflow_name: impl Into<String>,
    ) -> Self {
        Self {
            forge,
            throttle,
            workers: workers.max(1),
            workflow_name: workflow_name.into(),
        }
    }

    /// Collect CI metrics for the given repositories
    ///
    /// The result map is best-effort: repositories without the workflow,
    /// without runs, or whose collection failed are simply absent.
    pub async fn collect(
        &self,
        repos: &[RepoRef],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, CiMetrics>> {
        let mut results = HashMap::new();
        if repos.is_empty() {
            return Ok(results);
        }

        let semaphore = Arc::new(Semaphore::new(self.workers));
        let mut futures = FuturesUnordered::new();

        for repo in repos {
            let semaphore = semaphore.clone();
            let forge = self.forge.clone();
            let throttle = self.throttle.clone();
            let cancel = cancel.clone();
            let repo = repo.clone();
            let workflow_name = self.workflow_name.clone();

            futures.push(async move {
                let _permit = semaphore.acquire().await.expect("Semaphore closed");
                throttle.pause_between_repos(&cancel).await?;

                match collect_repo(forge.as_ref(), &throttle, &repo, &workflow_name, &cancel).await
                {
                    Ok(metrics) => {
                        Ok::<_, anyhow::Error>(metrics.map(|m| (repo.full_name(), m)))
                    }
                    Err(err) if is_cancelled(&err) => Err(err),
                    Err(err) => {
                        debug!("CI collection failed for {}: {:#}", repo.full_name(), err);
                        Ok(None)
                    }
                }
            });
        }

        while let Some(outcome) = futures.next().await {
            match outcome {
                Ok(Some((full_name, metrics))) => {
                    results.insert(full_name, metrics);
                }
                Ok(None) => {}
                Err(err) => return Err(err),
            }
        }

        Ok(results)
    }
}

/// Harvest one repository's workflow artifacts
async fn collect_repo(
    forge: &dyn ForgeClient,
    throttle: &Throttle,
    repo: &RepoRef,
    workflow_name: &str,
    cancel: &CancellationToken,
) -> Result<Option<CiMetrics>> {
    let (owner, name) = (repo.owner.as_str(), repo.name.as_str());

    let workflows = throttle
        .run_with_retry(cancel, "workflow listing", || {
            forge.list_workflows(owner, name)
        })
        .await?;

    let workflow = match workflows.iter().find(|w| w.name == workflow_name) {
        Some(workflow) => workflow,
        None => {
            debug!("{} has no workflow named {}", repo.full_name(), workflow_name);
            return Ok(None);
        }
    };

    let runs = throttle
        .run_with_retry(cancel, "workflow run listing", || {
            forge.list_workflow_runs(owner, name, workflow.id, 1)
        })
        .await?;

    let run = match runs.first() {
        Some(run) => run,
        None => {
            debug!("{} workflow {} has no runs", repo.full_name(), workflow_name);
            return Ok(None);
        }
    };

    let artifacts = throttle
        .run_with_retry(cancel, "artifact listing", || {
            forge.list_run_artifacts(owner, name, run.id)
        })
        .await?;

    // Scoped download area; dropped (and removed) on every exit path
    let workdir = tempfile::tempdir()?;

    let mut metrics = CiMetrics {
        run_id: run.id,
        head_branch: run.head_branch.clone(),
        head_sha: run.head_sha.clone(),
        ..CiMetrics::default()
    };

    // LOC counts: JSON artifact first, markdown table as fallback
    let loc = match find_artifact(&artifacts, LOC_STATS_ARTIFACT) {
        Some(artifact) => {
            fetch_artifact_file(forge, throttle, repo, artifact, workdir.path(), "json", cancel)
                .await?
                .and_then(|content| parse_loc_stats(&content))
        }
        None => None,
    };
    let loc = match loc {
        Some(loc) => Some(loc),
        None => match find_artifact(&artifacts, STATISTICS_SECTION_ARTIFACT) {
            Some(artifact) => {
                fetch_artifact_file(forge, throttle, repo, artifact, workdir.path(), "md", cancel)
                    .await?
                    .and_then(|content| parse_statistics_markdown(&content))
            }
            None => None,
        },
    };
    if let Some(loc) = loc {
        metrics.go_loc = loc.go_loc;
        metrics.test_loc = loc.test_loc;
        metrics.go_files = loc.go_files;
        metrics.test_files = loc.test_files;
    }

    // Coverage percentage
    if let Some(artifact) = find_artifact(&artifacts, COVERAGE_ARTIFACT) {
        metrics.coverage =
            fetch_artifact_file(forge, throttle, repo, artifact, workdir.path(), "json", cancel)
                .await?
                .and_then(|content| parse_coverage(&content));
    }

    // Test count: JSONL results first, markdown section as fallback
    let test_count = match artifacts
        .iter()
        .find(|a| a.name.starts_with(CI_RESULTS_PREFIX))
    {
        Some(artifact) => {
            fetch_artifact_file(forge, throttle, repo, artifact, workdir.path(), "jsonl", cancel)
                .await?
                .and_then(|content| parse_ci_results_jsonl(&content))
        }
        None => None,
    };
    let test_count = match test_count {
        Some(count) => Some(count),
        None => match find_artifact(&artifacts, TESTS_SECTION_ARTIFACT) {
            Some(artifact) => {
                fetch_artifact_file(forge, throttle, repo, artifact, workdir.path(), "md", cancel)
                    .await?
                    .and_then(|content| parse_tests_markdown(&content))
            }
            None => None,
        },
    };
    metrics.test_count = test_count.unwrap_or(0);

    // Benchmark counts are summed across all bench-stats artifacts
    for artifact in artifacts
        .iter()
        .filter(|a| a.name.starts_with(BENCH_STATS_PREFIX))
    {
        if let Some(count) =
            fetch_artifact_file(forge, throttle, repo, artifact, workdir.path(), "json", cancel)
                .await?
                .and_then(|content| parse_bench_stats(&content))
        {
            metrics.benchmark_count += count;
        }
    }

    Ok(Some(metrics))
}

fn find_artifact<'a>(artifacts: &'a [ArtifactInfo], name: &str) -> Option<&'a ArtifactInfo> {
    artifacts.iter().find(|a| a.name == name)
}

/// Download one artifact and read the first file with the given extension
///
/// Download or read failures yield `None` (with a debug log) so the caller
/// can fall through to the next source; only cancellation is an error.
async fn fetch_artifact_file(
    forge: &dyn ForgeClient,
    throttle: &Throttle,
    repo: &RepoRef,
    artifact: &ArtifactInfo,
    dest: &Path,
    extension: &str,
    cancel: &CancellationToken,
) -> Result<Option<String>> {
    let dir = match throttle
        .run_with_retry(cancel, "artifact download", || {
            forge.download_artifact(&repo.owner, &repo.name, artifact, dest)
        })
        .await
    {
        Ok(dir) => dir,
        Err(err) if is_cancelled(&err) => return Err(err),
        Err(err) => {
            debug!(
                "artifact {} download failed for {}: {:#}",
                artifact.name,
                repo.full_name(),
                err
            );
            return Ok(None);
        }
    };

    let content = find_file_with_extension(&dir, extension)
        .and_then(|path| std::fs::read_to_string(path).ok());

    if content.is_none() {
        debug!(
            "artifact {} for {} contained no .{} file",
            artifact.name,
            repo.full_name(),
            extension
        );
    }

    Ok(content)
}

fn find_file_with_extension(dir: &Path, extension: &str) -> Option<PathBuf> {
    WalkDir::new(dir)
        .sort_by_file_name()
        .into_iter()
        .flatten()
        .find(|entry| {
            entry.file_type().is_file()
                && entry
                    .path()
                    .extension()
                    .map_or(false, |ext| ext == extension)
        })
        .map(|entry| entry.into_path())
}
