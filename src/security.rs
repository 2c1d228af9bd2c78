//! Security alert collection
//!
//! Fans out over repositories with a small bounded pool (the shared throttle,
//! not the pool, governs aggregate throughput) and fetches three alert kinds
//! per repo: dependency, code-scanning and secret-scanning. Per-repo and
//! per-endpoint failures degrade to warnings on that repo's result; only
//! cancellation aborts the batch.

use crate::batch::RepoRef;
use crate::error::{is_cancelled, is_feature_unavailable};
use crate::forge::{
    CodeScanningAlert, DependencyAlert, ForgeClient, SecretScanningAlert,
};
use crate::throttle::Throttle;
use anyhow::Result;
use futures::stream::{FuturesUnordered, StreamExt};
use serde_json::Value;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// The three alert categories collected per repository
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    Dependency,
    CodeScanning,
    SecretScanning,
}

impl AlertKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            AlertKind::Dependency => "dependency",
            AlertKind::CodeScanning => "code_scanning",
            AlertKind::SecretScanning => "secret_scanning",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "dependency" => Some(AlertKind::Dependency),
            "code_scanning" => Some(AlertKind::CodeScanning),
            "secret_scanning" => Some(AlertKind::SecretScanning),
            _ => None,
        }
    }
}

/// A security alert in the unified form shared by all three categories
///
/// Timestamps are ISO-8601 UTC strings as returned by the forge; a missing
/// required timestamp is an empty string, never a decode failure. Only
/// secret-scanning alerts carry `resolved_at`, and they never carry
/// `fixed_at`.
#[derive(Debug, Clone, PartialEq)]
pub struct SecurityAlert {
    pub kind: AlertKind,
    pub number: i64,
    pub state: String,
    pub severity: String,
    pub title: String,
    pub url: String,
    pub created_at: String,
    pub updated_at: String,
    pub dismissed_at: Option<String>,
    pub fixed_at: Option<String>,
    pub resolved_at: Option<String>,
}

/// Per-repo collection outcome: alerts plus user-visible warnings
///
/// Warnings may be non-empty even when the alert list is empty.
#[derive(Debug, Clone, Default)]
pub struct SecurityResult {
    pub alerts: Vec<SecurityAlert>,
    pub warnings: Vec<String>,
}

impl SecurityResult {
    /// Number of alerts of one kind
    pub fn count_of(&self, kind: AlertKind) -> i64 {
        self.alerts.iter().filter(|a| a.kind == kind).count() as i64
    }
}

/// Lowercase a severity label, folding GraphQL's MODERATE into medium
pub fn normalize_severity(raw: &str) -> String {
    let lower = raw.to_ascii_lowercase();
    if lower == "moderate" {
        "medium".to_string()
    } else {
        lower
    }
}

/// Lowercase an alert state label (OPEN, DISMISSED, FIXED, ...)
pub fn normalize_state(raw: &str) -> String {
    raw.to_ascii_lowercase()
}

/// Bounded-concurrency collector for all three alert endpoints
pub struct SecurityCollector {
    forge: Arc<dyn ForgeClient>,
    throttle: Arc<Throttle>,
    workers: usize,
}

impl SecurityCollector {
    pub fn new(forge: Arc<dyn ForgeClient>, throttle: Arc<Throttle>, workers: usize) -> Self {
        Self {
            forge,
            throttle,
            workers: workers.max(1),
        }
    }

    /// Collect alerts for every repository in the input
    ///
    /// The result map carries an entry for every input repo, including those
    /// with zero alerts. Per-repo failures become warnings; cancellation is
    /// the only error this method returns.
    pub async fn collect(
        &self,
        repos: &[RepoRef],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, SecurityResult>> {
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

            futures.push(async move {
                let _permit = semaphore.acquire().await.expect("Semaphore closed");
                throttle.pause_between_repos(&cancel).await?;

                let result = collect_repo(forge.as_ref(), &throttle, &repo, &cancel).await?;
                Ok::<_, anyhow::Error>((repo.full_name(), result))
            });
        }

        while let Some(outcome) = futures.next().await {
            match outcome {
                Ok((full_name, result)) => {
                    debug!(
                        "security collection for {}: {} alerts, {} warnings",
                        full_name,
                        result.alerts.len(),
                        result.warnings.len()
                    );
                    results.insert(full_name, result);
                }
                // Workers only fail on cancellation, which aborts the batch
                Err(err) => return Err(err),
            }
        }

        Ok(results)
    }
}

/// Fetch the three endpoints for one repository, sequentially
async fn collect_repo(
    forge: &dyn ForgeClient,
    throttle: &Throttle,
    repo: &RepoRef,
    cancel: &CancellationToken,
) -> Result<SecurityResult> {
    let mut result = SecurityResult::default();
    let (owner, name) = (repo.owner.as_str(), repo.name.as_str());

    // Dependency alerts: REST first, GraphQL fallback when the feature
    // endpoint is missing for this repo
    match throttle
        .run_with_retry(cancel, "dependency alerts", || {
            forge.list_dependency_alerts(owner, name)
        })
        .await
    {
        Ok(alerts) => {
            result
                .alerts
                .extend(alerts.iter().map(unify_dependency_alert));
        }
        Err(err) if is_cancelled(&err) => return Err(err),
        Err(err) if is_feature_unavailable(&err) => {
            match throttle
                .run_with_retry(cancel, "vulnerability alerts graphql", || {
                    forge.vulnerability_alerts_graphql(owner, name)
                })
                .await
            {
                Ok(data) => {
                    let alerts = parse_vulnerability_alerts(&data);
                    result.warnings.push(format!(
                        "dependency alerts: REST unavailable, GraphQL fallback found {} alerts",
                        alerts.len()
                    ));
                    result.alerts.extend(alerts);
                }
                Err(graphql_err) if is_cancelled(&graphql_err) => return Err(graphql_err),
                Err(graphql_err) => {
                    result.warnings.push(format!(
                        "dependency alerts: both REST and GraphQL failed: {:#}",
                        graphql_err
                    ));
                }
            }
        }
        Err(err) => {
            result
                .warnings
                .push(format!("dependency alerts: {:#}", err));
        }
    }

    // Code-scanning alerts
    match throttle
        .run_with_retry(cancel, "code scanning alerts", || {
            forge.list_code_scanning_alerts(owner, name)
        })
        .await
    {
        Ok(alerts) => {
            result
                .alerts
                .extend(alerts.iter().map(unify_code_scanning_alert));
        }
        Err(err) if is_cancelled(&err) => return Err(err),
        Err(err) if is_feature_unavailable(&err) => {
            result
                .warnings
                .push("code scanning is not enabled for this repository".to_string());
        }
        Err(err) => {
            result
                .warnings
                .push(format!("code scanning alerts: {:#}", err));
        }
    }

    // Secret-scanning alerts
    match throttle
        .run_with_retry(cancel, "secret scanning alerts", || {
            forge.list_secret_scanning_alerts(owner, name)
        })
        .await
    {
        Ok(alerts) => {
            result
                .alerts
                .extend(alerts.iter().map(unify_secret_scanning_alert));
        }
        Err(err) if is_cancelled(&err) => return Err(err),
        Err(err) if is_feature_unavailable(&err) => {
            result
                .warnings
                .push("secret scanning is not enabled for this repository".to_string());
        }
        Err(err) => {
            result
                .warnings
                .push(format!("secret scanning alerts: {:#}", err));
        }
    }

    if !result.warnings.is_empty() {
        warn!(
            "security collection for {} produced warnings: {:?}",
            repo.full_name(),
            result.warnings
        );
    }

    Ok(result)
}

fn unify_dependency_alert(alert: &DependencyAlert) -> SecurityAlert {
    let package = alert.security_vulnerability.package.name.as_str();
    let summary = alert.security_advisory.summary.as_str();
    let title = match (package.is_empty(), summary.is_empty()) {
        (false, false) => format!("{}: {}", package, summary),
        (false, true) => package.to_string(),
        (true, _) => summary.to_string(),
    };

    SecurityAlert {
        kind: AlertKind::Dependency,
        number: alert.number,
        state: normalize_state(&alert.state),
        severity: normalize_severity(&alert.security_advisory.severity),
        title,
        url: alert.html_url.clone(),
        created_at: alert.created_at.clone(),
        updated_at: alert.updated_at.clone(),
        dismissed_at: alert.dismissed_at.clone(),
        fixed_at: alert.fixed_at.clone(),
        resolved_at: None,
    }
}

fn unify_code_scanning_alert(alert: &CodeScanningAlert) -> SecurityAlert {
    // Prefer the security severity level; the plain rule severity uses the
    // analyzer's error/warning/note scale
    let severity = match alert.rule.security_severity_level.as_deref() {
        Some(level) if !level.is_empty() => normalize_severity(level),
        _ => match alert.rule.severity.to_ascii_lowercase().as_str() {
            "error" | "critical" => "high".to_string(),
            "note" => "low".to_string(),
            _ => "medium".to_string(),
        },
    };

    let title = if alert.rule.description.is_empty() {
        alert.rule.id.clone()
    } else {
        format!("{}: {}", alert.rule.id, alert.rule.description)
    };

    SecurityAlert {
        kind: AlertKind::CodeScanning,
        number: alert.number,
        state: normalize_state(&alert.state),
        severity,
        title,
        url: alert.html_url.clone(),
        created_at: alert.created_at.clone(),
        updated_at: alert.updated_at.clone(),
        dismissed_at: alert.dismissed_at.clone(),
        fixed_at: alert.fixed_at.clone(),
        resolved_at: None,
    }
}

fn unify_secret_scanning_alert(alert: &SecretScanningAlert) -> SecurityAlert {
    let title = if alert.secret_type_display_name.is_empty() {
        format!("Exposed secret: {}", alert.secret_type)
    } else {
        format!("Exposed secret: {}", alert.secret_type_display_name)
    };

    SecurityAlert {
        kind: AlertKind::SecretScanning,
        number: alert.number,
        state: normalize_state(&alert.state),
        // The forge reports no severity for secret scanning
        severity: "high".to_string(),
        title,
        url: alert.html_url.clone(),
        created_at: alert.created_at.clone(),
        updated_at: alert.updated_at.clone(),
        dismissed_at: None,
        fixed_at: None,
        resolved_at: alert.resolved_at.clone(),
    }
}

/// Project the vulnerability-alerts GraphQL response into unified alerts
fn parse_vulnerability_alerts(data: &Value) -> Vec<SecurityAlert> {
    let nodes = match data
        .get("repository")
        .and_then(|r| r.get("vulnerabilityAlerts"))
        .and_then(|v| v.get("nodes"))
        .and_then(|n| n.as_array())
    {
        Some(nodes) => nodes,
        None => return Vec::new(),
    };

    nodes
        .iter()
        .filter(|node| node.is_object())
        .map(|node| {
            let advisory = node.get("securityAdvisory").cloned().unwrap_or(Value::Null);
            let package = node
                .get("securityVulnerability")
                .and_then(|v| v.get("package"))
                .and_then(|p| p.get("name"))
                .and_then(|n| n.as_str())
                .unwrap_or_default();
            let summary = advisory
                .get("summary")
                .and_then(|s| s.as_str())
                .unwrap_or_default();

            let title = match (package.is_empty(), summary.is_empty()) {
                (false, false) => format!("{}: {}", package, summary),
                (false, true) => package.to_string(),
                (true, _) => summary.to_string(),
            };

            SecurityAlert {
                kind: AlertKind::Dependency,
                number: node.get("number").and_then(|n| n.as_i64()).unwrap_or(0),
                state: normalize_state(
                    node.get("state").and_then(|s| s.as_str()).unwrap_or_default(),
                ),
                severity: normalize_severity(
                    advisory
                        .get("severity")
                        .and_then(|s| s.as_str())
                        .unwrap_or_default(),
                ),
                title,
                url: String::new(),
                created_at: node
                    .get("createdAt")
                    .and_then(|c| c.as_str())
                    .unwrap_or_default()
                    .to_string(),
                updated_at: String::new(),
                dismissed_at: None,
                fixed_at: None,
                resolved_at: None,
            }
        })
        .collect()
}
