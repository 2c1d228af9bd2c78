//! Forge client abstraction
//!
//! The narrow surface the collectors require from the code-forge API,
//! expressed as a trait so every collector can run against a mock. The
//! production implementation wraps octocrab for authentication and GraphQL
//! and drops to reqwest for the preview REST endpoints and artifact
//! downloads octocrab does not cover.

use crate::error::CollectorError;
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use octocrab::Octocrab;
use serde::Deserialize;
use serde_json::Value;
use std::io::Cursor;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Repository listing entry returned by the forge
#[derive(Debug, Clone, Default)]
pub struct ForgeRepoInfo {
    pub owner: String,
    pub name: String,
    pub full_name: String,
    pub is_fork: bool,
    pub is_archived: bool,
    pub is_private: bool,
    pub default_branch: Option<String>,
}

/// A workflow registered on a repository
#[derive(Debug, Clone, Deserialize)]
pub struct Workflow {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

/// A single run of a workflow
#[derive(Debug, Clone, Deserialize)]
pub struct WorkflowRun {
    pub id: u64,
    #[serde(default)]
    pub head_branch: String,
    #[serde(default)]
    pub head_sha: String,
}

/// A build artifact attached to a workflow run
#[derive(Debug, Clone, Deserialize)]
pub struct ArtifactInfo {
    pub id: u64,
    #[serde(default)]
    pub name: String,
}

/// Remaining API quota as reported by the forge
#[derive(Debug, Clone, Copy)]
pub struct RateLimitStatus {
    pub limit: i64,
    pub remaining: i64,
    pub used: i64,
    pub reset_at: DateTime<Utc>,
}

/// Dependency (Dependabot) alert as returned by the REST endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DependencyAlert {
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub dismissed_at: Option<String>,
    #[serde(default)]
    pub fixed_at: Option<String>,
    #[serde(default)]
    pub security_advisory: SecurityAdvisory,
    #[serde(default)]
    pub security_vulnerability: SecurityVulnerability,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityAdvisory {
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub summary: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecurityVulnerability {
    #[serde(default)]
    pub package: PackageRef,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PackageRef {
    #[serde(default)]
    pub name: String,
}

/// Code-scanning alert as returned by the REST endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeScanningAlert {
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub dismissed_at: Option<String>,
    #[serde(default)]
    pub fixed_at: Option<String>,
    #[serde(default)]
    pub rule: CodeScanningRule,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct CodeScanningRule {
    #[serde(default)]
    pub id: String,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub security_severity_level: Option<String>,
    #[serde(default)]
    pub description: String,
}

/// Secret-scanning alert as returned by the REST endpoint
#[derive(Debug, Clone, Default, Deserialize)]
pub struct SecretScanningAlert {
    #[serde(default)]
    pub number: i64,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub secret_type: String,
    #[serde(default)]
    pub secret_type_display_name: String,
    #[serde(default)]
    pub html_url: String,
    #[serde(default)]
    pub created_at: String,
    #[serde(default)]
    pub updated_at: String,
    #[serde(default)]
    pub resolved_at: Option<String>,
}

/// The narrow forge surface the collection pipeline consumes
///
/// Implementations must return the `CollectorError::FeatureUnavailable`
/// sentinel (wrapped in anyhow) when a security endpoint answers with a
/// recognizable "not enabled for this repository" response, so callers can
/// distinguish it from transport failures.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait ForgeClient: Send + Sync {
    /// List all repositories of an organization
    async fn list_org_repos(&self, org: &str) -> Result<Vec<ForgeRepoInfo>>;

    /// Execute a GraphQL document; returns the decoded `data` object
    async fn graphql(&self, query: &str) -> Result<Value>;

    /// List workflows registered on a repository
    async fn list_workflows(&self, owner: &str, repo: &str) -> Result<Vec<Workflow>>;

    /// List the most recent successful runs of a workflow, newest first
    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: u64,
        limit: u8,
    ) -> Result<Vec<WorkflowRun>>;

    /// List the artifacts attached to a run
    async fn list_run_artifacts(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<ArtifactInfo>>;

    /// Download and extract one artifact into `dest`; returns the
    /// directory holding the extracted files
    async fn download_artifact(
        &self,
        owner: &str,
        repo: &str,
        artifact: &ArtifactInfo,
        dest: &Path,
    ) -> Result<PathBuf>;

    /// List open dependency (Dependabot) alerts
    async fn list_dependency_alerts(&self, owner: &str, repo: &str)
        -> Result<Vec<DependencyAlert>>;

    /// List open code-scanning alerts
    async fn list_code_scanning_alerts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<CodeScanningAlert>>;

    /// List open secret-scanning alerts
    async fn list_secret_scanning_alerts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<SecretScanningAlert>>;

    /// Execute the vulnerability-alerts GraphQL query (dependency fallback)
    async fn vulnerability_alerts_graphql(&self, owner: &str, repo: &str) -> Result<Value>;

    /// Query the forge's remaining API quota
    async fn rate_limit(&self) -> Result<RateLimitStatus>;
}

/// Production forge client backed by the GitHub API
pub struct GitHubForge {
    client: Octocrab,
    http: reqwest::Client,
    api_base: String,
}

impl GitHubForge {
    /// Create a client authenticated with a personal access token
    pub fn new(token: &str) -> Result<Self> {
        let client = Octocrab::builder()
            .personal_token(token.to_string())
            .build()
            .context("Failed to create GitHub client")?;

        let mut headers = reqwest::header::HeaderMap::new();
        headers.insert(
            reqwest::header::AUTHORIZATION,
            format!("Bearer {}", token)
                .parse()
                .context("Invalid token for Authorization header")?,
        );
        headers.insert(
            reqwest::header::ACCEPT,
            "application/vnd.github+json".parse().expect("static header"),
        );

        let http = reqwest::Client::builder()
            .user_agent(concat!("fleetscope/", env!("CARGO_PKG_VERSION")))
            .default_headers(headers)
            .build()
            .context("Failed to create HTTP client")?;

        Ok(Self {
            client,
            http,
            api_base: "https://api.github.com".to_string(),
        })
    }

    /// Override the REST API base URL (for tests against a local server)
    pub fn with_api_base(mut self, base: impl Into<String>) -> Self {
        self.api_base = base.into();
        self
    }

    /// Issue a GET to a REST path, translating 404 into the
    /// feature-unavailable sentinel and keeping status text visible for the
    /// rate-limit classifier
    async fn rest_get(&self, path: &str) -> Result<reqwest::Response> {
        let url = format!("{}{}", self.api_base, path);
        let response = self
            .http
            .get(&url)
            .send()
            .await
            .with_context(|| format!("GET {} failed", path))?;

        let status = response.status();
        if status == reqwest::StatusCode::NOT_FOUND {
            return Err(anyhow!(CollectorError::FeatureUnavailable).context(path.to_string()));
        }
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(anyhow!(
                "GET {} returned {}: {}",
                path,
                status.as_u16(),
                body.chars().take(200).collect::<String>()
            ));
        }

        Ok(response)
    }

    /// Fetch every page of a JSON-array REST endpoint
    async fn rest_get_paged<T: serde::de::DeserializeOwned>(&self, path: &str) -> Result<Vec<T>> {
        let mut items = Vec::new();
        let mut page = 1u32;

        loop {
            let sep = if path.contains('?') { '&' } else { '?' };
            let paged = format!("{}{}per_page=100&page={}", path, sep, page);
            let batch: Vec<T> = self
                .rest_get(&paged)
                .await?
                .json()
                .await
                .with_context(|| format!("Failed to decode response from {}", path))?;

            let len = batch.len();
            items.extend(batch);

            if len < 100 {
                break;
            }
            page += 1;
        }

        Ok(items)
    }
}

#[async_trait]
impl ForgeClient for GitHubForge {
    async fn list_org_repos(&self, org: &str) -> Result<Vec<ForgeRepoInfo>> {
        debug!("Fetching repositories for organization: {}", org);

        let mut repositories = Vec::new();
        let mut page = 1u8;

        loop {
            let page_repos = self
                .client
                .orgs(org)
                .list_repos()
                .per_page(100)
                .page(page)
                .send()
                .await
                .with_context(|| {
                    format!(
                        "Failed to fetch repositories for organization {} page {}",
                        org, page
                    )
                })?;

            let items = page_repos.items;
            if items.is_empty() {
                break;
            }

            repositories.extend(items.iter().map(|repo| {
                let owner = repo
                    .owner
                    .as_ref()
                    .map(|o| o.login.clone())
                    .unwrap_or_else(|| org.to_string());
                ForgeRepoInfo {
                    full_name: repo
                        .full_name
                        .clone()
                        .unwrap_or_else(|| format!("{}/{}", owner, repo.name)),
                    owner,
                    name: repo.name.clone(),
                    is_fork: repo.fork.unwrap_or(false),
                    is_archived: repo.archived.unwrap_or(false),
                    is_private: repo.private.unwrap_or(false),
                    default_branch: repo.default_branch.clone(),
                }
            }));

            // GitHub API pagination limit for u8
            if page >= 255 {
                warn!("Reached maximum pagination limit (255 pages) for org: {}", org);
                break;
            }
            page += 1;
        }

        debug!("Found {} repositories for organization: {}", repositories.len(), org);
        Ok(repositories)
    }

    async fn graphql(&self, query: &str) -> Result<Value> {
        let payload = serde_json::json!({ "query": query });
        let response: Value = self
            .client
            .graphql(&payload)
            .await
            .context("GraphQL request failed")?;

        if let Some(errors) = response.get("errors").and_then(|e| e.as_array()) {
            if !errors.is_empty() {
                let messages: Vec<String> = errors
                    .iter()
                    .map(|e| {
                        e.get("message")
                            .and_then(|m| m.as_str())
                            .unwrap_or("unknown error")
                            .to_string()
                    })
                    .collect();
                return Err(anyhow!("GraphQL errors: {}", messages.join("; ")));
            }
        }

        response
            .get("data")
            .cloned()
            .ok_or_else(|| anyhow!("GraphQL response missing data object"))
    }

    async fn list_workflows(&self, owner: &str, repo: &str) -> Result<Vec<Workflow>> {
        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            workflows: Vec<Workflow>,
        }

        let listing: Listing = self
            .rest_get(&format!("/repos/{}/{}/actions/workflows", owner, repo))
            .await?
            .json()
            .await
            .context("Failed to decode workflow listing")?;

        Ok(listing.workflows)
    }

    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: u64,
        limit: u8,
    ) -> Result<Vec<WorkflowRun>> {
        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            workflow_runs: Vec<WorkflowRun>,
        }

        let listing: Listing = self
            .rest_get(&format!(
                "/repos/{}/{}/actions/workflows/{}/runs?status=success&per_page={}",
                owner, repo, workflow_id, limit
            ))
            .await?
            .json()
            .await
            .context("Failed to decode workflow run listing")?;

        Ok(listing.workflow_runs)
    }

    async fn list_run_artifacts(
        &self,
        owner: &str,
        repo: &str,
        run_id: u64,
    ) -> Result<Vec<ArtifactInfo>> {
        #[derive(Deserialize)]
        struct Listing {
            #[serde(default)]
            artifacts: Vec<ArtifactInfo>,
        }

        let listing: Listing = self
            .rest_get(&format!(
                "/repos/{}/{}/actions/runs/{}/artifacts",
                owner, repo, run_id
            ))
            .await?
            .json()
            .await
            .context("Failed to decode artifact listing")?;

        Ok(listing.artifacts)
    }

    async fn download_artifact(
        &self,
        owner: &str,
        repo: &str,
        artifact: &ArtifactInfo,
        dest: &Path,
    ) -> Result<PathBuf> {
        let bytes = self
            .rest_get(&format!(
                "/repos/{}/{}/actions/artifacts/{}/zip",
                owner, repo, artifact.id
            ))
            .await?
            .bytes()
            .await
            .with_context(|| format!("Failed to download artifact {}", artifact.name))?;

        let target = dest.join(&artifact.name);
        let extract_target = target.clone();
        let name = artifact.name.clone();

        tokio::task::spawn_blocking(move || extract_zip(&bytes, &extract_target, &name))
            .await
            .context("Artifact extraction task failed")??;

        Ok(target)
    }

    async fn list_dependency_alerts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<DependencyAlert>> {
        self.rest_get_paged(&format!(
            "/repos/{}/{}/dependabot/alerts?state=open",
            owner, repo
        ))
        .await
    }

    async fn list_code_scanning_alerts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<CodeScanningAlert>> {
        self.rest_get_paged(&format!(
            "/repos/{}/{}/code-scanning/alerts?state=open",
            owner, repo
        ))
        .await
    }

    async fn list_secret_scanning_alerts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<SecretScanningAlert>> {
        self.rest_get_paged(&format!(
            "/repos/{}/{}/secret-scanning/alerts?state=open",
            owner, repo
        ))
        .await
    }

    async fn vulnerability_alerts_graphql(&self, owner: &str, repo: &str) -> Result<Value> {
        let query = format!(
            r#"query {{
  repository(owner: "{}", name: "{}") {{
    vulnerabilityAlerts(first: 100, states: OPEN) {{
      nodes {{
        number
        state
        createdAt
        securityAdvisory {{ severity summary }}
        securityVulnerability {{ package {{ name }} }}
      }}
    }}
  }}
}}"#,
            owner, repo
        );

        self.graphql(&query).await
    }

    async fn rate_limit(&self) -> Result<RateLimitStatus> {
        let response: Value = self
            .rest_get("/rate_limit")
            .await?
            .json()
            .await
            .context("Failed to decode rate limit response")?;

        let core = response
            .get("resources")
            .and_then(|r| r.get("core"))
            .cloned()
            .unwrap_or(Value::Null);

        let reset_epoch = core.get("reset").and_then(|v| v.as_i64()).unwrap_or(0);
        let reset_at = Utc
            .timestamp_opt(reset_epoch, 0)
            .single()
            .unwrap_or_else(Utc::now);

        Ok(RateLimitStatus {
            limit: core.get("limit").and_then(|v| v.as_i64()).unwrap_or(0),
            remaining: core.get("remaining").and_then(|v| v.as_i64()).unwrap_or(0),
            used: core.get("used").and_then(|v| v.as_i64()).unwrap_or(0),
            reset_at,
        })
    }
}

/// Extract a downloaded artifact zip into `target`, refusing entries that
/// escape the target directory
fn extract_zip(bytes: &[u8], target: &Path, artifact_name: &str) -> Result<()> {
    std::fs::create_dir_all(target)
        .with_context(|| format!("Failed to create artifact directory for {}", artifact_name))?;

    let mut archive = zip::ZipArchive::new(Cursor::new(bytes))
        .with_context(|| format!("Artifact {} is not a valid zip archive", artifact_name))?;

    for i in 0..archive.len() {
        let mut entry = archive
            .by_index(i)
            .with_context(|| format!("Failed to read entry {} of {}", i, artifact_name))?;

        let relative = match entry.enclosed_name() {
            Some(relative) => relative.to_owned(),
            None => {
                warn!("Skipping unsafe path in artifact {}: {}", artifact_name, entry.name());
                continue;
            }
        };

        let out_path = target.join(relative);
        if entry.is_dir() {
            std::fs::create_dir_all(&out_path)?;
            continue;
        }

        if let Some(parent) = out_path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let mut out_file = std::fs::File::create(&out_path)
            .with_context(|| format!("Failed to create {}", out_path.display()))?;
        std::io::copy(&mut entry, &mut out_file)
            .with_context(|| format!("Failed to extract {}", out_path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn zip_with(entries: &[(&str, &str)]) -> Vec<u8> {
        let mut buffer = Cursor::new(Vec::new());
        {
            let mut writer = zip::ZipWriter::new(&mut buffer);
            let options = zip::write::FileOptions::default();
            for (name, content) in entries {
                writer.start_file(*name, options).unwrap();
                writer.write_all(content.as_bytes()).unwrap();
            }
            writer.finish().unwrap();
        }
        buffer.into_inner()
    }

    #[test]
    fn test_extract_zip_writes_nested_entries() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("loc-stats");
        let bytes = zip_with(&[
            ("stats.json", "{\"go_files_loc\": 10}"),
            (".mage-x/ci-results.jsonl", "{\"type\":\"summary\"}"),
        ]);

        extract_zip(&bytes, &target, "loc-stats").unwrap();

        assert!(target.join("stats.json").exists());
        assert!(target.join(".mage-x/ci-results.jsonl").exists());
    }

    #[test]
    fn test_extract_zip_rejects_invalid_archive() {
        let dir = tempfile::tempdir().unwrap();
        let result = extract_zip(b"not a zip", &dir.path().join("x"), "x");
        assert!(result.is_err());
    }

    #[test]
    fn test_dependency_alert_decodes_with_missing_fields() {
        let alert: DependencyAlert = serde_json::from_str("{\"number\": 7}").unwrap();
        assert_eq!(alert.number, 7);
        assert_eq!(alert.state, "");
        assert_eq!(alert.updated_at, "");
        assert!(alert.fixed_at.is_none());
        assert_eq!(alert.security_advisory.severity, "");
    }

    #[test]
    fn test_secret_scanning_alert_decodes_with_missing_updated_at() {
        let alert: SecretScanningAlert =
            serde_json::from_str("{\"number\": 1, \"secret_type\": \"github_pat\"}").unwrap();
        assert_eq!(alert.secret_type, "github_pat");
        // Missing updated_at degrades to empty string, not an error
        assert_eq!(alert.updated_at, "");
        assert!(alert.resolved_at.is_none());
    }
}
