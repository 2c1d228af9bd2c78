/// Common test utilities and helpers for FleetScope tests
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::Utc;
use fleetscope::config::ThrottleConfig;
use fleetscope::error::CollectorError;
use fleetscope::forge::{
    ArtifactInfo, CodeScanningAlert, CodeScanningRule, DependencyAlert, ForgeClient,
    ForgeRepoInfo, PackageRef, RateLimitStatus, SecretScanningAlert, SecurityAdvisory,
    SecurityVulnerability, Workflow, WorkflowRun,
};
use fleetscope::throttle::Throttle;
use regex::Regex;
use serde_json::{json, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

/// How a fake endpoint behaves for one repository
#[derive(Clone)]
pub enum Behavior<T: Clone> {
    Ok(Vec<T>),
    FeatureUnavailable,
    Fail(String),
}

impl<T: Clone> Behavior<T> {
    fn resolve(&self) -> Result<Vec<T>> {
        match self {
            Behavior::Ok(items) => Ok(items.clone()),
            Behavior::FeatureUnavailable => Err(CollectorError::FeatureUnavailable.into()),
            Behavior::Fail(message) => Err(anyhow!("{}", message)),
        }
    }
}

/// Canned forge used by the end-to-end scenarios
///
/// Every method counts its invocation so tests can assert "no forge calls".
#[derive(Default)]
pub struct FakeForge {
    pub repos: Mutex<Vec<ForgeRepoInfo>>,
    /// full name -> GraphQL repository node for the batch response
    pub metadata_nodes: Mutex<HashMap<String, Value>>,
    pub dependency: Mutex<HashMap<String, Behavior<DependencyAlert>>>,
    pub code_scanning: Mutex<HashMap<String, Behavior<CodeScanningAlert>>>,
    pub secret_scanning: Mutex<HashMap<String, Behavior<SecretScanningAlert>>>,
    /// full name -> vulnerability-alerts GraphQL data, or an error message
    pub vulnerability_graphql: Mutex<HashMap<String, std::result::Result<Value, String>>>,
    pub workflows: Mutex<HashMap<String, Vec<Workflow>>>,
    /// (full name, workflow id) -> runs
    pub runs: Mutex<HashMap<(String, u64), Vec<WorkflowRun>>>,
    /// run id -> artifacts
    pub artifacts: Mutex<HashMap<u64, Vec<ArtifactInfo>>>,
    /// artifact id -> (relative file path, content)
    pub artifact_files: Mutex<HashMap<u64, (String, String)>>,
    pub remaining_quota: AtomicU64,
    pub calls: AtomicU64,
}

impl FakeForge {
    pub fn new() -> Self {
        let forge = Self::default();
        forge.remaining_quota.store(5000, Ordering::SeqCst);
        forge
    }

    pub fn call_count(&self) -> u64 {
        self.calls.load(Ordering::SeqCst)
    }

    fn tick(&self) {
        self.calls.fetch_add(1, Ordering::SeqCst);
    }

    /// Register a repository with a metadata node for the batch response
    pub fn add_repo(&self, owner: &str, name: &str, node: Value) {
        let full_name = format!("{}/{}", owner, name);
        self.repos.lock().unwrap().push(ForgeRepoInfo {
            owner: owner.to_string(),
            name: name.to_string(),
            full_name: full_name.clone(),
            is_fork: false,
            is_archived: false,
            is_private: false,
            default_branch: Some("main".to_string()),
        });
        self.metadata_nodes.lock().unwrap().insert(full_name, node);
    }
}

#[async_trait]
impl ForgeClient for FakeForge {
    async fn list_org_repos(&self, _org: &str) -> Result<Vec<ForgeRepoInfo>> {
        self.tick();
        Ok(self.repos.lock().unwrap().clone())
    }

    async fn graphql(&self, query: &str) -> Result<Value> {
        self.tick();

        // Answer a batch metadata query by echoing the requested aliases
        let pattern =
            Regex::new(r#"(repo\d+): repository\(owner: "([^"]+)", name: "([^"]+)"\)"#).unwrap();
        let nodes = self.metadata_nodes.lock().unwrap();

        let mut data = serde_json::Map::new();
        for captures in pattern.captures_iter(query) {
            let alias = captures[1].to_string();
            let full_name = format!("{}/{}", &captures[2], &captures[3]);
            if let Some(node) = nodes.get(&full_name) {
                data.insert(alias, node.clone());
            }
        }

        Ok(Value::Object(data))
    }

    async fn list_workflows(&self, owner: &str, repo: &str) -> Result<Vec<Workflow>> {
        self.tick();
        let full_name = format!("{}/{}", owner, repo);
        Ok(self
            .workflows
            .lock()
            .unwrap()
            .get(&full_name)
            .cloned()
            .unwrap_or_default())
    }

    async fn list_workflow_runs(
        &self,
        owner: &str,
        repo: &str,
        workflow_id: u64,
        limit: u8,
    ) -> Result<Vec<WorkflowRun>> {
        self.tick();
        let full_name = format!("{}/{}", owner, repo);
        let mut runs = self
            .runs
            .lock()
            .unwrap()
            .get(&(full_name, workflow_id))
            .cloned()
            .unwrap_or_default();
        runs.truncate(limit as usize);
        Ok(runs)
    }

    async fn list_run_artifacts(
        &self,
        _owner: &str,
        _repo: &str,
        run_id: u64,
    ) -> Result<Vec<ArtifactInfo>> {
        self.tick();
        Ok(self
            .artifacts
            .lock()
            .unwrap()
            .get(&run_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn download_artifact(
        &self,
        _owner: &str,
        _repo: &str,
        artifact: &ArtifactInfo,
        dest: &Path,
    ) -> Result<PathBuf> {
        self.tick();
        let files = self.artifact_files.lock().unwrap();
        let (relative, content) = files
            .get(&artifact.id)
            .ok_or_else(|| anyhow!("artifact {} has no content registered", artifact.name))?;

        let dir = dest.join(&artifact.name);
        let path = dir.join(relative);
        std::fs::create_dir_all(path.parent().unwrap())?;
        std::fs::write(&path, content)?;
        Ok(dir)
    }

    async fn list_dependency_alerts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<DependencyAlert>> {
        self.tick();
        let full_name = format!("{}/{}", owner, repo);
        self.dependency
            .lock()
            .unwrap()
            .get(&full_name)
            .map(|behavior| behavior.resolve())
            .unwrap_or_else(|| Ok(vec![]))
    }

    async fn list_code_scanning_alerts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<CodeScanningAlert>> {
        self.tick();
        let full_name = format!("{}/{}", owner, repo);
        self.code_scanning
            .lock()
            .unwrap()
            .get(&full_name)
            .map(|behavior| behavior.resolve())
            .unwrap_or_else(|| Ok(vec![]))
    }

    async fn list_secret_scanning_alerts(
        &self,
        owner: &str,
        repo: &str,
    ) -> Result<Vec<SecretScanningAlert>> {
        self.tick();
        let full_name = format!("{}/{}", owner, repo);
        self.secret_scanning
            .lock()
            .unwrap()
            .get(&full_name)
            .map(|behavior| behavior.resolve())
            .unwrap_or_else(|| Ok(vec![]))
    }

    async fn vulnerability_alerts_graphql(&self, owner: &str, repo: &str) -> Result<Value> {
        self.tick();
        let full_name = format!("{}/{}", owner, repo);
        match self.vulnerability_graphql.lock().unwrap().get(&full_name) {
            Some(Ok(data)) => Ok(data.clone()),
            Some(Err(message)) => Err(anyhow!("{}", message)),
            None => Ok(json!({"repository": {"vulnerabilityAlerts": {"nodes": []}}})),
        }
    }

    async fn rate_limit(&self) -> Result<RateLimitStatus> {
        self.tick();
        let remaining = self.remaining_quota.load(Ordering::SeqCst) as i64;
        Ok(RateLimitStatus {
            limit: 5000,
            remaining,
            used: 5000 - remaining,
            reset_at: Utc::now(),
        })
    }
}

/// Throttle tuned so tests never wait
pub fn fast_throttle() -> Arc<Throttle> {
    Arc::new(Throttle::new(ThrottleConfig {
        requests_per_second: 10_000.0,
        burst_size: 1_000,
        inter_repo_delay_ms: 0,
        max_retries: 1,
        initial_backoff_secs: 0,
        max_backoff_secs: 0,
        backoff_multiplier: 2.0,
    }))
}

/// A plausible GraphQL repository node for the batch response
pub fn metadata_node(full_name: &str, stars: i64) -> Value {
    json!({
        "nameWithOwner": full_name,
        "stargazerCount": stars,
        "forkCount": 4,
        "watchers": {"totalCount": 11},
        "issues": {"totalCount": 6},
        "pullRequests": {"totalCount": 2},
        "branches": {"totalCount": 7},
        "defaultBranchRef": {"name": "main"},
        "description": "a repository",
        "latestRelease": {"tagName": "v1.0.0", "publishedAt": "2025-05-01T00:00:00Z"},
        "updatedAt": "2025-06-01T00:00:00Z",
        "pushedAt": "2025-06-01T12:00:00Z",
        "isFork": false,
        "isPrivate": false,
        "isArchived": false,
        "primaryLanguage": {"name": "Go"},
        "createdAt": "2021-01-01T00:00:00Z",
        "diskUsage": 512,
        "licenseInfo": {"key": "mit", "name": "MIT License"},
        "repositoryTopics": {"nodes": [{"topic": {"name": "tooling"}}]},
        "hasIssuesEnabled": true,
        "hasWikiEnabled": false,
        "hasDiscussionsEnabled": false,
        "url": format!("https://github.com/{}", full_name),
        "sshUrl": format!("git@github.com:{}.git", full_name)
    })
}

pub fn dependency_alert(number: i64, package: &str, severity: &str) -> DependencyAlert {
    DependencyAlert {
        number,
        state: "open".to_string(),
        html_url: format!("https://example.test/dependabot/{}", number),
        created_at: "2025-05-01T00:00:00Z".to_string(),
        updated_at: "2025-05-02T00:00:00Z".to_string(),
        dismissed_at: None,
        fixed_at: None,
        security_advisory: SecurityAdvisory {
            severity: severity.to_string(),
            summary: "Vulnerability advisory".to_string(),
        },
        security_vulnerability: SecurityVulnerability {
            package: PackageRef {
                name: package.to_string(),
            },
        },
    }
}

pub fn code_scanning_alert(number: i64, rule: &str, severity: &str) -> CodeScanningAlert {
    CodeScanningAlert {
        number,
        state: "open".to_string(),
        html_url: format!("https://example.test/code-scanning/{}", number),
        created_at: "2025-05-03T00:00:00Z".to_string(),
        updated_at: "2025-05-04T00:00:00Z".to_string(),
        dismissed_at: None,
        fixed_at: None,
        rule: CodeScanningRule {
            id: rule.to_string(),
            severity: severity.to_string(),
            security_severity_level: None,
            description: String::new(),
        },
    }
}

pub fn secret_scanning_alert(number: i64, secret_type: &str) -> SecretScanningAlert {
    SecretScanningAlert {
        number,
        state: "open".to_string(),
        secret_type: secret_type.to_string(),
        secret_type_display_name: String::new(),
        html_url: format!("https://example.test/secret-scanning/{}", number),
        created_at: "2025-05-05T00:00:00Z".to_string(),
        updated_at: String::new(),
        resolved_at: None,
    }
}
