//! Batched metadata queries
//!
//! Builds a single GraphQL document that fetches the metadata field set for
//! many repositories at once under `repo0…repoN` aliases, and parses the
//! aliased response back into metadata records. The parser works on the
//! decoded response map; a missing or wrong-typed field degrades to its
//! zero value instead of failing the batch.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::HashMap;

/// Repositories per batched query
pub const DEFAULT_CHUNK_SIZE: usize = 25;

/// Reduced batch size used when a query trips complexity limits
pub const FALLBACK_CHUNK_SIZE: usize = 10;

/// Topics requested per repository
pub const MAX_TOPICS: usize = 20;

/// Identity of a repository on the forge
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct RepoRef {
    pub owner: String,
    pub name: String,
}

impl RepoRef {
    pub fn new(owner: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
            name: name.into(),
        }
    }

    /// Display name in "owner/name" form
    pub fn full_name(&self) -> String {
        format!("{}/{}", self.owner, self.name)
    }
}

/// Metadata record produced per repository by a batch query
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoMetadata {
    pub full_name: String,
    pub stars: i64,
    pub forks: i64,
    pub watchers: i64,
    pub open_issues: i64,
    pub open_prs: i64,
    pub branch_count: i64,
    pub default_branch: String,
    pub description: String,
    pub latest_release_tag: Option<String>,
    pub latest_release_at: Option<DateTime<Utc>>,
    pub latest_tag: Option<String>,
    pub latest_tag_at: Option<DateTime<Utc>>,
    pub updated_at: Option<DateTime<Utc>>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub is_fork: bool,
    pub fork_parent: String,
    pub is_private: bool,
    pub is_archived: bool,
    pub primary_language: String,
    pub homepage: String,
    pub created_at: Option<DateTime<Utc>>,
    pub disk_usage_kb: i64,
    pub license_key: String,
    pub license_name: String,
    pub topics: Vec<String>,
    pub has_issues: bool,
    pub has_wiki: bool,
    pub has_discussions: bool,
    pub url: String,
    pub ssh_url: String,
    pub clone_url: String,
}

/// Split the repo list into fixed-size chunks
///
/// A zero chunk size falls back to the default. Concatenating the chunks in
/// order yields the input unchanged.
pub fn chunk_repos(repos: &[RepoRef], chunk_size: usize) -> Vec<Vec<RepoRef>> {
    let size = if chunk_size == 0 {
        DEFAULT_CHUNK_SIZE
    } else {
        chunk_size
    };

    repos.chunks(size).map(|chunk| chunk.to_vec()).collect()
}

/// Build one aliased query document for the given repositories
///
/// Empty input yields an empty document.
pub fn build_batch_query(repos: &[RepoRef]) -> String {
    if repos.is_empty() {
        return String::new();
    }

    let mut query = String::from("query BatchRepoMetadata {\n");
    for (i, repo) in repos.iter().enumerate() {
        query.push_str(&format!(
            "  repo{}: repository(owner: \"{}\", name: \"{}\") {{\n    ...RepoFields\n  }}\n",
            i,
            escape(&repo.owner),
            escape(&repo.name)
        ));
    }
    query.push_str("}\n");
    query.push_str(&format!(
        r#"fragment RepoFields on Repository {{
  nameWithOwner
  stargazerCount
  forkCount
  watchers {{ totalCount }}
  issues(states: OPEN) {{ totalCount }}
  pullRequests(states: OPEN) {{ totalCount }}
  branches: refs(refPrefix: "refs/heads/") {{ totalCount }}
  defaultBranchRef {{ name }}
  description
  latestRelease {{ tagName publishedAt }}
  tags: refs(refPrefix: "refs/tags/", first: 1, orderBy: {{field: TAG_COMMIT_DATE, direction: DESC}}) {{
    nodes {{ name target {{ ... on Commit {{ committedDate }} ... on Tag {{ tagger {{ date }} }} }} }}
  }}
  updatedAt
  pushedAt
  isFork
  parent {{ nameWithOwner }}
  isPrivate
  isArchived
  primaryLanguage {{ name }}
  homepageUrl
  createdAt
  diskUsage
  licenseInfo {{ key name }}
  repositoryTopics(first: {}) {{ nodes {{ topic {{ name }} }} }}
  hasIssuesEnabled
  hasWikiEnabled
  hasDiscussionsEnabled
  url
  sshUrl
}}
"#,
        MAX_TOPICS
    ));

    query
}

/// Parse an aliased batch response into a map keyed by full name
///
/// Aliases that are absent or non-objects (private, hidden, deleted, or
/// inaccessible repositories) are skipped without failing the batch.
pub fn parse_batch_response(data: &Value, repos: &[RepoRef]) -> HashMap<String, RepoMetadata> {
    let mut result = HashMap::new();

    for (i, repo) in repos.iter().enumerate() {
        let alias = format!("repo{}", i);
        let node = match data.get(&alias) {
            Some(node) if node.is_object() => node,
            _ => {
                tracing::debug!("batch alias {} ({}) not accessible", alias, repo.full_name());
                continue;
            }
        };

        let metadata = project_repository(node, repo);
        result.insert(metadata.full_name.clone(), metadata);
    }

    result
}

/// Project one repository node into a metadata record
fn project_repository(node: &Value, repo: &RepoRef) -> RepoMetadata {
    let mut meta = RepoMetadata::default();

    meta.full_name = match str_field(node, "nameWithOwner") {
        name if !name.is_empty() => name,
        _ => repo.full_name(),
    };

    meta.stars = int_field(node, "stargazerCount");
    meta.forks = int_field(node, "forkCount");
    meta.watchers = total_count(node, "watchers");
    meta.open_issues = total_count(node, "issues");
    meta.open_prs = total_count(node, "pullRequests");
    meta.branch_count = total_count(node, "branches");

    meta.default_branch = nested_str(node, &["defaultBranchRef", "name"]);
    meta.description = str_field(node, "description");

    if let Some(release) = node.get("latestRelease").filter(|v| v.is_object()) {
        meta.latest_release_tag = opt_str_field(release, "tagName");
        meta.latest_release_at = time_field(release, "publishedAt");
    }

    if let Some(tag_node) = node
        .get("tags")
        .and_then(|t| t.get("nodes"))
        .and_then(|n| n.as_array())
        .and_then(|nodes| nodes.first())
    {
        meta.latest_tag = opt_str_field(tag_node, "name");
        if let Some(target) = tag_node.get("target") {
            // Lightweight tags point at a commit; annotated tags carry a tagger
            meta.latest_tag_at = time_field(target, "committedDate")
                .or_else(|| target.get("tagger").and_then(|t| time_field(t, "date")));
        }
    }

    meta.updated_at = time_field(node, "updatedAt");
    meta.pushed_at = time_field(node, "pushedAt");
    meta.created_at = time_field(node, "createdAt");

    meta.is_fork = bool_field(node, "isFork");
    meta.fork_parent = nested_str(node, &["parent", "nameWithOwner"]);
    meta.is_private = bool_field(node, "isPrivate");
    meta.is_archived = bool_field(node, "isArchived");

    meta.primary_language = nested_str(node, &["primaryLanguage", "name"]);
    meta.homepage = str_field(node, "homepageUrl");
    meta.disk_usage_kb = int_field(node, "diskUsage");

    if let Some(license) = node.get("licenseInfo").filter(|v| v.is_object()) {
        meta.license_key = str_field(license, "key");
        meta.license_name = str_field(license, "name");
    }

    if let Some(nodes) = node
        .get("repositoryTopics")
        .and_then(|t| t.get("nodes"))
        .and_then(|n| n.as_array())
    {
        meta.topics = nodes
            .iter()
            .map(|n| nested_str(n, &["topic", "name"]))
            .filter(|name| !name.is_empty())
            .collect();
    }

    meta.has_issues = bool_field(node, "hasIssuesEnabled");
    meta.has_wiki = bool_field(node, "hasWikiEnabled");
    meta.has_discussions = bool_field(node, "hasDiscussionsEnabled");

    meta.url = str_field(node, "url");
    meta.ssh_url = str_field(node, "sshUrl");
    if !meta.url.is_empty() {
        meta.clone_url = format!("{}.git", meta.url);
    }

    meta
}

fn escape(value: &str) -> String {
    value.replace('\\', "\\\\").replace('"', "\\\"")
}

fn str_field(node: &Value, key: &str) -> String {
    node.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

fn opt_str_field(node: &Value, key: &str) -> Option<String> {
    node.get(key)
        .and_then(|v| v.as_str())
        .map(|s| s.to_string())
}

fn nested_str(node: &Value, path: &[&str]) -> String {
    let mut current = node;
    for key in path {
        match current.get(key) {
            Some(next) => current = next,
            None => return String::new(),
        }
    }
    current.as_str().unwrap_or_default().to_string()
}

fn int_field(node: &Value, key: &str) -> i64 {
    node.get(key).and_then(|v| v.as_i64()).unwrap_or_default()
}

fn bool_field(node: &Value, key: &str) -> bool {
    node.get(key).and_then(|v| v.as_bool()).unwrap_or_default()
}

fn total_count(node: &Value, key: &str) -> i64 {
    node.get(key)
        .and_then(|v| v.get("totalCount"))
        .and_then(|v| v.as_i64())
        .unwrap_or_default()
}

fn time_field(node: &Value, key: &str) -> Option<DateTime<Utc>> {
    node.get(key)
        .and_then(|v| v.as_str())
        .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
        .map(|dt| dt.with_timezone(&Utc))
}
