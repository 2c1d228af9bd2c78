//! Metadata pipeline
//!
//! Turns a repository list into a metadata map by dispatching chunked batch
//! queries sequentially. Chunks that trip the forge's query-complexity limit
//! are re-split into smaller sub-chunks and retried; anything else that
//! fails is logged and skipped, so the return value is always a best-effort
//! map. Only cancellation is fatal.

use crate::batch::{build_batch_query, chunk_repos, parse_batch_response, RepoMetadata, RepoRef};
use crate::error::{is_cancelled, CollectorError};
use crate::forge::ForgeClient;
use crate::throttle::Throttle;
use anyhow::Result;
use std::collections::HashMap;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Substrings that mark a GraphQL error as query-complexity exhaustion
const COMPLEXITY_MARKERS: &[&str] = &["complexity", "too complex", "query cost"];

/// Classify an error as query-complexity exhaustion
pub fn is_complexity_error(err: &anyhow::Error) -> bool {
    let text = format!("{:#}", err).to_ascii_lowercase();
    COMPLEXITY_MARKERS.iter().any(|marker| text.contains(marker))
}

/// Sequential batch dispatcher for repository metadata
pub struct MetadataPipeline {
    forge: Arc<dyn ForgeClient>,
    throttle: Arc<Throttle>,
    chunk_size: usize,
    fallback_chunk_size: usize,
}

impl MetadataPipeline {
    pub fn new(
        forge: Arc<dyn ForgeClient>,
        throttle: Arc<Throttle>,
        chunk_size: usize,
        fallback_chunk_size: usize,
    ) -> Self {
        Self {
            forge,
            throttle,
            chunk_size,
            fallback_chunk_size,
        }
    }

    /// Collect metadata for every accessible repository in the input
    ///
    /// A single-repo lookup is just a batch of one. Zero repos means zero
    /// forge calls.
    pub async fn collect(
        &self,
        repos: &[RepoRef],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, RepoMetadata>> {
        let mut results = HashMap::new();

        for chunk in chunk_repos(repos, self.chunk_size) {
            if cancel.is_cancelled() {
                return Err(CollectorError::Cancelled.into());
            }

            match self.fetch_chunk(&chunk, cancel).await {
                Ok(batch) => {
                    results.extend(batch);
                }
                Err(err) if is_cancelled(&err) => return Err(err),
                Err(err) if is_complexity_error(&err) => {
                    warn!(
                        "metadata batch of {} exceeded query complexity, retrying in chunks of {}",
                        chunk.len(),
                        self.fallback_chunk_size
                    );

                    for sub_chunk in chunk_repos(&chunk, self.fallback_chunk_size) {
                        if cancel.is_cancelled() {
                            return Err(CollectorError::Cancelled.into());
                        }

                        match self.fetch_chunk(&sub_chunk, cancel).await {
                            Ok(batch) => {
                                results.extend(batch);
                            }
                            Err(err) if is_cancelled(&err) => return Err(err),
                            Err(err) => {
                                warn!(
                                    "skipping metadata sub-chunk of {}: {:#}",
                                    sub_chunk.len(),
                                    err
                                );
                            }
                        }
                    }
                }
                Err(err) => {
                    warn!("skipping metadata chunk of {}: {:#}", chunk.len(), err);
                }
            }
        }

        debug!(
            "metadata pipeline collected {} of {} repositories",
            results.len(),
            repos.len()
        );
        Ok(results)
    }

    async fn fetch_chunk(
        &self,
        chunk: &[RepoRef],
        cancel: &CancellationToken,
    ) -> Result<HashMap<String, RepoMetadata>> {
        if chunk.is_empty() {
            return Ok(HashMap::new());
        }

        let query = build_batch_query(chunk);
        let data = self
            .throttle
            .run_with_retry(cancel, "metadata batch", || self.forge.graphql(&query))
            .await?;

        Ok(parse_batch_response(&data, chunk))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ThrottleConfig;
    use crate::forge::MockForgeClient;
    use serde_json::{json, Value};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn test_throttle() -> Arc<Throttle> {
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

    fn refs(n: usize) -> Vec<RepoRef> {
        (0..n)
            .map(|i| RepoRef::new("mksg", format!("repo-{}", i)))
            .collect()
    }

    /// Response echoing every alias a query of up to `n` repos could request
    fn echo_response(n: usize) -> Value {
        let mut data = serde_json::Map::new();
        for i in 0..n {
            data.insert(format!("repo{}", i), json!({}));
        }
        Value::Object(data)
    }

    #[test]
    fn test_complexity_classifier() {
        assert!(is_complexity_error(&anyhow::anyhow!(
            "GraphQL errors: Query has complexity 1200, maximum is 1000"
        )));
        assert!(is_complexity_error(&anyhow::anyhow!("query is TOO COMPLEX")));
        assert!(is_complexity_error(&anyhow::anyhow!("query cost exceeded")));
        assert!(!is_complexity_error(&anyhow::anyhow!("rate limit exceeded")));
    }

    #[tokio::test]
    async fn test_zero_repos_makes_no_forge_calls() {
        let forge = Arc::new(MockForgeClient::new());
        let pipeline = MetadataPipeline::new(forge, test_throttle(), 25, 10);

        let results = pipeline
            .collect(&[], &CancellationToken::new())
            .await
            .unwrap();
        assert!(results.is_empty());
    }

    #[tokio::test]
    async fn test_single_chunk_collection() {
        let mut forge = MockForgeClient::new();
        forge
            .expect_graphql()
            .times(1)
            .returning(|_| Ok(echo_response(25)));

        let pipeline = MetadataPipeline::new(Arc::new(forge), test_throttle(), 25, 10);
        let repos = refs(3);
        let results = pipeline
            .collect(&repos, &CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(results.len(), 3);
        assert!(results.contains_key("mksg/repo-0"));
        assert!(results.contains_key("mksg/repo-2"));
    }

    #[tokio::test]
    async fn test_complexity_error_resplits_chunk() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let mut forge = MockForgeClient::new();
        forge.expect_graphql().returning(move |_| {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(anyhow::anyhow!("Query has complexity 1500, maximum is 1000"))
            } else {
                Ok(echo_response(25))
            }
        });

        let pipeline = MetadataPipeline::new(Arc::new(forge), test_throttle(), 25, 10);
        let repos = refs(25);
        let results = pipeline
            .collect(&repos, &CancellationToken::new())
            .await
            .unwrap();

        // First call fails, then 25 repos re-run as 10 + 10 + 5
        assert_eq!(calls.load(Ordering::SeqCst), 4);
        assert_eq!(results.len(), 25);
    }

    #[tokio::test]
    async fn test_failed_sub_chunk_is_skipped() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let mut forge = MockForgeClient::new();
        forge.expect_graphql().returning(move |_| {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            match n {
                0 => Err(anyhow::anyhow!("query cost exceeded")),
                1 => Err(anyhow::anyhow!("unexpected end of JSON input")),
                _ => Ok(echo_response(25)),
            }
        });

        let pipeline = MetadataPipeline::new(Arc::new(forge), test_throttle(), 25, 10);
        let repos = refs(20);
        let results = pipeline
            .collect(&repos, &CancellationToken::new())
            .await
            .unwrap();

        // The first sub-chunk of 10 was lost, the second succeeded
        assert_eq!(results.len(), 10);
        for i in 10..20 {
            assert!(results.contains_key(&format!("mksg/repo-{}", i)));
        }
    }

    #[tokio::test]
    async fn test_non_complexity_error_skips_chunk_and_continues() {
        let calls = Arc::new(AtomicU32::new(0));
        let calls_clone = calls.clone();

        let mut forge = MockForgeClient::new();
        forge.expect_graphql().returning(move |_| {
            let n = calls_clone.fetch_add(1, Ordering::SeqCst);
            if n == 0 {
                Err(anyhow::anyhow!("bad gateway"))
            } else {
                Ok(echo_response(25))
            }
        });

        let pipeline = MetadataPipeline::new(Arc::new(forge), test_throttle(), 10, 5);
        let repos = refs(15);
        let results = pipeline
            .collect(&repos, &CancellationToken::new())
            .await
            .unwrap();

        // Chunk of 10 lost, trailing chunk of 5 collected
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(results.len(), 5);
    }

    #[tokio::test]
    async fn test_cancellation_is_fatal() {
        let forge = Arc::new(MockForgeClient::new());
        let pipeline = MetadataPipeline::new(forge, test_throttle(), 25, 10);
        let cancel = CancellationToken::new();
        cancel.cancel();

        let err = pipeline.collect(&refs(5), &cancel).await.unwrap_err();
        assert!(is_cancelled(&err));
    }
}
