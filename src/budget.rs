//! Rate-limit budget checks
//!
//! Before a sync starts, estimate how many API calls it will spend and warn
//! the user when the remaining quota cannot cover it.

use crate::batch::DEFAULT_CHUNK_SIZE;
use crate::forge::RateLimitStatus;
use crate::output::Reporter;

/// Per-repo call cost bounds: one batch share plus three security calls at
/// minimum; CI listing and artifact downloads push it toward the maximum
const MIN_CALLS_PER_REPO: i64 = 4;
const MAX_CALLS_PER_REPO: i64 = 10;

/// Estimated API spend for one sync
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BudgetEstimate {
    pub repo_count: usize,
    pub min_calls: i64,
    pub max_calls: i64,
    pub graphql_batches: i64,
}

/// Estimate the call cost of syncing `repo_count` repositories
pub fn estimate_sync_cost(repo_count: usize) -> BudgetEstimate {
    let n = repo_count as i64;
    BudgetEstimate {
        repo_count,
        min_calls: MIN_CALLS_PER_REPO * n,
        max_calls: MAX_CALLS_PER_REPO * n,
        graphql_batches: (n + DEFAULT_CHUNK_SIZE as i64 - 1) / DEFAULT_CHUNK_SIZE as i64,
    }
}

/// Report the current quota and warn when it looks short for the sync
pub fn check_budget(
    status: &RateLimitStatus,
    repo_count: usize,
    reporter: &dyn Reporter,
) -> BudgetEstimate {
    let estimate = estimate_sync_cost(repo_count);
    let reset = status.reset_at.format("%H:%M:%S");

    reporter.info(&format!(
        "API budget: {}/{} calls remaining ({} used), resets at {}",
        status.remaining, status.limit, status.used, reset
    ));

    if status.remaining < estimate.min_calls {
        reporter.warn(&format!(
            "API budget critically low: {} calls remaining but the sync needs at least {}, resets at {}",
            status.remaining, estimate.min_calls, reset
        ));
    } else if status.remaining < estimate.max_calls {
        reporter.warn(&format!(
            "API budget tight: {} calls remaining, the sync may need up to {}",
            status.remaining, estimate.max_calls
        ));
    }

    estimate
}
