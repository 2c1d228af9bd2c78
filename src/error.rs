//! Sentinel error values shared across the collection pipeline
//!
//! Most errors in FleetScope travel as `anyhow::Error` with context attached.
//! The handful of conditions that callers must be able to *recognize* after
//! propagation live here as a typed enum, recoverable at any depth with
//! `anyhow::Error::downcast_ref`.

use thiserror::Error;

/// Errors the pipeline must distinguish from ordinary transport failures
#[derive(Debug, Error)]
pub enum CollectorError {
    /// The ambient cancellation signal fired. Always propagated unchanged.
    #[error("operation cancelled")]
    Cancelled,

    /// The forge answered with a recognizable "this security feature is not
    /// enabled for this repository" response (HTTP 404 class). Triggers a
    /// fallback or a user-visible warning depending on the endpoint.
    #[error("security feature not available for this repository")]
    FeatureUnavailable,

    /// A rate-limited operation did not clear within the retry budget.
    #[error("{operation}: retries exhausted after {attempts} attempts: {last_error}")]
    RetriesExhausted {
        operation: String,
        attempts: u32,
        last_error: String,
    },
}

/// Check whether an error chain bottoms out in the cancellation sentinel
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CollectorError>(),
        Some(CollectorError::Cancelled)
    )
}

/// Check whether an error chain bottoms out in the feature-unavailable sentinel
pub fn is_feature_unavailable(err: &anyhow::Error) -> bool {
    matches!(
        err.downcast_ref::<CollectorError>(),
        Some(CollectorError::FeatureUnavailable)
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sentinels_survive_context_wrapping() {
        let err: anyhow::Error = anyhow::Error::new(CollectorError::FeatureUnavailable)
            .context("listing code scanning alerts for owner/repo");

        assert!(is_feature_unavailable(&err));
        assert!(!is_cancelled(&err));

        let err: anyhow::Error =
            anyhow::Error::new(CollectorError::Cancelled).context("acquiring throttle token");
        assert!(is_cancelled(&err));
        assert!(!is_feature_unavailable(&err));
    }

    #[test]
    fn test_plain_errors_are_not_sentinels() {
        let err = anyhow::anyhow!("connection reset by peer");
        assert!(!is_cancelled(&err));
        assert!(!is_feature_unavailable(&err));
    }

    #[test]
    fn test_retries_exhausted_message() {
        let err = CollectorError::RetriesExhausted {
            operation: "dependency alerts".to_string(),
            attempts: 5,
            last_error: "403 rate limit exceeded".to_string(),
        };
        let text = err.to_string();
        assert!(text.contains("retries exhausted after 5 attempts"));
        assert!(text.contains("403 rate limit exceeded"));
    }
}
