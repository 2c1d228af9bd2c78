//! Change-aware repository snapshots
//!
//! A snapshot captures the small volatile field set that downstream trend
//! reporting consumes. [`has_changed`] compares a freshly collected snapshot
//! against the latest stored one so unchanged repositories skip the write.

use chrono::{DateTime, Utc};

/// Point-in-time capture of a repository's volatile fields plus alert counts
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RepoSnapshot {
    pub stars: i64,
    pub forks: i64,
    pub open_issues: i64,
    pub open_prs: i64,
    pub branch_count: i64,
    pub latest_release: Option<String>,
    pub latest_tag: Option<String>,
    pub pushed_at: Option<DateTime<Utc>>,
    pub dependency_alerts: i64,
    pub code_scanning_alerts: i64,
    pub secret_scanning_alerts: i64,
    pub snapshot_at: Option<DateTime<Utc>>,
}

/// Decide whether a new snapshot warrants a write
///
/// Returns true when there is no previous snapshot, or when any tracked
/// field differs. `snapshot_at` never participates in the comparison.
pub fn has_changed(current: &RepoSnapshot, previous: Option<&RepoSnapshot>) -> bool {
    let previous = match previous {
        Some(previous) => previous,
        None => return true,
    };

    current.stars != previous.stars
        || current.forks != previous.forks
        || current.open_issues != previous.open_issues
        || current.open_prs != previous.open_prs
        || current.branch_count != previous.branch_count
        || current.latest_release != previous.latest_release
        || current.latest_tag != previous.latest_tag
        || current.pushed_at != previous.pushed_at
        || current.dependency_alerts != previous.dependency_alerts
        || current.code_scanning_alerts != previous.code_scanning_alerts
        || current.secret_scanning_alerts != previous.secret_scanning_alerts
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn baseline() -> RepoSnapshot {
        RepoSnapshot {
            stars: 100,
            forks: 10,
            open_issues: 5,
            open_prs: 2,
            branch_count: 8,
            latest_release: Some("v1.0.0".to_string()),
            latest_tag: Some("v1.0.0".to_string()),
            pushed_at: Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap()),
            dependency_alerts: 2,
            code_scanning_alerts: 1,
            secret_scanning_alerts: 0,
            snapshot_at: Some(Utc.with_ymd_and_hms(2025, 6, 2, 0, 0, 0).unwrap()),
        }
    }

    #[test]
    fn test_no_previous_always_changes() {
        assert!(has_changed(&baseline(), None));
    }

    #[test]
    fn test_identical_snapshot_is_unchanged() {
        let current = baseline();
        let previous = baseline();
        assert!(!has_changed(&current, Some(&previous)));
    }

    #[test]
    fn test_each_tracked_field_flips_the_result() {
        let previous = baseline();

        let mutations: Vec<Box<dyn Fn(&mut RepoSnapshot)>> = vec![
            Box::new(|s| s.stars += 1),
            Box::new(|s| s.forks += 1),
            Box::new(|s| s.open_issues += 1),
            Box::new(|s| s.open_prs += 1),
            Box::new(|s| s.branch_count += 1),
            Box::new(|s| s.latest_release = Some("v1.1.0".to_string())),
            Box::new(|s| s.latest_tag = None),
            Box::new(|s| s.pushed_at = Some(Utc.with_ymd_and_hms(2025, 6, 3, 0, 0, 0).unwrap())),
            Box::new(|s| s.dependency_alerts += 1),
            Box::new(|s| s.code_scanning_alerts += 1),
            Box::new(|s| s.secret_scanning_alerts += 1),
        ];

        for (i, mutate) in mutations.iter().enumerate() {
            let mut current = baseline();
            mutate(&mut current);
            assert!(
                has_changed(&current, Some(&previous)),
                "mutation {} should flip the result",
                i
            );
        }
    }

    #[test]
    fn test_untracked_field_never_flips() {
        let previous = baseline();
        let mut current = baseline();
        current.snapshot_at = Some(Utc.with_ymd_and_hms(2025, 6, 9, 0, 0, 0).unwrap());

        assert!(!has_changed(&current, Some(&previous)));
    }

    #[test]
    fn test_pushed_at_nullable_equality() {
        // Both absent is equal
        let mut current = baseline();
        let mut previous = baseline();
        current.pushed_at = None;
        previous.pushed_at = None;
        assert!(!has_changed(&current, Some(&previous)));

        // Present vs absent differs
        current.pushed_at = Some(Utc.with_ymd_and_hms(2025, 6, 1, 12, 0, 0).unwrap());
        assert!(has_changed(&current, Some(&previous)));
    }
}
