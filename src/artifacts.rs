//! CI artifact parsing
//!
//! Parsers for the build artifacts the CI collector downloads. Each format
//! has a JSON-primary or markdown-fallback role; all parsers are total
//! functions returning `None` on malformed or empty input so the collector
//! can move on to the next source.

use regex::Regex;
use serde_json::Value;

/// Source-line and file counts extracted from a build artifact
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LocCounts {
    pub go_loc: i64,
    pub test_loc: i64,
    pub go_files: i64,
    pub test_files: i64,
}

/// Parse a count that may be comma-formatted ("1,234") or wrapped in bold
/// markers ("**1,234**")
pub fn normalize_count(raw: &str) -> Option<i64> {
    let trimmed = raw.trim().trim_matches('*').replace(',', "");
    if trimmed.is_empty() {
        return None;
    }
    trimmed.parse().ok()
}

/// Parse the `loc-stats` JSON artifact
///
/// An object with all four counts zero is rejected as "no data" so the
/// markdown fallback gets a chance to run.
pub fn parse_loc_stats(content: &str) -> Option<LocCounts> {
    let value: Value = serde_json::from_str(content).ok()?;
    if !value.is_object() {
        return None;
    }

    let counts = LocCounts {
        go_loc: int_field(&value, "go_files_loc"),
        test_loc: int_field(&value, "test_files_loc"),
        go_files: int_field(&value, "go_files_count"),
        test_files: int_field(&value, "test_files_count"),
    };

    if counts == LocCounts::default() {
        None
    } else {
        Some(counts)
    }
}

/// Parse the `statistics-section` markdown artifact
///
/// Looks for table rows whose first cell contains "Go Files" or
/// "Test Files"; the second cell is LOC, the third the file count.
pub fn parse_statistics_markdown(content: &str) -> Option<LocCounts> {
    let mut counts = LocCounts::default();
    let mut found = false;

    for line in content.lines() {
        if !line.contains('|') {
            continue;
        }

        let cells: Vec<&str> = line
            .split('|')
            .map(|cell| cell.trim())
            .filter(|cell| !cell.is_empty())
            .collect();

        if cells.len() < 3 {
            continue;
        }

        let (loc, files) = match (normalize_count(cells[1]), normalize_count(cells[2])) {
            (Some(loc), Some(files)) => (loc, files),
            _ => continue,
        };

        if cells[0].contains("Go Files") {
            counts.go_loc = loc;
            counts.go_files = files;
            found = true;
        } else if cells[0].contains("Test Files") {
            counts.test_loc = loc;
            counts.test_files = files;
            found = true;
        }
    }

    if found {
        Some(counts)
    } else {
        None
    }
}

/// Parse the `coverage-stats-internal` JSON artifact
///
/// Accepts `coverage_percentage` or `coverage_percent`, numeric or decimal
/// string; "N/A" and null yield absent, as does a value outside [0, 100].
pub fn parse_coverage(content: &str) -> Option<f64> {
    let value: Value = serde_json::from_str(content).ok()?;

    let raw = value
        .get("coverage_percentage")
        .or_else(|| value.get("coverage_percent"))?;

    let coverage = match raw {
        Value::Number(n) => n.as_f64()?,
        Value::String(s) => {
            let trimmed = s.trim();
            if trimmed.eq_ignore_ascii_case("n/a") {
                return None;
            }
            trimmed.parse().ok()?
        }
        _ => return None,
    };

    if (0.0..=100.0).contains(&coverage) {
        Some(coverage)
    } else {
        None
    }
}

/// Parse a `ci-results` JSONL artifact
///
/// Scans for the summary line; `summary.unique_total` wins over
/// `summary.total`.
pub fn parse_ci_results_jsonl(content: &str) -> Option<i64> {
    for line in content.lines() {
        let value: Value = match serde_json::from_str(line.trim()) {
            Ok(value) => value,
            Err(_) => continue,
        };

        if value.get("type").and_then(|t| t.as_str()) != Some("summary") {
            continue;
        }

        let summary = value.get("summary")?;
        let count = summary
            .get("unique_total")
            .and_then(|v| v.as_i64())
            .or_else(|| summary.get("total").and_then(|v| v.as_i64()));

        if count.is_some() {
            return count;
        }
    }

    None
}

/// Parse the `tests-section` markdown artifact
///
/// The largest number adjacent to "tests", "test" or "total" wins.
pub fn parse_tests_markdown(content: &str) -> Option<i64> {
    let pattern = Regex::new(r"(?i)(\d[\d,]*)\s+(tests?|total)").expect("static regex");

    content
        .lines()
        .flat_map(|line| pattern.captures_iter(line))
        .filter_map(|captures| normalize_count(&captures[1]))
        .max()
}

/// Parse a `bench-stats` JSON artifact
pub fn parse_bench_stats(content: &str) -> Option<i64> {
    let value: Value = serde_json::from_str(content).ok()?;
    value.get("benchmark_count").and_then(|v| v.as_i64())
}

fn int_field(value: &Value, key: &str) -> i64 {
    value.get(key).and_then(|v| v.as_i64()).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_count_variants() {
        assert_eq!(normalize_count("1234"), Some(1234));
        assert_eq!(normalize_count("1,234"), Some(1234));
        assert_eq!(normalize_count("**1,234**"), Some(1234));
        assert_eq!(normalize_count("  42  "), Some(42));
        assert_eq!(normalize_count("N/A"), None);
        assert_eq!(normalize_count(""), None);
    }

    #[test]
    fn test_loc_stats_happy_path() {
        let content = r#"{"go_files_loc": 15000, "test_files_loc": 8000, "go_files_count": 120, "test_files_count": 45}"#;
        let counts = parse_loc_stats(content).unwrap();
        assert_eq!(counts.go_loc, 15000);
        assert_eq!(counts.test_loc, 8000);
        assert_eq!(counts.go_files, 120);
        assert_eq!(counts.test_files, 45);
    }

    #[test]
    fn test_loc_stats_all_zero_rejected() {
        let content = r#"{"go_files_loc": 0, "test_files_loc": 0, "go_files_count": 0, "test_files_count": 0}"#;
        assert!(parse_loc_stats(content).is_none());
    }

    #[test]
    fn test_loc_stats_malformed_rejected() {
        assert!(parse_loc_stats("not json").is_none());
        assert!(parse_loc_stats("[1, 2]").is_none());
    }

    #[test]
    fn test_statistics_markdown_table() {
        let content = r#"
## Statistics

| Category | LOC | Files |
|----------|-----|-------|
| Go Files | **15,234** | 120 |
| Test Files | 8,100 | **45** |
| Other | 3 | 1 |
"#;
        let counts = parse_statistics_markdown(content).unwrap();
        assert_eq!(counts.go_loc, 15234);
        assert_eq!(counts.go_files, 120);
        assert_eq!(counts.test_loc, 8100);
        assert_eq!(counts.test_files, 45);
    }

    #[test]
    fn test_statistics_markdown_without_rows() {
        assert!(parse_statistics_markdown("no tables here").is_none());
        assert!(parse_statistics_markdown("| Header | A | B |\n|---|---|---|").is_none());
    }

    #[test]
    fn test_coverage_numeric_and_string() {
        assert_eq!(parse_coverage(r#"{"coverage_percentage": 84.3}"#), Some(84.3));
        assert_eq!(parse_coverage(r#"{"coverage_percent": "72.5"}"#), Some(72.5));
        assert_eq!(parse_coverage(r#"{"coverage_percentage": "N/A"}"#), None);
        assert_eq!(parse_coverage(r#"{"coverage_percentage": null}"#), None);
        assert_eq!(parse_coverage(r#"{"unrelated": 10}"#), None);
        // Out-of-range values are treated as absent
        assert_eq!(parse_coverage(r#"{"coverage_percent": 123.0}"#), None);
    }

    #[test]
    fn test_ci_results_prefers_unique_total() {
        let content = r#"{"type": "test", "name": "TestFoo"}
{"type": "summary", "summary": {"unique_total": 412, "total": 450}}"#;
        assert_eq!(parse_ci_results_jsonl(content), Some(412));
    }

    #[test]
    fn test_ci_results_falls_back_to_total() {
        let content = r#"{"type": "summary", "summary": {"total": 450}}"#;
        assert_eq!(parse_ci_results_jsonl(content), Some(450));
    }

    #[test]
    fn test_ci_results_skips_garbage_lines() {
        let content = "not json\n{\"type\": \"other\"}\n{\"type\": \"summary\", \"summary\": {\"unique_total\": 7}}";
        assert_eq!(parse_ci_results_jsonl(content), Some(7));
    }

    #[test]
    fn test_ci_results_without_summary() {
        assert_eq!(parse_ci_results_jsonl("{\"type\": \"test\"}"), None);
    }

    #[test]
    fn test_tests_markdown_picks_largest() {
        let content = r#"
Ran 12 tests in package a
Ran 1,045 tests in package b
Grand total: 1,102 total
"#;
        assert_eq!(parse_tests_markdown(content), Some(1102));
    }

    #[test]
    fn test_tests_markdown_singular_and_case() {
        assert_eq!(parse_tests_markdown("exactly 1 test passed"), Some(1));
        assert_eq!(parse_tests_markdown("999 TESTS"), Some(999));
        assert_eq!(parse_tests_markdown("no numbers here"), None);
    }

    #[test]
    fn test_bench_stats() {
        assert_eq!(parse_bench_stats(r#"{"benchmark_count": 14}"#), Some(14));
        assert_eq!(parse_bench_stats(r#"{"benchmark_count": 0}"#), Some(0));
        assert_eq!(parse_bench_stats(r#"{}"#), None);
        assert_eq!(parse_bench_stats("bogus"), None);
    }
}
