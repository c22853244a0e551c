//! Failure-pattern analytics over stored receipts

use super::Receipt;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;

/// How many distinct error messages to keep in `top_errors`
const TOP_ERRORS: usize = 10;

/// Coarse failure bucket derived from error text
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FailureCategory {
    RateLimit,
    Timeout,
    Auth,
    Validation,
    ServiceUnavailable,
    Other,
}

impl FailureCategory {
    /// Classify an error message by substring
    pub fn categorize(error: &str) -> Self {
        let error_lower = error.to_lowercase();
        let has = |needles: &[&str]| needles.iter().any(|n| error_lower.contains(n));

        if has(&["rate limit", "rate_limit", "ratelimit", "too many requests", "429", "throttl"]) {
            FailureCategory::RateLimit
        } else if has(&["timeout", "timed out", "deadline exceeded"]) {
            FailureCategory::Timeout
        } else if has(&[
            "unauthorized",
            "forbidden",
            "authentication",
            "auth",
            "401",
            "403",
            "permission",
            "token",
        ]) {
            FailureCategory::Auth
        } else if has(&["validation", "invalid", "malformed", "bad request", "400"]) {
            FailureCategory::Validation
        } else if has(&[
            "unavailable",
            "503",
            "502",
            "bad gateway",
            "connection",
            "refused",
        ]) {
            FailureCategory::ServiceUnavailable
        } else {
            FailureCategory::Other
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FailureCategory::RateLimit => "rate_limit",
            FailureCategory::Timeout => "timeout",
            FailureCategory::Auth => "auth",
            FailureCategory::Validation => "validation",
            FailureCategory::ServiceUnavailable => "service_unavailable",
            FailureCategory::Other => "other",
        }
    }
}

impl fmt::Display for FailureCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Failure breakdown by platform and category
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct FailureAnalysis {
    pub total_receipts: usize,
    pub total_results: usize,
    pub total_failures: usize,
    pub failure_rate: f64,
    pub by_platform: HashMap<String, usize>,
    pub by_category: HashMap<FailureCategory, usize>,
    pub by_platform_category: HashMap<String, HashMap<FailureCategory, usize>>,
    /// Most frequent error messages, most common first
    pub top_errors: Vec<(String, usize)>,
}

impl FailureAnalysis {
    pub fn from_receipts(receipts: &[Receipt]) -> Self {
        let mut analysis = FailureAnalysis {
            total_receipts: receipts.len(),
            ..Default::default()
        };
        let mut error_counts: HashMap<&str, usize> = HashMap::new();

        for result in receipts.iter().flat_map(|r| r.results.iter()) {
            analysis.total_results += 1;
            if result.success {
                continue;
            }

            analysis.total_failures += 1;
            let error = result.error.as_deref().unwrap_or("");
            let category = FailureCategory::categorize(error);

            *analysis
                .by_platform
                .entry(result.platform.clone())
                .or_default() += 1;
            *analysis.by_category.entry(category).or_default() += 1;
            *analysis
                .by_platform_category
                .entry(result.platform.clone())
                .or_default()
                .entry(category)
                .or_default() += 1;
            if !error.is_empty() {
                *error_counts.entry(error).or_default() += 1;
            }
        }

        if analysis.total_results > 0 {
            analysis.failure_rate = analysis.total_failures as f64 / analysis.total_results as f64;
        }

        let mut top: Vec<(String, usize)> = error_counts
            .into_iter()
            .map(|(error, count)| (error.to_string(), count))
            .collect();
        top.sort_by(|a, b| b.1.cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
        top.truncate(TOP_ERRORS);
        analysis.top_errors = top;

        analysis
    }

    /// Platform with the most failures, if any failed
    pub fn worst_platform(&self) -> Option<(&str, usize)> {
        self.by_platform
            .iter()
            .max_by(|a, b| a.1.cmp(b.1).then_with(|| b.0.cmp(a.0)))
            .map(|(platform, count)| (platform.as_str(), *count))
    }
}
