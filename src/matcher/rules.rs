//! Scoring and heuristics behind fix suggestions.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;

use crate::config::{pattern_matches, MatcherConfig};
use crate::models::UpdateType;
use crate::version::{compare_versions, is_concrete};

/// Candidate target versions named in free-text remediation guidance.
pub fn remediation_versions(text: &str) -> Vec<String> {
    static PATTERNS: OnceLock<Vec<Regex>> = OnceLock::new();
    let patterns = PATTERNS.get_or_init(|| {
        [
            r"(?i)\b(?:upgrade|update|bump)[a-z]*\b[^.\n]*?\bto\s+(?:version\s+)?v?(\d+(?:\.\d+)+[\w.\-]*)",
            r"(?i)\bfixed\s+in\s+(?:version\s+)?v?(\d+(?:\.\d+)+[\w.\-]*)",
            r"(?i)\bv?(\d+(?:\.\d+)+[\w.\-]*)\s+(?:or|and)\s+(?:later|higher|above|newer)",
        ]
        .iter()
        .map(|p| Regex::new(p).expect("valid regex"))
        .collect()
    });

    let mut found: Vec<String> = Vec::new();
    for re in patterns {
        for caps in re.captures_iter(text) {
            let version = caps[1].trim_end_matches(['.', '-']).to_string();
            if !found.contains(&version) {
                found.push(version);
            }
        }
    }
    found
}

/// Lowest version in `candidates` strictly above `current`.
pub fn lowest_above<'a, I>(candidates: I, current: &str) -> Option<String>
where
    I: IntoIterator<Item = &'a String>,
{
    let current_concrete = is_concrete(current);
    candidates
        .into_iter()
        .filter(|v| is_concrete(v))
        .filter(|v| !current_concrete || compare_versions(v, current) == Ordering::Greater)
        .min_by(|a, b| compare_versions(a, b))
        .cloned()
}

/// Update type assumed when no target version is known.
pub fn family_update_type(config: &MatcherConfig, name: &str) -> UpdateType {
    config
        .family_update_types
        .iter()
        .find(|rule| pattern_matches(&rule.pattern, name))
        .map(|rule| rule.update_type)
        .unwrap_or(config.default_update_type)
}

/// Notes of every breaking-change rule the update triggers.
pub fn breaking_changes(config: &MatcherConfig, name: &str, update_type: UpdateType) -> Vec<String> {
    config
        .breaking_changes
        .iter()
        .filter(|rule| update_type >= rule.min_update && pattern_matches(&rule.pattern, name))
        .map(|rule| rule.note.clone())
        .fold(Vec::new(), |mut notes, note| {
            if !notes.contains(&note) {
                notes.push(note);
            }
            notes
        })
}

/// Start at 1.0, subtract the configured penalties, keep within
/// `[min_confidence, 1.0]` (never below 0.1).
pub fn confidence(
    config: &MatcherConfig,
    update_type: UpdateType,
    breaking_count: usize,
    is_dev: bool,
) -> f64 {
    let mut score = 1.0;
    match update_type {
        UpdateType::Major | UpdateType::Alternative => score -= config.major_penalty,
        UpdateType::Minor => score -= config.minor_penalty,
        UpdateType::Patch => {}
    }
    score -= config.breaking_change_penalty * breaking_count as f64;
    if is_dev {
        score -= config.dev_penalty;
    }
    let floor = config.min_confidence.max(0.1).min(1.0);
    score.max(floor).min(1.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_remediation_patterns() {
        assert_eq!(
            remediation_versions("Users should upgrade to version 2.8.9 or apply the patch."),
            vec!["2.8.9"]
        );
        assert_eq!(remediation_versions("This issue is fixed in 1.2.3."), vec!["1.2.3"]);
        assert_eq!(
            remediation_versions("Use lodash 4.17.21 or later."),
            vec!["4.17.21"]
        );
        assert_eq!(
            remediation_versions("Bump spring-web to 5.3.32, fixed in 5.3.32"),
            vec!["5.3.32"]
        );
        assert!(remediation_versions("No fix is available.").is_empty());
    }

    #[test]
    fn test_lowest_above() {
        let fixed = vec!["2.9.0".to_string(), "2.8.9".to_string(), "2.7.1".to_string()];
        assert_eq!(lowest_above(&fixed, "2.8.0"), Some("2.8.9".to_string()));
        assert_eq!(lowest_above(&fixed, "3.0.0"), None);
        assert_eq!(lowest_above(&fixed, "*"), Some("2.7.1".to_string()));
    }

    #[test]
    fn test_confidence_bounds() {
        let config = MatcherConfig::default();
        assert_eq!(confidence(&config, UpdateType::Patch, 0, false), 1.0);
        assert!((confidence(&config, UpdateType::Major, 1, true) - 0.55).abs() < 1e-9);
        assert_eq!(confidence(&config, UpdateType::Major, 20, true), 0.1);

        let harsh = MatcherConfig {
            min_confidence: -5.0,
            major_penalty: 3.0,
            ..MatcherConfig::default()
        };
        assert_eq!(confidence(&harsh, UpdateType::Major, 0, false), 0.1);
    }

    #[test]
    fn test_breaking_changes_respect_min_update() {
        let config = MatcherConfig::default();
        let jackson = "com.fasterxml.jackson.core:jackson-databind";
        assert!(breaking_changes(&config, jackson, UpdateType::Patch).is_empty());
        assert_eq!(breaking_changes(&config, jackson, UpdateType::Minor).len(), 1);
        assert!(breaking_changes(&config, "org.springframework:spring-core", UpdateType::Minor).is_empty());
        assert_eq!(breaking_changes(&config, "react", UpdateType::Major).len(), 1);
    }

    #[test]
    fn test_family_update_type_fallback() {
        let config = MatcherConfig::default();
        assert_eq!(family_update_type(&config, "lodash"), UpdateType::Minor);
        assert_eq!(family_update_type(&config, "left-pad"), UpdateType::Major);
    }
}
