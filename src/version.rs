//! Version strings as they appear in build files.
//!
//! Declared versions are messy: npm ranges (`^4.17.0`), Maven qualifiers
//! (`5.3.18.RELEASE`, `31.1-jre`), Gradle dynamic versions (`1.+`) and plain
//! wildcards. Everything here works on the raw declared text and coerces to
//! [`semver::Version`] only where range arithmetic needs it.

use std::cmp::Ordering;
use std::sync::OnceLock;

use regex::Regex;
use semver::{Version, VersionReq};

use crate::error::MatchError;
use crate::models::UpdateType;

const WILDCARDS: &[&str] = &[
    "*",
    "+",
    "x",
    "X",
    "latest",
    "latest.release",
    "latest.integration",
    "LATEST",
    "RELEASE",
];

/// `true` for versions that pin nothing at all.
pub fn is_wildcard(version: &str) -> bool {
    let v = version.trim();
    v.is_empty() || WILDCARDS.contains(&v)
}

/// Reduce a declared version to a bare version token.
///
/// Strips quotes, range operators and a leading `v`, keeps the first token of
/// compound ranges and maps every wildcard form to `*`. Idempotent.
pub fn normalize(version: &str) -> String {
    let stripped = version.trim_start_matches(|c: char| {
        c.is_whitespace() || matches!(c, '^' | '~' | '=' | '>' | '<' | 'v' | 'V' | '"' | '\'')
    });
    let token = stripped
        .split(|c: char| c.is_whitespace() || c == ',')
        .next()
        .unwrap_or("")
        .trim_end_matches(['"', '\'']);

    if is_wildcard(token) {
        "*".to_string()
    } else {
        token.to_string()
    }
}

/// A version is concrete when it names one release.
pub fn is_concrete(version: &str) -> bool {
    let v = normalize(version);
    v != "*"
        && !v.split('.').any(|part| matches!(part, "+" | "x" | "X" | "*"))
        && !numeric_components(&v).is_empty()
}

/// Coerce to a semantic version the way npm's `semver.coerce` does: first
/// `major[.minor[.patch]]` run wins, missing parts are zero, qualifiers drop.
pub fn coerce(version: &str) -> Option<Version> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(\d+)(?:\.(\d+))?(?:\.(\d+))?").expect("valid regex")
    });

    let normalized = normalize(version);
    let caps = re.captures(&normalized)?;
    let part = |i: usize| -> Option<u64> {
        match caps.get(i) {
            Some(m) => m.as_str().parse().ok(),
            None => Some(0),
        }
    };
    Some(Version::new(part(1)?, part(2)?, part(3)?))
}

/// Leading numeric components, ignoring textual qualifiers.
///
/// `5.3.18.RELEASE` → `[5, 3, 18]`, `31.1-jre` → `[31, 1]`, `2.0.0-RC1` →
/// `[2, 0, 0]`.
pub fn numeric_components(version: &str) -> Vec<u64> {
    let normalized = normalize(version);
    let mut out = Vec::new();
    for part in normalized.split(['.', '-', '_', '+']) {
        let digits: String = part.chars().take_while(|c| c.is_ascii_digit()).collect();
        if digits.is_empty() {
            break;
        }
        match digits.parse::<u64>() {
            Ok(n) => out.push(n),
            Err(_) => break,
        }
        if digits.len() != part.len() {
            break;
        }
    }
    out
}

/// Component-wise numeric comparison; missing components count as zero.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    let left = numeric_components(a);
    let right = numeric_components(b);
    let len = left.len().max(right.len());
    for i in 0..len {
        let l = left.get(i).copied().unwrap_or(0);
        let r = right.get(i).copied().unwrap_or(0);
        match l.cmp(&r) {
            Ordering::Equal => continue,
            other => return other,
        }
    }
    Ordering::Equal
}

pub fn is_downgrade(current: &str, recommended: &str) -> bool {
    is_concrete(current)
        && is_concrete(recommended)
        && compare_versions(recommended, current) == Ordering::Less
}

/// Whether `candidate` should replace `existing` when two declarations of one
/// dependency are merged: concrete beats wildcard, higher beats lower.
pub fn is_more_specific(candidate: &str, existing: &str) -> bool {
    match (is_concrete(candidate), is_concrete(existing)) {
        (true, false) => true,
        (false, true) => false,
        (true, true) => compare_versions(candidate, existing) == Ordering::Greater,
        (false, false) => false,
    }
}

pub fn major_of(version: &str) -> Option<u64> {
    numeric_components(version).first().copied()
}

/// Size of the jump from `current` to `target`.
pub fn update_type(current: &str, target: &str) -> UpdateType {
    let from = numeric_components(current);
    let to = numeric_components(target);
    if from.is_empty() || to.is_empty() {
        return UpdateType::Major;
    }
    let at = |v: &[u64], i: usize| v.get(i).copied().unwrap_or(0);
    if at(&from, 0) != at(&to, 0) {
        UpdateType::Major
    } else if at(&from, 1) != at(&to, 1) {
        UpdateType::Minor
    } else {
        UpdateType::Patch
    }
}

/// Range operator in front of a declared version (`^`, `~`, `>=`, ...).
pub fn range_prefix(declared: &str) -> &str {
    let trimmed = declared.trim_start();
    let end = trimmed
        .find(|c: char| !matches!(c, '^' | '~' | '=' | '>' | '<'))
        .unwrap_or(trimmed.len());
    &trimmed[..end]
}

/// Rewrite `declared` to point at `new_version`, keeping its range operator.
///
/// In a comparator set (`>=1.0 <2.0`) the lower bound moves and upper bounds
/// that still admit `new_version` are kept. Alternatives, hyphen ranges and
/// upper bounds that exclude `new_version` become `^new_version`.
pub fn with_range_prefix(declared: &str, new_version: &str) -> String {
    let new_version = normalize(new_version);
    let declared = declared.trim();
    if declared.contains("||") || declared.contains(" - ") {
        return format!("^{}", new_version);
    }

    let comparators = comparator_tokens(declared);
    if comparators.len() <= 1 {
        return format!("{}{}", range_prefix(declared), new_version);
    }

    let (upper, lower): (Vec<&String>, Vec<&String>) =
        comparators.iter().partition(|c| c.starts_with('<'));
    if upper.is_empty() || !upper.iter().all(|u| satisfies_range(&new_version, u).unwrap_or(false)) {
        return format!("^{}", new_version);
    }
    let lower_op = lower.first().map(|l| range_prefix(l)).unwrap_or(">=");
    let uppers: Vec<&str> = upper.iter().map(|u| u.as_str()).collect();
    format!("{}{} {}", lower_op, new_version, uppers.join(" "))
}

/// `">= 1.0 <2.0"` as `[">=1.0", "<2.0"]`.
fn comparator_tokens(range: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut pending_op = String::new();
    for token in range.split(|c: char| c.is_whitespace() || c == ',').filter(|t| !t.is_empty()) {
        if token.chars().all(|c| matches!(c, '<' | '>' | '=' | '^' | '~')) {
            pending_op.push_str(token);
        } else {
            tokens.push(format!("{}{}", pending_op, token));
            pending_op.clear();
        }
    }
    tokens
}

/// Test membership of `version` in one vulnerability range expression.
///
/// Accepts comparator sets (`>=1.0 <2.0`, `>= 1.0, < 2.0`), `||`
/// alternatives, caret/tilde, bare versions and Maven intervals
/// (`[1.0,2.0)`, `(,1.5]`).
pub fn satisfies_range(version: &str, range: &str) -> Result<bool, MatchError> {
    let target = coerce(version).ok_or_else(|| MatchError(version.to_string()))?;

    let mut parsed_any = false;
    for alternative in range.split("||") {
        let alternative = alternative.trim();
        if alternative.is_empty() {
            continue;
        }
        let result = if alternative.starts_with('[') || alternative.starts_with('(') {
            maven_intervals_contain(&target, alternative)
        } else {
            comparators_match(&target, alternative)
        };
        match result {
            Some(true) => return Ok(true),
            Some(false) => parsed_any = true,
            None => {}
        }
    }

    if parsed_any {
        Ok(false)
    } else {
        Err(MatchError(range.to_string()))
    }
}

fn comparators_match(target: &Version, expr: &str) -> Option<bool> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"(>=|<=|>|<|==|=|\^|~)?\s*v?(\*|\d+(?:\.(?:\d+|x|X|\*))*[0-9A-Za-z.\-+]*)")
            .expect("valid regex")
    });

    let mut matched = false;
    for caps in re.captures_iter(expr) {
        matched = true;
        let op = caps.get(1).map(|m| m.as_str()).unwrap_or("=");
        let raw = &caps[2];
        if raw == "*" {
            continue;
        }
        let bound = coerce(raw)?;
        let ok = match op {
            ">=" => *target >= bound,
            "<=" => *target <= bound,
            ">" => *target > bound,
            "<" => *target < bound,
            "^" | "~" => VersionReq::parse(&format!("{}{}", op, bound))
                .map(|req| req.matches(target))
                .ok()?,
            _ if raw.split('.').any(|p| matches!(p, "x" | "X" | "*")) => {
                let prefix = numeric_components(raw);
                let have = [target.major, target.minor, target.patch];
                prefix.iter().zip(have.iter()).all(|(a, b)| a == b)
            }
            _ => *target == bound,
        };
        if !ok {
            return Some(false);
        }
    }
    if matched {
        Some(true)
    } else {
        None
    }
}

fn maven_intervals_contain(target: &Version, expr: &str) -> Option<bool> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"([\[(])\s*([^,\])]*?)\s*(?:,\s*([^\])]*?)\s*)?([\])])").expect("valid regex")
    });

    let mut matched = false;
    for caps in re.captures_iter(expr) {
        matched = true;
        let lower_inclusive = &caps[1] == "[";
        let upper_inclusive = &caps[4] == "]";
        let lower = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        let has_comma = caps.get(3).is_some();
        let upper = caps.get(3).map(|m| m.as_str()).unwrap_or("");

        if !has_comma {
            // `[1.0]` pins exactly one version
            if coerce(lower)? == *target {
                return Some(true);
            }
            continue;
        }

        let above = if lower.is_empty() {
            true
        } else {
            let bound = coerce(lower)?;
            if lower_inclusive {
                *target >= bound
            } else {
                *target > bound
            }
        };
        let below = if upper.is_empty() {
            true
        } else {
            let bound = coerce(upper)?;
            if upper_inclusive {
                *target <= bound
            } else {
                *target < bound
            }
        };
        if above && below {
            return Some(true);
        }
    }
    if matched {
        Some(false)
    } else {
        None
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_is_idempotent() {
        let samples = [
            "^4.17.0",
            "~1.2",
            ">= 2.0, < 3.0",
            "v1.2.3",
            "\"1.0\"",
            "^\"1.0\"",
            "latest",
            "*",
            "",
            "31.1-jre",
            "5.3.18.RELEASE",
            "1.+",
            "'",
            "vv",
        ];
        for s in samples {
            let once = normalize(s);
            assert_eq!(normalize(&once), once, "not idempotent for {:?}", s);
        }
    }

    #[test]
    fn test_normalize_values() {
        assert_eq!(normalize("^4.17.0"), "4.17.0");
        assert_eq!(normalize(">= 2.0, < 3.0"), "2.0");
        assert_eq!(normalize("latest"), "*");
        assert_eq!(normalize("v1.2.3"), "1.2.3");
    }

    #[test]
    fn test_compare_ignores_qualifiers() {
        assert_eq!(compare_versions("2.0.18", "2.0.16"), Ordering::Greater);
        assert_eq!(compare_versions("5.3.18.RELEASE", "5.3.18"), Ordering::Equal);
        assert_eq!(compare_versions("31.1-jre", "32.0.0-jre"), Ordering::Less);
        assert_eq!(compare_versions("1.10", "1.9"), Ordering::Greater);
    }

    #[test]
    fn test_downgrade_detection() {
        assert!(is_downgrade("2.0.18", "2.0.16"));
        assert!(!is_downgrade("2.0.16", "2.0.18"));
        assert!(!is_downgrade("*", "1.0"));
    }

    #[test]
    fn test_more_specific() {
        assert!(is_more_specific("1.0", "*"));
        assert!(!is_more_specific("*", "1.0"));
        assert!(is_more_specific("1.2", "1.1.9"));
        assert!(!is_more_specific("1.0", "1.0.0"));
    }

    #[test]
    fn test_update_type() {
        assert_eq!(update_type("2.6", "2.8.0"), UpdateType::Minor);
        assert_eq!(update_type("4.17.0", "4.17.21"), UpdateType::Patch);
        assert_eq!(update_type("2.7.0", "3.0.0"), UpdateType::Major);
    }

    #[test]
    fn test_range_prefix_preserved() {
        assert_eq!(with_range_prefix("^4.17.0", "4.17.21"), "^4.17.21");
        assert_eq!(with_range_prefix("~1.2.0", "1.2.5"), "~1.2.5");
        assert_eq!(with_range_prefix("2.6", "2.8.0"), "2.8.0");
    }

    #[test]
    fn test_compound_range_keeps_upper_bound() {
        assert_eq!(with_range_prefix(">=1.0 <2.0", "1.5.2"), ">=1.5.2 <2.0");
        assert_eq!(with_range_prefix(">= 4.17.0 < 5", "4.17.21"), ">=4.17.21 <5");
        assert_eq!(with_range_prefix(">=1.0 <2.0", "2.1.0"), "^2.1.0");
        assert_eq!(with_range_prefix("^1.0.0 || ^2.0.0", "2.3.1"), "^2.3.1");
        assert_eq!(with_range_prefix("1.0.0 - 1.4.0", "1.4.2"), "^1.4.2");
    }

    #[test]
    fn test_satisfies_comparators() {
        assert!(satisfies_range("2.8.0", "<2.8.9").unwrap());
        assert!(!satisfies_range("2.8.9", "<2.8.9").unwrap());
        assert!(satisfies_range("2.1", ">= 2.0, < 2.8.9").unwrap());
        assert!(satisfies_range("1.5.0", "<1.0 || >=1.5 <1.6").unwrap());
        assert!(satisfies_range("4.17.0", "^4.0.0").unwrap());
        assert!(satisfies_range("2.6", "2.6").unwrap());
    }

    #[test]
    fn test_satisfies_maven_intervals() {
        assert!(satisfies_range("2.9.0", "[2.0,2.9.10)").unwrap());
        assert!(!satisfies_range("2.9.10", "[2.0,2.9.10)").unwrap());
        assert!(satisfies_range("1.5", "(,1.5]").unwrap());
        assert!(satisfies_range("1.0", "[1.0]").unwrap());
    }

    #[test]
    fn test_unparseable_is_error() {
        assert!(satisfies_range("not-a-version", "<1.0").is_err());
        assert!(satisfies_range("1.0", "garbage").is_err());
    }
}
