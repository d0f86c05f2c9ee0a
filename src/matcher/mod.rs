//! Vulnerability matching and fix suggestions.

use std::collections::HashMap;

use tracing::{debug, warn};

use crate::config::MatcherConfig;
use crate::models::{
    normalize_ecosystem_label, AffectedPackageSpec, Dependency, DependencyType, Ecosystem,
    FixSuggestion, UpdateType, Vulnerability,
};
use crate::version::{
    coerce, compare_versions, is_concrete, is_more_specific, is_wildcard, normalize,
    satisfies_range, update_type,
};

pub mod rules;

/// Version string of "update to latest" suggestions.
pub const LATEST: &str = "latest";

/// Same package: coordinate families agree and names are equal ignoring case.
pub fn is_package_match(dep: &Dependency, spec: &AffectedPackageSpec) -> bool {
    normalize_ecosystem_label(&spec.ecosystem) == dep.ecosystem.coordinate_family()
        && dep.name.trim().eq_ignore_ascii_case(spec.name.trim())
}

/// Whether `version` falls in any of `ranges`.
///
/// Wildcards and an empty range list are always affected, as is any range
/// that cannot be parsed. A version that cannot be coerced is affected
/// unless proven otherwise; a range mentioning it is logged as the match.
pub fn is_version_affected(version: &str, ranges: &[String]) -> bool {
    if is_wildcard(version) || normalize(version) == "*" || ranges.is_empty() {
        return true;
    }

    if coerce(version).is_none() {
        let needle = normalize(version);
        if ranges.iter().any(|r| r.contains(needle.as_str())) {
            debug!("Version `{}` named by an affected range", version);
        } else {
            warn!(
                "Cannot interpret version `{}`; no range mentions it, assuming affected",
                version
            );
        }
        return true;
    }

    ranges.iter().any(|range| match satisfies_range(version, range) {
        Ok(affected) => affected,
        Err(e) => {
            debug!("{}; assuming affected", e);
            true
        }
    })
}

/// Propose a target version for `dep` against one affected package entry.
///
/// Prefers the lowest listed fixed version above the current one, then a
/// version named in the remediation text, then "update to latest".
pub fn generate_fix_suggestion(
    dep: &Dependency,
    vuln: &Vulnerability,
    spec: &AffectedPackageSpec,
    config: &MatcherConfig,
) -> FixSuggestion {
    let current = dep.version.as_str();

    let (suggested, rationale) = if let Some(v) = rules::lowest_above(&spec.fixed_versions, current) {
        let rationale = format!("{} is fixed in {}", vuln.display_id(), v);
        (v, rationale)
    } else if let Some(v) = rules::lowest_above(&rules::remediation_versions(&vuln.remediation_text), current) {
        let rationale = format!("remediation guidance for {} recommends {}", vuln.display_id(), v);
        (v, rationale)
    } else {
        let rationale = format!("no fixed version published for {}; update to latest", vuln.display_id());
        (LATEST.to_string(), rationale)
    };

    let kind = if suggested == LATEST {
        rules::family_update_type(config, &dep.name)
    } else {
        update_type(current, &suggested)
    };
    let breaking = rules::breaking_changes(config, &dep.name, kind);
    let confidence = rules::confidence(config, kind, breaking.len(), dep.is_dev);

    FixSuggestion {
        dependency_name: dep.name.clone(),
        ecosystem: dep.ecosystem,
        current_version: dep.version.clone(),
        suggested_version: suggested,
        update_type: kind,
        confidence,
        testing_required: kind >= UpdateType::Major || !breaking.is_empty(),
        breaking_changes: breaking,
        vulnerability_ids: vec![vuln.display_id().to_string()],
        is_transitive: dep.dep_type == DependencyType::Transitive,
        is_dev: dep.is_dev,
        file_path: dep.file_path.clone(),
        rationale,
    }
}

/// An entry without ranges affects versions below its fixed versions, or
/// every version when none are listed.
fn spec_affects(dep: &Dependency, spec: &AffectedPackageSpec) -> bool {
    if spec.affected_version_ranges.is_empty() && is_concrete(&dep.version) {
        let fixed: Vec<&String> = spec.fixed_versions.iter().filter(|v| is_concrete(v)).collect();
        if !fixed.is_empty() {
            return fixed
                .iter()
                .any(|f| compare_versions(f, &dep.version) == std::cmp::Ordering::Greater);
        }
    }
    is_version_affected(&dep.version, &spec.affected_version_ranges)
}

/// Match every dependency against every vulnerability.
///
/// Suggestions for one dependency are combined: the highest target wins and
/// the vulnerability ids are unioned. Output is sorted by dependency.
pub fn match_vulnerabilities(
    deps: &[Dependency],
    vulns: &[Vulnerability],
    config: &MatcherConfig,
) -> Vec<FixSuggestion> {
    let mut combined: HashMap<(String, Ecosystem), FixSuggestion> = HashMap::new();

    for dep in deps {
        for vuln in vulns {
            let Some(spec) = vuln
                .affected_packages
                .iter()
                .find(|spec| is_package_match(dep, spec) && spec_affects(dep, spec))
            else {
                continue;
            };
            debug!("{}@{} is affected by {}", dep.name, dep.version, vuln.display_id());
            let suggestion = generate_fix_suggestion(dep, vuln, spec, config);
            match combined.remove(&dep.identity_key()) {
                Some(existing) => {
                    combined.insert(dep.identity_key(), combine(existing, suggestion));
                }
                None => {
                    combined.insert(dep.identity_key(), suggestion);
                }
            }
        }
    }

    let mut out: Vec<FixSuggestion> = combined.into_values().collect();
    out.sort_by(|a, b| {
        a.ecosystem
            .cmp(&b.ecosystem)
            .then_with(|| a.dependency_name.cmp(&b.dependency_name))
    });
    out
}

fn combine(a: FixSuggestion, b: FixSuggestion) -> FixSuggestion {
    let (mut winner, other) = if is_more_specific(&b.suggested_version, &a.suggested_version) {
        (b, a)
    } else {
        (a, b)
    };
    for id in other.vulnerability_ids {
        if !winner.vulnerability_ids.contains(&id) {
            winner.vulnerability_ids.push(id);
        }
    }
    winner
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    fn spec(name: &str, ecosystem: &str, ranges: &[&str], fixed: &[&str]) -> AffectedPackageSpec {
        AffectedPackageSpec {
            name: name.to_string(),
            ecosystem: ecosystem.to_string(),
            affected_version_ranges: ranges.iter().map(|s| s.to_string()).collect(),
            fixed_versions: fixed.iter().map(|s| s.to_string()).collect(),
        }
    }

    fn vuln(id: &str, specs: Vec<AffectedPackageSpec>, remediation: &str) -> Vulnerability {
        Vulnerability {
            id: id.to_string(),
            cve_ids: vec![id.to_string()],
            affected_packages: specs,
            remediation_text: remediation.to_string(),
            severity: None,
        }
    }

    fn gson(version: &str, ecosystem: Ecosystem) -> Dependency {
        Dependency::new("com.google.code.gson:gson", version, ecosystem, Path::new("build.gradle"))
    }

    #[test]
    fn test_package_match_across_jvm_labels() {
        let dep = gson("2.8.0", Ecosystem::Gradle);
        assert!(is_package_match(&dep, &spec("com.google.code.gson:gson", "Maven", &[], &[])));
        assert!(is_package_match(&dep, &spec("COM.GOOGLE.CODE.GSON:GSON", "maven", &[], &[])));
        assert!(!is_package_match(&dep, &spec("com.google.code.gson:gson", "npm", &[], &[])));
        assert!(!is_package_match(&dep, &spec("gson", "maven", &[], &[])));
    }

    #[test]
    fn test_wildcard_always_affected() {
        let ranges = vec!["<1.0.0".to_string()];
        assert!(is_version_affected("*", &ranges));
        assert!(is_version_affected("latest", &ranges));
        assert!(is_version_affected("", &[]));
    }

    #[test]
    fn test_range_membership() {
        let ranges = vec![">=2.0.0 <2.8.9".to_string()];
        assert!(is_version_affected("2.8.0", &ranges));
        assert!(!is_version_affected("2.8.9", &ranges));
        assert!(is_version_affected("^4.17.0", &["<4.17.21".to_string()]));
        assert!(is_version_affected("1.0", &["not a range".to_string()]));
    }

    #[test]
    fn test_unparseable_version_is_affected() {
        assert!(is_version_affected("nightly", &["nightly builds".to_string()]));
        assert!(is_version_affected("nightly", &["<1.0".to_string()]));
        assert!(is_version_affected("RELEASE", &[">=2.0.0 <2.8.9".to_string()]));
    }

    #[test]
    fn test_lowest_fixed_version_preferred() {
        let dep = gson("2.8.0", Ecosystem::Maven);
        let s = spec("com.google.code.gson:gson", "maven", &["<2.8.9"], &["2.9.0", "2.8.9"]);
        let v = vuln("CVE-2022-25647", vec![s.clone()], "");
        let fix = generate_fix_suggestion(&dep, &v, &s, &MatcherConfig::default());
        assert_eq!(fix.suggested_version, "2.8.9");
        assert_eq!(fix.update_type, UpdateType::Patch);
        assert_eq!(fix.confidence, 1.0);
        assert!(!fix.testing_required);
    }

    #[test]
    fn test_remediation_text_then_latest() {
        let dep = gson("2.8.0", Ecosystem::Maven);
        let s = spec("com.google.code.gson:gson", "maven", &[], &[]);
        let v = vuln("CVE-1", vec![s.clone()], "Upgrade to version 3.0.1 or later.");
        let fix = generate_fix_suggestion(&dep, &v, &s, &MatcherConfig::default());
        assert_eq!(fix.suggested_version, "3.0.1");
        assert_eq!(fix.update_type, UpdateType::Major);
        assert!(fix.testing_required);

        let v = vuln("CVE-2", vec![s.clone()], "No fix yet.");
        let fix = generate_fix_suggestion(&dep, &v, &s, &MatcherConfig::default());
        assert_eq!(fix.suggested_version, LATEST);
        assert_eq!(fix.update_type, UpdateType::Major);
    }

    #[test]
    fn test_confidence_stays_in_bounds() {
        let mut dep = Dependency::new("react", "16.0.0", Ecosystem::Npm, Path::new("package.json"));
        dep.is_dev = true;
        let s = spec("react", "npm", &["<18.0.0"], &["18.0.0"]);
        let v = vuln("CVE-3", vec![s.clone()], "");
        let fix = generate_fix_suggestion(&dep, &v, &s, &MatcherConfig::default());
        assert!(fix.confidence >= 0.1 && fix.confidence <= 1.0);
        assert_eq!(fix.breaking_changes.len(), 1);
    }

    #[test]
    fn test_match_across_ecosystem_labels() {
        let deps = vec![gson("2.8.0", Ecosystem::Gradle)];
        let vulns = vec![vuln(
            "CVE-2022-25647",
            vec![spec("com.google.code.gson:gson", "Maven", &["<2.8.9"], &["2.8.9"])],
            "",
        )];
        let fixes = match_vulnerabilities(&deps, &vulns, &MatcherConfig::default());
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].ecosystem, Ecosystem::Gradle);
        assert_eq!(fixes[0].suggested_version, "2.8.9");
    }

    #[test]
    fn test_suggestions_combine_per_dependency() {
        let deps = vec![gson("2.8.0", Ecosystem::Maven)];
        let vulns = vec![
            vuln("CVE-A", vec![spec("com.google.code.gson:gson", "maven", &["<2.8.9"], &["2.8.9"])], ""),
            vuln("CVE-B", vec![spec("com.google.code.gson:gson", "maven", &["<2.10.1"], &["2.10.1"])], ""),
            vuln("CVE-C", vec![spec("com.google.code.gson:gson", "maven", &["<2.0.0"], &["2.0.0"])], ""),
        ];
        let fixes = match_vulnerabilities(&deps, &vulns, &MatcherConfig::default());
        assert_eq!(fixes.len(), 1);
        assert_eq!(fixes[0].suggested_version, "2.10.1");
        assert_eq!(fixes[0].vulnerability_ids, vec!["CVE-B", "CVE-A"]);
    }

    #[test]
    fn test_already_fixed_without_ranges() {
        let deps = vec![gson("2.9.0", Ecosystem::Maven)];
        let vulns = vec![vuln("CVE-A", vec![spec("com.google.code.gson:gson", "maven", &[], &["2.8.9"])], "")];
        assert!(match_vulnerabilities(&deps, &vulns, &MatcherConfig::default()).is_empty());
    }
}
