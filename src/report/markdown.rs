//! Markdown report: the change-request description, or a standalone
//! manual-fix document when no file could be edited.

use std::fmt::Write;

use crate::applier::{ChangeSet, Outcome};
use crate::engine::Remediation;
use crate::models::FixSuggestion;

pub fn title(change_set: &ChangeSet) -> String {
    let fixed = change_set.fixed_vulnerabilities().len();
    match change_set.outcome() {
        Outcome::NoAutomaticFixes => format!(
            "Manual fixes needed for {} vulnerabilit{}",
            change_set.total_vulnerabilities,
            plural_y(change_set.total_vulnerabilities)
        ),
        _ => format!("Fix {} vulnerabilit{} in dependencies", fixed, plural_y(fixed)),
    }
}

fn plural_y(n: usize) -> &'static str {
    if n == 1 {
        "y"
    } else {
        "ies"
    }
}

pub fn render(remediation: &Remediation) -> String {
    let set = &remediation.change_set;
    let mut out = String::new();

    if set.outcome() == Outcome::NoAutomaticFixes {
        let _ = writeln!(out, "# Manual fix guide\n");
        let _ = writeln!(
            out,
            "No build file could be changed automatically. Each vulnerable dependency below needs a manual update.\n"
        );
    } else {
        let _ = writeln!(out, "## Security dependency fixes\n");
    }

    let _ = writeln!(
        out,
        "**Outcome:** {} ({} of {} vulnerabilities fixed, {:.0}%)\n",
        set.outcome(),
        set.fixed_vulnerabilities().len(),
        set.total_vulnerabilities,
        set.success_rate() * 100.0
    );

    if !set.applied.is_empty() {
        let _ = writeln!(out, "### Applied fixes\n");
        let _ = writeln!(out, "| Dependency | From | To | Vulnerabilities | Method | Files |");
        let _ = writeln!(out, "|---|---|---|---|---|---|");
        for fix in &set.applied {
            let files: Vec<String> = fix
                .files
                .iter()
                .map(|p| {
                    let shown = p.strip_prefix(&remediation.root).unwrap_or(p);
                    format!("`{}`", shown.display())
                })
                .collect();
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} | {} |",
                cell(&fix.suggestion.dependency_name),
                cell(&fix.suggestion.current_version),
                cell(&fix.suggestion.suggested_version),
                cell(&fix.suggestion.vulnerability_ids.join(", ")),
                fix.method,
                files.join(", ")
            );
        }
        let _ = writeln!(out);

        let testing: Vec<&FixSuggestion> = set
            .applied
            .iter()
            .map(|a| &a.suggestion)
            .filter(|s| s.testing_required)
            .collect();
        if !testing.is_empty() {
            let _ = writeln!(out, "Please test carefully:\n");
            for s in testing {
                let notes = if s.breaking_changes.is_empty() {
                    format!("{} update", s.update_type)
                } else {
                    s.breaking_changes.join("; ")
                };
                let _ = writeln!(out, "- `{}`: {}", s.dependency_name, notes);
            }
            let _ = writeln!(out);
        }
    }

    if !set.problematic.is_empty() {
        let _ = writeln!(out, "### Needs manual review\n");
        let _ = writeln!(out, "| Dependency | Current | Suggested | Vulnerabilities | Reason |");
        let _ = writeln!(out, "|---|---|---|---|---|");
        for p in &set.problematic {
            let _ = writeln!(
                out,
                "| {} | {} | {} | {} | {} |",
                cell(&p.suggestion.dependency_name),
                cell(&p.suggestion.current_version),
                cell(&p.suggestion.suggested_version),
                cell(&p.suggestion.vulnerability_ids.join(", ")),
                cell(&p.reason)
            );
        }
        let _ = writeln!(out);
    }

    if !set.failed.is_empty() {
        let _ = writeln!(out, "### Could not be applied\n");
        for f in &set.failed {
            let _ = writeln!(
                out,
                "- `{}` {} → {} ({}): {}",
                f.suggestion.dependency_name,
                f.suggestion.current_version,
                f.suggestion.suggested_version,
                f.suggestion.vulnerability_ids.join(", "),
                f.reason
            );
        }
        let _ = writeln!(out);
    }

    if !set.excluded.is_empty() {
        let _ = writeln!(out, "### Excluded files\n");
        for e in &set.excluded {
            let _ = writeln!(out, "- `{}`: {}", e.path.display(), e.reason);
        }
        let _ = writeln!(out);
    }

    if !remediation.degradations.is_empty() {
        let _ = writeln!(out, "### Resolution notes\n");
        for d in &remediation.degradations {
            let _ = writeln!(
                out,
                "- {} dependencies come from build files only: {}",
                d.ecosystem, d.reason
            );
        }
        let _ = writeln!(out);
    }

    out
}

fn cell(text: &str) -> String {
    text.replace('|', "\\|").replace('\n', " ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::applier::{AppliedFix, FixMethod};
    use crate::models::{Ecosystem, UpdateType};
    use crate::safety::ProblematicFix;
    use std::path::PathBuf;

    fn suggestion(name: &str, id: &str) -> FixSuggestion {
        FixSuggestion {
            dependency_name: name.to_string(),
            ecosystem: Ecosystem::Npm,
            current_version: "^4.17.0".to_string(),
            suggested_version: "4.17.21".to_string(),
            update_type: UpdateType::Patch,
            confidence: 1.0,
            breaking_changes: Vec::new(),
            testing_required: false,
            vulnerability_ids: vec![id.to_string()],
            is_transitive: false,
            is_dev: false,
            file_path: PathBuf::from("package.json"),
            rationale: String::new(),
        }
    }

    fn remediation(set: ChangeSet) -> Remediation {
        Remediation {
            root: PathBuf::from("/repo"),
            ecosystems: vec![Ecosystem::Npm],
            dependency_count: 3,
            degradations: Vec::new(),
            change_set: set,
        }
    }

    #[test]
    fn test_change_request_body() {
        let set = ChangeSet {
            files: vec![crate::applier::FileChange {
                path: PathBuf::from("/repo/package.json"),
                original: String::new(),
                modified: "x".to_string(),
            }],
            applied: vec![AppliedFix {
                suggestion: suggestion("lodash", "CVE-2021-23337"),
                method: FixMethod::DirectUpdate,
                files: vec![PathBuf::from("/repo/package.json")],
            }],
            problematic: vec![ProblematicFix {
                suggestion: suggestion("request", "CVE-2023-28155"),
                reason: "manual migration required: a | b".to_string(),
            }],
            total_vulnerabilities: 2,
            ..ChangeSet::default()
        };
        let body = render(&remediation(set.clone()));
        assert!(body.starts_with("## Security dependency fixes"));
        assert!(body.contains("partial success (1 of 2 vulnerabilities fixed, 50%)"));
        assert!(body.contains("| lodash | ^4.17.0 | 4.17.21 | CVE-2021-23337 | direct | `package.json` |"));
        assert!(body.contains("a \\| b"));
        assert_eq!(title(&set), "Fix 1 vulnerability in dependencies");
    }

    #[test]
    fn test_manual_fix_document() {
        let set = ChangeSet {
            problematic: vec![ProblematicFix {
                suggestion: suggestion("request", "CVE-2023-28155"),
                reason: "manual migration required".to_string(),
            }],
            total_vulnerabilities: 1,
            ..ChangeSet::default()
        };
        let doc = render(&remediation(set.clone()));
        assert!(doc.starts_with("# Manual fix guide"));
        assert!(doc.contains("### Needs manual review"));
        assert_eq!(title(&set), "Manual fixes needed for 1 vulnerability");
    }
}
