//! Applies safe fixes through the parsers and assembles the change-set.
//!
//! Each fix is tried in order:
//! 1. the declaration in every manifest that names the dependency
//! 2. a variable declared in a sibling file (`gradle.properties`)
//! 3. an override in the ecosystem's root manifest, for dependencies no
//!    manifest declares
//!
//! Edited files must still validate and re-parse. A file that does not is
//! excluded and the whole attempt is recomputed without it, until every
//! remaining edit is valid.

use std::collections::{BTreeSet, HashSet};
use std::path::{Path, PathBuf};

use serde::Serialize;
use tracing::{debug, info, instrument, warn};

use crate::detector::root_manifest;
use crate::error::ValidationError;
use crate::models::{Ecosystem, FileKind, FixSuggestion, ParsedFile};
use crate::parser::{find_dependency, BuildFileParser, ConstraintResult, ParserRegistry};
use crate::safety::ProblematicFix;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum FixMethod {
    DirectUpdate,
    VariableUpdate,
    Constraint,
}

impl std::fmt::Display for FixMethod {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            FixMethod::DirectUpdate => write!(f, "direct"),
            FixMethod::VariableUpdate => write!(f, "variable"),
            FixMethod::Constraint => write!(f, "constraint"),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct AppliedFix {
    pub suggestion: FixSuggestion,
    pub method: FixMethod,
    pub files: Vec<PathBuf>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FailedFix {
    pub suggestion: FixSuggestion,
    pub reason: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileChange {
    pub path: PathBuf,
    pub original: String,
    pub modified: String,
}

/// A file whose edits were rejected.
#[derive(Debug, Clone, Serialize)]
pub struct ExcludedFile {
    pub path: PathBuf,
    pub reason: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    FullSuccess,
    PartialSuccess,
    NoAutomaticFixes,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Outcome::FullSuccess => write!(f, "full success"),
            Outcome::PartialSuccess => write!(f, "partial success"),
            Outcome::NoAutomaticFixes => write!(f, "no automatic fixes"),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ChangeSet {
    pub files: Vec<FileChange>,
    pub applied: Vec<AppliedFix>,
    pub failed: Vec<FailedFix>,
    pub problematic: Vec<ProblematicFix>,
    pub excluded: Vec<ExcludedFile>,
    pub total_vulnerabilities: usize,
}

impl ChangeSet {
    /// Distinct vulnerabilities addressed by an applied fix.
    pub fn fixed_vulnerabilities(&self) -> BTreeSet<&str> {
        self.applied
            .iter()
            .flat_map(|a| a.suggestion.vulnerability_ids.iter().map(String::as_str))
            .collect()
    }

    pub fn success_rate(&self) -> f64 {
        if self.total_vulnerabilities == 0 {
            return 0.0;
        }
        let rate = self.fixed_vulnerabilities().len() as f64 / self.total_vulnerabilities as f64;
        rate.clamp(0.0, 1.0)
    }

    pub fn outcome(&self) -> Outcome {
        if self.files.is_empty() {
            Outcome::NoAutomaticFixes
        } else if self.failed.is_empty()
            && self.problematic.is_empty()
            && self.success_rate() >= 1.0
        {
            Outcome::FullSuccess
        } else {
            Outcome::PartialSuccess
        }
    }

    /// Some vulnerability still needs a person.
    pub fn needs_manual_work(&self) -> bool {
        self.outcome() != Outcome::FullSuccess
    }

    /// Write every edited file and return the paths written, relative to
    /// `root` where possible. Those are the only paths to stage.
    pub fn write(&self, root: &Path) -> std::io::Result<Vec<PathBuf>> {
        let mut written = Vec::new();
        for change in &self.files {
            let target = if change.path.is_absolute() {
                change.path.clone()
            } else {
                root.join(&change.path)
            };
            std::fs::write(&target, &change.modified)?;
            info!("Wrote {}", target.display());
            written.push(
                target
                    .strip_prefix(root)
                    .map(Path::to_path_buf)
                    .unwrap_or(target.clone()),
            );
        }
        Ok(written)
    }
}

/// Result of one pass over every fix with a given exclusion set.
struct Attempt {
    files: Vec<ParsedFile>,
    applied: Vec<AppliedFix>,
    failed: Vec<FailedFix>,
}

pub struct ChangeApplier;

impl ChangeApplier {
    pub fn new() -> Self {
        Self
    }

    /// Apply `safe` fixes to `files` (as parsed, without pending edits).
    #[instrument(skip_all, fields(fixes = safe.len()))]
    pub fn apply(
        &self,
        files: &[ParsedFile],
        safe: &[FixSuggestion],
        problematic: Vec<ProblematicFix>,
        total_vulnerabilities: usize,
    ) -> ChangeSet {
        let mut excluded: Vec<ExcludedFile> = Vec::new();

        loop {
            let excluded_paths: HashSet<&Path> =
                excluded.iter().map(|e| e.path.as_path()).collect();
            // Fresh parsers so constraint claims of a rejected attempt do
            // not carry over.
            let registry = ParserRegistry::new();
            let attempt = self.attempt(&registry, files, safe, &excluded_paths);

            let (changes, rejected) = render(&registry, &attempt.files);
            if rejected.is_empty() {
                let failed = attempt
                    .failed
                    .into_iter()
                    .map(|f| explain_exclusion(f, files, &excluded))
                    .collect();
                return ChangeSet {
                    files: changes,
                    applied: attempt.applied,
                    failed,
                    problematic,
                    excluded,
                    total_vulnerabilities,
                };
            }
            for file in rejected {
                warn!("Excluding {}: {}", file.path.display(), file.reason);
                excluded.push(file);
            }
        }
    }

    fn attempt(
        &self,
        registry: &ParserRegistry,
        files: &[ParsedFile],
        safe: &[FixSuggestion],
        excluded: &HashSet<&Path>,
    ) -> Attempt {
        let mut working: Vec<ParsedFile> = files
            .iter()
            .filter(|f| !excluded.contains(f.file_path.as_path()))
            .cloned()
            .collect();
        let mut applied = Vec::new();
        let mut failed = Vec::new();

        for fix in safe {
            let Some(parser) = registry.for_ecosystem(fix.ecosystem) else {
                failed.push(FailedFix {
                    suggestion: fix.clone(),
                    reason: format!("no parser for {}", fix.ecosystem),
                });
                continue;
            };
            match apply_one(parser, &mut working, fix) {
                Ok(done) => applied.push(done),
                Err(reason) => {
                    debug!("{} not applied: {}", fix.dependency_name, reason);
                    failed.push(FailedFix {
                        suggestion: fix.clone(),
                        reason,
                    });
                }
            }
        }

        Attempt {
            files: working,
            applied,
            failed,
        }
    }
}

impl Default for ChangeApplier {
    fn default() -> Self {
        Self::new()
    }
}

fn fix_reason(fix: &FixSuggestion) -> String {
    format!("upgrade {} to {}", fix.dependency_name, fix.suggested_version)
}

fn apply_one(
    parser: &dyn BuildFileParser,
    files: &mut [ParsedFile],
    fix: &FixSuggestion,
) -> Result<AppliedFix, String> {
    let vuln_id = fix.primary_vulnerability().to_string();
    let reason = fix_reason(fix);
    let name = fix.dependency_name.as_str();
    let applied = |method, files| AppliedFix {
        suggestion: fix.clone(),
        method,
        files,
    };

    let mut declared = false;
    if !fix.is_transitive {
        let mut updated = Vec::new();
        let mut pending_variables: Vec<(PathBuf, String)> = Vec::new();

        for file in files
            .iter_mut()
            .filter(|f| f.ecosystem == fix.ecosystem && f.kind == FileKind::Manifest)
        {
            let Some(dep) = find_dependency(file, name, &fix.current_version) else {
                continue;
            };
            declared = true;
            if parser.update_dependency_version(
                file,
                name,
                &fix.current_version,
                &fix.suggested_version,
                &vuln_id,
                &reason,
            ) {
                updated.push(file.file_path.clone());
            } else if let Some(variable) = dep.variable {
                pending_variables.push((file.file_path.clone(), variable));
            }
        }
        if !updated.is_empty() {
            return Ok(applied(FixMethod::DirectUpdate, updated));
        }

        for (from, variable) in pending_variables {
            if let Some(path) = update_sibling_variable(parser, files, &from, &variable, fix, &vuln_id, &reason) {
                return Ok(applied(FixMethod::VariableUpdate, vec![path]));
            }
        }
    }

    if declared {
        return Err(format!(
            "the declaration of {} could not be rewritten",
            name
        ));
    }

    let paths: Vec<PathBuf> = files
        .iter()
        .filter(|f| f.ecosystem == fix.ecosystem && f.kind == FileKind::Manifest)
        .map(|f| f.file_path.clone())
        .collect();
    let Some(root) = root_manifest(&paths, root_manifest_names(fix.ecosystem)).cloned() else {
        return Err(format!("no {} manifest to hold an override", fix.ecosystem));
    };
    let Some(file) = files.iter_mut().find(|f| f.file_path == root) else {
        return Err(format!("no {} manifest to hold an override", fix.ecosystem));
    };

    match parser.add_constraint_for_transitive(file, name, &fix.suggested_version, &vuln_id, &reason) {
        ConstraintResult::Added | ConstraintResult::AlreadyPresent => {
            Ok(applied(FixMethod::Constraint, vec![root]))
        }
        ConstraintResult::Unsupported(why) => Err(why),
    }
}

/// Update `variable` in the nearest other file of the same ecosystem that
/// declares it.
fn update_sibling_variable(
    parser: &dyn BuildFileParser,
    files: &mut [ParsedFile],
    from: &Path,
    variable: &str,
    fix: &FixSuggestion,
    vuln_id: &str,
    reason: &str,
) -> Option<PathBuf> {
    let dir = from.parent();
    let index = files
        .iter()
        .enumerate()
        .filter(|(_, f)| f.ecosystem == fix.ecosystem && f.file_path != from)
        .filter(|(_, f)| f.variable(variable).is_some())
        .min_by_key(|(_, f)| (f.file_path.parent() != dir, f.file_path.components().count()))
        .map(|(i, _)| i)?;
    let file = &mut files[index];
    if parser.update_variable(file, variable, &fix.suggested_version, vuln_id, reason) {
        Some(file.file_path.clone())
    } else {
        None
    }
}

fn root_manifest_names(ecosystem: Ecosystem) -> &'static [&'static str] {
    match ecosystem {
        Ecosystem::Gradle => &["build.gradle", "build.gradle.kts"],
        Ecosystem::Maven => &["pom.xml"],
        Ecosystem::Npm => &["package.json"],
    }
}

/// Render every modified file; files that fail validation come back as
/// rejected.
fn render(registry: &ParserRegistry, files: &[ParsedFile]) -> (Vec<FileChange>, Vec<ExcludedFile>) {
    let mut changes = Vec::new();
    let mut rejected = Vec::new();

    for file in files.iter().filter(|f| f.is_modified()) {
        let Some(parser) = registry.for_ecosystem(file.ecosystem) else {
            continue;
        };
        match render_one(parser, file) {
            Ok(modified) if modified != file.raw_content => changes.push(FileChange {
                path: file.file_path.clone(),
                original: file.raw_content.clone(),
                modified,
            }),
            Ok(_) => {}
            Err(e) => rejected.push(ExcludedFile {
                path: file.file_path.clone(),
                reason: e.to_string(),
            }),
        }
    }
    (changes, rejected)
}

fn render_one(parser: &dyn BuildFileParser, file: &ParsedFile) -> Result<String, ValidationError> {
    let modified = parser.get_modified_content(file)?;
    parser.validate(&modified)?;
    parser
        .parse(&file.file_path, &modified)
        .map_err(|e| ValidationError::Reparse(e.to_string()))?;
    Ok(modified)
}

/// Point a failure at the excluded file that declared the dependency.
fn explain_exclusion(failed: FailedFix, files: &[ParsedFile], excluded: &[ExcludedFile]) -> FailedFix {
    let culprit = excluded.iter().find(|e| {
        files.iter().any(|f| {
            f.file_path == e.path
                && f.ecosystem == failed.suggestion.ecosystem
                && find_dependency(f, &failed.suggestion.dependency_name, &failed.suggestion.current_version)
                    .is_some()
        })
    });
    match culprit {
        Some(e) => FailedFix {
            reason: format!("edits to {} were rejected: {}", e.path.display(), e.reason),
            suggestion: failed.suggestion,
        },
        None => failed,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::UpdateType;
    use crate::parser::{GradleParser, MavenParser, NpmParser};

    fn fix(name: &str, eco: Ecosystem, current: &str, target: &str, transitive: bool) -> FixSuggestion {
        FixSuggestion {
            dependency_name: name.to_string(),
            ecosystem: eco,
            current_version: current.to_string(),
            suggested_version: target.to_string(),
            update_type: UpdateType::Patch,
            confidence: 1.0,
            breaking_changes: Vec::new(),
            testing_required: false,
            vulnerability_ids: vec![format!("CVE-{}", name)],
            is_transitive: transitive,
            is_dev: false,
            file_path: PathBuf::new(),
            rationale: String::new(),
        }
    }

    fn gradle(path: &str, content: &str) -> ParsedFile {
        GradleParser::new().parse(Path::new(path), content).unwrap()
    }

    #[test]
    fn test_direct_update_scenario_a() {
        let files = vec![gradle(
            "build.gradle",
            "dependencies {\n    implementation 'commons-io:commons-io:2.6'\n}\n",
        )];
        let fixes = vec![fix("commons-io:commons-io", Ecosystem::Gradle, "2.6", "2.8.0", false)];
        let set = ChangeApplier::new().apply(&files, &fixes, Vec::new(), 1);

        assert_eq!(set.applied.len(), 1);
        assert_eq!(set.applied[0].method, FixMethod::DirectUpdate);
        let modified = &set.files[0].modified;
        assert!(modified.contains("implementation 'commons-io:commons-io:2.8.0'"));
        assert!(modified.contains("// Security fix: CVE-commons-io:commons-io"));
        assert_eq!(set.outcome(), Outcome::FullSuccess);
        assert_eq!(set.success_rate(), 1.0);
    }

    #[test]
    fn test_variable_in_sibling_properties() {
        let files = vec![
            gradle(
                "app/build.gradle",
                "dependencies {\n    implementation \"com.google.code.gson:gson:$gsonVersion\"\n}\n",
            ),
            gradle("app/gradle.properties", "gsonVersion=2.8.0\n"),
        ];
        let fixes = vec![fix("com.google.code.gson:gson", Ecosystem::Gradle, "2.8.0", "2.8.9", false)];
        let set = ChangeApplier::new().apply(&files, &fixes, Vec::new(), 1);

        assert_eq!(set.applied[0].method, FixMethod::VariableUpdate);
        assert_eq!(set.files.len(), 1);
        assert_eq!(set.files[0].path, PathBuf::from("app/gradle.properties"));
        assert!(set.files[0].modified.contains("gsonVersion=2.8.9"));
    }

    #[test]
    fn test_transitive_goes_to_root_manifest() {
        let files = vec![
            NpmParser::new()
                .parse(Path::new("package.json"), "{\n  \"dependencies\": {\n    \"express\": \"^4.17.0\"\n  }\n}\n")
                .unwrap(),
            NpmParser::new()
                .parse(Path::new("web/package.json"), "{\n  \"dependencies\": {}\n}\n")
                .unwrap(),
        ];
        let fixes = vec![fix("qs", Ecosystem::Npm, "6.5.2", "6.5.3", true)];
        let set = ChangeApplier::new().apply(&files, &fixes, Vec::new(), 1);

        assert_eq!(set.applied[0].method, FixMethod::Constraint);
        assert_eq!(set.files[0].path, PathBuf::from("package.json"));
        assert!(set.files[0].modified.contains("\"qs\": \"6.5.3\""));
    }

    #[test]
    fn test_undeclared_non_transitive_falls_back_to_override() {
        let files = vec![MavenParser::new()
            .parse(Path::new("pom.xml"), "<project>\n  <dependencies>\n  </dependencies>\n</project>\n")
            .unwrap()];
        let fixes = vec![fix("org.yaml:snakeyaml", Ecosystem::Maven, "1.33", "2.0", false)];
        let set = ChangeApplier::new().apply(&files, &fixes, Vec::new(), 1);
        assert_eq!(set.applied.len(), 1);
        assert!(set.files[0].modified.contains("<artifactId>snakeyaml</artifactId>"));
    }

    #[test]
    fn test_unsupported_scope_is_failure() {
        let files = vec![gradle(
            "build.gradle",
            "buildscript {\n    dependencies {\n        classpath 'com.android.tools.build:gradle:7.0.0'\n    }\n}\n",
        )];
        let fixes = vec![fix("org.yaml:snakeyaml", Ecosystem::Gradle, "1.33", "2.0", true)];
        let set = ChangeApplier::new().apply(&files, &fixes, Vec::new(), 1);
        assert!(set.applied.is_empty());
        assert_eq!(set.failed.len(), 1);
        assert!(set.files.is_empty());
        assert_eq!(set.outcome(), Outcome::NoAutomaticFixes);
        assert!(set.needs_manual_work());
    }

    #[test]
    fn test_invalid_file_excluded_others_kept() {
        // The unbalanced script still parses leniently but cannot validate.
        let broken = gradle(
            "lib/build.gradle",
            "dependencies {\n    implementation 'commons-io:commons-io:2.6'\n",
        );
        let good = NpmParser::new()
            .parse(Path::new("package.json"), "{\n  \"dependencies\": {\n    \"lodash\": \"^4.17.0\"\n  }\n}\n")
            .unwrap();
        let files = vec![broken, good];
        let fixes = vec![
            fix("commons-io:commons-io", Ecosystem::Gradle, "2.6", "2.8.0", false),
            fix("lodash", Ecosystem::Npm, "^4.17.0", "4.17.21", false),
        ];
        let set = ChangeApplier::new().apply(&files, &fixes, Vec::new(), 2);

        assert_eq!(set.excluded.len(), 1);
        assert_eq!(set.excluded[0].path, PathBuf::from("lib/build.gradle"));
        assert_eq!(set.files.len(), 1);
        assert!(set.files[0].modified.contains("\"lodash\": \"^4.17.21\""));
        assert_eq!(set.applied.len(), 1);
        assert_eq!(set.failed.len(), 1);
        assert!(set.failed[0].reason.contains("rejected"));
        assert_eq!(set.outcome(), Outcome::PartialSuccess);
        assert_eq!(set.success_rate(), 0.5);
    }

    #[test]
    fn test_write_only_touched_files() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("package.json");
        std::fs::write(&path, "{\n  \"dependencies\": {\n    \"lodash\": \"^4.17.0\"\n  }\n}\n").unwrap();
        let files = vec![NpmParser::new()
            .parse(&path, &std::fs::read_to_string(&path).unwrap())
            .unwrap()];
        let fixes = vec![fix("lodash", Ecosystem::Npm, "^4.17.0", "4.17.21", false)];
        let set = ChangeApplier::new().apply(&files, &fixes, Vec::new(), 1);

        let written = set.write(dir.path()).unwrap();
        assert_eq!(written, vec![PathBuf::from("package.json")]);
        assert!(std::fs::read_to_string(&path).unwrap().contains("^4.17.21"));
    }
}
