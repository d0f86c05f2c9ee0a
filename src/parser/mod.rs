//! Build-file parsers and mutators.
//!
//! Every ecosystem implements [`BuildFileParser`] with the same contract:
//! - [`parse`](BuildFileParser::parse) reads text into a [`ParsedFile`]
//! - the `update_*` / [`add_constraint_for_transitive`](BuildFileParser::add_constraint_for_transitive)
//!   operations record [`Modification`]s without touching the text
//! - [`get_modified_content`](BuildFileParser::get_modified_content) replays
//!   those modifications against the original text in one pass
//!
//! Only the bytes an edit targets change; indentation and line endings come
//! from the surrounding text.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use tracing::debug;

use crate::edit::{indentation_at, newline_of, Edit, TextPatch};
use crate::error::{ParseError, ValidationError};
use crate::models::{
    artifact_of, Dependency, Ecosystem, FileKind, Modification, ModificationKind, ParsedFile,
};
use crate::version::normalize;

pub mod gradle;
pub mod maven;
pub mod npm;

pub use gradle::GradleParser;
pub use maven::MavenParser;
pub use npm::NpmParser;

/// How a format spells a single-line comment.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CommentStyle {
    pub prefix: &'static str,
    pub suffix: &'static str,
}

pub const SLASH_COMMENT: CommentStyle = CommentStyle {
    prefix: "// ",
    suffix: "",
};
pub const HASH_COMMENT: CommentStyle = CommentStyle {
    prefix: "# ",
    suffix: "",
};
pub const XML_COMMENT: CommentStyle = CommentStyle {
    prefix: "<!-- ",
    suffix: " -->",
};

/// Outcome of [`BuildFileParser::add_constraint_for_transitive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConstraintResult {
    Added,
    /// An override for this dependency already exists in the file, or was
    /// added to another file earlier in the run.
    AlreadyPresent,
    /// Overrides are not valid where they would have to go.
    Unsupported(String),
}

impl ConstraintResult {
    pub fn is_applied(&self) -> bool {
        matches!(self, ConstraintResult::Added | ConstraintResult::AlreadyPresent)
    }
}

pub trait BuildFileParser: Send + Sync {
    fn ecosystem(&self) -> Ecosystem;

    /// Whether this parser understands the file at `path` (by filename).
    fn can_handle(&self, path: &Path) -> bool;

    fn parse(&self, path: &Path, content: &str) -> Result<ParsedFile, ParseError>;

    /// Comment syntax for inline fix notes, `None` where the format has none.
    fn comment_style(&self, file: &ParsedFile) -> Option<CommentStyle>;

    /// Text that replaces a declared version. Formats with range operators
    /// override this to keep them.
    fn render_version(&self, _declared: &str, new_version: &str) -> String {
        new_version.to_string()
    }

    fn add_constraint_for_transitive(
        &self,
        file: &mut ParsedFile,
        name: &str,
        version: &str,
        vuln_id: &str,
        reason: &str,
    ) -> ConstraintResult;

    /// Render all pending constraint inserts of `file` as edits.
    fn constraint_edits(
        &self,
        file: &ParsedFile,
        inserts: &[&Modification],
    ) -> Result<Vec<Edit>, ValidationError>;

    /// Minimal structural check of edited content.
    fn validate(&self, content: &str) -> Result<(), ValidationError>;

    /// Point the declaration of `name` at `new_version`.
    ///
    /// Matches `group:artifact` exactly first, then the artifact alone; never
    /// by substring. A version held in a variable is updated where the
    /// variable is declared. Returns `false` when nothing in this file can be
    /// rewritten.
    fn update_dependency_version(
        &self,
        file: &mut ParsedFile,
        name: &str,
        current_version: &str,
        new_version: &str,
        vuln_id: &str,
        reason: &str,
    ) -> bool {
        if file.kind == FileKind::Lockfile {
            return false;
        }

        let Some(dep) = find_dependency(file, name, current_version) else {
            return self.update_plugin_version(file, name, new_version, vuln_id, reason);
        };

        if let Some(variable) = &dep.variable {
            debug!(
                "{} uses variable `{}`, updating its declaration",
                dep.name, variable
            );
            return self.update_variable(file, variable, new_version, vuln_id, reason);
        }

        let Some(location) = dep.location else {
            return false;
        };
        let new_value = self.render_version(&dep.version, new_version);
        file.push_modification(Modification {
            kind: ModificationKind::DependencyVersion,
            target: dep.name.clone(),
            location,
            old_value: dep.version.clone(),
            new_value,
            comment: fix_comment(vuln_id, reason),
            vulnerability_id: vuln_id.to_string(),
        });
        true
    }

    /// Rewrite the declaration of variable `name`.
    fn update_variable(
        &self,
        file: &mut ParsedFile,
        name: &str,
        new_version: &str,
        vuln_id: &str,
        reason: &str,
    ) -> bool {
        let Some(variable) = file.variable(name).cloned() else {
            return false;
        };
        let new_value = self.render_version(&variable.value, new_version);
        file.push_modification(Modification {
            kind: ModificationKind::VariableValue,
            target: variable.name,
            location: variable.location,
            old_value: variable.value,
            new_value,
            comment: fix_comment(vuln_id, reason),
            vulnerability_id: vuln_id.to_string(),
        });
        true
    }

    fn update_plugin_version(
        &self,
        file: &mut ParsedFile,
        id: &str,
        new_version: &str,
        vuln_id: &str,
        reason: &str,
    ) -> bool {
        let Some(plugin) = file.plugins.iter().find(|p| p.id == id).cloned() else {
            return false;
        };
        file.push_modification(Modification {
            kind: ModificationKind::PluginVersion,
            target: plugin.id,
            location: plugin.location,
            old_value: plugin.version.clone(),
            new_value: self.render_version(&plugin.version, new_version),
            comment: fix_comment(vuln_id, reason),
            vulnerability_id: vuln_id.to_string(),
        });
        true
    }

    /// Final text of `file` with every recorded modification applied to the
    /// original content.
    fn get_modified_content(&self, file: &ParsedFile) -> Result<String, ValidationError> {
        let mut edits = replacement_edits(file, self.comment_style(file));
        let inserts: Vec<&Modification> = file
            .modifications()
            .iter()
            .filter(|m| m.kind == ModificationKind::ConstraintInsert)
            .collect();
        if !inserts.is_empty() {
            edits.extend(self.constraint_edits(file, &inserts)?);
        }
        TextPatch::new(edits).apply(&file.raw_content)
    }
}

/// Inline note written above an edited declaration.
pub fn fix_comment(vuln_id: &str, reason: &str) -> String {
    if reason.trim().is_empty() {
        format!("Security fix: {}", vuln_id)
    } else {
        format!("Security fix: {} - {}", vuln_id, reason.trim())
    }
}

/// Render one comment line in `style`, XML-safe.
pub fn render_comment(style: CommentStyle, indent: &str, text: &str, newline: &str) -> String {
    let text = if style == XML_COMMENT {
        text.replace("--", "-")
    } else {
        text.replace(['\r', '\n'], " ")
    };
    format!("{}{}{}{}{}", indent, style.prefix, text, style.suffix, newline)
}

/// Locate a declaration using the strict-then-loose ladder.
///
/// Declared dependencies with a rewritable version are searched before
/// version pins from overrides, so a dependency whose version is managed
/// elsewhere in the file falls through to the pin.
pub fn find_dependency(file: &ParsedFile, name: &str, current_version: &str) -> Option<Dependency> {
    let candidates: Vec<&Dependency> = file
        .dependencies
        .iter()
        .filter(|d| d.location.is_some() || d.variable.is_some())
        .chain(file.managed.iter())
        .collect();

    let exact: Vec<&Dependency> = candidates
        .iter()
        .copied()
        .filter(|d| d.name.eq_ignore_ascii_case(name))
        .collect();
    let pool = if exact.is_empty() {
        let wanted = artifact_of(name);
        candidates
            .iter()
            .copied()
            .filter(|d| d.artifact().eq_ignore_ascii_case(wanted))
            .collect()
    } else {
        exact
    };

    let current = normalize(current_version);
    pool.iter()
        .find(|d| normalize(&d.version) == current)
        .or_else(|| pool.first())
        .map(|d| (*d).clone())
}

/// Version replacements plus the comment lines above them.
fn replacement_edits(file: &ParsedFile, style: Option<CommentStyle>) -> Vec<Edit> {
    let content = &file.raw_content;
    let newline = newline_of(content);

    // Last write to a span wins.
    let mut values: BTreeMap<(usize, usize), String> = BTreeMap::new();
    let mut comments: BTreeMap<usize, Vec<String>> = BTreeMap::new();

    for m in file.modifications() {
        if m.kind == ModificationKind::ConstraintInsert {
            continue;
        }
        let span = m.location.span;
        values.insert((span.start, span.end), m.new_value.clone());
        let lines = comments.entry(m.location.line_start).or_default();
        if !lines.contains(&m.comment) {
            lines.push(m.comment.clone());
        }
    }

    let mut edits: Vec<Edit> = values
        .into_iter()
        .map(|((start, end), value)| Edit::replace(crate::models::Span::new(start, end), value))
        .collect();

    if let Some(style) = style {
        for (line_start, lines) in comments {
            let indent = indentation_at(content, line_start);
            let text: String = lines
                .iter()
                .map(|c| render_comment(style, indent, c, newline))
                .collect();
            edits.push(Edit::insert(line_start, text));
        }
    }

    edits
}

/// Remembers which file received a dependency's override during one run so
/// the same override is not injected into several files.
#[derive(Debug, Default)]
pub struct ConstraintSession {
    claimed: Mutex<HashMap<String, PathBuf>>,
}

impl ConstraintSession {
    /// Claim `name` for `file`. Fails when another file already holds it.
    pub fn claim(&self, name: &str, file: &Path) -> bool {
        let mut claimed = match self.claimed.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        };
        match claimed.get(&name.to_lowercase()) {
            Some(owner) => owner == file,
            None => {
                claimed.insert(name.to_lowercase(), file.to_path_buf());
                true
            }
        }
    }
}

/// All parsers, dispatched by filename or ecosystem.
pub struct ParserRegistry {
    parsers: Vec<Box<dyn BuildFileParser>>,
}

impl ParserRegistry {
    pub fn new() -> Self {
        Self {
            parsers: vec![
                Box::new(GradleParser::new()),
                Box::new(MavenParser::new()),
                Box::new(NpmParser::new()),
            ],
        }
    }

    pub fn for_path(&self, path: &Path) -> Option<&dyn BuildFileParser> {
        self.parsers
            .iter()
            .find(|p| p.can_handle(path))
            .map(|p| p.as_ref())
    }

    pub fn for_ecosystem(&self, ecosystem: Ecosystem) -> Option<&dyn BuildFileParser> {
        self.parsers
            .iter()
            .find(|p| p.ecosystem() == ecosystem)
            .map(|p| p.as_ref())
    }

    /// Read and parse one file from disk.
    pub fn parse_path(&self, path: &Path) -> Result<ParsedFile, ParseError> {
        let parser = self
            .for_path(path)
            .ok_or_else(|| ParseError::Unsupported(path.to_path_buf()))?;
        let content = std::fs::read_to_string(path)?;
        parser.parse(path, &content)
    }

    /// Parse every path, skipping (and logging) files that fail.
    pub fn parse_all(&self, paths: &[PathBuf]) -> Vec<ParsedFile> {
        let mut parsed = Vec::new();
        for path in paths {
            match self.parse_path(path) {
                Ok(file) => parsed.push(file),
                Err(e) => tracing::warn!("Skipping {}: {}", path.display(), e),
            }
        }
        parsed
    }
}

impl Default for ParserRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// Names of the dependencies a file pins through overrides, lowercased.
pub(crate) fn managed_names(file: &ParsedFile) -> HashSet<String> {
    file.managed.iter().map(|d| d.name.to_lowercase()).collect()
}

/// File name of `path` as a `&str`, empty when it has none.
pub(crate) fn file_name(path: &Path) -> &str {
    path.file_name().and_then(|n| n.to_str()).unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fix_comment_format() {
        assert_eq!(
            fix_comment("CVE-2021-29425", "path traversal"),
            "Security fix: CVE-2021-29425 - path traversal"
        );
        assert_eq!(fix_comment("CVE-1", " "), "Security fix: CVE-1");
    }

    #[test]
    fn test_xml_comment_is_sanitized() {
        let line = render_comment(XML_COMMENT, "  ", "a -- b", "\n");
        assert_eq!(line, "  <!-- a - b -->\n");
    }

    #[test]
    fn test_session_claims_once_per_file() {
        let session = ConstraintSession::default();
        assert!(session.claim("gson", Path::new("a/build.gradle")));
        assert!(session.claim("GSON", Path::new("a/build.gradle")));
        assert!(!session.claim("gson", Path::new("b/build.gradle")));
    }

    #[test]
    fn test_registry_dispatch() {
        let registry = ParserRegistry::new();
        assert_eq!(
            registry.for_path(Path::new("x/build.gradle.kts")).map(|p| p.ecosystem()),
            Some(Ecosystem::Gradle)
        );
        assert_eq!(
            registry.for_path(Path::new("pom.xml")).map(|p| p.ecosystem()),
            Some(Ecosystem::Maven)
        );
        assert_eq!(
            registry.for_path(Path::new("package-lock.json")).map(|p| p.ecosystem()),
            Some(Ecosystem::Npm)
        );
        assert!(registry.for_path(Path::new("Cargo.toml")).is_none());
    }
}
