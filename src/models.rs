use std::collections::HashSet;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Ecosystem {
    Gradle,
    Maven,
    Npm,
}

impl Ecosystem {
    /// Label of the coordinate grammar this ecosystem uses.
    ///
    /// Gradle and Maven both address artifacts as `group:artifact`, so a
    /// vulnerability filed against one applies to the other.
    pub fn coordinate_family(&self) -> &'static str {
        match self {
            Ecosystem::Gradle | Ecosystem::Maven => "maven",
            Ecosystem::Npm => "npm",
        }
    }
}

impl std::fmt::Display for Ecosystem {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Ecosystem::Gradle => write!(f, "Gradle"),
            Ecosystem::Maven => write!(f, "Maven"),
            Ecosystem::Npm => write!(f, "npm"),
        }
    }
}

/// Map an ecosystem label from an external vulnerability feed to a
/// coordinate family label.
pub fn normalize_ecosystem_label(label: &str) -> String {
    match label.trim().to_lowercase().as_str() {
        "gradle" | "maven" | "java" | "kotlin" | "jvm" => "maven".to_string(),
        "npm" | "node" | "nodejs" | "yarn" | "javascript" | "js" => "npm".to_string(),
        other => other.to_string(),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DependencyType {
    Direct,
    Transitive,
}

impl std::fmt::Display for DependencyType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            DependencyType::Direct => write!(f, "direct"),
            DependencyType::Transitive => write!(f, "transitive"),
        }
    }
}

/// Byte range into the original file text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Span {
    pub start: usize,
    pub end: usize,
}

impl Span {
    pub fn new(start: usize, end: usize) -> Self {
        Self { start, end }
    }

    pub fn at(offset: usize) -> Self {
        Self {
            start: offset,
            end: offset,
        }
    }
}

/// Where a value sits in the original text.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Location {
    /// 1-based line number of the value.
    pub line: usize,
    /// Byte offset of the first character of that line.
    pub line_start: usize,
    /// Exact value text (no quotes, no surrounding tags).
    pub span: Span,
}

impl Location {
    /// Build a location for `span` by scanning `content` for its line.
    pub fn from_span(content: &str, span: Span) -> Self {
        let before = &content[..span.start];
        let line = before.matches('\n').count() + 1;
        let line_start = before.rfind('\n').map(|i| i + 1).unwrap_or(0);
        Self {
            line,
            line_start,
            span,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Dependency {
    pub name: String,
    pub version: String,
    #[serde(rename = "type")]
    pub dep_type: DependencyType,
    pub ecosystem: Ecosystem,
    pub file_path: PathBuf,
    pub is_dev: bool,
    pub target_version: Option<String>,
    /// Variable the version was read through, if any.
    pub variable: Option<String>,
    pub location: Option<Location>,
}

impl Dependency {
    pub fn new(
        name: impl Into<String>,
        version: impl Into<String>,
        ecosystem: Ecosystem,
        file_path: &Path,
    ) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
            dep_type: DependencyType::Direct,
            ecosystem,
            file_path: file_path.to_path_buf(),
            is_dev: false,
            target_version: None,
            variable: None,
            location: None,
        }
    }

    pub fn identity_key(&self) -> (String, Ecosystem) {
        (self.name.to_lowercase(), self.ecosystem)
    }

    /// Artifact part of a `group:artifact` name, or the whole name.
    pub fn artifact(&self) -> &str {
        artifact_of(&self.name)
    }
}

pub fn artifact_of(name: &str) -> &str {
    match name.rsplit_once(':') {
        Some((_, artifact)) => artifact,
        None => name,
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Variable {
    pub name: String,
    pub value: String,
    pub location: Location,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Plugin {
    pub id: String,
    pub version: String,
    pub location: Location,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ModificationKind {
    DependencyVersion,
    VariableValue,
    PluginVersion,
    ConstraintInsert,
}

impl std::fmt::Display for ModificationKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ModificationKind::DependencyVersion => write!(f, "dependency version"),
            ModificationKind::VariableValue => write!(f, "variable"),
            ModificationKind::PluginVersion => write!(f, "plugin version"),
            ModificationKind::ConstraintInsert => write!(f, "constraint"),
        }
    }
}

/// An intended edit. Not applied to text until the file's modified content
/// is rendered.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Modification {
    pub kind: ModificationKind,
    /// Dependency, variable or plugin the edit targets.
    pub target: String,
    pub location: Location,
    pub old_value: String,
    pub new_value: String,
    pub comment: String,
    pub vulnerability_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FileKind {
    Manifest,
    Lockfile,
    Properties,
}

#[derive(Debug, Clone)]
pub struct ParsedFile {
    pub file_path: PathBuf,
    pub ecosystem: Ecosystem,
    pub kind: FileKind,
    pub dependencies: Vec<Dependency>,
    /// Version pins declared through overrides: Gradle constraints, Maven
    /// `dependencyManagement`, npm `overrides`/`resolutions`.
    pub managed: Vec<Dependency>,
    pub variables: Vec<Variable>,
    pub plugins: Vec<Plugin>,
    pub raw_content: String,
    modifications: Vec<Modification>,
    constrained: HashSet<String>,
}

impl ParsedFile {
    pub fn new(file_path: &Path, ecosystem: Ecosystem, kind: FileKind, raw_content: &str) -> Self {
        Self {
            file_path: file_path.to_path_buf(),
            ecosystem,
            kind,
            dependencies: Vec::new(),
            managed: Vec::new(),
            variables: Vec::new(),
            plugins: Vec::new(),
            raw_content: raw_content.to_string(),
            modifications: Vec::new(),
            constrained: HashSet::new(),
        }
    }

    pub fn modifications(&self) -> &[Modification] {
        &self.modifications
    }

    pub fn is_modified(&self) -> bool {
        !self.modifications.is_empty()
    }

    pub(crate) fn push_modification(&mut self, modification: Modification) {
        if modification.kind == ModificationKind::ConstraintInsert {
            self.constrained.insert(modification.target.to_lowercase());
        }
        self.modifications.push(modification);
    }

    /// Drop every pending edit, e.g. after the file failed validation.
    pub(crate) fn discard_modifications(&mut self) {
        self.modifications.clear();
        self.constrained.clear();
    }

    pub fn has_constraint_for(&self, name: &str) -> bool {
        self.constrained.contains(&name.to_lowercase())
    }

    pub fn variable(&self, name: &str) -> Option<&Variable> {
        self.variables.iter().find(|v| v.name == name)
    }
}

/// One package entry of a vulnerability record.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AffectedPackageSpec {
    pub name: String,
    pub ecosystem: String,
    #[serde(default)]
    pub affected_version_ranges: Vec<String>,
    #[serde(default)]
    pub fixed_versions: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Vulnerability {
    pub id: String,
    #[serde(default)]
    pub cve_ids: Vec<String>,
    #[serde(default)]
    pub affected_packages: Vec<AffectedPackageSpec>,
    #[serde(default)]
    pub remediation_text: String,
    #[serde(default)]
    pub severity: Option<String>,
}

impl Vulnerability {
    /// Preferred identifier for comments and reports: first CVE, else the id.
    pub fn display_id(&self) -> &str {
        self.cve_ids.first().map(String::as_str).unwrap_or(&self.id)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateType {
    Patch,
    Minor,
    Major,
    Alternative,
}

impl std::fmt::Display for UpdateType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            UpdateType::Patch => write!(f, "patch"),
            UpdateType::Minor => write!(f, "minor"),
            UpdateType::Major => write!(f, "major"),
            UpdateType::Alternative => write!(f, "alternative"),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FixSuggestion {
    pub dependency_name: String,
    pub ecosystem: Ecosystem,
    pub current_version: String,
    pub suggested_version: String,
    pub update_type: UpdateType,
    pub confidence: f64,
    pub breaking_changes: Vec<String>,
    pub testing_required: bool,
    pub vulnerability_ids: Vec<String>,
    pub is_transitive: bool,
    pub is_dev: bool,
    pub file_path: PathBuf,
    pub rationale: String,
}

impl FixSuggestion {
    pub fn primary_vulnerability(&self) -> &str {
        self.vulnerability_ids
            .first()
            .map(String::as_str)
            .unwrap_or("unknown")
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "verdict", content = "reason", rename_all = "lowercase")]
pub enum SafetyVerdict {
    Safe,
    Problematic(String),
}

impl SafetyVerdict {
    pub fn is_safe(&self) -> bool {
        matches!(self, SafetyVerdict::Safe)
    }
}

impl std::fmt::Display for SafetyVerdict {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            SafetyVerdict::Safe => write!(f, "safe"),
            SafetyVerdict::Problematic(reason) => write!(f, "problematic: {}", reason),
        }
    }
}
