use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::{Captures, Regex};
use tracing::debug;

use super::{
    file_name, fix_comment, render_comment, BuildFileParser, CommentStyle, ConstraintResult,
    ConstraintSession, HASH_COMMENT, SLASH_COMMENT,
};
use crate::edit::{closing_indent, indent_unit, insert_before_close, newline_of, Edit};
use crate::error::{ParseError, ValidationError};
use crate::models::{
    Dependency, DependencyType, Ecosystem, FileKind, Location, Modification, ModificationKind,
    ParsedFile, Plugin, Span, Variable,
};

/// Parser for Gradle build scripts (Groovy and Kotlin DSL), `gradle.properties`
/// and `gradle.lockfile`.
///
/// Declarations are found with regexes over the script text; a brace scanner
/// that skips strings and comments tells which block each one sits in.
pub struct GradleParser {
    session: ConstraintSession,
}

impl GradleParser {
    pub fn new() -> Self {
        Self {
            session: ConstraintSession::default(),
        }
    }
}

impl Default for GradleParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildFileParser for GradleParser {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Gradle
    }

    fn can_handle(&self, path: &Path) -> bool {
        let name = file_name(path);
        name.ends_with(".gradle")
            || name.ends_with(".gradle.kts")
            || name == "gradle.properties"
            || name == "gradle.lockfile"
    }

    fn parse(&self, path: &Path, content: &str) -> Result<ParsedFile, ParseError> {
        match file_name(path) {
            "gradle.lockfile" => Ok(parse_lockfile(path, content)),
            "gradle.properties" => Ok(parse_properties(path, content)),
            _ => Ok(parse_script(path, content)),
        }
    }

    fn comment_style(&self, file: &ParsedFile) -> Option<CommentStyle> {
        match file.kind {
            FileKind::Properties => Some(HASH_COMMENT),
            FileKind::Manifest => Some(SLASH_COMMENT),
            FileKind::Lockfile => None,
        }
    }

    fn add_constraint_for_transitive(
        &self,
        file: &mut ParsedFile,
        name: &str,
        version: &str,
        vuln_id: &str,
        reason: &str,
    ) -> ConstraintResult {
        if file.kind != FileKind::Manifest {
            return ConstraintResult::Unsupported(format!(
                "{} cannot declare dependency constraints",
                file_name(&file.file_path)
            ));
        }
        if file_name(&file.file_path).starts_with("settings.gradle") {
            return ConstraintResult::Unsupported(
                "settings scripts cannot declare dependency constraints".to_string(),
            );
        }
        if !name.contains(':') {
            return ConstraintResult::Unsupported(format!(
                "`{}` is not a group:artifact coordinate",
                name
            ));
        }
        if file.has_constraint_for(name)
            || file.managed.iter().any(|d| d.name.eq_ignore_ascii_case(name))
        {
            return ConstraintResult::AlreadyPresent;
        }

        let anchor = match constraint_anchor(&file.raw_content) {
            Ok(anchor) => anchor.offset(&file.raw_content),
            Err(reason) => return ConstraintResult::Unsupported(reason),
        };

        if !self.session.claim(name, &file.file_path) {
            debug!("Constraint for {} already added to another build file", name);
            return ConstraintResult::AlreadyPresent;
        }

        let location = Location::from_span(&file.raw_content, Span::at(anchor));
        file.push_modification(Modification {
            kind: ModificationKind::ConstraintInsert,
            target: name.to_string(),
            location,
            old_value: String::new(),
            new_value: version.to_string(),
            comment: fix_comment(vuln_id, reason),
            vulnerability_id: vuln_id.to_string(),
        });
        ConstraintResult::Added
    }

    fn constraint_edits(
        &self,
        file: &ParsedFile,
        inserts: &[&Modification],
    ) -> Result<Vec<Edit>, ValidationError> {
        let content = &file.raw_content;
        let nl = newline_of(content);
        let unit = indent_unit(content);
        let kotlin = file_name(&file.file_path).ends_with(".kts");

        let render_entries = |indent: &str| -> String {
            inserts
                .iter()
                .map(|m| render_constraint(m, indent, &unit, kotlin, nl))
                .collect()
        };

        let anchor = constraint_anchor(content).map_err(ValidationError::Malformed)?;
        let edit = match anchor {
            Anchor::ConstraintsBlock { close } => {
                let indent = format!("{}{}", closing_indent(content, close), unit);
                insert_before_close(content, close, &render_entries(&indent))
            }
            Anchor::DependenciesBlock { close } => {
                let indent = format!("{}{}", closing_indent(content, close), unit);
                let inner = format!("{}{}", indent, unit);
                let block = format!(
                    "{indent}constraints {{{nl}{entries}{indent}}}{nl}",
                    indent = indent,
                    nl = nl,
                    entries = render_entries(&inner)
                );
                insert_before_close(content, close, &block)
            }
            Anchor::EndOfFile => {
                let inner = format!("{}{}", unit, unit);
                let lead = if content.is_empty() || content.ends_with('\n') {
                    nl.to_string()
                } else {
                    format!("{}{}", nl, nl)
                };
                let block = format!(
                    "{lead}dependencies {{{nl}{unit}constraints {{{nl}{entries}{unit}}}{nl}}}{nl}",
                    lead = lead,
                    nl = nl,
                    unit = unit,
                    entries = render_entries(&inner)
                );
                Edit::insert(content.len(), block)
            }
        };
        Ok(vec![edit])
    }

    fn validate(&self, content: &str) -> Result<(), ValidationError> {
        scan_braces(content).map(|_| ()).map_err(|offset| {
            ValidationError::Malformed(format!("unbalanced braces near byte {}", offset))
        })
    }
}

fn render_constraint(m: &Modification, indent: &str, unit: &str, kotlin: bool, nl: &str) -> String {
    let comment = render_comment(SLASH_COMMENT, indent, &m.comment, nl);
    let because = format!("Security fix for {}", m.vulnerability_id);
    if kotlin {
        format!(
            "{comment}{i}implementation(\"{name}:{version}\") {{{nl}{i}{u}because(\"{because}\"){nl}{i}}}{nl}",
            comment = comment,
            i = indent,
            u = unit,
            nl = nl,
            name = m.target,
            version = m.new_value,
            because = because.replace('\\', "\\\\").replace('"', "\\\"").replace('$', "\\$"),
        )
    } else {
        format!(
            "{comment}{i}implementation('{name}:{version}') {{{nl}{i}{u}because '{because}'{nl}{i}}}{nl}",
            comment = comment,
            i = indent,
            u = unit,
            nl = nl,
            name = m.target,
            version = m.new_value,
            because = because.replace('\\', "\\\\").replace('\'', "\\'"),
        )
    }
}

// ---------------------------------------------------------------------------
// Block structure
// ---------------------------------------------------------------------------

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Block {
    kind: BlockKind,
    open: usize,
    close: usize,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BlockKind {
    Dependencies,
    Constraints,
    Buildscript,
    PluginManagement,
    Plugins,
}

impl Block {
    fn contains(&self, offset: usize) -> bool {
        self.open < offset && offset < self.close
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Anchor {
    ConstraintsBlock { close: usize },
    DependenciesBlock { close: usize },
    EndOfFile,
}

impl Anchor {
    fn offset(&self, content: &str) -> usize {
        match self {
            Anchor::ConstraintsBlock { close } | Anchor::DependenciesBlock { close } => *close,
            Anchor::EndOfFile => content.len(),
        }
    }
}

/// Pair every `{` with its `}`, skipping strings and comments.
///
/// Returns the offset of the first unbalanced brace on failure.
fn scan_braces(content: &str) -> Result<HashMap<usize, usize>, usize> {
    let bytes = content.as_bytes();
    let mut pairs = HashMap::new();
    let mut stack: Vec<usize> = Vec::new();
    let mut i = 0;

    while i < bytes.len() {
        let b = bytes[i];
        let next = bytes.get(i + 1).copied();
        match b {
            b'/' if next == Some(b'/') => {
                while i < bytes.len() && bytes[i] != b'\n' {
                    i += 1;
                }
                continue;
            }
            b'/' if next == Some(b'*') => {
                i += 2;
                while i + 1 < bytes.len() && !(bytes[i] == b'*' && bytes[i + 1] == b'/') {
                    i += 1;
                }
                i += 2;
                continue;
            }
            b'\'' | b'"' => {
                let triple = bytes.get(i + 1) == Some(&b) && bytes.get(i + 2) == Some(&b);
                i += if triple { 3 } else { 1 };
                while i < bytes.len() {
                    if bytes[i] == b'\\' {
                        i += 2;
                        continue;
                    }
                    if bytes[i] == b {
                        if !triple {
                            break;
                        }
                        if bytes.get(i + 1) == Some(&b) && bytes.get(i + 2) == Some(&b) {
                            i += 2;
                            break;
                        }
                    }
                    if bytes[i] == b'\n' && !triple {
                        break;
                    }
                    i += 1;
                }
            }
            b'{' => stack.push(i),
            b'}' => match stack.pop() {
                Some(open) => {
                    pairs.insert(open, i);
                }
                None => return Err(i),
            },
            _ => {}
        }
        i += 1;
    }

    match stack.pop() {
        Some(open) => Err(open),
        None => Ok(pairs),
    }
}

fn find_blocks(content: &str) -> Vec<Block> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"\b(dependencies|constraints|buildscript|pluginManagement|plugins)\s*\{")
            .expect("valid regex")
    });

    let pairs = match scan_braces(content) {
        Ok(pairs) => pairs,
        Err(offset) => {
            debug!("Unbalanced braces near byte {}, block scopes unavailable", offset);
            return Vec::new();
        }
    };

    re.captures_iter(content)
        .filter_map(|caps| {
            let whole = caps.get(0)?;
            let open = whole.end() - 1;
            let close = *pairs.get(&open)?;
            let kind = match &caps[1] {
                "dependencies" => BlockKind::Dependencies,
                "constraints" => BlockKind::Constraints,
                "buildscript" => BlockKind::Buildscript,
                "pluginManagement" => BlockKind::PluginManagement,
                _ => BlockKind::Plugins,
            };
            Some(Block { kind, open, close })
        })
        .collect()
}

fn inside(blocks: &[Block], offset: usize, kinds: &[BlockKind]) -> bool {
    blocks
        .iter()
        .any(|b| kinds.contains(&b.kind) && b.contains(offset))
}

const BOOTSTRAP_SCOPES: &[BlockKind] = &[
    BlockKind::Buildscript,
    BlockKind::PluginManagement,
    BlockKind::Plugins,
];

/// Where dependency constraints can go in this script.
fn constraint_anchor(content: &str) -> Result<Anchor, String> {
    let blocks = find_blocks(content);
    let eligible: Vec<&Block> = blocks
        .iter()
        .filter(|b| b.kind == BlockKind::Dependencies)
        .filter(|b| !inside(&blocks, b.open, BOOTSTRAP_SCOPES))
        .collect();

    let existing_constraints = blocks.iter().find(|b| {
        b.kind == BlockKind::Constraints && eligible.iter().any(|d| d.contains(b.open))
    });
    if let Some(block) = existing_constraints {
        return Ok(Anchor::ConstraintsBlock { close: block.close });
    }

    // Outermost eligible block, last in the file.
    let outermost = eligible
        .iter()
        .filter(|b| !eligible.iter().any(|other| other.contains(b.open)))
        .max_by_key(|b| b.open);
    if let Some(block) = outermost {
        return Ok(Anchor::DependenciesBlock { close: block.close });
    }

    let bootstrap_only = blocks.iter().any(|b| b.kind == BlockKind::Dependencies);
    if bootstrap_only {
        return Err(
            "dependency constraints are not supported inside buildscript, pluginManagement or plugins blocks"
                .to_string(),
        );
    }
    Ok(Anchor::EndOfFile)
}

// ---------------------------------------------------------------------------
// Parsing
// ---------------------------------------------------------------------------

fn parse_script(path: &Path, content: &str) -> ParsedFile {
    let mut file = ParsedFile::new(path, Ecosystem::Gradle, FileKind::Manifest, content);
    let blocks = find_blocks(content);

    file.variables = parse_script_variables(content);
    let variables: HashMap<String, String> = file
        .variables
        .iter()
        .map(|v| (v.name.clone(), v.value.clone()))
        .collect();

    for (offset, mut dep, bom_import) in parse_script_dependencies(path, content, &variables) {
        if bom_import || inside(&blocks, offset, &[BlockKind::Constraints]) {
            file.managed.push(dep);
        } else {
            if inside(&blocks, offset, BOOTSTRAP_SCOPES) {
                // Build classpath, not shipped with the application.
                dep.is_dev = true;
            }
            file.dependencies.push(dep);
        }
    }

    file.plugins = parse_plugins(content);
    file
}

fn span_of(caps: &Captures<'_>, name: &str) -> Option<Span> {
    caps.name(name).map(|m| Span::new(m.start(), m.end()))
}

fn parse_script_variables(content: &str) -> Vec<Variable> {
    static ASSIGN: OnceLock<Regex> = OnceLock::new();
    static EXTRA: OnceLock<Regex> = OnceLock::new();
    static SET: OnceLock<Regex> = OnceLock::new();
    let assign = ASSIGN.get_or_init(|| {
        Regex::new(
            r#"(?m)^[ \t]*(?:ext\.|project\.ext\.|def\s+|val\s+|var\s+|String\s+)?(?P<name>[A-Za-z_][A-Za-z0-9_]*)\s*(?::\s*String\s*)?=\s*['"](?P<value>[^'"\n$]*)['"]"#,
        )
        .expect("valid regex")
    });
    let extra = EXTRA.get_or_init(|| {
        Regex::new(
            r#"(?m)\b(?:extra|ext)\s*\[\s*"(?P<name>[A-Za-z_][\w.]*)"\s*\]\s*=\s*"(?P<value>[^"\n$]*)""#,
        )
        .expect("valid regex")
    });
    let set = SET.get_or_init(|| {
        Regex::new(r#"(?m)\bset\(\s*"(?P<name>[A-Za-z_][\w.]*)"\s*,\s*"(?P<value>[^"\n$]*)"\s*\)"#)
            .expect("valid regex")
    });

    let mut variables = Vec::new();
    for re in [assign, extra, set] {
        for caps in re.captures_iter(content) {
            let Some(span) = span_of(&caps, "value") else {
                continue;
            };
            let name = caps["name"].to_string();
            if variables.iter().any(|v: &Variable| v.name == name) {
                continue;
            }
            variables.push(Variable {
                name,
                value: caps["value"].to_string(),
                location: Location::from_span(content, span),
            });
        }
    }
    variables.sort_by_key(|v| v.location.span.start);
    variables
}

/// Name of the variable a version expression refers to (`$x`, `${x}`,
/// `${project.ext.x}`), if it is one.
fn variable_reference(version: &str) -> Option<String> {
    let rest = version.strip_prefix('$')?;
    let inner = rest
        .strip_prefix('{')
        .and_then(|r| r.strip_suffix('}'))
        .unwrap_or(rest);
    let name = ["rootProject.ext.", "project.ext.", "rootProject.", "project.", "ext."]
        .iter()
        .find_map(|p| inner.strip_prefix(p))
        .unwrap_or(inner);
    if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_' || c == '.') {
        Some(name.to_string())
    } else {
        None
    }
}

const NON_CONFIGURATIONS: &[&str] = &["id", "apply", "include", "println", "because", "from"];

fn is_dev_configuration(configuration: &str) -> bool {
    let lower = configuration.to_lowercase();
    lower.starts_with("test")
        || lower.starts_with("androidtest")
        || lower.starts_with("kapttest")
        || lower == "developmentonly"
}

/// Dependencies with the byte offset of their declaration and whether the
/// declaration is a BOM import.
fn parse_script_dependencies(
    path: &Path,
    content: &str,
    variables: &HashMap<String, String>,
) -> Vec<(usize, Dependency, bool)> {
    static STRING_NOTATION: OnceLock<Regex> = OnceLock::new();
    static MAP_NOTATION: OnceLock<Regex> = OnceLock::new();
    let string_notation = STRING_NOTATION.get_or_init(|| {
        Regex::new(
            r#"(?m)(?:^|[{;])[ \t]*(?P<conf>[A-Za-z][A-Za-z0-9_]*)\s*\(?\s*(?:(?:enforcedPlatform|platform)\s*\(\s*)?['"](?P<group>[^:'"\s$]+):(?P<artifact>[^:'"\s]+):(?P<version>[^:'"@\s]+)(?::[^'"@\s]*)?(?:@[^'"\s]*)?['"]"#,
        )
        .expect("valid regex")
    });
    let map_notation = MAP_NOTATION.get_or_init(|| {
        Regex::new(
            r#"(?m)(?:^|[{;])[ \t]*(?P<conf>[A-Za-z][A-Za-z0-9_]*)\s*\(?\s*group\s*[:=]\s*['"](?P<group>[^'"]+)['"]\s*,\s*name\s*[:=]\s*['"](?P<artifact>[^'"]+)['"]\s*,\s*version\s*[:=]\s*['"](?P<version>[^'"]+)['"]"#,
        )
        .expect("valid regex")
    });

    let mut out = Vec::new();
    for re in [string_notation, map_notation] {
        for caps in re.captures_iter(content) {
            let conf = &caps["conf"];
            if NON_CONFIGURATIONS.contains(&conf) {
                continue;
            }
            let Some(span) = span_of(&caps, "version") else {
                continue;
            };
            let declared = &caps["version"];
            let name = format!("{}:{}", &caps["group"], &caps["artifact"]);

            let mut dep = Dependency::new(name, declared, Ecosystem::Gradle, path);
            dep.is_dev = is_dev_configuration(conf);
            dep.location = Some(Location::from_span(content, span));
            if let Some(variable) = variable_reference(declared) {
                if let Some(value) = variables.get(&variable) {
                    dep.version = value.clone();
                }
                dep.variable = Some(variable);
            }

            let offset = caps.name("conf").map(|m| m.start()).unwrap_or(0);
            out.push((offset, dep, conf == "mavenBom"));
        }
    }
    out.sort_by_key(|(offset, _, _)| *offset);
    out
}

fn parse_plugins(content: &str) -> Vec<Plugin> {
    static ID: OnceLock<Regex> = OnceLock::new();
    static KOTLIN: OnceLock<Regex> = OnceLock::new();
    let id = ID.get_or_init(|| {
        Regex::new(
            r#"\bid\s*\(?\s*['"](?P<id>[^'"]+)['"]\s*\)?\s*version\s*\(?\s*['"](?P<version>[^'"]+)['"]"#,
        )
        .expect("valid regex")
    });
    let kotlin = KOTLIN.get_or_init(|| {
        Regex::new(r#"\bkotlin\s*\(\s*"(?P<id>[^"]+)"\s*\)\s*version\s*"(?P<version>[^"]+)""#)
            .expect("valid regex")
    });

    let mut plugins = Vec::new();
    for caps in id.captures_iter(content) {
        if let Some(span) = span_of(&caps, "version") {
            plugins.push(Plugin {
                id: caps["id"].to_string(),
                version: caps["version"].to_string(),
                location: Location::from_span(content, span),
            });
        }
    }
    for caps in kotlin.captures_iter(content) {
        if let Some(span) = span_of(&caps, "version") {
            plugins.push(Plugin {
                id: format!("org.jetbrains.kotlin.{}", &caps["id"]),
                version: caps["version"].to_string(),
                location: Location::from_span(content, span),
            });
        }
    }
    plugins.sort_by_key(|p| p.location.span.start);
    plugins
}

/// `gradle.properties`: `key=value` pairs used as version variables.
fn parse_properties(path: &Path, content: &str) -> ParsedFile {
    let mut file = ParsedFile::new(path, Ecosystem::Gradle, FileKind::Properties, content);
    let mut offset = 0;
    for line in content.split_inclusive('\n') {
        let line_offset = offset;
        offset += line.len();

        let body = line.trim_end_matches(['\r', '\n']);
        let trimmed = body.trim_start();
        if trimmed.is_empty() || trimmed.starts_with('#') || trimmed.starts_with('!') {
            continue;
        }
        let Some(sep) = body.find(['=', ':']) else {
            continue;
        };
        let key = body[..sep].trim();
        let raw_value = &body[sep + 1..];
        let value = raw_value.trim();
        if key.is_empty() || value.is_empty() {
            continue;
        }
        let value_start = line_offset + sep + 1 + (raw_value.len() - raw_value.trim_start().len());
        let span = Span::new(value_start, value_start + value.len());
        file.variables.push(Variable {
            name: key.to_string(),
            value: value.to_string(),
            location: Location::from_span(content, span),
        });
    }
    file
}

/// `gradle.lockfile`: `group:artifact:version=conf1,conf2`.
fn parse_lockfile(path: &Path, content: &str) -> ParsedFile {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(r"^([^:\s]+):([^:\s]+):([^=\s]+)(?:=(.*))?").expect("valid regex")
    });

    let mut file = ParsedFile::new(path, Ecosystem::Gradle, FileKind::Lockfile, content);
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with("empty=") {
            continue;
        }
        if let Some(caps) = re.captures(line) {
            let name = format!("{}:{}", &caps[1], &caps[2]);
            let mut dep = Dependency::new(name, &caps[3], Ecosystem::Gradle, path);
            dep.dep_type = DependencyType::Transitive;
            dep.is_dev = caps
                .get(4)
                .map(|confs| {
                    let confs: Vec<&str> = confs.as_str().split(',').collect();
                    !confs.is_empty() && confs.iter().all(|c| is_dev_configuration(c.trim()))
                })
                .unwrap_or(false);
            file.dependencies.push(dep);
        }
    }
    file
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(name: &str, content: &str) -> ParsedFile {
        GradleParser::new().parse(Path::new(name), content).unwrap()
    }

    #[test]
    fn test_parse_string_and_map_notation() {
        let content = r#"
dependencies {
    implementation 'org.springframework:spring-core:5.3.23'
    implementation("com.google.guava:guava:31.1-jre")
    testImplementation group: 'junit', name: 'junit', version: '4.13.2'
}
"#;
        let file = parse("build.gradle", content);
        assert_eq!(file.dependencies.len(), 3);
        assert_eq!(file.dependencies[0].name, "org.springframework:spring-core");
        assert_eq!(file.dependencies[1].version, "31.1-jre");
        assert!(file.dependencies[2].is_dev);
    }

    #[test]
    fn test_single_line_blocks() {
        let content = "dependencies { implementation 'commons-io:commons-io:2.6'; runtimeOnly 'org.postgresql:postgresql:42.2.5' }\ndependencies { constraints { implementation 'com.google.code.gson:gson:2.8.9' } }\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        assert_eq!(file.dependencies.len(), 2);
        assert_eq!(file.dependencies[1].name, "org.postgresql:postgresql");
        assert_eq!(file.managed.len(), 1);
        assert_eq!(file.managed[0].name, "com.google.code.gson:gson");

        assert!(parser.update_dependency_version(&mut file, "commons-io:commons-io", "2.6", "2.8.0", "CVE-X", ""));
        let out = parser.get_modified_content(&file).unwrap();
        assert!(out.contains("dependencies { implementation 'commons-io:commons-io:2.8.0'; runtimeOnly"));
        parser.validate(&out).unwrap();
    }

    #[test]
    fn test_commons_io_fix_adds_comment_above() {
        let content = "dependencies {\n    implementation 'commons-io:commons-io:2.6'\n}\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        assert!(parser.update_dependency_version(
            &mut file,
            "commons-io:commons-io",
            "2.6",
            "2.8.0",
            "CVE-X",
            "path traversal"
        ));
        let out = parser.get_modified_content(&file).unwrap();
        assert_eq!(
            out,
            "dependencies {\n    // Security fix: CVE-X - path traversal\n    implementation 'commons-io:commons-io:2.8.0'\n}\n"
        );
    }

    #[test]
    fn test_round_trip_leaves_other_declarations() {
        let content = "dependencies {\n    implementation 'com.google.code.gson:gson:2.8.0'\n    implementation 'io.github.openfeign:feign-gson:11.0'\n}\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        assert!(parser.update_dependency_version(&mut file, "com.google.code.gson:gson", "2.8.0", "2.8.9", "CVE-1", ""));
        let out = parser.get_modified_content(&file).unwrap();
        let reparsed = parser.parse(Path::new("build.gradle"), &out).unwrap();
        assert_eq!(reparsed.dependencies[0].version, "2.8.9");
        assert_eq!(reparsed.dependencies[1].name, "io.github.openfeign:feign-gson");
        assert_eq!(reparsed.dependencies[1].version, "11.0");
        assert!(out.contains("    implementation 'io.github.openfeign:feign-gson:11.0'\n}\n"));
    }

    #[test]
    fn test_no_substring_match() {
        let content = "dependencies {\n    implementation 'io.github.openfeign:feign-gson:11.0'\n}\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        assert!(!parser.update_dependency_version(&mut file, "gson", "2.8.0", "2.8.9", "CVE-1", ""));
        assert!(!file.is_modified());
    }

    #[test]
    fn test_artifact_only_match() {
        let content = "dependencies {\n    implementation 'com.google.code.gson:gson:2.8.0'\n}\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        assert!(parser.update_dependency_version(&mut file, "gson", "2.8.0", "2.8.9", "CVE-1", ""));
    }

    #[test]
    fn test_variable_reference_redirects_update() {
        let content = "ext {\n    gsonVersion = '2.8.0'\n}\ndependencies {\n    implementation \"com.google.code.gson:gson:${gsonVersion}\"\n}\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        assert_eq!(file.dependencies[0].version, "2.8.0");
        assert_eq!(file.dependencies[0].variable.as_deref(), Some("gsonVersion"));

        assert!(parser.update_dependency_version(&mut file, "com.google.code.gson:gson", "2.8.0", "2.8.9", "CVE-2", ""));
        let out = parser.get_modified_content(&file).unwrap();
        assert!(out.contains("    // Security fix: CVE-2\n    gsonVersion = '2.8.9'\n"));
        assert!(out.contains("com.google.code.gson:gson:${gsonVersion}"));
    }

    #[test]
    fn test_properties_file_variables() {
        let parser = GradleParser::new();
        let mut file = parser
            .parse(Path::new("gradle.properties"), "# versions\ngsonVersion = 2.8.0\n")
            .unwrap();
        assert_eq!(file.kind, FileKind::Properties);
        assert_eq!(file.variables[0].value, "2.8.0");
        assert!(parser.update_variable(&mut file, "gsonVersion", "2.8.9", "CVE-3", "fix"));
        let out = parser.get_modified_content(&file).unwrap();
        assert_eq!(out, "# versions\n# Security fix: CVE-3 - fix\ngsonVersion = 2.8.9\n");
    }

    #[test]
    fn test_constraint_inserted_once() {
        let content = "dependencies {\n    implementation 'org.example:app:1.0'\n}\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        let first = parser.add_constraint_for_transitive(&mut file, "com.fasterxml.jackson.core:jackson-databind", "2.13.4", "CVE-4", "deserialization");
        let second = parser.add_constraint_for_transitive(&mut file, "com.fasterxml.jackson.core:jackson-databind", "2.13.4", "CVE-4", "deserialization");
        assert_eq!(first, ConstraintResult::Added);
        assert_eq!(second, ConstraintResult::AlreadyPresent);

        let out = parser.get_modified_content(&file).unwrap();
        assert_eq!(out.matches("jackson-databind:2.13.4").count(), 1);
        assert!(out.contains("    constraints {\n        // Security fix: CVE-4 - deserialization\n        implementation('com.fasterxml.jackson.core:jackson-databind:2.13.4') {\n            because 'Security fix for CVE-4'\n        }\n    }\n}\n"));
        parser.validate(&out).unwrap();

        let reparsed = parser.parse(Path::new("build.gradle"), &out).unwrap();
        assert_eq!(reparsed.managed.len(), 1);
        assert_eq!(reparsed.dependencies.len(), 1);
    }

    #[test]
    fn test_existing_constraint_detected() {
        let content = "dependencies {\n    constraints {\n        implementation('org.yaml:snakeyaml:1.33')\n    }\n}\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        let result = parser.add_constraint_for_transitive(&mut file, "org.yaml:snakeyaml", "2.0", "CVE-5", "");
        assert_eq!(result, ConstraintResult::AlreadyPresent);
    }

    #[test]
    fn test_constraint_added_to_existing_block() {
        let content = "dependencies {\n    constraints {\n        implementation('org.yaml:snakeyaml:1.33')\n    }\n}\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        parser.add_constraint_for_transitive(&mut file, "io.netty:netty-codec", "4.1.86.Final", "CVE-6", "");
        let out = parser.get_modified_content(&file).unwrap();
        assert!(out.contains("        implementation('org.yaml:snakeyaml:1.33')\n        // Security fix: CVE-6\n        implementation('io.netty:netty-codec:4.1.86.Final') {"));
        parser.validate(&out).unwrap();
    }

    #[test]
    fn test_constraint_declined_in_buildscript_scope() {
        let content = "buildscript {\n    dependencies {\n        classpath 'com.android.tools.build:gradle:7.0.0'\n    }\n}\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        assert!(file.dependencies[0].is_dev);
        let result = parser.add_constraint_for_transitive(&mut file, "org.yaml:snakeyaml", "2.0", "CVE-7", "");
        assert!(matches!(result, ConstraintResult::Unsupported(_)));
        assert!(!file.is_modified());
    }

    #[test]
    fn test_constraint_declined_for_settings_script() {
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("settings.gradle"), "include ':app'\n").unwrap();
        let result = parser.add_constraint_for_transitive(&mut file, "org.yaml:snakeyaml", "2.0", "CVE-7", "");
        assert!(matches!(result, ConstraintResult::Unsupported(_)));
    }

    #[test]
    fn test_kotlin_dsl_constraint_appended_when_no_dependencies_block() {
        let parser = GradleParser::new();
        let mut file = parser
            .parse(Path::new("build.gradle.kts"), "plugins {\n    java\n}\n")
            .unwrap();
        assert_eq!(
            parser.add_constraint_for_transitive(&mut file, "org.yaml:snakeyaml", "2.0", "CVE-8", ""),
            ConstraintResult::Added
        );
        let out = parser.get_modified_content(&file).unwrap();
        assert!(out.ends_with("dependencies {\n    constraints {\n        // Security fix: CVE-8\n        implementation(\"org.yaml:snakeyaml:2.0\") {\n            because(\"Security fix for CVE-8\")\n        }\n    }\n}\n"));
        parser.validate(&out).unwrap();
    }

    #[test]
    fn test_plugins_parsed_and_updated() {
        let content = "plugins {\n    id 'org.springframework.boot' version '2.7.0'\n    kotlin(\"jvm\") version \"1.8.0\"\n}\n";
        let parser = GradleParser::new();
        let mut file = parser.parse(Path::new("build.gradle"), content).unwrap();
        assert_eq!(file.plugins.len(), 2);
        assert_eq!(file.plugins[1].id, "org.jetbrains.kotlin.jvm");
        assert!(parser.update_dependency_version(&mut file, "org.springframework.boot", "2.7.0", "2.7.18", "CVE-9", ""));
        let out = parser.get_modified_content(&file).unwrap();
        assert!(out.contains("id 'org.springframework.boot' version '2.7.18'"));
    }

    #[test]
    fn test_lockfile_is_transitive() {
        let content = "# lockfile\ncom.google.guava:guava:31.1-jre=compileClasspath,runtimeClasspath\njunit:junit:4.13.2=testCompileClasspath\nempty=\n";
        let file = parse("gradle.lockfile", content);
        assert_eq!(file.kind, FileKind::Lockfile);
        assert_eq!(file.dependencies.len(), 2);
        assert_eq!(file.dependencies[0].dep_type, DependencyType::Transitive);
        assert!(!file.dependencies[0].is_dev);
        assert!(file.dependencies[1].is_dev);
    }

    #[test]
    fn test_validate_braces() {
        let parser = GradleParser::new();
        assert!(parser.validate("a { b { 'x}' } }").is_ok());
        assert!(parser.validate("a { // }\n").is_err());
        assert!(parser.validate("}").is_err());
    }
}
