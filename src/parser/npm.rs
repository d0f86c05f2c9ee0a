use std::path::{Component, Path};
use std::sync::OnceLock;

use regex::Regex;
use serde_json::Value;
use tracing::debug;

use super::{
    file_name, fix_comment, BuildFileParser, CommentStyle, ConstraintResult, ConstraintSession,
};
use crate::edit::{closing_indent, indent_unit, newline_of, Edit};
use crate::error::{ParseError, ValidationError};
use crate::models::{
    Dependency, DependencyType, Ecosystem, FileKind, Location, Modification, ModificationKind,
    ParsedFile, Span,
};
use crate::version::with_range_prefix;

const SECTIONS: &[(&str, bool)] = &[
    ("dependencies", false),
    ("devDependencies", true),
    ("optionalDependencies", false),
    ("peerDependencies", false),
];

/// Parser for `package.json`, `package-lock.json` / `npm-shrinkwrap.json`
/// and `yarn.lock`.
///
/// Only `package.json` is ever rewritten; lockfiles feed the resolved
/// tree and are left for the package manager to regenerate.
pub struct NpmParser {
    session: ConstraintSession,
}

impl NpmParser {
    pub fn new() -> Self {
        Self {
            session: ConstraintSession::default(),
        }
    }
}

impl Default for NpmParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildFileParser for NpmParser {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Npm
    }

    fn can_handle(&self, path: &Path) -> bool {
        matches!(
            file_name(path),
            "package.json" | "package-lock.json" | "npm-shrinkwrap.json" | "yarn.lock"
        )
    }

    fn parse(&self, path: &Path, content: &str) -> Result<ParsedFile, ParseError> {
        let invalid = |message: String| ParseError::InvalidJson {
            path: path.to_path_buf(),
            message,
        };
        match file_name(path) {
            "yarn.lock" => Ok(parse_yarn_lock(path, content)),
            "package-lock.json" | "npm-shrinkwrap.json" => {
                let json: Value = serde_json::from_str(content).map_err(|e| invalid(e.to_string()))?;
                Ok(parse_package_lock(path, content, &json))
            }
            _ => {
                serde_json::from_str::<Value>(content).map_err(|e| invalid(e.to_string()))?;
                let root = JsonScanner::new(content).parse().map_err(invalid)?;
                Ok(parse_manifest(path, content, &root))
            }
        }
    }

    /// JSON has no comments; the note stays in the change description.
    fn comment_style(&self, _file: &ParsedFile) -> Option<CommentStyle> {
        None
    }

    fn render_version(&self, declared: &str, new_version: &str) -> String {
        with_range_prefix(declared, new_version)
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
            return ConstraintResult::Unsupported(
                "lockfiles are regenerated by the package manager".to_string(),
            );
        }
        if file
            .file_path
            .components()
            .any(|c| c == Component::Normal("node_modules".as_ref()))
        {
            return ConstraintResult::Unsupported(
                "package.json under node_modules belongs to an installed package".to_string(),
            );
        }
        if file.dependencies.iter().any(|d| d.name == name) {
            return ConstraintResult::Unsupported(format!(
                "{} is a direct dependency here; an override would conflict with it",
                name
            ));
        }
        if file.has_constraint_for(name) || file.managed.iter().any(|d| d.name == name) {
            return ConstraintResult::AlreadyPresent;
        }

        let root = match JsonScanner::new(&file.raw_content).parse() {
            Ok(root) => root,
            Err(e) => return ConstraintResult::Unsupported(format!("unreadable package.json: {}", e)),
        };
        if !matches!(root.kind, NodeKind::Object(_)) {
            return ConstraintResult::Unsupported("package.json root is not an object".to_string());
        }
        let section = override_section(&root);
        let anchor = root
            .get(section)
            .unwrap_or(&root)
            .span
            .end
            .saturating_sub(1);

        if !self.session.claim(name, &file.file_path) {
            debug!("Override for {} already added to another package.json", name);
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
        let root = JsonScanner::new(content)
            .parse()
            .map_err(ValidationError::Malformed)?;
        let nl = newline_of(content);
        let unit = indent_unit(content);

        let pairs: Vec<String> = inserts
            .iter()
            .map(|m| format!("{}: {}", json_string(&m.target), json_string(&m.new_value)))
            .collect();

        let section = override_section(&root);
        let edit = match root.get(section) {
            Some(object) => append_members(content, object, &pairs, &unit, nl)?,
            None => {
                let indent = member_indent(content, &root, &unit);
                let inner: Vec<String> = pairs
                    .iter()
                    .map(|p| format!("{}{}{}", indent, unit, p))
                    .collect();
                let block = format!(
                    "{}: {{{nl}{}{nl}{}}}",
                    json_string(section),
                    inner.join(&format!(",{}", nl)),
                    indent,
                    nl = nl
                );
                append_members(content, &root, &[block], &unit, nl)?
            }
        };
        Ok(vec![edit])
    }

    fn validate(&self, content: &str) -> Result<(), ValidationError> {
        let value: Value =
            serde_json::from_str(content).map_err(|e| ValidationError::Malformed(e.to_string()))?;
        if value.is_object() {
            Ok(())
        } else {
            Err(ValidationError::MissingRoot("object".to_string()))
        }
    }
}

fn json_string(s: &str) -> String {
    serde_json::to_string(s).unwrap_or_else(|_| format!("\"{}\"", s))
}

/// yarn reads `resolutions`, npm reads `overrides`.
fn override_section(root: &Node) -> &'static str {
    let yarn = root
        .get("packageManager")
        .and_then(Node::as_str)
        .map(|pm| pm.starts_with("yarn"))
        .unwrap_or(false);
    if yarn || root.get("resolutions").is_some() {
        "resolutions"
    } else {
        "overrides"
    }
}

/// Indentation of the members of `object`, one unit past its own line when
/// it is empty.
fn member_indent(content: &str, object: &Node, unit: &str) -> String {
    match object.members().first() {
        Some(first) => closing_indent(content, first.key_span.start).to_string(),
        None => format!("{}{}", closing_indent(content, object.span.start), unit),
    }
}

/// Append already-rendered `members` to a JSON object.
fn append_members(
    content: &str,
    object: &Node,
    members: &[String],
    unit: &str,
    nl: &str,
) -> Result<Edit, ValidationError> {
    if !matches!(object.kind, NodeKind::Object(_)) {
        return Err(ValidationError::Malformed(
            "override section is not an object".to_string(),
        ));
    }
    let indent = member_indent(content, object, unit);
    let body: String = members
        .iter()
        .map(|m| format!(",{}{}{}", nl, indent, m))
        .collect();

    match object.members().last() {
        Some(last) => Ok(Edit::insert(last.value.span.end, body)),
        None => {
            // `{}`: drop the leading comma, close on the object's own indent.
            let close = object.span.end - 1;
            let closing = closing_indent(content, object.span.start);
            Ok(Edit::insert(
                close,
                format!("{}{}{}", &body[1..], nl, closing),
            ))
        }
    }
}

fn is_registry_spec(spec: &str) -> bool {
    let spec = spec.trim();
    !spec.is_empty()
        && !spec.contains(':')
        && !spec.contains('/')
        && !spec.starts_with("link")
        && !spec.starts_with("file")
}

fn parse_manifest(path: &Path, content: &str, root: &Node) -> ParsedFile {
    let mut file = ParsedFile::new(path, Ecosystem::Npm, FileKind::Manifest, content);

    for (section, is_dev) in SECTIONS {
        let Some(object) = root.get(section) else {
            continue;
        };
        for member in object.members() {
            let Some(spec) = member.value.as_str() else {
                continue;
            };
            if !is_registry_spec(spec) {
                debug!("{}: {} is not a registry version, skipping", member.key, spec);
                continue;
            }
            // A package listed in several sections keeps its first entry.
            if file.dependencies.iter().any(|d| d.name == member.key) {
                continue;
            }
            let mut dep = Dependency::new(member.key.clone(), spec, Ecosystem::Npm, path);
            dep.is_dev = *is_dev;
            dep.location = member.value.inner_span().map(|s| Location::from_span(content, s));
            file.dependencies.push(dep);
        }
    }

    if let Some(overrides) = root.get("overrides") {
        collect_overrides(path, content, overrides, &mut file);
    }
    if let Some(resolutions) = root.get("resolutions") {
        for member in resolutions.members() {
            if let Some(spec) = member.value.as_str() {
                let mut dep =
                    Dependency::new(resolution_package(&member.key), spec, Ecosystem::Npm, path);
                dep.location = member.value.inner_span().map(|s| Location::from_span(content, s));
                file.managed.push(dep);
            }
        }
    }

    file
}

/// npm `overrides` nest: `{"a": "1.0"}`, `{"a": {".": "1.0", "b": "2.0"}}`.
fn collect_overrides(path: &Path, content: &str, object: &Node, file: &mut ParsedFile) {
    for member in object.members() {
        let spec_node = match &member.value.kind {
            NodeKind::String(_) => Some(&member.value),
            NodeKind::Object(_) => {
                collect_overrides(path, content, &member.value, file);
                member.value.get(".")
            }
            _ => None,
        };
        if member.key == "." {
            continue;
        }
        if let Some(node) = spec_node {
            if let Some(spec) = node.as_str() {
                // "foo@1.x" targets foo; "@scope/foo" is a plain name.
                let name = match member.key.rsplit_once('@') {
                    Some((name, _)) if !name.is_empty() => name,
                    _ => member.key.as_str(),
                };
                let mut dep = Dependency::new(name, spec, Ecosystem::Npm, path);
                dep.location = node.inner_span().map(|s| Location::from_span(content, s));
                file.managed.push(dep);
            }
        }
    }
}

/// Package named by a `resolutions` key: `**/lodash`, `a/**/@scope/b`.
fn resolution_package(key: &str) -> String {
    let segments: Vec<&str> = key
        .split('/')
        .filter(|s| !s.is_empty() && *s != "**" && *s != "*")
        .collect();
    match segments.as_slice() {
        [.., scope, name] if scope.starts_with('@') => format!("{}/{}", scope, name),
        [.., name] => name.to_string(),
        [] => key.to_string(),
    }
}

/// `package-lock.json` v2/v3 (`packages`) with a v1 (`dependencies`) fallback.
fn parse_package_lock(path: &Path, content: &str, json: &Value) -> ParsedFile {
    let mut file = ParsedFile::new(path, Ecosystem::Npm, FileKind::Lockfile, content);

    let mut push = |name: &str, info: &Value| {
        let Some(version) = info.get("version").and_then(Value::as_str) else {
            return;
        };
        if info.get("link").and_then(Value::as_bool).unwrap_or(false) {
            return;
        }
        let mut dep = Dependency::new(name, version, Ecosystem::Npm, path);
        dep.dep_type = DependencyType::Transitive;
        dep.is_dev = info.get("dev").and_then(Value::as_bool).unwrap_or(false);
        file.dependencies.push(dep);
    };

    if let Some(packages) = json.get("packages").and_then(Value::as_object) {
        for (pkg_path, info) in packages {
            // The root entry has an empty key.
            if pkg_path.is_empty() {
                continue;
            }
            // "node_modules/a/node_modules/@scope/b" -> "@scope/b"
            let name = pkg_path
                .rsplit_once("node_modules/")
                .map(|(_, n)| n)
                .unwrap_or(pkg_path);
            push(name, info);
        }
    } else if let Some(deps) = json.get("dependencies").and_then(Value::as_object) {
        let mut stack: Vec<(&String, &Value)> = deps.iter().collect();
        while let Some((name, info)) = stack.pop() {
            push(name, info);
            if let Some(nested) = info.get("dependencies").and_then(Value::as_object) {
                stack.extend(nested.iter());
            }
        }
    }

    file
}

/// `yarn.lock` (classic and berry): unindented headers, indented `version`.
fn parse_yarn_lock(path: &Path, content: &str) -> ParsedFile {
    static HEADER: OnceLock<Regex> = OnceLock::new();
    static VERSION: OnceLock<Regex> = OnceLock::new();
    let header = HEADER
        .get_or_init(|| Regex::new(r#"^"?(@?[^@"]+)@[^"]*"?$"#).expect("valid regex"));
    let version_re = VERSION
        .get_or_init(|| Regex::new(r#"^\s+version:?\s+"?([^"\s]+)"?"#).expect("valid regex"));

    let mut file = ParsedFile::new(path, Ecosystem::Npm, FileKind::Lockfile, content);
    let mut current: Option<String> = None;

    for line in content.lines() {
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        if !line.starts_with(' ') && !line.starts_with('\t') {
            let first_spec = line
                .trim_end_matches(':')
                .split(", ")
                .next()
                .unwrap_or("")
                .trim();
            current = header
                .captures(first_spec)
                .map(|caps| caps[1].to_string())
                .filter(|name| name != "__metadata");
            continue;
        }
        if let (Some(name), Some(caps)) = (current.as_ref(), version_re.captures(line)) {
            let mut dep = Dependency::new(name.clone(), &caps[1], Ecosystem::Npm, path);
            dep.dep_type = DependencyType::Transitive;
            file.dependencies.push(dep);
            current = None;
        }
    }

    file
}

// ---------------------------------------------------------------------------
// Span-preserving JSON reader
// ---------------------------------------------------------------------------

#[derive(Debug)]
enum NodeKind {
    Object(Vec<Member>),
    Array,
    String(String),
    Scalar,
}

#[derive(Debug)]
struct Member {
    key: String,
    key_span: Span,
    value: Node,
}

/// A JSON value and the bytes it occupies, quotes and braces included.
#[derive(Debug)]
struct Node {
    kind: NodeKind,
    span: Span,
}

impl Node {
    fn members(&self) -> &[Member] {
        match &self.kind {
            NodeKind::Object(members) => members,
            _ => &[],
        }
    }

    fn get(&self, key: &str) -> Option<&Node> {
        self.members().iter().find(|m| m.key == key).map(|m| &m.value)
    }

    fn as_str(&self) -> Option<&str> {
        match &self.kind {
            NodeKind::String(s) => Some(s),
            _ => None,
        }
    }

    /// Span of a string's contents, without the quotes.
    fn inner_span(&self) -> Option<Span> {
        match self.kind {
            NodeKind::String(_) => Some(Span::new(self.span.start + 1, self.span.end - 1)),
            _ => None,
        }
    }
}

struct JsonScanner<'a> {
    text: &'a str,
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> JsonScanner<'a> {
    fn new(text: &'a str) -> Self {
        Self {
            text,
            bytes: text.as_bytes(),
            pos: 0,
        }
    }

    fn parse(mut self) -> Result<Node, String> {
        // Tolerate a byte-order mark.
        if self.text.starts_with('\u{feff}') {
            self.pos = '\u{feff}'.len_utf8();
        }
        let node = self.value()?;
        self.skip_ws();
        if self.pos != self.bytes.len() {
            return Err(format!("trailing data at byte {}", self.pos));
        }
        Ok(node)
    }

    fn skip_ws(&mut self) {
        while self.pos < self.bytes.len() && self.bytes[self.pos].is_ascii_whitespace() {
            self.pos += 1;
        }
    }

    fn expect(&mut self, byte: u8) -> Result<(), String> {
        self.skip_ws();
        if self.bytes.get(self.pos) == Some(&byte) {
            self.pos += 1;
            Ok(())
        } else {
            Err(format!("expected `{}` at byte {}", byte as char, self.pos))
        }
    }

    fn value(&mut self) -> Result<Node, String> {
        self.skip_ws();
        let start = self.pos;
        match self.bytes.get(self.pos) {
            Some(b'{') => self.object(),
            Some(b'[') => {
                self.pos += 1;
                self.skip_ws();
                if self.bytes.get(self.pos) == Some(&b']') {
                    self.pos += 1;
                } else {
                    loop {
                        self.value()?;
                        self.skip_ws();
                        match self.bytes.get(self.pos) {
                            Some(b',') => self.pos += 1,
                            Some(b']') => {
                                self.pos += 1;
                                break;
                            }
                            _ => return Err(format!("unterminated array at byte {}", start)),
                        }
                    }
                }
                Ok(Node {
                    kind: NodeKind::Array,
                    span: Span::new(start, self.pos),
                })
            }
            Some(b'"') => {
                let (value, span) = self.string()?;
                Ok(Node {
                    kind: NodeKind::String(value),
                    span,
                })
            }
            Some(_) => {
                while self.pos < self.bytes.len()
                    && !matches!(self.bytes[self.pos], b',' | b'}' | b']')
                    && !self.bytes[self.pos].is_ascii_whitespace()
                {
                    self.pos += 1;
                }
                Ok(Node {
                    kind: NodeKind::Scalar,
                    span: Span::new(start, self.pos),
                })
            }
            None => Err("unexpected end of input".to_string()),
        }
    }

    fn object(&mut self) -> Result<Node, String> {
        let start = self.pos;
        self.pos += 1;
        let mut members = Vec::new();
        self.skip_ws();
        if self.bytes.get(self.pos) == Some(&b'}') {
            self.pos += 1;
        } else {
            loop {
                self.skip_ws();
                let (key, key_span) = self.string()?;
                self.expect(b':')?;
                let value = self.value()?;
                members.push(Member {
                    key,
                    key_span,
                    value,
                });
                self.skip_ws();
                match self.bytes.get(self.pos) {
                    Some(b',') => self.pos += 1,
                    Some(b'}') => {
                        self.pos += 1;
                        break;
                    }
                    _ => return Err(format!("unterminated object at byte {}", start)),
                }
            }
        }
        Ok(Node {
            kind: NodeKind::Object(members),
            span: Span::new(start, self.pos),
        })
    }

    fn string(&mut self) -> Result<(String, Span), String> {
        let start = self.pos;
        if self.bytes.get(start) != Some(&b'"') {
            return Err(format!("expected string at byte {}", start));
        }
        let mut i = start + 1;
        let mut escaped = false;
        while i < self.bytes.len() {
            match self.bytes[i] {
                b'\\' => {
                    escaped = true;
                    i += 2;
                    continue;
                }
                b'"' => break,
                _ => i += 1,
            }
        }
        if i >= self.bytes.len() {
            return Err(format!("unterminated string at byte {}", start));
        }
        self.pos = i + 1;
        let raw = &self.text[start..self.pos];
        let value = if escaped {
            serde_json::from_str::<String>(raw).map_err(|e| e.to_string())?
        } else {
            raw[1..raw.len() - 1].to_string()
        };
        Ok((value, Span::new(start, self.pos)))
    }
}
