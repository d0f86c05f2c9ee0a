use std::path::Path;

use quick_xml::escape::escape;
use quick_xml::events::Event;
use quick_xml::Reader;
use tracing::debug;

use super::{
    file_name, fix_comment, render_comment, BuildFileParser, CommentStyle, ConstraintResult,
    ConstraintSession, XML_COMMENT,
};
use crate::edit::{
    closing_indent, indent_unit, indentation_at, insert_before_close, line_start_of, newline_of,
    Edit,
};
use crate::error::{ParseError, ValidationError};
use crate::models::{
    Dependency, Ecosystem, FileKind, Location, Modification, ModificationKind, ParsedFile, Plugin,
    Span, Variable,
};

const DEFAULT_PLUGIN_GROUP: &str = "org.apache.maven.plugins";

/// Parser for `pom.xml`.
///
/// Uses the quick-xml event reader and keeps byte offsets of every leaf
/// value so edits touch only the text between the tags.
pub struct MavenParser {
    session: ConstraintSession,
}

impl MavenParser {
    pub fn new() -> Self {
        Self {
            session: ConstraintSession::default(),
        }
    }
}

impl Default for MavenParser {
    fn default() -> Self {
        Self::new()
    }
}

impl BuildFileParser for MavenParser {
    fn ecosystem(&self) -> Ecosystem {
        Ecosystem::Maven
    }

    fn can_handle(&self, path: &Path) -> bool {
        file_name(path) == "pom.xml"
    }

    fn parse(&self, path: &Path, content: &str) -> Result<ParsedFile, ParseError> {
        let scan = scan_pom(content).map_err(|message| ParseError::InvalidXml {
            path: path.to_path_buf(),
            message,
        })?;
        Ok(build_parsed_file(path, content, scan))
    }

    fn comment_style(&self, _file: &ParsedFile) -> Option<CommentStyle> {
        Some(XML_COMMENT)
    }

    fn add_constraint_for_transitive(
        &self,
        file: &mut ParsedFile,
        name: &str,
        version: &str,
        vuln_id: &str,
        reason: &str,
    ) -> ConstraintResult {
        let Some((group, artifact)) = name.split_once(':') else {
            return ConstraintResult::Unsupported(format!(
                "`{}` is not a groupId:artifactId coordinate",
                name
            ));
        };
        if group.is_empty() || artifact.is_empty() {
            return ConstraintResult::Unsupported(format!("`{}` is incomplete", name));
        }

        let scan = match scan_pom(&file.raw_content) {
            Ok(scan) => scan,
            Err(e) => return ConstraintResult::Unsupported(format!("unreadable pom: {}", e)),
        };
        if scan.root.as_deref() != Some("project") {
            return ConstraintResult::Unsupported("pom.xml has no <project> root".to_string());
        }
        if file.has_constraint_for(name)
            || file.managed.iter().any(|d| d.name.eq_ignore_ascii_case(name))
        {
            return ConstraintResult::AlreadyPresent;
        }
        let Some(anchor) = scan.layout.anchor() else {
            return ConstraintResult::Unsupported("pom.xml has no closing </project>".to_string());
        };
        if !self.session.claim(name, &file.file_path) {
            debug!("Constraint for {} already added to another pom", name);
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
        let layout = scan_pom(content).map_err(ValidationError::Malformed)?.layout;
        let nl = newline_of(content);
        let unit = indent_unit(content);

        let entries = |indent: &str| -> String {
            inserts
                .iter()
                .map(|m| render_managed_dependency(m, indent, &unit, nl))
                .collect()
        };
        let management_block = |indent: &str| -> String {
            format!(
                "{i}<dependencyManagement>{nl}{i}{u}<dependencies>{nl}{entries}{i}{u}</dependencies>{nl}{i}</dependencyManagement>{nl}",
                i = indent,
                u = unit,
                nl = nl,
                entries = entries(&format!("{}{}{}", indent, unit, unit)),
            )
        };

        let edit = if let Some(close) = layout.managed_dependencies_close {
            let indent = format!("{}{}", closing_indent(content, close), unit);
            insert_before_close(content, close, &entries(&indent))
        } else if let Some(close) = layout.dependency_management_close {
            let indent = format!("{}{}", closing_indent(content, close), unit);
            let block = format!(
                "{i}<dependencies>{nl}{entries}{i}</dependencies>{nl}",
                i = indent,
                nl = nl,
                entries = entries(&format!("{}{}", indent, unit)),
            );
            insert_before_close(content, close, &block)
        } else if let Some(open) = layout.project_dependencies_open {
            let line_start = line_start_of(content, open);
            if content[line_start..open].trim().is_empty() {
                let indent = indentation_at(content, line_start);
                Edit::insert(line_start, management_block(indent))
            } else {
                let indent = closing_indent(content, open).to_string();
                Edit::insert(open, format!("{}{}{}", nl, management_block(&indent), indent))
            }
        } else if let Some(close) = layout.project_close {
            let indent = format!("{}{}", closing_indent(content, close), unit);
            insert_before_close(content, close, &management_block(&indent))
        } else {
            return Err(ValidationError::MissingRoot("project".to_string()));
        };
        Ok(vec![edit])
    }

    fn validate(&self, content: &str) -> Result<(), ValidationError> {
        let scan = scan_pom(content).map_err(ValidationError::Malformed)?;
        match scan.root.as_deref() {
            Some("project") => Ok(()),
            _ => Err(ValidationError::MissingRoot("project".to_string())),
        }
    }
}

fn render_managed_dependency(m: &Modification, indent: &str, unit: &str, nl: &str) -> String {
    let (group, artifact) = m.target.split_once(':').unwrap_or(("", m.target.as_str()));
    format!(
        "{comment}{i}<dependency>{nl}{i}{u}<groupId>{g}</groupId>{nl}{i}{u}<artifactId>{a}</artifactId>{nl}{i}{u}<version>{v}</version>{nl}{i}</dependency>{nl}",
        comment = render_comment(XML_COMMENT, indent, &m.comment, nl),
        i = indent,
        u = unit,
        nl = nl,
        g = escape(group),
        a = escape(artifact),
        v = escape(m.new_value.as_str()),
    )
}

// ---------------------------------------------------------------------------
// Scanning
// ---------------------------------------------------------------------------

/// Text content of a leaf element and where it sits.
#[derive(Debug, Clone)]
struct Leaf {
    value: String,
    span: Span,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum EntryContext {
    Direct,
    Managed,
    Parent,
    Plugin,
}

#[derive(Debug, Clone)]
struct PomEntry {
    context: EntryContext,
    group: Option<Leaf>,
    artifact: Option<Leaf>,
    version: Option<Leaf>,
    scope: Option<String>,
}

impl PomEntry {
    fn new(context: EntryContext) -> Self {
        Self {
            context,
            group: None,
            artifact: None,
            version: None,
            scope: None,
        }
    }
}

/// Offsets of the tags a managed-dependency insert is placed against.
#[derive(Debug, Default, Clone, Copy)]
struct PomLayout {
    managed_dependencies_close: Option<usize>,
    dependency_management_close: Option<usize>,
    project_dependencies_open: Option<usize>,
    project_close: Option<usize>,
}

impl PomLayout {
    fn anchor(&self) -> Option<usize> {
        self.managed_dependencies_close
            .or(self.dependency_management_close)
            .or(self.project_dependencies_open)
            .or(self.project_close)
    }
}

#[derive(Debug, Default)]
struct PomScan {
    root: Option<String>,
    properties: Vec<Variable>,
    entries: Vec<PomEntry>,
    layout: PomLayout,
}

fn path_is(stack: &[(String, usize)], expected: &[&str]) -> bool {
    stack.len() == expected.len() && stack.iter().zip(expected).all(|((name, _), e)| name == e)
}

fn entry_context(stack: &[(String, usize)]) -> Option<EntryContext> {
    const DIRECT: &[&[&str]] = &[
        &["project", "dependencies", "dependency"],
        &["project", "profiles", "profile", "dependencies", "dependency"],
    ];
    const MANAGED: &[&[&str]] = &[
        &["project", "dependencyManagement", "dependencies", "dependency"],
        &["project", "profiles", "profile", "dependencyManagement", "dependencies", "dependency"],
    ];
    if DIRECT.iter().any(|p| path_is(stack, p)) {
        return Some(EntryContext::Direct);
    }
    if MANAGED.iter().any(|p| path_is(stack, p)) {
        return Some(EntryContext::Managed);
    }
    if path_is(stack, &["project", "parent"]) {
        return Some(EntryContext::Parent);
    }
    let n = stack.len();
    if n >= 3 && stack[n - 1].0 == "plugin" && stack[n - 2].0 == "plugins" {
        let owner = stack[n - 3].0.as_str();
        if owner == "build" || owner == "pluginManagement" {
            return Some(EntryContext::Plugin);
        }
    }
    None
}

fn is_property_path(stack: &[(String, usize)]) -> bool {
    let n = stack.len();
    n >= 3
        && stack[n - 2].0 == "properties"
        && (n == 3 || (n == 5 && stack[1].0 == "profiles" && stack[2].0 == "profile"))
        && stack[0].0 == "project"
}

/// Walk the document once, collecting properties, dependency entries and
/// the layout offsets.
fn scan_pom(content: &str) -> Result<PomScan, String> {
    let mut reader = Reader::from_str(content);
    reader.config_mut().trim_text(false);

    let mut scan = PomScan::default();
    // (local name, byte offset just past the start tag)
    let mut stack: Vec<(String, usize)> = Vec::new();
    let mut current: Option<(usize, PomEntry)> = None;

    loop {
        let event = reader
            .read_event()
            .map_err(|e| format!("at byte {}: {}", reader.buffer_position(), e))?;
        let pos = reader.buffer_position() as usize;
        match event {
            Event::Start(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                if scan.root.is_none() {
                    scan.root = Some(name.clone());
                }
                stack.push((name, pos));

                if current.is_none() {
                    if let Some(context) = entry_context(&stack) {
                        current = Some((stack.len(), PomEntry::new(context)));
                    }
                }
                if path_is(&stack, &["project", "dependencies"]) {
                    scan.layout.project_dependencies_open = content[..pos].rfind('<');
                }
            }
            Event::End(e) => {
                let name = String::from_utf8_lossy(e.local_name().as_ref()).into_owned();
                let close_start = content[..pos].rfind('<').unwrap_or(pos);
                let leaf = stack.last().and_then(|(_, open_end)| {
                    let raw = content.get(*open_end..close_start)?;
                    if raw.contains('<') {
                        return None;
                    }
                    let value = raw.trim();
                    let start = open_end + (raw.len() - raw.trim_start().len());
                    Some(Leaf {
                        value: value.to_string(),
                        span: Span::new(start, start + value.len()),
                    })
                });

                if is_property_path(&stack) {
                    if let Some(leaf) = &leaf {
                        scan.properties.push(Variable {
                            name: name.clone(),
                            value: leaf.value.clone(),
                            location: Location::from_span(content, leaf.span),
                        });
                    }
                }

                if let Some((depth, entry)) = current.as_mut() {
                    if stack.len() == *depth + 1 {
                        match name.as_str() {
                            "groupId" => entry.group = leaf,
                            "artifactId" => entry.artifact = leaf,
                            "version" => entry.version = leaf,
                            "scope" => entry.scope = leaf.map(|l| l.value),
                            _ => {}
                        }
                    } else if stack.len() == *depth {
                        if let Some((_, entry)) = current.take() {
                            scan.entries.push(entry);
                        }
                    }
                }

                if path_is(&stack, &["project", "dependencyManagement", "dependencies"]) {
                    scan.layout.managed_dependencies_close = Some(close_start);
                } else if path_is(&stack, &["project", "dependencyManagement"]) {
                    scan.layout.dependency_management_close = Some(close_start);
                } else if path_is(&stack, &["project"]) {
                    scan.layout.project_close = Some(close_start);
                }

                stack.pop();
            }
            Event::Empty(e) => {
                if scan.root.is_none() {
                    scan.root = Some(String::from_utf8_lossy(e.local_name().as_ref()).into_owned());
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if let Some((name, _)) = stack.last() {
        return Err(format!("unclosed element <{}>", name));
    }
    Ok(scan)
}

/// `gson.version` for `${gson.version}`.
fn property_reference(value: &str) -> Option<&str> {
    value
        .strip_prefix("${")
        .and_then(|v| v.strip_suffix('}'))
        .filter(|v| !v.is_empty() && !v.contains("${"))
}

fn resolve_property(value: &str, properties: &[Variable]) -> Option<String> {
    let name = property_reference(value)?;
    let found = properties.iter().find(|p| p.name == name)?;
    // One level of indirection: <a>${b}</a>.
    match property_reference(&found.value) {
        Some(inner) => properties
            .iter()
            .find(|p| p.name == inner)
            .map(|p| p.value.clone()),
        None => Some(found.value.clone()),
    }
}

fn build_parsed_file(path: &Path, content: &str, scan: PomScan) -> ParsedFile {
    let mut file = ParsedFile::new(path, Ecosystem::Maven, FileKind::Manifest, content);

    for property in &scan.properties {
        if file.variable(&property.name).is_none() {
            file.variables.push(property.clone());
        }
    }

    let mut pending_direct = Vec::new();
    for entry in scan.entries {
        let Some(artifact) = &entry.artifact else {
            continue;
        };
        let group = match (&entry.group, entry.context) {
            (Some(group), _) => group.value.clone(),
            (None, EntryContext::Plugin) => DEFAULT_PLUGIN_GROUP.to_string(),
            (None, _) => continue,
        };
        let name = format!("{}:{}", group, artifact.value);

        if entry.context == EntryContext::Plugin {
            // Property-held plugin versions change with their property.
            if let Some(version) = entry.version.filter(|v| property_reference(&v.value).is_none()) {
                file.plugins.push(Plugin {
                    id: name,
                    version: version.value,
                    location: Location::from_span(content, version.span),
                });
            }
            continue;
        }

        let mut dep = Dependency::new(name, "", Ecosystem::Maven, path);
        dep.is_dev = entry.scope.as_deref() == Some("test");
        if let Some(version) = &entry.version {
            dep.location = Some(Location::from_span(content, version.span));
            match property_reference(&version.value) {
                Some(property) => {
                    dep.variable = Some(property.to_string());
                    dep.version = resolve_property(&version.value, &file.variables)
                        .unwrap_or_else(|| version.value.clone());
                }
                None => dep.version = version.value.clone(),
            }
        }

        match entry.context {
            EntryContext::Managed => file.managed.push(dep),
            _ => pending_direct.push(dep),
        }
    }

    for mut dep in pending_direct {
        if dep.location.is_none() {
            match file.managed.iter().find(|m| m.name.eq_ignore_ascii_case(&dep.name)) {
                Some(managed) => {
                    dep.version = managed.version.clone();
                    dep.variable = managed.variable.clone();
                    dep.location = managed.location;
                }
                None => {
                    debug!("{} has no version in {}, skipping", dep.name, path.display());
                    continue;
                }
            }
        }
        file.dependencies.push(dep);
    }

    file
}
