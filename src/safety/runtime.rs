//! Runtime levels a repository already targets.
//!
//! Framework majors such as Spring Boot 3 need a minimum Java, Next.js 14 a
//! minimum Node. The level is read from build descriptors, container base
//! images and version-pin files; when several places disagree the lowest
//! one is what the repository can rely on.

use std::collections::HashMap;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use tracing::debug;
use walkdir::WalkDir;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Runtime {
    Java,
    Node,
}

impl std::fmt::Display for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Runtime::Java => write!(f, "Java"),
            Runtime::Node => write!(f, "Node.js"),
        }
    }
}

/// Lowest detected major level per runtime.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuntimeLevels {
    levels: HashMap<Runtime, u64>,
}

impl RuntimeLevels {
    pub fn get(&self, runtime: Runtime) -> Option<u64> {
        self.levels.get(&runtime).copied()
    }

    pub fn record(&mut self, runtime: Runtime, level: u64) {
        self.levels
            .entry(runtime)
            .and_modify(|current| *current = (*current).min(level))
            .or_insert(level);
    }

    pub fn is_empty(&self) -> bool {
        self.levels.is_empty()
    }
}

const MAX_DEPTH: usize = 4;
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git", "build", "target", "dist"];

/// Scan `root` for runtime hints.
pub fn detect_runtimes(root: &Path) -> RuntimeLevels {
    let mut levels = RuntimeLevels::default();

    let walker = WalkDir::new(root)
        .max_depth(MAX_DEPTH)
        .into_iter()
        .filter_entry(|e| {
            e.depth() == 0
                || !e
                    .file_name()
                    .to_str()
                    .map(|n| SKIPPED_DIRS.contains(&n))
                    .unwrap_or(false)
        });

    for entry in walker.filter_map(Result::ok) {
        if !entry.file_type().is_file() {
            continue;
        }
        let Some(name) = entry.file_name().to_str() else {
            continue;
        };
        let kind = classify_file(name);
        if kind == HintFile::None {
            continue;
        }
        let Ok(content) = std::fs::read_to_string(entry.path()) else {
            continue;
        };
        for (runtime, level) in hints(kind, &content) {
            debug!("{} declares {} {}", entry.path().display(), runtime, level);
            levels.record(runtime, level);
        }
    }
    levels
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum HintFile {
    Pom,
    GradleScript,
    Dockerfile,
    JavaVersion,
    NodeVersion,
    ToolVersions,
    Sdkman,
    PackageJson,
    None,
}

fn classify_file(name: &str) -> HintFile {
    match name {
        "pom.xml" => HintFile::Pom,
        ".java-version" => HintFile::JavaVersion,
        ".nvmrc" | ".node-version" => HintFile::NodeVersion,
        ".tool-versions" => HintFile::ToolVersions,
        ".sdkmanrc" => HintFile::Sdkman,
        "package.json" => HintFile::PackageJson,
        n if n.ends_with(".gradle") || n.ends_with(".gradle.kts") => HintFile::GradleScript,
        n if n == "Dockerfile" || n.starts_with("Dockerfile.") || n.ends_with(".dockerfile") => {
            HintFile::Dockerfile
        }
        _ => HintFile::None,
    }
}

fn hints(kind: HintFile, content: &str) -> Vec<(Runtime, u64)> {
    match kind {
        HintFile::Pom => pom_levels(content)
            .into_iter()
            .map(|l| (Runtime::Java, l))
            .collect(),
        HintFile::GradleScript => gradle_levels(content)
            .into_iter()
            .map(|l| (Runtime::Java, l))
            .collect(),
        HintFile::Dockerfile => docker_levels(content),
        HintFile::JavaVersion => java_level(content.trim())
            .map(|l| vec![(Runtime::Java, l)])
            .unwrap_or_default(),
        HintFile::NodeVersion => leading_number(content.trim())
            .map(|l| vec![(Runtime::Node, l)])
            .unwrap_or_default(),
        HintFile::ToolVersions => tool_versions(content),
        HintFile::Sdkman => content
            .lines()
            .filter_map(|l| l.trim().strip_prefix("java="))
            .filter_map(java_level)
            .map(|l| (Runtime::Java, l))
            .collect(),
        HintFile::PackageJson => engines_node(content)
            .map(|l| vec![(Runtime::Node, l)])
            .unwrap_or_default(),
        HintFile::None => Vec::new(),
    }
}

/// `1.8` → 8, `17.0.2` → 17, `11` → 11.
fn java_level(version: &str) -> Option<u64> {
    let version = version
        .trim()
        .trim_start_matches(|c: char| !c.is_ascii_digit());
    let mut parts = version.split(|c: char| !c.is_ascii_digit());
    let first: u64 = parts.next()?.parse().ok()?;
    if first == 1 {
        parts.next()?.parse().ok()
    } else {
        Some(first)
    }
}

fn leading_number(text: &str) -> Option<u64> {
    let digits: String = text
        .trim_start_matches(|c: char| !c.is_ascii_digit())
        .chars()
        .take_while(|c| c.is_ascii_digit())
        .collect();
    digits.parse().ok()
}

fn pom_levels(content: &str) -> Vec<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"<(java\.version|maven\.compiler\.release|maven\.compiler\.source|maven\.compiler\.target|release)>\s*([0-9.]+)\s*</",
        )
        .expect("valid regex")
    });
    re.captures_iter(content)
        .filter_map(|c| java_level(&c[2]))
        .collect()
}

fn gradle_levels(content: &str) -> Vec<u64> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r#"(?:sourceCompatibility\s*=?\s*['"]?(?:JavaVersion\.VERSION_)?([0-9._]+)|JavaVersion\.VERSION_([0-9_]+)|jvmToolchain\s*\(?\s*(\d+)|JavaLanguageVersion\.of\s*\(\s*(\d+))"#,
        )
        .expect("valid regex")
    });
    re.captures_iter(content)
        .filter_map(|c| {
            let raw = (1..=4).find_map(|i| c.get(i))?.as_str().replace('_', ".");
            java_level(&raw)
        })
        .collect()
}

fn docker_levels(content: &str) -> Vec<(Runtime, u64)> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| {
        Regex::new(
            r"(?im)^\s*FROM\s+(?:--platform=\S+\s+)?(?:[\w.\-]+/)*(eclipse-temurin|temurin|openjdk|amazoncorretto|corretto|node):([0-9][\w.\-]*)",
        )
        .expect("valid regex")
    });
    re.captures_iter(content)
        .filter_map(|c| {
            let runtime = if c[1].eq_ignore_ascii_case("node") {
                Runtime::Node
            } else {
                Runtime::Java
            };
            let level = match runtime {
                Runtime::Java => java_level(&c[2]),
                Runtime::Node => leading_number(&c[2]),
            }?;
            Some((runtime, level))
        })
        .collect()
}

fn tool_versions(content: &str) -> Vec<(Runtime, u64)> {
    content
        .lines()
        .filter_map(|line| {
            let mut fields = line.split_whitespace();
            let tool = fields.next()?;
            let version = fields.next()?;
            match tool {
                "java" => java_level(version).map(|l| (Runtime::Java, l)),
                "nodejs" | "node" => leading_number(version).map(|l| (Runtime::Node, l)),
                _ => None,
            }
        })
        .collect()
}

/// Lowest major admitted by `engines.node` (`>=18`, `^18.12 || >=20`).
fn engines_node(content: &str) -> Option<u64> {
    let json: serde_json::Value = serde_json::from_str(content).ok()?;
    let range = json.get("engines")?.get("node")?.as_str()?;
    range
        .split("||")
        .filter_map(leading_number)
        .min()
}
