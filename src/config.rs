use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

use crate::models::UpdateType;
use crate::safety::runtime::Runtime;

/// Root configuration structure, deserialized from `.vulnfixr/config.toml`.
///
/// Every table is optional; missing keys fall back to the built-in defaults.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Wall-clock bound for the whole resolve-and-match phase.
    pub analysis_timeout_secs: u64,
    pub resolver: ResolverConfig,
    pub matcher: MatcherConfig,
    pub safety: SafetyConfig,
    pub cache: CacheConfig,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            analysis_timeout_secs: 1800,
            resolver: ResolverConfig::default(),
            matcher: MatcherConfig::default(),
            safety: SafetyConfig::default(),
            cache: CacheConfig::default(),
        }
    }
}

/// Build-tool escalation settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ResolverConfig {
    /// Skip Gradle/Maven subprocesses and use manifests and lock files only.
    pub static_only: bool,
    pub command_timeout_secs: u64,
    pub max_output_bytes: usize,
    /// Gradle configurations listed per sub-project. Configurations whose
    /// name starts with `test` mark their dependencies dev-only.
    pub gradle_configurations: Vec<String>,
    /// Sub-projects resolved concurrently.
    pub gradle_batch_size: usize,
    /// Ask `dependency:tree` for JSON instead of text.
    pub maven_json_output: bool,
}

impl Default for ResolverConfig {
    fn default() -> Self {
        Self {
            static_only: false,
            command_timeout_secs: 600,
            max_output_bytes: 16 * 1024 * 1024,
            gradle_configurations: vec![
                "runtimeClasspath".to_string(),
                "testRuntimeClasspath".to_string(),
            ],
            gradle_batch_size: 4,
            maven_json_output: false,
        }
    }
}

/// Scoring policy for fix suggestions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MatcherConfig {
    pub major_penalty: f64,
    pub minor_penalty: f64,
    pub breaking_change_penalty: f64,
    pub dev_penalty: f64,
    pub min_confidence: f64,
    pub breaking_changes: Vec<BreakingChangeRule>,
    /// Update type assumed for "update to latest" suggestions, first match wins.
    pub family_update_types: Vec<FamilyUpdateType>,
    pub default_update_type: UpdateType,
}

/// A known behavior change for a dependency family.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BreakingChangeRule {
    pub pattern: String,
    /// Smallest update that triggers the rule.
    #[serde(default = "default_major")]
    pub min_update: UpdateType,
    pub note: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyUpdateType {
    pub pattern: String,
    pub update_type: UpdateType,
}

fn default_major() -> UpdateType {
    UpdateType::Major
}

impl Default for MatcherConfig {
    fn default() -> Self {
        let breaking = |pattern: &str, min_update: UpdateType, note: &str| BreakingChangeRule {
            pattern: pattern.to_string(),
            min_update,
            note: note.to_string(),
        };
        let family = |pattern: &str, update_type: UpdateType| FamilyUpdateType {
            pattern: pattern.to_string(),
            update_type,
        };
        Self {
            major_penalty: 0.3,
            minor_penalty: 0.1,
            breaking_change_penalty: 0.1,
            dev_penalty: 0.05,
            min_confidence: 0.1,
            breaking_changes: vec![
                breaking(
                    "org.springframework*:*",
                    UpdateType::Major,
                    "Spring major upgrades change configuration properties and remove deprecated APIs",
                ),
                breaking(
                    "org.hibernate*:*",
                    UpdateType::Major,
                    "Hibernate major upgrades change query and mapping semantics",
                ),
                breaking(
                    "com.fasterxml.jackson.*:*",
                    UpdateType::Minor,
                    "Jackson minor releases can change default (de)serialization behavior",
                ),
                breaking(
                    "io.netty:*",
                    UpdateType::Minor,
                    "Netty minor releases can change buffer and pipeline defaults",
                ),
                breaking(
                    "react",
                    UpdateType::Major,
                    "React major upgrades change rendering behavior",
                ),
                breaking(
                    "react-dom",
                    UpdateType::Major,
                    "React major upgrades change rendering behavior",
                ),
                breaking(
                    "@angular/*",
                    UpdateType::Major,
                    "Angular major upgrades require migration schematics",
                ),
                breaking(
                    "vue",
                    UpdateType::Major,
                    "Vue major upgrades change the component API",
                ),
                breaking(
                    "webpack",
                    UpdateType::Major,
                    "webpack major upgrades change configuration format",
                ),
            ],
            family_update_types: vec![
                family("com.fasterxml.jackson.*:*", UpdateType::Minor),
                family("io.netty:*", UpdateType::Minor),
                family("org.apache.logging.log4j:*", UpdateType::Minor),
                family("org.yaml:snakeyaml", UpdateType::Major),
                family("lodash", UpdateType::Minor),
                family("minimist", UpdateType::Patch),
            ],
            default_update_type: UpdateType::Major,
        }
    }
}

/// Declarative compatibility rules for the safety classifier.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct SafetyConfig {
    pub families: Vec<FamilyRule>,
    pub manual_migration: Vec<ManualMigrationRule>,
    pub runtime_gates: Vec<RuntimeGate>,
}

/// Libraries whose members must share a major version.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FamilyRule {
    pub name: String,
    pub patterns: Vec<String>,
}

/// Libraries no automatic fix can upgrade.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManualMigrationRule {
    pub pattern: String,
    pub reason: String,
    /// Only block major bumps; smaller updates stay automatic.
    #[serde(default)]
    pub major_only: bool,
}

/// A framework major version that needs a minimum runtime.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RuntimeGate {
    pub pattern: String,
    /// First major version of the framework the gate applies to.
    pub from_major: u64,
    pub runtime: Runtime,
    pub minimum: u64,
}

impl Default for SafetyConfig {
    fn default() -> Self {
        let family = |name: &str, patterns: &[&str]| FamilyRule {
            name: name.to_string(),
            patterns: patterns.iter().map(|p| p.to_string()).collect(),
        };
        let manual = |pattern: &str, reason: &str, major_only: bool| ManualMigrationRule {
            pattern: pattern.to_string(),
            reason: reason.to_string(),
            major_only,
        };
        let gate = |pattern: &str, from_major: u64, runtime: Runtime, minimum: u64| RuntimeGate {
            pattern: pattern.to_string(),
            from_major,
            runtime,
            minimum,
        };
        Self {
            families: vec![
                family("grpc", &["io.grpc:*", "com.google.protobuf:*"]),
                family(
                    "jackson",
                    &[
                        "com.fasterxml.jackson.core:*",
                        "com.fasterxml.jackson.datatype:*",
                        "com.fasterxml.jackson.module:*",
                        "com.fasterxml.jackson.dataformat:*",
                    ],
                ),
                family("netty", &["io.netty:*"]),
            ],
            manual_migration: vec![
                manual(
                    "log4j:log4j",
                    "Log4j 1.x is end-of-life; migrate to org.apache.logging.log4j",
                    false,
                ),
                manual(
                    "commons-collections:commons-collections",
                    "Commons Collections 4 moves to the org.apache.commons.collections4 package",
                    true,
                ),
                manual(
                    "javax.servlet:*",
                    "Jakarta EE renames javax.* packages to jakarta.*",
                    true,
                ),
                manual(
                    "request",
                    "request is deprecated; replace it with a maintained HTTP client",
                    false,
                ),
                manual(
                    "angular",
                    "AngularJS is end-of-life; moving to Angular is a rewrite",
                    false,
                ),
            ],
            runtime_gates: vec![
                gate("org.springframework.boot:*", 3, Runtime::Java, 17),
                gate("org.springframework:*", 6, Runtime::Java, 17),
                gate("org.eclipse.jetty:*", 12, Runtime::Java, 17),
                gate("next", 14, Runtime::Node, 18),
                gate("eslint", 9, Runtime::Node, 18),
            ],
        }
    }
}

/// Clone-cache expiry.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
    pub max_age_secs: u64,
    pub max_uses: u32,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            max_age_secs: 3600,
            max_uses: 10,
        }
    }
}

/// Load the configuration, searching in order:
///
/// 1. `config_override`: path passed via `--config`
/// 2. `<project_path>/.vulnfixr/config.toml`
/// 3. `~/.config/vulnfixr/config.toml`
/// 4. Built-in [`Config::default`]
pub fn load_config(project_path: &Path, config_override: Option<&Path>) -> Result<Config> {
    if let Some(path) = config_override {
        return read_config(path);
    }

    let project_config = project_path.join(".vulnfixr").join("config.toml");
    if project_config.exists() {
        return read_config(&project_config);
    }

    if let Some(home) = dirs::home_dir() {
        let home_config = home.join(".config").join("vulnfixr").join("config.toml");
        if home_config.exists() {
            return read_config(&home_config);
        }
    }

    Ok(Config::default())
}

fn read_config(path: &Path) -> Result<Config> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("reading {}", path.display()))?;
    toml::from_str(&content).with_context(|| format!("parsing {}", path.display()))
}

/// Case-insensitive glob match of a coordinate pattern; `*` matches any run
/// of characters.
pub fn pattern_matches(pattern: &str, name: &str) -> bool {
    let pattern: Vec<char> = pattern.to_lowercase().chars().collect();
    let name: Vec<char> = name.to_lowercase().chars().collect();

    let (mut p, mut n) = (0, 0);
    let mut star: Option<(usize, usize)> = None;
    while n < name.len() {
        if p < pattern.len() && pattern[p] == '*' {
            star = Some((p, n));
            p += 1;
        } else if p < pattern.len() && pattern[p] == name[n] {
            p += 1;
            n += 1;
        } else if let Some((star_p, star_n)) = star {
            p = star_p + 1;
            n = star_n + 1;
            star = Some((star_p, star_n + 1));
        } else {
            return false;
        }
    }
    pattern[p..].iter().all(|c| *c == '*')
}
