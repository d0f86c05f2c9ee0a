use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use serde::Deserialize;
use serde_json::Deserializer;
use tracing::{debug, info};

use super::command::{require_success, CommandRunner, CommandSpec};
use super::tree::parse_maven_tree;
use super::{merge_into, DependencyMap};
use crate::config::ResolverConfig;
use crate::error::ResolutionError;
use crate::models::{Dependency, DependencyType, Ecosystem};

/// Resolves a Maven build with `dependency:tree`.
pub struct MavenResolver<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a ResolverConfig,
}

impl<'a> MavenResolver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a ResolverConfig) -> Self {
        Self { runner, config }
    }

    /// Resolved dependencies of the reactor rooted at `root`.
    ///
    /// With a `pom.xml` present an empty result is
    /// [`ResolutionError::EmptyResolution`]: the build is broken rather
    /// than dependency-free. Without one, empty is just empty.
    pub async fn resolve(&self, root: &Path) -> Result<Vec<Dependency>, ResolutionError> {
        let pom = root.join("pom.xml");
        if !pom.exists() {
            debug!("No pom.xml in {}, skipping Maven resolution", root.display());
            return Ok(Vec::new());
        }

        let program = if root.join("mvnw").exists() {
            "./mvnw"
        } else {
            "mvn"
        };
        let mut spec = CommandSpec::new(program, root)
            .args(["dependency:tree", "-B"])
            .limits(
                Duration::from_secs(self.config.command_timeout_secs),
                self.config.max_output_bytes,
            );

        let json_file = self.config.maven_json_output.then(json_output_path);
        if let Some(path) = &json_file {
            spec = spec.args([
                "-DoutputType=json".to_string(),
                format!("-DoutputFile={}", path.display()),
                "-DappendOutput=true".to_string(),
            ]);
        }

        let output = require_success(&spec, self.runner.run(&spec).await?)?;
        let deps = match &json_file {
            Some(path) => {
                let text = std::fs::read_to_string(path).unwrap_or_default();
                let _ = std::fs::remove_file(path);
                parse_json_trees(&text, &pom)
            }
            None => parse_maven_tree(&output.stdout, &pom),
        };

        if deps.is_empty() {
            return Err(ResolutionError::EmptyResolution {
                ecosystem: Ecosystem::Maven.to_string(),
                manifest: pom,
            });
        }
        info!("Maven resolution found {} dependencies", deps.len());
        Ok(deps)
    }
}

fn json_output_path() -> PathBuf {
    let nanos = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_nanos())
        .unwrap_or(0);
    std::env::temp_dir().join(format!(
        "vulnfixr-tree-{}-{}.json",
        std::process::id(),
        nanos
    ))
}

/// A node of the `-DoutputType=json` tree.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct TreeNode {
    group_id: String,
    artifact_id: String,
    #[serde(default)]
    version: String,
    #[serde(default)]
    scope: String,
    #[serde(default)]
    children: Vec<TreeNode>,
}

/// One JSON document per reactor module, concatenated.
fn parse_json_trees(text: &str, pom: &Path) -> Vec<Dependency> {
    let mut merged = DependencyMap::new();
    for module in Deserializer::from_str(text).into_iter::<TreeNode>() {
        match module {
            Ok(module) => {
                let mut stack: Vec<(&TreeNode, usize)> =
                    module.children.iter().rev().map(|c| (c, 0)).collect();
                while let Some((node, depth)) = stack.pop() {
                    let name = format!("{}:{}", node.group_id, node.artifact_id);
                    let mut dep = Dependency::new(name, &node.version, Ecosystem::Maven, pom);
                    dep.dep_type = if depth == 0 {
                        DependencyType::Direct
                    } else {
                        DependencyType::Transitive
                    };
                    dep.is_dev = matches!(node.scope.as_str(), "test" | "provided");
                    if !merged.contains_key(&dep.identity_key()) {
                        merge_into(&mut merged, dep);
                    }
                    stack.extend(node.children.iter().rev().map(|c| (c, depth + 1)));
                }
            }
            Err(e) => {
                debug!("Stopping at unreadable JSON tree: {}", e);
                break;
            }
        }
    }
    let mut deps: Vec<Dependency> = merged.into_values().collect();
    deps.sort_by(|a, b| a.name.cmp(&b.name));
    deps
}
