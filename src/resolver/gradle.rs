use std::path::{Path, PathBuf};
use std::sync::OnceLock;
use std::time::Duration;

use futures::future::join_all;
use regex::Regex;
use tracing::{debug, info, warn};

use super::command::{require_success, CommandRunner, CommandSpec};
use super::tree::parse_gradle_tree;
use super::{merge_into, DependencyMap};
use crate::config::ResolverConfig;
use crate::error::ResolutionError;
use crate::models::Dependency;

/// Resolves a Gradle build through its own `dependencies` task.
pub struct GradleResolver<'a> {
    runner: &'a dyn CommandRunner,
    config: &'a ResolverConfig,
}

impl<'a> GradleResolver<'a> {
    pub fn new(runner: &'a dyn CommandRunner, config: &'a ResolverConfig) -> Self {
        Self { runner, config }
    }

    fn command(&self, root: &Path) -> CommandSpec {
        let program = if root.join("gradlew").exists() {
            "./gradlew"
        } else {
            "gradle"
        };
        CommandSpec::new(program, root).limits(
            Duration::from_secs(self.config.command_timeout_secs),
            self.config.max_output_bytes,
        )
    }

    /// Resolved dependencies of every sub-project under `root`.
    ///
    /// A sub-project that fails is logged and skipped. An empty result means
    /// the caller should keep its static data.
    pub async fn resolve(&self, root: &Path) -> Result<Vec<Dependency>, ResolutionError> {
        let spec = self
            .command(root)
            .args(["projects", "-q", "--console=plain"]);
        let output = require_success(&spec, self.runner.run(&spec).await?)?;
        let projects = parse_projects(&output.stdout);
        info!("Resolving {} Gradle project(s)", projects.len());

        let batch_size = self.config.gradle_batch_size.max(1);
        let mut merged = DependencyMap::new();

        for batch in projects.chunks(batch_size) {
            let futures: Vec<_> = batch
                .iter()
                .map(|project| self.resolve_project(root, project))
                .collect();
            let results = join_all(futures).await;

            for (project, result) in batch.iter().zip(results) {
                match result {
                    Ok(deps) => {
                        for dep in deps {
                            merge_into(&mut merged, dep);
                        }
                    }
                    Err(e) => warn!("Skipping Gradle project '{}': {}", display_path(project), e),
                }
            }
        }

        if merged.is_empty() {
            warn!("Gradle resolution returned no dependencies; keeping static data");
        }
        let mut deps: Vec<Dependency> = merged.into_values().collect();
        deps.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(deps)
    }

    /// All configured configurations of one project. Fails only when every
    /// configuration failed.
    async fn resolve_project(
        &self,
        root: &Path,
        project: &str,
    ) -> Result<Vec<Dependency>, ResolutionError> {
        let task = if project.is_empty() {
            "dependencies".to_string()
        } else {
            format!("{}:dependencies", project)
        };
        let build_file = project_build_file(root, project);

        let mut merged = DependencyMap::new();
        let mut last_error = None;
        let mut succeeded = false;

        for configuration in &self.config.gradle_configurations {
            let spec = self.command(root).args([
                task.as_str(),
                "--configuration",
                configuration.as_str(),
                "-q",
                "--console=plain",
            ]);
            let output = match self.runner.run(&spec).await.and_then(|o| require_success(&spec, o)) {
                Ok(output) => output,
                Err(e) => {
                    debug!("{} failed: {}", spec.display(), e);
                    last_error = Some(e);
                    continue;
                }
            };
            succeeded = true;
            let is_dev = configuration.to_lowercase().starts_with("test");
            for dep in parse_gradle_tree(&output.stdout, &build_file, is_dev) {
                merge_into(&mut merged, dep);
            }
        }

        match (succeeded, last_error) {
            (false, Some(e)) => Err(e),
            _ => Ok(merged.into_values().collect()),
        }
    }
}

/// Project paths from `gradle projects`; the root project is `""`.
fn parse_projects(output: &str) -> Vec<String> {
    static RE: OnceLock<Regex> = OnceLock::new();
    let re = RE.get_or_init(|| Regex::new(r"Project '(:[^']*)'").expect("valid regex"));

    let mut projects = vec![String::new()];
    for caps in re.captures_iter(output) {
        let path = caps[1].to_string();
        if path != ":" && !projects.contains(&path) {
            projects.push(path);
        }
    }
    projects
}

fn display_path(project: &str) -> &str {
    if project.is_empty() {
        ":"
    } else {
        project
    }
}

/// Build script of a project, by the default `:a:b` → `a/b` layout.
fn project_build_file(root: &Path, project: &str) -> PathBuf {
    let dir = project
        .split(':')
        .filter(|s| !s.is_empty())
        .fold(root.to_path_buf(), |dir, segment| dir.join(segment));
    ["build.gradle.kts", "build.gradle"]
        .iter()
        .map(|name| dir.join(name))
        .find(|path| path.exists())
        .unwrap_or_else(|| dir.join("build.gradle"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::DependencyType;
    use crate::resolver::command::testing::ScriptedRunner;

    const PROJECTS: &str = "\
Root project 'shop'
+--- Project ':api'
\\--- Project ':core'
";

    #[test]
    fn test_parse_projects() {
        assert_eq!(parse_projects(PROJECTS), vec!["", ":api", ":core"]);
        assert_eq!(parse_projects("Root project 'x'\nNo sub-projects\n"), vec![""]);
    }

    #[tokio::test]
    async fn test_failing_project_does_not_drop_others() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default()
            .reply("projects", PROJECTS)
            .reply("gradle dependencies --configuration runtimeClasspath", "+--- a:root:1.0\n")
            .reply("gradle dependencies --configuration testRuntimeClasspath", "+--- junit:junit:4.13.2\n")
            .fail(":api:dependencies", 1)
            .reply(":core:dependencies --configuration runtimeClasspath", "+--- c:core:2.0\n|    \\--- c:leaf:1.1\n")
            .reply(":core:dependencies --configuration testRuntimeClasspath", "+--- c:core:2.0\n");
        let config = ResolverConfig::default();
        let deps = GradleResolver::new(&runner, &config)
            .resolve(dir.path())
            .await
            .unwrap();

        let names: Vec<&str> = deps.iter().map(|d| d.name.as_str()).collect();
        assert_eq!(names, vec!["a:root", "c:core", "c:leaf", "junit:junit"]);

        let core = deps.iter().find(|d| d.name == "c:core").unwrap();
        assert!(!core.is_dev);
        let junit = deps.iter().find(|d| d.name == "junit:junit").unwrap();
        assert!(junit.is_dev);
        let leaf = deps.iter().find(|d| d.name == "c:leaf").unwrap();
        assert_eq!(leaf.dep_type, DependencyType::Transitive);
    }

    #[tokio::test]
    async fn test_discovery_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let runner = ScriptedRunner::default().fail("projects", 1);
        let config = ResolverConfig::default();
        let result = GradleResolver::new(&runner, &config).resolve(dir.path()).await;
        assert!(matches!(result, Err(ResolutionError::ToolFailed { .. })));
    }

    #[tokio::test]
    async fn test_wrapper_preferred() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("gradlew"), "").unwrap();
        let runner = ScriptedRunner::default().reply("projects", "Root project 'x'\n");
        let config = ResolverConfig::default();
        let deps = GradleResolver::new(&runner, &config)
            .resolve(dir.path())
            .await
            .unwrap();
        assert!(deps.is_empty());
        assert!(runner.calls.lock().unwrap()[0].starts_with("./gradlew projects"));
    }
}
