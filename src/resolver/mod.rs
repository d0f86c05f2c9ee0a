//! Dependency tree resolution.
//!
//! The static tree comes from parsed manifests and lock files. Gradle and
//! Maven can then be escalated to their own resolution tooling, whose
//! output replaces the static entries of that ecosystem. Escalation
//! failures degrade to the static data, except a Maven build that yields
//! nothing despite having a `pom.xml`.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::config::ResolverConfig;
use crate::detector::root_manifest;
use crate::error::ResolutionError;
use crate::models::{Dependency, DependencyType, Ecosystem, FileKind, ParsedFile};
use crate::version::{is_concrete, is_more_specific};

pub mod command;
pub mod gradle;
pub mod maven;
pub mod tree;

pub use command::{CommandRunner, TokioCommandRunner};
pub use gradle::GradleResolver;
pub use maven::MavenResolver;

pub(crate) type DependencyMap = HashMap<(String, Ecosystem), Dependency>;

/// Fold `dep` into `map` by identity key.
///
/// The more specific version wins; equally specific versions are ordered by
/// text and then by file so the result does not depend on input order.
/// Direct beats transitive and production beats dev-only regardless of
/// which declaration supplied the version.
pub(crate) fn merge_into(map: &mut DependencyMap, dep: Dependency) {
    let key = dep.identity_key();
    let Some(existing) = map.remove(&key) else {
        map.insert(key, dep);
        return;
    };

    let is_direct = existing.dep_type == DependencyType::Direct
        || dep.dep_type == DependencyType::Direct;
    let is_dev = existing.is_dev && dep.is_dev;

    let mut winner = if prefer(&dep, &existing) { dep } else { existing };
    winner.dep_type = if is_direct {
        DependencyType::Direct
    } else {
        DependencyType::Transitive
    };
    winner.is_dev = is_dev;
    map.insert(key, winner);
}

fn prefer(candidate: &Dependency, existing: &Dependency) -> bool {
    if is_more_specific(&candidate.version, &existing.version) {
        return true;
    }
    if is_more_specific(&existing.version, &candidate.version) {
        return false;
    }
    (&candidate.version, &candidate.file_path) < (&existing.version, &existing.file_path)
}

/// Merge every parsed file into one flat tree.
///
/// Lock files contribute transitive entries, manifests direct ones;
/// property files and override pins contribute nothing. Gradle versions that
/// reference a variable declared in another file (usually
/// `gradle.properties`) are resolved here, preferring the same directory.
pub fn build_tree(files: &[ParsedFile]) -> Vec<Dependency> {
    let mut merged = DependencyMap::new();

    for file in files {
        if file.kind == FileKind::Properties {
            continue;
        }
        for dep in &file.dependencies {
            let mut dep = dep.clone();
            if file.kind == FileKind::Lockfile {
                dep.dep_type = DependencyType::Transitive;
            }
            if dep.ecosystem == Ecosystem::Gradle && !is_concrete(&dep.version) {
                if let Some(value) = dep
                    .variable
                    .as_deref()
                    .and_then(|name| sibling_variable(files, &file.file_path, name))
                {
                    dep.version = value;
                }
            }
            merge_into(&mut merged, dep);
        }
    }

    sorted(merged)
}

fn sibling_variable(files: &[ParsedFile], from: &Path, name: &str) -> Option<String> {
    let dir = from.parent();
    let mut candidates: Vec<&ParsedFile> = files
        .iter()
        .filter(|f| f.ecosystem == Ecosystem::Gradle && f.file_path != from)
        .filter(|f| f.variable(name).is_some())
        .collect();
    candidates.sort_by_key(|f| (f.file_path.parent() != dir, f.file_path.components().count()));
    candidates
        .first()
        .and_then(|f| f.variable(name))
        .map(|v| v.value.clone())
}

fn sorted(map: DependencyMap) -> Vec<Dependency> {
    let mut deps: Vec<Dependency> = map.into_values().collect();
    deps.sort_by(|a, b| {
        a.ecosystem
            .cmp(&b.ecosystem)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
    deps
}

/// An ecosystem that fell back to its statically parsed data.
#[derive(Debug, Clone, Serialize)]
pub struct Degradation {
    pub ecosystem: Ecosystem,
    pub reason: String,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ResolvedTree {
    pub dependencies: Vec<Dependency>,
    pub degradations: Vec<Degradation>,
}

/// Static tree plus build-tool escalation.
pub struct Resolver {
    runner: Arc<dyn CommandRunner>,
    config: ResolverConfig,
}

impl Resolver {
    pub fn new(runner: Arc<dyn CommandRunner>, config: ResolverConfig) -> Self {
        Self { runner, config }
    }

    /// Resolve the repository at `root` from its parsed build files.
    ///
    /// Only [`ResolutionError::EmptyResolution`] from Maven is returned;
    /// every other escalation failure is recorded as a [`Degradation`].
    #[instrument(skip(self, files), fields(files = files.len()))]
    pub async fn resolve(
        &self,
        root: &Path,
        files: &[ParsedFile],
    ) -> Result<ResolvedTree, ResolutionError> {
        let static_tree = build_tree(files);
        info!("Static tree has {} dependencies", static_tree.len());

        let mut tree = ResolvedTree {
            dependencies: static_tree,
            degradations: Vec::new(),
        };
        if self.config.static_only {
            return Ok(tree);
        }

        let paths: Vec<PathBuf> = files.iter().map(|f| f.file_path.clone()).collect();

        if let Some(dir) = manifest_dir(&paths, &["settings.gradle", "settings.gradle.kts"])
            .or_else(|| manifest_dir(&paths, &["build.gradle", "build.gradle.kts"]))
        {
            let resolver = GradleResolver::new(self.runner.as_ref(), &self.config);
            let result = resolver.resolve(&dir).await;
            self.escalate(&mut tree, Ecosystem::Gradle, result)?;
        }

        if let Some(dir) = manifest_dir(&paths, &["pom.xml"]) {
            let resolver = MavenResolver::new(self.runner.as_ref(), &self.config);
            let result = resolver.resolve(&dir).await;
            self.escalate(&mut tree, Ecosystem::Maven, result)?;
        }

        Ok(tree)
    }

    fn escalate(
        &self,
        tree: &mut ResolvedTree,
        ecosystem: Ecosystem,
        result: Result<Vec<Dependency>, ResolutionError>,
    ) -> Result<(), ResolutionError> {
        match result {
            Ok(resolved) if !resolved.is_empty() => {
                info!("{} resolution replaced static data with {} dependencies", ecosystem, resolved.len());
                let mut merged = DependencyMap::new();
                for dep in tree.dependencies.drain(..).filter(|d| d.ecosystem != ecosystem) {
                    merge_into(&mut merged, dep);
                }
                for dep in resolved {
                    merge_into(&mut merged, dep);
                }
                tree.dependencies = sorted(merged);
                Ok(())
            }
            Ok(_) => {
                tree.degradations.push(Degradation {
                    ecosystem,
                    reason: "resolution returned no dependencies".to_string(),
                });
                Ok(())
            }
            Err(e @ ResolutionError::EmptyResolution { .. }) => Err(e),
            Err(e) => {
                warn!("{} resolution failed, using static data: {}", ecosystem, e);
                tree.degradations.push(Degradation {
                    ecosystem,
                    reason: e.to_string(),
                });
                Ok(())
            }
        }
    }
}

fn manifest_dir(paths: &[PathBuf], names: &[&str]) -> Option<PathBuf> {
    root_manifest(paths, names).and_then(|p| p.parent().map(Path::to_path_buf))
}
