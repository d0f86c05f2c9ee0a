//! End-to-end remediation of one repository.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use serde::Serialize;
use tracing::{info, instrument, warn};

use crate::applier::{ChangeApplier, ChangeSet};
use crate::config::Config;
use crate::detector::{detect_ecosystems, discover_build_files};
use crate::error::{FatalError, ProviderError};
use crate::matcher::match_vulnerabilities;
use crate::models::{Ecosystem, FixSuggestion, ParsedFile, Vulnerability};
use crate::parser::ParserRegistry;
use crate::provider::{ChangeRequest, RepositoryProvider};
use crate::report::markdown;
use crate::resolver::{CommandRunner, ResolvedTree, Resolver};
use crate::safety::{detect_runtimes, partition, SafetyContext};

/// Everything learned about a repository before any edit.
#[derive(Debug, Clone)]
pub struct Analysis {
    pub root: PathBuf,
    pub ecosystems: Vec<Ecosystem>,
    pub files: Vec<ParsedFile>,
    pub tree: ResolvedTree,
    pub suggestions: Vec<FixSuggestion>,
}

#[derive(Debug, Clone, Serialize)]
pub struct Remediation {
    pub root: PathBuf,
    pub ecosystems: Vec<Ecosystem>,
    pub dependency_count: usize,
    pub degradations: Vec<crate::resolver::Degradation>,
    pub change_set: ChangeSet,
}

pub struct RemediationEngine {
    config: Config,
    runner: Arc<dyn CommandRunner>,
    registry: ParserRegistry,
}

impl RemediationEngine {
    pub fn new(config: Config, runner: Arc<dyn CommandRunner>) -> Self {
        Self {
            config,
            runner,
            registry: ParserRegistry::new(),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Discover, parse, resolve and match. Resolution and matching together
    /// are bounded by `analysis_timeout_secs`.
    #[instrument(skip(self, vulnerabilities), fields(vulnerabilities = vulnerabilities.len()))]
    pub async fn analyze(
        &self,
        root: &Path,
        vulnerabilities: &[Vulnerability],
    ) -> Result<Analysis, FatalError> {
        let paths = discover_build_files(root, &self.registry);
        if paths.is_empty() {
            return Err(FatalError::NoBuildFiles(root.to_path_buf()));
        }
        let ecosystems = detect_ecosystems(&paths, &self.registry);
        info!("Found {} build files ({:?})", paths.len(), ecosystems);

        let files = self.registry.parse_all(&paths);

        let timeout = Duration::from_secs(self.config.analysis_timeout_secs);
        let resolver = Resolver::new(self.runner.clone(), self.config.resolver.clone());
        let phase = async {
            let tree = resolver.resolve(root, &files).await?;
            let suggestions =
                match_vulnerabilities(&tree.dependencies, vulnerabilities, &self.config.matcher);
            Ok::<_, FatalError>((tree, suggestions))
        };
        let (tree, suggestions) = tokio::time::timeout(timeout, phase)
            .await
            .map_err(|_| FatalError::Timeout(timeout))??;

        if tree.dependencies.is_empty() {
            return Err(FatalError::NoDependencies);
        }
        for degradation in &tree.degradations {
            warn!("{} degraded to static data: {}", degradation.ecosystem, degradation.reason);
        }
        info!(
            "{} dependencies, {} fix suggestions",
            tree.dependencies.len(),
            suggestions.len()
        );

        Ok(Analysis {
            root: root.to_path_buf(),
            ecosystems,
            files,
            tree,
            suggestions,
        })
    }

    /// Analyze, classify and apply. Nothing is written to disk.
    #[instrument(skip(self, vulnerabilities))]
    pub async fn remediate(
        &self,
        root: &Path,
        vulnerabilities: &[Vulnerability],
    ) -> Result<Remediation, FatalError> {
        let analysis = self.analyze(root, vulnerabilities).await?;
        if analysis.suggestions.is_empty() {
            return Err(FatalError::NoApplicableFixes(vulnerabilities.len()));
        }

        let runtimes = detect_runtimes(root);
        let ctx = SafetyContext::new(
            &self.config.safety,
            runtimes,
            &analysis.tree.dependencies,
            &analysis.suggestions,
        );
        let (safe, problematic) = partition(analysis.suggestions.clone(), &ctx);
        info!("{} safe, {} held for review", safe.len(), problematic.len());

        let change_set =
            ChangeApplier::new().apply(&analysis.files, &safe, problematic, vulnerabilities.len());

        Ok(Remediation {
            root: analysis.root,
            ecosystems: analysis.ecosystems,
            dependency_count: analysis.tree.dependencies.len(),
            degradations: analysis.tree.degradations,
            change_set,
        })
    }
}

/// Commit a remediation and open a change request for it.
///
/// Without edited files there is nothing to commit; `Ok(None)` tells the
/// caller to publish the manual-fix document instead.
pub async fn publish(
    provider: &dyn RepositoryProvider,
    remediation: &Remediation,
    base: &str,
    branch: &str,
) -> Result<Option<ChangeRequest>, ProviderError> {
    let change_set = &remediation.change_set;
    if change_set.files.is_empty() {
        return Ok(None);
    }
    let written = change_set.write(&remediation.root)?;
    let title = markdown::title(change_set);
    provider
        .commit_and_push(&remediation.root, branch, &title, &written)
        .await?;
    let request = provider
        .open_change_request(base, branch, &title, &markdown::render(remediation))
        .await?;
    info!("Opened change request {}", request.url);
    Ok(Some(request))
}
