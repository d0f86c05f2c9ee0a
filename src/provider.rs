//! Repository-provider and vulnerability-source capabilities.
//!
//! The engine never talks to a hosting API or a ticket tracker directly;
//! it goes through these traits. [`GitCliProvider`] covers what plain `git`
//! can do and [`JsonFileSource`] serves advisories from a local file.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::error::ProviderError;
use crate::models::Vulnerability;
use crate::resolver::command::{require_success, CommandRunner, CommandSpec};

/// A pull/merge request created by the hosting service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeRequest {
    pub id: String,
    pub url: String,
}

#[async_trait]
pub trait RepositoryProvider: Send + Sync {
    /// Clone `url` into a fresh local directory.
    async fn clone_repository(&self, url: &str) -> Result<PathBuf, ProviderError>;

    /// Commit exactly `files` (relative to `path`) on `branch` and push it.
    async fn commit_and_push(
        &self,
        path: &Path,
        branch: &str,
        message: &str,
        files: &[PathBuf],
    ) -> Result<(), ProviderError>;

    async fn open_change_request(
        &self,
        base: &str,
        head: &str,
        title: &str,
        body: &str,
    ) -> Result<ChangeRequest, ProviderError>;
}

#[async_trait]
pub trait VulnerabilitySource: Send + Sync {
    /// The vulnerability record behind one ticket.
    async fn fetch(&self, ticket: &str) -> Result<Vulnerability, ProviderError>;
}

/// [`RepositoryProvider`] on top of the `git` command line.
pub struct GitCliProvider {
    runner: Arc<dyn CommandRunner>,
    workspace: PathBuf,
    timeout: Duration,
}

impl GitCliProvider {
    pub fn new(runner: Arc<dyn CommandRunner>, workspace: &Path) -> Self {
        Self {
            runner,
            workspace: workspace.to_path_buf(),
            timeout: Duration::from_secs(600),
        }
    }

    async fn git<I, S>(&self, cwd: &Path, args: I) -> Result<String, ProviderError>
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        let spec = CommandSpec::new("git", cwd)
            .args(args)
            .limits(self.timeout, 4 * 1024 * 1024);
        let command = spec.display();
        let output = self
            .runner
            .run(&spec)
            .await
            .and_then(|o| require_success(&spec, o))
            .map_err(|e| ProviderError::Command {
                command,
                message: e.to_string(),
            })?;
        Ok(output.stdout)
    }
}

#[async_trait]
impl RepositoryProvider for GitCliProvider {
    async fn clone_repository(&self, url: &str) -> Result<PathBuf, ProviderError> {
        std::fs::create_dir_all(&self.workspace)?;
        let dest = self.workspace.join(checkout_dir_name(url));
        if dest.exists() {
            debug!("Removing stale checkout {}", dest.display());
            std::fs::remove_dir_all(&dest)?;
        }
        let dest_arg = dest.to_string_lossy().into_owned();
        self.git(&self.workspace, ["clone", "--depth", "1", url, dest_arg.as_str()])
            .await?;
        info!("Cloned {} into {}", url, dest.display());
        Ok(dest)
    }

    async fn commit_and_push(
        &self,
        path: &Path,
        branch: &str,
        message: &str,
        files: &[PathBuf],
    ) -> Result<(), ProviderError> {
        if files.is_empty() {
            return Err(ProviderError::Command {
                command: "git add".to_string(),
                message: "nothing to stage".to_string(),
            });
        }
        self.git(path, ["checkout", "-B", branch]).await?;

        let mut add = vec!["add".to_string(), "--".to_string()];
        add.extend(files.iter().map(|f| f.to_string_lossy().into_owned()));
        self.git(path, add).await?;

        self.git(path, ["commit", "-m", message]).await?;
        self.git(path, ["push", "--set-upstream", "origin", branch]).await?;
        Ok(())
    }

    async fn open_change_request(
        &self,
        _base: &str,
        _head: &str,
        _title: &str,
        _body: &str,
    ) -> Result<ChangeRequest, ProviderError> {
        Err(ProviderError::Unsupported {
            operation: "opening a change request",
        })
    }
}

/// Directory name for a checkout of `url`: `org-repo` from
/// `https://host/org/repo.git`.
fn checkout_dir_name(url: &str) -> String {
    let identity = crate::cache::repository_identity(url);
    let mut parts: Vec<&str> = identity.rsplit('/').take(2).collect();
    parts.reverse();
    let name: String = parts
        .join("-")
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' { c } else { '_' })
        .collect();
    if name.is_empty() {
        "repository".to_string()
    } else {
        name
    }
}

/// Advisories read from a JSON file: an array of records or one record.
#[derive(Debug, Clone, Default)]
pub struct JsonFileSource {
    records: Vec<Vulnerability>,
}

impl JsonFileSource {
    pub fn load(path: &Path) -> Result<Self, ProviderError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_json(&content)
    }

    pub fn from_json(content: &str) -> Result<Self, ProviderError> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Records {
            Many(Vec<Vulnerability>),
            One(Box<Vulnerability>),
        }

        let records = match serde_json::from_str::<Records>(content)
            .map_err(|e| ProviderError::InvalidData(e.to_string()))?
        {
            Records::Many(records) => records,
            Records::One(record) => vec![*record],
        };
        Ok(Self { records })
    }

    pub fn records(&self) -> &[Vulnerability] {
        &self.records
    }
}

#[async_trait]
impl VulnerabilitySource for JsonFileSource {
    async fn fetch(&self, ticket: &str) -> Result<Vulnerability, ProviderError> {
        self.records
            .iter()
            .find(|v| {
                v.id.eq_ignore_ascii_case(ticket)
                    || v.cve_ids.iter().any(|c| c.eq_ignore_ascii_case(ticket))
            })
            .cloned()
            .ok_or_else(|| ProviderError::NotFound(ticket.to_string()))
    }
}
