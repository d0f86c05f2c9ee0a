//! `vulnfixr` command line.
//!
//! # Flow
//! 1. Parse CLI arguments ([`cli`]).
//! 2. Load config ([`vulnfixr::config::load_config`]) and advisories.
//! 3. Check out `--repo` through the clone cache, or use the local path.
//! 4. Run the remediation engine on the project.
//! 5. Render the requested report; write edited build files with `--write`,
//!    or commit, push and open a change request with `--commit`.
//! 6. Exit `0` when every vulnerability was fixed, `1` otherwise.

mod cli;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tracing_subscriber::EnvFilter;

use cli::{Cli, ReportFormat};
use vulnfixr::cache::CloneCache;
use vulnfixr::config::load_config;
use vulnfixr::error::ProviderError;
use vulnfixr::provider::{GitCliProvider, JsonFileSource};
use vulnfixr::report;
use vulnfixr::resolver::{CommandRunner, TokioCommandRunner};
use vulnfixr::{publish, RemediationEngine};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "info" } else { "warn" };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    // Resolve project path
    let local = cli
        .path
        .canonicalize()
        .unwrap_or_else(|_| cli.path.clone());

    let mut config = load_config(&local, cli.config.as_deref())?;
    if cli.static_only {
        config.resolver.static_only = true;
    }

    let runner: Arc<dyn CommandRunner> = Arc::new(TokioCommandRunner);
    let workspace = dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("vulnfixr")
        .join("checkouts");
    let provider = Arc::new(GitCliProvider::new(runner.clone(), &workspace));

    let path = match &cli.repo {
        Some(url) => {
            let cache = CloneCache::new(provider.clone(), &config.cache);
            cache
                .checkout(url)
                .await
                .with_context(|| format!("cloning {}", url))?
        }
        None => local,
    };

    let source = JsonFileSource::load(&cli.advisories)
        .with_context(|| format!("loading advisories from {}", cli.advisories.display()))?;
    let vulnerabilities = source.records().to_vec();

    let spinner = if !cli.quiet {
        let pb = ProgressBar::new_spinner();
        pb.set_style(ProgressStyle::default_spinner().template("{spinner:.green} {msg}")?);
        pb.set_message(format!(
            "Checking {} advisories against {}",
            vulnerabilities.len(),
            path.display()
        ));
        pb.enable_steady_tick(Duration::from_millis(100));
        Some(pb)
    } else {
        None
    };

    let engine = RemediationEngine::new(config, runner);
    let result = engine.remediate(&path, &vulnerabilities).await;

    if let Some(pb) = spinner {
        pb.finish_and_clear();
    }

    let remediation = match result {
        Ok(remediation) => remediation,
        Err(err) => {
            eprintln!("{} {}", "error:".red().bold(), err);
            std::process::exit(1);
        }
    };

    let rendered = match cli.report {
        ReportFormat::Terminal => {
            report::terminal::render(&remediation, cli.verbose, cli.quiet)?;
            None
        }
        ReportFormat::Json => Some(report::json(&remediation)?),
        ReportFormat::Markdown => Some(report::markdown::render(&remediation)),
    };
    if let Some(text) = rendered {
        match &cli.output {
            Some(out) => std::fs::write(out, text)
                .with_context(|| format!("writing report to {}", out.display()))?,
            None => println!("{}", text),
        }
    }

    if let Some(branch) = &cli.commit {
        match publish(provider.as_ref(), &remediation, &cli.base, branch).await {
            Ok(Some(request)) => {
                if !cli.quiet {
                    println!(" {} Change request: {}", "→".cyan(), request.url);
                }
            }
            Ok(None) => eprintln!(" No build file changed; nothing to commit"),
            Err(ProviderError::Unsupported { operation }) => {
                eprintln!(
                    " {} Pushed {}; {} is not available, open it from the markdown report",
                    "[NOTE]".cyan(),
                    branch,
                    operation
                );
            }
            Err(err) => return Err(err).context("publishing fixes"),
        }
    } else if cli.write {
        let written = remediation
            .change_set
            .write(&remediation.root)
            .context("writing edited build files")?;
        if !cli.quiet {
            for file in &written {
                eprintln!("  {} {}", "→".cyan(), file.display());
            }
        }
    }

    // Exit code: 1 if anything is left for a human
    if remediation.change_set.needs_manual_work() {
        std::process::exit(1);
    }

    Ok(())
}
