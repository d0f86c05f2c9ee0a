use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "vulnfixr",
    about = "Match advisories against project dependencies and apply safe version fixes",
    version
)]
pub struct Cli {
    /// Project path to fix
    #[arg(default_value = ".")]
    pub path: PathBuf,

    /// Advisory file: a JSON array of vulnerability records, or a single record
    #[arg(long, value_name = "FILE")]
    pub advisories: PathBuf,

    /// Config file [default: ./.vulnfixr/config.toml, fallback ~/.config/vulnfixr/config.toml]
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Report format
    #[arg(long, default_value = "terminal", value_name = "FORMAT")]
    pub report: ReportFormat,

    /// Write the report to a file instead of stdout (json and markdown only)
    #[arg(long, value_name = "FILE")]
    pub output: Option<PathBuf>,

    /// Write the edited build files back to disk
    #[arg(long)]
    pub write: bool,

    /// Clone this repository (https or ssh URL) and fix it instead of PATH
    #[arg(long, value_name = "URL")]
    pub repo: Option<String>,

    /// Commit the edited build files on BRANCH, push it and open a change request
    #[arg(long, value_name = "BRANCH")]
    pub commit: Option<String>,

    /// Base branch of the change request
    #[arg(long, default_value = "main")]
    pub base: String,

    /// Never run Gradle or Maven; use build files and lock files only
    #[arg(long)]
    pub static_only: bool,

    /// Show info logs and every edited file
    #[arg(short, long)]
    pub verbose: bool,

    /// Only print summary line
    #[arg(short, long)]
    pub quiet: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum ReportFormat {
    Terminal,
    Json,
    Markdown,
}
