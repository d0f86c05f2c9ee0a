//! Error taxonomy for the fix engine.
//!
//! Per-file and per-ecosystem errors are recovered where they occur:
//! - [`ParseError`]: the file is skipped, siblings keep going
//! - [`ResolutionError`]: the ecosystem falls back to statically parsed data
//! - [`ValidationError`]: the edited file is excluded from the change-set
//!
//! Only [`FatalError`] reaches the caller as a failed run.

use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// A build file could not be read into the dependency model.
#[derive(Error, Debug)]
pub enum ParseError {
    #[error("invalid XML in {path}: {message}")]
    InvalidXml { path: PathBuf, message: String },

    #[error("invalid JSON in {path}: {message}")]
    InvalidJson { path: PathBuf, message: String },

    #[error("unsupported build file: {0}")]
    Unsupported(PathBuf),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// The ecosystem's own resolution tooling did not produce a usable graph.
#[derive(Error, Debug)]
pub enum ResolutionError {
    #[error("failed to start `{command}`: {source}")]
    Spawn {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("reading output of `{command}`: {source}")]
    Output {
        command: String,
        #[source]
        source: std::io::Error,
    },

    #[error("`{command}` timed out after {}s", .timeout.as_secs())]
    Timeout { command: String, timeout: Duration },

    #[error("`{command}` produced more than {limit} bytes of output")]
    OutputTooLarge { command: String, limit: usize },

    #[error("`{command}` exited with status {status}: {stderr}")]
    ToolFailed {
        command: String,
        status: i32,
        stderr: String,
    },

    #[error("{ecosystem} resolution returned no dependencies although {manifest} exists")]
    EmptyResolution { ecosystem: String, manifest: PathBuf },
}

/// A version string that could not be read as a semantic version.
///
/// Never escapes the matcher: callers treat the dependency as affected.
#[derive(Error, Debug)]
#[error("cannot interpret version `{0}`")]
pub struct MatchError(pub String);

/// Edited content is not structurally sound and must not be written.
#[derive(Error, Debug)]
pub enum ValidationError {
    #[error("{0}")]
    Malformed(String),

    #[error("required root element `{0}` is missing")]
    MissingRoot(String),

    #[error("edits overlap at byte {0}")]
    OverlappingEdits(usize),

    #[error("edited file no longer parses: {0}")]
    Reparse(String),
}

/// The run produced nothing usable.
#[derive(Error, Debug)]
pub enum FatalError {
    #[error("no supported build files found under {0}")]
    NoBuildFiles(PathBuf),

    #[error("no dependencies could be read from any build file")]
    NoDependencies,

    #[error("none of the {0} vulnerabilities matched a dependency of this repository")]
    NoApplicableFixes(usize),

    #[error("analysis did not finish within {}s", .0.as_secs())]
    Timeout(Duration),

    #[error(transparent)]
    Resolution(#[from] ResolutionError),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Failures of the repository-provider or vulnerability-source capability.
#[derive(Error, Debug)]
pub enum ProviderError {
    #[error("{operation} is not supported by this provider")]
    Unsupported { operation: &'static str },

    #[error("`{command}` failed: {message}")]
    Command { command: String, message: String },

    #[error("vulnerability record `{0}` not found")]
    NotFound(String),

    #[error("invalid vulnerability data: {0}")]
    InvalidData(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
