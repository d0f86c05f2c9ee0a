//! `vulnfixr`: find vulnerable dependencies in Gradle, Maven and npm builds
//! and rewrite the build files to safe versions.
//!
//! # Flow
//! 1. Discover build files ([`detector::discover_build_files`]).
//! 2. Parse each one with its ecosystem parser ([`parser`]).
//! 3. Build the dependency tree, escalating to the build tools when allowed ([`resolver`]).
//! 4. Match advisories against the tree ([`matcher`]).
//! 5. Classify each suggested fix as safe or problematic ([`safety`]).
//! 6. Rewrite build files, validating every edit ([`applier`]).
//! 7. Report, and optionally commit through a provider ([`engine::publish`], [`report`]).

pub mod applier;
pub mod cache;
pub mod config;
pub mod detector;
pub mod edit;
pub mod engine;
pub mod error;
pub mod matcher;
pub mod models;
pub mod parser;
pub mod provider;
pub mod report;
pub mod resolver;
pub mod safety;
pub mod version;

pub use engine::{publish, Remediation, RemediationEngine};
pub use error::FatalError;
