//! Safe/problematic partition of fix suggestions.
//!
//! A fix is applied unattended only when none of these hold:
//! - it is a downgrade, or has no concrete target
//! - the library is on the manual-migration list
//! - it moves one member of a coupled family away from the others
//! - it is a major bump not covered by a satisfied runtime gate
//!
//! A satisfied runtime gate is the only way a major bump goes through.
//!
//! The rule tables live in [`SafetyConfig`].

use std::collections::HashMap;

use serde::Serialize;

use crate::config::{pattern_matches, FamilyRule, RuntimeGate, SafetyConfig};
use crate::models::{Dependency, FixSuggestion, SafetyVerdict, UpdateType};
use crate::version::{is_concrete, is_downgrade, major_of};

pub mod runtime;

pub use runtime::{detect_runtimes, Runtime, RuntimeLevels};

/// What the classifier knows about the repository.
pub struct SafetyContext<'a> {
    pub config: &'a SafetyConfig,
    pub runtimes: RuntimeLevels,
    pub tree: &'a [Dependency],
    /// Target version of every suggestion in this run, by lowercased name.
    planned: HashMap<String, String>,
}

impl<'a> SafetyContext<'a> {
    pub fn new(
        config: &'a SafetyConfig,
        runtimes: RuntimeLevels,
        tree: &'a [Dependency],
        suggestions: &[FixSuggestion],
    ) -> Self {
        let planned = suggestions
            .iter()
            .map(|s| (s.dependency_name.to_lowercase(), s.suggested_version.clone()))
            .collect();
        Self {
            config,
            runtimes,
            tree,
            planned,
        }
    }

    /// Major version `dep` will have once this run's fixes are applied.
    fn major_after_fixes(&self, dep: &Dependency) -> Option<u64> {
        let version = self
            .planned
            .get(&dep.name.to_lowercase())
            .filter(|v| is_concrete(v))
            .unwrap_or(&dep.version);
        major_of(version)
    }
}

pub fn classify(fix: &FixSuggestion, ctx: &SafetyContext<'_>) -> SafetyVerdict {
    let name = fix.dependency_name.as_str();
    let (current, target) = (fix.current_version.as_str(), fix.suggested_version.as_str());

    if !is_concrete(target) {
        return SafetyVerdict::Problematic(format!(
            "no fixed version is known; pick a release of {} manually",
            name
        ));
    }
    if is_downgrade(current, target) {
        return SafetyVerdict::Problematic(format!(
            "{} would be downgraded from {} to {}",
            name, current, target
        ));
    }

    let is_major = fix.update_type >= UpdateType::Major;

    if let Some(rule) = ctx
        .config
        .manual_migration
        .iter()
        .find(|r| pattern_matches(&r.pattern, name) && (!r.major_only || is_major))
    {
        return SafetyVerdict::Problematic(format!("manual migration required: {}", rule.reason));
    }

    if let Some(family) = ctx
        .config
        .families
        .iter()
        .find(|f| f.patterns.iter().any(|p| pattern_matches(p, name)))
    {
        if let Some(reason) = family_violation(family, fix, ctx) {
            return SafetyVerdict::Problematic(reason);
        }
    }

    if !is_major {
        return SafetyVerdict::Safe;
    }

    let target_major = major_of(target).unwrap_or(0);
    let current_major = major_of(current).unwrap_or(0);
    let gate = ctx.config.runtime_gates.iter().find(|g| {
        pattern_matches(&g.pattern, name)
            && target_major >= g.from_major
            && current_major < g.from_major
    });
    match gate {
        Some(gate) => runtime_verdict(gate, name, target_major, ctx),
        None => SafetyVerdict::Problematic(format!(
            "major update of {} from {} to {} needs review",
            name, current, target
        )),
    }
}

fn runtime_verdict(gate: &RuntimeGate, name: &str, target_major: u64, ctx: &SafetyContext<'_>) -> SafetyVerdict {
    match ctx.runtimes.get(gate.runtime) {
        Some(level) if level >= gate.minimum => SafetyVerdict::Safe,
        Some(level) => SafetyVerdict::Problematic(format!(
            "{} {} requires {} {}, repository targets {} {}",
            name, target_major, gate.runtime, gate.minimum, gate.runtime, level
        )),
        None => SafetyVerdict::Problematic(format!(
            "{} {} requires {} {}, no {} version found in the repository",
            name, target_major, gate.runtime, gate.minimum, gate.runtime
        )),
    }
}

/// Members of a family share one major version. A fix that jumps more than
/// one major, or leaves another member of the tree behind, breaks that.
fn family_violation(family: &FamilyRule, fix: &FixSuggestion, ctx: &SafetyContext<'_>) -> Option<String> {
    let target_major = major_of(&fix.suggested_version)?;
    let current_major = major_of(&fix.current_version)?;
    if target_major == current_major {
        return None;
    }
    if target_major > current_major + 1 {
        return Some(format!(
            "{} family: {} jumps from major {} to {}",
            family.name, fix.dependency_name, current_major, target_major
        ));
    }

    let behind: Vec<&str> = ctx
        .tree
        .iter()
        .filter(|d| d.ecosystem.coordinate_family() == fix.ecosystem.coordinate_family())
        .filter(|d| !d.name.eq_ignore_ascii_case(&fix.dependency_name))
        .filter(|d| family.patterns.iter().any(|p| pattern_matches(p, &d.name)))
        .filter(|d| ctx.major_after_fixes(d).is_some_and(|m| m != target_major))
        .map(|d| d.name.as_str())
        .collect();
    if behind.is_empty() {
        None
    } else {
        Some(format!(
            "{} family members must move together; {} would stay on another major",
            family.name,
            behind.join(", ")
        ))
    }
}

/// A fix held back for manual review.
#[derive(Debug, Clone, Serialize)]
pub struct ProblematicFix {
    pub suggestion: FixSuggestion,
    pub reason: String,
}

/// Split suggestions into those applied unattended and those reported.
pub fn partition(
    suggestions: Vec<FixSuggestion>,
    ctx: &SafetyContext<'_>,
) -> (Vec<FixSuggestion>, Vec<ProblematicFix>) {
    let mut safe = Vec::new();
    let mut problematic = Vec::new();
    for suggestion in suggestions {
        match classify(&suggestion, ctx) {
            SafetyVerdict::Safe => safe.push(suggestion),
            SafetyVerdict::Problematic(reason) => {
                tracing::info!("{} held back: {}", suggestion.dependency_name, reason);
                problematic.push(ProblematicFix { suggestion, reason });
            }
        }
    }
    (safe, problematic)
}
