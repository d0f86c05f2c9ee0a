//! Report renderers for remediation results.
//!
//! - [`terminal`]: colored tables with a summary box; respects `--verbose` / `--quiet`.
//! - [`markdown`]: change-request description, or a manual-fix guide when
//!   nothing could be edited.
//! - [`json`]: the full result plus computed outcome, for machines.

pub mod markdown;
pub mod terminal;

use serde::Serialize;

use crate::applier::Outcome;
use crate::engine::Remediation;

#[derive(Serialize)]
struct JsonReport<'a> {
    outcome: Outcome,
    success_rate: f64,
    fixed_vulnerabilities: Vec<&'a str>,
    #[serde(flatten)]
    remediation: &'a Remediation,
}

pub fn json(remediation: &Remediation) -> serde_json::Result<String> {
    let set = &remediation.change_set;
    serde_json::to_string_pretty(&JsonReport {
        outcome: set.outcome(),
        success_rate: set.success_rate(),
        fixed_vulnerabilities: set.fixed_vulnerabilities().into_iter().collect(),
        remediation,
    })
}
