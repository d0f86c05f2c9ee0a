use anyhow::Result;
use colored::*;
use comfy_table::presets::UTF8_FULL;
use comfy_table::{Attribute, Cell, CellAlignment, Color, ContentArrangement, Table};

use crate::applier::Outcome;
use crate::engine::Remediation;
use crate::models::{FixSuggestion, UpdateType};

/// Render a colored terminal report.
pub fn render(remediation: &Remediation, verbose: bool, quiet: bool) -> Result<()> {
    let set = &remediation.change_set;
    let fixed = set.fixed_vulnerabilities().len();
    let rate = set.success_rate() * 100.0;

    if quiet {
        println!(
            "Fixed: {}/{}  Applied: {}  Review: {}  Failed: {}",
            fixed,
            set.total_vulnerabilities,
            set.applied.len().to_string().green(),
            set.problematic.len().to_string().yellow(),
            set.failed.len().to_string().red(),
        );
        return Ok(());
    }

    println!("\n {} v{}", "vulnfixr".bold(), env!("CARGO_PKG_VERSION"));
    println!(" Repository: {}\n", remediation.root.display());

    let ecosystems: Vec<String> = remediation.ecosystems.iter().map(|e| e.to_string()).collect();
    let outcome = match set.outcome() {
        Outcome::FullSuccess => set.outcome().to_string().green(),
        Outcome::PartialSuccess => set.outcome().to_string().yellow(),
        Outcome::NoAutomaticFixes => set.outcome().to_string().red(),
    };

    println!(" ┌────────────────────────────────────────────────────┐");
    println!(" │  {:<48} │", "SUMMARY".bold());
    println!(" │  {:<48} │", format!("Ecosystems         : {}", ecosystems.join(", ")));
    println!(
        " │  {:<48} │",
        format!("Dependencies       : {}", remediation.dependency_count)
    );
    println!(
        " │  {:<48} │",
        format!("Vulnerabilities    : {} of {} fixed ({:.0}%)", fixed, set.total_vulnerabilities, rate)
    );
    println!(
        " │  {:<48} │",
        format!("{}  Applied         : {:>4}", "✓".green(), set.applied.len())
    );
    println!(
        " │  {:<48} │",
        format!("{}  Needs review    : {:>4}", "⚠".yellow(), set.problematic.len())
    );
    println!(
        " │  {:<48} │",
        format!("{}  Failed          : {:>4}", "✗".red(), set.failed.len())
    );
    println!(" │  {:<48} │", format!("Outcome            : {}", outcome));
    println!(" └────────────────────────────────────────────────────┘\n");

    if !set.applied.is_empty() {
        println!(" {} Fixes applied:\n", "[FIXED]".green().bold());
        let rows: Vec<(&FixSuggestion, String)> = set
            .applied
            .iter()
            .map(|a| (&a.suggestion, a.method.to_string()))
            .collect();
        render_table(&rows, "Method");
        println!();
    }

    if !set.problematic.is_empty() {
        println!(" {} Fixes held for manual review:\n", "[REVIEW]".yellow().bold());
        let rows: Vec<(&FixSuggestion, String)> = set
            .problematic
            .iter()
            .map(|p| (&p.suggestion, p.reason.clone()))
            .collect();
        render_table(&rows, "Reason");
        println!();
    }

    if !set.failed.is_empty() {
        println!(" {} Fixes that could not be applied:\n", "[FAILED]".red().bold());
        let rows: Vec<(&FixSuggestion, String)> = set
            .failed
            .iter()
            .map(|f| (&f.suggestion, f.reason.clone()))
            .collect();
        render_table(&rows, "Reason");
        println!();
    }

    for excluded in &set.excluded {
        println!(" {} {}: {}", "[SKIPPED]".red(), excluded.path.display(), excluded.reason);
    }
    for degradation in &remediation.degradations {
        println!(
            " {} {} resolved from build files only: {}",
            "[NOTE]".cyan(),
            degradation.ecosystem,
            degradation.reason
        );
    }

    // Verbose: list every edited file
    if verbose && !set.files.is_empty() {
        println!("\n {} Files changed:", "[FILES]".bold());
        for change in &set.files {
            let shown = change
                .path
                .strip_prefix(&remediation.root)
                .unwrap_or(&change.path);
            println!("   {}", shown.display());
        }
    }
    println!();

    Ok(())
}

fn render_table(rows: &[(&FixSuggestion, String)], detail_header: &str) {
    let mut table = Table::new();
    table
        .load_preset(UTF8_FULL)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec![
            Cell::new("Dependency").add_attribute(Attribute::Bold),
            Cell::new("Ecosystem").add_attribute(Attribute::Bold),
            Cell::new("Current").add_attribute(Attribute::Bold),
            Cell::new("Target").add_attribute(Attribute::Bold),
            Cell::new("Update").add_attribute(Attribute::Bold),
            Cell::new("Vulnerabilities").add_attribute(Attribute::Bold),
            Cell::new(detail_header).add_attribute(Attribute::Bold),
        ]);

    for (fix, detail) in rows {
        let update_color = match fix.update_type {
            UpdateType::Patch => Color::Green,
            UpdateType::Minor => Color::Yellow,
            UpdateType::Major => Color::Red,
            UpdateType::Alternative => Color::Magenta,
        };

        let name = if fix.is_transitive {
            format!("{} (transitive)", fix.dependency_name)
        } else {
            fix.dependency_name.clone()
        };

        table.add_row(vec![
            Cell::new(name),
            Cell::new(fix.ecosystem.to_string()),
            Cell::new(&fix.current_version),
            Cell::new(&fix.suggested_version),
            Cell::new(fix.update_type.to_string())
                .fg(update_color)
                .set_alignment(CellAlignment::Center),
            Cell::new(fix.vulnerability_ids.join(", ")),
            Cell::new(detail),
        ]);
    }

    println!("{}", table);
}
