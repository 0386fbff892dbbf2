//! Text rendering of verification results.
//!
//! Reports are rendered after the run, in closure order, so output does not
//! depend on worker scheduling.

use comfy_table::{ContentArrangement, Table, presets};
use std::io::{self, Write};
use tsuku_core::verify::report::{
    ArtifactReport, Finding, RunSummary, Tier, TierStatus, VerificationStatus,
};
use tsuku_schema::Sha256Hash;

use super::Theme;

const DIGEST_PREFIXES: [&str; 2] = ["Expected: ", "Got: "];

#[derive(Debug, Clone)]
pub struct Renderer {
    pub verbose: bool,
    pub theme: Theme,
}

impl Renderer {
    pub fn new(verbose: bool, theme: Theme) -> Self {
        Self { verbose, theme }
    }

    /// Render every report followed by the run summary line.
    pub fn summary(&self, out: &mut impl Write, summary: &RunSummary) -> io::Result<()> {
        for report in &summary.reports {
            self.artifact(out, report)?;
        }

        let total = summary.reports.len() + summary.discarded.len();
        writeln!(
            out,
            "{total} artifact{}: {} passed, {} with warnings, {} failed",
            if total == 1 { "" } else { "s" },
            summary.count(VerificationStatus::Passed),
            summary.count(VerificationStatus::PassedWithWarnings),
            summary.count(VerificationStatus::FailedFatal),
        )?;

        if summary.cancelled {
            let names: Vec<String> = summary.discarded.iter().map(ToString::to_string).collect();
            let line = if names.is_empty() {
                "Cancelled.".to_string()
            } else {
                format!("Cancelled, not verified: {}", names.join(", "))
            };
            writeln!(out, "{}", self.theme.paint(&line, self.theme.warning))?;
        }
        Ok(())
    }

    pub fn artifact(&self, out: &mut impl Write, report: &ArtifactReport) -> io::Result<()> {
        let status = report.status();
        let label = match (status, report.halted_at) {
            (VerificationStatus::FailedFatal, Some(tier)) => format!("failed at {tier}"),
            (s, _) => s.to_string(),
        };
        writeln!(
            out,
            "{} {}",
            self.theme.paint(&report.id.to_string(), self.theme.artifact),
            self.theme.paint(&label, self.theme.status_color(status)),
        )?;

        if self.verbose {
            for tier in Tier::ALL {
                let marker = report.tier(tier).map_or_else(
                    || self.theme.paint("-", self.theme.secondary),
                    |t| self.theme.tier_marker(t.status),
                );
                writeln!(out, "  {:<26} {marker}", tier.to_string())?;
            }
        }

        for finding in report.findings() {
            self.finding(out, finding)?;
        }

        if self.verbose && !report.dependencies.is_empty() {
            writeln!(out, "{}", indent(&dependency_table(report), "  "))?;
        }
        Ok(())
    }

    fn finding(&self, out: &mut impl Write, finding: &Finding) -> io::Result<()> {
        let color = if finding.is_fatal() {
            self.theme.error
        } else {
            self.theme.warning
        };
        for (i, line) in finding.message.lines().enumerate() {
            let line = if self.verbose {
                line.to_string()
            } else {
                shorten_digest(line)
            };
            if i == 0 {
                writeln!(out, "  {}", self.theme.paint(&line, color))?;
            } else {
                writeln!(out, "  {line}")?;
            }
        }
        if let Some(hint) = &finding.remediation {
            writeln!(out, "  {} {hint}", self.theme.paint("hint:", self.theme.secondary))?;
        }
        Ok(())
    }
}

fn dependency_table(report: &ArtifactReport) -> String {
    let mut table = Table::new();
    table
        .load_preset(presets::UTF8_FULL_CONDENSED)
        .set_content_arrangement(ContentArrangement::Dynamic)
        .set_header(vec!["File", "Dependency", "Class", "Provider", "Resolved"]);
    for dep in &report.dependencies {
        table.add_row(vec![
            dep.file.display().to_string(),
            dep.soname.clone(),
            dep.class.to_string(),
            dep.provider.as_ref().map(ToString::to_string).unwrap_or_default(),
            dep.resolved
                .as_ref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        ]);
    }
    table.to_string()
}

/// `Expected: <hex>` / `Got: <hex>` lines keep only a digest prefix.
fn shorten_digest(line: &str) -> String {
    DIGEST_PREFIXES
        .iter()
        .find_map(|prefix| {
            let hex = line.strip_prefix(prefix)?;
            Some(format!("{prefix}{}", Sha256Hash::from(hex).short()))
        })
        .unwrap_or_else(|| line.to_string())
}

fn indent(text: &str, pad: &str) -> String {
    text.lines()
        .map(|l| format!("{pad}{l}"))
        .collect::<Vec<_>>()
        .join("\n")
}

/// Tier status in words, for the progress reporter.
pub fn tier_word(status: TierStatus) -> &'static str {
    match status {
        TierStatus::Passed => "passed",
        TierStatus::Warning => "passed with warnings",
        TierStatus::Fatal => "failed",
        TierStatus::Skipped => "skipped",
    }
}
