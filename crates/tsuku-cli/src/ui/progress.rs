//! Live progress on stderr while workers run.

use tsuku_core::Reporter;
use tsuku_core::verify::report::{ArtifactReport, TierResult};
use tsuku_schema::ArtifactId;

use super::Theme;
use super::render::tier_word;

/// Prints one line per finished artifact, and per tier when verbose.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    verbose: bool,
    theme: Theme,
}

impl ProgressReporter {
    pub fn new(verbose: bool, theme: Theme) -> Self {
        Self { verbose, theme }
    }
}

impl Reporter for ProgressReporter {
    fn run_started(&self, artifacts: &[ArtifactId]) {
        let names: Vec<String> = artifacts.iter().map(ToString::to_string).collect();
        eprintln!(
            "{}",
            self.theme
                .paint(&format!("Verifying {}", names.join(", ")), self.theme.secondary)
        );
    }

    fn artifact_started(&self, id: &ArtifactId) {
        tracing::debug!(artifact = %id, "verifying");
    }

    fn tier_finished(&self, id: &ArtifactId, result: &TierResult) {
        if self.verbose {
            eprintln!("  {id}: {} {}", result.tier, tier_word(result.status));
        }
    }

    fn artifact_finished(&self, report: &ArtifactReport) {
        let status = report.status();
        eprintln!(
            "  {} {}",
            report.id,
            self.theme.paint(&status.to_string(), self.theme.status_color(status))
        );
    }
}
