//! Reporter trait for dependency injection
//!
//! The verification pipeline reports progress through this trait so that it
//! is not coupled to a specific terminal UI.

use tsuku_schema::ArtifactId;

use crate::verify::report::{ArtifactReport, TierResult};

pub trait Reporter: Send + Sync {
    /// The closure has been expanded and verification is about to start.
    fn run_started(&self, artifacts: &[ArtifactId]);

    /// A worker picked up an artifact.
    fn artifact_started(&self, id: &ArtifactId);

    /// A tier finished for an artifact.
    fn tier_finished(&self, id: &ArtifactId, result: &TierResult);

    /// Every tier that will run for an artifact has run.
    fn artifact_finished(&self, report: &ArtifactReport);
}

impl<T: Reporter + ?Sized> Reporter for std::sync::Arc<T> {
    fn run_started(&self, artifacts: &[ArtifactId]) {
        (**self).run_started(artifacts)
    }
    fn artifact_started(&self, id: &ArtifactId) {
        (**self).artifact_started(id)
    }
    fn tier_finished(&self, id: &ArtifactId, result: &TierResult) {
        (**self).tier_finished(id, result)
    }
    fn artifact_finished(&self, report: &ArtifactReport) {
        (**self).artifact_finished(report)
    }
}

/// A no-op reporter for silent runs and tests.
#[derive(Clone, Copy)]
pub struct NullReporter;

impl Reporter for NullReporter {
    fn run_started(&self, _: &[ArtifactId]) {}
    fn artifact_started(&self, _: &ArtifactId) {}
    fn tier_finished(&self, _: &ArtifactId, _: &TierResult) {}
    fn artifact_finished(&self, _: &ArtifactReport) {}
}
