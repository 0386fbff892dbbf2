//! Post-install verification.
//!
//! Each artifact runs through four tiers in order, stopping at the first
//! fatal result:
//!
//! 1. [`header`]: the file is a well-formed binary for the target platform.
//! 2. [`deps`]: every declared dependency is managed, system, or flagged.
//! 3. [`dltest`]: the files load in an isolated helper process.
//! 4. [`integrity`]: contents still match the install-time checksums.
//!
//! [`Verifier`] expands the requested artifacts into their dependency
//! closure and runs the tiers with bounded parallelism.

pub mod deps;
pub mod dltest;
pub mod header;
pub mod integrity;
pub mod orchestrator;
pub mod report;
pub mod rpath;

use std::path::PathBuf;
use tsuku_schema::LibraryMetadata;

use header::BinaryInfo;

pub use orchestrator::{Verifier, VerifyError};
pub use report::{ArtifactReport, Finding, FindingKind, RunOutcome, RunSummary, Severity, Tier};

/// A recorded file that passed Tier 1.
#[derive(Debug, Clone)]
pub struct InspectedFile {
    /// Receipt entry, with the path relative to the install directory
    pub meta: LibraryMetadata,
    /// Absolute path on disk
    pub path: PathBuf,
    pub info: BinaryInfo,
}
