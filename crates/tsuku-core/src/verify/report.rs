//! Per-artifact and per-run verification results.

use std::fmt;
use std::path::{Path, PathBuf};
use tsuku_schema::{ArtifactId, ArtifactKind, DependencyClass};

/// The four verification tiers, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Tier {
    Header,
    Dependencies,
    Load,
    Integrity,
}

impl Tier {
    pub const ALL: [Tier; 4] = [Self::Header, Self::Dependencies, Self::Load, Self::Integrity];

    /// 1-based tier number.
    pub fn id(self) -> u8 {
        match self {
            Self::Header => 1,
            Self::Dependencies => 2,
            Self::Load => 3,
            Self::Integrity => 4,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::Header => "header",
            Self::Dependencies => "dependencies",
            Self::Load => "dlopen",
            Self::Integrity => "integrity",
        }
    }
}

impl fmt::Display for Tier {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Tier {} ({})", self.id(), self.name())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Severity {
    Warning,
    Fatal,
}

/// Every kind of problem a tier can report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FindingKind {
    // Tier 1
    HeaderInvalid,
    ArchitectureMismatch,
    // Tier 2
    DependencyMissingManaged,
    AbiMismatch,
    DependencyUnknown,
    DependencyDrift,
    LegacyMetadata,
    // Tier 3
    LoadSymbolNotFound,
    LoadPermissionDenied,
    LoadTimeout,
    LoadCrash,
    LoadFailed,
    LoadTestUnavailable,
    // Tier 4
    IntegrityMismatch,
    IntegritySkipped,
    /// A verification task panicked.
    Internal,
}

impl FindingKind {
    /// Severity before any caller override.
    pub fn default_severity(self) -> Severity {
        match self {
            Self::DependencyUnknown
            | Self::DependencyDrift
            | Self::LegacyMetadata
            | Self::LoadTestUnavailable
            | Self::IntegritySkipped => Severity::Warning,
            _ => Severity::Fatal,
        }
    }

    pub fn label(self) -> &'static str {
        match self {
            Self::HeaderInvalid => "HeaderInvalid",
            Self::ArchitectureMismatch => "ArchitectureMismatch",
            Self::DependencyMissingManaged => "DependencyMissingManaged",
            Self::AbiMismatch => "ABIMismatch",
            Self::DependencyUnknown => "DependencyUnknown",
            Self::DependencyDrift => "DependencyDrift",
            Self::LegacyMetadata => "LegacyMetadata",
            Self::LoadSymbolNotFound => "LoadSymbolNotFound",
            Self::LoadPermissionDenied => "LoadPermissionDenied",
            Self::LoadTimeout => "LoadTimeout",
            Self::LoadCrash => "LoadCrash",
            Self::LoadFailed => "LoadFailed",
            Self::LoadTestUnavailable => "LoadTestUnavailable",
            Self::IntegrityMismatch => "IntegrityMismatch",
            Self::IntegritySkipped => "IntegritySkipped",
            Self::Internal => "Internal",
        }
    }
}

impl fmt::Display for FindingKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One diagnostic produced by a tier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Finding {
    pub kind: FindingKind,
    pub severity: Severity,
    /// User-facing diagnostic. May span several lines.
    pub message: String,
    /// File the finding is about, relative to the install directory when known.
    pub file: Option<PathBuf>,
    pub remediation: Option<String>,
}

impl Finding {
    pub fn new(kind: FindingKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            severity: kind.default_severity(),
            message: message.into(),
            file: None,
            remediation: None,
        }
    }

    pub fn with_file(mut self, file: impl AsRef<Path>) -> Self {
        self.file = Some(file.as_ref().to_path_buf());
        self
    }

    pub fn with_remediation(mut self, hint: impl Into<String>) -> Self {
        self.remediation = Some(hint.into());
        self
    }

    /// Report as a warning regardless of kind.
    pub fn downgraded(mut self) -> Self {
        self.severity = Severity::Warning;
        self
    }

    pub fn is_fatal(&self) -> bool {
        self.severity == Severity::Fatal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TierStatus {
    Passed,
    Warning,
    Fatal,
    /// The tier did not run (legacy metadata, `--skip-dlopen`).
    Skipped,
}

/// Outcome of one tier for one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TierResult {
    pub tier: Tier,
    pub status: TierStatus,
    pub findings: Vec<Finding>,
}

impl TierResult {
    /// Derive the status from the worst finding.
    pub fn from_findings(tier: Tier, findings: Vec<Finding>) -> Self {
        let status = match findings.iter().map(|f| f.severity).max() {
            Some(Severity::Fatal) => TierStatus::Fatal,
            Some(Severity::Warning) => TierStatus::Warning,
            None => TierStatus::Passed,
        };
        Self {
            tier,
            status,
            findings,
        }
    }

    pub fn skipped(tier: Tier) -> Self {
        Self {
            tier,
            status: TierStatus::Skipped,
            findings: Vec::new(),
        }
    }

    pub fn is_fatal(&self) -> bool {
        self.status == TierStatus::Fatal
    }
}

/// A classified dependency, derived at verify time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DependencyRecord {
    /// Declaring file, relative to the install directory
    pub file: PathBuf,
    /// Name as declared in the binary
    pub soname: String,
    pub class: DependencyClass,
    /// Absolute path of the providing file, for managed dependencies
    pub resolved: Option<PathBuf>,
    /// Providing artifact, for managed dependencies
    pub provider: Option<ArtifactId>,
}

/// Final per-artifact status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum VerificationStatus {
    Passed,
    PassedWithWarnings,
    FailedFatal,
}

impl fmt::Display for VerificationStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Passed => "passed",
            Self::PassedWithWarnings => "passed with warnings",
            Self::FailedFatal => "failed",
        })
    }
}

/// Everything verification found about one artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArtifactReport {
    pub id: ArtifactId,
    pub kind: ArtifactKind,
    /// Results in tier order. Tiers after a fatal one are absent.
    pub tiers: Vec<TierResult>,
    pub dependencies: Vec<DependencyRecord>,
    /// Findings not tied to a tier, such as a panicked task
    pub errors: Vec<Finding>,
    pub halted_at: Option<Tier>,
}

impl ArtifactReport {
    pub fn new(id: ArtifactId, kind: ArtifactKind) -> Self {
        Self {
            id,
            kind,
            tiers: Vec::new(),
            dependencies: Vec::new(),
            errors: Vec::new(),
            halted_at: None,
        }
    }

    /// Record a tier result. Returns `false` once the artifact has halted.
    pub fn record(&mut self, result: TierResult) -> bool {
        if result.is_fatal() && self.halted_at.is_none() {
            self.halted_at = Some(result.tier);
        }
        self.tiers.push(result);
        self.halted_at.is_none()
    }

    pub fn tier(&self, tier: Tier) -> Option<&TierResult> {
        self.tiers.iter().find(|t| t.tier == tier)
    }

    /// Every finding, tier findings first.
    pub fn findings(&self) -> impl Iterator<Item = &Finding> {
        self.tiers
            .iter()
            .flat_map(|t| t.findings.iter())
            .chain(self.errors.iter())
    }

    pub fn status(&self) -> VerificationStatus {
        let mut status = VerificationStatus::Passed;
        for f in self.findings() {
            if f.is_fatal() {
                return VerificationStatus::FailedFatal;
            }
            status = VerificationStatus::PassedWithWarnings;
        }
        status
    }
}

/// Overall result of a verify invocation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunOutcome {
    Passed,
    PassedWithWarnings,
    FailedFatal,
    Cancelled,
}

/// Reports for a whole closure, in closure order.
#[derive(Debug, Clone, Default)]
pub struct RunSummary {
    pub reports: Vec<ArtifactReport>,
    /// True when the run was interrupted before every artifact finished.
    pub cancelled: bool,
    /// Artifacts that were in flight or never started when cancelled.
    pub discarded: Vec<ArtifactId>,
}

impl RunSummary {
    pub fn outcome(&self) -> RunOutcome {
        let worst = self.reports.iter().map(ArtifactReport::status).max();
        match worst {
            Some(VerificationStatus::FailedFatal) => RunOutcome::FailedFatal,
            _ if self.cancelled => RunOutcome::Cancelled,
            Some(VerificationStatus::PassedWithWarnings) => RunOutcome::PassedWithWarnings,
            _ => RunOutcome::Passed,
        }
    }

    pub fn count(&self, status: VerificationStatus) -> usize {
        self.reports.iter().filter(|r| r.status() == status).count()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn report() -> ArtifactReport {
        ArtifactReport::new(ArtifactId::new("libfoo", "1.0.0"), ArtifactKind::Library)
    }

    #[test]
    fn clean_report_passes() {
        let mut r = report();
        for tier in Tier::ALL {
            assert!(r.record(TierResult::from_findings(tier, Vec::new())));
        }
        assert_eq!(r.status(), VerificationStatus::Passed);
        assert_eq!(r.halted_at, None);
    }

    #[test]
    fn warning_yields_passed_with_warnings() {
        let mut r = report();
        r.record(TierResult::from_findings(
            Tier::Dependencies,
            vec![Finding::new(FindingKind::DependencyUnknown, "x")],
        ));
        assert_eq!(r.status(), VerificationStatus::PassedWithWarnings);
    }

    #[test]
    fn fatal_halts_and_records_tier() {
        let mut r = report();
        assert!(r.record(TierResult::from_findings(Tier::Header, Vec::new())));
        let cont = r.record(TierResult::from_findings(
            Tier::Dependencies,
            vec![
                Finding::new(FindingKind::DependencyUnknown, "w"),
                Finding::new(FindingKind::AbiMismatch, "f"),
            ],
        ));
        assert!(!cont);
        assert_eq!(r.halted_at, Some(Tier::Dependencies));
        assert_eq!(r.status(), VerificationStatus::FailedFatal);
        assert_eq!(r.tier(Tier::Dependencies).unwrap().status, TierStatus::Fatal);
    }

    #[test]
    fn downgraded_mismatch_is_a_warning() {
        let f = Finding::new(FindingKind::IntegrityMismatch, "m").downgraded();
        let t = TierResult::from_findings(Tier::Integrity, vec![f]);
        assert_eq!(t.status, TierStatus::Warning);
    }

    #[test]
    fn run_outcome_precedence() {
        let mut failing = report();
        failing.errors.push(Finding::new(FindingKind::Internal, "panic"));

        let mut summary = RunSummary {
            reports: vec![report()],
            cancelled: false,
            discarded: Vec::new(),
        };
        assert_eq!(summary.outcome(), RunOutcome::Passed);

        summary.cancelled = true;
        assert_eq!(summary.outcome(), RunOutcome::Cancelled);

        summary.reports.push(failing);
        assert_eq!(summary.outcome(), RunOutcome::FailedFatal);
    }
}
