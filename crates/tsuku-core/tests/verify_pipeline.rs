//! End-to-end runs of the verification pipeline against synthetic installs.

use async_trait::async_trait;
use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tsuku_core::fixtures::{ElfBuilder, FixtureFile, InstallFixture};
use tsuku_core::verify::dltest::{LoadTestError, LoadTester, LoadVerdict};
use tsuku_core::verify::report::{
    ArtifactReport, RunOutcome, Severity, Tier, TierResult, TierStatus, VerificationStatus,
};
use tsuku_core::verify::FindingKind;
use tsuku_core::{InstallState, Reporter, TsukuHome, Verifier, VerifyConfig};
use tsuku_schema::dltest::{LoadOutcome, LoadTarget};
use tsuku_schema::{Arch, ArtifactId, LibcFlavor, Os, Platform};

fn linux() -> Platform {
    Platform::new(Os::Linux, Arch::X86_64, LibcFlavor::Glibc)
}

/// Loads everything unless told otherwise, keyed by file name.
#[derive(Default)]
struct StubTester {
    outcomes: HashMap<String, LoadOutcome>,
    calls: AtomicUsize,
    hang: bool,
    panic: bool,
}

impl StubTester {
    fn failing(file: &str, outcome: LoadOutcome) -> Self {
        let mut stub = Self::default();
        stub.outcomes.insert(file.to_string(), outcome);
        stub
    }

    fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LoadTester for StubTester {
    async fn load(&self, targets: &[LoadTarget]) -> Result<Vec<LoadVerdict>, LoadTestError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            std::future::pending::<()>().await;
        }
        assert!(!self.panic, "loader blew up");
        Ok(targets
            .iter()
            .map(|t| {
                let name = t.path.file_name().unwrap().to_string_lossy().into_owned();
                LoadVerdict::Reported(
                    self.outcomes.get(&name).cloned().unwrap_or(LoadOutcome::Loaded),
                )
            })
            .collect())
    }
}

struct Install {
    dir: tempfile::TempDir,
}

impl Install {
    fn new(fixtures: Vec<InstallFixture>) -> Self {
        let dir = tempfile::tempdir().unwrap();
        for f in fixtures {
            f.write(dir.path()).unwrap();
        }
        Self { dir }
    }

    fn root(&self) -> &Path {
        self.dir.path()
    }

    fn config(&self) -> VerifyConfig {
        let mut config = VerifyConfig::new(TsukuHome::new(self.root()), linux());
        config.platform_is_host = false;
        config.workers = 2;
        config
    }

    fn verifier(&self, config: VerifyConfig, tester: Option<Arc<StubTester>>) -> Verifier {
        let state = InstallState::load(&config.home);
        let verifier = Verifier::new(config, state);
        match tester {
            Some(t) => verifier.with_load_tester(t),
            None => verifier,
        }
    }
}

async fn verify(verifier: &Verifier, names: &[&str]) -> tsuku_core::verify::RunSummary {
    let requests: Vec<String> = names.iter().map(|s| (*s).to_string()).collect();
    verifier.run(&requests, CancellationToken::new()).await.unwrap()
}

fn libbar() -> InstallFixture {
    InstallFixture::library("libbar", "2.0.0", linux()).file(
        FixtureFile::new(
            "lib/libbar.so.2",
            ElfBuilder::shared_object(Arch::X86_64)
                .soname("libbar.so.2")
                .needed("libc.so.6")
                .build(),
        )
        .soname("libbar.so.2")
        .system_dep("libc.so.6"),
    )
}

fn libfoo() -> InstallFixture {
    InstallFixture::library("libfoo", "1.0.0", linux())
        .file(
            FixtureFile::new(
                "lib/libfoo.so.1",
                ElfBuilder::shared_object(Arch::X86_64)
                    .soname("libfoo.so.1")
                    .needed("libc.so.6")
                    .needed("libbar.so.2")
                    .build(),
            )
            .soname("libfoo.so.1")
            .system_dep("libc.so.6")
            .managed_dep("libbar.so.2", "libbar"),
        )
        .runtime_dep("libbar")
}

fn report<'a>(summary: &'a tsuku_core::verify::RunSummary, name: &str) -> &'a ArtifactReport {
    summary.reports.iter().find(|r| r.id.name == name).unwrap()
}

fn statuses(report: &ArtifactReport) -> Vec<(Tier, TierStatus)> {
    report.tiers.iter().map(|t| (t.tier, t.status)).collect()
}

#[tokio::test]
async fn clean_closure_passes_every_tier() {
    let install = Install::new(vec![libbar(), libfoo()]);
    let stub = Arc::new(StubTester::default());
    let verifier = install.verifier(install.config(), Some(Arc::clone(&stub)));

    let summary = verify(&verifier, &["libfoo"]).await;
    assert_eq!(summary.outcome(), RunOutcome::Passed);
    let names: Vec<&str> = summary.reports.iter().map(|r| r.id.name.as_str()).collect();
    assert_eq!(names, ["libfoo", "libbar"]);

    let foo = report(&summary, "libfoo");
    assert_eq!(
        statuses(foo),
        [
            (Tier::Header, TierStatus::Passed),
            (Tier::Dependencies, TierStatus::Passed),
            (Tier::Load, TierStatus::Passed),
            (Tier::Integrity, TierStatus::Passed),
        ]
    );
    assert_eq!(foo.dependencies.len(), 2);
    assert_eq!(stub.calls(), 2);
}

#[tokio::test]
async fn tampered_file_fails_at_integrity() {
    let install = Install::new(vec![InstallFixture::library("libfoo", "1.0.0", linux()).file(
        FixtureFile::new(
            "lib/libfoo.so.1",
            ElfBuilder::shared_object(Arch::X86_64).soname("libfoo.so.1").build(),
        )
        .soname("libfoo.so.1")
        .checksum("abc123"),
    )]);
    let verifier = install.verifier(install.config(), Some(Arc::new(StubTester::default())));

    let summary = verify(&verifier, &["libfoo"]).await;
    assert_eq!(summary.outcome(), RunOutcome::FailedFatal);
    let foo = report(&summary, "libfoo");
    assert_eq!(foo.halted_at, Some(Tier::Integrity));
    let finding = foo.findings().next().unwrap();
    assert!(finding.message.starts_with(
        "Integrity check failed: libfoo.so.1 checksum mismatch\nExpected: abc123\nGot: "
    ));
}

#[tokio::test]
async fn garbage_header_halts_before_dependencies() {
    let install = Install::new(vec![InstallFixture::library("libfoo", "1.0.0", linux())
        .file(FixtureFile::new("lib/libfoo.so.1", b"not a binary at all".to_vec()))]);
    let stub = Arc::new(StubTester::default());
    let verifier = install.verifier(install.config(), Some(Arc::clone(&stub)));

    let summary = verify(&verifier, &["libfoo"]).await;
    let foo = report(&summary, "libfoo");
    assert_eq!(foo.halted_at, Some(Tier::Header));
    assert_eq!(foo.tiers.len(), 1);
    assert_eq!(
        foo.findings().next().unwrap().message,
        "Header validation failed: invalid ELF magic number"
    );
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn foreign_architecture_is_reported() {
    let install = Install::new(vec![InstallFixture::library("libfoo", "1.0.0", linux()).file(
        FixtureFile::new(
            "lib/libfoo.so.1",
            ElfBuilder::shared_object(Arch::Arm64).soname("libfoo.so.1").build(),
        ),
    )]);
    let verifier = install.verifier(install.config(), None);

    let summary = verify(&verifier, &["libfoo"]).await;
    let finding = report(&summary, "libfoo").findings().next().unwrap().clone();
    assert_eq!(finding.kind, FindingKind::ArchitectureMismatch);
    assert_eq!(
        finding.message,
        "Header validation failed: wrong architecture (expected x86_64, got arm64)"
    );
}

#[tokio::test]
async fn unknown_dependency_passes_with_warnings() {
    let install = Install::new(vec![InstallFixture::library("libfoo", "1.0.0", linux()).file(
        FixtureFile::new(
            "lib/libfoo.so.1",
            ElfBuilder::shared_object(Arch::X86_64)
                .soname("libfoo.so.1")
                .needed("libweird.so.3")
                .build(),
        )
        .unknown_dep("libweird.so.3"),
    )]);
    let verifier = install.verifier(install.config(), Some(Arc::new(StubTester::default())));

    let summary = verify(&verifier, &["libfoo"]).await;
    assert_eq!(summary.outcome(), RunOutcome::PassedWithWarnings);
    let foo = report(&summary, "libfoo");
    assert_eq!(foo.status(), VerificationStatus::PassedWithWarnings);
    assert_eq!(foo.tiers.len(), 4);
}

#[tokio::test]
async fn missing_managed_dependency_skips_load_test() {
    let install = Install::new(vec![libfoo()]);
    let stub = Arc::new(StubTester::default());
    let verifier = install.verifier(install.config(), Some(Arc::clone(&stub)));

    let summary = verify(&verifier, &["libfoo"]).await;
    let foo = report(&summary, "libfoo");
    assert_eq!(foo.halted_at, Some(Tier::Dependencies));
    let finding = foo.findings().find(|f| f.is_fatal()).unwrap();
    assert_eq!(
        finding.message,
        "Dependency validation failed: libbar.so.2 not found (TSUKU_MANAGED)"
    );
    assert_eq!(
        finding.remediation.as_deref(),
        Some("Run 'tsuku install libbar --reinstall' to restore original.")
    );
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn glibc_tool_on_musl_target_fails_abi() {
    let exe = ElfBuilder::executable(Arch::X86_64)
        .interpreter("/lib64/ld-linux-x86-64.so.2")
        .needed("libc.so.6")
        .build();
    let install = Install::new(vec![InstallFixture::tool("gtool", "1.0.0", linux())
        .file(FixtureFile::new("bin/gtool", exe).system_dep("libc.so.6").executable())]);
    let mut config = install.config();
    config.platform = Platform::new(Os::Linux, Arch::X86_64, LibcFlavor::Musl);
    let verifier = install.verifier(config, None);

    let summary = verify(&verifier, &["gtool"]).await;
    let tool = report(&summary, "gtool");
    assert_eq!(tool.halted_at, Some(Tier::Dependencies));
    assert_eq!(tool.findings().next().unwrap().kind, FindingKind::AbiMismatch);
}

#[tokio::test]
async fn missing_symbol_fails_load_tier() {
    let install = Install::new(vec![libbar()]);
    let stub = Arc::new(StubTester::failing(
        "libbar.so.2",
        LoadOutcome::SymbolNotFound {
            symbol: "bar_init".into(),
        },
    ));
    let verifier = install.verifier(install.config(), Some(stub));

    let summary = verify(&verifier, &["libbar"]).await;
    let bar = report(&summary, "libbar");
    assert_eq!(bar.halted_at, Some(Tier::Load));
    assert_eq!(
        bar.findings().next().unwrap().message,
        "dlopen failed: symbol 'bar_init' not found"
    );
    assert!(bar.tier(Tier::Integrity).is_none());
}

#[tokio::test]
async fn executable_load_target_lists_resolved_dependencies() {
    #[derive(Default)]
    struct Capture(Mutex<Vec<LoadTarget>>);

    #[async_trait]
    impl LoadTester for Capture {
        async fn load(&self, targets: &[LoadTarget]) -> Result<Vec<LoadVerdict>, LoadTestError> {
            self.0.lock().unwrap().extend_from_slice(targets);
            Ok(targets
                .iter()
                .map(|_| LoadVerdict::Reported(LoadOutcome::Loaded))
                .collect())
        }
    }

    let exe = ElfBuilder::executable(Arch::X86_64)
        .interpreter("/lib64/ld-linux-x86-64.so.2")
        .needed("libbar.so.2")
        .needed("libc.so.6")
        .build();
    let install = Install::new(vec![
        libbar(),
        InstallFixture::tool("app", "1.0.0", linux()).file(
            FixtureFile::new("bin/app", exe)
                .managed_dep("libbar.so.2", "libbar")
                .system_dep("libc.so.6")
                .executable(),
        ),
    ]);
    let capture = Arc::new(Capture::default());
    let state = InstallState::load(&install.config().home);
    let verifier = Verifier::new(install.config(), state).with_load_tester(Arc::clone(&capture) as _);

    let summary = verify(&verifier, &["app"]).await;
    assert_eq!(report(&summary, "app").status(), VerificationStatus::Passed);

    let targets = capture.0.lock().unwrap();
    let app = targets.iter().find(|t| t.path.ends_with("bin/app")).unwrap();
    assert_eq!(app.kind, tsuku_schema::dltest::TargetKind::Executable);
    assert_eq!(app.dependencies.len(), 2);
    assert!(app.dependencies[0].ends_with("libs/libbar-2.0.0/lib/libbar.so.2"));
    assert_eq!(app.dependencies[1], "libc.so.6");
}

#[tokio::test]
async fn legacy_receipt_gets_limited_validation() {
    let install = Install::new(vec![InstallFixture::library("libold", "0.9.0", linux()).file(
        FixtureFile::new(
            "lib/libold.so.0",
            ElfBuilder::shared_object(Arch::X86_64)
                .soname("libold.so.0")
                .needed("libmystery.so.1")
                .build(),
        )
        .legacy(),
    )]);
    let stub = Arc::new(StubTester::default());
    let verifier = install.verifier(install.config(), Some(Arc::clone(&stub)));

    let summary = verify(&verifier, &["libold"]).await;
    let old = report(&summary, "libold");
    assert_eq!(old.status(), VerificationStatus::PassedWithWarnings);
    assert_eq!(
        statuses(old),
        [
            (Tier::Header, TierStatus::Passed),
            (Tier::Dependencies, TierStatus::Warning),
            (Tier::Load, TierStatus::Skipped),
            (Tier::Integrity, TierStatus::Passed),
        ]
    );
    let warnings: Vec<_> = old.findings().collect();
    assert_eq!(warnings.len(), 1);
    assert_eq!(
        warnings[0].message,
        "Library installed before Tier 2 support — limited validation available"
    );
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn missing_helper_is_a_warning_and_skip_flag_is_silent() {
    let install = Install::new(vec![libbar()]);

    let summary = verify(&install.verifier(install.config(), None), &["libbar"]).await;
    let bar = report(&summary, "libbar");
    assert_eq!(summary.outcome(), RunOutcome::PassedWithWarnings);
    let finding = bar.tier(Tier::Load).unwrap().findings[0].clone();
    assert_eq!(finding.kind, FindingKind::LoadTestUnavailable);
    assert_eq!(finding.severity, Severity::Warning);

    let mut config = install.config();
    config.skip_dlopen = true;
    let stub = Arc::new(StubTester::default());
    let summary = verify(&install.verifier(config, Some(Arc::clone(&stub))), &["libbar"]).await;
    assert_eq!(summary.outcome(), RunOutcome::Passed);
    assert_eq!(
        report(&summary, "libbar").tier(Tier::Load).unwrap().status,
        TierStatus::Skipped
    );
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn skip_integrity_only_touches_tier_four() {
    let install = Install::new(vec![InstallFixture::library("libfoo", "1.0.0", linux()).file(
        FixtureFile::new(
            "lib/libfoo.so.1",
            ElfBuilder::shared_object(Arch::X86_64)
                .soname("libfoo.so.1")
                .needed("libweird.so.3")
                .build(),
        )
        .unknown_dep("libweird.so.3")
        .checksum("00ff"),
    )]);

    let strict = verify(
        &install.verifier(install.config(), Some(Arc::new(StubTester::default()))),
        &["libfoo"],
    )
    .await;
    let mut config = install.config();
    config.skip_integrity = true;
    let lenient = verify(
        &install.verifier(config, Some(Arc::new(StubTester::default()))),
        &["libfoo"],
    )
    .await;

    let strict = report(&strict, "libfoo");
    let lenient = report(&lenient, "libfoo");
    assert_eq!(strict.tiers[..3], lenient.tiers[..3]);
    assert_eq!(strict.status(), VerificationStatus::FailedFatal);
    assert_eq!(lenient.status(), VerificationStatus::PassedWithWarnings);
    assert_eq!(
        lenient.tier(Tier::Integrity).unwrap().findings[0].kind,
        FindingKind::IntegrityMismatch
    );
}

fn wide_install() -> Install {
    let mut fixtures = vec![libbar()];
    let mut root = InstallFixture::tool("suite", "1.0.0", linux());
    for i in 0..6 {
        let name = format!("libpart{i}");
        let soname = format!("{name}.so.1");
        let mut file = FixtureFile::new(
            format!("lib/{soname}"),
            ElfBuilder::shared_object(Arch::X86_64)
                .soname(&soname)
                .needed("libbar.so.2")
                .build(),
        )
        .soname(&soname)
        .managed_dep("libbar.so.2", "libbar");
        if i % 3 == 0 {
            file = file.checksum("deadbeef");
        }
        fixtures.push(InstallFixture::library(&name, "1.0.0", linux()).file(file));
        root = root.runtime_dep(&name);
    }
    fixtures.push(root);
    Install::new(fixtures)
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn worker_count_does_not_change_results() {
    let install = wide_install();
    let mut results = Vec::new();
    for workers in [1, 8] {
        let mut config = install.config();
        config.workers = workers;
        let verifier = install.verifier(config, Some(Arc::new(StubTester::default())));
        results.push(verify(&verifier, &["suite"]).await.reports);
    }
    assert_eq!(results[0].len(), 8);
    assert_eq!(results[0], results[1]);
    assert_eq!(
        results[0]
            .iter()
            .filter(|r| r.status() == VerificationStatus::FailedFatal)
            .count(),
        2
    );
}

#[tokio::test]
async fn cancellation_discards_in_flight_artifacts() {
    let install = Install::new(vec![libbar(), libfoo()]);
    let stub = Arc::new(StubTester {
        hang: true,
        ..StubTester::default()
    });
    let mut config = install.config();
    config.workers = 1;
    let verifier = install.verifier(config, Some(Arc::clone(&stub)));

    let cancel = CancellationToken::new();
    let trigger = cancel.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        trigger.cancel();
    });

    let summary = verifier.run(&["libfoo".to_string()], cancel).await.unwrap();
    assert!(summary.cancelled);
    assert_eq!(summary.outcome(), RunOutcome::Cancelled);
    assert!(summary.reports.is_empty());
    assert_eq!(
        summary.discarded,
        [ArtifactId::new("libfoo", "1.0.0"), ArtifactId::new("libbar", "2.0.0")]
    );
}

#[tokio::test]
async fn cancelled_before_start_runs_nothing() {
    let install = Install::new(vec![libbar()]);
    let stub = Arc::new(StubTester::default());
    let verifier = install.verifier(install.config(), Some(Arc::clone(&stub)));

    let cancel = CancellationToken::new();
    cancel.cancel();
    let summary = verifier.run(&["libbar".to_string()], cancel).await.unwrap();
    assert_eq!(summary.outcome(), RunOutcome::Cancelled);
    assert_eq!(summary.discarded.len(), 1);
    assert_eq!(stub.calls(), 0);
}

#[tokio::test]
async fn panicking_tier_becomes_internal_finding() {
    let install = Install::new(vec![libbar(), libfoo()]);
    let stub = Arc::new(StubTester {
        panic: true,
        ..StubTester::default()
    });
    let verifier = install.verifier(install.config(), Some(stub));

    let summary = verify(&verifier, &["libfoo"]).await;
    assert_eq!(summary.reports.len(), 2);
    assert_eq!(summary.outcome(), RunOutcome::FailedFatal);
    for r in &summary.reports {
        assert_eq!(r.errors[0].kind, FindingKind::Internal);
        assert!(r.errors[0].message.contains("loader blew up"));
    }
}

#[derive(Default)]
struct Recording {
    events: Mutex<Vec<String>>,
}

impl Reporter for Recording {
    fn run_started(&self, artifacts: &[ArtifactId]) {
        self.events.lock().unwrap().push(format!("run {}", artifacts.len()));
    }
    fn artifact_started(&self, id: &ArtifactId) {
        self.events.lock().unwrap().push(format!("start {id}"));
    }
    fn tier_finished(&self, id: &ArtifactId, result: &TierResult) {
        self.events
            .lock()
            .unwrap()
            .push(format!("{id} tier {}", result.tier.id()));
    }
    fn artifact_finished(&self, report: &ArtifactReport) {
        self.events.lock().unwrap().push(format!("done {}", report.id));
    }
}

#[tokio::test]
async fn reporter_sees_every_step() {
    let install = Install::new(vec![libbar()]);
    let recording = Arc::new(Recording::default());
    let verifier = install
        .verifier(install.config(), Some(Arc::new(StubTester::default())))
        .with_reporter(Arc::clone(&recording) as _);

    verify(&verifier, &["libbar"]).await;
    let events = recording.events.lock().unwrap();
    assert_eq!(
        *events,
        [
            "run 1",
            "start libbar@2.0.0",
            "libbar@2.0.0 tier 1",
            "libbar@2.0.0 tier 2",
            "libbar@2.0.0 tier 3",
            "libbar@2.0.0 tier 4",
            "done libbar@2.0.0",
        ]
    );
}
