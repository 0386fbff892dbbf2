//! Closure expansion and the per-artifact tier pipeline.

use futures::FutureExt;
use std::collections::{HashMap, HashSet, VecDeque};
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tsuku_schema::{ArtifactId, ArtifactKind, DependencyClass, Platform};

use super::InspectedFile;
use super::deps::{self, Resolver};
use super::dltest::{self, HelperLoadTester, LoadTester};
use super::header;
use super::integrity;
use super::report::{
    ArtifactReport, DependencyRecord, Finding, FindingKind, RunSummary, Tier, TierResult,
};
use crate::config::{ConfigError, VerifyConfig};
use crate::registry::SystemLibraryRegistry;
use crate::reporter::{NullReporter, Reporter};
use crate::state::{InstallState, InstalledArtifact, SonameIndex};

/// Closure nodes deeper than this are verified but not expanded.
pub const MAX_CLOSURE_DEPTH: usize = 10;

#[derive(Error, Debug)]
pub enum VerifyError {
    #[error("{0} is not installed")]
    NotInstalled(String),

    #[error("no artifacts requested")]
    NothingRequested,

    #[error(transparent)]
    Config(#[from] ConfigError),
}

/// Runs verification over an installed state.
///
/// Everything shared with workers sits behind an `Arc` and is never mutated
/// once a run starts.
#[derive(Clone)]
pub struct Verifier {
    config: Arc<VerifyConfig>,
    state: Arc<InstallState>,
    registry: Arc<SystemLibraryRegistry>,
    index: Arc<SonameIndex>,
    tester: Option<Arc<dyn LoadTester>>,
    reporter: Arc<dyn Reporter>,
}

impl std::fmt::Debug for Verifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Verifier")
            .field("root", &self.config.home.root())
            .field("platform", &self.config.platform)
            .field("artifacts", &self.state.artifacts().len())
            .field("load_tester", &self.tester.is_some())
            .finish_non_exhaustive()
    }
}

impl Verifier {
    /// A verifier with the built-in registry and no load tester.
    pub fn new(config: VerifyConfig, state: InstallState) -> Self {
        let index = SonameIndex::build(&state);
        Self {
            config: Arc::new(config),
            state: Arc::new(state),
            registry: Arc::new(SystemLibraryRegistry::builtin()),
            index: Arc::new(index),
            tester: None,
            reporter: Arc::new(NullReporter),
        }
    }

    /// Load the installed state and registry overlay under `config.home`,
    /// and locate the load-test helper unless Tier 3 is disabled.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::Config`] when the registry overlay is invalid.
    pub fn open(config: VerifyConfig) -> Result<Self, VerifyError> {
        let state = InstallState::load(&config.home);
        let registry =
            SystemLibraryRegistry::builtin().with_overlay(&config.home.registry_file())?;

        let tester: Option<Arc<dyn LoadTester>> = if config.skip_dlopen {
            None
        } else {
            match dltest::discover(&config) {
                Some(helper) => {
                    tracing::debug!(helper = %helper.display(), "using load-test helper");
                    Some(Arc::new(HelperLoadTester::new(
                        helper,
                        &config,
                        state.library_dirs(),
                    )))
                }
                None => {
                    tracing::warn!("{} not found, Tier 3 will be skipped", dltest::HELPER_NAME);
                    None
                }
            }
        };

        let mut verifier = Self::new(config, state).with_registry(registry);
        verifier.tester = tester;
        Ok(verifier)
    }

    pub fn with_registry(mut self, registry: SystemLibraryRegistry) -> Self {
        self.registry = Arc::new(registry);
        self
    }

    pub fn with_load_tester(mut self, tester: Arc<dyn LoadTester>) -> Self {
        self.tester = Some(tester);
        self
    }

    pub fn with_reporter(mut self, reporter: Arc<dyn Reporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Resolve `requests` (`name` or `name@version`) and expand them
    /// breadth-first into every installed artifact they depend on.
    ///
    /// Requested artifacts come first, in request order. Dependencies that
    /// are not installed are not nodes; Tier 2 of the dependent reports them.
    ///
    /// # Errors
    ///
    /// Returns [`VerifyError::NotInstalled`] for a request matching nothing.
    pub fn closure(&self, requests: &[String]) -> Result<Vec<ArtifactId>, VerifyError> {
        if requests.is_empty() {
            return Err(VerifyError::NothingRequested);
        }

        let mut queue: VecDeque<(ArtifactId, usize)> = VecDeque::new();
        let mut visited: HashSet<ArtifactId> = HashSet::new();
        for spec in requests {
            let artifact = self
                .state
                .resolve_spec(spec)
                .ok_or_else(|| VerifyError::NotInstalled(spec.clone()))?;
            let id = artifact.id();
            if visited.insert(id.clone()) {
                queue.push_back((id, 0));
            }
        }

        let mut order = Vec::new();
        while let Some((id, depth)) = queue.pop_front() {
            let Some(artifact) = self.state.get(&id) else {
                continue;
            };
            let edges = self.edges(artifact);
            order.push(id);

            if depth >= MAX_CLOSURE_DEPTH {
                if edges.iter().any(|e| !visited.contains(e)) {
                    tracing::warn!(
                        artifact = %artifact.id(),
                        "dependency closure deeper than {MAX_CLOSURE_DEPTH}, not expanding further"
                    );
                }
                continue;
            }
            for edge in edges {
                if visited.insert(edge.clone()) {
                    queue.push_back((edge, depth + 1));
                }
            }
        }
        Ok(order)
    }

    /// Installed artifacts `artifact` depends on, in declaration order.
    fn edges(&self, artifact: &InstalledArtifact) -> Vec<ArtifactId> {
        let runtime = artifact
            .receipt
            .runtime_dependencies
            .iter()
            .filter_map(|name| {
                let found = self.state.find(name, None).map(InstalledArtifact::id);
                if found.is_none() {
                    tracing::debug!(artifact = %artifact.id(), dependency = %name, "runtime dependency not installed");
                }
                found
            });

        let managed = artifact
            .files()
            .iter()
            .flat_map(|f| f.dependencies.iter())
            .filter(|s| s.class == DependencyClass::Managed)
            .filter_map(|s| match &s.provider {
                Some(provider) => self.state.find(provider, None).map(InstalledArtifact::id),
                None => self.index.lookup(&s.soname).map(|e| e.artifact.clone()),
            });

        let own = artifact.id();
        let mut edges: Vec<ArtifactId> = Vec::new();
        for id in runtime.chain(managed) {
            if id != own && !edges.contains(&id) {
                edges.push(id);
            }
        }
        edges
    }

    /// Verify `requests` and their closure.
    ///
    /// At most `config.workers` artifacts are in flight. Once `cancel`
    /// fires no new artifact starts and in-flight ones are dropped, which
    /// kills any helper child. Their partial reports are discarded.
    ///
    /// # Errors
    ///
    /// Only closure expansion can fail; tier problems end up in the reports.
    pub async fn run(
        &self,
        requests: &[String],
        cancel: CancellationToken,
    ) -> Result<RunSummary, VerifyError> {
        let order = self.closure(requests)?;
        self.reporter.run_started(&order);
        tracing::info!(
            artifacts = order.len(),
            workers = self.config.workers,
            "verification started"
        );

        let semaphore = Arc::new(Semaphore::new(self.config.workers.max(1)));
        let mut set: JoinSet<(usize, ArtifactReport)> = JoinSet::new();
        let mut cancelled = false;

        for (pos, id) in order.iter().enumerate() {
            let permit = tokio::select! {
                biased;
                () = cancel.cancelled() => None,
                permit = Arc::clone(&semaphore).acquire_owned() => permit.ok(),
            };
            let Some(permit) = permit else {
                cancelled = true;
                break;
            };
            let Some(artifact) = self.state.get(id).cloned() else {
                continue;
            };

            let verifier = self.clone();
            set.spawn(async move {
                let _permit = permit;
                let id = artifact.id();
                let kind = artifact.kind();
                let report = AssertUnwindSafe(verifier.verify_artifact(artifact))
                    .catch_unwind()
                    .await
                    .unwrap_or_else(|panic| {
                        let report = panicked(id, kind, panic_message(panic.as_ref()));
                        verifier.reporter.artifact_finished(&report);
                        report
                    });
                (pos, report)
            });
        }
        if cancelled {
            set.abort_all();
        }

        let mut finished: HashMap<usize, ArtifactReport> = HashMap::new();
        loop {
            let joined = tokio::select! {
                biased;
                () = cancel.cancelled(), if !cancelled => None,
                joined = set.join_next() => Some(joined),
            };
            match joined {
                None => {
                    tracing::info!("verification cancelled, stopping in-flight artifacts");
                    cancelled = true;
                    set.abort_all();
                }
                Some(None) => break,
                Some(Some(Ok((pos, report)))) => {
                    finished.insert(pos, report);
                }
                Some(Some(Err(e))) if e.is_cancelled() => {}
                Some(Some(Err(e))) => tracing::error!("verification task failed: {e}"),
            }
        }

        let mut summary = RunSummary {
            cancelled,
            ..RunSummary::default()
        };
        for (pos, id) in order.into_iter().enumerate() {
            match finished.remove(&pos) {
                Some(report) => summary.reports.push(report),
                None if cancelled => summary.discarded.push(id),
                None => {
                    let kind = self.state.get(&id).map_or(ArtifactKind::Library, InstalledArtifact::kind);
                    summary
                        .reports
                        .push(panicked(id, kind, "task did not complete".to_string()));
                }
            }
        }

        tracing::info!(
            outcome = ?summary.outcome(),
            reported = summary.reports.len(),
            discarded = summary.discarded.len(),
            "verification finished"
        );
        Ok(summary)
    }

    /// Run the tier pipeline for one artifact, stopping at the first fatal
    /// tier.
    async fn verify_artifact(&self, artifact: InstalledArtifact) -> ArtifactReport {
        let id = artifact.id();
        self.reporter.artifact_started(&id);
        let mut report = ArtifactReport::new(id, artifact.kind());
        let artifact = Arc::new(artifact);

        // Tier 1
        let (result, files) = {
            let artifact = Arc::clone(&artifact);
            let platform = self.config.platform;
            blocking(Tier::Header, move || inspect_headers(&artifact, &platform)).await
        };
        if !self.record(&mut report, result) {
            return self.finish(report);
        }

        // Tier 2 and 3
        let legacy = artifact.files().iter().any(|f| f.is_legacy());
        if legacy {
            tracing::debug!(artifact = %report.id, "legacy receipt, limited validation");
            self.record(&mut report, deps::legacy_result(&artifact));
            self.record(&mut report, TierResult::skipped(Tier::Load));
        } else {
            let (result, records) = {
                let artifact = Arc::clone(&artifact);
                let files = files.clone();
                let verifier = self.clone();
                blocking(Tier::Dependencies, move || {
                    verifier.resolver_check(&artifact, &files)
                })
                .await
            };
            report.dependencies.clone_from(&records);
            if !self.record(&mut report, result) {
                return self.finish(report);
            }

            let result = if self.config.skip_dlopen {
                TierResult::skipped(Tier::Load)
            } else {
                dltest::check(self.tester.as_deref(), &artifact, &files, &records).await
            };
            if !self.record(&mut report, result) {
                return self.finish(report);
            }
        }

        // Tier 4
        let (result, ()) = {
            let artifact = Arc::clone(&artifact);
            let skip = self.config.skip_integrity;
            blocking(Tier::Integrity, move || {
                (integrity::check(&artifact, skip), ())
            })
            .await
        };
        self.record(&mut report, result);
        self.finish(report)
    }

    fn resolver_check(
        &self,
        artifact: &InstalledArtifact,
        files: &[InspectedFile],
    ) -> (TierResult, Vec<DependencyRecord>) {
        let resolver = Resolver {
            platform: &self.config.platform,
            platform_is_host: self.config.platform_is_host,
            registry: &self.registry,
            index: &self.index,
            root: self.config.home.root(),
        };
        resolver.check(artifact, files)
    }

    fn record(&self, report: &mut ArtifactReport, result: TierResult) -> bool {
        self.reporter.tier_finished(&report.id, &result);
        report.record(result)
    }

    fn finish(&self, report: ArtifactReport) -> ArtifactReport {
        tracing::debug!(
            artifact = %report.id,
            status = %report.status(),
            halted_at = ?report.halted_at,
            "artifact verified"
        );
        self.reporter.artifact_finished(&report);
        report
    }
}

/// Tier 1 over every recorded file.
fn inspect_headers(
    artifact: &InstalledArtifact,
    platform: &Platform,
) -> (TierResult, Vec<InspectedFile>) {
    let mut findings = Vec::new();
    let mut files = Vec::new();
    for meta in artifact.files() {
        let path = artifact.file_path(meta);
        match header::validate(&path, platform) {
            Ok(info) => files.push(InspectedFile {
                meta: meta.clone(),
                path,
                info,
            }),
            Err(e) => findings.push(e.into_finding(&meta.path)),
        }
    }
    (TierResult::from_findings(Tier::Header, findings), files)
}

/// Run a blocking tier on the blocking pool. A panic becomes a fatal
/// `Internal` finding for that tier.
async fn blocking<T, F>(tier: Tier, f: F) -> (TierResult, T)
where
    T: Default + Send + 'static,
    F: FnOnce() -> (TierResult, T) + Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(out) => out,
        Err(e) => {
            let finding =
                Finding::new(FindingKind::Internal, format!("{tier} did not complete: {e}"));
            (TierResult::from_findings(tier, vec![finding]), T::default())
        }
    }
}

fn panicked(id: ArtifactId, kind: ArtifactKind, message: String) -> ArtifactReport {
    let mut report = ArtifactReport::new(id, kind);
    report.errors.push(Finding::new(
        FindingKind::Internal,
        format!("Internal error during verification: {message}"),
    ));
    report
}

fn panic_message(panic: &(dyn std::any::Any + Send)) -> String {
    panic
        .downcast_ref::<&str>()
        .map(ToString::to_string)
        .or_else(|| panic.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "task panicked".to_string())
}
