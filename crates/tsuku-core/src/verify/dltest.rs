//! Tier 3: load testing through the isolated `tsuku-dltest` helper.
//!
//! Loading a library runs its initializers, so it never happens in this
//! process. The supervisor sends a [`LoadRequest`] to a short-lived child,
//! bounds it with a hard timeout, and turns every way the child can go wrong
//! into a typed verdict.

use async_trait::async_trait;
use std::collections::VecDeque;
use std::ffi::OsString;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::Duration;
use thiserror::Error;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tsuku_schema::dltest::{
    EXIT_ALL_LOADED, EXIT_SOME_FAILED, EXIT_USAGE, LoadOutcome, LoadRequest, LoadResponse,
    LoadTarget, TargetKind,
};

use super::InspectedFile;
use super::deps::load_list;
use super::header::ImageType;
use super::report::{DependencyRecord, Finding, FindingKind, Tier, TierResult};
use crate::config::VerifyConfig;
use crate::state::{InstalledArtifact, compare_versions};

/// File name of the helper binary.
pub const HELPER_NAME: &str = "tsuku-dltest";

/// Variables copied from the parent environment. Everything else is dropped.
const ENV_ALLOWLIST: &[&str] = &["PATH", "HOME", "TMPDIR", "LANG"];

/// Loader variables that inject code. Never forwarded, even if allow-listed
/// by mistake.
const ENV_DENYLIST_PREFIXES: &[&str] = &[
    "LD_PRELOAD",
    "LD_AUDIT",
    "LD_DEBUG",
    "LD_PROFILE",
    "DYLD_INSERT_LIBRARIES",
    "DYLD_FORCE_FLAT_NAMESPACE",
    "DYLD_PRINT_",
];

#[derive(Error, Debug)]
pub enum LoadTestError {
    #[error("load target {} resolves outside {}", .path.display(), .root.display())]
    OutsideRoot { path: PathBuf, root: PathBuf },

    #[error("cannot resolve load target {}: {source}", .path.display())]
    Canonicalize {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("failed to start {}: {source}", .helper.display())]
    Spawn {
        helper: PathBuf,
        source: std::io::Error,
    },

    #[error("helper I/O failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to encode load request: {0}")]
    Encode(#[from] serde_json::Error),
}

/// What happened to one load target.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadVerdict {
    /// The helper reported on the target.
    Reported(LoadOutcome),
    /// The batch holding the target ran out of time.
    Timeout(Duration),
    /// The helper died while the target was alone in its batch.
    Crash(String),
    /// The helper rejected the request or answered nonsense.
    Protocol(String),
}

/// Seam between Tier 3 and whatever actually loads files.
#[async_trait]
pub trait LoadTester: Send + Sync {
    /// Load every target, returning one verdict per target in order.
    async fn load(&self, targets: &[LoadTarget]) -> Result<Vec<LoadVerdict>, LoadTestError>;
}

/// Environment for the helper: the allow-list plus loader search paths
/// pointing at managed library directories.
pub fn helper_env(
    lookup: impl Fn(&str) -> Option<OsString>,
    library_dirs: &[PathBuf],
) -> Vec<(String, OsString)> {
    let mut env: Vec<(String, OsString)> = ENV_ALLOWLIST
        .iter()
        .filter(|key| !ENV_DENYLIST_PREFIXES.iter().any(|d| key.starts_with(d)))
        .filter_map(|key| lookup(key).map(|v| ((*key).to_string(), v)))
        .collect();

    if let Ok(joined) = std::env::join_paths(library_dirs) {
        if !joined.is_empty() {
            env.push(("LD_LIBRARY_PATH".to_string(), joined.clone()));
            env.push(("DYLD_LIBRARY_PATH".to_string(), joined));
        }
    }
    env
}

/// Locate the helper: configured path, next to the running binary, a
/// managed install, then `PATH`.
pub fn discover(config: &VerifyConfig) -> Option<PathBuf> {
    if let Some(configured) = &config.dltest_helper {
        if configured.is_file() {
            return Some(configured.clone());
        }
        tracing::warn!(path = %configured.display(), "configured load-test helper not found");
    }

    let sibling = std::env::current_exe()
        .ok()
        .and_then(|exe| exe.parent().map(|dir| dir.join(HELPER_NAME)))
        .filter(|p| p.is_file());
    if sibling.is_some() {
        return sibling;
    }

    if let Some(managed) = managed_helper(&config.home.tools_dir()) {
        return Some(managed);
    }

    which::which(HELPER_NAME).ok()
}

/// Highest `tools/tsuku-dltest-<version>/bin/tsuku-dltest`.
fn managed_helper(tools_dir: &Path) -> Option<PathBuf> {
    let prefix = format!("{HELPER_NAME}-");
    let mut found: Vec<(String, PathBuf)> = std::fs::read_dir(tools_dir)
        .ok()?
        .flatten()
        .filter_map(|entry| {
            let name = entry.file_name().to_string_lossy().into_owned();
            let version = name.strip_prefix(&prefix)?.to_string();
            let bin = entry.path().join("bin").join(HELPER_NAME);
            bin.is_file().then_some((version, bin))
        })
        .collect();
    found.sort_by(|a, b| compare_versions(&a.0, &b.0));
    found.pop().map(|(_, bin)| bin)
}

enum BatchOutcome {
    Done(LoadResponse),
    Timeout,
    Crash(String),
    Protocol(String),
}

/// Runs the real helper binary.
#[derive(Debug, Clone)]
pub struct HelperLoadTester {
    helper: PathBuf,
    root: PathBuf,
    library_dirs: Vec<PathBuf>,
    timeout: Duration,
    batch_size: usize,
}

impl HelperLoadTester {
    pub fn new(helper: PathBuf, config: &VerifyConfig, library_dirs: Vec<PathBuf>) -> Self {
        let root = config.home.root();
        Self {
            helper,
            root: std::fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf()),
            library_dirs,
            timeout: config.dltest_timeout,
            batch_size: config.dltest_batch_size.max(1),
        }
    }

    fn check_targets(&self, targets: &[LoadTarget]) -> Result<(), LoadTestError> {
        for t in targets {
            let canonical =
                std::fs::canonicalize(&t.path).map_err(|source| LoadTestError::Canonicalize {
                    path: t.path.clone(),
                    source,
                })?;
            if !canonical.starts_with(&self.root) {
                return Err(LoadTestError::OutsideRoot {
                    path: t.path.clone(),
                    root: self.root.clone(),
                });
            }
        }
        Ok(())
    }

    async fn run_batch(&self, batch: &[LoadTarget]) -> Result<BatchOutcome, LoadTestError> {
        let request = LoadRequest {
            targets: batch.to_vec(),
            cpu_limit_secs: Some(self.timeout.as_secs().max(1)),
            verbose: tracing::enabled!(tracing::Level::DEBUG),
        };
        let payload = serde_json::to_vec(&request)?;

        let mut cmd = Command::new(&self.helper);
        // Start from a blank slate so loader injection variables never leak in.
        cmd.env_clear()
            .envs(helper_env(|k| std::env::var_os(k), &self.library_dirs))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        #[cfg(unix)]
        cmd.process_group(0);

        let mut child = cmd.spawn().map_err(|source| LoadTestError::Spawn {
            helper: self.helper.clone(),
            source,
        })?;
        let pid = child.id();
        let stdin = child.stdin.take();

        let exchange = async move {
            if let Some(mut stdin) = stdin {
                // A helper that dies early closes the pipe; its exit status
                // says more than the write error.
                let _ = stdin.write_all(&payload).await;
                let _ = stdin.shutdown().await;
            }
            child.wait_with_output().await
        };

        // The child stays unreaped inside `exchange` until it is dropped, so
        // its process group is still ours to signal.
        tokio::pin!(exchange);
        let output = tokio::select! {
            result = &mut exchange => result?,
            () = tokio::time::sleep(self.timeout) => {
                kill_group(pid);
                return Ok(BatchOutcome::Timeout);
            }
        };

        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        if !stderr.is_empty() {
            tracing::debug!(helper = %self.helper.display(), "helper stderr: {stderr}");
        }
        let outcome = match output.status.code() {
            Some(EXIT_ALL_LOADED | EXIT_SOME_FAILED) => {
                match serde_json::from_slice::<LoadResponse>(&output.stdout) {
                    Ok(response) => BatchOutcome::Done(response),
                    Err(e) => BatchOutcome::Protocol(format!("unreadable helper response: {e}")),
                }
            }
            Some(EXIT_USAGE) => BatchOutcome::Protocol(if stderr.is_empty() {
                "helper rejected the request".to_string()
            } else {
                stderr
            }),
            Some(code) => BatchOutcome::Crash(format!("exit code {code}")),
            None => BatchOutcome::Crash(describe_signal(&output.status)),
        };
        Ok(outcome)
    }
}

#[cfg(unix)]
fn describe_signal(status: &std::process::ExitStatus) -> String {
    use std::os::unix::process::ExitStatusExt;
    status
        .signal()
        .map_or_else(|| "terminated abnormally".to_string(), |s| format!("terminated by signal {s}"))
}

#[cfg(not(unix))]
fn describe_signal(_: &std::process::ExitStatus) -> String {
    "terminated abnormally".to_string()
}

#[async_trait]
impl LoadTester for HelperLoadTester {
    async fn load(&self, targets: &[LoadTarget]) -> Result<Vec<LoadVerdict>, LoadTestError> {
        self.check_targets(targets)?;

        let mut verdicts = Vec::with_capacity(targets.len());
        let mut queue: VecDeque<&[LoadTarget]> = targets.chunks(self.batch_size).collect();

        while let Some(batch) = queue.pop_front() {
            match self.run_batch(batch).await? {
                BatchOutcome::Done(response) => {
                    for t in batch {
                        let verdict = response
                            .results
                            .iter()
                            .find(|r| r.path == t.path)
                            .map_or_else(
                                || LoadVerdict::Protocol("helper reported no result".to_string()),
                                |r| LoadVerdict::Reported(r.outcome.clone()),
                            );
                        verdicts.push(verdict);
                    }
                }
                BatchOutcome::Timeout => {
                    tracing::warn!(size = batch.len(), "load-test batch timed out");
                    verdicts.extend(batch.iter().map(|_| LoadVerdict::Timeout(self.timeout)));
                }
                BatchOutcome::Crash(why) if batch.len() > 1 => {
                    // Bisect until the crashing target is alone.
                    tracing::debug!(size = batch.len(), %why, "helper crashed, splitting batch");
                    let (first, second) = batch.split_at(batch.len() / 2);
                    queue.push_front(second);
                    queue.push_front(first);
                }
                BatchOutcome::Crash(why) => verdicts.push(LoadVerdict::Crash(why)),
                BatchOutcome::Protocol(why) => {
                    verdicts.extend(batch.iter().map(|_| LoadVerdict::Protocol(why.clone())));
                }
            }
        }
        Ok(verdicts)
    }
}

/// Build load targets for `files`. Executables load their dependencies,
/// never themselves.
pub fn targets(files: &[InspectedFile], records: &[DependencyRecord]) -> Vec<LoadTarget> {
    files
        .iter()
        .map(|f| match f.info.image {
            ImageType::Executable => LoadTarget {
                path: f.path.clone(),
                kind: TargetKind::Executable,
                dependencies: load_list(records, &f.meta.path),
            },
            ImageType::SharedObject | ImageType::Bundle => LoadTarget {
                path: f.path.clone(),
                kind: TargetKind::Library,
                dependencies: Vec::new(),
            },
        })
        .collect()
}

fn verdict_finding(verdict: &LoadVerdict) -> Option<Finding> {
    let (kind, message) = match verdict {
        LoadVerdict::Reported(LoadOutcome::Loaded) => return None,
        LoadVerdict::Reported(LoadOutcome::SymbolNotFound { symbol }) => (
            FindingKind::LoadSymbolNotFound,
            format!("dlopen failed: symbol '{symbol}' not found"),
        ),
        LoadVerdict::Reported(LoadOutcome::PermissionDenied { .. }) => (
            FindingKind::LoadPermissionDenied,
            "dlopen failed: permission denied".to_string(),
        ),
        LoadVerdict::Reported(LoadOutcome::Failed { detail }) | LoadVerdict::Protocol(detail) => {
            (FindingKind::LoadFailed, format!("dlopen failed: {detail}"))
        }
        LoadVerdict::Timeout(limit) => (
            FindingKind::LoadTimeout,
            format!("dlopen failed: timed out after {}s", limit.as_secs_f32()),
        ),
        LoadVerdict::Crash(why) => (
            FindingKind::LoadCrash,
            format!("dlopen failed: helper crashed ({why})"),
        ),
    };
    Some(Finding::new(kind, message))
}

/// SIGKILL everything in the helper's process group, including anything it
/// forked.
#[cfg(unix)]
fn kill_group(pid: Option<u32>) {
    let Some(Ok(pgid)) = pid.map(libc::pid_t::try_from) else {
        return;
    };
    // SAFETY: killpg(2) takes plain integers. `pgid` names the group created
    // by `process_group(0)` for a child we have not yet reaped.
    #[allow(unsafe_code)]
    let rc = unsafe { libc::killpg(pgid, libc::SIGKILL) };
    if rc != 0 {
        tracing::debug!(
            pgid,
            error = %std::io::Error::last_os_error(),
            "killpg on helper group failed"
        );
    }
}

#[cfg(not(unix))]
fn kill_group(_: Option<u32>) {}

/// Run Tier 3 for one artifact. `tester` is `None` when no helper exists.
pub async fn check(
    tester: Option<&dyn LoadTester>,
    artifact: &InstalledArtifact,
    files: &[InspectedFile],
    records: &[DependencyRecord],
) -> TierResult {
    let Some(tester) = tester else {
        let finding = Finding::new(
            FindingKind::LoadTestUnavailable,
            format!("{HELPER_NAME} helper not available, skipping load test"),
        )
        .with_remediation(format!(
            "Run 'tsuku install {HELPER_NAME}' to enable full verification."
        ));
        return TierResult::from_findings(Tier::Load, vec![finding]);
    };

    let targets = targets(files, records);
    if targets.is_empty() {
        return TierResult::from_findings(Tier::Load, Vec::new());
    }

    let reinstall = format!(
        "Run 'tsuku install {} --reinstall' to restore original.",
        artifact.name()
    );
    let findings = match tester.load(&targets).await {
        Ok(verdicts) => files
            .iter()
            .zip(verdicts.iter())
            .filter_map(|(file, verdict)| {
                verdict_finding(verdict)
                    .map(|f| f.with_file(&file.meta.path).with_remediation(reinstall.clone()))
            })
            .collect(),
        Err(e) => vec![Finding::new(FindingKind::LoadFailed, format!("dlopen failed: {e}"))],
    };
    TierResult::from_findings(Tier::Load, findings)
}
