//! Request/response protocol between the verifier and the `tsuku-dltest`
//! load-test helper.
//!
//! The verifier writes one [`LoadRequest`] as JSON to the helper's stdin and
//! reads one [`LoadResponse`] from its stdout. The helper's exit status is
//! part of the contract: see [`EXIT_ALL_LOADED`] and friends.

use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// Every target loaded.
pub const EXIT_ALL_LOADED: i32 = 0;
/// At least one target failed to load; the response is still complete.
pub const EXIT_SOME_FAILED: i32 = 1;
/// The request could not be read or parsed.
pub const EXIT_USAGE: i32 = 2;

/// How the helper should exercise a target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TargetKind {
    /// `dlopen` the file itself.
    Library,
    /// Check execute permission, then load the declared dependencies.
    /// The executable's own code is never run.
    Executable,
}

/// One file to load.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadTarget {
    /// Absolute path of the file.
    pub path: PathBuf,
    /// Library or executable.
    pub kind: TargetKind,
    /// Dependencies to load for an executable, in declaration order.
    /// Entries are absolute paths for managed libraries and bare sonames
    /// for system libraries.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub dependencies: Vec<String>,
}

/// A batch of targets for one helper invocation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoadRequest {
    /// Targets to load, each in isolation from the others' failures.
    pub targets: Vec<LoadTarget>,
    /// CPU-time budget in seconds the helper applies to itself.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cpu_limit_secs: Option<u64>,
    /// Report best-effort isolation failures on stderr.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub verbose: bool,
}

/// Result of loading one target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum LoadOutcome {
    /// The loader accepted the file and bound every symbol.
    Loaded,
    /// A required symbol could not be bound.
    SymbolNotFound {
        /// The unresolved symbol
        symbol: String,
    },
    /// The file could not be mapped or executed.
    PermissionDenied {
        /// Loader message
        detail: String,
    },
    /// Any other loader failure.
    Failed {
        /// Loader message
        detail: String,
    },
}

impl LoadOutcome {
    /// Whether the target loaded.
    pub fn is_loaded(&self) -> bool {
        matches!(self, Self::Loaded)
    }
}

/// Outcome for one target, echoed with its path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoadResult {
    /// Path from the request.
    pub path: PathBuf,
    /// What happened.
    #[serde(flatten)]
    pub outcome: LoadOutcome,
}

/// The helper's reply: one result per request target, in request order.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub struct LoadResponse {
    /// Results in request order.
    pub results: Vec<LoadResult>,
}
