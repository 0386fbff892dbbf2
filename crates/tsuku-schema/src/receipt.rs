//! Install receipts.
//!
//! The installer writes one receipt per install directory. It names the
//! artifact, lists every file subject to verification, and snapshots what
//! was observed about each file at install time (soname, dynamic
//! dependencies, content checksum). Verification only ever reads receipts.

use crate::{Platform, Sha256Hash};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;

/// File name of the receipt inside an install directory.
pub const RECEIPT_FILE: &str = ".tsuku-receipt.json";

/// Schema version written by installers that only recorded checksums.
pub const SCHEMA_CHECKSUMS_ONLY: u32 = 1;

/// First schema version that records dependency snapshots.
pub const SCHEMA_DEPENDENCY_TRACKING: u32 = 2;

/// Schema version written by the current installer.
pub const CURRENT_SCHEMA_VERSION: u32 = SCHEMA_DEPENDENCY_TRACKING;

/// Whether the artifact is a runnable tool or a shared library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Installed under `tools/`
    Tool,
    /// Installed under `libs/`
    Library,
}

impl ArtifactKind {
    /// Name of the directory under the managed root holding this kind.
    pub fn dir_name(&self) -> &'static str {
        match self {
            Self::Tool => "tools",
            Self::Library => "libs",
        }
    }
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Tool => "tool",
            Self::Library => "library",
        })
    }
}

/// Identity of an installed artifact (`name@version`).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ArtifactId {
    /// Artifact name
    pub name: String,
    /// Installed version
    pub version: String,
}

impl ArtifactId {
    /// Construct an id from a name and version.
    pub fn new(name: impl Into<String>, version: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: version.into(),
        }
    }

    /// Install directory name (`<name>-<version>`).
    pub fn dir_name(&self) -> String {
        format!("{}-{}", self.name, self.version)
    }
}

impl fmt::Display for ArtifactId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.version)
    }
}

/// How a dependency was classified.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DependencyClass {
    /// Provided by a library this system installed under the managed root.
    Managed,
    /// Provided by the operating system.
    System,
    /// Neither managed nor a recognized system library.
    Unknown,
}

impl DependencyClass {
    /// Upper-case label used in diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::Managed => "TSUKU_MANAGED",
            Self::System => "PURE_SYSTEM",
            Self::Unknown => "UNKNOWN",
        }
    }
}

impl fmt::Display for DependencyClass {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.label())
    }
}

/// One dependency as observed at install time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DependencySnapshot {
    /// Declared dependency name (soname or install name).
    pub soname: String,
    /// Classification at install time.
    pub class: DependencyClass,
    /// Name of the managed artifact that provided it, if `Managed`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub provider: Option<String>,
}

/// Install-time metadata for one verifiable file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LibraryMetadata {
    /// Path relative to the install directory.
    pub path: PathBuf,
    /// Soname (ELF `DT_SONAME`) or install name (Mach-O `LC_ID_DYLIB`).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub soname: Option<String>,
    /// Dynamic dependencies observed at install time.
    #[serde(default)]
    pub dependencies: Vec<DependencySnapshot>,
    /// Hex SHA-256 of the file content at install time.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum: Option<Sha256Hash>,
    /// Receipt schema this record was written with.
    #[serde(default = "default_schema_version")]
    pub schema_version: u32,
}

fn default_schema_version() -> u32 {
    SCHEMA_CHECKSUMS_ONLY
}

impl LibraryMetadata {
    /// Records written before dependency tracking carry no usable snapshot.
    pub fn is_legacy(&self) -> bool {
        self.schema_version < SCHEMA_DEPENDENCY_TRACKING
    }

    /// Name used in diagnostics: the soname if known, else the file name.
    pub fn display_name(&self) -> String {
        if let Some(soname) = &self.soname {
            return soname.rsplit('/').next().unwrap_or(soname).to_string();
        }
        self.path.file_name().map_or_else(
            || self.path.display().to_string(),
            |n| n.to_string_lossy().into_owned(),
        )
    }
}

/// The persisted record of one installed tool or library.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InstallReceipt {
    /// Artifact name
    pub name: String,
    /// Installed version
    pub version: String,
    /// Tool or library
    pub kind: ArtifactKind,
    /// Platform the artifact was installed for
    pub platform: Platform,
    /// Files subject to verification
    #[serde(default)]
    pub files: Vec<LibraryMetadata>,
    /// Names of managed artifacts this one needs at runtime
    #[serde(default)]
    pub runtime_dependencies: Vec<String>,
    /// RFC 3339 install timestamp, informational
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub installed_at: Option<String>,
}

impl InstallReceipt {
    /// Parse a receipt from JSON.
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error when the document is malformed.
    pub fn from_json(data: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(data)
    }

    /// Serialize to pretty JSON (used by fixtures and installers).
    ///
    /// # Errors
    ///
    /// Returns the `serde_json` error if serialization fails.
    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// The artifact identity.
    pub fn id(&self) -> ArtifactId {
        ArtifactId::new(&self.name, &self.version)
    }
}
