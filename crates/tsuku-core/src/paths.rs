use dirs::home_dir;
use std::path::{Path, PathBuf};
use tsuku_schema::{ArtifactId, ArtifactKind};

/// Environment variable overriding the managed root.
pub const HOME_ENV: &str = "TSUKU_HOME";

/// Returns the managed root, or None if the user's home cannot be resolved.
pub fn try_tsuku_home() -> Option<PathBuf> {
    if let Some(val) = std::env::var_os(HOME_ENV).filter(|v| !v.is_empty()) {
        return Some(PathBuf::from(val));
    }
    home_dir().map(|h| h.join(".tsuku"))
}

/// Layout of a managed root (`~/.tsuku` by default).
///
/// ```text
/// $TSUKU_HOME/
/// ├── tools/<name>-<version>/   # installed tools
/// ├── libs/<name>-<version>/    # installed shared libraries
/// ├── config.toml               # optional settings
/// └── registry.toml             # optional system library overlay
/// ```
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TsukuHome {
    root: PathBuf,
}

impl TsukuHome {
    /// Wrap an explicit root directory.
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Resolve from `$TSUKU_HOME` or `~/.tsuku`.
    pub fn discover() -> Option<Self> {
        try_tsuku_home().map(Self::new)
    }

    /// The root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Installed tools: $TSUKU_HOME/tools
    pub fn tools_dir(&self) -> PathBuf {
        self.root.join("tools")
    }

    /// Installed libraries: $TSUKU_HOME/libs
    pub fn libs_dir(&self) -> PathBuf {
        self.root.join("libs")
    }

    /// Directory holding artifacts of `kind`.
    pub fn kind_dir(&self, kind: ArtifactKind) -> PathBuf {
        self.root.join(kind.dir_name())
    }

    /// Install directory of one artifact.
    pub fn artifact_dir(&self, kind: ArtifactKind, id: &ArtifactId) -> PathBuf {
        self.kind_dir(kind).join(id.dir_name())
    }

    /// Settings file: $TSUKU_HOME/config.toml
    pub fn config_file(&self) -> PathBuf {
        self.root.join("config.toml")
    }

    /// System library overlay: $TSUKU_HOME/registry.toml
    pub fn registry_file(&self) -> PathBuf {
        self.root.join("registry.toml")
    }
}
