//! Installed state: receipts found under the managed root.

use std::cmp::Ordering;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tsuku_schema::{ArtifactId, ArtifactKind, InstallReceipt, LibraryMetadata, RECEIPT_FILE};
use walkdir::WalkDir;

use crate::paths::TsukuHome;

#[derive(Error, Debug)]
pub enum StateError {
    #[error("Failed to read {}: {source}", .path.display())]
    Read {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Invalid receipt {}: {source}", .path.display())]
    Parse {
        path: PathBuf,
        source: serde_json::Error,
    },

    #[error("Receipt {} describes {found}, but its directory is {expected}", .path.display())]
    Mismatch {
        path: PathBuf,
        found: String,
        expected: String,
    },
}

/// A receipt together with the directory it was found in.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InstalledArtifact {
    pub receipt: InstallReceipt,
    /// Absolute install directory
    pub dir: PathBuf,
}

impl InstalledArtifact {
    /// Read and check the receipt in `dir`, which must be a direct child of
    /// the directory for `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`StateError`] when the receipt is unreadable, malformed, or
    /// disagrees with its location.
    pub fn load(dir: &Path, kind: ArtifactKind) -> Result<Self, StateError> {
        let path = dir.join(RECEIPT_FILE);
        let content = std::fs::read_to_string(&path).map_err(|source| StateError::Read {
            path: path.clone(),
            source,
        })?;
        let receipt = InstallReceipt::from_json(&content).map_err(|source| StateError::Parse {
            path: path.clone(),
            source,
        })?;

        let dir_name = dir
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let id = receipt.id();
        if receipt.kind != kind || id.dir_name() != dir_name {
            return Err(StateError::Mismatch {
                path,
                found: format!("{} {id}", receipt.kind),
                expected: format!("{}/{dir_name}", kind.dir_name()),
            });
        }

        Ok(Self {
            receipt,
            dir: dir.to_path_buf(),
        })
    }

    pub fn id(&self) -> ArtifactId {
        self.receipt.id()
    }

    pub fn name(&self) -> &str {
        &self.receipt.name
    }

    pub fn kind(&self) -> ArtifactKind {
        self.receipt.kind
    }

    pub fn files(&self) -> &[LibraryMetadata] {
        &self.receipt.files
    }

    /// Absolute path of a recorded file.
    pub fn file_path(&self, file: &LibraryMetadata) -> PathBuf {
        self.dir.join(&file.path)
    }
}

/// Order two version strings: semver when both parse, lexical otherwise.
pub fn compare_versions(a: &str, b: &str) -> Ordering {
    match (semver::Version::parse(a), semver::Version::parse(b)) {
        (Ok(a), Ok(b)) => a.cmp(&b),
        _ => a.cmp(b),
    }
}

/// Every artifact under a managed root.
#[derive(Debug, Clone)]
pub struct InstallState {
    home: TsukuHome,
    artifacts: Vec<InstalledArtifact>,
}

impl InstallState {
    /// Scan `tools/` and `libs/` for receipts.
    ///
    /// Directories without a receipt are ignored. Broken receipts are logged
    /// and skipped so the rest of the root stays verifiable.
    pub fn load(home: &TsukuHome) -> Self {
        let mut artifacts = Vec::new();
        for kind in [ArtifactKind::Tool, ArtifactKind::Library] {
            let root = home.kind_dir(kind);
            if !root.is_dir() {
                continue;
            }
            let entries = WalkDir::new(&root)
                .min_depth(1)
                .max_depth(1)
                .sort_by_file_name()
                .into_iter()
                .filter_map(Result::ok)
                .filter(|e| e.file_type().is_dir());

            for entry in entries {
                let dir = entry.path();
                if !dir.join(RECEIPT_FILE).is_file() {
                    tracing::debug!(dir = %dir.display(), "no receipt, skipping");
                    continue;
                }
                match InstalledArtifact::load(dir, kind) {
                    Ok(artifact) => artifacts.push(artifact),
                    Err(e) => tracing::warn!("skipping install directory: {e}"),
                }
            }
        }
        tracing::debug!(count = artifacts.len(), root = %home.root().display(), "loaded install state");
        Self::from_artifacts(home.clone(), artifacts)
    }

    /// Build from already-loaded artifacts.
    pub fn from_artifacts(home: TsukuHome, mut artifacts: Vec<InstalledArtifact>) -> Self {
        artifacts.sort_by(|a, b| {
            a.receipt
                .name
                .cmp(&b.receipt.name)
                .then_with(|| compare_versions(&a.receipt.version, &b.receipt.version))
        });
        Self { home, artifacts }
    }

    pub fn home(&self) -> &TsukuHome {
        &self.home
    }

    pub fn artifacts(&self) -> &[InstalledArtifact] {
        &self.artifacts
    }

    pub fn get(&self, id: &ArtifactId) -> Option<&InstalledArtifact> {
        self.artifacts
            .iter()
            .find(|a| a.receipt.name == id.name && a.receipt.version == id.version)
    }

    /// Resolve `name` at `version`, or its highest installed version.
    pub fn find(&self, name: &str, version: Option<&str>) -> Option<&InstalledArtifact> {
        let mut candidates = self.artifacts.iter().filter(|a| a.receipt.name == name);
        match version {
            Some(v) => candidates.find(|a| a.receipt.version == v),
            None => candidates.max_by(|a, b| compare_versions(&a.receipt.version, &b.receipt.version)),
        }
    }

    /// Parse `name` or `name@version` and resolve it.
    pub fn resolve_spec(&self, spec: &str) -> Option<&InstalledArtifact> {
        match spec.split_once('@') {
            Some((name, version)) if !version.is_empty() => self.find(name, Some(version)),
            _ => self.find(spec.trim_end_matches('@'), None),
        }
    }

    /// Directories holding managed library files, for the loader search path.
    pub fn library_dirs(&self) -> Vec<PathBuf> {
        let mut dirs: Vec<PathBuf> = Vec::new();
        for artifact in self.artifacts.iter().filter(|a| a.kind() == ArtifactKind::Library) {
            for file in artifact.files() {
                let path = artifact.file_path(file);
                let Some(parent) = path.parent() else {
                    continue;
                };
                if !dirs.iter().any(|d| d == parent) {
                    dirs.push(parent.to_path_buf());
                }
            }
        }
        dirs
    }
}

/// Where a managed soname lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SonameEntry {
    pub artifact: ArtifactId,
    /// Absolute path of the providing file
    pub path: PathBuf,
}

/// Soname to providing artifact, built once per run from every receipt.
#[derive(Debug, Clone, Default)]
pub struct SonameIndex {
    entries: HashMap<String, SonameEntry>,
}

fn basename(name: &str) -> &str {
    name.rsplit('/').next().unwrap_or(name)
}

impl SonameIndex {
    /// Index every recorded soname, as written and by basename. The first
    /// artifact in name/version order wins a collision.
    pub fn build(state: &InstallState) -> Self {
        let mut entries = HashMap::new();
        for artifact in state.artifacts() {
            for file in artifact.files() {
                let Some(soname) = file.soname.as_deref() else {
                    continue;
                };
                let entry = SonameEntry {
                    artifact: artifact.id(),
                    path: artifact.file_path(file),
                };
                entries
                    .entry(basename(soname).to_string())
                    .or_insert_with(|| entry.clone());
                entries.entry(soname.to_string()).or_insert(entry);
            }
        }
        Self { entries }
    }

    /// Look up a declared dependency: exact name first, then basename.
    pub fn lookup(&self, name: &str) -> Option<&SonameEntry> {
        self.entries
            .get(name)
            .or_else(|| self.entries.get(basename(name)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ElfBuilder, FixtureFile, InstallFixture};
    use tsuku_schema::{Arch, LibcFlavor, Os, Platform};

    fn linux() -> Platform {
        Platform::new(Os::Linux, Arch::X86_64, LibcFlavor::Glibc)
    }

    fn lib(name: &str, version: &str, soname: &str) -> InstallFixture {
        InstallFixture::library(name, version, linux()).file(
            FixtureFile::new(
                format!("lib/{soname}"),
                ElfBuilder::shared_object(Arch::X86_64).soname(soname).build(),
            )
            .soname(soname),
        )
    }

    #[test]
    fn loads_receipts_and_indexes_sonames() {
        let dir = tempfile::tempdir().unwrap();
        lib("libfoo", "1.0.0", "libfoo.so.1").write(dir.path()).unwrap();
        lib("zlib", "1.3.1", "libz.so.1").write(dir.path()).unwrap();
        std::fs::create_dir_all(dir.path().join("tools/stray")).unwrap();

        let state = InstallState::load(&TsukuHome::new(dir.path()));
        assert_eq!(state.artifacts().len(), 2);

        let index = SonameIndex::build(&state);
        let entry = index.lookup("libz.so.1").unwrap();
        assert_eq!(entry.artifact, ArtifactId::new("zlib", "1.3.1"));
        assert!(entry.path.ends_with("libs/zlib-1.3.1/lib/libz.so.1"));
        assert!(index.lookup("/some/where/libfoo.so.1").is_some());
        assert!(index.lookup("libbar.so.2").is_none());
    }

    #[test]
    fn highest_version_wins_without_explicit_version() {
        let dir = tempfile::tempdir().unwrap();
        for v in ["1.9.0", "1.10.0", "1.2.0"] {
            lib("libfoo", v, "libfoo.so.1").write(dir.path()).unwrap();
        }
        let state = InstallState::load(&TsukuHome::new(dir.path()));
        assert_eq!(state.find("libfoo", None).unwrap().receipt.version, "1.10.0");
        assert_eq!(state.resolve_spec("libfoo@1.2.0").unwrap().receipt.version, "1.2.0");
        assert!(state.resolve_spec("libfoo@3.0.0").is_none());
    }

    #[test]
    fn broken_and_misplaced_receipts_are_skipped() {
        let dir = tempfile::tempdir().unwrap();
        lib("libfoo", "1.0.0", "libfoo.so.1").write(dir.path()).unwrap();

        let broken = dir.path().join("libs/libbad-1.0.0");
        std::fs::create_dir_all(&broken).unwrap();
        std::fs::write(broken.join(RECEIPT_FILE), "{ not json").unwrap();

        let good = dir.path().join("libs/libfoo-1.0.0");
        let moved = dir.path().join("libs/libfoo-2.0.0");
        std::fs::create_dir_all(&moved).unwrap();
        std::fs::copy(good.join(RECEIPT_FILE), moved.join(RECEIPT_FILE)).unwrap();

        let state = InstallState::load(&TsukuHome::new(dir.path()));
        assert_eq!(state.artifacts().len(), 1);
        assert!(matches!(
            InstalledArtifact::load(&moved, ArtifactKind::Library),
            Err(StateError::Mismatch { .. })
        ));
        assert!(matches!(
            InstalledArtifact::load(&broken, ArtifactKind::Library),
            Err(StateError::Parse { .. })
        ));
    }

    #[test]
    fn version_ordering() {
        assert_eq!(compare_versions("1.10.0", "1.9.0"), Ordering::Greater);
        assert_eq!(compare_versions("2024b", "2024a"), Ordering::Greater);
    }

    #[test]
    fn library_dirs_are_deduplicated() {
        let dir = tempfile::tempdir().unwrap();
        InstallFixture::library("multi", "1.0.0", linux())
            .file(FixtureFile::new("lib/liba.so.1", vec![0; 8]))
            .file(FixtureFile::new("lib/libb.so.1", vec![1; 8]))
            .write(dir.path())
            .unwrap();
        let state = InstallState::load(&TsukuHome::new(dir.path()));
        assert_eq!(state.library_dirs().len(), 1);
    }
}
