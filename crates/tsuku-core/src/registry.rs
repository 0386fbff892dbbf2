//! Catalog of libraries the operating system is expected to provide.
//!
//! The built-in catalog is versioned. `$TSUKU_HOME/registry.toml` may extend
//! it with a newer revision without rebuilding:
//!
//! ```toml
//! version = 2
//!
//! [linux]
//! sonames = ["libselinux.so"]
//! paths = ["/usr/lib/x86_64-linux-musl/"]
//!
//! [darwin]
//! names = ["libsqlite3.dylib"]
//! ```
//!
//! An overlay older than the built-in revision is ignored.

use serde::Deserialize;
use std::path::Path;
use tsuku_schema::Os;

use crate::config::ConfigError;

/// Revision of the catalog compiled into this binary.
pub const BUILTIN_VERSION: u32 = 1;

const LINUX_SONAME_PREFIXES: &[&str] = &[
    "linux-vdso.so",
    "linux-gate.so",
    "ld-linux",
    "ld-musl",
    "libc.so",
    "libm.so",
    "libdl.so",
    "libpthread.so",
    "librt.so",
    "libresolv.so",
    "libnsl.so",
    "libcrypt.so",
    "libutil.so",
    "libmvec.so",
    "libgcc_s.so",
    "libstdc++.so",
    "libatomic.so",
    "libgomp.so",
];

// Most specific first.
const LINUX_PATH_PREFIXES: &[&str] = &[
    "/lib/x86_64-linux-gnu/",
    "/lib/aarch64-linux-gnu/",
    "/lib/i386-linux-gnu/",
    "/lib/arm-linux-gnueabihf/",
    "/usr/lib/x86_64-linux-gnu/",
    "/usr/lib/aarch64-linux-gnu/",
    "/usr/lib/i386-linux-gnu/",
    "/usr/lib/arm-linux-gnueabihf/",
    "/lib64/",
    "/lib32/",
    "/lib/",
    "/usr/lib64/",
    "/usr/lib/",
];

const DARWIN_NAMES: &[&str] = &[
    "libSystem.B.dylib",
    "libc++.1.dylib",
    "libc++abi.dylib",
    "libobjc.A.dylib",
    "libresolv.9.dylib",
    "libz.1.dylib",
    "libiconv.2.dylib",
    "libcharset.1.dylib",
];

const DARWIN_PATH_PREFIXES: &[&str] = &[
    "/usr/lib/",
    "/System/Library/Frameworks/",
    "/System/Library/PrivateFrameworks/",
    "/System/Library/",
];

/// Immutable for the duration of a run; share it behind an `Arc`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemLibraryRegistry {
    version: u32,
    linux_sonames: Vec<String>,
    linux_paths: Vec<String>,
    darwin_names: Vec<String>,
    darwin_paths: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(deny_unknown_fields)]
struct Overlay {
    version: u32,
    #[serde(default)]
    linux: LinuxOverlay,
    #[serde(default)]
    darwin: DarwinOverlay,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct LinuxOverlay {
    sonames: Vec<String>,
    paths: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct DarwinOverlay {
    names: Vec<String>,
    paths: Vec<String>,
}

fn owned(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| (*s).to_string()).collect()
}

impl Default for SystemLibraryRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

impl SystemLibraryRegistry {
    /// The catalog compiled into this binary.
    pub fn builtin() -> Self {
        Self {
            version: BUILTIN_VERSION,
            linux_sonames: owned(LINUX_SONAME_PREFIXES),
            linux_paths: owned(LINUX_PATH_PREFIXES),
            darwin_names: owned(DARWIN_NAMES),
            darwin_paths: owned(DARWIN_PATH_PREFIXES),
        }
    }

    /// An empty catalog, for tests that want every dependency unrecognized.
    pub fn empty() -> Self {
        Self {
            version: BUILTIN_VERSION,
            linux_sonames: Vec::new(),
            linux_paths: Vec::new(),
            darwin_names: Vec::new(),
            darwin_paths: Vec::new(),
        }
    }

    pub fn version(&self) -> u32 {
        self.version
    }

    /// Extend with the overlay at `path`, if one exists.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError`] when the overlay exists but cannot be read or
    /// parsed.
    pub fn with_overlay(self, path: &Path) -> Result<Self, ConfigError> {
        let content = match std::fs::read_to_string(path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(self),
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        let overlay: Overlay = toml::from_str(&content).map_err(|source| ConfigError::Parse {
            path: path.to_path_buf(),
            source,
        })?;
        Ok(self.merged(overlay, path))
    }

    fn merged(mut self, overlay: Overlay, origin: &Path) -> Self {
        if overlay.version < self.version {
            tracing::warn!(
                path = %origin.display(),
                overlay = overlay.version,
                builtin = self.version,
                "ignoring outdated system library overlay"
            );
            return self;
        }
        self.version = overlay.version;
        self.linux_sonames.extend(overlay.linux.sonames);
        self.linux_paths.extend(overlay.linux.paths);
        self.darwin_names.extend(overlay.darwin.names);
        self.darwin_paths.extend(overlay.darwin.paths);
        tracing::debug!(version = self.version, "applied system library overlay");
        self
    }

    /// Whether `name` (a soname, install name or absolute path) is provided
    /// by the operating system on `os`.
    pub fn is_system_library(&self, name: &str, os: Os) -> bool {
        match os {
            Os::Linux => {
                self.linux_sonames.iter().any(|p| name.starts_with(p.as_str()))
                    || self.linux_paths.iter().any(|p| name.starts_with(p.as_str()))
            }
            Os::Darwin => {
                let base = name.rsplit('/').next().unwrap_or(name);
                let named = self.darwin_names.iter().any(|n| {
                    n == name || (n == base && (name == base || name.starts_with("/usr/lib/")))
                });
                named || self.darwin_paths.iter().any(|p| name.starts_with(p.as_str()))
            }
        }
    }
}
