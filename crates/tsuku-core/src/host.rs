//! Detection of the platform tsuku is running on.

use std::path::Path;
use tsuku_schema::{Arch, LibcFlavor, Os, Platform};

// Relative to the probed root.
const LOADER_DIRS: &[&str] = &["lib", "usr/lib", "lib64"];

/// The running host: OS and architecture from the build target, libc by
/// probing the filesystem.
pub fn detect() -> Platform {
    let os = Os::current();
    let libc = match os {
        Os::Darwin => LibcFlavor::System,
        Os::Linux => detect_linux_libc(Path::new("/")),
    };
    Platform::new(os, Arch::current(), libc)
}

/// A Linux host is musl-based when the musl dynamic loader is installed.
/// Glibc hosts may carry a musl loader too, so `ld-linux*` wins when both
/// exist.
pub fn detect_linux_libc(root: &Path) -> LibcFlavor {
    let mut musl = false;
    for dir in LOADER_DIRS {
        let Ok(entries) = std::fs::read_dir(root.join(dir)) else {
            continue;
        };
        for entry in entries.flatten() {
            let name = entry.file_name();
            let name = name.to_string_lossy();
            if name.starts_with("ld-linux") {
                return LibcFlavor::Glibc;
            }
            musl |= name.starts_with("ld-musl");
        }
    }
    if musl { LibcFlavor::Musl } else { LibcFlavor::Glibc }
}
