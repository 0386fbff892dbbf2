//! Tier 1: binary header validation.
//!
//! A format-sniffing step looks at the leading magic bytes and selects one
//! [`Container`] variant. Each variant owns the parser for its byte layout;
//! nothing outside this module reads untrusted binary structures.
//!
//! Files are memory-mapped read-only, and parsers only touch the pages they
//! need (headers, load commands, the dynamic segment and its string table).

mod elf;
mod macho;
mod reader;

use std::fmt;
use std::fs::File;
use std::path::Path;
use thiserror::Error;
use tsuku_schema::{Arch, Os, Platform};

use crate::verify::report::{Finding, FindingKind};

/// Why a header failed validation.
#[derive(Error, Debug)]
pub enum HeaderError {
    #[error("cannot read file: {0}")]
    Unreadable(#[from] std::io::Error),

    #[error("invalid {} magic number", family_name(.expected))]
    BadMagic { expected: Os },

    #[error("file is truncated")]
    Truncated,

    #[error("{0}")]
    Corrupted(String),

    #[error("file is {0}, not an executable or shared object")]
    NotLoadable(String),

    #[error("wrong architecture (expected {expected}, got {got})")]
    WrongArch { expected: Arch, got: String },
}

fn family_name(os: &Os) -> &'static str {
    match os {
        Os::Linux => "ELF",
        Os::Darwin => "Mach-O",
    }
}

impl HeaderError {
    /// Convert into the Tier 1 finding for `file`.
    pub fn into_finding(self, file: &Path) -> Finding {
        let kind = match self {
            Self::WrongArch { .. } => FindingKind::ArchitectureMismatch,
            _ => FindingKind::HeaderInvalid,
        };
        Finding::new(kind, format!("Header validation failed: {self}")).with_file(file)
    }
}

/// What kind of image the header declares.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ImageType {
    /// A program (ELF `ET_EXEC`, PIE `ET_DYN` with an interpreter, Mach-O `MH_EXECUTE`)
    Executable,
    /// A shared object (ELF `ET_DYN`, Mach-O `MH_DYLIB`)
    SharedObject,
    /// A Mach-O loadable bundle (`MH_BUNDLE`)
    Bundle,
}

impl fmt::Display for ImageType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Executable => "executable",
            Self::SharedObject => "shared object",
            Self::Bundle => "bundle",
        })
    }
}

/// Everything later tiers need from a validated header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BinaryInfo {
    /// Container format, e.g. `ELF64` or `Mach-O 64 (fat)`
    pub format: String,
    /// Declared architecture (already checked against the expected one)
    pub arch: Arch,
    /// Declared image type
    pub image: ImageType,
    /// ELF `DT_SONAME` or Mach-O `LC_ID_DYLIB` install name
    pub soname: Option<String>,
    /// Declared dynamic dependencies, in load order
    pub needed: Vec<String>,
    /// Run-time search path entries
    pub rpaths: Vec<String>,
    /// Requested dynamic linker
    pub interpreter: Option<String>,
}

/// The container families recognized by the sniffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Container {
    /// ELF, 32 or 64 bit, either byte order
    Elf,
    /// A single-architecture Mach-O image
    MachO,
    /// A Mach-O universal binary holding one image per architecture
    Fat,
    /// A `!<arch>` static archive
    Archive,
}

const ELF_MAGIC: [u8; 4] = [0x7f, b'E', b'L', b'F'];
const AR_MAGIC: &[u8; 8] = b"!<arch>\n";

impl Container {
    /// Identify the container from the leading bytes of a file.
    pub fn sniff(data: &[u8]) -> Option<Self> {
        if data.starts_with(AR_MAGIC) {
            return Some(Self::Archive);
        }
        let magic: [u8; 4] = data.get(..4)?.try_into().ok()?;
        match magic {
            ELF_MAGIC => Some(Self::Elf),
            m if macho::is_thin_magic(m) => Some(Self::MachO),
            m if macho::is_fat_magic(m) => Some(Self::Fat),
            _ => None,
        }
    }

    /// Operating system whose loader consumes this container.
    pub fn os(self) -> Os {
        match self {
            Self::Elf | Self::Archive => Os::Linux,
            Self::MachO | Self::Fat => Os::Darwin,
        }
    }

    /// Parse the image, checking architecture and image type.
    ///
    /// # Errors
    ///
    /// Returns a [`HeaderError`] describing the first problem found.
    pub fn parse(self, data: &[u8], expected: Arch) -> Result<BinaryInfo, HeaderError> {
        match self {
            Self::Elf => elf::parse(data, expected),
            Self::MachO => macho::parse_thin(data, expected),
            Self::Fat => macho::parse_fat(data, expected),
            Self::Archive => Err(HeaderError::NotLoadable("a static library archive".into())),
        }
    }
}

/// Parse an in-memory image against the expected platform.
///
/// # Errors
///
/// Returns a [`HeaderError`] when the image is not a well-formed executable or
/// shared object for `platform`.
pub fn inspect_bytes(data: &[u8], platform: &Platform) -> Result<BinaryInfo, HeaderError> {
    if data.len() < 4 {
        return Err(HeaderError::Truncated);
    }
    let container = Container::sniff(data)
        .filter(|c| c.os() == platform.os)
        .ok_or(HeaderError::BadMagic {
            expected: platform.os,
        })?;
    container.parse(data, platform.arch)
}

/// Validate the header of the file at `path` against the expected platform.
///
/// Symlinks are followed. The file is mapped read-only and never modified.
///
/// # Errors
///
/// Returns a [`HeaderError`] for unreadable, malformed, foreign or
/// wrong-architecture files.
pub fn validate(path: &Path, platform: &Platform) -> Result<BinaryInfo, HeaderError> {
    let file = File::open(path)?;
    let len = file.metadata()?.len();
    if len < 4 {
        return Err(HeaderError::Truncated);
    }

    // SAFETY: the mapping is read-only and lives only for this call. Installed
    // files are not expected to change underneath a verification run; a
    // concurrent truncation could at worst fault this read, not corrupt memory
    // we hand out, since nothing borrowed from the map escapes `inspect_bytes`.
    #[allow(unsafe_code)]
    let map = unsafe { memmap2::Mmap::map(&file)? };

    let info = inspect_bytes(&map, platform)?;
    tracing::debug!(
        path = %path.display(),
        format = %info.format,
        arch = %info.arch,
        image = %info.image,
        needed = info.needed.len(),
        "header ok"
    );
    Ok(info)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::fixtures::{ElfBuilder, MachOBuilder, fat_binary};
    use tsuku_schema::LibcFlavor;

    fn linux_x86() -> Platform {
        Platform::new(Os::Linux, Arch::X86_64, LibcFlavor::Glibc)
    }

    fn mac_arm() -> Platform {
        Platform::new(Os::Darwin, Arch::Arm64, LibcFlavor::System)
    }

    #[test]
    fn shared_object_parses_dependencies() {
        let image = ElfBuilder::shared_object(Arch::X86_64)
            .soname("libfoo.so.1")
            .needed("libc.so.6")
            .needed("libbar.so.2")
            .runpath("$ORIGIN/../lib")
            .build();
        let info = inspect_bytes(&image, &linux_x86()).unwrap();
        assert_eq!(info.image, ImageType::SharedObject);
        assert_eq!(info.soname.as_deref(), Some("libfoo.so.1"));
        assert_eq!(info.needed, ["libc.so.6", "libbar.so.2"]);
        assert_eq!(info.rpaths, ["$ORIGIN/../lib"]);
        assert_eq!(info.interpreter, None);
    }

    #[test]
    fn pie_executable_reports_interpreter() {
        let image = ElfBuilder::executable(Arch::X86_64)
            .interpreter("/lib64/ld-linux-x86-64.so.2")
            .needed("libc.so.6")
            .build();
        let info = inspect_bytes(&image, &linux_x86()).unwrap();
        assert_eq!(info.image, ImageType::Executable);
        assert_eq!(info.interpreter.as_deref(), Some("/lib64/ld-linux-x86-64.so.2"));
    }

    #[test]
    fn bad_magic_message() {
        let err = inspect_bytes(b"#!/bin/sh\necho hi\n", &linux_x86()).unwrap_err();
        assert_eq!(
            err.into_finding(Path::new("bin/tool")).message,
            "Header validation failed: invalid ELF magic number"
        );
    }

    #[test]
    fn wrong_architecture_message() {
        let image = ElfBuilder::shared_object(Arch::Arm64).build();
        let err = inspect_bytes(&image, &linux_x86()).unwrap_err();
        let finding = err.into_finding(Path::new("lib/libfoo.so"));
        assert_eq!(finding.kind, FindingKind::ArchitectureMismatch);
        assert_eq!(
            finding.message,
            "Header validation failed: wrong architecture (expected x86_64, got arm64)"
        );
    }

    #[test]
    fn macho_on_linux_is_bad_magic() {
        let image = MachOBuilder::dylib(Arch::X86_64).build();
        let err = inspect_bytes(&image, &linux_x86()).unwrap_err();
        assert!(matches!(err, HeaderError::BadMagic { expected: Os::Linux }));
    }

    #[test]
    fn static_archive_is_rejected() {
        let err = inspect_bytes(b"!<arch>\nfoo.o/          ", &linux_x86()).unwrap_err();
        assert!(matches!(err, HeaderError::NotLoadable(_)));
    }

    #[test]
    fn relocatable_object_is_not_loadable() {
        let image = ElfBuilder::shared_object(Arch::X86_64).elf_type(1).build();
        let err = inspect_bytes(&image, &linux_x86()).unwrap_err();
        assert!(matches!(err, HeaderError::NotLoadable(_)));
    }

    #[test]
    fn every_truncation_is_an_error_not_a_panic() {
        let image = ElfBuilder::executable(Arch::X86_64)
            .interpreter("/lib64/ld-linux-x86-64.so.2")
            .needed("libc.so.6")
            .soname("libx.so")
            .build();
        for len in 0..image.len() {
            let _ = inspect_bytes(&image[..len], &linux_x86());
        }
        let dylib = MachOBuilder::dylib(Arch::Arm64)
            .install_name("@rpath/libfoo.1.dylib")
            .load("/usr/lib/libSystem.B.dylib")
            .build();
        for len in 0..dylib.len() {
            let _ = inspect_bytes(&dylib[..len], &mac_arm());
        }
    }

    #[test]
    fn garbage_after_magic_never_panics() {
        let mut seed: u32 = 0x9e37_79b9;
        for _ in 0..256 {
            let mut data = ELF_MAGIC.to_vec();
            for _ in 0..128 {
                seed ^= seed << 13;
                seed ^= seed >> 17;
                seed ^= seed << 5;
                data.push(seed as u8);
            }
            let _ = inspect_bytes(&data, &linux_x86());
        }
    }

    #[test]
    fn macho_dylib_parses_load_commands() {
        let image = MachOBuilder::dylib(Arch::Arm64)
            .install_name("@rpath/libfoo.1.dylib")
            .load("/usr/lib/libSystem.B.dylib")
            .load("@rpath/libbar.2.dylib")
            .rpath("@loader_path/../lib")
            .build();
        let info = inspect_bytes(&image, &mac_arm()).unwrap();
        assert_eq!(info.image, ImageType::SharedObject);
        assert_eq!(info.soname.as_deref(), Some("@rpath/libfoo.1.dylib"));
        assert_eq!(info.needed, ["/usr/lib/libSystem.B.dylib", "@rpath/libbar.2.dylib"]);
        assert_eq!(info.rpaths, ["@loader_path/../lib"]);
    }

    #[test]
    fn fat_binary_selects_matching_slice() {
        let x86 = MachOBuilder::dylib(Arch::X86_64).install_name("x86").build();
        let arm = MachOBuilder::dylib(Arch::Arm64).install_name("arm").build();
        let fat = fat_binary(&[(Arch::X86_64, &x86), (Arch::Arm64, &arm)]);

        let info = inspect_bytes(&fat, &mac_arm()).unwrap();
        assert_eq!(info.soname.as_deref(), Some("arm"));
        assert!(info.format.contains("fat"));
    }

    #[test]
    fn fat_binary_without_matching_slice() {
        let x86 = MachOBuilder::dylib(Arch::X86_64).build();
        let fat = fat_binary(&[(Arch::X86_64, &x86)]);
        let err = inspect_bytes(&fat, &mac_arm()).unwrap_err();
        assert!(matches!(err, HeaderError::WrongArch { .. }));
        assert!(err.to_string().contains("expected arm64, got x86_64"));
    }

    #[test]
    fn java_class_file_is_not_fat() {
        // CAFEBABE followed by a class-file version, not a slice count.
        let data = [0xca, 0xfe, 0xba, 0xbe, 0x00, 0x00, 0x00, 0x34, 0, 0, 0, 0];
        let err = inspect_bytes(&data, &mac_arm()).unwrap_err();
        assert!(matches!(err, HeaderError::Corrupted(_)));
    }

    #[test]
    fn validate_reads_from_disk() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("libfoo.so.1");
        std::fs::write(&path, ElfBuilder::shared_object(Arch::X86_64).build()).unwrap();
        assert!(validate(&path, &linux_x86()).is_ok());

        let empty = dir.path().join("empty.so");
        std::fs::write(&empty, b"").unwrap();
        assert!(matches!(validate(&empty, &linux_x86()), Err(HeaderError::Truncated)));

        let missing = dir.path().join("missing.so");
        assert!(matches!(validate(&missing, &linux_x86()), Err(HeaderError::Unreadable(_))));
    }
}
