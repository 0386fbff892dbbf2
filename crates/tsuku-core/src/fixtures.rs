//! Synthetic binaries and managed-root layouts for tests.
//!
//! The builders emit the smallest images the header parsers accept: a
//! 64-bit little-endian ELF with one `PT_LOAD` covering the file, and a
//! 64-bit little-endian Mach-O with the requested load commands. They are
//! not runnable.

use std::path::{Path, PathBuf};

use tsuku_schema::{
    Arch, ArtifactKind, CURRENT_SCHEMA_VERSION, DependencyClass, DependencySnapshot,
    InstallReceipt, LibraryMetadata, Platform, RECEIPT_FILE, SCHEMA_CHECKSUMS_ONLY, Sha256Digest,
    Sha256Hash,
};

use crate::paths::TsukuHome;

const ELF_BASE: u64 = 0x1000;

fn elf_machine(arch: Arch) -> u16 {
    match arch {
        Arch::X86_64 => 62,
        Arch::Arm64 => 183,
        Arch::I386 => 3,
        Arch::Arm => 40,
    }
}

/// Builder for minimal ELF64 images.
#[derive(Debug, Clone)]
pub struct ElfBuilder {
    machine: u16,
    e_type: u16,
    interpreter: Option<String>,
    soname: Option<String>,
    needed: Vec<String>,
    rpath: Option<String>,
    runpath: Option<String>,
}

impl ElfBuilder {
    /// An `ET_DYN` image without interpreter.
    pub fn shared_object(arch: Arch) -> Self {
        Self {
            machine: elf_machine(arch),
            e_type: 3,
            interpreter: None,
            soname: None,
            needed: Vec::new(),
            rpath: None,
            runpath: None,
        }
    }

    /// An `ET_DYN` image intended to carry an interpreter (PIE).
    pub fn executable(arch: Arch) -> Self {
        Self::shared_object(arch)
    }

    /// Override `e_type`.
    pub fn elf_type(mut self, e_type: u16) -> Self {
        self.e_type = e_type;
        self
    }

    /// Override `e_machine` with a raw value.
    pub fn machine(mut self, machine: u16) -> Self {
        self.machine = machine;
        self
    }

    /// Set `PT_INTERP`.
    pub fn interpreter(mut self, path: &str) -> Self {
        self.interpreter = Some(path.to_string());
        self
    }

    /// Set `DT_SONAME`.
    pub fn soname(mut self, soname: &str) -> Self {
        self.soname = Some(soname.to_string());
        self
    }

    /// Append a `DT_NEEDED` entry.
    pub fn needed(mut self, soname: &str) -> Self {
        self.needed.push(soname.to_string());
        self
    }

    /// Set `DT_RPATH`.
    pub fn rpath(mut self, rpath: &str) -> Self {
        self.rpath = Some(rpath.to_string());
        self
    }

    /// Set `DT_RUNPATH`.
    pub fn runpath(mut self, runpath: &str) -> Self {
        self.runpath = Some(runpath.to_string());
        self
    }

    /// Emit the image.
    pub fn build(&self) -> Vec<u8> {
        let mut dynstr = vec![0u8];
        let mut intern = |s: &str| -> u64 {
            let idx = dynstr.len() as u64;
            dynstr.extend_from_slice(s.as_bytes());
            dynstr.push(0);
            idx
        };

        let mut dyn_entries: Vec<(u64, u64)> = Vec::new();
        for n in &self.needed {
            dyn_entries.push((1, intern(n)));
        }
        if let Some(s) = &self.soname {
            dyn_entries.push((14, intern(s)));
        }
        if let Some(s) = &self.rpath {
            dyn_entries.push((15, intern(s)));
        }
        if let Some(s) = &self.runpath {
            dyn_entries.push((29, intern(s)));
        }
        let has_dynamic = !dyn_entries.is_empty();

        let phnum = 1 + usize::from(self.interpreter.is_some()) + usize::from(has_dynamic);
        let mut offset = 64 + phnum * 56;

        let interp_off = offset;
        let interp_bytes = self
            .interpreter
            .as_ref()
            .map(|i| {
                let mut b = i.as_bytes().to_vec();
                b.push(0);
                b
            })
            .unwrap_or_default();
        offset += interp_bytes.len();

        let strtab_off = offset;
        offset += dynstr.len();
        offset = offset.next_multiple_of(8);

        let dyn_off = offset;
        if has_dynamic {
            dyn_entries.push((5, ELF_BASE + strtab_off as u64));
            dyn_entries.push((10, dynstr.len() as u64));
            dyn_entries.push((0, 0));
        }
        let dyn_len = if has_dynamic { dyn_entries.len() * 16 } else { 0 };
        let total = dyn_off + dyn_len;

        let mut out = vec![0u8; total];
        out[..4].copy_from_slice(&[0x7f, b'E', b'L', b'F']);
        out[4] = 2;
        out[5] = 1;
        out[6] = 1;
        out[16..18].copy_from_slice(&self.e_type.to_le_bytes());
        out[18..20].copy_from_slice(&self.machine.to_le_bytes());
        out[20..24].copy_from_slice(&1u32.to_le_bytes());
        out[32..40].copy_from_slice(&64u64.to_le_bytes());
        out[52..54].copy_from_slice(&64u16.to_le_bytes());
        out[54..56].copy_from_slice(&56u16.to_le_bytes());
        out[56..58].copy_from_slice(&(phnum as u16).to_le_bytes());

        let mut ph = 64;
        let mut put_phdr = |out: &mut Vec<u8>, kind: u32, off: usize, len: usize| {
            out[ph..ph + 4].copy_from_slice(&kind.to_le_bytes());
            out[ph + 4..ph + 8].copy_from_slice(&4u32.to_le_bytes());
            out[ph + 8..ph + 16].copy_from_slice(&(off as u64).to_le_bytes());
            out[ph + 16..ph + 24].copy_from_slice(&(ELF_BASE + off as u64).to_le_bytes());
            out[ph + 24..ph + 32].copy_from_slice(&(ELF_BASE + off as u64).to_le_bytes());
            out[ph + 32..ph + 40].copy_from_slice(&(len as u64).to_le_bytes());
            out[ph + 40..ph + 48].copy_from_slice(&(len as u64).to_le_bytes());
            ph += 56;
        };
        put_phdr(&mut out, 1, 0, total);
        if self.interpreter.is_some() {
            put_phdr(&mut out, 3, interp_off, interp_bytes.len());
        }
        if has_dynamic {
            put_phdr(&mut out, 2, dyn_off, dyn_len);
        }

        out[interp_off..interp_off + interp_bytes.len()].copy_from_slice(&interp_bytes);
        out[strtab_off..strtab_off + dynstr.len()].copy_from_slice(&dynstr);
        for (i, (tag, val)) in dyn_entries.iter().enumerate() {
            let at = dyn_off + i * 16;
            out[at..at + 8].copy_from_slice(&tag.to_le_bytes());
            out[at + 8..at + 16].copy_from_slice(&val.to_le_bytes());
        }
        out
    }

    /// Locate the value word of the first dynamic entry with `tag` in an
    /// image produced by [`ElfBuilder::build`]. Returns its file offset and
    /// current value.
    pub fn dynamic_value_offset(image: &[u8], tag: u64) -> Option<(usize, u64)> {
        let read_u64 = |at: usize| -> Option<u64> {
            Some(u64::from_le_bytes(image.get(at..at + 8)?.try_into().ok()?))
        };
        let phnum = usize::from(u16::from_le_bytes(image.get(56..58)?.try_into().ok()?));
        let dynamic = (0..phnum).map(|i| 64 + i * 56).find(|&ph| {
            image
                .get(ph..ph + 4)
                .is_some_and(|b| u32::from_le_bytes([b[0], b[1], b[2], b[3]]) == 2)
        })?;
        let start = usize::try_from(read_u64(dynamic + 8)?).ok()?;
        let len = usize::try_from(read_u64(dynamic + 32)?).ok()?;
        (start..start + len).step_by(16).find_map(|at| {
            if read_u64(at)? == tag {
                Some((at + 8, read_u64(at + 8)?))
            } else {
                None
            }
        })
    }
}

fn macho_cpu(arch: Arch) -> (u32, u32) {
    match arch {
        Arch::X86_64 => (0x0100_0007, 3),
        Arch::Arm64 => (0x0100_000c, 0),
        Arch::I386 => (7, 3),
        Arch::Arm => (12, 9),
    }
}

/// Builder for minimal 64-bit Mach-O images.
#[derive(Debug, Clone)]
pub struct MachOBuilder {
    arch: Arch,
    filetype: u32,
    commands: Vec<(u32, String)>,
}

impl MachOBuilder {
    /// An `MH_DYLIB` image.
    pub fn dylib(arch: Arch) -> Self {
        Self {
            arch,
            filetype: 0x6,
            commands: Vec::new(),
        }
    }

    /// An `MH_EXECUTE` image.
    pub fn executable(arch: Arch) -> Self {
        Self {
            filetype: 0x2,
            ..Self::dylib(arch)
        }
    }

    /// Add `LC_ID_DYLIB`.
    pub fn install_name(mut self, name: &str) -> Self {
        self.commands.push((0xd, name.to_string()));
        self
    }

    /// Add `LC_LOAD_DYLIB`.
    pub fn load(mut self, name: &str) -> Self {
        self.commands.push((0xc, name.to_string()));
        self
    }

    /// Add `LC_LOAD_WEAK_DYLIB`.
    pub fn weak_load(mut self, name: &str) -> Self {
        self.commands.push((0x8000_0018, name.to_string()));
        self
    }

    /// Add `LC_RPATH`.
    pub fn rpath(mut self, path: &str) -> Self {
        self.commands.push((0x8000_001c, path.to_string()));
        self
    }

    /// Add `LC_LOAD_DYLINKER`.
    pub fn dylinker(mut self, path: &str) -> Self {
        self.commands.push((0xe, path.to_string()));
        self
    }

    /// Emit the image.
    pub fn build(&self) -> Vec<u8> {
        let mut cmds = Vec::new();
        for (cmd, text) in &self.commands {
            // dylib_command carries timestamp and versions before the name
            let name_offset: usize = match cmd {
                0x8000_001c | 0xe => 12,
                _ => 24,
            };
            let cmdsize = (name_offset + text.len() + 1).next_multiple_of(8);
            let mut c = vec![0u8; cmdsize];
            c[0..4].copy_from_slice(&cmd.to_le_bytes());
            c[4..8].copy_from_slice(&(cmdsize as u32).to_le_bytes());
            c[8..12].copy_from_slice(&(name_offset as u32).to_le_bytes());
            c[name_offset..name_offset + text.len()].copy_from_slice(text.as_bytes());
            cmds.extend_from_slice(&c);
        }

        let (cputype, subtype) = macho_cpu(self.arch);
        let mut out = Vec::with_capacity(32 + cmds.len());
        out.extend_from_slice(&0xfeed_facfu32.to_le_bytes());
        out.extend_from_slice(&cputype.to_le_bytes());
        out.extend_from_slice(&subtype.to_le_bytes());
        out.extend_from_slice(&self.filetype.to_le_bytes());
        out.extend_from_slice(&(self.commands.len() as u32).to_le_bytes());
        out.extend_from_slice(&(cmds.len() as u32).to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&0u32.to_le_bytes());
        out.extend_from_slice(&cmds);
        out
    }
}

/// Wrap thin Mach-O images into a universal binary.
pub fn fat_binary(slices: &[(Arch, &[u8])]) -> Vec<u8> {
    const ALIGN: usize = 4096;
    let mut out = Vec::new();
    out.extend_from_slice(&0xcafe_babeu32.to_be_bytes());
    out.extend_from_slice(&(slices.len() as u32).to_be_bytes());

    let mut offset = (8 + slices.len() * 20).next_multiple_of(ALIGN);
    let mut placed = Vec::new();
    for (arch, image) in slices {
        let (cputype, subtype) = macho_cpu(*arch);
        out.extend_from_slice(&cputype.to_be_bytes());
        out.extend_from_slice(&subtype.to_be_bytes());
        out.extend_from_slice(&(offset as u32).to_be_bytes());
        out.extend_from_slice(&(image.len() as u32).to_be_bytes());
        out.extend_from_slice(&12u32.to_be_bytes());
        placed.push((offset, *image));
        offset = (offset + image.len()).next_multiple_of(ALIGN);
    }
    for (at, image) in placed {
        out.resize(at, 0);
        out.extend_from_slice(image);
    }
    out
}

/// One file in an [`InstallFixture`].
#[derive(Debug, Clone)]
pub struct FixtureFile {
    path: PathBuf,
    bytes: Vec<u8>,
    soname: Option<String>,
    dependencies: Vec<DependencySnapshot>,
    checksum: ChecksumMode,
    schema_version: u32,
    executable: bool,
}

#[derive(Debug, Clone)]
enum ChecksumMode {
    Computed,
    Fixed(String),
    Absent,
}

impl FixtureFile {
    /// A file at `path` (relative to the install dir) with `bytes` content.
    pub fn new(path: impl Into<PathBuf>, bytes: Vec<u8>) -> Self {
        Self {
            path: path.into(),
            bytes,
            soname: None,
            dependencies: Vec::new(),
            checksum: ChecksumMode::Computed,
            schema_version: CURRENT_SCHEMA_VERSION,
            executable: false,
        }
    }

    /// Record a soname.
    pub fn soname(mut self, soname: &str) -> Self {
        self.soname = Some(soname.to_string());
        self
    }

    /// Snapshot a dependency provided by managed artifact `provider`.
    pub fn managed_dep(mut self, soname: &str, provider: &str) -> Self {
        self.dependencies.push(DependencySnapshot {
            soname: soname.to_string(),
            class: DependencyClass::Managed,
            provider: Some(provider.to_string()),
        });
        self
    }

    /// Snapshot a system dependency.
    pub fn system_dep(mut self, soname: &str) -> Self {
        self.dependencies.push(DependencySnapshot {
            soname: soname.to_string(),
            class: DependencyClass::System,
            provider: None,
        });
        self
    }

    /// Snapshot a dependency that was unknown at install time.
    pub fn unknown_dep(mut self, soname: &str) -> Self {
        self.dependencies.push(DependencySnapshot {
            soname: soname.to_string(),
            class: DependencyClass::Unknown,
            provider: None,
        });
        self
    }

    /// Record a specific checksum instead of the real one.
    pub fn checksum(mut self, hex: &str) -> Self {
        self.checksum = ChecksumMode::Fixed(hex.to_string());
        self
    }

    /// Record no checksum.
    pub fn no_checksum(mut self) -> Self {
        self.checksum = ChecksumMode::Absent;
        self
    }

    /// Mark as written by a pre-dependency-tracking installer.
    pub fn legacy(mut self) -> Self {
        self.schema_version = SCHEMA_CHECKSUMS_ONLY;
        self.dependencies.clear();
        self
    }

    /// Set the execute bit when written.
    pub fn executable(mut self) -> Self {
        self.executable = true;
        self
    }
}

/// Builder for one installed artifact under a managed root.
#[derive(Debug, Clone)]
pub struct InstallFixture {
    kind: ArtifactKind,
    name: String,
    version: String,
    platform: Platform,
    files: Vec<FixtureFile>,
    runtime_dependencies: Vec<String>,
}

impl InstallFixture {
    /// A library installed under `libs/`.
    pub fn library(name: &str, version: &str, platform: Platform) -> Self {
        Self {
            kind: ArtifactKind::Library,
            name: name.to_string(),
            version: version.to_string(),
            platform,
            files: Vec::new(),
            runtime_dependencies: Vec::new(),
        }
    }

    /// A tool installed under `tools/`.
    pub fn tool(name: &str, version: &str, platform: Platform) -> Self {
        Self {
            kind: ArtifactKind::Tool,
            ..Self::library(name, version, platform)
        }
    }

    /// Add a verifiable file.
    pub fn file(mut self, file: FixtureFile) -> Self {
        self.files.push(file);
        self
    }

    /// Declare a runtime dependency on another managed artifact.
    pub fn runtime_dep(mut self, name: &str) -> Self {
        self.runtime_dependencies.push(name.to_string());
        self
    }

    /// Write files and receipt below `home`, returning the install directory.
    ///
    /// # Errors
    ///
    /// Returns any I/O error from creating the layout.
    pub fn write(self, home: &Path) -> std::io::Result<PathBuf> {
        let home = TsukuHome::new(home);
        let id = tsuku_schema::ArtifactId::new(&self.name, &self.version);
        let dir = home.artifact_dir(self.kind, &id);

        let mut records = Vec::new();
        for f in self.files {
            let target = dir.join(&f.path);
            if let Some(parent) = target.parent() {
                std::fs::create_dir_all(parent)?;
            }
            std::fs::write(&target, &f.bytes)?;
            if f.executable {
                set_executable(&target)?;
            }
            let checksum = match f.checksum {
                ChecksumMode::Computed => Some(Sha256Hash::from(Sha256Digest::compute(&f.bytes))),
                ChecksumMode::Fixed(hex) => Some(Sha256Hash::new(hex)),
                ChecksumMode::Absent => None,
            };
            records.push(LibraryMetadata {
                path: f.path,
                soname: f.soname,
                dependencies: f.dependencies,
                checksum,
                schema_version: f.schema_version,
            });
        }

        let receipt = InstallReceipt {
            name: self.name,
            version: self.version,
            kind: self.kind,
            platform: self.platform,
            files: records,
            runtime_dependencies: self.runtime_dependencies,
            installed_at: None,
        };
        std::fs::create_dir_all(&dir)?;
        let json = receipt.to_json().map_err(std::io::Error::other)?;
        std::fs::write(dir.join(RECEIPT_FILE), json)?;
        Ok(dir)
    }
}

#[cfg(unix)]
fn set_executable(path: &Path) -> std::io::Result<()> {
    use std::os::unix::fs::PermissionsExt;
    let mut perms = std::fs::metadata(path)?.permissions();
    perms.set_mode(0o755);
    std::fs::set_permissions(path, perms)
}

#[cfg(not(unix))]
fn set_executable(_: &Path) -> std::io::Result<()> {
    Ok(())
}
