//! Mach-O parsing: thin images and universal (fat) containers.

use super::reader::{Endian, Reader, to_usize};
use super::{BinaryInfo, HeaderError, ImageType};
use tsuku_schema::Arch;

const MH_MAGIC: u32 = 0xfeed_face;
const MH_MAGIC_64: u32 = 0xfeed_facf;
const FAT_MAGIC: u32 = 0xcafe_babe;
const FAT_MAGIC_64: u32 = 0xcafe_babf;

const CPU_ARCH_ABI64: u32 = 0x0100_0000;
const CPU_TYPE_X86: u32 = 7;
const CPU_TYPE_ARM: u32 = 12;
const CPU_TYPE_X86_64: u32 = CPU_TYPE_X86 | CPU_ARCH_ABI64;
const CPU_TYPE_ARM64: u32 = CPU_TYPE_ARM | CPU_ARCH_ABI64;

const MH_OBJECT: u32 = 0x1;
const MH_EXECUTE: u32 = 0x2;
const MH_CORE: u32 = 0x4;
const MH_DYLIB: u32 = 0x6;
const MH_BUNDLE: u32 = 0x8;

const LC_REQ_DYLD: u32 = 0x8000_0000;
const LC_LOAD_DYLIB: u32 = 0xc;
const LC_ID_DYLIB: u32 = 0xd;
const LC_LOAD_DYLINKER: u32 = 0xe;
const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;

/// Class-file major versions start at 45, so a real universal binary never
/// declares this many slices.
const MAX_FAT_ARCHS: u32 = 30;

pub(super) fn is_thin_magic(magic: [u8; 4]) -> bool {
    let le = u32::from_le_bytes(magic);
    let be = u32::from_be_bytes(magic);
    matches!(le, MH_MAGIC | MH_MAGIC_64) || matches!(be, MH_MAGIC | MH_MAGIC_64)
}

pub(super) fn is_fat_magic(magic: [u8; 4]) -> bool {
    matches!(u32::from_be_bytes(magic), FAT_MAGIC | FAT_MAGIC_64)
}

fn cpu_arch(cputype: u32) -> Option<Arch> {
    match cputype {
        CPU_TYPE_X86_64 => Some(Arch::X86_64),
        CPU_TYPE_ARM64 => Some(Arch::Arm64),
        CPU_TYPE_X86 => Some(Arch::I386),
        CPU_TYPE_ARM => Some(Arch::Arm),
        _ => None,
    }
}

fn describe_cpu(cputype: u32) -> String {
    cpu_arch(cputype).map_or_else(|| format!("cputype {cputype:#x}"), |a| a.to_string())
}

pub(super) fn parse_thin(data: &[u8], expected: Arch) -> Result<BinaryInfo, HeaderError> {
    let head: [u8; 4] = data
        .get(..4)
        .and_then(|b| b.try_into().ok())
        .ok_or(HeaderError::Truncated)?;
    let (endian, is_64) = match (u32::from_le_bytes(head), u32::from_be_bytes(head)) {
        (MH_MAGIC_64, _) => (Endian::Little, true),
        (MH_MAGIC, _) => (Endian::Little, false),
        (_, MH_MAGIC_64) => (Endian::Big, true),
        (_, MH_MAGIC) => (Endian::Big, false),
        _ => return Err(HeaderError::Corrupted("invalid Mach-O magic number".into())),
    };
    let r = Reader::new(data, endian);

    let cputype = r.u32(4)?;
    let filetype = r.u32(12)?;
    let ncmds = r.u32(16)?;
    let sizeofcmds = to_usize(u64::from(r.u32(20)?))?;
    let header_size = if is_64 { 32 } else { 28 };

    let arch = cpu_arch(cputype).ok_or_else(|| HeaderError::WrongArch {
        expected,
        got: describe_cpu(cputype),
    })?;
    if arch != expected {
        return Err(HeaderError::WrongArch {
            expected,
            got: arch.to_string(),
        });
    }

    let image = match filetype {
        MH_EXECUTE => ImageType::Executable,
        MH_DYLIB => ImageType::SharedObject,
        MH_BUNDLE => ImageType::Bundle,
        MH_OBJECT => return Err(HeaderError::NotLoadable("a relocatable object".into())),
        MH_CORE => return Err(HeaderError::NotLoadable("a core dump".into())),
        other => return Err(HeaderError::NotLoadable(format!("Mach-O file type {other:#x}"))),
    };

    // The whole command area must be present before any command is read.
    r.bytes(header_size, sizeofcmds)?;
    // Each command is at least 8 bytes, which bounds a hostile ncmds.
    if u64::from(ncmds) * 8 > sizeofcmds as u64 {
        return Err(HeaderError::Corrupted(format!(
            "{ncmds} load commands cannot fit in {sizeofcmds} bytes"
        )));
    }

    let mut info = BinaryInfo {
        format: if is_64 { "Mach-O 64" } else { "Mach-O 32" }.to_string(),
        arch,
        image,
        soname: None,
        needed: Vec::new(),
        rpaths: Vec::new(),
        interpreter: None,
    };

    let end = header_size + sizeofcmds;
    let mut offset = header_size;
    for _ in 0..ncmds {
        if offset + 8 > end {
            return Err(HeaderError::Corrupted("load command overruns command area".into()));
        }
        let cmd = r.u32(offset)?;
        let cmdsize = to_usize(u64::from(r.u32(offset + 4)?))?;
        if cmdsize < 8 || offset + cmdsize > end {
            return Err(HeaderError::Corrupted(format!("bad load command size {cmdsize}")));
        }

        match cmd {
            LC_LOAD_DYLIB | LC_LOAD_WEAK_DYLIB | LC_REEXPORT_DYLIB | LC_LAZY_LOAD_DYLIB
            | LC_LOAD_UPWARD_DYLIB => info.needed.push(lc_str(&r, offset, cmdsize)?),
            LC_ID_DYLIB => info.soname = Some(lc_str(&r, offset, cmdsize)?),
            LC_RPATH => info.rpaths.push(lc_str(&r, offset, cmdsize)?),
            LC_LOAD_DYLINKER => info.interpreter = Some(lc_str(&r, offset, cmdsize)?),
            _ => {}
        }
        offset += cmdsize;
    }

    Ok(info)
}

/// Read the `lc_str` that dylib, rpath and dylinker commands carry at +8.
fn lc_str(r: &Reader<'_>, cmd_offset: usize, cmdsize: usize) -> Result<String, HeaderError> {
    let name_offset = to_usize(u64::from(r.u32(cmd_offset + 8)?))?;
    if name_offset < 12 || name_offset >= cmdsize {
        return Err(HeaderError::Corrupted("load command string offset out of range".into()));
    }
    r.c_str(cmd_offset + name_offset, cmdsize - name_offset)
}

pub(super) fn parse_fat(data: &[u8], expected: Arch) -> Result<BinaryInfo, HeaderError> {
    let r = Reader::new(data, Endian::Big);
    let is_64 = r.u32(0)? == FAT_MAGIC_64;
    let nfat = r.u32(4)?;
    if nfat == 0 || nfat > MAX_FAT_ARCHS {
        return Err(HeaderError::Corrupted(format!(
            "implausible universal binary slice count {nfat}"
        )));
    }
    let entry_size = if is_64 { 32 } else { 20 };

    let mut available = Vec::new();
    for i in 0..nfat as usize {
        let base = 8 + i * entry_size;
        let cputype = r.u32(base)?;
        if cpu_arch(cputype) != Some(expected) {
            available.push(describe_cpu(cputype));
            continue;
        }
        let (offset, size) = if is_64 {
            (r.u64(base + 8)?, r.u64(base + 16)?)
        } else {
            (u64::from(r.u32(base + 8)?), u64::from(r.u32(base + 12)?))
        };
        let slice = r.bytes(to_usize(offset)?, to_usize(size)?)?;
        let head: [u8; 4] = slice
            .get(..4)
            .and_then(|b| b.try_into().ok())
            .ok_or(HeaderError::Truncated)?;
        if !is_thin_magic(head) {
            return Err(HeaderError::Corrupted(format!(
                "universal slice for {expected} is not a Mach-O image"
            )));
        }
        let mut info = parse_thin(slice, expected)?;
        info.format.push_str(" (fat)");
        return Ok(info);
    }

    Err(HeaderError::WrongArch {
        expected,
        got: available.join(", "),
    })
}
