//! ELF parsing: file header, program headers, and the dynamic segment.
//!
//! Dynamic information is read through program headers only, so stripped
//! images without section headers still parse. `DT_STRTAB` holds a virtual
//! address, which is mapped back to a file offset through the `PT_LOAD`
//! segments.

use super::reader::{Endian, Reader, to_usize};
use super::{BinaryInfo, HeaderError, ImageType};
use tsuku_schema::Arch;

// ── Identification ───────────────────────────────────────────────────────────

const EI_CLASS: usize = 4;
const EI_DATA: usize = 5;
const EI_VERSION: usize = 6;

const ELFCLASS32: u8 = 1;
const ELFCLASS64: u8 = 2;
const ELFDATA2LSB: u8 = 1;
const ELFDATA2MSB: u8 = 2;
const EV_CURRENT: u8 = 1;

// ── Object types ─────────────────────────────────────────────────────────────

const ET_REL: u16 = 1;
const ET_EXEC: u16 = 2;
const ET_DYN: u16 = 3;
const ET_CORE: u16 = 4;

// ── Machines ─────────────────────────────────────────────────────────────────

const EM_386: u16 = 3;
const EM_ARM: u16 = 40;
const EM_X86_64: u16 = 62;
const EM_AARCH64: u16 = 183;

// ── Program headers ──────────────────────────────────────────────────────────

const PT_LOAD: u32 = 1;
const PT_DYNAMIC: u32 = 2;
const PT_INTERP: u32 = 3;

/// Upper bound on program headers; real images have a few dozen at most.
const MAX_PHNUM: usize = 4096;

// ── Dynamic tags ─────────────────────────────────────────────────────────────

const DT_NULL: u64 = 0;
const DT_NEEDED: u64 = 1;
const DT_STRTAB: u64 = 5;
const DT_STRSZ: u64 = 10;
const DT_SONAME: u64 = 14;
const DT_RPATH: u64 = 15;
const DT_RUNPATH: u64 = 29;

/// Longest string accepted from the dynamic string table.
const MAX_DYNSTR: usize = 4096;

fn machine_arch(machine: u16) -> Option<Arch> {
    match machine {
        EM_X86_64 => Some(Arch::X86_64),
        EM_AARCH64 => Some(Arch::Arm64),
        EM_386 => Some(Arch::I386),
        EM_ARM => Some(Arch::Arm),
        _ => None,
    }
}

/// Field offsets that differ between ELFCLASS32 and ELFCLASS64.
struct Layout {
    is_64: bool,
    ehdr_size: usize,
    phoff: usize,
    phentsize: usize,
    phnum: usize,
    ph_size: usize,
    p_offset: usize,
    p_vaddr: usize,
    p_filesz: usize,
    dyn_size: usize,
}

const LAYOUT_64: Layout = Layout {
    is_64: true,
    ehdr_size: 64,
    phoff: 32,
    phentsize: 54,
    phnum: 56,
    ph_size: 56,
    p_offset: 8,
    p_vaddr: 16,
    p_filesz: 32,
    dyn_size: 16,
};

const LAYOUT_32: Layout = Layout {
    is_64: false,
    ehdr_size: 52,
    phoff: 28,
    phentsize: 42,
    phnum: 44,
    ph_size: 32,
    p_offset: 4,
    p_vaddr: 8,
    p_filesz: 16,
    dyn_size: 8,
};

#[derive(Debug, Clone, Copy)]
struct Segment {
    kind: u32,
    offset: u64,
    vaddr: u64,
    filesz: u64,
}

pub(super) fn parse(data: &[u8], expected: Arch) -> Result<BinaryInfo, HeaderError> {
    let ident = data.get(..16).ok_or(HeaderError::Truncated)?;
    let layout = match ident[EI_CLASS] {
        ELFCLASS64 => &LAYOUT_64,
        ELFCLASS32 => &LAYOUT_32,
        other => return Err(HeaderError::Corrupted(format!("unknown ELF class {other}"))),
    };
    let endian = match ident[EI_DATA] {
        ELFDATA2LSB => Endian::Little,
        ELFDATA2MSB => Endian::Big,
        other => return Err(HeaderError::Corrupted(format!("unknown ELF data encoding {other}"))),
    };
    if ident[EI_VERSION] != EV_CURRENT {
        return Err(HeaderError::Corrupted(format!(
            "unsupported ELF version {}",
            ident[EI_VERSION]
        )));
    }

    let r = Reader::new(data, endian);
    if r.len() < layout.ehdr_size {
        return Err(HeaderError::Truncated);
    }

    let e_type = r.u16(16)?;
    let e_machine = r.u16(18)?;

    let arch = machine_arch(e_machine).ok_or_else(|| HeaderError::WrongArch {
        expected,
        got: format!("e_machine {e_machine}"),
    })?;
    if arch != expected {
        return Err(HeaderError::WrongArch {
            expected,
            got: arch.to_string(),
        });
    }

    match e_type {
        ET_EXEC | ET_DYN => {}
        ET_REL => return Err(HeaderError::NotLoadable("a relocatable object".into())),
        ET_CORE => return Err(HeaderError::NotLoadable("a core dump".into())),
        other => return Err(HeaderError::NotLoadable(format!("ELF type {other}"))),
    }

    let segments = program_headers(&r, layout)?;

    let interpreter = segments
        .iter()
        .find(|s| s.kind == PT_INTERP)
        .map(|s| {
            let offset = to_usize(s.offset)?;
            let size = to_usize(s.filesz)?;
            r.c_str(offset, size)
        })
        .transpose()?;

    let dynamic = match segments.iter().find(|s| s.kind == PT_DYNAMIC) {
        Some(seg) => read_dynamic(&r, layout, seg, &segments)?,
        None => Dynamic::default(),
    };

    let image = match e_type {
        ET_EXEC => ImageType::Executable,
        // A PIE carries an interpreter but no soname. Shared objects that
        // are also runnable (libc itself) keep their soname.
        _ if interpreter.is_some() && dynamic.soname.is_none() => ImageType::Executable,
        _ => ImageType::SharedObject,
    };

    // DT_RUNPATH wins over the deprecated DT_RPATH when both are present.
    let search = dynamic.runpath.or(dynamic.rpath).unwrap_or_default();
    let rpaths = search
        .split(':')
        .filter(|p| !p.is_empty())
        .map(str::to_string)
        .collect();

    Ok(BinaryInfo {
        format: if layout.is_64 { "ELF64" } else { "ELF32" }.to_string(),
        arch,
        image,
        soname: dynamic.soname,
        needed: dynamic.needed,
        rpaths,
        interpreter,
    })
}

fn program_headers(r: &Reader<'_>, layout: &Layout) -> Result<Vec<Segment>, HeaderError> {
    let phoff = to_usize(r.word(layout.phoff, layout.is_64)?)?;
    let phentsize = usize::from(r.u16(layout.phentsize)?);
    let phnum = usize::from(r.u16(layout.phnum)?);

    if phnum == 0 {
        return Ok(Vec::new());
    }
    if phnum > MAX_PHNUM {
        return Err(HeaderError::Corrupted(format!("implausible program header count {phnum}")));
    }
    if phentsize < layout.ph_size {
        return Err(HeaderError::Corrupted(format!(
            "program header entry size {phentsize} is too small"
        )));
    }

    let mut segments = Vec::with_capacity(phnum);
    for i in 0..phnum {
        let base = i
            .checked_mul(phentsize)
            .and_then(|off| off.checked_add(phoff))
            .ok_or(HeaderError::Truncated)?;
        segments.push(Segment {
            kind: r.u32(base)?,
            offset: r.word(base + layout.p_offset, layout.is_64)?,
            vaddr: r.word(base + layout.p_vaddr, layout.is_64)?,
            filesz: r.word(base + layout.p_filesz, layout.is_64)?,
        });
    }
    Ok(segments)
}

#[derive(Debug, Default)]
struct Dynamic {
    needed: Vec<String>,
    soname: Option<String>,
    rpath: Option<String>,
    runpath: Option<String>,
}

fn vaddr_to_offset(segments: &[Segment], vaddr: u64) -> Option<u64> {
    segments
        .iter()
        .filter(|s| s.kind == PT_LOAD)
        .find(|s| vaddr >= s.vaddr && vaddr - s.vaddr < s.filesz)
        .and_then(|s| s.offset.checked_add(vaddr - s.vaddr))
}

fn read_dynamic(
    r: &Reader<'_>,
    layout: &Layout,
    seg: &Segment,
    segments: &[Segment],
) -> Result<Dynamic, HeaderError> {
    let start = to_usize(seg.offset)?;
    let size = to_usize(seg.filesz)?;
    // Bounds check the whole segment once before walking it.
    r.bytes(start, size)?;

    let word = layout.dyn_size / 2;
    let mut tags: Vec<(u64, u64)> = Vec::new();
    let mut cursor = 0;
    while cursor + layout.dyn_size <= size {
        let tag = r.word(start + cursor, layout.is_64)?;
        let val = r.word(start + cursor + word, layout.is_64)?;
        if tag == DT_NULL {
            break;
        }
        tags.push((tag, val));
        cursor += layout.dyn_size;
    }

    let strtab_vaddr = tags.iter().find(|(t, _)| *t == DT_STRTAB).map(|(_, v)| *v);
    let strsz = tags
        .iter()
        .find(|(t, _)| *t == DT_STRSZ)
        .map_or(Ok(usize::MAX), |(_, v)| to_usize(*v))?;

    let wants_strings = tags
        .iter()
        .any(|(t, _)| matches!(*t, DT_NEEDED | DT_SONAME | DT_RPATH | DT_RUNPATH));
    if !wants_strings {
        return Ok(Dynamic::default());
    }

    let strtab_vaddr = strtab_vaddr
        .ok_or_else(|| HeaderError::Corrupted("dynamic segment has no string table".into()))?;
    let strtab = vaddr_to_offset(segments, strtab_vaddr)
        .ok_or_else(|| HeaderError::Corrupted("string table lies outside loadable segments".into()))
        .and_then(to_usize)?;

    let lookup = |index: u64| -> Result<String, HeaderError> {
        let index = to_usize(index)?;
        if index >= strsz {
            return Err(HeaderError::Corrupted("string index past end of string table".into()));
        }
        let offset = strtab.checked_add(index).ok_or(HeaderError::Truncated)?;
        r.c_str(offset, (strsz - index).min(MAX_DYNSTR))
    };

    let mut dynamic = Dynamic::default();
    for (tag, val) in tags {
        match tag {
            DT_NEEDED => dynamic.needed.push(lookup(val)?),
            DT_SONAME => dynamic.soname = Some(lookup(val)?),
            DT_RPATH => dynamic.rpath = Some(lookup(val)?),
            DT_RUNPATH => dynamic.runpath = Some(lookup(val)?),
            _ => {}
        }
    }
    Ok(dynamic)
}
