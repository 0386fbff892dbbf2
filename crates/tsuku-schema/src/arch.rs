//! Target platform description: CPU architecture, operating system and libc flavor.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// CPU architecture of a binary or host.
///
/// Header validation compares the architecture declared by an ELF `e_machine`
/// or Mach-O `cputype` field against the expected value.
///
/// # Example
///
/// ```
/// use tsuku_schema::Arch;
///
/// let arch: Arch = "amd64".parse().unwrap();
/// assert_eq!(arch, Arch::X86_64);
/// assert_eq!(arch.to_string(), "x86_64");
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Arch {
    /// 64-bit x86
    #[serde(alias = "amd64")]
    X86_64,
    /// 64-bit ARM (`aarch64`)
    #[serde(alias = "aarch64")]
    Arm64,
    /// 32-bit x86
    #[serde(alias = "386")]
    I386,
    /// 32-bit ARM
    Arm,
}

impl Arch {
    /// Architecture of the running process.
    pub fn current() -> Self {
        #[cfg(target_arch = "aarch64")]
        {
            Self::Arm64
        }
        #[cfg(target_arch = "x86")]
        {
            Self::I386
        }
        #[cfg(target_arch = "arm")]
        {
            Self::Arm
        }
        #[cfg(not(any(target_arch = "aarch64", target_arch = "x86", target_arch = "arm")))]
        {
            Self::X86_64
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::X86_64 => "x86_64",
            Self::Arm64 => "arm64",
            Self::I386 => "i386",
            Self::Arm => "arm",
        }
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Arch {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "x86_64" | "amd64" | "x64" => Ok(Self::X86_64),
            "arm64" | "aarch64" => Ok(Self::Arm64),
            "i386" | "i686" | "386" | "x86" => Ok(Self::I386),
            "arm" | "armv7" | "armhf" => Ok(Self::Arm),
            _ => Err(format!("Unknown architecture: {s}")),
        }
    }
}

/// Operating system family. Each maps to exactly one binary container format.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Os {
    /// Linux (ELF images)
    Linux,
    /// macOS (Mach-O images)
    #[serde(alias = "macos")]
    Darwin,
}

impl Os {
    /// Operating system of the running process.
    pub fn current() -> Self {
        if cfg!(target_os = "macos") {
            Self::Darwin
        } else {
            Self::Linux
        }
    }

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Linux => "linux",
            Self::Darwin => "darwin",
        }
    }
}

impl fmt::Display for Os {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The C runtime family a binary was linked against.
///
/// Visible on Linux through the `PT_INTERP` dynamic linker path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LibcFlavor {
    /// GNU C library
    Glibc,
    /// musl libc (Alpine and friends)
    Musl,
    /// The platform's only C runtime (libSystem on macOS)
    System,
}

impl LibcFlavor {
    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Glibc => "glibc",
            Self::Musl => "musl",
            Self::System => "system",
        }
    }

    /// Infer the flavor from a dynamic linker path such as
    /// `/lib/ld-musl-x86_64.so.1` or `/lib64/ld-linux-x86-64.so.2`.
    ///
    /// Returns `None` for interpreters that name neither family.
    pub fn from_interpreter(path: &str) -> Option<Self> {
        let name = path.rsplit('/').next().unwrap_or(path);
        if name.starts_with("ld-musl") {
            Some(Self::Musl)
        } else if name.starts_with("ld-linux") || name.starts_with("ld64.so") || name.starts_with("ld.so") {
            Some(Self::Glibc)
        } else if name == "dyld" {
            Some(Self::System)
        } else {
            None
        }
    }
}

impl fmt::Display for LibcFlavor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Linux distribution family, as accepted by `--target-family`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinuxFamily {
    /// Debian, Ubuntu
    Debian,
    /// RHEL, Fedora, Rocky
    Rhel,
    /// Arch Linux
    Arch,
    /// Alpine (musl)
    Alpine,
    /// openSUSE, SLES
    Suse,
}

impl LinuxFamily {
    /// All families, in display order.
    pub const ALL: [Self; 5] = [Self::Debian, Self::Rhel, Self::Arch, Self::Alpine, Self::Suse];

    /// Convert to string representation
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Debian => "debian",
            Self::Rhel => "rhel",
            Self::Arch => "arch",
            Self::Alpine => "alpine",
            Self::Suse => "suse",
        }
    }

    /// The libc flavor shipped by this family.
    pub fn libc(&self) -> LibcFlavor {
        match self {
            Self::Alpine => LibcFlavor::Musl,
            _ => LibcFlavor::Glibc,
        }
    }
}

impl fmt::Display for LinuxFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for LinuxFamily {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|f| f.as_str().eq_ignore_ascii_case(s))
            .ok_or_else(|| {
                let valid: Vec<_> = Self::ALL.iter().map(LinuxFamily::as_str).collect();
                format!(
                    "invalid target-family '{s}', must be one of: {}",
                    valid.join(", ")
                )
            })
    }
}

/// The platform an artifact is verified against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Platform {
    /// Operating system
    pub os: Os,
    /// CPU architecture
    pub arch: Arch,
    /// Expected C runtime
    pub libc: LibcFlavor,
}

impl Platform {
    /// Construct a platform from its parts.
    pub fn new(os: Os, arch: Arch, libc: LibcFlavor) -> Self {
        Self { os, arch, libc }
    }

    /// Apply a Linux family override. The result is always a Linux platform
    /// using the family's libc, keeping the architecture.
    pub fn with_family(self, family: LinuxFamily) -> Self {
        Self {
            os: Os::Linux,
            arch: self.arch,
            libc: family.libc(),
        }
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}/{} ({})", self.os, self.arch, self.libc)
    }
}
