//! Architecture and endianness types shared by the ELF/DWARF readers and the
//! process/unwinder layer.

use std::fmt;

/// Names for x86_64 CPU registers by DWARF register number.
static X86_64: &[&str] = &[
    "rax", "rdx", "rcx", "rbx", "rsi", "rdi", "rbp", "rsp", "r8", "r9", "r10", "r11", "r12", "r13",
    "r14", "r15", "rip",
];

/// Names for 64-bit ARM CPU registers by DWARF register number.
static ARM64: &[&str] = &[
    "x0", "x1", "x2", "x3", "x4", "x5", "x6", "x7", "x8", "x9", "x10", "x11", "x12", "x13", "x14",
    "x15", "x16", "x17", "x18", "x19", "x20", "x21", "x22", "x23", "x24", "x25", "x26", "x27",
    "x28", "x29", "x30", "sp",
];

/// A family of CPUs sharing a pointer size, register file and DWARF register
/// numbering.
///
/// Only the families this crate actually unwinds are represented; unlike the
/// object-file ecosystem this is grounded on, there is no MIPS/PPC/32-bit ARM
/// support here, since the unwinder and process layer only target Linux on
/// x86_64 and aarch64.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum CpuFamily {
    /// Any CPU family not explicitly supported.
    Unknown,
    /// 64-bit little-endian `x86_64`/`amd64`.
    Amd64,
    /// 64-bit little-endian ARM (ARMv8-A and later).
    Arm64,
}

impl CpuFamily {
    /// Returns the native pointer size in bytes, or `None` if unknown.
    pub fn pointer_size(self) -> Option<usize> {
        match self {
            CpuFamily::Amd64 | CpuFamily::Arm64 => Some(8),
            CpuFamily::Unknown => None,
        }
    }

    /// Returns the DWARF CFA register number used for the return address
    /// column (the "instruction pointer" register) on this family.
    pub fn ip_register_num(self) -> Option<u16> {
        match self {
            CpuFamily::Amd64 => Some(16),
            CpuFamily::Arm64 => Some(30),
            CpuFamily::Unknown => None,
        }
    }

    /// Returns the DWARF register number for the stack pointer.
    pub fn sp_register_num(self) -> Option<u16> {
        match self {
            CpuFamily::Amd64 => Some(7),
            CpuFamily::Arm64 => Some(31),
            CpuFamily::Unknown => None,
        }
    }

    /// Returns the name of a DWARF-numbered register, if known.
    pub fn register_name(self, register: u16) -> Option<&'static str> {
        let names: &[&str] = match self {
            CpuFamily::Amd64 => X86_64,
            CpuFamily::Arm64 => ARM64,
            CpuFamily::Unknown => return None,
        };
        names.get(register as usize).copied().filter(|s| !s.is_empty())
    }
}

/// A specific CPU architecture, as identified by an ELF `e_machine` value.
#[non_exhaustive]
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub enum Arch {
    /// Unknown or unsupported machine type.
    Unknown,
    /// `EM_X86_64`.
    Amd64,
    /// `EM_AARCH64`.
    Arm64,
}

impl Arch {
    /// Constructs an `Arch` from an ELF `e_machine` value.
    pub fn from_elf_machine(machine: u16) -> Arch {
        match machine {
            goblin_em::X86_64 => Arch::Amd64,
            goblin_em::AARCH64 => Arch::Arm64,
            _ => Arch::Unknown,
        }
    }

    /// Returns the CPU family this architecture belongs to.
    pub fn cpu_family(self) -> CpuFamily {
        match self {
            Arch::Amd64 => CpuFamily::Amd64,
            Arch::Arm64 => CpuFamily::Arm64,
            Arch::Unknown => CpuFamily::Unknown,
        }
    }

    /// Returns the native pointer size in bytes, or `None` if unknown.
    pub fn pointer_size(self) -> Option<usize> {
        self.cpu_family().pointer_size()
    }
}

impl fmt::Display for Arch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Arch::Amd64 => "x86_64",
            Arch::Arm64 => "arm64",
            Arch::Unknown => "unknown",
        };
        f.write_str(name)
    }
}

/// Byte order of a binary or memory image.
///
/// Every architecture this crate supports is little-endian in practice, but
/// the ELF and DWARF readers are written generically against this type
/// rather than assuming one, mirroring how the format itself encodes an
/// explicit `EI_DATA`/initial-length byte-order marker.
#[derive(Clone, Copy, Debug, Eq, Hash, PartialEq)]
pub enum Endianness {
    /// Least-significant byte first.
    Little,
    /// Most-significant byte first.
    Big,
}

impl Endianness {
    /// Returns the endianness of the host this code is compiled for.
    pub const fn native() -> Endianness {
        #[cfg(target_endian = "little")]
        {
            Endianness::Little
        }
        #[cfg(target_endian = "big")]
        {
            Endianness::Big
        }
    }
}

/// Re-exports the subset of `goblin`'s `e_machine` constants this crate
/// cares about, so `Arch::from_elf_machine` does not need a hard dependency
/// on `goblin` from this crate.
mod goblin_em {
    pub const X86_64: u16 = 62;
    pub const AARCH64: u16 = 183;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn amd64_register_names() {
        let family = Arch::Amd64.cpu_family();
        assert_eq!(family.register_name(7), Some("rsp"));
        assert_eq!(family.register_name(16), Some("rip"));
        assert_eq!(family.ip_register_num(), Some(16));
    }

    #[test]
    fn arm64_register_names() {
        let family = Arch::Arm64.cpu_family();
        assert_eq!(family.register_name(31), Some("sp"));
        assert_eq!(family.ip_register_num(), Some(30));
    }

    #[test]
    fn unknown_machine_is_unknown_arch() {
        assert_eq!(Arch::from_elf_machine(0), Arch::Unknown);
        assert_eq!(Arch::Unknown.pointer_size(), None);
    }

    #[test]
    fn from_elf_machine_matches_known_constants() {
        assert_eq!(Arch::from_elf_machine(62), Arch::Amd64);
        assert_eq!(Arch::from_elf_machine(183), Arch::Arm64);
    }
}
