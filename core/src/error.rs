//! Error types for every concern in this crate.
//!
//! Each module gets its own `thiserror`-derived enum rather than one
//! crate-wide catch-all, mirroring how `symbolic-debuginfo` gives `elf.rs`
//! and `dwarf.rs` their own `ElfError`/`DwarfError` types.

use std::io;
use std::path::PathBuf;

use thiserror::Error;

/// Failures reading or decompressing raw bytes.
#[derive(Debug, Error)]
pub enum ReaderError {
    /// The underlying I/O operation failed.
    #[error("i/o error reading {0}")]
    Io(String, #[source] io::Error),
    /// A read ran past the end of the available bytes.
    #[error("read of {len} bytes at offset {offset:#x} exceeds {available} available")]
    OutOfBounds {
        /// Offset the read started at.
        offset: u64,
        /// Number of bytes requested.
        len: u64,
        /// Number of bytes actually available.
        available: u64,
    },
    /// A compressed section's header or payload could not be inflated.
    #[error("failed to decompress section: {0}")]
    Decompress(String),
}

/// Failures parsing or navigating an ELF object.
#[derive(Debug, Error)]
pub enum ElfError {
    /// The buffer does not start with the ELF magic.
    #[error("not an ELF object")]
    NotElf,
    /// A section, program header, or symbol table was truncated or
    /// otherwise malformed.
    #[error("truncated or malformed section: {0}")]
    TruncatedSection(String),
    /// `goblin` rejected the structure outright.
    #[error("malformed ELF structure: {0}")]
    Malformed(String),
    /// An I/O error while reading the backing file.
    #[error(transparent)]
    Reader(#[from] ReaderError),
}

/// Failures parsing DWARF call-frame or debugging information.
#[derive(Debug, Error)]
pub enum DwarfError {
    /// `gimli` reported that a CFI, abbrev, or info section was malformed.
    #[error("malformed DWARF data: {0}")]
    BadDwarf(#[source] gimli::Error),
    /// No FDE covers the requested program counter.
    #[error("no frame description entry covers pc {0:#x}")]
    NoFde(u64),
    /// The unit or DIE offset referenced does not exist.
    #[error("invalid debug_info reference at offset {0:#x}")]
    InvalidReference(usize),
}

impl From<gimli::Error> for DwarfError {
    fn from(err: gimli::Error) -> Self {
        DwarfError::BadDwarf(err)
    }
}

/// Failures attaching to, reading, or detaching from a process or core.
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The address is not covered by any loaded mapping.
    #[error("address {0:#x} is not mapped")]
    Unmapped(u64),
    /// Another handle already holds the live process attached.
    #[error("process {0} is already attached by another handle")]
    Busy(i32),
    /// An operation was attempted on a detached or exited process.
    #[error("process {0} has detached or exited")]
    Detached(i32),
    /// `ptrace`/`waitpid` or a `/proc` read failed.
    #[error("i/o error operating on process {pid}: {source}")]
    Io {
        /// The process id the operation targeted.
        pid: i32,
        /// The underlying error.
        #[source]
        source: io::Error,
    },
    /// The core file or `ELFCORE` note set could not be parsed.
    #[error("malformed core file {path:?}: {reason}")]
    BadCore {
        /// Path to the offending core file.
        path: PathBuf,
        /// Human-readable description of what was wrong.
        reason: String,
    },
    /// An ELF object backing the process could not be opened.
    #[error(transparent)]
    Elf(#[from] ElfError),
}

/// Failures unwinding a single thread's call stack.
#[derive(Debug, Error)]
pub enum UnwindError {
    /// No FDE/CFI program covers the current program counter; unwinding for
    /// this thread stops here but is not a fatal error for the caller.
    #[error("unwind information unavailable for pc {0:#x}")]
    NoUnwindInfo(u64),
    /// Reading a register or stack slot required by the CFI program failed.
    #[error(transparent)]
    Process(#[from] ProcessError),
    /// The CFI program itself was malformed.
    #[error(transparent)]
    Dwarf(#[from] DwarfError),
}
