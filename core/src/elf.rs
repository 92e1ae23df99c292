//! The ELF object model: headers, symbol tables, the SysV hash accelerator,
//! and `.gnu_debuglink` debug-companion discovery.
//!
//! Parsing is staged the way `goblin`/`symbolic-debuginfo` do it: the ELF
//! header is parsed first, then program headers, then section headers and
//! symbol tables, each independently fallible. A partially-parsed object
//! (e.g. one with readable headers but a truncated symbol table) is kept
//! rather than rejected outright, with [`ElfObject::is_malformed`] reporting
//! the degraded state — stripped or corrupted binaries are the normal case
//! for a tool that inspects post-mortem cores, not the exception.

use std::fmt;
use std::path::{Path, PathBuf};

use debugid::DebugId;
use goblin::container::{Container, Ctx};
use goblin::elf::{self, Elf};
use scroll::Pread;
use uuid::Uuid;

use elfstack_common::{Arch, AsSelf, SelfCell};

use crate::error::ElfError;
use crate::reader::{decompress_zlib, Reader};

const PAGE_SIZE: usize = 4096;
const SHF_COMPRESSED: u64 = elf::section_header::SHF_COMPRESSED as u64;
const UUID_SIZE: usize = 16;

/// A single symbol-table entry, rebased to image-relative addresses.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Symbol<'data> {
    /// Demangled or raw symbol name, if present.
    pub name: Option<&'data str>,
    /// Address of the symbol relative to the start of the image (i.e. after
    /// subtracting the preferred load address).
    pub address: u64,
    /// Size in bytes, `0` if unknown.
    pub size: u64,
}

/// An ordered, binary-searchable view of an object's symbols.
///
/// Symbols are sorted by address and deduplicated exactly like
/// `symbolic_debuginfo::base::SymbolMap`: when two symbols share an address,
/// the one with the larger declared size wins, since a size-0 alias is
/// usually a linker-generated label rather than the function itself.
#[derive(Clone, Debug, Default)]
pub struct SymbolMap<'data> {
    symbols: Vec<Symbol<'data>>,
}

impl<'data> SymbolMap<'data> {
    fn from_vec(mut symbols: Vec<Symbol<'data>>) -> Self {
        dmsort::sort_by_key(&mut symbols, |s| s.address);
        symbols.dedup_by(|next, prev| {
            if next.address != prev.address {
                return false;
            }
            if next.size > prev.size {
                std::mem::swap(prev, next);
            }
            true
        });
        SymbolMap { symbols }
    }

    /// Number of unique symbols.
    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    /// Returns `true` if there are no symbols.
    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Finds the symbol whose `[address, address + size)` range contains
    /// `addr`, falling back to the nearest symbol at or below `addr` when
    /// sizes are unknown (`size == 0`), matching how `pstack`-style tools
    /// resolve addresses in stripped code.
    pub fn lookup(&self, addr: u64) -> Option<&Symbol<'data>> {
        let idx = match self.symbols.binary_search_by_key(&addr, |s| s.address) {
            Ok(idx) => idx,
            Err(0) => return None,
            Err(idx) => idx - 1,
        };
        let symbol = &self.symbols[idx];
        if symbol.size == 0 || addr < symbol.address + symbol.size {
            Some(symbol)
        } else {
            None
        }
    }

    /// Iterates symbols in address order.
    pub fn iter(&self) -> impl Iterator<Item = &Symbol<'data>> {
        self.symbols.iter()
    }
}

impl<'data> FromIterator<Symbol<'data>> for SymbolMap<'data> {
    fn from_iter<T: IntoIterator<Item = Symbol<'data>>>(iter: T) -> Self {
        SymbolMap::from_vec(iter.into_iter().collect())
    }
}

/// Parsed `.gnu_debuglink` contents: the companion file name and its CRC32.
#[derive(Clone, Debug)]
pub struct DebugLink<'data> {
    filename: &'data std::ffi::CStr,
    crc: u32,
}

impl<'data> DebugLink<'data> {
    fn parse(data: &'data [u8]) -> Result<Self, ElfError> {
        let nul = data
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| ElfError::TruncatedSection("gnu_debuglink: missing NUL".into()))?;
        let filename = std::ffi::CStr::from_bytes_with_nul(&data[..=nul])
            .map_err(|e| ElfError::TruncatedSection(format!("gnu_debuglink: {e}")))?;

        // The filename is NUL-padded to the next 4-byte boundary, followed by
        // a little-endian CRC32 of the companion file.
        let crc_offset = (nul + 1 + 3) & !3;
        let crc_bytes = data
            .get(crc_offset..crc_offset + 4)
            .ok_or_else(|| ElfError::TruncatedSection("gnu_debuglink: missing crc".into()))?;
        let crc = u32::from_le_bytes(crc_bytes.try_into().unwrap());

        Ok(DebugLink { filename, crc })
    }

    /// The companion file's base name, to be searched for alongside the
    /// original binary, in `.debug/`, and under `/usr/lib/debug/`.
    pub fn filename(&self) -> &'data std::ffi::CStr {
        self.filename
    }

    /// CRC32 the companion file is expected to match.
    pub fn crc(&self) -> u32 {
        self.crc
    }
}

/// Candidate paths to search for a `.gnu_debuglink`-named companion image,
/// in GDB's own separate-debug-file search order: alongside the original
/// file, under a `.debug/` subdirectory next to it, and under `debug_root`
/// with the original file's own directory appended.
pub fn debug_companion_candidates(own_path: &Path, link_name: &str, debug_root: &Path) -> Vec<PathBuf> {
    let dir = own_path.parent().unwrap_or_else(|| Path::new(""));
    let under_root = debug_root.join(dir.strip_prefix("/").unwrap_or(dir)).join(link_name);
    vec![dir.join(link_name), dir.join(".debug").join(link_name), under_root]
}

/// CRC32 (IEEE 802.3 polynomial) of `data`, matching the checksum
/// `.gnu_debuglink` stores for the companion file it names.
pub fn gnu_debuglink_crc32(data: &[u8]) -> u32 {
    let mut crc = 0xffff_ffffu32;
    for &byte in data {
        crc ^= byte as u32;
        for _ in 0..8 {
            let mask = (crc & 1).wrapping_neg();
            crc = (crc >> 1) ^ (0xedb8_8320 & mask);
        }
    }
    !crc
}

/// A lazily-decompressed section's bytes, with its originally declared
/// virtual address.
pub struct Section<'data> {
    /// Raw (possibly still compressed) bytes as stored on disk.
    pub data: std::borrow::Cow<'data, [u8]>,
    /// Address this section is linked to load at.
    pub address: u64,
}

/// A parsed ELF object borrowing from the byte slice it was built from.
///
/// Constructed from a contiguous in-memory buffer (an mmap'd or fully-read
/// executable); the live/core process layer in [`crate::process`] reads such
/// buffers out of `/proc/<pid>/maps`-listed files or reassembled `PT_LOAD`
/// segments before handing them here.
pub struct ElfObject<'data> {
    elf: Elf<'data>,
    data: &'data [u8],
    is_malformed: bool,
}

impl<'data> ElfObject<'data> {
    /// Tests whether `data` starts with the ELF magic number.
    pub fn test(data: &[u8]) -> bool {
        data.get(0..elf::header::SELFMAG)
            .map_or(false, |magic| magic == elf::header::ELFMAG)
    }

    /// Parses an ELF object, returning a partially-populated object if
    /// program or section headers are truncated but the header itself reads
    /// cleanly.
    pub fn parse(data: &'data [u8]) -> Result<Self, ElfError> {
        if !Self::test(data) {
            return Err(ElfError::NotElf);
        }
        let header = Elf::parse_header(data).map_err(|e| ElfError::Malformed(e.to_string()))?;
        let mut obj =
            Elf::lazy_parse(header).map_err(|e| ElfError::Malformed(e.to_string()))?;

        let ctx = Ctx {
            container: if obj.is_64 { Container::Big } else { Container::Little },
            le: if obj.little_endian { scroll::Endian::Little } else { scroll::Endian::Big },
        };

        macro_rules! partial_on_err {
            ($expr:expr) => {
                match $expr {
                    Ok(value) => value,
                    Err(_) => {
                        return Ok(ElfObject { elf: obj, data, is_malformed: true });
                    }
                }
            };
        }

        obj.program_headers = partial_on_err!(elf::ProgramHeader::parse(
            data,
            header.e_phoff as usize,
            header.e_phnum as usize,
            ctx,
        ));

        // Best-effort: a missing or malformed `.dynamic` table only degrades
        // rendezvous-based loaded-object discovery, not parsing as a whole.
        obj.dynamic = elf::dynamic::Dynamic::parse(data, &obj.program_headers, ctx)
            .ok()
            .flatten();

        for phdr in &obj.program_headers {
            if phdr.p_type == elf::program_header::PT_INTERP && phdr.p_filesz != 0 {
                let count = (phdr.p_filesz - 1) as usize;
                obj.interpreter = data
                    .pread_with::<&str>(phdr.p_offset as usize, scroll::ctx::StrCtx::Length(count))
                    .ok();
            }
        }

        let section_headers = partial_on_err!(elf::SectionHeader::parse(
            data,
            header.e_shoff as usize,
            header.e_shnum as usize,
            ctx,
        ));

        if let Some(shstrtab_section) = section_headers.get(header.e_shstrndx as usize) {
            let shstrtab_start = shstrtab_section.sh_offset as usize;
            let shstrtab_size = shstrtab_section.sh_size as usize;
            obj.shdr_strtab = partial_on_err!(goblin::strtab::Strtab::parse(
                data,
                shstrtab_start,
                shstrtab_size,
                0x0,
            ));
        }
        obj.section_headers = section_headers;

        for shdr in &obj.section_headers {
            if shdr.sh_type == elf::section_header::SHT_DYNSYM
                || shdr.sh_type == elf::section_header::SHT_SYMTAB
            {
                let is_dynamic = shdr.sh_type == elf::section_header::SHT_DYNSYM;
                let syms = partial_on_err!(elf::sym::Symtab::parse(
                    data,
                    shdr.sh_offset as usize,
                    (shdr.sh_size / shdr.sh_entsize.max(1)) as usize,
                    ctx,
                ));

                let linked_strtab = obj
                    .section_headers
                    .get(shdr.sh_link as usize)
                    .map(|s| (s.sh_offset as usize, s.sh_size as usize))
                    .unwrap_or((0, 0));
                let strtab =
                    partial_on_err!(goblin::strtab::Strtab::parse(data, linked_strtab.0, linked_strtab.1, 0x0));

                if is_dynamic {
                    obj.dynsyms = syms;
                    obj.dynstrtab = strtab;
                } else {
                    obj.syms = syms;
                    obj.strtab = strtab;
                }
            }
        }

        Ok(ElfObject { elf: obj, data, is_malformed: false })
    }

    /// `true` if parsing stopped early due to a malformed section; the
    /// object still exposes whatever parsed cleanly before that point.
    pub fn is_malformed(&self) -> bool {
        self.is_malformed
    }

    /// The raw bytes this object was parsed from.
    pub fn data(&self) -> &'data [u8] {
        self.data
    }

    /// CPU architecture from `e_machine`.
    pub fn arch(&self) -> Arch {
        Arch::from_elf_machine(self.elf.header.e_machine)
    }

    /// `true` if this is a little-endian image.
    pub fn is_little_endian(&self) -> bool {
        self.elf.little_endian
    }

    /// The dynamic linker's requested interpreter path (`PT_INTERP`), if any.
    pub fn interpreter(&self) -> Option<&'data str> {
        self.elf.interpreter
    }

    /// The `DT_SONAME` entry, if this is a shared object that declares one.
    pub fn soname(&self) -> Option<&'data str> {
        self.elf.soname
    }

    /// The address at which a non-PIE executable expects to be loaded, i.e.
    /// the lowest `p_vaddr` among `PT_LOAD` segments. PIE executables and
    /// shared libraries normally report `0` here and rely on the process
    /// layer's relocation-base computation instead.
    pub fn preferred_base(&self) -> u64 {
        self.elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == elf::program_header::PT_LOAD)
            .map(|ph| ph.p_vaddr)
            .min()
            .unwrap_or(0)
    }

    /// Iterates `PT_LOAD` program headers.
    pub fn load_segments(&self) -> impl Iterator<Item = &elf::ProgramHeader> {
        self.elf
            .program_headers
            .iter()
            .filter(|ph| ph.p_type == elf::program_header::PT_LOAD)
    }

    /// Finds the `PT_LOAD` segment containing file offset `offset`.
    pub fn segment_for_file_offset(&self, offset: u64) -> Option<&elf::ProgramHeader> {
        self.load_segments()
            .find(|ph| offset >= ph.p_offset && offset < ph.p_offset + ph.p_filesz)
    }

    /// `true` if the public (`.symtab`) or dynamic (`.dynsym`) symbol table
    /// is non-empty.
    pub fn has_symbols(&self) -> bool {
        !self.elf.syms.is_empty() || !self.elf.dynsyms.is_empty()
    }

    /// Builds an address-sorted map over every symbol in `.symtab` and
    /// `.dynsym`, rebased to image-relative addresses.
    pub fn symbol_map(&self) -> SymbolMap<'data> {
        let load_addr = self.preferred_base();
        let from_table = |syms: &elf::sym::Symtab<'data>, strtab: &goblin::strtab::Strtab<'data>| {
            syms.iter()
                .filter(|sym| sym.st_value != 0 || sym.st_shndx != elf::section_header::SHN_UNDEF as usize)
                .map(move |sym| Symbol {
                    name: strtab.get_at(sym.st_name).filter(|s| !s.is_empty()),
                    address: sym.st_value.saturating_sub(load_addr),
                    size: sym.st_size,
                })
        };

        from_table(&self.elf.syms, &self.elf.strtab)
            .chain(from_table(&self.elf.dynsyms, &self.elf.dynstrtab))
            .collect()
    }

    /// Looks up a symbol by exact name via the classic SysV hash table
    /// (`SHT_HASH`/`DT_HASH`) when present, falling back to a linear scan of
    /// `.dynsym`/`.symtab` otherwise. Both paths are kept live (per the
    /// design note on hash/linear agreement) since a malformed or absent
    /// hash section must never hide a symbol a linear scan would find.
    pub fn find_symbol_by_name(&self, name: &str) -> Option<Symbol<'data>> {
        if let Some(sym) = self.find_symbol_via_sysv_hash(name) {
            return Some(sym);
        }
        self.symbol_map().iter().find(|s| s.name == Some(name)).cloned()
    }

    fn find_symbol_via_sysv_hash(&self, name: &str) -> Option<Symbol<'data>> {
        let hash_section = self
            .elf
            .section_headers
            .iter()
            .find(|s| s.sh_type == elf::section_header::SHT_HASH)?;

        let bytes = self
            .data
            .get(hash_section.sh_offset as usize..)?;
        let le = if self.elf.little_endian { scroll::Endian::Little } else { scroll::Endian::Big };

        let nbucket: u32 = bytes.pread_with(0, le).ok()?;
        let nchain: u32 = bytes.pread_with(4, le).ok()?;
        let buckets = &bytes[8..];
        let chains = &buckets[nbucket as usize * 4..];

        let hash = elf_sysv_hash(name.as_bytes());
        let mut index: u32 = buckets.pread_with((hash % nbucket.max(1)) as usize * 4, le).ok()?;

        while index != 0 && (index as u64) < nchain as u64 {
            let sym = self.elf.dynsyms.get(index as usize).or_else(|| self.elf.syms.get(index as usize))?;
            let sym_name = self.elf.dynstrtab.get_at(sym.st_name).or_else(|| self.elf.strtab.get_at(sym.st_name));
            if sym_name == Some(name) {
                return Some(Symbol {
                    name: sym_name,
                    address: sym.st_value.saturating_sub(self.preferred_base()),
                    size: sym.st_size,
                });
            }
            index = chains.pread_with(index as usize * 4, le).ok()?;
        }
        None
    }

    /// Finds the symbol whose declared range contains `address` (already
    /// image-relative). Falls back to the nearest symbol at or below the
    /// address when sizes are `0`, which over-attributes tail-called or
    /// size-less stub code to the preceding symbol — an accepted trade-off
    /// noted for stripped binaries.
    pub fn find_symbol_by_address(&self, address: u64) -> Option<Symbol<'data>> {
        self.symbol_map().lookup(address).cloned()
    }

    fn has_section(&self, name: &str) -> bool {
        self.find_section(name).is_some()
    }

    /// `true` if either `.eh_frame` or `.debug_frame` is present.
    pub fn has_unwind_info(&self) -> bool {
        self.has_section("eh_frame") || self.has_section("debug_frame")
    }

    /// Looks up a named section (without the leading `.`), transparently
    /// decompressing it if it is `SHF_COMPRESSED` or uses the legacy
    /// `.z`-prefixed / `ZLIB\0`-header convention.
    pub fn find_section(&self, name: &str) -> Option<Section<'data>> {
        for header in &self.elf.section_headers {
            if header.sh_type == elf::section_header::SHT_NOBITS {
                continue;
            }
            let offset = header.sh_offset as usize;
            if offset == 0 {
                continue;
            }

            let section_name = self.elf.shdr_strtab.get_at(header.sh_name)?;
            if section_name.is_empty() {
                continue;
            }

            let (compressed, stripped_name) = match section_name.strip_prefix(".z") {
                Some(stripped) => (true, stripped),
                None => (header.sh_flags & SHF_COMPRESSED != 0, section_name.strip_prefix('.')?),
            };

            if stripped_name != name {
                continue;
            }

            let size = header.sh_size as usize;
            let raw = self.data.get(offset..offset + size)?;

            let data = if compressed {
                std::borrow::Cow::Owned(self.decompress_section(raw)?)
            } else {
                std::borrow::Cow::Borrowed(raw)
            };

            return Some(Section { data, address: header.sh_addr });
        }
        None
    }

    fn decompress_section(&self, section_data: &[u8]) -> Option<Vec<u8>> {
        if let Some(rest) = section_data.strip_prefix(b"ZLIB") {
            if rest.len() < 8 {
                return None;
            }
            let mut size_bytes = [0u8; 8];
            size_bytes.copy_from_slice(&rest[..8]);
            let size = u64::from_be_bytes(size_bytes);
            return decompress_zlib(&rest[8..], size).ok();
        }

        use goblin::elf::compression_header::{CompressionHeader, ELFCOMPRESS_ZLIB};
        let container = self.elf.header.container().ok()?;
        let endianness = self.elf.header.endianness().ok()?;
        let ctx = Ctx::new(container, endianness);
        let header = CompressionHeader::parse(section_data, 0, ctx).ok()?;
        if header.ch_type != ELFCOMPRESS_ZLIB {
            return None;
        }
        let payload = &section_data[CompressionHeader::size(ctx)..];
        decompress_zlib(payload, header.ch_size).ok()
    }

    /// Parses the `.note.gnu.build-id` `PT_NOTE`/section payload, if any.
    pub fn find_build_id(&self) -> Option<&'data [u8]> {
        if let Some(mut notes) = self.elf.iter_note_headers(self.data) {
            while let Some(Ok(note)) = notes.next() {
                if note.n_type == elf::note::NT_GNU_BUILD_ID {
                    return Some(note.desc);
                }
            }
        }
        if let Some(mut notes) = self.elf.iter_note_sections(self.data, Some(".note.gnu.build-id")) {
            while let Some(Ok(note)) = notes.next() {
                if note.n_type == elf::note::NT_GNU_BUILD_ID {
                    return Some(note.desc);
                }
            }
        }
        None
    }

    /// Converts this object's build-id (or, lacking one, an all-zero
    /// identifier) into a `DebugId`: truncated or zero-extended to 16 bytes,
    /// with the first three UUID fields byte-swapped to big-endian order for
    /// little-endian targets, matching the breakpad processor's expectation.
    pub fn debug_id(&self) -> DebugId {
        let identifier = self.find_build_id().unwrap_or(&[]);
        let mut data = [0u8; UUID_SIZE];
        let len = identifier.len().min(UUID_SIZE);
        data[..len].copy_from_slice(&identifier[..len]);

        if self.elf.little_endian {
            data[0..4].reverse();
            data[4..6].reverse();
            data[6..8].reverse();
        }

        Uuid::from_slice(&data).map(DebugId::from_uuid).unwrap_or_default()
    }

    /// The `[p_vaddr, p_vaddr + p_memsz)` extent of the `PT_DYNAMIC` segment.
    ///
    /// Used to locate `DT_DEBUG` in a *live* process: the tag's value as
    /// stored in the file on disk is `0` until the dynamic linker fills it
    /// in at load time, so a live reader must read this range out of the
    /// tracee's memory rather than trusting [`ElfObject::r_debug_address`].
    pub fn dynamic_segment(&self) -> Option<(u64, u64)> {
        self.elf
            .program_headers
            .iter()
            .find(|ph| ph.p_type == elf::program_header::PT_DYNAMIC)
            .map(|ph| (ph.p_vaddr, ph.p_memsz))
    }

    /// The `DT_DEBUG` dynamic tag's value: the address of the dynamic
    /// linker's `r_debug` rendezvous structure.
    ///
    /// Valid as read directly from this object's own `.dynamic` table only
    /// when that table already reflects runtime-resolved values — true for a
    /// core file (whose `PT_LOAD` segments are a literal memory snapshot)
    /// but not for a plain executable file, where the loader writes this
    /// value at load time; see [`ElfObject::dynamic_segment`] for that case.
    pub fn r_debug_address(&self) -> Option<u64> {
        self.elf
            .dynamic
            .as_ref()?
            .dyns
            .iter()
            .find(|d| d.d_tag == elf::dynamic::DT_DEBUG)
            .map(|d| d.d_val)
    }

    /// Iterates every ELF note this object carries, whether reached via a
    /// `PT_NOTE` segment (the only way to find them in a stripped core) or a
    /// `SHT_NOTE` section, as `(n_type, desc)` pairs.
    pub fn notes(&self) -> Vec<(u32, &'data [u8])> {
        let mut out = Vec::new();
        if let Some(mut notes) = self.elf.iter_note_headers(self.data) {
            while let Some(Ok(note)) = notes.next() {
                out.push((note.n_type, note.desc));
            }
        }
        out
    }

    /// Returns `.eh_frame` or `.debug_frame` raw bytes tied to this object's
    /// own data lifetime, together with the section's linked virtual
    /// address. Declines (returns `None`) if the section is compressed:
    /// unwind tables are consulted at unwind time, so producers practically
    /// never compress them, and copying one out would cost a borrow tied to
    /// this call rather than to `'data`.
    pub fn unwind_section(&self, name: &str) -> Option<(&'data [u8], u64)> {
        let section = self.find_section(name)?;
        match section.data {
            std::borrow::Cow::Borrowed(bytes) => Some((bytes, section.address)),
            std::borrow::Cow::Owned(_) => None,
        }
    }

    /// Parses the `.gnu_debuglink` section, if present, identifying a
    /// separate file the real debug information should be loaded from.
    pub fn debug_link(&self) -> Result<Option<DebugLink<'data>>, ElfError> {
        self.find_section("gnu_debuglink")
            .map(|section| match section.data {
                std::borrow::Cow::Borrowed(bytes) => DebugLink::parse(bytes),
                std::borrow::Cow::Owned(_) => {
                    Err(ElfError::TruncatedSection("gnu_debuglink should not be compressed".into()))
                }
            })
            .transpose()
    }
}

impl<'slf> AsSelf<'slf> for ElfObject<'_> {
    type Ref = ElfObject<'slf>;

    fn as_self(&'slf self) -> &Self::Ref {
        self
    }
}

/// An [`ElfObject`] bundled together with the owned byte buffer it borrows
/// from, for callers — the process layer's loaded-object cache, the CLI's
/// symbolication pass — that need to keep a parsed image alive independent
/// of whatever stack frame originally read its bytes.
///
/// This is the same owner-plus-borrow problem [`SelfCell`] exists for (see
/// the design note on cyclic ownership between section views and the owning
/// image); `OwnedElf` is simply `SelfCell` specialized to this one type.
pub struct OwnedElf(SelfCell<Vec<u8>, ElfObject<'static>>);

impl OwnedElf {
    /// Parses `data`, keeping it alive alongside the resulting object.
    pub fn parse(data: Vec<u8>) -> Result<Self, ElfError> {
        let cell = SelfCell::try_new(data, |ptr| {
            // Safety: `ptr` is derived from the `Vec<u8>` this `SelfCell`
            // owns and outlives; the resulting borrow is stored in the cell
            // alongside its owner rather than escaping this closure.
            let bytes: &[u8] = unsafe { &*ptr };
            ElfObject::parse(bytes)
        })?;
        Ok(OwnedElf(cell))
    }

    /// Borrows the parsed object.
    pub fn get(&self) -> &ElfObject<'_> {
        self.0.get()
    }
}

/// The classic SysV ELF hash function (`elf_hash` in the gABI).
fn elf_sysv_hash(name: &[u8]) -> u32 {
    let mut h: u32 = 0;
    for &byte in name {
        h = (h << 4).wrapping_add(byte as u32);
        let high = h & 0xf000_0000;
        if high != 0 {
            h ^= high >> 24;
        }
        h &= !high;
    }
    h
}

impl fmt::Debug for ElfObject<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ElfObject")
            .field("arch", &self.arch())
            .field("preferred_base", &format_args!("{:#x}", self.preferred_base()))
            .field("has_symbols", &self.has_symbols())
            .field("has_unwind_info", &self.has_unwind_info())
            .field("is_malformed", &self.is_malformed)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn rejects_non_elf() {
        assert!(!ElfObject::test(b"not an elf"));
        assert!(matches!(ElfObject::parse(b"not an elf"), Err(ElfError::NotElf)));
    }

    #[test]
    fn sysv_hash_matches_known_vector() {
        assert_eq!(elf_sysv_hash(b"main"), 0x0007_37fe);
        assert_eq!(elf_sysv_hash(b""), 0);
    }

    #[test]
    fn debuglink_crc32_matches_known_vector() {
        assert_eq!(gnu_debuglink_crc32(b"123456789"), 0xCBF4_3926);
    }

    #[test]
    fn debug_companion_candidates_cover_search_order() {
        let own = Path::new("/usr/bin/app");
        let candidates = debug_companion_candidates(own, "app.debug", Path::new("/usr/lib/debug"));
        assert_eq!(
            candidates,
            vec![
                PathBuf::from("/usr/bin/app.debug"),
                PathBuf::from("/usr/bin/.debug/app.debug"),
                PathBuf::from("/usr/lib/debug/usr/bin/app.debug"),
            ]
        );
    }

    #[test]
    fn symbol_map_prefers_larger_size_on_collision() {
        let map: SymbolMap = [
            Symbol { name: Some("alias"), address: 0x100, size: 0 },
            Symbol { name: Some("real"), address: 0x100, size: 0x40 },
        ]
        .into_iter()
        .collect();

        assert_eq!(map.len(), 1);
        assert_eq!(map.iter().next().unwrap().name, Some("real"));
    }

    #[test]
    fn symbol_map_lookup_within_range() {
        let map: SymbolMap = [
            Symbol { name: Some("a"), address: 0x1000, size: 0x10 },
            Symbol { name: Some("b"), address: 0x2000, size: 0 },
        ]
        .into_iter()
        .collect();

        assert_eq!(map.lookup(0x1005).unwrap().name, Some("a"));
        assert_eq!(map.lookup(0x1020), None);
        assert_eq!(map.lookup(0x2050).unwrap().name, Some("b"));
    }
}
