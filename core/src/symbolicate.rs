//! Resolves a stack frame's program counter to a function name and source
//! location, preferring the symbol table and falling back to a DWARF DIE/
//! line-program walk when the object is stripped.
//!
//! This is the "annotate the emitted frame" step the unwinder itself does
//! not perform: [`crate::unwind::Unwinder`] only ever deals in addresses, so
//! that its CFI-driven stepping stays independent of whether a given object
//! even has a symbol table.

use once_cell::sync::OnceCell;

use elfstack_common::{AsSelf, Endianness, SelfCell};

use crate::dwarf::DebugInfo;
use crate::elf::ElfObject;
use crate::process::Process;
use crate::unwind::Frame;

/// A resolved frame: a name (from `.symtab`/`.dynsym` or `DW_TAG_subprogram`)
/// plus a source file/line when a `.debug_line` row covers the address.
#[derive(Clone, Debug, Default, Eq, PartialEq)]
pub struct ResolvedSymbol {
    /// Function name, if found in the symbol table or DWARF.
    pub name: Option<String>,
    /// Source file path, if a line-table row covers the address.
    pub file: Option<String>,
    /// Source line number, `0` if unknown.
    pub line: u32,
}

struct SectionBytes {
    debug_info: Vec<u8>,
    debug_abbrev: Vec<u8>,
    debug_str: Vec<u8>,
    debug_line: Vec<u8>,
    debug_line_str: Vec<u8>,
    debug_ranges: Vec<u8>,
    debug_rnglists: Vec<u8>,
}

struct DebugInfoHolder<'a>(DebugInfo<'a>);

impl<'slf> AsSelf<'slf> for DebugInfoHolder<'_> {
    type Ref = DebugInfo<'slf>;

    fn as_self(&'slf self) -> &Self::Ref {
        &self.0
    }
}

/// Per-object resolver: looks up the symbol table first, parsing and caching
/// `.debug_info`/`.debug_line` only on the first request the symbol table
/// couldn't answer. Most frames in a symbol-complete binary never touch the
/// DWARF path at all.
pub struct Symbolicator<'data> {
    elf: &'data ElfObject<'data>,
    /// A separate `.gnu_debuglink` companion image, if the process resolved
    /// one for this object. Its symbol table and DWARF sections are tried
    /// before the primary image's own, since a stripped binary's companion
    /// is the only place that information still exists.
    companion: Option<&'data ElfObject<'data>>,
    debug_info: OnceCell<Option<SelfCell<Box<SectionBytes>, DebugInfoHolder<'static>>>>,
}

impl<'data> Symbolicator<'data> {
    /// Builds a resolver over one loaded object's backing image, optionally
    /// paired with its resolved debug companion.
    pub fn new(elf: &'data ElfObject<'data>, companion: Option<&'data ElfObject<'data>>) -> Self {
        Symbolicator { elf, companion, debug_info: OnceCell::new() }
    }

    /// Resolves `address` (already image-relative) to a name and source
    /// location. Returns a fully empty [`ResolvedSymbol`] if neither the
    /// symbol table nor DWARF cover the address — a single unresolved frame
    /// degrades the output, it never aborts the unwind.
    pub fn resolve(&self, address: u64) -> ResolvedSymbol {
        let symbol = self
            .companion
            .and_then(|c| c.find_symbol_by_address(address))
            .or_else(|| self.elf.find_symbol_by_address(address));

        if let Some(symbol) = symbol {
            let mut resolved =
                ResolvedSymbol { name: symbol.name.map(str::to_string), file: None, line: 0 };
            if let Some(info) = self.debug_info() {
                if let Some(line) = info.line_for_address(address) {
                    resolved.file = line.file.clone();
                    resolved.line = line.line;
                }
            }
            return resolved;
        }

        let Some(info) = self.debug_info() else {
            return ResolvedSymbol::default();
        };

        let name = info.function_for_address(address).and_then(|f| f.name.clone());
        let (file, line) = info
            .line_for_address(address)
            .map(|row| (row.file.clone(), row.line))
            .unwrap_or((None, 0));
        ResolvedSymbol { name, file, line }
    }

    /// Finds a named DWARF/debug section, preferring the debug companion
    /// (if one is set) over this object's own sections — mirrors the
    /// resolution order separate-debug-info tooling uses when a stripped
    /// binary's sections are all empty but its companion's are not.
    fn get_section(&self, name: &str) -> Option<crate::elf::Section<'data>> {
        self.companion
            .and_then(|c| c.find_section(name))
            .or_else(|| self.elf.find_section(name))
    }

    fn debug_info(&self) -> Option<&DebugInfo<'_>> {
        self.debug_info.get_or_init(|| build_debug_info(self)).as_ref().map(|cell| cell.get())
    }
}

fn build_debug_info(
    symbolicator: &Symbolicator<'_>,
) -> Option<SelfCell<Box<SectionBytes>, DebugInfoHolder<'static>>> {
    let owned = |name: &str| {
        symbolicator.get_section(name).map(|s| s.data.into_owned()).unwrap_or_default()
    };

    let bytes = Box::new(SectionBytes {
        debug_info: symbolicator.get_section("debug_info")?.data.into_owned(),
        debug_abbrev: symbolicator.get_section("debug_abbrev")?.data.into_owned(),
        debug_str: owned("debug_str"),
        debug_line: owned("debug_line"),
        debug_line_str: owned("debug_line_str"),
        debug_ranges: owned("debug_ranges"),
        debug_rnglists: owned("debug_rnglists"),
    });

    let endianness =
        if symbolicator.elf.is_little_endian() { Endianness::Little } else { Endianness::Big };

    SelfCell::try_new(bytes, |ptr| {
        // Safety: `ptr` is derived from the `Box<SectionBytes>` this cell
        // owns and outlives; the borrow built from it is stored alongside
        // that owner rather than escaping this closure, same as `OwnedElf`.
        let bytes: &SectionBytes = unsafe { &*ptr };
        DebugInfo::parse(
            &bytes.debug_info,
            &bytes.debug_abbrev,
            &bytes.debug_str,
            Some(bytes.debug_line.as_slice()).filter(|v| !v.is_empty()),
            Some(bytes.debug_line_str.as_slice()).filter(|v| !v.is_empty()),
            Some(bytes.debug_ranges.as_slice()).filter(|v| !v.is_empty()),
            Some(bytes.debug_rnglists.as_slice()).filter(|v| !v.is_empty()),
            endianness,
        )
        .map(DebugInfoHolder)
    })
    .ok()
}

/// Caches one [`Symbolicator`] per loaded object in a [`Process`], so a
/// caller walking many frames only pays for opening and parsing each backing
/// image once regardless of how many frames land inside it.
pub struct Symbolicators<'p> {
    process: &'p Process,
    cache: Vec<OnceCell<Option<Symbolicator<'p>>>>,
}

impl<'p> Symbolicators<'p> {
    /// Builds an (empty) cache sized to `process`'s current loaded-object
    /// list.
    pub fn new(process: &'p Process) -> Self {
        let cache = process.loaded_objects().iter().map(|_| OnceCell::new()).collect();
        Symbolicators { process, cache }
    }

    /// Resolves a frame the [`crate::unwind::Unwinder`] produced, returning
    /// `None` only when the frame's pc fell outside every known loaded
    /// object or that object's backing image could not be opened.
    pub fn resolve(&self, frame: &Frame) -> Option<ResolvedSymbol> {
        let idx = frame.object_index?;
        let addr = frame.image_pc?;
        let slot = self.cache.get(idx)?;
        let symbolicator = slot.get_or_init(|| {
            let elf = self.process.elf_for(idx)?;
            let companion = self.process.companion_for(idx);
            Some(Symbolicator::new(elf, companion))
        });
        symbolicator.as_ref().map(|s| s.resolve(addr))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn resolved_symbol_defaults_to_empty() {
        let resolved = ResolvedSymbol::default();
        assert_eq!(resolved.name, None);
        assert_eq!(resolved.line, 0);
    }
}
