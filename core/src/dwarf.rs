//! DWARF call-frame information and a minimal abbrev/info/line reader.
//!
//! Two independent subsystems live here:
//!
//! - [`CfiInfo`], which wraps `gimli`'s native `UnwindContext`/`UnwindTable`
//!   over `.eh_frame` or `.debug_frame` and answers "what are the CFA and
//!   register-recovery rules at this pc" for the unwinder in
//!   [`crate::unwind`]. We lean on `gimli` here rather than hand-rolling a
//!   CFI virtual machine, since CIE/FDE interpretation is exactly what it
//!   already implements.
//! - [`DebugInfo`], a minimal `.debug_info`/`.debug_abbrev`/`.debug_line`
//!   walk restricted to what name resolution needs: subprogram name and
//!   `DW_AT_low_pc`/`DW_AT_high_pc` ranges, and line-table lookup. This is
//!   deliberately not a general DWARF expression evaluator (see Non-goals).

use std::borrow::Cow;

use gimli::{
    BaseAddresses, CfaRule, EndianSlice, RegisterRule, RunTimeEndian, UnwindContext,
    UnwindSection, UnwindTableRow,
};
use smallvec::SmallVec;

use elfstack_common::Endianness;

use crate::error::DwarfError;

type Reader<'data> = EndianSlice<'data, RunTimeEndian>;

/// Converts this crate's architecture-level [`Endianness`] into the
/// `gimli`-level equivalent, so every DWARF section reader here is picked at
/// runtime from the image's own `EI_DATA`/initial-length marker rather than
/// assuming little-endian, per the "supports little- and big-endian
/// targets" requirement.
fn gimli_endian(endianness: Endianness) -> RunTimeEndian {
    match endianness {
        Endianness::Little => RunTimeEndian::Little,
        Endianness::Big => RunTimeEndian::Big,
    }
}

/// CFA and per-register recovery rules for a single program-counter value,
/// as produced by `gimli`'s row interpreter.
///
/// Most CFI rows only ever set a handful of registers (the return address
/// plus whichever callee-saved registers the prologue spilled), so this
/// stays inline rather than heap-allocating for the common case.
#[derive(Clone, Debug)]
pub struct UnwindRow {
    /// Canonical frame address rule at this pc.
    pub cfa: CfaRule<usize>,
    rules: SmallVec<[(gimli::Register, RegisterRule<usize>); 8]>,
}

impl UnwindRow {
    /// Returns the recovery rule for `register`, defaulting to
    /// [`RegisterRule::Undefined`] when the CFI program does not mention it.
    pub fn register_rule(&self, register: gimli::Register) -> RegisterRule<usize> {
        self.rules
            .iter()
            .find(|(r, _)| *r == register)
            .map(|(_, rule)| rule.clone())
            .unwrap_or(RegisterRule::Undefined)
    }
}

impl UnwindRow {
    fn from_row(row: &UnwindTableRow<usize>) -> Self {
        let rules = row
            .registers()
            .map(|(reg, rule)| (*reg, rule.clone()))
            .collect();
        UnwindRow { cfa: row.cfa().clone(), rules }
    }
}

/// Which DWARF unwind section a [`CfiInfo`] was built from.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
enum CfiKind {
    EhFrame,
    DebugFrame,
}

/// Call-frame information for one loaded image, covering either its
/// `.eh_frame` or its `.debug_frame` (whichever is present; `.eh_frame` is
/// preferred since it is nearly always present even in stripped binaries).
pub struct CfiInfo<'data> {
    kind: CfiKind,
    eh_frame: Option<gimli::EhFrame<Reader<'data>>>,
    debug_frame: Option<gimli::DebugFrame<Reader<'data>>>,
    bases: BaseAddresses,
    address_size: u8,
}

impl<'data> CfiInfo<'data> {
    /// Builds unwind information from an `.eh_frame` section plus the bases
    /// (`.eh_frame_hdr`/text/data/func addresses) `gimli` needs to resolve
    /// the DW_EH_PE-encoded pointers commonly used there.
    pub fn from_eh_frame(
        data: &'data [u8],
        section_address: u64,
        text_address: u64,
        data_address: u64,
        address_size: u8,
        endianness: Endianness,
    ) -> Self {
        let mut eh_frame = gimli::EhFrame::new(data, gimli_endian(endianness));
        eh_frame.set_address_size(address_size);
        let bases = BaseAddresses::default()
            .set_eh_frame(section_address)
            .set_text(text_address)
            .set_data(data_address);

        CfiInfo {
            kind: CfiKind::EhFrame,
            eh_frame: Some(eh_frame),
            debug_frame: None,
            bases,
            address_size,
        }
    }

    /// Builds unwind information from a (non-`.eh_frame`) `.debug_frame`
    /// section, used when a binary was compiled without `-fasynchronous-
    /// unwind-tables` and carries only the plain DWARF CFI table.
    pub fn from_debug_frame(data: &'data [u8], address_size: u8, endianness: Endianness) -> Self {
        let mut debug_frame = gimli::DebugFrame::new(data, gimli_endian(endianness));
        debug_frame.set_address_size(address_size);

        CfiInfo {
            kind: CfiKind::DebugFrame,
            eh_frame: None,
            debug_frame: Some(debug_frame),
            bases: BaseAddresses::default(),
            address_size,
        }
    }

    /// Looks up the unwind row covering `pc` (already rebased to the
    /// section's own addressing, i.e. with the image's load bias already
    /// subtracted by the caller).
    pub fn unwind_row(&self, pc: u64) -> Result<UnwindRow, DwarfError> {
        let mut ctx = UnwindContext::new();
        let row = match self.kind {
            CfiKind::EhFrame => {
                let section = self.eh_frame.as_ref().expect("eh_frame present");
                section
                    .unwind_info_for_address(&self.bases, &mut ctx, pc, gimli::EhFrame::cie_from_offset)
                    .map_err(|_| DwarfError::NoFde(pc))?
                    .clone()
            }
            CfiKind::DebugFrame => {
                let section = self.debug_frame.as_ref().expect("debug_frame present");
                section
                    .unwind_info_for_address(
                        &self.bases,
                        &mut ctx,
                        pc,
                        gimli::DebugFrame::cie_from_offset,
                    )
                    .map_err(|_| DwarfError::NoFde(pc))?
                    .clone()
            }
        };
        Ok(UnwindRow::from_row(&row))
    }

    /// Pointer size in bytes for registers recovered through this CFI
    /// program.
    pub fn address_size(&self) -> u8 {
        self.address_size
    }
}

/// One parsed `DW_TAG_subprogram`: a name and the `[low_pc, high_pc)` range
/// it covers, both already resolved from whichever `DW_AT_ranges`/
/// `DW_AT_high_pc`-as-offset encoding the producer used.
#[derive(Clone, Debug)]
pub struct FunctionRange {
    /// Demangled or raw subprogram name, if `DW_AT_name` (or
    /// `DW_AT_linkage_name`) is present.
    pub name: Option<String>,
    /// Start of the covered address range, image-relative.
    pub low_pc: u64,
    /// End (exclusive) of the covered address range, image-relative.
    pub high_pc: u64,
}

impl FunctionRange {
    /// Whether this function covers `pc`.
    pub fn contains(&self, pc: u64) -> bool {
        pc >= self.low_pc && pc < self.high_pc
    }
}

/// One resolved source line: file, line number, and the address it starts
/// at, as produced by the `.debug_line` state machine.
#[derive(Clone, Debug)]
pub struct LineRow {
    /// Address this row begins at, image-relative.
    pub address: u64,
    /// Source file path, if resolvable from the line program's file table.
    pub file: Option<String>,
    /// 1-based source line number, `0` if unknown.
    pub line: u32,
}

/// A minimal `.debug_info`/`.debug_abbrev`/`.debug_line` reader, restricted
/// to name resolution for stripped-of-symtab binaries: function ranges and
/// line-table lookups. This is not a general DIE walker or expression
/// evaluator (see Non-goals).
pub struct DebugInfo<'data> {
    functions: Vec<FunctionRange>,
    lines: Vec<LineRow>,
    _marker: std::marker::PhantomData<&'data ()>,
}

impl<'data> DebugInfo<'data> {
    /// Walks every compilation unit in `.debug_info`, collecting subprogram
    /// ranges and (if `.debug_line` is present) the line table for each
    /// unit's line-program offset.
    pub fn parse(
        debug_info: &'data [u8],
        debug_abbrev: &'data [u8],
        debug_str: &'data [u8],
        debug_line: Option<&'data [u8]>,
        debug_line_str: Option<&'data [u8]>,
        debug_ranges: Option<&'data [u8]>,
        debug_rnglists: Option<&'data [u8]>,
        endianness: Endianness,
    ) -> Result<Self, DwarfError> {
        let endian = gimli_endian(endianness);
        let info = gimli::DebugInfo::new(debug_info, endian);
        let abbrev = gimli::DebugAbbrev::new(debug_abbrev, endian);
        let str_section = gimli::DebugStr::new(debug_str, endian);
        let line_section = gimli::DebugLine::new(debug_line.unwrap_or(&[]), endian);
        let line_str = gimli::DebugLineStr::new(debug_line_str.unwrap_or(&[]), endian);
        let ranges = gimli::RangeLists::new(
            gimli::DebugRanges::new(debug_ranges.unwrap_or(&[]), endian),
            gimli::DebugRngLists::new(debug_rnglists.unwrap_or(&[]), endian),
        );

        let mut functions = Vec::new();
        let mut lines = Vec::new();

        let mut dwarf = gimli::Dwarf::default();
        dwarf.debug_abbrev = abbrev;
        dwarf.debug_str = str_section.clone();
        dwarf.debug_line = line_section;
        dwarf.debug_line_str = line_str.clone();
        dwarf.ranges = ranges;

        let mut units = info.units();
        while let Some(header) = units.next().map_err(DwarfError::from)? {
            let unit = dwarf.unit(header).map_err(DwarfError::from)?;

            walk_subprograms(&unit, &str_section, &mut functions)?;

            if let Some(program) = unit.line_program.clone() {
                collect_line_rows(program, &str_section, &line_str, &mut lines)?;
            }
        }

        dmsort::sort_by_key(&mut functions, |f| f.low_pc);
        dmsort::sort_by_key(&mut lines, |l| l.address);

        Ok(DebugInfo { functions, lines, _marker: std::marker::PhantomData })
    }

    /// Finds the subprogram covering `pc` (image-relative), if one was
    /// parsed out of `.debug_info`.
    pub fn function_for_address(&self, pc: u64) -> Option<&FunctionRange> {
        let idx = self.functions.partition_point(|f| f.low_pc <= pc);
        if idx == 0 {
            return None;
        }
        self.functions[..idx].iter().rev().find(|f| f.contains(pc))
    }

    /// Finds the line-table row covering `pc` by binary search over the
    /// address-sorted row sequence, matching the sequence/row lookup
    /// strategy `symbolic-debuginfo`'s `DwarfLineProgram::prepare()` uses.
    pub fn line_for_address(&self, pc: u64) -> Option<&LineRow> {
        let idx = self.lines.partition_point(|row| row.address <= pc);
        if idx == 0 {
            return None;
        }
        Some(&self.lines[idx - 1])
    }
}

/// Walks every `DW_TAG_subprogram` and `DW_TAG_inlined_subroutine` DIE in
/// `unit`. Inlined subroutines rarely carry their own `DW_AT_name` — a
/// compiler typically points an inlined call back at the out-of-line
/// definition's name via `DW_AT_abstract_origin`, and a non-defining
/// declaration points at its concrete definition via `DW_AT_specification` —
/// so a missing name falls back to resolving one of those references before
/// the range is dropped for lack of one.
fn walk_subprograms<'data>(
    unit: &gimli::Unit<Reader<'data>>,
    debug_str: &gimli::DebugStr<Reader<'data>>,
    out: &mut Vec<FunctionRange>,
) -> Result<(), DwarfError> {
    let mut cursor = unit.entries();
    while let Some((_, entry)) = cursor.next_dfs().map_err(DwarfError::from)? {
        let tag = entry.tag();
        if tag != gimli::constants::DW_TAG_subprogram
            && tag != gimli::constants::DW_TAG_inlined_subroutine
        {
            continue;
        }

        let mut name = entry
            .attr_value(gimli::constants::DW_AT_linkage_name)
            .ok()
            .flatten()
            .or_else(|| entry.attr_value(gimli::constants::DW_AT_name).ok().flatten())
            .and_then(|value| value.string_value(debug_str))
            .map(|s| String::from_utf8_lossy(s.slice()).into_owned());

        if name.is_none() {
            name = resolve_origin_name(unit, entry, debug_str)?;
        }

        let low_pc = entry
            .attr_value(gimli::constants::DW_AT_low_pc)
            .ok()
            .flatten()
            .and_then(|v| v.udata_value());

        let high_pc_attr = entry.attr_value(gimli::constants::DW_AT_high_pc).ok().flatten();

        if let (Some(low_pc), Some(high_pc_attr)) = (low_pc, high_pc_attr) {
            let high_pc = match high_pc_attr {
                gimli::AttributeValue::Addr(addr) => addr,
                other => other.udata_value().map(|offset| low_pc + offset).unwrap_or(low_pc),
            };
            out.push(FunctionRange { name, low_pc, high_pc });
        }
    }
    Ok(())
}

/// Resolves a name through `DW_AT_abstract_origin` or `DW_AT_specification`,
/// in that order, returning [`DwarfError::InvalidReference`] if either
/// attribute names an offset that does not land on a real DIE in this unit —
/// a malformed or truncated `.debug_info` section, since a producer never
/// emits a dangling reference.
fn resolve_origin_name<'data>(
    unit: &gimli::Unit<Reader<'data>>,
    entry: &gimli::DebuggingInformationEntry<Reader<'data>>,
    debug_str: &gimli::DebugStr<Reader<'data>>,
) -> Result<Option<String>, DwarfError> {
    for attr in [gimli::constants::DW_AT_abstract_origin, gimli::constants::DW_AT_specification] {
        let Some(value) = entry.attr_value(attr).map_err(DwarfError::from)? else {
            continue;
        };
        let offset = match value {
            gimli::AttributeValue::UnitRef(r) => r,
            gimli::AttributeValue::DebugInfoRef(r) => match r.to_unit_offset(&unit.header) {
                Some(unit_ref) => unit_ref,
                None => return Err(DwarfError::InvalidReference(r.0)),
            },
            _ => continue,
        };

        let mut origin_cursor = unit
            .entries_at_offset(offset)
            .map_err(|_| DwarfError::InvalidReference(offset.0))?;
        let (_, origin_entry) = origin_cursor
            .next_dfs()
            .map_err(DwarfError::from)?
            .ok_or(DwarfError::InvalidReference(offset.0))?;

        let resolved = origin_entry
            .attr_value(gimli::constants::DW_AT_linkage_name)
            .ok()
            .flatten()
            .or_else(|| origin_entry.attr_value(gimli::constants::DW_AT_name).ok().flatten())
            .and_then(|value| value.string_value(debug_str))
            .map(|s| String::from_utf8_lossy(s.slice()).into_owned());

        if resolved.is_some() {
            return Ok(resolved);
        }
    }
    Ok(None)
}

fn collect_line_rows<'data>(
    program: gimli::IncompleteLineProgram<Reader<'data>>,
    debug_str: &gimli::DebugStr<Reader<'data>>,
    debug_line_str: &gimli::DebugLineStr<Reader<'data>>,
    out: &mut Vec<LineRow>,
) -> Result<(), DwarfError> {
    let mut rows = program.rows();
    while let Some((header, row)) = rows.next_row().map_err(DwarfError::from)? {
        if row.end_sequence() {
            continue;
        }

        let file = row.file(header).and_then(|file| {
            file.path_name()
                .string_value(debug_str)
                .or_else(|| file.path_name().string_value(debug_line_str))
                .map(|s| String::from_utf8_lossy(s.slice()).into_owned())
        });

        out.push(LineRow {
            address: row.address(),
            file,
            line: row.line().map(|n| n.get() as u32).unwrap_or(0),
        });
    }
    Ok(())
}

/// Canonicalizes a raw `Cow` section payload the caller already decompressed
/// via [`crate::elf::ElfObject::find_section`] into a `'static`-free borrow
/// gimli can read directly, without an extra copy when the section was not
/// compressed.
pub fn section_reader<'data>(data: &'data Cow<'data, [u8]>, endianness: Endianness) -> Reader<'data> {
    EndianSlice::new(data.as_ref(), gimli_endian(endianness))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn function_range_contains() {
        let f = FunctionRange { name: Some("main".into()), low_pc: 0x1000, high_pc: 0x1040 };
        assert!(f.contains(0x1000));
        assert!(f.contains(0x103f));
        assert!(!f.contains(0x1040));
    }

    #[test]
    fn debug_info_function_lookup_picks_innermost_preceding() {
        let info = DebugInfo {
            functions: vec![
                FunctionRange { name: Some("a".into()), low_pc: 0x1000, high_pc: 0x1010 },
                FunctionRange { name: Some("b".into()), low_pc: 0x2000, high_pc: 0x2010 },
            ],
            lines: vec![],
            _marker: std::marker::PhantomData,
        };

        assert_eq!(info.function_for_address(0x1005).unwrap().name.as_deref(), Some("a"));
        assert_eq!(info.function_for_address(0x1800), None);
        assert_eq!(info.function_for_address(0x2005).unwrap().name.as_deref(), Some("b"));
    }

    #[test]
    fn line_lookup_uses_preceding_row() {
        let info = DebugInfo {
            functions: vec![],
            lines: vec![
                LineRow { address: 0x1000, file: Some("a.c".into()), line: 10 },
                LineRow { address: 0x1010, file: Some("a.c".into()), line: 12 },
            ],
            _marker: std::marker::PhantomData,
        };

        assert_eq!(info.line_for_address(0x1005).unwrap().line, 10);
        assert_eq!(info.line_for_address(0x1010).unwrap().line, 12);
        assert_eq!(info.line_for_address(0x0fff), None);
    }
}
