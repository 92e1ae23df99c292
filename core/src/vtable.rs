//! Scans core memory for C++ vtable pointers and histograms object counts by
//! symbol.
//!
//! The scanner never disassembles or otherwise understands object layout:
//! it only knows that every polymorphic C++ object begins with a pointer to
//! its class's vtable, and that the vtable symbol itself (`_ZTV...` by
//! convention) has a known, fixed address once the owning object is loaded.
//! Sweeping memory for words that exactly equal one of those addresses is
//! therefore a cheap, layout-agnostic proxy for "how many instances of this
//! class are alive in this snapshot".

use glob::Pattern;

use crate::elf::Symbol;
use crate::process::Process;

/// One candidate vtable symbol: its demangled-or-raw name and runtime
/// address (already rebased by the owning object's load bias).
#[derive(Clone, Debug)]
pub struct VtableSymbol {
    /// Symbol name, e.g. `_ZTV7MyClass`.
    pub name: String,
    /// Runtime address of the vtable symbol itself.
    pub address: u64,
    /// Declared size in bytes, `0` if unknown. A polymorphic object's vptr
    /// does not always equal `address` exactly — the Itanium ABI prefixes
    /// every vtable with an offset-to-top and RTTI pointer, so the vptr
    /// typically lands a word or two past the symbol's start — hence a hit
    /// is any word within `[address, address + size)`, not just `== address`.
    pub size: u64,
}

/// Configuration for one scan.
#[derive(Clone, Debug)]
pub struct ScanConfig {
    /// Glob pattern symbols must match to be considered a vtable candidate.
    /// Defaults to `_ZTV*`, the Itanium C++ ABI's vtable mangling prefix.
    pub symbol_pattern: String,
    /// If set, only sweep within this address range instead of every
    /// `PT_LOAD` segment.
    pub address_range: Option<(u64, u64)>,
    /// If set, only report counts for symbols whose name contains this
    /// literal substring (applied after glob matching).
    pub literal_filter: Option<String>,
    /// Whether to include symbols with a zero observed count in the output.
    pub show_zero_counts: bool,
}

impl Default for ScanConfig {
    fn default() -> Self {
        ScanConfig {
            symbol_pattern: "_ZTV*".to_string(),
            address_range: None,
            literal_filter: None,
            show_zero_counts: false,
        }
    }
}

/// One line of the histogram: a vtable symbol and how many memory words
/// matched its address.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct VtableCount {
    /// The matched symbol's name.
    pub name: String,
    /// Number of aligned memory words found equal to this symbol's address.
    pub count: usize,
}

/// Collects every symbol across a process's loaded objects whose name
/// matches `pattern`, sorted by address for the bisection sweep.
pub fn collect_candidates(
    symbols_by_object: &[(usize, i64, Vec<Symbol<'_>>)],
    pattern: &str,
) -> Result<Vec<VtableSymbol>, glob::PatternError> {
    let glob = Pattern::new(pattern)?;
    let mut candidates: Vec<VtableSymbol> = symbols_by_object
        .iter()
        .flat_map(|(_, bias, symbols)| {
            symbols.iter().filter_map(move |sym| {
                let name = sym.name?;
                if !glob.matches(name) {
                    return None;
                }
                Some(VtableSymbol {
                    name: name.to_string(),
                    address: (sym.address as i64 + bias) as u64,
                    size: sym.size,
                })
            })
        })
        .collect();

    dmsort::sort_by_key(&mut candidates, |c| c.address);
    candidates.dedup_by(|a, b| a.address == b.address);
    Ok(candidates)
}

/// Sweeps every `PT_LOAD`-backed page of `process`'s address space (or, if
/// `range` is set, just that byte range) a pointer-width word at a time,
/// bisecting each word against the address-sorted `candidates` array.
///
/// Counts are returned sorted by descending count, then by name, matching
/// the deterministic ordering the scanner's output must have regardless of
/// which order the underlying sweep visited memory in.
pub fn scan(
    process: &Process,
    candidates: &[VtableSymbol],
    config: &ScanConfig,
) -> Vec<VtableCount> {
    let mut counts = vec![0usize; candidates.len()];
    let pointer_size = 8usize;

    for (base, len) in sweep_ranges(process, config) {
        let mut offset = 0u64;
        let mut buf = [0u8; 8];
        while offset + pointer_size as u64 <= len {
            let addr = base + offset;
            if process.read_memory(addr, &mut buf).is_ok() {
                let word = u64::from_le_bytes(buf);
                if let Some(idx) = bisect_candidate(candidates, word) {
                    counts[idx] += 1;
                }
            }
            offset += pointer_size as u64;
        }
    }

    let mut results: Vec<VtableCount> = candidates
        .iter()
        .zip(counts)
        .filter(|(_, count)| config.show_zero_counts || *count > 0)
        .filter(|(symbol, _)| {
            config
                .literal_filter
                .as_deref()
                .map(|needle| symbol.name.contains(needle))
                .unwrap_or(true)
        })
        .map(|(symbol, count)| VtableCount { name: symbol.name.clone(), count })
        .collect();

    results.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));
    results
}

/// Finds the candidate owning `word`: the greatest entry with
/// `address <= word`, counted as a hit only if `address + size > word`
/// (size-`0` candidates therefore only ever match an exact address).
fn bisect_candidate(candidates: &[VtableSymbol], word: u64) -> Option<usize> {
    let idx = match candidates.binary_search_by_key(&word, |c| c.address) {
        Ok(idx) => idx,
        Err(0) => return None,
        Err(idx) => idx - 1,
    };
    let candidate = &candidates[idx];
    if word < candidate.address + candidate.size {
        Some(idx)
    } else {
        None
    }
}

/// Sweeps every `PT_LOAD`-backed range of `process`'s address space a
/// 4-byte-aligned word at a time, recording the address of every pointer-
/// sized word whose value falls in `[min, max)`.
///
/// The 4-byte step (rather than the 8-byte pointer width used for symbol
/// matching) follows a reference to an object from any of its misaligned
/// interior offsets, e.g. a `this`-adjusted pointer embedded in a base-class
/// subobject.
pub fn scan_references(process: &Process, min: u64, max: u64) -> Vec<u64> {
    let pointer_size = 8u64;
    let step = 4u64;
    let mut hits = Vec::new();

    for (base, len) in sweep_ranges(process, &ScanConfig::default()) {
        let mut offset = 0u64;
        let mut buf = [0u8; 8];
        while offset + pointer_size <= len {
            let addr = base + offset;
            if process.read_memory(addr, &mut buf).is_ok() {
                let word = u64::from_le_bytes(buf);
                if is_reference_hit(word, min, max) {
                    hits.push(addr);
                }
            }
            offset += step;
        }
    }

    dmsort::sort_by_key(&mut hits, |&addr| addr);
    hits
}

/// Scans every `PT_LOAD`-backed range of `process`'s address space bytewise
/// for `needle`, reporting the address of each match.
///
/// Unlike the symbol and reference sweeps this has no alignment: a C string
/// literal can start at any byte offset, so every candidate start position
/// within the range is tried.
pub fn scan_literal(process: &Process, needle: &[u8]) -> Vec<u64> {
    if needle.is_empty() {
        return Vec::new();
    }

    let mut hits = Vec::new();
    for (base, len) in sweep_ranges(process, &ScanConfig::default()) {
        let needle_len = needle.len() as u64;
        if len < needle_len {
            continue;
        }
        let mut buf = vec![0u8; needle.len()];
        for offset in 0..=(len - needle_len) {
            if process.read_memory(base + offset, &mut buf).is_ok() && buf == needle {
                hits.push(base + offset);
            }
        }
    }

    dmsort::sort_by_key(&mut hits, |&addr| addr);
    hits
}

/// `true` if `word` falls in the half-open reference range `[min, max)`.
fn is_reference_hit(word: u64, min: u64, max: u64) -> bool {
    word >= min && word < max
}

/// Ranges to sweep: an explicit `config.address_range` always wins; failing
/// that, a core's own `PT_LOAD` segments (§4.F step 3) so a scan counts each
/// mapped byte exactly once, falling back to `loaded_objects()` extents only
/// for a live process, which has no segment table of its own to read.
fn sweep_ranges(process: &Process, config: &ScanConfig) -> Vec<(u64, u64)> {
    if let Some((start, end)) = config.address_range {
        return vec![(start, end.saturating_sub(start))];
    }

    let core_segments = process.core_segments();
    if !core_segments.is_empty() {
        return core_segments;
    }

    process
        .loaded_objects()
        .iter()
        .map(|obj| (obj.base, obj.end.saturating_sub(obj.base)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use similar_asserts::assert_eq;

    #[test]
    fn collect_candidates_matches_glob_and_sorts() {
        let symbols = vec![
            Symbol { name: Some("_ZTV7MyClass"), address: 0x2000, size: 0 },
            Symbol { name: Some("_ZTV3Foo"), address: 0x1000, size: 0 },
            Symbol { name: Some("main"), address: 0x500, size: 0 },
        ];
        let grouped = vec![(0usize, 0i64, symbols)];

        let candidates = collect_candidates(&grouped, "_ZTV*").unwrap();
        assert_eq!(candidates.len(), 2);
        assert_eq!(candidates[0].address, 0x1000);
        assert_eq!(candidates[1].address, 0x2000);
    }

    #[test]
    fn scan_orders_by_descending_count_then_name() {
        let candidates = vec![
            VtableSymbol { name: "_ZTVa".into(), address: 0x10, size: 0x10 },
            VtableSymbol { name: "_ZTVb".into(), address: 0x20, size: 0x10 },
            VtableSymbol { name: "_ZTVc".into(), address: 0x30, size: 0x10 },
        ];

        let mut counts = vec![
            VtableCount { name: "_ZTVa".into(), count: 2 },
            VtableCount { name: "_ZTVb".into(), count: 5 },
            VtableCount { name: "_ZTVc".into(), count: 2 },
        ];
        counts.sort_by(|a, b| b.count.cmp(&a.count).then_with(|| a.name.cmp(&b.name)));

        assert_eq!(counts[0].name, "_ZTVb");
        assert_eq!(counts[1].name, "_ZTVa");
        assert_eq!(counts[2].name, "_ZTVc");
        let _ = candidates;
    }

    #[test]
    fn bisect_candidate_matches_within_declared_size() {
        let candidates = vec![
            VtableSymbol { name: "_ZTVa".into(), address: 0x1000, size: 0x18 },
            VtableSymbol { name: "_ZTVb".into(), address: 0x2000, size: 0 },
        ];

        // A vptr 0x10 bytes into `_ZTVa`'s table (past the offset-to-top and
        // RTTI prefix words) still counts as a hit.
        assert_eq!(bisect_candidate(&candidates, 0x1010), Some(0));
        assert_eq!(bisect_candidate(&candidates, 0x1018), None);
        // Size-0 candidates only match their exact address.
        assert_eq!(bisect_candidate(&candidates, 0x2000), Some(1));
        assert_eq!(bisect_candidate(&candidates, 0x2001), None);
        assert_eq!(bisect_candidate(&candidates, 0x0fff), None);
    }

    #[test]
    fn reference_hit_is_half_open() {
        assert!(is_reference_hit(0x1000, 0x1000, 0x2000));
        assert!(is_reference_hit(0x1fff, 0x1000, 0x2000));
        assert!(!is_reference_hit(0x2000, 0x1000, 0x2000));
        assert!(!is_reference_hit(0x0fff, 0x1000, 0x2000));
    }

}
