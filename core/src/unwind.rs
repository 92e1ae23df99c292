//! The CFI-driven unwinder: walks a thread's register state backwards
//! through the call stack, one frame at a time, using the CFA/register rules
//! [`crate::dwarf::CfiInfo`] resolves at each program counter.

use gimli::{CfaRule, RegisterRule};
use once_cell::sync::OnceCell;

use elfstack_common::{CpuFamily, Endianness};

use crate::dwarf::CfiInfo;
use crate::error::UnwindError;
use crate::process::{LoadedObject, Process, Registers};

/// Hard upper bound on frames produced per thread, guarding against a
/// corrupted or cyclic CFI program looping forever instead of terminating.
pub const MAX_FRAMES: usize = 4096;

/// One resolved stack frame: the program counter (already canonicalized to
/// the image's own addressing) and which loaded object it falls inside, if
/// any.
#[derive(Clone, Debug)]
pub struct Frame {
    /// Runtime program counter for this frame.
    pub pc: u64,
    /// Image-relative program counter, i.e. `pc` minus the owning object's
    /// load bias, suitable for symbol/DWARF lookups. `None` if `pc` did not
    /// fall inside any known loaded object.
    pub image_pc: Option<u64>,
    /// Index into the process's loaded-object list this frame belongs to.
    pub object_index: Option<usize>,
}

/// Produces the frame sequence for one thread, stopping at the first frame
/// whose pc has no CFI coverage, the cycle guard, or [`MAX_FRAMES`],
/// whichever comes first. Frames are yielded lazily: callers that only need
/// the top few frames never pay for unwinding the rest.
pub struct Unwinder<'p> {
    process: &'p Process,
    cfi_lookup: Box<dyn Fn(u64) -> Option<(&'p CfiInfo<'p>, i64)> + 'p>,
    registers: Registers,
    seen_cfas: Vec<u64>,
    done: bool,
    family: CpuFamily,
}

impl<'p> Unwinder<'p> {
    /// Creates an unwinder seeded with a thread's initial register state.
    ///
    /// `family` picks the DWARF register numbers for the instruction and
    /// stack pointer columns (§4.E step 5: "the return-address register in
    /// the caller's file becomes the caller's PC") — these differ by CPU
    /// family, not just by pointer width, so a family that isn't
    /// [`CpuFamily::Unknown`] is required to make any progress.
    ///
    /// `cfi_lookup` resolves a runtime pc to the [`CfiInfo`] covering it
    /// (found by locating the owning [`LoadedObject`] and its parsed
    /// `.eh_frame`/`.debug_frame`) together with that object's load bias.
    pub fn new(
        process: &'p Process,
        registers: Registers,
        family: CpuFamily,
        cfi_lookup: impl Fn(u64) -> Option<(&'p CfiInfo<'p>, i64)> + 'p,
    ) -> Self {
        Unwinder {
            process,
            cfi_lookup: Box::new(cfi_lookup),
            registers,
            seen_cfas: Vec::new(),
            done: false,
            family,
        }
    }

    fn step(&mut self) -> Result<Option<Frame>, UnwindError> {
        if self.done {
            return Ok(None);
        }

        let Some(ip_register) = self.family.ip_register_num() else {
            self.done = true;
            return Ok(None);
        };

        let pc = match self.registers.get(ip_register) {
            Some(pc) if pc != 0 => pc,
            _ => {
                self.done = true;
                return Ok(None);
            }
        };

        let (object_index, image_pc) = self.locate(pc);
        let frame = Frame { pc, image_pc, object_index };

        let Some((cfi, bias)) = (self.cfi_lookup)(pc) else {
            self.done = true;
            return Ok(Some(frame));
        };

        let section_pc = (pc as i64 - bias) as u64;
        let row = cfi.unwind_row(section_pc).map_err(UnwindError::from)?;

        let cfa = match row.cfa {
            CfaRule::RegisterAndOffset { register, offset } => {
                let base = self.registers.get(register.0).ok_or(UnwindError::NoUnwindInfo(pc))?;
                (base as i64 + offset) as u64
            }
            CfaRule::Expression(_) => return Err(UnwindError::NoUnwindInfo(pc)),
        };

        if self.seen_cfas.contains(&cfa) {
            self.done = true;
            return Ok(Some(frame));
        }
        self.seen_cfas.push(cfa);

        let pointer_size = self.family.pointer_size().unwrap_or(8);
        let sp_register = self.family.sp_register_num();
        let highest_register = sp_register.unwrap_or(ip_register).max(ip_register);

        let mut next = Registers::new();
        for dwarf_num in 0..=highest_register {
            let rule = row.register_rule(gimli::Register(dwarf_num));
            let value = match rule {
                RegisterRule::Undefined => continue,
                RegisterRule::SameValue => self.registers.get(dwarf_num),
                RegisterRule::Offset(offset) => {
                    let addr = (cfa as i64 + offset) as u64;
                    let mut buf = [0u8; 8];
                    self.process
                        .read_memory(addr, &mut buf[..pointer_size])
                        .ok()
                        .map(|_| u64::from_le_bytes(buf))
                }
                RegisterRule::ValOffset(offset) => Some((cfa as i64 + offset) as u64),
                RegisterRule::Register(other) => self.registers.get(other.0),
                _ => None,
            };
            if let Some(value) = value {
                next.set(dwarf_num, value);
            }
        }
        if let Some(sp_register) = sp_register {
            next.set(sp_register, cfa);
        }

        self.registers = next;
        Ok(Some(frame))
    }

    fn locate(&self, pc: u64) -> (Option<usize>, Option<u64>) {
        for (idx, object) in self.process.loaded_objects().iter().enumerate() {
            if object.contains(pc) {
                return (Some(idx), Some(object.to_file_address(pc)));
            }
        }
        (None, None)
    }
}

impl<'p> Iterator for Unwinder<'p> {
    type Item = Result<Frame, UnwindError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.seen_cfas.len() >= MAX_FRAMES {
            return None;
        }
        self.step().transpose()
    }
}

/// Finds the [`LoadedObject`] covering `pc`, if any.
pub fn find_object(process: &Process, pc: u64) -> Option<&LoadedObject> {
    process.loaded_objects().iter().find(|o| o.contains(pc))
}

/// Caches one [`CfiInfo`] per loaded object, preferring `.eh_frame` over
/// `.debug_frame`, so that unwinding many threads against the same process
/// only opens and parses each backing image's unwind section once.
///
/// A `CfiCache` borrows `process` for as long as it's kept around, and its
/// [`CfiCache::lookup`] method is built to be handed directly to
/// [`Unwinder::new`] as a `cfi_lookup` closure.
pub struct CfiCache<'p> {
    process: &'p Process,
    cache: Vec<OnceCell<Option<CfiInfo<'p>>>>,
}

impl<'p> CfiCache<'p> {
    /// Builds an (empty) cache sized to `process`'s current loaded-object
    /// list.
    pub fn new(process: &'p Process) -> Self {
        let cache = process.loaded_objects().iter().map(|_| OnceCell::new()).collect();
        CfiCache { process, cache }
    }

    /// Resolves `pc` to the [`CfiInfo`] covering it, plus the owning
    /// object's load bias.
    pub fn lookup(&self, pc: u64) -> Option<(&CfiInfo<'p>, i64)> {
        let (idx, object) =
            self.process.loaded_objects().iter().enumerate().find(|(_, o)| o.contains(pc))?;
        let slot = self.cache.get(idx)?;
        let cfi = slot.get_or_init(|| build_cfi_info(self.process, idx));
        cfi.as_ref().map(|info| (info, object.bias))
    }
}

fn build_cfi_info(process: &Process, index: usize) -> Option<CfiInfo<'_>> {
    let elf = process.elf_for(index)?;
    let address_size = elf.arch().pointer_size().unwrap_or(8) as u8;
    let endianness = if elf.is_little_endian() { Endianness::Little } else { Endianness::Big };

    if let Some((data, address)) = elf.unwind_section("eh_frame") {
        return Some(CfiInfo::from_eh_frame(data, address, 0, 0, address_size, endianness));
    }
    let (data, _) = elf.unwind_section("debug_frame")?;
    Some(CfiInfo::from_debug_frame(data, address_size, endianness))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn max_frames_bound_is_reasonable() {
        assert_eq!(MAX_FRAMES, 4096);
    }
}
