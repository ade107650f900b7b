//! Classic relocations and the indirect symbol table: the oldest generation
//! of fixup metadata, still carried by pre-10.6 era binaries and kexts.
//! Local relocations are rebases; external relocations are binds through
//! the nlist table; the indirect symbol table drives the stub and
//! lazy/non-lazy pointer sections.

use core::ops::ControlFlow;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};
use crate::mach::constants::{
    INDIRECT_SYMBOL_ABS, INDIRECT_SYMBOL_LOCAL, SECTION_TYPE, S_LAZY_SYMBOL_POINTERS,
    S_NON_LAZY_SYMBOL_POINTERS, S_SYMBOL_STUBS,
};
use crate::mach::load_command::DysymtabCommand;
use crate::mach::segments::SegmentInfo;
use crate::mach::symbols::{self, Symbols};

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
/// A relocation entry as it appears in the linkedit relocation tables
pub struct RelocationInfo {
    /// offset in the section to what is being relocated
    pub r_address: i32,
    /// symbol index if r_extern == 1 or section ordinal if r_extern == 0,
    /// packed with the pcrel/length/extern/type bitfields
    pub r_info: u32,
}

pub const SIZEOF_RELOCATION_INFO: usize = 8;

impl RelocationInfo {
    /// symbol index or section ordinal
    pub fn r_symbolnum(&self) -> usize {
        (self.r_info & 0x00ff_ffff) as usize
    }
    /// was relocated pc relative already
    pub fn is_pic(&self) -> bool {
        (self.r_info >> 24) & 0x1 != 0
    }
    /// 0=byte, 1=word, 2=long, 3=quad
    pub fn r_length(&self) -> u8 {
        ((self.r_info >> 25) & 0x3) as u8
    }
    /// does not include value of sym referenced
    pub fn is_extern(&self) -> bool {
        (self.r_info >> 27) & 0x1 != 0
    }
    /// if not 0, machine specific relocation type
    pub fn r_type(&self) -> u8 {
        ((self.r_info >> 28) & 0xf) as u8
    }
}

/// The address classic relocations are relative to: the first writable
/// segment for 64-bit images, the first segment otherwise
pub fn reloc_base(segments: &[SegmentInfo], is64: bool) -> Result<u64> {
    if is64 {
        segments
            .iter()
            .find(|segment| segment.is_writable())
            .map(|segment| segment.vmaddr)
            .ok_or_else(|| {
                Error::Malformed("image has external relocations but no writable segment".into())
            })
    } else {
        segments
            .first()
            .map(|segment| segment.vmaddr)
            .ok_or_else(|| Error::Malformed("image has no segments".into()))
    }
}

fn read_relocs(bytes: &[u8], offset: u32, count: u32) -> Result<Vec<RelocationInfo>> {
    let start = offset as usize;
    let size = (count as usize)
        .checked_mul(SIZEOF_RELOCATION_INFO)
        .ok_or_else(|| Error::Malformed("relocation count overflows".into()))?;
    if start.checked_add(size).map(|end| end > bytes.len()).unwrap_or(true) {
        return Err(Error::Malformed(format!(
            "relocation table {:#x}..+{:#x} is outside the file",
            start, size
        )));
    }
    let mut relocs = Vec::with_capacity(count as usize);
    let mut cursor = start;
    for _ in 0..count {
        relocs.push(bytes.gread_with(&mut cursor, scroll::LE)?);
    }
    Ok(relocs)
}

/// Converts a classic relocation's address into `(segment index, offset in
/// segment, runtime offset)`, validating it lands inside a segment with
/// room for the relocated value
fn classic_location(
    segments: &[SegmentInfo],
    base: u64,
    r_address: i32,
    length: u64,
) -> Result<(usize, u64, u64)> {
    let addr = base.wrapping_add(r_address as u32 as u64);
    let image_base = super::segments::image_base(segments)
        .ok_or_else(|| Error::Malformed("image has no segments".into()))?;
    for (seg_index, segment) in segments.iter().enumerate() {
        if addr >= segment.vmaddr && addr < segment.vmaddr + segment.vmsize {
            let seg_offset = addr - segment.vmaddr;
            if !segment.covers(seg_offset, length) {
                return Err(Error::Malformed(format!(
                    "relocation at {:#x} runs off the end of segment {}",
                    addr, segment.name
                )));
            }
            return Ok((seg_index, seg_offset, addr - image_base));
        }
    }
    Err(Error::Malformed(format!(
        "relocation address {:#x} is not inside any segment",
        addr
    )))
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A classic local relocation, already converted to a rebase location
pub struct LocalReloc {
    pub seg_index: usize,
    pub seg_offset: u64,
    pub runtime_offset: u64,
    /// 4 or 8 bytes
    pub length: u8,
}

/// Walks the classic local relocation table, yielding rebase locations
pub fn for_each_local_reloc(
    bytes: &[u8],
    dysymtab: &DysymtabCommand,
    segments: &[SegmentInfo],
    is64: bool,
    mut handler: impl FnMut(&LocalReloc) -> ControlFlow<()>,
) -> Result<()> {
    if dysymtab.nlocrel == 0 {
        return Ok(());
    }
    let base = reloc_base(segments, is64)?;
    for reloc in read_relocs(bytes, dysymtab.locreloff, dysymtab.nlocrel)? {
        if reloc.is_extern() {
            return Err(Error::Malformed(
                "local relocation table contains an external entry".into(),
            ));
        }
        let length = match reloc.r_length() {
            2 => 4u64,
            3 => 8u64,
            other => {
                return Err(Error::Malformed(format!(
                    "unsupported local relocation length {}",
                    other
                )));
            }
        };
        let (seg_index, seg_offset, runtime_offset) =
            classic_location(segments, base, reloc.r_address, length)?;
        let event = LocalReloc {
            seg_index,
            seg_offset,
            runtime_offset,
            length: length as u8,
        };
        if handler(&event).is_break() {
            return Ok(());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// A classic external relocation, already resolved through the nlist table
pub struct ExternalReloc<'a> {
    pub seg_index: usize,
    pub seg_offset: u64,
    pub runtime_offset: u64,
    /// library ordinal from the symbol's n_desc; 0 for flat lookup images
    pub lib_ordinal: i32,
    pub symbol_name: &'a str,
    pub weak_import: bool,
    /// 4 or 8 bytes
    pub length: u8,
}

/// Walks the classic external relocation table. Each entry names an nlist
/// symbol; the bind target's library comes from the symbol's two-level
/// ordinal. The value currently stored at the location is the addend.
pub fn for_each_external_reloc<'a>(
    bytes: &'a [u8],
    dysymtab: &DysymtabCommand,
    segments: &[SegmentInfo],
    symbols: &Symbols<'a>,
    is64: bool,
    mut handler: impl FnMut(&ExternalReloc<'a>) -> ControlFlow<()>,
) -> Result<()> {
    if dysymtab.nextrel == 0 {
        return Ok(());
    }
    let base = reloc_base(segments, is64)?;
    for reloc in read_relocs(bytes, dysymtab.extreloff, dysymtab.nextrel)? {
        if !reloc.is_extern() {
            return Err(Error::Malformed(
                "external relocation table contains a local entry".into(),
            ));
        }
        let length = match reloc.r_length() {
            2 => 4u64,
            3 => 8u64,
            other => {
                return Err(Error::Malformed(format!(
                    "unsupported external relocation length {}",
                    other
                )));
            }
        };
        let (name, nlist) = symbols.get(reloc.r_symbolnum())?;
        let ordinal = i32::from(symbols::library_ordinal(nlist.n_desc));
        let lib_ordinal = match symbols::library_ordinal(nlist.n_desc) {
            symbols::SELF_LIBRARY_ORDINAL => 0,
            symbols::EXECUTABLE_ORDINAL => -1,
            symbols::DYNAMIC_LOOKUP_ORDINAL => -2,
            _ => ordinal,
        };
        let (seg_index, seg_offset, runtime_offset) =
            classic_location(segments, base, reloc.r_address, length)?;
        let event = ExternalReloc {
            seg_index,
            seg_offset,
            runtime_offset,
            lib_ordinal,
            symbol_name: name,
            weak_import: nlist.is_weak_ref(),
            length: length as u8,
        };
        if handler(&event).is_break() {
            return Ok(());
        }
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One slot of a stub or lazy/non-lazy pointer section
pub struct IndirectPointer<'a> {
    pub runtime_offset: u64,
    /// whether this slot lives in a lazy-pointer section
    pub lazy: bool,
    /// `None` for the ABS/LOCAL sentinels, which bind nothing but may
    /// still need a rebase
    pub bind: Option<IndirectBind<'a>>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct IndirectBind<'a> {
    pub lib_ordinal: i32,
    pub symbol_name: &'a str,
    pub weak_import: bool,
}

/// Walks every stub/lazy/non-lazy pointer section, resolving each slot
/// through the indirect symbol table into the nlist table
pub fn for_each_indirect_pointer<'a>(
    bytes: &'a [u8],
    dysymtab: &DysymtabCommand,
    segments: &[SegmentInfo],
    symbols: &Symbols<'a>,
    pointer_size: u64,
    mut handler: impl FnMut(&IndirectPointer<'a>) -> ControlFlow<()>,
) -> Result<()> {
    let image_base = match super::segments::image_base(segments) {
        Some(base) => base,
        None => return Ok(()),
    };
    for segment in segments {
        for section in &segment.sections {
            let section_type = section.flags & SECTION_TYPE;
            let entry_size = match section_type {
                S_LAZY_SYMBOL_POINTERS | S_NON_LAZY_SYMBOL_POINTERS => pointer_size,
                S_SYMBOL_STUBS => u64::from(section.reserved2),
                _ => continue,
            };
            if entry_size == 0 {
                return Err(Error::Malformed(format!(
                    "stub section {} has zero stub size",
                    section.name
                )));
            }
            let count = section.size / entry_size;
            let lazy = section_type == S_LAZY_SYMBOL_POINTERS;
            for i in 0..count {
                let indirect_index = u64::from(section.reserved1) + i;
                if indirect_index >= u64::from(dysymtab.nindirectsyms) {
                    return Err(Error::Malformed(format!(
                        "indirect symbol index {} is beyond the {} entry table",
                        indirect_index, dysymtab.nindirectsyms
                    )));
                }
                let table_offset =
                    dysymtab.indirectsymoff as usize + indirect_index as usize * 4;
                let symbol_index: u32 = bytes.pread_with(table_offset, scroll::LE)?;
                let runtime_offset = section.addr - image_base + i * entry_size;
                let bind = if symbol_index & (INDIRECT_SYMBOL_ABS | INDIRECT_SYMBOL_LOCAL) != 0 {
                    None
                } else {
                    let (name, nlist) = symbols.get(symbol_index as usize)?;
                    let raw_ordinal = symbols::library_ordinal(nlist.n_desc);
                    let lib_ordinal = match raw_ordinal {
                        symbols::SELF_LIBRARY_ORDINAL => 0,
                        symbols::EXECUTABLE_ORDINAL => -1,
                        symbols::DYNAMIC_LOOKUP_ORDINAL => -2,
                        _ => i32::from(raw_ordinal),
                    };
                    Some(IndirectBind {
                        lib_ordinal,
                        symbol_name: name,
                        weak_import: nlist.is_weak_ref(),
                    })
                };
                let event = IndirectPointer {
                    runtime_offset,
                    lazy,
                    bind,
                };
                if handler(&event).is_break() {
                    return Ok(());
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn relocation_bitfields() {
        // r_symbolnum=5, pcrel=0, length=3 (quad), extern=1, type=0
        let info = RelocationInfo {
            r_address: 0x10,
            r_info: 5 | (3 << 25) | (1 << 27),
        };
        assert_eq!(info.r_symbolnum(), 5);
        assert_eq!(info.r_length(), 3);
        assert!(info.is_extern());
        assert!(!info.is_pic());
        assert_eq!(info.r_type(), 0);
    }
}
