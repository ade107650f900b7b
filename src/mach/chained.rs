//! Chained fixups: the linkedit blob behind `LC_DYLD_CHAINED_FIXUPS`. Bind
//! ordinals and rebase targets are packed into the pointers themselves, and
//! every pointer carries the offset to the next one, so whole pages can be
//! fixed up by walking a chain.
//!
//! The blob layout is: a `dyld_chained_fixups_header`, a starts table with
//! one entry per segment, an imports table, and a symbol-name pool.

use core::ops::ControlFlow;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};

/// Known values of `dyld_chained_fixups_header.fixups_version`
pub const DYLD_CHAINED_FIXUPS_VERSION: u32 = 0;

// values for dyld_chained_fixups_header.imports_format
pub const DYLD_CHAINED_IMPORT: u32 = 1;
pub const DYLD_CHAINED_IMPORT_ADDEND: u32 = 2;
pub const DYLD_CHAINED_IMPORT_ADDEND64: u32 = 3;

// values for dyld_chained_starts_in_segment.pointer_format
pub const DYLD_CHAINED_PTR_ARM64E: u16 = 1;
pub const DYLD_CHAINED_PTR_64: u16 = 2;
pub const DYLD_CHAINED_PTR_32: u16 = 3;
pub const DYLD_CHAINED_PTR_32_CACHE: u16 = 4;
pub const DYLD_CHAINED_PTR_32_FIRMWARE: u16 = 5;
pub const DYLD_CHAINED_PTR_64_OFFSET: u16 = 6;
pub const DYLD_CHAINED_PTR_ARM64E_KERNEL: u16 = 7;
pub const DYLD_CHAINED_PTR_64_KERNEL_CACHE: u16 = 8;
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND: u16 = 9;
pub const DYLD_CHAINED_PTR_ARM64E_FIRMWARE: u16 = 10;
pub const DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE: u16 = 11;
pub const DYLD_CHAINED_PTR_ARM64E_USERLAND24: u16 = 12;
pub const DYLD_CHAINED_PTR_ARM64E_SHARED_CACHE: u16 = 13;

// values for dyld_chained_starts_in_segment.page_start
/// page has no fixups
pub const DYLD_CHAINED_PTR_START_NONE: u16 = 0xffff;
/// page has multiple chain starts; low bits index the overflow list
pub const DYLD_CHAINED_PTR_START_MULTI: u16 = 0x8000;
/// last entry of a multi-start run
pub const DYLD_CHAINED_PTR_START_LAST: u16 = 0x8000;

/// ptrauth key names, by key number
pub fn ptrauth_key_name(key: u8) -> &'static str {
    match key {
        0 => "IA",
        1 => "IB",
        2 => "DA",
        3 => "DB",
        _ => "??",
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// Header of the LC_DYLD_CHAINED_FIXUPS linkedit blob
pub struct ChainedFixupsHeader {
    /// 0
    pub fixups_version: u32,
    /// offset of dyld_chained_starts_in_image in chain_data
    pub starts_offset: u32,
    /// offset of imports table in chain_data
    pub imports_offset: u32,
    /// offset of symbol strings in chain_data
    pub symbols_offset: u32,
    /// number of imported symbol names
    pub imports_count: u32,
    /// DYLD_CHAINED_IMPORT*
    pub imports_format: u32,
    /// 0 => uncompressed, 1 => zlib compressed
    pub symbols_format: u32,
}

pub const SIZEOF_CHAINED_FIXUPS_HEADER: usize = 28;

/// fixed-size prefix of dyld_chained_starts_in_segment, before the
/// page_start array
pub const SIZEOF_STARTS_IN_SEGMENT_PREFIX: usize = 22;

#[derive(Debug, Clone)]
/// The decoded chain-starts record for one segment
pub struct ChainedStartsInSegment {
    /// size of this record, including the page_start array
    pub size: u32,
    /// 0x1000 or 0x4000
    pub page_size: u16,
    /// DYLD_CHAINED_PTR_*
    pub pointer_format: u16,
    /// offset of the segment from the mach header
    pub segment_offset: u64,
    /// for 32-bit formats, values beyond this are non-pointers
    pub max_valid_pointer: u32,
    /// one entry per page: offset in page of first fixup, or START_NONE,
    /// or START_MULTI | index into `overflow`
    pub page_starts: Vec<u16>,
    /// multi-start overflow entries, terminated per run by START_LAST
    pub overflow: Vec<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One entry of the chained imports table
pub struct ChainedImport<'a> {
    /// positive: 1-based dependent index; zero/negative: special namespace
    pub lib_ordinal: i32,
    pub weak_import: bool,
    pub name: &'a str,
    pub addend: i64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// Pointer metadata: how the final pointer is signed, or which high-8 tag
/// it carries
pub struct PointerMetadata {
    /// ptrauth key number (IA/IB/DA/DB)
    pub key: u8,
    /// mix the location address into the signature
    pub uses_addr_diversity: bool,
    /// 16-bit extra diversity
    pub diversity: u16,
    /// tag restored into the top byte of the final pointer
    pub high8: u8,
    /// whether the location is signed at all
    pub authenticated: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// What one chained-fixup location wants
pub enum ChainedFixup {
    /// point the location at `target` bytes past the image's load address
    Rebase { target_runtime_offset: u64, pmd: PointerMetadata },
    /// point the location at import `ordinal`, plus the import's addend
    Bind { ordinal: u32, addend: i64, pmd: PointerMetadata },
}

#[inline]
fn bits(value: u64, shift: u32, count: u32) -> u64 {
    (value >> shift) & ((1u64 << count) - 1)
}

/// The byte stride between chain links for a pointer format
pub fn stride(pointer_format: u16) -> Result<u64> {
    match pointer_format {
        DYLD_CHAINED_PTR_ARM64E
        | DYLD_CHAINED_PTR_ARM64E_USERLAND
        | DYLD_CHAINED_PTR_ARM64E_USERLAND24
        | DYLD_CHAINED_PTR_ARM64E_SHARED_CACHE => Ok(8),
        DYLD_CHAINED_PTR_ARM64E_KERNEL
        | DYLD_CHAINED_PTR_ARM64E_FIRMWARE
        | DYLD_CHAINED_PTR_64
        | DYLD_CHAINED_PTR_64_OFFSET
        | DYLD_CHAINED_PTR_64_KERNEL_CACHE
        | DYLD_CHAINED_PTR_32
        | DYLD_CHAINED_PTR_32_CACHE
        | DYLD_CHAINED_PTR_32_FIRMWARE => Ok(4),
        DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE => Ok(1),
        _ => Err(Error::Malformed(format!(
            "unknown chained pointer format {}",
            pointer_format
        ))),
    }
}

/// Whether the format stores 32-bit pointers
pub fn is_32bit_format(pointer_format: u16) -> bool {
    matches!(
        pointer_format,
        DYLD_CHAINED_PTR_32 | DYLD_CHAINED_PTR_32_CACHE | DYLD_CHAINED_PTR_32_FIRMWARE
    )
}

/// The link count to the next fixup encoded in `raw`, in strides; zero
/// terminates the chain
pub fn next_links(raw: u64, pointer_format: u16) -> Result<u64> {
    match pointer_format {
        DYLD_CHAINED_PTR_ARM64E
        | DYLD_CHAINED_PTR_ARM64E_KERNEL
        | DYLD_CHAINED_PTR_ARM64E_USERLAND
        | DYLD_CHAINED_PTR_ARM64E_USERLAND24
        | DYLD_CHAINED_PTR_ARM64E_FIRMWARE
        | DYLD_CHAINED_PTR_ARM64E_SHARED_CACHE => Ok(bits(raw, 51, 11)),
        DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => Ok(bits(raw, 51, 12)),
        DYLD_CHAINED_PTR_64_KERNEL_CACHE | DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE => {
            Ok(bits(raw, 51, 12))
        }
        DYLD_CHAINED_PTR_32 => Ok(bits(raw, 26, 5)),
        DYLD_CHAINED_PTR_32_CACHE => Ok(bits(raw, 30, 2)),
        DYLD_CHAINED_PTR_32_FIRMWARE => Ok(bits(raw, 26, 6)),
        _ => Err(Error::Malformed(format!(
            "unknown chained pointer format {}",
            pointer_format
        ))),
    }
}

/// Decodes the raw chained value at a location into what it wants.
/// `preferred_load_address` is needed by the formats whose rebase target is
/// an unslid vmaddr rather than a runtime offset.
pub fn decode(raw: u64, pointer_format: u16, preferred_load_address: u64) -> Result<ChainedFixup> {
    match pointer_format {
        DYLD_CHAINED_PTR_ARM64E
        | DYLD_CHAINED_PTR_ARM64E_KERNEL
        | DYLD_CHAINED_PTR_ARM64E_USERLAND
        | DYLD_CHAINED_PTR_ARM64E_USERLAND24 => {
            let auth = bits(raw, 63, 1) != 0;
            let bind = bits(raw, 62, 1) != 0;
            let pmd = if auth {
                PointerMetadata {
                    key: bits(raw, 49, 2) as u8,
                    uses_addr_diversity: bits(raw, 48, 1) != 0,
                    diversity: bits(raw, 32, 16) as u16,
                    high8: 0,
                    authenticated: true,
                }
            } else {
                PointerMetadata::default()
            };
            match (bind, auth) {
                (true, _) => {
                    let ordinal = if pointer_format == DYLD_CHAINED_PTR_ARM64E_USERLAND24 {
                        bits(raw, 0, 24) as u32
                    } else {
                        bits(raw, 0, 16) as u32
                    };
                    // the embedded addend only exists on unauthenticated binds
                    let addend = if auth {
                        0
                    } else {
                        sign_extend(bits(raw, 32, 19), 19)
                    };
                    Ok(ChainedFixup::Bind {
                        ordinal,
                        addend,
                        pmd,
                    })
                }
                (false, true) => Ok(ChainedFixup::Rebase {
                    target_runtime_offset: bits(raw, 0, 32),
                    pmd,
                }),
                (false, false) => {
                    let target = bits(raw, 0, 43);
                    let high8 = bits(raw, 43, 8) as u8;
                    let target_runtime_offset = if pointer_format == DYLD_CHAINED_PTR_ARM64E {
                        target.wrapping_sub(preferred_load_address)
                    } else {
                        target
                    };
                    Ok(ChainedFixup::Rebase {
                        target_runtime_offset,
                        pmd: PointerMetadata {
                            high8,
                            ..PointerMetadata::default()
                        },
                    })
                }
            }
        }
        DYLD_CHAINED_PTR_64 | DYLD_CHAINED_PTR_64_OFFSET => {
            let bind = bits(raw, 63, 1) != 0;
            if bind {
                Ok(ChainedFixup::Bind {
                    ordinal: bits(raw, 0, 24) as u32,
                    addend: bits(raw, 24, 8) as i64,
                    pmd: PointerMetadata::default(),
                })
            } else {
                let target = bits(raw, 0, 36);
                let high8 = bits(raw, 36, 8) as u8;
                let target_runtime_offset = if pointer_format == DYLD_CHAINED_PTR_64 {
                    target.wrapping_sub(preferred_load_address)
                } else {
                    target
                };
                Ok(ChainedFixup::Rebase {
                    target_runtime_offset,
                    pmd: PointerMetadata {
                        high8,
                        ..PointerMetadata::default()
                    },
                })
            }
        }
        DYLD_CHAINED_PTR_ARM64E_SHARED_CACHE => {
            let auth = bits(raw, 63, 1) != 0;
            if auth {
                Ok(ChainedFixup::Rebase {
                    target_runtime_offset: bits(raw, 0, 34),
                    pmd: PointerMetadata {
                        // keyIsData selects DA over IA
                        key: if bits(raw, 51, 1) != 0 { 2 } else { 0 },
                        uses_addr_diversity: bits(raw, 50, 1) != 0,
                        diversity: bits(raw, 34, 16) as u16,
                        high8: 0,
                        authenticated: true,
                    },
                })
            } else {
                Ok(ChainedFixup::Rebase {
                    target_runtime_offset: bits(raw, 0, 34),
                    pmd: PointerMetadata {
                        high8: bits(raw, 34, 8) as u8,
                        ..PointerMetadata::default()
                    },
                })
            }
        }
        DYLD_CHAINED_PTR_64_KERNEL_CACHE | DYLD_CHAINED_PTR_X86_64_KERNEL_CACHE => {
            let auth = bits(raw, 63, 1) != 0;
            Ok(ChainedFixup::Rebase {
                target_runtime_offset: bits(raw, 0, 30),
                pmd: PointerMetadata {
                    key: bits(raw, 49, 2) as u8,
                    uses_addr_diversity: bits(raw, 48, 1) != 0,
                    diversity: bits(raw, 32, 16) as u16,
                    high8: 0,
                    authenticated: auth,
                },
            })
        }
        DYLD_CHAINED_PTR_32 => {
            let bind = bits(raw, 31, 1) != 0;
            if bind {
                Ok(ChainedFixup::Bind {
                    ordinal: bits(raw, 0, 20) as u32,
                    addend: bits(raw, 20, 6) as i64,
                    pmd: PointerMetadata::default(),
                })
            } else {
                Ok(ChainedFixup::Rebase {
                    target_runtime_offset: bits(raw, 0, 26)
                        .wrapping_sub(preferred_load_address),
                    pmd: PointerMetadata::default(),
                })
            }
        }
        DYLD_CHAINED_PTR_32_CACHE => Ok(ChainedFixup::Rebase {
            target_runtime_offset: bits(raw, 0, 30),
            pmd: PointerMetadata::default(),
        }),
        DYLD_CHAINED_PTR_32_FIRMWARE => Ok(ChainedFixup::Rebase {
            target_runtime_offset: bits(raw, 0, 26).wrapping_sub(preferred_load_address),
            pmd: PointerMetadata::default(),
        }),
        _ => Err(Error::Malformed(format!(
            "unknown chained pointer format {}",
            pointer_format
        ))),
    }
}

#[inline]
fn sign_extend(value: u64, bits_count: u32) -> i64 {
    let shift = 64 - bits_count;
    ((value << shift) as i64) >> shift
}

/// A zero-copy view over the chained-fixups linkedit blob
#[derive(Debug)]
pub struct ChainedFixups<'a> {
    data: &'a [u8],
    pub header: ChainedFixupsHeader,
}

impl<'a> ChainedFixups<'a> {
    /// Parses and sanity-checks the blob header
    pub fn parse(data: &'a [u8]) -> Result<ChainedFixups<'a>> {
        let header: ChainedFixupsHeader = data.pread_with(0, scroll::LE)?;
        if header.fixups_version != DYLD_CHAINED_FIXUPS_VERSION {
            return Err(Error::Malformed(format!(
                "chained fixups, unknown fixups_version {}",
                header.fixups_version
            )));
        }
        match header.imports_format {
            DYLD_CHAINED_IMPORT | DYLD_CHAINED_IMPORT_ADDEND | DYLD_CHAINED_IMPORT_ADDEND64 => {}
            _ => {
                return Err(Error::Malformed(format!(
                    "chained fixups, unknown imports_format {}",
                    header.imports_format
                )));
            }
        }
        if header.starts_offset as usize >= data.len() && header.starts_offset != 0 {
            return Err(Error::Malformed(
                "chained fixups starts_offset is outside the blob".into(),
            ));
        }
        Ok(ChainedFixups { data, header })
    }

    /// The per-segment starts table; `None` entries are segments with no
    /// fixups. An empty starts table is accepted and produces no fixups.
    pub fn starts(&self) -> Result<Vec<Option<ChainedStartsInSegment>>> {
        let base = self.header.starts_offset as usize;
        let seg_count: u32 = self.data.pread_with(base, scroll::LE)?;
        let mut segments = Vec::with_capacity(seg_count as usize);
        for i in 0..seg_count as usize {
            let seg_info_offset: u32 = self.data.pread_with(base + 4 + i * 4, scroll::LE)?;
            if seg_info_offset == 0 {
                segments.push(None);
                continue;
            }
            let seg_base = base + seg_info_offset as usize;
            let size: u32 = self.data.pread_with(seg_base, scroll::LE)?;
            let page_size: u16 = self.data.pread_with(seg_base + 4, scroll::LE)?;
            let pointer_format: u16 = self.data.pread_with(seg_base + 6, scroll::LE)?;
            let segment_offset: u64 = self.data.pread_with(seg_base + 8, scroll::LE)?;
            let max_valid_pointer: u32 = self.data.pread_with(seg_base + 16, scroll::LE)?;
            let page_count: u16 = self.data.pread_with(seg_base + 20, scroll::LE)?;
            if page_size != 0x1000 && page_size != 0x4000 {
                return Err(Error::Malformed(format!(
                    "chained fixups, page_size not 4KB or 16KB in segment #{}",
                    i
                )));
            }
            stride(pointer_format)?;
            let words_end = (size as usize)
                .checked_sub(SIZEOF_STARTS_IN_SEGMENT_PREFIX)
                .ok_or_else(|| {
                    Error::Malformed(format!(
                        "chained fixups, starts record too small in segment #{}",
                        i
                    ))
                })?
                / 2;
            if usize::from(page_count) > words_end {
                return Err(Error::Malformed(format!(
                    "chained fixups, page_count {} overflows its record in segment #{}",
                    page_count, i
                )));
            }
            let mut words = Vec::with_capacity(words_end);
            for w in 0..words_end {
                let word: u16 = self
                    .data
                    .pread_with(seg_base + SIZEOF_STARTS_IN_SEGMENT_PREFIX + w * 2, scroll::LE)?;
                words.push(word);
            }
            let page_starts = words[..usize::from(page_count)].to_vec();
            let overflow = words[usize::from(page_count)..].to_vec();
            // multi-start indices must stay inside the overflow list, and
            // each run's starts must ascend within the page
            for &start in &page_starts {
                if start == DYLD_CHAINED_PTR_START_NONE {
                    continue;
                }
                if start & DYLD_CHAINED_PTR_START_MULTI != 0 {
                    let mut index = usize::from(start & !DYLD_CHAINED_PTR_START_MULTI)
                        .checked_sub(usize::from(page_count))
                        .ok_or_else(|| {
                            Error::Malformed(
                                "chained fixups, multi-start index before overflow area".into(),
                            )
                        })?;
                    let mut last: Option<u16> = None;
                    loop {
                        let entry = *overflow.get(index).ok_or_else(|| {
                            Error::Malformed(
                                "chained fixups, multi-start index escapes its record".into(),
                            )
                        })?;
                        let offset_in_page = entry & !DYLD_CHAINED_PTR_START_LAST;
                        if offset_in_page > page_size {
                            return Err(Error::Malformed(
                                "chained fixups, chain start beyond its page".into(),
                            ));
                        }
                        if let Some(previous) = last {
                            if offset_in_page <= previous {
                                return Err(Error::Malformed(
                                    "chained fixups, chain starts not ascending in page".into(),
                                ));
                            }
                        }
                        last = Some(offset_in_page);
                        if entry & DYLD_CHAINED_PTR_START_LAST != 0 {
                            break;
                        }
                        index += 1;
                    }
                } else if start > page_size {
                    return Err(Error::Malformed(
                        "chained fixups, chain start beyond its page".into(),
                    ));
                }
            }
            segments.push(Some(ChainedStartsInSegment {
                size,
                page_size,
                pointer_format,
                segment_offset,
                max_valid_pointer,
                page_starts,
                overflow,
            }));
        }
        Ok(segments)
    }

    /// Walks the imports table. Three record widths are supported, per the
    /// header's imports_format.
    pub fn for_each_import(
        &self,
        mut handler: impl FnMut(u32, &ChainedImport<'a>) -> ControlFlow<()>,
    ) -> Result<()> {
        let symbols = self.header.symbols_offset as usize;
        for index in 0..self.header.imports_count {
            let import = self.import(index, symbols)?;
            if handler(index, &import).is_break() {
                return Ok(());
            }
        }
        Ok(())
    }

    /// Reads one import record
    pub fn import(&self, index: u32, symbols_offset: usize) -> Result<ChainedImport<'a>> {
        if index >= self.header.imports_count {
            return Err(Error::Malformed(format!(
                "chained fixups, bind ordinal {} beyond the {} imports",
                index, self.header.imports_count
            )));
        }
        let base = self.header.imports_offset as usize;
        let (lib_ordinal_raw, weak_import, name_offset, addend) = match self.header.imports_format {
            DYLD_CHAINED_IMPORT => {
                let raw: u32 = self.data.pread_with(base + index as usize * 4, scroll::LE)?;
                (
                    i32::from(sign_extend8((raw & 0xff) as u8)),
                    raw & 0x100 != 0,
                    (raw >> 9) as usize,
                    0i64,
                )
            }
            DYLD_CHAINED_IMPORT_ADDEND => {
                let record = base + index as usize * 8;
                let raw: u32 = self.data.pread_with(record, scroll::LE)?;
                let addend: i32 = self.data.pread_with(record + 4, scroll::LE)?;
                (
                    i32::from(sign_extend8((raw & 0xff) as u8)),
                    raw & 0x100 != 0,
                    (raw >> 9) as usize,
                    i64::from(addend),
                )
            }
            DYLD_CHAINED_IMPORT_ADDEND64 => {
                let record = base + index as usize * 16;
                let raw: u64 = self.data.pread_with(record, scroll::LE)?;
                let addend: i64 = self.data.pread_with(record + 8, scroll::LE)?;
                (
                    i32::from(sign_extend16((raw & 0xffff) as u16)),
                    raw & 0x1_0000 != 0,
                    bits(raw, 32, 32) as usize,
                    addend,
                )
            }
            _ => unreachable!("imports_format is validated at parse"),
        };
        let name_start = symbols_offset + name_offset;
        let name_bytes = self.data.get(name_start..).ok_or_else(|| {
            Error::Malformed("chained fixups, import name is outside the blob".into())
        })?;
        let nul = name_bytes.iter().position(|&b| b == 0).ok_or_else(|| {
            Error::Malformed("chained fixups, import name is not NUL-terminated".into())
        })?;
        let name = core::str::from_utf8(&name_bytes[..nul])
            .map_err(|_| Error::Malformed("chained fixups, import name is not utf-8".into()))?;
        Ok(ChainedImport {
            lib_ordinal: lib_ordinal_raw,
            weak_import,
            name,
            addend,
        })
    }
}

/// two-level ordinals are 8-bit in the narrow import formats, with the top
/// values sign-extended to the special namespaces
fn sign_extend8(byte: u8) -> i8 {
    byte as i8
}

fn sign_extend16(half: u16) -> i16 {
    half as i16
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One chained-fixup location inside a mapped segment
pub struct ChainLocation {
    /// offset of the location from the image's mach header
    pub runtime_offset: u64,
    /// the raw (still chained) value currently stored there
    pub raw: u64,
    pub pointer_format: u16,
}

/// Walks every fixup chain in one segment over the image's mapped bytes.
/// `image` must cover the whole mapped image, with the mach header at
/// offset 0; chains are read from it but never written - the handler owns
/// any patching, and the link to the next location is extracted before the
/// handler runs so patching in place is safe.
pub fn for_each_chain_location(
    starts: &ChainedStartsInSegment,
    image: &[u8],
    mut handler: impl FnMut(&ChainLocation) -> ControlFlow<()>,
) -> Result<()> {
    let stride = stride(starts.pointer_format)?;
    let wide = !is_32bit_format(starts.pointer_format);
    for (page_index, &page_start) in starts.page_starts.iter().enumerate() {
        if page_start == DYLD_CHAINED_PTR_START_NONE {
            continue;
        }
        if page_start & DYLD_CHAINED_PTR_START_MULTI != 0 {
            let mut index = usize::from(page_start & !DYLD_CHAINED_PTR_START_MULTI)
                .checked_sub(starts.page_starts.len())
                .ok_or_else(|| {
                    Error::Malformed("chained fixups, multi-start index before overflow area".into())
                })?;
            loop {
                let entry = *starts.overflow.get(index).ok_or_else(|| {
                    Error::Malformed("chained fixups, multi-start index escapes its record".into())
                })?;
                let offset = entry & !DYLD_CHAINED_PTR_START_LAST;
                walk_one_chain(
                    starts,
                    image,
                    page_index,
                    u64::from(offset),
                    stride,
                    wide,
                    &mut handler,
                )?;
                if entry & DYLD_CHAINED_PTR_START_LAST != 0 {
                    break;
                }
                index += 1;
            }
        } else {
            walk_one_chain(
                starts,
                image,
                page_index,
                u64::from(page_start),
                stride,
                wide,
                &mut handler,
            )?;
        }
    }
    Ok(())
}

fn walk_one_chain(
    starts: &ChainedStartsInSegment,
    image: &[u8],
    page_index: usize,
    first_offset: u64,
    stride: u64,
    wide: bool,
    handler: &mut impl FnMut(&ChainLocation) -> ControlFlow<()>,
) -> Result<()> {
    let page_base = starts
        .segment_offset
        .checked_add(page_index as u64 * u64::from(starts.page_size))
        .ok_or_else(|| Error::Malformed("chained fixups, page offset overflows".into()))?;
    let mut offset_in_page = first_offset;
    loop {
        if offset_in_page > u64::from(starts.page_size) {
            return Err(Error::Malformed(
                "chained fixups, chain ran past the end of its page".into(),
            ));
        }
        let location = page_base + offset_in_page;
        let end = location as usize + if wide { 8 } else { 4 };
        if end > image.len() {
            return Err(Error::Malformed(
                "chained fixups, chain location outside the image".into(),
            ));
        }
        let raw: u64 = if wide {
            image.pread_with(location as usize, scroll::LE)?
        } else {
            u64::from(image.pread_with::<u32>(location as usize, scroll::LE)?)
        };
        let links = next_links(raw, starts.pointer_format)?;
        let flow = handler(&ChainLocation {
            runtime_offset: location,
            raw,
            pointer_format: starts.pointer_format,
        });
        if flow.is_break() || links == 0 {
            return Ok(());
        }
        offset_in_page += links * stride;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ptr64_bind_and_rebase_decode() {
        // bind: ordinal 7, addend 3
        let raw = (1u64 << 63) | (3 << 24) | 7;
        match decode(raw, DYLD_CHAINED_PTR_64, 0x1_0000).unwrap() {
            ChainedFixup::Bind { ordinal, addend, pmd } => {
                assert_eq!(ordinal, 7);
                assert_eq!(addend, 3);
                assert!(!pmd.authenticated);
            }
            other => panic!("expected bind, got {:?}", other),
        }
        // rebase: vmaddr 0x1_4000 with high8 0x80, preferred base 0x1_0000
        let raw = (0x80u64 << 36) | 0x1_4000;
        match decode(raw, DYLD_CHAINED_PTR_64, 0x1_0000).unwrap() {
            ChainedFixup::Rebase {
                target_runtime_offset,
                pmd,
            } => {
                assert_eq!(target_runtime_offset, 0x4000);
                assert_eq!(pmd.high8, 0x80);
            }
            other => panic!("expected rebase, got {:?}", other),
        }
    }

    #[test]
    fn arm64e_auth_bind_carries_pmd() {
        // auth=1 bind=1 key=DA(2) addrDiv=1 diversity=0xbeef ordinal=9
        let raw = (1u64 << 63) | (1 << 62) | (2 << 49) | (1 << 48) | (0xbeefu64 << 32) | 9;
        match decode(raw, DYLD_CHAINED_PTR_ARM64E, 0).unwrap() {
            ChainedFixup::Bind { ordinal, pmd, .. } => {
                assert_eq!(ordinal, 9);
                assert!(pmd.authenticated);
                assert!(pmd.uses_addr_diversity);
                assert_eq!(pmd.key, 2);
                assert_eq!(pmd.diversity, 0xbeef);
            }
            other => panic!("expected bind, got {:?}", other),
        }
    }

    #[test]
    fn unknown_format_is_malformed() {
        assert!(decode(0, 99, 0).is_err());
        assert!(stride(99).is_err());
    }

    #[test]
    fn next_links_for_64bit_formats() {
        let raw = 5u64 << 51;
        assert_eq!(next_links(raw, DYLD_CHAINED_PTR_64).unwrap(), 5);
        assert_eq!(next_links(raw, DYLD_CHAINED_PTR_ARM64E).unwrap(), 5);
    }
}
