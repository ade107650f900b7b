//! The compressed dyld-info opcode streams: a byte-coded state machine per
//! stream, one for rebases and one for binds (regular, lazy, and weak). The
//! decoders refuse unknown opcodes and any emission that would land outside
//! its segment.

use core::ops::ControlFlow;

use crate::error::{Error, Result};
use crate::mach::constants::{SECTION_TYPE, S_LAZY_SYMBOL_POINTERS};
use crate::mach::segments::SegmentInfo;
use crate::mach::uleb::{read_sleb128, read_uleb128};

pub const REBASE_TYPE_POINTER: u8 = 1;
pub const REBASE_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const REBASE_TYPE_TEXT_PCREL32: u8 = 3;

pub const REBASE_OPCODE_MASK: u8 = 0xf0;
pub const REBASE_IMMEDIATE_MASK: u8 = 0x0f;
pub const REBASE_OPCODE_DONE: u8 = 0x00;
pub const REBASE_OPCODE_SET_TYPE_IMM: u8 = 0x10;
pub const REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x20;
pub const REBASE_OPCODE_ADD_ADDR_ULEB: u8 = 0x30;
pub const REBASE_OPCODE_ADD_ADDR_IMM_SCALED: u8 = 0x40;
pub const REBASE_OPCODE_DO_REBASE_IMM_TIMES: u8 = 0x50;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES: u8 = 0x60;
pub const REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB: u8 = 0x70;
pub const REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB: u8 = 0x80;

pub const BIND_TYPE_POINTER: u8 = 1;
pub const BIND_TYPE_TEXT_ABSOLUTE32: u8 = 2;
pub const BIND_TYPE_TEXT_PCREL32: u8 = 3;

pub const BIND_SPECIAL_DYLIB_SELF: i32 = 0;
pub const BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE: i32 = -1;
pub const BIND_SPECIAL_DYLIB_FLAT_LOOKUP: i32 = -2;
pub const BIND_SPECIAL_DYLIB_WEAK_LOOKUP: i32 = -3;

pub const BIND_SYMBOL_FLAGS_WEAK_IMPORT: u8 = 0x1;
pub const BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION: u8 = 0x8;

pub const BIND_OPCODE_MASK: u8 = 0xf0;
pub const BIND_IMMEDIATE_MASK: u8 = 0x0f;
pub const BIND_OPCODE_DONE: u8 = 0x00;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_IMM: u8 = 0x10;
pub const BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB: u8 = 0x20;
pub const BIND_OPCODE_SET_DYLIB_SPECIAL_IMM: u8 = 0x30;
pub const BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM: u8 = 0x40;
pub const BIND_OPCODE_SET_TYPE_IMM: u8 = 0x50;
pub const BIND_OPCODE_SET_ADDEND_SLEB: u8 = 0x60;
pub const BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB: u8 = 0x70;
pub const BIND_OPCODE_ADD_ADDR_ULEB: u8 = 0x80;
pub const BIND_OPCODE_DO_BIND: u8 = 0x90;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB: u8 = 0xa0;
pub const BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED: u8 = 0xb0;
pub const BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB: u8 = 0xc0;

/// opcode streams are pointer-aligned in linkedit, so a DONE may be
/// followed by this much zero padding
const MAX_TRAILING_PADDING: usize = 15;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RebaseKind {
    Pointer,
    TextAbsolute32,
    TextPcrel32,
}

impl RebaseKind {
    fn from_imm(imm: u8) -> Result<RebaseKind> {
        match imm {
            REBASE_TYPE_POINTER => Ok(RebaseKind::Pointer),
            REBASE_TYPE_TEXT_ABSOLUTE32 => Ok(RebaseKind::TextAbsolute32),
            REBASE_TYPE_TEXT_PCREL32 => Ok(RebaseKind::TextPcrel32),
            _ => Err(Error::Malformed(format!("unknown rebase type {}", imm))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One rebase location emitted by the opcode stream
pub struct RebaseEvent {
    pub seg_index: usize,
    pub seg_offset: u64,
    /// offset from the image's preferred base address
    pub runtime_offset: u64,
    pub kind: RebaseKind,
    /// whether the location lies in a lazy-symbol-pointer section
    pub is_lazy_pointer: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One bind location emitted by an opcode stream
pub struct BindEvent<'a> {
    pub seg_index: usize,
    pub seg_offset: u64,
    /// offset from the image's preferred base address
    pub runtime_offset: u64,
    /// positive: index into the dependent dylib list (1-based);
    /// zero/negative: one of the `BIND_SPECIAL_DYLIB_*` namespaces
    pub lib_ordinal: i32,
    pub symbol_name: &'a str,
    pub bind_type: u8,
    pub addend: i64,
    pub weak_import: bool,
    /// whether this event came from the lazy stream
    pub lazy: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which of the three bind opcode streams is being decoded
pub enum BindStream {
    Regular,
    Lazy,
    Weak,
}

struct Cursor<'a> {
    segments: &'a [SegmentInfo],
    pointer_size: u64,
    seg_index: Option<usize>,
    seg_offset: u64,
}

impl<'a> Cursor<'a> {
    fn new(segments: &'a [SegmentInfo], pointer_size: u64) -> Cursor<'a> {
        Cursor {
            segments,
            pointer_size,
            seg_index: None,
            seg_offset: 0,
        }
    }

    fn set(&mut self, seg_index: u64, seg_offset: u64, opcode: &str) -> Result<()> {
        let index = seg_index as usize;
        if index >= self.segments.len() {
            return Err(Error::Malformed(format!(
                "{} segment index {} is beyond the {} segments",
                opcode,
                index,
                self.segments.len()
            )));
        }
        self.seg_index = Some(index);
        self.seg_offset = seg_offset;
        Ok(())
    }

    fn advance(&mut self, delta: u64, opcode: &str) -> Result<()> {
        self.seg_offset = self.seg_offset.checked_add(delta).ok_or_else(|| {
            Error::Malformed(format!("{} segment offset overflows", opcode))
        })?;
        Ok(())
    }

    /// Validates the current location and returns `(seg_index, seg_offset,
    /// runtime_offset, lazy_pointer)`
    fn emit(&self, opcode: &str, writable_required: bool) -> Result<(usize, u64, u64, bool)> {
        let seg_index = self.seg_index.ok_or_else(|| {
            Error::Malformed(format!(
                "{} without preceding SET_SEGMENT_AND_OFFSET_ULEB",
                opcode
            ))
        })?;
        let segment = &self.segments[seg_index];
        if !segment.covers(self.seg_offset, self.pointer_size) {
            return Err(Error::Malformed(format!(
                "{} segment offset {:#x} is beyond the end of segment {}",
                opcode, self.seg_offset, segment.name
            )));
        }
        if writable_required {
            if !segment.is_writable() || segment.is_executable() {
                return Err(Error::Malformed(format!(
                    "{} pointer fixup in non-writable segment {}",
                    opcode, segment.name
                )));
            }
        } else if !segment.is_executable() || segment.is_writable() {
            return Err(Error::Malformed(format!(
                "{} text fixup in non-executable segment {}",
                opcode, segment.name
            )));
        }
        let base = crate::mach::segments::image_base(self.segments).unwrap_or(0);
        let runtime_offset = segment.vmaddr - base + self.seg_offset;
        let addr = segment.vmaddr + self.seg_offset;
        let lazy_pointer = segment.sections.iter().any(|sect| {
            sect.flags & SECTION_TYPE == S_LAZY_SYMBOL_POINTERS
                && addr >= sect.addr
                && addr < sect.addr + sect.size
        });
        Ok((seg_index, self.seg_offset, runtime_offset, lazy_pointer))
    }
}

/// Decodes a rebase opcode stream, calling `handler` for every rebase
/// location. The handler can stop the walk, after which no further opcode
/// bytes are consumed. Empty streams are fine.
pub fn for_each_rebase(
    opcodes: &[u8],
    segments: &[SegmentInfo],
    pointer_size: u64,
    mut handler: impl FnMut(&RebaseEvent) -> ControlFlow<()>,
) -> Result<()> {
    if opcodes.is_empty() {
        return Ok(());
    }
    let mut cursor = Cursor::new(segments, pointer_size);
    let mut kind = RebaseKind::Pointer;
    let mut offset = 0usize;
    let mut emit =
        |cursor: &mut Cursor, kind: RebaseKind, opcode: &str| -> Result<ControlFlow<()>> {
            let writable = kind == RebaseKind::Pointer;
            let (seg_index, seg_offset, runtime_offset, is_lazy_pointer) =
                cursor.emit(opcode, writable)?;
            let event = RebaseEvent {
                seg_index,
                seg_offset,
                runtime_offset,
                kind,
                is_lazy_pointer,
            };
            let flow = handler(&event);
            cursor.advance(pointer_size, opcode)?;
            Ok(flow)
        };
    while offset < opcodes.len() {
        let byte = opcodes[offset];
        offset += 1;
        let opcode = byte & REBASE_OPCODE_MASK;
        let immediate = byte & REBASE_IMMEDIATE_MASK;
        match opcode {
            REBASE_OPCODE_DONE => {
                let rest = &opcodes[offset..];
                if rest.len() > MAX_TRAILING_PADDING || rest.iter().any(|&b| b != 0) {
                    return Err(Error::Malformed(
                        "rebase opcodes continue past REBASE_OPCODE_DONE".into(),
                    ));
                }
                return Ok(());
            }
            REBASE_OPCODE_SET_TYPE_IMM => {
                kind = RebaseKind::from_imm(immediate)?;
            }
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                let seg_offset = read_uleb128(opcodes, &mut offset)?;
                cursor.set(
                    u64::from(immediate),
                    seg_offset,
                    "REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB",
                )?;
            }
            REBASE_OPCODE_ADD_ADDR_ULEB => {
                let delta = read_uleb128(opcodes, &mut offset)?;
                cursor.advance(delta, "REBASE_OPCODE_ADD_ADDR_ULEB")?;
            }
            REBASE_OPCODE_ADD_ADDR_IMM_SCALED => {
                cursor.advance(
                    u64::from(immediate) * pointer_size,
                    "REBASE_OPCODE_ADD_ADDR_IMM_SCALED",
                )?;
            }
            REBASE_OPCODE_DO_REBASE_IMM_TIMES => {
                for _ in 0..immediate {
                    if emit(&mut cursor, kind, "REBASE_OPCODE_DO_REBASE_IMM_TIMES")?.is_break() {
                        return Ok(());
                    }
                }
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES => {
                let count = read_uleb128(opcodes, &mut offset)?;
                for _ in 0..count {
                    if emit(&mut cursor, kind, "REBASE_OPCODE_DO_REBASE_ULEB_TIMES")?.is_break() {
                        return Ok(());
                    }
                }
            }
            REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB => {
                if emit(&mut cursor, kind, "REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB")?.is_break() {
                    return Ok(());
                }
                let delta = read_uleb128(opcodes, &mut offset)?;
                cursor.advance(delta, "REBASE_OPCODE_DO_REBASE_ADD_ADDR_ULEB")?;
            }
            REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb128(opcodes, &mut offset)?;
                let skip = read_uleb128(opcodes, &mut offset)?;
                for _ in 0..count {
                    if emit(
                        &mut cursor,
                        kind,
                        "REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB",
                    )?
                    .is_break()
                    {
                        return Ok(());
                    }
                    cursor.advance(skip, "REBASE_OPCODE_DO_REBASE_ULEB_TIMES_SKIPPING_ULEB")?;
                }
            }
            _ => {
                return Err(Error::Malformed(format!(
                    "unknown rebase opcode {:#04x}",
                    byte
                )));
            }
        }
    }
    Ok(())
}

/// Decodes one of the three bind opcode streams. `strong_handler`, when
/// given, receives the name of every symbol the weak stream flags as a
/// strong (non-weak) definition. The handler can stop the walk, after which
/// no further opcode bytes are consumed.
pub fn for_each_bind<'a>(
    opcodes: &'a [u8],
    segments: &[SegmentInfo],
    pointer_size: u64,
    stream: BindStream,
    mut handler: impl FnMut(&BindEvent<'a>) -> ControlFlow<()>,
    mut strong_handler: Option<&mut dyn FnMut(&'a str)>,
) -> Result<()> {
    if opcodes.is_empty() {
        return Ok(());
    }
    let mut cursor = Cursor::new(segments, pointer_size);
    let mut lib_ordinal: i32 = match stream {
        BindStream::Weak => BIND_SPECIAL_DYLIB_WEAK_LOOKUP,
        _ => 0,
    };
    let mut ordinal_set = stream == BindStream::Weak;
    let mut symbol_name: Option<&'a str> = None;
    let mut weak_import = false;
    let mut bind_type = BIND_TYPE_POINTER;
    let mut addend: i64 = 0;
    let mut offset = 0usize;
    let lazy = stream == BindStream::Lazy;

    let mut emit = |cursor: &mut Cursor,
                    symbol_name: Option<&'a str>,
                    lib_ordinal: i32,
                    ordinal_set: bool,
                    bind_type: u8,
                    addend: i64,
                    weak_import: bool,
                    opcode: &str|
     -> Result<ControlFlow<()>> {
        let name = symbol_name.ok_or_else(|| {
            Error::Malformed(format!(
                "{} without preceding BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM",
                opcode
            ))
        })?;
        if !ordinal_set {
            return Err(Error::Malformed(format!(
                "{} without preceding BIND_OPCODE_SET_DYLIB_ORDINAL",
                opcode
            )));
        }
        let writable = bind_type == BIND_TYPE_POINTER;
        let (seg_index, seg_offset, runtime_offset, _) = cursor.emit(opcode, writable)?;
        let event = BindEvent {
            seg_index,
            seg_offset,
            runtime_offset,
            lib_ordinal,
            symbol_name: name,
            bind_type,
            addend,
            weak_import,
            lazy,
        };
        let flow = handler(&event);
        cursor.advance(pointer_size, opcode)?;
        Ok(flow)
    };

    while offset < opcodes.len() {
        let byte = opcodes[offset];
        offset += 1;
        let opcode = byte & BIND_OPCODE_MASK;
        let immediate = byte & BIND_IMMEDIATE_MASK;
        match opcode {
            BIND_OPCODE_DONE => {
                // the lazy stream ends each entry with DONE; only the end of
                // the blob terminates it
                if lazy {
                    continue;
                }
                let rest = &opcodes[offset..];
                if rest.len() > MAX_TRAILING_PADDING || rest.iter().any(|&b| b != 0) {
                    return Err(Error::Malformed(
                        "bind opcodes continue past BIND_OPCODE_DONE".into(),
                    ));
                }
                return Ok(());
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_IMM => {
                lib_ordinal = i32::from(immediate);
                ordinal_set = true;
            }
            BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB => {
                let ordinal = read_uleb128(opcodes, &mut offset)?;
                lib_ordinal = i32::try_from(ordinal).map_err(|_| {
                    Error::Malformed(format!("dylib ordinal {} is too large", ordinal))
                })?;
                ordinal_set = true;
            }
            BIND_OPCODE_SET_DYLIB_SPECIAL_IMM => {
                // sign extend the 4-bit immediate
                lib_ordinal = if immediate == 0 {
                    0
                } else {
                    i32::from((BIND_OPCODE_MASK | immediate) as i8)
                };
                ordinal_set = true;
            }
            BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM => {
                let name_bytes = &opcodes[offset..];
                let nul = name_bytes.iter().position(|&b| b == 0).ok_or_else(|| {
                    Error::Malformed("bind symbol name is not NUL-terminated".into())
                })?;
                let name = core::str::from_utf8(&name_bytes[..nul])
                    .map_err(|_| Error::Malformed("bind symbol name is not utf-8".into()))?;
                offset += nul + 1;
                symbol_name = Some(name);
                weak_import = immediate & BIND_SYMBOL_FLAGS_WEAK_IMPORT != 0;
                if immediate & BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION != 0 {
                    if let Some(strong) = strong_handler.as_mut() {
                        strong(name);
                    }
                }
            }
            BIND_OPCODE_SET_TYPE_IMM => {
                if immediate == 0 || immediate > BIND_TYPE_TEXT_PCREL32 {
                    return Err(Error::Malformed(format!("unknown bind type {}", immediate)));
                }
                bind_type = immediate;
            }
            BIND_OPCODE_SET_ADDEND_SLEB => {
                addend = read_sleb128(opcodes, &mut offset)?;
            }
            BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB => {
                let seg_offset = read_uleb128(opcodes, &mut offset)?;
                cursor.set(
                    u64::from(immediate),
                    seg_offset,
                    "BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB",
                )?;
            }
            BIND_OPCODE_ADD_ADDR_ULEB => {
                let delta = read_uleb128(opcodes, &mut offset)?;
                // deltas are encoded as wrapping 64-bit values so a stream
                // can step backwards
                cursor.seg_offset = cursor.seg_offset.wrapping_add(delta);
            }
            BIND_OPCODE_DO_BIND => {
                if emit(
                    &mut cursor,
                    symbol_name,
                    lib_ordinal,
                    ordinal_set,
                    bind_type,
                    addend,
                    weak_import,
                    "BIND_OPCODE_DO_BIND",
                )?
                .is_break()
                {
                    return Ok(());
                }
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB => {
                if emit(
                    &mut cursor,
                    symbol_name,
                    lib_ordinal,
                    ordinal_set,
                    bind_type,
                    addend,
                    weak_import,
                    "BIND_OPCODE_DO_BIND_ADD_ADDR_ULEB",
                )?
                .is_break()
                {
                    return Ok(());
                }
                let delta = read_uleb128(opcodes, &mut offset)?;
                cursor.seg_offset = cursor.seg_offset.wrapping_add(delta);
            }
            BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED => {
                if emit(
                    &mut cursor,
                    symbol_name,
                    lib_ordinal,
                    ordinal_set,
                    bind_type,
                    addend,
                    weak_import,
                    "BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED",
                )?
                .is_break()
                {
                    return Ok(());
                }
                cursor.advance(
                    u64::from(immediate) * pointer_size,
                    "BIND_OPCODE_DO_BIND_ADD_ADDR_IMM_SCALED",
                )?;
            }
            BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB => {
                let count = read_uleb128(opcodes, &mut offset)?;
                let skip = read_uleb128(opcodes, &mut offset)?;
                for _ in 0..count {
                    if emit(
                        &mut cursor,
                        symbol_name,
                        lib_ordinal,
                        ordinal_set,
                        bind_type,
                        addend,
                        weak_import,
                        "BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB",
                    )?
                    .is_break()
                    {
                        return Ok(());
                    }
                    cursor.advance(skip, "BIND_OPCODE_DO_BIND_ULEB_TIMES_SKIPPING_ULEB")?;
                }
            }
            _ => {
                return Err(Error::Malformed(format!(
                    "unknown bind opcode {:#04x}",
                    byte
                )));
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach::constants::VmProt;
    use crate::mach::uleb::write_uleb128;

    fn data_segments() -> Vec<SegmentInfo> {
        vec![
            SegmentInfo {
                name: "__TEXT".into(),
                vmaddr: 0x1000,
                vmsize: 0x1000,
                fileoff: 0,
                filesize: 0x1000,
                init_prot: VmProt::READ | VmProt::EXECUTE,
                max_prot: VmProt::READ | VmProt::EXECUTE,
                flags: 0,
                sections: vec![],
            },
            SegmentInfo {
                name: "__DATA".into(),
                vmaddr: 0x2000,
                vmsize: 0x1000,
                fileoff: 0x1000,
                filesize: 0x1000,
                init_prot: VmProt::READ | VmProt::WRITE,
                max_prot: VmProt::READ | VmProt::WRITE,
                flags: 0,
                sections: vec![],
            },
        ]
    }

    #[test]
    fn empty_stream_is_ok() {
        let segments = data_segments();
        for_each_rebase(&[], &segments, 8, |_| ControlFlow::Continue(())).unwrap();
    }

    #[test]
    fn rebase_emission_and_cursor_advance() {
        let segments = data_segments();
        let mut opcodes = vec![
            REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER,
            REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1,
        ];
        write_uleb128(&mut opcodes, 0x10);
        opcodes.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | 2);
        opcodes.push(REBASE_OPCODE_DONE);
        let mut offsets = Vec::new();
        for_each_rebase(&opcodes, &segments, 8, |event| {
            offsets.push(event.runtime_offset);
            ControlFlow::Continue(())
        })
        .unwrap();
        // __DATA starts 0x1000 past __TEXT
        assert_eq!(offsets, vec![0x1010, 0x1018]);
    }

    #[test]
    fn rebase_at_segment_tail_is_accepted_one_past_rejected() {
        let segments = data_segments();
        let tail = 0x1000 - 8;
        for delta in [0u64, 1] {
            let mut opcodes = vec![REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1];
            write_uleb128(&mut opcodes, tail + delta);
            opcodes.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1);
            opcodes.push(REBASE_OPCODE_DONE);
            let result = for_each_rebase(&opcodes, &segments, 8, |_| ControlFlow::Continue(()));
            if delta == 0 {
                result.unwrap();
            } else {
                assert!(result.is_err());
            }
        }
    }

    #[test]
    fn rebase_into_text_is_rejected_for_pointers() {
        let segments = data_segments();
        let mut opcodes = vec![REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB];
        write_uleb128(&mut opcodes, 0);
        opcodes.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1);
        opcodes.push(REBASE_OPCODE_DONE);
        assert!(for_each_rebase(&opcodes, &segments, 8, |_| ControlFlow::Continue(())).is_err());
    }

    #[test]
    fn unknown_rebase_opcode_is_rejected() {
        let segments = data_segments();
        let opcodes = [0x90u8];
        assert!(for_each_rebase(&opcodes, &segments, 8, |_| ControlFlow::Continue(())).is_err());
    }

    #[test]
    fn stopping_the_handler_stops_the_decode() {
        let segments = data_segments();
        let mut opcodes = vec![REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1];
        write_uleb128(&mut opcodes, 0);
        opcodes.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | 4);
        // deliberately bogus tail; the stopped decode must never read it
        opcodes.push(0xff);
        let mut seen = 0;
        for_each_rebase(&opcodes, &segments, 8, |_| {
            seen += 1;
            ControlFlow::Break(())
        })
        .unwrap();
        assert_eq!(seen, 1);
    }

    fn bind_stream(symbol: &str, ordinal: u8, seg_offset: u64) -> Vec<u8> {
        let mut opcodes = vec![BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | ordinal];
        opcodes.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        opcodes.extend_from_slice(symbol.as_bytes());
        opcodes.push(0);
        opcodes.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
        opcodes.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
        write_uleb128(&mut opcodes, seg_offset);
        opcodes.push(BIND_OPCODE_DO_BIND);
        opcodes.push(BIND_OPCODE_DONE);
        opcodes
    }

    #[test]
    fn bind_emission() {
        let segments = data_segments();
        let opcodes = bind_stream("_malloc", 2, 0x20);
        let mut events = Vec::new();
        for_each_bind(
            &opcodes,
            &segments,
            8,
            BindStream::Regular,
            |event| {
                events.push((event.runtime_offset, event.lib_ordinal, event.symbol_name));
                ControlFlow::Continue(())
            },
            None,
        )
        .unwrap();
        assert_eq!(events, vec![(0x1020, 2, "_malloc")]);
    }

    #[test]
    fn special_ordinals_sign_extend() {
        let segments = data_segments();
        let mut opcodes = vec![BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (0x10 - 2)];
        opcodes.push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM);
        opcodes.extend_from_slice(b"_flat\0");
        opcodes.push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | 1);
        write_uleb128(&mut opcodes, 0);
        opcodes.push(BIND_OPCODE_DO_BIND);
        opcodes.push(BIND_OPCODE_DONE);
        let mut ordinals = Vec::new();
        for_each_bind(
            &opcodes,
            &segments,
            8,
            BindStream::Regular,
            |event| {
                ordinals.push(event.lib_ordinal);
                ControlFlow::Continue(())
            },
            None,
        )
        .unwrap();
        assert_eq!(ordinals, vec![BIND_SPECIAL_DYLIB_FLAT_LOOKUP]);
    }

    #[test]
    fn weak_stream_reports_strong_defs() {
        let segments = data_segments();
        let mut opcodes = vec![BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM
            | BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION];
        opcodes.extend_from_slice(b"_operator_new\0");
        opcodes.push(BIND_OPCODE_DONE);
        let mut strong = Vec::new();
        for_each_bind(
            &opcodes,
            &segments,
            8,
            BindStream::Weak,
            |_| ControlFlow::Continue(()),
            Some(&mut |name| strong.push(name.to_owned())),
        )
        .unwrap();
        assert_eq!(strong, vec!["_operator_new".to_owned()]);
    }

    #[test]
    fn lazy_stream_continues_past_done() {
        let segments = data_segments();
        let mut opcodes = bind_stream("_first", 1, 0x0);
        // bind_stream already ends with DONE; append a second entry the way
        // the linker emits the lazy stream
        opcodes.extend_from_slice(&bind_stream("_second", 1, 0x8));
        let mut names = Vec::new();
        for_each_bind(
            &opcodes,
            &segments,
            8,
            BindStream::Lazy,
            |event| {
                names.push(event.symbol_name);
                assert!(event.lazy);
                ControlFlow::Continue(())
            },
            None,
        )
        .unwrap();
        assert_eq!(names, vec!["_first", "_second"]);
    }
}
