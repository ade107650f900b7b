//! Unified segment and section views, gathered in load-command order.
//! These are what the rest of the linker consumes: the raw 32/64-bit
//! commands are folded into one shape, with protections decoded and the
//! zero-fill tail sizes worked out.

use core::fmt;
use core::ops::ControlFlow;

use scroll::Pread;

use crate::error::{self, Error};
use crate::mach::constants::{SECTION_TYPE, S_GB_ZEROFILL, S_ZEROFILL, VmProt};
use crate::mach::load_command::{
    Section32, Section64, SegmentCommand32, SegmentCommand64, SIZEOF_SECTION_32,
    SIZEOF_SECTION_64, SIZEOF_SEGMENT_COMMAND_32, SIZEOF_SEGMENT_COMMAND_64,
};

#[derive(Clone, PartialEq, Eq)]
/// One segment of an image, in a width-independent shape
pub struct SegmentInfo {
    /// segment name, e.g. `__TEXT`
    pub name: String,
    /// address this segment wants when the image loads at its preferred base
    pub vmaddr: u64,
    /// size of the segment in memory
    pub vmsize: u64,
    /// offset of the file-backed portion in the file
    pub fileoff: u64,
    /// size of the file-backed portion; any vmsize excess is zero-fill
    pub filesize: u64,
    /// protection the segment is initially mapped with
    pub init_prot: VmProt,
    /// the most permissive protection the segment may ever be given
    pub max_prot: VmProt,
    /// segment flags
    pub flags: u32,
    /// sections inside this segment
    pub sections: Vec<SectionInfo>,
}

impl fmt::Debug for SegmentInfo {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "{} vmaddr: {:#x} vmsize: {:#x} fileoff: {:#x} filesize: {:#x} prot: {:#x}/{:#x}",
            self.name,
            self.vmaddr,
            self.vmsize,
            self.fileoff,
            self.filesize,
            self.init_prot.bits(),
            self.max_prot.bits()
        )
    }
}

impl SegmentInfo {
    /// Whether this segment occupies no file bytes at all (pure zero-fill)
    pub fn is_zero_fill(&self) -> bool {
        self.filesize == 0 && self.vmsize > 0
    }

    /// The size of the anonymous tail past the file-backed portion
    pub fn zero_fill_tail(&self) -> u64 {
        self.vmsize.saturating_sub(self.filesize)
    }

    pub fn is_writable(&self) -> bool {
        self.init_prot.is_writable()
    }

    pub fn is_executable(&self) -> bool {
        self.init_prot.is_executable()
    }

    /// Whether `offset + len` falls inside this segment's VM span,
    /// `offset` relative to the segment start
    pub fn covers(&self, offset: u64, len: u64) -> bool {
        offset
            .checked_add(len)
            .map(|end| end <= self.vmsize)
            .unwrap_or(false)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One section of a segment, in a width-independent shape
pub struct SectionInfo {
    /// name of the segment this section belongs to
    pub segment_name: String,
    /// section name, e.g. `__got`
    pub name: String,
    /// vm address
    pub addr: u64,
    /// size in bytes
    pub size: u64,
    /// file offset; zero for zero-fill sections
    pub fileoff: u32,
    /// alignment as a power of two
    pub align: u32,
    /// section type and attributes
    pub flags: u32,
    /// meaning depends on section type (e.g. indirect symbol table start index)
    pub reserved1: u32,
    /// meaning depends on section type (e.g. symbol stub size)
    pub reserved2: u32,
}

impl SectionInfo {
    /// The `S_*` type of this section
    pub fn section_type(&self) -> u32 {
        self.flags & SECTION_TYPE
    }

    pub fn is_zero_fill(&self) -> bool {
        let typ = self.section_type();
        typ == S_ZEROFILL || typ == S_GB_ZEROFILL
    }
}

fn fixed_str(raw: &[u8; 16]) -> error::Result<String> {
    let nul = raw.iter().position(|&b| b == 0).unwrap_or(16);
    core::str::from_utf8(&raw[..nul])
        .map(str::to_owned)
        .map_err(|_| Error::Malformed("segment/section name is not valid utf-8".into()))
}

/// Folds a 32-bit segment command (and the sections trailing it) into a
/// `SegmentInfo`. `bytes` is the whole image, `offset` the command start.
pub fn from_segment32(
    bytes: &[u8],
    offset: usize,
    seg: &SegmentCommand32,
) -> error::Result<SegmentInfo> {
    let name = fixed_str(&seg.segname)?;
    let nsects = seg.nsects as usize;
    let sects_size = nsects
        .checked_mul(SIZEOF_SECTION_32)
        .and_then(|size| size.checked_add(SIZEOF_SEGMENT_COMMAND_32))
        .ok_or_else(|| Error::Malformed("section count overflows".into()))?;
    if sects_size > seg.cmdsize as usize {
        return Err(Error::Malformed(format!(
            "segment {} declares {} sections but its cmdsize holds fewer",
            name, nsects
        )));
    }
    let mut sections = Vec::with_capacity(nsects);
    let mut cursor = offset + SIZEOF_SEGMENT_COMMAND_32;
    for _ in 0..nsects {
        let sect: Section32 = bytes.pread_with(cursor, scroll::LE)?;
        sections.push(SectionInfo {
            segment_name: fixed_str(&sect.segname)?,
            name: fixed_str(&sect.sectname)?,
            addr: u64::from(sect.addr),
            size: u64::from(sect.size),
            fileoff: sect.offset,
            align: sect.align,
            flags: sect.flags,
            reserved1: sect.reserved1,
            reserved2: sect.reserved2,
        });
        cursor += SIZEOF_SECTION_32;
    }
    Ok(SegmentInfo {
        name,
        vmaddr: u64::from(seg.vmaddr),
        vmsize: u64::from(seg.vmsize),
        fileoff: u64::from(seg.fileoff),
        filesize: u64::from(seg.filesize),
        init_prot: VmProt::from_bits_truncate(seg.initprot),
        max_prot: VmProt::from_bits_truncate(seg.maxprot),
        flags: seg.flags,
        sections,
    })
}

/// Folds a 64-bit segment command (and the sections trailing it) into a
/// `SegmentInfo`.
pub fn from_segment64(
    bytes: &[u8],
    offset: usize,
    seg: &SegmentCommand64,
) -> error::Result<SegmentInfo> {
    let name = fixed_str(&seg.segname)?;
    let nsects = seg.nsects as usize;
    let sects_size = nsects
        .checked_mul(SIZEOF_SECTION_64)
        .and_then(|size| size.checked_add(SIZEOF_SEGMENT_COMMAND_64))
        .ok_or_else(|| Error::Malformed("section count overflows".into()))?;
    if sects_size > seg.cmdsize as usize {
        return Err(Error::Malformed(format!(
            "segment {} declares {} sections but its cmdsize holds fewer",
            name, nsects
        )));
    }
    let mut sections = Vec::with_capacity(nsects);
    let mut cursor = offset + SIZEOF_SEGMENT_COMMAND_64;
    for _ in 0..nsects {
        let sect: Section64 = bytes.pread_with(cursor, scroll::LE)?;
        sections.push(SectionInfo {
            segment_name: fixed_str(&sect.segname)?,
            name: fixed_str(&sect.sectname)?,
            addr: sect.addr,
            size: sect.size,
            fileoff: sect.offset,
            align: sect.align,
            flags: sect.flags,
            reserved1: sect.reserved1,
            reserved2: sect.reserved2,
        });
        cursor += SIZEOF_SECTION_64;
    }
    Ok(SegmentInfo {
        name,
        vmaddr: seg.vmaddr,
        vmsize: seg.vmsize,
        fileoff: seg.fileoff,
        filesize: seg.filesize,
        init_prot: VmProt::from_bits_truncate(seg.initprot),
        max_prot: VmProt::from_bits_truncate(seg.maxprot),
        flags: seg.flags,
        sections,
    })
}

/// Runs `handler` over `segments`, stopping early if it breaks
pub fn for_each<'a>(
    segments: &'a [SegmentInfo],
    mut handler: impl FnMut(usize, &'a SegmentInfo) -> ControlFlow<()>,
) {
    for (index, segment) in segments.iter().enumerate() {
        if handler(index, segment).is_break() {
            return;
        }
    }
}

/// Finds a segment by name
pub fn find<'a>(segments: &'a [SegmentInfo], name: &str) -> Option<(usize, &'a SegmentInfo)> {
    segments
        .iter()
        .enumerate()
        .find(|(_, segment)| segment.name == name)
}

/// The unslid address of the mach header: the `__TEXT` segment's vmaddr.
/// `__PAGEZERO` sits below it and is not part of the mapped image.
pub fn image_base(segments: &[SegmentInfo]) -> Option<u64> {
    segments
        .iter()
        .find(|segment| segment.name == crate::mach::constants::SEG_TEXT)
        .or_else(|| segments.first())
        .map(|segment| segment.vmaddr)
}

/// Converts a `(segment, offset-in-segment)` pair into an offset from the
/// image's mach header
pub fn runtime_offset(segments: &[SegmentInfo], seg_index: usize, seg_offset: u64) -> Option<u64> {
    let base = image_base(segments)?;
    let segment = segments.get(seg_index)?;
    Some(segment.vmaddr - base + seg_offset)
}
