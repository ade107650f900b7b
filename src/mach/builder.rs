//! An in-memory builder for small 64-bit mach-o images: segments, sections,
//! dyld-info opcode streams, chained fixups, export tries, and symbol
//! tables. It exists so fixture images can be synthesized byte-for-byte and
//! then fed back through the analyzer and the fixup engine; the encoders
//! here are also what the round-trip laws in the test suite exercise.

use scroll::Pwrite;

use crate::error::{Error, Result};
use crate::mach::chained::{
    ChainedFixupsHeader, DYLD_CHAINED_IMPORT_ADDEND, DYLD_CHAINED_PTR_START_NONE,
    SIZEOF_CHAINED_FIXUPS_HEADER, SIZEOF_STARTS_IN_SEGMENT_PREFIX,
};
use crate::mach::constants::{
    VM_PROT_EXECUTE, VM_PROT_READ, VM_PROT_WRITE,
};
use crate::mach::header::{Header64, MH_DYLIB, MH_EXECUTE, MH_MAGIC_64, MH_PIE, MH_TWOLEVEL};
use crate::mach::load_command::{
    BuildVersionCommand, DyldInfoCommand, DylibCommand, DysymtabCommand, EntryPointCommand,
    LinkeditDataCommand, RpathCommand, Section64, SegmentCommand64, SymtabCommand,
    UuidCommand, LC_BUILD_VERSION, LC_DYLD_CHAINED_FIXUPS, LC_DYLD_EXPORTS_TRIE, LC_DYLD_INFO_ONLY,
    LC_DYSYMTAB, LC_ID_DYLIB, LC_LOAD_DYLIB, LC_LOAD_UPWARD_DYLIB, LC_LOAD_WEAK_DYLIB, LC_MAIN,
    LC_REEXPORT_DYLIB, LC_RPATH, LC_SEGMENT_64, LC_SYMTAB, LC_UUID, SIZEOF_DYLD_INFO_COMMAND,
    SIZEOF_ENTRY_POINT_COMMAND, SIZEOF_LINKEDIT_DATA_COMMAND, SIZEOF_SECTION_64,
    SIZEOF_SEGMENT_COMMAND_64, SIZEOF_SYMTAB_COMMAND, SIZEOF_UUID_COMMAND,
};
use crate::mach::opcodes::*;
use crate::mach::uleb::{write_sleb128, write_uleb128};
use crate::mach::{Platform, Version32};

pub const PAGE_SIZE: u64 = 0x1000;

fn page_align(value: u64) -> u64 {
    (value + PAGE_SIZE - 1) & !(PAGE_SIZE - 1)
}

fn pad16(name: &str) -> [u8; 16] {
    let mut out = [0u8; 16];
    let bytes = name.as_bytes();
    out[..bytes.len().min(16)].copy_from_slice(&bytes[..bytes.len().min(16)]);
    out
}

#[derive(Debug, Clone)]
/// One section of a segment under construction
pub struct SectionSpec {
    pub name: String,
    pub flags: u32,
    pub content: Vec<u8>,
    pub align: u32,
    pub reserved1: u32,
    pub reserved2: u32,
}

impl SectionSpec {
    pub fn new(name: &str, flags: u32, content: Vec<u8>) -> SectionSpec {
        SectionSpec {
            name: name.to_owned(),
            flags,
            content,
            align: 3,
            reserved1: 0,
            reserved2: 0,
        }
    }
}

#[derive(Debug, Clone)]
/// One segment of an image under construction
pub struct SegmentSpec {
    pub name: String,
    pub initprot: u32,
    pub maxprot: u32,
    pub content: Vec<u8>,
    /// extra zero-fill tail past the content
    pub zero_fill: u64,
    pub sections: Vec<SectionSpec>,
}

impl SegmentSpec {
    pub fn data(content: Vec<u8>) -> SegmentSpec {
        SegmentSpec {
            name: "__DATA".to_owned(),
            initprot: VM_PROT_READ | VM_PROT_WRITE,
            maxprot: VM_PROT_READ | VM_PROT_WRITE,
            content,
            zero_fill: 0,
            sections: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DependentKind {
    Regular,
    Weak,
    Reexport,
    Upward,
}

#[derive(Debug, Clone)]
struct DependentSpec {
    path: String,
    kind: DependentKind,
    compat_version: u32,
    current_version: u32,
}

#[derive(Debug, Clone)]
/// One symbol for the nlist table
pub struct SymbolSpec {
    pub name: String,
    pub n_type: u8,
    pub n_sect: u8,
    pub n_desc: u16,
    pub n_value: u64,
}

#[derive(Debug, Default, Clone)]
/// The linkedit blobs an image under construction carries
pub struct LinkeditSpec {
    pub rebase: Vec<u8>,
    pub bind: Vec<u8>,
    pub weak_bind: Vec<u8>,
    pub lazy_bind: Vec<u8>,
    pub export_trie: Vec<u8>,
    pub chained: Vec<u8>,
    pub symbols: Vec<SymbolSpec>,
    pub indirect_symbols: Vec<u32>,
}

impl LinkeditSpec {
    fn has_dyld_info(&self) -> bool {
        !self.rebase.is_empty()
            || !self.bind.is_empty()
            || !self.weak_bind.is_empty()
            || !self.lazy_bind.is_empty()
            || (!self.export_trie.is_empty() && self.chained.is_empty())
    }
}

/// Builds small synthetic 64-bit mach-o images
#[derive(Debug)]
pub struct ImageBuilder {
    filetype: u32,
    cputype: u32,
    cpusubtype: u32,
    extra_flags: u32,
    preferred_base: u64,
    platform: Option<(Platform, Version32, Version32)>,
    install_name: Option<String>,
    uuid: Option<[u8; 16]>,
    entry_offset: Option<u64>,
    emit_entry: bool,
    dependents: Vec<DependentSpec>,
    rpaths: Vec<String>,
    text_content: Vec<u8>,
    segments: Vec<SegmentSpec>,
    pub linkedit: LinkeditSpec,
}

impl ImageBuilder {
    pub fn executable() -> ImageBuilder {
        let mut builder = ImageBuilder::new(MH_EXECUTE);
        builder.extra_flags |= MH_PIE;
        // executables get an LC_MAIN pointing at the start of __text
        builder.entry_offset = None;
        builder
    }

    pub fn dylib(install_name: &str) -> ImageBuilder {
        let mut builder = ImageBuilder::new(MH_DYLIB);
        builder.install_name = Some(install_name.to_owned());
        builder
    }

    fn new(filetype: u32) -> ImageBuilder {
        ImageBuilder {
            filetype,
            cputype: crate::mach::arch::CPU_TYPE_X86_64,
            cpusubtype: crate::mach::arch::CPU_SUBTYPE_X86_64_ALL,
            extra_flags: 0,
            preferred_base: 0x1_0000_0000,
            platform: Some((
                Platform::MacOS,
                Version32::new(13, 0, 0),
                Version32::new(14, 0, 0),
            )),
            install_name: None,
            uuid: Some(*b"kobold-fixture!!"),
            entry_offset: None,
            emit_entry: true,
            dependents: Vec::new(),
            rpaths: Vec::new(),
            text_content: vec![0xc3; 0x40],
            segments: Vec::new(),
            linkedit: LinkeditSpec::default(),
        }
    }

    pub fn arch(mut self, cputype: u32, cpusubtype: u32) -> ImageBuilder {
        self.cputype = cputype;
        self.cpusubtype = cpusubtype;
        self
    }

    pub fn preferred_base(mut self, base: u64) -> ImageBuilder {
        self.preferred_base = base;
        self
    }

    pub fn platform(mut self, platform: Platform, min_os: Version32, sdk: Version32) -> ImageBuilder {
        self.platform = Some((platform, min_os, sdk));
        self
    }

    pub fn no_platform(mut self) -> ImageBuilder {
        self.platform = None;
        self
    }

    pub fn uuid(mut self, uuid: [u8; 16]) -> ImageBuilder {
        self.uuid = Some(uuid);
        self
    }

    pub fn entry_offset(mut self, offset: u64) -> ImageBuilder {
        self.entry_offset = Some(offset);
        self
    }

    /// Leave LC_MAIN out entirely (driverkit-style executables)
    pub fn no_entry(mut self) -> ImageBuilder {
        self.emit_entry = false;
        self
    }

    pub fn depend(mut self, path: &str, kind: DependentKind) -> ImageBuilder {
        self.dependents.push(DependentSpec {
            path: path.to_owned(),
            kind,
            compat_version: 0x1_0000,
            current_version: 0x1_0000,
        });
        self
    }

    pub fn depend_versioned(
        mut self,
        path: &str,
        compat_version: u32,
        current_version: u32,
    ) -> ImageBuilder {
        self.dependents.push(DependentSpec {
            path: path.to_owned(),
            kind: DependentKind::Regular,
            compat_version,
            current_version,
        });
        self
    }

    pub fn rpath(mut self, path: &str) -> ImageBuilder {
        self.rpaths.push(path.to_owned());
        self
    }

    pub fn text_content(mut self, content: Vec<u8>) -> ImageBuilder {
        self.text_content = content;
        self
    }

    pub fn segment(mut self, segment: SegmentSpec) -> ImageBuilder {
        self.segments.push(segment);
        self
    }

    pub fn rebase_opcodes(mut self, opcodes: Vec<u8>) -> ImageBuilder {
        self.linkedit.rebase = opcodes;
        self
    }

    pub fn bind_opcodes(mut self, opcodes: Vec<u8>) -> ImageBuilder {
        self.linkedit.bind = opcodes;
        self
    }

    pub fn weak_bind_opcodes(mut self, opcodes: Vec<u8>) -> ImageBuilder {
        self.linkedit.weak_bind = opcodes;
        self
    }

    pub fn lazy_bind_opcodes(mut self, opcodes: Vec<u8>) -> ImageBuilder {
        self.linkedit.lazy_bind = opcodes;
        self
    }

    pub fn export_trie(mut self, trie: Vec<u8>) -> ImageBuilder {
        self.linkedit.export_trie = trie;
        self
    }

    pub fn exports(mut self, exports: &[ExportSpec]) -> ImageBuilder {
        self.linkedit.export_trie = build_export_trie(exports);
        self
    }

    pub fn chained_fixups(mut self, blob: Vec<u8>) -> ImageBuilder {
        self.linkedit.chained = blob;
        self
    }

    pub fn symbols(mut self, symbols: Vec<SymbolSpec>) -> ImageBuilder {
        self.linkedit.symbols = symbols;
        self
    }

    /// Assembles the image
    pub fn build(&self) -> Result<Vec<u8>> {
        // lay out load commands first so __TEXT can size itself
        let mut ncmds = 1 + self.segments.len() + 1; // __TEXT, user segments, __LINKEDIT
        let mut cmds_size = (1 + self.segments.len() + 1) * SIZEOF_SEGMENT_COMMAND_64
            + SIZEOF_SECTION_64 * (1 + self.segments.iter().map(|s| s.sections.len()).sum::<usize>());
        if let Some(name) = &self.install_name {
            ncmds += 1;
            cmds_size += dylib_cmd_size(name);
        }
        for dependent in &self.dependents {
            ncmds += 1;
            cmds_size += dylib_cmd_size(&dependent.path);
        }
        for rpath in &self.rpaths {
            ncmds += 1;
            cmds_size += rpath_cmd_size(rpath);
        }
        if self.uuid.is_some() {
            ncmds += 1;
            cmds_size += SIZEOF_UUID_COMMAND;
        }
        if self.platform.is_some() {
            ncmds += 1;
            cmds_size += 24;
        }
        if self.filetype == MH_EXECUTE && self.emit_entry {
            ncmds += 1;
            cmds_size += SIZEOF_ENTRY_POINT_COMMAND;
        }
        if self.linkedit.has_dyld_info() {
            ncmds += 1;
            cmds_size += SIZEOF_DYLD_INFO_COMMAND;
        }
        if !self.linkedit.chained.is_empty() {
            ncmds += 2; // chained fixups + exports trie
            cmds_size += 2 * SIZEOF_LINKEDIT_DATA_COMMAND;
        }
        if !self.linkedit.symbols.is_empty() {
            ncmds += 2; // symtab + dysymtab
            cmds_size += SIZEOF_SYMTAB_COMMAND + 80;
        }

        let header_and_cmds = 0x20 + cmds_size;
        let text_size = page_align(header_and_cmds as u64 + self.text_content.len() as u64);

        // vm layout: __TEXT, then each user segment page-aligned, then
        // __LINKEDIT; file layout mirrors it
        struct SegLayout {
            vmaddr: u64,
            vmsize: u64,
            fileoff: u64,
            filesize: u64,
        }
        let mut layouts = Vec::new();
        let mut vmaddr = self.preferred_base + text_size;
        let mut fileoff = text_size;
        for segment in &self.segments {
            let mut content_len = segment.content.len() as u64;
            for section in &segment.sections {
                content_len += section.content.len() as u64;
            }
            let filesize = page_align(content_len);
            let vmsize = page_align(filesize + segment.zero_fill);
            layouts.push(SegLayout {
                vmaddr,
                vmsize,
                fileoff,
                filesize,
            });
            vmaddr += vmsize;
            fileoff += filesize;
        }

        // linkedit blob layout
        let le_fileoff = fileoff;
        let le_vmaddr = vmaddr;
        let mut le = Vec::new();
        let rebase_off = le_fileoff + le.len() as u64;
        le.extend_from_slice(&self.linkedit.rebase);
        let bind_off = le_fileoff + le.len() as u64;
        le.extend_from_slice(&self.linkedit.bind);
        let weak_off = le_fileoff + le.len() as u64;
        le.extend_from_slice(&self.linkedit.weak_bind);
        let lazy_off = le_fileoff + le.len() as u64;
        le.extend_from_slice(&self.linkedit.lazy_bind);
        let export_off = le_fileoff + le.len() as u64;
        le.extend_from_slice(&self.linkedit.export_trie);
        while le.len() % 8 != 0 {
            le.push(0);
        }
        let chained_off = le_fileoff + le.len() as u64;
        le.extend_from_slice(&self.linkedit.chained);
        while le.len() % 8 != 0 {
            le.push(0);
        }
        let indirect_off = le_fileoff + le.len() as u64;
        for index in &self.linkedit.indirect_symbols {
            le.extend_from_slice(&index.to_le_bytes());
        }
        let sym_off = le_fileoff + le.len() as u64;
        let mut strtab = vec![0u8]; // index 0 is the empty name
        for symbol in &self.linkedit.symbols {
            let strx = strtab.len() as u32;
            strtab.extend_from_slice(symbol.name.as_bytes());
            strtab.push(0);
            le.extend_from_slice(&strx.to_le_bytes());
            le.push(symbol.n_type);
            le.push(symbol.n_sect);
            le.extend_from_slice(&symbol.n_desc.to_le_bytes());
            le.extend_from_slice(&symbol.n_value.to_le_bytes());
        }
        let str_off = le_fileoff + le.len() as u64;
        le.extend_from_slice(&strtab);
        let le_filesize = le.len() as u64;

        let total = (le_fileoff + le_filesize) as usize;
        let mut image = vec![0u8; total];

        // mach header
        let flags = MH_TWOLEVEL | self.extra_flags;
        image.pwrite_with(
            Header64 {
                magic: MH_MAGIC_64,
                cputype: self.cputype,
                cpusubtype: self.cpusubtype,
                filetype: self.filetype,
                ncmds: ncmds as u32,
                sizeofcmds: cmds_size as u32,
                flags,
                reserved: 0,
            },
            0,
            scroll::LE,
        )?;

        let mut cursor = 0x20usize;

        // __TEXT with one __text section
        let text_sect_addr = self.preferred_base + header_and_cmds as u64;
        image.pwrite_with(
            SegmentCommand64 {
                cmd: LC_SEGMENT_64,
                cmdsize: (SIZEOF_SEGMENT_COMMAND_64 + SIZEOF_SECTION_64) as u32,
                segname: pad16("__TEXT"),
                vmaddr: self.preferred_base,
                vmsize: text_size,
                fileoff: 0,
                filesize: text_size,
                maxprot: VM_PROT_READ | VM_PROT_EXECUTE,
                initprot: VM_PROT_READ | VM_PROT_EXECUTE,
                nsects: 1,
                flags: 0,
            },
            cursor,
            scroll::LE,
        )?;
        cursor += SIZEOF_SEGMENT_COMMAND_64;
        image.pwrite_with(
            Section64 {
                sectname: pad16("__text"),
                segname: pad16("__TEXT"),
                addr: text_sect_addr,
                size: self.text_content.len() as u64,
                offset: header_and_cmds as u32,
                align: 4,
                reloff: 0,
                nreloc: 0,
                flags: 0x8000_0400, // S_ATTR_PURE_INSTRUCTIONS | SOME_INSTRUCTIONS
                reserved1: 0,
                reserved2: 0,
                reserved3: 0,
            },
            cursor,
            scroll::LE,
        )?;
        cursor += SIZEOF_SECTION_64;

        // user segments
        for (segment, layout) in self.segments.iter().zip(&layouts) {
            image.pwrite_with(
                SegmentCommand64 {
                    cmd: LC_SEGMENT_64,
                    cmdsize: (SIZEOF_SEGMENT_COMMAND_64
                        + SIZEOF_SECTION_64 * segment.sections.len())
                        as u32,
                    segname: pad16(&segment.name),
                    vmaddr: layout.vmaddr,
                    vmsize: layout.vmsize,
                    fileoff: layout.fileoff,
                    filesize: layout.filesize,
                    maxprot: segment.maxprot,
                    initprot: segment.initprot,
                    nsects: segment.sections.len() as u32,
                    flags: 0,
                },
                cursor,
                scroll::LE,
            )?;
            cursor += SIZEOF_SEGMENT_COMMAND_64;
            let mut sect_offset = segment.content.len() as u64;
            for section in &segment.sections {
                image.pwrite_with(
                    Section64 {
                        sectname: pad16(&section.name),
                        segname: pad16(&segment.name),
                        addr: layout.vmaddr + sect_offset,
                        size: section.content.len() as u64,
                        offset: (layout.fileoff + sect_offset) as u32,
                        align: section.align,
                        reloff: 0,
                        nreloc: 0,
                        flags: section.flags,
                        reserved1: section.reserved1,
                        reserved2: section.reserved2,
                        reserved3: 0,
                    },
                    cursor,
                    scroll::LE,
                )?;
                cursor += SIZEOF_SECTION_64;
                sect_offset += section.content.len() as u64;
            }
        }

        // __LINKEDIT
        image.pwrite_with(
            SegmentCommand64 {
                cmd: LC_SEGMENT_64,
                cmdsize: SIZEOF_SEGMENT_COMMAND_64 as u32,
                segname: pad16("__LINKEDIT"),
                vmaddr: le_vmaddr,
                vmsize: page_align(le_filesize),
                fileoff: le_fileoff,
                filesize: le_filesize,
                maxprot: VM_PROT_READ,
                initprot: VM_PROT_READ,
                nsects: 0,
                flags: 0,
            },
            cursor,
            scroll::LE,
        )?;
        cursor += SIZEOF_SEGMENT_COMMAND_64;

        if let Some(name) = &self.install_name {
            cursor = write_dylib_cmd(&mut image, cursor, LC_ID_DYLIB, name, 0x1_0000, 0x1_0000)?;
        }
        for dependent in &self.dependents {
            let cmd = match dependent.kind {
                DependentKind::Regular => LC_LOAD_DYLIB,
                DependentKind::Weak => LC_LOAD_WEAK_DYLIB,
                DependentKind::Reexport => LC_REEXPORT_DYLIB,
                DependentKind::Upward => LC_LOAD_UPWARD_DYLIB,
            };
            cursor = write_dylib_cmd(
                &mut image,
                cursor,
                cmd,
                &dependent.path,
                dependent.compat_version,
                dependent.current_version,
            )?;
        }
        for rpath in &self.rpaths {
            let size = rpath_cmd_size(rpath);
            image.pwrite_with(
                RpathCommand {
                    cmd: LC_RPATH,
                    cmdsize: size as u32,
                    path: 12,
                },
                cursor,
                scroll::LE,
            )?;
            image[cursor + 12..cursor + 12 + rpath.len()].copy_from_slice(rpath.as_bytes());
            cursor += size;
        }
        if let Some(uuid) = self.uuid {
            image.pwrite_with(
                UuidCommand {
                    cmd: LC_UUID,
                    cmdsize: SIZEOF_UUID_COMMAND as u32,
                    uuid,
                },
                cursor,
                scroll::LE,
            )?;
            cursor += SIZEOF_UUID_COMMAND;
        }
        if let Some((platform, min_os, sdk)) = &self.platform {
            image.pwrite_with(
                BuildVersionCommand {
                    cmd: LC_BUILD_VERSION,
                    cmdsize: 24,
                    platform: platform.raw(),
                    minos: min_os.0,
                    sdk: sdk.0,
                    ntools: 0,
                },
                cursor,
                scroll::LE,
            )?;
            cursor += 24;
        }
        if self.filetype == MH_EXECUTE && self.emit_entry {
            image.pwrite_with(
                EntryPointCommand {
                    cmd: LC_MAIN,
                    cmdsize: SIZEOF_ENTRY_POINT_COMMAND as u32,
                    entryoff: self.entry_offset.unwrap_or(header_and_cmds as u64),
                    stacksize: 0,
                },
                cursor,
                scroll::LE,
            )?;
            cursor += SIZEOF_ENTRY_POINT_COMMAND;
        }
        if self.linkedit.has_dyld_info() {
            image.pwrite_with(
                DyldInfoCommand {
                    cmd: LC_DYLD_INFO_ONLY,
                    cmdsize: SIZEOF_DYLD_INFO_COMMAND as u32,
                    rebase_off: nonzero(rebase_off, &self.linkedit.rebase),
                    rebase_size: self.linkedit.rebase.len() as u32,
                    bind_off: nonzero(bind_off, &self.linkedit.bind),
                    bind_size: self.linkedit.bind.len() as u32,
                    weak_bind_off: nonzero(weak_off, &self.linkedit.weak_bind),
                    weak_bind_size: self.linkedit.weak_bind.len() as u32,
                    lazy_bind_off: nonzero(lazy_off, &self.linkedit.lazy_bind),
                    lazy_bind_size: self.linkedit.lazy_bind.len() as u32,
                    export_off: nonzero(export_off, &self.linkedit.export_trie),
                    export_size: self.linkedit.export_trie.len() as u32,
                },
                cursor,
                scroll::LE,
            )?;
            cursor += SIZEOF_DYLD_INFO_COMMAND;
        }
        if !self.linkedit.chained.is_empty() {
            image.pwrite_with(
                LinkeditDataCommand {
                    cmd: LC_DYLD_CHAINED_FIXUPS,
                    cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
                    dataoff: chained_off as u32,
                    datasize: self.linkedit.chained.len() as u32,
                },
                cursor,
                scroll::LE,
            )?;
            cursor += SIZEOF_LINKEDIT_DATA_COMMAND;
            image.pwrite_with(
                LinkeditDataCommand {
                    cmd: LC_DYLD_EXPORTS_TRIE,
                    cmdsize: SIZEOF_LINKEDIT_DATA_COMMAND as u32,
                    dataoff: if self.linkedit.export_trie.is_empty() {
                        0
                    } else {
                        export_off as u32
                    },
                    datasize: self.linkedit.export_trie.len() as u32,
                },
                cursor,
                scroll::LE,
            )?;
            cursor += SIZEOF_LINKEDIT_DATA_COMMAND;
        }
        if !self.linkedit.symbols.is_empty() {
            image.pwrite_with(
                SymtabCommand {
                    cmd: LC_SYMTAB,
                    cmdsize: SIZEOF_SYMTAB_COMMAND as u32,
                    symoff: sym_off as u32,
                    nsyms: self.linkedit.symbols.len() as u32,
                    stroff: str_off as u32,
                    strsize: strtab.len() as u32,
                },
                cursor,
                scroll::LE,
            )?;
            cursor += SIZEOF_SYMTAB_COMMAND;
            image.pwrite_with(
                DysymtabCommand {
                    cmd: LC_DYSYMTAB,
                    cmdsize: 80,
                    indirectsymoff: if self.linkedit.indirect_symbols.is_empty() {
                        0
                    } else {
                        indirect_off as u32
                    },
                    nindirectsyms: self.linkedit.indirect_symbols.len() as u32,
                    ..Default::default()
                },
                cursor,
                scroll::LE,
            )?;
            cursor += 80;
        }
        debug_assert_eq!(cursor, header_and_cmds);

        // file content: __text, user segment bytes, linkedit
        image[header_and_cmds..header_and_cmds + self.text_content.len()]
            .copy_from_slice(&self.text_content);
        for (segment, layout) in self.segments.iter().zip(&layouts) {
            let mut offset = layout.fileoff as usize;
            image[offset..offset + segment.content.len()].copy_from_slice(&segment.content);
            offset += segment.content.len();
            for section in &segment.sections {
                image[offset..offset + section.content.len()].copy_from_slice(&section.content);
                offset += section.content.len();
            }
        }
        image[le_fileoff as usize..].copy_from_slice(&le);
        Ok(image)
    }
}

fn nonzero(offset: u64, blob: &[u8]) -> u32 {
    if blob.is_empty() {
        0
    } else {
        offset as u32
    }
}

fn dylib_cmd_size(path: &str) -> usize {
    (24 + path.len() + 1 + 7) & !7
}

fn rpath_cmd_size(path: &str) -> usize {
    (12 + path.len() + 1 + 7) & !7
}

fn write_dylib_cmd(
    image: &mut [u8],
    cursor: usize,
    cmd: u32,
    path: &str,
    compat_version: u32,
    current_version: u32,
) -> Result<usize> {
    let size = dylib_cmd_size(path);
    image.pwrite_with(
        DylibCommand {
            cmd,
            cmdsize: size as u32,
            dylib: crate::mach::load_command::Dylib {
                name: 24,
                timestamp: 2,
                current_version,
                compatibility_version: compat_version,
            },
        },
        cursor,
        scroll::LE,
    )?;
    image[cursor + 24..cursor + 24 + path.len()].copy_from_slice(path.as_bytes());
    Ok(cursor + size)
}

//
// opcode stream encoders
//

#[derive(Debug, Default)]
/// Encodes a rebase opcode stream the way the static linker does
pub struct RebaseOpcodes {
    bytes: Vec<u8>,
    seg_index: Option<u64>,
    type_set: bool,
}

impl RebaseOpcodes {
    pub fn new() -> RebaseOpcodes {
        RebaseOpcodes::default()
    }

    /// Emits one pointer rebase at `(seg_index, seg_offset)`
    pub fn rebase(&mut self, seg_index: u64, seg_offset: u64) -> &mut Self {
        if !self.type_set {
            self.bytes
                .push(REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER);
            self.type_set = true;
        }
        self.bytes
            .push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg_index as u8);
        write_uleb128(&mut self.bytes, seg_offset);
        self.bytes.push(REBASE_OPCODE_DO_REBASE_IMM_TIMES | 1);
        self.seg_index = Some(seg_index);
        self
    }

    /// Emits `count` consecutive pointer rebases
    pub fn rebase_run(&mut self, seg_index: u64, seg_offset: u64, count: u64) -> &mut Self {
        if !self.type_set {
            self.bytes
                .push(REBASE_OPCODE_SET_TYPE_IMM | REBASE_TYPE_POINTER);
            self.type_set = true;
        }
        self.bytes
            .push(REBASE_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg_index as u8);
        write_uleb128(&mut self.bytes, seg_offset);
        self.bytes.push(REBASE_OPCODE_DO_REBASE_ULEB_TIMES);
        write_uleb128(&mut self.bytes, count);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        self.bytes.push(REBASE_OPCODE_DONE);
        core::mem::take(&mut self.bytes)
    }
}

#[derive(Debug, Default)]
/// Encodes a bind opcode stream
pub struct BindOpcodes {
    bytes: Vec<u8>,
    lazy: bool,
}

impl BindOpcodes {
    pub fn new() -> BindOpcodes {
        BindOpcodes::default()
    }

    pub fn lazy() -> BindOpcodes {
        BindOpcodes {
            bytes: Vec::new(),
            lazy: true,
        }
    }

    /// Emits one pointer bind
    pub fn bind(
        &mut self,
        seg_index: u64,
        seg_offset: u64,
        lib_ordinal: i32,
        symbol: &str,
        addend: i64,
        weak_import: bool,
    ) -> &mut Self {
        match lib_ordinal {
            0..=15 => self
                .bytes
                .push(BIND_OPCODE_SET_DYLIB_ORDINAL_IMM | lib_ordinal as u8),
            16.. => {
                self.bytes.push(BIND_OPCODE_SET_DYLIB_ORDINAL_ULEB);
                write_uleb128(&mut self.bytes, lib_ordinal as u64);
            }
            _ => self
                .bytes
                .push(BIND_OPCODE_SET_DYLIB_SPECIAL_IMM | (lib_ordinal & 0xf) as u8),
        }
        let flags = if weak_import {
            BIND_SYMBOL_FLAGS_WEAK_IMPORT
        } else {
            0
        };
        self.bytes
            .push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | flags);
        self.bytes.extend_from_slice(symbol.as_bytes());
        self.bytes.push(0);
        self.bytes.push(BIND_OPCODE_SET_TYPE_IMM | BIND_TYPE_POINTER);
        if addend != 0 {
            self.bytes.push(BIND_OPCODE_SET_ADDEND_SLEB);
            write_sleb128(&mut self.bytes, addend);
        }
        self.bytes
            .push(BIND_OPCODE_SET_SEGMENT_AND_OFFSET_ULEB | seg_index as u8);
        write_uleb128(&mut self.bytes, seg_offset);
        self.bytes.push(BIND_OPCODE_DO_BIND);
        if self.lazy {
            self.bytes.push(BIND_OPCODE_DONE);
        }
        self
    }

    /// Emits a weak-stream strong-definition notice
    pub fn strong_def(&mut self, symbol: &str) -> &mut Self {
        self.bytes
            .push(BIND_OPCODE_SET_SYMBOL_TRAILING_FLAGS_IMM | BIND_SYMBOL_FLAGS_NON_WEAK_DEFINITION);
        self.bytes.extend_from_slice(symbol.as_bytes());
        self.bytes.push(0);
        self
    }

    pub fn finish(&mut self) -> Vec<u8> {
        if !self.lazy {
            self.bytes.push(BIND_OPCODE_DONE);
        }
        core::mem::take(&mut self.bytes)
    }
}

//
// export trie encoder
//

#[derive(Debug, Clone)]
/// One export for the trie encoder
pub struct ExportSpec {
    pub name: String,
    pub flags: u64,
    pub offset: u64,
}

impl ExportSpec {
    pub fn regular(name: &str, offset: u64) -> ExportSpec {
        ExportSpec {
            name: name.to_owned(),
            flags: 0,
            offset,
        }
    }

    pub fn weak(name: &str, offset: u64) -> ExportSpec {
        ExportSpec {
            name: name.to_owned(),
            flags: crate::mach::exports::EXPORT_SYMBOL_FLAGS_WEAK_DEFINITION,
            offset,
        }
    }
}

/// a two-byte uleb can address anything under 16KB, which bounds the tries
/// the encoder can emit
fn write_uleb128_2(out: &mut Vec<u8>, value: u64) {
    debug_assert!(value < 0x4000);
    out.push((value & 0x7f) as u8 | 0x80);
    out.push((value >> 7) as u8);
}

/// Encodes a flat (one edge per symbol) export trie. Flat tries are legal
/// if unoptimized; the decoder cannot tell the difference.
pub fn build_export_trie(exports: &[ExportSpec]) -> Vec<u8> {
    let mut trie = Vec::new();
    // root: no terminal, one edge per export
    trie.push(0x00);
    trie.push(exports.len() as u8);
    let mut edge_fixups = Vec::new();
    for export in exports {
        trie.extend_from_slice(export.name.as_bytes());
        trie.push(0);
        edge_fixups.push(trie.len());
        // child offsets are patched once the node positions are known
        write_uleb128_2(&mut trie, 0);
    }
    for (export, fixup) in exports.iter().zip(edge_fixups) {
        let node_offset = trie.len() as u64;
        let mut patched = Vec::new();
        write_uleb128_2(&mut patched, node_offset);
        trie[fixup..fixup + 2].copy_from_slice(&patched);
        let mut terminal = Vec::new();
        write_uleb128(&mut terminal, export.flags);
        write_uleb128(&mut terminal, export.offset);
        write_uleb128(&mut trie, terminal.len() as u64);
        trie.extend_from_slice(&terminal);
        trie.push(0x00); // no children
    }
    trie
}

//
// chained fixups encoder
//

#[derive(Debug, Clone)]
/// One chained import for the encoder
pub struct ChainedImportSpec {
    pub lib_ordinal: i32,
    pub name: String,
    pub weak_import: bool,
    pub addend: i32,
}

#[derive(Debug, Clone, Copy)]
/// One fixup slot inside the chained segment
pub enum ChainedSlot {
    /// rebase to an image offset, with an optional high8 tag
    Rebase { target_offset: u64, high8: u8 },
    /// bind to an imports-table ordinal
    Bind { ordinal: u32 },
}

/// Encodes a chained-fixups linkedit blob (DYLD_CHAINED_PTR_64_OFFSET,
/// import format with addends) for one data segment, and patches the raw
/// chain values into `segment_content`. `slots` must be sorted by offset
/// and 8-byte aligned, all within the first page.
pub fn build_chained_fixups(
    segment_runtime_offset: u64,
    segment_content: &mut [u8],
    slots: &[(u64, ChainedSlot)],
    imports: &[ChainedImportSpec],
) -> Result<Vec<u8>> {
    use crate::mach::chained::DYLD_CHAINED_PTR_64_OFFSET;
    // write the chain into the segment content
    for (i, (offset, slot)) in slots.iter().enumerate() {
        if offset % 8 != 0 || *offset >= PAGE_SIZE {
            return Err(Error::Malformed(format!(
                "chained slot at {:#x} is not a first-page aligned location",
                offset
            )));
        }
        let next = match slots.get(i + 1) {
            Some((next_offset, _)) => (next_offset - offset) / 4,
            None => 0,
        };
        let raw = match slot {
            ChainedSlot::Rebase {
                target_offset,
                high8,
            } => (next << 51) | (u64::from(*high8) << 36) | (target_offset & 0xf_ffff_ffff),
            ChainedSlot::Bind { ordinal } => {
                (1u64 << 63) | (next << 51) | u64::from(*ordinal & 0xff_ffff)
            }
        };
        segment_content
            .pwrite_with(raw, *offset as usize, scroll::LE)
            .map_err(|_| Error::Malformed("chained slot outside its segment".into()))?;
    }

    // assemble the blob: header, starts, imports, symbols
    let starts_offset = SIZEOF_CHAINED_FIXUPS_HEADER as u32 + 4; // align to 8
    let starts_in_image_size = 4 + 4; // seg_count + one seg_info_offset
    let seg_record = SIZEOF_STARTS_IN_SEGMENT_PREFIX + 2;
    let seg_record_aligned = (seg_record + 3) & !3;
    let imports_offset = starts_offset + (starts_in_image_size + seg_record_aligned) as u32;
    let mut names = Vec::new();
    let mut import_records = Vec::new();
    for import in imports {
        let name_offset = names.len() as u32;
        names.extend_from_slice(import.name.as_bytes());
        names.push(0);
        let ordinal_byte = (import.lib_ordinal as u8) as u32;
        let raw = ordinal_byte
            | (u32::from(import.weak_import) << 8)
            | (name_offset << 9);
        import_records.push((raw, import.addend));
    }
    let symbols_offset = imports_offset + (import_records.len() * 8) as u32;

    let mut blob = Vec::new();
    let mut header_bytes = [0u8; SIZEOF_CHAINED_FIXUPS_HEADER];
    header_bytes.pwrite_with(
        ChainedFixupsHeader {
            fixups_version: 0,
            starts_offset,
            imports_offset,
            symbols_offset,
            imports_count: import_records.len() as u32,
            imports_format: DYLD_CHAINED_IMPORT_ADDEND,
            symbols_format: 0,
        },
        0,
        scroll::LE,
    )?;
    blob.extend_from_slice(&header_bytes);
    blob.extend_from_slice(&[0u8; 4]);
    // starts in image: one segment
    blob.extend_from_slice(&1u32.to_le_bytes());
    blob.extend_from_slice(&(starts_in_image_size as u32).to_le_bytes());
    // starts in segment
    blob.extend_from_slice(&(seg_record_aligned as u32).to_le_bytes());
    blob.extend_from_slice(&0x1000u16.to_le_bytes());
    blob.extend_from_slice(&DYLD_CHAINED_PTR_64_OFFSET.to_le_bytes());
    blob.extend_from_slice(&segment_runtime_offset.to_le_bytes());
    blob.extend_from_slice(&0u32.to_le_bytes()); // max_valid_pointer
    blob.extend_from_slice(&1u16.to_le_bytes()); // page_count
    let first = slots
        .first()
        .map(|(offset, _)| *offset as u16)
        .unwrap_or(DYLD_CHAINED_PTR_START_NONE);
    blob.extend_from_slice(&first.to_le_bytes());
    while blob.len() < imports_offset as usize {
        blob.push(0);
    }
    for (raw, addend) in &import_records {
        blob.extend_from_slice(&raw.to_le_bytes());
        blob.extend_from_slice(&addend.to_le_bytes());
    }
    blob.extend_from_slice(&names);
    Ok(blob)
}
