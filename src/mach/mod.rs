//! The Mach-o analyzer: a zero-copy, read-only view over one mapped slice
//! of a thin or fat mach-o file. Parsing folds the load commands into
//! width-independent tables; every fixup-metadata query decodes its linkedit
//! stream on demand and stops the moment its handler asks it to.
//!
//! Nothing in this module knows about process state; it is a pure function
//! of the bytes it is handed.

use core::fmt;
use core::ops::ControlFlow;

use crate::container::Ctx;
use crate::error::{Error, Result};

pub mod arch;
pub mod builder;
pub mod chained;
pub mod codesign;
pub mod constants;
pub mod exports;
pub mod fat;
pub mod header;
pub mod load_command;
pub mod opcodes;
pub mod relocation;
pub mod segments;
pub mod symbols;
pub mod uleb;
pub mod validate;

use self::chained::{ChainedFixups, ChainedImport};
use self::constants::{
    SECTION_TYPE, SEG_LINKEDIT, SEG_TEXT, S_INIT_FUNC_OFFSETS, S_MOD_INIT_FUNC_POINTERS,
    S_MOD_TERM_FUNC_POINTERS, S_THREAD_LOCAL_VARIABLES,
};
use self::exports::ExportTrie;
use self::header::Header;
use self::load_command::{
    CommandVariant, DyldInfoCommand, DysymtabCommand, LinkeditDataCommand, SymtabCommand,
};
use self::opcodes::{BindEvent, BindStream, RebaseEvent, RebaseKind};
use self::segments::{SectionInfo, SegmentInfo};
use self::symbols::Symbols;

/// Platforms a mach-o image can be built for, from `LC_BUILD_VERSION`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Platform {
    MacOS,
    Ios,
    TvOs,
    WatchOs,
    BridgeOs,
    MacCatalyst,
    IosSimulator,
    TvOsSimulator,
    WatchOsSimulator,
    DriverKit,
    Unknown(u32),
}

impl Default for Platform {
    fn default() -> Platform {
        Platform::Unknown(0)
    }
}

impl Platform {
    pub fn from_raw(raw: u32) -> Platform {
        match raw {
            1 => Platform::MacOS,
            2 => Platform::Ios,
            3 => Platform::TvOs,
            4 => Platform::WatchOs,
            5 => Platform::BridgeOs,
            6 => Platform::MacCatalyst,
            7 => Platform::IosSimulator,
            8 => Platform::TvOsSimulator,
            9 => Platform::WatchOsSimulator,
            10 => Platform::DriverKit,
            other => Platform::Unknown(other),
        }
    }

    pub fn raw(&self) -> u32 {
        match self {
            Platform::MacOS => 1,
            Platform::Ios => 2,
            Platform::TvOs => 3,
            Platform::WatchOs => 4,
            Platform::BridgeOs => 5,
            Platform::MacCatalyst => 6,
            Platform::IosSimulator => 7,
            Platform::TvOsSimulator => 8,
            Platform::WatchOsSimulator => 9,
            Platform::DriverKit => 10,
            Platform::Unknown(other) => *other,
        }
    }

    pub fn is_simulator(&self) -> bool {
        matches!(
            self,
            Platform::IosSimulator | Platform::TvOsSimulator | Platform::WatchOsSimulator
        )
    }

    /// Whether images built for `other` can load into a process on this
    /// platform (macOS and Catalyst are zippered together)
    pub fn accepts(&self, other: Platform) -> bool {
        if *self == other {
            return true;
        }
        matches!(
            (self, other),
            (Platform::MacOS, Platform::MacCatalyst) | (Platform::MacCatalyst, Platform::MacOS)
        )
    }
}

impl fmt::Display for Platform {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        let name = match self {
            Platform::MacOS => "macOS",
            Platform::Ios => "iOS",
            Platform::TvOs => "tvOS",
            Platform::WatchOs => "watchOS",
            Platform::BridgeOs => "bridgeOS",
            Platform::MacCatalyst => "Mac Catalyst",
            Platform::IosSimulator => "iOS Simulator",
            Platform::TvOsSimulator => "tvOS Simulator",
            Platform::WatchOsSimulator => "watchOS Simulator",
            Platform::DriverKit => "DriverKit",
            Platform::Unknown(other) => return write!(fmt, "platform #{}", other),
        };
        write!(fmt, "{}", name)
    }
}

/// An OS or SDK version packed as `xxxx.yy.zz` nibbles
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord)]
pub struct Version32(pub u32);

impl Version32 {
    pub fn new(major: u16, minor: u8, patch: u8) -> Version32 {
        Version32((u32::from(major) << 16) | (u32::from(minor) << 8) | u32::from(patch))
    }
    pub fn major(&self) -> u16 {
        (self.0 >> 16) as u16
    }
    pub fn minor(&self) -> u8 {
        ((self.0 >> 8) & 0xff) as u8
    }
    pub fn patch(&self) -> u8 {
        (self.0 & 0xff) as u8
    }
}

impl fmt::Display for Version32 {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        if self.patch() == 0 {
            write!(fmt, "{}.{}", self.major(), self.minor())
        } else {
            write!(fmt, "{}.{}.{}", self.major(), self.minor(), self.patch())
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Platform and version metadata from `LC_BUILD_VERSION` or the legacy
/// `LC_VERSION_MIN_*` commands
pub struct PlatformInfo {
    pub platform: Platform,
    pub min_os: Version32,
    pub sdk: Version32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How the image names its entry point
pub enum EntryInfo {
    /// `LC_MAIN`: a `__TEXT` file offset plus an optional stack size
    Main { entry_offset: u64, stack_size: u64 },
    /// `LC_UNIXTHREAD`: an absolute initial pc
    UnixThread { pc: u64 },
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// One `LC_LOAD_*_DYLIB` edge
pub struct DependentDylib {
    pub path: String,
    pub weak: bool,
    pub reexport: bool,
    pub upward: bool,
    pub compat_version: u32,
    pub current_version: u32,
}

#[derive(Debug, Clone, Default)]
/// Where every linkedit table of this image lives
pub struct LinkeditLayout {
    pub symtab: Option<SymtabCommand>,
    pub dysymtab: Option<DysymtabCommand>,
    pub dyld_info: Option<DyldInfoCommand>,
    pub chained_fixups: Option<LinkeditDataCommand>,
    pub exports_trie: Option<LinkeditDataCommand>,
    pub code_signature: Option<LinkeditDataCommand>,
    pub function_starts: Option<LinkeditDataCommand>,
    pub data_in_code: Option<LinkeditDataCommand>,
    pub split_info: Option<LinkeditDataCommand>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where an initializer or terminator came from
pub enum InitializerKind {
    /// `LC_ROUTINES`: the recorded address is an unslid vmaddr
    Routine { init_address: u64 },
    /// `S_MOD_INIT_FUNC_POINTERS` / `S_MOD_TERM_FUNC_POINTERS`: the section
    /// holds absolute pointers, fixed up before they run
    PointerSection,
    /// `S_INIT_FUNC_OFFSETS`: the section holds 32-bit image offsets and
    /// needs no fixups
    OffsetSection,
}

#[derive(Debug)]
/// A zero-copy, validating mach-o analyzer over one thin slice
pub struct MachFile<'a> {
    pub data: &'a [u8],
    pub header: Header,
    pub ctx: Ctx,
    pub segments: Vec<SegmentInfo>,
    pub linkedit: LinkeditLayout,
    pub dependents: Vec<DependentDylib>,
    pub rpaths: Vec<String>,
    pub install_name: Option<String>,
    pub uuid: Option<[u8; 16]>,
    pub platform: Option<PlatformInfo>,
    pub entry: Option<EntryInfo>,
    /// `LC_DYLD_ENVIRONMENT` strings, honored only under policy
    pub dyld_environment: Vec<String>,
    /// `LC_ROUTINES` initializer, if any
    pub routines: Option<u64>,
    /// duplicate load commands are ignored but still counted
    pub duplicate_commands: u32,
}

impl<'a> MachFile<'a> {
    /// Parses a thin mach-o slice, folding its load commands. Structural
    /// invariants (command sizes, string termination) are enforced here;
    /// policy checks live in [`MachFile::validate`].
    pub fn parse(data: &'a [u8]) -> Result<MachFile<'a>> {
        let header = Header::parse(data)?;
        let ctx = header.ctx()?;
        let commands = load_command::walk(data, &header, ctx)?;
        let mut segments = Vec::new();
        let mut linkedit = LinkeditLayout::default();
        let mut dependents = Vec::new();
        let mut rpaths = Vec::new();
        let mut install_name = None;
        let mut uuid = None;
        let mut platform = None;
        let mut entry = None;
        let mut dyld_environment = Vec::new();
        let mut routines = None;
        let mut duplicates = 0u32;

        fn keep_first<T>(slot: &mut Option<T>, value: T, duplicates: &mut u32) {
            if slot.is_none() {
                *slot = Some(value);
            } else {
                *duplicates += 1;
            }
        }

        for cmd in &commands {
            match &cmd.command {
                CommandVariant::Segment32(seg) => {
                    segments.push(segments::from_segment32(data, cmd.offset, seg)?);
                }
                CommandVariant::Segment64(seg) => {
                    segments.push(segments::from_segment64(data, cmd.offset, seg)?);
                }
                CommandVariant::Symtab(symtab) => {
                    keep_first(&mut linkedit.symtab, *symtab, &mut duplicates)
                }
                CommandVariant::Dysymtab(dysymtab) => {
                    keep_first(&mut linkedit.dysymtab, *dysymtab, &mut duplicates)
                }
                CommandVariant::DyldInfo(info) | CommandVariant::DyldInfoOnly(info) => {
                    keep_first(&mut linkedit.dyld_info, *info, &mut duplicates)
                }
                CommandVariant::DyldChainedFixups(data_cmd) => {
                    keep_first(&mut linkedit.chained_fixups, *data_cmd, &mut duplicates)
                }
                CommandVariant::DyldExportsTrie(data_cmd) => {
                    keep_first(&mut linkedit.exports_trie, *data_cmd, &mut duplicates)
                }
                CommandVariant::CodeSignature(data_cmd) => {
                    keep_first(&mut linkedit.code_signature, *data_cmd, &mut duplicates)
                }
                CommandVariant::FunctionStarts(data_cmd) => {
                    keep_first(&mut linkedit.function_starts, *data_cmd, &mut duplicates)
                }
                CommandVariant::DataInCode(data_cmd) => {
                    keep_first(&mut linkedit.data_in_code, *data_cmd, &mut duplicates)
                }
                CommandVariant::SegmentSplitInfo(data_cmd) => {
                    keep_first(&mut linkedit.split_info, *data_cmd, &mut duplicates)
                }
                CommandVariant::LoadDylib(dylib)
                | CommandVariant::LoadWeakDylib(dylib)
                | CommandVariant::ReexportDylib(dylib)
                | CommandVariant::LoadUpwardDylib(dylib)
                | CommandVariant::LazyLoadDylib(dylib) => {
                    let path =
                        load_command::lc_str(data, cmd.offset, dylib.cmdsize, dylib.dylib.name)?;
                    dependents.push(DependentDylib {
                        path: path.to_owned(),
                        weak: matches!(cmd.command, CommandVariant::LoadWeakDylib(_)),
                        reexport: matches!(cmd.command, CommandVariant::ReexportDylib(_)),
                        upward: matches!(cmd.command, CommandVariant::LoadUpwardDylib(_)),
                        compat_version: dylib.dylib.compatibility_version,
                        current_version: dylib.dylib.current_version,
                    });
                }
                CommandVariant::IdDylib(dylib) => {
                    if install_name.is_some() {
                        return Err(Error::Malformed(
                            "more than one LC_ID_DYLIB".into(),
                        ));
                    }
                    let path =
                        load_command::lc_str(data, cmd.offset, dylib.cmdsize, dylib.dylib.name)?;
                    install_name = Some(path.to_owned());
                }
                CommandVariant::Rpath(rpath) => {
                    rpaths.push(
                        load_command::lc_str(data, cmd.offset, rpath.cmdsize, rpath.path)?
                            .to_owned(),
                    );
                }
                CommandVariant::DyldEnvironment(env) => {
                    dyld_environment.push(
                        load_command::lc_str(data, cmd.offset, env.cmdsize, env.name)?.to_owned(),
                    );
                }
                CommandVariant::Uuid(cmd_uuid) => {
                    keep_first(&mut uuid, cmd_uuid.uuid, &mut duplicates)
                }
                CommandVariant::BuildVersion(build) => keep_first(
                    &mut platform,
                    PlatformInfo {
                        platform: Platform::from_raw(build.platform),
                        min_os: Version32(build.minos),
                        sdk: Version32(build.sdk),
                    },
                    &mut duplicates,
                ),
                CommandVariant::VersionMinMacosx(min) => keep_first(
                    &mut platform,
                    PlatformInfo {
                        platform: Platform::MacOS,
                        min_os: Version32(min.version),
                        sdk: Version32(min.sdk),
                    },
                    &mut duplicates,
                ),
                CommandVariant::VersionMinIphoneos(min) => keep_first(
                    &mut platform,
                    PlatformInfo {
                        platform: Platform::Ios,
                        min_os: Version32(min.version),
                        sdk: Version32(min.sdk),
                    },
                    &mut duplicates,
                ),
                CommandVariant::VersionMinTvos(min) => keep_first(
                    &mut platform,
                    PlatformInfo {
                        platform: Platform::TvOs,
                        min_os: Version32(min.version),
                        sdk: Version32(min.sdk),
                    },
                    &mut duplicates,
                ),
                CommandVariant::VersionMinWatchos(min) => keep_first(
                    &mut platform,
                    PlatformInfo {
                        platform: Platform::WatchOs,
                        min_os: Version32(min.version),
                        sdk: Version32(min.sdk),
                    },
                    &mut duplicates,
                ),
                CommandVariant::Main(main) => {
                    if entry.is_some() {
                        return Err(Error::Malformed(
                            "more than one LC_MAIN or LC_UNIXTHREAD".into(),
                        ));
                    }
                    entry = Some(EntryInfo::Main {
                        entry_offset: main.entryoff,
                        stack_size: main.stacksize,
                    });
                }
                CommandVariant::Unixthread(thread) => {
                    if entry.is_some() {
                        return Err(Error::Malformed(
                            "more than one LC_MAIN or LC_UNIXTHREAD".into(),
                        ));
                    }
                    let pc = thread_entry_pc(data, cmd.offset, thread.cmdsize, header.cputype)?;
                    entry = Some(EntryInfo::UnixThread { pc });
                }
                CommandVariant::Routines32(r) => {
                    keep_first(&mut routines, u64::from(r.init_address), &mut duplicates)
                }
                CommandVariant::Routines64(r) => {
                    keep_first(&mut routines, r.init_address, &mut duplicates)
                }
                _ => {}
            }
        }

        Ok(MachFile {
            data,
            header,
            ctx,
            segments,
            linkedit,
            dependents,
            rpaths,
            install_name,
            uuid,
            platform,
            entry,
            dyld_environment,
            routines,
            duplicate_commands: duplicates,
        })
    }

    /// Finds the best slice of `bytes` (thin or fat) for `archs` and parses
    /// it
    pub fn parse_slice(
        bytes: &'a [u8],
        archs: &arch::GradedArchs,
        is_os_binary: bool,
    ) -> Result<MachFile<'a>> {
        let slice = fat::best_slice(bytes, archs, is_os_binary)?;
        MachFile::parse(slice)
    }

    pub fn is64(&self) -> bool {
        self.ctx.is_big()
    }

    pub fn pointer_size(&self) -> u64 {
        self.ctx.pointer_size()
    }

    /// The unslid address the image was linked to load at: the address of
    /// its `__TEXT` segment, which holds the mach header
    pub fn preferred_load_address(&self) -> u64 {
        segments::find(&self.segments, SEG_TEXT)
            .map(|(_, segment)| segment.vmaddr)
            .or_else(|| self.segments.first().map(|segment| segment.vmaddr))
            .unwrap_or(0)
    }

    /// Total contiguous VM span the mapped image needs, from the mach
    /// header to the end of the last segment. `__PAGEZERO` sits below the
    /// header and is not part of the mapping.
    pub fn vm_span(&self) -> Result<u64> {
        let base = self.preferred_load_address();
        let mut end = base;
        for segment in &self.segments {
            if segment.vmaddr < base {
                continue;
            }
            let segment_end = segment
                .vmaddr
                .checked_add(segment.vmsize)
                .ok_or_else(|| Error::Malformed("segment vm range overflows".into()))?;
            end = end.max(segment_end);
        }
        Ok(end - base)
    }

    pub fn segment(&self, name: &str) -> Option<&SegmentInfo> {
        segments::find(&self.segments, name).map(|(_, segment)| segment)
    }

    pub fn section(&self, segment_name: &str, section_name: &str) -> Option<&SectionInfo> {
        self.segment(segment_name)?
            .sections
            .iter()
            .find(|section| section.name == section_name)
    }

    /// Enumerates segments in load-command order
    pub fn for_each_segment(&self, mut handler: impl FnMut(&SegmentInfo) -> ControlFlow<()>) {
        for segment in &self.segments {
            if handler(segment).is_break() {
                return;
            }
        }
    }

    /// Enumerates every section of every segment
    pub fn for_each_section(&self, mut handler: impl FnMut(&SectionInfo) -> ControlFlow<()>) {
        for segment in &self.segments {
            for section in &segment.sections {
                if handler(section).is_break() {
                    return;
                }
            }
        }
    }

    /// Enumerates `LC_LOAD_*_DYLIB` edges in declaration order
    pub fn for_each_dependent(
        &self,
        mut handler: impl FnMut(&DependentDylib) -> ControlFlow<()>,
    ) {
        for dependent in &self.dependents {
            if handler(dependent).is_break() {
                return;
            }
        }
    }

    pub fn for_each_rpath(&self, mut handler: impl FnMut(&str) -> ControlFlow<()>) {
        for rpath in &self.rpaths {
            if handler(rpath).is_break() {
                return;
            }
        }
    }

    /// Checks a linkedit subrange and returns its bytes; a zero-size range
    /// yields an empty slice
    fn linkedit_slice(&self, offset: u32, size: u32, what: &str) -> Result<&'a [u8]> {
        if size == 0 {
            return Ok(&[]);
        }
        let start = offset as usize;
        let end = start
            .checked_add(size as usize)
            .filter(|&end| end <= self.data.len())
            .ok_or_else(|| {
                Error::Malformed(format!("{} {:#x}..+{:#x} is outside the file", what, offset, size))
            })?;
        if let Some(linkedit) = self.segment(SEG_LINKEDIT) {
            let le_start = linkedit.fileoff as usize;
            let le_end = le_start + linkedit.filesize as usize;
            if start < le_start || end > le_end {
                return Err(Error::Malformed(format!(
                    "{} {:#x}..{:#x} is outside the linkedit segment {:#x}..{:#x}",
                    what, start, end, le_start, le_end
                )));
            }
        }
        Ok(&self.data[start..end])
    }

    pub fn rebase_opcodes(&self) -> Result<&'a [u8]> {
        match &self.linkedit.dyld_info {
            Some(info) => self.linkedit_slice(info.rebase_off, info.rebase_size, "rebase opcodes"),
            None => Ok(&[]),
        }
    }

    pub fn bind_opcodes(&self) -> Result<&'a [u8]> {
        match &self.linkedit.dyld_info {
            Some(info) => self.linkedit_slice(info.bind_off, info.bind_size, "bind opcodes"),
            None => Ok(&[]),
        }
    }

    pub fn weak_bind_opcodes(&self) -> Result<&'a [u8]> {
        match &self.linkedit.dyld_info {
            Some(info) => {
                self.linkedit_slice(info.weak_bind_off, info.weak_bind_size, "weak bind opcodes")
            }
            None => Ok(&[]),
        }
    }

    pub fn lazy_bind_opcodes(&self) -> Result<&'a [u8]> {
        match &self.linkedit.dyld_info {
            Some(info) => {
                self.linkedit_slice(info.lazy_bind_off, info.lazy_bind_size, "lazy bind opcodes")
            }
            None => Ok(&[]),
        }
    }

    /// The export trie blob, from `LC_DYLD_EXPORTS_TRIE` or `LC_DYLD_INFO`;
    /// images without one get an empty trie
    pub fn export_trie(&self) -> Result<ExportTrie<'a>> {
        let blob = if let Some(trie) = &self.linkedit.exports_trie {
            self.linkedit_slice(trie.dataoff, trie.datasize, "export trie")?
        } else if let Some(info) = &self.linkedit.dyld_info {
            self.linkedit_slice(info.export_off, info.export_size, "export trie")?
        } else {
            &[]
        };
        Ok(ExportTrie::new(blob))
    }

    /// The chained-fixups view, when the image carries `LC_DYLD_CHAINED_FIXUPS`
    pub fn chained_fixups(&self) -> Result<Option<ChainedFixups<'a>>> {
        match &self.linkedit.chained_fixups {
            Some(data_cmd) => {
                let blob =
                    self.linkedit_slice(data_cmd.dataoff, data_cmd.datasize, "chained fixups")?;
                Ok(Some(ChainedFixups::parse(blob)?))
            }
            None => Ok(None),
        }
    }

    pub fn has_chained_fixups(&self) -> bool {
        self.linkedit.chained_fixups.is_some()
    }

    pub fn has_opcode_fixups(&self) -> bool {
        self.linkedit.dyld_info.is_some()
    }

    pub fn symbols(&self) -> Result<Option<Symbols<'a>>> {
        match &self.linkedit.symtab {
            Some(symtab) => Ok(Some(Symbols::parse(self.data, symtab, self.ctx)?)),
            None => Ok(None),
        }
    }

    /// Decodes rebase locations: the opcode stream when the image has
    /// `LC_DYLD_INFO`, classic local relocations otherwise. Chained images
    /// carry their rebases in the chains instead.
    pub fn for_each_rebase(
        &self,
        mut handler: impl FnMut(&RebaseEvent) -> ControlFlow<()>,
    ) -> Result<()> {
        if self.linkedit.dyld_info.is_some() {
            let opcodes = self.rebase_opcodes()?;
            return opcodes::for_each_rebase(
                opcodes,
                &self.segments,
                self.pointer_size(),
                handler,
            );
        }
        if let Some(dysymtab) = &self.linkedit.dysymtab {
            let base = self.preferred_load_address();
            return relocation::for_each_local_reloc(
                self.data,
                dysymtab,
                &self.segments,
                self.is64(),
                |reloc| {
                    let event = RebaseEvent {
                        seg_index: reloc.seg_index,
                        seg_offset: reloc.seg_offset,
                        runtime_offset: reloc.runtime_offset,
                        kind: RebaseKind::Pointer,
                        is_lazy_pointer: self.is_lazy_pointer_location(base + reloc.runtime_offset),
                    };
                    handler(&event)
                },
            );
        }
        Ok(())
    }

    fn is_lazy_pointer_location(&self, addr: u64) -> bool {
        self.segments.iter().any(|segment| {
            segment.sections.iter().any(|section| {
                section.flags & SECTION_TYPE == constants::S_LAZY_SYMBOL_POINTERS
                    && addr >= section.addr
                    && addr < section.addr + section.size
            })
        })
    }

    /// Decodes bind locations from all three opcode streams (regular, then
    /// lazy, then weak), or from classic external relocations and indirect
    /// symbol pointers for pre-`LC_DYLD_INFO` images. `strong_handler`
    /// receives weak-stream strong-definition notices.
    pub fn for_each_bind(
        &self,
        mut handler: impl FnMut(&BindEvent<'a>) -> ControlFlow<()>,
        mut strong_handler: Option<&mut dyn FnMut(&'a str)>,
    ) -> Result<()> {
        if self.linkedit.dyld_info.is_some() {
            let pointer_size = self.pointer_size();
            let mut stopped = false;
            for (stream, opcodes) in [
                (BindStream::Regular, self.bind_opcodes()?),
                (BindStream::Lazy, self.lazy_bind_opcodes()?),
                (BindStream::Weak, self.weak_bind_opcodes()?),
            ] {
                if stopped {
                    break;
                }
                opcodes::for_each_bind(
                    opcodes,
                    &self.segments,
                    pointer_size,
                    stream,
                    |event| {
                        let flow = handler(event);
                        if flow.is_break() {
                            stopped = true;
                        }
                        flow
                    },
                    strong_handler.as_mut().map(|h| &mut **h as &mut dyn FnMut(&'a str)),
                )?;
            }
            return Ok(());
        }
        if let (Some(dysymtab), Some(symbols)) = (&self.linkedit.dysymtab, self.symbols()?) {
            let mut stopped = false;
            relocation::for_each_external_reloc(
                self.data,
                dysymtab,
                &self.segments,
                &symbols,
                self.is64(),
                |reloc| {
                    let event = BindEvent {
                        seg_index: reloc.seg_index,
                        seg_offset: reloc.seg_offset,
                        runtime_offset: reloc.runtime_offset,
                        lib_ordinal: reloc.lib_ordinal,
                        symbol_name: reloc.symbol_name,
                        bind_type: opcodes::BIND_TYPE_POINTER,
                        addend: 0,
                        weak_import: reloc.weak_import,
                        lazy: false,
                    };
                    let flow = handler(&event);
                    if flow.is_break() {
                        stopped = true;
                    }
                    flow
                },
            )?;
            if stopped {
                return Ok(());
            }
            relocation::for_each_indirect_pointer(
                self.data,
                dysymtab,
                &self.segments,
                &symbols,
                self.pointer_size(),
                |pointer| {
                    let bind = match &pointer.bind {
                        Some(bind) => bind,
                        None => return ControlFlow::Continue(()),
                    };
                    let event = BindEvent {
                        seg_index: 0,
                        seg_offset: pointer.runtime_offset,
                        runtime_offset: pointer.runtime_offset,
                        lib_ordinal: bind.lib_ordinal,
                        symbol_name: bind.symbol_name,
                        bind_type: opcodes::BIND_TYPE_POINTER,
                        addend: 0,
                        weak_import: bind.weak_import,
                        lazy: pointer.lazy,
                    };
                    handler(&event)
                },
            )?;
        }
        Ok(())
    }

    /// Walks the chained-fixups imports table in ordinal order
    pub fn for_each_chained_target(
        &self,
        mut handler: impl FnMut(u32, &ChainedImport<'a>) -> ControlFlow<()>,
    ) -> Result<()> {
        if let Some(chained) = self.chained_fixups()? {
            chained.for_each_import(&mut handler)?;
        }
        Ok(())
    }

    /// Looks `symbol` up in the export trie
    pub fn export_trie_find(&self, symbol: &str) -> Result<Option<exports::Export<'a>>> {
        self.export_trie()?.find(symbol)
    }

    /// Yields every initializer source in the image: the `LC_ROUTINES`
    /// entry, then init-pointer and init-offset sections in section order.
    pub fn for_each_initializer_source(
        &self,
        mut handler: impl FnMut(InitializerKind, &SectionInfo) -> ControlFlow<()>,
    ) -> Result<()> {
        if let Some(init_address) = self.routines {
            let placeholder = SectionInfo {
                segment_name: SEG_TEXT.to_owned(),
                name: String::new(),
                addr: init_address,
                size: 0,
                fileoff: 0,
                align: 0,
                flags: 0,
                reserved1: 0,
                reserved2: 0,
            };
            if handler(InitializerKind::Routine { init_address }, &placeholder).is_break() {
                return Ok(());
            }
        }
        for segment in &self.segments {
            for section in &segment.sections {
                let kind = match section.flags & SECTION_TYPE {
                    S_MOD_INIT_FUNC_POINTERS => InitializerKind::PointerSection,
                    S_INIT_FUNC_OFFSETS => InitializerKind::OffsetSection,
                    _ => continue,
                };
                if kind == InitializerKind::PointerSection && !segment.is_writable() {
                    return Err(Error::Malformed(format!(
                        "initializer pointer section {} in non-writable segment {}",
                        section.name, segment.name
                    )));
                }
                if handler(kind, section).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Yields every terminator section
    pub fn for_each_terminator_source(
        &self,
        mut handler: impl FnMut(&SectionInfo) -> ControlFlow<()>,
    ) -> Result<()> {
        for segment in &self.segments {
            for section in &segment.sections {
                if section.flags & SECTION_TYPE != S_MOD_TERM_FUNC_POINTERS {
                    continue;
                }
                if !segment.is_writable() {
                    return Err(Error::Malformed(format!(
                        "terminator section {} in non-writable segment {}",
                        section.name, segment.name
                    )));
                }
                if handler(section).is_break() {
                    return Ok(());
                }
            }
        }
        Ok(())
    }

    /// Whether the image has Objective-C metadata at all
    pub fn has_objc(&self) -> bool {
        self.section("__DATA", constants::SECT_OBJC_IMAGEINFO).is_some()
            || self.section("__DATA_CONST", constants::SECT_OBJC_IMAGEINFO).is_some()
    }

    /// Whether the image may have Objective-C `+load` methods, detected
    /// from the non-lazy class and category lists
    pub fn may_have_plus_load(&self) -> bool {
        for (seg, sect) in [
            ("__DATA", constants::SECT_OBJC_NLCLSLIST),
            ("__DATA_CONST", constants::SECT_OBJC_NLCLSLIST),
            ("__DATA", constants::SECT_OBJC_NLCATLIST),
            ("__DATA_CONST", constants::SECT_OBJC_NLCATLIST),
        ] {
            if let Some(section) = self.section(seg, sect) {
                if section.size > 0 {
                    return true;
                }
            }
        }
        false
    }

    /// Whether the image carries thread-local variables
    pub fn has_thread_locals(&self) -> bool {
        if self.header.flags & header::MH_HAS_TLV_DESCRIPTORS != 0 {
            return true;
        }
        let mut found = false;
        self.for_each_section(|section| {
            if section.flags & SECTION_TYPE == S_THREAD_LOCAL_VARIABLES && section.size > 0 {
                found = true;
                return ControlFlow::Break(());
            }
            ControlFlow::Continue(())
        });
        found
    }

    pub fn has_weak_defs(&self) -> bool {
        self.header.flags & header::MH_WEAK_DEFINES != 0
    }

    pub fn binds_to_weak(&self) -> bool {
        self.header.flags & header::MH_BINDS_TO_WEAK != 0
    }

    /// The cdHash of the embedded code signature, if the image has one
    pub fn cd_hash(&self) -> Result<Option<[u8; 20]>> {
        match &self.linkedit.code_signature {
            Some(sig) => {
                let blob = self.linkedit_slice(sig.dataoff, sig.datasize, "code signature")?;
                codesign::cd_hash(blob)
            }
            None => Ok(None),
        }
    }
}

/// Pulls the initial pc out of an `LC_UNIXTHREAD` register payload
fn thread_entry_pc(bytes: &[u8], offset: usize, cmdsize: u32, cputype: u32) -> Result<u64> {
    use scroll::Pread;
    // thread commands are flavor, count, then `count` registers
    let flavor: u32 = bytes.pread_with(offset + 8, scroll::LE)?;
    let count: u32 = bytes.pread_with(offset + 12, scroll::LE)?;
    let payload = offset + 16;
    if payload + count as usize * 4 > offset + cmdsize as usize {
        return Err(Error::Malformed(
            "LC_UNIXTHREAD register payload escapes its command".into(),
        ));
    }
    let pc_index = match (cputype, flavor) {
        (arch::CPU_TYPE_X86_64, load_command::X86_THREAD_STATE64) => 16usize, // rip
        (arch::CPU_TYPE_ARM64, load_command::ARM_THREAD_STATE64) => 32usize,  // pc
        _ => {
            return Err(Error::Malformed(format!(
                "unsupported LC_UNIXTHREAD flavor {} for cpu {}",
                flavor,
                arch::cputype_to_str(cputype)
            )));
        }
    };
    if (pc_index + 1) * 8 > count as usize * 4 {
        return Err(Error::Malformed(
            "LC_UNIXTHREAD register payload is too small for its flavor".into(),
        ));
    }
    Ok(bytes.pread_with(payload + pc_index * 8, scroll::LE)?)
}
