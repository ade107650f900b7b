//! Load commands tell the kernel and dynamic linker everything from how to
//! map this binary into memory, what the entry point is, to which libraries
//! it requires for dynamic linking.
//!
//! The raw structs mirror `mach-o/loader.h`; the walker rejects any command
//! whose size would escape the declared load-command region, and any string
//! that is not NUL-terminated inside its own command.

use core::fmt::{self, Display};

use scroll::{Endian, Pread, Pwrite, SizeWith};

use crate::container::Ctx;
use crate::error::{self, Error};
use crate::mach::header::Header;

///////////////////////////////////////
// Load Commands from mach-o/loader.h
// with some rusty additions
//////////////////////////////////////

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
/// Occurs at the beginning of every load command to serve as a sort of tagged
/// union/enum discriminant
pub struct LoadCommandHeader {
    pub cmd: u32,
    pub cmdsize: u32,
}

impl Display for LoadCommandHeader {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "LoadCommandHeader: {} size: {}",
            cmd_to_str(self.cmd),
            self.cmdsize
        )
    }
}

pub const SIZEOF_LOAD_COMMAND: usize = 8;

/// A load-command-relative offset of a NUL-terminated string
pub type LcStr = u32;

pub const SIZEOF_LC_STR: usize = 4;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct Section32 {
    /// name of this section
    pub sectname: [u8; 16],
    /// segment this section goes in
    pub segname: [u8; 16],
    /// memory address of this section
    pub addr: u32,
    /// size in bytes of this section
    pub size: u32,
    /// file offset of this section
    pub offset: u32,
    /// section alignment (power of 2)
    pub align: u32,
    /// file offset of relocation entries
    pub reloff: u32,
    /// number of relocation entries
    pub nreloc: u32,
    /// flags (section type and attributes)
    pub flags: u32,
    /// reserved (for offset or index)
    pub reserved1: u32,
    /// reserved (for count or sizeof)
    pub reserved2: u32,
}

pub const SIZEOF_SECTION_32: usize = 68;

/// for 64-bit architectures
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct Section64 {
    /// name of this section
    pub sectname: [u8; 16],
    /// segment this section goes in
    pub segname: [u8; 16],
    /// memory address of this section
    pub addr: u64,
    /// size in bytes of this section
    pub size: u64,
    /// file offset of this section
    pub offset: u32,
    /// section alignment (power of 2)
    pub align: u32,
    /// file offset of relocation entries
    pub reloff: u32,
    /// number of relocation entries
    pub nreloc: u32,
    /// flags (section type and attributes)
    pub flags: u32,
    /// reserved (for offset or index)
    pub reserved1: u32,
    /// reserved (for count or sizeof)
    pub reserved2: u32,
    /// reserved
    pub reserved3: u32,
}

pub const SIZEOF_SECTION_64: usize = 80;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand32 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u32,
    pub vmsize: u32,
    pub fileoff: u32,
    pub filesize: u32,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

pub const SIZEOF_SEGMENT_COMMAND_32: usize = 56;

impl SegmentCommand32 {
    pub fn name(&self) -> error::Result<&str> {
        Ok(self.segname.pread::<&str>(0)?)
    }
}

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SegmentCommand64 {
    pub cmd: u32,
    pub cmdsize: u32,
    pub segname: [u8; 16],
    pub vmaddr: u64,
    pub vmsize: u64,
    pub fileoff: u64,
    pub filesize: u64,
    pub maxprot: u32,
    pub initprot: u32,
    pub nsects: u32,
    pub flags: u32,
}

pub const SIZEOF_SEGMENT_COMMAND_64: usize = 72;

impl SegmentCommand64 {
    pub fn name(&self) -> error::Result<&str> {
        Ok(self.segname.pread::<&str>(0)?)
    }
}

/// Dynamically linked shared libraries are identified by two things.  The
/// pathname (the name of the library as found for execution), and the
/// compatibility version number.  The pathname must match and the compatibility
/// number in the user of the library must be greater than or equal to the
/// library being used.  The time stamp is used to record the time a library was
/// built and copied into user so it can be use to determined if the library used
/// at runtime is exactly the same as used to build the program.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct Dylib {
    /// library's path name
    pub name: LcStr,
    /// library's build time stamp
    pub timestamp: u32,
    /// library's current version number
    pub current_version: u32,
    /// library's compatibility vers number
    pub compatibility_version: u32,
}

pub const SIZEOF_DYLIB: usize = 16;

/// A dynamically linked shared library (filetype == MH_DYLIB in the mach
/// header) contains a dylib_command (cmd == LC_ID_DYLIB) to identify the
/// library.  An object that uses a dynamically linked shared library also
/// contains a dylib_command (cmd == LC_LOAD_DYLIB, LC_LOAD_WEAK_DYLIB, or
/// LC_REEXPORT_DYLIB) for each library it uses.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct DylibCommand {
    /// LC_ID_DYLIB, LC_LOAD_{,WEAK_}DYLIB, LC_REEXPORT_DYLIB, LC_LOAD_UPWARD_DYLIB
    pub cmd: u32,
    /// includes pathname string
    pub cmdsize: u32,
    /// the library identification
    pub dylib: Dylib,
}

pub const SIZEOF_DYLIB_COMMAND: usize = 24;

/// A program that uses a dynamic linker contains a dylinker_command to
/// identify the name of the dynamic linker (LC_LOAD_DYLINKER). And a dynamic
/// linker contains a dylinker_command to identify the dynamic linker
/// (LC_ID_DYLINKER). A file can have at most one of these.  This struct is
/// also used for the LC_DYLD_ENVIRONMENT load command and contains string for
/// dyld to treat like an environment variable.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct DylinkerCommand {
    /// LC_ID_DYLINKER, LC_LOAD_DYLINKER or LC_DYLD_ENVIRONMENT
    pub cmd: u32,
    /// includes pathname string
    pub cmdsize: u32,
    /// dynamic linker's path name
    pub name: LcStr,
}

pub const SIZEOF_DYLINKER_COMMAND: usize = 12;

/// The routines command contains the address of the dynamic shared library
/// initialization routine and an index into the module table for the module
/// that defines the routine.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct RoutinesCommand32 {
    /// LC_ROUTINES
    pub cmd: u32,
    /// total size of this command
    pub cmdsize: u32,
    /// address of initialization routine
    pub init_address: u32,
    /// index into the module table that the init routine is defined in
    pub init_module: u32,
    pub reserved1: u32,
    pub reserved2: u32,
    pub reserved3: u32,
    pub reserved4: u32,
    pub reserved5: u32,
    pub reserved6: u32,
}

/// The 64-bit routines command.  Same use as above.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct RoutinesCommand64 {
    /// LC_ROUTINES_64
    pub cmd: u32,
    /// total size of this command
    pub cmdsize: u32,
    /// address of initialization routine
    pub init_address: u64,
    /// index into the module table that the init routine is defined in
    pub init_module: u64,
    pub reserved1: u64,
    pub reserved2: u64,
    pub reserved3: u64,
    pub reserved4: u64,
    pub reserved5: u64,
    pub reserved6: u64,
}

/// The symtab_command contains the offsets and sizes of the link-edit 4.3BSD
/// "stab" style symbol table information as described in the header files
/// <nlist.h> and <stab.h>.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct SymtabCommand {
    /// LC_SYMTAB
    pub cmd: u32,
    /// sizeof(struct symtab_command)
    pub cmdsize: u32,
    /// symbol table offset
    pub symoff: u32,
    /// number of symbol table entries
    pub nsyms: u32,
    /// string table offset
    pub stroff: u32,
    /// string table size in bytes
    pub strsize: u32,
}

pub const SIZEOF_SYMTAB_COMMAND: usize = 24;

/// This is the second set of the symbolic information which is used to support
/// the data structures for the dynamically link editor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DysymtabCommand {
    /// LC_DYSYMTAB
    pub cmd: u32,
    /// sizeof(struct dysymtab_command)
    pub cmdsize: u32,
    /// index to local symbols
    pub ilocalsym: u32,
    /// number of local symbols
    pub nlocalsym: u32,
    /// index to externally defined symbols
    pub iextdefsym: u32,
    /// number of externally defined symbols
    pub nextdefsym: u32,
    /// index to undefined symbols
    pub iundefsym: u32,
    /// number of undefined symbols
    pub nundefsym: u32,
    /// file offset to table of contents
    pub tocoff: u32,
    /// number of entries in table of contents
    pub ntoc: u32,
    /// file offset to module table
    pub modtaboff: u32,
    /// number of module table entries
    pub nmodtab: u32,
    /// offset to referenced symbol table
    pub extrefsymoff: u32,
    /// number of referenced symbol table entries
    pub nextrefsyms: u32,
    /// file offset to the indirect symbol table
    pub indirectsymoff: u32,
    /// number of indirect symbol table entries
    pub nindirectsyms: u32,
    /// offset to external relocation entries
    pub extreloff: u32,
    /// number of external relocation entries
    pub nextrel: u32,
    /// offset to local relocation entries
    pub locreloff: u32,
    /// number of local relocation entries
    pub nlocrel: u32,
}

pub const SIZEOF_DYSYMTAB_COMMAND: usize = 80;

/// The uuid load command contains a single 128-bit unique random number that
/// identifies an object produced by the static link editor.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct UuidCommand {
    /// LC_UUID
    pub cmd: u32,
    /// sizeof(struct uuid_command)
    pub cmdsize: u32,
    /// 16 bytes the 128-bit uuid
    pub uuid: [u8; 16],
}

pub const SIZEOF_UUID_COMMAND: usize = 24;

/// The rpath_command contains a path which at runtime should be added to
/// the current run path used to find @rpath prefixed dylibs.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct RpathCommand {
    /// LC_RPATH
    pub cmd: u32,
    /// includes string
    pub cmdsize: u32,
    /// path to add to run path
    pub path: LcStr,
}

pub const SIZEOF_RPATH_COMMAND: usize = 12;

/// The linkedit_data_command contains the offsets and sizes of a blob
/// of data in the __LINKEDIT segment.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct LinkeditDataCommand {
    /// LC_CODE_SIGNATURE, LC_SEGMENT_SPLIT_INFO, LC_FUNCTION_STARTS,
    /// LC_DATA_IN_CODE, LC_DYLD_EXPORTS_TRIE or LC_DYLD_CHAINED_FIXUPS
    pub cmd: u32,
    /// sizeof(struct linkedit_data_command)
    pub cmdsize: u32,
    /// file offset of data in __LINKEDIT segment
    pub dataoff: u32,
    /// file size of data in __LINKEDIT segment
    pub datasize: u32,
}

pub const SIZEOF_LINKEDIT_DATA_COMMAND: usize = 16;

/// The version_min_command contains the min OS version on which this
/// binary was built to run.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct VersionMinCommand {
    /// LC_VERSION_MIN_MACOSX, LC_VERSION_MIN_IPHONEOS, LC_VERSION_MIN_TVOS
    /// or LC_VERSION_MIN_WATCHOS
    pub cmd: u32,
    pub cmdsize: u32,
    /// X.Y.Z is encoded in nibbles xxxx.yy.zz
    pub version: u32,
    /// X.Y.Z is encoded in nibbles xxxx.yy.zz
    pub sdk: u32,
}

pub const SIZEOF_VERSION_MIN_COMMAND: usize = 16;

/// The build_version_command contains the min OS version on which this
/// binary was built to run for its platform.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct BuildVersionCommand {
    /// LC_BUILD_VERSION
    pub cmd: u32,
    /// sizeof(struct build_version_command) plus ntools * sizeof(struct build_tool_version)
    pub cmdsize: u32,
    /// platform
    pub platform: u32,
    /// X.Y.Z is encoded in nibbles xxxx.yy.zz
    pub minos: u32,
    /// X.Y.Z is encoded in nibbles xxxx.yy.zz
    pub sdk: u32,
    /// number of tool entries following this
    pub ntools: u32,
}

pub const SIZEOF_BUILD_VERSION_COMMAND: usize = 24;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct BuildToolVersion {
    /// enum for the tool
    pub tool: u32,
    /// version number of the tool
    pub version: u32,
}

/// The source_version_command is an optional load command containing
/// the version of the sources used to build the binary.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct SourceVersionCommand {
    /// LC_SOURCE_VERSION
    pub cmd: u32,
    pub cmdsize: u32,
    /// A.B.C.D.E packed as a24.b10.c10.d10.e10
    pub version: u64,
}

/// The entry_point_command is a replacement for thread_command.
/// It is used for main executables to specify the location (file offset)
/// of main().  If -stack_size was used at link time, the stacksize
/// field will contain the stack size need for the main thread.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct EntryPointCommand {
    /// LC_MAIN, only used in MH_EXECUTE filetypes
    pub cmd: u32,
    /// 24
    pub cmdsize: u32,
    /// file (__TEXT) offset of main()
    pub entryoff: u64,
    /// if not zero, initial stack size
    pub stacksize: u64,
}

pub const SIZEOF_ENTRY_POINT_COMMAND: usize = 24;

/// Thread commands contain machine-specific data structures suitable for
/// use in the thread state primitives.  The machine specific data structures
/// follow the struct thread_command as follows.
/// Each flavor of machine specific data structure is preceded by an uint32_t
/// constant for the flavor of that data structure, an uint32_t that is the
/// count of uint32_t's of the size of the state data structure and then
/// the state data structure follows.
#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
pub struct ThreadCommand {
    /// LC_THREAD or LC_UNIXTHREAD
    pub cmd: u32,
    /// total size of this command
    pub cmdsize: u32,
    /// flavor of thread state
    pub flavor: u32,
    /// count of uint32_t's in thread state
    pub count: u32,
}

pub const X86_THREAD_STATE64: u32 = 4;
pub const ARM_THREAD_STATE64: u32 = 6;

/// The dyld_info_command contains the file offsets and sizes of
/// the new compressed form of the information dyld needs to
/// load the image.  This information is used by dyld on Mac OS X
/// 10.6 and later.  All information pointed to by this command
/// is encoded using byte streams, so no endian swapping is needed
/// to interpret it.
#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
pub struct DyldInfoCommand {
    /// LC_DYLD_INFO or LC_DYLD_INFO_ONLY
    pub cmd: u32,
    /// sizeof(struct dyld_info_command)
    pub cmdsize: u32,
    /// file offset to rebase info
    pub rebase_off: u32,
    /// size of rebase info
    pub rebase_size: u32,
    /// file offset to binding info
    pub bind_off: u32,
    /// size of binding info
    pub bind_size: u32,
    /// file offset to weak binding info
    pub weak_bind_off: u32,
    /// size of weak binding info
    pub weak_bind_size: u32,
    /// file offset to lazy binding info
    pub lazy_bind_off: u32,
    /// size of lazy binding info
    pub lazy_bind_size: u32,
    /// file offset to export trie
    pub export_off: u32,
    /// size of export trie
    pub export_size: u32,
}

pub const SIZEOF_DYLD_INFO_COMMAND: usize = 48;

// Constants for the cmd field of all load commands, the type
/// After MacOS X 10.1 when a new load command is added that is required to be
/// understood by the dynamic linker for the image to execute properly the
/// LC_REQ_DYLD bit will be or'ed into the load command constant.
pub const LC_REQ_DYLD: u32 = 0x8000_0000;

/// segment of this file to be mapped
pub const LC_SEGMENT: u32 = 0x1;
/// link-edit stab symbol table info
pub const LC_SYMTAB: u32 = 0x2;
/// thread
pub const LC_THREAD: u32 = 0x4;
/// unix thread (includes a stack)
pub const LC_UNIXTHREAD: u32 = 0x5;
/// dynamic link-edit symbol table info
pub const LC_DYSYMTAB: u32 = 0xb;
/// load a dynamically linked shared library
pub const LC_LOAD_DYLIB: u32 = 0xc;
/// dynamically linked shared lib ident
pub const LC_ID_DYLIB: u32 = 0xd;
/// load a dynamic linker
pub const LC_LOAD_DYLINKER: u32 = 0xe;
/// dynamic linker identification
pub const LC_ID_DYLINKER: u32 = 0xf;
/// image routines
pub const LC_ROUTINES: u32 = 0x11;
/// sub umbrella
pub const LC_SUB_UMBRELLA: u32 = 0x13;
/// two-level namespace lookup hints
pub const LC_TWOLEVEL_HINTS: u32 = 0x16;
/// load a dynamically linked shared library that is allowed to be missing
pub const LC_LOAD_WEAK_DYLIB: u32 = 0x18 | LC_REQ_DYLD;
/// 64-bit segment of this file to be mapped
pub const LC_SEGMENT_64: u32 = 0x19;
/// 64-bit image routines
pub const LC_ROUTINES_64: u32 = 0x1a;
/// the uuid
pub const LC_UUID: u32 = 0x1b;
/// runpath additions
pub const LC_RPATH: u32 = 0x1c | LC_REQ_DYLD;
/// local of code signature
pub const LC_CODE_SIGNATURE: u32 = 0x1d;
/// local of info to split segments
pub const LC_SEGMENT_SPLIT_INFO: u32 = 0x1e;
/// load and re-export dylib
pub const LC_REEXPORT_DYLIB: u32 = 0x1f | LC_REQ_DYLD;
/// delay load of dylib until first use
pub const LC_LAZY_LOAD_DYLIB: u32 = 0x20;
/// encrypted segment information
pub const LC_ENCRYPTION_INFO: u32 = 0x21;
/// compressed dyld information
pub const LC_DYLD_INFO: u32 = 0x22;
/// compressed dyld information only
pub const LC_DYLD_INFO_ONLY: u32 = 0x22 | LC_REQ_DYLD;
/// load upward dylib
pub const LC_LOAD_UPWARD_DYLIB: u32 = 0x23 | LC_REQ_DYLD;
/// build for MacOSX min OS version
pub const LC_VERSION_MIN_MACOSX: u32 = 0x24;
/// build for iPhoneOS min OS version
pub const LC_VERSION_MIN_IPHONEOS: u32 = 0x25;
/// compressed table of function start addresses
pub const LC_FUNCTION_STARTS: u32 = 0x26;
/// string for dyld to treat like environment variable
pub const LC_DYLD_ENVIRONMENT: u32 = 0x27;
/// replacement for LC_UNIXTHREAD
pub const LC_MAIN: u32 = 0x28 | LC_REQ_DYLD;
/// table of non-instructions in __text
pub const LC_DATA_IN_CODE: u32 = 0x29;
/// source version used to build binary
pub const LC_SOURCE_VERSION: u32 = 0x2a;
/// Code signing DRs copied from linked dylibs
pub const LC_DYLIB_CODE_SIGN_DRS: u32 = 0x2b;
/// 64-bit encrypted segment information
pub const LC_ENCRYPTION_INFO_64: u32 = 0x2c;
/// linker options in MH_OBJECT files
pub const LC_LINKER_OPTION: u32 = 0x2d;
/// optimization hints in MH_OBJECT files
pub const LC_LINKER_OPTIMIZATION_HINT: u32 = 0x2e;
/// build for AppleTV min OS version
pub const LC_VERSION_MIN_TVOS: u32 = 0x2f;
/// build for Watch min OS version
pub const LC_VERSION_MIN_WATCHOS: u32 = 0x30;
/// arbitrary data included within a Mach-O file
pub const LC_NOTE: u32 = 0x31;
/// build for platform min OS version
pub const LC_BUILD_VERSION: u32 = 0x32;
/// used with linkedit_data_command, payload is trie
pub const LC_DYLD_EXPORTS_TRIE: u32 = 0x33 | LC_REQ_DYLD;
/// used with linkedit_data_command
pub const LC_DYLD_CHAINED_FIXUPS: u32 = 0x34 | LC_REQ_DYLD;
/// used with fileset_entry_command
pub const LC_FILESET_ENTRY: u32 = 0x35 | LC_REQ_DYLD;

pub fn cmd_to_str(cmd: u32) -> &'static str {
    match cmd {
        LC_SEGMENT => "LC_SEGMENT",
        LC_SYMTAB => "LC_SYMTAB",
        LC_THREAD => "LC_THREAD",
        LC_UNIXTHREAD => "LC_UNIXTHREAD",
        LC_DYSYMTAB => "LC_DYSYMTAB",
        LC_LOAD_DYLIB => "LC_LOAD_DYLIB",
        LC_ID_DYLIB => "LC_ID_DYLIB",
        LC_LOAD_DYLINKER => "LC_LOAD_DYLINKER",
        LC_ID_DYLINKER => "LC_ID_DYLINKER",
        LC_ROUTINES => "LC_ROUTINES",
        LC_TWOLEVEL_HINTS => "LC_TWOLEVEL_HINTS",
        LC_LOAD_WEAK_DYLIB => "LC_LOAD_WEAK_DYLIB",
        LC_SEGMENT_64 => "LC_SEGMENT_64",
        LC_ROUTINES_64 => "LC_ROUTINES_64",
        LC_UUID => "LC_UUID",
        LC_RPATH => "LC_RPATH",
        LC_CODE_SIGNATURE => "LC_CODE_SIGNATURE",
        LC_SEGMENT_SPLIT_INFO => "LC_SEGMENT_SPLIT_INFO",
        LC_REEXPORT_DYLIB => "LC_REEXPORT_DYLIB",
        LC_LAZY_LOAD_DYLIB => "LC_LAZY_LOAD_DYLIB",
        LC_ENCRYPTION_INFO => "LC_ENCRYPTION_INFO",
        LC_DYLD_INFO => "LC_DYLD_INFO",
        LC_DYLD_INFO_ONLY => "LC_DYLD_INFO_ONLY",
        LC_LOAD_UPWARD_DYLIB => "LC_LOAD_UPWARD_DYLIB",
        LC_VERSION_MIN_MACOSX => "LC_VERSION_MIN_MACOSX",
        LC_VERSION_MIN_IPHONEOS => "LC_VERSION_MIN_IPHONEOS",
        LC_FUNCTION_STARTS => "LC_FUNCTION_STARTS",
        LC_DYLD_ENVIRONMENT => "LC_DYLD_ENVIRONMENT",
        LC_MAIN => "LC_MAIN",
        LC_DATA_IN_CODE => "LC_DATA_IN_CODE",
        LC_SOURCE_VERSION => "LC_SOURCE_VERSION",
        LC_DYLIB_CODE_SIGN_DRS => "LC_DYLIB_CODE_SIGN_DRS",
        LC_ENCRYPTION_INFO_64 => "LC_ENCRYPTION_INFO_64",
        LC_LINKER_OPTION => "LC_LINKER_OPTION",
        LC_LINKER_OPTIMIZATION_HINT => "LC_LINKER_OPTIMIZATION_HINT",
        LC_VERSION_MIN_TVOS => "LC_VERSION_MIN_TVOS",
        LC_VERSION_MIN_WATCHOS => "LC_VERSION_MIN_WATCHOS",
        LC_NOTE => "LC_NOTE",
        LC_BUILD_VERSION => "LC_BUILD_VERSION",
        LC_DYLD_EXPORTS_TRIE => "LC_DYLD_EXPORTS_TRIE",
        LC_DYLD_CHAINED_FIXUPS => "LC_DYLD_CHAINED_FIXUPS",
        LC_FILESET_ENTRY => "LC_FILESET_ENTRY",
        _ => "LC_UNKNOWN",
    }
}

///////////////////////////////////////////
// Typesafe command variants
///////////////////////////////////////////

#[derive(Debug)]
#[allow(clippy::large_enum_variant)]
/// The various load commands as a cast-free variant/enum
pub enum CommandVariant {
    Segment32(SegmentCommand32),
    Segment64(SegmentCommand64),
    Symtab(SymtabCommand),
    Dysymtab(DysymtabCommand),
    LoadDylib(DylibCommand),
    LoadWeakDylib(DylibCommand),
    ReexportDylib(DylibCommand),
    LoadUpwardDylib(DylibCommand),
    LazyLoadDylib(DylibCommand),
    IdDylib(DylibCommand),
    LoadDylinker(DylinkerCommand),
    IdDylinker(DylinkerCommand),
    DyldEnvironment(DylinkerCommand),
    Routines32(RoutinesCommand32),
    Routines64(RoutinesCommand64),
    Uuid(UuidCommand),
    Rpath(RpathCommand),
    CodeSignature(LinkeditDataCommand),
    SegmentSplitInfo(LinkeditDataCommand),
    FunctionStarts(LinkeditDataCommand),
    DataInCode(LinkeditDataCommand),
    DyldExportsTrie(LinkeditDataCommand),
    DyldChainedFixups(LinkeditDataCommand),
    DyldInfo(DyldInfoCommand),
    DyldInfoOnly(DyldInfoCommand),
    VersionMinMacosx(VersionMinCommand),
    VersionMinIphoneos(VersionMinCommand),
    VersionMinTvos(VersionMinCommand),
    VersionMinWatchos(VersionMinCommand),
    BuildVersion(BuildVersionCommand),
    SourceVersion(SourceVersionCommand),
    Main(EntryPointCommand),
    Thread(ThreadCommand),
    Unixthread(ThreadCommand),
    Unimplemented(LoadCommandHeader),
}

impl CommandVariant {
    pub fn parse(bytes: &[u8], offset: usize, le: Endian) -> error::Result<CommandVariant> {
        use self::CommandVariant::*;
        let lc: LoadCommandHeader = bytes.pread_with(offset, le)?;
        let size = lc.cmdsize as usize;
        if size < SIZEOF_LOAD_COMMAND {
            return Err(Error::Malformed(format!(
                "{} has size smaller than a load command header",
                cmd_to_str(lc.cmd)
            )));
        }
        if offset
            .checked_add(size)
            .map(|end| end > bytes.len())
            .unwrap_or(true)
        {
            return Err(Error::Malformed(format!(
                "{} of size {} stretches beyond the load command region",
                cmd_to_str(lc.cmd),
                size
            )));
        }
        let body = &bytes[offset..offset + size];
        let command = match lc.cmd {
            LC_SEGMENT => Segment32(body.pread_with(0, le)?),
            LC_SEGMENT_64 => Segment64(body.pread_with(0, le)?),
            LC_SYMTAB => Symtab(body.pread_with(0, le)?),
            LC_DYSYMTAB => Dysymtab(body.pread_with(0, le)?),
            LC_LOAD_DYLIB => LoadDylib(body.pread_with(0, le)?),
            LC_LOAD_WEAK_DYLIB => LoadWeakDylib(body.pread_with(0, le)?),
            LC_REEXPORT_DYLIB => ReexportDylib(body.pread_with(0, le)?),
            LC_LOAD_UPWARD_DYLIB => LoadUpwardDylib(body.pread_with(0, le)?),
            LC_LAZY_LOAD_DYLIB => LazyLoadDylib(body.pread_with(0, le)?),
            LC_ID_DYLIB => IdDylib(body.pread_with(0, le)?),
            LC_LOAD_DYLINKER => LoadDylinker(body.pread_with(0, le)?),
            LC_ID_DYLINKER => IdDylinker(body.pread_with(0, le)?),
            LC_DYLD_ENVIRONMENT => DyldEnvironment(body.pread_with(0, le)?),
            LC_ROUTINES => Routines32(body.pread_with(0, le)?),
            LC_ROUTINES_64 => Routines64(body.pread_with(0, le)?),
            LC_UUID => Uuid(body.pread_with(0, le)?),
            LC_RPATH => Rpath(body.pread_with(0, le)?),
            LC_CODE_SIGNATURE => CodeSignature(body.pread_with(0, le)?),
            LC_SEGMENT_SPLIT_INFO => SegmentSplitInfo(body.pread_with(0, le)?),
            LC_FUNCTION_STARTS => FunctionStarts(body.pread_with(0, le)?),
            LC_DATA_IN_CODE => DataInCode(body.pread_with(0, le)?),
            LC_DYLD_EXPORTS_TRIE => DyldExportsTrie(body.pread_with(0, le)?),
            LC_DYLD_CHAINED_FIXUPS => DyldChainedFixups(body.pread_with(0, le)?),
            LC_DYLD_INFO => DyldInfo(body.pread_with(0, le)?),
            LC_DYLD_INFO_ONLY => DyldInfoOnly(body.pread_with(0, le)?),
            LC_VERSION_MIN_MACOSX => VersionMinMacosx(body.pread_with(0, le)?),
            LC_VERSION_MIN_IPHONEOS => VersionMinIphoneos(body.pread_with(0, le)?),
            LC_VERSION_MIN_TVOS => VersionMinTvos(body.pread_with(0, le)?),
            LC_VERSION_MIN_WATCHOS => VersionMinWatchos(body.pread_with(0, le)?),
            LC_BUILD_VERSION => BuildVersion(body.pread_with(0, le)?),
            LC_SOURCE_VERSION => SourceVersion(body.pread_with(0, le)?),
            LC_MAIN => Main(body.pread_with(0, le)?),
            LC_THREAD => Thread(body.pread_with(0, le)?),
            LC_UNIXTHREAD => Unixthread(body.pread_with(0, le)?),
            _ => Unimplemented(lc),
        };
        Ok(command)
    }

    pub fn cmdsize(&self) -> usize {
        use self::CommandVariant::*;
        let cmdsize = match self {
            Segment32(comm) => comm.cmdsize,
            Segment64(comm) => comm.cmdsize,
            Symtab(comm) => comm.cmdsize,
            Dysymtab(comm) => comm.cmdsize,
            LoadDylib(comm) | LoadWeakDylib(comm) | ReexportDylib(comm)
            | LoadUpwardDylib(comm) | LazyLoadDylib(comm) | IdDylib(comm) => comm.cmdsize,
            LoadDylinker(comm) | IdDylinker(comm) | DyldEnvironment(comm) => comm.cmdsize,
            Routines32(comm) => comm.cmdsize,
            Routines64(comm) => comm.cmdsize,
            Uuid(comm) => comm.cmdsize,
            Rpath(comm) => comm.cmdsize,
            CodeSignature(comm) | SegmentSplitInfo(comm) | FunctionStarts(comm)
            | DataInCode(comm) | DyldExportsTrie(comm) | DyldChainedFixups(comm) => comm.cmdsize,
            DyldInfo(comm) | DyldInfoOnly(comm) => comm.cmdsize,
            VersionMinMacosx(comm) | VersionMinIphoneos(comm) | VersionMinTvos(comm)
            | VersionMinWatchos(comm) => comm.cmdsize,
            BuildVersion(comm) => comm.cmdsize,
            SourceVersion(comm) => comm.cmdsize,
            Main(comm) => comm.cmdsize,
            Thread(comm) | Unixthread(comm) => comm.cmdsize,
            Unimplemented(lc) => lc.cmdsize,
        };
        cmdsize as usize
    }

    pub fn cmd(&self) -> u32 {
        use self::CommandVariant::*;
        match self {
            Segment32(comm) => comm.cmd,
            Segment64(comm) => comm.cmd,
            Symtab(comm) => comm.cmd,
            Dysymtab(comm) => comm.cmd,
            LoadDylib(comm) | LoadWeakDylib(comm) | ReexportDylib(comm)
            | LoadUpwardDylib(comm) | LazyLoadDylib(comm) | IdDylib(comm) => comm.cmd,
            LoadDylinker(comm) | IdDylinker(comm) | DyldEnvironment(comm) => comm.cmd,
            Routines32(comm) => comm.cmd,
            Routines64(comm) => comm.cmd,
            Uuid(comm) => comm.cmd,
            Rpath(comm) => comm.cmd,
            CodeSignature(comm) | SegmentSplitInfo(comm) | FunctionStarts(comm)
            | DataInCode(comm) | DyldExportsTrie(comm) | DyldChainedFixups(comm) => comm.cmd,
            DyldInfo(comm) | DyldInfoOnly(comm) => comm.cmd,
            VersionMinMacosx(comm) | VersionMinIphoneos(comm) | VersionMinTvos(comm)
            | VersionMinWatchos(comm) => comm.cmd,
            BuildVersion(comm) => comm.cmd,
            SourceVersion(comm) => comm.cmd,
            Main(comm) => comm.cmd,
            Thread(comm) | Unixthread(comm) => comm.cmd,
            Unimplemented(lc) => lc.cmd,
        }
    }
}

#[derive(Debug)]
/// A tagged LoadCommand, with the load command's offset in the binary
pub struct LoadCommand {
    /// The offset this load command occurs at
    pub offset: usize,
    /// Which load command this is
    pub command: CommandVariant,
}

impl LoadCommand {
    /// Parses a load command from `bytes` at `offset` with the `le` endianness
    pub fn parse(bytes: &[u8], offset: &mut usize, le: Endian) -> error::Result<Self> {
        let start = *offset;
        let command = CommandVariant::parse(bytes, start, le)?;
        *offset = start + command.cmdsize();
        Ok(LoadCommand {
            offset: start,
            command,
        })
    }
}

/// Reads the NUL-terminated string a load-command-relative `LcStr` refers
/// to; the NUL must fall inside the command itself.
pub fn lc_str<'a>(
    bytes: &'a [u8],
    cmd_offset: usize,
    cmdsize: u32,
    lcstr: LcStr,
) -> error::Result<&'a str> {
    let start = lcstr as usize;
    let size = cmdsize as usize;
    if start >= size {
        return Err(Error::Malformed(format!(
            "load command string offset {:#x} is outside its command (size {:#x})",
            start, size
        )));
    }
    let cmd_end = cmd_offset
        .checked_add(size)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| Error::Malformed("load command escapes the file".into()))?;
    let body = &bytes[cmd_offset + start..cmd_end];
    let nul = body
        .iter()
        .position(|&b| b == 0)
        .ok_or_else(|| {
            Error::Malformed("load command string is not NUL-terminated inside its command".into())
        })?;
    core::str::from_utf8(&body[..nul])
        .map_err(|_| Error::Malformed("load command string is not valid utf-8".into()))
}

/// Walks the load-command region declared by `header`, enforcing that every
/// command fits. `bytes` is the whole image; commands start right after the
/// header.
pub fn walk<'a>(
    bytes: &'a [u8],
    header: &Header,
    ctx: Ctx,
) -> error::Result<Vec<LoadCommand>> {
    let region_start = header.size();
    let region_size = header.sizeofcmds as usize;
    let region_end = region_start
        .checked_add(region_size)
        .filter(|&end| end <= bytes.len())
        .ok_or_else(|| {
            Error::Malformed("load command region stretches beyond the end of the file".into())
        })?;
    let alignment = if ctx.is_big() { 8 } else { 4 };
    let mut cmds = Vec::with_capacity(header.ncmds);
    let mut offset = region_start;
    for i in 0..header.ncmds {
        if offset + SIZEOF_LOAD_COMMAND > region_end {
            return Err(Error::Malformed(format!(
                "load command #{} starts beyond the declared sizeofcmds",
                i
            )));
        }
        let cmd = LoadCommand::parse(&bytes[..region_end], &mut offset, ctx.le)?;
        if cmd.command.cmdsize() % alignment != 0 {
            return Err(Error::Malformed(format!(
                "load command #{} ({}) size {:#x} is not a multiple of {}",
                i,
                cmd_to_str(cmd.command.cmd()),
                cmd.command.cmdsize(),
                alignment
            )));
        }
        if offset > region_end {
            return Err(Error::Malformed(format!(
                "load command #{} ({}) stretches beyond the declared sizeofcmds",
                i,
                cmd_to_str(cmd.command.cmd())
            )));
        }
        cmds.push(cmd);
    }
    Ok(cmds)
}
