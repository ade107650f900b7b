//! The mach header: magic, cpu type, filetype, and the size of the load
//! command region that follows it. Everything the analyzer does starts with
//! getting this right.

use core::fmt;

use scroll::{Pread, Pwrite, SizeWith};

use crate::container::{self, Container};
use crate::error;

/// Mach Header magic constant
pub const MH_MAGIC: u32 = 0xfeed_face;
/// Mach Header magic constant, byte-swapped
pub const MH_CIGAM: u32 = 0xcefa_edfe;
/// Mach Header magic constant for 64-bit
pub const MH_MAGIC_64: u32 = 0xfeed_facf;
/// Mach Header magic constant for 64-bit, byte-swapped
pub const MH_CIGAM_64: u32 = 0xcffa_edfe;

// Constants for the filetype field of the mach_header
/// relocatable object file
pub const MH_OBJECT: u32 = 0x1;
/// demand paged executable file
pub const MH_EXECUTE: u32 = 0x2;
/// fixed VM shared library file
pub const MH_FVMLIB: u32 = 0x3;
/// core file
pub const MH_CORE: u32 = 0x4;
/// preloaded executable file
pub const MH_PRELOAD: u32 = 0x5;
/// dynamically bound shared library
pub const MH_DYLIB: u32 = 0x6;
/// dynamic link editor
pub const MH_DYLINKER: u32 = 0x7;
/// dynamically bound bundle file
pub const MH_BUNDLE: u32 = 0x8;
/// shared library stub for static linking only, no section contents
pub const MH_DYLIB_STUB: u32 = 0x9;
/// companion file with only debug sections
pub const MH_DSYM: u32 = 0xa;
/// x86_64 kexts
pub const MH_KEXT_BUNDLE: u32 = 0xb;

pub fn filetype_to_str(filetype: u32) -> &'static str {
    match filetype {
        MH_OBJECT => "OBJECT",
        MH_EXECUTE => "EXECUTE",
        MH_FVMLIB => "FVMLIB",
        MH_CORE => "CORE",
        MH_PRELOAD => "PRELOAD",
        MH_DYLIB => "DYLIB",
        MH_DYLINKER => "DYLINKER",
        MH_BUNDLE => "BUNDLE",
        MH_DYLIB_STUB => "DYLIB_STUB",
        MH_DSYM => "DSYM",
        MH_KEXT_BUNDLE => "KEXT_BUNDLE",
        _ => "UNKNOWN FILETYPE",
    }
}

// Constants for the flags field of the mach_header
/// the object file has no undefined references
pub const MH_NOUNDEFS: u32 = 0x1;
/// the object file is input for the dynamic linker and can't be staticly link edited again
pub const MH_DYLDLINK: u32 = 0x4;
/// the image is using two-level name space bindings
pub const MH_TWOLEVEL: u32 = 0x80;
/// the executable is forcing all images to use flat name space bindings
pub const MH_FORCE_FLAT: u32 = 0x100;
/// safe to divide up the sections into sub-sections via symbols for dead code stripping
pub const MH_SUBSECTIONS_VIA_SYMBOLS: u32 = 0x2000;
/// the final linked image contains external weak symbols
pub const MH_WEAK_DEFINES: u32 = 0x8000;
/// the final linked image uses weak symbols
pub const MH_BINDS_TO_WEAK: u32 = 0x10000;
/// When this bit is set, all stacks in the task will be given stack execution privilege.
/// Only used in MH_EXECUTE filetypes.
pub const MH_ALLOW_STACK_EXECUTION: u32 = 0x20000;
/// When this bit is set, the binary declares it is safe for use in processes with uid zero
pub const MH_ROOT_SAFE: u32 = 0x40000;
/// When this bit is set, the binary declares it is safe for use in processes when issetugid() is true
pub const MH_SETUID_SAFE: u32 = 0x80000;
/// When this bit is set, the OS will load the main executable at a random address.
/// Only used in MH_EXECUTE filetypes.
pub const MH_PIE: u32 = 0x200000;
/// Contains a section of type S_THREAD_LOCAL_VARIABLES
pub const MH_HAS_TLV_DESCRIPTORS: u32 = 0x800000;
/// The code was linked for use in an application extension.
pub const MH_APP_EXTENSION_SAFE: u32 = 0x2000000;
/// The external symbols listed in the nlist symbol table do not include all the
/// symbols listed in the dyld info
pub const MH_NLIST_OUTOFSYNC_WITH_DYLDINFO: u32 = 0x4000000;
/// Allow LC_MIN_VERSION_MACOS and LC_BUILD_VERSION load commands with the
/// platforms macOS, iOSMac, iOSSimulator, tvOSSimulator and watchOSSimulator
pub const MH_SIM_SUPPORT: u32 = 0x8000000;
/// Only for use on dylibs. When this bit is set, the dylib is part of the dyld
/// shared cache, rather than loose in the filesystem
pub const MH_DYLIB_IN_CACHE: u32 = 0x8000_0000;

#[repr(C)]
#[derive(Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// A 32-bit mach header
pub struct Header32 {
    /// mach magic number identifier
    pub magic: u32,
    /// cpu specifier
    pub cputype: u32,
    /// machine specifier
    pub cpusubtype: u32,
    /// type of file
    pub filetype: u32,
    /// number of load commands
    pub ncmds: u32,
    /// the size of all the load commands
    pub sizeofcmds: u32,
    /// flags
    pub flags: u32,
}

pub const SIZEOF_HEADER_32: usize = 0x1c;

#[repr(C)]
#[derive(Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// A 64-bit mach header
pub struct Header64 {
    /// mach magic number identifier
    pub magic: u32,
    /// cpu specifier
    pub cputype: u32,
    /// machine specifier
    pub cpusubtype: u32,
    /// type of file
    pub filetype: u32,
    /// number of load commands
    pub ncmds: u32,
    /// the size of all the load commands
    pub sizeofcmds: u32,
    /// flags
    pub flags: u32,
    /// reserved
    pub reserved: u32,
}

pub const SIZEOF_HEADER_64: usize = 0x20;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
/// A unified mach header, either 32 or 64-bit
pub struct Header {
    pub magic: u32,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub filetype: u32,
    pub ncmds: usize,
    pub sizeofcmds: u32,
    pub flags: u32,
    pub reserved: u32,
}

impl From<Header32> for Header {
    fn from(header: Header32) -> Self {
        Header {
            magic: header.magic,
            cputype: header.cputype,
            cpusubtype: header.cpusubtype,
            filetype: header.filetype,
            ncmds: header.ncmds as usize,
            sizeofcmds: header.sizeofcmds,
            flags: header.flags,
            reserved: 0,
        }
    }
}

impl From<Header64> for Header {
    fn from(header: Header64) -> Self {
        Header {
            magic: header.magic,
            cputype: header.cputype,
            cpusubtype: header.cpusubtype,
            filetype: header.filetype,
            ncmds: header.ncmds as usize,
            sizeofcmds: header.sizeofcmds,
            flags: header.flags,
            reserved: header.reserved,
        }
    }
}

impl fmt::Display for Header {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(
            fmt,
            "0x{:x} {} {} ncmds: {} sizeofcmds: {} flags: 0x{:x}",
            self.magic,
            super::arch::cputype_to_str(self.cputype),
            filetype_to_str(self.filetype),
            self.ncmds,
            self.sizeofcmds,
            self.flags
        )
    }
}

impl Header {
    /// The parsing context this header implies, or an error if the magic is
    /// not a known thin mach-o magic
    pub fn ctx(&self) -> error::Result<container::Ctx> {
        let (is64, le) = match self.magic {
            MH_MAGIC => (false, scroll::LE),
            MH_CIGAM => (false, scroll::BE),
            MH_MAGIC_64 => (true, scroll::LE),
            MH_CIGAM_64 => (true, scroll::BE),
            magic => return Err(error::Error::BadMagic(u64::from(magic))),
        };
        let container = if is64 {
            Container::Big
        } else {
            Container::Little
        };
        Ok(container::Ctx::new(container, le))
    }

    /// The byte size of this header on disk
    pub fn size(&self) -> usize {
        match self.magic {
            MH_MAGIC_64 | MH_CIGAM_64 => SIZEOF_HEADER_64,
            _ => SIZEOF_HEADER_32,
        }
    }

    /// Whether this image was linked into the dyld shared cache
    pub fn in_dyld_cache(&self) -> bool {
        self.filetype == MH_DYLIB && self.flags & MH_DYLIB_IN_CACHE != 0
    }

    /// Whether lookups in this image use the flat namespace
    pub fn is_flat_namespace(&self) -> bool {
        self.flags & MH_TWOLEVEL == 0 || self.flags & MH_FORCE_FLAT != 0
    }

    /// Parses a unified header from `bytes`, determining width and
    /// endianness from the magic
    pub fn parse(bytes: &[u8]) -> error::Result<Header> {
        let magic: u32 = bytes.pread_with(0, scroll::LE)?;
        let (le, is64) = match magic {
            MH_MAGIC => (scroll::LE, false),
            MH_CIGAM => (scroll::BE, false),
            MH_MAGIC_64 => (scroll::LE, true),
            MH_CIGAM_64 => (scroll::BE, true),
            magic => return Err(error::Error::BadMagic(u64::from(magic))),
        };
        let mut unified = if is64 {
            Header::from(bytes.pread_with::<Header64>(0, le)?)
        } else {
            Header::from(bytes.pread_with::<Header32>(0, le)?)
        };
        // a byte-swapped parse reads the magic swapped too; keep the raw value
        unified.magic = magic;
        Ok(unified)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_64bit_header() {
        let header = Header64 {
            magic: MH_MAGIC_64,
            cputype: crate::mach::arch::CPU_TYPE_ARM64,
            cpusubtype: 0,
            filetype: MH_EXECUTE,
            ncmds: 3,
            sizeofcmds: 0x200,
            flags: MH_PIE | MH_TWOLEVEL,
            reserved: 0,
        };
        let mut bytes = [0u8; SIZEOF_HEADER_64];
        bytes.pwrite_with(header, 0, scroll::LE).unwrap();
        let unified = Header::parse(&bytes).unwrap();
        assert_eq!(unified.filetype, MH_EXECUTE);
        assert_eq!(unified.ncmds, 3);
        assert!(unified.ctx().unwrap().is_big());
        assert_eq!(unified.size(), SIZEOF_HEADER_64);
        assert!(!unified.is_flat_namespace());
    }

    #[test]
    fn bad_magic_is_rejected() {
        let bytes = [0xde, 0xad, 0xbe, 0xef, 0, 0, 0, 0];
        assert!(matches!(
            Header::parse(&bytes),
            Err(crate::error::Error::BadMagic(_))
        ));
    }
}
