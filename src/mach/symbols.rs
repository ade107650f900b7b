//! "Nlist" style symbols in this binary - beware, like most symbol tables in
//! most binary formats, they are strippable, and should not be relied upon;
//! see the export trie for something more permanent. The linker still needs
//! them for classic external relocations and the indirect symbol table.

use core::fmt::{self, Debug};

use scroll::ctx::SizeWith;
use scroll::{ctx, Pread, Pwrite, SizeWith};

use crate::container;
use crate::error;
use crate::mach::load_command;

// Symbol masks for the n_type field
/// if any of these bits set, a symbolic debugging entry
pub const N_STAB: u8 = 0xe0;
/// private external symbol bit
pub const N_PEXT: u8 = 0x10;
/// mask for the type bits
pub const N_TYPE: u8 = 0x0e;
/// external symbol bit, set for external symbols
pub const N_EXT: u8 = 0x01;

// Values of n_type & N_TYPE
/// undefined, n_sect == NO_SECT
pub const N_UNDF: u8 = 0x0;
/// absolute, n_sect == NO_SECT
pub const N_ABS: u8 = 0x2;
/// defined in section number n_sect
pub const N_SECT: u8 = 0xe;
/// prebound undefined (defined in a dylib)
pub const N_PBUD: u8 = 0xc;
/// indirect
pub const N_INDR: u8 = 0xa;

// n_desc bits
/// symbol is weakly referenced
pub const N_WEAK_REF: u16 = 0x0040;
/// coalesced symbol is a weak definition
pub const N_WEAK_DEF: u16 = 0x0080;
/// reference to a weak symbol
pub const N_REF_TO_WEAK: u16 = 0x0080;
/// symbol is a stub-and-resolver entry
pub const N_SYMBOL_RESOLVER: u16 = 0x0100;

pub const NO_SECT: u8 = 0;

/// The library ordinal a two-level-namespace undefined symbol was linked
/// against, from the high byte of `n_desc`
#[inline]
pub fn library_ordinal(n_desc: u16) -> u8 {
    ((n_desc >> 8) & 0xff) as u8
}

/// ordinal meaning "look this symbol up in the image itself"
pub const SELF_LIBRARY_ORDINAL: u8 = 0x0;
/// ordinal meaning "look this symbol up in the main executable"
pub const EXECUTABLE_ORDINAL: u8 = 0xff;
/// ordinal meaning "flat namespace lookup"
pub const DYNAMIC_LOOKUP_ORDINAL: u8 = 0xfe;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pread, Pwrite, SizeWith)]
pub struct Nlist32 {
    /// index into the string table
    pub n_strx: u32,
    /// type flag, see below
    pub n_type: u8,
    /// section number or NO_SECT
    pub n_sect: u8,
    /// see <mach-o/stab.h>
    pub n_desc: u16,
    /// value of this symbol (or stab offset)
    pub n_value: u32,
}

pub const SIZEOF_NLIST_32: usize = 12;

#[repr(C)]
#[derive(Clone, Copy, Debug, Pread, Pwrite, SizeWith)]
pub struct Nlist64 {
    /// index into the string table
    pub n_strx: u32,
    /// type flag, see below
    pub n_type: u8,
    /// section number or NO_SECT
    pub n_sect: u8,
    /// see <mach-o/stab.h>
    pub n_desc: u16,
    /// value of this symbol (or stab offset)
    pub n_value: u64,
}

pub const SIZEOF_NLIST_64: usize = 16;

#[derive(Debug, Clone)]
/// A width-unified nlist entry
pub struct Nlist {
    /// index into the string table
    pub n_strx: usize,
    /// type flag
    pub n_type: u8,
    /// section number or NO_SECT
    pub n_sect: usize,
    /// flags and the two-level library ordinal
    pub n_desc: u16,
    /// value of this symbol (or stab offset)
    pub n_value: u64,
}

impl Nlist {
    /// Whether this entry is a debugging stab
    pub fn is_stab(&self) -> bool {
        self.n_type & N_STAB != 0
    }
    /// Whether this symbol is undefined (to be supplied by another image)
    pub fn is_undefined(&self) -> bool {
        !self.is_stab() && self.n_type & N_TYPE == N_UNDF
    }
    /// Whether this symbol is defined in a section of this image
    pub fn is_defined_in_section(&self) -> bool {
        !self.is_stab() && self.n_type & N_TYPE == N_SECT
    }
    /// Whether this symbol is an absolute constant
    pub fn is_absolute(&self) -> bool {
        !self.is_stab() && self.n_type & N_TYPE == N_ABS
    }
    pub fn is_weak_def(&self) -> bool {
        self.n_desc & N_WEAK_DEF != 0
    }
    pub fn is_weak_ref(&self) -> bool {
        self.n_desc & N_WEAK_REF != 0
    }
}

impl From<Nlist32> for Nlist {
    fn from(nlist: Nlist32) -> Self {
        Nlist {
            n_strx: nlist.n_strx as usize,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect as usize,
            n_desc: nlist.n_desc,
            n_value: u64::from(nlist.n_value),
        }
    }
}

impl From<Nlist64> for Nlist {
    fn from(nlist: Nlist64) -> Self {
        Nlist {
            n_strx: nlist.n_strx as usize,
            n_type: nlist.n_type,
            n_sect: nlist.n_sect as usize,
            n_desc: nlist.n_desc,
            n_value: nlist.n_value,
        }
    }
}

impl ctx::SizeWith<container::Ctx> for Nlist {
    fn size_with(ctx: &container::Ctx) -> usize {
        if ctx.is_big() {
            SIZEOF_NLIST_64
        } else {
            SIZEOF_NLIST_32
        }
    }
}

impl<'a> ctx::TryFromCtx<'a, container::Ctx> for Nlist {
    type Error = scroll::Error;
    fn try_from_ctx(bytes: &'a [u8], ctx: container::Ctx) -> Result<(Self, usize), Self::Error> {
        if ctx.is_big() {
            let nlist = bytes.pread_with::<Nlist64>(0, ctx.le)?;
            Ok((nlist.into(), SIZEOF_NLIST_64))
        } else {
            let nlist = bytes.pread_with::<Nlist32>(0, ctx.le)?;
            Ok((nlist.into(), SIZEOF_NLIST_32))
        }
    }
}

/// A zero-copy "nlist" style symbol table, including the string table
pub struct Symbols<'a> {
    data: &'a [u8],
    start: usize,
    nsyms: usize,
    strtab: usize,
    strtab_size: usize,
    ctx: container::Ctx,
}

impl<'a> Symbols<'a> {
    pub fn parse(
        bytes: &'a [u8],
        symtab: &load_command::SymtabCommand,
        ctx: container::Ctx,
    ) -> error::Result<Symbols<'a>> {
        let nsyms = symtab.nsyms as usize;
        let start = symtab.symoff as usize;
        let table_size = nsyms
            .checked_mul(Nlist::size_with(&ctx))
            .ok_or_else(|| error::Error::Malformed("symbol count overflows".into()))?;
        if start.checked_add(table_size).map(|end| end > bytes.len()).unwrap_or(true) {
            return Err(error::Error::Malformed(format!(
                "symbol table {:#x}..+{:#x} is outside the file",
                start, table_size
            )));
        }
        Ok(Symbols {
            data: bytes,
            start,
            nsyms,
            strtab: symtab.stroff as usize,
            strtab_size: symtab.strsize as usize,
            ctx,
        })
    }

    /// How many symbols are in this table
    pub fn len(&self) -> usize {
        self.nsyms
    }

    pub fn is_empty(&self) -> bool {
        self.nsyms == 0
    }

    /// Parses a single nlist entry from the table, with its accompanying name
    pub fn get(&self, index: usize) -> error::Result<(&'a str, Nlist)> {
        if index >= self.nsyms {
            return Err(error::Error::Malformed(format!(
                "symbol index {} is beyond the {} entry symbol table",
                index, self.nsyms
            )));
        }
        let sym: Nlist = self
            .data
            .pread_with(self.start + index * Nlist::size_with(&self.ctx), self.ctx)?;
        if sym.n_strx >= self.strtab_size {
            return Err(error::Error::Malformed(format!(
                "symbol #{} has a string offset {:#x} beyond the string pool",
                index, sym.n_strx
            )));
        }
        let name = self.data.pread::<&str>(self.strtab + sym.n_strx)?;
        Ok((name, sym))
    }
}

impl<'a> Debug for Symbols<'a> {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        writeln!(fmt, "Symbols: {{")?;
        for i in 0..self.nsyms {
            match self.get(i) {
                Ok((name, nlist)) => writeln!(
                    fmt,
                    "{: >10x} {} sect: {:#x} type: {:#02x} desc: {:#03x}",
                    nlist.n_value, name, nlist.n_sect, nlist.n_type, nlist.n_desc
                )?,
                Err(error) => writeln!(fmt, "  Bad symbol, index: {}, sym: {:?}", i, error)?,
            }
        }
        writeln!(fmt, "}}")
    }
}
