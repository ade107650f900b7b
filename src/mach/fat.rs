//! A Mach-o fat binary is a multi-architecture binary container. The fat
//! header and arch records are always big-endian. The linker's only use for
//! one is picking the best slice for the current process.

use core::fmt;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{self, Error};
use crate::mach::arch::{self, GradedArchs};

pub const FAT_MAGIC: u32 = 0xcafe_babe;
pub const FAT_CIGAM: u32 = 0xbeba_feca;

#[repr(C)]
#[derive(Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// The Mach-o `FatHeader` always has its data bigendian
pub struct FatHeader {
    /// The magic number, `cafebabe`
    pub magic: u32,
    /// How many fat architecture headers there are
    pub nfat_arch: u32,
}

pub const SIZEOF_FAT_HEADER: usize = 8;

impl fmt::Debug for FatHeader {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("FatHeader")
            .field("magic", &format_args!("{:#x}", self.magic))
            .field("nfat_arch", &self.nfat_arch)
            .finish()
    }
}

#[repr(C)]
#[derive(Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// The Mach-o `FatArch` always has its data bigendian
pub struct FatArch {
    /// What kind of CPU this binary is
    pub cputype: u32,
    pub cpusubtype: u32,
    /// Where in the fat binary it starts
    pub offset: u32,
    /// How big the binary is
    pub size: u32,
    pub align: u32,
}

pub const SIZEOF_FAT_ARCH: usize = 20;

impl fmt::Debug for FatArch {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        fmt.debug_struct("FatArch")
            .field("cputype", &arch::cputype_to_str(self.cputype))
            .field("cpusubtype", &format_args!("{:#x}", self.cpusubtype))
            .field("offset", &format_args!("{:#x}", self.offset))
            .field("size", &self.size)
            .field("align", &self.align)
            .finish()
    }
}

impl FatHeader {
    /// Parse a mach-o fat header from the `bytes`
    pub fn parse(bytes: &[u8]) -> error::Result<FatHeader> {
        Ok(bytes.pread_with(0, scroll::BE)?)
    }
}

impl FatArch {
    /// Whether the slice this header describes lies inside `bytes`
    pub fn is_contained_in(&self, bytes: &[u8]) -> bool {
        (self.offset as usize)
            .checked_add(self.size as usize)
            .map(|end| end <= bytes.len())
            .unwrap_or(false)
    }

    /// Get the slice of bytes this header describes from `bytes`
    pub fn slice<'a>(&self, bytes: &'a [u8]) -> error::Result<&'a [u8]> {
        if !self.is_contained_in(bytes) {
            return Err(Error::Malformed(format!(
                "fat arch slice {:#x}..{:#x} is outside the file",
                self.offset,
                u64::from(self.offset) + u64::from(self.size)
            )));
        }
        let start = self.offset as usize;
        Ok(&bytes[start..start + self.size as usize])
    }

    /// Parses the fat arch table following the fat header
    pub fn parse(bytes: &[u8]) -> error::Result<Vec<FatArch>> {
        let header = FatHeader::parse(bytes)?;
        if header.magic != FAT_MAGIC {
            return Err(Error::BadMagic(u64::from(header.magic)));
        }
        let narches = header.nfat_arch as usize;
        // the arch table must fit; a fat file claiming thousands of arches
        // is declaring more table than file
        let table_size = narches
            .checked_mul(SIZEOF_FAT_ARCH)
            .and_then(|size| size.checked_add(SIZEOF_FAT_HEADER))
            .ok_or_else(|| Error::Malformed("fat arch count overflows".into()))?;
        if table_size > bytes.len() {
            return Err(Error::Malformed(format!(
                "fat file declares {} arches but is only {} bytes",
                narches,
                bytes.len()
            )));
        }
        let mut arches = Vec::with_capacity(narches);
        let mut offset = SIZEOF_FAT_HEADER;
        for _ in 0..narches {
            let arch = bytes.gread_with::<FatArch>(&mut offset, scroll::BE)?;
            arches.push(arch);
        }
        Ok(arches)
    }
}

/// Whether `bytes` starts with the fat magic
pub fn is_fat(bytes: &[u8]) -> bool {
    bytes.len() >= 4 && FatHeader::parse(bytes).map(|h| h.magic == FAT_MAGIC).unwrap_or(false)
}

/// Picks the best slice of a possibly-fat file for `archs`. For a thin file
/// the whole buffer is returned if its arch is acceptable. `is_os_binary`
/// says whether the file is signed as an OS binary, which some grades
/// require.
pub fn best_slice<'a>(
    bytes: &'a [u8],
    archs: &GradedArchs,
    is_os_binary: bool,
) -> error::Result<&'a [u8]> {
    if !is_fat(bytes) {
        return Ok(bytes);
    }
    let arches = FatArch::parse(bytes)?;
    let mut best: Option<(usize, &FatArch)> = None;
    for arch in &arches {
        if let Some(rank) = archs.grade(arch.cputype, arch.cpusubtype, is_os_binary) {
            if best.map(|(best_rank, _)| rank < best_rank).unwrap_or(true) {
                best = Some((rank, arch));
            }
        }
    }
    match best {
        Some((_, arch)) => arch.slice(bytes),
        None => {
            let found = arches
                .iter()
                .map(|a| arch::arch_name(a.cputype, a.cpusubtype))
                .collect::<Vec<_>>()
                .join("' '");
            Err(Error::Incompatible(format!(
                "fat file has no slice loadable in this process; have '{}', need '{}'",
                found, archs
            )))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach::arch::*;
    use scroll::Pwrite;

    fn fat_file(arches: &[(u32, u32)]) -> Vec<u8> {
        let mut bytes = vec![0u8; SIZEOF_FAT_HEADER + arches.len() * SIZEOF_FAT_ARCH + 0x100];
        bytes
            .pwrite_with(
                FatHeader {
                    magic: FAT_MAGIC,
                    nfat_arch: arches.len() as u32,
                },
                0,
                scroll::BE,
            )
            .unwrap();
        let mut offset = SIZEOF_FAT_HEADER;
        for (i, &(cputype, cpusubtype)) in arches.iter().enumerate() {
            bytes
                .pwrite_with(
                    FatArch {
                        cputype,
                        cpusubtype,
                        offset: (0x40 * (i + 1)) as u32,
                        size: 0x40,
                        align: 2,
                    },
                    offset,
                    scroll::BE,
                )
                .unwrap();
            offset += SIZEOF_FAT_ARCH;
        }
        bytes
    }

    #[test]
    fn best_slice_prefers_higher_grade() {
        let bytes = fat_file(&[
            (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_ALL),
            (CPU_TYPE_X86_64, CPU_SUBTYPE_X86_64_H),
        ]);
        let slice = best_slice(&bytes, &GradedArchs::x86_64h(), false).unwrap();
        // second slice is the haswell one, at offset 0x80
        assert_eq!(slice.as_ptr() as usize - bytes.as_ptr() as usize, 0x80);
    }

    #[test]
    fn no_loadable_slice_is_incompatible() {
        let bytes = fat_file(&[(CPU_TYPE_ARM64, CPU_SUBTYPE_ARM64_ALL)]);
        assert!(matches!(
            best_slice(&bytes, &GradedArchs::x86_64(), false),
            Err(crate::error::Error::Incompatible(_))
        ));
    }

    #[test]
    fn oversized_arch_table_is_malformed() {
        let mut bytes = vec![0u8; 16];
        bytes
            .pwrite_with(
                FatHeader {
                    magic: FAT_MAGIC,
                    nfat_arch: 0xffff,
                },
                0,
                scroll::BE,
            )
            .unwrap();
        assert!(FatArch::parse(&bytes).is_err());
    }
}
