//! The runtime representation of one loaded image. A `Loader` owns the
//! file bytes it was analyzed from and the writable region its segments
//! were mapped into; everything else in the launch pipeline works through
//! it. Loaders live in a single owning arena and refer to each other by
//! index, which keeps the upward-link and re-export cycles out of the
//! ownership story entirely.

use core::fmt;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::mach::constants::{SEG_DATA_CONST, SEG_TPRO_CONST, VmProt};
use crate::mach::exports::{Export, ExportTarget};
use crate::mach::MachFile;

pub mod init;
pub mod jit;
pub mod prebuilt;

/// stable magic tag stored in every live Loader ('l4yd')
pub const LOADER_MAGIC: u32 = 0x6c34_7964;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
/// Index of a loader in the owning arena
pub struct LoaderRef(pub u32);

impl fmt::Display for LoaderRef {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "loader#{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Which concrete loader this is. The tag is the first field of the record
/// so callers can dispatch without any virtual calls.
pub enum LoaderKind {
    /// analyzed and mapped from disk at load time
    JustInTime,
    /// reconstructed from a precomputed launch closure
    Prebuilt,
    /// delivered already mapped (kernel page-in linking)
    Premapped,
}

bitflags::bitflags! {
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct LoaderFlags: u32 {
        const IS_PREBUILT = 1 << 0;
        const IN_DYLD_CACHE = 1 << 1;
        const HAS_OBJC = 1 << 2;
        const MAY_HAVE_PLUS_LOAD = 1 << 3;
        const HAS_READ_ONLY_DATA = 1 << 4;
        const NEVER_UNLOAD = 1 << 5;
        const LEAVE_MAPPED = 1 << 6;
        const HAS_READ_ONLY_OBJC = 1 << 7;
        const PRE_2022_BINARY = 1 << 8;
        const IS_PREMAPPED = 1 << 9;
        const HAS_UUID = 1 << 10;
        const HAS_WEAK_DEFS = 1 << 11;
        const HAS_THREAD_LOCALS = 1 << 12;
        const BELOW_LIBSYSTEM = 1 << 13;
        const HAS_FUNCTION_VARIANT_FIXUPS = 1 << 14;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Attributes of one dependency edge
pub enum DependentKind {
    Regular,
    WeakLink,
    Reexport,
    Upward,
}

#[derive(Debug, Clone, Copy)]
/// One dependency edge; `None` is a weak-linked dylib that was not found
pub struct Dependent {
    pub kind: DependentKind,
    pub loader: Option<LoaderRef>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
/// How the file this image came from is identified for later validation
pub struct FileId {
    pub device: u64,
    pub inode: u64,
    pub mtime: u64,
    /// hash of the code directory, when the image is signed
    pub cd_hash: Option<[u8; 20]>,
}

impl FileId {
    pub fn for_file(path: &Path, cd_hash: Option<[u8; 20]>) -> FileId {
        use std::os::unix::fs::MetadataExt;
        match fs::metadata(path) {
            Ok(meta) => FileId {
                device: meta.dev(),
                inode: meta.ino(),
                mtime: meta.mtime() as u64,
                cd_hash,
            },
            Err(_) => FileId {
                cd_hash,
                ..FileId::default()
            },
        }
    }
}

/// The bytes an image was analyzed from: a file mapping for real loads, an
/// owned buffer for synthesized images
pub enum ImageSource {
    Mapped(memmap2::Mmap),
    Owned(Vec<u8>),
}

impl ImageSource {
    pub fn bytes(&self) -> &[u8] {
        match self {
            ImageSource::Mapped(map) => map,
            ImageSource::Owned(bytes) => bytes,
        }
    }
}

impl fmt::Debug for ImageSource {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        match self {
            ImageSource::Mapped(map) => write!(fmt, "ImageSource::Mapped({} bytes)", map.len()),
            ImageSource::Owned(bytes) => write!(fmt, "ImageSource::Owned({} bytes)", bytes.len()),
        }
    }
}

#[derive(Debug, Clone)]
/// Bookkeeping for one mapped segment inside the region
pub struct RegionInfo {
    pub name: String,
    /// offset of the segment from the mach header
    pub vm_offset: u64,
    pub vm_size: u64,
    /// bytes that came from the file; the tail is zero-fill
    pub file_size: u64,
    pub init_prot: VmProt,
    /// rebased-then-sealed data (`__DATA_CONST`-style)
    pub read_only_data: bool,
    pub is_zero_fill: bool,
}

/// The contiguous writable memory one image's segments were mapped into.
/// Reads and writes go through a raw base pointer: fixups mutate mapped
/// image memory in place while other loaders hold shared references to the
/// arena, exactly like stores through mapped pages. The loader lock
/// serializes all writers.
pub struct RegionMemory {
    map: memmap2::MmapMut,
    base: *mut u8,
    len: usize,
}

// the raw base pointer aliases memory owned by `map`; access is serialized
// by the loader lock
unsafe impl Send for RegionMemory {}
unsafe impl Sync for RegionMemory {}

impl fmt::Debug for RegionMemory {
    fn fmt(&self, fmt: &mut fmt::Formatter) -> fmt::Result {
        write!(fmt, "RegionMemory({:p}, {:#x} bytes)", self.base, self.len)
    }
}

impl RegionMemory {
    /// Reserves a zeroed span of address space for an image
    pub fn allocate(len: usize) -> Result<RegionMemory> {
        let mut map = memmap2::MmapOptions::new()
            .len(len.max(1))
            .map_anon()
            .map_err(|err| Error::Resource(format!("cannot reserve {:#x} bytes: {}", len, err)))?;
        let base = map.as_mut_ptr();
        Ok(RegionMemory { map, base, len })
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// The address the image actually loaded at
    pub fn load_address(&self) -> u64 {
        self.base as u64
    }

    pub fn bytes(&self) -> &[u8] {
        unsafe { core::slice::from_raw_parts(self.base, self.len) }
    }

    fn check(&self, offset: u64, size: u64) -> Result<usize> {
        offset
            .checked_add(size)
            .filter(|&end| end <= self.len as u64)
            .ok_or_else(|| {
                Error::Malformed(format!(
                    "fixup location {:#x} is outside the {:#x} byte image",
                    offset, self.len
                ))
            })?;
        Ok(offset as usize)
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let offset = self.check(offset, 8)?;
        Ok(u64::from_le_bytes(
            self.bytes()[offset..offset + 8].try_into().unwrap(),
        ))
    }

    pub fn read_u32(&self, offset: u64) -> Result<u32> {
        let offset = self.check(offset, 4)?;
        Ok(u32::from_le_bytes(
            self.bytes()[offset..offset + 4].try_into().unwrap(),
        ))
    }

    /// Stores a pointer-sized value. Takes `&self`: the region is mapped
    /// memory and the loader lock serializes writers.
    pub fn write_u64(&self, offset: u64, value: u64) -> Result<()> {
        let offset = self.check(offset, 8)?;
        unsafe {
            core::ptr::write_unaligned(self.base.add(offset) as *mut u64, value.to_le());
        }
        Ok(())
    }

    pub fn write_u32(&self, offset: u64, value: u32) -> Result<()> {
        let offset = self.check(offset, 4)?;
        unsafe {
            core::ptr::write_unaligned(self.base.add(offset) as *mut u32, value.to_le());
        }
        Ok(())
    }

    pub fn copy_in(&mut self, offset: usize, bytes: &[u8]) -> Result<()> {
        self.check(offset as u64, bytes.len() as u64)?;
        self.map[offset..offset + bytes.len()].copy_from_slice(bytes);
        Ok(())
    }
}

#[derive(Debug)]
/// An image's bytes plus its mapped incarnation
pub struct MappedImage {
    pub source: ImageSource,
    pub region: RegionMemory,
    pub regions: Vec<RegionInfo>,
    /// the unslid address the image was linked at
    pub preferred_base: u64,
}

impl MappedImage {
    pub fn slide(&self) -> u64 {
        self.region.load_address().wrapping_sub(self.preferred_base)
    }
}

#[derive(Debug)]
/// One loaded image
pub struct Loader {
    /// concrete kind; first so dispatch never chases a vtable
    pub kind: LoaderKind,
    pub magic: u32,
    pub this: LoaderRef,
    pub flags: LoaderFlags,
    pub uuid: [u8; 16],
    pub cpusubtype: u32,
    /// the path the image was actually loaded from
    pub path: String,
    /// `LC_ID_DYLIB`, when the image is a dylib
    pub install_name: Option<String>,
    pub file_id: FileId,
    pub dependents: Vec<Dependent>,
    pub rpaths: Vec<String>,
    pub image: MappedImage,
    /// when this image is a root overriding a cached dylib: the cache
    /// index it overrides (the patch table is built after dependents load)
    pub override_of_cache_index: Option<u32>,
    /// the override patch table, one entry per patchable export of the
    /// overridden cached dylib
    pub patch_table: Option<crate::fixup::patch::DylibPatchTable>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
/// What a symbol lookup resolved to
pub enum ResolvedSymbol {
    /// self-relative: the location gets the image's own slide
    Rebase { runtime_offset: u64 },
    /// points into another image
    BindToImage {
        loader: LoaderRef,
        name: String,
        runtime_offset: u64,
        is_code: bool,
        is_weak_def: bool,
        is_missing_flat_lazy: bool,
        is_function_variant: bool,
        variant_index: u32,
    },
    /// an absolute constant (also the shape of a missing weak import)
    BindAbsolute { value: u64 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// How deep an export search may go
pub enum ExportedSymbolMode {
    /// normal static linking: follow re-exports
    StaticLink,
    /// this image only
    Shallow,
}

#[derive(Debug, Clone)]
/// A successful export search
pub struct FoundSymbol {
    pub loader: LoaderRef,
    pub runtime_offset: u64,
    pub is_code: bool,
    pub is_weak_def: bool,
    pub is_absolute: bool,
    pub absolute_value: u64,
}

impl Loader {
    pub fn file_bytes(&self) -> &[u8] {
        self.image.source.bytes()
    }

    /// Re-analyzes the image's file bytes. Parsing is one load-command
    /// walk; loaders re-parse rather than carrying a self-referential view.
    pub fn mach_file(&self) -> Result<MachFile> {
        MachFile::parse(self.file_bytes())
    }

    pub fn load_address(&self) -> u64 {
        self.image.region.load_address()
    }

    pub fn slide(&self) -> u64 {
        self.image.slide()
    }

    /// The runtime address `runtime_offset` bytes past the mach header
    pub fn address_of(&self, runtime_offset: u64) -> u64 {
        self.load_address().wrapping_add(runtime_offset)
    }

    /// Whether `addr` falls inside this image's mapped span
    pub fn contains(&self, addr: u64) -> bool {
        let base = self.load_address();
        addr >= base && addr < base + self.image.region.len() as u64
    }

    pub fn dependent_count(&self) -> usize {
        self.dependents.len()
    }

    pub fn dependent(&self, index: usize) -> Option<LoaderRef> {
        self.dependents.get(index).and_then(|edge| edge.loader)
    }

    pub fn is_in_dyld_cache(&self) -> bool {
        self.flags.contains(LoaderFlags::IN_DYLD_CACHE)
    }

    pub fn leave_mapped(&self) -> bool {
        self.flags
            .intersects(LoaderFlags::LEAVE_MAPPED | LoaderFlags::NEVER_UNLOAD)
    }

    /// Searches this image's export trie for `name`. Re-export terminals
    /// are resolved through `reexport`, which maps a dependent ordinal and
    /// a symbol name to a finished search (the graph walk lives with
    /// whoever owns the arena).
    pub fn search_exports(
        &self,
        name: &str,
        mode: ExportedSymbolMode,
        reexport: &mut dyn FnMut(u64, &str) -> Result<Option<FoundSymbol>>,
    ) -> Result<Option<FoundSymbol>> {
        let mach = self.mach_file()?;
        let trie = mach.export_trie()?;
        let export = match trie.find(name)? {
            Some(export) => export,
            None => return Ok(None),
        };
        self.found_from_export(name, &export, mode, reexport)
    }

    fn found_from_export(
        &self,
        name: &str,
        export: &Export,
        mode: ExportedSymbolMode,
        reexport: &mut dyn FnMut(u64, &str) -> Result<Option<FoundSymbol>>,
    ) -> Result<Option<FoundSymbol>> {
        match &export.target {
            ExportTarget::Regular { offset } => Ok(Some(FoundSymbol {
                loader: self.this,
                runtime_offset: *offset,
                is_code: self.offset_is_code(*offset),
                is_weak_def: export.is_weak_def(),
                is_absolute: false,
                absolute_value: 0,
            })),
            ExportTarget::ThreadLocal { offset } => Ok(Some(FoundSymbol {
                loader: self.this,
                runtime_offset: *offset,
                is_code: false,
                is_weak_def: export.is_weak_def(),
                is_absolute: false,
                absolute_value: 0,
            })),
            ExportTarget::Absolute { address } => Ok(Some(FoundSymbol {
                loader: self.this,
                runtime_offset: 0,
                is_code: false,
                is_weak_def: export.is_weak_def(),
                is_absolute: true,
                absolute_value: *address,
            })),
            ExportTarget::StubAndResolver { stub_offset, .. } => {
                // running resolvers is a call into user code; static
                // linking binds the stub
                Ok(Some(FoundSymbol {
                    loader: self.this,
                    runtime_offset: *stub_offset,
                    is_code: true,
                    is_weak_def: export.is_weak_def(),
                    is_absolute: false,
                    absolute_value: 0,
                }))
            }
            ExportTarget::Reexport { lib_ordinal, name: import_name } => {
                if mode == ExportedSymbolMode::Shallow {
                    return Ok(None);
                }
                let target_name = if import_name.is_empty() {
                    name
                } else {
                    import_name
                };
                reexport(*lib_ordinal, target_name)
            }
        }
    }

    /// Whether an offset lands in an executable segment
    fn offset_is_code(&self, runtime_offset: u64) -> bool {
        self.image.regions.iter().any(|region| {
            region.init_prot.is_executable()
                && runtime_offset >= region.vm_offset
                && runtime_offset < region.vm_offset + region.vm_size
        })
    }

    /// Segments that were rebased and must be resealed read-only after
    /// fixups (`__DATA_CONST`, `__TPRO_CONST`)
    pub fn read_only_data_regions(&self) -> impl Iterator<Item = &RegionInfo> {
        self.image
            .regions
            .iter()
            .filter(|region| region.read_only_data)
    }
}

/// Whether a segment is rebased then sealed read-only
pub fn is_read_only_data_segment(name: &str) -> bool {
    name == SEG_DATA_CONST || name == SEG_TPRO_CONST
}
