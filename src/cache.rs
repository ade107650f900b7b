//! A read-only view of a dyld shared cache file: the header, the mapping
//! table, the dylib image list, and the patch tables that say which
//! locations in the cache bind to each patchable export. Building a cache
//! is someone else's job; this module only consumes one.

use std::fs;
use std::path::Path;

use scroll::{Pread, Pwrite, SizeWith};

use crate::error::{Error, Result};
use crate::mach::chained::PointerMetadata;

/// magic prefix of a cache file; the tail names the arch
pub const CACHE_MAGIC_PREFIX: &str = "dyld_v1";

pub const PATCH_TABLE_VERSION: u32 = 2;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// The front of a shared cache file
pub struct CacheHeader {
    /// e.g. "dyld_v1  arm64e\0"
    pub magic: [u8; 16],
    /// file offset of the mapping table
    pub mapping_offset: u32,
    pub mapping_count: u32,
    /// file offset of the image table
    pub images_offset: u32,
    pub images_count: u32,
    /// unslid address the cache was laid out at
    pub base_address: u64,
    /// file offset and size of the patch tables
    pub patch_info_offset: u64,
    pub patch_info_size: u64,
    pub uuid: [u8; 16],
    pub platform: u32,
    pub os_version: u32,
}

pub const SIZEOF_CACHE_HEADER: usize = 80;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
/// One region of the cache file mapped into memory
pub struct CacheMappingInfo {
    pub address: u64,
    pub size: u64,
    pub file_offset: u64,
    pub max_prot: u32,
    pub init_prot: u32,
}

pub const SIZEOF_CACHE_MAPPING_INFO: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, Pread, Pwrite, SizeWith)]
/// One dylib baked into the cache
pub struct CacheImageInfo {
    /// unslid address of the image's mach header
    pub address: u64,
    pub mod_time: u64,
    pub inode: u64,
    /// file offset of the image's NUL-terminated install name
    pub path_file_offset: u32,
    pub pad: u32,
}

pub const SIZEOF_CACHE_IMAGE_INFO: usize = 32;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// Front of the patch tables
pub struct CachePatchInfo {
    /// 2
    pub patch_table_version: u32,
    /// file offset of one `CacheImagePatches` per cached dylib
    pub image_patches_offset: u32,
    pub image_patches_count: u32,
    /// file offset of the patchable-export array
    pub patch_exports_offset: u32,
    pub patch_exports_count: u32,
    /// file offset of the patch-location array
    pub patch_locations_offset: u32,
    pub patch_locations_count: u32,
    /// file offset and size of the export-name pool
    pub export_names_offset: u32,
    pub export_names_size: u32,
}

pub const SIZEOF_CACHE_PATCH_INFO: usize = 36;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// The range of patchable exports belonging to one cached dylib
pub struct CacheImagePatches {
    pub patch_exports_start_index: u32,
    pub patch_exports_count: u32,
}

/// kinds of patchable export, recorded by the cache builder
pub const PATCH_KIND_REGULAR: u32 = 0;
pub const PATCH_KIND_OBJC_CLASS: u32 = 1;
pub const PATCH_KIND_SINGLETON: u32 = 2;
pub const PATCH_KIND_WEAK_IMPORT: u32 = 3;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// One export of a cached dylib that roots may override
pub struct CachePatchableExport {
    /// vm offset of the implementation inside its dylib
    pub dylib_offset_of_impl: u32,
    pub patch_locations_start_index: u32,
    pub patch_locations_count: u32,
    /// offset of the export's name in the name pool
    pub export_name_offset: u32,
    /// PATCH_KIND_*
    pub kind: u32,
}

pub const SIZEOF_CACHE_PATCHABLE_EXPORT: usize = 20;

#[repr(C)]
#[derive(Debug, Clone, Copy, Default, Pread, Pwrite, SizeWith)]
/// One location in the cache that binds to a patchable export
pub struct CachePatchableLocation {
    /// vm offset of the location from the cache base
    pub cache_offset_of_use: u64,
    pub addend: i64,
    /// ptrauth key number
    pub key: u8,
    /// nonzero when the location signature mixes in its address
    pub uses_addr_diversity: u8,
    pub diversity: u16,
    /// nonzero when the location is signed
    pub authenticated: u8,
    pub pad: [u8; 3],
}

pub const SIZEOF_CACHE_PATCHABLE_LOCATION: usize = 24;

impl CachePatchableLocation {
    pub fn pmd(&self) -> PointerMetadata {
        PointerMetadata {
            key: self.key,
            uses_addr_diversity: self.uses_addr_diversity != 0,
            diversity: self.diversity,
            high8: 0,
            authenticated: self.authenticated != 0,
        }
    }
}

/// An opened, parsed shared cache. Owns the cache bytes; in a live process
/// these would be the mapped shared region.
#[derive(Debug)]
pub struct DyldCache {
    data: Vec<u8>,
    pub path: String,
    pub header: CacheHeader,
}

impl DyldCache {
    pub fn open(path: &Path) -> Result<DyldCache> {
        let data = fs::read(path)?;
        DyldCache::parse(data, &path.to_string_lossy())
    }

    pub fn parse(data: Vec<u8>, path: &str) -> Result<DyldCache> {
        let header: CacheHeader = data.pread_with(0, scroll::LE)?;
        let magic = core::str::from_utf8(&header.magic)
            .map_err(|_| Error::Malformed("shared cache magic is not ascii".into()))?;
        if !magic.starts_with(CACHE_MAGIC_PREFIX) {
            return Err(Error::Malformed(format!(
                "'{}' is not a shared cache file",
                path
            )));
        }
        let images_end = header.images_offset as usize
            + header.images_count as usize * SIZEOF_CACHE_IMAGE_INFO;
        if images_end > data.len() {
            return Err(Error::Malformed(
                "shared cache image table is outside the file".into(),
            ));
        }
        Ok(DyldCache {
            data,
            path: path.to_owned(),
            header,
        })
    }

    pub fn bytes(&self) -> &[u8] {
        &self.data
    }

    pub fn read_u64(&self, offset: u64) -> Result<u64> {
        let start = offset as usize;
        let bytes = self
            .data
            .get(start..start + 8)
            .ok_or_else(|| Error::Malformed("cache read outside the file".into()))?;
        Ok(u64::from_le_bytes(bytes.try_into().unwrap()))
    }

    /// Stores one patched pointer. In a live process the patched page sits
    /// in a read-only shared region; callers wrap a run of these in
    /// [`DyldCache::with_writable`] so protections are dropped and restored
    /// around the whole run.
    pub fn write_u64(&mut self, offset: u64, value: u64) -> Result<()> {
        let start = offset as usize;
        let bytes = self
            .data
            .get_mut(start..start + 8)
            .ok_or_else(|| Error::Malformed("cache write outside the file".into()))?;
        bytes.copy_from_slice(&value.to_le_bytes());
        Ok(())
    }

    /// Scoped writer for patching: the DATA_CONST/TPRO pages of a mapped
    /// cache are made writable for the duration of `work` and sealed again
    /// when it returns, success or not.
    pub fn with_writable<T>(
        &mut self,
        work: impl FnOnce(&mut DyldCache) -> Result<T>,
    ) -> Result<T> {
        // an owned buffer has no protections to drop; mapped-region hosts
        // hook mprotect here
        work(self)
    }

    /// The slide the cache "loaded" with: in this crate the cache bytes
    /// live wherever the buffer is, so offsets stand in for addresses and
    /// the slide is zero. Kept separate so a mapped-cache host can supply
    /// the real value.
    pub fn slide(&self) -> u64 {
        0
    }

    pub fn image_count(&self) -> u32 {
        self.header.images_count
    }

    pub fn image_info(&self, index: u32) -> Result<CacheImageInfo> {
        if index >= self.header.images_count {
            return Err(Error::Malformed(format!(
                "cache image index {} is beyond the {} images",
                index, self.header.images_count
            )));
        }
        Ok(self.data.pread_with(
            self.header.images_offset as usize + index as usize * SIZEOF_CACHE_IMAGE_INFO,
            scroll::LE,
        )?)
    }

    pub fn image_path(&self, index: u32) -> Result<&str> {
        let info = self.image_info(index)?;
        let start = info.path_file_offset as usize;
        let bytes = self
            .data
            .get(start..)
            .ok_or_else(|| Error::Malformed("cache image path is outside the file".into()))?;
        let nul = bytes
            .iter()
            .position(|&b| b == 0)
            .ok_or_else(|| Error::Malformed("cache image path is not NUL-terminated".into()))?;
        core::str::from_utf8(&bytes[..nul])
            .map_err(|_| Error::Malformed("cache image path is not utf-8".into()))
    }

    /// Finds a cached dylib by install name
    pub fn image_index_of_path(&self, path: &str) -> Option<u32> {
        (0..self.header.images_count).find(|&i| self.image_path(i).ok() == Some(path))
    }

    /// The vm offset of a cached image's header from the cache base
    pub fn image_vm_offset(&self, index: u32) -> Result<u64> {
        let info = self.image_info(index)?;
        Ok(info.address - self.header.base_address)
    }

    fn patch_info(&self) -> Result<Option<CachePatchInfo>> {
        if self.header.patch_info_size == 0 {
            return Ok(None);
        }
        let info: CachePatchInfo = self
            .data
            .pread_with(self.header.patch_info_offset as usize, scroll::LE)?;
        if info.patch_table_version != PATCH_TABLE_VERSION {
            return Err(Error::Malformed(format!(
                "unsupported cache patch table version {}",
                info.patch_table_version
            )));
        }
        Ok(Some(info))
    }

    /// How many patchable exports a cached dylib has
    pub fn patchable_export_count(&self, image_index: u32) -> Result<u32> {
        let info = match self.patch_info()? {
            Some(info) => info,
            None => return Ok(0),
        };
        if image_index >= info.image_patches_count {
            return Ok(0);
        }
        let patches: CacheImagePatches = self.data.pread_with(
            info.image_patches_offset as usize + image_index as usize * 8,
            scroll::LE,
        )?;
        Ok(patches.patch_exports_count)
    }

    /// Walks the patchable exports of one cached dylib
    pub fn for_each_patchable_export(
        &self,
        image_index: u32,
        mut handler: impl FnMut(u32, &CachePatchableExport, &str) -> Result<()>,
    ) -> Result<()> {
        let info = match self.patch_info()? {
            Some(info) => info,
            None => return Ok(()),
        };
        if image_index >= info.image_patches_count {
            return Ok(());
        }
        let patches: CacheImagePatches = self.data.pread_with(
            info.image_patches_offset as usize + image_index as usize * 8,
            scroll::LE,
        )?;
        for i in 0..patches.patch_exports_count {
            let index = patches.patch_exports_start_index + i;
            if index >= info.patch_exports_count {
                return Err(Error::Malformed(
                    "cache patchable export index out of range".into(),
                ));
            }
            let export: CachePatchableExport = self.data.pread_with(
                info.patch_exports_offset as usize
                    + index as usize * SIZEOF_CACHE_PATCHABLE_EXPORT,
                scroll::LE,
            )?;
            let name_start =
                info.export_names_offset as usize + export.export_name_offset as usize;
            let bytes = self.data.get(name_start..).ok_or_else(|| {
                Error::Malformed("cache export name is outside the file".into())
            })?;
            let nul = bytes.iter().position(|&b| b == 0).ok_or_else(|| {
                Error::Malformed("cache export name is not NUL-terminated".into())
            })?;
            let name = core::str::from_utf8(&bytes[..nul])
                .map_err(|_| Error::Malformed("cache export name is not utf-8".into()))?;
            handler(index, &export, name)?;
        }
        Ok(())
    }

    /// Walks the patch locations of one patchable export
    pub fn for_each_patch_location(
        &self,
        export: &CachePatchableExport,
        mut handler: impl FnMut(&CachePatchableLocation) -> Result<()>,
    ) -> Result<()> {
        let info = match self.patch_info()? {
            Some(info) => info,
            None => return Ok(()),
        };
        for i in 0..export.patch_locations_count {
            let index = export.patch_locations_start_index + i;
            if index >= info.patch_locations_count {
                return Err(Error::Malformed(
                    "cache patch location index out of range".into(),
                ));
            }
            let location: CachePatchableLocation = self.data.pread_with(
                info.patch_locations_offset as usize
                    + index as usize * SIZEOF_CACHE_PATCHABLE_LOCATION,
                scroll::LE,
            )?;
            handler(&location)?;
        }
        Ok(())
    }
}

/// Assembles minimal cache files so the patching paths can be exercised
/// without a real OS cache on disk.
pub mod builder {
    use super::*;

    #[derive(Debug, Clone)]
    pub struct PatchLocationSpec {
        pub cache_offset: u64,
        pub addend: i64,
        pub authenticated: bool,
    }

    #[derive(Debug, Clone)]
    pub struct PatchExportSpec {
        pub name: String,
        pub dylib_offset_of_impl: u32,
        pub kind: u32,
        pub locations: Vec<PatchLocationSpec>,
    }

    #[derive(Debug, Clone)]
    pub struct CachedDylibSpec {
        pub path: String,
        /// raw image bytes placed at this dylib's spot in the cache
        pub image: Vec<u8>,
        pub patch_exports: Vec<PatchExportSpec>,
    }

    #[derive(Debug, Default)]
    pub struct CacheBuilder {
        dylibs: Vec<CachedDylibSpec>,
        base_address: u64,
        platform: u32,
        os_version: u32,
    }

    impl CacheBuilder {
        pub fn new(base_address: u64) -> CacheBuilder {
            CacheBuilder {
                dylibs: Vec::new(),
                base_address,
                platform: 1,
                os_version: 0x000e_0000,
            }
        }

        pub fn dylib(mut self, spec: CachedDylibSpec) -> CacheBuilder {
            self.dylibs.push(spec);
            self
        }

        pub fn build(self) -> Result<Vec<u8>> {
            let mut data = vec![0u8; SIZEOF_CACHE_HEADER];

            // image table, then paths, then image bytes, then patch tables
            let images_offset = data.len();
            data.resize(images_offset + self.dylibs.len() * SIZEOF_CACHE_IMAGE_INFO, 0);
            let mut path_offsets = Vec::new();
            for dylib in &self.dylibs {
                path_offsets.push(data.len() as u32);
                data.extend_from_slice(dylib.path.as_bytes());
                data.push(0);
            }
            while data.len() % 0x1000 != 0 {
                data.push(0);
            }
            let mut image_addresses = Vec::new();
            for dylib in &self.dylibs {
                image_addresses.push(self.base_address + data.len() as u64);
                data.extend_from_slice(&dylib.image);
                while data.len() % 0x1000 != 0 {
                    data.push(0);
                }
            }
            for i in 0..self.dylibs.len() {
                let info = CacheImageInfo {
                    address: image_addresses[i],
                    mod_time: 0,
                    inode: i as u64 + 1,
                    path_file_offset: path_offsets[i],
                    pad: 0,
                };
                data.pwrite_with(
                    info,
                    images_offset + i * SIZEOF_CACHE_IMAGE_INFO,
                    scroll::LE,
                )?;
            }

            // patch tables
            let mut image_patches = Vec::new();
            let mut exports = Vec::new();
            let mut locations = Vec::new();
            let mut names = Vec::new();
            for dylib in &self.dylibs {
                let start = exports.len() as u32;
                for export in &dylib.patch_exports {
                    let name_offset = names.len() as u32;
                    names.extend_from_slice(export.name.as_bytes());
                    names.push(0);
                    let loc_start = locations.len() as u32;
                    for location in &export.locations {
                        locations.push(CachePatchableLocation {
                            cache_offset_of_use: location.cache_offset,
                            addend: location.addend,
                            key: 0,
                            uses_addr_diversity: 0,
                            diversity: 0,
                            authenticated: u8::from(location.authenticated),
                            pad: [0; 3],
                        });
                    }
                    exports.push(CachePatchableExport {
                        dylib_offset_of_impl: export.dylib_offset_of_impl,
                        patch_locations_start_index: loc_start,
                        patch_locations_count: export.locations.len() as u32,
                        export_name_offset: name_offset,
                        kind: export.kind,
                    });
                }
                image_patches.push(CacheImagePatches {
                    patch_exports_start_index: start,
                    patch_exports_count: (exports.len() as u32) - start,
                });
            }

            let patch_info_offset = data.len() as u64;
            let image_patches_offset = (data.len() + SIZEOF_CACHE_PATCH_INFO) as u32;
            let patch_exports_offset =
                image_patches_offset + (image_patches.len() * 8) as u32;
            let patch_locations_offset = patch_exports_offset
                + (exports.len() * SIZEOF_CACHE_PATCHABLE_EXPORT) as u32;
            let export_names_offset = patch_locations_offset
                + (locations.len() * SIZEOF_CACHE_PATCHABLE_LOCATION) as u32;
            let info = CachePatchInfo {
                patch_table_version: PATCH_TABLE_VERSION,
                image_patches_offset,
                image_patches_count: image_patches.len() as u32,
                patch_exports_offset,
                patch_exports_count: exports.len() as u32,
                patch_locations_offset,
                patch_locations_count: locations.len() as u32,
                export_names_offset,
                export_names_size: names.len() as u32,
            };
            data.resize(data.len() + SIZEOF_CACHE_PATCH_INFO, 0);
            data.pwrite_with(info, patch_info_offset as usize, scroll::LE)?;
            for patches in &image_patches {
                data.extend_from_slice(&patches.patch_exports_start_index.to_le_bytes());
                data.extend_from_slice(&patches.patch_exports_count.to_le_bytes());
            }
            for export in &exports {
                let offset = data.len();
                data.resize(offset + SIZEOF_CACHE_PATCHABLE_EXPORT, 0);
                data.pwrite_with(*export, offset, scroll::LE)?;
            }
            for location in &locations {
                let offset = data.len();
                data.resize(offset + SIZEOF_CACHE_PATCHABLE_LOCATION, 0);
                data.pwrite_with(*location, offset, scroll::LE)?;
            }
            data.extend_from_slice(&names);
            let patch_info_size = data.len() as u64 - patch_info_offset;

            // header last, now that every table has a home
            let mut magic = [0u8; 16];
            magic[..CACHE_MAGIC_PREFIX.len()].copy_from_slice(CACHE_MAGIC_PREFIX.as_bytes());
            let header = CacheHeader {
                magic,
                mapping_offset: 0,
                mapping_count: 0,
                images_offset: images_offset as u32,
                images_count: self.dylibs.len() as u32,
                base_address: self.base_address,
                patch_info_offset,
                patch_info_size,
                uuid: [0x33; 16],
                platform: self.platform,
                os_version: self.os_version,
            };
            data.pwrite_with(header, 0, scroll::LE)?;
            Ok(data)
        }
    }

    /// Where an image added with [`CacheBuilder::dylib`] will land, for
    /// wiring patch-location offsets before building: images are placed
    /// page-aligned after the header, image table, and path pool.
    pub fn image_layout(dylibs: &[CachedDylibSpec]) -> Vec<u64> {
        let mut cursor = SIZEOF_CACHE_HEADER + dylibs.len() * SIZEOF_CACHE_IMAGE_INFO;
        for dylib in dylibs {
            cursor += dylib.path.len() + 1;
        }
        cursor = (cursor + 0xfff) & !0xfff;
        let mut layout = Vec::new();
        for dylib in dylibs {
            layout.push(cursor as u64);
            cursor += dylib.image.len();
            cursor = (cursor + 0xfff) & !0xfff;
        }
        layout
    }
}

#[cfg(test)]
mod tests {
    use super::builder::*;
    use super::*;

    #[test]
    fn cache_roundtrip() {
        let dylib = CachedDylibSpec {
            path: "/usr/lib/libc.dylib".into(),
            image: vec![0u8; 0x100],
            patch_exports: vec![PatchExportSpec {
                name: "_c_sym".into(),
                dylib_offset_of_impl: 0x2000,
                kind: PATCH_KIND_REGULAR,
                locations: vec![PatchLocationSpec {
                    cache_offset: 0x8000,
                    addend: 0,
                    authenticated: false,
                }],
            }],
        };
        let bytes = CacheBuilder::new(0x7fff_0000_0000).dylib(dylib).build().unwrap();
        let cache = DyldCache::parse(bytes, "test-cache").unwrap();
        assert_eq!(cache.image_count(), 1);
        assert_eq!(cache.image_path(0).unwrap(), "/usr/lib/libc.dylib");
        assert_eq!(cache.image_index_of_path("/usr/lib/libc.dylib"), Some(0));
        assert_eq!(cache.patchable_export_count(0).unwrap(), 1);
        let mut seen = Vec::new();
        cache
            .for_each_patchable_export(0, |_, export, name| {
                assert_eq!(name, "_c_sym");
                assert_eq!(export.dylib_offset_of_impl, 0x2000);
                cache.for_each_patch_location(export, |location| {
                    seen.push(location.cache_offset_of_use);
                    Ok(())
                })
            })
            .unwrap();
        assert_eq!(seen, vec![0x8000]);
    }

    #[test]
    fn non_cache_file_is_rejected() {
        assert!(DyldCache::parse(vec![0u8; 128], "bogus").is_err());
    }
}
