//! Cache patching: when a dylib loaded from disk has the same install name
//! as a dylib baked into the shared cache, every cached location that used
//! to bind to the cached copy must be rewritten to point at the root. The
//! cache ships a patch table enumerating those locations per patchable
//! export; the root builds its own table saying where each export now
//! lives.

use crate::cache::{
    CachePatchableLocation, PATCH_KIND_OBJC_CLASS, PATCH_KIND_REGULAR, PATCH_KIND_SINGLETON,
    PATCH_KIND_WEAK_IMPORT,
};
use crate::error::{Error, Result};
use crate::fixup::Pac;
use crate::loader::{ExportedSymbolMode, LoaderRef};
use crate::runtime::RuntimeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// One entry of a root's override patch table, by patchable-export index
/// of the overridden cached dylib
pub enum DylibPatch {
    /// the root exports the symbol at this runtime offset
    Offset(u64),
    /// weak import the root does not export: patch sites get null
    MissingWeakImport,
    /// non-weak export the root dropped: patch sites get the trap
    MissingSymbol,
    /// an Objective-C class; applied only under the class restrictions
    ObjcClass(u64),
    /// a shared singleton object; applied only when the layouts agree
    Singleton(u64),
}

#[derive(Debug, Clone, Default)]
/// The override patch table of one root
pub struct DylibPatchTable {
    pub cache_index: u32,
    pub patches: Vec<DylibPatch>,
}

/// Where patched-out symbols point; calling one is fatal
pub extern "C" fn missing_patch_target_abort() {
    error!("symbol missing: it was dropped by a root overriding a cached dylib");
    std::process::abort();
}

/// Builds the patch table for every loader that overrides a cached dylib
/// and does not have one yet. Runs after a root's dependents are attached.
pub fn build_override_patch_tables(state: &mut RuntimeState) -> Result<()> {
    let pending: Vec<(LoaderRef, u32)> = state
        .loaders()
        .filter(|loader| loader.patch_table.is_none())
        .filter_map(|loader| {
            loader
                .override_of_cache_index
                .map(|index| (loader.this, index))
        })
        .collect();
    for (ldr, cache_index) in pending {
        let mut exports = Vec::new();
        {
            let cache = match &state.config.dyld_cache {
                Some(cache) => cache,
                None => continue,
            };
            cache.for_each_patchable_export(cache_index, |_, export, name| {
                exports.push((name.to_owned(), export.kind));
                Ok(())
            })?;
        }
        let mut patches = Vec::with_capacity(exports.len());
        for (name, kind) in exports {
            let found =
                state.search_loader_exports(ldr, &name, ExportedSymbolMode::StaticLink)?;
            let patch = match (found, kind) {
                (Some(found), PATCH_KIND_OBJC_CLASS) => {
                    DylibPatch::ObjcClass(found.runtime_offset)
                }
                (Some(found), PATCH_KIND_SINGLETON) => {
                    DylibPatch::Singleton(found.runtime_offset)
                }
                (Some(found), _) => DylibPatch::Offset(found.runtime_offset),
                (None, PATCH_KIND_WEAK_IMPORT) => DylibPatch::MissingWeakImport,
                (None, _) => {
                    warn!(
                        "root '{}' drops patchable export '{}'",
                        state.loader(ldr).path,
                        name
                    );
                    DylibPatch::MissingSymbol
                }
            };
            patches.push(patch);
        }
        state.loader_mut(ldr).patch_table = Some(DylibPatchTable {
            cache_index,
            patches,
        });
    }
    Ok(())
}

/// Whether an override class is eligible for the objc class patch: its
/// `__objc_classlist` must carry a self-bound pointer to the class
fn objc_class_is_self_bound(
    loader: &crate::loader::Loader,
    class_offset: u64,
) -> Result<bool> {
    let mach = loader.mach_file()?;
    let preferred_base = mach.preferred_load_address();
    let class_address = loader.address_of(class_offset);
    for seg in ["__DATA", "__DATA_CONST"] {
        if let Some(section) = mach.section(seg, crate::mach::constants::SECT_OBJC_CLASSLIST) {
            let base = section.addr - preferred_base;
            for i in 0..section.size / 8 {
                let entry = loader.image.region.read_u64(base + i * 8)?;
                if crate::fixup::strip_ptrauth(entry) == class_address {
                    return Ok(true);
                }
            }
        }
    }
    Ok(false)
}

/// Applies every root's patch table to the shared cache: each cached
/// location that bound to an overridden export is rewritten to the root's
/// implementation, under the scoped cache writer.
pub fn apply_cache_patches(state: &mut RuntimeState, pac: &Pac) -> Result<()> {
    let roots: Vec<LoaderRef> = state
        .loaders()
        .filter(|loader| loader.patch_table.is_some())
        .map(|loader| loader.this)
        .collect();
    if roots.is_empty() {
        return Ok(());
    }
    for root in roots {
        // phase 1: read the patch sites per export, immutably
        struct Site {
            location: CachePatchableLocation,
            patch: DylibPatch,
            cached_impl_offset: u32,
        }
        let mut sites = Vec::new();
        {
            let loader = state.loader(root);
            let table = loader.patch_table.as_ref().unwrap();
            let cache = match &state.config.dyld_cache {
                Some(cache) => cache,
                None => continue,
            };
            let patches = table.patches.clone();
            let mut export_index = 0usize;
            cache.for_each_patchable_export(table.cache_index, |_, export, _| {
                let patch = patches.get(export_index).copied().ok_or_else(|| {
                    Error::Malformed("override patch table is shorter than the cache's".into())
                })?;
                export_index += 1;
                cache.for_each_patch_location(export, |location| {
                    sites.push(Site {
                        location: *location,
                        patch,
                        cached_impl_offset: export.dylib_offset_of_impl,
                    });
                    Ok(())
                })
            })?;
        }

        // phase 2: decide values, applying the special-case restrictions
        let mut writes = Vec::with_capacity(sites.len());
        {
            let loader = state.loader(root);
            let cache = state.config.dyld_cache.as_ref().unwrap();
            let cache_image_offset = cache.image_vm_offset(
                loader.patch_table.as_ref().unwrap().cache_index,
            )?;
            for site in &sites {
                let value = match site.patch {
                    DylibPatch::Offset(offset) => Some(loader.address_of(offset)),
                    DylibPatch::MissingWeakImport => Some(0),
                    DylibPatch::MissingSymbol => {
                        Some(missing_patch_target_abort as usize as u64)
                    }
                    DylibPatch::ObjcClass(offset) => {
                        if objc_class_is_self_bound(loader, offset)? {
                            Some(loader.address_of(offset))
                        } else {
                            debug!(
                                "skipping objc class patch at cache offset {:#x}",
                                site.location.cache_offset_of_use
                            );
                            None
                        }
                    }
                    DylibPatch::Singleton(offset) => {
                        // the singleton is only swapped when the override
                        // object's head matches the cached layout
                        let cached_head = cache.read_u64(
                            cache_image_offset + u64::from(site.cached_impl_offset),
                        )?;
                        let override_head = loader.image.region.read_u64(offset)?;
                        if cached_head == override_head {
                            Some(loader.address_of(offset))
                        } else {
                            debug!(
                                "skipping singleton patch at cache offset {:#x}",
                                site.location.cache_offset_of_use
                            );
                            None
                        }
                    }
                };
                if let Some(base) = value {
                    let value = if base == 0 {
                        0
                    } else {
                        base.wrapping_add(site.location.addend as u64)
                    };
                    let pmd = site.location.pmd();
                    let signed = (pac.sign)(value, &pmd, site.location.cache_offset_of_use);
                    writes.push((site.location.cache_offset_of_use, signed));
                }
            }
        }

        // phase 3: store, with the cache writable for the duration
        let (config, _loaders) = state.config_and_loaders_mut();
        let cache = config.dyld_cache.as_mut().unwrap();
        cache.with_writable(|cache| {
            for (offset, value) in &writes {
                cache.write_u64(*offset, *value)?;
            }
            Ok(())
        })?;
    }
    Ok(())
}
