//! The just-in-time loader: open a file, pick the right slice, validate
//! it, map its segments, and wire its dependency edges by running the path
//! resolver over every `LC_LOAD_*_DYLIB`.

use std::collections::HashSet;
use std::fs;
use std::path::Path;

use crate::error::{Error, Result};
use crate::loader::{
    is_read_only_data_segment, Dependent, DependentKind, FileId, ImageSource, Loader, LoaderFlags,
    LoaderKind, LoaderRef, MappedImage, RegionInfo, RegionMemory,
};
use crate::mach::validate::{ValidationPolicy, LOADABLE_FILETYPES};
use crate::mach::MachFile;
use crate::paths::{LoadChain, ResolveOptions};
use crate::runtime::RuntimeState;

#[derive(Debug, Clone, Copy, Default)]
/// Options for one load request
pub struct LoadOptions {
    /// the image being loaded is the program itself
    pub is_main_executable: bool,
    /// the image may never be unloaded (inserted libraries, main)
    pub never_unload: bool,
}

/// Opens and maps an image from disk, appending its loader to the arena.
/// Dependents are not loaded yet.
pub fn load_from_file(
    state: &mut RuntimeState,
    path: &Path,
    options: LoadOptions,
) -> Result<LoaderRef> {
    let file = fs::File::open(path).map_err(Error::IO)?;
    let mapped = unsafe { memmap2::Mmap::map(&file) }
        .map_err(|err| Error::Resource(format!("cannot map '{}': {}", path.display(), err)))?;
    let slice = crate::mach::fat::best_slice(&mapped, &state.config.process.archs, false)?;
    // fat files need the slice copied out so the loader owns exactly one
    // architecture; thin files keep the whole mapping
    let source = if slice.len() == mapped.len() {
        ImageSource::Mapped(mapped)
    } else {
        ImageSource::Owned(slice.to_vec())
    };
    construct(state, source, &path.to_string_lossy(), options)
}

/// Builds a loader from bytes already in memory (synthesized images,
/// kernel-premapped delivery)
pub fn load_from_bytes(
    state: &mut RuntimeState,
    bytes: Vec<u8>,
    path: &str,
    options: LoadOptions,
) -> Result<LoaderRef> {
    construct(state, ImageSource::Owned(bytes), path, options)
}

/// Builds a loader for an image the kernel delivered already mapped and
/// fixed up (page-in linking); the engine leaves its fixups alone
pub fn load_premapped(
    state: &mut RuntimeState,
    bytes: Vec<u8>,
    path: &str,
    options: LoadOptions,
) -> Result<LoaderRef> {
    let ldr = construct(state, ImageSource::Owned(bytes), path, options)?;
    let loader = state.loader_mut(ldr);
    loader.kind = crate::loader::LoaderKind::Premapped;
    loader.flags |= LoaderFlags::IS_PREMAPPED;
    Ok(ldr)
}

fn construct(
    state: &mut RuntimeState,
    source: ImageSource,
    path: &str,
    options: LoadOptions,
) -> Result<LoaderRef> {
    let mach = MachFile::parse(source.bytes())?;
    let policy = ValidationPolicy {
        path,
        archs: &state.config.process.archs,
        platform: state.config.process.platform,
        os_version: state.config.process.os_version,
        is_os_binary: false,
        internal_install: state.config.security.internal_install,
        filetypes: if options.is_main_executable {
            crate::mach::validate::MAIN_EXECUTABLE_FILETYPES
        } else {
            LOADABLE_FILETYPES
        },
    };
    mach.validate(&policy)?;

    // one contiguous span; each segment lands at its vmaddr delta, file
    // bytes first, zero-fill tail already zeroed by the fresh mapping
    let preferred_base = mach.preferred_load_address();
    let span = mach.vm_span()?;
    let mut region = RegionMemory::allocate(span as usize)?;
    let mut regions = Vec::new();
    for segment in &mach.segments {
        if segment.vmaddr < preferred_base {
            continue; // __PAGEZERO
        }
        let vm_offset = segment.vmaddr - preferred_base;
        if segment.filesize > 0 {
            let start = segment.fileoff as usize;
            let end = start + segment.filesize as usize;
            region.copy_in(vm_offset as usize, &source.bytes()[start..end])?;
        }
        regions.push(RegionInfo {
            name: segment.name.clone(),
            vm_offset,
            vm_size: segment.vmsize,
            file_size: segment.filesize,
            init_prot: segment.init_prot,
            read_only_data: is_read_only_data_segment(&segment.name),
            is_zero_fill: segment.is_zero_fill(),
        });
        if state.config.log.contains(crate::config::Verbosity::SEGMENTS) {
            info!(
                "segment {} of {}: offset {:#x} size {:#x}",
                segment.name, path, vm_offset, segment.vmsize
            );
        }
    }

    let mut flags = LoaderFlags::empty();
    if mach.header.in_dyld_cache() {
        flags |= LoaderFlags::IN_DYLD_CACHE | LoaderFlags::NEVER_UNLOAD;
    }
    if mach.has_objc() {
        flags |= LoaderFlags::HAS_OBJC;
        // objc images are never unloaded once the runtime has seen them
        flags |= LoaderFlags::LEAVE_MAPPED;
    }
    if mach.may_have_plus_load() {
        flags |= LoaderFlags::MAY_HAVE_PLUS_LOAD;
    }
    if mach.has_weak_defs() {
        flags |= LoaderFlags::HAS_WEAK_DEFS;
    }
    if mach.has_thread_locals() {
        flags |= LoaderFlags::HAS_THREAD_LOCALS;
    }
    if mach.uuid.is_some() {
        flags |= LoaderFlags::HAS_UUID;
    }
    if regions.iter().any(|r| r.read_only_data) {
        flags |= LoaderFlags::HAS_READ_ONLY_DATA;
    }
    if options.never_unload || options.is_main_executable {
        flags |= LoaderFlags::NEVER_UNLOAD;
    }
    // binaries linked before chained fixups shipped get classic fallback
    // path behavior
    if !mach.has_chained_fixups() {
        flags |= LoaderFlags::PRE_2022_BINARY;
    }

    let cd_hash = mach.cd_hash()?;
    let file_id = FileId::for_file(Path::new(path), cd_hash);

    let install_name = mach.install_name.clone();
    let uuid = mach.uuid.unwrap_or_default();
    let cpusubtype = mach.header.cpusubtype;
    let rpaths = mach.rpaths.clone();
    let dependents_count = mach.dependents.len();
    drop(mach);

    // a dylib loaded from disk whose install name is in the shared cache
    // is a root: cached clients must be patched to use it
    let override_of_cache_index = install_name
        .as_deref()
        .filter(|_| state.config.dyld_cache.is_some())
        .and_then(|name| state.config.cached_dylib_index(name));
    if override_of_cache_index.is_some() {
        state.config.note_found_cache_root();
    }

    // the real path is what later loads are deduplicated against
    let normalized = match std::fs::canonicalize(path) {
        Ok(real) => real.to_string_lossy().into_owned(),
        Err(_) => crate::paths::normalize(path),
    };
    let ldr = state.push_loader(move |this| {
        Ok(Loader {
            kind: LoaderKind::JustInTime,
            magic: super::LOADER_MAGIC,
            this,
            flags,
            uuid,
            cpusubtype,
            path: normalized,
            install_name,
            file_id,
            dependents: Vec::with_capacity(dependents_count),
            rpaths,
            image: MappedImage {
                source,
                region,
                regions,
                preferred_base,
            },
            override_of_cache_index,
            patch_table: None,
        })
    })?;
    if state.config.log.contains(crate::config::Verbosity::LIBRARIES) {
        info!("loaded {} at {:#x}", path, state.loader(ldr).load_address());
    }
    Ok(ldr)
}

/// Walks `LC_LOAD_*_DYLIB` of `ldr` in declaration order, resolving and
/// loading each dependent, then recurses. Weak-link edges that cannot be
/// resolved become null dependents; anything else that fails aborts the
/// load with a "Library not loaded" error.
pub fn load_dependents(state: &mut RuntimeState, ldr: LoaderRef) -> Result<()> {
    let mut visited = HashSet::new();
    load_dependents_recursive(state, ldr, &mut vec![ldr], &mut visited)?;
    crate::fixup::patch::build_override_patch_tables(state)?;
    Ok(())
}

fn load_dependents_recursive(
    state: &mut RuntimeState,
    ldr: LoaderRef,
    chain: &mut Vec<LoaderRef>,
    visited: &mut HashSet<LoaderRef>,
) -> Result<()> {
    if !visited.insert(ldr) {
        return Ok(());
    }
    let mach = state.loader(ldr).mach_file()?;
    let requests: Vec<_> = mach.dependents.clone();
    drop(mach);

    // first attach every first-level dependent
    let mut attached = Vec::new();
    for request in &requests {
        let kind = if request.upward {
            DependentKind::Upward
        } else if request.reexport {
            DependentKind::Reexport
        } else if request.weak {
            DependentKind::WeakLink
        } else {
            DependentKind::Regular
        };
        let found = resolve_and_load(state, ldr, chain, &request.path);
        let loader = match found {
            Ok(dependent) => Some(dependent),
            Err(err) => {
                if kind == DependentKind::WeakLink {
                    debug!(
                        "weak-linked '{}' not loaded for {}",
                        request.path,
                        state.loader(ldr).path
                    );
                    None
                } else {
                    return Err(library_not_loaded(state, ldr, &request.path, err));
                }
            }
        };
        state
            .loader_mut(ldr)
            .dependents
            .push(Dependent { kind, loader });
        attached.push(loader);
    }

    // then recurse into each of them
    for dependent in attached.into_iter().flatten() {
        chain.push(dependent);
        let result = load_dependents_recursive(state, dependent, chain, visited);
        chain.pop();
        result?;
    }
    Ok(())
}

/// Resolves one load request to a loader, reusing images already in the
/// arena before touching the resolver
fn resolve_and_load(
    state: &mut RuntimeState,
    client: LoaderRef,
    chain: &[LoaderRef],
    request: &str,
) -> Result<LoaderRef> {
    if request.starts_with('/') {
        if let Some(existing) = state.find_loader(request) {
            return Ok(existing);
        }
    }

    // rpaths accumulate along the load chain, closest image first
    let rpath_storage: Vec<Vec<String>> = chain
        .iter()
        .rev()
        .map(|&link| state.loader(link).rpaths.clone())
        .collect();
    let rpath_stack: Vec<&[String]> = rpath_storage.iter().map(|v| v.as_slice()).collect();
    let client_path = state.loader(client).path.clone();
    let loader_dir = match client_path.rfind('/') {
        Some(0) => "/".to_owned(),
        Some(index) => client_path[..index].to_owned(),
        None => ".".to_owned(),
    };
    let load_chain = LoadChain {
        loader_dir: Some(&loader_dir),
        rpath_stack,
    };
    let options = ResolveOptions {
        use_fallback_paths: state
            .loader(client)
            .flags
            .contains(LoaderFlags::PRE_2022_BINARY),
        weak: false,
    };

    // the resolver probes candidates; only paths that really are files
    // come back to be loaded
    let mut candidate_hits = Vec::new();
    {
        let config = &state.config;
        config.resolve_dylib(request, &load_chain, options, |candidate| {
            let path = Path::new(candidate);
            if path.is_file() {
                candidate_hits.push(candidate.to_owned());
                Some(())
            } else {
                None
            }
        })?;
    }
    let winner = candidate_hits
        .pop()
        .expect("resolver succeeded without a candidate");
    let winner = match std::fs::canonicalize(&winner) {
        Ok(real) => real.to_string_lossy().into_owned(),
        Err(_) => winner,
    };
    if let Some(existing) = state.find_loader(&winner) {
        return Ok(existing);
    }
    load_from_file(state, Path::new(&winner), LoadOptions::default())
}

/// Wraps a dependent-load failure in the structured "Library not loaded"
/// error, carrying the client image and its UUID, plus the newer-SDK
/// addendum when that is what went wrong
fn library_not_loaded(
    state: &RuntimeState,
    client: LoaderRef,
    request: &str,
    cause: Error,
) -> Error {
    let loader = state.loader(client);
    let uuid = loader
        .uuid
        .iter()
        .map(|b| format!("{:02x}", b))
        .collect::<String>();
    let mut detail = match &cause {
        Error::DylibMissing { detail, .. } => detail.clone(),
        other => other.to_string(),
    };
    if matches!(&cause, Error::Incompatible(msg) if msg.contains("requires")) {
        detail.push_str(" (built against a newer SDK than the running system)");
    }
    Error::DylibMissing {
        path: request.to_owned(),
        client: format!("{} <{}>", loader.path, uuid),
        detail,
    }
}
