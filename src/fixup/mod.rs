//! The fixup engine: once an image is mapped and its dependents are
//! loaded, set every rebase and bind location to its runtime value. Three
//! generations of metadata coexist (opcode streams, chained fixups, and
//! classic relocations); all of them funnel into the same
//! targets-then-locations application.

use core::ops::ControlFlow;
use std::sync::atomic;

use crate::error::{Error, Result};
use crate::loader::{LoaderFlags, LoaderRef};
use crate::mach::chained::{self, ChainedFixup, PointerMetadata};
use crate::mach::opcodes::{BindStream, RebaseKind};
use crate::runtime::RuntimeState;

pub mod interpose;
pub mod patch;
pub mod targets;

/// The pluggable pointer-signing primitive. Chained-fixup metadata always
/// parses its PMD bits; whether anything is actually signed is up to the
/// host. The default does nothing, which is correct everywhere ptrauth is
/// absent or disabled.
#[derive(Clone, Copy)]
pub struct Pac {
    pub sign: fn(value: u64, pmd: &PointerMetadata, location: u64) -> u64,
}

impl Pac {
    /// Parse PMD, never sign
    pub fn parse_only() -> Pac {
        Pac {
            sign: |value, _, _| value,
        }
    }
}

impl Default for Pac {
    fn default() -> Pac {
        Pac::parse_only()
    }
}

impl core::fmt::Debug for Pac {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(fmt, "Pac")
    }
}

/// Strips a ptrauth signature from a loaded pointer before it is used.
/// Hosts without ptrauth store pointers unsigned, so this is the identity.
#[inline]
pub fn strip_ptrauth(value: u64) -> u64 {
    value
}

/// Applies every fixup of one image. Images living in the dyld cache have
/// their fixups pre-applied and are skipped here; the cache patches other
/// images contribute are a separate pass ([`patch::apply_cache_patches`]).
pub fn apply_fixups(state: &mut RuntimeState, ldr: LoaderRef, pac: &Pac) -> Result<()> {
    // cache dylibs were fixed up when the cache was built; premapped
    // images are fixed up by the kernel as their pages fault in
    if state
        .loader(ldr)
        .flags
        .intersects(LoaderFlags::IN_DYLD_CACHE | LoaderFlags::IS_PREMAPPED)
    {
        return Ok(());
    }

    let bind_targets = targets::build_bind_targets(state, ldr, pac)?;

    let loader = state.loader(ldr);
    let mach = loader.mach_file()?;
    let slide = loader.slide();
    let load_address = loader.load_address();
    let log_bindings = state
        .config
        .log
        .contains(crate::config::Verbosity::BINDINGS);

    if let Some(chained) = mach.chained_fixups()? {
        // generation B: walk every chain, patching as we go; the link to
        // the next location is read before the store
        for (seg_index, starts) in chained.starts()?.iter().enumerate() {
            let starts = match starts {
                Some(starts) => starts,
                None => continue,
            };
            let mut failure = None;
            chained::for_each_chain_location(starts, loader.image.region.bytes(), |location| {
                let result = apply_chained_location(
                    loader,
                    &bind_targets,
                    location,
                    load_address,
                    slide,
                    pac,
                );
                match result {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(err) => {
                        failure = Some(err);
                        ControlFlow::Break(())
                    }
                }
            })?;
            if let Some(err) = failure {
                return Err(Error::Malformed(format!(
                    "in segment #{}: {}",
                    seg_index, err
                )));
            }
        }
    } else {
        // generation A (opcode streams) or C (classic relocations): the
        // analyzer presents both as the same rebase/bind events
        let mut failure = None;
        mach.for_each_rebase(|event| {
            let result = (|| -> Result<()> {
                match event.kind {
                    RebaseKind::Pointer => {
                        let stored = loader.image.region.read_u64(event.runtime_offset)?;
                        loader
                            .image
                            .region
                            .write_u64(event.runtime_offset, stored.wrapping_add(slide))?;
                    }
                    RebaseKind::TextAbsolute32 => {
                        let stored = loader.image.region.read_u32(event.runtime_offset)?;
                        loader.image.region.write_u32(
                            event.runtime_offset,
                            stored.wrapping_add(slide as u32),
                        )?;
                    }
                    RebaseKind::TextPcrel32 => {
                        return Err(Error::Malformed(
                            "pc-relative text rebases are not supported here".into(),
                        ));
                    }
                }
                Ok(())
            })();
            match result {
                Ok(()) => ControlFlow::Continue(()),
                Err(err) => {
                    failure = Some(err);
                    ControlFlow::Break(())
                }
            }
        })?;
        if let Some(err) = failure {
            return Err(err);
        }

        // bind targets were built in event order; replay the same order
        let mut index = 0usize;
        let mut failure = None;
        mach.for_each_bind(
            |event| {
                let result = (|| -> Result<()> {
                    let address = if event.lib_ordinal
                        == crate::mach::opcodes::BIND_SPECIAL_DYLIB_WEAK_LOOKUP
                    {
                        // the weak stream resolves through the weak-def
                        // map, not the prebuilt target list
                        bind_targets
                            .weak_address(event.symbol_name)
                            .unwrap_or_default()
                    } else {
                        let target = bind_targets.address(index).ok_or_else(|| {
                            Error::Malformed("bind event without a target".into())
                        })?;
                        index += 1;
                        target
                    };
                    let value = address.wrapping_add(event.addend as u64);
                    if log_bindings {
                        debug!(
                            "bind {}+{:#x} = {:#x} ({})",
                            loader.path, event.runtime_offset, value, event.symbol_name
                        );
                    }
                    if event.bind_type == crate::mach::opcodes::BIND_TYPE_TEXT_ABSOLUTE32 {
                        loader
                            .image
                            .region
                            .write_u32(event.runtime_offset, value as u32)
                    } else {
                        loader.image.region.write_u64(event.runtime_offset, value)
                    }
                })();
                match result {
                    Ok(()) => ControlFlow::Continue(()),
                    Err(err) => {
                        failure = Some(err);
                        ControlFlow::Break(())
                    }
                }
            },
            None,
        )?;
        if let Some(err) = failure {
            return Err(err);
        }
    }

    drop(mach);

    // publish strong defs from the weak stream and register deferred
    // flat-lazy entries now that the stores are done
    finish_weak_defs(state, ldr)?;

    // a thread that observes any export of this image must observe every
    // fixup; the release fence is the publishing store's ordering half
    atomic::fence(atomic::Ordering::Release);
    Ok(())
}

fn apply_chained_location(
    loader: &crate::loader::Loader,
    bind_targets: &targets::BindTargets,
    location: &chained::ChainLocation,
    load_address: u64,
    _slide: u64,
    pac: &Pac,
) -> Result<()> {
    let fixup = chained::decode(
        location.raw,
        location.pointer_format,
        loader.image.preferred_base,
    )?;
    let value = match fixup {
        ChainedFixup::Rebase {
            target_runtime_offset,
            pmd,
        } => {
            let target = load_address.wrapping_add(target_runtime_offset);
            let tagged = target | (u64::from(pmd.high8) << 56);
            (pac.sign)(tagged, &pmd, load_address + location.runtime_offset)
        }
        ChainedFixup::Bind {
            ordinal,
            addend,
            pmd,
        } => {
            let base = bind_targets.address(ordinal as usize).ok_or_else(|| {
                Error::Malformed(format!(
                    "chained bind ordinal {} is beyond the {} targets",
                    ordinal,
                    bind_targets.len()
                ))
            })?;
            let value = base.wrapping_add(addend as u64);
            (pac.sign)(value, &pmd, load_address + location.runtime_offset)
        }
    };
    loader.image.region.write_u64(location.runtime_offset, value)
}

/// Runs the weak-bind stream's strong-def notifications and records them
/// in the global weak-def map
fn finish_weak_defs(state: &mut RuntimeState, ldr: LoaderRef) -> Result<()> {
    let loader = state.loader(ldr);
    if !loader.flags.contains(LoaderFlags::HAS_WEAK_DEFS) {
        let mach = loader.mach_file()?;
        if mach.weak_bind_opcodes()?.is_empty() {
            return Ok(());
        }
    }
    let mach = state.loader(ldr).mach_file()?;
    let mut strong_names = Vec::new();
    {
        let opcodes = mach.weak_bind_opcodes()?;
        let segments = &mach.segments;
        let mut strong = |name: &str| strong_names.push(name.to_owned());
        crate::mach::opcodes::for_each_bind(
            opcodes,
            segments,
            mach.pointer_size(),
            BindStream::Weak,
            |_| ControlFlow::Continue(()),
            Some(&mut strong),
        )?;
    }
    drop(mach);
    for name in strong_names {
        if let Some(found) = state.search_loader_exports(
            ldr,
            &name,
            crate::loader::ExportedSymbolMode::Shallow,
        )? {
            state.publish_strong_def(&name, found.loader, found.runtime_offset);
        }
    }
    Ok(())
}

/// Seals the read-only-data segments of every loader after all fixups and
/// patches are in: `__DATA_CONST` style segments go back to read-only.
pub fn seal_read_only_regions(state: &RuntimeState) -> Result<()> {
    #[cfg(unix)]
    for loader in state.loaders() {
        for region in loader.read_only_data_regions() {
            let base = loader.load_address() + region.vm_offset;
            let len = region.vm_size as usize;
            if base % 0x1000 != 0 || len == 0 {
                continue;
            }
            let rc = unsafe {
                libc::mprotect(base as *mut libc::c_void, len, libc::PROT_READ)
            };
            if rc != 0 {
                return Err(Error::Resource(format!(
                    "cannot seal {} of '{}'",
                    region.name, loader.path
                )));
            }
        }
    }
    Ok(())
}
