//! Interposing: `__interpose` sections hold `(replacement, replacee)`
//! pointer pairs. Tuples are harvested after their image's own fixups are
//! applied (so both pointers are real addresses) and rewrite every later
//! bind target, except binds made by the tuple's own image.

use crate::error::{Error, Result};
use crate::loader::{LoaderFlags, LoaderRef};
use crate::mach::constants::{SECTION_TYPE, SECT_INTERPOSE, S_INTERPOSING};
use crate::runtime::{InterposeTuple, RuntimeState};

/// Harvests the interposing tuples of one image into the global table.
/// Policy can forbid interposing entirely; images in the dyld cache never
/// contribute tuples.
pub fn collect_interpose_tuples(state: &mut RuntimeState, ldr: LoaderRef) -> Result<()> {
    if !state.config.security.allow_interposing() {
        return Ok(());
    }
    if state.loader(ldr).flags.contains(LoaderFlags::IN_DYLD_CACHE) {
        return Ok(());
    }
    let loader = state.loader(ldr);
    let mach = loader.mach_file()?;
    let preferred_base = mach.preferred_load_address();
    let mut tuples = Vec::new();
    for segment in &mach.segments {
        for section in &segment.sections {
            let is_interpose = section.flags & SECTION_TYPE == S_INTERPOSING
                || section.name == SECT_INTERPOSE;
            if !is_interpose {
                continue;
            }
            if !segment.is_writable() && !crate::loader::is_read_only_data_segment(&segment.name) {
                return Err(Error::Malformed(format!(
                    "interpose section in unexpected segment {} of '{}'",
                    segment.name, loader.path
                )));
            }
            if section.size % 16 != 0 {
                return Err(Error::Malformed(format!(
                    "interpose section of '{}' is not a whole number of tuples",
                    loader.path
                )));
            }
            let base = section.addr - preferred_base;
            for i in 0..section.size / 16 {
                let replacement = loader.image.region.read_u64(base + i * 16)?;
                let replacee = loader.image.region.read_u64(base + i * 16 + 8)?;
                if replacement == 0 || replacee == 0 {
                    continue;
                }
                tuples.push(InterposeTuple {
                    replacement: crate::fixup::strip_ptrauth(replacement),
                    replacee: crate::fixup::strip_ptrauth(replacee),
                    owner: ldr,
                });
            }
        }
    }
    drop(mach);
    if !tuples.is_empty()
        && state
            .config
            .log
            .contains(crate::config::Verbosity::INTERPOSING)
    {
        for tuple in &tuples {
            info!(
                "interpose: {:#x} replaces {:#x} (from {})",
                tuple.replacement,
                tuple.replacee,
                state.loader(ldr).path
            );
        }
    }
    state.interpose_tuples.extend(tuples);
    Ok(())
}
