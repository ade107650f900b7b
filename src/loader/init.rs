//! Initializer and terminator handling: discover them from the analyzer,
//! order them bottom-up over the dependency graph, and invoke them with
//! the launch arguments. Upward edges are never followed during ordering;
//! they get a second pass once the bottom-up walk has finished.

use core::ops::ControlFlow;

use crate::error::{Error, Result};
use crate::loader::{DependentKind, LoaderRef};
use crate::mach::InitializerKind;
use crate::runtime::RuntimeState;

/// The arguments user initializers are called with
#[derive(Debug, Clone, Copy)]
pub struct InitArgs {
    pub argc: i32,
    pub argv: *const *const libc::c_char,
    pub envp: *const *const libc::c_char,
    pub apple: *const *const libc::c_char,
}

// the pointers are only dereferenced by user code on the calling thread
unsafe impl Send for InitArgs {}

type Initializer =
    unsafe extern "C" fn(i32, *const *const libc::c_char, *const *const libc::c_char, *const *const libc::c_char);

/// Computes the bottom-up initialization order from `start`: a depth-first
/// post-order over non-upward edges, with already-begun loaders skipped,
/// then a second pass chasing any upward links that were left dangling.
pub fn initializer_order(state: &RuntimeState, start: LoaderRef) -> Vec<LoaderRef> {
    let mut order = Vec::new();
    visit(state, start, &mut order);
    // dangling upward links: anything reachable that the first pass could
    // not enter because its target was mid-initialization at the time
    let mut upward_targets = Vec::new();
    for ldr in &order {
        for edge in &state.loader(*ldr).dependents {
            if edge.kind == DependentKind::Upward {
                if let Some(target) = edge.loader {
                    upward_targets.push(target);
                }
            }
        }
    }
    for target in upward_targets {
        visit(state, target, &mut order);
    }
    order
}

fn visit(state: &RuntimeState, ldr: LoaderRef, order: &mut Vec<LoaderRef>) {
    if !state.begin_initializers(ldr) {
        return;
    }
    let edges: Vec<_> = state
        .loader(ldr)
        .dependents
        .iter()
        .filter(|edge| edge.kind != DependentKind::Upward)
        .filter_map(|edge| edge.loader)
        .collect();
    for dependent in edges {
        visit(state, dependent, order);
    }
    order.push(ldr);
}

/// Collects a loader's initializers as runtime offsets, in the order they
/// must run: `LC_ROUTINES` first, then the init-pointer and init-offset
/// sections. Pointer sections are read from the mapped region, so fixups
/// must already be applied.
pub fn gather_initializers(state: &RuntimeState, ldr: LoaderRef) -> Result<Vec<u64>> {
    let loader = state.loader(ldr);
    let mach = loader.mach_file()?;
    let preferred_base = mach.preferred_load_address();
    let load_address = loader.load_address();
    let mut offsets = Vec::new();
    let mut failure = None;
    mach.for_each_initializer_source(|kind, section| {
        let result = match kind {
            InitializerKind::Routine { init_address } => {
                offsets.push(init_address - preferred_base);
                Ok(())
            }
            InitializerKind::PointerSection => {
                let slot_base = section.addr - preferred_base;
                let count = section.size / 8;
                (0..count).try_for_each(|i| {
                    let pointer = loader.image.region.read_u64(slot_base + i * 8)?;
                    let pointer = crate::fixup::strip_ptrauth(pointer);
                    offsets.push(pointer.wrapping_sub(load_address));
                    Ok(())
                })
            }
            InitializerKind::OffsetSection => {
                let slot_base = section.addr - preferred_base;
                let count = section.size / 4;
                (0..count).try_for_each(|i| {
                    let offset = loader.image.region.read_u32(slot_base + i * 4)?;
                    offsets.push(u64::from(offset));
                    Ok(())
                })
            }
        };
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
    // every initializer must land inside an executable region
    for &offset in &offsets {
        let executable = loader.image.regions.iter().any(|region| {
            region.init_prot.is_executable()
                && offset >= region.vm_offset
                && offset < region.vm_offset + region.vm_size
        });
        if !executable {
            return Err(Error::Malformed(format!(
                "initializer at offset {:#x} of '{}' is not in an executable segment",
                offset, loader.path
            )));
        }
    }
    Ok(offsets)
}

/// Collects a loader's terminator offsets. They are only registered at
/// load time; they run at process exit in reverse initialization order.
pub fn gather_terminators(state: &RuntimeState, ldr: LoaderRef) -> Result<Vec<u64>> {
    let loader = state.loader(ldr);
    let mach = loader.mach_file()?;
    let preferred_base = mach.preferred_load_address();
    let load_address = loader.load_address();
    let mut offsets = Vec::new();
    let mut failure = None;
    mach.for_each_terminator_source(|section| {
        let slot_base = section.addr - preferred_base;
        let count = section.size / 8;
        let result = (0..count).try_for_each(|i| {
            let pointer = loader.image.region.read_u64(slot_base + i * 8)?;
            let pointer = crate::fixup::strip_ptrauth(pointer);
            offsets.push(pointer.wrapping_sub(load_address));
            Ok(())
        });
        match result {
            Ok(()) => ControlFlow::Continue(()),
            Err(err) => {
                failure = Some(err);
                ControlFlow::Break(())
            }
        }
    })?;
    match failure {
        Some(err) => Err(err),
        None => Ok(offsets),
    }
}

/// Runs one loader's initializers.
///
/// # Safety
/// The image must be fully fixed up and its initializer offsets must name
/// real functions with the expected C ABI. This transfers control to user
/// code, which may do anything.
pub unsafe fn run_initializers(
    state: &RuntimeState,
    ldr: LoaderRef,
    args: &InitArgs,
) -> Result<()> {
    let offsets = gather_initializers(state, ldr)?;
    let loader = state.loader(ldr);
    for offset in offsets {
        if state
            .config
            .log
            .contains(crate::config::Verbosity::INITIALIZERS)
        {
            info!("running initializer {:#x} in {}", offset, loader.path);
        }
        let address = loader.address_of(offset);
        let func: Initializer = core::mem::transmute(address as usize);
        func(args.argc, args.argv, args.envp, args.apple);
    }
    state.note_initialized(ldr);
    Ok(())
}
