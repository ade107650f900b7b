//! Bind-target collection: before any location is written, every bind
//! record of an image is resolved into a dense array of runtime addresses.
//! Chained images index it by import ordinal; opcode and classic images
//! consume it in the order their bind events appear.

use core::ops::ControlFlow;
use std::collections::HashMap;

use crate::error::Result;
use crate::fixup::Pac;
use crate::loader::{LoaderRef, ResolvedSymbol};
use crate::mach::opcodes::BIND_SPECIAL_DYLIB_WEAK_LOOKUP;
use crate::runtime::RuntimeState;

#[derive(Debug, Clone)]
/// One resolved bind record
pub struct BindTargetEntry {
    pub name: String,
    pub resolved: ResolvedSymbol,
    pub address: u64,
    pub weak_import: bool,
}

#[derive(Debug, Default)]
/// The per-image resolved bind targets
pub struct BindTargets {
    entries: Vec<BindTargetEntry>,
    /// weak-stream names resolved through the weak-def map
    weak: HashMap<String, u64>,
}

impl BindTargets {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn address(&self, index: usize) -> Option<u64> {
        self.entries.get(index).map(|entry| entry.address)
    }

    pub fn entry(&self, index: usize) -> Option<&BindTargetEntry> {
        self.entries.get(index)
    }

    pub fn weak_address(&self, name: &str) -> Option<u64> {
        self.weak.get(name).copied()
    }
}

struct PendingBind {
    lib_ordinal: i32,
    name: String,
    weak_import: bool,
    lazy: bool,
    addend: i64,
}

/// Resolves every bind record of `ldr` into addresses, interposition
/// applied. For chained images the list is the imports table in ordinal
/// order (import addends folded in); otherwise it is the bind events of
/// the regular and lazy streams in emission order.
pub fn build_bind_targets(
    state: &mut RuntimeState,
    ldr: LoaderRef,
    _pac: &Pac,
) -> Result<BindTargets> {
    let mach = state.loader(ldr).mach_file()?;
    let mut pending = Vec::new();
    let mut weak_names = Vec::new();

    if mach.has_chained_fixups() {
        mach.for_each_chained_target(|_, import| {
            pending.push(PendingBind {
                lib_ordinal: import.lib_ordinal,
                name: import.name.to_owned(),
                weak_import: import.weak_import,
                lazy: false,
                addend: import.addend,
            });
            ControlFlow::Continue(())
        })?;
    } else {
        mach.for_each_bind(
            |event| {
                if event.lib_ordinal == BIND_SPECIAL_DYLIB_WEAK_LOOKUP {
                    weak_names.push(event.symbol_name.to_owned());
                } else {
                    pending.push(PendingBind {
                        lib_ordinal: event.lib_ordinal,
                        name: event.symbol_name.to_owned(),
                        weak_import: event.weak_import,
                        lazy: event.lazy,
                        // the event addend is applied at the location, not
                        // folded into the target
                        addend: 0,
                    });
                }
                ControlFlow::Continue(())
            },
            None,
        )?;
    }
    drop(mach);

    let mut targets = BindTargets::default();
    for bind in pending {
        let resolved = state.resolve_symbol(
            ldr,
            bind.lib_ordinal,
            &bind.name,
            bind.weak_import,
            bind.lazy,
        )?;
        let address = resolved_address(state, ldr, &resolved)
            .wrapping_add(bind.addend as u64);
        let address = state.apply_interposing(address, ldr);
        targets.entries.push(BindTargetEntry {
            name: bind.name,
            resolved,
            address,
            weak_import: bind.weak_import,
        });
    }
    for name in weak_names {
        if targets.weak.contains_key(&name) {
            continue;
        }
        let resolved =
            state.resolve_symbol(ldr, BIND_SPECIAL_DYLIB_WEAK_LOOKUP, &name, false, false)?;
        let address = resolved_address(state, ldr, &resolved);
        let address = state.apply_interposing(address, ldr);
        targets.weak.insert(name, address);
    }
    Ok(targets)
}

/// Converts a resolution into the address that gets stored
pub fn resolved_address(state: &RuntimeState, client: LoaderRef, resolved: &ResolvedSymbol) -> u64 {
    match resolved {
        ResolvedSymbol::Rebase { runtime_offset } => {
            state.loader(client).address_of(*runtime_offset)
        }
        ResolvedSymbol::BindToImage {
            loader,
            runtime_offset,
            is_missing_flat_lazy,
            ..
        } => {
            if *is_missing_flat_lazy {
                // first use must abort with the saved name
                crate::runtime::missing_flat_lazy_abort as usize as u64
            } else {
                state.loader(*loader).address_of(*runtime_offset)
            }
        }
        ResolvedSymbol::BindAbsolute { value } => *value,
    }
}
