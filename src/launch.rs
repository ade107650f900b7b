//! The launch driver. The kernel hands over a stack block and a mapped
//! main executable; everything between that and the jump to `main` lives
//! here: build the process config, load the program and its graph, map the
//! inserted libraries, apply fixups and cache patches, set up
//! thread-locals, and order the initializers bottom-up.

use std::path::Path;

use crate::config::{AmfiFlags, KernelArgs, ProcessConfig};
use crate::error::{Error, Result};
use crate::fixup::{self, Pac};
use crate::helpers::HelpersSlot;
use crate::loader::init::{self, InitArgs};
use crate::loader::jit::{self, LoadOptions};
use crate::loader::LoaderRef;
use crate::mach::{fat, EntryInfo, MachFile};
use crate::runtime::RuntimeState;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
/// Where control goes once initializers have run
pub enum EntryPoint {
    /// `LC_MAIN`: call this address like `main` and exit with its result
    Main { address: u64, stack_size: u64 },
    /// `LC_UNIXTHREAD`: jump with the stack the kernel built
    UnixThread { address: u64 },
    /// `DYLD_SKIP_MAIN`: return to the caller without entering user code
    SkipMain,
}

#[derive(Debug)]
/// A fully prepared process: loaded, fixed up, ordered, ready to enter
pub struct Launch {
    pub state: RuntimeState,
    pub main: LoaderRef,
    /// inserted-library roots, in `DYLD_INSERT_LIBRARIES` order
    pub inserted: Vec<LoaderRef>,
    pub entry: EntryPoint,
    /// bottom-up initializer order across the whole graph
    pub init_order: Vec<LoaderRef>,
}

/// Picks the loadable slice of a possibly-fat main executable without a
/// config to consult: the slice's own arch decides the process arch.
fn main_slice(bytes: &[u8]) -> Result<Vec<u8>> {
    if !fat::is_fat(bytes) {
        MachFile::parse(bytes)?;
        return Ok(bytes.to_vec());
    }
    for arch in fat::FatArch::parse(bytes)? {
        let slice = arch.slice(bytes)?;
        if MachFile::parse(slice).is_ok() {
            return Ok(slice.to_vec());
        }
    }
    Err(Error::Incompatible(
        "fat main executable has no parseable slice".into(),
    ))
}

/// Builds the process configuration and loads the whole launch graph.
/// `amfi` is the policy verdict for the main executable; tests and embedded
/// hosts pass [`AmfiFlags::unrestricted`].
pub fn prepare(args: KernelArgs, amfi: AmfiFlags, internal_install: bool) -> Result<Launch> {
    let main_path = args
        .apple("executable_path")
        .map(str::to_owned)
        .or_else(|| args.argv.first().cloned())
        .ok_or_else(|| Error::Malformed("no main executable path in the kernel args".into()))?;
    let raw = std::fs::read(Path::new(&main_path))?;
    let main_bytes = main_slice(&raw)?;
    let main_mach = MachFile::parse(&main_bytes)?;
    let config = ProcessConfig::new(&args, &main_mach, amfi, internal_install)?;
    drop(main_mach);
    prepare_with_config(config, main_bytes, &main_path)
}

/// The body of [`prepare`], entered directly by tests that synthesize
/// their config and main-executable bytes
pub fn prepare_with_config(
    config: ProcessConfig,
    main_bytes: Vec<u8>,
    main_path: &str,
) -> Result<Launch> {
    let mut state = RuntimeState::new(config);
    let pac = Pac::parse_only();

    // the program itself is loader #0
    let main = jit::load_from_bytes(
        &mut state,
        main_bytes,
        main_path,
        LoadOptions {
            is_main_executable: true,
            never_unload: true,
        },
    )?;

    // DYLD_INSERT_LIBRARIES are force-loaded before the graph is wired
    let inserted_paths = state.config.path_overrides.insert_libraries.clone();
    let allow_failed_insertion = state
        .config
        .security
        .amfi
        .contains(AmfiFlags::ALLOW_FAILED_LIBRARY_INSERTION);
    let mut inserted = Vec::new();
    for path in inserted_paths {
        match jit::load_from_file(
            &mut state,
            Path::new(&path),
            LoadOptions {
                is_main_executable: false,
                never_unload: true,
            },
        ) {
            Ok(ldr) => inserted.push(ldr),
            Err(err) if allow_failed_insertion => {
                warn!("could not insert '{}': {}", path, err);
            }
            Err(err) => return Err(err),
        }
    }

    // wire the dependency graph, main first then each inserted root
    jit::load_dependents(&mut state, main)?;
    for &root in &inserted {
        jit::load_dependents(&mut state, root)?;
    }

    // interpose tuples must be in the table before any other image's bind
    // targets are computed, so images carrying an __interpose section are
    // fixed up first (their own binds see no tuples, which is also what
    // keeps an image from interposing itself), harvested, and only then is
    // the rest of the graph fixed up
    let all_loaders: Vec<LoaderRef> = state.loaders().map(|l| l.this).collect();
    let mut interposers = Vec::new();
    let mut others = Vec::new();
    for &ldr in &all_loaders {
        if has_interpose_section(&state, ldr)? {
            interposers.push(ldr);
        } else {
            others.push(ldr);
        }
    }
    for &ldr in &interposers {
        fixup::apply_fixups(&mut state, ldr, &pac)?;
        fixup::interpose::collect_interpose_tuples(&mut state, ldr)?;
    }
    for &ldr in &others {
        fixup::apply_fixups(&mut state, ldr, &pac)?;
    }

    // roots over cached dylibs rewrite the cache's bindings to them
    fixup::patch::apply_cache_patches(&mut state, &pac)?;

    fixup::seal_read_only_regions(&state)?;

    // initializers: inserted roots first, then the program's graph; the
    // begin-marks keep shared subgraphs from appearing twice
    let mut init_order = Vec::new();
    for &root in &inserted {
        init_order.extend(init::initializer_order(&state, root));
    }
    init_order.extend(init::initializer_order(&state, main));

    let entry = entry_point(&state, main)?;
    Ok(Launch {
        state,
        main,
        inserted,
        entry,
        init_order,
    })
}

fn has_interpose_section(state: &RuntimeState, ldr: LoaderRef) -> Result<bool> {
    use crate::mach::constants::{SECTION_TYPE, SECT_INTERPOSE, S_INTERPOSING};
    let mach = state.loader(ldr).mach_file()?;
    let mut found = false;
    mach.for_each_section(|section| {
        if section.flags & SECTION_TYPE == S_INTERPOSING || section.name == SECT_INTERPOSE {
            found = true;
            return core::ops::ControlFlow::Break(());
        }
        core::ops::ControlFlow::Continue(())
    });
    Ok(found)
}

fn entry_point(state: &RuntimeState, main: LoaderRef) -> Result<EntryPoint> {
    if state.config.security.skip_main {
        return Ok(EntryPoint::SkipMain);
    }
    let loader = state.loader(main);
    let mach = loader.mach_file()?;
    match mach.entry {
        Some(EntryInfo::Main {
            entry_offset,
            stack_size,
        }) => Ok(EntryPoint::Main {
            address: loader.load_address() + entry_offset,
            stack_size,
        }),
        Some(EntryInfo::UnixThread { pc }) => Ok(EntryPoint::UnixThread {
            address: pc.wrapping_add(loader.slide()),
        }),
        None => Err(Error::Malformed(format!(
            "'{}' has no entry point",
            loader.path
        ))),
    }
}

impl Launch {
    /// Registers the thread-local images once libSystem has published its
    /// helpers (the `_dyld_initializer` callback ends up here)
    pub fn set_up_thread_locals(&self, slot: &HelpersSlot) -> Result<()> {
        let runtime = crate::tlv::initialize(slot)?;
        for loader in self.state.loaders() {
            runtime.set_up_image(loader)?;
        }
        Ok(())
    }

    /// Runs every initializer bottom-up and returns the entry point.
    ///
    /// # Safety
    /// Transfers control to user code in the loaded images.
    pub unsafe fn run_initializers(&self, args: &InitArgs) -> Result<EntryPoint> {
        self.state.with_loader_lock(|| {
            for &ldr in &self.init_order {
                unsafe { init::run_initializers(&self.state, ldr, args)? };
            }
            Ok(self.entry)
        })
    }
}
