//! Process-wide runtime state: the owning arena of loaders, the weak-def
//! map, the interpose table, the missing-flat-lazy list, and the loader
//! lock. Everything that used to be a global lives here and is threaded by
//! reference through the engine.

use std::collections::HashMap;
use std::sync::{Condvar, Mutex};
use std::thread::{self, ThreadId};

use crate::config::ProcessConfig;
use crate::error::{Error, Result};
use crate::loader::{
    ExportedSymbolMode, FoundSymbol, Loader, LoaderRef, ResolvedSymbol,
};
use crate::mach::opcodes::{
    BIND_SPECIAL_DYLIB_FLAT_LOOKUP, BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE, BIND_SPECIAL_DYLIB_SELF,
    BIND_SPECIAL_DYLIB_WEAK_LOOKUP,
};
use crate::mach::symbols;

#[derive(Debug, Clone)]
/// One interposing tuple harvested from an `__interpose` section, already
/// converted to runtime addresses
pub struct InterposeTuple {
    pub replacement: u64,
    pub replacee: u64,
    /// image that supplied the tuple; it cannot interpose itself
    pub owner: LoaderRef,
}

#[derive(Debug, Clone)]
/// A flat-namespace lazy bind that found nothing at launch; the error is
/// deferred to first use
pub struct MissingFlatLazySymbol {
    pub symbol_name: String,
    pub client: LoaderRef,
    /// runtime address of the bind location
    pub bind_address: u64,
}

#[derive(Debug, Clone, Copy)]
struct WeakDefEntry {
    loader: LoaderRef,
    runtime_offset: u64,
}

#[derive(Debug, Default)]
struct LockState {
    owner: Option<ThreadId>,
    count: u32,
}

/// A process-wide recursive lock. Graph mutation, fixup application, and
/// initializer runs all happen under it; recursion is what lets an
/// initializer dlopen more images.
#[derive(Debug, Default)]
pub struct LoaderLock {
    state: Mutex<LockState>,
    available: Condvar,
}

impl LoaderLock {
    pub fn acquire(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        loop {
            match state.owner {
                None => {
                    state.owner = Some(me);
                    state.count = 1;
                    return;
                }
                Some(owner) if owner == me => {
                    state.count += 1;
                    return;
                }
                Some(_) => {
                    state = self.available.wait(state).unwrap();
                }
            }
        }
    }

    pub fn release(&self) {
        let me = thread::current().id();
        let mut state = self.state.lock().unwrap();
        assert_eq!(state.owner, Some(me), "loader lock released by non-owner");
        state.count -= 1;
        if state.count == 0 {
            state.owner = None;
            self.available.notify_one();
        }
    }

    /// In the forked child only the calling thread survives; ownership is
    /// reset rather than released so the child starts clean
    pub fn reset_in_child(&self) {
        let mut state = self.state.lock().unwrap();
        state.owner = None;
        state.count = 0;
    }
}

/// RAII guard for [`LoaderLock`]
pub struct LoaderLockGuard<'a> {
    lock: &'a LoaderLock,
}

impl<'a> Drop for LoaderLockGuard<'a> {
    fn drop(&mut self) {
        self.lock.release();
    }
}

#[derive(Debug, Default)]
/// Which loaders have begun or finished running initializers; the "begun"
/// mark is what breaks dependency cycles
struct InitMarks {
    begun: std::collections::HashSet<u32>,
    done: std::collections::HashSet<u32>,
}

/// Everything mutable the linker owns, constructed once at launch
#[derive(Debug)]
pub struct RuntimeState {
    pub config: ProcessConfig,
    loaders: Vec<Loader>,
    weak_defs: Mutex<HashMap<String, WeakDefEntry>>,
    pub interpose_tuples: Vec<InterposeTuple>,
    pub missing_flat_lazy: Vec<MissingFlatLazySymbol>,
    init_marks: Mutex<InitMarks>,
    lock: LoaderLock,
}

impl RuntimeState {
    pub fn new(config: ProcessConfig) -> RuntimeState {
        RuntimeState {
            config,
            loaders: Vec::new(),
            weak_defs: Mutex::new(HashMap::new()),
            interpose_tuples: Vec::new(),
            missing_flat_lazy: Vec::new(),
            init_marks: Mutex::new(InitMarks::default()),
            lock: LoaderLock::default(),
        }
    }

    /// Marks a loader as being-initialized. Returns false when the mark
    /// was already set, which is how cycles and re-entry are broken.
    pub fn begin_initializers(&self, ldr: LoaderRef) -> bool {
        self.init_marks.lock().unwrap().begun.insert(ldr.0)
    }

    pub fn note_initialized(&self, ldr: LoaderRef) {
        self.init_marks.lock().unwrap().done.insert(ldr.0);
    }

    pub fn is_initialized(&self, ldr: LoaderRef) -> bool {
        self.init_marks.lock().unwrap().done.contains(&ldr.0)
    }

    pub fn with_loader_lock<T>(&self, work: impl FnOnce() -> T) -> T {
        self.lock.acquire();
        let _guard = LoaderLockGuard { lock: &self.lock };
        work()
    }

    pub fn atfork_prepare(&self) {
        self.lock.acquire();
    }

    pub fn atfork_parent(&self) {
        self.lock.release();
    }

    pub fn atfork_child(&self) {
        self.lock.reset_in_child();
    }

    pub fn loader_count(&self) -> usize {
        self.loaders.len()
    }

    pub fn loader(&self, ldr: LoaderRef) -> &Loader {
        &self.loaders[ldr.0 as usize]
    }

    pub fn loader_mut(&mut self, ldr: LoaderRef) -> &mut Loader {
        &mut self.loaders[ldr.0 as usize]
    }

    pub fn loaders(&self) -> impl Iterator<Item = &Loader> {
        self.loaders.iter()
    }

    /// Splits the borrow so cache patching can write through the config's
    /// cache while reading loaders
    pub fn config_and_loaders_mut(&mut self) -> (&mut ProcessConfig, &[Loader]) {
        (&mut self.config, &self.loaders)
    }

    /// The program itself is always the first loader
    pub fn main_executable(&self) -> Option<LoaderRef> {
        if self.loaders.is_empty() {
            None
        } else {
            Some(LoaderRef(0))
        }
    }

    /// Adds a loader to the arena; `build` receives the ref the new loader
    /// will have
    pub fn push_loader(
        &mut self,
        build: impl FnOnce(LoaderRef) -> Result<Loader>,
    ) -> Result<LoaderRef> {
        let this = LoaderRef(self.loaders.len() as u32);
        let loader = build(this)?;
        debug_assert_eq!(loader.this, this);
        self.loaders.push(loader);
        Ok(this)
    }

    /// Finds an already-loaded image by path or install name
    pub fn find_loader(&self, path: &str) -> Option<LoaderRef> {
        let normalized = crate::paths::normalize(path);
        self.loaders
            .iter()
            .find(|loader| {
                loader.path == normalized
                    || loader.path == path
                    || loader.install_name.as_deref() == Some(path)
            })
            .map(|loader| loader.this)
    }

    /// Searches one loader's exports, following re-export edges through
    /// the graph
    pub fn search_loader_exports(
        &self,
        ldr: LoaderRef,
        name: &str,
        mode: ExportedSymbolMode,
    ) -> Result<Option<FoundSymbol>> {
        self.search_exports_depth(ldr, name, mode, 0)
    }

    fn search_exports_depth(
        &self,
        ldr: LoaderRef,
        name: &str,
        mode: ExportedSymbolMode,
        depth: u32,
    ) -> Result<Option<FoundSymbol>> {
        if depth > 64 {
            return Err(Error::Malformed(format!(
                "re-export chain for '{}' does not terminate",
                name
            )));
        }
        let loader = self.loader(ldr);
        let found = loader.search_exports(name, mode, &mut |ordinal, target_name| {
            let dependent = loader
                .dependent((ordinal as usize).wrapping_sub(1))
                .ok_or_else(|| {
                    Error::Malformed(format!(
                        "'{}' re-exports '{}' from missing dependent #{}",
                        loader.path, target_name, ordinal
                    ))
                })?;
            self.search_exports_depth(dependent, target_name, ExportedSymbolMode::StaticLink, depth + 1)
        })?;
        if found.is_some() {
            return Ok(found);
        }
        // images whose exports were stripped into the trie's predecessor
        // format still publish globals through the nlist table
        if let Some(found) = self.search_nlist_exports(ldr, name)? {
            return Ok(Some(found));
        }
        // a static-link search also looks through this image's re-export
        // edges for symbols the trie itself does not name
        if mode == ExportedSymbolMode::StaticLink {
            for edge in &loader.dependents {
                if edge.kind != crate::loader::DependentKind::Reexport {
                    continue;
                }
                if let Some(dependent) = edge.loader {
                    if let Some(found) =
                        self.search_exports_depth(dependent, name, mode, depth + 1)?
                    {
                        return Ok(Some(found));
                    }
                }
            }
        }
        Ok(None)
    }

    fn search_nlist_exports(&self, ldr: LoaderRef, name: &str) -> Result<Option<FoundSymbol>> {
        let loader = self.loader(ldr);
        let mach = loader.mach_file()?;
        if !mach.export_trie()?.is_empty() {
            return Ok(None);
        }
        let symbols_table = match mach.symbols()? {
            Some(table) => table,
            None => return Ok(None),
        };
        let base = mach.preferred_load_address();
        for i in 0..symbols_table.len() {
            let (sym_name, nlist) = symbols_table.get(i)?;
            if sym_name != name || nlist.n_type & symbols::N_EXT == 0 {
                continue;
            }
            if nlist.is_defined_in_section() {
                return Ok(Some(FoundSymbol {
                    loader: ldr,
                    runtime_offset: nlist.n_value.wrapping_sub(base),
                    is_code: false,
                    is_weak_def: nlist.is_weak_def(),
                    is_absolute: false,
                    absolute_value: 0,
                }));
            }
            if nlist.is_absolute() {
                return Ok(Some(FoundSymbol {
                    loader: ldr,
                    runtime_offset: 0,
                    is_code: false,
                    is_weak_def: false,
                    is_absolute: true,
                    absolute_value: nlist.n_value,
                }));
            }
        }
        Ok(None)
    }

    /// Resolves one bind: the special ordinals select a namespace, positive
    /// ordinals index the client's dependent list.
    pub fn resolve_symbol(
        &mut self,
        client: LoaderRef,
        lib_ordinal: i32,
        name: &str,
        weak_import: bool,
        lazy_bind: bool,
    ) -> Result<ResolvedSymbol> {
        match lib_ordinal {
            BIND_SPECIAL_DYLIB_SELF => self.bind_in(client, client, name, weak_import),
            BIND_SPECIAL_DYLIB_MAIN_EXECUTABLE => {
                let main = self.main_executable().ok_or_else(|| {
                    Error::Malformed("no main executable loaded".into())
                })?;
                self.bind_in(client, main, name, weak_import)
            }
            BIND_SPECIAL_DYLIB_FLAT_LOOKUP => {
                for ldr in (0..self.loaders.len()).map(|i| LoaderRef(i as u32)) {
                    if let Some(found) =
                        self.search_loader_exports(ldr, name, ExportedSymbolMode::Shallow)?
                    {
                        return Ok(self.resolved_from(found, name));
                    }
                }
                if weak_import {
                    return Ok(ResolvedSymbol::BindAbsolute { value: 0 });
                }
                if lazy_bind {
                    // flat lazy lookups defer the failure to first use
                    self.missing_flat_lazy.push(MissingFlatLazySymbol {
                        symbol_name: name.to_owned(),
                        client,
                        bind_address: 0,
                    });
                    return Ok(ResolvedSymbol::BindToImage {
                        loader: client,
                        name: name.to_owned(),
                        runtime_offset: 0,
                        is_code: true,
                        is_weak_def: false,
                        is_missing_flat_lazy: true,
                        is_function_variant: false,
                        variant_index: 0,
                    });
                }
                Err(self.missing_symbol_error(client, name, "flat namespace"))
            }
            BIND_SPECIAL_DYLIB_WEAK_LOOKUP => {
                if let Some(entry) = self.weak_def_lookup(client, name)? {
                    return Ok(ResolvedSymbol::BindToImage {
                        loader: entry.loader,
                        name: name.to_owned(),
                        runtime_offset: entry.runtime_offset,
                        is_code: false,
                        is_weak_def: true,
                        is_missing_flat_lazy: false,
                        is_function_variant: false,
                        variant_index: 0,
                    });
                }
                // nobody defines it: keep null, callers test the pointer
                Ok(ResolvedSymbol::BindAbsolute { value: 0 })
            }
            ordinal if ordinal > 0 => {
                let edge = self
                    .loader(client)
                    .dependents
                    .get(ordinal as usize - 1)
                    .copied()
                    .ok_or_else(|| {
                        Error::Malformed(format!(
                            "'{}' bind ordinal {} is beyond its {} dependents",
                            self.loader(client).path,
                            ordinal,
                            self.loader(client).dependent_count()
                        ))
                    })?;
                match edge.loader {
                    Some(target) => self.bind_in(client, target, name, weak_import),
                    // the dependent itself was weak-linked and missing
                    None => {
                        if weak_import {
                            Ok(ResolvedSymbol::BindAbsolute { value: 0 })
                        } else {
                            Err(self.missing_symbol_error(client, name, "missing weak-linked dylib"))
                        }
                    }
                }
            }
            other => Err(Error::Malformed(format!(
                "unknown special bind ordinal {}",
                other
            ))),
        }
    }

    fn bind_in(
        &self,
        client: LoaderRef,
        target: LoaderRef,
        name: &str,
        weak_import: bool,
    ) -> Result<ResolvedSymbol> {
        match self.search_loader_exports(target, name, ExportedSymbolMode::StaticLink)? {
            Some(found) => Ok(self.resolved_from(found, name)),
            None => {
                if weak_import {
                    Ok(ResolvedSymbol::BindAbsolute { value: 0 })
                } else {
                    let target_path = self.loader(target).path.clone();
                    Err(self.missing_symbol_error(client, name, &target_path))
                }
            }
        }
    }

    fn resolved_from(&self, found: FoundSymbol, name: &str) -> ResolvedSymbol {
        if found.is_absolute {
            ResolvedSymbol::BindAbsolute {
                value: found.absolute_value,
            }
        } else {
            ResolvedSymbol::BindToImage {
                loader: found.loader,
                name: name.to_owned(),
                runtime_offset: found.runtime_offset,
                is_code: found.is_code,
                is_weak_def: found.is_weak_def,
                is_missing_flat_lazy: false,
                is_function_variant: false,
                variant_index: 0,
            }
        }
    }

    fn missing_symbol_error(&self, client: LoaderRef, name: &str, expected_in: &str) -> Error {
        let loader = self.loader(client);
        let uuid = loader
            .uuid
            .iter()
            .map(|b| format!("{:02x}", b))
            .collect::<String>();
        Error::SymbolMissing {
            symbol: name.to_owned(),
            client: format!("{} <{}>", loader.path, uuid),
            detail: expected_in.to_owned(),
        }
    }

    /// Finds the owning definition of a weak symbol. The first resolution
    /// is remembered: later loads cannot displace a published weak def.
    fn weak_def_lookup(&self, client: LoaderRef, name: &str) -> Result<Option<WeakDefEntry>> {
        if let Some(entry) = self.weak_defs.lock().unwrap().get(name) {
            return Ok(Some(*entry));
        }
        // search every image with weak definitions in load order, the
        // client included
        let mut found_entry = None;
        for ldr in (0..self.loaders.len()).map(|i| LoaderRef(i as u32)) {
            let loader = self.loader(ldr);
            if !loader
                .flags
                .contains(crate::loader::LoaderFlags::HAS_WEAK_DEFS)
                && ldr != client
            {
                continue;
            }
            if let Some(found) =
                self.search_loader_exports(ldr, name, ExportedSymbolMode::Shallow)?
            {
                found_entry = Some(WeakDefEntry {
                    loader: found.loader,
                    runtime_offset: found.runtime_offset,
                });
                break;
            }
        }
        if let Some(entry) = found_entry {
            self.weak_defs
                .lock()
                .unwrap()
                .entry(name.to_owned())
                .or_insert(entry);
            // re-read: a racing publisher may have won
            return Ok(self.weak_defs.lock().unwrap().get(name).copied());
        }
        Ok(None)
    }

    /// Publishes a strong definition into the weak-def map, displacing
    /// nothing if the name is already bound
    pub fn publish_strong_def(&self, name: &str, loader: LoaderRef, runtime_offset: u64) {
        self.weak_defs
            .lock()
            .unwrap()
            .entry(name.to_owned())
            .or_insert(WeakDefEntry {
                loader,
                runtime_offset,
            });
    }

    /// Rewrites `address` through the interpose table; an image's own
    /// tuples never rewrite its own binds
    pub fn apply_interposing(&self, address: u64, client: LoaderRef) -> u64 {
        for tuple in &self.interpose_tuples {
            if tuple.replacee == address && tuple.owner != client {
                return tuple.replacement;
            }
        }
        address
    }
}

/// Where flat-namespace lazy binds that resolved to nothing point. Calling
/// one is fatal, with the recorded names in the abort message.
pub extern "C" fn missing_flat_lazy_abort() {
    error!("symbol missing: a flat-namespace lazy binding was used but never resolved");
    std::process::abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn loader_lock_is_recursive() {
        let lock = LoaderLock::default();
        lock.acquire();
        lock.acquire();
        lock.release();
        lock.release();
        lock.acquire();
        lock.release();
    }

    #[test]
    fn loader_lock_blocks_other_threads() {
        use std::sync::Arc;
        let lock = Arc::new(LoaderLock::default());
        lock.acquire();
        let contender = {
            let lock = Arc::clone(&lock);
            std::thread::spawn(move || {
                lock.acquire();
                lock.release();
            })
        };
        std::thread::sleep(std::time::Duration::from_millis(20));
        assert!(!contender.is_finished());
        lock.release();
        contender.join().unwrap();
    }
}
