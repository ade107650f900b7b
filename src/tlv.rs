//! Thread-local variables. The compiler emits a three-word thunk per
//! variable (`{func, key, offset}`, all pointer-sized, with `func` pointing
//! at a bootstrap routine). At image load time every thunk is rewritten in
//! place into a packed, self-contained form and redirected at the fast-path
//! accessor here; the first access on each thread allocates that thread's
//! copy of the image's template.
//!
//! The packed 64-bit form is `{func, u32 key, u32 offset,
//! i32 delta_to_initial_content, u32 initial_content_size}`; the 32-bit
//! form is `{func, u16 key, u16 offset, i32 delta_to_mach_header}` where a
//! positive delta is a zero-fill size and a negative delta points back at
//! the image header.

use core::ffi::c_void;
use std::sync::{Mutex, OnceLock};

use crate::error::{Error, Result};
use crate::helpers::{HelpersSlot, LibSystemHelpers, ThreadKey};
use crate::loader::{Loader, LoaderFlags};
use crate::mach::constants::{
    SECTION_TYPE, S_THREAD_LOCAL_REGULAR, S_THREAD_LOCAL_VARIABLES, S_THREAD_LOCAL_ZEROFILL,
};

/// The on-disk thunk the compiler emits (64-bit images)
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct RawThunk64 {
    pub func: u64,
    pub key: u64,
    pub offset: u64,
}

/// The packed form a 64-bit thunk is rewritten into
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TlvThunk64 {
    pub func: u64,
    pub key: u32,
    pub offset: u32,
    /// from the thunk to the image's template content
    pub delta_to_initial_content: i32,
    /// total per-thread allocation (template plus zero-fill tail)
    pub initial_content_size: u32,
}

/// The packed form a 32-bit thunk is rewritten into
#[repr(C)]
#[derive(Debug, Clone, Copy)]
pub struct TlvThunk32 {
    pub func: u32,
    pub key: u16,
    pub offset: u16,
    /// positive: pure zero-fill of this size; negative: delta back to the
    /// image's mach header
    pub delta: i32,
}

pub const SIZEOF_RAW_THUNK_64: u64 = 24;

/// One `_tlv_atexit` registration
struct Terminator {
    func: unsafe extern "C" fn(*mut c_void),
    arg: *mut c_void,
}

struct TerminatorList {
    entries: Vec<Terminator>,
}

/// The process-wide TLV runtime. User code reaches it through function
/// pointers in rewritten thunks, so it lives in a process-global slot that
/// is initialized exactly once, after libSystem publishes its helpers.
pub struct ThreadLocals {
    helpers: &'static LibSystemHelpers,
    terminators_key: ThreadKey,
    /// keys created for images loaded this launch, for diagnostics
    keys: Mutex<Vec<ThreadKey>>,
}

impl core::fmt::Debug for ThreadLocals {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(fmt, "ThreadLocals(terminators key {})", self.terminators_key)
    }
}

static TLV_RUNTIME: OnceLock<ThreadLocals> = OnceLock::new();

/// Initializes the TLV runtime from a published helpers slot. Idempotent;
/// the first caller wins.
pub fn initialize(slot: &HelpersSlot) -> Result<&'static ThreadLocals> {
    let helpers = slot.get()?;
    if let Some(existing) = TLV_RUNTIME.get() {
        return Ok(existing);
    }
    let mut terminators_key: ThreadKey = 0;
    let rc = unsafe { (helpers.pthread_key_create)(&mut terminators_key, Some(run_terminators)) };
    if rc != 0 {
        return Err(Error::Resource(format!(
            "cannot create the TLV terminator key: {}",
            rc
        )));
    }
    let _ = TLV_RUNTIME.set(ThreadLocals {
        helpers,
        terminators_key,
        keys: Mutex::new(Vec::new()),
    });
    Ok(TLV_RUNTIME.get().unwrap())
}

pub fn runtime() -> Result<&'static ThreadLocals> {
    TLV_RUNTIME
        .get()
        .ok_or_else(|| Error::Policy("TLV runtime used before libSystem initialized".into()))
}

impl ThreadLocals {
    /// Rewrites every thunk of `loader` into the packed form and gives the
    /// image its pthread key. Images in the dyld cache had static keys
    /// assigned by the cache builder; for those only the free-on-exit hook
    /// matters and the thunks are left alone.
    pub fn set_up_image(&self, loader: &Loader) -> Result<()> {
        if !loader.flags.contains(LoaderFlags::HAS_THREAD_LOCALS) {
            return Ok(());
        }
        if loader.flags.contains(LoaderFlags::IN_DYLD_CACHE) {
            return Ok(());
        }
        let mach = loader.mach_file()?;
        let preferred_base = mach.preferred_load_address();
        let is64 = mach.is64();

        // the template is the span of the thread-local content sections:
        // initialized data first, zero-fill after, contiguous in vm
        let mut template_start = u64::MAX;
        let mut template_end = 0u64;
        let mut content_end = 0u64;
        let mut thunk_sections = Vec::new();
        for segment in &mach.segments {
            for section in &segment.sections {
                match section.flags & SECTION_TYPE {
                    S_THREAD_LOCAL_REGULAR => {
                        template_start = template_start.min(section.addr);
                        template_end = template_end.max(section.addr + section.size);
                        content_end = content_end.max(section.addr + section.size);
                    }
                    S_THREAD_LOCAL_ZEROFILL => {
                        template_start = template_start.min(section.addr);
                        template_end = template_end.max(section.addr + section.size);
                    }
                    S_THREAD_LOCAL_VARIABLES => thunk_sections.push(section.clone()),
                    _ => {}
                }
            }
        }
        if thunk_sections.is_empty() {
            return Ok(());
        }
        if template_start == u64::MAX {
            template_start = 0;
            template_end = 0;
        }
        let template_offset = template_start.wrapping_sub(preferred_base);
        let template_size = template_end.wrapping_sub(template_start);
        drop(mach);

        let mut key: ThreadKey = 0;
        let rc = unsafe { (self.helpers.pthread_key_create)(&mut key, Some(free_tlv_buffer)) };
        if rc != 0 {
            return Err(Error::Resource(format!(
                "cannot create a TLV key for '{}': {}",
                loader.path, rc
            )));
        }
        self.keys.lock().unwrap().push(key);

        for section in &thunk_sections {
            if !is64 {
                return Err(Error::Malformed(format!(
                    "32-bit thread-local images are not mapped here: '{}'",
                    loader.path
                )));
            }
            if section.size % SIZEOF_RAW_THUNK_64 != 0 {
                return Err(Error::Malformed(format!(
                    "thread-local thunk section of '{}' has a partial descriptor",
                    loader.path
                )));
            }
            let section_offset = section.addr - preferred_base;
            for i in 0..section.size / SIZEOF_RAW_THUNK_64 {
                let thunk_offset = section_offset + i * SIZEOF_RAW_THUNK_64;
                // third word of the raw thunk: the variable's offset in
                // the template
                let var_offset = loader.image.region.read_u64(thunk_offset + 16)?;
                let delta = template_offset as i64 - thunk_offset as i64;
                let delta = i32::try_from(delta).map_err(|_| {
                    Error::Malformed(format!(
                        "thread-local template of '{}' is too far from its thunks",
                        loader.path
                    ))
                })?;
                loader
                    .image
                    .region
                    .write_u64(thunk_offset, tlv_get_addr as usize as u64)?;
                loader.image.region.write_u32(thunk_offset + 8, key as u32)?;
                loader
                    .image
                    .region
                    .write_u32(thunk_offset + 12, var_offset as u32)?;
                loader
                    .image
                    .region
                    .write_u32(thunk_offset + 16, delta as u32)?;
                loader
                    .image
                    .region
                    .write_u32(thunk_offset + 20, template_size as u32)?;
            }
        }
        Ok(())
    }

    fn terminators(&self) -> *mut TerminatorList {
        unsafe { (self.helpers.pthread_getspecific)(self.terminators_key) as *mut TerminatorList }
    }

    /// Registers a per-thread terminator, called by `_tlv_atexit` when
    /// thread-local objects with destructors are constructed
    pub fn atexit(&self, func: unsafe extern "C" fn(*mut c_void), arg: *mut c_void) -> Result<()> {
        let mut list = self.terminators();
        if list.is_null() {
            list = Box::into_raw(Box::new(TerminatorList {
                entries: Vec::new(),
            }));
            let rc = unsafe {
                (self.helpers.pthread_setspecific)(self.terminators_key, list as *const c_void)
            };
            if rc != 0 {
                return Err(Error::Resource(format!(
                    "cannot record TLV terminators: {}",
                    rc
                )));
            }
        }
        unsafe { (*list).entries.push(Terminator { func, arg }) };
        Ok(())
    }

    /// Runs this thread's terminators now, newest first. Terminators that
    /// register more terminators get a second pass.
    pub fn exit(&self) {
        loop {
            let list = self.terminators();
            if list.is_null() {
                return;
            }
            unsafe {
                (self.helpers.pthread_setspecific)(self.terminators_key, core::ptr::null());
                let mut list = Box::from_raw(list);
                if list.entries.is_empty() {
                    return;
                }
                while let Some(terminator) = list.entries.pop() {
                    (terminator.func)(terminator.arg);
                }
            }
        }
    }
}

/// pthread destructor for the terminator list: run them, then handle any
/// the run itself registered
unsafe extern "C" fn run_terminators(raw: *mut c_void) {
    if raw.is_null() {
        return;
    }
    let mut list = Box::from_raw(raw as *mut TerminatorList);
    while let Some(terminator) = list.entries.pop() {
        (terminator.func)(terminator.arg);
    }
    // a terminator may have re-registered; the runtime's key slot was
    // cleared by pthread before this destructor ran, so check it again
    if let Some(runtime) = TLV_RUNTIME.get() {
        runtime.exit();
    }
}

/// pthread destructor for per-thread TLV storage
unsafe extern "C" fn free_tlv_buffer(raw: *mut c_void) {
    if raw.is_null() {
        return;
    }
    if let Some(runtime) = TLV_RUNTIME.get() {
        (runtime.helpers.free)(raw);
    }
}

/// The fast-path accessor every rewritten thunk points at. Given the thunk
/// address, returns this thread's address of the variable, allocating and
/// initializing the thread's copy of the template on first use.
///
/// # Safety
/// `thunk` must point at a thunk rewritten by [`ThreadLocals::set_up_image`]
/// inside a still-mapped image.
pub unsafe extern "C" fn tlv_get_addr(thunk: *const TlvThunk64) -> *mut c_void {
    let runtime = match TLV_RUNTIME.get() {
        Some(runtime) => runtime,
        None => return core::ptr::null_mut(),
    };
    let packed = &*thunk;
    let existing = (runtime.helpers.pthread_getspecific)(packed.key as ThreadKey);
    if !existing.is_null() {
        return existing.add(packed.offset as usize);
    }
    // slow path: allocate this thread's copy and initialize it from the
    // template the delta points at
    let size = (packed.initial_content_size as usize).max(1);
    let buffer = (runtime.helpers.malloc)(size);
    if buffer.is_null() {
        return core::ptr::null_mut();
    }
    core::ptr::write_bytes(buffer as *mut u8, 0, size);
    if packed.initial_content_size > 0 {
        let template =
            (thunk as *const u8).offset(packed.delta_to_initial_content as isize);
        core::ptr::copy_nonoverlapping(
            template,
            buffer as *mut u8,
            packed.initial_content_size as usize,
        );
    }
    if (runtime.helpers.pthread_setspecific)(packed.key as ThreadKey, buffer) != 0 {
        (runtime.helpers.free)(buffer);
        return core::ptr::null_mut();
    }
    buffer.add(packed.offset as usize) as *mut c_void
}

/// `_tlv_atexit`: record a terminator for the calling thread
pub unsafe extern "C" fn tlv_atexit(func: unsafe extern "C" fn(*mut c_void), arg: *mut c_void) {
    if let Ok(runtime) = runtime() {
        let _ = runtime.atexit(func, arg);
    }
}

/// `_tlv_exit`: run the calling thread's terminators eagerly
pub extern "C" fn tlv_exit() {
    if let Ok(runtime) = runtime() {
        runtime.exit();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::helpers;

    fn test_runtime() -> &'static ThreadLocals {
        static SLOT: HelpersSlot = HelpersSlot::new();
        if !SLOT.is_published() {
            let _ = SLOT.publish(helpers::host_helpers());
        }
        initialize(&SLOT).unwrap()
    }

    // a thunk pointing at inline template content right behind it
    #[repr(C)]
    struct ThunkWithTemplate {
        thunk: TlvThunk64,
        template: [u8; 8],
    }

    fn make_thunk(key: ThreadKey) -> Box<ThunkWithTemplate> {
        Box::new(ThunkWithTemplate {
            thunk: TlvThunk64 {
                func: tlv_get_addr as usize as u64,
                key: key as u32,
                offset: 0,
                delta_to_initial_content: core::mem::size_of::<TlvThunk64>() as i32,
                initial_content_size: 8,
            },
            template: [1, 2, 3, 4, 5, 6, 7, 8],
        })
    }

    #[test]
    fn first_use_allocates_and_copies_template() {
        let runtime = test_runtime();
        let mut key: ThreadKey = 0;
        unsafe {
            ((runtime.helpers.pthread_key_create))(&mut key, Some(free_tlv_buffer));
        }
        let holder = make_thunk(key);
        let first = unsafe { tlv_get_addr(&holder.thunk) } as *mut u8;
        assert!(!first.is_null());
        let bytes = unsafe { core::slice::from_raw_parts_mut(first, 8) };
        assert_eq!(bytes, &[1, 2, 3, 4, 5, 6, 7, 8]);
        // writes stick, and the same thread sees the same storage
        bytes[0] = 0xff;
        let second = unsafe { tlv_get_addr(&holder.thunk) } as *mut u8;
        assert_eq!(first, second);
        assert_eq!(unsafe { *second }, 0xff);
        // another thread gets fresh storage with pristine content
        let thunk_addr = &holder.thunk as *const TlvThunk64 as usize;
        let first_addr = first as usize;
        std::thread::spawn(move || {
            let other =
                unsafe { tlv_get_addr(thunk_addr as *const TlvThunk64) } as *mut u8;
            assert!(!other.is_null());
            assert_ne!(other as usize, first_addr);
            let bytes = unsafe { core::slice::from_raw_parts(other, 8) };
            assert_eq!(bytes, &[1, 2, 3, 4, 5, 6, 7, 8]);
        })
        .join()
        .unwrap();
    }

    #[test]
    fn terminators_run_in_reverse_order() {
        static ORDER: Mutex<Vec<u32>> = Mutex::new(Vec::new());
        unsafe extern "C" fn record(arg: *mut c_void) {
            ORDER.lock().unwrap().push(arg as usize as u32);
        }
        let runtime = test_runtime();
        std::thread::spawn(move || {
            runtime.atexit(record, 1 as *mut c_void).unwrap();
            runtime.atexit(record, 2 as *mut c_void).unwrap();
            runtime.atexit(record, 3 as *mut c_void).unwrap();
            runtime.exit();
        })
        .join()
        .unwrap();
        assert_eq!(*ORDER.lock().unwrap(), vec![3, 2, 1]);
    }
}
