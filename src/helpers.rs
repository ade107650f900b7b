//! The libSystem helpers boundary. The linker needs malloc, pthread keys,
//! locks, and exit, but it runs before libSystem has finished
//! initializing, so it cannot link against them. Instead libSystem
//! publishes a versioned struct of function pointers during its own
//! initializer; until that happens no helper may be called.
//!
//! The struct crosses an ABI boundary with independent versioning: fields
//! are only ever appended, and every consumer gates on `version` before
//! touching a late field.

use core::ffi::c_void;
use std::sync::atomic::{AtomicPtr, Ordering};

use crate::error::{Error, Result};

/// an opaque pthread key
pub type ThreadKey = libc::pthread_key_t;

pub type MallocFn = unsafe extern "C" fn(usize) -> *mut c_void;
pub type FreeFn = unsafe extern "C" fn(*mut c_void);
pub type MallocSizeFn = unsafe extern "C" fn(*const c_void) -> usize;
pub type KeyCreateFn =
    unsafe extern "C" fn(*mut ThreadKey, Option<unsafe extern "C" fn(*mut c_void)>) -> i32;
pub type GetSpecificFn = unsafe extern "C" fn(ThreadKey) -> *mut c_void;
pub type SetSpecificFn = unsafe extern "C" fn(ThreadKey, *const c_void) -> i32;
pub type CxaAtexitFn =
    unsafe extern "C" fn(unsafe extern "C" fn(*mut c_void), *mut c_void, *mut c_void) -> i32;
pub type CxaFinalizeRangesFn = unsafe extern "C" fn(*const c_void, u32);
pub type IsLaunchdOwnedFn = unsafe extern "C" fn() -> bool;
pub type UnfairLockFn = unsafe extern "C" fn(*mut c_void);
pub type ExitFn = unsafe extern "C" fn(i32) -> !;
pub type GetenvFn = unsafe extern "C" fn(*const libc::c_char) -> *const libc::c_char;
pub type MkstempFn = unsafe extern "C" fn(*mut libc::c_char) -> i32;
pub type SetUpThreadLocalsFn = unsafe extern "C" fn(*const c_void);

/// The vtable libSystem hands back. Version gates:
/// * v1: everything through `getenv`
/// * v2: `cxa_finalize_ranges`
/// * v3: the unfair-lock operations
/// * v4: `mkstemp`
/// * v5: `set_up_thread_locals`
#[repr(C)]
#[derive(Clone, Copy)]
pub struct LibSystemHelpers {
    pub version: u32,
    pub malloc: MallocFn,
    pub free: FreeFn,
    pub malloc_size: MallocSizeFn,
    pub pthread_key_create: KeyCreateFn,
    pub pthread_getspecific: GetSpecificFn,
    pub pthread_setspecific: SetSpecificFn,
    pub cxa_atexit: CxaAtexitFn,
    pub is_launchd_owned: IsLaunchdOwnedFn,
    pub exit: ExitFn,
    pub getenv: GetenvFn,
    // v2
    pub cxa_finalize_ranges: Option<CxaFinalizeRangesFn>,
    // v3
    pub os_unfair_lock_lock: Option<UnfairLockFn>,
    pub os_unfair_lock_unlock: Option<UnfairLockFn>,
    // v4
    pub mkstemp: Option<MkstempFn>,
    // v5
    pub set_up_thread_locals: Option<SetUpThreadLocalsFn>,
}

impl core::fmt::Debug for LibSystemHelpers {
    fn fmt(&self, fmt: &mut core::fmt::Formatter) -> core::fmt::Result {
        write!(fmt, "LibSystemHelpers v{}", self.version)
    }
}

impl LibSystemHelpers {
    /// `cxa_finalize_ranges`, when the published table is new enough
    pub fn cxa_finalize_ranges(&self) -> Option<CxaFinalizeRangesFn> {
        if self.version >= 2 {
            self.cxa_finalize_ranges
        } else {
            None
        }
    }

    pub fn unfair_lock_ops(&self) -> Option<(UnfairLockFn, UnfairLockFn)> {
        if self.version >= 3 {
            Some((self.os_unfair_lock_lock?, self.os_unfair_lock_unlock?))
        } else {
            None
        }
    }

    pub fn mkstemp(&self) -> Option<MkstempFn> {
        if self.version >= 4 {
            self.mkstemp
        } else {
            None
        }
    }

    pub fn set_up_thread_locals(&self) -> Option<SetUpThreadLocalsFn> {
        if self.version >= 5 {
            self.set_up_thread_locals
        } else {
            None
        }
    }
}

/// The process-wide slot the helpers land in. Set exactly once, by
/// libSystem's initializer; read everywhere after.
#[derive(Debug, Default)]
pub struct HelpersSlot {
    table: AtomicPtr<LibSystemHelpers>,
}

impl HelpersSlot {
    pub const fn new() -> HelpersSlot {
        HelpersSlot {
            table: AtomicPtr::new(core::ptr::null_mut()),
        }
    }

    /// Publishes the helpers. The table must live for the rest of the
    /// process; a second publish is refused.
    pub fn publish(&self, helpers: &'static LibSystemHelpers) -> Result<()> {
        let raw = helpers as *const LibSystemHelpers as *mut LibSystemHelpers;
        match self.table.compare_exchange(
            core::ptr::null_mut(),
            raw,
            Ordering::Release,
            Ordering::Relaxed,
        ) {
            Ok(_) => Ok(()),
            Err(_) => Err(Error::Policy(
                "libSystem helpers were already published".into(),
            )),
        }
    }

    /// The helpers, or an error when libSystem has not initialized yet.
    /// Calling any helper before publish is a bug in the caller.
    pub fn get(&self) -> Result<&'static LibSystemHelpers> {
        let raw = self.table.load(Ordering::Acquire);
        if raw.is_null() {
            Err(Error::Policy(
                "libSystem helpers used before libSystem initialized".into(),
            ))
        } else {
            Ok(unsafe { &*raw })
        }
    }

    pub fn is_published(&self) -> bool {
        !self.table.load(Ordering::Acquire).is_null()
    }
}

//
// a libc-backed helpers table, published by tests and by hosts that have a
// full libc below them
//

unsafe extern "C" fn host_malloc(size: usize) -> *mut c_void {
    libc::malloc(size)
}
unsafe extern "C" fn host_free(ptr: *mut c_void) {
    libc::free(ptr)
}
unsafe extern "C" fn host_malloc_size(_ptr: *const c_void) -> usize {
    0
}
unsafe extern "C" fn host_key_create(
    key: *mut ThreadKey,
    destructor: Option<unsafe extern "C" fn(*mut c_void)>,
) -> i32 {
    libc::pthread_key_create(key, destructor)
}
unsafe extern "C" fn host_getspecific(key: ThreadKey) -> *mut c_void {
    libc::pthread_getspecific(key)
}
unsafe extern "C" fn host_setspecific(key: ThreadKey, value: *const c_void) -> i32 {
    libc::pthread_setspecific(key, value)
}
unsafe extern "C" fn host_cxa_atexit(
    _func: unsafe extern "C" fn(*mut c_void),
    _arg: *mut c_void,
    _dso: *mut c_void,
) -> i32 {
    0
}
unsafe extern "C" fn host_is_launchd_owned() -> bool {
    false
}
unsafe extern "C" fn host_exit(code: i32) -> ! {
    libc::exit(code)
}
unsafe extern "C" fn host_getenv(name: *const libc::c_char) -> *const libc::c_char {
    libc::getenv(name)
}
unsafe extern "C" fn host_mkstemp(template: *mut libc::c_char) -> i32 {
    libc::mkstemp(template)
}

static HOST_HELPERS: LibSystemHelpers = LibSystemHelpers {
    version: 4,
    malloc: host_malloc,
    free: host_free,
    malloc_size: host_malloc_size,
    pthread_key_create: host_key_create,
    pthread_getspecific: host_getspecific,
    pthread_setspecific: host_setspecific,
    cxa_atexit: host_cxa_atexit,
    is_launchd_owned: host_is_launchd_owned,
    exit: host_exit,
    getenv: host_getenv,
    cxa_finalize_ranges: None,
    os_unfair_lock_lock: None,
    os_unfair_lock_unlock: None,
    mkstemp: Some(host_mkstemp),
    set_up_thread_locals: None,
};

/// A helpers table backed directly by the host libc
pub fn host_helpers() -> &'static LibSystemHelpers {
    &HOST_HELPERS
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn slot_is_publish_once() {
        let slot = HelpersSlot::new();
        assert!(!slot.is_published());
        assert!(slot.get().is_err());
        slot.publish(host_helpers()).unwrap();
        assert!(slot.is_published());
        assert_eq!(slot.get().unwrap().version, 4);
        assert!(slot.publish(host_helpers()).is_err());
    }

    #[test]
    fn version_gates_hide_late_fields() {
        let mut table = *host_helpers();
        table.version = 1;
        assert!(table.cxa_finalize_ranges().is_none());
        assert!(table.unfair_lock_ops().is_none());
        assert!(table.mkstemp().is_none());
        let v4 = host_helpers();
        assert!(v4.mkstemp().is_some());
    }
}
