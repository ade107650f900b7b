//! Process configuration: the once-per-process record of platform,
//! architecture, security policy, logging flags, shared cache, and path
//! overrides, derived from the kernel-supplied argument block. Immutable
//! after construction; the only later mutation is the one-shot
//! "found a root over the cache" latch.

use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};

use crate::cache::DyldCache;
use crate::error::Result;
use crate::mach::arch::GradedArchs;
use crate::mach::{MachFile, Platform, Version32};
use crate::paths::PathOverrides;

/// The block the kernel leaves on the stack at entry: argc, argv, envp,
/// and the "apple" strings, each NUL-terminated and NULL-ended.
#[derive(Debug, Clone, Default)]
pub struct KernelArgs {
    pub argv: Vec<String>,
    pub envp: Vec<String>,
    pub apple: Vec<String>,
}

impl KernelArgs {
    pub fn new(argv: Vec<String>, envp: Vec<String>, apple: Vec<String>) -> KernelArgs {
        KernelArgs { argv, envp, apple }
    }

    /// Walks the kernel stack block. `argv` must point at argc C strings,
    /// then NULL, then envp, NULL, then the apple strings, NULL.
    ///
    /// # Safety
    /// `argv` must be the kernel-delivered argument block for this process.
    #[cfg(unix)]
    pub unsafe fn from_raw(argc: isize, argv: *const *const libc::c_char) -> KernelArgs {
        unsafe fn take(cursor: &mut *const *const libc::c_char) -> Vec<String> {
            let mut strings = Vec::new();
            while !(**cursor).is_null() {
                let cstr = std::ffi::CStr::from_ptr(**cursor);
                strings.push(cstr.to_string_lossy().into_owned());
                *cursor = cursor.add(1);
            }
            *cursor = cursor.add(1); // skip the NULL
            strings
        }
        let mut cursor = argv;
        let mut args = Vec::with_capacity(argc as usize);
        for _ in 0..argc {
            if (*cursor).is_null() {
                break;
            }
            args.push(std::ffi::CStr::from_ptr(*cursor).to_string_lossy().into_owned());
            cursor = cursor.add(1);
        }
        cursor = cursor.add(1); // skip argv's NULL
        let envp = take(&mut cursor);
        let apple = take(&mut cursor);
        KernelArgs {
            argv: args,
            envp,
            apple,
        }
    }

    /// Looks up `key=` in the environment block
    pub fn env(&self, key: &str) -> Option<&str> {
        lookup(&self.envp, key)
    }

    /// Looks up `key=` in the apple strings
    pub fn apple(&self, key: &str) -> Option<&str> {
        lookup(&self.apple, key)
    }
}

fn lookup<'a>(strings: &'a [String], key: &str) -> Option<&'a str> {
    strings.iter().find_map(|entry| {
        entry
            .strip_prefix(key)
            .and_then(|rest| rest.strip_prefix('='))
    })
}

bitflags::bitflags! {
    /// The per-process output flags AMFI hands back, controlling which
    /// dangerous conveniences dyld may honor
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct AmfiFlags: u32 {
        const ALLOW_AT_PATHS = 0x01;
        const ALLOW_PATH_ENV_VARS = 0x02;
        const ALLOW_CUSTOM_SHARED_CACHE = 0x04;
        const ALLOW_FALLBACK_PATHS = 0x08;
        const ALLOW_PRINT_VARS = 0x10;
        const ALLOW_FAILED_LIBRARY_INSERTION = 0x20;
        const ALLOW_LIBRARY_INTERPOSING = 0x40;
        const ALLOW_EMBEDDED_VARS = 0x80;
    }
}

impl AmfiFlags {
    /// What an unrestricted process gets
    pub fn unrestricted() -> AmfiFlags {
        AmfiFlags::all()
    }

    /// What a restricted (setuid, __RESTRICT, hardened) process gets
    pub fn restricted() -> AmfiFlags {
        AmfiFlags::empty()
    }
}

bitflags::bitflags! {
    /// Which `DYLD_PRINT_*` switches are on
    #[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
    pub struct Verbosity: u32 {
        const LIBRARIES = 1 << 0;
        const SEGMENTS = 1 << 1;
        const BINDINGS = 1 << 2;
        const INITIALIZERS = 1 << 3;
        const APIS = 1 << 4;
        const NOTIFICATIONS = 1 << 5;
        const INTERPOSING = 1 << 6;
        const LOADERS = 1 << 7;
        const SEARCHING = 1 << 8;
        const ENV = 1 << 9;
    }
}

/// dyld_flags bits from the apple strings
pub const DYLD_FLAGS_TEST_MODE: u64 = 0x2;

#[derive(Debug)]
/// Security posture of the process, fixed at launch
pub struct Security {
    /// raw `dyld_flags=` boot value from the apple strings
    pub dyld_flags: u64,
    pub amfi: AmfiFlags,
    /// AppleInternal build of the OS
    pub internal_install: bool,
    /// setuid/setgid or otherwise restricted main executable
    pub restricted: bool,
    /// dyld_flags= carried the test-mode bit
    pub test_mode: bool,
    /// return from launch without calling main (`DYLD_SKIP_MAIN`)
    pub skip_main: bool,
    /// ptrauth keys disabled for this process
    pub ptrauth_disabled: bool,
}

impl Security {
    pub fn allow_at_paths(&self) -> bool {
        self.amfi.contains(AmfiFlags::ALLOW_AT_PATHS)
    }
    pub fn allow_env_paths(&self) -> bool {
        self.amfi.contains(AmfiFlags::ALLOW_PATH_ENV_VARS)
    }
    pub fn allow_embedded_vars(&self) -> bool {
        self.amfi.contains(AmfiFlags::ALLOW_EMBEDDED_VARS)
    }
    pub fn allow_interposing(&self) -> bool {
        self.amfi.contains(AmfiFlags::ALLOW_LIBRARY_INTERPOSING)
    }
    pub fn allow_fallback_paths(&self) -> bool {
        self.amfi.contains(AmfiFlags::ALLOW_FALLBACK_PATHS)
    }
}

#[derive(Debug)]
/// Facts about the process itself
pub struct ProcessInfo {
    pub argv: Vec<String>,
    /// environment as delivered, minus `DYLD_*` when the process is
    /// restricted (so children never see them)
    pub environ: Vec<String>,
    pub main_executable_path: String,
    pub dyld_path: String,
    pub platform: Platform,
    pub os_version: Version32,
    pub sdk_version: Version32,
    pub archs: GradedArchs,
    pub cputype: u32,
    pub cpusubtype: u32,
    pub stack_guard: u64,
}

#[derive(Debug)]
/// The immutable per-process configuration
pub struct ProcessConfig {
    pub process: ProcessInfo,
    pub security: Security,
    pub log: Verbosity,
    pub path_overrides: PathOverrides,
    pub dyld_cache: Option<DyldCache>,
    /// 0 = off; 1-3 select how eagerly the kernel applies fixups at
    /// page-in time
    pub page_in_linking: u8,
    found_cache_root: AtomicBool,
}

impl ProcessConfig {
    /// Gathers the once-per-process inputs. `main_executable` is the
    /// already-located slice of the program being launched; `amfi` is the
    /// policy verdict for it.
    pub fn new(
        args: &KernelArgs,
        main_executable: &MachFile,
        amfi: AmfiFlags,
        internal_install: bool,
    ) -> Result<ProcessConfig> {
        let restricted = !amfi.contains(AmfiFlags::ALLOW_PATH_ENV_VARS);
        let dyld_flags = args
            .apple("dyld_flags")
            .and_then(parse_hex)
            .unwrap_or(0);
        let test_mode = internal_install && dyld_flags & DYLD_FLAGS_TEST_MODE != 0;

        // AMFI can be faked on internal installs running in test mode
        let amfi = match args.env("DYLD_AMFI_FAKE") {
            Some(value) if test_mode => {
                AmfiFlags::from_bits_truncate(parse_hex(value).unwrap_or(0) as u32)
            }
            _ => amfi,
        };

        let ptrauth_disabled = args.apple("ptrauth_disabled") == Some("1");
        let security = Security {
            dyld_flags,
            amfi,
            internal_install,
            restricted,
            test_mode,
            skip_main: internal_install && args.env("DYLD_SKIP_MAIN").is_some(),
            ptrauth_disabled,
        };

        let main_executable_path = resolve_main_executable_path(args);
        let dyld_path = args
            .apple("dyld_path")
            .map(str::to_owned)
            .unwrap_or_else(|| "/usr/lib/dyld".to_owned());

        let platform_info = main_executable.platform;
        let mut platform = platform_info
            .map(|info| info.platform)
            .unwrap_or(Platform::Unknown(0));
        // DYLD_FORCE_PLATFORM lets a macOS binary pretend to be Catalyst,
        // for binaries that opted in, on internal installs
        if platform == Platform::MacOS && security.internal_install {
            if let Some(forced) = args.env("DYLD_FORCE_PLATFORM").and_then(|v| v.parse().ok()) {
                let forced = Platform::from_raw(forced);
                if forced == Platform::MacCatalyst {
                    platform = forced;
                }
            }
        }

        let archs = GradedArchs::for_main_executable(
            main_executable.header.cputype,
            main_executable.header.cpusubtype,
            ptrauth_disabled,
        );

        let log = parse_verbosity(args, &security);

        let mut environ = args.envp.clone();
        if security.restricted {
            environ.retain(|entry| !entry.starts_with("DYLD_"));
        }

        let page_in_linking = if security.internal_install {
            args.env("DYLD_PAGEIN_LINKING")
                .and_then(|value| value.parse::<u8>().ok())
                .filter(|&mode| mode <= 3)
                .unwrap_or(0)
        } else {
            0
        };

        let dyld_cache = load_shared_cache(args, &security);
        let os_version = dyld_cache
            .as_ref()
            .map(|cache| Version32(cache.header.os_version))
            .or_else(|| platform_info.map(|info| info.sdk))
            .unwrap_or_default();

        let path_overrides = PathOverrides::new(
            args,
            &security,
            &main_executable.dyld_environment,
            platform,
        );

        if log.contains(Verbosity::ENV) {
            for entry in &environ {
                if entry.starts_with("DYLD_") {
                    info!("env: {}", entry);
                }
            }
        }

        Ok(ProcessConfig {
            process: ProcessInfo {
                argv: args.argv.clone(),
                environ,
                main_executable_path,
                dyld_path,
                platform,
                os_version,
                sdk_version: platform_info.map(|info| info.sdk).unwrap_or_default(),
                archs,
                cputype: main_executable.header.cputype,
                cpusubtype: main_executable.header.cpusubtype,
                stack_guard: args.apple("stack_guard").and_then(parse_hex).unwrap_or(0),
            },
            security,
            log,
            path_overrides,
            dyld_cache,
            page_in_linking,
            found_cache_root: AtomicBool::new(false),
        })
    }

    /// One-shot latch set at boot when a root over a cached dylib was
    /// found; later calls are ignored
    pub fn note_found_cache_root(&self) {
        self.found_cache_root.store(true, Ordering::Release);
    }

    pub fn found_cache_root(&self) -> bool {
        self.found_cache_root.load(Ordering::Acquire)
    }

    /// Index of `install_name` in the shared cache, if the cache is loaded
    /// and has it
    pub fn cached_dylib_index(&self, install_name: &str) -> Option<u32> {
        self.dyld_cache
            .as_ref()
            .and_then(|cache| cache.image_index_of_path(install_name))
    }
}

fn parse_hex(value: &str) -> Option<u64> {
    let digits = value.strip_prefix("0x").unwrap_or(value);
    u64::from_str_radix(digits, 16).ok()
}

/// The kernel tells us where the main executable really is; fall back to
/// argv[0]. The path is canonicalized when the file is reachable so later
/// `@executable_path` expansion is stable.
fn resolve_main_executable_path(args: &KernelArgs) -> String {
    let raw = args
        .apple("executable_path")
        .map(str::to_owned)
        .or_else(|| args.argv.first().cloned())
        .unwrap_or_default();
    match std::fs::canonicalize(Path::new(&raw)) {
        Ok(real) => real.to_string_lossy().into_owned(),
        Err(_) => raw,
    }
}

fn parse_verbosity(args: &KernelArgs, security: &Security) -> Verbosity {
    if !security.amfi.contains(AmfiFlags::ALLOW_PRINT_VARS) {
        return Verbosity::empty();
    }
    let mut log = Verbosity::empty();
    for (key, flag) in [
        ("DYLD_PRINT_LIBRARIES", Verbosity::LIBRARIES),
        ("DYLD_PRINT_SEGMENTS", Verbosity::SEGMENTS),
        ("DYLD_PRINT_BINDINGS", Verbosity::BINDINGS),
        ("DYLD_PRINT_INITIALIZERS", Verbosity::INITIALIZERS),
        ("DYLD_PRINT_APIS", Verbosity::APIS),
        ("DYLD_PRINT_NOTIFICATIONS", Verbosity::NOTIFICATIONS),
        ("DYLD_PRINT_INTERPOSING", Verbosity::INTERPOSING),
        ("DYLD_PRINT_LOADERS", Verbosity::LOADERS),
        ("DYLD_PRINT_SEARCHING", Verbosity::SEARCHING),
        ("DYLD_PRINT_ENV", Verbosity::ENV),
    ] {
        if args.env(key).is_some() {
            log |= flag;
        }
    }
    log
}

/// Locates and opens the shared cache: an explicit `DYLD_SHARED_CACHE_DIR`
/// first, then the system default, unless the region is avoided entirely.
fn load_shared_cache(args: &KernelArgs, security: &Security) -> Option<DyldCache> {
    if args.env("DYLD_SHARED_REGION") == Some("avoid") {
        return None;
    }
    let mut candidates = Vec::new();
    if security.amfi.contains(AmfiFlags::ALLOW_CUSTOM_SHARED_CACHE) {
        if let Some(dir) = args.env("DYLD_SHARED_CACHE_DIR") {
            candidates.push(PathBuf::from(dir));
        }
    }
    candidates.push(PathBuf::from("/System/Library/dyld"));
    candidates.push(PathBuf::from(
        "/System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld",
    ));
    for dir in candidates {
        for name in ["dyld_shared_cache", "dyld_shared_cache_arm64e", "dyld_shared_cache_x86_64"] {
            let path = dir.join(name);
            if path.is_file() {
                match DyldCache::open(&path) {
                    Ok(cache) => {
                        debug!("using shared cache at {}", path.display());
                        return Some(cache);
                    }
                    Err(err) => {
                        warn!("shared cache at {} unusable: {}", path.display(), err);
                    }
                }
            }
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mach::builder::ImageBuilder;

    fn sample_args(env: &[&str]) -> KernelArgs {
        KernelArgs::new(
            vec!["/bin/demo".into()],
            env.iter().map(|s| s.to_string()).collect(),
            vec![
                "executable_path=/bin/demo".into(),
                "stack_guard=0xfeedface".into(),
                "dyld_flags=0x2".into(),
            ],
        )
    }

    fn sample_main() -> Vec<u8> {
        ImageBuilder::executable().build().unwrap()
    }

    #[test]
    fn restricted_process_prunes_dyld_env() {
        let image = sample_main();
        let main = MachFile::parse(&image).unwrap();
        let args = sample_args(&["DYLD_LIBRARY_PATH=/tmp", "HOME=/root"]);
        let config =
            ProcessConfig::new(&args, &main, AmfiFlags::restricted(), false).unwrap();
        assert!(config.security.restricted);
        assert!(config.process.environ.iter().all(|e| !e.starts_with("DYLD_")));
        assert!(config.process.environ.iter().any(|e| e == "HOME=/root"));
    }

    #[test]
    fn print_vars_require_amfi() {
        let image = sample_main();
        let main = MachFile::parse(&image).unwrap();
        let args = sample_args(&["DYLD_PRINT_LIBRARIES=1", "DYLD_PRINT_SEARCHING=1"]);
        let open = ProcessConfig::new(&args, &main, AmfiFlags::unrestricted(), false).unwrap();
        assert!(open.log.contains(Verbosity::LIBRARIES | Verbosity::SEARCHING));
        let closed = ProcessConfig::new(&args, &main, AmfiFlags::restricted(), false).unwrap();
        assert_eq!(closed.log, Verbosity::empty());
    }

    #[test]
    fn amfi_fake_needs_internal_test_mode() {
        let image = sample_main();
        let main = MachFile::parse(&image).unwrap();
        let args = sample_args(&["DYLD_AMFI_FAKE=0xff"]);
        // external install: the fake is ignored
        let external =
            ProcessConfig::new(&args, &main, AmfiFlags::restricted(), false).unwrap();
        assert_eq!(external.security.amfi, AmfiFlags::restricted());
        // internal install with the test-mode dyld flag: honored
        let internal =
            ProcessConfig::new(&args, &main, AmfiFlags::restricted(), true).unwrap();
        assert_eq!(internal.security.amfi, AmfiFlags::all());
    }

    #[test]
    fn skip_main_is_internal_only() {
        let image = sample_main();
        let main = MachFile::parse(&image).unwrap();
        let args = sample_args(&["DYLD_SKIP_MAIN=1"]);
        assert!(
            !ProcessConfig::new(&args, &main, AmfiFlags::unrestricted(), false)
                .unwrap()
                .security
                .skip_main
        );
        assert!(
            ProcessConfig::new(&args, &main, AmfiFlags::unrestricted(), true)
                .unwrap()
                .security
                .skip_main
        );
    }

    #[test]
    fn found_root_latch_is_sticky() {
        let image = sample_main();
        let main = MachFile::parse(&image).unwrap();
        let args = sample_args(&[]);
        let config = ProcessConfig::new(&args, &main, AmfiFlags::unrestricted(), false).unwrap();
        assert!(!config.found_cache_root());
        config.note_found_cache_root();
        assert!(config.found_cache_root());
    }
}
