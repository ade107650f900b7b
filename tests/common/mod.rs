//! Shared fixture plumbing for the integration tests: synthesized images
//! written into a tempdir, kernel args pointing at them, and a prepared
//! launch to poke at.
#![allow(dead_code)]

use std::path::{Path, PathBuf};

use kobold::config::{AmfiFlags, KernelArgs, ProcessConfig};
use kobold::launch::{self, Launch};
use kobold::mach::MachFile;

/// Pipe crate logging to stderr once per test binary; `RUST_LOG`-less,
/// shown only for failing tests by the harness
pub fn init_logging() {
    static ONCE: std::sync::Once = std::sync::Once::new();
    ONCE.call_once(|| {
        let _ = stderrlog::new().verbosity(4).init();
    });
}

pub fn write_image(dir: &Path, name: &str, bytes: &[u8]) -> PathBuf {
    let path = dir.join(name);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent).unwrap();
    }
    std::fs::write(&path, bytes).unwrap();
    path
}

pub fn kernel_args(main: &Path, env: Vec<String>) -> KernelArgs {
    KernelArgs::new(
        vec![main.to_string_lossy().into_owned()],
        env,
        vec![
            format!("executable_path={}", main.display()),
            "stack_guard=0x1122334455667788".into(),
        ],
    )
}

/// Prepares a launch for a main executable already written to disk
pub fn prepare(main: &Path, env: Vec<String>) -> kobold::error::Result<Launch> {
    init_logging();
    launch::prepare(kernel_args(main, env), AmfiFlags::unrestricted(), false)
}

/// Builds a config for `main_bytes` without going through the filesystem,
/// for tests that need to adjust it (e.g. plant a shared cache) first
pub fn config_for(main_bytes: &[u8], main: &Path, env: Vec<String>) -> ProcessConfig {
    let mach = MachFile::parse(main_bytes).unwrap();
    ProcessConfig::new(
        &kernel_args(main, env),
        &mach,
        AmfiFlags::unrestricted(),
        false,
    )
    .unwrap()
}

/// The vm offset of the named region inside a loaded image
pub fn region_offset(launch: &Launch, ldr: kobold::loader::LoaderRef, name: &str) -> u64 {
    launch
        .state
        .loader(ldr)
        .image
        .regions
        .iter()
        .find(|region| region.name == name)
        .unwrap_or_else(|| panic!("no region {}", name))
        .vm_offset
}
