//! Launch closures: record a loaded graph, reload it without path
//! resolution, and refuse it when the files changed underneath.

mod common;

use kobold::config::AmfiFlags;
use kobold::loader::prebuilt::LaunchClosure;
use kobold::loader::LoaderKind;
use kobold::mach::builder::{DependentKind, ExportSpec, ImageBuilder};
use kobold::runtime::RuntimeState;

#[test]
fn closure_reload_skips_resolution_and_validates_identity() {
    let dir = tempfile::tempdir().unwrap();
    let lib_path = dir.path().join("libx.dylib");
    let lib = ImageBuilder::dylib(&lib_path.to_string_lossy())
        .exports(&[ExportSpec::regular("_x", 0x100)])
        .build()
        .unwrap();
    common::write_image(dir.path(), "libx.dylib", &lib);
    let main = ImageBuilder::executable()
        .depend(&lib_path.to_string_lossy(), DependentKind::Regular)
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);

    // first launch: the just-in-time path, then record the closure
    let launch = common::prepare(&main_path, vec![]).unwrap();
    let closure = LaunchClosure::from_state(&launch.state);
    let serialized = closure.serialize();

    // second launch: consume the closure
    let parsed = LaunchClosure::deserialize(&serialized).unwrap();
    let config = common::config_for(&main, &main_path, vec![]);
    let mut state = RuntimeState::new(config);
    let loaded = parsed.load(&mut state).unwrap();
    assert_eq!(loaded.len(), 2);
    for &ldr in &loaded {
        assert_eq!(state.loader(ldr).kind, LoaderKind::Prebuilt);
    }
    // the recorded edge survived
    assert_eq!(state.loader(loaded[0]).dependent(0), Some(loaded[1]));

    // a changed file invalidates the whole closure
    let mut tampered = ImageBuilder::dylib(&lib_path.to_string_lossy())
        .exports(&[ExportSpec::regular("_x", 0x200)])
        .uuid([0x55; 16])
        .build()
        .unwrap();
    tampered.push(0);
    std::fs::write(&lib_path, &tampered).unwrap();
    // mtime granularity can hide the rewrite on fast filesystems; force it
    filetime_bump(&lib_path);
    let config = common::config_for(&main, &main_path, vec![]);
    let mut state = RuntimeState::new(config);
    let err = parsed.load(&mut state).unwrap_err();
    assert!(matches!(err, kobold::error::Error::Validation(_)));
}

fn filetime_bump(path: &std::path::Path) {
    let file = std::fs::OpenOptions::new().append(true).open(path).unwrap();
    let now = std::time::SystemTime::now() + std::time::Duration::from_secs(2);
    file.set_modified(now).unwrap();
}

#[test]
fn closure_from_missing_file_is_a_validation_error() {
    let dir = tempfile::tempdir().unwrap();
    let main = ImageBuilder::executable().build().unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);
    let launch = common::prepare(&main_path, vec![]).unwrap();
    let closure = LaunchClosure::from_state(&launch.state);
    std::fs::remove_file(&main_path).unwrap();
    let config = common::config_for(&main, &main_path, vec![]);
    let mut state = RuntimeState::new(config);
    assert!(closure.load(&mut state).is_err());
}

#[test]
fn amfi_unrestricted_is_what_tests_run_under() {
    // the fixtures in this suite assume the open policy; pin that here so
    // a change to the default is caught loudly
    assert_eq!(AmfiFlags::unrestricted(), AmfiFlags::all());
}
