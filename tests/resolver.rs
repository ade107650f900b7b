//! Path-resolver behavior driven through a simulated filesystem: the
//! candidate precedence order, suffix expansion, `@` expansion policy
//! clamps, and the first-success-wins idempotence law.

mod common;

use std::collections::HashSet;
use std::path::Path;

use kobold::config::{AmfiFlags, ProcessConfig};
use kobold::error::Error;
use kobold::mach::builder::ImageBuilder;
use kobold::mach::MachFile;
use kobold::paths::{LoadChain, ResolveOptions};

fn config(env: Vec<String>) -> ProcessConfig {
    let main = ImageBuilder::executable().build().unwrap();
    common::config_for(&main, Path::new("/app/bin/demo"), env)
}

fn restricted_config() -> ProcessConfig {
    let main = ImageBuilder::executable().build().unwrap();
    let mach = MachFile::parse(&main).unwrap();
    ProcessConfig::new(
        &common::kernel_args(Path::new("/app/bin/demo"), vec!["DYLD_LIBRARY_PATH=/evil".into()]),
        &mach,
        AmfiFlags::restricted(),
        false,
    )
    .unwrap()
}

/// a setuid-style process: `@` paths are allowed but path env vars are
/// not, which is what marks the process restricted
fn setuid_config() -> ProcessConfig {
    let main = ImageBuilder::executable().build().unwrap();
    let mach = MachFile::parse(&main).unwrap();
    ProcessConfig::new(
        &common::kernel_args(Path::new("/app/bin/demo"), vec![]),
        &mach,
        AmfiFlags::ALLOW_AT_PATHS,
        false,
    )
    .unwrap()
}

fn resolve(config: &ProcessConfig, files: &[&str], request: &str) -> Result<String, Error> {
    let set: HashSet<&str> = files.iter().copied().collect();
    let chain = LoadChain {
        loader_dir: Some("/app/bin"),
        rpath_stack: vec![],
    };
    config.resolve_dylib(request, &chain, ResolveOptions::default(), |candidate| {
        set.contains(candidate).then(|| candidate.to_owned())
    })
}

#[test]
fn library_path_override_beats_the_raw_path() {
    let config = config(vec!["DYLD_LIBRARY_PATH=/override".into()]);
    let found = resolve(
        &config,
        &["/override/libz.dylib", "/usr/lib/libz.dylib"],
        "/usr/lib/libz.dylib",
    )
    .unwrap();
    assert_eq!(found, "/override/libz.dylib");
    // without the override directory holding the leaf, the raw path wins
    let found = resolve(&config, &["/usr/lib/libz.dylib"], "/usr/lib/libz.dylib").unwrap();
    assert_eq!(found, "/usr/lib/libz.dylib");
}

#[test]
fn framework_override_uses_the_framework_partial() {
    let config = config(vec!["DYLD_FRAMEWORK_PATH=/fwk".into()]);
    let found = resolve(
        &config,
        &["/fwk/Foo.framework/Foo"],
        "/System/Library/Frameworks/Foo.framework/Foo",
    )
    .unwrap();
    assert_eq!(found, "/fwk/Foo.framework/Foo");
}

#[test]
fn image_suffix_is_tried_before_the_plain_candidate() {
    let config = config(vec!["DYLD_IMAGE_SUFFIX=_debug".into()]);
    let found = resolve(
        &config,
        &["/usr/lib/libz_debug.dylib", "/usr/lib/libz.dylib"],
        "/usr/lib/libz.dylib",
    )
    .unwrap();
    assert_eq!(found, "/usr/lib/libz_debug.dylib");
    // the unsuffixed candidate only lands after all suffixed ones miss
    let found = resolve(&config, &["/usr/lib/libz.dylib"], "/usr/lib/libz.dylib").unwrap();
    assert_eq!(found, "/usr/lib/libz.dylib");
}

#[test]
fn executable_path_expansion() {
    let config = config(vec![]);
    let found = resolve(
        &config,
        &["/app/bin/../lib/libq.dylib"],
        "@executable_path/../lib/libq.dylib",
    )
    .unwrap();
    assert_eq!(found, "/app/bin/../lib/libq.dylib");
    assert_eq!(kobold::paths::normalize(&found), "/app/lib/libq.dylib");
}

#[test]
fn rpath_expansion_walks_closest_image_first() {
    let config = config(vec![]);
    let near: Vec<String> = vec!["/near".into()];
    let far: Vec<String> = vec!["/far".into()];
    let chain = LoadChain {
        loader_dir: Some("/app/bin"),
        rpath_stack: vec![near.as_slice(), far.as_slice()],
    };
    let files: HashSet<&str> = ["/near/libq.dylib", "/far/libq.dylib"]
        .into_iter()
        .collect();
    let found = config
        .resolve_dylib(
            "@rpath/libq.dylib",
            &chain,
            ResolveOptions::default(),
            |candidate| files.contains(candidate).then(|| candidate.to_owned()),
        )
        .unwrap();
    assert_eq!(found, "/near/libq.dylib");
}

#[test]
fn at_paths_are_refused_without_the_amfi_flag() {
    let config = restricted_config();
    let err = resolve(&config, &["/app/bin/libq.dylib"], "@executable_path/libq.dylib")
        .unwrap_err();
    assert!(matches!(err, Error::Policy(_)));
}

#[test]
fn executable_path_is_refused_for_setuid_even_with_at_paths_allowed() {
    let config = setuid_config();
    assert!(config.security.restricted);
    assert!(config.security.allow_at_paths());
    let err = resolve(
        &config,
        &["/app/bin/libq.dylib"],
        "@executable_path/libq.dylib",
    )
    .unwrap_err();
    assert!(matches!(err, Error::Policy(_)));
    // the other @ expansions still work for such a process
    let found = resolve(&config, &["/app/bin/libq.dylib"], "@loader_path/libq.dylib").unwrap();
    assert_eq!(found, "/app/bin/libq.dylib");
}

#[test]
fn env_overrides_are_ignored_for_restricted_processes() {
    // the restricted config carried DYLD_LIBRARY_PATH=/evil; it must not
    // have been parsed at all
    let config = restricted_config();
    assert!(config.path_overrides.library_paths.is_empty());
    let found = resolve(
        &config,
        &["/evil/libz.dylib", "/usr/lib/libz.dylib"],
        "/usr/lib/libz.dylib",
    )
    .unwrap();
    assert_eq!(found, "/usr/lib/libz.dylib");
}

#[test]
fn fallbacks_apply_only_to_binaries_that_opted_in() {
    let config = config(vec![]);
    let chain = LoadChain::default();
    let files: HashSet<&str> = ["/usr/local/lib/libold.dylib"].into_iter().collect();
    // without the opt-in the lookup fails
    let err = config
        .resolve_dylib(
            "/opt/libold.dylib",
            &chain,
            ResolveOptions::default(),
            |candidate| files.contains(candidate).then(|| candidate.to_owned()),
        )
        .unwrap_err();
    assert!(matches!(err, Error::DylibMissing { .. }));
    // with it, the classic fallback directories are searched by leaf name
    let found = config
        .resolve_dylib(
            "/opt/libold.dylib",
            &chain,
            ResolveOptions {
                use_fallback_paths: true,
                weak: false,
            },
            |candidate| files.contains(candidate).then(|| candidate.to_owned()),
        )
        .unwrap();
    assert_eq!(found, "/usr/local/lib/libold.dylib");
}

#[test]
fn classic_framework_fallbacks_search_the_four_default_directories() {
    let config = config(vec!["HOME=/Users/impish".into()]);
    let chain = LoadChain::default();
    let options = ResolveOptions {
        use_fallback_paths: true,
        weak: false,
    };
    let request = "/opt/Foo.framework/Foo";
    // each of the classic directories is found when it alone has the file
    for file in [
        "/Users/impish/Library/Frameworks/Foo.framework/Foo",
        "/Library/Frameworks/Foo.framework/Foo",
        "/Network/Library/Frameworks/Foo.framework/Foo",
        "/System/Library/Frameworks/Foo.framework/Foo",
    ] {
        let files: HashSet<&str> = [file].into_iter().collect();
        let found = config
            .resolve_dylib(request, &chain, options, |candidate| {
                files.contains(candidate).then(|| candidate.to_owned())
            })
            .unwrap();
        assert_eq!(found, file);
    }
    // and the per-user directory outranks the system one
    let files: HashSet<&str> = [
        "/Users/impish/Library/Frameworks/Foo.framework/Foo",
        "/System/Library/Frameworks/Foo.framework/Foo",
    ]
    .into_iter()
    .collect();
    let found = config
        .resolve_dylib(request, &chain, options, |candidate| {
            files.contains(candidate).then(|| candidate.to_owned())
        })
        .unwrap();
    assert_eq!(found, "/Users/impish/Library/Frameworks/Foo.framework/Foo");
}

#[test]
fn versioned_override_wins_when_nothing_newer_is_installed() {
    use kobold::mach::builder::ImageBuilder;
    let dir = tempfile::tempdir().unwrap();
    // install name that certainly has no on-disk copy on the host
    let install_name = "/kobold-missing/libver.dylib";
    let override_dylib = ImageBuilder::dylib(install_name).build().unwrap();
    let override_path = dir.path().join("libver.dylib");
    std::fs::write(&override_path, &override_dylib).unwrap();

    let config = config(vec![format!(
        "DYLD_VERSIONED_LIBRARY_PATH={}",
        dir.path().display()
    )]);
    assert_eq!(config.path_overrides.versioned_overrides.len(), 1);
    let entry = &config.path_overrides.versioned_overrides[0];
    assert_eq!(entry.install_name, install_name);

    let override_str = override_path.to_string_lossy().into_owned();
    let found = resolve(&config, &[override_str.as_str()], install_name).unwrap();
    assert_eq!(found, override_str);
}

#[test]
fn resolution_is_idempotent() {
    // if resolve(p) returns q, presenting q back yields q as the first
    // success
    let config = config(vec!["DYLD_LIBRARY_PATH=/override".into()]);
    let files = ["/override/libz.dylib", "/usr/lib/libz.dylib"];
    let q = resolve(&config, &files, "/usr/lib/libz.dylib").unwrap();
    let again = resolve(&config, &files, &q).unwrap();
    assert_eq!(q, again);
}

#[test]
fn failed_resolution_reports_the_candidates_tried() {
    let config = config(vec!["DYLD_LIBRARY_PATH=/override".into()]);
    let err = resolve(&config, &[], "/usr/lib/libmissing.dylib").unwrap_err();
    match err {
        Error::DylibMissing { detail, .. } => {
            assert!(detail.contains("/override/libmissing.dylib"));
            assert!(detail.contains("/usr/lib/libmissing.dylib"));
        }
        other => panic!("expected DylibMissing, got {}", other),
    }
}
