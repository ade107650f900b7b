//! Cache-root patching: a dylib loaded from disk with the install name of
//! a cached dylib must drag every cached binding over to itself.

mod common;

use kobold::cache::builder::{
    image_layout, CacheBuilder, CachedDylibSpec, PatchExportSpec, PatchLocationSpec,
};
use kobold::cache::{DyldCache, PATCH_KIND_OBJC_CLASS, PATCH_KIND_REGULAR, PATCH_KIND_WEAK_IMPORT};
use kobold::fixup::patch::DylibPatch;
use kobold::launch;
use kobold::mach::builder::{DependentKind, ExportSpec, ImageBuilder, SegmentSpec};

const CACHE_BASE: u64 = 0x7fff_0000_0000;

#[test]
fn root_overriding_a_cached_dylib_patches_every_use() {
    let dir = tempfile::tempdir().unwrap();

    // the cached copy of libC, baked into a minimal cache with three
    // patchable exports and one patch site each
    let cached_libc = ImageBuilder::dylib("/usr/lib/libC.dylib")
        .exports(&[ExportSpec::regular("_c_sym", 0x2000)])
        .build()
        .unwrap();
    let dylibs = vec![CachedDylibSpec {
        path: "/usr/lib/libC.dylib".into(),
        image: cached_libc.clone(),
        patch_exports: Vec::new(),
    }];
    let image_offset = image_layout(&dylibs)[0];
    let use_site = image_offset + 0x80;
    let weak_site = image_offset + 0x88;
    let objc_site = image_offset + 0x90;
    let dylibs = vec![CachedDylibSpec {
        path: "/usr/lib/libC.dylib".into(),
        image: cached_libc,
        patch_exports: vec![
            PatchExportSpec {
                name: "_c_sym".into(),
                dylib_offset_of_impl: 0x2000,
                kind: PATCH_KIND_REGULAR,
                locations: vec![PatchLocationSpec {
                    cache_offset: use_site,
                    addend: 0,
                    authenticated: false,
                }],
            },
            PatchExportSpec {
                name: "_gone".into(),
                dylib_offset_of_impl: 0x2100,
                kind: PATCH_KIND_WEAK_IMPORT,
                locations: vec![PatchLocationSpec {
                    cache_offset: weak_site,
                    addend: 0,
                    authenticated: false,
                }],
            },
            PatchExportSpec {
                name: "_OBJC_CLASS_$_Thing".into(),
                dylib_offset_of_impl: 0x2200,
                kind: PATCH_KIND_OBJC_CLASS,
                locations: vec![PatchLocationSpec {
                    cache_offset: objc_site,
                    addend: 0,
                    authenticated: false,
                }],
            },
        ],
    }];
    let cache_bytes = CacheBuilder::new(CACHE_BASE)
        .dylib(dylibs.into_iter().next().unwrap())
        .build()
        .unwrap();
    let cache = DyldCache::parse(cache_bytes, "fixture-cache").unwrap();

    // the root: same install name, loaded from disk, exporting _c_sym at
    // its own offset and also claiming the objc class (but with no
    // classlist, so that patch must be skipped)
    let root_path = dir.path().join("libC.dylib");
    let root = ImageBuilder::dylib("/usr/lib/libC.dylib")
        .segment(SegmentSpec::data(vec![0u8; 0x100]))
        .exports(&[
            ExportSpec::regular("_c_sym", 0x400),
            ExportSpec::regular("_OBJC_CLASS_$_Thing", 0x500),
        ])
        .build()
        .unwrap();
    common::write_image(dir.path(), "libC.dylib", &root);

    let main = ImageBuilder::executable()
        .depend(&root_path.to_string_lossy(), DependentKind::Regular)
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);

    let mut config = common::config_for(&main, &main_path, vec![]);
    config.dyld_cache = Some(cache);
    let launch =
        launch::prepare_with_config(config, main.clone(), &main_path.to_string_lossy()).unwrap();

    let state = &launch.state;
    let root_ref = state.loader(launch.main).dependent(0).unwrap();
    let root_ldr = state.loader(root_ref);
    assert_eq!(root_ldr.override_of_cache_index, Some(0));
    assert!(state.config.found_cache_root());

    // the patch table recorded each export's disposition
    let table = root_ldr.patch_table.as_ref().unwrap();
    assert_eq!(
        table.patches,
        vec![
            DylibPatch::Offset(0x400),
            DylibPatch::MissingWeakImport,
            DylibPatch::ObjcClass(0x500),
        ]
    );

    let cache = state.config.dyld_cache.as_ref().unwrap();
    // every cached use of _c_sym now points into the root
    assert_eq!(
        cache.read_u64(use_site).unwrap(),
        root_ldr.load_address() + 0x400
    );
    // the dropped weak import was nulled
    assert_eq!(cache.read_u64(weak_site).unwrap(), 0);
    // the objc class patch was skipped: no self-bound classlist entry
    assert_eq!(cache.read_u64(objc_site).unwrap(), 0);
}

#[test]
fn patch_location_addend_is_preserved() {
    let dir = tempfile::tempdir().unwrap();
    let cached = ImageBuilder::dylib("/usr/lib/libD.dylib").build().unwrap();
    let dylibs = vec![CachedDylibSpec {
        path: "/usr/lib/libD.dylib".into(),
        image: cached.clone(),
        patch_exports: Vec::new(),
    }];
    let site = image_layout(&dylibs)[0] + 0x40;
    let cache_bytes = CacheBuilder::new(CACHE_BASE)
        .dylib(CachedDylibSpec {
            path: "/usr/lib/libD.dylib".into(),
            image: cached,
            patch_exports: vec![PatchExportSpec {
                name: "_d_sym".into(),
                dylib_offset_of_impl: 0x1000,
                kind: PATCH_KIND_REGULAR,
                locations: vec![PatchLocationSpec {
                    cache_offset: site,
                    addend: 8,
                    authenticated: false,
                }],
            }],
        })
        .build()
        .unwrap();
    let cache = DyldCache::parse(cache_bytes, "fixture-cache").unwrap();

    let root_path = dir.path().join("libD.dylib");
    let root = ImageBuilder::dylib("/usr/lib/libD.dylib")
        .exports(&[ExportSpec::regular("_d_sym", 0x600)])
        .build()
        .unwrap();
    common::write_image(dir.path(), "libD.dylib", &root);
    let main = ImageBuilder::executable()
        .depend(&root_path.to_string_lossy(), DependentKind::Regular)
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);

    let mut config = common::config_for(&main, &main_path, vec![]);
    config.dyld_cache = Some(cache);
    let launch =
        launch::prepare_with_config(config, main.clone(), &main_path.to_string_lossy()).unwrap();
    let root_ref = launch.state.loader(launch.main).dependent(0).unwrap();
    let cache = launch.state.config.dyld_cache.as_ref().unwrap();
    assert_eq!(
        cache.read_u64(site).unwrap(),
        launch.state.loader(root_ref).load_address() + 0x600 + 8
    );
}
