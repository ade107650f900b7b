//! End-to-end launches over synthesized images on disk: rebases and binds
//! land where the resolver said, weak imports that are missing become
//! null, flat-namespace lazy misses defer their failure, and initializers
//! order bottom-up with upward edges left out.

mod common;

use kobold::loader::init;
use kobold::mach::builder::{
    BindOpcodes, DependentKind, ExportSpec, ImageBuilder, RebaseOpcodes, SectionSpec, SegmentSpec,
};
use kobold::mach::constants::S_MOD_INIT_FUNC_POINTERS;

const BASE: u64 = 0x1_0000_0000;

#[test]
fn two_image_launch_applies_rebase_and_bind() {
    let dir = tempfile::tempdir().unwrap();
    let libfoo_path = dir.path().join("libfoo.dylib");
    let libfoo = ImageBuilder::dylib(&libfoo_path.to_string_lossy())
        .segment(SegmentSpec::data(vec![0u8; 0x100]))
        .exports(&[ExportSpec::regular("_foo_sym", 0x1000)])
        .build()
        .unwrap();
    common::write_image(dir.path(), "libfoo.dylib", &libfoo);

    // __DATA of the program: a rebase slot at +0x8 whose file content is
    // the unslid address base+0x20, a bind slot at +0x10, and a weak
    // import of a symbol libfoo does not have at +0x18
    let mut data = vec![0u8; 0x100];
    data[0x8..0x10].copy_from_slice(&(BASE + 0x20).to_le_bytes());
    let mut rebases = RebaseOpcodes::new();
    rebases.rebase(1, 0x8);
    let mut binds = BindOpcodes::new();
    binds.bind(1, 0x10, 1, "_foo_sym", 0, false);
    binds.bind(1, 0x18, 1, "_maybe", 0, true);
    let main = ImageBuilder::executable()
        .depend(&libfoo_path.to_string_lossy(), DependentKind::Regular)
        .segment(SegmentSpec::data(data))
        .rebase_opcodes(rebases.finish())
        .bind_opcodes(binds.finish())
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);

    let launch = common::prepare(&main_path, vec![]).unwrap();
    let state = &launch.state;
    assert_eq!(state.loader_count(), 2);
    let main_ldr = state.loader(launch.main);
    let foo_ref = main_ldr.dependent(0).unwrap();
    let foo_base = state.loader(foo_ref).load_address();

    let data_offset = common::region_offset(&launch, launch.main, "__DATA");
    let region = &main_ldr.image.region;
    assert_eq!(
        region.read_u64(data_offset + 0x8).unwrap(),
        main_ldr.load_address() + 0x20
    );
    assert_eq!(region.read_u64(data_offset + 0x10).unwrap(), foo_base + 0x1000);
    // missing weak import binds to null, no launch error
    assert_eq!(region.read_u64(data_offset + 0x18).unwrap(), 0);
}

#[test]
fn missing_regular_dylib_is_a_structured_error() {
    let dir = tempfile::tempdir().unwrap();
    let main = ImageBuilder::executable()
        .depend("/nonexistent/libgone.dylib", DependentKind::Regular)
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);
    let err = common::prepare(&main_path, vec![]).unwrap_err();
    match err {
        kobold::error::Error::DylibMissing { path, client, detail } => {
            assert_eq!(path, "/nonexistent/libgone.dylib");
            assert!(client.contains("main"));
            assert!(detail.contains("tried"));
        }
        other => panic!("expected DylibMissing, got {}", other),
    }
}

#[test]
fn missing_weak_linked_dylib_becomes_null_dependent() {
    let dir = tempfile::tempdir().unwrap();
    let main = ImageBuilder::executable()
        .depend("/nonexistent/libmaybe.dylib", DependentKind::Weak)
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);
    let launch = common::prepare(&main_path, vec![]).unwrap();
    let main_ldr = launch.state.loader(launch.main);
    assert_eq!(main_ldr.dependent_count(), 1);
    assert!(main_ldr.dependent(0).is_none());
}

#[test]
fn flat_namespace_lazy_miss_defers_to_first_use() {
    let dir = tempfile::tempdir().unwrap();
    let mut lazy = BindOpcodes::lazy();
    lazy.bind(1, 0x20, -2, "_nowhere_to_be_found", 0, false);
    let main = ImageBuilder::executable()
        .segment(SegmentSpec::data(vec![0u8; 0x100]))
        .lazy_bind_opcodes(lazy.finish())
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);
    // the launch itself succeeds
    let launch = common::prepare(&main_path, vec![]).unwrap();
    let entry = launch.state.missing_flat_lazy.first().expect("recorded miss");
    assert_eq!(entry.symbol_name, "_nowhere_to_be_found");
    // the bind site points at the deferred-abort stub
    let data_offset = common::region_offset(&launch, launch.main, "__DATA");
    let stored = launch
        .state
        .loader(launch.main)
        .image
        .region
        .read_u64(data_offset + 0x20)
        .unwrap();
    assert_eq!(
        stored,
        kobold::runtime::missing_flat_lazy_abort as usize as u64
    );
}

#[test]
fn rpath_resolution_walks_the_load_chain() {
    let dir = tempfile::tempdir().unwrap();
    let libq = ImageBuilder::dylib("@rpath/libq.dylib").build().unwrap();
    common::write_image(dir.path(), "lib/libq.dylib", &libq);
    let main = ImageBuilder::executable()
        .rpath("@loader_path/../lib")
        .depend("@rpath/libq.dylib", DependentKind::Regular)
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "p/main", &main);

    let launch = common::prepare(&main_path, vec![]).unwrap();
    assert_eq!(launch.state.loader_count(), 2);
    let dep = launch.state.loader(launch.main).dependent(0).unwrap();
    let loaded_path = &launch.state.loader(dep).path;
    // the candidate `<dir>/p/../lib/libq.dylib` normalizes away the `..`
    assert!(loaded_path.ends_with("/lib/libq.dylib"));
    assert!(!loaded_path.contains(".."));
}

#[test]
fn initializers_order_bottom_up_and_skip_upward_edges() {
    let dir = tempfile::tempdir().unwrap();
    let main_path = dir.path().join("main");

    // C depends upward on the program; B depends on C; the program
    // depends on B. Bottom-up order must be C, B, program.
    let libc_path = dir.path().join("libc_fixture.dylib");
    let libb_path = dir.path().join("libb_fixture.dylib");
    let libc = ImageBuilder::dylib(&libc_path.to_string_lossy())
        .depend(&main_path.to_string_lossy(), DependentKind::Upward)
        .build()
        .unwrap();
    common::write_image(dir.path(), "libc_fixture.dylib", &libc);

    // B carries one initializer pointer, rebased at load
    let mut section = vec![0u8; 8];
    section.copy_from_slice(&(BASE + 0x40).to_le_bytes());
    let mut rebases = RebaseOpcodes::new();
    rebases.rebase(1, 0x0);
    let libb = ImageBuilder::dylib(&libb_path.to_string_lossy())
        .depend(&libc_path.to_string_lossy(), DependentKind::Regular)
        .segment(SegmentSpec {
            sections: vec![SectionSpec::new(
                "__mod_init_func",
                S_MOD_INIT_FUNC_POINTERS,
                section,
            )],
            ..SegmentSpec::data(vec![])
        })
        .rebase_opcodes(rebases.finish())
        .build()
        .unwrap();
    common::write_image(dir.path(), "libb_fixture.dylib", &libb);

    let main = ImageBuilder::executable()
        .depend(&libb_path.to_string_lossy(), DependentKind::Regular)
        .build()
        .unwrap();
    common::write_image(dir.path(), "main", &main);

    let launch = common::prepare(&main_path, vec![]).unwrap();
    let state = &launch.state;
    let b_ref = state.loader(launch.main).dependent(0).unwrap();
    let c_ref = state.loader(b_ref).dependent(0).unwrap();
    assert_eq!(launch.init_order, vec![c_ref, b_ref, launch.main]);

    // the upward edge is attached but was not followed for ordering
    assert_eq!(state.loader(c_ref).dependent(0), Some(launch.main));

    // B's initializer pointer was rebased; discovery recovers its offset
    let offsets = init::gather_initializers(state, b_ref).unwrap();
    assert_eq!(offsets, vec![0x40]);
}

#[test]
fn dependents_reuse_already_loaded_images() {
    let dir = tempfile::tempdir().unwrap();
    let shared_path = dir.path().join("libshared.dylib");
    let shared = ImageBuilder::dylib(&shared_path.to_string_lossy())
        .build()
        .unwrap();
    common::write_image(dir.path(), "libshared.dylib", &shared);
    let liba_path = dir.path().join("liba.dylib");
    let liba = ImageBuilder::dylib(&liba_path.to_string_lossy())
        .depend(&shared_path.to_string_lossy(), DependentKind::Regular)
        .build()
        .unwrap();
    common::write_image(dir.path(), "liba.dylib", &liba);
    let main = ImageBuilder::executable()
        .depend(&liba_path.to_string_lossy(), DependentKind::Regular)
        .depend(&shared_path.to_string_lossy(), DependentKind::Regular)
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);

    let launch = common::prepare(&main_path, vec![]).unwrap();
    // main, liba, libshared - loaded exactly once each
    assert_eq!(launch.state.loader_count(), 3);
    let a_ref = launch.state.loader(launch.main).dependent(0).unwrap();
    let shared_via_main = launch.state.loader(launch.main).dependent(1).unwrap();
    let shared_via_a = launch.state.loader(a_ref).dependent(0).unwrap();
    assert_eq!(shared_via_main, shared_via_a);
}

#[test]
fn entry_point_is_slid() {
    let dir = tempfile::tempdir().unwrap();
    let main = ImageBuilder::executable().entry_offset(0x48).build().unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);
    let launch = common::prepare(&main_path, vec![]).unwrap();
    match launch.entry {
        kobold::launch::EntryPoint::Main { address, .. } => {
            assert_eq!(
                address,
                launch.state.loader(launch.main).load_address() + 0x48
            );
        }
        other => panic!("expected LC_MAIN entry, got {:?}", other),
    }
}
