//! Chained-fixup application: rebases and binds packed into pointers, the
//! imports table, and interposition rewriting a chained bind's target.

mod common;

use kobold::mach::builder::{
    build_chained_fixups, BindOpcodes, ChainedImportSpec, ChainedSlot, DependentKind, ExportSpec,
    ImageBuilder, RebaseOpcodes, SectionSpec, SegmentSpec,
};
use kobold::mach::constants::S_INTERPOSING;

const BASE: u64 = 0x1_0000_0000;

fn libbar(path: &str) -> Vec<u8> {
    ImageBuilder::dylib(path)
        .segment(SegmentSpec::data(vec![0u8; 0x100]))
        .exports(&[ExportSpec::regular("_bar", 0x1000)])
        .build()
        .unwrap()
}

#[test]
fn chained_rebase_and_bind_apply() {
    let dir = tempfile::tempdir().unwrap();
    let bar_path = dir.path().join("libbar.dylib");
    common::write_image(dir.path(), "libbar.dylib", &libbar(&bar_path.to_string_lossy()));

    let mut data = vec![0u8; 0x100];
    let slots = [
        (0x8u64, ChainedSlot::Rebase { target_offset: 0x20, high8: 0 }),
        (0x40, ChainedSlot::Bind { ordinal: 0 }),
    ];
    let imports = [ChainedImportSpec {
        lib_ordinal: 1,
        name: "_bar".into(),
        weak_import: false,
        addend: 0,
    }];
    // the data segment lands one page past __TEXT
    let blob = build_chained_fixups(0x1000, &mut data, &slots, &imports).unwrap();
    let main = ImageBuilder::executable()
        .depend(&bar_path.to_string_lossy(), DependentKind::Regular)
        .segment(SegmentSpec::data(data))
        .chained_fixups(blob)
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);

    let launch = common::prepare(&main_path, vec![]).unwrap();
    let state = &launch.state;
    let main_ldr = state.loader(launch.main);
    let bar_ref = main_ldr.dependent(0).unwrap();
    let data_offset = common::region_offset(&launch, launch.main, "__DATA");
    assert_eq!(data_offset, 0x1000);
    let region = &main_ldr.image.region;
    // when the chained value is read back, converting it yields exactly
    // the resolved target
    assert_eq!(
        region.read_u64(data_offset + 0x8).unwrap(),
        main_ldr.load_address() + 0x20
    );
    assert_eq!(
        region.read_u64(data_offset + 0x40).unwrap(),
        state.loader(bar_ref).load_address() + 0x1000
    );
}

#[test]
fn chained_import_addend_is_folded_into_the_target() {
    let dir = tempfile::tempdir().unwrap();
    let bar_path = dir.path().join("libbar.dylib");
    common::write_image(dir.path(), "libbar.dylib", &libbar(&bar_path.to_string_lossy()));

    let mut data = vec![0u8; 0x100];
    let slots = [(0x10u64, ChainedSlot::Bind { ordinal: 0 })];
    let imports = [ChainedImportSpec {
        lib_ordinal: 1,
        name: "_bar".into(),
        weak_import: false,
        addend: 0x30,
    }];
    let blob = build_chained_fixups(0x1000, &mut data, &slots, &imports).unwrap();
    let main = ImageBuilder::executable()
        .depend(&bar_path.to_string_lossy(), DependentKind::Regular)
        .segment(SegmentSpec::data(data))
        .chained_fixups(blob)
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);
    let launch = common::prepare(&main_path, vec![]).unwrap();
    let bar_ref = launch.state.loader(launch.main).dependent(0).unwrap();
    let stored = launch
        .state
        .loader(launch.main)
        .image
        .region
        .read_u64(0x1010)
        .unwrap();
    assert_eq!(
        stored,
        launch.state.loader(bar_ref).load_address() + 0x1000 + 0x30
    );
}

#[test]
fn interposition_rewrites_chained_bind_targets() {
    let dir = tempfile::tempdir().unwrap();
    let bar_path = dir.path().join("libbar.dylib");
    common::write_image(dir.path(), "libbar.dylib", &libbar(&bar_path.to_string_lossy()));

    // the interposer: one (replacement, replacee) tuple; the replacement
    // is its own code at +0x40, the replacee resolves to libbar's _bar
    let mut tuple = vec![0u8; 16];
    tuple[..8].copy_from_slice(&(BASE + 0x40).to_le_bytes());
    let mut rebases = RebaseOpcodes::new();
    rebases.rebase(1, 0x0);
    let mut binds = BindOpcodes::new();
    binds.bind(1, 0x8, 1, "_bar", 0, false);
    let interposer_path = dir.path().join("libspy.dylib");
    let interposer = ImageBuilder::dylib(&interposer_path.to_string_lossy())
        .depend(&bar_path.to_string_lossy(), DependentKind::Regular)
        .segment(SegmentSpec {
            sections: vec![SectionSpec::new("__interpose", S_INTERPOSING, tuple)],
            ..SegmentSpec::data(vec![])
        })
        .rebase_opcodes(rebases.finish())
        .bind_opcodes(binds.finish())
        .build()
        .unwrap();
    common::write_image(dir.path(), "libspy.dylib", &interposer);

    // the program: a chained bind to _bar
    let mut data = vec![0u8; 0x100];
    let slots = [(0x40u64, ChainedSlot::Bind { ordinal: 0 })];
    let imports = [ChainedImportSpec {
        lib_ordinal: 1,
        name: "_bar".into(),
        weak_import: false,
        addend: 0,
    }];
    let blob = build_chained_fixups(0x1000, &mut data, &slots, &imports).unwrap();
    let main = ImageBuilder::executable()
        .depend(&bar_path.to_string_lossy(), DependentKind::Regular)
        .segment(SegmentSpec::data(data))
        .chained_fixups(blob)
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);

    let launch = common::prepare(
        &main_path,
        vec![format!(
            "DYLD_INSERT_LIBRARIES={}",
            interposer_path.display()
        )],
    )
    .unwrap();
    let state = &launch.state;
    assert_eq!(launch.inserted.len(), 1);
    let spy = launch.inserted[0];
    // the program's bind site holds the replacement, not _bar itself
    let stored = state
        .loader(launch.main)
        .image
        .region
        .read_u64(0x1040)
        .unwrap();
    assert_eq!(stored, state.loader(spy).load_address() + 0x40);
    // while the interposer's own record of _bar is untouched
    let spy_data = common::region_offset(&launch, spy, "__DATA");
    let bar_ref = state.loader(launch.main).dependent(0).unwrap();
    assert_eq!(
        state.loader(spy).image.region.read_u64(spy_data + 0x8).unwrap(),
        state.loader(bar_ref).load_address() + 0x1000
    );
}
