//! Analyzer-level properties: validated images have sane segment layouts,
//! the opcode decoders agree with the encoders, and the export trie finds
//! what the builder put in.

use std::ops::ControlFlow;

use kobold::mach::arch::GradedArchs;
use kobold::mach::builder::{
    build_export_trie, BindOpcodes, DependentKind, ExportSpec, ImageBuilder, RebaseOpcodes,
    SegmentSpec,
};
use kobold::mach::exports::{ExportTarget, ExportTrie};
use kobold::mach::validate::ValidationPolicy;
use kobold::mach::{MachFile, Platform, Version32};

fn validate(mach: &MachFile) {
    let archs = GradedArchs::x86_64();
    let policy = ValidationPolicy::for_main_executable(
        "fixture",
        &archs,
        Platform::MacOS,
        Version32::new(15, 0, 0),
    );
    mach.validate(&policy).unwrap();
}

#[test]
fn validated_segments_are_disjoint_and_monotone() {
    let image = ImageBuilder::executable()
        .segment(SegmentSpec::data(vec![0u8; 0x200]))
        .segment(SegmentSpec {
            name: "__DATA_CONST".into(),
            ..SegmentSpec::data(vec![0u8; 0x100])
        })
        .build()
        .unwrap();
    let mach = MachFile::parse(&image).unwrap();
    validate(&mach);
    let mut previous_fileoff = 0u64;
    let mut spans: Vec<(u64, u64)> = Vec::new();
    mach.for_each_segment(|segment| {
        if segment.filesize > 0 {
            assert!(segment.fileoff >= previous_fileoff);
            previous_fileoff = segment.fileoff;
        }
        for &(start, end) in &spans {
            let disjoint = segment.vmaddr + segment.vmsize <= start || end <= segment.vmaddr;
            assert!(disjoint, "segments overlap in vm");
        }
        spans.push((segment.vmaddr, segment.vmaddr + segment.vmsize));
        ControlFlow::Continue(())
    });
    assert_eq!(spans.len(), 4); // __TEXT, both data segments, __LINKEDIT
}

#[test]
fn dependents_and_rpaths_are_enumerated_in_order() {
    let image = ImageBuilder::executable()
        .depend("/usr/lib/libSystem.B.dylib", DependentKind::Regular)
        .depend("/usr/lib/libweak.dylib", DependentKind::Weak)
        .depend("/usr/lib/libup.dylib", DependentKind::Upward)
        .rpath("@loader_path/../Frameworks")
        .rpath("/usr/local/lib")
        .build()
        .unwrap();
    let mach = MachFile::parse(&image).unwrap();
    let mut seen = Vec::new();
    mach.for_each_dependent(|dep| {
        seen.push((dep.path.clone(), dep.weak, dep.upward));
        ControlFlow::Continue(())
    });
    assert_eq!(
        seen,
        vec![
            ("/usr/lib/libSystem.B.dylib".to_owned(), false, false),
            ("/usr/lib/libweak.dylib".to_owned(), true, false),
            ("/usr/lib/libup.dylib".to_owned(), false, true),
        ]
    );
    let mut rpaths = Vec::new();
    mach.for_each_rpath(|rpath| {
        rpaths.push(rpath.to_owned());
        ControlFlow::Continue(())
    });
    assert_eq!(rpaths, vec!["@loader_path/../Frameworks", "/usr/local/lib"]);
}

#[test]
fn rebase_opcode_roundtrip_law() {
    // encoding a set of rebases and decoding the stream yields the same
    // (segment, offset) pairs
    let wanted = vec![(1u64, 0x10u64), (1, 0x18), (1, 0x40), (1, 0x80)];
    let mut encoder = RebaseOpcodes::new();
    for &(seg, offset) in &wanted {
        encoder.rebase(seg, offset);
    }
    let stream = encoder.finish();
    let image = ImageBuilder::executable()
        .segment(SegmentSpec::data(vec![0u8; 0x100]))
        .rebase_opcodes(stream)
        .build()
        .unwrap();
    let mach = MachFile::parse(&image).unwrap();
    let mut decoded = Vec::new();
    mach.for_each_rebase(|event| {
        decoded.push((event.seg_index as u64, event.seg_offset));
        ControlFlow::Continue(())
    })
    .unwrap();
    assert_eq!(decoded, wanted);
}

#[test]
fn bind_opcode_roundtrip_carries_all_fields() {
    let mut encoder = BindOpcodes::new();
    encoder.bind(1, 0x20, 2, "_calloc", 16, true);
    let image = ImageBuilder::executable()
        .depend("/usr/lib/a.dylib", DependentKind::Regular)
        .depend("/usr/lib/b.dylib", DependentKind::Regular)
        .segment(SegmentSpec::data(vec![0u8; 0x100]))
        .bind_opcodes(encoder.finish())
        .build()
        .unwrap();
    let mach = MachFile::parse(&image).unwrap();
    let mut events = Vec::new();
    mach.for_each_bind(
        |event| {
            events.push((
                event.seg_offset,
                event.lib_ordinal,
                event.symbol_name.to_owned(),
                event.addend,
                event.weak_import,
            ));
            ControlFlow::Continue(())
        },
        None,
    )
    .unwrap();
    assert_eq!(events, vec![(0x20, 2, "_calloc".to_owned(), 16, true)]);
}

#[test]
fn decoder_emissions_stay_inside_their_segment() {
    // every emitted offset leaves room for a pointer before vmsize
    let mut encoder = RebaseOpcodes::new();
    encoder.rebase_run(1, 0x0, 32);
    let image = ImageBuilder::executable()
        .segment(SegmentSpec::data(vec![0u8; 0x100]))
        .rebase_opcodes(encoder.finish())
        .build()
        .unwrap();
    let mach = MachFile::parse(&image).unwrap();
    let data = mach.segment("__DATA").unwrap().vmsize;
    mach.for_each_rebase(|event| {
        assert!(event.seg_offset + 8 <= data);
        ControlFlow::Continue(())
    })
    .unwrap();
}

#[test]
fn export_trie_find_agrees_with_walk() {
    let exports = [
        ExportSpec::regular("_alpha", 0x100),
        ExportSpec::regular("_alphabet", 0x200),
        ExportSpec::weak("_omega", 0x300),
    ];
    let trie_bytes = build_export_trie(&exports);
    let trie = ExportTrie::new(&trie_bytes);
    for spec in &exports {
        let found = trie.find(&spec.name).unwrap().unwrap();
        assert_eq!(found.target, ExportTarget::Regular { offset: spec.offset });
    }
    assert!(trie.find("_alph").unwrap().is_none());
    assert!(trie.find("_omegas").unwrap().is_none());
    let mut walked = Vec::new();
    trie.for_each(|export| {
        walked.push(export.name.clone());
        ControlFlow::Continue(())
    })
    .unwrap();
    walked.sort();
    assert_eq!(walked, vec!["_alpha", "_alphabet", "_omega"]);
}

#[test]
fn uuid_platform_and_entry_survive_parsing() {
    let image = ImageBuilder::executable()
        .uuid([0xAB; 16])
        .platform(Platform::MacOS, Version32::new(12, 3, 0), Version32::new(13, 1, 0))
        .entry_offset(0x500)
        .build()
        .unwrap();
    let mach = MachFile::parse(&image).unwrap();
    assert_eq!(mach.uuid, Some([0xAB; 16]));
    let platform = mach.platform.unwrap();
    assert_eq!(platform.platform, Platform::MacOS);
    assert_eq!(platform.min_os, Version32::new(12, 3, 0));
    assert_eq!(
        mach.entry,
        Some(kobold::mach::EntryInfo::Main {
            entry_offset: 0x500,
            stack_size: 0
        })
    );
}

#[test]
fn platform_mismatch_is_rejected() {
    let image = ImageBuilder::executable()
        .platform(Platform::Ios, Version32::new(17, 0, 0), Version32::new(17, 0, 0))
        .build()
        .unwrap();
    let mach = MachFile::parse(&image).unwrap();
    let archs = GradedArchs::x86_64();
    let policy = ValidationPolicy::for_main_executable(
        "fixture",
        &archs,
        Platform::MacOS,
        Version32::new(15, 0, 0),
    );
    assert!(matches!(
        mach.validate(&policy),
        Err(kobold::error::Error::Incompatible(_))
    ));
}

#[test]
fn too_new_min_os_is_rejected_with_version_in_message() {
    let image = ImageBuilder::executable()
        .platform(Platform::MacOS, Version32::new(26, 0, 0), Version32::new(26, 0, 0))
        .build()
        .unwrap();
    let mach = MachFile::parse(&image).unwrap();
    let archs = GradedArchs::x86_64();
    let policy = ValidationPolicy::for_main_executable(
        "fixture",
        &archs,
        Platform::MacOS,
        Version32::new(15, 0, 0),
    );
    let err = mach.validate(&policy).unwrap_err();
    assert!(err.to_string().contains("26.0"));
}

#[test]
fn driverkit_executables_must_not_name_an_entry_point() {
    let archs = GradedArchs::x86_64();
    let policy = ValidationPolicy::for_main_executable(
        "fixture",
        &archs,
        Platform::DriverKit,
        Version32::new(24, 0, 0),
    );
    // LC_MAIN on a driverkit binary is malformed
    let with_main = ImageBuilder::executable()
        .platform(Platform::DriverKit, Version32::new(20, 0, 0), Version32::new(24, 0, 0))
        .build()
        .unwrap();
    let mach = MachFile::parse(&with_main).unwrap();
    let err = mach.validate(&policy).unwrap_err();
    assert!(err.to_string().contains("driverkit"));
    // without any entry command it is fine
    let without = ImageBuilder::executable()
        .no_entry()
        .platform(Platform::DriverKit, Version32::new(20, 0, 0), Version32::new(24, 0, 0))
        .build()
        .unwrap();
    MachFile::parse(&without).unwrap().validate(&policy).unwrap();
    // everything else still needs one
    let bare = ImageBuilder::executable().no_entry().build().unwrap();
    let macos_policy = ValidationPolicy::for_main_executable(
        "fixture",
        &archs,
        Platform::MacOS,
        Version32::new(15, 0, 0),
    );
    assert!(MachFile::parse(&bare).unwrap().validate(&macos_policy).is_err());
}

#[test]
fn wrong_arch_is_rejected() {
    let image = ImageBuilder::executable().build().unwrap();
    let mach = MachFile::parse(&image).unwrap();
    let archs = GradedArchs::arm64();
    let policy = ValidationPolicy::for_main_executable(
        "fixture",
        &archs,
        Platform::MacOS,
        Version32::new(15, 0, 0),
    );
    assert!(matches!(
        mach.validate(&policy),
        Err(kobold::error::Error::Incompatible(_))
    ));
}

#[test]
fn truncated_load_commands_are_malformed() {
    let mut image = ImageBuilder::executable().build().unwrap();
    // lie about the load command region size
    image[20..24].copy_from_slice(&0xffff_0000u32.to_le_bytes());
    assert!(matches!(
        MachFile::parse(&image),
        Err(kobold::error::Error::Malformed(_))
    ));
}
