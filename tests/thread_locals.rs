//! Thread-local setup over a real loaded image: thunks are rewritten into
//! the packed form, first use on a thread allocates and copies the
//! template, and each thread gets its own storage.

mod common;

use kobold::helpers::{self, HelpersSlot};
use kobold::mach::builder::{ImageBuilder, SectionSpec, SegmentSpec};
use kobold::mach::constants::{S_THREAD_LOCAL_REGULAR, S_THREAD_LOCAL_VARIABLES};
use kobold::tlv::{self, TlvThunk64};

static SLOT: HelpersSlot = HelpersSlot::new();

#[test]
fn tlv_first_use_allocates_per_thread_storage() {
    let dir = tempfile::tempdir().unwrap();
    // one raw thunk {bootstrap, 0, offset 0} followed by 8 bytes of
    // template content
    let thunk = vec![0u8; 24];
    let template = vec![1u8, 2, 3, 4, 5, 6, 7, 8];
    let main = ImageBuilder::executable()
        .segment(SegmentSpec {
            sections: vec![
                SectionSpec::new("__thread_vars", S_THREAD_LOCAL_VARIABLES, thunk),
                SectionSpec::new("__thread_data", S_THREAD_LOCAL_REGULAR, template),
            ],
            ..SegmentSpec::data(vec![])
        })
        .build()
        .unwrap();
    let main_path = common::write_image(dir.path(), "main", &main);
    let launch = common::prepare(&main_path, vec![]).unwrap();

    let _ = SLOT.publish(helpers::host_helpers());
    launch.set_up_thread_locals(&SLOT).unwrap();

    let loader = launch.state.loader(launch.main);
    let data_offset = common::region_offset(&launch, launch.main, "__DATA");
    let thunk_address = loader.load_address() + data_offset;
    let thunk_ptr = thunk_address as *const TlvThunk64;

    // the thunk was rewritten: func points at the accessor, the template
    // delta reaches the content section right behind the thunk
    let packed = unsafe { &*thunk_ptr };
    assert_eq!(packed.func, tlv::tlv_get_addr as usize as u64);
    assert_eq!(packed.offset, 0);
    assert_eq!(packed.delta_to_initial_content, 24);
    assert_eq!(packed.initial_content_size, 8);

    let first = unsafe { tlv::tlv_get_addr(thunk_ptr) } as *mut u8;
    assert!(!first.is_null());
    let bytes = unsafe { core::slice::from_raw_parts_mut(first, 8) };
    assert_eq!(bytes, &[1, 2, 3, 4, 5, 6, 7, 8]);

    // same thread: same storage, writes persist
    bytes[0] = 0xff;
    let second = unsafe { tlv::tlv_get_addr(thunk_ptr) } as *mut u8;
    assert_eq!(first, second);
    assert_eq!(unsafe { *second }, 0xff);

    // a different thread gets distinct storage with pristine content
    let thunk_usize = thunk_address as usize;
    let first_usize = first as usize;
    std::thread::spawn(move || {
        let other = unsafe { tlv::tlv_get_addr(thunk_usize as *const TlvThunk64) } as *mut u8;
        assert!(!other.is_null());
        assert_ne!(other as usize, first_usize);
        let bytes = unsafe { core::slice::from_raw_parts(other, 8) };
        assert_eq!(bytes, &[1, 2, 3, 4, 5, 6, 7, 8]);
    })
    .join()
    .unwrap();
}
