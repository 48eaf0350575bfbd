//! Destroying a region steps the clock hand off its pages before they
//! are retired.

mod common;

use common::{read_byte, CipherFile};
use cryptmap::vm::{self, vm_pageout, VPage};
use cryptmap::{page_size, pool_stats, MappedCryptFile};

#[test]
fn hand_survives_region_teardown() {
    cryptmap::set_memory_size(2);
    let ps = page_size();

    let mut file = MappedCryptFile::new(CipherFile::create(2, |_| 7).unwrap());
    let base = file.map(0).unwrap();
    assert_eq!(read_byte(base), 7);
    assert_eq!(read_byte(base.wrapping_add(ps)), 7);
    assert_eq!(pool_stats().unwrap().nfree, 0);

    // Park the hand on the region's second resident page.
    vm_pageout::scan_one().unwrap();
    assert_eq!(vm_pageout::hand(), Some(VPage(base as usize + ps)));

    // Teardown retires the pages in address order; when the second one
    // goes, the hand has nowhere left to rest.
    drop(file);
    assert_eq!(vm_pageout::hand(), None);
    assert_eq!(vm_pageout::resident(), 0);
    assert_eq!(pool_stats().unwrap().nfree, 2);

    vm::audit();
}
