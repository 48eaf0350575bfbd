//! A page whose accessed bit was re-armed survives the sweep; the page
//! left unarmed is the victim.

mod common;

use std::sync::atomic::Ordering;

use common::{read_byte, CipherFile};
use cryptmap::vm::{self, vm_fault, vm_pageout};
use cryptmap::{page_size, MappedCryptFile};

#[test]
fn rearmed_page_survives_eviction() {
    cryptmap::set_memory_size(2);
    let ps = page_size();

    let cf = CipherFile::create(3, |i| (i / ps) as u8).unwrap();
    let mut file = MappedCryptFile::new(cf);
    let base = file.map(0).unwrap();

    // Fill both frames.
    assert_eq!(read_byte(base), 0);
    assert_eq!(read_byte(base.wrapping_add(ps)), 1);

    // Run the hand over both pages: both lose their accessed bit and
    // their access, and the hand comes back around to page 0.
    vm_pageout::scan_one().unwrap();
    vm_pageout::scan_one().unwrap();

    // Touch page 0 again; the refault re-arms its accessed bit.
    assert_eq!(read_byte(base), 0);

    // Faulting page 2 in must evict: page 0 spends its second chance
    // and survives, page 1 is taken.
    assert_eq!(read_byte(base.wrapping_add(2 * ps)), 2);
    assert_eq!(file.resident_pages(), 2);
    assert_eq!(vm_pageout::stats().evictions.load(Ordering::Relaxed), 1);
    // Clean eviction: nothing was dirty.
    assert_eq!(vm_pageout::stats().writebacks.load(Ordering::Relaxed), 0);
    assert_eq!(file.pager().writes.get(), 0);

    // Pages 0 and 2 are the residents: re-reading them installs nothing
    // new.
    let installs = vm_fault::stats().installs.load(Ordering::Relaxed);
    assert_eq!(installs, 3);
    assert_eq!(read_byte(base), 0);
    assert_eq!(read_byte(base.wrapping_add(2 * ps)), 2);
    assert_eq!(vm_fault::stats().installs.load(Ordering::Relaxed), installs);

    vm::audit();
}
