//! A mapping larger than the file zero-fills its tail and grows the
//! ciphertext when the tail is written back.

mod common;

use std::sync::atomic::Ordering;

use common::{read_byte, write_byte, CipherFile};
use cryptmap::{page_size, vm, MappedCryptFile, Pager};

#[test]
fn oversized_map_grows_the_file() {
    cryptmap::set_memory_size(8);
    let ps = page_size();

    let mut file = MappedCryptFile::new(CipherFile::create(2, |_| 1).unwrap());
    let base = file.map(6 * ps).unwrap();
    assert_eq!(file.map_size().unwrap(), 6 * ps);

    // Pages past the ciphertext read as zero without touching the store.
    let zero_fills = vm::vm_fault::stats().zero_fills.load(Ordering::Relaxed);
    let reads = file.pager().reads.get();
    assert_eq!(read_byte(base.wrapping_add(5 * ps + 4)), 0);
    assert_eq!(
        vm::vm_fault::stats().zero_fills.load(Ordering::Relaxed),
        zero_fills + 1
    );
    assert_eq!(file.pager().reads.get(), reads);

    // Write into the tail page and push it out.
    write_byte(base.wrapping_add(5 * ps + 3), 0x42);
    file.unmap().unwrap();
    assert_eq!(file.pager().len().unwrap(), 6 * ps as u64);

    // A fresh map sized by the file alone now covers the written page.
    let base = file.map(0).unwrap();
    assert_eq!(file.map_size().unwrap(), 6 * ps);
    assert_eq!(read_byte(base.wrapping_add(5 * ps + 3)), 0x42);
    assert_eq!(read_byte(base.wrapping_add(5 * ps + 100)), 0);
    assert_eq!(read_byte(base), 1);

    vm::audit();
}
