//! Writing past the pool's capacity forces a dirty page out through the
//! codec, and flush writes back whatever is still dirty.

mod common;

use common::{read_byte, write_byte, CipherFile};
use cryptmap::{page_size, pool_stats, vm, MappedCryptFile};

#[test]
fn dirty_page_is_written_back_on_eviction() {
    cryptmap::set_memory_size(2);
    let ps = page_size();

    let cf = CipherFile::create(4, |_| 0).unwrap();
    let mut file = MappedCryptFile::new(cf);
    let base = file.map(0).unwrap();

    write_byte(base, 0x11);
    write_byte(base.wrapping_add(ps), 0x22);
    assert_eq!(pool_stats().unwrap().nfree, 0);
    assert_eq!(file.pager().writes.get(), 0);

    // Third distinct page: the pool is dry, so one page (page 0, the
    // oldest once every accessed bit has been cleared) is encrypted back
    // out and its frame reused.
    write_byte(base.wrapping_add(2 * ps), 0x33);
    assert_eq!(file.pager().writes.get(), 1);
    assert_eq!(file.pager().reads.get(), 3);
    assert_eq!(file.resident_pages(), 2);
    assert_eq!(pool_stats().unwrap().nfree, 0);
    assert_eq!(vm::vm_pageout::stats().evictions.load(std::sync::atomic::Ordering::Relaxed), 1);

    // The still-resident dirty pages reach the ciphertext on flush.
    file.flush().unwrap();
    assert_eq!(file.pager().writes.get(), 3);
    file.check_clean();

    // The evicted page refaults from ciphertext with the written value.
    assert_eq!(read_byte(base), 0x11);
    assert_eq!(file.pager().reads.get(), 4);

    vm::audit();
}
