//! A failed writeback leaves the page dirty; the next flush retries it.

mod common;

use common::{write_byte, CipherFile};
use cryptmap::{vm, MappedCryptFile, VmError};

#[test]
fn flush_failure_keeps_page_dirty() {
    cryptmap::set_memory_size(4);

    let mut file = MappedCryptFile::new(CipherFile::create(2, |_| 0).unwrap());
    let base = file.map(0).unwrap();
    write_byte(base, 0x7f);

    file.pager().fail_writes.set(true);
    match file.flush() {
        Err(VmError::Store(_)) => {}
        other => panic!("expected a store error, got {other:?}"),
    }
    assert_eq!(file.pager().writes.get(), 0);

    // The page stayed dirty, so clearing the fault retries the write.
    file.pager().fail_writes.set(false);
    file.flush().unwrap();
    assert_eq!(file.pager().writes.get(), 1);
    file.check_clean();

    // No dirty pages left: flushing again is free.
    file.flush().unwrap();
    assert_eq!(file.pager().writes.get(), 1);

    vm::audit();
}
