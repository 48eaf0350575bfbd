//! Bytes written through a mapping survive unmap/map cycles.

mod common;

use common::{read_byte, write_byte, CipherFile};
use cryptmap::{page_size, vm, MappedCryptFile, VmError};

#[test]
fn write_unmap_map_reads_back() {
    cryptmap::set_memory_size(8);
    let ps = page_size();

    let mut file = MappedCryptFile::new(CipherFile::create(4, |i| (i % 13) as u8).unwrap());
    let base = file.map(0).unwrap();
    assert_eq!(file.map_size().unwrap(), 4 * ps);

    // Initial plaintext decrypts correctly, including the last byte.
    assert_eq!(read_byte(base), 0);
    assert_eq!(read_byte(base.wrapping_add(4 * ps - 1)), ((4 * ps - 1) % 13) as u8);

    // Scatter writes across pages, including both ends of a boundary.
    let writes = [0usize, ps - 1, ps, 2 * ps + 7, 4 * ps - 1];
    for (n, &off) in writes.iter().enumerate() {
        write_byte(base.wrapping_add(off), 0xd0 + n as u8);
    }

    file.unmap().unwrap();
    assert!(matches!(file.map_base(), Err(VmError::NotMapped)));

    // Remap: every written byte comes back, unwritten bytes are intact.
    let base = file.map(0).unwrap();
    for (n, &off) in writes.iter().enumerate() {
        assert_eq!(read_byte(base.wrapping_add(off)), 0xd0 + n as u8);
    }
    assert_eq!(read_byte(base.wrapping_add(ps + 1)), ((ps + 1) % 13) as u8);
    assert_eq!(read_byte(base.wrapping_add(3 * ps)), ((3 * ps) % 13) as u8);

    // Remapping with no writes in between changes nothing.
    let base = file.map(0).unwrap();
    assert_eq!(read_byte(base), 0xd0);
    assert_eq!(read_byte(base.wrapping_add(2 * ps + 7)), 0xd3);

    vm::audit();
}
