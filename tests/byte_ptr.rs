//! The checked byte accessor resolves offsets inside the mapping and
//! rejects everything else.

mod common;

use common::{read_byte, write_byte, CipherFile};
use cryptmap::{page_size, MappedCryptFile, VmError};

#[test]
fn byte_ptr_addresses_the_mapping() {
    cryptmap::set_memory_size(8);
    let ps = page_size();

    let mut file = MappedCryptFile::new(CipherFile::create(2, |i| (i % 7) as u8).unwrap());
    assert!(matches!(file.byte_ptr(0), Err(VmError::NotMapped)));

    let base = file.map(0).unwrap();
    assert_eq!(file.byte_ptr(0).unwrap(), base);

    // Interior byte: reads the decrypted value, and writes land in the
    // same page the base pointer sees.
    let off = ps + 11;
    let p = file.byte_ptr(off).unwrap();
    assert_eq!(p, base.wrapping_add(off));
    assert_eq!(read_byte(p), (off % 7) as u8);
    write_byte(p, 0x9c);
    assert_eq!(read_byte(base.wrapping_add(off)), 0x9c);

    // The last byte of the mapping is still in bounds.
    let last = 2 * ps - 1;
    assert_eq!(read_byte(file.byte_ptr(last).unwrap()), (last % 7) as u8);
}

#[test]
#[should_panic(expected = "byte index outside the mapping")]
fn byte_ptr_rejects_out_of_bounds() {
    cryptmap::set_memory_size(8);
    let ps = page_size();

    let mut file = MappedCryptFile::new(CipherFile::create(1, |_| 0).unwrap());
    file.map(0).unwrap();
    let _ = file.byte_ptr(ps);
}
