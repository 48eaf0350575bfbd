//! Shared test fixtures: a keystream cipher file and raw touch helpers.
#![allow(dead_code)]

use std::cell::{Cell, RefCell};
use std::fs::File;
use std::io;
use std::os::unix::fs::FileExt;

use sha2::{Digest, Sha256};

use cryptmap::{page_size, Pager};

/// Ciphertext file for tests: a SHA-256 keystream XOR cipher over an
/// unlinked temp file, with call counters so scenarios can assert how
/// much I/O the paging core issued.
pub struct CipherFile {
    file: File,
    key: [u8; 32],
    pub reads: Cell<usize>,
    pub writes: Cell<usize>,
    pub read_offsets: RefCell<Vec<u64>>,
    pub fail_writes: Cell<bool>,
}

impl CipherFile {
    /// A `pages`-page file whose plaintext byte at offset `i` is
    /// `fill(i)`.
    pub fn create(pages: usize, fill: impl Fn(usize) -> u8) -> io::Result<CipherFile> {
        let ps = page_size();
        let cf = CipherFile {
            file: tempfile::tempfile()?,
            key: *b"0123456789abcdef0123456789abcdef",
            reads: Cell::new(0),
            writes: Cell::new(0),
            read_offsets: RefCell::new(Vec::new()),
            fail_writes: Cell::new(false),
        };
        let mut buf = vec![0u8; ps];
        for p in 0..pages {
            for (i, b) in buf.iter_mut().enumerate() {
                *b = fill(p * ps + i);
            }
            cf.crypt(&mut buf, (p * ps) as u64);
            cf.file.write_all_at(&buf, (p * ps) as u64)?;
        }
        Ok(cf)
    }

    /// XOR `buf` with the keystream for `offset`. Encrypt and decrypt
    /// are the same operation. `offset` must be 32-byte aligned.
    fn crypt(&self, buf: &mut [u8], offset: u64) {
        assert_eq!(offset % 32, 0);
        let mut i = 0;
        while i < buf.len() {
            let mut h = Sha256::new();
            h.update(self.key);
            h.update(((offset + i as u64) / 32).to_le_bytes());
            let ks = h.finalize();
            for (b, k) in buf[i..].iter_mut().take(32).zip(ks.iter()) {
                *b ^= k;
            }
            i += 32;
        }
    }
}

impl Pager for CipherFile {
    fn len(&self) -> io::Result<u64> {
        Ok(self.file.metadata()?.len())
    }

    fn aligned_pread(&self, dst: &mut [u8], offset: u64) -> io::Result<()> {
        self.reads.set(self.reads.get() + 1);
        self.read_offsets.borrow_mut().push(offset);
        let mut got = 0;
        while got < dst.len() {
            match self.file.read_at(&mut dst[got..], offset + got as u64)? {
                0 => break,
                n => got += n,
            }
        }
        self.crypt(&mut dst[..got], offset);
        // Anything past the ciphertext's end reads as zero plaintext.
        dst[got..].fill(0);
        Ok(())
    }

    fn aligned_pwrite(&self, src: &[u8], offset: u64) -> io::Result<()> {
        if self.fail_writes.get() {
            return Err(io::Error::other("injected writeback failure"));
        }
        self.writes.set(self.writes.get() + 1);
        let mut buf = src.to_vec();
        self.crypt(&mut buf, offset);
        self.file.write_all_at(&buf, offset)
    }
}

/// Read one byte through the mapping, forcing a real memory access.
pub fn read_byte(p: *const u8) -> u8 {
    unsafe { std::ptr::read_volatile(p) }
}

/// Write one byte through the mapping, forcing a real memory access.
pub fn write_byte(p: *mut u8, v: u8) {
    unsafe { std::ptr::write_volatile(p, v) }
}
