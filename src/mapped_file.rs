//! Mapped encrypted files
//!
//! [`MappedCryptFile`] glues a [`Pager`] (the encrypt/decrypt collaborator)
//! to the paging core: `map()` hands back a pointer to a byte range whose
//! contents are the decrypted file, materialized page by page as it is
//! touched. Writes accumulate in the frame pool and reach the ciphertext
//! on `flush()`, on `unmap()`, or when the pool evicts the page.
//!
//! All mapped files share one process-wide frame pool, created on the
//! first `map()` with the size configured through [`set_memory_size`].
//! Eviction pressure therefore crosses files by design.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicUsize, Ordering};

use spin::Once;

use crate::error::VmError;
use crate::pager::Pager;
use crate::vm::{PagedRegion, PhysMem, PoolStats};

/// Pool size used when [`set_memory_size`] was never called.
const DEFAULT_POOL_PAGES: usize = 1000;

static POOL_NPAGES: AtomicUsize = AtomicUsize::new(DEFAULT_POOL_PAGES);
static POOL: Once<Box<PhysMem>> = Once::new();

/// Configure the size, in pages, of the frame pool shared by every
/// mapped file in the process. Must be called before the first `map()`
/// anywhere; once the pool exists, further calls have no effect.
pub fn set_memory_size(npages: usize) {
    POOL_NPAGES.store(npages, Ordering::Relaxed);
}

fn process_pool() -> Result<NonNull<PhysMem>, VmError> {
    let pool = POOL.try_call_once(|| PhysMem::new(POOL_NPAGES.load(Ordering::Relaxed)))?;
    Ok(NonNull::from(&**pool))
}

/// Occupancy of the shared pool, or `None` before the first `map()`.
pub fn pool_stats() -> Option<PoolStats> {
    POOL.get().map(|p| p.stats())
}

/// An encrypted file that can be memory-mapped.
///
/// Just like `mmap` of the underlying file, except the bytes seen through
/// the mapping are plaintext: pages decrypt on the way in and encrypt on
/// the way back out.
pub struct MappedCryptFile<P: Pager + 'static> {
    // Declared before `pager`: the region (and its resident pages, which
    // hold a raw pager reference for writeback) must die first.
    mapped: Option<Box<PagedRegion>>,
    pager: Box<P>,
}

impl<P: Pager + 'static> MappedCryptFile<P> {
    /// Wrap a pager. Nothing is mapped yet.
    pub fn new(pager: P) -> Self {
        MappedCryptFile {
            mapped: None,
            pager: Box::new(pager),
        }
    }

    /// Map the decrypted contents and return the address of the first
    /// byte. The range covers the larger of `min_size` and the file's
    /// current length, so a file can be grown by mapping it larger and
    /// writing past its old end. Remapping an already-mapped file
    /// flushes and replaces the old range, invalidating old pointers.
    pub fn map(&mut self, min_size: usize) -> Result<*mut u8, VmError> {
        if self.mapped.is_some() {
            self.unmap()?;
        }
        let pool = process_pool()?;
        let nbytes = (self.pager.len()? as usize).max(min_size);
        // SAFETY: `pager` is boxed and declared to outlive `mapped`, and
        // the process pool is never destroyed.
        let region = unsafe {
            let pager = NonNull::from(&*self.pager as &dyn Pager);
            PagedRegion::new(nbytes, pager, pool)?
        };
        let base = region.base().as_mut_ptr();
        log::debug!("mapped {} bytes at {:p}", nbytes, base);
        self.mapped = Some(region);
        Ok(base)
    }

    /// Flush all dirty pages and remove the mapping, invalidating every
    /// pointer into it. A flush failure leaves the file mapped so the
    /// writeback can be retried.
    pub fn unmap(&mut self) -> Result<(), VmError> {
        let Some(region) = &self.mapped else {
            return Ok(());
        };
        region.flush()?;
        log::debug!("unmapping {:#x}", region.base().0);
        self.mapped = None;
        Ok(())
    }

    /// Address of the first byte of the mapping.
    pub fn map_base(&self) -> Result<*mut u8, VmError> {
        self.mapped
            .as_ref()
            .map(|r| r.base().as_mut_ptr())
            .ok_or(VmError::NotMapped)
    }

    /// Size of the mapping in bytes.
    pub fn map_size(&self) -> Result<usize, VmError> {
        self.mapped
            .as_ref()
            .map(|r| r.len())
            .ok_or(VmError::NotMapped)
    }

    /// Bounds-checked pointer to byte `i` of the mapping.
    pub fn byte_ptr(&self, i: usize) -> Result<*mut u8, VmError> {
        let region = self.mapped.as_ref().ok_or(VmError::NotMapped)?;
        assert!(i < region.len(), "byte index outside the mapping");
        Ok(unsafe { region.base().as_mut_ptr().add(i) })
    }

    /// Write every dirty page back to the ciphertext without evicting
    /// anything. Pages that fail to write stay dirty, so a later flush
    /// retries them.
    pub fn flush(&mut self) -> Result<(), VmError> {
        match &self.mapped {
            Some(region) => region.flush(),
            None => Ok(()),
        }
    }

    /// Number of this file's pages currently resident in the pool.
    pub fn resident_pages(&self) -> usize {
        self.mapped.as_ref().map_or(0, |r| r.resident())
    }

    /// The underlying pager.
    pub fn pager(&self) -> &P {
        &self.pager
    }

    /// Debug predicate: every resident page is clean and at most
    /// readable, as after a successful [`flush`](Self::flush).
    pub fn check_clean(&self) {
        if let Some(region) = &self.mapped {
            region.check_clean();
        }
    }
}

impl<P: Pager + 'static> Drop for MappedCryptFile<P> {
    fn drop(&mut self) {
        if self.mapped.is_some() {
            // Dirty data is on the line; try to push it out, but the
            // mapping goes away regardless.
            if let Err(e) = self.flush() {
                log::warn!("flush during drop failed, dirty pages lost: {e}");
            }
            self.mapped = None;
        }
    }
}
