//! Pseudo-physical page pool
//!
//! A [`PhysMem`] holds a fixed number of page-sized frames that can be
//! mapped at arbitrary addresses inside a [`crate::vm::VmRegion`]. The
//! frames live in one contiguous mapping of an anonymous temporary file,
//! so the same physical page can appear both at its pool-side address and
//! at whatever virtual pages it is currently mapped to.
//!
//! Free frames are kept in a singly linked list whose nodes are built in
//! place inside the frames themselves, sandwiched between two magic
//! constants so that a use-after-free scribble is caught at the next
//! alloc/free boundary.

use core::cell::Cell;
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::fs::File;
use std::os::fd::{AsRawFd, RawFd};

use spin::Mutex;

use crate::error::VmError;
use crate::itree::{Itree, ItreeEntry};
use crate::itree_adapter;
use crate::vm::{die, page_size, PPage};

/// Do not try to pin more pool memory than this; pinning is best effort
/// and only worth it for small pools.
const MLOCK_SOFT_CAP: usize = 0x10_0000;

// ============================================================================
// Free-list node
// ============================================================================

/// Node of the in-frame free list. Constructed in place at the base of
/// every free frame; the two magic words detect writes through stale
/// mappings of a freed frame.
#[repr(C)]
struct FreePage {
    magic1: u64,
    next: Option<NonNull<FreePage>>,
    magic2: u64,
}

impl FreePage {
    // Arbitrary constants; GARBAGE is stamped over a node on allocation
    // so a double-free reads as corruption, not as a valid node.
    const MAGIC1: u64 = 0xc4a1_9d52_0e67_3fb8;
    const MAGIC2: u64 = 0x5b2e_71c0_84d9_aa16;
    const GARBAGE: u64 = 0x93f6_085d_bc12_47e9;

    /// Build a node at the base of frame `p`.
    ///
    /// # Safety
    ///
    /// `p` must be a page-aligned frame that is mapped read/write and not
    /// otherwise in use.
    unsafe fn construct(p: PPage) -> NonNull<FreePage> {
        debug_assert_eq!(p.0 % page_size(), 0);
        let fp = p.0 as *mut FreePage;
        (*fp).magic1 = Self::MAGIC1;
        (*fp).next = None;
        (*fp).magic2 = Self::MAGIC2;
        NonNull::new_unchecked(fp)
    }

    /// # Safety
    ///
    /// `fp` must point at a constructed node.
    unsafe fn check(fp: NonNull<FreePage>) {
        let fp = fp.as_ref();
        if fp.magic1 != Self::MAGIC1 || fp.magic2 != Self::MAGIC2 {
            die("cryptmap: page pool free list corrupted\n");
        }
    }

    /// Tear the node down and hand the frame back.
    ///
    /// # Safety
    ///
    /// `fp` must point at a constructed node.
    unsafe fn destroy(fp: NonNull<FreePage>) -> PPage {
        Self::check(fp);
        let p = fp.as_ptr();
        (*p).magic1 = Self::GARBAGE;
        (*p).magic2 = Self::GARBAGE;
        PPage(p as usize)
    }
}

// ============================================================================
// PhysMem
// ============================================================================

/// A fixed pool of pseudo-physical pages.
///
/// Every frame has a refcount: -1 while on the free list, 0 while
/// allocated but mapped nowhere, and n > 0 while mapped at n virtual
/// pages. Refcounts are maintained by the mapping layer; the pool only
/// enforces the transitions at alloc/free.
pub struct PhysMem {
    npages: usize,
    size: usize,
    file: File,
    pool: PPage,
    nfree: Cell<usize>,
    free_pages: Cell<Option<NonNull<FreePage>>>,
    refcounts: Box<[Cell<i32>]>,
    pool_link: ItreeEntry,
}

// SAFETY: the single-threaded paging contract (see `crate::vm`) is what
// actually serializes access to the interior cells; these impls only let
// a pool live in a process-global slot.
unsafe impl Send for PhysMem {}
unsafe impl Sync for PhysMem {}

itree_adapter!(PoolsByBase = PhysMem { key: pool: PPage, link: pool_link });

struct PoolRegistry {
    tree: Itree<PoolsByBase>,
}

// SAFETY: see the PhysMem impls above.
unsafe impl Send for PoolRegistry {}

/// All pools, indexed by pool base address. Never torn down; pools
/// unregister themselves on drop.
static POOLS: Mutex<PoolRegistry> = Mutex::new(PoolRegistry {
    tree: Itree::new(),
});

fn set_file_size(file: &File, size: usize) -> Result<(), VmError> {
    // Reserve the disk space now so an out-of-space condition surfaces
    // here as an error instead of as a page fault when the kernel first
    // materializes a block.
    // SAFETY: plain fd syscall.
    let rc = unsafe { libc::posix_fallocate(file.as_raw_fd(), 0, size as libc::off_t) };
    if rc == 0 {
        return Ok(());
    }
    if rc == libc::EOPNOTSUPP || rc == libc::EINVAL {
        // Filesystem cannot preallocate; fall back to truncation and
        // accept that exhaustion then surfaces asynchronously.
        return file.set_len(size as u64).map_err(|source| VmError::Syscall {
            op: "ftruncate",
            source,
        });
    }
    Err(VmError::Syscall {
        op: "posix_fallocate",
        source: std::io::Error::from_raw_os_error(rc),
    })
}

impl PhysMem {
    /// Create a pool of `npages` frames backed by an unlinked temporary
    /// file. The pool registers itself so that frames can be resolved
    /// back to it; the returned box must therefore stay where it is.
    pub fn new(npages: usize) -> Result<Box<Self>, VmError> {
        let ps = page_size();
        if npages == 0 || npages >= isize::MAX as usize / ps {
            return Err(VmError::PoolSize { npages });
        }
        let size = npages * ps;

        // tempfile() gives an already-unlinked, close-on-exec fd.
        let file = tempfile::tempfile().map_err(|source| VmError::Syscall {
            op: "tempfile",
            source,
        })?;
        set_file_size(&file, size)?;

        // SAFETY: fresh shared mapping of a file we own, length checked
        // above.
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                size,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_SHARED,
                file.as_raw_fd(),
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(VmError::os("mmap"));
        }

        // Keep the plaintext frames out of swap when the pool is small
        // enough to be polite about it. mlock can fail for unprivileged
        // processes; munmap undoes a successful lock, so the result is
        // ignored either way.
        if size <= MLOCK_SOFT_CAP {
            // SAFETY: locks the mapping established above.
            unsafe { libc::mlock(base, size) };
        }

        let pool = PPage(base as usize);
        let pm = Box::new(PhysMem {
            npages,
            size,
            file,
            pool,
            nfree: Cell::new(npages),
            free_pages: Cell::new(None),
            refcounts: (0..npages).map(|_| Cell::new(-1)).collect(),
            pool_link: ItreeEntry::new(),
        });

        // Thread every frame onto the free list, lowest address first.
        let mut addr = pool.0 + size;
        while addr != pool.0 {
            addr -= ps;
            // SAFETY: addr walks the frames of the mapping created above.
            unsafe {
                let fp = FreePage::construct(PPage(addr));
                (*fp.as_ptr()).next = pm.free_pages.get();
                pm.free_pages.set(Some(fp));
            }
        }

        // SAFETY: the box gives the pool a stable address for the
        // registry; Drop unregisters before the memory goes away.
        unsafe { POOLS.lock().tree.insert(NonNull::from(&*pm)) };
        log::debug!("pool: {} pages at {:#x}", npages, pool.0);
        Ok(pm)
    }

    /// Total number of frames.
    pub fn npages(&self) -> usize {
        self.npages
    }

    /// Number of frames currently on the free list.
    pub fn nfree(&self) -> usize {
        self.nfree.get()
    }

    /// Address of the first (lowest) frame.
    pub fn pool_base(&self) -> PPage {
        self.pool
    }

    pub(crate) fn fd(&self) -> RawFd {
        self.file.as_raw_fd()
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            npages: self.npages,
            nfree: self.nfree.get(),
        }
    }

    /// Pop a frame off the free list, or `None` if the pool is empty.
    pub fn page_alloc(&self) -> Option<PPage> {
        let fp = self.free_pages.get()?;
        // SAFETY: nodes on the free list are constructed and live inside
        // our own mapping.
        let p = unsafe {
            self.free_pages.set((*fp.as_ptr()).next);
            FreePage::destroy(fp)
        };
        self.nfree.set(self.nfree.get() - 1);
        let c = self.refcount(p);
        debug_assert_eq!(c.get(), -1, "allocated frame was not free");
        c.set(0);
        Some(p)
    }

    /// Return a frame to the free list. The frame must not be mapped
    /// anywhere (refcount 0).
    pub fn page_free(&self, p: PPage) {
        debug_assert_eq!(p.0 % page_size(), 0);
        let c = self.refcount(p);
        // A nonzero count here means a double free or a frame freed while
        // still mapped.
        assert_eq!(c.get(), 0, "freed frame is still mapped or already free");
        c.set(-1);
        // SAFETY: the frame is ours and no longer mapped at any VPage.
        unsafe {
            let fp = FreePage::construct(p);
            (*fp.as_ptr()).next = self.free_pages.get();
            self.free_pages.set(Some(fp));
        }
        self.nfree.set(self.nfree.get() + 1);
    }

    /// Refcount slot for frame `p`. `p` must belong to this pool.
    pub(crate) fn refcount(&self, p: PPage) -> &Cell<i32> {
        assert!(
            self.pool.0 <= p.0 && p.0 < self.pool.0 + self.size,
            "frame does not belong to this pool"
        );
        &self.refcounts[(p.0 - self.pool.0) / page_size()]
    }

    fn audit(&self, mapped: &BTreeMap<PPage, i32>) {
        let ps = page_size();
        // Collect the free list, checking the magics as we go.
        let mut free = std::collections::BTreeSet::new();
        let mut cur = self.free_pages.get();
        while let Some(fp) = cur {
            // SAFETY: free-list nodes live in our mapping.
            unsafe {
                FreePage::check(fp);
                free.insert(fp.as_ptr() as usize);
                cur = (*fp.as_ptr()).next;
            }
        }
        assert_eq!(free.len(), self.nfree.get(), "free list length drifted");

        for i in 0..self.npages {
            let addr = self.pool.0 + i * ps;
            let rc = self.refcounts[i].get();
            if free.contains(&addr) {
                assert_eq!(rc, -1, "free frame with live refcount");
            } else {
                let expect = mapped.get(&PPage(addr)).copied().unwrap_or(0);
                assert_eq!(rc, expect, "refcount does not match mapping records");
            }
        }
    }
}

impl Drop for PhysMem {
    fn drop(&mut self) {
        debug_assert_eq!(
            self.nfree.get(),
            self.npages,
            "pool dropped with frames still allocated"
        );
        // SAFETY: registered in new(); the registry never dereferences
        // entries after erase.
        unsafe { POOLS.lock().tree.erase(NonNull::from(&*self)) };
        // SAFETY: unmaps exactly the mapping created in new(). The
        // backing file closes with `self.file`.
        unsafe { libc::munmap(self.pool.0 as *mut libc::c_void, self.size) };
        log::debug!("pool: released {} pages at {:#x}", self.npages, self.pool.0);
    }
}

/// Snapshot of pool occupancy.
#[derive(Debug, Clone, Copy)]
pub struct PoolStats {
    pub npages: usize,
    pub nfree: usize,
}

/// Resolve a frame address to its owning pool.
///
/// Aborts if `p` is not inside any registered pool: such an address can
/// only come from corrupted paging state.
pub fn find(p: PPage) -> NonNull<PhysMem> {
    debug_assert_eq!(p.0 % page_size(), 0);
    let reg = POOLS.lock();
    match reg.tree.upper_bound_prev(p) {
        // SAFETY: registered pools are live by the registration contract.
        Some(pm) if p.0 < unsafe { pm.as_ref() }.pool.0 + unsafe { pm.as_ref() }.size => pm,
        _ => die("cryptmap: frame address is not in any pool\n"),
    }
}

/// Check every registered pool against the mapping table's per-frame
/// counts. Called from [`crate::vm::audit`].
pub(crate) fn audit_pools(mapped: &BTreeMap<PPage, i32>) {
    let reg = POOLS.lock();
    let mut cur = reg.tree.first();
    while let Some(pm) = cur {
        // SAFETY: registered pools are live.
        unsafe {
            pm.as_ref().audit(mapped);
            cur = reg.tree.next(pm);
        }
    }
}
