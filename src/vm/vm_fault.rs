//! Fault resolution and per-page software state
//!
//! A [`PagedRegion`] ties a reserved virtual range to a [`Pager`]. Pages
//! become resident on first touch: the fault handler allocates a frame
//! (evicting if the pool is dry), reads the page in, and then narrows the
//! kernel protection so that the *next* touch faults again and re-arms
//! the software bits.
//!
//! The accessed and dirty bits are synthesized entirely from protection
//! changes. Widening a page to readable marks it accessed, widening to
//! writable marks it dirty, and the clock sweep drops pages back to no
//! access so the bits stay fresh. There is no reliance on hardware
//! reference bits.

use core::cell::Cell;
use core::mem::MaybeUninit;
use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use crate::error::VmError;
use crate::ilist::IlistEntry;
use crate::itree::{Itree, ItreeEntry};
use crate::itree_adapter;
use crate::pager::Pager;
use crate::vm::{
    page_size, round_page, trunc_page, vm_page::PhysMem, vm_pageout, vm_region::VmRegion, PPage,
    VPage, VmProt,
};

// ============================================================================
// Fault statistics
// ============================================================================

/// Global fault counters, all relaxed. The fault path may not log, so
/// these are its only observable trace.
#[derive(Debug, Default)]
pub struct FaultStats {
    /// Faults delivered to paged regions.
    pub total: AtomicU64,
    /// Faults that installed a new resident page.
    pub installs: AtomicU64,
    /// Faults resolved by widening an existing page's protection.
    pub protects: AtomicU64,
    /// Installed pages that lie past the backing store and were
    /// zero-filled instead of read.
    pub zero_fills: AtomicU64,
}

static FAULT_STATS: FaultStats = FaultStats {
    total: AtomicU64::new(0),
    installs: AtomicU64::new(0),
    protects: AtomicU64::new(0),
    zero_fills: AtomicU64::new(0),
};

/// Get fault statistics.
pub fn stats() -> &'static FaultStats {
    &FAULT_STATS
}

// ============================================================================
// Page-table entry
// ============================================================================

/// Software page-table entry for one resident page.
///
/// A `Pte` exists exactly while its page holds a frame. It lives in two
/// collections at once: its region's page table (ordered by virtual
/// page) and the global clock list (insertion order), through two
/// embedded links.
pub struct Pte {
    pub(crate) vp: VPage,
    pub(crate) pp: PPage,
    pub(crate) prot: Cell<VmProt>,
    /// Protection was recently widened to readable.
    pub(crate) accessed: Cell<bool>,
    /// Protection was recently widened to writable.
    pub(crate) dirty: Cell<bool>,
    pub(crate) region: NonNull<PagedRegion>,
    tree_link: ItreeEntry,
    pub(crate) clock_link: IlistEntry,
}

itree_adapter!(pub(crate) PtesByVp = Pte { key: vp: VPage, link: tree_link });

impl Pte {
    pub fn vp(&self) -> VPage {
        self.vp
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty.get()
    }

    /// Change the kernel protection and fold the widening into the
    /// software bits.
    pub(crate) fn protect(&self, prot: VmProt) -> Result<(), VmError> {
        self.prot.set(prot);
        VmRegion::map(self.vp, self.pp, prot)?;
        if prot.can_read() {
            self.accessed.set(true);
        }
        if prot.can_write() {
            self.dirty.set(true);
        }
        Ok(())
    }

    /// Take away the page's access so the next touch refaults, and
    /// forget that it was accessed. The clock sweep calls this to arm
    /// its second chance.
    pub(crate) fn clear_accessed(&self) -> Result<(), VmError> {
        self.accessed.set(false);
        self.protect(VmProt::NONE)
    }

    /// Final teardown: unmap the page (dropping the frame's refcount to
    /// zero) and return the frame to its pool. The caller has already
    /// unlinked the entry from both collections.
    ///
    /// # Safety
    ///
    /// `pte` must have come from `Box::leak` in `handle_fault` and must
    /// no longer be reachable from any collection.
    pub(crate) unsafe fn destroy(pte: NonNull<Pte>) {
        let pte = Box::from_raw(pte.as_ptr());
        debug_assert!(!pte.tree_link.in_tree() && !pte.clock_link.in_list());
        if VmRegion::unmap(pte.vp).is_err() {
            // Tearing down a mapping cannot fail without leaving kernel
            // and table state disagreeing, which nothing can repair.
            crate::vm::die("cryptmap: failed to unmap a resident page\n");
        }
        let pool = crate::vm::vm_page::find(pte.pp);
        // SAFETY: pools outlive their frames' PTEs.
        pool.as_ref().page_free(pte.pp);
    }
}

// ============================================================================
// PagedRegion
// ============================================================================

/// A demand-paged view of a [`Pager`]'s contents.
///
/// Owns the reserved region and the page table. Resident pages are
/// created by the fault handler and destroyed by eviction or teardown;
/// teardown walks the table in address order and retires every entry
/// before the reservation is released.
pub struct PagedRegion {
    vmem: Box<VmRegion>,
    pub(crate) pt: Itree<PtesByVp>,
    pager: NonNull<dyn Pager>,
    pub(crate) pool: NonNull<PhysMem>,
}

impl PagedRegion {
    /// Reserve `nbytes` and arrange for faults in the range to page
    /// against `pager`, drawing frames from `pool`.
    ///
    /// # Safety
    ///
    /// `pager` and `pool` must outlive the region and everything it
    /// pages in.
    pub unsafe fn new(
        nbytes: usize,
        pager: NonNull<dyn Pager>,
        pool: NonNull<PhysMem>,
    ) -> Result<Box<Self>, VmError> {
        // The fault callback needs the region's address before the
        // region exists, so reserve the box first and fill it in after
        // the inner region is up. No fault can arrive before the first
        // touch of the range, which is after this function returns.
        let mut slot: Box<MaybeUninit<PagedRegion>> = Box::new_uninit();
        let this = NonNull::new(slot.as_mut_ptr()).expect("box allocation");
        let vmem = VmRegion::new(nbytes, Box::new(move |addr| handle_fault(this, addr)))?;
        slot.write(PagedRegion {
            vmem,
            pt: Itree::new(),
            pager,
            pool,
        });
        Ok(slot.assume_init())
    }

    /// Address of the first byte of the paged range.
    pub fn base(&self) -> VPage {
        self.vmem.base()
    }

    /// Size of the paged range in bytes.
    pub fn len(&self) -> usize {
        self.vmem.len()
    }

    /// Number of currently resident pages.
    pub fn resident(&self) -> usize {
        self.pt.len()
    }

    pub(crate) fn pager(&self) -> NonNull<dyn Pager> {
        self.pager
    }

    /// Write every dirty page back to the pager, in address order. Pages
    /// stay resident; each written page is left readable with a clean
    /// dirty bit, so an untouched region needs no further writeback.
    pub fn flush(&self) -> Result<(), VmError> {
        let ps = page_size();
        let mut cur = self.pt.first();
        while let Some(p) = cur {
            // SAFETY: entries in the table are live.
            let pte = unsafe { p.as_ref() };
            if pte.dirty.get() {
                // The page may currently be inaccessible; give the codec
                // a readable view of the plaintext.
                pte.protect(VmProt::READ | VmProt::WRITE)?;
                let off = (pte.vp.0 - self.base().0) as u64;
                // SAFETY: the page was just made readable and nothing
                // else references it during the call.
                let src = unsafe { core::slice::from_raw_parts(pte.vp.as_ptr(), ps) };
                // SAFETY: constructed with a pager that outlives us.
                unsafe { self.pager.as_ref() }.aligned_pwrite(src, off)?;
                pte.dirty.set(false);
                pte.protect(VmProt::READ)?;
            }
            cur = unsafe { self.pt.next(p) };
        }
        Ok(())
    }

    /// Debug predicate: every resident page is clean and at most
    /// readable. Holds after a successful [`flush`](Self::flush).
    pub fn check_clean(&self) {
        let mut cur = self.pt.first();
        while let Some(p) = cur {
            // SAFETY: entries in the table are live.
            let pte = unsafe { p.as_ref() };
            assert!(!pte.dirty.get(), "dirty page survived flush");
            assert!(
                !pte.prot.get().can_write(),
                "writable page survived flush"
            );
            cur = unsafe { self.pt.next(p) };
        }
    }
}

impl Drop for PagedRegion {
    fn drop(&mut self) {
        // Retire every resident page, lowest address first. retire()
        // reaches back into self.pt through the entry's region pointer,
        // so step to the successor before the entry disappears.
        let mut cur = self.pt.first();
        while let Some(p) = cur {
            // SAFETY: entries are live until retired; retire unlinks p
            // from the clock (advancing the hand off it), erases it from
            // this table, and frees its frame.
            unsafe {
                cur = self.pt.next(p);
                vm_pageout::retire(p);
            }
        }
        // The owned VmRegion drops after this body and debug-checks that
        // no mappings remain in its range.
    }
}

// ============================================================================
// Fault resolution
// ============================================================================

/// Resolve one fault inside `region`. Runs in signal context; any error
/// returned here aborts the process at the dispatch layer.
pub(crate) fn handle_fault(region: NonNull<PagedRegion>, addr: usize) -> Result<(), VmError> {
    FAULT_STATS.total.fetch_add(1, Ordering::Relaxed);
    // SAFETY: a region is live for the duration of faults it receives;
    // only this thread can destroy it.
    let r = unsafe { region.as_ref() };
    let ps = page_size();
    let vp = VPage(trunc_page(addr));

    if let Some(p) = r.pt.find(vp) {
        // Resident page that trapped because its protection is narrower
        // than the access. Re-derive the protection from the software
        // bits: readable always, writable once the page has proven live.
        // SAFETY: entries in the table are live.
        let pte = unsafe { p.as_ref() };
        let mut prot = VmProt::READ;
        if pte.accessed.get() || pte.dirty.get() {
            prot |= VmProt::WRITE;
        }
        pte.protect(prot)?;
        FAULT_STATS.protects.fetch_add(1, Ordering::Relaxed);
        return Ok(());
    }

    // No resident page. Make room first: the evictor must run before the
    // allocation, not as a reaction to its failure.
    // SAFETY: the pool outlives every region drawing from it.
    let pool = unsafe { r.pool.as_ref() };
    if pool.nfree() == 0 {
        vm_pageout::evict_one(pool)?;
    }
    let pp = pool.page_alloc().ok_or(VmError::PoolExhausted)?;

    let pte = NonNull::from(Box::leak(Box::new(Pte {
        vp,
        pp,
        prot: Cell::new(VmProt::NONE),
        accessed: Cell::new(false),
        dirty: Cell::new(false),
        region,
        tree_link: ItreeEntry::new(),
        clock_link: IlistEntry::new(),
    })));
    // SAFETY: the entry is leaked and stays pinned until destroy().
    unsafe {
        pte.as_ref().protect(VmProt::READ | VmProt::WRITE)?;
        vm_pageout::clock_push(pte);
        r.pt.insert(pte);
    }

    // Fill the frame: decrypt from the store where the store has data,
    // zero where the mapping extends past it.
    let off = vp.0 - r.base().0;
    // SAFETY: constructed with a pager that outlives the region.
    let pager = unsafe { r.pager().as_ref() };
    let backed = round_page(pager.len()? as usize);
    if off < backed {
        // SAFETY: vp was just mapped read/write.
        let dst = unsafe { core::slice::from_raw_parts_mut(vp.as_mut_ptr(), ps) };
        pager.aligned_pread(dst, off as u64)?;
    } else {
        // SAFETY: frames are always writable at their pool address.
        unsafe { core::ptr::write_bytes(pp.as_mut_ptr(), 0, ps) };
        FAULT_STATS.zero_fills.fetch_add(1, Ordering::Relaxed);
    }

    // Installing the mapping set both bits; that was bookkeeping, not an
    // access. Drop to no access so the touch that caused this fault
    // re-arms them honestly on its retry.
    // SAFETY: as above.
    let pte = unsafe { pte.as_ref() };
    pte.accessed.set(false);
    pte.dirty.set(false);
    pte.protect(VmProt::NONE)?;
    FAULT_STATS.installs.fetch_add(1, Ordering::Relaxed);
    Ok(())
}
