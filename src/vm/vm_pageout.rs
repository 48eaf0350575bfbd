//! Page replacement
//!
//! One clock list spans every paged region that draws on the pool, so a
//! hot file reclaims frames from cold ones instead of cannibalizing its
//! own working set. The list holds every resident page in insertion
//! order; the hand sweeps it as a ring.
//!
//! Classic second chance: a page whose accessed bit is set gets the bit
//! cleared and its protection dropped to none, so the next touch refaults
//! and re-arms it. A page found with the bit still clear on a later pass
//! is the victim. Dirty victims are written back through their frame's
//! pool-side address; the virtual page must not be touched from inside
//! the fault handler.

use core::ptr::NonNull;
use core::sync::atomic::{AtomicU64, Ordering};

use spin::Mutex;

use crate::error::VmError;
use crate::ilist::Ilist;
use crate::ilist_adapter;
use crate::vm::vm_fault::Pte;
use crate::vm::vm_page::PhysMem;
use crate::vm::{page_size, VPage, VmProt};

// ============================================================================
// Pageout statistics
// ============================================================================

/// Global replacement counters, all relaxed.
#[derive(Debug, Default)]
pub struct PageoutStats {
    /// Pages evicted.
    pub evictions: AtomicU64,
    /// Dirty evictees written back to their store.
    pub writebacks: AtomicU64,
    /// Hand steps that granted a second chance instead of evicting.
    pub scans: AtomicU64,
}

static PAGEOUT_STATS: PageoutStats = PageoutStats {
    evictions: AtomicU64::new(0),
    writebacks: AtomicU64::new(0),
    scans: AtomicU64::new(0),
};

/// Get replacement statistics.
pub fn stats() -> &'static PageoutStats {
    &PAGEOUT_STATS
}

// ============================================================================
// Clock state
// ============================================================================

ilist_adapter!(pub(crate) PteClock = Pte { link: clock_link });

struct ClockState {
    /// Every resident page of every paged region, in insertion order.
    list: Ilist<PteClock>,
    /// Sweep cursor. Null when no sweep has started or the list drained.
    hand: Option<NonNull<Pte>>,
}

// SAFETY: mutation is serialized by the Mutex plus the single-threaded
// paging contract (see `crate::vm`).
unsafe impl Send for ClockState {}

static CLOCK: Mutex<ClockState> = Mutex::new(ClockState {
    list: Ilist::new(),
    hand: None,
});

/// Number of resident pages process-wide.
pub fn resident() -> usize {
    CLOCK.lock().list.len()
}

/// Virtual page the hand currently rests on, if any.
pub fn hand() -> Option<VPage> {
    let cs = CLOCK.lock();
    // SAFETY: listed entries are live.
    cs.hand.map(|h| unsafe { h.as_ref() }.vp())
}

/// Add a freshly installed page at the tail of the clock list.
pub(crate) fn clock_push(pte: NonNull<Pte>) {
    // SAFETY: the caller keeps the entry pinned until retire().
    unsafe { CLOCK.lock().list.push_back(pte) };
}

/// Move the hand off `pte` if it rests there, then unlink `pte`.
fn unlink_locked(cs: &mut ClockState, pte: NonNull<Pte>) {
    if cs.hand == Some(pte) {
        // SAFETY: pte is still linked here.
        let succ = unsafe { cs.list.cyclic_next(pte) };
        cs.hand = if succ == pte { None } else { Some(succ) };
    }
    // SAFETY: the caller guarantees pte is in the list.
    unsafe { cs.list.unlink(pte) };
}

/// Remove a resident page entirely: out of the clock list (stepping the
/// hand off it first), out of its region's page table, unmapped, and its
/// frame returned to the pool.
///
/// # Safety
///
/// `pte` must be a live entry currently in the clock list and in its
/// region's page table, and must not be used afterward.
pub(crate) unsafe fn retire(pte: NonNull<Pte>) {
    {
        let mut cs = CLOCK.lock();
        unlink_locked(&mut cs, pte);
    }
    let region = pte.as_ref().region;
    // SAFETY: the region is live as long as it has resident pages.
    region.as_ref().pt.erase(pte);
    Pte::destroy(pte);
}

// ============================================================================
// Eviction
// ============================================================================

/// Free exactly one frame by evicting a resident page, writing it back
/// first if it is dirty.
///
/// The sweep is bounded: after `2 * npages + 1` steps every page has had
/// its accessed bit cleared and been seen again, so a victim must have
/// appeared. Running out of steps, or finding the list empty while the
/// pool is full, means the paging state is inconsistent; both are
/// reported as exhaustion and are fatal in fault context.
pub(crate) fn evict_one(pool: &PhysMem) -> Result<(), VmError> {
    let mut cs = CLOCK.lock();
    for _ in 0..(2 * pool.npages() + 1) {
        let hand = match cs.hand {
            Some(h) => h,
            None => match cs.list.front() {
                Some(f) => {
                    cs.hand = Some(f);
                    f
                }
                None => return Err(VmError::PoolExhausted),
            },
        };
        // SAFETY: listed entries are live.
        let pte = unsafe { hand.as_ref() };

        if !pte.accessed.get() {
            // Victim. If it carries unwritten data, hand the codec a
            // readable mapping and push the plaintext out through the
            // frame's pool-side address before the frame is reused.
            if pte.dirty.get() {
                pte.protect(VmProt::READ | VmProt::WRITE)?;
                // SAFETY: the region is live while it has resident pages.
                let region = unsafe { pte.region.as_ref() };
                let off = (pte.vp().0 - region.base().0) as u64;
                // SAFETY: frames are always readable at their pool
                // address, and nothing else touches this one mid-call.
                let src =
                    unsafe { core::slice::from_raw_parts(pte.pp.as_ptr(), page_size()) };
                // SAFETY: regions are constructed with pagers that
                // outlive them.
                unsafe { region.pager().as_ref() }.aligned_pwrite(src, off)?;
                PAGEOUT_STATS.writebacks.fetch_add(1, Ordering::Relaxed);
            }
            unlink_locked(&mut cs, hand);
            drop(cs);
            // SAFETY: unlinked above; still in its region's table, which
            // is exactly what the second half of retirement undoes.
            unsafe {
                let region = hand.as_ref().region;
                region.as_ref().pt.erase(hand);
                Pte::destroy(hand);
            }
            PAGEOUT_STATS.evictions.fetch_add(1, Ordering::Relaxed);
            return Ok(());
        }

        // Second chance: disarm the page and move on. The protection
        // reset is what makes the next touch refault and re-arm the bit.
        pte.clear_accessed()?;
        PAGEOUT_STATS.scans.fetch_add(1, Ordering::Relaxed);
        // SAFETY: hand is still linked.
        let succ = unsafe { cs.list.cyclic_next(hand) };
        cs.hand = Some(succ);
    }
    Err(VmError::PoolExhausted)
}

/// Step the hand once without evicting: grant the page under the hand
/// its second chance (clearing its accessed bit and access) and advance.
/// A debugging and test aid; the real sweep lives in eviction.
pub fn scan_one() -> Result<(), VmError> {
    let mut cs = CLOCK.lock();
    let hand = match cs.hand {
        Some(h) => h,
        None => match cs.list.front() {
            Some(f) => f,
            None => return Ok(()),
        },
    };
    // SAFETY: listed entries are live.
    let pte = unsafe { hand.as_ref() };
    if pte.accessed.get() {
        pte.clear_accessed()?;
    }
    // SAFETY: hand is still linked.
    let succ = unsafe { cs.list.cyclic_next(hand) };
    cs.hand = Some(succ);
    Ok(())
}

/// Check that every clock-listed page is indexed by its owning region.
/// Called from [`crate::vm::audit`].
pub(crate) fn audit_clock() {
    let cs = CLOCK.lock();
    let mut cur = cs.list.front();
    while let Some(p) = cur {
        // SAFETY: listed entries and their regions are live.
        unsafe {
            let pte = p.as_ref();
            let region = pte.region.as_ref();
            assert_eq!(
                region.pt.find(pte.vp()),
                Some(p),
                "clock-listed page missing from its region's table"
            );
            cur = cs.list.next(p);
        }
    }
    if let Some(h) = cs.hand {
        // SAFETY: as above.
        assert!(
            unsafe { h.as_ref() }.clock_link.in_list(),
            "hand points at an unlinked entry"
        );
    }
}
