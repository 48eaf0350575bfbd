//! Virtual region manager
//!
//! A [`VmRegion`] reserves a contiguous range of the process address
//! space with no access permissions; until frames are explicitly mapped
//! there, every touch of the range traps. The first region ever created
//! installs a process-wide SIGSEGV handler that routes each fault to the
//! callback of the region containing the faulting address.
//!
//! The kernel is the source of truth for protections. This module keeps
//! a process-global table of mapping records, one per virtual page that
//! currently has a frame, and guarantees record and kernel state agree
//! bit for bit: every change goes through [`VmRegion::map`] /
//! [`VmRegion::unmap`], which issue the mmap/mprotect calls and maintain
//! the frame refcounts as records appear, change, and disappear.

use core::cell::Cell;
use core::fmt::Write as _;
use core::ptr::NonNull;
use std::collections::BTreeMap;
use std::panic::{catch_unwind, AssertUnwindSafe};

use spin::{Mutex, Once};

use crate::error::VmError;
use crate::itree::{Itree, ItreeEntry};
use crate::itree_adapter;
use crate::vm::{die, page_size, vm_page, PPage, VPage, VmProt};

/// Fault callback: receives the raw faulting address. An `Err` cannot be
/// delivered anywhere useful from signal context, so it aborts the
/// process.
pub type FaultHandler = Box<dyn Fn(usize) -> Result<(), VmError>>;

// ============================================================================
// Mapping records
// ============================================================================

/// What a virtual page is mapped to. A record with no frame does not
/// exist in the table; absence is the representation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct PageInfo {
    pa: Option<PPage>,
    prot: VmProt,
}

/// Approximately the information a hardware page-table entry would hold.
struct Mapping {
    va: VPage,
    pi: Cell<PageInfo>,
    va_link: ItreeEntry,
}

itree_adapter!(MappingsByVa = Mapping { key: va: VPage, link: va_link });
itree_adapter!(RegionsByBase = VmRegion { key: base: VPage, link: base_link });

struct VmTables {
    /// All regions, indexed by base address.
    regions: Itree<RegionsByBase>,
    /// All page mappings, indexed by virtual page address.
    pagemap: Itree<MappingsByVa>,
}

// SAFETY: mutation is serialized by the Mutex plus the single-threaded
// paging contract (see `crate::vm`).
unsafe impl Send for VmTables {}

static VM: Mutex<VmTables> = Mutex::new(VmTables {
    regions: Itree::new(),
    pagemap: Itree::new(),
});

// ============================================================================
// VmRegion
// ============================================================================

/// A reserved range of virtual memory with a fault callback.
pub struct VmRegion {
    base: VPage,
    nbytes: usize,
    handler: FaultHandler,
    base_link: ItreeEntry,
}

impl VmRegion {
    /// Reserve `nbytes` of address space. `handler` is called with the
    /// address of any page fault inside the range. If `nbytes` is not a
    /// page multiple, the tail of the last page is still reserved but
    /// faults there are treated as being outside the region.
    pub fn new(nbytes: usize, handler: FaultHandler) -> Result<Box<Self>, VmError> {
        // SAFETY: fresh anonymous reservation, no existing mapping named.
        let base = unsafe {
            libc::mmap(
                core::ptr::null_mut(),
                nbytes,
                libc::PROT_NONE,
                libc::MAP_ANONYMOUS | libc::MAP_PRIVATE,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(VmError::os("mmap"));
        }

        install_fault_handler()?;

        let region = Box::new(VmRegion {
            base: VPage(base as usize),
            nbytes,
            handler,
            base_link: ItreeEntry::new(),
        });
        // SAFETY: boxed, so the address is stable until Drop erases it.
        unsafe { VM.lock().regions.insert(NonNull::from(&*region)) };
        log::debug!("region: reserved {} bytes at {:#x}", nbytes, base as usize);
        Ok(region)
    }

    /// Address of the first page in the region.
    pub fn base(&self) -> VPage {
        self.base
    }

    /// Size of the region in bytes.
    pub fn len(&self) -> usize {
        self.nbytes
    }

    fn end(&self) -> usize {
        self.base.0 + self.nbytes
    }

    /// Set the mapping for `va`. If a different frame was mapped there,
    /// the old mapping is replaced; if the frame is unchanged, only the
    /// protection is updated.
    pub fn map(va: VPage, pa: PPage, prot: VmProt) -> Result<(), VmError> {
        debug_assert_eq!(va.0 % page_size(), 0);
        let t = VM.lock();
        let m = match t.pagemap.find(va) {
            Some(m) => m,
            None => {
                let m = NonNull::from(Box::leak(Box::new(Mapping {
                    va,
                    pi: Cell::new(PageInfo {
                        pa: None,
                        prot: VmProt::NONE,
                    }),
                    va_link: ItreeEntry::new(),
                })));
                // SAFETY: leaked, so the address is stable; update()
                // reboxes it when the record dies.
                unsafe { t.pagemap.insert(m) };
                m
            }
        };
        Self::update(
            &t,
            m,
            PageInfo {
                pa: Some(pa),
                prot,
            },
        )
    }

    /// Remove the mapping for `va`, if any.
    pub fn unmap(va: VPage) -> Result<(), VmError> {
        debug_assert_eq!(va.0 % page_size(), 0);
        let t = VM.lock();
        match t.pagemap.find(va) {
            Some(m) => Self::update(
                &t,
                m,
                PageInfo {
                    pa: None,
                    prot: VmProt::NONE,
                },
            ),
            None => Ok(()),
        }
    }

    /// Reconcile one mapping record with `new`, issuing whatever kernel
    /// calls the difference requires.
    fn update(t: &VmTables, m: NonNull<Mapping>, new: PageInfo) -> Result<(), VmError> {
        // SAFETY: records in the table are live until erased below.
        let rec = unsafe { m.as_ref() };
        let cur = rec.pi.get();
        if new == cur {
            return Ok(());
        }
        let ps = page_size();
        let va = rec.va.0 as *mut libc::c_void;

        match new.pa {
            None => {
                debug_assert_eq!(new.prot, VmProt::NONE, "removal must drop to no access");
                if let Some(old) = cur.pa {
                    // Put the bare reservation back over this page.
                    // SAFETY: va is a page we previously mapped.
                    let r = unsafe {
                        libc::mmap(
                            va,
                            ps,
                            libc::PROT_NONE,
                            libc::MAP_ANONYMOUS | libc::MAP_PRIVATE | libc::MAP_FIXED,
                            -1,
                            0,
                        )
                    };
                    if r == libc::MAP_FAILED {
                        return Err(VmError::os("mmap"));
                    }
                    refcount_dec(old);
                }
                // SAFETY: the record was leaked into the table in map().
                unsafe {
                    t.pagemap.erase(m);
                    drop(Box::from_raw(m.as_ptr()));
                }
            }
            Some(pa) if cur.pa != Some(pa) => {
                let pm = vm_page::find(pa);
                // SAFETY: pools outlive their frames' mappings.
                let (fd, off) = unsafe {
                    let pm = pm.as_ref();
                    (pm.fd(), (pa.0 - pm.pool_base().0) as libc::off_t)
                };
                // SAFETY: fixed-address shared mapping of the pool file
                // over a page inside a region we reserved.
                let r = unsafe {
                    libc::mmap(
                        va,
                        ps,
                        native_prot(new.prot),
                        libc::MAP_SHARED | libc::MAP_FIXED,
                        fd,
                        off,
                    )
                };
                if r == libc::MAP_FAILED {
                    return Err(VmError::os("mmap"));
                }
                refcount_inc(pa);
                if let Some(old) = cur.pa {
                    refcount_dec(old);
                }
                rec.pi.set(new);
            }
            Some(_) => {
                // Same frame, new protection.
                // SAFETY: va carries a mapping we installed.
                if unsafe { libc::mprotect(va, ps, native_prot(new.prot)) } != 0 {
                    return Err(VmError::os("mprotect"));
                }
                rec.pi.set(new);
            }
        }
        Ok(())
    }
}

impl Drop for VmRegion {
    fn drop(&mut self) {
        {
            let t = VM.lock();
            // A region may only go away after all its pages are unmapped.
            if let Some(m) = t.pagemap.lower_bound(self.base) {
                // SAFETY: records in the table are live.
                debug_assert!(
                    unsafe { m.as_ref() }.va.0 >= self.end(),
                    "region dropped with mapped pages"
                );
            }
            // SAFETY: inserted in new().
            unsafe { t.regions.erase(NonNull::from(&*self)) };
        }
        // SAFETY: releases exactly the reservation made in new().
        if unsafe { libc::munmap(self.base.0 as *mut libc::c_void, self.nbytes) } != 0 {
            log::error!("region: munmap of {:#x} failed", self.base.0);
        }
        log::debug!("region: released {:#x}", self.base.0);
    }
}

fn native_prot(p: VmProt) -> libc::c_int {
    let mut n = libc::PROT_NONE;
    if p.can_read() {
        n |= libc::PROT_READ;
    }
    if p.can_write() {
        n |= libc::PROT_WRITE;
    }
    n
}

/// Bump the refcount of a frame that gained a mapping.
fn refcount_inc(pa: PPage) {
    let pm = vm_page::find(pa);
    // SAFETY: pools outlive mapped frames.
    let c = unsafe { pm.as_ref() }.refcount(pa);
    assert!(c.get() >= 0, "mapped frame was free or never allocated");
    c.set(c.get() + 1);
}

/// Drop the refcount of a frame that lost a mapping.
fn refcount_dec(pa: PPage) {
    let pm = vm_page::find(pa);
    // SAFETY: pools outlive mapped frames.
    let c = unsafe { pm.as_ref() }.refcount(pa);
    assert!(c.get() > 0, "unmapped frame had no mappings");
    c.set(c.get() - 1);
}

/// Count mapping records per frame, for the audit in [`crate::vm::audit`].
pub(crate) fn mapping_counts() -> BTreeMap<PPage, i32> {
    let t = VM.lock();
    let mut counts = BTreeMap::new();
    let mut cur = t.pagemap.first();
    while let Some(m) = cur {
        // SAFETY: records in the table are live.
        unsafe {
            if let Some(pa) = m.as_ref().pi.get().pa {
                *counts.entry(pa).or_insert(0) += 1;
            }
            cur = t.pagemap.next(m);
        }
    }
    counts
}

// ============================================================================
// Fault dispatch
// ============================================================================

static HANDLER_INSTALLED: Once<Result<(), i32>> = Once::new();

fn install_fault_handler() -> Result<(), VmError> {
    let r = HANDLER_INSTALLED.call_once(|| {
        // SAFETY: standard SA_SIGINFO registration; the handler itself is
        // written to be conservative in signal context.
        unsafe {
            let mut sa: libc::sigaction = core::mem::zeroed();
            let f: extern "C" fn(libc::c_int, *mut libc::siginfo_t, *mut libc::c_void) =
                fault_handler;
            sa.sa_sigaction = f as usize;
            sa.sa_flags = libc::SA_SIGINFO;
            libc::sigemptyset(&mut sa.sa_mask);
            if libc::sigaction(libc::SIGSEGV, &sa, core::ptr::null_mut()) != 0 {
                return Err(*libc::__errno_location());
            }
        }
        Ok(())
    });
    match *r {
        Ok(()) => Ok(()),
        Err(errno) => Err(VmError::Syscall {
            op: "sigaction",
            source: std::io::Error::from_raw_os_error(errno),
        }),
    }
}

/// Fixed-size sink for composing a diagnostic without allocating.
struct MsgBuf {
    buf: [u8; 256],
    len: usize,
}

impl MsgBuf {
    fn new() -> Self {
        MsgBuf {
            buf: [0; 256],
            len: 0,
        }
    }

    fn flush_and_die(&self) -> ! {
        // SAFETY: async-signal-safe write of a live buffer.
        unsafe {
            libc::write(
                libc::STDERR_FILENO,
                self.buf.as_ptr().cast(),
                self.len,
            );
            libc::abort();
        }
    }
}

impl core::fmt::Write for MsgBuf {
    fn write_str(&mut self, s: &str) -> core::fmt::Result {
        let room = self.buf.len() - self.len;
        let n = s.len().min(room);
        self.buf[self.len..self.len + n].copy_from_slice(&s.as_bytes()[..n]);
        self.len += n;
        Ok(())
    }
}

/// The process-wide SIGSEGV handler. Resolves the faulting address to a
/// region and runs its callback; a fault outside every region, an error
/// from the callback, or a panic in the callback all abort, because no
/// form of failure can be raised across a signal frame.
extern "C" fn fault_handler(
    _sig: libc::c_int,
    info: *mut libc::siginfo_t,
    _ctx: *mut libc::c_void,
) {
    // SAFETY: the kernel hands us a valid siginfo for SA_SIGINFO.
    let addr = unsafe { (*info).si_addr() } as usize;

    let region = {
        let t = VM.lock();
        match t.regions.upper_bound_prev(VPage(addr)) {
            // SAFETY: registered regions are live until erased in Drop.
            Some(r) if addr < unsafe { r.as_ref() }.end() => Some(r),
            _ => None,
        }
    };

    let Some(region) = region else {
        let mut msg = MsgBuf::new();
        let _ = write!(msg, "cryptmap: page fault at invalid address {addr:#x}\n");
        msg.flush_and_die();
    };

    // SAFETY: the region stays live for the duration of the fault; only
    // this thread can destroy it and it is suspended here.
    let handler = &unsafe { region.as_ref() }.handler;
    match catch_unwind(AssertUnwindSafe(|| handler(addr))) {
        Ok(Ok(())) => {}
        Ok(Err(e)) => {
            let mut msg = MsgBuf::new();
            let _ = write!(msg, "cryptmap: fatal error in page fault handler: {e}\n");
            msg.flush_and_die();
        }
        Err(_) => die("cryptmap: panic in page fault handler\n"),
    }
}
