//! cryptmap - memory-mapped encrypted files
//!
//! An application asks for a pointer to a byte range whose contents are
//! the plaintext of an on-disk encrypted file. Pages decrypt on first
//! touch and encrypt back on flush, unmap, or eviction; a bounded pool
//! of frames shared by every mapped file is recycled with second-chance
//! replacement.
//!
//! The crate is layered the way a kernel VM subsystem is:
//!
//! - [`itree`] / [`ilist`]: intrusive containers that let one page
//!   record live in several indexes without allocation
//! - [`vm`]: the paging core (pool, regions, fault handling, clock)
//! - [`pager`]: the seam to the encryption codec
//! - [`mapped_file`]: the user-facing mapped-file surface
//!
//! Everything assumes a single mutating thread; see [`vm`] for the
//! concurrency contract.

pub mod error;
pub mod ilist;
pub mod itree;
pub mod mapped_file;
pub mod pager;
pub mod vm;

pub use error::VmError;
pub use mapped_file::{pool_stats, set_memory_size, MappedCryptFile};
pub use pager::Pager;
pub use vm::{page_size, PPage, VPage, VmProt};
