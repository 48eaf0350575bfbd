//! Unified error types for cryptmap using thiserror

use thiserror::Error;

/// Top-level error type for mapping and paging operations
#[derive(Error, Debug)]
pub enum VmError {
    /// A system call on which the mapping machinery depends failed.
    #[error("{op} failed: {source}")]
    Syscall {
        op: &'static str,
        source: std::io::Error,
    },

    /// The ciphertext store reported an I/O failure.
    #[error("page store I/O error: {0}")]
    Store(#[from] std::io::Error),

    /// `map_base`/`map_size`/`flush` target a file that is not mapped.
    #[error("file is not currently mapped")]
    NotMapped,

    /// The page pool is exhausted and no resident page can be evicted.
    #[error("page pool exhausted and nothing is evictable")]
    PoolExhausted,

    /// The requested pool size cannot be represented.
    #[error("invalid page pool size: {npages} pages")]
    PoolSize { npages: usize },
}

impl VmError {
    /// Capture `errno` for a failed system call.
    pub(crate) fn os(op: &'static str) -> Self {
        VmError::Syscall {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}
