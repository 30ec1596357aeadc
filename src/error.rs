use thiserror::Error;

use crate::page::PageId;

/// Errors surfaced by the replacement engine.
///
/// Only low-level faults travel as values: file I/O during dump/restore,
/// malformed dump files, and surface misuse. Invariant breaches (a page
/// hash that disagrees with the LRU, fatal pool exhaustion) are programming
/// or corruption errors and abort with a logged diagnostic instead.
#[derive(Error, Debug)]
pub enum PoolError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("broken LRU dump file: {0}")]
    BrokenDump(String),

    #[error("cycle detected in LRU list")]
    ListCycle,

    #[error("page {0} already resident")]
    AlreadyResident(PageId),

    #[error("invalid operation: {0}")]
    InvalidOperation(String),
}

pub type Result<T> = std::result::Result<T, PoolError>;
