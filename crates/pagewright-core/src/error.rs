//! Error types for the extent allocator.

use thiserror::Error;

/// Failure surfaced to callers of the engine and the hugepage tier.
///
/// Hook refusals and lost races inside the engine are normally absorbed by
/// fall-back paths; only what cannot be recovered reaches this type.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ExtentError {
    #[error("out of memory: {what} exhausted")]
    OutOfMemory { what: &'static str },
    #[error("region hook `{op}` refused the operation")]
    HookRejected { op: &'static str },
    #[error("operation `{op}` is not supported by this allocator")]
    Unsupported { op: &'static str },
    #[error("address {addr:#x} is not free in this allocator")]
    AddressUnavailable { addr: usize },
    #[error("invalid request: size={size} alignment={alignment}")]
    InvalidRequest { size: usize, alignment: usize },
    #[error("extent handle is stale or was never issued")]
    StaleHandle,
    #[error("shard still owns {pageslabs} pageslab(s)")]
    NotEmpty { pageslabs: usize },
    #[error("config key `{key}`: {reason}")]
    Config { key: String, reason: String },
}

impl ExtentError {
    pub(crate) const fn oom(what: &'static str) -> Self {
        Self::OutOfMemory { what }
    }

    /// True for failures the caller may retry after releasing memory.
    #[must_use]
    pub const fn is_oom(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. })
    }
}

pub type Result<T> = std::result::Result<T, ExtentError>;
