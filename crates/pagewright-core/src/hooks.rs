//! Region hooks.
//!
//! Each operation has its own [`HookSlot`]: the OS-backed default, an
//! explicit no-op, or a custom closure. A caller can override one hook and
//! default the rest. Custom closures run inside a reentrancy scope.
//!
//! An explicit no-op reports success where doing nothing leaves the
//! operation's postcondition true (`destroy`, `commit`, `decommit`, `split`,
//! `merge`). Where it would not (`alloc` has no address to return, `dalloc`
//! leaves the range mapped, the purges leave contents intact) it reports
//! refusal.

use std::fmt;
use std::sync::Arc;

use crate::config::EngineConfig;
use crate::pages::{OsPages, PagePrimitives};
use crate::reentrancy;
use crate::sz::PAGE;

/// Arguments of an `alloc` hook call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocRequest {
    pub addr_hint: Option<usize>,
    pub size: usize,
    pub alignment: usize,
    pub zero: bool,
    pub commit: bool,
}

/// Result of a successful `alloc` hook call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct AllocGrant {
    pub addr: usize,
    pub zeroed: bool,
    pub committed: bool,
}

pub type AllocFn = dyn Fn(&AllocRequest) -> Option<AllocGrant> + Send + Sync;
/// `(addr, size, committed) -> ok`
pub type DallocFn = dyn Fn(usize, usize, bool) -> bool + Send + Sync;
/// `(addr, size, committed)`
pub type DestroyFn = dyn Fn(usize, usize, bool) + Send + Sync;
/// `(addr, size, offset, length) -> ok`
pub type RangeFn = dyn Fn(usize, usize, usize, usize) -> bool + Send + Sync;
/// `(addr, size, size_a, size_b, committed) -> ok`
pub type SplitFn = dyn Fn(usize, usize, usize, usize, bool) -> bool + Send + Sync;
/// `(addr_a, size_a, addr_b, size_b, committed) -> ok`
pub type MergeFn = dyn Fn(usize, usize, usize, usize, bool) -> bool + Send + Sync;

/// Per-operation hook selection.
pub enum HookSlot<F: ?Sized> {
    /// OS-backed implementation.
    Default,
    /// Explicit no-op.
    Null,
    Custom(Arc<F>),
}

impl<F: ?Sized> Clone for HookSlot<F> {
    fn clone(&self) -> Self {
        match self {
            Self::Default => Self::Default,
            Self::Null => Self::Null,
            Self::Custom(f) => Self::Custom(Arc::clone(f)),
        }
    }
}

impl<F: ?Sized> fmt::Debug for HookSlot<F> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Default => "Default",
            Self::Null => "Null",
            Self::Custom(_) => "Custom",
        })
    }
}

impl<F: ?Sized> Default for HookSlot<F> {
    fn default() -> Self {
        Self::Default
    }
}

impl<F: ?Sized> HookSlot<F> {
    #[must_use]
    pub const fn is_default(&self) -> bool {
        matches!(self, Self::Default)
    }
}

/// Full hook table.
#[derive(Debug, Clone, Default)]
pub struct ExtentHooks {
    pub alloc: HookSlot<AllocFn>,
    pub dalloc: HookSlot<DallocFn>,
    pub destroy: HookSlot<DestroyFn>,
    pub commit: HookSlot<RangeFn>,
    pub decommit: HookSlot<RangeFn>,
    pub purge_lazy: HookSlot<RangeFn>,
    pub purge_forced: HookSlot<RangeFn>,
    pub split: HookSlot<SplitFn>,
    pub merge: HookSlot<MergeFn>,
}

impl ExtentHooks {
    /// True when every slot is [`HookSlot::Default`].
    #[must_use]
    pub fn all_default(&self) -> bool {
        self.alloc.is_default()
            && self.dalloc.is_default()
            && self.destroy.is_default()
            && self.commit.is_default()
            && self.decommit.is_default()
            && self.purge_lazy.is_default()
            && self.purge_forced.is_default()
            && self.split.is_default()
            && self.merge.is_default()
    }
}

/// Hook dispatcher bound to a page-primitive provider.
#[derive(Clone)]
pub struct Hooks {
    table: ExtentHooks,
    pages: Arc<dyn PagePrimitives>,
    maps_coalesce: bool,
    retain: bool,
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("table", &self.table)
            .field("pages", &self.pages)
            .field("maps_coalesce", &self.maps_coalesce)
            .field("retain", &self.retain)
            .finish()
    }
}

impl Hooks {
    #[must_use]
    pub fn new(table: ExtentHooks, pages: Arc<dyn PagePrimitives>, config: &EngineConfig) -> Self {
        Self {
            table,
            pages,
            maps_coalesce: config.maps_coalesce,
            retain: config.retain,
        }
    }

    /// All-default hooks over the real OS.
    #[must_use]
    pub fn os(config: &EngineConfig) -> Self {
        Self::new(ExtentHooks::default(), Arc::new(OsPages), config)
    }

    #[must_use]
    pub fn table(&self) -> &ExtentHooks {
        &self.table
    }

    #[must_use]
    pub fn pages(&self) -> &Arc<dyn PagePrimitives> {
        &self.pages
    }

    #[must_use]
    pub fn are_default(&self) -> bool {
        self.table.all_default()
    }

    fn default_alloc(&self, req: &AllocRequest) -> Option<AllocGrant> {
        let addr = self.pages.map(req.addr_hint, req.size, req.alignment.max(PAGE))?;
        Some(AllocGrant {
            addr,
            zeroed: true,
            committed: true,
        })
    }

    pub fn alloc(&self, req: &AllocRequest) -> Option<AllocGrant> {
        match &self.table.alloc {
            HookSlot::Default => self.default_alloc(req),
            HookSlot::Null => None,
            HookSlot::Custom(f) => {
                let _scope = reentrancy::enter_hook_scope();
                f(req)
            }
        }
    }

    /// Maps through the default primitives regardless of the table.
    pub fn alloc_fallback(&self, req: &AllocRequest) -> Option<AllocGrant> {
        self.default_alloc(req)
    }

    /// True when `dalloc` is known to refuse, so callers skip straight to
    /// retaining the range.
    #[must_use]
    pub fn dalloc_will_fail(&self) -> bool {
        match &self.table.dalloc {
            HookSlot::Default => self.retain,
            HookSlot::Null => true,
            HookSlot::Custom(_) => false,
        }
    }

    pub fn dalloc(&self, addr: usize, size: usize, committed: bool) -> bool {
        match &self.table.dalloc {
            HookSlot::Default => self.pages.unmap(addr, size),
            HookSlot::Null => false,
            HookSlot::Custom(f) => {
                let _scope = reentrancy::enter_hook_scope();
                f(addr, size, committed)
            }
        }
    }

    pub fn destroy(&self, addr: usize, size: usize, committed: bool) {
        match &self.table.destroy {
            HookSlot::Default => {
                self.pages.unmap(addr, size);
            }
            HookSlot::Null => {}
            HookSlot::Custom(f) => {
                let _scope = reentrancy::enter_hook_scope();
                f(addr, size, committed);
            }
        }
    }

    #[allow(clippy::too_many_arguments)]
    fn range_op(
        &self,
        slot: &HookSlot<RangeFn>,
        null_ok: bool,
        default: impl FnOnce(&dyn PagePrimitives, usize, usize) -> bool,
        addr: usize,
        size: usize,
        offset: usize,
        length: usize,
    ) -> bool {
        debug_assert!(offset + length <= size);
        match slot {
            HookSlot::Default => default(self.pages.as_ref(), addr + offset, length),
            HookSlot::Null => null_ok,
            HookSlot::Custom(f) => {
                let _scope = reentrancy::enter_hook_scope();
                f(addr, size, offset, length)
            }
        }
    }

    pub fn commit(&self, addr: usize, size: usize, offset: usize, length: usize) -> bool {
        self.range_op(
            &self.table.commit,
            true,
            |p, a, l| p.commit(a, l),
            addr,
            size,
            offset,
            length,
        )
    }

    pub fn decommit(&self, addr: usize, size: usize, offset: usize, length: usize) -> bool {
        self.range_op(
            &self.table.decommit,
            true,
            |p, a, l| p.decommit(a, l),
            addr,
            size,
            offset,
            length,
        )
    }

    pub fn purge_lazy(&self, addr: usize, size: usize, offset: usize, length: usize) -> bool {
        self.range_op(
            &self.table.purge_lazy,
            false,
            |p, a, l| p.purge_lazy(a, l),
            addr,
            size,
            offset,
            length,
        )
    }

    pub fn purge_forced(&self, addr: usize, size: usize, offset: usize, length: usize) -> bool {
        self.range_op(
            &self.table.purge_forced,
            false,
            |p, a, l| p.purge_forced(a, l),
            addr,
            size,
            offset,
            length,
        )
    }

    /// True when the default split would refuse: mappings cannot be split
    /// and nothing is retained.
    #[must_use]
    pub fn split_will_fail(&self) -> bool {
        match &self.table.split {
            HookSlot::Default => !self.maps_coalesce && !self.retain,
            HookSlot::Null | HookSlot::Custom(_) => false,
        }
    }

    pub fn split(&self, addr: usize, size: usize, size_a: usize, size_b: usize, committed: bool) -> bool {
        match &self.table.split {
            HookSlot::Default => !self.split_will_fail(),
            HookSlot::Null => true,
            HookSlot::Custom(f) => {
                let _scope = reentrancy::enter_hook_scope();
                f(addr, size, size_a, size_b, committed)
            }
        }
    }

    #[must_use]
    pub fn merge_will_fail(&self) -> bool {
        match &self.table.merge {
            HookSlot::Default => !self.maps_coalesce && !self.retain,
            HookSlot::Null | HookSlot::Custom(_) => false,
        }
    }

    pub fn merge(
        &self,
        addr_a: usize,
        size_a: usize,
        addr_b: usize,
        size_b: usize,
        committed: bool,
    ) -> bool {
        match &self.table.merge {
            HookSlot::Default => !self.merge_will_fail(),
            HookSlot::Null => true,
            HookSlot::Custom(f) => {
                let _scope = reentrancy::enter_hook_scope();
                f(addr_a, size_a, addr_b, size_b, committed)
            }
        }
    }

    /// Zero-fills a committed range: a forced purge when the default purge is
    /// in effect, a plain fill otherwise.
    pub fn zero(&self, addr: usize, size: usize) -> bool {
        if self.table.purge_forced.is_default() && self.pages.purge_forced(addr, size) {
            return true;
        }
        self.pages.zero(addr, size)
    }

    /// Marks a range as hugepage-backed. Always the default primitive.
    pub fn mark_huge(&self, addr: usize, size: usize) -> bool {
        self.pages.mark_huge(addr, size)
    }

    /// Unmaps through the default primitives regardless of the table.
    pub fn unmap_fallback(&self, addr: usize, size: usize) -> bool {
        self.pages.unmap(addr, size)
    }
}
