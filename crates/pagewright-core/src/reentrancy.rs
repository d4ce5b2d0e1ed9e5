//! Per-thread hook reentrancy tracking.
//!
//! Custom region hooks may call back into the allocator. Every custom hook
//! call runs inside a [`HookScope`]; allocation entry points consult
//! [`is_reentrant`] and take a lock-free fallback path while a scope is open.

use std::cell::Cell;
use std::marker::PhantomData;

thread_local! {
    static HOOK_DEPTH: Cell<u32> = const { Cell::new(0) };
}

/// Open while a custom hook runs on this thread.
#[derive(Debug)]
pub struct HookScope {
    _not_send: PhantomData<*const ()>,
}

impl Drop for HookScope {
    fn drop(&mut self) {
        HOOK_DEPTH.with(|depth| depth.set(depth.get().saturating_sub(1)));
    }
}

/// Opens a hook scope on the current thread.
#[inline]
#[must_use]
pub fn enter_hook_scope() -> HookScope {
    HOOK_DEPTH.with(|depth| depth.set(depth.get() + 1));
    HookScope {
        _not_send: PhantomData,
    }
}

/// True when called from inside a custom hook on this thread.
#[inline]
#[must_use]
pub fn is_reentrant() -> bool {
    HOOK_DEPTH.with(|depth| depth.get() > 0)
}

/// Current nesting depth.
#[inline]
#[must_use]
pub fn depth() -> u32 {
    HOOK_DEPTH.with(Cell::get)
}
