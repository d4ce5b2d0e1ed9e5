//! # pagewright-core
//!
//! Page-granularity extent allocation: free extent sets with address-indexed
//! coalescing and geometric growth ([`ExtentEngine`]), and a hugepage tier of
//! bitmap-tracked pageslabs ([`HpaShard`]) carved from a shared
//! [`HpaCentral`].
//!
//! Engines, shards and central share one [`AddressIndex`] and one
//! [`RecordCache`]; extents are named by generational [`ExtentId`] handles.

#![deny(unsafe_code)]

pub mod bitmap;
pub mod config;
pub mod emap;
pub mod engine;
pub mod error;
pub mod eset;
pub mod extent;
pub mod geom_grow;
pub mod hooks;
pub mod hpa;
pub mod hpa_central;
pub mod log;
#[allow(unsafe_code)]
pub mod pages;
pub mod psset;
pub mod record_cache;
pub mod reentrancy;
pub mod sz;

pub use config::EngineConfig;
pub use emap::AddressIndex;
pub use engine::{EngineStats, ExtentEngine};
pub use error::{ExtentError, Result};
pub use extent::{ExtentId, ExtentSnapshot, ExtentState, PageAllocator, Region};
pub use hooks::{ExtentHooks, HookSlot, Hooks};
pub use hpa::HpaShard;
pub use hpa_central::HpaCentral;
pub use log::{EngineLogLevel, EngineLogRecord};
pub use pages::{OsPages, PagePrimitives, SimulatedPages};
pub use record_cache::RecordCache;
pub use sz::PAGE;
