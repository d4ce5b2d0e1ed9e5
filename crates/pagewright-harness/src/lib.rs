//! Workload harness for pagewright.
//!
//! This crate provides:
//! - Seeded randomized workloads against the extent engine or the hugepage
//!   tier, with address-space checks after every step
//! - JSONL structured logs built from the allocators' lifecycle records
//! - A serializable run summary for CI comparison

#![forbid(unsafe_code)]

pub mod structured_log;
pub mod workload;

pub use structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};
pub use workload::{HarnessError, Tier, WorkloadRunner, WorkloadSpec, WorkloadSummary};
