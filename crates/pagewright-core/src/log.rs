//! Structured lifecycle log shared by the engine and the hugepage tier.
//!
//! Only slow-path decisions are recorded: growth, leaks, hook refusals,
//! evictions and invariant recoveries. Callers drain the ring periodically.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;
use serde::Serialize;

/// Lifecycle log level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EngineLogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

/// Structured lifecycle record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineLogRecord {
    /// Monotonic decision/event id.
    pub decision_id: u64,
    /// Correlation id: `pagewright::<component>::<symbol>::<id>`.
    pub trace_id: String,
    pub level: EngineLogLevel,
    /// Owning component (`engine`, `hpa_central`, `hpa_shard`).
    pub component: &'static str,
    /// Operation that produced the record.
    pub symbol: &'static str,
    /// Event kind (`grow`, `leak`, `hook_rejected`, ...).
    pub event: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub addr: Option<usize>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub size: Option<usize>,
    /// Machine-readable outcome label.
    pub outcome: &'static str,
    pub details: String,
}

/// Event description handed to [`LifecycleLog::record`].
#[derive(Debug, Clone, Copy)]
pub struct LogEvent<'a> {
    pub level: EngineLogLevel,
    pub symbol: &'static str,
    pub event: &'static str,
    pub addr: Option<usize>,
    pub size: Option<usize>,
    pub outcome: &'static str,
    pub details: &'a str,
}

impl<'a> LogEvent<'a> {
    #[must_use]
    pub const fn new(
        level: EngineLogLevel,
        symbol: &'static str,
        event: &'static str,
        outcome: &'static str,
    ) -> Self {
        Self {
            level,
            symbol,
            event,
            addr: None,
            size: None,
            outcome,
            details: "",
        }
    }

    #[must_use]
    pub const fn with_range(mut self, addr: usize, size: usize) -> Self {
        self.addr = Some(addr);
        self.size = Some(size);
        self
    }

    #[must_use]
    pub const fn with_details(mut self, details: &'a str) -> Self {
        self.details = details;
        self
    }
}

/// Bounded ring of lifecycle records. The oldest record is dropped when full.
#[derive(Debug)]
pub struct LifecycleLog {
    component: &'static str,
    capacity: usize,
    next_decision_id: AtomicU64,
    dropped: AtomicU64,
    records: Mutex<VecDeque<EngineLogRecord>>,
}

impl LifecycleLog {
    #[must_use]
    pub fn new(component: &'static str, capacity: usize) -> Self {
        Self {
            component,
            capacity,
            next_decision_id: AtomicU64::new(1),
            dropped: AtomicU64::new(0),
            records: Mutex::new(VecDeque::with_capacity(capacity.min(256))),
        }
    }

    pub fn record(&self, event: LogEvent<'_>) {
        if self.capacity == 0 {
            self.dropped.fetch_add(1, Ordering::Relaxed);
            return;
        }
        let decision_id = self.next_decision_id.fetch_add(1, Ordering::Relaxed);
        let record = EngineLogRecord {
            decision_id,
            trace_id: format!(
                "pagewright::{}::{}::{:016x}",
                self.component, event.symbol, decision_id
            ),
            level: event.level,
            component: self.component,
            symbol: event.symbol,
            event: event.event,
            addr: event.addr,
            size: event.size,
            outcome: event.outcome,
            details: event.details.to_owned(),
        };
        let mut records = self.records.lock();
        if records.len() == self.capacity {
            records.pop_front();
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        records.push_back(record);
    }

    /// Removes and returns every buffered record, oldest first.
    pub fn drain(&self) -> Vec<EngineLogRecord> {
        self.records.lock().drain(..).collect()
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Records discarded because the ring was full.
    #[must_use]
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_record_fields_and_trace_id() {
        let log = LifecycleLog::new("engine", 8);
        log.record(
            LogEvent::new(EngineLogLevel::Info, "grow_retained", "grow", "mapped")
                .with_range(0x20_0000, 0x20_0000)
                .with_details("skip=0"),
        );
        let records = log.drain();
        assert_eq!(records.len(), 1);
        let r = &records[0];
        assert_eq!(r.decision_id, 1);
        assert_eq!(r.trace_id, "pagewright::engine::grow_retained::0000000000000001");
        assert_eq!(r.addr, Some(0x20_0000));
        assert_eq!(r.details, "skip=0");
        assert!(log.is_empty());
    }

    #[test]
    fn test_ring_drops_oldest() {
        let log = LifecycleLog::new("hpa_shard", 2);
        for _ in 0..5 {
            log.record(LogEvent::new(EngineLogLevel::Debug, "alloc", "probe", "ok"));
        }
        let ids: Vec<u64> = log.drain().iter().map(|r| r.decision_id).collect();
        assert_eq!(ids, vec![4, 5]);
        assert_eq!(log.dropped(), 3);
    }

    #[test]
    fn test_records_serialize_lowercase_level() {
        let log = LifecycleLog::new("hpa_central", 4);
        log.record(LogEvent::new(EngineLogLevel::Warn, "dalloc", "leak", "abandoned"));
        let json = serde_json::to_string(&log.drain()[0]).expect("serialize");
        assert!(json.contains("\"level\":\"warn\""));
        assert!(!json.contains("\"addr\""));
    }
}
