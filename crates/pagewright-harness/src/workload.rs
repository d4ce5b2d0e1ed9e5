//! Seeded randomized workloads against either allocator tier.
//!
//! A run drives alloc/free/expand/shrink/purge traffic from one or more
//! worker threads, checks that no two live regions overlap, checks page
//! accounting against the simulated mapping layer, and tears everything
//! down at the end to prove nothing was lost.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Instant;

use pagewright_core::{
    AddressIndex, EngineConfig, EngineLogRecord, ExtentEngine, ExtentError, ExtentId,
    ExtentState, HpaCentral, HpaShard, PAGE, RecordCache, Region, SimulatedPages,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::structured_log::{LogEmitter, LogEntry, LogLevel, Outcome};

#[derive(Debug, Error)]
pub enum HarnessError {
    #[error("io: {0}")]
    Io(#[from] std::io::Error),
    #[error("json: {0}")]
    Json(#[from] serde_json::Error),
    #[error("allocator: {0}")]
    Extent(#[from] ExtentError),
    #[error("seed={seed} step={step}: {reason}")]
    Invariant { seed: u64, step: u64, reason: String },
    #[error("worker {worker} panicked")]
    WorkerPanicked { worker: usize },
}

/// Allocator tier under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Tier {
    /// Extent engine over dirty, muzzy and retained sets.
    Engine,
    /// Hugepage tier: one shard per worker over a shared central.
    Hpa,
}

/// Workload parameters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkloadSpec {
    pub tier: Tier,
    pub seed: u64,
    /// Steps per worker.
    pub steps: u64,
    pub threads: usize,
    /// Largest small request, in pages.
    pub max_pages: usize,
    /// Full accounting check interval in steps; 0 checks only at teardown.
    /// Ignored with more than one worker.
    pub check_every: u64,
    /// Regions a worker may hold before it is forced to free one.
    pub max_live: usize,
}

impl Default for WorkloadSpec {
    fn default() -> Self {
        Self {
            tier: Tier::Engine,
            seed: 0xDEAD_BEEF,
            steps: 2_000,
            threads: 1,
            max_pages: 64,
            check_every: 1,
            max_live: 256,
        }
    }
}

/// Per-operation counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpCounts {
    pub allocs: u64,
    pub frees: u64,
    pub expands: u64,
    pub shrinks: u64,
    pub purges: u64,
    /// Operations the allocator declined (exhaustion, unsupported, no room).
    pub refused: u64,
}

impl OpCounts {
    fn absorb(&mut self, other: &Self) {
        self.allocs += other.allocs;
        self.frees += other.frees;
        self.expands += other.expands;
        self.shrinks += other.shrinks;
        self.purges += other.purges;
        self.refused += other.refused;
    }
}

/// Result of one run, serialized as the harness's JSON summary.
#[derive(Debug, Clone, Serialize)]
pub struct WorkloadSummary {
    pub tier: Tier,
    pub seed: u64,
    pub steps: u64,
    pub threads: usize,
    pub ops: OpCounts,
    pub peak_live_bytes: usize,
    /// Bytes mapped before teardown.
    pub mapped_bytes: usize,
    pub lifecycle_records: u64,
    pub duration_ms: u64,
    pub outcome: Outcome,
    /// Tier-specific counters.
    pub allocator: serde_json::Value,
}

// ---------------------------------------------------------------------------
// Deterministic generator
// ---------------------------------------------------------------------------

/// xorshift64* stream; one per worker.
#[derive(Debug, Clone)]
pub struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    #[must_use]
    pub fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    pub fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    pub fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = (high_inclusive - low + 1) as u64;
        low + (self.next_u64() % span) as usize
    }
}

// ---------------------------------------------------------------------------
// Tier backends
// ---------------------------------------------------------------------------

trait Backend: Send + Sync {
    fn alloc(&self, worker: usize, size: usize, alignment: usize, zero: bool)
    -> pagewright_core::Result<Region>;
    fn dalloc(&self, worker: usize, id: ExtentId) -> pagewright_core::Result<()>;
    fn expand(&self, worker: usize, region: &Region, new_size: usize) -> pagewright_core::Result<()>;
    fn shrink(&self, worker: usize, region: &Region, new_size: usize) -> pagewright_core::Result<()>;
    /// Returns false when the tier has nothing to purge.
    fn purge(&self, keep_pages: usize) -> bool;
    fn drain_logs(&self) -> Vec<EngineLogRecord>;
    fn mapped_bytes(&self) -> usize;
    fn check_accounting(&self, live: &[Region]) -> Result<(), String>;
    /// Releases every cached page once all regions are freed.
    fn teardown(&self) -> Result<(), String>;
    fn stats(&self) -> serde_json::Value;
    fn large_threshold(&self) -> usize;
}

struct EngineBackend {
    engine: ExtentEngine,
    pages: Arc<SimulatedPages>,
}

impl EngineBackend {
    fn free_bytes(&self) -> usize {
        [ExtentState::Dirty, ExtentState::Muzzy, ExtentState::Retained]
            .into_iter()
            .map(|state| self.engine.free_pages(state) * PAGE)
            .sum()
    }
}

impl Backend for EngineBackend {
    fn alloc(
        &self,
        _worker: usize,
        size: usize,
        alignment: usize,
        zero: bool,
    ) -> pagewright_core::Result<Region> {
        self.engine.alloc(size, alignment, zero)
    }

    fn dalloc(&self, _worker: usize, id: ExtentId) -> pagewright_core::Result<()> {
        self.engine.dalloc(id)
    }

    fn expand(&self, _worker: usize, region: &Region, new_size: usize) -> pagewright_core::Result<()> {
        self.engine.expand(region.id, region.size, new_size, false)
    }

    fn shrink(&self, _worker: usize, region: &Region, new_size: usize) -> pagewright_core::Result<()> {
        self.engine.shrink(region.id, region.size, new_size)
    }

    fn purge(&self, keep_pages: usize) -> bool {
        let dirty = self.engine.purge(ExtentState::Dirty, keep_pages);
        let muzzy = self.engine.purge(ExtentState::Muzzy, keep_pages);
        dirty + muzzy > 0
    }

    fn drain_logs(&self) -> Vec<EngineLogRecord> {
        self.engine.drain_logs()
    }

    fn mapped_bytes(&self) -> usize {
        self.pages.mapped_bytes()
    }

    fn check_accounting(&self, live: &[Region]) -> Result<(), String> {
        let live_bytes: usize = live.iter().map(|r| r.size).sum();
        let abandoned = self.engine.stats().abandoned_bytes as usize;
        let mapped = self.pages.mapped_bytes();
        let accounted = live_bytes + self.free_bytes() + abandoned;
        if accounted != mapped {
            return Err(format!(
                "live+free+abandoned={accounted:#x} but mapped={mapped:#x}"
            ));
        }
        Ok(())
    }

    fn teardown(&self) -> Result<(), String> {
        self.engine.purge(ExtentState::Dirty, 0);
        self.engine.purge(ExtentState::Muzzy, 0);
        self.engine.destroy_retained();
        let abandoned = self.engine.stats().abandoned_bytes as usize;
        let mapped = self.pages.mapped_bytes();
        if mapped != abandoned {
            return Err(format!(
                "{mapped:#x} bytes still mapped after teardown, {abandoned:#x} abandoned"
            ));
        }
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::to_value(self.engine.stats()).unwrap_or_default()
    }

    fn large_threshold(&self) -> usize {
        usize::MAX
    }
}

struct HpaBackend {
    central: Arc<HpaCentral>,
    shards: Vec<HpaShard>,
    ps_alloc_max: usize,
}

impl HpaBackend {
    fn shard(&self, worker: usize) -> &HpaShard {
        &self.shards[worker % self.shards.len()]
    }
}

impl Backend for HpaBackend {
    fn alloc(
        &self,
        worker: usize,
        size: usize,
        _alignment: usize,
        _zero: bool,
    ) -> pagewright_core::Result<Region> {
        self.shard(worker).alloc(size, PAGE, false)
    }

    fn dalloc(&self, worker: usize, id: ExtentId) -> pagewright_core::Result<()> {
        self.shard(worker).dalloc(id)
    }

    fn expand(&self, worker: usize, region: &Region, new_size: usize) -> pagewright_core::Result<()> {
        self.shard(worker).expand(region.id, region.size, new_size, false)
    }

    fn shrink(&self, worker: usize, region: &Region, new_size: usize) -> pagewright_core::Result<()> {
        self.shard(worker).shrink(region.id, region.size, new_size)
    }

    fn purge(&self, _keep_pages: usize) -> bool {
        false
    }

    fn drain_logs(&self) -> Vec<EngineLogRecord> {
        let mut logs = self.central.drain_logs();
        for shard in &self.shards {
            logs.extend(shard.drain_logs());
        }
        logs.sort_by_key(|r| r.decision_id);
        logs
    }

    fn mapped_bytes(&self) -> usize {
        self.central.mapped_bytes() as usize
    }

    fn check_accounting(&self, live: &[Region]) -> Result<(), String> {
        let slab_bytes: usize = self
            .shards
            .iter()
            .flat_map(HpaShard::pageslabs)
            .map(|s| s.size)
            .sum();
        let large_bytes: usize = live
            .iter()
            .filter(|r| r.size > self.ps_alloc_max)
            .map(|r| r.size)
            .sum();
        let accounted = self.central.free_pages() * PAGE + slab_bytes + large_bytes;
        let mapped = self.mapped_bytes();
        if accounted != mapped {
            return Err(format!(
                "free+pageslabs+large={accounted:#x} but central mapped={mapped:#x}"
            ));
        }
        Ok(())
    }

    fn teardown(&self) -> Result<(), String> {
        for shard in &self.shards {
            shard.destroy().map_err(|err| format!("shard {}: {err}", shard.ind()))?;
        }
        if self.central.free_pages() * PAGE != self.mapped_bytes() {
            return Err("central holds active extents after every shard drained".to_string());
        }
        Ok(())
    }

    fn stats(&self) -> serde_json::Value {
        serde_json::json!({
            "central_mapped_bytes": self.central.mapped_bytes(),
            "central_free_pages": self.central.free_pages(),
            "central_free_extents": self.central.free_extents().len(),
            "central_grow_next": self.central.grow_next(),
        })
    }

    fn large_threshold(&self) -> usize {
        self.ps_alloc_max
    }
}

// ---------------------------------------------------------------------------
// Runner
// ---------------------------------------------------------------------------

/// Address ranges currently handed out across all workers.
#[derive(Debug, Default)]
struct Claims {
    ranges: Mutex<BTreeMap<usize, usize>>,
}

impl Claims {
    fn claim(&self, r: &Region) -> Result<(), String> {
        let mut ranges = self.ranges.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((&base, &size)) = ranges.range(..r.base + r.size).next_back() {
            if base + size > r.base {
                return Err(format!(
                    "{:#x}+{:#x} overlaps live {base:#x}+{size:#x}",
                    r.base, r.size
                ));
            }
        }
        ranges.insert(r.base, r.size);
        Ok(())
    }

    fn resize(&self, r: &Region) {
        let mut ranges = self.ranges.lock().unwrap_or_else(|e| e.into_inner());
        ranges.insert(r.base, r.size);
    }

    fn release(&self, r: &Region) {
        let mut ranges = self.ranges.lock().unwrap_or_else(|e| e.into_inner());
        ranges.remove(&r.base);
    }
}

struct WorkerReport {
    ops: OpCounts,
    peak_live_bytes: usize,
}

/// Runs one [`WorkloadSpec`] against a freshly built allocator.
#[derive(Debug, Clone)]
pub struct WorkloadRunner {
    spec: WorkloadSpec,
    config: EngineConfig,
}

impl WorkloadRunner {
    pub fn new(spec: WorkloadSpec, config: EngineConfig) -> Result<Self, HarnessError> {
        config.validate()?;
        Ok(Self { spec, config })
    }

    #[must_use]
    pub fn spec(&self) -> &WorkloadSpec {
        &self.spec
    }

    pub fn run(&self, emitter: &mut LogEmitter) -> Result<WorkloadSummary, HarnessError> {
        let started = Instant::now();
        let threads = self.spec.threads.max(1);
        let backend = self.build(threads)?;
        emitter.emit_entry(
            LogEntry::new("", LogLevel::Info, "run_start")
                .with_seed(self.spec.seed)
                .with_details(serde_json::to_value(&self.spec)?),
        )?;

        let claims = Claims::default();
        let reports = if threads == 1 {
            vec![self.worker(0, backend.as_ref(), &claims, self.spec.check_every)?]
        } else {
            self.run_threads(threads, backend.as_ref(), &claims)?
        };

        let mut ops = OpCounts::default();
        let mut peak_live_bytes = 0;
        for report in &reports {
            ops.absorb(&report.ops);
            peak_live_bytes = peak_live_bytes.max(report.peak_live_bytes);
        }

        let final_step = self.spec.steps;
        backend
            .check_accounting(&[])
            .map_err(|reason| self.violation(final_step, reason))?;
        let mapped_bytes = backend.mapped_bytes();
        let allocator = backend.stats();
        backend
            .teardown()
            .map_err(|reason| self.violation(final_step, reason))?;

        let mut lifecycle_records = 0;
        for record in backend.drain_logs() {
            lifecycle_records += 1;
            emitter.emit_entry(LogEntry::from_lifecycle(&record).with_seed(self.spec.seed))?;
        }

        let duration_ms = u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX);
        let summary = WorkloadSummary {
            tier: self.spec.tier,
            seed: self.spec.seed,
            steps: self.spec.steps,
            threads,
            ops,
            peak_live_bytes,
            mapped_bytes,
            lifecycle_records,
            duration_ms,
            outcome: Outcome::Pass,
            allocator,
        };
        emitter.emit_entry(
            LogEntry::new("", LogLevel::Info, "run_end")
                .with_seed(self.spec.seed)
                .with_outcome(Outcome::Pass)
                .with_duration_ms(duration_ms)
                .with_details(serde_json::to_value(&summary.ops)?),
        )?;
        emitter.flush()?;
        Ok(summary)
    }

    fn build(&self, threads: usize) -> Result<Box<dyn Backend>, HarnessError> {
        let pages = Arc::new(SimulatedPages::default());
        match self.spec.tier {
            Tier::Engine => Ok(Box::new(EngineBackend {
                engine: ExtentEngine::with_pages(self.config.clone(), pages.clone())?,
                pages,
            })),
            Tier::Hpa => {
                let central = Arc::new(HpaCentral::new(
                    u32::MAX,
                    &self.config,
                    pages,
                    Arc::new(AddressIndex::new()),
                    Arc::new(RecordCache::new(self.config.record_capacity)),
                )?);
                let shards = (0..threads)
                    .map(|ind| HpaShard::new(ind as u32, Arc::clone(&central), &self.config))
                    .collect::<pagewright_core::Result<Vec<_>>>()?;
                Ok(Box::new(HpaBackend {
                    central,
                    shards,
                    ps_alloc_max: self.config.ps_alloc_max,
                }))
            }
        }
    }

    fn run_threads(
        &self,
        threads: usize,
        backend: &dyn Backend,
        claims: &Claims,
    ) -> Result<Vec<WorkerReport>, HarnessError> {
        thread::scope(|scope| {
            let handles: Vec<_> = (0..threads)
                .map(|worker| scope.spawn(move || self.worker(worker, backend, claims, 0)))
                .collect();
            handles
                .into_iter()
                .enumerate()
                .map(|(worker, handle)| {
                    handle
                        .join()
                        .map_err(|_| HarnessError::WorkerPanicked { worker })?
                })
                .collect()
        })
    }

    fn violation(&self, step: u64, reason: String) -> HarnessError {
        HarnessError::Invariant {
            seed: self.spec.seed,
            step,
            reason,
        }
    }

    fn worker(
        &self,
        worker: usize,
        backend: &dyn Backend,
        claims: &Claims,
        check_every: u64,
    ) -> Result<WorkerReport, HarnessError> {
        const ALIGNMENTS: [usize; 4] = [PAGE, PAGE, 4 * PAGE, 16 * PAGE];
        let mut rng = XorShift64::new(self.spec.seed ^ (worker as u64).wrapping_mul(0x9E37_79B9));
        let mut live: Vec<Region> = Vec::new();
        let mut ops = OpCounts::default();
        let mut live_bytes = 0usize;
        let mut peak_live_bytes = 0usize;
        let max_pages = self.spec.max_pages.max(1);

        for step in 0..self.spec.steps {
            let must_free = live.len() >= self.spec.max_live.max(1);
            match rng.gen_range(0, 9) {
                _ if must_free => {
                    let r = live.swap_remove(rng.gen_range(0, live.len() - 1));
                    claims.release(&r);
                    backend.dalloc(worker, r.id)?;
                    live_bytes -= r.size;
                    ops.frees += 1;
                }
                0..=3 => {
                    let npages = if rng.gen_range(0, 15) == 0 {
                        let large = backend.large_threshold().min(max_pages * PAGE) / PAGE;
                        rng.gen_range(large + 1, large + 4 * max_pages)
                    } else {
                        rng.gen_range(1, max_pages)
                    };
                    let alignment = ALIGNMENTS[rng.gen_range(0, ALIGNMENTS.len() - 1)];
                    let zero = rng.gen_range(0, 3) == 0;
                    match backend.alloc(worker, npages * PAGE, alignment, zero) {
                        Ok(r) => {
                            claims.claim(&r).map_err(|reason| self.violation(step, reason))?;
                            if r.base % alignment != 0 && matches!(self.spec.tier, Tier::Engine) {
                                return Err(self.violation(
                                    step,
                                    format!("{:#x} not aligned to {alignment:#x}", r.base),
                                ));
                            }
                            live_bytes += r.size;
                            live.push(r);
                            ops.allocs += 1;
                        }
                        Err(ExtentError::OutOfMemory { .. }) => ops.refused += 1,
                        Err(err) => return Err(err.into()),
                    }
                }
                4..=6 if !live.is_empty() => {
                    let r = live.swap_remove(rng.gen_range(0, live.len() - 1));
                    claims.release(&r);
                    backend.dalloc(worker, r.id)?;
                    live_bytes -= r.size;
                    ops.frees += 1;
                }
                7 if !live.is_empty() => {
                    let i = rng.gen_range(0, live.len() - 1);
                    let new_size = live[i].size + rng.gen_range(1, 8) * PAGE;
                    match backend.expand(worker, &live[i], new_size) {
                        Ok(()) => {
                            live_bytes += new_size - live[i].size;
                            live[i].size = new_size;
                            claims.resize(&live[i]);
                            ops.expands += 1;
                        }
                        Err(
                            ExtentError::OutOfMemory { .. }
                            | ExtentError::AddressUnavailable { .. }
                            | ExtentError::Unsupported { .. }
                            | ExtentError::HookRejected { .. },
                        ) => ops.refused += 1,
                        Err(err) => return Err(err.into()),
                    }
                }
                8 if !live.is_empty() => {
                    let i = rng.gen_range(0, live.len() - 1);
                    if live[i].size > PAGE {
                        let new_size = rng.gen_range(1, live[i].size / PAGE - 1) * PAGE;
                        match backend.shrink(worker, &live[i], new_size) {
                            Ok(()) => {
                                live_bytes -= live[i].size - new_size;
                                live[i].size = new_size;
                                claims.resize(&live[i]);
                                ops.shrinks += 1;
                            }
                            Err(ExtentError::Unsupported { .. } | ExtentError::HookRejected { .. }) => {
                                ops.refused += 1;
                            }
                            Err(err) => return Err(err.into()),
                        }
                    }
                }
                9 => {
                    if backend.purge(rng.gen_range(0, 4 * max_pages)) {
                        ops.purges += 1;
                    }
                }
                _ => {}
            }
            peak_live_bytes = peak_live_bytes.max(live_bytes);
            if check_every != 0 && (step + 1) % check_every == 0 {
                backend
                    .check_accounting(&live)
                    .map_err(|reason| self.violation(step, reason))?;
            }
        }

        for r in live.drain(..) {
            claims.release(&r);
            backend.dalloc(worker, r.id)?;
            ops.frees += 1;
        }
        Ok(WorkerReport {
            ops,
            peak_live_bytes,
        })
    }
}

/// Runs `count` consecutive seeds starting at `spec.seed`.
pub fn sweep(
    spec: &WorkloadSpec,
    config: &EngineConfig,
    count: u64,
    emitter: &mut LogEmitter,
) -> Result<Vec<WorkloadSummary>, HarnessError> {
    (0..count)
        .map(|i| {
            let spec = WorkloadSpec {
                seed: spec.seed.wrapping_add(i),
                ..spec.clone()
            };
            WorkloadRunner::new(spec, config.clone())?.run(emitter)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_xorshift_is_deterministic_and_in_range() {
        let mut a = XorShift64::new(42);
        let mut b = XorShift64::new(42);
        for _ in 0..1_000 {
            let v = a.gen_range(3, 9);
            assert_eq!(v, b.gen_range(3, 9));
            assert!((3..=9).contains(&v));
        }
        assert_ne!(XorShift64::new(0).next_u64(), 0);
    }

    #[test]
    fn test_claims_reject_overlap() {
        let claims = Claims::default();
        let region = |base, size| Region {
            id: ExtentId {
                index: 0,
                generation: 0,
            },
            base,
            size,
            zeroed: false,
            committed: true,
        };
        claims.claim(&region(0x1000, 0x2000)).unwrap();
        assert!(claims.claim(&region(0x2000, 0x1000)).is_err());
        assert!(claims.claim(&region(0x0, 0x2000)).is_err());
        claims.claim(&region(0x3000, 0x1000)).unwrap();
        claims.release(&region(0x1000, 0x2000));
        claims.claim(&region(0x0, 0x3000)).unwrap();
    }

    #[test]
    fn test_spec_defaults_deserialize_from_partial_json() {
        let spec: WorkloadSpec = serde_json::from_str(r#"{"tier":"hpa","seed":5}"#).unwrap();
        assert_eq!(spec.tier, Tier::Hpa);
        assert_eq!(spec.seed, 5);
        assert_eq!(spec.steps, WorkloadSpec::default().steps);
    }
}
