//! Threads sharing one engine or one central, plus hooks that call back
//! into the engine they serve.

use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, OnceLock, Weak};
use std::thread;

use pagewright_core::hooks::{AllocGrant, AllocRequest};
use pagewright_core::{
    AddressIndex, EngineConfig, ExtentEngine, ExtentHooks, ExtentState, HookSlot, Hooks,
    HpaCentral, HpaShard, PAGE, PagePrimitives, RecordCache, Region, SimulatedPages, reentrancy,
};

struct XorShift64 {
    state: u64,
}

impl XorShift64 {
    fn new(seed: u64) -> Self {
        Self {
            state: seed.max(1),
        }
    }

    fn next_u64(&mut self) -> u64 {
        let mut x = self.state;
        x ^= x >> 12;
        x ^= x << 25;
        x ^= x >> 27;
        self.state = x;
        x.wrapping_mul(0x2545_F491_4F6C_DD1D)
    }

    fn gen_range(&mut self, low: usize, high_inclusive: usize) -> usize {
        let span = (high_inclusive - low + 1) as u64;
        low + (self.next_u64() % span) as usize
    }
}

/// Address ranges currently handed out, shared by every worker.
#[derive(Default)]
struct Claims {
    ranges: Mutex<BTreeMap<usize, usize>>,
}

impl Claims {
    fn claim(&self, r: &Region, ctx: &str) {
        let mut ranges = self.ranges.lock().expect("claims lock");
        if let Some((&base, &size)) = ranges.range(..r.base + r.size).next_back() {
            assert!(
                base + size <= r.base,
                "{ctx}: {:#x}+{:#x} overlaps live {base:#x}+{size:#x}",
                r.base,
                r.size
            );
        }
        ranges.insert(r.base, r.size);
    }

    fn release(&self, r: &Region) {
        self.ranges.lock().expect("claims lock").remove(&r.base);
    }
}

#[test]
fn threads_sharing_an_engine_never_receive_overlapping_regions() {
    const THREADS: u64 = 8;
    const STEPS: usize = 400;
    let pages = Arc::new(SimulatedPages::new(0));
    let engine = Arc::new(
        ExtentEngine::with_pages(
            EngineConfig {
                grow_start_pages: 16,
                ..EngineConfig::default()
            },
            pages.clone(),
        )
        .expect("engine"),
    );
    let claims = Arc::new(Claims::default());

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let engine = Arc::clone(&engine);
            let claims = Arc::clone(&claims);
            thread::spawn(move || {
                let mut rng = XorShift64::new(0xC0FF_EE00 + t);
                let mut mine: Vec<Region> = Vec::new();
                for step in 0..STEPS {
                    let ctx = format!("thread={t} step={step}");
                    match rng.gen_range(0, 5) {
                        0..=2 => {
                            let alignment = PAGE << rng.gen_range(0, 3);
                            let r = engine
                                .alloc(rng.gen_range(1, 32) * PAGE, alignment, false)
                                .expect(&ctx);
                            claims.claim(&r, &ctx);
                            mine.push(r);
                        }
                        3 | 4 if !mine.is_empty() => {
                            let r = mine.swap_remove(rng.gen_range(0, mine.len() - 1));
                            claims.release(&r);
                            engine.dalloc(r.id).expect(&ctx);
                        }
                        5 => {
                            engine.purge(ExtentState::Dirty, rng.gen_range(0, 32));
                        }
                        _ => {}
                    }
                }
                for r in mine {
                    claims.release(&r);
                    engine.dalloc(r.id).expect("final free");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    let free: usize = [ExtentState::Dirty, ExtentState::Muzzy, ExtentState::Retained]
        .into_iter()
        .map(|state| engine.free_pages(state))
        .sum();
    assert_eq!(free * PAGE, pages.mapped_bytes());
    let free_extents: usize = [ExtentState::Dirty, ExtentState::Muzzy, ExtentState::Retained]
        .into_iter()
        .map(|state| engine.free_extent_count(state))
        .sum();
    assert_eq!(engine.records().live(), free_extents);
}

#[test]
fn threads_sharing_central_return_every_pageslab() {
    const THREADS: u64 = 6;
    let config = EngineConfig::default();
    let central = Arc::new(
        HpaCentral::new(
            u32::MAX,
            &config,
            Arc::new(SimulatedPages::new(0)),
            Arc::new(AddressIndex::new()),
            Arc::new(RecordCache::new(None)),
        )
        .expect("central"),
    );
    let shards: Vec<Arc<HpaShard>> = (0..2)
        .map(|ind| Arc::new(HpaShard::new(ind, Arc::clone(&central), &config).expect("shard")))
        .collect();
    let claims = Arc::new(Claims::default());

    let workers: Vec<_> = (0..THREADS)
        .map(|t| {
            let shard = Arc::clone(&shards[(t % 2) as usize]);
            let claims = Arc::clone(&claims);
            thread::spawn(move || {
                let mut rng = XorShift64::new(0x5EED + t);
                let mut mine: Vec<Region> = Vec::new();
                for step in 0..300 {
                    let ctx = format!("thread={t} step={step}");
                    if rng.gen_range(0, 3) < 2 || mine.is_empty() {
                        let npages = if rng.gen_range(0, 15) == 0 {
                            rng.gen_range(65, 300)
                        } else {
                            rng.gen_range(1, 16)
                        };
                        let r = shard.alloc(npages * PAGE, PAGE, false).expect(&ctx);
                        claims.claim(&r, &ctx);
                        mine.push(r);
                    } else {
                        let r = mine.swap_remove(rng.gen_range(0, mine.len() - 1));
                        claims.release(&r);
                        shard.dalloc(r.id).expect(&ctx);
                    }
                    if mine.len() > 64 {
                        let r = mine.swap_remove(0);
                        claims.release(&r);
                        shard.dalloc(r.id).expect(&ctx);
                    }
                }
                for r in mine {
                    claims.release(&r);
                    shard.dalloc(r.id).expect("final free");
                }
            })
        })
        .collect();
    for worker in workers {
        worker.join().expect("worker panicked");
    }

    for shard in &shards {
        assert_eq!(shard.npageslabs(), 0);
        shard.destroy().expect("drained shard");
    }
    assert_eq!(central.free_pages() * PAGE, central.mapped_bytes() as usize);
}

#[test]
fn alloc_hook_calling_back_into_engine_takes_fallback_path() {
    let pages: Arc<dyn PagePrimitives> = Arc::new(SimulatedPages::new(0));
    let slot: Arc<OnceLock<Weak<ExtentEngine>>> = Arc::new(OnceLock::new());
    let nested: Arc<Mutex<Option<Region>>> = Arc::new(Mutex::new(None));
    let depth_seen = Arc::new(Mutex::new(0u32));

    let mut table = ExtentHooks::default();
    {
        let slot = Arc::clone(&slot);
        let nested = Arc::clone(&nested);
        let depth_seen = Arc::clone(&depth_seen);
        let pages = Arc::clone(&pages);
        table.alloc = HookSlot::Custom(Arc::new(move |req: &AllocRequest| -> Option<AllocGrant> {
            *depth_seen.lock().expect("depth") = reentrancy::depth();
            let other_thread = thread::spawn(reentrancy::is_reentrant)
                .join()
                .expect("probe thread");
            assert!(!other_thread, "reentrancy is per thread");
            if let Some(engine) = slot.get().and_then(Weak::upgrade) {
                let mut nested = nested.lock().expect("nested");
                if nested.is_none() {
                    *nested = Some(engine.alloc(2 * PAGE, PAGE, false).expect("nested alloc"));
                }
            }
            let addr = pages.map(req.addr_hint, req.size, req.alignment)?;
            Some(AllocGrant {
                addr,
                zeroed: true,
                committed: true,
            })
        }));
    }

    let config = EngineConfig {
        grow_start_pages: 16,
        ..EngineConfig::default()
    };
    let hooks = Hooks::new(table, Arc::clone(&pages), &config);
    let engine = Arc::new(
        ExtentEngine::new(
            0,
            config,
            hooks,
            Arc::new(AddressIndex::new()),
            Arc::new(RecordCache::new(None)),
        )
        .expect("engine"),
    );
    slot.set(Arc::downgrade(&engine)).expect("slot set once");

    let outer = engine.alloc(PAGE, PAGE, false).expect("outer alloc");
    assert!(!reentrancy::is_reentrant());
    assert_eq!(*depth_seen.lock().expect("depth"), 1);

    let inner = nested.lock().expect("nested").take().expect("hook allocated");
    assert_eq!(engine.stats().fallback_allocs, 1);
    assert!(
        inner.base >= outer.base + outer.size || inner.base + inner.size <= outer.base,
        "nested region overlaps outer"
    );
    let snap = engine.extent(inner.id).expect("nested record");
    assert!(snap.is_head);
    assert_eq!(snap.state, ExtentState::Active);

    engine.dalloc(inner.id).expect("nested free");
    engine.dalloc(outer.id).expect("outer free");
    assert!(engine.free_pages(ExtentState::Dirty) >= 3);
}

#[test]
fn alloc_at_refuses_from_inside_a_hook() {
    let engine = ExtentEngine::with_pages(EngineConfig::default(), Arc::new(SimulatedPages::new(0)))
        .expect("engine");
    let _scope = reentrancy::enter_hook_scope();
    assert!(engine.alloc_at(0, PAGE, false).is_err());
    let r = engine.alloc(PAGE, PAGE, false).expect("fallback alloc");
    assert_eq!(engine.stats().fallback_allocs, 1);
    assert!(engine.extent(r.id).is_some_and(|e| e.is_head));
}
