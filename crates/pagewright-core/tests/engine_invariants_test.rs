//! Seeded churn over the extent engine, checking the address-space
//! invariants after every step.

use std::sync::Arc;

use pagewright_core::{
    EngineConfig, ExtentEngine, ExtentId, ExtentSnapshot, ExtentState, PAGE, SimulatedPages,
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

#[derive(Debug, Clone, Copy)]
struct Live {
    id: ExtentId,
    base: usize,
    size: usize,
}

fn engine_over(config: EngineConfig) -> (ExtentEngine, Arc<SimulatedPages>) {
    let pages = Arc::new(SimulatedPages::new(0));
    let engine = ExtentEngine::with_pages(config, pages.clone()).expect("engine");
    (engine, pages)
}

fn free_all(engine: &ExtentEngine) -> Vec<ExtentSnapshot> {
    [ExtentState::Dirty, ExtentState::Muzzy, ExtentState::Retained]
        .into_iter()
        .flat_map(|state| engine.free_extents(state))
        .collect()
}

fn check_invariants(
    engine: &ExtentEngine,
    pages: &SimulatedPages,
    live: &[Live],
    last_grow: &mut usize,
    ctx: &str,
) {
    let free = free_all(engine);

    let mut spans: Vec<(usize, usize)> = live.iter().map(|l| (l.base, l.size)).collect();
    spans.extend(free.iter().map(|e| (e.base, e.size)));
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(
            pair[0].0 + pair[0].1 <= pair[1].0,
            "{ctx}: overlap {:#x}+{:#x} vs {:#x}",
            pair[0].0,
            pair[0].1,
            pair[1].0
        );
    }

    let live_bytes: usize = live.iter().map(|l| l.size).sum();
    let free_bytes: usize = free.iter().map(|e| e.size).sum();
    assert_eq!(
        live_bytes + free_bytes,
        pages.mapped_bytes(),
        "{ctx}: page conservation"
    );

    for state in [ExtentState::Dirty, ExtentState::Muzzy, ExtentState::Retained] {
        let mut set = engine.free_extents(state);
        assert_eq!(
            set.iter().map(|e| e.size / PAGE).sum::<usize>(),
            engine.free_pages(state),
            "{ctx}: {state:?} page count"
        );
        set.sort_unstable_by_key(|e| e.base);
        for pair in set.windows(2) {
            let (a, b) = (&pair[0], &pair[1]);
            let mergeable = a.past() == b.base && a.committed == b.committed && !b.is_head;
            assert!(!mergeable, "{ctx}: missed coalesce in {state:?} at {:#x}", b.base);
        }
    }

    for l in live {
        let snap = engine.extent(l.id).expect("live record");
        assert_eq!(snap.state, ExtentState::Active, "{ctx}");
        assert_eq!((snap.base, snap.size), (l.base, l.size), "{ctx}");
        for addr in [l.base, l.base + l.size - PAGE] {
            let (found, _) = engine.lookup(addr).expect("indexed");
            assert_eq!(found.id, l.id, "{ctx}: index at {addr:#x}");
        }
    }

    let grow = engine.grow_next();
    assert!(grow >= *last_grow, "{ctx}: growth index went backwards");
    *last_grow = grow;
}

fn churn(seed: u64, steps: usize, config: EngineConfig) {
    let (engine, pages) = engine_over(config);
    let mut rng = XorShift64::new(seed);
    let mut live: Vec<Live> = Vec::new();
    let mut last_grow = engine.grow_next();
    const ALIGNMENTS: [usize; 5] = [PAGE, PAGE, 2 * PAGE, 4 * PAGE, 16 * PAGE];

    for step in 0..steps {
        let ctx = format!("seed={seed} step={step}");
        match rng.gen_range(0, 9) {
            0..=3 => {
                let size = rng.gen_range(1, 48) * PAGE;
                let alignment = ALIGNMENTS[rng.gen_range(0, ALIGNMENTS.len() - 1)];
                let zero = rng.gen_range(0, 3) == 0;
                let r = engine.alloc(size, alignment, zero).expect(&ctx);
                assert_eq!(r.size, size, "{ctx}");
                assert_eq!(r.base % alignment, 0, "{ctx}");
                assert!(!zero || r.zeroed, "{ctx}: zero request not honoured");
                assert!(r.committed, "{ctx}");
                live.push(Live {
                    id: r.id,
                    base: r.base,
                    size: r.size,
                });
            }
            4..=6 if !live.is_empty() => {
                let victim = live.swap_remove(rng.gen_range(0, live.len() - 1));
                engine.dalloc(victim.id).expect(&ctx);
            }
            7 if !live.is_empty() => {
                let i = rng.gen_range(0, live.len() - 1);
                let l = live[i];
                let grow_by = rng.gen_range(1, 8) * PAGE;
                if engine.expand(l.id, l.size, l.size + grow_by, false).is_ok() {
                    live[i].size += grow_by;
                }
            }
            8 if !live.is_empty() => {
                let i = rng.gen_range(0, live.len() - 1);
                let l = live[i];
                if l.size > PAGE {
                    let new_size = rng.gen_range(1, l.size / PAGE - 1) * PAGE;
                    engine.shrink(l.id, l.size, new_size).expect(&ctx);
                    live[i].size = new_size;
                }
            }
            9 => {
                let state = if rng.gen_range(0, 1) == 0 {
                    ExtentState::Dirty
                } else {
                    ExtentState::Muzzy
                };
                let before = engine.free_pages(state);
                let purged = engine.purge(state, rng.gen_range(0, 64));
                assert_eq!(engine.free_pages(state), before - purged, "{ctx}");
            }
            _ => {}
        }
        check_invariants(&engine, &pages, &live, &mut last_grow, &ctx);
    }

    for l in live.drain(..) {
        engine.dalloc(l.id).expect("final free");
    }
    check_invariants(&engine, &pages, &live, &mut last_grow, &format!("seed={seed} drained"));
    assert_eq!(engine.stats().abandoned_bytes, 0, "seed={seed}");
}

#[test]
fn churn_preserves_invariants_with_retain() {
    for seed in 1..=12 {
        churn(seed, 400, EngineConfig::default());
    }
}

#[test]
fn churn_preserves_invariants_with_small_growth() {
    let config = EngineConfig {
        grow_start_pages: 16,
        ..EngineConfig::default()
    };
    for seed in 100..=108 {
        churn(seed, 400, config.clone());
    }
}

#[test]
fn churn_preserves_invariants_with_tight_oversize_threshold() {
    let config = EngineConfig {
        oversize_threshold: 32 * PAGE,
        ..EngineConfig::default()
    };
    for seed in 200..=206 {
        churn(seed, 300, config.clone());
    }
}

#[test]
fn purge_moves_least_recent_dirty_extents_to_muzzy() {
    let (engine, _pages) = engine_over(EngineConfig::default());
    let mut held = Vec::new();
    for _ in 0..16 {
        held.push(engine.alloc(3 * PAGE, PAGE, false).expect("alloc"));
    }
    // Free every other region so the dirty set holds separate extents.
    for r in held.iter().step_by(2) {
        engine.dalloc(r.id).expect("free");
    }
    assert_eq!(engine.free_extent_count(ExtentState::Dirty), 8);
    let purged = engine.purge(ExtentState::Dirty, 6);
    assert!(purged > 0);
    let left = engine.free_pages(ExtentState::Dirty);
    assert!(left <= 6, "dirty pages left: {left}");
    assert_eq!(engine.free_pages(ExtentState::Muzzy), 24 - left);
}

#[test]
fn region_at_address_zero_is_a_valid_region() {
    let (engine, _pages) = engine_over(EngineConfig {
        grow_start_pages: 16,
        ..EngineConfig::default()
    });
    let r = engine.alloc(PAGE, PAGE, false).expect("alloc");
    assert_eq!(r.base, 0);
    let (snap, szind) = engine.lookup(0).expect("indexed at zero");
    assert_eq!(snap.id, r.id);
    assert_eq!(szind, None);
    engine.dalloc(r.id).expect("free");
    let again = engine.alloc(PAGE, PAGE, false).expect("realloc");
    assert_eq!(again.base, 0);
}

#[test]
fn freed_neighbours_coalesce_regardless_of_order() {
    for order in [[0usize, 1], [1, 0]] {
        let (engine, _pages) = engine_over(EngineConfig {
            grow_start_pages: 16,
            ..EngineConfig::default()
        });
        let a = engine.alloc(4 * PAGE, PAGE, false).expect("a");
        let b = engine.alloc(4 * PAGE, PAGE, false).expect("b");
        assert_eq!(b.base, a.base + a.size);
        let ids = [a.id, b.id];
        for i in order {
            engine.dalloc(ids[i]).expect("free");
        }
        let dirty = engine.free_extents(ExtentState::Dirty);
        assert_eq!(dirty.len(), 1, "order={order:?}");
        assert_eq!((dirty[0].base, dirty[0].size), (0, 8 * PAGE), "order={order:?}");
    }
}
