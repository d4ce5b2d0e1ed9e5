//! Hugepage tier under seeded churn: pageslab bookkeeping against a brute
//! force model, and central's page accounting.

use std::sync::Arc;

use pagewright_core::{
    AddressIndex, EngineConfig, ExtentError, HpaCentral, HpaShard, PAGE, RecordCache, Region,
    SimulatedPages,
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

fn central(config: &EngineConfig) -> Arc<HpaCentral> {
    Arc::new(
        HpaCentral::new(
            u32::MAX,
            config,
            Arc::new(SimulatedPages::new(0)),
            Arc::new(AddressIndex::new()),
            Arc::new(RecordCache::new(None)),
        )
        .expect("central"),
    )
}

fn longest_run(free: &[bool]) -> usize {
    let mut best = 0;
    let mut run = 0;
    for &f in free {
        run = if f { run + 1 } else { 0 };
        best = best.max(run);
    }
    best
}

fn check_shard(shard: &HpaShard, live: &[Region], ps_alloc_max: usize, ctx: &str) {
    let mut spans: Vec<(usize, usize)> = live.iter().map(|r| (r.base, r.size)).collect();
    spans.sort_unstable();
    for pair in spans.windows(2) {
        assert!(pair[0].0 + pair[0].1 <= pair[1].0, "{ctx}: overlapping regions");
    }

    let small: Vec<&Region> = live.iter().filter(|r| r.size <= ps_alloc_max).collect();
    assert_eq!(
        shard.nactive(),
        small.iter().map(|r| r.size / PAGE).sum::<usize>(),
        "{ctx}: active pageslab pages"
    );

    let slabs = shard.pageslabs();
    assert_eq!(slabs.len(), shard.npageslabs(), "{ctx}");
    let mut placed = 0;
    for slab in &slabs {
        let mut free = vec![true; slab.size / PAGE];
        for r in small
            .iter()
            .filter(|r| r.base >= slab.base && r.base < slab.past())
        {
            placed += 1;
            let first = (r.base - slab.base) / PAGE;
            for page in &mut free[first..first + r.size / PAGE] {
                assert!(*page, "{ctx}: page handed out twice");
                *page = false;
            }
        }
        assert!(free.iter().any(|f| !f), "{ctx}: empty pageslab kept");
        assert_eq!(
            slab.longest_free_range,
            Some(longest_run(&free)),
            "{ctx}: longest free range of slab at {:#x}",
            slab.base
        );
    }
    assert_eq!(placed, small.len(), "{ctx}: small region outside every pageslab");
}

fn check_central(central: &HpaCentral, shard: &HpaShard, live: &[Region], ps_alloc_max: usize, ctx: &str) {
    let slab_bytes: usize = shard.pageslabs().iter().map(|s| s.size).sum();
    let large_bytes: usize = live
        .iter()
        .filter(|r| r.size > ps_alloc_max)
        .map(|r| r.size)
        .sum();
    assert_eq!(
        central.free_pages() * PAGE + slab_bytes + large_bytes,
        central.mapped_bytes() as usize,
        "{ctx}: central page conservation"
    );
}

#[test]
fn shard_churn_matches_brute_force_model() {
    for seed in 1..=10u64 {
        let config = EngineConfig::default();
        let central = central(&config);
        let shard = HpaShard::new(0, central.clone(), &config).expect("shard");
        let mut rng = XorShift64::new(seed);
        let mut live: Vec<Region> = Vec::new();

        for step in 0..500 {
            let ctx = format!("seed={seed} step={step}");
            match rng.gen_range(0, 9) {
                0..=4 => {
                    let npages = if rng.gen_range(0, 9) == 0 {
                        rng.gen_range(65, 700)
                    } else {
                        rng.gen_range(1, 64)
                    };
                    let r = shard.alloc(npages * PAGE, PAGE, false).expect(&ctx);
                    assert_eq!(r.size, npages * PAGE, "{ctx}");
                    live.push(r);
                }
                _ if !live.is_empty() => {
                    let r = live.swap_remove(rng.gen_range(0, live.len() - 1));
                    shard.dalloc(r.id).expect(&ctx);
                }
                _ => {}
            }
            check_shard(&shard, &live, config.ps_alloc_max, &ctx);
            check_central(&central, &shard, &live, config.ps_alloc_max, &ctx);
        }

        for r in live.drain(..) {
            shard.dalloc(r.id).expect("final free");
        }
        assert_eq!(shard.npageslabs(), 0, "seed={seed}");
        shard.destroy().expect("drained shard");
        assert_eq!(
            central.free_pages() * PAGE,
            central.mapped_bytes() as usize,
            "seed={seed}"
        );
        assert!(
            central.free_extents().iter().all(|e| e.is_head),
            "seed={seed}: mappings not merged back whole"
        );
    }
}

#[test]
fn pageslab_longest_free_range_tracks_frees() {
    let config = EngineConfig {
        ps_goal: 16 * PAGE,
        ps_alloc_max: 16 * PAGE,
        ..EngineConfig::default()
    };
    let shard = HpaShard::new(1, central(&config), &config).expect("shard");
    let a = shard.alloc(4 * PAGE, PAGE, false).expect("a");
    let b = shard.alloc(4 * PAGE, PAGE, false).expect("b");
    let slabs = shard.pageslabs();
    assert_eq!(slabs.len(), 1);
    assert_eq!(slabs[0].size, 16 * PAGE);
    assert_eq!(slabs[0].longest_free_range, Some(8));

    shard.dalloc(a.id).expect("free a");
    assert_eq!(shard.pageslabs()[0].longest_free_range, Some(8));
    let c = shard.alloc(8 * PAGE, PAGE, false).expect("c");
    assert_eq!(c.base, b.base + 4 * PAGE);
    assert_eq!(shard.pageslabs()[0].longest_free_range, Some(4));
}

#[test]
fn shards_share_central_without_sharing_pageslabs() {
    let config = EngineConfig::default();
    let central = central(&config);
    let first = HpaShard::new(0, central.clone(), &config).expect("first");
    let second = HpaShard::new(1, central.clone(), &config).expect("second");
    let a = first.alloc(PAGE, PAGE, false).expect("a");
    let b = second.alloc(PAGE, PAGE, false).expect("b");
    assert_eq!(first.npageslabs(), 1);
    assert_eq!(second.npageslabs(), 1);
    assert_ne!(
        first.pageslabs()[0].base,
        second.pageslabs()[0].base,
        "each shard carves its own pageslab"
    );
    assert_eq!(second.dalloc(a.id), Err(ExtentError::StaleHandle));
    first.dalloc(a.id).expect("owner frees");
    second.dalloc(b.id).expect("owner frees");
    first.destroy().expect("first empty");
    second.destroy().expect("second empty");
}
