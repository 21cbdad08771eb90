// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! This module contains benchmarks for the `obliv-mirror` crate.

extern crate criterion;
use core::fmt;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use std::fmt::Display;
use std::time::Duration;

use obliv_mirror::btree::{BTreeBuilder, ItemPointer};
use obliv_mirror::{
    BlockNumber, BlockStore, CountAccessesStore, IndexLayout, LoadSink, MemoryStore,
    MirrorSession, ObliviousBridge, OblivError, Page, RelationId, TreeFlattener, BLOCK_SIZE,
};
use rand::{rngs::StdRng, Rng, SeedableRng};

const ENTRY_COUNTS_TO_BENCHMARK: [usize; 3] = [1 << 10, 1 << 14, 1 << 16];
const LEAF_CAPACITY: usize = 64;
const INTERNAL_CAPACITY: usize = 128;
const MIRROR_BLOCKS: BlockNumber = 1 << 10;
const NUM_RANDOM_BLOCKS_TO_READ: usize = 64;

struct DiscardSink;

impl<S: BlockStore> LoadSink<S> for DiscardSink {
    fn add_index_block(
        &mut self,
        _: &mut S,
        page: &Page,
        _: BlockNumber,
        _: u32,
    ) -> Result<(), OblivError> {
        black_box(page);
        Ok(())
    }

    fn add_heap_block(&mut self, _: &mut S, page: &Page, _: BlockNumber) -> Result<(), OblivError> {
        black_box(page);
        Ok(())
    }
}

fn build_index<S: BlockStore>(store: &mut S, entries: usize) -> RelationId {
    let entries: Vec<(i64, ItemPointer)> = (0..entries)
        .map(|i| {
            (
                i as i64,
                ItemPointer {
                    block: (i / 16) as BlockNumber,
                    offset: (i % 16 + 1) as u16,
                },
            )
        })
        .collect();
    BTreeBuilder::new(LEAF_CAPACITY, INTERNAL_CAPACITY)
        .unwrap()
        .build(store, &entries)
        .unwrap()
}

criterion_group!(
    name = benches;
    config = Criterion::default().warm_up_time(Duration::new(0, 100_000_000)).measurement_time(Duration::new(0, 100_000_000)).sample_size(10);
    targets =
    benchmark_measure,
    benchmark_load,
    benchmark_random_reads,
    print_measure_header,
    count_accesses_on_measure,
);
criterion_main!(benches);

fn benchmark_measure(c: &mut Criterion) {
    let mut group = c.benchmark_group("TreeFlattener::measure");
    for entries in ENTRY_COUNTS_TO_BENCHMARK {
        let mut store = MemoryStore::new();
        let index = build_index(&mut store, entries);
        group.bench_function(
            BenchmarkId::from_parameter(TreeParameters {
                entries,
                leaf_capacity: LEAF_CAPACITY,
            }),
            |b| b.iter(|| TreeFlattener::new(index).measure(&store).unwrap()),
        );
    }
    group.finish();
}

fn benchmark_load(c: &mut Criterion) {
    let mut group = c.benchmark_group("TreeFlattener::load");
    for entries in ENTRY_COUNTS_TO_BENCHMARK {
        let mut store = MemoryStore::new();
        let index = build_index(&mut store, entries);
        group.bench_function(
            BenchmarkId::from_parameter(TreeParameters {
                entries,
                leaf_capacity: LEAF_CAPACITY,
            }),
            |b| {
                b.iter(|| {
                    TreeFlattener::new(index)
                        .load(&mut store, &mut DiscardSink)
                        .unwrap()
                })
            },
        );
    }
    group.finish();
}

fn benchmark_random_reads(c: &mut Criterion) {
    let mut store = MemoryStore::new();
    let table = store.create_relation().unwrap();
    let index = store.create_relation().unwrap();
    let mut bridge =
        ObliviousBridge::new(MirrorSession::new("obliv_bench", "obliv_bench_idx", table, index).unwrap());
    let images = Page::dummy()
        .unwrap()
        .as_bytes()
        .repeat(MIRROR_BLOCKS as usize);
    bridge
        .init_file(&mut store, "obliv_bench", &images, MIRROR_BLOCKS, BLOCK_SIZE, 0)
        .unwrap();

    let mut rng = StdRng::seed_from_u64(0);
    let blocks: Vec<BlockNumber> = (0..NUM_RANDOM_BLOCKS_TO_READ)
        .map(|_| rng.gen_range(0..MIRROR_BLOCKS))
        .collect();
    let mut out = vec![0u8; NUM_RANDOM_BLOCKS_TO_READ * BLOCK_SIZE];

    c.bench_function("ObliviousBridge::read_blocks", |b| {
        b.iter(|| {
            bridge
                .read_blocks(&store, "obliv_bench", black_box(&blocks), &mut out)
                .unwrap()
        })
    });
}

fn count_accesses_on_measure(_: &mut Criterion) {
    for entries in ENTRY_COUNTS_TO_BENCHMARK {
        let mut store = CountAccessesStore::new();
        let index = build_index(&mut store, entries);
        store.reset_counts();

        let profile = TreeFlattener::new(index).measure(&store).unwrap();
        let layout = IndexLayout::from_profile(&profile).unwrap();

        print_table_row(
            entries,
            format!("{:?}", profile.fanouts),
            layout.total_blocks(),
            store.get_read_count(),
        );
    }
}

#[derive(Clone, Copy)]
struct TreeParameters {
    entries: usize,
    leaf_capacity: usize,
}

impl fmt::Display for TreeParameters {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        write!(
            f,
            "(Entries: {} Leaf capacity: {})",
            self.entries, self.leaf_capacity,
        )
    }
}

fn print_table_row<A: Display, B: Display, C: Display, D: Display>(s1: A, s2: B, s3: C, s4: D) {
    println!("{0: <15} | {1: <20} | {2: <15} | {3: <15}", s1, s2, s3, s4)
}

fn print_measure_header(_: &mut Criterion) {
    println!("Physical reads incurred by 1 TreeFlattener::measure:");
    print_table_row("Index entries", "Fanouts", "Mirror pages", "Physical Reads");
}
