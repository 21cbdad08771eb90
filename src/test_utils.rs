// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Common test utilities: logger setup, table fixtures and relocation checks.

use std::collections::HashMap;
use std::sync::Once;
static INIT: Once = Once::new();
use crate::bridge::LoadSink;
use crate::btree::{descend, BTreeBuilder, BTreeOpaque, IndexTuple, ItemPointer};
use crate::loader::{IndexLayout, TreeFlattener};
use crate::page::{Page, MAX_ALIGN};
use crate::store::{BlockStore, CountAccessesStore, MemoryStore};
use crate::{BlockNumber, OblivError, RelationId};
use duplicate::duplicate_item;
use simplelog::{Config, WriteLogger};

/// Size of a fixture heap row: an 8-byte key followed by filler.
pub(crate) const ROW_SIZE: usize = 500;

// For use in manual testing and inspection.
pub(crate) fn init_logger() {
    INIT.call_once(|| {
        WriteLogger::init(log::LevelFilter::Info, Config::default(), std::io::stdout()).unwrap()
    })
}

pub(crate) trait FreshStore: BlockStore {
    fn fresh() -> Self;
}

#[duplicate_item(
    store_type;
    [MemoryStore];
    [CountAccessesStore];
)]
impl FreshStore for store_type {
    fn fresh() -> Self {
        store_type::new()
    }
}

/// Index entries with keys `0, 10, 20, ...` pointing at consecutive heap slots.
pub(crate) fn index_entries(count: usize) -> Vec<(i64, ItemPointer)> {
    let per_block = (crate::BLOCK_SIZE - crate::page::HEADER_SIZE) / (ROW_SIZE + MAX_ALIGN);
    (0..count)
        .map(|i| {
            (
                10 * i as i64,
                ItemPointer {
                    block: (i / per_block) as BlockNumber,
                    offset: (i % per_block + 1) as u16,
                },
            )
        })
        .collect()
}

/// A heap relation and a B+-tree index over it.
pub(crate) struct Table {
    pub(crate) heap: RelationId,
    pub(crate) index: RelationId,
    pub(crate) entries: Vec<(i64, ItemPointer)>,
}

/// Builds a heap of `rows` rows and an index over their keys.
pub(crate) fn build_table<S: BlockStore>(
    store: &mut S,
    rows: usize,
    leaf_capacity: usize,
    internal_capacity: usize,
) -> Table {
    let heap = store.create_relation().unwrap();
    let mut block = store.allocate_block(heap).unwrap();
    let mut page = Page::new(0).unwrap();
    let mut entries = Vec::with_capacity(rows);

    for i in 0..rows {
        let key = 10 * i as i64;
        let mut row = vec![(i % 251) as u8; ROW_SIZE];
        row[..8].copy_from_slice(&key.to_le_bytes());
        if page.free_space() < ROW_SIZE + MAX_ALIGN {
            store.write_block(heap, block, &page).unwrap();
            block = store.allocate_block(heap).unwrap();
            page = Page::new(0).unwrap();
        }
        let offset = page.add_item(&row).unwrap();
        entries.push((key, ItemPointer { block, offset }));
    }
    store.write_block(heap, block, &page).unwrap();
    assert_eq!(entries, index_entries(rows));

    let index = BTreeBuilder::new(leaf_capacity, internal_capacity)
        .unwrap()
        .build(store, &entries)
        .unwrap();
    Table {
        heap,
        index,
        entries,
    }
}

/// A sink that keeps every page it is handed, in arrival order.
#[derive(Debug, Default)]
pub(crate) struct RecordingSink {
    pub(crate) index: Vec<(Page, BlockNumber, u32)>,
    pub(crate) heap: Vec<(Page, BlockNumber)>,
}

impl<S: BlockStore> LoadSink<S> for RecordingSink {
    fn add_index_block(
        &mut self,
        _: &mut S,
        page: &Page,
        level_offset: BlockNumber,
        level: u32,
    ) -> Result<(), OblivError> {
        self.index.push((page.clone(), level_offset, level));
        Ok(())
    }

    fn add_heap_block(
        &mut self,
        _: &mut S,
        page: &Page,
        block: BlockNumber,
    ) -> Result<(), OblivError> {
        self.heap.push((page.clone(), block));
        Ok(())
    }
}

/// Looks `key` up in a relocated index, following within-level downlinks through `layout`.
pub(crate) fn relocated_search<S: BlockStore>(
    store: &S,
    relation: RelationId,
    layout: &IndexLayout,
    key: i64,
) -> Result<Option<ItemPointer>, OblivError> {
    let root = store.read_block(relation, layout.canonical_block(0, 0)?)?;
    descend(root, key, |offset, depth| {
        store.read_block(relation, layout.canonical_block(depth, offset)?)
    })
}

/// Relocates a freshly built index and checks placement, tags, downlinks and lookups.
pub(crate) fn test_relocation<S: FreshStore>(
    entries: usize,
    leaf_capacity: usize,
    internal_capacity: usize,
) {
    init_logger();
    let mut store = S::fresh();
    let table = build_table(&mut store, entries, leaf_capacity, internal_capacity);
    let flattener = TreeFlattener::new(table.index);

    let profile = flattener.measure(&store).unwrap();
    assert_eq!(profile, flattener.measure(&store).unwrap());
    let layout = IndexLayout::from_profile(&profile).unwrap();

    let mut sink = RecordingSink::default();
    flattener.load(&mut store, &mut sink).unwrap();

    // Every page except the metapage arrives exactly once, at a distinct position.
    assert_eq!(sink.index.len() as u64, profile.total_pages());
    assert_eq!(
        sink.index.len() as BlockNumber + 1,
        store.nblocks(table.index).unwrap()
    );
    let mut by_position = HashMap::new();
    for (page, level_offset, level) in &sink.index {
        let opaque = BTreeOpaque::read(page).unwrap();
        assert_eq!((opaque.o_offset, opaque.o_level), (*level_offset, *level));
        layout.canonical_block(*level, *level_offset).unwrap();
        assert!(by_position.insert((*level, *level_offset), page).is_none());
    }
    assert_eq!(by_position.len() as BlockNumber, layout.total_blocks());

    // Every downlink names the page tagged with that offset one level down.
    for (page, _, level) in &sink.index {
        let opaque = BTreeOpaque::read(page).unwrap();
        if opaque.is_leaf() {
            continue;
        }
        for slot in opaque.first_data_offset()..=page.max_offset() {
            let child = IndexTuple::read(page, slot).unwrap().block;
            let child_page = by_position[&(level + 1, child)];
            let child_opaque = BTreeOpaque::read(child_page).unwrap();
            assert_eq!((child_opaque.o_offset, child_opaque.o_level), (child, level + 1));
        }
    }

    let mut mirror = S::fresh();
    let relation = mirror.create_relation().unwrap();
    for _ in 0..layout.total_blocks() {
        mirror.allocate_block(relation).unwrap();
    }
    for (page, level_offset, level) in &sink.index {
        let block = layout.canonical_block(*level, *level_offset).unwrap();
        mirror.write_block(relation, block, page).unwrap();
    }
    for (key, tid) in &table.entries {
        assert_eq!(
            relocated_search(&mirror, relation, &layout, *key).unwrap(),
            Some(*tid),
            "{key}"
        );
    }
    assert_eq!(relocated_search(&mirror, relation, &layout, 5).unwrap(), None);
}

macro_rules! create_relocation_test {
    ($store_type: ident, $entries: expr, $leaf_capacity: expr, $internal_capacity: expr) => {
        paste::paste! {
            #[test]
            fn [<test_relocation_ $store_type:snake _ $entries _ $leaf_capacity _ $internal_capacity>]() {
                test_relocation::<$store_type>($entries, $leaf_capacity, $internal_capacity);
            }
        }
    };
}

macro_rules! create_relocation_tests {
    ($store_type: ident) => {
        create_relocation_test!($store_type, 1, 4, 4);
        create_relocation_test!($store_type, 20, 5, 5);
        create_relocation_test!($store_type, 100, 5, 5);
        // Last level only partly filled
        create_relocation_test!($store_type, 115, 5, 5);
        create_relocation_test!($store_type, 300, 3, 2);
        create_relocation_test!($store_type, 1000, 10, 4);
    };
}

pub(crate) use create_relocation_test;
pub(crate) use create_relocation_tests;
