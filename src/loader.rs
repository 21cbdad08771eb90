// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Breadth-first flattening of a B+-tree into a level-ordered, densely packed layout.
//!
//! The same walk runs in two modes. [`TreeFlattener::measure`] only counts pages per level
//! and returns a [`FanoutProfile`]. [`TreeFlattener::load`] additionally rewrites every
//! downlink and sibling link into a within-level offset, tags each page with its canonical
//! `(level_offset, level)` position, and hands it to a [`LoadSink`].
//!
//! Levels here are counted from the root downwards: the root is level 0.

use crate::{
    bridge::LoadSink,
    btree::{set_downlink, BTreeMeta, BTreeOpaque, IndexTuple, BTREE_METAPAGE, NO_SIBLING},
    page::Page,
    store::BlockStore,
    BlockNumber, OblivError, OffsetNumber, RelationId, INVALID_OFFSET,
};
use std::collections::VecDeque;

/// Per-level page counts of a B+-tree, excluding the root.
///
/// `fanouts[0]` is the number of pages directly below the root and the last entry is the
/// number of leaves.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct FanoutProfile {
    /// Pages per level below the root, top to bottom.
    pub fanouts: Vec<u32>,
    /// Number of levels below the root, minus one.
    pub height: u32,
}

impl FanoutProfile {
    /// Number of pages at `level`, the root being level 0.
    pub fn pages_at(&self, level: u32) -> u32 {
        match level {
            0 => 1,
            l => self.fanouts.get(l as usize - 1).copied().unwrap_or(0),
        }
    }

    /// Number of levels, including the root.
    pub fn levels(&self) -> u32 {
        self.fanouts.len() as u32 + 1
    }

    /// Total number of pages in the relocated tree, root included.
    pub fn total_pages(&self) -> u64 {
        1 + self.fanouts.iter().map(|&f| u64::from(f)).sum::<u64>()
    }
}

/// Maps canonical `(level, level_offset)` positions to block numbers of the mirror index.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct IndexLayout {
    bases: Vec<BlockNumber>,
    counts: Vec<u32>,
}

impl IndexLayout {
    /// Lays the levels of `profile` out one after the other, root first.
    pub fn from_profile(profile: &FanoutProfile) -> Result<Self, OblivError> {
        let counts: Vec<u32> = (0..profile.levels()).map(|l| profile.pages_at(l)).collect();
        let mut bases = Vec::with_capacity(counts.len());
        let mut next: BlockNumber = 0;
        for &count in &counts {
            bases.push(next);
            next = next.checked_add(count).ok_or_else(|| {
                OblivError::InvalidConfigurationError(format!(
                    "{} index pages do not fit in a block number",
                    profile.total_pages()
                ))
            })?;
        }
        Ok(Self { bases, counts })
    }

    /// The block holding the page at `level_offset` within `level`.
    pub fn canonical_block(
        &self,
        level: u32,
        level_offset: BlockNumber,
    ) -> Result<BlockNumber, OblivError> {
        let level_index = level as usize;
        match (self.bases.get(level_index), self.counts.get(level_index)) {
            (Some(&base), Some(&count)) if level_offset < count => Ok(base + level_offset),
            _ => Err(OblivError::CorruptPageError(format!(
                "canonical position ({level}, {level_offset}) lies outside the index layout"
            ))),
        }
    }

    /// Number of blocks the layout spans.
    pub fn total_blocks(&self) -> BlockNumber {
        match (self.bases.last(), self.counts.last()) {
            (Some(base), Some(count)) => base + count,
            _ => 0,
        }
    }
}

#[derive(Clone, Copy, Debug)]
struct QueueEntry {
    parent: Option<BlockNumber>,
    offset_in_parent: OffsetNumber,
    block: BlockNumber,
    level: u32,
}

/// What the walk does with each page: measuring reads only, loading rewrites and emits.
trait Visit {
    const REWRITE: bool;
    fn fetch(&self, block: BlockNumber) -> Result<Page, OblivError>;
    fn emit(&mut self, page: &Page, level_offset: BlockNumber, level: u32)
        -> Result<(), OblivError>;
}

struct Measure<'a, S> {
    store: &'a S,
    index: RelationId,
}

impl<S: BlockStore> Visit for Measure<'_, S> {
    const REWRITE: bool = false;

    fn fetch(&self, block: BlockNumber) -> Result<Page, OblivError> {
        self.store.read_block(self.index, block)
    }

    fn emit(&mut self, _: &Page, _: BlockNumber, _: u32) -> Result<(), OblivError> {
        Ok(())
    }
}

struct Load<'a, S, K> {
    store: &'a mut S,
    sink: &'a mut K,
    index: RelationId,
}

impl<S: BlockStore, K: LoadSink<S>> Visit for Load<'_, S, K> {
    const REWRITE: bool = true;

    fn fetch(&self, block: BlockNumber) -> Result<Page, OblivError> {
        self.store.read_block(self.index, block)
    }

    fn emit(
        &mut self,
        page: &Page,
        level_offset: BlockNumber,
        level: u32,
    ) -> Result<(), OblivError> {
        self.sink.add_index_block(self.store, page, level_offset, level)
    }
}

/// Walks one B+-tree index relation breadth first.
#[derive(Clone, Copy, Debug)]
pub struct TreeFlattener {
    index: RelationId,
}

impl TreeFlattener {
    /// A flattener over the index stored in `index`.
    pub fn new(index: RelationId) -> Self {
        Self { index }
    }

    /// Counts the pages of every level below the root without writing anything.
    pub fn measure<S: BlockStore>(&self, store: &S) -> Result<FanoutProfile, OblivError> {
        let profile = self.walk(&mut Measure {
            store,
            index: self.index,
        })?;
        log::debug!(
            "TreeFlattener::measure -- index {}: fanouts {:?}, height {}",
            self.index,
            profile.fanouts,
            profile.height
        );
        Ok(profile)
    }

    /// Relocates every page of the index into canonical order through `sink`.
    pub fn load<S: BlockStore, K: LoadSink<S>>(
        &self,
        store: &mut S,
        sink: &mut K,
    ) -> Result<(), OblivError> {
        let profile = self.walk(&mut Load {
            store,
            sink,
            index: self.index,
        })?;
        log::info!(
            "TreeFlattener::load -- index {}: relocated {} pages",
            self.index,
            profile.total_pages()
        );
        Ok(())
    }

    fn walk<V: Visit>(&self, visitor: &mut V) -> Result<FanoutProfile, OblivError> {
        let meta = BTreeMeta::read(&visitor.fetch(BTREE_METAPAGE)?)?;

        let mut queue = VecDeque::new();
        queue
            .try_reserve(1)
            .map_err(|_| OblivError::AllocationFailureError)?;
        queue.push_back(QueueEntry {
            parent: None,
            offset_in_parent: INVALID_OFFSET,
            block: meta.root,
            level: 0,
        });

        let mut fanouts = Vec::new();
        let mut nblocks_at_current_level = 1u32;
        let mut nblocks_at_next_level = 0u32;
        let mut level_offset: BlockNumber = 0;
        let mut next_child_offset: BlockNumber = 0;
        let mut levels_closed = 0u32;
        let mut previous_at_level: Option<(BlockNumber, BlockNumber)> = None;

        while let Some(entry) = queue.pop_front() {
            let mut page = visitor.fetch(entry.block)?;
            let opaque = BTreeOpaque::read(&page)?;
            let is_root = entry.parent.is_none();
            check_position(&opaque, &entry, meta.level, is_root)?;

            // Sibling links must agree with breadth-first order.
            let expected_prev = match previous_at_level {
                Some((block, next)) if next == entry.block => block,
                Some((block, next)) => {
                    return Err(OblivError::CorruptPageError(format!(
                        "block {block} links to {next} but block {} follows it",
                        entry.block
                    )))
                }
                None => NO_SIBLING,
            };
            if opaque.prev != expected_prev {
                return Err(OblivError::CorruptPageError(format!(
                    "block {} has left sibling {} instead of {expected_prev}",
                    entry.block, opaque.prev
                )));
            }

            let first = opaque.first_data_offset();
            let last = page.max_offset();
            let live = u32::from(last.saturating_sub(first - 1));

            if !opaque.is_leaf() {
                queue
                    .try_reserve(live as usize)
                    .map_err(|_| OblivError::AllocationFailureError)?;
                for slot in first..=last {
                    let child = IndexTuple::read(&page, slot)?.block;
                    queue.push_back(QueueEntry {
                        parent: Some(entry.block),
                        offset_in_parent: slot,
                        block: child,
                        level: entry.level + 1,
                    });
                    if V::REWRITE {
                        set_downlink(&mut page, slot, next_child_offset)?;
                    }
                    next_child_offset += 1;
                }
            }

            if V::REWRITE {
                let mut tagged = opaque;
                if !is_root {
                    if opaque.prev != NO_SIBLING {
                        tagged.prev = level_offset - 1;
                    }
                    if opaque.next != NO_SIBLING {
                        tagged.next = level_offset + 1;
                    }
                }
                tagged.o_offset = level_offset;
                tagged.o_level = entry.level;
                tagged.write(&mut page)?;
                visitor.emit(&page, level_offset, entry.level)?;
            }

            if is_root {
                fanouts.extend((live > 0 && !opaque.is_leaf()).then_some(live));
                nblocks_at_current_level = live;
                level_offset = 0;
                next_child_offset = 0;
                continue;
            }

            if !opaque.is_leaf() {
                nblocks_at_next_level += live;
            }

            if level_offset + 1 == nblocks_at_current_level {
                if !opaque.is_rightmost() {
                    return Err(OblivError::CorruptPageError(format!(
                        "block {} closes level {} but links right to {}",
                        entry.block, entry.level, opaque.next
                    )));
                }
                if !opaque.is_leaf() && nblocks_at_next_level > 0 {
                    fanouts.push(nblocks_at_next_level);
                }
                nblocks_at_current_level = nblocks_at_next_level;
                nblocks_at_next_level = 0;
                levels_closed += 1;
                level_offset = 0;
                next_child_offset = 0;
                previous_at_level = None;
            } else {
                level_offset += 1;
                previous_at_level = Some((entry.block, opaque.next));
            }
        }

        Ok(FanoutProfile {
            fanouts,
            height: levels_closed.saturating_sub(1),
        })
    }
}

fn check_position(
    opaque: &BTreeOpaque,
    entry: &QueueEntry,
    root_level: u32,
    is_root: bool,
) -> Result<(), OblivError> {
    if opaque.is_root() != is_root || opaque.is_meta() {
        return Err(OblivError::CorruptPageError(format!(
            "block {} (child {} of {:?}) has unexpected flags {:#x}",
            entry.block, entry.offset_in_parent, entry.parent, opaque.flags
        )));
    }
    if opaque.level + entry.level != root_level || opaque.is_leaf() != (opaque.level == 0) {
        return Err(OblivError::CorruptPageError(format!(
            "block {} sits at depth {} but claims level {}",
            entry.block, entry.level, opaque.level
        )));
    }
    Ok(())
}

/// Copies every block of `heap` to `sink` in block order, stamping each page's header tag with
/// its block number. Returns the number of blocks copied.
pub fn load_heap<S: BlockStore, K: LoadSink<S>>(
    heap: RelationId,
    store: &mut S,
    sink: &mut K,
) -> Result<BlockNumber, OblivError> {
    let nblocks = store.nblocks(heap)?;
    for block in 0..nblocks {
        let mut page = store.read_block(heap, block)?;
        if !page.is_new() {
            page.check()?;
            page.set_tag(block);
        }
        sink.add_heap_block(store, &page, block)?;
    }
    log::info!("load_heap -- relation {}: copied {} blocks", heap, nblocks);
    Ok(nblocks)
}
