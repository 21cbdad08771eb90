// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The on-page format of a conventional B+-tree index over a single fixed-width key.
//!
//! Block 0 is a metapage naming the root. Every other page carries a [`BTreeOpaque`] special
//! space with sibling links, its level (0 = leaf) and the canonical tag written when the page
//! is relocated into an oblivious mirror. Non-rightmost pages keep their high key in slot 1.

use crate::{
    page::{get_u16, get_u32, put_u16, put_u32, Page},
    store::BlockStore,
    BlockNumber, OblivError, OffsetNumber, RelationId, DUMMY_BLOCK,
};
use static_assertions::const_assert_eq;

/// Block number of the metapage.
pub const BTREE_METAPAGE: BlockNumber = 0;
/// Sibling link value meaning "no page on this side".
pub const NO_SIBLING: BlockNumber = BlockNumber::MAX;
/// Size of the special space of every B+-tree page.
pub const BTREE_SPECIAL_SIZE: usize = 24;
/// Size of an encoded [`IndexTuple`].
pub const INDEX_TUPLE_SIZE: usize = 16;

/// Slot of the high key on non-rightmost pages.
pub const P_HIKEY: OffsetNumber = 1;

const BTREE_MAGIC: u32 = 0x0531_62;
const META_SIZE: usize = 12;

/// Page is a leaf.
pub const BTP_LEAF: u16 = 1 << 0;
/// Page is the root.
pub const BTP_ROOT: u16 = 1 << 1;
/// Page is the metapage.
pub const BTP_META: u16 = 1 << 2;

const_assert_eq!(BTREE_SPECIAL_SIZE % crate::page::MAX_ALIGN, 0);
const_assert_eq!(INDEX_TUPLE_SIZE % crate::page::MAX_ALIGN, 0);

/// The special space of a B+-tree page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BTreeOpaque {
    /// Left sibling on the same level, or [`NO_SIBLING`].
    pub prev: BlockNumber,
    /// Right sibling on the same level, or [`NO_SIBLING`].
    pub next: BlockNumber,
    /// Distance from the leaf level.
    pub level: u32,
    /// `BTP_*` bits.
    pub flags: u16,
    /// Position of the page within its level once relocated, else `DUMMY_BLOCK`.
    pub o_offset: BlockNumber,
    /// Depth of the page below the root once relocated, else `DUMMY_BLOCK`.
    pub o_level: u32,
}

impl BTreeOpaque {
    /// An opaque for a page that has not been relocated.
    pub fn new(prev: BlockNumber, next: BlockNumber, level: u32, flags: u16) -> Self {
        Self {
            prev,
            next,
            level,
            flags,
            o_offset: DUMMY_BLOCK,
            o_level: DUMMY_BLOCK,
        }
    }

    /// Whether the page is a leaf.
    pub fn is_leaf(&self) -> bool {
        self.flags & BTP_LEAF != 0
    }

    /// Whether the page is the root.
    pub fn is_root(&self) -> bool {
        self.flags & BTP_ROOT != 0
    }

    /// Whether the page is the metapage.
    pub fn is_meta(&self) -> bool {
        self.flags & BTP_META != 0
    }

    /// Whether the page is the last on its level.
    pub fn is_rightmost(&self) -> bool {
        self.next == NO_SIBLING
    }

    /// The first slot holding data rather than a high key.
    pub fn first_data_offset(&self) -> OffsetNumber {
        if self.is_rightmost() {
            P_HIKEY
        } else {
            P_HIKEY + 1
        }
    }

    /// Decodes the special space of `page`.
    pub fn read(page: &Page) -> Result<Self, OblivError> {
        page.check()?;
        let special = page.special();
        if special.len() != BTREE_SPECIAL_SIZE {
            return Err(OblivError::CorruptPageError(format!(
                "b-tree special space is {} bytes",
                special.len()
            )));
        }
        Ok(Self {
            prev: get_u32(special, 0)?,
            next: get_u32(special, 4)?,
            level: get_u32(special, 8)?,
            flags: get_u16(special, 12)?,
            o_offset: get_u32(special, 16)?,
            o_level: get_u32(special, 20)?,
        })
    }

    /// Encodes `self` into the special space of `page`.
    pub fn write(&self, page: &mut Page) -> Result<(), OblivError> {
        let special = page.special_mut();
        if special.len() != BTREE_SPECIAL_SIZE {
            return Err(OblivError::CorruptPageError(format!(
                "b-tree special space is {} bytes",
                special.len()
            )));
        }
        put_u32(special, 0, self.prev);
        put_u32(special, 4, self.next);
        put_u32(special, 8, self.level);
        put_u16(special, 12, self.flags);
        put_u16(special, 14, 0);
        put_u32(special, 16, self.o_offset);
        put_u32(special, 20, self.o_level);
        Ok(())
    }
}

/// Location of a heap tuple.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct ItemPointer {
    /// Heap block.
    pub block: BlockNumber,
    /// Slot within the heap block.
    pub offset: OffsetNumber,
}

/// An index entry. On internal pages `block` is the downlink; on leaves `(block, offset)` is
/// the heap tuple.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct IndexTuple {
    /// The indexed key.
    pub key: i64,
    /// Child page or heap block.
    pub block: BlockNumber,
    /// Heap slot; unused on internal pages.
    pub offset: OffsetNumber,
}

impl IndexTuple {
    /// Encodes the tuple.
    pub fn to_bytes(&self) -> [u8; INDEX_TUPLE_SIZE] {
        let mut bytes = [0u8; INDEX_TUPLE_SIZE];
        bytes[0..8].copy_from_slice(&self.key.to_le_bytes());
        put_u32(&mut bytes, 8, self.block);
        put_u16(&mut bytes, 12, self.offset);
        bytes
    }

    /// Decodes the tuple stored at slot `offset` of `page`.
    pub fn read(page: &Page, offset: OffsetNumber) -> Result<Self, OblivError> {
        let bytes = page.item(offset)?;
        if bytes.len() != INDEX_TUPLE_SIZE {
            return Err(OblivError::CorruptPageError(format!(
                "index tuple at slot {offset} is {} bytes",
                bytes.len()
            )));
        }
        let mut key = [0u8; 8];
        key.copy_from_slice(&bytes[0..8]);
        Ok(Self {
            key: i64::from_le_bytes(key),
            block: get_u32(bytes, 8)?,
            offset: get_u16(bytes, 12)?,
        })
    }
}

/// Overwrites the downlink stored at slot `offset` of an internal page.
pub fn set_downlink(page: &mut Page, offset: OffsetNumber, child: BlockNumber) -> Result<(), OblivError> {
    let bytes = page.item_mut(offset)?;
    if bytes.len() != INDEX_TUPLE_SIZE {
        return Err(OblivError::CorruptPageError(format!(
            "index tuple at slot {offset} is {} bytes",
            bytes.len()
        )));
    }
    put_u32(bytes, 8, child);
    Ok(())
}

/// Returns an empty B+-tree page carrying `opaque`.
pub fn new_page(opaque: &BTreeOpaque) -> Result<Page, OblivError> {
    let mut page = Page::new(BTREE_SPECIAL_SIZE)?;
    opaque.write(&mut page)?;
    Ok(page)
}

/// The contents of the metapage.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct BTreeMeta {
    /// Block number of the root page.
    pub root: BlockNumber,
    /// Level of the root page (0 when the root is a leaf).
    pub level: u32,
}

impl BTreeMeta {
    /// Decodes the metapage.
    pub fn read(page: &Page) -> Result<Self, OblivError> {
        let opaque = BTreeOpaque::read(page)?;
        if !opaque.is_meta() || page.max_offset() != 1 {
            return Err(OblivError::CorruptPageError("not a b-tree metapage".into()));
        }
        let bytes = page.item(1)?;
        if bytes.len() != META_SIZE || get_u32(bytes, 0)? != BTREE_MAGIC {
            return Err(OblivError::CorruptPageError("bad b-tree metapage magic".into()));
        }
        Ok(Self {
            root: get_u32(bytes, 4)?,
            level: get_u32(bytes, 8)?,
        })
    }

    /// Encodes the metapage.
    pub fn to_page(&self) -> Result<Page, OblivError> {
        let mut page = new_page(&BTreeOpaque::new(NO_SIBLING, NO_SIBLING, 0, BTP_META))?;
        let mut bytes = [0u8; META_SIZE];
        put_u32(&mut bytes, 0, BTREE_MAGIC);
        put_u32(&mut bytes, 4, self.root);
        put_u32(&mut bytes, 8, self.level);
        page.add_item(&bytes)?;
        Ok(page)
    }
}

/// Builds a B+-tree bottom-up from sorted entries, the way a bulk index build does:
/// leaves are allocated first, then each level above, with the root allocated last.
#[derive(Clone, Copy, Debug)]
pub struct BTreeBuilder {
    leaf_capacity: usize,
    internal_capacity: usize,
}

impl BTreeBuilder {
    /// Returns a builder packing at most `leaf_capacity` entries per leaf and
    /// `internal_capacity` downlinks per internal page.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if a leaf capacity is 0, an internal capacity is
    /// below 2, or either does not fit in a page alongside a high key.
    pub fn new(leaf_capacity: usize, internal_capacity: usize) -> Result<Self, OblivError> {
        let per_page = crate::page::ITEM_ID_SIZE + INDEX_TUPLE_SIZE;
        let usable = crate::BLOCK_SIZE - crate::page::HEADER_SIZE - BTREE_SPECIAL_SIZE;
        let max_entries = usable / per_page - 1;
        if leaf_capacity == 0
            || internal_capacity < 2
            || leaf_capacity > max_entries
            || internal_capacity > max_entries
        {
            return Err(OblivError::InvalidConfigurationError(format!(
                "b-tree capacities ({leaf_capacity}, {internal_capacity}) outside 1..={max_entries}"
            )));
        }
        Ok(Self {
            leaf_capacity,
            internal_capacity,
        })
    }

    /// Creates a new index relation holding `entries`, which must be sorted by key.
    pub fn build<S: BlockStore>(
        &self,
        store: &mut S,
        entries: &[(i64, ItemPointer)],
    ) -> Result<RelationId, OblivError> {
        if entries.windows(2).any(|w| w[0].0 > w[1].0) {
            return Err(OblivError::InvalidConfigurationError(
                "index entries are not sorted".into(),
            ));
        }

        let relation = store.create_relation()?;
        let metapage = store.allocate_block(relation)?;
        debug_assert_eq!(metapage, BTREE_METAPAGE);

        let leaves: Vec<Vec<IndexTuple>> = if entries.is_empty() {
            vec![Vec::new()]
        } else {
            entries
                .chunks(self.leaf_capacity)
                .map(|chunk| {
                    chunk
                        .iter()
                        .map(|(key, tid)| IndexTuple {
                            key: *key,
                            block: tid.block,
                            offset: tid.offset,
                        })
                        .collect()
                })
                .collect()
        };

        let mut level = 0;
        let mut current = Self::write_level(store, relation, &leaves, level)?;
        while current.len() > 1 {
            level += 1;
            let groups: Vec<Vec<IndexTuple>> = current
                .chunks(self.internal_capacity)
                .map(|chunk| {
                    chunk
                        .iter()
                        .map(|&(block, key)| IndexTuple {
                            key,
                            block,
                            offset: 0,
                        })
                        .collect()
                })
                .collect();
            current = Self::write_level(store, relation, &groups, level)?;
        }

        let meta = BTreeMeta {
            root: current[0].0,
            level,
        };
        store.write_block(relation, BTREE_METAPAGE, &meta.to_page()?)?;
        log::info!(
            "BTreeBuilder::build -- relation {} with {} entries, root {} at level {}",
            relation,
            entries.len(),
            meta.root,
            meta.level
        );
        Ok(relation)
    }

    /// Writes one level and returns each page's block number with its lowest key.
    fn write_level<S: BlockStore>(
        store: &mut S,
        relation: RelationId,
        groups: &[Vec<IndexTuple>],
        level: u32,
    ) -> Result<Vec<(BlockNumber, i64)>, OblivError> {
        let blocks = groups
            .iter()
            .map(|_| store.allocate_block(relation))
            .collect::<Result<Vec<_>, _>>()?;

        let mut flags = if level == 0 { BTP_LEAF } else { 0 };
        if groups.len() == 1 {
            flags |= BTP_ROOT;
        }

        for (i, group) in groups.iter().enumerate() {
            let prev = if i == 0 { NO_SIBLING } else { blocks[i - 1] };
            let next = blocks.get(i + 1).copied().unwrap_or(NO_SIBLING);
            let mut page = new_page(&BTreeOpaque::new(prev, next, level, flags))?;

            if let Some(right) = groups.get(i + 1) {
                let high_key = right.first().map_or(i64::MAX, |t| t.key);
                page.add_item(
                    &IndexTuple {
                        key: high_key,
                        block: NO_SIBLING,
                        offset: 0,
                    }
                    .to_bytes(),
                )?;
            }
            for tuple in group {
                page.add_item(&tuple.to_bytes())?;
            }
            store.write_block(relation, blocks[i], &page)?;
        }

        Ok(blocks
            .into_iter()
            .zip(groups.iter().map(|g| g.first().map_or(i64::MIN, |t| t.key)))
            .collect())
    }
}

/// Descends from `root` towards `key`, fetching each child with `fetch(downlink, depth)`.
/// Returns the heap location of the first entry equal to `key` in the leaf reached.
pub fn descend<F>(root: Page, key: i64, mut fetch: F) -> Result<Option<ItemPointer>, OblivError>
where
    F: FnMut(BlockNumber, u32) -> Result<Page, OblivError>,
{
    let mut page = root;
    let mut depth = 0;
    loop {
        let opaque = BTreeOpaque::read(&page)?;
        let first = opaque.first_data_offset();
        let last = page.max_offset();

        if opaque.is_leaf() {
            for offset in first..=last {
                let tuple = IndexTuple::read(&page, offset)?;
                if tuple.key == key {
                    return Ok(Some(ItemPointer {
                        block: tuple.block,
                        offset: tuple.offset,
                    }));
                }
            }
            return Ok(None);
        }

        if last < first {
            return Ok(None);
        }

        // The first downlink covers everything below the second separator.
        let mut child = IndexTuple::read(&page, first)?.block;
        for offset in first + 1..=last {
            let tuple = IndexTuple::read(&page, offset)?;
            if tuple.key > key {
                break;
            }
            child = tuple.block;
        }

        depth += 1;
        page = fetch(child, depth)?;
    }
}

/// Looks `key` up in the index stored in `relation`.
pub fn search<S: BlockStore>(
    store: &S,
    relation: RelationId,
    key: i64,
) -> Result<Option<ItemPointer>, OblivError> {
    let meta = BTreeMeta::read(&store.read_block(relation, BTREE_METAPAGE)?)?;
    let root = store.read_block(relation, meta.root)?;
    descend(root, key, |child, _| store.read_block(relation, child))
}
