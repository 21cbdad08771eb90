// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The status catalog: one row per protected table recording its mirror relations, declared
//! capacities and whether its oblivious mirror has been materialized.
//!
//! The catalog is a heap relation of fixed-width rows. Rows are appended by an administrator
//! and afterwards only updated in place.

use crate::{
    page::{get_u16, get_u32, put_u16, put_u32, Page},
    store::BlockStore,
    BlockNumber, OblivError, OffsetNumber, RelationId, INVALID_RELATION,
};
use static_assertions::const_assert;

/// Size of one encoded catalog row.
pub const STATUS_ROW_SIZE: usize = 40;

const COLUMNS: usize = 9;
const COLUMN_BASE: usize = 4;

const TABLE_ID: usize = 0;
const MIRROR_TABLE_ID: usize = 1;
const MIRROR_INDEX_ID: usize = 2;
const INDEX_ACCESS_METHOD: usize = 3;
const TABLE_BLOCK_COUNT: usize = 4;
const INDEX_BLOCK_COUNT: usize = 5;
const HEAP_RELFILE_ID: usize = 6;
const INDEX_RELFILE_ID: usize = 7;
const INITIALIZED: usize = 8;

const_assert!(COLUMN_BASE + 4 * COLUMNS == STATUS_ROW_SIZE);
const_assert!(COLUMNS <= 16);

/// The index algorithm used by a table's mirror index.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum IndexAccessMethod {
    /// A B+-tree: only the metapage exists before the mirror is loaded.
    BTree,
    /// A hash index: the metapage, two bucket pages and a bitmap page exist up front.
    Hash,
}

impl IndexAccessMethod {
    /// The catalog identifier of the access method.
    pub fn oid(self) -> u32 {
        match self {
            Self::BTree => 403,
            Self::Hash => 405,
        }
    }

    /// The access method identified by `oid`, if any.
    pub fn from_oid(oid: u32) -> Option<Self> {
        match oid {
            403 => Some(Self::BTree),
            405 => Some(Self::Hash),
            _ => None,
        }
    }

    /// How many leading pages of a freshly created index already exist.
    pub fn preexisting_pages(self) -> BlockNumber {
        match self {
            Self::BTree => 1,
            Self::Hash => 4,
        }
    }
}

/// One catalog row. Columns stored as null decode to their invalid sentinel.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusRecord {
    /// The protected table.
    pub table_id: RelationId,
    /// Plaintext heap relation mirrored into the oblivious table file.
    pub mirror_table_id: RelationId,
    /// Plaintext index relation mirrored into the oblivious index file.
    pub mirror_index_id: RelationId,
    /// Algorithm of the mirror index.
    pub index_access_method: Option<IndexAccessMethod>,
    /// Declared capacity of the oblivious table file, in blocks.
    pub table_block_count: i32,
    /// Declared capacity of the oblivious index file, in blocks.
    pub index_block_count: i32,
    /// Relation created for the oblivious table file.
    pub heap_relfile_id: RelationId,
    /// Relation created for the oblivious index file.
    pub index_relfile_id: RelationId,
    /// Whether the mirror has been fully materialized.
    pub initialized: bool,
}

impl StatusRecord {
    /// An uninitialized row with no mirror files yet.
    pub fn new(
        table_id: RelationId,
        mirror_table_id: RelationId,
        mirror_index_id: RelationId,
        index_access_method: IndexAccessMethod,
        table_block_count: i32,
        index_block_count: i32,
    ) -> Self {
        Self {
            table_id,
            mirror_table_id,
            mirror_index_id,
            index_access_method: Some(index_access_method),
            table_block_count,
            index_block_count,
            heap_relfile_id: INVALID_RELATION,
            index_relfile_id: INVALID_RELATION,
            initialized: false,
        }
    }

    fn to_bytes(self) -> [u8; STATUS_ROW_SIZE] {
        let columns: [(u32, bool); COLUMNS] = [
            (self.table_id, false),
            (self.mirror_table_id, self.mirror_table_id == INVALID_RELATION),
            (self.mirror_index_id, self.mirror_index_id == INVALID_RELATION),
            (
                self.index_access_method.map_or(0, IndexAccessMethod::oid),
                self.index_access_method.is_none(),
            ),
            (self.table_block_count as u32, false),
            (self.index_block_count as u32, false),
            (self.heap_relfile_id, self.heap_relfile_id == INVALID_RELATION),
            (self.index_relfile_id, self.index_relfile_id == INVALID_RELATION),
            (u32::from(self.initialized), false),
        ];

        let mut bytes = [0u8; STATUS_ROW_SIZE];
        let mut nulls = 0u16;
        for (i, (value, is_null)) in columns.into_iter().enumerate() {
            if is_null {
                nulls |= 1 << i;
            }
            put_u32(&mut bytes, COLUMN_BASE + 4 * i, value);
        }
        put_u16(&mut bytes, 0, nulls);
        bytes
    }

    fn from_bytes(bytes: &[u8]) -> Result<Self, OblivError> {
        if bytes.len() != STATUS_ROW_SIZE {
            return Err(OblivError::CorruptPageError(format!(
                "status row is {} bytes",
                bytes.len()
            )));
        }
        let nulls = get_u16(bytes, 0)?;
        let column = |i: usize| -> Result<Option<u32>, OblivError> {
            if nulls & (1 << i) != 0 {
                Ok(None)
            } else {
                get_u32(bytes, COLUMN_BASE + 4 * i).map(Some)
            }
        };
        let relation = |i: usize| Ok::<_, OblivError>(column(i)?.unwrap_or(INVALID_RELATION));
        let count = |i: usize| Ok::<_, OblivError>(column(i)?.map_or(0, |c| c as i32));

        Ok(Self {
            table_id: relation(TABLE_ID)?,
            mirror_table_id: relation(MIRROR_TABLE_ID)?,
            mirror_index_id: relation(MIRROR_INDEX_ID)?,
            index_access_method: column(INDEX_ACCESS_METHOD)?.and_then(IndexAccessMethod::from_oid),
            table_block_count: count(TABLE_BLOCK_COUNT)?,
            index_block_count: count(INDEX_BLOCK_COUNT)?,
            heap_relfile_id: relation(HEAP_RELFILE_ID)?,
            index_relfile_id: relation(INDEX_RELFILE_ID)?,
            initialized: column(INITIALIZED)?.unwrap_or(0) != 0,
        })
    }
}

/// Lifecycle state of a table's mirror.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum OblivStatus {
    /// Mirror storage has not been materialized.
    Uninitialized,
    /// Mirror storage exists and is loaded.
    Initialized,
}

/// Checks that `record` names usable mirrors and returns its state.
pub fn validate(record: &StatusRecord) -> Result<OblivStatus, OblivError> {
    if record.mirror_table_id == INVALID_RELATION || record.mirror_index_id == INVALID_RELATION {
        return Err(OblivError::InvalidConfigurationError(format!(
            "table {} has no mirror table or mirror index",
            record.table_id
        )));
    }
    if record.table_block_count <= 0 || record.index_block_count <= 0 {
        return Err(OblivError::InvalidConfigurationError(format!(
            "table {} declares {} table blocks and {} index blocks",
            record.table_id, record.table_block_count, record.index_block_count
        )));
    }
    if record.index_access_method.is_none() {
        return Err(OblivError::InvalidConfigurationError(format!(
            "table {} has no known index access method",
            record.table_id
        )));
    }
    Ok(if record.initialized {
        OblivStatus::Initialized
    } else {
        OblivStatus::Uninitialized
    })
}

/// The catalog relation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct StatusCatalog {
    relation: RelationId,
}

impl StatusCatalog {
    /// Creates an empty catalog relation.
    pub fn create<S: BlockStore>(store: &mut S) -> Result<Self, OblivError> {
        Ok(Self {
            relation: store.create_relation()?,
        })
    }

    /// A catalog stored in `relation`.
    pub fn open(relation: RelationId) -> Self {
        Self { relation }
    }

    /// The relation holding the catalog.
    pub fn relation(&self) -> RelationId {
        self.relation
    }

    fn locate<S: BlockStore>(
        &self,
        store: &S,
        table_id: RelationId,
    ) -> Result<Option<(BlockNumber, OffsetNumber, StatusRecord)>, OblivError> {
        for block in 0..store.nblocks(self.relation)? {
            let page = store.read_block(self.relation, block)?;
            if page.is_new() {
                continue;
            }
            page.check()?;
            for offset in 1..=page.max_offset() {
                let record = StatusRecord::from_bytes(page.item(offset)?)?;
                if record.table_id == table_id {
                    return Ok(Some((block, offset, record)));
                }
            }
        }
        Ok(None)
    }

    /// The row for `table_id`.
    pub fn get_status<S: BlockStore>(
        &self,
        store: &S,
        table_id: RelationId,
    ) -> Result<StatusRecord, OblivError> {
        self.locate(store, table_id)?
            .map(|(_, _, record)| record)
            .ok_or(OblivError::NotFoundError(table_id))
    }

    /// Appends a row. The table must not already have one.
    pub fn insert_record<S: BlockStore>(
        &self,
        store: &mut S,
        record: &StatusRecord,
    ) -> Result<(), OblivError> {
        if record.table_id == INVALID_RELATION {
            return Err(OblivError::InvalidConfigurationError(
                "status row without a table".into(),
            ));
        }
        if self.locate(store, record.table_id)?.is_some() {
            return Err(OblivError::InvalidConfigurationError(format!(
                "table {} already has a status row",
                record.table_id
            )));
        }

        let bytes = record.to_bytes();
        let nblocks = store.nblocks(self.relation)?;
        if let Some(last) = nblocks.checked_sub(1) {
            let mut page = store.read_block(self.relation, last)?;
            if !page.is_new() && page.free_space() >= STATUS_ROW_SIZE {
                page.add_item(&bytes)?;
                return store.write_block(self.relation, last, &page);
            }
        }

        let block = store.allocate_block(self.relation)?;
        let mut page = Page::new(0)?;
        page.add_item(&bytes)?;
        store.write_block(self.relation, block, &page)?;
        log::debug!(
            "StatusCatalog::insert_record -- table {} in new block {}",
            record.table_id,
            block
        );
        Ok(())
    }

    fn update<S: BlockStore, F: FnOnce(&mut StatusRecord)>(
        &self,
        store: &mut S,
        table_id: RelationId,
        mutate: F,
    ) -> Result<StatusRecord, OblivError> {
        let (block, offset, mut record) = self
            .locate(store, table_id)?
            .ok_or(OblivError::NotFoundError(table_id))?;
        mutate(&mut record);

        let mut page = store.read_block(self.relation, block)?;
        page.item_mut(offset)?.copy_from_slice(&record.to_bytes());
        store.write_block(self.relation, block, &page)?;
        Ok(record)
    }

    /// Sets the initialized flag of the row for `table_id`.
    pub fn mark_initialized<S: BlockStore>(
        &self,
        store: &mut S,
        table_id: RelationId,
    ) -> Result<(), OblivError> {
        self.update(store, table_id, |record| record.initialized = true)?;
        log::info!("StatusCatalog::mark_initialized -- table {}", table_id);
        Ok(())
    }

    /// Records the relations created for the table's two mirror files.
    pub fn record_mirror_files<S: BlockStore>(
        &self,
        store: &mut S,
        table_id: RelationId,
        heap_relfile_id: RelationId,
        index_relfile_id: RelationId,
    ) -> Result<(), OblivError> {
        self.update(store, table_id, |record| {
            record.heap_relfile_id = heap_relfile_id;
            record.index_relfile_id = index_relfile_id;
        })?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::{CountAccessesStore, MemoryStore};
    use crate::test_utils::{init_logger, FreshStore};

    fn record(table_id: RelationId) -> StatusRecord {
        StatusRecord::new(table_id, 100, 101, IndexAccessMethod::BTree, 32, 64)
    }

    fn catalog<S: FreshStore>(tables: &[RelationId]) -> (S, StatusCatalog) {
        let mut store = S::fresh();
        let catalog = StatusCatalog::create(&mut store).unwrap();
        for &table in tables {
            catalog.insert_record(&mut store, &record(table)).unwrap();
        }
        (store, catalog)
    }

    #[test]
    fn fresh_row_is_uninitialized() {
        init_logger();
        let (store, catalog) = catalog::<MemoryStore>(&[7, 8]);
        let status = catalog.get_status(&store, 8).unwrap();
        assert_eq!(status, record(8));
        assert_eq!(validate(&status).unwrap(), OblivStatus::Uninitialized);
    }

    #[test]
    fn missing_row() {
        let (store, catalog) = catalog::<MemoryStore>(&[7]);
        assert!(matches!(
            catalog.get_status(&store, 9),
            Err(OblivError::NotFoundError(9))
        ));
    }

    #[test]
    fn mark_initialized_updates_in_place() {
        let (mut store, catalog) = catalog::<CountAccessesStore>(&[1, 2, 3]);
        let blocks = store.nblocks(catalog.relation()).unwrap();

        catalog.mark_initialized(&mut store, 2).unwrap();
        // idempotent for the caller
        catalog.mark_initialized(&mut store, 2).unwrap();

        assert_eq!(store.nblocks(catalog.relation()).unwrap(), blocks);
        let page = store.read_block(catalog.relation(), 0).unwrap();
        assert_eq!(page.max_offset(), 3);
        assert_eq!(
            validate(&catalog.get_status(&store, 2).unwrap()).unwrap(),
            OblivStatus::Initialized
        );
        assert_eq!(
            validate(&catalog.get_status(&store, 3).unwrap()).unwrap(),
            OblivStatus::Uninitialized
        );
        assert!(matches!(
            catalog.mark_initialized(&mut store, 4),
            Err(OblivError::NotFoundError(4))
        ));
    }

    #[test]
    fn record_mirror_files_fills_relfiles() {
        let (mut store, catalog) = catalog::<MemoryStore>(&[5]);
        catalog.record_mirror_files(&mut store, 5, 40, 41).unwrap();
        let status = catalog.get_status(&store, 5).unwrap();
        assert_eq!((status.heap_relfile_id, status.index_relfile_id), (40, 41));
        assert!(!status.initialized);
    }

    #[test]
    fn duplicate_row_is_rejected() {
        let (mut store, catalog) = catalog::<MemoryStore>(&[5]);
        assert!(matches!(
            catalog.insert_record(&mut store, &record(5)),
            Err(OblivError::InvalidConfigurationError(_))
        ));
    }

    #[test]
    fn rows_spill_into_new_blocks() {
        let tables: Vec<RelationId> = (1..=400).collect();
        let (store, catalog) = catalog::<MemoryStore>(&tables);
        assert!(store.nblocks(catalog.relation()).unwrap() > 1);
        assert_eq!(catalog.get_status(&store, 400).unwrap(), record(400));
    }

    #[test]
    fn validation_rejects_unusable_rows() {
        let mut missing_index = record(1);
        missing_index.mirror_index_id = INVALID_RELATION;
        assert!(matches!(
            validate(&missing_index),
            Err(OblivError::InvalidConfigurationError(_))
        ));

        let mut empty = record(1);
        empty.table_block_count = 0;
        assert!(validate(&empty).is_err());

        let mut negative = record(1);
        negative.index_block_count = -3;
        assert!(validate(&negative).is_err());

        let mut no_method = record(1);
        no_method.index_access_method = None;
        assert!(validate(&no_method).is_err());
    }

    #[test]
    fn null_columns_decode_to_sentinels() {
        let mut store = MemoryStore::new();
        let catalog = StatusCatalog::create(&mut store).unwrap();
        let mut row = record(6).to_bytes();
        // mirror_index_id and index_access_method stored as null over non-zero values
        let nulls = get_u16(&row, 0).unwrap() | 1 << MIRROR_INDEX_ID | 1 << INDEX_ACCESS_METHOD;
        put_u16(&mut row, 0, nulls);

        let block = store.allocate_block(catalog.relation()).unwrap();
        let mut page = Page::new(0).unwrap();
        page.add_item(&row).unwrap();
        store.write_block(catalog.relation(), block, &page).unwrap();

        let status = catalog.get_status(&store, 6).unwrap();
        assert_eq!(status.mirror_index_id, INVALID_RELATION);
        assert_eq!(status.index_access_method, None);
        assert_eq!(status.mirror_table_id, 100);
        assert!(matches!(
            validate(&status),
            Err(OblivError::InvalidConfigurationError(_))
        ));
    }

    #[test]
    fn initialized_flag_does_not_hide_missing_index() {
        let mut flagged = record(3);
        flagged.initialized = true;
        flagged.mirror_index_id = INVALID_RELATION;
        assert!(matches!(
            validate(&flagged),
            Err(OblivError::InvalidConfigurationError(_))
        ));

        let mut store = MemoryStore::new();
        let catalog = StatusCatalog::create(&mut store).unwrap();
        let mut stored = record(7);
        stored.initialized = true;
        let mut row = stored.to_bytes();
        let nulls = get_u16(&row, 0).unwrap() | 1 << MIRROR_INDEX_ID;
        put_u16(&mut row, 0, nulls);

        let block = store.allocate_block(catalog.relation()).unwrap();
        let mut page = Page::new(0).unwrap();
        page.add_item(&row).unwrap();
        store.write_block(catalog.relation(), block, &page).unwrap();

        let status = catalog.get_status(&store, 7).unwrap();
        assert!(status.initialized);
        assert_eq!(status.mirror_index_id, INVALID_RELATION);
        assert!(matches!(
            validate(&status),
            Err(OblivError::InvalidConfigurationError(_))
        ));
    }

    #[test]
    fn access_methods() {
        assert_eq!(IndexAccessMethod::BTree.preexisting_pages(), 1);
        assert_eq!(IndexAccessMethod::Hash.preexisting_pages(), 4);
        for method in [IndexAccessMethod::BTree, IndexAccessMethod::Hash] {
            assert_eq!(IndexAccessMethod::from_oid(method.oid()), Some(method));
        }
        assert_eq!(IndexAccessMethod::from_oid(0), None);
    }
}
