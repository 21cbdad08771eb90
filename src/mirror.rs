// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Materializes the oblivious mirrors of a table the first time it is opened.

use crate::{
    bridge::{MirrorSession, ObliviousBridge},
    loader::{load_heap, IndexLayout, TreeFlattener},
    page::Page,
    status::{validate, OblivStatus, StatusCatalog},
    store::BlockStore,
    BlockNumber, OblivError, RelationId, BLOCK_SIZE, INVALID_RELATION,
};

/// The prefix given to mirror file names by default.
pub const DEFAULT_FILE_PREFIX: &str = "obliv_";

/// Names of the two mirror files of a table.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorConfig {
    /// Logical name of the table mirror.
    pub table_file: String,
    /// Logical name of the index mirror.
    pub index_file: String,
}

impl MirrorConfig {
    /// Names the mirrors of `table_name` and `index_name` with [`DEFAULT_FILE_PREFIX`].
    pub fn new(table_name: &str, index_name: &str) -> Result<Self, OblivError> {
        Self::new_with_prefix(DEFAULT_FILE_PREFIX, table_name, index_name)
    }

    /// Names the mirrors of `table_name` and `index_name` with `prefix`.
    ///
    /// # Errors
    ///
    /// Returns an `InvalidConfigurationError` if either name is empty or both are equal.
    pub fn new_with_prefix(
        prefix: &str,
        table_name: &str,
        index_name: &str,
    ) -> Result<Self, OblivError> {
        if table_name.is_empty() || index_name.is_empty() || table_name == index_name {
            return Err(OblivError::InvalidConfigurationError(format!(
                "mirror names {table_name:?} and {index_name:?} must be distinct and non-empty"
            )));
        }
        Ok(Self {
            table_file: format!("{prefix}{table_name}"),
            index_file: format!("{prefix}{index_name}"),
        })
    }
}

fn dummy_images(count: BlockNumber) -> Result<Vec<u8>, OblivError> {
    let dummy = Page::dummy()?;
    let len = usize::try_from(count)?
        .checked_mul(BLOCK_SIZE)
        .ok_or(OblivError::AllocationFailureError)?;
    let mut images = Vec::new();
    images
        .try_reserve_exact(len)
        .map_err(|_| OblivError::AllocationFailureError)?;
    for _ in 0..count {
        images.extend_from_slice(dummy.as_bytes());
    }
    Ok(images)
}

/// Opens the oblivious mirrors of `table_id`, creating and loading them if the catalog says
/// they do not exist yet.
///
/// On first use the mirror index is measured, both files are created at their declared
/// capacities and filled with dummy pages, the heap and the relocated index are copied in,
/// and the catalog row is updated. Later calls only open a session over the recorded files;
/// that session carries no index layout.
pub fn initialize_table<S: BlockStore>(
    store: &mut S,
    catalog: &StatusCatalog,
    table_id: RelationId,
    config: &MirrorConfig,
) -> Result<MirrorSession, OblivError> {
    let record = catalog.get_status(store, table_id)?;

    if validate(&record)? == OblivStatus::Initialized {
        if record.heap_relfile_id == INVALID_RELATION || record.index_relfile_id == INVALID_RELATION
        {
            return Err(OblivError::InvalidConfigurationError(format!(
                "table {table_id} is initialized but its mirror files are not recorded"
            )));
        }
        log::debug!("initialize_table -- table {} already initialized", table_id);
        return MirrorSession::new(
            config.table_file.as_str(),
            config.index_file.as_str(),
            record.heap_relfile_id,
            record.index_relfile_id,
        );
    }

    let table_blocks = BlockNumber::try_from(record.table_block_count)?;
    let index_blocks = BlockNumber::try_from(record.index_block_count)?;
    let access_method = record.index_access_method.ok_or_else(|| {
        OblivError::InvalidConfigurationError(format!("table {table_id} has no access method"))
    })?;

    let profile = TreeFlattener::new(record.mirror_index_id).measure(store)?;
    if profile.total_pages() > u64::from(index_blocks) {
        return Err(OblivError::InvalidConfigurationError(format!(
            "index {} needs {} blocks but table {} declares {}",
            record.mirror_index_id,
            profile.total_pages(),
            table_id,
            index_blocks
        )));
    }
    let heap_blocks = store.nblocks(record.mirror_table_id)?;
    if heap_blocks > table_blocks {
        return Err(OblivError::InvalidConfigurationError(format!(
            "heap {} has {} blocks but table {} declares {}",
            record.mirror_table_id, heap_blocks, table_id, table_blocks
        )));
    }

    let heap_relation = store.create_relation()?;
    let index_relation = store.create_relation()?;
    // The access method's build leaves its leading pages behind; init_file overwrites them.
    for _ in 0..access_method.preexisting_pages() {
        let block = store.allocate_block(index_relation)?;
        store.write_block(index_relation, block, &Page::new(0)?)?;
    }

    let session = MirrorSession::new(
        config.table_file.as_str(),
        config.index_file.as_str(),
        heap_relation,
        index_relation,
    )?
    .with_layout(IndexLayout::from_profile(&profile)?);
    let mut bridge = ObliviousBridge::new(session);

    bridge.init_file(
        store,
        &config.table_file,
        &dummy_images(table_blocks)?,
        table_blocks,
        BLOCK_SIZE,
        0,
    )?;
    bridge.init_file(
        store,
        &config.index_file,
        &dummy_images(index_blocks)?,
        index_blocks,
        BLOCK_SIZE,
        0,
    )?;

    load_heap(record.mirror_table_id, store, &mut bridge)?;
    TreeFlattener::new(record.mirror_index_id).load(store, &mut bridge)?;

    catalog.record_mirror_files(store, table_id, heap_relation, index_relation)?;
    catalog.mark_initialized(store, table_id)?;

    log::info!(
        "initialize_table -- table {}: {} heap blocks into {}, {} index pages into {}",
        table_id,
        heap_blocks,
        config.table_file,
        profile.total_pages(),
        config.index_file
    );
    Ok(bridge.into_session())
}
