// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! The block-level contract through which the secure module drives the two mirror files.
//!
//! A session knows exactly two logical file names, one for the table mirror and one for the
//! index mirror. Every request names one of them; anything else is rejected with
//! `UnknownTargetError`. Requests are served in the order given, one block at a time.

use crate::{
    loader::IndexLayout, page::Page, store::BlockStore, BlockNumber, OblivError, RelationId,
    BLOCK_SIZE,
};

/// Receives pages from the loaders. The store is lent for each call so the loader can keep
/// reading its source between calls.
pub trait LoadSink<S: BlockStore> {
    /// Stores a relocated index page at canonical position `(level, level_offset)`.
    fn add_index_block(
        &mut self,
        store: &mut S,
        page: &Page,
        level_offset: BlockNumber,
        level: u32,
    ) -> Result<(), OblivError>;

    /// Stores heap page `block`.
    fn add_heap_block(
        &mut self,
        store: &mut S,
        page: &Page,
        block: BlockNumber,
    ) -> Result<(), OblivError>;
}

/// The two mirror relations a secure module works against, and the names it uses for them.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MirrorSession {
    table_file: String,
    index_file: String,
    table_relation: RelationId,
    index_relation: RelationId,
    index_layout: Option<IndexLayout>,
}

impl MirrorSession {
    /// A session mapping `table_file` to `table_relation` and `index_file` to `index_relation`.
    pub fn new(
        table_file: impl Into<String>,
        index_file: impl Into<String>,
        table_relation: RelationId,
        index_relation: RelationId,
    ) -> Result<Self, OblivError> {
        let (table_file, index_file) = (table_file.into(), index_file.into());
        if table_file == index_file {
            return Err(OblivError::InvalidConfigurationError(format!(
                "table and index mirrors share the name {table_file:?}"
            )));
        }
        Ok(Self {
            table_file,
            index_file,
            table_relation,
            index_relation,
            index_layout: None,
        })
    }

    /// Attaches the canonical layout used to place relocated index pages.
    pub fn with_layout(mut self, layout: IndexLayout) -> Self {
        self.index_layout = Some(layout);
        self
    }

    /// Logical name of the table mirror.
    pub fn table_file(&self) -> &str {
        &self.table_file
    }

    /// Logical name of the index mirror.
    pub fn index_file(&self) -> &str {
        &self.index_file
    }

    /// Relation backing the table mirror.
    pub fn table_relation(&self) -> RelationId {
        self.table_relation
    }

    /// Relation backing the index mirror.
    pub fn index_relation(&self) -> RelationId {
        self.index_relation
    }

    /// The canonical layout of the index mirror, once known.
    pub fn index_layout(&self) -> Option<&IndexLayout> {
        self.index_layout.as_ref()
    }
}

/// Serves init / read / write / close requests for the files of one [`MirrorSession`].
#[derive(Debug)]
pub struct ObliviousBridge {
    session: MirrorSession,
    table_open: bool,
    index_open: bool,
}

impl ObliviousBridge {
    /// A bridge with both files of `session` open.
    pub fn new(session: MirrorSession) -> Self {
        Self {
            session,
            table_open: true,
            index_open: true,
        }
    }

    /// The session this bridge serves.
    pub fn session(&self) -> &MirrorSession {
        &self.session
    }

    /// Consumes the bridge, returning its session.
    pub fn into_session(self) -> MirrorSession {
        self.session
    }

    fn relation_of(&self, name: &str) -> Result<RelationId, OblivError> {
        if name == self.session.table_file && self.table_open {
            Ok(self.session.table_relation)
        } else if name == self.session.index_file && self.index_open {
            Ok(self.session.index_relation)
        } else {
            Err(OblivError::UnknownTargetError(name.to_string()))
        }
    }

    fn check_store<S: BlockStore>(store: &S) -> Result<(), OblivError> {
        if store.block_size() != BLOCK_SIZE {
            return Err(OblivError::SizeMismatchError {
                expected: BLOCK_SIZE,
                actual: store.block_size(),
            });
        }
        Ok(())
    }

    fn check_buffer(blocks: usize, buffer: usize) -> Result<(), OblivError> {
        // A block count whose byte length overflows never matches a real buffer.
        let expected = blocks
            .checked_mul(BLOCK_SIZE)
            .ok_or(OblivError::SizeMismatchError {
                expected: usize::MAX,
                actual: buffer,
            })?;
        if buffer != expected {
            return Err(OblivError::SizeMismatchError {
                expected,
                actual: buffer,
            });
        }
        Ok(())
    }

    /// Writes `nblocks` page images from `pages` into blocks `start_offset..` of file `name`,
    /// overwriting blocks that exist and extending the file past its end. Reopens a closed file.
    ///
    /// Every image must be either all-zero or a well-formed page; nothing is written otherwise.
    pub fn init_file<S: BlockStore>(
        &mut self,
        store: &mut S,
        name: &str,
        pages: &[u8],
        nblocks: BlockNumber,
        block_size: usize,
        start_offset: BlockNumber,
    ) -> Result<(), OblivError> {
        if block_size != BLOCK_SIZE {
            return Err(OblivError::SizeMismatchError {
                expected: BLOCK_SIZE,
                actual: block_size,
            });
        }
        Self::check_store(store)?;
        Self::check_buffer(usize::try_from(nblocks)?, pages.len())?;

        let relation = if name == self.session.table_file {
            self.table_open = true;
            self.session.table_relation
        } else if name == self.session.index_file {
            self.index_open = true;
            self.session.index_relation
        } else {
            return Err(OblivError::UnknownTargetError(name.to_string()));
        };

        let end = start_offset
            .checked_add(nblocks)
            .ok_or_else(|| OblivError::InvalidConfigurationError(format!(
                "{nblocks} blocks from {start_offset} overflow the block number space"
            )))?;

        let mut images = Vec::new();
        images
            .try_reserve(pages.len() / BLOCK_SIZE)
            .map_err(|_| OblivError::AllocationFailureError)?;
        for (block, bytes) in (start_offset..end).zip(pages.chunks_exact(BLOCK_SIZE)) {
            let page = Page::from_bytes(bytes)?;
            if !page.is_new() && page.check().is_err() {
                return Err(OblivError::CorruptInputError(block));
            }
            images.push(page);
        }

        let existing = store.nblocks(relation)?;
        for (block, page) in (start_offset..end).zip(&images) {
            if block >= existing {
                // Blocks skipped between the old end and `block` stay zero-filled.
                while store.allocate_block(relation)? < block {}
            }
            store.write_block(relation, block, page)?;
        }

        log::info!(
            "ObliviousBridge::init_file({}) -- blocks {}..{} of relation {} ({} pre-existing)",
            name,
            start_offset,
            end,
            relation,
            existing
        );
        Ok(())
    }

    /// Copies the blocks named by `blocks` of file `name` into `out`, in order.
    pub fn read_blocks<S: BlockStore>(
        &self,
        store: &S,
        name: &str,
        blocks: &[BlockNumber],
        out: &mut [u8],
    ) -> Result<(), OblivError> {
        Self::check_store(store)?;
        Self::check_buffer(blocks.len(), out.len())?;
        let relation = self.relation_of(name)?;
        for (&block, chunk) in blocks.iter().zip(out.chunks_exact_mut(BLOCK_SIZE)) {
            chunk.copy_from_slice(store.read_block(relation, block)?.as_bytes());
        }
        Ok(())
    }

    /// Overwrites the blocks named by `blocks` of file `name` with the images in `pages`, in
    /// order. The images are opaque to the bridge and are not inspected.
    pub fn write_blocks<S: BlockStore>(
        &self,
        store: &mut S,
        name: &str,
        blocks: &[BlockNumber],
        pages: &[u8],
    ) -> Result<(), OblivError> {
        Self::check_store(store)?;
        Self::check_buffer(blocks.len(), pages.len())?;
        let relation = self.relation_of(name)?;
        for (&block, chunk) in blocks.iter().zip(pages.chunks_exact(BLOCK_SIZE)) {
            store.write_block(relation, block, &Page::from_bytes(chunk)?)?;
        }
        Ok(())
    }

    /// Releases file `name`. Closing a closed file does nothing.
    pub fn close_file(&mut self, name: &str) -> Result<(), OblivError> {
        if name == self.session.table_file {
            self.table_open = false;
        } else if name == self.session.index_file {
            self.index_open = false;
        } else {
            return Err(OblivError::UnknownTargetError(name.to_string()));
        }
        log::debug!("ObliviousBridge::close_file({})", name);
        Ok(())
    }

    /// Releases both files of the session. Closing twice does nothing.
    pub fn close(&mut self) {
        self.table_open = false;
        self.index_open = false;
        log::debug!(
            "ObliviousBridge::close -- {} and {}",
            self.session.table_file,
            self.session.index_file
        );
    }
}

impl<S: BlockStore> LoadSink<S> for ObliviousBridge {
    fn add_index_block(
        &mut self,
        store: &mut S,
        page: &Page,
        level_offset: BlockNumber,
        level: u32,
    ) -> Result<(), OblivError> {
        let layout = self.session.index_layout.as_ref().ok_or_else(|| {
            OblivError::InvalidConfigurationError("session has no index layout".into())
        })?;
        let block = layout.canonical_block(level, level_offset)?;
        let relation = self.relation_of(&self.session.index_file)?;
        store.write_block(relation, block, page)
    }

    fn add_heap_block(
        &mut self,
        store: &mut S,
        page: &Page,
        block: BlockNumber,
    ) -> Result<(), OblivError> {
        let relation = self.relation_of(&self.session.table_file)?;
        store.write_block(relation, block, page)
    }
}
