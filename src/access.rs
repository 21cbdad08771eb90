// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A single-tuple insert and scan path over one mirror file.
//!
//! Both operations touch exactly one block, the active block, through the bridge. A block that
//! has never held a record reads back as a dummy page.

use crate::{
    bridge::ObliviousBridge, btree::ItemPointer, page::Page, store::BlockStore, BlockNumber,
    OblivError, OffsetNumber, BLOCK_SIZE,
};

/// The record most recently produced by [`RecordAccess::next`].
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanState {
    /// The record body.
    pub record: Vec<u8>,
    /// Where the record lives, once one has been produced.
    pub tid: Option<ItemPointer>,
}

/// Inserts into and scans the active block of one mirror file.
#[derive(Clone, Debug)]
pub struct RecordAccess {
    file: String,
    active_block: BlockNumber,
}

impl RecordAccess {
    /// Access to block `active_block` of the mirror file `file`.
    pub fn new(file: impl Into<String>, active_block: BlockNumber) -> Self {
        Self {
            file: file.into(),
            active_block,
        }
    }

    /// The block every operation touches.
    pub fn active_block(&self) -> BlockNumber {
        self.active_block
    }

    fn fetch<S: BlockStore>(&self, bridge: &ObliviousBridge, store: &S) -> Result<Page, OblivError> {
        let mut bytes = vec![0u8; BLOCK_SIZE];
        bridge.read_blocks(store, &self.file, &[self.active_block], &mut bytes)?;
        Page::from_bytes(&bytes)
    }

    /// Appends `item` to the active block and returns its slot. A dummy block is first replaced
    /// by an empty page carrying the active block's number.
    pub fn insert<S: BlockStore>(
        &self,
        bridge: &ObliviousBridge,
        store: &mut S,
        item: &[u8],
    ) -> Result<OffsetNumber, OblivError> {
        let mut page = self.fetch(bridge, store)?;
        if page.is_dummy() {
            page = Page::new_obliv(self.active_block)?;
        }
        let offset = page.add_item(item)?;
        bridge.write_blocks(store, &self.file, &[self.active_block], page.as_bytes())?;
        log::debug!(
            "RecordAccess::insert -- {}:{} slot {} ({} bytes)",
            self.file,
            self.active_block,
            offset,
            item.len()
        );
        Ok(offset)
    }

    /// Exposes the highest-offset record of the active block in `state`. Returns `false` when
    /// the block is a dummy or holds no record.
    pub fn next<S: BlockStore>(
        &self,
        bridge: &ObliviousBridge,
        store: &S,
        state: &mut ScanState,
    ) -> Result<bool, OblivError> {
        let page = self.fetch(bridge, store)?;
        if page.is_dummy() {
            return Ok(false);
        }
        page.check()?;
        let offset = page.max_offset();
        if offset == 0 {
            return Ok(false);
        }
        state.record.clear();
        state.record.extend_from_slice(page.item(offset)?);
        state.tid = Some(ItemPointer {
            block: self.active_block,
            offset,
        });
        Ok(true)
    }
}
