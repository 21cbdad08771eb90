// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Block storage abstractions for the relations the mirrors are built from and written to.

use crate::{page::Page, BlockNumber, OblivError, RelationId, BLOCK_SIZE, INVALID_RELATION};
use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The backing store the mirror layer reads from and writes to.
///
/// Reads take `&self` and writes take `&mut self`, so a caller holds shared access for the
/// duration of one block read and exclusive access for one block write, never longer.
pub trait BlockStore {
    /// The size in bytes of every block in the store.
    fn block_size(&self) -> usize;
    /// Creates a new, empty relation and returns its identity.
    fn create_relation(&mut self) -> Result<RelationId, OblivError>;
    /// Returns the number of blocks physically present in `relation`.
    fn nblocks(&self, relation: RelationId) -> Result<BlockNumber, OblivError>;
    /// Reads block `block` of `relation`.
    fn read_block(&self, relation: RelationId, block: BlockNumber) -> Result<Page, OblivError>;
    /// Overwrites block `block` of `relation`, which must already exist.
    fn write_block(
        &mut self,
        relation: RelationId,
        block: BlockNumber,
        page: &Page,
    ) -> Result<(), OblivError>;
    /// Extends `relation` by one zero-filled block and returns its number.
    fn allocate_block(&mut self, relation: RelationId) -> Result<BlockNumber, OblivError>;
}

/// A simple store that keeps every relation in memory.
#[derive(Debug)]
pub struct MemoryStore {
    block_size: usize,
    relations: BTreeMap<RelationId, Vec<Box<[u8]>>>,
    next_relation: RelationId,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    /// Returns an empty store using [`BLOCK_SIZE`] blocks.
    pub fn new() -> Self {
        Self::with_block_size(BLOCK_SIZE)
    }

    /// Returns an empty store whose blocks are `block_size` bytes long.
    pub fn with_block_size(block_size: usize) -> Self {
        Self {
            block_size,
            relations: BTreeMap::new(),
            next_relation: INVALID_RELATION + 1,
        }
    }

    fn relation(&self, relation: RelationId) -> Result<&Vec<Box<[u8]>>, OblivError> {
        self.relations
            .get(&relation)
            .ok_or(OblivError::NotFoundError(relation))
    }

    fn relation_mut(&mut self, relation: RelationId) -> Result<&mut Vec<Box<[u8]>>, OblivError> {
        self.relations
            .get_mut(&relation)
            .ok_or(OblivError::NotFoundError(relation))
    }
}

impl BlockStore for MemoryStore {
    fn block_size(&self) -> usize {
        self.block_size
    }

    fn create_relation(&mut self) -> Result<RelationId, OblivError> {
        let relation = self.next_relation;
        self.next_relation += 1;
        self.relations.insert(relation, Vec::new());
        Ok(relation)
    }

    fn nblocks(&self, relation: RelationId) -> Result<BlockNumber, OblivError> {
        Ok(self.relation(relation)?.len().try_into()?)
    }

    fn read_block(&self, relation: RelationId, block: BlockNumber) -> Result<Page, OblivError> {
        let blocks = self.relation(relation)?;
        let bytes = blocks
            .get(usize::try_from(block)?)
            .ok_or(OblivError::BlockOutOfBoundsError { relation, block })?;
        Page::from_bytes(bytes)
    }

    fn write_block(
        &mut self,
        relation: RelationId,
        block: BlockNumber,
        page: &Page,
    ) -> Result<(), OblivError> {
        let block_size = self.block_size;
        if page.as_bytes().len() != block_size {
            return Err(OblivError::SizeMismatchError {
                expected: block_size,
                actual: page.as_bytes().len(),
            });
        }
        let blocks = self.relation_mut(relation)?;
        let slot = blocks
            .get_mut(usize::try_from(block)?)
            .ok_or(OblivError::BlockOutOfBoundsError { relation, block })?;
        slot.copy_from_slice(page.as_bytes());
        Ok(())
    }

    fn allocate_block(&mut self, relation: RelationId) -> Result<BlockNumber, OblivError> {
        let block_size = self.block_size;
        let blocks = self.relation_mut(relation)?;
        let block = blocks.len().try_into()?;
        blocks.push(vec![0u8; block_size].into_boxed_slice());
        Ok(block)
    }
}

/// One physical block transfer observed by a [`CountAccessesStore`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    /// A block was read.
    Read(RelationId, BlockNumber),
    /// A block was written.
    Write(RelationId, BlockNumber),
}

/// A `MemoryStore` that records every block transfer, in order.
#[derive(Debug, Default)]
pub struct CountAccessesStore {
    data: MemoryStore,
    trace: std::cell::RefCell<Vec<Access>>,
}

impl CountAccessesStore {
    /// Returns an empty store using [`BLOCK_SIZE`] blocks.
    pub fn new() -> Self {
        Self::default()
    }

    /// Every read and write so far, in the order the store served them.
    pub fn trace(&self) -> Vec<Access> {
        self.trace.borrow().clone()
    }

    /// Returns the total number of block reads.
    pub fn get_read_count(&self) -> usize {
        self.trace
            .borrow()
            .iter()
            .filter(|a| matches!(a, Access::Read(..)))
            .count()
    }

    /// Returns the total number of block writes.
    pub fn get_write_count(&self) -> usize {
        self.trace
            .borrow()
            .iter()
            .filter(|a| matches!(a, Access::Write(..)))
            .count()
    }

    /// Forgets all recorded transfers.
    pub fn reset_counts(&mut self) {
        self.trace.get_mut().clear();
    }
}

impl BlockStore for CountAccessesStore {
    fn block_size(&self) -> usize {
        self.data.block_size()
    }

    fn create_relation(&mut self) -> Result<RelationId, OblivError> {
        self.data.create_relation()
    }

    fn nblocks(&self, relation: RelationId) -> Result<BlockNumber, OblivError> {
        self.data.nblocks(relation)
    }

    fn read_block(&self, relation: RelationId, block: BlockNumber) -> Result<Page, OblivError> {
        log::debug!("Physical read -- {}:{}", relation, block);
        self.trace.borrow_mut().push(Access::Read(relation, block));
        self.data.read_block(relation, block)
    }

    fn write_block(
        &mut self,
        relation: RelationId,
        block: BlockNumber,
        page: &Page,
    ) -> Result<(), OblivError> {
        log::debug!("Physical write -- {}:{}", relation, block);
        self.trace.get_mut().push(Access::Write(relation, block));
        self.data.write_block(relation, block, page)
    }

    fn allocate_block(&mut self, relation: RelationId) -> Result<BlockNumber, OblivError> {
        self.data.allocate_block(relation)
    }
}

/// A store that keeps each relation in its own file of [`BLOCK_SIZE`] blocks under a directory.
///
/// Files are opened for the duration of a single block transfer.
#[derive(Debug)]
pub struct FileStore {
    directory: PathBuf,
    next_relation: RelationId,
}

impl FileStore {
    /// Opens (creating if needed) a store rooted at `directory`.
    /// Existing relation files are picked up so new relations never reuse their identities.
    pub fn open(directory: impl AsRef<Path>) -> Result<Self, OblivError> {
        let directory = directory.as_ref().to_path_buf();
        fs::create_dir_all(&directory)?;

        let mut highest = INVALID_RELATION;
        for entry in fs::read_dir(&directory)? {
            let entry = entry?;
            if let Some(relation) = entry
                .file_name()
                .to_str()
                .and_then(|name| name.parse::<RelationId>().ok())
            {
                highest = highest.max(relation);
            }
        }

        log::info!(
            "FileStore::open({}) -- next relation {}",
            directory.display(),
            highest + 1
        );
        Ok(Self {
            directory,
            next_relation: highest + 1,
        })
    }

    fn path(&self, relation: RelationId) -> PathBuf {
        self.directory.join(relation.to_string())
    }

    fn open_file(&self, relation: RelationId, write: bool) -> Result<File, OblivError> {
        OpenOptions::new()
            .read(true)
            .write(write)
            .open(self.path(relation))
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => OblivError::NotFoundError(relation),
                _ => OblivError::IoError(e),
            })
    }

    fn byte_offset(block: BlockNumber) -> u64 {
        u64::from(block) * BLOCK_SIZE as u64
    }
}

impl BlockStore for FileStore {
    fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    fn create_relation(&mut self) -> Result<RelationId, OblivError> {
        let relation = self.next_relation;
        OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(self.path(relation))?;
        self.next_relation += 1;
        Ok(relation)
    }

    fn nblocks(&self, relation: RelationId) -> Result<BlockNumber, OblivError> {
        let len = self.open_file(relation, false)?.metadata()?.len();
        Ok((len / BLOCK_SIZE as u64).try_into()?)
    }

    fn read_block(&self, relation: RelationId, block: BlockNumber) -> Result<Page, OblivError> {
        if block >= self.nblocks(relation)? {
            return Err(OblivError::BlockOutOfBoundsError { relation, block });
        }
        let mut file = self.open_file(relation, false)?;
        file.seek(SeekFrom::Start(Self::byte_offset(block)))?;
        let mut bytes = vec![0u8; BLOCK_SIZE];
        file.read_exact(&mut bytes)?;
        Page::from_bytes(&bytes)
    }

    fn write_block(
        &mut self,
        relation: RelationId,
        block: BlockNumber,
        page: &Page,
    ) -> Result<(), OblivError> {
        if block >= self.nblocks(relation)? {
            return Err(OblivError::BlockOutOfBoundsError { relation, block });
        }
        let mut file = self.open_file(relation, true)?;
        file.seek(SeekFrom::Start(Self::byte_offset(block)))?;
        file.write_all(page.as_bytes())?;
        Ok(())
    }

    fn allocate_block(&mut self, relation: RelationId) -> Result<BlockNumber, OblivError> {
        let file = self.open_file(relation, true)?;
        let block = self.nblocks(relation)?;
        file.set_len(Self::byte_offset(block + 1))?;
        Ok(block)
    }
}
