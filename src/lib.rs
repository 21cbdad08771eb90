// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! Oblivious storage mirrors for a heap table and one B+-tree index.
//!
//! A conventional heap relation and its B+-tree index are copied into a fixed-size,
//! pre-allocated block space that a trusted secure module drives through a narrow
//! block-level contract. The crate provides:
//!
//! - [`status`]: the catalog that records whether a table's mirror has been materialized.
//! - [`loader`]: a breadth-first tree flattener that measures a B+-tree or relocates it into
//!   a level-ordered canonical layout.
//! - [`bridge`]: the init / read / write / close contract used by the secure module.
//! - [`access`]: a minimal insert and scan path that exercises the bridge end to end.
//! - [`mirror`]: the initialization flow tying the pieces together.

#![warn(clippy::cargo, clippy::doc_markdown, missing_docs, rustdoc::all)]

use std::num::TryFromIntError;
use thiserror::Error;

pub mod access;
pub mod bridge;
pub mod btree;
pub mod loader;
pub mod mirror;
pub mod page;
pub mod status;
pub mod store;

#[cfg(test)]
mod test_utils;

/// Numeric type used to address blocks within a relation.
pub type BlockNumber = u32;

/// Numeric type used to identify a relation in the backing store.
pub type RelationId = u32;

/// 1-based position of a slot in a page's slot directory.
pub type OffsetNumber = u16;

/// The size in bytes of every block handled by the crate.
pub const BLOCK_SIZE: usize = 8192;

/// The relation identity that never names a relation.
pub const INVALID_RELATION: RelationId = 0;

/// Logical identity of a block that does not hold a real record yet.
pub const DUMMY_BLOCK: BlockNumber = BlockNumber::MAX;

/// The offset number used where no slot is meant.
pub const INVALID_OFFSET: OffsetNumber = 0;

pub use access::{RecordAccess, ScanState};
pub use bridge::{LoadSink, MirrorSession, ObliviousBridge};
pub use loader::{FanoutProfile, IndexLayout, TreeFlattener};
pub use mirror::{initialize_table, MirrorConfig};
pub use page::Page;
pub use status::{IndexAccessMethod, OblivStatus, StatusCatalog, StatusRecord};
pub use store::{BlockStore, CountAccessesStore, FileStore, MemoryStore};

#[derive(Error, Debug)]
/// Errors produced by the mirror layer. None of them are recovered from locally.
pub enum OblivError {
    /// The status catalog has no row for the requested table.
    #[error("no status record for table {0}")]
    NotFoundError(RelationId),

    /// A status record or a parameter failed validation.
    #[error("invalid configuration: {0}")]
    InvalidConfigurationError(String),

    /// A bridge request named a file that is not registered in the session.
    #[error("request names unknown file {0:?}")]
    UnknownTargetError(String),

    /// A block size or buffer length disagrees with the fixed block size.
    #[error("block size mismatch: expected {expected} bytes, found {actual}")]
    SizeMismatchError {
        /// The size the bridge or store expects.
        expected: usize,
        /// The size it was handed.
        actual: usize,
    },

    /// A page image supplied through the bridge failed its structural check.
    #[error("supplied page for block {0} is malformed")]
    CorruptInputError(BlockNumber),

    /// A page read or mutated by the crate is not well formed.
    #[error("corrupted page: {0}")]
    CorruptPageError(String),

    /// A traversal queue or page buffer could not be allocated.
    #[error("allocation failure")]
    AllocationFailureError,

    /// A block number lies past the physical end of the relation.
    #[error("block {block} is out of bounds for relation {relation}")]
    BlockOutOfBoundsError {
        /// The relation that was accessed.
        relation: RelationId,
        /// The requested block.
        block: BlockNumber,
    },

    /// An I/O error from a file-backed store.
    #[error("i/o error: {0}")]
    IoError(#[from] std::io::Error),

    /// An arithmetic conversion between integer types failed.
    #[error("arithmetic error encountered")]
    IntegerConversionError(#[from] TryFromIntError),
}
