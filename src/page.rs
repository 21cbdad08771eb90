// Copyright (c) Meta Platforms, Inc. and affiliates.
//
// This source code is dual-licensed under either the MIT license found in the
// LICENSE-MIT file in the root directory of this source tree or the Apache
// License, Version 2.0 found in the LICENSE-APACHE file in the root directory
// of this source tree. You may select, at your option, one of the above-listed licenses.

//! A typed codec for fixed-size slotted pages.
//!
//! ```text
//! +-----------------+ 0
//! | header          |
//! +-----------------+ HEADER_SIZE
//! | slot directory  |  grows forward, 4 bytes per slot
//! +-----------------+ lower
//! | free space      |
//! +-----------------+ upper
//! | item bodies     |  grow backward, 8-byte aligned
//! +-----------------+ special
//! | special space   |  opaque trailer
//! +-----------------+ BLOCK_SIZE
//! ```
//!
//! Every mutation re-validates `HEADER_SIZE <= lower <= upper <= special <= BLOCK_SIZE`.

use crate::{BlockNumber, OblivError, OffsetNumber, BLOCK_SIZE, DUMMY_BLOCK};
use static_assertions::const_assert;
use subtle::{Choice, ConstantTimeEq};

/// Size of the page header in bytes.
pub const HEADER_SIZE: usize = 16;
/// Size of one slot descriptor in bytes.
pub const ITEM_ID_SIZE: usize = 4;
/// Alignment of item bodies.
pub const MAX_ALIGN: usize = 8;
/// Size of the special space of an oblivious heap page.
pub const OBLIV_SPECIAL_SIZE: usize = 4;

const_assert!(BLOCK_SIZE <= u16::MAX as usize);
const_assert!(HEADER_SIZE % MAX_ALIGN == 0);

const LOWER: usize = 0;
const UPPER: usize = 2;
const SPECIAL: usize = 4;
const FLAGS: usize = 6;
const TAG: usize = 8;

/// The decoded page header.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct PageHeader {
    /// End of the slot directory.
    pub lower: u16,
    /// Start of the item area.
    pub upper: u16,
    /// Start of the special space.
    pub special: u16,
    /// Reserved page flags.
    pub flags: u16,
    /// Free header word. The heap load stamps it with the page's own block number.
    pub tag: u32,
}

/// A slot descriptor: where an item body lives inside the page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ItemId {
    /// Byte offset of the item body.
    pub offset: u16,
    /// Length of the item body in bytes.
    pub len: u16,
}

/// An owned block image of exactly [`BLOCK_SIZE`] bytes.
#[derive(Clone, PartialEq, Eq)]
pub struct Page(Box<[u8]>);

impl std::fmt::Debug for Page {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_new() {
            write!(f, "Page::New")
        } else {
            f.debug_struct("Page")
                .field("header", &self.header())
                .field("max_offset", &self.max_offset())
                .finish()
        }
    }
}

fn read_u16(bytes: &[u8], at: usize) -> u16 {
    u16::from_le_bytes([bytes[at], bytes[at + 1]])
}

fn read_u32(bytes: &[u8], at: usize) -> u32 {
    u32::from_le_bytes([bytes[at], bytes[at + 1], bytes[at + 2], bytes[at + 3]])
}

pub(crate) fn get_u16(bytes: &[u8], at: usize) -> Result<u16, OblivError> {
    match bytes.get(at..at + 2) {
        Some(b) => Ok(read_u16(b, 0)),
        None => Err(OblivError::CorruptPageError(format!(
            "field at byte {at} lies outside its region"
        ))),
    }
}

pub(crate) fn get_u32(bytes: &[u8], at: usize) -> Result<u32, OblivError> {
    match bytes.get(at..at + 4) {
        Some(b) => Ok(read_u32(b, 0)),
        None => Err(OblivError::CorruptPageError(format!(
            "field at byte {at} lies outside its region"
        ))),
    }
}

pub(crate) fn put_u16(bytes: &mut [u8], at: usize, value: u16) {
    bytes[at..at + 2].copy_from_slice(&value.to_le_bytes());
}

pub(crate) fn put_u32(bytes: &mut [u8], at: usize, value: u32) {
    bytes[at..at + 4].copy_from_slice(&value.to_le_bytes());
}

fn max_align(len: usize) -> usize {
    (len + MAX_ALIGN - 1) & !(MAX_ALIGN - 1)
}

impl Page {
    /// Returns an all-zero page, the image of a freshly extended block.
    pub fn zeroed() -> Self {
        Self(vec![0u8; BLOCK_SIZE].into_boxed_slice())
    }

    /// Returns an empty, initialized page reserving `special_size` trailing bytes.
    pub fn new(special_size: usize) -> Result<Self, OblivError> {
        let special_size = max_align(special_size);
        if special_size > BLOCK_SIZE - HEADER_SIZE {
            return Err(OblivError::InvalidConfigurationError(format!(
                "special space of {special_size} bytes does not fit in a page"
            )));
        }
        let special: u16 = (BLOCK_SIZE - special_size).try_into()?;
        let mut page = Self::zeroed();
        page.set_header(PageHeader {
            lower: HEADER_SIZE.try_into()?,
            upper: special,
            special,
            flags: 0,
            tag: 0,
        });
        Ok(page)
    }

    /// Returns an empty oblivious heap page whose logical identity is `block`.
    pub fn new_obliv(block: BlockNumber) -> Result<Self, OblivError> {
        let mut page = Self::new(OBLIV_SPECIAL_SIZE)?;
        page.set_obliv_block(block)?;
        Ok(page)
    }

    /// Returns an oblivious heap page tagged as not holding a real record.
    pub fn dummy() -> Result<Self, OblivError> {
        Self::new_obliv(DUMMY_BLOCK)
    }

    /// Copies a page out of `bytes`, which must be exactly one block long.
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, OblivError> {
        if bytes.len() != BLOCK_SIZE {
            return Err(OblivError::SizeMismatchError {
                expected: BLOCK_SIZE,
                actual: bytes.len(),
            });
        }
        Ok(Self(bytes.into()))
    }

    /// The raw block image.
    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    /// Whether the page has never been initialized (all-zero header).
    pub fn is_new(&self) -> bool {
        read_u16(&self.0, UPPER) == 0
    }

    /// Decodes the header without validating it.
    pub fn header(&self) -> PageHeader {
        PageHeader {
            lower: read_u16(&self.0, LOWER),
            upper: read_u16(&self.0, UPPER),
            special: read_u16(&self.0, SPECIAL),
            flags: read_u16(&self.0, FLAGS),
            tag: read_u32(&self.0, TAG),
        }
    }

    fn set_header(&mut self, header: PageHeader) {
        put_u16(&mut self.0, LOWER, header.lower);
        put_u16(&mut self.0, UPPER, header.upper);
        put_u16(&mut self.0, SPECIAL, header.special);
        put_u16(&mut self.0, FLAGS, header.flags);
        put_u32(&mut self.0, TAG, header.tag);
    }

    /// Fails with `CorruptPageError` unless the header offsets are consistent.
    pub fn check(&self) -> Result<(), OblivError> {
        let PageHeader {
            lower,
            upper,
            special,
            ..
        } = self.header();
        let (lower, upper, special) = (lower as usize, upper as usize, special as usize);
        if lower < HEADER_SIZE
            || lower > upper
            || upper > special
            || special > BLOCK_SIZE
            || (lower - HEADER_SIZE) % ITEM_ID_SIZE != 0
        {
            return Err(OblivError::CorruptPageError(format!(
                "corrupted page pointers: lower = {lower}, upper = {upper}, special = {special}"
            )));
        }
        Ok(())
    }

    /// The header word reserved for the page's real block number.
    pub fn tag(&self) -> u32 {
        self.header().tag
    }

    /// Stamps the header word reserved for the page's real block number.
    pub fn set_tag(&mut self, tag: u32) {
        put_u32(&mut self.0, TAG, tag);
    }

    /// Number of slots in the slot directory; 0 for an empty page.
    pub fn max_offset(&self) -> OffsetNumber {
        let lower = self.header().lower as usize;
        (lower.saturating_sub(HEADER_SIZE) / ITEM_ID_SIZE) as OffsetNumber
    }

    /// Bytes still available for one more slot and its item.
    pub fn free_space(&self) -> usize {
        let header = self.header();
        (header.upper as usize).saturating_sub(header.lower as usize + ITEM_ID_SIZE)
    }

    fn item_id_position(&self, offset: OffsetNumber) -> Result<usize, OblivError> {
        if offset == 0 || offset > self.max_offset() {
            return Err(OblivError::CorruptPageError(format!(
                "slot {offset} is outside 1..={}",
                self.max_offset()
            )));
        }
        Ok(HEADER_SIZE + (offset as usize - 1) * ITEM_ID_SIZE)
    }

    /// Decodes the slot descriptor at `offset`.
    pub fn item_id(&self, offset: OffsetNumber) -> Result<ItemId, OblivError> {
        self.check()?;
        let at = self.item_id_position(offset)?;
        let item_id = ItemId {
            offset: read_u16(&self.0, at),
            len: read_u16(&self.0, at + 2),
        };
        let header = self.header();
        let end = item_id.offset as usize + item_id.len as usize;
        if item_id.offset < header.upper || end > header.special as usize {
            return Err(OblivError::CorruptPageError(format!(
                "slot {offset} points outside the item area"
            )));
        }
        Ok(item_id)
    }

    /// The item body described by slot `offset`.
    pub fn item(&self, offset: OffsetNumber) -> Result<&[u8], OblivError> {
        let ItemId { offset: start, len } = self.item_id(offset)?;
        let start = start as usize;
        Ok(&self.0[start..start + len as usize])
    }

    /// Mutable access to the item body described by slot `offset`; its length is fixed.
    pub fn item_mut(&mut self, offset: OffsetNumber) -> Result<&mut [u8], OblivError> {
        let ItemId { offset: start, len } = self.item_id(offset)?;
        let start = start as usize;
        Ok(&mut self.0[start..start + len as usize])
    }

    /// Appends `item` as a new slot and returns its offset number.
    pub fn add_item(&mut self, item: &[u8]) -> Result<OffsetNumber, OblivError> {
        self.check()?;
        let header = self.header();

        let lower = header.lower as usize + ITEM_ID_SIZE;
        let aligned_size = max_align(item.len());
        let upper = header.upper as i64 - aligned_size as i64;

        if (lower as i64) > upper {
            return Err(OblivError::CorruptPageError(format!(
                "item of {} bytes does not fit: lower = {lower}, upper = {upper}",
                item.len()
            )));
        }
        let upper = upper as usize;

        let offset_number = self.max_offset() + 1;
        let at = header.lower as usize;
        put_u16(&mut self.0, at, upper.try_into()?);
        put_u16(&mut self.0, at + 2, item.len().try_into()?);
        self.0[upper..upper + item.len()].copy_from_slice(item);

        self.set_header(PageHeader {
            lower: lower.try_into()?,
            upper: upper.try_into()?,
            ..header
        });
        self.check()?;

        log::trace!(
            "Page::add_item -- slot {} at {} ({} bytes)",
            offset_number,
            upper,
            item.len()
        );
        Ok(offset_number)
    }

    /// The special space trailer.
    pub fn special(&self) -> &[u8] {
        let start = (self.header().special as usize).min(BLOCK_SIZE);
        &self.0[start..]
    }

    /// Mutable access to the special space trailer.
    pub fn special_mut(&mut self) -> &mut [u8] {
        let start = (self.header().special as usize).min(BLOCK_SIZE);
        &mut self.0[start..]
    }

    fn obliv_special(&self) -> Option<&[u8]> {
        let special = self.special();
        (!self.is_new() && special.len() >= OBLIV_SPECIAL_SIZE && special.len() < 2 * MAX_ALIGN)
            .then_some(special)
    }

    /// The logical block number stored in an oblivious heap page's special space.
    pub fn obliv_block(&self) -> Result<BlockNumber, OblivError> {
        match self.obliv_special() {
            Some(special) => get_u32(special, 0),
            None => Err(OblivError::CorruptPageError(
                "page has no oblivious special space".into(),
            )),
        }
    }

    /// Writes the logical block number of an oblivious heap page.
    pub fn set_obliv_block(&mut self, block: BlockNumber) -> Result<(), OblivError> {
        if self.obliv_special().is_none() {
            return Err(OblivError::CorruptPageError(
                "page has no oblivious special space".into(),
            ));
        }
        put_u32(self.special_mut(), 0, block);
        Ok(())
    }

    /// Whether the page holds no real record yet: never initialized, or tagged `DUMMY_BLOCK`.
    pub fn is_dummy(&self) -> bool {
        self.ct_is_dummy().into()
    }

    /// Constant-time variant of [`Page::is_dummy`] for pages carrying an oblivious special space.
    pub fn ct_is_dummy(&self) -> Choice {
        let is_new = Choice::from(self.is_new() as u8);
        let tagged = match self.obliv_special() {
            Some(special) => read_u32(special, 0).ct_eq(&DUMMY_BLOCK),
            None => Choice::from(0),
        };
        is_new | tagged
    }
}
