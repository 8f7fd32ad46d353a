// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Views of a region handed out by [`Region::map`].
//!
//! A consumer view is private anonymous memory. Its pages are filled from the
//! backing store ("bound") by the region manager once they are ready, and
//! every access goes through the fault path for pages not bound yet. A
//! servicing view is a second shared mapping of the backing store with no
//! fault interception.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use vm_memory::mmap::MmapRegionError;
use vm_memory::{
    ByteValued, Bytes, MmapRegion, VolatileMemory, VolatileMemoryError, VolatileSlice,
};

use crate::backing_store::BackingStoreError;
use crate::channel::ChannelError;
use crate::region::{FaultOutcome, Region};

/// Errors surfaced to a consumer access. All of them are fatal access
/// violations for the consumer; nothing is retried.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum AccessError {
    /// Access of {len} bytes at offset {offset:#x} is outside the {size:#x} byte region
    OutOfRange { offset: usize, len: usize, size: usize },
    /// Page {0} is out of range for a region of {1} pages
    PageOutOfRange(usize, usize),
    /// Content of page {0} cannot be provided
    ContentUnavailable(usize),
    /// The region was torn down while page {0} was outstanding
    TornDown(usize),
    /// Cannot request page {0}: {1}
    Request(usize, ChannelError),
    /// Cannot access consumer memory: {0}
    Memory(#[from] VolatileMemoryError),
}

/// How a region is mapped.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MapMode {
    /// Private view whose unready pages fault into the protocol.
    Consumer,
    /// Shared, fully addressable view of the backing store.
    Servicing,
}

/// A mapping returned by [`Region::map`].
#[derive(Debug)]
pub enum Mapping {
    /// See [`MapMode::Consumer`].
    Consumer(ConsumerMapping),
    /// See [`MapMode::Servicing`].
    Servicing(ServicingMapping),
}

/// Private memory of one consumer view plus which of its pages are bound.
#[derive(Debug)]
pub(crate) struct PageView {
    mem: MmapRegion,
    page_size: usize,
    bound: Box<[AtomicBool]>,
}

impl PageView {
    pub(crate) fn new(page_size: usize, num_pages: usize) -> Result<PageView, MmapRegionError> {
        Ok(PageView {
            mem: MmapRegion::new(page_size * num_pages)?,
            page_size,
            bound: (0..num_pages).map(|_| AtomicBool::new(false)).collect(),
        })
    }

    #[inline]
    pub(crate) fn is_bound(&self, index: usize) -> bool {
        self.bound
            .get(index)
            .is_some_and(|bound| bound.load(Ordering::Acquire))
    }

    /// Copies `content` into page `index` and publishes it as bound.
    ///
    /// Callers serialize binds of the same page; the region does it under the
    /// page's slot lock.
    pub(crate) fn bind(
        &self,
        index: usize,
        content: VolatileSlice<'_>,
    ) -> Result<(), VolatileMemoryError> {
        if self.is_bound(index) {
            return Ok(());
        }
        let target = self.mem.get_slice(index * self.page_size, self.page_size)?;
        content.copy_to_volatile_slice(target);
        self.bound[index].store(true, Ordering::Release);
        Ok(())
    }
}

/// A consumer's view of a region.
///
/// Reads and writes of pages that are not bound yet block until the servicing
/// process marks them ready.
#[derive(Debug)]
pub struct ConsumerMapping {
    region: Arc<Region>,
    view: Arc<PageView>,
}

impl ConsumerMapping {
    pub(crate) fn new(region: Arc<Region>, view: Arc<PageView>) -> Self {
        ConsumerMapping { region, view }
    }

    /// The region this view belongs to.
    pub fn region(&self) -> &Arc<Region> {
        &self.region
    }

    /// Size of the view in bytes.
    pub fn size(&self) -> usize {
        self.view.mem.len()
    }

    /// Whether page `index` is already populated in this view.
    pub fn is_bound(&self, index: usize) -> bool {
        self.view.is_bound(index)
    }

    /// Faults page `index` in, blocking until it is ready.
    pub fn touch(&self, index: usize) -> Result<FaultOutcome, AccessError> {
        if self.view.is_bound(index) {
            return Ok(FaultOutcome::Immediate);
        }
        self.region.on_access_fault(&self.view, index, true)
    }

    /// Like [`ConsumerMapping::touch`], but returns [`FaultOutcome::WouldBlock`]
    /// instead of waiting. The page is still requested.
    pub fn try_touch(&self, index: usize) -> Result<FaultOutcome, AccessError> {
        if self.view.is_bound(index) {
            return Ok(FaultOutcome::Immediate);
        }
        self.region.on_access_fault(&self.view, index, false)
    }

    /// Faults in every page overlapping `[offset, offset + len)` and returns
    /// the corresponding memory.
    fn access(&self, offset: usize, len: usize) -> Result<VolatileSlice<'_>, AccessError> {
        let in_range = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.size());
        if !in_range {
            return Err(AccessError::OutOfRange {
                offset,
                len,
                size: self.size(),
            });
        }
        for index in utils::page_range(offset, len, self.view.page_size) {
            self.touch(index)?;
        }
        Ok(self.view.mem.get_slice(offset, len)?)
    }

    /// Reads `buf.len()` bytes at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), AccessError> {
        self.access(offset, buf.len())?.copy_to(buf);
        Ok(())
    }

    /// Writes `data` at `offset`. The write only affects this private view.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), AccessError> {
        self.access(offset, data.len())?.copy_from(data);
        Ok(())
    }

    /// Reads an object of type `T` at `offset`.
    pub fn read_obj<T: ByteValued>(&self, offset: usize) -> Result<T, AccessError> {
        Ok(self
            .access(offset, std::mem::size_of::<T>())?
            .read_obj::<T>(0)?)
    }

    /// Writes `value` at `offset`.
    pub fn write_obj<T: ByteValued>(&self, value: T, offset: usize) -> Result<(), AccessError> {
        Ok(self
            .access(offset, std::mem::size_of::<T>())?
            .write_obj(value, 0)?)
    }
}

/// The servicing process's view of the backing store.
#[derive(Debug)]
pub struct ServicingMapping {
    mem: MmapRegion,
    page_size: usize,
}

impl ServicingMapping {
    pub(crate) fn new(mem: MmapRegion, page_size: usize) -> Self {
        ServicingMapping { mem, page_size }
    }

    /// Size of the view in bytes.
    pub fn size(&self) -> usize {
        self.mem.len()
    }

    fn slice(&self, offset: usize, len: usize) -> Result<VolatileSlice<'_>, BackingStoreError> {
        let in_range = offset
            .checked_add(len)
            .is_some_and(|end| end <= self.size());
        if !in_range {
            return Err(BackingStoreError::AccessOutOfRange { offset, len });
        }
        Ok(self.mem.get_slice(offset, len)?)
    }

    /// Memory of page `index`.
    pub fn page_slice(&self, index: usize) -> Result<VolatileSlice<'_>, BackingStoreError> {
        let offset = index
            .checked_mul(self.page_size)
            .ok_or(BackingStoreError::AccessOutOfRange {
                offset: usize::MAX,
                len: self.page_size,
            })?;
        self.slice(offset, self.page_size)
    }

    /// Writes `data` at `offset`.
    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), BackingStoreError> {
        self.slice(offset, data.len())?.copy_from(data);
        Ok(())
    }

    /// Reads `buf.len()` bytes at `offset`.
    pub fn read(&self, offset: usize, buf: &mut [u8]) -> Result<(), BackingStoreError> {
        self.slice(offset, buf.len())?.copy_to(buf);
        Ok(())
    }
}
