// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Page-granular shared storage written by the servicing process.
//!
//! The store is a memfd mapped `MAP_SHARED`, so the servicing process can
//! write page contents through its own mapping (or through the fd, after
//! passing it to another process) and the region manager observes them
//! through this one.

use std::fs::File;
use std::os::fd::AsRawFd;
use std::sync::atomic::{AtomicBool, Ordering};

use vm_memory::mmap::{MmapRegionBuilder, MmapRegionError};
use vm_memory::{FileOffset, MmapRegion, VolatileMemory, VolatileMemoryError, VolatileSlice};

/// Name of the memfd backing a region, visible in `/proc/<pid>/fd`.
const BACKING_MEMFD_NAME: &str = "postcopy_backing";

/// Errors associated with the backing store.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum BackingStoreError {
    /// Cannot create the backing memfd: {0}
    Memfd(memfd::Error),
    /// Cannot set the size of the backing memfd: {0}
    SetLen(std::io::Error),
    /// Cannot duplicate the backing memfd: {0}
    CloneFile(std::io::Error),
    /// Cannot map the backing memfd: {0}
    Mmap(MmapRegionError),
    /// Cannot access backing store memory: {0}
    Memory(#[from] VolatileMemoryError),
    /// Page {0} is out of range for a backing store of {1} pages
    OutOfRange(usize, usize),
    /// Access of {len} bytes at offset {offset:#x} exceeds the backing store
    AccessOutOfRange { offset: usize, len: usize },
    /// Page {0} has been reclaimed
    Reclaimed(usize),
    /// Cannot release backing store pages: {0}
    PunchHole(std::io::Error),
}

/// Shared storage holding the content of every page of a region.
#[derive(Debug)]
pub struct BackingStore {
    file: File,
    mapping: MmapRegion,
    page_size: usize,
    num_pages: usize,
    reclaimed: Box<[AtomicBool]>,
}

/// Maps `size` bytes of `file` shared and writable.
pub(crate) fn map_shared(file: &File, size: usize) -> Result<MmapRegion, BackingStoreError> {
    let file = file.try_clone().map_err(BackingStoreError::CloneFile)?;
    MmapRegionBuilder::new(size)
        .with_file_offset(FileOffset::new(file, 0))
        .with_mmap_prot(libc::PROT_READ | libc::PROT_WRITE)
        .with_mmap_flags(libc::MAP_SHARED)
        .build()
        .map_err(BackingStoreError::Mmap)
}

impl BackingStore {
    /// Creates a zero-filled store of `num_pages` pages of `page_size` bytes.
    pub fn new(
        page_size: usize,
        num_pages: usize,
        seal: bool,
    ) -> Result<BackingStore, BackingStoreError> {
        let size = page_size
            .checked_mul(num_pages)
            .ok_or(BackingStoreError::OutOfRange(num_pages, num_pages))?;

        let opts = memfd::MemfdOptions::default().allow_sealing(seal);
        let memfd = opts
            .create(BACKING_MEMFD_NAME)
            .map_err(BackingStoreError::Memfd)?;
        memfd
            .as_file()
            .set_len(utils::usize_to_u64(size))
            .map_err(BackingStoreError::SetLen)?;

        if seal {
            let mut seals = memfd::SealsHashSet::new();
            seals.insert(memfd::FileSeal::SealShrink);
            seals.insert(memfd::FileSeal::SealGrow);
            memfd.add_seals(&seals).map_err(BackingStoreError::Memfd)?;
            memfd
                .add_seal(memfd::FileSeal::SealSeal)
                .map_err(BackingStoreError::Memfd)?;
        }

        let file = memfd.into_file();
        let mapping = map_shared(&file, size)?;
        let reclaimed = (0..num_pages).map(|_| AtomicBool::new(false)).collect();

        Ok(BackingStore {
            file,
            mapping,
            page_size,
            num_pages,
            reclaimed,
        })
    }

    /// The memfd holding the pages, for hand-off to a servicing process.
    pub fn file(&self) -> &File {
        &self.file
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.mapping.len()
    }

    /// Size of one page in bytes.
    pub fn page_size(&self) -> usize {
        self.page_size
    }

    /// Number of pages.
    pub fn num_pages(&self) -> usize {
        self.num_pages
    }

    fn check_page(&self, index: usize) -> Result<(), BackingStoreError> {
        if index >= self.num_pages {
            return Err(BackingStoreError::OutOfRange(index, self.num_pages));
        }
        Ok(())
    }

    /// Whether the storage of `index` was released.
    pub fn is_reclaimed(&self, index: usize) -> bool {
        self.reclaimed
            .get(index)
            .is_some_and(|flag| flag.load(Ordering::Acquire))
    }

    /// Volatile view of the bytes of page `index`.
    pub fn page_slice(&self, index: usize) -> Result<VolatileSlice<'_>, BackingStoreError> {
        self.check_page(index)?;
        if self.is_reclaimed(index) {
            return Err(BackingStoreError::Reclaimed(index));
        }
        Ok(self
            .mapping
            .get_slice(index * self.page_size, self.page_size)?)
    }

    /// Writes `data` at byte `offset` of the store.
    pub fn write_at(&self, offset: usize, data: &[u8]) -> Result<(), BackingStoreError> {
        let in_range = offset
            .checked_add(data.len())
            .is_some_and(|end| end <= self.size());
        if !in_range {
            return Err(BackingStoreError::AccessOutOfRange {
                offset,
                len: data.len(),
            });
        }
        self.mapping.get_slice(offset, data.len())?.copy_from(data);
        Ok(())
    }

    /// Writes `data` at the start of page `index`. `data` may be shorter than
    /// a page, the remainder is left untouched.
    pub fn write_page(&self, index: usize, data: &[u8]) -> Result<(), BackingStoreError> {
        self.check_page(index)?;
        if data.len() > self.page_size {
            return Err(BackingStoreError::AccessOutOfRange {
                offset: index * self.page_size,
                len: data.len(),
            });
        }
        self.write_at(index * self.page_size, data)
    }

    /// Copies page `index` into `buf`, which must be exactly one page long.
    pub fn read_page(&self, index: usize, buf: &mut [u8]) -> Result<(), BackingStoreError> {
        if buf.len() != self.page_size {
            return Err(BackingStoreError::AccessOutOfRange {
                offset: index.saturating_mul(self.page_size),
                len: buf.len(),
            });
        }
        self.page_slice(index)?.copy_to(buf);
        Ok(())
    }

    /// Releases the storage of page `index`. Later reads of the page fail.
    pub(crate) fn punch_hole(&self, index: usize) -> Result<(), BackingStoreError> {
        self.check_page(index)?;
        if self.reclaimed[index].swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let offset = libc::off_t::try_from(index * self.page_size)
            .map_err(|_| BackingStoreError::OutOfRange(index, self.num_pages))?;
        let len = libc::off_t::try_from(self.page_size)
            .map_err(|_| BackingStoreError::OutOfRange(index, self.num_pages))?;
        // SAFETY: The fd is owned by `self` and the range lies within the file; punching
        // a hole only changes file contents, never the mappings' validity.
        let ret = unsafe {
            libc::fallocate(
                self.file.as_raw_fd(),
                libc::FALLOC_FL_PUNCH_HOLE | libc::FALLOC_FL_KEEP_SIZE,
                offset,
                len,
            )
        };
        if ret < 0 {
            self.reclaimed[index].store(false, Ordering::Release);
            return Err(BackingStoreError::PunchHole(std::io::Error::last_os_error()));
        }
        Ok(())
    }
}
