// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::fs::File;
use std::os::unix::fs::FileExt;
use std::path::Path;

/// Multiplier used to derive synthetic page contents.
const PATTERN_MULTIPLIER: u64 = 0x9E37_79B9_7F4A_7C15;

/// Errors associated with reading page contents.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum SourceError {
    /// Cannot open memory file: {0}
    Open(std::io::Error),
    /// Cannot get memory file metadata: {0}
    Metadata(std::io::Error),
    /// Memory file is empty
    Empty,
    /// Cannot read page {0} from the memory file: {1}
    Read(usize, std::io::Error),
}

/// Where the contents of the served pages come from.
#[derive(Debug)]
pub enum PageSource {
    /// A memory snapshot file. Pages past its end read as zeroes.
    File {
        /// The snapshot.
        file: File,
        /// Its length in bytes.
        len: usize,
    },
    /// Synthetic, deterministic page contents.
    Pattern {
        /// Size of the synthetic memory in bytes.
        len: usize,
    },
}

impl PageSource {
    /// Serves pages out of the memory file at `path`.
    pub fn from_file(path: &Path) -> Result<Self, SourceError> {
        let file = File::open(path).map_err(SourceError::Open)?;
        let len = file.metadata().map_err(SourceError::Metadata)?.len();
        if len == 0 {
            return Err(SourceError::Empty);
        }
        Ok(PageSource::File {
            file,
            len: utils::u64_to_usize(len),
        })
    }

    /// Serves `len` bytes of synthetic memory.
    pub fn pattern(len: usize) -> Self {
        PageSource::Pattern { len }
    }

    /// Size of the memory in bytes.
    pub fn size(&self) -> usize {
        match self {
            PageSource::File { len, .. } | PageSource::Pattern { len } => *len,
        }
    }

    /// Fills `buf` with the content of page `index`, `buf.len()` being the
    /// page size.
    pub fn read_page(&self, index: usize, buf: &mut [u8]) -> Result<(), SourceError> {
        let offset = index * buf.len();
        match self {
            PageSource::File { file, len } => {
                buf.fill(0);
                let available = len.saturating_sub(offset).min(buf.len());
                file.read_exact_at(&mut buf[..available], utils::usize_to_u64(offset))
                    .map_err(|err| SourceError::Read(index, err))
            }
            PageSource::Pattern { .. } => {
                let seed = utils::usize_to_u64(index).wrapping_mul(PATTERN_MULTIPLIER);
                for (word, chunk) in (0u64..).zip(buf.chunks_mut(8)) {
                    let bytes = (seed ^ word).wrapping_mul(PATTERN_MULTIPLIER).to_le_bytes();
                    chunk.copy_from_slice(&bytes[..chunk.len()]);
                }
                Ok(())
            }
        }
    }

    /// CRC64 of page `index` for a page of `page_size` bytes.
    pub fn page_crc(&self, index: usize, page_size: usize) -> Result<u64, SourceError> {
        let mut buf = vec![0u8; page_size];
        self.read_page(index, &mut buf)?;
        Ok(crc64::crc64(0, &buf))
    }
}
