// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Notification channel between a region and its servicing process.
//!
//! Page requests flow from the region to the servicing process through a FIFO
//! queue whose readiness is mirrored by an [`EventFd`], so the servicing
//! process can poll it next to its other file descriptors. Ready
//! notifications flow back as batches of page indices, encoded on the wire as
//! little-endian `u64` entries.

use std::collections::VecDeque;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::{Condvar, Mutex};

use byteorder::{ByteOrder, LittleEndian};
use vmm_sys_util::eventfd::EventFd;

/// Size in bytes of one encoded channel entry.
pub const ENTRY_SIZE: usize = std::mem::size_of::<u64>();

/// How a request read behaves when nothing is pending.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum PollMode {
    /// Sleep until a request arrives or the channel closes.
    Blocking,
    /// Report [`ChannelError::WouldBlock`] immediately.
    NonBlocking,
}

/// Errors associated with the request channel.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ChannelError {
    /// The channel is closed
    Closed,
    /// No page requests are pending
    WouldBlock,
    /// Error during eventfd operations: {0}
    EventFd(std::io::Error),
}

/// A ready batch that cannot be applied. Nothing of the batch is applied.
#[rustfmt::skip]
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum ProtocolViolation {
    /// Ready batch of {0} bytes is not a whole number of 8-byte entries
    ShortWrite(usize),
    /// Page index {0} is out of range for a region of {1} pages
    IndexOutOfRange(u64, usize),
    /// Offset or length {0:#x} is not aligned to the {1:#x} byte page size
    Misaligned(u64, usize),
}

/// Decodes a ready batch written by the servicing process.
pub fn decode_entries(bytes: &[u8]) -> Result<Vec<u64>, ProtocolViolation> {
    if bytes.len() % ENTRY_SIZE != 0 {
        return Err(ProtocolViolation::ShortWrite(bytes.len()));
    }
    Ok(bytes
        .chunks_exact(ENTRY_SIZE)
        .map(LittleEndian::read_u64)
        .collect())
}

/// Encodes as many whole entries as fit into `buf` and returns how many were
/// written.
pub fn encode_entries(entries: &[u64], buf: &mut [u8]) -> usize {
    let mut written = 0;
    for (entry, chunk) in entries.iter().zip(buf.chunks_exact_mut(ENTRY_SIZE)) {
        LittleEndian::write_u64(chunk, *entry);
        written += 1;
    }
    written
}

#[derive(Debug, Default)]
struct QueueInner {
    entries: VecDeque<u64>,
    closed: bool,
}

/// FIFO of page indices waiting to be handed to the servicing process.
///
/// Duplicate suppression is the caller's job: the region only pushes an index
/// on its `Unserved -> Pending` transition, which happens once per page.
#[derive(Debug)]
pub struct RequestQueue {
    inner: Mutex<QueueInner>,
    available: Condvar,
    // Readable iff `inner.entries` is non-empty.
    event: EventFd,
}

impl RequestQueue {
    /// Creates an empty, open queue.
    pub fn new() -> Result<RequestQueue, ChannelError> {
        Ok(RequestQueue {
            inner: Mutex::new(QueueInner::default()),
            available: Condvar::new(),
            event: EventFd::new(libc::EFD_NONBLOCK).map_err(ChannelError::EventFd)?,
        })
    }

    /// Appends `index` to the queue.
    pub fn push(&self, index: u64) -> Result<(), ChannelError> {
        let mut inner = self.inner.lock().expect("Poisoned lock");
        if inner.closed {
            return Err(ChannelError::Closed);
        }
        debug_assert!(!inner.entries.contains(&index));
        inner.entries.push_back(index);
        if inner.entries.len() == 1 {
            self.event.write(1).map_err(ChannelError::EventFd)?;
        }
        self.available.notify_one();
        Ok(())
    }

    /// Removes up to `max_n` entries in FIFO order.
    ///
    /// Entries for which `keep` returns false are dropped without being
    /// returned and reported through the second tuple element. In blocking
    /// mode, a drain that would only yield dropped entries keeps waiting.
    pub fn pop_batch<F>(
        &self,
        max_n: usize,
        mode: PollMode,
        keep: F,
    ) -> Result<(Vec<u64>, usize), ChannelError>
    where
        F: Fn(u64) -> bool,
    {
        let mut inner = self.inner.lock().expect("Poisoned lock");
        let mut dropped = 0;
        loop {
            if inner.closed {
                return Err(ChannelError::Closed);
            }

            let mut batch = Vec::new();
            while batch.len() < max_n {
                let Some(index) = inner.entries.pop_front() else {
                    break;
                };
                if keep(index) {
                    batch.push(index);
                } else {
                    dropped += 1;
                }
            }
            if inner.entries.is_empty() {
                self.drain_event()?;
            }

            if !batch.is_empty() || max_n == 0 {
                return Ok((batch, dropped));
            }
            if mode == PollMode::NonBlocking {
                return Err(ChannelError::WouldBlock);
            }
            inner = self.available.wait(inner).expect("Poisoned lock");
        }
    }

    fn drain_event(&self) -> Result<(), ChannelError> {
        match self.event.read() {
            Ok(_) => Ok(()),
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Ok(()),
            Err(err) => Err(ChannelError::EventFd(err)),
        }
    }

    /// Number of queued entries.
    pub fn len(&self) -> usize {
        self.inner.lock().expect("Poisoned lock").entries.len()
    }

    /// Whether nothing is queued.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Closes the queue, waking every blocked reader. Queued entries are
    /// discarded.
    pub fn close(&self) {
        let mut inner = self.inner.lock().expect("Poisoned lock");
        inner.closed = true;
        inner.entries.clear();
        // Leave the eventfd readable so pollers notice the hang-up and come
        // back to collect the error.
        if let Err(err) = self.event.write(1) {
            log::warn!("Failed to signal request channel close: {}", err);
        }
        self.available.notify_all();
    }
}

impl AsRawFd for RequestQueue {
    fn as_raw_fd(&self) -> RawFd {
        self.event.as_raw_fd()
    }
}
