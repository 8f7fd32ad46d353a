// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The servicing loop.
//!
//! Waits on the region's request fd next to a stop event, answers every
//! request by copying page contents from the [`PageSource`] into the backing
//! store and acknowledging them, and optionally pushes pages nobody asked for.

use std::os::fd::AsRawFd;
use std::sync::Arc;

use log::{debug, error, info};
use postcopy::{PageState, PollMode, ReadyReport, Region, RegionError, ServicingMapping};
use vmm_sys_util::epoll::{ControlOperation, Epoll, EpollEvent, EventSet};
use vmm_sys_util::eventfd::EventFd;

use crate::source::{PageSource, SourceError};

const REQUESTS_TOKEN: u64 = 0;
const STOP_TOKEN: u64 = 1;
/// Pages pushed per idle iteration in prefetch mode.
const PREFETCH_BATCH_PAGES: usize = 64;

/// How pages are provided.
#[derive(Clone, Copy, Debug, PartialEq, Eq, clap::ValueEnum)]
pub enum ServeMode {
    /// Serve requested pages (or chunks) only.
    OnDemand,
    /// Populate the whole region at the first request.
    FaultAll,
    /// Serve requests first and push the rest of the region while idle.
    Prefetch,
}

/// Errors associated with the servicing loop.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum ServerError {
    /// Chunk size {0:#x} is not a power-of-two multiple of the {1:#x} byte page size
    ChunkSize(usize, usize),
    /// Epoll error: {0}
    Epoll(std::io::Error),
    /// Region error: {0}
    Region(#[from] RegionError),
    /// Cannot write page {0} into the backing store: {1}
    Store(usize, postcopy::BackingStoreError),
    /// {0}
    Source(#[from] SourceError),
}

/// Servicing statistics.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ServeStats {
    /// Requests read from the region.
    pub requests: usize,
    /// Pages written and acknowledged.
    pub pages: usize,
    /// Pages acknowledged without anybody asking.
    pub pushed: usize,
}

impl ServeStats {
    fn record(&mut self, report: ReadyReport) {
        self.pages += report.transitioned();
        self.pushed += report.pushed;
    }
}

/// Servicing process for one region.
#[derive(Debug)]
pub struct PageServer<'a> {
    region: Arc<Region>,
    store: ServicingMapping,
    source: &'a PageSource,
    mode: ServeMode,
    chunk_pages: usize,
    reclaim: bool,
    prefetch_cursor: usize,
    page_buf: Vec<u8>,
    stats: ServeStats,
}

impl<'a> PageServer<'a> {
    /// Creates a server answering in chunks of `chunk_size` bytes (one page
    /// when `None`).
    pub fn new(
        region: Arc<Region>,
        source: &'a PageSource,
        mode: ServeMode,
        chunk_size: Option<usize>,
        reclaim: bool,
    ) -> Result<Self, ServerError> {
        let page_size = region.page_size();
        let chunk_size = chunk_size.unwrap_or(page_size);
        if !chunk_size.is_power_of_two() || chunk_size < page_size {
            return Err(ServerError::ChunkSize(chunk_size, page_size));
        }
        let store = region.map_servicing()?;
        Ok(PageServer {
            region,
            store,
            source,
            mode,
            chunk_pages: chunk_size / page_size,
            reclaim,
            prefetch_cursor: 0,
            page_buf: vec![0u8; page_size],
            stats: ServeStats::default(),
        })
    }

    /// Statistics so far.
    pub fn stats(&self) -> ServeStats {
        self.stats
    }

    fn is_ready(&self, index: usize) -> Result<bool, ServerError> {
        Ok(self.region.page_state(utils::usize_to_u64(index))? == PageState::Ready)
    }

    /// Copies pages `[first, end)` from the source into the backing store and
    /// acknowledges them as one range.
    fn supply(&mut self, first: usize, end: usize) -> Result<(), ServerError> {
        let page_size = self.region.page_size();
        for index in first..end {
            // Never rewrite the content of a page that may already be bound.
            if self.is_ready(index)? {
                continue;
            }
            self.source.read_page(index, &mut self.page_buf)?;
            self.store
                .write(index * page_size, &self.page_buf)
                .map_err(|err| ServerError::Store(index, err))?;
        }

        let report = self.region.mark_ready_range(
            utils::usize_to_u64(first * page_size),
            utils::usize_to_u64((end - first) * page_size),
        )?;
        self.stats.record(report);

        if self.reclaim {
            let indices: Vec<u64> = (first..end).map(utils::usize_to_u64).collect();
            self.region.reclaim(&indices)?;
        }
        Ok(())
    }

    /// Supplies the chunk containing page `index`.
    pub fn serve_page(&mut self, index: usize) -> Result<(), ServerError> {
        let first = utils::align_down(index, self.chunk_pages);
        let end = (first + self.chunk_pages).min(self.region.num_pages());
        debug!("Serving pages [{}, {}) for a request on page {}", first, end, index);
        self.supply(first, end)
    }

    /// Supplies every page that is not ready yet.
    pub fn populate_all(&mut self) -> Result<(), ServerError> {
        let num_pages = self.region.num_pages();
        let mut first = 0;
        while first < num_pages {
            let end = (first + PREFETCH_BATCH_PAGES.max(self.chunk_pages)).min(num_pages);
            self.supply(first, end)?;
            first = end;
        }
        self.prefetch_cursor = num_pages;
        Ok(())
    }

    /// Pushes the next batch of pages nobody asked for. Returns false once
    /// the whole region was covered.
    fn prefetch_step(&mut self) -> Result<bool, ServerError> {
        let num_pages = self.region.num_pages();
        if self.prefetch_cursor >= num_pages {
            return Ok(false);
        }
        let first = self.prefetch_cursor;
        let end = (first + PREFETCH_BATCH_PAGES).min(num_pages);
        self.supply(first, end)?;
        self.prefetch_cursor = end;
        Ok(self.prefetch_cursor < num_pages)
    }

    /// Answers every pending request. Returns the number of requests read.
    pub fn handle_requests(&mut self) -> Result<usize, ServerError> {
        let mut handled = 0;
        loop {
            let batch = match self
                .region
                .consume_requests(self.region.config().max_request_batch, PollMode::NonBlocking)
            {
                Ok(batch) => batch,
                Err(RegionError::WouldBlock) => return Ok(handled),
                Err(err) => return Err(err.into()),
            };
            handled += batch.len();
            self.stats.requests += batch.len();

            for index in batch {
                if self.mode == ServeMode::FaultAll {
                    info!("First request on page {}, populating the whole region", index);
                    self.populate_all()?;
                    continue;
                }
                self.serve_page(utils::u64_to_usize(index))?;
            }
        }
    }

    /// Runs until `stop` is signaled.
    ///
    /// If servicing fails, the region is torn down so consumers blocked on
    /// outstanding pages fail instead of waiting forever.
    pub fn run(&mut self, stop: &EventFd) -> Result<ServeStats, ServerError> {
        let result = self.serve(stop);
        if let Err(err) = &result {
            error!("Page server failed, tearing the region down: {}", err);
            self.region.teardown();
        }
        result
    }

    fn serve(&mut self, stop: &EventFd) -> Result<ServeStats, ServerError> {
        let epoll = Epoll::new().map_err(ServerError::Epoll)?;
        epoll
            .ctl(
                ControlOperation::Add,
                self.region.request_fd(),
                EpollEvent::new(EventSet::IN, REQUESTS_TOKEN),
            )
            .map_err(ServerError::Epoll)?;
        epoll
            .ctl(
                ControlOperation::Add,
                stop.as_raw_fd(),
                EpollEvent::new(EventSet::IN, STOP_TOKEN),
            )
            .map_err(ServerError::Epoll)?;

        let mut prefetching = self.mode == ServeMode::Prefetch;
        let mut events = vec![EpollEvent::default(); 2];
        loop {
            // Poll without sleeping while there is prefetch work to do.
            let timeout = if prefetching { 0 } else { -1 };
            let ready = match epoll.wait(timeout, &mut events) {
                Ok(ready) => ready,
                Err(err) if err.kind() == std::io::ErrorKind::Interrupted => continue,
                Err(err) => return Err(ServerError::Epoll(err)),
            };

            for event in &events[..ready] {
                match event.data() {
                    REQUESTS_TOKEN => {
                        self.handle_requests()?;
                    }
                    STOP_TOKEN => {
                        info!("Page server stopping: {:?}", self.stats);
                        return Ok(self.stats);
                    }
                    other => debug!("Ignoring event for unknown token {}", other),
                }
            }

            if ready == 0 && prefetching {
                prefetching = self.prefetch_step()?;
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use postcopy::{AccessError, Lifecycle, RegionConfig};
    use vmm_sys_util::tempfile::TempFile;

    use super::*;

    const PAGE: usize = 4096;

    fn setup(num_pages: usize) -> (Arc<Region>, PageSource) {
        let config = RegionConfig {
            page_size: PAGE,
            ..Default::default()
        };
        let (region, _, _) = postcopy::init(config, num_pages * PAGE).unwrap();
        (region, PageSource::pattern(num_pages * PAGE))
    }

    #[test]
    fn test_chunk_size_validation() {
        let (region, source) = setup(4);
        assert!(matches!(
            PageServer::new(region.clone(), &source, ServeMode::OnDemand, Some(PAGE + 1), false),
            Err(ServerError::ChunkSize(..))
        ));
        assert!(matches!(
            PageServer::new(region, &source, ServeMode::OnDemand, Some(PAGE / 2), false),
            Err(ServerError::ChunkSize(..))
        ));
    }

    #[test]
    fn test_serve_chunk() {
        let (region, source) = setup(8);
        let consumer = region.map_consumer().unwrap();
        let mut server =
            PageServer::new(region.clone(), &source, ServeMode::OnDemand, Some(4 * PAGE), false)
                .unwrap();

        consumer.try_touch(5).unwrap();
        assert_eq!(server.handle_requests().unwrap(), 1);
        for index in 0..8 {
            let expected = if (4..8).contains(&index) {
                PageState::Ready
            } else {
                PageState::Unserved
            };
            assert_eq!(region.page_state(index).unwrap(), expected);
        }
        assert_eq!(
            server.stats(),
            ServeStats {
                requests: 1,
                pages: 4,
                pushed: 3,
            }
        );

        let mut page = vec![0u8; PAGE];
        consumer.read(6 * PAGE, &mut page).unwrap();
        assert_eq!(crc64::crc64(0, &page), source.page_crc(6, PAGE).unwrap());
    }

    #[test]
    fn test_fault_all() {
        let (region, source) = setup(8);
        let consumer = region.map_consumer().unwrap();
        let mut server =
            PageServer::new(region.clone(), &source, ServeMode::FaultAll, None, true).unwrap();

        consumer.try_touch(2).unwrap();
        server.handle_requests().unwrap();
        assert_eq!(server.stats().pages, 8);
        for index in 0..8 {
            assert_eq!(region.page_state(index).unwrap(), PageState::Ready);
        }
        assert_eq!(region.metrics().pages_reclaimed.count(), 8);

        let mut page = vec![0u8; PAGE];
        consumer.read(7 * PAGE, &mut page).unwrap();
        assert_eq!(crc64::crc64(0, &page), source.page_crc(7, PAGE).unwrap());
        region.finalize().unwrap();
    }

    #[test]
    fn test_run_stops_on_event() {
        let (region, source) = setup(4);
        let consumer = region.map_consumer().unwrap();
        let stop = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let mut server =
            PageServer::new(region.clone(), &source, ServeMode::Prefetch, None, false).unwrap();

        std::thread::scope(|s| {
            let serving = s.spawn(|| server.run(&stop));
            let mut page = vec![0u8; PAGE];
            for index in [3, 0] {
                consumer.read(index * PAGE, &mut page).unwrap();
                assert_eq!(crc64::crc64(0, &page), source.page_crc(index, PAGE).unwrap());
            }
            stop.write(1).unwrap();
            serving.join().unwrap().unwrap();
        });

        server.populate_all().unwrap();
        region.finalize().unwrap();
    }

    #[test]
    fn test_run_failure_tears_region_down() {
        let tmp = TempFile::new().unwrap();
        tmp.as_file().write_all(&[7u8; 2 * PAGE]).unwrap();
        let source = PageSource::from_file(tmp.as_path()).unwrap();
        // The file shrinks under the server, so serving page 1 fails.
        tmp.as_file().set_len(0).unwrap();

        let config = RegionConfig {
            page_size: PAGE,
            ..Default::default()
        };
        let (region, _, _) = postcopy::init(config, 2 * PAGE).unwrap();
        let consumer = region.map_consumer().unwrap();
        let stop = EventFd::new(libc::EFD_NONBLOCK).unwrap();
        let mut server =
            PageServer::new(region.clone(), &source, ServeMode::OnDemand, None, false).unwrap();

        std::thread::scope(|s| {
            let serving = s.spawn(|| server.run(&stop));
            assert!(matches!(
                consumer.touch(1),
                Err(AccessError::TornDown(1))
            ));
            assert!(matches!(
                serving.join().unwrap(),
                Err(ServerError::Source(SourceError::Read(1, _)))
            ));
        });
        assert_eq!(region.lifecycle(), Lifecycle::TornDown);
    }
}
