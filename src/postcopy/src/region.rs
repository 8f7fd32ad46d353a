// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! The region manager.
//!
//! Every page owns a slot made of a lock-free state word, a waiter count
//! guarded by a per-page mutex, and a condition variable. State transitions
//! of a page and the binding of its content into consumer views happen under
//! that page's mutex only, so traffic on unrelated pages never contends.
//!
//! Locks are always taken in the order: consumer list, page slot, backing
//! store.

use std::fmt;
use std::os::fd::{AsRawFd, RawFd};
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, RwLock, Weak};

use log::{debug, info, warn};
use serde::Serialize;
use vm_memory::VolatileMemoryError;
use vm_memory::mmap::MmapRegionError;

use crate::backing_store::{self, BackingStore, BackingStoreError};
use crate::channel::{self, ChannelError, ENTRY_SIZE, PollMode, ProtocolViolation, RequestQueue};
use crate::config::{ConfigError, RegionConfig};
use crate::mapping::{AccessError, ConsumerMapping, MapMode, Mapping, PageView, ServicingMapping};
use crate::metrics::RegionMetrics;
use crate::page_state::{AtomicPageState, PageState};

/// At most this many outstanding pages are listed in [`OutstandingPages`].
pub const MAX_REPORTED_OUTSTANDING: usize = 32;

/// Pages still missing when a finalize was attempted.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct OutstandingPages {
    /// Number of pages that are not ready.
    pub count: usize,
    /// The lowest outstanding page indices, at most
    /// [`MAX_REPORTED_OUTSTANDING`] of them.
    pub sample: Vec<u64>,
}

impl fmt::Display for OutstandingPages {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} pages outstanding, including {:?}", self.count, self.sample)
    }
}

/// Errors associated with region operations.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum RegionError {
    /// Region size must be non-zero
    ZeroSize,
    /// Region size {0:#x} exceeds the maximum of {1:#x} bytes
    SizeTooLarge(usize, usize),
    /// Page index {0} is out of range for a region of {1} pages
    IndexOutOfRange(u64, usize),
    /// Request buffer of {0} bytes cannot hold a single entry
    BufferTooSmall(usize),
    /// Page {0} cannot be reclaimed before it is ready
    NotReclaimable(u64),
    /// Invalid region configuration: {0}
    Config(#[from] ConfigError),
    /// Protocol violation: {0}
    Protocol(#[from] ProtocolViolation),
    /// Region is not ready: {0}
    NotReady(OutstandingPages),
    /// The region has been finalized
    Finalized,
    /// No consumer view can be mapped once pages were reclaimed
    ViewsClosed,
    /// The region has been torn down
    TornDown,
    /// No page requests are pending
    WouldBlock,
    /// Request channel error: {0}
    Channel(ChannelError),
    /// Backing store error: {0}
    BackingStore(#[from] BackingStoreError),
    /// Cannot map consumer memory: {0}
    Mmap(MmapRegionError),
    /// Cannot bind page content: {0}
    Memory(#[from] VolatileMemoryError),
}

/// Coarse classification of a [`RegionError`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ErrorKind {
    /// Bad size, index or buffer handed to an operation.
    InvalidArgument,
    /// Malformed ready batch; nothing of it was applied.
    ProtocolViolation,
    /// Finalize attempted while pages are outstanding.
    NotReady,
    /// The region is finalized and the protocol is inert.
    Lifecycle,
    /// The region was torn down.
    Teardown,
    /// Nothing to read in non-blocking mode.
    WouldBlock,
    /// Host resource failure.
    Io,
}

impl RegionError {
    /// The kind of failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            RegionError::ZeroSize
            | RegionError::SizeTooLarge(..)
            | RegionError::IndexOutOfRange(..)
            | RegionError::BufferTooSmall(_)
            | RegionError::NotReclaimable(_)
            | RegionError::Config(_) => ErrorKind::InvalidArgument,
            RegionError::Protocol(_) => ErrorKind::ProtocolViolation,
            RegionError::NotReady(_) => ErrorKind::NotReady,
            RegionError::Finalized | RegionError::ViewsClosed => ErrorKind::Lifecycle,
            RegionError::TornDown => ErrorKind::Teardown,
            RegionError::WouldBlock => ErrorKind::WouldBlock,
            RegionError::Channel(_)
            | RegionError::BackingStore(_)
            | RegionError::Mmap(_)
            | RegionError::Memory(_) => ErrorKind::Io,
        }
    }
}

/// Lifecycle of a region.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[repr(u8)]
pub enum Lifecycle {
    /// Pages are being populated through the protocol.
    Active = 0,
    /// Every page is resident in every consumer view; the protocol is inert.
    Finalized = 1,
    /// The region is gone; outstanding waiters were failed.
    TornDown = 2,
}

impl Lifecycle {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => Lifecycle::Active,
            1 => Lifecycle::Finalized,
            _ => Lifecycle::TornDown,
        }
    }
}

/// How a consumer access was resolved.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum FaultOutcome {
    /// The page was ready; the caller never slept.
    Immediate,
    /// The caller slept until the page was marked ready.
    Blocked,
    /// The page is not ready and the caller asked not to wait.
    WouldBlock,
}

/// What a single ready entry did to its page.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReadyKind {
    /// `Pending -> Ready`: the answer to a request.
    Served,
    /// `Unserved -> Ready`: content pushed before anybody asked.
    Pushed,
    /// The page was already ready.
    Redundant,
}

/// Summary of an applied ready batch.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize)]
pub struct ReadyReport {
    /// Entries that answered a request.
    pub served: usize,
    /// Entries that pushed a page proactively.
    pub pushed: usize,
    /// Entries naming pages that were already ready.
    pub redundant: usize,
}

impl ReadyReport {
    /// Number of pages that changed state.
    pub fn transitioned(&self) -> usize {
        self.served + self.pushed
    }

    fn record(&mut self, kind: ReadyKind) {
        match kind {
            ReadyKind::Served => self.served += 1,
            ReadyKind::Pushed => self.pushed += 1,
            ReadyKind::Redundant => self.redundant += 1,
        }
    }
}

/// Handle through which the servicing process fills the backing store.
#[derive(Clone, Debug)]
pub struct BackingStoreHandle(Arc<BackingStore>);

impl std::ops::Deref for BackingStoreHandle {
    type Target = BackingStore;

    fn deref(&self) -> &BackingStore {
        &self.0
    }
}

/// Everything produced by [`Region::initialize`].
#[derive(Debug)]
pub struct RegionInit {
    /// The region manager.
    pub region: Arc<Region>,
    /// The store the servicing process writes page contents into.
    pub backing_store: BackingStoreHandle,
    /// Requested size rounded up to a whole number of pages.
    pub actual_size: usize,
}

#[derive(Debug, Default)]
struct PageSlot {
    state: AtomicPageState,
    // Number of callers blocked on this page.
    waiters: Mutex<usize>,
    ready: Condvar,
}

/// A memory region populated on demand by a servicing process.
pub struct Region {
    config: RegionConfig,
    size: usize,
    slots: Box<[PageSlot]>,
    requests: RequestQueue,
    backing: RwLock<Option<Arc<BackingStore>>>,
    consumers: Mutex<Vec<Weak<PageView>>>,
    // Set under the consumers lock by the first reclaim.
    views_closed: AtomicBool,
    lifecycle: AtomicU8,
    metrics: RegionMetrics,
}

impl fmt::Debug for Region {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Region")
            .field("size", &self.size)
            .field("page_size", &self.config.page_size)
            .field("num_pages", &self.slots.len())
            .field("lifecycle", &self.lifecycle())
            .field("pending_requests", &self.requests.len())
            .finish()
    }
}

impl Region {
    /// Creates a region of at least `size` bytes with every page unserved.
    pub fn initialize(config: RegionConfig, size: usize) -> Result<RegionInit, RegionError> {
        config.validate()?;
        if size == 0 {
            return Err(RegionError::ZeroSize);
        }
        let actual_size = utils::align_up(size, config.page_size)
            .ok_or(RegionError::SizeTooLarge(size, config.max_region_size))?;
        if actual_size > config.max_region_size {
            return Err(RegionError::SizeTooLarge(size, config.max_region_size));
        }

        let num_pages = actual_size / config.page_size;
        let store = Arc::new(BackingStore::new(
            config.page_size,
            num_pages,
            config.seal_backing_store,
        )?);
        let slots = (0..num_pages).map(|_| PageSlot::default()).collect();
        let requests = RequestQueue::new().map_err(RegionError::Channel)?;

        info!(
            "Initialized post-copy region of {:#x} bytes ({} pages of {:#x} bytes)",
            actual_size, num_pages, config.page_size
        );

        let region = Arc::new(Region {
            config,
            size: actual_size,
            slots,
            requests,
            backing: RwLock::new(Some(store.clone())),
            consumers: Mutex::new(Vec::new()),
            views_closed: AtomicBool::new(false),
            lifecycle: AtomicU8::new(Lifecycle::Active as u8),
            metrics: RegionMetrics::default(),
        });

        Ok(RegionInit {
            region,
            backing_store: BackingStoreHandle(store),
            actual_size,
        })
    }

    /// Size in bytes.
    pub fn size(&self) -> usize {
        self.size
    }

    /// Size of one page in bytes.
    pub fn page_size(&self) -> usize {
        self.config.page_size
    }

    /// Number of pages.
    pub fn num_pages(&self) -> usize {
        self.slots.len()
    }

    /// The configuration the region was created with.
    pub fn config(&self) -> &RegionConfig {
        &self.config
    }

    /// Protocol counters.
    pub fn metrics(&self) -> &RegionMetrics {
        &self.metrics
    }

    /// Current lifecycle.
    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_raw(self.lifecycle.load(Ordering::Acquire))
    }

    fn check_active(&self) -> Result<(), RegionError> {
        match self.lifecycle() {
            Lifecycle::Active => Ok(()),
            Lifecycle::Finalized => Err(RegionError::Finalized),
            Lifecycle::TornDown => Err(RegionError::TornDown),
        }
    }

    fn slot(&self, index: u64) -> Result<&PageSlot, RegionError> {
        self.slots
            .get(utils::u64_to_usize(index))
            .ok_or(RegionError::IndexOutOfRange(index, self.slots.len()))
    }

    /// State of page `index`.
    pub fn page_state(&self, index: u64) -> Result<PageState, RegionError> {
        Ok(self.slot(index)?.state.load())
    }

    /// Number of callers blocked on page `index`.
    pub fn waiter_count(&self, index: u64) -> Result<usize, RegionError> {
        Ok(*self.slot(index)?.waiters.lock().expect("Poisoned lock"))
    }

    /// Number of requests not yet handed to the servicing process.
    pub fn pending_requests(&self) -> usize {
        self.requests.len()
    }

    /// File descriptor that polls readable while requests are pending.
    pub fn request_fd(&self) -> RawFd {
        self.requests.as_raw_fd()
    }

    /// Maps the region, either as a consumer view or as the servicing
    /// process's view of the backing store.
    pub fn map(self: &Arc<Self>, mode: MapMode) -> Result<Mapping, RegionError> {
        match mode {
            MapMode::Consumer => self.map_consumer().map(Mapping::Consumer),
            MapMode::Servicing => self.map_servicing().map(Mapping::Servicing),
        }
    }

    /// Creates a new consumer view. Pages that are already ready are bound
    /// into it on first access.
    ///
    /// Fails with [`RegionError::ViewsClosed`] once any page was reclaimed,
    /// since a new view could not be populated with it.
    pub fn map_consumer(self: &Arc<Self>) -> Result<ConsumerMapping, RegionError> {
        let mut consumers = self.consumers.lock().expect("Poisoned lock");
        self.check_active()?;
        if self.views_closed.load(Ordering::Acquire) {
            return Err(RegionError::ViewsClosed);
        }
        let view = Arc::new(
            PageView::new(self.config.page_size, self.num_pages()).map_err(RegionError::Mmap)?,
        );
        consumers.retain(|view| view.strong_count() > 0);
        consumers.push(Arc::downgrade(&view));
        debug!("Mapped consumer view #{}", consumers.len());
        Ok(ConsumerMapping::new(self.clone(), view))
    }

    /// Creates a shared view of the backing store.
    pub fn map_servicing(&self) -> Result<ServicingMapping, RegionError> {
        self.check_active()?;
        let backing = self.backing.read().expect("Poisoned lock");
        let store = backing.as_ref().ok_or(RegionError::TornDown)?;
        let mem = backing_store::map_shared(store.file(), self.size)?;
        Ok(ServicingMapping::new(mem, self.config.page_size))
    }

    fn live_views(&self) -> Vec<Arc<PageView>> {
        let mut consumers = self.consumers.lock().expect("Poisoned lock");
        consumers.retain(|view| view.strong_count() > 0);
        consumers.iter().filter_map(Weak::upgrade).collect()
    }

    /// Copies page `index` into `view`. Must be called with the page's slot
    /// lock held.
    fn bind(&self, view: &PageView, index: usize) -> Result<(), AccessError> {
        if view.is_bound(index) {
            return Ok(());
        }
        let backing = self.backing.read().expect("Poisoned lock");
        let content = backing
            .as_ref()
            .ok_or(AccessError::ContentUnavailable(index))?
            .page_slice(index)
            .map_err(|err| {
                warn!("Cannot bind page {}: {}", index, err);
                AccessError::ContentUnavailable(index)
            })?;
        Ok(view.bind(index, content)?)
    }

    /// Resolves a consumer access to page `index` of `view`.
    ///
    /// Ready pages are bound and the call returns without sleeping. Otherwise
    /// the page is requested (once, on its first fault) and, if `wait` is
    /// set, the caller sleeps until the page is ready or the region is torn
    /// down.
    pub(crate) fn on_access_fault(
        &self,
        view: &PageView,
        index: usize,
        wait: bool,
    ) -> Result<FaultOutcome, AccessError> {
        let slot = self
            .slots
            .get(index)
            .ok_or(AccessError::PageOutOfRange(index, self.slots.len()))?;
        self.metrics.faults.inc();

        let mut waiters = slot.waiters.lock().expect("Poisoned lock");
        let mut outcome = FaultOutcome::Immediate;
        while !slot.state.is_ready() {
            match self.lifecycle() {
                Lifecycle::Active => {}
                Lifecycle::TornDown => return Err(AccessError::TornDown(index)),
                // Finalize only happens once every page is ready.
                Lifecycle::Finalized => return Err(AccessError::ContentUnavailable(index)),
            }

            if slot.state.advance(PageState::Pending) == PageState::Unserved {
                self.requests
                    .push(utils::usize_to_u64(index))
                    .map_err(|err| AccessError::Request(index, err))?;
                self.metrics.requests_queued.inc();
            }
            if !wait {
                return Ok(FaultOutcome::WouldBlock);
            }
            if outcome == FaultOutcome::Immediate {
                self.metrics.blocked_faults.inc();
                outcome = FaultOutcome::Blocked;
            }

            *waiters += 1;
            waiters = slot.ready.wait(waiters).expect("Poisoned lock");
            *waiters -= 1;
        }

        if outcome == FaultOutcome::Immediate {
            self.metrics.fast_path_hits.inc();
        }
        self.bind(view, index)?;
        Ok(outcome)
    }

    /// Hands up to `max_n` requested page indices to the servicing process,
    /// in the order the pages were first faulted on.
    ///
    /// Requests for pages that became ready in the meantime are dropped. With
    /// nothing pending, blocks or fails with [`RegionError::WouldBlock`]
    /// according to `mode`.
    pub fn consume_requests(&self, max_n: usize, mode: PollMode) -> Result<Vec<u64>, RegionError> {
        self.check_active()?;
        let max_n = max_n.min(self.config.max_request_batch);
        let (batch, skipped) = self
            .requests
            .pop_batch(max_n, mode, |index| {
                self.slots
                    .get(utils::u64_to_usize(index))
                    .is_some_and(|slot| !slot.state.is_ready())
            })
            .map_err(|err| self.channel_error(err))?;

        self.metrics.requests_skipped.add(utils::usize_to_u64(skipped));
        self.metrics
            .requests_delivered
            .add(utils::usize_to_u64(batch.len()));
        if !batch.is_empty() {
            debug!("Delivering {} page requests", batch.len());
        }
        Ok(batch)
    }

    /// Byte-level form of [`Region::consume_requests`]: fills `buf` with as
    /// many encoded entries as it holds and returns the number of bytes
    /// written.
    pub fn request_read_into(&self, buf: &mut [u8], mode: PollMode) -> Result<usize, RegionError> {
        if buf.len() < ENTRY_SIZE {
            return Err(RegionError::BufferTooSmall(buf.len()));
        }
        let batch = self.consume_requests(buf.len() / ENTRY_SIZE, mode)?;
        Ok(channel::encode_entries(&batch, buf) * ENTRY_SIZE)
    }

    fn channel_error(&self, err: ChannelError) -> RegionError {
        match err {
            ChannelError::Closed => match self.lifecycle() {
                Lifecycle::Finalized => RegionError::Finalized,
                _ => RegionError::TornDown,
            },
            ChannelError::WouldBlock => RegionError::WouldBlock,
            err => RegionError::Channel(err),
        }
    }

    fn reject(&self, violation: ProtocolViolation) -> RegionError {
        warn!("Rejected ready batch: {}", violation);
        self.metrics.rejected_batches.inc();
        RegionError::Protocol(violation)
    }

    /// Marks pages ready, binds them into every consumer view and wakes
    /// their waiters.
    ///
    /// Pages nobody asked for yet are accepted as proactive pushes; pages
    /// that are already ready are ignored. If any index is out of range, the
    /// whole batch is rejected and nothing changes.
    pub fn mark_ready(&self, indices: &[u64]) -> Result<ReadyReport, RegionError> {
        self.check_active()?;
        let num_pages = self.num_pages();
        if let Some(index) = indices
            .iter()
            .find(|index| utils::u64_to_usize(**index) >= num_pages)
        {
            return Err(self.reject(ProtocolViolation::IndexOutOfRange(*index, num_pages)));
        }

        let views = self.live_views();
        let mut report = ReadyReport::default();
        for index in indices {
            report.record(self.make_ready(&views, utils::u64_to_usize(*index))?);
        }

        debug!(
            "Ready batch applied: {} served, {} pushed, {} redundant",
            report.served, report.pushed, report.redundant
        );
        Ok(report)
    }

    fn make_ready(&self, views: &[Arc<PageView>], index: usize) -> Result<ReadyKind, RegionError> {
        let slot = &self.slots[index];
        let waiters = slot.waiters.lock().expect("Poisoned lock");
        if slot.state.is_ready() {
            self.metrics.redundant_ready.inc();
            return Ok(ReadyKind::Redundant);
        }

        {
            let backing = self.backing.read().expect("Poisoned lock");
            let store = backing.as_ref().ok_or(RegionError::TornDown)?;
            for view in views {
                view.bind(index, store.page_slice(index)?)?;
            }
        }

        // Publish only after every view holds the content.
        let kind = match slot.state.advance(PageState::Ready) {
            PageState::Unserved => {
                self.metrics.pages_pushed.inc();
                ReadyKind::Pushed
            }
            PageState::Pending => {
                self.metrics.pages_served.inc();
                ReadyKind::Served
            }
            PageState::Ready => ReadyKind::Redundant,
        };
        if *waiters > 0 {
            self.metrics.waiters_woken.add(utils::usize_to_u64(*waiters));
            slot.ready.notify_all();
        }
        Ok(kind)
    }

    /// Byte-level form of [`Region::mark_ready`]: `bytes` is a sequence of
    /// encoded entries. A length that is not a whole number of entries
    /// rejects the batch.
    pub fn ready_write(&self, bytes: &[u8]) -> Result<ReadyReport, RegionError> {
        self.check_active()?;
        let indices = channel::decode_entries(bytes).map_err(|v| self.reject(v))?;
        self.mark_ready(&indices)
    }

    /// Marks every page of the byte range `[offset, offset + len)` ready.
    /// Both bounds must be page aligned.
    pub fn mark_ready_range(&self, offset: u64, len: u64) -> Result<ReadyReport, RegionError> {
        self.check_active()?;
        let page_size = self.config.page_size;
        let align = utils::usize_to_u64(page_size);
        for value in [offset, len] {
            if !utils::is_aligned(value, align) {
                return Err(self.reject(ProtocolViolation::Misaligned(value, page_size)));
            }
        }
        let first = offset / align;
        let end = first.saturating_add(len / align);
        if end > utils::usize_to_u64(self.num_pages()) {
            let bad = first.max(utils::usize_to_u64(self.num_pages()));
            return Err(self.reject(ProtocolViolation::IndexOutOfRange(bad, self.num_pages())));
        }
        let indices: Vec<u64> = (first..end).collect();
        self.mark_ready(&indices)
    }

    /// Releases the backing storage of ready pages after binding them into
    /// every current consumer view. After the first reclaim no new consumer
    /// view can be mapped.
    pub fn reclaim(&self, indices: &[u64]) -> Result<usize, RegionError> {
        self.check_active()?;
        for index in indices {
            if !self.slot(*index)?.state.is_ready() {
                return Err(RegionError::NotReclaimable(*index));
            }
        }
        if indices.is_empty() {
            return Ok(0);
        }

        // Held throughout so no view is mapped between binding and release.
        let mut consumers = self.consumers.lock().expect("Poisoned lock");
        self.check_active()?;
        consumers.retain(|view| view.strong_count() > 0);
        let views: Vec<Arc<PageView>> = consumers.iter().filter_map(Weak::upgrade).collect();
        if !self.views_closed.swap(true, Ordering::AcqRel) {
            info!("Reclaiming pages, no further consumer views can be mapped");
        }
        let mut reclaimed = 0;
        for index in indices {
            let index = utils::u64_to_usize(*index);
            let _waiters = self.slots[index].waiters.lock().expect("Poisoned lock");
            let backing = self.backing.read().expect("Poisoned lock");
            let store = backing.as_ref().ok_or(RegionError::TornDown)?;
            if store.is_reclaimed(index) {
                continue;
            }
            for view in &views {
                view.bind(index, store.page_slice(index)?)?;
            }
            store.punch_hole(index)?;
            reclaimed += 1;
        }

        self.metrics
            .pages_reclaimed
            .add(utils::usize_to_u64(reclaimed));
        Ok(reclaimed)
    }

    /// Converts the region into ordinary resident memory.
    ///
    /// Succeeds only if every page is ready. Every consumer view then holds
    /// all of its pages, the backing store and the request channel are
    /// released, and no further protocol operation is accepted.
    pub fn finalize(&self) -> Result<(), RegionError> {
        let consumers = self.consumers.lock().expect("Poisoned lock");
        self.check_active()?;

        let mut outstanding = OutstandingPages {
            count: 0,
            sample: Vec::new(),
        };
        for (index, slot) in self.slots.iter().enumerate() {
            if !slot.state.is_ready() {
                outstanding.count += 1;
                if outstanding.sample.len() < MAX_REPORTED_OUTSTANDING {
                    outstanding.sample.push(utils::usize_to_u64(index));
                }
            }
        }
        if outstanding.count > 0 {
            return Err(RegionError::NotReady(outstanding));
        }

        let views: Vec<Arc<PageView>> = consumers.iter().filter_map(Weak::upgrade).collect();
        for (index, slot) in self.slots.iter().enumerate() {
            let _waiters = slot.waiters.lock().expect("Poisoned lock");
            for view in &views {
                self.bind(view, index).map_err(|err| match err {
                    AccessError::Memory(err) => RegionError::Memory(err),
                    _ => RegionError::BackingStore(BackingStoreError::Reclaimed(index)),
                })?;
            }
        }

        if self
            .lifecycle
            .compare_exchange(
                Lifecycle::Active as u8,
                Lifecycle::Finalized as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            return Err(RegionError::TornDown);
        }
        drop(consumers);

        self.backing.write().expect("Poisoned lock").take();
        self.requests.close();
        info!(
            "Finalized post-copy region of {} pages into {} resident views",
            self.num_pages(),
            views.len()
        );
        Ok(())
    }

    /// Tears the region down. Every blocked caller is woken with
    /// [`AccessError::TornDown`] and every further operation fails.
    pub fn teardown(&self) {
        let previous = Lifecycle::from_raw(
            self.lifecycle
                .swap(Lifecycle::TornDown as u8, Ordering::AcqRel),
        );
        if previous == Lifecycle::TornDown {
            return;
        }

        self.requests.close();
        let mut woken = 0;
        for slot in self.slots.iter() {
            let waiters = slot.waiters.lock().expect("Poisoned lock");
            if *waiters > 0 {
                woken += *waiters;
                slot.ready.notify_all();
            }
        }
        self.backing.write().expect("Poisoned lock").take();

        self.metrics
            .teardown_wakeups
            .add(utils::usize_to_u64(woken));
        if woken > 0 {
            warn!("Region torn down with {} blocked waiters", woken);
        }
        info!("Tore down post-copy region (was {:?})", previous);
    }
}
