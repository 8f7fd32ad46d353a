// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Post-copy memory regions.
//!
//! A [`Region`] is a memory area whose pages are populated on demand by an
//! external servicing process instead of by normal paging. Consumers access
//! the region through [`ConsumerMapping`]s; an access to a page that is not
//! ready yet requests the page from the servicing process and blocks until
//! the page is marked ready. The servicing process drains requests with
//! [`Region::consume_requests`], writes the content into the
//! [`BackingStore`] and acknowledges it with [`Region::mark_ready`], possibly
//! pushing pages nobody asked for yet. Once every page is ready,
//! [`Region::finalize`] turns the region into plain resident memory.

/// Page-granular shared storage written by the servicing process.
pub mod backing_store;
/// Request queue and ready-batch codec.
pub mod channel;
/// Region configuration.
pub mod config;
/// Consumer and servicing views of a region.
pub mod mapping;
/// Protocol counters.
pub mod metrics;
/// Per-page population state.
pub mod page_state;
/// The region manager.
pub mod region;

pub use crate::backing_store::{BackingStore, BackingStoreError};
pub use crate::channel::{ChannelError, PollMode, ProtocolViolation};
pub use crate::config::{ConfigError, RegionConfig};
pub use crate::mapping::{AccessError, ConsumerMapping, MapMode, Mapping, ServicingMapping};
pub use crate::metrics::RegionMetrics;
pub use crate::page_state::PageState;
pub use crate::region::{
    BackingStoreHandle, ErrorKind, FaultOutcome, Lifecycle, OutstandingPages, ReadyKind,
    ReadyReport, Region, RegionError, RegionInit,
};

/// Creates a region of at least `size` bytes.
///
/// Returns the region, the handle the servicing process fills the backing
/// store through, and the size rounded up to a whole number of pages.
pub fn init(
    config: RegionConfig,
    size: usize,
) -> Result<(std::sync::Arc<Region>, BackingStoreHandle, usize), RegionError> {
    let RegionInit {
        region,
        backing_store,
        actual_size,
    } = Region::initialize(config, size)?;
    Ok((region, backing_store, actual_size))
}
