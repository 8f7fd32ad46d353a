// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Counters describing the protocol traffic of a region.
//!
//! All counters are plain atomics and are safe to bump from the fault path
//! of any consumer thread. They serialize as JSON numbers.

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Serialize, Serializer};

/// A monotonically increasing counter that can be shared between threads.
#[derive(Debug, Default)]
pub struct SharedIncMetric(AtomicU64);

impl SharedIncMetric {
    /// Adds 1 to the counter.
    #[inline]
    pub fn inc(&self) {
        self.add(1);
    }

    /// Adds `value` to the counter.
    #[inline]
    pub fn add(&self, value: u64) {
        self.0.fetch_add(value, Ordering::Relaxed);
    }

    /// Current value.
    #[inline]
    pub fn count(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }
}

impl Serialize for SharedIncMetric {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u64(self.count())
    }
}

/// Metrics of one region.
#[derive(Debug, Default, Serialize)]
pub struct RegionMetrics {
    /// Accesses that reached the fault path.
    pub faults: SharedIncMetric,
    /// Faults on pages that were already ready.
    pub fast_path_hits: SharedIncMetric,
    /// Faults that had to wait for a ready notification.
    pub blocked_faults: SharedIncMetric,
    /// Pages appended to the request queue.
    pub requests_queued: SharedIncMetric,
    /// Page requests handed to the servicing process.
    pub requests_delivered: SharedIncMetric,
    /// Queued requests dropped because the page became ready first.
    pub requests_skipped: SharedIncMetric,
    /// Pending pages made ready.
    pub pages_served: SharedIncMetric,
    /// Unserved pages made ready before anybody asked for them.
    pub pages_pushed: SharedIncMetric,
    /// Ready entries naming a page that was already ready.
    pub redundant_ready: SharedIncMetric,
    /// Ready batches rejected as malformed.
    pub rejected_batches: SharedIncMetric,
    /// Waiters woken by a ready transition.
    pub waiters_woken: SharedIncMetric,
    /// Waiters woken with an error by teardown.
    pub teardown_wakeups: SharedIncMetric,
    /// Backing store pages released after binding.
    pub pages_reclaimed: SharedIncMetric,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_shared_inc_metric() {
        let metric = SharedIncMetric::default();
        assert_eq!(metric.count(), 0);
        metric.inc();
        metric.add(5);
        assert_eq!(metric.count(), 6);
    }

    #[test]
    fn test_serialize_metrics() {
        let metrics = RegionMetrics::default();
        metrics.faults.add(3);
        metrics.pages_pushed.inc();

        let json = serde_json::to_value(&metrics).unwrap();
        assert_eq!(json["faults"], 3);
        assert_eq!(json["pages_pushed"], 1);
        assert_eq!(json["blocked_faults"], 0);
    }
}
