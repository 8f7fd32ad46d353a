// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use log::debug;
use postcopy::{AccessError, ConsumerMapping, FaultOutcome};

use crate::source::{PageSource, SourceError};

/// Errors associated with a simulated consumer.
#[rustfmt::skip]
#[derive(Debug, thiserror::Error, displaydoc::Display)]
pub enum WorkloadError {
    /// Consumer {0} hit a fatal access fault: {1}
    Access(usize, AccessError),
    /// Consumer {0} read page {1} with checksum {2:#x}, expected {3:#x}
    Mismatch(usize, usize, u64, u64),
    /// {0}
    Source(#[from] SourceError),
}

/// What one consumer observed.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct ConsumerReport {
    /// Pages read and verified.
    pub pages: usize,
    /// Reads that had to wait for the servicing process.
    pub blocked: usize,
}

/// Visits every page of `num_pages` exactly once, starting at a position and
/// with a stride derived from `seed`, so concurrent consumers fault in
/// different orders.
pub fn access_order(num_pages: usize, seed: usize) -> Vec<usize> {
    if num_pages == 0 {
        return Vec::new();
    }
    let start = seed.wrapping_mul(7919) % num_pages;
    let mut stride = (2 * seed + 1) % num_pages;
    while stride == 0 || gcd(stride, num_pages) != 1 {
        stride = stride % num_pages + 1;
    }
    (0..num_pages)
        .map(|step| (start + step * stride) % num_pages)
        .collect()
}

fn gcd(mut a: usize, mut b: usize) -> usize {
    while b != 0 {
        (a, b) = (b, a % b);
    }
    a
}

/// Reads every page of `mapping` in the order given by `id` and checks its
/// content against `source`.
pub fn run_consumer(
    id: usize,
    mapping: &ConsumerMapping,
    source: &PageSource,
) -> Result<ConsumerReport, WorkloadError> {
    let page_size = mapping.region().page_size();
    let num_pages = mapping.region().num_pages();
    let mut page = vec![0u8; page_size];
    let mut report = ConsumerReport::default();

    for index in access_order(num_pages, id) {
        if mapping
            .touch(index)
            .map_err(|err| WorkloadError::Access(id, err))?
            == FaultOutcome::Blocked
        {
            report.blocked += 1;
        }
        mapping
            .read(index * page_size, &mut page)
            .map_err(|err| WorkloadError::Access(id, err))?;

        let actual = crc64::crc64(0, &page);
        let expected = source.page_crc(index, page_size)?;
        if actual != expected {
            return Err(WorkloadError::Mismatch(id, index, actual, expected));
        }
        report.pages += 1;
    }

    debug!(
        "Consumer {} verified {} pages, {} blocked",
        id, report.pages, report.blocked
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_access_order_is_permutation() {
        for num_pages in [1, 2, 7, 8, 64, 100] {
            for seed in 0..5 {
                let mut order = access_order(num_pages, seed);
                order.sort_unstable();
                assert_eq!(order, (0..num_pages).collect::<Vec<_>>());
            }
        }
        assert!(access_order(0, 3).is_empty());
        assert_ne!(access_order(64, 1), access_order(64, 2));
    }

    #[test]
    fn test_gcd() {
        assert_eq!(gcd(12, 18), 6);
        assert_eq!(gcd(7, 64), 1);
        assert_eq!(gcd(5, 0), 5);
    }
}
