// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

//! Small helpers shared by the post-copy crates: lossless integer conversions
//! and page-granular size arithmetic.

/// Safely converts a u64 value to a usize value.
/// This bypasses the Clippy lint check because we only support 64-bit platforms.
#[cfg(target_pointer_width = "64")]
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub const fn u64_to_usize(num: u64) -> usize {
    num as usize
}

/// Safely converts a usize value to a u64 value.
/// This bypasses the Clippy lint check because we only support 64-bit platforms.
#[cfg(target_pointer_width = "64")]
#[inline]
#[allow(clippy::cast_possible_truncation)]
pub const fn usize_to_u64(num: usize) -> u64 {
    num as u64
}

/// Returns the page size of the host, as reported by `sysconf(_SC_PAGESIZE)`.
///
/// Falls back to 4 KiB if the query fails.
pub fn host_page_size() -> usize {
    // SAFETY: sysconf has no memory safety preconditions.
    let size = unsafe { libc::sysconf(libc::_SC_PAGESIZE) };
    usize::try_from(size).ok().filter(|s| *s > 0).unwrap_or(4096)
}

/// Whether `value` is a multiple of `align`. `align` must be a power of two.
#[inline]
pub const fn is_aligned(value: u64, align: u64) -> bool {
    value & (align - 1) == 0
}

/// Rounds `value` up to the next multiple of `align`, `None` on overflow.
/// `align` must be a power of two.
#[inline]
pub const fn align_up(value: usize, align: usize) -> Option<usize> {
    match value.checked_add(align - 1) {
        Some(v) => Some(v & !(align - 1)),
        None => None,
    }
}

/// Rounds `value` down to the previous multiple of `align`.
/// `align` must be a power of two.
#[inline]
pub const fn align_down(value: usize, align: usize) -> usize {
    value & !(align - 1)
}

/// Range of page indices covered by `len` bytes starting at `offset`.
pub fn page_range(offset: usize, len: usize, page_size: usize) -> std::ops::Range<usize> {
    let first = offset / page_size;
    let end = offset.saturating_add(len).div_ceil(page_size);
    first..end.max(first)
}
