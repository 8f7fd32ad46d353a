// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use serde::{Deserialize, Serialize};

/// Smallest page size a region may be configured with.
pub const MIN_PAGE_SIZE: usize = 512;
/// Default upper bound on the size of a single region (64 GiB).
pub const DEFAULT_MAX_REGION_SIZE: usize = 64 << 30;
/// Default upper bound on the number of entries returned by one request read.
pub const DEFAULT_MAX_REQUEST_BATCH: usize = 512;

/// Errors associated with region configuration.
#[rustfmt::skip]
#[derive(Debug, PartialEq, Eq, thiserror::Error, displaydoc::Display)]
pub enum ConfigError {
    /// Page size {0} is not a power of two of at least 512 bytes
    PageSize(usize),
    /// Maximum region size {0:#x} is smaller than one page
    MaxRegionSize(usize),
    /// The request batch size must be non-zero
    RequestBatch,
    /// Cannot parse region configuration: {0}
    Parse(String),
}

fn default_page_size() -> usize {
    utils::host_page_size()
}

fn default_max_region_size() -> usize {
    DEFAULT_MAX_REGION_SIZE
}

fn default_max_request_batch() -> usize {
    DEFAULT_MAX_REQUEST_BATCH
}

fn default_seal_backing_store() -> bool {
    true
}

/// Strongly typed data structure used to configure a post-copy region.
#[derive(Clone, Debug, PartialEq, Eq, Deserialize, Serialize)]
#[serde(deny_unknown_fields)]
pub struct RegionConfig {
    /// Granularity of population and state tracking, in bytes.
    #[serde(default = "default_page_size")]
    pub page_size: usize,
    /// Requests for regions larger than this are rejected.
    #[serde(default = "default_max_region_size")]
    pub max_region_size: usize,
    /// Maximum number of page requests handed out by a single read.
    #[serde(default = "default_max_request_batch")]
    pub max_request_batch: usize,
    /// Seal the backing memfd against resizing once it is created.
    #[serde(default = "default_seal_backing_store")]
    pub seal_backing_store: bool,
}

impl Default for RegionConfig {
    fn default() -> Self {
        RegionConfig {
            page_size: default_page_size(),
            max_region_size: default_max_region_size(),
            max_request_batch: default_max_request_batch(),
            seal_backing_store: default_seal_backing_store(),
        }
    }
}

impl RegionConfig {
    /// Parses and validates a JSON configuration.
    pub fn from_json(raw: &str) -> Result<Self, ConfigError> {
        let config: RegionConfig =
            serde_json::from_str(raw).map_err(|err| ConfigError::Parse(err.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    /// Checks that the configuration describes a usable region.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.page_size.is_power_of_two() || self.page_size < MIN_PAGE_SIZE {
            return Err(ConfigError::PageSize(self.page_size));
        }
        if self.max_region_size < self.page_size {
            return Err(ConfigError::MaxRegionSize(self.max_region_size));
        }
        if self.max_request_batch == 0 {
            return Err(ConfigError::RequestBatch);
        }
        Ok(())
    }
}
