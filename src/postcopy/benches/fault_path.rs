// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0
//
// Benchmarking cases:
//   * `ConsumerMapping.touch` on bound and on ready-but-unbound pages
//   * request/ready round trip through the request queue

use criterion::{BatchSize, Criterion, criterion_group, criterion_main};
use postcopy::{PollMode, Region, RegionConfig};

const PAGE_SIZE: usize = 4096;
const NUM_PAGES: usize = 256;

fn region_config() -> RegionConfig {
    RegionConfig {
        page_size: PAGE_SIZE,
        ..Default::default()
    }
}

pub fn fault_path_benchmark(c: &mut Criterion) {
    let init = Region::initialize(region_config(), NUM_PAGES * PAGE_SIZE).unwrap();
    let indices: Vec<u64> = (0..NUM_PAGES as u64).collect();
    init.region.mark_ready(&indices).unwrap();
    let consumer = init.region.map_consumer().unwrap();
    consumer.touch(0).unwrap();

    c.bench_function("touch_bound", |b| {
        b.iter(|| consumer.touch(std::hint::black_box(0)).unwrap())
    });

    c.bench_function("touch_ready_unbound", |b| {
        b.iter_batched(
            || init.region.map_consumer().unwrap(),
            |view| view.touch(std::hint::black_box(1)).unwrap(),
            BatchSize::SmallInput,
        )
    });

    c.bench_function("request_ready_round_trip", |b| {
        b.iter_batched(
            || {
                let init = Region::initialize(region_config(), NUM_PAGES * PAGE_SIZE).unwrap();
                let consumer = init.region.map_consumer().unwrap();
                (init, consumer)
            },
            |(init, consumer)| {
                for index in 0..NUM_PAGES {
                    consumer.try_touch(index).unwrap();
                }
                let batch = init
                    .region
                    .consume_requests(NUM_PAGES, PollMode::NonBlocking)
                    .unwrap();
                init.region.mark_ready(&batch).unwrap();
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group! {
    name = fault_path_benches;
    config = Criterion::default().sample_size(200).noise_threshold(0.05);
    targets = fault_path_benchmark
}

criterion_main! {
    fault_path_benches
}
