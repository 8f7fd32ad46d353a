// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::Arc;
use std::thread;
use std::time::Duration;

use itertools::Itertools;
use postcopy::{
    ConsumerMapping, FaultOutcome, PageState, PollMode, Region, RegionConfig, RegionError,
    RegionInit,
};
use proptest::prelude::*;

const PAGE_SIZE: usize = 4096;

fn new_region(num_pages: usize) -> RegionInit {
    let config = RegionConfig {
        page_size: PAGE_SIZE,
        ..Default::default()
    };
    Region::initialize(config, num_pages * PAGE_SIZE).unwrap()
}

fn wait_until<F: Fn() -> bool>(condition: F) {
    while !condition() {
        thread::sleep(Duration::from_millis(1));
    }
}

fn fill_page(init: &RegionInit, index: u64) {
    let byte = u8::try_from(index % 251).unwrap() + 1;
    init.backing_store
        .write_page(usize::try_from(index).unwrap(), &vec![byte; PAGE_SIZE])
        .unwrap();
}

fn drain_requests(region: &Region) -> Vec<u64> {
    let mut all = Vec::new();
    loop {
        match region.consume_requests(64, PollMode::NonBlocking) {
            Ok(batch) => all.extend(batch),
            Err(RegionError::WouldBlock) => return all,
            Err(err) => panic!("unexpected error: {err}"),
        }
    }
}

// Scenario A: a proactively pushed page never blocks.
#[test]
fn test_proactive_push_does_not_block() {
    let init = new_region(8);
    let consumer = init.region.map_consumer().unwrap();

    fill_page(&init, 0);
    let report = init.region.mark_ready(&[0]).unwrap();
    assert_eq!(report.pushed, 1);

    assert_eq!(consumer.touch(0).unwrap(), FaultOutcome::Immediate);
    assert_eq!(consumer.read_obj::<u8>(0).unwrap(), 1);
    assert_eq!(init.region.metrics().blocked_faults.count(), 0);
    assert_eq!(init.region.pending_requests(), 0);
}

// Scenario B: faults are requested once each, in first-fault order, and only the
// callers of pages marked ready wake up.
#[test]
fn test_first_fault_order_and_partial_wakeup() {
    let init = new_region(8);
    let consumer = Arc::new(init.region.map_consumer().unwrap());
    fill_page(&init, 0);
    init.region.mark_ready(&[0]).unwrap();

    let order = [7u64, 1, 6, 2, 0, 5, 3, 4];
    let mut callers = Vec::new();
    for index in order {
        let consumer = consumer.clone();
        callers.push((
            index,
            thread::spawn(move || consumer.touch(usize::try_from(index).unwrap())),
        ));
        // Serialize first faults so the order is deterministic.
        wait_until(|| init.region.page_state(index).unwrap() != PageState::Unserved);
    }

    let mut requested = Vec::new();
    while requested.len() < 7 {
        requested.extend(init.region.consume_requests(3, PollMode::Blocking).unwrap());
    }
    assert_eq!(requested, vec![7, 1, 6, 2, 5, 3, 4]);
    assert!(matches!(
        init.region.consume_requests(8, PollMode::NonBlocking),
        Err(RegionError::WouldBlock)
    ));

    for index in [7, 2, 3] {
        wait_until(|| init.region.waiter_count(index).unwrap() == 1);
        fill_page(&init, index);
    }
    assert_eq!(init.region.mark_ready(&[7, 2, 3]).unwrap().served, 3);

    let (woken, blocked): (Vec<_>, Vec<_>) = callers
        .into_iter()
        .partition(|(index, _)| [0, 7, 2, 3].contains(index));
    for (index, caller) in woken {
        let outcome = caller.join().unwrap().unwrap();
        let expected = if index == 0 {
            FaultOutcome::Immediate
        } else {
            FaultOutcome::Blocked
        };
        assert_eq!(outcome, expected);
    }

    for (index, caller) in &blocked {
        assert!(!caller.is_finished());
        assert_eq!(init.region.page_state(*index).unwrap(), PageState::Pending);
        assert_eq!(init.region.waiter_count(*index).unwrap(), 1);
    }

    let rest = blocked.iter().map(|(index, _)| *index).collect_vec();
    for index in &rest {
        fill_page(&init, *index);
    }
    init.region.mark_ready(&rest).unwrap();
    for (index, caller) in blocked {
        assert_eq!(caller.join().unwrap().unwrap(), FaultOutcome::Blocked);
        let expected = u8::try_from(index).unwrap() + 1;
        assert_eq!(
            consumer
                .read_obj::<u8>(usize::try_from(index).unwrap() * PAGE_SIZE)
                .unwrap(),
            expected
        );
    }
    init.region.finalize().unwrap();
}

// Scenario C: two callers on the same page share one request and one wakeup.
#[test]
fn test_concurrent_faults_share_one_request() {
    let init = new_region(8);
    let consumer = init.region.map_consumer().unwrap();
    fill_page(&init, 3);

    thread::scope(|s| {
        let first = s.spawn(|| consumer.touch(3));
        let second = s.spawn(|| consumer.touch(3));
        wait_until(|| init.region.waiter_count(3).unwrap() == 2);

        assert_eq!(
            init.region
                .consume_requests(8, PollMode::NonBlocking)
                .unwrap(),
            vec![3]
        );
        assert_eq!(init.region.mark_ready(&[3]).unwrap().served, 1);

        assert_eq!(first.join().unwrap().unwrap(), FaultOutcome::Blocked);
        assert_eq!(second.join().unwrap().unwrap(), FaultOutcome::Blocked);
    });

    assert_eq!(init.region.waiter_count(3).unwrap(), 0);
    assert_eq!(consumer.touch(3).unwrap(), FaultOutcome::Immediate);
    assert_eq!(consumer.read_obj::<u8>(3 * PAGE_SIZE).unwrap(), 4);
    assert_eq!(init.region.metrics().waiters_woken.count(), 2);
}

#[test]
fn test_many_concurrent_faults_dedup() {
    const CALLERS: usize = 16;
    let init = new_region(4);
    let consumer = init.region.map_consumer().unwrap();

    thread::scope(|s| {
        let callers = (0..CALLERS)
            .map(|_| s.spawn(|| consumer.touch(1)))
            .collect_vec();
        wait_until(|| init.region.waiter_count(1).unwrap() == CALLERS);

        assert_eq!(drain_requests(&init.region), vec![1]);
        init.region.mark_ready(&[1]).unwrap();
        for caller in callers {
            assert_eq!(caller.join().unwrap().unwrap(), FaultOutcome::Blocked);
        }
    });

    assert_eq!(init.region.metrics().requests_queued.count(), 1);
    assert!(drain_requests(&init.region).is_empty());
}

#[test]
fn test_waiters_see_complete_content() {
    const PAGES: usize = 32;
    let init = new_region(PAGES);
    let consumers = (0..4)
        .map(|_| init.region.map_consumer().unwrap())
        .collect_vec();

    thread::scope(|s| {
        let readers = consumers
            .iter()
            .map(|consumer: &ConsumerMapping| {
                s.spawn(move || {
                    let mut page = vec![0u8; PAGE_SIZE];
                    for index in (0..PAGES).rev() {
                        consumer.read(index * PAGE_SIZE, &mut page).unwrap();
                        let expected = u8::try_from(index % 251).unwrap() + 1;
                        assert!(page.iter().all(|b| *b == expected));
                    }
                })
            })
            .collect_vec();

        let mut served = 0;
        while served < PAGES {
            let batch = match init.region.consume_requests(4, PollMode::NonBlocking) {
                Ok(batch) => batch,
                Err(RegionError::WouldBlock) => {
                    // Push ahead while nobody is asking.
                    let next = (0..PAGES as u64)
                        .find(|i| init.region.page_state(*i).unwrap() == PageState::Unserved);
                    next.into_iter().collect()
                }
                Err(err) => panic!("unexpected error: {err}"),
            };
            for index in &batch {
                fill_page(&init, *index);
            }
            served += init.region.mark_ready(&batch).unwrap().transitioned();
        }

        for reader in readers {
            reader.join().unwrap();
        }
    });

    init.region.finalize().unwrap();
}

#[test]
fn test_finalize_totality() {
    for missing in 0..6u64 {
        let init = new_region(6);
        let others = (0..6).filter(|i| *i != missing).collect_vec();
        init.region.mark_ready(&others).unwrap();

        let Err(RegionError::NotReady(outstanding)) = init.region.finalize() else {
            panic!("finalize succeeded with page {missing} outstanding");
        };
        assert_eq!(outstanding.count, 1);
        assert_eq!(outstanding.sample, vec![missing]);

        init.region.mark_ready(&[missing]).unwrap();
        init.region.finalize().unwrap();
    }
}

#[test]
fn test_finalize_after_reclaim() {
    let init = new_region(2);
    let consumer = init.region.map_consumer().unwrap();
    fill_page(&init, 0);
    fill_page(&init, 1);
    init.region.mark_ready(&[0, 1]).unwrap();
    assert_eq!(init.region.reclaim(&[0]).unwrap(), 1);

    // A view mapped now could never be populated with page 0.
    assert!(matches!(
        init.region.map_consumer(),
        Err(RegionError::ViewsClosed)
    ));
    for index in 0..2 {
        assert_eq!(init.region.page_state(index).unwrap(), PageState::Ready);
    }

    init.region.finalize().unwrap();
    assert_eq!(consumer.read_obj::<u8>(0).unwrap(), 1);
    assert_eq!(consumer.read_obj::<u8>(PAGE_SIZE).unwrap(), 2);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    #[test]
    fn test_requests_are_fifo_and_unique(accesses in prop::collection::vec(0usize..16, 0..64)) {
        let init = new_region(16);
        let consumer = init.region.map_consumer().unwrap();
        for index in &accesses {
            prop_assert_eq!(consumer.try_touch(*index).unwrap(), FaultOutcome::WouldBlock);
        }

        let expected = accesses.iter().map(|i| *i as u64).unique().collect_vec();
        prop_assert_eq!(drain_requests(&init.region), expected.clone());

        let report = init.region.mark_ready(&expected).unwrap();
        prop_assert_eq!(report.served, expected.len());
        for index in &accesses {
            prop_assert_eq!(consumer.try_touch(*index).unwrap(), FaultOutcome::Immediate);
        }
    }

    #[test]
    fn test_states_never_regress(ops in prop::collection::vec((any::<bool>(), 0u64..8), 0..48)) {
        let init = new_region(8);
        let consumer = init.region.map_consumer().unwrap();
        let mut last = vec![PageState::Unserved; 8];
        for (ready, index) in ops {
            if ready {
                init.region.mark_ready(&[index]).unwrap();
            } else {
                consumer.try_touch(usize::try_from(index).unwrap()).unwrap();
            }
            for (page, previous) in last.iter_mut().enumerate() {
                let state = init.region.page_state(page as u64).unwrap();
                prop_assert!(state >= *previous);
                *previous = state;
            }
        }
    }
}
