// Copyright 2025 Amazon.com, Inc. or its affiliates. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0

use std::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Population state of a single page.
///
/// The discriminants are ordered: a page only ever moves to a higher value,
/// `Unserved -> Pending -> Ready`, possibly skipping `Pending` when the
/// servicing process pushes the page before anybody faulted on it.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize)]
#[repr(u8)]
pub enum PageState {
    /// Nobody touched the page and no content was supplied yet.
    Unserved = 0,
    /// A consumer faulted on the page; content has been requested.
    Pending = 1,
    /// Content is in the backing store and may be bound into consumer views.
    Ready = 2,
}

impl PageState {
    fn from_raw(raw: u8) -> Self {
        match raw {
            0 => PageState::Unserved,
            1 => PageState::Pending,
            _ => PageState::Ready,
        }
    }
}

/// Lock-free state word of one page.
///
/// Transitions go through `fetch_max`, so the stored state can never regress
/// no matter how concurrent faults and ready notifications interleave.
#[derive(Debug)]
pub struct AtomicPageState(AtomicU8);

impl Default for AtomicPageState {
    fn default() -> Self {
        AtomicPageState(AtomicU8::new(PageState::Unserved as u8))
    }
}

impl AtomicPageState {
    /// Current state.
    #[inline]
    pub fn load(&self) -> PageState {
        PageState::from_raw(self.0.load(Ordering::Acquire))
    }

    /// Raises the state to at least `target` and returns the previous state.
    ///
    /// Returns the previous state unchanged when it was already at or above
    /// `target`.
    #[inline]
    pub fn advance(&self, target: PageState) -> PageState {
        PageState::from_raw(self.0.fetch_max(target as u8, Ordering::AcqRel))
    }

    /// Whether the page reached `Ready`.
    #[inline]
    pub fn is_ready(&self) -> bool {
        self.load() == PageState::Ready
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    #[test]
    fn test_transitions() {
        let state = AtomicPageState::default();
        assert_eq!(state.load(), PageState::Unserved);

        assert_eq!(state.advance(PageState::Pending), PageState::Unserved);
        assert_eq!(state.advance(PageState::Pending), PageState::Pending);
        assert_eq!(state.load(), PageState::Pending);

        assert_eq!(state.advance(PageState::Ready), PageState::Pending);
        assert!(state.is_ready());

        // No regression once ready.
        assert_eq!(state.advance(PageState::Pending), PageState::Ready);
        assert_eq!(state.advance(PageState::Unserved), PageState::Ready);
        assert!(state.is_ready());
    }

    #[test]
    fn test_push_skips_pending() {
        let state = AtomicPageState::default();
        assert_eq!(state.advance(PageState::Ready), PageState::Unserved);
        assert_eq!(state.advance(PageState::Pending), PageState::Ready);
        assert_eq!(state.load(), PageState::Ready);
    }

    fn any_state() -> impl Strategy<Value = PageState> {
        prop_oneof![
            Just(PageState::Unserved),
            Just(PageState::Pending),
            Just(PageState::Ready),
        ]
    }

    proptest! {
        #[test]
        fn test_observed_states_never_regress(targets in prop::collection::vec(any_state(), 0..32)) {
            let state = AtomicPageState::default();
            let mut observed = vec![state.load()];
            for target in targets {
                state.advance(target);
                observed.push(state.load());
            }
            prop_assert!(observed.windows(2).all(|w| w[0] <= w[1]));
        }
    }
}
