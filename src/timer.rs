//! MAC Timer API
//
// Copyright 2021 Ryan Kurte

use crate::Ts;

/// Timer trait provides the monotonic time base for NAV countdowns,
/// backoff windows and guard intervals.
///
/// All methods are monotonic and relative to the same unknown epoc,
/// no synchronisation between nodes is assumed.
pub trait Timer {
    /// Returns the number of millisecond ticks since some unknown epoc
    fn ticks_ms(&self) -> Ts;
}

#[cfg(any(test, feature="mocks"))]
pub mod mock {
    use std::sync::{Arc, Mutex};

    use crate::Ts;

    /// Mock timer implementation to assist with testing,
    /// clones share the same underlying time
    #[derive(Clone, Debug)]
    pub struct MockTimer (Arc<Mutex<Ts>>);

    impl MockTimer {
        pub fn new() -> Self {
            Self(Arc::new(Mutex::new(0)))
        }

        pub fn set_ms(&mut self, val: Ts) {
            *self.0.lock().unwrap() = val;
        }

        pub fn advance(&mut self, ms: Ts) {
            let mut v = self.0.lock().unwrap();
            *v += ms;
        }

        pub fn val(&self) -> Ts {
            *self.0.lock().unwrap()
        }
    }

    impl Default for MockTimer {
        fn default() -> Self {
            Self::new()
        }
    }

    impl super::Timer for MockTimer {
        fn ticks_ms(&self) -> Ts {
            *self.0.lock().unwrap()
        }
    }
}
