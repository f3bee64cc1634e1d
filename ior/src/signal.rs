// Copyright © 2021 VMware, Inc. All Rights Reserved.
// SPDX-License-Identifier: Apache-2.0 OR MIT

//! The flag shared between a fault thread and the observer.
//!
//! Raised means "a fault is in progress". The fault thread raises it before
//! doing anything else and the returned [`SignalGuard`] clears it again when
//! dropped, including while unwinding.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use log::warn;

#[derive(Debug, Default)]
struct State {
    raised: AtomicBool,
    raises: AtomicUsize,
    clears: AtomicUsize,
}

#[derive(Clone, Debug, Default)]
pub struct CoordinationSignal {
    state: Arc<State>,
}

impl CoordinationSignal {
    pub fn new() -> CoordinationSignal {
        Default::default()
    }

    /// Raises the signal until the guard is dropped.
    pub fn raise(&self) -> SignalGuard {
        if self
            .state
            .raised
            .compare_exchange(false, true, Ordering::SeqCst, Ordering::SeqCst)
            .is_err()
        {
            warn!("Coordination signal raised while already set");
        }
        self.state.raises.fetch_add(1, Ordering::SeqCst);
        SignalGuard {
            signal: self.clone(),
        }
    }

    pub fn is_set(&self) -> bool {
        self.state.raised.load(Ordering::SeqCst)
    }

    /// Sleeps in steps of `granularity` until the signal clears.
    ///
    /// Returns false if `deadline` passed first.
    pub fn wait_clear(&self, granularity: Duration, deadline: Option<Instant>) -> bool {
        while self.is_set() {
            if let Some(d) = deadline {
                if Instant::now() >= d {
                    return false;
                }
            }
            thread::sleep(granularity);
        }
        true
    }

    /// How often the signal was raised.
    pub fn raises(&self) -> usize {
        self.state.raises.load(Ordering::SeqCst)
    }

    /// How often the signal was cleared.
    pub fn clears(&self) -> usize {
        self.state.clears.load(Ordering::SeqCst)
    }
}

/// Clears its signal on drop.
#[derive(Debug)]
pub struct SignalGuard {
    signal: CoordinationSignal,
}

impl Drop for SignalGuard {
    fn drop(&mut self) {
        self.signal.state.raised.store(false, Ordering::SeqCst);
        self.signal.state.clears.fetch_add(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn guard_clears() {
        let signal = CoordinationSignal::new();
        assert!(!signal.is_set());
        {
            let _g = signal.raise();
            assert!(signal.is_set());
        }
        assert!(!signal.is_set());
        assert_eq!((signal.raises(), signal.clears()), (1, 1));
    }

    #[test]
    fn guard_clears_on_unwind() {
        let signal = CoordinationSignal::new();
        let s = signal.clone();
        let r = thread::spawn(move || {
            let _g = s.raise();
            panic!("fault operation blew up");
        })
        .join();
        assert!(r.is_err());
        assert!(!signal.is_set());
        assert_eq!(signal.clears(), 1);
    }

    #[test]
    fn wait_clear_deadline() {
        let signal = CoordinationSignal::new();
        let _g = signal.raise();
        let deadline = Instant::now() + Duration::from_millis(20);
        assert!(!signal.wait_clear(Duration::from_millis(1), Some(deadline)));
    }

    #[test]
    fn wait_clear_returns_once_cleared() {
        let signal = CoordinationSignal::new();
        let g = signal.raise();
        let s = signal.clone();
        let waiter = thread::spawn(move || s.wait_clear(Duration::from_millis(1), None));
        thread::sleep(Duration::from_millis(10));
        drop(g);
        assert!(waiter.join().unwrap());
    }
}
