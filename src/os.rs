//! OS primitives consumed by the engine.
//!
//! The engine never owns a scheduler.  It only needs a millisecond clock, a way
//! to sleep or yield, and an event object that one context can signal and
//! another can wait on with a timeout.  The application provides these through
//! [`Os`].
//!
//! Locks are not part of this trait.  Channel locks and init mutexes are
//! `spin::Mutex`es, held only for short, bounded sections.

// Copyright (C) 2025 Piers Finlayson <piers@piers.rocks>
//
// MIT License

use spin::{Mutex, MutexGuard};

use crate::{Error, Result};

/// Signalable event with timed wait.
pub trait Event: Send + Sync {
    /// Signal the event, waking every waiter.
    fn set(&self);

    /// Clear the signalled state.
    fn reset(&self);

    /// Wait until the event is signalled or `timeout_ms` elapses.
    ///
    /// Returns `true` if the event was signalled.  Does not clear the
    /// signalled state.
    fn wait(&self, timeout_ms: u32) -> bool;
}

/// OS binding.
pub trait Os: Send + Sync {
    /// The event type produced by [`Os::create_event`]
    type Event: Event;

    /// Monotonic millisecond tick counter.
    fn tick_ms(&self) -> u64;

    /// Sleep for `ms` milliseconds.  `0` yields the CPU.
    fn sleep_ms(&self, ms: u32);

    /// Create a new, unsignalled event.
    fn create_event(&self) -> Self::Event;
}

/// Milliseconds elapsed since `start`
pub(crate) fn elapsed_ms<O: Os>(os: &O, start: u64) -> u64 {
    os.tick_ms().saturating_sub(start)
}

/// True once a wait that began at `start` should give up.
///
/// The tick is whole milliseconds, so a reading equal to `timeout_ms` can be
/// up to a millisecond short of it.  Only a strictly greater reading counts.
/// A zero timeout is a single check and is always over.
pub(crate) fn timed_out<O: Os>(os: &O, start: u64, timeout_ms: u32) -> bool {
    timeout_ms == 0 || elapsed_ms(os, start) > timeout_ms as u64
}

/// Milliseconds left of `timeout_ms`, for handing to [`Event::wait`].  Never
/// zero, so a wait always blocks for at least a tick.
pub(crate) fn remaining_ms<O: Os>(os: &O, start: u64, timeout_ms: u32) -> u32 {
    (timeout_ms as u64)
        .saturating_sub(elapsed_ms(os, start))
        .max(1) as u32
}

/// Acquire `lock`, polling once per millisecond until `timeout_ms` has
/// elapsed.
pub(crate) fn lock_timeout<'a, O: Os, T>(
    os: &O,
    lock: &'a Mutex<T>,
    timeout_ms: u32,
) -> Result<MutexGuard<'a, T>> {
    let start = os.tick_ms();
    loop {
        if let Some(guard) = lock.try_lock() {
            return Ok(guard);
        }
        if timed_out(os, start, timeout_ms) {
            return Err(Error::Busy);
        }
        os.sleep_ms(1);
    }
}

#[cfg(any(test, feature = "std"))]
pub use self::std_os::{StdEvent, StdOs};

#[cfg(any(test, feature = "std"))]
mod std_os {
    use std::sync::{Condvar, Mutex, PoisonError};
    use std::time::{Duration, Instant};

    use super::{Event, Os};

    /// [`Os`] implementation using `std`.
    #[derive(Debug, Clone, Copy)]
    pub struct StdOs {
        start: Instant,
    }

    impl StdOs {
        /// Create a new instance.  Ticks count from this point.
        pub fn new() -> Self {
            Self {
                start: Instant::now(),
            }
        }
    }

    impl Default for StdOs {
        fn default() -> Self {
            Self::new()
        }
    }

    impl Os for StdOs {
        type Event = StdEvent;

        fn tick_ms(&self) -> u64 {
            self.start.elapsed().as_millis() as u64
        }

        fn sleep_ms(&self, ms: u32) {
            if ms == 0 {
                std::thread::yield_now();
            } else {
                std::thread::sleep(Duration::from_millis(ms as u64));
            }
        }

        fn create_event(&self) -> StdEvent {
            StdEvent::default()
        }
    }

    /// Manual-reset event built on a `Condvar`.
    #[derive(Debug, Default)]
    pub struct StdEvent {
        signalled: Mutex<bool>,
        cond: Condvar,
    }

    impl Event for StdEvent {
        fn set(&self) {
            let mut signalled = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
            *signalled = true;
            self.cond.notify_all();
        }

        fn reset(&self) {
            *self.signalled.lock().unwrap_or_else(PoisonError::into_inner) = false;
        }

        fn wait(&self, timeout_ms: u32) -> bool {
            let guard = self.signalled.lock().unwrap_or_else(PoisonError::into_inner);
            let (guard, _) = self
                .cond
                .wait_timeout_while(guard, Duration::from_millis(timeout_ms as u64), |s| !*s)
                .unwrap_or_else(PoisonError::into_inner);
            *guard
        }
    }
}
