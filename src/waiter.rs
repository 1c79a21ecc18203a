//! Blocking waits built on asynchronous completions.

use crate::error::Outcome;
use parking_lot::{Condvar, Mutex};
use std::{
    sync::Arc,
    time::{Duration, Instant},
};

/// A counting wake-up point a thread can block on until some asynchronous
/// completion signals it.
///
/// Cloned waiters share the same count.
#[derive(Clone, Default)]
pub struct Waiter {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    state: Mutex<State>,
    cond: Condvar,
}

#[derive(Default)]
struct State {
    wakes: u32,
    interrupts: u32,
}

impl Waiter {
    /// Creates a waiter with no pending wakes.
    pub fn new() -> Self {
        Self::default()
    }

    /// Posts one wake.
    pub fn wake(&self) {
        let mut state = self.inner.state.lock();
        state.wakes += 1;
        self.inner.cond.notify_all();
    }

    /// Posts an interruption. The next [`Waiter::wait_intr`] returns
    /// [`Outcome::Interrupted`]; plain [`Waiter::wait`] ignores it.
    pub fn interrupt(&self) {
        let mut state = self.inner.state.lock();
        state.interrupts += 1;
        self.inner.cond.notify_all();
    }

    /// Blocks until `count` wakes have been posted, then consumes them.
    ///
    /// On timeout no wakes are consumed.
    pub fn wait(&self, count: u32, timeout: Option<Duration>) -> Outcome<()> {
        self.wait_inner(count, timeout, false)
    }

    /// Like [`Waiter::wait`], but also returns early when interrupted.
    pub fn wait_intr(&self, count: u32, timeout: Option<Duration>) -> Outcome<()> {
        self.wait_inner(count, timeout, true)
    }

    fn wait_inner(&self, count: u32, timeout: Option<Duration>, intr: bool) -> Outcome<()> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.inner.state.lock();
        loop {
            if state.wakes >= count {
                state.wakes -= count;
                return Outcome::Ready(());
            }
            if intr && state.interrupts > 0 {
                state.interrupts -= 1;
                return Outcome::Interrupted;
            }
            match deadline {
                None => self.inner.cond.wait(&mut state),
                Some(deadline) => {
                    if self.inner.cond.wait_until(&mut state, deadline).timed_out()
                        && state.wakes < count
                    {
                        return Outcome::TimedOut;
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;

    #[test]
    fn wake_before_wait() {
        let w = Waiter::new();
        w.wake();
        assert_eq!(w.wait(1, None), Outcome::Ready(()));
    }

    #[test]
    fn timeout_consumes_nothing() {
        let w = Waiter::new();
        w.wake();
        assert_eq!(w.wait(2, Some(Duration::from_millis(10))), Outcome::TimedOut);
        w.wake();
        assert_eq!(w.wait(2, Some(Duration::ZERO)), Outcome::Ready(()));
    }

    #[test]
    fn interrupt_only_seen_by_wait_intr() {
        let w = Waiter::new();
        w.interrupt();
        assert_eq!(w.wait(1, Some(Duration::from_millis(5))), Outcome::TimedOut);
        assert_eq!(w.wait_intr(1, None), Outcome::Interrupted);
    }

    #[test]
    fn cross_thread_wake() {
        let w = Waiter::new();
        let w2 = w.clone();
        let t = thread::spawn(move || w2.wake());
        assert_eq!(w.wait(1, Some(Duration::from_secs(5))), Outcome::Ready(()));
        t.join().unwrap();
    }
}
