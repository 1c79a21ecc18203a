//! Deferred operations: the one way a provider reaches user code.
//!
//! A provider never calls an open/close completion or an event handler while
//! it holds its own lock, and never from inside the public call that caused
//! it. Instead it arms its single deferred-operation token with [`start`];
//! the scheduler later calls [`Deferred::step`] repeatedly, under the lock,
//! until it reports [`Step::Idle`]. A step that needs to call out releases
//! the lock for exactly that call with [`MutexGuard::unlocked`].
//!
//! Arming the token takes a reference on the provider, and finishing the
//! run drops it, so the provider cannot be freed while a run is queued.

use crate::os::OsServices;
use parking_lot::{Mutex, MutexGuard};
use std::sync::Arc;

/// Reference count plus the single deferred-operation token.
///
/// The count starts at one, held by the wrapper. An armed token holds one
/// more, so the count never reaches zero while a run is pending.
#[derive(Debug)]
pub struct Refs {
    count: u32,
    pending: bool,
}

/// What dropping a reference did.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[must_use]
pub enum Release {
    /// Other references remain.
    Live,
    /// That was the last reference; the provider must be torn down.
    Last,
}

impl Refs {
    /// A fresh count of one, no token armed.
    pub fn new() -> Self {
        Self {
            count: 1,
            pending: false,
        }
    }

    /// The current reference count.
    pub fn count(&self) -> u32 {
        self.count
    }

    /// Whether a deferred run is queued or in progress.
    pub fn is_pending(&self) -> bool {
        self.pending
    }

    /// Arms the token. Returns `false`, and does nothing, if it was already
    /// armed.
    fn arm(&mut self) -> bool {
        if self.pending {
            return false;
        }
        assert!(self.count > 0, "arming a deferred op on a freed object");
        self.pending = true;
        self.count += 1;
        true
    }

    fn complete(&mut self) -> Release {
        debug_assert!(self.pending);
        self.pending = false;
        self.release()
    }

    /// Drops one reference.
    pub fn release(&mut self) -> Release {
        assert!(self.count > 0, "reference count underflow");
        debug_assert!(!(self.pending && self.count == 1));
        self.count -= 1;
        if self.count == 0 {
            Release::Last
        } else {
            Release::Live
        }
    }
}

impl Default for Refs {
    fn default() -> Self {
        Self::new()
    }
}

/// Result of one step of a deferred run.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Step {
    /// State changed; call `step` again.
    Again,
    /// Nothing left to do.
    Idle,
}

/// A provider whose work is driven by the deferred scheduler.
pub trait Deferred: Send + Sync + Sized + 'static {
    /// The lock-protected provider state.
    type State: Send;

    /// The provider's lock.
    fn state(&self) -> &Mutex<Self::State>;

    /// Where the provider keeps its [`Refs`].
    fn refs(state: &mut Self::State) -> &mut Refs;

    /// The scheduler deferred runs are submitted to.
    fn os(&self) -> &dyn OsServices;

    /// Performs one transition. Called with the lock held; may release it
    /// only through [`MutexGuard::unlocked`].
    fn step(&self, state: &mut MutexGuard<'_, Self::State>) -> Step;

    /// Tears down native resources once the last reference is gone. Called
    /// with the lock held.
    fn finish_free(&self, state: &mut Self::State);

    /// Runs after `finish_free`, with the lock released, to tell the wrapper
    /// no further callbacks will happen.
    fn freed(&self);
}

/// Arms the deferred token of `this`, submitting a run if it was not already
/// armed. The caller holds the lock; `state` is the guarded state.
pub fn start<D: Deferred>(this: &Arc<D>, state: &mut D::State) {
    if D::refs(state).arm() {
        let body = Arc::clone(this);
        this.os().schedule(Box::new(move || drive(&body)));
    }
}

/// Drops the wrapper's reference, consuming the guard. If it was the last
/// reference the provider is torn down.
pub fn unlock_and_deref<D: Deferred>(this: &D, mut guard: MutexGuard<'_, D::State>) {
    let release = D::refs(&mut guard).release();
    finish(this, guard, release);
}

fn drive<D: Deferred>(this: &Arc<D>) {
    let mut guard = this.state().lock();
    while this.step(&mut guard) == Step::Again {}
    let release = D::refs(&mut guard).complete();
    finish(&**this, guard, release);
}

fn finish<D: Deferred>(this: &D, mut guard: MutexGuard<'_, D::State>, release: Release) {
    if release == Release::Last {
        this.finish_free(&mut guard);
        drop(guard);
        this.freed();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_token() {
        let mut refs = Refs::new();
        assert!(refs.arm());
        assert!(!refs.arm());
        assert_eq!(refs.count(), 2);
        assert_eq!(refs.complete(), Release::Live);
        assert_eq!(refs.count(), 1);
        assert!(!refs.is_pending());
    }

    #[test]
    fn pending_token_keeps_object_alive() {
        let mut refs = Refs::new();
        assert!(refs.arm());
        assert_eq!(refs.release(), Release::Live);
        assert_eq!(refs.complete(), Release::Last);
    }
}
