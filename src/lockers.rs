//! Exclusive claims on the process' own stdin and stdout, for the
//! `stdio(self)` transport.

use io_lifetimes::{AsFd, BorrowedFd};
use parking::{Parker, Unparker};
use std::{
    io::{self, stdin, stdout},
    os::unix::io::{AsRawFd, RawFd},
    sync::atomic::{AtomicBool, Ordering::SeqCst},
    thread::{self, JoinHandle},
};

// Statically track whether stdin and stdout are claimed, so a second
// `stdio(self)` stream fails to open instead of interleaving with the first.
static STDIN_CLAIMED: AtomicBool = AtomicBool::new(false);
static STDOUT_CLAIMED: AtomicBool = AtomicBool::new(false);

// The locker thread just acquires a lock and parks.
#[cfg(not(target_os = "freebsd"))]
const LOCKER_STACK_SIZE: usize = 64;

#[cfg(target_os = "freebsd")]
const LOCKER_STACK_SIZE: usize = 32 * 1024;

/// Holds the standard library's stdin lock for as long as a stream reads the
/// process' stdin.
pub(crate) struct StdinLocker(Claim);

/// Holds the standard library's stdout lock for as long as a stream writes
/// the process' stdout.
pub(crate) struct StdoutLocker(Claim);

struct Claim {
    raw_fd: RawFd,
    flag: &'static AtomicBool,
    unparker: Unparker,
    join_handle: Option<JoinHandle<()>>,
}

impl Claim {
    /// `lock` runs on a parked thread, since std's lock guards are not
    /// `Send`; it returns when the thread is unparked.
    fn new(
        flag: &'static AtomicBool,
        what: &str,
        raw_fd: RawFd,
        lock: impl FnOnce(Parker) + Send + 'static,
    ) -> io::Result<Self> {
        if flag.compare_exchange(false, true, SeqCst, SeqCst).is_err() {
            return Err(io::Error::new(
                io::ErrorKind::AddrInUse,
                format!("{what} is already claimed by another stream"),
            ));
        }
        let parker = Parker::new();
        let unparker = parker.unparker();
        let spawned = thread::Builder::new()
            .name(format!("ensure exclusive access to {what}"))
            .stack_size(LOCKER_STACK_SIZE)
            .spawn(move || lock(parker));
        match spawned {
            Ok(join_handle) => Ok(Self {
                raw_fd,
                flag,
                unparker,
                join_handle: Some(join_handle),
            }),
            Err(e) => {
                flag.store(false, SeqCst);
                Err(e)
            }
        }
    }
}

impl Drop for Claim {
    fn drop(&mut self) {
        self.unparker.unpark();
        if let Some(join_handle) = self.join_handle.take() {
            if join_handle.join().is_err() {
                tracing::warn!(fd = self.raw_fd, "stdio locker thread panicked");
            }
        }
        self.flag.store(false, SeqCst);
    }
}

impl StdinLocker {
    /// Fails if another `StdinLocker` exists.
    pub(crate) fn new() -> io::Result<Self> {
        let stdin = stdin();
        let raw_fd = stdin.as_raw_fd();
        Claim::new(&STDIN_CLAIMED, "stdin", raw_fd, move |parker| {
            let _lock = stdin.lock();
            parker.park()
        })
        .map(Self)
    }
}

impl StdoutLocker {
    /// Fails if another `StdoutLocker` exists.
    pub(crate) fn new() -> io::Result<Self> {
        let stdout = stdout();
        let raw_fd = stdout.as_raw_fd();
        Claim::new(&STDOUT_CLAIMED, "stdout", raw_fd, move |parker| {
            let _lock = stdout.lock();
            parker.park()
        })
        .map(Self)
    }
}

impl AsFd for StdinLocker {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: fd 0 stays open for the life of the process.
        unsafe { BorrowedFd::borrow_raw(self.0.raw_fd) }
    }
}

impl AsFd for StdoutLocker {
    #[inline]
    fn as_fd(&self) -> BorrowedFd<'_> {
        // SAFETY: fd 1 stays open for the life of the process.
        unsafe { BorrowedFd::borrow_raw(self.0.raw_fd) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stdout_claimed_once() {
        let first = StdoutLocker::new().unwrap();
        assert!(StdoutLocker::new().is_err());
        drop(first);
        let again = StdoutLocker::new().unwrap();
        drop(again);
    }
}
