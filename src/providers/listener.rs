//! Listening sockets: the `tcp,[host,]port` and `unix,path` accepters.
//!
//! `startup` binds and spawns an accept thread. Accepted connections queue
//! up in the provider and are wrapped into open stream objects by the
//! deferred runner while accept callbacks are enabled.

use crate::{
    accepter::{AccepterDone, AccepterSink, AccepterTransport},
    deferred::{self, Deferred, Refs, Step},
    error::{Error, Result},
    os::OsServices,
    providers::{
        fd::{poll_readable, spawn_worker, Endpoint, FdConfig, FdStream, Worker},
        tcp::parse_port,
    },
    registry::NewAccepter,
    transport::{ControlOption, Transport},
};
use io_lifetimes::{AsFd, BorrowedFd};
use parking::Parker;
use parking_lot::{Mutex, MutexGuard};
use std::{
    collections::VecDeque,
    fs, io,
    net::{SocketAddr, TcpListener},
    os::unix::net::UnixListener,
    path::PathBuf,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
};

/// Connections accepted but not yet handed out. The accept thread stops
/// accepting while this many are queued.
const BACKLOG: usize = 16;

pub(crate) fn tcp_factory(new: NewAccepter<'_>) -> Result<Arc<dyn AccepterTransport>> {
    new.spec.reject_unknown(&[])?;
    let (host, port) = match new.spec.rest_fields()[..] {
        [port] => ("0.0.0.0".to_owned(), parse_port(port)?),
        [host, port] => (host.to_owned(), parse_port(port)?),
        _ => {
            return Err(Error::invalid(format!(
                "tcp accepter: expected [host,]port, got {:?}",
                new.spec.rest()
            )))
        }
    };
    Ok(Arc::new(Listener::new(new, "tcp", Address::Tcp(host, port))))
}

pub(crate) fn unix_factory(new: NewAccepter<'_>) -> Result<Arc<dyn AccepterTransport>> {
    new.spec.reject_unknown(&[])?;
    let path = new.spec.rest();
    if path.is_empty() {
        return Err(Error::invalid("unix accepter: a socket path is required"));
    }
    let address = Address::Unix(PathBuf::from(path));
    Ok(Arc::new(Listener::new(new, "unix", address)))
}

#[derive(Debug, Clone)]
enum Address {
    Tcp(String, u16),
    Unix(PathBuf),
}

enum Listening {
    Tcp(TcpListener),
    Unix(UnixListener),
}

impl Address {
    fn bind(&self) -> io::Result<Listening> {
        let listening = match self {
            Self::Tcp(host, port) => Listening::Tcp(TcpListener::bind((host.as_str(), *port))?),
            Self::Unix(path) => Listening::Unix(UnixListener::bind(path)?),
        };
        listening.set_nonblocking()?;
        Ok(listening)
    }
}

impl Listening {
    fn set_nonblocking(&self) -> io::Result<()> {
        match self {
            Self::Tcp(l) => l.set_nonblocking(true),
            Self::Unix(l) => l.set_nonblocking(true),
        }
    }

    fn local_addr(&self) -> Option<SocketAddr> {
        match self {
            Self::Tcp(l) => l.local_addr().ok(),
            Self::Unix(_) => None,
        }
    }

    /// Accepts one connection, returning its endpoint and remote address.
    fn accept(&self) -> io::Result<(Endpoint, String)> {
        match self {
            Self::Tcp(l) => {
                let (stream, peer) = l.accept()?;
                stream.set_nonblocking(false)?;
                let raddr = format!("tcp,{},{}", peer.ip(), peer.port());
                Ok((Endpoint::tcp(stream)?, raddr))
            }
            Self::Unix(l) => {
                let (stream, peer) = l.accept()?;
                stream.set_nonblocking(false)?;
                let raddr = match peer.as_pathname() {
                    Some(path) => format!("unix,{}", path.display()),
                    None => "unix".to_owned(),
                };
                Ok((Endpoint::unix(stream)?, raddr))
            }
        }
    }
}

impl AsFd for Listening {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(l) => l.as_fd(),
            Self::Unix(l) => l.as_fd(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Stopped,
    Running,
    ShuttingDown,
}

struct Listener {
    shared: Arc<Shared>,
}

struct Shared {
    me: Weak<Shared>,
    kind: &'static str,
    address: Address,
    os: Arc<dyn OsServices>,
    config: FdConfig,
    sink: AccepterSink,
    inner: Mutex<Inner>,
}

struct Inner {
    refs: Refs,
    phase: Phase,
    enabled: bool,
    local: Option<SocketAddr>,
    stop: Arc<AtomicBool>,
    thread: Option<Worker>,
    thread_exited: bool,
    queue: VecDeque<(Endpoint, String)>,
    enable_done: Option<AccepterDone>,
    shutdown_done: Option<AccepterDone>,
}

impl Listener {
    fn new(new: NewAccepter<'_>, kind: &'static str, address: Address) -> Self {
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            kind,
            address,
            os: Arc::clone(new.ctx.os()),
            config: new.ctx.config().into(),
            sink: new.sink,
            inner: Mutex::new(Inner {
                refs: Refs::new(),
                phase: Phase::Stopped,
                enabled: false,
                local: None,
                stop: Arc::new(AtomicBool::new(false)),
                thread: None,
                thread_exited: false,
                queue: VecDeque::new(),
                enable_done: None,
                shutdown_done: None,
            }),
        });
        Self { shared }
    }
}

impl Shared {
    fn accept_loop(self: &Arc<Self>, stop: &AtomicBool, listening: Listening, parker: &Parker) {
        loop {
            let wanted = {
                let st = self.inner.lock();
                if stop.load(Ordering::Acquire) {
                    break;
                }
                st.enabled && st.queue.len() < BACKLOG
            };
            if !wanted {
                parker.park_timeout(self.config.poll_interval);
                continue;
            }
            match poll_readable(&listening, self.config.poll_interval) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    tracing::error!(kind = self.kind, error = %e, "polling the listener failed");
                    break;
                }
            }
            match listening.accept() {
                Ok(conn) => {
                    let mut st = self.inner.lock();
                    if stop.load(Ordering::Acquire) {
                        break;
                    }
                    tracing::debug!(kind = self.kind, raddr = %conn.1, "connection accepted");
                    st.queue.push_back(conn);
                    if st.enabled {
                        deferred::start(self, &mut *st);
                    }
                }
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted
                    ) => {}
                Err(e) => {
                    tracing::warn!(kind = self.kind, error = %e, "accept failed");
                    parker.park_timeout(self.config.poll_interval);
                }
            }
        }

        drop(listening);
        if let Address::Unix(path) = &self.address {
            let _ = fs::remove_file(path);
        }
        let mut st = self.inner.lock();
        st.thread_exited = true;
        if st.phase == Phase::ShuttingDown {
            deferred::start(self, &mut *st);
        }
    }

    fn deliver(&self, st: &mut MutexGuard<'_, Inner>) -> Step {
        let Some((endpoint, raddr)) = st.queue.pop_front() else {
            return Step::Again;
        };
        let (os, config, kind) = (Arc::clone(&self.os), self.config, self.kind);
        let result = MutexGuard::unlocked(st, || {
            self.sink.new_connection(|sink| {
                let io = FdStream::accepted(os, config, kind, raddr, endpoint, sink)?;
                Ok(Arc::new(io) as Arc<dyn Transport>)
            })
        });
        if let Err(e) = result {
            tracing::warn!(kind = self.kind, error = %e, "wrapping a connection failed");
        }
        if let Some(thread) = &st.thread {
            thread.unparker.unpark();
        }
        Step::Again
    }

    fn finish_shutdown(&self, st: &mut MutexGuard<'_, Inner>) -> Step {
        if let Some(thread) = st.thread.take() {
            MutexGuard::unlocked(st, || {
                if thread.handle.join().is_err() {
                    tracing::warn!(kind = self.kind, "accept thread panicked");
                }
            });
        }
        st.queue.clear();
        st.local = None;
        st.phase = Phase::Stopped;
        tracing::debug!(kind = self.kind, "listener shut down");
        if let Some(done) = st.shutdown_done.take() {
            MutexGuard::unlocked(st, done);
        }
        Step::Again
    }
}

impl Deferred for Shared {
    type State = Inner;

    fn state(&self) -> &Mutex<Inner> {
        &self.inner
    }

    fn refs(state: &mut Inner) -> &mut Refs {
        &mut state.refs
    }

    fn os(&self) -> &dyn OsServices {
        &*self.os
    }

    fn step(&self, st: &mut MutexGuard<'_, Inner>) -> Step {
        if let Some(done) = st.enable_done.take() {
            MutexGuard::unlocked(st, done);
            return Step::Again;
        }
        match st.phase {
            Phase::Running if st.enabled && !st.queue.is_empty() => self.deliver(st),
            Phase::ShuttingDown if st.thread_exited => self.finish_shutdown(st),
            _ => Step::Idle,
        }
    }

    fn finish_free(&self, st: &mut Inner) {
        st.queue.clear();
        st.thread = None;
        st.enable_done = None;
        st.shutdown_done = None;
    }

    fn freed(&self) {
        self.sink.freed();
    }
}

impl AccepterTransport for Listener {
    fn kind(&self) -> &str {
        self.shared.kind
    }

    fn startup(&self) -> Result<()> {
        let shared = &self.shared;
        let mut st = shared.inner.lock();
        if st.phase != Phase::Stopped {
            return Err(Error::NotReady);
        }
        let me = shared.me.upgrade().ok_or(Error::NotReady)?;
        let listening = shared.address.bind()?;
        let local = listening.local_addr();
        let stop = Arc::new(AtomicBool::new(false));
        let thread = spawn_worker(format!("{} accepter", shared.kind), {
            let stop = Arc::clone(&stop);
            move |parker| me.accept_loop(&stop, listening, &parker)
        })?;

        st.stop = stop;
        st.thread = Some(thread);
        st.thread_exited = false;
        st.local = local;
        st.enabled = true;
        st.phase = Phase::Running;
        tracing::debug!(kind = shared.kind, address = ?shared.address, ?local, "listening");
        Ok(())
    }

    fn shutdown(&self, done: AccepterDone) -> Result<()> {
        let mut st = self.shared.inner.lock();
        if st.phase != Phase::Running {
            return Err(Error::NotReady);
        }
        st.phase = Phase::ShuttingDown;
        st.stop.store(true, Ordering::Release);
        if let Some(thread) = &st.thread {
            thread.unparker.unpark();
        }
        st.shutdown_done = Some(done);
        if st.thread_exited {
            deferred::start(&self.shared, &mut *st);
        }
        Ok(())
    }

    fn set_accept_callback_enable(
        &self,
        enabled: bool,
        done: Option<AccepterDone>,
    ) -> Result<()> {
        let mut st = self.shared.inner.lock();
        if st.enable_done.is_some() && done.is_some() {
            return Err(Error::NotReady);
        }
        st.enabled = enabled;
        if enabled {
            if let Some(thread) = &st.thread {
                thread.unparker.unpark();
            }
        }
        let deliver = enabled && st.phase == Phase::Running && !st.queue.is_empty();
        if let Some(done) = done {
            st.enable_done = Some(done);
            deferred::start(&self.shared, &mut *st);
        } else if deliver {
            deferred::start(&self.shared, &mut *st);
        }
        Ok(())
    }

    fn control(&self, get: bool, option: ControlOption, data: &mut String) -> Result<()> {
        if !get {
            return Err(Error::NotSupported);
        }
        let local = self.shared.inner.lock().local;
        match (option, local) {
            (ControlOption::Lport, Some(local)) => *data = local.port().to_string(),
            (ControlOption::Laddr, Some(local)) => *data = format!("{},{}", self.shared.kind, local),
            (ControlOption::Laddr, None) => match &self.shared.address {
                Address::Unix(path) => *data = format!("unix,{}", path.display()),
                Address::Tcp(..) => return Err(Error::NotReady),
            },
            _ => return Err(Error::NotSupported),
        }
        Ok(())
    }

    fn free(&self) {
        let mut st = self.shared.inner.lock();
        st.phase = Phase::Stopped;
        st.enabled = false;
        st.stop.store(true, Ordering::Release);
        if let Some(thread) = &st.thread {
            thread.unparker.unpark();
        }
        st.queue.clear();
        deferred::unlock_and_deref(&*self.shared, st);
    }
}
