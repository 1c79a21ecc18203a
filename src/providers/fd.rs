//! Streams over file descriptors: sockets, pipes to a child process, the
//! process' own stdio, and character devices.
//!
//! An open stream runs two I/O threads. The reader polls its descriptor and
//! reads one chunk at a time, only while reads are enabled and the previous
//! chunk has been consumed. The writer drains a bounded output buffer. Both
//! hand their results to the deferred runner, which is the only place user
//! callbacks run.

use crate::{
    context::{Config, Context},
    deferred::{self, Deferred, Refs, Step},
    error::{Error, Result},
    lockers::{StdinLocker, StdoutLocker},
    os::OsServices,
    providers::{single_raddr, State},
    serial::SerialControl,
    transport::{CloseDone, ControlOption, EventSink, OpenDone, Transport},
};
use io_lifetimes::{AsFd, BorrowedFd};
use parking::{Parker, Unparker};
use parking_lot::{Mutex, MutexGuard};
use rustix::{
    event::{poll, PollFd, PollFlags},
    io::Errno,
};
use std::{
    collections::VecDeque,
    fs::File,
    io::{self, IoSlice, Read, Write},
    net::{Shutdown, SocketAddr, TcpStream},
    os::unix::net::UnixStream,
    process::{Child, ChildStderr, ChildStdin, ChildStdout},
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};

/// The readable side of an endpoint.
pub(crate) enum ReadHalf {
    Tcp(TcpStream),
    Unix(UnixStream),
    ChildStdout(ChildStdout),
    ChildStderr(ChildStderr),
    Device(File),
    Stdin(StdinLocker),
}

/// The writable side of an endpoint.
pub(crate) enum WriteHalf {
    Tcp(TcpStream),
    Unix(UnixStream),
    ChildStdin(ChildStdin),
    Device(File),
    Stdout(StdoutLocker),
}

/// What must be released, besides the halves, when the stream closes.
pub(crate) enum Resources {
    None,
    Tcp(TcpStream),
    Unix(UnixStream),
    Child(Child),
}

/// A connected endpoint, ready for I/O.
pub(crate) struct Endpoint {
    pub(crate) read: ReadHalf,
    pub(crate) write: Option<WriteHalf>,
    pub(crate) resources: Resources,
    pub(crate) local: Option<SocketAddr>,
    /// Descriptor serial control is applied to.
    pub(crate) control: Option<File>,
}

/// Produces a fresh endpoint each time the stream opens. Runs on a
/// scheduler thread, so it may block.
pub(crate) type Connector = Box<dyn FnMut() -> io::Result<Endpoint> + Send>;

impl Endpoint {
    pub(crate) fn tcp(stream: TcpStream) -> io::Result<Self> {
        stream.set_nodelay(true)?;
        Ok(Self {
            read: ReadHalf::Tcp(stream.try_clone()?),
            write: Some(WriteHalf::Tcp(stream.try_clone()?)),
            local: stream.local_addr().ok(),
            resources: Resources::Tcp(stream),
            control: None,
        })
    }

    pub(crate) fn unix(stream: UnixStream) -> io::Result<Self> {
        Ok(Self {
            read: ReadHalf::Unix(stream.try_clone()?),
            write: Some(WriteHalf::Unix(stream.try_clone()?)),
            resources: Resources::Unix(stream),
            local: None,
            control: None,
        })
    }

    /// Takes the child's stdin and stdout. Its stderr, if piped, stays with
    /// the child for [`Transport::alloc_channel`].
    pub(crate) fn child(mut child: Child) -> io::Result<Self> {
        let (stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => {
                let _ = child.kill();
                let _ = child.wait();
                return Err(io::Error::new(
                    io::ErrorKind::BrokenPipe,
                    "child process stdio is not piped",
                ));
            }
        };
        Ok(Self {
            read: ReadHalf::ChildStdout(stdout),
            write: Some(WriteHalf::ChildStdin(stdin)),
            resources: Resources::Child(child),
            local: None,
            control: None,
        })
    }

    /// This process' own stdin and stdout.
    pub(crate) fn own_stdio() -> io::Result<Self> {
        Ok(Self {
            read: ReadHalf::Stdin(StdinLocker::new()?),
            write: Some(WriteHalf::Stdout(StdoutLocker::new()?)),
            resources: Resources::None,
            local: None,
            control: None,
        })
    }

    pub(crate) fn device(file: File) -> io::Result<Self> {
        Ok(Self {
            read: ReadHalf::Device(file.try_clone()?),
            write: Some(WriteHalf::Device(file.try_clone()?)),
            resources: Resources::None,
            local: None,
            control: Some(file),
        })
    }

    fn read_only(read: ReadHalf) -> Self {
        Self {
            read,
            write: None,
            resources: Resources::None,
            local: None,
            control: None,
        }
    }
}

impl Read for ReadHalf {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.read(buf),
            Self::Unix(s) => s.read(buf),
            Self::ChildStdout(s) => s.read(buf),
            Self::ChildStderr(s) => s.read(buf),
            Self::Device(f) => f.read(buf),
            Self::Stdin(l) => Ok(rustix::io::read(&*l, buf)?),
        }
    }
}

impl AsFd for ReadHalf {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(s) => s.as_fd(),
            Self::Unix(s) => s.as_fd(),
            Self::ChildStdout(s) => s.as_fd(),
            Self::ChildStderr(s) => s.as_fd(),
            Self::Device(f) => f.as_fd(),
            Self::Stdin(l) => l.as_fd(),
        }
    }
}

impl Write for WriteHalf {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match self {
            Self::Tcp(s) => s.write(buf),
            Self::Unix(s) => s.write(buf),
            Self::ChildStdin(s) => s.write(buf),
            Self::Device(f) => f.write(buf),
            Self::Stdout(l) => Ok(rustix::io::write(&*l, buf)?),
        }
    }

    fn flush(&mut self) -> io::Result<()> {
        match self {
            Self::Tcp(s) => s.flush(),
            Self::Unix(s) => s.flush(),
            Self::ChildStdin(s) => s.flush(),
            Self::Device(f) => f.flush(),
            Self::Stdout(_) => Ok(()),
        }
    }
}

impl AsFd for WriteHalf {
    fn as_fd(&self) -> BorrowedFd<'_> {
        match self {
            Self::Tcp(s) => s.as_fd(),
            Self::Unix(s) => s.as_fd(),
            Self::ChildStdin(s) => s.as_fd(),
            Self::Device(f) => f.as_fd(),
            Self::Stdout(l) => l.as_fd(),
        }
    }
}

impl Resources {
    /// Shuts sockets down and reaps a child, killing it if it is still
    /// running.
    fn close(&mut self) {
        match self {
            Self::Tcp(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            Self::Unix(s) => {
                let _ = s.shutdown(Shutdown::Both);
            }
            Self::Child(child) => {
                if let Ok(None) = child.try_wait() {
                    let _ = child.kill();
                }
                let _ = child.wait();
            }
            Self::None => {}
        }
    }
}

/// The parts of [`Config`] the I/O threads use.
#[derive(Debug, Clone, Copy)]
pub(crate) struct FdConfig {
    read_buffer_size: usize,
    write_buffer_size: usize,
    pub(crate) poll_interval: Duration,
    close_timeout: Duration,
}

impl From<&Config> for FdConfig {
    fn from(config: &Config) -> Self {
        Self {
            read_buffer_size: config.read_buffer_size,
            write_buffer_size: config.write_buffer_size,
            poll_interval: config.poll_interval,
            close_timeout: config.close_timeout,
        }
    }
}

/// A stream over a file descriptor endpoint.
pub(crate) struct FdStream {
    shared: Arc<Shared>,
    serial: Option<Box<dyn SerialControl>>,
}

/// A handle serial control implementations keep on their stream.
#[derive(Clone)]
pub(crate) struct FdHandle(Arc<Shared>);

struct Shared {
    me: Weak<Shared>,
    kind: &'static str,
    raddr: String,
    os: Arc<dyn OsServices>,
    sink: EventSink,
    config: FdConfig,
    inner: Mutex<Inner>,
}

struct Inner {
    refs: Refs,
    state: State,
    connector: Option<Connector>,
    io: Option<LiveIo>,
    local: Option<SocketAddr>,
    control: Option<File>,
    read_enabled: bool,
    /// The handler took nothing from the pending chunk; wait for reads to
    /// be enabled again before redelivering it.
    read_stalled: bool,
    /// A chunk is out with the handler, unlocked.
    delivering: bool,
    pending: Option<Chunk>,
    xmit_enabled: bool,
    outbuf: VecDeque<u8>,
    write_err: Option<Error>,
    open_done: Option<OpenDone>,
    close_done: Option<CloseDone>,
}

struct Chunk {
    data: Vec<u8>,
    pos: usize,
    err: Option<Error>,
}

struct LiveIo {
    stop: Arc<AtomicBool>,
    /// Set once the writer must give up on unsent output.
    abandon: Arc<AtomicBool>,
    reader: Worker,
    writer: Option<Worker>,
    resources: Resources,
}

pub(crate) struct Worker {
    pub(crate) handle: JoinHandle<()>,
    pub(crate) unparker: Unparker,
}

impl FdStream {
    /// A stream that connects with `connector` each time it is opened.
    pub(crate) fn new(
        ctx: &Context,
        kind: &'static str,
        raddr: String,
        connector: Connector,
        sink: EventSink,
    ) -> Self {
        Self::build(
            Arc::clone(ctx.os()),
            ctx.config().into(),
            kind,
            raddr,
            Some(connector),
            sink,
        )
    }

    /// A stream over an endpoint that is already connected. It starts out
    /// open and cannot be reopened once closed.
    pub(crate) fn accepted(
        os: Arc<dyn OsServices>,
        config: FdConfig,
        kind: &'static str,
        raddr: String,
        endpoint: Endpoint,
        sink: EventSink,
    ) -> Result<Self> {
        let this = Self::build(os, config, kind, raddr, None, sink);
        {
            let mut st = this.shared.inner.lock();
            this.shared.start_io(&mut st, endpoint)?;
            st.state = State::Open;
        }
        Ok(this)
    }

    fn build(
        os: Arc<dyn OsServices>,
        config: FdConfig,
        kind: &'static str,
        raddr: String,
        connector: Option<Connector>,
        sink: EventSink,
    ) -> Self {
        let shared = Arc::new_cyclic(|me| Shared {
            me: me.clone(),
            kind,
            raddr,
            os,
            sink,
            config,
            inner: Mutex::new(Inner {
                refs: Refs::new(),
                state: State::Closed,
                connector,
                io: None,
                local: None,
                control: None,
                read_enabled: false,
                read_stalled: false,
                delivering: false,
                pending: None,
                xmit_enabled: false,
                outbuf: VecDeque::new(),
                write_err: None,
                open_done: None,
                close_done: None,
            }),
        });
        Self {
            shared,
            serial: None,
        }
    }

    pub(crate) fn handle(&self) -> FdHandle {
        FdHandle(Arc::clone(&self.shared))
    }

    pub(crate) fn set_serial(&mut self, serial: Box<dyn SerialControl>) {
        self.serial = Some(serial);
    }
}

impl FdHandle {
    pub(crate) fn os(&self) -> &Arc<dyn OsServices> {
        &self.0.os
    }

    /// Runs `f` on the control descriptor of the open stream.
    pub(crate) fn with_control<R>(&self, f: impl FnOnce(&File) -> Result<R>) -> Result<R> {
        let st = self.0.inner.lock();
        if st.state != State::Open {
            return Err(Error::NotReady);
        }
        let fd = st.control.as_ref().ok_or(Error::NotSupported)?;
        f(fd)
    }
}

impl LiveIo {
    /// Tells both threads to exit. Called with the provider lock held.
    fn stop(&self) {
        self.stop.store(true, Ordering::Release);
        self.reader.unparker.unpark();
        if let Some(writer) = &self.writer {
            writer.unparker.unpark();
        }
    }

    fn unpark_reader(&self) {
        self.reader.unparker.unpark();
    }

    fn unpark_writer(&self) {
        if let Some(writer) = &self.writer {
            writer.unparker.unpark();
        }
    }

    /// Gives the writer up to `drain` to flush buffered output, then
    /// releases the endpoint and waits for both threads. Blocks for at most
    /// about twice `drain`; called without the provider lock.
    fn shutdown(mut self, drain: Duration) {
        let writer = self.writer.take();
        if let Some(writer) = &writer {
            if !wait_finished(&writer.handle, drain) {
                tracing::warn!("fd writer did not drain before close; dropping unsent output");
                self.abandon.store(true, Ordering::Release);
                writer.unparker.unpark();
            }
        }
        // Closing the endpoint fails any write still blocked in the kernel.
        self.resources.close();
        if let Some(writer) = writer {
            join_bounded(writer.handle, "writer", drain);
        }
        join_bounded(self.reader.handle, "reader", drain);
    }

    /// Releases the endpoint without waiting for either thread.
    fn abort(mut self) {
        self.stop.store(true, Ordering::Release);
        self.abandon.store(true, Ordering::Release);
        self.resources.close();
    }
}

fn wait_finished(handle: &JoinHandle<()>, limit: Duration) -> bool {
    let deadline = Instant::now() + limit;
    while !handle.is_finished() {
        if Instant::now() >= deadline {
            return false;
        }
        thread::sleep(Duration::from_millis(5));
    }
    true
}

/// Joins `handle` if it exits within `limit`; otherwise leaves it running
/// detached.
fn join_bounded(handle: JoinHandle<()>, name: &str, limit: Duration) {
    if !wait_finished(&handle, limit) {
        tracing::warn!(thread = name, "fd thread still blocked after close; detaching it");
        return;
    }
    if handle.join().is_err() {
        tracing::warn!(thread = name, "fd thread panicked");
    }
}

pub(crate) fn spawn_worker(
    name: String,
    body: impl FnOnce(Parker) + Send + 'static,
) -> io::Result<Worker> {
    let parker = Parker::new();
    let unparker = parker.unparker();
    let handle = thread::Builder::new()
        .name(name)
        .spawn(move || body(parker))?;
    Ok(Worker { handle, unparker })
}

pub(crate) fn poll_readable(fd: &impl AsFd, timeout: Duration) -> io::Result<bool> {
    poll_one(fd, PollFlags::IN, timeout)
}

fn poll_writable(fd: &impl AsFd, timeout: Duration) -> io::Result<bool> {
    poll_one(fd, PollFlags::OUT, timeout)
}

fn poll_one(fd: &impl AsFd, flags: PollFlags, timeout: Duration) -> io::Result<bool> {
    let mut fds = [PollFd::new(fd, flags)];
    let ms = i32::try_from(timeout.as_millis()).unwrap_or(i32::MAX);
    match poll(&mut fds, ms) {
        Ok(n) => Ok(n > 0),
        Err(Errno::INTR) => Ok(false),
        Err(e) => Err(e.into()),
    }
}

impl Shared {
    /// Spawns the I/O threads for `endpoint`. Called with the lock held.
    fn start_io(&self, st: &mut Inner, endpoint: Endpoint) -> Result<()> {
        let me = self.me.upgrade().ok_or(Error::NotReady)?;
        let Endpoint {
            read,
            write,
            resources,
            local,
            control,
        } = endpoint;
        let stop = Arc::new(AtomicBool::new(false));
        let abandon = Arc::new(AtomicBool::new(false));

        let reader = spawn_worker(format!("{} reader", self.kind), {
            let (me, stop) = (Arc::clone(&me), Arc::clone(&stop));
            move |parker| me.reader_loop(&stop, read, &parker)
        })?;
        let writer = match write {
            None => None,
            Some(write) => {
                let spawned = spawn_worker(format!("{} writer", self.kind), {
                    let (stop, abandon) = (Arc::clone(&stop), Arc::clone(&abandon));
                    move |parker| me.writer_loop(&stop, &abandon, write, &parker)
                });
                match spawned {
                    Ok(writer) => Some(writer),
                    Err(e) => {
                        stop.store(true, Ordering::Release);
                        reader.unparker.unpark();
                        return Err(e.into());
                    }
                }
            }
        };

        st.io = Some(LiveIo {
            stop,
            abandon,
            reader,
            writer,
            resources,
        });
        st.local = local;
        st.control = control;
        st.pending = None;
        st.read_stalled = false;
        st.outbuf.clear();
        st.write_err = None;
        Ok(())
    }

    fn reader_loop(self: &Arc<Self>, stop: &AtomicBool, mut rd: ReadHalf, parker: &Parker) {
        let mut buf = vec![0; self.config.read_buffer_size];
        loop {
            let wanted = {
                let st = self.inner.lock();
                if stop.load(Ordering::Acquire) {
                    return;
                }
                st.read_enabled && st.pending.is_none() && !st.delivering
            };
            if !wanted {
                parker.park_timeout(self.config.poll_interval);
                continue;
            }
            match poll_readable(&rd, self.config.poll_interval) {
                Ok(true) => {}
                Ok(false) => continue,
                Err(e) => {
                    self.post_chunk(stop, Chunk::failed(e.into()));
                    return;
                }
            }
            let chunk = match rd.read(&mut buf) {
                Ok(0) => Chunk::failed(Error::RemoteClosed),
                Ok(n) => Chunk::data(buf[..n].to_vec()),
                Err(e)
                    if matches!(
                        e.kind(),
                        io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
                    ) =>
                {
                    continue
                }
                Err(e) => Chunk::failed(e.into()),
            };
            let last = chunk.err.is_some();
            if !self.post_chunk(stop, chunk) || last {
                return;
            }
        }
    }

    /// Hands a chunk to the deferred runner. Returns `false` if the stream
    /// is stopping.
    fn post_chunk(self: &Arc<Self>, stop: &AtomicBool, chunk: Chunk) -> bool {
        let mut st = self.inner.lock();
        if stop.load(Ordering::Acquire) {
            return false;
        }
        tracing::trace!(kind = self.kind, len = chunk.data.len(), "read chunk");
        st.pending = Some(chunk);
        if st.state == State::Open && st.read_enabled {
            deferred::start(self, &mut *st);
        }
        true
    }

    fn writer_loop(
        self: &Arc<Self>,
        stop: &AtomicBool,
        abandon: &AtomicBool,
        mut wr: WriteHalf,
        parker: &Parker,
    ) {
        let mut chunk = Vec::new();
        loop {
            {
                let mut st = self.inner.lock();
                if abandon.load(Ordering::Acquire) {
                    return;
                }
                if st.outbuf.is_empty() {
                    if stop.load(Ordering::Acquire) {
                        return;
                    }
                    drop(st);
                    parker.park_timeout(self.config.poll_interval);
                    continue;
                }
                let n = st.outbuf.len().min(self.config.read_buffer_size);
                chunk.clear();
                chunk.extend(st.outbuf.drain(..n));
            }

            let result = self.write_chunk(&mut wr, &chunk, abandon);

            let mut st = self.inner.lock();
            let stopping = stop.load(Ordering::Acquire);
            if let Err(e) = result {
                if !stopping {
                    tracing::debug!(kind = self.kind, error = %e, "write failed");
                    st.write_err = Some(e.into());
                    st.outbuf.clear();
                    if st.state == State::Open && st.xmit_enabled {
                        deferred::start(self, &mut *st);
                    }
                }
                return;
            }
            if !stopping && st.state == State::Open && st.xmit_enabled {
                deferred::start(self, &mut *st);
            }
        }
    }

    /// Writes all of `data`, waiting for room with `poll` so a stalled peer
    /// never holds the writer past `abandon`.
    fn write_chunk(
        &self,
        wr: &mut WriteHalf,
        mut data: &[u8],
        abandon: &AtomicBool,
    ) -> io::Result<()> {
        while !data.is_empty() {
            if abandon.load(Ordering::Acquire) {
                return Err(io::Error::new(
                    io::ErrorKind::TimedOut,
                    "unsent output dropped at close",
                ));
            }
            if !poll_writable(wr, self.config.poll_interval)? {
                continue;
            }
            match wr.write(data) {
                Ok(0) => return Err(io::ErrorKind::WriteZero.into()),
                Ok(n) => data = &data[n..],
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => return Err(e),
            }
        }
        wr.flush()
    }

    fn connect(&self, st: &mut MutexGuard<'_, Inner>) -> Step {
        let Some(mut connector) = st.connector.take() else {
            return self.fail_open(st, Error::NotSupported);
        };
        let result = MutexGuard::unlocked(st, || connector());
        st.connector = Some(connector);
        if !matches!(st.state, State::InOpen | State::InOpenClose) {
            // Freed or disabled while connecting; the endpoint is dropped.
            return Step::Again;
        }
        match result
            .map_err(Error::from)
            .and_then(|endpoint| self.start_io(st, endpoint))
        {
            Ok(()) => {
                tracing::debug!(kind = self.kind, raddr = %self.raddr, "connected");
                Step::Again
            }
            Err(e) => self.fail_open(st, e),
        }
    }

    fn fail_open(&self, st: &mut MutexGuard<'_, Inner>, err: Error) -> Step {
        tracing::debug!(kind = self.kind, raddr = %self.raddr, error = %err, "open failed");
        let close_requested = st.state == State::InOpenClose;
        st.state = State::Closed;
        if let Some(done) = st.open_done.take() {
            MutexGuard::unlocked(st, || done(Err(err)));
        }
        if close_requested {
            if let Some(done) = st.close_done.take() {
                MutexGuard::unlocked(st, done);
            }
        }
        Step::Again
    }

    fn deliver_read(&self, st: &mut MutexGuard<'_, Inner>) -> Step {
        let Some(mut chunk) = st.pending.take() else {
            return Step::Again;
        };
        st.delivering = true;
        let result = MutexGuard::unlocked(st, || {
            self.sink
                .read(chunk.err.as_ref(), &chunk.data[chunk.pos..], &[])
        });
        st.delivering = false;

        match result {
            // The reader has exited after an error chunk.
            Ok(_) if chunk.err.is_some() => {}
            Ok(n) => {
                let left = chunk.data.len() - chunk.pos;
                chunk.pos += n.min(left);
                if chunk.pos < chunk.data.len() {
                    st.read_stalled = n == 0;
                    st.pending = Some(chunk);
                } else if let Some(io) = &st.io {
                    io.unpark_reader();
                }
            }
            Err(e) => {
                tracing::trace!(kind = self.kind, error = %e, "read not taken");
                st.read_stalled = true;
                st.pending = Some(chunk);
            }
        }
        Step::Again
    }

    fn finish_close(&self, st: &mut MutexGuard<'_, Inner>) -> Step {
        if let Some(io) = st.io.take() {
            io.stop();
            let drain = self.config.close_timeout;
            MutexGuard::unlocked(st, || io.shutdown(drain));
        }
        st.pending = None;
        st.read_stalled = false;
        st.outbuf.clear();
        st.write_err = None;
        st.control = None;
        st.local = None;
        st.state = State::Closed;
        tracing::debug!(kind = self.kind, raddr = %self.raddr, "closed");
        if let Some(done) = st.close_done.take() {
            MutexGuard::unlocked(st, done);
        }
        Step::Again
    }
}

impl Chunk {
    fn data(data: Vec<u8>) -> Self {
        Self {
            data,
            pos: 0,
            err: None,
        }
    }

    fn failed(err: Error) -> Self {
        Self {
            data: Vec::new(),
            pos: 0,
            err: Some(err),
        }
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
        let room = st.outbuf.len() < self.config.write_buffer_size;
        match st.state {
            State::InOpen | State::InOpenClose if st.io.is_none() => self.connect(st),
            State::InOpen | State::InOpenClose => {
                let result = if st.state == State::InOpenClose {
                    st.state = State::InClose;
                    Err(Error::LocalClosed)
                } else {
                    st.state = State::Open;
                    Ok(())
                };
                if let Some(done) = st.open_done.take() {
                    MutexGuard::unlocked(st, || done(result));
                }
                Step::Again
            }
            State::Open if st.read_enabled && !st.read_stalled && st.pending.is_some() => {
                self.deliver_read(st)
            }
            State::Open if st.xmit_enabled && (room || st.write_err.is_some()) => {
                match MutexGuard::unlocked(st, || self.sink.write_ready()) {
                    Ok(()) => Step::Again,
                    Err(e) => {
                        tracing::debug!(kind = self.kind, error = %e, "write-ready delivery failed");
                        if st.state == State::Open {
                            Step::Idle
                        } else {
                            Step::Again
                        }
                    }
                }
            }
            State::InClose => self.finish_close(st),
            State::Open | State::Closed => Step::Idle,
        }
    }

    fn finish_free(&self, st: &mut Inner) {
        st.connector = None;
        st.open_done = None;
        st.close_done = None;
        st.pending = None;
        st.control = None;
        if let Some(io) = st.io.take() {
            io.abort();
        }
    }

    fn freed(&self) {
        self.sink.freed();
    }
}

impl Transport for FdStream {
    fn kind(&self) -> &str {
        self.shared.kind
    }

    fn open(&self, done: OpenDone) -> Result<()> {
        let mut st = self.shared.inner.lock();
        if st.state != State::Closed {
            return Err(Error::NotReady);
        }
        if st.connector.is_none() {
            return Err(Error::NotSupported);
        }
        st.state = State::InOpen;
        st.open_done = Some(done);
        deferred::start(&self.shared, &mut *st);
        Ok(())
    }

    fn close(&self, done: CloseDone) -> Result<()> {
        let mut st = self.shared.inner.lock();
        st.state = match st.state {
            State::Open => State::InClose,
            State::InOpen => State::InOpenClose,
            _ => return Err(Error::NotReady),
        };
        st.close_done = Some(done);
        deferred::start(&self.shared, &mut *st);
        Ok(())
    }

    fn write_sg(&self, sg: &[IoSlice<'_>]) -> Result<usize> {
        let mut st = self.shared.inner.lock();
        if st.state != State::Open {
            return Err(Error::NotReady);
        }
        if let Some(err) = &st.write_err {
            return Err(err.duplicate());
        }
        let writable = st.io.as_ref().is_some_and(|io| io.writer.is_some());
        if !writable {
            return Err(Error::NotSupported);
        }

        let mut count = 0;
        for buf in sg {
            let room = self
                .shared
                .config
                .write_buffer_size
                .saturating_sub(st.outbuf.len());
            let n = buf.len().min(room);
            st.outbuf.extend(&buf[..n]);
            count += n;
            if n < buf.len() {
                break;
            }
        }
        if count > 0 {
            if let Some(io) = &st.io {
                io.unpark_writer();
            }
        }
        Ok(count)
    }

    fn set_read_callback_enable(&self, enabled: bool) {
        let mut st = self.shared.inner.lock();
        st.read_enabled = enabled;
        if enabled {
            st.read_stalled = false;
            if st.state == State::Open && st.pending.is_some() {
                deferred::start(&self.shared, &mut *st);
            }
            if let Some(io) = &st.io {
                io.unpark_reader();
            }
        }
    }

    fn set_write_callback_enable(&self, enabled: bool) {
        let mut st = self.shared.inner.lock();
        st.xmit_enabled = enabled;
        if enabled && st.state == State::Open {
            deferred::start(&self.shared, &mut *st);
        }
    }

    fn control(&self, get: bool, option: ControlOption, data: &mut String) -> Result<()> {
        if !get {
            return Err(Error::NotSupported);
        }
        match option {
            ControlOption::Raddr => single_raddr(data, || self.shared.raddr.clone()),
            ControlOption::Laddr | ControlOption::Lport => {
                let st = self.shared.inner.lock();
                let local = st.local.ok_or(Error::NotSupported)?;
                *data = match option {
                    ControlOption::Laddr => format!("{},{}", self.shared.kind, local),
                    _ => local.port().to_string(),
                };
                Ok(())
            }
            ControlOption::Other(_) => Err(Error::NotSupported),
        }
    }

    fn disable(&self) -> Result<()> {
        let mut st = self.shared.inner.lock();
        st.state = State::Closed;
        st.outbuf.clear();
        if let Some(io) = st.io.take() {
            // The threads see the stop flag and exit; the endpoint closes as
            // its halves drop.
            io.stop();
        }
        Ok(())
    }

    fn alloc_channel(&self, args: &[&str], sink: EventSink) -> Result<Arc<dyn Transport>> {
        if let Some(arg) = args.first() {
            return Err(Error::invalid(format!("unknown channel option {arg:?}")));
        }
        let stderr = {
            let mut st = self.shared.inner.lock();
            if st.state != State::Open {
                return Err(Error::NotReady);
            }
            match st.io.as_mut().map(|io| &mut io.resources) {
                Some(Resources::Child(child)) => child.stderr.take().ok_or(Error::NotFound)?,
                _ => return Err(Error::NotSupported),
            }
        };
        let channel = FdStream::accepted(
            Arc::clone(&self.shared.os),
            self.shared.config,
            "stderr",
            format!("{}(stderr)", self.shared.raddr),
            Endpoint::read_only(ReadHalf::ChildStderr(stderr)),
            sink,
        )?;
        Ok(Arc::new(channel))
    }

    fn serial(&self) -> Option<&dyn SerialControl> {
        self.serial.as_deref()
    }

    fn free(&self) {
        let mut st = self.shared.inner.lock();
        st.state = State::Closed;
        st.outbuf.clear();
        let io = st.io.take();
        if let Some(io) = &io {
            io.stop();
        }
        deferred::unlock_and_deref(&*self.shared, st);
        if let Some(io) = io {
            io.abort();
        }
    }
}
