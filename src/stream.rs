//! The stream object: one uniform handle over any transport.

use crate::{
    arena::Handle,
    context::{Context, ContextInner},
    error::{Error, Outcome, Result},
    event::{dispatch_serial, guarded, Event, EventInterface},
    os::OsServices,
    serial::{SerialControl, SerialStream},
    transport::{ControlDepth, ControlOption, Transport},
    waiter::Waiter,
};
use parking_lot::{Mutex, RwLock};
use std::{
    fmt,
    io::IoSlice,
    iter,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::{Duration, Instant},
};

/// A stream object.
///
/// Cloning yields another handle to the same object; the object itself is
/// torn down only by [`StreamObject::free`].
#[derive(Clone)]
pub struct StreamObject {
    inner: Arc<StreamInner>,
}

struct StreamInner {
    id: Handle,
    ctx: Weak<ContextInner>,
    os: Arc<dyn OsServices>,
    transport: Arc<dyn Transport>,
    child: Option<StreamObject>,
    /// The child was allocated along with this object and goes with it.
    owns_child: bool,
    handler: RwLock<Option<EventInterface>>,
    sync: Mutex<Option<SyncIo>>,
    freed: AtomicBool,
}

/// State of sync I/O mode: at most one blocked reader and one blocked
/// writer.
#[derive(Default)]
struct SyncIo {
    read: Option<SyncRead>,
    write: Option<SyncWrite>,
}

struct SyncRead {
    waiter: Waiter,
    intr: bool,
    capacity: usize,
    data: Vec<u8>,
    err: Option<Error>,
    done: bool,
}

struct SyncWrite {
    waiter: Waiter,
    intr: bool,
}

impl StreamObject {
    pub(crate) fn new(
        id: Handle,
        ctx: Weak<ContextInner>,
        os: Arc<dyn OsServices>,
        transport: Arc<dyn Transport>,
        child: Option<StreamObject>,
        owns_child: bool,
        handler: Option<EventInterface>,
    ) -> Self {
        Self {
            inner: Arc::new(StreamInner {
                id,
                ctx,
                os,
                transport,
                child,
                owns_child,
                handler: RwLock::new(handler),
                sync: Mutex::new(None),
                freed: AtomicBool::new(false),
            }),
        }
    }

    /// This object's id in its context.
    pub fn id(&self) -> Handle {
        self.inner.id
    }

    /// The transport kind of the top layer.
    pub fn kind(&self) -> &str {
        self.inner.transport.kind()
    }

    /// The owning context, if it still exists.
    pub fn context(&self) -> Option<Context> {
        self.inner.ctx.upgrade().map(Context::from_inner)
    }

    pub(crate) fn os(&self) -> &dyn OsServices {
        &*self.inner.os
    }

    fn check_live(&self) -> Result<()> {
        if self.inner.freed.load(Ordering::Acquire) {
            Err(Error::NotReady)
        } else {
            Ok(())
        }
    }

    /// Replaces the event interface.
    pub fn set_event_interface(&self, handler: Option<EventInterface>) {
        *self.inner.handler.write() = handler;
    }

    /// The current event interface.
    pub fn event_interface(&self) -> Option<EventInterface> {
        self.inner.handler.read().clone()
    }

    /// Starts opening; `done` runs later with the result.
    pub fn open<F>(&self, done: F) -> Result<()>
    where
        F: FnOnce(&StreamObject, Result<()>) + Send + 'static,
    {
        self.check_live()?;
        let this = self.clone();
        self.inner.transport.open(Box::new(move |result| {
            let _ = guarded("open completion", || {
                done(&this, result);
                Ok(())
            });
        }))
    }

    /// Opens, blocking until the open completes.
    ///
    /// Must not be called from a scheduler thread of a single-threaded
    /// [`OsServices`], which would never get to run the completion.
    pub fn open_sync(&self) -> Result<()> {
        let waiter = self.inner.os.alloc_waiter();
        let slot = Arc::new(Mutex::new(None));
        let (w, s) = (waiter.clone(), slot.clone());
        self.open(move |_, result| {
            *s.lock() = Some(result);
            w.wake();
        })?;
        let _ = waiter.wait(1, None);
        let result = slot.lock().take();
        result.unwrap_or(Err(Error::NotReady))
    }

    /// Starts closing; `done` runs later.
    pub fn close<F>(&self, done: F) -> Result<()>
    where
        F: FnOnce(&StreamObject) + Send + 'static,
    {
        self.check_live()?;
        let this = self.clone();
        self.inner.transport.close(Box::new(move || {
            let _ = guarded("close completion", || {
                done(&this);
                Ok(())
            });
        }))
    }

    /// Closes, blocking until the close completes.
    pub fn close_sync(&self) -> Result<()> {
        let waiter = self.inner.os.alloc_waiter();
        let w = waiter.clone();
        self.close(move |_| w.wake())?;
        let _ = waiter.wait(1, None);
        Ok(())
    }

    /// Writes `data`, returning how much the transport accepted.
    pub fn write(&self, data: &[u8]) -> Result<usize> {
        self.write_sg(&[IoSlice::new(data)])
    }

    /// Writes a scatter-gather list.
    pub fn write_sg(&self, sg: &[IoSlice<'_>]) -> Result<usize> {
        self.check_live()?;
        self.inner.transport.write_sg(sg)
    }

    /// Turns read callbacks on or off.
    pub fn set_read_callback_enable(&self, enabled: bool) {
        if self.check_live().is_ok() {
            self.inner.transport.set_read_callback_enable(enabled);
        }
    }

    /// Turns write-ready callbacks on or off.
    pub fn set_write_callback_enable(&self, enabled: bool) {
        if self.check_live().is_ok() {
            self.inner.transport.set_write_callback_enable(enabled);
        }
    }

    /// Iterates the stack from this layer down.
    fn layers(&self) -> impl Iterator<Item = &StreamObject> {
        iter::successors(Some(self), next_layer)
    }

    /// The layer `depth` levels below this one; 0 is this object.
    pub fn get_child(&self, depth: usize) -> Option<StreamObject> {
        self.layers().nth(depth).cloned()
    }

    /// Number of layers in the stack, counting this one.
    pub fn depth(&self) -> usize {
        self.layers().count()
    }

    /// Gets or sets a control option on one or more layers.
    pub fn control(
        &self,
        depth: ControlDepth,
        get: bool,
        option: ControlOption,
        data: &mut String,
    ) -> Result<()> {
        self.check_live()?;
        match depth {
            ControlDepth::At(n) => {
                let layer = self.layers().nth(n).ok_or(Error::NotFound)?;
                layer.inner.transport.control(get, option, data)
            }
            ControlDepth::First => {
                for layer in self.layers() {
                    match layer.inner.transport.control(get, option, data) {
                        Err(Error::NotSupported) => continue,
                        result => return result,
                    }
                }
                Err(Error::NotSupported)
            }
            ControlDepth::All => {
                if get {
                    return Err(Error::invalid("a get cannot address every layer"));
                }
                let mut applied = false;
                for layer in self.layers() {
                    match layer.inner.transport.control(false, option, data) {
                        Ok(()) => applied = true,
                        Err(Error::NotSupported) => {}
                        Err(e) => return Err(e),
                    }
                }
                if applied {
                    Ok(())
                } else {
                    Err(Error::NotSupported)
                }
            }
        }
    }

    /// The first remote address any layer reports.
    pub fn raddr(&self) -> Result<String> {
        let mut data = String::from("0");
        self.control(ControlDepth::First, true, ControlOption::Raddr, &mut data)?;
        Ok(data)
    }

    /// Allocates a sub-channel of this stream.
    pub fn alloc_channel(
        &self,
        args: &[&str],
        handler: Option<EventInterface>,
    ) -> Result<StreamObject> {
        self.check_live()?;
        let ctx = self.inner.ctx.upgrade().ok_or(Error::NotReady)?;
        ctx.wrap_stream(None, false, handler, |sink| {
            self.inner.transport.alloc_channel(args, sink)
        })
    }

    /// Drops native resources without closing; the object must then be
    /// freed.
    pub fn disable(&self) -> Result<()> {
        self.check_live()?;
        self.inner.transport.disable()
    }

    /// Releases the object. Freeing twice fails with [`Error::NotReady`].
    ///
    /// The event interface's [`freed`](crate::EventHandler::freed) runs
    /// once the transport has finished with it.
    pub fn free(&self) -> Result<()> {
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::NotReady);
        }
        tracing::debug!(kind = self.kind(), id = %self.inner.id, "freeing stream");
        self.wake_sync_waiters();
        self.inner.transport.free();
        Ok(())
    }

    /// The serial-control view, if the transport supports it.
    pub fn serial(&self) -> Option<SerialStream<'_>> {
        self.serial_control().map(|_| SerialStream::new(self))
    }

    pub(crate) fn serial_control(&self) -> Option<&dyn SerialControl> {
        self.inner.transport.serial()
    }

    /// Enters sync I/O mode, in which data and write-ready events go to
    /// [`StreamObject::read_sync`] and [`StreamObject::write_sync`] instead
    /// of the event interface.
    pub fn set_sync(&self) -> Result<()> {
        self.check_live()?;
        let mut sync = self.inner.sync.lock();
        if sync.is_none() {
            *sync = Some(SyncIo::default());
        }
        Ok(())
    }

    /// Leaves sync I/O mode. Blocked sync calls return [`Error::NotReady`].
    pub fn clear_sync(&self) -> Result<()> {
        self.check_live()?;
        self.wake_sync_waiters();
        Ok(())
    }

    /// Whether sync I/O mode is on.
    pub fn is_sync(&self) -> bool {
        self.inner.sync.lock().is_some()
    }

    fn wake_sync_waiters(&self) {
        if let Some(sync) = self.inner.sync.lock().take() {
            if let Some(read) = sync.read {
                read.waiter.wake();
            }
            if let Some(write) = sync.write {
                write.waiter.wake();
            }
        }
    }

    /// Interrupts a blocked [`StreamObject::read_sync_intr`] or
    /// [`StreamObject::write_sync_intr`], which then returns
    /// [`Outcome::Interrupted`]. Returns whether such a call was waiting.
    pub fn interrupt_sync(&self) -> bool {
        let sync = self.inner.sync.lock();
        let Some(sync) = sync.as_ref() else {
            return false;
        };
        let mut interrupted = false;
        if let Some(read) = sync.read.as_ref().filter(|r| r.intr && !r.done) {
            read.waiter.interrupt();
            interrupted = true;
        }
        if let Some(write) = sync.write.as_ref().filter(|w| w.intr) {
            write.waiter.interrupt();
            interrupted = true;
        }
        interrupted
    }

    /// Reads into `buf`, waiting up to `timeout` for data.
    pub fn read_sync(&self, buf: &mut [u8], timeout: Option<Duration>) -> Result<Outcome<usize>> {
        self.read_sync_inner(buf, timeout, false)
    }

    /// Like [`StreamObject::read_sync`], but returns
    /// [`Outcome::Interrupted`] if [`StreamObject::interrupt_sync`] is called
    /// while it waits.
    pub fn read_sync_intr(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
    ) -> Result<Outcome<usize>> {
        self.read_sync_inner(buf, timeout, true)
    }

    fn read_sync_inner(
        &self,
        buf: &mut [u8],
        timeout: Option<Duration>,
        intr: bool,
    ) -> Result<Outcome<usize>> {
        self.check_live()?;
        let waiter = self.inner.os.alloc_waiter();
        {
            let mut sync = self.inner.sync.lock();
            let sync = sync.as_mut().ok_or(Error::NotReady)?;
            if sync.read.is_some() {
                return Err(Error::NotReady);
            }
            sync.read = Some(SyncRead {
                waiter: waiter.clone(),
                intr,
                capacity: buf.len(),
                data: Vec::new(),
                err: None,
                done: false,
            });
        }
        self.inner.transport.set_read_callback_enable(true);
        let outcome = if intr {
            waiter.wait_intr(1, timeout)
        } else {
            waiter.wait(1, timeout)
        };
        self.inner.transport.set_read_callback_enable(false);

        let op = self.inner.sync.lock().as_mut().and_then(|s| s.read.take());
        match op {
            None => Err(Error::NotReady),
            Some(op) if op.done => match op.err {
                Some(e) => Err(e),
                None => {
                    buf[..op.data.len()].copy_from_slice(&op.data);
                    Ok(Outcome::Ready(op.data.len()))
                }
            },
            Some(_) => Ok(match outcome {
                Outcome::Interrupted => Outcome::Interrupted,
                _ => Outcome::TimedOut,
            }),
        }
    }

    /// Writes all of `data`, waiting up to `timeout` for room.
    ///
    /// If the timeout expires after some bytes were written, the count
    /// written so far is returned as ready.
    pub fn write_sync(&self, data: &[u8], timeout: Option<Duration>) -> Result<Outcome<usize>> {
        self.write_sync_inner(data, timeout, false)
    }

    /// Like [`StreamObject::write_sync`], but also stops on
    /// [`StreamObject::interrupt_sync`].
    pub fn write_sync_intr(
        &self,
        data: &[u8],
        timeout: Option<Duration>,
    ) -> Result<Outcome<usize>> {
        self.write_sync_inner(data, timeout, true)
    }

    fn write_sync_inner(
        &self,
        data: &[u8],
        timeout: Option<Duration>,
        intr: bool,
    ) -> Result<Outcome<usize>> {
        self.check_live()?;
        if !self.is_sync() {
            return Err(Error::NotReady);
        }
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut written = 0;
        loop {
            written += self.write(&data[written..])?;
            if written == data.len() {
                return Ok(Outcome::Ready(written));
            }

            let waiter = self.inner.os.alloc_waiter();
            let write = SyncWrite {
                waiter: waiter.clone(),
                intr,
            };
            self.inner.sync.lock().as_mut().ok_or(Error::NotReady)?.write = Some(write);
            self.inner.transport.set_write_callback_enable(true);
            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let outcome = if intr {
                waiter.wait_intr(1, remaining)
            } else {
                waiter.wait(1, remaining)
            };
            self.inner.transport.set_write_callback_enable(false);
            match self.inner.sync.lock().as_mut() {
                Some(sync) => sync.write = None,
                None => return Err(Error::NotReady),
            }

            match outcome {
                Outcome::Ready(()) => continue,
                _ if written > 0 => return Ok(Outcome::Ready(written)),
                Outcome::Interrupted => return Ok(Outcome::Interrupted),
                Outcome::TimedOut => return Ok(Outcome::TimedOut),
            }
        }
    }

    /// Routes a native event to sync mode or the event interface.
    pub(crate) fn dispatch(&self, event: Event<'_>) -> Result<usize> {
        let handler = self.event_interface();
        match event {
            Event::Read { err, data, aux } => {
                if let Some(result) = self.sync_read(err, data) {
                    return result;
                }
                match handler {
                    None => Ok(data.len()),
                    Some(h) => guarded("read", || h.base().read(self, err, data, aux)),
                }
            }
            Event::WriteReady => {
                if self.sync_write_ready() {
                    return Ok(0);
                }
                match handler {
                    None => self.set_write_callback_enable(false),
                    Some(h) => guarded("write_ready", || {
                        h.base().write_ready(self);
                        Ok(())
                    })?,
                }
                Ok(0)
            }
            Event::NewChannel { channel, aux } => {
                match handler {
                    None => {
                        if let Err(e) = channel.free() {
                            tracing::debug!(error = %e, "freeing unclaimed channel failed");
                        }
                    }
                    Some(h) => guarded("new_channel", || {
                        h.base().new_channel(self, channel, aux);
                        Ok(())
                    })?,
                }
                Ok(0)
            }
            Event::SendBreak => {
                if let Some(h) = handler {
                    guarded("send_break", || {
                        h.base().send_break(self);
                        Ok(())
                    })?;
                }
                Ok(0)
            }
            Event::AuthBegin => {
                let h = handler.ok_or(Error::NotSupported)?;
                guarded("auth_begin", || h.base().auth_begin(self)).map(|()| 0)
            }
            Event::PrecertVerify => {
                let h = handler.ok_or(Error::NotSupported)?;
                guarded("precert_verify", || h.base().precert_verify(self)).map(|()| 0)
            }
            Event::PostcertVerify { err, errstr } => {
                let h = handler.ok_or(Error::NotSupported)?;
                guarded("postcert_verify", || {
                    h.base().postcert_verify(self, err, errstr)
                })
                .map(|()| 0)
            }
            Event::PasswordVerify(password) => {
                let h = handler.ok_or(Error::NotSupported)?;
                guarded("password_verify", || h.base().password_verify(self, password))
                    .map(|()| 0)
            }
            Event::RequestPassword(out) => {
                let h = handler.ok_or(Error::NotSupported)?;
                *out = guarded("request_password", || h.base().request_password(self))?;
                Ok(0)
            }
            Event::Serial(event) => match handler {
                Some(EventInterface::Serial { serial, .. }) => {
                    guarded("serial event", || {
                        dispatch_serial(&*serial, self, event);
                        Ok(())
                    })?;
                    Ok(0)
                }
                _ => Err(Error::NotSupported),
            },
        }
    }

    /// Hands read data to a blocked `read_sync`. Returns `None` when not in
    /// sync mode.
    fn sync_read(&self, err: Option<&Error>, data: &[u8]) -> Option<Result<usize>> {
        let mut sync = self.inner.sync.lock();
        let state = sync.as_mut()?;
        match state.read.as_mut() {
            Some(op) if !op.done => {
                let n = match err {
                    Some(e) => {
                        op.err = Some(e.duplicate());
                        0
                    }
                    None => {
                        let n = data.len().min(op.capacity);
                        op.data.extend_from_slice(&data[..n]);
                        n
                    }
                };
                op.done = true;
                op.waiter.wake();
                Some(Ok(n))
            }
            _ => {
                // Nobody is waiting; the transport keeps the data until
                // someone is.
                drop(sync);
                self.inner.transport.set_read_callback_enable(false);
                Some(Err(Error::NotReady))
            }
        }
    }

    fn sync_write_ready(&self) -> bool {
        let mut sync = self.inner.sync.lock();
        let Some(state) = sync.as_mut() else {
            return false;
        };
        match state.write.take() {
            Some(write) => write.waiter.wake(),
            None => {
                drop(sync);
                self.inner.transport.set_write_callback_enable(false);
            }
        }
        true
    }

    /// Final notification from the transport. A child allocated along
    /// with this object is freed after it.
    pub(crate) fn notify_freed(&self) {
        tracing::debug!(kind = self.kind(), id = %self.inner.id, "stream freed");
        self.wake_sync_waiters();
        let handler = self.inner.handler.write().take();
        if let Some(h) = handler {
            let _ = guarded("freed", || {
                h.base().freed();
                Ok(())
            });
        }
        if let (true, Some(child)) = (self.inner.owns_child, &self.inner.child) {
            if let Err(e) = child.free() {
                tracing::debug!(error = %e, "freeing owned child failed");
            }
        }
    }
}

fn next_layer<'a>(io: &&'a StreamObject) -> Option<&'a StreamObject> {
    io.inner.child.as_ref()
}

impl PartialEq for StreamObject {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for StreamObject {}

impl fmt::Debug for StreamObject {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("StreamObject")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .field("depth", &self.depth())
            .finish()
    }
}
