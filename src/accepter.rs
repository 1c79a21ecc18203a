//! Accepters: listening endpoints that produce new stream objects.

use crate::{
    arena::Handle,
    context::{Context, ContextInner},
    error::{Error, Outcome, Result},
    event::guarded,
    os::OsServices,
    stream::StreamObject,
    transport::{ControlDepth, ControlOption, EventSink, Transport},
    waiter::Waiter,
};
use parking_lot::{Mutex, RwLock};
use std::{
    collections::VecDeque,
    fmt, iter,
    sync::{
        atomic::{AtomicBool, Ordering},
        Arc, Weak,
    },
    time::Duration,
};

/// Completion of an accepter operation.
pub type AccepterDone = Box<dyn FnOnce() + Send + 'static>;

/// An accepter provider.
pub trait AccepterTransport: Send + Sync + 'static {
    /// The kind name.
    fn kind(&self) -> &str;

    /// Starts listening.
    fn startup(&self) -> Result<()>;

    /// Stops listening; `done` runs once the listener is closed.
    fn shutdown(&self, done: AccepterDone) -> Result<()>;

    /// Turns delivery of new connections on or off; `done`, if given, runs
    /// once the change has taken effect.
    fn set_accept_callback_enable(&self, enabled: bool, done: Option<AccepterDone>)
        -> Result<()>;

    /// Gets or sets a control option.
    fn control(&self, get: bool, option: ControlOption, data: &mut String) -> Result<()> {
        let _ = (get, option, data);
        Err(Error::NotSupported)
    }

    /// Drops the wrapper's reference. The transport calls
    /// [`AccepterSink::freed`] once its last reference is gone.
    fn free(&self);
}

/// Callbacks for accepter events.
pub trait AccepterEventHandler: Send + Sync {
    /// A connection arrived, already open. The default frees it.
    fn new_connection(&self, acc: &Accepter, io: StreamObject) {
        let _ = acc;
        if let Err(e) = io.free() {
            tracing::debug!(error = %e, "freeing unclaimed connection failed");
        }
    }

    /// Authentication of `io` is starting.
    fn auth_begin(&self, acc: &Accepter, io: &StreamObject) -> Result<()> {
        let _ = (acc, io);
        Err(Error::NotSupported)
    }

    /// `io` has an unverified peer certificate.
    fn precert_verify(&self, acc: &Accepter, io: &StreamObject) -> Result<()> {
        let _ = (acc, io);
        Err(Error::NotSupported)
    }

    /// Certificate verification of `io` finished.
    fn postcert_verify(
        &self,
        acc: &Accepter,
        io: &StreamObject,
        err: Option<&Error>,
        errstr: Option<&str>,
    ) -> Result<()> {
        let _ = (acc, io, err, errstr);
        Err(Error::NotSupported)
    }

    /// Verify a password presented on `io`.
    fn password_verify(&self, acc: &Accepter, io: &StreamObject, password: &str) -> Result<()> {
        let _ = (acc, io, password);
        Err(Error::NotSupported)
    }

    /// Supply a password for `io`.
    fn request_password(&self, acc: &Accepter, io: &StreamObject) -> Result<String> {
        let _ = (acc, io);
        Err(Error::NotSupported)
    }

    /// The accepter has been torn down.
    fn freed(&self) {}
}

/// An accepter transport's way back to its wrapper.
#[derive(Clone)]
pub struct AccepterSink {
    id: Handle,
    ctx: Weak<ContextInner>,
}

impl AccepterSink {
    pub(crate) fn new(id: Handle, ctx: Weak<ContextInner>) -> Self {
        Self { id, ctx }
    }

    /// The wrapper's id.
    pub fn id(&self) -> Handle {
        self.id
    }

    fn resolve(&self) -> Result<(Arc<ContextInner>, Accepter)> {
        let ctx = self.ctx.upgrade().ok_or(Error::NotReady)?;
        let acc = ctx.accepter(self.id).ok_or(Error::NotReady)?;
        Ok((ctx, acc))
    }

    /// Reports a new, already open connection. `build` constructs its
    /// transport around the sink it is given.
    pub fn new_connection<F>(&self, build: F) -> Result<()>
    where
        F: FnOnce(EventSink) -> Result<Arc<dyn Transport>>,
    {
        let (ctx, acc) = self.resolve()?;
        let io = ctx.wrap_stream(None, false, None, build)?;
        acc.deliver_connection(io);
        Ok(())
    }

    /// Reports that authentication of `io` is starting.
    pub fn auth_begin(&self, io: &StreamObject) -> Result<()> {
        let (_ctx, acc) = self.resolve()?;
        let h = acc.handler().ok_or(Error::NotSupported)?;
        guarded("accepter auth_begin", || h.auth_begin(&acc, io))
    }

    /// Reports an unverified certificate on `io`.
    pub fn precert_verify(&self, io: &StreamObject) -> Result<()> {
        let (_ctx, acc) = self.resolve()?;
        let h = acc.handler().ok_or(Error::NotSupported)?;
        guarded("accepter precert_verify", || h.precert_verify(&acc, io))
    }

    /// Reports the outcome of certificate verification on `io`.
    pub fn postcert_verify(
        &self,
        io: &StreamObject,
        err: Option<&Error>,
        errstr: Option<&str>,
    ) -> Result<()> {
        let (_ctx, acc) = self.resolve()?;
        let h = acc.handler().ok_or(Error::NotSupported)?;
        guarded("accepter postcert_verify", || {
            h.postcert_verify(&acc, io, err, errstr)
        })
    }

    /// Asks the owner to verify a password presented on `io`.
    pub fn password_verify(&self, io: &StreamObject, password: &str) -> Result<()> {
        let (_ctx, acc) = self.resolve()?;
        let h = acc.handler().ok_or(Error::NotSupported)?;
        guarded("accepter password_verify", || {
            h.password_verify(&acc, io, password)
        })
    }

    /// Asks the owner for a password for `io`.
    pub fn request_password(&self, io: &StreamObject) -> Result<String> {
        let (_ctx, acc) = self.resolve()?;
        let h = acc.handler().ok_or(Error::NotSupported)?;
        guarded("accepter request_password", || h.request_password(&acc, io))
    }

    /// Reports that the transport's last reference is gone.
    pub fn freed(&self) {
        if let Some(ctx) = self.ctx.upgrade() {
            if let Some(acc) = ctx.remove_accepter(self.id) {
                acc.notify_freed();
            }
        }
    }
}

impl fmt::Debug for AccepterSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("AccepterSink").field("id", &self.id).finish()
    }
}

/// An accepter object.
#[derive(Clone)]
pub struct Accepter {
    inner: Arc<AccepterInner>,
}

struct AccepterInner {
    id: Handle,
    ctx: Weak<ContextInner>,
    os: Arc<dyn OsServices>,
    transport: Arc<dyn AccepterTransport>,
    child: Option<Accepter>,
    owns_child: bool,
    handler: RwLock<Option<Arc<dyn AccepterEventHandler>>>,
    sync: Mutex<Option<SyncAccept>>,
    freed: AtomicBool,
}

/// Connections queued for `accept_sync`. Each queued connection has
/// posted exactly one wake on `waiter`.
struct SyncAccept {
    queue: VecDeque<StreamObject>,
    waiter: Waiter,
    /// Callers blocked in `accept_sync_intr`.
    intr_waiting: usize,
}

impl Accepter {
    pub(crate) fn new(
        id: Handle,
        ctx: Weak<ContextInner>,
        os: Arc<dyn OsServices>,
        transport: Arc<dyn AccepterTransport>,
        child: Option<Accepter>,
        owns_child: bool,
        handler: Option<Arc<dyn AccepterEventHandler>>,
    ) -> Self {
        Self {
            inner: Arc::new(AccepterInner {
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

    /// This accepter's id in its context.
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

    fn check_live(&self) -> Result<()> {
        if self.inner.freed.load(Ordering::Acquire) {
            Err(Error::NotReady)
        } else {
            Ok(())
        }
    }

    fn handler(&self) -> Option<Arc<dyn AccepterEventHandler>> {
        self.inner.handler.read().clone()
    }

    /// Replaces the event handler.
    pub fn set_event_handler(&self, handler: Option<Arc<dyn AccepterEventHandler>>) {
        *self.inner.handler.write() = handler;
    }

    /// Starts listening.
    pub fn startup(&self) -> Result<()> {
        self.check_live()?;
        self.inner.transport.startup()
    }

    /// Stops listening; `done` runs once the listener is closed.
    pub fn shutdown<F>(&self, done: F) -> Result<()>
    where
        F: FnOnce(&Accepter) + Send + 'static,
    {
        self.check_live()?;
        let this = self.clone();
        self.inner.transport.shutdown(Box::new(move || {
            let _ = guarded("shutdown completion", || {
                done(&this);
                Ok(())
            });
        }))
    }

    /// Stops listening, blocking until the listener is closed.
    pub fn shutdown_sync(&self) -> Result<()> {
        let waiter = self.inner.os.alloc_waiter();
        let w = waiter.clone();
        self.shutdown(move |_| w.wake())?;
        let _ = waiter.wait(1, None);
        Ok(())
    }

    /// Turns delivery of new connections on or off.
    pub fn set_accept_callback_enable(&self, enabled: bool) -> Result<()> {
        self.check_live()?;
        self.inner.transport.set_accept_callback_enable(enabled, None)
    }

    /// Like [`Accepter::set_accept_callback_enable`], running `done` once the
    /// change has taken effect.
    pub fn set_accept_callback_enable_cb<F>(&self, enabled: bool, done: F) -> Result<()>
    where
        F: FnOnce(&Accepter) + Send + 'static,
    {
        self.check_live()?;
        let this = self.clone();
        self.inner.transport.set_accept_callback_enable(
            enabled,
            Some(Box::new(move || {
                let _ = guarded("accept enable completion", || {
                    done(&this);
                    Ok(())
                });
            })),
        )
    }

    /// Blocking form of [`Accepter::set_accept_callback_enable_cb`].
    pub fn set_accept_callback_enable_sync(&self, enabled: bool) -> Result<()> {
        let waiter = self.inner.os.alloc_waiter();
        let w = waiter.clone();
        self.set_accept_callback_enable_cb(enabled, move |_| w.wake())?;
        let _ = waiter.wait(1, None);
        Ok(())
    }

    fn layers(&self) -> impl Iterator<Item = &Accepter> {
        iter::successors(Some(self), next_layer)
    }

    /// The layer `depth` levels below this one; 0 is this accepter.
    pub fn get_child(&self, depth: usize) -> Option<Accepter> {
        self.layers().nth(depth).cloned()
    }

    /// Gets or sets a control option; see
    /// [`StreamObject::control`](crate::StreamObject::control).
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

    /// The local port being listened on, or `"0"` if no layer has one.
    pub fn get_port(&self) -> Result<String> {
        let mut data = String::from("0");
        match self.control(ControlDepth::First, true, ControlOption::Lport, &mut data) {
            Ok(()) => Ok(data),
            Err(Error::NotSupported) => Ok(String::from("0")),
            Err(e) => Err(e),
        }
    }

    /// Queues new connections for [`Accepter::accept_sync`] instead of
    /// handing them to the event handler.
    pub fn set_sync(&self) -> Result<()> {
        self.check_live()?;
        let mut sync = self.inner.sync.lock();
        if sync.is_none() {
            *sync = Some(SyncAccept {
                queue: VecDeque::new(),
                waiter: self.inner.os.alloc_waiter(),
                intr_waiting: 0,
            });
        }
        Ok(())
    }

    /// Waits up to `timeout` for a connection.
    pub fn accept_sync(&self, timeout: Option<Duration>) -> Result<Outcome<StreamObject>> {
        self.accept_sync_inner(timeout, false)
    }

    /// Like [`Accepter::accept_sync`], but also stops on
    /// [`Accepter::interrupt_sync`].
    pub fn accept_sync_intr(&self, timeout: Option<Duration>) -> Result<Outcome<StreamObject>> {
        self.accept_sync_inner(timeout, true)
    }

    fn accept_sync_inner(
        &self,
        timeout: Option<Duration>,
        intr: bool,
    ) -> Result<Outcome<StreamObject>> {
        self.check_live()?;
        let waiter = match self.inner.sync.lock().as_mut() {
            Some(sync) => {
                sync.intr_waiting += usize::from(intr);
                sync.waiter.clone()
            }
            None => return Err(Error::NotReady),
        };
        let outcome = if intr {
            let outcome = waiter.wait_intr(1, timeout);
            if let Some(sync) = self.inner.sync.lock().as_mut() {
                sync.intr_waiting = sync.intr_waiting.saturating_sub(1);
            }
            outcome
        } else {
            waiter.wait(1, timeout)
        };
        match outcome {
            Outcome::Ready(()) => self
                .inner
                .sync
                .lock()
                .as_mut()
                .and_then(|sync| sync.queue.pop_front())
                .map(Outcome::Ready)
                .ok_or(Error::NotReady),
            Outcome::TimedOut => Ok(Outcome::TimedOut),
            Outcome::Interrupted => Ok(Outcome::Interrupted),
        }
    }

    /// Interrupts a blocked [`Accepter::accept_sync_intr`], which then
    /// returns [`Outcome::Interrupted`]. Returns whether such a call was
    /// waiting.
    pub fn interrupt_sync(&self) -> bool {
        match self.inner.sync.lock().as_ref() {
            Some(sync) if sync.intr_waiting > 0 => {
                sync.waiter.interrupt();
                true
            }
            _ => false,
        }
    }

    fn deliver_connection(&self, io: StreamObject) {
        let io = {
            let mut sync = self.inner.sync.lock();
            match sync.as_mut() {
                Some(sync) => {
                    sync.queue.push_back(io);
                    sync.waiter.wake();
                    return;
                }
                None => io,
            }
        };
        match self.handler() {
            Some(h) => {
                let _ = guarded("new_connection", || {
                    h.new_connection(self, io);
                    Ok(())
                });
            }
            None => {
                let _ = io.free();
            }
        }
    }

    /// Releases the accepter. Freeing twice fails with
    /// [`Error::NotReady`]. Queued, unaccepted connections are freed.
    pub fn free(&self) -> Result<()> {
        if self.inner.freed.swap(true, Ordering::AcqRel) {
            return Err(Error::NotReady);
        }
        tracing::debug!(kind = self.kind(), id = %self.inner.id, "freeing accepter");
        if let Some(sync) = self.inner.sync.lock().take() {
            for io in sync.queue {
                let _ = io.free();
            }
            sync.waiter.wake();
        }
        self.inner.transport.free();
        Ok(())
    }

    pub(crate) fn notify_freed(&self) {
        tracing::debug!(kind = self.kind(), id = %self.inner.id, "accepter freed");
        let handler = self.inner.handler.write().take();
        if let Some(h) = handler {
            let _ = guarded("accepter freed", || {
                h.freed();
                Ok(())
            });
        }
        if let (true, Some(child)) = (self.inner.owns_child, &self.inner.child) {
            if let Err(e) = child.free() {
                tracing::debug!(error = %e, "freeing owned child accepter failed");
            }
        }
    }
}

fn next_layer<'a>(acc: &&'a Accepter) -> Option<&'a Accepter> {
    acc.inner.child.as_ref()
}

impl PartialEq for Accepter {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for Accepter {}

impl fmt::Debug for Accepter {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Accepter")
            .field("id", &self.inner.id)
            .field("kind", &self.kind())
            .finish()
    }
}
