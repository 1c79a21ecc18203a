//! The provider contract: what a transport implements, and how it reports
//! native events back up to the stream object wrapping it.

use crate::{
    arena::Handle,
    context::ContextInner,
    error::{Error, Result},
    event::{Event, SerialEvent},
    serial::SerialControl,
    stream::StreamObject,
};
use std::{
    fmt,
    io::IoSlice,
    sync::{Arc, Weak},
};

/// Open completion handed to a transport.
pub type OpenDone = Box<dyn FnOnce(Result<()>) + Send + 'static>;

/// Close completion handed to a transport.
pub type CloseDone = Box<dyn FnOnce() + Send + 'static>;

/// A control option.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum ControlOption {
    /// Remote address. `get` takes a decimal index in `data`, and replaces
    /// it with the address string.
    Raddr,
    /// Local address.
    Laddr,
    /// Local port.
    Lport,
    /// A transport-specific option number.
    Other(u32),
}

/// Which layers of a stack a control call addresses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlDepth {
    /// Every layer that supports the option. Only valid for `set`.
    All,
    /// The first layer, from the top, that supports the option.
    First,
    /// Exactly the layer at this depth; 0 is the top.
    At(usize),
}

/// A transport provider: one native endpoint type.
///
/// Implementations must not call completions or [`EventSink`] methods from
/// inside these calls; they schedule that work through
/// [`deferred`](crate::deferred) instead.
pub trait Transport: Send + Sync + 'static {
    /// The kind name, as used in transport strings.
    fn kind(&self) -> &str;

    /// Starts opening. `done` runs later with the result.
    fn open(&self, done: OpenDone) -> Result<()>;

    /// Starts closing. `done` runs later.
    fn close(&self, done: CloseDone) -> Result<()>;

    /// Queues data, returning how many bytes were accepted.
    fn write_sg(&self, sg: &[IoSlice<'_>]) -> Result<usize>;

    /// Turns read delivery on or off.
    fn set_read_callback_enable(&self, enabled: bool);

    /// Turns write-ready delivery on or off.
    fn set_write_callback_enable(&self, enabled: bool);

    /// Gets or sets a control option.
    fn control(&self, get: bool, option: ControlOption, data: &mut String) -> Result<()> {
        let _ = (get, option, data);
        Err(Error::NotSupported)
    }

    /// Drops native resources without a close handshake.
    fn disable(&self) -> Result<()> {
        Err(Error::NotSupported)
    }

    /// Creates a sub-channel reporting through `sink`.
    fn alloc_channel(&self, args: &[&str], sink: EventSink) -> Result<Arc<dyn Transport>> {
        let _ = (args, sink);
        Err(Error::NotSupported)
    }

    /// Serial control, if this transport has it.
    fn serial(&self) -> Option<&dyn SerialControl> {
        None
    }

    /// Drops the wrapper's reference. The transport calls
    /// [`EventSink::freed`] once its last reference is gone.
    fn free(&self);
}

/// A transport's way back to its wrapper.
///
/// Holds only the wrapper's id and a weak reference to the context, so
/// events reported after the wrapper is gone are dropped.
#[derive(Clone)]
pub struct EventSink {
    id: Handle,
    ctx: Weak<ContextInner>,
}

impl EventSink {
    pub(crate) fn new(id: Handle, ctx: Weak<ContextInner>) -> Self {
        Self { id, ctx }
    }

    /// The wrapper's id.
    pub fn id(&self) -> Handle {
        self.id
    }

    fn resolve(&self) -> Result<(Arc<ContextInner>, StreamObject)> {
        let ctx = self.ctx.upgrade().ok_or(Error::NotReady)?;
        let io = ctx.stream(self.id).ok_or(Error::NotReady)?;
        Ok((ctx, io))
    }

    fn deliver(&self, event: Event<'_>) -> Result<usize> {
        let (_ctx, io) = self.resolve()?;
        io.dispatch(event)
    }

    /// Reports data or a read error. Returns the number of bytes consumed.
    pub fn read(&self, err: Option<&Error>, data: &[u8], aux: &[&str]) -> Result<usize> {
        self.deliver(Event::Read { err, data, aux })
    }

    /// Reports that more data can be written.
    pub fn write_ready(&self) -> Result<()> {
        self.deliver(Event::WriteReady).map(drop)
    }

    /// Reports a break from the peer.
    pub fn send_break(&self) -> Result<()> {
        self.deliver(Event::SendBreak).map(drop)
    }

    /// Reports that authentication is starting.
    pub fn auth_begin(&self) -> Result<()> {
        self.deliver(Event::AuthBegin).map(drop)
    }

    /// Reports an unverified peer certificate.
    pub fn precert_verify(&self) -> Result<()> {
        self.deliver(Event::PrecertVerify).map(drop)
    }

    /// Reports the outcome of certificate verification.
    pub fn postcert_verify(&self, err: Option<&Error>, errstr: Option<&str>) -> Result<()> {
        self.deliver(Event::PostcertVerify { err, errstr }).map(drop)
    }

    /// Asks the owner to verify a password.
    pub fn password_verify(&self, password: &str) -> Result<()> {
        self.deliver(Event::PasswordVerify(password)).map(drop)
    }

    /// Asks the owner for a password.
    pub fn request_password(&self) -> Result<String> {
        let mut password = String::new();
        self.deliver(Event::RequestPassword(&mut password))?;
        Ok(password)
    }

    /// Reports a serial-control event.
    pub fn serial(&self, event: SerialEvent<'_>) -> Result<()> {
        self.deliver(Event::Serial(event)).map(drop)
    }

    /// Reports a channel opened by the peer. `build` constructs the channel's
    /// transport around the sink it is given.
    pub fn new_channel<F>(&self, aux: &[&str], build: F) -> Result<()>
    where
        F: FnOnce(EventSink) -> Result<Arc<dyn Transport>>,
    {
        let (ctx, io) = self.resolve()?;
        let channel = ctx.wrap_stream(None, false, None, build)?;
        io.dispatch(Event::NewChannel { channel, aux }).map(drop)
    }

    /// Reports that the transport's last reference is gone.
    pub fn freed(&self) {
        if let Some(ctx) = self.ctx.upgrade() {
            if let Some(io) = ctx.remove_stream(self.id) {
                io.notify_freed();
            }
        }
    }
}

impl fmt::Debug for EventSink {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("EventSink").field("id", &self.id).finish()
    }
}
