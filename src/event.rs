//! The callback contract between a stream object and its owner.
//!
//! Handlers are plain traits with default methods; a stream holds at most
//! one [`EventInterface`], whose variant records once, at registration,
//! whether the owner also understands serial-control events.

use crate::{
    error::{Error, Result},
    serial::SerialOp,
    stream::StreamObject,
};
use std::{
    any::Any,
    fmt,
    panic::{self, AssertUnwindSafe},
    sync::Arc,
};

/// Callbacks for stream events.
///
/// Every method has a default, so implementors only override what they
/// handle. Callbacks are never invoked while the stream's internal lock is
/// held, so they may call back into the stream freely.
pub trait EventHandler: Send + Sync {
    /// Data (or a read error) arrived. Returns how many bytes were consumed;
    /// unconsumed bytes are offered again later.
    fn read(
        &self,
        io: &StreamObject,
        err: Option<&Error>,
        data: &[u8],
        aux: &[&str],
    ) -> Result<usize> {
        let _ = (io, err, aux);
        Ok(data.len())
    }

    /// The stream can accept more data.
    ///
    /// The default disables further write-ready notifications so an
    /// unhandled, always-writable stream does not spin.
    fn write_ready(&self, io: &StreamObject) {
        io.set_write_callback_enable(false);
    }

    /// The remote end opened a sub-channel. The default frees it.
    fn new_channel(&self, io: &StreamObject, channel: StreamObject, aux: &[&str]) {
        let _ = (io, aux);
        if let Err(e) = channel.free() {
            tracing::debug!(error = %e, "freeing unclaimed channel failed");
        }
    }

    /// The remote end sent a break.
    fn send_break(&self, io: &StreamObject) {
        let _ = io;
    }

    /// Authentication is starting.
    fn auth_begin(&self, io: &StreamObject) -> Result<()> {
        let _ = io;
        Err(Error::NotSupported)
    }

    /// A peer certificate is available but not yet verified.
    fn precert_verify(&self, io: &StreamObject) -> Result<()> {
        let _ = io;
        Err(Error::NotSupported)
    }

    /// Certificate verification finished, with `err` set if it failed.
    fn postcert_verify(
        &self,
        io: &StreamObject,
        err: Option<&Error>,
        errstr: Option<&str>,
    ) -> Result<()> {
        let _ = (io, err, errstr);
        Err(Error::NotSupported)
    }

    /// Verify a password presented by the peer.
    fn password_verify(&self, io: &StreamObject, password: &str) -> Result<()> {
        let _ = (io, password);
        Err(Error::NotSupported)
    }

    /// Supply a password to present to the peer.
    fn request_password(&self, io: &StreamObject) -> Result<String> {
        let _ = io;
        Err(Error::NotSupported)
    }

    /// The stream has been torn down; no further callbacks will follow.
    fn freed(&self) {}
}

/// Callbacks for serial-control events.
pub trait SerialEventHandler: Send + Sync {
    /// Modem state lines changed.
    fn modemstate(&self, io: &StreamObject, state: u32) {
        let _ = (io, state);
    }

    /// Line state (overrun, parity error, break) changed.
    fn linestate(&self, io: &StreamObject, state: u32) {
        let _ = (io, state);
    }

    /// The peer asked us to stop (`false`) or resume (`true`) sending.
    fn flow_state(&self, io: &StreamObject, state: bool) {
        let _ = (io, state);
    }

    /// The peer asked for buffers to be flushed.
    fn flush(&self, io: &StreamObject, which: u32) {
        let _ = (io, which);
    }

    /// The peer asked for a sync.
    fn sync(&self, io: &StreamObject) {
        let _ = io;
    }

    /// The peer sent its signature.
    fn signature(&self, io: &StreamObject, sig: &[u8]) {
        let _ = (io, sig);
    }

    /// The peer requested a setting. Answer through the stream's
    /// [`serial`](StreamObject::serial) operations.
    fn request(&self, io: &StreamObject, op: SerialOp, value: u32) {
        let _ = (io, op, value);
    }
}

/// The registered handler of a stream, tagged with its capabilities.
#[derive(Clone)]
pub enum EventInterface {
    /// Base stream events only.
    Stream(Arc<dyn EventHandler>),
    /// Base stream events plus serial-control events.
    Serial {
        /// Receives base stream events.
        base: Arc<dyn EventHandler>,
        /// Receives serial-control events.
        serial: Arc<dyn SerialEventHandler>,
    },
}

impl EventInterface {
    /// Wraps a base handler.
    pub fn stream<H: EventHandler + 'static>(handler: H) -> Self {
        Self::Stream(Arc::new(handler))
    }

    /// Wraps a handler that also takes serial-control events.
    pub fn serial<H: EventHandler + SerialEventHandler + 'static>(handler: H) -> Self {
        let handler = Arc::new(handler);
        Self::Serial {
            base: handler.clone(),
            serial: handler,
        }
    }

    pub(crate) fn base(&self) -> &dyn EventHandler {
        match self {
            Self::Stream(base) | Self::Serial { base, .. } => &**base,
        }
    }
}

impl fmt::Debug for EventInterface {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match self {
            Self::Stream(_) => f.write_str("EventInterface::Stream"),
            Self::Serial { .. } => f.write_str("EventInterface::Serial"),
        }
    }
}

/// A serial-control event pushed up from a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SerialEvent<'a> {
    /// Modem state lines changed.
    Modemstate(u32),
    /// Line state changed.
    Linestate(u32),
    /// Flow control state changed.
    FlowState(bool),
    /// Flush request.
    Flush(u32),
    /// Sync request.
    Sync,
    /// Signature from the peer.
    Signature(&'a [u8]),
    /// The peer requested a setting.
    Request(SerialOp, u32),
}

/// An inbound native event, before translation into a handler call.
pub(crate) enum Event<'a> {
    Read {
        err: Option<&'a Error>,
        data: &'a [u8],
        aux: &'a [&'a str],
    },
    WriteReady,
    NewChannel {
        channel: StreamObject,
        aux: &'a [&'a str],
    },
    SendBreak,
    AuthBegin,
    PrecertVerify,
    PostcertVerify {
        err: Option<&'a Error>,
        errstr: Option<&'a str>,
    },
    PasswordVerify(&'a str),
    RequestPassword(&'a mut String),
    Serial(SerialEvent<'a>),
}

/// Calls into user code, turning a panic into [`Error::AppError`].
pub(crate) fn guarded<R>(what: &'static str, f: impl FnOnce() -> Result<R>) -> Result<R> {
    match panic::catch_unwind(AssertUnwindSafe(f)) {
        Ok(result) => result,
        Err(payload) => {
            tracing::error!(
                callback = what,
                panic = panic_message(&*payload),
                "callback panicked; reporting an application error"
            );
            Err(Error::AppError)
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&'static str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}

/// Dispatches a serial event to `handler`.
pub(crate) fn dispatch_serial(
    handler: &dyn SerialEventHandler,
    io: &StreamObject,
    event: SerialEvent<'_>,
) {
    match event {
        SerialEvent::Modemstate(v) => handler.modemstate(io, v),
        SerialEvent::Linestate(v) => handler.linestate(io, v),
        SerialEvent::FlowState(v) => handler.flow_state(io, v),
        SerialEvent::Flush(v) => handler.flush(io, v),
        SerialEvent::Sync => handler.sync(io),
        SerialEvent::Signature(sig) => handler.signature(io, sig),
        SerialEvent::Request(op, v) => handler.request(io, op, v),
    }
}
