//! Serial-port control on top of a stream.
//!
//! A transport that can drive line settings exposes a [`SerialControl`];
//! [`StreamObject::serial`] wraps it in a [`SerialStream`] offering each
//! operation in completion-callback and blocking form.

use crate::{
    error::{Error, Outcome, Result},
    stream::StreamObject,
};
use parking_lot::Mutex;
use std::{sync::Arc, time::Duration};

/// A serial line setting or signal.
///
/// Passing a value of 0 to any operation queries the current value without
/// changing it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[non_exhaustive]
pub enum SerialOp {
    /// Bits per second.
    Baud,
    /// Bits per character, 5 through 8.
    Datasize,
    /// One of the `PARITY_*` values.
    Parity,
    /// 1 or 2.
    Stopbits,
    /// One of the `FLOWCONTROL_*` values.
    FlowControl,
    /// Input flow control.
    IFlowControl,
    /// `ON` or `OFF`.
    Break,
    /// `ON` or `OFF`.
    Dtr,
    /// `ON` or `OFF`.
    Rts,
    /// Clear-to-send, read only on most ports.
    Cts,
    /// Carrier detect / data-set ready.
    DcdDsr,
    /// Ring indicator.
    Ri,
}

/// No parity bit.
pub const PARITY_NONE: u32 = 1;
/// Odd parity.
pub const PARITY_ODD: u32 = 2;
/// Even parity.
pub const PARITY_EVEN: u32 = 3;
/// Parity bit always set.
pub const PARITY_MARK: u32 = 4;
/// Parity bit always clear.
pub const PARITY_SPACE: u32 = 5;

/// No flow control.
pub const FLOWCONTROL_NONE: u32 = 1;
/// Software flow control.
pub const FLOWCONTROL_XON_XOFF: u32 = 2;
/// Hardware flow control.
pub const FLOWCONTROL_RTS_CTS: u32 = 3;

/// Signal asserted.
pub const ON: u32 = 1;
/// Signal deasserted.
pub const OFF: u32 = 2;

/// Completion of a serial operation, carrying the resulting value.
pub type SerialDone = Box<dyn FnOnce(Result<u32>) + Send + 'static>;

/// Completion of a signature request.
pub type SignatureDone = Box<dyn FnOnce(Result<Vec<u8>>) + Send + 'static>;

/// Serial operations implemented by a transport.
///
/// Each call either fails immediately or arranges for `done` to run later,
/// off the caller's stack.
pub trait SerialControl: Send + Sync {
    /// Gets or sets `op`.
    fn serial_op(&self, op: SerialOp, value: u32, done: Option<SerialDone>) -> Result<()>;

    /// Requests the port signature.
    fn signature(&self, done: Option<SignatureDone>) -> Result<()> {
        let _ = done;
        Err(Error::NotSupported)
    }

    /// Pushes a new modem state to the peer.
    fn modemstate(&self, state: u32) -> Result<()> {
        let _ = state;
        Err(Error::NotSupported)
    }

    /// Pushes a new line state to the peer.
    fn linestate(&self, state: u32) -> Result<()> {
        let _ = state;
        Err(Error::NotSupported)
    }

    /// Asks the peer to stop or resume sending.
    fn flow_state(&self, state: bool) -> Result<()> {
        let _ = state;
        Err(Error::NotSupported)
    }
}

/// Serial view of a stream whose transport supports serial control.
#[derive(Debug, Clone, Copy)]
pub struct SerialStream<'a> {
    io: &'a StreamObject,
}

macro_rules! serial_ops {
    ($($(#[$doc:meta])* $op:ident => $name:ident, $name_sync:ident;)*) => {
        $(
            $(#[$doc])*
            pub fn $name<F>(&self, value: u32, done: F) -> Result<()>
            where
                F: FnOnce(Result<u32>) + Send + 'static,
            {
                self.op(SerialOp::$op, value, done)
            }

            /// Blocking form; see the asynchronous variant.
            pub fn $name_sync(&self, value: u32) -> Result<u32> {
                self.op_sync(SerialOp::$op, value)
            }
        )*
    };
}

impl<'a> SerialStream<'a> {
    pub(crate) fn new(io: &'a StreamObject) -> Self {
        Self { io }
    }

    /// The underlying stream.
    pub fn stream(&self) -> &'a StreamObject {
        self.io
    }

    fn control(&self) -> Result<&'a dyn SerialControl> {
        self.io.serial_control().ok_or(Error::NotSupported)
    }

    /// Gets or sets `op`, reporting the resulting value through `done`.
    pub fn op<F>(&self, op: SerialOp, value: u32, done: F) -> Result<()>
    where
        F: FnOnce(Result<u32>) + Send + 'static,
    {
        self.control()?.serial_op(op, value, Some(Box::new(done)))
    }

    /// Gets or sets `op`, blocking until the transport answers.
    pub fn op_sync(&self, op: SerialOp, value: u32) -> Result<u32> {
        let waiter = self.io.os().alloc_waiter();
        let slot = Arc::new(Mutex::new(None));
        let (w, s) = (waiter.clone(), slot.clone());
        self.op(op, value, move |result| {
            *s.lock() = Some(result);
            w.wake();
        })?;
        let _ = waiter.wait(1, None);
        let result = slot.lock().take();
        result.unwrap_or(Err(Error::NotReady))
    }

    serial_ops! {
        /// Gets or sets the baud rate.
        Baud => baud, baud_sync;
        /// Gets or sets the character size.
        Datasize => datasize, datasize_sync;
        /// Gets or sets the parity.
        Parity => parity, parity_sync;
        /// Gets or sets the number of stop bits.
        Stopbits => stopbits, stopbits_sync;
        /// Gets or sets output flow control.
        FlowControl => flowcontrol, flowcontrol_sync;
        /// Gets or sets input flow control.
        IFlowControl => iflowcontrol, iflowcontrol_sync;
        /// Gets or sets the break condition.
        Break => sbreak, sbreak_sync;
        /// Gets or sets DTR.
        Dtr => dtr, dtr_sync;
        /// Gets or sets RTS.
        Rts => rts, rts_sync;
        /// Gets CTS.
        Cts => cts, cts_sync;
        /// Gets DCD/DSR.
        DcdDsr => dcd_dsr, dcd_dsr_sync;
        /// Gets the ring indicator.
        Ri => ri, ri_sync;
    }

    /// Requests the port signature.
    pub fn signature<F>(&self, done: F) -> Result<()>
    where
        F: FnOnce(Result<Vec<u8>>) + Send + 'static,
    {
        self.control()?.signature(Some(Box::new(done)))
    }

    /// Blocking form of [`SerialStream::signature`], with an optional
    /// timeout.
    pub fn signature_sync(&self, timeout: Option<Duration>) -> Result<Outcome<Vec<u8>>> {
        let waiter = self.io.os().alloc_waiter();
        let slot = Arc::new(Mutex::new(None));
        let (w, s) = (waiter.clone(), slot.clone());
        self.signature(move |result| {
            *s.lock() = Some(result);
            w.wake();
        })?;
        match waiter.wait(1, timeout) {
            Outcome::Ready(()) => match slot.lock().take() {
                Some(result) => result.map(Outcome::Ready),
                None => Err(Error::NotReady),
            },
            Outcome::TimedOut => Ok(Outcome::TimedOut),
            Outcome::Interrupted => Ok(Outcome::Interrupted),
        }
    }

    /// Pushes a modem state.
    pub fn modemstate(&self, state: u32) -> Result<()> {
        self.control()?.modemstate(state)
    }

    /// Pushes a line state.
    pub fn linestate(&self, state: u32) -> Result<()> {
        self.control()?.linestate(state)
    }

    /// Asks the peer to stop or resume sending.
    pub fn flow_state(&self, state: bool) -> Result<()> {
        self.control()?.flow_state(state)
    }
}
