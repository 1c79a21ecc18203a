//! Layered, callback-driven stream objects.
//!
//! For a starting point, see [`Context`], which allocates [`StreamObject`]s
//! and [`Accepter`]s from transport strings such as `"tcp,localhost,2000"`
//! or `"stdio,cat"`. Every stream offers the same operations, and reports to
//! the same [`EventHandler`] contract, whatever sits underneath it.
//!
//! Callbacks never run inside the call that caused them and never with a
//! provider lock held; each provider funnels them through its
//! [`deferred`] runner on the context's [`OsServices`] scheduler. Code that
//! prefers to block can put a stream in sync mode and use
//! [`StreamObject::read_sync`] and [`StreamObject::write_sync`] instead.
//!
//! New kinds of transport implement [`Transport`] (or
//! [`AccepterTransport`]) and are made available by name through a
//! [`Registry`].

#![deny(missing_docs)]

mod accepter;
mod arena;
mod context;
pub mod deferred;
mod error;
mod event;
#[cfg(not(windows))]
mod lockers;
mod os;
pub mod providers;
mod registry;
pub mod serial;
mod spec;
mod stream;
mod transport;
mod waiter;

pub use accepter::{
    Accepter, AccepterDone, AccepterEventHandler, AccepterSink, AccepterTransport,
};
pub use arena::Handle;
pub use context::{Config, Context, ContextBuilder};
pub use error::{Error, Outcome, Result};
pub use event::{EventHandler, EventInterface, SerialEvent, SerialEventHandler};
pub use os::{Job, ManualOs, OsServices, ThreadedOs};
pub use registry::{AccepterFactory, NewAccepter, NewStream, Registry, StreamFactory};
pub use serial::{SerialControl, SerialOp, SerialStream};
pub use spec::TransportSpec;
pub use stream::StreamObject;
pub use transport::{CloseDone, ControlDepth, ControlOption, EventSink, OpenDone, Transport};
pub use waiter::Waiter;
