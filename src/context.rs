//! The context owning every stream object and accepter, and the
//! configuration they are built with.

use crate::{
    accepter::{Accepter, AccepterEventHandler, AccepterSink, AccepterTransport},
    arena::{Arena, Handle},
    error::{Error, Result},
    event::EventInterface,
    os::{OsServices, ThreadedOs},
    registry::{NewAccepter, NewStream, Registry},
    spec::TransportSpec,
    stream::StreamObject,
    transport::{EventSink, Transport},
};
use cap_std::fs::Dir;
use parking_lot::Mutex;
use std::{fmt, sync::Arc, time::Duration};

/// Tunables shared by every provider in a context.
#[derive(Debug, Clone)]
pub struct Config {
    /// Scheduler threads for [`ThreadedOs`].
    pub workers: usize,
    /// Largest chunk a reader thread reads at once.
    pub read_buffer_size: usize,
    /// Bytes an fd-backed stream buffers before writes return short.
    pub write_buffer_size: usize,
    /// How long I/O threads sleep between checks for shutdown.
    pub poll_interval: Duration,
    /// How long a close waits for buffered output to drain before dropping
    /// it.
    pub close_timeout: Duration,
    /// Root of the sysfs tree used for device lookup; `/sys` if unset.
    pub sysfs: Option<Arc<Dir>>,
    /// Root of the device tree used for device lookup; `/dev` if unset.
    pub dev: Option<Arc<Dir>>,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workers: 2,
            read_buffer_size: 4096,
            write_buffer_size: 64 * 1024,
            poll_interval: Duration::from_millis(50),
            close_timeout: Duration::from_secs(5),
            sysfs: None,
            dev: None,
        }
    }
}

/// Builds a [`Context`].
#[derive(Default)]
pub struct ContextBuilder {
    os: Option<Arc<dyn OsServices>>,
    registry: Option<Registry>,
    config: Config,
}

impl ContextBuilder {
    /// A builder with default configuration, the built-in providers, and a
    /// threaded scheduler.
    pub fn new() -> Self {
        Self::default()
    }

    /// Uses `os` instead of spawning a [`ThreadedOs`].
    pub fn os(mut self, os: Arc<dyn OsServices>) -> Self {
        self.os = Some(os);
        self
    }

    /// Uses `registry` instead of [`Registry::with_builtins`].
    pub fn registry(mut self, registry: Registry) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Replaces the whole configuration.
    pub fn config(mut self, config: Config) -> Self {
        self.config = config;
        self
    }

    /// Sets the number of scheduler threads.
    pub fn workers(mut self, workers: usize) -> Self {
        self.config.workers = workers;
        self
    }

    /// Sets the read chunk size.
    pub fn read_buffer_size(mut self, size: usize) -> Self {
        self.config.read_buffer_size = size;
        self
    }

    /// Sets the write buffer size.
    pub fn write_buffer_size(mut self, size: usize) -> Self {
        self.config.write_buffer_size = size;
        self
    }

    /// Sets the I/O thread poll interval.
    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval = interval;
        self
    }

    /// Sets how long a close waits for output to drain.
    pub fn close_timeout(mut self, timeout: Duration) -> Self {
        self.config.close_timeout = timeout;
        self
    }

    /// Looks devices up under `sysfs` instead of `/sys`.
    pub fn sysfs_dir(mut self, sysfs: Dir) -> Self {
        self.config.sysfs = Some(Arc::new(sysfs));
        self
    }

    /// Opens devices under `dev` instead of `/dev`.
    pub fn dev_dir(mut self, dev: Dir) -> Self {
        self.config.dev = Some(Arc::new(dev));
        self
    }

    /// Creates the context.
    pub fn build(self) -> Result<Context> {
        if self.config.read_buffer_size == 0 || self.config.write_buffer_size == 0 {
            return Err(Error::invalid("buffer sizes must be non-zero"));
        }
        let os = match self.os {
            Some(os) => os,
            None => ThreadedOs::new(self.config.workers)?,
        };
        Ok(Context {
            inner: Arc::new(ContextInner {
                os,
                registry: self.registry.unwrap_or_else(Registry::with_builtins),
                config: self.config,
                streams: Mutex::new(Arena::new()),
                accepters: Mutex::new(Arena::new()),
            }),
        })
    }
}

/// Owns the stream objects and accepters allocated through it.
///
/// Cloning yields another handle to the same context.
#[derive(Clone)]
pub struct Context {
    inner: Arc<ContextInner>,
}

pub(crate) struct ContextInner {
    os: Arc<dyn OsServices>,
    registry: Registry,
    config: Config,
    streams: Mutex<Arena<StreamObject>>,
    accepters: Mutex<Arena<Accepter>>,
}

impl Context {
    /// A context with the default configuration.
    pub fn new() -> Result<Self> {
        ContextBuilder::new().build()
    }

    /// Starts building a context.
    pub fn builder() -> ContextBuilder {
        ContextBuilder::new()
    }

    pub(crate) fn from_inner(inner: Arc<ContextInner>) -> Self {
        Self { inner }
    }

    /// The scheduler.
    pub fn os(&self) -> &Arc<dyn OsServices> {
        &self.inner.os
    }

    /// The configuration.
    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// The provider registry.
    pub fn registry(&self) -> &Registry {
        &self.inner.registry
    }

    /// Allocates a stream (or stack of streams) from a transport string.
    pub fn alloc_stream(&self, spec: &str, handler: Option<EventInterface>) -> Result<StreamObject> {
        let spec = TransportSpec::parse(spec)?;
        self.alloc_parsed(&spec, None, handler)
    }

    /// Allocates a layered stream on top of an existing `child`.
    pub fn alloc_stream_on(
        &self,
        child: &StreamObject,
        spec: &str,
        handler: Option<EventInterface>,
    ) -> Result<StreamObject> {
        let spec = TransportSpec::parse(spec)?;
        self.alloc_parsed(&spec, Some(child.clone()), handler)
    }

    fn alloc_parsed(
        &self,
        spec: &TransportSpec,
        child: Option<StreamObject>,
        handler: Option<EventInterface>,
    ) -> Result<StreamObject> {
        let entry = self.inner.registry.stream(spec.kind())?;
        let (child, owned_child) = match (entry.layered, child) {
            (true, Some(child)) if spec.rest().is_empty() => (Some(child), false),
            (true, Some(_)) => {
                return Err(Error::invalid(format!(
                    "{}: a child was given, so no lower layer may be named",
                    spec.kind()
                )))
            }
            (true, None) if spec.rest().is_empty() => {
                return Err(Error::invalid(format!("{}: needs a lower layer", spec.kind())))
            }
            (true, None) => (Some(self.alloc_stream(spec.rest(), None)?), true),
            (false, Some(_)) => {
                return Err(Error::invalid(format!(
                    "{} does not stack on another stream",
                    spec.kind()
                )))
            }
            (false, None) => (None, false),
        };

        let result = self.inner.wrap_stream(child.clone(), owned_child, handler, |sink| {
            (entry.factory)(NewStream {
                ctx: self,
                spec,
                child: child.as_ref(),
                sink,
            })
        });
        if let (Err(_), Some(child), true) = (&result, &child, owned_child) {
            let _ = child.free();
        }
        result
    }

    /// Wraps a transport built by `build` around the sink it is given.
    pub fn wrap_stream<F>(&self, handler: Option<EventInterface>, build: F) -> Result<StreamObject>
    where
        F: FnOnce(EventSink) -> Result<Arc<dyn Transport>>,
    {
        self.inner.wrap_stream(None, false, handler, build)
    }

    /// Allocates an accepter from a transport string.
    pub fn alloc_accepter(
        &self,
        spec: &str,
        handler: Option<Arc<dyn AccepterEventHandler>>,
    ) -> Result<Accepter> {
        let spec = TransportSpec::parse(spec)?;
        self.alloc_accepter_parsed(&spec, None, handler)
    }

    /// Allocates a layered accepter on top of an existing `child`.
    pub fn alloc_accepter_on(
        &self,
        child: &Accepter,
        spec: &str,
        handler: Option<Arc<dyn AccepterEventHandler>>,
    ) -> Result<Accepter> {
        let spec = TransportSpec::parse(spec)?;
        self.alloc_accepter_parsed(&spec, Some(child.clone()), handler)
    }

    fn alloc_accepter_parsed(
        &self,
        spec: &TransportSpec,
        child: Option<Accepter>,
        handler: Option<Arc<dyn AccepterEventHandler>>,
    ) -> Result<Accepter> {
        let entry = self.inner.registry.accepter(spec.kind())?;
        let (child, owned_child) = match (entry.layered, child) {
            (true, Some(child)) if spec.rest().is_empty() => (Some(child), false),
            (true, Some(_)) => {
                return Err(Error::invalid(format!(
                    "{}: a child was given, so no lower layer may be named",
                    spec.kind()
                )))
            }
            (true, None) if spec.rest().is_empty() => {
                return Err(Error::invalid(format!("{}: needs a lower layer", spec.kind())))
            }
            (true, None) => (Some(self.alloc_accepter(spec.rest(), None)?), true),
            (false, Some(_)) => {
                return Err(Error::invalid(format!(
                    "{} does not stack on another accepter",
                    spec.kind()
                )))
            }
            (false, None) => (None, false),
        };
        let result = self.inner.wrap_accepter(child.clone(), owned_child, handler, |sink| {
            (entry.factory)(NewAccepter {
                ctx: self,
                spec,
                child: child.as_ref(),
                sink,
            })
        });
        if let (Err(_), Some(child), true) = (&result, &child, owned_child) {
            let _ = child.free();
        }
        result
    }

    /// Wraps an accepter transport built by `build`.
    pub fn wrap_accepter<F>(
        &self,
        handler: Option<Arc<dyn AccepterEventHandler>>,
        build: F,
    ) -> Result<Accepter>
    where
        F: FnOnce(AccepterSink) -> Result<Arc<dyn AccepterTransport>>,
    {
        self.inner.wrap_accepter(None, false, handler, build)
    }

    /// The stream object registered under `id`, if it is still alive.
    pub fn lookup_stream(&self, id: Handle) -> Option<StreamObject> {
        self.inner.stream(id)
    }

    /// The accepter registered under `id`, if it is still alive.
    pub fn lookup_accepter(&self, id: Handle) -> Option<Accepter> {
        self.inner.accepter(id)
    }

    /// Number of stream objects not yet freed.
    pub fn live_streams(&self) -> usize {
        self.inner.streams.lock().len()
    }

    /// Number of accepters not yet freed.
    pub fn live_accepters(&self) -> usize {
        self.inner.accepters.lock().len()
    }
}

impl fmt::Debug for Context {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Context")
            .field("registry", &self.inner.registry)
            .field("live_streams", &self.live_streams())
            .field("live_accepters", &self.live_accepters())
            .finish()
    }
}

impl ContextInner {
    pub(crate) fn stream(&self, id: Handle) -> Option<StreamObject> {
        self.streams.lock().get(id).cloned()
    }

    pub(crate) fn remove_stream(&self, id: Handle) -> Option<StreamObject> {
        self.streams.lock().remove(id)
    }

    pub(crate) fn accepter(&self, id: Handle) -> Option<Accepter> {
        self.accepters.lock().get(id).cloned()
    }

    pub(crate) fn remove_accepter(&self, id: Handle) -> Option<Accepter> {
        self.accepters.lock().remove(id)
    }

    /// Reserves an id, builds the transport around a sink carrying it, and
    /// registers the wrapper. The id is released if `build` fails.
    ///
    /// With `owns_child`, the wrapper frees `child` once it is freed itself.
    pub(crate) fn wrap_stream<F>(
        self: &Arc<Self>,
        child: Option<StreamObject>,
        owns_child: bool,
        handler: Option<EventInterface>,
        build: F,
    ) -> Result<StreamObject>
    where
        F: FnOnce(EventSink) -> Result<Arc<dyn Transport>>,
    {
        let id = self.streams.lock().reserve();
        let transport = match build(EventSink::new(id, Arc::downgrade(self))) {
            Ok(transport) => transport,
            Err(e) => {
                self.streams.lock().remove(id);
                return Err(e);
            }
        };
        let io = StreamObject::new(
            id,
            Arc::downgrade(self),
            Arc::clone(&self.os),
            transport,
            child,
            owns_child,
            handler,
        );
        self.streams.lock().fill(id, io.clone());
        tracing::debug!(kind = io.kind(), %id, "stream allocated");
        Ok(io)
    }

    pub(crate) fn wrap_accepter<F>(
        self: &Arc<Self>,
        child: Option<Accepter>,
        owns_child: bool,
        handler: Option<Arc<dyn AccepterEventHandler>>,
        build: F,
    ) -> Result<Accepter>
    where
        F: FnOnce(AccepterSink) -> Result<Arc<dyn AccepterTransport>>,
    {
        let id = self.accepters.lock().reserve();
        let transport = match build(AccepterSink::new(id, Arc::downgrade(self))) {
            Ok(transport) => transport,
            Err(e) => {
                self.accepters.lock().remove(id);
                return Err(e);
            }
        };
        let acc = Accepter::new(
            id,
            Arc::downgrade(self),
            Arc::clone(&self.os),
            transport,
            child,
            owns_child,
            handler,
        );
        self.accepters.lock().fill(id, acc.clone());
        tracing::debug!(kind = acc.kind(), %id, "accepter allocated");
        Ok(acc)
    }
}
