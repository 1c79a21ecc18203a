//! Kind names to provider factories.

use crate::{
    accepter::{Accepter, AccepterSink, AccepterTransport},
    context::Context,
    error::{Error, Result},
    spec::TransportSpec,
    stream::StreamObject,
    transport::{EventSink, Transport},
};
use std::{collections::HashMap, fmt, sync::Arc};

/// Everything a stream factory gets.
pub struct NewStream<'a> {
    /// The owning context.
    pub ctx: &'a Context,
    /// The parsed transport string for this layer.
    pub spec: &'a TransportSpec,
    /// The layer below, for layered providers.
    pub child: Option<&'a StreamObject>,
    /// Where the new transport reports events.
    pub sink: EventSink,
}

/// Everything an accepter factory gets.
pub struct NewAccepter<'a> {
    /// The owning context.
    pub ctx: &'a Context,
    /// The parsed transport string for this layer.
    pub spec: &'a TransportSpec,
    /// The layer below, for layered providers.
    pub child: Option<&'a Accepter>,
    /// Where the new accepter reports events.
    pub sink: AccepterSink,
}

/// Builds a stream transport.
pub type StreamFactory =
    Arc<dyn Fn(NewStream<'_>) -> Result<Arc<dyn Transport>> + Send + Sync + 'static>;

/// Builds an accepter transport.
pub type AccepterFactory =
    Arc<dyn Fn(NewAccepter<'_>) -> Result<Arc<dyn AccepterTransport>> + Send + Sync + 'static>;

#[derive(Clone)]
pub(crate) struct Entry<F> {
    pub(crate) factory: F,
    /// Layered providers sit on top of the stream named by `rest`.
    pub(crate) layered: bool,
}

/// The set of transport kinds a [`Context`] can allocate.
#[derive(Clone, Default)]
pub struct Registry {
    streams: HashMap<String, Entry<StreamFactory>>,
    accepters: HashMap<String, Entry<AccepterFactory>>,
}

impl Registry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry holding every provider built into this crate.
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        crate::providers::register_builtins(&mut registry);
        registry
    }

    /// Registers a stream provider that owns its own endpoint.
    pub fn register_stream<F>(&mut self, kind: &str, factory: F) -> Result<()>
    where
        F: Fn(NewStream<'_>) -> Result<Arc<dyn Transport>> + Send + Sync + 'static,
    {
        self.insert_stream(kind, Arc::new(factory), false)
    }

    /// Registers a stream provider that stacks on a child stream.
    pub fn register_filter<F>(&mut self, kind: &str, factory: F) -> Result<()>
    where
        F: Fn(NewStream<'_>) -> Result<Arc<dyn Transport>> + Send + Sync + 'static,
    {
        self.insert_stream(kind, Arc::new(factory), true)
    }

    /// Registers an accepter provider.
    pub fn register_accepter<F>(&mut self, kind: &str, factory: F) -> Result<()>
    where
        F: Fn(NewAccepter<'_>) -> Result<Arc<dyn AccepterTransport>> + Send + Sync + 'static,
    {
        self.insert_accepter(kind, Arc::new(factory), false)
    }

    /// Registers an accepter provider that stacks on a child accepter.
    pub fn register_accepter_filter<F>(&mut self, kind: &str, factory: F) -> Result<()>
    where
        F: Fn(NewAccepter<'_>) -> Result<Arc<dyn AccepterTransport>> + Send + Sync + 'static,
    {
        self.insert_accepter(kind, Arc::new(factory), true)
    }

    fn insert_accepter(
        &mut self,
        kind: &str,
        factory: AccepterFactory,
        layered: bool,
    ) -> Result<()> {
        if self.accepters.contains_key(kind) {
            return Err(Error::invalid(format!("accepter kind {kind:?} already registered")));
        }
        self.accepters
            .insert(kind.to_owned(), Entry { factory, layered });
        Ok(())
    }

    fn insert_stream(&mut self, kind: &str, factory: StreamFactory, layered: bool) -> Result<()> {
        if self.streams.contains_key(kind) {
            return Err(Error::invalid(format!("stream kind {kind:?} already registered")));
        }
        self.streams
            .insert(kind.to_owned(), Entry { factory, layered });
        Ok(())
    }

    pub(crate) fn stream(&self, kind: &str) -> Result<&Entry<StreamFactory>> {
        self.streams
            .get(kind)
            .ok_or_else(|| Error::invalid(format!("unknown stream kind {kind:?}")))
    }

    pub(crate) fn accepter(&self, kind: &str) -> Result<&Entry<AccepterFactory>> {
        self.accepters
            .get(kind)
            .ok_or_else(|| Error::invalid(format!("unknown accepter kind {kind:?}")))
    }

    /// Registered stream kinds, sorted.
    pub fn stream_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.streams.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }

    /// Registered accepter kinds, sorted.
    pub fn accepter_kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.accepters.keys().map(String::as_str).collect();
        kinds.sort_unstable();
        kinds
    }
}

impl fmt::Debug for Registry {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        f.debug_struct("Registry")
            .field("streams", &self.stream_kinds())
            .field("accepters", &self.accepter_kinds())
            .finish()
    }
}
