//! Routing of inbound messages to registered handlers by message type.

use std::{collections::HashMap, sync::Arc, sync::Mutex};

use async_trait::async_trait;
use futures::future::BoxFuture;

use crate::{
    connection::StaticConnection,
    error::{StaticAgentError, StaticAgentResult},
    message::Message,
};

/// A message handler registered against a type URI. Handlers receive a
/// reference to the connection so they can reply; the reference must not
/// be held past the dispatch call.
#[async_trait]
pub trait Handler: Send + Sync {
    async fn handle(
        &self,
        message: Message,
        connection: &StaticConnection,
    ) -> StaticAgentResult<()>;
}

type HandlerFn = Box<
    dyn for<'a> Fn(Message, &'a StaticConnection) -> BoxFuture<'a, StaticAgentResult<()>>
        + Send
        + Sync,
>;

/// Adapter turning an async closure into a [`Handler`].
pub struct FnHandler {
    func: HandlerFn,
}

impl FnHandler {
    pub fn new<F>(func: F) -> Arc<Self>
    where
        F: for<'a> Fn(Message, &'a StaticConnection) -> BoxFuture<'a, StaticAgentResult<()>>
            + Send
            + Sync
            + 'static,
    {
        Arc::new(Self {
            func: Box::new(func),
        })
    }
}

#[async_trait]
impl Handler for FnHandler {
    async fn handle(
        &self,
        message: Message,
        connection: &StaticConnection,
    ) -> StaticAgentResult<()> {
        (self.func)(message, connection).await
    }
}

/// A group of related handlers registered together, usually one protocol.
pub trait Module: Send + Sync {
    fn routes(&self) -> Vec<(String, Arc<dyn Handler>)>;
}

/// Handler registry. Dispatch matches on the full message type URI.
#[derive(Default)]
pub struct Dispatcher {
    handlers: Mutex<HashMap<String, Arc<dyn Handler>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_handler(&self, type_uri: impl Into<String>, handler: Arc<dyn Handler>) {
        self.handlers
            .lock()
            .expect("unpoisoned mutex")
            .insert(type_uri.into(), handler);
    }

    pub fn add_handlers(&self, handlers: Vec<(String, Arc<dyn Handler>)>) {
        let mut registry = self.handlers.lock().expect("unpoisoned mutex");
        for (type_uri, handler) in handlers {
            registry.insert(type_uri, handler);
        }
    }

    pub fn clear_handlers(&self) {
        self.handlers.lock().expect("unpoisoned mutex").clear();
    }

    pub fn registered_types(&self) -> Vec<String> {
        self.handlers
            .lock()
            .expect("unpoisoned mutex")
            .keys()
            .cloned()
            .collect()
    }

    pub async fn dispatch(
        &self,
        message: Message,
        connection: &StaticConnection,
    ) -> StaticAgentResult<()> {
        let handler = self
            .handlers
            .lock()
            .expect("unpoisoned mutex")
            .get(message.msg_type().as_str())
            .cloned()
            .ok_or_else(|| {
                StaticAgentError::NoRegisteredRoute(message.msg_type().to_string())
            })?;
        trace!("Dispatching message {} to handler", message.id());
        handler.handle(message, connection).await
    }
}
