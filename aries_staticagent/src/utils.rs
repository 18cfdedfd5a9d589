//! Handler combinators and small helpers shared across protocol modules.
//!
//! The combinators wrap a [`Handler`] with preprocessing, validation, or
//! trust gating, mirroring the layered checks protocol handlers usually
//! want before touching a message.

use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use futures::future::BoxFuture;
use serde_json::{json, Value};

use crate::{
    connection::StaticConnection,
    crypto::bytes_to_b58,
    dispatcher::Handler,
    error::{StaticAgentError, StaticAgentResult},
    message::{Message, MessageError, FORWARD},
    mtc::{
        ContextFlags, ANONCRYPT_AFFIRMED, ANONCRYPT_DENIED, AUTHCRYPT_AFFIRMED, AUTHCRYPT_DENIED,
    },
};

/// Current UTC time in the `YYYY-MM-DD HH:MM:SS.ffffff+00:00` form used
/// by timing decorators.
pub fn timestamp() -> String {
    Utc::now().format("%Y-%m-%d %H:%M:%S%.6f%:z").to_string()
}

/// Build a forward message instructing a mediator to deliver `msg` to the
/// recipient key `to`.
pub fn forward_msg(to: &[u8], msg: Value) -> Result<Message, MessageError> {
    Message::from_value(json!({
        "@type": FORWARD,
        "to": bytes_to_b58(to),
        "msg": msg,
    }))
}

struct Preprocess<F> {
    processor: F,
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl<F> Handler for Preprocess<F>
where
    F: Fn(Message) -> StaticAgentResult<Message> + Send + Sync,
{
    async fn handle(
        &self,
        message: Message,
        connection: &StaticConnection,
    ) -> StaticAgentResult<()> {
        let message = (self.processor)(message)?;
        self.inner.handle(message, connection).await
    }
}

/// Run `processor` over the message before the wrapped handler sees it.
pub fn preprocess<F>(processor: F, handler: Arc<dyn Handler>) -> Arc<dyn Handler>
where
    F: Fn(Message) -> StaticAgentResult<Message> + Send + Sync + 'static,
{
    Arc::new(Preprocess {
        processor,
        inner: handler,
    })
}

struct PreprocessAsync<F> {
    processor: F,
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl<F> Handler for PreprocessAsync<F>
where
    F: Fn(Message) -> BoxFuture<'static, StaticAgentResult<Message>> + Send + Sync,
{
    async fn handle(
        &self,
        message: Message,
        connection: &StaticConnection,
    ) -> StaticAgentResult<()> {
        let message = (self.processor)(message).await?;
        self.inner.handle(message, connection).await
    }
}

/// As [`preprocess`], with an async processor.
pub fn preprocess_async<F>(processor: F, handler: Arc<dyn Handler>) -> Arc<dyn Handler>
where
    F: Fn(Message) -> BoxFuture<'static, StaticAgentResult<Message>> + Send + Sync + 'static,
{
    Arc::new(PreprocessAsync {
        processor,
        inner: handler,
    })
}

/// Validate (and optionally normalize) the message before handling.
/// Validation failures propagate to the dispatcher.
pub fn validate<F>(validator: F, handler: Arc<dyn Handler>) -> Arc<dyn Handler>
where
    F: Fn(Message) -> StaticAgentResult<Message> + Send + Sync + 'static,
{
    preprocess(validator, handler)
}

struct MtcGate {
    affirmed: ContextFlags,
    denied: ContextFlags,
    inner: Arc<dyn Handler>,
}

#[async_trait]
impl Handler for MtcGate {
    async fn handle(
        &self,
        message: Message,
        connection: &StaticConnection,
    ) -> StaticAgentResult<()> {
        let mtc = message.mtc();
        if mtc.affirmed() != self.affirmed || mtc.denied() != self.denied {
            return Err(StaticAgentError::InsufficientTrust(format!(
                "expected affirmed {:?} and denied {:?}; message affirmed {:?} and denied {:?}",
                self.affirmed,
                self.denied,
                mtc.affirmed(),
                mtc.denied(),
            )));
        }
        self.inner.handle(message, connection).await
    }
}

/// Refuse messages whose trust context does not exactly match the given
/// affirmed and denied flag sets.
pub fn require_mtc(
    affirmed: ContextFlags,
    denied: ContextFlags,
    handler: Arc<dyn Handler>,
) -> Arc<dyn Handler> {
    Arc::new(MtcGate {
        affirmed,
        denied,
        inner: handler,
    })
}

/// Accept only authcrypted messages.
pub fn authcrypted(handler: Arc<dyn Handler>) -> Arc<dyn Handler> {
    require_mtc(AUTHCRYPT_AFFIRMED, AUTHCRYPT_DENIED, handler)
}

/// Accept only anoncrypted messages.
pub fn anoncrypted(handler: Arc<dyn Handler>) -> Arc<dyn Handler> {
    require_mtc(ANONCRYPT_AFFIRMED, ANONCRYPT_DENIED, handler)
}
