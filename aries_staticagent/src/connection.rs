//! The static agent connection: a long-lived, pre-provisioned peer
//! endpoint. The connection owns its key pair, knows how to reach one
//! remote peer (possibly through a chain of mediators), and carries the
//! machinery for packing, delivery, inbound dispatch, and request/reply
//! coordination.

use std::{
    sync::{Arc, Mutex, PoisonError},
    time::Duration,
};

use futures::future::BoxFuture;
use serde_json::Value;
use tokio::sync::{mpsc, Mutex as AsyncMutex};
use url::Url;

use crate::{
    crypto::{self, CryptoError, KeyInput, KeyPair},
    decorators::ReturnRoute,
    dispatcher::{Dispatcher, Handler, Module},
    error::{StaticAgentError, StaticAgentResult},
    message::Message,
    mtc::MessageTrustContext,
    transport::{HttpTransport, Transport},
    utils::forward_msg,
};

/// Predicate deciding whether an inbound message is held for
/// [`StaticConnection::await_message`] instead of dispatched.
pub type HoldPredicate = Arc<dyn Fn(&Message) -> bool + Send + Sync>;

/// A one-shot channel for sending packed bytes back over an already-open
/// inbound transport, used in place of opening a new outbound connection.
pub type ReplySender =
    Arc<dyn Fn(Vec<u8>) -> BoxFuture<'static, StaticAgentResult<()>> + Send + Sync>;

/// Partial update of the remote peer's addressing information. Absent
/// fields leave existing state untouched.
#[derive(Debug, Clone, Default)]
pub struct TheirInfo {
    pub endpoint: Option<Url>,
    pub their_vk: Option<KeyInput>,
    pub recipients: Option<Vec<KeyInput>>,
    pub routing_keys: Option<Vec<KeyInput>>,
}

#[derive(Debug, Clone, Default)]
struct PeerInfo {
    endpoint: Option<Url>,
    recipients: Option<Vec<Vec<u8>>>,
    routing_keys: Option<Vec<Vec<u8>>>,
}

/// Options for [`StaticConnection::send_message_with`].
#[derive(Debug, Clone, Default)]
pub struct SendOptions {
    /// Ask the peer to reply in-band on the same transport.
    pub return_route: Option<ReturnRoute>,
    /// Skip the encryption envelope entirely.
    pub plaintext: bool,
    /// Encrypt without authenticating as the sender.
    pub anoncrypt: bool,
}

pub struct StaticConnection {
    keys: KeyPair,
    peer: Mutex<PeerInfo>,
    dispatcher: Arc<Dispatcher>,
    transport: Arc<dyn Transport>,
    hold_condition: Mutex<HoldPredicate>,
    held_tx: mpsc::UnboundedSender<Message>,
    held_rx: AsyncMutex<mpsc::UnboundedReceiver<Message>>,
    reply: Mutex<Option<ReplySender>>,
}

impl StaticConnection {
    /// Construct a connection with the default dispatcher and HTTP
    /// transport.
    pub fn new(keys: KeyPair, info: TheirInfo) -> StaticAgentResult<Self> {
        Self::with_parts(
            keys,
            info,
            Arc::new(Dispatcher::new()),
            Arc::new(HttpTransport::new()),
        )
    }

    /// Construct a connection around an existing dispatcher and a custom
    /// transport.
    pub fn with_parts(
        keys: KeyPair,
        info: TheirInfo,
        dispatcher: Arc<Dispatcher>,
        transport: Arc<dyn Transport>,
    ) -> StaticAgentResult<Self> {
        let (held_tx, held_rx) = mpsc::unbounded_channel();
        let connection = Self {
            keys,
            peer: Mutex::new(PeerInfo::default()),
            dispatcher,
            transport,
            hold_condition: Mutex::new(Arc::new(|_: &Message| false)),
            held_tx,
            held_rx: AsyncMutex::new(held_rx),
            reply: Mutex::new(None),
        };
        connection.update(info)?;
        Ok(connection)
    }

    /// Update the peer's addressing information. `their_vk` and
    /// `recipients` are mutually exclusive; `their_vk` is shorthand for a
    /// single-element recipient list. Provided fields replace their slot
    /// atomically, absent fields are preserved.
    pub fn update(&self, info: TheirInfo) -> StaticAgentResult<()> {
        if info.their_vk.is_some() && info.recipients.is_some() {
            return Err(StaticAgentError::Configuration(
                "their_vk and recipients are mutually exclusive".into(),
            ));
        }

        // Normalize key material before taking the lock so a bad key
        // leaves existing state untouched.
        let recipients = match (&info.their_vk, &info.recipients) {
            (Some(their_vk), None) => Some(vec![their_vk.to_bytes()?]),
            (None, Some(recipients)) => Some(
                recipients
                    .iter()
                    .map(KeyInput::to_bytes)
                    .collect::<Result<Vec<_>, _>>()?,
            ),
            _ => None,
        };
        let routing_keys = info
            .routing_keys
            .map(|keys| {
                keys.iter()
                    .map(KeyInput::to_bytes)
                    .collect::<Result<Vec<_>, _>>()
            })
            .transpose()?;

        let mut peer = self.peer.lock().expect("unpoisoned mutex");
        if let Some(endpoint) = info.endpoint {
            peer.endpoint = Some(endpoint);
        }
        if let Some(recipients) = recipients {
            peer.recipients = Some(recipients);
        }
        if let Some(routing_keys) = routing_keys {
            peer.routing_keys = Some(routing_keys);
        }
        Ok(())
    }

    pub fn verkey(&self) -> &[u8] {
        self.keys.verkey()
    }

    pub fn verkey_b58(&self) -> String {
        self.keys.verkey_b58()
    }

    pub fn sigkey(&self) -> &[u8] {
        self.keys.sigkey()
    }

    /// Verkey-derived DID for this connection.
    pub fn did(&self) -> String {
        self.keys.did()
    }

    pub fn endpoint(&self) -> Option<Url> {
        self.peer.lock().expect("unpoisoned mutex").endpoint.clone()
    }

    pub fn recipients(&self) -> Option<Vec<Vec<u8>>> {
        self.peer
            .lock()
            .expect("unpoisoned mutex")
            .recipients
            .clone()
    }

    pub fn routing_keys(&self) -> Option<Vec<Vec<u8>>> {
        self.peer
            .lock()
            .expect("unpoisoned mutex")
            .routing_keys
            .clone()
    }

    /// Register a handler for a message type.
    pub fn route(&self, type_uri: impl Into<String>, handler: Arc<dyn Handler>) {
        self.dispatcher.add_handler(type_uri, handler);
    }

    /// Register all of a module's routes.
    pub fn route_module(&self, module: &dyn Module) {
        self.dispatcher.add_handlers(module.routes());
    }

    /// Drop every registered route.
    pub fn clear_routes(&self) {
        self.dispatcher.clear_handlers();
    }

    /// Pack a message for the wire. The default is authcrypt; `anoncrypt`
    /// drops sender authentication and `plaintext` skips the envelope
    /// entirely. When routing keys are configured the envelope is
    /// re-wrapped in a forward message for each mediator, innermost first.
    pub fn pack(
        &self,
        msg: &Message,
        plaintext: bool,
        anoncrypt: bool,
    ) -> StaticAgentResult<Vec<u8>> {
        if plaintext && anoncrypt {
            return Err(StaticAgentError::Configuration(
                "plaintext and anoncrypt are mutually exclusive".into(),
            ));
        }

        let peer = self.peer.lock().expect("unpoisoned mutex").clone();

        let mut envelope = if plaintext {
            serde_json::to_value(msg)?
        } else {
            let recipients = peer
                .recipients
                .as_deref()
                .filter(|recipients| !recipients.is_empty())
                .ok_or_else(|| {
                    StaticAgentError::Configuration(
                        "cannot encrypt message; no recipient keys configured".into(),
                    )
                })?;
            let sender = if anoncrypt {
                None
            } else {
                Some((self.keys.verkey(), self.keys.sigkey()))
            };
            crypto::pack_message(&msg.serialize()?, recipients, sender)?
        };

        if let Some(routing_keys) = peer
            .routing_keys
            .as_deref()
            .filter(|routing_keys| !routing_keys.is_empty())
        {
            let recipients = peer
                .recipients
                .as_deref()
                .filter(|recipients| !recipients.is_empty())
                .ok_or_else(|| {
                    StaticAgentError::Configuration(
                        "routing keys configured without recipient keys".into(),
                    )
                })?;
            let mut to = recipients[0].clone();
            for routing_key in routing_keys {
                trace!("Wrapping message in forward to {}", crypto::bytes_to_b58(routing_key));
                let forward = forward_msg(&to, envelope)?;
                envelope =
                    crypto::pack_message(&forward.serialize()?, std::slice::from_ref(routing_key), None)?;
                to = routing_key.clone();
            }
        }

        Ok(serde_json::to_vec(&envelope)?)
    }

    /// Unpack a message, attaching its trust context. Input that is not a
    /// well-formed encrypted envelope addressed to us is treated as a
    /// plaintext message; decryption failures propagate.
    pub fn unpack(&self, packed: &[u8]) -> StaticAgentResult<Message> {
        match crypto::unpack_message(packed, self.keys.verkey(), self.keys.sigkey()) {
            Ok((payload, sender_vk, recipient_vk)) => {
                let mut msg = Message::deserialize(&payload)?;
                msg.set_mtc(match sender_vk {
                    Some(sender_vk) => MessageTrustContext::authcrypted(sender_vk, recipient_vk),
                    None => MessageTrustContext::anoncrypted(recipient_vk),
                });
                Ok(msg)
            }
            Err(CryptoError::MalformedEnvelope(reason)) => {
                trace!("Input is not an encrypted envelope ({reason}); parsing as plaintext");
                let mut msg = Message::deserialize(packed)?;
                msg.set_mtc(MessageTrustContext::plaintext());
                Ok(msg)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// As [`unpack`](Self::unpack), over an already-parsed envelope.
    pub fn unpack_value(&self, envelope: &Value) -> StaticAgentResult<Message> {
        match crypto::unpack_message_value(envelope, self.keys.verkey(), self.keys.sigkey()) {
            Ok((payload, sender_vk, recipient_vk)) => {
                let mut msg = Message::deserialize(&payload)?;
                msg.set_mtc(match sender_vk {
                    Some(sender_vk) => MessageTrustContext::authcrypted(sender_vk, recipient_vk),
                    None => MessageTrustContext::anoncrypted(recipient_vk),
                });
                Ok(msg)
            }
            Err(CryptoError::MalformedEnvelope(reason)) => {
                trace!("Input is not an encrypted envelope ({reason}); parsing as plaintext");
                let mut msg = Message::from_value(envelope.clone())?;
                msg.set_mtc(MessageTrustContext::plaintext());
                Ok(msg)
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Hold inbound messages matching `condition` (all of them when no
    /// condition is given) for [`await_message`](Self::await_message)
    /// instead of dispatching. The hold is released when the returned
    /// guard drops.
    #[must_use = "messages are held only while the guard is alive"]
    pub fn hold_messages(&self, condition: Option<HoldPredicate>) -> HoldGuard<'_> {
        let condition = condition.unwrap_or_else(|| Arc::new(|_: &Message| true));
        *self.hold_condition.lock().expect("unpoisoned mutex") = condition;
        HoldGuard { connection: self }
    }

    /// Install a reply channel for the duration of the returned guard.
    /// While installed, outbound messages go through it instead of the
    /// transport.
    #[must_use = "the reply channel is installed only while the guard is alive"]
    pub fn reply_handler(&self, send: ReplySender) -> ReplyGuard<'_> {
        *self.reply.lock().expect("unpoisoned mutex") = Some(send);
        ReplyGuard { connection: self }
    }

    /// Take the next held message. `None` (or a zero duration) waits
    /// indefinitely; a positive timeout fails with
    /// [`StaticAgentError::Timeout`] when no message arrives in the
    /// window. Concurrent callers are served in arrival order.
    pub async fn await_message(&self, timeout: Option<Duration>) -> StaticAgentResult<Message> {
        let mut held = self.held_rx.lock().await;
        match timeout {
            Some(window) if !window.is_zero() => {
                match tokio::time::timeout(window, held.recv()).await {
                    Ok(Some(msg)) => Ok(msg),
                    Ok(None) => Err(StaticAgentError::HeldQueueClosed),
                    Err(_) => Err(StaticAgentError::Timeout(window)),
                }
            }
            _ => held.recv().await.ok_or(StaticAgentError::HeldQueueClosed),
        }
    }

    /// Unpack an inbound frame and dispatch it, holding it instead when
    /// the hold predicate matches. A frame that does not opt into a
    /// return route clears any installed reply channel: a stale channel
    /// belongs to a different exchange.
    pub async fn handle(&self, packed: &[u8]) -> StaticAgentResult<()> {
        let msg = self.unpack(packed)?;
        trace!("Received message {} of type {}", msg.id(), msg.msg_type());

        if !matches!(
            msg.return_route(),
            Some(ReturnRoute::All) | Some(ReturnRoute::Thread)
        ) {
            *self.reply.lock().expect("unpoisoned mutex") = None;
        }

        let held = {
            let condition = self.hold_condition.lock().expect("unpoisoned mutex").clone();
            condition(&msg)
        };
        if held {
            debug!("Holding message {}", msg.id());
            self.held_tx
                .send(msg)
                .map_err(|_| StaticAgentError::HeldQueueClosed)?;
            return Ok(());
        }

        self.dispatcher.dispatch(msg, self).await
    }

    /// Send a message with default options (authcrypt, no return route).
    pub async fn send_message(&self, msg: Message) -> StaticAgentResult<()> {
        self.send_message_with(msg, SendOptions::default()).await
    }

    /// Send a message to the peer. Delivery goes through the installed
    /// reply channel when there is one, otherwise over the transport to
    /// the configured endpoint; a transport response is fed back through
    /// [`handle`](Self::handle) when a return route was requested.
    pub async fn send_message_with(
        &self,
        mut msg: Message,
        options: SendOptions,
    ) -> StaticAgentResult<()> {
        let reply = self.reply.lock().expect("unpoisoned mutex").clone();
        let endpoint = self.peer.lock().expect("unpoisoned mutex").endpoint.clone();
        let wants_return = matches!(
            options.return_route,
            Some(ReturnRoute::All | ReturnRoute::Thread)
        );

        if !wants_return && reply.is_none() && endpoint.is_none() {
            return Err(StaticAgentError::delivery(
                "no endpoint and no return route",
            ));
        }

        // Only the outbound transport can carry a synchronous response
        // frame; an installed reply channel means the reverse direction
        // already exists, so the decorator stays out of the message.
        if let Some(return_route) = options.return_route {
            if reply.is_none() {
                msg.set_return_route(return_route);
            }
        }

        let packed = self.pack(&msg, options.plaintext, options.anoncrypt)?;

        if let Some(reply) = reply {
            debug!("Sending message {} over the installed reply channel", msg.id());
            return reply(packed).await;
        }

        let endpoint =
            endpoint.ok_or_else(|| StaticAgentError::delivery("no endpoint configured"))?;
        debug!("Sending message {} to endpoint `{}`", msg.id(), endpoint);
        match self.transport.send_message(packed, endpoint).await {
            Ok(Some(response)) => {
                if wants_return {
                    debug!("Transport returned a response frame; handling inbound");
                    self.handle(&response).await
                } else {
                    Err(StaticAgentError::UnexpectedResponse)
                }
            }
            Ok(None) => Ok(()),
            Err(err) => Err(StaticAgentError::Delivery {
                status: err.status(),
                message: err.to_string(),
            }),
        }
    }

    /// Send a message and wait for the reply, with a return route of
    /// `all` and every inbound message held for the caller.
    pub async fn send_and_await_reply(
        &self,
        msg: Message,
        timeout: Option<Duration>,
    ) -> StaticAgentResult<Message> {
        self.send_and_await_reply_with(
            msg,
            None,
            SendOptions {
                return_route: Some(ReturnRoute::All),
                ..SendOptions::default()
            },
            timeout,
        )
        .await
    }

    /// Send a message and wait for a matching reply. Messages matching
    /// `condition` (all of them when absent) bypass the dispatcher and
    /// are delivered to this caller; the hold is released on every exit
    /// path.
    pub async fn send_and_await_reply_with(
        &self,
        msg: Message,
        condition: Option<HoldPredicate>,
        options: SendOptions,
        timeout: Option<Duration>,
    ) -> StaticAgentResult<Message> {
        let _hold = self.hold_messages(condition);
        self.send_message_with(msg, options).await?;
        self.await_message(timeout).await
    }

    /// Blocking form of [`send_message`](Self::send_message) for callers
    /// without an async runtime.
    pub fn send_message_blocking(&self, msg: Message) -> StaticAgentResult<()> {
        blocking_runtime()?.block_on(self.send_message(msg))
    }

    /// Blocking form of
    /// [`send_and_await_reply`](Self::send_and_await_reply).
    pub fn send_and_await_reply_blocking(
        &self,
        msg: Message,
        timeout: Option<Duration>,
    ) -> StaticAgentResult<Message> {
        blocking_runtime()?.block_on(self.send_and_await_reply(msg, timeout))
    }
}

fn blocking_runtime() -> StaticAgentResult<tokio::runtime::Runtime> {
    tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .map_err(StaticAgentError::Runtime)
}

/// Releases a hold scope on drop. The predicate is reset to "never hold"
/// unconditionally; nested holds do not restore the outer predicate.
#[must_use = "messages are held only while the guard is alive"]
pub struct HoldGuard<'a> {
    connection: &'a StaticConnection,
}

impl Drop for HoldGuard<'_> {
    fn drop(&mut self) {
        let mut condition = self
            .connection
            .hold_condition
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *condition = Arc::new(|_: &Message| false);
    }
}

/// Clears the reply channel slot on drop.
#[must_use = "the reply channel is installed only while the guard is alive"]
pub struct ReplyGuard<'a> {
    connection: &'a StaticConnection,
}

impl Drop for ReplyGuard<'_> {
    fn drop(&mut self) {
        let mut reply = self
            .connection
            .reply
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        *reply = None;
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use pretty_assertions::assert_eq;
    use serde_json::json;

    use super::*;
    use crate::{
        dispatcher::FnHandler,
        message::FORWARD,
        mtc::Disposition,
        test_init,
        transport::TransportError,
    };

    const TEST_TYPE: &str = "doc_uri/protocol/0.1/test";

    struct MockTransport {
        sent: Mutex<Vec<Vec<u8>>>,
        response: Mutex<Option<Vec<u8>>>,
    }

    impl MockTransport {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                sent: Mutex::new(vec![]),
                response: Mutex::new(None),
            })
        }

        fn with_response(response: Vec<u8>) -> Arc<Self> {
            let transport = Self::new();
            *transport.response.lock().expect("unpoisoned mutex") = Some(response);
            transport
        }

        fn sent(&self) -> Vec<Vec<u8>> {
            self.sent.lock().expect("unpoisoned mutex").clone()
        }
    }

    #[async_trait::async_trait]
    impl Transport for MockTransport {
        async fn send_message(
            &self,
            message: Vec<u8>,
            _endpoint: Url,
        ) -> Result<Option<Vec<u8>>, TransportError> {
            self.sent.lock().expect("unpoisoned mutex").push(message);
            Ok(self.response.lock().expect("unpoisoned mutex").take())
        }
    }

    fn counting_handler() -> (Arc<AtomicUsize>, Arc<dyn Handler>) {
        let count = Arc::new(AtomicUsize::new(0));
        let counter = count.clone();
        let handler = FnHandler::new(move |_msg, _conn: &StaticConnection| {
            let counter = counter.clone();
            Box::pin(async move {
                counter.fetch_add(1, Ordering::SeqCst);
                Ok(())
            })
        });
        (count, handler)
    }

    fn test_message() -> Message {
        Message::from_value(json!({
            "@type": TEST_TYPE,
            "@id": "id1",
            "content": "test",
        }))
        .expect("valid message")
    }

    /// Two connections pointed at each other, with a mock transport on
    /// the first.
    fn connected_pair() -> (StaticConnection, StaticConnection, Arc<MockTransport>) {
        let alice_keys = KeyPair::generate();
        let bob_keys = KeyPair::generate();
        let transport = MockTransport::new();
        let alice = StaticConnection::with_parts(
            alice_keys.clone(),
            TheirInfo {
                endpoint: Some(Url::parse("http://example.com/").expect("valid url")),
                their_vk: Some(KeyInput::from(bob_keys.verkey())),
                ..TheirInfo::default()
            },
            Arc::new(Dispatcher::new()),
            transport.clone(),
        )
        .expect("connection to construct");
        let bob = StaticConnection::new(
            bob_keys,
            TheirInfo {
                their_vk: Some(KeyInput::from(alice_keys.verkey())),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");
        (alice, bob, transport)
    }

    #[test]
    fn test_construction_exposes_identity() {
        test_init();
        let keys = KeyPair::new(vec![1u8; 32], vec![2u8; 64]).expect("valid key sizes");
        let connection = StaticConnection::new(
            keys,
            TheirInfo {
                endpoint: Some(Url::parse("http://example/").expect("valid url")),
                their_vk: Some(KeyInput::from(vec![3u8; 32])),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");

        assert_eq!(connection.verkey(), &[1u8; 32][..]);
        assert_eq!(connection.verkey_b58(), crypto::bytes_to_b58(&[1u8; 32]));
        assert_eq!(connection.did(), crypto::bytes_to_b58(&[1u8; 16]));
        assert_eq!(connection.recipients(), Some(vec![vec![3u8; 32]]));
        assert_eq!(
            connection.endpoint().map(String::from),
            Some("http://example/".to_string()),
        );
    }

    #[test]
    fn test_their_vk_and_recipients_mutually_exclusive() {
        test_init();
        let result = StaticConnection::new(
            KeyPair::generate(),
            TheirInfo {
                their_vk: Some(KeyInput::from(vec![3u8; 32])),
                recipients: Some(vec![KeyInput::from(vec![4u8; 32])]),
                ..TheirInfo::default()
            },
        );
        assert!(matches!(
            result,
            Err(StaticAgentError::Configuration(_)),
        ));

        let connection =
            StaticConnection::new(KeyPair::generate(), TheirInfo::default())
                .expect("connection to construct");
        assert!(matches!(
            connection.update(TheirInfo {
                their_vk: Some(KeyInput::from(vec![3u8; 32])),
                recipients: Some(vec![KeyInput::from(vec![4u8; 32])]),
                ..TheirInfo::default()
            }),
            Err(StaticAgentError::Configuration(_)),
        ));
    }

    #[test]
    fn test_update_is_partial() {
        test_init();
        let connection = StaticConnection::new(
            KeyPair::generate(),
            TheirInfo {
                endpoint: Some(Url::parse("http://one.example/").expect("valid url")),
                their_vk: Some(KeyInput::from(vec![3u8; 32])),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");

        connection
            .update(TheirInfo {
                endpoint: Some(Url::parse("http://two.example/").expect("valid url")),
                ..TheirInfo::default()
            })
            .expect("update to succeed");
        assert_eq!(connection.recipients(), Some(vec![vec![3u8; 32]]));
        assert_eq!(
            connection.endpoint().map(String::from),
            Some("http://two.example/".to_string()),
        );

        connection
            .update(TheirInfo {
                recipients: Some(vec![
                    KeyInput::from(vec![5u8; 32]),
                    KeyInput::from(vec![6u8; 32]),
                ]),
                ..TheirInfo::default()
            })
            .expect("update to succeed");
        assert_eq!(
            connection.recipients(),
            Some(vec![vec![5u8; 32], vec![6u8; 32]]),
        );
    }

    #[test]
    fn test_pack_unpack_round_trip_authcrypt() {
        test_init();
        let (alice, bob, _) = connected_pair();
        let packed = alice.pack(&test_message(), false, false).expect("pack");

        let msg = bob.unpack(&packed).expect("unpack");
        assert_eq!(msg.id(), "id1");
        assert_eq!(msg.get("content"), Some(&json!("test")));
        assert!(msg.mtc().is_authcrypted());
        assert_eq!(msg.mtc().sender_vk(), Some(alice.verkey()));
        assert_eq!(msg.mtc().recipient_vk(), Some(bob.verkey()));
    }

    #[test]
    fn test_pack_unpack_round_trip_anoncrypt() {
        test_init();
        let (alice, bob, _) = connected_pair();
        let packed = alice.pack(&test_message(), false, true).expect("pack");

        let msg = bob.unpack(&packed).expect("unpack");
        assert_eq!(msg.id(), "id1");
        assert!(msg.mtc().is_anoncrypted());
        assert_eq!(msg.mtc().sender_vk(), None);
    }

    #[test]
    fn test_pack_unpack_round_trip_plaintext() {
        test_init();
        let (alice, bob, _) = connected_pair();
        let packed = alice.pack(&test_message(), true, false).expect("pack");

        let msg = bob.unpack(&packed).expect("unpack");
        assert_eq!(msg.id(), "id1");
        assert!(msg.mtc().is_plaintext());
    }

    #[test]
    fn test_pack_plaintext_and_anoncrypt_rejected() {
        test_init();
        let (alice, _, _) = connected_pair();
        assert!(matches!(
            alice.pack(&test_message(), true, true),
            Err(StaticAgentError::Configuration(_)),
        ));
    }

    #[test]
    fn test_pack_without_recipients_rejected() {
        test_init();
        let connection =
            StaticConnection::new(KeyPair::generate(), TheirInfo::default())
                .expect("connection to construct");
        assert!(matches!(
            connection.pack(&test_message(), false, false),
            Err(StaticAgentError::Configuration(_)),
        ));
    }

    #[test]
    fn test_pack_with_routing_keys_nests_forwards() {
        test_init();
        let alice_keys = KeyPair::generate();
        let peer = KeyPair::generate();
        let mediator_one = KeyPair::generate();
        let mediator_two = KeyPair::generate();

        let connection = StaticConnection::new(
            alice_keys.clone(),
            TheirInfo {
                recipients: Some(vec![KeyInput::from(peer.verkey())]),
                routing_keys: Some(vec![
                    KeyInput::from(mediator_one.verkey()),
                    KeyInput::from(mediator_two.verkey()),
                ]),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");

        let packed = connection.pack(&test_message(), false, false).expect("pack");

        // Outermost envelope is anoncrypted to the last routing key and
        // holds a forward to the first.
        let (outer, outer_sender, _) =
            crypto::unpack_message(&packed, mediator_two.verkey(), mediator_two.sigkey())
                .expect("outer envelope opens");
        assert_eq!(outer_sender, None);
        let outer = Message::deserialize(&outer).expect("forward message parses");
        assert_eq!(outer.msg_type().as_str(), FORWARD);
        assert_eq!(
            outer.get("to").and_then(Value::as_str),
            Some(crypto::bytes_to_b58(mediator_one.verkey()).as_str()),
        );

        // Next layer forwards to the peer.
        let (middle, _, _) = crypto::unpack_message_value(
            outer.get("msg").expect("forward carries an envelope"),
            mediator_one.verkey(),
            mediator_one.sigkey(),
        )
        .expect("middle envelope opens");
        let middle = Message::deserialize(&middle).expect("forward message parses");
        assert_eq!(middle.msg_type().as_str(), FORWARD);
        assert_eq!(
            middle.get("to").and_then(Value::as_str),
            Some(crypto::bytes_to_b58(peer.verkey()).as_str()),
        );

        // Innermost envelope is the authcrypted message itself.
        let (inner, inner_sender, _) = crypto::unpack_message_value(
            middle.get("msg").expect("forward carries an envelope"),
            peer.verkey(),
            peer.sigkey(),
        )
        .expect("inner envelope opens");
        assert_eq!(inner_sender.as_deref(), Some(alice_keys.verkey()));
        let inner = Message::deserialize(&inner).expect("message parses");
        assert_eq!(inner, test_message());
    }

    #[tokio::test]
    async fn test_send_without_endpoint_or_reply_fails() {
        test_init();
        let transport = MockTransport::new();
        let connection = StaticConnection::with_parts(
            KeyPair::generate(),
            TheirInfo {
                their_vk: Some(KeyInput::from(KeyPair::generate().verkey())),
                ..TheirInfo::default()
            },
            Arc::new(Dispatcher::new()),
            transport.clone(),
        )
        .expect("connection to construct");

        assert!(matches!(
            connection.send_message(test_message()).await,
            Err(StaticAgentError::Delivery { .. }),
        ));
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_prefers_reply_channel() {
        test_init();
        let transport = MockTransport::new();
        let bob_keys = KeyPair::generate();
        let connection = StaticConnection::with_parts(
            KeyPair::generate(),
            TheirInfo {
                their_vk: Some(KeyInput::from(bob_keys.verkey())),
                ..TheirInfo::default()
            },
            Arc::new(Dispatcher::new()),
            transport.clone(),
        )
        .expect("connection to construct");

        let received = Arc::new(Mutex::new(Vec::new()));
        let recorder = received.clone();
        let sender: ReplySender = Arc::new(move |bytes: Vec<u8>| {
            let recorder = recorder.clone();
            Box::pin(async move {
                recorder.lock().expect("unpoisoned mutex").push(bytes);
                Ok(())
            })
        });

        {
            let _guard = connection.reply_handler(sender);
            connection
                .send_message(test_message())
                .await
                .expect("send over the reply channel");
        }

        let received = received.lock().expect("unpoisoned mutex");
        assert_eq!(received.len(), 1);
        assert!(transport.sent().is_empty());

        // The recorded bytes are a real envelope for the peer.
        let bob = StaticConnection::new(bob_keys, TheirInfo::default())
            .expect("connection to construct");
        let msg = bob.unpack(&received[0]).expect("unpack");
        assert_eq!(msg.id(), "id1");
        // With a reply channel installed the return-route decorator is
        // not injected.
        assert_eq!(msg.return_route(), None);
    }

    #[tokio::test]
    async fn test_send_injects_return_route() {
        test_init();
        let (alice, bob, transport) = connected_pair();
        alice
            .send_message_with(
                test_message(),
                SendOptions {
                    return_route: Some(ReturnRoute::All),
                    ..SendOptions::default()
                },
            )
            .await
            .expect("send to succeed");

        let sent = transport.sent();
        assert_eq!(sent.len(), 1);
        let msg = bob.unpack(&sent[0]).expect("unpack");
        assert_eq!(msg.return_route(), Some(ReturnRoute::All));
    }

    #[tokio::test]
    async fn test_unsolicited_response_is_an_error() {
        test_init();
        let alice_keys = KeyPair::generate();
        let bob_keys = KeyPair::generate();
        let bob = StaticConnection::new(
            bob_keys.clone(),
            TheirInfo {
                their_vk: Some(KeyInput::from(alice_keys.verkey())),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");
        let response = bob.pack(&test_message(), false, false).expect("pack");

        let transport = MockTransport::with_response(response);
        let alice = StaticConnection::with_parts(
            alice_keys,
            TheirInfo {
                endpoint: Some(Url::parse("http://example.com/").expect("valid url")),
                their_vk: Some(KeyInput::from(bob_keys.verkey())),
                ..TheirInfo::default()
            },
            Arc::new(Dispatcher::new()),
            transport,
        )
        .expect("connection to construct");

        assert!(matches!(
            alice.send_message(test_message()).await,
            Err(StaticAgentError::UnexpectedResponse),
        ));
    }

    #[tokio::test]
    async fn test_hold_diverts_messages_in_order() {
        test_init();
        let (count, handler) = counting_handler();
        let alice_keys = KeyPair::generate();
        let bob_keys = KeyPair::generate();
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.add_handler(TEST_TYPE, handler);
        let alice = StaticConnection::with_parts(
            alice_keys.clone(),
            TheirInfo {
                their_vk: Some(KeyInput::from(bob_keys.verkey())),
                ..TheirInfo::default()
            },
            dispatcher,
            MockTransport::new(),
        )
        .expect("connection to construct");
        let bob = StaticConnection::new(
            bob_keys,
            TheirInfo {
                their_vk: Some(KeyInput::from(alice_keys.verkey())),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");

        let first = Message::from_value(json!({"@type": TEST_TYPE, "@id": "first"}))
            .expect("valid message");
        let second = Message::from_value(json!({"@type": TEST_TYPE, "@id": "second"}))
            .expect("valid message");

        {
            let _hold = alice.hold_messages(None);
            alice
                .handle(&bob.pack(&first, false, false).expect("pack"))
                .await
                .expect("handle");
            alice
                .handle(&bob.pack(&second, false, false).expect("pack"))
                .await
                .expect("handle");

            let held = alice.await_message(None).await.expect("held message");
            assert_eq!(held.id(), "first");
            let held = alice.await_message(None).await.expect("held message");
            assert_eq!(held.id(), "second");
        }
        assert_eq!(count.load(Ordering::SeqCst), 0);

        // Hold released: the next message dispatches normally.
        alice
            .handle(&bob.pack(&test_message(), false, false).expect("pack"))
            .await
            .expect("handle");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_hold_predicate_filters() {
        test_init();
        let (count, handler) = counting_handler();
        let alice_keys = KeyPair::generate();
        let bob_keys = KeyPair::generate();
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.add_handler(TEST_TYPE, handler);
        let alice = StaticConnection::with_parts(
            alice_keys.clone(),
            TheirInfo {
                their_vk: Some(KeyInput::from(bob_keys.verkey())),
                ..TheirInfo::default()
            },
            dispatcher,
            MockTransport::new(),
        )
        .expect("connection to construct");
        let bob = StaticConnection::new(
            bob_keys,
            TheirInfo {
                their_vk: Some(KeyInput::from(alice_keys.verkey())),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");

        let held_msg = Message::from_value(json!({"@type": TEST_TYPE, "@id": "hold-me"}))
            .expect("valid message");
        let passed_msg = Message::from_value(json!({"@type": TEST_TYPE, "@id": "pass-me"}))
            .expect("valid message");

        let _hold =
            alice.hold_messages(Some(Arc::new(|msg: &Message| msg.id() == "hold-me")));
        alice
            .handle(&bob.pack(&held_msg, false, false).expect("pack"))
            .await
            .expect("handle");
        alice
            .handle(&bob.pack(&passed_msg, false, false).expect("pack"))
            .await
            .expect("handle");

        assert_eq!(count.load(Ordering::SeqCst), 1);
        let held = alice.await_message(None).await.expect("held message");
        assert_eq!(held.id(), "hold-me");
    }

    #[tokio::test]
    async fn test_await_message_times_out() {
        test_init();
        let connection =
            StaticConnection::new(KeyPair::generate(), TheirInfo::default())
                .expect("connection to construct");
        assert!(matches!(
            connection
                .await_message(Some(Duration::from_millis(10)))
                .await,
            Err(StaticAgentError::Timeout(_)),
        ));
    }

    #[tokio::test]
    async fn test_inbound_without_return_route_clears_reply_channel() {
        test_init();
        let (alice, bob, transport) = connected_pair();

        let sender: ReplySender =
            Arc::new(|_bytes: Vec<u8>| Box::pin(async { Ok(()) }));
        let _guard = alice.reply_handler(sender);

        // Inbound frame without a return-route request: the channel must
        // not be reused for this exchange.
        let _hold = alice.hold_messages(None);
        alice
            .handle(&bob.pack(&test_message(), false, false).expect("pack"))
            .await
            .expect("handle");

        // With the channel cleared the send goes to the transport.
        alice
            .send_message(test_message())
            .await
            .expect("send over the transport");
        assert_eq!(transport.sent().len(), 1);
    }

    #[tokio::test]
    async fn test_inbound_with_return_route_keeps_reply_channel() {
        test_init();
        let (alice, bob, transport) = connected_pair();

        let received = Arc::new(Mutex::new(Vec::new()));
        let recorder = received.clone();
        let sender: ReplySender = Arc::new(move |bytes: Vec<u8>| {
            let recorder = recorder.clone();
            Box::pin(async move {
                recorder.lock().expect("unpoisoned mutex").push(bytes);
                Ok(())
            })
        });
        let _guard = alice.reply_handler(sender);

        let mut msg = test_message();
        msg.set_return_route(ReturnRoute::All);
        let _hold = alice.hold_messages(None);
        alice
            .handle(&bob.pack(&msg, false, false).expect("pack"))
            .await
            .expect("handle");

        alice
            .send_message(test_message())
            .await
            .expect("send over the reply channel");
        assert_eq!(received.lock().expect("unpoisoned mutex").len(), 1);
        assert!(transport.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_and_await_reply_returns_response() {
        test_init();
        let alice_keys = KeyPair::generate();
        let bob_keys = KeyPair::generate();
        let bob = StaticConnection::new(
            bob_keys.clone(),
            TheirInfo {
                their_vk: Some(KeyInput::from(alice_keys.verkey())),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");

        let reply = Message::from_value(json!({"@type": TEST_TYPE, "@id": "the-reply"}))
            .expect("valid message");
        let transport =
            MockTransport::with_response(bob.pack(&reply, false, false).expect("pack"));

        let alice = StaticConnection::with_parts(
            alice_keys,
            TheirInfo {
                endpoint: Some(Url::parse("http://example.com/").expect("valid url")),
                their_vk: Some(KeyInput::from(bob_keys.verkey())),
                ..TheirInfo::default()
            },
            Arc::new(Dispatcher::new()),
            transport,
        )
        .expect("connection to construct");

        let received = alice
            .send_and_await_reply(test_message(), Some(Duration::from_secs(1)))
            .await
            .expect("reply to arrive");
        assert_eq!(received, reply);
        assert!(received.mtc().is_authcrypted());
    }

    #[tokio::test]
    async fn test_send_and_await_reply_timeout_releases_hold() {
        test_init();
        let (count, handler) = counting_handler();
        let alice_keys = KeyPair::generate();
        let bob_keys = KeyPair::generate();
        let dispatcher = Arc::new(Dispatcher::new());
        dispatcher.add_handler(TEST_TYPE, handler);
        let alice = StaticConnection::with_parts(
            alice_keys.clone(),
            TheirInfo {
                endpoint: Some(Url::parse("http://example.com/").expect("valid url")),
                their_vk: Some(KeyInput::from(bob_keys.verkey())),
                ..TheirInfo::default()
            },
            dispatcher,
            MockTransport::new(),
        )
        .expect("connection to construct");
        let bob = StaticConnection::new(
            bob_keys,
            TheirInfo {
                their_vk: Some(KeyInput::from(alice_keys.verkey())),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");

        assert!(matches!(
            alice
                .send_and_await_reply(test_message(), Some(Duration::from_millis(10)))
                .await,
            Err(StaticAgentError::Timeout(_)),
        ));

        // The hold was released on the failure path: inbound messages
        // dispatch normally again.
        alice
            .handle(&bob.pack(&test_message(), false, false).expect("pack"))
            .await
            .expect("handle");
        assert_eq!(count.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_blocking_send_over_reply_channel() {
        test_init();
        let connection = StaticConnection::new(
            KeyPair::generate(),
            TheirInfo {
                their_vk: Some(KeyInput::from(KeyPair::generate().verkey())),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");

        let received = Arc::new(Mutex::new(Vec::new()));
        let recorder = received.clone();
        let sender: ReplySender = Arc::new(move |bytes: Vec<u8>| {
            let recorder = recorder.clone();
            Box::pin(async move {
                recorder.lock().expect("unpoisoned mutex").push(bytes);
                Ok(())
            })
        });

        let _guard = connection.reply_handler(sender);
        connection
            .send_message_blocking(test_message())
            .expect("blocking send to succeed");
        assert_eq!(received.lock().expect("unpoisoned mutex").len(), 1);
    }

    #[tokio::test]
    async fn test_route_registration_passthrough() {
        test_init();
        let (count, handler) = counting_handler();
        let alice_keys = KeyPair::generate();
        let bob_keys = KeyPair::generate();
        let alice = StaticConnection::new(
            alice_keys.clone(),
            TheirInfo {
                their_vk: Some(KeyInput::from(bob_keys.verkey())),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");
        let bob = StaticConnection::new(
            bob_keys,
            TheirInfo {
                their_vk: Some(KeyInput::from(alice_keys.verkey())),
                ..TheirInfo::default()
            },
        )
        .expect("connection to construct");

        alice.route(TEST_TYPE, handler);
        alice
            .handle(&bob.pack(&test_message(), false, false).expect("pack"))
            .await
            .expect("handle");
        assert_eq!(count.load(Ordering::SeqCst), 1);

        alice.clear_routes();
        assert!(matches!(
            alice
                .handle(&bob.pack(&test_message(), false, false).expect("pack"))
                .await,
            Err(StaticAgentError::NoRegisteredRoute(_)),
        ));
    }

    #[test]
    fn test_unpack_value_round_trip() {
        test_init();
        let (alice, bob, _) = connected_pair();
        let packed = alice.pack(&test_message(), false, false).expect("pack");
        let envelope: Value = serde_json::from_slice(&packed).expect("envelope is JSON");

        let msg = bob.unpack_value(&envelope).expect("unpack");
        assert_eq!(msg.id(), "id1");
        assert!(msg.mtc().is_authcrypted());
    }

    #[test]
    fn test_unpack_plaintext_disposition() {
        test_init();
        let connection =
            StaticConnection::new(KeyPair::generate(), TheirInfo::default())
                .expect("connection to construct");
        let msg = connection
            .unpack(br#"{"@type": "doc_uri/protocol/0.1/test", "@id": "plain"}"#)
            .expect("plaintext parse");
        assert_eq!(msg.id(), "plain");
        assert_eq!(msg.mtc().disposition(), &Disposition::Plaintext);
    }
}
