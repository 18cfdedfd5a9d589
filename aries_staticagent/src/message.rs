//! The agent message container: a JSON object with a protocol-qualified
//! `@type` and an `@id`, plus the trust context attached after unpacking.

use lazy_static::lazy_static;
use regex::Regex;
use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use serde_json::{Map, Value};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    decorators::{ReturnRoute, TransportDecorator},
    mtc::MessageTrustContext,
};

/// DIDComm v1 forward message type, handled by mediators.
pub const FORWARD: &str = "did:sov:BzCbsNYhMrjHiqZDTUASHg;spec/routing/1.0/forward";

lazy_static! {
    static ref MTURI_RE: Regex = Regex::new(r"^(.*?)([a-z0-9._-]+)/(\d[^/]*)/([a-z0-9._-]+)$")
        .expect("static MTURI pattern compiles");
}

#[derive(Debug, Error)]
pub enum MessageError {
    #[error("message `@type` is missing or not a string")]
    MissingType,

    #[error("invalid message type `{0}`")]
    InvalidType(String),

    #[error("message must be a JSON object")]
    NotAnObject,

    #[error("error serializing or deserializing message")]
    Serialization(#[from] serde_json::Error),
}

/// A parsed message type URI: `<doc_uri><protocol>/<version>/<name>`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MessageType {
    full: String,
    doc_uri: String,
    protocol: String,
    version: String,
    name: String,
}

impl MessageType {
    pub fn as_str(&self) -> &str {
        &self.full
    }

    pub fn doc_uri(&self) -> &str {
        &self.doc_uri
    }

    pub fn protocol(&self) -> &str {
        &self.protocol
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn name(&self) -> &str {
        &self.name
    }
}

impl std::str::FromStr for MessageType {
    type Err = MessageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let captures = MTURI_RE
            .captures(s)
            .ok_or_else(|| MessageError::InvalidType(s.to_owned()))?;
        Ok(Self {
            full: s.to_owned(),
            doc_uri: captures[1].to_owned(),
            protocol: captures[2].to_owned(),
            version: captures[3].to_owned(),
            name: captures[4].to_owned(),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.full)
    }
}

/// An agent message. Behaves as a JSON mapping; `@type` must parse as a
/// message type URI and `@id` is generated when absent. The attached
/// [`MessageTrustContext`] never crosses the wire.
#[derive(Debug, Clone)]
pub struct Message {
    inner: Map<String, Value>,
    msg_type: MessageType,
    mtc: MessageTrustContext,
}

impl Message {
    /// Promote a JSON value to a message, rejecting non-objects.
    pub fn from_value(value: Value) -> Result<Self, MessageError> {
        match value {
            Value::Object(map) => Self::from_map(map),
            _ => Err(MessageError::NotAnObject),
        }
    }

    pub fn from_map(mut map: Map<String, Value>) -> Result<Self, MessageError> {
        let msg_type = map
            .get("@type")
            .and_then(Value::as_str)
            .ok_or(MessageError::MissingType)?
            .parse()?;
        if !map.contains_key("@id") {
            map.insert("@id".into(), Value::String(Uuid::new_v4().to_string()));
        }
        Ok(Self {
            inner: map,
            msg_type,
            mtc: MessageTrustContext::default(),
        })
    }

    /// Parse a message from serialized JSON.
    pub fn deserialize(bytes: &[u8]) -> Result<Self, MessageError> {
        Self::from_value(serde_json::from_slice(bytes)?)
    }

    /// Render the message as JSON bytes.
    pub fn serialize(&self) -> Result<Vec<u8>, MessageError> {
        Ok(serde_json::to_vec(&self.inner)?)
    }

    pub fn id(&self) -> &str {
        self.inner
            .get("@id")
            .and_then(Value::as_str)
            .unwrap_or_default()
    }

    pub fn msg_type(&self) -> &MessageType {
        &self.msg_type
    }

    pub fn mtc(&self) -> &MessageTrustContext {
        &self.mtc
    }

    pub(crate) fn set_mtc(&mut self, mtc: MessageTrustContext) {
        self.mtc = mtc;
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.inner.get(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.inner.contains_key(key)
    }

    /// Set a non-reserved field. `@type` stays in lockstep with the parsed
    /// type, so it cannot be replaced through this accessor.
    pub fn insert(&mut self, key: impl Into<String>, value: Value) -> Option<Value> {
        let key = key.into();
        if key == "@type" {
            return None;
        }
        self.inner.insert(key, value)
    }

    pub fn as_map(&self) -> &Map<String, Value> {
        &self.inner
    }

    /// The `~transport.return_route` request carried by this message, if
    /// any.
    pub fn return_route(&self) -> Option<ReturnRoute> {
        self.inner
            .get("~transport")
            .and_then(|value| serde_json::from_value::<TransportDecorator>(value.clone()).ok())
            .and_then(|decorator| decorator.return_route)
    }

    /// Request a return route, creating the `~transport` decorator when
    /// absent and preserving any sibling fields.
    pub fn set_return_route(&mut self, return_route: ReturnRoute) {
        let transport = self
            .inner
            .entry("~transport".to_string())
            .or_insert_with(|| Value::Object(Map::new()));
        if !transport.is_object() {
            *transport = Value::Object(Map::new());
        }
        if let Some(fields) = transport.as_object_mut() {
            fields.insert(
                "return_route".into(),
                Value::String(return_route.as_str().to_owned()),
            );
        }
    }
}

impl Serialize for Message {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        self.inner.serialize(serializer)
    }
}

impl<'de> Deserialize<'de> for Message {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let map = Map::deserialize(deserializer)?;
        Self::from_map(map).map_err(de::Error::custom)
    }
}

impl PartialEq for Message {
    /// Structural equality over the message content; the trust context is
    /// transient metadata and does not participate.
    fn eq(&self, other: &Self) -> bool {
        self.inner == other.inner
    }
}
