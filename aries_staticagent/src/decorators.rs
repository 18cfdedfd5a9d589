//! Message decorators understood by the connection itself.

use serde::{Deserialize, Serialize};
use typed_builder::TypedBuilder;

/// The `~transport` decorator from its
/// [RFC](<https://github.com/hyperledger/aries-rfcs/blob/main/features/0092-transport-return-route/README.md>).
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, TypedBuilder)]
pub struct TransportDecorator {
    #[builder(default, setter(strip_option))]
    #[serde(skip_serializing_if = "Option::is_none")]
    pub return_route: Option<ReturnRoute>,
}

/// How the peer should deliver replies: not at all, over the same
/// transport connection, or over the same connection for one thread only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ReturnRoute {
    None,
    All,
    Thread,
}

impl ReturnRoute {
    pub fn as_str(&self) -> &'static str {
        match self {
            ReturnRoute::None => "none",
            ReturnRoute::All => "all",
            ReturnRoute::Thread => "thread",
        }
    }
}
