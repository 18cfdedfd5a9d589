#[macro_use]
extern crate log;

pub mod connection;
pub mod crypto;
pub mod decorators;
pub mod dispatcher;
pub mod error;
pub mod message;
pub mod mtc;
pub mod transport;
pub mod utils;

pub use connection::{
    HoldGuard, HoldPredicate, ReplyGuard, ReplySender, SendOptions, StaticConnection, TheirInfo,
};
pub use crypto::{KeyInput, KeyPair};
pub use decorators::ReturnRoute;
pub use dispatcher::{Dispatcher, FnHandler, Handler, Module};
pub use error::{StaticAgentError, StaticAgentResult};
pub use message::{Message, MessageType};
pub use mtc::MessageTrustContext;
pub use url::Url;

#[cfg(test)]
pub(crate) fn test_init() {
    env_logger::builder().is_test(true).try_init().ok();
}
