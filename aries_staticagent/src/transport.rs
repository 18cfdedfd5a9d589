//! Outbound message transports. The default is HTTP POST; a WebSocket
//! transport is a known future extension.

use async_trait::async_trait;
use reqwest::header::{CONTENT_TYPE, USER_AGENT};
use thiserror::Error;
use url::Url;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("error sending message: {0}")]
    Request(#[from] reqwest::Error),

    #[error("transport returned failure status {status}: {body}")]
    Status { status: u16, body: String },
}

impl TransportError {
    pub fn status(&self) -> Option<u16> {
        match self {
            TransportError::Request(err) => err.status().map(|status| status.as_u16()),
            TransportError::Status { status, .. } => Some(*status),
        }
    }
}

/// Sends one packed message to an endpoint. A returned body is the peer
/// taking advantage of a requested return route; `None` means the send
/// completed without an in-band response. Implementations make a single
/// attempt and own their own timeouts.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send_message(
        &self,
        message: Vec<u8>,
        endpoint: Url,
    ) -> Result<Option<Vec<u8>>, TransportError>;
}

#[derive(Debug, Default)]
pub struct HttpTransport;

impl HttpTransport {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl Transport for HttpTransport {
    async fn send_message(
        &self,
        message: Vec<u8>,
        endpoint: Url,
    ) -> Result<Option<Vec<u8>>, TransportError> {
        debug!("Sending message via HTTP to endpoint `{}`", endpoint);

        let client = reqwest::Client::new();
        let response = client
            .post(endpoint)
            .body(message)
            .header(CONTENT_TYPE, "application/ssi-agent-wire")
            .header(USER_AGENT, "reqwest")
            .send()
            .await?;

        let status = response.status();
        debug!("Received response with status `{}`", status);

        let body = response.bytes().await?;
        if !status.is_success() {
            return Err(TransportError::Status {
                status: status.as_u16(),
                body: String::from_utf8_lossy(&body).into_owned(),
            });
        }

        // A non-empty success body is a returned message for inbound
        // processing (possible when the outbound message requested a
        // return route).
        if body.is_empty() {
            Ok(None)
        } else {
            Ok(Some(body.to_vec()))
        }
    }
}
