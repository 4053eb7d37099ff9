//! Envelope types exchanged over the tunnel channel.
//!
//! Every envelope is one UTF-8 JSON text message. Requests flow relay to
//! bridge, responses flow bridge to relay, correlated by `id`.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

use crate::body::{decode_body, encode_body};
use crate::{Headers, Result};

/// Path on which the relay accepts the channel upgrade
pub const CHANNEL_PATH: &str = "/_ws";

/// Port the relay listens on inside the remote context
pub const RELAY_PORT: u16 = 3000;

/// Status sent when the local response carried no usable status code
pub const NO_STATUS: u16 = 999;

/// How long the relay waits for a response, and the bridge for the local service
pub const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// How long a remote context is kept and considered reusable
pub const SESSION_EXPIRY: Duration = Duration::from_secs(45 * 60);

/// Opaque correlation token, unpredictable and unique per in-flight request
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RequestId(String);

impl RequestId {
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RequestId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl fmt::Display for RequestId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Public request forwarded from the relay to the bridge
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RequestEnvelope {
    pub id: RequestId,
    pub method: String,
    /// Path plus query, exactly as received
    pub url: String,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub body: Option<String>,
}

impl RequestEnvelope {
    /// Build an envelope; the body is omitted when empty
    pub fn new(id: RequestId, method: &str, url: &str, headers: Headers, body: &[u8]) -> Self {
        Self {
            id,
            method: method.to_string(),
            url: url.to_string(),
            headers,
            body: (!body.is_empty()).then(|| encode_body(body)),
        }
    }

    pub fn decode_body(&self) -> Result<Option<Vec<u8>>> {
        self.body.as_deref().map(decode_body).transpose()
    }

    pub fn to_message(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_message(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Local service response returned from the bridge to the relay
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResponseEnvelope {
    pub id: RequestId,
    pub status_code: u16,
    #[serde(default)]
    pub headers: Headers,
    #[serde(default)]
    pub body: String,
}

impl ResponseEnvelope {
    pub fn new(id: RequestId, status_code: u16, headers: Headers, body: &[u8]) -> Self {
        Self {
            id,
            status_code,
            headers,
            body: encode_body(body),
        }
    }

    /// A plain-text error response, used when the local service is unreachable
    pub fn gateway_error(id: RequestId, status_code: u16, message: &str) -> Self {
        let mut headers = Headers::new();
        headers.set("content-type", "text/plain; charset=utf-8");
        Self::new(id, status_code, headers, message.as_bytes())
    }

    /// The status code, if it is a real HTTP status
    pub fn status(&self) -> Option<u16> {
        (100..=599).contains(&self.status_code).then_some(self.status_code)
    }

    pub fn decode_body(&self) -> Result<Vec<u8>> {
        decode_body(&self.body)
    }

    pub fn to_message(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_message(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}
