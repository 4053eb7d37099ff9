//! Burrow Shared Library
//!
//! Wire envelopes, header handling, and body encoding used by both
//! the relay and the bridge client.

pub mod body;
pub mod error;
pub mod headers;
pub mod protocol;

pub use error::{Error, Result};
pub use headers::Headers;
pub use protocol::{RequestEnvelope, RequestId, ResponseEnvelope};
