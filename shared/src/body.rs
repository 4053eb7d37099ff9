//! Binary-safe body encoding for envelopes.
//!
//! Bodies travel as URL-safe base64 without padding in both directions.
//! Decoding tolerates padded input.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;

use crate::{Error, Result};

const BASE64URL: GeneralPurpose = GeneralPurpose::new(
    &alphabet::URL_SAFE,
    GeneralPurposeConfig::new()
        .with_encode_padding(false)
        .with_decode_padding_mode(DecodePaddingMode::Indifferent),
);

pub fn encode_body(bytes: &[u8]) -> String {
    BASE64URL.encode(bytes)
}

pub fn decode_body(text: &str) -> Result<Vec<u8>> {
    BASE64URL
        .decode(text)
        .map_err(|e| Error::Protocol(format!("invalid body encoding: {}", e)))
}
