//! Base64 helpers shared by the wire codec and the key encodings.
//!
//! Encoders always emit padded output; decoders accept both padded and
//! unpadded input, since peers in the wild disagree on padding.

use base64::alphabet;
use base64::engine::{DecodePaddingMode, GeneralPurpose, GeneralPurposeConfig};
use base64::Engine;
use thiserror::Error;

const CONFIG: GeneralPurposeConfig = GeneralPurposeConfig::new()
    .with_encode_padding(true)
    .with_decode_padding_mode(DecodePaddingMode::Indifferent);

const STANDARD: GeneralPurpose = GeneralPurpose::new(&alphabet::STANDARD, CONFIG);
const URL_SAFE: GeneralPurpose = GeneralPurpose::new(&alphabet::URL_SAFE, CONFIG);

/// Decoding failure; the input is never echoed back to avoid leaking
/// queue identifiers or key material into logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
#[error("invalid base64 encoding")]
pub struct EncodingError;

/// Encode with the standard alphabet, padded.
pub fn b64_encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode the standard alphabet, padded or unpadded.
pub fn b64_decode(s: &str) -> Result<Vec<u8>, EncodingError> {
    STANDARD.decode(s).map_err(|_| EncodingError)
}

/// Encode with the URL-safe alphabet, padded.
pub fn b64url_encode(data: &[u8]) -> String {
    URL_SAFE.encode(data)
}

/// Decode the URL-safe alphabet, padded or unpadded.
pub fn b64url_decode(s: &str) -> Result<Vec<u8>, EncodingError> {
    URL_SAFE.decode(s).map_err(|_| EncodingError)
}
