//! Base64 framing for every binary value on the wire.

use base64::engine::general_purpose::STANDARD;
use base64::Engine as _;

use super::{CryptoError, Result};

pub fn encode(data: &[u8]) -> String {
    STANDARD.encode(data)
}

pub fn decode(encoded: &str) -> Result<Vec<u8>> {
    STANDARD
        .decode(encoded)
        .map_err(|e| CryptoError::BadInput(format!("Invalid base64: {}", e)))
}

/// Decode a peer-supplied string, refusing anything that would decode to more
/// than `max_decoded` bytes before any allocation happens.
pub fn decode_bounded(encoded: &str, max_decoded: usize) -> Result<Vec<u8>> {
    let max_encoded = max_decoded.div_ceil(3).saturating_mul(4);
    if encoded.len() > max_encoded {
        return Err(CryptoError::BadInput(format!(
            "Encoded value exceeds {} bytes",
            max_decoded
        )));
    }
    let decoded = decode(encoded)?;
    if decoded.len() > max_decoded {
        return Err(CryptoError::BadInput(format!(
            "Decoded value exceeds {} bytes",
            max_decoded
        )));
    }
    Ok(decoded)
}
