use hmac::{Hmac, Mac};
use sha2::Sha256;
use thiserror::Error;

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error)]
pub enum SignatureError {
    #[error("invalid key length")]
    InvalidKeyLength,
    #[error("signature mismatch")]
    Mismatch,
    #[error("invalid signature encoding: {0}")]
    InvalidEncoding(String),
}

/// HMAC-SHA256 `payload` with `key`, returning lower-case hex.
pub fn sign_hex(key: &[u8], payload: &[u8]) -> Result<String, SignatureError> {
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignatureError::InvalidKeyLength)?;
    mac.update(payload);
    Ok(hex::encode(mac.finalize().into_bytes()))
}

/// Verify a hex-encoded HMAC-SHA256 signature in constant time.
pub fn verify_hex(key: &[u8], payload: &[u8], signature_hex: &str) -> Result<(), SignatureError> {
    let sig_bytes = hex::decode(signature_hex)
        .map_err(|e| SignatureError::InvalidEncoding(e.to_string()))?;
    let mut mac = HmacSha256::new_from_slice(key).map_err(|_| SignatureError::InvalidKeyLength)?;
    mac.update(payload);
    mac.verify_slice(&sig_bytes)
        .map_err(|_| SignatureError::Mismatch)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sign_then_verify_round_trips() {
        let key = b"super-secret-signing-key";
        let payload = b"lib/demo.wasm|abc123|1.0.0|activate";
        let sig = sign_hex(key, payload).unwrap();
        assert!(verify_hex(key, payload, &sig).is_ok());
    }

    #[test]
    fn tampered_payload_fails() {
        let key = b"super-secret-signing-key";
        let sig = sign_hex(key, b"original").unwrap();
        assert!(verify_hex(key, b"tampered", &sig).is_err());
    }

    #[test]
    fn wrong_key_fails() {
        let sig = sign_hex(b"key-a", b"payload").unwrap();
        assert!(verify_hex(b"key-b", b"payload", &sig).is_err());
    }
}
