//! Encryption envelope validation.
//!
//! The envelope holds the KEK salt and two DEK ciphertexts with their
//! nonces.  The server only checks shapes; it can never decrypt anything.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use wv_protocol::KeyEnvelope;

/// Decoded length of an encrypted DEK.
pub const ENCRYPTED_DEK_LEN: usize = 48;
/// Decoded length of a DEK nonce.
pub const DEK_NONCE_LEN: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum EnvelopeError {
    #[error("salt is missing or not base64")]
    BadSalt,
    #[error("encrypted DEK is not {ENCRYPTED_DEK_LEN} bytes base64")]
    BadDek,
    #[error("nonce is not {DEK_NONCE_LEN} bytes base64")]
    BadNonce,
}

/// Validate the field shapes of a full envelope.
pub fn validate_envelope(envelope: &KeyEnvelope) -> Result<(), EnvelopeError> {
    if envelope.salt_kek.is_empty() || BASE64.decode(&envelope.salt_kek).is_err() {
        return Err(EnvelopeError::BadSalt);
    }
    for dek in [&envelope.encrypted_dek1, &envelope.encrypted_dek2] {
        match BASE64.decode(dek) {
            Ok(bytes) if bytes.len() == ENCRYPTED_DEK_LEN => {}
            _ => return Err(EnvelopeError::BadDek),
        }
    }
    for nonce in [&envelope.nonce_dek1, &envelope.nonce_dek2] {
        match BASE64.decode(nonce) {
            Ok(bytes) if bytes.len() == DEK_NONCE_LEN => {}
            _ => return Err(EnvelopeError::BadNonce),
        }
    }
    Ok(())
}
