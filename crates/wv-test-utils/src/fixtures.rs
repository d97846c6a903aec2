//! Canned valid payloads for tests.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use wv_protocol::KeyEnvelope;

/// A well-formed public stroke content blob (base64 JSON).
pub fn stroke_content() -> String {
    BASE64.encode(
        r##"{"tool":0,"color":"#112233","width":2,"startX":4,"startY":5,"dx":[1,0,2],"dy":[0,1,1]}"##,
    )
}

/// A public stroke content blob with the given color, for telling strokes
/// apart in assertions.
pub fn stroke_content_colored(color: &str) -> String {
    BASE64.encode(format!(
        r##"{{"tool":0,"color":"{color}","width":2,"startX":4,"startY":5,"dx":[1],"dy":[1]}}"##
    ))
}

/// A private page key: base64 of 32 bytes.
pub fn private_page_key(seed: u8) -> String {
    BASE64.encode([seed; 32])
}

/// A 24-byte base64 nonce.
pub fn nonce(seed: u8) -> String {
    BASE64.encode([seed; 24])
}

/// A shape-valid encryption envelope.
pub fn key_envelope(seed: u8) -> KeyEnvelope {
    KeyEnvelope {
        salt_kek: BASE64.encode([seed; 16]),
        encrypted_dek1: BASE64.encode([seed; 48]),
        nonce_dek1: BASE64.encode([seed; 24]),
        encrypted_dek2: BASE64.encode([seed.wrapping_add(1); 48]),
        nonce_dek2: BASE64.encode([seed.wrapping_add(1); 24]),
    }
}
