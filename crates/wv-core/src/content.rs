//! Public stroke content validation.
//!
//! Public strokes carry a small base64-encoded JSON document the server can
//! inspect.  Private strokes are opaque ciphertext and are only checked for
//! nonce shape; the payload itself is never decoded.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use serde::Deserialize;
use thiserror::Error;

/// Maximum entries in each of the `dx` / `dy` delta arrays.
pub const MAX_DELTA_POINTS: usize = 1000;
/// Decoded private-stroke nonce length.
pub const NONCE_LEN: usize = 24;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ContentError {
    #[error("content is not valid base64")]
    BadBase64,
    #[error("content is not a stroke document")]
    BadJson,
    #[error("unknown tool")]
    BadTool,
    #[error("color is not #RRGGBB")]
    BadColor,
    #[error("width out of range")]
    BadWidth,
    #[error("coordinate is not finite")]
    BadCoordinate,
    #[error("too many delta points")]
    TooManyPoints,
    #[error("nonce must be empty on the public layer")]
    UnexpectedNonce,
    #[error("nonce is not {NONCE_LEN} bytes base64")]
    BadNonce,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct PublicContent {
    tool: u8,
    color: String,
    width: f64,
    start_x: f64,
    start_y: f64,
    dx: Vec<f64>,
    dy: Vec<f64>,
}

/// Validate the decoded shape of a public stroke's content blob.
pub fn validate_public_content(content_b64: &str) -> Result<(), ContentError> {
    let bytes = BASE64.decode(content_b64).map_err(|_| ContentError::BadBase64)?;
    let doc: PublicContent = serde_json::from_slice(&bytes).map_err(|_| ContentError::BadJson)?;

    if doc.tool > 1 {
        return Err(ContentError::BadTool);
    }
    if !is_rgb_color(&doc.color) {
        return Err(ContentError::BadColor);
    }
    if !doc.width.is_finite() || doc.width < 1.0 || doc.width > 20.0 {
        return Err(ContentError::BadWidth);
    }
    if !doc.start_x.is_finite() || !doc.start_y.is_finite() {
        return Err(ContentError::BadCoordinate);
    }
    if doc.dx.len() > MAX_DELTA_POINTS || doc.dy.len() > MAX_DELTA_POINTS {
        return Err(ContentError::TooManyPoints);
    }
    if doc.dx.iter().chain(doc.dy.iter()).any(|d| !d.is_finite()) {
        return Err(ContentError::BadCoordinate);
    }
    Ok(())
}

fn is_rgb_color(color: &str) -> bool {
    let Some(hex) = color.strip_prefix('#') else {
        return false;
    };
    hex.len() == 6 && hex.bytes().all(|b| b.is_ascii_hexdigit())
}

/// Check the nonce shape for the given layer: empty for public, exactly
/// [`NONCE_LEN`] bytes of base64 for private.
pub fn validate_private_nonce(layer: wv_protocol::Layer, nonce: &str) -> Result<(), ContentError> {
    match layer {
        wv_protocol::Layer::Public => {
            if nonce.is_empty() {
                Ok(())
            } else {
                Err(ContentError::UnexpectedNonce)
            }
        }
        wv_protocol::Layer::Private => {
            let decoded = BASE64.decode(nonce).map_err(|_| ContentError::BadNonce)?;
            if decoded.len() == NONCE_LEN {
                Ok(())
            } else {
                Err(ContentError::BadNonce)
            }
        }
    }
}
