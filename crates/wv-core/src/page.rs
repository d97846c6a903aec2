//! Page-key validation.
//!
//! A public page key is a normalized host+path: lowercased, no scheme, no
//! port, no query/fragment, no leading `www.`, no trailing `/`.  A private
//! page key is the base64 of a 32-byte client-side HMAC; the server never
//! sees the URL behind it.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD as BASE64;
use thiserror::Error;
use wv_protocol::Layer;

/// Decoded length of a private page key.
pub const PRIVATE_PAGE_KEY_LEN: usize = 32;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum PageKeyError {
    #[error("page key is empty")]
    Empty,
    #[error("page key carries a scheme")]
    Scheme,
    #[error("page key starts with www.")]
    WwwPrefix,
    #[error("page key carries a query or fragment")]
    QueryOrFragment,
    #[error("page key has a trailing slash")]
    TrailingSlash,
    #[error("page key carries a port or IPv6 host")]
    Colon,
    #[error("host has no dot")]
    NoDot,
    #[error("host is an IPv4 literal")]
    Ipv4Literal,
    #[error("page key does not parse as host+path")]
    NotAUrl,
    #[error("page key is not valid base64")]
    BadBase64,
    #[error("decoded page key is not {PRIVATE_PAGE_KEY_LEN} bytes")]
    BadLength,
}

/// Validate a page key for the given layer.
pub fn validate_page_key(layer: Layer, page_key: &str) -> Result<(), PageKeyError> {
    match layer {
        Layer::Public => validate_public(page_key),
        Layer::Private => validate_private(page_key),
    }
}

fn validate_public(key: &str) -> Result<(), PageKeyError> {
    if key.is_empty() {
        return Err(PageKeyError::Empty);
    }
    if key.contains("://") {
        return Err(PageKeyError::Scheme);
    }
    if key.starts_with("www.") {
        return Err(PageKeyError::WwwPrefix);
    }
    if key.contains('?') || key.contains('#') {
        return Err(PageKeyError::QueryOrFragment);
    }
    if key.ends_with('/') {
        return Err(PageKeyError::TrailingSlash);
    }
    // Rejects explicit ports and IPv6 literals in one check.
    if key.contains(':') {
        return Err(PageKeyError::Colon);
    }

    let host = key.split('/').next().unwrap_or("");
    if !host.contains('.') {
        return Err(PageKeyError::NoDot);
    }
    if host.parse::<std::net::Ipv4Addr>().is_ok() {
        return Err(PageKeyError::Ipv4Literal);
    }

    // A normalized key must survive URL parsing with its host intact.
    // `Url` lowercases hosts, so an uppercased host fails the comparison.
    let url = url::Url::parse(&format!("https://{key}")).map_err(|_| PageKeyError::NotAUrl)?;
    if url.host_str() != Some(host) {
        return Err(PageKeyError::NotAUrl);
    }
    if url.port().is_some() {
        return Err(PageKeyError::Colon);
    }
    Ok(())
}

fn validate_private(key: &str) -> Result<(), PageKeyError> {
    let decoded = BASE64.decode(key).map_err(|_| PageKeyError::BadBase64)?;
    if decoded.len() != PRIVATE_PAGE_KEY_LEN {
        return Err(PageKeyError::BadLength);
    }
    Ok(())
}
