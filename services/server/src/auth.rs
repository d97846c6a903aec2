//! Session token issuance and verification (HS256 JWTs).
//!
//! REST requests carry the token as a bearer header; WebSocket upgrades
//! carry it as the second subprotocol token.

use jsonwebtoken::{decode, encode, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use wv_protocol::Provider;

use crate::store::User;

/// Token lifetime.
const TOKEN_TTL_SECS: i64 = 30 * 24 * 60 * 60;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Claims {
    /// The server-minted user id.
    pub sub: String,
    pub provider: Provider,
    pub provider_id: String,
    pub username: String,
    pub exp: i64,
}

pub struct TokenAuthority {
    encoding: EncodingKey,
    decoding: DecodingKey,
}

impl TokenAuthority {
    pub fn new(secret: &str) -> Self {
        Self {
            encoding: EncodingKey::from_secret(secret.as_bytes()),
            decoding: DecodingKey::from_secret(secret.as_bytes()),
        }
    }

    pub fn issue(&self, user: &User) -> Result<String, jsonwebtoken::errors::Error> {
        let claims = Claims {
            sub: user.id.clone(),
            provider: user.provider,
            provider_id: user.provider_id.clone(),
            username: user.username.clone(),
            exp: chrono::Utc::now().timestamp() + TOKEN_TTL_SECS,
        };
        encode(&Header::default(), &claims, &self.encoding)
    }

    /// `None` for anything but a well-formed, unexpired token.
    pub fn verify(&self, token: &str) -> Option<Claims> {
        decode::<Claims>(token, &self.decoding, &Validation::default())
            .map(|data| data.claims)
            .ok()
    }
}

pub fn extract_bearer(authorization: &str) -> Option<&str> {
    authorization.strip_prefix("Bearer ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use wv_protocol::Provider;

    fn user() -> User {
        User {
            id: "u-1".to_owned(),
            provider: Provider::Github,
            provider_id: "gh-9".to_owned(),
            username: "alice".to_owned(),
            created_at: chrono::Utc::now(),
            stroke_count: 0,
            key_version: 0,
            envelope: None,
        }
    }

    #[test]
    fn issue_then_verify_round_trips_the_identity() {
        let authority = TokenAuthority::new("test-secret");
        let token = authority.issue(&user()).expect("issue");
        let claims = authority.verify(&token).expect("verify");
        assert_eq!(claims.sub, "u-1");
        assert_eq!(claims.provider, Provider::Github);
        assert_eq!(claims.provider_id, "gh-9");
        assert_eq!(claims.username, "alice");
    }

    #[test]
    fn verify_rejects_garbage_and_wrong_secrets() {
        let authority = TokenAuthority::new("test-secret");
        assert!(authority.verify("not-a-jwt").is_none());

        let other = TokenAuthority::new("other-secret");
        let token = other.issue(&user()).expect("issue");
        assert!(authority.verify(&token).is_none());
    }

    #[test]
    fn extract_bearer_requires_the_scheme() {
        assert_eq!(extract_bearer("Bearer abc"), Some("abc"));
        assert_eq!(extract_bearer("Basic abc"), None);
    }
}
