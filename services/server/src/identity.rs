//! Identity provider seam.
//!
//! OAuth code exchange is an external collaborator: the service only needs
//! "this code is (provider, provider_id, username)".  The production
//! adapter talks to Google/GitHub; tests implement the trait directly.

use async_trait::async_trait;
use serde::Deserialize;
use thiserror::Error;
use wv_protocol::Provider;

#[derive(Debug, Error)]
pub enum IdentityError {
    /// The provider refused the code.
    #[error("identity exchange denied")]
    Denied,
    #[error("HTTP: {0}")]
    Http(#[from] reqwest::Error),
    #[error("malformed provider profile")]
    MalformedProfile,
}

/// The external identity a login code resolves to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExternalIdentity {
    pub provider_id: String,
    pub username: String,
}

#[async_trait]
pub trait IdentityProvider: Send + Sync {
    async fn exchange(&self, provider: Provider, code: &str)
        -> Result<ExternalIdentity, IdentityError>;
}

#[derive(Debug, Clone)]
pub struct OAuthConfig {
    pub google_client_id: String,
    pub google_client_secret: String,
    pub github_client_id: String,
    pub github_client_secret: String,
    pub redirect_url: String,
}

/// Production adapter performing the code-for-profile exchange.
pub struct OAuthIdentityProvider {
    http: reqwest::Client,
    config: OAuthConfig,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
}

#[derive(Deserialize)]
struct GoogleProfile {
    sub: String,
    name: Option<String>,
}

#[derive(Deserialize)]
struct GithubProfile {
    id: i64,
    login: String,
}

impl OAuthIdentityProvider {
    pub fn new(config: OAuthConfig) -> Self {
        Self { http: reqwest::Client::new(), config }
    }

    async fn exchange_google(&self, code: &str) -> Result<ExternalIdentity, IdentityError> {
        let token: TokenResponse = self
            .http
            .post("https://oauth2.googleapis.com/token")
            .form(&[
                ("client_id", self.config.google_client_id.as_str()),
                ("client_secret", self.config.google_client_secret.as_str()),
                ("code", code),
                ("grant_type", "authorization_code"),
                ("redirect_uri", self.config.redirect_url.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;
        let access_token = token.access_token.ok_or(IdentityError::Denied)?;

        let profile: GoogleProfile = self
            .http
            .get("https://openidconnect.googleapis.com/v1/userinfo")
            .bearer_auth(access_token)
            .send()
            .await?
            .json()
            .await
            .map_err(|_| IdentityError::MalformedProfile)?;
        Ok(ExternalIdentity {
            username: profile.name.unwrap_or_else(|| profile.sub.clone()),
            provider_id: profile.sub,
        })
    }

    async fn exchange_github(&self, code: &str) -> Result<ExternalIdentity, IdentityError> {
        let token: TokenResponse = self
            .http
            .post("https://github.com/login/oauth/access_token")
            .header("Accept", "application/json")
            .form(&[
                ("client_id", self.config.github_client_id.as_str()),
                ("client_secret", self.config.github_client_secret.as_str()),
                ("code", code),
                ("redirect_uri", self.config.redirect_url.as_str()),
            ])
            .send()
            .await?
            .json()
            .await?;
        let access_token = token.access_token.ok_or(IdentityError::Denied)?;

        let profile: GithubProfile = self
            .http
            .get("https://api.github.com/user")
            .header("User-Agent", "webverse-server")
            .bearer_auth(access_token)
            .send()
            .await?
            .json()
            .await
            .map_err(|_| IdentityError::MalformedProfile)?;
        Ok(ExternalIdentity {
            provider_id: profile.id.to_string(),
            username: profile.login,
        })
    }
}

#[async_trait]
impl IdentityProvider for OAuthIdentityProvider {
    async fn exchange(
        &self,
        provider: Provider,
        code: &str,
    ) -> Result<ExternalIdentity, IdentityError> {
        match provider {
            Provider::Google => self.exchange_google(code).await,
            Provider::Github => self.exchange_github(code).await,
        }
    }
}
