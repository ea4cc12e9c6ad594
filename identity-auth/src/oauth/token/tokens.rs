//! OAuth token types.

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use serde::{Deserialize, Serialize};

/// Tokens returned by a provider's token endpoint.
#[derive(Debug, Clone)]
pub struct TokenSet {
    /// Access token for API requests.
    pub access_token: SecretString,
    /// Refresh token for obtaining new access tokens.
    pub refresh_token: Option<SecretString>,
    /// Raw ID token (OIDC only).
    pub id_token: Option<String>,
    /// Lifetime in seconds as reported by the provider.
    pub expires_in: Option<u64>,
    /// When the access token expires, derived from `expires_in`.
    pub expires_at: Option<DateTime<Utc>>,
    /// Token type (usually "Bearer").
    pub token_type: String,
    /// Granted scopes, when the provider reports them.
    pub scopes: Vec<String>,
}

impl TokenSet {
    /// Build a token set from a token endpoint response received at `now`.
    pub(crate) fn from_response(response: TokenResponse, now: DateTime<Utc>) -> Self {
        let expires_at = response
            .expires_in
            .and_then(|secs| i64::try_from(secs).ok())
            .map(|secs| now + chrono::Duration::seconds(secs));

        Self {
            access_token: SecretString::new(response.access_token),
            refresh_token: response.refresh_token.map(SecretString::new),
            id_token: response.id_token,
            expires_in: response.expires_in,
            expires_at,
            token_type: response.token_type,
            scopes: response
                .scope
                .map(|scope| scope.split_whitespace().map(str::to_string).collect())
                .unwrap_or_default(),
        }
    }

    /// Secret-free view of the token set.
    pub fn summary(&self) -> TokenSummary {
        TokenSummary {
            token_type: self.token_type.clone(),
            expires_at: self.expires_at,
            scopes: self.scopes.clone(),
            has_refresh_token: self.refresh_token.is_some(),
            has_id_token: self.id_token.is_some(),
        }
    }
}

/// What may be shown about a [`TokenSet`] outside the process: type, expiry
/// and which tokens are present, never their values.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenSummary {
    pub token_type: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub expires_at: Option<DateTime<Utc>>,
    pub scopes: Vec<String>,
    pub has_refresh_token: bool,
    pub has_id_token: bool,
}

/// Token endpoint success body.
#[derive(Debug, Deserialize)]
pub(crate) struct TokenResponse {
    pub access_token: String,
    #[serde(default)]
    pub refresh_token: Option<String>,
    #[serde(default)]
    pub id_token: Option<String>,
    #[serde(default)]
    pub expires_in: Option<u64>,
    #[serde(default = "default_token_type")]
    pub token_type: String,
    #[serde(default)]
    pub scope: Option<String>,
}

fn default_token_type() -> String {
    "Bearer".to_string()
}

/// OAuth 2.0 error body (RFC 6749 section 5.2).
#[derive(Debug, Deserialize)]
pub(crate) struct OAuthErrorResponse {
    pub error: String,
    #[serde(default)]
    pub error_description: Option<String>,
}

/// Hint passed to the revocation endpoint (RFC 7009).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TokenTypeHint {
    AccessToken,
    RefreshToken,
}

impl TokenTypeHint {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenTypeHint::AccessToken => "access_token",
            TokenTypeHint::RefreshToken => "refresh_token",
        }
    }
}

/// Result of a revocation call. Both variants are successes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationOutcome {
    /// The provider accepted the revocation request.
    Revoked,
    /// The provider exposes no revocation endpoint; nothing was sent.
    NotSupported,
}
