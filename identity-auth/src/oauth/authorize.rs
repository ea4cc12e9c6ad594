//! Authorization URL construction.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use secrecy::SecretString;
use tracing::{debug, warn};
use url::Url;

use super::pkce::{PkceVerifier, CHALLENGE_METHOD};
use super::state::{random_token, AuthorizationStore};
use crate::error::{configuration_error, ConfigurationErrorKind, Error};
use crate::oidc::DiscoveryResolver;
use crate::providers::ProviderRegistry;

/// Query parameters this crate always sets itself.
const RESERVED_PARAMS: &[&str] = &[
    "response_type",
    "client_id",
    "redirect_uri",
    "scope",
    "state",
    "nonce",
    "code_challenge",
    "code_challenge_method",
];

/// Caller-supplied options for one authorization request.
#[derive(Debug, Clone, Default)]
pub struct AuthorizationParams {
    /// Use this state instead of generating one.
    pub state: Option<String>,
    /// Use this nonce instead of generating one. Ignored for OAuth 2.0 providers.
    pub nonce: Option<String>,
    /// Extra query parameters; these win over the provider's `additionalParams`.
    pub extra_params: BTreeMap<String, String>,
}

/// The URL to redirect the user to, plus the values bound to it.
#[derive(Debug, Clone)]
pub struct AuthorizationRequest {
    pub url: String,
    pub state: String,
    /// Present for OIDC providers only.
    pub nonce: Option<String>,
    pub code_verifier: SecretString,
    pub code_challenge: String,
    /// After this instant the callback for `state` is refused.
    pub expires_at: DateTime<Utc>,
}

/// Builds authorization URLs and records the pending authorization server-side.
pub struct AuthorizationBuilder {
    registry: Arc<ProviderRegistry>,
    discovery: Arc<DiscoveryResolver>,
    store: Arc<AuthorizationStore>,
}

impl AuthorizationBuilder {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        discovery: Arc<DiscoveryResolver>,
        store: Arc<AuthorizationStore>,
    ) -> Self {
        Self {
            registry,
            discovery,
            store,
        }
    }

    /// Build the authorization URL for `provider_id`.
    ///
    /// The state, nonce and PKCE verifier are stored before the URL is returned,
    /// so the callback can be checked against them.
    pub async fn build(
        &self,
        provider_id: &str,
        params: AuthorizationParams,
    ) -> Result<AuthorizationRequest, Error> {
        let mut config = self.registry.resolve_enabled(provider_id)?;
        if config.discovery_url().is_some() && self.discovery.resolve(provider_id).await.is_ok() {
            config = self.registry.resolve_enabled(provider_id)?;
        }

        let mut url = Url::parse(&config.authorization_url).map_err(|e| {
            configuration_error(
                ConfigurationErrorKind::InvalidUrl("authorizationUrl"),
                &format!("authorization URL is invalid: {e}"),
            )
        })?;

        let state = params.state.unwrap_or_else(random_token);
        let nonce = if config.is_oidc() {
            Some(params.nonce.unwrap_or_else(random_token))
        } else {
            if params.nonce.is_some() {
                debug!("Ignoring nonce for OAuth 2.0 provider {}", provider_id);
            }
            None
        };
        let verifier = PkceVerifier::generate();
        let challenge = verifier.challenge();

        let mut extra = config.additional_params.clone();
        extra.extend(params.extra_params);

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("response_type", "code")
                .append_pair("client_id", &config.client_id)
                .append_pair("redirect_uri", &config.redirect_uri)
                .append_pair("scope", &config.scopes.join(" "))
                .append_pair("state", &state)
                .append_pair("code_challenge", challenge.as_str())
                .append_pair("code_challenge_method", CHALLENGE_METHOD);
            if let Some(nonce) = &nonce {
                query.append_pair("nonce", nonce);
            }
            for (key, value) in &extra {
                if RESERVED_PARAMS.contains(&key.as_str()) {
                    warn!("Ignoring reserved authorization parameter {}", key);
                    continue;
                }
                query.append_pair(key, value);
            }
        }

        let pending = self.store.insert(
            &state,
            provider_id,
            nonce.clone(),
            SecretString::new(verifier.as_str().to_string()),
        )?;
        debug!("Issued authorization request for provider {}", provider_id);

        Ok(AuthorizationRequest {
            url: url.to_string(),
            state,
            nonce,
            code_verifier: SecretString::new(verifier.as_str().to_string()),
            code_challenge: challenge.as_str().to_string(),
            expires_at: pending.expires_at,
        })
    }
}
