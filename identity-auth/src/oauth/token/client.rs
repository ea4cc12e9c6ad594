//! Token endpoint client: code exchange, refresh and revocation.

use std::sync::Arc;

use secrecy::{ExposeSecret, SecretString};
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use super::tokens::{OAuthErrorResponse, RevocationOutcome, TokenResponse, TokenSet, TokenTypeHint};
use crate::clock::Clock;
use crate::error::{
    configuration_error, protocol_error, state_error, ConfigurationErrorKind, Error,
    ProtocolErrorKind, StateErrorKind,
};
use crate::http::IdpHttpClient;
use crate::oauth::state::AuthorizationStore;
use crate::oauth::userinfo::{normalize, ValidatedIdentity};
use crate::oidc::{DiscoveryResolver, IdTokenValidator};
use crate::providers::{ProviderConfig, ProviderRegistry};

/// A completed login: who the user is and the tokens the provider issued.
#[derive(Debug, Clone)]
pub struct AuthResult {
    pub user: ValidatedIdentity,
    pub tokens: TokenSet,
}

/// Talks to provider token, userinfo and revocation endpoints.
pub struct TokenClient {
    registry: Arc<ProviderRegistry>,
    discovery: Arc<DiscoveryResolver>,
    validator: Arc<IdTokenValidator>,
    store: Arc<AuthorizationStore>,
    http: IdpHttpClient,
    clock: Arc<dyn Clock>,
}

impl TokenClient {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        discovery: Arc<DiscoveryResolver>,
        validator: Arc<IdTokenValidator>,
        store: Arc<AuthorizationStore>,
        http: IdpHttpClient,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            discovery,
            validator,
            store,
            http,
            clock,
        }
    }

    /// Exchange an authorization code for tokens and the user's identity.
    ///
    /// The pending authorization for `state` is consumed first; an unknown,
    /// expired or mismatching state fails before any request is sent. When
    /// `code_verifier` is given it must equal the stored one.
    pub async fn exchange(
        &self,
        provider_id: &str,
        code: &str,
        state: &str,
        code_verifier: Option<&str>,
    ) -> Result<AuthResult, Error> {
        let pending = self.store.consume(state)?;
        if pending.provider_id != provider_id {
            return Err(state_error(
                StateErrorKind::ProviderMismatch,
                &format!("state was issued for provider {}", pending.provider_id),
            ));
        }
        if let Some(supplied) = code_verifier {
            if supplied != pending.code_verifier.expose_secret().as_str() {
                return Err(state_error(
                    StateErrorKind::VerifierMismatch,
                    "code verifier does not match the authorization request",
                ));
            }
        }
        if code.trim().is_empty() {
            return Err(configuration_error(
                ConfigurationErrorKind::MissingField("code"),
                "authorization code must not be empty",
            ));
        }

        let config = self.provider_config(provider_id).await?;
        debug!("Exchanging authorization code with provider {}", provider_id);

        let response = self
            .request_tokens(
                &config,
                &[
                    ("grant_type", "authorization_code"),
                    ("client_id", config.client_id.as_str()),
                    ("client_secret", config.client_secret.expose_secret().as_str()),
                    ("code", code),
                    ("redirect_uri", config.redirect_uri.as_str()),
                    ("code_verifier", pending.code_verifier.expose_secret().as_str()),
                ],
            )
            .await?;
        let tokens = TokenSet::from_response(response, self.clock.now());

        let user = match (&tokens.id_token, config.is_oidc()) {
            (Some(id_token), true) => {
                let (claims, expires_at) = self
                    .validator
                    .validate(provider_id, id_token, pending.nonce.as_deref())
                    .await
                    .into_result()?;
                normalize(provider_id, config.family, claims, Some(expires_at))?
            }
            _ => self.fetch_user_info(&config, &tokens).await?,
        };

        info!("Authorization code exchanged for provider {}", provider_id);
        Ok(AuthResult { user, tokens })
    }

    /// Obtain a new access token. If the provider does not rotate the refresh
    /// token, the one passed in is carried over into the result.
    pub async fn refresh(&self, provider_id: &str, refresh_token: &str) -> Result<TokenSet, Error> {
        if refresh_token.trim().is_empty() {
            return Err(configuration_error(
                ConfigurationErrorKind::MissingField("refreshToken"),
                "refresh token must not be empty",
            ));
        }
        let config = self.provider_config(provider_id).await?;
        debug!("Refreshing access token with provider {}", provider_id);

        let response = self
            .request_tokens(
                &config,
                &[
                    ("grant_type", "refresh_token"),
                    ("client_id", config.client_id.as_str()),
                    ("client_secret", config.client_secret.expose_secret().as_str()),
                    ("refresh_token", refresh_token),
                ],
            )
            .await?;
        let mut tokens = TokenSet::from_response(response, self.clock.now());

        if tokens.refresh_token.is_none() {
            tokens.refresh_token = Some(SecretString::new(refresh_token.to_string()));
        }
        if let (Some(id_token), true) = (&tokens.id_token, config.is_oidc()) {
            self.validator
                .validate(provider_id, id_token, None)
                .await
                .into_result()?;
        }

        info!("Refreshed access token for provider {}", provider_id);
        Ok(tokens)
    }

    /// Revoke a token (RFC 7009). Providers without a revocation endpoint yield
    /// [`RevocationOutcome::NotSupported`] and no request is made.
    pub async fn revoke(
        &self,
        provider_id: &str,
        token: &str,
        hint: Option<TokenTypeHint>,
    ) -> Result<RevocationOutcome, Error> {
        let config = self.provider_config(provider_id).await?;
        let Some(revocation_url) = config.revocation_url.as_deref() else {
            info!("Provider {} has no revocation endpoint, nothing to revoke", provider_id);
            return Ok(RevocationOutcome::NotSupported);
        };

        let mut form = vec![
            ("token", token),
            ("client_id", config.client_id.as_str()),
            ("client_secret", config.client_secret.expose_secret().as_str()),
        ];
        if let Some(hint) = hint {
            form.push(("token_type_hint", hint.as_str()));
        }

        let response = self
            .http
            .retrying
            .post(revocation_url)
            .form(&form)
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(error_from_body(status.as_u16(), &body, "revocation"));
        }

        info!("Revoked token with provider {}", provider_id);
        Ok(RevocationOutcome::Revoked)
    }

    /// Current config for `provider_id`, refreshed from discovery when enabled.
    async fn provider_config(&self, provider_id: &str) -> Result<ProviderConfig, Error> {
        let config = self.registry.resolve_enabled(provider_id)?;
        if config.discovery_url().is_none() {
            return Ok(config);
        }
        match self.discovery.resolve(provider_id).await {
            Ok(_) => self.registry.resolve_enabled(provider_id),
            Err(e) => {
                warn!(
                    "Discovery for {} failed, using configured endpoints: {}",
                    provider_id, e
                );
                Ok(config)
            }
        }
    }

    async fn request_tokens(
        &self,
        config: &ProviderConfig,
        form: &[(&str, &str)],
    ) -> Result<TokenResponse, Error> {
        let response = self
            .http
            .single_shot
            .post(&config.token_url)
            .header(reqwest::header::ACCEPT, "application/json")
            .form(form)
            .send()
            .await?;

        let status = response.status();
        let body = response.text().await?;
        if !status.is_success() {
            warn!(
                "Token endpoint of {} answered with status {}",
                config.id,
                status.as_u16()
            );
            return Err(error_from_body(status.as_u16(), &body, "token"));
        }

        // Some providers report errors with a 200 status.
        match serde_json::from_str::<TokenResponse>(&body) {
            Ok(tokens) => Ok(tokens),
            Err(parse_error) => match serde_json::from_str::<OAuthErrorResponse>(&body) {
                Ok(oauth_error) => Err(provider_error(oauth_error, "token")),
                Err(_) => Err(parse_error.into()),
            },
        }
    }

    async fn fetch_user_info(
        &self,
        config: &ProviderConfig,
        tokens: &TokenSet,
    ) -> Result<ValidatedIdentity, Error> {
        let url = config.user_info_url.as_deref().ok_or_else(|| {
            configuration_error(
                ConfigurationErrorKind::MissingField("userInfoUrl"),
                &format!("provider {} has no ID token and no userinfo endpoint", config.id),
            )
        })?;
        debug!("Fetching user info for provider {}", config.id);

        let response = self
            .http
            .retrying
            .get(url)
            .bearer_auth(tokens.access_token.expose_secret())
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await?;
            return Err(error_from_body(status.as_u16(), &body, "userinfo"));
        }

        let claims: Map<String, Value> = response.json().await?;
        normalize(&config.id, config.family, claims, tokens.expires_at)
    }
}

fn error_from_body(status: u16, body: &str, endpoint: &str) -> Error {
    match serde_json::from_str::<OAuthErrorResponse>(body) {
        Ok(oauth_error) => provider_error(oauth_error, endpoint),
        Err(_) => protocol_error(
            ProtocolErrorKind::UnexpectedStatus(status),
            &format!("{endpoint} endpoint returned status {status}"),
        ),
    }
}

fn provider_error(oauth_error: OAuthErrorResponse, endpoint: &str) -> Error {
    let message = match &oauth_error.error_description {
        Some(description) => format!("{endpoint} endpoint rejected the request: {description}"),
        None => format!("{endpoint} endpoint rejected the request"),
    };
    protocol_error(ProtocolErrorKind::ProviderError(oauth_error.error), &message)
}
