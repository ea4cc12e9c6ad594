//! The service object owning every component of the authentication core.

use std::sync::Arc;

use events::{AuthEvent, EventPublisher};
use serde::{Serialize, Serializer};
use tracing::{info, warn};

use crate::clock::{Clock, SystemClock};
use crate::error::Error;
use crate::http::{HttpClientConfig, IdpClientBuilder, IdpHttpClient};
use crate::oauth::token::{AuthResult, RevocationOutcome, TokenClient, TokenSet, TokenTypeHint};
use crate::oauth::{
    AuthorizationBuilder, AuthorizationParams, AuthorizationRequest, AuthorizationStore,
    ValidatedIdentity,
};
use crate::oidc::{DiscoveryResolver, IdTokenValidation, IdTokenValidator, JwksCache};
use crate::providers::{ProviderConfig, ProviderPatch, ProviderRegistry};
use crate::settings::{chrono_duration, Settings};

/// Flat form of a flow result for collaborators that branch on a flag rather
/// than on `Result`.
#[derive(Debug, Clone, Serialize)]
pub struct AuthOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user: Option<ValidatedIdentity>,
    /// Serialized as a `TokenSummary`; token values never leave the process.
    #[serde(
        skip_serializing_if = "Option::is_none",
        serialize_with = "serialize_token_summary"
    )]
    pub tokens: Option<TokenSet>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

fn serialize_token_summary<S: Serializer>(
    tokens: &Option<TokenSet>,
    serializer: S,
) -> Result<S::Ok, S::Error> {
    tokens.as_ref().map(TokenSet::summary).serialize(serializer)
}

impl From<Result<AuthResult, Error>> for AuthOutcome {
    fn from(result: Result<AuthResult, Error>) -> Self {
        match result {
            Ok(AuthResult { user, tokens }) => Self {
                success: true,
                user: Some(user),
                tokens: Some(tokens),
                error: None,
            },
            Err(e) => Self {
                success: false,
                user: None,
                tokens: None,
                error: Some(e.to_string()),
            },
        }
    }
}

/// Result of one connectivity check.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum CheckOutcome {
    Skipped,
    Passed(String),
    Failed(String),
}

/// Connectivity checks against a provider's endpoints.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ConnectionReport {
    pub provider_id: String,
    pub discovery: CheckOutcome,
    pub signing_keys: CheckOutcome,
    pub authorization_endpoint: CheckOutcome,
}

impl ConnectionReport {
    /// True when no check failed.
    pub fn is_healthy(&self) -> bool {
        ![
            &self.discovery,
            &self.signing_keys,
            &self.authorization_endpoint,
        ]
        .iter()
        .any(|check| matches!(check, CheckOutcome::Failed(_)))
    }
}

/// Builder for [`AuthService`].
pub struct AuthServiceBuilder {
    settings: Settings,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
}

impl AuthServiceBuilder {
    pub fn new() -> Self {
        Self {
            settings: Settings::default(),
            clock: Arc::new(SystemClock),
            events: EventPublisher::new(),
        }
    }

    pub fn with_settings(mut self, settings: Settings) -> Self {
        self.settings = settings;
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_events(mut self, events: EventPublisher) -> Self {
        self.events = events;
        self
    }

    pub fn build(self) -> Result<AuthService, Error> {
        let settings = self.settings;
        let clock = self.clock;
        let http = IdpClientBuilder::new()
            .with_config(HttpClientConfig::from(&settings))
            .build()?;

        let registry = Arc::new(ProviderRegistry::new());
        let store = Arc::new(AuthorizationStore::with_ttl(
            chrono_duration(settings.authorization_ttl),
            clock.clone(),
        ));
        let discovery = Arc::new(DiscoveryResolver::new(
            registry.clone(),
            http.clone(),
            clock.clone(),
            settings.discovery_ttl,
            settings.discovery_timeout,
        ));
        let jwks = Arc::new(JwksCache::new(
            registry.clone(),
            http.clone(),
            clock.clone(),
            settings.jwks_ttl,
            settings.jwks_max_keys,
            settings.jwks_fetches_per_minute,
        ));
        let validator = Arc::new(IdTokenValidator::new(
            registry.clone(),
            discovery.clone(),
            jwks.clone(),
            clock.clone(),
        ));
        let authorizer =
            AuthorizationBuilder::new(registry.clone(), discovery.clone(), store.clone());
        let tokens = TokenClient::new(
            registry.clone(),
            discovery.clone(),
            validator.clone(),
            store.clone(),
            http.clone(),
            clock.clone(),
        );

        Ok(AuthService {
            registry,
            store,
            discovery,
            jwks,
            validator,
            authorizer,
            tokens,
            http,
            clock,
            events: self.events,
        })
    }
}

impl Default for AuthServiceBuilder {
    fn default() -> Self {
        Self::new()
    }
}

/// Entry point of the authentication core.
///
/// One instance owns the provider registry, the pending-authorization store
/// and the discovery and key caches. Nothing is global; dropping the service or
/// calling [`shutdown`](Self::shutdown) releases everything.
pub struct AuthService {
    registry: Arc<ProviderRegistry>,
    store: Arc<AuthorizationStore>,
    discovery: Arc<DiscoveryResolver>,
    jwks: Arc<JwksCache>,
    validator: Arc<IdTokenValidator>,
    authorizer: AuthorizationBuilder,
    tokens: TokenClient,
    http: IdpHttpClient,
    clock: Arc<dyn Clock>,
    events: EventPublisher,
}

impl AuthService {
    pub fn builder() -> AuthServiceBuilder {
        AuthServiceBuilder::new()
    }

    /// Build the URL to send the user to and remember its state, nonce and
    /// PKCE verifier.
    pub async fn generate_authorization_url(
        &self,
        provider_id: &str,
        params: AuthorizationParams,
    ) -> Result<AuthorizationRequest, Error> {
        self.authorizer.build(provider_id, params).await
    }

    /// Complete a login from the provider's callback parameters.
    pub async fn exchange_code_for_tokens(
        &self,
        provider_id: &str,
        code: &str,
        state: &str,
        code_verifier: Option<&str>,
    ) -> Result<AuthResult, Error> {
        let result = self
            .tokens
            .exchange(provider_id, code, state, code_verifier)
            .await;

        let event = match &result {
            Ok(auth) => AuthEvent::LoginSucceeded {
                provider_id: provider_id.to_string(),
                user: serde_json::to_value(&auth.user).unwrap_or_default(),
            },
            Err(e) => {
                warn!("Login with provider {} failed: {}", provider_id, e);
                AuthEvent::LoginFailed {
                    provider_id: provider_id.to_string(),
                    reason: e.to_string(),
                }
            }
        };
        self.events.publish(event).await;
        result
    }

    pub async fn refresh_access_token(
        &self,
        provider_id: &str,
        refresh_token: &str,
    ) -> Result<TokenSet, Error> {
        let tokens = self.tokens.refresh(provider_id, refresh_token).await?;
        self.events
            .publish(AuthEvent::TokenRefreshed {
                provider_id: provider_id.to_string(),
            })
            .await;
        Ok(tokens)
    }

    pub async fn revoke_token(
        &self,
        provider_id: &str,
        token: &str,
        hint: Option<TokenTypeHint>,
    ) -> Result<RevocationOutcome, Error> {
        let outcome = self.tokens.revoke(provider_id, token, hint).await?;
        self.events
            .publish(AuthEvent::TokenRevoked {
                provider_id: provider_id.to_string(),
                revoked: outcome == RevocationOutcome::Revoked,
            })
            .await;
        Ok(outcome)
    }

    pub async fn validate_id_token(
        &self,
        provider_id: &str,
        id_token: &str,
        expected_nonce: Option<&str>,
    ) -> IdTokenValidation {
        self.validator
            .validate(provider_id, id_token, expected_nonce)
            .await
    }

    /// Create or replace a provider. When discovery is enabled the document is
    /// loaded right away; a failed load is logged and the configured endpoints
    /// stay in effect.
    pub async fn configure_provider(&self, config: ProviderConfig) -> Result<ProviderConfig, Error> {
        let configured = self.registry.configure(config)?;
        self.evict_caches(&configured.id);
        self.load_discovery(&configured).await;

        info!("Configured provider {}", configured.id);
        self.events
            .publish(AuthEvent::ProviderConfigured {
                provider_id: configured.id.clone(),
                organization_id: configured.organization_id.clone(),
            })
            .await;
        self.registry.get(&configured.id)
    }

    pub fn list_providers(&self, organization_id: &str) -> Vec<ProviderConfig> {
        self.registry.list(organization_id)
    }

    pub fn get_provider(&self, provider_id: &str) -> Result<ProviderConfig, Error> {
        self.registry.get(provider_id)
    }

    pub async fn update_provider(
        &self,
        provider_id: &str,
        patch: ProviderPatch,
    ) -> Result<ProviderConfig, Error> {
        let updated = self.registry.update(provider_id, patch)?;
        self.evict_caches(provider_id);
        self.load_discovery(&updated).await;

        self.events
            .publish(AuthEvent::ProviderConfigured {
                provider_id: updated.id.clone(),
                organization_id: updated.organization_id.clone(),
            })
            .await;
        self.registry.get(provider_id)
    }

    /// Remove a provider, its cached documents and keys, and any logins still
    /// pending against it.
    pub async fn delete_provider(&self, provider_id: &str) -> Result<ProviderConfig, Error> {
        let deleted = self.registry.delete(provider_id)?;
        self.evict_caches(provider_id);
        self.store.forget_provider(provider_id);

        info!("Deleted provider {}", provider_id);
        self.events
            .publish(AuthEvent::ProviderDeleted {
                provider_id: provider_id.to_string(),
            })
            .await;
        Ok(deleted)
    }

    /// Check that the provider's endpoints answer.
    pub async fn test_connection(&self, provider_id: &str) -> Result<ConnectionReport, Error> {
        let config = self.registry.resolve(provider_id)?;

        let discovery = match config.discovery_url() {
            None => CheckOutcome::Skipped,
            Some(url) => {
                let started = self.clock.now();
                match self.discovery.refresh(provider_id).await {
                    Ok(document) if document.fetched_at < started => CheckOutcome::Failed(format!(
                        "{url} unreachable, last good document from {}",
                        document.fetched_at
                    )),
                    Ok(document) => CheckOutcome::Passed(format!(
                        "issuer {}",
                        document.metadata.issuer.unwrap_or_else(|| "unspecified".to_string())
                    )),
                    Err(e) => CheckOutcome::Failed(e.to_string()),
                }
            }
        };

        // Discovery may have changed the endpoints.
        let config = self.registry.resolve(provider_id)?;

        let signing_keys = match (config.is_oidc(), &config.jwks_url) {
            (true, Some(_)) => match self.jwks.refresh(provider_id).await {
                Ok(0) => CheckOutcome::Failed("key set is empty".to_string()),
                Ok(count) => CheckOutcome::Passed(format!("{count} keys published")),
                Err(e) => CheckOutcome::Failed(e.to_string()),
            },
            _ => CheckOutcome::Skipped,
        };

        let authorization_endpoint = match self
            .http
            .single_shot
            .get(&config.authorization_url)
            .send()
            .await
        {
            Ok(response) => CheckOutcome::Passed(format!("HTTP {}", response.status().as_u16())),
            Err(e) => CheckOutcome::Failed(Error::from(e).to_string()),
        };

        Ok(ConnectionReport {
            provider_id: provider_id.to_string(),
            discovery,
            signing_keys,
            authorization_endpoint,
        })
    }

    /// Drop expired pending authorizations, returning how many were removed.
    pub fn purge_expired_requests(&self) -> usize {
        self.store.purge_expired()
    }

    /// Release every provider, pending authorization and cache entry.
    pub fn shutdown(&self) {
        self.store.clear();
        self.discovery.clear();
        self.jwks.clear();
        self.registry.clear();
        info!("Authentication service shut down");
    }

    fn evict_caches(&self, provider_id: &str) {
        self.discovery.evict(provider_id);
        self.jwks.evict(provider_id);
    }

    async fn load_discovery(&self, config: &ProviderConfig) {
        if config.discovery_url().is_none() {
            return;
        }
        if let Err(e) = self.discovery.resolve(&config.id).await {
            warn!(
                "Discovery for provider {} failed, keeping configured endpoints: {}",
                config.id, e
            );
        }
    }
}
