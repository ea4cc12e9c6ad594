//! In-memory provider registry.

use dashmap::DashMap;
use tracing::{debug, warn};

use super::config::require_url;
use super::{ProviderConfig, ProviderPatch};
use crate::error::{configuration_error, not_found_error, ConfigurationErrorKind, Error};
use crate::oidc::DiscoveryDocument;

/// Holds validated provider configurations for one service instance.
///
/// Reads through the public API are redacted; only the crate's own flows see
/// the client secret.
#[derive(Default)]
pub struct ProviderRegistry {
    providers: DashMap<String, ProviderConfig>,
}

impl ProviderRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Validate and store a provider, replacing any config with the same id.
    pub fn configure(&self, config: ProviderConfig) -> Result<ProviderConfig, Error> {
        let config = config.normalized();
        config.validate()?;
        debug!("Configuring provider {}", config.id);
        let redacted = config.redacted();
        self.providers.insert(config.id.clone(), config);
        Ok(redacted)
    }

    /// Redacted config for `id`.
    pub fn get(&self, id: &str) -> Result<ProviderConfig, Error> {
        self.providers
            .get(id)
            .map(|entry| entry.redacted())
            .ok_or_else(|| not_found_error(id))
    }

    /// Redacted configs belonging to an organization, sorted by id.
    pub fn list(&self, organization_id: &str) -> Vec<ProviderConfig> {
        let mut configs: Vec<ProviderConfig> = self
            .providers
            .iter()
            .filter(|entry| entry.organization_id == organization_id)
            .map(|entry| entry.redacted())
            .collect();
        configs.sort_by(|a, b| a.id.cmp(&b.id));
        configs
    }

    /// Apply a patch and re-validate the whole config before storing it.
    pub fn update(&self, id: &str, patch: ProviderPatch) -> Result<ProviderConfig, Error> {
        let mut entry = self.providers.get_mut(id).ok_or_else(|| not_found_error(id))?;
        let patched = patch.apply(entry.clone()).normalized();
        patched.validate()?;
        *entry = patched;
        Ok(entry.redacted())
    }

    /// Remove a provider, returning its redacted config.
    pub fn delete(&self, id: &str) -> Result<ProviderConfig, Error> {
        self.providers
            .remove(id)
            .map(|(_, config)| config.redacted())
            .ok_or_else(|| not_found_error(id))
    }

    /// Full config including the secret, for use by the crate's own flows.
    pub(crate) fn resolve(&self, id: &str) -> Result<ProviderConfig, Error> {
        self.providers
            .get(id)
            .map(|entry| entry.clone())
            .ok_or_else(|| not_found_error(id))
    }

    /// Like [`resolve`](Self::resolve), but rejects disabled providers.
    pub(crate) fn resolve_enabled(&self, id: &str) -> Result<ProviderConfig, Error> {
        let config = self.resolve(id)?;
        if !config.enabled {
            return Err(configuration_error(
                ConfigurationErrorKind::ProviderDisabled,
                &format!("provider {id} is disabled"),
            ));
        }
        Ok(config)
    }

    /// Overwrite endpoint fields with the ones a discovery document provides.
    /// Fields the document omits, or gives as something other than an
    /// absolute URL, keep their manual configuration.
    pub(crate) fn apply_discovery(&self, id: &str, document: &DiscoveryDocument) {
        let Some(mut entry) = self.providers.get_mut(id) else {
            return;
        };
        let metadata = &document.metadata;

        let authorization = discovered(id, "authorization_endpoint", &metadata.authorization_endpoint);
        if let Some(url) = authorization {
            entry.authorization_url = url;
        }
        if let Some(url) = discovered(id, "token_endpoint", &metadata.token_endpoint) {
            entry.token_url = url;
        }
        if let Some(url) = discovered(id, "userinfo_endpoint", &metadata.userinfo_endpoint) {
            entry.user_info_url = Some(url);
        }
        if let Some(url) = discovered(id, "jwks_uri", &metadata.jwks_uri) {
            entry.jwks_url = Some(url);
        }
        if let Some(url) = discovered(id, "revocation_endpoint", &metadata.revocation_endpoint) {
            entry.revocation_url = Some(url);
        }
        let end_session = discovered(id, "end_session_endpoint", &metadata.end_session_endpoint);
        if let (Some(url), super::Protocol::Oidc(settings)) = (end_session, &mut entry.protocol) {
            settings.end_session_endpoint = Some(url);
        }
    }

    pub fn len(&self) -> usize {
        self.providers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.providers.is_empty()
    }

    pub(crate) fn clear(&self) {
        self.providers.clear();
    }
}

fn discovered(provider_id: &str, field: &'static str, value: &Option<String>) -> Option<String> {
    let url = value.as_deref()?;
    match require_url(field, url) {
        Ok(()) => Some(url.to_string()),
        Err(e) => {
            warn!(
                "Ignoring discovered {} for provider {}: {}",
                field, provider_id, e
            );
            None
        }
    }
}
