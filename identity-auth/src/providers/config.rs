//! Provider configuration types and validation.

use std::collections::BTreeMap;

use jsonwebtoken::Algorithm;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize, Serializer};
use url::Url;

use crate::error::{configuration_error, ConfigurationErrorKind, Error};

/// Placeholder written wherever a client secret would otherwise be exposed.
pub const REDACTED_SECRET: &str = "********";

/// Default tolerance applied to `exp` when validating ID tokens.
pub const DEFAULT_CLOCK_TOLERANCE_SECS: u64 = 60;

/// ID token signing algorithms a provider may be configured with. Neither `none`
/// nor the HMAC family is accepted.
pub const ALLOWED_SIGNING_ALGORITHMS: &[Algorithm] = &[
    Algorithm::RS256,
    Algorithm::RS384,
    Algorithm::RS512,
    Algorithm::PS256,
    Algorithm::PS384,
    Algorithm::PS512,
    Algorithm::ES256,
    Algorithm::ES384,
];

/// Provider families with a dedicated claim mapping.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProviderFamily {
    Google,
    Microsoft,
    Github,
    #[default]
    Generic,
}

impl ProviderFamily {
    /// Get the provider family identifier string.
    pub fn as_str(&self) -> &'static str {
        match self {
            ProviderFamily::Google => "google",
            ProviderFamily::Microsoft => "microsoft",
            ProviderFamily::Github => "github",
            ProviderFamily::Generic => "generic",
        }
    }
}

/// Protocol spoken by a provider. Plain OAuth 2.0 providers never receive a
/// nonce and never have ID tokens validated.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Protocol {
    #[serde(rename = "oauth2")]
    OAuth2,
    Oidc(OidcSettings),
}

/// OpenID Connect specific settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OidcSettings {
    /// Expected `iss` claim of ID tokens.
    pub issuer: String,
    /// Discovery document location. Derived from the issuer when absent.
    #[serde(default)]
    pub discovery_url: Option<String>,
    #[serde(default)]
    pub use_discovery: bool,
    #[serde(default = "default_signing_alg")]
    pub id_token_signing_alg: Algorithm,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default = "default_clock_tolerance")]
    pub clock_tolerance_secs: u64,
}

fn default_signing_alg() -> Algorithm {
    Algorithm::RS256
}

fn default_clock_tolerance() -> u64 {
    DEFAULT_CLOCK_TOLERANCE_SECS
}

fn default_enabled() -> bool {
    true
}

fn serialize_redacted<S: Serializer>(_: &SecretString, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(REDACTED_SECRET)
}

impl OidcSettings {
    /// Settings for `issuer` with every other field at its default.
    pub fn new(issuer: impl Into<String>) -> Self {
        Self {
            issuer: issuer.into(),
            discovery_url: None,
            use_discovery: false,
            id_token_signing_alg: default_signing_alg(),
            end_session_endpoint: None,
            clock_tolerance_secs: DEFAULT_CLOCK_TOLERANCE_SECS,
        }
    }
}

/// A configured identity provider.
///
/// The client secret is never serialized: serializing a config always writes
/// [`REDACTED_SECRET`], and `Debug` output of the secret is redacted by `secrecy`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfig {
    pub id: String,
    pub organization_id: String,
    #[serde(default)]
    pub family: ProviderFamily,
    pub client_id: String,
    #[serde(serialize_with = "serialize_redacted")]
    pub client_secret: SecretString,
    pub authorization_url: String,
    pub token_url: String,
    #[serde(default)]
    pub user_info_url: Option<String>,
    #[serde(default)]
    pub jwks_url: Option<String>,
    #[serde(default)]
    pub revocation_url: Option<String>,
    pub scopes: Vec<String>,
    pub redirect_uri: String,
    #[serde(default)]
    pub additional_params: BTreeMap<String, String>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    pub protocol: Protocol,
}

impl ProviderConfig {
    /// OIDC settings, if this is an OIDC provider.
    pub fn oidc(&self) -> Option<&OidcSettings> {
        match &self.protocol {
            Protocol::OAuth2 => None,
            Protocol::Oidc(settings) => Some(settings),
        }
    }

    pub fn is_oidc(&self) -> bool {
        self.oidc().is_some()
    }

    /// Discovery document URL, when discovery is enabled for this provider.
    pub fn discovery_url(&self) -> Option<String> {
        let settings = self.oidc().filter(|settings| settings.use_discovery)?;
        Some(settings.discovery_url.clone().unwrap_or_else(|| {
            format!(
                "{}/.well-known/openid-configuration",
                settings.issuer.trim_end_matches('/')
            )
        }))
    }

    /// Check the invariants required before a provider can be activated.
    pub fn validate(&self) -> Result<(), Error> {
        require_non_empty("id", &self.id)?;
        require_non_empty("clientId", &self.client_id)?;
        require_non_empty("clientSecret", self.client_secret.expose_secret())?;
        require_url("authorizationUrl", &self.authorization_url)?;
        require_url("tokenUrl", &self.token_url)?;
        require_url("redirectUri", &self.redirect_uri)?;

        if self.scopes.iter().all(|scope| scope.trim().is_empty()) {
            return Err(configuration_error(
                ConfigurationErrorKind::MissingField("scopes"),
                "at least one scope is required",
            ));
        }

        for (field, value) in [
            ("userInfoUrl", &self.user_info_url),
            ("jwksUrl", &self.jwks_url),
            ("revocationUrl", &self.revocation_url),
        ] {
            if let Some(value) = value {
                require_url(field, value)?;
            }
        }

        if let Protocol::Oidc(settings) = &self.protocol {
            require_non_empty("issuer", &settings.issuer)?;
            if let Some(discovery_url) = &settings.discovery_url {
                require_url("discoveryUrl", discovery_url)?;
            }
            if !ALLOWED_SIGNING_ALGORITHMS.contains(&settings.id_token_signing_alg) {
                return Err(configuration_error(
                    ConfigurationErrorKind::UnsupportedAlgorithm,
                    &format!(
                        "{:?} is not an accepted ID token signing algorithm",
                        settings.id_token_signing_alg
                    ),
                ));
            }
        }

        Ok(())
    }

    /// Trim and de-duplicate scopes, keeping their first-seen order.
    pub fn normalized(mut self) -> Self {
        let mut scopes: Vec<String> = Vec::with_capacity(self.scopes.len());
        for scope in self.scopes.iter().map(|scope| scope.trim()) {
            if !scope.is_empty() && !scopes.iter().any(|existing| existing == scope) {
                scopes.push(scope.to_string());
            }
        }
        self.scopes = scopes;
        self
    }

    /// Copy of this config safe to hand to readers.
    pub fn redacted(&self) -> Self {
        Self {
            client_secret: SecretString::new(REDACTED_SECRET.to_string()),
            ..self.clone()
        }
    }
}

/// Partial update for a provider. Unset fields keep their current value.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderPatch {
    pub family: Option<ProviderFamily>,
    pub client_id: Option<String>,
    pub client_secret: Option<SecretString>,
    pub authorization_url: Option<String>,
    pub token_url: Option<String>,
    pub user_info_url: Option<String>,
    pub jwks_url: Option<String>,
    pub revocation_url: Option<String>,
    pub scopes: Option<Vec<String>>,
    pub redirect_uri: Option<String>,
    pub additional_params: Option<BTreeMap<String, String>>,
    pub enabled: Option<bool>,
    pub protocol: Option<Protocol>,
}

impl ProviderPatch {
    /// Apply this patch on top of `config`. The result is not validated.
    pub fn apply(self, mut config: ProviderConfig) -> ProviderConfig {
        if let Some(family) = self.family {
            config.family = family;
        }
        if let Some(client_id) = self.client_id {
            config.client_id = client_id;
        }
        if let Some(client_secret) = self.client_secret {
            config.client_secret = client_secret;
        }
        if let Some(authorization_url) = self.authorization_url {
            config.authorization_url = authorization_url;
        }
        if let Some(token_url) = self.token_url {
            config.token_url = token_url;
        }
        if self.user_info_url.is_some() {
            config.user_info_url = self.user_info_url;
        }
        if self.jwks_url.is_some() {
            config.jwks_url = self.jwks_url;
        }
        if self.revocation_url.is_some() {
            config.revocation_url = self.revocation_url;
        }
        if let Some(scopes) = self.scopes {
            config.scopes = scopes;
        }
        if let Some(redirect_uri) = self.redirect_uri {
            config.redirect_uri = redirect_uri;
        }
        if let Some(additional_params) = self.additional_params {
            config.additional_params = additional_params;
        }
        if let Some(enabled) = self.enabled {
            config.enabled = enabled;
        }
        if let Some(protocol) = self.protocol {
            config.protocol = protocol;
        }
        config
    }
}

fn require_non_empty(field: &'static str, value: &str) -> Result<(), Error> {
    if value.trim().is_empty() {
        return Err(configuration_error(
            ConfigurationErrorKind::MissingField(field),
            &format!("{field} must not be empty"),
        ));
    }
    Ok(())
}

pub(super) fn require_url(field: &'static str, value: &str) -> Result<(), Error> {
    require_non_empty(field, value)?;
    Url::parse(value).map_err(|e| {
        configuration_error(
            ConfigurationErrorKind::InvalidUrl(field),
            &format!("{field} is not an absolute URL: {e}"),
        )
    })?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::error::ErrorKind;

    pub(crate) fn google_config() -> ProviderConfig {
        ProviderConfig {
            id: "google-oauth2".to_string(),
            organization_id: "org-1".to_string(),
            family: ProviderFamily::Google,
            client_id: "client-123".to_string(),
            client_secret: SecretString::new("s3cret".to_string()),
            authorization_url: "https://accounts.example.com/o/oauth2/auth".to_string(),
            token_url: "https://accounts.example.com/token".to_string(),
            user_info_url: Some("https://accounts.example.com/userinfo".to_string()),
            jwks_url: Some("https://accounts.example.com/certs".to_string()),
            revocation_url: None,
            scopes: vec![
                "openid".to_string(),
                "email".to_string(),
                "profile".to_string(),
            ],
            redirect_uri: "https://app.example.com/auth/callback".to_string(),
            additional_params: BTreeMap::new(),
            enabled: true,
            protocol: Protocol::Oidc(OidcSettings::new("https://accounts.example.com")),
        }
    }

    #[test]
    fn test_valid_config_passes() {
        assert!(google_config().validate().is_ok());
    }

    #[test]
    fn test_missing_client_secret_is_rejected() {
        let mut config = google_config();
        config.client_secret = SecretString::new("  ".to_string());
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Configuration(ConfigurationErrorKind::MissingField("clientSecret"))
        );
    }

    #[test]
    fn test_empty_scopes_are_rejected() {
        let mut config = google_config();
        config.scopes = vec![" ".to_string()];
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Configuration(ConfigurationErrorKind::MissingField("scopes"))
        );
    }

    #[test]
    fn test_relative_token_url_is_rejected() {
        let mut config = google_config();
        config.token_url = "/token".to_string();
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Configuration(ConfigurationErrorKind::InvalidUrl("tokenUrl"))
        );
    }

    #[test]
    fn test_symmetric_algorithm_is_rejected() {
        let mut config = google_config();
        let mut settings = OidcSettings::new("https://accounts.example.com");
        settings.id_token_signing_alg = Algorithm::HS256;
        config.protocol = Protocol::Oidc(settings);
        let err = config.validate().unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::Configuration(ConfigurationErrorKind::UnsupportedAlgorithm)
        );
    }

    #[test]
    fn test_serialization_never_leaks_secret() {
        let json = serde_json::to_string(&google_config()).unwrap();
        assert!(!json.contains("s3cret"));
        assert!(json.contains(REDACTED_SECRET));
        assert!(!format!("{:?}", google_config()).contains("s3cret"));
    }

    #[test]
    fn test_deserialize_oidc_defaults() {
        let config: ProviderConfig = serde_json::from_value(serde_json::json!({
            "id": "okta",
            "organizationId": "org-9",
            "clientId": "abc",
            "clientSecret": "xyz",
            "authorizationUrl": "https://idp.example.com/authorize",
            "tokenUrl": "https://idp.example.com/token",
            "scopes": ["openid"],
            "redirectUri": "https://app.example.com/cb",
            "protocol": { "type": "oidc", "issuer": "https://idp.example.com", "useDiscovery": true }
        }))
        .unwrap();

        assert!(config.enabled);
        assert_eq!(config.family, ProviderFamily::Generic);
        let settings = config.oidc().unwrap();
        assert_eq!(settings.id_token_signing_alg, Algorithm::RS256);
        assert_eq!(settings.clock_tolerance_secs, 60);
        assert_eq!(
            config.discovery_url().as_deref(),
            Some("https://idp.example.com/.well-known/openid-configuration")
        );
    }

    #[test]
    fn test_normalized_dedupes_scopes_in_order() {
        let mut config = google_config();
        config.scopes = vec![
            "openid".to_string(),
            " email ".to_string(),
            "openid".to_string(),
            "".to_string(),
        ];
        assert_eq!(config.normalized().scopes, vec!["openid", "email"]);
    }

    #[test]
    fn test_patch_keeps_unset_fields() {
        let patch = ProviderPatch {
            client_id: Some("new-client".to_string()),
            enabled: Some(false),
            ..Default::default()
        };
        let patched = patch.apply(google_config());
        assert_eq!(patched.client_id, "new-client");
        assert!(!patched.enabled);
        assert_eq!(patched.token_url, "https://accounts.example.com/token");
    }
}
