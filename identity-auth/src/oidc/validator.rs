//! ID token signature and claim verification.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use jsonwebtoken::errors::ErrorKind as JwtErrorKind;
use jsonwebtoken::{decode, decode_header, DecodingKey, Validation};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use super::{DiscoveryResolver, JwksCache};
use crate::clock::Clock;
use crate::error::{validation_error, Error, ErrorKind, TokenValidationErrorKind};
use crate::providers::{OidcSettings, ProviderConfig, ProviderRegistry, ALLOWED_SIGNING_ALGORITHMS};

/// Outcome of validating an ID token. Validation never fails with an error;
/// rejections are reported through `error`.
#[derive(Debug, Clone, PartialEq)]
pub struct IdTokenValidation {
    pub valid: bool,
    /// Verified claims, present only when `valid`.
    pub claims: Option<Map<String, Value>>,
    pub error: Option<TokenValidationErrorKind>,
    /// The token's `exp`, present only when `valid`.
    pub expires_at: Option<DateTime<Utc>>,
}

impl IdTokenValidation {
    fn accepted(claims: Map<String, Value>, expires_at: DateTime<Utc>) -> Self {
        Self {
            valid: true,
            claims: Some(claims),
            error: None,
            expires_at: Some(expires_at),
        }
    }

    fn rejected(kind: TokenValidationErrorKind) -> Self {
        Self {
            valid: false,
            claims: None,
            error: Some(kind),
            expires_at: None,
        }
    }

    /// Verified claims and expiry, or a `TokenValidation` error.
    pub fn into_result(self) -> Result<(Map<String, Value>, DateTime<Utc>), Error> {
        match (self.claims, self.expires_at, self.error) {
            (Some(claims), Some(expires_at), None) => Ok((claims, expires_at)),
            (_, _, error) => {
                let kind = error.unwrap_or(TokenValidationErrorKind::MalformedToken);
                Err(validation_error(kind.clone(), &format!("ID token rejected: {kind:?}")))
            }
        }
    }
}

/// Verifies ID tokens against a provider's published keys.
pub struct IdTokenValidator {
    registry: Arc<ProviderRegistry>,
    discovery: Arc<DiscoveryResolver>,
    jwks: Arc<JwksCache>,
    clock: Arc<dyn Clock>,
}

impl IdTokenValidator {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        discovery: Arc<DiscoveryResolver>,
        jwks: Arc<JwksCache>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            registry,
            discovery,
            jwks,
            clock,
        }
    }

    /// Validate `token` for `provider_id`. When `expected_nonce` is given the
    /// token's `nonce` claim must be present and equal to it.
    pub async fn validate(
        &self,
        provider_id: &str,
        token: &str,
        expected_nonce: Option<&str>,
    ) -> IdTokenValidation {
        match self.try_validate(provider_id, token, expected_nonce).await {
            Ok((claims, expires_at)) => IdTokenValidation::accepted(claims, expires_at),
            Err(kind) => {
                warn!("Rejected ID token for provider {}: {:?}", provider_id, kind);
                IdTokenValidation::rejected(kind)
            }
        }
    }

    async fn try_validate(
        &self,
        provider_id: &str,
        token: &str,
        expected_nonce: Option<&str>,
    ) -> Result<(Map<String, Value>, DateTime<Utc>), TokenValidationErrorKind> {
        let mut config = self
            .registry
            .resolve(provider_id)
            .map_err(|_| TokenValidationErrorKind::ProviderNotFound)?;
        if !config.is_oidc() {
            return Err(TokenValidationErrorKind::NotOidcProvider);
        }

        let header = decode_header(token).map_err(|e| {
            debug!("Undecodable ID token header: {}", e);
            TokenValidationErrorKind::MalformedToken
        })?;
        let kid = header.kid.ok_or(TokenValidationErrorKind::MissingKeyId)?;

        if config.discovery_url().is_some() {
            // Best effort: a failed lookup leaves the manually configured endpoints.
            if self.discovery.resolve(provider_id).await.is_ok() {
                config = self
                    .registry
                    .resolve(provider_id)
                    .map_err(|_| TokenValidationErrorKind::ProviderNotFound)?;
            }
        }
        let settings = config
            .oidc()
            .ok_or(TokenValidationErrorKind::NotOidcProvider)?;

        if header.alg != settings.id_token_signing_alg
            || !ALLOWED_SIGNING_ALGORITHMS.contains(&header.alg)
        {
            return Err(TokenValidationErrorKind::DisallowedAlgorithm);
        }

        let jwk = self
            .jwks
            .get_signing_key(provider_id, &kid)
            .await
            .map_err(|e| match e.error_kind {
                ErrorKind::RateLimited => TokenValidationErrorKind::RateLimited,
                ErrorKind::TokenValidation(kind) => kind,
                _ => TokenValidationErrorKind::KeysUnavailable,
            })?;
        let key = DecodingKey::from_jwk(&jwk).map_err(|e| {
            debug!("Unusable JWK {}: {}", kid, e);
            TokenValidationErrorKind::KeysUnavailable
        })?;

        verify_claims(
            token,
            &key,
            &config,
            settings,
            expected_nonce,
            self.clock.now(),
        )
    }
}

/// Verify signature and claims of `token` with an already resolved key.
///
/// `exp` is checked here rather than by `jsonwebtoken` so that `now` comes from
/// the injected clock: a token is accepted while `exp + tolerance >= now`.
pub(crate) fn verify_claims(
    token: &str,
    key: &DecodingKey,
    config: &ProviderConfig,
    settings: &OidcSettings,
    expected_nonce: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(Map<String, Value>, DateTime<Utc>), TokenValidationErrorKind> {
    let mut validation = Validation::new(settings.id_token_signing_alg);
    validation.validate_exp = false;
    validation.validate_nbf = false;
    validation.set_issuer(&[settings.issuer.as_str()]);
    validation.set_audience(&[config.client_id.as_str()]);
    validation.set_required_spec_claims(&["exp", "iss", "aud", "sub"]);

    let data = decode::<Map<String, Value>>(token, key, &validation).map_err(|e| {
        match e.kind() {
            JwtErrorKind::InvalidSignature => TokenValidationErrorKind::InvalidSignature,
            JwtErrorKind::InvalidIssuer => TokenValidationErrorKind::InvalidIssuer,
            JwtErrorKind::InvalidAudience => TokenValidationErrorKind::InvalidAudience,
            JwtErrorKind::MissingRequiredClaim(claim) => {
                TokenValidationErrorKind::MissingClaim(claim.clone())
            }
            JwtErrorKind::ExpiredSignature => TokenValidationErrorKind::Expired,
            JwtErrorKind::InvalidAlgorithm => TokenValidationErrorKind::DisallowedAlgorithm,
            _ => TokenValidationErrorKind::MalformedToken,
        }
    })?;
    let claims = data.claims;

    let exp = claims
        .get("exp")
        .and_then(|exp| exp.as_i64().or_else(|| exp.as_f64().map(|exp| exp as i64)))
        .ok_or_else(|| TokenValidationErrorKind::MissingClaim("exp".to_string()))?;
    let tolerance = i64::try_from(settings.clock_tolerance_secs).unwrap_or(i64::MAX);
    if exp.saturating_add(tolerance) < now.timestamp() {
        return Err(TokenValidationErrorKind::Expired);
    }
    let expires_at = DateTime::from_timestamp(exp, 0)
        .ok_or_else(|| TokenValidationErrorKind::MissingClaim("exp".to_string()))?;

    if let Some(expected) = expected_nonce {
        match claims.get("nonce").and_then(Value::as_str) {
            None => return Err(TokenValidationErrorKind::MissingNonce),
            Some(nonce) if nonce != expected => {
                return Err(TokenValidationErrorKind::NonceMismatch)
            }
            Some(_) => {}
        }
    }

    Ok((claims, expires_at))
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::clock::FixedClock;
    use crate::http::IdpClientBuilder;
    use crate::providers::google_config;
    use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
    use mockito::Server;
    use std::time::Duration;

    pub(crate) const SIGNING_KEY: &str = include_str!("../../tests/fixtures/signing_key.pem");
    pub(crate) const ROGUE_KEY: &str = include_str!("../../tests/fixtures/rogue_key.pem");
    pub(crate) const JWKS: &str = include_str!("../../tests/fixtures/jwks.json");
    pub(crate) const KID: &str = "test-key-1";

    pub(crate) fn sign(claims: &Value, kid: Option<&str>, pem: &str) -> String {
        let mut header = Header::new(Algorithm::RS256);
        header.kid = kid.map(str::to_string);
        encode(&header, claims, &EncodingKey::from_rsa_pem(pem.as_bytes()).unwrap()).unwrap()
    }

    pub(crate) fn claims_expiring_at(exp: i64) -> Value {
        serde_json::json!({
            "iss": "https://accounts.example.com",
            "aud": "client-123",
            "sub": "110169484474386276334",
            "email": "ada@example.com",
            "email_verified": true,
            "name": "Ada Lovelace",
            "exp": exp,
            "iat": exp - 3600,
            "nonce": "n-0S6_WzA2Mj",
        })
    }

    fn decoding_key() -> DecodingKey {
        let set: jsonwebtoken::jwk::JwkSet = serde_json::from_str(JWKS).unwrap();
        DecodingKey::from_jwk(&set.keys[0]).unwrap()
    }

    fn check(token: &str, nonce: Option<&str>, now: DateTime<Utc>) -> Result<(), TokenValidationErrorKind> {
        let config = google_config();
        let settings = config.oidc().unwrap().clone();
        verify_claims(token, &decoding_key(), &config, &settings, nonce, now).map(|_| ())
    }

    fn now() -> DateTime<Utc> {
        DateTime::from_timestamp(1_700_000_000, 0).unwrap()
    }

    #[test]
    fn test_valid_token_is_accepted() {
        let exp = now().timestamp() + 3600;
        let token = sign(&claims_expiring_at(exp), Some(KID), SIGNING_KEY);

        let config = google_config();
        let settings = config.oidc().unwrap().clone();
        let (claims, expires_at) =
            verify_claims(&token, &decoding_key(), &config, &settings, None, now()).unwrap();
        assert_eq!(claims["email"], "ada@example.com");
        assert_eq!(expires_at.timestamp(), exp);
    }

    #[test]
    fn test_exp_exactly_at_tolerance_is_accepted() {
        let exp = now().timestamp() - 60;
        let token = sign(&claims_expiring_at(exp), Some(KID), SIGNING_KEY);
        assert_eq!(check(&token, None, now()), Ok(()));
    }

    #[test]
    fn test_exp_beyond_tolerance_is_rejected() {
        let exp = now().timestamp() - 61;
        let token = sign(&claims_expiring_at(exp), Some(KID), SIGNING_KEY);
        assert_eq!(
            check(&token, None, now()),
            Err(TokenValidationErrorKind::Expired)
        );
    }

    #[test]
    fn test_wrong_audience_is_rejected() {
        let mut claims = claims_expiring_at(now().timestamp() + 3600);
        claims["aud"] = Value::String("someone-else".to_string());
        let token = sign(&claims, Some(KID), SIGNING_KEY);
        assert_eq!(
            check(&token, None, now()),
            Err(TokenValidationErrorKind::InvalidAudience)
        );
    }

    #[test]
    fn test_wrong_issuer_is_rejected() {
        let mut claims = claims_expiring_at(now().timestamp() + 3600);
        claims["iss"] = Value::String("https://evil.example.com".to_string());
        let token = sign(&claims, Some(KID), SIGNING_KEY);
        assert_eq!(
            check(&token, None, now()),
            Err(TokenValidationErrorKind::InvalidIssuer)
        );
    }

    #[test]
    fn test_foreign_signature_is_rejected() {
        let token = sign(
            &claims_expiring_at(now().timestamp() + 3600),
            Some(KID),
            ROGUE_KEY,
        );
        assert_eq!(
            check(&token, None, now()),
            Err(TokenValidationErrorKind::InvalidSignature)
        );
    }

    #[test]
    fn test_nonce_mismatch_is_rejected() {
        let token = sign(
            &claims_expiring_at(now().timestamp() + 3600),
            Some(KID),
            SIGNING_KEY,
        );
        assert_eq!(
            check(&token, Some("another-session"), now()),
            Err(TokenValidationErrorKind::NonceMismatch)
        );
        assert_eq!(check(&token, Some("n-0S6_WzA2Mj"), now()), Ok(()));
    }

    #[test]
    fn test_missing_nonce_is_rejected_when_expected() {
        let mut claims = claims_expiring_at(now().timestamp() + 3600);
        claims.as_object_mut().unwrap().remove("nonce");
        let token = sign(&claims, Some(KID), SIGNING_KEY);
        assert_eq!(
            check(&token, Some("n-0S6_WzA2Mj"), now()),
            Err(TokenValidationErrorKind::MissingNonce)
        );
    }

    #[test]
    fn test_missing_subject_is_rejected() {
        let mut claims = claims_expiring_at(now().timestamp() + 3600);
        claims.as_object_mut().unwrap().remove("sub");
        let token = sign(&claims, Some(KID), SIGNING_KEY);
        assert_eq!(
            check(&token, None, now()),
            Err(TokenValidationErrorKind::MissingClaim("sub".to_string()))
        );
    }

    #[test]
    fn test_into_result_maps_rejection_to_error() {
        let err = IdTokenValidation::rejected(TokenValidationErrorKind::Expired)
            .into_result()
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::TokenValidation(TokenValidationErrorKind::Expired)
        );
    }

    fn validator(server_url: &str, now: DateTime<Utc>) -> IdTokenValidator {
        let registry = Arc::new(ProviderRegistry::new());
        let mut config = google_config();
        config.jwks_url = Some(format!("{server_url}/certs"));
        registry.configure(config).unwrap();

        let http = IdpClientBuilder::new().with_max_retries(0).build().unwrap();
        let clock: Arc<dyn Clock> = Arc::new(FixedClock(now));
        let discovery = Arc::new(DiscoveryResolver::new(
            registry.clone(),
            http.clone(),
            clock.clone(),
            Duration::from_secs(3600),
            Duration::from_secs(5),
        ));
        let jwks = Arc::new(JwksCache::new(
            registry.clone(),
            http,
            clock.clone(),
            Duration::from_secs(600),
            5,
            10,
        ));
        IdTokenValidator::new(registry, discovery, jwks, clock)
    }

    #[tokio::test]
    async fn test_validate_fetches_key_and_accepts() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/certs")
            .with_status(200)
            .with_body(JWKS)
            .create_async()
            .await;

        let now = Utc::now();
        let token = sign(
            &claims_expiring_at(now.timestamp() + 3600),
            Some(KID),
            SIGNING_KEY,
        );
        let result = validator(&server.url(), now)
            .validate("google-oauth2", &token, Some("n-0S6_WzA2Mj"))
            .await;

        assert!(result.valid, "{:?}", result.error);
        assert_eq!(result.claims.unwrap()["sub"], "110169484474386276334");
    }

    #[tokio::test]
    async fn test_validate_rejects_unknown_kid() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/certs")
            .with_status(200)
            .with_body(JWKS)
            .create_async()
            .await;

        let now = Utc::now();
        let token = sign(
            &claims_expiring_at(now.timestamp() + 3600),
            Some("not-published"),
            SIGNING_KEY,
        );
        let result = validator(&server.url(), now)
            .validate("google-oauth2", &token, None)
            .await;

        assert!(!result.valid);
        assert_eq!(result.error, Some(TokenValidationErrorKind::KeyNotFound));
    }

    #[tokio::test]
    async fn test_validate_rejects_missing_kid_without_fetching() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/certs")
            .expect(0)
            .create_async()
            .await;

        let now = Utc::now();
        let token = sign(&claims_expiring_at(now.timestamp() + 3600), None, SIGNING_KEY);
        let result = validator(&server.url(), now)
            .validate("google-oauth2", &token, None)
            .await;

        assert_eq!(result.error, Some(TokenValidationErrorKind::MissingKeyId));
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_validate_unknown_provider() {
        let server = Server::new_async().await;
        let result = validator(&server.url(), Utc::now())
            .validate("missing", "a.b.c", None)
            .await;
        assert_eq!(result.error, Some(TokenValidationErrorKind::ProviderNotFound));
    }
}
