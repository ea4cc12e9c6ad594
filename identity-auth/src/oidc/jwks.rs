//! Per-provider cache of JWKS signing keys.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use jsonwebtoken::jwk::{Jwk, JwkSet};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::rate_limit::TokenBucket;
use crate::clock::Clock;
use crate::error::{
    protocol_error, rate_limited_error, validation_error, Error, ProtocolErrorKind,
    TokenValidationErrorKind,
};
use crate::http::IdpHttpClient;
use crate::providers::ProviderRegistry;
use crate::settings::chrono_duration;

#[derive(Debug, Clone)]
struct CachedKey {
    kid: String,
    jwk: Jwk,
    fetched_at: DateTime<Utc>,
}

/// Keys and fetch budget for one provider.
struct ProviderKeys {
    /// Oldest first.
    keys: VecDeque<CachedKey>,
    limiter: TokenBucket,
    /// Why the most recent fetch failed, if it did.
    last_failure: Option<String>,
}

struct KeySlot {
    /// Incremented, under `state`'s lock, each time a fetch finishes.
    fetches: AtomicU64,
    state: Mutex<ProviderKeys>,
}

/// Caches signing keys by `kid`, one key set per provider.
///
/// A lookup for an unknown or expired `kid` fetches the provider's full key set
/// once; every key in it is cached individually. Fetches are serialized per
/// provider and callers that queued behind a fetch take its outcome, so racing
/// misses share one request. Each provider's fetches are capped by a token
/// bucket.
pub struct JwksCache {
    registry: Arc<ProviderRegistry>,
    http: IdpHttpClient,
    clock: Arc<dyn Clock>,
    providers: DashMap<String, Arc<KeySlot>>,
    ttl: chrono::Duration,
    max_keys: usize,
    fetches_per_minute: u32,
}

impl JwksCache {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        http: IdpHttpClient,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        max_keys: usize,
        fetches_per_minute: u32,
    ) -> Self {
        Self {
            registry,
            http,
            clock,
            providers: DashMap::new(),
            ttl: chrono_duration(ttl),
            max_keys: max_keys.max(1),
            fetches_per_minute,
        }
    }

    /// Signing key for `kid`.
    ///
    /// Fails with `RateLimited` when a fetch is needed but the provider's budget
    /// is spent, and with `TokenValidation(KeyNotFound)` when the freshly fetched
    /// set does not contain `kid`. A caller that waited on another caller's
    /// failed fetch gets `TokenValidation(KeysUnavailable)`.
    pub async fn get_signing_key(&self, provider_id: &str, kid: &str) -> Result<Jwk, Error> {
        let jwks_url = self.jwks_url(provider_id)?;
        let slot = self.slot(provider_id);
        let seen = slot.fetches.load(Ordering::Acquire);
        let mut keys = slot.state.lock().await;

        let now = self.clock.now();
        if let Some(cached) = self.fresh_key(&keys, kid, now) {
            return Ok(cached);
        }

        if slot.fetches.load(Ordering::Acquire) != seen {
            debug!("JWKS for {} answered by a fetch already in flight", provider_id);
            return Err(match &keys.last_failure {
                Some(reason) => validation_error(
                    TokenValidationErrorKind::KeysUnavailable,
                    &format!("JWKS fetch for provider {provider_id} failed: {reason}"),
                ),
                None => key_not_found(provider_id, kid),
            });
        }

        if !keys.limiter.try_acquire(now) {
            warn!("JWKS fetch for {} refused by rate limiter", provider_id);
            return Err(rate_limited_error(&format!(
                "JWKS fetch budget for provider {provider_id} exhausted"
            )));
        }

        let fetched = self.fetch(&jwks_url).await;
        self.finish(&slot, &mut keys, fetched, kid)?;

        self.fresh_key(&keys, kid, self.clock.now())
            .ok_or_else(|| key_not_found(provider_id, kid))
    }

    /// Fetch the provider's key set now, returning how many keys it published.
    /// Counts against the same fetch budget as lookups.
    pub async fn refresh(&self, provider_id: &str) -> Result<usize, Error> {
        let jwks_url = self.jwks_url(provider_id)?;
        let slot = self.slot(provider_id);
        let mut keys = slot.state.lock().await;

        if !keys.limiter.try_acquire(self.clock.now()) {
            return Err(rate_limited_error(&format!(
                "JWKS fetch budget for provider {provider_id} exhausted"
            )));
        }

        let fetched = self.fetch(&jwks_url).await;
        self.finish(&slot, &mut keys, fetched, "")
    }

    /// Number of keys currently cached for a provider, fresh or not.
    pub async fn key_count(&self, provider_id: &str) -> usize {
        let Some(slot) = self.providers.get(provider_id).map(|slot| slot.clone()) else {
            return 0;
        };
        let keys = slot.state.lock().await;
        keys.keys.len()
    }

    pub fn evict(&self, provider_id: &str) {
        self.providers.remove(provider_id);
    }

    pub fn clear(&self) {
        self.providers.clear();
    }

    fn jwks_url(&self, provider_id: &str) -> Result<String, Error> {
        let config = self.registry.resolve(provider_id)?;
        config.jwks_url.ok_or_else(|| {
            validation_error(
                TokenValidationErrorKind::KeysUnavailable,
                &format!("provider {provider_id} has no JWKS endpoint"),
            )
        })
    }

    fn slot(&self, provider_id: &str) -> Arc<KeySlot> {
        let now = self.clock.now();
        self.providers
            .entry(provider_id.to_string())
            .or_insert_with(|| {
                Arc::new(KeySlot {
                    fetches: AtomicU64::new(0),
                    state: Mutex::new(ProviderKeys {
                        keys: VecDeque::new(),
                        limiter: TokenBucket::per_minute(self.fetches_per_minute, now),
                        last_failure: None,
                    }),
                })
            })
            .clone()
    }

    /// Record the outcome of a fetch made under `keys`' lock, returning how many
    /// keys the provider published.
    fn finish(
        &self,
        slot: &KeySlot,
        keys: &mut ProviderKeys,
        fetched: Result<JwkSet, Error>,
        wanted: &str,
    ) -> Result<usize, Error> {
        let result = match fetched {
            Ok(set) => {
                keys.last_failure = None;
                let published = set.keys.len();
                self.store(keys, set, wanted);
                Ok(published)
            }
            Err(e) => {
                keys.last_failure = Some(e.to_string());
                Err(e)
            }
        };
        slot.fetches.fetch_add(1, Ordering::Release);
        result
    }

    fn fresh_key(&self, keys: &ProviderKeys, kid: &str, now: DateTime<Utc>) -> Option<Jwk> {
        keys.keys
            .iter()
            .find(|cached| cached.kid == kid && cached.fetched_at + self.ttl > now)
            .map(|cached| cached.jwk.clone())
    }

    /// Cache every keyed entry of `set`, then trim to `max_keys`, oldest first,
    /// never evicting `wanted`.
    fn store(&self, keys: &mut ProviderKeys, set: JwkSet, wanted: &str) {
        let fetched_at = self.clock.now();
        for jwk in set.keys {
            let Some(kid) = jwk.common.key_id.clone() else {
                debug!("Skipping JWKS entry without kid");
                continue;
            };
            keys.keys.retain(|cached| cached.kid != kid);
            keys.keys.push_back(CachedKey {
                kid,
                jwk,
                fetched_at,
            });
        }

        while keys.keys.len() > self.max_keys {
            let Some(position) = keys.keys.iter().position(|cached| cached.kid != wanted) else {
                break;
            };
            keys.keys.remove(position);
        }
    }

    async fn fetch(&self, url: &str) -> Result<JwkSet, Error> {
        debug!("Fetching JWKS from {}", url);
        let response = self.http.single_shot.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(protocol_error(
                ProtocolErrorKind::UnexpectedStatus(status.as_u16()),
                "JWKS endpoint returned an error status",
            ));
        }

        let body = response.text().await?;
        let set: JwkSet = serde_json::from_str(&body)?;
        info!("Fetched {} signing keys from {}", set.keys.len(), url);
        Ok(set)
    }
}

fn key_not_found(provider_id: &str, kid: &str) -> Error {
    validation_error(
        TokenValidationErrorKind::KeyNotFound,
        &format!("no key with kid {kid} published by provider {provider_id}"),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, SystemClock};
    use crate::error::ErrorKind;
    use crate::http::IdpClientBuilder;
    use crate::providers::google_config;
    use mockito::Server;

    const JWKS: &str = include_str!("../../tests/fixtures/jwks.json");

    fn rsa_key(kid: &str) -> serde_json::Value {
        let mut key: serde_json::Value = serde_json::from_str::<serde_json::Value>(JWKS).unwrap()
            ["keys"][0]
            .clone();
        key["kid"] = serde_json::Value::String(kid.to_string());
        key
    }

    fn cache_for(server_url: &str, max_keys: usize, per_minute: u32) -> JwksCache {
        cache_with_clock(server_url, max_keys, per_minute, Arc::new(SystemClock))
    }

    fn cache_with_clock(
        server_url: &str,
        max_keys: usize,
        per_minute: u32,
        clock: Arc<dyn Clock>,
    ) -> JwksCache {
        let registry = Arc::new(ProviderRegistry::new());
        let mut config = google_config();
        config.jwks_url = Some(format!("{server_url}/certs"));
        registry.configure(config).unwrap();

        let http = IdpClientBuilder::new().with_max_retries(0).build().unwrap();
        JwksCache::new(
            registry,
            http,
            clock,
            Duration::from_secs(600),
            max_keys,
            per_minute,
        )
    }

    #[tokio::test]
    async fn test_keys_are_cached_after_one_fetch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/certs")
            .with_status(200)
            .with_body(JWKS)
            .expect(1)
            .create_async()
            .await;

        let cache = cache_for(&server.url(), 5, 10);
        cache.get_signing_key("google-oauth2", "test-key-1").await.unwrap();
        cache.get_signing_key("google-oauth2", "test-key-1").await.unwrap();
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_unknown_kid_is_key_not_found() {
        let mut server = Server::new_async().await;
        let _mock = server
            .mock("GET", "/certs")
            .with_status(200)
            .with_body(JWKS)
            .create_async()
            .await;

        let cache = cache_for(&server.url(), 5, 10);
        let err = cache
            .get_signing_key("google-oauth2", "rotated-away")
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::TokenValidation(TokenValidationErrorKind::KeyNotFound)
        );
    }

    #[tokio::test]
    async fn test_misses_beyond_budget_are_rate_limited() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/certs")
            .with_status(200)
            .with_body(JWKS)
            .expect(2)
            .create_async()
            .await;

        let cache = cache_for(&server.url(), 5, 2);
        for _ in 0..2 {
            assert!(cache.get_signing_key("google-oauth2", "missing").await.is_err());
        }
        let err = cache
            .get_signing_key("google-oauth2", "missing")
            .await
            .unwrap_err();
        assert_eq!(err.error_kind, ErrorKind::RateLimited);
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_cache_is_bounded_and_keeps_requested_key() {
        let mut server = Server::new_async().await;
        let keys: Vec<_> = ["k1", "k2", "k3", "k4"].iter().map(|kid| rsa_key(kid)).collect();
        let _mock = server
            .mock("GET", "/certs")
            .with_status(200)
            .with_body(serde_json::json!({ "keys": keys }).to_string())
            .create_async()
            .await;

        let cache = cache_for(&server.url(), 2, 10);
        cache.get_signing_key("google-oauth2", "k1").await.unwrap();
        assert_eq!(cache.key_count("google-oauth2").await, 2);
        // k1 survived eviction, so this is served from the cache.
        cache.get_signing_key("google-oauth2", "k1").await.unwrap();
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_fetch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/certs")
            .with_status(200)
            .with_body(JWKS)
            .expect(1)
            .create_async()
            .await;

        let cache = cache_for(&server.url(), 5, 10);
        let (a, b) = tokio::join!(
            cache.get_signing_key("google-oauth2", "test-key-1"),
            cache.get_signing_key("google-oauth2", "test-key-1")
        );
        assert!(a.is_ok());
        assert!(b.is_ok());
        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_provider_without_jwks_url() {
        let registry = Arc::new(ProviderRegistry::new());
        let mut config = google_config();
        config.jwks_url = None;
        registry.configure(config).unwrap();
        let http = IdpClientBuilder::new().with_max_retries(0).build().unwrap();
        let cache = JwksCache::new(
            registry,
            http,
            Arc::new(SystemClock),
            Duration::from_secs(600),
            5,
            10,
        );

        let err = cache
            .get_signing_key("google-oauth2", "test-key-1")
            .await
            .unwrap_err();
        assert_eq!(
            err.error_kind,
            ErrorKind::TokenValidation(TokenValidationErrorKind::KeysUnavailable)
        );
    }

    #[tokio::test]
    async fn test_expired_key_is_fetched_again() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/certs")
            .with_status(200)
            .with_body(JWKS)
            .expect(2)
            .create_async()
            .await;

        let clock = Arc::new(ManualClock::starting_at(Utc::now()));
        let cache = cache_with_clock(&server.url(), 5, 10, clock.clone());

        cache.get_signing_key("google-oauth2", "test-key-1").await.unwrap();
        clock.advance(chrono::Duration::seconds(599));
        cache.get_signing_key("google-oauth2", "test-key-1").await.unwrap();
        clock.advance(chrono::Duration::seconds(2));
        cache.get_signing_key("google-oauth2", "test-key-1").await.unwrap();

        mock.assert_async().await;
    }

    #[tokio::test]
    async fn test_concurrent_misses_share_one_failed_fetch() {
        let mut server = Server::new_async().await;
        let mock = server
            .mock("GET", "/certs")
            .with_status(503)
            .expect(1)
            .create_async()
            .await;

        let cache = cache_for(&server.url(), 5, 10);
        let (a, b, c) = tokio::join!(
            cache.get_signing_key("google-oauth2", "test-key-1"),
            cache.get_signing_key("google-oauth2", "test-key-1"),
            cache.get_signing_key("google-oauth2", "test-key-1")
        );

        assert_eq!(
            a.unwrap_err().error_kind,
            ErrorKind::Protocol(ProtocolErrorKind::UnexpectedStatus(503))
        );
        for waiter in [b, c] {
            assert_eq!(
                waiter.unwrap_err().error_kind,
                ErrorKind::TokenValidation(TokenValidationErrorKind::KeysUnavailable)
            );
        }
        mock.assert_async().await;
    }
}
