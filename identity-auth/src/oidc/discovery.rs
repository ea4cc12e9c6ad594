//! OIDC provider discovery via the `.well-known/openid-configuration` document.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Deserialize;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::error::{
    configuration_error, network_error, protocol_error, ConfigurationErrorKind, Error,
    ErrorKind, ProtocolErrorKind,
};
use crate::http::IdpHttpClient;
use crate::providers::ProviderRegistry;
use crate::settings::chrono_duration;

/// Fields of the discovery document this crate consumes.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct DiscoveryMetadata {
    #[serde(default)]
    pub issuer: Option<String>,
    #[serde(default)]
    pub authorization_endpoint: Option<String>,
    #[serde(default)]
    pub token_endpoint: Option<String>,
    #[serde(default)]
    pub userinfo_endpoint: Option<String>,
    #[serde(default)]
    pub jwks_uri: Option<String>,
    #[serde(default)]
    pub end_session_endpoint: Option<String>,
    #[serde(default)]
    pub revocation_endpoint: Option<String>,
    #[serde(default)]
    pub id_token_signing_alg_values_supported: Vec<String>,
}

/// A fetched discovery document.
#[derive(Debug, Clone)]
pub struct DiscoveryDocument {
    pub provider_id: String,
    pub fetched_at: DateTime<Utc>,
    pub stale_at: DateTime<Utc>,
    /// The document exactly as served.
    pub raw: serde_json::Value,
    pub metadata: DiscoveryMetadata,
}

impl DiscoveryDocument {
    pub fn is_stale(&self, now: DateTime<Utc>) -> bool {
        now >= self.stale_at
    }
}

/// Failure of the most recent fetch, kept so callers that queued behind it can
/// be answered without fetching again.
#[derive(Debug, Clone)]
struct FailedFetch {
    kind: ErrorKind,
    reason: String,
}

impl FailedFetch {
    fn from_error(error: &Error) -> Self {
        Self {
            kind: error.error_kind.clone(),
            reason: error
                .source
                .as_ref()
                .map(|source| source.to_string())
                .unwrap_or_default(),
        }
    }

    fn to_error(&self) -> Error {
        Error {
            source: Some(self.reason.clone().into()),
            error_kind: self.kind.clone(),
        }
    }
}

/// Per-provider fetch coordination.
struct FetchSlot {
    /// Incremented, under `last_failure`'s lock, each time a fetch finishes.
    completed: AtomicU64,
    last_failure: Mutex<Option<FailedFetch>>,
}

impl FetchSlot {
    fn new() -> Self {
        Self {
            completed: AtomicU64::new(0),
            last_failure: Mutex::new(None),
        }
    }
}

/// Fetches and caches discovery documents, one per provider.
///
/// Concurrent callers for the same provider share a single outbound fetch: the
/// first caller takes the provider's fetch lock, the others wait on it and then
/// take the outcome of that fetch, failures included.
pub struct DiscoveryResolver {
    registry: Arc<ProviderRegistry>,
    http: IdpHttpClient,
    clock: Arc<dyn Clock>,
    documents: DashMap<String, DiscoveryDocument>,
    fetch_slots: DashMap<String, Arc<FetchSlot>>,
    ttl: chrono::Duration,
    timeout: Duration,
}

impl DiscoveryResolver {
    pub fn new(
        registry: Arc<ProviderRegistry>,
        http: IdpHttpClient,
        clock: Arc<dyn Clock>,
        ttl: Duration,
        timeout: Duration,
    ) -> Self {
        Self {
            registry,
            http,
            clock,
            documents: DashMap::new(),
            fetch_slots: DashMap::new(),
            ttl: chrono_duration(ttl),
            timeout,
        }
    }

    /// Return the provider's discovery document, fetching it if missing or stale.
    ///
    /// When a fetch fails and an older document exists, the older document is
    /// returned and the failure is logged.
    pub async fn resolve(&self, provider_id: &str) -> Result<DiscoveryDocument, Error> {
        if let Some(document) = self.fresh(provider_id) {
            return Ok(document);
        }
        self.fetch_coalesced(provider_id, false).await
    }

    /// Fetch the document even if the cached one is still fresh.
    pub async fn refresh(&self, provider_id: &str) -> Result<DiscoveryDocument, Error> {
        self.fetch_coalesced(provider_id, true).await
    }

    /// Cached document, fresh or stale, without any network access.
    pub fn cached(&self, provider_id: &str) -> Option<DiscoveryDocument> {
        self.documents.get(provider_id).map(|entry| entry.clone())
    }

    /// Forget the provider's document. A fetch still in flight for it will not
    /// be cached.
    pub fn evict(&self, provider_id: &str) {
        self.documents.remove(provider_id);
        self.fetch_slots.remove(provider_id);
    }

    pub fn clear(&self) {
        self.documents.clear();
        self.fetch_slots.clear();
    }

    fn fresh(&self, provider_id: &str) -> Option<DiscoveryDocument> {
        let now = self.clock.now();
        self.documents
            .get(provider_id)
            .filter(|document| !document.is_stale(now))
            .map(|document| document.clone())
    }

    async fn fetch_coalesced(
        &self,
        provider_id: &str,
        force: bool,
    ) -> Result<DiscoveryDocument, Error> {
        let config = self.registry.resolve(provider_id)?;
        let url = config.discovery_url().ok_or_else(|| {
            configuration_error(
                ConfigurationErrorKind::DiscoveryNotConfigured,
                &format!("provider {provider_id} does not use discovery"),
            )
        })?;
        let expected_issuer = config.oidc().map(|settings| settings.issuer.clone());

        let slot = self
            .fetch_slots
            .entry(provider_id.to_string())
            .or_insert_with(|| Arc::new(FetchSlot::new()))
            .clone();
        let seen = slot.completed.load(Ordering::Acquire);
        let mut last_failure = slot.last_failure.lock().await;

        if slot.completed.load(Ordering::Acquire) != seen {
            debug!("Discovery for {} answered by a fetch already in flight", provider_id);
            if let Some(failure) = last_failure.as_ref() {
                return self.cached(provider_id).ok_or_else(|| failure.to_error());
            }
            if let Some(document) = self.cached(provider_id) {
                return Ok(document);
            }
        }
        if !force {
            if let Some(document) = self.fresh(provider_id) {
                return Ok(document);
            }
        }

        let attempt = self.fetch(provider_id, &url, expected_issuer.as_deref());
        let outcome = match tokio::time::timeout(self.timeout, attempt).await {
            Ok(outcome) => outcome,
            Err(_) => Err(network_error("discovery fetch timed out")),
        };

        let result = match outcome {
            Ok(document) => {
                *last_failure = None;
                if self.is_current(provider_id, &slot) {
                    info!("Loaded discovery document for provider {}", provider_id);
                    self.registry.apply_discovery(provider_id, &document);
                    self.documents
                        .insert(provider_id.to_string(), document.clone());
                } else {
                    debug!(
                        "Provider {} changed during discovery, discarding document",
                        provider_id
                    );
                }
                Ok(document)
            }
            Err(e) => {
                *last_failure = Some(FailedFetch::from_error(&e));
                match self.cached(provider_id) {
                    Some(stale) => {
                        warn!(
                            "Discovery fetch for {} failed, serving document from {}: {}",
                            provider_id, stale.fetched_at, e
                        );
                        Ok(stale)
                    }
                    None => {
                        warn!("Discovery fetch for {} failed: {}", provider_id, e);
                        Err(e)
                    }
                }
            }
        };
        slot.completed.fetch_add(1, Ordering::Release);
        result
    }

    /// True while the provider is still configured and has not been evicted
    /// since `slot` was taken.
    fn is_current(&self, provider_id: &str, slot: &Arc<FetchSlot>) -> bool {
        let slot_current = self
            .fetch_slots
            .get(provider_id)
            .is_some_and(|current| Arc::ptr_eq(current.value(), slot));
        slot_current && self.registry.resolve(provider_id).is_ok()
    }

    async fn fetch(
        &self,
        provider_id: &str,
        url: &str,
        expected_issuer: Option<&str>,
    ) -> Result<DiscoveryDocument, Error> {
        debug!("Fetching discovery document from {}", url);

        let response = self.http.single_shot.get(url).send().await?;

        let status = response.status();
        if !status.is_success() {
            return Err(protocol_error(
                ProtocolErrorKind::UnexpectedStatus(status.as_u16()),
                "discovery endpoint returned an error status",
            ));
        }

        let raw: serde_json::Value = response.json().await?;
        let metadata: DiscoveryMetadata = serde_json::from_value(raw.clone())?;

        if let (Some(expected), Some(actual)) = (expected_issuer, metadata.issuer.as_deref()) {
            if expected.trim_end_matches('/') != actual.trim_end_matches('/') {
                return Err(protocol_error(
                    ProtocolErrorKind::IssuerMismatch,
                    &format!("discovery issuer {actual} does not match configured {expected}"),
                ));
            }
        }

        let fetched_at = self.clock.now();
        Ok(DiscoveryDocument {
            provider_id: provider_id.to_string(),
            fetched_at,
            stale_at: fetched_at + self.ttl,
            raw,
            metadata,
        })
    }
}
