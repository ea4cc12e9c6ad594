//! Runtime settings for the authentication core.

use std::time::Duration;

/// Tunables for timeouts, cache lifetimes and rate limits.
///
/// The defaults are suitable for production use; the binary maps its command
/// line configuration onto this struct.
#[derive(Debug, Clone)]
pub struct Settings {
    /// Per-request timeout applied to every outbound HTTP call.
    pub http_timeout: Duration,
    /// Retries for idempotent calls (userinfo, revocation). Token calls never retry.
    pub http_max_retries: u32,
    /// First backoff delay of the retry policy.
    pub retry_base_delay: Duration,
    /// How long a pending authorization (state, nonce, verifier) stays valid.
    pub authorization_ttl: Duration,
    /// How long a discovery document is served before it is considered stale.
    pub discovery_ttl: Duration,
    /// Upper bound for a single discovery fetch.
    pub discovery_timeout: Duration,
    /// How long a signing key is served from cache.
    pub jwks_ttl: Duration,
    /// Maximum cached signing keys per provider.
    pub jwks_max_keys: usize,
    /// JWKS endpoint fetch ceiling per provider per minute.
    pub jwks_fetches_per_minute: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            http_timeout: Duration::from_secs(30),
            http_max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            authorization_ttl: Duration::from_secs(10 * 60),
            discovery_ttl: Duration::from_secs(60 * 60),
            discovery_timeout: Duration::from_secs(10),
            jwks_ttl: Duration::from_secs(10 * 60),
            jwks_max_keys: 5,
            jwks_fetches_per_minute: 10,
        }
    }
}

/// Convert a std duration into a chrono duration, capped at a century.
pub(crate) fn chrono_duration(duration: Duration) -> chrono::Duration {
    let cap = chrono::Duration::days(36_500);
    chrono::Duration::from_std(duration)
        .map(|d| d.min(cap))
        .unwrap_or(cap)
}
