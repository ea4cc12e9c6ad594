//! Server-side store of pending authorizations, keyed by CSRF state.

use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::Rng;
use secrecy::SecretString;
use tracing::debug;

use crate::clock::{Clock, SystemClock};
use crate::error::{state_error, Error, StateErrorKind};

/// Data bound to a state value while the user is at the provider.
#[derive(Debug, Clone)]
pub struct PendingAuthorization {
    /// Provider the authorization was started for.
    pub provider_id: String,
    /// Nonce sent in the request (OIDC only).
    pub nonce: Option<String>,
    /// PKCE verifier to send with the code exchange.
    pub code_verifier: SecretString,
    pub created_at: DateTime<Utc>,
    pub expires_at: DateTime<Utc>,
}

/// Minimum spacing of the sweeps `insert` runs over the store.
const PURGE_INTERVAL_SECS: i64 = 60;

/// Store for pending authorizations with expiration.
///
/// Each state is single use: [`consume`](Self::consume) removes the entry
/// atomically, so a replayed callback finds nothing.
pub struct AuthorizationStore {
    pending: DashMap<String, PendingAuthorization>,
    ttl: Duration,
    clock: Arc<dyn Clock>,
    /// Unix seconds of the last sweep triggered by `insert`.
    last_purge: AtomicI64,
}

impl AuthorizationStore {
    /// Create a new store with the default TTL of 10 minutes.
    pub fn new() -> Self {
        Self::with_ttl(Duration::minutes(10), Arc::new(SystemClock))
    }

    /// Create a new store with a custom TTL and clock.
    pub fn with_ttl(ttl: Duration, clock: Arc<dyn Clock>) -> Self {
        let last_purge = AtomicI64::new(clock.now().timestamp());
        Self {
            pending: DashMap::new(),
            ttl,
            clock,
            last_purge,
        }
    }

    /// Record a pending authorization under `state`.
    ///
    /// Fails if `state` is empty or already pending. Expired entries are swept
    /// at most once per minute from here; `consume` rejects expired entries
    /// regardless.
    pub fn insert(
        &self,
        state: &str,
        provider_id: &str,
        nonce: Option<String>,
        code_verifier: SecretString,
    ) -> Result<PendingAuthorization, Error> {
        if state.trim().is_empty() {
            return Err(state_error(StateErrorKind::Malformed, "state must not be empty"));
        }
        self.purge_if_due();

        let created_at = self.clock.now();
        let pending = PendingAuthorization {
            provider_id: provider_id.to_string(),
            nonce,
            code_verifier,
            created_at,
            expires_at: created_at + self.ttl,
        };

        match self.pending.entry(state.to_string()) {
            Entry::Occupied(_) => Err(state_error(
                StateErrorKind::Duplicate,
                "state is already pending",
            )),
            Entry::Vacant(vacant) => {
                vacant.insert(pending.clone());
                Ok(pending)
            }
        }
    }

    /// Validate and consume a state value.
    ///
    /// The entry is removed whether or not it is still valid.
    pub fn consume(&self, state: &str) -> Result<PendingAuthorization, Error> {
        let (_, pending) = self
            .pending
            .remove(state)
            .ok_or_else(|| state_error(StateErrorKind::Unknown, "state was not issued or was already used"))?;

        if self.clock.now() > pending.expires_at {
            debug!("Rejecting expired authorization state for {}", pending.provider_id);
            return Err(state_error(StateErrorKind::Expired, "authorization request expired"));
        }
        Ok(pending)
    }

    /// Drop expired entries, returning how many were removed.
    pub fn purge_expired(&self) -> usize {
        let now = self.clock.now();
        let before = self.pending.len();
        self.pending.retain(|_, pending| pending.expires_at >= now);
        before.saturating_sub(self.pending.len())
    }

    fn purge_if_due(&self) {
        let now = self.clock.now().timestamp();
        let last = self.last_purge.load(Ordering::Relaxed);
        if now - last < PURGE_INTERVAL_SECS {
            return;
        }
        // One inserter wins the sweep; the others carry on.
        if self
            .last_purge
            .compare_exchange(last, now, Ordering::Relaxed, Ordering::Relaxed)
            .is_ok()
        {
            let removed = self.purge_expired();
            if removed > 0 {
                debug!("Purged {} expired pending authorizations", removed);
            }
        }
    }

    /// Drop every pending authorization for a provider.
    pub fn forget_provider(&self, provider_id: &str) {
        self.pending.retain(|_, pending| pending.provider_id != provider_id);
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    pub(crate) fn clear(&self) {
        self.pending.clear();
    }
}

impl Default for AuthorizationStore {
    fn default() -> Self {
        Self::new()
    }
}

/// Generate a cryptographically random 256-bit token, hex encoded.
pub fn random_token() -> String {
    let random_bytes: [u8; 32] = rand::thread_rng().gen();
    hex::encode(random_bytes)
}
