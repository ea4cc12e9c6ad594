//! Event system for the identity core.
//!
//! Authentication flows return their results directly; this crate exists for
//! collaborators that additionally want to observe them (audit logs, metrics,
//! session bookkeeping) without the flows knowing who is listening.
//!
//! # Architecture
//!
//! - **AuthEvent**: Enum of everything observable the auth core does
//! - **EventHandler**: Trait for implementing event handlers
//! - **EventPublisher**: Publishes events to registered handlers
//!
//! This crate has no dependencies on internal crates, so identities are carried
//! as serialized JSON values.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;

/// Events emitted by the authentication core after an operation completes.
///
/// Events never carry secrets: no client secrets, access, refresh or ID tokens.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum AuthEvent {
    /// A provider was created or replaced.
    ProviderConfigured {
        provider_id: String,
        organization_id: String,
    },
    /// A provider was removed along with its cached discovery data and keys.
    ProviderDeleted { provider_id: String },
    /// A code exchange completed.
    LoginSucceeded {
        provider_id: String,
        /// Serialized canonical identity of the user.
        user: Value,
    },
    /// A code exchange failed. `reason` is the rendered error.
    LoginFailed { provider_id: String, reason: String },
    TokenRefreshed { provider_id: String },
    /// A revocation call completed. `revoked` is false when the provider has
    /// no revocation endpoint.
    TokenRevoked { provider_id: String, revoked: bool },
}

impl AuthEvent {
    /// Provider the event concerns.
    pub fn provider_id(&self) -> &str {
        match self {
            AuthEvent::ProviderConfigured { provider_id, .. }
            | AuthEvent::ProviderDeleted { provider_id }
            | AuthEvent::LoginSucceeded { provider_id, .. }
            | AuthEvent::LoginFailed { provider_id, .. }
            | AuthEvent::TokenRefreshed { provider_id }
            | AuthEvent::TokenRevoked { provider_id, .. } => provider_id,
        }
    }
}

/// Trait for handling auth events.
/// Implementations can perform side effects like auditing, updating caches,
/// logging, etc.
#[async_trait]
pub trait EventHandler: Send + Sync {
    async fn handle(&self, event: &AuthEvent);
}

/// Publishes auth events to registered handlers.
/// Handlers are called sequentially in registration order.
#[derive(Clone)]
pub struct EventPublisher {
    handlers: Arc<Vec<Arc<dyn EventHandler>>>,
}

impl EventPublisher {
    pub fn new() -> Self {
        Self {
            handlers: Arc::new(Vec::new()),
        }
    }

    /// Register a new event handler.
    /// Note: This creates a new publisher instance with the additional handler.
    pub fn with_handler(mut self, handler: Arc<dyn EventHandler>) -> Self {
        let mut handlers = (*self.handlers).clone();
        handlers.push(handler);
        self.handlers = Arc::new(handlers);
        self
    }

    /// Publish an event to all registered handlers, in registration order.
    pub async fn publish(&self, event: AuthEvent) {
        for handler in self.handlers.iter() {
            handler.handle(&event).await;
        }
    }

    pub fn handler_count(&self) -> usize {
        self.handlers.len()
    }
}

impl Default for EventPublisher {
    fn default() -> Self {
        Self::new()
    }
}
