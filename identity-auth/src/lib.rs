//! # identity-auth
//!
//! OAuth 2.0 and OpenID Connect login core:
//! - Provider registry with validation and secret redaction
//! - Authorization URLs with state, nonce and PKCE (S256), bound server-side
//! - Code exchange, refresh and revocation against provider endpoints
//! - OIDC discovery and JWKS caching with per-provider fetch coalescing
//! - ID token verification and normalization of user claims
//!
//! ## Usage
//!
//! ```rust,ignore
//! use identity_auth::{AuthService, AuthorizationParams};
//!
//! let service = AuthService::builder().build()?;
//! service.configure_provider(config).await?;
//! let request = service
//!     .generate_authorization_url("google-oauth2", AuthorizationParams::default())
//!     .await?;
//! // redirect to request.url, then on callback:
//! let result = service
//!     .exchange_code_for_tokens("google-oauth2", &code, &state, None)
//!     .await?;
//! ```

pub mod clock;
pub mod error;
pub mod http;
pub mod oauth;
pub mod oidc;
pub mod providers;
mod service;
mod settings;

// Re-export commonly used types
pub use clock::{Clock, FixedClock, SystemClock};
pub use error::{Error, ErrorKind};
pub use oauth::token::{AuthResult, RevocationOutcome, TokenSet, TokenSummary, TokenTypeHint};
pub use oauth::{AuthorizationParams, AuthorizationRequest, ValidatedIdentity};
pub use oidc::IdTokenValidation;
pub use providers::{ProviderConfig, ProviderPatch};
pub use service::{AuthOutcome, AuthService, AuthServiceBuilder, CheckOutcome, ConnectionReport};
pub use settings::Settings;
