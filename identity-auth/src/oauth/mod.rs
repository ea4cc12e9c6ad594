//! OAuth 2.0 authorization code flow with PKCE.

mod authorize;
mod pkce;
mod state;
mod userinfo;

pub mod token;

pub use authorize::{AuthorizationBuilder, AuthorizationParams, AuthorizationRequest};
pub use pkce::{PkceChallenge, PkceVerifier, CHALLENGE_METHOD};
pub use state::{random_token, AuthorizationStore, PendingAuthorization};
pub use userinfo::{normalize, ValidatedIdentity};
