//! OpenID Connect support: discovery, signing keys and ID token validation.

mod discovery;
mod jwks;
mod rate_limit;
mod validator;

pub use discovery::{DiscoveryDocument, DiscoveryMetadata, DiscoveryResolver};
pub use jwks::JwksCache;
pub use rate_limit::TokenBucket;
pub use validator::{IdTokenValidation, IdTokenValidator};

#[cfg(test)]
pub(crate) use validator::tests as token_fixtures;
