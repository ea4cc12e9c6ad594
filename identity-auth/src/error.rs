//! Error types for the `identity-auth` crate.
//!
//! Follows the same pattern as the rest of the workspace: a root `Error` struct
//! holding an error kind tree plus an optional source for error chaining.

use std::error::Error as StdError;
use std::fmt;

/// Top-level error type for identity-auth.
/// Holds error kind and optional source for error chaining.
#[derive(Debug)]
pub struct Error {
    pub source: Option<Box<dyn StdError + Send + Sync>>,
    pub error_kind: ErrorKind,
}

/// Major categories of errors in identity-auth.
#[derive(Debug, Clone, PartialEq)]
pub enum ErrorKind {
    /// Missing or invalid provider configuration. Raised before any network call.
    Configuration(ConfigurationErrorKind),
    /// Unknown provider id.
    NotFound,
    /// Timeout or connection failure talking to the identity provider.
    Network,
    /// Malformed or unexpected response from the identity provider.
    Protocol(ProtocolErrorKind),
    /// Signature, issuer, audience, expiry or nonce verification failed.
    TokenValidation(TokenValidationErrorKind),
    /// JWKS fetch throttled by the local rate limiter.
    RateLimited,
    /// The authorization state presented on callback is not acceptable.
    State(StateErrorKind),
}

#[derive(Debug, Clone, PartialEq)]
pub enum ConfigurationErrorKind {
    MissingField(&'static str),
    InvalidUrl(&'static str),
    UnsupportedAlgorithm,
    ProviderDisabled,
    DiscoveryNotConfigured,
    HttpClient,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ProtocolErrorKind {
    /// The provider answered with a non-success status and no OAuth error body.
    UnexpectedStatus(u16),
    /// The provider answered with an OAuth error code (`invalid_grant`, ...).
    ProviderError(String),
    MalformedResponse,
    MissingField(&'static str),
    IssuerMismatch,
}

/// Reasons an ID token is rejected.
#[derive(Debug, Clone, PartialEq)]
pub enum TokenValidationErrorKind {
    ProviderNotFound,
    NotOidcProvider,
    MalformedToken,
    MissingKeyId,
    DisallowedAlgorithm,
    KeyNotFound,
    KeysUnavailable,
    RateLimited,
    InvalidSignature,
    InvalidIssuer,
    InvalidAudience,
    MissingClaim(String),
    Expired,
    MissingNonce,
    NonceMismatch,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StateErrorKind {
    Unknown,
    Expired,
    Duplicate,
    Malformed,
    ProviderMismatch,
    VerifierMismatch,
}

impl fmt::Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        match &self.error_kind {
            ErrorKind::Configuration(kind) => write!(f, "Configuration error: {:?}", kind)?,
            ErrorKind::NotFound => write!(f, "Provider not found")?,
            ErrorKind::Network => write!(f, "Network error")?,
            ErrorKind::Protocol(kind) => write!(f, "Protocol error: {:?}", kind)?,
            ErrorKind::TokenValidation(kind) => write!(f, "Token validation error: {:?}", kind)?,
            ErrorKind::RateLimited => write!(f, "Rate limited")?,
            ErrorKind::State(kind) => write!(f, "Authorization state error: {:?}", kind)?,
        }
        if let Some(source) = &self.source {
            write!(f, " ({})", source)?;
        }
        Ok(())
    }
}

impl StdError for Error {
    fn source(&self) -> Option<&(dyn StdError + 'static)> {
        self.source
            .as_ref()
            .map(|e| e.as_ref() as &(dyn StdError + 'static))
    }
}

impl From<reqwest::Error> for Error {
    fn from(err: reqwest::Error) -> Self {
        // Builder errors happen before any network call is made.
        let error_kind = if err.is_builder() {
            ErrorKind::Configuration(ConfigurationErrorKind::HttpClient)
        } else if err.is_decode() {
            ErrorKind::Protocol(ProtocolErrorKind::MalformedResponse)
        } else {
            ErrorKind::Network
        };

        Error {
            source: Some(Box::new(err)),
            error_kind,
        }
    }
}

impl From<reqwest_middleware::Error> for Error {
    fn from(err: reqwest_middleware::Error) -> Self {
        match err {
            reqwest_middleware::Error::Reqwest(err) => err.into(),
            reqwest_middleware::Error::Middleware(err) => Error {
                source: Some(err.into()),
                error_kind: ErrorKind::Network,
            },
        }
    }
}

impl From<url::ParseError> for Error {
    fn from(err: url::ParseError) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Configuration(ConfigurationErrorKind::InvalidUrl("url")),
        }
    }
}

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error {
            source: Some(Box::new(err)),
            error_kind: ErrorKind::Protocol(ProtocolErrorKind::MalformedResponse),
        }
    }
}

/// Helper function to create configuration errors.
pub fn configuration_error(kind: ConfigurationErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Configuration(kind),
    }
}

/// Helper function to create not-found errors.
pub fn not_found_error(provider_id: &str) -> Error {
    Error {
        source: Some(format!("no provider with id {provider_id}").into()),
        error_kind: ErrorKind::NotFound,
    }
}

/// Helper function to create network errors.
pub fn network_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Network,
    }
}

/// Helper function to create protocol errors.
pub fn protocol_error(kind: ProtocolErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::Protocol(kind),
    }
}

/// Helper function to create token validation errors.
pub fn validation_error(kind: TokenValidationErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::TokenValidation(kind),
    }
}

/// Helper function to create rate limit errors.
pub fn rate_limited_error(message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::RateLimited,
    }
}

/// Helper function to create authorization state errors.
pub fn state_error(kind: StateErrorKind, message: &str) -> Error {
    Error {
        source: Some(message.to_string().into()),
        error_kind: ErrorKind::State(kind),
    }
}
