//! Provider configuration and the registry that holds it.

mod config;
mod registry;

pub use config::{
    OidcSettings, Protocol, ProviderConfig, ProviderFamily, ProviderPatch,
    ALLOWED_SIGNING_ALGORITHMS, DEFAULT_CLOCK_TOLERANCE_SECS, REDACTED_SECRET,
};
pub use registry::ProviderRegistry;

#[cfg(test)]
pub(crate) use config::tests::google_config;
