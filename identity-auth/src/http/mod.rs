//! HTTP client building with middleware.

mod client;
mod retry;

pub use client::{HttpClientConfig, IdpClientBuilder, IdpHttpClient};
pub use retry::BackoffPolicy;
