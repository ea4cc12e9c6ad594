//! HTTP clients used to talk to identity providers.

use std::time::Duration;

use reqwest_middleware::{ClientBuilder, ClientWithMiddleware};
use reqwest_retry::RetryTransientMiddleware;

use super::BackoffPolicy;
use crate::settings::Settings;

/// HTTP client configuration.
#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    /// Request timeout.
    pub timeout: Duration,
    /// Maximum number of retries for idempotent calls.
    pub max_retries: u32,
    /// Delay before the first retry.
    pub retry_base_delay: Duration,
    /// User agent string.
    pub user_agent: String,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            max_retries: 2,
            retry_base_delay: Duration::from_millis(500),
            user_agent: format!("identity-auth/{}", env!("CARGO_PKG_VERSION")),
        }
    }
}

impl From<&Settings> for HttpClientConfig {
    fn from(settings: &Settings) -> Self {
        Self {
            timeout: settings.http_timeout,
            max_retries: settings.http_max_retries,
            retry_base_delay: settings.retry_base_delay,
            ..Self::default()
        }
    }
}

/// Pair of clients sharing one connection pool.
///
/// `single_shot` never retries: authorization codes are single use, so a
/// failed token exchange is surfaced once, and discovery/JWKS failures are
/// retried lazily by their caches. `retrying` is for idempotent calls
/// (userinfo, revocation) and retries transient failures with backoff.
#[derive(Clone)]
pub struct IdpHttpClient {
    pub single_shot: ClientWithMiddleware,
    pub retrying: ClientWithMiddleware,
}

/// Builder for [`IdpHttpClient`].
pub struct IdpClientBuilder {
    config: HttpClientConfig,
}

impl IdpClientBuilder {
    /// Create a new client builder with default configuration.
    pub fn new() -> Self {
        Self {
            config: HttpClientConfig::default(),
        }
    }

    /// Start from an existing configuration.
    pub fn with_config(mut self, config: HttpClientConfig) -> Self {
        self.config = config;
        self
    }

    /// Set the request timeout.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.config.timeout = timeout;
        self
    }

    /// Set the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.config.max_retries = max_retries;
        self
    }

    /// Set the user agent string.
    pub fn with_user_agent(mut self, user_agent: String) -> Self {
        self.config.user_agent = user_agent;
        self
    }

    /// Build the configured HTTP clients.
    pub fn build(self) -> Result<IdpHttpClient, reqwest::Error> {
        let client = reqwest::Client::builder()
            .timeout(self.config.timeout)
            .user_agent(self.config.user_agent)
            .build()?;

        let retry_policy = BackoffPolicy::new(self.config.max_retries, self.config.retry_base_delay)
            .with_budget(self.config.timeout);
        let retrying = ClientBuilder::new(client.clone())
            .with(RetryTransientMiddleware::new_with_policy(retry_policy))
            .build();
        let single_shot = ClientBuilder::new(client).build();

        Ok(IdpHttpClient {
            single_shot,
            retrying,
        })
    }
}

impl Default for IdpClientBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_default() {
        let builder = IdpClientBuilder::new();
        assert_eq!(builder.config.timeout, Duration::from_secs(30));
        assert_eq!(builder.config.max_retries, 2);
    }

    #[test]
    fn test_builder_with_timeout() {
        let builder = IdpClientBuilder::new().with_timeout(Duration::from_secs(60));
        assert_eq!(builder.config.timeout, Duration::from_secs(60));
    }

    #[test]
    fn test_config_from_settings() {
        let settings = Settings {
            http_timeout: Duration::from_secs(5),
            http_max_retries: 0,
            ..Settings::default()
        };
        let config = HttpClientConfig::from(&settings);
        assert_eq!(config.timeout, Duration::from_secs(5));
        assert_eq!(config.max_retries, 0);
    }

    #[tokio::test]
    async fn test_build_client() {
        let result = IdpClientBuilder::new().with_max_retries(0).build();
        assert!(result.is_ok());
    }
}
