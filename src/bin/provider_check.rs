//! Loads identity provider configurations from a JSON file, configures each one
//! and checks that its endpoints answer. Exits non-zero if any provider fails.

use async_trait::async_trait;
use events::{AuthEvent, EventHandler, EventPublisher};
use identity_auth::{AuthService, ProviderConfig, Settings};
use log::{error, info, warn};
use service::{config::Config, logging::Logger};
use std::path::Path;
use std::sync::Arc;

/// Writes every auth event to the log.
struct AuditLog;

#[async_trait]
impl EventHandler for AuditLog {
    async fn handle(&self, event: &AuthEvent) {
        match serde_json::to_string(event) {
            Ok(json) => info!("auth event: {json}"),
            Err(e) => warn!("Unserializable auth event for {}: {e}", event.provider_id()),
        }
    }
}

fn settings_from(config: &Config) -> Settings {
    Settings {
        http_timeout: config.http_timeout(),
        http_max_retries: config.http_max_retries,
        authorization_ttl: config.authorization_ttl(),
        discovery_ttl: config.discovery_ttl(),
        discovery_timeout: config.discovery_timeout(),
        jwks_ttl: config.jwks_ttl(),
        jwks_max_keys: config.jwks_max_keys,
        jwks_fetches_per_minute: config.jwks_fetches_per_minute,
        ..Settings::default()
    }
}

fn load_providers(path: &Path) -> Result<Vec<ProviderConfig>, Box<dyn std::error::Error>> {
    let contents = std::fs::read_to_string(path)?;
    Ok(serde_json::from_str(&contents)?)
}

#[tokio::main]
async fn main() {
    let config = Config::new();
    if let Err(e) = Logger::init_logger(&config) {
        eprintln!("Failed to start logger: {e}");
        std::process::exit(1);
    }

    info!(
        "Checking identity providers from [{}] ({} environment)...",
        config.providers_file.display(),
        config.runtime_env()
    );

    let providers = match load_providers(&config.providers_file) {
        Ok(providers) => providers,
        Err(e) => {
            error!("Failed to read provider configurations: {e}");
            std::process::exit(1);
        }
    };

    let service = match AuthService::builder()
        .with_settings(settings_from(&config))
        .with_events(EventPublisher::new().with_handler(Arc::new(AuditLog)))
        .build()
    {
        Ok(service) => service,
        Err(e) => {
            error!("Failed to build authentication service: {e}");
            std::process::exit(1);
        }
    };

    let mut failed = Vec::new();
    for provider in providers {
        let provider_id = provider.id.clone();
        if let Err(e) = service.configure_provider(provider).await {
            error!("Provider {provider_id} rejected: {e}");
            failed.push(provider_id);
            continue;
        }

        match service.test_connection(&provider_id).await {
            Ok(report) => {
                let rendered = serde_json::to_string(&report).unwrap_or_default();
                if report.is_healthy() {
                    info!("Provider {provider_id} healthy: {rendered}");
                } else {
                    warn!("Provider {provider_id} unhealthy: {rendered}");
                    failed.push(provider_id);
                }
            }
            Err(e) => {
                error!("Connection test for {provider_id} failed: {e}");
                failed.push(provider_id);
            }
        }
    }

    service.shutdown();

    if !failed.is_empty() {
        error!("{} provider(s) failed: {}", failed.len(), failed.join(", "));
        std::process::exit(1);
    }
    info!("All providers passed");
}
