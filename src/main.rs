use anyhow::{Context, Result};
use std::sync::Arc;
use tokenbroker::api::{cors_layer, create_auth_router, AuthAppState};
use tokenbroker::config::{load_config_or_default, Secrets};
use tokenbroker::credentials::CredentialStore;
use tokenbroker::lifecycle::TokenLifecycleManager;
use tokenbroker::oauth::{run_state_cleanup, HttpExchangeClient, StateManager};
use tracing::info;

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing subscriber
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokenbroker=info".into()),
        )
        .init();

    info!("Token broker starting...");

    let config_path =
        std::env::var("TOKENBROKER_CONFIG").unwrap_or_else(|_| "tokenbroker.toml".to_string());
    let config = load_config_or_default(&config_path)?;
    let secrets = Secrets::from_env()?;

    info!(
        config_path = %config_path,
        store_path = %config.store.path,
        token_url = %config.provider.token_url,
        port = config.server.port,
        "Configuration loaded"
    );

    let provider = Arc::new(config.provider_config(&secrets));

    let store = Arc::new(
        CredentialStore::new(&config.store.path, &secrets.encryption_key)
            .context("Failed to initialize token store")?,
    );
    info!("Token store initialized");

    let exchange = Arc::new(
        HttpExchangeClient::new(Arc::clone(&provider), config.provider.timeout())
            .context("Failed to initialize exchange client")?,
    );

    let lifecycle = Arc::new(
        TokenLifecycleManager::new(store, exchange)
            .with_exchange_timeout(config.provider.timeout()),
    );

    let state_manager = StateManager::new(config.server.state_expiry_seconds);
    tokio::spawn(run_state_cleanup(
        state_manager.clone(),
        config.server.state_cleanup_interval_seconds.max(1),
    ));

    let mut router = create_auth_router(AuthAppState {
        lifecycle,
        provider,
        state_manager,
        post_authorize_redirect: config.server.post_authorize_redirect.clone(),
    });
    if let Some(origin) = &config.server.cors_origin {
        router = router.layer(cors_layer(origin)?);
        info!(origin = %origin, "CORS enabled");
    }

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.server.port))
        .await
        .context("Failed to bind API port")?;
    info!(port = config.server.port, "Token broker listening");

    axum::serve(listener, router)
        .with_graceful_shutdown(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!(error = %e, "Failed to listen for ctrl_c signal");
            }
            info!("Shutdown signal received");
        })
        .await
        .context("API server error")?;

    info!("Token broker stopped");
    Ok(())
}
