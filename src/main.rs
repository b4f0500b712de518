use std::sync::Arc;

use clap::Parser;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use llm_gateway::config::{Cli, Config};
use llm_gateway::inference::client::{ModelClient, WatsonxClient};
use llm_gateway::metrics::Metrics;
use llm_gateway::server::api::{build_router, cors_layer, AppState};
use llm_gateway::server::auth::AccessGuard;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse CLI arguments.
    let cli = Cli::parse();

    // Initialize tracing/logging.
    let filter = if cli.verbose {
        "llm_gateway=debug,tower_http=debug"
    } else {
        "llm_gateway=info,tower_http=info"
    };

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| filter.into()),
        )
        .with_target(true);
    if cli.json_logs {
        subscriber.json().init();
    } else {
        subscriber.init();
    }

    info!("llm-gateway v{}", env!("CARGO_PKG_VERSION"));

    // Load configuration. Any problem here is fatal.
    let config = Arc::new(Config::load(&cli.env_file)?);

    info!(
        model = %config.model.model_id,
        platform = %config.credentials.platform(),
        url = %config.credentials.url,
        "Configuration loaded"
    );
    info!(
        min_token_limit = config.token_limits.min_token_limit,
        max_token_limit = config.token_limits.max_token_limit,
        "Token limits"
    );
    if config.gateway_api_key.is_none() {
        warn!("LLM_REST_API_KEY is not set; every API request will be rejected");
    }

    // Build the upstream model client.
    let client: Arc<dyn ModelClient> = Arc::new(WatsonxClient::from_config(&config)?);

    // Build application state.
    let state = Arc::new(AppState::new(
        client,
        AccessGuard::new(config.gateway_api_key.clone()),
        Arc::new(Metrics::new()?),
        config.token_limits,
    ));

    // Build the HTTP router.
    let app = build_router(state)
        .layer(cors_layer(&config.server.cors_origins))
        .layer(TraceLayer::new_for_http());

    // Start the server.
    let listen_addr = cli.listen.unwrap_or_else(|| config.server.listen_addr());
    info!(addr = listen_addr, "Starting server");

    let listener = TcpListener::bind(&listen_addr).await?;
    info!("Listening on {listen_addr}");

    axum::serve(listener, app).await?;

    Ok(())
}
