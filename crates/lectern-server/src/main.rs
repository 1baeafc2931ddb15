use anyhow::Result;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use lectern_server::directory::OpenDirectory;
use lectern_server::engine::{LoopbackConfig, LoopbackEngine, MediaEngine};
use lectern_server::{create_app, state};

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "lectern_server=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    tracing::info!("Starting Lectern server...");

    // Load configuration
    let config = state::Config::load()?;

    // Default wiring runs against the in-process engine; deployments with a
    // native engine substitute their own MediaEngine implementation
    let engine: Arc<dyn MediaEngine> = Arc::new(LoopbackEngine::new(LoopbackConfig::default()));
    let directory = Arc::new(OpenDirectory);

    let bind_address = config.bind_address.clone();
    let (app, _state) = create_app(config, engine, directory).await?;

    // Start the server
    let listener = tokio::net::TcpListener::bind(&bind_address).await?;
    tracing::info!("Listening on {}", bind_address);

    axum::serve(listener, app).await?;

    Ok(())
}
