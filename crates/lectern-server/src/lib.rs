//! Lectern Server Library
//!
//! This module exposes the server components for testing and embedding.

pub mod api;
pub mod auth;
pub mod directory;
pub mod engine;
pub mod error;
pub mod sfu;
pub mod state;
pub mod ws;

use anyhow::Result;
use directory::ClassDirectory;
use engine::MediaEngine;
use std::sync::Arc;

/// Create and configure the server application
pub async fn create_app(
    config: state::Config,
    engine: Arc<dyn MediaEngine>,
    directory: Arc<dyn ClassDirectory>,
) -> Result<(axum::Router, state::AppState)> {
    let app_state = state::AppState::new(config, engine, directory).await?;
    let router = api::create_router(app_state.clone());
    Ok((router, app_state))
}
