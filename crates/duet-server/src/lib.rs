//! HTTP/SSE front end for the duet pipeline.

use std::sync::Arc;

use axum::Router;
use axum::routing::{get, post};
use duet_core::{AgentCommands, DuetConfig, Generator, InMemoryConversationStore};
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

pub mod error;
pub mod handlers;

/// Shared handler state.
#[derive(Clone)]
pub struct AppState {
    pub generator: Generator,
    /// Probed by `/api/health`.
    pub commands: AgentCommands,
}

impl AppState {
    pub fn new(generator: Generator, commands: AgentCommands) -> Self {
        Self {
            generator,
            commands,
        }
    }

    /// Wires the CLI runner to a fresh in-memory conversation store.
    pub fn from_config(config: &DuetConfig) -> Self {
        let store = Arc::new(InMemoryConversationStore::new());
        Self::new(
            Generator::from_config(config, store),
            config.commands.clone(),
        )
    }
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/generate", post(handlers::generate))
        .route("/api/history", get(handlers::list_conversations))
        .route("/api/history/{id}", get(handlers::conversation_messages))
        .route("/api/health", get(handlers::health))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}
