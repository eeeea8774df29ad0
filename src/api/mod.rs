pub mod count_tokens;
pub mod health;
pub mod messages;

use std::sync::Arc;

use axum::routing::{get, post};
use axum::Router;

use crate::state::AppState;

/// All gateway routes.
pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(health::health_handler))
        .route("/health", get(health::health_handler))
        .route("/v1/messages", post(messages::messages_handler))
        .route(
            "/v1/messages/count_tokens",
            post(count_tokens::count_tokens_handler),
        )
        .with_state(state)
}
