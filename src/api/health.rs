use std::sync::Arc;

use axum::extract::State;
use axum::response::Json;
use serde_json::{json, Value};

use crate::state::AppState;

/// Health check handler.
/// Returns JSON with status and config summary.
pub async fn health_handler(State(state): State<Arc<AppState>>) -> Json<Value> {
    let config = &state.config;
    let suppliers: Vec<Value> = config
        .suppliers
        .iter()
        .map(|supplier| {
            json!({
                "id": supplier.id,
                "protocol": supplier.protocol,
                "models": supplier.models.len(),
                "is_default": supplier.is_default,
            })
        })
        .collect();
    Json(json!({
        "status": "promptgate is running",
        "config": {
            "suppliers": suppliers,
            "transform": {
                "custom_tool_call_strategy": config.transform.custom_tool_call_strategy.to_string(),
                "tool_name_limit": config.transform.tool_name_limit,
            },
            "log_level": config.features.log_level,
        }
    }))
}
