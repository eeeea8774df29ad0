use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::State;
use axum::http::HeaderMap;
use axum::response::{IntoResponse, Json, Response};

use super::messages::{new_request_id, route_body, with_request_id};
use crate::error::GatewayError;
use crate::observability::log_trace_summary;
use crate::state::AppState;
use crate::transform::count_tokens::{
    count_tokens_response, plan_count_tokens, CountTokensPlan, TokenCount, COUNT_TOKENS_FALLBACK,
};
use crate::transform::TransformTrace;
use crate::transport::read_json;

/// `POST /v1/messages/count_tokens`: count through the supplier when it can,
/// otherwise estimate.
pub async fn count_tokens_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = new_request_id();
    let response = match handle_count_tokens(&state, &headers, &body).await {
        Ok(count) => Json(count).into_response(),
        Err(err) => err.into_response(),
    };
    with_request_id(response, &request_id)
}

async fn handle_count_tokens(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
) -> Result<TokenCount, GatewayError> {
    let (value, target) = route_body(state, body)?;
    let mut trace = TransformTrace::new(target.id.clone(), target.name.clone());
    let plan = plan_count_tokens(&value, headers, &target, &mut trace);
    let count = match plan {
        Err(err) => {
            log_trace_summary(&trace);
            return Err(err);
        }
        Ok(CountTokensPlan::Local(count)) => count,
        Ok(CountTokensPlan::Upstream {
            outbound,
            protocol,
            estimate,
        }) => {
            let counted = async {
                let upstream = state.transport.send(&outbound).await?;
                count_tokens_response(protocol, &read_json(upstream).await?)
            }
            .await;
            match counted {
                Ok(count) => count,
                Err(err) => {
                    tracing::warn!(
                        supplier = %target.id,
                        error = %err,
                        "count_tokens upstream failed; estimating"
                    );
                    trace.warn(format!(
                        "count_tokens upstream failed: {err}; returned an estimate"
                    ));
                    trace.set_metadata(COUNT_TOKENS_FALLBACK, true);
                    estimate
                }
            }
        }
    };
    log_trace_summary(&trace);
    Ok(count)
}
