use std::convert::Infallible;
use std::sync::Arc;

use axum::body::{Body, Bytes};
use axum::extract::State;
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Json, Response};
use futures_util::StreamExt;
use serde_json::Value;
use uuid::Uuid;

use crate::error::GatewayError;
use crate::observability::log_trace_summary;
use crate::protocol::canonical::StopReason;
use crate::state::AppState;
use crate::stream::{transcode_sse_body, CompletionCallback, StreamOutcome, StreamTranscoder};
use crate::transform::request::{transform_request, SupplierTarget, TransformedRequest};
use crate::transform::response::{transform_response, ResponseContext};
use crate::transport::read_json;

const REQUEST_ID_HEADER: &str = "request-id";

pub(super) fn new_request_id() -> String {
    Uuid::from_u128(fastrand::u128(..)).simple().to_string()
}

pub(super) fn with_request_id(mut response: Response, request_id: &str) -> Response {
    if let Ok(value) = HeaderValue::from_str(request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, value);
    }
    response
}

/// `POST /v1/messages`: one client request through the engine and back.
pub async fn messages_handler(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let request_id = new_request_id();
    let response = match handle_messages(&state, &headers, &body, &request_id).await {
        Ok(response) => response,
        Err(err) => err.into_response(),
    };
    with_request_id(response, &request_id)
}

/// Parse a client body and pick the supplier for its model.
pub(super) fn route_body(
    state: &AppState,
    body: &[u8],
) -> Result<(Value, SupplierTarget), GatewayError> {
    let value: Value = serde_json::from_slice(body)
        .map_err(|err| GatewayError::InvalidRequest(format!("Request body is not JSON: {err}")))?;
    let model = value.get("model").and_then(Value::as_str).unwrap_or_default();
    let supplier = state
        .supplier_for(model)
        .ok_or_else(|| GatewayError::Config("no suppliers configured".to_string()))?;
    Ok((value, SupplierTarget::from_config(supplier)))
}

async fn handle_messages(
    state: &AppState,
    headers: &HeaderMap,
    body: &[u8],
    request_id: &str,
) -> Result<Response, GatewayError> {
    let (value, target) = route_body(state, body)?;
    tracing::debug!(request_id, supplier = %target.id, "routing request");

    let transformed = match transform_request(&value, headers, &target, &state.config.transform) {
        Ok(transformed) => transformed,
        Err(failure) => {
            log_trace_summary(&failure.trace);
            return Err(failure.error);
        }
    };
    let TransformedRequest {
        outbound,
        protocol,
        model,
        stream,
        tool_names,
        mut trace,
        ..
    } = transformed;

    let upstream = match state.transport.send(&outbound).await {
        Ok(upstream) => upstream,
        Err(err) => {
            trace.warn(format!("Upstream request failed: {err}"));
            log_trace_summary(&trace);
            return Err(err);
        }
    };

    let strategy = state.config.transform.custom_tool_call_strategy;
    if stream {
        let transcoder = StreamTranscoder::new(protocol, &model, tool_names, strategy);
        let request_id = request_id.to_string();
        let on_complete: CompletionCallback = Box::new(move |outcome: StreamOutcome| {
            log_trace_summary(&outcome.trace);
            tracing::debug!(
                request_id = %request_id,
                partial = outcome.partial,
                stop_reason = outcome.stop_reason.map(StopReason::as_str),
                "stream finished"
            );
        });
        let frames =
            transcode_sse_body(upstream.bytes_stream(), transcoder, trace, Some(on_complete));
        return Response::builder()
            .status(StatusCode::OK)
            .header(header::CONTENT_TYPE, "text/event-stream")
            .header(header::CACHE_CONTROL, "no-cache")
            .body(Body::from_stream(frames.map(Ok::<Bytes, Infallible>)))
            .map_err(|err| GatewayError::Internal(err.to_string()));
    }

    let result = async {
        let upstream_body = read_json(upstream).await?;
        let ctx = ResponseContext {
            model: &model,
            tool_names: &tool_names,
            custom_tool_call_strategy: strategy,
        };
        transform_response(protocol, &upstream_body, &ctx, &mut trace)?.ok_or_else(|| {
            GatewayError::Upstream {
                status: 502,
                message: "Upstream returned an empty body".to_string(),
            }
        })
    }
    .await;
    log_trace_summary(&trace);
    Ok(Json(result?).into_response())
}
