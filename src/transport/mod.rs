//! Outbound HTTP to suppliers.

mod retry_policy;

use std::time::Duration;

use bytes::Bytes;
use serde_json::Value;

use crate::config::ServerConfig;
use crate::error::GatewayError;
use crate::transform::request::OutboundRequest;
use crate::util::path_and_query;

use retry_policy::{
    backoff_delay, should_retry_status, should_retry_transport, status_retry_delay,
    RETRY_MAX_ATTEMPTS,
};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const ERROR_BODY_MAX_CHARS: usize = 512;

/// Pooled reqwest client shared by every request.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
}

impl HttpTransport {
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the client cannot be built.
    pub fn new(config: &ServerConfig) -> Result<Self, GatewayError> {
        let client = reqwest::Client::builder()
            .pool_max_idle_per_host(config.http_pool_max_idle_per_host)
            .tcp_nodelay(true)
            .connect_timeout(CONNECT_TIMEOUT)
            .redirect(reqwest::redirect::Policy::none())
            .timeout(Duration::from_secs(config.timeout))
            .build()
            .map_err(|err| GatewayError::Transport(format!("Failed to build HTTP client: {err}")))?;
        Ok(Self { client })
    }

    /// Send a translated request, retrying rate limits and dropped connections.
    ///
    /// Non-2xx responses that survive the retries are returned as
    /// [`GatewayError::Upstream`] with the upstream status.
    ///
    /// # Errors
    ///
    /// Returns [`GatewayError::Transport`] when the request cannot be sent and
    /// [`GatewayError::Upstream`] for error statuses.
    pub async fn send(
        &self,
        outbound: &OutboundRequest,
    ) -> Result<reqwest::Response, GatewayError> {
        let body = serde_json::to_vec(&outbound.body)
            .map_err(|err| GatewayError::Internal(err.to_string()))?;
        let body = Bytes::from(body);
        tracing::debug!(
            host = outbound.url.host_str().unwrap_or_default(),
            path = %path_and_query(&outbound.url),
            bytes = body.len(),
            "sending upstream request"
        );
        let mut attempt = 0;
        loop {
            let mut request = reqwest::Request::new(outbound.method.clone(), outbound.url.clone());
            *request.headers_mut() = outbound.headers.clone();
            *request.body_mut() = Some(reqwest::Body::from(body.clone()));

            match self.client.execute(request).await {
                Ok(response) if response.status().is_success() => return Ok(response),
                Ok(response) => {
                    if attempt < RETRY_MAX_ATTEMPTS && should_retry_status(response.status()) {
                        let delay = status_retry_delay(response.headers(), attempt);
                        tracing::debug!(
                            status = response.status().as_u16(),
                            retry_attempt = attempt + 1,
                            delay_ms = delay.as_millis(),
                            "retrying upstream request after retriable status"
                        );
                        drop(response);
                        tokio::time::sleep(delay).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(upstream_error(response).await);
                }
                Err(err) => {
                    let message = err.to_string();
                    if attempt >= RETRY_MAX_ATTEMPTS || !should_retry_transport(&message) {
                        return Err(GatewayError::Transport(message));
                    }
                    let delay = backoff_delay(attempt);
                    tracing::debug!(
                        retry_attempt = attempt + 1,
                        delay_ms = delay.as_millis(),
                        error = %message,
                        "retrying upstream request after transport error"
                    );
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

/// Read a complete JSON body; an empty body reads as `null`.
///
/// # Errors
///
/// Returns [`GatewayError::Transport`] if reading fails and
/// [`GatewayError::Upstream`] if the body is not JSON.
pub async fn read_json(response: reqwest::Response) -> Result<Value, GatewayError> {
    let bytes = response
        .bytes()
        .await
        .map_err(|err| GatewayError::Transport(err.to_string()))?;
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(Value::Null);
    }
    serde_json::from_slice(&bytes).map_err(|err| GatewayError::Upstream {
        status: 502,
        message: format!("Upstream returned invalid JSON: {err}"),
    })
}

async fn upstream_error(response: reqwest::Response) -> GatewayError {
    let status = response.status().as_u16();
    let message = match response.bytes().await {
        Ok(bytes) => upstream_error_message(&bytes),
        Err(err) => err.to_string(),
    };
    tracing::warn!(status, error = %message, "upstream returned an error status");
    GatewayError::Upstream { status, message }
}

/// Best-effort human message out of any of the supported error shapes.
pub(crate) fn upstream_error_message(body: &[u8]) -> String {
    if let Ok(value) = serde_json::from_slice::<Value>(body) {
        let error = value.get("error").unwrap_or(&value);
        let message = error
            .get("message")
            .and_then(Value::as_str)
            .or_else(|| error.as_str());
        if let Some(message) = message {
            return message.to_string();
        }
        // Gemini sometimes wraps the error in a one-element array.
        if let Some(first) = value.as_array().and_then(|items| items.first()) {
            if let Some(message) = first.pointer("/error/message").and_then(Value::as_str) {
                return message.to_string();
            }
        }
    }
    let text = String::from_utf8_lossy(body);
    text.trim().chars().take(ERROR_BODY_MAX_CHARS).collect()
}
