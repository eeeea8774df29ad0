use std::time::{Duration, SystemTime};

use http::header::RETRY_AFTER;

pub(crate) const RETRY_MAX_ATTEMPTS: u32 = 2;
const RETRY_BACKOFF_BASE_MS: u64 = 100;
const RETRY_BACKOFF_MAX_MS: u64 = 1_000;
const RETRY_AFTER_MAX_SECS: u64 = 30;

const RETRIABLE_TRANSPORT_NEEDLES: [&str; 7] = [
    "timed out",
    "timeout",
    "connection reset",
    "connection refused",
    "broken pipe",
    "unexpected eof",
    "stream closed",
];

/// Statuses worth one more attempt before the body is read.
#[inline]
pub(crate) fn should_retry_status(status: http::StatusCode) -> bool {
    matches!(status.as_u16(), 429 | 503 | 529)
}

#[inline]
pub(crate) fn should_retry_transport(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    RETRIABLE_TRANSPORT_NEEDLES
        .iter()
        .any(|needle| memchr::memmem::find(lowered.as_bytes(), needle.as_bytes()).is_some())
}

#[inline]
pub(crate) fn backoff_delay(attempt: u32) -> Duration {
    let multiplier = 1_u64 << attempt.min(10);
    Duration::from_millis(
        RETRY_BACKOFF_BASE_MS
            .saturating_mul(multiplier)
            .min(RETRY_BACKOFF_MAX_MS),
    )
}

/// `Retry-After` when the upstream sent a usable one, else exponential backoff.
pub(crate) fn status_retry_delay(headers: &http::HeaderMap, attempt: u32) -> Duration {
    retry_after(headers).unwrap_or_else(|| backoff_delay(attempt))
}

fn retry_after(headers: &http::HeaderMap) -> Option<Duration> {
    let raw = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if raw.is_empty() {
        return None;
    }
    let cap = Duration::from_secs(RETRY_AFTER_MAX_SECS);
    if let Ok(seconds) = raw.parse::<u64>() {
        return Some(Duration::from_secs(seconds).min(cap));
    }
    let target = httpdate::parse_http_date(raw).ok()?;
    Some(
        target
            .duration_since(SystemTime::now())
            .unwrap_or_default()
            .min(cap),
    )
}
