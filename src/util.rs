use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::error::GatewayError;

static MESSAGE_ID_COUNTER: AtomicU64 = AtomicU64::new(1);
const HEX: &[u8; 16] = b"0123456789abcdef";

#[inline]
pub(crate) fn unix_now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_or(0, |duration| {
            u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
        })
}

/// `msg_` followed by 16 hex digits of a process-wide counter mixed with a random seed.
pub(crate) fn next_message_id() -> String {
    static SEED: std::sync::LazyLock<u64> = std::sync::LazyLock::new(|| fastrand::u64(..));
    let seq = MESSAGE_ID_COUNTER.fetch_add(1, Ordering::Relaxed);
    let mut out = String::with_capacity(20);
    out.push_str("msg_");
    push_u64_hex_16(&mut out, seq ^ *SEED);
    out
}

/// Tool use id for upstreams that do not name their calls.
pub(crate) fn generate_tool_use_id() -> String {
    format!("toolu_{}_{}", unix_now_millis(), fastrand::u32(..1_000_000))
}

#[inline]
pub(crate) fn push_json_string_escaped(out: &mut String, value: &str) {
    let bytes = value.as_bytes();
    if bytes.iter().all(|&b| b >= 0x20 && b != b'"' && b != b'\\') {
        out.push('"');
        out.push_str(value);
        out.push('"');
        return;
    }

    out.push('"');
    for ch in value.chars() {
        match ch {
            '"' => out.push_str("\\\""),
            '\\' => out.push_str("\\\\"),
            '\n' => out.push_str("\\n"),
            '\r' => out.push_str("\\r"),
            '\t' => out.push_str("\\t"),
            '\u{08}' => out.push_str("\\b"),
            '\u{0c}' => out.push_str("\\f"),
            c if c <= '\u{1f}' => {
                let control = c as u8;
                out.push_str("\\u00");
                out.push(char::from(HEX[(control >> 4) as usize]));
                out.push(char::from(HEX[(control & 0x0f) as usize]));
            }
            _ => out.push(ch),
        }
    }
    out.push('"');
}

#[inline]
pub(crate) fn push_u64_decimal(out: &mut String, n: u64) {
    use std::fmt::Write;
    let _ = write!(out, "{n}");
}

#[inline]
fn push_u64_hex_16(out: &mut String, mut value: u64) {
    let mut buf = [b'0'; 16];
    let mut idx = 16;
    while idx > 0 {
        idx -= 1;
        let nibble = usize::try_from(value & 0x0f).unwrap_or(0);
        buf[idx] = HEX[nibble];
        value >>= 4;
    }
    for byte in buf {
        out.push(char::from(byte));
    }
}

/// Build the upstream URL for `endpoint` (e.g. `chat/completions`).
///
/// A base that already ends with the endpoint is used as is; a bare host gets
/// the `version` segment inserted; any other base path is kept and the
/// endpoint appended once.
///
/// # Errors
///
/// Returns [`GatewayError::Config`] when `base_url` is not an absolute URL.
pub(crate) fn join_endpoint(
    base_url: &str,
    version: &str,
    endpoint: &str,
    query: Option<&str>,
) -> Result<url::Url, GatewayError> {
    let mut url = url::Url::parse(base_url)
        .map_err(|err| GatewayError::Config(format!("invalid base URL '{base_url}': {err}")))?;
    let base_path = url.path().trim_end_matches('/').to_string();
    let endpoint = endpoint.trim_matches('/');

    let path = if base_path.ends_with(&format!("/{endpoint}")) {
        base_path
    } else if base_path.is_empty() {
        format!("/{version}/{endpoint}")
    } else {
        format!("{base_path}/{endpoint}")
    };
    url.set_path(&path);
    url.set_query(query);
    Ok(url)
}

/// Path plus query of `url`, as sent on the request line.
pub(crate) fn path_and_query(url: &url::Url) -> String {
    match url.query() {
        Some(query) => format!("{}?{query}", url.path()),
        None => url.path().to_string(),
    }
}
