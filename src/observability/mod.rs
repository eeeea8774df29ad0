use tracing_subscriber::EnvFilter;

use crate::transform::trace::TransformTrace;

/// Map a configured log level onto a tracing filter directive.
///
/// Returns `None` for `DISABLED`; `WARNING` and `CRITICAL` become `WARN`
/// and `ERROR`, everything else passes through.
#[must_use]
pub fn filter_directive(log_level: &str) -> Option<String> {
    let level = log_level.trim().to_uppercase();
    match level.as_str() {
        "DISABLED" => None,
        "WARNING" => Some("WARN".to_string()),
        "CRITICAL" => Some("ERROR".to_string()),
        _ => Some(level),
    }
}

/// Initialize the tracing subscriber with the configured level and format.
///
/// `format` is `text` or `json`. Nothing is installed for `DISABLED`.
pub fn init_tracing(log_level: &str, format: &str) {
    let Some(directive) = filter_directive(log_level) else {
        return;
    };
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("INFO"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(true)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false);
    let installed = if format.eq_ignore_ascii_case("json") {
        builder.json().try_init()
    } else {
        builder.try_init()
    };
    if let Err(err) = installed {
        eprintln!("tracing subscriber already installed: {err}");
    }
}

/// One summary line per finished request.
pub fn log_trace_summary(trace: &TransformTrace) {
    let chain = trace.chain.join(",");
    if trace.is_success() {
        tracing::info!(
            supplier = %trace.supplier_id,
            chain = %chain,
            success = true,
            warnings = trace.warnings.len(),
            duration_ms = trace.elapsed_millis(),
            "transform complete"
        );
    } else {
        let first_error = trace.errors.first().map(|err| err.message.as_str()).unwrap_or_default();
        tracing::warn!(
            supplier = %trace.supplier_id,
            chain = %chain,
            success = false,
            warnings = trace.warnings.len(),
            errors = trace.errors.len(),
            first_error,
            duration_ms = trace.elapsed_millis(),
            "transform failed"
        );
    }
}
