use std::str::FromStr;

use tracing_subscriber::{EnvFilter, fmt, prelude::*};

/// Installs the global subscriber on stderr so CLI JSON on stdout stays clean.
/// A bare level ("debug") keeps axum's own events at info; directive strings with
/// ',' or '=' are used as given.
pub fn setup_logging(log_level: &str, json_format: bool) {
    let filter_spec = filter_directive(log_level);
    let filter = EnvFilter::from_str(&filter_spec).unwrap_or_else(|_| EnvFilter::new("info"));
    let subscriber = tracing_subscriber::registry().with(filter);

    if json_format {
        let json_layer = fmt::layer()
            .json()
            .with_target(false)
            .with_current_span(false)
            .with_writer(std::io::stderr);
        subscriber.with(json_layer).init();
    } else {
        let fmt_layer = fmt::layer()
            .with_target(true)
            .with_writer(std::io::stderr)
            .compact();
        subscriber.with(fmt_layer).init();
    }

    tracing::info!(
        filter = %filter_spec,
        format = if json_format { "json" } else { "compact" },
        "logging initialized"
    );
}

fn filter_directive(log_level: &str) -> String {
    let normalized = log_level.trim();
    if normalized.contains(',') || normalized.contains('=') {
        normalized.to_string()
    } else {
        format!("{normalized},axum=info")
    }
}

/// Resolves the log level from an explicit flag, then `RUST_LOG`, then "info".
pub fn resolve_log_level(explicit: Option<&str>) -> String {
    explicit
        .map(str::to_string)
        .or_else(|| std::env::var("RUST_LOG").ok())
        .filter(|level| !level.trim().is_empty())
        .unwrap_or_else(|| "info".to_string())
}
