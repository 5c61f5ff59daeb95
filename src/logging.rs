//! `tracing` subscriber setup for the runtime and the `bootstrap` binary.

use tracing_subscriber::EnvFilter;

/// Installs the global `tracing` subscriber.
///
/// Verbosity comes from `RUST_LOG`, else `LOG_LEVEL`, else `info`. `AWS_LAMBDA_LOG_FORMAT=json`
/// switches to JSON lines. Calling it again after a subscriber is installed is a no-op.
pub fn init() {
    let directive = filter_directive(
        std::env::var("RUST_LOG").ok(),
        std::env::var("LOG_LEVEL").ok(),
    );
    let filter = EnvFilter::try_new(&directive).unwrap_or_else(|_| EnvFilter::new("info"));

    let log_format = std::env::var("AWS_LAMBDA_LOG_FORMAT").unwrap_or_default();
    let result = if log_format.eq_ignore_ascii_case("json") {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .try_init()
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).try_init()
    };

    if result.is_err() {
        tracing::debug!("tracing subscriber already installed");
    }
}

fn filter_directive(rust_log: Option<String>, log_level: Option<String>) -> String {
    if let Some(directive) = rust_log.filter(|v| !v.trim().is_empty()) {
        return directive;
    }

    let level = log_level
        .as_deref()
        .map(str::trim)
        .map(str::to_ascii_lowercase)
        .filter(|lvl| matches!(lvl.as_str(), "trace" | "debug" | "info" | "warn" | "error"));
    level.unwrap_or_else(|| "info".to_string())
}
