//! Process-wide tracing/logging setup.
//!
//! Structured JSON logs on stdout for deployments, a compact
//! human-readable format when `JOBFLOW_LOG_FORMAT=compact` is set for
//! local runs. Filtering goes through `RUST_LOG`; the default quiets
//! the chatty driver crates while keeping jobflow at `info`.
//! Correlation happens through span fields (`job_id`, `client_id`,
//! `worker`) attached at the call sites.

use tracing_subscriber::EnvFilter;

/// Filter applied when `RUST_LOG` is unset.
pub const DEFAULT_FILTER: &str = "info,sqlx=warn,redis=warn";

/// Env var selecting the output format (`json` unless set to `compact`).
pub const LOG_FORMAT_VAR: &str = "JOBFLOW_LOG_FORMAT";

/// Initialize tracing/logging for the process.
///
/// Safe to call multiple times; subsequent calls are no-ops.
pub fn init() {
    let filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_FILTER));

    let compact = std::env::var(LOG_FORMAT_VAR)
        .map(|v| v.eq_ignore_ascii_case("compact"))
        .unwrap_or(false);

    if compact {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .compact()
            .with_target(false)
            .try_init();
    } else {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .json()
            .with_timer(tracing_subscriber::fmt::time::SystemTime)
            .with_current_span(true)
            .with_target(false)
            .try_init();
    }
}
