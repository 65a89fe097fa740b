// convo-memory/crates/convo-memory/src/telemetry.rs

use tracing_subscriber::{fmt, EnvFilter};

const DEFAULT_FILTER: &str = "info,convo_memory=info";

/// Installs a compact fmt subscriber. `RUST_LOG` wins over `MEMORY_LOG`;
/// later calls are ignored.
pub fn init_tracing() {
    let env_filter = std::env::var("RUST_LOG")
        .or_else(|_| std::env::var("MEMORY_LOG").map(|level| format!("info,convo_memory={}", level)))
        .unwrap_or_else(|_| DEFAULT_FILTER.into());

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(env_filter))
        .with_timer(fmt::time::UtcTime::rfc_3339())
        .with_target(true)
        .with_thread_ids(true)
        .compact()
        .finish();

    if tracing::subscriber::set_global_default(subscriber).is_ok() {
        tracing::debug!("Tracing initialised");
    }
}
