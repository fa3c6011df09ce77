use anyhow::Result;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};
use uuid::Uuid;

use crate::pipeline::{ItemId, Step};

/// Initialize structured logging.
/// `RUST_LOG` wins over `level` when set; `json` switches to one JSON object per event.
/// Logs go to stderr so command output on stdout stays machine-readable.
pub fn init_telemetry(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().or_else(|_| EnvFilter::try_new(level))?;

    let registry = tracing_subscriber::registry().with(filter);
    if json {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .json()
                    .with_current_span(true)
                    .with_span_list(true)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    } else {
        registry
            .with(
                tracing_subscriber::fmt::layer()
                    .compact()
                    .with_target(false)
                    .with_writer(std::io::stderr),
            )
            .try_init()?;
    }

    tracing::debug!(level, json, "Telemetry initialized");
    Ok(())
}

/// Generate a correlation ID for linking related operations
pub fn generate_correlation_id() -> String {
    Uuid::new_v4().to_string()
}

/// Span wrapping one executor dispatch
pub fn create_dispatch_span(step: Step, item_id: &ItemId, attempt: u32, owner: &str) -> tracing::Span {
    tracing::info_span!(
        "stage_dispatch",
        step = %step,
        item.id = %item_id,
        attempt = attempt,
        owner = owner,
    )
}
