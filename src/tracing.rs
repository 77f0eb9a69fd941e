//! Structured logging initialization.
//!
//! The simulator logs through the `tracing` macros everywhere; this
//! module wires up a formatted subscriber when the `kumo-tracing` feature
//! is enabled. The queue broker's delivery lines and the gateways'
//! one-shot warnings all flow through whatever subscriber the host set
//! up, so embedding applications can keep their own.

use tracing::level_filters::LevelFilter;
use tracing_subscriber::{
    Layer, fmt::format::FmtSpan, layer::SubscriberExt, util::SubscriberInitExt,
};

/// Initializes the global tracing subscriber with formatted output.
pub fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::fmt::layer()
                .with_span_events(FmtSpan::CLOSE)
                .with_file(true)
                .with_line_number(true)
                .with_level(true)
                .with_filter(LevelFilter::DEBUG),
        )
        .init();
}
