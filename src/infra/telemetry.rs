use std::sync::Once;

use metrics::{Unit, describe_counter, describe_histogram};
use tracing_error::ErrorLayer;
use tracing_subscriber::{
    EnvFilter, fmt,
    layer::{Layer, SubscriberExt},
    util::SubscriberInitExt,
};

use crate::config::{LogFormat, LoggingSettings};

use super::error::InfraError;

static METRIC_DESCRIPTIONS: Once = Once::new();

/// Install a global tracing subscriber using the provided logging settings.
pub fn init(logging: &LoggingSettings) -> Result<(), InfraError> {
    describe_metrics();

    let env_filter = EnvFilter::builder()
        .with_default_directive(logging.level.into())
        .from_env_lossy();

    let fmt_layer = match logging.format {
        LogFormat::Json => fmt::layer()
            .json()
            .with_current_span(true)
            .with_span_list(true)
            .with_target(true)
            .boxed(),
        LogFormat::Compact => fmt::layer().compact().with_target(true).boxed(),
    };

    tracing_subscriber::registry()
        .with(env_filter)
        .with(ErrorLayer::default())
        .with(fmt_layer)
        .try_init()
        .map_err(|err| {
            InfraError::telemetry(format!("failed to install tracing subscriber: {err}"))
        })
}

fn describe_metrics() {
    METRIC_DESCRIPTIONS.call_once(|| {
        describe_counter!(
            "larder_cache_hit_total",
            Unit::Count,
            "Cached entries served without touching the relational store."
        );
        describe_counter!(
            "larder_cache_miss_total",
            Unit::Count,
            "Targets resolved from the relational store."
        );
        describe_counter!(
            "larder_cache_excluded_total",
            Unit::Count,
            "Cached entries dropped because they failed the caller's conditions."
        );
        describe_counter!(
            "larder_cache_oversized_total",
            Unit::Count,
            "Entries not written back because they exceeded the size ceiling."
        );
        describe_counter!(
            "larder_store_error_total",
            Unit::Count,
            "Store operations that failed and were degraded to a sentinel."
        );
        describe_counter!(
            "larder_lock_attempt_total",
            Unit::Count,
            "Lock acquisitions by outcome."
        );
        describe_counter!(
            "larder_queue_delivery_total",
            Unit::Count,
            "Dequeue calls by outcome."
        );
        describe_histogram!(
            "larder_retrieve_ms",
            Unit::Milliseconds,
            "Relational retrieval latency in milliseconds."
        );
    });
}
