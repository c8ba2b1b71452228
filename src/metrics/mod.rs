//! Prometheus collectors of the key-value backends.
//!
//! Collectors live in a dedicated [`REGISTRY`]; [`gather_metrics`] renders
//! it in the text exposition format for whatever endpoint the host exposes.


use lazy_static::lazy_static;
use prometheus::exponential_buckets;
use prometheus::Encoder;
use prometheus::HistogramOpts;
use prometheus::HistogramVec;
use prometheus::IntCounterVec;
use prometheus::IntGaugeVec;
use prometheus::Opts;
use prometheus::Registry;
use prometheus::TextEncoder;
use tracing::error;

lazy_static! {
    pub static ref REQUEST_DURATION_METRIC: HistogramVec = HistogramVec::new(
        HistogramOpts::new(
            "confkv_request_duration_ms",
            "Histogram of backend request latency in ms"
        )
        .buckets(exponential_buckets(1.0, 2.0, 16).expect("valid buckets")),
        &["operation"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_EVENTS_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("confkv_watch_events", "Notifications delivered by watch streams"),
        &["strategy"]
    )
    .expect("metric can not be created");

    pub static ref WATCH_ERRORS_METRIC: IntCounterVec = IntCounterVec::new(
        Opts::new("confkv_watch_errors", "Failed blocking queries of watch loops"),
        &["strategy"]
    )
    .expect("metric can not be created");

    pub static ref ACTIVE_WATCHES_METRIC: IntGaugeVec = IntGaugeVec::new(
        Opts::new("confkv_active_watches", "Running watch tasks"),
        &["strategy"]
    )
    .expect("metric can not be created");

    pub static ref REGISTRY: Registry = register_custom_metrics(Registry::new());
}

fn register_custom_metrics(registry: Registry) -> Registry {
    registry
        .register(Box::new(REQUEST_DURATION_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCH_EVENTS_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(WATCH_ERRORS_METRIC.clone()))
        .expect("collector can be registered");
    registry
        .register(Box::new(ACTIVE_WATCHES_METRIC.clone()))
        .expect("collector can be registered");
    registry
}

/// Renders every backend collector in the Prometheus text format
pub fn gather_metrics() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if let Err(e) = encoder.encode(&REGISTRY.gather(), &mut buffer) {
        error!("could not encode custom metrics: {}", e);
    }
    match String::from_utf8(buffer) {
        Ok(v) => v,
        Err(e) => {
            error!("custom metrics could not be from_utf8'd: {}", e);
            String::default()
        }
    }
}
