//! Prometheus metrics registry and instruments.
//!
//! This module is framework-agnostic and can be used from any layer.

use lazy_static::lazy_static;
use prometheus::{HistogramOpts, IntCounter, IntCounterVec, IntGaugeVec, Opts, Registry};

lazy_static! {
    /// Global Prometheus registry
    pub static ref REGISTRY: Registry = Registry::new();

    // HTTP Metrics
    pub static ref HTTP_REQUESTS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedibox_http_requests_total", "Total number of HTTP requests"),
        &["method", "endpoint", "status"]
    ).expect("metric can be created");
    pub static ref HTTP_REQUEST_DURATION_SECONDS: prometheus::HistogramVec = prometheus::HistogramVec::new(
        HistogramOpts::new(
            "fedibox_http_request_duration_seconds",
            "HTTP request duration in seconds"
        ).buckets(vec![0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0]),
        &["method", "endpoint"]
    ).expect("metric can be created");

    // Outbox pipeline metrics
    pub static ref OUTBOX_ACTIVITIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedibox_outbox_activities_total", "Total number of activities accepted into the outbox pipeline"),
        &["activity_type"]
    ).expect("metric can be created");

    // Delivery (C8) metrics
    pub static ref DELIVERIES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedibox_deliveries_total", "Total number of delivery attempts by outcome"),
        &["outcome"]
    ).expect("metric can be created");
    pub static ref DELIVERY_RETRIES_TOTAL: IntCounter = IntCounter::new(
        "fedibox_delivery_retries_total",
        "Total number of deliveries requeued for retry"
    ).expect("metric can be created");
    pub static ref DELIVERY_DURATION_SECONDS: prometheus::Histogram = prometheus::Histogram::with_opts(
        HistogramOpts::new(
            "fedibox_delivery_duration_seconds",
            "Delivery attempt duration in seconds"
        ).buckets(vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0])
    ).expect("metric can be created");

    // Cache Metrics (actor resolver, C3)
    pub static ref CACHE_HITS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedibox_cache_hits_total", "Total number of cache hits"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_MISSES_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedibox_cache_misses_total", "Total number of cache misses"),
        &["cache_name"]
    ).expect("metric can be created");
    pub static ref CACHE_SIZE: IntGaugeVec = IntGaugeVec::new(
        Opts::new("fedibox_cache_size", "Current number of items in cache"),
        &["cache_name"]
    ).expect("metric can be created");

    // Error Metrics
    pub static ref ERRORS_TOTAL: IntCounterVec = IntCounterVec::new(
        Opts::new("fedibox_errors_total", "Total number of errors"),
        &["error_type", "endpoint"]
    ).expect("metric can be created");
}

/// Initialize metrics registry.
pub fn init_metrics() {
    REGISTRY
        .register(Box::new(HTTP_REQUESTS_TOTAL.clone()))
        .expect("HTTP_REQUESTS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(HTTP_REQUEST_DURATION_SECONDS.clone()))
        .expect("HTTP_REQUEST_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(OUTBOX_ACTIVITIES_TOTAL.clone()))
        .expect("OUTBOX_ACTIVITIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERIES_TOTAL.clone()))
        .expect("DELIVERIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_RETRIES_TOTAL.clone()))
        .expect("DELIVERY_RETRIES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(DELIVERY_DURATION_SECONDS.clone()))
        .expect("DELIVERY_DURATION_SECONDS can be registered");
    REGISTRY
        .register(Box::new(CACHE_HITS_TOTAL.clone()))
        .expect("CACHE_HITS_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_MISSES_TOTAL.clone()))
        .expect("CACHE_MISSES_TOTAL can be registered");
    REGISTRY
        .register(Box::new(CACHE_SIZE.clone()))
        .expect("CACHE_SIZE can be registered");
    REGISTRY
        .register(Box::new(ERRORS_TOTAL.clone()))
        .expect("ERRORS_TOTAL can be registered");

    tracing::info!("Metrics registry initialized");
}
