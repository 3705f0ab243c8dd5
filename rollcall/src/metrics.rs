//! Metrics collection for the roster service
//!
//! Collectors live in one crate registry and are exposed in the Prometheus
//! text format by the metrics listener.

use std::future::Future;
use std::time::Instant;

use lazy_static::lazy_static;
use prometheus::{CounterVec, Encoder, HistogramOpts, HistogramVec, IntGauge, Opts, Registry, TextEncoder};

lazy_static! {
    /// Global Prometheus registry instance
    pub static ref REGISTRY_INSTANCE: Registry = Registry::new();

    /// Counter for tracking request counts by method
    pub static ref REQ_COUNTER_VEC: CounterVec =
        CounterVec::new(Opts::new("request_counter", "request counter"), &["method"]).unwrap();

    /// Histogram for tracking method execution times
    pub static ref METHOD_HISTOGRAM_VEC: HistogramVec = HistogramVec::new(
        HistogramOpts::new("method_cost", "method cost"),
        &["method"]
    )
    .unwrap();

    /// Applied commands by kind and outcome (`ok`, `error`, `skipped`)
    pub static ref APPLY_COUNTER: CounterVec = CounterVec::new(
        Opts::new("apply_counter", "applied log commands"),
        &["kind", "outcome"]
    )
    .unwrap();

    /// Correlation slots still waiting for their command to be applied
    pub static ref REGISTRY_PENDING: IntGauge =
        IntGauge::new("registry_pending", "pending correlation tokens").unwrap();
}

/// Registers all metric collectors with the global registry
pub fn init_registry() {
    let _ = REGISTRY_INSTANCE.register(Box::new(REQ_COUNTER_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(METHOD_HISTOGRAM_VEC.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(APPLY_COUNTER.clone()));
    let _ = REGISTRY_INSTANCE.register(Box::new(REGISTRY_PENDING.clone()));
}

/// Counts `operation` under `method` and observes how long it took.
pub async fn record<T, F>(method: &'static str, operation: F) -> T
where
    F: Future<Output = T>,
{
    let start = Instant::now();
    REQ_COUNTER_VEC.with_label_values(&[method]).inc();
    let result = operation.await;

    METHOD_HISTOGRAM_VEC
        .with_label_values(&[method])
        .observe(start.elapsed().as_secs_f64());
    result
}

/// Renders the registry in the Prometheus text format.
pub fn render() -> Result<Vec<u8>, prometheus::Error> {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    encoder.encode(&REGISTRY_INSTANCE.gather(), &mut buffer)?;
    Ok(buffer)
}
