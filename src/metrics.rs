use hyper::service::{make_service_fn, service_fn};
use hyper::{Body, Request, Response, Server};
use prometheus::{Encoder, Gauge, GaugeVec, HistogramVec, IntCounterVec, Opts, TextEncoder};
use std::env;
use tracing::{error, info};

lazy_static::lazy_static! {
    pub static ref METRIC_NAMESPACE: String =
        env::var("METRIC_NAMESPACE").unwrap_or_else(|_| "global_resource_service".to_string());

    pub static ref EVENTS_APPENDED_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("events_appended_total", "Total NodeEvents appended to a log")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["region", "partition", "event_type"]
        ).unwrap();

    pub static ref LOG_HEAD_RV: GaugeVec =
        GaugeVec::new(
            Opts::new("log_head_rv", "Current head resource version per log")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["region", "partition"]
        ).unwrap();

    pub static ref PULL_DURATION_SECONDS: HistogramVec =
        HistogramVec::new(
            prometheus::HistogramOpts::new(
                "pull_duration_seconds",
                "Aggregator PullEvents call latency"
            ).namespace(METRIC_NAMESPACE.as_str()),
            &["region"]
        ).unwrap();

    pub static ref PULL_ERRORS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("pull_errors_total", "Aggregator pull failures by cause")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["region", "cause"]
        ).unwrap();

    pub static ref CLIENTS_REGISTERED: Gauge =
        Gauge::with_opts(
            Opts::new("clients_registered", "Currently registered clients")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref WATCH_CONNECTIONS: Gauge =
        Gauge::with_opts(
            Opts::new("watch_connections", "Currently open Watch streams")
                .namespace(METRIC_NAMESPACE.as_str())
        ).unwrap();

    pub static ref WATCH_EVICTIONS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("watch_evictions_total", "Watch streams torn down by cause")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["cause"]
        ).unwrap();

    pub static ref PROLONGED_EVENTS_TOTAL: IntCounterVec =
        IntCounterVec::new(
            Opts::new("prolonged_events_total", "Events delivered long after their update time")
                .namespace(METRIC_NAMESPACE.as_str()),
            &["region"]
        ).unwrap();
}

/// Registers all metrics with the default Prometheus registry. Called once,
/// only when `--enable_metrics` is set.
pub fn register_metrics() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    prometheus::default_registry().register(Box::new(EVENTS_APPENDED_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(LOG_HEAD_RV.clone()))?;
    prometheus::default_registry().register(Box::new(PULL_DURATION_SECONDS.clone()))?;
    prometheus::default_registry().register(Box::new(PULL_ERRORS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(CLIENTS_REGISTERED.clone()))?;
    prometheus::default_registry().register(Box::new(WATCH_CONNECTIONS.clone()))?;
    prometheus::default_registry().register(Box::new(WATCH_EVICTIONS_TOTAL.clone()))?;
    prometheus::default_registry().register(Box::new(PROLONGED_EVENTS_TOTAL.clone()))?;
    Ok(())
}

async fn metrics_handler(_req: Request<Body>) -> Result<Response<Body>, hyper::Error> {
    let encoder = TextEncoder::new();
    let metric_families = prometheus::default_registry().gather();
    let mut buffer = Vec::new();
    encoder.encode(&metric_families, &mut buffer).unwrap();

    let response = Response::builder()
        .status(200)
        .header("Content-Type", encoder.format_type())
        .body(Body::from(buffer))
        .unwrap();

    Ok(response)
}

/// Starts the Prometheus metrics HTTP server on `port`. Runs until the
/// process exits; a server error is logged, not fatal to the main service.
pub async fn start_metrics_server(port: u16) {
    let addr = ([0, 0, 0, 0], port).into();

    let make_svc = make_service_fn(|_conn| async {
        Ok::<_, hyper::Error>(service_fn(metrics_handler))
    });

    let server = Server::bind(&addr).serve(make_svc);
    info!(port, %addr, "metrics server listening");

    if let Err(e) = server.await {
        error!(error = %e, "metrics server error");
    }
}
