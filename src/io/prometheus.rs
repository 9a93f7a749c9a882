//! Prometheus metrics HTTP endpoint
//!
//! Exposes gateway metrics in Prometheus text format at /metrics.
//! Uses hyper for the HTTP server.

use crate::infra::metrics::{Metrics, MetricsSummary, METRICS_BUCKET_BOUNDS, METRICS_NUM_BUCKETS};
use bytes::Bytes;
use http_body_util::Full;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use std::convert::Infallible;
use std::fmt::Write;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{error, info};

/// Live gauges sampled at scrape time: (active subjects, inside pairs)
pub type LiveGauges = Arc<dyn Fn() -> (usize, usize) + Send + Sync>;

/// Prometheus metric type
enum MetricType {
    Counter,
    Gauge,
}

impl MetricType {
    fn as_str(&self) -> &'static str {
        match self {
            MetricType::Counter => "counter",
            MetricType::Gauge => "gauge",
        }
    }
}

/// Write a simple metric (counter or gauge)
fn write_metric(output: &mut String, name: &str, help: &str, typ: MetricType, val: u64) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} {}", typ.as_str());
    let _ = writeln!(output, "{name} {val}");
}

/// Write a counter with one label dimension
fn write_labeled_counter(output: &mut String, name: &str, help: &str, label: &str, values: &[(&str, u64)]) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} counter");
    for (value, count) in values {
        let _ = writeln!(output, "{name}{{{label}=\"{value}\"}} {count}");
    }
}

/// Write a histogram metric with buckets and count
fn write_histogram(
    output: &mut String,
    name: &str,
    help: &str,
    buckets: &[u64; METRICS_NUM_BUCKETS],
    sum: Option<u64>,
) {
    let _ = writeln!(output, "# HELP {name} {help}");
    let _ = writeln!(output, "# TYPE {name} histogram");

    let mut cumulative = 0u64;
    for (i, &bound) in METRICS_BUCKET_BOUNDS.iter().enumerate() {
        cumulative += buckets[i];
        let _ = writeln!(output, "{name}_bucket{{le=\"{bound}\"}} {cumulative}");
    }
    cumulative += buckets[METRICS_NUM_BUCKETS - 1];
    let _ = writeln!(output, "{name}_bucket{{le=\"+Inf\"}} {cumulative}");

    if let Some(sum) = sum {
        let _ = writeln!(output, "{name}_sum {sum}");
    }
    let _ = writeln!(output, "{name}_count {cumulative}");
}

/// Format metrics in Prometheus text exposition format
fn format_prometheus_metrics(metrics: &Metrics, active_subjects: usize, inside_pairs: usize) -> String {
    let summary = metrics.report(active_subjects, inside_pairs);
    let mut output = String::with_capacity(4096);

    write_ingest_metrics(&mut output, &summary);
    write_detection_metrics(&mut output, &summary);
    write_dispatch_metrics(&mut output, &summary);

    output
}

fn write_ingest_metrics(output: &mut String, summary: &MetricsSummary) {
    write_labeled_counter(
        output,
        "geofence_reports_total",
        "Inbound location payloads by outcome",
        "outcome",
        &[
            ("accepted", summary.reports_accepted),
            ("malformed", summary.reports_malformed),
            ("unknown_subject", summary.reports_unknown_subject),
        ],
    );
    write_metric(
        output,
        "geofence_reports_low_confidence_total",
        "Accepted reports excluded from detection for poor accuracy",
        MetricType::Counter,
        summary.reports_low_confidence,
    );
}

fn write_detection_metrics(output: &mut String, summary: &MetricsSummary) {
    write_metric(
        output,
        "geofence_points_evaluated_total",
        "Points run through the detector, real and synthetic",
        MetricType::Counter,
        summary.points_evaluated,
    );
    write_metric(
        output,
        "geofence_synthetic_points_total",
        "Gap-fill points evaluated",
        MetricType::Counter,
        summary.synthetic_points,
    );
    let _ = writeln!(output, "# HELP geofence_points_per_sec Points evaluated per second");
    let _ = writeln!(output, "# TYPE geofence_points_per_sec gauge");
    let _ = writeln!(output, "geofence_points_per_sec {:.6}", summary.points_per_sec);

    let detect_count: u64 = summary.detect_lat_buckets.iter().sum();
    write_histogram(
        output,
        "geofence_detect_latency_us",
        "Detector latency per point in microseconds",
        &summary.detect_lat_buckets,
        Some(summary.detect_lat_avg_us * detect_count),
    );

    write_labeled_counter(
        output,
        "geofence_transitions_total",
        "Recorded geofence transitions",
        "kind",
        &[("enter", summary.enter_total), ("exit", summary.exit_total)],
    );
    write_metric(
        output,
        "geofence_events_coalesced_total",
        "Transitions folded into an already pending event",
        MetricType::Counter,
        summary.events_coalesced,
    );
    write_metric(
        output,
        "geofence_sweeps_total",
        "Proactive sweeps completed",
        MetricType::Counter,
        summary.sweeps_total,
    );
    write_metric(
        output,
        "geofence_sweep_timeouts_total",
        "Subject evaluations that hit the sweep timeout",
        MetricType::Counter,
        summary.sweep_timeouts,
    );
    write_metric(
        output,
        "geofence_index_unavailable_total",
        "Evaluations deferred because the site index was unavailable",
        MetricType::Counter,
        summary.index_unavailable,
    );
    write_metric(
        output,
        "geofence_active_subjects",
        "Active subjects with at least one stored report",
        MetricType::Gauge,
        summary.active_subjects as u64,
    );
    write_metric(
        output,
        "geofence_inside_pairs",
        "Subject and site pairs currently inside",
        MetricType::Gauge,
        summary.inside_pairs as u64,
    );
}

fn write_dispatch_metrics(output: &mut String, summary: &MetricsSummary) {
    write_labeled_counter(
        output,
        "geofence_deliveries_total",
        "Notification deliveries by terminal status",
        "status",
        &[("sent", summary.deliveries_sent), ("failed", summary.deliveries_failed)],
    );
    write_metric(
        output,
        "geofence_delivery_retries_total",
        "Delivery retries scheduled",
        MetricType::Counter,
        summary.delivery_retries,
    );
    write_metric(
        output,
        "geofence_dispatch_dropped_total",
        "Events not queued because the dispatch queue was full",
        MetricType::Counter,
        summary.dispatch_dropped,
    );
    write_metric(
        output,
        "geofence_dispatch_queue_depth",
        "Dispatch queue depth at last enqueue",
        MetricType::Gauge,
        summary.dispatch_queue_depth,
    );
    write_histogram(
        output,
        "geofence_delivery_latency_ms",
        "Notification channel call latency in milliseconds",
        &summary.delivery_lat_buckets,
        None,
    );
}

fn text_response(status: StatusCode, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    response
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    metrics: Arc<Metrics>,
    gauges: LiveGauges,
) -> Result<Response<Full<Bytes>>, Infallible> {
    match (req.method(), req.uri().path()) {
        (&Method::GET, "/metrics") => {
            let (active_subjects, inside_pairs) = gauges();
            let body = format_prometheus_metrics(&metrics, active_subjects, inside_pairs);
            let mut response = text_response(StatusCode::OK, body);
            if let Ok(value) = "text/plain; version=0.0.4; charset=utf-8".parse() {
                response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
            }
            Ok(response)
        }
        (&Method::GET, "/health") => Ok(text_response(StatusCode::OK, "ok")),
        _ => Ok(text_response(StatusCode::NOT_FOUND, "Not Found")),
    }
}

/// Start the Prometheus metrics HTTP server
pub async fn start_metrics_server(
    port: u16,
    metrics: Arc<Metrics>,
    gauges: LiveGauges,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr).await?;

    info!(port = %port, "prometheus_metrics_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, _addr)) => {
                        let io = TokioIo::new(stream);
                        let metrics = metrics.clone();
                        let gauges = gauges.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| {
                                let metrics = metrics.clone();
                                let gauges = gauges.clone();
                                async move { handle_request(req, metrics, gauges).await }
                            });

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                error!(error = %e, "prometheus_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "prometheus_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("prometheus_metrics_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_prometheus_metrics() {
        let metrics = Metrics::new();

        metrics.record_report_accepted();
        metrics.record_point_evaluated(false, 150);
        metrics.record_point_evaluated(true, 250);
        metrics.record_transition(true);
        metrics.record_delivery(true);

        let output = format_prometheus_metrics(&metrics, 5, 2);

        assert!(output.contains("geofence_reports_total{outcome=\"accepted\"} 1"));
        assert!(output.contains("geofence_detect_latency_us_bucket{le=\"200\"} 1"));
        assert!(output.contains("geofence_detect_latency_us_count 2"));
        assert!(output.contains("geofence_transitions_total{kind=\"enter\"} 1"));
        assert!(output.contains("geofence_deliveries_total{status=\"sent\"} 1"));
        assert!(output.contains("geofence_active_subjects 5"));
        assert!(output.contains("geofence_inside_pairs 2"));
    }
}
