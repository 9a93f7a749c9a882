//! Location ingest HTTP endpoint
//!
//! - `POST /owntracks` push JSON, subject from the proxy-set `X-Limit-U` header
//! - `GET /osmand?id=..` last known fix of a subject
//! - `POST /osmand?id=..&lat=..` submit a fix, echoes the previous one
//! - `GET /health`

use crate::domain::error::IngestError;
use crate::domain::types::{LocationReport, SubjectId};
use crate::infra::metrics::Metrics;
use crate::services::normalizer::{Normalizer, RawPayload};
use crate::services::scheduler::Scheduler;
use bytes::Bytes;
use chrono::Utc;
use http_body_util::{BodyExt, Full, Limited};
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper::{HeaderMap, Method, Request, Response, StatusCode};
use hyper_util::rt::TokioIo;
use serde::Serialize;
use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

/// Largest accepted request body
const MAX_BODY_BYTES: usize = 64 * 1024;

/// Headers carrying the tracker id of a push client, in priority order
const PUSH_SUBJECT_HEADERS: [&str; 2] = ["x-limit-u", "x-limit-d"];

/// Shared state for request handlers
pub struct IngestState {
    pub normalizer: Normalizer,
    pub scheduler: Arc<Scheduler>,
    pub metrics: Arc<Metrics>,
}

/// Last known fix as returned to poll clients
#[derive(Debug, Serialize)]
struct FixView {
    id: SubjectId,
    lat: f64,
    lon: f64,
    timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    accuracy: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    speed: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    bearing: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    batt: Option<f64>,
}

impl From<&LocationReport> for FixView {
    fn from(report: &LocationReport) -> Self {
        Self {
            id: report.subject_id,
            lat: report.position.lat,
            lon: report.position.lng,
            timestamp: report.reported_at.timestamp(),
            accuracy: report.accuracy_m,
            speed: report.speed_mps,
            bearing: report.bearing_deg,
            batt: report.battery_pct,
        }
    }
}

fn response(status: StatusCode, content_type: &str, body: impl Into<Bytes>) -> Response<Full<Bytes>> {
    let mut response = Response::new(Full::new(body.into()));
    *response.status_mut() = status;
    if let Ok(value) = content_type.parse() {
        response.headers_mut().insert(hyper::header::CONTENT_TYPE, value);
    }
    response
}

fn json_response<T: Serialize>(status: StatusCode, value: &T) -> Response<Full<Bytes>> {
    match serde_json::to_vec(value) {
        Ok(body) => response(status, "application/json", body),
        Err(e) => {
            error!(error = %e, "response_serialize_failed");
            response(StatusCode::INTERNAL_SERVER_ERROR, "text/plain", "internal error")
        }
    }
}

fn fix_response(fix: Option<LocationReport>) -> Response<Full<Bytes>> {
    json_response(StatusCode::OK, &fix.as_ref().map(FixView::from))
}

/// Map an ingest failure to a status code, counting and logging it
fn rejection(state: &IngestState, protocol: &str, err: &IngestError) -> Response<Full<Bytes>> {
    let status = match err {
        IngestError::MalformedPayload { .. } => {
            state.metrics.record_report_malformed();
            StatusCode::BAD_REQUEST
        }
        IngestError::UnknownSubject { .. } | IngestError::InactiveSubject { .. } => {
            state.metrics.record_report_unknown_subject();
            StatusCode::NOT_FOUND
        }
        IngestError::Store(_) => StatusCode::INTERNAL_SERVER_ERROR,
    };
    if status.is_server_error() {
        error!(protocol = %protocol, error = %err, "report_store_failed");
    } else {
        warn!(protocol = %protocol, error = %err, "report_rejected");
    }
    response(status, "text/plain", err.to_string())
}

fn push_tracker_id(headers: &HeaderMap) -> Option<String> {
    PUSH_SUBJECT_HEADERS
        .iter()
        .filter_map(|name| headers.get(*name))
        .filter_map(|value| value.to_str().ok())
        .map(str::trim)
        .find(|value| !value.is_empty())
        .map(str::to_string)
}

async fn read_body(req: Request<hyper::body::Incoming>) -> Result<Bytes, IngestError> {
    Limited::new(req.into_body(), MAX_BODY_BYTES)
        .collect()
        .await
        .map(|collected| collected.to_bytes())
        .map_err(|e| IngestError::malformed(format!("unreadable body: {}", e)))
}

/// Run the report pipeline in its own task so a dropped connection cannot
/// cancel it between persistence steps
async fn submit(state: &Arc<IngestState>, report: LocationReport) -> Result<usize, IngestError> {
    let scheduler = state.scheduler.clone();
    match tokio::spawn(async move { scheduler.on_report(report).await }).await {
        Ok(result) => result.map(|events| events.len()),
        Err(e) => Err(IngestError::Store(std::io::Error::other(e.to_string()).into())),
    }
}

async fn handle_push(
    state: Arc<IngestState>,
    req: Request<hyper::body::Incoming>,
) -> Response<Full<Bytes>> {
    let received_at = Utc::now();
    let tracker_id = push_tracker_id(req.headers()).unwrap_or_default();
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(e) => return rejection(&state, "push", &e),
    };

    let report = match state
        .normalizer
        .normalize(RawPayload::Push { tracker_id: &tracker_id, body: &body }, received_at)
    {
        Ok(report) => report,
        Err(e) => return rejection(&state, "push", &e),
    };

    match submit(&state, report).await {
        // Push clients expect a JSON array of messages for them
        Ok(_) => response(StatusCode::OK, "application/json", "[]"),
        Err(e) => rejection(&state, "push", &e),
    }
}

async fn handle_poll_status(state: Arc<IngestState>, query: &str) -> Response<Full<Bytes>> {
    match state.normalizer.poll_subject(query) {
        Ok(subject) => fix_response(state.scheduler.reports().latest(subject.id)),
        Err(e) => rejection(&state, "poll", &e),
    }
}

async fn handle_poll_submit(
    state: Arc<IngestState>,
    req: Request<hyper::body::Incoming>,
) -> Response<Full<Bytes>> {
    let received_at = Utc::now();
    let uri_query = req.uri().query().unwrap_or_default().to_string();
    let body = match read_body(req).await {
        Ok(body) => body,
        Err(e) => return rejection(&state, "poll", &e),
    };

    // Some clients send the parameters form-encoded in the body instead
    let query = if uri_query.contains("lat=") || body.is_empty() {
        uri_query
    } else if uri_query.is_empty() {
        String::from_utf8_lossy(&body).into_owned()
    } else {
        format!("{}&{}", uri_query, String::from_utf8_lossy(&body))
    };

    let report = match state.normalizer.normalize(RawPayload::Poll { query: &query }, received_at) {
        Ok(report) => report,
        Err(e) => return rejection(&state, "poll", &e),
    };

    let previous = state.scheduler.reports().latest(report.subject_id);
    match submit(&state, report).await {
        Ok(events) => {
            debug!(events = %events, "poll_report_processed");
            fix_response(previous)
        }
        Err(e) => rejection(&state, "poll", &e),
    }
}

async fn handle_request(
    req: Request<hyper::body::Incoming>,
    state: Arc<IngestState>,
) -> Result<Response<Full<Bytes>>, Infallible> {
    let path = req.uri().path().to_string();
    let response = match (req.method(), path.as_str()) {
        (&Method::POST, "/owntracks") => handle_push(state, req).await,
        (&Method::GET, "/osmand") => {
            let query = req.uri().query().unwrap_or_default().to_string();
            handle_poll_status(state, &query).await
        }
        (&Method::POST, "/osmand") => handle_poll_submit(state, req).await,
        (&Method::GET, "/health") => response(StatusCode::OK, "text/plain", "ok"),
        _ => response(StatusCode::NOT_FOUND, "text/plain", "Not Found"),
    };
    Ok(response)
}

/// Start the ingest HTTP server
pub async fn start_ingest_server(
    bind_address: &str,
    port: u16,
    state: Arc<IngestState>,
    mut shutdown: watch::Receiver<bool>,
) -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let addr: SocketAddr = format!("{}:{}", bind_address, port).parse()?;
    let listener = TcpListener::bind(addr).await?;

    info!(addr = %addr, "ingest_server_started");

    loop {
        tokio::select! {
            result = listener.accept() => {
                match result {
                    Ok((stream, peer)) => {
                        let io = TokioIo::new(stream);
                        let state = state.clone();

                        tokio::spawn(async move {
                            let service = service_fn(move |req| handle_request(req, state.clone()));

                            if let Err(e) = http1::Builder::new()
                                .serve_connection(io, service)
                                .await
                            {
                                debug!(peer = %peer, error = %e, "ingest_http_error");
                            }
                        });
                    }
                    Err(e) => {
                        error!(error = %e, "ingest_accept_error");
                    }
                }
            }
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    info!("ingest_server_shutdown");
                    return Ok(());
                }
            }
        }
    }
}
