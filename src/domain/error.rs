//! Error types for ingestion, detection and storage

use thiserror::Error;

/// Failure to turn an inbound payload into a location report
#[derive(Debug, Error)]
pub enum IngestError {
    #[error("malformed payload: {reason}")]
    MalformedPayload { reason: String },

    #[error("unknown tracker identifier '{tracker_id}'")]
    UnknownSubject { tracker_id: String },

    #[error("subject {tracker_id} is not active")]
    InactiveSubject { tracker_id: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl IngestError {
    pub fn malformed(reason: impl Into<String>) -> Self {
        IngestError::MalformedPayload { reason: reason.into() }
    }
}

/// Failure to evaluate a point against the geofences
#[derive(Debug, Error)]
pub enum DetectError {
    #[error("accuracy {accuracy_m:.1}m exceeds ceiling {ceiling_m:.1}m")]
    LowConfidenceReport { accuracy_m: f64, ceiling_m: f64 },

    #[error("site index unavailable: {reason}")]
    SiteIndexUnavailable { reason: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Persistence failure for owned state (report log, event log)
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("serialization error: {0}")]
    Serialize(#[from] serde_json::Error),
}
