//! Domain models - core business types and the event model
//!
//! This module contains the canonical data types used throughout the system:
//! - `types` - Site, Subject, LocationReport, ContainmentState
//! - `geo` - Haversine distance and bounding boxes
//! - `event` - GeofenceEvent and its delivery lifecycle
//! - `error` - Ingestion, detection and storage errors

pub mod error;
pub mod event;
pub mod geo;
pub mod types;

// Re-export commonly used types at module level
pub use error::{DetectError, IngestError, StoreError};
pub use event::{DeliveryError, DeliveryStatus, GeofenceEvent, TransitionKind};
pub use types::{
    ContainmentState, EvaluationPoint, GeoPoint, LocationReport, Site, SiteId, SourceProtocol,
    Subject, SubjectId,
};
