//! IO modules - external system interfaces
//!
//! This module contains all external IO operations:
//! - `http` - Location ingest endpoint for push and poll clients
//! - `jsonl` - Append-only JSONL journal writer
//! - `report_log` - Latest-report store backed by a JSONL journal
//! - `event_log` - Geofence event log with delivery state, replayed on start
//! - `notifier` - Notification channels (webhook, log)
//! - `site_source` - Site definitions from config or a remote endpoint
//! - `prometheus` - Prometheus metrics HTTP endpoint

pub mod event_log;
pub mod http;
pub mod jsonl;
pub mod notifier;
pub mod prometheus;
pub mod report_log;
pub mod site_source;

// Re-export commonly used types
pub use event_log::{EventLog, RecordOutcome};
pub use http::{start_ingest_server, IngestState};
pub use notifier::{LogChannel, Notification, NotificationChannel, WebhookChannel};
pub use report_log::ReportLog;
pub use site_source::{HttpSites, SiteSource, StaticSites};
