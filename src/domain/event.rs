//! Geofence transition events and their delivery lifecycle

use crate::domain::types::{Site, SiteId, SubjectId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

/// Generate a new UUIDv7 (time-sortable)
pub fn new_uuid_v7() -> Uuid {
    Uuid::now_v7()
}

/// Direction of a boundary crossing
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransitionKind {
    Enter,
    Exit,
}

impl TransitionKind {
    #[inline]
    pub fn from_inside(inside: bool) -> Self {
        if inside {
            TransitionKind::Enter
        } else {
            TransitionKind::Exit
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransitionKind::Enter => "enter",
            TransitionKind::Exit => "exit",
        }
    }
}

/// Delivery lifecycle: pending moves to sent or failed once and stays there
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DeliveryStatus {
    Pending,
    Sent,
    Failed,
}

impl DeliveryStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryStatus::Pending => "pending",
            DeliveryStatus::Sent => "sent",
            DeliveryStatus::Failed => "failed",
        }
    }
}

/// Classified reason a notification was not confirmed delivered
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
#[serde(tag = "reason", rename_all = "snake_case")]
pub enum DeliveryError {
    #[error("channel call timed out after {after_ms}ms")]
    Timeout { after_ms: u64 },

    #[error("channel rejected the notification: {message}")]
    Rejected { message: String },

    #[error("no recipients configured for group '{group}'")]
    NoRecipients { group: String },

    #[error("transport error: {message}")]
    Transport { message: String },
}

impl DeliveryError {
    /// Timeouts and transport errors may succeed on a later attempt
    pub fn is_retryable(&self) -> bool {
        matches!(self, DeliveryError::Timeout { .. } | DeliveryError::Transport { .. })
    }

    pub fn code(&self) -> &'static str {
        match self {
            DeliveryError::Timeout { .. } => "timeout",
            DeliveryError::Rejected { .. } => "rejected",
            DeliveryError::NoRecipients { .. } => "no_recipients",
            DeliveryError::Transport { .. } => "transport",
        }
    }
}

/// A detected enter/exit transition
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeofenceEvent {
    pub id: Uuid,
    pub subject_id: SubjectId,
    pub site_id: SiteId,
    /// Site label and group at detection time
    pub site_label: String,
    #[serde(default)]
    pub site_group: String,
    pub kind: TransitionKind,
    /// Report time of the fix that produced the transition
    pub timestamp: DateTime<Utc>,
    pub distance_m: f64,
    /// Produced by a gap-fill point rather than a received fix
    pub synthetic: bool,
    pub status: DeliveryStatus,
    pub error: Option<DeliveryError>,
    pub sent_at: Option<DateTime<Utc>>,
    pub attempts: u32,
}

impl GeofenceEvent {
    pub fn new(
        subject_id: SubjectId,
        site: &Site,
        kind: TransitionKind,
        timestamp: DateTime<Utc>,
        distance_m: f64,
        synthetic: bool,
    ) -> Self {
        Self {
            id: new_uuid_v7(),
            subject_id,
            site_id: site.id,
            site_label: site.label.clone(),
            site_group: site.group.clone(),
            kind,
            timestamp,
            distance_m,
            synthetic,
            status: DeliveryStatus::Pending,
            error: None,
            sent_at: None,
            attempts: 0,
        }
    }

    #[inline]
    pub fn is_pending(&self) -> bool {
        self.status == DeliveryStatus::Pending
    }

    /// Record confirmed delivery. Returns false if the event was already settled.
    pub fn mark_sent(&mut self, at: DateTime<Utc>, attempts: u32) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = DeliveryStatus::Sent;
        self.sent_at = Some(at);
        self.error = None;
        self.attempts = attempts;
        true
    }

    /// Record terminal failure. Returns false if the event was already settled.
    pub fn mark_failed(&mut self, error: DeliveryError, attempts: u32) -> bool {
        if !self.is_pending() {
            return false;
        }
        self.status = DeliveryStatus::Failed;
        self.error = Some(error);
        self.attempts = attempts;
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::GeoPoint;

    fn event() -> GeofenceEvent {
        let site = Site {
            id: SiteId(3),
            label: "Warehouse".to_string(),
            center: GeoPoint::new(25.650648, -100.373529),
            radius_m: 15.0,
            enabled: true,
            group: "north".to_string(),
        };
        GeofenceEvent::new(SubjectId(7), &site, TransitionKind::Enter, Utc::now(), 9.5, false)
    }

    #[test]
    fn test_new_event_is_pending() {
        let e = event();
        assert_eq!(e.status, DeliveryStatus::Pending);
        assert!(e.error.is_none());
        assert!(e.sent_at.is_none());
        assert_eq!(e.attempts, 0);
    }

    #[test]
    fn test_mark_sent_once() {
        let mut e = event();
        let now = Utc::now();
        assert!(e.mark_sent(now, 1));
        assert_eq!(e.status, DeliveryStatus::Sent);
        assert_eq!(e.sent_at, Some(now));

        // Settled events never change again
        assert!(!e.mark_failed(DeliveryError::Timeout { after_ms: 10 }, 2));
        assert_eq!(e.status, DeliveryStatus::Sent);
        assert!(e.error.is_none());
    }

    #[test]
    fn test_mark_failed_is_terminal() {
        let mut e = event();
        assert!(e.mark_failed(DeliveryError::NoRecipients { group: "north".into() }, 1));
        assert!(!e.mark_sent(Utc::now(), 2));
        assert_eq!(e.status, DeliveryStatus::Failed);
        assert!(e.sent_at.is_none());
        assert_eq!(e.error.as_ref().map(|e| e.code()), Some("no_recipients"));
    }

    #[test]
    fn test_retryable_classification() {
        assert!(DeliveryError::Timeout { after_ms: 5 }.is_retryable());
        assert!(DeliveryError::Transport { message: "reset".into() }.is_retryable());
        assert!(!DeliveryError::Rejected { message: "400".into() }.is_retryable());
        assert!(!DeliveryError::NoRecipients { group: "g".into() }.is_retryable());
    }

    #[test]
    fn test_transition_kind() {
        assert_eq!(TransitionKind::from_inside(true), TransitionKind::Enter);
        assert_eq!(TransitionKind::from_inside(false), TransitionKind::Exit);
        assert_eq!(TransitionKind::Exit.as_str(), "exit");
    }

    #[test]
    fn test_event_json_shape() {
        let mut e = event();
        e.mark_failed(DeliveryError::Rejected { message: "bad".into() }, 1);
        let json: serde_json::Value = serde_json::to_value(&e).unwrap();
        assert_eq!(json["kind"], "enter");
        assert_eq!(json["status"], "failed");
        assert_eq!(json["error"]["reason"], "rejected");
        assert_eq!(json["subject_id"], 7);
        assert_eq!(json["site_label"], "Warehouse");
    }
}
