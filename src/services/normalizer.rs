//! Location normalizer - turns both inbound wire shapes into a LocationReport
//!
//! Push payloads are OwnTracks-style JSON bodies whose subject was resolved
//! upstream (the proxy sets the tracker id). Poll payloads are OsmAnd-style
//! query strings that carry the tracker id as `id`.

use crate::domain::error::IngestError;
use crate::domain::types::{
    deserialize_timestamp, GeoPoint, LocationReport, SourceProtocol, Subject, TimestampValue,
};
use crate::services::directory::SubjectDirectory;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::sync::Arc;

/// Raw inbound payload, tagged by the endpoint it arrived on
#[derive(Debug, Clone, Copy)]
pub enum RawPayload<'a> {
    Push { tracker_id: &'a str, body: &'a [u8] },
    Poll { query: &'a str },
}

/// OwnTracks-style push message
#[derive(Debug, Deserialize)]
struct PushMessage {
    #[serde(rename = "_type", default = "default_push_type")]
    kind: String,
    lat: Option<f64>,
    lon: Option<f64>,
    #[serde(default, deserialize_with = "deserialize_timestamp")]
    tst: TimestampValue,
    acc: Option<f64>,
    batt: Option<f64>,
    /// km/h
    vel: Option<f64>,
    /// Course over ground, degrees
    cog: Option<f64>,
}

fn default_push_type() -> String {
    "location".to_string()
}

/// OsmAnd-style query parameters
#[derive(Debug, Default)]
struct PollParams {
    id: Option<String>,
    lat: Option<String>,
    lon: Option<String>,
    timestamp: Option<String>,
    speed: Option<String>,
    bearing: Option<String>,
    accuracy: Option<String>,
    batt: Option<String>,
}

impl PollParams {
    fn parse(query: &str) -> Self {
        let mut params = PollParams::default();
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            let value = Some(value.into_owned());
            match key.as_ref() {
                "id" | "deviceid" => params.id = value,
                "lat" => params.lat = value,
                "lon" => params.lon = value,
                "timestamp" => params.timestamp = value,
                "speed" => params.speed = value,
                "bearing" | "heading" => params.bearing = value,
                "accuracy" => params.accuracy = value,
                "batt" => params.batt = value,
                _ => {}
            }
        }
        params
    }
}

const KMH_TO_MPS: f64 = 1.0 / 3.6;

pub struct Normalizer {
    subjects: Arc<dyn SubjectDirectory>,
}

impl Normalizer {
    pub fn new(subjects: Arc<dyn SubjectDirectory>) -> Self {
        Self { subjects }
    }

    /// Parse and validate a payload into a canonical report
    pub fn normalize(
        &self,
        payload: RawPayload<'_>,
        received_at: DateTime<Utc>,
    ) -> Result<LocationReport, IngestError> {
        match payload {
            RawPayload::Push { tracker_id, body } => self.normalize_push(tracker_id, body, received_at),
            RawPayload::Poll { query } => self.normalize_poll(query, received_at),
        }
    }

    /// Resolve the subject a poll query refers to (status reads carry no fix)
    pub fn poll_subject(&self, query: &str) -> Result<Subject, IngestError> {
        let params = PollParams::parse(query);
        let tracker_id = params.id.as_deref().unwrap_or_default();
        self.resolve(tracker_id)
    }

    /// Resolve a tracker identifier to an active subject
    pub fn resolve(&self, tracker_id: &str) -> Result<Subject, IngestError> {
        let tracker_id = tracker_id.trim();
        if tracker_id.is_empty() {
            return Err(IngestError::malformed("missing subject identifier"));
        }
        let subject = self
            .subjects
            .by_tracker_id(tracker_id)
            .ok_or_else(|| IngestError::UnknownSubject { tracker_id: tracker_id.to_string() })?;
        if !subject.active {
            return Err(IngestError::InactiveSubject { tracker_id: tracker_id.to_string() });
        }
        Ok(subject)
    }

    fn normalize_push(
        &self,
        tracker_id: &str,
        body: &[u8],
        received_at: DateTime<Utc>,
    ) -> Result<LocationReport, IngestError> {
        let msg: PushMessage = serde_json::from_slice(body)
            .map_err(|e| IngestError::malformed(format!("invalid JSON body: {}", e)))?;
        if msg.kind != "location" {
            return Err(IngestError::malformed(format!("unsupported message type '{}'", msg.kind)));
        }

        let position = coordinates(msg.lat, msg.lon)?;
        let reported_at = msg.tst.to_datetime().ok_or_else(|| IngestError::malformed("missing or invalid tst"))?;
        let accuracy_m = accuracy(msg.acc)?;
        let subject = self.resolve(tracker_id)?;

        Ok(LocationReport {
            subject_id: subject.id,
            position,
            accuracy_m,
            reported_at,
            received_at,
            source: SourceProtocol::Push,
            speed_mps: msg.vel.filter(|v| v.is_finite() && *v >= 0.0).map(|v| v * KMH_TO_MPS),
            bearing_deg: msg.cog.filter(|v| v.is_finite()),
            battery_pct: msg.batt.filter(|v| v.is_finite()),
        })
    }

    fn normalize_poll(
        &self,
        query: &str,
        received_at: DateTime<Utc>,
    ) -> Result<LocationReport, IngestError> {
        let params = PollParams::parse(query);

        let lat = parse_number(params.lat.as_deref(), "lat")?;
        let lon = parse_number(params.lon.as_deref(), "lon")?;
        let position = coordinates(lat, lon)?;
        let reported_at = params
            .timestamp
            .map(TimestampValue::IsoString)
            .and_then(|ts| ts.to_datetime())
            .ok_or_else(|| IngestError::malformed("missing or invalid timestamp"))?;
        let accuracy_m = accuracy(parse_number(params.accuracy.as_deref(), "accuracy")?)?;
        let subject = self.resolve(params.id.as_deref().unwrap_or_default())?;

        Ok(LocationReport {
            subject_id: subject.id,
            position,
            accuracy_m,
            reported_at,
            received_at,
            source: SourceProtocol::Poll,
            speed_mps: optional_number(params.speed.as_deref()).filter(|v| *v >= 0.0),
            bearing_deg: optional_number(params.bearing.as_deref()),
            battery_pct: optional_number(params.batt.as_deref()),
        })
    }
}

fn coordinates(lat: Option<f64>, lon: Option<f64>) -> Result<GeoPoint, IngestError> {
    let (Some(lat), Some(lon)) = (lat, lon) else {
        return Err(IngestError::malformed("missing coordinates"));
    };
    let point = GeoPoint::new(lat, lon);
    if !point.is_valid() {
        return Err(IngestError::malformed(format!("coordinates out of range: {}, {}", lat, lon)));
    }
    Ok(point)
}

fn accuracy(value: Option<f64>) -> Result<Option<f64>, IngestError> {
    match value {
        Some(acc) if !acc.is_finite() || acc < 0.0 => {
            Err(IngestError::malformed(format!("invalid accuracy: {}", acc)))
        }
        other => Ok(other),
    }
}

/// Required-if-present numeric field: absent is `None`, garbage is malformed
fn parse_number(value: Option<&str>, field: &str) -> Result<Option<f64>, IngestError> {
    match value.map(str::trim).filter(|v| !v.is_empty()) {
        None => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(|_| IngestError::malformed(format!("invalid {}: '{}'", field, raw))),
    }
}

/// Optional telemetry: garbage is dropped rather than rejecting the fix
fn optional_number(value: Option<&str>) -> Option<f64> {
    value.and_then(|v| v.trim().parse::<f64>().ok()).filter(|v| v.is_finite())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::types::SubjectId;
    use crate::services::directory::StaticDirectory;
    use std::collections::HashMap;

    fn normalizer() -> Normalizer {
        let subjects = vec![
            Subject { id: SubjectId(10), tracker_id: "ana".into(), active: true },
            Subject { id: SubjectId(11), tracker_id: "retired".into(), active: false },
        ];
        Normalizer::new(Arc::new(StaticDirectory::new(subjects, HashMap::new())))
    }

    fn push(body: &str) -> Result<LocationReport, IngestError> {
        normalizer().normalize(RawPayload::Push { tracker_id: "ana", body: body.as_bytes() }, Utc::now())
    }

    fn poll(query: &str) -> Result<LocationReport, IngestError> {
        normalizer().normalize(RawPayload::Poll { query }, Utc::now())
    }

    #[test]
    fn test_push_location() {
        let report = push(
            r#"{"_type":"location","lat":25.650648,"lon":-100.373529,"tst":1700000000,"acc":8,"batt":77,"vel":36}"#,
        )
        .unwrap();
        assert_eq!(report.subject_id, SubjectId(10));
        assert_eq!(report.source, SourceProtocol::Push);
        assert_eq!(report.reported_at.timestamp(), 1_700_000_000);
        assert_eq!(report.accuracy_m, Some(8.0));
        assert_eq!(report.battery_pct, Some(77.0));
        assert!((report.speed_mps.unwrap() - 10.0).abs() < 1e-9);
    }

    #[test]
    fn test_push_rejects_non_location_types() {
        let err = push(r#"{"_type":"transition","lat":1.0,"lon":2.0,"tst":1700000000}"#).unwrap_err();
        assert!(matches!(err, IngestError::MalformedPayload { .. }));
    }

    #[test]
    fn test_push_rejects_bad_fields() {
        assert!(matches!(
            push(r#"{"_type":"location","lon":2.0,"tst":1700000000}"#),
            Err(IngestError::MalformedPayload { .. })
        ));
        assert!(matches!(
            push(r#"{"_type":"location","lat":91.0,"lon":2.0,"tst":1700000000}"#),
            Err(IngestError::MalformedPayload { .. })
        ));
        assert!(matches!(
            push(r#"{"_type":"location","lat":1.0,"lon":2.0}"#),
            Err(IngestError::MalformedPayload { .. })
        ));
        assert!(matches!(push("not json"), Err(IngestError::MalformedPayload { .. })));
    }

    #[test]
    fn test_poll_submission() {
        let report = poll(
            "id=ana&lat=25.650648&lon=-100.373529&timestamp=1700000000&speed=1.5&bearing=90&accuracy=4&batt=50",
        )
        .unwrap();
        assert_eq!(report.subject_id, SubjectId(10));
        assert_eq!(report.source, SourceProtocol::Poll);
        assert_eq!(report.speed_mps, Some(1.5));
        assert_eq!(report.bearing_deg, Some(90.0));
        assert_eq!(report.accuracy_m, Some(4.0));
    }

    #[test]
    fn test_poll_accepts_iso_timestamp() {
        let report = poll("id=ana&lat=1&lon=2&timestamp=2023-11-14T22%3A13%3A20Z").unwrap();
        assert_eq!(report.reported_at.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_same_fix_through_both_protocols() {
        let a = push(r#"{"_type":"location","lat":25.65,"lon":-100.37,"tst":1700000000,"acc":5}"#).unwrap();
        let b = poll("id=ana&lat=25.65&lon=-100.37&timestamp=1700000000&accuracy=5").unwrap();
        assert_eq!(a.subject_id, b.subject_id);
        assert_eq!(a.position, b.position);
        assert_eq!(a.reported_at, b.reported_at);
        assert_eq!(a.accuracy_m, b.accuracy_m);
    }

    #[test]
    fn test_subject_resolution_errors() {
        assert!(matches!(
            poll("id=ghost&lat=1&lon=2&timestamp=1700000000"),
            Err(IngestError::UnknownSubject { .. })
        ));
        assert!(matches!(
            poll("id=retired&lat=1&lon=2&timestamp=1700000000"),
            Err(IngestError::InactiveSubject { .. })
        ));
        assert!(matches!(
            poll("lat=1&lon=2&timestamp=1700000000"),
            Err(IngestError::MalformedPayload { .. })
        ));
        assert!(matches!(
            poll("id=ana&lat=abc&lon=2&timestamp=1700000000"),
            Err(IngestError::MalformedPayload { .. })
        ));
    }
}
