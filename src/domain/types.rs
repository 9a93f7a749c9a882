//! Shared types for the geofence gateway

use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Deserializer, Serialize};

/// Newtype wrapper for subject IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SubjectId(pub i64);

impl std::fmt::Display for SubjectId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Newtype wrapper for site IDs to provide type safety
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[repr(transparent)]
pub struct SiteId(pub i64);

impl std::fmt::Display for SiteId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// WGS84 position in decimal degrees
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct GeoPoint {
    pub lat: f64,
    pub lng: f64,
}

impl GeoPoint {
    #[inline]
    pub fn new(lat: f64, lng: f64) -> Self {
        Self { lat, lng }
    }

    /// Finite and within [-90, 90] / [-180, 180]
    pub fn is_valid(&self) -> bool {
        self.lat.is_finite()
            && self.lng.is_finite()
            && (-90.0..=90.0).contains(&self.lat)
            && (-180.0..=180.0).contains(&self.lng)
    }
}

/// A registered site with a circular geofence. Owned by external tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Site {
    pub id: SiteId,
    pub label: String,
    pub center: GeoPoint,
    pub radius_m: f64,
    #[serde(default = "default_true")]
    pub enabled: bool,
    /// Owning group, used to resolve alert recipients
    #[serde(default)]
    pub group: String,
}

fn default_true() -> bool {
    true
}

impl Site {
    /// Only enabled sites with a positive radius take part in detection
    pub fn participates(&self) -> bool {
        self.enabled && self.radius_m > 0.0 && self.radius_m.is_finite() && self.center.is_valid()
    }
}

/// A tracked person or device. Owned by external tooling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Subject {
    pub id: SubjectId,
    /// Identifier the mobile client reports under (device id, username)
    pub tracker_id: String,
    #[serde(default = "default_true")]
    pub active: bool,
}

/// Ingestion protocol a report arrived through. Diagnostic only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceProtocol {
    /// JSON body per report, subject resolved upstream
    Push,
    /// Query-string parameters carrying the subject identifier
    Poll,
}

impl SourceProtocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceProtocol::Push => "push",
            SourceProtocol::Poll => "poll",
        }
    }
}

/// One normalized GPS fix. Immutable once built.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LocationReport {
    pub subject_id: SubjectId,
    pub position: GeoPoint,
    /// Horizontal accuracy in meters, if the client reported one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub accuracy_m: Option<f64>,
    pub reported_at: DateTime<Utc>,
    pub received_at: DateTime<Utc>,
    pub source: SourceProtocol,
    /// Speed in m/s
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub speed_mps: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bearing_deg: Option<f64>,
    /// Battery level in percent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub battery_pct: Option<f64>,
}

/// A position the detector evaluates: either a real report or a gap-fill point
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct EvaluationPoint {
    pub subject_id: SubjectId,
    pub position: GeoPoint,
    pub accuracy_m: Option<f64>,
    pub at: DateTime<Utc>,
    pub synthetic: bool,
}

impl From<&LocationReport> for EvaluationPoint {
    fn from(report: &LocationReport) -> Self {
        Self {
            subject_id: report.subject_id,
            position: report.position,
            accuracy_m: report.accuracy_m,
            at: report.reported_at,
            synthetic: false,
        }
    }
}

/// Last known containment of one subject with respect to one site
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ContainmentState {
    pub inside: bool,
    /// When `inside` last changed (report time)
    pub since: DateTime<Utc>,
    pub last_distance_m: f64,
    /// Report time of the most recently evaluated fix
    pub last_fix_at: DateTime<Utc>,
    /// Wall-clock time of the most recent evaluation
    pub evaluated_at: DateTime<Utc>,
}

/// Timestamp that can be epoch seconds, epoch milliseconds or an RFC 3339 string
#[derive(Debug, Clone, Default, PartialEq)]
pub enum TimestampValue {
    #[default]
    None,
    IsoString(String),
    Epoch(i64),
    Fractional(f64),
}

/// Epoch values at or above this are milliseconds, not seconds
const EPOCH_MS_THRESHOLD: i64 = 100_000_000_000;

impl TimestampValue {
    /// Resolve to a UTC instant, `None` when absent or unparsable
    pub fn to_datetime(&self) -> Option<DateTime<Utc>> {
        match self {
            TimestampValue::None => None,
            TimestampValue::IsoString(s) => {
                let trimmed = s.trim();
                if let Ok(epoch) = trimmed.parse::<i64>() {
                    return TimestampValue::Epoch(epoch).to_datetime();
                }
                DateTime::parse_from_rfc3339(trimmed).ok().map(|dt| dt.with_timezone(&Utc))
            }
            TimestampValue::Epoch(v) if *v <= 0 => None,
            TimestampValue::Epoch(v) if *v >= EPOCH_MS_THRESHOLD => {
                Utc.timestamp_millis_opt(*v).single()
            }
            TimestampValue::Epoch(v) => Utc.timestamp_opt(*v, 0).single(),
            TimestampValue::Fractional(v) if !v.is_finite() || *v <= 0.0 => None,
            TimestampValue::Fractional(v) => {
                let millis = if *v >= EPOCH_MS_THRESHOLD as f64 { *v } else { *v * 1000.0 };
                Utc.timestamp_millis_opt(millis.round() as i64).single()
            }
        }
    }
}

pub fn deserialize_timestamp<'de, D>(deserializer: D) -> Result<TimestampValue, D::Error>
where
    D: Deserializer<'de>,
{
    use serde::de::{self, Visitor};

    struct TimestampVisitor;

    impl<'de> Visitor<'de> for TimestampVisitor {
        type Value = TimestampValue;

        fn expecting(&self, formatter: &mut std::fmt::Formatter) -> std::fmt::Result {
            formatter.write_str("a string or numeric timestamp")
        }

        fn visit_str<E>(self, value: &str) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value.to_string()))
        }

        fn visit_string<E>(self, value: String) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::IsoString(value))
        }

        fn visit_u64<E>(self, value: u64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::Epoch(i64::try_from(value).unwrap_or(0)))
        }

        fn visit_i64<E>(self, value: i64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::Epoch(value))
        }

        fn visit_f64<E>(self, value: f64) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::Fractional(value))
        }

        fn visit_unit<E>(self) -> Result<TimestampValue, E>
        where
            E: de::Error,
        {
            Ok(TimestampValue::None)
        }
    }

    deserializer.deserialize_any(TimestampVisitor)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_geo_point_validity() {
        assert!(GeoPoint::new(25.65, -100.37).is_valid());
        assert!(GeoPoint::new(90.0, 180.0).is_valid());
        assert!(!GeoPoint::new(90.1, 0.0).is_valid());
        assert!(!GeoPoint::new(0.0, -180.5).is_valid());
        assert!(!GeoPoint::new(f64::NAN, 0.0).is_valid());
    }

    #[test]
    fn test_site_participates() {
        let mut site = Site {
            id: SiteId(1),
            label: "Plant".to_string(),
            center: GeoPoint::new(25.650648, -100.373529),
            radius_m: 15.0,
            enabled: true,
            group: "north".to_string(),
        };
        assert!(site.participates());

        site.enabled = false;
        assert!(!site.participates());

        site.enabled = true;
        site.radius_m = 0.0;
        assert!(!site.participates());
    }

    #[test]
    fn test_timestamp_epoch_seconds_and_millis() {
        let secs = TimestampValue::Epoch(1_700_000_000).to_datetime().unwrap();
        let millis = TimestampValue::Epoch(1_700_000_000_000).to_datetime().unwrap();
        assert_eq!(secs, millis);
        assert_eq!(secs.timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_timestamp_strings() {
        let iso = TimestampValue::IsoString("2023-11-14T22:13:20Z".to_string());
        assert_eq!(iso.to_datetime().unwrap().timestamp(), 1_700_000_000);

        let numeric = TimestampValue::IsoString("1700000000".to_string());
        assert_eq!(numeric.to_datetime().unwrap().timestamp(), 1_700_000_000);

        assert!(TimestampValue::IsoString("yesterday".to_string()).to_datetime().is_none());
        assert!(TimestampValue::None.to_datetime().is_none());
        assert!(TimestampValue::Epoch(-5).to_datetime().is_none());
    }

    #[test]
    fn test_timestamp_fractional() {
        let dt = TimestampValue::Fractional(1_700_000_000.5).to_datetime().unwrap();
        assert_eq!(dt.timestamp_millis(), 1_700_000_000_500);
    }
}
