//! Gap-fill interpolation between sparse consecutive reports

use crate::domain::geo::{distance_meters, lerp};
use crate::domain::types::{EvaluationPoint, GeoPoint, LocationReport, SubjectId};
use chrono::{DateTime, Duration, Utc};

#[derive(Debug, Clone)]
pub struct GapFill {
    enabled: bool,
    max_gap: Duration,
    max_gap_m: f64,
    steps: u32,
    accuracy_ceiling_m: f64,
}

impl GapFill {
    pub fn new(enabled: bool, max_gap_secs: u64, max_gap_m: f64, steps: u32, accuracy_ceiling_m: f64) -> Self {
        Self {
            enabled,
            max_gap: Duration::seconds(max_gap_secs.min(i64::MAX as u64) as i64),
            max_gap_m,
            steps,
            accuracy_ceiling_m,
        }
    }

    pub fn disabled() -> Self {
        Self::new(false, 0, 0.0, 0, 0.0)
    }

    fn confident(&self, report: &LocationReport) -> bool {
        report.accuracy_m.map_or(true, |acc| acc <= self.accuracy_ceiling_m)
    }

    /// Synthetic points strictly between `prev` and `cur` (`steps - 1` of them)
    /// when the gap is large in time or distance
    pub fn between(&self, prev: &LocationReport, cur: &LocationReport) -> GapPoints {
        let elapsed = cur.reported_at - prev.reported_at;
        let fill = self.enabled
            && self.steps >= 2
            && prev.subject_id == cur.subject_id
            && elapsed > Duration::zero()
            && self.confident(prev)
            && self.confident(cur)
            && (elapsed > self.max_gap || distance_meters(prev.position, cur.position) > self.max_gap_m);

        GapPoints {
            subject_id: cur.subject_id,
            from: prev.position,
            to: cur.position,
            start: prev.reported_at,
            elapsed,
            accuracy_m: max_accuracy(prev.accuracy_m, cur.accuracy_m),
            steps: self.steps,
            next: 1,
            end: if fill { self.steps } else { 1 },
        }
    }
}

fn max_accuracy(a: Option<f64>, b: Option<f64>) -> Option<f64> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.max(b)),
        (a, b) => a.or(b),
    }
}

/// Lazy, finite sequence of interpolated points
#[derive(Debug, Clone)]
pub struct GapPoints {
    subject_id: SubjectId,
    from: GeoPoint,
    to: GeoPoint,
    start: DateTime<Utc>,
    elapsed: Duration,
    accuracy_m: Option<f64>,
    steps: u32,
    next: u32,
    end: u32,
}

impl Iterator for GapPoints {
    type Item = EvaluationPoint;

    fn next(&mut self) -> Option<EvaluationPoint> {
        if self.next >= self.end {
            return None;
        }
        let t = f64::from(self.next) / f64::from(self.steps);
        self.next += 1;

        let offset_ms = (self.elapsed.num_milliseconds() as f64 * t).round() as i64;
        Some(EvaluationPoint {
            subject_id: self.subject_id,
            position: lerp(self.from, self.to, t),
            accuracy_m: self.accuracy_m,
            at: self.start + Duration::milliseconds(offset_ms),
            synthetic: true,
        })
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        let remaining = self.end.saturating_sub(self.next) as usize;
        (remaining, Some(remaining))
    }
}

impl ExactSizeIterator for GapPoints {}
