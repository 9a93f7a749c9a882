//! Transition detector - compares an evaluation point against containment state

use crate::domain::error::DetectError;
use crate::domain::event::{GeofenceEvent, TransitionKind};
use crate::domain::geo::distance_meters;
use crate::domain::types::{ContainmentState, EvaluationPoint, Site};
use crate::services::geofence_index::SiteSnapshot;
use crate::services::state_store::ContainmentStore;
use smallvec::SmallVec;
use std::sync::Arc;
use tracing::debug;

/// A transition together with the containment it replaced
#[derive(Debug, Clone)]
pub struct Detection {
    pub event: GeofenceEvent,
    pub previous: ContainmentState,
}

pub type DetectedEvents = SmallVec<[Detection; 2]>;

pub struct TransitionDetector {
    store: Arc<ContainmentStore>,
    accuracy_ceiling_m: f64,
}

impl TransitionDetector {
    pub fn new(store: Arc<ContainmentStore>, accuracy_ceiling_m: f64) -> Self {
        Self { store, accuracy_ceiling_m }
    }

    pub fn store(&self) -> &Arc<ContainmentStore> {
        &self.store
    }

    /// Fix is precise enough to change containment
    #[inline]
    pub fn is_confident(&self, accuracy_m: Option<f64>) -> bool {
        accuracy_m.map_or(true, |acc| acc <= self.accuracy_ceiling_m)
    }

    /// Evaluate one point against the candidate sites
    ///
    /// Candidates are the sites near the point plus every participating site
    /// the subject is currently inside. Containment is updated in place; a
    /// caller that fails to record a detection restores `previous`. Must be
    /// called under the subject lock.
    pub fn evaluate(
        &self,
        point: &EvaluationPoint,
        snapshot: &SiteSnapshot,
    ) -> Result<DetectedEvents, DetectError> {
        if let Some(accuracy_m) = point.accuracy_m {
            if !self.is_confident(Some(accuracy_m)) {
                return Err(DetectError::LowConfidenceReport {
                    accuracy_m,
                    ceiling_m: self.accuracy_ceiling_m,
                });
            }
        }
        self.store.note_fix(point.subject_id, point.at);

        let mut candidates: SmallVec<[&Site; 8]> = snapshot.near(point.position);
        for site_id in self.store.inside_sites(point.subject_id) {
            if candidates.iter().all(|s| s.id != site_id) {
                if let Some(site) = snapshot.get(site_id) {
                    candidates.push(site);
                }
            }
        }

        let mut events = DetectedEvents::new();
        for site in candidates {
            let distance = distance_meters(point.position, site.center);
            let inside = distance <= site.radius_m;

            match self.store.get(point.subject_id, site.id) {
                None => {
                    self.store.set(point.subject_id, site.id, inside, point.at, distance);
                    debug!(
                        subject_id = %point.subject_id,
                        site_id = %site.id,
                        inside = %inside,
                        "containment_initialized"
                    );
                }
                Some(prev) if point.at < prev.last_fix_at => {
                    debug!(
                        subject_id = %point.subject_id,
                        site_id = %site.id,
                        at = %point.at,
                        last_fix_at = %prev.last_fix_at,
                        "stale_point_skipped"
                    );
                }
                Some(prev) if prev.inside != inside => {
                    let event = GeofenceEvent::new(
                        point.subject_id,
                        site,
                        TransitionKind::from_inside(inside),
                        point.at,
                        distance,
                        point.synthetic,
                    );
                    self.store.set(point.subject_id, site.id, inside, point.at, distance);
                    events.push(Detection { event, previous: prev });
                }
                Some(_) => self.store.touch(point.subject_id, site.id, point.at, distance),
            }
        }
        Ok(events)
    }
}
