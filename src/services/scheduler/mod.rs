//! Dual-mode scheduler - drives the detector per report and on a timer
//!
//! Both paths take the same per-subject async lock around detection, so a
//! sweep and a fresh report for one subject never interleave, while
//! different subjects proceed in parallel.

mod sweep;
#[cfg(test)]
mod tests;

pub use sweep::SweepStats;

use crate::domain::error::{DetectError, IngestError, StoreError};
use crate::domain::event::{GeofenceEvent, TransitionKind};
use crate::domain::types::{EvaluationPoint, LocationReport, SiteId, SubjectId};
use crate::infra::config::Config;
use crate::infra::metrics::Metrics;
use crate::io::event_log::{EventLog, RecordOutcome};
use crate::io::report_log::ReportLog;
use crate::services::detector::{Detection, TransitionDetector};
use crate::services::directory::SubjectDirectory;
use crate::services::dispatcher::DispatchSender;
use crate::services::geofence_index::{SiteIndex, SiteSnapshot};
use crate::services::interpolator::GapFill;
use crate::services::state_store::ContainmentStore;
use parking_lot::Mutex;
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::{watch, OwnedMutexGuard};
use tracing::{error, info, warn};

/// Per-subject async locks, created on first use
#[derive(Default)]
pub struct SubjectLocks {
    locks: Mutex<FxHashMap<SubjectId, Arc<tokio::sync::Mutex<()>>>>,
}

impl SubjectLocks {
    pub async fn acquire(&self, subject_id: SubjectId) -> OwnedMutexGuard<()> {
        let lock = self.locks.lock().entry(subject_id).or_default().clone();
        lock.lock_owned().await
    }
}

/// Timing for the proactive sweep
#[derive(Debug, Clone)]
pub struct SweepSettings {
    pub interval: Duration,
    pub subject_timeout: Duration,
    pub silent_after: chrono::Duration,
}

impl SweepSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            interval: Duration::from_secs(config.sweep_interval_secs().max(1)),
            subject_timeout: Duration::from_millis(config.sweep_subject_timeout_ms()),
            silent_after: chrono::Duration::seconds(config.silent_after_secs() as i64),
        }
    }
}

pub struct Scheduler {
    detector: TransitionDetector,
    index: Arc<dyn SiteIndex>,
    reports: Arc<ReportLog>,
    events: Arc<EventLog>,
    subjects: Arc<dyn SubjectDirectory>,
    gap_fill: GapFill,
    dispatch: DispatchSender,
    locks: SubjectLocks,
    sweep_settings: SweepSettings,
    metrics: Arc<Metrics>,
}

impl Scheduler {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: &Config,
        store: Arc<ContainmentStore>,
        index: Arc<dyn SiteIndex>,
        reports: Arc<ReportLog>,
        events: Arc<EventLog>,
        subjects: Arc<dyn SubjectDirectory>,
        dispatch: DispatchSender,
        metrics: Arc<Metrics>,
    ) -> Self {
        let gap_fill = GapFill::new(
            config.gap_fill_enabled(),
            config.gap_max_secs(),
            config.gap_max_meters(),
            config.gap_steps(),
            config.accuracy_ceiling_m(),
        );
        Self {
            detector: TransitionDetector::new(store, config.accuracy_ceiling_m()),
            index,
            reports,
            events,
            subjects,
            gap_fill,
            dispatch,
            locks: SubjectLocks::default(),
            sweep_settings: SweepSettings::from_config(config),
            metrics,
        }
    }

    pub fn store(&self) -> &Arc<ContainmentStore> {
        self.detector.store()
    }

    pub fn reports(&self) -> &Arc<ReportLog> {
        &self.reports
    }

    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }

    /// Reactive path: persist a normalized report and evaluate it
    ///
    /// Returns the events recorded for dispatch. Only a failure to persist the
    /// report itself is an error. Low-confidence reports are stored but not
    /// evaluated; an unavailable site index or event journal defers the
    /// affected transitions to the next sweep.
    pub async fn on_report(&self, report: LocationReport) -> Result<Vec<GeofenceEvent>, IngestError> {
        let _guard = self.locks.acquire(report.subject_id).await;

        let previous = self.reports.latest(report.subject_id);
        self.reports.append(&report).await?;
        self.metrics.record_report_accepted();
        info!(
            subject_id = %report.subject_id,
            lat = %report.position.lat,
            lng = %report.position.lng,
            accuracy_m = ?report.accuracy_m,
            reported_at = %report.reported_at,
            source = %report.source.as_str(),
            "report_accepted"
        );

        if !self.detector.is_confident(report.accuracy_m) {
            self.metrics.record_report_low_confidence();
            info!(
                subject_id = %report.subject_id,
                accuracy_m = ?report.accuracy_m,
                "report_low_confidence"
            );
            return Ok(Vec::new());
        }

        let snapshot = match self.index.snapshot().await {
            Ok(snapshot) => snapshot,
            Err(e) => {
                self.metrics.record_index_unavailable();
                warn!(subject_id = %report.subject_id, error = %e, "evaluation_deferred");
                return Ok(Vec::new());
            }
        };

        let gap_points = previous.as_ref().map(|prev| self.gap_fill.between(prev, &report));
        let points = gap_points.into_iter().flatten().chain(std::iter::once(EvaluationPoint::from(&report)));
        let detected = self.evaluate_points(points, &snapshot);
        Ok(self.record_events(detected).await)
    }

    /// Run the detector over a point sequence. A failing point is logged and
    /// the rest still run.
    fn evaluate_points(
        &self,
        points: impl Iterator<Item = EvaluationPoint>,
        snapshot: &SiteSnapshot,
    ) -> Vec<Detection> {
        let mut detected = Vec::new();
        for point in points {
            let start = Instant::now();
            match self.detector.evaluate(&point, snapshot) {
                Ok(events) => detected.extend(events),
                Err(DetectError::LowConfidenceReport { accuracy_m, .. }) => {
                    self.metrics.record_report_low_confidence();
                    info!(subject_id = %point.subject_id, accuracy_m = %accuracy_m, "point_low_confidence");
                }
                Err(e) => {
                    warn!(subject_id = %point.subject_id, error = %e, "point_evaluation_failed");
                }
            }
            self.metrics.record_point_evaluated(point.synthetic, start.elapsed().as_micros() as u64);
        }
        detected
    }

    /// Store detected events and hand recorded ones to the dispatcher
    ///
    /// When an event cannot be stored, its pair goes back to the containment
    /// it had before that transition and later detections for the same pair
    /// in this batch are dropped, so the next evaluation finds it again.
    async fn record_events(&self, detected: Vec<Detection>) -> Vec<GeofenceEvent> {
        let mut recorded = Vec::with_capacity(detected.len());
        let mut failed: SmallVec<[(SubjectId, SiteId); 2]> = SmallVec::new();
        for Detection { event, previous } in detected {
            let pair = (event.subject_id, event.site_id);
            if failed.contains(&pair) {
                continue;
            }
            match self.events.record(&event).await {
                Ok(RecordOutcome::Recorded) => {
                    self.metrics.record_transition(event.kind == TransitionKind::Enter);
                    info!(
                        event_id = %event.id,
                        subject_id = %event.subject_id,
                        site_id = %event.site_id,
                        kind = %event.kind.as_str(),
                        distance_m = %format!("{:.1}", event.distance_m),
                        synthetic = %event.synthetic,
                        timestamp = %event.timestamp,
                        "geofence_transition"
                    );
                    self.dispatch.enqueue(event.id);
                    recorded.push(event);
                }
                Ok(RecordOutcome::Coalesced(existing)) => {
                    self.metrics.record_event_coalesced();
                    info!(
                        subject_id = %event.subject_id,
                        site_id = %event.site_id,
                        kind = %event.kind.as_str(),
                        pending_event_id = %existing,
                        "geofence_event_coalesced"
                    );
                }
                Ok(RecordOutcome::Repeated(last)) => {
                    self.metrics.record_event_coalesced();
                    info!(
                        subject_id = %event.subject_id,
                        site_id = %event.site_id,
                        kind = %event.kind.as_str(),
                        last_event_id = %last,
                        "geofence_event_repeated"
                    );
                }
                Err(e) => {
                    log_record_error(&event, &e);
                    self.store().restore(event.subject_id, event.site_id, previous);
                    failed.push(pair);
                }
            }
        }
        recorded
    }

    /// Proactive sweep loop until shutdown
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut ticker = tokio::time::interval(self.sweep_settings.interval);
        // The first tick completes immediately; skip it so startup isn't a sweep
        ticker.tick().await;
        info!(interval_secs = %self.sweep_settings.interval.as_secs(), "sweep_scheduler_started");

        loop {
            tokio::select! {
                _ = ticker.tick() => {
                    self.sweep().await;
                }
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }
        info!("sweep_scheduler_stopped");
    }
}

#[cold]
fn log_record_error(event: &GeofenceEvent, e: &StoreError) {
    error!(
        event_id = %event.id,
        subject_id = %event.subject_id,
        site_id = %event.site_id,
        error = %e,
        "geofence_event_record_failed"
    );
}
