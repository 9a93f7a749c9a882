//! Proactive sweep - re-evaluates every active subject's latest report

use super::Scheduler;
use crate::domain::types::{EvaluationPoint, SubjectId};
use chrono::Utc;
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinSet;
use tracing::{error, info, warn};

/// Per-cycle totals, also logged as `sweep_completed`
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepStats {
    pub evaluated: usize,
    pub events: usize,
    pub timed_out: usize,
    pub deferred: usize,
    pub skipped: usize,
    pub silent: usize,
}

enum SubjectSweep {
    Evaluated { events: usize },
    TimedOut,
    Deferred,
    Skipped,
}

impl Scheduler {
    /// One sweep cycle over all active subjects with a stored report
    pub async fn sweep(self: &Arc<Self>) -> SweepStats {
        let start = Instant::now();
        let mut stats = SweepStats::default();
        let mut tasks = JoinSet::new();

        for subject in self.subjects.active_subjects() {
            if self.reports.latest(subject.id).is_none() {
                continue;
            }
            let this = self.clone();
            tasks.spawn(async move { (subject.id, this.sweep_subject(subject.id).await) });
        }

        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((_, SubjectSweep::Evaluated { events })) => {
                    stats.evaluated += 1;
                    stats.events += events;
                }
                Ok((subject_id, SubjectSweep::TimedOut)) => {
                    stats.timed_out += 1;
                    self.metrics.record_sweep_timeout();
                    warn!(
                        subject_id = %subject_id,
                        timeout_ms = %self.sweep_settings.subject_timeout.as_millis(),
                        "sweep_subject_timeout"
                    );
                }
                Ok((_, SubjectSweep::Deferred)) => stats.deferred += 1,
                Ok((_, SubjectSweep::Skipped)) => stats.skipped += 1,
                Err(e) => error!(error = %e, "sweep_task_failed"),
            }
        }

        let cutoff = Utc::now() - self.sweep_settings.silent_after;
        for (subject_id, last_fix_at) in self.store().silent_subjects(cutoff) {
            if self.subjects.get(subject_id).is_some_and(|s| s.active) {
                stats.silent += 1;
                warn!(subject_id = %subject_id, last_fix_at = %last_fix_at, "subject_silent");
            }
        }

        self.metrics.record_sweep();
        info!(
            evaluated = %stats.evaluated,
            events = %stats.events,
            timed_out = %stats.timed_out,
            deferred = %stats.deferred,
            silent = %stats.silent,
            duration_ms = %start.elapsed().as_millis(),
            "sweep_completed"
        );
        stats
    }

    /// The timeout bounds waiting for the subject lock and the site snapshot.
    /// Once both are held, evaluation runs to completion.
    async fn sweep_subject(&self, subject_id: SubjectId) -> SubjectSweep {
        let prepared = tokio::time::timeout(self.sweep_settings.subject_timeout, async {
            let guard = self.locks.acquire(subject_id).await;
            let snapshot = self.index.snapshot().await;
            (guard, snapshot)
        })
        .await;

        let (_guard, snapshot) = match prepared {
            Ok((guard, Ok(snapshot))) => (guard, snapshot),
            Ok((_, Err(e))) => {
                self.metrics.record_index_unavailable();
                warn!(subject_id = %subject_id, error = %e, "sweep_subject_deferred");
                return SubjectSweep::Deferred;
            }
            Err(_) => return SubjectSweep::TimedOut,
        };

        // Re-read under the lock: a report may have landed while we waited
        let Some(report) = self.reports.latest(subject_id) else {
            return SubjectSweep::Skipped;
        };
        if !self.detector.is_confident(report.accuracy_m) {
            return SubjectSweep::Skipped;
        }

        let detected = self.evaluate_points(std::iter::once(EvaluationPoint::from(&report)), &snapshot);
        let recorded = self.record_events(detected).await;
        SubjectSweep::Evaluated { events: recorded.len() }
    }
}
