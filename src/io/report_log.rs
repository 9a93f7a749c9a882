//! Location report log
//!
//! Every accepted report is appended to a JSONL file before detection runs.
//! The latest report per subject is kept in memory for gap-fill and sweeps,
//! and rebuilt from the file on startup.

use crate::domain::error::StoreError;
use crate::domain::types::{LocationReport, SubjectId};
use crate::io::jsonl::JsonlWriter;
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::path::Path;
use tracing::{info, warn};

pub struct ReportLog {
    writer: Option<JsonlWriter>,
    latest: RwLock<FxHashMap<SubjectId, LocationReport>>,
}

impl ReportLog {
    /// Log backed by a JSONL file, restoring the latest report per subject
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut latest: FxHashMap<SubjectId, LocationReport> = FxHashMap::default();

        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let mut skipped = 0usize;
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    let Ok(report) = serde_json::from_str::<LocationReport>(line) else {
                        skipped += 1;
                        continue;
                    };
                    match latest.get(&report.subject_id) {
                        Some(existing) if existing.reported_at > report.reported_at => {}
                        _ => {
                            latest.insert(report.subject_id, report);
                        }
                    }
                }
                if skipped > 0 {
                    warn!(file = %path.display(), skipped = %skipped, "report_log_lines_skipped");
                }
                info!(file = %path.display(), subjects = %latest.len(), "report_log_replayed");
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self { writer: Some(JsonlWriter::new(path)), latest: RwLock::new(latest) })
    }

    /// Log that keeps only the in-memory view (tests, dry runs)
    pub fn in_memory() -> Self {
        Self { writer: None, latest: RwLock::new(FxHashMap::default()) }
    }

    /// Persist a report. The in-memory latest only moves forward in report time.
    pub async fn append(&self, report: &LocationReport) -> Result<(), StoreError> {
        if let Some(writer) = &self.writer {
            writer.append(report).await?;
        }

        let mut latest = self.latest.write();
        match latest.get(&report.subject_id) {
            Some(existing) if existing.reported_at > report.reported_at => {}
            _ => {
                latest.insert(report.subject_id, report.clone());
            }
        }
        Ok(())
    }

    /// Most recent report of a subject by report time
    pub fn latest(&self, subject_id: SubjectId) -> Option<LocationReport> {
        self.latest.read().get(&subject_id).cloned()
    }

    /// Subjects with at least one stored report
    pub fn subjects(&self) -> Vec<SubjectId> {
        let mut ids: Vec<SubjectId> = self.latest.read().keys().copied().collect();
        ids.sort_unstable();
        ids
    }

    pub fn subject_count(&self) -> usize {
        self.latest.read().len()
    }
}
