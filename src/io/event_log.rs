//! Geofence event log
//!
//! Events live in memory and every state change (creation, delivery outcome)
//! is journaled to JSONL as a full snapshot. On startup the journal is
//! replayed with the last snapshot per id winning, so events still pending
//! at shutdown come back pending.
//!
//! The stored events of one (subject, site) pair alternate between enter and
//! exit: a transition of the same kind as the pair's last stored event is
//! never stored.

use crate::domain::error::StoreError;
use crate::domain::event::{DeliveryError, GeofenceEvent, TransitionKind};
use crate::domain::types::{SiteId, SubjectId};
use crate::io::jsonl::JsonlWriter;
use chrono::{DateTime, Utc};
use parking_lot::RwLock;
use rustc_hash::FxHashMap;
use std::path::Path;
use tracing::{info, warn};
use uuid::Uuid;

type PairKey = (SubjectId, SiteId);
type PendingKey = (SubjectId, SiteId, TransitionKind);

/// Result of recording a detected event
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecordOutcome {
    Recorded,
    /// An event with the same (subject, site, kind) is still pending
    Coalesced(Uuid),
    /// The pair's last stored event already has this kind
    Repeated(Uuid),
}

#[derive(Default)]
struct Inner {
    events: FxHashMap<Uuid, GeofenceEvent>,
    /// Creation order (UUIDv7 ids are time-sortable but ties are possible)
    order: Vec<Uuid>,
    pending: FxHashMap<PendingKey, Uuid>,
    /// Kind and id of the newest stored event per pair
    last: FxHashMap<PairKey, (TransitionKind, Uuid)>,
}

impl Inner {
    fn upsert(&mut self, event: GeofenceEvent) {
        let key = (event.subject_id, event.site_id, event.kind);
        if event.is_pending() {
            self.pending.insert(key, event.id);
        } else if self.pending.get(&key) == Some(&event.id) {
            self.pending.remove(&key);
        }
        if !self.events.contains_key(&event.id) {
            self.order.push(event.id);
            self.last.insert((event.subject_id, event.site_id), (event.kind, event.id));
        }
        self.events.insert(event.id, event);
    }
}

pub struct EventLog {
    journal: Option<JsonlWriter>,
    inner: RwLock<Inner>,
}

impl EventLog {
    /// Open a journaled log, replaying any existing journal file
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let path = path.as_ref();
        let mut inner = Inner::default();

        match tokio::fs::read_to_string(path).await {
            Ok(content) => {
                let mut skipped = 0usize;
                for line in content.lines().filter(|l| !l.trim().is_empty()) {
                    match serde_json::from_str::<GeofenceEvent>(line) {
                        Ok(event) => inner.upsert(event),
                        Err(_) => skipped += 1,
                    }
                }
                if skipped > 0 {
                    warn!(file = %path.display(), skipped = %skipped, "event_journal_lines_skipped");
                }
                info!(
                    file = %path.display(),
                    events = %inner.events.len(),
                    pending = %inner.pending.len(),
                    "event_journal_replayed"
                );
            }
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }

        Ok(Self { journal: Some(JsonlWriter::new(path)), inner: RwLock::new(inner) })
    }

    pub fn in_memory() -> Self {
        Self { journal: None, inner: RwLock::new(Inner::default()) }
    }

    /// Store a newly detected event unless an equivalent one is still
    /// pending or it would repeat the pair's last stored kind
    pub async fn record(&self, event: &GeofenceEvent) -> Result<RecordOutcome, StoreError> {
        let pair = (event.subject_id, event.site_id);
        let replaced = {
            let mut inner = self.inner.write();
            if let Some(existing) = inner.pending.get(&(event.subject_id, event.site_id, event.kind)) {
                return Ok(RecordOutcome::Coalesced(*existing));
            }
            let replaced = inner.last.get(&pair).copied();
            if let Some((kind, existing)) = replaced {
                if kind == event.kind {
                    return Ok(RecordOutcome::Repeated(existing));
                }
            }
            inner.upsert(event.clone());
            replaced
        };

        if let Err(e) = self.journal(event).await {
            // Keep memory consistent with what made it to disk
            let mut inner = self.inner.write();
            inner.events.remove(&event.id);
            inner.order.retain(|id| *id != event.id);
            inner.pending.retain(|_, id| *id != event.id);
            match replaced {
                Some(last) => inner.last.insert(pair, last),
                None => inner.last.remove(&pair),
            };
            return Err(e);
        }
        Ok(RecordOutcome::Recorded)
    }

    /// Settle a pending event as delivered. `None` if it was already settled or unknown.
    pub async fn settle_sent(
        &self,
        id: Uuid,
        at: DateTime<Utc>,
        attempts: u32,
    ) -> Result<Option<GeofenceEvent>, StoreError> {
        self.settle(id, |event| event.mark_sent(at, attempts)).await
    }

    /// Settle a pending event as permanently failed
    pub async fn settle_failed(
        &self,
        id: Uuid,
        error: DeliveryError,
        attempts: u32,
    ) -> Result<Option<GeofenceEvent>, StoreError> {
        self.settle(id, move |event| event.mark_failed(error, attempts)).await
    }

    async fn settle<F>(&self, id: Uuid, apply: F) -> Result<Option<GeofenceEvent>, StoreError>
    where
        F: FnOnce(&mut GeofenceEvent) -> bool,
    {
        let settled = {
            let mut inner = self.inner.write();
            let Some(event) = inner.events.get_mut(&id) else {
                return Ok(None);
            };
            if !apply(event) {
                return Ok(None);
            }
            let settled = event.clone();
            inner.pending.remove(&(settled.subject_id, settled.site_id, settled.kind));
            settled
        };

        // The in-memory status is already final; a journal failure only loses durability
        self.journal(&settled).await?;
        Ok(Some(settled))
    }

    async fn journal(&self, event: &GeofenceEvent) -> Result<(), StoreError> {
        match &self.journal {
            Some(writer) => writer.append(event).await,
            None => Ok(()),
        }
    }

    pub fn get(&self, id: Uuid) -> Option<GeofenceEvent> {
        self.inner.read().events.get(&id).cloned()
    }

    /// Pending events in creation order
    pub fn pending(&self) -> Vec<GeofenceEvent> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.events.get(id))
            .filter(|e| e.is_pending())
            .cloned()
            .collect()
    }

    pub fn pending_count(&self) -> usize {
        self.inner.read().pending.len()
    }

    /// Events of one (subject, site) pair in creation order
    pub fn events_for(&self, subject_id: SubjectId, site_id: SiteId) -> Vec<GeofenceEvent> {
        let inner = self.inner.read();
        inner
            .order
            .iter()
            .filter_map(|id| inner.events.get(id))
            .filter(|e| e.subject_id == subject_id && e.site_id == site_id)
            .cloned()
            .collect()
    }

    pub fn all(&self) -> Vec<GeofenceEvent> {
        let inner = self.inner.read();
        inner.order.iter().filter_map(|id| inner.events.get(id)).cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.inner.read().events.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
