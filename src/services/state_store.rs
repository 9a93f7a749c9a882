//! Containment state per (subject, site)
//!
//! Sharded by subject: each subject owns its own map behind its own lock, so
//! evaluations of different subjects never contend beyond the shard lookup.

use crate::domain::types::{ContainmentState, SiteId, SubjectId};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use rustc_hash::FxHashMap;
use smallvec::SmallVec;
use std::sync::Arc;

#[derive(Debug, Default)]
struct SubjectStates {
    sites: FxHashMap<SiteId, ContainmentState>,
    /// Newest report time evaluated for this subject across all sites
    last_fix_at: Option<DateTime<Utc>>,
}

#[derive(Default)]
pub struct ContainmentStore {
    shards: RwLock<FxHashMap<SubjectId, Arc<Mutex<SubjectStates>>>>,
}

impl ContainmentStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn shard(&self, subject_id: SubjectId) -> Arc<Mutex<SubjectStates>> {
        if let Some(shard) = self.shards.read().get(&subject_id) {
            return shard.clone();
        }
        self.shards.write().entry(subject_id).or_default().clone()
    }

    fn existing_shard(&self, subject_id: SubjectId) -> Option<Arc<Mutex<SubjectStates>>> {
        self.shards.read().get(&subject_id).cloned()
    }

    pub fn get(&self, subject_id: SubjectId, site_id: SiteId) -> Option<ContainmentState> {
        let shard = self.existing_shard(subject_id)?;
        let states = shard.lock();
        states.sites.get(&site_id).copied()
    }

    /// Write containment for a fix. `since` only moves when `inside` changes.
    /// Returns the previous state.
    pub fn set(
        &self,
        subject_id: SubjectId,
        site_id: SiteId,
        inside: bool,
        at: DateTime<Utc>,
        distance_m: f64,
    ) -> Option<ContainmentState> {
        let shard = self.shard(subject_id);
        let mut states = shard.lock();
        let now = Utc::now();
        states.last_fix_at = Some(states.last_fix_at.map_or(at, |prev| prev.max(at)));

        let previous = states.sites.get(&site_id).copied();
        let since = match previous {
            Some(prev) if prev.inside == inside => prev.since,
            _ => at,
        };
        states.sites.insert(
            site_id,
            ContainmentState {
                inside,
                since,
                last_distance_m: distance_m,
                last_fix_at: previous.map_or(at, |p| p.last_fix_at.max(at)),
                evaluated_at: now,
            },
        );
        previous
    }

    /// Refresh evaluation timestamps and distance without touching `inside`
    pub fn touch(&self, subject_id: SubjectId, site_id: SiteId, at: DateTime<Utc>, distance_m: f64) {
        let shard = self.shard(subject_id);
        let mut states = shard.lock();
        states.last_fix_at = Some(states.last_fix_at.map_or(at, |prev| prev.max(at)));
        if let Some(state) = states.sites.get_mut(&site_id) {
            state.last_distance_m = distance_m;
            state.last_fix_at = state.last_fix_at.max(at);
            state.evaluated_at = Utc::now();
        }
    }

    /// Record that a confident fix of the subject was evaluated, whether or
    /// not any site was a candidate
    pub fn note_fix(&self, subject_id: SubjectId, at: DateTime<Utc>) {
        let shard = self.shard(subject_id);
        let mut states = shard.lock();
        states.last_fix_at = Some(states.last_fix_at.map_or(at, |prev| prev.max(at)));
    }

    /// Put back the state a pair had before a transition that could not be
    /// recorded, so the next evaluation detects it again
    pub fn restore(&self, subject_id: SubjectId, site_id: SiteId, previous: ContainmentState) {
        let shard = self.shard(subject_id);
        shard.lock().sites.insert(site_id, previous);
    }

    /// Sites the subject is currently inside
    pub fn inside_sites(&self, subject_id: SubjectId) -> SmallVec<[SiteId; 4]> {
        let Some(shard) = self.existing_shard(subject_id) else {
            return SmallVec::new();
        };
        let states = shard.lock();
        let mut ids: SmallVec<[SiteId; 4]> =
            states.sites.iter().filter(|(_, s)| s.inside).map(|(id, _)| *id).collect();
        ids.sort_unstable();
        ids
    }

    /// Subjects whose newest evaluated fix is older than `cutoff`
    pub fn silent_subjects(&self, cutoff: DateTime<Utc>) -> Vec<(SubjectId, DateTime<Utc>)> {
        let shards = self.shards.read();
        let mut silent: Vec<(SubjectId, DateTime<Utc>)> = shards
            .iter()
            .filter_map(|(id, shard)| {
                let last = shard.lock().last_fix_at?;
                (last < cutoff).then_some((*id, last))
            })
            .collect();
        silent.sort_unstable_by_key(|(id, _)| *id);
        silent
    }

    /// Number of (subject, site) pairs currently inside
    pub fn inside_count(&self) -> usize {
        let shards = self.shards.read();
        shards.values().map(|shard| shard.lock().sites.values().filter(|s| s.inside).count()).sum()
    }

    pub fn subject_count(&self) -> usize {
        self.shards.read().len()
    }
}
