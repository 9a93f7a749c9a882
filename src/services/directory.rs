//! Read-only views of externally owned subject and recipient data

use crate::domain::types::{Subject, SubjectId};
use crate::infra::config::Config;
use rustc_hash::FxHashMap;
use std::collections::HashMap;

/// Lookup of tracked subjects
pub trait SubjectDirectory: Send + Sync {
    /// Resolve the identifier a client reports under
    fn by_tracker_id(&self, tracker_id: &str) -> Option<Subject>;

    fn get(&self, id: SubjectId) -> Option<Subject>;

    fn active_subjects(&self) -> Vec<Subject>;
}

/// Lookup of alert recipients per owning group
pub trait RecipientDirectory: Send + Sync {
    fn recipients_for_group(&self, group: &str) -> Vec<String>;
}

/// Directory built once from configuration
#[derive(Debug, Default, Clone)]
pub struct StaticDirectory {
    subjects: FxHashMap<SubjectId, Subject>,
    tracker_ids: HashMap<String, SubjectId>,
    groups: HashMap<String, Vec<String>>,
}

impl StaticDirectory {
    pub fn new(subjects: Vec<Subject>, groups: HashMap<String, Vec<String>>) -> Self {
        let mut dir = Self { groups, ..Default::default() };
        for subject in subjects {
            dir.tracker_ids.insert(subject.tracker_id.clone(), subject.id);
            dir.subjects.insert(subject.id, subject);
        }
        dir
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.subjects().to_vec(), config.group_recipients().clone())
    }

    pub fn len(&self) -> usize {
        self.subjects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.subjects.is_empty()
    }
}

impl SubjectDirectory for StaticDirectory {
    fn by_tracker_id(&self, tracker_id: &str) -> Option<Subject> {
        let id = self.tracker_ids.get(tracker_id)?;
        self.subjects.get(id).cloned()
    }

    fn get(&self, id: SubjectId) -> Option<Subject> {
        self.subjects.get(&id).cloned()
    }

    fn active_subjects(&self) -> Vec<Subject> {
        let mut active: Vec<Subject> = self.subjects.values().filter(|s| s.active).cloned().collect();
        active.sort_by_key(|s| s.id);
        active
    }
}

impl RecipientDirectory for StaticDirectory {
    fn recipients_for_group(&self, group: &str) -> Vec<String> {
        self.groups.get(group).cloned().unwrap_or_default()
    }
}
