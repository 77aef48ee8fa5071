//! Snapshot differ.
//!
//! [`diff`] compares two [`FileSnapshot`]s by content value and reports every
//! path that was added, removed or modified. The orchestrator only needs the
//! presence signal; [`ChangeSet::summary`] exists for debug logging.

use std::collections::BTreeMap;

use serde::Serialize;
use similar::{ChangeTag, TextDiff};

use crate::types::FileSnapshot;

/// Old and new content of a single path. `None` means absent.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FileChange {
    pub old: Option<String>,
    pub new: Option<String>,
}

/// How a path changed between two snapshots.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

impl FileChange {
    pub fn kind(&self) -> ChangeKind {
        match (&self.old, &self.new) {
            (None, _) => ChangeKind::Added,
            (Some(_), None) => ChangeKind::Removed,
            (Some(_), Some(_)) => ChangeKind::Modified,
        }
    }
}

/// Per-path changes between two snapshots. Only differing paths appear.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct ChangeSet(BTreeMap<String, FileChange>);

/// Line statistics for one changed path.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSummary {
    pub path: String,
    pub kind: ChangeKind,
    pub inserted: usize,
    pub deleted: usize,
}

impl ChangeSet {
    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn get(&self, path: &str) -> Option<&FileChange> {
        self.0.get(path)
    }

    pub fn paths(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &FileChange)> {
        self.0.iter().map(|(p, c)| (p.as_str(), c))
    }

    /// Line-level insert/delete counts per changed path.
    pub fn summary(&self) -> Vec<ChangeSummary> {
        self.0
            .iter()
            .map(|(path, change)| {
                let old = change.old.as_deref().unwrap_or("");
                let new = change.new.as_deref().unwrap_or("");
                let (mut inserted, mut deleted) = (0, 0);
                for op in TextDiff::from_lines(old, new).iter_all_changes() {
                    match op.tag() {
                        ChangeTag::Insert => inserted += 1,
                        ChangeTag::Delete => deleted += 1,
                        ChangeTag::Equal => {}
                    }
                }
                ChangeSummary {
                    path: path.clone(),
                    kind: change.kind(),
                    inserted,
                    deleted,
                }
            })
            .collect()
    }
}

/// Compare `a` against `b` by content value.
pub fn diff(a: &FileSnapshot, b: &FileSnapshot) -> ChangeSet {
    if a.ptr_eq(b) {
        return ChangeSet::default();
    }

    let mut changes = BTreeMap::new();
    for (path, old) in a.iter() {
        let new = b.get(path);
        if new != Some(old) {
            changes.insert(
                path.to_string(),
                FileChange {
                    old: Some(old.to_string()),
                    new: new.map(str::to_string),
                },
            );
        }
    }
    for (path, new) in b.iter() {
        if !a.contains(path) {
            changes.insert(
                path.to_string(),
                FileChange {
                    old: None,
                    new: Some(new.to_string()),
                },
            );
        }
    }
    ChangeSet(changes)
}
