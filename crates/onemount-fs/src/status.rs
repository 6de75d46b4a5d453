//! Status engine
//!
//! Applies per-file status transitions with validation, keeps the xattr map
//! current, persists the change, and fans it out to the status publisher.
//! Also owns the conflict-copy naming policy.

use std::sync::Arc;

use chrono::{DateTime, Utc};
use tracing::{debug, warn};

use onemount_core::domain::{FileStatus, ItemId, RemoteError};
use onemount_core::ports::IStatusPublisher;
use onemount_store::MetadataStore;

use crate::tree::InodeTree;

/// Fan-out point for every status transition.
pub struct StatusEngine {
    tree: Arc<InodeTree>,
    store: Arc<MetadataStore>,
    publisher: Arc<dyn IStatusPublisher>,
}

impl StatusEngine {
    pub fn new(
        tree: Arc<InodeTree>,
        store: Arc<MetadataStore>,
        publisher: Arc<dyn IStatusPublisher>,
    ) -> Self {
        Self {
            tree,
            store,
            publisher,
        }
    }

    /// Applies a transition, rejecting invalid edges, then persists and
    /// publishes. Invalid transitions are logged and dropped rather than
    /// surfaced: status is advisory, never load-bearing for correctness.
    pub async fn transition(&self, id: &ItemId, target: FileStatus) {
        let current = self.tree.status_of(id).status;
        if !current.can_transition_to(&target) {
            warn!(id = %id, from = %current, to = %target, "dropping invalid status transition");
            return;
        }
        if current == target {
            return;
        }
        self.tree.set_status(id, target.clone());
        self.persist_and_publish(id, &target).await;
    }

    /// Records a terminal error and publishes the `error` status.
    pub async fn record_error(&self, id: &ItemId, err: &RemoteError) {
        self.tree.record_error(id, err);
        self.persist_and_publish(id, &FileStatus::Error).await;
    }

    async fn persist_and_publish(&self, id: &ItemId, status: &FileStatus) {
        let path = self.path_of(id);
        if let Some(node) = self.tree.get(id) {
            let snapshot = node.snapshot();
            if let Err(e) = self.store.put_inode(&snapshot).await {
                warn!(id = %id, error = %e, "failed to persist status change");
            }
        }
        self.publisher.publish(id, &path, status).await;
        debug!(id = %id, status = %status, "status published");
    }

    /// Root-relative path of an item, walking parent links.
    pub fn path_of(&self, id: &ItemId) -> String {
        let mut segments: Vec<String> = Vec::new();
        let mut current = id.clone();
        // bounded walk guards against parent-link cycles from bad data
        for _ in 0..256 {
            let Some(node) = self.tree.get(&current) else {
                break;
            };
            let (name, parent) = node.with(|i| (i.name().to_string(), i.parent_id().cloned()));
            if current.is_root() {
                break;
            }
            segments.push(name);
            match parent {
                Some(parent) => current = parent,
                None => break,
            }
        }
        segments.reverse();
        format!("/{}", segments.join("/"))
    }
}

/// Names a conflict copy: `report.txt` becomes
/// `report (Conflict Copy 2026-08-01 09:30:00).txt`.
pub fn conflict_copy_name(original: &str, at: DateTime<Utc>) -> String {
    let stamp = at.format("%Y-%m-%d %H:%M:%S");
    match original.rfind('.') {
        Some(dot) if dot > 0 => {
            let (stem, ext) = original.split_at(dot);
            format!("{stem} (Conflict Copy {stamp}){ext}")
        }
        _ => format!("{original} (Conflict Copy {stamp})"),
    }
}

/// As [`conflict_copy_name`], appending a numeric suffix until `exists`
/// stops matching.
pub fn unique_conflict_copy_name<F>(original: &str, at: DateTime<Utc>, mut exists: F) -> String
where
    F: FnMut(&str) -> bool,
{
    let candidate = conflict_copy_name(original, at);
    if !exists(&candidate) {
        return candidate;
    }
    for i in 2..=99 {
        let numbered = match candidate.rfind('.') {
            Some(dot) if dot > 0 => {
                let (stem, ext) = candidate.split_at(dot);
                format!("{stem} {i}{ext}")
            }
            _ => format!("{candidate} {i}"),
        };
        if !exists(&numbered) {
            return numbered;
        }
    }
    format!("{original}.conflict-{}", uuid::Uuid::new_v4())
}
