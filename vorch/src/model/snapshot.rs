//! VM snapshots and the per-VM snapshot chain.
//!
//! Snapshots of one VM form a forest: every snapshot points at its parent by
//! ID (or at nothing for a root) and at most one of them, always a `running`
//! one, is the VM's current snapshot. [`SnapshotChain`] holds one VM's
//! snapshots as an arena and plans the edits that keep those invariants when
//! a snapshot is created, reverted to or deleted. The store applies the
//! resulting [`ChainPatch`] in a single transaction.

use std::collections::HashMap;

use serde::Serialize;
use uuid::Uuid;

use super::{Status, timestamp};

string_enum! {
    pub enum SnapshotStatus {
        Creating => "creating",
        Running => "running",
        Reverting => "reverting",
        Deleting => "deleting",
        Error => "error",
    }
}

impl Status for SnapshotStatus {
    const ENTITY: &'static str = "snapshot";

    fn as_str(&self) -> &'static str {
        SnapshotStatus::as_str(self)
    }

    fn allows(self, next: Self) -> bool {
        use SnapshotStatus::*;
        matches!(
            (self, next),
            (Creating, Running | Error)
                | (Running, Reverting | Deleting)
                | (Reverting, Running | Error)
                | (Deleting, Error)
                | (Error, Deleting)
        )
    }
}

impl SnapshotStatus {
    /// An operation on this snapshot is in flight.
    pub fn is_transitional(self) -> bool {
        matches!(
            self,
            SnapshotStatus::Creating | SnapshotStatus::Reverting | SnapshotStatus::Deleting
        )
    }
}

/// Snapshot record
#[derive(Debug, Clone, Serialize)]
pub struct Snapshot {
    pub id: String,
    pub vm_id: String,
    pub name: String,
    pub description: String,
    pub parent_id: Option<String>,
    pub status: SnapshotStatus,
    pub is_current: bool,
    pub information: String,
    pub created_at: String,
    pub updated_at: String,
}

impl Snapshot {
    pub fn new(vm_id: &str, name: String, description: String, parent_id: Option<String>) -> Self {
        let now = timestamp();
        Self {
            id: Uuid::new_v4().to_string(),
            vm_id: vm_id.to_string(),
            name,
            description,
            parent_id,
            status: SnapshotStatus::Creating,
            is_current: false,
            information: String::new(),
            created_at: now.clone(),
            updated_at: now,
        }
    }
}

/// Reconciler correction derived from the hypervisor's snapshot list.
#[derive(Debug, Clone, PartialEq)]
pub struct SnapshotPatch {
    pub id: String,
    pub expected_status: SnapshotStatus,
    pub status: SnapshotStatus,
    pub is_current: bool,
    pub information: String,
}

/// Edits to one VM's chain, applied atomically.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ChainPatch {
    /// `(snapshot, new parent)` pairs.
    pub reparent: Vec<(String, Option<String>)>,
    /// Snapshots losing the current flag.
    pub clear_current: Vec<String>,
    /// Snapshot becoming current (and `running`).
    pub set_current: Option<String>,
    /// Snapshot record to remove.
    pub remove: Option<String>,
}

/// Arena of one VM's snapshots, ordered by creation time.
#[derive(Debug, Clone, Default)]
pub struct SnapshotChain {
    nodes: Vec<Snapshot>,
    index: HashMap<String, usize>,
}

impl SnapshotChain {
    pub fn new(mut snapshots: Vec<Snapshot>) -> Self {
        snapshots.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        let index = snapshots
            .iter()
            .enumerate()
            .map(|(i, s)| (s.id.clone(), i))
            .collect();
        Self {
            nodes: snapshots,
            index,
        }
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&Snapshot> {
        self.index.get(id).map(|&i| &self.nodes[i])
    }

    pub fn by_name(&self, name: &str) -> Option<&Snapshot> {
        self.nodes.iter().find(|s| s.name == name)
    }

    pub fn current(&self) -> Option<&Snapshot> {
        self.nodes.iter().find(|s| s.is_current)
    }

    pub fn children<'a>(&'a self, id: &'a str) -> impl Iterator<Item = &'a Snapshot> + 'a {
        self.nodes
            .iter()
            .filter(move |s| s.parent_id.as_deref() == Some(id))
    }

    /// First snapshot with an operation in flight, if any.
    pub fn in_flight(&self) -> Option<&Snapshot> {
        self.nodes.iter().find(|s| s.status.is_transitional())
    }

    pub fn iter(&self) -> impl Iterator<Item = &Snapshot> {
        self.nodes.iter()
    }

    pub fn into_vec(self) -> Vec<Snapshot> {
        self.nodes
    }

    /// Make `id` the only current snapshot.
    pub fn plan_make_current(&self, id: &str) -> ChainPatch {
        ChainPatch {
            clear_current: self
                .nodes
                .iter()
                .filter(|s| s.is_current && s.id != id)
                .map(|s| s.id.clone())
                .collect(),
            set_current: Some(id.to_string()),
            ..Default::default()
        }
    }

    /// Remove `id`, splicing its children onto its parent.
    ///
    /// If `id` was current, its parent inherits the flag when it exists and
    /// is `running`; otherwise the VM is left without a current snapshot.
    pub fn plan_delete(&self, id: &str) -> Option<ChainPatch> {
        let target = self.get(id)?;
        let parent = target.parent_id.as_deref().and_then(|p| self.get(p));

        let reparent = self
            .children(id)
            .map(|c| (c.id.clone(), target.parent_id.clone()))
            .collect();

        let set_current = match parent {
            Some(p) if target.is_current && p.status == SnapshotStatus::Running => {
                Some(p.id.clone())
            }
            _ => None,
        };

        Some(ChainPatch {
            reparent,
            clear_current: Vec::new(),
            set_current,
            remove: Some(id.to_string()),
        })
    }

    /// Apply a patch in memory. Mirrors what the store does in SQL.
    pub fn apply(&mut self, patch: &ChainPatch) {
        for (child, parent) in &patch.reparent {
            if let Some(&i) = self.index.get(child) {
                self.nodes[i].parent_id = parent.clone();
            }
        }
        for id in &patch.clear_current {
            if let Some(&i) = self.index.get(id) {
                self.nodes[i].is_current = false;
            }
        }
        if let Some(id) = &patch.set_current {
            if let Some(&i) = self.index.get(id) {
                self.nodes[i].is_current = true;
                self.nodes[i].status = SnapshotStatus::Running;
            }
        }
        if let Some(id) = &patch.remove {
            self.nodes.retain(|s| &s.id != id);
            self.index = self
                .nodes
                .iter()
                .enumerate()
                .map(|(i, s)| (s.id.clone(), i))
                .collect();
        }
    }

    /// Check the chain invariants, returning the first violation.
    pub fn validate(&self) -> Result<(), String> {
        let current: Vec<_> = self.nodes.iter().filter(|s| s.is_current).collect();
        if current.len() > 1 {
            return Err(format!("{} current snapshots", current.len()));
        }
        if let Some(c) = current.first() {
            if c.status != SnapshotStatus::Running {
                return Err(format!("current snapshot {} is {}", c.id, c.status));
            }
        }
        for s in &self.nodes {
            if let Some(parent) = &s.parent_id {
                if parent == &s.id {
                    return Err(format!("snapshot {} is its own parent", s.id));
                }
                if self.get(parent).is_none() {
                    return Err(format!("snapshot {} has dangling parent {parent}", s.id));
                }
            }
        }
        Ok(())
    }
}
