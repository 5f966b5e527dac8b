//! Fleet chunk-version negotiation over the shared milestone document.
//!
//! Every connection check advertises this node's supported range,
//! intersects the ranges of the whole fleet, and refuses to talk to a
//! remote whose surviving range excludes our current format, or which is
//! locked against us.

use std::sync::Arc;
use std::sync::atomic::Ordering;

use thiserror::Error;

use crate::db::{DatabaseHandle, DbError, PutMode};
use crate::model::{ChunkVersionRange, DocId, EntryDoc, MILESTONE_DOC_ID, MilestoneDoc};

use super::{Engine, lock, now_ms};

/// Chunk-format versions this build can read and write.
pub const NODE_VERSION_RANGE: ChunkVersionRange = ChunkVersionRange {
    min: 0,
    max: 2,
    current: 2,
};

#[derive(Debug, Error)]
pub enum MilestoneError {
    #[error("chunk format version {version} is outside the fleet range {min}..={max}")]
    VersionOutOfRange { version: i32, min: i32, max: i32 },
    #[error(
        "remote database is locked and this replica is not accepted; unlock the remote or rebuild this replica"
    )]
    RemoteLocked,
    #[error("node identity is not established")]
    NoNodeIdentity,
    #[error("cannot connect to the remote database: {0}")]
    Connect(String),
    #[error(transparent)]
    Db(#[from] DbError),
}

/// Intersection of the advertised ranges across the fleet.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct FleetRange {
    pub min: i32,
    pub max: i32,
}

impl FleetRange {
    pub fn admits(&self, version: i32) -> bool {
        version >= self.min && version <= self.max
    }
}

/// Outcome of a successful connection check.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MilestoneCheck {
    pub range: FleetRange,
    pub locked: bool,
    pub accepted: bool,
}

impl Engine {
    /// Run the connection check against `remote`: publish our range if it
    /// changed, intersect the fleet, enforce compatibility and the lock.
    pub fn negotiate_milestone(
        &self,
        remote: &Arc<dyn DatabaseHandle>,
    ) -> Result<MilestoneCheck, MilestoneError> {
        let node_id = self.node_id().ok_or(MilestoneError::NoNodeIdentity)?;

        let mut doc = fetch_or_default(remote)?;
        let ours = doc.node_chunk_info.get(&node_id);
        let needs_update = match ours {
            Some(range) => {
                range.min != NODE_VERSION_RANGE.min || range.max != NODE_VERSION_RANGE.max
            }
            None => true,
        };
        if needs_update {
            doc.node_chunk_info
                .insert(node_id.clone(), NODE_VERSION_RANGE);
            doc = write_milestone(remote, &doc)?;
            tracing::info!(
                node = %node_id,
                min = NODE_VERSION_RANGE.min,
                max = NODE_VERSION_RANGE.max,
                "published chunk version range"
            );
        }

        let range = fleet_range(&doc);
        let accepted = doc.accepted_nodes.contains(&node_id);
        let locked = doc.locked;
        *lock(&self.shared.milestone) = Some(doc);

        let current = NODE_VERSION_RANGE.current;
        if current >= 0 && !range.admits(current) && !self.settings.ignore_version_check {
            tracing::warn!(
                version = current,
                fleet_min = range.min,
                fleet_max = range.max,
                "chunk format incompatible with the fleet"
            );
            return Err(MilestoneError::VersionOutOfRange {
                version: current,
                min: range.min,
                max: range.max,
            });
        }

        self.shared.remote_locked.store(locked, Ordering::Release);
        if locked && !accepted {
            self.shared
                .remote_locked_and_not_accepted
                .store(true, Ordering::Release);
            return Err(MilestoneError::RemoteLocked);
        }
        self.shared
            .remote_locked_and_not_accepted
            .store(false, Ordering::Release);

        Ok(MilestoneCheck {
            range,
            locked,
            accepted,
        })
    }

    /// Set or clear the fleet lock, making this node the only accepted
    /// one.
    pub fn mark_remote_locked(&self, locked: bool) -> Result<(), MilestoneError> {
        let node_id = self.node_id().ok_or(MilestoneError::NoNodeIdentity)?;
        let remote = self.connect_remote_db().map_err(MilestoneError::Connect)?;

        let mut doc = fetch_or_default(&remote)?;
        doc.locked = locked;
        doc.accepted_nodes = std::iter::once(node_id.clone()).collect();
        let doc = write_milestone(&remote, &doc)?;
        tracing::info!(node = %node_id, locked, "milestone lock updated");
        *lock(&self.shared.milestone) = Some(doc);
        Ok(())
    }

    /// Mark this node as having resolved the condition behind the lock.
    pub fn mark_remote_resolved(&self) -> Result<(), MilestoneError> {
        let node_id = self.node_id().ok_or(MilestoneError::NoNodeIdentity)?;
        let remote = self.connect_remote_db().map_err(MilestoneError::Connect)?;

        let mut doc = fetch_or_default(&remote)?;
        doc.accepted_nodes.insert(node_id.clone());
        let doc = write_milestone(&remote, &doc)?;
        tracing::info!(node = %node_id, "marked resolved on the milestone");
        self.shared
            .remote_locked_and_not_accepted
            .store(false, Ordering::Release);
        *lock(&self.shared.milestone) = Some(doc);
        Ok(())
    }

    /// Whether the whole fleet, as last observed, can run chunk format
    /// `version`. Without a milestone snapshot the answer is no.
    pub fn is_version_upgradable(&self, version: i32) -> bool {
        let snapshot = lock(&self.shared.milestone).clone();
        match snapshot {
            Some(doc) => fleet_range(&doc).admits(version),
            None => false,
        }
    }
}

fn fetch_or_default(remote: &Arc<dyn DatabaseHandle>) -> Result<MilestoneDoc, MilestoneError> {
    match remote.get(&DocId::from(MILESTONE_DOC_ID)) {
        Ok(EntryDoc::Milestone(doc)) => Ok(doc),
        Ok(_) => Ok(MilestoneDoc::new(now_ms())),
        Err(err) if err.is_not_found() => Ok(MilestoneDoc::new(now_ms())),
        Err(err) => Err(err.into()),
    }
}

fn write_milestone(
    remote: &Arc<dyn DatabaseHandle>,
    doc: &MilestoneDoc,
) -> Result<MilestoneDoc, MilestoneError> {
    let revision = remote.put(&EntryDoc::Milestone(doc.clone()), PutMode::Force)?;
    let mut updated = doc.clone();
    updated.rev = Some(revision.rev);
    Ok(updated)
}

/// Intersect every advertised range. A node listed as accepted but absent
/// from the chunk info pins the fleet to version 0 (unknown peer).
fn fleet_range(doc: &MilestoneDoc) -> FleetRange {
    let mut min = 0;
    let mut max = i32::MAX;
    for range in doc.node_chunk_info.values() {
        min = min.max(range.min);
        max = max.min(range.max);
    }
    for node in &doc.accepted_nodes {
        if !doc.node_chunk_info.contains_key(node) {
            max = max.min(0);
        }
    }
    FleetRange { min, max }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn milestone(info: &[(&str, i32, i32)], accepted: &[&str]) -> MilestoneDoc {
        let mut doc = MilestoneDoc::new(1);
        for (node, min, max) in info {
            doc.node_chunk_info.insert(
                node.to_string(),
                ChunkVersionRange {
                    min: *min,
                    max: *max,
                    current: *max,
                },
            );
        }
        doc.accepted_nodes = accepted.iter().map(|node| node.to_string()).collect();
        doc
    }

    #[test]
    fn fleet_range_intersects_advertised_ranges() {
        let doc = milestone(&[("a", 0, 2), ("b", 1, 4)], &["a", "b"]);
        assert_eq!(fleet_range(&doc), FleetRange { min: 1, max: 2 });
    }

    #[test]
    fn accepted_node_without_info_pins_the_fleet_to_zero() {
        let doc = milestone(&[("a", 0, 2)], &["a", "ghost"]);
        let range = fleet_range(&doc);
        assert_eq!(range.max, 0);
        assert!(!range.admits(NODE_VERSION_RANGE.current));
    }

    #[test]
    fn disjoint_ranges_admit_nothing() {
        let doc = milestone(&[("a", 0, 2), ("b", 3, 4)], &[]);
        let range = fleet_range(&doc);
        assert!(range.max < range.min);
        assert!(!range.admits(2));
        assert!(!range.admits(3));
    }
}
