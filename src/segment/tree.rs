// Dynamic segment tree — tracks which byte ranges are assigned to which
// connection and supports splitting live segments to feed new or recycled
// connections.
//
// Nodes live in an arena (`Vec<SegmentNode>`) and reference each other by
// stable index, so parent back-references need no interior mutability. The
// left-to-right leaf order is kept in a separate vector that is patched on
// every split/collapse.

use tracing::debug;

use super::Segment;
use crate::config::MINIMUM_DOWNLOAD_SEGMENT_LENGTH;
use crate::error::EngineError;

/// Lifecycle of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SegmentStatus {
    /// Created, no worker assigned yet.
    Initial,
    /// A worker is actively downloading this segment.
    InUse,
    /// A refresh command targeting this leaf is in flight.
    RefreshRequested,
    /// A recycled worker is waiting to take this leaf over.
    ReuseRequested,
    /// Interior node; its work has been delegated to its children.
    OutDated,
    /// All bytes of this segment have been written to disk.
    Complete,
}

/// Stable arena index of a tree node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct NodeId(usize);

#[derive(Debug)]
pub struct SegmentNode {
    pub segment: Segment,
    pub parent: Option<NodeId>,
    pub left: Option<NodeId>,
    pub right: Option<NodeId>,
    pub connection_number: Option<u32>,
    pub status: SegmentStatus,
    pub last_update_millis: u64,
}

impl SegmentNode {
    pub fn is_leaf(&self) -> bool {
        self.left.is_none() && self.right.is_none()
    }
}

#[derive(Debug)]
pub struct SegmentTree {
    nodes: Vec<SegmentNode>,
    /// Leaf ids in ascending byte order.
    leaf_order: Vec<NodeId>,
    next_connection_number: u32,
}

impl SegmentTree {
    /// Build the initial tree for a download with `missing` byte ranges still
    /// to fetch.
    ///
    /// - No missing ranges: the tree is empty (assembly path).
    /// - One range covering the whole content: a root leaf is split rightmost
    ///   first until `total_connections` leaves exist (or a split refuses).
    /// - Several ranges (recovery): one leaf per range, no pre-splitting.
    pub fn build_from_missing_bytes(
        content_length: u64,
        total_connections: u32,
        missing: &[Segment],
        now_millis: u64,
    ) -> Self {
        let mut tree = Self {
            nodes: Vec::new(),
            leaf_order: Vec::new(),
            next_connection_number: 0,
        };

        if missing.is_empty() {
            return tree;
        }

        let whole = content_length > 0
            && missing.len() == 1
            && missing[0] == Segment::new(0, content_length - 1);

        if whole {
            let root = tree.push_leaf(missing[0], None, now_millis);
            tree.nodes[root.0].connection_number = Some(tree.alloc_connection_number());
            tree.leaf_order.push(root);

            while (tree.leaf_order.len() as u32) < total_connections {
                let rightmost = *tree.leaf_order.last().expect("non-empty leaf order");
                if !tree.split_segment_node(rightmost, true, now_millis) {
                    debug!(
                        "initial pre-split stopped at {} leaves (segment too small)",
                        tree.leaf_order.len()
                    );
                    break;
                }
                // The split node delegated its work immediately.
                tree.mark_out_dated(rightmost, now_millis);
            }
        } else {
            let mut ranges: Vec<Segment> = missing.to_vec();
            ranges.sort_by_key(|s| s.start);
            for range in ranges {
                let id = tree.push_leaf(range, None, now_millis);
                let conn = tree.alloc_connection_number();
                tree.nodes[id.0].connection_number = Some(conn);
                tree.leaf_order.push(id);
            }
        }

        tree
    }

    pub fn node(&self, id: NodeId) -> &SegmentNode {
        &self.nodes[id.0]
    }

    pub fn leaf_ids(&self) -> &[NodeId] {
        &self.leaf_order
    }

    pub fn leaf_count(&self) -> usize {
        self.leaf_order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.leaf_order.is_empty()
    }

    pub fn leaves_with_status(&self, status: SegmentStatus) -> Vec<NodeId> {
        self.leaf_order
            .iter()
            .copied()
            .filter(|id| self.nodes[id.0].status == status)
            .collect()
    }

    pub fn in_use_leaves(&self) -> Vec<NodeId> {
        self.leaves_with_status(SegmentStatus::InUse)
    }

    /// Leaves created but not yet picked up by a worker.
    pub fn in_queue_leaves(&self) -> Vec<NodeId> {
        self.leaves_with_status(SegmentStatus::Initial)
    }

    /// Whether any leaf has a refresh in flight.
    pub fn has_refresh_in_flight(&self) -> bool {
        self.leaf_order.iter().any(|id| {
            matches!(
                self.nodes[id.0].status,
                SegmentStatus::RefreshRequested | SegmentStatus::ReuseRequested
            )
        })
    }

    /// Whether every leaf has reached `Complete`.
    pub fn all_leaves_complete(&self) -> bool {
        !self.leaf_order.is_empty()
            && self
                .leaf_order
                .iter()
                .all(|id| self.nodes[id.0].status == SegmentStatus::Complete)
    }

    /// Locate the leaf whose segment equals `segment`.
    pub fn search(&self, segment: &Segment) -> Option<NodeId> {
        self.leaf_order
            .iter()
            .copied()
            .find(|id| self.nodes[id.0].segment == *segment)
    }

    /// Locate the leaf currently assigned to `connection_number`, preferring
    /// live statuses over completed ones.
    pub fn leaf_for_connection(&self, connection_number: u32) -> Option<NodeId> {
        let mut complete = None;
        for id in &self.leaf_order {
            let node = &self.nodes[id.0];
            if node.connection_number != Some(connection_number) {
                continue;
            }
            if node.status == SegmentStatus::Complete {
                complete = Some(*id);
            } else {
                return Some(*id);
            }
        }
        complete
    }

    /// Sum of completed-leaf lengths carrying `connection_number`. Seeds a
    /// respawned worker's progress accounting.
    pub fn completed_bytes_for_connection(&self, connection_number: u32) -> u64 {
        self.leaf_order
            .iter()
            .filter(|id| {
                let node = &self.nodes[id.0];
                node.connection_number == Some(connection_number)
                    && node.status == SegmentStatus::Complete
            })
            .map(|id| self.nodes[id.0].segment.length())
            .sum()
    }

    pub fn set_status(&mut self, id: NodeId, status: SegmentStatus, now_millis: u64) {
        let node = &mut self.nodes[id.0];
        node.status = status;
        node.last_update_millis = now_millis;
    }

    pub fn set_segment(&mut self, id: NodeId, segment: Segment) {
        self.nodes[id.0].segment = segment;
    }

    pub fn set_connection_number(&mut self, id: NodeId, connection_number: u32) {
        self.nodes[id.0].connection_number = Some(connection_number);
    }

    pub fn touch(&mut self, id: NodeId, now_millis: u64) {
        self.nodes[id.0].last_update_millis = now_millis;
    }

    /// Mark an interior node as delegated. Connection numbers live only on
    /// leaves, so the node's is cleared.
    pub fn mark_out_dated(&mut self, id: NodeId, now_millis: u64) {
        let node = &mut self.nodes[id.0];
        node.status = SegmentStatus::OutDated;
        node.connection_number = None;
        node.last_update_millis = now_millis;
    }

    /// Split the longest in-use leaf for the dynamic spawner. Returns the id
    /// of the split leaf (now an interior-in-waiting node with two children).
    pub fn split(&mut self, now_millis: u64) -> Result<NodeId, EngineError> {
        let target = self
            .leaf_order
            .iter()
            .copied()
            .filter(|id| self.nodes[id.0].status == SegmentStatus::InUse)
            .filter(|id| Self::splittable(&self.nodes[id.0].segment))
            .max_by_key(|id| self.nodes[id.0].segment.length())
            .ok_or(EngineError::SegmentTooSmall)?;

        if !self.split_segment_node(target, true, now_millis) {
            return Err(EngineError::SegmentTooSmall);
        }
        Ok(target)
    }

    /// Split `id` in half: left child `[s, mid]` inherits the connection
    /// number, right child `[mid+1, e]` gets a fresh one when
    /// `set_connection_number` is set (the reuse path assigns the recycled
    /// worker's number later instead).
    ///
    /// Returns `false` without touching the tree when the node is not a
    /// splittable leaf, already has a refresh in flight, or the right child
    /// would fall below the minimum segment length.
    pub fn split_segment_node(
        &mut self,
        id: NodeId,
        set_connection_number: bool,
        now_millis: u64,
    ) -> bool {
        let node = &self.nodes[id.0];
        if !node.is_leaf() {
            return false;
        }
        // A leaf with a refresh in flight rejects further refreshes until the
        // prior response arrives.
        if matches!(
            node.status,
            SegmentStatus::RefreshRequested
                | SegmentStatus::ReuseRequested
                | SegmentStatus::OutDated
                | SegmentStatus::Complete
        ) {
            return false;
        }
        let segment = node.segment;
        if !Self::splittable(&segment) {
            return false;
        }

        let mid = segment.start + (segment.end - segment.start) / 2;
        let left_segment = Segment::new(segment.start, mid);
        let right_segment = Segment::new(mid + 1, segment.end);

        let inherited = self.nodes[id.0].connection_number;
        let left = self.push_leaf(left_segment, Some(id), now_millis);
        self.nodes[left.0].connection_number = inherited;
        let right = self.push_leaf(right_segment, Some(id), now_millis);
        if set_connection_number {
            let conn = self.alloc_connection_number();
            self.nodes[right.0].connection_number = Some(conn);
        }

        let parent = &mut self.nodes[id.0];
        parent.left = Some(left);
        parent.right = Some(right);
        parent.last_update_millis = now_millis;

        let pos = self
            .leaf_order
            .iter()
            .position(|leaf| *leaf == id)
            .expect("split target present in leaf order");
        self.leaf_order.splice(pos..=pos, [left, right]);

        debug!(
            "split {} into {} / {}",
            segment, left_segment, right_segment
        );
        true
    }

    /// Undo an in-flight split after the worker refused it: the parent is
    /// reinstated as a leaf at its left child's position and both children are
    /// discarded.
    pub fn collapse(&mut self, parent: NodeId, now_millis: u64) -> Result<(), EngineError> {
        let (left, right) = {
            let node = &self.nodes[parent.0];
            match (node.left, node.right) {
                (Some(l), Some(r)) => (l, r),
                _ => {
                    return Err(EngineError::TreeInvariant(format!(
                        "collapse target {} has no children",
                        node.segment
                    )))
                }
            }
        };

        let pos = self
            .leaf_order
            .iter()
            .position(|id| *id == left)
            .ok_or_else(|| {
                EngineError::TreeInvariant("collapsed left child missing from leaf order".into())
            })?;
        self.leaf_order.splice(pos..=pos, [parent]);
        self.leaf_order.retain(|id| *id != right);

        let node = &mut self.nodes[parent.0];
        node.left = None;
        node.right = None;
        node.last_update_millis = now_millis;
        Ok(())
    }

    /// The oldest leaf by `last_update_millis` among `candidates`, excluding
    /// `excluded_segment` (a recycled worker never targets its own old range).
    pub fn oldest_leaf(
        &self,
        candidates: &[NodeId],
        excluded_segment: Option<&Segment>,
    ) -> Option<NodeId> {
        candidates
            .iter()
            .copied()
            .filter(|id| match excluded_segment {
                Some(seg) => self.nodes[id.0].segment != *seg,
                None => true,
            })
            .min_by_key(|id| self.nodes[id.0].last_update_millis)
    }

    fn splittable(segment: &Segment) -> bool {
        // The right child receives ceil(len/2) bytes; refuse when that would
        // undercut the minimum.
        segment.length() / 2 >= MINIMUM_DOWNLOAD_SEGMENT_LENGTH
    }

    fn alloc_connection_number(&mut self) -> u32 {
        let n = self.next_connection_number;
        self.next_connection_number += 1;
        n
    }

    fn push_leaf(&mut self, segment: Segment, parent: Option<NodeId>, now_millis: u64) -> NodeId {
        let id = NodeId(self.nodes.len());
        self.nodes.push(SegmentNode {
            segment,
            parent,
            left: None,
            right: None,
            connection_number: None,
            status: SegmentStatus::Initial,
            last_update_millis: now_millis,
        });
        id
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MIN: u64 = MINIMUM_DOWNLOAD_SEGMENT_LENGTH;

    #[test]
    fn test_split_boundary() {
        // Exactly twice the minimum splits; one byte less refuses.
        let mut tree = SegmentTree::build_from_missing_bytes(
            2 * MIN,
            1,
            &[Segment::new(0, 2 * MIN - 1)],
            0,
        );
        let root = tree.leaf_ids()[0];
        tree.set_status(root, SegmentStatus::InUse, 0);
        assert!(tree.split_segment_node(root, true, 1));
        assert_eq!(tree.leaf_count(), 2);

        let mut tree = SegmentTree::build_from_missing_bytes(
            2 * MIN - 1,
            1,
            &[Segment::new(0, 2 * MIN - 2)],
            0,
        );
        let root = tree.leaf_ids()[0];
        tree.set_status(root, SegmentStatus::InUse, 0);
        assert!(!tree.split_segment_node(root, true, 1));
        assert_eq!(tree.leaf_count(), 1);
    }

    #[test]
    fn test_double_refresh_rejected() {
        let mut tree =
            SegmentTree::build_from_missing_bytes(8 * MIN, 1, &[Segment::new(0, 8 * MIN - 1)], 0);
        let root = tree.leaf_ids()[0];
        tree.set_status(root, SegmentStatus::RefreshRequested, 0);
        assert!(!tree.split_segment_node(root, true, 1));
    }

    #[test]
    fn test_collapse_restores_parent() {
        let mut tree =
            SegmentTree::build_from_missing_bytes(8 * MIN, 1, &[Segment::new(0, 8 * MIN - 1)], 0);
        let root = tree.leaf_ids()[0];
        tree.set_status(root, SegmentStatus::InUse, 0);
        assert!(tree.split_segment_node(root, false, 1));
        assert_eq!(tree.leaf_count(), 2);

        tree.collapse(root, 2).unwrap();
        assert_eq!(tree.leaf_count(), 1);
        assert_eq!(tree.leaf_ids()[0], root);
        assert!(tree.node(root).is_leaf());
    }
}
