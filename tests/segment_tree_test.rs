// Segment tree invariants: build shapes, split/collapse bookkeeping, and
// leaf queries.

use rapidget_engine::config::MINIMUM_DOWNLOAD_SEGMENT_LENGTH;
use rapidget_engine::segment::tree::{SegmentStatus, SegmentTree};
use rapidget_engine::segment::Segment;

const MIN: u64 = MINIMUM_DOWNLOAD_SEGMENT_LENGTH;

fn assert_leaves_partition(tree: &SegmentTree, expected: Segment) {
    let mut segments: Vec<Segment> = tree
        .leaf_ids()
        .iter()
        .map(|id| tree.node(*id).segment)
        .collect();
    segments.sort_by_key(|s| s.start);

    // Pairwise non-overlapping and gap-free.
    for pair in segments.windows(2) {
        assert!(!pair[0].overlaps(&pair[1]), "{} overlaps {}", pair[0], pair[1]);
        assert_eq!(pair[0].end + 1, pair[1].start, "gap after {}", pair[0]);
    }
    assert_eq!(segments.first().unwrap().start, expected.start);
    assert_eq!(segments.last().unwrap().end, expected.end);
}

#[test]
fn test_build_whole_file_covers_range_with_n_parts() {
    let content = 8 * MIN;
    let tree =
        SegmentTree::build_from_missing_bytes(content, 4, &[Segment::new(0, content - 1)], 0);

    assert_eq!(tree.leaf_count(), 4);
    assert_leaves_partition(&tree, Segment::new(0, content - 1));

    // Distinct connection numbers 0..4, all leaves INITIAL.
    let mut numbers: Vec<u32> = tree
        .leaf_ids()
        .iter()
        .map(|id| tree.node(*id).connection_number.unwrap())
        .collect();
    numbers.sort_unstable();
    assert_eq!(numbers, vec![0, 1, 2, 3]);
    for id in tree.leaf_ids() {
        assert_eq!(tree.node(*id).status, SegmentStatus::Initial);
    }
}

#[test]
fn test_build_stops_splitting_at_minimum_length() {
    // 3×MIN cannot be cut into 4 pieces of at least MIN each.
    let content = 3 * MIN;
    let tree =
        SegmentTree::build_from_missing_bytes(content, 4, &[Segment::new(0, content - 1)], 0);
    assert!(tree.leaf_count() < 4);
    assert_leaves_partition(&tree, Segment::new(0, content - 1));
}

#[test]
fn test_build_empty_missing_is_empty_tree() {
    let tree = SegmentTree::build_from_missing_bytes(10 * MIN, 4, &[], 0);
    assert!(tree.is_empty());
    assert_eq!(tree.leaf_count(), 0);
}

#[test]
fn test_build_recovery_one_leaf_per_range() {
    let ranges = [Segment::new(MIN, 2 * MIN), Segment::new(5 * MIN, 6 * MIN)];
    let tree = SegmentTree::build_from_missing_bytes(8 * MIN, 4, &ranges, 0);

    assert_eq!(tree.leaf_count(), 2);
    let segments: Vec<Segment> = tree
        .leaf_ids()
        .iter()
        .map(|id| tree.node(*id).segment)
        .collect();
    assert_eq!(segments, ranges);
    // Connection numbers count up from zero.
    assert_eq!(tree.node(tree.leaf_ids()[0]).connection_number, Some(0));
    assert_eq!(tree.node(tree.leaf_ids()[1]).connection_number, Some(1));
}

#[test]
fn test_split_picks_longest_leaf_and_adds_one() {
    let content = 16 * MIN;
    let mut tree =
        SegmentTree::build_from_missing_bytes(content, 2, &[Segment::new(0, content - 1)], 0);
    for id in tree.leaf_ids().to_vec() {
        tree.set_status(id, SegmentStatus::InUse, 0);
    }
    let before = tree.leaf_count();

    let parent = tree.split(1).unwrap();
    assert_eq!(tree.leaf_count(), before + 1);

    // Left child inherits the parent's connection number; right gets a new one.
    let left = tree.node(parent).left.unwrap();
    let right = tree.node(parent).right.unwrap();
    assert_eq!(
        tree.node(left).connection_number,
        tree.node(parent).connection_number
    );
    assert!(tree.node(right).connection_number.is_some());
    assert_ne!(
        tree.node(left).connection_number,
        tree.node(right).connection_number
    );
    assert_leaves_partition(&tree, Segment::new(0, content - 1));
}

#[test]
fn test_split_refuses_when_all_leaves_too_small() {
    let content = 2 * MIN - 2;
    let mut tree =
        SegmentTree::build_from_missing_bytes(content, 1, &[Segment::new(0, content - 1)], 0);
    let root = tree.leaf_ids()[0];
    tree.set_status(root, SegmentStatus::InUse, 0);
    assert!(tree.split(1).is_err());
    assert_eq!(tree.leaf_count(), 1);
}

#[test]
fn test_refusal_collapse_reinstates_parent() {
    let content = 8 * MIN;
    let mut tree =
        SegmentTree::build_from_missing_bytes(content, 1, &[Segment::new(0, content - 1)], 0);
    let root = tree.leaf_ids()[0];
    tree.set_status(root, SegmentStatus::InUse, 0);

    assert!(tree.split_segment_node(root, false, 1));
    let after_split = tree.leaf_count();
    assert_eq!(after_split, 2);

    // The worker refused: collapse and reinstate.
    tree.collapse(root, 2).unwrap();
    tree.set_status(root, SegmentStatus::InUse, 2);
    assert_eq!(tree.leaf_count(), after_split - 1);
    assert_eq!(tree.node(root).segment, Segment::new(0, content - 1));
    assert!(tree.node(root).is_leaf());
    assert_leaves_partition(&tree, Segment::new(0, content - 1));
}

#[test]
fn test_search_finds_exact_leaf() {
    let content = 8 * MIN;
    let tree =
        SegmentTree::build_from_missing_bytes(content, 4, &[Segment::new(0, content - 1)], 0);
    let target = tree.node(tree.leaf_ids()[2]).segment;
    assert_eq!(tree.search(&target), Some(tree.leaf_ids()[2]));
    assert_eq!(tree.search(&Segment::new(1, 2)), None);
}

#[test]
fn test_refresh_in_flight_blocks_further_splits() {
    let content = 8 * MIN;
    let mut tree =
        SegmentTree::build_from_missing_bytes(content, 2, &[Segment::new(0, content - 1)], 0);
    let first = tree.leaf_ids()[0];
    tree.set_status(first, SegmentStatus::RefreshRequested, 1);

    assert!(tree.has_refresh_in_flight());
    // A leaf with a refresh in flight rejects another split.
    assert!(!tree.split_segment_node(first, true, 2));
}

#[test]
fn test_oldest_leaf_excludes_own_segment() {
    let content = 8 * MIN;
    let mut tree =
        SegmentTree::build_from_missing_bytes(content, 2, &[Segment::new(0, content - 1)], 0);
    let ids = tree.leaf_ids().to_vec();
    tree.set_status(ids[0], SegmentStatus::InUse, 10);
    tree.set_status(ids[1], SegmentStatus::InUse, 20);

    let older = tree.node(ids[0]).segment;
    // Without exclusion the older leaf wins; excluding it yields the other.
    assert_eq!(tree.oldest_leaf(&ids, None), Some(ids[0]));
    assert_eq!(tree.oldest_leaf(&ids, Some(&older)), Some(ids[1]));
}

#[test]
fn test_completed_bytes_for_connection() {
    let content = 8 * MIN;
    let mut tree =
        SegmentTree::build_from_missing_bytes(content, 4, &[Segment::new(0, content - 1)], 0);
    let first = tree.leaf_ids()[0];
    let length = tree.node(first).segment.length();
    tree.set_status(first, SegmentStatus::Complete, 1);

    assert_eq!(tree.completed_bytes_for_connection(0), length);
    assert_eq!(tree.completed_bytes_for_connection(1), 0);
}
