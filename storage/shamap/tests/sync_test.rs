// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_crypto::{content_hash, Hash256};
use meridian_shamap::{
    AddResult, Item, LeafKind, MapState, MapType, NodeFormat, NodeId, NullFilter, SHAMap,
};

fn seeded_item(seed: u64) -> Item {
    let tag = content_hash(&seed.to_be_bytes());
    Item::new(tag, tag.as_bytes()[..16].to_vec())
}

fn source_of(count: u64) -> SHAMap {
    let mut map = SHAMap::new(MapType::Free);
    for seed in 0..count {
        map.add(seeded_item(seed), LeafKind::AccountState).unwrap();
    }
    // Churn: adding and removing extra items must not change the result.
    for seed in 10_000..10_100u64 {
        map.add(seeded_item(seed), LeafKind::AccountState).unwrap();
    }
    for seed in 10_000..10_100u64 {
        map.delete(seeded_item(seed).tag()).unwrap();
    }
    map.set_immutable();
    map
}

/// Drives a full sync from `source` into a fresh destination, dropping any
/// response whose index satisfies `drop`, and processing each round's
/// responses in reverse arrival order. Returns (destination, rounds).
fn run_sync(source: &SHAMap, drop: &dyn Fn(usize) -> bool) -> (SHAMap, usize) {
    let mut destination = SHAMap::new_synching(MapType::Free, source.root_hash());

    let root = source.get_root_node(NodeFormat::Wire);
    let result = destination.add_root_node(
        Some(&source.root_hash()),
        &root,
        NodeFormat::Wire,
        &NullFilter,
    );
    assert!(!result.is_invalid());

    let mut rounds = 0;
    let mut response_counter = 0usize;
    loop {
        rounds += 1;
        assert!(rounds < 10_000, "sync does not converge");
        let missing = destination.get_missing_nodes(16, &NullFilter).unwrap();
        if missing.is_empty() {
            break;
        }
        let mut responses = Vec::new();
        for (id, _hash) in &missing {
            let fat = source
                .get_node_fat(id, rounds % 2 == 0, rounds % 3 == 0)
                .unwrap();
            assert!(!fat.is_empty(), "source must serve nodes it advertised");
            response_counter += 1;
            if !drop(response_counter) {
                responses.push(fat);
            }
        }
        // Whole responses may arrive in any order.
        responses.reverse();
        let mut combined = AddResult::okay();
        for fat in responses {
            for (id, bytes) in fat {
                if id.is_root() {
                    continue;
                }
                let result = destination
                    .add_known_node(&id, &bytes, &NullFilter)
                    .unwrap();
                combined.combine(result);
            }
        }
        assert!(!combined.is_invalid(), "well-formed responses never read as invalid");
    }
    (destination, rounds)
}

#[test]
fn empty_sync_completes_immediately() {
    // S1: source empty, destination learns the zero root and is done.
    let mut source = SHAMap::new(MapType::Free);
    source.set_immutable();
    let mut destination = SHAMap::new_synching(MapType::Free, Hash256::zero());

    let root = source.get_root_node(NodeFormat::Wire);
    let result = destination.add_root_node(None, &root, NodeFormat::Wire, &NullFilter);
    assert!(result.is_useful());
    assert!(destination
        .get_missing_nodes(16, &NullFilter)
        .unwrap()
        .is_empty());
    assert_eq!(destination.state(), MapState::Immutable);
    assert!(source.deep_compare(&destination).unwrap());
}

#[test]
fn single_item_sync_needs_only_the_root() {
    // S2: the lone leaf is the root; no further nodes are requested.
    let mut source = SHAMap::new(MapType::Free);
    source
        .add(seeded_item(7), LeafKind::AccountState)
        .unwrap();
    source.set_immutable();

    let mut destination = SHAMap::new_synching(MapType::Free, source.root_hash());
    let fat = source.get_node_fat(&NodeId::root(), false, false).unwrap();
    assert_eq!(fat.len(), 1);
    let result =
        destination.add_root_node(None, &fat[0].1, NodeFormat::Wire, &NullFilter);
    assert!(result.is_useful());
    assert!(destination
        .get_missing_nodes(16, &NullFilter)
        .unwrap()
        .is_empty());
    assert_eq!(destination.state(), MapState::Immutable);
    assert!(source.deep_compare(&destination).unwrap());
}

#[test]
fn deep_divergence_requests_the_inner_chain() {
    // S3: two leaves under 19 stacked inner nodes; the destination asks for
    // exactly one deeper inner node per round until it reaches the leaves.
    let a = Hash256::from_hex("b92891fe4ef6cee5850000000000000000000000000000000000000000000001")
        .unwrap();
    let b = Hash256::from_hex("b92891fe4ef6cee5858000000000000000000000000000000000000000000002")
        .unwrap();
    let mut source = SHAMap::new(MapType::Free);
    source.add(Item::new(a, vec![1]), LeafKind::AccountState).unwrap();
    source.add(Item::new(b, vec![2]), LeafKind::AccountState).unwrap();
    source.set_immutable();

    let mut destination = SHAMap::new_synching(MapType::Free, source.root_hash());
    let root = source.get_root_node(NodeFormat::Wire);
    destination.add_root_node(None, &root, NodeFormat::Wire, &NullFilter);

    let mut last_depth = 0u8;
    loop {
        let missing = destination.get_missing_nodes(16, &NullFilter).unwrap();
        if missing.is_empty() {
            break;
        }
        // Every request lies on the shared-prefix chain and goes strictly
        // deeper: one inner node per round (fat responses carry its single
        // child too), until the divergence node hands over both leaves.
        assert!(missing.len() <= 2);
        for (id, _hash) in &missing {
            assert!(id.depth() > last_depth);
            assert!(id.contains(&a) || id.contains(&b));
        }
        last_depth = missing[0].0.depth();

        for (id, _hash) in &missing {
            for (got_id, bytes) in source.get_node_fat(id, true, true).unwrap() {
                if got_id.is_root() {
                    continue;
                }
                let result = destination
                    .add_known_node(&got_id, &bytes, &NullFilter)
                    .unwrap();
                assert!(!result.is_invalid());
            }
        }
    }
    assert!(source.deep_compare(&destination).unwrap());
    assert_eq!(last_depth, 19, "the request walk reached the leaves");
}

#[test]
fn lossless_sync_converges() {
    let source = source_of(300);
    let (destination, _) = run_sync(&source, &|_| false);
    assert!(source.deep_compare(&destination).unwrap());
    assert_eq!(destination.root_hash(), source.root_hash());
}

#[test]
fn sync_survives_dropped_and_reordered_responses() {
    let source = source_of(200);
    // Drop roughly a third of all responses; they are simply re-requested.
    let (destination, rounds) = run_sync(&source, &|i| i % 3 == 0);
    assert!(source.deep_compare(&destination).unwrap());
    assert!(rounds > 1);
}

#[test]
fn corrupt_node_is_rejected_without_installing() {
    let source = source_of(50);
    let mut destination = SHAMap::new_synching(MapType::Free, source.root_hash());
    let root = source.get_root_node(NodeFormat::Wire);
    destination.add_root_node(None, &root, NodeFormat::Wire, &NullFilter);

    let missing = destination.get_missing_nodes(4, &NullFilter).unwrap();
    assert!(!missing.is_empty());
    let (id, _hash) = missing[0];
    let fat = source.get_node_fat(&id, true, true).unwrap();
    let (got_id, mut bytes) = fat[0].clone();
    // Flip one byte: the node no longer hashes to the parent's child hash.
    bytes[0] ^= 0xFF;
    let result = destination
        .add_known_node(&got_id, &bytes, &NullFilter)
        .unwrap();
    assert!(result.is_invalid());

    // The genuine bytes still install fine afterwards.
    let result = destination
        .add_known_node(&got_id, &fat[0].1, &NullFilter)
        .unwrap();
    assert!(result.is_useful());
}

#[test]
fn wrong_root_is_invalid() {
    let source = source_of(5);
    let mut destination = SHAMap::new_synching(MapType::Free, Hash256::new([0xAA; 32]));
    let root = source.get_root_node(NodeFormat::Wire);
    let result = destination.add_root_node(None, &root, NodeFormat::Wire, &NullFilter);
    assert!(result.is_invalid());
}
