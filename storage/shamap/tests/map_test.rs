// Copyright (c) The Meridian Network Contributors
// SPDX-License-Identifier: Apache-2.0

use meridian_crypto::{content_hash, sha512_half, Hash256, HashPrefix};
use meridian_shamap::{Item, LeafKind, MapType, SHAMap};
use proptest::prelude::*;

fn tag(hex: &str) -> Hash256 {
    Hash256::from_hex(hex).unwrap()
}

/// Deterministic item: tag derived from a seed, data derived from the tag.
fn seeded_item(seed: u64) -> Item {
    let tag = content_hash(&seed.to_be_bytes());
    Item::new(tag, tag.as_bytes()[..12].to_vec())
}

fn map_of(seeds: &[u64]) -> SHAMap {
    let mut map = SHAMap::new(MapType::Free);
    for &seed in seeds {
        assert!(map.add(seeded_item(seed), LeafKind::AccountState).unwrap());
    }
    map
}

#[test]
fn empty_map_has_zero_root() {
    let map = SHAMap::new(MapType::Free);
    assert!(map.root_hash().is_zero());
}

#[test]
fn single_leaf_sits_at_the_root() {
    // A one-item map's root hash is the leaf hash itself:
    // sha512_half(LEAF_NODE ‖ tag ‖ vl(data)).
    let t = tag("092891fe4ef6cee585fdc6fda0e09eb4d386363158ec3321b8123e5a772c6ca7");
    let data = [0x5A; 32];
    let mut map = SHAMap::new(MapType::Free);
    assert!(map
        .add(Item::new(t, data.to_vec()), LeafKind::AccountState)
        .unwrap());

    let expected = sha512_half(
        HashPrefix::LeafNode,
        &[t.as_bytes(), &32u16.to_be_bytes(), &data],
    );
    assert_eq!(map.root_hash(), expected);
}

#[test]
fn duplicate_add_is_rejected() {
    let mut map = map_of(&[1, 2, 3]);
    let before = map.root_hash();
    assert!(!map.add(seeded_item(2), LeafKind::AccountState).unwrap());
    assert_eq!(map.root_hash(), before);
}

#[test]
fn get_returns_exactly_what_was_added() {
    let map = map_of(&[10, 20, 30]);
    let item = seeded_item(20);
    let got = map.get(item.tag()).unwrap().unwrap();
    assert_eq!(got.data(), item.data());
    assert!(map.get(&Hash256::new([0xEE; 32])).unwrap().is_none());
}

#[test]
fn update_changes_root_and_data() {
    let mut map = map_of(&[1, 2]);
    let before = map.root_hash();
    let target = seeded_item(1);
    assert!(map
        .update(
            Item::new(*target.tag(), b"replacement".to_vec()),
            LeafKind::AccountState
        )
        .unwrap());
    assert_ne!(map.root_hash(), before);
    assert_eq!(
        map.get(target.tag()).unwrap().unwrap().data(),
        b"replacement"
    );
    // Updating an absent tag reports failure.
    assert!(!map
        .update(
            Item::new(Hash256::new([0xCD; 32]), vec![1]),
            LeafKind::AccountState
        )
        .unwrap());
}

#[test]
fn in_order_traversal() {
    // Adapted from the original tree test: insertion order must not matter
    // to traversal order, including across a delete.
    let h1 = tag("092891fe4ef6cee585fdc6fda0e09eb4d386363158ec3321b8123e5a772c6ca7");
    let h2 = tag("436ccbac3347baa1f1e53baeef1f43334da88f1f6d70d963b833afd6dfa289fe");
    let h3 = tag("b92891fe4ef6cee585fdc6fda1e09eb4d386363158ec3321b8123e5a772c6ca8");
    let h4 = tag("b92891fe4ef6cee585fdc6fda2e09eb4d386363158ec3321b8123e5a772c6ca8");

    let mut map = SHAMap::new(MapType::Free);
    for h in [h2, h1].iter() {
        map.add(Item::new(*h, vec![1]), LeafKind::AccountState)
            .unwrap();
    }
    let first = map.first().unwrap().unwrap();
    assert_eq!(first.tag(), &h1);
    let second = map.next(first.tag()).unwrap().unwrap();
    assert_eq!(second.tag(), &h2);
    assert!(map.next(second.tag()).unwrap().is_none());

    map.add(Item::new(h4, vec![4]), LeafKind::AccountState)
        .unwrap();
    map.delete(&h2).unwrap();
    map.add(Item::new(h3, vec![3]), LeafKind::AccountState)
        .unwrap();

    let order: Vec<Hash256> = {
        let mut out = Vec::new();
        let mut cursor = map.first().unwrap();
        while let Some(item) = cursor {
            out.push(*item.tag());
            cursor = map.next(item.tag()).unwrap();
        }
        out
    };
    assert_eq!(order, vec![h1, h3, h4]);

    let last = map.last().unwrap().unwrap();
    assert_eq!(last.tag(), &h4);
    assert_eq!(map.prev(&h4).unwrap().unwrap().tag(), &h3);
    assert!(map.prev(&h1).unwrap().is_none());
}

#[test]
fn snapshot_is_isolated_from_later_mutation() {
    let mut map = map_of(&[1, 2, 3, 4, 5]);
    let before = map.root_hash();
    let snapshot = map.snapshot(false);
    assert_eq!(snapshot.root_hash(), before);

    let first = map.first().unwrap().unwrap();
    assert!(map.delete(first.tag()).unwrap());
    assert_ne!(map.root_hash(), before);
    assert_eq!(snapshot.root_hash(), before);
    // The snapshot still reads the deleted item.
    assert!(snapshot.get(first.tag()).unwrap().is_some());
}

#[test]
fn mutable_snapshot_diverges_without_touching_original() {
    let mut map = map_of(&[1, 2, 3]);
    let before = map.root_hash();
    let mut branch = map.snapshot(true);
    branch
        .add(seeded_item(99), LeafKind::AccountState)
        .unwrap();
    assert_ne!(branch.root_hash(), before);
    assert_eq!(map.root_hash(), before);
}

#[test]
fn immutable_map_rejects_mutation() {
    let mut map = map_of(&[1]);
    map.set_immutable();
    assert!(map.add(seeded_item(2), LeafKind::AccountState).is_err());
    assert!(map.delete(seeded_item(1).tag()).is_err());
}

#[test]
fn two_leaf_deep_divergence_builds_inner_chain() {
    // Tags sharing their first 18 nibbles force a chain of 19 inner nodes
    // (depths 0..=18) over two depth-19 leaves.
    let a = tag("b92891fe4ef6cee5850000000000000000000000000000000000000000000001");
    let b = tag("b92891fe4ef6cee5858000000000000000000000000000000000000000000002");
    let mut map = SHAMap::new(MapType::Free);
    map.add(Item::new(a, vec![1]), LeafKind::AccountState)
        .unwrap();
    map.add(Item::new(b, vec![2]), LeafKind::AccountState)
        .unwrap();

    let path = map
        .get_path(&a, meridian_shamap::NodeFormat::Wire)
        .unwrap()
        .unwrap();
    assert_eq!(path.len(), 20, "19 inner nodes plus the leaf");

    // Deleting one collapses the whole chain back to a root leaf.
    map.delete(&b).unwrap();
    let expected = sha512_half(HashPrefix::LeafNode, &[a.as_bytes(), &1u16.to_be_bytes(), &[1]]);
    assert_eq!(map.root_hash(), expected);
}

#[test]
fn trusted_path_checks_out() {
    let map = map_of(&[1, 2, 3, 4, 5, 6, 7, 8]);
    let root = map.root_hash();
    let target = seeded_item(5);
    let path = map
        .get_path(target.tag(), meridian_shamap::NodeFormat::Wire)
        .unwrap()
        .unwrap();
    assert!(meridian_shamap::check_path(&root, target.tag(), &path));
    // Wrong root or wrong tag must fail.
    assert!(!meridian_shamap::check_path(
        &Hash256::new([1; 32]),
        target.tag(),
        &path
    ));
    assert!(!meridian_shamap::check_path(
        &root,
        seeded_item(6).tag(),
        &path
    ));
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(64))]

    /// Property: the root hash is a function of the item set, not of
    /// insertion order.
    #[test]
    fn root_hash_is_order_independent(mut seeds in prop::collection::hash_set(0u64..10_000, 1..48)) {
        let seeds: Vec<u64> = seeds.drain().collect();
        let forward = map_of(&seeds);
        let mut reversed: Vec<u64> = seeds.clone();
        reversed.reverse();
        let backward = map_of(&reversed);
        prop_assert_eq!(forward.root_hash(), backward.root_hash());
        prop_assert!(forward.deep_compare(&backward).unwrap());
    }

    /// Property: add then delete returns the root hash to its prior value.
    #[test]
    fn delete_is_inverse_of_add(
        seeds in prop::collection::hash_set(0u64..10_000, 1..32),
        extra in 10_000u64..20_000,
    ) {
        let seeds: Vec<u64> = seeds.iter().copied().collect();
        let mut map = map_of(&seeds);
        let before = map.root_hash();
        let item = seeded_item(extra);
        prop_assert!(map.add(item.clone(), LeafKind::AccountState).unwrap());
        prop_assert_ne!(map.root_hash(), before);
        prop_assert!(map.delete(item.tag()).unwrap());
        prop_assert_eq!(map.root_hash(), before);
    }

    /// Property: a snapshot's root hash survives any mutation sequence on
    /// the original.
    #[test]
    fn snapshot_isolation(
        seeds in prop::collection::hash_set(0u64..10_000, 1..32),
        churn in prop::collection::vec(10_000u64..20_000, 1..16),
    ) {
        let seeds: Vec<u64> = seeds.iter().copied().collect();
        let mut map = map_of(&seeds);
        let frozen = map.snapshot(false);
        let before = frozen.root_hash();
        for &seed in &churn {
            map.add(seeded_item(seed), LeafKind::AccountState).unwrap();
        }
        for &seed in &seeds {
            map.delete(seeded_item(seed).tag()).unwrap();
        }
        prop_assert_eq!(frozen.root_hash(), before);
    }
}
