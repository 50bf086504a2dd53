//! Tree-level properties: determinism, order independence, persistence,
//! diff soundness, and the layer distribution of realistic key sets.

use std::collections::BTreeMap;
use std::sync::Arc;

use cid::Cid;
use rand::Rng;
use rand::seq::SliceRandom;
use smol_str::SmolStr;
use weft_repo::mst::tree::Mst;
use weft_repo::mst::util::{empty_node_cid, layer_for_key};
use weft_repo::storage::memory::MemoryBlockStore;

fn value_cid(n: u64) -> Cid {
    weft_repo::codec::derive_cid(&n.to_be_bytes()).unwrap()
}

/// Generate a random key that hashes to the requested MST layer
fn gen_key_at_layer(letter: char, layer: usize) -> String {
    let mut rng = rand::thread_rng();
    loop {
        let num: u32 = rng.gen_range(0..1_000_000);
        let key = format!("{}{}/{:06}", letter, layer, num);
        if layer_for_key(&key) == layer {
            return key;
        }
    }
}

async fn build_tree(pairs: &[(String, Cid)]) -> Mst<MemoryBlockStore> {
    let storage = Arc::new(MemoryBlockStore::new());
    let mut mst = Mst::new(storage);
    for (key, cid) in pairs {
        mst = mst.add(key, *cid).await.unwrap();
    }
    mst
}

#[tokio::test]
async fn empty_tree_has_canonical_root() {
    let storage = Arc::new(MemoryBlockStore::new());
    let mst = Mst::new(storage);

    assert_eq!(mst.root().await.unwrap(), empty_node_cid().unwrap());
    assert_eq!(mst.count().await.unwrap(), 0);
}

#[tokio::test]
async fn single_key_lifecycle() {
    let storage = Arc::new(MemoryBlockStore::new());
    let mst = Mst::new(storage);

    let cid_a = value_cid(0xA);
    let mst = mst.add("app.bsky.feed.post/a", cid_a).await.unwrap();

    assert_eq!(mst.get("app.bsky.feed.post/a").await.unwrap(), Some(cid_a));
    assert_eq!(mst.count().await.unwrap(), 1);

    let mst = mst.delete("app.bsky.feed.post/a").await.unwrap();
    assert_eq!(mst.root().await.unwrap(), empty_node_cid().unwrap());
    assert_eq!(mst.count().await.unwrap(), 0);
}

#[tokio::test]
async fn insertion_order_independence_large() {
    // 1000 random pairs inserted in three different orders produce
    // byte-identical root CIDs
    let mut rng = rand::thread_rng();
    let mut pairs: Vec<(String, Cid)> = (0..1000u64)
        .map(|i| {
            let suffix: u64 = rng.r#gen::<u64>() & 0xFFFF_FFFF_FFFF;
            (format!("c/{:012x}", suffix ^ (i << 1)), value_cid(i))
        })
        .collect();
    pairs.sort();
    pairs.dedup_by(|a, b| a.0 == b.0);

    let tree1 = build_tree(&pairs).await;

    let mut shuffled = pairs.clone();
    shuffled.shuffle(&mut rng);
    let tree2 = build_tree(&shuffled).await;

    let mut reversed = pairs.clone();
    reversed.reverse();
    let tree3 = build_tree(&reversed).await;

    let root1 = tree1.root().await.unwrap();
    let root2 = tree2.root().await.unwrap();
    let root3 = tree3.root().await.unwrap();

    assert_eq!(root1, root2);
    assert_eq!(root1, root3);
    assert_eq!(tree1.count().await.unwrap(), pairs.len());
}

#[tokio::test]
async fn bulk_build_matches_incremental() {
    let pairs: Vec<(String, Cid)> = (0..200u64)
        .map(|i| (format!("coll/item{:04}", i * 7 % 200), value_cid(i)))
        .collect();

    let incremental = build_tree(&pairs).await;

    let bulk = Mst::from_entries(
        Arc::new(MemoryBlockStore::new()),
        pairs
            .iter()
            .map(|(k, c)| (SmolStr::new(k), *c))
            .collect::<Vec<_>>(),
    )
    .await
    .unwrap();

    assert_eq!(
        incremental.root().await.unwrap(),
        bulk.root().await.unwrap()
    );
}

#[tokio::test]
async fn persistence_round_trip() {
    let storage = Arc::new(MemoryBlockStore::new());
    let mut mst = Mst::new(storage.clone());

    let mut expected = BTreeMap::new();
    for i in 0..50u64 {
        let key = format!("coll/key{:03}", i);
        let cid = value_cid(i);
        mst = mst.add(&key, cid).await.unwrap();
        expected.insert(key, cid);
    }

    let root = mst.persist().await.unwrap();

    let reloaded = Mst::load_verified(storage, root).await.unwrap();
    assert_eq!(reloaded.count().await.unwrap(), 50);

    for (key, cid) in &expected {
        assert_eq!(reloaded.get(key).await.unwrap(), Some(*cid));
    }

    // Round-trip root is byte-equal
    assert_eq!(reloaded.root().await.unwrap(), root);
}

#[tokio::test]
async fn delete_is_idempotent_at_root_level() {
    let pairs: Vec<(String, Cid)> = (0..30u64)
        .map(|i| (format!("coll/k{:02}", i), value_cid(i)))
        .collect();
    let tree = build_tree(&pairs).await;

    let once = tree.delete("coll/k07").await.unwrap();
    let twice = once.delete("coll/k07").await.unwrap();

    assert_eq!(once.root().await.unwrap(), twice.root().await.unwrap());
}

#[tokio::test]
async fn diff_reports_exact_sets() {
    // Two trees sharing 100 keys; the second gains 10, changes 10, loses 10
    let base_pairs: Vec<(String, Cid)> = (0..100u64)
        .map(|i| (format!("coll/base{:03}", i), value_cid(i)))
        .collect();

    let tree1 = build_tree(&base_pairs).await;

    let mut tree2 = build_tree(&base_pairs).await;
    for i in 0..10u64 {
        tree2 = tree2
            .add(&format!("coll/new{:02}", i), value_cid(1000 + i))
            .await
            .unwrap();
        tree2 = tree2
            .add(&format!("coll/base{:03}", i), value_cid(2000 + i))
            .await
            .unwrap();
        tree2 = tree2.delete(&format!("coll/base{:03}", 90 + i)).await.unwrap();
    }

    let diff = tree1.diff(&tree2).await.unwrap();

    assert_eq!(diff.creates.len(), 10);
    assert_eq!(diff.updates.len(), 10);
    assert_eq!(diff.deletes.len(), 10);

    for (key, _) in &diff.creates {
        assert!(key.starts_with("coll/new"));
    }
    for (key, new_cid, old_cid) in &diff.updates {
        assert!(key.starts_with("coll/base00"));
        assert_ne!(new_cid, old_cid);
    }
    for (key, _) in &diff.deletes {
        assert!(key.starts_with("coll/base09"));
    }

    // Replaying the diff onto tree1 lands exactly on tree2
    let replayed = tree1.batch(&diff.to_verified_ops()).await.unwrap();
    assert_eq!(
        replayed.root().await.unwrap(),
        tree2.root().await.unwrap()
    );
}

#[tokio::test]
async fn layer_distribution_and_iteration_order() {
    // 10k keys of the form c/<12 hex>: layers follow the expected geometric
    // distribution (1/4 per step) and iteration is strictly ascending
    let mut rng = rand::thread_rng();
    let mut pairs: Vec<(String, Cid)> = Vec::new();
    let mut seen = std::collections::HashSet::new();
    while pairs.len() < 10_000 {
        let suffix: u64 = rng.r#gen::<u64>() & 0xFFFF_FFFF_FFFF;
        let key = format!("c/{:012x}", suffix);
        if seen.insert(key.clone()) {
            pairs.push((key, value_cid(pairs.len() as u64)));
        }
    }

    let tree = build_tree(&pairs).await;

    assert_eq!(tree.count().await.unwrap(), 10_000);

    let leaves = tree.leaves().await.unwrap();
    assert_eq!(leaves.len(), 10_000);
    for pair in leaves.windows(2) {
        assert!(
            pair[0].0 < pair[1].0,
            "iteration must be strictly ascending: {} !< {}",
            pair[0].0,
            pair[1].0
        );
    }

    let max_layer = pairs
        .iter()
        .map(|(k, _)| layer_for_key(k))
        .max()
        .unwrap();
    // E[max] ≈ log4(10000) ≈ 6.6; far outside 3..=13 means the layer
    // computation is wrong, not bad luck
    assert!(
        (3..=13).contains(&max_layer),
        "max layer {} outside plausible range",
        max_layer
    );

    let layer0 = pairs.iter().filter(|(k, _)| layer_for_key(k) == 0).count();
    // P(layer 0) = 3/4; allow generous slack
    assert!(
        (6_500..=8_500).contains(&layer0),
        "layer-0 fraction implausible: {}",
        layer0
    );
}

#[tokio::test]
async fn root_collapses_to_highest_surviving_layer() {
    // Build a tree with keys at known layers, then delete the high ones
    let low0 = gen_key_at_layer('A', 0);
    let low1 = gen_key_at_layer('B', 0);
    let mid = gen_key_at_layer('C', 1);
    let high = gen_key_at_layer('D', 2);

    let storage = Arc::new(MemoryBlockStore::new());
    let mut tree = Mst::new(storage);
    for (i, key) in [&low0, &low1, &mid, &high].iter().enumerate() {
        tree = tree.add(key, value_cid(i as u64)).await.unwrap();
    }

    // Deleting the layer-2 key must bring the root down to layer 1
    let tree = tree.delete(&high).await.unwrap();
    let expected = {
        let storage = Arc::new(MemoryBlockStore::new());
        let mut t = Mst::new(storage);
        for (i, key) in [&low0, &low1, &mid].iter().enumerate() {
            t = t.add(key, value_cid(i as u64)).await.unwrap();
        }
        t
    };
    assert_eq!(tree.root().await.unwrap(), expected.root().await.unwrap());

    // Deleting the layer-1 key leaves a flat layer-0 tree
    let tree = tree.delete(&mid).await.unwrap();
    let expected = {
        let storage = Arc::new(MemoryBlockStore::new());
        let mut t = Mst::new(storage);
        for (i, key) in [&low0, &low1].iter().enumerate() {
            t = t.add(key, value_cid(i as u64)).await.unwrap();
        }
        t
    };
    assert_eq!(tree.root().await.unwrap(), expected.root().await.unwrap());
}

#[tokio::test]
async fn layer_consistency_after_random_ops() {
    // A randomly grown and shrunk tree still passes the structural verifier
    let mut rng = rand::thread_rng();
    let storage = Arc::new(MemoryBlockStore::new());
    let mut tree = Mst::new(storage.clone());
    let mut live: Vec<String> = Vec::new();

    for i in 0..500u64 {
        if !live.is_empty() && rng.gen_bool(0.3) {
            let idx = rng.gen_range(0..live.len());
            let key = live.swap_remove(idx);
            tree = tree.delete(&key).await.unwrap();
        } else {
            let key = format!("coll/r{:08x}", rng.r#gen::<u32>());
            if !live.contains(&key) {
                tree = tree.add(&key, value_cid(i)).await.unwrap();
                live.push(key);
            }
        }
    }

    let root = tree.persist().await.unwrap();
    let verified = Mst::load_verified(storage, root).await.unwrap();
    assert_eq!(verified.count().await.unwrap(), live.len());
}

#[tokio::test]
async fn mixed_layers_determinism() {
    // Keys spanning layers 0-4, inserted forward and backward
    let mut keys = Vec::new();
    for layer in 0..5 {
        for letter in ['Q', 'R', 'S'] {
            keys.push(gen_key_at_layer(letter, layer));
        }
    }
    keys.sort();
    keys.dedup();

    let pairs: Vec<(String, Cid)> = keys
        .iter()
        .enumerate()
        .map(|(i, k)| (k.clone(), value_cid(i as u64)))
        .collect();

    let forward = build_tree(&pairs).await;
    let mut rev_pairs = pairs.clone();
    rev_pairs.reverse();
    let backward = build_tree(&rev_pairs).await;

    assert_eq!(
        forward.root().await.unwrap(),
        backward.root().await.unwrap()
    );

    // And deletion of a middle key from both stays deterministic
    let target = &pairs[pairs.len() / 2].0;
    let f = forward.delete(target).await.unwrap();
    let b = backward.delete(target).await.unwrap();
    assert_eq!(f.root().await.unwrap(), b.root().await.unwrap());
}
