//! End-to-end exercises of the B+Tree through the public surface.

use rmad::{BTree, Error, PoolConfig, Replacement};

fn init_logs() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Order 4: three keys per node, so structure changes fire quickly.
fn small_config() -> PoolConfig {
    PoolConfig {
        block_size: 160,
        pool_bytes: 160 * 16,
        replacement: Replacement::SecondChance,
    }
}

#[test]
fn insert_search_iterate_round_trip() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let mut tree: BTree<u64, u64> =
        BTree::open(&dir.path().join("tree"), small_config()).unwrap();

    for key in 1..=5u64 {
        tree.insert(key, key * 10).unwrap();
    }

    assert_eq!(tree.len(), 5);
    assert_eq!(tree.get(&3).unwrap(), 30);
    assert!(matches!(tree.get(&6), Err(Error::NotFound)));

    let pairs: Vec<(u64, u64)> = tree.iter().map(|pair| pair.unwrap()).collect();
    assert_eq!(pairs, vec![(1, 10), (2, 20), (3, 30), (4, 40), (5, 50)]);
    tree.validate().unwrap();
}

#[test]
fn duplicate_counts_track_inserts_and_deletes() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let mut tree: BTree<u64, u64> =
        BTree::open(&dir.path().join("tree"), small_config()).unwrap();

    for value in [1u64, 2, 3].iter() {
        tree.insert(7, *value).unwrap();
    }
    assert_eq!(tree.count(&7).unwrap(), 3);

    let values: Vec<u64> = tree.iter().map(|pair| pair.unwrap().1).collect();
    assert_eq!(values, vec![1, 2, 3]);

    // All occurrences go at once; a second delete finds nothing.
    assert_eq!(tree.delete(&7).unwrap(), 3);
    assert_eq!(tree.count(&7).unwrap(), 0);
    assert_eq!(tree.delete(&7).unwrap(), 0);
    tree.validate().unwrap();
}

#[test]
fn deletes_rebalance_and_keep_order() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let mut tree: BTree<u64, u64> =
        BTree::open(&dir.path().join("tree"), small_config()).unwrap();

    for key in 1..=4u64 {
        tree.insert(key, key).unwrap();
    }
    tree.delete(&4).unwrap();
    tree.delete(&3).unwrap();

    assert_eq!(tree.len(), 2);
    let keys: Vec<u64> = tree.iter().map(|pair| pair.unwrap().0).collect();
    assert_eq!(keys, vec![1, 2]);
    tree.validate().unwrap();
}

#[test]
fn persists_a_thousand_keys_across_reopen() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree");
    let config = PoolConfig::default();

    let mut tree: BTree<u64, u64> = BTree::open(&path, config).unwrap();
    for key in 1..=1000u64 {
        tree.insert(key, key * 3).unwrap();
    }
    tree.close().unwrap();

    // Clean shutdown truncates to whole blocks.
    let index_len = std::fs::metadata(&path).unwrap().len();
    assert!(index_len > 0 && index_len % config.block_size as u64 == 0);
    assert!(dir.path().join("tree_data").exists());

    let mut tree: BTree<u64, u64> = BTree::open(&path, config).unwrap();
    assert_eq!(tree.len(), 1000);
    assert_eq!(tree.get(&500).unwrap(), 1500);

    let keys: Vec<u64> = tree.iter().map(|pair| pair.unwrap().0).collect();
    assert_eq!(keys, (1..=1000).collect::<Vec<_>>());

    let backward: Vec<u64> = tree.iter().rev().map(|pair| pair.unwrap().0).collect();
    assert_eq!(backward, (1..=1000).rev().collect::<Vec<_>>());
    tree.validate().unwrap();
}

#[test]
fn the_lock_excludes_a_second_open() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree");

    let tree: BTree<u64, u64> = BTree::open(&path, small_config()).unwrap();
    match BTree::<u64, u64>::open(&path, small_config()) {
        Err(Error::LockUnavailable) => {}
        other => panic!("expected LockUnavailable, got {:?}", other.map(|_| ())),
    }

    tree.close().unwrap();
    BTree::<u64, u64>::open(&path, small_config()).unwrap().close().unwrap();
}

#[test]
fn reopening_with_another_key_size_is_refused() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("tree");

    let tree: BTree<u64, u64> = BTree::open(&path, PoolConfig::default()).unwrap();
    tree.close().unwrap();

    assert!(matches!(
        BTree::<u32, u64>::open(&path, PoolConfig::default()),
        Err(Error::SignatureMismatch(_))
    ));
}

#[test]
fn mixed_workload_stays_consistent() {
    init_logs();
    let dir = tempfile::tempdir().unwrap();
    let mut tree: BTree<u64, u64> =
        BTree::open(&dir.path().join("tree"), small_config()).unwrap();

    for key in 0..300u64 {
        tree.insert(key % 100, key).unwrap();
    }
    assert_eq!(tree.len(), 300);
    for key in 0..100u64 {
        assert_eq!(tree.count(&key).unwrap(), 3);
    }
    tree.validate().unwrap();

    for key in (0..100u64).step_by(3) {
        assert_eq!(tree.delete(&key).unwrap(), 3);
    }
    tree.validate().unwrap();

    let mut expected = 0u64;
    for key in 0..100u64 {
        if key % 3 != 0 {
            expected += 3;
        }
        let count = tree.count(&key).unwrap();
        assert_eq!(count, if key % 3 == 0 { 0 } else { 3 });
    }
    assert_eq!(tree.len(), expected);
}
