//! End-to-end exercises of the sequence container.

use rmad::{DiskVec, Error, PoolConfig};

fn config() -> PoolConfig {
    PoolConfig::with_block_size(64)
}

#[test]
fn contents_survive_close_and_reopen() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seq");

    let mut vec: DiskVec<u64> = DiskVec::open(&path, config()).unwrap();
    for value in 0..500u64 {
        vec.push(&(value * 2)).unwrap();
    }
    vec.close().unwrap();

    let file_len = std::fs::metadata(&path).unwrap().len();
    assert!(file_len % 64 == 0);

    let mut vec: DiskVec<u64> = DiskVec::open(&path, config()).unwrap();
    assert_eq!(vec.len(), 500);
    for index in 0..500u64 {
        assert_eq!(vec.get(index).unwrap(), index * 2);
    }
}

#[test]
fn second_open_is_locked_out() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("seq");

    let vec: DiskVec<u64> = DiskVec::open(&path, config()).unwrap();
    assert!(matches!(
        DiskVec::<u64>::open(&path, config()),
        Err(Error::LockUnavailable)
    ));
    vec.close().unwrap();
}

#[test]
fn editing_in_the_middle_keeps_order() {
    let dir = tempfile::tempdir().unwrap();
    let mut vec: DiskVec<u64> = DiskVec::open(&dir.path().join("seq"), config()).unwrap();

    for value in 0..50u64 {
        vec.push(&value).unwrap();
    }
    vec.insert(10, &1000).unwrap();
    let removed = vec.remove(30).unwrap();
    assert_eq!(removed, 29);

    let collected: Vec<u64> = vec.iter().map(|item| item.unwrap()).collect();
    let mut expected: Vec<u64> = (0..50).collect();
    expected.insert(10, 1000);
    expected.remove(30);
    assert_eq!(collected, expected);
}

#[test]
fn pop_to_empty_and_refill() {
    let dir = tempfile::tempdir().unwrap();
    let mut vec: DiskVec<u64> = DiskVec::open(&dir.path().join("seq"), config()).unwrap();

    for value in 0..20u64 {
        vec.push(&value).unwrap();
    }
    for value in (0..20u64).rev() {
        assert_eq!(vec.pop().unwrap(), Some(value));
    }
    assert_eq!(vec.pop().unwrap(), None);
    assert!(vec.is_empty());

    vec.push(&7).unwrap();
    assert_eq!(vec.get(0).unwrap(), 7);
}
