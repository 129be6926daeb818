use durastore::{ContainerId, Error, Pool, PoolFlags};
use tempfile::TempDir;

const POOL_SIZE: u64 = 4 * 1024 * 1024;

fn setup_pool() -> (TempDir, Pool) {
    let dir = TempDir::new().unwrap();
    let pool = Pool::create(dir.path().join("pool"), POOL_SIZE, PoolFlags::empty()).unwrap();
    (dir, pool)
}

fn collect_ids(pool: &Pool) -> Vec<ContainerId> {
    let mut iter = pool.iter_containers().unwrap();
    let mut ids = Vec::new();
    let mut more = iter.probe(None).unwrap();
    while more {
        ids.push(iter.fetch().unwrap());
        more = iter.next().unwrap();
    }
    iter.finish();
    ids
}

#[test]
fn test_scan_visits_every_container_once() {
    let (_dir, pool) = setup_pool();

    // enough entries to force directory tree splits
    let count = 60u128;
    for i in 0..count {
        pool.create_container(ContainerId::from_u128(i)).unwrap();
    }

    let ids = collect_ids(&pool);
    assert_eq!(ids.len(), count as usize);
    for (i, id) in ids.iter().enumerate() {
        assert_eq!(*id, ContainerId::from_u128(i as u128));
    }
}

#[test]
fn test_scan_order_is_key_order() {
    let (_dir, pool) = setup_pool();
    for v in [9u128, 2, 7, 1, 5] {
        pool.create_container(ContainerId::from_u128(v)).unwrap();
    }

    let ids: Vec<u128> = collect_ids(&pool).iter().map(|id| id.to_u128()).collect();
    assert_eq!(ids, vec![1, 2, 5, 7, 9]);
}

#[test]
fn test_probe_with_anchor() {
    let (_dir, pool) = setup_pool();
    for v in [1u128, 3, 5] {
        pool.create_container(ContainerId::from_u128(v)).unwrap();
    }

    let mut iter = pool.iter_containers().unwrap();

    // anchor on a present id lands on it
    assert!(iter.probe(Some(ContainerId::from_u128(3))).unwrap());
    assert_eq!(iter.fetch().unwrap().to_u128(), 3);

    // anchor between entries lands on the next one
    assert!(iter.probe(Some(ContainerId::from_u128(4))).unwrap());
    assert_eq!(iter.fetch().unwrap().to_u128(), 5);

    // anchor past the last entry finds nothing
    assert!(!iter.probe(Some(ContainerId::from_u128(6))).unwrap());
    iter.finish();
}

#[test]
fn test_fetch_before_probe_is_invalid() {
    let (_dir, pool) = setup_pool();
    pool.create_container(ContainerId::from_u128(1)).unwrap();

    let iter = pool.iter_containers().unwrap();
    assert!(matches!(iter.fetch(), Err(Error::InvalidState)));
}

#[test]
fn test_fetch_after_exhaustion_is_invalid() {
    let (_dir, pool) = setup_pool();
    pool.create_container(ContainerId::from_u128(1)).unwrap();

    let mut iter = pool.iter_containers().unwrap();
    assert!(iter.probe(None).unwrap());
    assert!(!iter.next().unwrap());
    assert!(matches!(iter.fetch(), Err(Error::InvalidState)));
    // next at the end stays at the end
    assert!(!iter.next().unwrap());
    iter.finish();
}

#[test]
fn test_empty_directory_probe() {
    let (_dir, pool) = setup_pool();
    let mut iter = pool.iter_containers().unwrap();
    assert!(!iter.probe(None).unwrap());
    assert!(matches!(iter.fetch(), Err(Error::InvalidState)));
    iter.finish();
}

#[test]
fn test_iterator_delete() {
    let (_dir, pool) = setup_pool();
    for v in 0..5u128 {
        pool.create_container(ContainerId::from_u128(v)).unwrap();
    }

    // delete every even container during the scan
    let mut iter = pool.iter_containers().unwrap();
    let mut more = iter.probe(None).unwrap();
    while more {
        let id = iter.fetch().unwrap();
        if id.to_u128() % 2 == 0 {
            iter.delete().unwrap();
        }
        more = iter.next().unwrap();
    }
    iter.finish();

    let left: Vec<u128> = collect_ids(&pool).iter().map(|id| id.to_u128()).collect();
    assert_eq!(left, vec![1, 3]);
}

#[test]
fn test_iterator_delete_open_container_is_busy() {
    let (_dir, pool) = setup_pool();
    let id = ContainerId::from_u128(2);
    pool.create_container(id).unwrap();
    let handle = pool.open_container(id).unwrap();

    let mut iter = pool.iter_containers().unwrap();
    assert!(iter.probe(None).unwrap());
    assert!(matches!(iter.delete(), Err(Error::Busy)));
    iter.finish();

    pool.close_container(handle);
}
