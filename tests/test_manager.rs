use {
    common::{random_str, test_params},
    etcd_quorum::{
        config::KEYSPACE_PARAM,
        manager::{ManagerError, PrimitiveManager},
        store::memory::MemoryStore,
        ConfigError,
    },
    std::sync::{
        atomic::{AtomicUsize, Ordering},
        Arc,
    },
};

mod common;

#[test]
fn new_should_report_every_violation() {
    let mut params = test_params("foo");
    params.remove(KEYSPACE_PARAM);
    params.insert("etcd-lease-heartbeat".to_string(), "PT9S".to_string());

    let Err(ManagerError::Config(ConfigError::Invalid(violations))) =
        PrimitiveManager::new(&params)
    else {
        panic!("config should be rejected");
    };
    assert_eq!(violations.len(), 2);
}

#[tokio::test(start_paused = true)]
async fn start_and_stop_should_be_idempotent() {
    common::init_tracing();
    let store = Arc::new(MemoryStore::new());
    let manager = PrimitiveManager::new(&test_params("foo")).expect("valid config");

    let lease_id = manager.start_with_store(store.clone()).await.expect("start");
    let again = manager.start_with_store(store.clone()).await.expect("start again");
    assert_eq!(lease_id, again);
    assert!(manager.is_started());

    manager.stop().await;
    manager.stop().await;
    assert!(!manager.is_started());
    assert!(!store.lease_is_alive(lease_id));
}

#[tokio::test(start_paused = true)]
async fn stop_should_release_held_locks() {
    let store = Arc::new(MemoryStore::new());
    let manager = PrimitiveManager::new(&test_params("foo")).expect("valid config");
    manager.start_with_store(store.clone()).await.expect("start");
    let name = random_str(10);

    let lock = manager.distributed_lock(&name).expect("started");
    assert!(lock.try_lock().await.expect("try lock"));
    assert_eq!(store.keys_with_prefix("foo/locks/").len(), 1);

    manager.stop().await;
    assert!(store.keys_with_prefix("foo/locks/").is_empty());
    assert!(matches!(
        manager.distributed_lock(&name),
        Err(ManagerError::NotStarted)
    ));
}

#[tokio::test(start_paused = true)]
async fn managers_should_exclude_each_other() {
    let store = Arc::new(MemoryStore::new());
    let first = PrimitiveManager::new(&test_params("foo")).expect("valid config");
    let second = PrimitiveManager::new(&test_params("foo")).expect("valid config");
    first.start_with_store(store.clone()).await.expect("start");
    second.start_with_store(store.clone()).await.expect("start");
    assert_ne!(first.member_id(), second.member_id());

    let a = first.distributed_lock("leader").expect("started");
    let b = second.distributed_lock("leader").expect("started");
    assert!(a.try_lock().await.expect("try lock"));
    assert!(!b.try_lock().await.expect("try lock"));

    first.stop().await;
    assert!(b.try_lock().await.expect("try lock"));
}

#[tokio::test(start_paused = true)]
async fn unavailable_listener_should_fire_on_loss() {
    let store = Arc::new(MemoryStore::new());
    let manager = PrimitiveManager::new(&test_params("foo")).expect("valid config");
    let fired = Arc::new(AtomicUsize::new(0));
    let fired2 = Arc::clone(&fired);
    manager.add_unavailable_listener(move |_| {
        fired2.fetch_add(1, Ordering::SeqCst);
    });
    let lease_id = manager.start_with_store(store.clone()).await.expect("start");
    let lock = manager.distributed_lock("a").expect("started");

    store.expire_lease(lease_id);
    lock.unavailable_notify().recv().await;

    assert_eq!(fired.load(Ordering::SeqCst), 1);
    assert!(!manager.is_started());
}
