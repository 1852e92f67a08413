use {
    common::session_config,
    etcd_quorum::{
        identity::MemberId,
        session::{LossReason, SessionError, SessionManager, SessionState},
        store::{memory::MemoryStore, CoordinationStore},
    },
    std::{
        sync::{
            atomic::{AtomicUsize, Ordering},
            Arc,
        },
        time::Duration,
    },
    tonic::Code,
};

mod common;

#[tokio::test(start_paused = true)]
async fn it_should_automatically_refresh_lease() {
    common::init_tracing();
    let store = Arc::new(MemoryStore::new());
    let session = SessionManager::new(store.clone(), MemberId::random(), session_config(2, 1));
    let lease_id = session.start().await.expect("failed to start session");
    let lost_notify = session.handle().lost_notify();

    tokio::select! {
        _ = lost_notify.recv() => {
            panic!("lease expired before the lease duration");
        }
        _ = tokio::time::sleep(Duration::from_secs(6)) => {}
    }
    assert!(store.lease_is_alive(lease_id));
}

#[tokio::test(start_paused = true)]
async fn it_should_renew_once_per_heartbeat() {
    let store = Arc::new(MemoryStore::new());
    let session = SessionManager::new(store.clone(), MemberId::random(), session_config(10, 1));
    let lease_id = session.start().await.expect("failed to start session");

    tokio::time::sleep(Duration::from_millis(5500)).await;

    // One renewal per heartbeat, never a burst to catch up.
    assert_eq!(store.keep_alive_count(lease_id), 5);
}

#[tokio::test(start_paused = true)]
async fn session_should_survive_a_short_partition() {
    let store = Arc::new(MemoryStore::new());
    let session = SessionManager::new(store.clone(), MemberId::random(), session_config(5, 1));
    let lease_id = session.start().await.expect("failed to start session");

    store.fail_next_keep_alives(2, Code::Unavailable);
    tokio::time::sleep(Duration::from_secs(8)).await;

    assert!(session.snapshot().is_active());
    assert!(store.lease_is_alive(lease_id));
}

#[tokio::test(start_paused = true)]
async fn rejected_renewal_should_lose_the_session_and_notify_once() {
    let store = Arc::new(MemoryStore::new());
    let session = SessionManager::new(store.clone(), MemberId::random(), session_config(10, 1));
    let handle = session.handle();
    session.start().await.expect("failed to start session");

    let calls = Arc::new(AtomicUsize::new(0));
    for _ in 0..3 {
        let calls = Arc::clone(&calls);
        handle.add_loss_listener(move |event| {
            assert_eq!(event.reason, LossReason::Rejected(Code::PermissionDenied));
            calls.fetch_add(1, Ordering::SeqCst);
        });
    }
    store.fail_keep_alives(Code::PermissionDenied);

    let snapshot = handle.lost_notify().recv().await;
    tokio::time::sleep(Duration::from_secs(5)).await;

    assert_eq!(snapshot.state, SessionState::Lost);
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test(start_paused = true)]
async fn stop_should_revoke_the_lease_and_drop_its_keys() {
    let store = Arc::new(MemoryStore::new());
    let session = SessionManager::new(store.clone(), MemberId::random(), session_config(5, 1));
    let lease_id = session.start().await.expect("failed to start session");
    store
        .try_claim("foo/locks/a", session.member().as_str(), lease_id)
        .await
        .expect("claim");

    session.stop().await;

    assert!(store.get("foo/locks/a").await.expect("get").is_none());
    assert!(matches!(
        session.handle().require_active(),
        Err(SessionError::Closed)
    ));
}

#[tokio::test(start_paused = true)]
async fn stop_after_loss_should_close_the_session() {
    let store = Arc::new(MemoryStore::new());
    let session = SessionManager::new(store.clone(), MemberId::random(), session_config(5, 1));
    let lease_id = session.start().await.expect("failed to start session");

    store.expire_lease(lease_id);
    session.handle().lost_notify().recv().await;
    session.stop().await;

    assert_eq!(session.snapshot().state, SessionState::Closed);
}
