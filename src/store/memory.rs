use {
    super::{ClaimOutcome, CoordinationStore, KeyEvent, KeyHolder, LeaseId, StoreError},
    crate::Revision,
    std::{
        collections::{BTreeMap, HashMap},
        sync::{Mutex, MutexGuard, PoisonError},
        time::Duration,
    },
    tokio::{
        sync::{broadcast, mpsc},
        time::Instant,
    },
    tonic::{Code, Status},
};

struct LeaseEntry {
    ttl_secs: i64,
    expires_at: Instant,
    keep_alives: usize,
}

struct KeyEntry {
    value: String,
    lease: LeaseId,
    create_revision: Revision,
}

struct InjectedFailure {
    code: Code,
    // None: fail until healed.
    remaining: Option<usize>,
}

#[derive(Default)]
struct Inner {
    next_lease_id: LeaseId,
    revision: Revision,
    leases: HashMap<LeaseId, LeaseEntry>,
    keys: BTreeMap<String, KeyEntry>,
    keep_alive_failure: Option<InjectedFailure>,
    claim_failure: Option<InjectedFailure>,
}

///
/// In-process coordination store.
///
/// Claims and releases are linearized by a single mutex, the same guarantee etcd gives its
/// transactions. Leases expire on the tokio clock, so tests can drive expiry with paused time.
/// Failures can be injected on keep-alive and claim requests to simulate partitions.
///
pub struct MemoryStore {
    inner: Mutex<Inner>,
    events: broadcast::Sender<(String, KeyEvent)>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        let (events, _) = broadcast::channel(64);
        Self {
            inner: Mutex::new(Inner {
                next_lease_id: 1,
                ..Default::default()
            }),
            events,
        }
    }

    fn lock_inner(&self) -> MutexGuard<'_, Inner> {
        let mut inner = self.inner.lock().unwrap_or_else(PoisonError::into_inner);
        self.purge_expired(&mut inner);
        inner
    }

    fn purge_expired(&self, inner: &mut Inner) {
        let now = Instant::now();
        let expired: Vec<LeaseId> = inner
            .leases
            .iter()
            .filter(|(_, lease)| lease.expires_at <= now)
            .map(|(id, _)| *id)
            .collect();
        for lease_id in expired {
            self.drop_lease(inner, lease_id);
        }
    }

    fn drop_lease(&self, inner: &mut Inner, lease_id: LeaseId) -> bool {
        if inner.leases.remove(&lease_id).is_none() {
            return false;
        }
        let attached: Vec<String> = inner
            .keys
            .iter()
            .filter(|(_, entry)| entry.lease == lease_id)
            .map(|(key, _)| key.clone())
            .collect();
        for key in attached {
            self.delete_key(inner, &key);
        }
        true
    }

    fn delete_key(&self, inner: &mut Inner, key: &str) {
        if inner.keys.remove(key).is_some() {
            inner.revision += 1;
            let _ = self.events.send((
                key.to_string(),
                KeyEvent::Delete {
                    revision: inner.revision,
                },
            ));
        }
    }

    fn take_failure(slot: &mut Option<InjectedFailure>) -> Option<Status> {
        let failure = slot.take()?;
        let status = Status::new(failure.code, "injected failure");
        match failure.remaining {
            None => *slot = Some(failure),
            Some(0) => return None,
            Some(1) => {}
            Some(remaining) => {
                *slot = Some(InjectedFailure {
                    code: failure.code,
                    remaining: Some(remaining - 1),
                })
            }
        }
        Some(status)
    }

    ///
    /// Every keep-alive fails with `code` until [`MemoryStore::heal`] is called.
    ///
    pub fn fail_keep_alives(&self, code: Code) {
        self.lock_inner().keep_alive_failure = Some(InjectedFailure {
            code,
            remaining: None,
        });
    }

    pub fn fail_next_keep_alives(&self, count: usize, code: Code) {
        self.lock_inner().keep_alive_failure = Some(InjectedFailure {
            code,
            remaining: Some(count),
        });
    }

    pub fn fail_next_claims(&self, count: usize, code: Code) {
        self.lock_inner().claim_failure = Some(InjectedFailure {
            code,
            remaining: Some(count),
        });
    }

    pub fn heal(&self) {
        let mut inner = self.lock_inner();
        inner.keep_alive_failure = None;
        inner.claim_failure = None;
    }

    ///
    /// Expires a lease on the store side, as if its holder had been partitioned away.
    ///
    pub fn expire_lease(&self, lease_id: LeaseId) -> bool {
        let mut inner = self.lock_inner();
        self.drop_lease(&mut inner, lease_id)
    }

    pub fn lease_is_alive(&self, lease_id: LeaseId) -> bool {
        self.lock_inner().leases.contains_key(&lease_id)
    }

    pub fn keep_alive_count(&self, lease_id: LeaseId) -> usize {
        self.lock_inner()
            .leases
            .get(&lease_id)
            .map(|lease| lease.keep_alives)
            .unwrap_or(0)
    }

    pub fn keys_with_prefix(&self, prefix: &str) -> Vec<String> {
        self.lock_inner()
            .keys
            .range(prefix.to_string()..)
            .take_while(|(key, _)| key.starts_with(prefix))
            .map(|(key, _)| key.clone())
            .collect()
    }
}

fn lease_not_found() -> StoreError {
    StoreError::Status(Status::not_found("etcdserver: requested lease not found"))
}

#[async_trait::async_trait]
impl CoordinationStore for MemoryStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        if ttl_secs <= 0 {
            return Err(Status::invalid_argument("lease ttl must be positive").into());
        }
        let mut inner = self.lock_inner();
        let lease_id = inner.next_lease_id;
        inner.next_lease_id += 1;
        inner.leases.insert(
            lease_id,
            LeaseEntry {
                ttl_secs,
                expires_at: Instant::now() + Duration::from_secs(ttl_secs as u64),
                keep_alives: 0,
            },
        );
        Ok(lease_id)
    }

    async fn keep_alive(&self, lease_id: LeaseId) -> Result<i64, StoreError> {
        let mut inner = self.lock_inner();
        if let Some(status) = Self::take_failure(&mut inner.keep_alive_failure) {
            return Err(status.into());
        }
        match inner.leases.get_mut(&lease_id) {
            Some(lease) => {
                lease.expires_at = Instant::now() + Duration::from_secs(lease.ttl_secs as u64);
                lease.keep_alives += 1;
                Ok(lease.ttl_secs)
            }
            None => Ok(0),
        }
    }

    async fn revoke_lease(&self, lease_id: LeaseId) -> Result<(), StoreError> {
        let mut inner = self.lock_inner();
        if self.drop_lease(&mut inner, lease_id) {
            Ok(())
        } else {
            Err(lease_not_found())
        }
    }

    async fn try_claim(
        &self,
        key: &str,
        value: &str,
        lease_id: LeaseId,
    ) -> Result<ClaimOutcome, StoreError> {
        let mut inner = self.lock_inner();
        if let Some(status) = Self::take_failure(&mut inner.claim_failure) {
            return Err(status.into());
        }
        if let Some(entry) = inner.keys.get(key) {
            return Ok(if entry.lease == lease_id {
                ClaimOutcome::AlreadyHeld
            } else {
                ClaimOutcome::Taken
            });
        }
        if !inner.leases.contains_key(&lease_id) {
            return Err(lease_not_found());
        }
        inner.revision += 1;
        let revision = inner.revision;
        inner.keys.insert(
            key.to_string(),
            KeyEntry {
                value: value.to_string(),
                lease: lease_id,
                create_revision: revision,
            },
        );
        let _ = self
            .events
            .send((key.to_string(), KeyEvent::Put { revision }));
        Ok(ClaimOutcome::Acquired)
    }

    async fn release(&self, key: &str, lease_id: LeaseId) -> Result<bool, StoreError> {
        let mut inner = self.lock_inner();
        match inner.keys.get(key) {
            Some(entry) if entry.lease == lease_id => {
                self.delete_key(&mut inner, key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn get(&self, key: &str) -> Result<Option<KeyHolder>, StoreError> {
        Ok(self.lock_inner().keys.get(key).map(|entry| KeyHolder {
            value: entry.value.clone(),
            lease: entry.lease,
            create_revision: entry.create_revision,
        }))
    }

    fn watch_key(&self, key: &str) -> mpsc::Receiver<KeyEvent> {
        let (tx, rx) = mpsc::channel(10);
        let mut events = self.events.subscribe();
        let key = key.to_string();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = tx.closed() => break,
                    event = events.recv() => match event {
                        Ok((event_key, event)) if event_key == key => {
                            if tx.send(event).await.is_err() {
                                break;
                            }
                        }
                        Ok(_) => {}
                        Err(broadcast::error::RecvError::Lagged(_)) => {}
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }
            }
        });
        rx
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn claim_should_be_exclusive_and_reentrant() {
        let store = MemoryStore::new();
        let lease_a = store.grant_lease(5).await.expect("grant");
        let lease_b = store.grant_lease(5).await.expect("grant");

        let first = store.try_claim("ks/locks/a", "a", lease_a).await.expect("claim");
        let again = store.try_claim("ks/locks/a", "a", lease_a).await.expect("claim");
        let other = store.try_claim("ks/locks/a", "b", lease_b).await.expect("claim");

        assert_eq!(first, ClaimOutcome::Acquired);
        assert_eq!(again, ClaimOutcome::AlreadyHeld);
        assert_eq!(other, ClaimOutcome::Taken);
        assert_eq!(store.keys_with_prefix("ks/locks/"), vec!["ks/locks/a"]);
    }

    #[tokio::test]
    async fn release_should_only_delete_keys_owned_by_the_lease() {
        let store = MemoryStore::new();
        let lease_a = store.grant_lease(5).await.expect("grant");
        let lease_b = store.grant_lease(5).await.expect("grant");
        store.try_claim("k", "a", lease_a).await.expect("claim");

        assert!(!store.release("k", lease_b).await.expect("release"));
        assert!(store.release("k", lease_a).await.expect("release"));
        assert!(!store.release("k", lease_a).await.expect("release"));
    }

    #[tokio::test(start_paused = true)]
    async fn expired_lease_should_drop_its_keys() {
        let store = MemoryStore::new();
        let lease_id = store.grant_lease(2).await.expect("grant");
        store.try_claim("k", "a", lease_id).await.expect("claim");

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(store.get("k").await.expect("get").is_none());
        assert_eq!(store.keep_alive(lease_id).await.expect("keep alive"), 0);
        assert!(store.try_claim("k2", "a", lease_id).await.expect_err("claim").is_not_found());
        assert!(store.revoke_lease(lease_id).await.expect_err("revoke").is_not_found());
    }

    #[tokio::test]
    async fn watch_should_report_deletes() {
        let store = MemoryStore::new();
        let lease_id = store.grant_lease(5).await.expect("grant");
        let mut events = store.watch_key("k");
        store.try_claim("k", "a", lease_id).await.expect("claim");
        store.try_claim("other", "a", lease_id).await.expect("claim");
        store.revoke_lease(lease_id).await.expect("revoke");

        assert!(matches!(events.recv().await, Some(KeyEvent::Put { .. })));
        assert!(matches!(events.recv().await, Some(KeyEvent::Delete { .. })));
    }

    #[tokio::test]
    async fn injected_failures_should_run_out() {
        let store = MemoryStore::new();
        let lease_id = store.grant_lease(5).await.expect("grant");
        store.fail_next_keep_alives(2, Code::Unavailable);

        assert!(store.keep_alive(lease_id).await.is_err());
        assert!(store.keep_alive(lease_id).await.is_err());
        assert_eq!(store.keep_alive(lease_id).await.expect("keep alive"), 5);
    }
}
