use {
    crate::{
        classify::{assert_no_nested_interrupted, log_store_error, Interrupted},
        config::Config,
        retry::{is_transient, retry_store, with_deadline},
        session::{SessionError, SessionHandle, SessionLostNotify},
        store::{KeyEvent, StoreError},
    },
    futures::future::join_all,
    retry::delay::Exponential,
    std::{
        collections::HashSet,
        error::Error,
        sync::{Arc, Mutex, PoisonError},
        time::Duration,
    },
    thiserror::Error,
    tokio::time::Instant,
    tokio_util::sync::CancellationToken,
    tracing::{info, trace, warn},
};

#[derive(Debug, Error)]
pub enum LockError {
    #[error("invalid lock name `{0}`")]
    InvalidLockName(String),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error(transparent)]
    Interrupted(#[from] Interrupted),
    #[error("lock request failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone)]
pub struct LockConfig {
    /// Bound on each request to the store.
    pub request_deadline: Duration,
    /// First delay between two acquisition attempts of a blocking lock.
    pub retry_base: Duration,
    /// Cap of the delay between two acquisition attempts.
    pub retry_max: Duration,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            request_deadline: Duration::from_secs(10),
            retry_base: Duration::from_millis(10),
            retry_max: Duration::from_secs(1),
        }
    }
}

impl From<&Config> for LockConfig {
    fn from(config: &Config) -> Self {
        Self {
            request_deadline: config.request_deadline(),
            // Waiters poll at least once per heartbeat.
            retry_max: config.heartbeat().min(LockConfig::default().retry_max),
            ..Default::default()
        }
    }
}

impl LockConfig {
    fn backoff(&self) -> impl Iterator<Item = Duration> {
        let retry_max = self.retry_max;
        Exponential::from_millis_with_factor(self.retry_base.as_millis() as u64, 2.0)
            .map(move |delay| delay.min(retry_max))
    }
}

///
/// Named locks scoped under `{keyspace}/locks/`, owned by the lease of a session.
///
/// The engine never decides ownership by itself: every claim and release is a compare-and-swap
/// on the lease attached to the key, so two sessions can never hold the same key even when both
/// believe they are active. Locally the engine only remembers which keys it claimed, to release
/// them on shutdown.
///
/// You can clone [`LockEngine`] to share it across tasks, it is cheap to do so.
///
#[derive(Clone)]
pub struct LockEngine {
    session: SessionHandle,
    keyspace: String,
    config: LockConfig,
    held: Arc<Mutex<HashSet<String>>>,
}

impl LockEngine {
    pub fn new(session: SessionHandle, keyspace: impl Into<String>, config: LockConfig) -> Self {
        Self {
            session,
            keyspace: keyspace.into(),
            config,
            held: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn key_for(&self, name: &str) -> Result<String, LockError> {
        if name.is_empty() {
            return Err(LockError::InvalidLockName(name.to_string()));
        }
        Ok(format!("{}/locks/{name}", self.keyspace))
    }

    ///
    /// Returns a handle bound to `name`. Every call returns a distinct handle over the same key.
    ///
    pub fn distributed_lock(&self, name: impl Into<String>) -> Result<DistributedLock, LockError> {
        let name = name.into();
        let key = self.key_for(&name)?;
        Ok(DistributedLock {
            name,
            key,
            engine: self.clone(),
        })
    }

    fn remember(&self, key: &str) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.to_string());
    }

    fn forget(&self, key: &str) {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .remove(key);
    }

    pub fn held_keys(&self) -> Vec<String> {
        self.held
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .cloned()
            .collect()
    }

    fn unavailable(&self) -> LockError {
        match self.session.require_active() {
            Err(e) => e.into(),
            Ok(_) => SessionError::NoSession.into(),
        }
    }

    ///
    /// Single non-blocking attempt to claim `name`.
    ///
    /// Returns `Ok(false)` if another session holds it. Claiming a lock this session already
    /// holds returns `Ok(true)` without writing anything.
    ///
    pub async fn try_lock(&self, name: &str) -> Result<bool, LockError> {
        let key = self.key_for(name)?;
        let (lease_id, generation) = self.session.require_active()?;
        let member = self.session.member();
        let claim = with_deadline(
            self.config.request_deadline,
            self.session
                .store()
                .try_claim(&key, member.as_str(), lease_id),
        )
        .await;
        let outcome = match claim {
            Ok(outcome) => outcome,
            // The store no longer knows our lease: it expired before we noticed.
            Err(e) if e.is_not_found() => return Err(SessionError::Lost(lease_id).into()),
            Err(e) => return Err(e.into()),
        };
        if !outcome.is_held() {
            trace!("[{member}] lock {key} is held by another member");
            return Ok(false);
        }

        // A loss published while the claim was in flight wins over the claim.
        let snapshot = self.session.snapshot();
        if !snapshot.is_active() || snapshot.generation != generation {
            return Err(self.unavailable());
        }
        self.remember(&key);
        trace!("[{member}] acquired lock {key} with lease {lease_id:?}: {outcome:?}");
        Ok(true)
    }

    ///
    /// Blocks until `name` is acquired.
    ///
    /// Fails with [`LockError::Interrupted`] as soon as `cancel` fires and with
    /// [`LockError::Session`] if the session is lost while waiting. An in-flight claim always
    /// runs to completion, so cancellation never leaves a claim behind that the caller does not
    /// know about.
    ///
    pub async fn lock(&self, name: &str, cancel: &CancellationToken) -> Result<(), LockError> {
        self.acquire(name, None, cancel).await.map(|_| ())
    }

    ///
    /// Like [`LockEngine::lock`] but gives up after `timeout`, returning `Ok(false)`.
    ///
    pub async fn try_lock_for(
        &self,
        name: &str,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, LockError> {
        self.acquire(name, Some(Instant::now() + timeout), cancel)
            .await
    }

    async fn acquire(
        &self,
        name: &str,
        deadline: Option<Instant>,
        cancel: &CancellationToken,
    ) -> Result<bool, LockError> {
        let key = self.key_for(name)?;
        let member = self.session.member().clone();
        let mut events = self.session.store().watch_key(&key);
        let lost = self.session.lost_notify().recv();
        tokio::pin!(lost);
        let mut backoff = self.config.backoff();

        loop {
            if cancel.is_cancelled() {
                return Err(Interrupted::new(format!("acquisition of lock {key} cancelled")).into());
            }
            match self.try_lock(name).await {
                Ok(true) => return Ok(true),
                Ok(false) => {}
                Err(LockError::Store(e)) => {
                    assert_no_nested_interrupted(Some(&e as &(dyn Error + 'static)))?;
                    log_store_error(&e, &member, &format!("acquiring lock {key}"));
                    if !is_transient(&e) {
                        return Err(e.into());
                    }
                }
                Err(e) => return Err(e),
            }

            let now = Instant::now();
            let mut wake_at = now + backoff.next().unwrap_or(self.config.retry_max);
            if let Some(deadline) = deadline {
                if now >= deadline {
                    return Ok(false);
                }
                wake_at = wake_at.min(deadline);
            }

            tokio::select! {
                _ = cancel.cancelled() => {
                    return Err(Interrupted::new(format!("acquisition of lock {key} cancelled")).into());
                }
                _ = &mut lost => {
                    return Err(self.unavailable());
                }
                Some(KeyEvent::Delete { revision }) = events.recv() => {
                    trace!("[{member}] lock {key} released at revision {revision}, retrying");
                }
                _ = tokio::time::sleep_until(wake_at) => {}
            }
        }
    }

    ///
    /// Releases `name` if this session holds it. Releasing a lock held by someone else, or by
    /// nobody, is a no-op.
    ///
    pub async fn unlock(&self, name: &str) -> Result<(), LockError> {
        let key = self.key_for(name)?;
        self.release_key(&key).await
    }

    async fn release_key(&self, key: &str) -> Result<(), LockError> {
        let snapshot = self.session.snapshot();
        let Some(lease_id) = snapshot.lease_id else {
            self.forget(key);
            return Ok(());
        };
        let store = self.session.store();
        let deadline = self.config.request_deadline;
        let result = retry_store(|| with_deadline(deadline, store.release(key, lease_id))).await;
        match result {
            Ok(true) => {
                self.forget(key);
                info!("[{}] released lock {key}", self.session.member());
                Ok(())
            }
            Ok(false) => {
                self.forget(key);
                trace!("lock {key} was not held by lease {lease_id:?}");
                Ok(())
            }
            // Once the session is gone, the lease takes the key with it.
            Err(e) if !snapshot.is_active() => {
                self.forget(key);
                log_store_error(&e, self.session.member(), &format!("releasing lock {key}"));
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    ///
    /// Whether the store currently attributes `name` to this session's lease.
    ///
    pub async fn is_held_by_caller(&self, name: &str) -> Result<bool, LockError> {
        let key = self.key_for(name)?;
        let (lease_id, _) = self.session.require_active()?;
        let holder = with_deadline(self.config.request_deadline, self.session.store().get(&key))
            .await?;
        Ok(holder.is_some_and(|holder| holder.lease == lease_id))
    }

    ///
    /// Best-effort release of every lock claimed through this engine.
    ///
    pub async fn release_all(&self) {
        let keys = self.held_keys();
        let results = join_all(keys.iter().map(|key| self.release_key(key))).await;
        for (key, result) in keys.iter().zip(results) {
            if let Err(e) = result {
                warn!("[{}] failed to release lock {key}: {e}", self.session.member());
            }
        }
    }

    pub fn unavailable_notify(&self) -> SessionLostNotify {
        self.session.lost_notify()
    }
}

///
/// Handle over one named lock.
///
/// Handles are cheap; several handles for the same name share the same key, and acquiring
/// through one of them is visible through the others.
///
#[derive(Clone)]
pub struct DistributedLock {
    name: String,
    key: String,
    engine: LockEngine,
}

impl DistributedLock {
    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub async fn try_lock(&self) -> Result<bool, LockError> {
        self.engine.try_lock(&self.name).await
    }

    pub async fn try_lock_for(
        &self,
        timeout: Duration,
        cancel: &CancellationToken,
    ) -> Result<bool, LockError> {
        self.engine.try_lock_for(&self.name, timeout, cancel).await
    }

    pub async fn lock(&self, cancel: &CancellationToken) -> Result<(), LockError> {
        self.engine.lock(&self.name, cancel).await
    }

    pub async fn unlock(&self) -> Result<(), LockError> {
        self.engine.unlock(&self.name).await
    }

    pub async fn is_held_by_caller(&self) -> Result<bool, LockError> {
        self.engine.is_held_by_caller(&self.name).await
    }

    ///
    /// Resolves when the session backing this lock is lost or closed.
    ///
    pub fn unavailable_notify(&self) -> SessionLostNotify {
        self.engine.unavailable_notify()
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::{
            identity::MemberId,
            session::{SessionConfig, SessionManager},
            store::memory::MemoryStore,
        },
    };

    async fn started_engine(store: Arc<MemoryStore>) -> (SessionManager, LockEngine) {
        let session = SessionManager::new(
            store,
            MemberId::random(),
            SessionConfig {
                lease_ttl_secs: 5,
                heartbeat: Duration::from_secs(1),
                request_deadline: Duration::from_secs(1),
            },
        );
        session.start().await.expect("failed to start session");
        let engine = LockEngine::new(session.handle(), "foo", LockConfig::default());
        (session, engine)
    }

    #[tokio::test]
    async fn key_should_be_scoped_under_the_keyspace() {
        let store = Arc::new(MemoryStore::new());
        let (_session, engine) = started_engine(store).await;
        assert_eq!(engine.key_for("a").expect("valid name"), "foo/locks/a");
        assert!(matches!(
            engine.key_for(""),
            Err(LockError::InvalidLockName(_))
        ));
    }

    #[tokio::test]
    async fn release_all_should_free_every_held_lock() {
        let store = Arc::new(MemoryStore::new());
        let (_session, engine) = started_engine(store.clone()).await;
        assert!(engine.try_lock("a").await.expect("try lock"));
        assert!(engine.try_lock("b").await.expect("try lock"));
        assert_eq!(engine.held_keys().len(), 2);

        engine.release_all().await;

        assert!(engine.held_keys().is_empty());
        assert!(store.keys_with_prefix("foo/locks/").is_empty());
    }

    #[tokio::test]
    async fn unlock_should_keep_keys_claimed_by_others() {
        let store = Arc::new(MemoryStore::new());
        let (_session_a, engine_a) = started_engine(store.clone()).await;
        let (_session_b, engine_b) = started_engine(store.clone()).await;
        assert!(engine_a.try_lock("a").await.expect("try lock"));

        engine_b.unlock("a").await.expect("unlock should be a no-op");

        assert!(engine_a.is_held_by_caller("a").await.expect("holder"));
        assert!(!engine_b.is_held_by_caller("a").await.expect("holder"));
    }

    #[test]
    fn backoff_should_be_capped() {
        let config = LockConfig {
            request_deadline: Duration::from_secs(1),
            retry_base: Duration::from_millis(10),
            retry_max: Duration::from_millis(100),
        };
        let delays: Vec<_> = config.backoff().take(6).collect();
        assert_eq!(delays[0], Duration::from_millis(10));
        assert_eq!(delays[5], Duration::from_millis(100));
        assert!(delays.windows(2).all(|w| w[0] <= w[1]));
    }
}
