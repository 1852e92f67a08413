use {
    crate::{
        config::{Config, ConfigError},
        identity::MemberId,
        lock::{DistributedLock, LockConfig, LockEngine, LockError},
        session::{SessionError, SessionLost, SessionManager, SessionState},
        store::{etcd::EtcdStore, CoordinationStore, LeaseId, StoreError},
    },
    std::{
        collections::HashMap,
        sync::{Arc, Mutex, PoisonError, RwLock},
    },
    thiserror::Error,
    tracing::info,
};

#[derive(Debug, Error)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Session(#[from] SessionError),
    #[error("failed to connect to etcd: {0}")]
    Store(#[from] StoreError),
    #[error(transparent)]
    Lock(#[from] LockError),
    #[error("primitive manager is not started")]
    NotStarted,
}

type UnavailableListener = Arc<dyn Fn(&SessionLost) + Send + Sync>;

struct Running {
    session: Arc<SessionManager>,
    engine: LockEngine,
}

///
/// Entry point of the crate: owns the member identity, the session and the lock engine.
///
/// Example
///
/// ```no_run
/// use {etcd_quorum::manager::PrimitiveManager, std::collections::HashMap};
///
/// # async fn run(params: HashMap<String, String>) -> Result<(), Box<dyn std::error::Error>> {
/// let manager = PrimitiveManager::new(&params)?;
/// manager.start().await?;
///
/// let lock = manager.distributed_lock("leader")?;
/// if lock.try_lock().await? {
///     // critical section
///     lock.unlock().await?;
/// }
/// manager.stop().await;
/// # Ok(())
/// # }
/// ```
///
pub struct PrimitiveManager {
    config: Config,
    member: MemberId,
    // Serializes start and stop.
    lifecycle: tokio::sync::Mutex<()>,
    running: RwLock<Option<Running>>,
    listeners: Mutex<Vec<UnavailableListener>>,
}

impl PrimitiveManager {
    ///
    /// Validates `params` and creates a stopped manager with a fresh member identity.
    ///
    pub fn new(params: &HashMap<String, String>) -> Result<Self, ManagerError> {
        Ok(Self::from_config(Config::from_params(params)?))
    }

    pub fn from_config(config: Config) -> Self {
        Self {
            config,
            member: MemberId::random(),
            lifecycle: tokio::sync::Mutex::new(()),
            running: RwLock::new(None),
            listeners: Mutex::new(Vec::new()),
        }
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn member_id(&self) -> &MemberId {
        &self.member
    }

    ///
    /// Whether a session was started and is still active.
    ///
    pub fn is_started(&self) -> bool {
        self.running
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|running| running.session.snapshot().is_active())
    }

    ///
    /// Connects to the configured etcd cluster and starts the session.
    ///
    pub async fn start(&self) -> Result<LeaseId, ManagerError> {
        if let Some(lease_id) = self.active_lease() {
            return Ok(lease_id);
        }
        let store = EtcdStore::connect(&self.config).await?;
        self.start_with_store(Arc::new(store)).await
    }

    ///
    /// Starts the session over `store`.
    ///
    /// Starting an active manager is a no-op. Starting after the session was lost replaces it,
    /// along with the lock engine; handles obtained before keep failing with the old session.
    ///
    pub async fn start_with_store(
        &self,
        store: Arc<dyn CoordinationStore>,
    ) -> Result<LeaseId, ManagerError> {
        let _lifecycle = self.lifecycle.lock().await;
        if let Some(lease_id) = self.active_lease() {
            return Ok(lease_id);
        }
        let previous = self
            .running
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(previous) = previous {
            previous.session.stop().await;
        }

        let session = Arc::new(SessionManager::new(
            store,
            self.member.clone(),
            self.config.session_config(),
        ));
        let lease_id = session.start().await?;
        let handle = session.handle();
        for listener in self.listeners_snapshot() {
            handle.add_loss_listener(move |event| listener(event));
        }
        let engine = LockEngine::new(
            handle,
            self.config.keyspace(),
            LockConfig::from(&self.config),
        );
        *self.running.write().unwrap_or_else(PoisonError::into_inner) =
            Some(Running { session, engine });
        info!(
            "[{}] primitive manager started under keyspace {}",
            self.member,
            self.config.keyspace()
        );
        Ok(lease_id)
    }

    fn active_lease(&self) -> Option<LeaseId> {
        let running = self.running.read().unwrap_or_else(PoisonError::into_inner);
        let snapshot = running.as_ref()?.session.snapshot();
        match snapshot.state {
            SessionState::Active => snapshot.lease_id,
            _ => None,
        }
    }

    fn listeners_snapshot(&self) -> Vec<UnavailableListener> {
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    ///
    /// Returns a new handle over the lock `name`.
    ///
    pub fn distributed_lock(&self, name: &str) -> Result<DistributedLock, ManagerError> {
        let running = self.running.read().unwrap_or_else(PoisonError::into_inner);
        let running = running.as_ref().ok_or(ManagerError::NotStarted)?;
        Ok(running.engine.distributed_lock(name)?)
    }

    ///
    /// Registers a callback invoked when the session backing the primitives is lost.
    ///
    /// The callback stays registered across restarts: it is attached to every session this
    /// manager starts afterwards.
    ///
    pub fn add_unavailable_listener<F>(&self, listener: F)
    where
        F: Fn(&SessionLost) + Send + Sync + 'static,
    {
        let listener: UnavailableListener = Arc::new(listener);
        self.listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::clone(&listener));
        let handle = self
            .running
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .map(|running| running.session.handle());
        if let Some(handle) = handle {
            if handle.snapshot().state != SessionState::Closed {
                handle.add_loss_listener(move |event| listener(event));
            }
        }
    }

    ///
    /// Releases every held lock, then closes the session. Safe to call more than once.
    ///
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        let running = self
            .running
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        let Some(Running { session, engine }) = running else {
            return;
        };
        engine.release_all().await;
        session.stop().await;
        info!("[{}] primitive manager stopped", self.member);
    }
}
