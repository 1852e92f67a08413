use {
    crate::{
        classify::{log_store_error, FailureCategory},
        identity::MemberId,
        retry::{is_transient, retry_store, with_deadline},
        store::{CoordinationStore, LeaseId, StoreError},
    },
    serde::Serialize,
    std::{
        fmt,
        sync::{Arc, Mutex, PoisonError},
        time::Duration,
    },
    tokio::{
        sync::{oneshot, watch},
        task::JoinHandle,
        time::Instant,
    },
    tonic::Code,
    tracing::{error, info, trace, warn},
};

// Jiffy is interval between system timer interrupts, typically 10ms for linux systems.
const AT_LEAST_10_JIFFIES: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SessionState {
    Connecting,
    Active,
    Lost,
    Closed,
}

///
/// Immutable view of the session, swapped atomically by the session manager.
///
/// `generation` is bumped on every transition, so a reader can tell whether the session it
/// acted under is still the current one.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionSnapshot {
    pub state: SessionState,
    pub lease_id: Option<LeaseId>,
    pub generation: u64,
}

impl SessionSnapshot {
    pub fn is_active(&self) -> bool {
        self.state == SessionState::Active
    }
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    pub lease_ttl_secs: i64,
    pub heartbeat: Duration,
    pub request_deadline: Duration,
}

#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    #[error("no active session")]
    NoSession,
    #[error("session unavailable: lease {0} was lost")]
    Lost(LeaseId),
    #[error("session closed")]
    Closed,
    #[error("failed to establish session: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LossReason {
    /// The store reported the lease as gone.
    Expired,
    /// A renewal was cancelled.
    Cancelled,
    /// The store rejected the renewal with a non-transient status.
    Rejected(Code),
    /// Renewals kept failing until the lease could expire before the next attempt.
    RenewalWindowElapsed { consecutive_failures: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SessionLost {
    pub lease_id: LeaseId,
    pub reason: LossReason,
}

impl fmt::Display for SessionLost {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "lease {} lost: {:?}", self.lease_id, self.reason)
    }
}

type LossListener = Box<dyn FnOnce(&SessionLost) + Send>;

#[derive(Default)]
struct Listeners {
    pending: Vec<LossListener>,
    fired: Option<SessionLost>,
}

struct Shared {
    store: Arc<dyn CoordinationStore>,
    member: MemberId,
    state_tx: watch::Sender<SessionSnapshot>,
    listeners: Mutex<Listeners>,
}

impl Shared {
    fn snapshot(&self) -> SessionSnapshot {
        *self.state_tx.borrow()
    }

    ///
    /// Publishes the Lost snapshot, then runs every listener exactly once.
    ///
    fn mark_lost(&self, event: SessionLost) {
        let transitioned = self.state_tx.send_if_modified(|snapshot| {
            if snapshot.is_active() && snapshot.lease_id == Some(event.lease_id) {
                snapshot.state = SessionState::Lost;
                snapshot.generation += 1;
                true
            } else {
                false
            }
        });
        if !transitioned {
            return;
        }
        error!(member = %self.member, "[{}] session {event}", self.member);
        let listeners = {
            let mut guard = self.listeners.lock().unwrap_or_else(PoisonError::into_inner);
            guard.fired = Some(event);
            std::mem::take(&mut guard.pending)
        };
        for listener in listeners {
            listener(&event);
        }
    }

    fn publish_closed(&self) {
        self.state_tx.send_if_modified(|snapshot| {
            if snapshot.state == SessionState::Closed {
                false
            } else {
                snapshot.state = SessionState::Closed;
                snapshot.generation += 1;
                true
            }
        });
    }

    async fn revoke_lease(&self, lease_id: LeaseId) {
        let result = retry_store(|| async move {
            match self.store.revoke_lease(lease_id).await {
                Err(e) if e.is_not_found() => {
                    warn!("lease {lease_id:?} was already deleted");
                    Ok(())
                }
                result => result,
            }
        })
        .await;
        if let Err(e) = result {
            log_store_error(&e, &self.member, "revoking lease");
        }
    }
}

///
/// Resolves once the session is no longer active.
///
/// Created after the session was lost, it resolves immediately.
///
#[derive(Clone)]
pub struct SessionLostNotify {
    rx: watch::Receiver<SessionSnapshot>,
}

impl SessionLostNotify {
    pub async fn recv(mut self) -> SessionSnapshot {
        let ended = self
            .rx
            .wait_for(|snapshot| {
                matches!(snapshot.state, SessionState::Lost | SessionState::Closed)
            })
            .await
            .map(|snapshot| *snapshot);
        match ended {
            Ok(snapshot) => snapshot,
            // The session manager is gone, nothing backs the lease anymore.
            Err(_) => SessionSnapshot {
                state: SessionState::Closed,
                ..*self.rx.borrow()
            },
        }
    }
}

///
/// Read-only, cheaply cloneable view over a session, handed to the lock engine.
///
/// It never mutates the session: every read is a snapshot of the last published state.
///
#[derive(Clone)]
pub struct SessionHandle {
    shared: Arc<Shared>,
}

impl SessionHandle {
    pub fn store(&self) -> &Arc<dyn CoordinationStore> {
        &self.shared.store
    }

    pub fn member(&self) -> &MemberId {
        &self.shared.member
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    ///
    /// Returns the active lease and the generation it belongs to.
    ///
    pub fn require_active(&self) -> Result<(LeaseId, u64), SessionError> {
        let snapshot = self.snapshot();
        match (snapshot.state, snapshot.lease_id) {
            (SessionState::Active, Some(lease_id)) => Ok((lease_id, snapshot.generation)),
            (SessionState::Lost, Some(lease_id)) => Err(SessionError::Lost(lease_id)),
            (SessionState::Closed, _) => Err(SessionError::Closed),
            _ => Err(SessionError::NoSession),
        }
    }

    pub fn lost_notify(&self) -> SessionLostNotify {
        SessionLostNotify {
            rx: self.shared.state_tx.subscribe(),
        }
    }

    ///
    /// Registers a listener invoked once when the session is lost.
    /// If the session is already lost, the listener runs immediately.
    ///
    pub fn add_loss_listener<F>(&self, listener: F)
    where
        F: FnOnce(&SessionLost) + Send + 'static,
    {
        let mut guard = self
            .shared
            .listeners
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        match guard.fired {
            Some(event) => {
                drop(guard);
                listener(&event);
            }
            None => guard.pending.push(Box::new(listener)),
        }
    }
}

enum KeepAliveExit {
    Stopped,
    Lost,
}

struct KeepAliveTask {
    // Dropping the sender also stops the task, which then revokes the lease.
    stop_tx: oneshot::Sender<()>,
    handle: JoinHandle<KeepAliveExit>,
}

///
/// Owns the lease of this member and keeps it alive.
///
/// State machine: `Connecting -> Active -> {Lost, Closed}`, `Closed` is terminal and reachable
/// from any state. A manager backs exactly one lease; once lost or closed a new manager must be
/// created to establish a new session.
///
pub struct SessionManager {
    shared: Arc<Shared>,
    config: SessionConfig,
    keep_alive: tokio::sync::Mutex<Option<KeepAliveTask>>,
}

impl SessionManager {
    pub fn new(store: Arc<dyn CoordinationStore>, member: MemberId, config: SessionConfig) -> Self {
        let (state_tx, _) = watch::channel(SessionSnapshot {
            state: SessionState::Connecting,
            lease_id: None,
            generation: 0,
        });
        Self {
            shared: Arc::new(Shared {
                store,
                member,
                state_tx,
                listeners: Mutex::new(Listeners::default()),
            }),
            config,
            keep_alive: tokio::sync::Mutex::new(None),
        }
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            shared: Arc::clone(&self.shared),
        }
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.shared.snapshot()
    }

    pub fn member(&self) -> &MemberId {
        &self.shared.member
    }

    ///
    /// Grants the lease and starts renewing it every heartbeat.
    ///
    /// Calling `start` on an active session is a no-op.
    ///
    pub async fn start(&self) -> Result<LeaseId, SessionError> {
        let mut keep_alive = self.keep_alive.lock().await;
        let snapshot = self.snapshot();
        match (snapshot.state, snapshot.lease_id) {
            (SessionState::Active, Some(lease_id)) => return Ok(lease_id),
            (SessionState::Lost, Some(lease_id)) => return Err(SessionError::Lost(lease_id)),
            (SessionState::Closed, _) => return Err(SessionError::Closed),
            _ => {}
        }

        let store = &self.shared.store;
        let ttl_secs = self.config.lease_ttl_secs;
        let deadline = self.config.request_deadline;
        let lease_id = retry_store(|| with_deadline(deadline, store.grant_lease(ttl_secs)))
            .await
            .inspect_err(|e| {
                log_store_error(e, &self.shared.member, "granting lease");
            })?;

        self.shared.state_tx.send_modify(|snapshot| {
            snapshot.state = SessionState::Active;
            snapshot.lease_id = Some(lease_id);
            snapshot.generation += 1;
        });
        info!(
            member = %self.shared.member,
            "[{}] session active with lease {lease_id:?}, ttl {ttl_secs}s",
            self.shared.member
        );

        let (stop_tx, stop_rx) = oneshot::channel();
        let handle = tokio::spawn(keep_alive_loop(
            Arc::clone(&self.shared),
            self.config.clone(),
            lease_id,
            stop_rx,
        ));
        *keep_alive = Some(KeepAliveTask { stop_tx, handle });
        Ok(lease_id)
    }

    ///
    /// Stops renewing, revokes the lease so dependent keys disappear right away and publishes
    /// `Closed`. Safe to call more than once.
    ///
    pub async fn stop(&self) {
        let task = self.keep_alive.lock().await.take();
        if let Some(KeepAliveTask { stop_tx, handle }) = task {
            let _ = stop_tx.send(());
            match handle.await {
                Ok(KeepAliveExit::Stopped) => {}
                Ok(KeepAliveExit::Lost) => {
                    if let Some(lease_id) = self.snapshot().lease_id {
                        self.shared.revoke_lease(lease_id).await;
                    }
                }
                Err(e) => {
                    warn!("keep alive task failed: {e:?}");
                }
            }
        }
        self.shared.publish_closed();
    }
}

async fn keep_alive_loop(
    shared: Arc<Shared>,
    config: SessionConfig,
    lease_id: LeaseId,
    mut stop_rx: oneshot::Receiver<()>,
) -> KeepAliveExit {
    let heartbeat = config.heartbeat;
    let granted_at = Instant::now();
    let mut expires_at = granted_at + Duration::from_secs(config.lease_ttl_secs as u64);
    let mut last_keep_alive = granted_at;
    let mut next_renewal = granted_at + heartbeat;
    let mut consecutive_failures = 0u32;

    'keep_alive: loop {
        let (sent_at, result) = tokio::select! {
            _ = &mut stop_rx => break 'keep_alive,
            _ = tokio::time::sleep_until(next_renewal) => {
                let since_last_keep_alive = last_keep_alive.elapsed();
                if since_last_keep_alive > heartbeat {
                    let dt = since_last_keep_alive - heartbeat;
                    if dt >= AT_LEAST_10_JIFFIES {
                        warn!("last keep alive was {dt:?} late");
                    }
                }
                let sent_at = Instant::now();
                // A renewal still in flight when the lease is about to lapse counts as failed.
                let deadline = config.request_deadline.min(
                    expires_at
                        .saturating_duration_since(sent_at)
                        .saturating_sub(AT_LEAST_10_JIFFIES),
                );
                tokio::select! {
                    _ = &mut stop_rx => break 'keep_alive,
                    result = with_deadline(deadline, shared.store.keep_alive(lease_id)) => {
                        (sent_at, result)
                    }
                }
            }
        };
        next_renewal += heartbeat;

        match result {
            Ok(ttl) if ttl > 0 => {
                consecutive_failures = 0;
                last_keep_alive = Instant::now();
                expires_at = sent_at + Duration::from_secs(ttl as u64);
                if ttl < config.lease_ttl_secs {
                    warn!("lease {lease_id:?} ttl reduced to {ttl}");
                }
                trace!("keep alive lease {lease_id:?}, ttl {ttl}");
            }
            Ok(_) => {
                shared.mark_lost(SessionLost {
                    lease_id,
                    reason: LossReason::Expired,
                });
                return KeepAliveExit::Lost;
            }
            Err(e) => {
                consecutive_failures += 1;
                let category = log_store_error(&e, &shared.member, "renewing lease");
                let reason = if category == FailureCategory::Cancelled {
                    Some(LossReason::Cancelled)
                } else if !is_transient(&e) {
                    Some(LossReason::Rejected(category.code()))
                } else if Instant::now() + heartbeat >= expires_at {
                    Some(LossReason::RenewalWindowElapsed {
                        consecutive_failures,
                    })
                } else {
                    None
                };
                if let Some(reason) = reason {
                    shared.mark_lost(SessionLost { lease_id, reason });
                    return KeepAliveExit::Lost;
                }
            }
        }
    }

    let since_last_keep_alive = last_keep_alive.elapsed();
    info!("revoking lease {lease_id:?}, last keep alive: {since_last_keep_alive:?}");
    shared.revoke_lease(lease_id).await;
    KeepAliveExit::Stopped
}
