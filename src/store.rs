use {
    crate::{classify::Interrupted, Revision},
    std::time::Duration,
    tokio::sync::mpsc,
    tonic::Code,
};

///
/// etcd backed coordination store
pub mod etcd;

///
/// In-process coordination store with the same transactional semantics, for tests.
pub mod memory;

///
/// Alias for an etcd lease id
pub type LeaseId = i64;

#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("etcd error: {0}")]
    Etcd(#[from] etcd_client::Error),
    #[error("etcd status: {0}")]
    Status(#[from] tonic::Status),
    #[error("request deadline of {0:?} exceeded")]
    DeadlineExceeded(Duration),
    /// Raised by store implementations that observe a cancellation of their own, e.g. a
    /// wrapper tied to a shutdown signal. [`etcd::EtcdStore`] and [`memory::MemoryStore`] never
    /// raise it: with them, callers only observe cancellation through their own token.
    #[error("store call interrupted")]
    Interrupted(#[source] Interrupted),
}

impl StoreError {
    ///
    /// The gRPC status code this error maps to.
    ///
    /// Errors that carry no status are reported as [`Code::Unknown`], except transport
    /// failures which mean the channel itself is unavailable.
    ///
    pub fn code(&self) -> Code {
        match self {
            StoreError::Etcd(etcd_client::Error::GRpcStatus(status)) => status.code(),
            StoreError::Etcd(etcd_client::Error::TransportError(_)) => Code::Unavailable,
            StoreError::Etcd(_) => Code::Unknown,
            StoreError::Status(status) => status.code(),
            StoreError::DeadlineExceeded(_) => Code::DeadlineExceeded,
            StoreError::Interrupted(_) => Code::Cancelled,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.code() == Code::NotFound
    }
}

///
/// Outcome of a compare-and-swap claim on a lock key.
///
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClaimOutcome {
    /// The key was absent and is now owned by the caller's lease.
    Acquired,
    /// The key already belongs to the caller's lease, nothing was written.
    AlreadyHeld,
    /// The key belongs to another lease.
    Taken,
}

impl ClaimOutcome {
    pub fn is_held(&self) -> bool {
        matches!(self, ClaimOutcome::Acquired | ClaimOutcome::AlreadyHeld)
    }
}

///
/// Current holder of a key.
///
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyHolder {
    pub value: String,
    pub lease: LeaseId,
    pub create_revision: Revision,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KeyEvent {
    Put { revision: Revision },
    Delete { revision: Revision },
}

///
/// The primitives the session and lock engine need from the coordination store.
///
/// Every write that claims or releases a key is conditioned on the lease that owns it,
/// the store is the only arbiter of who holds a key.
///
#[async_trait::async_trait]
pub trait CoordinationStore: Send + Sync + 'static {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, StoreError>;

    ///
    /// Renews the lease once and returns the ttl granted by the store, in seconds.
    /// A ttl of zero means the lease no longer exists.
    ///
    async fn keep_alive(&self, lease_id: LeaseId) -> Result<i64, StoreError>;

    async fn revoke_lease(&self, lease_id: LeaseId) -> Result<(), StoreError>;

    ///
    /// Creates `key` with `value` attached to `lease_id` if the key is absent.
    ///
    async fn try_claim(
        &self,
        key: &str,
        value: &str,
        lease_id: LeaseId,
    ) -> Result<ClaimOutcome, StoreError>;

    ///
    /// Deletes `key` only if it is attached to `lease_id`.
    /// Returns whether a key was deleted.
    ///
    async fn release(&self, key: &str, lease_id: LeaseId) -> Result<bool, StoreError>;

    async fn get(&self, key: &str) -> Result<Option<KeyHolder>, StoreError>;

    ///
    /// Streams put/delete events on `key`. The stream ends when the receiver is dropped
    /// or the underlying watch cannot be re-established.
    ///
    fn watch_key(&self, key: &str) -> mpsc::Receiver<KeyEvent>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errors_without_status_should_map_to_unknown() {
        let err = StoreError::Etcd(etcd_client::Error::LeaseKeepAliveError(
            "boom".to_string(),
        ));
        assert_eq!(err.code(), Code::Unknown);
    }

    #[test]
    fn status_errors_should_keep_their_code() {
        let err = StoreError::from(tonic::Status::not_found("lease"));
        assert!(err.is_not_found());
        let err = StoreError::Etcd(etcd_client::Error::GRpcStatus(tonic::Status::cancelled(
            "stop",
        )));
        assert_eq!(err.code(), Code::Cancelled);
        assert_eq!(
            StoreError::DeadlineExceeded(Duration::from_secs(1)).code(),
            Code::DeadlineExceeded
        );
    }
}
