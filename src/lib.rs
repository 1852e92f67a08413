///
/// Failure taxonomy of coordination store requests and the interruption signal
///
pub mod classify;

///
/// Parameter map validation and conversion
///
pub mod config;

///
/// Random member identity
pub mod identity;

///
/// Provides an API over lease-owned distributed locks
///
pub mod lock;

///
/// Entry point owning the session and the primitives built on it
///
pub mod manager;

///
/// Utility function to manage various transient errors.
pub mod retry;

///
/// Provides an API over a "managed" lease: the session of this member
///
pub mod session;

///
/// Coordination store abstraction and its etcd and in-memory implementations
///
pub mod store;

///
/// Alias for etcd revision
pub type Revision = i64;

pub use {
    classify::Interrupted,
    config::{Config, ConfigError},
    identity::MemberId,
    lock::{DistributedLock, LockError},
    manager::{ManagerError, PrimitiveManager},
    session::{SessionError, SessionLost},
};
