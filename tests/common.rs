#![allow(dead_code)]

use {
    etcd_quorum::{
        config::*,
        identity::MemberId,
        lock::{LockConfig, LockEngine},
        session::{SessionConfig, SessionManager},
        store::memory::MemoryStore,
    },
    std::{collections::HashMap, sync::Arc, time::Duration},
    tracing_subscriber::EnvFilter,
};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

pub fn random_str(len: usize) -> String {
    use rand::{distributions::Alphanumeric, thread_rng, Rng};
    let mut rng = thread_rng();
    (&mut rng)
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

pub fn test_params(keyspace: &str) -> HashMap<String, String> {
    [
        (ENDPOINTS_PARAM, "localhost:2379"),
        (KEYSPACE_PARAM, keyspace),
        (LEASE_TTL_PARAM, "PT5S"),
        (LEASE_HEARTBEAT_PARAM, "PT1S"),
        (REQUEST_DEADLINE_PARAM, "PT1S"),
        (CONNECTION_TIMEOUT_PARAM, "PT2S"),
        (TLS_ENABLED_PARAM, "false"),
    ]
    .into_iter()
    .map(|(k, v)| (k.to_string(), v.to_string()))
    .collect()
}

pub fn session_config(lease_ttl_secs: i64, heartbeat_secs: u64) -> SessionConfig {
    SessionConfig {
        lease_ttl_secs,
        heartbeat: Duration::from_secs(heartbeat_secs),
        request_deadline: Duration::from_secs(1),
    }
}

///
/// Starts a session over `store` and returns it with a lock engine scoped under `keyspace`.
///
pub async fn start_member(
    store: &Arc<MemoryStore>,
    keyspace: &str,
) -> (SessionManager, LockEngine) {
    let session = SessionManager::new(store.clone(), MemberId::random(), session_config(5, 1));
    session.start().await.expect("failed to start session");
    let engine = LockEngine::new(session.handle(), keyspace, LockConfig::default());
    (session, engine)
}

pub async fn get_etcd_client() -> etcd_client::Client {
    etcd_client::Client::connect(["http://localhost:2379"], None)
        .await
        .expect("failed to connect to etcd")
}
