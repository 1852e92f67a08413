use {
    core::time::Duration,
    etcd_quorum::{config::*, PrimitiveManager},
    std::collections::HashMap,
    tokio_util::sync::CancellationToken,
    tracing_subscriber::EnvFilter,
};

fn params_from_env() -> HashMap<String, String> {
    let defaults = [
        (ENDPOINTS_PARAM, "localhost:2379"),
        (KEYSPACE_PARAM, "example"),
        (LEASE_TTL_PARAM, "PT5S"),
        (LEASE_HEARTBEAT_PARAM, "PT1S"),
        (REQUEST_DEADLINE_PARAM, "PT2S"),
        (CONNECTION_TIMEOUT_PARAM, "PT5S"),
        (TLS_ENABLED_PARAM, "false"),
    ];
    defaults
        .into_iter()
        .map(|(key, default)| {
            // etcd-lease-ttl is read from ETCD_LEASE_TTL, and so on.
            let var = key.to_uppercase().replace('-', "_");
            let value = std::env::var(var).unwrap_or_else(|_| default.to_string());
            (key.to_string(), value)
        })
        .collect()
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let manager = PrimitiveManager::new(&params_from_env()).expect("invalid configuration");
    manager.add_unavailable_listener(|event| {
        eprintln!("session lost: {event}");
    });
    manager.start().await.expect("failed to start");
    println!("Started as member {}", manager.member_id());

    let lock = manager
        .distributed_lock("example-lock")
        .expect("manager is started");
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        ctrl_c.cancel();
    });

    println!("Waiting for {}...", lock.key());
    match lock.lock(&cancel).await {
        Ok(()) => println!("Lock acquired!"),
        Err(e) => {
            println!("Gave up on the lock: {e}");
            manager.stop().await;
            return;
        }
    }

    println!("Holding the lock for 5 seconds...");
    tokio::select! {
        _ = lock.unavailable_notify().recv() => println!("Lost the session while holding the lock!"),
        _ = cancel.cancelled() => println!("Interrupted!"),
        _ = tokio::time::sleep(Duration::from_secs(5)) => {}
    }

    lock.unlock().await.expect("failed to unlock");
    manager.stop().await;
    println!("Finished!");
}
