use {
    super::{ClaimOutcome, CoordinationStore, KeyEvent, KeyHolder, LeaseId, StoreError},
    crate::{config::Config, retry::retry_store},
    etcd_client::{
        Client, Compare, CompareOp, ConnectOptions, EventType, LeaseKeepAliveStream, LeaseKeeper,
        PutOptions, TlsOptions, Txn, TxnOp, TxnOpResponse, WatchOptions,
    },
    std::{collections::HashMap, future::Future},
    tokio::sync::{mpsc, Mutex},
    tokio_stream::StreamExt,
    tracing::{error, trace, warn},
};

///
/// Coordination store backed by an etcd cluster.
///
/// Keep-alive requests of a lease share one long-lived keeper/stream pair; the pair is dropped
/// after any failure and re-opened by the next renewal.
///
pub struct EtcdStore {
    client: Client,
    keepers: Mutex<HashMap<LeaseId, (LeaseKeeper, LeaseKeepAliveStream)>>,
}

impl EtcdStore {
    pub fn new(client: Client) -> Self {
        Self {
            client,
            keepers: Mutex::new(HashMap::new()),
        }
    }

    ///
    /// Opens a channel to the configured endpoints within the connection timeout.
    ///
    /// When TLS is enabled the channel is negotiated with a default [`TlsOptions`], which
    /// carries no trust roots: use [`EtcdStore::connect_with_tls`] to provide the CA
    /// certificate of the cluster or a client identity.
    ///
    pub async fn connect(config: &Config) -> Result<Self, StoreError> {
        let tls = config.is_tls_enabled().then(TlsOptions::new);
        Self::connect_with_tls(config, tls).await
    }

    pub async fn connect_with_tls(
        config: &Config,
        tls: Option<TlsOptions>,
    ) -> Result<Self, StoreError> {
        let secure = tls.is_some();
        let mut options = ConnectOptions::new()
            .with_connect_timeout(config.connect_timeout())
            .with_timeout(config.request_deadline());
        if let Some(tls) = tls {
            options = options.with_tls(tls);
        }
        let endpoints: Vec<String> = config
            .endpoints()
            .iter()
            .map(|endpoint| endpoint_url(endpoint, secure))
            .collect();
        trace!("connecting to etcd at {endpoints:?}");
        let client = tokio::time::timeout(
            config.connect_timeout(),
            Client::connect(endpoints, Some(options)),
        )
        .await
        .map_err(|_| StoreError::DeadlineExceeded(config.connect_timeout()))??;
        Ok(Self::new(client))
    }

    pub fn client(&self) -> &Client {
        &self.client
    }
}

fn endpoint_url(endpoint: &str, secure: bool) -> String {
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if secure {
        format!("https://{endpoint}")
    } else {
        format!("http://{endpoint}")
    }
}

#[async_trait::async_trait]
impl CoordinationStore for EtcdStore {
    async fn grant_lease(&self, ttl_secs: i64) -> Result<LeaseId, StoreError> {
        let resp = self.client.clone().lease_grant(ttl_secs, None).await?;
        Ok(resp.id())
    }

    async fn keep_alive(&self, lease_id: LeaseId) -> Result<i64, StoreError> {
        let client = &self.client;
        renew_with_cached_keeper(
            &self.keepers,
            lease_id,
            || async move { Ok::<_, StoreError>(client.clone().lease_keep_alive(lease_id).await?) },
            renew_once,
        )
        .await
    }

    async fn revoke_lease(&self, lease_id: LeaseId) -> Result<(), StoreError> {
        self.keepers.lock().await.remove(&lease_id);
        self.client.clone().lease_revoke(lease_id).await?;
        Ok(())
    }

    async fn try_claim(
        &self,
        key: &str,
        value: &str,
        lease_id: LeaseId,
    ) -> Result<ClaimOutcome, StoreError> {
        let txn = Txn::new()
            .when(vec![Compare::create_revision(key, CompareOp::Equal, 0)])
            .and_then(vec![TxnOp::put(
                key,
                value,
                Some(PutOptions::new().with_lease(lease_id)),
            )])
            .or_else(vec![TxnOp::get(key, None)]);
        let resp = self.client.kv_client().txn(txn).await?;
        if resp.succeeded() {
            return Ok(ClaimOutcome::Acquired);
        }
        let holder_lease = resp.op_responses().into_iter().find_map(|op| match op {
            TxnOpResponse::Get(get) => get.kvs().first().map(|kv| kv.lease()),
            _ => None,
        });
        match holder_lease {
            Some(holder) if holder == lease_id => Ok(ClaimOutcome::AlreadyHeld),
            Some(_) => Ok(ClaimOutcome::Taken),
            None => {
                warn!("claim of {key} failed but the key has no holder");
                Ok(ClaimOutcome::Taken)
            }
        }
    }

    async fn release(&self, key: &str, lease_id: LeaseId) -> Result<bool, StoreError> {
        let txn = Txn::new()
            .when(vec![Compare::lease(key, CompareOp::Equal, lease_id)])
            .and_then(vec![TxnOp::delete(key, None)]);
        let resp = self.client.kv_client().txn(txn).await?;
        Ok(resp.succeeded())
    }

    async fn get(&self, key: &str) -> Result<Option<KeyHolder>, StoreError> {
        let resp = self.client.kv_client().get(key, None).await?;
        Ok(resp.kvs().first().map(|kv| KeyHolder {
            value: String::from_utf8_lossy(kv.value()).into_owned(),
            lease: kv.lease(),
            create_revision: kv.create_revision(),
        }))
    }

    fn watch_key(&self, key: &str) -> mpsc::Receiver<KeyEvent> {
        let wc = self.client.watch_client();
        let (tx, rx) = mpsc::channel(10);
        let key = key.to_string();
        tokio::spawn(async move {
            let mut last_revision = None;
            'outer: loop {
                let mut wopts = WatchOptions::new();
                if let Some(rev) = last_revision {
                    wopts = wopts.with_start_revision(rev + 1);
                }
                let watch = retry_store(|| {
                    let mut wc = wc.clone();
                    let key = key.clone();
                    let wopts = wopts.clone();
                    async move { Ok(wc.watch(key, Some(wopts)).await?) }
                })
                .await;
                let (mut watcher, mut stream) = match watch {
                    Ok(watch) => watch,
                    Err(e) => {
                        error!("failed to watch {key}: {e:?}");
                        break 'outer;
                    }
                };

                'inner: loop {
                    let watch_resp = tokio::select! {
                        _ = tx.closed() => {
                            let _ = watcher.cancel().await;
                            break 'outer;
                        }
                        watch_resp = stream.next() => watch_resp,
                    };
                    match watch_resp {
                        Some(Ok(watch_resp)) => {
                            if watch_resp.canceled() {
                                // This is probably because the compaction_revision < initial revision
                                error!("watch cancelled: {watch_resp:?}");
                                break 'outer;
                            }
                            for event in watch_resp.events() {
                                let Some(kv) = event.kv() else {
                                    continue;
                                };
                                let revision = kv.mod_revision();
                                last_revision.replace(revision);
                                let key_event = match event.event_type() {
                                    EventType::Put => KeyEvent::Put { revision },
                                    EventType::Delete => KeyEvent::Delete { revision },
                                };
                                if tx.send(key_event).await.is_err() {
                                    warn!("closed watch event receiver for {key}");
                                    break 'outer;
                                }
                            }
                        }
                        Some(Err(e)) => {
                            error!("watch stream error: {:?}", e);
                            break 'inner;
                        }
                        None => break 'inner,
                    }
                }
                let _ = watcher.cancel().await;
            }
        });
        rx
    }
}

///
/// Renews through the cached keeper of `lease_id`, opening one if needed.
///
/// The keeper is out of the cache while a renewal is in flight and only goes back after a
/// response was read. A renewal that fails, or is dropped by a deadline, takes its keeper with
/// it, so a late response can never be read by the next renewal.
///
async fn renew_with_cached_keeper<K, Open, OpenFut, Renew, RenewFut>(
    keepers: &Mutex<HashMap<LeaseId, K>>,
    lease_id: LeaseId,
    open: Open,
    renew: Renew,
) -> Result<i64, StoreError>
where
    Open: FnOnce() -> OpenFut,
    OpenFut: Future<Output = Result<K, StoreError>>,
    Renew: FnOnce(K) -> RenewFut,
    RenewFut: Future<Output = Result<(K, i64), StoreError>>,
{
    let cached = keepers.lock().await.remove(&lease_id);
    let keeper = match cached {
        Some(keeper) => keeper,
        None => open().await?,
    };
    let (keeper, ttl) = renew(keeper).await?;
    keepers.lock().await.insert(lease_id, keeper);
    Ok(ttl)
}

async fn renew_once(
    (mut keeper, mut stream): (LeaseKeeper, LeaseKeepAliveStream),
) -> Result<((LeaseKeeper, LeaseKeepAliveStream), i64), StoreError> {
    keeper.keep_alive().await?;
    match stream.message().await? {
        Some(resp) => Ok(((keeper, stream), resp.ttl())),
        None => Err(tonic::Status::unavailable("lease keep alive stream ended").into()),
    }
}
