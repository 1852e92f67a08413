use {
    crate::store::StoreError,
    retry::delay::Exponential,
    std::{future::Future, time::Duration},
    tonic::Code,
    tracing::{error, warn},
};

pub fn is_transient(err: &StoreError) -> bool {
    match err.code() {
        Code::Ok => false,
        Code::Cancelled => false,
        Code::Unknown => true,
        Code::InvalidArgument => false,
        Code::DeadlineExceeded => true,
        Code::NotFound => false,
        Code::AlreadyExists => false,
        Code::PermissionDenied => false,
        Code::ResourceExhausted => true,
        Code::FailedPrecondition => false,
        Code::Aborted => false,
        Code::OutOfRange => false,
        Code::Unimplemented => false,
        Code::Internal => true,
        Code::Unavailable => true,
        Code::DataLoss => true,
        Code::Unauthenticated => false,
    }
}

///
/// Default backoff for one-shot store requests: 10ms, 100ms, 1s, then give up.
///
pub fn default_retry_strategy() -> impl Iterator<Item = Duration> {
    Exponential::from_millis_with_factor(10, 10.0).take(3)
}

///
/// Bounds a single store request by `deadline`.
///
pub async fn with_deadline<T>(
    deadline: Duration,
    request: impl Future<Output = Result<T, StoreError>>,
) -> Result<T, StoreError> {
    match tokio::time::timeout(deadline, request).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::DeadlineExceeded(deadline)),
    }
}

///
/// Retry a store operation on "transient" errors only.
///
/// Transient errors happen because of outside forces that cannot be prevented,
/// such as a network partition or a slow member. A gRPC status like "Not found" or
/// "Cancelled" is returned immediately.
///
/// Examples
///
/// ```no_run
/// use etcd_quorum::{retry::retry_store, store::{memory::MemoryStore, CoordinationStore}};
///
/// # async fn run() -> Result<(), etcd_quorum::store::StoreError> {
/// let store = MemoryStore::new();
/// let lease_id = retry_store(|| store.grant_lease(5)).await?;
/// # Ok(())
/// # }
/// ```
///
pub async fn retry_store<T, F, Fut>(f: F) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, StoreError>>,
    F: FnMut() -> Fut,
{
    retry_store_with_strategy(default_retry_strategy(), f).await
}

pub async fn retry_store_with_strategy<T, F, Fut>(
    retry_strategy: impl IntoIterator<Item = Duration>,
    mut f: F,
) -> Result<T, StoreError>
where
    Fut: Future<Output = Result<T, StoreError>>,
    F: FnMut() -> Fut,
{
    let mut retry_strategy = retry_strategy.into_iter();
    loop {
        match f().await {
            Ok(o) => return Ok(o),
            Err(e) => {
                if is_transient(&e) {
                    warn!("failed due to transient state {:?}", e);
                    match retry_strategy.next() {
                        Some(duration) => {
                            tokio::time::sleep(duration).await;
                        }
                        None => return Err(e),
                    }
                } else {
                    error!("failed due to non-transient state: {:?}", e);
                    return Err(e);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        crate::classify::Interrupted,
        std::sync::atomic::{AtomicUsize, Ordering},
    };

    #[tokio::test(start_paused = true)]
    async fn it_should_retry_transient_errors_until_success() {
        let attempts = AtomicUsize::new(0);
        let result = retry_store(|| {
            let attempt = attempts.fetch_add(1, Ordering::SeqCst);
            async move {
                if attempt < 2 {
                    Err(StoreError::from(tonic::Status::unavailable("down")))
                } else {
                    Ok(attempt)
                }
            }
        })
        .await;
        assert_eq!(result.expect("should succeed"), 2);
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn it_should_give_up_once_the_strategy_is_exhausted() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = retry_store(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::DeadlineExceeded(Duration::from_secs(1))) }
        })
        .await;
        assert!(result.is_err());
        assert_eq!(attempts.load(Ordering::SeqCst), 4);
    }

    #[tokio::test]
    async fn it_should_not_retry_interrupted_or_not_found() {
        let attempts = AtomicUsize::new(0);
        let result: Result<(), _> = retry_store(|| {
            attempts.fetch_add(1, Ordering::SeqCst);
            async { Err(StoreError::Interrupted(Interrupted::new("stop"))) }
        })
        .await;
        assert!(matches!(result, Err(StoreError::Interrupted(_))));
        assert_eq!(attempts.load(Ordering::SeqCst), 1);

        assert!(!is_transient(&StoreError::from(tonic::Status::not_found("lease"))));
        assert!(is_transient(&StoreError::from(tonic::Status::unknown("?"))));
    }
}
