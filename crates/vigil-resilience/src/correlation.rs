use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use vigil_core::lock_or_recover;

use crate::ConnectionError;

type Waiter<T> = oneshot::Sender<Result<T, ConnectionError>>;

/// Request/response correlation map for a connector speaking an async protocol.
#[derive(Debug)]
pub struct PendingRequests<T> {
    prefix: String,
    next_id: AtomicU64,
    waiters: Mutex<HashMap<String, Waiter<T>>>,
}

impl<T> PendingRequests<T> {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next_id: AtomicU64::new(1),
            waiters: Mutex::new(HashMap::new()),
        }
    }

    /// Allocates a correlation id and the receiver its response will arrive on.
    pub fn register(&self) -> (String, oneshot::Receiver<Result<T, ConnectionError>>) {
        let id = format!(
            "{}-{}",
            self.prefix,
            self.next_id.fetch_add(1, Ordering::Relaxed)
        );
        let (sender, receiver) = oneshot::channel();
        lock_or_recover(&self.waiters).insert(id.clone(), sender);
        (id, receiver)
    }

    /// Delivers a response; returns false when nobody waits on `id` anymore.
    pub fn resolve(&self, id: &str, result: Result<T, ConnectionError>) -> bool {
        let waiter = lock_or_recover(&self.waiters).remove(id);
        match waiter {
            Some(sender) => sender.send(result).is_ok(),
            None => false,
        }
    }

    pub fn forget(&self, id: &str) {
        lock_or_recover(&self.waiters).remove(id);
    }

    /// Fails every outstanding request with `error`; returns how many were waiting.
    pub fn fail_all(&self, error: &ConnectionError) -> usize {
        let drained: Vec<_> = lock_or_recover(&self.waiters).drain().collect();
        let count = drained.len();
        for (_, sender) in drained {
            let _ = sender.send(Err(error.clone()));
        }
        count
    }

    pub fn len(&self) -> usize {
        lock_or_recover(&self.waiters).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Awaits a registered response, bounded by `timeout`.
    pub async fn wait(
        &self,
        id: &str,
        receiver: oneshot::Receiver<Result<T, ConnectionError>>,
        timeout: Duration,
    ) -> Result<T, ConnectionError> {
        match tokio::time::timeout(timeout, receiver).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(ConnectionError::Disconnected(
                "response channel dropped".to_string(),
            )),
            Err(_) => {
                self.forget(id);
                Err(ConnectionError::Timeout(
                    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::PendingRequests;
    use crate::ConnectionError;
    use std::time::Duration;

    #[tokio::test]
    async fn functional_resolve_routes_response_to_matching_waiter() {
        let pending = PendingRequests::<String>::new("cmd");
        let (first_id, first) = pending.register();
        let (second_id, second) = pending.register();
        assert_ne!(first_id, second_id);
        assert!(pending.resolve(&second_id, Ok("two".to_string())));
        assert!(pending.resolve(&first_id, Ok("one".to_string())));
        assert!(!pending.resolve(&first_id, Ok("again".to_string())));
        assert_eq!(
            pending.wait(&first_id, first, Duration::from_secs(1)).await,
            Ok("one".to_string())
        );
        assert_eq!(
            pending.wait(&second_id, second, Duration::from_secs(1)).await,
            Ok("two".to_string())
        );
    }

    #[tokio::test]
    async fn integration_disconnect_fails_all_outstanding_requests_immediately() {
        let pending = PendingRequests::<()>::new("cmd");
        let (first_id, first) = pending.register();
        let (second_id, second) = pending.register();
        let error = ConnectionError::Disconnected("child exited".to_string());
        assert_eq!(pending.fail_all(&error), 2);
        assert!(pending.is_empty());
        assert_eq!(
            pending.wait(&first_id, first, Duration::from_secs(30)).await,
            Err(error.clone())
        );
        assert_eq!(
            pending.wait(&second_id, second, Duration::from_secs(30)).await,
            Err(error)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn regression_timed_out_request_is_forgotten() {
        let pending = PendingRequests::<()>::new("cmd");
        let (id, receiver) = pending.register();
        let result = pending.wait(&id, receiver, Duration::from_millis(50)).await;
        assert_eq!(result, Err(ConnectionError::Timeout(50)));
        assert!(pending.is_empty());
    }
}
