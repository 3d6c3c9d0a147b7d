//! Options shared by the upload and download engines.

use std::fmt;
use std::future::Future;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::warn;

use graphdrive_common::{ConflictBehavior, Error, Result};

use crate::progress::{TransferObserver, TransferProgress};
use crate::retry::RetryConfig;

use super::upload::DEFAULT_CHUNK_SIZE;

/// Default number of concurrent range requests per download.
pub const DEFAULT_MAX_CONNECTIONS: usize = 8;
/// Above this many connections the service is likely to throttle.
pub const THROTTLING_CONNECTION_LIMIT: usize = 16;

/// Caller configuration for one transfer.
#[derive(Clone)]
pub struct TransferOptions {
    /// Upper bound on simultaneous download requests.
    pub max_connections: usize,
    /// Upload chunk size. Rounded down to a multiple of 320 KiB when used.
    pub chunk_size: u64,
    /// What the server does when the upload target already exists.
    pub conflict: ConflictBehavior,
    /// Retry budget per chunk or segment.
    pub retry: RetryConfig,
    pub observer: Option<Arc<dyn TransferObserver>>,
    pub cancel: CancellationToken,
}

impl TransferOptions {
    pub fn new() -> Self {
        Self {
            max_connections: DEFAULT_MAX_CONNECTIONS,
            chunk_size: DEFAULT_CHUNK_SIZE,
            conflict: ConflictBehavior::default(),
            retry: RetryConfig::default(),
            observer: None,
            cancel: CancellationToken::new(),
        }
    }

    pub fn with_max_connections(mut self, max_connections: usize) -> Self {
        self.max_connections = max_connections;
        self
    }

    pub fn with_chunk_size(mut self, chunk_size: u64) -> Self {
        self.chunk_size = chunk_size;
        self
    }

    pub fn with_conflict_behavior(mut self, conflict: ConflictBehavior) -> Self {
        self.conflict = conflict;
        self
    }

    pub fn with_retry(mut self, retry: RetryConfig) -> Self {
        self.retry = retry;
        self
    }

    pub fn with_observer(mut self, observer: impl TransferObserver + 'static) -> Self {
        self.observer = Some(Arc::new(observer));
        self
    }

    /// Cancelling the token aborts the transfer with [`Error::Cancelled`].
    pub fn with_cancellation(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Check the connection limit before a download starts.
    ///
    /// # Errors
    /// - `max_connections` is zero
    pub(crate) fn validate_connections(&self) -> Result<()> {
        if self.max_connections == 0 {
            return Err(Error::InvalidInput(
                "max_connections must be at least 1".to_string(),
            ));
        }
        if self.max_connections > THROTTLING_CONNECTION_LIMIT {
            warn!(
                max_connections = self.max_connections,
                "Connection count may result in throttling and an enforced cool-down period"
            );
        }
        Ok(())
    }

    pub(crate) fn notify(&self, progress: &TransferProgress) {
        if let Some(observer) = &self.observer {
            observer.on_progress(progress);
        }
    }

    /// Run `operation` until it completes or the transfer is cancelled.
    ///
    /// Cancellation drops the operation, aborting its in-flight requests.
    pub(crate) async fn run_cancellable<T>(
        &self,
        operation: impl Future<Output = Result<T>>,
    ) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Error::Cancelled),
            result = operation => result,
        }
    }
}

impl Default for TransferOptions {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for TransferOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransferOptions")
            .field("max_connections", &self.max_connections)
            .field("chunk_size", &self.chunk_size)
            .field("conflict", &self.conflict)
            .field("retry", &self.retry)
            .field("observer", &self.observer.is_some())
            .field("cancelled", &self.cancel.is_cancelled())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::progress::TransferDirection;
    use std::sync::atomic::{AtomicU64, Ordering};

    #[test]
    fn test_defaults() {
        let options = TransferOptions::default();
        assert_eq!(options.max_connections, 8);
        assert_eq!(options.chunk_size, 60 * 1024 * 1024);
        assert_eq!(options.conflict, ConflictBehavior::Rename);
        assert_eq!(options.retry.max_retries, 3);
        assert!(options.observer.is_none());
    }

    #[test]
    fn test_zero_connections_rejected() {
        let options = TransferOptions::new().with_max_connections(0);
        assert!(matches!(
            options.validate_connections(),
            Err(Error::InvalidInput(_))
        ));
        assert!(TransferOptions::new()
            .with_max_connections(32)
            .validate_connections()
            .is_ok());
    }

    #[test]
    fn test_observer_notified() {
        let seen = Arc::new(AtomicU64::new(0));
        let seen_clone = seen.clone();
        let options = TransferOptions::new().with_observer(move |p: &TransferProgress| {
            seen_clone.store(p.bytes_done, Ordering::SeqCst)
        });

        options.notify(&TransferProgress {
            direction: TransferDirection::Upload,
            name: "a.bin".to_string(),
            parts_done: 1,
            parts_total: 2,
            bytes_done: 42,
            total_bytes: 84,
        });

        assert_eq!(seen.load(Ordering::SeqCst), 42);
    }

    #[tokio::test]
    async fn test_cancellation_aborts_operation() {
        let cancel = CancellationToken::new();
        let options = TransferOptions::new().with_cancellation(cancel.clone());
        cancel.cancel();

        let result: Result<()> = options
            .run_cancellable(async {
                tokio::time::sleep(std::time::Duration::from_secs(60)).await;
                Ok(())
            })
            .await;

        assert!(matches!(result, Err(Error::Cancelled)));
    }

    #[tokio::test]
    async fn test_completed_operation_wins_without_cancel() {
        let options = TransferOptions::new();
        let result = options.run_cancellable(async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
