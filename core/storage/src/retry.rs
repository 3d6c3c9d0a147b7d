//! Per-part retry budget for transfers.
//!
//! A transfer is split into parts: upload chunks and download segments. Each
//! part gets its own budget of retries for transient failures. Once a part
//! fails for good, its error is tagged with the part's position so the caller
//! knows where the transfer stopped. Generic requests through the Graph client
//! are never retried here.

use std::fmt;
use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{debug, warn};

use graphdrive_common::{Error, Result};

/// Retry budget and backoff for one transfer part.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    /// Retries allowed per part after its first attempt.
    pub max_retries: u32,
    /// Wait before the first retry; doubled for each later one.
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Randomize each wait within its upper half.
    pub jitter: bool,
}

impl RetryConfig {
    pub fn new(max_retries: u32) -> Self {
        Self {
            max_retries,
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(30),
            jitter: true,
        }
    }

    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, delay: Duration) -> Self {
        self.max_delay = delay;
        self
    }

    pub fn with_jitter(mut self, jitter: bool) -> Self {
        self.jitter = jitter;
        self
    }

    /// Wait before retry number `retry` (zero-based).
    pub fn backoff(&self, retry: u32) -> Duration {
        let ceiling = self
            .initial_delay
            .saturating_mul(1u32 << retry.min(16))
            .min(self.max_delay);

        if self.jitter {
            ceiling.mul_f64(0.5 + rand::random::<f64>() * 0.5)
        } else {
            ceiling
        }
    }
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::new(3)
    }
}

/// Position of one unit of work within a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferPart {
    /// Upload chunk starting at `offset`. Every byte before it is acknowledged.
    Chunk { index: usize, offset: u64 },
    /// Download segment starting at `offset` in the destination file.
    Segment { index: usize, offset: u64 },
}

impl TransferPart {
    /// Tag a failure with this part's position.
    ///
    /// Authorization failures, cancellation and errors that already carry a
    /// position pass through unchanged.
    pub fn wrap(self, err: Error) -> Error {
        match err {
            Error::Auth(_) | Error::Cancelled | Error::Upload { .. } | Error::Download { .. } => {
                err
            }
            other => match self {
                TransferPart::Chunk { offset, .. } => Error::Upload {
                    offset,
                    message: other.to_string(),
                },
                TransferPart::Segment { index, offset } => Error::Download {
                    segment: index,
                    offset,
                    message: other.to_string(),
                },
            },
        }
    }
}

impl fmt::Display for TransferPart {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferPart::Chunk { index, offset } => write!(f, "chunk {} at byte {}", index, offset),
            TransferPart::Segment { index, offset } => {
                write!(f, "segment {} at byte {}", index, offset)
            }
        }
    }
}

/// Run `attempt` for `part` until it succeeds, fails with a non-transient
/// error, or spends the retry budget. Failures come back tagged by
/// [`TransferPart::wrap`].
pub(crate) async fn retry_part<T, F, Fut>(
    config: &RetryConfig,
    part: TransferPart,
    attempt: F,
) -> Result<T>
where
    F: Fn() -> Fut,
    Fut: Future<Output = Result<T>>,
{
    let mut retries = 0;
    loop {
        let err = match attempt().await {
            Ok(value) => return Ok(value),
            Err(err) => err,
        };

        if !err.is_transient() {
            return Err(part.wrap(err));
        }
        if retries == config.max_retries {
            warn!(%part, retries, "Giving up: {}", err);
            return Err(part.wrap(err));
        }

        let delay = config.backoff(retries);
        retries += 1;
        debug!(%part, retry = retries, ?delay, "Transient failure: {}", err);
        sleep(delay).await;
    }
}
