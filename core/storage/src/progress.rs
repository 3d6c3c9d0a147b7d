//! Progress reporting for file transfers.

/// Direction of a transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDirection {
    Upload,
    Download,
}

/// Snapshot handed to a [`TransferObserver`].
///
/// Uploads report once per acknowledged chunk, downloads once per completed
/// segment. `bytes_done` never decreases during one transfer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferProgress {
    pub direction: TransferDirection,
    /// Name of the file being transferred.
    pub name: String,
    /// Chunks or segments finished so far.
    pub parts_done: usize,
    /// Total chunks or segments.
    pub parts_total: usize,
    pub bytes_done: u64,
    pub total_bytes: u64,
}

impl TransferProgress {
    /// Get progress as a percentage (0.0 to 100.0).
    pub fn percent(&self) -> f64 {
        if self.total_bytes == 0 {
            return 100.0;
        }
        (self.bytes_done as f64 / self.total_bytes as f64) * 100.0
    }

    /// Check if transfer is complete.
    pub fn is_complete(&self) -> bool {
        self.bytes_done >= self.total_bytes
    }
}

/// Receives progress notifications from the transfer engines.
///
/// Closures `Fn(&TransferProgress)` implement this trait.
pub trait TransferObserver: Send + Sync {
    fn on_progress(&self, progress: &TransferProgress);
}

impl<F> TransferObserver for F
where
    F: Fn(&TransferProgress) + Send + Sync,
{
    fn on_progress(&self, progress: &TransferProgress) {
        self(progress)
    }
}
