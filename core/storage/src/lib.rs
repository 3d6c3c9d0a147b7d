//! Microsoft Graph storage client for GraphDrive.
//!
//! The crate is layered bottom-up:
//! - [`http`]: transport abstraction, so everything above can run against an
//!   in-memory transport
//! - [`retry`]: per-chunk and per-segment retry budgets
//! - [`progress`]: per-chunk and per-segment transfer progress
//! - [`onedrive`]: authorization, the Graph request executor, transfer
//!   engines and the drive facade

pub mod http;
pub mod onedrive;
pub mod progress;
pub mod retry;

pub use http::{HttpMethod, HttpRequest, HttpResponse, HttpTransport, ReqwestTransport};
pub use onedrive::{OneDrive, TransferOptions};
pub use progress::{TransferDirection, TransferObserver, TransferProgress};
pub use retry::{RetryConfig, TransferPart};
