//! Common utilities and types shared across GraphDrive crates.
//!
//! This module provides the error taxonomy and the closed enumerations that
//! are validated at the API boundary (conflict behavior, sharing links,
//! storage units) so every crate speaks the same vocabulary.

pub mod error;
pub mod types;

pub use error::{Error, Result};
pub use types::{
    ConflictBehavior, DrivePath, LinkScope, LinkType, Secret, StorageUnit, TransferResult,
    TransferStatus, TransferTarget,
};
