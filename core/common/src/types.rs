//! Common types used throughout GraphDrive.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::PathBuf;
use std::str::FromStr;
use zeroize::Zeroize;

use crate::{Error, Result};

/// What the server does when an uploaded file or new folder collides with an
/// existing item of the same name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConflictBehavior {
    /// Reject the request.
    Fail,
    /// Overwrite the existing item.
    Replace,
    /// Keep both, letting the server pick a new name.
    #[default]
    Rename,
}

impl ConflictBehavior {
    /// Wire value for `@microsoft.graph.conflictBehavior`.
    pub fn as_str(&self) -> &'static str {
        match self {
            ConflictBehavior::Fail => "fail",
            ConflictBehavior::Replace => "replace",
            ConflictBehavior::Rename => "rename",
        }
    }
}

impl FromStr for ConflictBehavior {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "fail" => Ok(ConflictBehavior::Fail),
            "replace" => Ok(ConflictBehavior::Replace),
            "rename" => Ok(ConflictBehavior::Rename),
            other => Err(Error::InvalidInput(format!(
                "conflict behavior must be 'fail', 'replace' or 'rename', got '{}'",
                other
            ))),
        }
    }
}

impl fmt::Display for ConflictBehavior {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Kind of sharing link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkType {
    View,
    Edit,
    /// Embeddable HTML iframe, personal drives only.
    Embed,
}

impl LinkType {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkType::View => "view",
            LinkType::Edit => "edit",
            LinkType::Embed => "embed",
        }
    }
}

impl FromStr for LinkType {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "view" => Ok(LinkType::View),
            "edit" => Ok(LinkType::Edit),
            "embed" => Ok(LinkType::Embed),
            other => Err(Error::InvalidInput(format!(
                "link type must be 'view', 'edit' or 'embed', got '{}'",
                other
            ))),
        }
    }
}

/// Audience of a sharing link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LinkScope {
    /// Anyone holding the link.
    #[default]
    Anonymous,
    /// Members of the tenant, business drives only.
    Organization,
}

impl LinkScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            LinkScope::Anonymous => "anonymous",
            LinkScope::Organization => "organization",
        }
    }
}

impl FromStr for LinkScope {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "anonymous" => Ok(LinkScope::Anonymous),
            "organization" => Ok(LinkScope::Organization),
            other => Err(Error::InvalidInput(format!(
                "link scope must be 'anonymous' or 'organization', got '{}'",
                other
            ))),
        }
    }
}

/// Unit used when reporting drive usage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StorageUnit {
    B,
    Kb,
    Mb,
    #[default]
    Gb,
}

impl StorageUnit {
    /// Number of bytes in one unit.
    pub fn bytes(&self) -> u64 {
        match self {
            StorageUnit::B => 1,
            StorageUnit::Kb => 1024,
            StorageUnit::Mb => 1024 * 1024,
            StorageUnit::Gb => 1024 * 1024 * 1024,
        }
    }

    /// Convert a byte count to this unit, rounded to one decimal place.
    /// Byte counts are returned unrounded.
    pub fn convert(&self, bytes: u64) -> f64 {
        match self {
            StorageUnit::B => bytes as f64,
            _ => (bytes as f64 / self.bytes() as f64 * 10.0).round() / 10.0,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            StorageUnit::B => "b",
            StorageUnit::Kb => "kb",
            StorageUnit::Mb => "mb",
            StorageUnit::Gb => "gb",
        }
    }
}

impl FromStr for StorageUnit {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "b" => Ok(StorageUnit::B),
            "kb" => Ok(StorageUnit::Kb),
            "mb" => Ok(StorageUnit::Mb),
            "gb" => Ok(StorageUnit::Gb),
            other => Err(Error::InvalidInput(format!(
                "'{}' is not a supported unit",
                other
            ))),
        }
    }
}

/// A path inside the drive, rooted at the drive root.
///
/// Used for path-addressed lookups (`root:/a/b`), not for local files.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct DrivePath {
    components: Vec<String>,
}

impl DrivePath {
    /// Create a root path.
    pub fn root() -> Self {
        Self {
            components: Vec::new(),
        }
    }

    /// Parse a path string into DrivePath.
    ///
    /// Uses '/' as separator. Leading and trailing separators are ignored.
    ///
    /// # Errors
    /// - Empty components (`a//b`)
    pub fn parse(path: &str) -> Result<Self> {
        let path = path.trim_start_matches('/').trim_end_matches('/');
        if path.is_empty() {
            return Ok(Self::root());
        }

        let components: Vec<String> = path.split('/').map(String::from).collect();
        if components.iter().any(|c| c.is_empty()) {
            return Err(Error::InvalidInput(
                "Path component cannot be empty".to_string(),
            ));
        }
        Ok(Self { components })
    }

    /// Check if this is the root path.
    pub fn is_root(&self) -> bool {
        self.components.is_empty()
    }

    /// Get the item name (last component).
    pub fn name(&self) -> Option<&str> {
        self.components.last().map(|s| s.as_str())
    }

    /// Get the path components.
    pub fn components(&self) -> &[String] {
        &self.components
    }
}

impl fmt::Display for DrivePath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "/{}", self.components.join("/"))
    }
}

/// Secret string that zeroizes on drop and never prints its value.
#[derive(Clone, Default, PartialEq, Eq, Zeroize, Serialize, Deserialize)]
#[zeroize(drop)]
#[serde(transparent)]
pub struct Secret(String);

impl Secret {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    /// Expose the secret value.
    pub fn expose(&self) -> &str {
        &self.0
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }
}

impl From<&str> for Secret {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

impl From<String> for Secret {
    fn from(value: String) -> Self {
        Self(value)
    }
}

impl fmt::Debug for Secret {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Secret([REDACTED; {} chars])", self.0.len())
    }
}

/// Where a finished transfer landed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferTarget {
    /// Id of the drive item created by an upload.
    Item(String),
    /// Local file written by a download.
    Path(PathBuf),
}

/// Terminal state of a successful transfer.
///
/// Failures are reported as errors, never as a status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum TransferStatus {
    /// All bytes were transferred and acknowledged.
    Completed,
    /// The source was empty; the target was created without sending data.
    Empty,
}

/// Result returned to the caller once a transfer finishes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferResult {
    pub target: TransferTarget,
    pub bytes_transferred: u64,
    pub status: TransferStatus,
}

impl TransferResult {
    /// Item id for upload results.
    pub fn item_id(&self) -> Option<&str> {
        match &self.target {
            TransferTarget::Item(id) => Some(id),
            TransferTarget::Path(_) => None,
        }
    }

    /// Local path for download results.
    pub fn path(&self) -> Option<&PathBuf> {
        match &self.target {
            TransferTarget::Path(path) => Some(path),
            TransferTarget::Item(_) => None,
        }
    }
}
