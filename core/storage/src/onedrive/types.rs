//! Graph API resource models.

use chrono::{DateTime, Utc};
use percent_encoding::{utf8_percent_encode, AsciiSet, CONTROLS};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

use graphdrive_common::DrivePath;

/// Characters escaped inside one path segment of a Graph URL.
const SEGMENT: &AsciiSet = &CONTROLS
    .add(b' ')
    .add(b'"')
    .add(b'#')
    .add(b'%')
    .add(b'/')
    .add(b':')
    .add(b'<')
    .add(b'>')
    .add(b'?')
    .add(b'[')
    .add(b'\\')
    .add(b']')
    .add(b'^')
    .add(b'`')
    .add(b'{')
    .add(b'|')
    .add(b'}');

/// Percent-encode a single path segment (item id or file name).
pub fn encode_segment(segment: &str) -> String {
    utf8_percent_encode(segment, SEGMENT).to_string()
}

/// Encode a drive path for `root:/a/b:` style addressing.
pub fn encode_path(path: &DrivePath) -> String {
    path.components()
        .iter()
        .map(|c| encode_segment(c))
        .collect::<Vec<_>>()
        .join("/")
}

/// Identity attached to created/modified stamps and drive owners.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Identity {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub display_name: Option<String>,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IdentitySet {
    #[serde(default)]
    pub user: Option<Identity>,
}

impl IdentitySet {
    pub fn display_name(&self) -> Option<&str> {
        self.user.as_ref().and_then(|u| u.display_name.as_deref())
    }
}

/// Location of an item's parent.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ItemReference {
    #[serde(default)]
    pub id: Option<String>,
    #[serde(default)]
    pub drive_id: Option<String>,
    #[serde(default)]
    pub path: Option<String>,
}

/// Present on items that are files.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileFacet {
    #[serde(default)]
    pub mime_type: Option<String>,
    /// Hash name (`quickXorHash`, `sha1Hash`, ...) to value.
    #[serde(default)]
    pub hashes: HashMap<String, String>,
}

/// Present on items that are folders.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderFacet {
    #[serde(default)]
    pub child_count: u64,
}

/// Timestamps as recorded by the client that wrote the file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FileSystemInfo {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified_date_time: Option<DateTime<Utc>>,
}

/// A file or folder in the drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveItem {
    pub id: String,
    #[serde(default)]
    pub name: String,
    /// Size in bytes. For folders, the total size of their contents.
    #[serde(default)]
    pub size: u64,
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub created_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub last_modified_date_time: Option<DateTime<Utc>>,
    #[serde(default)]
    pub created_by: Option<IdentitySet>,
    #[serde(default)]
    pub last_modified_by: Option<IdentitySet>,
    #[serde(default)]
    pub parent_reference: Option<ItemReference>,
    #[serde(default)]
    pub file_system_info: Option<FileSystemInfo>,
    #[serde(default)]
    pub file: Option<FileFacet>,
    #[serde(default)]
    pub folder: Option<FolderFacet>,
    /// Short-lived pre-authenticated content URL.
    #[serde(default, rename = "@microsoft.graph.downloadUrl")]
    pub download_url: Option<String>,
}

impl DriveItem {
    pub fn is_folder(&self) -> bool {
        self.folder.is_some()
    }

    /// Items without a folder facet are treated as files.
    pub fn is_file(&self) -> bool {
        !self.is_folder()
    }

    pub fn item_type(&self) -> ItemType {
        if self.is_folder() {
            ItemType::Folder
        } else {
            ItemType::File
        }
    }

    pub fn parent_id(&self) -> Option<&str> {
        self.parent_reference
            .as_ref()
            .and_then(|p| p.id.as_deref())
    }
}

/// Kind of drive item.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ItemType {
    File,
    Folder,
}

impl ItemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ItemType::File => "file",
            ItemType::Folder => "folder",
        }
    }
}

/// One page of a children listing.
#[derive(Debug, Deserialize)]
pub(crate) struct ItemListResponse {
    #[serde(default)]
    pub value: Vec<DriveItem>,
    #[serde(default, rename = "@odata.nextLink")]
    pub next_link: Option<String>,
}

/// Account class of a drive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DriveType {
    Personal,
    Business,
    #[serde(rename = "documentLibrary")]
    DocumentLibrary,
    #[serde(other)]
    Unknown,
}

impl DriveType {
    /// Personal drives support embed links and link passwords.
    pub fn is_personal(&self) -> bool {
        matches!(self, DriveType::Personal)
    }

    /// Business and SharePoint drives support organization-scoped links.
    pub fn is_organizational(&self) -> bool {
        matches!(self, DriveType::Business | DriveType::DocumentLibrary)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            DriveType::Personal => "personal",
            DriveType::Business => "business",
            DriveType::DocumentLibrary => "sharepoint",
            DriveType::Unknown => "unknown",
        }
    }
}

/// Storage quota in bytes.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
pub struct Quota {
    #[serde(default)]
    pub used: u64,
    #[serde(default)]
    pub remaining: u64,
    #[serde(default)]
    pub total: u64,
}

/// The signed-in user's drive.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriveDetails {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    pub drive_type: DriveType,
    #[serde(default)]
    pub owner: Option<IdentitySet>,
    #[serde(default)]
    pub quota: Quota,
}

impl DriveDetails {
    pub fn owner(&self) -> Option<&Identity> {
        self.owner.as_ref().and_then(|o| o.user.as_ref())
    }
}

/// Drive usage converted to a display unit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Usage {
    pub used: f64,
    pub capacity: f64,
    pub unit: graphdrive_common::StorageUnit,
}

impl Usage {
    pub fn percent(&self) -> f64 {
        if self.capacity == 0.0 {
            return 0.0;
        }
        self.used * 100.0 / self.capacity
    }
}

/// Response to `createUploadSession`.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct UploadSessionResponse {
    pub upload_url: String,
    #[serde(default)]
    pub expiration_date_time: Option<DateTime<Utc>>,
}

/// State of a server-side copy, as reported by its monitor URL.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct CopyMonitorStatus {
    pub status: String,
    #[serde(default)]
    pub percentage_complete: f64,
    #[serde(default)]
    pub resource_id: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub(crate) struct SharingLink {
    #[serde(default)]
    pub web_url: Option<String>,
    #[serde(default)]
    pub web_html: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub(crate) struct PermissionResponse {
    pub link: SharingLink,
}
