//! High-level OneDrive client.

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info, instrument, warn};

use graphdrive_common::{
    ConflictBehavior, DrivePath, Error, LinkScope, LinkType, Result, Secret, StorageUnit,
    TransferResult,
};

use super::auth::{AuthSession, AuthorizationPrompt, AuthorizationRequest, Credentials, OAuthClient};
use super::client::GraphClient;
use super::config::SessionConfig;
use super::download::DownloadEngine;
use super::transfer::TransferOptions;
use super::types::{
    encode_path, encode_segment, CopyMonitorStatus, DriveDetails, DriveItem, ItemListResponse,
    ItemType, PermissionResponse, Usage,
};
use super::upload::{UploadEngine, UploadTarget};
use crate::http::{HttpMethod, HttpRequest, ReqwestTransport};

/// Shortest wait between copy monitor polls.
const COPY_POLL_INTERVAL: Duration = Duration::from_secs(1);
/// Longest wait, as a multiple of the shortest.
const COPY_POLL_MAX_FACTOR: u32 = 10;
/// Monitor polls before a copy is given up on.
const COPY_MAX_POLLS: u32 = 720;

/// Client for the signed-in user's drive.
pub struct OneDrive {
    client: GraphClient,
    credentials: Credentials,
    details: OnceCell<DriveDetails>,
    copy_poll_interval: Duration,
    copy_max_polls: u32,
}

impl OneDrive {
    /// Create an unauthorized client for an app registration.
    ///
    /// # Errors
    /// - Invalid tenant or redirect URL
    /// - HTTP client construction failed
    pub fn new(credentials: Credentials) -> Result<Self> {
        let endpoint = Arc::new(OAuthClient::new(&credentials)?);
        let session = Arc::new(AuthSession::new(endpoint));
        let transport = Arc::new(ReqwestTransport::new()?);
        Ok(Self::with_client(GraphClient::new(transport, session), credentials))
    }

    /// Wrap an existing Graph client.
    pub fn with_client(client: GraphClient, credentials: Credentials) -> Self {
        Self {
            client,
            credentials,
            details: OnceCell::new(),
            copy_poll_interval: COPY_POLL_INTERVAL,
            copy_max_polls: COPY_MAX_POLLS,
        }
    }

    /// Set the shortest wait between copy monitor polls.
    pub fn with_copy_poll_interval(mut self, interval: Duration) -> Self {
        self.copy_poll_interval = interval;
        self
    }

    /// Set how many times a copy monitor is polled before giving up.
    pub fn with_copy_max_polls(mut self, polls: u32) -> Self {
        self.copy_max_polls = polls;
        self
    }

    /// Create a client from a persisted config, authorizing silently when it
    /// carries a refresh token.
    ///
    /// # Errors
    /// - The stored refresh token was rejected; interactive authorization is
    ///   required
    pub async fn from_config(config: &SessionConfig) -> Result<Self> {
        let drive = Self::new(config.credentials())?;
        if let Some(refresh_token) = &config.refresh_token {
            drive
                .session()
                .authorize_with_refresh_token(refresh_token.expose())
                .await?;
        }
        Ok(drive)
    }

    /// Snapshot of the configuration, including the current refresh token.
    pub async fn to_config(&self) -> SessionConfig {
        SessionConfig::from_credentials(&self.credentials, self.refresh_token().await)
    }

    pub fn client(&self) -> &GraphClient {
        &self.client
    }

    pub fn session(&self) -> &Arc<AuthSession> {
        self.client.session()
    }

    pub async fn is_authorized(&self) -> bool {
        self.session().is_authorized().await
    }

    pub async fn refresh_token(&self) -> Option<Secret> {
        self.session().refresh_token().await
    }

    pub fn authorization_request(&self) -> AuthorizationRequest {
        self.session().authorization_request()
    }

    pub async fn complete_authorization(
        &self,
        request: &AuthorizationRequest,
        response: &str,
    ) -> Result<()> {
        self.session().complete_authorization(request, response).await
    }

    pub async fn authorize_interactive(&self, prompt: &dyn AuthorizationPrompt) -> Result<()> {
        self.session().authorize_interactive(prompt).await
    }

    /// Fetch the drive details.
    pub async fn drive_details(&self) -> Result<DriveDetails> {
        let details: DriveDetails = self.client.get_json("me/drive").await?;
        debug!(drive_id = %details.id, drive_type = details.drive_type.as_str(), "Drive details loaded");
        Ok(details)
    }

    async fn cached_details(&self) -> Result<&DriveDetails> {
        self.details.get_or_try_init(|| self.drive_details()).await
    }

    /// Current usage and capacity in `unit`.
    pub async fn usage(&self, unit: StorageUnit) -> Result<Usage> {
        let quota = self.drive_details().await?.quota;
        Ok(Usage {
            used: unit.convert(quota.used),
            capacity: unit.convert(quota.total),
            unit,
        })
    }

    /// List the children of a folder, or of the drive root.
    pub async fn list_directory(&self, folder_id: Option<&str>) -> Result<Vec<DriveItem>> {
        let mut next = Some(match folder_id {
            Some(id) => format!("me/drive/items/{}/children", encode_segment(id)),
            None => "me/drive/root/children".to_string(),
        });

        let mut items = Vec::new();
        while let Some(path) = next.take() {
            let page: ItemListResponse = self.client.get_json(&path).await?;
            items.extend(page.value);
            next = page.next_link;
        }

        debug!(count = items.len(), "Listed directory");
        Ok(items)
    }

    pub async fn detail_item(&self, item_id: &str) -> Result<DriveItem> {
        self.client
            .get_json(&format!("me/drive/items/{}", encode_segment(item_id)))
            .await
    }

    /// Look up an item by its path from the drive root.
    pub async fn detail_item_path(&self, path: &DrivePath) -> Result<DriveItem> {
        if path.is_root() {
            return self.client.get_json("me/drive/root").await;
        }
        self.client
            .get_json(&format!("me/drive/root:/{}", encode_path(path)))
            .await
    }

    pub async fn item_type(&self, item_id: &str) -> Result<ItemType> {
        Ok(self.detail_item(item_id).await?.item_type())
    }

    pub async fn is_folder(&self, item_id: &str) -> Result<bool> {
        Ok(self.item_type(item_id).await? == ItemType::Folder)
    }

    pub async fn is_file(&self, item_id: &str) -> Result<bool> {
        Ok(self.item_type(item_id).await? == ItemType::File)
    }

    /// Create a folder and return its id.
    ///
    /// With `check_existing`, an existing folder of the same name in the
    /// parent is returned instead of creating a new one.
    pub async fn make_folder(
        &self,
        name: &str,
        parent_id: Option<&str>,
        check_existing: bool,
        conflict: ConflictBehavior,
    ) -> Result<String> {
        if name.is_empty() {
            return Err(Error::InvalidInput("Folder name cannot be empty".to_string()));
        }

        if check_existing {
            let existing = self
                .list_directory(parent_id)
                .await?
                .into_iter()
                .find(|item| item.is_folder() && item.name == name);
            if let Some(folder) = existing {
                debug!(folder_id = %folder.id, "Folder already exists");
                return Ok(folder.id);
            }
        }

        let path = match parent_id {
            Some(id) => format!("me/drive/items/{}/children", encode_segment(id)),
            None => "me/drive/root/children".to_string(),
        };
        let body = json!({
            "name": name,
            "folder": {},
            "@microsoft.graph.conflictBehavior": conflict.as_str(),
        });

        let folder: DriveItem = self.client.send_json(HttpMethod::Post, &path, &body).await?;
        info!(folder_id = %folder.id, name, "Folder created");
        Ok(folder.id)
    }

    /// Move an item to another folder, optionally renaming it.
    pub async fn move_item(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: Option<&str>,
    ) -> Result<DriveItem> {
        let mut body = json!({"parentReference": {"id": new_parent_id}});
        if let Some(name) = new_name {
            body["name"] = json!(name);
        }
        self.client
            .send_json(
                HttpMethod::Patch,
                &format!("me/drive/items/{}", encode_segment(item_id)),
                &body,
            )
            .await
    }

    pub async fn rename_item(&self, item_id: &str, new_name: &str) -> Result<DriveItem> {
        if new_name.is_empty() {
            return Err(Error::InvalidInput("New name cannot be empty".to_string()));
        }
        self.client
            .send_json(
                HttpMethod::Patch,
                &format!("me/drive/items/{}", encode_segment(item_id)),
                &json!({"name": new_name}),
            )
            .await
    }

    /// Copy an item server-side.
    ///
    /// Returns the id of the copy when `confirm_complete` is set; otherwise the
    /// copy continues in the background and `None` is returned.
    #[instrument(skip(self))]
    pub async fn copy_item(
        &self,
        item_id: &str,
        new_parent_id: &str,
        new_name: Option<&str>,
        confirm_complete: bool,
    ) -> Result<Option<String>> {
        let drive_id = self.cached_details().await?.id.clone();
        let mut body = json!({"parentReference": {"driveId": drive_id, "id": new_parent_id}});
        if let Some(name) = new_name {
            body["name"] = json!(name);
        }

        let request = HttpRequest::post(
            self.client
                .url(&format!("me/drive/items/{}/copy", encode_segment(item_id))),
        )
        .json(&body)?;
        let response = self.client.execute(request).await?;
        info!("Copy request accepted");

        if !confirm_complete {
            return Ok(None);
        }
        let monitor_url = response
            .header("location")
            .map(str::to_string)
            .ok_or_else(|| Error::Serialization("Copy response has no monitor URL".to_string()))?;

        self.wait_for_copy(&monitor_url).await.map(Some)
    }

    /// Poll a copy monitor until the operation finishes or the poll budget is
    /// spent. The wait adapts to the reported progress rate.
    async fn wait_for_copy(&self, monitor_url: &str) -> Result<String> {
        let min_wait = self.copy_poll_interval;
        let max_wait = self.copy_poll_interval * COPY_POLL_MAX_FACTOR;
        let mut wait = min_wait;
        let mut previous = 0.0;

        for _ in 0..self.copy_max_polls {
            tokio::time::sleep(wait).await;
            let value: Value = self
                .client
                .execute_anonymous(HttpRequest::get(monitor_url))
                .await?
                .json()
                .await?;

            // A finished monitor may redirect to the new item itself
            if value.get("status").is_none() {
                if let Some(id) = value.get("id").and_then(Value::as_str) {
                    return Ok(id.to_string());
                }
            }
            let status: CopyMonitorStatus = serde_json::from_value(value)?;

            match status.status.as_str() {
                "completed" => {
                    return status.resource_id.ok_or_else(|| {
                        Error::Serialization("Completed copy has no resource id".to_string())
                    })
                }
                "failed" => {
                    return Err(Error::Transient("Server-side copy failed".to_string()));
                }
                _ => {}
            }

            debug!(percent = status.percentage_complete, "Copy in progress");
            let gained = status.percentage_complete - previous;
            wait = if gained > 0.0 {
                let remaining = wait.as_secs_f64() * (100.0 / gained - 1.0);
                Duration::from_secs_f64(remaining.max(0.0)).clamp(min_wait, max_wait)
            } else {
                max_wait
            };
            previous = status.percentage_complete;
        }

        warn!(monitor_url, polls = self.copy_max_polls, "Copy still running, giving up");
        Err(Error::Transient(format!(
            "Copy did not finish after {} monitor polls",
            self.copy_max_polls
        )))
    }

    pub async fn delete_item(&self, item_id: &str) -> Result<()> {
        self.client
            .delete(&format!("me/drive/items/{}", encode_segment(item_id)))
            .await?;
        info!(item_id, "Item deleted");
        Ok(())
    }

    /// Create a sharing link and return its URL, or the iframe HTML for
    /// embed links.
    ///
    /// # Errors
    /// - `InvalidInput` for options the drive type does not support (embed
    ///   links and passwords outside personal drives, organization scope
    ///   outside business drives) or an expiration in the past
    pub async fn create_share_link(
        &self,
        item_id: &str,
        link_type: LinkType,
        password: Option<&str>,
        expiration: Option<DateTime<Utc>>,
        scope: LinkScope,
    ) -> Result<String> {
        let drive_type = self.cached_details().await?.drive_type;

        if link_type == LinkType::Embed && !drive_type.is_personal() {
            return Err(Error::InvalidInput(format!(
                "Embed links are not available for {} drives",
                drive_type.as_str()
            )));
        }
        let password = password.filter(|p| !p.is_empty());
        if password.is_some() && !drive_type.is_personal() {
            return Err(Error::InvalidInput(format!(
                "Link passwords are not available for {} drives",
                drive_type.as_str()
            )));
        }
        if scope == LinkScope::Organization && !drive_type.is_organizational() {
            return Err(Error::InvalidInput(format!(
                "Organization scope is not available for {} drives",
                drive_type.as_str()
            )));
        }
        if expiration.is_some_and(|at| at <= Utc::now()) {
            return Err(Error::InvalidInput(
                "Link expiration cannot be in the past".to_string(),
            ));
        }

        let mut body = json!({"type": link_type.as_str(), "scope": scope.as_str()});
        if let Some(password) = password {
            body["password"] = json!(password);
        }
        if let Some(at) = expiration {
            body["expirationDateTime"] = json!(at.to_rfc3339_opts(SecondsFormat::Secs, true));
        }

        let permission: PermissionResponse = self
            .client
            .send_json(
                HttpMethod::Post,
                &format!("me/drive/items/{}/createLink", encode_segment(item_id)),
                &body,
            )
            .await?;

        let link = match link_type {
            LinkType::Embed => permission.link.web_html,
            _ => permission.link.web_url,
        };
        link.ok_or_else(|| Error::Serialization("Share response did not contain a link".to_string()))
    }

    /// Upload a local file, named after it unless `new_name` is given.
    pub async fn upload_file(
        &self,
        source: &Path,
        new_name: Option<&str>,
        parent_id: Option<&str>,
        options: &TransferOptions,
    ) -> Result<TransferResult> {
        let target = UploadTarget::for_file(source, new_name, parent_id.map(str::to_string))?;
        UploadEngine::new(self.client.clone())
            .upload(source, &target, options)
            .await
    }

    /// Download a file. If `destination` is a directory, the file is written
    /// inside it under its drive name.
    pub async fn download_file(
        &self,
        item_id: &str,
        destination: &Path,
        options: &TransferOptions,
    ) -> Result<TransferResult> {
        options.validate_connections()?;
        let item = self.detail_item(item_id).await?;

        let destination: PathBuf = if tokio::fs::metadata(destination)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            destination.join(&item.name)
        } else {
            destination.to_path_buf()
        };
        if destination.exists() {
            warn!(path = %destination.display(), "Overwriting existing file");
        }

        DownloadEngine::new(self.client.clone())
            .download_item(&item, &destination, options)
            .await
    }
}
