//! OneDrive client over Microsoft Graph.
//!
//! This module provides:
//! - OAuth2 authorization with single-flight token refresh
//! - A request executor that retries once after a rejected token
//! - Resumable chunked uploads and concurrent ranged downloads
//! - Drive and item operations (listing, copy, move, sharing links)

pub mod auth;
pub mod client;
pub mod config;
pub mod download;
pub mod drive;
pub mod transfer;
pub mod types;
pub mod upload;

pub use auth::{
    AuthSession, AuthorizationPrompt, AuthorizationRequest, Credentials, OAuthClient,
    TokenEndpoint, TokenState,
};
pub use client::GraphClient;
pub use config::{
    default_config_path, load_session_config, save_session_config, SessionConfig,
    DEFAULT_CONFIG_KEY,
};
pub use download::{DownloadEngine, DownloadPlan};
pub use drive::OneDrive;
pub use transfer::TransferOptions;
pub use types::{DriveDetails, DriveItem, DriveType, ItemType, Usage};
pub use upload::{UploadEngine, UploadTarget};
