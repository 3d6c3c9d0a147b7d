//! GraphDrive CLI - Command line interface for a OneDrive account.
//!
//! Authorizes once with `graphdrive auth`, then works against the drive using
//! the refresh token stored in the config file.

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use clap::{CommandFactory, Parser, Subcommand};
use clap_complete::Shell;
use std::io::{self, BufRead, Write};
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn, Level};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use graphdrive_common::{ConflictBehavior, DrivePath, LinkScope, LinkType, StorageUnit};
use graphdrive_storage::onedrive::{
    default_config_path, load_session_config, save_session_config, AuthorizationPrompt,
    DriveItem, OneDrive, SessionConfig, DEFAULT_CONFIG_KEY,
};
use graphdrive_storage::{TransferOptions, TransferProgress};

const MIB: u64 = 1024 * 1024;

#[derive(Parser)]
#[command(name = "graphdrive")]
#[command(about = "GraphDrive - OneDrive from the command line")]
#[command(version)]
struct Cli {
    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Session config file.
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Section of the config file to use.
    #[arg(short, long, global = true, default_value = DEFAULT_CONFIG_KEY)]
    key: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Authorize an app registration and store the session.
    Auth {
        /// Directory (tenant) id, or "common".
        #[arg(long, default_value = "common")]
        tenant: String,

        /// Application (client) id.
        #[arg(long)]
        client_id: String,

        /// Redirect URL registered for the app.
        #[arg(long, default_value = "http://localhost:8080")]
        redirect_url: String,

        /// Open the authorization URL in the default browser.
        #[arg(long)]
        open: bool,
    },

    /// Show drive details.
    Info,

    /// Show drive usage.
    Usage {
        /// Unit: b, kb, mb or gb.
        #[arg(short, long, default_value = "gb")]
        unit: StorageUnit,
    },

    /// List a folder (default: drive root).
    Ls {
        /// Folder id.
        folder: Option<String>,
    },

    /// Show an item by id or by drive path.
    Stat {
        /// Item id.
        #[arg(required_unless_present = "path")]
        id: Option<String>,

        /// Path from the drive root, e.g. /Documents/report.pdf.
        #[arg(short, long, conflicts_with = "id")]
        path: Option<String>,
    },

    /// Create a folder.
    Mkdir {
        name: String,

        /// Parent folder id (default: drive root).
        #[arg(short, long)]
        parent: Option<String>,

        /// Create even if a folder of that name exists.
        #[arg(long)]
        always: bool,

        /// fail, replace or rename.
        #[arg(long, default_value = "rename")]
        conflict: ConflictBehavior,
    },

    /// Move an item to another folder.
    Mv {
        id: String,
        parent: String,

        /// New name for the moved item.
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Copy an item to another folder.
    Cp {
        id: String,
        parent: String,

        /// Name of the copy.
        #[arg(short, long)]
        name: Option<String>,

        /// Return without waiting for the copy to finish.
        #[arg(long)]
        no_wait: bool,
    },

    /// Rename an item.
    Rename { id: String, name: String },

    /// Delete an item.
    Rm { id: String },

    /// Create a sharing link.
    Share {
        id: String,

        /// view, edit or embed.
        #[arg(short = 't', long = "type", default_value = "view")]
        link_type: LinkType,

        /// anonymous or organization.
        #[arg(short, long, default_value = "anonymous")]
        scope: LinkScope,

        /// Link expiration (RFC 3339).
        #[arg(short, long)]
        expires: Option<DateTime<Utc>>,

        /// Protect the link with a password (prompted).
        #[arg(long)]
        password: bool,
    },

    /// Upload a file.
    Upload {
        source: PathBuf,

        /// Parent folder id (default: drive root).
        #[arg(short, long)]
        parent: Option<String>,

        /// Name in the drive (default: local file name).
        #[arg(short, long)]
        name: Option<String>,

        /// Chunk size in MiB for resumable uploads.
        #[arg(long, default_value_t = 60)]
        chunk_mib: u64,

        /// fail, replace or rename.
        #[arg(long, default_value = "rename")]
        conflict: ConflictBehavior,
    },

    /// Download a file.
    Download {
        id: String,

        /// Destination file or directory.
        #[arg(default_value = ".")]
        destination: PathBuf,

        /// Concurrent range requests.
        #[arg(short = 'j', long, default_value_t = 8)]
        connections: usize,
    },

    /// Print shell completions.
    Completions { shell: Shell },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::INFO
    };

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let config_path = cli.config.clone().unwrap_or_else(default_config_path);

    match cli.command {
        Commands::Auth {
            tenant,
            client_id,
            redirect_url,
            open,
        } => cmd_auth(&config_path, &cli.key, tenant, client_id, redirect_url, open).await,

        Commands::Completions { shell } => {
            clap_complete::generate(shell, &mut Cli::command(), "graphdrive", &mut io::stdout());
            Ok(())
        }

        command => {
            let drive = connect(&config_path, &cli.key).await?;
            let result = run(&drive, command).await;

            // Refresh tokens rotate, keep the latest even if the command failed
            let config = drive.to_config().await;
            if let Err(e) = save_session_config(&config_path, &cli.key, &config).await {
                warn!("Failed to save session: {}", e);
            }
            result
        }
    }
}

async fn run(drive: &OneDrive, command: Commands) -> Result<()> {
    match command {
        Commands::Info => cmd_info(drive).await,
        Commands::Usage { unit } => cmd_usage(drive, unit).await,
        Commands::Ls { folder } => cmd_ls(drive, folder.as_deref()).await,
        Commands::Stat { id, path } => cmd_stat(drive, id.as_deref(), path.as_deref()).await,
        Commands::Mkdir {
            name,
            parent,
            always,
            conflict,
        } => cmd_mkdir(drive, &name, parent.as_deref(), !always, conflict).await,
        Commands::Mv { id, parent, name } => {
            let item = drive
                .move_item(&id, &parent, name.as_deref())
                .await
                .context("Failed to move item")?;
            println!("Moved: {} ({})", item.name, item.id);
            Ok(())
        }
        Commands::Cp {
            id,
            parent,
            name,
            no_wait,
        } => cmd_cp(drive, &id, &parent, name.as_deref(), !no_wait).await,
        Commands::Rename { id, name } => {
            let item = drive
                .rename_item(&id, &name)
                .await
                .context("Failed to rename item")?;
            println!("Renamed: {}", item.name);
            Ok(())
        }
        Commands::Rm { id } => {
            drive.delete_item(&id).await.context("Failed to delete item")?;
            println!("Deleted: {}", id);
            Ok(())
        }
        Commands::Share {
            id,
            link_type,
            scope,
            expires,
            password,
        } => cmd_share(drive, &id, link_type, scope, expires, password).await,
        Commands::Upload {
            source,
            parent,
            name,
            chunk_mib,
            conflict,
        } => {
            let options = transfer_options()
                .with_chunk_size(chunk_mib * MIB)
                .with_conflict_behavior(conflict);
            cmd_upload(drive, &source, parent.as_deref(), name.as_deref(), &options).await
        }
        Commands::Download {
            id,
            destination,
            connections,
        } => {
            let options = transfer_options().with_max_connections(connections);
            cmd_download(drive, &id, &destination, &options).await
        }
        Commands::Auth { .. } | Commands::Completions { .. } => {
            anyhow::bail!("Command does not use a stored session")
        }
    }
}

/// Load the stored session and authorize with its refresh token.
async fn connect(config_path: &Path, key: &str) -> Result<OneDrive> {
    let config = load_session_config(config_path, key)
        .await
        .context("No stored session, run `graphdrive auth` first")?;

    OneDrive::from_config(&config)
        .await
        .context("Stored session was rejected, run `graphdrive auth` again")
}

/// Prompt for a secret without echoing it.
fn prompt_secret(prompt: &str) -> Result<String> {
    rpassword::prompt_password(prompt).context("Failed to read input")
}

/// Shows the authorization URL and reads back the redirect URL.
struct TerminalPrompt {
    open_browser: bool,
}

#[async_trait]
impl AuthorizationPrompt for TerminalPrompt {
    async fn authorize(&self, authorization_url: &str) -> graphdrive_common::Result<String> {
        println!("Visit the following URL and sign in:\n\n  {}\n", authorization_url);
        if self.open_browser {
            if let Err(e) = open::that(authorization_url) {
                warn!("Failed to open browser: {}", e);
            }
        }

        print!("Paste the URL you were redirected to: ");
        io::stdout().flush()?;
        let mut line = String::new();
        io::stdin().lock().read_line(&mut line)?;
        Ok(line.trim().to_string())
    }
}

/// Progress bar printed on stderr, redrawn in place.
fn print_progress(progress: &TransferProgress) {
    eprint!(
        "\r{} {:>5.1}% ({}/{} parts, {} of {} bytes)",
        progress.name,
        progress.percent(),
        progress.parts_done,
        progress.parts_total,
        progress.bytes_done,
        progress.total_bytes
    );
    if progress.is_complete() {
        eprintln!();
    }
}

/// Options with a progress printer, cancelled by Ctrl-C.
fn transfer_options() -> TransferOptions {
    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            warn!("Interrupted, cancelling transfer");
            on_signal.cancel();
        }
    });

    TransferOptions::new()
        .with_observer(print_progress)
        .with_cancellation(cancel)
}

async fn cmd_auth(
    config_path: &Path,
    key: &str,
    tenant: String,
    client_id: String,
    redirect_url: String,
    open_browser: bool,
) -> Result<()> {
    info!("Authorizing app {}", client_id);

    let secret = prompt_secret("Client secret value: ")?;
    if secret.is_empty() {
        anyhow::bail!("Client secret cannot be empty");
    }

    let mut config = SessionConfig::new(tenant, client_id, secret);
    config.redirect_url = redirect_url;

    let drive = OneDrive::new(config.credentials()).context("Invalid app registration")?;
    drive
        .authorize_interactive(&TerminalPrompt { open_browser })
        .await
        .context("Authorization failed")?;

    save_session_config(config_path, key, &drive.to_config().await)
        .await
        .context("Failed to save session")?;

    println!("Authorized. Session saved to {}", config_path.display());
    Ok(())
}

async fn cmd_info(drive: &OneDrive) -> Result<()> {
    let details = drive
        .drive_details()
        .await
        .context("Failed to get drive details")?;

    println!("Drive Information:");
    println!("  ID: {}", details.id);
    if let Some(name) = &details.name {
        println!("  Name: {}", name);
    }
    println!("  Type: {}", details.drive_type.as_str());
    if let Some(owner) = details.owner() {
        println!("  Owner: {}", owner.display_name.as_deref().unwrap_or("-"));
    }
    Ok(())
}

async fn cmd_usage(drive: &OneDrive, unit: StorageUnit) -> Result<()> {
    let usage = drive.usage(unit).await.context("Failed to get usage")?;
    let unit = unit.as_str().to_uppercase();

    println!(
        "Used {} {} of {} {} ({:.1}%)",
        usage.used,
        unit,
        usage.capacity,
        unit,
        usage.percent()
    );
    Ok(())
}

fn print_item(item: &DriveItem) {
    if item.is_folder() {
        println!("  [DIR]  {}/  {}", item.name, item.id);
    } else {
        println!("  [FILE] {} ({} bytes)  {}", item.name, item.size, item.id);
    }
}

async fn cmd_ls(drive: &OneDrive, folder: Option<&str>) -> Result<()> {
    let items = drive
        .list_directory(folder)
        .await
        .context("Failed to list directory")?;

    if items.is_empty() {
        println!("Folder is empty.");
    } else {
        for item in &items {
            print_item(item);
        }
    }
    Ok(())
}

async fn cmd_stat(drive: &OneDrive, id: Option<&str>, path: Option<&str>) -> Result<()> {
    let item = match (id, path) {
        (_, Some(path)) => {
            let path = DrivePath::parse(path).context("Invalid drive path")?;
            drive.detail_item_path(&path).await
        }
        (Some(id), None) => drive.detail_item(id).await,
        (None, None) => anyhow::bail!("Give an item id or --path"),
    }
    .context("Failed to get item")?;

    println!("{}:", item.name);
    println!("  ID: {}", item.id);
    println!("  Type: {}", item.item_type().as_str());
    println!("  Size: {} bytes", item.size);
    if let Some(parent) = item.parent_id() {
        println!("  Parent: {}", parent);
    }
    if let Some(modified) = item.last_modified_date_time {
        println!("  Modified: {}", modified);
    }
    if let Some(url) = &item.web_url {
        println!("  URL: {}", url);
    }
    Ok(())
}

async fn cmd_mkdir(
    drive: &OneDrive,
    name: &str,
    parent: Option<&str>,
    check_existing: bool,
    conflict: ConflictBehavior,
) -> Result<()> {
    let id = drive
        .make_folder(name, parent, check_existing, conflict)
        .await
        .context("Failed to create folder")?;

    println!("Folder: {} ({})", name, id);
    Ok(())
}

async fn cmd_cp(
    drive: &OneDrive,
    id: &str,
    parent: &str,
    name: Option<&str>,
    wait: bool,
) -> Result<()> {
    match drive
        .copy_item(id, parent, name, wait)
        .await
        .context("Failed to copy item")?
    {
        Some(copy_id) => println!("Copied: {}", copy_id),
        None => println!("Copy started."),
    }
    Ok(())
}

async fn cmd_share(
    drive: &OneDrive,
    id: &str,
    link_type: LinkType,
    scope: LinkScope,
    expires: Option<DateTime<Utc>>,
    with_password: bool,
) -> Result<()> {
    let password = if with_password {
        let password = prompt_secret("Link password: ")?;
        let confirm = prompt_secret("Confirm password: ")?;
        if password != confirm {
            anyhow::bail!("Passwords do not match");
        }
        Some(password)
    } else {
        None
    };

    let link = drive
        .create_share_link(id, link_type, password.as_deref(), expires, scope)
        .await
        .context("Failed to create link")?;

    println!("{}", link);
    Ok(())
}

async fn cmd_upload(
    drive: &OneDrive,
    source: &Path,
    parent: Option<&str>,
    name: Option<&str>,
    options: &TransferOptions,
) -> Result<()> {
    info!("Uploading {}", source.display());

    let result = drive
        .upload_file(source, name, parent, options)
        .await
        .context("Upload failed")?;

    println!(
        "Uploaded {} bytes as item {}",
        result.bytes_transferred,
        result.item_id().unwrap_or("-")
    );
    Ok(())
}

async fn cmd_download(
    drive: &OneDrive,
    id: &str,
    destination: &Path,
    options: &TransferOptions,
) -> Result<()> {
    let result = drive
        .download_file(id, destination, options)
        .await
        .context("Download failed")?;

    let path = result
        .path()
        .map(|p| p.display().to_string())
        .unwrap_or_default();
    println!("Downloaded {} bytes to {}", result.bytes_transferred, path);
    Ok(())
}
