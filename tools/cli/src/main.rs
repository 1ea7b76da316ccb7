//! sitesync CLI - keep a local folder in sync with an FTP/SFTP site.
//!
//! The workspace holds a `.sitesync.json` describing the remote site. Every
//! command loads it, starts the sync service and talks to it.

mod watcher;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use tokio::sync::broadcast::error::RecvError;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, FmtSubscriber};

use sitesync_common::{Protocol, SiteConfig, CONFIG_FILE_NAME};
use sitesync_sync::{
    ChangeKind, Command, EnqueueOutcome, Response, ServiceHandle, SyncEvent, SyncReport,
    SyncService,
};
use sitesync_transport::create_default_registry;

#[derive(Parser)]
#[command(name = "sitesync")]
#[command(about = "sitesync - Mirror a local folder to an FTP/SFTP site")]
#[command(version)]
struct Cli {
    /// Workspace root (default: current directory).
    #[arg(short, long, global = true)]
    workspace: Option<PathBuf>,

    /// Enable verbose logging.
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Upload changes as they happen until Ctrl-C.
    Watch,

    /// Download newer remote files into a workspace directory.
    Sync {
        /// Directory to sync (default: workspace root).
        dir: Option<PathBuf>,
    },

    /// Upload a file or every tracked file below a folder.
    Upload {
        path: PathBuf,
    },

    /// Download a single file from the site.
    Download {
        path: PathBuf,
    },

    /// Validate the configuration and test the connection.
    Check,

    /// Write a template configuration file.
    Init {
        /// Overwrite an existing configuration.
        #[arg(short, long)]
        force: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging
    let level = if cli.verbose { "debug" } else { "info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .compact()
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let workspace = workspace_root(cli.workspace.as_deref())?;

    match cli.command {
        Commands::Watch => cmd_watch(&workspace).await,
        Commands::Sync { dir } => cmd_sync(&workspace, dir.as_deref()).await,
        Commands::Upload { path } => cmd_upload(&workspace, &path).await,
        Commands::Download { path } => cmd_download(&workspace, &path).await,
        Commands::Check => cmd_check(&workspace).await,
        Commands::Init { force } => cmd_init(&workspace, force),
    }
}

fn workspace_root(arg: Option<&Path>) -> Result<PathBuf> {
    let dir = match arg {
        Some(dir) => dir.to_path_buf(),
        None => std::env::current_dir().context("Failed to determine current directory")?,
    };
    dir.canonicalize()
        .with_context(|| format!("Workspace {} not found", dir.display()))
}

/// Absolute form of a path given on the command line.
fn absolute(path: &Path) -> Result<PathBuf> {
    if path.is_absolute() {
        return Ok(path.to_path_buf());
    }
    Ok(std::env::current_dir()
        .context("Failed to determine current directory")?
        .join(path))
}

fn config_path(workspace: &Path) -> PathBuf {
    workspace.join(CONFIG_FILE_NAME)
}

fn load_config(workspace: &Path) -> Result<SiteConfig> {
    let path = config_path(workspace);
    SiteConfig::load(&path).with_context(|| {
        format!(
            "Failed to load {} (run `sitesync init` to create one)",
            path.display()
        )
    })
}

/// Start the service for `workspace` with its configuration applied.
async fn start(workspace: &Path) -> Result<ServiceHandle> {
    let config = load_config(workspace)?;
    let handle = SyncService::new(workspace, create_default_registry()).spawn();
    handle
        .request(Command::ApplyConfig(Some(config)))
        .await
        .context("Failed to apply configuration")?;
    Ok(handle)
}

/// Watch the workspace and upload changes.
async fn cmd_watch(workspace: &Path) -> Result<()> {
    let handle = start(workspace).await?;
    let mut events = handle.subscribe();
    let (_watcher, mut changes) = watcher::watch(workspace)?;
    let config_file = config_path(workspace);

    // A failed attempt keeps retrying in the background.
    if let Err(e) = handle.request(Command::Connect).await {
        warn!("Initial connection failed: {}", e);
    }
    println!("Watching {} (Ctrl-C to stop)", workspace.display());

    loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(event) => print_event(&event),
                Err(RecvError::Lagged(n)) => warn!("Dropped {} notifications", n),
                Err(RecvError::Closed) => break,
            },
            Some(change) = changes.recv() => {
                if change.path == config_file {
                    reload_config(&handle, workspace, change.kind).await;
                    continue;
                }
                if let Err(e) = handle.request(Command::Watch(change)).await {
                    warn!("Change not handled: {}", e);
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("Stopping");
                break;
            }
        }
    }

    handle.shutdown().await;
    Ok(())
}

async fn reload_config(handle: &ServiceHandle, workspace: &Path, kind: ChangeKind) {
    let config = match kind {
        ChangeKind::Deleted => None,
        _ => match load_config(workspace) {
            Ok(config) => Some(config),
            Err(e) => {
                warn!("Keeping previous configuration: {:#}", e);
                return;
            }
        },
    };
    let configured = config.is_some();

    match handle.request(Command::ApplyConfig(config)).await {
        Ok(_) if configured => {
            println!("Configuration reloaded");
            if let Err(e) = handle.request(Command::Connect).await {
                warn!("Connection failed: {}", e);
            }
        }
        Ok(_) => println!("Configuration removed, sync stopped"),
        Err(e) => warn!("Configuration rejected: {}", e),
    }
}

/// Pull a directory from the site.
async fn cmd_sync(workspace: &Path, dir: Option<&Path>) -> Result<()> {
    let dir = match dir {
        Some(dir) => absolute(dir)?,
        None => workspace.to_path_buf(),
    };
    let handle = start(workspace).await?;

    let result = handle.request(Command::SyncFolder(dir.clone())).await;
    handle.shutdown().await;

    match result.with_context(|| format!("Failed to sync {}", dir.display()))? {
        Response::Synced(report) => print_report(&report),
        other => anyhow::bail!("Unexpected response: {:?}", other),
    }
    Ok(())
}

/// Upload a file or folder and wait until every queued file is done.
async fn cmd_upload(workspace: &Path, path: &Path) -> Result<()> {
    let path = absolute(path)?;
    let handle = start(workspace).await?;
    let mut events = handle.subscribe();

    let command = if path.is_dir() {
        Command::UploadFolder(path.clone())
    } else {
        Command::UploadFile(path.clone())
    };
    let expected = match handle.request(command).await {
        Ok(Response::Queued(n)) => n,
        Ok(Response::Enqueued(EnqueueOutcome::Queued)) => 1,
        Ok(Response::Enqueued(outcome)) => {
            handle.shutdown().await;
            anyhow::bail!("{} not uploaded: {:?}", path.display(), outcome);
        }
        Ok(other) => {
            handle.shutdown().await;
            anyhow::bail!("Unexpected response: {:?}", other);
        }
        Err(e) => {
            handle.shutdown().await;
            return Err(e).with_context(|| format!("Failed to upload {}", path.display()));
        }
    };

    let (mut uploaded, mut failed) = (0, 0);
    while uploaded + failed < expected {
        let event = match events.recv().await {
            Ok(event) => event,
            Err(RecvError::Lagged(n)) => {
                warn!("Dropped {} notifications", n);
                continue;
            }
            Err(RecvError::Closed) => break,
        };
        print_event(&event);
        match event {
            SyncEvent::Uploaded { .. } => uploaded += 1,
            SyncEvent::UploadFailed { .. } => failed += 1,
            SyncEvent::ConnectionFailed { error, .. } => {
                handle.shutdown().await;
                anyhow::bail!("Cannot connect: {}", error);
            }
            _ => {}
        }
    }
    handle.shutdown().await;

    println!("{} uploaded, {} failed", uploaded, failed);
    if failed > 0 {
        anyhow::bail!("{} file(s) failed to upload", failed);
    }
    Ok(())
}

/// Download one file.
async fn cmd_download(workspace: &Path, path: &Path) -> Result<()> {
    let path = absolute(path)?;
    let handle = start(workspace).await?;

    let result = handle.request(Command::DownloadFile(path.clone())).await;
    handle.shutdown().await;

    result.with_context(|| format!("Failed to download {}", path.display()))?;
    println!("Downloaded {}", path.display());
    Ok(())
}

/// Validate the configuration and open a connection.
async fn cmd_check(workspace: &Path) -> Result<()> {
    let handle = start(workspace).await?;

    let connected = handle.request(Command::Connect).await;
    let status = handle.request(Command::Status).await;
    handle.shutdown().await;

    connected.context("Connection check failed")?;
    if let Response::Status(status) = status? {
        println!("{}", serde_json::to_string_pretty(&status)?);
    }
    println!("Configuration OK");
    Ok(())
}

/// Write a template configuration.
fn cmd_init(workspace: &Path, force: bool) -> Result<()> {
    let path = config_path(workspace);
    write_template(&path, force)?;
    println!("Wrote {}", path.display());
    println!("Edit host, credentials and remotePath before running other commands.");
    Ok(())
}

fn write_template(path: &Path, force: bool) -> Result<()> {
    if path.exists() && !force {
        anyhow::bail!("{} already exists (use --force to overwrite)", path.display());
    }

    let mut config = SiteConfig::new("ftp.example.com", Protocol::Ftp);
    config.name = "My Site".to_string();
    config.credentials.username = "user".to_string();
    config.credentials.password = Some("password".to_string());
    config.remote_path = "/public_html".to_string();

    let text = serde_json::to_string_pretty(&config)?;
    std::fs::write(path, text + "\n")
        .with_context(|| format!("Failed to write {}", path.display()))?;
    Ok(())
}

fn print_event(event: &SyncEvent) {
    match event {
        SyncEvent::Connecting { host } => println!("Connecting to {}...", host),
        SyncEvent::Connected { host } => println!("Connected to {}", host),
        SyncEvent::ConnectionFailed { host, error } => {
            eprintln!("Connection to {} failed: {}", host, error)
        }
        SyncEvent::Disconnected { error: Some(error) } => eprintln!("Connection lost: {}", error),
        SyncEvent::Disconnected { error: None } => println!("Disconnected"),
        SyncEvent::Uploaded { local, remote } => {
            println!("  [UP]   {} -> {}", local.display(), remote)
        }
        SyncEvent::UploadFailed { local, error } => {
            eprintln!("  [FAIL] {}: {}", local.display(), error)
        }
        SyncEvent::Deleted { remote } => println!("  [DEL]  {}", remote),
        SyncEvent::Downloaded { local, remote } => {
            println!("  [DOWN] {} -> {}", remote, local.display())
        }
        SyncEvent::SyncFinished { report } => print_report(report),
    }
}

fn print_report(report: &SyncReport) {
    println!("Sync finished in {:.1}s:", report.duration.as_secs_f64());
    println!("  Downloaded: {}", report.files_downloaded);
    println!("  Up to date: {}", report.files_skipped);
    println!("  Directories created: {}", report.directories_created);
    if report.files_failed > 0 {
        println!("  Failed: {}", report.files_failed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_parse_sync_with_dir() {
        let cli = Cli::try_parse_from(["sitesync", "-w", "/site", "sync", "blog"]).unwrap();
        assert_eq!(cli.workspace.as_deref(), Some(Path::new("/site")));
        assert!(matches!(cli.command, Commands::Sync { dir: Some(ref d) } if d == Path::new("blog")));
    }

    #[test]
    fn test_template_is_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = config_path(dir.path());

        write_template(&path, false).unwrap();
        let config = SiteConfig::load(&path).unwrap();
        assert_eq!(config.host, "ftp.example.com");
        assert_eq!(config.remote_path, "/public_html");

        assert!(write_template(&path, false).is_err());
        write_template(&path, true).unwrap();
    }
}
