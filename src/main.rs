// Copyright (c) 2024-2025 Jesse Morgan / Morgan Forge
// SPDX-License-Identifier: AGPL-3.0-or-later

use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use colored::Colorize;
use indicatif::{ProgressBar, ProgressStyle};
use tokio::sync::broadcast::error::RecvError;
use tracing_subscriber::{fmt, EnvFilter};

use modeldepot::download::{DownloadId, DownloadManager, DownloadStatus, SweepReport};
use modeldepot::error::{format_error, DepotError, ErrorKind};
use modeldepot::events::{DepotEvent, DownloadProgressEvent};
use modeldepot::library::{DeleteOutcome, ModelSource};
use modeldepot::utils::{format_bytes, format_eta, format_speed};
use modeldepot::DepotConfig;

/// Exit codes following sysexits.h conventions
mod exit_codes {
    pub const SUCCESS: u8 = 0;
    pub const ERROR: u8 = 1;
    pub const USAGE: u8 = 64;
    pub const DATA_ERR: u8 = 65;
    pub const IO_ERR: u8 = 74;
    pub const TEMP_FAIL: u8 = 75;
}

use exit_codes::*;

#[derive(Parser)]
#[command(name = "modeldepot")]
#[command(version, about = "Download, link and manage local model files")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Download a model into the library, showing progress
    ///
    /// Ctrl+C cancels the download and removes the partial file.
    Download {
        /// HTTP(S) URL of the model file
        url: String,
        /// Filename to store the model under
        name: String,
    },

    /// List stored models (library files and linked models)
    List,

    /// Link a model that lives outside the library
    ///
    /// Pass `-` to copy the model from stdin into the library.
    Link {
        /// Path or file:// URI of the model, or `-` for stdin
        path: String,
        /// Name to register the model under (defaults to the file name)
        #[arg(short, long)]
        name: Option<String>,
    },

    /// Delete a library model, or unlink a linked one
    Delete {
        /// Path of the model as shown by `modeldepot list`
        path: PathBuf,
    },

    /// Reconcile staged files and persisted downloads
    Sweep,

    /// Show downloads persisted by previous runs
    Status,

    /// Cancel a persisted download and remove its partial file
    Cancel {
        /// Download id as shown by `modeldepot status`
        id: u64,
    },
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("modeldepot=warn")),
        )
        .with_writer(std::io::stderr)
        .try_init();

    let cli = Cli::parse();
    match run(cli).await {
        Ok(code) => ExitCode::from(code),
        Err(err) => {
            let code = exit_code_for(&err);
            match err.downcast_ref::<DepotError>() {
                Some(depot) => eprintln!("{}", depot.to_user_message()),
                None => eprintln!("{}", format_error(&format!("{:#}", err), &[], &[])),
            }
            ExitCode::from(code)
        }
    }
}

fn exit_code_for(err: &anyhow::Error) -> u8 {
    match err.downcast_ref::<DepotError>().map(DepotError::kind) {
        Some(ErrorKind::InvalidInput) | Some(ErrorKind::NotFound) => USAGE,
        Some(ErrorKind::Conflict) | Some(ErrorKind::Integrity) => DATA_ERR,
        Some(ErrorKind::Filesystem) | Some(ErrorKind::Persistence) => IO_ERR,
        Some(ErrorKind::Transfer) => TEMP_FAIL,
        None => ERROR,
    }
}

async fn run(cli: Cli) -> Result<u8> {
    let config = DepotConfig::load().context("Failed to load configuration")?;
    let manager = DownloadManager::open_http(&config).await?;

    let code = match cli.command {
        Command::Download { url, name } => download(&manager, &url, &name).await?,
        Command::List => list(&manager).await?,
        Command::Link { path, name } => link(&manager, &path, name).await?,
        Command::Delete { path } => delete(&manager, &path).await?,
        Command::Sweep => {
            // Startup already swept once; report what a fresh pass finds
            let report = manager.sweep().await?;
            print_sweep(&report);
            SUCCESS
        }
        Command::Status => status(&manager),
        Command::Cancel { id } => cancel(&manager, DownloadId(id)).await?,
    };

    manager.shutdown()?;
    Ok(code)
}

async fn download(manager: &DownloadManager, url: &str, name: &str) -> Result<u8> {
    let mut events = manager.subscribe();
    let id = manager.download_model(url, name).await?;

    println!("{} Downloading {} {}", "[↓]".yellow(), name.bold(), format!("({})", id).dimmed());

    let pb = ProgressBar::new(100);
    pb.set_style(
        ProgressStyle::default_bar()
            .template("      {spinner:.green} [{bar:40.cyan/blue}] {pos:>3}% | {msg}")
            .context("Invalid progress template")?
            .progress_chars("█▓░"),
    );
    pb.enable_steady_tick(Duration::from_millis(100));

    let mut speed = SpeedTracker::default();
    let outcome = loop {
        tokio::select! {
            event = events.recv() => match event {
                Ok(DepotEvent::DownloadProgress(p)) if p.download_id == id => {
                    if p.status.is_terminal() {
                        break p;
                    }
                    pb.set_position(u64::from(p.progress));
                    pb.set_message(speed.describe(&p));
                }
                Ok(DepotEvent::DownloadNotice(notice)) if notice.download_id == id => {
                    pb.println(format!("      {} {}", "[!]".yellow(), notice.message));
                }
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    tracing::debug!(skipped, "Progress display fell behind");
                }
                Err(RecvError::Closed) => anyhow::bail!("event bus closed"),
            },
            _ = tokio::signal::ctrl_c() => {
                pb.set_message("Cancelling...".to_string());
                manager.cancel_download(id).await?;
            }
        }
    };

    pb.finish_and_clear();
    match outcome.status {
        DownloadStatus::Completed => {
            println!(
                "{} {} downloaded ({})",
                "[✓]".green(),
                name.bold(),
                format_bytes(outcome.bytes_downloaded)
            );
            Ok(SUCCESS)
        }
        DownloadStatus::Cancelled => {
            println!("{} Download of {} cancelled", "[!]".yellow(), name);
            Ok(ERROR)
        }
        _ => {
            let reason = outcome.error.unwrap_or_else(|| "unknown error".to_string());
            let err = DepotError::Transfer {
                model: name.to_string(),
                reason,
            };
            eprintln!("{}", err.to_user_message());
            Ok(TEMP_FAIL)
        }
    }
}

/// Turns successive progress events into a speed/ETA line.
#[derive(Default)]
struct SpeedTracker {
    last: Option<(std::time::Instant, u64)>,
    bytes_per_sec: u64,
}

impl SpeedTracker {
    fn describe(&mut self, p: &DownloadProgressEvent) -> String {
        let now = std::time::Instant::now();
        if let Some((at, bytes)) = self.last {
            let elapsed = now.duration_since(at).as_secs_f64();
            if elapsed > 0.25 && p.bytes_downloaded >= bytes {
                self.bytes_per_sec = ((p.bytes_downloaded - bytes) as f64 / elapsed) as u64;
                self.last = Some((now, p.bytes_downloaded));
            }
        } else {
            self.last = Some((now, p.bytes_downloaded));
        }

        if p.is_paused {
            return "Paused".to_string();
        }
        if p.total_bytes == 0 {
            return format!("{} | {}", format_bytes(p.bytes_downloaded), format_speed(self.bytes_per_sec));
        }
        let remaining = p.total_bytes.saturating_sub(p.bytes_downloaded);
        let eta = remaining.checked_div(self.bytes_per_sec).map(format_eta);
        format!(
            "{} / {} | {} | ETA {}",
            format_bytes(p.bytes_downloaded),
            format_bytes(p.total_bytes),
            format_speed(self.bytes_per_sec),
            eta.as_deref().unwrap_or("--")
        )
    }
}

async fn list(manager: &DownloadManager) -> Result<u8> {
    let models = manager.get_stored_models().await?;
    if models.is_empty() {
        println!("No models stored yet. Try: modeldepot download <url> <name>");
        return Ok(SUCCESS);
    }

    println!("{:<40} {:>10}  {}", "NAME".bold(), "SIZE".bold(), "PATH".bold());
    for model in &models {
        let name = if model.is_external {
            format!("{} {}", model.name, "(linked)".cyan())
        } else {
            model.name.to_string()
        };
        println!(
            "{:<40} {:>10}  {}",
            name,
            format_bytes(model.size_bytes),
            model.path.display().to_string().dimmed()
        );
    }
    Ok(SUCCESS)
}

async fn link(manager: &DownloadManager, path: &str, name: Option<String>) -> Result<u8> {
    let (source, default_name) = if path == "-" {
        let source = ModelSource::Stream {
            reader: Box::new(tokio::io::stdin()),
            size_hint: None,
        };
        (source, None)
    } else {
        let source = ModelSource::from_uri(path)?;
        let default_name = match &source {
            ModelSource::Path(p) => file_name_of(p),
            ModelSource::Stream { .. } => None,
        };
        (source, default_name)
    };

    let Some(name) = name.or(default_name) else {
        anyhow::bail!("A model name is required when linking from stdin (use --name)");
    };

    let model = manager.link_external_model(source, &name).await?;

    let how = if model.is_external { "Linked" } else { "Imported" };
    println!(
        "{} {} {} ({})",
        "[✓]".green(),
        how,
        model.name.to_string().bold(),
        format_bytes(model.size_bytes)
    );
    Ok(SUCCESS)
}

fn file_name_of(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

async fn delete(manager: &DownloadManager, path: &Path) -> Result<u8> {
    match manager.delete_model(path).await? {
        DeleteOutcome::Unlinked(model) => {
            println!(
                "{} Unlinked {} (file left at {})",
                "[✓]".green(),
                model.name,
                model.path.display()
            );
        }
        DeleteOutcome::Deleted(path) => {
            println!("{} Deleted {}", "[✓]".green(), path.display());
        }
    }
    Ok(SUCCESS)
}

fn status(manager: &DownloadManager) -> u8 {
    let downloads = manager.persisted_downloads();
    if downloads.is_empty() {
        println!("No downloads in progress.");
        return SUCCESS;
    }

    for d in downloads {
        let state = if d.is_paused {
            "paused".yellow()
        } else {
            d.status.as_str().cyan()
        };
        println!(
            "{:<6} {:<40} {:>3}%  {} / {}  {}",
            d.download_id.to_string(),
            d.model_name.to_string(),
            d.progress,
            format_bytes(d.bytes_downloaded),
            format_bytes(d.bytes_total),
            state
        );
    }
    SUCCESS
}

async fn cancel(manager: &DownloadManager, id: DownloadId) -> Result<u8> {
    if manager.cancel_download(id).await? {
        println!("{} Cancelled download {}", "[✓]".green(), id);
        Ok(SUCCESS)
    } else {
        println!("{} No download {}", "[!]".yellow(), id);
        Ok(USAGE)
    }
}

fn print_sweep(report: &SweepReport) {
    if report.is_empty() {
        println!("{} Nothing to reconcile", "[✓]".green());
        return;
    }
    let groups = [
        ("Promoted", &report.promoted),
        ("Discarded", &report.discarded),
        ("Reattached", &report.reattached),
        ("Still pending", &report.resumed),
        ("Failed", &report.failed),
    ];
    for (label, names) in groups {
        for name in names {
            println!("  {:<14} {}", label, name);
        }
    }
}
