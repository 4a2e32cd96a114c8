//! Command-line front end for the `rdl` binary.

mod progress;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use tokio::sync::mpsc::UnboundedReceiver;

use crate::config::AppConfig;
use crate::coordinator::DownloadCoordinator;
use crate::observer::{ChannelObserver, DownloadEvent};
use crate::stats::TransferStats;
use crate::transport::ReqwestTransport;

use progress::{make_progress_bar, print_status, print_summary, state_label};

/// What the user asked for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Download { asset_id: String, url: String },
    Remove { asset_id: String },
    Status { asset_id: String },
    List,
    Help,
}

/// Parsed command line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CliArgs {
    pub config_path: Option<PathBuf>,
    pub command: Command,
}

/// How a command ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(PathBuf),
    Paused,
    Failed(String),
    Done,
}

/// Parses arguments (without the program name).
///
/// # Errors
///
/// Returns a message describing the first problem found.
pub fn parse_args(args: impl IntoIterator<Item = String>) -> Result<CliArgs, String> {
    let mut config_path = None;
    let mut command = None;
    let mut positional = Vec::new();

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "-h" | "--help" => command = Some(Command::Help),
            "-c" | "--config" => {
                let path = args.next().ok_or("--config requires a value")?;
                config_path = Some(PathBuf::from(path));
            }
            "--remove" => {
                let asset_id = args.next().ok_or("--remove requires an asset id")?;
                command = Some(Command::Remove { asset_id });
            }
            "--status" => {
                let asset_id = args.next().ok_or("--status requires an asset id")?;
                command = Some(Command::Status { asset_id });
            }
            "--list" => command = Some(Command::List),
            flag if flag.starts_with('-') => return Err(format!("unknown option {flag}")),
            _ => positional.push(arg),
        }
    }

    let command = match (command, positional.len()) {
        (Some(Command::Help), _) | (None, 0) => Command::Help,
        (Some(command), 0) => command,
        (None, 2) => {
            let url = positional.pop().unwrap_or_default();
            let asset_id = positional.pop().unwrap_or_default();
            Command::Download { asset_id, url }
        }
        (None, _) => return Err("expected <asset-id> <url>".to_string()),
        (Some(_), _) => return Err(format!("unexpected argument {}", positional[0])),
    };

    Ok(CliArgs {
        config_path,
        command,
    })
}

/// Runs a parsed command.
///
/// # Errors
///
/// Returns an error if the configuration cannot be loaded, the HTTP client
/// cannot be built, or storage cannot be opened.
pub async fn run(args: CliArgs) -> crate::Result<Outcome> {
    let config_path = args.config_path.unwrap_or_else(AppConfig::default_path);
    let config = AppConfig::load_or_default(&config_path)?;
    log::debug!("Storage root: {}", config.storage.root.display());

    let transport = Arc::new(ReqwestTransport::new(config.engine.request_timeout())?);
    let (observer, events) = ChannelObserver::channel();
    let coordinator = DownloadCoordinator::new(
        config.engine.clone(),
        config.storage.root.clone(),
        transport,
        Arc::new(observer),
    )?;

    match args.command {
        Command::Download { asset_id, url } => download(&coordinator, events, &asset_id, &url).await,
        Command::Remove { asset_id } => {
            coordinator.remove_download_completely(&asset_id).await?;
            println!("{asset_id}: removed");
            Ok(Outcome::Done)
        }
        Command::Status { asset_id } => {
            let state = coordinator.state(&asset_id).await;
            let path = coordinator.local_file_path(&asset_id).await;
            print_status(&asset_id, state, coordinator.stored_progress(&asset_id), path.as_deref());
            Ok(Outcome::Done)
        }
        Command::List => {
            let assets = coordinator.resumable_assets();
            if assets.is_empty() {
                println!("No unfinished downloads.");
            }
            let states = join_all(assets.iter().map(|id| coordinator.state(id))).await;
            for (asset_id, state) in assets.iter().zip(states) {
                println!("  {asset_id} ({})", state_label(state));
            }
            Ok(Outcome::Done)
        }
        Command::Help => Ok(Outcome::Done),
    }
}

/// Downloads one asset, pausing on Ctrl-C.
async fn download(
    coordinator: &DownloadCoordinator,
    mut events: UnboundedReceiver<DownloadEvent>,
    asset_id: &str,
    url: &str,
) -> crate::Result<Outcome> {
    if coordinator.has_partial_data(asset_id).await {
        println!("Resuming {asset_id}...");
    }
    coordinator.start_download(asset_id, url).await?;

    let bar = make_progress_bar(asset_id);
    bar.enable_steady_tick(Duration::from_millis(250));
    let mut stats = TransferStats::new();
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = &mut ctrl_c => {
                coordinator.cancel_download(asset_id).await;
                bar.abandon_with_message(format!("{asset_id} (paused)"));
                println!("Paused. Run the same command again to resume.");
                return Ok(Outcome::Paused);
            }
            event = events.recv() => match event {
                Some(DownloadEvent::Progress { received, total, .. }) => {
                    bar.set_length(total);
                    bar.set_position(received);
                    stats.record(received);
                }
                Some(DownloadEvent::Completed { path, .. }) => {
                    bar.finish_and_clear();
                    let size = bar.length().unwrap_or_default();
                    print_summary(&stats.into_summary(asset_id, path.clone(), size));
                    return Ok(Outcome::Completed(path));
                }
                Some(DownloadEvent::Failed { error, .. }) => {
                    bar.abandon();
                    eprintln!("{asset_id}: {error}");
                    return Ok(Outcome::Failed(error));
                }
                None => return Ok(Outcome::Paused),
            }
        }
    }
}
