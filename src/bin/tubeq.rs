use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::mpsc;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use tubeq_engine::config::load_settings;
use tubeq_engine::deps::{DependencyResolver, ToolResolver};
use tubeq_engine::events::{ChannelSink, EngineEvent, NullSink};
use tubeq_engine::ffmpeg::{extract_clip, probe_duration};
use tubeq_engine::format::format_duration;
use tubeq_engine::paths::AppPaths;
use tubeq_engine::task::{AddPlaylistRequest, AddTaskRequest, Quality, TaskStatus, TrimMode};
use tubeq_engine::ytdlp::fetch_playlist_info;
use tubeq_engine::{logging, TaskManager};

/// Queue and run yt-dlp downloads.
#[derive(Debug, Parser)]
#[command(name = "tubeq")]
#[command(about = "tubeq: yt-dlp download queue", long_about = None)]
struct Cli {
    /// Data directory (settings, database, logs, tools). Defaults to $TUBEQ_BASE_DIR.
    #[arg(long, global = true, value_name = "DIR")]
    base_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Queue a single video and wait for the queue to drain.
    Add {
        url: String,
        /// Destination directory (defaults to the configured download dir).
        #[arg(long)]
        dir: Option<String>,
        /// best, 4k, 2k, 1080p, 720p, 480p, 360p, 240p, 144p or audio.
        #[arg(long, default_value = "best")]
        quality: String,
        /// Merge container (mp4, mkv, ...); `original` keeps what yt-dlp picks.
        #[arg(long)]
        format: Option<String>,
        /// Explicit yt-dlp format ID; overrides --quality.
        #[arg(long)]
        format_id: Option<String>,
        #[arg(long, value_name = "HH:MM:SS")]
        trim_start: Option<String>,
        #[arg(long, value_name = "HH:MM:SS")]
        trim_end: Option<String>,
        /// none, overwrite or keep_both.
        #[arg(long, default_value = "overwrite")]
        trim_mode: String,
    },

    /// Expand a playlist into one task per entry and wait for the queue to drain.
    Playlist {
        url: String,
        #[arg(long)]
        dir: Option<String>,
    },

    /// Show every task.
    List,

    /// Print a task's log.
    Logs { id: String },

    /// Delete a task (cascades through playlists).
    Delete {
        id: String,
        /// Also delete downloaded files.
        #[arg(long)]
        files: bool,
    },

    /// Restart a failed task from scratch.
    Retry { id: String },

    /// Continue a paused or failed task.
    Resume { id: String },

    /// Process pending tasks until the queue is idle.
    Run,

    /// Cut `[start, end]` out of a local file into a `_clip_` sibling (stream copy).
    Clip {
        file: PathBuf,
        #[arg(value_name = "HH:MM:SS")]
        start: String,
        #[arg(value_name = "HH:MM:SS")]
        end: String,
    },
}

fn main() -> Result<(), String> {
    let cli = Cli::parse();

    let base_dir = cli
        .base_dir
        .or_else(default_base_dir)
        .ok_or_else(|| "could not determine base dir; pass --base-dir".to_string())?;
    let paths = AppPaths::new(base_dir);
    paths.ensure_dirs().map_err(|e| e.to_string())?;
    if logging::init_logging(&paths).is_err() {
        logging::init_logging_stderr();
    }

    match cli.command {
        Command::List => {
            let manager = load_quiet(&paths)?;
            for task in manager.list_tasks() {
                let kind = if task.is_playlist {
                    format!("playlist {}/{}", task.current_item, task.total_items)
                } else {
                    task.quality.as_str().to_string()
                };
                println!(
                    "{}  {:<11} {:>5.1}%  {:<14} {}",
                    task.id, task.status, task.progress, kind, task.title
                );
                if let Some(err) = &task.error {
                    println!("    error: {err}");
                }
            }
            Ok(())
        }
        Command::Logs { id } => {
            let manager = load_quiet(&paths)?;
            for line in manager.task_logs(&id).map_err(|e| e.to_string())? {
                println!("{line}");
            }
            Ok(())
        }
        Command::Delete { id, files } => {
            let manager = load_quiet(&paths)?;
            let deleted = manager.delete_task(&id, files).map_err(|e| e.to_string())?;
            manager.join_background();
            for id in deleted {
                println!("deleted {id}");
            }
            Ok(())
        }
        Command::Add {
            url,
            dir,
            quality,
            format,
            format_id,
            trim_start,
            trim_end,
            trim_mode,
        } => {
            let quality = Quality::from_str(&quality)
                .ok_or_else(|| format!("unknown quality: {quality}"))?;
            let trim_mode = TrimMode::from_str(&trim_mode)
                .ok_or_else(|| format!("unknown trim mode: {trim_mode}"))?;
            let request = AddTaskRequest {
                url,
                dir,
                quality,
                format,
                format_id,
                trim_start,
                trim_end,
                trim_mode,
                ..AddTaskRequest::default()
            };
            run_queue(&paths, move |manager| {
                let id = manager.add_task(request).map_err(|e| e.to_string())?;
                println!("queued {id}");
                Ok(())
            })
        }
        Command::Playlist { url, dir } => {
            let settings = load_settings(&paths).map_err(|e| e.to_string())?;
            let ytdlp = ToolResolver::new(paths.clone())
                .downloader_path()
                .map_err(|e| e.to_string())?;
            println!("expanding {url}");
            let info = fetch_playlist_info(&ytdlp, &url, &settings).map_err(|e| e.to_string())?;
            for item in &info.items {
                println!("  {:>3}. {} ({})", item.index, item.title, format_duration(item.duration));
            }
            let request = AddPlaylistRequest {
                url,
                dir,
                title: Some(info.title),
                thumbnail: Some(info.thumbnail),
                items: info.items,
            };
            run_queue(&paths, move |manager| {
                let id = manager.add_playlist(request).map_err(|e| e.to_string())?;
                println!("queued playlist {id}");
                Ok(())
            })
        }
        Command::Retry { id } => {
            run_queue(&paths, move |manager| manager.retry_task(&id).map_err(|e| e.to_string()))
        }
        Command::Resume { id } => {
            run_queue(&paths, move |manager| manager.resume_task(&id).map_err(|e| e.to_string()))
        }
        Command::Run => run_queue(&paths, |_| Ok(())),
        Command::Clip { file, start, end } => {
            let ffmpeg = ToolResolver::new(paths.clone())
                .media_toolkit_path()
                .map_err(|e| e.to_string())?;
            match probe_duration(&ffmpeg, &file) {
                Ok(seconds) => println!("{}: {}", file.display(), format_duration(seconds)),
                Err(e) => tracing::warn!(error = %e, "could not probe duration"),
            }
            let clip = extract_clip(&ffmpeg, &file, &start, &end).map_err(|e| e.to_string())?;
            println!("wrote {}", clip.display());
            Ok(())
        }
    }
}

/// Opens the queue without admitting anything.
fn load_quiet(paths: &AppPaths) -> Result<TaskManager, String> {
    let settings = load_settings(paths).map_err(|e| e.to_string())?;
    TaskManager::load(
        paths.clone(),
        settings,
        Arc::new(NullSink),
        Arc::new(ToolResolver::new(paths.clone())),
    )
    .map_err(|e| e.to_string())
}

/// Applies `prepare` to the held queue, starts it and prints events until it is idle.
fn run_queue<F>(paths: &AppPaths, prepare: F) -> Result<(), String>
where
    F: FnOnce(&TaskManager) -> Result<(), String>,
{
    let settings = load_settings(paths).map_err(|e| e.to_string())?;
    let resolver = Arc::new(ToolResolver::new(paths.clone()));
    match resolver.downloader_version() {
        Some(version) => tracing::info!(%version, "using yt-dlp"),
        None => tracing::warn!("yt-dlp not found; queued tasks will fail"),
    }
    let (tx, rx) = mpsc::channel();
    let manager = TaskManager::load(
        paths.clone(),
        settings,
        Arc::new(ChannelSink::new(tx)),
        resolver,
    )
    .map_err(|e| e.to_string())?;

    thread::spawn(move || print_events(rx));

    prepare(&manager)?;
    manager.start();
    while !manager.wait_idle(Duration::from_secs(1)) {}
    manager.join_background();

    let failed = manager
        .list_tasks()
        .iter()
        .filter(|t| matches!(t.status, TaskStatus::Error | TaskStatus::TrimFailed))
        .count();
    if failed > 0 {
        return Err(format!("{failed} task(s) failed; see `tubeq list`"));
    }
    Ok(())
}

fn print_events(rx: mpsc::Receiver<EngineEvent>) {
    let mut last_status: HashMap<String, TaskStatus> = HashMap::new();
    while let Ok(event) = rx.recv() {
        match event {
            EngineEvent::Snapshot(task) => {
                if last_status.insert(task.id.clone(), task.status) != Some(task.status) {
                    println!("[{}] {} {}", short(&task.id), task.status, task.title);
                }
            }
            EngineEvent::Log {
                task_id,
                message,
                ephemeral,
            } => {
                if !ephemeral {
                    println!("[{}] {message}", short(&task_id));
                }
            }
        }
    }
}

fn short(id: &str) -> &str {
    id.get(id.len().saturating_sub(8)..).unwrap_or(id)
}

fn default_base_dir() -> Option<PathBuf> {
    if let Ok(v) = std::env::var("TUBEQ_BASE_DIR") {
        let t = v.trim();
        if !t.is_empty() {
            return Some(PathBuf::from(t));
        }
    }

    if cfg!(windows) {
        if let Ok(appdata) = std::env::var("APPDATA") {
            let t = appdata.trim();
            if !t.is_empty() {
                return Some(PathBuf::from(t).join("tubeq"));
            }
        }
    }

    let data_home = std::env::var("XDG_DATA_HOME")
        .ok()
        .filter(|v| !v.trim().is_empty())
        .map(PathBuf::from)
        .or_else(|| {
            std::env::var("HOME")
                .ok()
                .filter(|v| !v.trim().is_empty())
                .map(|home| PathBuf::from(home).join(".local").join("share"))
        })?;
    Some(data_home.join("tubeq"))
}
