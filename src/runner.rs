//! Drives one admitted task: pre-flight, the yt-dlp process, then the optional trim.

use crate::manager::TaskManager;
use crate::paths::resolve_in;
use crate::process::{spawn_piped, stream_until_exit, CancelToken, CommandRunError, LineHandler};
use crate::store::output_exists;
use crate::task::{Quality, Task, TaskStatus};
use crate::trim::trim_download;
use crate::ytdlp::{self, LIMIT_REACHED_EXIT_CODE};
use crate::{cmd, EngineError};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureKind {
    /// A required executable could not be found.
    Resolution,
    /// The process could not be started.
    Launch,
    /// The process ran and failed.
    Runtime,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            FailureKind::Resolution => "resolution",
            FailureKind::Launch => "launch",
            FailureKind::Runtime => "runtime",
        };
        f.write_str(label)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RunOutcome {
    Completed { limit_reached: bool },
    TrimFailed(String),
    Failed { kind: FailureKind, detail: String },
    Cancelled,
}

impl RunOutcome {
    pub(crate) fn launch_failure(detail: String) -> Self {
        RunOutcome::Failed {
            kind: FailureKind::Launch,
            detail,
        }
    }

    fn resolution_failure(err: EngineError) -> Self {
        RunOutcome::Failed {
            kind: FailureKind::Resolution,
            detail: err.to_string(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitClass {
    Success,
    LimitReached,
    Cancelled,
    Failed(Option<i32>),
}

/// Maps how the downloader ended. A fired token wins over whatever code the kill produced.
pub fn classify_exit(code: Option<i32>, canceled: bool) -> ExitClass {
    match code {
        Some(0) => ExitClass::Success,
        Some(LIMIT_REACHED_EXIT_CODE) => ExitClass::LimitReached,
        _ if canceled => ExitClass::Cancelled,
        other => ExitClass::Failed(other),
    }
}

pub(crate) fn run_task(manager: &TaskManager, id: &str, cancel: CancelToken) {
    let outcome = execute(manager, id, &cancel);
    tracing::debug!(task_id = id, outcome = ?outcome, "task run finished");
    manager.finish_run(id, outcome);
}

fn execute(manager: &TaskManager, id: &str, cancel: &CancelToken) -> RunOutcome {
    let Some(task) = manager.get_task(id) else {
        return RunOutcome::Cancelled;
    };

    let ytdlp = match manager.resolver().downloader_path() {
        Ok(path) => path,
        Err(e) => return RunOutcome::resolution_failure(e),
    };
    let ffmpeg = match manager.resolver().media_toolkit_path() {
        Ok(path) => Some(path),
        Err(e) if task.wants_trim() => return RunOutcome::resolution_failure(e),
        Err(_) => None,
    };

    let Some(task) = preflight(manager, task, &ytdlp, cancel) else {
        return RunOutcome::Cancelled;
    };
    if cancel.is_canceled() {
        return RunOutcome::Cancelled;
    }

    let settings = manager.settings();
    let ffmpeg_dir = ffmpeg.as_deref().and_then(ffmpeg_location);
    let args = ytdlp::build_download_args(&task, &settings, ffmpeg_dir);
    tracing::info!(task_id = id, url = %task.url, "starting download");
    manager.log(id, &format!("yt-dlp {}", args.join(" ")));

    let mut command = cmd::command(&ytdlp);
    command.args(&args);
    let child = match spawn_piped(&mut command) {
        Ok(child) => child,
        Err(e) => return RunOutcome::launch_failure(format!("failed to start yt-dlp: {e}")),
    };

    manager.update_and_persist(id, |t| {
        if t.status == TaskStatus::Starting {
            t.status = TaskStatus::Downloading;
        }
    });

    let last_error: Arc<Mutex<Option<String>>> = Arc::new(Mutex::new(None));
    let handler: LineHandler = {
        let manager = manager.clone();
        let id = id.to_string();
        let last_error = last_error.clone();
        Arc::new(move |line: &str| {
            if line.starts_with("ERROR") {
                *last_error.lock().unwrap_or_else(PoisonError::into_inner) =
                    Some(line.to_string());
            }
            manager.handle_output_line(&id, line);
        })
    };

    let exit = match stream_until_exit(child, cancel, handler) {
        Ok(status) => classify_exit(status.code(), cancel.is_canceled()),
        Err(CommandRunError::Canceled) => ExitClass::Cancelled,
        Err(e) => {
            return RunOutcome::Failed {
                kind: FailureKind::Runtime,
                detail: e.to_string(),
            }
        }
    };

    let limit_reached = match exit {
        ExitClass::Success => false,
        ExitClass::LimitReached => true,
        ExitClass::Cancelled => return RunOutcome::Cancelled,
        ExitClass::Failed(code) => {
            let code = code.map_or_else(|| "signal".to_string(), |c| c.to_string());
            let detail = match last_error.lock().unwrap_or_else(PoisonError::into_inner).take() {
                Some(line) => format!("yt-dlp exited with {code}: {line}"),
                None => format!("yt-dlp exited with {code}"),
            };
            return RunOutcome::Failed {
                kind: FailureKind::Runtime,
                detail,
            };
        }
    };

    let Some(task) = manager.update_and_persist(id, |t| {
        t.progress = 100.0;
        t.speed.clear();
        t.eta.clear();
        refresh_outputs(t);
    }) else {
        return RunOutcome::Cancelled;
    };

    if limit_reached || !task.wants_trim() {
        return RunOutcome::Completed { limit_reached };
    }
    match ffmpeg {
        Some(ffmpeg) => trim_stage(manager, &task, &ffmpeg, cancel),
        None => RunOutcome::TrimFailed("ffmpeg is not available".to_string()),
    }
}

/// Picks the best format up front so progress can be measured against a known size.
/// Returns `None` if the task vanished meanwhile.
fn preflight(
    manager: &TaskManager,
    task: Task,
    ytdlp: &Path,
    cancel: &CancelToken,
) -> Option<Task> {
    if !task.format_id.trim().is_empty() || task.quality != Quality::Best {
        return Some(task);
    }

    let settings = manager.settings();
    match ytdlp::fetch_video_info(ytdlp, &task.url, &settings, Some(cancel)) {
        Ok(info) => {
            let Some(best) = info.best_video().cloned() else {
                manager.log(&task.id, "no video formats listed, using generic best selector");
                return Some(task);
            };
            manager.update_and_persist(&task.id, |t| {
                t.format_id = best.format_id.clone();
                if best.total_bytes > 0 {
                    t.set_total_bytes(best.total_bytes);
                }
                if (t.title.is_empty() || t.title == t.url) && !info.title.is_empty() {
                    t.title = info.title.clone();
                }
                if t.thumbnail.is_empty() {
                    t.thumbnail = info.thumbnail.clone();
                }
            })
        }
        Err(EngineError::ExternalToolCanceled { .. }) => Some(task),
        Err(e) => {
            tracing::warn!(task_id = %task.id, error = %e, "metadata pre-flight failed");
            manager.log(
                &task.id,
                &format!("metadata unavailable ({e}), using generic best selector"),
            );
            Some(task)
        }
    }
}

fn trim_stage(manager: &TaskManager, task: &Task, ffmpeg: &Path, cancel: &CancelToken) -> RunOutcome {
    let dir = Path::new(&task.dir);
    let input = resolve_in(dir, &task.file_path);
    if task.file_path.trim().is_empty() || !input.is_file() {
        return RunOutcome::TrimFailed("downloaded file not found".to_string());
    }

    manager.update_and_persist(&task.id, |t| t.status = TaskStatus::Trimming);
    manager.log(
        &task.id,
        &format!(
            "trimming {} ({} to {})",
            input.display(),
            task.trim_start.as_deref().unwrap_or("start"),
            task.trim_end.as_deref().unwrap_or("end")
        ),
    );

    match trim_download(
        ffmpeg,
        &input,
        task.trim_mode,
        task.trim_start.as_deref(),
        task.trim_end.as_deref(),
        Some(cancel),
    ) {
        Ok(outcome) => {
            let output = outcome.output.to_string_lossy().to_string();
            let size = file_size(&outcome.output);
            manager.update_and_persist(&task.id, |t| {
                t.update_file_entry(&output, size, 100.0);
                if outcome.replaced_original {
                    t.file_path = output.clone();
                }
                t.file_exists = true;
            });
            manager.log(&task.id, &format!("trimmed into {output}"));
            RunOutcome::Completed {
                limit_reached: false,
            }
        }
        Err(EngineError::ExternalToolCanceled { .. }) => RunOutcome::Cancelled,
        Err(e) => RunOutcome::TrimFailed(e.to_string()),
    }
}

/// Re-probes the outputs after a successful exit.
fn refresh_outputs(task: &mut Task) {
    let dir = PathBuf::from(&task.dir);
    for file in task.files.iter_mut() {
        let size = file_size(&resolve_in(&dir, &file.path));
        if size > 0 {
            file.size_bytes = size;
            file.size = crate::format::format_bytes(size);
            file.progress = 100.0;
        }
    }
    task.file_exists = output_exists(task);
}

/// `--ffmpeg-location` takes the directory holding the binary.
fn ffmpeg_location(ffmpeg: &Path) -> Option<&Path> {
    if ffmpeg.is_absolute() {
        ffmpeg.parent()
    } else {
        None
    }
}

fn file_size(path: &Path) -> i64 {
    std::fs::metadata(path).map(|m| m.len() as i64).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn limit_reached_counts_as_success() {
        assert_eq!(classify_exit(Some(0), false), ExitClass::Success);
        assert_eq!(classify_exit(Some(101), false), ExitClass::LimitReached);
        assert_eq!(classify_exit(Some(1), false), ExitClass::Failed(Some(1)));
        assert_eq!(classify_exit(None, false), ExitClass::Failed(None));
    }

    #[test]
    fn canceled_runs_are_not_failures() {
        assert_eq!(classify_exit(None, true), ExitClass::Cancelled);
        assert_eq!(classify_exit(Some(137), true), ExitClass::Cancelled);
        assert_eq!(classify_exit(Some(0), true), ExitClass::Success);
    }

    #[test]
    fn ffmpeg_location_is_the_binary_dir() {
        let abs = std::env::temp_dir().join("tools").join("ffmpeg");
        assert_eq!(ffmpeg_location(&abs), abs.parent());
        assert_eq!(ffmpeg_location(Path::new("ffmpeg")), None);
    }

    #[test]
    fn failure_kinds_render_lowercase() {
        let outcome = RunOutcome::launch_failure("boom".to_string());
        match outcome {
            RunOutcome::Failed { kind, detail } => {
                assert_eq!(format!("{kind}: {detail}"), "launch: boom");
            }
            other => panic!("unexpected outcome {other:?}"),
        }
    }
}
