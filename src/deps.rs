use crate::paths::AppPaths;
use crate::{EngineError, Result};
use std::path::PathBuf;
use std::sync::Mutex;

/// Supplies the external executables a run needs. Installing them is someone else's job.
pub trait DependencyResolver: Send + Sync {
    fn downloader_path(&self) -> Result<PathBuf>;

    fn media_toolkit_path(&self) -> Result<PathBuf>;
}

/// Prefers the copies under `<base>/tools`, then whatever is on `PATH`. A candidate is only
/// accepted once it answers a version probe; hits are cached for the life of the resolver.
pub struct ToolResolver {
    paths: AppPaths,
    downloader: Mutex<Option<PathBuf>>,
    media_toolkit: Mutex<Option<PathBuf>>,
}

impl ToolResolver {
    pub fn new(paths: AppPaths) -> Self {
        Self {
            paths,
            downloader: Mutex::new(None),
            media_toolkit: Mutex::new(None),
        }
    }

    pub fn downloader_version(&self) -> Option<String> {
        let path = self.downloader_path().ok()?;
        tool_version_first_line(&path, "--version")
    }
}

impl DependencyResolver for ToolResolver {
    fn downloader_path(&self) -> Result<PathBuf> {
        resolve_cached(
            &self.downloader,
            vec![self.paths.yt_dlp_bin_path(), PathBuf::from("yt-dlp")],
            "--version",
            "yt-dlp",
        )
    }

    fn media_toolkit_path(&self) -> Result<PathBuf> {
        resolve_cached(
            &self.media_toolkit,
            vec![self.paths.ffmpeg_bin_path(), PathBuf::from("ffmpeg")],
            "-version",
            "ffmpeg",
        )
    }
}

fn resolve_cached(
    cache: &Mutex<Option<PathBuf>>,
    candidates: Vec<PathBuf>,
    version_arg: &str,
    tool: &str,
) -> Result<PathBuf> {
    if let Ok(guard) = cache.lock() {
        if let Some(hit) = guard.as_ref() {
            return Ok(hit.clone());
        }
    }

    for candidate in candidates {
        // Bare names are looked up on PATH by the probe itself.
        if candidate.components().count() > 1 && !candidate.exists() {
            continue;
        }
        if let Some(version) = tool_version_first_line(&candidate, version_arg) {
            tracing::debug!(tool, path = %candidate.display(), version = %version, "resolved external tool");
            if let Ok(mut guard) = cache.lock() {
                *guard = Some(candidate.clone());
            }
            return Ok(candidate);
        }
    }

    Err(EngineError::ExternalToolMissing {
        tool: tool.to_string(),
    })
}

fn tool_version_first_line(program: impl AsRef<std::ffi::OsStr>, arg: &str) -> Option<String> {
    let output = crate::cmd::command(program).arg(arg).output().ok()?;
    if !output.status.success() {
        return None;
    }
    let text = String::from_utf8_lossy(&output.stdout);
    let first = text.lines().next()?.trim();
    if first.is_empty() {
        return None;
    }
    Some(first.to_string())
}

/// Explicit executables, no probing. A `None` slot reports the tool as missing.
#[derive(Debug, Clone, Default)]
pub struct FixedTools {
    pub downloader: Option<PathBuf>,
    pub media_toolkit: Option<PathBuf>,
}

impl DependencyResolver for FixedTools {
    fn downloader_path(&self) -> Result<PathBuf> {
        self.downloader
            .clone()
            .ok_or_else(|| EngineError::ExternalToolMissing {
                tool: "yt-dlp".to_string(),
            })
    }

    fn media_toolkit_path(&self) -> Result<PathBuf> {
        self.media_toolkit
            .clone()
            .ok_or_else(|| EngineError::ExternalToolMissing {
                tool: "ffmpeg".to_string(),
            })
    }
}
