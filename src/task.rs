use crate::format::format_bytes;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    Starting,
    Downloading,
    Merging,
    Trimming,
    Paused,
    Completed,
    TrimFailed,
    Error,
}

impl TaskStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Starting => "starting",
            TaskStatus::Downloading => "downloading",
            TaskStatus::Merging => "merging",
            TaskStatus::Trimming => "trimming",
            TaskStatus::Paused => "paused",
            TaskStatus::Completed => "completed",
            TaskStatus::TrimFailed => "trim_failed",
            TaskStatus::Error => "error",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(TaskStatus::Pending),
            "starting" => Some(TaskStatus::Starting),
            "downloading" => Some(TaskStatus::Downloading),
            "merging" => Some(TaskStatus::Merging),
            "trimming" => Some(TaskStatus::Trimming),
            "paused" => Some(TaskStatus::Paused),
            "completed" => Some(TaskStatus::Completed),
            "trim_failed" => Some(TaskStatus::TrimFailed),
            "error" => Some(TaskStatus::Error),
            _ => None,
        }
    }

    /// Counts against the concurrency ceiling.
    pub fn is_active(&self) -> bool {
        matches!(
            self,
            TaskStatus::Starting
                | TaskStatus::Downloading
                | TaskStatus::Merging
                | TaskStatus::Trimming
        )
    }

    /// Output files are being rewritten; the task can be neither paused nor deleted.
    pub fn is_critical(&self) -> bool {
        matches!(self, TaskStatus::Merging | TaskStatus::Trimming)
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskStatus::Completed | TaskStatus::TrimFailed | TaskStatus::Error
        )
    }
}

impl std::fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.pad(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum Quality {
    #[default]
    #[serde(rename = "best")]
    Best,
    #[serde(rename = "4k")]
    Uhd4k,
    #[serde(rename = "2k")]
    Qhd2k,
    #[serde(rename = "1080p")]
    P1080,
    #[serde(rename = "720p")]
    P720,
    #[serde(rename = "480p")]
    P480,
    #[serde(rename = "360p")]
    P360,
    #[serde(rename = "240p")]
    P240,
    #[serde(rename = "144p")]
    P144,
    #[serde(rename = "audio")]
    Audio,
}

impl Quality {
    pub fn as_str(&self) -> &'static str {
        match self {
            Quality::Best => "best",
            Quality::Uhd4k => "4k",
            Quality::Qhd2k => "2k",
            Quality::P1080 => "1080p",
            Quality::P720 => "720p",
            Quality::P480 => "480p",
            Quality::P360 => "360p",
            Quality::P240 => "240p",
            Quality::P144 => "144p",
            Quality::Audio => "audio",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "best" | "" => Some(Quality::Best),
            "4k" | "2160p" => Some(Quality::Uhd4k),
            "2k" | "1440p" => Some(Quality::Qhd2k),
            "1080p" => Some(Quality::P1080),
            "720p" => Some(Quality::P720),
            "480p" => Some(Quality::P480),
            "360p" => Some(Quality::P360),
            "240p" => Some(Quality::P240),
            "144p" => Some(Quality::P144),
            "audio" => Some(Quality::Audio),
            _ => None,
        }
    }

    /// Height cap for video tiers; `None` for `best` and `audio`.
    pub fn max_height(&self) -> Option<u32> {
        match self {
            Quality::Uhd4k => Some(2160),
            Quality::Qhd2k => Some(1440),
            Quality::P1080 => Some(1080),
            Quality::P720 => Some(720),
            Quality::P480 => Some(480),
            Quality::P360 => Some(360),
            Quality::P240 => Some(240),
            Quality::P144 => Some(144),
            Quality::Best | Quality::Audio => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum TrimMode {
    #[default]
    None,
    Overwrite,
    KeepBoth,
}

impl TrimMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            TrimMode::None => "none",
            TrimMode::Overwrite => "overwrite",
            TrimMode::KeepBoth => "keep_both",
        }
    }

    pub fn from_str(value: &str) -> Option<Self> {
        match value {
            "none" | "" => Some(TrimMode::None),
            "overwrite" => Some(TrimMode::Overwrite),
            "keep_both" => Some(TrimMode::KeepBoth),
            _ => None,
        }
    }
}

/// One on-disk part produced by a run (separate video/audio streams, the merged output, a
/// trimmed copy).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct DownloadFile {
    pub path: String,
    pub size: String,
    pub size_bytes: i64,
    pub progress: f64,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct PlaylistItem {
    pub index: i64,
    pub title: String,
    pub duration: f64,
    pub thumbnail: String,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Task {
    pub id: String,
    pub parent_id: Option<String>,
    pub is_playlist: bool,
    pub url: String,
    pub dir: String,
    pub quality: Quality,
    /// Merge container; `original` leaves the downloader's choice alone.
    pub format: String,
    pub format_id: String,
    pub trim_start: Option<String>,
    pub trim_end: Option<String>,
    pub trim_mode: TrimMode,
    pub playlist_items: Vec<i64>,
    pub status: TaskStatus,
    pub progress: f64,
    pub title: String,
    pub thumbnail: String,
    pub total_size: String,
    pub total_bytes: i64,
    pub speed: String,
    pub eta: String,
    pub current_item: i64,
    pub total_items: i64,
    pub log_path: String,
    pub file_exists: bool,
    pub file_path: String,
    pub files: Vec<DownloadFile>,
    pub error: Option<String>,
    pub created_at_ms: i64,
}

impl Default for Task {
    fn default() -> Self {
        Self {
            id: String::new(),
            parent_id: None,
            is_playlist: false,
            url: String::new(),
            dir: String::new(),
            quality: Quality::Best,
            format: "original".to_string(),
            format_id: String::new(),
            trim_start: None,
            trim_end: None,
            trim_mode: TrimMode::None,
            playlist_items: Vec::new(),
            status: TaskStatus::Pending,
            progress: 0.0,
            title: String::new(),
            thumbnail: String::new(),
            total_size: String::new(),
            total_bytes: 0,
            speed: String::new(),
            eta: String::new(),
            current_item: 0,
            total_items: 0,
            log_path: String::new(),
            file_exists: false,
            file_path: String::new(),
            files: Vec::new(),
            error: None,
            created_at_ms: 0,
        }
    }
}

impl Task {
    pub fn wants_trim(&self) -> bool {
        self.trim_mode != TrimMode::None
            && (has_marker(&self.trim_start) || has_marker(&self.trim_end))
    }

    pub fn set_total_bytes(&mut self, bytes: i64) {
        self.total_bytes = bytes.max(0);
        self.total_size = if bytes > 0 {
            format_bytes(bytes)
        } else {
            String::new()
        };
    }

    /// Inserts or updates the entry for `path`; `size_bytes == 0` keeps the known size.
    pub fn update_file_entry(&mut self, path: &str, size_bytes: i64, progress: f64) {
        if path.is_empty() {
            return;
        }
        let idx = match self.files.iter().position(|f| f.path == path) {
            Some(idx) => idx,
            None => {
                self.files.push(DownloadFile {
                    path: path.to_string(),
                    ..DownloadFile::default()
                });
                self.files.len() - 1
            }
        };
        let entry = &mut self.files[idx];
        if size_bytes > 0 {
            entry.size_bytes = size_bytes;
            entry.size = format_bytes(size_bytes);
        }
        entry.progress = progress.clamp(0.0, 100.0);
    }

    pub fn remove_file_entry(&mut self, path: &str) {
        self.files.retain(|f| f.path != path);
    }
}

fn has_marker(value: &Option<String>) -> bool {
    value.as_deref().is_some_and(|v| !v.trim().is_empty())
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddTaskRequest {
    pub url: String,
    pub dir: Option<String>,
    pub quality: Quality,
    pub format: Option<String>,
    pub format_id: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub total_bytes: Option<i64>,
    pub trim_start: Option<String>,
    pub trim_end: Option<String>,
    pub trim_mode: TrimMode,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct AddPlaylistRequest {
    pub url: String,
    pub dir: Option<String>,
    pub title: Option<String>,
    pub thumbnail: Option<String>,
    pub items: Vec<PlaylistItem>,
}
