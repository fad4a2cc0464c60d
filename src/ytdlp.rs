//! yt-dlp invocation: download arguments, metadata pre-flight and playlist expansion.

use crate::cmd;
use crate::config::Settings;
use crate::format::format_bytes;
use crate::process::{run_command_output_with_control, CancelToken, CommandRunError};
use crate::task::{PlaylistItem, Quality, Task};
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// yt-dlp's exit code for `--max-downloads` being hit. The run did what it was asked.
pub const LIMIT_REACHED_EXIT_CODE: i32 = 101;

const METADATA_TIMEOUT_SECS: u64 = 180;
const PLAYLIST_TIMEOUT_SECS: u64 = 900;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct QualityOption {
    pub label: String,
    pub value: String,
    pub format_id: String,
    pub video_bytes: i64,
    pub audio_bytes: i64,
    pub total_bytes: i64,
    pub video_size: String,
    pub audio_size: String,
    pub total_size: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct VideoInfo {
    pub title: String,
    pub thumbnail: String,
    pub duration: f64,
    /// Highest resolution first; the audio-only option is always last.
    pub qualities: Vec<QualityOption>,
}

impl VideoInfo {
    pub fn best_video(&self) -> Option<&QualityOption> {
        self.qualities
            .first()
            .filter(|q| q.value != "audio" && !q.format_id.is_empty())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlaylistInfo {
    pub title: String,
    pub thumbnail: String,
    pub items: Vec<PlaylistItem>,
}

pub fn format_selector(task: &Task) -> String {
    let explicit = task.format_id.trim();
    if !explicit.is_empty() {
        return explicit.to_string();
    }
    match task.quality {
        Quality::Audio => "bestaudio/best".to_string(),
        Quality::Best => "bestvideo+bestaudio/best".to_string(),
        tier => match tier.max_height() {
            Some(h) => format!("bestvideo[height<={h}]+bestaudio/best[height<={h}]"),
            None => "bestvideo+bestaudio/best".to_string(),
        },
    }
}

/// Proxy, headers, geo and cookie flags shared by every yt-dlp call.
pub fn network_args(settings: &Settings) -> Vec<String> {
    let mut args = Vec::new();
    if !settings.proxy_url.trim().is_empty() {
        args.push("--proxy".to_string());
        args.push(settings.proxy_url.trim().to_string());
    }
    if !settings.user_agent.trim().is_empty() {
        args.push("--user-agent".to_string());
        args.push(settings.user_agent.trim().to_string());
    }
    if !settings.referer.trim().is_empty() {
        args.push("--referer".to_string());
        args.push(settings.referer.trim().to_string());
    }
    args.push(if settings.geo_bypass {
        "--geo-bypass".to_string()
    } else {
        "--no-geo-bypass".to_string()
    });
    args.extend(settings.cookie_args());
    args
}

pub fn build_download_args(task: &Task, settings: &Settings, ffmpeg_dir: Option<&Path>) -> Vec<String> {
    let mut args: Vec<String> = vec![
        "--newline".to_string(),
        "--encoding".to_string(),
        "utf-8".to_string(),
    ];
    if let Some(dir) = ffmpeg_dir {
        args.push("--ffmpeg-location".to_string());
        args.push(dir.to_string_lossy().to_string());
    }
    args.extend([
        "-o".to_string(),
        "%(title)s.%(ext)s".to_string(),
        "-P".to_string(),
        task.dir.clone(),
        "-f".to_string(),
        format_selector(task),
    ]);
    if let Some(limit) = settings.rate_limit_arg() {
        args.push("-r".to_string());
        args.push(limit);
    }
    args.extend(network_args(settings));

    let container = task.format.trim();
    if !container.is_empty() && container != "original" {
        args.push("--merge-output-format".to_string());
        args.push(container.to_string());
    }
    args.push(task.url.clone());
    args
}

pub fn fetch_video_info(
    ytdlp: &Path,
    url: &str,
    settings: &Settings,
    cancel: Option<&CancelToken>,
) -> Result<VideoInfo> {
    let mut args = vec!["--dump-json".to_string(), "--no-playlist".to_string()];
    args.extend(network_args(settings));
    args.push(url.to_string());

    let stdout = run_metadata_command(ytdlp, url, &args, cancel, METADATA_TIMEOUT_SECS)?;
    parse_video_info(&stdout)
}

pub fn fetch_playlist_info(ytdlp: &Path, url: &str, settings: &Settings) -> Result<PlaylistInfo> {
    let mut args = vec!["--dump-single-json".to_string(), "--flat-playlist".to_string()];
    args.extend(network_args(settings));
    args.push(url.to_string());

    let stdout = run_metadata_command(ytdlp, url, &args, None, PLAYLIST_TIMEOUT_SECS)?;
    parse_playlist_info(&stdout)
}

fn run_metadata_command(
    ytdlp: &Path,
    url: &str,
    args: &[String],
    cancel: Option<&CancelToken>,
    timeout_secs: u64,
) -> Result<Vec<u8>> {
    let mut command = cmd::command(ytdlp);
    command.args(args);
    let output = match run_command_output_with_control(&mut command, cancel, timeout_secs) {
        Ok(output) => output,
        Err(CommandRunError::Spawn(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(EngineError::ExternalToolMissing {
                tool: "yt-dlp".to_string(),
            })
        }
        Err(CommandRunError::Canceled) => {
            return Err(EngineError::ExternalToolCanceled {
                tool: "yt-dlp".to_string(),
            })
        }
        Err(other) => {
            return Err(EngineError::MetadataUnavailable {
                url: url.to_string(),
                reason: other.to_string(),
            })
        }
    };

    if !output.status.success() {
        return Err(EngineError::ExternalToolFailed {
            tool: "yt-dlp".to_string(),
            code: output.status.code(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(output.stdout)
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawThumbnail {
    url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawFormat {
    format_id: Option<String>,
    vcodec: Option<String>,
    acodec: Option<String>,
    width: Option<serde_json::Value>,
    height: Option<f64>,
    filesize: Option<f64>,
    filesize_approx: Option<f64>,
}

impl RawFormat {
    fn size(&self) -> i64 {
        self.filesize
            .or(self.filesize_approx)
            .map(|s| s as i64)
            .unwrap_or(0)
    }

    fn id(&self) -> &str {
        self.format_id.as_deref().unwrap_or("")
    }

    fn is_audio_only(&self) -> bool {
        self.vcodec.as_deref() == Some("none") && !matches!(self.acodec.as_deref(), Some("none"))
    }

    fn is_video(&self) -> bool {
        match self.vcodec.as_deref() {
            Some(v) if !v.is_empty() && v != "none" => true,
            _ => self.width.as_ref().is_some_and(|w| !w.is_null()),
        }
    }

    fn has_audio(&self) -> bool {
        !matches!(self.acodec.as_deref(), None | Some("") | Some("none"))
    }
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawVideo {
    title: String,
    thumbnail: Option<String>,
    thumbnails: Vec<RawThumbnail>,
    duration: Option<f64>,
    formats: Vec<RawFormat>,
}

#[derive(Debug, Clone)]
struct Selection {
    size: i64,
    id: String,
}

/// Builds the per-resolution quality list from `--dump-json` output.
///
/// The last sized audio-only format is taken as the best audio. For each height the video-only
/// stream is paired with it when possible, else the combined stream, else video-only alone.
pub fn parse_video_info(json: &[u8]) -> Result<VideoInfo> {
    let raw: RawVideo = serde_json::from_slice(json)?;

    let mut best_audio: Option<Selection> = None;
    for f in raw.formats.iter().filter(|f| f.is_audio_only()) {
        let size = f.size();
        if size > 0 {
            let id = if f.id().is_empty() {
                best_audio.as_ref().map(|a| a.id.clone()).unwrap_or_default()
            } else {
                f.id().to_string()
            };
            best_audio = Some(Selection { size, id });
        }
    }

    let mut video_only: BTreeMap<i64, Selection> = BTreeMap::new();
    let mut combined: BTreeMap<i64, Selection> = BTreeMap::new();
    for f in raw.formats.iter().filter(|f| f.is_video()) {
        let height = match f.height {
            Some(h) if h > 0.0 => h as i64,
            _ => continue,
        };
        let size = f.size();
        if size == 0 || f.id().is_empty() {
            continue;
        }
        let selection = Selection {
            size,
            id: f.id().to_string(),
        };
        if f.has_audio() {
            combined.insert(height, selection);
        } else {
            video_only.insert(height, selection);
        }
    }

    let heights: BTreeSet<i64> = video_only.keys().chain(combined.keys()).copied().collect();
    let audio = best_audio.filter(|a| !a.id.is_empty());

    let mut qualities = Vec::with_capacity(heights.len() + 1);
    for h in heights.into_iter().rev() {
        let option = match (video_only.get(&h), audio.as_ref(), combined.get(&h)) {
            (Some(v), Some(a), _) => QualityOption {
                format_id: format!("{}+{}", v.id, a.id),
                video_bytes: v.size,
                audio_bytes: a.size,
                total_bytes: v.size + a.size,
                video_size: format_bytes(v.size),
                audio_size: format_bytes(a.size),
                total_size: format_bytes(v.size + a.size),
                ..QualityOption::default()
            },
            (_, _, Some(c)) | (Some(c), None, None) => QualityOption {
                format_id: c.id.clone(),
                video_bytes: c.size,
                total_bytes: c.size,
                video_size: format_bytes(c.size),
                audio_size: "-".to_string(),
                total_size: format_bytes(c.size),
                ..QualityOption::default()
            },
            (None, _, None) => continue,
        };
        qualities.push(QualityOption {
            label: format!("{h}p"),
            value: format!("{h}p"),
            ..option
        });
    }

    let (audio_id, audio_bytes) = audio.map(|a| (a.id, a.size)).unwrap_or_default();
    qualities.push(QualityOption {
        label: "Audio Only".to_string(),
        value: "audio".to_string(),
        format_id: audio_id,
        video_bytes: 0,
        audio_bytes,
        total_bytes: audio_bytes,
        video_size: "-".to_string(),
        audio_size: format_bytes(audio_bytes),
        total_size: format_bytes(audio_bytes),
    });

    Ok(VideoInfo {
        title: raw.title,
        thumbnail: pick_thumbnail(raw.thumbnail.as_deref(), &raw.thumbnails),
        duration: raw.duration.unwrap_or(0.0),
        qualities,
    })
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawEntry {
    title: Option<String>,
    duration: Option<f64>,
    thumbnail: Option<String>,
    thumbnails: Vec<RawThumbnail>,
    url: Option<String>,
    webpage_url: Option<String>,
}

#[derive(Debug, Deserialize, Default)]
#[serde(default)]
struct RawPlaylist {
    title: String,
    thumbnail: Option<String>,
    thumbnails: Vec<RawThumbnail>,
    entries: Vec<RawEntry>,
}

pub fn parse_playlist_info(json: &[u8]) -> Result<PlaylistInfo> {
    let raw: RawPlaylist = serde_json::from_slice(json)?;

    let items = raw
        .entries
        .iter()
        .enumerate()
        .map(|(i, entry)| {
            let url = [entry.webpage_url.as_deref(), entry.url.as_deref()]
                .into_iter()
                .flatten()
                .map(str::trim)
                .find(|u| !u.is_empty())
                .unwrap_or_default()
                .to_string();
            let title = match entry.title.as_deref().map(str::trim) {
                Some(t) if !t.is_empty() => t.to_string(),
                _ if !url.is_empty() => url.clone(),
                _ => format!("Item {}", i + 1),
            };
            PlaylistItem {
                index: i as i64 + 1,
                title,
                duration: entry.duration.unwrap_or(0.0),
                thumbnail: pick_thumbnail(entry.thumbnail.as_deref(), &entry.thumbnails),
                url,
            }
        })
        .collect();

    Ok(PlaylistInfo {
        title: raw.title,
        thumbnail: pick_thumbnail(raw.thumbnail.as_deref(), &raw.thumbnails),
        items,
    })
}

fn pick_thumbnail(primary: Option<&str>, all: &[RawThumbnail]) -> String {
    let chosen = match primary.map(str::trim) {
        Some(t) if !t.is_empty() => t.to_string(),
        _ => all
            .iter()
            .rev()
            .filter_map(|t| t.url.as_deref())
            .find(|u| !u.is_empty())
            .unwrap_or_default()
            .trim()
            .to_string(),
    };
    ensure_https(&chosen)
}

fn ensure_https(url: &str) -> String {
    if let Some(rest) = url.strip_prefix("http://") {
        format!("https://{rest}")
    } else if url.starts_with("//") {
        format!("https:{url}")
    } else {
        url.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{CookieConfig, CookieSource};

    fn task_with(quality: Quality) -> Task {
        Task {
            url: "https://example.com/watch?v=1".to_string(),
            dir: "/downloads".to_string(),
            quality,
            ..Task::default()
        }
    }

    #[test]
    fn selector_ladder() {
        assert_eq!(format_selector(&task_with(Quality::Best)), "bestvideo+bestaudio/best");
        assert_eq!(format_selector(&task_with(Quality::Audio)), "bestaudio/best");
        assert_eq!(
            format_selector(&task_with(Quality::Qhd2k)),
            "bestvideo[height<=1440]+bestaudio/best[height<=1440]"
        );
        assert_eq!(
            format_selector(&task_with(Quality::P144)),
            "bestvideo[height<=144]+bestaudio/best[height<=144]"
        );

        let mut explicit = task_with(Quality::P720);
        explicit.format_id = "137+140".to_string();
        assert_eq!(format_selector(&explicit), "137+140");
    }

    #[test]
    fn download_args_carry_settings_and_end_with_url() {
        let mut task = task_with(Quality::P1080);
        task.format = "mkv".to_string();
        let settings = Settings {
            max_download_speed_mb: Some(4),
            proxy_url: "socks5://127.0.0.1:1080".to_string(),
            geo_bypass: false,
            cookie: CookieConfig {
                enabled: true,
                source: CookieSource::File,
                browser: String::new(),
                file: "/tmp/c.txt".to_string(),
            },
            ..Settings::default()
        };

        let args = build_download_args(&task, &settings, Some(Path::new("/opt/ffmpeg")));
        let joined = args.join(" ");
        assert!(joined.starts_with("--newline --encoding utf-8 --ffmpeg-location /opt/ffmpeg"));
        assert!(joined.contains("-o %(title)s.%(ext)s -P /downloads -f bestvideo[height<=1080]"));
        assert!(joined.contains("-r 4M"));
        assert!(joined.contains("--proxy socks5://127.0.0.1:1080"));
        assert!(joined.contains("--no-geo-bypass"));
        assert!(joined.contains("--cookies /tmp/c.txt"));
        assert!(joined.contains("--merge-output-format mkv"));
        assert_eq!(args.last().map(String::as_str), Some(task.url.as_str()));
    }

    #[test]
    fn original_container_is_not_forced() {
        let task = task_with(Quality::Best);
        let args = build_download_args(&task, &Settings::default(), None);
        assert!(!args.iter().any(|a| a == "--merge-output-format"));
        assert!(!args.iter().any(|a| a == "--ffmpeg-location"));
        assert!(args.iter().any(|a| a == "--geo-bypass"));
    }

    #[test]
    fn video_info_pairs_video_only_streams_with_best_audio() {
        let json = br#"{
  "title": "Clip",
  "thumbnails": [{"url": "//img.example.com/a.jpg"}, {"url": "http://img.example.com/b.jpg"}],
  "duration": 61.5,
  "formats": [
    {"format_id": "139", "vcodec": "none", "acodec": "mp4a", "filesize": 1000},
    {"format_id": "140", "vcodec": "none", "acodec": "mp4a", "filesize_approx": 3000},
    {"format_id": "18", "vcodec": "avc1", "acodec": "mp4a", "height": 360, "filesize": 5000},
    {"format_id": "137", "vcodec": "avc1", "acodec": "none", "height": 1080, "filesize": 90000},
    {"format_id": "136", "vcodec": "avc1", "acodec": "none", "height": 720},
    {"format_id": "sb0", "vcodec": "none", "acodec": "none", "width": 48, "height": 27}
  ]
}"#;
        let info = parse_video_info(json).expect("parse");
        assert_eq!(info.title, "Clip");
        assert_eq!(info.thumbnail, "https://img.example.com/b.jpg");
        assert_eq!(info.duration, 61.5);

        let values: Vec<_> = info.qualities.iter().map(|q| q.value.as_str()).collect();
        assert_eq!(values, vec!["1080p", "360p", "audio"]);

        let best = info.best_video().expect("best");
        assert_eq!(best.format_id, "137+140");
        assert_eq!(best.total_bytes, 93000);
        assert_eq!(info.qualities[1].format_id, "18");
        assert_eq!(info.qualities[1].audio_size, "-");
        assert_eq!(info.qualities[2].format_id, "140");
    }

    #[test]
    fn audio_only_sources_have_no_best_video() {
        let json = br#"{"title": "Podcast", "formats": [
            {"format_id": "a1", "vcodec": "none", "acodec": "opus", "filesize": 42}
        ]}"#;
        let info = parse_video_info(json).expect("parse");
        assert!(info.best_video().is_none());
        assert_eq!(info.qualities.len(), 1);
    }

    #[test]
    fn playlist_entries_fall_back_to_urls_for_titles() {
        let json = br#"{"title": "Mix", "entries": [
            {"title": "First", "url": "https://example.com/1", "duration": 10},
            {"webpage_url": " https://example.com/2 "},
            {}
        ]}"#;
        let info = parse_playlist_info(json).expect("parse");
        assert_eq!(info.items.len(), 3);
        assert_eq!(info.items[0].title, "First");
        assert_eq!(info.items[1].title, "https://example.com/2");
        assert_eq!(info.items[1].url, "https://example.com/2");
        assert_eq!(info.items[2].title, "Item 3");
        assert_eq!(info.items[2].index, 3);
    }
}
