//! Turns yt-dlp's line-oriented output into task state.
//!
//! Lines are first classified by [`classify_line`] into one of a handful of named shapes, then
//! folded into a [`ProgressTracker`], which owns the byte accumulators for one run. The tracker
//! is the only place that decides how many bytes a part contributes, so a part is counted once
//! regardless of whether its "already downloaded" notice arrives before or after its progress
//! lines.

use crate::format::parse_size;
use crate::paths::resolve_in;
use crate::task::{Task, TaskStatus};
use regex::Regex;
use std::path::Path;
use std::sync::OnceLock;

#[derive(Debug, Clone, PartialEq)]
pub enum OutputLine {
    Destination(String),
    AlreadyDownloaded(String),
    Progress {
        percent: f64,
        total_bytes: Option<f64>,
        speed: Option<String>,
        eta: Option<String>,
    },
    Merging(String),
    DeletingOriginal(String),
    Other,
}

fn progress_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(
            r"^\[download\]\s+(\d+(?:\.\d+)?)%(?:\s+of\s+(~?\s*[\d.]+[A-Za-z]*))?(?:.*?\s+at\s+(.+?)\s+ETA\s+(\S+))?",
        )
        .expect("valid progress regex")
    })
}

fn destination_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\[download\] Destination: (.+)$").expect("valid regex"))
}

fn already_downloaded_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^\[download\] (.+?) has already been downloaded(?: and merged)?$")
            .expect("valid regex")
    })
}

fn merger_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r#"^\[Merger\] Merging formats into "(.+)"$"#).expect("valid regex"))
}

fn deleting_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^Deleting original file (.+?)(?: \(pass -k to keep\))?$").expect("valid regex")
    })
}

pub fn classify_line(line: &str) -> OutputLine {
    let line = line.trim();

    if let Some(caps) = destination_re().captures(line) {
        return OutputLine::Destination(caps[1].trim().to_string());
    }
    if let Some(caps) = already_downloaded_re().captures(line) {
        return OutputLine::AlreadyDownloaded(caps[1].trim().to_string());
    }
    if let Some(caps) = merger_re().captures(line) {
        return OutputLine::Merging(caps[1].to_string());
    }
    if let Some(caps) = deleting_re().captures(line) {
        return OutputLine::DeletingOriginal(caps[1].trim().to_string());
    }
    if let Some(caps) = progress_re().captures(line) {
        let percent = caps[1].parse::<f64>().unwrap_or(0.0);
        return OutputLine::Progress {
            percent,
            total_bytes: caps.get(2).and_then(|m| parse_size(m.as_str())),
            speed: caps.get(3).map(|m| m.as_str().trim().to_string()),
            eta: caps.get(4).map(|m| m.as_str().to_string()),
        };
    }
    OutputLine::Other
}

/// Percentage lines are re-rendered in place by the UI and are not kept in the task log.
pub fn is_ephemeral_progress(line: &str) -> bool {
    matches!(classify_line(line), OutputLine::Progress { .. })
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct LineEffect {
    /// Task state changed; a snapshot should be emitted.
    pub changed: bool,
    /// Append the raw line to the task's text log.
    pub keep_in_log: bool,
}

/// Byte accumulators for one run of one task.
#[derive(Debug, Default)]
pub struct ProgressTracker {
    completed_bytes: f64,
    current_part_bytes: f64,
    current_part_downloaded: f64,
    current_part_path: Option<String>,
    /// The current part's bytes are already inside `completed_bytes`.
    current_part_settled: bool,
    current_part_logged: bool,
    merging: bool,
    last_percent: f64,
}

impl ProgressTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn completed_bytes(&self) -> f64 {
        self.completed_bytes
    }

    pub fn apply(&mut self, line: &str, task: &mut Task) -> LineEffect {
        let parsed = classify_line(line);
        let mut effect = LineEffect {
            changed: false,
            keep_in_log: !matches!(parsed, OutputLine::Progress { .. }),
        };

        match parsed {
            OutputLine::Destination(raw) => {
                let path = normalize(&task.dir, &raw);
                if !self.merging && self.current_part_path.as_deref() != Some(path.as_str()) {
                    self.fold_current(task);
                    self.start_part(&path, false);
                    task.update_file_entry(&path, 0, 0.0);
                }
                task.file_path = path;
                effect.changed = true;
            }
            OutputLine::AlreadyDownloaded(raw) => {
                let path = normalize(&task.dir, &raw);
                if self.current_part_path.as_deref() != Some(path.as_str()) {
                    self.fold_current(task);
                }
                // A same-path part may have reported progress already; the disk size replaces it.
                let on_disk = file_size(Path::new(&path));
                if !(self.current_part_settled
                    && self.current_part_path.as_deref() == Some(path.as_str()))
                {
                    self.completed_bytes += on_disk as f64;
                }
                self.start_part(&path, true);
                task.update_file_entry(&path, on_disk as i64, 100.0);
                task.file_path = path;
                effect.changed = true;
            }
            OutputLine::Progress {
                percent,
                total_bytes,
                speed,
                eta,
            } => {
                self.last_percent = percent.clamp(0.0, 100.0);
                if let Some(speed) = speed {
                    task.speed = speed;
                }
                if let Some(eta) = eta {
                    task.eta = eta;
                }
                if !self.current_part_settled && !self.merging {
                    if let Some(size) = total_bytes {
                        self.current_part_bytes = size;
                        self.current_part_downloaded = size * self.last_percent / 100.0;
                    }
                    if let Some(path) = self.current_part_path.clone() {
                        task.update_file_entry(
                            &path,
                            self.current_part_bytes.round() as i64,
                            self.last_percent,
                        );
                    }
                }
                if self.last_percent >= 100.0 && !self.current_part_logged {
                    self.current_part_logged = true;
                    effect.keep_in_log = true;
                }
                effect.changed = true;
            }
            OutputLine::Merging(raw) => {
                let path = normalize(&task.dir, &raw);
                self.fold_current(task);
                self.merging = true;
                task.status = TaskStatus::Merging;
                task.file_path = path.clone();
                task.update_file_entry(&path, 0, 0.0);
                effect.changed = true;
            }
            OutputLine::DeletingOriginal(raw) => {
                let path = normalize(&task.dir, &raw);
                task.remove_file_entry(&path);
                effect.changed = true;
            }
            OutputLine::Other => {}
        }

        if effect.changed {
            task.progress = self.progress(task.total_bytes);
        }
        effect
    }

    pub fn progress(&self, total_bytes: i64) -> f64 {
        if total_bytes > 0 {
            let done = self.completed_bytes + self.current_part_downloaded;
            (100.0 * done / total_bytes as f64).clamp(0.0, 100.0)
        } else {
            self.last_percent
        }
    }

    fn fold_current(&mut self, task: &mut Task) {
        if !self.current_part_settled && self.current_part_bytes > 0.0 {
            self.completed_bytes += self.current_part_bytes;
            if let Some(path) = self.current_part_path.clone() {
                task.update_file_entry(&path, self.current_part_bytes.round() as i64, 100.0);
            }
        }
        self.current_part_settled = true;
        self.current_part_bytes = 0.0;
        self.current_part_downloaded = 0.0;
    }

    fn start_part(&mut self, path: &str, settled: bool) {
        self.current_part_path = Some(path.to_string());
        self.current_part_bytes = 0.0;
        self.current_part_downloaded = 0.0;
        self.current_part_settled = settled;
        self.current_part_logged = false;
    }
}

fn normalize(dir: &str, raw: &str) -> String {
    resolve_in(Path::new(dir), raw.trim().trim_matches('"'))
        .to_string_lossy()
        .to_string()
}

fn file_size(path: &Path) -> u64 {
    std::fs::metadata(path).map(|m| m.len()).unwrap_or(0)
}
