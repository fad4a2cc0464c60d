use crate::cmd;
use crate::process::{run_command_output_with_control, CancelToken, CommandRunError};
use crate::{EngineError, Result};
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::OnceLock;

fn duration_re() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"Duration:\s+(\d+):(\d+):(\d+(?:\.\d+)?)").expect("valid duration regex")
    })
}

/// Seconds from the `Duration: HH:MM:SS.ss` banner ffmpeg prints for its input.
pub fn parse_duration(output: &str) -> Option<f64> {
    let caps = duration_re().captures(output)?;
    let hours: f64 = caps[1].parse().ok()?;
    let minutes: f64 = caps[2].parse().ok()?;
    let seconds: f64 = caps[3].parse().ok()?;
    Some(hours * 3600.0 + minutes * 60.0 + seconds)
}

pub fn probe_duration(ffmpeg: &Path, input: &Path) -> Result<f64> {
    // Without an output ffmpeg exits nonzero; the banner is still printed.
    let output = cmd::command(ffmpeg)
        .args(["-nostdin", "-hide_banner", "-i"])
        .arg(input)
        .output()
        .map_err(map_spawn_error)?;

    let mut combined = String::from_utf8_lossy(&output.stderr).to_string();
    combined.push_str(&String::from_utf8_lossy(&output.stdout));
    match parse_duration(&combined) {
        Some(seconds) => Ok(seconds),
        None => Err(EngineError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: output.status.code(),
            stderr: "duration not found".to_string(),
        }),
    }
}

/// Stream-copies `[start, end]` of `input` into `output`. Either bound may be omitted.
pub fn cut(
    ffmpeg: &Path,
    input: &Path,
    output: &Path,
    start: Option<&str>,
    end: Option<&str>,
    cancel: Option<&CancelToken>,
) -> Result<()> {
    let mut command = cmd::command(ffmpeg);
    command.args(["-nostdin", "-y"]);
    if let Some(start) = start.map(str::trim).filter(|s| !s.is_empty()) {
        command.args(["-ss", start]);
    }
    if let Some(end) = end.map(str::trim).filter(|s| !s.is_empty()) {
        command.args(["-to", end]);
    }
    command.arg("-i").arg(input).args(["-c", "copy"]).arg(output);

    let result = match run_command_output_with_control(&mut command, cancel, 0) {
        Ok(result) => result,
        Err(CommandRunError::Spawn(e)) => return Err(map_spawn_error(e)),
        Err(CommandRunError::Canceled) => {
            return Err(EngineError::ExternalToolCanceled {
                tool: "ffmpeg".to_string(),
            })
        }
        Err(CommandRunError::Wait(e)) => return Err(EngineError::Io(e)),
        Err(CommandRunError::TimedOut(secs)) => {
            return Err(EngineError::ExternalToolFailed {
                tool: "ffmpeg".to_string(),
                code: None,
                stderr: format!("timed out after {secs}s"),
            })
        }
    };

    if !result.status.success() {
        return Err(EngineError::ExternalToolFailed {
            tool: "ffmpeg".to_string(),
            code: result.status.code(),
            stderr: last_lines(&String::from_utf8_lossy(&result.stderr), 8),
        });
    }
    Ok(())
}

/// Cuts a clip next to `input`, named `<base>_clip_<start>_<end><ext>`.
pub fn extract_clip(ffmpeg: &Path, input: &Path, start: &str, end: &str) -> Result<PathBuf> {
    let output = sibling_with_tag(input, &format!("_clip_{}_{}", safe_stamp(start), safe_stamp(end)));
    cut(ffmpeg, input, &output, Some(start), Some(end), None)?;
    Ok(output)
}

/// `dir/base.ext` -> `dir/base<tag>.ext`.
pub fn sibling_with_tag(input: &Path, tag: &str) -> PathBuf {
    let stem = input
        .file_stem()
        .map(|s| s.to_string_lossy().to_string())
        .unwrap_or_default();
    let name = match input.extension() {
        Some(ext) => format!("{stem}{tag}.{}", ext.to_string_lossy()),
        None => format!("{stem}{tag}"),
    };
    input.with_file_name(name)
}

pub fn safe_stamp(value: &str) -> String {
    value.trim().replace(':', "-")
}

fn last_lines(text: &str, n: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(n);
    lines[start..].join("\n")
}

fn map_spawn_error(e: std::io::Error) -> EngineError {
    match e.kind() {
        std::io::ErrorKind::NotFound => EngineError::ExternalToolMissing {
            tool: "ffmpeg".to_string(),
        },
        _ => EngineError::Io(e),
    }
}
