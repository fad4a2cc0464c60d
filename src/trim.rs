use crate::ffmpeg::{cut, safe_stamp, sibling_with_tag};
use crate::process::CancelToken;
use crate::task::TrimMode;
use crate::{EngineError, Result};
use std::path::{Path, PathBuf};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrimOutcome {
    /// File holding the trimmed media.
    pub output: PathBuf,
    /// The original was atomically replaced by the trimmed copy.
    pub replaced_original: bool,
}

/// Trims a finished download.
///
/// The cut is always written to a sibling file first. `Overwrite` flushes it to disk and renames
/// it over the original, so a failure at any point leaves the original intact; `KeepBoth` keeps
/// the sibling under a `_trim_<start>_<end>` name. A failed cut removes whatever partial sibling
/// it left behind.
pub fn trim_download(
    ffmpeg: &Path,
    input: &Path,
    mode: TrimMode,
    start: Option<&str>,
    end: Option<&str>,
    cancel: Option<&CancelToken>,
) -> Result<TrimOutcome> {
    if !input.is_file() {
        return Err(EngineError::InvalidRequest(format!(
            "nothing to trim at {}",
            input.display()
        )));
    }

    let target = match mode {
        TrimMode::None => {
            return Err(EngineError::InvalidRequest("trim mode is none".to_string()));
        }
        TrimMode::Overwrite => sibling_with_tag(input, ".trimmed"),
        TrimMode::KeepBoth => sibling_with_tag(
            input,
            &format!(
                "_trim_{}_{}",
                stamp_or(start, "start"),
                stamp_or(end, "end")
            ),
        ),
    };

    if let Err(e) = cut(ffmpeg, input, &target, start, end, cancel) {
        let _ = std::fs::remove_file(&target);
        return Err(e);
    }

    if mode == TrimMode::KeepBoth {
        return Ok(TrimOutcome {
            output: target,
            replaced_original: false,
        });
    }

    if let Err(e) = replace_atomically(&target, input) {
        let _ = std::fs::remove_file(&target);
        return Err(e);
    }
    Ok(TrimOutcome {
        output: input.to_path_buf(),
        replaced_original: true,
    })
}

fn replace_atomically(from: &Path, to: &Path) -> Result<()> {
    std::fs::File::open(from)?.sync_all()?;
    std::fs::rename(from, to)?;
    Ok(())
}

fn stamp_or(value: Option<&str>, fallback: &str) -> String {
    match value.map(str::trim) {
        Some(v) if !v.is_empty() => safe_stamp(v),
        _ => fallback.to_string(),
    }
}
