use crate::paths::AppPaths;
use crate::{EngineError, Result};
use serde::{Deserialize, Serialize};

const DEFAULT_DOWNLOAD_CONCURRENCY: usize = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CookieSource {
    #[default]
    Browser,
    File,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct CookieConfig {
    pub enabled: bool,
    pub source: CookieSource,
    /// Browser name handed to `--cookies-from-browser` (e.g. "firefox").
    pub browser: String,
    /// Netscape cookie jar handed to `--cookies`.
    pub file: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    pub download_dir: Option<String>,
    pub download_concurrency: i64,
    /// MB/s; `None` or non-positive means unlimited.
    pub max_download_speed_mb: Option<i64>,
    pub proxy_url: String,
    pub user_agent: String,
    pub referer: String,
    pub geo_bypass: bool,
    pub cookie: CookieConfig,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            download_dir: None,
            download_concurrency: DEFAULT_DOWNLOAD_CONCURRENCY as i64,
            max_download_speed_mb: None,
            proxy_url: String::new(),
            user_agent: String::new(),
            referer: String::new(),
            geo_bypass: true,
            cookie: CookieConfig::default(),
        }
    }
}

impl Settings {
    pub fn max_concurrent_downloads(&self) -> usize {
        if self.download_concurrency <= 0 {
            DEFAULT_DOWNLOAD_CONCURRENCY
        } else {
            self.download_concurrency as usize
        }
    }

    /// Value for yt-dlp's `-r`, e.g. `5M`.
    pub fn rate_limit_arg(&self) -> Option<String> {
        match self.max_download_speed_mb {
            Some(mb) if mb > 0 => Some(format!("{mb}M")),
            _ => None,
        }
    }

    pub fn cookie_args(&self) -> Vec<String> {
        let cookie = &self.cookie;
        if !cookie.enabled {
            return Vec::new();
        }
        match cookie.source {
            CookieSource::Browser if !cookie.browser.trim().is_empty() => vec![
                "--cookies-from-browser".to_string(),
                cookie.browser.trim().to_string(),
            ],
            CookieSource::File if !cookie.file.trim().is_empty() => {
                vec!["--cookies".to_string(), cookie.file.trim().to_string()]
            }
            _ => Vec::new(),
        }
    }

    pub fn download_dir_or_default(&self, paths: &AppPaths) -> String {
        match self.download_dir.as_deref().map(str::trim) {
            Some(dir) if !dir.is_empty() => dir.to_string(),
            _ => paths.default_download_dir().to_string_lossy().to_string(),
        }
    }
}

pub fn load_settings(paths: &AppPaths) -> Result<Settings> {
    let path = paths.settings_path();
    if !path.exists() {
        return Ok(Settings::default());
    }
    let bytes = std::fs::read(&path)?;
    let parsed: Settings = serde_json::from_slice(&bytes).map_err(|e| {
        EngineError::InvalidRequest(format!(
            "failed to parse settings at {}: {e}",
            path.to_string_lossy()
        ))
    })?;
    Ok(parsed)
}

pub fn save_settings(paths: &AppPaths, settings: &Settings) -> Result<()> {
    let path = paths.settings_path();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let json = serde_json::to_string_pretty(settings)?;
    std::fs::write(&path, format!("{json}\n"))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn non_positive_concurrency_falls_back_to_three() {
        let mut settings = Settings::default();
        settings.download_concurrency = 0;
        assert_eq!(settings.max_concurrent_downloads(), 3);
        settings.download_concurrency = -4;
        assert_eq!(settings.max_concurrent_downloads(), 3);
        settings.download_concurrency = 5;
        assert_eq!(settings.max_concurrent_downloads(), 5);
    }

    #[test]
    fn rate_limit_only_for_positive_speeds() {
        let mut settings = Settings::default();
        assert_eq!(settings.rate_limit_arg(), None);
        settings.max_download_speed_mb = Some(0);
        assert_eq!(settings.rate_limit_arg(), None);
        settings.max_download_speed_mb = Some(8);
        assert_eq!(settings.rate_limit_arg().as_deref(), Some("8M"));
    }

    #[test]
    fn cookie_args_follow_source() {
        let mut settings = Settings::default();
        settings.cookie.browser = "firefox".to_string();
        assert!(settings.cookie_args().is_empty(), "disabled cookies add nothing");

        settings.cookie.enabled = true;
        assert_eq!(settings.cookie_args(), vec!["--cookies-from-browser", "firefox"]);

        settings.cookie.source = CookieSource::File;
        assert!(settings.cookie_args().is_empty(), "file source without a path");
        settings.cookie.file = "/tmp/cookies.txt".to_string();
        assert_eq!(settings.cookie_args(), vec!["--cookies", "/tmp/cookies.txt"]);
    }

    #[test]
    fn partial_settings_file_keeps_defaults() {
        let dir = tempfile::tempdir().expect("tempdir");
        let paths = AppPaths::new(dir.path().to_path_buf());
        paths.ensure_dirs().expect("ensure dirs");
        std::fs::write(paths.settings_path(), r#"{"download_concurrency": 2}"#).expect("write");

        let settings = load_settings(&paths).expect("load");
        assert_eq!(settings.max_concurrent_downloads(), 2);
        assert!(settings.geo_bypass);

        save_settings(&paths, &settings).expect("save");
        assert_eq!(load_settings(&paths).expect("reload"), settings);
    }
}
