use anyhow::{Context, Result};
use std::path::PathBuf;

const APP_DIR: &str = "traybridge";

pub fn config_dir() -> Result<PathBuf> {
    dirs::config_dir()
        .context("Could not determine config directory")
        .map(|p| p.join(APP_DIR))
}

pub fn config_path() -> Result<PathBuf> {
    config_dir().map(|p| p.join("config.json"))
}

pub fn cache_dir() -> Result<PathBuf> {
    dirs::cache_dir()
        .context("Could not determine cache directory")
        .map(|p| p.join(APP_DIR))
}

pub fn icon_cache_dir() -> Result<PathBuf> {
    cache_dir().map(|p| p.join("icons"))
}

/// Icon cache location that never fails; falls back to the temp dir on
/// systems without a cache directory (headless CI, minimal containers).
pub fn icon_cache_dir_or_temp() -> PathBuf {
    icon_cache_dir().unwrap_or_else(|e| {
        log::debug!("{}; using temp dir for icons", e);
        std::env::temp_dir().join(APP_DIR).join("icons")
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn paths_have_correct_suffixes() {
        let cases: Vec<(Result<PathBuf>, &str)> = vec![
            (config_dir(), "traybridge"),
            (config_path(), "traybridge/config.json"),
            (cache_dir(), "traybridge"),
            (icon_cache_dir(), "traybridge/icons"),
        ];

        for (result, expected_suffix) in cases {
            let Ok(path) = result else { continue };
            assert!(path.ends_with(expected_suffix), "path {:?} should end with {}", path, expected_suffix);
        }
    }

    #[test]
    fn icon_cache_fallback_ends_with_icons() {
        assert!(icon_cache_dir_or_temp().ends_with("icons"));
    }
}
