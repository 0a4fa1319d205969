use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

pub const ENV_NATIVE_LIB: &str = "TRAYBRIDGE_NATIVE_LIB";
pub const ENV_NATIVE_LIB_DIR: &str = "TRAYBRIDGE_NATIVE_LIB_DIR";
pub const ENV_LINUX_BACKEND: &str = "TRAYBRIDGE_LINUX_BACKEND";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BridgeConfig {
    pub native: NativeLibraryConfig,
    pub timeouts: Timeouts,
    pub linux_backend: LinuxBackend,
    pub icon_cache_dir: Option<PathBuf>,
}

/// Where to look for the native tray library before the platform search path.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct NativeLibraryConfig {
    pub library_path: Option<PathBuf>,
    pub library_dir: Option<PathBuf>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Timeouts {
    pub start_ms: u64,
    pub dispose_ms: u64,
    pub permit_ms: u64,
    pub poll_ms: u64,
}

impl Default for Timeouts {
    fn default() -> Self {
        Self {
            start_ms: 5000,
            dispose_ms: 500,
            permit_ms: 5000,
            poll_ms: 16,
        }
    }
}

impl Timeouts {
    pub fn start(&self) -> Duration {
        Duration::from_millis(self.start_ms)
    }

    pub fn dispose(&self) -> Duration {
        Duration::from_millis(self.dispose_ms)
    }

    pub fn permit(&self) -> Duration {
        Duration::from_millis(self.permit_ms)
    }

    pub fn poll(&self) -> Duration {
        Duration::from_millis(self.poll_ms.max(1))
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LinuxBackend {
    #[default]
    Sni,
    AppIndicator,
}

impl LinuxBackend {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "sni" => Some(LinuxBackend::Sni),
            "appindicator" | "app_indicator" => Some(LinuxBackend::AppIndicator),
            _ => None,
        }
    }
}

impl BridgeConfig {
    /// Reads `<config_dir>/traybridge/config.json`, then applies environment overrides.
    pub fn load() -> Result<Self> {
        let path = crate::paths::config_path()?;
        let mut config = Self::load_from(&path)?;
        config.apply_env(|key| std::env::var(key).ok());
        Ok(config)
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {:?}", path))?;
        let config: BridgeConfig = serde_json::from_str(&content)
            .with_context(|| format!("Invalid config in {:?}", path))?;
        Ok(config)
    }

    pub fn apply_env(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(path) = lookup(ENV_NATIVE_LIB).filter(|v| !v.is_empty()) {
            self.native.library_path = Some(PathBuf::from(path));
        }
        if let Some(dir) = lookup(ENV_NATIVE_LIB_DIR).filter(|v| !v.is_empty()) {
            self.native.library_dir = Some(PathBuf::from(dir));
        }
        if let Some(value) = lookup(ENV_LINUX_BACKEND) {
            match LinuxBackend::parse(&value) {
                Some(backend) => self.linux_backend = backend,
                None => log::warn!("Ignoring unknown {}: {}", ENV_LINUX_BACKEND, value),
            }
        }
    }

    pub fn icon_store(&self) -> crate::icon::IconStore {
        match &self.icon_cache_dir {
            Some(dir) => crate::icon::IconStore::new(dir),
            None => crate::icon::IconStore::default_location(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;
    use tempfile::TempDir;

    #[test]
    fn defaults() {
        let config = BridgeConfig::default();

        assert_eq!(config.timeouts.dispose(), Duration::from_millis(500));
        assert_eq!(config.timeouts.poll(), Duration::from_millis(16));
        assert_eq!(config.linux_backend, LinuxBackend::Sni);
        assert!(config.native.library_path.is_none());
    }

    #[test]
    fn missing_file_yields_defaults() {
        let dir = TempDir::new().unwrap();

        let config = BridgeConfig::load_from(&dir.path().join("config.json")).unwrap();

        assert_eq!(config.timeouts.start_ms, 5000);
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"timeouts": {"dispose_ms": 250}, "linux_backend": "app_indicator"}"#).unwrap();

        let config = BridgeConfig::load_from(&path).unwrap();

        assert_eq!(config.timeouts.dispose_ms, 250);
        assert_eq!(config.timeouts.poll_ms, 16);
        assert_eq!(config.linux_backend, LinuxBackend::AppIndicator);
    }

    #[test]
    fn invalid_file_is_an_error() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, "{not json").unwrap();

        assert!(BridgeConfig::load_from(&path).is_err());
    }

    #[test]
    fn env_overrides() {
        let cases = vec![
            (vec![(ENV_NATIVE_LIB, "/opt/tray/libtray.so")], Some("/opt/tray/libtray.so"), None, LinuxBackend::Sni),
            (vec![(ENV_NATIVE_LIB_DIR, "/opt/tray")], None, Some("/opt/tray"), LinuxBackend::Sni),
            (vec![(ENV_LINUX_BACKEND, "AppIndicator")], None, None, LinuxBackend::AppIndicator),
            (vec![(ENV_LINUX_BACKEND, "bogus")], None, None, LinuxBackend::Sni),
            (vec![(ENV_NATIVE_LIB, "")], None, None, LinuxBackend::Sni),
        ];

        for (vars, path, dir, backend) in cases {
            let env: HashMap<&str, &str> = vars.into_iter().collect();
            let mut config = BridgeConfig::default();

            config.apply_env(|key| env.get(key).map(|v| v.to_string()));

            assert_eq!(config.native.library_path, path.map(PathBuf::from));
            assert_eq!(config.native.library_dir, dir.map(PathBuf::from));
            assert_eq!(config.linux_backend, backend);
        }
    }
}
