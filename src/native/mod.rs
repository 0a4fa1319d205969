pub mod simulated;
pub mod sni_api;
pub mod tray_api;

use crate::bridge::lifecycle::BackendFamily;
use crate::config::NativeLibraryConfig;
use crate::error::{BridgeError, Result};
use libloading::{Library, Symbol};
use std::ffi::OsString;
use std::path::{Path, PathBuf};

/// A loaded native tray library. Function pointers copied out of it are only
/// valid while this value is alive.
#[derive(Debug)]
pub struct NativeLibrary {
    path: PathBuf,
    library: Library,
}

impl NativeLibrary {
    pub fn open(family: BackendFamily, config: &NativeLibraryConfig) -> Result<Self> {
        let mut tried = Vec::new();

        for candidate in candidates(family, config) {
            match unsafe { Library::new(&candidate) } {
                Ok(library) => {
                    log::info!("Loaded {} tray library: {:?}", family, candidate);
                    return Ok(Self { path: candidate, library });
                }
                Err(e) => {
                    log::debug!("Could not load {:?}: {}", candidate, e);
                    tried.push(candidate.display().to_string());
                }
            }
        }

        Err(BridgeError::LibraryNotFound { family, tried: tried.join(", ") })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// # Safety
    /// `T` must be the exact function pointer type of the exported symbol.
    pub unsafe fn function<T: Copy>(&self, symbol: &str) -> Result<T> {
        self.optional(symbol).ok_or_else(|| BridgeError::MissingSymbol {
            path: self.path.clone(),
            symbol: symbol.to_string(),
        })
    }

    /// # Safety
    /// Same as [`NativeLibrary::function`].
    pub unsafe fn optional<T: Copy>(&self, symbol: &str) -> Option<T> {
        let name = format!("{}\0", symbol);
        let found: Symbol<T> = self.library.get(name.as_bytes()).ok()?;
        Some(*found)
    }
}

/// Load order: explicit file, configured directory, then the platform search path.
fn candidates(family: BackendFamily, config: &NativeLibraryConfig) -> Vec<PathBuf> {
    let mut paths = Vec::new();

    if let Some(path) = &config.library_path {
        paths.push(path.clone());
    }
    let names: Vec<OsString> = family
        .library_names()
        .iter()
        .map(|name| libloading::library_filename(name))
        .collect();
    if let Some(dir) = &config.library_dir {
        paths.extend(names.iter().map(|name| dir.join(name)));
    }
    paths.extend(names.into_iter().map(PathBuf::from));
    paths
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn candidate_order() {
        let config = NativeLibraryConfig {
            library_path: Some(PathBuf::from("/opt/custom/libcustom.so")),
            library_dir: Some(PathBuf::from("/opt/tray")),
        };
        let file = PathBuf::from(libloading::library_filename("tray"));

        let paths = candidates(BackendFamily::LinuxSni, &config);

        assert_eq!(paths, vec![
            PathBuf::from("/opt/custom/libcustom.so"),
            PathBuf::from("/opt/tray").join(&file),
            file,
        ]);
    }

    #[test]
    fn in_process_families_have_no_candidates() {
        let paths = candidates(BackendFamily::Simulated, &NativeLibraryConfig::default());
        assert!(paths.is_empty());
    }

    #[test]
    fn missing_library_lists_what_was_tried() {
        let config = NativeLibraryConfig {
            library_path: Some(PathBuf::from("/nonexistent/libnothing.so")),
            library_dir: None,
        };

        let err = NativeLibrary::open(BackendFamily::Simulated, &config).unwrap_err();

        assert!(matches!(err, BridgeError::LibraryNotFound { .. }));
        assert!(err.to_string().contains("/nonexistent/libnothing.so"));
    }
}
