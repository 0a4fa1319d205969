use std::collections::hash_map::DefaultHasher;
use std::fmt;
use std::fs;
use std::hash::{Hash, Hasher};
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

static TMP_SEQ: AtomicU64 = AtomicU64::new(0);

/// Icon handed to the bridge. Native libraries only take file paths, so byte
/// buffers are written to the icon cache before they reach a backend.
#[derive(Clone, PartialEq, Eq)]
pub enum TrayIcon {
    Path(PathBuf),
    Bytes(Arc<[u8]>),
}

impl TrayIcon {
    pub fn from_path(path: impl Into<PathBuf>) -> Self {
        TrayIcon::Path(path.into())
    }

    pub fn from_bytes(bytes: impl Into<Vec<u8>>) -> Self {
        TrayIcon::Bytes(Arc::from(bytes.into()))
    }
}

impl fmt::Debug for TrayIcon {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TrayIcon::Path(p) => f.debug_tuple("Path").field(p).finish(),
            TrayIcon::Bytes(b) => write!(f, "Bytes({} bytes)", b.len()),
        }
    }
}

#[derive(Clone, Debug)]
pub struct IconStore {
    dir: PathBuf,
}

impl IconStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn default_location() -> Self {
        Self::new(crate::paths::icon_cache_dir_or_temp())
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// File path a native library can load for `icon`. Byte buffers are
    /// content addressed, so resolving the same bytes twice reuses one file.
    pub fn resolve(&self, icon: &TrayIcon) -> io::Result<PathBuf> {
        let bytes = match icon {
            TrayIcon::Path(path) => return Ok(path.clone()),
            TrayIcon::Bytes(bytes) => bytes,
        };

        let mut hasher = DefaultHasher::new();
        bytes.hash(&mut hasher);
        let name = format!("icon-{:016x}.{}", hasher.finish(), sniff_extension(bytes));
        let target = self.dir.join(name);

        if target.exists() {
            return Ok(target);
        }

        fs::create_dir_all(&self.dir)?;
        let seq = TMP_SEQ.fetch_add(1, Ordering::Relaxed);
        let tmp = self.dir.join(format!(".{}-{}.tmp", std::process::id(), seq));
        fs::write(&tmp, bytes)?;
        fs::rename(&tmp, &target)?;
        log::debug!("Cached icon at {:?}", target);
        Ok(target)
    }
}

fn sniff_extension(bytes: &[u8]) -> &'static str {
    if bytes.starts_with(b"\x89PNG\r\n\x1a\n") {
        "png"
    } else if bytes.starts_with(&[0, 0, 1, 0]) {
        "ico"
    } else {
        "img"
    }
}
