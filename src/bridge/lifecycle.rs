use crate::error::{BridgeError, Result};
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Condvar, Mutex, PoisonError};
use std::time::{Duration, Instant};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendFamily {
    Win32,
    Cocoa,
    LinuxSni,
    LinuxAppIndicator,
    Simulated,
}

impl BackendFamily {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendFamily::Win32 => "win32",
            BackendFamily::Cocoa => "cocoa",
            BackendFamily::LinuxSni => "linux_sni",
            BackendFamily::LinuxAppIndicator => "linux_appindicator",
            BackendFamily::Simulated => "simulated",
        }
    }

    /// Library stems passed to `libloading::library_filename`.
    pub fn library_names(&self) -> &'static [&'static str] {
        match self {
            BackendFamily::Win32 => &["tray"],
            BackendFamily::Cocoa => &["MacTray"],
            BackendFamily::LinuxSni => &["tray"],
            BackendFamily::LinuxAppIndicator | BackendFamily::Simulated => &[],
        }
    }
}

impl fmt::Display for BackendFamily {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Counting permit that serializes start and dispose sequences of one backend family.
/// Native tray libraries keep process-global state, so two runtimes of the same family
/// must never be inside init or teardown at once.
#[derive(Debug)]
pub struct LifecyclePermit {
    family: BackendFamily,
    permits: Mutex<usize>,
    released: Condvar,
}

impl LifecyclePermit {
    pub fn new(family: BackendFamily, permits: usize) -> Arc<Self> {
        Arc::new(Self {
            family,
            permits: Mutex::new(permits),
            released: Condvar::new(),
        })
    }

    pub fn family(&self) -> BackendFamily {
        self.family
    }

    pub fn acquire(self: &Arc<Self>, timeout: Duration) -> Result<PermitGuard> {
        let deadline = Instant::now() + timeout;
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);

        while *permits == 0 {
            let now = Instant::now();
            if now >= deadline {
                return Err(BridgeError::LifecycleBusy { family: self.family, waited: timeout });
            }
            permits = self
                .released
                .wait_timeout(permits, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        *permits -= 1;
        Ok(PermitGuard { permit: Arc::clone(self) })
    }

    pub fn try_acquire(self: &Arc<Self>) -> Option<PermitGuard> {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        if *permits == 0 {
            return None;
        }
        *permits -= 1;
        Some(PermitGuard { permit: Arc::clone(self) })
    }

    pub fn is_available(&self) -> bool {
        *self.permits.lock().unwrap_or_else(PoisonError::into_inner) > 0
    }

    fn release(&self) {
        let mut permits = self.permits.lock().unwrap_or_else(PoisonError::into_inner);
        *permits += 1;
        self.released.notify_one();
    }
}

/// Held for the duration of a lifecycle sequence. May be dropped on any thread.
#[must_use]
#[derive(Debug)]
pub struct PermitGuard {
    permit: Arc<LifecyclePermit>,
}

impl Drop for PermitGuard {
    fn drop(&mut self) {
        self.permit.release();
    }
}

static PERMITS: Lazy<Mutex<HashMap<BackendFamily, Arc<LifecyclePermit>>>> =
    Lazy::new(|| Mutex::new(HashMap::new()));

/// Process-wide permit for `family`.
pub fn permit_for(family: BackendFamily) -> Arc<LifecyclePermit> {
    let mut permits = PERMITS.lock().unwrap_or_else(PoisonError::into_inner);
    Arc::clone(permits.entry(family).or_insert_with(|| LifecyclePermit::new(family, 1)))
}
