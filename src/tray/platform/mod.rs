pub mod chain;
pub mod sni;

#[cfg(target_os = "linux")]
pub mod appindicator;

#[cfg(target_os = "windows")]
mod windows;

#[cfg(target_os = "macos")]
mod macos;

#[cfg(target_os = "macos")]
pub use macos::{assume_main_loop_running, run_main_loop};

use super::TrayBackend;
use crate::bridge::lifecycle::BackendFamily;
use crate::bridge::runtime::TrayRuntime;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::native::simulated::SimulatedTrayApi;
use chain::ChainSpec;
use std::sync::Arc;

#[cfg(target_os = "windows")]
pub fn create_backend(config: &BridgeConfig) -> Result<Box<dyn TrayBackend>> {
    let spec = windows::spec(config)?;
    Ok(Box::new(TrayRuntime::new(spec, config)))
}

#[cfg(target_os = "macos")]
pub fn create_backend(config: &BridgeConfig) -> Result<Box<dyn TrayBackend>> {
    let spec = macos::spec(config)?;
    Ok(Box::new(TrayRuntime::new(spec, config)))
}

#[cfg(target_os = "linux")]
pub fn create_backend(config: &BridgeConfig) -> Result<Box<dyn TrayBackend>> {
    use crate::config::LinuxBackend;
    use crate::native::sni_api::DynamicSniApi;

    if config.linux_backend == LinuxBackend::Sni {
        match DynamicSniApi::load(&config.native) {
            Ok(api) => {
                let spec = sni::SniSpec::new(Arc::new(api));
                return Ok(Box::new(TrayRuntime::new(spec, config)));
            }
            Err(e) => log::warn!("{}; falling back to AppIndicator", e),
        }
    }
    Ok(Box::new(TrayRuntime::new(appindicator::AppIndicatorSpec, config)))
}

#[cfg(not(any(target_os = "windows", target_os = "macos", target_os = "linux")))]
pub fn create_backend(config: &BridgeConfig) -> Result<Box<dyn TrayBackend>> {
    log::warn!("No native tray on this platform; using the simulated backend");
    let (backend, _) = simulated(config);
    Ok(backend)
}

/// Backend over the in-process `tray.h` library, plus a handle to drive it.
pub fn simulated(config: &BridgeConfig) -> (Box<dyn TrayBackend>, Arc<SimulatedTrayApi>) {
    let api = SimulatedTrayApi::new();
    let spec = ChainSpec::new(BackendFamily::Simulated, Arc::clone(&api));
    (Box::new(TrayRuntime::new(spec, config)), api)
}
