use super::chain::ChainSpec;
use crate::bridge::lifecycle::BackendFamily;
use crate::bridge::records::Win32Tray;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::native::tray_api::DynamicTrayApi;
use std::sync::Arc;

pub type Win32Spec = ChainSpec<DynamicTrayApi<Win32Tray>>;

/// `tray_loop` fails transiently while Explorer restarts; a fresh `tray_update` recovers it.
const LOOP_RETRIES: u32 = 5;

/// Loads `tray.dll`. The library runs its own message window, pumped by `tray_loop(0)`.
pub fn spec(config: &BridgeConfig) -> Result<Win32Spec> {
    let api = DynamicTrayApi::<Win32Tray>::load(BackendFamily::Win32, &config.native)?;
    Ok(ChainSpec::new(BackendFamily::Win32, Arc::new(api)).with_loop_retries(LOOP_RETRIES))
}
