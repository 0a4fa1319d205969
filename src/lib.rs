//! Keeps a declarative tray icon and context menu live against native tray libraries.
//!
//! Callers describe the menu as an immutable [`MenuSnapshot`] and hand it to a [`NativeTray`].
//! The bridge encodes it for the platform backend, owns a dedicated loop thread per runtime and
//! keeps every record and closure alive for as long as native code can reach it.

pub mod bridge;
pub mod config;
pub mod error;
pub mod icon;
pub mod menu;
pub mod native;
pub mod paths;
pub mod tray;

pub use bridge::lifecycle::{BackendFamily, LifecyclePermit};
pub use bridge::runtime::{TrayOptions, TrayRuntime, TrayUpdate};
pub use bridge::state::RuntimeState;
pub use config::BridgeConfig;
pub use error::{BridgeError, EncodeError};
pub use icon::TrayIcon;
pub use menu::{ClickCallback, MenuItem, MenuSnapshot};
pub use tray::{NativeTray, TrayBackend};
