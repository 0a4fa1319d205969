pub mod platform;

use crate::bridge::lifecycle::BackendFamily;
use crate::bridge::runtime::{DriverSpec, TrayOptions, TrayRuntime, TrayUpdate};
use crate::bridge::state::RuntimeState;
use crate::config::BridgeConfig;
use crate::error::Result;
use crate::menu::MenuSnapshot;
use std::time::Duration;

/// Object-safe view of a [`TrayRuntime`], whatever its native backend.
pub trait TrayBackend: Send + Sync {
    fn family(&self) -> BackendFamily;
    fn state(&self) -> RuntimeState;
    fn start(&self, options: TrayOptions, menu: MenuSnapshot) -> Result<()>;
    fn update(&self, change: TrayUpdate) -> Result<()>;
    fn update_item_checked(&self, label: &str, checked: bool) -> Result<()>;
    fn dispose(&self) -> Result<()>;
    fn barrier(&self, timeout: Duration) -> bool;
}

impl<S: DriverSpec> TrayBackend for TrayRuntime<S> {
    fn family(&self) -> BackendFamily {
        TrayRuntime::family(self)
    }

    fn state(&self) -> RuntimeState {
        TrayRuntime::state(self)
    }

    fn start(&self, options: TrayOptions, menu: MenuSnapshot) -> Result<()> {
        TrayRuntime::start(self, options, menu)
    }

    fn update(&self, change: TrayUpdate) -> Result<()> {
        TrayRuntime::update(self, change)
    }

    fn update_item_checked(&self, label: &str, checked: bool) -> Result<()> {
        TrayRuntime::update_item_checked(self, label, checked)
    }

    fn dispose(&self) -> Result<()> {
        TrayRuntime::dispose(self)
    }

    fn barrier(&self, timeout: Duration) -> bool {
        TrayRuntime::barrier(self, timeout)
    }
}

/// A tray icon on the platform's native backend. Dropping it disposes the tray.
///
/// Safe to share between threads; menu callbacks may hold a `Weak` to it and
/// call back into `update`, `update_item_checked` or `dispose`.
pub struct NativeTray {
    backend: Box<dyn TrayBackend>,
}

impl NativeTray {
    pub fn new(config: &BridgeConfig) -> Result<Self> {
        let backend = platform::create_backend(config)?;
        log::info!("Using {} tray backend", backend.family());
        Ok(Self { backend })
    }

    pub fn from_backend(backend: Box<dyn TrayBackend>) -> Self {
        Self { backend }
    }

    pub fn family(&self) -> BackendFamily {
        self.backend.family()
    }

    pub fn state(&self) -> RuntimeState {
        self.backend.state()
    }

    pub fn start(&self, options: TrayOptions, menu: impl Into<MenuSnapshot>) -> Result<()> {
        self.backend.start(options, menu.into())
    }

    pub fn update(&self, change: TrayUpdate) -> Result<()> {
        self.backend.update(change)
    }

    pub fn update_item_checked(&self, label: &str, checked: bool) -> Result<()> {
        self.backend.update_item_checked(label, checked)
    }

    pub fn dispose(&self) -> Result<()> {
        self.backend.dispose()
    }

    pub fn barrier(&self, timeout: Duration) -> bool {
        self.backend.barrier(timeout)
    }
}
