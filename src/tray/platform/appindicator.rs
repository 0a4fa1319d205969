//! AppIndicator fallback built on tray-icon and GTK, for desktops without the
//! SNI wrapper library. No primary-click delivery and no per-item icons.

use crate::bridge::lifecycle::BackendFamily;
use crate::bridge::retention::{self, CallbackSlot, Generation, RetainedSet, TrampolineKey};
use crate::bridge::runtime::{CheckedUpdate, DriverSpec, LoopStatus, NativeDriver, Prepared};
use crate::bridge::trampoline;
use crate::error::{BridgeError, EncodeError, Result};
use crate::icon::IconStore;
use crate::menu::{ClickCallback, MenuItem, MenuSnapshot};
use once_cell::sync::OnceCell;
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::thread::{self, ThreadId};
use tray_icon::menu::{CheckMenuItem, IsMenuItem, Menu, MenuEvent, PredefinedMenuItem, Submenu};
use tray_icon::{Icon, TrayIcon, TrayIconBuilder};

const FAMILY: BackendFamily = BackendFamily::LinuxAppIndicator;

// GTK binds itself to the first thread that initializes it, for the life of the process.
static GTK_THREAD: OnceCell<ThreadId> = OnceCell::new();

/// Claims `owner` for `current`. Fails with the owning thread when another thread got there first.
fn claim_thread(owner: &OnceCell<ThreadId>, current: ThreadId) -> Result<(), ThreadId> {
    let claimed = *owner.get_or_init(|| current);
    if claimed == current {
        Ok(())
    } else {
        Err(claimed)
    }
}

pub struct AppIndicatorSpec;

impl DriverSpec for AppIndicatorSpec {
    type Menu = MenuSnapshot;
    type Driver = AppIndicatorDriver;

    fn family(&self) -> BackendFamily {
        FAMILY
    }

    fn prepare_menu(&self, menu: &MenuSnapshot, _icons: &IconStore) -> Result<MenuSnapshot, EncodeError> {
        menu.validate()?;
        Ok(menu.clone())
    }

    fn connect(&self) -> Result<AppIndicatorDriver> {
        claim_thread(&GTK_THREAD, thread::current().id()).map_err(|owner| {
            BridgeError::init(FAMILY, format!("GTK already belongs to loop thread {:?}", owner))
        })?;
        gtk::init().map_err(|e| BridgeError::init(FAMILY, format!("failed to initialize GTK: {}", e)))?;
        Ok(AppIndicatorDriver { tray: None, installed: None })
    }
}

struct Installed {
    generation: Generation,
    checkables: HashMap<String, CheckMenuItem>,
}

pub struct AppIndicatorDriver {
    tray: Option<TrayIcon>,
    installed: Option<Installed>,
}

fn menu_error(e: impl std::fmt::Display) -> BridgeError {
    BridgeError::init(FAMILY, format!("menu: {}", e))
}

fn load_icon(path: &Path) -> Result<Icon> {
    let image = image::open(path)
        .map_err(|e| BridgeError::init(FAMILY, format!("failed to load icon {:?}: {}", path, e)))?
        .into_rgba8();
    let (width, height) = image.dimensions();
    Icon::from_rgba(image.into_raw(), width, height)
        .map_err(|e| BridgeError::init(FAMILY, format!("invalid icon {:?}: {}", path, e)))
}

struct MenuBuild<'a> {
    set: &'a mut RetainedSet,
    checkables: HashMap<String, CheckMenuItem>,
    noop: ClickCallback,
}

impl MenuBuild<'_> {
    fn item(&mut self, item: &MenuItem) -> Result<Box<dyn IsMenuItem>> {
        if item.is_separator() {
            return Ok(Box::new(PredefinedMenuItem::separator()));
        }

        if item.is_submenu() {
            let submenu = Submenu::new(&item.label, item.enabled);
            for child in &item.children {
                let entry = self.item(child)?;
                submenu.append(entry.as_ref()).map_err(menu_error)?;
            }
            return Ok(Box::new(submenu));
        }

        let slot = CallbackSlot::new();
        let id = format!("{:x}", slot.key());
        let callback = item.on_click.clone().unwrap_or_else(|| self.noop.clone());
        self.set.register(slot.key(), callback);
        self.set.keep(slot);

        if item.checkable {
            let check = CheckMenuItem::with_id(id, &item.label, item.enabled, item.checked, None);
            self.checkables.entry(item.label.clone()).or_insert_with(|| check.clone());
            return Ok(Box::new(check));
        }
        if item.icon.is_some() {
            log::debug!("Item icons are not shown by the AppIndicator backend");
        }
        Ok(Box::new(tray_icon::menu::MenuItem::with_id(id, &item.label, item.enabled, None)))
    }
}

impl AppIndicatorDriver {
    fn build_menu(snapshot: &MenuSnapshot, set: &mut RetainedSet) -> Result<(Menu, HashMap<String, CheckMenuItem>)> {
        let menu = Menu::new();
        let mut build = MenuBuild { set, checkables: HashMap::new(), noop: Arc::new(|| {}) };

        if snapshot.is_empty() {
            // Some panels hide the indicator when its menu is empty.
            menu.append(&PredefinedMenuItem::separator()).map_err(menu_error)?;
        }
        for item in snapshot.items() {
            let entry = build.item(item)?;
            menu.append(entry.as_ref()).map_err(menu_error)?;
        }
        Ok((menu, build.checkables))
    }

    fn install(&mut self, props: Prepared<MenuSnapshot>, generation: Generation) -> Result<()> {
        let icon = load_icon(&props.icon_path)?;
        let mut set = RetainedSet::new();
        let (menu, checkables) = Self::build_menu(&props.menu, &mut set)?;
        if props.on_primary_click.is_some() {
            log::debug!("Primary click is not delivered by the AppIndicator backend");
        }
        retention::global().retain(generation, set);

        match &self.tray {
            Some(tray) => {
                tray.set_menu(Some(Box::new(menu)));
                if let Err(e) = tray.set_icon(Some(icon)) {
                    log::warn!("Failed to set tray icon: {}", e);
                }
                if let Err(e) = tray.set_tooltip(Some(&props.tooltip)) {
                    log::warn!("Failed to set tooltip: {}", e);
                }
            }
            None => {
                let built = TrayIconBuilder::new()
                    .with_menu(Box::new(menu))
                    .with_tooltip(&props.tooltip)
                    .with_icon(icon)
                    .build();
                match built {
                    Ok(tray) => self.tray = Some(tray),
                    Err(e) => {
                        retention::global().release(generation);
                        return Err(BridgeError::init(FAMILY, format!("failed to create tray icon: {}", e)));
                    }
                }
            }
        }

        if let Some(previous) = self.installed.replace(Installed { generation, checkables }) {
            retention::global().release(previous.generation);
        }
        Ok(())
    }
}

impl NativeDriver for AppIndicatorDriver {
    type Menu = MenuSnapshot;

    fn init(&mut self, props: Prepared<MenuSnapshot>, generation: Generation) -> Result<()> {
        self.install(props, generation)
    }

    fn apply(&mut self, props: Prepared<MenuSnapshot>, generation: Generation) -> Result<()> {
        self.install(props, generation)
    }

    fn set_checked(&mut self, label: &str, checked: bool) -> CheckedUpdate {
        match self.installed.as_ref().and_then(|i| i.checkables.get(label)) {
            Some(item) => {
                item.set_checked(checked);
                CheckedUpdate::Applied
            }
            None => CheckedUpdate::NeedsRebuild,
        }
    }

    fn pump(&mut self) -> LoopStatus {
        while gtk::events_pending() {
            gtk::main_iteration_do(false);
        }
        while let Ok(event) = MenuEvent::receiver().try_recv() {
            log::debug!("Menu event: {}", event.id.0);
            match usize::from_str_radix(&event.id.0, 16) {
                Ok(addr) => {
                    trampoline::dispatch(TrampolineKey::from_addr(addr));
                }
                Err(_) => log::debug!("Ignoring foreign menu event {}", event.id.0),
            }
        }
        LoopStatus::Running
    }

    fn shutdown(&mut self) {
        if let Some(tray) = self.tray.take() {
            if let Err(e) = tray.set_visible(false) {
                log::warn!("Failed to hide tray icon: {}", e);
            }
            drop(tray);
        }
        self.installed = None;
        while gtk::events_pending() {
            gtk::main_iteration_do(false);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn gtk_thread_is_claimed_once() {
        // Arrange
        let owner = OnceCell::new();
        let first = thread::current().id();
        let second = thread::spawn(|| thread::current().id()).join().unwrap();

        // Act
        let results = [claim_thread(&owner, first), claim_thread(&owner, first), claim_thread(&owner, second)];

        // Assert
        assert_eq!(results, [Ok(()), Ok(()), Err(first)]);
    }
}
