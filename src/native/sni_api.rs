use super::NativeLibrary;
use crate::bridge::lifecycle::BackendFamily;
use crate::config::NativeLibraryConfig;
use crate::error::Result;
use std::ffi::{c_char, c_int, c_void};

pub type Handle = *mut c_void;
pub type ActionCallback = unsafe extern "C" fn(data: *mut c_void);
pub type ActivateCallback = unsafe extern "C" fn(x: c_int, y: c_int, data: *mut c_void);

/// Handle-based StatusNotifierItem wrapper (`libtray.so`).
///
/// Strings are copied by the library; callback `data` pointers are not and
/// must outlive the menu or tray they were registered on.
pub trait SniApi: Send + Sync + 'static {
    fn init_system(&self) -> c_int;
    fn shutdown_system(&self);
    fn process_events(&self);

    unsafe fn create_tray(&self, id: *const c_char) -> Handle;
    unsafe fn destroy_tray(&self, tray: Handle);
    unsafe fn set_title(&self, tray: Handle, title: *const c_char);
    unsafe fn set_status(&self, tray: Handle, status: *const c_char);
    /// `initial` selects `set_icon_by_path` over `update_icon_by_path`.
    unsafe fn set_icon(&self, tray: Handle, path: *const c_char, initial: bool);
    unsafe fn set_tooltip(&self, tray: Handle, title: *const c_char);
    unsafe fn set_activate_callback(&self, tray: Handle, cb: Option<ActivateCallback>, data: *mut c_void);

    fn create_menu(&self) -> Handle;
    unsafe fn destroy_menu(&self, menu: Handle);
    unsafe fn set_context_menu(&self, tray: Handle, menu: Handle);
    unsafe fn add_action(&self, menu: Handle, text: *const c_char, enabled: bool, cb: ActionCallback, data: *mut c_void) -> Handle;
    unsafe fn add_checkable(&self, menu: Handle, text: *const c_char, checked: bool, cb: ActionCallback, data: *mut c_void) -> Handle;
    unsafe fn add_separator(&self, menu: Handle);
    unsafe fn create_submenu(&self, menu: Handle, text: *const c_char) -> Handle;
    unsafe fn set_item_enabled(&self, item: Handle, enabled: bool);

    /// False when the library has no per-item icons.
    unsafe fn set_item_icon(&self, item: Handle, path: *const c_char) -> bool;

    /// `None` when the library cannot toggle items in place.
    unsafe fn set_item_checked(&self, tray: Handle, item: Handle, checked: bool) -> Option<c_int>;
}

type InitFn = unsafe extern "C" fn() -> c_int;
type VoidFn = unsafe extern "C" fn();
type CreateTrayFn = unsafe extern "C" fn(*const c_char) -> Handle;
type HandleFn = unsafe extern "C" fn(Handle);
type HandleStrFn = unsafe extern "C" fn(Handle, *const c_char);
type SetActivateFn = unsafe extern "C" fn(Handle, Option<ActivateCallback>, *mut c_void);
type CreateMenuFn = unsafe extern "C" fn() -> Handle;
type HandleHandleFn = unsafe extern "C" fn(Handle, Handle);
type AddActionFn = unsafe extern "C" fn(Handle, *const c_char, ActionCallback, *mut c_void) -> Handle;
type AddCheckableFn = unsafe extern "C" fn(Handle, *const c_char, c_int, ActionCallback, *mut c_void) -> Handle;
type CreateSubmenuFn = unsafe extern "C" fn(Handle, *const c_char) -> Handle;
type SetEnabledFn = unsafe extern "C" fn(Handle, c_int);
type SetCheckedFn = unsafe extern "C" fn(Handle, c_int) -> c_int;

pub struct DynamicSniApi {
    _library: NativeLibrary,
    init_tray_system: InitFn,
    shutdown_tray_system: VoidFn,
    sni_process_events: VoidFn,
    create_tray: CreateTrayFn,
    destroy_handle: HandleFn,
    set_title: HandleStrFn,
    set_status: HandleStrFn,
    set_icon_by_path: HandleStrFn,
    update_icon_by_path: HandleStrFn,
    set_tooltip_title: HandleStrFn,
    set_activate_callback: SetActivateFn,
    create_menu: CreateMenuFn,
    destroy_menu: HandleFn,
    set_context_menu: HandleHandleFn,
    add_menu_action: AddActionFn,
    add_disabled_menu_action: AddActionFn,
    add_checkable_menu_action: AddCheckableFn,
    add_menu_separator: HandleFn,
    create_submenu: CreateSubmenuFn,
    set_menu_item_enabled: SetEnabledFn,
    set_menu_item_checked: Option<SetCheckedFn>,
    set_menu_item_icon: Option<HandleStrFn>,
    tray_update: Option<HandleFn>,
}

impl DynamicSniApi {
    pub fn load(config: &NativeLibraryConfig) -> Result<Self> {
        let library = NativeLibrary::open(BackendFamily::LinuxSni, config)?;
        let api = unsafe {
            Self {
                init_tray_system: library.function("init_tray_system")?,
                shutdown_tray_system: library.function("shutdown_tray_system")?,
                sni_process_events: library.function("sni_process_events")?,
                create_tray: library.function("create_tray")?,
                destroy_handle: library.function("destroy_handle")?,
                set_title: library.function("set_title")?,
                set_status: library.function("set_status")?,
                set_icon_by_path: library.function("set_icon_by_path")?,
                update_icon_by_path: library.function("update_icon_by_path")?,
                set_tooltip_title: library.function("set_tooltip_title")?,
                set_activate_callback: library.function("set_activate_callback")?,
                create_menu: library.function("create_menu")?,
                destroy_menu: library.function("destroy_menu")?,
                set_context_menu: library.function("set_context_menu")?,
                add_menu_action: library.function("add_menu_action")?,
                add_disabled_menu_action: library.function("add_disabled_menu_action")?,
                add_checkable_menu_action: library.function("add_checkable_menu_action")?,
                add_menu_separator: library.function("add_menu_separator")?,
                create_submenu: library.function("create_submenu")?,
                set_menu_item_enabled: library.function("set_menu_item_enabled")?,
                set_menu_item_checked: library.optional("set_menu_item_checked"),
                set_menu_item_icon: library.optional("set_menu_item_icon"),
                tray_update: library.optional("tray_update"),
                _library: library,
            }
        };

        log::debug!(
            "SNI optional exports: set_menu_item_checked={} set_menu_item_icon={}",
            api.set_menu_item_checked.is_some(),
            api.set_menu_item_icon.is_some()
        );
        Ok(api)
    }
}

impl SniApi for DynamicSniApi {
    fn init_system(&self) -> c_int {
        unsafe { (self.init_tray_system)() }
    }

    fn shutdown_system(&self) {
        unsafe { (self.shutdown_tray_system)() }
    }

    fn process_events(&self) {
        unsafe { (self.sni_process_events)() }
    }

    unsafe fn create_tray(&self, id: *const c_char) -> Handle {
        (self.create_tray)(id)
    }

    unsafe fn destroy_tray(&self, tray: Handle) {
        (self.destroy_handle)(tray)
    }

    unsafe fn set_title(&self, tray: Handle, title: *const c_char) {
        (self.set_title)(tray, title)
    }

    unsafe fn set_status(&self, tray: Handle, status: *const c_char) {
        (self.set_status)(tray, status)
    }

    unsafe fn set_icon(&self, tray: Handle, path: *const c_char, initial: bool) {
        if initial {
            (self.set_icon_by_path)(tray, path)
        } else {
            (self.update_icon_by_path)(tray, path)
        }
    }

    unsafe fn set_tooltip(&self, tray: Handle, title: *const c_char) {
        (self.set_tooltip_title)(tray, title)
    }

    unsafe fn set_activate_callback(&self, tray: Handle, cb: Option<ActivateCallback>, data: *mut c_void) {
        (self.set_activate_callback)(tray, cb, data)
    }

    fn create_menu(&self) -> Handle {
        unsafe { (self.create_menu)() }
    }

    unsafe fn destroy_menu(&self, menu: Handle) {
        (self.destroy_menu)(menu)
    }

    unsafe fn set_context_menu(&self, tray: Handle, menu: Handle) {
        (self.set_context_menu)(tray, menu)
    }

    unsafe fn add_action(&self, menu: Handle, text: *const c_char, enabled: bool, cb: ActionCallback, data: *mut c_void) -> Handle {
        if enabled {
            (self.add_menu_action)(menu, text, cb, data)
        } else {
            (self.add_disabled_menu_action)(menu, text, cb, data)
        }
    }

    unsafe fn add_checkable(&self, menu: Handle, text: *const c_char, checked: bool, cb: ActionCallback, data: *mut c_void) -> Handle {
        let item = (self.add_checkable_menu_action)(menu, text, c_int::from(checked), cb, data);
        // Older builds return void here; only builds that can toggle items hand back a usable handle.
        if self.set_menu_item_checked.is_some() {
            item
        } else {
            std::ptr::null_mut()
        }
    }

    unsafe fn add_separator(&self, menu: Handle) {
        (self.add_menu_separator)(menu)
    }

    unsafe fn create_submenu(&self, menu: Handle, text: *const c_char) -> Handle {
        (self.create_submenu)(menu, text)
    }

    unsafe fn set_item_enabled(&self, item: Handle, enabled: bool) {
        (self.set_menu_item_enabled)(item, c_int::from(enabled))
    }

    unsafe fn set_item_icon(&self, item: Handle, path: *const c_char) -> bool {
        match self.set_menu_item_icon {
            Some(set_icon) => {
                set_icon(item, path);
                true
            }
            None => false,
        }
    }

    unsafe fn set_item_checked(&self, tray: Handle, item: Handle, checked: bool) -> Option<c_int> {
        let set_checked = self.set_menu_item_checked?;
        let status = set_checked(item, c_int::from(checked));
        if status == 0 {
            if let Some(refresh) = self.tray_update {
                refresh(tray);
            }
        }
        Some(status)
    }
}
