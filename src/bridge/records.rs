//! `#[repr(C)]` mirrors of the `tray.h` structs. Field order and offsets are part
//! of the ABI and are pinned below; the Win32 and Cocoa libraries disagree on both.

use std::ffi::{c_char, c_int, c_void};
use std::mem::{offset_of, size_of};
use std::ptr;

pub type MenuItemCallback<M> = unsafe extern "C" fn(item: *mut M);
pub type TrayCallback = unsafe extern "C" fn(tray: *mut c_void);

/// One `struct tray_menu_item` layout. Sibling lists are contiguous arrays ended
/// by a record with null `text`.
pub trait MenuRecord: Copy + Send + 'static {
    /// Whether the layout carries a per-item icon path.
    const HAS_ICON: bool;

    fn new(
        text: *const c_char,
        icon_filepath: *const c_char,
        disabled: bool,
        checked: bool,
        cb: Option<MenuItemCallback<Self>>,
        submenu: *mut Self,
    ) -> Self;
    fn text(&self) -> *const c_char;
    /// Null when unset or when the layout has no icon field.
    fn icon_filepath(&self) -> *const c_char;
    fn disabled(&self) -> c_int;
    fn checked(&self) -> c_int;
    fn set_checked(&mut self, checked: bool);
    fn callback(&self) -> Option<MenuItemCallback<Self>>;
    fn submenu(&self) -> *mut Self;

    fn terminator() -> Self {
        Self::new(ptr::null(), ptr::null(), false, false, None, ptr::null_mut())
    }

    fn is_terminator(&self) -> bool {
        self.text().is_null()
    }
}

/// Win32 `tray_menu_item`: icon path after the text.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct Win32MenuItem {
    pub text: *const c_char,
    pub icon_filepath: *const c_char,
    pub disabled: c_int,
    pub checked: c_int,
    pub cb: Option<MenuItemCallback<Win32MenuItem>>,
    pub submenu: *mut Win32MenuItem,
}

/// Cocoa `tray_menu_item`: no icon path, 32-byte stride.
#[repr(C)]
#[derive(Clone, Copy, Debug)]
pub struct CocoaMenuItem {
    pub text: *const c_char,
    pub disabled: c_int,
    pub checked: c_int,
    pub cb: Option<MenuItemCallback<CocoaMenuItem>>,
    pub submenu: *mut CocoaMenuItem,
}

const PTR: usize = size_of::<*const c_void>();

const _: () = assert!(offset_of!(Win32MenuItem, text) == 0);
const _: () = assert!(offset_of!(Win32MenuItem, icon_filepath) == PTR);
const _: () = assert!(offset_of!(Win32MenuItem, disabled) == 2 * PTR);
const _: () = assert!(offset_of!(Win32MenuItem, checked) == 2 * PTR + 4);
const _: () = assert!(offset_of!(Win32MenuItem, cb) == 2 * PTR + 8);
const _: () = assert!(offset_of!(Win32MenuItem, submenu) == 3 * PTR + 8);
const _: () = assert!(size_of::<Win32MenuItem>() == 4 * PTR + 8);

const _: () = assert!(offset_of!(CocoaMenuItem, text) == 0);
const _: () = assert!(offset_of!(CocoaMenuItem, disabled) == PTR);
const _: () = assert!(offset_of!(CocoaMenuItem, checked) == PTR + 4);
const _: () = assert!(offset_of!(CocoaMenuItem, cb) == PTR + 8);
const _: () = assert!(offset_of!(CocoaMenuItem, submenu) == 2 * PTR + 8);
const _: () = assert!(size_of::<CocoaMenuItem>() == 3 * PTR + 8);

// Raw pointers inside point at allocations owned by the retention table, which are Send.
unsafe impl Send for Win32MenuItem {}
unsafe impl Send for CocoaMenuItem {}

impl MenuRecord for Win32MenuItem {
    const HAS_ICON: bool = true;

    fn new(
        text: *const c_char,
        icon_filepath: *const c_char,
        disabled: bool,
        checked: bool,
        cb: Option<MenuItemCallback<Self>>,
        submenu: *mut Self,
    ) -> Self {
        Self {
            text,
            icon_filepath,
            disabled: c_int::from(disabled),
            checked: c_int::from(checked),
            cb,
            submenu,
        }
    }

    fn text(&self) -> *const c_char {
        self.text
    }

    fn icon_filepath(&self) -> *const c_char {
        self.icon_filepath
    }

    fn disabled(&self) -> c_int {
        self.disabled
    }

    fn checked(&self) -> c_int {
        self.checked
    }

    fn set_checked(&mut self, checked: bool) {
        self.checked = c_int::from(checked);
    }

    fn callback(&self) -> Option<MenuItemCallback<Self>> {
        self.cb
    }

    fn submenu(&self) -> *mut Self {
        self.submenu
    }
}

impl MenuRecord for CocoaMenuItem {
    const HAS_ICON: bool = false;

    fn new(
        text: *const c_char,
        _icon_filepath: *const c_char,
        disabled: bool,
        checked: bool,
        cb: Option<MenuItemCallback<Self>>,
        submenu: *mut Self,
    ) -> Self {
        Self {
            text,
            disabled: c_int::from(disabled),
            checked: c_int::from(checked),
            cb,
            submenu,
        }
    }

    fn text(&self) -> *const c_char {
        self.text
    }

    fn icon_filepath(&self) -> *const c_char {
        ptr::null()
    }

    fn disabled(&self) -> c_int {
        self.disabled
    }

    fn checked(&self) -> c_int {
        self.checked
    }

    fn set_checked(&mut self, checked: bool) {
        self.checked = c_int::from(checked);
    }

    fn callback(&self) -> Option<MenuItemCallback<Self>> {
        self.cb
    }

    fn submenu(&self) -> *mut Self {
        self.submenu
    }
}

/// Shape shared by the per-platform `struct tray` layouts.
pub trait TrayRecord: Send + 'static {
    type Item: MenuRecord;

    fn new(
        icon_filepath: *const c_char,
        tooltip: *const c_char,
        menu: *mut Self::Item,
        cb: Option<TrayCallback>,
    ) -> Self;
    fn menu(&self) -> *mut Self::Item;
    fn icon_filepath(&self) -> *const c_char;
    fn tooltip(&self) -> *const c_char;
    fn callback(&self) -> Option<TrayCallback>;
}

/// `struct tray` of the Win32 library: the callback precedes the menu.
#[repr(C)]
#[derive(Debug)]
pub struct Win32Tray {
    pub icon_filepath: *const c_char,
    pub tooltip: *const c_char,
    pub cb: Option<TrayCallback>,
    pub menu: *mut Win32MenuItem,
}

const _: () = assert!(offset_of!(Win32Tray, icon_filepath) == 0);
const _: () = assert!(offset_of!(Win32Tray, tooltip) == PTR);
const _: () = assert!(offset_of!(Win32Tray, cb) == 2 * PTR);
const _: () = assert!(offset_of!(Win32Tray, menu) == 3 * PTR);

/// `struct tray` of the Cocoa library: the menu precedes the callback.
#[repr(C)]
#[derive(Debug)]
pub struct CocoaTray {
    pub icon_filepath: *const c_char,
    pub tooltip: *const c_char,
    pub menu: *mut CocoaMenuItem,
    pub cb: Option<TrayCallback>,
}

const _: () = assert!(offset_of!(CocoaTray, icon_filepath) == 0);
const _: () = assert!(offset_of!(CocoaTray, tooltip) == PTR);
const _: () = assert!(offset_of!(CocoaTray, menu) == 2 * PTR);
const _: () = assert!(offset_of!(CocoaTray, cb) == 3 * PTR);

unsafe impl Send for Win32Tray {}
unsafe impl Send for CocoaTray {}

macro_rules! impl_tray_record {
    ($ty:ty, $item:ty) => {
        impl TrayRecord for $ty {
            type Item = $item;

            fn new(
                icon_filepath: *const c_char,
                tooltip: *const c_char,
                menu: *mut $item,
                cb: Option<TrayCallback>,
            ) -> Self {
                Self { icon_filepath, tooltip, menu, cb }
            }

            fn menu(&self) -> *mut $item {
                self.menu
            }

            fn icon_filepath(&self) -> *const c_char {
                self.icon_filepath
            }

            fn tooltip(&self) -> *const c_char {
                self.tooltip
            }

            fn callback(&self) -> Option<TrayCallback> {
                self.cb
            }
        }
    };
}

impl_tray_record!(Win32Tray, Win32MenuItem);
impl_tray_record!(CocoaTray, CocoaMenuItem);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminator_has_null_text() {
        let win32 = Win32MenuItem::terminator();
        let cocoa = CocoaMenuItem::terminator();

        assert!(win32.is_terminator() && cocoa.is_terminator());
        assert!(win32.cb.is_none() && cocoa.cb.is_none());
        assert!(win32.submenu.is_null() && cocoa.submenu.is_null());
    }

    #[test]
    fn cocoa_item_matches_swift_reader_offsets() {
        // tray.swift reads disabled@8 checked@12 cb@16 submenu@24 and steps by 32.
        if PTR != 8 {
            return;
        }
        let cases = [
            (offset_of!(CocoaMenuItem, disabled), 8),
            (offset_of!(CocoaMenuItem, checked), 12),
            (offset_of!(CocoaMenuItem, cb), 16),
            (offset_of!(CocoaMenuItem, submenu), 24),
            (size_of::<CocoaMenuItem>(), 32),
        ];

        for (actual, expected) in cases {
            assert_eq!(actual, expected);
        }
    }

    #[test]
    fn cocoa_item_drops_icon_path() {
        let text = c"A".as_ptr();
        let icon = c"/tmp/a.png".as_ptr();

        let record = CocoaMenuItem::new(text, icon, true, true, None, ptr::null_mut());

        assert!(record.icon_filepath().is_null());
        assert_eq!((record.disabled(), record.checked()), (1, 1));
    }

    #[test]
    fn tray_layouts_differ_only_in_menu_and_callback_order() {
        assert_eq!(size_of::<Win32Tray>(), size_of::<CocoaTray>());
        assert_ne!(offset_of!(Win32Tray, menu), offset_of!(CocoaTray, menu));
        assert_eq!(offset_of!(Win32Tray, cb), offset_of!(CocoaTray, menu));
    }
}
