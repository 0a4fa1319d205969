use super::records::{MenuItemCallback, MenuRecord};
use super::retention::{RetainedSet, TrampolineKey};
use super::trampoline::menu_item_trampoline;
use crate::error::EncodeError;
use crate::icon::IconStore;
use crate::menu::{MenuItem, MenuSnapshot, SEPARATOR_LABEL};
use std::ffi::{c_char, CStr, CString};
use std::path::{Path, PathBuf};
use std::ptr::{self, NonNull};

/// Owned C string whose pointer stays stable until drop.
#[derive(Debug)]
pub struct NativeStr(NonNull<c_char>);

impl NativeStr {
    pub fn new(value: &str) -> Result<Self, EncodeError> {
        let owned = CString::new(value).map_err(|_| EncodeError::InteriorNul(value.to_string()))?;
        // CString::into_raw never returns null.
        Ok(Self(unsafe { NonNull::new_unchecked(owned.into_raw()) }))
    }

    pub fn from_path(path: &Path) -> Result<Self, EncodeError> {
        Self::new(&path.to_string_lossy())
    }

    pub fn as_ptr(&self) -> *const c_char {
        self.0.as_ptr()
    }
}

impl Drop for NativeStr {
    fn drop(&mut self) {
        unsafe { drop(CString::from_raw(self.0.as_ptr())) };
    }
}

unsafe impl Send for NativeStr {}

/// One sibling array, terminator included.
#[derive(Debug)]
pub(crate) struct RecordBlock<M>(NonNull<[M]>);

impl<M: MenuRecord> RecordBlock<M> {
    fn new(records: Vec<M>) -> Self {
        Self(NonNull::from(Box::leak(records.into_boxed_slice())))
    }

    fn head(&self) -> *mut M {
        self.0.as_ptr() as *mut M
    }

    fn len(&self) -> usize {
        self.0.len()
    }
}

impl<M> Drop for RecordBlock<M> {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.0.as_ptr())) };
    }
}

unsafe impl<M: Send> Send for RecordBlock<M> {}

/// A menu laid out for one `tray.h` ABI plus everything that must outlive it.
#[derive(Debug)]
pub struct EncodedMenu<M> {
    root: *mut M,
    records: usize,
    callbacks: usize,
    retained: RetainedSet,
}

// `root` points into a block owned by `retained`.
unsafe impl<M: Send> Send for EncodedMenu<M> {}

impl<M> EncodedMenu<M> {
    pub fn root(&self) -> *mut M {
        self.root
    }

    /// Records allocated, terminators included.
    pub fn record_count(&self) -> usize {
        self.records
    }

    pub fn callback_count(&self) -> usize {
        self.callbacks
    }

    pub fn into_retained(self) -> (*mut M, RetainedSet) {
        (self.root, self.retained)
    }
}

pub struct MenuEncoder<'a> {
    icons: &'a IconStore,
}

impl<'a> MenuEncoder<'a> {
    pub fn new(icons: &'a IconStore) -> Self {
        Self { icons }
    }

    /// Lays `snapshot` out depth first, child arrays before their parents. An empty
    /// tree becomes a lone terminator.
    pub fn encode<M: MenuRecord>(&self, snapshot: &MenuSnapshot) -> Result<EncodedMenu<M>, EncodeError> {
        snapshot.validate()?;

        let mut out = EncodedMenu {
            root: ptr::null_mut(),
            records: 0,
            callbacks: 0,
            retained: RetainedSet::new(),
        };
        out.root = self.encode_level(snapshot.items(), &mut out)?;
        Ok(out)
    }

    fn encode_level<M: MenuRecord>(&self, items: &[MenuItem], out: &mut EncodedMenu<M>) -> Result<*mut M, EncodeError> {
        let mut records = Vec::with_capacity(items.len() + 1);

        for item in items {
            let text = NativeStr::new(&item.label)?;
            let icon = match &item.icon {
                Some(icon) if M::HAS_ICON => Some(NativeStr::from_path(&self.icons.resolve(icon)?)?),
                Some(_) => {
                    log::debug!("Item icon for {:?} dropped; layout has no icon field", item.label);
                    None
                }
                None => None,
            };
            let submenu = if item.is_submenu() {
                self.encode_level(&item.children, out)?
            } else {
                ptr::null_mut()
            };
            let cb = (item.on_click.is_some() && !item.is_separator())
                .then_some(menu_item_trampoline::<M> as MenuItemCallback<M>);

            records.push(M::new(
                text.as_ptr(),
                icon.as_ref().map_or(ptr::null(), NativeStr::as_ptr),
                !item.enabled,
                item.checked,
                cb,
                submenu,
            ));
            out.retained.keep(text);
            if let Some(icon) = icon {
                out.retained.keep(icon);
            }
        }
        records.push(M::terminator());

        Ok(self.finish_block(records, items, out))
    }

    fn finish_block<M: MenuRecord>(&self, records: Vec<M>, items: &[MenuItem], out: &mut EncodedMenu<M>) -> *mut M {
        let block = RecordBlock::new(records);
        let head = block.head();

        for (idx, item) in items.iter().enumerate() {
            let Some(callback) = &item.on_click else { continue };
            if item.is_separator() {
                continue;
            }
            // Key by the record's final heap address; native hands that pointer back.
            let record = unsafe { head.add(idx) };
            out.retained.register(TrampolineKey::from_ptr(record), callback.clone());
            out.callbacks += 1;
        }

        out.records += block.len();
        out.retained.keep(block);
        head
    }
}

/// Tree view of native records, used to check what native code will see.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DecodedItem {
    pub label: String,
    pub enabled: bool,
    pub checked: bool,
    pub has_callback: bool,
    pub icon_path: Option<PathBuf>,
    pub children: Vec<DecodedItem>,
}

/// # Safety
/// `root` must be null or point at a terminated record array whose strings and
/// submenus are alive for the duration of the call.
pub unsafe fn decode<M: MenuRecord>(root: *const M) -> Vec<DecodedItem> {
    let mut items = Vec::new();
    if root.is_null() {
        return items;
    }

    let mut cursor = root;
    while !(*cursor).is_terminator() {
        let record = &*cursor;
        let icon = record.icon_filepath();
        items.push(DecodedItem {
            label: c_text(record.text()),
            enabled: record.disabled() == 0,
            checked: record.checked() != 0,
            has_callback: record.callback().is_some(),
            icon_path: (!icon.is_null()).then(|| PathBuf::from(c_text(icon))),
            children: decode(record.submenu()),
        });
        cursor = cursor.add(1);
    }
    items
}

/// First non-separator record labelled `label`, depth first.
///
/// # Safety
/// Same requirements as [`decode`].
pub unsafe fn find_record<M: MenuRecord>(root: *mut M, label: &str) -> Option<*mut M> {
    if root.is_null() {
        return None;
    }

    let mut cursor = root;
    while !(*cursor).is_terminator() {
        let text = c_text((*cursor).text());
        if text != SEPARATOR_LABEL && text == label {
            return Some(cursor);
        }
        if let Some(found) = find_record((*cursor).submenu(), label) {
            return Some(found);
        }
        cursor = cursor.add(1);
    }
    None
}

/// Record reached by following sibling indexes down submenus.
///
/// # Safety
/// Same requirements as [`decode`].
pub unsafe fn record_at<M: MenuRecord>(root: *mut M, path: &[usize]) -> Option<*mut M> {
    let (&first, rest) = path.split_first()?;
    let mut cursor = root;
    if cursor.is_null() {
        return None;
    }
    for _ in 0..first {
        if (*cursor).is_terminator() {
            return None;
        }
        cursor = cursor.add(1);
    }
    if (*cursor).is_terminator() {
        return None;
    }
    if rest.is_empty() {
        return Some(cursor);
    }
    record_at((*cursor).submenu(), rest)
}

unsafe fn c_text(ptr: *const c_char) -> String {
    CStr::from_ptr(ptr).to_string_lossy().into_owned()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::records::{CocoaMenuItem, Win32MenuItem};
    use crate::icon::TrayIcon;
    use tempfile::TempDir;

    fn scenario() -> MenuSnapshot {
        MenuSnapshot::new(vec![
            MenuItem::action("A").on_click(|| {}),
            MenuItem::separator(),
            MenuItem::checkable("B", true).on_click(|| {}),
            MenuItem::submenu("C", vec![MenuItem::action("D").on_click(|| {})]),
        ])
    }

    fn scenario_layout_for<M: MenuRecord>() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());

        // Act
        let encoded = MenuEncoder::new(&icons).encode::<M>(&scenario()).unwrap();

        // Assert
        assert_eq!(encoded.record_count(), 7);
        assert_eq!(encoded.callback_count(), 3);
        let decoded = unsafe { decode(encoded.root()) };
        let labels: Vec<&str> = decoded.iter().map(|d| d.label.as_str()).collect();
        assert_eq!(labels, ["A", "-", "B", "C"]);
        assert!(decoded[2].checked);
        assert!(!decoded[1].has_callback);
        assert_eq!(decoded[3].children[0].label, "D");
    }

    #[test]
    fn scenario_layout() {
        scenario_layout_for::<Win32MenuItem>();
        scenario_layout_for::<CocoaMenuItem>();
    }

    #[test]
    fn cocoa_records_are_contiguous_at_their_own_stride() {
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());

        let encoded = MenuEncoder::new(&icons).encode::<CocoaMenuItem>(&scenario()).unwrap();

        let a = unsafe { record_at(encoded.root(), &[0]) }.unwrap() as usize;
        let c = unsafe { record_at(encoded.root(), &[3]) }.unwrap() as usize;
        assert_eq!(c - a, 3 * std::mem::size_of::<CocoaMenuItem>());
        let c_record = unsafe { *(c as *const CocoaMenuItem) };
        assert_eq!(unsafe { record_at(encoded.root(), &[3, 0]) }, Some(c_record.submenu));
    }

    #[test]
    fn callbacks_are_keyed_by_record_address() {
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let encoded = MenuEncoder::new(&icons).encode::<Win32MenuItem>(&scenario()).unwrap();

        let d = unsafe { record_at(encoded.root(), &[3, 0]) }.unwrap();
        let (_, retained) = encoded.into_retained();

        assert!(retained.keys().any(|k| k == TrampolineKey::from_ptr(d)));
    }

    #[test]
    fn empty_menu_is_a_lone_terminator() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());

        // Act
        let encoded = MenuEncoder::new(&icons).encode::<Win32MenuItem>(&MenuSnapshot::empty()).unwrap();

        // Assert
        assert_eq!(encoded.record_count(), 1);
        assert!(unsafe { decode(encoded.root()) }.is_empty());
    }

    #[test]
    fn item_icons_follow_the_layout() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let snapshot = MenuSnapshot::new(vec![
            MenuItem::action("A").with_icon(TrayIcon::from_bytes(b"\x89PNG\r\n\x1a\n".to_vec())),
        ]);

        // Act
        let win32 = MenuEncoder::new(&icons).encode::<Win32MenuItem>(&snapshot).unwrap();
        let cocoa = MenuEncoder::new(&icons).encode::<CocoaMenuItem>(&snapshot).unwrap();

        // Assert
        let path = unsafe { decode(win32.root()) }[0].icon_path.clone().unwrap();
        assert!(path.starts_with(dir.path()));
        assert!(path.exists());
        assert_eq!(unsafe { decode(cocoa.root()) }[0].icon_path, None);
    }

    #[test]
    fn find_record_skips_separators_and_prefers_depth_first() {
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let snapshot = MenuSnapshot::new(vec![
            MenuItem::separator(),
            MenuItem::submenu("More", vec![MenuItem::checkable("X", false)]),
            MenuItem::checkable("X", true),
        ]);
        let encoded = MenuEncoder::new(&icons).encode::<Win32MenuItem>(&snapshot).unwrap();

        let found = unsafe { find_record(encoded.root(), "X") }.unwrap();
        let nested = unsafe { record_at(encoded.root(), &[1, 0]) }.unwrap();

        assert_eq!(found, nested);
        assert!(unsafe { find_record(encoded.root(), "-") }.is_none());
        assert!(unsafe { record_at(encoded.root(), &[9]) }.is_none());
    }

    #[test]
    fn invalid_tree_fails_without_output() {
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let snapshot = MenuSnapshot::new(vec![MenuItem::action("nul\0")]);

        let result = MenuEncoder::new(&icons).encode::<Win32MenuItem>(&snapshot);

        assert!(matches!(result, Err(EncodeError::InteriorNul(_))));
    }
}
