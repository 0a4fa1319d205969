use crate::error::EncodeError;
use crate::icon::TrayIcon;
use std::fmt;
use std::sync::Arc;

pub const SEPARATOR_LABEL: &str = "-";
pub const MAX_DEPTH: usize = 16;

pub type ClickCallback = Arc<dyn Fn() + Send + Sync>;

/// One row of a tray menu. A label of `"-"` renders as a separator.
#[derive(Clone)]
pub struct MenuItem {
    pub label: String,
    pub enabled: bool,
    pub checkable: bool,
    pub checked: bool,
    pub icon: Option<TrayIcon>,
    pub on_click: Option<ClickCallback>,
    pub children: Vec<MenuItem>,
}

impl MenuItem {
    pub fn action(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            enabled: true,
            checkable: false,
            checked: false,
            icon: None,
            on_click: None,
            children: Vec::new(),
        }
    }

    pub fn separator() -> Self {
        Self::action(SEPARATOR_LABEL)
    }

    pub fn checkable(label: impl Into<String>, checked: bool) -> Self {
        Self { checkable: true, checked, ..Self::action(label) }
    }

    pub fn submenu(label: impl Into<String>, children: Vec<MenuItem>) -> Self {
        Self { children, ..Self::action(label) }
    }

    pub fn on_click(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_click = Some(Arc::new(f));
        self
    }

    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn with_icon(mut self, icon: TrayIcon) -> Self {
        self.icon = Some(icon);
        self
    }

    pub fn is_separator(&self) -> bool {
        self.label == SEPARATOR_LABEL
    }

    pub fn is_submenu(&self) -> bool {
        !self.children.is_empty()
    }
}

impl fmt::Debug for MenuItem {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MenuItem")
            .field("label", &self.label)
            .field("enabled", &self.enabled)
            .field("checkable", &self.checkable)
            .field("checked", &self.checked)
            .field("icon", &self.icon)
            .field("on_click", &self.on_click.is_some())
            .field("children", &self.children)
            .finish()
    }
}

/// Immutable menu tree handed to the bridge on every update.
#[derive(Clone, Debug, Default)]
pub struct MenuSnapshot {
    items: Vec<MenuItem>,
}

impl MenuSnapshot {
    pub fn new(items: Vec<MenuItem>) -> Self {
        Self { items }
    }

    pub fn empty() -> Self {
        Self::default()
    }

    pub fn items(&self) -> &[MenuItem] {
        &self.items
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    /// Number of items in the whole tree, separators included.
    pub fn len(&self) -> usize {
        fn count(items: &[MenuItem]) -> usize {
            items.iter().map(|i| 1 + count(&i.children)).sum()
        }
        count(&self.items)
    }

    pub fn validate(&self) -> Result<(), EncodeError> {
        let mut path = Vec::new();
        validate_level(&self.items, &mut path)
    }

    /// First non-separator item with this label, depth first.
    pub fn find(&self, label: &str) -> Option<&MenuItem> {
        fn walk<'a>(items: &'a [MenuItem], label: &str) -> Option<&'a MenuItem> {
            for item in items {
                if !item.is_separator() && item.label == label {
                    return Some(item);
                }
                if let Some(found) = walk(&item.children, label) {
                    return Some(found);
                }
            }
            None
        }
        walk(&self.items, label)
    }

    /// Copy of the tree with the first item labelled `label` checked or unchecked.
    pub fn with_checked(&self, label: &str, checked: bool) -> Option<MenuSnapshot> {
        fn walk(items: &mut [MenuItem], label: &str, checked: bool) -> bool {
            for item in items {
                if !item.is_separator() && item.label == label {
                    item.checked = checked;
                    return true;
                }
                if walk(&mut item.children, label, checked) {
                    return true;
                }
            }
            false
        }

        let mut next = self.clone();
        walk(&mut next.items, label, checked).then_some(next)
    }
}

impl From<Vec<MenuItem>> for MenuSnapshot {
    fn from(items: Vec<MenuItem>) -> Self {
        Self::new(items)
    }
}

fn validate_level(items: &[MenuItem], path: &mut Vec<usize>) -> Result<(), EncodeError> {
    if !items.is_empty() && path.len() >= MAX_DEPTH {
        return Err(EncodeError::TooDeep { max: MAX_DEPTH });
    }

    for (idx, item) in items.iter().enumerate() {
        path.push(idx);
        if item.label.contains('\0') {
            return Err(EncodeError::InteriorNul(item.label.clone()));
        }
        if item.is_submenu() && item.is_separator() {
            return Err(EncodeError::SeparatorWithChildren { path: path.clone() });
        }
        if item.is_submenu() && item.checkable {
            return Err(EncodeError::CheckableWithChildren { label: item.label.clone() });
        }
        validate_level(&item.children, path)?;
        path.pop();
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nested(depth: usize) -> MenuItem {
        (0..depth).fold(MenuItem::action("leaf"), |child, i| MenuItem::submenu(format!("level {}", i), vec![child]))
    }

    #[test]
    fn validate_rejects_malformed_trees() {
        let cases = vec![
            (vec![MenuItem::action("bad\0label")], "interior nul"),
            (vec![MenuItem::submenu("-", vec![MenuItem::action("x")])], "separator with children"),
            (vec![MenuItem { children: vec![MenuItem::action("x")], ..MenuItem::checkable("c", true) }], "checkable with children"),
            (vec![nested(MAX_DEPTH)], "too deep"),
        ];

        for (items, name) in cases {
            assert!(MenuSnapshot::new(items).validate().is_err(), "case: {}", name);
        }
    }

    #[test]
    fn validate_accepts_well_formed_trees() {
        let cases = vec![
            vec![],
            vec![MenuItem::action("A"), MenuItem::separator(), MenuItem::checkable("B", false)],
            vec![nested(MAX_DEPTH - 1)],
        ];

        for items in cases {
            assert!(MenuSnapshot::new(items).validate().is_ok());
        }
    }

    #[test]
    fn find_returns_first_depth_first_match() {
        let snapshot = MenuSnapshot::new(vec![
            MenuItem::submenu("More", vec![MenuItem::action("Dup").enabled(false)]),
            MenuItem::action("Dup"),
        ]);

        let found = snapshot.find("Dup").unwrap();

        assert!(!found.enabled);
    }

    #[test]
    fn find_skips_separators() {
        let snapshot = MenuSnapshot::new(vec![MenuItem::separator()]);
        assert!(snapshot.find("-").is_none());
    }

    #[test]
    fn with_checked_touches_only_the_first_match() {
        let snapshot = MenuSnapshot::new(vec![
            MenuItem::checkable("B", false),
            MenuItem::submenu("C", vec![MenuItem::checkable("B", false)]),
        ]);

        let next = snapshot.with_checked("B", true).unwrap();

        assert!(next.items()[0].checked);
        assert!(!next.items()[1].children[0].checked);
        assert!(!snapshot.items()[0].checked);
    }

    #[test]
    fn with_checked_unknown_label_is_none() {
        let snapshot = MenuSnapshot::new(vec![MenuItem::action("A")]);
        assert!(snapshot.with_checked("missing", true).is_none());
    }

    #[test]
    fn len_counts_whole_tree() {
        let snapshot = MenuSnapshot::new(vec![
            MenuItem::action("A"),
            MenuItem::separator(),
            MenuItem::submenu("C", vec![MenuItem::action("D")]),
        ]);
        assert_eq!(snapshot.len(), 4);
    }
}
