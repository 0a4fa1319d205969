//! StatusNotifierItem driver. The wrapper library builds menus through handle
//! calls, so a snapshot is flattened into a plan on the caller thread and
//! replayed against the library on the loop thread.

use crate::bridge::encoder::NativeStr;
use crate::bridge::lifecycle::BackendFamily;
use crate::bridge::retention::{self, CallbackSlot, Generation, RetainedSet};
use crate::bridge::runtime::{CheckedUpdate, DriverSpec, LoopStatus, NativeDriver, Prepared};
use crate::bridge::trampoline::{action_trampoline, activate_trampoline};
use crate::error::{BridgeError, EncodeError, Result};
use crate::icon::IconStore;
use crate::menu::{ClickCallback, MenuItem, MenuSnapshot};
use crate::native::sni_api::{ActivateCallback, Handle, SniApi};
use std::collections::HashMap;
use std::ptr;
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum NodeKind {
    Action,
    Checkable,
    Separator,
    Submenu,
}

struct PlanNode {
    parent: Option<usize>,
    kind: NodeKind,
    label: NativeStr,
    key_label: String,
    enabled: bool,
    checked: bool,
    icon: Option<NativeStr>,
    on_click: Option<ClickCallback>,
}

/// Depth-first list of build calls; a node's parent always precedes it.
pub struct SniPlan {
    nodes: Vec<PlanNode>,
}

impl SniPlan {
    pub fn build(snapshot: &MenuSnapshot, icons: &IconStore) -> Result<Self, EncodeError> {
        snapshot.validate()?;
        let mut plan = Self { nodes: Vec::with_capacity(snapshot.len().max(1)) };
        if snapshot.is_empty() {
            // KDE drops the icon entirely when the context menu has no rows.
            plan.nodes.push(PlanNode {
                parent: None,
                kind: NodeKind::Separator,
                label: NativeStr::new(crate::menu::SEPARATOR_LABEL)?,
                key_label: String::new(),
                enabled: false,
                checked: false,
                icon: None,
                on_click: None,
            });
            return Ok(plan);
        }
        plan.push_level(snapshot.items(), None, icons)?;
        Ok(plan)
    }

    fn push_level(&mut self, items: &[MenuItem], parent: Option<usize>, icons: &IconStore) -> Result<(), EncodeError> {
        for item in items {
            let kind = if item.is_separator() {
                NodeKind::Separator
            } else if item.is_submenu() {
                NodeKind::Submenu
            } else if item.checkable {
                NodeKind::Checkable
            } else {
                NodeKind::Action
            };
            let icon = match &item.icon {
                Some(icon) => Some(NativeStr::from_path(&icons.resolve(icon)?)?),
                None => None,
            };

            self.nodes.push(PlanNode {
                parent,
                kind,
                label: NativeStr::new(&item.label)?,
                key_label: item.label.clone(),
                enabled: item.enabled,
                checked: item.checked,
                icon,
                on_click: item.on_click.clone(),
            });
            if kind == NodeKind::Submenu {
                let idx = self.nodes.len() - 1;
                self.push_level(&item.children, Some(idx), icons)?;
            }
        }
        Ok(())
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }
}

pub struct SniSpec<A: SniApi> {
    api: Arc<A>,
    id: String,
}

impl<A: SniApi> SniSpec<A> {
    pub fn new(api: Arc<A>) -> Self {
        Self { api, id: format!("traybridge-{}", std::process::id()) }
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }
}

impl<A: SniApi> DriverSpec for SniSpec<A> {
    type Menu = SniPlan;
    type Driver = SniDriver<A>;

    fn family(&self) -> BackendFamily {
        BackendFamily::LinuxSni
    }

    fn prepare_menu(&self, menu: &MenuSnapshot, icons: &IconStore) -> Result<SniPlan, EncodeError> {
        SniPlan::build(menu, icons)
    }

    fn connect(&self) -> Result<SniDriver<A>> {
        Ok(SniDriver {
            api: Arc::clone(&self.api),
            id: self.id.clone(),
            tray: ptr::null_mut(),
            installed: None,
        })
    }
}

struct Installed {
    menu: Handle,
    generation: Generation,
    checkables: HashMap<String, Handle>,
}

pub struct SniDriver<A: SniApi> {
    api: Arc<A>,
    id: String,
    tray: Handle,
    installed: Option<Installed>,
}

impl<A: SniApi> SniDriver<A> {
    /// Replays `plan` into a fresh native menu. Nothing is attached to the tray yet.
    fn build_menu(&self, plan: SniPlan, set: &mut RetainedSet) -> (Handle, HashMap<String, Handle>) {
        let noop: ClickCallback = Arc::new(|| {});
        let root = self.api.create_menu();
        let mut handles: Vec<Handle> = Vec::with_capacity(plan.nodes.len());
        let mut checkables = HashMap::new();

        for node in plan.nodes {
            let menu = node.parent.map_or(root, |p| handles[p]);
            let handle = unsafe {
                match node.kind {
                    NodeKind::Separator => {
                        self.api.add_separator(menu);
                        ptr::null_mut()
                    }
                    NodeKind::Submenu => self.api.create_submenu(menu, node.label.as_ptr()),
                    NodeKind::Action | NodeKind::Checkable => {
                        let slot = CallbackSlot::new();
                        let data = slot.as_ptr();
                        set.register(slot.key(), node.on_click.clone().unwrap_or_else(|| noop.clone()));
                        set.keep(slot);

                        let item = if node.kind == NodeKind::Checkable {
                            let item = self.api.add_checkable(menu, node.label.as_ptr(), node.checked, action_trampoline, data);
                            if !item.is_null() && !node.enabled {
                                self.api.set_item_enabled(item, false);
                            }
                            if !item.is_null() {
                                checkables.entry(node.key_label.clone()).or_insert(item);
                            }
                            item
                        } else {
                            self.api.add_action(menu, node.label.as_ptr(), node.enabled, action_trampoline, data)
                        };
                        if let (Some(icon), false) = (&node.icon, item.is_null()) {
                            if !self.api.set_item_icon(item, icon.as_ptr()) {
                                log::debug!("SNI library has no per-item icons");
                            }
                        }
                        item
                    }
                }
            };
            handles.push(handle);
            set.keep(node.label);
            if let Some(icon) = node.icon {
                set.keep(icon);
            }
        }
        (root, checkables)
    }

    fn install(&mut self, props: Prepared<SniPlan>, generation: Generation, initial: bool) -> Result<()> {
        let icon = NativeStr::from_path(&props.icon_path)?;
        let tooltip = NativeStr::new(&props.tooltip)?;
        let mut set = RetainedSet::new();
        let (menu, checkables) = self.build_menu(props.menu, &mut set);

        let activate = CallbackSlot::new();
        let activate_data = activate.as_ptr();
        let activate_cb = props.on_primary_click.is_some().then_some(activate_trampoline as ActivateCallback);
        if let Some(click) = props.on_primary_click {
            set.register(activate.key(), click);
        }
        set.keep(activate);
        retention::global().retain(generation, set);

        unsafe {
            self.api.set_icon(self.tray, icon.as_ptr(), initial);
            self.api.set_tooltip(self.tray, tooltip.as_ptr());
            self.api.set_context_menu(self.tray, menu);
            self.api.set_activate_callback(self.tray, activate_cb, activate_data);
        }

        let previous = self.installed.replace(Installed { menu, generation, checkables });
        if let Some(previous) = previous {
            unsafe { self.api.destroy_menu(previous.menu) };
            retention::global().release(previous.generation);
        }
        Ok(())
    }
}

impl<A: SniApi> NativeDriver for SniDriver<A> {
    type Menu = SniPlan;

    fn init(&mut self, props: Prepared<SniPlan>, generation: Generation) -> Result<()> {
        let code = self.api.init_system();
        if code != 0 {
            return Err(BridgeError::init(BackendFamily::LinuxSni, format!("init_tray_system returned {}", code)));
        }

        let id = NativeStr::new(&self.id)?;
        self.tray = unsafe { self.api.create_tray(id.as_ptr()) };
        if self.tray.is_null() {
            self.api.shutdown_system();
            return Err(BridgeError::init(BackendFamily::LinuxSni, "create_tray returned null"));
        }

        let title = NativeStr::new(&props.tooltip)?;
        let status = NativeStr::new("Active")?;
        unsafe {
            self.api.set_title(self.tray, title.as_ptr());
            self.api.set_status(self.tray, status.as_ptr());
        }
        if let Err(e) = self.install(props, generation, true) {
            self.shutdown();
            return Err(e);
        }
        Ok(())
    }

    fn apply(&mut self, props: Prepared<SniPlan>, generation: Generation) -> Result<()> {
        self.install(props, generation, false)
    }

    fn set_checked(&mut self, label: &str, checked: bool) -> CheckedUpdate {
        let Some(item) = self.installed.as_ref().and_then(|i| i.checkables.get(label).copied()) else {
            return CheckedUpdate::NeedsRebuild;
        };
        match unsafe { self.api.set_item_checked(self.tray, item, checked) } {
            Some(0) => CheckedUpdate::Applied,
            _ => CheckedUpdate::NeedsRebuild,
        }
    }

    fn pump(&mut self) -> LoopStatus {
        self.api.process_events();
        LoopStatus::Running
    }

    fn shutdown(&mut self) {
        if self.tray.is_null() {
            return;
        }
        unsafe {
            self.api.set_activate_callback(self.tray, None, ptr::null_mut());
            if let Some(installed) = self.installed.take() {
                self.api.destroy_menu(installed.menu);
            }
            self.api.destroy_tray(self.tray);
        }
        self.tray = ptr::null_mut();
        self.api.shutdown_system();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::retention::InstanceId;
    use crate::native::sni_api::{ActionCallback, ActivateCallback};
    use std::ffi::{c_char, c_int, c_void, CStr};
    use std::path::PathBuf;
    use std::sync::Mutex;
    use tempfile::TempDir;

    #[derive(Debug, Clone, PartialEq)]
    enum Call {
        CreateMenu(usize),
        DestroyMenu(usize),
        SetContextMenu(usize),
        Action(usize, String, bool),
        Checkable(usize, String, bool),
        Separator(usize),
        Submenu(usize, String),
        Checked(usize, bool),
    }

    struct FakeSni {
        next: Mutex<usize>,
        calls: Mutex<Vec<Call>>,
        supports_checked: bool,
    }

    impl FakeSni {
        fn new(supports_checked: bool) -> Arc<Self> {
            Arc::new(Self { next: Mutex::new(1), calls: Mutex::new(Vec::new()), supports_checked })
        }

        fn handle(&self) -> Handle {
            let mut next = self.next.lock().unwrap();
            *next += 1;
            *next as Handle
        }

        fn record(&self, call: Call) {
            self.calls.lock().unwrap().push(call);
        }

        fn calls(&self) -> Vec<Call> {
            self.calls.lock().unwrap().clone()
        }
    }

    fn text(ptr: *const c_char) -> String {
        unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
    }

    impl SniApi for FakeSni {
        fn init_system(&self) -> c_int {
            0
        }
        fn shutdown_system(&self) {}
        fn process_events(&self) {}
        unsafe fn create_tray(&self, _id: *const c_char) -> Handle {
            self.handle()
        }
        unsafe fn destroy_tray(&self, _tray: Handle) {}
        unsafe fn set_title(&self, _tray: Handle, _title: *const c_char) {}
        unsafe fn set_status(&self, _tray: Handle, _status: *const c_char) {}
        unsafe fn set_icon(&self, _tray: Handle, _path: *const c_char, _initial: bool) {}
        unsafe fn set_tooltip(&self, _tray: Handle, _title: *const c_char) {}
        unsafe fn set_activate_callback(&self, _tray: Handle, _cb: Option<ActivateCallback>, _data: *mut c_void) {}
        fn create_menu(&self) -> Handle {
            let menu = self.handle();
            self.record(Call::CreateMenu(menu as usize));
            menu
        }
        unsafe fn destroy_menu(&self, menu: Handle) {
            self.record(Call::DestroyMenu(menu as usize));
        }
        unsafe fn set_context_menu(&self, _tray: Handle, menu: Handle) {
            self.record(Call::SetContextMenu(menu as usize));
        }
        unsafe fn add_action(&self, menu: Handle, label: *const c_char, enabled: bool, _cb: ActionCallback, _data: *mut c_void) -> Handle {
            self.record(Call::Action(menu as usize, text(label), enabled));
            self.handle()
        }
        unsafe fn add_checkable(&self, menu: Handle, label: *const c_char, checked: bool, _cb: ActionCallback, _data: *mut c_void) -> Handle {
            self.record(Call::Checkable(menu as usize, text(label), checked));
            self.handle()
        }
        unsafe fn add_separator(&self, menu: Handle) {
            self.record(Call::Separator(menu as usize));
        }
        unsafe fn create_submenu(&self, menu: Handle, label: *const c_char) -> Handle {
            self.record(Call::Submenu(menu as usize, text(label)));
            self.handle()
        }
        unsafe fn set_item_enabled(&self, _item: Handle, _enabled: bool) {}
        unsafe fn set_item_icon(&self, _item: Handle, _path: *const c_char) -> bool {
            false
        }
        unsafe fn set_item_checked(&self, _tray: Handle, item: Handle, checked: bool) -> Option<c_int> {
            if !self.supports_checked {
                return None;
            }
            self.record(Call::Checked(item as usize, checked));
            Some(0)
        }
    }

    fn props(spec: &SniSpec<FakeSni>, icons: &IconStore, items: Vec<MenuItem>) -> Prepared<SniPlan> {
        Prepared {
            icon_path: PathBuf::from("/tmp/icon.png"),
            tooltip: "tip".to_string(),
            on_primary_click: None,
            menu: spec.prepare_menu(&MenuSnapshot::new(items), icons).unwrap(),
        }
    }

    #[test]
    fn plan_flattens_depth_first() {
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let snapshot = MenuSnapshot::new(vec![
            MenuItem::action("A"),
            MenuItem::submenu("C", vec![MenuItem::action("D")]),
            MenuItem::separator(),
        ]);

        let plan = SniPlan::build(&snapshot, &icons).unwrap();

        let parents: Vec<Option<usize>> = plan.nodes.iter().map(|n| n.parent).collect();
        let kinds: Vec<NodeKind> = plan.nodes.iter().map(|n| n.kind).collect();
        assert_eq!(parents, vec![None, None, Some(1), None]);
        assert_eq!(kinds, vec![NodeKind::Action, NodeKind::Submenu, NodeKind::Action, NodeKind::Separator]);
    }

    #[test]
    fn empty_menu_gets_placeholder_row() {
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());

        let plan = SniPlan::build(&MenuSnapshot::empty(), &icons).unwrap();

        assert_eq!(plan.len(), 1);
        assert_eq!(plan.nodes[0].kind, NodeKind::Separator);
    }

    #[test]
    fn build_replays_plan_into_nested_menus() {
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let api = FakeSni::new(true);
        let spec = SniSpec::new(api.clone());
        let mut driver = spec.connect().unwrap();
        let instance = InstanceId::next();

        driver.init(props(&spec, &icons, vec![
            MenuItem::action("A").enabled(false),
            MenuItem::submenu("C", vec![MenuItem::checkable("D", true)]),
        ]), Generation { instance, seq: 0 }).unwrap();

        let calls = api.calls();
        let Call::CreateMenu(root) = calls[0] else { panic!("expected create_menu first: {:?}", calls) };
        assert_eq!(calls[1], Call::Action(root, "A".into(), false));
        assert_eq!(calls[2], Call::Submenu(root, "C".into()));
        assert!(matches!(&calls[3], Call::Checkable(sub, label, true) if *sub != root && label == "D"));
        assert_eq!(calls[4], Call::SetContextMenu(root));

        driver.shutdown();
        retention::global().release_instance(instance);
    }

    #[test]
    fn swap_attaches_new_menu_before_destroying_old() {
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let api = FakeSni::new(false);
        let spec = SniSpec::new(api.clone());
        let mut driver = spec.connect().unwrap();
        let instance = InstanceId::next();
        driver.init(props(&spec, &icons, vec![MenuItem::action("A")]), Generation { instance, seq: 0 }).unwrap();

        driver.apply(props(&spec, &icons, vec![MenuItem::action("B")]), Generation { instance, seq: 1 }).unwrap();

        let calls = api.calls();
        let menus: Vec<usize> = calls.iter().filter_map(|c| match c { Call::CreateMenu(m) => Some(*m), _ => None }).collect();
        let attach_new = calls.iter().position(|c| *c == Call::SetContextMenu(menus[1])).unwrap();
        let destroy_old = calls.iter().position(|c| *c == Call::DestroyMenu(menus[0])).unwrap();
        assert!(attach_new < destroy_old);
        assert_eq!(retention::global().generations(instance), vec![Generation { instance, seq: 1 }]);

        driver.shutdown();
        retention::global().release_instance(instance);
    }

    #[test]
    fn set_checked_uses_item_handle_when_supported() {
        let cases = [(true, CheckedUpdate::Applied), (false, CheckedUpdate::NeedsRebuild)];

        for (supported, expected) in cases {
            let dir = TempDir::new().unwrap();
            let icons = IconStore::new(dir.path());
            let api = FakeSni::new(supported);
            let spec = SniSpec::new(api.clone());
            let mut driver = spec.connect().unwrap();
            let instance = InstanceId::next();
            driver.init(props(&spec, &icons, vec![MenuItem::checkable("B", false)]), Generation { instance, seq: 0 }).unwrap();

            assert_eq!(driver.set_checked("B", true), expected);
            assert_eq!(driver.set_checked("missing", true), CheckedUpdate::NeedsRebuild);

            driver.shutdown();
            retention::global().release_instance(instance);
        }
    }
}
