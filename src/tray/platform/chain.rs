//! Driver for `tray.h` libraries: the whole menu is a linked chain of record
//! arrays hanging off one `struct tray`, replaced wholesale on every update.

use crate::bridge::encoder::{find_record, EncodedMenu, MenuEncoder, NativeStr};
use crate::bridge::lifecycle::BackendFamily;
use crate::bridge::records::{MenuRecord, TrayCallback, TrayRecord};
use crate::bridge::retention::{self, Generation, RetainedSet, TrampolineKey};
use crate::bridge::runtime::{CheckedUpdate, DriverSpec, LoopStatus, NativeDriver, Prepared};
use crate::bridge::trampoline::tray_trampoline;
use crate::error::{BridgeError, EncodeError, Result};
use crate::icon::IconStore;
use crate::menu::MenuSnapshot;
use crate::native::tray_api::TrayApi;
use std::ptr::NonNull;
use std::sync::Arc;

type ItemOf<A> = <<A as TrayApi>::Tray as TrayRecord>::Item;
type MenuOf<A> = EncodedMenu<ItemOf<A>>;

pub struct ChainSpec<A: TrayApi> {
    family: BackendFamily,
    api: Arc<A>,
    loop_retries: u32,
}

impl<A: TrayApi> ChainSpec<A> {
    pub fn new(family: BackendFamily, api: Arc<A>) -> Self {
        Self { family, api, loop_retries: 1 }
    }

    /// Consecutive `tray_loop` failures tolerated before the loop is treated as
    /// finished. Each failure below the budget re-submits the current tray.
    pub fn with_loop_retries(mut self, retries: u32) -> Self {
        self.loop_retries = retries.max(1);
        self
    }

    pub fn api(&self) -> &Arc<A> {
        &self.api
    }
}

impl<A: TrayApi> DriverSpec for ChainSpec<A> {
    type Menu = MenuOf<A>;
    type Driver = ChainDriver<A>;

    fn family(&self) -> BackendFamily {
        self.family
    }

    fn prepare_menu(&self, menu: &MenuSnapshot, icons: &IconStore) -> Result<MenuOf<A>, EncodeError> {
        MenuEncoder::new(icons).encode(menu)
    }

    fn connect(&self) -> Result<ChainDriver<A>> {
        Ok(ChainDriver {
            family: self.family,
            api: Arc::clone(&self.api),
            installed: None,
            retired: Vec::new(),
            loop_retries: self.loop_retries,
            loop_errors: 0,
        })
    }
}

/// Heap `struct tray`; its address is the primary-click key.
struct OwnedRecord<R>(NonNull<R>);

impl<R> OwnedRecord<R> {
    fn new(record: R) -> Self {
        Self(NonNull::from(Box::leak(Box::new(record))))
    }

    fn as_ptr(&self) -> *mut R {
        self.0.as_ptr()
    }
}

impl<R> Drop for OwnedRecord<R> {
    fn drop(&mut self) {
        unsafe { drop(Box::from_raw(self.0.as_ptr())) };
    }
}

unsafe impl<R: Send> Send for OwnedRecord<R> {}

struct Installed<R> {
    tray: *mut R,
    generation: Generation,
}

pub struct ChainDriver<A: TrayApi> {
    family: BackendFamily,
    api: Arc<A>,
    installed: Option<Installed<A::Tray>>,
    // Replaced generations a deferring library may still read until the next pump.
    retired: Vec<Generation>,
    loop_retries: u32,
    loop_errors: u32,
}

impl<A: TrayApi> ChainDriver<A> {
    fn assemble(&self, props: Prepared<MenuOf<A>>) -> Result<(*mut A::Tray, RetainedSet)> {
        let (root, mut set) = props.menu.into_retained();
        let icon = NativeStr::from_path(&props.icon_path)?;
        let tooltip = NativeStr::new(&props.tooltip)?;
        let cb = props
            .on_primary_click
            .is_some()
            .then_some(tray_trampoline as TrayCallback);

        let record = OwnedRecord::new(<A::Tray as TrayRecord>::new(icon.as_ptr(), tooltip.as_ptr(), root, cb));
        let tray = record.as_ptr();
        if let Some(click) = props.on_primary_click {
            set.register(TrampolineKey::from_ptr(tray), click);
        }
        set.keep(icon);
        set.keep(tooltip);
        set.keep(record);
        Ok((tray, set))
    }

    fn release_retired(&mut self) {
        for generation in self.retired.drain(..) {
            retention::global().release(generation);
        }
    }
}

impl<A: TrayApi> NativeDriver for ChainDriver<A> {
    type Menu = MenuOf<A>;

    fn init(&mut self, props: Prepared<MenuOf<A>>, generation: Generation) -> Result<()> {
        let (tray, set) = self.assemble(props)?;
        retention::global().retain(generation, set);

        let code = unsafe { self.api.init(tray) };
        if code != 0 {
            retention::global().release(generation);
            return Err(BridgeError::init(self.family, format!("tray_init returned {}", code)));
        }

        self.installed = Some(Installed { tray, generation });
        Ok(())
    }

    fn apply(&mut self, props: Prepared<MenuOf<A>>, generation: Generation) -> Result<()> {
        let (tray, set) = self.assemble(props)?;
        retention::global().retain(generation, set);

        unsafe { self.api.update(tray) };

        if let Some(previous) = self.installed.replace(Installed { tray, generation }) {
            if self.api.defers_updates() {
                self.retired.push(previous.generation);
            } else {
                retention::global().release(previous.generation);
            }
        }
        Ok(())
    }

    fn set_checked(&mut self, label: &str, checked: bool) -> CheckedUpdate {
        let Some(installed) = &self.installed else {
            return CheckedUpdate::NeedsRebuild;
        };
        unsafe {
            let root = (*installed.tray).menu();
            let Some(record) = find_record(root, label) else {
                return CheckedUpdate::NeedsRebuild;
            };
            (*record).set_checked(checked);
            self.api.update(installed.tray);
        }
        CheckedUpdate::Applied
    }

    fn pump(&mut self) -> LoopStatus {
        let code = self.api.pump();
        // Anything queued before this pump has now run.
        self.release_retired();

        if code != -1 {
            self.loop_errors = 0;
            return LoopStatus::Running;
        }

        self.loop_errors += 1;
        let Some(installed) = self.installed.as_ref().filter(|_| self.loop_errors < self.loop_retries) else {
            return LoopStatus::Finished;
        };
        log::warn!(
            "{} tray_loop failed ({}/{}); re-submitting tray",
            self.family,
            self.loop_errors,
            self.loop_retries
        );
        unsafe { self.api.update(installed.tray) };
        LoopStatus::Running
    }

    fn shutdown(&mut self) {
        if self.installed.take().is_some() {
            self.api.exit();
            if self.api.defers_updates() {
                self.api.pump();
            }
        }
        self.release_retired();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bridge::records::{CocoaTray, Win32Tray};
    use crate::bridge::retention::InstanceId;
    use crate::menu::MenuItem;
    use crate::native::simulated::SimulatedTrayApi;
    use std::path::PathBuf;
    use tempfile::TempDir;

    fn prepared<R: TrayRecord>(
        spec: &ChainSpec<SimulatedTrayApi<R>>,
        icons: &IconStore,
        items: Vec<MenuItem>,
    ) -> Prepared<EncodedMenu<R::Item>> {
        Prepared {
            icon_path: PathBuf::from("/tmp/icon.png"),
            tooltip: "tip".to_string(),
            on_primary_click: None,
            menu: spec.prepare_menu(&MenuSnapshot::new(items), icons).unwrap(),
        }
    }

    #[test]
    fn apply_releases_previous_generation_after_swap() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let api = SimulatedTrayApi::<Win32Tray>::new();
        let spec = ChainSpec::new(BackendFamily::Simulated, api.clone());
        let mut driver = spec.connect().unwrap();
        let instance = InstanceId::next();
        driver.init(prepared(&spec, &icons, vec![MenuItem::action("A").on_click(|| {})]), Generation { instance, seq: 0 }).unwrap();

        // Act
        driver.apply(prepared(&spec, &icons, vec![MenuItem::action("B").on_click(|| {})]), Generation { instance, seq: 1 }).unwrap();

        // Assert
        assert_eq!(retention::global().generations(instance), vec![Generation { instance, seq: 1 }]);
        assert_eq!(api.menu()[0].label, "B");
        assert_eq!(api.tooltip().as_deref(), Some("tip"));

        driver.shutdown();
        retention::global().release_instance(instance);
        assert_eq!(api.exit_count(), 1);
    }

    #[test]
    fn deferred_swap_keeps_previous_generation_until_pumped() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let api = SimulatedTrayApi::<CocoaTray>::deferred();
        let spec = ChainSpec::new(BackendFamily::Simulated, api.clone());
        let mut driver = spec.connect().unwrap();
        let instance = InstanceId::next();
        let first = Generation { instance, seq: 0 };
        let second = Generation { instance, seq: 1 };
        driver.init(prepared(&spec, &icons, vec![MenuItem::action("A").on_click(|| {})]), first).unwrap();

        // Act
        driver.apply(prepared(&spec, &icons, vec![MenuItem::action("B").on_click(|| {})]), second).unwrap();
        let before_pump = retention::global().generations(instance);
        let shown_before_pump = api.menu()[0].label.clone();
        assert_eq!(driver.pump(), LoopStatus::Running);

        // Assert
        assert_eq!(before_pump.len(), 2);
        assert_eq!(shown_before_pump, "A");
        assert_eq!(retention::global().generations(instance), vec![second]);
        assert_eq!(api.menu()[0].label, "B");
        assert_eq!(api.stale_swaps(), 0);

        driver.shutdown();
        assert!(!api.is_visible());
        retention::global().release_instance(instance);
    }

    #[test]
    fn deferred_exit_is_fenced_before_release() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let api = SimulatedTrayApi::<CocoaTray>::deferred();
        let spec = ChainSpec::new(BackendFamily::Simulated, api.clone());
        let mut driver = spec.connect().unwrap();
        let instance = InstanceId::next();
        driver.init(prepared(&spec, &icons, vec![MenuItem::action("A").on_click(|| {})]), Generation { instance, seq: 0 }).unwrap();
        driver.apply(prepared(&spec, &icons, vec![MenuItem::action("B").on_click(|| {})]), Generation { instance, seq: 1 }).unwrap();

        // Act
        driver.shutdown();

        // Assert
        assert_eq!(api.exit_count(), 1);
        assert!(!api.is_visible());
        assert_eq!(api.stale_swaps(), 0);
        assert_eq!(retention::global().generations(instance), vec![Generation { instance, seq: 1 }]);
        retention::global().release_instance(instance);
    }

    #[test]
    fn loop_errors_within_budget_resubmit_the_tray() {
        let cases = [(1, 1, LoopStatus::Finished, 0), (5, 4, LoopStatus::Running, 4), (5, 5, LoopStatus::Finished, 4)];

        for (retries, failures, expected, resubmits) in cases {
            // Arrange
            let dir = TempDir::new().unwrap();
            let icons = IconStore::new(dir.path());
            let api = SimulatedTrayApi::<Win32Tray>::new();
            let spec = ChainSpec::new(BackendFamily::Simulated, api.clone()).with_loop_retries(retries);
            let mut driver = spec.connect().unwrap();
            let instance = InstanceId::next();
            driver.init(prepared(&spec, &icons, vec![MenuItem::action("A")]), Generation { instance, seq: 0 }).unwrap();
            api.fail_next_pumps(failures);

            // Act
            let statuses: Vec<LoopStatus> = (0..failures).map(|_| driver.pump()).collect();

            // Assert
            assert_eq!(statuses.last(), Some(&expected), "retries {} failures {}", retries, failures);
            assert_eq!(api.update_count(), resubmits);
            if expected == LoopStatus::Running {
                assert_eq!(driver.pump(), LoopStatus::Running);
            }
            driver.shutdown();
            retention::global().release_instance(instance);
        }
    }

    #[test]
    fn set_checked_writes_record_in_place() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let api = SimulatedTrayApi::<CocoaTray>::new();
        let spec = ChainSpec::new(BackendFamily::Simulated, api.clone());
        let mut driver = spec.connect().unwrap();
        let instance = InstanceId::next();
        driver.init(prepared(&spec, &icons, vec![MenuItem::checkable("B", false)]), Generation { instance, seq: 0 }).unwrap();

        let cases = [("B", CheckedUpdate::Applied), ("missing", CheckedUpdate::NeedsRebuild)];
        for (label, expected) in cases {
            // Act
            let result = driver.set_checked(label, true);

            // Assert
            assert_eq!(result, expected);
        }

        assert!(api.menu()[0].checked);
        driver.shutdown();
        retention::global().release_instance(instance);
    }

    #[test]
    fn failed_init_releases_its_generation() {
        // Arrange
        let dir = TempDir::new().unwrap();
        let icons = IconStore::new(dir.path());
        let api = SimulatedTrayApi::<Win32Tray>::failing(-1);
        let spec = ChainSpec::new(BackendFamily::Simulated, api.clone());
        let mut driver = spec.connect().unwrap();
        let instance = InstanceId::next();

        // Act
        let result = driver.init(prepared(&spec, &icons, vec![MenuItem::action("A").on_click(|| {})]), Generation { instance, seq: 0 });

        // Assert
        assert!(matches!(result, Err(BridgeError::Init { .. })));
        assert!(retention::global().generations(instance).is_empty());
        driver.shutdown();
        assert_eq!(api.exit_count(), 0);
    }
}
