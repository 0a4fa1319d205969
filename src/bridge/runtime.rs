use super::lifecycle::{self, BackendFamily, LifecyclePermit, PermitGuard};
use super::retention::{self, Generation, InstanceId};
use super::state::RuntimeState;
use crate::config::{BridgeConfig, Timeouts};
use crate::error::{BridgeError, EncodeError, Result};
use crate::icon::{IconStore, TrayIcon};
use crate::menu::{ClickCallback, MenuSnapshot};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, Sender, SyncSender};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, JoinHandle, ThreadId};
use std::time::{Duration, Instant};

/// Icon, tooltip and primary-click handler of a running tray.
#[derive(Clone)]
pub struct TrayOptions {
    pub icon: TrayIcon,
    pub tooltip: String,
    pub on_primary_click: Option<ClickCallback>,
}

impl TrayOptions {
    pub fn new(icon: TrayIcon) -> Self {
        Self { icon, tooltip: String::new(), on_primary_click: None }
    }

    pub fn with_tooltip(mut self, tooltip: impl Into<String>) -> Self {
        self.tooltip = tooltip.into();
        self
    }

    pub fn on_primary_click(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_primary_click = Some(Arc::new(f));
        self
    }
}

impl fmt::Debug for TrayOptions {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TrayOptions")
            .field("icon", &self.icon)
            .field("tooltip", &self.tooltip)
            .field("on_primary_click", &self.on_primary_click.is_some())
            .finish()
    }
}

/// Partial change; unset fields keep their current value.
#[derive(Clone, Default)]
pub struct TrayUpdate {
    pub icon: Option<TrayIcon>,
    pub tooltip: Option<String>,
    pub menu: Option<MenuSnapshot>,
    pub on_primary_click: Option<ClickCallback>,
}

impl TrayUpdate {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_icon(mut self, icon: TrayIcon) -> Self {
        self.icon = Some(icon);
        self
    }

    pub fn with_tooltip(mut self, tooltip: impl Into<String>) -> Self {
        self.tooltip = Some(tooltip.into());
        self
    }

    pub fn with_menu(mut self, menu: impl Into<MenuSnapshot>) -> Self {
        self.menu = Some(menu.into());
        self
    }

    pub fn on_primary_click(mut self, f: impl Fn() + Send + Sync + 'static) -> Self {
        self.on_primary_click = Some(Arc::new(f));
        self
    }

    fn merge(&self, base: Option<&TrayOptions>) -> Option<TrayOptions> {
        let icon = self.icon.clone().or_else(|| base.map(|b| b.icon.clone()))?;
        Some(TrayOptions {
            icon,
            tooltip: self
                .tooltip
                .clone()
                .or_else(|| base.map(|b| b.tooltip.clone()))
                .unwrap_or_default(),
            on_primary_click: self
                .on_primary_click
                .clone()
                .or_else(|| base.and_then(|b| b.on_primary_click.clone())),
        })
    }
}

/// Everything a driver needs to install one generation, already encoded on the caller thread.
pub struct Prepared<M> {
    pub icon_path: PathBuf,
    pub tooltip: String,
    pub on_primary_click: Option<ClickCallback>,
    pub menu: M,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CheckedUpdate {
    Applied,
    NeedsRebuild,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoopStatus {
    Running,
    Finished,
}

/// Backend-specific half of a runtime: how to encode menus and how to reach the native side.
pub trait DriverSpec: Send + Sync + 'static {
    type Menu: Send + 'static;
    type Driver: NativeDriver<Menu = Self::Menu>;

    fn family(&self) -> BackendFamily;

    /// Runs on the caller thread.
    fn prepare_menu(&self, menu: &MenuSnapshot, icons: &IconStore) -> Result<Self::Menu, EncodeError>;

    /// Runs on the loop thread before `init`.
    fn connect(&self) -> Result<Self::Driver>;
}

/// Native tray owned by a loop thread. Every method runs on that thread.
pub trait NativeDriver {
    type Menu;

    fn init(&mut self, props: Prepared<Self::Menu>, generation: Generation) -> Result<()>;

    /// Installs a new generation. The driver retains it before the native swap and
    /// releases the previous one after.
    fn apply(&mut self, props: Prepared<Self::Menu>, generation: Generation) -> Result<()>;

    fn set_checked(&mut self, label: &str, checked: bool) -> CheckedUpdate;

    /// Processes pending native events without blocking.
    fn pump(&mut self) -> LoopStatus;

    fn shutdown(&mut self);
}

enum Command<M> {
    Apply(Prepared<M>),
    SetChecked { label: String, checked: bool },
    Barrier(SyncSender<()>),
    Quit,
}

#[derive(Debug)]
struct LaunchCtl {
    id: InstanceId,
    abandoned: AtomicBool,
    caller_teardown: AtomicBool,
}

struct Inner<M> {
    state: RuntimeState,
    options: Option<TrayOptions>,
    menu: MenuSnapshot,
    commands: Option<Sender<Command<M>>>,
    loop_thread: Option<JoinHandle<()>>,
    loop_thread_id: Option<ThreadId>,
    exited: Option<Receiver<()>>,
    ctl: Option<Arc<LaunchCtl>>,
}

struct Shared<S: DriverSpec> {
    spec: S,
    timeouts: Timeouts,
    icons: IconStore,
    permit: Arc<LifecyclePermit>,
    // Held from encode to enqueue so queue order matches encode order.
    submit: Mutex<()>,
    inner: Mutex<Inner<S::Menu>>,
}

/// One tray icon driven by a dedicated loop thread.
pub struct TrayRuntime<S: DriverSpec> {
    shared: Arc<Shared<S>>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl<S: DriverSpec> TrayRuntime<S> {
    pub fn new(spec: S, config: &BridgeConfig) -> Self {
        let permit = lifecycle::permit_for(spec.family());
        Self::with_permit(spec, config, permit)
    }

    /// Runtime gated by a caller-provided permit instead of the process-wide one.
    pub fn with_permit(spec: S, config: &BridgeConfig, permit: Arc<LifecyclePermit>) -> Self {
        Self {
            shared: Arc::new(Shared {
                spec,
                timeouts: config.timeouts.clone(),
                icons: config.icon_store(),
                permit,
                submit: Mutex::new(()),
                inner: Mutex::new(Inner {
                    state: RuntimeState::Idle,
                    options: None,
                    menu: MenuSnapshot::empty(),
                    commands: None,
                    loop_thread: None,
                    loop_thread_id: None,
                    exited: None,
                    ctl: None,
                }),
            }),
        }
    }

    pub fn family(&self) -> BackendFamily {
        self.shared.spec.family()
    }

    pub fn state(&self) -> RuntimeState {
        lock(&self.shared.inner).state
    }

    pub fn spec(&self) -> &S {
        &self.shared.spec
    }

    pub fn start(&self, options: TrayOptions, menu: MenuSnapshot) -> Result<()> {
        let permit = self.acquire_permit()?;
        match lock(&self.shared.inner).state {
            RuntimeState::Idle => {}
            RuntimeState::Disposing | RuntimeState::Disposed => {
                return Err(BridgeError::Disposed { family: self.family() });
            }
            state => {
                log::debug!("{} tray already {}; start ignored", self.family(), state);
                return Ok(());
            }
        }
        self.launch(options, menu, permit)
    }

    pub fn update(&self, change: TrayUpdate) -> Result<()> {
        loop {
            let state = lock(&self.shared.inner).state;
            match state {
                RuntimeState::Running | RuntimeState::Updating => return self.enqueue_update(change),
                RuntimeState::Disposing | RuntimeState::Disposed => {
                    log::debug!("{} tray is {}; update dropped", self.family(), state);
                    return Ok(());
                }
                RuntimeState::Starting => {
                    // Whoever is starting holds the permit until the loop is up.
                    drop(self.acquire_permit()?);
                }
                RuntimeState::Idle => {
                    let permit = self.acquire_permit()?;
                    let (options, menu) = {
                        let inner = lock(&self.shared.inner);
                        if inner.state != RuntimeState::Idle {
                            continue;
                        }
                        let options = change.merge(inner.options.as_ref());
                        (options, change.menu.clone().unwrap_or_else(|| inner.menu.clone()))
                    };
                    let options = options.ok_or_else(|| BridgeError::init(self.family(), "no icon set"))?;
                    return self.launch(options, menu, permit);
                }
            }
        }
    }

    pub fn update_item_checked(&self, label: &str, checked: bool) -> Result<()> {
        loop {
            if lock(&self.shared.inner).state == RuntimeState::Starting {
                // `launch` installs its own menu when it finishes; toggle after that.
                drop(self.acquire_permit()?);
                continue;
            }
            let _submit = lock(&self.shared.submit);
            let inner = lock(&self.shared.inner);
            if inner.state == RuntimeState::Starting {
                continue;
            }
            return self.toggle_checked(inner, label, checked);
        }
    }

    fn toggle_checked(&self, mut inner: MutexGuard<'_, Inner<S::Menu>>, label: &str, checked: bool) -> Result<()> {
        if inner.state.is_terminal() {
            log::debug!("{} tray is {}; check toggle dropped", self.family(), inner.state);
            return Ok(());
        }
        let Some(next) = inner.menu.with_checked(label, checked) else {
            log::debug!("No menu item labelled {:?}", label);
            return Ok(());
        };

        inner.menu = next;
        if let Some(commands) = &inner.commands {
            let _ = commands.send(Command::SetChecked { label: label.to_string(), checked });
        }
        Ok(())
    }

    pub fn dispose(&self) -> Result<()> {
        let family = self.family();

        if self.on_loop_thread() {
            let mut inner = lock(&self.shared.inner);
            if !inner.state.is_terminal() {
                inner.state = RuntimeState::Disposing;
                if let Some(commands) = inner.commands.take() {
                    let _ = commands.send(Command::Quit);
                }
                log::debug!("{} dispose requested from the loop thread", family);
            }
            return Ok(());
        }

        if self.finish_if_disposed() {
            return Ok(());
        }
        let _permit = self.acquire_permit()?;
        if self.finish_if_disposed() {
            return Ok(());
        }

        let (ctl, handle, exited) = {
            let mut inner = lock(&self.shared.inner);
            if inner.state == RuntimeState::Idle {
                inner.state = RuntimeState::Disposed;
                return Ok(());
            }
            inner.state = RuntimeState::Disposing;
            if let Some(ctl) = &inner.ctl {
                ctl.caller_teardown.store(true, Ordering::SeqCst);
            }
            if let Some(commands) = inner.commands.take() {
                let _ = commands.send(Command::Quit);
            }
            (inner.ctl.take(), inner.loop_thread.take(), inner.exited.take())
        };

        let waited = self.shared.timeouts.dispose();
        let acknowledged = match exited {
            Some(exited) => !matches!(exited.recv_timeout(waited), Err(RecvTimeoutError::Timeout)),
            None => true,
        };

        if acknowledged {
            if let Some(handle) = handle {
                let _ = handle.join();
            }
            self.mark_disposed();
            log::info!("{} tray disposed", family);
            return Ok(());
        }

        if let Some(ctl) = ctl {
            ctl.abandoned.store(true, Ordering::SeqCst);
            ctl.caller_teardown.store(false, Ordering::SeqCst);
        }
        drop(handle);
        self.mark_disposed();
        log::warn!("{} loop thread did not exit within {:?}; abandoned", family, waited);
        Err(BridgeError::DisposeTimeout { family, waited })
    }

    /// Blocks until every command queued before this call has been handled.
    /// Returns false when no loop is running, on timeout, or when called from the loop thread.
    pub fn barrier(&self, timeout: Duration) -> bool {
        if self.on_loop_thread() {
            return false;
        }
        let (ack, done) = mpsc::sync_channel(1);
        {
            let inner = lock(&self.shared.inner);
            let Some(commands) = &inner.commands else { return false };
            if commands.send(Command::Barrier(ack)).is_err() {
                return false;
            }
        }
        done.recv_timeout(timeout).is_ok()
    }

    fn acquire_permit(&self) -> Result<PermitGuard> {
        self.shared.permit.acquire(self.shared.timeouts.permit()).inspect_err(|e| {
            log::warn!("{}", e);
        })
    }

    fn on_loop_thread(&self) -> bool {
        lock(&self.shared.inner).loop_thread_id == Some(thread::current().id())
    }

    fn finish_if_disposed(&self) -> bool {
        let handle = {
            let mut inner = lock(&self.shared.inner);
            if inner.state != RuntimeState::Disposed {
                return false;
            }
            inner.loop_thread.take()
        };
        if let Some(handle) = handle {
            let _ = handle.join();
        }
        true
    }

    fn mark_disposed(&self) {
        let mut inner = lock(&self.shared.inner);
        inner.state = RuntimeState::Disposed;
        inner.commands = None;
        inner.exited = None;
        inner.ctl = None;
    }

    fn launch(&self, options: TrayOptions, menu: MenuSnapshot, permit: PermitGuard) -> Result<()> {
        let family = self.family();
        let prepared = self.shared.prepare(&options, &menu)?;

        {
            let mut inner = lock(&self.shared.inner);
            if inner.state != RuntimeState::Idle {
                return Err(BridgeError::Disposed { family });
            }
            inner.state = RuntimeState::Starting;
        }

        let ctl = Arc::new(LaunchCtl {
            id: InstanceId::next(),
            abandoned: AtomicBool::new(false),
            caller_teardown: AtomicBool::new(false),
        });
        let (commands, queue) = mpsc::channel();
        let (ready_tx, ready) = mpsc::sync_channel(1);
        let (exit_tx, exited) = mpsc::sync_channel(1);

        let shared = Arc::clone(&self.shared);
        let thread_ctl = Arc::clone(&ctl);
        let spawned = thread::Builder::new()
            .name(format!("traybridge-{}", family))
            .spawn(move || run_loop(shared, thread_ctl, prepared, queue, ready_tx, exit_tx));

        let handle = match spawned {
            Ok(handle) => handle,
            Err(e) => {
                self.reset_to_idle();
                return Err(BridgeError::init(family, format!("failed to spawn loop thread: {}", e)));
            }
        };

        match ready.recv_timeout(self.shared.timeouts.start()) {
            Ok(Ok(())) => {
                let mut inner = lock(&self.shared.inner);
                inner.state = RuntimeState::Running;
                inner.options = Some(options);
                inner.menu = menu;
                inner.loop_thread_id = Some(handle.thread().id());
                inner.loop_thread = Some(handle);
                inner.commands = Some(commands);
                inner.exited = Some(exited);
                inner.ctl = Some(ctl);
                drop(inner);
                drop(permit);
                log::info!("{} tray started", family);
                Ok(())
            }
            Ok(Err(e)) => {
                let _ = handle.join();
                self.reset_to_idle();
                log::error!("{}", e);
                Err(e)
            }
            Err(RecvTimeoutError::Disconnected) => {
                let _ = handle.join();
                self.reset_to_idle();
                Err(BridgeError::init(family, "loop thread exited before it was ready"))
            }
            Err(RecvTimeoutError::Timeout) => {
                ctl.abandoned.store(true, Ordering::SeqCst);
                let _ = commands.send(Command::Quit);
                self.reset_to_idle();
                let waited = self.shared.timeouts.start();
                log::error!("{} tray not ready within {:?}; loop thread abandoned", family, waited);
                Err(BridgeError::init(family, format!("not ready within {:?}", waited)))
            }
        }
    }

    fn reset_to_idle(&self) {
        lock(&self.shared.inner).state = RuntimeState::Idle;
    }

    fn enqueue_update(&self, change: TrayUpdate) -> Result<()> {
        let _submit = lock(&self.shared.submit);

        let (options, menu) = {
            let inner = lock(&self.shared.inner);
            if !inner.state.is_live() {
                log::debug!("{} tray is {}; update dropped", self.family(), inner.state);
                return Ok(());
            }
            let options = change.merge(inner.options.as_ref());
            (options, change.menu.clone().unwrap_or_else(|| inner.menu.clone()))
        };
        let options = options.ok_or_else(|| BridgeError::init(self.family(), "no icon set"))?;
        let prepared = self.shared.prepare(&options, &menu)?;

        let mut inner = lock(&self.shared.inner);
        let Some(commands) = &inner.commands else {
            log::debug!("{} loop is gone; update dropped", self.family());
            return Ok(());
        };
        if commands.send(Command::Apply(prepared)).is_err() {
            log::debug!("{} loop is gone; update dropped", self.family());
            return Ok(());
        }
        inner.options = Some(options);
        inner.menu = menu;
        Ok(())
    }
}

impl<S: DriverSpec> Drop for TrayRuntime<S> {
    fn drop(&mut self) {
        if let Err(e) = self.dispose() {
            log::warn!("Dispose on drop failed: {}", e);
        }
    }
}

impl<S: DriverSpec> Shared<S> {
    fn prepare(&self, options: &TrayOptions, menu: &MenuSnapshot) -> Result<Prepared<S::Menu>> {
        if options.tooltip.contains('\0') {
            return Err(EncodeError::InteriorNul(options.tooltip.clone()).into());
        }
        let icon_path = self.icons.resolve(&options.icon).map_err(EncodeError::from)?;
        let menu = self.spec.prepare_menu(menu, &self.icons)?;
        Ok(Prepared {
            icon_path,
            tooltip: options.tooltip.clone(),
            on_primary_click: options.on_primary_click.clone(),
            menu,
        })
    }

    fn set_state_if(&self, from: RuntimeState, to: RuntimeState) {
        let mut inner = lock(&self.inner);
        if inner.state == from {
            inner.state = to;
        }
    }
}

struct LoopCtx<S: DriverSpec> {
    shared: Arc<Shared<S>>,
    ctl: Arc<LaunchCtl>,
    driver: S::Driver,
    seq: u64,
}

impl<S: DriverSpec> LoopCtx<S> {
    fn family(&self) -> BackendFamily {
        self.shared.spec.family()
    }

    fn next_generation(&mut self) -> Generation {
        self.seq += 1;
        Generation { instance: self.ctl.id, seq: self.seq }
    }

    fn apply(&mut self, prepared: Prepared<S::Menu>) {
        self.shared.set_state_if(RuntimeState::Running, RuntimeState::Updating);
        let generation = self.next_generation();
        if let Err(e) = self.driver.apply(prepared, generation) {
            log::error!("{} update failed: {}", self.family(), e);
        }
        self.shared.set_state_if(RuntimeState::Updating, RuntimeState::Running);
    }

    fn rebuild(&mut self) {
        let (options, menu) = {
            let inner = lock(&self.shared.inner);
            (inner.options.clone(), inner.menu.clone())
        };
        let Some(options) = options else { return };
        match self.shared.prepare(&options, &menu) {
            Ok(prepared) => self.apply(prepared),
            Err(e) => log::error!("{} rebuild failed: {}", self.family(), e),
        }
    }

    /// Returns false when the loop should stop.
    fn handle(&mut self, command: Command<S::Menu>) -> bool {
        match command {
            Command::Apply(prepared) => self.apply(prepared),
            Command::SetChecked { label, checked } => {
                if self.driver.set_checked(&label, checked) == CheckedUpdate::NeedsRebuild {
                    log::debug!("{} has no item handle for {:?}; rebuilding", self.family(), label);
                    self.rebuild();
                }
            }
            Command::Barrier(ack) => {
                let _ = ack.send(());
            }
            Command::Quit => return false,
        }
        true
    }

    fn teardown_permit(&self) -> Option<PermitGuard> {
        let poll = self.shared.timeouts.poll();
        let deadline = Instant::now() + self.shared.timeouts.permit();
        loop {
            if self.ctl.caller_teardown.load(Ordering::SeqCst) {
                return None;
            }
            if let Ok(guard) = self.shared.permit.acquire(poll) {
                return Some(guard);
            }
            if Instant::now() >= deadline {
                log::warn!("{} tearing down without the lifecycle permit", self.family());
                return None;
            }
        }
    }

    fn teardown(mut self, exited: SyncSender<()>) {
        let _permit = self.teardown_permit();
        self.driver.shutdown();

        let released = retention::global().release_instance(self.ctl.id);
        log::debug!("{} released {} retained generations", self.family(), released);

        if !self.ctl.abandoned.load(Ordering::SeqCst) {
            let mut inner = lock(&self.shared.inner);
            inner.state = RuntimeState::Disposed;
            inner.commands = None;
        }
        let _ = exited.send(());
    }
}

fn run_loop<S: DriverSpec>(
    shared: Arc<Shared<S>>,
    ctl: Arc<LaunchCtl>,
    prepared: Prepared<S::Menu>,
    queue: Receiver<Command<S::Menu>>,
    ready: SyncSender<Result<()>>,
    exited: SyncSender<()>,
) {
    let family = shared.spec.family();
    let mut driver = match shared.spec.connect() {
        Ok(driver) => driver,
        Err(e) => {
            let _ = ready.send(Err(e));
            return;
        }
    };

    if let Err(e) = driver.init(prepared, Generation { instance: ctl.id, seq: 0 }) {
        retention::global().release_instance(ctl.id);
        let _ = ready.send(Err(e));
        return;
    }
    let _ = ready.send(Ok(()));
    log::debug!("{} loop running", family);

    let poll = shared.timeouts.poll();
    let mut ctx = LoopCtx { shared, ctl, driver, seq: 0 };

    'run: loop {
        match queue.recv_timeout(poll) {
            Ok(command) => {
                if !ctx.handle(command) {
                    break 'run;
                }
                while let Ok(command) = queue.try_recv() {
                    if !ctx.handle(command) {
                        break 'run;
                    }
                }
            }
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => break 'run,
        }

        if ctx.driver.pump() == LoopStatus::Finished {
            log::info!("{} native loop finished", family);
            break 'run;
        }
    }

    ctx.teardown(exited);
    log::debug!("{} loop exited", family);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn update_merges_over_current_options() {
        let base = TrayOptions::new(TrayIcon::from_path("/a.png")).with_tooltip("old");
        let cases = [
            (TrayUpdate::new(), "/a.png", "old"),
            (TrayUpdate::new().with_tooltip("new"), "/a.png", "new"),
            (TrayUpdate::new().with_icon(TrayIcon::from_path("/b.png")), "/b.png", "old"),
        ];

        for (change, icon, tooltip) in cases {
            let merged = change.merge(Some(&base)).unwrap();
            assert_eq!(merged.icon, TrayIcon::from_path(icon));
            assert_eq!(merged.tooltip, tooltip);
        }
    }

    #[test]
    fn merge_without_icon_anywhere_is_none() {
        assert!(TrayUpdate::new().with_tooltip("x").merge(None).is_none());
    }
}
