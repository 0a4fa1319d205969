//! In-process `tray.h` library. Behaves like the native ones from the bridge's
//! point of view (global tray pointer, callbacks invoked from `tray_loop`) and
//! records what it was handed, so headless hosts and tests can drive a tray.

use super::tray_api::TrayApi;
use crate::bridge::encoder::{decode, record_at, DecodedItem};
use crate::bridge::records::{MenuRecord, TrayRecord, Win32Tray};
use crate::bridge::retention::{self, TrampolineKey};
use std::collections::VecDeque;
use std::ffi::{c_int, c_void, CStr};
use std::marker::PhantomData;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::thread::{self, ThreadId};
use std::time::Duration;

#[derive(Debug, Clone)]
enum SimEvent {
    Click(Vec<usize>),
    PrimaryClick,
    Quit,
}

/// Work a deferring library has queued but not yet run.
#[derive(Debug, Clone, Copy)]
enum SimTask {
    Update(usize),
    Exit,
}

/// Field-level copy of one native record, terminators included.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawRecord {
    pub addr: usize,
    pub text: Option<String>,
    pub icon_filepath: Option<String>,
    pub disabled: c_int,
    pub checked: c_int,
    pub cb: Option<usize>,
    pub submenu: usize,
}

#[derive(Default)]
struct SimState {
    tray: usize,
    visible: bool,
    finished: bool,
    events: VecDeque<SimEvent>,
    init_result: c_int,
    init_count: usize,
    update_count: usize,
    exit_count: usize,
    loop_threads: Vec<ThreadId>,
    menu: Vec<DecodedItem>,
    raw: Vec<RawRecord>,
    tooltip: Option<String>,
    icon: Option<PathBuf>,
    seen_keys: Vec<TrampolineKey>,
    unretained: usize,
    stall: Option<Duration>,
    init_stall: Option<Duration>,
    deferred: bool,
    tasks: VecDeque<SimTask>,
    stale_swaps: usize,
    failing_pumps: usize,
}

pub struct SimulatedTrayApi<R = Win32Tray> {
    state: Mutex<SimState>,
    _record: PhantomData<fn() -> R>,
}

impl<R: TrayRecord> SimulatedTrayApi<R> {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            state: Mutex::new(SimState::default()),
            _record: PhantomData,
        })
    }

    /// A library whose `tray_init` returns `code`.
    pub fn failing(code: c_int) -> Arc<Self> {
        let api = Self::new();
        api.lock().init_result = code;
        api
    }

    /// A library whose `update` and `exit` only take effect on the next `tray_loop`,
    /// the way a main-queue-dispatching library behaves.
    pub fn deferred() -> Arc<Self> {
        let api = Self::new();
        api.lock().deferred = true;
        api
    }

    fn lock(&self) -> MutexGuard<'_, SimState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Queues a click on the record at `path` (sibling indexes, outermost first).
    pub fn click(&self, path: &[usize]) {
        self.lock().events.push_back(SimEvent::Click(path.to_vec()));
    }

    pub fn primary_click(&self) {
        self.lock().events.push_back(SimEvent::PrimaryClick);
    }

    /// Makes the next `tray_loop` report that the library has quit.
    pub fn quit(&self) {
        self.lock().events.push_back(SimEvent::Quit);
    }

    /// Makes the next `tray_loop` block for `duration` before handling events.
    pub fn stall_next_pump(&self, duration: Duration) {
        self.lock().stall = Some(duration);
    }

    /// Makes the next `tray_init` block for `duration`.
    pub fn stall_next_init(&self, duration: Duration) {
        self.lock().init_stall = Some(duration);
    }

    /// Makes the next `count` calls to `tray_loop` fail with -1 without quitting.
    pub fn fail_next_pumps(&self, count: usize) {
        self.lock().failing_pumps = count;
    }

    pub fn is_visible(&self) -> bool {
        self.lock().visible
    }

    pub fn menu(&self) -> Vec<DecodedItem> {
        self.lock().menu.clone()
    }

    pub fn raw_records(&self) -> Vec<RawRecord> {
        self.lock().raw.clone()
    }

    pub fn tooltip(&self) -> Option<String> {
        self.lock().tooltip.clone()
    }

    pub fn icon_path(&self) -> Option<PathBuf> {
        self.lock().icon.clone()
    }

    pub fn init_count(&self) -> usize {
        self.lock().init_count
    }

    pub fn update_count(&self) -> usize {
        self.lock().update_count
    }

    pub fn exit_count(&self) -> usize {
        self.lock().exit_count
    }

    /// Distinct threads that have called `tray_loop`.
    pub fn loop_threads(&self) -> Vec<ThreadId> {
        self.lock().loop_threads.clone()
    }

    /// Every trampoline key the library has been handed so far.
    pub fn seen_keys(&self) -> Vec<TrampolineKey> {
        self.lock().seen_keys.clone()
    }

    /// Callbacks invoked through a record the retention table no longer held.
    pub fn unretained_dispatches(&self) -> usize {
        self.lock().unretained
    }

    /// Deferred swaps that found the outgoing menu already released.
    pub fn stale_swaps(&self) -> usize {
        self.lock().stale_swaps
    }

    /// Snapshot of what native code can reach through `tray`.
    fn capture(state: &mut SimState, tray: *mut R) {
        let tray = unsafe { &*tray };
        let root = tray.menu();

        state.tooltip = c_string(tray.tooltip());
        state.icon = c_string(tray.icon_filepath()).map(PathBuf::from);
        state.menu = unsafe { decode(root) };
        state.raw.clear();
        unsafe { collect_raw(root, &mut state.raw) };

        if tray.callback().is_some() {
            state.seen_keys.push(TrampolineKey::from_ptr(tray as *const R));
        }
        let keys: Vec<TrampolineKey> = state
            .raw
            .iter()
            .filter(|r| r.cb.is_some())
            .map(|r| TrampolineKey::from_addr(r.addr))
            .collect();
        state.seen_keys.extend(keys);
    }

    fn dispatch_click(&self, tray: usize, path: &[usize]) {
        let root = unsafe { (*(tray as *mut R)).menu() };
        let Some(record) = (unsafe { record_at(root, path) }) else {
            log::debug!("Simulated click on missing record {:?}", path);
            return;
        };
        let Some(cb) = (unsafe { (*record).callback() }) else { return };

        self.note_retained(TrampolineKey::from_ptr(record));
        unsafe { cb(record) };
    }

    fn dispatch_primary(&self, tray: usize) {
        let record = tray as *mut R;
        let Some(cb) = (unsafe { (*record).callback() }) else { return };

        self.note_retained(TrampolineKey::from_ptr(record));
        unsafe { cb(record as *mut c_void) };
    }

    /// Runs queued work in order, as a main queue drains before a synchronous call.
    fn run_tasks(state: &mut SimState) {
        while let Some(task) = state.tasks.pop_front() {
            // The outgoing menu is still on screen until the swap completes.
            let released = state
                .raw
                .iter()
                .filter(|r| r.cb.is_some())
                .any(|r| !retention::global().contains(TrampolineKey::from_addr(r.addr)));
            if released {
                state.stale_swaps += 1;
            }
            match task {
                SimTask::Update(tray) if !released => {
                    state.tray = tray;
                    Self::capture(state, tray as *mut R);
                }
                SimTask::Update(_) => {}
                SimTask::Exit => {
                    state.visible = false;
                    state.tray = 0;
                }
            }
        }
    }

    fn note_retained(&self, key: TrampolineKey) {
        if !retention::global().contains(key) {
            self.lock().unretained += 1;
        }
    }
}

impl<R: TrayRecord> TrayApi for SimulatedTrayApi<R> {
    type Tray = R;

    unsafe fn init(&self, tray: *mut R) -> c_int {
        let stall = self.lock().init_stall.take();
        if let Some(stall) = stall {
            thread::sleep(stall);
        }
        let mut state = self.lock();
        state.init_count += 1;
        Self::capture(&mut state, tray);
        if state.init_result != 0 {
            return state.init_result;
        }
        state.tray = tray as usize;
        state.visible = true;
        state.finished = false;
        0
    }

    fn pump(&self) -> c_int {
        let (stall, events, tray) = {
            let mut state = self.lock();
            let current = thread::current().id();
            if !state.loop_threads.contains(&current) {
                state.loop_threads.push(current);
            }
            Self::run_tasks(&mut state);
            if state.finished || state.tray == 0 {
                return -1;
            }
            if state.failing_pumps > 0 {
                state.failing_pumps -= 1;
                return -1;
            }
            let events: Vec<SimEvent> = state.events.drain(..).collect();
            (state.stall.take(), events, state.tray)
        };

        if let Some(stall) = stall {
            thread::sleep(stall);
        }

        // Callbacks run without the state lock, as a native loop would run them.
        for event in events {
            match event {
                SimEvent::Click(path) => self.dispatch_click(tray, &path),
                SimEvent::PrimaryClick => self.dispatch_primary(tray),
                SimEvent::Quit => {
                    let mut state = self.lock();
                    state.finished = true;
                    state.visible = false;
                    return -1;
                }
            }
        }
        0
    }

    unsafe fn update(&self, tray: *mut R) {
        let mut state = self.lock();
        state.update_count += 1;
        if state.deferred {
            state.tasks.push_back(SimTask::Update(tray as usize));
            return;
        }
        state.tray = tray as usize;
        Self::capture(&mut state, tray);
    }

    fn exit(&self) {
        let mut state = self.lock();
        state.exit_count += 1;
        if state.deferred {
            state.tasks.push_back(SimTask::Exit);
            return;
        }
        state.visible = false;
        state.tray = 0;
    }

    fn defers_updates(&self) -> bool {
        self.lock().deferred
    }
}

fn c_string(ptr: *const std::ffi::c_char) -> Option<String> {
    if ptr.is_null() {
        return None;
    }
    Some(unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned())
}

/// Depth-first copy of every record, each sibling list followed by its terminator.
unsafe fn collect_raw<M: MenuRecord>(root: *const M, out: &mut Vec<RawRecord>) {
    if root.is_null() {
        return;
    }
    let mut cursor = root;
    loop {
        let record = &*cursor;
        out.push(RawRecord {
            addr: cursor as usize,
            text: c_string(record.text()),
            icon_filepath: c_string(record.icon_filepath()),
            disabled: record.disabled(),
            checked: record.checked(),
            cb: record.callback().map(|cb| cb as usize),
            submenu: record.submenu() as usize,
        });
        if record.is_terminator() {
            break;
        }
        collect_raw(record.submenu(), out);
        cursor = cursor.add(1);
    }
}
