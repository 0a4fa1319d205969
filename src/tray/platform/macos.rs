use super::chain::ChainSpec;
use crate::bridge::lifecycle::BackendFamily;
use crate::bridge::records::CocoaTray;
use crate::config::BridgeConfig;
use crate::error::{BridgeError, Result};
use crate::native::tray_api::{DynamicTrayApi, TrayApi};
use std::ffi::c_int;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

pub type CocoaSpec = ChainSpec<CocoaTrayApi>;

/// Returned from `init` when nobody runs the AppKit loop; `tray_init` would block forever.
const NO_MAIN_LOOP: c_int = -2;

static MAIN_LOOP: AtomicBool = AtomicBool::new(false);

/// `libMacTray.dylib`. Every entry point hops onto the main dispatch queue:
/// `tray_init` and `tray_loop` synchronously, `tray_update` and `tray_exit`
/// asynchronously.
pub struct CocoaTrayApi {
    inner: DynamicTrayApi<CocoaTray>,
}

impl TrayApi for CocoaTrayApi {
    type Tray = CocoaTray;

    unsafe fn init(&self, tray: *mut CocoaTray) -> c_int {
        if !MAIN_LOOP.load(Ordering::SeqCst) {
            log::error!("Cocoa tray needs the AppKit main loop; call run_main_loop from the main thread");
            return NO_MAIN_LOOP;
        }
        self.inner.init(tray)
    }

    fn pump(&self) -> c_int {
        self.inner.pump()
    }

    unsafe fn update(&self, tray: *mut CocoaTray) {
        self.inner.update(tray)
    }

    fn exit(&self) {
        self.inner.exit();
    }

    fn defers_updates(&self) -> bool {
        true
    }
}

pub fn spec(config: &BridgeConfig) -> Result<CocoaSpec> {
    let inner = DynamicTrayApi::<CocoaTray>::load(BackendFamily::Cocoa, &config.native)?;
    Ok(ChainSpec::new(BackendFamily::Cocoa, Arc::new(CocoaTrayApi { inner })))
}

/// Runs the AppKit event loop on the calling thread, which must be the process
/// main thread, and runs `host` on a thread of its own. The application
/// terminates once `host` returns.
pub fn run_main_loop<F>(host: F) -> Result<()>
where
    F: FnOnce() + Send + 'static,
{
    let app = shared_application();
    MAIN_LOOP.store(true, Ordering::SeqCst);

    thread::Builder::new()
        .name("traybridge-host".to_string())
        .spawn(move || {
            host();
            terminate_on_main_thread();
        })
        .map_err(|e| BridgeError::init(BackendFamily::Cocoa, format!("failed to spawn host thread: {}", e)))?;

    run_event_loop(&app);
    Ok(())
}

/// For hosts whose own toolkit already runs the AppKit loop on the main thread.
pub fn assume_main_loop_running() {
    MAIN_LOOP.store(true, Ordering::SeqCst);
}

fn shared_application() -> objc2::rc::Retained<objc2::runtime::AnyObject> {
    use objc2::{class, msg_send};

    unsafe { msg_send![class!(NSApplication), sharedApplication] }
}

fn run_event_loop(app: &objc2::runtime::AnyObject) {
    use objc2::msg_send;

    unsafe {
        let _: () = msg_send![app, run];
    }
}

fn terminate_on_main_thread() {
    use objc2::runtime::AnyObject;
    use objc2::{msg_send, sel};

    let app = shared_application();
    unsafe {
        let _: () = msg_send![
            &app,
            performSelectorOnMainThread: sel!(terminate:),
            withObject: std::ptr::null::<AnyObject>(),
            waitUntilDone: false
        ];
    }
}
