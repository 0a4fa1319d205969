//! `extern "C"` entry points handed to native libraries. Each one turns the pointer
//! native code passes back into a [`TrampolineKey`] and runs the retained closure.

use super::retention::{self, TrampolineKey};
use std::ffi::{c_int, c_void};
use std::panic::{self, AssertUnwindSafe};

/// `tray.h` menu item callback; native passes the clicked record, whatever its layout.
pub unsafe extern "C" fn menu_item_trampoline<M>(item: *mut M) {
    dispatch(TrampolineKey::from_ptr(item));
}

/// `tray.h` tray callback; native passes the `struct tray` record.
pub unsafe extern "C" fn tray_trampoline(tray: *mut c_void) {
    dispatch(TrampolineKey::from_ptr(tray));
}

/// SNI menu action callback; `data` is the address of the item's callback slot.
pub unsafe extern "C" fn action_trampoline(data: *mut c_void) {
    dispatch(TrampolineKey::from_ptr(data));
}

/// SNI activate (primary click) callback.
pub unsafe extern "C" fn activate_trampoline(_x: c_int, _y: c_int, data: *mut c_void) {
    dispatch(TrampolineKey::from_ptr(data));
}

/// Runs the closure retained under `key`. Returns false when nothing was
/// retained for it or the closure panicked.
pub fn dispatch(key: TrampolineKey) -> bool {
    let Some(callback) = retention::global().resolve(key) else {
        log::warn!("No callback retained for {:#x}", key);
        return false;
    };

    match panic::catch_unwind(AssertUnwindSafe(|| callback())) {
        Ok(()) => true,
        Err(payload) => {
            log::error!("Tray callback panicked: {}", panic_message(payload.as_ref()));
            false
        }
    }
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        return s;
    }
    if let Some(s) = payload.downcast_ref::<String>() {
        return s;
    }
    "non-string panic payload"
}
