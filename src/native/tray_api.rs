use super::NativeLibrary;
use crate::bridge::lifecycle::BackendFamily;
use crate::bridge::records::TrayRecord;
use crate::config::NativeLibraryConfig;
use crate::error::Result;
use std::ffi::c_int;
use std::marker::PhantomData;

/// The four entry points of a `tray.h` library.
///
/// The library keeps one global tray; every call after `init` must come from
/// the thread that called `init`.
pub trait TrayApi: Send + Sync + 'static {
    type Tray: TrayRecord;

    /// # Safety
    /// `tray` and everything it points to must stay alive until `exit` returns
    /// or a later `update` replaces it.
    unsafe fn init(&self, tray: *mut Self::Tray) -> c_int;

    /// Non-blocking `tray_loop(0)`. Returns -1 once the library has quit.
    fn pump(&self) -> c_int;

    /// # Safety
    /// Same as [`TrayApi::init`].
    unsafe fn update(&self, tray: *mut Self::Tray);

    fn exit(&self);

    /// True when `update` and `exit` only queue work that the next `pump` completes.
    /// The previous tray must then outlive that pump.
    fn defers_updates(&self) -> bool {
        false
    }
}

type InitFn<R> = unsafe extern "C" fn(*mut R) -> c_int;
type LoopFn = unsafe extern "C" fn(c_int) -> c_int;
type UpdateFn<R> = unsafe extern "C" fn(*mut R);
type ExitFn = unsafe extern "C" fn();

/// `tray.h` library loaded at runtime (`tray.dll`, `libMacTray.dylib`).
pub struct DynamicTrayApi<R> {
    _library: NativeLibrary,
    init: InitFn<R>,
    tray_loop: LoopFn,
    update: UpdateFn<R>,
    exit: ExitFn,
    _record: PhantomData<fn() -> R>,
}

impl<R: TrayRecord> DynamicTrayApi<R> {
    pub fn load(family: BackendFamily, config: &NativeLibraryConfig) -> Result<Self> {
        let library = NativeLibrary::open(family, config)?;
        unsafe {
            Ok(Self {
                init: library.function("tray_init")?,
                tray_loop: library.function("tray_loop")?,
                update: library.function("tray_update")?,
                exit: library.function("tray_exit")?,
                _library: library,
                _record: PhantomData,
            })
        }
    }
}

impl<R: TrayRecord> TrayApi for DynamicTrayApi<R> {
    type Tray = R;

    unsafe fn init(&self, tray: *mut R) -> c_int {
        (self.init)(tray)
    }

    fn pump(&self) -> c_int {
        unsafe { (self.tray_loop)(0) }
    }

    unsafe fn update(&self, tray: *mut R) {
        (self.update)(tray)
    }

    fn exit(&self) {
        unsafe { (self.exit)() }
    }
}
