//! librtlsdr bindings via dynamic loading.
//!
//! The library is resolved at runtime with `libloading`, so the binary (and
//! the test suite) builds and runs on machines without librtlsdr installed;
//! opening a device on such a machine fails with
//! [`TunerError::LibraryNotFound`].
//!
//! Wire format: 8-bit unsigned I/Q interleaved, 127/128 at the midpoint.

use std::ffi::{c_char, c_int, c_uchar, c_uint, c_void, CString};
use std::ptr;
use std::sync::{Mutex, OnceLock};

use libloading::{Library, Symbol};
use tracing::{debug, info, warn};

use super::{TunerDevice, TunerError};

type DevHandle = *mut c_void;

type ReadAsyncCb = unsafe extern "C" fn(*mut c_uchar, u32, *mut c_void);

struct Lib {
    _lib: Library,
    get_device_count: Symbol<'static, unsafe extern "C" fn() -> c_uint>,
    get_index_by_serial: Symbol<'static, unsafe extern "C" fn(*const c_char) -> c_int>,
    open: Symbol<'static, unsafe extern "C" fn(*mut DevHandle, c_uint) -> c_int>,
    close: Symbol<'static, unsafe extern "C" fn(DevHandle) -> c_int>,
    set_center_freq: Symbol<'static, unsafe extern "C" fn(DevHandle, c_uint) -> c_int>,
    set_sample_rate: Symbol<'static, unsafe extern "C" fn(DevHandle, c_uint) -> c_int>,
    set_tuner_gain_mode: Symbol<'static, unsafe extern "C" fn(DevHandle, c_int) -> c_int>,
    set_tuner_gain: Symbol<'static, unsafe extern "C" fn(DevHandle, c_int) -> c_int>,
    get_tuner_gains: Symbol<'static, unsafe extern "C" fn(DevHandle, *mut c_int) -> c_int>,
    set_freq_correction: Symbol<'static, unsafe extern "C" fn(DevHandle, c_int) -> c_int>,
    reset_buffer: Symbol<'static, unsafe extern "C" fn(DevHandle) -> c_int>,
    read_async: Symbol<
        'static,
        unsafe extern "C" fn(DevHandle, ReadAsyncCb, *mut c_void, c_uint, c_uint) -> c_int,
    >,
    cancel_async: Symbol<'static, unsafe extern "C" fn(DevHandle) -> c_int>,
}

static RTLSDR_LIB: OnceLock<Option<Lib>> = OnceLock::new();

#[cfg(target_os = "linux")]
const LIB_NAMES: &[&str] = &["librtlsdr.so.0", "librtlsdr.so"];

#[cfg(target_os = "macos")]
const LIB_NAMES: &[&str] = &["librtlsdr.dylib", "librtlsdr.0.dylib"];

#[cfg(target_os = "windows")]
const LIB_NAMES: &[&str] = &["rtlsdr.dll", "librtlsdr.dll"];

fn load_library() -> Option<Lib> {
    for name in LIB_NAMES {
        if let Ok(lib) = unsafe { Library::new(name) } {
            let result = unsafe {
                // The symbols borrow the Library; it stays alive inside the
                // returned struct, so extending the lifetime is sound.
                let lib_ref: &'static Library = std::mem::transmute(&lib);

                Some(Lib {
                    get_device_count: lib_ref.get(b"rtlsdr_get_device_count\0").ok()?,
                    get_index_by_serial: lib_ref.get(b"rtlsdr_get_index_by_serial\0").ok()?,
                    open: lib_ref.get(b"rtlsdr_open\0").ok()?,
                    close: lib_ref.get(b"rtlsdr_close\0").ok()?,
                    set_center_freq: lib_ref.get(b"rtlsdr_set_center_freq\0").ok()?,
                    set_sample_rate: lib_ref.get(b"rtlsdr_set_sample_rate\0").ok()?,
                    set_tuner_gain_mode: lib_ref.get(b"rtlsdr_set_tuner_gain_mode\0").ok()?,
                    set_tuner_gain: lib_ref.get(b"rtlsdr_set_tuner_gain\0").ok()?,
                    get_tuner_gains: lib_ref.get(b"rtlsdr_get_tuner_gains\0").ok()?,
                    set_freq_correction: lib_ref.get(b"rtlsdr_set_freq_correction\0").ok()?,
                    reset_buffer: lib_ref.get(b"rtlsdr_reset_buffer\0").ok()?,
                    read_async: lib_ref.get(b"rtlsdr_read_async\0").ok()?,
                    cancel_async: lib_ref.get(b"rtlsdr_cancel_async\0").ok()?,
                    _lib: lib,
                })
            };

            if result.is_some() {
                info!("loaded RTL-SDR library: {}", name);
                return result;
            }
        }
    }
    debug!("RTL-SDR library not found");
    None
}

fn get_lib() -> Option<&'static Lib> {
    RTLSDR_LIB.get_or_init(load_library).as_ref()
}

/// An open RTL-SDR device.
pub struct RtlSdrTuner {
    handle: DevHandle,
    gains: Vec<i32>,
    // Serializes control calls issued while another thread streams.
    ctl: Mutex<()>,
}

// SAFETY: librtlsdr permits control calls and cancel_async from a thread
// other than the one blocked in read_async; control calls are additionally
// serialized behind `ctl`.
unsafe impl Send for RtlSdrTuner {}
unsafe impl Sync for RtlSdrTuner {}

/// Open a device by serial number; an empty serial opens index 0.
pub fn open(serial: &str) -> Result<RtlSdrTuner, TunerError> {
    let lib = get_lib().ok_or(TunerError::LibraryNotFound)?;

    let count = unsafe { (lib.get_device_count)() };
    if count == 0 {
        return Err(TunerError::NoDevicesAvailable);
    }
    info!("have {} available devices", count);

    let index = if serial.is_empty() {
        0
    } else {
        let c_serial =
            CString::new(serial).map_err(|_| TunerError::SerialNotFound(serial.to_string()))?;
        let idx = unsafe { (lib.get_index_by_serial)(c_serial.as_ptr()) };
        if idx < 0 {
            return Err(TunerError::SerialNotFound(serial.to_string()));
        }
        idx as c_uint
    };

    let mut handle: DevHandle = ptr::null_mut();
    let ret = unsafe { (lib.open)(&mut handle, index) };
    if ret != 0 || handle.is_null() {
        return Err(TunerError::OpenFailed(ret));
    }

    let mut gains = [0 as c_int; 64];
    let count = unsafe { (lib.get_tuner_gains)(handle, gains.as_mut_ptr()) };
    let gains = if count > 0 {
        gains[..count as usize].to_vec()
    } else {
        Vec::new()
    };

    info!("opened device #{} with {} gain levels", index, gains.len());
    Ok(RtlSdrTuner {
        handle,
        gains,
        ctl: Mutex::new(()),
    })
}

impl RtlSdrTuner {
    fn control(
        &self,
        op: &'static str,
        value: i64,
        call: impl FnOnce(&Lib) -> c_int,
    ) -> Result<(), TunerError> {
        let lib = get_lib().ok_or(TunerError::LibraryNotFound)?;
        let _guard = self.ctl.lock().unwrap_or_else(|e| e.into_inner());
        let code = call(lib);
        if code != 0 {
            Err(TunerError::ControlFailed { op, value, code })
        } else {
            Ok(())
        }
    }
}

struct CallbackCtx<'a> {
    cb: &'a mut dyn FnMut(&mut [u8]),
}

unsafe extern "C" fn read_trampoline(buf: *mut c_uchar, len: u32, ctx: *mut c_void) {
    if buf.is_null() || ctx.is_null() {
        return;
    }
    let ctx = &mut *(ctx as *mut CallbackCtx<'_>);
    let samples = std::slice::from_raw_parts_mut(buf, len as usize);
    (ctx.cb)(samples);
}

impl TunerDevice for RtlSdrTuner {
    fn set_tuner_gain_mode(&self, auto: bool) -> Result<(), TunerError> {
        let manual = c_int::from(!auto);
        self.control("set_tuner_gain_mode", i64::from(manual), |lib| unsafe {
            (lib.set_tuner_gain_mode)(self.handle, manual)
        })
    }

    fn set_tuner_gain(&self, tenths_db: i32) -> Result<(), TunerError> {
        self.control("set_tuner_gain", i64::from(tenths_db), |lib| unsafe {
            (lib.set_tuner_gain)(self.handle, tenths_db)
        })
    }

    fn tuner_gains(&self) -> Result<Vec<i32>, TunerError> {
        if self.gains.is_empty() {
            return Err(TunerError::NoGainValues);
        }
        Ok(self.gains.clone())
    }

    fn set_freq_correction(&self, ppm: i32) -> Result<(), TunerError> {
        self.control("set_freq_correction", i64::from(ppm), |lib| unsafe {
            (lib.set_freq_correction)(self.handle, ppm)
        })
    }

    fn set_center_freq(&self, hz: u32) -> Result<(), TunerError> {
        self.control("set_center_freq", i64::from(hz), |lib| unsafe {
            (lib.set_center_freq)(self.handle, hz)
        })
    }

    fn set_sample_rate(&self, hz: u32) -> Result<(), TunerError> {
        self.control("set_sample_rate", i64::from(hz), |lib| unsafe {
            (lib.set_sample_rate)(self.handle, hz)
        })
    }

    fn reset_buffer(&self) -> Result<(), TunerError> {
        self.control("reset_buffer", 0, |lib| unsafe {
            (lib.reset_buffer)(self.handle)
        })
    }

    fn read_async(&self, buf_len: usize, cb: &mut dyn FnMut(&mut [u8])) -> Result<(), TunerError> {
        let lib = get_lib().ok_or(TunerError::LibraryNotFound)?;
        let mut ctx = CallbackCtx { cb };
        debug!("entering async read loop, {} byte buffers", buf_len);
        let ret = unsafe {
            (lib.read_async)(
                self.handle,
                read_trampoline,
                &mut ctx as *mut CallbackCtx<'_> as *mut c_void,
                0,
                buf_len as c_uint,
            )
        };
        if ret != 0 {
            Err(TunerError::ReadFailed(ret))
        } else {
            Ok(())
        }
    }

    fn cancel_async(&self) -> Result<(), TunerError> {
        let lib = get_lib().ok_or(TunerError::LibraryNotFound)?;
        let code = unsafe { (lib.cancel_async)(self.handle) };
        if code != 0 {
            return Err(TunerError::ControlFailed {
                op: "cancel_async",
                value: 0,
                code,
            });
        }
        Ok(())
    }
}

impl Drop for RtlSdrTuner {
    fn drop(&mut self) {
        if let Some(lib) = get_lib() {
            debug!("closing RTL-SDR device");
            let code = unsafe { (lib.close)(self.handle) };
            if code != 0 {
                warn!("error closing device: code {}", code);
            }
        }
    }
}
