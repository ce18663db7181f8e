//! Tuner device abstraction.
//!
//! The pipeline consumes the tuner through the [`TunerDevice`] trait so the
//! stages can run against a mock in tests; [`rtlsdr`] provides the
//! dynamically-loaded librtlsdr implementation.

pub mod rtlsdr;

use thiserror::Error;

/// Sentinel gain meaning "let the tuner AGC decide".
pub const AUTO_GAIN: i32 = -100;

#[derive(Debug, Clone, Error)]
pub enum TunerError {
    #[error("librtlsdr not found - install the rtl-sdr package")]
    LibraryNotFound,

    #[error("no rtlsdr devices connected")]
    NoDevicesAvailable,

    #[error("no device with serial '{0}'")]
    SerialNotFound(String),

    #[error("device open failed: error code {0}")]
    OpenFailed(i32),

    #[error("{op} failed for {value}: error code {code}")]
    ControlFailed {
        op: &'static str,
        value: i64,
        code: i32,
    },

    #[error("tuner advertises no gain values")]
    NoGainValues,

    #[error("async read failed: error code {0}")]
    ReadFailed(i32),
}

/// Control and streaming surface of an RTL2832U-style tuner.
///
/// Control calls may be issued from a different thread than the one blocked
/// in [`read_async`](TunerDevice::read_async); implementations serialize
/// them internally.
pub trait TunerDevice: Send + Sync {
    fn set_tuner_gain_mode(&self, auto: bool) -> Result<(), TunerError>;
    /// Set a manual gain in tenths of a dB.
    fn set_tuner_gain(&self, tenths_db: i32) -> Result<(), TunerError>;
    /// Advertised gain table in tenths of a dB.
    fn tuner_gains(&self) -> Result<Vec<i32>, TunerError>;
    fn set_freq_correction(&self, ppm: i32) -> Result<(), TunerError>;
    fn set_center_freq(&self, hz: u32) -> Result<(), TunerError>;
    fn set_sample_rate(&self, hz: u32) -> Result<(), TunerError>;
    /// Reset the streaming endpoint; mandatory before the first read.
    fn reset_buffer(&self) -> Result<(), TunerError>;

    /// Stream raw 8-bit unsigned IQ buffers into `cb` until
    /// [`cancel_async`](TunerDevice::cancel_async) is called. Buffers arrive
    /// in FIFO order on the driver's thread.
    fn read_async(&self, buf_len: usize, cb: &mut dyn FnMut(&mut [u8])) -> Result<(), TunerError>;

    /// Unblock a concurrent [`read_async`](TunerDevice::read_async).
    fn cancel_async(&self) -> Result<(), TunerError>;
}

/// Closest supported gain to `target` (tenths of a dB). Ties resolve to the
/// smaller gain.
pub fn nearest_gain(device: &dyn TunerDevice, target: i32) -> Result<i32, TunerError> {
    let mut gains = device.tuner_gains()?;
    gains.sort_unstable();
    gains
        .iter()
        .copied()
        .min_by_key(|g| (g - target).abs())
        .ok_or(TunerError::NoGainValues)
}
