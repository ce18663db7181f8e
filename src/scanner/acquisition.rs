//! Acquisition stage: tuner callback bytes → centered int16 IQ blocks.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender};
use tracing::{debug, info, warn};

use crate::config::Config;
use crate::dsp::rotate90;
use crate::error::ScanError;
use crate::tuner::TunerDevice;

use super::DEFAULT_SAMPLE_RATE;

/// Neutral wire value: the pre-centering midpoint of the 8-bit format.
const NEUTRAL_BYTE: u8 = 127;

/// Owns the streaming side of the tuner. Capture frequency and rate are
/// filled in by the controller before the stage is spawned.
pub struct AcquisitionStage {
    pub gain: i32,
    pub ppm_error: i32,
    pub pre_rotate: bool,
    pub rate: u32,
    pub freq: u32,
    paused: Arc<AtomicBool>,
    mute: Arc<AtomicUsize>,
}

impl AcquisitionStage {
    pub fn new(cfg: &Config) -> Self {
        Self {
            gain: cfg.params.gain,
            ppm_error: cfg.params.ppm_error,
            pre_rotate: true,
            rate: DEFAULT_SAMPLE_RATE,
            freq: 0,
            paused: Arc::new(AtomicBool::new(false)),
            mute: Arc::new(AtomicUsize::new(0)),
        }
    }

    /// Discard tuner buffers until [`resume`](Self::resume).
    pub fn pause(&self) {
        self.paused.store(true, Ordering::Relaxed);
    }

    pub fn resume(&self) {
        self.paused.store(false, Ordering::Relaxed);
    }

    /// Overwrite the first `bytes` of the next buffer with the neutral
    /// value, swallowing the tuner settling transient after a retune.
    pub fn schedule_mute(&self, bytes: usize) {
        self.mute.store(bytes, Ordering::Release);
    }

    /// Spawn the streaming thread plus the watchdog that unblocks it.
    ///
    /// The watchdog waits for `shutdown` to disconnect, then issues the
    /// single `cancel_async` that makes the blocking `read_async` return.
    pub fn spawn(
        &self,
        device: Arc<dyn TunerDevice>,
        buf_len: usize,
        iq_tx: Sender<Vec<i16>>,
        shutdown: Receiver<()>,
    ) -> Result<JoinHandle<()>, ScanError> {
        let paused = self.paused.clone();
        let mute = self.mute.clone();
        let pre_rotate = self.pre_rotate;

        let watchdog_device = device.clone();
        let watchdog = thread::Builder::new()
            .name("acq-watchdog".to_string())
            .spawn(move || {
                let _ = shutdown.recv();
                debug!("acquisition watchdog: cancelling async read");
                if let Err(e) = watchdog_device.cancel_async() {
                    warn!("cancel_async failed: {}", e);
                }
            })
            .map_err(|e| ScanError::StageInit {
                stage: "acquisition",
                reason: e.to_string(),
            })?;

        thread::Builder::new()
            .name("acquisition".to_string())
            .spawn(move || {
                let mut callback = |buf: &mut [u8]| {
                    if paused.load(Ordering::Relaxed) {
                        return;
                    }
                    let m = mute.swap(0, Ordering::AcqRel);
                    if m > 0 {
                        let n = m.min(buf.len());
                        buf[..n].fill(NEUTRAL_BYTE);
                    }
                    if pre_rotate {
                        rotate90(buf);
                    }
                    let block: Vec<i16> = buf.iter().map(|&b| i16::from(b) - 127).collect();
                    // Bounded send: backpressure from a slow demod stage is
                    // preferable to dropping samples.
                    if iq_tx.send(block).is_err() {
                        debug!("iq channel closed");
                    }
                };
                if let Err(e) = device.read_async(buf_len, &mut callback) {
                    warn!("async read ended: {}", e);
                }
                info!("acquisition stage exiting");
                let _ = watchdog.join();
            })
            .map_err(|e| ScanError::StageInit {
                stage: "acquisition",
                reason: e.to_string(),
            })
    }
}
