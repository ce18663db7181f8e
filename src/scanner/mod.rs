//! Pipeline supervision: stage construction, tuner configuration and the
//! frequency-hop control loop.
//!
//! Data flow: tuner → acquisition → demod → output, over capacity-1
//! channels so a slow stage backpressures its producer instead of dropping
//! samples. Control flow: demod → controller (hop) → tuner retune.

mod acquisition;
mod demod;
mod output;

pub use acquisition::AcquisitionStage;
pub use demod::{DemodStage, Modulation};
pub use output::OutputStage;

use std::sync::Arc;

use crossbeam_channel::{bounded, select, Receiver, Sender};
use tracing::{debug, info};

use crate::config::{Config, DemodMode};
use crate::dsp::{Deemphasis, DEFAULT_BUF_LEN, LCM_POST};
use crate::error::ScanError;
use crate::tuner::{self, nearest_gain, TunerDevice, AUTO_GAIN};

/// Default tuner rate before the capture rate is derived.
pub const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Lowest capture rate the tuner runs well at; the downsample factor is
/// chosen to land just above it.
const MINIMUM_RATE: u32 = 1_000_000;

const MAX_DOWNSAMPLE: u32 = 256;

/// Bytes of the first post-hop buffer replaced with the neutral value to
/// swallow the retune transient.
const BUFFER_DUMP: usize = 4096;

/// WBFM channels listen 16 kHz above the nominal carrier.
const WBFM_OFFSET: u32 = 16_000;

/// Quit trigger for the control loop; signals by disconnecting.
pub struct Shutdown {
    _tx: Sender<()>,
}

impl Shutdown {
    fn new() -> (Self, Receiver<()>) {
        let (tx, rx) = bounded(0);
        (Self { _tx: tx }, rx)
    }

    /// Consume the handle, waking the controller.
    pub fn trigger(self) {}
}

/// Aggregate root of the pipeline. Owns the stages, derives their
/// parameters, and runs the hop loop.
pub struct Controller {
    cfg: Config,
    freqs: Vec<u32>,
    freq_now: usize,
    acquisition: AcquisitionStage,
    demod: DemodStage,
    output: OutputStage,
    quit: Receiver<()>,
}

impl Controller {
    /// Validate the channel plan and construct the stages.
    pub fn new(cfg: Config) -> Result<(Self, Shutdown), ScanError> {
        let freqs = cfg.listen_freqs()?;
        if freqs.is_empty() {
            return Err(ScanError::InvalidFrequency);
        }
        if freqs.len() > 1 && cfg.params.squelch == 0 {
            return Err(ScanError::SquelchRequired);
        }

        let acquisition = AcquisitionStage::new(&cfg);
        let demod = DemodStage::new(&cfg)?;
        let output = OutputStage::new(&cfg)?;
        let (shutdown, quit) = Shutdown::new();
        Ok((
            Self {
                cfg,
                freqs,
                freq_now: 0,
                acquisition,
                demod,
                output,
                quit,
            },
            shutdown,
        ))
    }

    #[cfg(test)]
    fn set_output_path(&mut self, path: impl Into<std::path::PathBuf>) {
        self.output.set_path(path);
    }

    /// Open the tuner named in the config and run the pipeline until
    /// shutdown.
    pub fn run(self) -> Result<(), ScanError> {
        let device: Arc<dyn TunerDevice> =
            Arc::new(tuner::rtlsdr::open(&self.cfg.scanner.dongle_serial)?);
        self.run_with(device)
    }

    /// Derive mode-dependent demod parameters.
    fn configure_demod(&mut self) {
        let d = &mut self.demod;
        match self.cfg.params.demod_mode {
            DemodMode::Wbfm => {
                d.custom_atan = true;
                d.deemph = true;
                d.squelch_level = 0;
                d.rate_in = 170_000;
                d.rate_out = 170_000;
                d.rate_out2 = 32_000;
                self.output.rate = 32_000;
                d.modulation = Modulation::Fm;
            }
            DemodMode::Fm => d.modulation = Modulation::Fm,
            DemodMode::Am => d.modulation = Modulation::Am,
        }

        if self.cfg.params.fir_size == 9 {
            // flag value; optimal_settings computes the real pass count
            d.downsample_passes = 1;
        }

        // quadruple sample rate to bound the per-sample phase step to ±π/2
        d.rate_in *= d.post_downsample;

        if self.output.rate == 0 {
            self.output.rate = d.rate_out;
        }

        if d.deemph {
            d.deemph_a = Deemphasis::coefficient(d.rate_out);
            info!("de-emphasis coefficient {}", d.deemph_a);
        }
    }

    /// Apply gain, PPM correction and the mandatory buffer reset.
    fn configure_dongle(&mut self, device: &dyn TunerDevice) -> Result<(), ScanError> {
        if self.acquisition.gain == AUTO_GAIN {
            info!("setting tuner gain to auto");
            device.set_tuner_gain_mode(true)?;
        } else {
            // config gain is whole dB; the tuner takes tenths
            let target = self.acquisition.gain * 10;
            let gain = nearest_gain(device, target)?;
            device.set_tuner_gain_mode(false)?;
            device.set_tuner_gain(gain)?;
            self.acquisition.gain = gain;
            info!("set tuner gain to {:.1} dB", f64::from(gain) / 10.0);
        }

        if self.acquisition.ppm_error > 0 {
            device.set_freq_correction(self.acquisition.ppm_error)?;
            info!("set error to {} ppm", self.acquisition.ppm_error);
        }

        device.reset_buffer()?;
        Ok(())
    }

    /// Choose capture frequency, capture rate and output scaling for `freq`.
    fn optimal_settings(&mut self, freq: u32) {
        let d = &mut self.demod;
        d.downsample = (MINIMUM_RATE / d.rate_in + 1).min(MAX_DOWNSAMPLE);
        if d.downsample_passes > 0 {
            d.downsample_passes = (d.downsample.ilog2() + 1).min(8);
            d.downsample = 1 << d.downsample_passes;
        }

        let capture_rate = d.downsample * d.rate_in;
        // when pre-rotating, capture a quarter rate above the channel; the
        // rotation shifts it back down to baseband
        let capture_freq = if self.acquisition.pre_rotate {
            freq + capture_rate / 4
        } else {
            freq
        };

        d.output_scale = ((1 << 15) / (128 * d.downsample as i32)).max(1);
        if d.modulation == Modulation::Fm {
            d.output_scale = 1;
        }

        self.acquisition.freq = capture_freq;
        self.acquisition.rate = capture_rate;
    }

    /// Everything that happens before the stages start: parameter
    /// derivation, tuner configuration, initial tune. Returns the tuner
    /// block size in bytes.
    fn prepare(&mut self, device: &dyn TunerDevice) -> Result<usize, ScanError> {
        self.configure_demod();
        self.configure_dongle(device)?;

        if self.cfg.params.demod_mode == DemodMode::Wbfm {
            for f in &mut self.freqs {
                *f += WBFM_OFFSET;
            }
        }

        self.optimal_settings(self.freqs[0]);
        device.set_center_freq(self.acquisition.freq)?;
        info!("tuned to {} Hz", self.acquisition.freq);

        let actual_buf_len = LCM_POST[self.demod.post_downsample as usize] * DEFAULT_BUF_LEN;
        info!("oversampling input by {}x", self.demod.downsample);
        info!("oversampling output by {}x", self.demod.post_downsample);
        info!(
            "buffer size: {:.2}ms",
            1000.0 * 0.5 * actual_buf_len as f64 / f64::from(self.acquisition.rate)
        );

        device.set_sample_rate(self.acquisition.rate)?;
        info!("sampling at {} S/s", self.acquisition.rate);
        info!(
            "output at {} Hz",
            self.demod.rate_in / self.demod.post_downsample
        );

        Ok(actual_buf_len)
    }

    /// Run the pipeline against an already-open device.
    pub fn run_with(mut self, device: Arc<dyn TunerDevice>) -> Result<(), ScanError> {
        let buf_len = self.prepare(device.as_ref())?;

        let Controller {
            freqs,
            mut freq_now,
            acquisition,
            demod,
            output,
            quit,
            ..
        } = self;

        let (iq_tx, iq_rx) = bounded::<Vec<i16>>(1);
        let (audio_tx, audio_rx) = bounded::<Vec<i16>>(1);
        let (hop_tx, hop_rx) = bounded::<()>(1);
        // Stage cancellation: dropping the sender wakes the watchdog.
        let (stage_shutdown_tx, stage_shutdown_rx) = bounded::<()>(0);

        let capture_rate = acquisition.rate;
        let pre_rotate = acquisition.pre_rotate;

        let output_handle = output.spawn(audio_rx)?;
        let demod_handle = demod.spawn(iq_rx, audio_tx, hop_tx)?;
        let acq_handle = acquisition.spawn(device.clone(), buf_len, iq_tx, stage_shutdown_rx)?;

        let mut result = Ok(());
        loop {
            select! {
                recv(quit) -> _ => {
                    info!("controller: shutdown requested");
                    break;
                }
                recv(hop_rx) -> msg => {
                    if msg.is_err() {
                        // demod stage gone; the stream ended underneath us
                        debug!("hop channel closed");
                        break;
                    }
                    if freqs.len() <= 1 {
                        continue;
                    }
                    freq_now = (freq_now + 1) % freqs.len();
                    let freq = freqs[freq_now];
                    // the capture rate is identical on every channel, so
                    // only the center frequency needs recomputing
                    let capture_freq = if pre_rotate {
                        freq + capture_rate / 4
                    } else {
                        freq
                    };
                    acquisition.pause();
                    if let Err(e) = device.set_center_freq(capture_freq) {
                        result = Err(e.into());
                        acquisition.resume();
                        break;
                    }
                    acquisition.schedule_mute(BUFFER_DUMP);
                    acquisition.resume();
                    debug!("hopped to {} Hz", freq);
                }
            }
        }

        drop(stage_shutdown_tx);
        let _ = acq_handle.join();
        let _ = demod_handle.join();
        let _ = output_handle.join();
        info!("controller exiting");
        result
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
    use std::sync::Mutex;
    use std::time::Duration;

    use crate::tuner::{TunerDevice, TunerError};

    type SignalFn = Box<dyn Fn(u64, &mut [u8]) + Send + Sync>;

    /// Scripted tuner: delivers `blocks` buffers from a signal generator,
    /// then ends the stream (or idles until cancelled when `blocks` is
    /// `usize::MAX`). Control calls are recorded for assertions.
    pub struct MockTuner {
        gains: Vec<i32>,
        blocks: usize,
        pace: Option<Duration>,
        signal: SignalFn,
        pub cancelled: AtomicBool,
        pub cancel_calls: AtomicUsize,
        pub center_freqs: Mutex<Vec<u32>>,
        pub sample_rates: Mutex<Vec<u32>>,
    }

    impl MockTuner {
        pub fn new(blocks: usize, signal: impl Fn(u64, &mut [u8]) + Send + Sync + 'static) -> Self {
            Self {
                gains: vec![0, 9, 14, 27, 37, 77, 87, 125, 144, 157, 166, 197],
                blocks,
                pace: None,
                signal: Box::new(signal),
                cancelled: AtomicBool::new(false),
                cancel_calls: AtomicUsize::new(0),
                center_freqs: Mutex::new(Vec::new()),
                sample_rates: Mutex::new(Vec::new()),
            }
        }

        /// All-neutral buffers (zero signal).
        pub fn silent(blocks: usize) -> Self {
            Self::new(blocks, |_, buf| buf.fill(127))
        }

        /// Silence until cancelled, pacing one buffer per millisecond.
        pub fn endless_silence() -> Self {
            let mut mock = Self::silent(usize::MAX);
            mock.pace = Some(Duration::from_millis(1));
            mock
        }
    }

    impl TunerDevice for MockTuner {
        fn set_tuner_gain_mode(&self, _auto: bool) -> Result<(), TunerError> {
            Ok(())
        }

        fn set_tuner_gain(&self, _tenths_db: i32) -> Result<(), TunerError> {
            Ok(())
        }

        fn tuner_gains(&self) -> Result<Vec<i32>, TunerError> {
            Ok(self.gains.clone())
        }

        fn set_freq_correction(&self, _ppm: i32) -> Result<(), TunerError> {
            Ok(())
        }

        fn set_center_freq(&self, hz: u32) -> Result<(), TunerError> {
            self.center_freqs.lock().unwrap().push(hz);
            Ok(())
        }

        fn set_sample_rate(&self, hz: u32) -> Result<(), TunerError> {
            self.sample_rates.lock().unwrap().push(hz);
            Ok(())
        }

        fn reset_buffer(&self) -> Result<(), TunerError> {
            Ok(())
        }

        fn read_async(
            &self,
            buf_len: usize,
            cb: &mut dyn FnMut(&mut [u8]),
        ) -> Result<(), TunerError> {
            let mut buf = vec![0u8; buf_len];
            let mut offset = 0u64;
            for _ in 0..self.blocks {
                if self.cancelled.load(Ordering::SeqCst) {
                    return Ok(());
                }
                (self.signal)(offset, &mut buf);
                cb(&mut buf);
                offset += buf_len as u64;
                if let Some(pace) = self.pace {
                    std::thread::sleep(pace);
                }
            }
            Ok(())
        }

        fn cancel_async(&self) -> Result<(), TunerError> {
            self.cancel_calls.fetch_add(1, Ordering::SeqCst);
            self.cancelled.store(true, Ordering::SeqCst);
            Ok(())
        }
    }
}
