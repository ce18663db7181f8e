//! Demodulation stage: IQ blocks in, PCM audio blocks out, with the power
//! squelch driving the hop signal.

use std::thread::{self, JoinHandle};

use crossbeam_channel::{Receiver, Sender, TrySendError};
use tracing::info;

use crate::config::Config;
use crate::dsp::{am_demod, rms, Agc, Deemphasis, FifthOrderCascade, FmDemod, IqDecimator, PostDecimator};
use crate::error::ScanError;

/// Consecutive squelched blocks before the stage asks for a hop.
pub const CONSEQ_SQUELCH: u32 = 10;

/// Demodulator dispatched inside the chain. WBFM is FM under different
/// configuration, not a third demodulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Modulation {
    Am,
    Fm,
}

/// Demodulation parameters, derived by the controller before spawn.
pub struct DemodStage {
    pub rate_in: u32,
    pub rate_out: u32,
    /// Post-decimation target rate; 0 disables the second decimation.
    pub rate_out2: u32,
    pub downsample: u32,
    pub post_downsample: u32,
    /// Non-zero selects the fifth-order cascade; the controller computes the
    /// actual pass count from the downsample factor.
    pub downsample_passes: u32,
    pub output_scale: i32,
    pub squelch_level: i32,
    pub custom_atan: bool,
    pub deemph: bool,
    pub deemph_a: i32,
    pub modulation: Modulation,
    pub agc_enable: bool,
    squelch_hits: u32,
}

impl DemodStage {
    pub fn new(cfg: &Config) -> Result<Self, ScanError> {
        let rate = cfg.sample_rate()?;
        if rate == 0 {
            return Err(ScanError::StageInit {
                stage: "demod",
                reason: "output sample rate is zero".to_string(),
            });
        }
        Ok(Self {
            rate_in: rate,
            rate_out: rate,
            rate_out2: 0,
            downsample: 1,
            post_downsample: 1,
            downsample_passes: 0,
            output_scale: 1,
            squelch_level: cfg.params.squelch,
            custom_atan: false,
            deemph: false,
            deemph_a: 0,
            modulation: Modulation::Am,
            agc_enable: cfg.params.agc,
            // start latched so a scanner hops straight off a dead channel
            squelch_hits: CONSEQ_SQUELCH + 1,
        })
    }

    pub fn spawn(
        self,
        iq_rx: Receiver<Vec<i16>>,
        audio_tx: Sender<Vec<i16>>,
        hop_tx: Sender<()>,
    ) -> Result<JoinHandle<()>, ScanError> {
        thread::Builder::new()
            .name("demod".to_string())
            .spawn(move || self.run(iq_rx, audio_tx, hop_tx))
            .map_err(|e| ScanError::StageInit {
                stage: "demod",
                reason: e.to_string(),
            })
    }

    fn run(mut self, iq_rx: Receiver<Vec<i16>>, audio_tx: Sender<Vec<i16>>, hop_tx: Sender<()>) {
        let mut chain = DemodChain::new(&self);
        for mut block in iq_rx.iter() {
            self.full_demod(&mut chain, &mut block);

            if self.squelch_level > 0 && self.squelch_hits > CONSEQ_SQUELCH {
                // hair trigger
                self.squelch_hits = CONSEQ_SQUELCH + 1;
                match hop_tx.try_send(()) {
                    // a pending hop already retunes; don't stack another
                    Ok(()) | Err(TrySendError::Full(())) => {}
                    Err(TrySendError::Disconnected(())) => break,
                }
                continue;
            }

            if audio_tx.send(block).is_err() {
                break;
            }
        }
        info!("demod stage exiting");
    }

    /// The full chain: decimate, squelch, demodulate, then the optional
    /// post-processing steps.
    fn full_demod(&mut self, chain: &mut DemodChain, block: &mut Vec<i16>) {
        if self.downsample_passes > 0 {
            chain.cascade.process(block);
        } else {
            chain.decimator.process(block, self.downsample);
        }

        // power squelch
        let mut do_squelch = false;
        if self.squelch_level > 0 {
            let sr = rms(block, 1);
            if sr < self.squelch_level {
                do_squelch = true;
            }
        }
        if do_squelch {
            self.squelch_hits += 1;
            block.fill(0);
        } else {
            self.squelch_hits = 0;
        }

        if self.squelch_level > 0 && self.squelch_hits > CONSEQ_SQUELCH {
            chain.agc.reset();
        }

        match self.modulation {
            Modulation::Am => am_demod(block, self.output_scale),
            Modulation::Fm => chain.fm.process(block),
        }
        if self.agc_enable {
            chain.agc.process(block);
        }
        if self.deemph {
            chain.deemph.process(block);
        }
        if self.rate_out2 > 0 {
            chain
                .post
                .process(block, self.rate_out as i32, self.rate_out2 as i32);
        }
    }
}

/// Stateful filters of the chain, allocated once at spawn. Histories never
/// resize afterwards.
struct DemodChain {
    decimator: IqDecimator,
    cascade: FifthOrderCascade,
    fm: FmDemod,
    agc: Agc,
    deemph: Deemphasis,
    post: PostDecimator,
}

impl DemodChain {
    fn new(stage: &DemodStage) -> Self {
        Self {
            decimator: IqDecimator::new(),
            cascade: FifthOrderCascade::new(stage.downsample_passes.max(1) as usize),
            fm: FmDemod::new(stage.custom_atan),
            agc: Agc::new(),
            deemph: Deemphasis::new(stage.deemph_a),
            post: PostDecimator::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crossbeam_channel::bounded;
    use std::f64::consts::TAU;
    use std::time::Duration;

    fn test_stage(squelch: i32) -> DemodStage {
        let mut cfg = Config::default();
        cfg.params.squelch = squelch;
        let mut stage = DemodStage::new(&cfg).unwrap();
        stage.downsample = 1;
        stage
    }

    #[test]
    fn test_squelch_zeroes_quiet_blocks() {
        let mut stage = test_stage(50);
        let mut chain = DemodChain::new(&stage);
        let mut block = vec![1i16; 256];
        stage.full_demod(&mut chain, &mut block);
        assert!(block.iter().all(|&s| s == 0));
        assert!(stage.squelch_hits > CONSEQ_SQUELCH);
    }

    #[test]
    fn test_loud_block_resets_squelch_hits() {
        let mut stage = test_stage(50);
        let mut chain = DemodChain::new(&stage);
        let mut block: Vec<i16> = (0..256)
            .map(|n| (2000.0 * (TAU * n as f64 / 16.0).sin()) as i16)
            .collect();
        stage.full_demod(&mut chain, &mut block);
        assert_eq!(stage.squelch_hits, 0);
        assert!(block.iter().any(|&s| s != 0));
    }

    #[test]
    fn test_at_most_one_hop_per_block() {
        let stage = test_stage(50);
        let (iq_tx, iq_rx) = bounded::<Vec<i16>>(1);
        let (audio_tx, audio_rx) = bounded::<Vec<i16>>(1);
        let (hop_tx, hop_rx) = bounded::<()>(1);
        let handle = stage.spawn(iq_rx, audio_tx, hop_tx).unwrap();

        for _ in 0..5 {
            iq_tx.send(vec![0i16; 64]).unwrap();
            // exactly one hop signal per quiet block
            hop_rx
                .recv_timeout(Duration::from_secs(1))
                .expect("expected a hop signal");
            assert!(hop_rx.try_recv().is_err());
        }
        assert!(audio_rx.try_recv().is_err());

        drop(iq_tx);
        handle.join().unwrap();
    }

    #[test]
    fn test_audio_flows_without_squelch() {
        let stage = test_stage(0);
        let (iq_tx, iq_rx) = bounded::<Vec<i16>>(1);
        let (audio_tx, audio_rx) = bounded::<Vec<i16>>(1);
        let (hop_tx, hop_rx) = bounded::<()>(1);
        let handle = stage.spawn(iq_rx, audio_tx, hop_tx).unwrap();

        iq_tx.send(vec![100i16; 64]).unwrap();
        let audio = audio_rx.recv_timeout(Duration::from_secs(1)).unwrap();
        assert_eq!(audio.len(), 32); // AM halves the block
        assert!(hop_rx.try_recv().is_err());

        drop(iq_tx);
        handle.join().unwrap();
    }

    /// Wideband FM configuration end to end through the chain: a 75 kHz
    /// deviation 1 kHz tone comes back at 32 kHz with the tone dominant and
    /// no meaningful DC.
    #[test]
    fn test_wbfm_chain_recovers_tone() {
        let mut stage = test_stage(0);
        stage.rate_in = 170_000;
        stage.rate_out = 170_000;
        stage.rate_out2 = 32_000;
        stage.downsample = 6;
        stage.custom_atan = true;
        stage.deemph = true;
        stage.deemph_a = 13;
        stage.modulation = Modulation::Fm;

        let capture_rate = 1_020_000.0;
        let deviation = 75_000.0;
        let tone = 1_000.0;
        let mut chain = DemodChain::new(&stage);
        let mut audio: Vec<i16> = Vec::new();
        let mut phase = 0.0f64;
        let mut n = 0u64;
        for _ in 0..25 {
            let mut block: Vec<i16> = (0..8192)
                .flat_map(|_| {
                    let t = n as f64 / capture_rate;
                    phase += TAU * deviation * (TAU * tone * t).sin() / capture_rate;
                    n += 1;
                    [
                        (90.0 * phase.cos()).round() as i16,
                        (90.0 * phase.sin()).round() as i16,
                    ]
                })
                .collect();
            stage.full_demod(&mut chain, &mut block);
            audio.extend_from_slice(&block);
        }

        // ~25 * 8192 / 6 complex samples at 170 kHz, post-decimated to 32 kHz
        let expected_len = 25.0 * (8192.0 / 6.0) * 32_000.0 / 170_000.0;
        assert!((audio.len() as f64 - expected_len).abs() < 16.0);

        let tail = &audio[2000..];
        let mean: f64 = tail.iter().map(|&s| f64::from(s)).sum::<f64>() / tail.len() as f64;
        let tone_amp = goertzel(tail, tone, 32_000.0);
        let full_scale = f64::from(i16::MAX);
        assert!(
            20.0 * (tone_amp / full_scale).log10() > -20.0,
            "tone at {:.1} dBFS",
            20.0 * (tone_amp / full_scale).log10()
        );
        assert!(
            20.0 * (mean.abs().max(1.0) / full_scale).log10() < -40.0,
            "dc at {:.1} dBFS",
            20.0 * (mean.abs() / full_scale).log10()
        );
    }

    /// Single-bin DFT amplitude estimate.
    fn goertzel(samples: &[i16], freq: f64, rate: f64) -> f64 {
        let mut re = 0.0f64;
        let mut im = 0.0f64;
        for (n, &s) in samples.iter().enumerate() {
            let angle = TAU * freq * n as f64 / rate;
            re += f64::from(s) * angle.cos();
            im -= f64::from(s) * angle.sin();
        }
        2.0 * (re * re + im * im).sqrt() / samples.len() as f64
    }
}
