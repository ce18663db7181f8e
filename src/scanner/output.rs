//! Output stage: little-endian int16 PCM sink with optional wall-clock gap
//! padding.

use std::fs::File;
use std::io::{BufWriter, Write};
use std::path::PathBuf;
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use crossbeam_channel::{select, tick, Receiver};
use tracing::{info, warn};

use crate::config::Config;
use crate::error::ScanError;

/// Legacy sink name; header-less raw PCM despite the extension.
pub const DEBUG_FILE_OUTPUT: &str = "example.wav";

const PAD_TICK: Duration = Duration::from_millis(10);

pub struct OutputStage {
    pub rate: u32,
    pad: bool,
    path: PathBuf,
}

impl OutputStage {
    pub fn new(cfg: &Config) -> Result<Self, ScanError> {
        Ok(Self {
            rate: cfg.sample_rate()?,
            pad: cfg.audio_output.pad_gaps,
            path: PathBuf::from(DEBUG_FILE_OUTPUT),
        })
    }

    /// Redirect the sink; tests write into a temp file.
    #[cfg(test)]
    pub fn set_path(&mut self, path: impl Into<PathBuf>) {
        self.path = path.into();
    }

    pub fn spawn(self, audio_rx: Receiver<Vec<i16>>) -> Result<JoinHandle<()>, ScanError> {
        let file = File::create(&self.path).map_err(|e| ScanError::StageInit {
            stage: "output",
            reason: format!("{}: {}", self.path.display(), e),
        })?;
        thread::Builder::new()
            .name("output".to_string())
            .spawn(move || self.run(file, audio_rx))
            .map_err(|e| ScanError::StageInit {
                stage: "output",
                reason: e.to_string(),
            })
    }

    fn run(self, file: File, audio_rx: Receiver<Vec<i16>>) {
        let mut sink = BufWriter::new(file);
        if self.pad {
            self.run_padded(&mut sink, audio_rx);
        } else {
            for block in audio_rx.iter() {
                write_block(&mut sink, &block);
            }
        }
        if let Err(e) = sink.flush() {
            warn!("output flush error: {}", e);
        }
        info!("output stage exiting");
    }

    /// Keep the file clocked to wall time: every 10 ms, top the written
    /// sample count up to `elapsed * rate` with silence. Real audio advances
    /// the same counter, so padding only fills actual gaps.
    fn run_padded(&self, sink: &mut BufWriter<File>, audio_rx: Receiver<Vec<i16>>) {
        let start = Instant::now();
        let mut samples: u64 = 0;
        let ticker = tick(PAD_TICK);
        loop {
            select! {
                recv(audio_rx) -> block => match block {
                    Ok(block) => {
                        samples += block.len() as u64;
                        write_block(sink, &block);
                    }
                    Err(_) => break,
                },
                recv(ticker) -> _ => {
                    let samples_now =
                        start.elapsed().as_micros() as u64 * u64::from(self.rate) / 1_000_000;
                    if samples_now <= samples {
                        continue;
                    }
                    let pad = vec![0i16; (samples_now - samples) as usize];
                    write_block(sink, &pad);
                    samples = samples_now;
                }
            }
        }
    }
}

/// Best-effort write; errors are logged and the block is dropped.
fn write_block(sink: &mut impl Write, block: &[i16]) {
    let mut bytes = Vec::with_capacity(block.len() * 2);
    for s in block {
        bytes.extend_from_slice(&s.to_le_bytes());
    }
    if let Err(e) = sink.write_all(&bytes) {
        warn!("output write error: {}", e);
    }
}
