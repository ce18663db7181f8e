//! Configuration file support.
//!
//! The scanner reads a single INI file, resolved in this order:
//! 1. the `-c` CLI flag,
//! 2. the `SDRCTL_CONFIG_FILE` environment variable,
//! 3. `/etc/sdrctl/conf.ini`.
//!
//! All values are optional; missing keys fall back to the defaults below.

use std::path::{Path, PathBuf};

use ini::Ini;

use crate::error::ScanError;

pub const CONFIG_FILE_ENV_VAR: &str = "SDRCTL_CONFIG_FILE";
pub const CONFIG_FILE_DEFAULT_LOCATION: &str = "/etc/sdrctl/conf.ini";

/// Hard cap on the expanded channel list.
pub const MAX_FREQS: usize = 1000;

/// Demodulation mode selected in `[params]`.
///
/// WBFM is broadcast FM: it forces the wideband rates, enables de-emphasis,
/// disables the squelch and offsets every channel by +16 kHz.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DemodMode {
    Am,
    Fm,
    Wbfm,
}

impl DemodMode {
    fn parse(s: &str) -> Self {
        match s {
            "fm" => Self::Fm,
            "wbfm" => Self::Wbfm,
            _ => Self::Am,
        }
    }
}

/// One of the network interface sections (`ctrl_interface`,
/// `audio_interface`). Consumed by the serving layers, not by the pipeline.
#[derive(Debug, Clone)]
pub struct NetInterface {
    pub listen_host: String,
    pub listen_port: u16,
    pub network: String,
    pub basic_auth_username: String,
    pub basic_auth_password: String,
}

#[derive(Debug, Clone)]
pub struct AudioOutput {
    /// Output sample rate as a frequency string, e.g. `24k`.
    pub sample_rate: String,
    /// Keep the output clocked to wall time by padding gaps with silence.
    pub pad_gaps: bool,
}

#[derive(Debug, Clone)]
pub struct Scanner {
    /// Serial of the dongle to open; empty picks the first device.
    pub dongle_serial: String,
}

#[derive(Debug, Clone)]
pub struct Params {
    pub demod_mode: DemodMode,
    /// Single listen frequency; takes precedence over the scan range.
    pub freq: String,
    pub scan_begin: String,
    pub scan_end: String,
    pub step: String,
    pub squelch: i32,
    pub ppm_error: i32,
    /// Tuner gain in whole dB; -100 selects the tuner AGC.
    pub gain: i32,
    pub agc: bool,
    /// 9 selects the droop-compensated polyphase decimator, 0 the box
    /// decimator.
    pub fir_size: i32,
}

/// Immutable configuration surface shared by all stages.
#[derive(Debug, Clone)]
pub struct Config {
    pub database: PathBuf,
    pub ctrl_interface: NetInterface,
    pub audio_interface: NetInterface,
    pub audio_output: AudioOutput,
    pub scanner: Scanner,
    pub params: Params,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            database: PathBuf::from("/etc/sdrctl/data.db"),
            ctrl_interface: NetInterface {
                listen_host: "localhost".into(),
                listen_port: 8081,
                network: String::new(),
                basic_auth_username: "admin".into(),
                basic_auth_password: String::new(),
            },
            audio_interface: NetInterface {
                listen_host: "localhost".into(),
                listen_port: 8080,
                network: String::new(),
                basic_auth_username: String::new(),
                basic_auth_password: String::new(),
            },
            audio_output: AudioOutput {
                sample_rate: "24k".into(),
                pad_gaps: false,
            },
            scanner: Scanner {
                dongle_serial: String::new(),
            },
            params: Params {
                demod_mode: DemodMode::Am,
                freq: String::new(),
                scan_begin: String::new(),
                scan_end: String::new(),
                step: String::new(),
                squelch: 0,
                ppm_error: 0,
                gain: -100,
                agc: false,
                fir_size: 0,
            },
        }
    }
}

/// Resolve the config file location from the CLI flag, the environment, or
/// the system default.
pub fn resolve_path(cli_flag: Option<&Path>) -> PathBuf {
    if let Some(path) = cli_flag {
        return path.to_path_buf();
    }
    if let Ok(env_file) = std::env::var(CONFIG_FILE_ENV_VAR) {
        if !env_file.is_empty() {
            return PathBuf::from(env_file);
        }
    }
    PathBuf::from(CONFIG_FILE_DEFAULT_LOCATION)
}

/// Load and validate the configuration at `path`.
pub fn load(path: &Path) -> Result<Config, ScanError> {
    let ini = Ini::load_from_file(path).map_err(|e| match e {
        ini::Error::Io(_) => ScanError::ConfigNotFound,
        ini::Error::Parse(p) => ScanError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: p.to_string(),
        },
    })?;
    let cfg = from_ini(&ini);
    if cfg.params.fir_size != 0 && cfg.params.fir_size != 9 {
        return Err(ScanError::ConfigInvalid {
            path: path.to_path_buf(),
            reason: format!("unsupported fir_size {}", cfg.params.fir_size),
        });
    }
    Ok(cfg)
}

/// Overlay an INI document onto the defaults.
fn from_ini(ini: &Ini) -> Config {
    let mut cfg = Config::default();

    if let Some(db) = ini.section(None::<String>).and_then(|s| s.get("database")) {
        cfg.database = PathBuf::from(db);
    }

    read_iface(ini, "ctrl_interface", &mut cfg.ctrl_interface);
    read_iface(ini, "audio_interface", &mut cfg.audio_interface);

    if let Some(s) = ini.section(Some("audio_output")) {
        if let Some(v) = s.get("sample_rate") {
            cfg.audio_output.sample_rate = v.to_string();
        }
        if let Some(v) = parse_bool(s.get("pad_gaps")) {
            cfg.audio_output.pad_gaps = v;
        }
    }

    if let Some(s) = ini.section(Some("scanner")) {
        if let Some(v) = s.get("dongle_serial") {
            cfg.scanner.dongle_serial = v.to_string();
        }
    }

    if let Some(s) = ini.section(Some("params")) {
        let p = &mut cfg.params;
        if let Some(v) = s.get("demod_mode") {
            p.demod_mode = DemodMode::parse(v);
        }
        if let Some(v) = s.get("freq") {
            p.freq = v.to_string();
        }
        if let Some(v) = s.get("scan_begin") {
            p.scan_begin = v.to_string();
        }
        if let Some(v) = s.get("scan_end") {
            p.scan_end = v.to_string();
        }
        if let Some(v) = s.get("step") {
            p.step = v.to_string();
        }
        if let Some(v) = parse_i32(s.get("squelch")) {
            p.squelch = v;
        }
        if let Some(v) = parse_i32(s.get("ppm_error")) {
            p.ppm_error = v;
        }
        if let Some(v) = parse_i32(s.get("gain")) {
            p.gain = v;
        }
        if let Some(v) = parse_bool(s.get("agc")) {
            p.agc = v;
        }
        if let Some(v) = parse_i32(s.get("fir_size")) {
            p.fir_size = v;
        }
    }

    cfg
}

fn read_iface(ini: &Ini, section: &str, iface: &mut NetInterface) {
    if let Some(s) = ini.section(Some(section)) {
        if let Some(v) = s.get("listen_host") {
            iface.listen_host = v.to_string();
        }
        if let Some(v) = parse_i32(s.get("listen_port")) {
            iface.listen_port = v as u16;
        }
        if let Some(v) = s.get("network") {
            iface.network = v.to_string();
        }
        if let Some(v) = s.get("basic_auth.username") {
            iface.basic_auth_username = v.to_string();
        }
        if let Some(v) = s.get("basic_auth.password") {
            iface.basic_auth_password = v.to_string();
        }
    }
}

fn parse_i32(value: Option<&str>) -> Option<i32> {
    value.and_then(|v| v.trim().parse().ok())
}

fn parse_bool(value: Option<&str>) -> Option<bool> {
    match value.map(|v| v.trim().to_ascii_lowercase()).as_deref() {
        Some("true") | Some("yes") | Some("on") | Some("1") => Some(true),
        Some("false") | Some("no") | Some("off") | Some("0") => Some(false),
        _ => None,
    }
}

/// Convert a frequency string to Hz.
///
/// `90.2M` = 90 200 000, `25K` = 25 000. A value without a `K`/`M` suffix
/// loses its final character before parsing; this is a historical parser
/// artifact preserved for config compatibility.
pub fn freq_hz(freq_str: &str) -> Result<u32, ScanError> {
    let upper = freq_str.trim().to_uppercase();
    let (digits, scale) = if let Some(v) = upper.strip_suffix('K') {
        (v.to_string(), 1e3)
    } else if let Some(v) = upper.strip_suffix('M') {
        (v.to_string(), 1e6)
    } else {
        let mut v = upper.clone();
        v.pop();
        (v, 1.0)
    };
    let parsed: f64 = digits.parse().map_err(|_| ScanError::InvalidFrequency)?;
    if parsed < 0.0 {
        return Err(ScanError::InvalidFrequency);
    }
    Ok((parsed * scale) as u32)
}

impl Config {
    /// Output sample rate in Hz.
    pub fn sample_rate(&self) -> Result<u32, ScanError> {
        freq_hz(&self.audio_output.sample_rate)
    }

    /// Expand the configured channel plan: either the single `freq` or the
    /// inclusive range `scan_begin..=scan_end` stepped by `step`, capped at
    /// [`MAX_FREQS`] entries.
    pub fn listen_freqs(&self) -> Result<Vec<u32>, ScanError> {
        if !self.params.freq.is_empty() {
            return Ok(vec![freq_hz(&self.params.freq)?]);
        }

        let begin = freq_hz(&self.params.scan_begin)?;
        let end = freq_hz(&self.params.scan_end)?;
        let step = freq_hz(&self.params.step)?;
        if step == 0 {
            return Err(ScanError::InvalidFrequency);
        }

        let mut freqs = Vec::new();
        let mut current = begin;
        while current <= end && freqs.len() < MAX_FREQS {
            freqs.push(current);
            match current.checked_add(step) {
                Some(next) => current = next,
                None => break,
            }
        }
        Ok(freqs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_freq_hz_suffixes() {
        assert_eq!(freq_hz("90.2M").unwrap(), 90_200_000);
        assert_eq!(freq_hz("25K").unwrap(), 25_000);
        assert_eq!(freq_hz("25k").unwrap(), 25_000);
        assert_eq!(freq_hz("144m").unwrap(), 144_000_000);
    }

    #[test]
    fn test_freq_hz_drops_trailing_character() {
        // legacy artifact: the last character of a bare value is discarded
        assert_eq!(freq_hz("100000000x").unwrap(), 100_000_000);
        assert_eq!(freq_hz("240000").unwrap(), 24_000);
    }

    #[test]
    fn test_freq_hz_rejects_garbage() {
        assert!(freq_hz("").is_err());
        assert!(freq_hz("M").is_err());
        assert!(freq_hz("hello").is_err());
    }

    #[test]
    fn test_defaults() {
        let cfg = Config::default();
        assert_eq!(cfg.database, PathBuf::from("/etc/sdrctl/data.db"));
        assert_eq!(cfg.ctrl_interface.listen_host, "localhost");
        assert_eq!(cfg.ctrl_interface.listen_port, 8081);
        assert_eq!(cfg.ctrl_interface.basic_auth_username, "admin");
        assert_eq!(cfg.audio_interface.listen_port, 8080);
        assert_eq!(cfg.audio_output.sample_rate, "24k");
        assert!(!cfg.audio_output.pad_gaps);
        assert_eq!(cfg.params.demod_mode, DemodMode::Am);
        assert_eq!(cfg.params.gain, -100);
        assert_eq!(cfg.params.squelch, 0);
        assert_eq!(cfg.sample_rate().unwrap(), 24_000);
    }

    #[test]
    fn test_parse_ini() {
        let ini = Ini::load_from_str(
            r#"
database = /var/lib/sdrctl/data.db

[ctrl_interface]
listen_host = 0.0.0.0
listen_port = 9090
basic_auth.username = operator
basic_auth.password = hunter2

[audio_output]
sample_rate = 32k
pad_gaps = true

[scanner]
dongle_serial = 00000102

[params]
demod_mode = wbfm
freq = 98.1M
squelch = 70
ppm_error = 52
gain = 28
agc = true
"#,
        )
        .unwrap();
        let cfg = from_ini(&ini);
        assert_eq!(cfg.database, PathBuf::from("/var/lib/sdrctl/data.db"));
        assert_eq!(cfg.ctrl_interface.listen_host, "0.0.0.0");
        assert_eq!(cfg.ctrl_interface.listen_port, 9090);
        assert_eq!(cfg.ctrl_interface.basic_auth_username, "operator");
        assert_eq!(cfg.ctrl_interface.basic_auth_password, "hunter2");
        assert_eq!(cfg.audio_output.sample_rate, "32k");
        assert!(cfg.audio_output.pad_gaps);
        assert_eq!(cfg.scanner.dongle_serial, "00000102");
        assert_eq!(cfg.params.demod_mode, DemodMode::Wbfm);
        assert_eq!(cfg.params.freq, "98.1M");
        assert_eq!(cfg.params.squelch, 70);
        assert_eq!(cfg.params.ppm_error, 52);
        assert_eq!(cfg.params.gain, 28);
        assert!(cfg.params.agc);
    }

    #[test]
    fn test_single_freq_takes_precedence() {
        let mut cfg = Config::default();
        cfg.params.freq = "100M".into();
        cfg.params.scan_begin = "144M".into();
        cfg.params.scan_end = "145M".into();
        cfg.params.step = "25K".into();
        assert_eq!(cfg.listen_freqs().unwrap(), vec![100_000_000]);
    }

    #[test]
    fn test_range_expansion_inclusive() {
        let mut cfg = Config::default();
        cfg.params.scan_begin = "144M".into();
        cfg.params.scan_end = "144.5M".into();
        cfg.params.step = "100K".into();
        assert_eq!(
            cfg.listen_freqs().unwrap(),
            vec![
                144_000_000,
                144_100_000,
                144_200_000,
                144_300_000,
                144_400_000,
                144_500_000,
            ]
        );
    }

    #[test]
    fn test_range_expansion_caps_at_limit() {
        let mut cfg = Config::default();
        cfg.params.scan_begin = "100M".into();
        cfg.params.scan_end = "200M".into();
        cfg.params.step = "1K".into();
        assert_eq!(cfg.listen_freqs().unwrap().len(), MAX_FREQS);
    }

    #[test]
    fn test_missing_freqs_is_invalid() {
        let cfg = Config::default();
        assert!(matches!(
            cfg.listen_freqs(),
            Err(ScanError::InvalidFrequency)
        ));
    }
}
