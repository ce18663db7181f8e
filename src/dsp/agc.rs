//! Software automatic gain control.

/// Fixed-point peak-tracking AGC (Q15 gain).
///
/// Each sample is scaled by `gain_num / gain_den`; the numerator walks down
/// two steps when the scaled sample exceeds the peak target and recovers by
/// one step otherwise, pinned to `[gain_den, gain_max]`.
#[derive(Debug)]
pub struct Agc {
    gain_num: i32,
    gain_den: i32,
    gain_max: i32,
    peak_target: i64,
    attack_step: i32,
    decay_step: i32,
}

impl Agc {
    pub fn new() -> Self {
        Self {
            gain_num: 1 << 15,
            gain_den: 1 << 15,
            gain_max: 256 * (1 << 15),
            peak_target: 1 << 14,
            attack_step: -2,
            decay_step: 1,
        }
    }

    /// Drop back to unity gain (used when the squelch latches).
    pub fn reset(&mut self) {
        self.gain_num = self.gain_den;
    }

    pub fn process(&mut self, buf: &mut [i16]) {
        for s in buf.iter_mut() {
            let scaled = i64::from(*s) * i64::from(self.gain_num) / i64::from(self.gain_den);
            if scaled.abs() > self.peak_target {
                self.gain_num += self.attack_step;
            } else {
                self.gain_num += self.decay_step;
            }
            self.gain_num = self.gain_num.clamp(self.gain_den, self.gain_max);
            *s = scaled.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
        }
    }

    #[cfg(test)]
    fn gain_num(&self) -> i32 {
        self.gain_num
    }
}

impl Default for Agc {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_gain_stays_within_bounds() {
        let mut agc = Agc::new();
        let gain_den = 1 << 15;
        let gain_max = 256 * (1 << 15);

        // quiet input long enough to reach the ceiling
        let mut quiet = vec![1i16; 65536];
        for _ in 0..140 {
            agc.process(&mut quiet);
            assert!(agc.gain_num() >= gain_den);
            assert!(agc.gain_num() <= gain_max);
        }
        assert_eq!(agc.gain_num(), gain_max);

        // loud input: gain falls but never below unity
        let mut loud = vec![i16::MAX; 4 * 65536];
        agc.process(&mut loud);
        assert!(agc.gain_num() >= gain_den);
        assert!(agc.gain_num() <= gain_max);
    }

    #[test]
    fn test_quiet_signal_is_amplified() {
        let mut agc = Agc::new();
        let mut buf = vec![64i16; 65536];
        agc.process(&mut buf);
        let first = buf[0];
        let last = buf[buf.len() - 1];
        assert_eq!(first, 64);
        assert!(last > first, "gain never recovered: {last}");
    }

    #[test]
    fn test_loud_signal_clamps_to_int16() {
        let mut agc = Agc::new();
        // push gain up first
        let mut quiet = vec![16i16; 1 << 18];
        agc.process(&mut quiet);
        let mut loud = vec![i16::MAX; 16];
        agc.process(&mut loud);
        assert!(loud.iter().all(|&s| s <= i16::MAX && s >= 0));
    }

    #[test]
    fn test_reset_returns_to_unity() {
        let mut agc = Agc::new();
        let mut quiet = vec![16i16; 4096];
        agc.process(&mut quiet);
        assert!(agc.gain_num() > 1 << 15);
        agc.reset();
        assert_eq!(agc.gain_num(), 1 << 15);
    }
}
