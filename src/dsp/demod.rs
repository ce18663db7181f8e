//! AM and FM demodulators.

use std::f64::consts::PI;

/// Half a turn of the discriminator maps to 2^14.
const ANGLE_SCALE: f64 = (1 << 14) as f64;

/// AM envelope detector: `|I + jQ|` scaled by `output_scale` and clamped to
/// int16. Halves the block (complex in, real out).
pub fn am_demod(buf: &mut Vec<i16>, output_scale: i32) {
    let mut out = 0;
    let mut i = 0;
    while i + 1 < buf.len() {
        let re = i32::from(buf[i]);
        let im = i32::from(buf[i + 1]);
        let power = re * re + im * im;
        let pcm = (f64::from(power).sqrt() * f64::from(output_scale)).round() as i64;
        buf[out] = pcm.clamp(i64::from(i16::MIN), i64::from(i16::MAX)) as i16;
        out += 1;
        i += 2;
    }
    buf.truncate(out);
}

/// FM quadrature discriminator with cross-block phase carry.
///
/// Each output sample is the phase difference between consecutive complex
/// samples, scaled so ±π maps to ±2^14. Halves the block.
#[derive(Debug)]
pub struct FmDemod {
    pre_r: i64,
    pre_j: i64,
    custom_atan: bool,
}

impl FmDemod {
    /// `custom_atan` swaps the libm `atan2` for the polynomial estimate.
    pub fn new(custom_atan: bool) -> Self {
        Self {
            pre_r: 0,
            pre_j: 0,
            custom_atan,
        }
    }

    pub fn process(&mut self, buf: &mut Vec<i16>) {
        let mut out = 0;
        let mut i = 0;
        let (mut pre_r, mut pre_j) = (self.pre_r, self.pre_j);
        while i + 1 < buf.len() {
            let re = i64::from(buf[i]);
            let im = i64::from(buf[i + 1]);
            let num = re * pre_j - im * pre_r;
            let den = re * pre_r + im * pre_j;
            let pcm = if self.custom_atan {
                fast_atan2(num, den)
            } else {
                polar_disc(num, den)
            };
            buf[out] = pcm as i16;
            pre_r = re;
            pre_j = im;
            out += 1;
            i += 2;
        }
        self.pre_r = pre_r;
        self.pre_j = pre_j;
        buf.truncate(out);
    }
}

fn polar_disc(num: i64, den: i64) -> i32 {
    let angle = (num as f64).atan2(den as f64);
    (angle / PI * ANGLE_SCALE) as i32
}

/// Polynomial `atan2` in discriminator units (π ≡ 2^14), avoiding the libm
/// call on the per-sample path.
///
/// Octant reduction to `|z| <= 1` followed by a degree-11 odd minimax
/// polynomial; the result stays within one LSB of [`polar_disc`] away from
/// the axes of the unit square.
fn fast_atan2(y: i64, x: i64) -> i32 {
    if x == 0 && y == 0 {
        return 0;
    }
    let yf = y as f64;
    let xf = x as f64;
    let angle = if yf.abs() <= xf.abs() {
        let core = atan_poly(yf / xf);
        if xf > 0.0 {
            core
        } else if yf >= 0.0 {
            core + PI
        } else {
            core - PI
        }
    } else {
        let core = atan_poly(xf / yf);
        if yf > 0.0 {
            PI / 2.0 - core
        } else {
            -PI / 2.0 - core
        }
    };
    (angle / PI * ANGLE_SCALE) as i32
}

/// Odd minimax approximation of atan on [-1, 1].
fn atan_poly(z: f64) -> f64 {
    let z2 = z * z;
    z * (0.999_977_26
        + z2 * (-0.332_623_47
            + z2 * (0.193_543_46
                + z2 * (-0.116_432_87 + z2 * (0.052_653_32 + z2 * -0.011_721_20)))))
}
