//! Broadcast-FM de-emphasis.

/// Single-pole de-emphasis IIR: `y[n] = y[n-1] + (x[n] - y[n-1]) / a`, in
/// place, with symmetric rounding on the division. State carries across
/// blocks.
#[derive(Debug)]
pub struct Deemphasis {
    a: i32,
    avg: i32,
}

impl Deemphasis {
    /// Coefficient for the 75 µs broadcast time constant at `rate_out`:
    /// `round(1 / (1 - exp(-1 / (rate * 75e-6))))`.
    pub fn coefficient(rate_out: u32) -> i32 {
        (1.0 / (1.0 - (-1.0 / (f64::from(rate_out) * 75e-6)).exp())).round() as i32
    }

    pub fn new(a: i32) -> Self {
        Self { a: a.max(1), avg: 0 }
    }

    pub fn process(&mut self, buf: &mut [i16]) {
        for s in buf.iter_mut() {
            let d = i32::from(*s) - self.avg;
            if d > 0 {
                self.avg += (d + self.a / 2) / self.a;
            } else {
                self.avg += (d - self.a / 2) / self.a;
            }
            *s = self.avg as i16;
        }
    }
}
