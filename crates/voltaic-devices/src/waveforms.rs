//! Time-varying source waveforms.

/// Waveform of an independent source during transient analysis.
#[derive(Debug, Clone, PartialEq)]
pub enum Waveform {
    /// Constant value.
    Dc(f64),
    /// Trapezoidal pulse train.
    Pulse {
        v1: f64,
        v2: f64,
        delay: f64,
        rise: f64,
        fall: f64,
        width: f64,
        period: f64,
    },
    /// Damped sine.
    Sin {
        offset: f64,
        amplitude: f64,
        frequency: f64,
        delay: f64,
        theta: f64,
    },
}

impl Waveform {
    /// Evaluate the waveform at time `t`.
    pub fn value_at(&self, t: f64) -> f64 {
        match *self {
            Waveform::Dc(v) => v,
            Waveform::Pulse {
                v1,
                v2,
                delay,
                rise,
                fall,
                width,
                period,
            } => {
                if t < delay {
                    return v1;
                }
                let mut tp = t - delay;
                if period > 0.0 {
                    tp %= period;
                }
                if tp < rise {
                    v1 + (v2 - v1) * tp / rise
                } else if tp < rise + width {
                    v2
                } else if tp < rise + width + fall {
                    v2 + (v1 - v2) * (tp - rise - width) / fall
                } else {
                    v1
                }
            }
            Waveform::Sin {
                offset,
                amplitude,
                frequency,
                delay,
                theta,
            } => {
                if t < delay {
                    return offset;
                }
                let tp = t - delay;
                let damp = if theta > 0.0 { (-tp * theta).exp() } else { 1.0 };
                offset + amplitude * damp * (2.0 * std::f64::consts::PI * frequency * tp).sin()
            }
        }
    }

    /// The value the DC operating point sees.
    pub fn dc_value(&self) -> f64 {
        match *self {
            Waveform::Dc(v) => v,
            // pulse and sine start from their t=0 value
            Waveform::Pulse { v1, .. } => v1,
            Waveform::Sin { offset, .. } => offset,
        }
    }
}
