//! Noise generator kernels.
//!
//! Each generator carries its node pair and a small coefficient set
//! installed by the owning device's temperature/load behaviors. At each
//! noise frequency the generator turns the current AC solution into a
//! transfer magnitude for its node pair and returns a PSD contribution
//! in V^2/Hz.

use nalgebra::DVector;
use num_complex::Complex64;

/// Transfer magnitude squared of a node pair under the current AC solution.
fn transfer_sq(ac: &DVector<Complex64>, pos: usize, neg: usize) -> f64 {
    (ac[pos] - ac[neg]).norm_sqr()
}

/// Shot noise: `2 q |I| |H|^2`.
#[derive(Debug, Clone)]
pub struct ShotNoise {
    pos: usize,
    neg: usize,
    /// `2 q |I|`, set from the device's operating-point current.
    coeff: f64,
}

impl ShotNoise {
    pub fn new(pos: usize, neg: usize) -> Self {
        Self { pos, neg, coeff: 0.0 }
    }

    /// `values[0]`: the junction current the shot noise rides on.
    pub fn set_coefficients(&mut self, values: &[f64]) {
        self.coeff = 2.0 * voltaic_core::constants::CHARGE * values[0].abs();
    }

    pub fn calculate(&self, ac: &DVector<Complex64>, _frequency: f64) -> f64 {
        self.coeff * transfer_sq(ac, self.pos, self.neg)
    }
}

/// Thermal noise: `4 k T G |H|^2`.
#[derive(Debug, Clone)]
pub struct ThermalNoise {
    pos: usize,
    neg: usize,
    /// `4 k T G`, set by the temperature behavior.
    coeff: f64,
}

impl ThermalNoise {
    pub fn new(pos: usize, neg: usize) -> Self {
        Self { pos, neg, coeff: 0.0 }
    }

    /// `values[0]`: the full `4 k T G` coefficient.
    pub fn set_coefficients(&mut self, values: &[f64]) {
        self.coeff = values[0];
    }

    pub fn calculate(&self, ac: &DVector<Complex64>, _frequency: f64) -> f64 {
        self.coeff * transfer_sq(ac, self.pos, self.neg)
    }
}

/// Flicker noise: `KF |I|^AF / f * |H|^2`.
#[derive(Debug, Clone)]
pub struct FlickerNoise {
    pos: usize,
    neg: usize,
    /// `KF |I|^AF`, set from the operating point.
    coeff: f64,
}

impl FlickerNoise {
    pub fn new(pos: usize, neg: usize) -> Self {
        Self { pos, neg, coeff: 0.0 }
    }

    /// `values`: `[kf, current, af]`.
    pub fn set_coefficients(&mut self, values: &[f64]) {
        let [kf, current, af] = values else {
            self.coeff = 0.0;
            return;
        };
        self.coeff = kf * current.abs().powf(*af);
    }

    pub fn calculate(&self, ac: &DVector<Complex64>, frequency: f64) -> f64 {
        if frequency <= 0.0 {
            return 0.0;
        }
        self.coeff / frequency * transfer_sq(ac, self.pos, self.neg)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unit_ac(len: usize, node: usize) -> DVector<Complex64> {
        let mut v = DVector::from_element(len, Complex64::new(0.0, 0.0));
        v[node] = Complex64::new(1.0, 0.0);
        v
    }

    #[test]
    fn shot_noise_scales_with_current() {
        let mut shot = ShotNoise::new(1, 0);
        shot.set_coefficients(&[1e-3]);
        let ac = unit_ac(2, 1);
        let psd = shot.calculate(&ac, 1e3);
        let expect = 2.0 * voltaic_core::constants::CHARGE * 1e-3;
        assert!((psd - expect).abs() < expect * 1e-12);
    }

    #[test]
    fn flicker_noise_rolls_off_as_one_over_f() {
        let mut flicker = FlickerNoise::new(1, 0);
        flicker.set_coefficients(&[1e-12, 1e-3, 1.0]);
        let ac = unit_ac(2, 1);
        let p10 = flicker.calculate(&ac, 10.0);
        let p1000 = flicker.calculate(&ac, 1000.0);
        assert!((p10 / p1000 - 100.0).abs() < 1e-9);
    }

    #[test]
    fn transfer_uses_the_node_pair() {
        let mut thermal = ThermalNoise::new(1, 2);
        thermal.set_coefficients(&[1.0]);
        let mut ac = DVector::from_element(3, Complex64::new(0.0, 0.0));
        ac[1] = Complex64::new(3.0, 0.0);
        ac[2] = Complex64::new(1.0, 4.0);
        // H = (3 - 1) - 4j, |H|^2 = 4 + 16
        assert!((thermal.calculate(&ac, 1.0) - 20.0).abs() < 1e-12);
    }
}
