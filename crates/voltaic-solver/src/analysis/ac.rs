//! Small-signal AC analysis.
//!
//! Solves the operating point, then per frequency assembles the complex
//! plane from every AcLoad behavior and performs one complex solve.

use nalgebra::DVector;
use num_complex::Complex64;
use num_traits::Zero;

use voltaic_core::behavior::BehaviorKind;
use voltaic_core::matrix::FactorOutcome;
use voltaic_core::{
    AnalysisConfig, CancelToken, Circuit, Error, PointLabel, Result, ResultSink,
};

use crate::simulation::Simulation;

/// Frequency spacing of an AC sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Variation {
    /// `points` per decade.
    Decade,
    /// `points` per octave.
    Octave,
    /// `points` total, linearly spaced.
    Linear,
}

/// AC sweep specification.
#[derive(Debug, Clone)]
pub struct AcSweep {
    pub variation: Variation,
    pub points: usize,
    pub fstart: f64,
    pub fstop: f64,
}

impl AcSweep {
    /// The frequency points of the sweep (Hz).
    pub fn frequencies(&self) -> Vec<f64> {
        let mut freqs = Vec::new();
        match self.variation {
            Variation::Linear => {
                let n = self.points.max(2);
                let step = (self.fstop - self.fstart) / (n - 1) as f64;
                for i in 0..n {
                    freqs.push(self.fstart + step * i as f64);
                }
            }
            Variation::Decade | Variation::Octave => {
                let base: f64 = if self.variation == Variation::Decade {
                    10.0
                } else {
                    2.0
                };
                let ratio = base.powf(1.0 / self.points.max(1) as f64);
                let mut f = self.fstart;
                while f <= self.fstop * (1.0 + 1e-9) {
                    freqs.push(f);
                    f *= ratio;
                }
            }
        }
        freqs
    }
}

/// Run an AC sweep. Returns `(frequency, complex solution)` per point.
pub fn run_ac(
    circuit: &Circuit,
    config: AnalysisConfig,
    sweep: &AcSweep,
    sink: &mut dyn ResultSink,
    cancel: CancelToken,
) -> Result<(Simulation, Vec<(f64, DVector<Complex64>)>)> {
    let mut sim = Simulation::build(
        circuit,
        config,
        &[
            BehaviorKind::Temperature,
            BehaviorKind::Load,
            BehaviorKind::AcLoad,
        ],
    )?;
    sim.cancel = cancel;
    sim.setup()?;
    sim.run_temperature()?;
    sim.solve_op()?;
    // refresh small-signal parameters at the converged bias point
    sim.load()?;

    let mut results = Vec::new();
    let mut x = DVector::from_element(sim.solution().len(), Complex64::zero());
    for frequency in sweep.frequencies() {
        sim.cancel.check()?;
        solve_ac(&mut sim, frequency, &mut x)?;
        sink.begin_point(PointLabel::Frequency(frequency));
        for i in 1..x.len() {
            sink.node_complex(i, x[i]);
        }
        results.push((frequency, x.clone()));
    }
    Ok((sim, results))
}

/// One complex assembly and solve at `frequency`.
pub(crate) fn solve_ac(
    sim: &mut Simulation,
    frequency: f64,
    x: &mut DVector<Complex64>,
) -> Result<()> {
    let omega = 2.0 * std::f64::consts::PI * frequency;
    sim.mna.clear_complex();
    for set in sim.behaviors.values() {
        if let Some(ac) = &set.ac_load {
            ac.borrow_mut().ac_load(&mut sim.mna, &sim.state, omega)?;
        }
    }
    match sim.mna.factor_complex() {
        FactorOutcome::Ok => {}
        FactorOutcome::Singular { row } => return Err(Error::SingularMatrix(row)),
    }
    sim.mna.solve_complex(x)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decade_sweep_hits_each_decade() {
        let sweep = AcSweep {
            variation: Variation::Decade,
            points: 1,
            fstart: 1.0,
            fstop: 1e3,
        };
        let freqs = sweep.frequencies();
        assert_eq!(freqs.len(), 4);
        assert!((freqs[3] - 1e3).abs() / 1e3 < 1e-9);
    }

    #[test]
    fn linear_sweep_is_inclusive() {
        let sweep = AcSweep {
            variation: Variation::Linear,
            points: 5,
            fstart: 0.0,
            fstop: 100.0,
        };
        let freqs = sweep.frequencies();
        assert_eq!(freqs.len(), 5);
        assert_eq!(freqs[0], 0.0);
        assert_eq!(freqs[4], 100.0);
    }
}
