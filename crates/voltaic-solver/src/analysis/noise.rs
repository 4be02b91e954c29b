//! Noise analysis.
//!
//! Per frequency: one AC solve, then every Noise behavior contributes its
//! spectral density against that solution. Contributions are delivered
//! per device (V^2/Hz) plus an accumulated total.

use nalgebra::DVector;
use num_complex::Complex64;
use num_traits::Zero;

use voltaic_core::behavior::BehaviorKind;
use voltaic_core::{
    AnalysisConfig, CancelToken, Circuit, PointLabel, Result, ResultSink,
};

use crate::simulation::Simulation;

use super::ac::{AcSweep, solve_ac};

/// Run a noise sweep. Returns the total PSD per frequency.
pub fn run_noise(
    circuit: &Circuit,
    config: AnalysisConfig,
    sweep: &AcSweep,
    sink: &mut dyn ResultSink,
    cancel: CancelToken,
) -> Result<(Simulation, Vec<(f64, f64)>)> {
    let mut sim = Simulation::build(
        circuit,
        config,
        &[
            BehaviorKind::Temperature,
            BehaviorKind::Load,
            BehaviorKind::AcLoad,
            BehaviorKind::Noise,
        ],
    )?;
    sim.cancel = cancel;
    sim.setup()?;
    sim.run_temperature()?;
    sim.solve_op()?;
    sim.load()?;

    let mut results = Vec::new();
    let mut x = DVector::from_element(sim.solution().len(), Complex64::zero());
    for frequency in sweep.frequencies() {
        sim.cancel.check()?;
        solve_ac(&mut sim, frequency, &mut x)?;

        sink.begin_point(PointLabel::Frequency(frequency));
        let mut total = 0.0;
        for (name, set) in &sim.behaviors {
            if let Some(n) = &set.noise {
                let psd = n.borrow_mut().noise(&sim.state, &x, frequency);
                sink.device_value(name, "onoise", psd);
                total += psd;
            }
        }
        sink.device_value("onoise", "total", total);
        results.push((frequency, total));
    }
    Ok((sim, results))
}
