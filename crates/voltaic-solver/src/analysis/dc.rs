//! DC sweep analysis.
//!
//! Sweeps the DC value of a named independent source, re-solving the
//! operating point at each step from the previous solution.

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::DVector;
use voltaic_core::behavior::BehaviorKind;
use voltaic_core::{
    AnalysisConfig, CancelToken, Circuit, Error, PointLabel, Result, ResultSink,
};
use voltaic_devices::sources::{CurrentSourceSim, VoltageSourceSim};

use crate::simulation::Simulation;

use super::emit_point;

/// Sweep specification: `source` start/stop/step.
#[derive(Debug, Clone)]
pub struct DcSweep {
    pub source: String,
    pub start: f64,
    pub stop: f64,
    pub step: f64,
}

impl DcSweep {
    /// The sweep points, endpoint included within rounding slack.
    pub fn values(&self) -> Vec<f64> {
        let mut values = Vec::new();
        let direction = if self.step > 0.0 { 1.0 } else { -1.0 };
        let mut value = self.start;
        loop {
            values.push(value);
            value += self.step;
            if direction * value > direction * self.stop * (1.0 + 1e-10) + 1e-30 {
                break;
            }
        }
        values
    }
}

enum Swept {
    Voltage(Rc<RefCell<VoltageSourceSim>>),
    Current(Rc<RefCell<CurrentSourceSim>>),
}

impl Swept {
    fn set_dc(&self, value: f64) {
        match self {
            Swept::Voltage(v) => v.borrow_mut().set_dc(value),
            Swept::Current(i) => i.borrow_mut().set_dc(value),
        }
    }
}

/// Run a DC sweep. Returns `(swept value, solution)` per point.
pub fn run_dc_sweep(
    circuit: &Circuit,
    config: AnalysisConfig,
    sweep: &DcSweep,
    sink: &mut dyn ResultSink,
    cancel: CancelToken,
) -> Result<(Simulation, Vec<(f64, DVector<f64>)>)> {
    let mut sim = Simulation::build(
        circuit,
        config,
        &[BehaviorKind::Temperature, BehaviorKind::Load],
    )?;
    sim.cancel = cancel;
    sim.setup()?;
    sim.run_temperature()?;

    let source = {
        let set = sim
            .behavior_set(&sweep.source)
            .ok_or_else(|| Error::NoSuchEntity(sweep.source.clone()))?;
        if let Some(v) = set.find::<VoltageSourceSim>() {
            Swept::Voltage(v)
        } else if let Some(i) = set.find::<CurrentSourceSim>() {
            Swept::Current(i)
        } else {
            return Err(Error::NoSuchEntity(sweep.source.clone()));
        }
    };

    let mut results = Vec::new();
    for value in sweep.values() {
        sim.cancel.check()?;
        source.set_dc(value);
        sim.solve_op()?;
        emit_point(&sim, sink, PointLabel::Sweep(value));
        results.push((value, sim.solution().clone()));
    }
    Ok((sim, results))
}
