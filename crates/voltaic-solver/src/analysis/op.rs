//! DC operating-point analysis.

use voltaic_core::behavior::BehaviorKind;
use voltaic_core::{AnalysisConfig, CancelToken, Circuit, PointLabel, Result, ResultSink};

use crate::newton::OpStats;
use crate::simulation::Simulation;

use super::emit_point;

/// Solve the operating point and deliver the node quantities.
///
/// Returns the simulation (for probing voltages and device state) along
/// with the solve statistics.
pub fn run_op(
    circuit: &Circuit,
    config: AnalysisConfig,
    sink: &mut dyn ResultSink,
    cancel: CancelToken,
) -> Result<(Simulation, OpStats)> {
    let mut sim = Simulation::build(
        circuit,
        config,
        &[BehaviorKind::Temperature, BehaviorKind::Load],
    )?;
    sim.cancel = cancel;
    sim.setup()?;
    sim.run_temperature()?;
    let stats = sim.solve_op()?;
    emit_point(&sim, sink, PointLabel::Op);
    Ok((sim, stats))
}
