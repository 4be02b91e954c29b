//! Analysis drivers.
//!
//! Each driver builds a [`crate::Simulation`] with the behavior kinds it
//! needs, runs it, and feeds every accepted point to a
//! [`voltaic_core::ResultSink`]. Cancellation is polled between Newton
//! iterations and between timesteps/frequency points.

pub mod ac;
pub mod dc;
pub mod noise;
pub mod op;
pub mod tran;

use voltaic_core::{PointLabel, ResultSink};

use crate::simulation::Simulation;

/// Deliver the current real solution to the sink.
pub(crate) fn emit_point(sim: &Simulation, sink: &mut dyn ResultSink, label: PointLabel) {
    sink.begin_point(label);
    let solution = sim.solution();
    for i in 1..solution.len() {
        sink.node_value(i, solution[i]);
    }
}
