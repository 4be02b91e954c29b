//! Simulation drivers for Voltaic.
//!
//! This crate owns the run-time machinery: behavior resolution and setup,
//! the Newton-Raphson solver with Gmin/source stepping, and the analysis
//! drivers (operating point, DC sweep, AC, transient, noise).

pub mod analysis;
pub mod newton;
pub mod simulation;

pub use analysis::ac::{AcSweep, Variation, run_ac};
pub use analysis::dc::{DcSweep, run_dc_sweep};
pub use analysis::noise::run_noise;
pub use analysis::op::run_op;
pub use analysis::tran::{TranStats, run_tran};
pub use newton::OpStats;
pub use simulation::Simulation;
