//! Core building blocks of the Voltaic circuit simulator.
//!
//! This crate provides:
//! - Circuit representation: entities, model cards, parameter bundles
//! - MNA unknown allocation and the element-handle matrix facade
//! - The behavior framework and process-wide behavior registry
//! - Shared simulation state: solution vectors, history ring, slots
//! - Implicit integration formulas (trapezoidal, Gear 1-6) with LTE

pub mod behavior;
pub mod circuit;
pub mod config;
pub mod constants;
pub mod error;
pub mod integrate;
pub mod limit;
pub mod matrix;
pub mod nodes;
pub mod params;
pub mod registry;
pub mod sink;
pub mod state;

pub use circuit::{Circuit, Entity};
pub use config::{AnalysisConfig, Method, Stepping};
pub use error::{Error, Result};
pub use matrix::{FactorOutcome, MatrixElement, Mna, Quad, RhsElement, RhsPair};
pub use nodes::NodeMap;
pub use params::{ParamBundle, ParamState, Parameter};
pub use sink::{CancelToken, NullSink, PointLabel, ResultSink, VecSink};
pub use state::{InitMode, SimState, SlotId, StatePool, StateVar};
