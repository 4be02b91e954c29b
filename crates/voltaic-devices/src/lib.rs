//! Device models and MNA stamps for Voltaic.
//!
//! This crate provides behavior implementations for:
//! - Passive elements: R, C, L
//! - Sources: V, I (independent, with time-varying waveforms) and the
//!   four controlled kinds (VCVS, VCCS, CCCS, CCVS)
//! - Switches: voltage- and current-controlled, hysteretic
//! - Nonlinear devices: diode, BJT (Gummel-Poon), MOSFET (Level 2)
//! - Noise generator kernels (shot, thermal, flicker)
//!
//! Call [`register_builtins`] once at program start to make every kind
//! available through the shared behavior registry.

pub mod bjt;
pub mod capacitor;
pub mod controlled;
pub mod diode;
pub mod inductor;
pub mod mosfet;
pub mod noise;
pub mod register;
pub mod resistor;
pub mod sources;
pub mod switch;
pub mod waveforms;

pub use register::register_builtins;
pub use waveforms::Waveform;
