//! Per-analysis configuration.
//!
//! Every option is `{name, default, effect}`-documented on its field.
//! Unrecognised names are reported through [`crate::error::Error::UnknownParameter`],
//! never silently accepted.

use indexmap::IndexMap;

use crate::constants::REF_TEMPERATURE;
use crate::error::{Error, Result};

/// Implicit integration method for transient analysis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Method {
    /// Trapezoidal rule (order 2, A-stable).
    #[default]
    Trapezoidal,
    /// Gear/BDF formulas, orders 1-6.
    Gear,
}

/// Which recovery strategy the Newton solver tries first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Stepping {
    /// Gmin stepping first, source stepping as fallback.
    #[default]
    GminThenSource,
    /// Source stepping first, Gmin stepping as fallback.
    SourceThenGmin,
}

/// Analysis options.
#[derive(Debug, Clone)]
pub struct AnalysisConfig {
    /// `reltol` (1e-3): relative tolerance for Newton termination.
    pub reltol: f64,
    /// `abstol` (1e-12): additive current-tolerance floor (A).
    pub abstol: f64,
    /// `vntol` (1e-6): absolute voltage tolerance (V).
    pub vntol: f64,
    /// `trtol` (7.0): LTE overestimation factor; larger accepts bigger steps.
    pub trtol: f64,
    /// `itl1` (100): DC operating-point iteration cap.
    pub itl1: usize,
    /// `itl4` (10): Newton iterations allowed per transient timepoint.
    pub itl4: usize,
    /// `gmin` (1e-12): minimum junction conductance (S).
    pub gmin: f64,
    /// `temperature` (300.15 K): simulation temperature.
    pub temperature: f64,
    /// `tnom` (300.15 K): temperature the model parameters were measured at.
    pub nominal_temperature: f64,
    /// `method` ("trapezoidal"): transient integration method.
    pub method: Method,
    /// `order` (2): integration order; 2 for trapezoidal, 2-6 for gear.
    pub order: usize,
    /// `maxstep` (0 = tstop/50): transient step ceiling (s).
    pub maxstep: f64,
    /// `tstep` (1e-9): suggested initial/print step (s).
    pub tstep: f64,
    /// `tstop` (0): transient stop time (s).
    pub tstop: f64,
    /// `uic` (false): skip the initial operating point, use ICs directly.
    pub uic: bool,
    /// `icvoltage`: node-name -> initial voltage map for `.IC`-style state.
    pub icvoltage: IndexMap<String, f64>,
    /// Which stepping strategy runs first on a hard operating point.
    pub stepping: Stepping,
    /// Reproduce the historical BJT convergence test that compared the
    /// base-collector delta against the base-emitter voltage. Off means
    /// the corrected comparison.
    pub compat_bjt_delvbc: bool,
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            reltol: 1e-3,
            abstol: 1e-12,
            vntol: 1e-6,
            trtol: 7.0,
            itl1: 100,
            itl4: 10,
            gmin: 1e-12,
            temperature: REF_TEMPERATURE,
            nominal_temperature: REF_TEMPERATURE,
            method: Method::Trapezoidal,
            order: 2,
            maxstep: 0.0,
            tstep: 1e-9,
            tstop: 0.0,
            uic: false,
            icvoltage: IndexMap::new(),
            stepping: Stepping::GminThenSource,
            compat_bjt_delvbc: false,
        }
    }
}

impl AnalysisConfig {
    /// Set a numeric option by name. Unknown names are an error.
    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        match name {
            "reltol" => self.reltol = value,
            "abstol" => self.abstol = value,
            "vntol" => self.vntol = value,
            "trtol" => self.trtol = value,
            "itl1" => self.itl1 = value as usize,
            "itl4" => self.itl4 = value as usize,
            "gmin" => self.gmin = value,
            "temperature" | "temp" => self.temperature = value,
            "tnom" => self.nominal_temperature = value,
            "order" => self.order = value as usize,
            "maxstep" => self.maxstep = value,
            "tstep" => self.tstep = value,
            "tstop" => self.tstop = value,
            _ => return Err(Error::UnknownParameter(name.to_string())),
        }
        Ok(())
    }

    /// Set a flag option by name.
    pub fn set_flag(&mut self, name: &str, on: bool) -> Result<()> {
        match name {
            "uic" => self.uic = on,
            "compat_bjt_delvbc" => self.compat_bjt_delvbc = on,
            _ => return Err(Error::UnknownParameter(name.to_string())),
        }
        Ok(())
    }

    /// Select the integration method by name.
    pub fn set_method(&mut self, name: &str) -> Result<()> {
        self.method = match name {
            "trapezoidal" | "trap" => Method::Trapezoidal,
            "gear" => Method::Gear,
            _ => return Err(Error::UnknownParameter(name.to_string())),
        };
        Ok(())
    }

    /// Record an initial condition for a named node.
    pub fn set_ic(&mut self, node: impl Into<String>, voltage: f64) {
        self.icvoltage.insert(node.into(), voltage);
    }

    /// The effective transient step ceiling.
    pub fn effective_maxstep(&self) -> f64 {
        if self.maxstep > 0.0 {
            self.maxstep
        } else {
            self.tstop / 50.0
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documentation() {
        let cfg = AnalysisConfig::default();
        assert_eq!(cfg.reltol, 1e-3);
        assert_eq!(cfg.abstol, 1e-12);
        assert_eq!(cfg.vntol, 1e-6);
        assert_eq!(cfg.trtol, 7.0);
        assert_eq!(cfg.itl1, 100);
        assert_eq!(cfg.itl4, 10);
        assert_eq!(cfg.gmin, 1e-12);
        assert_eq!(cfg.temperature, 300.15);
        assert_eq!(cfg.method, Method::Trapezoidal);
        assert_eq!(cfg.order, 2);
        assert!(!cfg.uic);
    }

    #[test]
    fn unknown_options_are_rejected() {
        let mut cfg = AnalysisConfig::default();
        assert!(matches!(
            cfg.set("rltol", 1e-4),
            Err(Error::UnknownParameter(_))
        ));
        assert!(cfg.set_method("euler").is_err());
        assert!(cfg.set_flag("fastmath", true).is_err());
    }

    #[test]
    fn set_by_name_round_trips() {
        let mut cfg = AnalysisConfig::default();
        cfg.set("reltol", 1e-4).unwrap();
        cfg.set("itl1", 200.0).unwrap();
        cfg.set_method("gear").unwrap();
        cfg.set("order", 4.0).unwrap();
        assert_eq!(cfg.reltol, 1e-4);
        assert_eq!(cfg.itl1, 200);
        assert_eq!(cfg.method, Method::Gear);
        assert_eq!(cfg.order, 4);
    }
}
