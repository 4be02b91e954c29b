//! Resistor behaviors.
//!
//! Resistance comes either from the instance (`r`) or from the model's
//! sheet resistance and the drawn geometry. The temperature behavior
//! folds in the quadratic tempco so loading stays a plain conductance
//! stamp.

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::DVector;
use num_complex::Complex64;

use voltaic_core::behavior::{
    self, Behavior, BehaviorBundle, BehaviorKind, BindingContext, SetupContext,
};
use voltaic_core::matrix::{Mna, Quad};
use voltaic_core::registry::BehaviorRegistry;
use voltaic_core::state::SimState;
use voltaic_core::{ParamBundle, Result};

use crate::noise::ThermalNoise;

/// Default drawn width when neither instance nor model gives one (m).
const DEFAULT_WIDTH: f64 = 10e-6;

/// Instance parameter bundle.
pub fn instance_params() -> ParamBundle {
    ParamBundle::new()
        .with_unset("r")
        .with_unset("w")
        .with_unset("l")
        .principal("r")
}

/// Model parameter bundle (`resistor-model`).
pub fn model_params() -> ParamBundle {
    ParamBundle::new()
        .with_unset("rsh")
        .with("narrow", 0.0)
        .with("tc1", 0.0)
        .with("tc2", 0.0)
        .with_unset("tnom")
        .with("defw", DEFAULT_WIDTH)
}

/// All behaviors of one resistor instance.
pub struct ResistorSim {
    name: String,
    pos: usize,
    neg: usize,
    /// `Some` when the user gave `r` directly.
    r_given: Option<f64>,
    width: f64,
    length: f64,
    sheet_res: f64,
    narrow: f64,
    tc1: f64,
    tc2: f64,
    tnom: Option<f64>,
    /// Conductance after the last temperature update.
    g: f64,
    quad: Option<Quad>,
    thermal: ThermalNoise,
}

impl ResistorSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(2)?;
        let params = ctx.entity.params();
        let model = ctx.model.map(|m| m.params());

        let get_model = |name: &str, fallback: f64| {
            model
                .and_then(|m| m.param(name))
                .filter(|p| p.is_given())
                .map(|p| p.get())
                .unwrap_or(fallback)
        };

        let defw = get_model("defw", DEFAULT_WIDTH);
        Ok(Self {
            name: ctx.entity.name().to_string(),
            pos: ctx.pin(0),
            neg: ctx.pin(1),
            r_given: params
                .param("r")
                .filter(|p| p.is_given())
                .map(|p| p.get()),
            width: params.param("w").filter(|p| p.is_given()).map(|p| p.get()).unwrap_or(defw),
            length: params.param("l").filter(|p| p.is_given()).map(|p| p.get()).unwrap_or(0.0),
            sheet_res: get_model("rsh", 0.0),
            narrow: get_model("narrow", 0.0),
            tc1: get_model("tc1", 0.0),
            tc2: get_model("tc2", 0.0),
            tnom: model
                .and_then(|m| m.param("tnom"))
                .filter(|p| p.is_given())
                .map(|p| p.get()),
            g: 0.0,
            quad: None,
            thermal: ThermalNoise::new(ctx.pin(0), ctx.pin(1)),
        })
    }

    /// Conductance after the last temperature pass (tests, sweeps).
    pub fn conductance(&self) -> f64 {
        self.g
    }
}

impl Behavior for ResistorSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        self.quad = Some(Quad::new(ctx.mna, self.pos, self.neg));
        Ok(())
    }

    fn unsetup(&mut self) {
        self.quad = None;
    }
}

impl behavior::Temperature for ResistorSim {
    fn temperature(&mut self, st: &mut SimState) -> Result<()> {
        let r0 = match self.r_given {
            Some(r) if r != 0.0 => r,
            _ => {
                let w = self.width - self.narrow;
                let l = self.length - self.narrow;
                if self.sheet_res != 0.0 && w > 0.0 && l > 0.0 {
                    self.sheet_res * l / w
                } else {
                    log::warn!(
                        "{}: resistance is zero or underspecified, using 1000 ohm",
                        self.name
                    );
                    1000.0
                }
            }
        };
        let tnom = self.tnom.unwrap_or(st.nominal_temperature);
        let dt = st.temperature - tnom;
        let factor = 1.0 + self.tc1 * dt + self.tc2 * dt * dt;
        self.g = 1.0 / (r0 * factor);
        self.thermal
            .set_coefficients(&[4.0 * voltaic_core::constants::BOLTZMANN * st.temperature * self.g]);
        Ok(())
    }
}

impl behavior::Load for ResistorSim {
    fn load(&mut self, mna: &mut Mna, _st: &mut SimState) -> Result<()> {
        let quad = self.quad.expect("setup ran");
        quad.add(mna, self.g);
        Ok(())
    }
}

impl behavior::AcLoad for ResistorSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, _omega: f64) -> Result<()> {
        let quad = self.quad.expect("setup ran");
        quad.add_complex(mna, Complex64::new(self.g, 0.0));
        Ok(())
    }
}

impl behavior::Noise for ResistorSim {
    fn noise(&mut self, _st: &SimState, ac: &DVector<Complex64>, frequency: f64) -> f64 {
        self.thermal.calculate(ac, frequency)
    }
}

/// Register the resistor factories.
pub fn register(reg: &mut BehaviorRegistry) {
    reg.register_many(
        "resistor",
        &[
            BehaviorKind::Temperature,
            BehaviorKind::Load,
            BehaviorKind::AcLoad,
            BehaviorKind::Noise,
        ],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(ResistorSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim)
                .temperature(&sim)
                .load(&sim)
                .ac_load(&sim)
                .noise(&sim))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltaic_core::behavior::Temperature as _;
    use voltaic_core::{AnalysisConfig, Entity};

    fn bind(entity: &Entity) -> ResistorSim {
        let cfg = AnalysisConfig::default();
        let ctx = BindingContext {
            entity,
            pins: &[1, 2],
            model: None,
            model_behaviors: None,
            config: &cfg,
        };
        ResistorSim::new(&ctx).unwrap()
    }

    #[test]
    fn given_resistance_wins() {
        let e = Entity::new("R1", "resistor")
            .with_params(instance_params())
            .with_pins(["a", "b"])
            .with_param("r", 2200.0);
        let mut sim = bind(&e);
        let mut st = SimState::new();
        sim.temperature(&mut st).unwrap();
        assert!((sim.conductance() - 1.0 / 2200.0).abs() < 1e-15);
    }

    #[test]
    fn degenerate_resistance_falls_back_to_1k() {
        let e = Entity::new("R1", "resistor")
            .with_params(instance_params())
            .with_pins(["a", "b"]);
        let mut sim = bind(&e);
        let mut st = SimState::new();
        sim.temperature(&mut st).unwrap();
        assert!((sim.conductance() - 1e-3).abs() < 1e-15);
    }

    /// G(T) * (1 + tc1*dT + tc2*dT^2) must equal G(Tnom) exactly.
    #[test]
    fn temperature_scaling_is_exact() {
        let e = Entity::new("R1", "resistor")
            .with_params(instance_params())
            .with_pins(["a", "b"])
            .with_param("r", 1000.0);
        let mut sim = bind(&e);
        sim.tc1 = 1e-3;
        sim.tc2 = 1e-6;

        let mut st = SimState::new();
        sim.temperature(&mut st).unwrap();
        let g_nom = sim.conductance();

        st.temperature = st.nominal_temperature + 60.0;
        sim.temperature(&mut st).unwrap();
        let dt = 60.0;
        let recovered = sim.conductance() * (1.0 + sim.tc1 * dt + sim.tc2 * dt * dt);
        assert!(
            (recovered - g_nom).abs() < g_nom * 1e-12,
            "{recovered} vs {g_nom}"
        );
    }

    #[test]
    fn wrong_pin_count_is_fatal() {
        let e = Entity::new("R1", "resistor")
            .with_params(instance_params())
            .with_pins(["a"]);
        let cfg = AnalysisConfig::default();
        let ctx = BindingContext {
            entity: &e,
            pins: &[1],
            model: None,
            model_behaviors: None,
            config: &cfg,
        };
        assert!(ResistorSim::new(&ctx).is_err());
    }
}
