//! Capacitor behaviors.
//!
//! Open at DC; in transient analysis the charge lives in a derivative
//! slot and the integrator supplies the companion conductance and Norton
//! current. Capacitance comes from the instance or from the model's
//! junction capacitances over the drawn geometry.

use std::cell::RefCell;
use std::rc::Rc;

use num_complex::Complex64;

use voltaic_core::behavior::{
    self, Behavior, BehaviorBundle, BehaviorKind, BindingContext, SetupContext,
};
use voltaic_core::matrix::{Mna, Quad, RhsPair};
use voltaic_core::registry::BehaviorRegistry;
use voltaic_core::state::{SimState, SlotId};
use voltaic_core::{ParamBundle, Result};

pub fn instance_params() -> ParamBundle {
    ParamBundle::new()
        .with_unset("c")
        .with_unset("w")
        .with_unset("l")
        .with_unset("ic")
        .principal("c")
}

pub fn model_params() -> ParamBundle {
    ParamBundle::new()
        .with_unset("cj")
        .with("cjsw", 0.0)
        .with("defw", 10e-6)
        .with("narrow", 0.0)
}

pub struct CapacitorSim {
    pos: usize,
    neg: usize,
    capacitance: f64,
    ic: Option<f64>,
    quad: Option<Quad>,
    pair: Option<RhsPair>,
    charge: Option<SlotId>,
}

impl CapacitorSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(2)?;
        let params = ctx.entity.params();
        let model = ctx.model.map(|m| m.params());

        let given = |name: &str| {
            params
                .param(name)
                .filter(|p| p.is_given())
                .map(|p| p.get())
        };

        let capacitance = match given("c") {
            Some(c) => c,
            None => {
                // geometric capacitance from the model card
                let m = |name: &str, fallback: f64| {
                    model
                        .and_then(|b| b.param(name))
                        .filter(|p| p.is_given())
                        .map(|p| p.get())
                        .unwrap_or(fallback)
                };
                let narrow = m("narrow", 0.0);
                let w = given("w").unwrap_or(m("defw", 10e-6)) - narrow;
                let l = given("l").unwrap_or(0.0) - narrow;
                m("cj", 0.0) * w * l + 2.0 * m("cjsw", 0.0) * (w + l)
            }
        };

        Ok(Self {
            pos: ctx.pin(0),
            neg: ctx.pin(1),
            capacitance,
            ic: given("ic"),
            quad: None,
            pair: None,
            charge: None,
        })
    }

    pub fn capacitance(&self) -> f64 {
        self.capacitance
    }
}

impl Behavior for CapacitorSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        self.quad = Some(Quad::new(ctx.mna, self.pos, self.neg));
        self.pair = Some(RhsPair::new(ctx.mna, self.pos, self.neg));
        self.charge = Some(ctx.pool.alloc_slot());
        Ok(())
    }

    fn unsetup(&mut self) {
        self.quad = None;
        self.pair = None;
        self.charge = None;
    }
}

impl behavior::Load for CapacitorSim {
    fn load(&mut self, _mna: &mut Mna, st: &mut SimState) -> Result<()> {
        // open at DC; keep the stored charge tracking the bias point so
        // the first transient step starts from a consistent history
        if !st.transient {
            let v = match self.ic {
                Some(ic) if st.uic => ic,
                _ => st.vd(self.pos, self.neg),
            };
            let slot = self.charge.expect("setup ran");
            st.pool.set_slot_value(slot, self.capacitance * v);
            st.pool.set_derivative(slot, 0.0);
        }
        Ok(())
    }
}

impl behavior::Transient for CapacitorSim {
    fn transient_load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let slot = self.charge.expect("setup ran");
        let v = if st.uic && st.time == 0.0 {
            self.ic.unwrap_or_else(|| st.vd(self.pos, self.neg))
        } else {
            st.vd(self.pos, self.neg)
        };

        st.pool.set_slot_value(slot, self.capacitance * v);
        st.integrate(slot);

        let geq = st.jacobian(self.capacitance);
        let ieq = st.rhs_current(slot, geq, v);
        self.quad.expect("setup ran").add(mna, geq);
        self.pair.expect("setup ran").norton(mna, ieq);
        Ok(())
    }
}

impl behavior::AcLoad for CapacitorSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, omega: f64) -> Result<()> {
        let quad = self.quad.expect("setup ran");
        quad.add_complex(mna, Complex64::new(0.0, omega * self.capacitance));
        Ok(())
    }
}

pub fn register(reg: &mut BehaviorRegistry) {
    reg.register_many(
        "capacitor",
        &[
            BehaviorKind::Load,
            BehaviorKind::AcLoad,
            BehaviorKind::Transient,
        ],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(CapacitorSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim)
                .load(&sim)
                .ac_load(&sim)
                .transient(&sim))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltaic_core::{AnalysisConfig, Entity};

    #[test]
    fn geometry_capacitance_from_model() {
        let model = Entity::new("CMOD", "capacitor-model")
            .with_params(model_params())
            .with_param("cj", 1e-3)
            .with_param("cjsw", 1e-9);
        let e = Entity::new("C1", "capacitor")
            .with_params(instance_params())
            .with_pins(["a", "0"])
            .with_model("CMOD")
            .with_param("w", 10e-6)
            .with_param("l", 20e-6);
        let cfg = AnalysisConfig::default();
        let ctx = BindingContext {
            entity: &e,
            pins: &[1, 0],
            model: Some(&model),
            model_behaviors: None,
            config: &cfg,
        };
        let sim = CapacitorSim::new(&ctx).unwrap();
        let expect = 1e-3 * 10e-6 * 20e-6 + 2.0 * 1e-9 * 30e-6;
        assert!((sim.capacitance() - expect).abs() < 1e-18);
    }

    #[test]
    fn given_capacitance_wins_over_geometry() {
        let e = Entity::new("C1", "capacitor")
            .with_params(instance_params())
            .with_pins(["a", "0"])
            .with_param("c", 1e-6);
        let cfg = AnalysisConfig::default();
        let ctx = BindingContext {
            entity: &e,
            pins: &[1, 0],
            model: None,
            model_behaviors: None,
            config: &cfg,
        };
        let sim = CapacitorSim::new(&ctx).unwrap();
        assert_eq!(sim.capacitance(), 1e-6);
    }
}
