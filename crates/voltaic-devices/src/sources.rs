//! Independent voltage and current sources.
//!
//! The DC value is scaled by the solver's source factor so source
//! stepping can ramp every independent source together. Transient values
//! come from the attached waveform; AC analysis uses the small-signal
//! magnitude/phase.

use std::cell::RefCell;
use std::rc::Rc;

use num_complex::Complex64;

use voltaic_core::behavior::{
    self, Behavior, BehaviorBundle, BehaviorKind, BindingContext, SetupContext,
};
use voltaic_core::matrix::{MatrixElement, Mna, RhsElement, RhsPair};
use voltaic_core::registry::BehaviorRegistry;
use voltaic_core::state::SimState;
use voltaic_core::{ParamBundle, Result};

use crate::waveforms::Waveform;

pub fn instance_params() -> ParamBundle {
    ParamBundle::new()
        .with("dc", 0.0)
        .with("acmag", 0.0)
        .with("acphase", 0.0)
        .with_unset("pulse_v1")
        .with_unset("pulse_v2")
        .with_unset("pulse_td")
        .with_unset("pulse_tr")
        .with_unset("pulse_tf")
        .with_unset("pulse_pw")
        .with_unset("pulse_per")
        .with_unset("sin_vo")
        .with_unset("sin_va")
        .with_unset("sin_freq")
        .with_unset("sin_td")
        .with_unset("sin_theta")
        .principal("dc")
}

/// Build the waveform an entity's parameters describe.
fn waveform_from(ctx: &BindingContext<'_>, tstop: f64) -> Waveform {
    let params = ctx.entity.params();
    let given = |name: &str| {
        params
            .param(name)
            .filter(|p| p.is_given())
            .map(|p| p.get())
    };
    let dc = params.get("dc").unwrap_or(0.0);

    if let Some(v2) = given("pulse_v2") {
        let step = if tstop > 0.0 { tstop / 100.0 } else { 1e-9 };
        Waveform::Pulse {
            v1: given("pulse_v1").unwrap_or(0.0),
            v2,
            delay: given("pulse_td").unwrap_or(0.0),
            rise: given("pulse_tr").unwrap_or(step),
            fall: given("pulse_tf").unwrap_or(step),
            width: given("pulse_pw").unwrap_or(tstop.max(step)),
            period: given("pulse_per").unwrap_or(0.0),
        }
    } else if let Some(amplitude) = given("sin_va") {
        Waveform::Sin {
            offset: given("sin_vo").unwrap_or(0.0),
            amplitude,
            frequency: given("sin_freq").unwrap_or(if tstop > 0.0 { 1.0 / tstop } else { 1e3 }),
            delay: given("sin_td").unwrap_or(0.0),
            theta: given("sin_theta").unwrap_or(0.0),
        }
    } else {
        Waveform::Dc(dc)
    }
}

struct VsrcHandles {
    pos_br: MatrixElement,
    neg_br: MatrixElement,
    br_pos: MatrixElement,
    br_neg: MatrixElement,
    br_rhs: RhsElement,
}

/// Independent voltage source (carries a branch-current unknown).
pub struct VoltageSourceSim {
    name: String,
    pos: usize,
    neg: usize,
    branch: usize,
    dc: f64,
    ac: Complex64,
    waveform: Waveform,
    handles: Option<VsrcHandles>,
}

impl VoltageSourceSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(2)?;
        let params = ctx.entity.params();
        let acmag = params.get("acmag").unwrap_or(0.0);
        let acphase = params.get("acphase").unwrap_or(0.0).to_radians();
        Ok(Self {
            name: ctx.entity.name().to_string(),
            pos: ctx.pin(0),
            neg: ctx.pin(1),
            branch: 0,
            dc: params.get("dc").unwrap_or(0.0),
            ac: Complex64::from_polar(acmag, acphase),
            waveform: waveform_from(ctx, ctx.config.tstop),
            handles: None,
        })
    }

    /// MNA index of the branch current (valid after setup).
    pub fn branch(&self) -> usize {
        self.branch
    }

    /// Replace the DC value (DC sweep driver).
    pub fn set_dc(&mut self, value: f64) {
        self.dc = value;
        if let Waveform::Dc(v) = &mut self.waveform {
            *v = value;
        }
    }

    pub fn dc(&self) -> f64 {
        self.dc
    }
}

impl Behavior for VoltageSourceSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        self.branch = ctx.nodes.create_branch(&self.name);
        self.handles = Some(VsrcHandles {
            pos_br: ctx.mna.element(self.pos, self.branch),
            neg_br: ctx.mna.element(self.neg, self.branch),
            br_pos: ctx.mna.element(self.branch, self.pos),
            br_neg: ctx.mna.element(self.branch, self.neg),
            br_rhs: ctx.mna.rhs_element(self.branch),
        });
        Ok(())
    }

    fn unsetup(&mut self) {
        self.handles = None;
    }
}

impl behavior::Load for VoltageSourceSim {
    fn load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let h = self.handles.as_ref().expect("setup ran");
        mna.add(h.pos_br, 1.0);
        mna.add(h.neg_br, -1.0);
        mna.add(h.br_pos, 1.0);
        mna.add(h.br_neg, -1.0);
        let value = if st.transient {
            self.waveform.value_at(st.time)
        } else {
            self.waveform.dc_value() * st.srcfact
        };
        mna.add_rhs(h.br_rhs, value);
        Ok(())
    }
}

impl behavior::AcLoad for VoltageSourceSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, _omega: f64) -> Result<()> {
        let h = self.handles.as_ref().expect("setup ran");
        mna.add_complex(h.pos_br, Complex64::new(1.0, 0.0));
        mna.add_complex(h.neg_br, Complex64::new(-1.0, 0.0));
        mna.add_complex(h.br_pos, Complex64::new(1.0, 0.0));
        mna.add_complex(h.br_neg, Complex64::new(-1.0, 0.0));
        mna.add_rhs_complex(h.br_rhs, self.ac);
        Ok(())
    }
}

/// Independent current source.
pub struct CurrentSourceSim {
    pos: usize,
    neg: usize,
    dc: f64,
    ac: Complex64,
    waveform: Waveform,
    pair: Option<RhsPair>,
}

impl CurrentSourceSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(2)?;
        let params = ctx.entity.params();
        let acmag = params.get("acmag").unwrap_or(0.0);
        let acphase = params.get("acphase").unwrap_or(0.0).to_radians();
        Ok(Self {
            pos: ctx.pin(0),
            neg: ctx.pin(1),
            dc: params.get("dc").unwrap_or(0.0),
            ac: Complex64::from_polar(acmag, acphase),
            waveform: waveform_from(ctx, ctx.config.tstop),
            pair: None,
        })
    }

    pub fn set_dc(&mut self, value: f64) {
        self.dc = value;
        if let Waveform::Dc(v) = &mut self.waveform {
            *v = value;
        }
    }

    pub fn dc(&self) -> f64 {
        self.dc
    }
}

impl Behavior for CurrentSourceSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        self.pair = Some(RhsPair::new(ctx.mna, self.pos, self.neg));
        Ok(())
    }

    fn unsetup(&mut self) {
        self.pair = None;
    }
}

impl behavior::Load for CurrentSourceSim {
    fn load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let value = if st.transient {
            self.waveform.value_at(st.time)
        } else {
            self.waveform.dc_value() * st.srcfact
        };
        // current flows from pos through the source to neg
        self.pair.expect("setup ran").current(mna, value);
        Ok(())
    }
}

impl behavior::AcLoad for CurrentSourceSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, _omega: f64) -> Result<()> {
        self.pair.expect("setup ran").current_complex(mna, self.ac);
        Ok(())
    }
}

pub fn register(reg: &mut BehaviorRegistry) {
    reg.register_many(
        "vsource",
        &[BehaviorKind::Load, BehaviorKind::AcLoad],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(VoltageSourceSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim).load(&sim).ac_load(&sim))
        }),
    );
    reg.register_many(
        "isource",
        &[BehaviorKind::Load, BehaviorKind::AcLoad],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(CurrentSourceSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim).load(&sim).ac_load(&sim))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltaic_core::{AnalysisConfig, Entity};

    #[test]
    fn pulse_parameters_build_a_pulse() {
        let e = Entity::new("V1", "vsource")
            .with_params(instance_params())
            .with_pins(["a", "0"])
            .with_param("pulse_v1", 0.0)
            .with_param("pulse_v2", 5.0)
            .with_param("pulse_tr", 1e-9)
            .with_param("pulse_tf", 1e-9);
        let cfg = AnalysisConfig::default();
        let ctx = BindingContext {
            entity: &e,
            pins: &[1, 0],
            model: None,
            model_behaviors: None,
            config: &cfg,
        };
        let sim = VoltageSourceSim::new(&ctx).unwrap();
        assert!(matches!(sim.waveform, Waveform::Pulse { v2, .. } if v2 == 5.0));
    }

    #[test]
    fn dc_only_source_keeps_its_value() {
        let e = Entity::new("V1", "vsource")
            .with_params(instance_params())
            .with_pins(["a", "0"])
            .with_param("dc", 5.0);
        let cfg = AnalysisConfig::default();
        let ctx = BindingContext {
            entity: &e,
            pins: &[1, 0],
            model: None,
            model_behaviors: None,
            config: &cfg,
        };
        let mut sim = VoltageSourceSim::new(&ctx).unwrap();
        assert_eq!(sim.dc(), 5.0);
        sim.set_dc(3.3);
        assert_eq!(sim.waveform.dc_value(), 3.3);
    }
}
