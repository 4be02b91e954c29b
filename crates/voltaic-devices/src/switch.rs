//! Hysteretic switch behaviors.
//!
//! Both kinds stamp either the on or the off conductance. The hysteresis
//! window is evaluated against the state committed at the last accepted
//! timepoint; the Accept behavior performs that commit, and a state flip
//! during Newton iteration votes non-convergence so the solver settles
//! the new operating region.

use std::cell::RefCell;
use std::rc::Rc;

use num_complex::Complex64;

use voltaic_core::behavior::{
    self, Behavior, BehaviorBundle, BehaviorKind, BindingContext, SetupContext,
};
use voltaic_core::matrix::{Mna, Quad};
use voltaic_core::registry::BehaviorRegistry;
use voltaic_core::state::SimState;
use voltaic_core::{Error, ParamBundle, Result};

pub fn instance_params() -> ParamBundle {
    ParamBundle::new().with_unset("on")
}

/// Model card shared by both switch kinds (`switch-model`).
pub fn model_params() -> ParamBundle {
    ParamBundle::new()
        .with("ron", 1.0)
        .with("roff", 1e12)
        .with("vt", 0.0)
        .with("vh", 0.0)
        .with("it", 0.0)
        .with("ih", 0.0)
}

#[derive(Debug, Clone, Copy)]
struct SwitchModel {
    g_on: f64,
    g_off: f64,
    threshold: f64,
    hysteresis: f64,
}

impl SwitchModel {
    fn from_ctx(ctx: &BindingContext<'_>, current_controlled: bool) -> Result<Self> {
        let model = ctx
            .model
            .ok_or_else(|| Error::MissingParameter("model".into()))?
            .params();
        let (t_key, h_key) = if current_controlled {
            ("it", "ih")
        } else {
            ("vt", "vh")
        };
        let ron = model.get("ron")?;
        let roff = model.get("roff")?;
        if ron <= 0.0 {
            return Err(Error::ModelParameterOutOfRange {
                name: "ron".into(),
                value: ron,
            });
        }
        Ok(Self {
            g_on: 1.0 / ron,
            g_off: 1.0 / roff,
            threshold: model.get(t_key)?,
            hysteresis: model.get(h_key)?.abs(),
        })
    }

    /// Next state given the control quantity and the committed state.
    fn decide(&self, ctrl: f64, committed: bool) -> bool {
        if ctrl > self.threshold + self.hysteresis {
            true
        } else if ctrl < self.threshold - self.hysteresis {
            false
        } else {
            committed
        }
    }
}

fn load_switch(
    model: &SwitchModel,
    ctrl: f64,
    current_state: &mut bool,
    old_state: bool,
    quad: Quad,
    mna: &mut Mna,
    st: &mut SimState,
) {
    let next = model.decide(ctrl, old_state);
    if next != *current_state {
        *current_state = next;
        st.report_noncon();
    }
    let g = if *current_state { model.g_on } else { model.g_off };
    quad.add(mna, g);
}

// ────────────────────── voltage-controlled (S element) ──────────────────────

pub struct VSwitchSim {
    pos: usize,
    neg: usize,
    ctrl_pos: usize,
    ctrl_neg: usize,
    model: SwitchModel,
    current_state: bool,
    old_state: bool,
    quad: Option<Quad>,
}

impl VSwitchSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(4)?;
        let initial = ctx.entity.params().is_given("on");
        Ok(Self {
            pos: ctx.pin(0),
            neg: ctx.pin(1),
            ctrl_pos: ctx.pin(2),
            ctrl_neg: ctx.pin(3),
            model: SwitchModel::from_ctx(ctx, false)?,
            current_state: initial,
            old_state: initial,
            quad: None,
        })
    }
}

impl Behavior for VSwitchSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        self.quad = Some(Quad::new(ctx.mna, self.pos, self.neg));
        Ok(())
    }

    fn unsetup(&mut self) {
        self.quad = None;
    }
}

impl behavior::Load for VSwitchSim {
    fn load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let ctrl = st.vd(self.ctrl_pos, self.ctrl_neg);
        load_switch(
            &self.model,
            ctrl,
            &mut self.current_state,
            self.old_state,
            self.quad.expect("setup ran"),
            mna,
            st,
        );
        Ok(())
    }
}

impl behavior::AcLoad for VSwitchSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, _omega: f64) -> Result<()> {
        let g = if self.current_state {
            self.model.g_on
        } else {
            self.model.g_off
        };
        self.quad
            .expect("setup ran")
            .add_complex(mna, Complex64::new(g, 0.0));
        Ok(())
    }
}

impl behavior::Accept for VSwitchSim {
    fn accept(&mut self, _st: &mut SimState) {
        self.old_state = self.current_state;
    }
}

// ────────────────────── current-controlled (W element) ──────────────────────

pub struct CSwitchSim {
    pos: usize,
    neg: usize,
    control: String,
    ctrl_branch: usize,
    model: SwitchModel,
    current_state: bool,
    old_state: bool,
    quad: Option<Quad>,
}

impl CSwitchSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(2)?;
        let control = ctx
            .entity
            .control()
            .ok_or_else(|| Error::MissingParameter("control source".into()))?
            .to_string();
        let initial = ctx.entity.params().is_given("on");
        Ok(Self {
            pos: ctx.pin(0),
            neg: ctx.pin(1),
            control,
            ctrl_branch: 0,
            model: SwitchModel::from_ctx(ctx, true)?,
            current_state: initial,
            old_state: initial,
            quad: None,
        })
    }
}

impl Behavior for CSwitchSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        self.ctrl_branch = ctx.nodes.create_branch(&self.control);
        self.quad = Some(Quad::new(ctx.mna, self.pos, self.neg));
        Ok(())
    }

    fn unsetup(&mut self) {
        self.quad = None;
    }
}

impl behavior::Load for CSwitchSim {
    fn load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let ctrl = st.v(self.ctrl_branch);
        load_switch(
            &self.model,
            ctrl,
            &mut self.current_state,
            self.old_state,
            self.quad.expect("setup ran"),
            mna,
            st,
        );
        Ok(())
    }
}

impl behavior::AcLoad for CSwitchSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, _omega: f64) -> Result<()> {
        let g = if self.current_state {
            self.model.g_on
        } else {
            self.model.g_off
        };
        self.quad
            .expect("setup ran")
            .add_complex(mna, Complex64::new(g, 0.0));
        Ok(())
    }
}

impl behavior::Accept for CSwitchSim {
    /// Commit the hysteretic state; the next iteration's load reads it.
    fn accept(&mut self, _st: &mut SimState) {
        self.old_state = self.current_state;
    }
}

pub fn register(reg: &mut BehaviorRegistry) {
    reg.register_many(
        "vswitch",
        &[
            BehaviorKind::Load,
            BehaviorKind::AcLoad,
            BehaviorKind::Accept,
        ],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(VSwitchSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim)
                .load(&sim)
                .ac_load(&sim)
                .accept(&sim))
        }),
    );
    reg.register_many(
        "cswitch",
        &[
            BehaviorKind::Load,
            BehaviorKind::AcLoad,
            BehaviorKind::Accept,
        ],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(CSwitchSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim)
                .load(&sim)
                .ac_load(&sim)
                .accept(&sim))
        }),
    );
}
