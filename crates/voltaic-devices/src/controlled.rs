//! Controlled source behaviors: VCVS (E), VCCS (G), CCCS (F), CCVS (H).
//!
//! All four are linear, so one set of matrix handles serves both the real
//! and the complex plane. The current-controlled kinds read the branch
//! current of a named voltage source; the branch index is resolved at
//! setup from the node map.

use std::cell::RefCell;
use std::rc::Rc;

use num_complex::Complex64;

use voltaic_core::behavior::{
    self, Behavior, BehaviorBundle, BehaviorKind, BindingContext, SetupContext,
};
use voltaic_core::matrix::{MatrixElement, Mna};
use voltaic_core::registry::BehaviorRegistry;
use voltaic_core::state::SimState;
use voltaic_core::{Error, ParamBundle, Result};

pub fn gain_params() -> ParamBundle {
    ParamBundle::new().with("gain", 0.0).principal("gain")
}

// ────────────────────── VCVS (E element) ──────────────────────

/// Voltage-controlled voltage source: V(out) = gain * V(ctrl).
pub struct VcvsSim {
    name: String,
    out_pos: usize,
    out_neg: usize,
    ctrl_pos: usize,
    ctrl_neg: usize,
    gain: f64,
    branch: usize,
    handles: Option<[MatrixElement; 6]>,
}

impl VcvsSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(4)?;
        Ok(Self {
            name: ctx.entity.name().to_string(),
            out_pos: ctx.pin(0),
            out_neg: ctx.pin(1),
            ctrl_pos: ctx.pin(2),
            ctrl_neg: ctx.pin(3),
            gain: ctx.entity.params().get("gain")?,
            branch: 0,
            handles: None,
        })
    }

    fn stamp(&self, mna: &mut Mna, complex: bool) {
        let h = self.handles.as_ref().expect("setup ran");
        // (out+, br) +1, (out-, br) -1, (br, out+) +1, (br, out-) -1,
        // (br, ctrl+) -gain, (br, ctrl-) +gain
        let values = [1.0, -1.0, 1.0, -1.0, -self.gain, self.gain];
        for (e, v) in h.iter().zip(values) {
            if complex {
                mna.add_complex(*e, Complex64::new(v, 0.0));
            } else {
                mna.add(*e, v);
            }
        }
    }
}

impl Behavior for VcvsSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        self.branch = ctx.nodes.create_branch(&self.name);
        let br = self.branch;
        self.handles = Some([
            ctx.mna.element(self.out_pos, br),
            ctx.mna.element(self.out_neg, br),
            ctx.mna.element(br, self.out_pos),
            ctx.mna.element(br, self.out_neg),
            ctx.mna.element(br, self.ctrl_pos),
            ctx.mna.element(br, self.ctrl_neg),
        ]);
        Ok(())
    }

    fn unsetup(&mut self) {
        self.handles = None;
    }
}

impl behavior::Load for VcvsSim {
    fn load(&mut self, mna: &mut Mna, _st: &mut SimState) -> Result<()> {
        self.stamp(mna, false);
        Ok(())
    }
}

impl behavior::AcLoad for VcvsSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, _omega: f64) -> Result<()> {
        self.stamp(mna, true);
        Ok(())
    }
}

// ────────────────────── VCCS (G element) ──────────────────────

/// Voltage-controlled current source: I(out+ -> out-) = gm * V(ctrl).
pub struct VccsSim {
    out_pos: usize,
    out_neg: usize,
    ctrl_pos: usize,
    ctrl_neg: usize,
    gm: f64,
    handles: Option<[MatrixElement; 4]>,
}

impl VccsSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(4)?;
        Ok(Self {
            out_pos: ctx.pin(0),
            out_neg: ctx.pin(1),
            ctrl_pos: ctx.pin(2),
            ctrl_neg: ctx.pin(3),
            gm: ctx.entity.params().get("gain")?,
            handles: None,
        })
    }

    fn stamp(&self, mna: &mut Mna, complex: bool) {
        let h = self.handles.as_ref().expect("setup ran");
        let values = [self.gm, -self.gm, -self.gm, self.gm];
        for (e, v) in h.iter().zip(values) {
            if complex {
                mna.add_complex(*e, Complex64::new(v, 0.0));
            } else {
                mna.add(*e, v);
            }
        }
    }
}

impl Behavior for VccsSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        self.handles = Some([
            ctx.mna.element(self.out_pos, self.ctrl_pos),
            ctx.mna.element(self.out_pos, self.ctrl_neg),
            ctx.mna.element(self.out_neg, self.ctrl_pos),
            ctx.mna.element(self.out_neg, self.ctrl_neg),
        ]);
        Ok(())
    }

    fn unsetup(&mut self) {
        self.handles = None;
    }
}

impl behavior::Load for VccsSim {
    fn load(&mut self, mna: &mut Mna, _st: &mut SimState) -> Result<()> {
        self.stamp(mna, false);
        Ok(())
    }
}

impl behavior::AcLoad for VccsSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, _omega: f64) -> Result<()> {
        self.stamp(mna, true);
        Ok(())
    }
}

// ────────────────────── CCCS (F element) ──────────────────────

/// Current-controlled current source: I(out) = gain * I(V_control).
pub struct CccsSim {
    out_pos: usize,
    out_neg: usize,
    control: String,
    gain: f64,
    handles: Option<[MatrixElement; 2]>,
}

impl CccsSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(2)?;
        let control = ctx
            .entity
            .control()
            .ok_or_else(|| Error::MissingParameter("control source".into()))?
            .to_string();
        Ok(Self {
            out_pos: ctx.pin(0),
            out_neg: ctx.pin(1),
            control,
            gain: ctx.entity.params().get("gain")?,
            handles: None,
        })
    }
}

impl Behavior for CccsSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        // the controlling source allocated its branch before us only if it
        // set up first; create_branch is idempotent either way
        let br = ctx.nodes.create_branch(&self.control);
        self.handles = Some([
            ctx.mna.element(self.out_pos, br),
            ctx.mna.element(self.out_neg, br),
        ]);
        Ok(())
    }

    fn unsetup(&mut self) {
        self.handles = None;
    }
}

impl behavior::Load for CccsSim {
    fn load(&mut self, mna: &mut Mna, _st: &mut SimState) -> Result<()> {
        let h = self.handles.as_ref().expect("setup ran");
        mna.add(h[0], self.gain);
        mna.add(h[1], -self.gain);
        Ok(())
    }
}

impl behavior::AcLoad for CccsSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, _omega: f64) -> Result<()> {
        let h = self.handles.as_ref().expect("setup ran");
        mna.add_complex(h[0], Complex64::new(self.gain, 0.0));
        mna.add_complex(h[1], Complex64::new(-self.gain, 0.0));
        Ok(())
    }
}

// ────────────────────── CCVS (H element) ──────────────────────

/// Current-controlled voltage source: V(out) = r * I(V_control).
pub struct CcvsSim {
    name: String,
    out_pos: usize,
    out_neg: usize,
    control: String,
    transres: f64,
    branch: usize,
    handles: Option<[MatrixElement; 5]>,
}

impl CcvsSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(2)?;
        let control = ctx
            .entity
            .control()
            .ok_or_else(|| Error::MissingParameter("control source".into()))?
            .to_string();
        Ok(Self {
            name: ctx.entity.name().to_string(),
            out_pos: ctx.pin(0),
            out_neg: ctx.pin(1),
            control,
            transres: ctx.entity.params().get("gain")?,
            branch: 0,
            handles: None,
        })
    }

    fn stamp(&self, mna: &mut Mna, complex: bool) {
        let h = self.handles.as_ref().expect("setup ran");
        let values = [1.0, -1.0, 1.0, -1.0, -self.transres];
        for (e, v) in h.iter().zip(values) {
            if complex {
                mna.add_complex(*e, Complex64::new(v, 0.0));
            } else {
                mna.add(*e, v);
            }
        }
    }
}

impl Behavior for CcvsSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        self.branch = ctx.nodes.create_branch(&self.name);
        let ctrl_br = ctx.nodes.create_branch(&self.control);
        let br = self.branch;
        self.handles = Some([
            ctx.mna.element(self.out_pos, br),
            ctx.mna.element(self.out_neg, br),
            ctx.mna.element(br, self.out_pos),
            ctx.mna.element(br, self.out_neg),
            ctx.mna.element(br, ctrl_br),
        ]);
        Ok(())
    }

    fn unsetup(&mut self) {
        self.handles = None;
    }
}

impl behavior::Load for CcvsSim {
    fn load(&mut self, mna: &mut Mna, _st: &mut SimState) -> Result<()> {
        self.stamp(mna, false);
        Ok(())
    }
}

impl behavior::AcLoad for CcvsSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, _omega: f64) -> Result<()> {
        self.stamp(mna, true);
        Ok(())
    }
}

pub fn register(reg: &mut BehaviorRegistry) {
    reg.register_many(
        "vcvs",
        &[BehaviorKind::Load, BehaviorKind::AcLoad],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(VcvsSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim).load(&sim).ac_load(&sim))
        }),
    );
    reg.register_many(
        "vccs",
        &[BehaviorKind::Load, BehaviorKind::AcLoad],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(VccsSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim).load(&sim).ac_load(&sim))
        }),
    );
    reg.register_many(
        "cccs",
        &[BehaviorKind::Load, BehaviorKind::AcLoad],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(CccsSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim).load(&sim).ac_load(&sim))
        }),
    );
    reg.register_many(
        "ccvs",
        &[BehaviorKind::Load, BehaviorKind::AcLoad],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(CcvsSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim).load(&sim).ac_load(&sim))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltaic_core::{AnalysisConfig, Entity};

    #[test]
    fn cccs_requires_a_control_source() {
        let e = Entity::new("F1", "cccs")
            .with_params(gain_params())
            .with_pins(["a", "0"])
            .with_param("gain", 2.0);
        let cfg = AnalysisConfig::default();
        let ctx = BindingContext {
            entity: &e,
            pins: &[1, 0],
            model: None,
            model_behaviors: None,
            config: &cfg,
        };
        assert!(matches!(
            CccsSim::new(&ctx),
            Err(Error::MissingParameter(_))
        ));
    }
}
