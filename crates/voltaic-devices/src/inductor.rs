//! Inductor behaviors.
//!
//! The inductor always carries a branch-current unknown so the matrix
//! pattern is identical across analyses: a short at DC, a flux derivative
//! slot in transient, `jwL` in AC.

use std::cell::RefCell;
use std::rc::Rc;

use num_complex::Complex64;

use voltaic_core::behavior::{
    self, Behavior, BehaviorBundle, BehaviorKind, BindingContext, SetupContext,
};
use voltaic_core::matrix::{MatrixElement, Mna, RhsElement};
use voltaic_core::registry::BehaviorRegistry;
use voltaic_core::state::{SimState, SlotId};
use voltaic_core::{ParamBundle, Result};

pub fn instance_params() -> ParamBundle {
    ParamBundle::new()
        .with_unset("l")
        .with_unset("ic")
        .principal("l")
}

struct Handles {
    pos_br: MatrixElement,
    neg_br: MatrixElement,
    br_pos: MatrixElement,
    br_neg: MatrixElement,
    br_br: MatrixElement,
    br_rhs: RhsElement,
}

pub struct InductorSim {
    name: String,
    pos: usize,
    neg: usize,
    branch: usize,
    inductance: f64,
    ic: Option<f64>,
    handles: Option<Handles>,
    flux: Option<SlotId>,
}

impl InductorSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(2)?;
        let params = ctx.entity.params();
        let inductance = params
            .param("l")
            .filter(|p| p.is_given())
            .map(|p| p.get())
            .ok_or_else(|| voltaic_core::Error::MissingParameter("l".into()))?;
        Ok(Self {
            name: ctx.entity.name().to_string(),
            pos: ctx.pin(0),
            neg: ctx.pin(1),
            branch: 0,
            inductance,
            ic: params
                .param("ic")
                .filter(|p| p.is_given())
                .map(|p| p.get()),
            handles: None,
            flux: None,
        })
    }

    /// MNA index of the branch current (valid after setup).
    pub fn branch(&self) -> usize {
        self.branch
    }
}

impl Behavior for InductorSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        self.branch = ctx.nodes.create_branch(&self.name);
        self.handles = Some(Handles {
            pos_br: ctx.mna.element(self.pos, self.branch),
            neg_br: ctx.mna.element(self.neg, self.branch),
            br_pos: ctx.mna.element(self.branch, self.pos),
            br_neg: ctx.mna.element(self.branch, self.neg),
            br_br: ctx.mna.element(self.branch, self.branch),
            br_rhs: ctx.mna.rhs_element(self.branch),
        });
        self.flux = Some(ctx.pool.alloc_slot());
        Ok(())
    }

    fn unsetup(&mut self) {
        self.handles = None;
        self.flux = None;
    }
}

impl behavior::Load for InductorSim {
    fn load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let h = self.handles.as_ref().expect("setup ran");
        // KCL coupling and the branch equation V(pos) - V(neg) = V_L
        mna.add(h.pos_br, 1.0);
        mna.add(h.neg_br, -1.0);
        mna.add(h.br_pos, 1.0);
        mna.add(h.br_neg, -1.0);
        if !st.transient {
            // short at DC; track the flux for the transient start
            let i = if st.uic {
                self.ic.unwrap_or_else(|| st.v(self.branch))
            } else {
                st.v(self.branch)
            };
            let slot = self.flux.expect("setup ran");
            st.pool.set_slot_value(slot, self.inductance * i);
            st.pool.set_derivative(slot, 0.0);
        }
        Ok(())
    }
}

impl behavior::Transient for InductorSim {
    fn transient_load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let h = self.handles.as_ref().expect("setup ran");
        let slot = self.flux.expect("setup ran");
        let i = if st.uic && st.time == 0.0 {
            self.ic.unwrap_or_else(|| st.v(self.branch))
        } else {
            st.v(self.branch)
        };

        st.pool.set_slot_value(slot, self.inductance * i);
        st.integrate(slot);

        // branch equation becomes V(pos) - V(neg) - dphi/dt = 0, with the
        // derivative linearised as geq*i - ieq
        let geq = st.jacobian(self.inductance);
        let ieq = st.rhs_current(slot, geq, i);
        mna.add(h.br_br, -geq);
        mna.add_rhs(h.br_rhs, -ieq);
        Ok(())
    }
}

impl behavior::AcLoad for InductorSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, omega: f64) -> Result<()> {
        let h = self.handles.as_ref().expect("setup ran");
        mna.add_complex(h.pos_br, Complex64::new(1.0, 0.0));
        mna.add_complex(h.neg_br, Complex64::new(-1.0, 0.0));
        mna.add_complex(h.br_pos, Complex64::new(1.0, 0.0));
        mna.add_complex(h.br_neg, Complex64::new(-1.0, 0.0));
        mna.add_complex(h.br_br, Complex64::new(0.0, -omega * self.inductance));
        Ok(())
    }
}

pub fn register(reg: &mut BehaviorRegistry) {
    reg.register_many(
        "inductor",
        &[
            BehaviorKind::Load,
            BehaviorKind::AcLoad,
            BehaviorKind::Transient,
        ],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(InductorSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim)
                .load(&sim)
                .ac_load(&sim)
                .transient(&sim))
        }),
    );
}
