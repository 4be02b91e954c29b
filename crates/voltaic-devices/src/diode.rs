//! Junction diode behaviors.
//!
//! The model card carries the physical parameters; its temperature
//! behavior computes the constants every instance shares. Instances scale
//! by area, own the series-resistance internal node, and keep their
//! junction voltage in the state pool for limiting and the convergence
//! test.

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::DVector;
use num_complex::Complex64;

use voltaic_core::behavior::{
    self, Behavior, BehaviorBundle, BehaviorKind, BindingContext, SetupContext,
};
use voltaic_core::constants::thermal_voltage;
use voltaic_core::limit::{critical_voltage, limit_junction};
use voltaic_core::matrix::{Mna, Quad, RhsPair};
use voltaic_core::registry::BehaviorRegistry;
use voltaic_core::state::{InitMode, SimState, SlotId, StateVar};
use voltaic_core::{AnalysisConfig, Error, ParamBundle, Result};

use crate::noise::{FlickerNoise, ShotNoise};

pub fn instance_params() -> ParamBundle {
    ParamBundle::new()
        .with("area", 1.0)
        .with_unset("off")
        .with_unset("ic")
        .principal("area")
}

/// Model card parameters (`diode-model`).
pub fn model_params() -> ParamBundle {
    ParamBundle::new()
        .with("is", 1e-14)
        .with("rs", 0.0)
        .with("n", 1.0)
        .with("tt", 0.0)
        .with("cjo", 0.0)
        .with("vj", 1.0)
        .with("m", 0.5)
        .with("eg", 1.11)
        .with("xti", 3.0)
        .with("kf", 0.0)
        .with("af", 1.0)
        .with("fc", 0.5)
        .with_unset("bv")
        .with("ibv", 1e-3)
        .with_unset("tnom")
}

/// Shared temperature behavior of a diode model card.
///
/// Computes per-unit-area constants once per temperature change; every
/// instance referencing the model reads them and applies its area.
pub struct DiodeModelTemperature {
    // raw parameters
    is: f64,
    rs: f64,
    n: f64,
    tt: f64,
    cjo: f64,
    vj: f64,
    m: f64,
    eg: f64,
    xti: f64,
    kf: f64,
    af: f64,
    fc: f64,
    bv: Option<f64>,
    tnom: Option<f64>,
    // derived at temperature
    pub vte: f64,
    pub csat: f64,
    pub dep_cap: f64,
    pub f1: f64,
    pub f2: f64,
    pub f3: f64,
}

impl DiodeModelTemperature {
    pub fn new(model: &voltaic_core::Entity) -> Result<Self> {
        let p = model.params();
        let area_check = |name: &str| -> Result<f64> {
            let v = p.get(name)?;
            if v < 0.0 {
                return Err(Error::ModelParameterOutOfRange {
                    name: name.into(),
                    value: v,
                });
            }
            Ok(v)
        };
        Ok(Self {
            is: area_check("is")?,
            rs: area_check("rs")?,
            n: p.get("n")?,
            tt: p.get("tt")?,
            cjo: area_check("cjo")?,
            vj: p.get("vj")?,
            m: p.get("m")?,
            eg: p.get("eg")?,
            xti: p.get("xti")?,
            kf: p.get("kf")?,
            af: p.get("af")?,
            fc: p.get("fc")?,
            bv: p.param("bv").filter(|b| b.is_given()).map(|b| b.get()),
            tnom: p.param("tnom").filter(|b| b.is_given()).map(|b| b.get()),
            vte: 0.0,
            csat: 0.0,
            dep_cap: 0.0,
            f1: 0.0,
            f2: 0.0,
            f3: 0.0,
        })
    }

    pub fn series_resistance(&self) -> f64 {
        self.rs
    }

    pub fn transit_time(&self) -> f64 {
        self.tt
    }

    pub fn breakdown(&self) -> Option<f64> {
        self.bv
    }

    pub fn flicker(&self) -> (f64, f64) {
        (self.kf, self.af)
    }
}

impl Behavior for DiodeModelTemperature {}

impl behavior::Temperature for DiodeModelTemperature {
    fn temperature(&mut self, st: &mut SimState) -> Result<()> {
        let t = st.temperature;
        let tnom = self.tnom.unwrap_or(st.nominal_temperature);
        let vt = thermal_voltage(t);
        self.vte = self.n * vt;

        // saturation current follows the junction's bandgap scaling
        let ratio = t / tnom;
        self.csat = self.is * ratio.powf(self.xti / self.n)
            * ((self.eg / self.vte) * (ratio - 1.0)).exp();

        // depletion capacitance breakpoint and linear-extension constants
        let xfc = (1.0 - self.fc).ln();
        self.dep_cap = self.fc * self.vj;
        self.f1 = self.vj * (1.0 - ((1.0 - self.m) * xfc).exp()) / (1.0 - self.m);
        self.f2 = ((1.0 + self.m) * xfc).exp();
        self.f3 = 1.0 - self.fc * (1.0 + self.m);
        Ok(())
    }
}

/// All per-instance behaviors of one diode.
pub struct DiodeSim {
    name: String,
    pos: usize,
    neg: usize,
    /// Anode-prime when the model has series resistance.
    pos_prime: usize,
    area: f64,
    off: bool,
    ic: Option<f64>,
    model: Rc<RefCell<DiodeModelTemperature>>,

    // instance constants from the last temperature pass
    csat: f64,
    vte: f64,
    vcrit: f64,
    gspr: f64,
    czero: f64,

    // last load results
    vd: f64,
    cd: f64,
    gd: f64,
    capd: f64,

    junction: Option<Quad>,
    series: Option<Quad>,
    pair: Option<RhsPair>,
    v_state: Option<StateVar>,
    charge: Option<SlotId>,

    shot: ShotNoise,
    flicker: FlickerNoise,
}

impl DiodeSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(2)?;
        let model = ctx
            .model_behavior::<DiodeModelTemperature>()
            .ok_or_else(|| Error::MissingParameter("model".into()))?;
        let p = ctx.entity.params();
        let area = p.get("area")?;
        if area <= 0.0 {
            return Err(Error::ModelParameterOutOfRange {
                name: "area".into(),
                value: area,
            });
        }
        Ok(Self {
            name: ctx.entity.name().to_string(),
            pos: ctx.pin(0),
            neg: ctx.pin(1),
            pos_prime: ctx.pin(0),
            area,
            off: p.is_given("off"),
            ic: p.param("ic").filter(|b| b.is_given()).map(|b| b.get()),
            model,
            csat: 0.0,
            vte: 0.0,
            vcrit: 0.0,
            gspr: 0.0,
            czero: 0.0,
            vd: 0.0,
            cd: 0.0,
            gd: 0.0,
            capd: 0.0,
            junction: None,
            series: None,
            pair: None,
            v_state: None,
            charge: None,
            shot: ShotNoise::new(ctx.pin(0), ctx.pin(1)),
            flicker: FlickerNoise::new(ctx.pin(0), ctx.pin(1)),
        })
    }

    /// Junction current after the last load (A).
    pub fn current(&self) -> f64 {
        self.cd
    }

    /// Junction conductance after the last load (S).
    pub fn conductance(&self) -> f64 {
        self.gd
    }

    fn charge_and_cap(&self, m: &DiodeModelTemperature, vd: f64) -> (f64, f64) {
        let czero = self.czero;
        if czero == 0.0 && m.transit_time() == 0.0 {
            return (0.0, 0.0);
        }
        let (vj, mj) = (m.vj, m.m);
        let diff_q = m.transit_time() * self.cd;
        let diff_c = m.transit_time() * self.gd;
        if vd < m.dep_cap {
            // closed-form integral of C(v) = czero * (1 - v/vj)^(-mj)
            let arg = 1.0 - vd / vj;
            let sarg = (-mj * arg.ln()).exp();
            (
                diff_q + vj * czero * (1.0 - arg * sarg) / (1.0 - mj),
                diff_c + czero * sarg,
            )
        } else {
            // linear extension above the breakpoint
            let czof2 = czero / m.f2;
            let q = diff_q
                + czero * m.f1
                + czof2
                    * (m.f3 * (vd - m.dep_cap)
                        + (mj / (2.0 * vj)) * (vd * vd - m.dep_cap * m.dep_cap));
            let c = diff_c + czof2 * (m.f3 + mj * vd / vj);
            (q, c)
        }
    }
}

impl Behavior for DiodeSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let m = self.model.borrow();
        self.pos_prime = if m.series_resistance() > 0.0 {
            ctx.nodes.create_internal(&self.name, "anode")
        } else {
            self.pos
        };
        drop(m);
        self.junction = Some(Quad::new(ctx.mna, self.pos_prime, self.neg));
        if self.pos_prime != self.pos {
            self.series = Some(Quad::new(ctx.mna, self.pos, self.pos_prime));
        }
        self.pair = Some(RhsPair::new(ctx.mna, self.pos_prime, self.neg));
        self.v_state = Some(ctx.pool.alloc(1));
        self.charge = Some(ctx.pool.alloc_slot());
        self.shot = ShotNoise::new(self.pos_prime, self.neg);
        self.flicker = FlickerNoise::new(self.pos_prime, self.neg);
        Ok(())
    }

    fn unsetup(&mut self) {
        self.junction = None;
        self.series = None;
        self.pair = None;
        self.v_state = None;
        self.charge = None;
    }
}

impl behavior::Temperature for DiodeSim {
    fn temperature(&mut self, st: &mut SimState) -> Result<()> {
        let m = self.model.borrow();
        self.csat = m.csat * self.area;
        self.vte = m.vte;
        self.vcrit = critical_voltage(self.csat, st.temperature);
        self.gspr = if m.series_resistance() > 0.0 {
            self.area / m.series_resistance()
        } else {
            0.0
        };
        self.czero = m.cjo * self.area;
        Ok(())
    }
}

impl behavior::Load for DiodeSim {
    fn load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let model = self.model.clone();
        let m = model.borrow();
        let v_state = self.v_state.expect("setup ran");

        // junction voltage for this iteration
        let mut vd = match st.mode {
            InitMode::Junction => {
                if self.off {
                    0.0
                } else {
                    self.vcrit
                }
            }
            InitMode::Fix => match self.ic {
                Some(ic) => ic,
                None if self.off => 0.0,
                None => st.v(self.pos_prime) - st.v(self.neg),
            },
            InitMode::Normal => {
                if st.uic && st.transient && st.time == 0.0 {
                    self.ic.unwrap_or(0.0)
                } else {
                    st.v(self.pos_prime) - st.v(self.neg)
                }
            }
        };

        if st.mode == InitMode::Normal {
            let vd_old = st.pool.value(v_state);
            let (limited_v, limited) = limit_junction(vd, vd_old, self.vte, self.vcrit);
            vd = limited_v;
            if limited {
                st.report_noncon();
            }
            if let Some(bv) = m.breakdown() {
                // limit against the breakdown exponential as well
                if vd < (10.0 * self.vte - bv).min(0.0) {
                    let vd_norm = -(vd + bv);
                    let (lim, limited) =
                        limit_junction(vd_norm, -(vd_old + bv), self.vte, self.vcrit);
                    vd = -(lim + bv);
                    if limited {
                        st.report_noncon();
                    }
                }
            }
        }

        // the three I-V branches
        let gmin = st.gmin;
        let (cd, gd) = if vd >= -3.0 * self.vte {
            let evd = (vd / self.vte).exp();
            (
                self.csat * (evd - 1.0) + gmin * vd,
                self.csat * evd / self.vte + gmin,
            )
        } else if m.breakdown().is_none() || vd >= -m.breakdown().unwrap() {
            // regularised reverse tail
            let arg = 3.0 * self.vte / (vd * std::f64::consts::E);
            let arg = arg * arg * arg;
            (
                -self.csat * (1.0 + arg) + gmin * vd,
                self.csat * 3.0 * arg / vd + gmin,
            )
        } else {
            let bv = m.breakdown().unwrap();
            let evrev = (-(bv + vd) / self.vte).exp();
            (
                -self.csat * evrev + gmin * vd,
                self.csat * evrev / self.vte + gmin,
            )
        };

        self.vd = vd;
        self.cd = cd;
        self.gd = gd;
        let (_q, capd) = self.charge_and_cap(&m, vd);
        self.capd = capd;
        st.pool.set_value(v_state, vd);

        // stamps
        self.junction.expect("setup ran").add(mna, gd);
        if let Some(series) = self.series {
            series.add(mna, self.gspr);
        }
        let cdeq = cd - gd * vd;
        self.pair.expect("setup ran").current(mna, cdeq);
        Ok(())
    }

    fn is_convergent(&self, st: &SimState, cfg: &AnalysisConfig) -> bool {
        let vd = st.v(self.pos_prime) - st.v(self.neg);
        let delvd = vd - self.vd;
        let cdhat = self.cd + self.gd * delvd;
        let tol = cfg.reltol * cdhat.abs().max(self.cd.abs()) + cfg.abstol;
        (cdhat - self.cd).abs() <= tol
    }
}

impl behavior::Transient for DiodeSim {
    fn transient_load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let model = self.model.clone();
        let m = model.borrow();
        let slot = self.charge.expect("setup ran");
        let (qd, capd) = self.charge_and_cap(&m, self.vd);
        self.capd = capd;

        st.pool.set_slot_value(slot, qd);
        st.integrate(slot);

        let geq = st.jacobian(capd);
        let ieq = st.rhs_current(slot, geq, self.vd);
        self.junction.expect("setup ran").add(mna, geq);
        self.pair.expect("setup ran").norton(mna, ieq);
        Ok(())
    }
}

impl behavior::AcLoad for DiodeSim {
    fn ac_load(&mut self, mna: &mut Mna, _st: &SimState, omega: f64) -> Result<()> {
        let y = Complex64::new(self.gd, omega * self.capd);
        self.junction.expect("setup ran").add_complex(mna, y);
        if let Some(series) = self.series {
            series.add_complex(mna, Complex64::new(self.gspr, 0.0));
        }
        Ok(())
    }
}

impl behavior::Noise for DiodeSim {
    fn noise(&mut self, _st: &SimState, ac: &DVector<Complex64>, frequency: f64) -> f64 {
        let (kf, af) = self.model.borrow().flicker();
        self.shot.set_coefficients(&[self.cd]);
        self.flicker.set_coefficients(&[kf, self.cd, af]);
        self.shot.calculate(ac, frequency) + self.flicker.calculate(ac, frequency)
    }
}

pub fn register(reg: &mut BehaviorRegistry) {
    reg.register(
        "diode-model",
        BehaviorKind::Temperature,
        std::sync::Arc::new(|ctx| {
            let temp = Rc::new(RefCell::new(DiodeModelTemperature::new(ctx.entity)?));
            Ok(BehaviorBundle::of(&temp).temperature(&temp))
        }),
    );
    reg.register_many(
        "diode",
        &[
            BehaviorKind::Temperature,
            BehaviorKind::Load,
            BehaviorKind::AcLoad,
            BehaviorKind::Transient,
            BehaviorKind::Noise,
        ],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(DiodeSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim)
                .temperature(&sim)
                .load(&sim)
                .ac_load(&sim)
                .transient(&sim)
                .noise(&sim))
        }),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltaic_core::Entity;
    use voltaic_core::behavior::Temperature as _;

    fn model_entity() -> Entity {
        Entity::new("DX", "diode-model").with_params(model_params())
    }

    fn evaluate(vd: f64) -> (f64, f64) {
        // standalone evaluation of the forward branch at 300.15 K
        let mut mt = DiodeModelTemperature::new(&model_entity()).unwrap();
        let mut st = SimState::new();
        mt.temperature(&mut st).unwrap();
        let vte = mt.vte;
        let csat = mt.csat;
        let evd = (vd / vte).exp();
        (csat * (evd - 1.0), csat * evd / vte)
    }

    #[test]
    fn forward_current_matches_shockley() {
        // Is = 1e-14, N = 1, T = 300.15 K, V = 0.7 V: a few milliamps
        let (i, _) = evaluate(0.7);
        let vt = thermal_voltage(voltaic_core::constants::REF_TEMPERATURE);
        let expect = 1e-14 * ((0.7 / vt).exp() - 1.0);
        assert!(
            (i - expect).abs() / expect < 1e-9,
            "I(0.7) = {i}, expected {expect}"
        );
        assert!(i > 1e-3 && i < 1e-2, "I(0.7) = {i} out of the mA range");
    }

    /// i(v) - i(v - eps) must approximate eps * gd(v) to O(eps^2).
    #[test]
    fn conductance_is_the_current_derivative() {
        let eps = 1e-6;
        for &vd in &[0.1, 0.3, 0.55, 0.7] {
            let (i1, gd) = evaluate(vd);
            let (i0, _) = evaluate(vd - eps);
            let numeric = (i1 - i0) / eps;
            assert!(
                (numeric - gd).abs() / gd < 1e-4,
                "at {vd}: numeric {numeric} vs analytic {gd}"
            );
        }
    }

    #[test]
    fn saturation_current_scales_with_temperature() {
        let mut mt = DiodeModelTemperature::new(&model_entity()).unwrap();
        let mut st = SimState::new();
        mt.temperature(&mut st).unwrap();
        let cs_nom = mt.csat;

        st.temperature += 50.0;
        mt.temperature(&mut st).unwrap();
        assert!(
            mt.csat > cs_nom * 10.0,
            "Is must grow steeply with temperature: {} -> {}",
            cs_nom,
            mt.csat
        );
    }

    #[test]
    fn negative_model_parameter_is_rejected() {
        let model = model_entity().with_param("cjo", -1e-12);
        assert!(matches!(
            DiodeModelTemperature::new(&model),
            Err(Error::ModelParameterOutOfRange { .. })
        ));
    }
}
