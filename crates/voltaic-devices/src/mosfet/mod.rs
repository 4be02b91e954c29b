//! MOSFET behaviors (Level 2).
//!
//! The DC core is the square-law channel with body effect and channel
//! length modulation; source/drain swap follows the sign of `vds`. The
//! transient behavior carries the full charge bookkeeping: bulk junction
//! depletion charges with the `(1 - v/phi)^(1-m)` closed form below the
//! depletion breakpoint and the stored `F2/F3/F4` linear extension above
//! it, plus Meyer gate capacitances averaged over adjacent timepoints.

pub mod meyer;

use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::DVector;
use num_complex::Complex64;

use voltaic_core::behavior::{
    self, Behavior, BehaviorBundle, BehaviorKind, BindingContext, SetupContext,
};
use voltaic_core::constants::thermal_voltage;
use voltaic_core::limit::{critical_voltage, limit_fet, limit_junction, limit_vds};
use voltaic_core::matrix::{MatrixElement, Mna, Quad, RhsElement};
use voltaic_core::registry::BehaviorRegistry;
use voltaic_core::state::{InitMode, SimState, SlotId, StateVar};
use voltaic_core::{AnalysisConfig, Error, ParamBundle, Result};

use crate::noise::{FlickerNoise, ThermalNoise};
use meyer::meyer_caps;

pub fn instance_params() -> ParamBundle {
    ParamBundle::new()
        .with("w", 1e-4)
        .with("l", 1e-4)
        .with("ad", 0.0)
        .with("as", 0.0)
        .with("pd", 0.0)
        .with("ps", 0.0)
        .with("nrd", 1.0)
        .with("nrs", 1.0)
        .with_unset("off")
        .with_unset("icvds")
        .with_unset("icvgs")
        .with_unset("icvbs")
}

/// Model card parameters (`mos-model`).
pub fn model_params() -> ParamBundle {
    ParamBundle::new()
        .with_unset("pmos")
        .with("level", 2.0)
        .with("vto", 0.0)
        .with("kp", 2e-5)
        .with("gamma", 0.0)
        .with("phi", 0.6)
        .with("lambda", 0.0)
        .with("rd", 0.0)
        .with("rs", 0.0)
        .with("rsh", 0.0)
        .with("is", 1e-14)
        .with("pb", 0.8)
        .with("cbd", 0.0)
        .with("cbs", 0.0)
        .with("cj", 0.0)
        .with("mj", 0.5)
        .with("cjsw", 0.0)
        .with("mjsw", 0.33)
        .with("cgso", 0.0)
        .with("cgdo", 0.0)
        .with("cgbo", 0.0)
        .with("tox", 1e-7)
        .with("ld", 0.0)
        .with("u0", 600.0)
        .with("fc", 0.5)
        .with("kf", 0.0)
        .with("af", 1.0)
        .with_unset("tnom")
}

/// Shared temperature behavior of a MOS model card.
pub struct MosModelTemperature {
    sign: f64,
    pub vto: f64,
    pub kp: f64,
    pub gamma: f64,
    pub phi: f64,
    pub lambda: f64,
    pub rd: f64,
    pub rs: f64,
    pub rsh: f64,
    is: f64,
    pub pb: f64,
    pub cbd: f64,
    pub cbs: f64,
    pub cj: f64,
    pub mj: f64,
    pub cjsw: f64,
    pub mjsw: f64,
    pub cgso: f64,
    pub cgdo: f64,
    pub cgbo: f64,
    pub ld: f64,
    pub fc: f64,
    pub kf: f64,
    pub af: f64,
    tnom: Option<f64>,
    /// Oxide capacitance per unit area (F/m^2).
    pub oxide_cap_factor: f64,
    // derived at temperature
    pub vt: f64,
    pub sat_cur: f64,
    pub vcrit: f64,
    pub dep_cap: f64,
}

impl MosModelTemperature {
    pub fn new(model: &voltaic_core::Entity) -> Result<Self> {
        let p = model.params();
        let nonneg = |name: &str| -> Result<f64> {
            let v = p.get(name)?;
            if v < 0.0 {
                return Err(Error::ModelParameterOutOfRange {
                    name: name.into(),
                    value: v,
                });
            }
            Ok(v)
        };
        let tox = p.get("tox")?;
        if tox <= 0.0 {
            return Err(Error::ModelParameterOutOfRange {
                name: "tox".into(),
                value: tox,
            });
        }
        Ok(Self {
            sign: if p.is_given("pmos") { -1.0 } else { 1.0 },
            vto: p.get("vto")?,
            kp: nonneg("kp")?,
            gamma: nonneg("gamma")?,
            phi: p.get("phi")?,
            lambda: nonneg("lambda")?,
            rd: nonneg("rd")?,
            rs: nonneg("rs")?,
            rsh: nonneg("rsh")?,
            is: nonneg("is")?,
            pb: p.get("pb")?,
            cbd: nonneg("cbd")?,
            cbs: nonneg("cbs")?,
            cj: nonneg("cj")?,
            mj: p.get("mj")?,
            cjsw: nonneg("cjsw")?,
            mjsw: p.get("mjsw")?,
            cgso: nonneg("cgso")?,
            cgdo: nonneg("cgdo")?,
            cgbo: nonneg("cgbo")?,
            ld: nonneg("ld")?,
            fc: p.get("fc")?,
            kf: p.get("kf")?,
            af: p.get("af")?,
            tnom: p.param("tnom").filter(|b| b.is_given()).map(|b| b.get()),
            oxide_cap_factor: 3.9 * 8.854214871e-12 / tox,
            vt: 0.0,
            sat_cur: 0.0,
            vcrit: 0.0,
            dep_cap: 0.0,
        })
    }

    pub fn sign(&self) -> f64 {
        self.sign
    }
}

impl Behavior for MosModelTemperature {}

impl behavior::Temperature for MosModelTemperature {
    fn temperature(&mut self, st: &mut SimState) -> Result<()> {
        let t = st.temperature;
        let tnom = self.tnom.unwrap_or(st.nominal_temperature);
        let ratio = t / tnom;
        self.vt = thermal_voltage(t);
        // bulk junction saturation current follows the silicon bandgap
        self.sat_cur =
            self.is * ratio.powf(3.0) * ((1.11 / self.vt) * (ratio - 1.0)).exp();
        self.vcrit = critical_voltage(self.sat_cur, t);
        self.dep_cap = self.fc * self.pb;
        Ok(())
    }
}

/// F2/F3/F4 linear-extension coefficients of one bulk junction.
#[derive(Debug, Clone, Copy, Default)]
struct JunctionCoeffs {
    cz: f64,
    czsw: f64,
    f2: f64,
    f3: f64,
    f4: f64,
}

impl JunctionCoeffs {
    fn new(m: &MosModelTemperature, cz: f64, czsw: f64) -> Self {
        let arg = 1.0 - m.fc;
        let sarg = (-m.mj * arg.ln()).exp();
        let sargsw = (-m.mjsw * arg.ln()).exp();
        let f2 = cz * (1.0 - m.fc * (1.0 + m.mj)) * sarg / arg
            + czsw * (1.0 - m.fc * (1.0 + m.mjsw)) * sargsw / arg;
        let f3 = cz * m.mj * sarg / arg / m.pb + czsw * m.mjsw * sargsw / arg / m.pb;
        let f4 = cz * m.pb * (1.0 - arg * sarg) / (1.0 - m.mj)
            + czsw * m.pb * (1.0 - arg * sargsw) / (1.0 - m.mjsw)
            - m.dep_cap * m.dep_cap * f3 / 2.0
            - m.dep_cap * f2;
        Self { cz, czsw, f2, f3, f4 }
    }

    /// Depletion charge and capacitance at junction voltage `v`.
    fn charge(&self, m: &MosModelTemperature, v: f64) -> (f64, f64) {
        if v < m.dep_cap {
            let arg = 1.0 - v / m.pb;
            let sarg = (-m.mj * arg.ln()).exp();
            let sargsw = (-m.mjsw * arg.ln()).exp();
            (
                m.pb * self.cz * (1.0 - arg * sarg) / (1.0 - m.mj)
                    + m.pb * self.czsw * (1.0 - arg * sargsw) / (1.0 - m.mjsw),
                self.cz * sarg + self.czsw * sargsw,
            )
        } else {
            (self.f4 + v * (self.f2 + v * self.f3 / 2.0), self.f2 + self.f3 * v)
        }
    }
}

struct MosHandles {
    drain_series: Option<Quad>,
    source_series: Option<Quad>,
    // channel + junction cells, named row_col
    dp_dp: MatrixElement,
    dp_g: MatrixElement,
    dp_sp: MatrixElement,
    dp_b: MatrixElement,
    sp_dp: MatrixElement,
    sp_g: MatrixElement,
    sp_sp: MatrixElement,
    sp_b: MatrixElement,
    g_g: MatrixElement,
    g_dp: MatrixElement,
    g_sp: MatrixElement,
    g_b: MatrixElement,
    b_g: MatrixElement,
    b_dp: MatrixElement,
    b_sp: MatrixElement,
    b_b: MatrixElement,
    rhs_g: RhsElement,
    rhs_b: RhsElement,
    rhs_dp: RhsElement,
    rhs_sp: RhsElement,
}

/// All per-instance behaviors of one MOSFET.
pub struct MosfetSim {
    name: String,
    drain: usize,
    gate: usize,
    source: usize,
    bulk: usize,
    d_prime: usize,
    s_prime: usize,
    model: Rc<RefCell<MosModelTemperature>>,

    w: f64,
    leff: f64,
    area_d: f64,
    area_s: f64,
    perim_d: f64,
    perim_s: f64,
    off: bool,
    ic: (Option<f64>, Option<f64>, Option<f64>),

    // instance constants from the last temperature pass
    beta: f64,
    gdpr: f64,
    gspr: f64,
    oxide_cap: f64,
    overlap_gs: f64,
    overlap_gd: f64,
    overlap_gb: f64,
    jct_d: JunctionCoeffs,
    jct_s: JunctionCoeffs,

    // last load results (normalized polarity)
    mode: f64,
    von: f64,
    vdsat: f64,
    vgs: f64,
    vds: f64,
    vbs: f64,
    cd: f64,
    gm: f64,
    gds: f64,
    gmbs: f64,
    cbd_j: f64,
    gbd: f64,
    cbs_j: f64,
    gbs: f64,

    handles: Option<MosHandles>,
    vgs_state: Option<StateVar>,
    vds_state: Option<StateVar>,
    vbs_state: Option<StateVar>,
    capgs_state: Option<StateVar>,
    capgd_state: Option<StateVar>,
    capgb_state: Option<StateVar>,
    qgs: Option<SlotId>,
    qgd: Option<SlotId>,
    qgb: Option<SlotId>,
    qbd: Option<SlotId>,
    qbs: Option<SlotId>,

    thermal: ThermalNoise,
    flicker: FlickerNoise,
}

impl MosfetSim {
    pub fn new(ctx: &BindingContext<'_>) -> Result<Self> {
        ctx.entity.require_pins(4)?;
        let model = ctx
            .model_behavior::<MosModelTemperature>()
            .ok_or_else(|| Error::MissingParameter("model".into()))?;
        let p = ctx.entity.params();
        let w = p.get("w")?;
        let l = p.get("l")?;
        if w <= 0.0 || l <= 0.0 {
            return Err(Error::ModelParameterOutOfRange {
                name: "w/l".into(),
                value: w.min(l),
            });
        }
        let given = |name: &str| {
            p.param(name).filter(|b| b.is_given()).map(|b| b.get())
        };
        let (d, g, s, b) = (ctx.pin(0), ctx.pin(1), ctx.pin(2), ctx.pin(3));
        Ok(Self {
            name: ctx.entity.name().to_string(),
            drain: d,
            gate: g,
            source: s,
            bulk: b,
            d_prime: d,
            s_prime: s,
            model,
            w,
            leff: l,
            area_d: p.get("ad")?,
            area_s: p.get("as")?,
            perim_d: p.get("pd")?,
            perim_s: p.get("ps")?,
            off: p.is_given("off"),
            ic: (given("icvds"), given("icvgs"), given("icvbs")),
            beta: 0.0,
            gdpr: 0.0,
            gspr: 0.0,
            oxide_cap: 0.0,
            overlap_gs: 0.0,
            overlap_gd: 0.0,
            overlap_gb: 0.0,
            jct_d: JunctionCoeffs::default(),
            jct_s: JunctionCoeffs::default(),
            mode: 1.0,
            von: 0.0,
            vdsat: 0.0,
            vgs: 0.0,
            vds: 0.0,
            vbs: 0.0,
            cd: 0.0,
            gm: 0.0,
            gds: 0.0,
            gmbs: 0.0,
            cbd_j: 0.0,
            gbd: 0.0,
            cbs_j: 0.0,
            gbs: 0.0,
            handles: None,
            vgs_state: None,
            vds_state: None,
            vbs_state: None,
            capgs_state: None,
            capgd_state: None,
            capgb_state: None,
            qgs: None,
            qgd: None,
            qgb: None,
            qbd: None,
            qbs: None,
            thermal: ThermalNoise::new(d, s),
            flicker: FlickerNoise::new(d, s),
        })
    }

    /// Drain current and small-signal conductances after the last load.
    pub fn operating_point(&self) -> (f64, f64, f64, f64) {
        (self.cd, self.gm, self.gds, self.gmbs)
    }

    /// The square-law channel with body effect and CLM.
    ///
    /// Inputs are already normalized (NMOS polarity, vds >= 0).
    fn channel(&self, m: &MosModelTemperature, vgs: f64, vds: f64, vbs: f64) -> (f64, f64, f64, f64, f64, f64) {
        let phi = m.phi;
        let (sqarg, dsq_dvbs) = if vbs <= 0.0 {
            let s = (phi - vbs).sqrt();
            (s, -0.5 / s)
        } else {
            // forward bulk bias: smooth clamp of the square root
            let s0 = phi.sqrt();
            let s = s0 / (1.0 + vbs / (2.0 * phi));
            (s, -s0 / (2.0 * phi) / (1.0 + vbs / (2.0 * phi)).powi(2))
        };
        let von = m.vto + m.gamma * (sqarg - phi.sqrt());
        let vgst = vgs - von;
        let vdsat = vgst.max(0.0);
        if vgst <= 0.0 {
            return (0.0, 0.0, 0.0, 0.0, von, vdsat);
        }
        let dvon_dvbs = m.gamma * dsq_dvbs;
        let betap = self.beta * (1.0 + m.lambda * vds);
        let (cdrain, gm, gds) = if vgst <= vds {
            // saturation
            let id = betap * vgst * vgst / 2.0;
            (
                id,
                betap * vgst,
                m.lambda * self.beta * vgst * vgst / 2.0,
            )
        } else {
            // linear
            (
                betap * vds * (vgst - vds / 2.0),
                betap * vds,
                betap * (vgst - vds) + m.lambda * self.beta * vds * (vgst - vds / 2.0),
            )
        };
        let gmbs = -gm * dvon_dvbs;
        (cdrain, gm, gds, gmbs, von, vdsat)
    }
}

impl Behavior for MosfetSim {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let m = self.model.borrow();
        let rd = if m.rd > 0.0 { m.rd } else { m.rsh * 1.0 };
        let rs = if m.rs > 0.0 { m.rs } else { m.rsh * 1.0 };
        self.d_prime = if rd > 0.0 {
            ctx.nodes.create_internal(&self.name, "drain")
        } else {
            self.drain
        };
        self.s_prime = if rs > 0.0 {
            ctx.nodes.create_internal(&self.name, "source")
        } else {
            self.source
        };
        drop(m);

        let (dp, sp, g, b) = (self.d_prime, self.s_prime, self.gate, self.bulk);
        self.handles = Some(MosHandles {
            drain_series: (dp != self.drain).then(|| Quad::new(ctx.mna, self.drain, dp)),
            source_series: (sp != self.source).then(|| Quad::new(ctx.mna, self.source, sp)),
            dp_dp: ctx.mna.element(dp, dp),
            dp_g: ctx.mna.element(dp, g),
            dp_sp: ctx.mna.element(dp, sp),
            dp_b: ctx.mna.element(dp, b),
            sp_dp: ctx.mna.element(sp, dp),
            sp_g: ctx.mna.element(sp, g),
            sp_sp: ctx.mna.element(sp, sp),
            sp_b: ctx.mna.element(sp, b),
            g_g: ctx.mna.element(g, g),
            g_dp: ctx.mna.element(g, dp),
            g_sp: ctx.mna.element(g, sp),
            g_b: ctx.mna.element(g, b),
            b_g: ctx.mna.element(b, g),
            b_dp: ctx.mna.element(b, dp),
            b_sp: ctx.mna.element(b, sp),
            b_b: ctx.mna.element(b, b),
            rhs_g: ctx.mna.rhs_element(g),
            rhs_b: ctx.mna.rhs_element(b),
            rhs_dp: ctx.mna.rhs_element(dp),
            rhs_sp: ctx.mna.rhs_element(sp),
        });
        self.vgs_state = Some(ctx.pool.alloc(1));
        self.vds_state = Some(ctx.pool.alloc(1));
        self.vbs_state = Some(ctx.pool.alloc(1));
        self.capgs_state = Some(ctx.pool.alloc(1));
        self.capgd_state = Some(ctx.pool.alloc(1));
        self.capgb_state = Some(ctx.pool.alloc(1));
        self.qgs = Some(ctx.pool.alloc_slot());
        self.qgd = Some(ctx.pool.alloc_slot());
        self.qgb = Some(ctx.pool.alloc_slot());
        self.qbd = Some(ctx.pool.alloc_slot());
        self.qbs = Some(ctx.pool.alloc_slot());
        self.thermal = ThermalNoise::new(dp, sp);
        self.flicker = FlickerNoise::new(dp, sp);
        Ok(())
    }

    fn unsetup(&mut self) {
        self.handles = None;
        self.vgs_state = None;
        self.vds_state = None;
        self.vbs_state = None;
        self.capgs_state = None;
        self.capgd_state = None;
        self.capgb_state = None;
        self.qgs = None;
        self.qgd = None;
        self.qgb = None;
        self.qbd = None;
        self.qbs = None;
    }
}

impl behavior::Temperature for MosfetSim {
    fn temperature(&mut self, _st: &mut SimState) -> Result<()> {
        let m = self.model.borrow();
        let p_leff = self.leff - 2.0 * m.ld;
        let leff = if p_leff > 0.0 { p_leff } else { self.leff };
        self.beta = m.kp * self.w / leff;
        self.gdpr = if m.rd > 0.0 { 1.0 / m.rd } else { 0.0 };
        self.gspr = if m.rs > 0.0 { 1.0 / m.rs } else { 0.0 };
        self.oxide_cap = m.oxide_cap_factor * leff * self.w;
        self.overlap_gs = m.cgso * self.w;
        self.overlap_gd = m.cgdo * self.w;
        self.overlap_gb = m.cgbo * leff;
        // drawn diffusion areas default to a square of the drawn width
        let default_area = self.w * self.w;
        let ad = if self.area_d > 0.0 { self.area_d } else { default_area };
        let asrc = if self.area_s > 0.0 { self.area_s } else { default_area };
        self.jct_d = JunctionCoeffs::new(
            &m,
            if m.cbd > 0.0 { m.cbd } else { m.cj * ad },
            m.cjsw * self.perim_d,
        );
        self.jct_s = JunctionCoeffs::new(
            &m,
            if m.cbs > 0.0 { m.cbs } else { m.cj * asrc },
            m.cjsw * self.perim_s,
        );
        Ok(())
    }
}

impl behavior::Load for MosfetSim {
    fn load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let model = self.model.clone();
        let m = model.borrow();
        let sign = m.sign();
        let vgs_state = self.vgs_state.expect("setup ran");
        let vds_state = self.vds_state.expect("setup ran");
        let vbs_state = self.vbs_state.expect("setup ran");

        let from_solution = (
            sign * (st.v(self.gate) - st.v(self.s_prime)),
            sign * (st.v(self.d_prime) - st.v(self.s_prime)),
            sign * (st.v(self.bulk) - st.v(self.s_prime)),
        );
        let (mut vgs, mut vds, mut vbs) = match st.mode {
            InitMode::Junction => {
                if self.off {
                    (0.0, 0.0, 0.0)
                } else {
                    (m.vto + 0.1, 0.0, -1.0)
                }
            }
            InitMode::Fix => {
                if self.off {
                    (0.0, 0.0, 0.0)
                } else if self.ic.0.is_some() || self.ic.1.is_some() || self.ic.2.is_some() {
                    (
                        self.ic.1.unwrap_or(0.0),
                        self.ic.0.unwrap_or(0.0),
                        self.ic.2.unwrap_or(0.0),
                    )
                } else {
                    from_solution
                }
            }
            InitMode::Normal => from_solution,
        };

        if st.mode == InitMode::Normal {
            let vgs_old = st.pool.value(vgs_state);
            let vds_old = st.pool.value(vds_state);
            let vbs_old = st.pool.value(vbs_state);

            let (v, lim1) = limit_fet(vgs, vgs_old, self.von);
            vgs = v;
            // the vds limiter is one-sided; mirror it for inverted operation
            let (v, lim2) = if vds_old >= 0.0 {
                limit_vds(vds, vds_old)
            } else {
                let (nv, limited) = limit_vds(-vds, -vds_old);
                (-nv, limited)
            };
            vds = v;
            let (v, lim3) = limit_junction(vbs, vbs_old, m.vt, m.vcrit);
            vbs = v;
            if lim1 || lim2 || lim3 {
                st.report_noncon();
            }
        }

        // polarity/mode normalisation: evaluate with the channel's true
        // source at the lower potential
        let (mode, vgsx, vdsx, vbsx) = if vds >= 0.0 {
            (1.0, vgs, vds, vbs)
        } else {
            (-1.0, vgs - vds, -vds, vbs - vds)
        };

        let (cdrain, gm, gds, gmbs, von, vdsat) = self.channel(&m, vgsx, vdsx, vbsx);

        // bulk junctions (normalized space): bulk-source at vbs, bulk-drain
        // at vbd = vbs - vds
        let vbd = vbs - vds;
        let (mut cbs_j, mut gbs) = junction_current(vbs, m.vt, m.sat_cur);
        cbs_j += st.gmin * vbs;
        gbs += st.gmin;
        let (mut cbd_j, mut gbd) = junction_current(vbd, m.vt, m.sat_cur);
        cbd_j += st.gmin * vbd;
        gbd += st.gmin;

        self.mode = mode;
        self.von = von;
        self.vdsat = vdsat;
        self.vgs = vgs;
        self.vds = vds;
        self.vbs = vbs;
        self.cd = mode * cdrain - cbd_j;
        self.gm = gm;
        self.gds = gds;
        self.gmbs = gmbs;
        self.cbs_j = cbs_j;
        self.gbs = gbs;
        self.cbd_j = cbd_j;
        self.gbd = gbd;
        st.pool.set_value(vgs_state, vgs);
        st.pool.set_value(vds_state, vds);
        st.pool.set_value(vbs_state, vbs);

        // stamps
        let h = self.handles.as_ref().expect("setup ran");
        if let Some(q) = h.drain_series {
            q.add(mna, self.gdpr);
        }
        if let Some(q) = h.source_series {
            q.add(mna, self.gspr);
        }

        let (xnrm, xrev) = if mode >= 0.0 { (1.0, 0.0) } else { (0.0, 1.0) };
        mna.add(h.dp_dp, gds + gbd + xrev * (gm + gmbs));
        mna.add(h.sp_sp, gds + gbs + xnrm * (gm + gmbs));
        mna.add(h.b_b, gbd + gbs);
        mna.add(h.dp_g, (xnrm - xrev) * gm);
        mna.add(h.dp_b, -gbd + (xnrm - xrev) * gmbs);
        mna.add(h.dp_sp, -gds - xnrm * (gm + gmbs));
        mna.add(h.sp_g, -(xnrm - xrev) * gm);
        mna.add(h.sp_b, -gbs - (xnrm - xrev) * gmbs);
        mna.add(h.sp_dp, -gds - xrev * (gm + gmbs));
        mna.add(h.b_dp, -gbd);
        mna.add(h.b_sp, -gbs);

        // Norton constants
        let ceqbs = cbs_j - gbs * vbs;
        let ceqbd = cbd_j - gbd * vbd;
        let cdreq = if mode >= 0.0 {
            cdrain - gds * vds - gm * vgs - gmbs * vbs
        } else {
            -(cdrain - gds * (-vds) - gm * (vgs - vds) - gmbs * (vbs - vds))
        };
        mna.add_rhs(h.rhs_b, -sign * (ceqbs + ceqbd));
        mna.add_rhs(h.rhs_dp, sign * (ceqbd - cdreq));
        mna.add_rhs(h.rhs_sp, sign * (cdreq + ceqbs));
        Ok(())
    }

    fn is_convergent(&self, st: &SimState, cfg: &AnalysisConfig) -> bool {
        let sign = self.model.borrow().sign();
        let vgs = sign * (st.v(self.gate) - st.v(self.s_prime));
        let vds = sign * (st.v(self.d_prime) - st.v(self.s_prime));
        let vbs = sign * (st.v(self.bulk) - st.v(self.s_prime));
        let delvgs = vgs - self.vgs;
        let delvds = vds - self.vds;
        let delvbs = vbs - self.vbs;

        let cdhat = if self.mode >= 0.0 {
            self.cd + self.gm * delvgs + self.gds * delvds + self.gmbs * delvbs
                - self.gbd * (delvbs - delvds)
        } else {
            self.cd + self.gm * (delvgs - delvds) - self.gds * delvds
                + self.gmbs * (delvbs - delvds)
                - self.gbd * (delvbs - delvds)
        };
        let tol = cfg.reltol * cdhat.abs().max(self.cd.abs()) + cfg.abstol;
        (cdhat - self.cd).abs() <= tol
    }
}

impl behavior::Transient for MosfetSim {
    fn transient_load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()> {
        let model = self.model.clone();
        let m = model.borrow();
        let sign = m.sign();
        let h = self.handles.as_ref().expect("setup ran");

        let vbd = self.vbs - self.vds;

        // bulk junction depletion charges
        for (slot, jct, v, diag, off_a, off_b, rhs_t) in [
            (
                self.qbd.expect("setup ran"),
                &self.jct_d,
                vbd,
                h.dp_dp,
                h.b_dp,
                h.dp_b,
                h.rhs_dp,
            ),
            (
                self.qbs.expect("setup ran"),
                &self.jct_s,
                self.vbs,
                h.sp_sp,
                h.b_sp,
                h.sp_b,
                h.rhs_sp,
            ),
        ] {
            let (q, cap) = jct.charge(&m, v);
            st.pool.set_slot_value(slot, q);
            st.integrate(slot);
            let geq = st.jacobian(cap);
            let ieq = st.rhs_current(slot, geq, v);
            mna.add(h.b_b, geq);
            mna.add(diag, geq);
            mna.add(off_a, -geq);
            mna.add(off_b, -geq);
            mna.add_rhs(h.rhs_b, sign * ieq);
            mna.add_rhs(rhs_t, -sign * ieq);
        }

        // Meyer gate capacitances, averaged over this and the previous
        // timepoint, plus the constant overlaps
        let capgs_state = self.capgs_state.expect("setup ran");
        let capgd_state = self.capgd_state.expect("setup ran");
        let capgb_state = self.capgb_state.expect("setup ran");
        let (vgsx, vgdx) = if self.mode >= 0.0 {
            (self.vgs, self.vgs - self.vds)
        } else {
            (self.vgs - self.vds, self.vgs)
        };
        let (cgs_now, cgd_now, cgb_now) =
            meyer_caps(vgsx, vgdx, self.von, self.vdsat, m.phi, self.oxide_cap);
        let (cgs_now, cgd_now) = if self.mode >= 0.0 {
            (cgs_now, cgd_now)
        } else {
            (cgd_now, cgs_now)
        };
        st.pool.set_value(capgs_state, cgs_now);
        st.pool.set_value(capgd_state, cgd_now);
        st.pool.set_value(capgb_state, cgb_now);

        let capgs = cgs_now + st.pool.previous(capgs_state, 1) + self.overlap_gs;
        let capgd = cgd_now + st.pool.previous(capgd_state, 1) + self.overlap_gd;
        let capgb = cgb_now + st.pool.previous(capgb_state, 1) + self.overlap_gb;

        let vgd = self.vgs - self.vds;
        let vgb = self.vgs - self.vbs;
        // gate-source
        {
            let slot = self.qgs.expect("setup ran");
            let q1 = st.pool.slot_previous(slot, 1);
            let vgs1 = st.pool.previous(self.vgs_state.expect("setup ran"), 1);
            st.pool.set_slot_value(slot, q1 + capgs * (self.vgs - vgs1));
            st.integrate(slot);
            let geq = st.jacobian(capgs);
            let ieq = st.rhs_current(slot, geq, self.vgs);
            mna.add(h.g_g, geq);
            mna.add(h.sp_sp, geq);
            mna.add(h.g_sp, -geq);
            mna.add(h.sp_g, -geq);
            mna.add_rhs(h.rhs_g, sign * ieq);
            mna.add_rhs(h.rhs_sp, -sign * ieq);
        }
        // gate-drain
        {
            let slot = self.qgd.expect("setup ran");
            let q1 = st.pool.slot_previous(slot, 1);
            let vds1 = st.pool.previous(self.vds_state.expect("setup ran"), 1);
            let vgs1 = st.pool.previous(self.vgs_state.expect("setup ran"), 1);
            let vgd1 = vgs1 - vds1;
            st.pool.set_slot_value(slot, q1 + capgd * (vgd - vgd1));
            st.integrate(slot);
            let geq = st.jacobian(capgd);
            let ieq = st.rhs_current(slot, geq, vgd);
            mna.add(h.g_g, geq);
            mna.add(h.dp_dp, geq);
            mna.add(h.g_dp, -geq);
            mna.add(h.dp_g, -geq);
            mna.add_rhs(h.rhs_g, sign * ieq);
            mna.add_rhs(h.rhs_dp, -sign * ieq);
        }
        // gate-bulk
        {
            let slot = self.qgb.expect("setup ran");
            let q1 = st.pool.slot_previous(slot, 1);
            let vgs1 = st.pool.previous(self.vgs_state.expect("setup ran"), 1);
            let vbs1 = st.pool.previous(self.vbs_state.expect("setup ran"), 1);
            let vgb1 = vgs1 - vbs1;
            st.pool.set_slot_value(slot, q1 + capgb * (vgb - vgb1));
            st.integrate(slot);
            let geq = st.jacobian(capgb);
            let ieq = st.rhs_current(slot, geq, vgb);
            mna.add(h.g_g, geq);
            mna.add(h.b_b, geq);
            mna.add(h.g_b, -geq);
            mna.add(h.b_g, -geq);
            mna.add_rhs(h.rhs_g, sign * ieq);
            mna.add_rhs(h.rhs_b, -sign * ieq);
        }
        Ok(())
    }
}

impl behavior::AcLoad for MosfetSim {
    fn ac_load(&mut self, mna: &mut Mna, st: &SimState, omega: f64) -> Result<()> {
        let h = self.handles.as_ref().expect("setup ran");
        if let Some(q) = h.drain_series {
            q.add_complex(mna, Complex64::new(self.gdpr, 0.0));
        }
        if let Some(q) = h.source_series {
            q.add_complex(mna, Complex64::new(self.gspr, 0.0));
        }

        let (xnrm, xrev) = if self.mode >= 0.0 { (1.0, 0.0) } else { (0.0, 1.0) };
        let (gm, gds, gmbs) = (self.gm, self.gds, self.gmbs);
        let (gbd, gbs) = (self.gbd, self.gbs);

        // capacitances at the operating point
        let m = self.model.borrow();
        let (vgsx, vgdx) = if self.mode >= 0.0 {
            (self.vgs, self.vgs - self.vds)
        } else {
            (self.vgs - self.vds, self.vgs)
        };
        let (cgs_op, cgd_op, cgb_op) =
            meyer_caps(vgsx, vgdx, self.von, self.vdsat, m.phi, self.oxide_cap);
        let (cgs_op, cgd_op) = if self.mode >= 0.0 {
            (cgs_op, cgd_op)
        } else {
            (cgd_op, cgs_op)
        };
        let capgs = 2.0 * cgs_op + self.overlap_gs;
        let capgd = 2.0 * cgd_op + self.overlap_gd;
        let capgb = 2.0 * cgb_op + self.overlap_gb;
        let (_, capbd) = self.jct_d.charge(&m, self.vbs - self.vds);
        let (_, capbs) = self.jct_s.charge(&m, self.vbs);
        drop(m);

        let (jgs, jgd, jgb) = (
            Complex64::new(0.0, omega * capgs),
            Complex64::new(0.0, omega * capgd),
            Complex64::new(0.0, omega * capgb),
        );
        let (jbd, jbs) = (
            Complex64::new(0.0, omega * capbd),
            Complex64::new(0.0, omega * capbs),
        );

        mna.add_complex(h.g_g, jgs + jgd + jgb);
        mna.add_complex(h.g_dp, -jgd);
        mna.add_complex(h.g_sp, -jgs);
        mna.add_complex(h.g_b, -jgb);
        mna.add_complex(h.b_g, -jgb);
        mna.add_complex(h.b_b, jgb + jbd + jbs);
        mna.add_complex(h.b_dp, -jbd);
        mna.add_complex(h.b_sp, -jbs);

        let re = |x: f64| Complex64::new(x, 0.0);
        mna.add_complex(h.dp_dp, re(gds + gbd + xrev * (gm + gmbs)) + jbd + jgd);
        mna.add_complex(h.sp_sp, re(gds + gbs + xnrm * (gm + gmbs)) + jbs + jgs);
        mna.add_complex(h.dp_g, re((xnrm - xrev) * gm) - jgd);
        mna.add_complex(h.dp_b, re(-gbd + (xnrm - xrev) * gmbs) - jbd);
        mna.add_complex(h.dp_sp, re(-gds - xnrm * (gm + gmbs)));
        mna.add_complex(h.sp_g, re(-(xnrm - xrev) * gm) - jgs);
        mna.add_complex(h.sp_b, re(-gbs - (xnrm - xrev) * gmbs) - jbs);
        mna.add_complex(h.sp_dp, re(-gds - xrev * (gm + gmbs)));
        Ok(())
    }
}

impl behavior::Noise for MosfetSim {
    fn noise(&mut self, st: &SimState, ac: &DVector<Complex64>, frequency: f64) -> f64 {
        let (kf, af) = {
            let m = self.model.borrow();
            (m.kf, m.af)
        };
        // channel thermal noise at 8kT*gm/3
        self.thermal.set_coefficients(&[
            8.0 / 3.0 * voltaic_core::constants::BOLTZMANN * st.temperature * self.gm.abs(),
        ]);
        self.flicker.set_coefficients(&[kf, self.cd, af]);
        self.thermal.calculate(ac, frequency) + self.flicker.calculate(ac, frequency)
    }
}

/// Bulk junction diode current, linearised in reverse bias.
fn junction_current(v: f64, vt: f64, isat: f64) -> (f64, f64) {
    if v <= 0.0 {
        let g = isat / vt;
        (g * v, g)
    } else {
        let ev = (v / vt).exp();
        (isat * (ev - 1.0), isat * ev / vt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use voltaic_core::Entity;
    use voltaic_core::behavior::Temperature as _;

    fn test_sim() -> MosfetSim {
        let model_entity = Entity::new("MX", "mos-model")
            .with_params(model_params())
            .with_param("vto", 0.7)
            .with_param("kp", 2e-5)
            .with_param("gamma", 0.4)
            .with_param("lambda", 0.02);
        let mut mt = MosModelTemperature::new(&model_entity).unwrap();
        let mut st = SimState::new();
        mt.temperature(&mut st).unwrap();

        let e = Entity::new("M1", "mosfet")
            .with_params(instance_params())
            .with_pins(["d", "g", "s", "b"])
            .with_param("w", 10e-6)
            .with_param("l", 1e-6);
        let cfg = voltaic_core::AnalysisConfig::default();
        let model_rc = Rc::new(RefCell::new(mt));
        let bundle = BehaviorBundle::of(&model_rc).temperature(&model_rc);
        let mut set = voltaic_core::behavior::BehaviorSet::default();
        set.merge(bundle);
        let ctx = BindingContext {
            entity: &e,
            pins: &[1, 2, 3, 4],
            model: Some(&model_entity),
            model_behaviors: Some(&set),
            config: &cfg,
        };
        let mut sim = MosfetSim::new(&ctx).unwrap();
        let mut st = SimState::new();
        sim.temperature(&mut st).unwrap();
        sim
    }

    #[test]
    fn channel_regions() {
        let sim = test_sim();
        let m = sim.model.clone();
        let m = m.borrow();

        // cutoff
        let (id, gm, _, _, _, _) = sim.channel(&m, 0.3, 1.0, 0.0);
        assert_eq!(id, 0.0);
        assert_eq!(gm, 0.0);

        // saturation: id = beta/2 * vgst^2 * (1 + lambda*vds)
        let (id, gm, gds, _, von, vdsat) = sim.channel(&m, 1.7, 2.0, 0.0);
        let vgst = 1.7 - von;
        let expect = sim.beta * (1.0 + 0.02 * 2.0) * vgst * vgst / 2.0;
        assert!((id - expect).abs() / expect < 1e-12);
        assert!(gm > 0.0 && gds > 0.0);
        assert!((vdsat - vgst).abs() < 1e-12);

        // linear
        let (id_lin, ..) = sim.channel(&m, 1.7, 0.1, 0.0);
        assert!(id_lin < id);
    }

    #[test]
    fn gm_matches_numeric_derivative() {
        let sim = test_sim();
        let m = sim.model.clone();
        let m = m.borrow();
        let eps = 1e-7;
        let (id0, gm, ..) = sim.channel(&m, 1.5, 2.0, 0.0);
        let (id1, ..) = sim.channel(&m, 1.5 + eps, 2.0, 0.0);
        let numeric = (id1 - id0) / eps;
        assert!(
            (numeric - gm).abs() / gm < 1e-4,
            "gm {gm} vs numeric {numeric}"
        );
    }

    #[test]
    fn body_effect_raises_threshold() {
        let sim = test_sim();
        let m = sim.model.clone();
        let m = m.borrow();
        let (.., von0, _) = sim.channel(&m, 1.5, 1.0, 0.0);
        let (.., von1, _) = sim.channel(&m, 1.5, 1.0, -2.0);
        assert!(von1 > von0, "reverse bulk bias must raise von");
    }

    #[test]
    fn depletion_charge_is_continuous_at_the_breakpoint() {
        let sim = test_sim();
        let m = sim.model.clone();
        let m = m.borrow();
        let jct = JunctionCoeffs::new(&m, 1e-12, 0.0);
        let eps = 1e-9;
        let (q_below, c_below) = jct.charge(&m, m.dep_cap - eps);
        let (q_above, c_above) = jct.charge(&m, m.dep_cap + eps);
        assert!((q_below - q_above).abs() < 1e-18, "charge jump");
        assert!((c_below - c_above).abs() < 1e-15, "capacitance jump");
    }
}

pub fn register(reg: &mut BehaviorRegistry) {
    reg.register(
        "mos-model",
        BehaviorKind::Temperature,
        std::sync::Arc::new(|ctx| {
            let temp = Rc::new(RefCell::new(MosModelTemperature::new(ctx.entity)?));
            Ok(BehaviorBundle::of(&temp).temperature(&temp))
        }),
    );
    reg.register_many(
        "mosfet",
        &[
            BehaviorKind::Temperature,
            BehaviorKind::Load,
            BehaviorKind::AcLoad,
            BehaviorKind::Transient,
            BehaviorKind::Noise,
        ],
        std::sync::Arc::new(|ctx| {
            let sim = Rc::new(RefCell::new(MosfetSim::new(ctx)?));
            Ok(BehaviorBundle::of(&sim)
                .temperature(&sim)
                .load(&sim)
                .ac_load(&sim)
                .transient(&sim)
                .noise(&sim))
        }),
    );
}
