//! Engine-level properties: assembly invariants, setup idempotency,
//! recovery paths, AC/noise behavior, cancellation.

use num_complex::Complex64;
use voltaic_core::behavior::BehaviorKind;
use voltaic_core::constants::BOLTZMANN;
use voltaic_core::{
    AnalysisConfig, CancelToken, Circuit, Entity, Error, NullSink, VecSink,
};
use voltaic_devices::{
    capacitor, controlled, mosfet, register_builtins, resistor, sources, switch,
};
use voltaic_solver::{
    AcSweep, Simulation, Variation, run_ac, run_noise, run_op, run_tran,
};

fn divider() -> Circuit {
    let mut ckt = Circuit::new();
    ckt.add(
        Entity::new("V1", "vsource")
            .with_params(sources::instance_params())
            .with_pins(["in", "0"])
            .with_param("dc", 5.0)
            .with_param("acmag", 1.0),
    );
    ckt.add(
        Entity::new("R1", "resistor")
            .with_params(resistor::instance_params())
            .with_pins(["in", "mid"])
            .with_param("r", 1000.0),
    );
    ckt.add(
        Entity::new("R2", "resistor")
            .with_params(resistor::instance_params())
            .with_pins(["mid", "0"])
            .with_param("r", 1000.0),
    );
    ckt
}

/// Kirchhoff current law at the internal node of the divider, from the
/// converged solution.
#[test]
fn kcl_holds_at_every_node() {
    register_builtins();
    let ckt = divider();
    let (sim, _) = run_op(
        &ckt,
        AnalysisConfig::default(),
        &mut NullSink,
        CancelToken::new(),
    )
    .unwrap();

    let v_in = sim.voltage("in").unwrap();
    let v_mid = sim.voltage("mid").unwrap();
    let into_mid = (v_in - v_mid) / 1000.0;
    let out_of_mid = v_mid / 1000.0;
    assert!(
        (into_mid - out_of_mid).abs() < 1e-12,
        "KCL residual {}",
        into_mid - out_of_mid
    );
}

/// setup -> unsetup -> setup reproduces the matrix pattern and the state
/// slot allocation exactly.
#[test]
fn setup_unsetup_is_idempotent() {
    register_builtins();
    let ckt = divider();
    let mut sim = Simulation::build(
        &ckt,
        AnalysisConfig::default(),
        &[BehaviorKind::Temperature, BehaviorKind::Load],
    )
    .unwrap();

    sim.setup().unwrap();
    let pattern = sim.pattern_len();
    let entries = sim.state_entries();
    let unknowns = sim.unknowns();

    sim.unsetup();
    sim.setup().unwrap();
    assert_eq!(sim.pattern_len(), pattern);
    assert_eq!(sim.state_entries(), entries);
    assert_eq!(sim.unknowns(), unknowns);
}

/// A node with no DC path to ground is diagnosed as a topology error
/// after both stepping strategies fail to rescue it.
#[test]
fn floating_node_is_diagnosed() {
    register_builtins();
    let mut ckt = Circuit::new();
    ckt.add(
        Entity::new("V1", "vsource")
            .with_params(sources::instance_params())
            .with_pins(["a", "0"])
            .with_param("dc", 1.0),
    );
    ckt.add(
        Entity::new("C1", "capacitor")
            .with_params(capacitor::instance_params())
            .with_pins(["a", "float"])
            .with_param("c", 1e-9),
    );

    let err = run_op(
        &ckt,
        AnalysisConfig::default(),
        &mut NullSink,
        CancelToken::new(),
    )
    .map(|_| ())
    .unwrap_err();
    assert!(
        matches!(err, Error::CircuitTopology(_)),
        "expected a topology diagnosis, got {err}"
    );
}

/// RC low-pass at its corner frequency: |H| = 1/sqrt(2).
#[test]
fn ac_rc_corner() {
    register_builtins();
    let mut ckt = Circuit::new();
    ckt.add(
        Entity::new("V1", "vsource")
            .with_params(sources::instance_params())
            .with_pins(["in", "0"])
            .with_param("acmag", 1.0),
    );
    ckt.add(
        Entity::new("R1", "resistor")
            .with_params(resistor::instance_params())
            .with_pins(["in", "out"])
            .with_param("r", 1000.0),
    );
    ckt.add(
        Entity::new("C1", "capacitor")
            .with_params(capacitor::instance_params())
            .with_pins(["out", "0"])
            .with_param("c", 1e-6),
    );

    let corner = 1.0 / (2.0 * std::f64::consts::PI * 1000.0 * 1e-6);
    let sweep = AcSweep {
        variation: Variation::Linear,
        points: 2,
        fstart: corner,
        fstop: corner * 10.0,
    };
    let (sim, results) = run_ac(
        &ckt,
        AnalysisConfig::default(),
        &sweep,
        &mut NullSink,
        CancelToken::new(),
    )
    .unwrap();

    let out = sim.node_index("out").unwrap();
    let h: Complex64 = results[0].1[out];
    let mag = h.norm();
    assert!(
        (mag - std::f64::consts::FRAC_1_SQRT_2).abs() < 1e-6,
        "|H(fc)| = {mag}"
    );
    // a decade up the response is about -20 dB per decade
    let mag10 = results[1].1[out].norm();
    assert!(mag10 < 0.11 && mag10 > 0.09, "|H(10 fc)| = {mag10}");
}

/// Resistor thermal noise through the AC transfer of the divider.
#[test]
fn noise_of_a_divider() {
    register_builtins();
    let ckt = divider();
    let sweep = AcSweep {
        variation: Variation::Linear,
        points: 2,
        fstart: 1.0,
        fstop: 10.0,
    };
    let config = AnalysisConfig::default();
    let temp = config.temperature;
    let (_, results) = run_noise(&ckt, config, &sweep, &mut NullSink, CancelToken::new())
        .unwrap();

    // both resistors see half the unit AC drive across themselves:
    // total = 2 * 4kT/R * |0.5|^2
    let expect = 2.0 * 4.0 * BOLTZMANN * temp / 1000.0 * 0.25;
    let (_, total) = results[0];
    assert!(
        (total - expect).abs() / expect < 1e-9,
        "noise PSD {total:.3e}, expected {expect:.3e}"
    );
}

/// A voltage-controlled switch conducts per its hysteretic thresholds.
#[test]
fn vswitch_tracks_its_control() {
    register_builtins();
    let build = |vctrl: f64| {
        let mut ckt = Circuit::new();
        ckt.add_model(
            Entity::new("SW", "switch-model")
                .with_params(switch::model_params())
                .with_param("ron", 1.0)
                .with_param("roff", 1e9)
                .with_param("vt", 1.0)
                .with_param("vh", 0.2),
        );
        ckt.add(
            Entity::new("V1", "vsource")
                .with_params(sources::instance_params())
                .with_pins(["in", "0"])
                .with_param("dc", 5.0),
        );
        ckt.add(
            Entity::new("VC", "vsource")
                .with_params(sources::instance_params())
                .with_pins(["ctl", "0"])
                .with_param("dc", vctrl),
        );
        ckt.add(
            Entity::new("R1", "resistor")
                .with_params(resistor::instance_params())
                .with_pins(["in", "out"])
                .with_param("r", 1000.0),
        );
        ckt.add(
            Entity::new("S1", "vswitch")
                .with_params(switch::instance_params())
                .with_pins(["out", "0", "ctl", "0"])
                .with_model("SW"),
        );
        ckt
    };

    let (sim_on, _) = run_op(
        &build(2.0),
        AnalysisConfig::default(),
        &mut NullSink,
        CancelToken::new(),
    )
    .unwrap();
    assert!(sim_on.voltage("out").unwrap() < 0.01, "switch should be on");

    let (sim_off, _) = run_op(
        &build(0.5),
        AnalysisConfig::default(),
        &mut NullSink,
        CancelToken::new(),
    )
    .unwrap();
    assert!(sim_off.voltage("out").unwrap() > 4.9, "switch should be off");
}

/// NMOS common-source stage: square-law saturation current sets the
/// drain voltage.
#[test]
fn mosfet_common_source_op() {
    register_builtins();
    let mut ckt = Circuit::new();
    ckt.add_model(
        Entity::new("NMOD", "mos-model")
            .with_params(mosfet::model_params())
            .with_param("vto", 0.7)
            .with_param("kp", 2e-5),
    );
    ckt.add(
        Entity::new("VDD", "vsource")
            .with_params(sources::instance_params())
            .with_pins(["vdd", "0"])
            .with_param("dc", 5.0),
    );
    ckt.add(
        Entity::new("VG", "vsource")
            .with_params(sources::instance_params())
            .with_pins(["g", "0"])
            .with_param("dc", 2.0),
    );
    ckt.add(
        Entity::new("RD", "resistor")
            .with_params(resistor::instance_params())
            .with_pins(["vdd", "d"])
            .with_param("r", 10_000.0),
    );
    ckt.add(
        Entity::new("M1", "mosfet")
            .with_params(mosfet::instance_params())
            .with_pins(["d", "g", "0", "0"])
            .with_model("NMOD")
            .with_param("w", 10e-6)
            .with_param("l", 1e-6),
    );

    let mut config = AnalysisConfig::default();
    config.reltol = 1e-6;
    let (sim, _) = run_op(&ckt, config, &mut NullSink, CancelToken::new()).unwrap();

    // beta = kp*w/l = 2e-4; id = beta/2*(vgs-vto)^2 = 1.69e-4 A
    let id = 2e-4 / 2.0 * (2.0 - 0.7f64).powi(2);
    let expect = 5.0 - 10_000.0 * id;
    let vd = sim.voltage("d").unwrap();
    assert!(
        (vd - expect).abs() / expect < 0.01,
        "V(d) = {vd}, expected {expect}"
    );
}

/// VCVS gain shows up directly in the output voltage.
#[test]
fn vcvs_amplifies() {
    register_builtins();
    let mut ckt = Circuit::new();
    ckt.add(
        Entity::new("V1", "vsource")
            .with_params(sources::instance_params())
            .with_pins(["in", "0"])
            .with_param("dc", 0.5),
    );
    ckt.add(
        Entity::new("E1", "vcvs")
            .with_params(controlled::gain_params())
            .with_pins(["out", "0", "in", "0"])
            .with_param("gain", 10.0),
    );
    ckt.add(
        Entity::new("RL", "resistor")
            .with_params(resistor::instance_params())
            .with_pins(["out", "0"])
            .with_param("r", 1000.0),
    );

    let (sim, _) = run_op(
        &ckt,
        AnalysisConfig::default(),
        &mut NullSink,
        CancelToken::new(),
    )
    .unwrap();
    let out = sim.voltage("out").unwrap();
    assert!((out - 5.0).abs() < 1e-9, "V(out) = {out}");
}

/// Cancellation surfaces as `Cancelled` with partial state preserved.
#[test]
fn cancellation_is_honored() {
    register_builtins();
    let ckt = divider();
    let token = CancelToken::new();
    token.cancel();

    let result = run_op(
        &ckt,
        AnalysisConfig::default(),
        &mut NullSink,
        token.clone(),
    );
    assert!(matches!(result, Err(Error::Cancelled)));

    let mut config = AnalysisConfig::default();
    config.tstop = 1e-3;
    let result = run_tran(&ckt, config, &mut NullSink, token);
    assert!(matches!(result, Err(Error::Cancelled)));
}

/// The sink sees every accepted transient point, in time order.
#[test]
fn sink_receives_monotone_timepoints() {
    register_builtins();
    let mut ckt = divider();
    ckt.add(
        Entity::new("C1", "capacitor")
            .with_params(capacitor::instance_params())
            .with_pins(["mid", "0"])
            .with_param("c", 1e-7),
    );

    let mut config = AnalysisConfig::default();
    config.tstop = 1e-4;
    config.tstep = 1e-6;
    let mut sink = VecSink::new();
    run_tran(&ckt, config, &mut sink, CancelToken::new()).unwrap();

    let mut last = -1.0;
    for (label, _) in &sink.points {
        if let voltaic_core::PointLabel::Time(t) = label {
            assert!(*t > last || (*t == 0.0 && last < 0.0), "time went backwards");
            last = *t;
        }
    }
    assert!(last >= 1e-4 * (1.0 - 1e-9), "simulation ran to tstop");
}
