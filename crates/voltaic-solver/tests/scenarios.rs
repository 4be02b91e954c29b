//! End-to-end scenarios: small circuits with analytically known answers.

use voltaic_core::constants::{REF_TEMPERATURE, thermal_voltage};
use voltaic_core::{AnalysisConfig, CancelToken, Circuit, Entity, NullSink, VecSink};
use voltaic_devices::{bjt, capacitor, diode, inductor, register_builtins, resistor, sources};
use voltaic_solver::{DcSweep, run_dc_sweep, run_op, run_tran};

fn resistor_entity(name: &str, pins: [&str; 2], r: f64) -> Entity {
    Entity::new(name, "resistor")
        .with_params(resistor::instance_params())
        .with_pins(pins)
        .with_param("r", r)
}

fn vsource_entity(name: &str, pins: [&str; 2], dc: f64) -> Entity {
    Entity::new(name, "vsource")
        .with_params(sources::instance_params())
        .with_pins(pins)
        .with_param("dc", dc)
}

/// Scenario 1: R1 = R2 = 1k divider across 5 V. V(mid) = 2.5 V.
#[test]
fn voltage_divider() {
    register_builtins();
    let mut ckt = Circuit::new();
    ckt.add(vsource_entity("V1", ["in", "0"], 5.0));
    ckt.add(resistor_entity("R1", ["in", "mid"], 1000.0));
    ckt.add(resistor_entity("R2", ["mid", "0"], 1000.0));

    let mut sink = VecSink::new();
    let (sim, stats) = run_op(
        &ckt,
        AnalysisConfig::default(),
        &mut sink,
        CancelToken::new(),
    )
    .expect("op converges");

    let mid = sim.voltage("mid").unwrap();
    assert!((mid - 2.5).abs() < 1e-9, "V(mid) = {mid}");
    assert!(stats.iterations > 0);
    assert_eq!(sink.last_value(sim.node_index("mid").unwrap()), Some(mid));
}

/// Scenario 2: ideal diode I-V against the Shockley equation, 0 -> 0.8 V.
#[test]
fn diode_iv_sweep() {
    register_builtins();
    let mut ckt = Circuit::new();
    ckt.add_model(Entity::new("DMOD", "diode-model").with_params(diode::model_params()));
    ckt.add(vsource_entity("V1", ["a", "0"], 0.0));
    ckt.add(
        Entity::new("D1", "diode")
            .with_params(diode::instance_params())
            .with_pins(["a", "0"])
            .with_model("DMOD"),
    );

    let mut config = AnalysisConfig::default();
    config.reltol = 1e-6;
    let sweep = DcSweep {
        source: "V1".into(),
        start: 0.0,
        stop: 0.8,
        step: 0.01,
    };
    let (sim, results) = run_dc_sweep(
        &ckt,
        config,
        &sweep,
        &mut NullSink,
        CancelToken::new(),
    )
    .expect("sweep converges");

    let branch = sim.node_index("V1#branch").unwrap();
    let vt = thermal_voltage(REF_TEMPERATURE);
    let (v, solution) = &results[70];
    assert!((v - 0.70).abs() < 1e-12);
    // the source branch current carries the diode current (negated)
    let i = -solution[branch];
    let expect = 1e-14 * ((0.70 / vt).exp() - 1.0);
    assert!(
        (i - expect).abs() / expect < 1e-3,
        "I(0.7 V) = {i:.6e}, Shockley gives {expect:.6e}"
    );
}

/// Scenario 3: RC step response. V_C(tau) = 1 - 1/e.
#[test]
fn rc_transient() {
    register_builtins();
    let mut ckt = Circuit::new();
    ckt.add(
        Entity::new("V1", "vsource")
            .with_params(sources::instance_params())
            .with_pins(["in", "0"])
            .with_param("pulse_v1", 0.0)
            .with_param("pulse_v2", 1.0)
            .with_param("pulse_tr", 1e-9)
            .with_param("pulse_tf", 1e-9),
    );
    ckt.add(resistor_entity("R1", ["in", "out"], 1000.0));
    ckt.add(
        Entity::new("C1", "capacitor")
            .with_params(capacitor::instance_params())
            .with_pins(["out", "0"])
            .with_param("c", 1e-6),
    );

    let mut config = AnalysisConfig::default();
    config.tstop = 1e-3;
    config.tstep = 1e-5;
    let (sim, stats) = run_tran(&ckt, config, &mut NullSink, CancelToken::new())
        .expect("transient completes");

    let vc = sim.voltage("out").unwrap();
    let expect = 1.0 - (-1.0f64).exp();
    assert!(
        (vc - expect).abs() / expect < 1e-3,
        "V_C(1 ms) = {vc}, expected {expect}"
    );
    assert!(stats.accepted >= 50);
}

/// Scenario 4: BJT with an open collector. The first Newton iteration is
/// singular when gmin is disabled; Gmin stepping must recover within its
/// four-rung ladder.
#[test]
fn open_collector_gmin_recovery() {
    register_builtins();
    let mut ckt = Circuit::new();
    ckt.add_model(Entity::new("QMOD", "bjt-model").with_params(bjt::model_params()));
    ckt.add(vsource_entity("VBE", ["b", "0"], 0.65));
    ckt.add(
        Entity::new("Q1", "bjt")
            .with_params(bjt::instance_params())
            .with_pins(["c", "b", "0"])
            .with_model("QMOD"),
    );

    let mut config = AnalysisConfig::default();
    config.gmin = 0.0;
    let (sim, stats) = run_op(&ckt, config, &mut NullSink, CancelToken::new())
        .expect("gmin stepping recovers the open collector");

    assert!(stats.gmin_steps >= 1, "recovery must have stepped");
    assert!(stats.gmin_steps <= 4, "ladder is four rungs: {stats:?}");
    // the floating collector settles near the base (the BC junction
    // carries no net current)
    let vc = sim.voltage("c").unwrap();
    assert!(vc > 0.0 && vc < 0.65, "V(c) = {vc}");
}

/// Scenario 5: common-emitter beta. Ic/Ib tracks BF within 2%.
#[test]
fn bjt_dc_sweep_beta() {
    register_builtins();
    let mut ckt = Circuit::new();
    ckt.add_model(Entity::new("Q2N", "bjt-model").with_params(bjt::model_params()));
    ckt.add(vsource_entity("VBE", ["b", "0"], 0.0));
    ckt.add(vsource_entity("VCC", ["c", "0"], 5.0));
    ckt.add(
        Entity::new("Q1", "bjt")
            .with_params(bjt::instance_params())
            .with_pins(["c", "b", "0"])
            .with_model("Q2N"),
    );

    let mut config = AnalysisConfig::default();
    config.reltol = 1e-6;
    let sweep = DcSweep {
        source: "VBE".into(),
        start: 0.5,
        stop: 0.8,
        step: 0.01,
    };
    let (sim, results) = run_dc_sweep(&ckt, config, &sweep, &mut NullSink, CancelToken::new())
        .expect("sweep converges");

    let ib_branch = sim.node_index("VBE#branch").unwrap();
    let ic_branch = sim.node_index("VCC#branch").unwrap();
    let (v, solution) = &results[15];
    assert!((v - 0.65).abs() < 1e-12);
    let ic = -solution[ic_branch];
    let ib = -solution[ib_branch];
    let beta = ic / ib;
    assert!(
        (beta - 100.0).abs() / 100.0 < 0.02,
        "beta = {beta} at Vbe = 0.65"
    );
}

/// Scenario 6: LC tank ringdown. Trapezoidal integration must hold the
/// stored energy over one period, and the controller must keep the step
/// below a fiftieth of the period.
#[test]
fn lc_tank_energy() {
    register_builtins();
    let inductance: f64 = 1e-3;
    let capacitance: f64 = 1e-6;
    let period = 2.0 * std::f64::consts::PI * (inductance * capacitance).sqrt();

    let mut ckt = Circuit::new();
    ckt.add(
        Entity::new("C1", "capacitor")
            .with_params(capacitor::instance_params())
            .with_pins(["tank", "0"])
            .with_param("c", capacitance)
            .with_param("ic", 1.0),
    );
    ckt.add(
        Entity::new("L1", "inductor")
            .with_params(inductor::instance_params())
            .with_pins(["tank", "0"])
            .with_param("l", inductance),
    );

    let mut config = AnalysisConfig::default();
    config.tstop = period;
    config.tstep = 1e-6;
    config.uic = true;
    config.set_ic("tank", 1.0);

    let (sim, stats) = run_tran(&ckt, config, &mut NullSink, CancelToken::new())
        .expect("transient completes");

    assert!(
        stats.max_delta <= period / 50.0 * (1.0 + 1e-9),
        "max delta {} exceeds T/50",
        stats.max_delta
    );

    let v = sim.voltage("tank").unwrap();
    let i = sim.solution()[sim.node_index("L1#branch").unwrap()];
    let energy = 0.5 * capacitance * v * v + 0.5 * inductance * i * i;
    let initial = 0.5 * capacitance;
    assert!(
        (energy - initial).abs() / initial < 0.01,
        "energy drifted: {energy:.6e} vs {initial:.6e}"
    );
}
