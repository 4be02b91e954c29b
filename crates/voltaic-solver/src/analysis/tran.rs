//! Transient analysis with LTE-based timestep control.
//!
//! One step of the controller: propose a delta, load and solve with the
//! integrator's companion models, then judge the local truncation error.
//! Newton failure halves the step and retries from the last accepted
//! time; an LTE overrun shrinks it; acceptance commits the state (Accept
//! behaviors first, history ring after) and proposes the next delta from
//! the per-slot error estimates.

use voltaic_core::behavior::BehaviorKind;
use voltaic_core::integrate::Integrator;
use voltaic_core::state::InitMode;
use voltaic_core::{
    AnalysisConfig, CancelToken, Circuit, Error, PointLabel, Result, ResultSink,
};

use crate::simulation::Simulation;

use super::emit_point;

/// Counters the controller reports back.
#[derive(Debug, Clone, Copy, Default)]
pub struct TranStats {
    pub accepted: usize,
    pub rejected: usize,
    pub newton_failures: usize,
    pub min_delta: f64,
    pub max_delta: f64,
}

/// Run a transient analysis to `config.tstop`.
pub fn run_tran(
    circuit: &Circuit,
    config: AnalysisConfig,
    sink: &mut dyn ResultSink,
    cancel: CancelToken,
) -> Result<(Simulation, TranStats)> {
    if config.tstop <= 0.0 {
        return Err(Error::MissingParameter("tstop".into()));
    }
    let mut sim = Simulation::build(
        circuit,
        config,
        &[
            BehaviorKind::Temperature,
            BehaviorKind::Load,
            BehaviorKind::Transient,
            BehaviorKind::Accept,
        ],
    )?;
    sim.cancel = cancel;
    sim.setup()?;
    sim.run_temperature()?;

    let tstop = sim.config.tstop;
    let maxstep = sim.config.effective_maxstep();
    let delmin = (maxstep * 1e-9).max(1e-21);

    // starting point: operating point, or user ICs when uic is set
    if sim.config.uic {
        for (node, v) in sim.config.icvoltage.clone() {
            if let Some(i) = sim.node_index(&node) {
                sim.state.solution[i] = v;
            }
        }
        sim.state.uic = true;
        sim.state.mode = InitMode::Normal;
        sim.initialized = true;
        // one seeding pass so every charge state reflects the ICs
        sim.load()?;
    } else {
        sim.solve_op()?;
        // one more load so every device state reflects the converged point
        sim.load()?;
    }
    sim.state.prev_solution.copy_from(&sim.state.solution);
    sim.state.pool.init_history(0.0);
    sim.state.transient = true;
    sim.state.integ = Integrator::new(sim.config.method, sim.config.order);

    emit_point(&sim, sink, PointLabel::Time(0.0));

    let mut stats = TranStats {
        min_delta: f64::INFINITY,
        ..Default::default()
    };
    let mut t = 0.0;
    let mut delta = sim.config.tstep.clamp(delmin, maxstep);

    while t < tstop * (1.0 - 1e-12) {
        sim.cancel.check()?;
        if t + delta > tstop {
            delta = tstop - t;
        }
        let t_new = t + delta;
        sim.state.time = t_new;
        sim.state.delta = delta;
        sim.state.integ.begin_step(delta);

        match sim.iterate(sim.config.itl4) {
            Ok(_) => {}
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(e) => {
                stats.newton_failures += 1;
                log::debug!("transient Newton failure at t = {t_new:.3e}: {e}");
                delta /= 2.0;
                if delta < delmin {
                    return Err(Error::TimestepTooSmall {
                        time: t,
                        delta,
                    });
                }
                rewind(&mut sim);
                // retry from the accepted point without junction re-init
                sim.initialized = true;
                continue;
            }
        }

        // local truncation error across every derivative slot
        let mut dt_next = maxstep.min(2.0 * delta);
        if stats.accepted > 0 {
            let limit = lte_limit(&sim, t_new);
            if limit < 0.9 * delta {
                stats.rejected += 1;
                let shrunk = limit.max(delta * 0.25);
                if shrunk < delmin {
                    return Err(Error::TimestepTooSmall {
                        time: t,
                        delta: shrunk,
                    });
                }
                delta = shrunk;
                rewind(&mut sim);
                continue;
            }
            dt_next = dt_next.min(limit);
        }

        // accept: device commits in entity order, then the ring advances
        sim.accept_all();
        sim.state.pool.advance(t_new);
        sim.state.prev_solution.copy_from(&sim.state.solution);
        t = t_new;
        stats.accepted += 1;
        stats.min_delta = stats.min_delta.min(delta);
        stats.max_delta = stats.max_delta.max(delta);

        emit_point(&sim, sink, PointLabel::Time(t));

        sim.state.integ.raise_order();
        delta = dt_next.clamp(delmin, maxstep);
    }

    Ok((sim, stats))
}

/// Smallest next-step proposal over all derivative slots.
fn lte_limit(sim: &Simulation, t_new: f64) -> f64 {
    let cfg = &sim.config;
    let mut limit = f64::INFINITY;
    for &slot in sim.state.pool.slots() {
        let dt = sim.state.integ.truncation_step(
            &sim.state.pool,
            slot,
            t_new,
            cfg.reltol,
            cfg.abstol,
            cfg.trtol,
        );
        limit = limit.min(dt);
    }
    limit
}

/// Roll the working state back to the last accepted timepoint.
fn rewind(sim: &mut Simulation) {
    sim.state.pool.rewind();
    let prev = sim.state.prev_solution.clone();
    sim.state.solution.copy_from(&prev);
}
