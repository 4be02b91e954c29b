//! Newton-Raphson iteration with Gmin and source stepping.
//!
//! One operating-point solve walks the three-valued initialisation
//! machine (junction forcing, then user ICs, then free iteration), then
//! repeats load / factor / solve until the node deltas and every device's
//! own convergence test pass. A junction that had to be limited votes
//! non-convergence, which keeps the solver iterating even when the
//! tolerance tests would pass.
//!
//! On a singular matrix or an iteration-cap overrun the solver recovers
//! locally: Gmin stepping ramps a diagonal shunt down to nothing, source
//! stepping ramps the independent sources up from zero. The config picks
//! which runs first; the original error surfaces only after both fail.

use voltaic_core::matrix::FactorOutcome;
use voltaic_core::nodes::UnknownKind;
use voltaic_core::state::InitMode;
use voltaic_core::{Error, Result, Stepping};

use crate::simulation::Simulation;

/// What an operating-point solve had to do.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OpStats {
    /// Newton iterations of the final (successful) solve.
    pub iterations: usize,
    /// Gmin-stepping ladder rungs used.
    pub gmin_steps: usize,
    /// Source-stepping ramp points used.
    pub source_steps: usize,
}

/// The Gmin-stepping ladder: shunt conductances tried in order, followed
/// by a final solve with no shunt at all.
const GMIN_LADDER: [f64; 4] = [1e-3, 1e-6, 1e-9, 1e-12];

/// Source-stepping ramp: scale factors applied to independent sources.
const SOURCE_RAMP: [f64; 10] = [0.1, 0.2, 0.3, 0.4, 0.5, 0.6, 0.7, 0.8, 0.9, 1.0];

impl Simulation {
    /// Solve the operating point, recovering through the stepping
    /// strategies when the plain iteration fails.
    pub fn solve_op(&mut self) -> Result<OpStats> {
        let mut stats = OpStats::default();
        match self.iterate(self.config.itl1) {
            Ok(n) => {
                stats.iterations = n;
                return Ok(stats);
            }
            Err(Error::Cancelled) => return Err(Error::Cancelled),
            Err(first_error) => {
                log::debug!("operating point failed ({first_error}), stepping in");
                let strategies: [Stepping; 2] = match self.config.stepping {
                    Stepping::GminThenSource => {
                        [Stepping::GminThenSource, Stepping::SourceThenGmin]
                    }
                    Stepping::SourceThenGmin => {
                        [Stepping::SourceThenGmin, Stepping::GminThenSource]
                    }
                };
                for strategy in strategies {
                    let outcome = match strategy {
                        Stepping::GminThenSource => self.gmin_stepping(&mut stats),
                        Stepping::SourceThenGmin => self.source_stepping(&mut stats),
                    };
                    match outcome {
                        Ok(n) => {
                            stats.iterations = n;
                            return Ok(stats);
                        }
                        Err(Error::Cancelled) => return Err(Error::Cancelled),
                        Err(e) => log::debug!("stepping strategy failed: {e}"),
                    }
                }
                Err(first_error)
            }
        }
    }

    /// Plain Newton iteration up to `limit` passes.
    ///
    /// Returns the iteration count on convergence. The caller owns
    /// recovery; this function reports `SingularMatrix`/`NoConvergence`.
    pub(crate) fn iterate(&mut self, limit: usize) -> Result<usize> {
        if !self.initialized {
            self.state.mode = InitMode::Junction;
        }
        let mut iterations = 0;
        loop {
            self.cancel.check()?;
            self.load()?;
            match self.mna.factor() {
                FactorOutcome::Ok => {}
                FactorOutcome::Singular { row } => {
                    // a failed matrix resets the initialisation machine
                    self.initialized = false;
                    return Err(self.classify_singular(row));
                }
            }
            self.state.prev_iter.copy_from(&self.state.solution);
            self.mna.solve(&mut self.state.solution)?;
            iterations += 1;

            match self.state.mode {
                InitMode::Junction => {
                    self.state.mode = InitMode::Fix;
                    continue;
                }
                InitMode::Fix => {
                    self.state.mode = InitMode::Normal;
                    continue;
                }
                InitMode::Normal => {}
            }

            if !self.state.nonconverged() && self.converged() {
                self.initialized = true;
                return Ok(iterations);
            }
            if iterations >= limit {
                return Err(Error::NoConvergence(limit));
            }
        }
    }

    /// Node-delta and per-device convergence tests.
    fn converged(&self) -> bool {
        let cfg = &self.config;
        for i in 1..self.state.solution.len() {
            let new = self.state.solution[i];
            let old = self.state.prev_iter[i];
            if !new.is_finite() {
                return false;
            }
            let floor = match self.nodes.kind(i) {
                Some(UnknownKind::Current) => cfg.abstol,
                _ => cfg.vntol,
            };
            let tol = cfg.reltol * new.abs().max(old.abs()) + floor;
            if (new - old).abs() > tol {
                return false;
            }
        }
        for set in self.behaviors.values() {
            if let Some(l) = &set.load {
                if !l.borrow().is_convergent(&self.state, cfg) {
                    return false;
                }
            }
        }
        true
    }

    /// Ramp a diagonal shunt down the ladder, then solve with none.
    fn gmin_stepping(&mut self, stats: &mut OpStats) -> Result<usize> {
        self.initialized = false;
        for &g in &GMIN_LADDER {
            self.diag_gmin = g;
            stats.gmin_steps += 1;
            let r = self.iterate(self.config.itl1);
            if let Err(e) = r {
                self.diag_gmin = 0.0;
                return Err(e);
            }
        }
        self.diag_gmin = 0.0;
        self.iterate(self.config.itl1)
    }

    /// Ramp the independent sources from zero to full value.
    fn source_stepping(&mut self, stats: &mut OpStats) -> Result<usize> {
        self.initialized = false;
        let mut last = 0;
        for &f in &SOURCE_RAMP {
            self.state.srcfact = f;
            stats.source_steps += 1;
            match self.iterate(self.config.itl1) {
                Ok(n) => last = n,
                Err(e) => {
                    self.state.srcfact = 1.0;
                    return Err(e);
                }
            }
        }
        self.state.srcfact = 1.0;
        Ok(last)
    }
}
