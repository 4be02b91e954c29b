//! Implicit integration formulas for derivative slots.
//!
//! Transient analysis replaces each charge/flux derivative with an implicit
//! formula over the slot's history: the trapezoidal rule (order 2) or the
//! Gear/BDF family (orders 1-6). The first step of any run is taken at
//! order 1 (backward Euler) because the ring holds no usable history yet;
//! the transient driver raises the order afterwards.

use crate::config::Method;
use crate::state::{SlotId, StatePool};

/// Highest supported Gear order.
pub const MAX_ORDER: usize = 6;

/// Fixed-step Gear (BDF) derivative coefficients: for order k,
/// `xdot[t] = sum(GEAR[k-1][i] * x[t-i]) / delta`.
const GEAR: [&[f64]; 6] = [
    &[1.0, -1.0],
    &[1.5, -2.0, 0.5],
    &[11.0 / 6.0, -3.0, 1.5, -1.0 / 3.0],
    &[25.0 / 12.0, -4.0, 3.0, -4.0 / 3.0, 0.25],
    &[137.0 / 60.0, -5.0, 5.0, -10.0 / 3.0, 1.25, -0.2],
    &[49.0 / 20.0, -6.0, 7.5, -20.0 / 3.0, 3.75, -1.2, 1.0 / 6.0],
];

/// Local-truncation-error constants: BDF orders 1-6.
const GEAR_ERR: [f64; 6] = [
    0.5,
    2.0 / 9.0,
    3.0 / 22.0,
    12.0 / 125.0,
    10.0 / 137.0,
    20.0 / 343.0,
];

/// Trapezoidal LTE constant (order 2).
const TRAP_ERR: f64 = 1.0 / 12.0;

/// The active implicit formula.
#[derive(Debug, Clone)]
pub struct Integrator {
    method: Method,
    /// Order the configuration asked for.
    target_order: usize,
    /// Order currently in force (1 on the first step).
    order: usize,
    delta: f64,
    /// Coefficient of the slot's current value, already scaled by 1/delta.
    ag0: f64,
}

impl Integrator {
    /// Create an integrator. Order is clamped to the method's legal range.
    pub fn new(method: Method, order: usize) -> Self {
        let target_order = match method {
            Method::Trapezoidal => order.clamp(1, 2),
            Method::Gear => order.clamp(1, MAX_ORDER),
        };
        Self {
            method,
            target_order,
            order: 1,
            delta: 0.0,
            ag0: 0.0,
        }
    }

    pub fn method(&self) -> Method {
        self.method
    }

    /// The order currently in force.
    pub fn order(&self) -> usize {
        self.order
    }

    /// Drop back to order 1 (run start, or after a discontinuity).
    pub fn reset_order(&mut self) {
        self.order = 1;
    }

    /// Raise the active order one step toward the configured target.
    pub fn raise_order(&mut self) {
        if self.order < self.target_order {
            self.order += 1;
        }
    }

    pub fn delta(&self) -> f64 {
        self.delta
    }

    /// Fix the step size for the upcoming timepoint and recompute the
    /// leading formula coefficient.
    pub fn begin_step(&mut self, delta: f64) {
        self.delta = delta;
        self.ag0 = match (self.method, self.order) {
            (_, 1) => 1.0 / delta,
            (Method::Trapezoidal, _) => 2.0 / delta,
            (Method::Gear, k) => GEAR[k - 1][0] / delta,
        };
    }

    /// Coefficient of the current value in the active formula (the
    /// capacitance multiplier of the Jacobian stamp).
    #[inline]
    pub fn jacobian_coeff(&self) -> f64 {
        self.ag0
    }

    /// Apply the active formula to the slot's current value, storing the
    /// resulting derivative in the working frame.
    pub fn integrate(&self, pool: &mut StatePool, slot: SlotId) {
        let x0 = pool.slot_value(slot);
        let x1 = pool.slot_previous(slot, 1);
        let xdot = match (self.method, self.order) {
            (_, 1) => (x0 - x1) / self.delta,
            (Method::Trapezoidal, _) => {
                let xdot1 = pool.derivative_previous(slot, 1);
                (2.0 / self.delta) * (x0 - x1) - xdot1
            }
            (Method::Gear, k) => {
                let coeffs = GEAR[k - 1];
                let mut acc = coeffs[0] * x0;
                for (i, &c) in coeffs.iter().enumerate().skip(1) {
                    acc += c * pool.slot_previous(slot, i);
                }
                acc / self.delta
            }
        };
        pool.set_derivative(slot, xdot);
    }

    /// Largest next step the slot's local truncation error permits.
    ///
    /// Estimates the (k+1)-th derivative of the slot value by a divided
    /// difference over the history ring and inverts the error formula:
    /// `delta_new = delta * (trtol*tol / lte)^(1/(k+1))`. Returns infinity
    /// when the history is too flat or too young to constrain the step.
    pub fn truncation_step(
        &self,
        pool: &StatePool,
        slot: SlotId,
        new_time: f64,
        reltol: f64,
        abstol: f64,
        trtol: f64,
    ) -> f64 {
        let k = self.order;
        let n = k + 1;

        let mut ts = [0.0; MAX_ORDER + 2];
        let mut xs = [0.0; MAX_ORDER + 2];
        ts[0] = new_time;
        xs[0] = pool.slot_value(slot);
        for i in 1..=n {
            ts[i] = pool.history_time(i);
            xs[i] = pool.slot_previous(slot, i);
        }

        let Some(dd) = divided_difference(&ts[..=n], &xs[..=n]) else {
            return f64::INFINITY;
        };

        let err_const = match (self.method, k) {
            (_, 1) => GEAR_ERR[0],
            (Method::Trapezoidal, _) => TRAP_ERR,
            (Method::Gear, k) => GEAR_ERR[k - 1],
        };
        let factorial: f64 = (1..=n).map(|i| i as f64).product();
        let lte = err_const * self.delta.powi(n as i32) * factorial * dd.abs();

        let tol = reltol * xs[0].abs().max(xs[1].abs()) + abstol;
        if lte <= 0.0 || !lte.is_finite() {
            return f64::INFINITY;
        }
        self.delta * (trtol * tol / lte).powf(1.0 / n as f64)
    }
}

impl Default for Integrator {
    fn default() -> Self {
        Self::new(Method::Trapezoidal, 2)
    }
}

/// Newton divided difference `f[t0, ..., tn]`. None if two sample times
/// coincide (flat or freshly initialised history).
fn divided_difference(ts: &[f64], xs: &[f64]) -> Option<f64> {
    let n = xs.len();
    let mut c = [0.0; MAX_ORDER + 2];
    c[..n].copy_from_slice(xs);
    for j in 1..n {
        for i in 0..n - j {
            let dt = ts[i] - ts[i + j];
            if dt == 0.0 {
                return None;
            }
            c[i] = (c[i] - c[i + 1]) / dt;
        }
    }
    Some(c[0])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool_with_slot() -> (StatePool, SlotId) {
        let mut pool = StatePool::new();
        let slot = pool.alloc_slot();
        (pool, slot)
    }

    #[test]
    fn backward_euler_derivative() {
        let (mut pool, slot) = pool_with_slot();
        pool.set_slot_value(slot, 1.0);
        pool.init_history(0.0);
        let mut integ = Integrator::new(Method::Gear, 1);
        integ.begin_step(0.5);
        pool.set_slot_value(slot, 2.0);
        integ.integrate(&mut pool, slot);
        assert!((pool.derivative(slot) - 2.0).abs() < 1e-12);
        assert!((integ.jacobian_coeff() - 2.0).abs() < 1e-12);
    }

    /// Trapezoidal on xdot = -x, x(0) = 1, fixed step 0.01 to t = 1:
    /// the result must match exp(-1) to second order.
    #[test]
    fn trapezoidal_order_on_decay() {
        let (mut pool, slot) = pool_with_slot();
        pool.set_slot_value(slot, 1.0);
        pool.set_derivative(slot, -1.0); // xdot(0) = -x(0)
        pool.init_history(0.0);

        let h = 0.01;
        let mut integ = Integrator::new(Method::Trapezoidal, 2);
        integ.raise_order();
        assert_eq!(integ.order(), 2);
        integ.begin_step(h);

        let mut t = 0.0;
        for _ in 0..100 {
            t += h;
            // implicit solve of  2/h*(x - x_prev) - xdot_prev = -x
            let x_prev = pool.slot_previous(slot, 1);
            let xdot_prev = pool.derivative_previous(slot, 1);
            let x = (2.0 / h * x_prev + xdot_prev) / (2.0 / h + 1.0);
            pool.set_slot_value(slot, x);
            integ.integrate(&mut pool, slot);
            pool.advance(t);
        }
        let exact = (-1.0f64).exp();
        let err = (pool.slot_value(slot) - exact).abs();
        assert!(err < 1e-5, "trap error {err} not O(h^2)");
    }

    #[test]
    fn gear2_matches_quadratic_exactly() {
        // x(t) = t^2 has xdot(t) = 2t; BDF2 is exact for quadratics.
        let (mut pool, slot) = pool_with_slot();
        let h = 0.1;
        pool.set_slot_value(slot, 0.0);
        pool.init_history(0.0);
        let mut integ = Integrator::new(Method::Gear, 2);
        integ.begin_step(h);

        // accept x(h) = h^2 first (order 1 bootstrap not under test here)
        pool.set_slot_value(slot, h * h);
        pool.advance(h);
        integ.raise_order();
        integ.begin_step(h);

        pool.set_slot_value(slot, (2.0 * h) * (2.0 * h));
        integ.integrate(&mut pool, slot);
        assert!(
            (pool.derivative(slot) - 2.0 * (2.0 * h)).abs() < 1e-12,
            "BDF2 derivative {}",
            pool.derivative(slot)
        );
    }

    #[test]
    fn lte_shrinks_step_for_wiggly_history() {
        let (mut pool, slot) = pool_with_slot();
        let h = 1e-3;
        // cubic charge history: q(t) = t^3 has nonzero third derivative
        pool.set_slot_value(slot, 0.0);
        pool.init_history(0.0);
        let mut integ = Integrator::new(Method::Trapezoidal, 2);
        integ.raise_order();
        for step in 1..=3 {
            let t = step as f64 * h;
            pool.set_slot_value(slot, t * t * t);
            pool.advance(t);
        }
        integ.begin_step(h);
        let t_new = 4.0 * h;
        pool.set_slot_value(slot, t_new * t_new * t_new);

        let dt = integ.truncation_step(&pool, slot, t_new, 1e-3, 1e-12, 7.0);
        assert!(dt.is_finite());
        assert!(dt > 0.0);

        // a flat history imposes no limit
        let (mut flat, fslot) = pool_with_slot();
        flat.set_slot_value(fslot, 1.0);
        flat.init_history(0.0);
        integ.begin_step(h);
        let dt = integ.truncation_step(&flat, fslot, h, 1e-3, 1e-12, 7.0);
        assert!(dt.is_infinite());
    }
}
