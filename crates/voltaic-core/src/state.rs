//! Shared simulation state: solution vectors, history ring and
//! per-device state slots.
//!
//! Devices allocate slots during setup and read/write them during loading;
//! the pool replicates every slot across a fixed-depth history ring so the
//! integrator can form divided differences over past accepted timepoints.
//! No device ever touches another device's slots; coupling happens only
//! through the MNA matrix and the shared node solution.

use nalgebra::DVector;

use crate::integrate::Integrator;

/// Ring depth: enough history for Gear order 6 plus an LTE term.
pub const HISTORY_DEPTH: usize = 8;

/// A plain history-tracked scalar owned by one device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateVar(pub(crate) usize);

/// A state variable whose time derivative the integrator maintains.
///
/// Occupies two pool entries: the value (a charge or flux) and its
/// derivative (a current or voltage).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SlotId(pub(crate) usize);

/// The state pool: a ring of frames, each holding every slot's value.
#[derive(Debug, Clone)]
pub struct StatePool {
    entries: usize,
    frames: Vec<Vec<f64>>,
    /// `times[k]` for k >= 1 is the accepted time of that history frame.
    times: Vec<f64>,
    slots: Vec<SlotId>,
}

impl StatePool {
    pub fn new() -> Self {
        Self {
            entries: 0,
            frames: vec![Vec::new(); HISTORY_DEPTH],
            times: vec![0.0; HISTORY_DEPTH],
            slots: Vec::new(),
        }
    }

    /// Allocate `n` contiguous plain entries (setup phase only).
    pub fn alloc(&mut self, n: usize) -> StateVar {
        let var = StateVar(self.entries);
        self.entries += n;
        for frame in &mut self.frames {
            frame.resize(self.entries, 0.0);
        }
        var
    }

    /// Allocate a derivative slot (value + derivative pair).
    pub fn alloc_slot(&mut self) -> SlotId {
        let var = self.alloc(2);
        let slot = SlotId(var.0);
        self.slots.push(slot);
        slot
    }

    /// Total entry count (idempotency checks).
    pub fn entry_count(&self) -> usize {
        self.entries
    }

    /// Number of derivative slots.
    pub fn slot_count(&self) -> usize {
        self.slots.len()
    }

    /// All derivative slots, in allocation order.
    pub fn slots(&self) -> &[SlotId] {
        &self.slots
    }

    /// Release every slot; the next setup starts from scratch.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    // ────────────────────── current frame access ──────────────────────

    #[inline]
    pub fn value(&self, var: StateVar) -> f64 {
        self.frames[0][var.0]
    }

    #[inline]
    pub fn set_value(&mut self, var: StateVar, v: f64) {
        self.frames[0][var.0] = v;
    }

    /// Value at the k-th most recent accepted timepoint (k >= 1).
    #[inline]
    pub fn previous(&self, var: StateVar, age: usize) -> f64 {
        self.frames[age][var.0]
    }

    /// The slot's stored value in the working frame.
    #[inline]
    pub fn slot_value(&self, slot: SlotId) -> f64 {
        self.frames[0][slot.0]
    }

    #[inline]
    pub fn set_slot_value(&mut self, slot: SlotId, v: f64) {
        self.frames[0][slot.0] = v;
    }

    /// The slot's value at the k-th most recent accepted timepoint.
    #[inline]
    pub fn slot_previous(&self, slot: SlotId, age: usize) -> f64 {
        self.frames[age][slot.0]
    }

    /// The slot's derivative in the working frame.
    #[inline]
    pub fn derivative(&self, slot: SlotId) -> f64 {
        self.frames[0][slot.0 + 1]
    }

    #[inline]
    pub fn set_derivative(&mut self, slot: SlotId, d: f64) {
        self.frames[0][slot.0 + 1] = d;
    }

    /// The slot's derivative at the k-th most recent accepted timepoint.
    #[inline]
    pub fn derivative_previous(&self, slot: SlotId, age: usize) -> f64 {
        self.frames[age][slot.0 + 1]
    }

    /// Accepted time of the k-th history frame (k >= 1).
    #[inline]
    pub fn history_time(&self, age: usize) -> f64 {
        self.times[age]
    }

    // ────────────────────── ring control ──────────────────────

    /// Copy the working frame into every history frame.
    ///
    /// Used once after the initial operating point so the first transient
    /// step sees a consistent (flat) history starting at `time`.
    pub fn init_history(&mut self, time: f64) {
        let (head, rest) = self.frames.split_first_mut().expect("ring is never empty");
        for frame in rest {
            frame.copy_from_slice(head);
        }
        for t in &mut self.times {
            *t = time;
        }
    }

    /// Commit the working frame as the accepted point at `time` and open a
    /// fresh working frame seeded with the accepted values.
    ///
    /// Writes are monotone in simulation time; the newest history frame is
    /// always strictly older than the working point that follows it.
    pub fn advance(&mut self, time: f64) {
        debug_assert!(
            time >= self.times[1],
            "history writes must be monotone in time"
        );
        self.frames.rotate_right(1);
        self.times.rotate_right(1);
        let (head, rest) = self.frames.split_first_mut().expect("ring is never empty");
        head.copy_from_slice(&rest[0]);
        self.times[1] = time;
        self.times[0] = time;
    }

    /// Discard the working frame, restoring the last accepted values.
    ///
    /// Used when a timestep is rejected and retried with a smaller delta.
    pub fn rewind(&mut self) {
        let (head, rest) = self.frames.split_first_mut().expect("ring is never empty");
        head.copy_from_slice(&rest[0]);
    }
}

impl Default for StatePool {
    fn default() -> Self {
        Self::new()
    }
}

/// Three-valued initialisation mode the Newton solver walks through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InitMode {
    /// Force junctions to their critical voltages (or zero if marked off).
    #[default]
    Junction,
    /// Honor user-supplied initial-condition flags.
    Fix,
    /// Read junction voltages from the node solution.
    Normal,
}

/// Everything behaviors share during one simulation run.
///
/// Owned by the simulation; passed to behaviors by mutable reference. The
/// solution vectors are node-indexed with `[0]` pinned to ground.
#[derive(Debug)]
pub struct SimState {
    /// Current Newton iterate.
    pub solution: DVector<f64>,
    /// Previous Newton iterate.
    pub prev_iter: DVector<f64>,
    /// Solution at the last accepted timepoint.
    pub prev_solution: DVector<f64>,
    /// Per-device history and derivative slots.
    pub pool: StatePool,
    /// Active integration formula.
    pub integ: Integrator,
    /// Newton initialisation mode.
    pub mode: InitMode,
    /// Minimum junction conductance.
    pub gmin: f64,
    /// Independent-source scale factor; 1.0 except during source stepping.
    pub srcfact: f64,
    /// Simulation temperature (K).
    pub temperature: f64,
    /// Temperature the model parameters were measured at (K).
    pub nominal_temperature: f64,
    /// Current simulation time (transient only).
    pub time: f64,
    /// Current timestep (transient only).
    pub delta: f64,
    /// True while a transient analysis is loading charge contributions.
    pub transient: bool,
    /// True when the transient run skips the initial operating point.
    pub uic: bool,
    noncon: u32,
}

impl SimState {
    pub fn new() -> Self {
        Self {
            solution: DVector::zeros(1),
            prev_iter: DVector::zeros(1),
            prev_solution: DVector::zeros(1),
            pool: StatePool::new(),
            integ: Integrator::default(),
            mode: InitMode::Junction,
            gmin: 1e-12,
            srcfact: 1.0,
            temperature: crate::constants::REF_TEMPERATURE,
            nominal_temperature: crate::constants::REF_TEMPERATURE,
            time: 0.0,
            delta: 0.0,
            transient: false,
            uic: false,
            noncon: 0,
        }
    }

    /// Size the solution vectors for `count` MNA indices (ground included).
    pub fn resize(&mut self, count: usize) {
        self.solution = DVector::zeros(count);
        self.prev_iter = DVector::zeros(count);
        self.prev_solution = DVector::zeros(count);
    }

    /// Node voltage (or branch current) from the current iterate.
    #[inline]
    pub fn v(&self, node: usize) -> f64 {
        self.solution[node]
    }

    /// Voltage difference `v[pos] - v[neg]`.
    #[inline]
    pub fn vd(&self, pos: usize, neg: usize) -> f64 {
        self.solution[pos] - self.solution[neg]
    }

    /// A behavior votes that this iteration has not converged (it limited
    /// a junction or switched state).
    pub fn report_noncon(&mut self) {
        self.noncon += 1;
    }

    pub fn clear_noncon(&mut self) {
        self.noncon = 0;
    }

    pub fn nonconverged(&self) -> bool {
        self.noncon > 0
    }

    // ────────────────────── derivative slot operations ──────────────────────

    /// Apply the active implicit formula to the slot's current value,
    /// updating its stored derivative.
    pub fn integrate(&mut self, slot: SlotId) {
        self.integ.integrate(&mut self.pool, slot);
    }

    /// The Jacobian contribution `g = cap * (formula coefficient of the
    /// current value)`.
    #[inline]
    pub fn jacobian(&self, cap: f64) -> f64 {
        cap * self.integ.jacobian_coeff()
    }

    /// Norton-equivalent RHS contribution `g*v - derivative` for a slot
    /// that was just integrated.
    #[inline]
    pub fn rhs_current(&self, slot: SlotId, g: f64, v: f64) -> f64 {
        g * v - self.pool.derivative(slot)
    }
}

impl Default for SimState {
    fn default() -> Self {
        Self::new()
    }
}
