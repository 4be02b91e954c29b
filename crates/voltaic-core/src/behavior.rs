//! Per-entity computational behaviors.
//!
//! A behavior is the piece of a device that participates in one phase of
//! simulation: temperature preprocessing, DC/iteration stamping, complex
//! AC stamping, charge integration, noise evaluation, or per-timepoint
//! state commits. One concrete object commonly implements several kinds;
//! the registry's reverse-order resolution instantiates it once and reuses
//! it for every kind it covers.

use std::any::Any;
use std::cell::RefCell;
use std::rc::Rc;

use nalgebra::DVector;
use num_complex::Complex64;

use crate::circuit::Entity;
use crate::config::AnalysisConfig;
use crate::error::Result;
use crate::matrix::Mna;
use crate::nodes::NodeMap;
use crate::state::{SimState, StatePool};

/// The closed set of behavior kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BehaviorKind {
    /// Temperature-dependent constants, once per temperature change.
    Temperature,
    /// DC/iteration stamping into the MNA system.
    Load,
    /// Complex stamping at one frequency.
    AcLoad,
    /// Charge integration and its MNA contribution.
    Transient,
    /// Per-generator noise spectral density.
    Noise,
    /// Commit per-timepoint state after acceptance.
    Accept,
}

/// Everything a behavior may touch while allocating its resources.
pub struct SetupContext<'a> {
    pub nodes: &'a mut NodeMap,
    pub mna: &'a mut Mna,
    pub pool: &'a mut StatePool,
}

/// Common allocation/release hooks. Setup runs once per simulation build;
/// unsetup releases matrix handles and state slots so a fresh setup can
/// reproduce them exactly.
pub trait Behavior: Any {
    fn setup(&mut self, ctx: &mut SetupContext<'_>) -> Result<()> {
        let _ = ctx;
        Ok(())
    }

    fn unsetup(&mut self) {}
}

/// Temperature behavior: recompute temperature-dependent constants.
pub trait Temperature: Behavior {
    fn temperature(&mut self, st: &mut SimState) -> Result<()>;
}

/// Load behavior: stamp the linearised device into the real MNA planes.
pub trait Load: Behavior {
    fn load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()>;

    /// Device-level convergence test, run after a Newton solve. The
    /// default accepts; nonlinear devices compare the current predicted
    /// by their stored conductances against the last computed one.
    fn is_convergent(&self, st: &SimState, cfg: &AnalysisConfig) -> bool {
        let _ = (st, cfg);
        true
    }
}

/// AC load behavior: stamp the small-signal admittances at `omega`.
pub trait AcLoad: Behavior {
    fn ac_load(&mut self, mna: &mut Mna, st: &SimState, omega: f64) -> Result<()>;
}

/// Transient behavior: integrate charges and stamp their companions.
pub trait Transient: Behavior {
    fn transient_load(&mut self, mna: &mut Mna, st: &mut SimState) -> Result<()>;
}

/// Noise behavior: total spectral contribution of the device (V^2/Hz),
/// evaluated against the current AC solution.
pub trait Noise: Behavior {
    fn noise(&mut self, st: &SimState, ac: &DVector<Complex64>, frequency: f64) -> f64;
}

/// Accept behavior: commit state after a timepoint is accepted. Runs in
/// entity-insertion order, before the history ring advances.
pub trait Accept: Behavior {
    fn accept(&mut self, st: &mut SimState);
}

/// What a factory hands back: one or more freshly created behavior
/// objects, exposed under every kind each of them covers.
#[derive(Default)]
pub struct BehaviorBundle {
    pub temperature: Option<Rc<RefCell<dyn Temperature>>>,
    pub load: Option<Rc<RefCell<dyn Load>>>,
    pub ac_load: Option<Rc<RefCell<dyn AcLoad>>>,
    pub transient: Option<Rc<RefCell<dyn Transient>>>,
    pub noise: Option<Rc<RefCell<dyn Noise>>>,
    pub accept: Option<Rc<RefCell<dyn Accept>>>,
    /// One entry per distinct object, for setup/unsetup and downcasts.
    pub objects: Vec<BehaviorObject>,
}

/// A distinct behavior object: the setup view plus a downcast view.
#[derive(Clone)]
pub struct BehaviorObject {
    pub behavior: Rc<RefCell<dyn Behavior>>,
    any: Rc<dyn Any>,
}

impl BehaviorObject {
    pub fn new<T: Behavior>(rc: Rc<RefCell<T>>) -> Self {
        Self {
            behavior: rc.clone(),
            any: rc,
        }
    }

    /// Recover the concrete type behind this object.
    pub fn downcast<T: Behavior>(&self) -> Option<Rc<RefCell<T>>> {
        self.any.clone().downcast::<RefCell<T>>().ok()
    }
}

impl BehaviorBundle {
    /// Start a bundle from one concrete object.
    pub fn of<T: Behavior>(rc: &Rc<RefCell<T>>) -> Self {
        let mut bundle = Self::default();
        bundle.objects.push(BehaviorObject::new(rc.clone()));
        bundle
    }

    /// Add another distinct object to the bundle.
    pub fn and<T: Behavior>(mut self, rc: &Rc<RefCell<T>>) -> Self {
        self.objects.push(BehaviorObject::new(rc.clone()));
        self
    }

    pub fn temperature<T: Temperature>(mut self, rc: &Rc<RefCell<T>>) -> Self {
        self.temperature = Some(rc.clone());
        self
    }

    pub fn load<T: Load>(mut self, rc: &Rc<RefCell<T>>) -> Self {
        self.load = Some(rc.clone());
        self
    }

    pub fn ac_load<T: AcLoad>(mut self, rc: &Rc<RefCell<T>>) -> Self {
        self.ac_load = Some(rc.clone());
        self
    }

    pub fn transient<T: Transient>(mut self, rc: &Rc<RefCell<T>>) -> Self {
        self.transient = Some(rc.clone());
        self
    }

    pub fn noise<T: Noise>(mut self, rc: &Rc<RefCell<T>>) -> Self {
        self.noise = Some(rc.clone());
        self
    }

    pub fn accept<T: Accept>(mut self, rc: &Rc<RefCell<T>>) -> Self {
        self.accept = Some(rc.clone());
        self
    }
}

/// The resolved behaviors of one entity.
#[derive(Default)]
pub struct BehaviorSet {
    pub temperature: Option<Rc<RefCell<dyn Temperature>>>,
    pub load: Option<Rc<RefCell<dyn Load>>>,
    pub ac_load: Option<Rc<RefCell<dyn AcLoad>>>,
    pub transient: Option<Rc<RefCell<dyn Transient>>>,
    pub noise: Option<Rc<RefCell<dyn Noise>>>,
    pub accept: Option<Rc<RefCell<dyn Accept>>>,
    objects: Vec<BehaviorObject>,
}

impl BehaviorSet {
    /// Whether some already-created behavior covers this kind.
    pub fn covers(&self, kind: BehaviorKind) -> bool {
        match kind {
            BehaviorKind::Temperature => self.temperature.is_some(),
            BehaviorKind::Load => self.load.is_some(),
            BehaviorKind::AcLoad => self.ac_load.is_some(),
            BehaviorKind::Transient => self.transient.is_some(),
            BehaviorKind::Noise => self.noise.is_some(),
            BehaviorKind::Accept => self.accept.is_some(),
        }
    }

    /// Fold a factory's bundle into the set. Existing entries win, so a
    /// more derived behavior created earlier keeps its kinds.
    pub fn merge(&mut self, bundle: BehaviorBundle) {
        self.objects.extend(bundle.objects);
        self.temperature = self.temperature.take().or(bundle.temperature);
        self.load = self.load.take().or(bundle.load);
        self.ac_load = self.ac_load.take().or(bundle.ac_load);
        self.transient = self.transient.take().or(bundle.transient);
        self.noise = self.noise.take().or(bundle.noise);
        self.accept = self.accept.take().or(bundle.accept);
    }

    /// Distinct behavior objects, in creation order.
    pub fn objects(&self) -> &[BehaviorObject] {
        &self.objects
    }

    /// Find the first object of a concrete type.
    pub fn find<T: Behavior>(&self) -> Option<Rc<RefCell<T>>> {
        self.objects.iter().find_map(BehaviorObject::downcast)
    }

    /// Run setup on every distinct object, in creation order.
    pub fn setup_all(&self, ctx: &mut SetupContext<'_>) -> Result<()> {
        for obj in &self.objects {
            obj.behavior.borrow_mut().setup(ctx)?;
        }
        Ok(())
    }

    /// Release every distinct object's resources.
    pub fn unsetup_all(&self) {
        for obj in &self.objects {
            obj.behavior.borrow_mut().unsetup();
        }
    }
}

/// What a behavior factory sees: its entity, the resolved pin indices,
/// the model card (with its already-built behaviors), and the run config.
pub struct BindingContext<'a> {
    pub entity: &'a Entity,
    pub pins: &'a [usize],
    pub model: Option<&'a Entity>,
    pub model_behaviors: Option<&'a BehaviorSet>,
    pub config: &'a AnalysisConfig,
}

impl BindingContext<'_> {
    /// The node index bound to pin `i`.
    pub fn pin(&self, i: usize) -> usize {
        self.pins[i]
    }

    /// Find a concrete behavior on the referenced model.
    pub fn model_behavior<T: Behavior>(&self) -> Option<Rc<RefCell<T>>> {
        self.model_behaviors.and_then(BehaviorSet::find)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct Probe {
        setups: u32,
    }

    impl Behavior for Probe {
        fn setup(&mut self, _ctx: &mut SetupContext<'_>) -> Result<()> {
            self.setups += 1;
            Ok(())
        }
    }

    impl Load for Probe {
        fn load(&mut self, _mna: &mut Mna, _st: &mut SimState) -> Result<()> {
            Ok(())
        }
    }

    impl Transient for Probe {
        fn transient_load(&mut self, _mna: &mut Mna, _st: &mut SimState) -> Result<()> {
            Ok(())
        }
    }

    #[test]
    fn one_object_covers_many_kinds() {
        let probe = Rc::new(RefCell::new(Probe { setups: 0 }));
        let bundle = BehaviorBundle::of(&probe).load(&probe).transient(&probe);

        let mut set = BehaviorSet::default();
        set.merge(bundle);
        assert!(set.covers(BehaviorKind::Load));
        assert!(set.covers(BehaviorKind::Transient));
        assert!(!set.covers(BehaviorKind::Temperature));
        // one distinct object, so setup must run exactly once
        assert_eq!(set.objects().len(), 1);
    }

    #[test]
    fn find_recovers_the_concrete_type() {
        let probe = Rc::new(RefCell::new(Probe { setups: 0 }));
        let mut set = BehaviorSet::default();
        set.merge(BehaviorBundle::of(&probe).load(&probe));

        let found: Rc<RefCell<Probe>> = set.find().expect("downcast");
        found.borrow_mut().setups = 5;
        assert_eq!(probe.borrow().setups, 5);
    }

    #[test]
    fn merge_keeps_the_earlier_behavior() {
        let first = Rc::new(RefCell::new(Probe { setups: 1 }));
        let second = Rc::new(RefCell::new(Probe { setups: 2 }));

        let mut set = BehaviorSet::default();
        set.merge(BehaviorBundle::of(&first).load(&first));
        set.merge(BehaviorBundle::of(&second).load(&second));

        let kept = set.load.as_ref().unwrap();
        // the first-created (most derived) behavior keeps the kind
        let first_dyn: Rc<RefCell<dyn Load>> = first.clone();
        assert!(Rc::ptr_eq(kept, &first_dyn));
    }
}
