//! Simulation assembly: behavior resolution, node and state allocation,
//! and the shared load pass.

use indexmap::IndexMap;

use voltaic_core::behavior::{BehaviorKind, BehaviorSet, BindingContext, SetupContext};
use voltaic_core::matrix::MatrixElement;
use voltaic_core::nodes::UnknownKind;
use voltaic_core::registry;
use voltaic_core::sink::CancelToken;
use voltaic_core::{
    AnalysisConfig, Circuit, Error, Mna, NodeMap, Result, SimState,
};

/// One simulation run over a circuit.
///
/// Owns everything with per-run lifetime: the node map, the MNA facade,
/// the state pool and the resolved behavior sets. The only shared state
/// between concurrent simulations is the read-mostly behavior registry.
pub struct Simulation {
    pub config: AnalysisConfig,
    pub cancel: CancelToken,
    pub(crate) nodes: NodeMap,
    pub(crate) mna: Mna,
    pub(crate) state: SimState,
    pub(crate) model_behaviors: IndexMap<String, BehaviorSet>,
    pub(crate) behaviors: IndexMap<String, BehaviorSet>,
    /// Diagonal handles for every unknown, for Gmin stepping.
    pub(crate) diag: Vec<MatrixElement>,
    /// Current Gmin-stepping shunt (0 outside recovery).
    pub(crate) diag_gmin: f64,
    /// The operating point has converged at least once.
    pub(crate) initialized: bool,
    is_setup: bool,
}

impl Simulation {
    /// Resolve behaviors for every entity and prepare a run.
    ///
    /// `requested` lists the behavior kinds this analysis needs, in the
    /// canonical order (Temperature first). Model cards resolve their
    /// Temperature behaviors first so instances can bind to them.
    pub fn build(
        circuit: &Circuit,
        config: AnalysisConfig,
        requested: &[BehaviorKind],
    ) -> Result<Self> {
        let registry = registry::global().read().expect("registry lock poisoned");

        let mut nodes = NodeMap::new();
        for entity in circuit.iter() {
            for pin in entity.pins() {
                nodes.create(pin);
            }
        }
        nodes.freeze_external();

        let mut model_behaviors = IndexMap::new();
        for model in circuit.iter_models() {
            // parameter-only model cards (switches, passives) have no
            // registered behaviors and resolve to an empty set
            let set = if registry.knows(model.kind()) {
                let ctx = BindingContext {
                    entity: model,
                    pins: &[],
                    model: None,
                    model_behaviors: None,
                    config: &config,
                };
                registry.resolve(&[BehaviorKind::Temperature], &ctx)?
            } else {
                BehaviorSet::default()
            };
            model_behaviors.insert(model.name().to_string(), set);
        }

        let mut behaviors = IndexMap::new();
        for entity in circuit.iter() {
            let pins: Vec<usize> = entity
                .pins()
                .iter()
                .map(|p| nodes.index(p).expect("pin nodes were just created"))
                .collect();
            let model = circuit.model_for(entity)?;
            let model_set = model.and_then(|m| model_behaviors.get(m.name()));
            let ctx = BindingContext {
                entity,
                pins: &pins,
                model,
                model_behaviors: model_set,
                config: &config,
            };
            let set = registry.resolve(requested, &ctx)?;
            behaviors.insert(entity.name().to_string(), set);
        }

        let mut state = SimState::new();
        state.gmin = config.gmin;
        state.temperature = config.temperature;
        state.nominal_temperature = config.nominal_temperature;
        state.uic = config.uic;

        Ok(Self {
            config,
            cancel: CancelToken::new(),
            nodes,
            mna: Mna::new(),
            state,
            model_behaviors,
            behaviors,
            diag: Vec::new(),
            diag_gmin: 0.0,
            initialized: false,
            is_setup: false,
        })
    }

    /// Allocate internal nodes, matrix handles and state slots.
    ///
    /// Idempotent against [`Simulation::unsetup`]: a fresh setup after an
    /// unsetup reproduces the same handles and slot counts.
    pub fn setup(&mut self) -> Result<()> {
        if self.is_setup {
            return Ok(());
        }
        let mut ctx = SetupContext {
            nodes: &mut self.nodes,
            mna: &mut self.mna,
            pool: &mut self.state.pool,
        };
        for set in self.model_behaviors.values() {
            set.setup_all(&mut ctx)?;
        }
        for set in self.behaviors.values() {
            set.setup_all(&mut ctx)?;
        }

        // every unknown gets a diagonal cell so Gmin stepping has a place
        // to put its shunt
        self.diag = (1..self.nodes.count())
            .map(|i| self.mna.element(i, i))
            .collect();

        self.mna.finalize(self.nodes.unknowns());
        self.state.resize(self.nodes.count());
        self.is_setup = true;
        Ok(())
    }

    /// Release matrix handles, state slots and internal nodes.
    pub fn unsetup(&mut self) {
        if !self.is_setup {
            return;
        }
        for set in self.model_behaviors.values() {
            set.unsetup_all();
        }
        for set in self.behaviors.values() {
            set.unsetup_all();
        }
        self.mna.reset();
        self.state.pool.reset();
        self.nodes.reset();
        self.diag.clear();
        self.initialized = false;
        self.is_setup = false;
    }

    /// Change the simulation temperature and re-run every Temperature
    /// behavior (between sweep points, for instance).
    pub fn set_temperature(&mut self, temperature: f64) -> Result<()> {
        self.config.temperature = temperature;
        self.run_temperature()
    }

    /// Run every Temperature behavior: models first, then instances.
    pub fn run_temperature(&mut self) -> Result<()> {
        self.state.temperature = self.config.temperature;
        self.state.nominal_temperature = self.config.nominal_temperature;
        for set in self.model_behaviors.values() {
            if let Some(t) = &set.temperature {
                t.borrow_mut().temperature(&mut self.state)?;
            }
        }
        for set in self.behaviors.values() {
            if let Some(t) = &set.temperature {
                t.borrow_mut().temperature(&mut self.state)?;
            }
        }
        Ok(())
    }

    /// One load pass: clear, stamp every Load behavior (and Transient
    /// behaviors when in transient mode), apply the stepping shunt.
    pub(crate) fn load(&mut self) -> Result<()> {
        self.mna.clear();
        self.state.clear_noncon();
        for set in self.behaviors.values() {
            if let Some(l) = &set.load {
                l.borrow_mut().load(&mut self.mna, &mut self.state)?;
            }
            if self.state.transient {
                if let Some(t) = &set.transient {
                    t.borrow_mut().transient_load(&mut self.mna, &mut self.state)?;
                }
            }
        }
        if self.diag_gmin > 0.0 {
            for d in &self.diag {
                self.mna.add(*d, self.diag_gmin);
            }
        }
        Ok(())
    }

    /// Run every Accept behavior, in entity-insertion order.
    pub(crate) fn accept_all(&mut self) {
        for set in self.behaviors.values() {
            if let Some(a) = &set.accept {
                a.borrow_mut().accept(&mut self.state);
            }
        }
    }

    /// Map a final singular row to a topology diagnosis when the row is
    /// structurally empty; otherwise keep the numeric error.
    pub(crate) fn classify_singular(&self, row: usize) -> Error {
        if self.mna.row_abs_sum(row) == 0.0 {
            match self.nodes.kind(row) {
                Some(UnknownKind::Current) => {
                    Error::CircuitTopology(voltaic_core::error::TopologyError::VoltageSourceLoop)
                }
                _ => Error::CircuitTopology(voltaic_core::error::TopologyError::FloatingNode),
            }
        } else {
            Error::SingularMatrix(row)
        }
    }

    // ────────────────────── accessors ──────────────────────

    /// MNA index of a named node.
    pub fn node_index(&self, name: &str) -> Option<usize> {
        self.nodes.index(name)
    }

    /// The node solution (index 0 is ground).
    pub fn solution(&self) -> &nalgebra::DVector<f64> {
        &self.state.solution
    }

    /// Voltage of a named node in the current solution.
    pub fn voltage(&self, name: &str) -> Option<f64> {
        self.node_index(name).map(|i| self.state.solution[i])
    }

    /// The behavior set of a named entity (driver downcasts).
    pub fn behavior_set(&self, name: &str) -> Option<&BehaviorSet> {
        self.behaviors.get(name)
    }

    /// Number of MNA unknowns (ground excluded).
    pub fn unknowns(&self) -> usize {
        self.nodes.unknowns()
    }

    /// Allocated matrix cells (setup idempotency checks).
    pub fn pattern_len(&self) -> usize {
        self.mna.pattern_len()
    }

    /// Allocated state entries (setup idempotency checks).
    pub fn state_entries(&self) -> usize {
        self.state.pool.entry_count()
    }

    pub fn state(&self) -> &SimState {
        &self.state
    }
}
