//! The process-wide behavior registry.
//!
//! Maps `(entity kind, behavior kind)` to a factory. Factories are
//! registered once at program start (a reader/writer lock guards the
//! additions); every simulation then resolves behavior sets through
//! shared reads. `reset` exists so test cases can re-initialise.
//!
//! Resolution walks the requested kind list in *reverse* and skips any
//! kind an already-created behavior covers. A device registers its most
//! derived object under every kind it implements, so requesting
//! `[Temperature, Load, Transient]` creates that object once (at
//! `Transient`) and separate factories fill only what remains.

use std::collections::HashMap;
use std::sync::{Arc, OnceLock, RwLock};

use crate::behavior::{BehaviorBundle, BehaviorKind, BehaviorSet, BindingContext};
use crate::error::{Error, Result};

/// Creates the behavior objects of one entity for one kind request.
pub type BehaviorFactory =
    Arc<dyn Fn(&BindingContext<'_>) -> Result<BehaviorBundle> + Send + Sync>;

/// Factory table keyed on entity kind and behavior kind.
#[derive(Default)]
pub struct BehaviorRegistry {
    factories: HashMap<(&'static str, BehaviorKind), BehaviorFactory>,
}

impl BehaviorRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a factory for one behavior kind of an entity kind.
    pub fn register(
        &mut self,
        entity_kind: &'static str,
        kind: BehaviorKind,
        factory: BehaviorFactory,
    ) {
        self.factories.insert((entity_kind, kind), factory);
    }

    /// Register one factory under several behavior kinds at once (the
    /// common case of a single object implementing all of them).
    pub fn register_many(
        &mut self,
        entity_kind: &'static str,
        kinds: &[BehaviorKind],
        factory: BehaviorFactory,
    ) {
        for &kind in kinds {
            self.factories.insert((entity_kind, kind), factory.clone());
        }
    }

    /// Whether any factory exists for this entity kind.
    pub fn knows(&self, entity_kind: &str) -> bool {
        self.factories.keys().any(|(k, _)| *k == entity_kind)
    }

    /// Build the behavior set of one entity for the requested kinds.
    ///
    /// The request list is processed in reverse order; a kind already
    /// covered by a previously created behavior is skipped so that one
    /// object implementing several kinds is instantiated exactly once.
    pub fn resolve(
        &self,
        requested: &[BehaviorKind],
        ctx: &BindingContext<'_>,
    ) -> Result<BehaviorSet> {
        let entity_kind = ctx.entity.kind();
        if !self.knows(entity_kind) {
            return Err(Error::UnknownEntityKind(entity_kind.to_string()));
        }
        let mut set = BehaviorSet::default();
        for &kind in requested.iter().rev() {
            if set.covers(kind) {
                continue;
            }
            if let Some(factory) = self.factories.get(&(entity_kind, kind)) {
                set.merge(factory(ctx)?);
            }
        }
        Ok(set)
    }

    /// Drop every factory.
    pub fn clear(&mut self) {
        self.factories.clear();
    }
}

/// The shared registry, created empty on first use.
pub fn global() -> &'static RwLock<BehaviorRegistry> {
    static REGISTRY: OnceLock<RwLock<BehaviorRegistry>> = OnceLock::new();
    REGISTRY.get_or_init(|| RwLock::new(BehaviorRegistry::new()))
}

/// Clear the shared registry (test-case re-initialisation).
pub fn reset_global() {
    global().write().expect("registry lock poisoned").clear();
}
