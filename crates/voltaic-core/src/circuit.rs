//! The parsed entity graph consumed by the engine.
//!
//! Entities arrive from an external netlist parser already resolved into a
//! kind tag, a parameter bundle and an ordered pin-to-node-name vector.
//! Iteration order is insertion order so runs are reproducible.

use indexmap::IndexMap;

use crate::error::{Error, Result};
use crate::params::ParamBundle;

/// One electrical component (or model card) in the circuit.
#[derive(Debug, Clone)]
pub struct Entity {
    name: String,
    kind: &'static str,
    params: ParamBundle,
    pins: Vec<String>,
    model: Option<String>,
    control: Option<String>,
}

impl Entity {
    pub fn new(name: impl Into<String>, kind: &'static str) -> Self {
        Self {
            name: name.into(),
            kind,
            params: ParamBundle::new(),
            pins: Vec::new(),
            model: None,
            control: None,
        }
    }

    /// Builder: attach the parameter bundle.
    pub fn with_params(mut self, params: ParamBundle) -> Self {
        self.params = params;
        self
    }

    /// Builder: bind pins to external node names, in pin order.
    pub fn with_pins<S: Into<String>>(mut self, pins: impl IntoIterator<Item = S>) -> Self {
        self.pins = pins.into_iter().map(Into::into).collect();
        self
    }

    /// Builder: reference a model card by name.
    pub fn with_model(mut self, model: impl Into<String>) -> Self {
        self.model = Some(model.into());
        self
    }

    /// Builder: name the voltage source whose branch current controls this
    /// device (CCCS, CCVS, current-controlled switch).
    pub fn with_control(mut self, source: impl Into<String>) -> Self {
        self.control = Some(source.into());
        self
    }

    /// Builder: set one named parameter (marks it given).
    pub fn with_param(mut self, name: &str, value: f64) -> Self {
        // panics only on a name the device never declared, which is a
        // programming error in the caller at construction time
        self.params
            .set(name, value)
            .unwrap_or_else(|e| panic!("{}: {e}", self.name));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn kind(&self) -> &'static str {
        self.kind
    }

    pub fn params(&self) -> &ParamBundle {
        &self.params
    }

    pub fn params_mut(&mut self) -> &mut ParamBundle {
        &mut self.params
    }

    pub fn pins(&self) -> &[String] {
        &self.pins
    }

    pub fn model(&self) -> Option<&str> {
        self.model.as_deref()
    }

    pub fn control(&self) -> Option<&str> {
        self.control.as_deref()
    }

    /// Error unless the entity has exactly `expected` pins.
    pub fn require_pins(&self, expected: usize) -> Result<()> {
        if self.pins.len() != expected {
            return Err(Error::PinCountMismatch {
                name: self.name.clone(),
                expected,
                got: self.pins.len(),
            });
        }
        Ok(())
    }
}

/// The entity graph: instances plus shared model cards.
#[derive(Debug, Clone, Default)]
pub struct Circuit {
    entities: IndexMap<String, Entity>,
    models: IndexMap<String, Entity>,
}

impl Circuit {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add an instance entity. Replaces any previous entity of that name.
    pub fn add(&mut self, entity: Entity) {
        self.entities.insert(entity.name.clone(), entity);
    }

    /// Add a shared model card.
    pub fn add_model(&mut self, model: Entity) {
        self.models.insert(model.name.clone(), model);
    }

    /// Remove an instance by name; reports whether it existed.
    pub fn remove(&mut self, name: &str) -> bool {
        self.entities.shift_remove(name).is_some()
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entities.contains_key(name)
    }

    pub fn get(&self, name: &str) -> Option<&Entity> {
        self.entities.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Entity> {
        self.entities.get_mut(name)
    }

    pub fn model(&self, name: &str) -> Option<&Entity> {
        self.models.get(name)
    }

    /// Instances in insertion order.
    pub fn iter(&self) -> impl Iterator<Item = &Entity> {
        self.entities.values()
    }

    /// Model cards in insertion order.
    pub fn iter_models(&self) -> impl Iterator<Item = &Entity> {
        self.models.values()
    }

    pub fn len(&self) -> usize {
        self.entities.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty()
    }

    /// Resolve the model card an entity references.
    pub fn model_for(&self, entity: &Entity) -> Result<Option<&Entity>> {
        match entity.model() {
            None => Ok(None),
            Some(m) => self
                .models
                .get(m)
                .map(Some)
                .ok_or_else(|| Error::MissingModel {
                    entity: entity.name().to_string(),
                    model: m.to_string(),
                }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insertion_order_is_stable() {
        let mut ckt = Circuit::new();
        ckt.add(Entity::new("R2", "resistor"));
        ckt.add(Entity::new("R1", "resistor"));
        ckt.add(Entity::new("V1", "vsource"));
        let names: Vec<_> = ckt.iter().map(Entity::name).collect();
        assert_eq!(names, ["R2", "R1", "V1"]);
        assert!(ckt.remove("R1"));
        assert!(!ckt.remove("R1"));
        assert!(!ckt.contains("R1"));
    }

    #[test]
    fn missing_model_is_reported() {
        let mut ckt = Circuit::new();
        ckt.add(Entity::new("D1", "diode").with_model("DX"));
        let d1 = ckt.get("D1").unwrap();
        assert!(matches!(
            ckt.model_for(d1),
            Err(Error::MissingModel { .. })
        ));
    }

    #[test]
    fn pin_count_is_checked() {
        let e = Entity::new("Q1", "bjt").with_pins(["c", "b"]);
        assert!(matches!(
            e.require_pins(3),
            Err(Error::PinCountMismatch { expected: 3, got: 2, .. })
        ));
    }
}
