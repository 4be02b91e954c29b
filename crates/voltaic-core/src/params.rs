//! Named parameter bundles with given/default tracking.
//!
//! Device models need to know whether a parameter value came from the user
//! or from a default: a resistor computes its resistance from sheet
//! geometry *only* when `r` was never given, and a model re-derives
//! temperature constants only for parameters left at their defaults. A
//! plain `Option<f64>` cannot express that, so every parameter carries a
//! tri-state.

use indexmap::IndexMap;

use crate::error::{Error, Result};

/// How a parameter got its current value.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ParamState {
    /// Never assigned; reads as 0.0.
    #[default]
    Unset,
    /// Holds a model/device default.
    Defaulted,
    /// Explicitly set by the user.
    Given,
}

/// A tagged scalar value.
#[derive(Debug, Clone, Copy, Default)]
pub struct Parameter {
    value: f64,
    state: ParamState,
}

impl Parameter {
    /// A parameter holding a default value.
    pub fn defaulted(value: f64) -> Self {
        Self {
            value,
            state: ParamState::Defaulted,
        }
    }

    /// A parameter with no value at all.
    pub fn unset() -> Self {
        Self::default()
    }

    /// Current value (0.0 while unset).
    #[inline]
    pub fn get(&self) -> f64 {
        self.value
    }

    /// Assign a value and mark it user-given.
    pub fn set(&mut self, value: f64) {
        self.value = value;
        self.state = ParamState::Given;
    }

    /// Install a default without claiming it was given. No-op once given.
    pub fn default_to(&mut self, value: f64) {
        if self.state != ParamState::Given {
            self.value = value;
            self.state = ParamState::Defaulted;
        }
    }

    #[inline]
    pub fn is_given(&self) -> bool {
        self.state == ParamState::Given
    }

    #[inline]
    pub fn state(&self) -> ParamState {
        self.state
    }

    /// The value if given, otherwise the fallback.
    #[inline]
    pub fn given_or(&self, fallback: f64) -> f64 {
        if self.is_given() { self.value } else { fallback }
    }
}

/// A writer for one named parameter of a bundle.
///
/// Created through [`ParamBundle::setter`]; applying it writes the
/// parameter and marks it given.
#[derive(Debug, Clone, Copy)]
pub struct Setter {
    key: &'static str,
}

impl Setter {
    /// Write `value` into the parameter this setter is bound to.
    pub fn apply(&self, bundle: &mut ParamBundle, value: f64) -> Result<()> {
        bundle.set(self.key, value)
    }

    /// The parameter name this setter writes.
    pub fn name(&self) -> &'static str {
        self.key
    }
}

/// An ordered, name-addressed collection of parameters.
#[derive(Debug, Clone, Default)]
pub struct ParamBundle {
    params: IndexMap<&'static str, Parameter>,
    principal: Option<&'static str>,
}

impl ParamBundle {
    pub fn new() -> Self {
        Self::default()
    }

    /// Builder: add a parameter with a default value.
    pub fn with(mut self, name: &'static str, default: f64) -> Self {
        self.params.insert(name, Parameter::defaulted(default));
        self
    }

    /// Builder: add a parameter with no value.
    pub fn with_unset(mut self, name: &'static str) -> Self {
        self.params.insert(name, Parameter::unset());
        self
    }

    /// Builder: mark `name` as the principal parameter (the one a bare
    /// positional netlist value assigns, e.g. a resistor's resistance).
    pub fn principal(mut self, name: &'static str) -> Self {
        debug_assert!(self.params.contains_key(name));
        self.principal = Some(name);
        self
    }

    /// Value of a parameter.
    pub fn get(&self, name: &str) -> Result<f64> {
        self.param(name)
            .map(Parameter::get)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    /// Borrow a parameter.
    pub fn param(&self, name: &str) -> Option<&Parameter> {
        self.params.get(name)
    }

    /// Write a parameter, marking it given.
    pub fn set(&mut self, name: &str, value: f64) -> Result<()> {
        self.params
            .get_mut(name)
            .map(|p| p.set(value))
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))
    }

    /// Whether the user explicitly set a parameter.
    pub fn is_given(&self, name: &str) -> bool {
        self.param(name).is_some_and(Parameter::is_given)
    }

    /// Value of the principal parameter, if one is declared and given.
    pub fn principal_value(&self) -> Option<f64> {
        let key = self.principal?;
        let p = self.params.get(key)?;
        p.is_given().then(|| p.get())
    }

    /// Write the principal parameter.
    pub fn set_principal(&mut self, value: f64) -> Result<()> {
        let key = self
            .principal
            .ok_or_else(|| Error::UnknownParameter("<principal>".to_string()))?;
        self.set(key, value)
    }

    /// Create a [`Setter`] bound to a named parameter.
    pub fn setter(&self, name: &str) -> Result<Setter> {
        let key = self
            .params
            .get_key_value(name)
            .map(|(&k, _)| k)
            .ok_or_else(|| Error::UnknownParameter(name.to_string()))?;
        Ok(Setter { key })
    }

    /// Iterate `(name, parameter)` in declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (&'static str, &Parameter)> {
        self.params.iter().map(|(&k, v)| (k, v))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_are_not_given() {
        let bundle = ParamBundle::new().with("r", 1000.0);
        assert_eq!(bundle.get("r").unwrap(), 1000.0);
        assert!(!bundle.is_given("r"));
    }

    #[test]
    fn set_marks_given() {
        let mut bundle = ParamBundle::new().with("r", 1000.0).principal("r");
        bundle.set("r", 2200.0).unwrap();
        assert!(bundle.is_given("r"));
        assert_eq!(bundle.principal_value(), Some(2200.0));
    }

    #[test]
    fn default_to_never_overrides_given() {
        let mut p = Parameter::unset();
        p.default_to(5.0);
        assert_eq!(p.state(), ParamState::Defaulted);
        p.set(7.0);
        p.default_to(9.0);
        assert_eq!(p.get(), 7.0);
        assert!(p.is_given());
    }

    #[test]
    fn setter_writes_named_parameter() {
        let mut bundle = ParamBundle::new().with("w", 1e-6).with("l", 2e-6);
        let set_l = bundle.setter("l").unwrap();
        set_l.apply(&mut bundle, 0.5e-6).unwrap();
        assert_eq!(bundle.get("l").unwrap(), 0.5e-6);
        assert!(bundle.is_given("l"));
        assert!(!bundle.is_given("w"));
    }

    #[test]
    fn unknown_names_are_reported() {
        let mut bundle = ParamBundle::new().with("r", 1.0);
        assert!(matches!(
            bundle.set("q", 1.0),
            Err(Error::UnknownParameter(_))
        ));
        assert!(bundle.setter("q").is_err());
    }
}
