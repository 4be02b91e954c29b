//! Registration of the built-in device kinds.

use voltaic_core::registry::{self, BehaviorRegistry};

/// Register every built-in device kind into a registry.
pub fn register_all(reg: &mut BehaviorRegistry) {
    crate::resistor::register(reg);
    crate::capacitor::register(reg);
    crate::inductor::register(reg);
    crate::sources::register(reg);
    crate::controlled::register(reg);
    crate::switch::register(reg);
    crate::diode::register(reg);
    crate::bjt::register(reg);
    crate::mosfet::register(reg);
}

/// Register the built-in device kinds into the process-wide registry.
///
/// Idempotent: re-registration replaces the factories in place, so calling
/// this from every test case is fine.
pub fn register_builtins() {
    let mut reg = registry::global().write().expect("registry lock poisoned");
    register_all(&mut reg);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn builtins_cover_the_expected_kinds() {
        let mut reg = BehaviorRegistry::new();
        register_all(&mut reg);
        for kind in [
            "resistor", "capacitor", "inductor", "vsource", "isource", "vcvs", "vccs", "cccs",
            "ccvs", "vswitch", "cswitch", "diode", "diode-model", "bjt", "bjt-model", "mosfet",
            "mos-model",
        ] {
            assert!(reg.knows(kind), "missing factory for `{kind}`");
        }
    }
}
