//! Physical constants used by the device models.
//!
//! Values match the ones Berkeley SPICE has used for decades so that model
//! kernels reproduce reference results bit-for-bit where possible.

/// Boltzmann constant (J/K).
pub const BOLTZMANN: f64 = 1.380_622_6e-23;

/// Elementary charge (C).
pub const CHARGE: f64 = 1.602_191_8e-19;

/// 0 degrees Celsius in Kelvin.
pub const KELVIN: f64 = 273.15;

/// Default simulation temperature: 27 C.
pub const REF_TEMPERATURE: f64 = KELVIN + 27.0;

/// Thermal voltage kT/q at the given temperature (K).
#[inline]
pub fn thermal_voltage(temperature: f64) -> f64 {
    BOLTZMANN * temperature / CHARGE
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn thermal_voltage_at_room_temperature() {
        // kT/q at 300.15 K is about 25.86 mV
        let vt = thermal_voltage(REF_TEMPERATURE);
        assert!((vt - 0.02586).abs() < 1e-4, "vt = {vt}");
    }
}
