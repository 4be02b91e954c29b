//! Voltage limiting helpers for nonlinear device iteration.
//!
//! Exponential junctions overflow long before Newton converges if the
//! iterate is allowed to move freely, so each device clamps its new
//! junction voltage against the previous iterate. A clamped voltage sets
//! the "limited" flag, which keeps the solver iterating even when the
//! tolerance test would otherwise pass.

use crate::constants::thermal_voltage;

/// Critical voltage of a junction: the point where the exponential's
/// curvature overtakes the solver, `vt * ln(vt / (sqrt(2) * is))`.
pub fn critical_voltage(saturation_current: f64, temperature: f64) -> f64 {
    let vt = thermal_voltage(temperature);
    vt * (vt / (std::f64::consts::SQRT_2 * saturation_current)).ln()
}

/// Limit a junction voltage step.
///
/// Above the critical voltage, steps larger than `2*vt` are compressed
/// logarithmically: `v = v_old + sign * 2*vt * ln(1 + |dv|/vt)`. Returns
/// the (possibly clamped) voltage and whether limiting occurred.
pub fn limit_junction(vnew: f64, vold: f64, vt: f64, vcrit: f64) -> (f64, bool) {
    let dv = vnew - vold;
    if vnew > vcrit && dv.abs() > 2.0 * vt {
        if vold > 0.0 {
            let v = vold + dv.signum() * 2.0 * vt * (1.0 + dv.abs() / vt).ln();
            (v, true)
        } else {
            // coming up from reverse bias: land on the critical voltage
            (vcrit, true)
        }
    } else {
        (vnew, false)
    }
}

/// Limit a MOSFET gate-channel voltage step around the threshold.
pub fn limit_fet(vnew: f64, vold: f64, vto: f64) -> (f64, bool) {
    let vtsthi = 2.0 * (vold - vto).abs() + 2.0;
    let vtstlo = vtsthi / 2.0 + 2.0;
    let vtox = vto + 3.5;
    let delv = vnew - vold;

    let limited = if vold >= vto {
        if vold >= vtox {
            if delv <= 0.0 {
                // going off
                if vnew >= vtox {
                    vnew.max(vold - vtstlo)
                } else {
                    vnew.max(vto + 2.0)
                }
            } else {
                vnew.min(vold + vtsthi)
            }
        } else if delv <= 0.0 {
            vnew.max(vto - 0.5)
        } else {
            vnew.min(vto + 4.0)
        }
    } else if delv <= 0.0 {
        vnew.max(vold - vtsthi)
    } else {
        // middle region
        vnew.min(vto + 0.5)
    };

    (limited, limited != vnew)
}

/// Limit a drain-source voltage step (conservative halving above 3.5 V).
pub fn limit_vds(vnew: f64, vold: f64) -> (f64, bool) {
    let limited = if vold >= 3.5 {
        if vnew > vold {
            vnew.min(3.0 * vold + 2.0)
        } else if vnew < 3.5 {
            vnew.max(2.0)
        } else {
            vnew
        }
    } else if vnew > vold {
        vnew.min(4.0)
    } else {
        vnew.max(-0.5)
    };
    (limited, limited != vnew)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::REF_TEMPERATURE;

    #[test]
    fn small_steps_pass_through() {
        let vt = thermal_voltage(REF_TEMPERATURE);
        let (v, limited) = limit_junction(0.61, 0.6, vt, 0.7);
        assert_eq!(v, 0.61);
        assert!(!limited);
    }

    #[test]
    fn large_forward_steps_are_compressed() {
        let vt = thermal_voltage(REF_TEMPERATURE);
        let vcrit = critical_voltage(1e-14, REF_TEMPERATURE);
        let (v, limited) = limit_junction(5.0, 0.6, vt, vcrit);
        assert!(limited);
        assert!(v < 1.0, "clamped to {v}");
        assert!(v > 0.6);
    }

    #[test]
    fn reverse_to_forward_lands_on_vcrit() {
        let vt = thermal_voltage(REF_TEMPERATURE);
        let vcrit = critical_voltage(1e-14, REF_TEMPERATURE);
        let (v, limited) = limit_junction(3.0, -1.0, vt, vcrit);
        assert!(limited);
        assert!((v - vcrit).abs() < 1e-12);
    }

    #[test]
    fn limiting_is_monotone_in_the_step_direction() {
        let vt = thermal_voltage(REF_TEMPERATURE);
        let vcrit = critical_voltage(1e-14, REF_TEMPERATURE);
        // diode reciprocity-style check: limited voltage never overshoots
        for &target in &[1.0, 2.0, 4.0, 8.0] {
            let (v, _) = limit_junction(target, 0.65, vt, vcrit);
            assert!(v <= target);
            assert!(v >= 0.65);
        }
    }
}
