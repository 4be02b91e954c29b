//! Meyer's algebraic gate-capacitance model.
//!
//! Returns the per-timepoint capacitance pieces; the load averages the
//! current and previous values (which also supplies the factor of two the
//! half-valued pieces need) and adds the overlap capacitances.

/// Meyer gate capacitances `(capgs, capgd, capgb)` at one bias point.
///
/// `cox` is the total thin-oxide capacitance; the returned pieces are the
/// half-values Berkeley SPICE keeps in its state vector, so summing two
/// adjacent timepoints yields the trapezoidal average of the full value.
pub fn meyer_caps(vgs: f64, vgd: f64, von: f64, vdsat: f64, phi: f64, cox: f64) -> (f64, f64, f64) {
    let vgst = vgs - von;
    if vgst <= -phi {
        // accumulation
        (0.0, 0.0, cox / 2.0)
    } else if vgst <= -phi / 2.0 {
        // weak depletion
        (0.0, 0.0, -vgst * cox / (2.0 * phi))
    } else if vgst <= 0.0 {
        // depletion toward inversion: gate-source turns on
        (
            vgst * cox / (1.5 * phi) + cox / 3.0,
            0.0,
            -vgst * cox / (2.0 * phi),
        )
    } else {
        let vds = vgs - vgd;
        if vdsat <= vds {
            // saturation: the channel is pinched off at the drain
            (cox / 3.0, 0.0, 0.0)
        } else {
            // linear region
            let vddif = 2.0 * vdsat - vds;
            let vddif1 = vdsat - vds;
            let vddif2 = vddif * vddif;
            (
                (1.0 - vddif1 * vddif1 / vddif2) * cox / 3.0,
                (1.0 - vdsat * vdsat / vddif2) * cox / 3.0,
                0.0,
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const COX: f64 = 1e-12;
    const PHI: f64 = 0.6;

    #[test]
    fn accumulation_is_all_gate_bulk() {
        let (cgs, cgd, cgb) = meyer_caps(-2.0, -2.0, 0.7, 0.5, PHI, COX);
        assert_eq!(cgs, 0.0);
        assert_eq!(cgd, 0.0);
        assert!((cgb - COX / 2.0).abs() < 1e-24);
    }

    #[test]
    fn saturation_is_two_thirds_gate_source() {
        // vgst > 0 and vds beyond vdsat
        let (cgs, cgd, cgb) = meyer_caps(2.0, -1.0, 0.7, 1.0, PHI, COX);
        assert!((cgs - COX / 3.0).abs() < 1e-24);
        assert_eq!(cgd, 0.0);
        assert_eq!(cgb, 0.0);
    }

    #[test]
    fn linear_region_splits_gate_capacitance() {
        // vds = 0: symmetric split, capgs = capgd = cox/4
        let (cgs, cgd, _) = meyer_caps(2.0, 2.0, 0.7, 1.0, PHI, COX);
        assert!((cgs - COX / 4.0).abs() < 1e-20, "cgs = {cgs}");
        assert!((cgd - COX / 4.0).abs() < 1e-20, "cgd = {cgd}");
    }

    #[test]
    fn pieces_are_continuous_at_the_region_edges() {
        // across vgst = 0
        let below = meyer_caps(0.7 - 1e-9, 0.0, 0.7, 0.5, PHI, COX);
        let above = meyer_caps(0.7 + 1e-9, 0.0, 0.7, 0.5, PHI, COX);
        assert!((below.0 - above.0).abs() < COX * 1e-6);
    }
}
