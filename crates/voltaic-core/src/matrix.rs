//! Sparse matrix / RHS facade for MNA assembly.
//!
//! Devices obtain [`MatrixElement`] handles for the cells they stamp during
//! the *setup* phase; the structural pattern is frozen afterwards and the
//! handles stay valid for the lifetime of the matrix. One facade carries a
//! real and a complex value plane over the same pattern, so a handle
//! allocated once serves both DC/transient and AC assembly.
//!
//! Factorisation is delegated: dense nalgebra LU below [`SPARSE_THRESHOLD`]
//! unknowns, faer sparse LU above it. Row/column 0 is ground; stamps aimed
//! at ground land in a discard slot.

use faer::prelude::*;
use faer::sparse::{SparseColMat, Triplet};
use nalgebra::{DMatrix, DVector, Dyn};
use num_complex::Complex64;
use num_traits::Zero;

use crate::error::{Error, Result};

/// Systems with this many or more unknowns use the sparse solver path.
pub const SPARSE_THRESHOLD: usize = 50;

/// Pivots smaller than this are treated as zero (the classic `pivtol`).
const PIVOT_FLOOR: f64 = 1e-13;

/// Stable reference to one matrix cell. Index 0 is the ground discard slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MatrixElement(usize);

/// Stable reference to one RHS row. Row 0 is the ground discard slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RhsElement(usize);

/// Outcome of a factorisation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FactorOutcome {
    Ok,
    /// The pivot in this (1-based, external) row became zero.
    Singular { row: usize },
}

impl FactorOutcome {
    #[inline]
    pub fn is_ok(&self) -> bool {
        matches!(self, FactorOutcome::Ok)
    }
}

enum RealFactor {
    Dense(nalgebra::linalg::LU<f64, Dyn, Dyn>),
    Sparse(Box<dyn Fn(&DVector<f64>) -> DVector<f64>>),
}

enum ComplexFactor {
    Dense(nalgebra::linalg::LU<Complex64, Dyn, Dyn>),
    Sparse(Box<dyn Fn(&DVector<Complex64>) -> DVector<Complex64>>),
}

/// The MNA matrix and RHS, real and complex planes over one pattern.
pub struct Mna {
    /// Unknown count, ground excluded. Rows/cols 1..=size are live.
    size: usize,
    /// (row, col) -> value index. Indices start at 1; 0 is the discard slot.
    pattern: indexmap::IndexMap<(usize, usize), usize>,
    frozen: bool,
    real: Vec<f64>,
    cplx: Vec<Complex64>,
    rhs: Vec<f64>,
    rhs_c: Vec<Complex64>,
    real_factor: Option<RealFactor>,
    cplx_factor: Option<ComplexFactor>,
}

impl Mna {
    pub fn new() -> Self {
        Self {
            size: 0,
            pattern: indexmap::IndexMap::new(),
            frozen: false,
            real: vec![0.0],
            cplx: vec![Complex64::zero()],
            rhs: Vec::new(),
            rhs_c: Vec::new(),
            real_factor: None,
            cplx_factor: None,
        }
    }

    /// Unknown count (ground excluded).
    #[inline]
    pub fn size(&self) -> usize {
        self.size
    }

    /// Number of allocated cells (ground discard slot excluded).
    pub fn pattern_len(&self) -> usize {
        self.pattern.len()
    }

    /// Allocate (or re-find) the handle for cell `(row, col)`.
    ///
    /// Ground row or column yields the discard handle. Only legal during
    /// setup; the pattern is frozen by [`Mna::finalize`].
    pub fn element(&mut self, row: usize, col: usize) -> MatrixElement {
        if row == 0 || col == 0 {
            return MatrixElement(0);
        }
        debug_assert!(!self.frozen, "element handles are allocated during setup only");
        let next = self.real.len();
        let idx = *self.pattern.entry((row, col)).or_insert(next);
        if idx == next {
            self.real.push(0.0);
            self.cplx.push(Complex64::zero());
        }
        MatrixElement(idx)
    }

    /// Handle for an RHS row; ground yields the discard handle.
    pub fn rhs_element(&mut self, row: usize) -> RhsElement {
        RhsElement(row)
    }

    /// Freeze the pattern and size the RHS for `unknowns` live rows.
    pub fn finalize(&mut self, unknowns: usize) {
        self.size = unknowns;
        self.frozen = true;
        self.rhs = vec![0.0; unknowns + 1];
        self.rhs_c = vec![Complex64::zero(); unknowns + 1];
        self.real_factor = None;
        self.cplx_factor = None;
    }

    /// Drop the pattern entirely; the next setup starts from scratch.
    pub fn reset(&mut self) {
        *self = Self::new();
    }

    // ────────────────────── assembly ──────────────────────

    #[inline]
    pub fn add(&mut self, e: MatrixElement, value: f64) {
        self.real[e.0] += value;
    }

    #[inline]
    pub fn set(&mut self, e: MatrixElement, value: f64) {
        if e.0 != 0 {
            self.real[e.0] = value;
        }
    }

    #[inline]
    pub fn add_complex(&mut self, e: MatrixElement, value: Complex64) {
        self.cplx[e.0] += value;
    }

    #[inline]
    pub fn add_rhs(&mut self, r: RhsElement, value: f64) {
        self.rhs[r.0] += value;
    }

    #[inline]
    pub fn add_rhs_complex(&mut self, r: RhsElement, value: Complex64) {
        self.rhs_c[r.0] += value;
    }

    /// Zero the real value plane and RHS ahead of a load pass.
    pub fn clear(&mut self) {
        self.real.fill(0.0);
        self.rhs.fill(0.0);
        self.real_factor = None;
    }

    /// Zero the complex value plane and RHS ahead of an AC load pass.
    pub fn clear_complex(&mut self) {
        self.cplx.fill(Complex64::zero());
        self.rhs_c.fill(Complex64::zero());
        self.cplx_factor = None;
    }

    /// Read back the real value at a handle (diagnostics and tests).
    pub fn value(&self, e: MatrixElement) -> f64 {
        self.real[e.0]
    }

    /// Read back the real RHS at a row.
    pub fn rhs_value(&self, r: RhsElement) -> f64 {
        self.rhs[r.0]
    }

    /// Sum of absolute values stamped into a row (failure diagnostics: a
    /// zero sum means the row is structurally empty).
    pub fn row_abs_sum(&self, row: usize) -> f64 {
        self.pattern
            .iter()
            .filter(|((r, _), _)| *r == row)
            .map(|(_, &idx)| self.real[idx].abs())
            .sum()
    }

    // ────────────────────── factor / solve ──────────────────────

    /// Factor the real plane. On a zero pivot reports the offending row.
    pub fn factor(&mut self) -> FactorOutcome {
        self.real_factor = None;
        if self.size == 0 {
            return FactorOutcome::Ok;
        }
        if self.size < SPARSE_THRESHOLD {
            self.factor_real_dense()
        } else {
            match self.factor_real_sparse() {
                Some(outcome) => outcome,
                // sparse factorisation failed; redo densely to name the row
                None => self.factor_real_dense(),
            }
        }
    }

    fn factor_real_dense(&mut self) -> FactorOutcome {
        let n = self.size;
        let mut m = DMatrix::<f64>::zeros(n, n);
        for (&(row, col), &idx) in &self.pattern {
            m[(row - 1, col - 1)] = self.real[idx];
        }
        let lu = m.lu();
        let u = lu.u();
        for i in 0..n {
            if u[(i, i)].abs() < PIVOT_FLOOR || !u[(i, i)].is_finite() {
                return FactorOutcome::Singular { row: i + 1 };
            }
        }
        self.real_factor = Some(RealFactor::Dense(lu));
        FactorOutcome::Ok
    }

    fn factor_real_sparse(&mut self) -> Option<FactorOutcome> {
        let n = self.size;
        let triplets: Vec<_> = self
            .pattern
            .iter()
            .map(|(&(row, col), &idx)| Triplet::new(row - 1, col - 1, self.real[idx]))
            .collect();
        let mat = SparseColMat::<usize, f64>::try_new_from_triplets(n, n, &triplets).ok()?;
        let lu = mat.sp_lu().ok()?;
        self.real_factor = Some(RealFactor::Sparse(Box::new(move |b: &DVector<f64>| {
            let rhs = Col::<f64>::from_fn(b.len(), |i| b[i]);
            let x = lu.solve(&rhs);
            DVector::from_fn(b.len(), |i, _| x[i])
        })));
        Some(FactorOutcome::Ok)
    }

    /// Solve the real plane into `x`, indexed by MNA unknown (`x[0]` is
    /// ground and always 0). Requires a successful [`Mna::factor`].
    pub fn solve(&self, x: &mut DVector<f64>) -> Result<()> {
        if x.len() != self.size + 1 {
            return Err(Error::DimensionMismatch {
                expected: self.size + 1,
                actual: x.len(),
            });
        }
        let b = DVector::from_fn(self.size, |i, _| self.rhs[i + 1]);
        let sol = match &self.real_factor {
            Some(RealFactor::Dense(lu)) => lu.solve(&b).ok_or(Error::SingularMatrix(0))?,
            Some(RealFactor::Sparse(solve)) => solve(&b),
            None => return Err(Error::SingularMatrix(0)),
        };
        x[0] = 0.0;
        for i in 0..self.size {
            x[i + 1] = sol[i];
        }
        Ok(())
    }

    /// Factor the complex plane.
    pub fn factor_complex(&mut self) -> FactorOutcome {
        self.cplx_factor = None;
        if self.size == 0 {
            return FactorOutcome::Ok;
        }
        if self.size < SPARSE_THRESHOLD {
            self.factor_complex_dense()
        } else {
            match self.factor_complex_sparse() {
                Some(outcome) => outcome,
                None => self.factor_complex_dense(),
            }
        }
    }

    fn factor_complex_dense(&mut self) -> FactorOutcome {
        let n = self.size;
        let mut m = DMatrix::<Complex64>::zeros(n, n);
        for (&(row, col), &idx) in &self.pattern {
            m[(row - 1, col - 1)] = self.cplx[idx];
        }
        let lu = m.lu();
        let u = lu.u();
        for i in 0..n {
            if u[(i, i)].norm() < PIVOT_FLOOR {
                return FactorOutcome::Singular { row: i + 1 };
            }
        }
        self.cplx_factor = Some(ComplexFactor::Dense(lu));
        FactorOutcome::Ok
    }

    fn factor_complex_sparse(&mut self) -> Option<FactorOutcome> {
        let n = self.size;
        let triplets: Vec<_> = self
            .pattern
            .iter()
            .map(|(&(row, col), &idx)| {
                let v = self.cplx[idx];
                Triplet::new(row - 1, col - 1, c64::new(v.re, v.im))
            })
            .collect();
        let mat = SparseColMat::<usize, c64>::try_new_from_triplets(n, n, &triplets).ok()?;
        let lu = mat.sp_lu().ok()?;
        self.cplx_factor = Some(ComplexFactor::Sparse(Box::new(
            move |b: &DVector<Complex64>| {
                let rhs = Col::<c64>::from_fn(b.len(), |i| c64::new(b[i].re, b[i].im));
                let x = lu.solve(&rhs);
                DVector::from_fn(b.len(), |i, _| Complex64::new(x[i].re, x[i].im))
            },
        )));
        Some(FactorOutcome::Ok)
    }

    /// Solve the complex plane into `x` (same indexing as [`Mna::solve`]).
    pub fn solve_complex(&self, x: &mut DVector<Complex64>) -> Result<()> {
        if x.len() != self.size + 1 {
            return Err(Error::DimensionMismatch {
                expected: self.size + 1,
                actual: x.len(),
            });
        }
        let b = DVector::from_fn(self.size, |i, _| self.rhs_c[i + 1]);
        let sol = match &self.cplx_factor {
            Some(ComplexFactor::Dense(lu)) => lu.solve(&b).ok_or(Error::SingularMatrix(0))?,
            Some(ComplexFactor::Sparse(solve)) => solve(&b),
            None => return Err(Error::SingularMatrix(0)),
        };
        x[0] = Complex64::zero();
        for i in 0..self.size {
            x[i + 1] = sol[i];
        }
        Ok(())
    }
}

impl Default for Mna {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Mna {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mna")
            .field("size", &self.size)
            .field("pattern_len", &self.pattern.len())
            .field("frozen", &self.frozen)
            .finish()
    }
}

/// The four matrix cells of a two-terminal conductance stamp.
#[derive(Debug, Clone, Copy)]
pub struct Quad {
    pp: MatrixElement,
    pn: MatrixElement,
    np: MatrixElement,
    nn: MatrixElement,
}

impl Quad {
    /// Allocate the quad for a conductance between nodes `pos` and `neg`.
    pub fn new(mna: &mut Mna, pos: usize, neg: usize) -> Self {
        Self {
            pp: mna.element(pos, pos),
            pn: mna.element(pos, neg),
            np: mna.element(neg, pos),
            nn: mna.element(neg, neg),
        }
    }

    /// Accumulate conductance `g` into the four cells.
    #[inline]
    pub fn add(&self, mna: &mut Mna, g: f64) {
        mna.add(self.pp, g);
        mna.add(self.nn, g);
        mna.add(self.pn, -g);
        mna.add(self.np, -g);
    }

    /// Accumulate a complex admittance into the four cells.
    #[inline]
    pub fn add_complex(&self, mna: &mut Mna, y: Complex64) {
        mna.add_complex(self.pp, y);
        mna.add_complex(self.nn, y);
        mna.add_complex(self.pn, -y);
        mna.add_complex(self.np, -y);
    }
}

/// The RHS rows of a two-terminal current stamp.
#[derive(Debug, Clone, Copy)]
pub struct RhsPair {
    pos: RhsElement,
    neg: RhsElement,
}

impl RhsPair {
    pub fn new(mna: &mut Mna, pos: usize, neg: usize) -> Self {
        Self {
            pos: mna.rhs_element(pos),
            neg: mna.rhs_element(neg),
        }
    }

    /// Stamp a current `i` flowing out of `pos` into `neg` (through the
    /// device). KCL sees it leaving `pos`, so the RHS row for `pos` drops
    /// by `i` and the row for `neg` gains it.
    #[inline]
    pub fn current(&self, mna: &mut Mna, i: f64) {
        mna.add_rhs(self.pos, -i);
        mna.add_rhs(self.neg, i);
    }

    /// Complex variant of [`RhsPair::current`].
    #[inline]
    pub fn current_complex(&self, mna: &mut Mna, i: Complex64) {
        mna.add_rhs_complex(self.pos, -i);
        mna.add_rhs_complex(self.neg, i);
    }

    /// Stamp a Norton-equivalent source current `ieq` driving node `pos`
    /// (flowing from `neg` into `pos`). The usual companion-model pairing
    /// with a [`Quad`] carrying the equivalent conductance.
    #[inline]
    pub fn norton(&self, mna: &mut Mna, ieq: f64) {
        mna.add_rhs(self.pos, ieq);
        mna.add_rhs(self.neg, -ieq);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Assemble V=5 through R1=1k to node 2, R2=1k to ground; expect 2.5 V.
    #[test]
    fn voltage_divider_by_hand() {
        let mut mna = Mna::new();
        // nodes: 1, 2; branch row 3 for the source
        let r1 = Quad::new(&mut mna, 1, 2);
        let r2 = Quad::new(&mut mna, 2, 0);
        let b_pos = mna.element(1, 3);
        let pos_b = mna.element(3, 1);
        let rhs_b = mna.rhs_element(3);
        mna.finalize(3);

        mna.clear();
        let g = 1.0 / 1000.0;
        r1.add(&mut mna, g);
        r2.add(&mut mna, g);
        mna.add(b_pos, 1.0);
        mna.add(pos_b, 1.0);
        mna.add_rhs(rhs_b, 5.0);

        assert!(mna.factor().is_ok());
        let mut x = DVector::zeros(4);
        mna.solve(&mut x).unwrap();
        assert!((x[1] - 5.0).abs() < 1e-12, "V(1) = {}", x[1]);
        assert!((x[2] - 2.5).abs() < 1e-12, "V(2) = {}", x[2]);
        // branch current = -2.5 mA (into the source's positive terminal)
        assert!((x[3] + 0.0025).abs() < 1e-12, "I = {}", x[3]);
    }

    #[test]
    fn singular_matrix_names_the_row() {
        let mut mna = Mna::new();
        let d1 = mna.element(1, 1);
        let _d2 = mna.element(2, 2); // row 2 left at zero
        mna.finalize(2);
        mna.clear();
        mna.add(d1, 1.0);
        match mna.factor() {
            FactorOutcome::Singular { row } => assert_eq!(row, 2),
            FactorOutcome::Ok => panic!("expected singular"),
        }
    }

    #[test]
    fn ground_stamps_are_discarded() {
        let mut mna = Mna::new();
        let g = mna.element(0, 1);
        let d = mna.element(1, 1);
        let rg = mna.rhs_element(0);
        let r1 = mna.rhs_element(1);
        mna.finalize(1);
        mna.clear();
        mna.add(g, 123.0);
        mna.add(d, 2.0);
        mna.add_rhs(rg, 99.0);
        mna.add_rhs(r1, 4.0);
        assert!(mna.factor().is_ok());
        let mut x = DVector::zeros(2);
        mna.solve(&mut x).unwrap();
        assert_eq!(x[0], 0.0);
        assert!((x[1] - 2.0).abs() < 1e-12);
    }

    #[test]
    fn handles_are_stable_and_shared() {
        let mut mna = Mna::new();
        let a = mna.element(1, 2);
        let b = mna.element(1, 2);
        assert_eq!(a, b);
        assert_eq!(mna.pattern_len(), 1);
    }

    #[test]
    fn complex_plane_shares_the_pattern() {
        let mut mna = Mna::new();
        let q = Quad::new(&mut mna, 1, 0);
        let r = mna.rhs_element(1);
        mna.finalize(1);

        mna.clear_complex();
        // y = 1 + j2 driven by 1A
        q.add_complex(&mut mna, Complex64::new(1.0, 2.0));
        mna.add_rhs_complex(r, Complex64::new(1.0, 0.0));
        assert!(mna.factor_complex().is_ok());
        let mut x = DVector::from_element(2, Complex64::zero());
        mna.solve_complex(&mut x).unwrap();
        let expect = Complex64::new(1.0, 0.0) / Complex64::new(1.0, 2.0);
        assert!((x[1] - expect).norm() < 1e-12);
    }

    #[test]
    fn sparse_path_matches_dense() {
        // A diagonally dominant tridiagonal ladder big enough to go sparse.
        let n = SPARSE_THRESHOLD + 10;
        let mut mna = Mna::new();
        let mut diags = Vec::new();
        for i in 1..=n {
            diags.push(mna.element(i, i));
        }
        let mut offs = Vec::new();
        for i in 1..n {
            offs.push((mna.element(i, i + 1), mna.element(i + 1, i)));
        }
        mna.finalize(n);
        mna.clear();
        for d in &diags {
            mna.add(*d, 4.0);
        }
        for (a, b) in &offs {
            mna.add(*a, -1.0);
            mna.add(*b, -1.0);
        }
        for i in 1..=n {
            let r = mna.rhs_element(i);
            mna.add_rhs(r, i as f64);
        }
        assert!(mna.factor().is_ok());
        let mut x = DVector::zeros(n + 1);
        mna.solve(&mut x).unwrap();

        // residual check: Ax = b
        for i in 1..=n {
            let mut ax = 4.0 * x[i];
            if i > 1 {
                ax -= x[i - 1];
            }
            if i < n {
                ax -= x[i + 1];
            }
            assert!((ax - i as f64).abs() < 1e-9, "row {i}: Ax = {ax}");
        }
    }
}
