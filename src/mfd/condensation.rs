//! Local static condensation of one cell.
//!
//! The elemental mixed system of a cell couples its face unknowns `λ` and
//! its cell unknown `u`:
//!
//! ```text
//! [ B    b_fc ] [ λ ]   [ f_f ]
//! [ b_cfᵀ b_cc ] [ u ] = [ f_c ]
//! ```
//!
//! with the outward face flux `F_n = Σ_m B(n,m)(u − λ_m)`. The cell row is
//! the flux balance `Σ_n F_n`, so `b_cf`/`b_fc` are negated column/row sums
//! of `B` and `b_cc` is its total sum.

use faer::{Col, Mat, MatRef, Scale};

use crate::dense;

/// Condensed contribution of one owned cell.
#[derive(Debug, Clone, PartialEq)]
pub struct ElementalBlock {
    /// Face×face block.
    pub bff: Mat<f64>,
    /// Cell row coupling to each face.
    pub bcf: Vec<f64>,
    /// Face rows coupling to the cell.
    pub bfc: Vec<f64>,
    /// Cell self-coupling.
    pub acc: f64,
    /// Face right-hand side.
    pub ff: Vec<f64>,
    /// Cell right-hand side.
    pub fc: f64,
}

impl ElementalBlock {
    /// Scale `mass` by cell and face mobilities and condense out the cell
    /// unknown. `B(m,n) = M(m,n)·k_c·k_f[m]·k_f[n]`.
    pub fn condense(mass: MatRef<'_, f64>, krel_cell: f64, krel_faces: &[f64]) -> Self {
        let n = mass.nrows();
        let bff = Mat::from_fn(n, n, |i, j| {
            mass[(i, j)] * krel_cell * krel_faces[i] * krel_faces[j]
        });
        let minus_ones = Col::<f64>::full(n, -1.0);
        let bcf: Vec<f64> = (bff.transpose() * &minus_ones).iter().copied().collect();
        let bfc: Vec<f64> = (&bff * &minus_ones).iter().copied().collect();
        let acc = -bcf.iter().sum::<f64>();
        Self {
            bff,
            bcf,
            bfc,
            acc,
            ff: vec![0.0; n],
            fc: 0.0,
        }
    }

    pub fn nfaces(&self) -> usize {
        self.bff.nrows()
    }

    /// Multiply every matrix entry by `factor`. Right-hand sides are left
    /// alone.
    pub fn rescale(&mut self, factor: f64) {
        self.bff *= Scale(factor);
        self.bcf.iter_mut().for_each(|v| *v *= factor);
        self.bfc.iter_mut().for_each(|v| *v *= factor);
        self.acc *= factor;
    }

    /// Storage term on the cell equation: `b_cc += coef`, `f_c += coef·u_old`.
    pub fn add_accumulation(&mut self, coef: f64, previous: f64) {
        self.acc += coef;
        self.fc += coef * previous;
    }

    /// Derivative of a cell mobility `k(u)` folded into the cell column:
    /// `b_fc[n] −= g·F_n` on faces not in `fixed`, `b_cc += g·Σ F_n`, with
    /// `g = k'/k` and `fluxes` the outward fluxes of the current state.
    pub fn add_newton_correction(&mut self, g: f64, fluxes: &[f64], fixed: &[bool]) {
        for (n, q) in fluxes.iter().enumerate() {
            if !fixed[n] {
                self.bfc[n] -= g * q;
            }
        }
        self.acc += g * fluxes.iter().sum::<f64>();
    }

    /// Outward fluxes `F_n = Σ_m B(n,m)(u − λ_m)`.
    pub fn face_fluxes(&self, cell_value: f64, face_values: &[f64]) -> Vec<f64> {
        let drops: Vec<f64> = face_values.iter().map(|l| cell_value - l).collect();
        dense::matvec(self.bff.as_ref(), &drops)
    }

    /// Face-only block after eliminating the cell unknown:
    /// `S(n,m) = B(n,m) − b_fc[n]·b_cf[m]/b_cc`.
    pub fn schur(&self) -> Mat<f64> {
        let n = self.nfaces();
        Mat::from_fn(n, n, |i, j| {
            self.bff[(i, j)] - self.bfc[i] * self.bcf[j] / self.acc
        })
    }
}
