//! Distributed right-preconditioned BiCGSTAB.
//!
//! Vectors hold owned entries only. The operator imports ghost values before
//! every SpMV, and every dot product is an all-reduce, so all ranks follow
//! the same iteration and take the same branch at every check.

use crate::error::{MfdError, Result};

use super::preconditioner::{BlockIlu0, Jacobi, Preconditioner};
use super::{FaceOperator, SchurSolver, SolveOutcome, SolveStatus};

/// Which preconditioner to build from the operator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PreconditionerKind {
    Jacobi,
    #[default]
    BlockIlu0,
}

/// BiCGSTAB service for the Schur complement.
#[derive(Debug, Clone, Copy)]
pub struct BiCgStab {
    pub max_iterations: usize,
    /// Relative reduction of the residual 2-norm.
    pub tolerance: f64,
    pub preconditioner: PreconditionerKind,
}

impl Default for BiCgStab {
    fn default() -> Self {
        Self {
            max_iterations: 10_000,
            tolerance: 1e-12,
            preconditioner: PreconditionerKind::default(),
        }
    }
}

impl SchurSolver for BiCgStab {
    fn solve(&self, op: &FaceOperator<'_>, rhs: &[f64]) -> SolveOutcome {
        let precond: Box<dyn Preconditioner> = match self.preconditioner {
            PreconditionerKind::Jacobi => Box::new(Jacobi::new(op)),
            PreconditionerKind::BlockIlu0 => Box::new(BlockIlu0::new(op)),
        };
        match distributed_bicgstab(op, rhs, precond.as_ref(), self.max_iterations, self.tolerance) {
            Ok((x, iterations)) if iterations < self.max_iterations => {
                SolveOutcome::converged(x, iterations)
            }
            Ok((_, iterations)) => SolveOutcome::failed(
                SolveStatus::MaxIterations,
                iterations,
                format!("BiCGSTAB did not converge in {iterations} iterations"),
            ),
            Err(e) => SolveOutcome::failed(SolveStatus::Breakdown, 0, e.to_string()),
        }
    }

    fn name(&self) -> &'static str {
        "bicgstab"
    }
}

fn axpy(alpha: f64, x: &[f64], y: &mut [f64]) {
    for (yi, xi) in y.iter_mut().zip(x) {
        *yi += alpha * xi;
    }
}

/// Solve `A x = b` from a zero initial guess.
///
/// Returns the solution and the iteration count; a count equal to
/// `max_iterations` means the tolerance was not met.
pub fn distributed_bicgstab(
    op: &FaceOperator<'_>,
    b: &[f64],
    precond: &dyn Preconditioner,
    max_iterations: usize,
    tolerance: f64,
) -> Result<(Vec<f64>, usize)> {
    let n = op.n_owned;
    let _span = tracing::debug_span!("distributed_bicgstab", n_owned = n).entered();
    if b.len() != n {
        return Err(MfdError::Consistency(format!(
            "rhs length {} does not match {} owned rows",
            b.len(),
            n
        )));
    }

    let mut x = vec![0.0; n];
    // r = b, r_hat = b (x starts at 0 so r = b - A*0 = b)
    let mut r = b.to_vec();
    let r_hat = b.to_vec();
    let mut p = vec![0.0; n];
    let mut v = vec![0.0; n];

    let b_norm = op.dot(b, b).sqrt();
    if b_norm < 1e-300 {
        return Ok((x, 0));
    }
    let abs_tol = tolerance * b_norm;

    let mut rho: f64 = 1.0;
    let mut alpha: f64 = 1.0;
    let mut omega: f64 = 1.0;

    for iter in 0..max_iterations {
        let rho_new = op.dot(&r_hat, &r);
        if rho_new.abs() < 1e-300 {
            return Err(MfdError::Solve("BiCGSTAB breakdown: rho ~ 0".into()));
        }

        let beta = (rho_new / rho) * (alpha / omega);
        rho = rho_new;

        // p = r + beta * (p - omega * v)
        for i in 0..n {
            p[i] = r[i] + beta * (p[i] - omega * v[i]);
        }

        let p_hat = precond.apply(&p);
        v = op.apply(&p_hat);

        let r_hat_dot_v = op.dot(&r_hat, &v);
        if r_hat_dot_v.abs() < 1e-300 {
            return Err(MfdError::Solve("BiCGSTAB breakdown: r_hat.v ~ 0".into()));
        }
        alpha = rho / r_hat_dot_v;

        // s = r - alpha * v
        let mut s = r.clone();
        axpy(-alpha, &v, &mut s);

        let s_norm = op.dot(&s, &s).sqrt();
        if s_norm < abs_tol {
            axpy(alpha, &p_hat, &mut x);
            tracing::debug!(iterations = iter + 1, "distributed BiCGSTAB converged");
            return Ok((x, iter + 1));
        }

        let s_hat = precond.apply(&s);
        let t = op.apply(&s_hat);

        let t_dot_s = op.dot(&t, &s);
        let t_dot_t = op.dot(&t, &t);
        if t_dot_t.abs() < 1e-300 {
            return Err(MfdError::Solve("BiCGSTAB breakdown: ||t|| ~ 0".into()));
        }
        omega = t_dot_s / t_dot_t;

        // x = x + alpha * p_hat + omega * s_hat
        axpy(alpha, &p_hat, &mut x);
        axpy(omega, &s_hat, &mut x);

        // r = s - omega * t
        r = s;
        axpy(-omega, &t, &mut r);

        let r_norm = op.dot(&r, &r).sqrt();
        if !r_norm.is_finite() {
            return Err(MfdError::Solve(
                "BiCGSTAB diverged: NaN/Inf in residual".into(),
            ));
        }
        if r_norm < abs_tol {
            tracing::debug!(iterations = iter + 1, "distributed BiCGSTAB converged");
            return Ok((x, iter + 1));
        }

        if omega.abs() < 1e-300 {
            return Err(MfdError::Solve("BiCGSTAB breakdown: omega ~ 0".into()));
        }
    }

    tracing::debug!(max_iterations, "distributed BiCGSTAB hit the iteration limit");
    Ok((x, max_iterations))
}
