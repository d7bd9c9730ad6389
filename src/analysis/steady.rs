//! Reference steady-state driver: pseudo-transient continuation with a
//! Newton solve per pseudo time step.
//!
//! Pseudo time steps follow a fixed geometric schedule. Once the change
//! over one step is negligible, Newton iterations on the steady system
//! (no storage term) finish the solve.

use std::time::Instant;

use crate::error::{MfdError, Result};
use crate::mesh::{MeshTopology, Ownership};
use crate::mfd::{BoundaryConditions, FlowVector, MatrixMfd};
use crate::solver::SchurSolver;
use crate::stats::Stats;

/// Constitutive relations seen by the driver.
pub trait FlowModel: Sync {
    /// Mobility of a cell and its derivative with respect to the cell
    /// unknown, evaluated at `value`.
    fn mobility(&self, cell: usize, value: f64) -> (f64, f64);

    /// Storage capacity per unit volume.
    fn storage(&self, cell: usize) -> f64;
}

#[derive(Debug, Clone, Copy)]
pub struct SteadyStateParams {
    pub initial_dt: f64,
    /// Factor applied to the pseudo time step after every step.
    pub growth: f64,
    pub max_steps: usize,
    pub newton_max_iterations: usize,
    /// Newton stops when `max|δ| ≤ newton_tolerance·max(1, max|u|)`.
    pub newton_tolerance: f64,
    /// Continuation stops when the change over one step is below
    /// `steady_tolerance·max(1, max|u|)`.
    pub steady_tolerance: f64,
}

impl Default for SteadyStateParams {
    fn default() -> Self {
        Self {
            initial_dt: 0.01,
            growth: 2.0,
            max_steps: 60,
            newton_max_iterations: 10,
            newton_tolerance: 1e-10,
            steady_tolerance: 1e-10,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SteadyState {
    pub solution: FlowVector,
    pub pseudo_steps: usize,
    pub newton_iterations: usize,
    /// Last pseudo time step taken.
    pub final_dt: f64,
}

/// Advance `initial` to steady state.
///
/// `matrix` must hold mass matrices; symbolic assembly is done here if it
/// has not been. On return the stiffness blocks match the final state, so
/// fluxes can be derived directly.
#[allow(clippy::too_many_arguments)]
pub fn advance_to_steady_state<M: MeshTopology>(
    matrix: &mut MatrixMfd<'_, M>,
    model: &dyn FlowModel,
    bc: &BoundaryConditions,
    solver: &dyn SchurSolver,
    initial: FlowVector,
    params: &SteadyStateParams,
    mut stats: Option<&mut Stats>,
) -> Result<SteadyState> {
    let _span = tracing::info_span!("steady_state", initial_dt = params.initial_dt).entered();
    if matrix.system().is_none() {
        matrix.symbolic_assemble_global_matrices()?;
    }
    let comm = matrix.comm();
    let mut x = initial;
    let mut dt = params.initial_dt;
    let mut newton_total = 0;
    let mut steps = 0;
    let mut steady = false;

    while steps < params.max_steps {
        let previous = x.clone();
        let iterations = newton_solve(
            matrix,
            model,
            bc,
            solver,
            &mut x,
            Some((dt, previous.cells.as_slice())),
            params,
            stats.as_deref_mut(),
        )?;
        newton_total += iterations;
        steps += 1;

        let mut change = x.clone();
        change.axpy(-1.0, &previous);
        let change = change.max_abs(comm);
        let scale = x.max_abs(comm).max(1.0);
        tracing::info!(step = steps, dt, change, newton = iterations, "pseudo time step");
        if change <= params.steady_tolerance * scale {
            steady = true;
            break;
        }
        dt *= params.growth;
    }
    if let Some(ref mut s) = stats {
        s.pseudo_steps += steps as u32;
    }
    if !steady {
        return Err(MfdError::Solve(format!(
            "no steady state after {steps} pseudo time steps (dt = {dt})"
        )));
    }

    newton_total += newton_solve(matrix, model, bc, solver, &mut x, None, params, stats)?;
    refresh_stiffness(matrix, model, &x)?;
    tracing::info!(steps, newton = newton_total, "steady state reached");
    Ok(SteadyState {
        solution: x,
        pseudo_steps: steps,
        newton_iterations: newton_total,
        final_dt: dt,
    })
}

/// Mobility and derivative per owned cell at `x`.
fn mobilities<M: MeshTopology>(mesh: &M, model: &dyn FlowModel, x: &FlowVector) -> (Vec<f64>, Vec<f64>) {
    (0..mesh.num_cells(Ownership::Owned))
        .map(|c| model.mobility(c, x.cells[c]))
        .unzip()
}

fn refresh_stiffness<M: MeshTopology>(
    matrix: &mut MatrixMfd<'_, M>,
    model: &dyn FlowModel,
    x: &FlowVector,
) -> Result<Vec<f64>> {
    let mesh = matrix.mesh();
    let (krel, dkrel) = mobilities(mesh, model, x);
    matrix.create_stiffness_matrices(&krel, &vec![1.0; mesh.num_faces(Ownership::Owned)])?;
    Ok(dkrel)
}

/// Newton iterations at a fixed pseudo time step (`None`: steady system).
#[allow(clippy::too_many_arguments)]
fn newton_solve<M: MeshTopology>(
    matrix: &mut MatrixMfd<'_, M>,
    model: &dyn FlowModel,
    bc: &BoundaryConditions,
    solver: &dyn SchurSolver,
    x: &mut FlowVector,
    accumulation: Option<(f64, &[f64])>,
    params: &SteadyStateParams,
    mut stats: Option<&mut Stats>,
) -> Result<usize> {
    let mesh = matrix.mesh();
    let comm = matrix.comm();
    let storage: Option<Vec<f64>> = accumulation.map(|(dt, _)| {
        (0..mesh.num_cells(Ownership::Owned))
            .map(|c| model.storage(c) * mesh.cell_volume(c) / dt)
            .collect()
    });

    for iteration in 1..=params.newton_max_iterations {
        let t0 = Instant::now();
        let dkrel = refresh_stiffness(matrix, model, x)?;
        matrix.apply_boundary_conditions(bc)?;
        if let (Some(coefs), Some((_, previous))) = (&storage, accumulation) {
            matrix.add_accumulation(coefs, previous)?;
        }
        let t1 = Instant::now();
        matrix.assemble_global_matrices()?;
        let (residual, residual_norm) = matrix.compute_negative_residual(x)?;
        matrix.add_newton_correction(&dkrel, x, bc)?;
        matrix.assemble_global_matrices()?;
        let t2 = Instant::now();
        matrix.compute_schur_complement(bc)?;
        let t3 = Instant::now();
        let (delta, solver_iterations) = matrix.apply_inverse(&residual, solver)?;
        let t4 = Instant::now();

        x.axpy(-1.0, &delta);
        let step = delta.max_abs(comm);
        let scale = x.max_abs(comm).max(1.0);
        tracing::debug!(iteration, residual_norm, step, solver_iterations, "Newton iteration");

        if let Some(ref mut s) = stats {
            s.newton_iterations += 1;
            s.solver_iters_per_newton.push(solver_iterations as u32);
            s.stiffness += t1 - t0;
            s.assembly += t2 - t1;
            s.schur += t3 - t2;
            s.linear_solve += t4 - t3;
        }
        if !step.is_finite() {
            return Err(MfdError::Solve("Newton update is not finite".into()));
        }
        if step <= params.newton_tolerance * scale {
            return Ok(iteration);
        }
    }
    Err(MfdError::Solve(format!(
        "Newton did not converge in {} iterations",
        params.newton_max_iterations
    )))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::dense::Tensor;
    use crate::mesh::PolyMesh;
    use crate::mfd::{BcMarker, MfdConfig};
    use crate::solver::comm::SingleProcessComm;
    use crate::solver::SparseLu;
    use approx::assert_abs_diff_eq;

    /// Mobility `1 + u²`: nonlinear but with a linear steady solution in 1D.
    struct Quadratic;

    impl FlowModel for Quadratic {
        fn mobility(&self, _cell: usize, value: f64) -> (f64, f64) {
            (1.0 + value * value, 2.0 * value)
        }

        fn storage(&self, _cell: usize) -> f64 {
            1.0
        }
    }

    #[test]
    fn constant_state_between_equal_walls() {
        let mesh = PolyMesh::quad_grid(4, 1, (0.0, 4.0), (0.0, 1.0)).unwrap();
        let mut bc = BoundaryConditions::for_mesh(&mesh);
        for f in mesh.boundary_faces().collect::<Vec<_>>() {
            let x = mesh.face_centroid(f)[0];
            if x.abs() < 1e-12 || (x - 4.0).abs() < 1e-12 {
                bc.set(f, BcMarker::DirichletHead, 0.5);
            }
        }
        let config = MfdConfig {
            symmetric: false,
            ..MfdConfig::default()
        };
        let mut matrix = MatrixMfd::new(&mesh, &SingleProcessComm, config);
        matrix
            .create_mass_matrices(&vec![Tensor::isotropic(2, 1.0); 4])
            .unwrap();
        let initial = FlowVector::for_mesh(&mesh);
        let mut stats = Stats::new();
        let result = advance_to_steady_state(
            &mut matrix,
            &Quadratic,
            &bc,
            &SparseLu,
            initial,
            &SteadyStateParams::default(),
            Some(&mut stats),
        )
        .unwrap();
        for u in &result.solution.cells {
            assert_abs_diff_eq!(*u, 0.5, epsilon = 1e-9);
        }
        assert!(result.pseudo_steps > 1);
        assert_eq!(stats.pseudo_steps as usize, result.pseudo_steps);
        assert_eq!(stats.newton_iterations as usize, result.newton_iterations);
    }

    #[test]
    fn symmetric_operator_cannot_take_newton_steps() {
        let mesh = PolyMesh::quad_grid(1, 1, (0.0, 1.0), (0.0, 1.0)).unwrap();
        let bc = BoundaryConditions::for_mesh(&mesh);
        let mut matrix = MatrixMfd::new(&mesh, &SingleProcessComm, MfdConfig::default());
        matrix
            .create_mass_matrices(&[Tensor::isotropic(2, 1.0)])
            .unwrap();
        let err = advance_to_steady_state(
            &mut matrix,
            &Quadratic,
            &bc,
            &SparseLu,
            FlowVector::for_mesh(&mesh),
            &SteadyStateParams::default(),
            None,
        );
        assert!(matches!(err, Err(MfdError::Consistency(_))));
    }
}
