//! Driver-facing MFD operator.
//!
//! A cycle for one nonlinear iteration:
//!
//! 1. [`MatrixMfd::create_mass_matrices`] when the permeability changes,
//! 2. [`MatrixMfd::create_stiffness_matrices`] with the current mobilities,
//! 3. optional elemental updates (boundary conditions, accumulation,
//!    Newton correction),
//! 4. [`MatrixMfd::assemble_global_matrices`] (after a one-time
//!    [`MatrixMfd::symbolic_assemble_global_matrices`]),
//! 5. [`MatrixMfd::compute_schur_complement`] and
//!    [`MatrixMfd::apply_inverse`].

use faer::Mat;
use rayon::prelude::*;

use super::assembly::GlobalSystem;
use super::boundary::{apply_elemental, apply_global, BoundaryConditions};
use super::condensation::ElementalBlock;
use super::flux::{self, used_face_values};
use super::mass::{mass_inverse, Acceptance, ElementalTally};
use super::{FlowVector, MfdConfig};
use crate::dense::Tensor;
use crate::error::{MfdError, Result};
use crate::mesh::{MeshTopology, Ownership, Point};
use crate::solver::comm::{collective, CommunicationBackend};
use crate::solver::{FaceOperator, SchurSolver};

/// Which boundary-condition path the current cycle has taken.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum BcPath {
    Elemental,
    Global,
}

pub struct MatrixMfd<'a, M: MeshTopology> {
    mesh: &'a M,
    comm: &'a dyn CommunicationBackend,
    config: MfdConfig,
    mass: Vec<Mat<f64>>,
    /// Condensed blocks before any boundary condition or update.
    stiffness: Vec<ElementalBlock>,
    /// Copy of `stiffness` carrying boundary conditions and updates.
    work: Vec<ElementalBlock>,
    krel_cells: Vec<f64>,
    system: Option<GlobalSystem>,
    bc_path: Option<BcPath>,
    schur_ready: bool,
}

impl<'a, M: MeshTopology> MatrixMfd<'a, M> {
    pub fn new(mesh: &'a M, comm: &'a dyn CommunicationBackend, config: MfdConfig) -> Self {
        Self {
            mesh,
            comm,
            config,
            mass: Vec::new(),
            stiffness: Vec::new(),
            work: Vec::new(),
            krel_cells: Vec::new(),
            system: None,
            bc_path: None,
            schur_ready: false,
        }
    }

    pub fn mesh(&self) -> &'a M {
        self.mesh
    }

    pub fn comm(&self) -> &'a dyn CommunicationBackend {
        self.comm
    }

    pub fn config(&self) -> MfdConfig {
        self.config
    }

    fn num_owned_cells(&self) -> usize {
        self.mesh.num_cells(Ownership::Owned)
    }

    fn num_owned_faces(&self) -> usize {
        self.mesh.num_faces(Ownership::Owned)
    }

    fn expect_len(&self, what: &str, got: usize, want: usize) -> Result<()> {
        let local = if got == want {
            Ok(())
        } else {
            Err(MfdError::Consistency(format!(
                "{what} has length {got}, expected {want}"
            )))
        };
        collective(self.comm, local, what)
    }

    /// Build the elemental inverse mass matrix of every owned cell. Returns
    /// the accepted/fallback tally summed over all ranks.
    pub fn create_mass_matrices(&mut self, permeability: &[Tensor]) -> Result<ElementalTally> {
        let _span = tracing::debug_span!("create_mass_matrices").entered();
        self.expect_len("permeability", permeability.len(), self.num_owned_cells())?;
        let mesh = self.mesh;
        let method = self.config.method;
        let built: Result<Vec<(Mat<f64>, Acceptance)>> = permeability
            .par_iter()
            .enumerate()
            .map(|(c, k)| mass_inverse(mesh, c, k, method))
            .collect();
        let built = collective(self.comm, built, "mass matrix construction")?;

        let fallback = built
            .iter()
            .filter(|(_, a)| *a == Acceptance::Fallback)
            .count();
        let accepted = built.len() - fallback;
        let tally = ElementalTally {
            accepted: self.comm.all_reduce_sum(accepted as f64) as usize,
            fallback: self.comm.all_reduce_sum(fallback as f64) as usize,
        };
        if tally.fallback > 0 {
            tracing::warn!(
                method = ?method,
                fallback = tally.fallback,
                total = tally.total(),
                "elemental matrices fell back to the standard construction"
            );
        }
        tracing::debug!(accepted = tally.accepted, fallback = tally.fallback, "mass matrices built");

        self.mass = built.into_iter().map(|(w, _)| w).collect();
        self.stiffness.clear();
        self.work.clear();
        self.schur_ready = false;
        Ok(tally)
    }

    /// Scale the mass matrices by mobilities and condense each cell.
    ///
    /// `krel_cells` has one entry per owned cell and `krel_faces` one per
    /// owned face; ghost face values are imported. Resets every elemental
    /// update and the boundary-condition path.
    pub fn create_stiffness_matrices(&mut self, krel_cells: &[f64], krel_faces: &[f64]) -> Result<()> {
        let _span = tracing::debug_span!("create_stiffness_matrices").entered();
        if self.mass.len() != self.num_owned_cells() {
            return Err(MfdError::Consistency(
                "stiffness requested before the mass matrices were built".into(),
            ));
        }
        self.expect_len("cell mobility", krel_cells.len(), self.num_owned_cells())?;
        self.expect_len("face mobility", krel_faces.len(), self.num_owned_faces())?;
        let kf = used_face_values(self.mesh, self.comm, krel_faces);
        let mesh = self.mesh;
        self.stiffness = self
            .mass
            .par_iter()
            .enumerate()
            .map(|(c, w)| {
                let local: Vec<f64> = mesh.cell_faces(c).iter().map(|&f| kf[f]).collect();
                ElementalBlock::condense(w.as_ref(), krel_cells[c], &local)
            })
            .collect();
        self.work = self.stiffness.clone();
        self.krel_cells = krel_cells.to_vec();
        self.bc_path = None;
        self.schur_ready = false;
        Ok(())
    }

    /// Multiply every stiffness block by `old_scale / new_scale`.
    pub fn rescale_stiffness_matrices(&mut self, old_scale: f64, new_scale: f64) -> Result<()> {
        let factor = old_scale / new_scale;
        if !factor.is_finite() {
            return Err(MfdError::Consistency(format!(
                "cannot rescale from {old_scale} to {new_scale}"
            )));
        }
        for block in self.stiffness.iter_mut().chain(self.work.iter_mut()) {
            block.rescale(factor);
        }
        self.schur_ready = false;
        Ok(())
    }

    fn check_bc(&self, bc: &BoundaryConditions) -> Result<()> {
        self.expect_len("boundary table", bc.len(), self.mesh.num_faces(Ownership::Used))
    }

    /// Boundary conditions go in once per cycle, through one path. Neumann
    /// terms would otherwise accumulate.
    fn check_bc_path(&self, path: BcPath) -> Result<()> {
        let reason = match self.bc_path {
            None => return Ok(()),
            Some(p) if p == path => "boundary conditions already applied in this cycle",
            Some(BcPath::Global) => "boundary conditions already applied to the global system",
            Some(BcPath::Elemental) => "boundary conditions already applied to the elemental blocks",
        };
        Err(MfdError::Consistency(reason.into()))
    }

    fn stiffness_ready(&self) -> Result<()> {
        if self.work.len() != self.num_owned_cells() {
            return Err(MfdError::Consistency(
                "stiffness matrices have not been created".into(),
            ));
        }
        Ok(())
    }

    /// Eliminate boundary conditions in the elemental blocks.
    pub fn apply_boundary_conditions(&mut self, bc: &BoundaryConditions) -> Result<()> {
        self.stiffness_ready()?;
        self.check_bc(bc)?;
        self.check_bc_path(BcPath::Elemental)?;
        let mesh = self.mesh;
        self.work.par_iter_mut().enumerate().for_each(|(c, block)| {
            apply_elemental(block, mesh.cell_faces(c), bc, |f| mesh.face_area(f));
        });
        self.bc_path = Some(BcPath::Elemental);
        self.schur_ready = false;
        Ok(())
    }

    /// Eliminate boundary conditions in the assembled system.
    pub fn apply_boundary_conditions_global(&mut self, bc: &BoundaryConditions) -> Result<()> {
        self.check_bc(bc)?;
        self.check_bc_path(BcPath::Global)?;
        let mesh = self.mesh;
        let system = self.system.as_mut().ok_or_else(not_assembled)?;
        apply_global(system, bc, |f| mesh.face_area(f));
        self.bc_path = Some(BcPath::Global);
        self.schur_ready = false;
        Ok(())
    }

    /// Storage term `a_c` on each owned cell with previous value `u_old`.
    pub fn add_accumulation(&mut self, coefficients: &[f64], previous: &[f64]) -> Result<()> {
        self.stiffness_ready()?;
        self.expect_len("accumulation", coefficients.len(), self.num_owned_cells())?;
        self.expect_len("previous solution", previous.len(), self.num_owned_cells())?;
        for ((block, a), u) in self.work.iter_mut().zip(coefficients).zip(previous) {
            block.add_accumulation(*a, *u);
        }
        self.schur_ready = false;
        Ok(())
    }

    /// Add the derivative of the cell mobilities at `solution`.
    ///
    /// `dkrel_cells` is `dk/du` per owned cell. Dirichlet faces take their
    /// boundary value. Only valid on a non-symmetric operator.
    pub fn add_newton_correction(
        &mut self,
        dkrel_cells: &[f64],
        solution: &FlowVector,
        bc: &BoundaryConditions,
    ) -> Result<()> {
        if self.config.symmetric {
            return Err(MfdError::Consistency(
                "Newton correction requires a non-symmetric operator".into(),
            ));
        }
        self.stiffness_ready()?;
        self.check_bc(bc)?;
        self.expect_len("mobility derivative", dkrel_cells.len(), self.num_owned_cells())?;
        self.expect_len("cell solution", solution.cells.len(), self.num_owned_cells())?;
        self.expect_len("face solution", solution.faces.len(), self.num_owned_faces())?;

        let mut lambda = used_face_values(self.mesh, self.comm, &solution.faces);
        for (f, l) in lambda.iter_mut().enumerate() {
            if bc.marker(f).is_dirichlet() {
                *l = bc.value(f);
            }
        }
        let local: Result<()> = (0..self.work.len()).try_for_each(|c| {
            let g = dkrel_cells[c] / self.krel_cells[c];
            if !g.is_finite() {
                return Err(MfdError::Consistency(format!(
                    "cell {c} has mobility {} with derivative {}",
                    self.krel_cells[c], dkrel_cells[c]
                )));
            }
            let faces = self.mesh.cell_faces(c);
            let values: Vec<f64> = faces.iter().map(|&f| lambda[f]).collect();
            let fixed: Vec<bool> = faces.iter().map(|&f| bc.marker(f).is_dirichlet()).collect();
            let fluxes = self.stiffness[c].face_fluxes(solution.cells[c], &values);
            self.work[c].add_newton_correction(g, &fluxes, &fixed);
            Ok(())
        });
        collective(self.comm, local, "Newton correction")?;
        self.schur_ready = false;
        Ok(())
    }

    /// Build the sparsity patterns. Needed once per mesh partition.
    pub fn symbolic_assemble_global_matrices(&mut self) -> Result<()> {
        self.system = Some(GlobalSystem::symbolic(self.mesh, self.config.symmetric)?);
        self.schur_ready = false;
        Ok(())
    }

    /// Refill the global matrices and right-hand side from the working
    /// blocks. Global boundary conditions must be applied again afterwards.
    pub fn assemble_global_matrices(&mut self) -> Result<()> {
        self.stiffness_ready()?;
        let system = self.system.as_mut().ok_or_else(not_symbolic)?;
        system.assemble(self.mesh, self.comm, &self.work)?;
        if self.bc_path == Some(BcPath::Global) {
            self.bc_path = None;
        }
        self.schur_ready = false;
        Ok(())
    }

    /// Form `Sff` from the working blocks with `bc`'s Dirichlet faces
    /// eliminated.
    pub fn compute_schur_complement(&mut self, bc: &BoundaryConditions) -> Result<()> {
        self.stiffness_ready()?;
        self.check_bc(bc)?;
        let system = self.system.as_mut().ok_or_else(not_symbolic)?;
        system.compute_schur(self.mesh, self.comm, &self.work, bc)?;
        self.schur_ready = true;
        Ok(())
    }

    pub fn system(&self) -> Option<&GlobalSystem> {
        self.system.as_ref()
    }

    /// Assembled right-hand side.
    pub fn rhs(&self) -> Option<FlowVector> {
        self.system.as_ref().map(|s| FlowVector {
            cells: s.rhs_cells.clone(),
            faces: s.rhs_faces.clone(),
        })
    }

    /// Condensed blocks before boundary conditions and updates.
    pub fn elemental_blocks(&self) -> &[ElementalBlock] {
        &self.stiffness
    }

    /// Blocks as they enter the next assembly.
    pub fn working_blocks(&self) -> &[ElementalBlock] {
        &self.work
    }

    pub fn mass_matrices(&self) -> &[Mat<f64>] {
        &self.mass
    }

    fn check_vector(&self, x: &FlowVector) -> Result<()> {
        self.expect_len("cell segment", x.cells.len(), self.num_owned_cells())?;
        self.expect_len("face segment", x.faces.len(), self.num_owned_faces())
    }

    /// `y_f = Aff x_f + Afc x_c`, `y_c = Acf x_f + Acc x_c`.
    pub fn apply(&self, x: &FlowVector) -> Result<FlowVector> {
        let system = self.system.as_ref().ok_or_else(not_assembled)?;
        self.check_vector(x)?;
        let xf = used_face_values(self.mesh, self.comm, &x.faces);

        let mut yf = system.aff.spmv(&xf);
        for (y, v) in yf.iter_mut().zip(system.afc().spmv_transpose(&x.cells)) {
            *y += v;
        }
        self.mesh.face_halo().export_add(self.comm, &mut yf);
        yf.truncate(self.num_owned_faces());

        let mut yc = system.acf.spmv(&xf);
        for ((y, a), u) in yc.iter_mut().zip(&system.acc).zip(&x.cells) {
            *y += a * u;
        }
        Ok(FlowVector { cells: yc, faces: yf })
    }

    /// Solve `A y = x` by eliminating cells, solving `Sff` with `solver`,
    /// and back-substituting. Returns the solution and the solver's
    /// iteration count.
    pub fn apply_inverse(&self, x: &FlowVector, solver: &dyn SchurSolver) -> Result<(FlowVector, usize)> {
        let _span = tracing::debug_span!("apply_inverse", solver = solver.name()).entered();
        let system = self.system.as_ref().ok_or_else(not_assembled)?;
        if !self.schur_ready {
            return Err(MfdError::Consistency(
                "Schur complement is stale; call compute_schur_complement first".into(),
            ));
        }
        self.check_vector(x)?;
        let n_owned = self.num_owned_faces();

        let scaled: Vec<f64> = x.cells.iter().zip(&system.acc).map(|(u, a)| u / a).collect();
        let mut coupling = system.afc().spmv_transpose(&scaled);
        self.mesh.face_halo().export_add(self.comm, &mut coupling);
        let rhs: Vec<f64> = x.faces.iter().zip(&coupling).map(|(t, c)| t - c).collect();

        let op = FaceOperator {
            matrix: &system.sff,
            n_owned,
            halo: self.mesh.face_halo(),
            comm: self.comm,
        };
        let outcome = solver.solve(&op, &rhs);
        let code = self.comm.all_reduce_max(f64::from(outcome.status.code()));
        let faces = match outcome.solution {
            Some(y) if code == 0.0 => y,
            _ => {
                let detail = if outcome.detail.is_empty() {
                    "failed on another rank".to_string()
                } else {
                    outcome.detail
                };
                return Err(MfdError::Solve(format!(
                    "{} returned code {code}: {detail}",
                    solver.name()
                )));
            }
        };
        tracing::debug!(iterations = outcome.iterations, "Schur solve done");

        let yf = used_face_values(self.mesh, self.comm, &faces);
        let cells = system
            .acf
            .spmv(&yf)
            .iter()
            .zip(&x.cells)
            .zip(&system.acc)
            .map(|((c, u), a)| (u - c) / a)
            .collect();
        Ok((FlowVector { cells, faces }, outcome.iterations))
    }

    /// `f − A x` and its global 2-norm.
    pub fn compute_residual(&self, x: &FlowVector) -> Result<(FlowVector, f64)> {
        let (mut r, norm) = self.compute_negative_residual(x)?;
        r.scale(-1.0);
        Ok((r, norm))
    }

    /// `A x − f` and its global 2-norm. A Newton step solves `J δ = A x − f`
    /// and subtracts `δ`.
    pub fn compute_negative_residual(&self, x: &FlowVector) -> Result<(FlowVector, f64)> {
        let mut r = self.apply(x)?;
        let system = self.system.as_ref().ok_or_else(not_assembled)?;
        for (v, f) in r.cells.iter_mut().zip(&system.rhs_cells) {
            *v -= f;
        }
        for (v, f) in r.faces.iter_mut().zip(&system.rhs_faces) {
            *v -= f;
        }
        let norm = r.norm2(self.comm);
        Ok((r, norm))
    }

    /// One flux per owned face from the pristine stiffness blocks.
    pub fn derive_darcy_flux(&self, solution: &FlowVector) -> Result<Vec<f64>> {
        self.stiffness_ready()?;
        self.check_vector(solution)?;
        Ok(flux::derive_darcy_flux(self.mesh, self.comm, &self.stiffness, solution))
    }

    /// Least-squares velocity per owned cell.
    pub fn derive_darcy_velocity(&self, flux: &[f64]) -> Result<Vec<Point>> {
        self.expect_len("flux", flux.len(), self.num_owned_faces())?;
        let local = flux::derive_darcy_velocity(self.mesh, self.comm, flux);
        collective(self.comm, local, "velocity reconstruction")
    }
}

fn not_symbolic() -> MfdError {
    MfdError::Consistency("numeric assembly before symbolic assembly".into())
}

fn not_assembled() -> MfdError {
    MfdError::Consistency("global matrices have not been assembled".into())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::PolyMesh;
    use crate::mfd::boundary::BcMarker;
    use crate::solver::comm::SingleProcessComm;
    use crate::solver::SparseLu;
    use approx::assert_abs_diff_eq;

    fn unit_operator<'a>(mesh: &'a PolyMesh, symmetric: bool) -> MatrixMfd<'a, PolyMesh> {
        let config = MfdConfig {
            symmetric,
            ..MfdConfig::default()
        };
        let mut op = MatrixMfd::new(mesh, &SingleProcessComm, config);
        let n = mesh.num_cells(Ownership::Owned);
        op.create_mass_matrices(&vec![Tensor::isotropic(2, 1.0); n]).unwrap();
        op.create_stiffness_matrices(&vec![1.0; n], &vec![1.0; mesh.num_faces(Ownership::Owned)])
            .unwrap();
        op.symbolic_assemble_global_matrices().unwrap();
        op
    }

    fn dirichlet_left_right(mesh: &PolyMesh) -> BoundaryConditions {
        let mut bc = BoundaryConditions::for_mesh(mesh);
        for f in mesh.boundary_faces().collect::<Vec<_>>() {
            let x = mesh.face_centroid(f)[0];
            if x.abs() < 1e-12 {
                bc.set(f, BcMarker::DirichletPressure, 1.0);
            } else if (x - 3.0).abs() < 1e-12 {
                bc.set(f, BcMarker::DirichletPressure, 0.0);
            }
        }
        bc
    }

    #[test]
    fn out_of_order_calls_are_consistency_errors() {
        let mesh = PolyMesh::quad_grid(2, 2, (0.0, 1.0), (0.0, 1.0)).unwrap();
        let mut op = MatrixMfd::new(&mesh, &SingleProcessComm, MfdConfig::default());
        assert!(matches!(
            op.create_stiffness_matrices(&[1.0; 4], &[1.0; 12]),
            Err(MfdError::Consistency(_))
        ));
        let mut op = unit_operator(&mesh, true);
        let bc = BoundaryConditions::for_mesh(&mesh);
        assert!(matches!(
            op.add_newton_correction(&[0.0; 4], &FlowVector::for_mesh(&mesh), &bc),
            Err(MfdError::Consistency(_))
        ));
        op.assemble_global_matrices().unwrap();
        op.apply_boundary_conditions_global(&bc).unwrap();
        assert!(matches!(
            op.apply_boundary_conditions(&bc),
            Err(MfdError::Consistency(_))
        ));
        assert!(matches!(
            op.apply_inverse(&FlowVector::for_mesh(&mesh), &SparseLu),
            Err(MfdError::Consistency(_))
        ));
    }

    #[test]
    fn linear_pressure_between_dirichlet_walls() {
        let mesh = PolyMesh::perturbed_quad_grid(3, 3, (0.0, 3.0), (0.0, 1.0), 0.2, 7, &[]).unwrap();
        let bc = dirichlet_left_right(&mesh);
        for global in [false, true] {
            let mut op = unit_operator(&mesh, true);
            if global {
                op.assemble_global_matrices().unwrap();
                op.apply_boundary_conditions_global(&bc).unwrap();
            } else {
                op.apply_boundary_conditions(&bc).unwrap();
                op.assemble_global_matrices().unwrap();
            }
            op.compute_schur_complement(&bc).unwrap();
            let rhs = op.rhs().unwrap();
            let (x, _) = op.apply_inverse(&rhs, &SparseLu).unwrap();
            for c in 0..mesh.num_cells(Ownership::Owned) {
                let expected = 1.0 - mesh.cell_centroid(c)[0] / 3.0;
                assert_abs_diff_eq!(x.cells[c], expected, epsilon = 1e-10);
            }
            let (_, norm) = op.compute_residual(&x).unwrap();
            assert!(norm < 1e-10, "residual {norm}");
            let flux = op.derive_darcy_flux(&x).unwrap();
            for (f, q) in flux.iter().enumerate() {
                assert_abs_diff_eq!(*q, mesh.face_normal(f)[0] / 3.0, epsilon = 1e-10);
            }
        }
    }

    #[test]
    fn apply_inverse_undoes_apply_without_conditions_on_cells() {
        let mesh = PolyMesh::quad_grid(3, 2, (0.0, 3.0), (0.0, 2.0)).unwrap();
        let bc = dirichlet_left_right(&mesh);
        let mut op = unit_operator(&mesh, true);
        op.apply_boundary_conditions(&bc).unwrap();
        op.assemble_global_matrices().unwrap();
        op.compute_schur_complement(&bc).unwrap();
        let mut x = FlowVector::for_mesh(&mesh);
        for (i, v) in x.cells.iter_mut().enumerate() {
            *v = (i as f64).cos();
        }
        for (i, v) in x.faces.iter_mut().enumerate() {
            *v = 0.1 * i as f64;
        }
        let y = op.apply(&x).unwrap();
        let (back, iterations) = op.apply_inverse(&y, &SparseLu).unwrap();
        assert_eq!(iterations, 1);
        for (a, b) in back.cells.iter().zip(&x.cells) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
        for (a, b) in back.faces.iter().zip(&x.faces) {
            assert_abs_diff_eq!(a, b, epsilon = 1e-10);
        }
    }

    #[test]
    fn residuals_are_opposite_and_start_from_the_rhs() {
        let mesh = PolyMesh::quad_grid(3, 2, (0.0, 3.0), (0.0, 2.0)).unwrap();
        let bc = dirichlet_left_right(&mesh);
        let mut op = unit_operator(&mesh, true);
        op.apply_boundary_conditions(&bc).unwrap();
        op.assemble_global_matrices().unwrap();
        let rhs = op.rhs().unwrap();

        let (r0, n0) = op.compute_residual(&FlowVector::for_mesh(&mesh)).unwrap();
        assert_eq!(r0, rhs);
        assert_abs_diff_eq!(n0, rhs.norm2(&SingleProcessComm), epsilon = 1e-14);

        let mut x = FlowVector::for_mesh(&mesh);
        x.cells.iter_mut().for_each(|v| *v = 0.5);
        let (r, nr) = op.compute_residual(&x).unwrap();
        let (nrr, nn) = op.compute_negative_residual(&x).unwrap();
        assert_eq!(nr, nn);
        for (a, b) in r.cells.iter().chain(&r.faces).zip(nrr.cells.iter().chain(&nrr.faces)) {
            assert_eq!(*a, -*b);
        }
    }

    #[test]
    fn boundary_conditions_go_in_once_per_cycle() {
        let mesh = PolyMesh::quad_grid(2, 2, (0.0, 1.0), (0.0, 1.0)).unwrap();
        let mut bc = BoundaryConditions::for_mesh(&mesh);
        for f in mesh.boundary_faces().collect::<Vec<_>>() {
            bc.set(f, BcMarker::NeumannFlux, 0.5);
        }

        let mut op = unit_operator(&mesh, true);
        op.apply_boundary_conditions(&bc).unwrap();
        let blocks = op.working_blocks().to_vec();
        assert!(matches!(
            op.apply_boundary_conditions(&bc),
            Err(MfdError::Consistency(_))
        ));
        assert_eq!(op.working_blocks(), blocks.as_slice());

        op.assemble_global_matrices().unwrap();
        op.apply_boundary_conditions_global(&bc).unwrap_err();

        let mut op = unit_operator(&mesh, true);
        op.assemble_global_matrices().unwrap();
        op.apply_boundary_conditions_global(&bc).unwrap();
        let rhs = op.rhs().unwrap();
        assert!(matches!(
            op.apply_boundary_conditions_global(&bc),
            Err(MfdError::Consistency(_))
        ));
        assert_eq!(op.rhs().unwrap(), rhs);

        // A fresh assembly opens a new cycle on the global path.
        op.assemble_global_matrices().unwrap();
        op.apply_boundary_conditions_global(&bc).unwrap();
        assert_eq!(op.rhs().unwrap(), rhs);
    }

    #[test]
    fn wrong_vector_length_is_rejected() {
        let mesh = PolyMesh::quad_grid(2, 1, (0.0, 2.0), (0.0, 1.0)).unwrap();
        let mut op = unit_operator(&mesh, true);
        op.assemble_global_matrices().unwrap();
        let x = FlowVector::zeros(1, 7);
        assert!(matches!(op.apply(&x), Err(MfdError::Consistency(_))));
    }
}
