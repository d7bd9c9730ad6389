//! Two-layer unsaturated column with a closed-form steady profile.
//!
//! Vertical flow through `[0, 1]×[−10, 0]` with conductivity `k1` below the
//! interface `y = −a` and `k2` above. The unknown is the hydraulic head
//! `h = p + g·y` and the mobility is `1/(1 + p²)`. Water leaves through the
//! bottom at the constant rate `cr`; the top holds `p = 0`.

use crate::dense::Tensor;
use crate::error::Result;
use crate::mesh::{dot, MeshTopology, Ownership, Point, PolyMesh};
use crate::mfd::{BcMarker, BoundaryConditions, FlowVector, MatrixMfd, MfdConfig, MfdMethod};
use crate::solver::comm::CommunicationBackend;
use crate::solver::SchurSolver;
use crate::stats::Stats;

use super::steady::{advance_to_steady_state, FlowModel, SteadyState, SteadyStateParams};

#[derive(Debug, Clone, Copy)]
pub struct LayeredColumn {
    pub k1: f64,
    pub k2: f64,
    pub gravity: f64,
    /// Outflow rate through the bottom.
    pub cr: f64,
    /// Depth of the material interface.
    pub interface_depth: f64,
    pub width: f64,
    pub depth: f64,
    pub nx: usize,
    pub ny: usize,
    /// Vertex displacement as a fraction of the cell size.
    pub jitter: f64,
    pub seed: u64,
}

impl Default for LayeredColumn {
    fn default() -> Self {
        Self {
            k1: 0.5,
            k2: 2.0,
            gravity: 2.0,
            cr: 1.021_608_954_629_718_7,
            interface_depth: 5.0,
            width: 1.0,
            depth: 10.0,
            nx: 5,
            ny: 50,
            jitter: 0.2,
            seed: 11,
        }
    }
}

/// Mobility of the column: `k(p) = 1/(1 + p²)` with `p = h − g·y_c`.
pub struct ColumnModel {
    gravity: f64,
    elevations: Vec<f64>,
}

impl FlowModel for ColumnModel {
    fn mobility(&self, cell: usize, value: f64) -> (f64, f64) {
        let p = value - self.gravity * self.elevations[cell];
        let d = 1.0 + p * p;
        (1.0 / d, -2.0 * p / (d * d))
    }

    fn storage(&self, _cell: usize) -> f64 {
        1.0
    }
}

/// Errors of a computed state against the exact profile.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ColumnErrors {
    /// `√(Σ_c (p_c − p(y_c))²|c|)`
    pub pressure: f64,
    /// `√(Σ_f (q_f − u·N_f)² / #faces)`
    pub flux: f64,
    /// `√(Σ_c (Σ_f ±q_f)² / |c|)`
    pub divergence: f64,
}

/// Per-cell output row.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CellRecord {
    pub global_id: usize,
    pub centroid: Point,
    pub head: f64,
    pub pressure: f64,
    pub exact_pressure: f64,
    pub velocity: Point,
}

#[derive(Debug, Clone)]
pub struct ColumnReport {
    pub steady: SteadyState,
    pub errors: ColumnErrors,
    /// Owned cells of this rank.
    pub cells: Vec<CellRecord>,
}

impl LayeredColumn {
    fn f1(&self) -> f64 {
        (1.0 - self.gravity * self.k1 / self.cr).sqrt()
    }

    fn f2(&self) -> f64 {
        (self.gravity * self.k2 / self.cr - 1.0).sqrt()
    }

    /// Exact steady pressure at elevation `z`.
    pub fn pressure(&self, z: f64) -> f64 {
        let a = self.interface_depth;
        let (f1, f2) = (self.f1(), self.f2());
        if z < -a {
            f1 * (self.cr * (z + 2.0 * a) * f1 / self.k1).tan()
        } else {
            let shift = (f1 / f2 * (self.cr * a * f1 / self.k1).tan()).atanh();
            -f2 * (self.cr * f2 * (z + a) / self.k2 - shift).tanh()
        }
    }

    /// Exact Darcy velocity, uniform in the column.
    pub fn velocity(&self) -> Point {
        [0.0, -self.cr, 0.0]
    }

    pub fn conductivity(&self, z: f64) -> f64 {
        if z < -self.interface_depth {
            self.k1
        } else {
            self.k2
        }
    }

    /// Perturbed quadrilateral mesh with the interface kept straight.
    pub fn build_mesh(&self) -> Result<PolyMesh> {
        PolyMesh::perturbed_quad_grid(
            self.nx,
            self.ny,
            (0.0, self.width),
            (-self.depth, 0.0),
            self.jitter,
            self.seed,
            &[-self.interface_depth],
        )
    }

    /// Isotropic conductivity tensor per owned cell.
    pub fn permeability<M: MeshTopology>(&self, mesh: &M) -> Vec<Tensor> {
        (0..mesh.num_cells(Ownership::Owned))
            .map(|c| Tensor::isotropic(2, self.conductivity(mesh.cell_centroid(c)[1])))
            .collect()
    }

    fn on_line<M: MeshTopology>(&self, mesh: &M, f: usize, y: f64) -> bool {
        let normal = mesh.face_normal(f);
        (mesh.face_centroid(f)[1] - y).abs() < 1e-9 * self.depth
            && normal[1].abs() > 0.5 * mesh.face_area(f)
    }

    /// Head 0 on top, outflow `cr` at the bottom, no flow on the sides.
    pub fn boundary_conditions<M: MeshTopology>(&self, mesh: &M) -> BoundaryConditions {
        let mut bc = BoundaryConditions::for_mesh(mesh);
        for f in 0..mesh.num_faces(Ownership::Used) {
            if self.on_line(mesh, f, 0.0) {
                bc.set(f, BcMarker::DirichletHead, 0.0);
            } else if self.on_line(mesh, f, -self.depth) {
                bc.set(f, BcMarker::NeumannFlux, -self.cr);
            }
        }
        bc
    }

    pub fn model<M: MeshTopology>(&self, mesh: &M) -> ColumnModel {
        ColumnModel {
            gravity: self.gravity,
            elevations: (0..mesh.num_cells(Ownership::Owned))
                .map(|c| mesh.cell_centroid(c)[1])
                .collect(),
        }
    }

    /// Hydrostatic start: `p = 0`, so `h = g·y`.
    pub fn initial_guess<M: MeshTopology>(&self, mesh: &M) -> FlowVector {
        FlowVector {
            cells: (0..mesh.num_cells(Ownership::Owned))
                .map(|c| self.gravity * mesh.cell_centroid(c)[1])
                .collect(),
            faces: (0..mesh.num_faces(Ownership::Owned))
                .map(|f| self.gravity * mesh.face_centroid(f)[1])
                .collect(),
        }
    }

    /// Error norms of a head field and its face fluxes, reduced over ranks.
    pub fn errors<M: MeshTopology>(
        &self,
        mesh: &M,
        comm: &dyn CommunicationBackend,
        heads: &[f64],
        flux: &[f64],
    ) -> ColumnErrors {
        let n_cells = mesh.num_cells(Ownership::Owned);
        let n_faces = mesh.num_faces(Ownership::Owned);

        let pressure = (0..n_cells)
            .map(|c| {
                let y = mesh.cell_centroid(c)[1];
                let e = heads[c] - self.gravity * y - self.pressure(y);
                e * e * mesh.cell_volume(c)
            })
            .sum::<f64>();

        let u = self.velocity();
        let flux_sq = (0..n_faces)
            .map(|f| {
                let e = flux[f] - dot(&u, &mesh.face_normal(f));
                e * e
            })
            .sum::<f64>();

        let mut q = vec![0.0; mesh.num_faces(Ownership::Used)];
        q[..n_faces].copy_from_slice(flux);
        mesh.face_halo().import(comm, &mut q);
        let divergence = (0..n_cells)
            .map(|c| {
                let net: f64 = mesh
                    .cell_faces(c)
                    .iter()
                    .zip(mesh.cell_face_dirs(c))
                    .map(|(&f, &d)| q[f] * f64::from(d))
                    .sum();
                net * net / mesh.cell_volume(c)
            })
            .sum::<f64>();

        let total_faces = comm.all_reduce_sum(n_faces as f64);
        ColumnErrors {
            pressure: comm.all_reduce_sum(pressure).sqrt(),
            flux: (comm.all_reduce_sum(flux_sq) / total_faces).sqrt(),
            divergence: comm.all_reduce_sum(divergence).sqrt(),
        }
    }

    /// Run the column to steady state on `mesh` and measure it.
    pub fn solve<M: MeshTopology>(
        &self,
        mesh: &M,
        comm: &dyn CommunicationBackend,
        method: MfdMethod,
        solver: &dyn SchurSolver,
        params: &SteadyStateParams,
        mut stats: Option<&mut Stats>,
    ) -> Result<ColumnReport> {
        let _span = tracing::info_span!("layered_column", method = ?method).entered();
        let config = MfdConfig {
            method,
            symmetric: false,
        };
        let mut matrix = MatrixMfd::new(mesh, comm, config);
        let tally = matrix.create_mass_matrices(&self.permeability(mesh))?;
        if let Some(ref mut s) = stats {
            s.elemental_accepted = tally.accepted;
            s.elemental_fallback = tally.fallback;
        }
        matrix.symbolic_assemble_global_matrices()?;

        let bc = self.boundary_conditions(mesh);
        let model = self.model(mesh);
        let steady = advance_to_steady_state(
            &mut matrix,
            &model,
            &bc,
            solver,
            self.initial_guess(mesh),
            params,
            stats,
        )?;

        let flux = matrix.derive_darcy_flux(&steady.solution)?;
        let velocity = matrix.derive_darcy_velocity(&flux)?;
        let errors = self.errors(mesh, comm, &steady.solution.cells, &flux);
        tracing::info!(
            pressure = errors.pressure,
            flux = errors.flux,
            divergence = errors.divergence,
            "column errors"
        );

        let cells = (0..mesh.num_cells(Ownership::Owned))
            .map(|c| {
                let centroid = mesh.cell_centroid(c);
                let head = steady.solution.cells[c];
                CellRecord {
                    global_id: mesh.cell_global_id(c),
                    centroid,
                    head,
                    pressure: head - self.gravity * centroid[1],
                    exact_pressure: self.pressure(centroid[1]),
                    velocity: velocity[c],
                }
            })
            .collect();
        Ok(ColumnReport {
            steady,
            errors,
            cells,
        })
    }
}
