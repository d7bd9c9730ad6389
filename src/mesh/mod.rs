//! Mesh facade consumed by the operator.
//!
//! The operator never walks mesh data structures directly; it asks a
//! [`MeshTopology`] for counts, adjacency, and geometry, all in local
//! indices. Owned entities come first in local numbering, followed by ghosts,
//! so `0..num_cells(Owned)` are exactly the owned cells.

pub mod partition;
pub mod poly;

use crate::solver::comm::{CommunicationBackend, HaloNeighbor};

pub use partition::{CoordinateBisection, LocalMesh, Partitioner};
pub use poly::PolyMesh;

/// Coordinates in up to three dimensions; unused trailing components are 0.
pub type Point = [f64; 3];

pub fn dot(a: &Point, b: &Point) -> f64 {
    a[0] * b[0] + a[1] * b[1] + a[2] * b[2]
}

pub fn sub(a: &Point, b: &Point) -> Point {
    [a[0] - b[0], a[1] - b[1], a[2] - b[2]]
}

pub fn add(a: &Point, b: &Point) -> Point {
    [a[0] + b[0], a[1] + b[1], a[2] + b[2]]
}

pub fn scale(a: &Point, s: f64) -> Point {
    [a[0] * s, a[1] * s, a[2] * s]
}

pub fn cross(a: &Point, b: &Point) -> Point {
    [
        a[1] * b[2] - a[2] * b[1],
        a[2] * b[0] - a[0] * b[2],
        a[0] * b[1] - a[1] * b[0],
    ]
}

pub fn norm(a: &Point) -> f64 {
    dot(a, a).sqrt()
}

/// Which slice of a local entity range to count.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Ownership {
    /// Entities this rank owns.
    Owned,
    /// Owned plus ghost entities.
    Used,
}

/// Read-only mesh queries in local indices.
pub trait MeshTopology: Sync {
    fn space_dimension(&self) -> usize;

    fn num_cells(&self, kind: Ownership) -> usize;

    fn num_faces(&self, kind: Ownership) -> usize;

    /// Faces of a cell.
    fn cell_faces(&self, cell: usize) -> &[usize];

    /// Orientation of each face of a cell: +1 if the face normal points out
    /// of the cell, -1 otherwise. Parallel to [`MeshTopology::cell_faces`].
    fn cell_face_dirs(&self, cell: usize) -> &[i32];

    /// Locally known cells adjacent to a face.
    fn face_cells(&self, face: usize) -> &[usize];

    fn face_area(&self, face: usize) -> f64;

    /// Area-weighted normal in the face's global orientation.
    fn face_normal(&self, face: usize) -> Point;

    fn face_centroid(&self, face: usize) -> Point;

    fn cell_centroid(&self, cell: usize) -> Point;

    fn cell_volume(&self, cell: usize) -> f64;

    fn cell_global_id(&self, cell: usize) -> usize;

    fn face_global_id(&self, face: usize) -> usize;

    /// Rank owning a cell.
    fn cell_owner(&self, cell: usize) -> usize;

    /// Rank owning a face.
    fn face_owner(&self, face: usize) -> usize;

    /// Owner-to-ghost exchange plan over used faces.
    fn face_halo(&self) -> &HaloPlan;

    /// Owner-to-ghost exchange plan over used cells.
    fn cell_halo(&self) -> &HaloPlan;
}

/// Point-to-point exchange plan between an owned range and its ghosts.
///
/// Directions are named from the import point of view: `send_indices[i]`
/// are owned local indices whose values neighbor `neighbor_ranks[i]` holds
/// as ghosts, and `recv_indices[i]` are ghost local indices owned by that
/// neighbor. Both lists are sorted by global id, so the two ends of a link
/// agree on the order. The same plan drives the reverse (export) direction.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HaloPlan {
    pub neighbor_ranks: Vec<usize>,
    pub send_indices: Vec<Vec<usize>>,
    pub recv_indices: Vec<Vec<usize>>,
}

impl HaloPlan {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.neighbor_ranks.is_empty()
    }

    fn neighbors(&self, send: &[Vec<usize>], recv: &[Vec<usize>]) -> (Vec<HaloNeighbor>, usize) {
        let mut recv_start = 0;
        let neighbors = self
            .neighbor_ranks
            .iter()
            .zip(send.iter().zip(recv))
            .map(|(&rank, (send_indices, recv_indices))| {
                let nbr = HaloNeighbor {
                    rank,
                    send_indices: send_indices.clone(),
                    recv_start,
                    recv_count: recv_indices.len(),
                };
                recv_start += recv_indices.len();
                nbr
            })
            .collect();
        (neighbors, recv_start)
    }

    /// Overwrite ghost entries with the owners' values.
    pub fn import(&self, comm: &dyn CommunicationBackend, data: &mut [f64]) {
        if self.is_empty() {
            return;
        }
        let (neighbors, total) = self.neighbors(&self.send_indices, &self.recv_indices);
        let mut recv = vec![0.0; total];
        comm.halo_exchange(&neighbors, data, &mut recv);
        let targets = self.recv_indices.iter().flatten();
        for (&i, v) in targets.zip(recv) {
            data[i] = v;
        }
    }

    /// Add ghost entries into their owners' entries. Ghost entries are left
    /// untouched.
    pub fn export_add(&self, comm: &dyn CommunicationBackend, data: &mut [f64]) {
        if self.is_empty() {
            return;
        }
        let (neighbors, total) = self.neighbors(&self.recv_indices, &self.send_indices);
        let mut recv = vec![0.0; total];
        comm.halo_exchange(&neighbors, data, &mut recv);
        let targets = self.send_indices.iter().flatten();
        for (&i, v) in targets.zip(recv) {
            data[i] += v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::solver::comm::SingleProcessComm;
    use crate::solver::comm_threaded::run_ranks;

    #[test]
    fn vector_helpers() {
        let a = [1.0, 0.0, 0.0];
        let b = [0.0, 1.0, 0.0];
        assert_eq!(cross(&a, &b), [0.0, 0.0, 1.0]);
        assert_eq!(dot(&add(&a, &b), &scale(&b, 2.0)), 2.0);
        assert_eq!(norm(&sub(&a, &b)), 2f64.sqrt());
    }

    #[test]
    fn empty_plan_is_a_noop() {
        let mut data = vec![1.0, 2.0];
        HaloPlan::empty().import(&SingleProcessComm, &mut data);
        HaloPlan::empty().export_add(&SingleProcessComm, &mut data);
        assert_eq!(data, vec![1.0, 2.0]);
    }

    #[test]
    fn import_then_export_between_two_ranks() {
        // Each rank owns two entries and ghosts the neighbor's entry 1.
        let results = run_ranks(2, |comm| {
            let other = 1 - comm.rank();
            let plan = HaloPlan {
                neighbor_ranks: vec![other],
                send_indices: vec![vec![1]],
                recv_indices: vec![vec![2]],
            };
            let base = 10.0 * comm.rank() as f64;
            let mut data = vec![base, base + 1.0, -1.0];
            plan.import(comm, &mut data);
            let imported = data.clone();
            data[2] = 0.5;
            plan.export_add(comm, &mut data);
            (imported, data)
        });
        assert_eq!(results[0].0, vec![0.0, 1.0, 11.0]);
        assert_eq!(results[1].0, vec![10.0, 11.0, 1.0]);
        assert_eq!(results[0].1, vec![0.0, 1.5, 0.5]);
        assert_eq!(results[1].1, vec![10.0, 11.5, 0.5]);
    }
}
