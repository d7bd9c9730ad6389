//! Cell partitioning and rank-local mesh views.
//!
//! A [`Partitioner`] assigns every cell of a global [`PolyMesh`] to a rank.
//! [`LocalMesh::build`] then cuts out one rank's view: its owned cells, one
//! layer of ghost cells (non-owned cells sharing a face with an owned cell),
//! and every face of those cells. A face belongs to the lowest rank among
//! its adjacent cells.
//!
//! Local ordering: owned entities first, then ghosts, each sorted by global
//! id. Halo plans list entities in global-id order on both ends of a link.

use super::poly::PolyMesh;
use super::{HaloPlan, MeshTopology, Ownership, Point};
use std::collections::{BTreeSet, HashMap};

/// Cell partitioner. Returns a partition ID per global cell.
pub trait Partitioner {
    fn partition(&self, mesh: &PolyMesh, num_parts: usize) -> Vec<usize>;
}

/// Recursive coordinate bisection on cell centroids.
///
/// Splits along the longest extent of the current cell set, sizing the two
/// halves proportionally to the number of parts each side receives.
pub struct CoordinateBisection;

impl Partitioner for CoordinateBisection {
    fn partition(&self, mesh: &PolyMesh, num_parts: usize) -> Vec<usize> {
        let n = mesh.num_cells(Ownership::Used);
        if num_parts <= 1 {
            return vec![0; n];
        }
        let centroids: Vec<Point> = (0..n).map(|c| mesh.cell_centroid(c)).collect();
        let mut cells: Vec<usize> = (0..n).collect();
        let mut parts = vec![0; n];
        bisect(&mut cells, &centroids, 0, num_parts, &mut parts);
        parts
    }
}

fn bisect(cells: &mut [usize], centroids: &[Point], first: usize, count: usize, parts: &mut [usize]) {
    if count <= 1 || cells.len() <= 1 {
        for &c in cells.iter() {
            parts[c] = first;
        }
        return;
    }
    let axis = (0..3)
        .max_by(|&a, &b| {
            extent(cells, centroids, a).total_cmp(&extent(cells, centroids, b))
        })
        .unwrap_or(0);
    cells.sort_by(|&a, &b| {
        centroids[a][axis]
            .total_cmp(&centroids[b][axis])
            .then(a.cmp(&b))
    });
    let left_parts = count / 2;
    let split = cells.len() * left_parts / count;
    let (left, right) = cells.split_at_mut(split);
    bisect(left, centroids, first, left_parts, parts);
    bisect(right, centroids, first + left_parts, count - left_parts, parts);
}

fn extent(cells: &[usize], centroids: &[Point], axis: usize) -> f64 {
    let (lo, hi) = cells.iter().fold((f64::INFINITY, f64::NEG_INFINITY), |(lo, hi), &c| {
        (lo.min(centroids[c][axis]), hi.max(centroids[c][axis]))
    });
    hi - lo
}

/// Everything one rank can see of a partitioned mesh.
#[derive(Debug, Clone)]
pub struct LocalMesh {
    dim: usize,
    n_owned_cells: usize,
    n_owned_faces: usize,
    cell_gids: Vec<usize>,
    face_gids: Vec<usize>,
    cell_owner: Vec<usize>,
    face_owner: Vec<usize>,
    cell_faces: Vec<Vec<usize>>,
    cell_dirs: Vec<Vec<i32>>,
    face_cells: Vec<Vec<usize>>,
    face_area: Vec<f64>,
    face_normal: Vec<Point>,
    face_centroid: Vec<Point>,
    cell_volume: Vec<f64>,
    cell_centroid: Vec<Point>,
    face_halo: HaloPlan,
    cell_halo: HaloPlan,
}

/// Global cell and face sets seen by one rank.
struct RankView {
    owned_cells: Vec<usize>,
    ghost_cells: Vec<usize>,
    used_faces: BTreeSet<usize>,
}

fn face_owner(global: &PolyMesh, parts: &[usize], f: usize) -> usize {
    global
        .face_cells(f)
        .iter()
        .map(|&c| parts[c])
        .min()
        .unwrap_or(0)
}

fn rank_view(global: &PolyMesh, parts: &[usize], rank: usize) -> RankView {
    let owned_cells: Vec<usize> = (0..parts.len()).filter(|&c| parts[c] == rank).collect();
    let mut ghosts = BTreeSet::new();
    for &c in &owned_cells {
        for &f in global.cell_faces(c) {
            for &other in global.face_cells(f) {
                if parts[other] != rank {
                    ghosts.insert(other);
                }
            }
        }
    }
    let ghost_cells: Vec<usize> = ghosts.into_iter().collect();
    let used_faces = owned_cells
        .iter()
        .chain(&ghost_cells)
        .flat_map(|&c| global.cell_faces(c).iter().copied())
        .collect();
    RankView {
        owned_cells,
        ghost_cells,
        used_faces,
    }
}

impl LocalMesh {
    /// Cut rank `rank`'s view out of `global` given a cell partition.
    pub fn build(global: &PolyMesh, parts: &[usize], rank: usize) -> Self {
        let num_parts = parts.iter().copied().max().map_or(1, |p| p + 1);
        let views: Vec<RankView> = (0..num_parts).map(|q| rank_view(global, parts, q)).collect();
        let mine = &views[rank];

        // Cells: owned then ghosts, both already sorted by gid.
        let cell_gids: Vec<usize> = mine
            .owned_cells
            .iter()
            .chain(&mine.ghost_cells)
            .copied()
            .collect();
        let cell_lookup: HashMap<usize, usize> =
            cell_gids.iter().enumerate().map(|(l, &g)| (g, l)).collect();

        // Faces: owned then ghosts, sorted by gid.
        let (owned_faces, ghost_faces): (Vec<usize>, Vec<usize>) = mine
            .used_faces
            .iter()
            .partition(|&&f| face_owner(global, parts, f) == rank);
        let face_gids: Vec<usize> = owned_faces.iter().chain(&ghost_faces).copied().collect();
        let face_lookup: HashMap<usize, usize> =
            face_gids.iter().enumerate().map(|(l, &g)| (g, l)).collect();

        let cell_faces = cell_gids
            .iter()
            .map(|&c| global.cell_faces(c).iter().map(|f| face_lookup[f]).collect())
            .collect();
        let cell_dirs = cell_gids
            .iter()
            .map(|&c| global.cell_face_dirs(c).to_vec())
            .collect();
        let face_cells = face_gids
            .iter()
            .map(|&f| {
                global
                    .face_cells(f)
                    .iter()
                    .filter_map(|c| cell_lookup.get(c).copied())
                    .collect()
            })
            .collect();

        let mut face_halo = HaloPlan::empty();
        let mut cell_halo = HaloPlan::empty();
        for (q, theirs) in views.iter().enumerate() {
            if q == rank {
                continue;
            }
            // Owned faces the neighbor uses, and our ghosts it owns.
            let send: Vec<usize> = owned_faces
                .iter()
                .filter(|&&f| theirs.used_faces.contains(&f))
                .map(|f| face_lookup[f])
                .collect();
            let recv: Vec<usize> = ghost_faces
                .iter()
                .filter(|&&f| face_owner(global, parts, f) == q)
                .map(|f| face_lookup[f])
                .collect();
            if !send.is_empty() || !recv.is_empty() {
                face_halo.neighbor_ranks.push(q);
                face_halo.send_indices.push(send);
                face_halo.recv_indices.push(recv);
            }

            let send: Vec<usize> = mine
                .owned_cells
                .iter()
                .filter(|c| theirs.ghost_cells.binary_search(c).is_ok())
                .map(|c| cell_lookup[c])
                .collect();
            let recv: Vec<usize> = mine
                .ghost_cells
                .iter()
                .filter(|&&c| parts[c] == q)
                .map(|c| cell_lookup[c])
                .collect();
            if !send.is_empty() || !recv.is_empty() {
                cell_halo.neighbor_ranks.push(q);
                cell_halo.send_indices.push(send);
                cell_halo.recv_indices.push(recv);
            }
        }

        tracing::debug!(
            rank,
            owned_cells = mine.owned_cells.len(),
            ghost_cells = mine.ghost_cells.len(),
            owned_faces = owned_faces.len(),
            ghost_faces = ghost_faces.len(),
            neighbors = face_halo.neighbor_ranks.len(),
            "built local mesh"
        );

        Self {
            dim: global.space_dimension(),
            n_owned_cells: mine.owned_cells.len(),
            n_owned_faces: owned_faces.len(),
            cell_owner: cell_gids.iter().map(|&c| parts[c]).collect(),
            face_owner: face_gids
                .iter()
                .map(|&f| face_owner(global, parts, f))
                .collect(),
            face_area: face_gids.iter().map(|&f| global.face_area(f)).collect(),
            face_normal: face_gids.iter().map(|&f| global.face_normal(f)).collect(),
            face_centroid: face_gids.iter().map(|&f| global.face_centroid(f)).collect(),
            cell_volume: cell_gids.iter().map(|&c| global.cell_volume(c)).collect(),
            cell_centroid: cell_gids.iter().map(|&c| global.cell_centroid(c)).collect(),
            cell_gids,
            face_gids,
            cell_faces,
            cell_dirs,
            face_cells,
            face_halo,
            cell_halo,
        }
    }
}

impl MeshTopology for LocalMesh {
    fn space_dimension(&self) -> usize {
        self.dim
    }

    fn num_cells(&self, kind: Ownership) -> usize {
        match kind {
            Ownership::Owned => self.n_owned_cells,
            Ownership::Used => self.cell_gids.len(),
        }
    }

    fn num_faces(&self, kind: Ownership) -> usize {
        match kind {
            Ownership::Owned => self.n_owned_faces,
            Ownership::Used => self.face_gids.len(),
        }
    }

    fn cell_faces(&self, cell: usize) -> &[usize] {
        &self.cell_faces[cell]
    }

    fn cell_face_dirs(&self, cell: usize) -> &[i32] {
        &self.cell_dirs[cell]
    }

    fn face_cells(&self, face: usize) -> &[usize] {
        &self.face_cells[face]
    }

    fn face_area(&self, face: usize) -> f64 {
        self.face_area[face]
    }

    fn face_normal(&self, face: usize) -> Point {
        self.face_normal[face]
    }

    fn face_centroid(&self, face: usize) -> Point {
        self.face_centroid[face]
    }

    fn cell_centroid(&self, cell: usize) -> Point {
        self.cell_centroid[cell]
    }

    fn cell_volume(&self, cell: usize) -> f64 {
        self.cell_volume[cell]
    }

    fn cell_global_id(&self, cell: usize) -> usize {
        self.cell_gids[cell]
    }

    fn face_global_id(&self, face: usize) -> usize {
        self.face_gids[face]
    }

    fn cell_owner(&self, cell: usize) -> usize {
        self.cell_owner[cell]
    }

    fn face_owner(&self, face: usize) -> usize {
        self.face_owner[face]
    }

    fn face_halo(&self) -> &HaloPlan {
        &self.face_halo
    }

    fn cell_halo(&self) -> &HaloPlan {
        &self.cell_halo
    }
}
