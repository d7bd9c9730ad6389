//! Unstructured single-rank mesh with face-based cell connectivity.
//!
//! Cells are described by their faces, faces by their vertices. Geometry
//! (areas, normals, centroids, volumes) is derived once at construction.

use super::{add, cross, dot, norm, scale, sub, HaloPlan, MeshTopology, Ownership, Point};
use crate::error::{MfdError, Result};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::collections::HashMap;

/// Axis-aligned extent `(min, max)` along one coordinate.
pub type Span = (f64, f64);

#[derive(Debug, Clone)]
pub struct PolyMesh {
    dim: usize,
    nodes: Vec<Point>,
    face_nodes: Vec<Vec<usize>>,
    cell_faces: Vec<Vec<usize>>,
    cell_dirs: Vec<Vec<i32>>,
    face_cells: Vec<Vec<usize>>,
    face_area: Vec<f64>,
    face_normal: Vec<Point>,
    face_centroid: Vec<Point>,
    cell_volume: Vec<f64>,
    cell_centroid: Vec<Point>,
    halo: HaloPlan,
}

impl PolyMesh {
    /// Build a mesh from explicit connectivity.
    ///
    /// In 2D a face is an edge `[a, b]` whose normal is the tangent rotated
    /// clockwise; in 3D a face is a vertex loop whose normal follows the
    /// right-hand rule. `cell_dirs[c][i]` is +1 when that normal points out
    /// of cell `c`.
    pub fn new(
        dim: usize,
        nodes: Vec<Point>,
        face_nodes: Vec<Vec<usize>>,
        cell_faces: Vec<Vec<usize>>,
        cell_dirs: Vec<Vec<i32>>,
    ) -> Result<Self> {
        if !(2..=3).contains(&dim) {
            return Err(MfdError::Consistency(format!(
                "unsupported space dimension {dim}"
            )));
        }
        if cell_faces.len() != cell_dirs.len() {
            return Err(MfdError::Consistency(
                "cell face and direction lists differ in length".into(),
            ));
        }

        let nfaces = face_nodes.len();
        let mut face_cells = vec![Vec::new(); nfaces];
        for (c, (faces, dirs)) in cell_faces.iter().zip(&cell_dirs).enumerate() {
            if faces.len() != dirs.len() || faces.len() < dim + 1 {
                return Err(MfdError::MalformedCell {
                    cell: c,
                    reason: format!("{} faces, {} directions", faces.len(), dirs.len()),
                });
            }
            for &f in faces {
                if f >= nfaces {
                    return Err(MfdError::MalformedCell {
                        cell: c,
                        reason: format!("face {f} out of range"),
                    });
                }
                face_cells[f].push(c);
            }
        }
        for (f, cells) in face_cells.iter().enumerate() {
            match cells.as_slice() {
                [_] => {}
                [a, b] => {
                    let da = dir_of(&cell_faces[*a], &cell_dirs[*a], f);
                    let db = dir_of(&cell_faces[*b], &cell_dirs[*b], f);
                    if da + db != 0 {
                        return Err(MfdError::Consistency(format!(
                            "interior face {f} has the same orientation in cells {a} and {b}"
                        )));
                    }
                }
                _ => {
                    return Err(MfdError::Consistency(format!(
                        "face {f} is shared by {} cells",
                        cells.len()
                    )))
                }
            }
        }

        let mut face_area = Vec::with_capacity(nfaces);
        let mut face_normal = Vec::with_capacity(nfaces);
        let mut face_centroid = Vec::with_capacity(nfaces);
        for verts in &face_nodes {
            let (a, n, x) = face_geometry(dim, &nodes, verts);
            face_area.push(a);
            face_normal.push(n);
            face_centroid.push(x);
        }

        let mut cell_volume = Vec::with_capacity(cell_faces.len());
        let mut cell_centroid = Vec::with_capacity(cell_faces.len());
        for (c, (faces, dirs)) in cell_faces.iter().zip(&cell_dirs).enumerate() {
            let (v, x) = cell_geometry(dim, faces, dirs, &face_normal, &face_centroid);
            if v.is_nan() || v <= 0.0 {
                return Err(MfdError::MalformedCell {
                    cell: c,
                    reason: format!("non-positive volume {v}"),
                });
            }
            cell_volume.push(v);
            cell_centroid.push(x);
        }

        Ok(Self {
            dim,
            nodes,
            face_nodes,
            cell_faces,
            cell_dirs,
            face_cells,
            face_area,
            face_normal,
            face_centroid,
            cell_volume,
            cell_centroid,
            halo: HaloPlan::empty(),
        })
    }

    /// Uniform `nx`×`ny` quadrilateral grid.
    pub fn quad_grid(nx: usize, ny: usize, x: Span, y: Span) -> Result<Self> {
        Self::perturbed_quad_grid(nx, ny, x, y, 0.0, 0, &[])
    }

    /// Quadrilateral grid with randomly displaced interior vertices.
    ///
    /// Each vertex moves by up to `jitter` cell widths along each axis.
    /// Vertices on the left/right boundary keep their x, vertices on the
    /// bottom/top boundary or on one of the `fixed_y` lines keep their y.
    pub fn perturbed_quad_grid(
        nx: usize,
        ny: usize,
        x: Span,
        y: Span,
        jitter: f64,
        seed: u64,
        fixed_y: &[f64],
    ) -> Result<Self> {
        if nx == 0 || ny == 0 {
            return Err(MfdError::Consistency("empty grid".into()));
        }
        let hx = (x.1 - x.0) / nx as f64;
        let hy = (y.1 - y.0) / ny as f64;
        let tol = 1e-9 * hy.abs();
        let mut rng = StdRng::seed_from_u64(seed);

        let vid = |i: usize, j: usize| j * (nx + 1) + i;
        let mut nodes = Vec::with_capacity((nx + 1) * (ny + 1));
        for j in 0..=ny {
            for i in 0..=nx {
                let mut px = x.0 + i as f64 * hx;
                let mut py = y.0 + j as f64 * hy;
                let dx = rng.gen_range(-1.0..=1.0) * jitter * hx;
                let dy = rng.gen_range(-1.0..=1.0) * jitter * hy;
                if i != 0 && i != nx {
                    px += dx;
                }
                let pinned = j == 0 || j == ny || fixed_y.iter().any(|&l| (py - l).abs() < tol);
                if !pinned {
                    py += dy;
                }
                nodes.push([px, py, 0.0]);
            }
        }

        let mut builder = EdgeBuilder::default();
        for j in 0..ny {
            for i in 0..nx {
                let ring = [vid(i, j), vid(i + 1, j), vid(i + 1, j + 1), vid(i, j + 1)];
                builder.add_cell(&ring);
            }
        }
        Self::new(2, nodes, builder.face_nodes, builder.cell_faces, builder.cell_dirs)
    }

    /// Uniform `nx`×`ny`×`nz` hexahedral grid. Cell faces are listed as
    /// x-, x+, y-, y+, z-, z+.
    pub fn hex_grid(nx: usize, ny: usize, nz: usize, x: Span, y: Span, z: Span) -> Result<Self> {
        if nx == 0 || ny == 0 || nz == 0 {
            return Err(MfdError::Consistency("empty grid".into()));
        }
        let h = [
            (x.1 - x.0) / nx as f64,
            (y.1 - y.0) / ny as f64,
            (z.1 - z.0) / nz as f64,
        ];
        let vid = |i: usize, j: usize, k: usize| (k * (ny + 1) + j) * (nx + 1) + i;
        let mut nodes = Vec::with_capacity((nx + 1) * (ny + 1) * (nz + 1));
        for k in 0..=nz {
            for j in 0..=ny {
                for i in 0..=nx {
                    nodes.push([
                        x.0 + i as f64 * h[0],
                        y.0 + j as f64 * h[1],
                        z.0 + k as f64 * h[2],
                    ]);
                }
            }
        }

        let mut face_nodes = Vec::new();
        let mut xface = HashMap::new();
        let mut yface = HashMap::new();
        let mut zface = HashMap::new();
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..=nx {
                    xface.insert((i, j, k), face_nodes.len());
                    face_nodes.push(vec![
                        vid(i, j, k),
                        vid(i, j + 1, k),
                        vid(i, j + 1, k + 1),
                        vid(i, j, k + 1),
                    ]);
                }
            }
        }
        for k in 0..nz {
            for j in 0..=ny {
                for i in 0..nx {
                    yface.insert((i, j, k), face_nodes.len());
                    face_nodes.push(vec![
                        vid(i, j, k),
                        vid(i, j, k + 1),
                        vid(i + 1, j, k + 1),
                        vid(i + 1, j, k),
                    ]);
                }
            }
        }
        for k in 0..=nz {
            for j in 0..ny {
                for i in 0..nx {
                    zface.insert((i, j, k), face_nodes.len());
                    face_nodes.push(vec![
                        vid(i, j, k),
                        vid(i + 1, j, k),
                        vid(i + 1, j + 1, k),
                        vid(i, j + 1, k),
                    ]);
                }
            }
        }

        let mut cell_faces = Vec::with_capacity(nx * ny * nz);
        let mut cell_dirs = Vec::with_capacity(nx * ny * nz);
        for k in 0..nz {
            for j in 0..ny {
                for i in 0..nx {
                    cell_faces.push(vec![
                        xface[&(i, j, k)],
                        xface[&(i + 1, j, k)],
                        yface[&(i, j, k)],
                        yface[&(i, j + 1, k)],
                        zface[&(i, j, k)],
                        zface[&(i, j, k + 1)],
                    ]);
                    cell_dirs.push(vec![-1, 1, -1, 1, -1, 1]);
                }
            }
        }
        Self::new(3, nodes, face_nodes, cell_faces, cell_dirs)
    }

    pub fn num_nodes(&self) -> usize {
        self.nodes.len()
    }

    pub fn node(&self, n: usize) -> Point {
        self.nodes[n]
    }

    pub fn face_nodes(&self, f: usize) -> &[usize] {
        &self.face_nodes[f]
    }

    /// Faces with a single adjacent cell.
    pub fn boundary_faces(&self) -> impl Iterator<Item = usize> + '_ {
        (0..self.face_cells.len()).filter(|&f| self.face_cells[f].len() == 1)
    }
}

/// Collects edges of 2D cells given as counter-clockwise vertex rings.
#[derive(Default)]
struct EdgeBuilder {
    index: HashMap<(usize, usize), usize>,
    face_nodes: Vec<Vec<usize>>,
    cell_faces: Vec<Vec<usize>>,
    cell_dirs: Vec<Vec<i32>>,
}

impl EdgeBuilder {
    fn add_cell(&mut self, ring: &[usize]) {
        let mut faces = Vec::with_capacity(ring.len());
        let mut dirs = Vec::with_capacity(ring.len());
        for (k, &a) in ring.iter().enumerate() {
            let b = ring[(k + 1) % ring.len()];
            let key = (a.min(b), a.max(b));
            match self.index.get(&key) {
                Some(&f) => {
                    faces.push(f);
                    dirs.push(-1);
                }
                None => {
                    let f = self.face_nodes.len();
                    self.index.insert(key, f);
                    // Stored in this cell's ring order, so the normal points out.
                    self.face_nodes.push(vec![a, b]);
                    faces.push(f);
                    dirs.push(1);
                }
            }
        }
        self.cell_faces.push(faces);
        self.cell_dirs.push(dirs);
    }
}

fn dir_of(faces: &[usize], dirs: &[i32], f: usize) -> i32 {
    faces
        .iter()
        .position(|&g| g == f)
        .map(|i| dirs[i])
        .unwrap_or(0)
}

/// Area, area-weighted normal and centroid of a face.
fn face_geometry(dim: usize, nodes: &[Point], verts: &[usize]) -> (f64, Point, Point) {
    if dim == 2 {
        let a = nodes[verts[0]];
        let b = nodes[verts[1]];
        let t = sub(&b, &a);
        let normal = [t[1], -t[0], 0.0];
        return (norm(&t), normal, scale(&add(&a, &b), 0.5));
    }

    // Newell's method for the normal, fan triangulation for the centroid.
    let n = verts.len();
    let mut normal = [0.0; 3];
    for k in 0..n {
        let p = nodes[verts[k]];
        let q = nodes[verts[(k + 1) % n]];
        normal = add(&normal, &cross(&p, &q));
    }
    let normal = scale(&normal, 0.5);
    let area = norm(&normal);
    let unit = if area > 0.0 { scale(&normal, 1.0 / area) } else { normal };

    let p0 = nodes[verts[0]];
    let mut centroid = [0.0; 3];
    let mut weight = 0.0;
    for k in 1..n.saturating_sub(1) {
        let p1 = nodes[verts[k]];
        let p2 = nodes[verts[k + 1]];
        let tri = 0.5 * dot(&cross(&sub(&p1, &p0), &sub(&p2, &p0)), &unit);
        let mid = scale(&add(&add(&p0, &p1), &p2), 1.0 / 3.0);
        centroid = add(&centroid, &scale(&mid, tri));
        weight += tri;
    }
    let centroid = if weight != 0.0 {
        scale(&centroid, 1.0 / weight)
    } else {
        p0
    };
    (area, normal, centroid)
}

/// Volume and centroid by decomposition into cones over each face.
pub(crate) fn cell_geometry(
    dim: usize,
    faces: &[usize],
    dirs: &[i32],
    normals: &[Point],
    centroids: &[Point],
) -> (f64, Point) {
    let apex = scale(
        &faces
            .iter()
            .fold([0.0; 3], |acc, &f| add(&acc, &centroids[f])),
        1.0 / faces.len() as f64,
    );
    let d = dim as f64;
    let mut volume = 0.0;
    let mut moment = [0.0; 3];
    for (&f, &dir) in faces.iter().zip(dirs) {
        let arm = sub(&centroids[f], &apex);
        let v = dir as f64 * dot(&arm, &normals[f]) / d;
        let x = add(&apex, &scale(&arm, d / (d + 1.0)));
        volume += v;
        moment = add(&moment, &scale(&x, v));
    }
    let centroid = if volume != 0.0 {
        scale(&moment, 1.0 / volume)
    } else {
        apex
    };
    (volume, centroid)
}

impl MeshTopology for PolyMesh {
    fn space_dimension(&self) -> usize {
        self.dim
    }

    fn num_cells(&self, _kind: Ownership) -> usize {
        self.cell_faces.len()
    }

    fn num_faces(&self, _kind: Ownership) -> usize {
        self.face_nodes.len()
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
        cell
    }

    fn face_global_id(&self, face: usize) -> usize {
        face
    }

    fn cell_owner(&self, _cell: usize) -> usize {
        0
    }

    fn face_owner(&self, _face: usize) -> usize {
        0
    }

    fn face_halo(&self) -> &HaloPlan {
        &self.halo
    }

    fn cell_halo(&self) -> &HaloPlan {
        &self.halo
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use approx::assert_abs_diff_eq;

    #[test]
    fn unit_square_grid_geometry() {
        let mesh = PolyMesh::quad_grid(2, 3, (0.0, 2.0), (0.0, 3.0)).unwrap();
        assert_eq!(mesh.num_cells(Ownership::Used), 6);
        // 3 vertical edges per row × 3 rows + 2 horizontal edges per row × 4 rows.
        assert_eq!(mesh.num_faces(Ownership::Used), 17);
        assert_eq!(mesh.boundary_faces().count(), 10);
        for c in 0..6 {
            assert_abs_diff_eq!(mesh.cell_volume(c), 1.0, epsilon = 1e-14);
        }
        let x = mesh.cell_centroid(0);
        assert_abs_diff_eq!(x[0], 0.5, epsilon = 1e-14);
        assert_abs_diff_eq!(x[1], 0.5, epsilon = 1e-14);
    }

    #[test]
    fn outward_normals_close_every_cell() {
        let mesh =
            PolyMesh::perturbed_quad_grid(4, 4, (0.0, 1.0), (0.0, 1.0), 0.25, 7, &[0.5]).unwrap();
        for c in 0..mesh.num_cells(Ownership::Owned) {
            let mut sum = [0.0; 3];
            for (&f, &d) in mesh.cell_faces(c).iter().zip(mesh.cell_face_dirs(c)) {
                sum = add(&sum, &scale(&mesh.face_normal(f), d as f64));
            }
            assert_abs_diff_eq!(norm(&sum), 0.0, epsilon = 1e-13);
        }
        let total: f64 = (0..16).map(|c| mesh.cell_volume(c)).sum();
        assert_abs_diff_eq!(total, 1.0, epsilon = 1e-13);
    }

    #[test]
    fn fixed_lines_keep_their_height() {
        let mesh =
            PolyMesh::perturbed_quad_grid(3, 4, (0.0, 1.0), (-1.0, 0.0), 0.3, 11, &[-0.5]).unwrap();
        let on_line = (0..mesh.num_nodes())
            .filter(|&n| (mesh.node(n)[1] + 0.5).abs() < 1e-14)
            .count();
        assert_eq!(on_line, 4);
    }

    #[test]
    fn hex_grid_geometry() {
        let mesh = PolyMesh::hex_grid(2, 1, 1, (0.0, 2.0), (0.0, 1.0), (0.0, 0.5)).unwrap();
        assert_eq!(mesh.num_cells(Ownership::Used), 2);
        assert_eq!(mesh.num_faces(Ownership::Used), 11);
        assert_abs_diff_eq!(mesh.cell_volume(1), 0.5, epsilon = 1e-14);
        let x = mesh.cell_centroid(1);
        assert_abs_diff_eq!(x[0], 1.5, epsilon = 1e-14);
        assert_abs_diff_eq!(x[2], 0.25, epsilon = 1e-14);
        let f = mesh.cell_faces(0)[1];
        assert_eq!(mesh.face_cells(f), &[0, 1]);
        let n = mesh.face_normal(f);
        assert_abs_diff_eq!(n[0], 0.5, epsilon = 1e-14);
    }

    #[test]
    fn inverted_cell_is_rejected() {
        let nodes = vec![[0.0, 0.0, 0.0], [1.0, 0.0, 0.0], [0.0, 1.0, 0.0]];
        let faces = vec![vec![0, 1], vec![1, 2], vec![2, 0]];
        let err = PolyMesh::new(2, nodes, faces, vec![vec![0, 1, 2]], vec![vec![-1, -1, -1]])
            .unwrap_err();
        assert!(matches!(err, MfdError::MalformedCell { cell: 0, .. }));
    }
}
